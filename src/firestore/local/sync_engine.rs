use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::api::{Query, QuerySnapshot};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::memory::{
    MemoryLocalStore, QueryListenerRegistration, TargetMetadataSnapshot,
};
use crate::firestore::model::DocumentKey;
use crate::firestore::remote::syncer_bridge::RemoteSyncerBridge;
use crate::firestore::remote::{
    JsonProtoSerializer, ListenTarget, NetworkLayer, RemoteStore, RemoteSyncer,
};

/// Coordinates the local and remote stores, mirroring the responsibilities of the
/// Firestore JS SyncEngine.
pub struct SyncEngine {
    local_store: Arc<MemoryLocalStore>,
    remote_store: RemoteStore,
    remote_bridge: Arc<RemoteSyncerBridge<MemoryLocalStore>>,
}

impl SyncEngine {
    /// Creates a sync engine using the provided `MemoryLocalStore` (with optional
    /// persistence) and remote networking stack.
    pub fn new(
        local_store: Arc<MemoryLocalStore>,
        network_layer: NetworkLayer,
        serializer: JsonProtoSerializer,
    ) -> Self {
        let bridge = Arc::new(RemoteSyncerBridge::new(Arc::clone(&local_store)));
        local_store.synchronize_remote_keys(&bridge);

        let remote_store = RemoteStore::new(
            network_layer,
            serializer,
            Arc::clone(&bridge) as Arc<dyn RemoteSyncer>,
        );

        Self {
            local_store,
            remote_store,
            remote_bridge: bridge,
        }
    }

    /// Constructs a sync engine backed by IndexedDB persistence when running on
    /// wasm targets.
    #[cfg(all(
        feature = "wasm-web",
        feature = "experimental-indexed-db",
        target_arch = "wasm32"
    ))]
    pub fn with_indexed_db(
        db_name: impl Into<String>,
        network_layer: NetworkLayer,
        serializer: JsonProtoSerializer,
    ) -> Self {
        let local_store = MemoryLocalStore::new_with_indexed_db(db_name);
        Self::new(local_store, network_layer, serializer)
    }

    pub fn local_store(&self) -> &Arc<MemoryLocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn remote_bridge(&self) -> Arc<RemoteSyncerBridge<MemoryLocalStore>> {
        Arc::clone(&self.remote_bridge)
    }

    pub fn target_metadata(&self) -> BTreeMap<i32, TargetMetadataSnapshot> {
        self.local_store.target_metadata_map()
    }

    pub fn remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.remote_bridge.remote_keys_for_target(target_id)
    }

    pub async fn listen_query<F>(
        &self,
        target: ListenTarget,
        query: Query,
        callback: F,
    ) -> FirestoreResult<QueryListenerRegistration>
    where
        F: Fn(QuerySnapshot) + Send + Sync + 'static,
    {
        let target_id = target.target_id();
        let callback_arc: Arc<dyn Fn(QuerySnapshot) + Send + Sync> = Arc::new(callback);
        let mut registration = self
            .local_store
            .register_query_listener(target_id, query, callback_arc)
            .await?;

        if let Err(err) = self.remote_store.listen(target).await {
            registration.detach();
            return Err(err);
        }

        Ok(registration)
    }

    pub async fn listen(&self, target: ListenTarget) -> FirestoreResult<()> {
        self.remote_store.listen(target).await
    }

    pub async fn unlisten(&self, target_id: i32) -> FirestoreResult<()> {
        self.remote_store.unlisten(target_id).await
    }

    pub async fn unlisten_query(
        &self,
        target_id: i32,
        registration: &mut QueryListenerRegistration,
    ) -> FirestoreResult<()> {
        registration.detach();
        self.remote_store.unlisten(target_id).await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.remote_store.enable_network().await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.remote_store.disable_network().await
    }

    pub async fn pump_writes(&self) -> FirestoreResult<()> {
        self.remote_store.pump_writes().await
    }
}
