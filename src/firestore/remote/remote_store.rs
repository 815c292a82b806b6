use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::Timestamp;
use crate::firestore::remote::listen_target_registry::{ListenTargetRegistry, Purpose, QueryData};
use crate::firestore::remote::mutation::{MutationBatch, MutationBatchResult};
use crate::firestore::remote::online_state::OnlineStateTracker;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::rpc_error::{is_permanent_error, is_permanent_write_error};
use crate::firestore::remote::streams::{
    ListenStream, ListenStreamDelegate, ListenTarget, WriteResponse, WriteStream,
    WriteStreamDelegate,
};
use crate::firestore::remote::watch_change::{
    DocumentDelete, DocumentRemove, WatchChange, WatchTargetChange,
};
use crate::firestore::remote::write_pipeline::WritePipeline;
use crate::firestore::remote::{
    JsonProtoSerializer, NetworkLayer, OnlineState, TargetMetadataProvider, WatchChangeAggregator,
};

#[cfg(test)]
use crate::firestore::remote::remote_event::RemoteEvent;

/// Enumerates reasons why the remote store temporarily disables network usage.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    ConnectivityChange,
    Shutdown,
}

struct SyncerMetadataProvider {
    syncer: Arc<dyn RemoteSyncer>,
}

impl SyncerMetadataProvider {
    fn new(syncer: Arc<dyn RemoteSyncer>) -> Self {
        Self { syncer }
    }
}

impl TargetMetadataProvider for SyncerMetadataProvider {
    fn get_remote_keys(&self, target_id: i32) -> BTreeSet<crate::firestore::model::DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }
}

struct RemoteStoreState {
    listen_targets: ListenTargetRegistry,
    watch_stream: Option<Arc<ListenStream<RemoteListenDelegate>>>,
    write_stream: Option<Arc<WriteStream<RemoteWriteDelegate>>>,
    watch_aggregator: Option<WatchChangeAggregator<SyncerMetadataProvider>>,
    write_handshake_complete: bool,
    write_pipeline: WritePipeline,
    last_batch_id: Option<i32>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl Default for RemoteStoreState {
    fn default() -> Self {
        Self {
            listen_targets: ListenTargetRegistry::new(),
            watch_stream: None,
            write_stream: None,
            watch_aggregator: None,
            write_handshake_complete: false,
            write_pipeline: WritePipeline::new(),
            last_batch_id: None,
            offline_causes: BTreeSet::new(),
        }
    }
}

/// Coordinates the watch and write streams, mediating between whatever is
/// queued locally (pending mutations, active query listeners) and the two
/// long-lived duplex streams that carry them to and from the backend.
///
/// Connection lifecycle, target bookkeeping and write ordering live here;
/// deciding what to do with the results (applying a snapshot, persisting an
/// acknowledgement) is left to the [`RemoteSyncer`] this store is built
/// with.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    /// Builds a new remote store using the provided network layer and
    /// serializer.
    pub fn new(
        network_layer: NetworkLayer,
        serializer: JsonProtoSerializer,
        remote_syncer: Arc<dyn RemoteSyncer>,
    ) -> Self {
        let inner = Arc::new(RemoteStoreInner::new(
            network_layer,
            serializer,
            remote_syncer,
        ));
        Self { inner }
    }

    /// Enables network usage and restarts the streams if necessary.
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.enable_network().await
    }

    /// Temporarily disables all remote streams.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.disable_network(OfflineCause::UserDisabled).await
    }

    /// Shuts the remote store down permanently.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.inner.shutdown().await
    }

    /// Registers a new listen target. If the listen stream is active, the
    /// target is sent immediately; otherwise it will be sent after the next
    /// reconnect.
    pub async fn listen(&self, target: ListenTarget) -> FirestoreResult<()> {
        self.inner.listen(target).await
    }

    /// Removes an existing listen target from the active set.
    pub async fn unlisten(&self, target_id: i32) -> FirestoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Asks the remote store to poll the mutation queue and push pending
    /// batches to the write stream.
    pub async fn pump_writes(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Notifies the remote store that authentication credentials changed,
    /// forcing a stream restart.
    pub async fn handle_credential_change(&self) -> FirestoreResult<()> {
        self.inner.handle_credential_change().await
    }

    /// Returns the connectivity state currently reported to query listeners.
    pub async fn online_state(&self) -> OnlineState {
        self.inner.online_state.current().await
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    network_layer: NetworkLayer,
    serializer: JsonProtoSerializer,
    remote_syncer: Arc<dyn RemoteSyncer>,
    online_state: Arc<OnlineStateTracker>,
}

impl RemoteStoreInner {
    fn new(
        network_layer: NetworkLayer,
        serializer: JsonProtoSerializer,
        remote_syncer: Arc<dyn RemoteSyncer>,
    ) -> Self {
        let online_state = OnlineStateTracker::new(Arc::clone(&remote_syncer));
        Self {
            state: Mutex::new(RemoteStoreState::default()),
            network_layer,
            serializer,
            remote_syncer,
            online_state,
        }
    }

    async fn enable_network(self: &Arc<Self>) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.offline_causes.clear();
        }
        self.ensure_streams().await
    }

    async fn disable_network(self: &Arc<Self>, cause: OfflineCause) -> FirestoreResult<()> {
        let streams = {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(cause);
            state.write_pipeline.clear();
            state.last_batch_id = None;
            Self::take_streams_locked(&mut state)
        };
        self.stop_streams(streams);
        self.online_state.set_offline().await;
        Ok(())
    }

    async fn shutdown(self: &Arc<Self>) -> FirestoreResult<()> {
        let streams = {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::Shutdown);
            state.write_pipeline.clear();
            state.last_batch_id = None;
            Self::take_streams_locked(&mut state)
        };
        self.stop_streams(streams);
        self.online_state.set_unknown().await;
        self.network_layer.shutdown();
        Ok(())
    }

    async fn listen(self: &Arc<Self>, target: ListenTarget) -> FirestoreResult<()> {
        let target_id = target.target_id();
        let (stream, should_start) = {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains(target_id) {
                return Ok(());
            }
            let sequence_number = state.listen_targets.next_sequence_number();
            state
                .listen_targets
                .listen(QueryData::new(target.clone(), Purpose::Listen, sequence_number))?;
            let stream = state.watch_stream.clone();
            let should_start = stream.is_none() && Self::can_use_network_locked(&state);
            (stream, should_start)
        };

        if let Some(stream) = stream {
            stream.watch(target).await
        } else if should_start {
            self.start_watch_stream().await?;
            Ok(())
        } else {
            Ok(())
        }
    }

    async fn unlisten(self: &Arc<Self>, target_id: i32) -> FirestoreResult<()> {
        let stream = {
            let mut state = self.state.lock().await;
            state.listen_targets.unlisten(target_id).ok();
            if let Some(aggregator) = state.watch_aggregator.as_mut() {
                aggregator.remove_target(target_id);
            }
            state.watch_stream.clone()
        };
        if let Some(stream) = stream {
            stream.unwatch(target_id).await?
        }
        Ok(())
    }

    async fn handle_credential_change(self: &Arc<Self>) -> FirestoreResult<()> {
        self.remote_syncer.handle_credential_change().await?;
        let streams = {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::CredentialChange);
            state.write_pipeline.clear();
            state.last_batch_id = None;
            Self::take_streams_locked(&mut state)
        };
        self.stop_streams(streams);
        self.online_state.set_unknown().await;
        self.enable_network().await
    }

    async fn ensure_streams(self: &Arc<Self>) -> FirestoreResult<()> {
        if !self.start_watch_stream().await? {
            let already_started = {
                let state = self.state.lock().await;
                state.watch_stream.is_some()
            };
            if !already_started {
                // Network is enabled but there's nothing to watch yet; report
                // `Unknown` rather than leaving the last stale verdict in place.
                self.online_state.set_unknown().await;
            }
        }
        self.start_write_stream().await?;
        self.fill_write_pipeline().await
    }

    /// Starts the watch stream if `ShouldStartWatch` holds. Returns whether a
    /// new stream was actually opened.
    async fn start_watch_stream(self: &Arc<Self>) -> FirestoreResult<bool> {
        let (stream, targets) = {
            let mut state = self.state.lock().await;
            if !Self::can_use_network_locked(&state) {
                return Ok(false);
            }
            if state.watch_stream.is_some() || state.listen_targets.is_empty() {
                return Ok(false);
            }
            let provider = Arc::new(SyncerMetadataProvider::new(Arc::clone(&self.remote_syncer)));
            state.watch_aggregator = Some(WatchChangeAggregator::new(provider));
            let delegate = Arc::new(RemoteListenDelegate::new(Arc::downgrade(self)));
            let stream = Arc::new(ListenStream::new(
                self.network_layer.clone(),
                self.serializer.clone(),
                delegate,
            ));
            let targets = state
                .listen_targets
                .values()
                .map(|query_data| query_data.target().clone())
                .collect::<Vec<_>>();
            state.watch_stream = Some(stream.clone());
            (stream, targets)
        };

        self.online_state.handle_watch_stream_start().await;
        for target in targets {
            stream.watch(target).await?;
        }
        Ok(true)
    }

    async fn start_write_stream(self: &Arc<Self>) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if !Self::can_use_network_locked(&state)
                || state.write_stream.is_some()
                || state.write_pipeline.is_empty()
            {
                return Ok(());
            }
            state.write_handshake_complete = false;
            let delegate = Arc::new(RemoteWriteDelegate::new(Arc::downgrade(self)));
            let stream = Arc::new(WriteStream::new(
                self.network_layer.clone(),
                self.serializer.clone(),
                delegate,
            ));
            state.write_stream = Some(stream);
        }
        Ok(())
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> FirestoreResult<()> {
        loop {
            let (should_fetch, last_batch_id) = {
                let state = self.state.lock().await;
                (
                    Self::can_use_network_locked(&state) && state.write_pipeline.can_add(),
                    state.last_batch_id,
                )
            };

            if !should_fetch {
                break;
            }

            let maybe_batch = self
                .remote_syncer
                .next_mutation_batch(last_batch_id)
                .await?;
            let batch = match maybe_batch {
                Some(batch) if !batch.is_empty() => batch,
                _ => break,
            };

            let writes = batch.writes.clone();
            let (stream, handshake_complete) = {
                let mut state = self.state.lock().await;
                state.last_batch_id = Some(batch.batch_id);
                state.write_pipeline.enqueue(batch);
                (state.write_stream.clone(), state.write_handshake_complete)
            };

            if let Some(stream) = stream {
                if handshake_complete {
                    stream.write(writes).await?;
                }
            } else {
                self.start_write_stream().await?;
            }
        }

        let (stream, pipeline_empty) = {
            let state = self.state.lock().await;
            (state.write_stream.clone(), state.write_pipeline.is_empty())
        };
        if pipeline_empty {
            if let Some(stream) = stream {
                stream.mark_idle();
            }
        }
        Ok(())
    }

    async fn on_watch_change(self: &Arc<Self>, change: WatchChange) -> FirestoreResult<()> {
        // Any decodable message on the watch stream, success or per-target
        // failure, proves the connection itself is healthy.
        self.online_state.set_online().await;

        if let WatchChange::TargetChange(target_change) = &change {
            if let Some(error) = target_change.cause.clone() {
                return self.handle_target_error(target_change.clone(), error).await;
            }
        }

        let event = {
            let mut state = self.state.lock().await;
            let aggregator = match state.watch_aggregator.as_mut() {
                Some(aggregator) => aggregator,
                None => return Ok(()),
            };

            if let Some(version) = snapshot_version_for_change(&change) {
                aggregator.set_snapshot_version(Some(version));
            }

            aggregator.handle_watch_change(change)?;
            let event = aggregator.drain();

            for (target_id, target_change) in &event.target_changes {
                if let Some(resume_token) = target_change.resume_token.clone() {
                    state
                        .listen_targets
                        .update_from_remote_event(*target_id, Some(resume_token));
                }
            }

            event
        };

        if !event.is_empty() {
            let target_mismatches: Vec<i32> = event.target_mismatches.iter().copied().collect();
            if !target_mismatches.is_empty() {
                self.handle_target_mismatches(&target_mismatches).await?;
            }
            self.remote_syncer.apply_remote_event(event).await?;
        }
        Ok(())
    }

    async fn on_watch_error(self: &Arc<Self>, error: FirestoreError) {
        {
            let mut state = self.state.lock().await;
            let streams = Self::take_watch_stream_locked(&mut state);
            drop(streams);
        }
        self.online_state.handle_watch_stream_failure(&error).await;
        if let Err(err) = self.start_watch_stream().await {
            log::warn!("failed to restart watch stream after error: {err}");
        }
        log::warn!("watch stream error: {error}");
    }

    async fn on_write_handshake_complete(self: &Arc<Self>) -> FirestoreResult<()> {
        let batches = {
            let mut state = self.state.lock().await;
            state.write_handshake_complete = true;
            state
                .write_pipeline
                .iter()
                .map(|b| b.writes.clone())
                .collect::<Vec<_>>()
        };

        let stream = {
            let state = self.state.lock().await;
            state.write_stream.clone()
        };

        if let Some(stream) = stream {
            for writes in batches {
                stream.write(writes).await?;
            }
        }
        Ok(())
    }

    async fn on_write_response(self: &Arc<Self>, response: WriteResponse) -> FirestoreResult<()> {
        let batch = {
            let mut state = self.state.lock().await;
            state
                .write_pipeline
                .pop_first()
                .ok_or_else(|| internal_error("write pipeline empty"))?
        };

        self.remote_syncer
            .record_write_results(batch.batch_id, &response.write_results);
        self.remote_syncer
            .notify_stream_token_change(Some(response.stream_token.clone()));

        let result =
            MutationBatchResult::from(batch, response.commit_time, response.write_results)?;
        self.remote_syncer.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    /// Handles a write stream failure, classifying it per §4.6/§7: a
    /// permanent error at handshake time drops the cached stream token (it
    /// may be what's rejected), while a permanent error on an in-flight
    /// batch pops and rejects that batch so the pipeline doesn't keep
    /// resending a write the backend will never accept. Transient errors
    /// leave the pipeline untouched; the same batches are resent once the
    /// handshake completes again.
    async fn on_write_error(self: &Arc<Self>, error: FirestoreError) {
        let permanent = is_permanent_write_error(&error);
        let (stream, was_handshake_complete, rejected_batch) = {
            let mut state = self.state.lock().await;
            let was_handshake_complete = state.write_handshake_complete;
            state.write_handshake_complete = false;
            let stream = state.write_stream.take();
            let rejected_batch = if permanent && was_handshake_complete {
                state.write_pipeline.pop_first()
            } else {
                None
            };
            (stream, was_handshake_complete, rejected_batch)
        };

        if let Some(stream) = stream {
            if permanent {
                stream.inhibit_backoff();
            }
            stream.stop();
        }

        if permanent && !was_handshake_complete {
            self.remote_syncer.notify_stream_token_change(None);
        }

        if let Some(batch) = rejected_batch {
            if let Err(err) = self
                .remote_syncer
                .reject_failed_write(batch.batch_id, error.clone())
                .await
            {
                log::warn!("failed to reject write batch after permanent error: {err}");
            }
        }

        if let Err(err) = self.start_write_stream().await {
            log::warn!("failed to restart write stream after error: {err}");
        }
        if permanent {
            if let Err(err) = self.fill_write_pipeline().await {
                log::warn!("failed to refill write pipeline after error: {err}");
            }
        }
        log::warn!("write stream error: {error}");
    }

    /// Handles a `TargetChange` that carries a backend-reported cause: the
    /// affected targets are rejected outright. A permanent cause means the
    /// target can never be listened to again as-is, so it's dropped from
    /// the registry; a transient one leaves it registered so the next watch
    /// stream reconnect resends it.
    async fn handle_target_error(
        self: &Arc<Self>,
        change: WatchTargetChange,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let permanent = is_permanent_error(&error);
        for target_id in &change.target_ids {
            self.remote_syncer
                .reject_listen(*target_id, error.clone())
                .await?;
        }
        {
            let mut state = self.state.lock().await;
            for target_id in &change.target_ids {
                if permanent {
                    state.listen_targets.unlisten(*target_id).ok();
                }
                if let Some(aggregator) = state.watch_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
            }
        }
        self.online_state.handle_watch_stream_failure(&error).await;
        Ok(())
    }

    fn take_streams_locked(
        state: &mut RemoteStoreState,
    ) -> (
        Option<Arc<ListenStream<RemoteListenDelegate>>>,
        Option<Arc<WriteStream<RemoteWriteDelegate>>>,
    ) {
        let watch = Self::take_watch_stream_locked(state);
        let write = state.write_stream.take();
        state.write_handshake_complete = false;
        (watch, write)
    }

    fn take_watch_stream_locked(
        state: &mut RemoteStoreState,
    ) -> Option<Arc<ListenStream<RemoteListenDelegate>>> {
        state.watch_aggregator = None;
        state.watch_stream.take()
    }

    fn stop_streams(
        &self,
        streams: (
            Option<Arc<ListenStream<RemoteListenDelegate>>>,
            Option<Arc<WriteStream<RemoteWriteDelegate>>>,
        ),
    ) {
        if let Some(stream) = streams.0 {
            stream.stop();
        }
        if let Some(stream) = streams.1 {
            stream.stop();
        }
    }

    fn can_use_network_locked(state: &RemoteStoreState) -> bool {
        state.offline_causes.is_empty()
    }

    /// Recovers from an existence filter mismatch per §4.5: the locally
    /// accumulated document set for the target can no longer be trusted, so
    /// it's unwatched and immediately re-listened from scratch (resume
    /// token cleared). The re-watch is logically a transient
    /// `Purpose::ExistenceFilterMismatch` request, but that purpose is never
    /// written back to the registry — the entry that survives recovery
    /// keeps `Purpose::Listen`, with its sequence number preserved.
    async fn handle_target_mismatches(self: &Arc<Self>, target_ids: &[i32]) -> FirestoreResult<()> {
        let (relisten, stream) = {
            let mut state = self.state.lock().await;
            let stream = state.watch_stream.clone();
            let mut relisten = Vec::new();
            for target_id in target_ids {
                let Ok(existing) = state.listen_targets.unlisten(*target_id) else {
                    continue;
                };
                let sequence_number = existing.sequence_number();
                let cleared_target = existing.target().clone().clear_resume_token();
                let cleared = QueryData::new(cleared_target.clone(), Purpose::Listen, sequence_number);
                if let Err(err) = state.listen_targets.listen(cleared) {
                    log::warn!("failed to re-register target {target_id} after existence filter mismatch: {err}");
                    continue;
                }
                if let Some(aggregator) = state.watch_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                    aggregator.record_pending_target_request(*target_id);
                }
                relisten.push((*target_id, cleared_target));
            }
            (relisten, stream)
        };

        if relisten.is_empty() {
            return Ok(());
        }

        if let Some(stream) = stream {
            for (target_id, target) in relisten {
                stream.unwatch(target_id).await?;
                stream.watch(target).await?;
            }
            Ok(())
        } else {
            self.start_watch_stream().await?;
            Ok(())
        }
    }
}

struct RemoteListenDelegate {
    inner: Weak<RemoteStoreInner>,
}

impl RemoteListenDelegate {
    fn new(inner: Weak<RemoteStoreInner>) -> Self {
        Self { inner }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl ListenStreamDelegate for RemoteListenDelegate {
    async fn on_watch_change(&self, change: WatchChange) -> FirestoreResult<()> {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_change(change).await
        } else {
            Ok(())
        }
    }

    async fn on_stream_error(&self, error: FirestoreError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_error(error).await;
        }
    }
}

struct RemoteWriteDelegate {
    inner: Weak<RemoteStoreInner>,
}

impl RemoteWriteDelegate {
    fn new(inner: Weak<RemoteStoreInner>) -> Self {
        Self { inner }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamDelegate for RemoteWriteDelegate {
    async fn on_handshake_complete(&self) -> FirestoreResult<()> {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_handshake_complete().await
        } else {
            Ok(())
        }
    }

    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()> {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_response(response).await
        } else {
            Ok(())
        }
    }

    async fn on_stream_error(&self, error: FirestoreError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_error(error).await;
        }
    }
}

fn snapshot_version_for_change(change: &WatchChange) -> Option<Timestamp> {
    match change {
        WatchChange::TargetChange(change) => change.read_time.clone(),
        WatchChange::DocumentDelete(DocumentDelete { read_time, .. }) => read_time.clone(),
        WatchChange::DocumentRemove(DocumentRemove { read_time, .. }) => read_time.clone(),
        _ => None,
    }
}
