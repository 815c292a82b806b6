use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::Timestamp;
use crate::firestore::remote::mutation::MutationBatch;

/// The subset of local persistence the remote store depends on.
///
/// The remote store itself never touches disk or the document cache; it
/// only needs to drain the mutation queue into the write pipeline and
/// remember the write stream token across restarts. Everything else
/// (applying remote events, resolving limbo documents, persisting query
/// results) is the local store's business and happens through
/// [`crate::firestore::remote::RemoteSyncer`] instead.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait LocalStore: Send + Sync {
    /// Returns the oldest queued batch with `batch_id` greater than
    /// `after_batch_id` (or the oldest batch at all when `None`).
    async fn next_mutation_batch_after(
        &self,
        after_batch_id: Option<i32>,
    ) -> FirestoreResult<Option<MutationBatch>>;

    /// Returns the write stream token persisted from the last successful
    /// handshake or write response, if any.
    async fn last_stream_token(&self) -> FirestoreResult<Option<Vec<u8>>>;

    /// Persists the write stream token returned by the most recent
    /// handshake or write response, so a future process restart can resume
    /// the stream without replaying already-acknowledged writes.
    async fn set_last_stream_token(&self, token: Option<Vec<u8>>) -> FirestoreResult<()>;

    /// Returns the snapshot version of the last remote event applied to the
    /// local cache, used to prime a freshly (re)started watch stream's
    /// resume point.
    async fn last_remote_snapshot_version(&self) -> FirestoreResult<Option<Timestamp>>;
}
