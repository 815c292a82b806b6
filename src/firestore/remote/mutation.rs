use std::collections::BTreeSet;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{DocumentKey, Timestamp};
use crate::firestore::remote::datastore::WriteOperation;
use crate::firestore::remote::streams::WriteResult;

/// Batch of mutations queued for the streaming write pipeline.
///
/// Batches are assigned a strictly increasing `batch_id` by the local store
/// when they are queued, and travel through the write pipeline as a unit:
/// either every write in the batch is acknowledged together, or the whole
/// batch is rejected together.
#[derive(Clone, Debug)]
pub struct MutationBatch {
    /// Monotonic identifier assigned locally when the batch is queued.
    pub batch_id: i32,
    /// Wall-clock time the batch was queued, echoed back to local storage.
    pub local_write_time: Timestamp,
    /// Ordered write operations that should be sent to Firestore.
    pub writes: Vec<WriteOperation>,
}

impl MutationBatch {
    /// Builds a batch from its queued writes and local write time.
    pub fn from_writes(batch_id: i32, local_write_time: Timestamp, writes: Vec<WriteOperation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            writes,
        }
    }

    /// Returns the batch identifier.
    pub fn batch_id(&self) -> i32 {
        self.batch_id
    }

    /// Returns the queued writes.
    pub fn writes(&self) -> &[WriteOperation] {
        &self.writes
    }

    /// Returns `true` when the batch contains no writes.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Returns the set of document keys touched by this batch.
    pub fn document_keys(&self) -> BTreeSet<DocumentKey> {
        self.writes.iter().map(|write| write.key().clone()).collect()
    }
}

/// Successful acknowledgement of a single mutation batch.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    /// The batch this result acknowledges.
    pub batch: MutationBatch,
    /// Commit timestamp returned by the backend.
    pub commit_version: Option<Timestamp>,
    /// Individual write results produced by the RPC, one per queued write.
    pub write_results: Vec<WriteResult>,
}

impl MutationBatchResult {
    /// Builds a result payload from the streamed write response, checking
    /// that the backend returned exactly one result per queued write.
    pub fn from(
        batch: MutationBatch,
        commit_version: Option<Timestamp>,
        write_results: Vec<WriteResult>,
    ) -> FirestoreResult<Self> {
        if write_results.len() != batch.writes.len() {
            return Err(internal_error(format!(
                "write response carried {} result(s) for a batch of {} write(s)",
                write_results.len(),
                batch.writes.len()
            )));
        }
        Ok(Self {
            batch,
            commit_version,
            write_results,
        })
    }

    /// Returns the identifier of the acknowledged batch.
    pub fn batch_id(&self) -> i32 {
        self.batch.batch_id
    }
}
