use std::collections::VecDeque;

use crate::firestore::remote::mutation::MutationBatch;

/// Maximum number of mutation batches the remote store keeps in flight to
/// the write stream at once. Once full, newly queued batches wait locally
/// until an earlier one is acknowledged or rejected.
pub const MAX_PENDING_WRITES: usize = 10;

/// Bounded FIFO of mutation batches in flight to the write stream.
///
/// Batches leave the pipeline strictly from the front, in the order they
/// were sent, matching the write stream's in-order acknowledgement
/// guarantee.
#[derive(Default)]
pub struct WritePipeline {
    batches: VecDeque<MutationBatch>,
}

impl WritePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Whether another batch can be added without exceeding the pipeline's
    /// capacity.
    pub fn can_add(&self) -> bool {
        self.batches.len() < MAX_PENDING_WRITES
    }

    pub fn enqueue(&mut self, batch: MutationBatch) {
        debug_assert!(self.can_add(), "write pipeline exceeded its capacity");
        self.batches.push_back(batch);
    }

    pub fn peek_first(&self) -> Option<&MutationBatch> {
        self.batches.front()
    }

    pub fn pop_first(&mut self) -> Option<MutationBatch> {
        self.batches.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutationBatch> {
        self.batches.iter()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }

    pub fn last_batch_id(&self) -> Option<i32> {
        self.batches.back().map(|batch| batch.batch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn batch(id: i32) -> MutationBatch {
        MutationBatch::from_writes(id, Timestamp::now(), Vec::new())
    }

    #[test]
    fn fifo_order_and_capacity() {
        let mut pipeline = WritePipeline::new();
        for id in 0..MAX_PENDING_WRITES as i32 {
            assert!(pipeline.can_add());
            pipeline.enqueue(batch(id));
        }
        assert!(!pipeline.can_add());
        assert_eq!(pipeline.peek_first().unwrap().batch_id, 0);

        let popped = pipeline.pop_first().unwrap();
        assert_eq!(popped.batch_id, 0);
        assert!(pipeline.can_add());
    }
}
