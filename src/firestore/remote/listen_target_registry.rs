use std::collections::BTreeMap;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::remote::streams::ListenTarget;

/// Why a target is currently registered for watching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
    /// An application-level query listener.
    Listen,
    /// Re-listening after an existence filter mismatch invalidated the
    /// locally accumulated document set for the target; never persisted.
    ExistenceFilterMismatch,
    /// Resolving a limbo document.
    LimboResolution,
}

/// Everything the remote store remembers about an active target between
/// watch stream reconnects: the wire-level target itself, why it's being
/// watched, and the order it was registered in.
#[derive(Clone, Debug)]
pub struct QueryData {
    target: ListenTarget,
    purpose: Purpose,
    sequence_number: u64,
}

impl QueryData {
    pub fn new(target: ListenTarget, purpose: Purpose, sequence_number: u64) -> Self {
        Self {
            target,
            purpose,
            sequence_number,
        }
    }

    pub fn target_id(&self) -> i32 {
        self.target.target_id()
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn target(&self) -> &ListenTarget {
        &self.target
    }

    /// Returns a copy of this entry with the resume token updated, keeping
    /// its purpose and sequence number intact. A no-op (returns a clone of
    /// `self`) when `resume_token` is empty, matching the watch stream's
    /// convention that an empty token carries no information.
    pub fn with_resume_token(&self, resume_token: Vec<u8>) -> Self {
        if resume_token.is_empty() {
            return self.clone();
        }
        Self {
            target: self.target.clone().set_resume_token(resume_token),
            purpose: self.purpose,
            sequence_number: self.sequence_number,
        }
    }
}

/// Tracks the set of targets the remote store is (or should be) listening
/// to, independent of whether the watch stream is currently connected.
#[derive(Default)]
pub struct ListenTargetRegistry {
    targets: BTreeMap<i32, QueryData>,
    next_sequence_number: u64,
}

impl ListenTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_sequence_number(&mut self) -> u64 {
        self.next_sequence_number += 1;
        self.next_sequence_number
    }

    /// Registers a new target. Fails if the target is already registered;
    /// callers must `unlisten` it first.
    pub fn listen(&mut self, query_data: QueryData) -> FirestoreResult<()> {
        let target_id = query_data.target_id();
        if self.targets.contains_key(&target_id) {
            return Err(internal_error(format!(
                "target {target_id} is already registered for listening"
            )));
        }
        self.targets.insert(target_id, query_data);
        Ok(())
    }

    /// Removes a target. Fails if it wasn't registered.
    pub fn unlisten(&mut self, target_id: i32) -> FirestoreResult<QueryData> {
        self.targets
            .remove(&target_id)
            .ok_or_else(|| internal_error(format!("target {target_id} is not registered")))
    }

    pub fn contains(&self, target_id: i32) -> bool {
        self.targets.contains_key(&target_id)
    }

    pub fn get(&self, target_id: i32) -> Option<&QueryData> {
        self.targets.get(&target_id)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &QueryData> {
        self.targets.values()
    }

    /// Folds a resume token observed from the backend back into the
    /// registered target, preserving its purpose and sequence number. A
    /// no-op if the target isn't registered.
    pub fn update_from_remote_event(&mut self, target_id: i32, resume_token: Option<Vec<u8>>) {
        let Some(token) = resume_token.filter(|token| !token.is_empty()) else {
            return;
        };
        if let Some(existing) = self.targets.get(&target_id) {
            let updated = existing.with_resume_token(token);
            self.targets.insert(target_id, updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::api::query::QueryDefinition;
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::LimitType;

    fn sample_query() -> QueryDefinition {
        QueryDefinition {
            collection_path: ResourcePath::from_string("cities").unwrap(),
            parent_path: ResourcePath::root(),
            collection_id: "cities".to_string(),
            collection_group: None,
            filters: Vec::new(),
            request_order_by: Vec::new(),
            result_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            request_start_at: None,
            request_end_at: None,
            result_start_at: None,
            result_end_at: None,
            projection: None,
        }
    }

    fn sample_target(target_id: i32) -> ListenTarget {
        let serializer = JsonProtoSerializer::new(DatabaseId::new("test", "(default)"));
        ListenTarget::for_query(&serializer, target_id, &sample_query()).unwrap()
    }

    #[test]
    fn rejects_duplicate_listen() {
        let mut registry = ListenTargetRegistry::new();
        registry
            .listen(QueryData::new(sample_target(1), Purpose::Listen, 1))
            .unwrap();
        assert!(registry
            .listen(QueryData::new(sample_target(1), Purpose::Listen, 2))
            .is_err());
    }

    #[test]
    fn unlisten_returns_entry_and_rejects_unknown_target() {
        let mut registry = ListenTargetRegistry::new();
        registry
            .listen(QueryData::new(sample_target(7), Purpose::Listen, 1))
            .unwrap();
        let removed = registry.unlisten(7).unwrap();
        assert_eq!(removed.target_id(), 7);
        assert!(registry.unlisten(7).is_err());
    }

    #[test]
    fn resume_token_update_preserves_purpose() {
        let mut registry = ListenTargetRegistry::new();
        registry
            .listen(QueryData::new(
                sample_target(3),
                Purpose::ExistenceFilterMismatch,
                1,
            ))
            .unwrap();
        registry.update_from_remote_event(3, Some(vec![9, 9]));
        let entry = registry.get(3).unwrap();
        assert_eq!(entry.purpose(), Purpose::ExistenceFilterMismatch);
        assert_eq!(entry.target().resume_token(), Some(&[9, 9][..]));
    }
}
