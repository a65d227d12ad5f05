use std::sync::Arc;

use tracing::warn;

use crate::revision::{PulledRevision, RemoteSequenceId};
use crate::sequence_map::SequenceMap;
use crate::store::Store;

/// The three fetch-dispatch queues a routed revision can land in.
#[derive(Default)]
pub struct RevisionQueues {
    /// Generation 1, live, unconflicted - eligible for bulk fetch.
    pub bulk_revs: Vec<PulledRevision>,
    /// Everything else live.
    pub revs: Vec<PulledRevision>,
    /// Tombstones.
    pub deleted_revs: Vec<PulledRevision>,
}

impl RevisionQueues {
    pub fn is_empty(&self) -> bool {
        self.bulk_revs.is_empty() && self.revs.is_empty() && self.deleted_revs.is_empty()
    }

    pub fn clear(&mut self) {
        self.bulk_revs.clear();
        self.revs.clear();
        self.deleted_revs.clear();
    }
}

/// Outcome of routing one inbox batch, used by the replicator worker to
/// adjust its lifecycle counters and checkpoint state.
pub struct RouteOutcome {
    /// Number of revs removed by `findMissingRevisions` (already known
    /// locally), subtracted from `changesTotal` by the caller.
    pub already_known: usize,
    /// Set when the whole inbox turned out to need no work; the caller
    /// should update `lastSequence` immediately.
    pub advanced_checkpoint_only: bool,
}

/// Splits an inbox batch across the three fetch-dispatch queues.
pub async fn process_inbox(
    store: &Arc<dyn Store>,
    sequence_map: &mut SequenceMap,
    queues: &mut RevisionQueues,
    mut inbox: Vec<PulledRevision>,
) -> Option<RouteOutcome> {
    let original_len = inbox.len();
    let last_remote_seq: Option<RemoteSequenceId> =
        inbox.last().map(|r| r.remote_sequence_id.clone());

    if let Err(err) = store.find_missing_revisions(&mut inbox).await {
        // Store failure: discard the batch and continue. Sequence
        // assignment happens after this call, so nothing here was ever
        // added to the map, there is nothing to unwind.
        warn!(error = %err, "find_missing_revisions failed, discarding batch");
        return None;
    }

    let already_known = original_len - inbox.len();

    if inbox.is_empty() {
        // Cheap equivalent of "processed everything": pin+release the last
        // entry's remote sequence so the checkpoint still advances.
        if let Some(remote_seq) = last_remote_seq {
            let seq = sequence_map.add_value(remote_seq);
            sequence_map.remove_sequence(seq);
        }
        return Some(RouteOutcome { already_known, advanced_checkpoint_only: true });
    }

    for mut rev in inbox {
        let bulk_eligible = rev.is_bulk_eligible();
        rev.sequence = Some(sequence_map.add_value(rev.remote_sequence_id.clone()));
        if bulk_eligible {
            queues.bulk_revs.push(rev);
        } else if rev.deleted {
            queues.deleted_revs.push(rev);
        } else {
            queues.revs.push(rev);
        }
    }

    Some(RouteOutcome { already_known, advanced_checkpoint_only: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::error::PullError;
    use crate::store::Transaction;

    struct PassThroughStore;

    #[async_trait]
    impl Store for PassThroughStore {
        fn is_valid_document_id(&self, _id: &str) -> bool {
            true
        }
        async fn find_missing_revisions(&self, _revs: &mut Vec<PulledRevision>) -> Result<(), PullError> {
            Ok(())
        }
        async fn get_possible_ancestor_revision_ids(
            &self,
            _rev: &PulledRevision,
            _limit: usize,
        ) -> Result<(Vec<String>, bool), PullError> {
            Ok((Vec::new(), false))
        }
        async fn parse_revision_history(&self, _properties: &serde_json::Value) -> Option<Vec<String>> {
            None
        }
        async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, PullError> {
            unimplemented!()
        }
    }

    struct KnowsEverythingStore;

    #[async_trait]
    impl Store for KnowsEverythingStore {
        fn is_valid_document_id(&self, _id: &str) -> bool {
            true
        }
        async fn find_missing_revisions(&self, revs: &mut Vec<PulledRevision>) -> Result<(), PullError> {
            revs.clear();
            Ok(())
        }
        async fn get_possible_ancestor_revision_ids(
            &self,
            _rev: &PulledRevision,
            _limit: usize,
        ) -> Result<(Vec<String>, bool), PullError> {
            Ok((Vec::new(), false))
        }
        async fn parse_revision_history(&self, _properties: &serde_json::Value) -> Option<Vec<String>> {
            None
        }
        async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, PullError> {
            unimplemented!()
        }
    }

    fn rev(doc: &str, rev_id: &str, deleted: bool, conflicted: bool, seq: i64) -> PulledRevision {
        PulledRevision::new(doc, rev_id, deleted, conflicted, crate::revision::RemoteSequenceId::Int(seq)).unwrap()
    }

    #[tokio::test]
    async fn routes_by_generation_and_deletion() {
        let store: Arc<dyn Store> = Arc::new(PassThroughStore);
        let mut sequence_map = SequenceMap::new();
        let mut queues = RevisionQueues::default();
        let inbox = vec![
            rev("doc1", "1-a", false, false, 1),
            rev("doc2", "2-a", false, false, 2),
            rev("doc3", "1-a", true, false, 3),
        ];

        let outcome = process_inbox(&store, &mut sequence_map, &mut queues, inbox).await.unwrap();
        assert_eq!(outcome.already_known, 0);
        assert!(!outcome.advanced_checkpoint_only);
        assert_eq!(queues.bulk_revs.len(), 1);
        assert_eq!(queues.revs.len(), 1);
        assert_eq!(queues.deleted_revs.len(), 1);

        // sequence assignment follows inbox order
        assert_eq!(queues.bulk_revs[0].sequence, Some(1));
        assert_eq!(queues.revs[0].sequence, Some(2));
        assert_eq!(queues.deleted_revs[0].sequence, Some(3));
    }

    #[tokio::test]
    async fn empty_inbox_after_filtering_still_advances_checkpoint() {
        let store: Arc<dyn Store> = Arc::new(KnowsEverythingStore);
        let mut sequence_map = SequenceMap::new();
        let mut queues = RevisionQueues::default();
        let inbox = vec![rev("doc1", "1-a", false, false, 5)];

        let outcome = process_inbox(&store, &mut sequence_map, &mut queues, inbox).await.unwrap();
        assert_eq!(outcome.already_known, 1);
        assert!(outcome.advanced_checkpoint_only);
        assert!(queues.is_empty());
        assert_eq!(sequence_map.checkpointed_value(), Some(crate::revision::RemoteSequenceId::Int(5)));
    }

    #[tokio::test]
    async fn conflicted_live_rev_routes_to_individual_queue_not_bulk() {
        let store: Arc<dyn Store> = Arc::new(PassThroughStore);
        let mut sequence_map = SequenceMap::new();
        let mut queues = RevisionQueues::default();
        let inbox = vec![rev("doc1", "1-a", false, true, 1)];

        process_inbox(&store, &mut sequence_map, &mut queues, inbox).await.unwrap();
        assert!(queues.bulk_revs.is_empty());
        assert_eq!(queues.revs.len(), 1);
    }
}
