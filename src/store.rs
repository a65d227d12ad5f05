use async_trait::async_trait;

use crate::error::PullError;
use crate::revision::PulledRevision;

/// Result of `forceInsert`ing one revision (spec §6, §4.6, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertStatus {
    Ok,
    /// Validation rejected the write. Treated as a delivered event, not a
    /// failure: the sequence is still removed and the checkpoint may still
    /// advance (spec §4.6, §7).
    Forbidden,
    /// The store asks the inserter to abort and retry the whole transaction.
    DbBusy,
    /// Any other store-reported failure (recorded as an error; sequence
    /// stays pinned in `SequenceMap`).
    Other(String),
}

/// A single store transaction, opened for one insert batch (spec §4.6,
/// §5 "Shared-resource policy").
#[async_trait]
pub trait Transaction: Send {
    async fn force_insert(
        &mut self,
        rev: &PulledRevision,
        history: Vec<String>,
        source: &str,
    ) -> Result<InsertStatus, PullError>;

    async fn commit(self: Box<Self>) -> Result<(), PullError>;
}

/// The local store this replicator inserts into. Out of scope per spec §1,
/// only its interface matters here.
#[async_trait]
pub trait Store: Send + Sync {
    fn is_valid_document_id(&self, id: &str) -> bool;

    /// Mutates `revs` in place, removing any already known locally. Returns
    /// `Err` on store failure, callers discard the whole batch rather than
    /// partially apply it (spec §4.4 step 1).
    async fn find_missing_revisions(
        &self,
        revs: &mut Vec<PulledRevision>,
    ) -> Result<(), PullError>;

    /// Ancestor ids usable for `atts_since`, plus whether the local doc has
    /// any attachments at all (spec §4.5 "Individual GET").
    async fn get_possible_ancestor_revision_ids(
        &self,
        rev: &PulledRevision,
        limit: usize,
    ) -> Result<(Vec<String>, bool), PullError>;

    async fn parse_revision_history(&self, properties: &serde_json::Value) -> Option<Vec<String>>;

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, PullError>;
}
