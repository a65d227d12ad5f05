use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PullError;

/// Opaque ordering token handed out by the remote change feed.
///
/// CouchDB-style remotes emit either a plain string or a number here; callers
/// must treat it as opaque and never parse it for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteSequenceId {
    Str(String),
    Int(i64),
}

impl fmt::Display for RemoteSequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteSequenceId::Str(s) => write!(f, "{}", s),
            RemoteSequenceId::Int(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for RemoteSequenceId {
    fn from(s: &str) -> Self {
        RemoteSequenceId::Str(s.to_string())
    }
}

impl From<String> for RemoteSequenceId {
    fn from(s: String) -> Self {
        RemoteSequenceId::Str(s)
    }
}

impl From<i64> for RemoteSequenceId {
    fn from(i: i64) -> Self {
        RemoteSequenceId::Int(i)
    }
}

/// Parse the generation prefix of a revision id, e.g. `"3-abc123"` -> `3`.
pub fn parse_generation(rev_id: &str) -> Result<u64, PullError> {
    let gen_str = rev_id
        .split('-')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PullError::MalformedFeedEntry(format!("bad rev id: {}", rev_id)))?;
    gen_str
        .parse::<u64>()
        .map_err(|_| PullError::MalformedFeedEntry(format!("bad rev id: {}", rev_id)))
}

/// One pulled document revision as it moves through the pipeline:
/// router -> queue -> dispatcher -> download batcher -> inserter.
///
/// Immutable after `sequence` is assigned, except for `properties` /
/// `revision_history`, which are set once on fetch completion.
#[derive(Debug, Clone)]
pub struct PulledRevision {
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    pub generation: u64,
    pub conflicted: bool,
    pub remote_sequence_id: RemoteSequenceId,
    /// Dense local sequence, assigned by `SequenceMap` at routing time.
    pub sequence: Option<u64>,
    /// Populated once the document body has been fetched.
    pub properties: Option<serde_json::Value>,
    pub revision_history: Option<Vec<String>>,
}

impl PulledRevision {
    pub fn new(
        doc_id: impl Into<String>,
        rev_id: impl Into<String>,
        deleted: bool,
        conflicted: bool,
        remote_sequence_id: RemoteSequenceId,
    ) -> Result<Self, PullError> {
        let rev_id = rev_id.into();
        let generation = parse_generation(&rev_id)?;
        Ok(Self {
            doc_id: doc_id.into(),
            rev_id,
            deleted,
            generation,
            conflicted,
            remote_sequence_id,
            sequence: None,
            properties: None,
            revision_history: None,
        })
    }

    /// Eligible for the bulk-fetch path: generation 1, live, no conflicts.
    pub fn is_bulk_eligible(&self) -> bool {
        self.generation == 1 && !self.deleted && !self.conflicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generation_prefix() {
        assert_eq!(parse_generation("1-abc").unwrap(), 1);
        assert_eq!(parse_generation("42-deadbeef").unwrap(), 42);
    }

    #[test]
    fn rejects_malformed_rev_id() {
        assert!(parse_generation("abc").is_err());
        assert!(parse_generation("").is_err());
        assert!(parse_generation("-abc").is_err());
    }

    #[test]
    fn bulk_eligibility_matches_invariant() {
        let live = PulledRevision::new("doc1", "1-a", false, false, "1".into()).unwrap();
        assert!(live.is_bulk_eligible());

        let deleted = PulledRevision::new("doc1", "1-a", true, false, "1".into()).unwrap();
        assert!(!deleted.is_bulk_eligible());

        let conflicted = PulledRevision::new("doc1", "1-a", false, true, "1".into()).unwrap();
        assert!(!conflicted.is_bulk_eligible());

        let gen2 = PulledRevision::new("doc1", "2-a", false, false, "1".into()).unwrap();
        assert!(!gen2.is_bulk_eligible());
    }
}
