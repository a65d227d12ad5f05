use std::sync::Arc;

use tracing::{error, warn};

use crate::error::PullError;
use crate::revision::{PulledRevision, RemoteSequenceId};
use crate::sequence_map::SequenceMap;
use crate::store::{InsertStatus, Store};

/// Outcome of one `insert_downloads` call.
pub struct InsertionReport {
    pub inserted: usize,
    pub forbidden: usize,
    /// Revisions whose sequence stays pinned because the insert failed for
    /// a reason other than `DbBusy` (missing history, store error).
    pub failed: usize,
    pub checkpoint: Option<RemoteSequenceId>,
}

/// Applies one batch of fetched revisions to the local store (`insertRevisions`).
/// Sorts by assigned sequence so the store always sees monotonic history for
/// a given document, opens one transaction per attempt, and retries the
/// whole batch if the store signals `DbBusy` mid-transaction.
pub async fn insert_downloads(
    store: &Arc<dyn Store>,
    sequence_map: &mut SequenceMap,
    source: &str,
    mut batch: Vec<PulledRevision>,
) -> Result<InsertionReport, PullError> {
    batch.sort_by_key(|r| r.sequence.unwrap_or(u64::MAX));

    let mut inserted = 0;
    let mut forbidden = 0;
    let mut failed = 0;

    'attempt: loop {
        inserted = 0;
        forbidden = 0;
        failed = 0;
        let mut txn = store.begin_transaction().await?;
        let mut settled_sequences = Vec::new();

        for rev in &batch {
            let history = match &rev.properties {
                Some(properties) => store.parse_revision_history(properties).await,
                None => None,
            };
            let history = match history {
                Some(history) => history,
                None if rev.generation > 1 => {
                    warn!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, "missing revision history for non-root revision");
                    failed += 1;
                    continue;
                }
                None => Vec::new(),
            };

            match txn.force_insert(rev, history, source).await {
                Ok(InsertStatus::Ok) => {
                    inserted += 1;
                    if let Some(seq) = rev.sequence {
                        settled_sequences.push(seq);
                    }
                }
                Ok(InsertStatus::Forbidden) => {
                    forbidden += 1;
                    if let Some(seq) = rev.sequence {
                        settled_sequences.push(seq);
                    }
                }
                Ok(InsertStatus::DbBusy) => {
                    warn!("store reported busy, retrying insert batch");
                    continue 'attempt;
                }
                Ok(InsertStatus::Other(reason)) => {
                    error!(doc_id = %rev.doc_id, reason = %reason, "insert failed");
                    failed += 1;
                }
                Err(err) => return Err(err),
            }
        }

        txn.commit().await?;
        for seq in settled_sequences {
            sequence_map.remove_sequence(seq);
        }
        break;
    }

    Ok(InsertionReport {
        inserted,
        forbidden,
        failed,
        checkpoint: sequence_map.checkpointed_value(),
    })
}
