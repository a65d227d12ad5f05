use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::PullError;
use crate::revision::PulledRevision;
use crate::router::RevisionQueues;
use crate::store::Store;
use crate::transport::{IndividualGetRequest, RemoteExecutor};

/// Concurrency and batching caps.
pub const MAX_OPEN_HTTP_CONNECTIONS: usize = 12;
pub const MAX_REVS_TO_GET_IN_BULK: usize = 50;
pub const MAX_NUMBER_OF_ATTS_SINCE: usize = 50;

/// Result of one fetch, delivered back to the replicator worker.
pub enum FetchOutcome {
    IndividualOk(PulledRevision),
    IndividualErr { rev: PulledRevision, error: PullError },
    /// `fetched` is ready for the download batcher; `remaining` must be
    /// re-queued into the individual `revs` path.
    BulkPartial { fetched: Vec<PulledRevision>, remaining: Vec<PulledRevision> },
    BulkErr { revs: Vec<PulledRevision>, error: PullError },
}

/// What the worker must do in response to one `FetchOutcome`.
pub struct CompletionEffect {
    pub to_download: Vec<PulledRevision>,
    /// Revs that made progress (counted toward `changesProcessed`) without
    /// being handed to the inserter, their sequence stays pinned in
    /// `SequenceMap`.
    pub processed_without_insert: usize,
    pub error: Option<PullError>,
}

/// While under the connection cap and the store is still attached, issue
/// bulk POSTs and individual GETs in priority order: bulk, then live revs,
/// then deletions.
pub fn dispatch(
    queues: &mut RevisionQueues,
    http_connection_count: &mut usize,
    executor: &Arc<dyn RemoteExecutor>,
    store: &Arc<dyn Store>,
    completions: &mpsc::Sender<FetchOutcome>,
) {
    while *http_connection_count < MAX_OPEN_HTTP_CONNECTIONS {
        if !queues.bulk_revs.is_empty() {
            let take_n = queues.bulk_revs.len().min(MAX_REVS_TO_GET_IN_BULK);
            if take_n == 1 {
                // A bulk POST of one key is wasteful; demote to the
                // individual path and re-evaluate.
                let rev = queues.bulk_revs.remove(0);
                queues.revs.push(rev);
                continue;
            }
            let batch: Vec<PulledRevision> = queues.bulk_revs.drain(0..take_n).collect();
            *http_connection_count += 1;
            debug!(count = batch.len(), "issuing bulk GET");
            spawn_bulk_fetch(batch, executor.clone(), completions.clone());
        } else if !queues.revs.is_empty() {
            let rev = queues.revs.remove(0);
            *http_connection_count += 1;
            spawn_individual_fetch(rev, executor.clone(), store.clone(), completions.clone());
        } else if !queues.deleted_revs.is_empty() {
            let rev = queues.deleted_revs.remove(0);
            *http_connection_count += 1;
            spawn_individual_fetch(rev, executor.clone(), store.clone(), completions.clone());
        } else {
            break;
        }
    }
}

fn spawn_individual_fetch(
    rev: PulledRevision,
    executor: Arc<dyn RemoteExecutor>,
    store: Arc<dyn Store>,
    completions: mpsc::Sender<FetchOutcome>,
) {
    tokio::spawn(async move {
        let ancestors = store
            .get_possible_ancestor_revision_ids(&rev, MAX_NUMBER_OF_ATTS_SINCE)
            .await;
        let (ancestor_ids, has_attachments) = match ancestors {
            Ok(v) => v,
            Err(error) => {
                let _ = completions.send(FetchOutcome::IndividualErr { rev, error }).await;
                return;
            }
        };
        let atts_since = if !ancestor_ids.is_empty() && has_attachments {
            Some(ancestor_ids)
        } else {
            None
        };
        let request = IndividualGetRequest {
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.clone(),
            atts_since,
        };
        match executor.get_revision(request).await {
            Ok(fetched) => {
                let mut rev = rev;
                rev.properties = Some(fetched.document);
                let _ = completions.send(FetchOutcome::IndividualOk(rev)).await;
            }
            Err(error) => {
                warn!(doc_id = %rev.doc_id, error = %error, "individual GET failed");
                let _ = completions.send(FetchOutcome::IndividualErr { rev, error }).await;
            }
        }
    });
}

fn spawn_bulk_fetch(
    batch: Vec<PulledRevision>,
    executor: Arc<dyn RemoteExecutor>,
    completions: mpsc::Sender<FetchOutcome>,
) {
    tokio::spawn(async move {
        let doc_ids: Vec<String> = batch.iter().map(|r| r.doc_id.clone()).collect();
        match executor.bulk_get(&doc_ids).await {
            Ok(response) => {
                let mut remaining = batch;
                let mut fetched = Vec::new();
                for row in response.rows {
                    if !row.is_bulk_usable() {
                        continue;
                    }
                    let doc_rev = row.doc_rev().map(str::to_string);
                    if let Some(pos) = remaining
                        .iter()
                        .position(|r| r.doc_id == row.id && Some(r.rev_id.clone()) == doc_rev)
                    {
                        let mut rev = remaining.remove(pos);
                        rev.properties = row.doc;
                        fetched.push(rev);
                    }
                }
                let _ = completions.send(FetchOutcome::BulkPartial { fetched, remaining }).await;
            }
            Err(error) => {
                warn!(count = batch.len(), error = %error, "bulk GET failed");
                let _ = completions.send(FetchOutcome::BulkErr { revs: batch, error }).await;
            }
        }
    });
}

/// Classify a completed fetch into what the worker must do next. Bulk
/// misses are re-queued into `queues.revs` here so the caller can simply
/// re-invoke `dispatch` afterward.
pub fn apply_completion(outcome: FetchOutcome, queues: &mut RevisionQueues) -> CompletionEffect {
    match outcome {
        FetchOutcome::IndividualOk(rev) => CompletionEffect {
            to_download: vec![rev],
            processed_without_insert: 0,
            error: None,
        },
        FetchOutcome::IndividualErr { error, .. } => CompletionEffect {
            to_download: Vec::new(),
            processed_without_insert: 1,
            error: Some(error),
        },
        FetchOutcome::BulkPartial { fetched, remaining } => {
            queues.revs.extend(remaining);
            CompletionEffect {
                to_download: fetched,
                processed_without_insert: 0,
                error: None,
            }
        }
        FetchOutcome::BulkErr { revs, error } => CompletionEffect {
            to_download: Vec::new(),
            processed_without_insert: revs.len(),
            error: Some(error),
        },
    }
}
