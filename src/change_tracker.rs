use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::ReplicationConfig;
use crate::error::PullError;
use crate::revision::{PulledRevision, RemoteSequenceId};
use crate::store::Store;

/// `OneShot` requests up to this many entries then ends; a response shorter
/// than this is the caught-up signal.
pub const CHANGES_FEED_LIMIT: usize = 100;

/// Default `User-Agent` sent on every change-feed request, overridden by a
/// user-supplied header of the same name (spec §6 "requestHeaders").
const DEFAULT_USER_AGENT: &str = concat!("replicator-core/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub enum FeedMode {
    OneShot { limit: usize },
    LongPoll { heartbeat_seconds: Option<u64> },
}

#[derive(Debug, Clone)]
pub struct ChangeFeedRequest {
    pub mode: FeedMode,
    pub since: Option<RemoteSequenceId>,
    pub filter_name: Option<String>,
    pub filter_parameters: HashMap<String, String>,
    pub doc_ids: Option<Vec<String>>,
    pub headers: HashMap<String, String>,
}

/// One raw change-feed entry, as delivered by the transport.
#[derive(Debug, Clone)]
pub struct ChangeFeedEntry {
    pub seq: RemoteSequenceId,
    pub id: String,
    pub deleted: bool,
    pub revs: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeFeedResponse {
    pub entries: Vec<ChangeFeedEntry>,
    /// Explicit feed position, if the remote reports one (e.g. CouchDB's
    /// `last_seq`). Falls back to the last entry's `seq` when absent.
    pub last_seq: Option<RemoteSequenceId>,
}

/// The change-tracker transport: delivers parsed change entries. Out of
/// scope to implement against a real remote here, only the interface
/// matters.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    async fn poll_changes(&self, request: ChangeFeedRequest) -> Result<ChangeFeedResponse, PullError>;
}

/// Events the tracker client delivers back to the replicator worker. All
/// mutation of replicator state happens on the worker when these are
/// received, the tracker's own loop runs concurrently but never touches
/// shared state directly.
#[derive(Debug)]
pub enum TrackerEvent {
    Changes(Vec<PulledRevision>),
    /// The first response shorter than `CHANGES_FEED_LIMIT` arrived.
    CaughtUp,
    Stopped(Option<PullError>),
}

pub struct ChangeTracker<S> {
    source: Arc<S>,
    store: Arc<dyn Store>,
    config: ReplicationConfig,
    last_sequence: Option<RemoteSequenceId>,
}

impl<S: ChangeFeedSource + 'static> ChangeTracker<S> {
    pub fn new(
        source: Arc<S>,
        store: Arc<dyn Store>,
        config: ReplicationConfig,
        last_sequence: Option<RemoteSequenceId>,
    ) -> Self {
        Self { source, store, config, last_sequence }
    }

    fn build_request(&self, mode: FeedMode, since: Option<RemoteSequenceId>) -> ChangeFeedRequest {
        let (filter_name, filter_parameters) = match self.config.filter() {
            Some((name, params)) => (Some(name.to_string()), params.clone()),
            None => (None, HashMap::new()),
        };
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());
        headers.extend(self.config.headers().clone());
        ChangeFeedRequest {
            mode,
            since,
            filter_name,
            filter_parameters,
            doc_ids: self.config.doc_id_filter().map(|ids| ids.to_vec()),
            headers,
        }
    }

    /// Turn one raw entry into zero or more `PulledRevision`s: invalid
    /// document ids are skipped, malformed rev ids are skipped, and entries
    /// with more than one leaf mark every rev `conflicted`.
    fn route_entry(&self, entry: &ChangeFeedEntry) -> Vec<PulledRevision> {
        if !self.store.is_valid_document_id(&entry.id) {
            return Vec::new();
        }
        let conflicted = entry.revs.len() > 1;
        entry
            .revs
            .iter()
            .filter_map(|rev_id| {
                PulledRevision::new(
                    entry.id.clone(),
                    rev_id.clone(),
                    entry.deleted,
                    conflicted,
                    entry.seq.clone(),
                )
                .ok()
            })
            .collect()
    }

    /// Drive the change feed until stopped or an error occurs, forwarding
    /// `TrackerEvent`s to `events`. Runs as its own task; the replicator
    /// worker is the only thing that mutates shared state upon receiving
    /// these events.
    pub async fn run(self, events: mpsc::Sender<TrackerEvent>, mut stop: oneshot::Receiver<()>) {
        let mut since = self.last_sequence.clone();
        let mut caught_up = false;

        loop {
            if stop.try_recv().is_ok() {
                break;
            }

            let mode = if caught_up {
                if !self.config.is_continuous() {
                    break;
                }
                FeedMode::LongPoll { heartbeat_seconds: self.config.heartbeat_seconds() }
            } else {
                FeedMode::OneShot { limit: CHANGES_FEED_LIMIT }
            };
            debug!(?mode, "polling change feed");

            let request = self.build_request(mode, since.clone());
            let response = tokio::select! {
                result = self.source.poll_changes(request) => result,
                _ = &mut stop => break,
            };

            match response {
                Ok(response) => {
                    let entry_count = response.entries.len();
                    let mut revs = Vec::new();
                    for entry in &response.entries {
                        revs.extend(self.route_entry(entry));
                        since = Some(entry.seq.clone());
                    }
                    if let Some(last_seq) = response.last_seq {
                        since = Some(last_seq);
                    }

                    if !revs.is_empty() && events.send(TrackerEvent::Changes(revs)).await.is_err() {
                        return;
                    }

                    if !caught_up && entry_count < CHANGES_FEED_LIMIT {
                        caught_up = true;
                        info!("change feed caught up");
                        if events.send(TrackerEvent::CaughtUp).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = events.send(TrackerEvent::Stopped(Some(err))).await;
                    return;
                }
            }
        }

        let _ = events.send(TrackerEvent::Stopped(None)).await;
    }
}
