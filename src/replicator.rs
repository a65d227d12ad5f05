use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::change_tracker::{ChangeFeedSource, ChangeTracker, TrackerEvent};
use crate::config::ReplicationConfig;
use crate::dispatcher::{apply_completion, dispatch, FetchOutcome};
use crate::error::PullError;
use crate::inserter::insert_downloads;
use crate::revision::{PulledRevision, RemoteSequenceId};
use crate::router::{process_inbox, RevisionQueues};
use crate::sequence_map::SequenceMap;
use crate::store::Store;
use crate::transport::RemoteExecutor;

const INBOX_BATCH_CAPACITY: usize = 200;
const INBOX_BATCH_DELAY: Duration = Duration::ZERO;
const DOWNLOAD_BATCH_CAPACITY: usize = 200;
const DOWNLOAD_BATCH_DELAY: Duration = Duration::ZERO;
const FETCH_CHANNEL_CAPACITY: usize = 256;
const TRACKER_CHANNEL_CAPACITY: usize = 32;

/// Resolves to the next item from `rx` if present, never resolving while
/// `rx` is `None`. Lets a `tokio::select!` arm be conditionally active
/// without capturing `self` as a whole inside an async block.
async fn recv_optional<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Point-in-time replicator status, readable by an embedder between runs
/// (`replicationStatus`).
#[derive(Debug, Clone, Default)]
pub struct ReplicatorState {
    pub running: bool,
    pub online: bool,
    pub caught_up: bool,
    pub http_connection_count: usize,
    pub changes_total: usize,
    pub changes_processed: usize,
    pub last_sequence: Option<RemoteSequenceId>,
    pub error: Option<String>,
}

/// Ties the change tracker, revision router, fetch dispatcher and inserter
/// together behind one cooperative worker. All mutable state here is only
/// ever touched from inside `run`; the tracker and individual fetches
/// execute as separate tasks and only re-enter through the channels held
/// below.
pub struct PullReplicator<S: ChangeFeedSource> {
    executor: Arc<dyn RemoteExecutor>,
    store: Arc<dyn Store>,
    config: ReplicationConfig,
    source: Arc<S>,
    insert_source_label: String,

    state: ReplicatorState,
    sequence_map: SequenceMap,
    queues: RevisionQueues,
    inbox_batcher: crate::batcher::Batcher<PulledRevision>,
    download_batcher: crate::batcher::Batcher<PulledRevision>,

    tracker_stop: Option<oneshot::Sender<()>>,
    tracker_events: Option<mpsc::Receiver<TrackerEvent>>,
    fetch_tx: mpsc::Sender<FetchOutcome>,
    fetch_rx: mpsc::Receiver<FetchOutcome>,
}

impl<S: ChangeFeedSource + 'static> PullReplicator<S> {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        store: Arc<dyn Store>,
        source: Arc<S>,
        config: ReplicationConfig,
        insert_source_label: impl Into<String>,
        last_sequence: Option<RemoteSequenceId>,
    ) -> Self {
        let mut sequence_map = SequenceMap::new();
        sequence_map.prime(last_sequence.clone());
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_CHANNEL_CAPACITY);

        Self {
            executor,
            store,
            config,
            source,
            insert_source_label: insert_source_label.into(),
            state: ReplicatorState { last_sequence, ..Default::default() },
            sequence_map,
            queues: RevisionQueues::default(),
            inbox_batcher: crate::batcher::Batcher::new(INBOX_BATCH_CAPACITY, INBOX_BATCH_DELAY),
            download_batcher: crate::batcher::Batcher::new(DOWNLOAD_BATCH_CAPACITY, DOWNLOAD_BATCH_DELAY),
            tracker_stop: None,
            tracker_events: None,
            fetch_tx,
            fetch_rx,
        }
    }

    pub fn state(&self) -> &ReplicatorState {
        &self.state
    }

    /// Starts (or restarts) the change tracker task. A no-op if already
    /// running.
    pub fn begin_replicating(&mut self) {
        if self.state.running {
            return;
        }
        self.start_change_tracker();
        self.state.running = true;
        self.state.online = true;
        self.state.error = None;
    }

    fn start_change_tracker(&mut self) {
        let tracker = ChangeTracker::new(
            self.source.clone(),
            self.store.clone(),
            self.config.clone(),
            self.state.last_sequence.clone(),
        );
        let (events_tx, events_rx) = mpsc::channel(TRACKER_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(tracker.run(events_tx, stop_rx));
        self.tracker_events = Some(events_rx);
        self.tracker_stop = Some(stop_tx);
    }

    /// Detaches the tracker, drains in-flight downloads into the store and
    /// marks the replicator stopped. Undispatched fetch work is abandoned,
    /// its sequences stay pinned and are replayed on the next run.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.tracker_stop.take() {
            let _ = stop_tx.send(());
        }
        self.tracker_events = None;
        self.queues.clear();

        let pending = self.download_batcher.flush_all();
        if !pending.is_empty() {
            if let Err(err) = self.flush_downloads(pending).await {
                warn!(error = %err, "failed to flush pending downloads on stop");
            }
        }

        self.state.running = false;
        self.state.online = false;
        self.state.http_connection_count = 0;
    }

    /// Equivalent to stopping and immediately restarting from the last
    /// checkpoint.
    pub async fn retry(&mut self) {
        self.stop().await;
        self.begin_replicating();
    }

    pub async fn go_offline(&mut self) {
        if !self.state.online {
            return;
        }
        if let Some(stop_tx) = self.tracker_stop.take() {
            let _ = stop_tx.send(());
        }
        self.tracker_events = None;
        self.state.online = false;
    }

    pub fn go_online(&mut self) {
        if self.state.online || !self.state.running {
            return;
        }
        self.start_change_tracker();
        self.state.online = true;
    }

    pub fn is_stopped(&self) -> bool {
        !self.state.running
    }

    async fn flush_downloads(&mut self, batch: Vec<PulledRevision>) -> Result<(), PullError> {
        let report = insert_downloads(&self.store, &mut self.sequence_map, &self.insert_source_label, batch).await?;
        self.state.changes_processed += report.inserted + report.forbidden + report.failed;
        if report.failed > 0 {
            warn!(failed = report.failed, "some downloads failed to insert and stay pinned");
        }
        self.state.last_sequence = report.checkpoint.or_else(|| self.state.last_sequence.clone());
        Ok(())
    }

    /// Drives the replicator until the tracker reports it has stopped and
    /// all outstanding work has drained. Intended for one-shot (non
    /// continuous) runs; a continuous configuration runs until `stop` is
    /// called from another task.
    pub async fn run(mut self) -> ReplicatorState {
        self.begin_replicating();

        loop {
            let tracker_done = self.tracker_events.is_none();
            let nothing_pending = self.queues.is_empty()
                && self.inbox_batcher.is_empty()
                && self.download_batcher.is_empty()
                && self.state.http_connection_count == 0;

            if tracker_done && nothing_pending && !self.state.running {
                break;
            }

            tokio::select! {
                biased;

                Some(event) = recv_optional(&mut self.tracker_events) => {
                    self.handle_tracker_event(event).await;
                }

                Some(outcome) = self.fetch_rx.recv() => {
                    self.handle_fetch_outcome(outcome).await;
                }

                _ = self.inbox_batcher.wait_for_timeout() => {
                    let batch = self.inbox_batcher.take_batch();
                    self.route_inbox(batch).await;
                }

                _ = self.download_batcher.wait_for_timeout() => {
                    let batch = self.download_batcher.take_batch();
                    if let Err(err) = self.flush_downloads(batch).await {
                        error!(error = %err, "insert failed");
                        self.state.error = Some(err.to_string());
                    }
                }
            }
        }

        self.state.clone()
    }

    async fn handle_tracker_event(&mut self, event: TrackerEvent) {
        match event {
            TrackerEvent::Changes(revs) => {
                self.state.changes_total += revs.len();
                if self.inbox_batcher.queue_all(revs) {
                    let batch = self.inbox_batcher.take_batch();
                    self.route_inbox(batch).await;
                }
            }
            TrackerEvent::CaughtUp => {
                self.state.caught_up = true;
                let batch = self.inbox_batcher.flush_all();
                self.route_inbox(batch).await;
            }
            TrackerEvent::Stopped(err) => {
                self.tracker_events = None;
                if let Some(err) = err {
                    if err.is_offline_class() {
                        info!("change tracker went offline");
                        self.state.online = false;
                        self.state.running = false;
                    } else {
                        error!(error = %err, "change tracker stopped with error");
                        self.state.error = Some(err.to_string());
                        self.state.running = false;
                    }
                } else if !self.config.is_continuous() {
                    self.state.running = false;
                }
            }
        }
    }

    async fn route_inbox(&mut self, batch: Vec<PulledRevision>) {
        if batch.is_empty() {
            return;
        }
        match process_inbox(&self.store, &mut self.sequence_map, &mut self.queues, batch).await {
            Some(outcome) => {
                self.state.changes_total = self.state.changes_total.saturating_sub(outcome.already_known);
                if outcome.advanced_checkpoint_only {
                    self.state.last_sequence = self.sequence_map.checkpointed_value();
                }
                dispatch(
                    &mut self.queues,
                    &mut self.state.http_connection_count,
                    &self.executor,
                    &self.store,
                    &self.fetch_tx,
                );
            }
            None => {
                warn!("discarding inbox batch after store failure");
            }
        }
    }

    async fn handle_fetch_outcome(&mut self, outcome: FetchOutcome) {
        self.state.http_connection_count = self.state.http_connection_count.saturating_sub(1);
        let effect = apply_completion(outcome, &mut self.queues);

        if let Some(err) = effect.error {
            warn!(error = %err, "fetch failed");
            self.state.error = Some(err.to_string());
        }
        self.state.changes_processed += effect.processed_without_insert;

        if self.download_batcher.queue_all(effect.to_download) {
            let batch = self.download_batcher.take_batch();
            if let Err(err) = self.flush_downloads(batch).await {
                error!(error = %err, "insert failed");
                self.state.error = Some(err.to_string());
            }
        }

        dispatch(
            &mut self.queues,
            &mut self.state.http_connection_count,
            &self.executor,
            &self.store,
            &self.fetch_tx,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_tracker::{ChangeFeedRequest, ChangeFeedResponse};
    use crate::store::{InsertStatus, Transaction};
    use crate::transport::{BulkGetResponse, FetchedDocument, IndividualGetRequest};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct OneShotSource {
        response: Mutex<Option<ChangeFeedResponse>>,
    }

    #[async_trait]
    impl ChangeFeedSource for OneShotSource {
        async fn poll_changes(&self, _request: ChangeFeedRequest) -> Result<ChangeFeedResponse, PullError> {
            Ok(self.response.lock().unwrap().take().unwrap_or_default())
        }
    }

    struct AcceptingStore {
        log: Mutex<Vec<String>>,
    }

    struct NullTransaction;
    #[async_trait]
    impl Transaction for NullTransaction {
        async fn force_insert(
            &mut self,
            _rev: &PulledRevision,
            _history: Vec<String>,
            _source: &str,
        ) -> Result<InsertStatus, PullError> {
            Ok(InsertStatus::Ok)
        }
        async fn commit(self: Box<Self>) -> Result<(), PullError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Store for AcceptingStore {
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
            Some(Vec::new())
        }
        async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, PullError> {
            self.log.lock().unwrap().push("txn".into());
            Ok(Box::new(NullTransaction))
        }
    }

    struct EchoExecutor;
    #[async_trait]
    impl RemoteExecutor for EchoExecutor {
        async fn get_revision(&self, request: IndividualGetRequest) -> Result<FetchedDocument, PullError> {
            Ok(FetchedDocument { document: serde_json::json!({"_id": request.doc_id, "_rev": request.rev_id}) })
        }
        async fn bulk_get(&self, _doc_ids: &[String]) -> Result<BulkGetResponse, PullError> {
            Ok(BulkGetResponse { rows: Vec::new() })
        }
    }

    fn entry(seq: i64, id: &str) -> crate::change_tracker::ChangeFeedEntry {
        crate::change_tracker::ChangeFeedEntry {
            seq: RemoteSequenceId::Int(seq),
            id: id.to_string(),
            deleted: false,
            revs: vec!["1-a".to_string()],
        }
    }

    #[tokio::test]
    async fn one_shot_run_drains_to_completion() {
        let source = Arc::new(OneShotSource {
            response: Mutex::new(Some(ChangeFeedResponse {
                entries: vec![entry(1, "doc1"), entry(2, "doc2")],
                last_seq: Some(RemoteSequenceId::Int(2)),
            })),
        });
        let store: Arc<dyn Store> = Arc::new(AcceptingStore { log: Mutex::new(Vec::new()) });
        let executor: Arc<dyn RemoteExecutor> = Arc::new(EchoExecutor);
        let replicator = PullReplicator::new(
            executor,
            store,
            source,
            ReplicationConfig::new(),
            "test-pull",
            None,
        );

        let state = replicator.run().await;
        assert!(!state.running);
        assert_eq!(state.changes_processed, 2);
        assert_eq!(state.last_sequence, Some(RemoteSequenceId::Int(2)));
        assert!(state.error.is_none());
    }
}
