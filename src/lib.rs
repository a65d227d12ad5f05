//! Pull-only replication core for a document-oriented sync engine: tracks a
//! remote change feed, routes revisions across bulk/individual/deleted fetch
//! paths, dispatches HTTP under a bounded concurrency cap, and inserts
//! fetched documents locally while advancing a crash-safe checkpoint.
//!
//! The local store, HTTP transport and change-feed wire format are modeled
//! as traits ([`store::Store`], [`transport::RemoteExecutor`],
//! [`change_tracker::ChangeFeedSource`]) so the pipeline can run against any
//! backend that implements them.

pub mod batcher;
pub mod change_tracker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inserter;
pub mod replicator;
pub mod revision;
pub mod router;
pub mod sequence_map;
pub mod store;
pub mod transport;

pub use change_tracker::{ChangeFeedSource, ChangeTracker};
pub use config::{Authorizer, ReplicationConfig};
pub use error::PullError;
pub use replicator::{PullReplicator, ReplicatorState};
pub use revision::{PulledRevision, RemoteSequenceId};
pub use store::Store;
pub use transport::{ReqwestExecutor, RemoteExecutor};
