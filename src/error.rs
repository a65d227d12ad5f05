use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error body returned by a CouchDB-style remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub error: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum PullError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unable to parse json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("remote rejected request: {0:?}")]
    Remote(RemoteError),

    #[error("store error: {0}")]
    Store(String),

    #[error("malformed change feed entry: {0}")]
    MalformedFeedEntry(String),

    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),
}

impl PullError {
    /// Transient transport/offline-class errors drive a replicator offline
    /// transition instead of being recorded as a permanent error.
    pub fn is_offline_class(&self) -> bool {
        match self {
            PullError::Transport(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}
