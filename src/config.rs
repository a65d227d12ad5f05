use std::collections::HashMap;
use std::sync::Arc;

use reqwest::RequestBuilder;

/// Pass-through credential-attachment hook. This crate implements no
/// authentication scheme itself; the trait exists only so the pull core can
/// attach whatever an embedder already has.
pub trait Authorizer: Send + Sync {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder;
}

const MIN_ACCEPTED_HEARTBEAT_MS: u64 = 15_000;

/// Replication configuration options.
///
/// Follows the same builder shape as `nano`'s `ChangesQueryParamsStream` /
/// `GetDocsRequestParams`: a `Default` impl plus `fn field(mut self, v) ->
/// Self` methods.
#[derive(Clone, Default)]
pub struct ReplicationConfig {
    continuous: bool,
    heartbeat_ms: Option<u64>,
    filter_name: Option<String>,
    filter_parameters: HashMap<String, String>,
    doc_ids: Option<Vec<String>>,
    request_headers: HashMap<String, String>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl ReplicationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables `LongPoll` after catch-up.
    pub fn continuous(mut self, enable: bool) -> Self {
        self.continuous = enable;
        self
    }

    /// Long-poll heartbeat in milliseconds. Accepted only if `>= 15000`;
    /// smaller values are silently ignored.
    pub fn heartbeat_ms(mut self, value: u64) -> Self {
        if value >= MIN_ACCEPTED_HEARTBEAT_MS {
            self.heartbeat_ms = Some(value);
        }
        self
    }

    pub fn filter_name(mut self, name: impl Into<String>) -> Self {
        self.filter_name = Some(name.into());
        self
    }

    pub fn filter_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_parameters.insert(key.into(), value.into());
        self
    }

    /// Restrict the change feed to these document ids.
    pub fn doc_ids(mut self, ids: Vec<String>) -> Self {
        self.doc_ids = Some(ids);
        self
    }

    /// Merged over the default `User-Agent` when the change tracker starts.
    pub fn request_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(key.into(), value.into());
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// Propagated as seconds to the tracker.
    pub fn heartbeat_seconds(&self) -> Option<u64> {
        self.heartbeat_ms.map(|ms| ms / 1000)
    }

    pub fn filter(&self) -> Option<(&str, &HashMap<String, String>)> {
        self.filter_name
            .as_deref()
            .map(|name| (name, &self.filter_parameters))
    }

    pub fn doc_id_filter(&self) -> Option<&[String]> {
        self.doc_ids.as_deref()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.request_headers
    }

    pub fn apply_authorizer(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.authorizer {
            Some(authorizer) => authorizer.apply(request),
            None => request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_boundary_15000_is_accepted_14999_is_not() {
        let cfg = ReplicationConfig::new().heartbeat_ms(14_999);
        assert_eq!(cfg.heartbeat_seconds(), None);

        let cfg = ReplicationConfig::new().heartbeat_ms(15_000);
        assert_eq!(cfg.heartbeat_seconds(), Some(15));
    }
}
