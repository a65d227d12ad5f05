use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PullError, RemoteError};

/// `GET {docid}?rev={revid}&revs=true&attachments=true[&atts_since=...]`
/// (spec §4.5, §6).
#[derive(Debug, Clone)]
pub struct IndividualGetRequest {
    pub doc_id: String,
    pub rev_id: String,
    pub atts_since: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// Full document body, including `_revisions` history.
    pub document: Value,
}

/// `POST _all_docs?include_docs=true` body `{"keys":[docid, ...]}` (spec §4.5).
#[derive(Debug, Serialize)]
struct BulkGetRequestBody<'a> {
    keys: &'a [String],
}

#[derive(Debug, Deserialize)]
pub struct BulkGetResponse {
    pub rows: Vec<BulkGetRow>,
}

#[derive(Debug, Deserialize)]
pub struct BulkGetRow {
    pub id: String,
    #[serde(default)]
    pub doc: Option<Value>,
}

impl BulkGetRow {
    /// Whether this row can satisfy the bulk path, per spec §4.5: the row
    /// has a document body and that body carries no `_attachments`.
    pub fn is_bulk_usable(&self) -> bool {
        match &self.doc {
            Some(doc) => doc.get("_attachments").is_none(),
            None => false,
        }
    }

    /// `rev` as reported inside the fetched document's `_rev` field, used to
    /// match this row back to the requesting `PulledRevision` (spec §4.5).
    pub fn doc_rev(&self) -> Option<&str> {
        self.doc.as_ref().and_then(|d| d.get("_rev")).and_then(Value::as_str)
    }
}

/// Opaque HTTP/multipart request executor (spec §1, §6 "HTTP executor").
/// Modeled as a trait so the pull core is testable without a live CouchDB.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn get_revision(
        &self,
        request: IndividualGetRequest,
    ) -> Result<FetchedDocument, PullError>;

    async fn bulk_get(&self, doc_ids: &[String]) -> Result<BulkGetResponse, PullError>;
}

/// Default executor backed by `reqwest`, following the same
/// get/send/status-check/json-parse idiom `nano` uses throughout
/// `database/mod.rs`.
pub struct ReqwestExecutor {
    base_url: String,
    client: Client,
}

impl ReqwestExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<Value, PullError> {
        let status_ok = response.status().is_success();
        let body: Value = response.json().await?;
        if status_ok {
            Ok(body)
        } else {
            let remote: RemoteError = serde_json::from_value(body.clone())
                .unwrap_or(RemoteError { error: "unknown".into(), reason: body.to_string() });
            Err(PullError::Remote(remote))
        }
    }
}

#[async_trait]
impl RemoteExecutor for ReqwestExecutor {
    async fn get_revision(
        &self,
        request: IndividualGetRequest,
    ) -> Result<FetchedDocument, PullError> {
        let mut url = format!(
            "{}/{}?rev={}&revs=true&attachments=true",
            self.base_url, request.doc_id, request.rev_id
        );
        if let Some(ids) = &request.atts_since {
            let json_array = serde_json::to_string(ids)?;
            url.push_str("&atts_since=");
            url.push_str(&urlencoding_escape(&json_array));
        }
        let response = self.client.get(&url).send().await?;
        let document = Self::check_status(response).await?;
        Ok(FetchedDocument { document })
    }

    async fn bulk_get(&self, doc_ids: &[String]) -> Result<BulkGetResponse, PullError> {
        let url = format!("{}/_all_docs?include_docs=true", self.base_url);
        let body = BulkGetRequestBody { keys: doc_ids };
        let response = self.client.post(&url).json(&body).send().await?;
        let value = Self::check_status(response).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Minimal percent-encoding for a JSON array placed in a query string
/// (spec §4.5 "URL-escaped"). Avoids pulling in a dedicated crate for the
/// handful of characters a JSON array of quoted rev ids can contain.
fn urlencoding_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
