//! Transport capability consumed by the manager.
//!
//! A transport speaks the controller's bulk endpoints for one kind at a time.
//! Responses are normalised into a per-item map so the executor can complete
//! each handle independently. The HTTP implementation lives in `http`; tests
//! plug in scripted transports.

use crate::cache::ObjectMap;
use crate::dag::KindSpec;
use crate::error::BulkError;
use crate::payload::Payload;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Controller message returned while another change is being applied.
const BUSY_MESSAGE: &str = "system is currently being modified";

/// Per-item error detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrInfo {
    pub code: Option<String>,
    pub message: String,
}

impl ErrInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Outcome of one item in a bulk call.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult {
    /// Applied; the controller may echo the stored object
    Ok(Option<Value>),
    /// Rejected
    Err(ErrInfo),
}

/// Per-item outcomes keyed by object name.
pub type BulkResponse = BTreeMap<String, ItemResult>;

/// Failure of a whole transport call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct TransportError {
    /// HTTP status; `None` for network errors and timeouts
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    /// Per-item detail the controller attached to the failure, if any
    pub per_item: Option<BulkResponse>,
}

impl TransportError {
    /// Connection failure, timeout or undecodable response.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            per_item: None,
        }
    }

    /// Non-success HTTP status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
            per_item: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_per_item(mut self, per_item: BulkResponse) -> Self {
        self.per_item = Some(per_item);
        self
    }

    /// The token was rejected.
    pub fn is_auth(&self) -> bool {
        self.status == Some(401)
    }

    /// Network errors, 5xx, 408, 429 and the controller's busy answer.
    ///
    /// Errors carrying per-item detail are final: replaying them could
    /// re-apply items the controller already accepted.
    pub fn is_retryable(&self) -> bool {
        if self.per_item.is_some() {
            return false;
        }
        if self.message.to_lowercase().contains(BUSY_MESSAGE) {
            return true;
        }
        match self.status {
            None => true,
            Some(code) => code >= 500 || code == 408 || code == 429,
        }
    }

    /// Maps a whole-call failure to the error every affected intent sees.
    ///
    /// Auth failures and retryable errors that survived the retry policy are
    /// transient; anything else failed the whole batch.
    pub fn to_bulk_error(&self, kind: &str) -> BulkError {
        if self.is_auth() || self.is_retryable() {
            BulkError::transient(kind, self.message.clone())
        } else {
            BulkError::batch_failed(kind, self.status, self.message.clone())
        }
    }
}

/// Bulk capability of the controller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Creates or replaces the given objects.
    async fn put_bulk(
        &self,
        kind: &KindSpec,
        items: &[(String, Payload)],
    ) -> Result<BulkResponse, TransportError>;

    /// Partially updates the given objects.
    async fn patch_bulk(
        &self,
        kind: &KindSpec,
        items: &[(String, Payload)],
    ) -> Result<BulkResponse, TransportError>;

    /// Deletes the named objects.
    async fn delete_bulk(
        &self,
        kind: &KindSpec,
        names: &[String],
    ) -> Result<BulkResponse, TransportError>;

    /// Reads every object of the kind.
    async fn get(&self, kind: &KindSpec) -> Result<ObjectMap, TransportError>;

    /// Obtains a fresh token; the transport applies it to later calls.
    async fn authenticate(&self) -> Result<(), TransportError>;
}

/// Extracts the `{json_key: {name: object}}` envelope of a response body.
pub fn objects_from_body(kind: &KindSpec, body: &Value) -> ObjectMap {
    body.get(&kind.json_key)
        .and_then(Value::as_object)
        .map(|objects| {
            objects
                .iter()
                .map(|(name, object)| (name.clone(), object.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Builds per-item results from a bulk response body.
///
/// Echoed objects come from the kind's envelope, failures from an
/// `errors: {name: {code, message}}` map. Names absent from both are left out;
/// the executor treats them as plain successes.
pub fn results_from_body(kind: &KindSpec, body: &Value) -> BulkResponse {
    let mut results: BulkResponse = objects_from_body(kind, body)
        .into_iter()
        .map(|(name, object)| (name, ItemResult::Ok(Some(object))))
        .collect();

    if let Some(errors) = body.get("errors").and_then(Value::as_object) {
        for (name, detail) in errors {
            results.insert(name.clone(), ItemResult::Err(err_info(detail)));
        }
    }
    results
}

fn err_info(detail: &Value) -> ErrInfo {
    match detail {
        Value::String(message) => ErrInfo::new(message.clone()),
        _ => {
            let message = detail
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("rejected")
                .to_string();
            let info = ErrInfo::new(message);
            match detail.get("code") {
                Some(Value::String(code)) => info.with_code(code.clone()),
                Some(Value::Number(code)) => info.with_code(code.to_string()),
                _ => info,
            }
        }
    }
}

/// Builds a transport error from a non-success response.
pub fn error_from_body(kind: &KindSpec, status: u16, body: &Value) -> TransportError {
    let message = body
        .get("message")
        .or_else(|| body.get("payload"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"));

    let mut err = TransportError::http(status, message);
    if let Some(code) = body.get("code").and_then(Value::as_str) {
        err = err.with_code(code);
    }
    if body.get("errors").is_some_and(Value::is_object) {
        err = err.with_per_item(results_from_body(kind, body));
    }
    err
}
