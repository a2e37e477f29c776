//! Search-engine abstraction for whois-ingest.
//!
//! The [`SearchBackend`] trait is the subset of the engine's API the ingest
//! pipeline consumes: index and template bootstrap, single-document CRUD for
//! metadata, multi-get, bulk writes, doc counts, alias resolution and
//! rollover. Implementations must be `Send + Sync`; every pipeline thread
//! shares one instance behind an `Arc`.
//!
//! Index arguments may name either a physical index or an alias. Writes
//! through an alias land in the single index that alias points to.

pub mod memory;

use serde_json::Value;
use thiserror::Error;

use crate::models::{BulkCommand, DocRef};

/// Errors returned by a [`SearchBackend`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// HTTP 429 caused by a circuit breaker; the request was too large.
    #[error("circuit breaker tripped: {0}")]
    CircuitBreaker(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unexpected status {status}: {reason}")]
    Status { status: u16, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unable to decode response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Classify a non-success HTTP status and its response body.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            404 => BackendError::NotFound(body.to_string()),
            409 => BackendError::Conflict(body.to_string()),
            429 if body.contains("circuit_break") => BackendError::CircuitBreaker(body.to_string()),
            429 => BackendError::RateLimited(body.to_string()),
            _ => BackendError::Status {
                status,
                reason: body.to_string(),
            },
        }
    }

    /// True for responses that mean the request should be made smaller.
    pub fn is_too_large(&self) -> bool {
        matches!(
            self,
            BackendError::CircuitBreaker(_) | BackendError::RateLimited(_)
        )
    }
}

/// One slot of a multi-get response, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiGetResult {
    pub index: String,
    pub id: String,
    /// `Some` when the document was found.
    pub source: Option<Value>,
}

/// Per-item outcome of a bulk request, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub op: String,
    pub index: String,
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The search-engine surface used by the ingest pipeline.
pub trait SearchBackend: Send + Sync {
    /// Version strings of every node in the cluster.
    fn node_versions(&self) -> Result<Vec<String>, BackendError>;

    fn index_exists(&self, index: &str) -> Result<bool, BackendError>;

    fn template_exists(&self, name: &str) -> Result<bool, BackendError>;

    /// Install or replace a legacy index template.
    fn put_template(&self, name: &str, body: &Value) -> Result<(), BackendError>;

    /// Create an index. `body` may carry `settings`, `mappings` and `aliases`.
    fn create_index(&self, index: &str, body: &Value) -> Result<(), BackendError>;

    /// Fetch a document's `_source`, `None` if absent.
    fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, BackendError>;

    /// Create a document, failing with [`BackendError::Conflict`] if it exists.
    fn create_document(&self, index: &str, id: &str, body: &Value) -> Result<(), BackendError>;

    /// Merge `doc` into an existing document, failing with
    /// [`BackendError::NotFound`] if it is absent.
    fn update_document(&self, index: &str, id: &str, doc: &Value) -> Result<(), BackendError>;

    fn multi_get(&self, docs: &[DocRef]) -> Result<Vec<MultiGetResult>, BackendError>;

    /// Execute a batch of writes. Item-level failures are reported in the
    /// result rather than as an `Err`.
    fn bulk(&self, commands: &[BulkCommand]) -> Result<Vec<BulkItemResult>, BackendError>;

    /// Document count of an index or alias.
    fn count(&self, index: &str) -> Result<u64, BackendError>;

    /// Physical indices an alias points to.
    fn resolve_alias(&self, alias: &str) -> Result<Vec<String>, BackendError>;

    /// Roll `write_alias` over to a new index created with `body`; returns the
    /// new index name.
    fn rollover(&self, write_alias: &str, body: &Value) -> Result<String, BackendError>;

    fn refresh(&self, index: &str) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            BackendError::from_status(404, "missing"),
            BackendError::NotFound(_)
        ));
        assert!(matches!(
            BackendError::from_status(429, r#"{"type":"circuit_breaking_exception"}"#),
            BackendError::CircuitBreaker(_)
        ));
        assert!(matches!(
            BackendError::from_status(429, "slow down"),
            BackendError::RateLimited(_)
        ));
        assert!(BackendError::from_status(429, "slow down").is_too_large());
        assert_eq!(
            BackendError::from_status(500, "boom"),
            BackendError::Status {
                status: 500,
                reason: "boom".into()
            }
        );
    }
}
