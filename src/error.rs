use thiserror::Error;

use whois_ingest_core::backend::BackendError;
use whois_ingest_core::domain::DomainError;

/// Failure of a bulk multi-get.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("fetch size too large, reduce bulk_fetch_size and try again ({0})")]
    TooLarge(BackendError),

    #[error("bulk fetch failed: {0}")]
    Backend(BackendError),
}

impl From<BackendError> for FetchError {
    fn from(err: BackendError) -> Self {
        if err.is_too_large() {
            FetchError::TooLarge(err)
        } else {
            FetchError::Backend(err)
        }
    }
}

/// Failure of a bulk write.
#[derive(Error, Debug)]
pub enum ShipError {
    #[error("bulk ship too large, reduce bulk_ship_size and try again ({0})")]
    TooLarge(BackendError),

    #[error("error making bulk request, received status {status}: {reason}")]
    Item { status: u16, reason: String },

    #[error("bulk ship failed: {0}")]
    Backend(BackendError),
}

impl From<BackendError> for ShipError {
    fn from(err: BackendError) -> Self {
        if err.is_too_large() {
            ShipError::TooLarge(err)
        } else {
            ShipError::Backend(err)
        }
    }
}

/// Errors surfaced by the ingest orchestrator.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error(
        "version {version} was interrupted; run `reingest` to resume it or \
         `clear-interrupted` to discard it"
    )]
    InterruptedImport { version: u64 },

    #[error("no metadata found in cluster, nothing to reingest")]
    NoData,

    #[error("no input file or directory given")]
    NoInput,

    #[error("Template error: {0}")]
    Template(String),

    #[error("ingest aborted: {reason}")]
    Aborted { reason: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
