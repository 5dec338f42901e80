//! Typed errors for each layer of the tap. Module boundaries return one of
//! these; the binary edge (`main.rs`) wraps whatever escapes with
//! `anyhow::Context` and maps it to a process exit code.

use thiserror::Error;

/// Errors that can occur while talking to the Zuora HTTP APIs.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("rate limited (429): {0}")]
    RateLimited(String),

    #[error("retryable server error ({status}): {body}")]
    Retryable { status: u16, body: String },

    #[error("api error ({status}): {body}")]
    ApiError { status: u16, body: String },

    #[error("all data-center candidates returned 401 Unauthorized")]
    BadCredentials,

    #[error("failed to parse describe XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("failed to decode JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// True for outcomes the transport already retried internally and gave
    /// up on; the orchestrator should treat these identically to ApiError.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(
            self,
            TransportError::RateLimited(_) | TransportError::Retryable { .. }
        )
    }
}

/// Errors surfaced by an export driver (AQuA or REST) while creating,
/// polling, or streaming a job.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("export failed: {0}")]
    Failed(String),

    #[error("export timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("export too large for smallest possible query window ({replication_key}: {window_start})")]
    TooLarge {
        replication_key: String,
        window_start: String,
    },

    #[error("file id {0} has been deleted upstream, sync window invalidated")]
    FileDeletedMidSync(String),

    #[error("file id {file_id} is non-rectangular: row has {found} columns, header has {expected}")]
    CorruptExport {
        file_id: String,
        found: usize,
        expected: usize,
    },
}

/// Top-level errors that can abort the whole process.
#[derive(Debug, Error)]
pub enum TapError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
