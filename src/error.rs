// =============================================================================
// error.rs - WHAT CAN GO WRONG, BY STAGE
// =============================================================================
//
// One enum per concern. The run loop never lets any of these escape past a
// single record: they are logged, counted in RunMetrics, and the loop moves
// on. Only setup failures (missing credentials, unreadable service account)
// make it to main, where anyhow takes over.
// =============================================================================

use thiserror::Error;

/// Failures talking to KIND (list pages, viewer pages, PDF downloads) or
/// the KRX market-data endpoint.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("HTML parse failed: {0}")]
    Parse(String),

    #[error("document number not found for {0}")]
    MissingDocNo(String),

    #[error("not a usable PDF ({len} bytes)")]
    InvalidDocument { len: usize },
}

/// Failures from the LLM providers. Only `RateLimited` is retried.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("empty response from provider")]
    EmptyResponse,

    #[error("could not recover JSON from response: {preview}")]
    Parse { preview: String },

    #[error("neither document bytes nor usable text were provided")]
    NoInput,
}

impl AnalyzerError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AnalyzerError::RateLimited(_))
    }
}

/// The kinds of write that can hit an account-level quota. Once one trips,
/// the sentinel keeps the rest of the run from hammering that API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    DriveUpload,
    SheetWrite,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaKind::DriveUpload => write!(f, "drive-upload"),
            QuotaKind::SheetWrite => write!(f, "sheet-write"),
        }
    }
}

/// Failures from the persistence layer (Sheets and Drive).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Google API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("quota exceeded ({0}); further writes of this kind are disabled")]
    QuotaExceeded(QuotaKind),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid A1 range: {0}")]
    Range(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Telegram delivery failures. Logged by the caller, never escalated.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("rate limited by Telegram")]
    RateLimited,

    #[error("send failed: {0}")]
    SendFailed(String),
}
