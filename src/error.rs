use thiserror::Error;

/// Failures of the HTTP layer. Also used as the failure reason of a single
/// image download.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("connection to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("reading body of {url} failed: {message}")]
    Body { url: String, message: String },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("malformed url {0:?}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Timeouts, dropped connections, server errors and rate limiting are
    /// worth another attempt. Client errors and malformed urls are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connect { .. } | FetchError::Body { .. } => true,
            FetchError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            FetchError::InvalidUrl(_) => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::Status { status: 429, .. })
    }
}

/// The page did not have the structure we expect from the site.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("marker {0:?} not found in page")]
    MissingMarker(String),
    #[error("expected element {0:?} not found")]
    MissingElement(String),
    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: String, value: String },
    #[error("duplicate chapter id {0}")]
    Duplicate(String),
    #[error("inconsistent page sequence: {0}")]
    InconsistentPageSequence(String),
    #[error("{0} is empty")]
    Empty(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("script failed: {0}")]
    Script(String),
    #[error("missing result: script did not assign {0:?}")]
    MissingResult(String),
    #[error("could not convert script result: {0}")]
    Conversion(String),
}

/// Everything that can stop a chapter list or page list from resolving.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
