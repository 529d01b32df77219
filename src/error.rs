//! Error types for the market-data gateway

use thiserror::Error;

/// Broad classification of a [`GatewayError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthFailure,
    UpstreamUnreachable,
    UpstreamRejected,
    RateLimited,
    InvalidResponse,
    InvalidRequest,
    Config,
}

/// Errors surfaced by the token-guarded client and the gateway fetch functions
///
/// Messages carry enough upstream context to tell "down" from "rejected" from
/// "bad credentials", but never the credential values themselves.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Token could not be obtained after the bounded retries
    #[error("upstream authentication failed (HTTP {status}): {hint}")]
    AuthFailure { status: u16, hint: String },

    /// Network or HTTP-level failure
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Business-level failure embedded in an otherwise successful response
    #[error("upstream rejected request ({code}): {message}")]
    UpstreamRejected { code: String, message: String },

    /// Upstream asked us to slow down
    #[error("upstream rate limit exceeded")]
    RateLimited,

    /// Response could not be decoded
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// Caller supplied unusable parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Gateway is misconfigured or closed
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Creates an UpstreamUnreachable error
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnreachable(msg.into())
    }

    /// Creates an InvalidResponse error
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Creates an InvalidRequest error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Creates a Config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthFailure { .. } => ErrorKind::AuthFailure,
            Self::UpstreamUnreachable(_) => ErrorKind::UpstreamUnreachable,
            Self::UpstreamRejected { .. } => ErrorKind::UpstreamRejected,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// HTTP-equivalent status for a request-handling layer
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Config => 500,
            _ => 502,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        // URLs may carry API keys in their query string
        Self::UpstreamUnreachable(err.without_url().to_string())
    }
}

/// Errors returned by cache writes and key construction
///
/// Reads never fail: an unreadable entry is reported as absent.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),
}

/// Failure classes reported by a polling source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    /// Upstream signalled a rate limit, possibly inside a 200 body
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Retryable failure; the adapter backs off and tries again
    #[error("transient error: {0}")]
    Transient(String),

    /// Configuration-level failure; terminates the adapter
    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Errors from the optional external relay
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("relay codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
