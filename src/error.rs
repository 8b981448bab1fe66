// =============================================================================
// Feed Error Taxonomy
// =============================================================================
//
// Nothing in the market-data core is fatal.  Every failure is classified into
// one of a handful of kinds, reported to the diagnostics sink, and degraded to
// an empty / no-op result by the caller.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

/// Coarse classification used by diagnostics and the API error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Transport,
    Malformed,
    InvalidSymbol,
    Listener,
    Sink,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Malformed => write!(f, "malformed"),
            Self::InvalidSymbol => write!(f, "invalid_symbol"),
            Self::Listener => write!(f, "listener"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    /// Connect / request / read failure below the HTTP or WebSocket layer.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The exchange answered with a non-success HTTP status.
    #[error("exchange returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The request weight budget is exhausted; the call was not sent.
    #[error("request weight {used} at or above limit {limit}")]
    RateLimited { used: u32, limit: u32 },

    /// A payload could not be parsed into the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown symbol {0}")]
    InvalidSymbol(String),

    /// A fan-out listener returned an error or panicked.
    #[error("listener {id} failed: {reason}")]
    Listener { id: u64, reason: String },

    /// The render sink refused a point (e.g. out of order).
    #[error("render sink rejected update: {0}")]
    Sink(String),
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Status { .. } | Self::RateLimited { .. } => {
                ErrorKind::Transport
            }
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::InvalidSymbol(_) => ErrorKind::InvalidSymbol,
            Self::Listener { .. } => ErrorKind::Listener,
            Self::Sink(_) => ErrorKind::Sink,
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_rate_limit_are_transport_failures() {
        let status = FeedError::Status {
            status: 503,
            body: "unavailable".into(),
        };
        assert_eq!(status.kind(), ErrorKind::Transport);
        let limited = FeedError::RateLimited {
            used: 1000,
            limit: 1000,
        };
        assert_eq!(limited.kind(), ErrorKind::Transport);
    }

    #[test]
    fn json_errors_classify_as_malformed() {
        let err: FeedError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(err.to_string().starts_with("malformed payload"));
    }
}
