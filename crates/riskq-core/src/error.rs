use std::sync::Arc;

use thiserror::Error;

/// Canonical error type for report resolution and query execution.
///
/// Every variant is local to the request that produced it. Background refresh
/// failures are logged by the remote cache and never surface here.
#[derive(Debug, Error)]
pub enum RiskError {
    /// No report file of the requested type exists in any backend.
    #[error("no report file found for report type `{report_type}`")]
    NotFound {
        /// Report type that failed to resolve.
        report_type: String,
    },

    /// The remote backend never produced a usable copy of the report type.
    #[error("remote backend unavailable for `{report_type}`: {message}")]
    UpstreamUnavailable {
        /// Report type that has no fetched copy.
        report_type: String,
        /// Last failure reported by the backend.
        message: String,
    },

    /// The pagination token could not be decoded.
    #[error("malformed cursor: {0}")]
    MalformedCursor(String),

    /// The pagination token decodes but no longer matches the live file or query.
    #[error("stale cursor: {0}")]
    StaleCursor(String),

    /// The query names unknown columns or carries out-of-range parameters.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// I/O error while reading report files or the cache directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The report file could not be parsed as tab-separated text.
    #[error("report parse error: {0}")]
    Parse(String),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error code exposed to the routing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    UpstreamUnavailable,
    MalformedCursor,
    StaleCursor,
    InvalidQuery,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::MalformedCursor => "malformed_cursor",
            Self::StaleCursor => "stale_cursor",
            Self::InvalidQuery => "invalid_query",
            Self::Internal => "internal",
        }
    }
}

impl RiskError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(report_type: impl Into<String>) -> Self {
        Self::NotFound {
            report_type: report_type.into(),
        }
    }

    /// Creates an `UpstreamUnavailable` variant.
    #[must_use]
    pub fn upstream_unavailable(report_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            report_type: report_type.into(),
            message: message.into(),
        }
    }

    /// Creates an `InvalidQuery` variant.
    #[must_use]
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery(message.into())
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Error code the routing layer maps to a status code.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::MalformedCursor(_) => ErrorKind::MalformedCursor,
            Self::StaleCursor(_) => ErrorKind::StaleCursor,
            Self::InvalidQuery(_) => ErrorKind::InvalidQuery,
            Self::Io(_) | Self::Parse(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Recovers an owned error from one shared between coalesced callers.
    ///
    /// Single-flight caches hand the same failure to every waiter behind an
    /// `Arc`; the last holder gets the original value back, the others a copy.
    #[must_use]
    pub fn from_shared(err: Arc<RiskError>) -> Self {
        Arc::try_unwrap(err).unwrap_or_else(|shared| match shared.as_ref() {
            Self::NotFound { report_type } => Self::not_found(report_type.clone()),
            Self::UpstreamUnavailable {
                report_type,
                message,
            } => Self::upstream_unavailable(report_type.clone(), message.clone()),
            Self::MalformedCursor(msg) => Self::MalformedCursor(msg.clone()),
            Self::StaleCursor(msg) => Self::StaleCursor(msg.clone()),
            Self::InvalidQuery(msg) => Self::InvalidQuery(msg.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Parse(msg) => Self::Parse(msg.clone()),
            Self::Internal(msg) => Self::Internal(msg.clone()),
        })
    }
}

impl From<csv::Error> for RiskError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            match err.into_kind() {
                csv::ErrorKind::Io(io) => Self::Io(io),
                other => Self::Parse(format!("{other:?}")),
            }
        } else {
            Self::Parse(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RiskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {err}"))
    }
}

/// Convenient result alias for engine operations.
pub type RiskResult<T> = Result<T, RiskError>;
