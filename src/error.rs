use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RumErrorKind {
    BadValue,
    InternalError,
    NotSupported,
    ProgramLimitExceeded,
    FeatureNotSupported,
    Retryable,
    QueryCanceled,
}

impl fmt::Display for RumErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RumErrorKind::BadValue => "bad value",
            RumErrorKind::InternalError => "internal error",
            RumErrorKind::NotSupported => "not supported",
            RumErrorKind::ProgramLimitExceeded => "program limit exceeded",
            RumErrorKind::FeatureNotSupported => "feature not supported",
            RumErrorKind::Retryable => "retryable",
            RumErrorKind::QueryCanceled => "query canceled",
        };
        f.write_str(name)
    }
}

/// Error raised by the index. `detail_log` carries extra context meant for
/// the server log rather than the client.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RumError {
    pub kind: RumErrorKind,
    pub message: String,
    pub detail_log: Option<String>,
}

pub type RumResult<T> = Result<T, RumError>;

impl RumError {
    pub fn new(kind: RumErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail_log: None,
        }
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(RumErrorKind::BadValue, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RumErrorKind::InternalError, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(RumErrorKind::NotSupported, message)
    }

    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(RumErrorKind::ProgramLimitExceeded, message)
    }

    pub fn feature_not_supported(message: impl Into<String>) -> Self {
        Self::new(RumErrorKind::FeatureNotSupported, message)
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(RumErrorKind::Retryable, message)
    }

    pub fn canceled() -> Self {
        Self::new(
            RumErrorKind::QueryCanceled,
            "canceling statement due to user request",
        )
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail_log = Some(detail.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == RumErrorKind::Retryable
    }
}
