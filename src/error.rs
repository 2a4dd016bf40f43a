//! Error types.
//!
//! Internally we use `anyhow` everywhere through the `Res` alias. At public boundaries the
//! `anyhow::Error` is wrapped in an `Error` that records which kind of failure occurred so that
//! callers (the CLI, the multi-owner runners) can decide what to do about it.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

/// Internal result type.
pub type Res<T> = std::result::Result<T, anyhow::Error>;

/// Public result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The kinds of failure the ledger distinguishes between.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Missing or invalid configuration or credentials. Fatal at process start.
    Config,
    /// The actor lacks a required capability.
    Authorization,
    /// The bank-data aggregator failed. Retry the run.
    Feed,
    /// The generative model failed. Retry the run.
    Model,
    /// A store read or a batch commit failed. The cursor was not advanced.
    Store,
    /// Input did not have the expected shape.
    Validation,
    /// Another run already holds the same (user, account) pair.
    Conflict,
    /// Anything else.
    Internal,
}

serde_plain::derive_display_from_serialize!(ErrorType);
serde_plain::derive_fromstr_from_deserialize!(ErrorType);

/// The public error type: an `ErrorType` plus the underlying error chain.
pub struct Error {
    error_type: ErrorType,
    inner: anyhow::Error,
}

impl Error {
    pub fn new(error_type: ErrorType, inner: anyhow::Error) -> Self {
        Self { error_type, inner }
    }

    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    /// Whether re-invoking the whole run is expected to help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.error_type,
            ErrorType::Feed | ErrorType::Model | ErrorType::Store
        )
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.error_type, self.inner)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {:#}", self.error_type, self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Error::new(ErrorType::Internal, value)
    }
}

/// Converts internal results into public results tagged with an `ErrorType`.
pub trait IntoResult<T> {
    fn pub_result(self, error_type: ErrorType) -> Result<T>;
}

impl<T> IntoResult<T> for Res<T> {
    fn pub_result(self, error_type: ErrorType) -> Result<T> {
        self.map_err(|e| Error::new(error_type, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_pub_result_tags_error_type() {
        let res: Res<()> = Err(anyhow!("batch rejected"));
        let err = res.pub_result(ErrorType::Store).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Store);
        assert!(err.is_transient());
        assert!(err.to_string().contains("batch rejected"));
    }

    #[test]
    fn test_config_errors_are_not_transient() {
        let err = Error::new(ErrorType::Config, anyhow!("missing secret"));
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "config error: missing secret");
    }
}
