//! Stream error types and error categorization
//!
//! Consumer-side errors never leave the worker loop; publish-side errors are
//! returned to the caller. Handler failures are categorized to decide whether
//! the retry budget applies:
//! - **Transient**: leave the entry pending and retry up to `retry_count` times
//! - **Permanent**: skip the remaining budget, apply the exhaustion policy now

use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Category of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCategory {
    /// Temporary failure, worth redelivering.
    #[default]
    Transient,
    /// Unrecoverable, redelivery cannot help.
    Permanent,
}

/// Error returned by a [`StreamHandler`](crate::StreamHandler).
#[derive(Debug)]
pub struct HandlerError {
    message: String,
    category: ErrorCategory,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl HandlerError {
    /// A transient failure; the entry will be redelivered while budget remains.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Transient,
            source: None,
        }
    }

    /// A permanent failure; the entry goes straight to the exhaustion policy.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Permanent,
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn is_permanent(&self) -> bool {
        self.category == ErrorCategory::Permanent
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for HandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::permanent(format!("invalid payload: {err}")).with_source(err)
    }
}

/// Stream errors
#[derive(Error, Debug)]
pub enum StreamError {
    /// Blank or missing mandatory parameters. No I/O was performed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A connection could not be leased or established
    #[error("Connection error: {0}")]
    Connection(String),

    /// Redis command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The registered handler failed
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected error escaping the worker loop
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    pub fn validation(message: impl Into<String>) -> Self {
        StreamError::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        StreamError::Config(message.into())
    }

    /// Whether the store could not be reached at all.
    pub fn is_connection_error(&self) -> bool {
        match self {
            StreamError::Connection(_) => true,
            StreamError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout()
            }
            _ => false,
        }
    }

    /// Whether the consumer group (or its stream) disappeared under us.
    pub fn is_nogroup_error(&self) -> bool {
        match self {
            StreamError::Redis(e) => e.to_string().contains("NOGROUP"),
            StreamError::Connection(_) => false,
            other => other.to_string().contains("NOGROUP"),
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

impl From<core_config::ConfigError> for StreamError {
    fn from(err: core_config::ConfigError) -> Self {
        StreamError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_categories() {
        assert!(!HandlerError::transient("try again").is_permanent());
        assert!(HandlerError::permanent("bad data").is_permanent());
        assert_eq!(ErrorCategory::default(), ErrorCategory::Transient);
    }

    #[test]
    fn test_handler_error_source_chain() {
        let io = std::io::Error::other("socket closed");
        let err = HandlerError::transient("downstream unavailable").with_source(io);

        assert_eq!(err.to_string(), "downstream unavailable");
        assert_eq!(err.source().unwrap().to_string(), "socket closed");
    }

    #[test]
    fn test_serde_errors_are_permanent() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: HandlerError = parse.into();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_error_classification() {
        assert!(StreamError::Connection("pool exhausted".into()).is_connection_error());
        assert!(!StreamError::validation("group is blank").is_connection_error());
        assert!(StreamError::Internal("NOGROUP No such key".into()).is_nogroup_error());
        assert!(!StreamError::config("missing").is_nogroup_error());
    }
}
