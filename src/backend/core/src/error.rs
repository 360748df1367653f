//! Error handling for the Talentum job engine.
//!
//! This module provides:
//! - A single crate-wide error type with machine-readable codes
//! - User-friendly messages vs detailed internal messages
//! - Retryability classification used by the retry coordinator
//! - Error logging with tracing integration
//! - Metrics integration for error tracking

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, TalentumError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic
/// error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Registry errors
    UnknownJob,
    DuplicateJob,

    // Broker errors
    BrokerUnavailable,
    BrokerError,
    MessageNotFound,

    // Execution errors
    HandlerTransient,
    HandlerPermanent,
    DeadlineExceeded,
    RetryExhausted,

    // Serialization errors
    SerializationError,
    DeserializationError,

    // Configuration errors
    ConfigurationError,
    InvalidConfiguration,

    // Internal errors
    InternalError,
}

impl ErrorCode {
    /// Check if an error with this code is safe to retry.
    ///
    /// Only transport-level and explicitly transient failures qualify;
    /// everything else is treated as permanent so the engine never
    /// blindly retries an unexpected error.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable
                | Self::BrokerError
                | Self::HandlerTransient
                | Self::DeadlineExceeded
        )
    }

    /// Get the error category for grouping in logs and metrics.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::UnknownJob | Self::DuplicateJob => "registry",
            Self::BrokerUnavailable | Self::BrokerError | Self::MessageNotFound => "broker",
            Self::HandlerTransient
            | Self::HandlerPermanent
            | Self::DeadlineExceeded
            | Self::RetryExhausted => "execution",
            Self::SerializationError | Self::DeserializationError => "serialization",
            Self::ConfigurationError | Self::InvalidConfiguration => "configuration",
            Self::InternalError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (unknown job names, duplicate registrations)
    Low,
    /// Operational issues (transient handler failures, deadlines)
    Medium,
    /// System errors (broker failures, exhausted retries)
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::UnknownJob | ErrorCode::DuplicateJob | ErrorCode::MessageNotFound => {
                Self::Low
            }

            ErrorCode::HandlerTransient
            | ErrorCode::DeadlineExceeded
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::Medium,

            ErrorCode::BrokerUnavailable
            | ErrorCode::BrokerError
            | ErrorCode::HandlerPermanent
            | ErrorCode::RetryExhausted
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InternalError => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the Talentum job engine.
#[derive(Error, Debug)]
pub struct TalentumError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to surface to callers)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for TalentumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl TalentumError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create an unknown-job error for a submission or resolution miss.
    pub fn unknown_job(name: impl fmt::Display) -> Self {
        Self::new(ErrorCode::UnknownJob, format!("Unknown job: {}", name))
    }

    /// Create a duplicate-registration error.
    pub fn duplicate_job(name: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::DuplicateJob,
            format!("Job already registered: {}", name),
        )
    }

    /// Create a broker-unavailable error.
    pub fn broker_unavailable(detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::BrokerUnavailable,
            "Job broker is unavailable",
            detail,
        )
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "talentum_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for TalentumError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (
                ErrorCode::BrokerUnavailable,
                "Unable to connect to job broker",
            )
        } else if error.is_timeout() {
            (ErrorCode::BrokerUnavailable, "Broker operation timed out")
        } else {
            (ErrorCode::BrokerError, "A broker error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for TalentumError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for TalentumError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::DeadlineExceeded,
            "Operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for TalentumError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An I/O error occurred",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<anyhow::Error> for TalentumError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<TalentumError>() {
            Ok(engine_error) => engine_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for TalentumError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::ConfigurationError,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (
                ErrorCode::ConfigurationError,
                "Configuration error occurred",
            ),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::BrokerUnavailable.is_retryable());
        assert!(ErrorCode::HandlerTransient.is_retryable());
        assert!(ErrorCode::DeadlineExceeded.is_retryable());
        assert!(!ErrorCode::UnknownJob.is_retryable());
        assert!(!ErrorCode::HandlerPermanent.is_retryable());
        assert!(!ErrorCode::RetryExhausted.is_retryable());
    }

    #[test]
    fn test_error_creation() {
        let error = TalentumError::unknown_job("does_not_exist");
        assert_eq!(error.code(), ErrorCode::UnknownJob);
        assert!(!error.is_retryable());
        assert!(error.user_message().contains("does_not_exist"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::UnknownJob),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::HandlerTransient),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::BrokerUnavailable),
            ErrorSeverity::High
        );
    }

    #[test]
    fn test_error_display() {
        let error = TalentumError::with_internal(
            ErrorCode::BrokerUnavailable,
            "Job broker is unavailable",
            "Connection refused: localhost:6379",
        );

        let display = format!("{}", error);
        assert!(display.contains("BrokerUnavailable"));
        assert!(display.contains("Connection refused"));
    }

    #[test]
    fn test_error_category() {
        assert_eq!(ErrorCode::UnknownJob.category(), "registry");
        assert_eq!(ErrorCode::BrokerUnavailable.category(), "broker");
        assert_eq!(ErrorCode::DeadlineExceeded.category(), "execution");
        assert_eq!(ErrorCode::ConfigurationError.category(), "configuration");
    }
}
