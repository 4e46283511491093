//! # Error Module
//!
//! Failure taxonomy and the process-wide error recorder for the data plane.
//!
//! ## Taxonomy
//!
//! Every failure that crosses a component boundary is an [`ApiError`] tagged
//! with an [`ErrorKind`]. The kind decides three things callers care about:
//!
//! - **Severity**: how loud the failure is (see [`Severity`])
//! - **Retryability**: whether the scheduler may re-run the request
//! - **User message**: a pre-mapped human string the host may surface
//!
//! | Kind                  | Severity | Retryable |
//! |-----------------------|----------|-----------|
//! | `NETWORK_ERROR`       | error    | yes       |
//! | `TIMEOUT`             | warn     | yes       |
//! | `RATE_LIMITED`        | info     | yes       |
//! | `AUTH_ERROR`          | error    | no        |
//! | `SERVER_ERROR`        | error    | yes       |
//! | `CLIENT_ERROR`        | warn     | no        |
//! | `PRIVATE_LIST`        | info     | no        |
//! | `INVALID_CONFIG`      | warn     | no        |
//! | `SERVICE_UNAVAILABLE` | error    | no        |
//! | `CANCELLED`           | info     | no        |
//! | `UNKNOWN_ERROR`       | warn     | no        |
//!
//! ## Recording and recovery
//!
//! [`ErrorCore`] keeps a bounded history of entries, correlates repeated
//! failures by fingerprint, rate-limits user notifications and runs named
//! recovery strategies around fallible operations via [`ErrorCore::guard`].

pub mod error_core;
pub mod fingerprint;
mod journal;
pub mod metrics;
pub mod notify;
pub mod recovery;
pub mod sanitize;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use error_core::{
    AlertThresholds, ErrorContext, ErrorCore, ErrorCoreConfig, ErrorDump, ErrorEntry, ErrorHealth,
    HealthState,
};
pub use notify::{ChannelNotifier, Notifier, TracingNotifier, UserNotice};
pub use recovery::{DegradedResponse, GuardOutcome, Recovery, RecoveryStrategy, RetryOptions};

/// Total order of error severities, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Debug,
        Severity::Info,
        Severity::Warn,
        Severity::Error,
        Severity::Fatal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes, orthogonal to the provider that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NetworkError,
    Timeout,
    RateLimited,
    AuthError,
    ServerError,
    ClientError,
    PrivateList,
    InvalidConfig,
    ServiceUnavailable,
    Cancelled,
    UnknownError,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::ClientError => "CLIENT_ERROR",
            ErrorKind::PrivateList => "PRIVATE_LIST",
            ErrorKind::InvalidConfig => "INVALID_CONFIG",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn from_code(code: &str) -> Option<ErrorKind> {
        let kind = match code {
            "NETWORK_ERROR" => ErrorKind::NetworkError,
            "TIMEOUT" => ErrorKind::Timeout,
            "RATE_LIMITED" => ErrorKind::RateLimited,
            "AUTH_ERROR" => ErrorKind::AuthError,
            "SERVER_ERROR" => ErrorKind::ServerError,
            "CLIENT_ERROR" => ErrorKind::ClientError,
            "PRIVATE_LIST" => ErrorKind::PrivateList,
            "INVALID_CONFIG" => ErrorKind::InvalidConfig,
            "SERVICE_UNAVAILABLE" => ErrorKind::ServiceUnavailable,
            "CANCELLED" => ErrorKind::Cancelled,
            "UNKNOWN_ERROR" => ErrorKind::UnknownError,
            _ => return None,
        };
        Some(kind)
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::NetworkError
            | ErrorKind::AuthError
            | ErrorKind::ServerError
            | ErrorKind::ServiceUnavailable => Severity::Error,
            ErrorKind::Timeout
            | ErrorKind::ClientError
            | ErrorKind::InvalidConfig
            | ErrorKind::UnknownError => Severity::Warn,
            ErrorKind::RateLimited | ErrorKind::PrivateList | ErrorKind::Cancelled => Severity::Info,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkError
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
        )
    }

    /// Failures that count against a provider's circuit breaker.
    pub fn trips_breaker(self) -> bool {
        matches!(self, ErrorKind::NetworkError | ErrorKind::ServerError)
    }

    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "Network connection failed. Check your internet connection.",
            ErrorKind::Timeout => "The request took too long. Please try again.",
            ErrorKind::RateLimited => "Too many requests. Please wait a moment.",
            ErrorKind::AuthError => "Authentication failed. Please log in again.",
            ErrorKind::ServerError => "The service is having problems. Please try again later.",
            ErrorKind::ClientError => "The request was rejected by the service.",
            ErrorKind::PrivateList => "This list is private.",
            ErrorKind::InvalidConfig => "The code block configuration is invalid.",
            ErrorKind::ServiceUnavailable => "The service is temporarily unavailable.",
            ErrorKind::Cancelled => "The request was cancelled.",
            ErrorKind::UnknownError => "An unexpected error occurred.",
        }
    }

    /// Best-effort classification of a free-form failure message.
    pub fn classify_message(message: &str) -> ErrorKind {
        let lower = message.to_lowercase();
        if lower.contains("private") || lower.contains("permission") {
            ErrorKind::PrivateList
        } else if lower.contains("timed out") || lower.contains("timeout") {
            ErrorKind::Timeout
        } else if lower.contains("too many requests") || lower.contains("rate limit") || lower.contains("429") {
            ErrorKind::RateLimited
        } else if lower.contains("unauthorized") || lower.contains("401") || lower.contains("invalid token") {
            ErrorKind::AuthError
        } else if lower.contains("network") || lower.contains("connection") || lower.contains("dns") {
            ErrorKind::NetworkError
        } else if lower.contains("500") || lower.contains("502") || lower.contains("503") || lower.contains("internal server") {
            ErrorKind::ServerError
        } else {
            ErrorKind::UnknownError
        }
    }

    /// Classifies an HTTP status. `body` disambiguates provider-specific
    /// privacy failures that arrive as 403/404.
    pub fn from_status(status: u16, body: &str) -> Option<ErrorKind> {
        let lower = body.to_lowercase();
        let kind = match status {
            200..=399 => return None,
            401 => ErrorKind::AuthError,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::ServerError,
            400..=499 if lower.contains("private") || lower.contains("permission") => ErrorKind::PrivateList,
            400..=499 => ErrorKind::ClientError,
            _ => ErrorKind::UnknownError,
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Typed failure returned by every data-plane operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            provider: None,
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("request timed out after {}", humantime::format_duration(after)),
        )
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, message)
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message).with_status(status)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn service_unavailable(provider: &str) -> Self {
        Self::new(
            ErrorKind::ServiceUnavailable,
            format!("circuit breaker open for provider '{provider}'"),
        )
        .with_provider(provider)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownError, message)
    }

    /// Builds an error from an HTTP status and response body. Returns `None`
    /// for non-error statuses.
    pub fn from_status(status: u16, body: &str) -> Option<Self> {
        let kind = ErrorKind::from_status(status, body)?;
        let snippet: String = body.chars().take(200).collect();
        Some(Self::new(kind, format!("HTTP {status}: {snippet}")).with_status(status))
    }

    /// Classifies an arbitrary message into the taxonomy.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::classify_message(&message), message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }

    /// Caller-facing summary `{type, severity, retryable, userMessage}`.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            error_type: self.kind,
            severity: self.severity(),
            retryable: self.is_retryable(),
            user_message: self.user_message().to_string(),
            message: self.message.clone(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::unknown(format!("invalid JSON payload: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub error_type: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub user_message: String,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
