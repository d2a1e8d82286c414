use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::models::ProviderId;

/// Run-level error types.
///
/// Only `Config` is fatal to a whole run; everything a provider does wrong is
/// recovered inside the orchestrator and never surfaces as an `AppError`.
#[derive(Debug)]
pub enum AppError {
    /// Missing credential or malformed configuration value.
    Config(String),
    /// Malformed candidate record.
    Validation(String),
    /// Error returned by a provider adapter.
    Provider(ProviderError),
    /// Attempted to move a lead through an illegal stage transition.
    InvalidTransition(String),
    /// Filesystem error (batch runner input).
    Io(std::io::Error),
    /// JSON (de)serialization error.
    Serialization(serde_json::Error),
    /// Internal invariant violation.
    Internal(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::Provider(e) => write!(f, "Provider error: {}", e),
            AppError::InvalidTransition(msg) => write!(f, "Invalid lead transition: {}", msg),
            AppError::Io(e) => write!(f, "I/O error: {}", e),
            AppError::Serialization(e) => write!(f, "Serialization error: {}", e),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Provider(e) => Some(e),
            AppError::Io(e) => Some(e),
            AppError::Serialization(e) => Some(e),
            AppError::WithContext { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl AppError {
    /// True when the error should stop the whole run.
    pub fn is_fatal(&self) -> bool {
        match self {
            AppError::Config(_) => true,
            AppError::Provider(ProviderError::MissingCredential(_)) => true,
            AppError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::MissingCredential(provider) => AppError::Config(format!(
                "missing credential for provider '{}'",
                provider
            )),
            other => AppError::Provider(other),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err)
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<AppError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e.into()),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e.into()),
            context: f(),
        })
    }
}

/// Failure of a single provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("authentication rejected by {0}")]
    Auth(ProviderId),

    #[error("no credential configured for {0}")]
    MissingCredential(ProviderId),

    #[error("{provider} rate limited the request")]
    RateLimited {
        provider: ProviderId,
        retry_after: Option<Duration>,
    },

    #[error("{0} timed out")]
    Timeout(ProviderId),

    #[error("network error talking to {provider}: {message}")]
    Network { provider: ProviderId, message: String },

    #[error("{provider} returned status {status}: {message}")]
    Upstream {
        provider: ProviderId,
        status: u16,
        message: String,
    },

    #[error("{provider} rejected the query: {message}")]
    Rejected { provider: ProviderId, message: String },

    #[error("failed to decode {provider} response: {message}")]
    Decode { provider: ProviderId, message: String },

    #[error("circuit open for {0}")]
    CircuitOpen(ProviderId),

    #[error("budget exhausted before calling {provider}: {reason}")]
    BudgetExceeded {
        provider: ProviderId,
        reason: BudgetError,
    },

    #[error("{0} disabled for this run after an authentication failure")]
    Disabled(ProviderId),

    #[error("call to {0} cancelled")]
    Cancelled(ProviderId),
}

impl ProviderError {
    /// Errors worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_)
            | ProviderError::Network { .. } => true,
            ProviderError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Errors that count as a failure for the provider's circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        self.is_retryable()
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Auth(_) | ProviderError::Disabled(_) => ErrorKind::Auth,
            ProviderError::MissingCredential(_) => ErrorKind::Config,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimit,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::Network { .. } => ErrorKind::Network,
            ProviderError::Upstream { .. }
            | ProviderError::Rejected { .. }
            | ProviderError::Decode { .. } => ErrorKind::Upstream,
            ProviderError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            ProviderError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            ProviderError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn provider(&self) -> &ProviderId {
        match self {
            ProviderError::Auth(p)
            | ProviderError::MissingCredential(p)
            | ProviderError::Timeout(p)
            | ProviderError::CircuitOpen(p)
            | ProviderError::Disabled(p)
            | ProviderError::Cancelled(p) => p,
            ProviderError::RateLimited { provider, .. }
            | ProviderError::Network { provider, .. }
            | ProviderError::Upstream { provider, .. }
            | ProviderError::Rejected { provider, .. }
            | ProviderError::Decode { provider, .. }
            | ProviderError::BudgetExceeded { provider, .. } => provider,
        }
    }
}

/// Why the ledger refused a debit.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetError {
    #[error("per-lead cost cap reached")]
    PerLeadCapExceeded,
    #[error("session budget exhausted")]
    GlobalBudgetExceeded,
}

/// Coarse error taxonomy used for run statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Config,
    RateLimit,
    Timeout,
    Network,
    Upstream,
    CircuitOpen,
    BudgetExceeded,
    Validation,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Config => "config",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Upstream => "upstream",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Validation => "validation",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
