//! Engine Error Types
//!
//! One taxonomy shared by the ledger, spend, liquidation, command, execution
//! and reconciliation modules. Callers map `code()` / `http_status()` onto
//! their own transport.

use thiserror::Error;

use crate::core_types::Cents;
use crate::providers::ProviderError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    // === Validation Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Could not parse command: {0}")]
    Parse(String),

    #[error("Entry does not balance (postings sum to {sum})")]
    UnbalancedEntry { sum: Cents },

    #[error("Quote has expired")]
    QuoteExpired,

    // === Authorization Errors ===
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Account is frozen{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    FrozenAccount { reason: Option<String> },

    #[error("Step-up authentication required")]
    StepUpRequired,

    // === Business Errors ===
    #[error("Insufficient spend power: required {required}, available {available}")]
    InsufficientSpendPower { required: Cents, available: Cents },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Command still in progress: {0}")]
    CommandInProgress(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    // === External Errors ===
    #[error("Provider timed out: {0}")]
    ProviderTimeout(String),

    #[error("Provider error: {0}")]
    Provider(String),

    // === System Errors ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal system error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Parse(_) => "PARSE_ERROR",
            EngineError::UnbalancedEntry { .. } => "UNBALANCED_ENTRY",
            EngineError::QuoteExpired => "QUOTE_EXPIRED",
            EngineError::Unauthorized(_) => "UNAUTHORIZED",
            EngineError::FrozenAccount { .. } => "ACCOUNT_FROZEN",
            EngineError::StepUpRequired => "STEP_UP_REQUIRED",
            EngineError::InsufficientSpendPower { .. } => "INSUFFICIENT_SPEND_POWER",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::CommandInProgress(_) => "COMMAND_IN_PROGRESS",
            EngineError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            EngineError::ProviderTimeout(_) => "PROVIDER_TIMEOUT",
            EngineError::Provider(_) => "PROVIDER_ERROR",
            EngineError::Database(_) => "DATABASE_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_)
            | EngineError::Parse(_)
            | EngineError::UnbalancedEntry { .. }
            | EngineError::QuoteExpired => 400,
            EngineError::Unauthorized(_) | EngineError::StepUpRequired => 401,
            EngineError::FrozenAccount { .. } => 403,
            EngineError::NotFound(_) => 404,
            EngineError::CommandInProgress(_) => 409,
            EngineError::InsufficientSpendPower { .. } => 422,
            EngineError::InvalidStateTransition(_)
            | EngineError::Database(_)
            | EngineError::Internal(_) => 500,
            EngineError::Provider(_) => 502,
            EngineError::ProviderTimeout(_) => 504,
        }
    }

    /// Whether the caller (or an internal worker) may retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderTimeout(_)
                | EngineError::Provider(_)
                | EngineError::Database(_)
                | EngineError::CommandInProgress(_)
        )
    }

    /// Authorization-class failures are surfaced separately from generic failures
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            EngineError::Unauthorized(_)
                | EngineError::FrozenAccount { .. }
                | EngineError::StepUpRequired
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization: {e}"))
    }
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Timeout(op) => EngineError::ProviderTimeout(op),
            other => EngineError::Provider(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
