use std::time::Duration;

use thiserror::Error;

use crate::domain::{AccountId, Currency};
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Account {account_id} holds {actual}, not {expected}")]
    CurrencyMismatch {
        account_id: AccountId,
        expected: Currency,
        actual: Currency,
    },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Transaction conflict after {attempts} attempt(s): {message}")]
    TransactionConflict { attempts: u32, message: String },

    #[error("Store unreachable: {0}")]
    Connectivity(String),

    #[error("Transfer did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(String),
}

/// Coarse classification callers map to their own responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    ConstraintViolation,
    TransactionConflict,
    ConnectivityFailure,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// Whether the same request may succeed if the caller tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransactionConflict | ErrorKind::ConnectivityFailure | ErrorKind::Timeout
        )
    }
}

impl AppError {
    pub fn account_not_found(id: AccountId) -> Self {
        AppError::NotFound {
            entity: "account",
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound { .. } => ErrorKind::NotFound,
            AppError::InvalidAmount(_)
            | AppError::InvalidArgument(_)
            | AppError::CurrencyMismatch { .. } => ErrorKind::InvalidArgument,
            AppError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            AppError::TransactionConflict { .. } => ErrorKind::TransactionConflict,
            AppError::Connectivity(_) => ErrorKind::ConnectivityFailure,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::Database(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => AppError::NotFound { entity, id },
            StoreError::ConstraintViolation(message) => AppError::ConstraintViolation(message),
            StoreError::Conflict(message) => AppError::TransactionConflict {
                attempts: 1,
                message,
            },
            StoreError::Connectivity(message) => AppError::Connectivity(message),
            StoreError::Query(message) => AppError::Database(message),
        }
    }
}
