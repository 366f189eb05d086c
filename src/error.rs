use thiserror::Error;

use crate::classifier::{ClassifiedError, ErrorCategory};
use crate::models::{TransactionKind, TransactionStatus, U256};

#[derive(Error, Debug, Clone)]
pub enum VaultError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient balance: available={available}, required={required}")]
    InsufficientBalance { available: U256, required: U256 },

    #[error("Insufficient collateral: resulting ratio {resulting_ratio}% is below the {minimum_ratio}% minimum")]
    InsufficientCollateral {
        resulting_ratio: String,
        minimum_ratio: u64,
    },

    #[error("Withdrawal exceeds limit: requested={requested}, max_withdrawable={max_withdrawable}")]
    WithdrawalExceedsLimit {
        requested: U256,
        max_withdrawable: U256,
    },

    #[error("Vault busy: a {active:?} transaction is already in flight")]
    Busy { active: TransactionKind },

    #[error("{0}")]
    Ledger(ClassifiedError),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Partial refresh: {} field(s) kept stale values: {}", failed_fields.len(), failed_fields.join(", "))]
    PartialRefresh { failed_fields: Vec<String> },

    #[error("Invalid transaction transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl VaultError {
    /// Taxonomy category shown to the user, if the error belongs to one.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            VaultError::InsufficientBalance { .. } => Some(ErrorCategory::InsufficientBalance),
            VaultError::InsufficientCollateral { .. } | VaultError::WithdrawalExceedsLimit { .. } => {
                Some(ErrorCategory::InsufficientCollateral)
            }
            VaultError::Ledger(classified) => Some(classified.category),
            VaultError::Timeout(_) => Some(ErrorCategory::GasOrNetwork),
            _ => None,
        }
    }

    /// True for errors raised locally before anything reached the ledger.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            VaultError::InvalidAmount(_)
                | VaultError::InsufficientBalance { .. }
                | VaultError::InsufficientCollateral { .. }
                | VaultError::WithdrawalExceedsLimit { .. }
                | VaultError::Busy { .. }
        )
    }
}

impl From<ClassifiedError> for VaultError {
    fn from(classified: ClassifiedError) -> Self {
        VaultError::Ledger(classified)
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
