use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ledger::{LedgerError, RevertCode};

/// EIP-1193 "user rejected request" provider code.
const USER_REJECTED_RPC_CODE: i64 = 4001;

/// Closed set of failure categories surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UserRejected,
    InsufficientCollateral,
    InsufficientBalance,
    AllowanceInsufficient,
    VaultNotFound,
    GasOrNetwork,
    Unknown,
}

impl ErrorCategory {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::UserRejected => "user_rejected",
            ErrorCategory::InsufficientCollateral => "insufficient_collateral",
            ErrorCategory::InsufficientBalance => "insufficient_balance",
            ErrorCategory::AllowanceInsufficient => "allowance_insufficient",
            ErrorCategory::VaultNotFound => "vault_not_found",
            ErrorCategory::GasOrNetwork => "gas_or_network",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Actionable hint shown instead of the raw provider error.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorCategory::UserRejected => "transaction rejected in wallet",
            ErrorCategory::InsufficientCollateral => "insufficient collateral - deposit more first",
            ErrorCategory::InsufficientBalance => "insufficient balance for this amount",
            ErrorCategory::AllowanceInsufficient => "MUSD allowance too low - approve the vault first",
            ErrorCategory::VaultNotFound => "no vault found - deposit collateral to open one",
            ErrorCategory::GasOrNetwork => "network or gas problem - try again shortly",
            ErrorCategory::Unknown => "unexpected error",
        }
    }
}

/// A ledger failure mapped onto [`ErrorCategory`], keeping the raw message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// User-facing text. `Unknown` always includes the raw message.
    pub fn user_message(&self) -> String {
        match self.category {
            ErrorCategory::Unknown => format!("{}: {}", self.category.hint(), self.message),
            _ => self.category.hint().to_string(),
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.category.hint(), self.message)
    }
}

/// Maps a raw ledger failure onto the error taxonomy.
///
/// Explicit variants and revert codes win. Message patterns are consulted
/// only when the provider gave nothing structured.
pub fn classify(error: &LedgerError) -> ClassifiedError {
    let message = error.to_string();
    let category = match error {
        LedgerError::UserRejected => ErrorCategory::UserRejected,
        LedgerError::Reverted {
            code: Some(code), ..
        } => category_for_revert(*code),
        LedgerError::Rpc { code, .. } if *code == USER_REJECTED_RPC_CODE => ErrorCategory::UserRejected,
        LedgerError::Reverted { reason, .. } => classify_message(reason),
        LedgerError::Rpc { message, .. } => classify_message(message),
        LedgerError::Transport(message) => match classify_message(message) {
            ErrorCategory::Unknown => ErrorCategory::GasOrNetwork,
            category => category,
        },
    };
    ClassifiedError { category, message }
}

fn category_for_revert(code: RevertCode) -> ErrorCategory {
    match code {
        RevertCode::InsufficientCollateral => ErrorCategory::InsufficientCollateral,
        RevertCode::InsufficientBalance => ErrorCategory::InsufficientBalance,
        RevertCode::AllowanceExceeded => ErrorCategory::AllowanceInsufficient,
        RevertCode::VaultNotFound => ErrorCategory::VaultNotFound,
    }
}

// Order matters: "insufficient funds for gas" must hit the gas rule before
// the generic balance rule.
const MESSAGE_RULES: &[(&[&str], ErrorCategory)] = &[
    (
        &["user rejected", "user denied", "rejected by user", "request rejected"],
        ErrorCategory::UserRejected,
    ),
    (
        &["insufficient funds for gas", "gas required exceeds", "out of gas", "intrinsic gas", "max fee per gas", "nonce too low", "replacement transaction underpriced"],
        ErrorCategory::GasOrNetwork,
    ),
    (
        &["insufficient collateral", "collateral ratio", "below minimum", "icr < mcr", "undercollateralized"],
        ErrorCategory::InsufficientCollateral,
    ),
    (
        &["allowance"],
        ErrorCategory::AllowanceInsufficient,
    ),
    (
        &["insufficient balance", "exceeds balance", "insufficient funds"],
        ErrorCategory::InsufficientBalance,
    ),
    (
        &["vault not found", "vault does not exist", "trove does not exist", "not active"],
        ErrorCategory::VaultNotFound,
    ),
    (
        &["network", "timeout", "timed out", "connection", "failed to fetch", "rate limit", "429", "503"],
        ErrorCategory::GasOrNetwork,
    ),
];

fn classify_message(message: &str) -> ErrorCategory {
    let lowered = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|pattern| lowered.contains(pattern)))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}
