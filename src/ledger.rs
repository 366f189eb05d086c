use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Address, TxHash, U256};

/// Revert reasons the vault contract reports with a stable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevertCode {
    InsufficientCollateral,
    InsufficientBalance,
    AllowanceExceeded,
    VaultNotFound,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("User rejected the request")]
    UserRejected,

    #[error("Execution reverted: {reason}")]
    Reverted {
        code: Option<RevertCode>,
        reason: String,
    },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    Confirmed,
    Reverted {
        code: Option<RevertCode>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: TxHash,
    pub outcome: TxOutcome,
}

impl TxReceipt {
    /// Turns a reverted receipt into the error the ledger would have raised.
    pub fn into_result(self) -> LedgerResult<TxHash> {
        match self.outcome {
            TxOutcome::Confirmed => Ok(self.hash),
            TxOutcome::Reverted { code, reason } => Err(LedgerError::Reverted { code, reason }),
        }
    }
}

/// Remote vault ledger for a single signing account.
///
/// Reads return 18-decimal fixed-point integers. Writes return as soon as the
/// transaction is submitted; `wait_for_receipt` resolves once it is mined.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Account that signs writes.
    fn account(&self) -> Address;

    /// Vault contract, the spender for MUSD allowances.
    fn vault_address(&self) -> Address;

    async fn get_collateral_balance(&self, account: &Address) -> LedgerResult<U256>;

    async fn get_borrowed_amount(&self, account: &Address) -> LedgerResult<U256>;

    async fn get_current_debt(&self, account: &Address) -> LedgerResult<U256>;

    async fn get_collateral_ratio(&self, account: &Address) -> LedgerResult<U256>;

    async fn get_interest_rate(&self) -> LedgerResult<U256>;

    async fn get_max_withdrawable(&self, account: &Address) -> LedgerResult<U256>;

    async fn get_allowance(&self, owner: &Address, spender: &Address) -> LedgerResult<U256>;

    /// MUSD price of one unit of collateral.
    async fn get_collateral_price(&self) -> LedgerResult<U256>;

    async fn get_musd_balance(&self, account: &Address) -> LedgerResult<U256>;

    async fn deposit_collateral(&self, amount: U256) -> LedgerResult<TxHash>;

    async fn borrow(&self, amount: U256) -> LedgerResult<TxHash>;

    async fn repay(&self, amount: U256) -> LedgerResult<TxHash>;

    async fn withdraw(&self, amount: U256) -> LedgerResult<TxHash>;

    async fn approve(&self, spender: &Address, amount: U256) -> LedgerResult<TxHash>;

    async fn wait_for_receipt(&self, hash: &TxHash) -> LedgerResult<TxReceipt>;
}
