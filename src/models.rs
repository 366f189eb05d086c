use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration as StdDuration;
use uuid::Uuid;

use crate::classifier::ErrorCategory;
use crate::error::{Result, VaultError};

pub use alloy_primitives::U256;

/// 10^18, the fixed-point scale of every amount crossing the ledger boundary.
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Minimum collateral ratio, in percent, enforced by the vault contract.
pub const MIN_COLLATERAL_RATIO_PERCENT: u64 = 110;

/// `MIN_COLLATERAL_RATIO_PERCENT` as a WAD-scaled percentage.
pub fn min_collateral_ratio_wad() -> U256 {
    U256::from(MIN_COLLATERAL_RATIO_PERCENT) * WAD
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Borrow,
    Repay,
    Withdraw,
    Approve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Idle,
    Submitted,
    Confirming,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Failed)
    }

    /// Transitions only move forward; terminal states accept nothing.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Idle, Submitted)
                | (Idle, Failed)
                | (Submitted, Confirming)
                | (Submitted, Failed)
                | (Confirming, Success)
                | (Confirming, Failed)
        )
    }
}

/// A single user-requested ledger write and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub amount: U256,
    pub status: TransactionStatus,
    pub hash: Option<TxHash>,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRequest {
    pub fn new(kind: TransactionKind, amount: U256) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            amount,
            status: TransactionStatus::Idle,
            hash: None,
            error: None,
            category: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, next: TransactionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(VaultError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves the request to `Failed`, recording the error for the caller.
    pub fn fail(&mut self, error: &VaultError) -> Result<()> {
        self.advance(TransactionStatus::Failed)?;
        self.category = error.category();
        self.error = Some(match error {
            VaultError::Ledger(classified) => classified.user_message(),
            other => other.to_string(),
        });
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceSnapshot {
    pub owner: Address,
    pub spender: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRepayIntent {
    pub amount: U256,
}

/// Individually fetched fields of a [`VaultPosition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionField {
    CollateralAmount,
    BorrowedAmount,
    CurrentDebt,
    CollateralRatio,
    InterestRate,
    MaxWithdrawable,
    Allowance,
    CollateralPrice,
    WalletMusdBalance,
}

impl PositionField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionField::CollateralAmount => "collateral_amount",
            PositionField::BorrowedAmount => "borrowed_amount",
            PositionField::CurrentDebt => "current_debt",
            PositionField::CollateralRatio => "collateral_ratio",
            PositionField::InterestRate => "interest_rate",
            PositionField::MaxWithdrawable => "max_withdrawable",
            PositionField::Allowance => "allowance",
            PositionField::CollateralPrice => "collateral_price",
            PositionField::WalletMusdBalance => "wallet_musd_balance",
        }
    }
}

/// Snapshot of a vault as last read from the ledger.
///
/// Amounts are WAD-scaled. `collateral_ratio` and `interest_rate` are
/// WAD-scaled percentages and `health_factor` is WAD-scaled (1e18 == 1.0).
/// Snapshots are never edited after publication; every poll builds a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultPosition {
    pub collateral_amount: U256,
    pub borrowed_amount: U256,
    pub current_debt: U256,
    /// `None` while there is no debt (infinite ratio).
    pub collateral_ratio: Option<U256>,
    pub health_factor: Option<U256>,
    pub interest_rate: U256,
    pub max_withdrawable: U256,
    pub collateral_price: U256,
    pub wallet_musd_balance: U256,
    pub allowance: U256,
    pub fetched_at: Option<DateTime<Utc>>,
    pub stale_fields: Vec<PositionField>,
}

impl Default for VaultPosition {
    fn default() -> Self {
        Self {
            collateral_amount: U256::ZERO,
            borrowed_amount: U256::ZERO,
            current_debt: U256::ZERO,
            collateral_ratio: None,
            health_factor: None,
            interest_rate: U256::ZERO,
            max_withdrawable: U256::ZERO,
            collateral_price: U256::ZERO,
            wallet_musd_balance: U256::ZERO,
            allowance: U256::ZERO,
            fetched_at: None,
            stale_fields: Vec::new(),
        }
    }
}

impl VaultPosition {
    pub fn has_debt(&self) -> bool {
        !self.current_debt.is_zero() || !self.borrowed_amount.is_zero()
    }

    /// Collateral value in MUSD, if the price is known.
    pub fn collateral_value(&self) -> Option<U256> {
        if self.collateral_price.is_zero() {
            return None;
        }
        mul_div(self.collateral_amount, self.collateral_price, WAD)
    }

    pub fn is_stale(&self, field: PositionField) -> bool {
        self.stale_fields.contains(&field)
    }

    /// Whether the snapshot was fetched within `max_age`.
    pub fn is_fresh(&self, max_age: StdDuration) -> bool {
        match self.fetched_at {
            // A fetch time in the future means clock skew, not staleness.
            Some(fetched_at) => (Utc::now() - fetched_at)
                .to_std()
                .map_or(true, |age| age <= max_age),
            None => false,
        }
    }

    /// Compares ledger-derived values, ignoring fetch bookkeeping.
    pub fn same_metrics(&self, other: &VaultPosition) -> bool {
        self.collateral_amount == other.collateral_amount
            && self.borrowed_amount == other.borrowed_amount
            && self.current_debt == other.current_debt
            && self.collateral_ratio == other.collateral_ratio
            && self.health_factor == other.health_factor
            && self.interest_rate == other.interest_rate
            && self.max_withdrawable == other.max_withdrawable
            && self.collateral_price == other.collateral_price
            && self.wallet_musd_balance == other.wallet_musd_balance
            && self.allowance == other.allowance
    }
}

/// Health factor for a WAD-scaled ratio percentage.
pub fn health_factor(collateral_ratio: U256) -> U256 {
    collateral_ratio / U256::from(MIN_COLLATERAL_RATIO_PERCENT)
}

/// `value / debt * 100` as a WAD-scaled percentage. `None` when `debt` is zero.
pub fn ratio_percent(collateral_value: U256, debt: U256) -> Option<U256> {
    if debt.is_zero() {
        return None;
    }
    mul_div(collateral_value, U256::from(100u64) * WAD, debt)
}

/// `a * b / c` with overflow and division checks.
pub fn mul_div(a: U256, b: U256, c: U256) -> Option<U256> {
    a.checked_mul(b)?.checked_div(c)
}

