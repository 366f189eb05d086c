use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, VaultError};
use crate::models::{PositionField, VaultPosition, U256};
use crate::state_reader::VaultStateReader;

#[derive(Debug)]
pub enum GuardDecision {
    Allow,
    Reject(VaultError),
    /// The cached limit cannot be trusted; refresh once before deciding.
    Refresh,
}

/// Pre-flight check for withdrawals against the collateralization limit.
pub struct WithdrawalGuard {
    reader: Arc<VaultStateReader>,
    refresh_timeout: Duration,
    max_position_age: Duration,
}

impl WithdrawalGuard {
    pub fn new(reader: Arc<VaultStateReader>, refresh_timeout: Duration, max_position_age: Duration) -> Self {
        Self {
            reader,
            refresh_timeout,
            max_position_age,
        }
    }

    /// Decides on `requested` using only the given snapshot.
    pub fn pre_validate(&self, requested: U256, position: &VaultPosition) -> GuardDecision {
        pre_validate(requested, position, self.max_position_age)
    }

    /// Validates a withdrawal, refreshing a stale limit at most once.
    ///
    /// The refresh is bounded by `refresh_timeout`. If it times out or fails
    /// the withdrawal is let through and the ledger's own check decides.
    pub async fn check(&self, requested: U256) -> Result<()> {
        let position = self.reader.position().await;
        match self.pre_validate(requested, &position) {
            GuardDecision::Allow => Ok(()),
            GuardDecision::Reject(e) => Err(e),
            GuardDecision::Refresh => {
                info!("Withdrawal limit stale or zero, refreshing before validating {}", requested);
                match tokio::time::timeout(self.refresh_timeout, self.reader.refresh_all()).await {
                    Ok(Ok(fresh)) => enforce_limit(requested, &fresh),
                    Ok(Err(e)) => {
                        warn!("Withdrawal pre-check refresh failed, deferring to ledger: {}", e);
                        Ok(())
                    }
                    Err(_) => {
                        warn!(
                            "Withdrawal pre-check refresh timed out after {:?}, deferring to ledger",
                            self.refresh_timeout
                        );
                        Ok(())
                    }
                }
            }
        }
    }
}

pub fn pre_validate(requested: U256, position: &VaultPosition, max_position_age: Duration) -> GuardDecision {
    if requested.is_zero() {
        return GuardDecision::Reject(VaultError::InvalidAmount(
            "withdrawal amount must be greater than zero".to_string(),
        ));
    }

    if position.has_debt() {
        let stale = !position.is_fresh(max_position_age) || position.is_stale(PositionField::MaxWithdrawable);
        if stale || position.max_withdrawable.is_zero() {
            return GuardDecision::Refresh;
        }
    } else if position.fetched_at.is_none() {
        // Never polled: nothing local to check against.
        return GuardDecision::Allow;
    }

    match enforce_limit(requested, position) {
        Ok(()) => GuardDecision::Allow,
        Err(e) => GuardDecision::Reject(e),
    }
}

/// With debt the limit is `max_withdrawable`; without debt it is the
/// deposited collateral.
fn enforce_limit(requested: U256, position: &VaultPosition) -> Result<()> {
    let limit = if position.has_debt() {
        position.max_withdrawable
    } else {
        position.collateral_amount
    };
    if requested > limit {
        return Err(VaultError::WithdrawalExceedsLimit {
            requested,
            max_withdrawable: limit,
        });
    }
    Ok(())
}
