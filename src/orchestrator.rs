use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{Result, VaultError};
use crate::ledger::LedgerClient;
use crate::models::{
    min_collateral_ratio_wad, ratio_percent, PositionField, TransactionKind, TransactionRequest, VaultPosition, U256,
    MIN_COLLATERAL_RATIO_PERCENT,
};
use crate::repay_coordinator::{ApprovalRepayCoordinator, RepayPhase};
use crate::schedule::{CascadeHandle, RefetchSchedule, RetryPolicy};
use crate::state_reader::VaultStateReader;
use crate::transaction_submitter::{SlotGuard, TransactionSubmitter};
use crate::units::format_units_truncated;
use crate::withdrawal_guard::WithdrawalGuard;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry_policy: RetryPolicy,
    pub refetch_schedule: RefetchSchedule,
    pub confirmation_timeout: Duration,
    pub withdraw_refresh_timeout: Duration,
    pub position_max_age: Duration,
    pub history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            refetch_schedule: RefetchSchedule::default(),
            confirmation_timeout: Duration::from_secs(120),
            withdraw_refresh_timeout: Duration::from_millis(500),
            position_max_age: Duration::from_secs(30),
            history_limit: 50,
        }
    }
}

/// Entry point for every vault operation.
///
/// Serializes writes through the submitter's slot, runs the pre-flight
/// checks, and after each confirmed write schedules the refetch cascade.
pub struct TransactionOrchestrator {
    reader: Arc<VaultStateReader>,
    submitter: Arc<TransactionSubmitter>,
    repay: ApprovalRepayCoordinator,
    withdrawal_guard: WithdrawalGuard,
    refetch_schedule: RefetchSchedule,
    position_max_age: Duration,
    last_cascade: Mutex<Option<CascadeHandle>>,
    /// End of the refetch window of the most recent confirmed write. Reads
    /// issued before it may not reflect that write yet.
    settles_at: Mutex<Option<Instant>>,
}

impl TransactionOrchestrator {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: OrchestratorConfig) -> Self {
        let reader = Arc::new(VaultStateReader::new(ledger.clone(), config.retry_policy.clone()));
        let submitter = Arc::new(TransactionSubmitter::new(
            ledger.clone(),
            config.confirmation_timeout,
            config.history_limit,
        ));
        Self {
            repay: ApprovalRepayCoordinator::new(ledger, submitter.clone()),
            withdrawal_guard: WithdrawalGuard::new(
                reader.clone(),
                config.withdraw_refresh_timeout,
                config.position_max_age,
            ),
            reader,
            submitter,
            refetch_schedule: config.refetch_schedule,
            position_max_age: config.position_max_age,
            last_cascade: Mutex::new(None),
            settles_at: Mutex::new(None),
        }
    }

    pub fn reader(&self) -> Arc<VaultStateReader> {
        self.reader.clone()
    }

    /// Deposit collateral into the vault, opening it on first use.
    pub async fn deposit_collateral(&self, amount: U256) -> Result<TransactionRequest> {
        require_positive(amount, "deposit")?;
        let guard = self.submitter.acquire(TransactionKind::Deposit)?;
        info!("Processing deposit of {}", amount);
        let result = self.submitter.execute(&guard, TransactionKind::Deposit, amount).await;
        self.finish(guard, result)
    }

    /// Borrow MUSD against the deposited collateral.
    pub async fn borrow_musd(&self, amount: U256) -> Result<TransactionRequest> {
        require_positive(amount, "borrow")?;
        let guard = self.submitter.acquire(TransactionKind::Borrow)?;
        let position = self.reader.position().await;
        if let Err(e) = check_borrow(amount, &position, self.position_max_age) {
            if self.snapshot_is_settled().await {
                return Err(e);
            }
            info!("Cached position predates the last confirmed write, leaving borrow check to the ledger: {}", e);
        }
        info!("Processing borrow of {}", amount);
        let result = self.submitter.execute(&guard, TransactionKind::Borrow, amount).await;
        self.finish(guard, result)
    }

    /// Repay MUSD debt, approving the vault first if needed.
    pub async fn repay_musd(&self, amount: U256) -> Result<TransactionRequest> {
        require_positive(amount, "repay")?;
        let guard = self.submitter.acquire(TransactionKind::Repay)?;
        info!("Processing repay of {}", amount);
        let result = self.repay.repay(&guard, amount).await;
        self.finish(guard, result)
    }

    /// Withdraw collateral, checked against the cached limit first.
    pub async fn withdraw_collateral(&self, amount: U256) -> Result<TransactionRequest> {
        require_positive(amount, "withdraw")?;
        let guard = self.submitter.acquire(TransactionKind::Withdraw)?;
        self.withdrawal_guard.check(amount).await?;
        info!("Processing withdrawal of {}", amount);
        let result = self.submitter.execute(&guard, TransactionKind::Withdraw, amount).await;
        self.finish(guard, result)
    }

    pub async fn refresh_all(&self) -> Result<Arc<VaultPosition>> {
        self.reader.refresh_all().await
    }

    pub async fn position(&self) -> Arc<VaultPosition> {
        self.reader.position().await
    }

    pub fn active_request(&self) -> Option<TransactionRequest> {
        self.submitter.active_request()
    }

    pub fn history(&self) -> Vec<TransactionRequest> {
        self.submitter.history()
    }

    pub fn is_busy(&self) -> bool {
        self.submitter.is_busy()
    }

    pub fn repay_phase(&self) -> RepayPhase {
        self.repay.phase()
    }

    /// Takes the handle of the most recent refetch cascade, if one was started.
    pub fn take_cascade(&self) -> Option<CascadeHandle> {
        self.last_cascade.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// True when the cached snapshot was read after the last confirmed write
    /// had time to reach every replica.
    async fn snapshot_is_settled(&self) -> bool {
        let settles_at = *self.settles_at.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(settles_at) = settles_at else {
            return true;
        };
        self.reader
            .cache()
            .read_started_at()
            .await
            .is_some_and(|started| started >= settles_at)
    }

    fn finish(&self, guard: SlotGuard, result: Result<TransactionRequest>) -> Result<TransactionRequest> {
        let operation = guard.operation();
        drop(guard);
        match result {
            Ok(request) => {
                info!("{:?} {} completed, scheduling refetch", operation, request.id);
                let window = self.refetch_schedule.delays.iter().max().copied().unwrap_or_default();
                *self.settles_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + window);
                self.start_cascade();
                Ok(request)
            }
            Err(e) => {
                error!("{:?} failed: {}", operation, e);
                Err(e)
            }
        }
    }

    fn start_cascade(&self) {
        let reader = self.reader.clone();
        let handle = self.refetch_schedule.spawn(move || {
            let reader = reader.clone();
            async move {
                if let Err(e) = reader.refresh_all().await {
                    warn!("Scheduled refetch failed: {}", e);
                }
            }
        });
        *self.last_cascade.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

fn require_positive(amount: U256, operation: &str) -> Result<()> {
    if amount.is_zero() {
        return Err(VaultError::InvalidAmount(format!(
            "{} amount must be greater than zero",
            operation
        )));
    }
    Ok(())
}

/// Rejects a borrow that would leave the vault under the minimum ratio.
///
/// Only a fresh snapshot with a known price is trusted; otherwise the ledger
/// decides.
pub fn check_borrow(amount: U256, position: &VaultPosition, max_age: Duration) -> Result<()> {
    if !position.is_fresh(max_age) || position.is_stale(PositionField::CollateralPrice) {
        return Ok(());
    }
    let Some(collateral_value) = position.collateral_value() else {
        return Ok(());
    };
    let resulting_debt = position.current_debt.saturating_add(amount);
    let Some(resulting_ratio) = ratio_percent(collateral_value, resulting_debt) else {
        return Ok(());
    };
    if resulting_ratio < min_collateral_ratio_wad() {
        warn!(
            "Borrow of {} rejected pre-flight: ratio would drop to {}",
            amount, resulting_ratio
        );
        return Err(VaultError::InsufficientCollateral {
            resulting_ratio: format_units_truncated(resulting_ratio, 2),
            minimum_ratio: MIN_COLLATERAL_RATIO_PERCENT,
        });
    }
    Ok(())
}
