use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::classifier::classify;
use crate::error::{Result, VaultError};
use crate::ledger::{LedgerClient, LedgerResult};
use crate::models::{TransactionKind, TransactionRequest, TransactionStatus, TxHash, U256};

#[derive(Default)]
struct SlotState {
    /// Operation currently holding the vault, the busy flag.
    operation: Option<TransactionKind>,
    /// Ledger write of that operation currently in progress.
    active: Option<TransactionRequest>,
    history: VecDeque<TransactionRequest>,
}

/// Exclusive hold on the vault's single write slot.
///
/// Dropping the guard returns the vault to idle, whatever path the
/// operation took.
pub struct SlotGuard {
    state: Arc<Mutex<SlotState>>,
    history_limit: usize,
    operation: TransactionKind,
}

impl SlotGuard {
    pub fn operation(&self) -> TransactionKind {
        self.operation
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(mut request) = state.active.take() {
            if !request.is_terminal() {
                warn!("{:?} request {} abandoned before completion", request.kind, request.id);
                let abandoned = VaultError::InternalError("operation abandoned".to_string());
                if request.fail(&abandoned).is_ok() {
                    push_history(&mut state.history, request, self.history_limit);
                }
            }
        }
        state.operation = None;
    }
}

fn lock(state: &Mutex<SlotState>) -> MutexGuard<'_, SlotState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn push_history(history: &mut VecDeque<TransactionRequest>, request: TransactionRequest, limit: usize) {
    history.push_back(request);
    while history.len() > limit {
        history.pop_front();
    }
}

/// Submits ledger writes one at a time per vault and tracks their lifecycle.
///
/// Writes are never resubmitted automatically: a blind retry of a financial
/// mutation could apply it twice.
pub struct TransactionSubmitter {
    ledger: Arc<dyn LedgerClient>,
    state: Arc<Mutex<SlotState>>,
    confirmation_timeout: Duration,
    history_limit: usize,
}

impl TransactionSubmitter {
    pub fn new(ledger: Arc<dyn LedgerClient>, confirmation_timeout: Duration, history_limit: usize) -> Self {
        Self {
            ledger,
            state: Arc::new(Mutex::new(SlotState::default())),
            confirmation_timeout,
            history_limit: history_limit.max(1),
        }
    }

    /// Claims the vault for `operation`, failing with `Busy` if it is taken.
    pub fn acquire(&self, operation: TransactionKind) -> Result<SlotGuard> {
        let mut state = lock(&self.state);
        if let Some(active) = state.operation {
            let current = state.active.as_ref().map_or(active, |request| request.kind);
            warn!("Rejecting {:?}: vault busy with {:?}", operation, current);
            return Err(VaultError::Busy { active: current });
        }
        state.operation = Some(operation);
        Ok(SlotGuard {
            state: self.state.clone(),
            history_limit: self.history_limit,
            operation,
        })
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.state).operation.is_some()
    }

    /// The write currently in flight, if any.
    pub fn active_request(&self) -> Option<TransactionRequest> {
        lock(&self.state).active.clone()
    }

    /// Finished requests, oldest first.
    pub fn history(&self) -> Vec<TransactionRequest> {
        lock(&self.state).history.iter().cloned().collect()
    }

    /// Submits one write under `guard` and waits for its receipt.
    ///
    /// Returns the successful request, or the classified error after the
    /// request has been recorded as failed.
    pub async fn execute(&self, guard: &SlotGuard, kind: TransactionKind, amount: U256) -> Result<TransactionRequest> {
        debug_assert!(Arc::ptr_eq(&guard.state, &self.state));
        let request = TransactionRequest::new(kind, amount);
        info!("Submitting {:?} request {} for amount {}", kind, request.id, amount);
        {
            let mut state = lock(&self.state);
            state.active = Some(request);
        }
        self.update_active(|request| request.advance(TransactionStatus::Submitted))?;

        let hash = match self.send(kind, amount).await {
            Ok(hash) => hash,
            Err(e) => {
                let classified = classify(&e);
                error!("{:?} submission failed: {}", kind, classified);
                return Err(self.finish_failed(VaultError::Ledger(classified)));
            }
        };

        self.update_active(|request| {
            request.hash = Some(hash.clone());
            request.advance(TransactionStatus::Confirming)
        })?;
        info!("{:?} submitted with hash {}, awaiting confirmation", kind, hash);

        match tokio::time::timeout(self.confirmation_timeout, self.ledger.wait_for_receipt(&hash)).await {
            Ok(Ok(receipt)) => match receipt.into_result() {
                Ok(_) => {
                    self.update_active(|request| request.advance(TransactionStatus::Success))?;
                    info!("{:?} {} confirmed", kind, hash);
                    self.take_finished()
                }
                Err(e) => {
                    let classified = classify(&e);
                    error!("{:?} {} reverted: {}", kind, hash, classified);
                    Err(self.finish_failed(VaultError::Ledger(classified)))
                }
            },
            Ok(Err(e)) => {
                let classified = classify(&e);
                error!("Waiting for {:?} {} failed: {}", kind, hash, classified);
                Err(self.finish_failed(VaultError::Ledger(classified)))
            }
            Err(_) => {
                // The transaction may still be mined; the next poll reconciles.
                warn!(
                    "{:?} {} not confirmed within {:?}, giving up the local wait",
                    kind, hash, self.confirmation_timeout
                );
                Err(self.finish_failed(VaultError::Timeout(format!(
                    "transaction {} not confirmed within {:?}",
                    hash, self.confirmation_timeout
                ))))
            }
        }
    }

    async fn send(&self, kind: TransactionKind, amount: U256) -> LedgerResult<TxHash> {
        match kind {
            TransactionKind::Deposit => self.ledger.deposit_collateral(amount).await,
            TransactionKind::Borrow => self.ledger.borrow(amount).await,
            TransactionKind::Repay => self.ledger.repay(amount).await,
            TransactionKind::Withdraw => self.ledger.withdraw(amount).await,
            TransactionKind::Approve => {
                let spender = self.ledger.vault_address();
                self.ledger.approve(&spender, amount).await
            }
        }
    }

    fn update_active(&self, f: impl FnOnce(&mut TransactionRequest) -> Result<()>) -> Result<()> {
        let mut state = lock(&self.state);
        match state.active.as_mut() {
            Some(request) => f(request),
            None => Err(VaultError::InternalError("no active transaction".to_string())),
        }
    }

    fn take_finished(&self) -> Result<TransactionRequest> {
        let mut state = lock(&self.state);
        let request = state
            .active
            .take()
            .ok_or_else(|| VaultError::InternalError("no active transaction".to_string()))?;
        push_history(&mut state.history, request.clone(), self.history_limit);
        Ok(request)
    }

    fn finish_failed(&self, error: VaultError) -> VaultError {
        if let Err(e) = self.update_active(|request| request.fail(&error)) {
            error!("Could not record failure: {}", e);
        }
        if let Err(e) = self.take_finished() {
            error!("Could not archive failed request: {}", e);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WAD;
    use crate::simulated_ledger::{SandboxConfig, SimulatedLedger};

    fn submitter(confirmation_delay: Duration) -> TransactionSubmitter {
        let ledger = SimulatedLedger::new(SandboxConfig {
            confirmation_delay,
            ..SandboxConfig::default()
        });
        TransactionSubmitter::new(Arc::new(ledger), Duration::from_secs(300), 3)
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy_until_guard_drops() {
        let submitter = submitter(Duration::ZERO);

        let guard = submitter.acquire(TransactionKind::Deposit).unwrap();
        assert!(submitter.is_busy());
        assert!(matches!(
            submitter.acquire(TransactionKind::Withdraw),
            Err(VaultError::Busy { active: TransactionKind::Deposit })
        ));

        drop(guard);
        assert!(!submitter.is_busy());
        assert!(submitter.acquire(TransactionKind::Withdraw).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_is_archived_as_failed() {
        let submitter = submitter(Duration::from_secs(60));
        let guard = submitter.acquire(TransactionKind::Deposit).unwrap();

        let waited = tokio::time::timeout(
            Duration::from_secs(1),
            submitter.execute(&guard, TransactionKind::Deposit, WAD),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(
            submitter.active_request().map(|request| request.status),
            Some(TransactionStatus::Confirming)
        );

        drop(guard);

        assert!(!submitter.is_busy());
        assert!(submitter.active_request().is_none());
        let history = submitter.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TransactionStatus::Failed);
        assert!(history[0].hash.is_some());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let submitter = submitter(Duration::ZERO);

        for _ in 0..5 {
            let guard = submitter.acquire(TransactionKind::Deposit).unwrap();
            submitter
                .execute(&guard, TransactionKind::Deposit, WAD / U256::from(10u64))
                .await
                .unwrap();
        }

        assert_eq!(submitter.history().len(), 3);
    }
}
