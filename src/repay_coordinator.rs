use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::classifier::classify;
use crate::error::{Result, VaultError};
use crate::ledger::LedgerClient;
use crate::models::{AllowanceSnapshot, PendingRepayIntent, TransactionKind, TransactionRequest, U256};
use crate::transaction_submitter::{SlotGuard, TransactionSubmitter};

/// Progress of a repay that needed an approval first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepayPhase {
    Idle,
    WaitingForApproval(PendingRepayIntent),
    ApprovalConfirmed(PendingRepayIntent),
    RepaySubmitted { amount: U256 },
}

/// Runs the allowance-then-repay protocol.
///
/// While the approval leg is confirming, the submitter's active request is
/// the `Approve` and the pending intent lives in [`RepayPhase`]. The repay is
/// submitted automatically once, and only once, the approval is confirmed.
pub struct ApprovalRepayCoordinator {
    ledger: Arc<dyn LedgerClient>,
    submitter: Arc<TransactionSubmitter>,
    phase: Mutex<RepayPhase>,
}

impl ApprovalRepayCoordinator {
    pub fn new(ledger: Arc<dyn LedgerClient>, submitter: Arc<TransactionSubmitter>) -> Self {
        Self {
            ledger,
            submitter,
            phase: Mutex::new(RepayPhase::Idle),
        }
    }

    pub fn phase(&self) -> RepayPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, next: RepayPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// `WaitingForApproval` -> `ApprovalConfirmed`, once the Approve receipt is in.
    fn confirm_approval(&self) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        match *phase {
            RepayPhase::WaitingForApproval(intent) => {
                *phase = RepayPhase::ApprovalConfirmed(intent);
                true
            }
            _ => false,
        }
    }

    /// `ApprovalConfirmed` -> `RepaySubmitted`, handing out the intent exactly once.
    fn take_intent(&self) -> Option<PendingRepayIntent> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        match *phase {
            RepayPhase::ApprovalConfirmed(intent) => {
                *phase = RepayPhase::RepaySubmitted {
                    amount: intent.amount,
                };
                Some(intent)
            }
            _ => None,
        }
    }

    /// Reads the current allowance of the vault contract over the borrower's MUSD.
    pub async fn allowance(&self) -> Result<AllowanceSnapshot> {
        let owner = self.ledger.account();
        let spender = self.ledger.vault_address();
        let amount = self
            .ledger
            .get_allowance(&owner, &spender)
            .await
            .map_err(|e| VaultError::Ledger(classify(&e)))?;
        Ok(AllowanceSnapshot { owner, spender, amount })
    }

    /// Repays `amount`, approving the vault first when the allowance is short.
    pub async fn repay(&self, guard: &SlotGuard, amount: U256) -> Result<TransactionRequest> {
        if amount.is_zero() {
            return Err(VaultError::InvalidAmount("repay amount must be greater than zero".to_string()));
        }
        if self.phase() != RepayPhase::Idle {
            // The slot guarantees exclusivity, so this is a leftover from an abandoned chain.
            warn!("Discarding stale repay phase {:?}", self.phase());
            self.set_phase(RepayPhase::Idle);
        }

        let owner = self.ledger.account();
        let balance = self
            .ledger
            .get_musd_balance(&owner)
            .await
            .map_err(|e| VaultError::Ledger(classify(&e)))?;
        if amount > balance {
            return Err(VaultError::InsufficientBalance {
                available: balance,
                required: amount,
            });
        }

        let allowance = self.allowance().await?;
        if allowance.amount >= amount {
            info!("Allowance {} covers repay of {}, repaying directly", allowance.amount, amount);
            self.set_phase(RepayPhase::RepaySubmitted { amount });
            let result = self.submitter.execute(guard, TransactionKind::Repay, amount).await;
            self.set_phase(RepayPhase::Idle);
            return result;
        }

        info!(
            "Allowance {} below repay of {}, approving vault {} first",
            allowance.amount, amount, allowance.spender
        );
        self.set_phase(RepayPhase::WaitingForApproval(PendingRepayIntent { amount }));
        if let Err(e) = self.submitter.execute(guard, TransactionKind::Approve, U256::MAX).await {
            warn!("Approval failed, dropping pending repay of {}", amount);
            self.set_phase(RepayPhase::Idle);
            return Err(e);
        }

        if !self.confirm_approval() {
            self.set_phase(RepayPhase::Idle);
            return Err(VaultError::InternalError(
                "approval confirmed without a pending repay".to_string(),
            ));
        }
        info!("Approval confirmed, phase {:?}", self.phase());
        let Some(intent) = self.take_intent() else {
            self.set_phase(RepayPhase::Idle);
            return Err(VaultError::InternalError("pending repay already submitted".to_string()));
        };
        info!("Submitting pending repay of {}", intent.amount);
        let result = self.submitter.execute(guard, TransactionKind::Repay, intent.amount).await;
        self.set_phase(RepayPhase::Idle);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorCategory;
    use crate::ledger::{MockLedgerClient, RevertCode, TxOutcome, TxReceipt};
    use crate::models::{Address, TransactionStatus, TxHash, WAD};
    use std::time::Duration;

    fn wad(units: u64) -> U256 {
        U256::from(units) * WAD
    }

    fn base_ledger(balance: U256, allowance: U256) -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_account().returning(|| Address::new("0xborrower"));
        ledger.expect_vault_address().returning(|| Address::new("0xvault"));
        ledger.expect_get_musd_balance().returning(move |_| Ok(balance));
        ledger.expect_get_allowance().returning(move |_, _| Ok(allowance));
        ledger
    }

    fn coordinator(ledger: MockLedgerClient) -> (ApprovalRepayCoordinator, Arc<TransactionSubmitter>) {
        let ledger: Arc<dyn LedgerClient> = Arc::new(ledger);
        let submitter = Arc::new(TransactionSubmitter::new(ledger.clone(), Duration::from_secs(30), 10));
        (ApprovalRepayCoordinator::new(ledger, submitter.clone()), submitter)
    }

    fn record(log: &Arc<Mutex<Vec<String>>>, entry: String) {
        log.lock().unwrap().push(entry);
    }

    #[tokio::test]
    async fn test_sufficient_allowance_repays_directly() {
        let mut ledger = base_ledger(wad(500), wad(1_000));
        ledger.expect_approve().times(0);
        ledger
            .expect_repay()
            .times(1)
            .returning(|_| Ok(TxHash("0xrepay".to_string())));
        ledger.expect_wait_for_receipt().times(1).returning(|hash| {
            Ok(TxReceipt {
                hash: hash.clone(),
                outcome: TxOutcome::Confirmed,
            })
        });
        let (coordinator, submitter) = coordinator(ledger);

        let guard = submitter.acquire(TransactionKind::Repay).unwrap();
        let request = coordinator.repay(&guard, wad(100)).await.unwrap();

        assert_eq!(request.kind, TransactionKind::Repay);
        assert_eq!(request.status, TransactionStatus::Success);
        assert_eq!(coordinator.phase(), RepayPhase::Idle);
    }

    #[tokio::test]
    async fn test_zero_allowance_approves_then_repays_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = base_ledger(wad(500), U256::ZERO);
        let approve_log = log.clone();
        ledger.expect_approve().times(1).returning(move |spender, amount| {
            assert_eq!(spender.as_str(), "0xvault");
            assert_eq!(amount, U256::MAX);
            record(&approve_log, "approve".to_string());
            Ok(TxHash("0xapprove".to_string()))
        });
        let repay_log = log.clone();
        ledger.expect_repay().times(1).returning(move |amount| {
            record(&repay_log, format!("repay:{}", amount));
            Ok(TxHash("0xrepay".to_string()))
        });
        let receipt_log = log.clone();
        ledger.expect_wait_for_receipt().times(2).returning(move |hash| {
            record(&receipt_log, format!("confirmed:{}", hash));
            Ok(TxReceipt {
                hash: hash.clone(),
                outcome: TxOutcome::Confirmed,
            })
        });
        let (coordinator, submitter) = coordinator(ledger);

        let guard = submitter.acquire(TransactionKind::Repay).unwrap();
        let request = coordinator.repay(&guard, wad(100)).await.unwrap();
        drop(guard);

        assert_eq!(request.kind, TransactionKind::Repay);
        assert_eq!(request.amount, wad(100));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "approve".to_string(),
                "confirmed:0xapprove".to_string(),
                format!("repay:{}", wad(100)),
                "confirmed:0xrepay".to_string(),
            ]
        );
        let kinds: Vec<_> = submitter.history().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![TransactionKind::Approve, TransactionKind::Repay]);
        assert_eq!(coordinator.phase(), RepayPhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_approval_never_repays() {
        let mut ledger = base_ledger(wad(500), U256::ZERO);
        ledger
            .expect_approve()
            .times(1)
            .returning(|_, _| Ok(TxHash("0xapprove".to_string())));
        ledger.expect_wait_for_receipt().times(1).returning(|hash| {
            Ok(TxReceipt {
                hash: hash.clone(),
                outcome: TxOutcome::Reverted {
                    code: None,
                    reason: "out of gas".to_string(),
                },
            })
        });
        ledger.expect_repay().times(0);
        let (coordinator, submitter) = coordinator(ledger);

        let guard = submitter.acquire(TransactionKind::Repay).unwrap();
        let err = coordinator.repay(&guard, wad(100)).await.unwrap_err();

        assert_eq!(err.category(), Some(ErrorCategory::GasOrNetwork));
        assert_eq!(coordinator.phase(), RepayPhase::Idle);
        assert_eq!(coordinator.take_intent(), None);
    }

    #[tokio::test]
    async fn test_rejected_approval_is_classified() {
        let mut ledger = base_ledger(wad(500), U256::ZERO);
        ledger
            .expect_approve()
            .times(1)
            .returning(|_, _| Err(crate::ledger::LedgerError::UserRejected));
        ledger.expect_repay().times(0);
        let (coordinator, submitter) = coordinator(ledger);

        let guard = submitter.acquire(TransactionKind::Repay).unwrap();
        let err = coordinator.repay(&guard, wad(100)).await.unwrap_err();

        assert_eq!(err.category(), Some(ErrorCategory::UserRejected));
        let history = submitter.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_repay_above_wallet_balance_is_rejected_locally() {
        let mut ledger = base_ledger(wad(50), U256::ZERO);
        ledger.expect_approve().times(0);
        ledger.expect_repay().times(0);
        let (coordinator, submitter) = coordinator(ledger);

        let guard = submitter.acquire(TransactionKind::Repay).unwrap();
        let err = coordinator.repay(&guard, wad(100)).await.unwrap_err();

        assert!(matches!(err, VaultError::InsufficientBalance { .. }));
        assert_eq!(err.category(), Some(ErrorCategory::InsufficientBalance));
        assert!(submitter.history().is_empty());
    }

    #[tokio::test]
    async fn test_repay_reverted_for_allowance_is_classified() {
        let mut ledger = base_ledger(wad(500), wad(1_000));
        ledger
            .expect_repay()
            .times(1)
            .returning(|_| Ok(TxHash("0xrepay".to_string())));
        ledger.expect_wait_for_receipt().times(1).returning(|hash| {
            Ok(TxReceipt {
                hash: hash.clone(),
                outcome: TxOutcome::Reverted {
                    code: Some(RevertCode::AllowanceExceeded),
                    reason: "insufficient allowance".to_string(),
                },
            })
        });
        let (coordinator, submitter) = coordinator(ledger);

        let guard = submitter.acquire(TransactionKind::Repay).unwrap();
        let err = coordinator.repay(&guard, wad(100)).await.unwrap_err();

        assert_eq!(err.category(), Some(ErrorCategory::AllowanceInsufficient));
    }

    #[test]
    fn test_intent_is_handed_out_once_after_confirmation() {
        let (coordinator, _) = coordinator(MockLedgerClient::new());
        let intent = PendingRepayIntent { amount: wad(100) };

        assert!(coordinator.take_intent().is_none());
        coordinator.set_phase(RepayPhase::WaitingForApproval(intent));
        // Not confirmed yet.
        assert!(coordinator.take_intent().is_none());

        assert!(coordinator.confirm_approval());
        assert_eq!(coordinator.phase(), RepayPhase::ApprovalConfirmed(intent));

        assert_eq!(coordinator.take_intent(), Some(intent));
        assert_eq!(coordinator.phase(), RepayPhase::RepaySubmitted { amount: wad(100) });
        assert!(coordinator.take_intent().is_none());
        assert!(!coordinator.confirm_approval());
    }
}
