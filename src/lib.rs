pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod repay_coordinator;
pub mod schedule;
pub mod simulated_ledger;
pub mod state_reader;
pub mod transaction_submitter;
pub mod units;
pub mod vault_monitor;
pub mod withdrawal_guard;

pub use classifier::{classify, ClassifiedError, ErrorCategory};
pub use config::Config;
pub use error::{Result, VaultError};
pub use ledger::{LedgerClient, LedgerError, LedgerResult, RevertCode, TxOutcome, TxReceipt};
pub use models::*;
pub use orchestrator::{check_borrow, OrchestratorConfig, TransactionOrchestrator};
pub use repay_coordinator::{ApprovalRepayCoordinator, RepayPhase};
pub use schedule::{CascadeHandle, RefetchSchedule, RetryPolicy};
pub use simulated_ledger::{SandboxConfig, SimulatedLedger};
pub use state_reader::{PositionCache, VaultStateReader};
pub use transaction_submitter::{SlotGuard, TransactionSubmitter};
pub use units::{format_units, parse_units};
pub use vault_monitor::{MonitorConfig, MonitoringStats, VaultMonitor};
pub use withdrawal_guard::{GuardDecision, WithdrawalGuard};
