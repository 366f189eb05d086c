use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::{VaultPosition, U256, WAD};
use crate::state_reader::VaultStateReader;
use crate::units::format_units;

/// Failed polls in a row before the monitor reports unhealthy.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// VaultMonitor polls the vault on an interval and watches its health factor
pub struct VaultMonitor {
    reader: Arc<VaultStateReader>,

    // Configuration
    poll_interval: Duration,
    health_warning_threshold: U256,

    // Monitoring state
    state: RwLock<PollState>,
    is_healthy: Arc<RwLock<bool>>,
}

#[derive(Debug, Default)]
struct PollState {
    last_poll: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    total_polls: u64,
}

impl VaultMonitor {
    pub fn new(reader: Arc<VaultStateReader>, config: MonitorConfig) -> Self {
        Self {
            reader,
            poll_interval: Duration::from_secs(config.poll_interval_seconds.max(1)),
            health_warning_threshold: config.health_warning_threshold,
            state: RwLock::new(PollState::default()),
            is_healthy: Arc::new(RwLock::new(true)),
        }
    }

    /// Start the polling task
    pub fn start_monitoring(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!("Starting vault monitor, polling every {:?}", self.poll_interval);
        let monitor = self.clone();
        let mut ticker = interval(monitor.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                if let Err(e) = monitor.poll_once().await {
                    error!("Vault poll failed: {}", e);
                }
            }
        })
    }

    /// Refresh the vault once and update health tracking
    pub async fn poll_once(&self) -> Result<()> {
        let result = self.reader.refresh_all().await;

        let mut state = self.state.write().await;
        state.total_polls += 1;
        state.last_poll = Some(Utc::now());
        match &result {
            Ok(position) => {
                state.consecutive_failures = 0;
                state.last_error = None;
                self.check_health_factor(position);
            }
            Err(e) => {
                state.consecutive_failures += 1;
                state.last_error = Some(e.to_string());
                if state.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("Vault poll failed {} times in a row", state.consecutive_failures);
                }
            }
        }
        let healthy = state.consecutive_failures < MAX_CONSECUTIVE_FAILURES;
        drop(state);

        self.set_health_status(healthy).await;
        result.map(|_| ())
    }

    fn check_health_factor(&self, position: &VaultPosition) {
        let Some(health_factor) = position.health_factor else {
            return;
        };
        if health_factor < WAD {
            error!(
                "Vault health factor {} is below 1, position can be liquidated",
                format_units(health_factor)
            );
        } else if health_factor < self.health_warning_threshold {
            warn!(
                "Vault health factor {} below warning threshold {}",
                format_units(health_factor),
                format_units(self.health_warning_threshold)
            );
        }
    }

    /// Get system health status
    pub async fn get_health_status(&self) -> bool {
        *self.is_healthy.read().await
    }

    /// Get monitoring statistics
    pub async fn get_stats(&self) -> MonitoringStats {
        let position = self.reader.position().await;
        let state = self.state.read().await;
        MonitoringStats {
            is_healthy: self.get_health_status().await,
            last_poll: state.last_poll,
            last_error: state.last_error.clone(),
            consecutive_failures: state.consecutive_failures,
            total_polls: state.total_polls,
            health_factor: position.health_factor.map(format_units),
            at_risk: position
                .health_factor
                .is_some_and(|factor| factor < self.health_warning_threshold),
            stale_fields: position.stale_fields.iter().map(|f| f.as_str().to_string()).collect(),
        }
    }

    async fn set_health_status(&self, healthy: bool) {
        let mut status = self.is_healthy.write().await;
        *status = healthy;
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval_seconds: u64,
    /// Health factor below which a warning is logged, WAD-scaled.
    pub health_warning_threshold: U256,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            health_warning_threshold: WAD + WAD / U256::from(5u64), // 1.2
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStats {
    pub is_healthy: bool,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_polls: u64,
    pub health_factor: Option<String>,
    pub at_risk: bool,
    pub stale_fields: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerError, MockLedgerClient};
    use crate::models::Address;
    use crate::schedule::RetryPolicy;

    fn wad(units: u64) -> U256 {
        U256::from(units) * WAD
    }

    fn ledger_with_ratio(ratio: U256) -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_account().returning(|| Address::new("0xborrower"));
        ledger.expect_vault_address().returning(|| Address::new("0xvault"));
        ledger.expect_get_collateral_balance().returning(|_| Ok(wad(1)));
        ledger.expect_get_borrowed_amount().returning(|_| Ok(wad(1_000)));
        ledger.expect_get_current_debt().returning(|_| Ok(wad(1_000)));
        ledger.expect_get_collateral_ratio().returning(move |_| Ok(ratio));
        ledger.expect_get_interest_rate().returning(|| Ok(wad(1)));
        ledger.expect_get_max_withdrawable().returning(|_| Ok(U256::ZERO));
        ledger.expect_get_allowance().returning(|_, _| Ok(U256::ZERO));
        ledger.expect_get_collateral_price().returning(|| Ok(wad(1_210)));
        ledger.expect_get_musd_balance().returning(|_| Ok(wad(1_000)));
        ledger
    }

    fn monitor(ledger: MockLedgerClient) -> VaultMonitor {
        let no_retry = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        let reader = Arc::new(VaultStateReader::new(Arc::new(ledger), no_retry));
        VaultMonitor::new(reader, MonitorConfig::default())
    }

    #[tokio::test]
    async fn test_poll_updates_stats() {
        let monitor = monitor(ledger_with_ratio(wad(220)));

        monitor.poll_once().await.unwrap();
        let stats = monitor.get_stats().await;

        assert!(stats.is_healthy);
        assert_eq!(stats.total_polls, 1);
        assert_eq!(stats.health_factor.as_deref(), Some("2"));
        assert!(!stats.at_risk);
        assert!(stats.last_poll.is_some());
    }

    #[tokio::test]
    async fn test_low_health_factor_is_flagged() {
        // 121% / 110% = 1.1, under the 1.2 default threshold.
        let monitor = monitor(ledger_with_ratio(wad(121)));

        monitor.poll_once().await.unwrap();
        let stats = monitor.get_stats().await;

        assert_eq!(stats.health_factor.as_deref(), Some("1.1"));
        assert!(stats.at_risk);
        assert!(stats.is_healthy);
    }

    #[tokio::test]
    async fn test_repeated_failures_mark_unhealthy() {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_account().returning(|| Address::new("0xborrower"));
        ledger.expect_vault_address().returning(|| Address::new("0xvault"));
        let down = || LedgerError::Transport("connection refused".to_string());
        ledger.expect_get_collateral_balance().returning(move |_| Err(down()));
        ledger.expect_get_borrowed_amount().returning(move |_| Err(down()));
        ledger.expect_get_current_debt().returning(move |_| Err(down()));
        ledger.expect_get_collateral_ratio().returning(move |_| Err(down()));
        ledger.expect_get_interest_rate().returning(move || Err(down()));
        ledger.expect_get_max_withdrawable().returning(move |_| Err(down()));
        ledger.expect_get_allowance().returning(move |_, _| Err(down()));
        ledger.expect_get_collateral_price().returning(move || Err(down()));
        ledger.expect_get_musd_balance().returning(move |_| Err(down()));
        let monitor = monitor(ledger);

        for _ in 0..2 {
            assert!(monitor.poll_once().await.is_err());
        }
        assert!(monitor.get_health_status().await);

        assert!(monitor.poll_once().await.is_err());
        let stats = monitor.get_stats().await;
        assert!(!stats.is_healthy);
        assert_eq!(stats.consecutive_failures, 3);
        assert!(stats.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_task_polls_on_interval() {
        let monitor = Arc::new(monitor(ledger_with_ratio(wad(220))));

        let handle = monitor.start_monitoring();
        tokio::time::sleep(Duration::from_secs(65)).await;
        handle.abort();

        // Immediate first tick, then at 30s and 60s.
        assert_eq!(monitor.get_stats().await.total_polls, 3);
    }
}
