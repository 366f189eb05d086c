use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{Result, VaultError};
use crate::ledger::{LedgerClient, LedgerResult};
use crate::models::{health_factor, PositionField, VaultPosition, U256};
use crate::schedule::RetryPolicy;

/// Shared, atomically replaced vault snapshot.
///
/// Readers clone the inner `Arc`; the state reader swaps in a whole new
/// snapshot, so a half-updated position is never observable.
#[derive(Clone, Default)]
pub struct PositionCache {
    inner: Arc<RwLock<Published>>,
}

#[derive(Default)]
struct Published {
    sequence: u64,
    read_started: Option<Instant>,
    position: Arc<VaultPosition>,
}

impl PositionCache {
    pub async fn current(&self) -> Arc<VaultPosition> {
        self.inner.read().await.position.clone()
    }

    /// When the reads behind the current snapshot were issued.
    pub async fn read_started_at(&self) -> Option<Instant> {
        self.inner.read().await.read_started
    }

    /// Publishes `position` unless a newer refresh already did.
    async fn publish(&self, sequence: u64, read_started: Instant, position: VaultPosition) -> Arc<VaultPosition> {
        let mut published = self.inner.write().await;
        if sequence > published.sequence {
            published.sequence = sequence;
            published.read_started = Some(read_started);
            published.position = Arc::new(position);
        } else {
            debug!("Dropping refresh #{} superseded by #{}", sequence, published.sequence);
        }
        published.position.clone()
    }
}

/// Fan-out/fan-in reader for every vault metric.
pub struct VaultStateReader {
    ledger: Arc<dyn LedgerClient>,
    cache: PositionCache,
    retry_policy: RetryPolicy,
    sequence: AtomicU64,
}

impl VaultStateReader {
    pub fn new(ledger: Arc<dyn LedgerClient>, retry_policy: RetryPolicy) -> Self {
        Self {
            ledger,
            cache: PositionCache::default(),
            retry_policy,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> PositionCache {
        self.cache.clone()
    }

    /// Last published snapshot.
    pub async fn position(&self) -> Arc<VaultPosition> {
        self.cache.current().await
    }

    /// Reads every metric concurrently and publishes a new snapshot.
    ///
    /// Reads that still fail after retrying keep their previous value and are
    /// reported through [`VaultError::PartialRefresh`]; the merged snapshot is
    /// published regardless, unless every read failed.
    pub async fn refresh_all(&self) -> Result<Arc<VaultPosition>> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let read_started = Instant::now();
        let ledger = self.ledger.as_ref();
        let account = ledger.account();
        let spender = ledger.vault_address();
        let retry = &self.retry_policy;

        let (collateral, borrowed, debt, ratio, rate, max_withdrawable, allowance, price, balance) = tokio::join!(
            retry.retry("collateral_balance", || ledger.get_collateral_balance(&account)),
            retry.retry("borrowed_amount", || ledger.get_borrowed_amount(&account)),
            retry.retry("current_debt", || ledger.get_current_debt(&account)),
            retry.retry("collateral_ratio", || ledger.get_collateral_ratio(&account)),
            retry.retry("interest_rate", || ledger.get_interest_rate()),
            retry.retry("max_withdrawable", || ledger.get_max_withdrawable(&account)),
            retry.retry("allowance", || ledger.get_allowance(&account, &spender)),
            retry.retry("collateral_price", || ledger.get_collateral_price()),
            retry.retry("musd_balance", || ledger.get_musd_balance(&account)),
        );

        let previous = self.cache.current().await;
        let mut failed = Vec::new();

        let current_debt = resolve(debt, previous.current_debt, PositionField::CurrentDebt, &mut failed);
        // No debt means no ratio, whatever the ratio read returned.
        let collateral_ratio = match ratio {
            Ok(ratio) => Some(ratio),
            Err(e) => {
                error!("Failed to read collateral_ratio: {}", e);
                failed.push(PositionField::CollateralRatio);
                previous.collateral_ratio
            }
        }
        .filter(|_| !current_debt.is_zero());

        let position = VaultPosition {
            collateral_amount: resolve(collateral, previous.collateral_amount, PositionField::CollateralAmount, &mut failed),
            borrowed_amount: resolve(borrowed, previous.borrowed_amount, PositionField::BorrowedAmount, &mut failed),
            current_debt,
            collateral_ratio,
            health_factor: collateral_ratio.map(health_factor),
            interest_rate: resolve(rate, previous.interest_rate, PositionField::InterestRate, &mut failed),
            max_withdrawable: resolve(max_withdrawable, previous.max_withdrawable, PositionField::MaxWithdrawable, &mut failed),
            allowance: resolve(allowance, previous.allowance, PositionField::Allowance, &mut failed),
            collateral_price: resolve(price, previous.collateral_price, PositionField::CollateralPrice, &mut failed),
            wallet_musd_balance: resolve(balance, previous.wallet_musd_balance, PositionField::WalletMusdBalance, &mut failed),
            fetched_at: Some(Utc::now()),
            stale_fields: failed.clone(),
        };

        let failed_fields: Vec<String> = failed.iter().map(|f| f.as_str().to_string()).collect();
        if failed.len() == FIELD_COUNT {
            error!("Vault refresh failed: no field could be read");
            return Err(VaultError::PartialRefresh { failed_fields });
        }

        let published = self.cache.publish(sequence, read_started, position).await;
        if !failed.is_empty() {
            warn!("Vault refresh published with stale fields: {}", failed_fields.join(", "));
            return Err(VaultError::PartialRefresh { failed_fields });
        }

        debug!(
            "Vault refreshed: collateral={}, debt={}, max_withdrawable={}",
            published.collateral_amount, published.current_debt, published.max_withdrawable
        );
        Ok(published)
    }
}

const FIELD_COUNT: usize = 9;

fn resolve(
    result: LedgerResult<U256>,
    previous: U256,
    field: PositionField,
    failed: &mut Vec<PositionField>,
) -> U256 {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to read {}: {}", field.as_str(), e);
            failed.push(field);
            previous
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerError, MockLedgerClient};
    use crate::models::{Address, WAD};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn wad(units: u64) -> U256 {
        U256::from(units) * WAD
    }

    fn stable_ledger() -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_account().returning(|| Address::new("0xborrower"));
        ledger.expect_vault_address().returning(|| Address::new("0xvault"));
        ledger.expect_get_collateral_balance().returning(|_| Ok(wad(2)));
        ledger.expect_get_borrowed_amount().returning(|_| Ok(wad(1_000)));
        ledger.expect_get_current_debt().returning(|_| Ok(wad(1_000)));
        ledger.expect_get_collateral_ratio().returning(|_| Ok(wad(220)));
        ledger.expect_get_interest_rate().returning(|| Ok(wad(1)));
        ledger.expect_get_max_withdrawable().returning(|_| Ok(wad(1)));
        ledger.expect_get_allowance().returning(|_, _| Ok(U256::ZERO));
        ledger.expect_get_collateral_price().returning(|| Ok(wad(1_100)));
        ledger.expect_get_musd_balance().returning(|_| Ok(wad(500)));
        ledger
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_refresh_publishes_full_snapshot() {
        let reader = VaultStateReader::new(Arc::new(stable_ledger()), fast_retry());

        let position = reader.refresh_all().await.unwrap();

        assert_eq!(position.collateral_amount, wad(2));
        assert_eq!(position.current_debt, wad(1_000));
        assert_eq!(position.collateral_ratio, Some(wad(220)));
        assert_eq!(position.health_factor, Some(wad(2)));
        assert!(position.stale_fields.is_empty());
        assert!(position.fetched_at.is_some());
        assert!(reader.position().await.same_metrics(&position));
    }

    #[tokio::test]
    async fn test_refresh_twice_is_idempotent() {
        let reader = VaultStateReader::new(Arc::new(stable_ledger()), fast_retry());

        let first = reader.refresh_all().await.unwrap();
        let second = reader.refresh_all().await.unwrap();

        assert!(first.same_metrics(&second));
    }

    #[tokio::test]
    async fn test_zero_debt_means_infinite_ratio() {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_account().returning(|| Address::new("0xborrower"));
        ledger.expect_vault_address().returning(|| Address::new("0xvault"));
        ledger.expect_get_collateral_balance().returning(|_| Ok(wad(1)));
        ledger.expect_get_borrowed_amount().returning(|_| Ok(U256::ZERO));
        ledger.expect_get_current_debt().returning(|_| Ok(U256::ZERO));
        ledger.expect_get_collateral_ratio().returning(|_| Ok(U256::MAX));
        ledger.expect_get_interest_rate().returning(|| Ok(wad(1)));
        ledger.expect_get_max_withdrawable().returning(|_| Ok(wad(1)));
        ledger.expect_get_allowance().returning(|_, _| Ok(U256::ZERO));
        ledger.expect_get_collateral_price().returning(|| Ok(wad(60_000)));
        ledger.expect_get_musd_balance().returning(|_| Ok(U256::ZERO));
        let reader = VaultStateReader::new(Arc::new(ledger), fast_retry());

        let position = reader.refresh_all().await.unwrap();

        assert_eq!(position.collateral_ratio, None);
        assert_eq!(position.health_factor, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_failure_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut ledger = MockLedgerClient::new();
        ledger.expect_account().returning(|| Address::new("0xborrower"));
        ledger.expect_vault_address().returning(|| Address::new("0xvault"));
        let counter = attempts.clone();
        ledger.expect_get_collateral_balance().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LedgerError::Transport("connection reset".to_string()))
            } else {
                Ok(wad(3))
            }
        });
        ledger.expect_get_borrowed_amount().returning(|_| Ok(U256::ZERO));
        ledger.expect_get_current_debt().returning(|_| Ok(U256::ZERO));
        ledger.expect_get_collateral_ratio().returning(|_| Ok(U256::ZERO));
        ledger.expect_get_interest_rate().returning(|| Ok(wad(1)));
        ledger.expect_get_max_withdrawable().returning(|_| Ok(wad(3)));
        ledger.expect_get_allowance().returning(|_, _| Ok(U256::ZERO));
        ledger.expect_get_collateral_price().returning(|| Ok(wad(60_000)));
        ledger.expect_get_musd_balance().returning(|_| Ok(U256::ZERO));
        let reader = VaultStateReader::new(Arc::new(ledger), RetryPolicy::default());

        let position = reader.refresh_all().await.unwrap();

        assert_eq!(position.collateral_amount, wad(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_read_failure_keeps_last_value() {
        let reader_ledger = Arc::new(stable_ledger());
        let reader = VaultStateReader::new(reader_ledger, fast_retry());
        reader.refresh_all().await.unwrap();

        // Second reader shares the cache semantics but sees a broken rate feed.
        let attempts = Arc::new(AtomicU32::new(0));
        let mut ledger = MockLedgerClient::new();
        ledger.expect_account().returning(|| Address::new("0xborrower"));
        ledger.expect_vault_address().returning(|| Address::new("0xvault"));
        ledger.expect_get_collateral_balance().returning(|_| Ok(wad(2)));
        ledger.expect_get_borrowed_amount().returning(|_| Ok(wad(1_000)));
        ledger.expect_get_current_debt().returning(|_| Ok(wad(1_000)));
        ledger.expect_get_collateral_ratio().returning(|_| Ok(wad(220)));
        let counter = attempts.clone();
        ledger.expect_get_interest_rate().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::Rpc {
                code: -32000,
                message: "header not found".to_string(),
            })
        });
        ledger.expect_get_max_withdrawable().returning(|_| Ok(wad(1)));
        ledger.expect_get_allowance().returning(|_, _| Ok(U256::ZERO));
        ledger.expect_get_collateral_price().returning(|| Ok(wad(1_100)));
        ledger.expect_get_musd_balance().returning(|_| Ok(wad(500)));
        let flaky = VaultStateReader {
            ledger: Arc::new(ledger),
            cache: reader.cache(),
            retry_policy: fast_retry(),
            sequence: AtomicU64::new(10),
        };

        let result = flaky.refresh_all().await;

        match result {
            Err(VaultError::PartialRefresh { failed_fields }) => {
                assert_eq!(failed_fields, vec!["interest_rate".to_string()]);
            }
            other => panic!("expected partial refresh, got {:?}", other.map(|_| ())),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        let cached = reader.position().await;
        assert_eq!(cached.interest_rate, wad(1));
        assert!(cached.is_stale(PositionField::InterestRate));
    }

    #[tokio::test]
    async fn test_older_refresh_does_not_overwrite_newer() {
        let cache = PositionCache::default();
        let newer = VaultPosition {
            collateral_amount: wad(5),
            ..VaultPosition::default()
        };
        let older = VaultPosition {
            collateral_amount: wad(1),
            ..VaultPosition::default()
        };

        let newer_started = Instant::now();
        cache.publish(2, newer_started, newer).await;
        let current = cache.publish(1, newer_started - Duration::from_millis(1), older).await;

        assert_eq!(current.collateral_amount, wad(5));
        assert_eq!(cache.read_started_at().await, Some(newer_started));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_repay_clears_ratio_even_when_ratio_read_fails() {
        let reader = VaultStateReader::new(Arc::new(stable_ledger()), fast_retry());
        assert_eq!(reader.refresh_all().await.unwrap().collateral_ratio, Some(wad(220)));

        let mut ledger = MockLedgerClient::new();
        ledger.expect_account().returning(|| Address::new("0xborrower"));
        ledger.expect_vault_address().returning(|| Address::new("0xvault"));
        ledger.expect_get_collateral_balance().returning(|_| Ok(wad(2)));
        ledger.expect_get_borrowed_amount().returning(|_| Ok(U256::ZERO));
        ledger.expect_get_current_debt().returning(|_| Ok(U256::ZERO));
        ledger.expect_get_collateral_ratio().returning(|_| {
            Err(LedgerError::Transport("connection reset".to_string()))
        });
        ledger.expect_get_interest_rate().returning(|| Ok(wad(1)));
        ledger.expect_get_max_withdrawable().returning(|_| Ok(wad(2)));
        ledger.expect_get_allowance().returning(|_, _| Ok(U256::MAX));
        ledger.expect_get_collateral_price().returning(|| Ok(wad(1_100)));
        ledger.expect_get_musd_balance().returning(|_| Ok(U256::ZERO));
        let repaid = VaultStateReader {
            ledger: Arc::new(ledger),
            cache: reader.cache(),
            retry_policy: fast_retry(),
            sequence: AtomicU64::new(10),
        };

        assert!(matches!(repaid.refresh_all().await, Err(VaultError::PartialRefresh { .. })));

        let cached = reader.position().await;
        assert_eq!(cached.current_debt, U256::ZERO);
        assert_eq!(cached.collateral_ratio, None);
        assert_eq!(cached.health_factor, None);
    }
}
