use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, VaultError};
use crate::models::{Address, U256};
use crate::orchestrator::OrchestratorConfig;
use crate::schedule::{RefetchSchedule, RetryPolicy};
use crate::simulated_ledger::SandboxConfig;
use crate::units::parse_units;
use crate::vault_monitor::MonitorConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_port: u16,
    pub monitor: MonitorConfig,
    pub orchestrator: OrchestratorConfig,
    pub sandbox: SandboxConfig,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let account = Address::new(var("ACCOUNT_ADDRESS", "0x0000000000000000000000000000000000000b0b"));
        let vault_address = Address::new(var(
            "VAULT_CONTRACT_ADDRESS",
            "0x00000000000000000000000000000000000ba017",
        ));

        let retry_policy = RetryPolicy {
            max_retries: parse_var("READ_MAX_RETRIES", &var("READ_MAX_RETRIES", "5"))?,
            base_delay: Duration::from_millis(parse_var("READ_BACKOFF_BASE_MS", &var("READ_BACKOFF_BASE_MS", "1000"))?),
            max_delay: Duration::from_millis(parse_var("READ_BACKOFF_CAP_MS", &var("READ_BACKOFF_CAP_MS", "5000"))?),
        };

        let refetch_delays = var("REFETCH_DELAYS_MS", "0,500,1000,2000,3000,5000,10000")
            .split(',')
            .map(str::trim)
            .filter(|delay| !delay.is_empty())
            .map(|delay| parse_var::<u64>("REFETCH_DELAYS_MS", delay))
            .collect::<Result<Vec<_>>>()?;

        let orchestrator = OrchestratorConfig {
            retry_policy,
            refetch_schedule: RefetchSchedule::from_millis(&refetch_delays),
            confirmation_timeout: Duration::from_secs(parse_var(
                "CONFIRMATION_TIMEOUT_SECONDS",
                &var("CONFIRMATION_TIMEOUT_SECONDS", "120"),
            )?),
            withdraw_refresh_timeout: Duration::from_millis(parse_var(
                "WITHDRAW_REFRESH_TIMEOUT_MS",
                &var("WITHDRAW_REFRESH_TIMEOUT_MS", "500"),
            )?),
            position_max_age: Duration::from_secs(parse_var(
                "POSITION_MAX_AGE_SECONDS",
                &var("POSITION_MAX_AGE_SECONDS", "30"),
            )?),
            history_limit: parse_var("TRANSACTION_HISTORY_LIMIT", &var("TRANSACTION_HISTORY_LIMIT", "50"))?,
        };

        let monitor = MonitorConfig {
            poll_interval_seconds: parse_var("POLL_INTERVAL_SECONDS", &var("POLL_INTERVAL_SECONDS", "30"))?,
            health_warning_threshold: parse_amount(
                "HEALTH_WARNING_THRESHOLD",
                &var("HEALTH_WARNING_THRESHOLD", "1.2"),
            )?,
        };

        let sandbox = SandboxConfig {
            account,
            vault_address,
            collateral_wallet_balance: parse_amount("SANDBOX_BTC_BALANCE", &var("SANDBOX_BTC_BALANCE", "10"))?,
            musd_wallet_balance: parse_amount("SANDBOX_MUSD_BALANCE", &var("SANDBOX_MUSD_BALANCE", "0"))?,
            collateral_price: parse_amount("SANDBOX_BTC_PRICE", &var("SANDBOX_BTC_PRICE", "60000"))?,
            interest_rate: parse_amount("SANDBOX_INTEREST_RATE", &var("SANDBOX_INTEREST_RATE", "1"))?,
            confirmation_delay: Duration::from_millis(parse_var(
                "SANDBOX_CONFIRMATION_DELAY_MS",
                &var("SANDBOX_CONFIRMATION_DELAY_MS", "2000"),
            )?),
            read_lag: Duration::from_millis(parse_var("SANDBOX_READ_LAG_MS", &var("SANDBOX_READ_LAG_MS", "1500"))?),
        };

        Ok(Config {
            api_port: parse_var("API_PORT", &var("API_PORT", "8080"))?,
            monitor,
            orchestrator,
            sandbox,
        })
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| VaultError::ConfigurationError(format!("Invalid {}", key)))
}

fn parse_amount(key: &str, value: &str) -> Result<U256> {
    parse_units(value).map_err(|e| VaultError::ConfigurationError(format!("Invalid {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WAD;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.orchestrator.retry_policy.max_retries, 5);
        assert_eq!(config.orchestrator.refetch_schedule.delays.len(), 7);
        assert_eq!(config.orchestrator.withdraw_refresh_timeout, Duration::from_millis(500));
        assert_eq!(config.sandbox.collateral_price, U256::from(60_000u64) * WAD);
        assert_eq!(config.monitor.health_warning_threshold, WAD + WAD / U256::from(5u64));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("API_PORT", "9090"),
            ("REFETCH_DELAYS_MS", "0, 250"),
            ("SANDBOX_BTC_PRICE", "1100.5"),
            ("ACCOUNT_ADDRESS", "0xabc"),
        ]))
        .unwrap();

        assert_eq!(config.api_port, 9090);
        assert_eq!(
            config.orchestrator.refetch_schedule.delays,
            vec![Duration::ZERO, Duration::from_millis(250)]
        );
        assert_eq!(config.sandbox.collateral_price, U256::from(11_005u64) * WAD / U256::from(10u64));
        assert_eq!(config.sandbox.account.as_str(), "0xabc");
    }

    #[test]
    fn test_invalid_value_names_the_key() {
        let err = Config::from_lookup(lookup(&[("API_PORT", "eighty")])).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Invalid API_PORT");

        let err = Config::from_lookup(lookup(&[("SANDBOX_BTC_BALANCE", "-1")])).unwrap_err();
        assert!(matches!(err, VaultError::ConfigurationError(_)));
    }
}
