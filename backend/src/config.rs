use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use wheel_core::BalancePolicy;

use crate::storage::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub persist_path: Option<PathBuf>,
    pub admin_password: Option<String>,
    pub starting_balance: i64,
    pub balance_policy: BalancePolicy,
    pub spin_seed: Option<u64>,
    pub spin_conflict_retries: u32,
    pub storage_retry: RetryPolicy,
    pub seed_catalog: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            persist_path: None,
            admin_password: None,
            starting_balance: 100,
            balance_policy: BalancePolicy::AllowNegative,
            spin_seed: None,
            spin_conflict_retries: 3,
            storage_retry: RetryPolicy::default(),
            seed_catalog: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let retry_attempts = parse(&text, "STORAGE_READ_RETRIES")?
            .unwrap_or(defaults.storage_retry.attempts);
        let retry_backoff = parse::<u64>(&text, "STORAGE_RETRY_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.storage_retry.base_delay);

        Ok(Self {
            bind_addr: parse(&text, "BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            persist_path: text("PERSIST_PATH").map(PathBuf::from),
            admin_password: text("ADMIN_PASSWORD"),
            starting_balance: parse(&text, "STARTING_BALANCE")?
                .unwrap_or(defaults.starting_balance),
            balance_policy: parse(&text, "BALANCE_POLICY")?.unwrap_or(defaults.balance_policy),
            spin_seed: parse(&text, "SPIN_SEED")?,
            spin_conflict_retries: parse(&text, "SPIN_CONFLICT_RETRIES")?
                .unwrap_or(defaults.spin_conflict_retries),
            storage_retry: RetryPolicy {
                attempts: retry_attempts,
                base_delay: retry_backoff,
            },
            seed_catalog: parse(&text, "SEED_CATALOG")?.unwrap_or(defaults.seed_catalog),
        })
    }
}

fn parse<T: FromStr>(
    text: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match text(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
