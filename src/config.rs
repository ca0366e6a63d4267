//! Process configuration (SPEC_FULL.md §1.2), mirroring the teacher's
//! `config.rs`: a `clap::Parser` CLI pointing at a JSON file, deserialized
//! with per-field defaults, with secrets resolvable from either a literal
//! value or an environment variable reference.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("environment variable {0} referenced in config was not set")]
    MissingEnvVar(String),
}

/// A value that is either given literally in the config file, or resolved
/// from an environment variable named with `$VAR` / `${VAR}` syntax.
/// Mirrors the teacher's `LiteralOrEnv<T>`.
#[derive(Debug, Clone)]
pub enum LiteralOrEnv<T> {
    Literal(T),
    Env(String),
}

impl<T> LiteralOrEnv<T>
where
    T: std::str::FromStr + Clone,
    T::Err: fmt::Display,
{
    pub fn resolve(&self) -> Result<T, ConfigError> {
        match self {
            LiteralOrEnv::Literal(value) => Ok(value.clone()),
            LiteralOrEnv::Env(name) => {
                let raw = std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.clone()))?;
                raw.parse::<T>()
                    .map_err(|_| ConfigError::MissingEnvVar(name.clone()))
            }
        }
    }
}

impl<T> Serialize for LiteralOrEnv<T>
where
    T: fmt::Display,
{
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LiteralOrEnv::Literal(value) => serializer.serialize_str(&value.to_string()),
            LiteralOrEnv::Env(name) => serializer.serialize_str(&format!("${{{name}}}")),
        }
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: std::str::FromStr,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if let Some(name) = raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            return Ok(LiteralOrEnv::Env(name.to_string()));
        }
        if let Some(name) = raw.strip_prefix('$') {
            return Ok(LiteralOrEnv::Env(name.to_string()));
        }
        raw.parse::<T>()
            .map(LiteralOrEnv::Literal)
            .map_err(|_| serde::de::Error::custom("value is neither a literal nor an env reference"))
    }
}

/// CLI entry point (SPEC_FULL.md §1.2): `--config` / `CONFIG` points at a
/// JSON file carrying [`RelayerConfig`].
#[derive(Debug, clap::Parser)]
#[command(name = "relayer-core", about = "Admission, scheduling, wallet, and lifecycle core for a payment relayer")]
pub struct Cli {
    #[arg(long, env = "CONFIG", default_value = "config.json")]
    pub config: PathBuf,
}

/// All fields named in spec §6 "Configuration", with the defaults spec §6
/// and §4 call out by name.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayerConfig {
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_signature_window_secs")]
    pub signature_window_secs: u64,
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: i64,
    #[serde(default)]
    pub min_balance_threshold: String,
    #[serde(default = "default_max_transaction_amount")]
    pub max_transaction_amount: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_gas_price_multiplier")]
    pub gas_price_multiplier: f64,
    #[serde(default)]
    pub max_gas_price: Option<u128>,
    #[serde(default)]
    pub min_gas_price: Option<u128>,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_balance_poll_interval_secs")]
    pub balance_poll_interval_secs: u64,
    #[serde(default = "default_prepaid_ttl_secs")]
    pub prepaid_ttl_secs: u64,
    #[serde(default = "default_rollback_ttl_secs")]
    pub rollback_ttl_secs: u64,
    #[serde(default = "default_replay_grace_secs")]
    pub replay_grace_secs: u64,
    #[serde(default)]
    pub chain_id: u64,
    /// Wallet private keys, each either a literal hex string or `$ENV_VAR`
    /// (teacher's `Eip155SignersConfig` pattern).
    #[serde(default)]
    pub wallet_keys: Vec<LiteralOrEnv<String>>,
}

fn default_api_key() -> String {
    String::new()
}
fn default_signature_window_secs() -> u64 {
    300
}
fn default_max_requests_per_minute() -> i64 {
    100
}
fn default_max_transaction_amount() -> String {
    "1000000".to_string()
}
fn default_max_concurrent() -> usize {
    16
}
fn default_worker_threads() -> usize {
    4
}
fn default_max_queue_size() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_retry_delay_secs() -> u64 {
    5
}
fn default_max_retry_delay_secs() -> u64 {
    300
}
fn default_processing_timeout_secs() -> u64 {
    300
}
fn default_gas_limit() -> u64 {
    21_000
}
fn default_gas_price_multiplier() -> f64 {
    1.1
}
fn default_confirmation_blocks() -> u64 {
    1
}
fn default_balance_poll_interval_secs() -> u64 {
    30
}
fn default_prepaid_ttl_secs() -> u64 {
    24 * 3600
}
fn default_rollback_ttl_secs() -> u64 {
    3600
}
fn default_replay_grace_secs() -> u64 {
    60
}

impl RelayerConfig {
    pub fn load_from_path(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn signature_window(&self) -> Duration {
        Duration::from_secs(self.signature_window_secs)
    }

    pub fn replay_ttl(&self) -> Duration {
        Duration::from_secs(self.signature_window_secs + self.replay_grace_secs)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_secs(self.base_retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn rollback_ttl(&self) -> Duration {
        Duration::from_secs(self.rollback_ttl_secs)
    }

    pub fn balance_poll_interval(&self) -> Duration {
        Duration::from_secs(self.balance_poll_interval_secs)
    }

    /// Resolves every configured wallet key, failing closed if any
    /// referenced environment variable is unset.
    pub fn resolve_wallet_keys(&self) -> Result<Vec<String>, ConfigError> {
        self.wallet_keys
            .iter()
            .map(|entry| match entry {
                LiteralOrEnv::Literal(value) => Ok(value.clone()),
                LiteralOrEnv::Env(name) => {
                    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.clone()))
                }
            })
            .collect()
    }
}
