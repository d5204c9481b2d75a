//! Environment configuration, read once at startup.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::poll::{RetryPolicy, DEFAULT_INTERVAL, DEFAULT_MAX_ATTEMPTS};

pub const REQUIRED_KEYS: [&str; 3] = ["SOROBAN_RPC_URL", "NETWORK_PASSPHRASE", "CONTRACT_ID"];

pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:8000";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATABASE_PATH: &str = "diverge.db";
pub const DEFAULT_BASE_FEE: u32 = 100;
pub const DEFAULT_TX_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_EXPLORER_BASE_URL: &str = "https://stellar.expert/explorer";
pub const DEFAULT_INDEXING_POLLS: u32 = 1;
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;

/// Where ledger calls go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LedgerBackend {
    /// The Stellar RPC server at `SOROBAN_RPC_URL`.
    #[default]
    Rpc,
    /// In-process Soroban host. Its transactions exist nowhere else, so the
    /// cache is kept in memory and no explorer links are produced.
    Sandbox,
}

impl FromStr for LedgerBackend {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "rpc" => Ok(LedgerBackend::Rpc),
            "sandbox" => Ok(LedgerBackend::Sandbox),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LedgerBackend::Rpc => "rpc",
            LedgerBackend::Sandbox => "sandbox",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub ledger_backend: LedgerBackend,
    pub rpc_url: Option<String>,
    pub rpc_timeout: Duration,
    pub network_passphrase: Option<String>,
    pub contract_id: Option<String>,
    pub therapist_secret: Option<String>,
    pub admin_secret: Option<String>,
    pub cors_origin: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub base_fee: u32,
    pub tx_timeout_secs: u64,
    pub explorer_base_url: String,
    pub sandbox_indexing_polls: u32,
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ledger_backend: LedgerBackend::default(),
            rpc_url: None,
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            network_passphrase: None,
            contract_id: None,
            therapist_secret: None,
            admin_secret: None,
            cors_origin: DEFAULT_CORS_ORIGIN.to_string(),
            port: DEFAULT_PORT,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            poll_interval: DEFAULT_INTERVAL,
            poll_max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_fee: DEFAULT_BASE_FEE,
            tx_timeout_secs: DEFAULT_TX_TIMEOUT_SECS,
            explorer_base_url: DEFAULT_EXPLORER_BASE_URL.to_string(),
            sandbox_indexing_polls: DEFAULT_INDEXING_POLLS,
            log_json: false,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as absent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        Ok(Self {
            ledger_backend: parse(&get, "LEDGER_BACKEND", defaults.ledger_backend)?,
            rpc_url: get("SOROBAN_RPC_URL"),
            rpc_timeout: Duration::from_secs(parse(
                &get,
                "RPC_TIMEOUT_SECS",
                DEFAULT_RPC_TIMEOUT_SECS,
            )?),
            network_passphrase: get("NETWORK_PASSPHRASE"),
            contract_id: get("CONTRACT_ID"),
            therapist_secret: get("THERAPIST_SECRET"),
            admin_secret: get("ADMIN_SECRET"),
            cors_origin: get("CORS_ORIGIN").unwrap_or(defaults.cors_origin),
            port: parse(&get, "PORT", defaults.port)?,
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            poll_interval: Duration::from_millis(parse(
                &get,
                "POLL_INTERVAL_MS",
                u64::try_from(defaults.poll_interval.as_millis()).unwrap_or(2_000),
            )?),
            poll_max_attempts: parse(&get, "POLL_MAX_ATTEMPTS", defaults.poll_max_attempts)?,
            base_fee: parse(&get, "BASE_FEE", defaults.base_fee)?,
            tx_timeout_secs: parse(&get, "TX_TIMEOUT_SECS", defaults.tx_timeout_secs)?,
            explorer_base_url: get("EXPLORER_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.explorer_base_url),
            sandbox_indexing_polls: parse(
                &get,
                "SANDBOX_INDEXING_POLLS",
                defaults.sandbox_indexing_polls,
            )?,
            log_json: get("DIVERGE_LOG_JSON")
                .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
                .unwrap_or(false),
        })
    }

    /// Required keys that are not set, in declaration order.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let present = [
            self.rpc_url.is_some(),
            self.network_passphrase.is_some(),
            self.contract_id.is_some(),
        ];
        REQUIRED_KEYS
            .iter()
            .zip(present)
            .filter(|(_, present)| !present)
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.poll_max_attempts,
            interval: self.poll_interval,
        }
    }

    /// Explorer network segment for the configured passphrase.
    pub fn explorer_network(&self) -> &'static str {
        match self.network_passphrase.as_deref() {
            Some(p) if p.starts_with("Public Global Stellar Network") => "public",
            Some(p) if p.starts_with("Test SDF Future Network") => "futurenet",
            _ => "testnet",
        }
    }

    /// Public explorer link for a hash. `None` for sandbox hashes, which no
    /// explorer can resolve.
    pub fn explorer_url(&self, transaction_hash: &str) -> Option<String> {
        match self.ledger_backend {
            LedgerBackend::Sandbox => None,
            LedgerBackend::Rpc => Some(format!(
                "{}/{}/tx/{}",
                self.explorer_base_url,
                self.explorer_network(),
                transaction_hash
            )),
        }
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
