//! Backend for the DIVERGE proof-of-service ledger.
//!
//! Records therapy sessions through the `proof_of_service` contract, keeps a
//! local SQLite mirror for the fields the contract does not store, and
//! serves monthly counts and center statistics over a JSON API.
//!
//! Ledger calls go to a Stellar RPC server. Builds with the `sandbox`
//! feature can instead run the contract in-process (`LEDGER_BACKEND=sandbox`).

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod http;
pub mod ledger;
pub mod orchestrator;
pub mod poll;
pub mod query;
pub mod store;
pub mod validation;

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

pub use config::{ConfigError, LedgerBackend, ServiceConfig};
pub use http::build_router;
#[cfg(feature = "sandbox")]
pub use ledger::{SandboxConfig, SandboxError, SandboxLedger};
pub use ledger::{LedgerGateway, RpcLedger, Signer};
pub use orchestrator::{SessionSubmitter, SubmitterSettings};
pub use poll::{RetryPolicy, Sleeper, TokioSleeper};
pub use query::{QueryService, QuerySettings};
pub use store::{CacheError, CacheStore};

/// Per-request context shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub submitter: Arc<SessionSubmitter>,
    pub queries: Arc<QueryService>,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[cfg(feature = "sandbox")]
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("LEDGER_BACKEND=sandbox requires a build with the `sandbox` feature")]
    SandboxDisabled,

    #[error("failed to bind listener: {0}")]
    Io(#[from] std::io::Error),
}

impl AppState {
    /// Wire services around an already constructed gateway and cache.
    pub fn new(
        config: ServiceConfig,
        gateway: Arc<dyn LedgerGateway>,
        cache: CacheStore,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let signer = therapist_signer(&config);
        let network_passphrase = config.network_passphrase.clone().unwrap_or_default();
        let contract_id = config.contract_id.clone().unwrap_or_default();

        let queries = QueryService::new(
            Arc::clone(&gateway),
            cache.clone(),
            QuerySettings {
                contract_id: contract_id.clone(),
                source_account: signer.as_ref().map(|s| s.address().to_string()),
                base_fee: config.base_fee,
                timeout_secs: config.tx_timeout_secs,
            },
        );
        let submitter = SessionSubmitter::new(
            gateway,
            signer,
            cache,
            sleeper,
            SubmitterSettings {
                network_passphrase,
                contract_id,
                base_fee: config.base_fee,
                timeout_secs: config.tx_timeout_secs,
                retry: config.retry_policy(),
            },
        );

        Self {
            config: Arc::new(config),
            submitter: Arc::new(submitter),
            queries: Arc::new(queries),
        }
    }
}

/// The configured therapist identity. A malformed secret is reported and
/// treated as absent.
pub fn therapist_signer(config: &ServiceConfig) -> Option<Signer> {
    let secret = config.therapist_secret.as_deref()?;
    match Signer::from_secret(secret) {
        Ok(signer) => Some(signer),
        Err(err) => {
            warn!(error = %err, "THERAPIST_SECRET is invalid; submissions are disabled");
            None
        }
    }
}

/// The gateway `LEDGER_BACKEND` selects.
pub fn connect_ledger(config: &ServiceConfig) -> Result<Arc<dyn LedgerGateway>, StartupError> {
    match config.ledger_backend {
        LedgerBackend::Rpc => {
            let url = config.rpc_url.clone().unwrap_or_default();
            info!(rpc_url = %url, timeout = ?config.rpc_timeout, "using stellar rpc ledger");
            Ok(Arc::new(RpcLedger::new(url, config.rpc_timeout)))
        }
        #[cfg(feature = "sandbox")]
        LedgerBackend::Sandbox => Ok(Arc::new(start_sandbox(config)?)),
        #[cfg(not(feature = "sandbox"))]
        LedgerBackend::Sandbox => Err(StartupError::SandboxDisabled),
    }
}

/// Session cache for the selected backend. A sandbox ledger forgets its
/// transactions on exit, so its cache lives in memory and goes with it.
pub async fn open_cache(config: &ServiceConfig) -> Result<CacheStore, StartupError> {
    match config.ledger_backend {
        LedgerBackend::Rpc => {
            let cache = CacheStore::open(&config.database_path).await?;
            info!(path = %config.database_path.display(), "session cache opened");
            Ok(cache)
        }
        LedgerBackend::Sandbox => {
            warn!(
                path = %config.database_path.display(),
                "sandbox ledger: using an in-memory session cache instead of DATABASE_PATH"
            );
            Ok(CacheStore::open_in_memory()?)
        }
    }
}

/// Start the in-process sandbox ledger for `config`, with the configured
/// therapist already allow-listed.
#[cfg(feature = "sandbox")]
pub fn start_sandbox(config: &ServiceConfig) -> Result<SandboxLedger, SandboxError> {
    let admin_secret = config
        .admin_secret
        .clone()
        .filter(|secret| match Signer::from_secret(secret) {
            Ok(_) => true,
            Err(_) => {
                warn!("ADMIN_SECRET is invalid; using a derived sandbox admin");
                false
            }
        });

    let ledger = SandboxLedger::start(SandboxConfig {
        network_passphrase: config.network_passphrase.clone().unwrap_or_default(),
        contract_id: config.contract_id.clone().unwrap_or_default(),
        admin_secret,
        therapists: therapist_signer(config)
            .map(|s| vec![s.address().to_string()])
            .unwrap_or_default(),
        indexing_polls: config.sandbox_indexing_polls,
        first_ledger: crate::ledger::boot_ledger(),
    })?;
    info!(admin = ledger.admin(), "sandbox ledger started");
    Ok(ledger)
}
