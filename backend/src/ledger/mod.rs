//! Ledger Gateway seam.
//!
//! The orchestrator only ever talks to a [`LedgerGateway`]. [`RpcLedger`]
//! reaches a Stellar RPC server; with the `sandbox` feature an in-process
//! Soroban host stands in for local development. This module defines the
//! values that cross the seam; [`envelope`] gives them their XDR form.

pub mod envelope;
mod rpc;
#[cfg(feature = "sandbox")]
mod sandbox;
mod signer;


use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use envelope::{transaction_hash, EnvelopeError};
pub use rpc::RpcLedger;
#[cfg(feature = "sandbox")]
pub use sandbox::{boot_ledger, SandboxConfig, SandboxError, SandboxLedger};
pub use signer::{verify as verify_signature, Signer, SignerError};

/// Contract value as seen by the backend. Bytes travel hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ScVal {
    Void,
    Bool(bool),
    U32(u32),
    U64(u64),
    I128(i128),
    Symbol(String),
    Bytes(#[serde(with = "hex::serde")] Vec<u8>),
    Address(String),
    Vec(Vec<ScVal>),
}

impl ScVal {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ScVal::U32(v) => Some(*v),
            _ => None,
        }
    }
}

/// One invocation of a deployed contract function with positional arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCall {
    pub contract_id: String,
    pub function: String,
    pub args: Vec<ScVal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub sequence: i64,
}

/// A contract call wrapped in a not-yet-prepared transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub source: String,
    pub sequence: i64,
    pub base_fee: u32,
    /// Upper time bound, unix seconds. The ledger rejects the transaction
    /// after it.
    pub max_time: u64,
    pub call: ContractCall,
}

impl UnsignedTransaction {
    /// Build a transaction that consumes the account's next sequence number
    /// and expires `timeout_secs` from now.
    pub fn new(account: &Account, base_fee: u32, timeout_secs: u64, call: ContractCall) -> Self {
        Self {
            source: account.address.clone(),
            sequence: account.sequence + 1,
            base_fee,
            max_time: unix_now().saturating_add(timeout_secs),
            call,
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub instructions: u64,
    pub read_bytes: u32,
    pub write_bytes: u32,
    pub min_resource_fee: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Simulation {
    pub result: Option<ScVal>,
    pub resources: ResourceEstimate,
    pub latest_ledger: u32,
    /// Base64 `SorobanTransactionData` (footprint and resource limits).
    pub transaction_data: Option<String>,
    /// Base64 `SorobanAuthorizationEntry` values the call needs.
    pub auth: Vec<String>,
}

/// The executable form produced by simulation. This is what gets signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    pub tx: UnsignedTransaction,
    pub resources: ResourceEstimate,
    pub total_fee: i64,
    pub soroban_data: Option<String>,
    pub auth: Vec<String>,
}

impl PreparedTransaction {
    /// Attach what simulation reported: the fee becomes the inclusion fee
    /// plus the minimum resource fee.
    pub fn assemble(tx: UnsignedTransaction, simulation: Simulation) -> Self {
        let total_fee = i64::from(tx.base_fee) + simulation.resources.min_resource_fee;
        Self {
            tx,
            resources: simulation.resources,
            total_fee,
            soroban_data: simulation.transaction_data,
            auth: simulation.auth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub prepared: PreparedTransaction,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    Pending,
    Duplicate,
    TryAgainLater,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub hash: String,
    pub status: SendStatus,
    pub error: Option<String>,
}

/// Finality status reported for a submitted transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    NotFound,
    Pending,
    Success,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Success | TxStatus::Failed)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxStatus::NotFound => "NOT_FOUND",
            TxStatus::Pending => "PENDING",
            TxStatus::Success => "SUCCESS",
            TxStatus::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    pub return_value: Option<ScVal>,
    pub events: u32,
}

/// `getTransaction`-style response. A successful contract call may expose
/// its return value in any of `return_value`, `result_meta` or `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub status: TxStatus,
    pub ledger: Option<u32>,
    pub return_value: Option<ScVal>,
    pub result_meta: Option<TransactionMeta>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TransactionResponse {
    pub fn not_found() -> Self {
        Self {
            status: TxStatus::NotFound,
            ledger: None,
            return_value: None,
            result_meta: None,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("account {0} not found")]
    AccountNotFound(String),

    #[error("simulation failed: {0}")]
    Simulation(String),

    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("could not encode transaction: {0}")]
    Encoding(#[from] EnvelopeError),

    #[error("ledger gateway is shut down")]
    Unavailable,
}

/// Connection to the ledger's RPC surface.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn get_account(&self, address: &str) -> Result<Account, GatewayError>;

    /// Dry-run a transaction without committing it.
    async fn simulate(&self, tx: &UnsignedTransaction) -> Result<Simulation, GatewayError>;

    /// Simulate and attach resource limits and fees.
    async fn prepare(&self, tx: UnsignedTransaction) -> Result<PreparedTransaction, GatewayError>;

    async fn send(&self, tx: &SignedTransaction) -> Result<SendResponse, GatewayError>;

    async fn get_transaction(&self, hash: &str) -> Result<TransactionResponse, GatewayError>;
}
