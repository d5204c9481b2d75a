//! [`LedgerGateway`] over a Stellar RPC server (JSON-RPC 2.0 on HTTP).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::envelope::{self, EnvelopeError};
use super::{
    Account, GatewayError, LedgerGateway, PreparedTransaction, ResourceEstimate, ScVal,
    SendResponse, SendStatus, SignedTransaction, Simulation, TransactionResponse, TxStatus,
    UnsignedTransaction,
};

#[derive(Debug, Deserialize)]
struct RpcEnvelope<R> {
    result: Option<R>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct LedgerEntries {
    entries: Option<Vec<LedgerEntry>>,
}

#[derive(Debug, Deserialize)]
struct LedgerEntry {
    xdr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResult {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: Option<Vec<HostFunctionResult>>,
    #[serde(default)]
    transaction_data: Option<String>,
    #[serde(default)]
    min_resource_fee: Option<String>,
    #[serde(default)]
    latest_ledger: u32,
}

#[derive(Debug, Deserialize)]
struct HostFunctionResult {
    #[serde(default)]
    auth: Option<Vec<String>>,
    xdr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResult {
    hash: String,
    status: String,
    #[serde(default)]
    error_result_xdr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetTransactionResult {
    status: String,
    #[serde(default)]
    ledger: Option<u32>,
    #[serde(default)]
    result_xdr: Option<String>,
    #[serde(default)]
    result_meta_xdr: Option<String>,
    #[serde(default)]
    return_value: Option<String>,
}

/// Client for one RPC endpoint. Cheap to share behind an `Arc`.
pub struct RpcLedger {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<R, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        debug!(method, id, "rpc request");

        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("{method}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Transport(format!("{method}: HTTP {status}")));
        }

        let reply: RpcEnvelope<R> = response
            .json()
            .await
            .map_err(|e| GatewayError::Transport(format!("{method}: malformed response: {e}")))?;
        match (reply.result, reply.error) {
            (_, Some(err)) => Err(GatewayError::Rpc {
                code: err.code,
                message: err.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(GatewayError::Transport(format!("{method}: empty response"))),
        }
    }
}

impl std::fmt::Debug for RpcLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcLedger").field("url", &self.url).finish()
    }
}

#[async_trait]
impl LedgerGateway for RpcLedger {
    async fn get_account(&self, address: &str) -> Result<Account, GatewayError> {
        let key = envelope::account_ledger_key(address)?;
        let found: LedgerEntries = self
            .call("getLedgerEntries", json!({ "keys": [key] }))
            .await?;
        let entry = found
            .entries
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::AccountNotFound(address.to_string()))?;

        Ok(Account {
            address: address.to_string(),
            sequence: envelope::account_sequence(&entry.xdr)?,
        })
    }

    async fn simulate(&self, tx: &UnsignedTransaction) -> Result<Simulation, GatewayError> {
        let transaction = envelope::simulation_envelope(tx)?;
        let simulated: SimulateResult = self
            .call("simulateTransaction", json!({ "transaction": transaction }))
            .await
            .map_err(|err| match err {
                GatewayError::Rpc { message, .. } => GatewayError::Simulation(message),
                other => other,
            })?;
        simulation(simulated)
    }

    async fn prepare(&self, tx: UnsignedTransaction) -> Result<PreparedTransaction, GatewayError> {
        let simulation = self.simulate(&tx).await?;
        Ok(PreparedTransaction::assemble(tx, simulation))
    }

    async fn send(&self, tx: &SignedTransaction) -> Result<SendResponse, GatewayError> {
        let transaction = envelope::signed_envelope(tx)?;
        let sent: SendResult = self
            .call("sendTransaction", json!({ "transaction": transaction }))
            .await?;
        Ok(send_response(sent))
    }

    async fn get_transaction(&self, hash: &str) -> Result<TransactionResponse, GatewayError> {
        let raw: Value = self.call("getTransaction", json!({ "hash": hash })).await?;
        let parsed: GetTransactionResult = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::Transport(format!("getTransaction: {e}")))?;
        Ok(transaction_response(parsed, raw))
    }
}

fn simulation(simulated: SimulateResult) -> Result<Simulation, GatewayError> {
    if let Some(error) = simulated.error {
        return Err(GatewayError::Simulation(error));
    }

    let min_resource_fee = match simulated.min_resource_fee.as_deref() {
        Some(fee) => fee
            .parse::<i64>()
            .map_err(|_| GatewayError::Transport(format!("bad minResourceFee {fee}")))?,
        None => 0,
    };
    let resources = match simulated.transaction_data.as_deref() {
        Some(data) => envelope::declared_resources(data, min_resource_fee)?,
        None => ResourceEstimate {
            min_resource_fee,
            ..ResourceEstimate::default()
        },
    };

    let first = simulated.results.unwrap_or_default().into_iter().next();
    let (result, auth) = match first {
        Some(host) => (
            decode_value(&host.xdr),
            host.auth.unwrap_or_default(),
        ),
        None => (None, Vec::new()),
    };

    Ok(Simulation {
        result,
        resources,
        latest_ledger: simulated.latest_ledger,
        transaction_data: simulated.transaction_data,
        auth,
    })
}

fn send_response(sent: SendResult) -> SendResponse {
    let status = match sent.status.as_str() {
        "PENDING" => SendStatus::Pending,
        "DUPLICATE" => SendStatus::Duplicate,
        "TRY_AGAIN_LATER" => SendStatus::TryAgainLater,
        _ => SendStatus::Error,
    };
    let error = match (status, sent.error_result_xdr.as_deref()) {
        (_, Some(xdr)) => Some(result_code(xdr)),
        (SendStatus::Error, None) => Some(format!("sendTransaction returned {}", sent.status)),
        _ => None,
    };
    SendResponse {
        hash: sent.hash,
        status,
        error,
    }
}

fn transaction_response(parsed: GetTransactionResult, raw: Value) -> TransactionResponse {
    let status = match parsed.status.as_str() {
        "SUCCESS" => TxStatus::Success,
        "FAILED" => TxStatus::Failed,
        "NOT_FOUND" => return TransactionResponse::not_found(),
        _ => TxStatus::Pending,
    };

    let result_meta = parsed
        .result_meta_xdr
        .as_deref()
        .and_then(|meta| match envelope::meta_return_value(meta) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(error = %err, "undecodable transaction meta");
                None
            }
        });
    let error = (status == TxStatus::Failed).then(|| {
        parsed
            .result_xdr
            .as_deref()
            .map(result_code)
            .unwrap_or_else(|| "transaction failed".to_string())
    });

    TransactionResponse {
        status,
        ledger: parsed.ledger,
        return_value: parsed.return_value.as_deref().and_then(decode_value),
        result_meta,
        result: Some(raw),
        error,
    }
}

fn decode_value(xdr: &str) -> Option<ScVal> {
    match envelope::decode_sc_val(xdr) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "undecodable contract value");
            None
        }
    }
}

fn result_code(xdr: &str) -> String {
    envelope::result_code(xdr).unwrap_or_else(|err: EnvelopeError| {
        warn!(error = %err, "undecodable transaction result");
        xdr.to_string()
    })
}
