use std::borrow::Cow;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::ledger::{GatewayError, TxStatus};

/// Bad or missing input. Always a 400, always before any ledger call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} {constraint}")]
pub struct ValidationError {
    pub field: &'static str,
    pub constraint: Cow<'static, str>,
}

impl ValidationError {
    pub fn new(field: &'static str, constraint: impl Into<Cow<'static, str>>) -> Self {
        Self {
            field,
            constraint: constraint.into(),
        }
    }
}

/// Why a session submission did not reach `SUCCEEDED`.
///
/// Once the ledger has handed out a transaction hash every variant carries
/// it, so callers can verify finality out-of-band.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("missing signer: {0}")]
    Configuration(String),

    #[error("simulation failed: {reason}")]
    Simulation { reason: String },

    #[error("ledger rejected the transaction: {reason}")]
    Submission { hash: Option<String>, reason: String },

    #[error("transaction {hash} failed: {reason}")]
    TransactionFailed { hash: String, reason: String },

    #[error("transaction {hash} not final after {attempts} attempts (last status {last_status})")]
    Timeout {
        hash: String,
        last_status: TxStatus,
        attempts: u32,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl SubmissionError {
    pub fn transaction_hash(&self) -> Option<&str> {
        match self {
            SubmissionError::Submission { hash, .. } => hash.as_deref(),
            SubmissionError::TransactionFailed { hash, .. } | SubmissionError::Timeout { hash, .. } => {
                Some(hash)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SubmissionError::Configuration(_) => "ConfigurationError",
            SubmissionError::Simulation { .. } => "SimulationError",
            SubmissionError::Submission { .. } | SubmissionError::TransactionFailed { .. } => {
                "SubmissionError"
            }
            SubmissionError::Timeout { .. } => "TimeoutError",
            SubmissionError::Gateway(_) => "GatewayError",
        }
    }

    /// Human-readable reason for API clients.
    pub fn reason(&self) -> String {
        match self {
            SubmissionError::Simulation { reason }
            | SubmissionError::Submission { reason, .. }
            | SubmissionError::TransactionFailed { reason, .. } => decode_reason(reason),
            SubmissionError::Gateway(err) => decode_reason(&err.to_string()),
            other => other.to_string(),
        }
    }
}

/// Best-effort translation of ledger and contract failures.
///
/// Contract errors arrive as `Error(Contract, #N)` with the codes of
/// `proof_of_service::ContractError`.
pub fn decode_reason(raw: &str) -> String {
    let known: &[(&[&str], &str)] = &[
        (
            &["Error(Contract, #10)", "THERAPIST_NOT_AUTHORIZED", "TherapistNotAuthorized"],
            "therapist is not authorized to record sessions",
        ),
        (
            &["Error(Contract, #30)", "INVALID_BENEFICIARY", "InvalidInput"],
            "the contract rejected the session fields",
        ),
        (
            &["Error(Contract, #1)", "NotInitialized"],
            "the contract has not been initialized",
        ),
        (
            &["INSUFFICIENT_BALANCE", "txInsufficientBalance", "txInsufficientFee"],
            "insufficient balance to pay for the transaction",
        ),
        (
            &["txBadSeq"],
            "account sequence number is out of date; retry the request",
        ),
        (
            &["txTooLate"],
            "transaction expired before reaching the ledger; retry the request",
        ),
        (
            &["txBadAuth", "invalid signature"],
            "transaction signature was not accepted for the signing account",
        ),
        (
            &["contract not found", "MissingValue"],
            "contract call failed; check that the contract is deployed",
        ),
    ];

    known
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| raw.contains(needle)))
        .map(|(_, message)| (*message).to_string())
        .unwrap_or_else(|| {
            if raw.is_empty() {
                "unknown ledger error".to_string()
            } else {
                raw.to_string()
            }
        })
}

/// Why a read-side query could not run at all.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    Configuration(String),

    #[error("could not load the query source account: {0}")]
    SourceAccount(GatewayError),
}

/// Request-level failure, rendered as `{success:false, error, message}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ApiError::Configuration(err.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Validation(err) => json!({
                "success": false,
                "error": err.to_string(),
                "field": err.field,
                "message": "request validation failed",
            }),
            ApiError::Configuration(reason) => json!({
                "success": false,
                "error": reason,
                "message": "the server is not configured correctly",
            }),
            ApiError::Submission(err) => {
                let mut body = json!({
                    "success": false,
                    "error": err.reason(),
                    "error_kind": err.kind(),
                    "message": "the ledger did not confirm the session",
                });
                if let Some(hash) = err.transaction_hash() {
                    body["transaction_hash"] = json!(hash);
                }
                if let SubmissionError::Timeout { last_status, .. } = err {
                    body["last_status"] = json!(last_status);
                }
                body
            }
        };
        (status, Json(body)).into_response()
    }
}
