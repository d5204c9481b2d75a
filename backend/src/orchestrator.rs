//! Session submission orchestrator.
//!
//! Drives one session write through
//! `BUILDING -> PREPARING -> SIGNING -> SUBMITTED -> POLLING` to
//! `SUCCEEDED`, `FAILED` or `TIMED_OUT`, then mirrors the confirmed session
//! into the cache. The ledger outcome is authoritative: a cache failure is
//! logged and never changes the result.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, instrument, warn};

use crate::error::SubmissionError;
use crate::ledger::{
    ContractCall, GatewayError, LedgerGateway, ScVal, SendStatus, Signer, TransactionResponse,
    UnsignedTransaction,
};
use crate::poll::{poll_until_final, PollOutcome, RetryPolicy, Sleeper};
use crate::store::{CacheStore, NewSessionRow};
use crate::validation::SessionInput;

pub const RECORD_SESSION_FN: &str = "record_session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Building,
    Preparing,
    Signing,
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Building => "BUILDING",
            Phase::Preparing => "PREPARING",
            Phase::Signing => "SIGNING",
            Phase::Submitted => "SUBMITTED",
            Phase::Polling => "POLLING",
            Phase::Succeeded => "SUCCEEDED",
            Phase::Failed => "FAILED",
            Phase::TimedOut => "TIMED_OUT",
        })
    }
}

/// Per-identity async locks. Holding the guard for an address keeps other
/// submissions from that address waiting, so sequence numbers never race.
#[derive(Clone, Default)]
pub struct SubmissionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl SubmissionLocks {
    pub async fn acquire(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(identity.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone)]
pub struct SubmitterSettings {
    pub network_passphrase: String,
    pub contract_id: String,
    pub base_fee: u32,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

/// What a successful submission proves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub transaction_hash: String,
    /// `None` when no return value could be decoded. The hash is still proof.
    pub session_id: Option<u32>,
    pub ledger: Option<u32>,
    pub cached: bool,
}

pub struct SessionSubmitter {
    gateway: Arc<dyn LedgerGateway>,
    signer: Option<Signer>,
    cache: CacheStore,
    sleeper: Arc<dyn Sleeper>,
    settings: SubmitterSettings,
    locks: SubmissionLocks,
}

impl SessionSubmitter {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        signer: Option<Signer>,
        cache: CacheStore,
        sleeper: Arc<dyn Sleeper>,
        settings: SubmitterSettings,
    ) -> Self {
        Self {
            gateway,
            signer,
            cache,
            sleeper,
            settings,
            locks: SubmissionLocks::default(),
        }
    }

    pub fn signer_address(&self) -> Option<&str> {
        self.signer.as_ref().map(Signer::address)
    }

    #[instrument(
        skip(self, input),
        fields(kind = %input.kind, status = %input.status, yyyymm = input.period.yyyymm())
    )]
    pub async fn submit(&self, input: &SessionInput) -> Result<SubmissionReceipt, SubmissionError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            SubmissionError::Configuration("THERAPIST_SECRET is not configured".to_string())
        })?;

        let guard = self.locks.acquire(signer.address()).await;

        enter(Phase::Building, None);
        let account = self.gateway.get_account(signer.address()).await?;
        let tx = UnsignedTransaction::new(
            &account,
            self.settings.base_fee,
            self.settings.timeout_secs,
            self.record_call(signer.address(), input),
        );

        enter(Phase::Preparing, None);
        let prepared = self.gateway.prepare(tx).await.map_err(|err| {
            let reason = match err {
                GatewayError::Simulation(reason) => reason,
                other => other.to_string(),
            };
            SubmissionError::Simulation { reason }
        })?;

        enter(Phase::Signing, None);
        let signed = signer
            .sign(&self.settings.network_passphrase, prepared)
            .map_err(|err| {
                enter(Phase::Failed, None);
                SubmissionError::Submission {
                    hash: None,
                    reason: err.to_string(),
                }
            })?;

        let sent = self
            .gateway
            .send(&signed)
            .await
            .map_err(|err| SubmissionError::Submission {
                hash: None,
                reason: err.to_string(),
            })?;
        let hash = sent.hash;
        match sent.status {
            SendStatus::Pending => {}
            SendStatus::Duplicate => warn!(%hash, "ledger already knows this transaction"),
            SendStatus::Error | SendStatus::TryAgainLater => {
                enter(Phase::Failed, Some(&hash));
                let reason = sent
                    .error
                    .unwrap_or_else(|| format!("send returned {:?}", sent.status));
                return Err(SubmissionError::Submission {
                    hash: Some(hash),
                    reason,
                });
            }
        }
        enter(Phase::Submitted, Some(&hash));

        enter(Phase::Polling, Some(&hash));
        let outcome = poll_until_final(
            self.gateway.as_ref(),
            self.sleeper.as_ref(),
            &self.settings.retry,
            &hash,
        )
        .await;
        drop(guard);

        let response = match outcome {
            PollOutcome::Succeeded(response) => response,
            PollOutcome::Failed(response) => {
                enter(Phase::Failed, Some(&hash));
                return Err(SubmissionError::TransactionFailed {
                    hash,
                    reason: response
                        .error
                        .unwrap_or_else(|| "transaction failed".to_string()),
                });
            }
            PollOutcome::TimedOut {
                last_status,
                attempts,
            } => {
                enter(Phase::TimedOut, Some(&hash));
                return Err(SubmissionError::Timeout {
                    hash,
                    last_status,
                    attempts,
                });
            }
        };

        enter(Phase::Succeeded, Some(&hash));
        let session_id = extract_session_id(&response);
        if session_id.is_none() {
            warn!(%hash, "could not decode session id from ledger result");
        }

        let cached = self.write_through(signer.address(), &hash, session_id, input).await;

        Ok(SubmissionReceipt {
            transaction_hash: hash,
            session_id,
            ledger: response.ledger,
            cached,
        })
    }

    /// `record_session(therapist, name, pin, kind, status, yyyymm)`.
    fn record_call(&self, therapist: &str, input: &SessionInput) -> ContractCall {
        ContractCall {
            contract_id: self.settings.contract_id.clone(),
            function: RECORD_SESSION_FN.to_string(),
            args: vec![
                ScVal::Address(therapist.to_string()),
                ScVal::Bytes(input.beneficiary.name_bytes()),
                ScVal::Bytes(input.beneficiary.pin_bytes()),
                ScVal::Symbol(input.kind.as_str().to_string()),
                ScVal::Symbol(input.status.as_str().to_string()),
                ScVal::U32(input.period.yyyymm()),
            ],
        }
    }

    async fn write_through(
        &self,
        therapist: &str,
        hash: &str,
        session_id: Option<u32>,
        input: &SessionInput,
    ) -> bool {
        let row = NewSessionRow {
            session_id,
            transaction_hash: hash.to_string(),
            therapist_address: therapist.to_string(),
            beneficiary_name: input.beneficiary.name.clone(),
            beneficiary_pin: input.beneficiary.pin.clone(),
            therapy_type: input.kind,
            status: input.status,
            duration_minutes: Some(input.duration_minutes),
            notes: input.notes.clone(),
            yyyymm: input.period.yyyymm(),
        };

        match self.cache.insert(row).await {
            Ok(id) => {
                info!(%hash, row_id = id, "session cached");
                true
            }
            Err(err) => {
                error!(%hash, error = %err, "failed to cache confirmed session");
                false
            }
        }
    }
}

fn enter(phase: Phase, hash: Option<&str>) {
    info!(%phase, hash = hash.unwrap_or(""), "submission phase");
}

/// Session id from a successful response: typed return value, then
/// transaction metadata, then the generic result field.
pub fn extract_session_id(response: &TransactionResponse) -> Option<u32> {
    response
        .return_value
        .as_ref()
        .and_then(ScVal::as_u32)
        .or_else(|| {
            response
                .result_meta
                .as_ref()
                .and_then(|meta| meta.return_value.as_ref())
                .and_then(ScVal::as_u32)
        })
        .or_else(|| response.result.as_ref().and_then(json_u32))
}

fn json_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => map.get("value").and_then(json_u32),
        _ => None,
    }
}
