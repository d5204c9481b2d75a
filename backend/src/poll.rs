//! Finality polling.
//!
//! A submitted hash is queried at a fixed interval until the ledger reports
//! a terminal status or the attempt budget runs out. Sleeping goes through
//! [`Sleeper`] so tests can run the loop without real delay.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::ledger::{LedgerGateway, TransactionResponse, TxStatus};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl RetryPolicy {
    /// Longest time a poll loop can wait before giving up.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> Duration {
        self.slept
            .lock()
            .map(|slept| slept.iter().sum())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.slept.lock().map(|slept| slept.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Succeeded(TransactionResponse),
    Failed(TransactionResponse),
    TimedOut { last_status: TxStatus, attempts: u32 },
}

/// Wait for `hash` to reach `SUCCESS` or `FAILED`.
///
/// Each attempt sleeps one interval and then queries. `NOT_FOUND`, `PENDING`
/// and transport errors all use up an attempt and keep the loop going.
pub async fn poll_until_final(
    gateway: &dyn LedgerGateway,
    sleeper: &dyn Sleeper,
    policy: &RetryPolicy,
    hash: &str,
) -> PollOutcome {
    let mut last_status = TxStatus::NotFound;

    for attempt in 1..=policy.max_attempts {
        sleeper.sleep(policy.interval).await;

        match gateway.get_transaction(hash).await {
            Ok(response) if response.status.is_terminal() => {
                return match response.status {
                    TxStatus::Success => PollOutcome::Succeeded(response),
                    _ => PollOutcome::Failed(response),
                };
            }
            Ok(response) => {
                debug!(%hash, attempt, status = %response.status, "transaction not final yet");
                last_status = response.status;
            }
            Err(err) => {
                warn!(%hash, attempt, error = %err, "status query failed");
            }
        }
    }

    PollOutcome::TimedOut {
        last_status,
        attempts: policy.max_attempts,
    }
}
