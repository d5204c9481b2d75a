//! Read-side queries: per-beneficiary monthly counts from the ledger and
//! center-wide statistics from the cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{instrument, warn};

use crate::error::QueryError;
use crate::ledger::{ContractCall, LedgerGateway, ScVal, UnsignedTransaction};
use crate::store::{CacheStore, MonthlyStats, SessionRow};
use crate::validation::{Beneficiary, TherapyKind, YearMonth};

pub const MONTHLY_COUNT_FN: &str = "get_monthly_count";

/// One cached session as shown to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDetail {
    pub session_id: Option<u32>,
    pub transaction_hash: String,
    pub tipo: String,
    pub asistencia: String,
    pub duration_minutes: Option<u32>,
    pub notes: Option<String>,
    pub therapist_address: String,
    pub fecha: String,
}

impl From<SessionRow> for SessionDetail {
    fn from(row: SessionRow) -> Self {
        Self {
            session_id: row.session_id,
            transaction_hash: row.transaction_hash,
            tipo: row.therapy_type,
            asistencia: row.status,
            duration_minutes: row.duration_minutes,
            notes: row.notes,
            therapist_address: row.therapist_address,
            fecha: row.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyCount {
    pub count: u32,
    pub breakdown: BTreeMap<TherapyKind, u32>,
    pub sessions: Vec<SessionDetail>,
    pub period: YearMonth,
    pub beneficiary_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CenterStats {
    pub stats: MonthlyStats,
    pub period: YearMonth,
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub contract_id: String,
    /// Source account for read-only simulations.
    pub source_account: Option<String>,
    pub base_fee: u32,
    pub timeout_secs: u64,
}

pub struct QueryService {
    gateway: Arc<dyn LedgerGateway>,
    cache: CacheStore,
    settings: QuerySettings,
}

impl QueryService {
    pub fn new(gateway: Arc<dyn LedgerGateway>, cache: CacheStore, settings: QuerySettings) -> Self {
        Self {
            gateway,
            cache,
            settings,
        }
    }

    /// Ledger counts per therapy kind plus the cached rows for the month.
    ///
    /// Kinds are read one at a time; a failed read counts as zero for that
    /// kind only.
    #[instrument(skip(self, beneficiary), fields(yyyymm = period.yyyymm()))]
    pub async fn monthly_count(
        &self,
        beneficiary: &Beneficiary,
        period: YearMonth,
    ) -> Result<MonthlyCount, QueryError> {
        let source = self.settings.source_account.as_deref().ok_or_else(|| {
            QueryError::Configuration(
                "no account available for ledger queries; set THERAPIST_SECRET".to_string(),
            )
        })?;
        let account = self
            .gateway
            .get_account(source)
            .await
            .map_err(QueryError::SourceAccount)?;

        let mut breakdown = BTreeMap::new();
        for kind in TherapyKind::ALL {
            let call = ContractCall {
                contract_id: self.settings.contract_id.clone(),
                function: MONTHLY_COUNT_FN.to_string(),
                args: vec![
                    ScVal::Bytes(beneficiary.name_bytes()),
                    ScVal::Bytes(beneficiary.pin_bytes()),
                    ScVal::U32(period.yyyymm()),
                    ScVal::Symbol(kind.as_str().to_string()),
                ],
            };
            let tx = UnsignedTransaction::new(
                &account,
                self.settings.base_fee,
                self.settings.timeout_secs,
                call,
            );

            let count = match self.gateway.simulate(&tx).await {
                Ok(simulation) => match simulation.result.as_ref().and_then(ScVal::as_u32) {
                    Some(count) => count,
                    None => {
                        warn!(%kind, result = ?simulation.result, "monthly count returned no u32");
                        0
                    }
                },
                Err(err) => {
                    warn!(%kind, error = %err, "monthly count read failed; counting zero");
                    0
                }
            };
            breakdown.insert(kind, count);
        }

        let sessions = match self
            .cache
            .list_for_beneficiary(&beneficiary.name, &beneficiary.pin, period.yyyymm())
            .await
        {
            Ok(rows) => rows.into_iter().map(SessionDetail::from).collect(),
            Err(err) => {
                warn!(error = %err, "cache listing failed; returning no session details");
                Vec::new()
            }
        };

        Ok(MonthlyCount {
            count: breakdown.values().sum(),
            breakdown,
            sessions,
            period,
            beneficiary_name: beneficiary.name.clone(),
        })
    }

    /// Center-wide counts from the cache. Never fails: a cache error yields
    /// all-zero statistics.
    #[instrument(skip(self), fields(yyyymm = period.yyyymm()))]
    pub async fn center_stats(&self, period: YearMonth) -> CenterStats {
        let stats = match self.cache.monthly_stats(period.yyyymm()).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %err, "cache stats failed; reporting zeros");
                MonthlyStats::zero()
            }
        };
        CenterStats { stats, period }
    }
}
