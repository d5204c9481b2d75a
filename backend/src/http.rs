//! HTTP JSON API.

use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::DEFAULT_CORS_ORIGIN;
use crate::error::{ApiError, ValidationError};
use crate::query::SessionDetail;
use crate::validation::{
    normalize_notes, validate_beneficiary, validate_duration, validate_period, validate_status,
    validate_therapy_kind, SessionInput, TherapyKind, YearMonth,
};
use crate::AppState;

pub const SERVICE_NAME: &str = "diverge-backend";

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origin);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/sessions/record", post(record_session))
        .route("/api/sessions/monthly-count", post(monthly_count))
        .route("/api/stats/monthly", post(monthly_stats))
        .layer(from_fn_with_state(state.clone(), require_configuration))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let origin = origin.parse::<HeaderValue>().unwrap_or_else(|_| {
        warn!(%origin, "CORS_ORIGIN is not a valid header value; using default");
        HeaderValue::from_static(DEFAULT_CORS_ORIGIN)
    });
    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, ACCEPT])
}

/// Answers 500 on every request while required configuration is missing.
async fn require_configuration(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let missing = state.config.missing_required();
    if !missing.is_empty() {
        return ApiError::Configuration(format!(
            "missing required configuration: {}",
            missing.join(", ")
        ))
        .into_response();
    }
    next.run(req).await
}

fn body_error(rejection: JsonRejection) -> ApiError {
    ApiError::Validation(ValidationError::new("body", rejection.body_text()))
}

/// Text fields may arrive as JSON strings or numbers.
fn text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecordSessionRequest {
    pub beneficiario_nombre: Option<Value>,
    pub beneficiario_pin: Option<Value>,
    pub tipo_terapia: Option<Value>,
    pub duracion_minutos: Option<Value>,
    pub asistencia: Option<Value>,
    pub notas: Option<Value>,
}

impl RecordSessionRequest {
    pub fn validate(&self, period: YearMonth) -> Result<SessionInput, ValidationError> {
        let beneficiary = validate_beneficiary(
            text(&self.beneficiario_nombre).as_deref(),
            text(&self.beneficiario_pin).as_deref(),
        )?;
        let kind = validate_therapy_kind(text(&self.tipo_terapia).as_deref())?;
        let duration_minutes = validate_duration(self.duracion_minutos.as_ref())?;
        let status = validate_status(text(&self.asistencia).as_deref())?;
        let notes = normalize_notes(text(&self.notas).as_deref());

        Ok(SessionInput {
            beneficiary,
            kind,
            status,
            duration_minutes,
            notes,
            period,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RecordSessionResponse {
    pub success: bool,
    pub transaction_hash: String,
    pub session_id: Option<u32>,
    /// `null` when the hash lives only in the sandbox ledger.
    pub explorer_url: Option<String>,
    pub ledger: Option<u32>,
    pub cached: bool,
}

async fn record_session(
    State(state): State<AppState>,
    payload: Result<Json<RecordSessionRequest>, JsonRejection>,
) -> Result<Json<RecordSessionResponse>, ApiError> {
    let Json(request) = payload.map_err(body_error)?;
    let input = request.validate(YearMonth::current())?;

    let receipt = state.submitter.submit(&input).await?;

    Ok(Json(RecordSessionResponse {
        success: true,
        explorer_url: state.config.explorer_url(&receipt.transaction_hash),
        transaction_hash: receipt.transaction_hash,
        session_id: receipt.session_id,
        ledger: receipt.ledger,
        cached: receipt.cached,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MonthlyCountRequest {
    pub beneficiario_nombre: Option<Value>,
    pub beneficiario_pin: Option<Value>,
    pub mes: Option<Value>,
    pub anio: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct MonthlyCountResponse {
    pub success: bool,
    pub count: u32,
    pub breakdown: BTreeMap<TherapyKind, u32>,
    pub sessions: Vec<SessionDetail>,
    pub month: u8,
    pub year: u16,
    pub beneficiary_name: String,
}

async fn monthly_count(
    State(state): State<AppState>,
    payload: Result<Json<MonthlyCountRequest>, JsonRejection>,
) -> Result<Json<MonthlyCountResponse>, ApiError> {
    let Json(request) = payload.map_err(body_error)?;
    let beneficiary = validate_beneficiary(
        text(&request.beneficiario_nombre).as_deref(),
        text(&request.beneficiario_pin).as_deref(),
    )?;
    let period = validate_period(request.mes.as_ref(), request.anio.as_ref())?;

    let result = state.queries.monthly_count(&beneficiary, period).await?;

    Ok(Json(MonthlyCountResponse {
        success: true,
        count: result.count,
        breakdown: result.breakdown,
        sessions: result.sessions,
        month: result.period.month(),
        year: result.period.year(),
        beneficiary_name: result.beneficiary_name,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MonthlyStatsRequest {
    pub mes: Option<Value>,
    pub anio: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct MonthlyStatsResponse {
    pub success: bool,
    pub completadas: u32,
    pub no_asistio: u32,
    pub canceladas: u32,
    pub total: u32,
    pub breakdown_by_type: BTreeMap<TherapyKind, u32>,
    pub month: u8,
    pub year: u16,
    pub yyyymm: u32,
}

async fn monthly_stats(
    State(state): State<AppState>,
    payload: Result<Json<MonthlyStatsRequest>, JsonRejection>,
) -> Result<Json<MonthlyStatsResponse>, ApiError> {
    let Json(request) = payload.map_err(body_error)?;
    let period = validate_period(request.mes.as_ref(), request.anio.as_ref())?;

    let result = state.queries.center_stats(period).await;
    let stats = result.stats;

    Ok(Json(MonthlyStatsResponse {
        success: true,
        completadas: stats.completadas,
        no_asistio: stats.no_asistio,
        canceladas: stats.canceladas,
        total: stats.total(),
        breakdown_by_type: stats.by_type,
        month: period.month(),
        year: period.year(),
        yyyymm: period.yyyymm(),
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "ledger": state.config.ledger_backend.to_string(),
        "network": state.config.explorer_network(),
        "contract_id": state.config.contract_id,
        "signer_configured": state.submitter.signer_address().is_some(),
    }))
}

async fn index() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "recordSession": "POST /api/sessions/record",
            "getMonthlyCount": "POST /api/sessions/monthly-count",
            "getMonthlyStats": "POST /api/stats/monthly",
        },
    }))
}
