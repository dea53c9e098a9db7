//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::collateral::{CollateralModel, DEFAULT_COLLATERAL_FACTOR_BPS, DEFAULT_PENALTY_RATE_BPS};
use crate::db::{self, OperationRecord, PhaseLogRecord};
use crate::errors::CollateralError;
use crate::types::{Amount, CircleId, CollateralQuote};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/collateral", get(collateral_schedule))
        .route("/circles/:id/operations", get(get_circle_operations))
        .route("/circles/:id/phases", get(get_circle_phases))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct OperationsResponse {
    pub circle_id: CircleId,
    pub count: usize,
    pub operations: Vec<OperationRecord>,
}

#[derive(Serialize)]
pub struct PhasesResponse {
    pub circle_id: CircleId,
    pub count: usize,
    pub phases: Vec<PhaseLogRecord>,
}

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub participants: u32,
    pub monthly_payment: Amount,
    pub collateral_factor_bps: u32,
    pub penalty: Amount,
    pub schedule: Vec<CollateralQuote>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleQuery {
    pub participants: u32,
    pub monthly_payment: Amount,
    pub collateral_factor_bps: Option<u32>,
    pub penalty_rate_bps: Option<u32>,
}

fn error_response(status: StatusCode, error: String) -> axum::response::Response {
    (status, Json(serde_json::json!(ErrorResponse { error }))).into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /circles/:id/operations`
///
/// Journaled batch items, payouts and cycle advances of one circle.
pub async fn get_circle_operations(
    State(state): State<Arc<ApiState>>,
    Path(circle_id): Path<CircleId>,
) -> impl IntoResponse {
    match db::operations_for_circle(&state.pool, circle_id).await {
        Ok(operations) => {
            let count = operations.len();
            (
                StatusCode::OK,
                Json(serde_json::json!(OperationsResponse {
                    circle_id,
                    count,
                    operations,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `GET /circles/:id/phases`
pub async fn get_circle_phases(
    State(state): State<Arc<ApiState>>,
    Path(circle_id): Path<CircleId>,
) -> impl IntoResponse {
    match db::phases_for_circle(&state.pool, circle_id).await {
        Ok(phases) => {
            let count = phases.len();
            (
                StatusCode::OK,
                Json(serde_json::json!(PhasesResponse {
                    circle_id,
                    count,
                    phases,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `GET /collateral?participants=10&monthly_payment=50000000`
///
/// Collateral schedule for a prospective circle. Needs no ledger access.
pub async fn collateral_schedule(Query(query): Query<ScheduleQuery>) -> impl IntoResponse {
    match build_schedule(&query) {
        Ok(schedule) => (StatusCode::OK, Json(serde_json::json!(schedule))).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

fn build_schedule(query: &ScheduleQuery) -> Result<ScheduleResponse, CollateralError> {
    let model = CollateralModel::new(
        query.collateral_factor_bps.unwrap_or(DEFAULT_COLLATERAL_FACTOR_BPS),
        query.penalty_rate_bps.unwrap_or(DEFAULT_PENALTY_RATE_BPS),
    );
    let schedule = model.schedule(query.monthly_payment, query.participants)?;
    Ok(ScheduleResponse {
        participants: query.participants,
        monthly_payment: query.monthly_payment,
        collateral_factor_bps: model.factor_bps,
        penalty: model.penalty(query.monthly_payment),
        schedule,
    })
}
