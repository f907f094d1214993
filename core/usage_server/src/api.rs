use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use usage_protocol::{ErrorBody, Report, TrackResponse, REPORT_PATH, TRACK_PATH};

use crate::{
    report::build_report,
    store::{self, StoreError},
};

#[derive(Clone)]
pub struct AppState {
    pub conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Internal server error")]
    PersistenceFailure(#[from] rusqlite::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Overflow(_) => ApiError::InvalidRequest(err.to_string()),
            StoreError::Sqlite(err) => ApiError::PersistenceFailure(err),
        }
    }
}

const MISSING_FIELDS: &str = "Missing userId or data";

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(TRACK_PATH, post(post_track).options(options_ok))
        .route(&format!("{REPORT_PATH}/:user_id"), get(get_report))
        .with_state(state)
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "usage_server",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

struct TrackInput {
    user_id: String,
    data: BTreeMap<String, i64>,
}

/// Validates a raw `/api/track` body. Durations must be whole, non-negative
/// numbers that fit the store's integer column.
fn parse_track_input(payload: &Value) -> Result<TrackInput, ApiError> {
    let missing = || ApiError::InvalidRequest(MISSING_FIELDS.to_string());

    // Blank ids are rejected; any other id is stored exactly as sent.
    let user_id = payload
        .get("userId")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(missing)?;
    let raw = payload
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(missing)?;

    let mut data = BTreeMap::new();
    for (key, value) in raw {
        let seconds = value
            .as_i64()
            .filter(|v| *v >= 0)
            .ok_or_else(|| ApiError::InvalidRequest(format!("Invalid duration for key '{key}'")))?;
        data.insert(key.clone(), seconds);
    }

    Ok(TrackInput {
        user_id: user_id.to_string(),
        data,
    })
}

async fn post_track(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<TrackResponse>, ApiError> {
    let Json(payload) = payload.map_err(|rejection| {
        debug!("unreadable track body: {rejection}");
        ApiError::InvalidRequest(MISSING_FIELDS.to_string())
    })?;
    let input = parse_track_input(&payload)?;

    let mut conn = state.conn.lock().await;
    let record = store::increment_usage(&mut conn, &input.user_id, &input.data).map_err(|err| {
        if let StoreError::Sqlite(_) = err {
            error!("increment_usage failed: {err}");
        }
        ApiError::from(err)
    })?;
    drop(conn);

    info!(
        user_id = %input.user_id,
        keys = input.data.len(),
        seconds = input.data.values().fold(0i64, |acc, s| acc.saturating_add(*s)),
        "merged usage"
    );

    Ok(Json(TrackResponse {
        success: true,
        data: Some(record),
    }))
}

async fn get_report(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Report>, ApiError> {
    let entries = {
        let mut conn = state.conn.lock().await;
        store::load_record(&mut conn, &user_id).map_err(|err| {
            error!("load_record failed: {err}");
            ApiError::from(err)
        })?
    };
    let report = build_report(entries.as_deref());
    debug!(user_id = %user_id, total = report.total(), "report built");
    Ok(Json(report))
}
