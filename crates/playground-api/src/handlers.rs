//! REST API handlers.
//!
//! Each handler validates its input, dispatches into the core, and
//! returns a JSON envelope of either a result or an error. Only
//! infrastructure failures change the HTTP status: a query whose stderr
//! is non-empty is still a successful run.

use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use playground_core::run::{Run, DEFAULT_DATABASE};
use playground_core::runner::RunnerError;
use playground_core::settings::{ClickHouseSettings, RunSettings};
use playground_metrics::render_prometheus;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    code: u16,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(result: T) -> Json<Self> {
        Json(Self {
            result: Some(result),
            error: None,
        })
    }
}

fn error_response(message: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            result: None,
            error: Some(ErrorBody {
                message: message.to_string(),
                code: status.as_u16(),
            }),
        }),
    )
        .into_response()
}

// ── Runs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunQueryRequest {
    pub query: String,
    pub version: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub settings: Option<RequestSettings>,
}

#[derive(Debug, Deserialize)]
pub struct RequestSettings {
    #[serde(default)]
    pub clickhouse: Option<RequestClickHouseSettings>,
}

#[derive(Debug, Deserialize)]
pub struct RequestClickHouseSettings {
    #[serde(default)]
    pub output_format: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunQueryResponse {
    pub query_run_id: String,
    pub output: String,
    pub time_elapsed: String,
}

/// POST /api/runs
pub async fn run_query(
    State(state): State<ApiState>,
    Json(mut req): Json<RunQueryRequest>,
) -> Response {
    if req.query.is_empty() {
        return error_response("query cannot be empty", StatusCode::BAD_REQUEST);
    }
    if req.query.len() as u64 > state.limits.max_query_length {
        return error_response(
            &format!(
                "query length ({}) cannot exceed {}",
                req.query.len(),
                state.limits.max_query_length
            ),
            StatusCode::BAD_REQUEST,
        );
    }

    if !state.tags.exists(&req.version) {
        return error_response("unknown version", StatusCode::BAD_REQUEST);
    }

    if req.database.is_empty() {
        req.database = DEFAULT_DATABASE.to_string();
    }

    let settings = match convert_settings(&req) {
        Ok(settings) => settings,
        Err(message) => return error_response(&message, StatusCode::BAD_REQUEST),
    };

    let mut run = Run::new(&req.query, &req.database, &req.version, settings);

    let started_at = Instant::now();
    let output =
        match tokio::time::timeout(state.server_timeout, state.runner.run_query(&run)).await {
            Err(_) => {
                error!(id = %run.id, "query run timed out");
                return error_response("internal error", StatusCode::INTERNAL_SERVER_ERROR);
            }
            Ok(Err(err)) => {
                error!(id = %run.id, error = %err, "query run failed");
                return runner_error_response(&err);
            }
            Ok(Ok(output)) => output,
        };

    if output.len() as u64 > state.limits.max_output_length {
        return error_response(
            &format!(
                "output length ({}) cannot exceed {}",
                output.len(),
                state.limits.max_output_length
            ),
            StatusCode::BAD_REQUEST,
        );
    }

    let elapsed = started_at.elapsed();
    run.output = output;
    run.execution_time_ms = elapsed.as_millis() as u64;

    if let Err(err) = state.store.put(&run) {
        error!(id = %run.id, error = %err, "a run cannot be saved");
        return error_response("internal error", StatusCode::INTERNAL_SERVER_ERROR);
    }

    info!(id = %run.id, elapsed_ms = run.execution_time_ms, "saved a new run");

    ApiResponse::ok(RunQueryResponse {
        query_run_id: run.id,
        output: run.output,
        time_elapsed: format_elapsed(elapsed),
    })
    .into_response()
}

fn convert_settings(req: &RunQueryRequest) -> Result<Option<RunSettings>, String> {
    match req.database.as_str() {
        DEFAULT_DATABASE => {
            let Some(clickhouse) = req.settings.as_ref().and_then(|s| s.clickhouse.as_ref())
            else {
                return Ok(None);
            };

            Ok(Some(RunSettings::ClickHouse(ClickHouseSettings {
                output_format: clickhouse.output_format.clone(),
            })))
        }
        _ => Err("unknown database".to_string()),
    }
}

fn runner_error_response(err: &RunnerError) -> Response {
    match err {
        RunnerError::NoAvailableRunners => {
            error_response(&err.to_string(), StatusCode::TOO_MANY_REQUESTS)
        }
        RunnerError::UnknownVersion(_) => error_response(&err.to_string(), StatusCode::BAD_REQUEST),
        _ => error_response("internal error", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Debug, Serialize)]
pub struct GetRunResponse {
    pub query_run_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub database: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<RunSettings>,
    pub input: String,
    pub output: String,
}

/// GET /api/runs/{id}
pub async fn get_run(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get(&id) {
        Ok(Some(run)) => ApiResponse::ok(GetRunResponse {
            query_run_id: run.id,
            database: run.database,
            version: run.version,
            settings: run.settings,
            input: run.input,
            output: run.output,
        })
        .into_response(),
        Ok(None) => error_response("run not found", StatusCode::NOT_FOUND),
        Err(err) => {
            error!(id, error = %err, "failed to find a run");
            error_response("internal error", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ── Tags ───────────────────────────────────────────────────────

/// GET /api/tags
pub async fn get_tags(State(state): State<ApiState>) -> Response {
    let tags: Vec<String> = state.tags.all().into_iter().map(|i| i.tag).collect();
    Json(tags).into_response()
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> Response {
    let body = render_prometheus(&state.metrics.runner_snapshots(), &state.metrics.api_snapshot());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// `482ms` below one second, `1.523s` above.
fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        format!("{}ms", elapsed.as_millis())
    } else {
        format!("{:.3}s", elapsed.as_secs_f64())
    }
}
