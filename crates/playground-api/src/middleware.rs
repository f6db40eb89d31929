//! Request middleware: metrics accounting and panic recovery.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use tracing::error;

use crate::ApiState;

/// Count every request and its outcome.
pub async fn track_requests(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let started_at = Instant::now();

    let response = next.run(request).await;

    let is_error = response.status().is_client_error() || response.status().is_server_error();
    state.metrics.api().observe(is_error, started_at);

    response
}

/// Turn an unrecovered handler fault into a plain 500, without a stack
/// trace in the response.
pub async fn catch_panics(request: Request, next: Next) -> Response {
    match std::panic::AssertUnwindSafe(next.run(request))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());

            error!(message, "request handler panicked");

            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}
