//! playground-api — REST API for the query playground.
//!
//! Thin axum router dispatching into the coordinator, the tag cache,
//! and the run store.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/runs` | Execute a query |
//! | GET | `/api/runs/{id}` | Get a stored run |
//! | GET | `/api/tags` | List known version tags |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;

use playground_core::runner::{ImageTagStorage, QueryRunner};
use playground_metrics::MetricsHub;
use playground_store::RunStore;

/// Request-size limits enforced by the API.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_query_length: u64,
    pub max_output_length: u64,
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub runner: Arc<dyn QueryRunner>,
    pub tags: Arc<dyn ImageTagStorage>,
    pub store: RunStore,
    pub metrics: MetricsHub,
    pub limits: Limits,

    /// Upper bound on a single query run; a request past it aborts its
    /// exec.
    pub server_timeout: Duration,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/runs", post(handlers::run_query))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/tags", get(handlers::get_tags))
        .with_state(state.clone());

    Router::new()
        .nest("/api", api_routes)
        .route(
            "/metrics",
            get(handlers::prometheus_metrics).with_state(state.clone()),
        )
        .layer(axum::middleware::from_fn_with_state(
            state,
            middleware::track_requests,
        ))
        .layer(axum::middleware::from_fn(middleware::catch_panics))
}
