//! HTTP server for the coordinator.
//!
//! Provides endpoints for:
//! - The JSON RPC surface workers and operators call (`/api/{method}`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::scheduler::Scheduler;

mod handlers;
mod rpc;

/// Create the HTTP router.
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    // CORS layer for dashboard access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/:method", get(rpc::rpc_get).post(rpc::rpc_post))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(scheduler)
}
