//! switchyard-api — REST API for Switchyard.
//!
//! Provides axum route handlers over the pipeline orchestrator:
//! triggering runs, deciding approvals, cancelling, and inspecting
//! run history and routing state.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/services/:service/runs` | Trigger a pipeline run |
//! | GET | `/api/v1/services/:service/routing` | Current routing state |
//! | GET | `/api/v1/services` | List registered services |
//! | GET | `/api/v1/runs` | List runs, newest first |
//! | GET | `/api/v1/runs/:id` | Get one run with its stage log |
//! | POST | `/api/v1/runs/:id/approve` | Approve a pending run |
//! | POST | `/api/v1/runs/:id/reject` | Reject a pending run |
//! | POST | `/api/v1/runs/:id/cancel` | Cancel a run before cutover |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use switchyard_pipeline::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/services", get(handlers::list_services))
        .route("/services/{service}/runs", post(handlers::trigger_run))
        .route("/services/{service}/routing", get(handlers::get_routing))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}/approve", post(handlers::approve_run))
        .route("/runs/{id}/reject", post(handlers::reject_run))
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
