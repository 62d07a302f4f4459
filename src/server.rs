//! HTTP server assembly.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::dispatcher::Dispatcher;
use crate::lifecycle::Coordinator;
use crate::repository::JobStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub coordinator: Arc<Coordinator>,
    pub dispatcher: Dispatcher,
}

/// Build the HTTP router for the orchestrator API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/batch/",
            get(crate::handlers::batch::list_batch_jobs)
                .post(crate::handlers::batch::create_batch_job),
        )
        .route(
            "/batch/{job_id}",
            get(crate::handlers::batch::get_batch_job)
                .delete(crate::handlers::batch::stop_batch_job),
        )
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}
