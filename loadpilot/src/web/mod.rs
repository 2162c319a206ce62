//! Web server: REST API plus WebSocket event streaming

pub mod api;
pub mod state;
pub mod ws;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Start the web server
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting web server on http://localhost:{}", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the router with all routes
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Runs
        .route("/runs", post(api::create_run))
        .route("/runs", get(api::list_runs))
        .route("/runs/{id}", get(api::get_run))
        .route("/runs/{id}/events", get(api::get_run_events))
        .route("/runs/{id}/cancel", post(api::cancel_run))
        // Approvals
        .route("/approvals", get(api::list_approvals))
        .route("/approvals/{id}/approve", post(api::approve_request))
        .route("/approvals/{id}/reject", post(api::reject_request))
        // Workflows
        .route("/workflows", get(api::list_workflows))
        // Health
        .route("/health", get(api::health_check));

    let ws_routes = Router::new().route("/runs/{run_id}", get(ws::run_events_handler));

    Router::new()
        .nest("/api", api_routes)
        .nest("/ws", ws_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
