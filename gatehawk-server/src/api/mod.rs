pub mod commands;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

use axum::{Router, routing::get};
use state::AppState;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        // WebSocket: client commands, live pushes, cluster peer links
        .route("/ws", get(ws::ws_handler))
        // Read-only REST surface
        .route("/api/race/state", get(routes::race_state))
        .route("/api/results/event", get(routes::event_results))
        .route("/api/results/races/{id}", get(routes::race_results))
        .route("/api/results/heats/{id}", get(routes::heat_results))
        .route("/api/results/classes/{id}", get(routes::class_results))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
