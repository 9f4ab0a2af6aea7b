use axum::{Json, extract::Path, extract::State};
use serde::Serialize;
use serde_json::Value;

use super::error::ApiError;
use super::state::AppState;
use crate::results;

#[derive(Debug, Serialize)]
pub struct RaceStateResponse {
    pub race_status: u8,
    pub current_heat: i64,
    pub win_status: u8,
    pub status_message: String,
    pub leaderboard: Value,
}

/// GET /api/race/state: current race status and leaderboard.
pub async fn race_state(State(state): State<AppState>) -> Result<Json<RaceStateResponse>, ApiError> {
    let mut controller = state.race.lock().await;
    let board = controller.current_results().await;
    Ok(Json(RaceStateResponse {
        race_status: controller.race.race_status.as_u8(),
        current_heat: controller.race.current_heat,
        win_status: controller.race.win_status as u8,
        status_message: controller.race.status_message.clone(),
        leaderboard: serde_json::to_value(board.as_ref())
            .map_err(|e| ApiError::Internal(e.to_string()))?,
    }))
}

/// GET /api/results/event: event-wide leaderboard (cached).
pub async fn event_results(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let board = results::event_results(&state.services.store).await?;
    Ok(Json(serde_json::to_value(board.as_ref()).map_err(|e| {
        ApiError::Internal(e.to_string())
    })?))
}

/// GET /api/results/races/{id}
pub async fn race_results(
    State(state): State<AppState>,
    Path(race_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if state.services.store.get_saved_race(race_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Race {race_id} not found")));
    }
    let board = results::race_results(&state.services.store, race_id).await?;
    Ok(Json(serde_json::to_value(board.as_ref()).map_err(|e| {
        ApiError::Internal(e.to_string())
    })?))
}

/// GET /api/results/heats/{id}
pub async fn heat_results(
    State(state): State<AppState>,
    Path(heat_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if state.services.store.get_heat(heat_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Heat {heat_id} not found")));
    }
    let board = results::heat_results(&state.services.store, heat_id).await?;
    Ok(Json(serde_json::to_value(board.as_ref()).map_err(|e| {
        ApiError::Internal(e.to_string())
    })?))
}

/// GET /api/results/classes/{id}
pub async fn class_results(
    State(state): State<AppState>,
    Path(class_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if state.services.store.get_class(class_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Class {class_id} not found")));
    }
    let board = results::class_results(&state.services.store, class_id).await?;
    Ok(Json(serde_json::to_value(board.as_ref()).map_err(|e| {
        ApiError::Internal(e.to_string())
    })?))
}
