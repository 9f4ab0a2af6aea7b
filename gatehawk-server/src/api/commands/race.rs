use gatehawk_contracts::ServerPush;

use crate::api::state::AppState;
use crate::db::store::StoreResult;
use crate::race::controller::{spawn_deferred_stop, stage_and_arm};
use crate::race::state::RaceStatus;

pub async fn stage(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    stage_and_arm(&state.race).await?;
    Ok(vec![])
}

pub async fn stop(state: &AppState, do_save: bool) -> StoreResult<Vec<ServerPush>> {
    let deferred = {
        let mut controller = state.race.lock().await;
        controller.stop_race(do_save).await?
    };
    if deferred {
        spawn_deferred_stop(state.race.clone(), do_save);
    }
    Ok(vec![])
}

pub async fn save(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    let racing = {
        let controller = state.race.lock().await;
        controller.race.race_status == RaceStatus::Racing
    };
    if racing {
        return stop(state, true).await;
    }
    let mut controller = state.race.lock().await;
    controller.save_laps().await?;
    Ok(vec![])
}

pub async fn discard(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    controller.discard_laps(false).await?;
    Ok(vec![])
}

pub async fn set_current_heat(state: &AppState, heat_id: i64) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    controller.set_current_heat(heat_id).await?;
    Ok(vec![])
}

pub async fn schedule(state: &AppState, minutes: u32, seconds: u32) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    controller.schedule_race((minutes * 60 + seconds) as u64);
    controller
        .services
        .ui
        .emit_priority_message(format!("Next race begins in {minutes}:{seconds:02}"), true);
    Ok(vec![])
}

pub async fn cancel_schedule(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    controller.cancel_schedule();
    Ok(vec![])
}

pub async fn set_race_format(state: &AppState, format_id: i64) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    controller.set_race_format(format_id).await?;
    Ok(vec![])
}

pub async fn set_profile(state: &AppState, profile_id: i64) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    controller.set_profile(profile_id).await?;
    Ok(vec![])
}

pub async fn delete_lap(state: &AppState, node: usize, lap_index: usize) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    controller.delete_lap(node, lap_index).await?;
    Ok(vec![])
}

pub async fn restore_deleted_lap(
    state: &AppState,
    node: usize,
    lap_index: usize,
) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    controller.restore_deleted_lap(node, lap_index).await?;
    Ok(vec![])
}

pub async fn reassign(state: &AppState, race_id: i64, heat_id: i64) -> StoreResult<Vec<ServerPush>> {
    state
        .services
        .store
        .reassign_race_to_heat(race_id, heat_id)
        .await?;
    state
        .services
        .ui
        .emit_priority_message(format!("Race {race_id} reassigned to heat {heat_id}"), false);
    Ok(vec![])
}
