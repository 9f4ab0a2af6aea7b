use gatehawk_contracts::ServerPush;
use serde_json::Value;

use crate::api::state::AppState;
use crate::db::store::{
    ClassPatch, FormatPatch, HeatPatch, ID_NONE, PilotPatch, ProfilePatch, StoreError, StoreResult,
    options,
};
use crate::race::state::RaceStatus;

fn parse_patch<T: serde::de::DeserializeOwned>(patch: Value) -> StoreResult<T> {
    serde_json::from_value(patch)
        .map_err(|e| StoreError::Validation(format!("Bad field set: {e}")))
}

async fn push_pilot_data(state: &AppState) -> StoreResult<()> {
    let pilots = state.services.store.list_pilots().await?;
    state.services.ui.push(ServerPush::PilotData {
        pilots: serde_json::to_value(pilots)?,
    });
    Ok(())
}

async fn push_heat_data(state: &AppState) -> StoreResult<()> {
    let heats = state.services.store.list_heats().await?;
    state.services.ui.push(ServerPush::HeatData {
        heats: serde_json::to_value(heats)?,
    });
    Ok(())
}

async fn push_class_data(state: &AppState) -> StoreResult<()> {
    let classes = state.services.store.list_classes().await?;
    state.services.ui.push(ServerPush::ClassData {
        classes: serde_json::to_value(classes)?,
    });
    Ok(())
}

async fn push_format_data(state: &AppState) -> StoreResult<()> {
    let formats = state.services.store.list_formats().await?;
    state.services.ui.push(ServerPush::FormatData {
        formats: serde_json::to_value(formats)?,
    });
    Ok(())
}

async fn push_profile_data(state: &AppState) -> StoreResult<()> {
    let profiles = state.services.store.list_profiles().await?;
    state.services.ui.push(ServerPush::ProfileData {
        profiles: serde_json::to_value(profiles)?,
    });
    Ok(())
}

pub async fn add_pilot(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    state.services.store.add_pilot().await?;
    push_pilot_data(state).await?;
    Ok(vec![])
}

pub async fn alter_pilot(state: &AppState, patch: Value) -> StoreResult<Vec<ServerPush>> {
    let patch: PilotPatch = parse_patch(patch)?;
    let pilot_id = patch.pilot_id;
    state.services.store.alter_pilot(patch).await?;

    // A rename of a pilot in the current heat shows up on the race page.
    let mut controller = state.race.lock().await;
    if controller.race.node_pilots.contains(&pilot_id) {
        controller.reload_node_bindings().await?;
        controller.race.clear_results();
    }
    drop(controller);

    push_pilot_data(state).await?;
    Ok(vec![])
}

pub async fn delete_pilot(state: &AppState, pilot_id: i64) -> StoreResult<Vec<ServerPush>> {
    state.services.store.delete_pilot(pilot_id).await?;
    let mut controller = state.race.lock().await;
    if controller.race.node_pilots.contains(&pilot_id) {
        controller.reload_node_bindings().await?;
        controller.race.clear_results();
    }
    drop(controller);
    push_pilot_data(state).await?;
    Ok(vec![])
}

pub async fn add_heat(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    state.services.store.add_heat().await?;
    push_heat_data(state).await?;
    Ok(vec![])
}

pub async fn duplicate_heat(state: &AppState, heat_id: i64) -> StoreResult<Vec<ServerPush>> {
    state.services.store.duplicate_heat(heat_id, None).await?;
    push_heat_data(state).await?;
    Ok(vec![])
}

pub async fn alter_heat(state: &AppState, patch: Value) -> StoreResult<Vec<ServerPush>> {
    let patch: HeatPatch = parse_patch(patch)?;
    let heat_id = patch.heat;
    state.services.store.alter_heat(patch).await?;

    let mut controller = state.race.lock().await;
    if controller.race.current_heat == heat_id {
        controller.reload_node_bindings().await?;
        controller.race.clear_results();
    }
    drop(controller);

    push_heat_data(state).await?;
    Ok(vec![])
}

pub async fn delete_heat(state: &AppState, heat_id: i64) -> StoreResult<Vec<ServerPush>> {
    {
        let controller = state.race.lock().await;
        if controller.race.current_heat == heat_id
            && controller.race.race_status != RaceStatus::Ready
        {
            return Err(StoreError::Conflict(
                "Cannot delete the heat of a race in progress".into(),
            ));
        }
    }
    state.services.store.delete_heat(heat_id).await?;

    let mut controller = state.race.lock().await;
    if controller.race.current_heat == heat_id {
        let fallback = state.services.store.list_heats().await?[0].id;
        controller.set_current_heat(fallback).await?;
    }
    drop(controller);

    push_heat_data(state).await?;
    Ok(vec![])
}

pub async fn add_class(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    state.services.store.add_class().await?;
    push_class_data(state).await?;
    Ok(vec![])
}

pub async fn duplicate_class(state: &AppState, class_id: i64) -> StoreResult<Vec<ServerPush>> {
    state.services.store.duplicate_class(class_id).await?;
    push_class_data(state).await?;
    push_heat_data(state).await?;
    Ok(vec![])
}

pub async fn alter_class(state: &AppState, patch: Value) -> StoreResult<Vec<ServerPush>> {
    let patch: ClassPatch = parse_patch(patch)?;
    state.services.store.alter_class(patch).await?;
    push_class_data(state).await?;
    Ok(vec![])
}

pub async fn delete_class(state: &AppState, class_id: i64) -> StoreResult<Vec<ServerPush>> {
    state.services.store.delete_class(class_id).await?;
    push_class_data(state).await?;
    push_heat_data(state).await?;
    Ok(vec![])
}

pub async fn add_format(state: &AppState, source_format_id: i64) -> StoreResult<Vec<ServerPush>> {
    let source = if source_format_id != ID_NONE {
        source_format_id
    } else {
        state
            .services
            .store
            .get_option_int(options::CURRENT_FORMAT, 0)
    };
    state.services.store.duplicate_format(source).await?;
    push_format_data(state).await?;
    Ok(vec![])
}

pub async fn alter_format(state: &AppState, patch: Value) -> StoreResult<Vec<ServerPush>> {
    let patch: FormatPatch = parse_patch(patch)?;

    // The active format cannot change under a running race.
    {
        let controller = state.race.lock().await;
        if controller.race.format.id == patch.format_id
            && controller.race.race_status != RaceStatus::Ready
        {
            return Err(StoreError::Validation(
                "Cannot alter the race format while a race is in progress".into(),
            ));
        }
    }

    let format_id = patch.format_id;
    let (row, _) = state.services.store.alter_format(patch).await?;

    let mut controller = state.race.lock().await;
    if controller.race.format.id == format_id {
        controller.race.format = crate::race::state::RaceFormat::from_row(&row);
        controller.race.clear_results();
    }
    drop(controller);

    push_format_data(state).await?;
    Ok(vec![])
}

pub async fn delete_format(state: &AppState, format_id: i64) -> StoreResult<Vec<ServerPush>> {
    {
        let controller = state.race.lock().await;
        if controller.race.format.id == format_id
            && controller.race.race_status != RaceStatus::Ready
        {
            return Err(StoreError::Validation(
                "Cannot delete the race format while a race is in progress".into(),
            ));
        }
    }
    state.services.store.delete_format(format_id).await?;
    push_format_data(state).await?;
    Ok(vec![])
}

pub async fn add_profile(state: &AppState, source_profile_id: i64) -> StoreResult<Vec<ServerPush>> {
    let source = if source_profile_id != ID_NONE {
        source_profile_id
    } else {
        state
            .services
            .store
            .get_option_int(options::CURRENT_PROFILE, 0)
    };
    state.services.store.duplicate_profile(source).await?;
    push_profile_data(state).await?;
    Ok(vec![])
}

pub async fn alter_profile(state: &AppState, patch: Value) -> StoreResult<Vec<ServerPush>> {
    let patch: ProfilePatch = parse_patch(patch)?;
    let profile_id = patch.profile_id;
    let profile = state.services.store.alter_profile(patch).await?;

    let mut controller = state.race.lock().await;
    if controller.race.profile.id == profile_id {
        controller.race.profile = profile;
        controller.apply_profile_to_nodes();
    }
    drop(controller);

    push_profile_data(state).await?;
    Ok(vec![])
}

/// Delete the active profile and fall back to the first remaining one.
pub async fn delete_profile(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    let current = state
        .services
        .store
        .get_option_int(options::CURRENT_PROFILE, 0);
    state.services.store.delete_profile(current).await?;

    let fallback = state.services.store.list_profiles().await?[0].id;
    {
        let mut controller = state.race.lock().await;
        controller.set_profile(fallback).await?;
    }
    push_profile_data(state).await?;
    Ok(vec![])
}
