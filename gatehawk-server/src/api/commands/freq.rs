use gatehawk_contracts::{FrequencySlot, ServerPush};

use crate::api::state::AppState;
use crate::db::store::{ProfilePatch, StoreError, StoreResult, options};
use crate::freq::{self, FrequencySet, LevelSet};

/// Assign one node's frequency: persisted into the active profile, pushed
/// to the hardware, and announced to all sessions.
pub async fn set_frequency(
    state: &AppState,
    node: usize,
    band: Option<String>,
    channel: Option<u16>,
    frequency: u32,
) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    if node >= controller.race.node_count() {
        return Err(StoreError::Validation(format!(
            "Node index {node} out of range"
        )));
    }

    let mut freqs = state
        .services
        .store
        .profile_frequencies(&controller.race.profile);
    freqs.set_slot(node, band, channel, frequency);

    let profile = state
        .services
        .store
        .alter_profile(ProfilePatch {
            profile_id: controller.race.profile.id,
            frequencies: Some(freqs.clone()),
            ..Default::default()
        })
        .await?;
    controller.race.profile = profile;
    controller.race.clear_results();

    state.services.nodes.set_frequency(node, frequency);
    push_frequency_data(state, &freqs);
    Ok(vec![])
}

/// Apply a preset table across all nodes.
pub async fn set_frequency_preset(state: &AppState, preset: &str) -> StoreResult<Vec<ServerPush>> {
    let mut controller = state.race.lock().await;
    let node_count = controller.race.node_count();

    let mut freqs = if preset == "All-N1" {
        let mut current = state
            .services
            .store
            .profile_frequencies(&controller.race.profile);
        current.all_to_first();
        current
    } else {
        let Some(mut table) = freq::preset(preset) else {
            return Err(StoreError::Validation(format!(
                "Unknown frequency preset '{preset}'"
            )));
        };
        table.resize(node_count);
        table
    };
    freqs.resize(node_count);

    let profile = state
        .services
        .store
        .alter_profile(ProfilePatch {
            profile_id: controller.race.profile.id,
            frequencies: Some(freqs.clone()),
            ..Default::default()
        })
        .await?;
    controller.race.profile = profile;
    controller.race.clear_results();

    for node in 0..node_count {
        state.services.nodes.set_frequency(node, freqs.f[node]);
    }
    push_frequency_data(state, &freqs);
    Ok(vec![])
}

pub async fn set_enter_at_level(
    state: &AppState,
    node: usize,
    level: i64,
) -> StoreResult<Vec<ServerPush>> {
    persist_level(state, node, level, true).await?;
    state.services.nodes.set_enter_at_level(node, level);
    state.services.ui.push(ServerPush::EnterAtLevel {
        node,
        level: level as i32,
    });
    Ok(vec![])
}

pub async fn set_exit_at_level(
    state: &AppState,
    node: usize,
    level: i64,
) -> StoreResult<Vec<ServerPush>> {
    persist_level(state, node, level, false).await?;
    state.services.nodes.set_exit_at_level(node, level);
    state.services.ui.push(ServerPush::ExitAtLevel {
        node,
        level: level as i32,
    });
    Ok(vec![])
}

async fn persist_level(state: &AppState, node: usize, level: i64, is_enter: bool) -> StoreResult<()> {
    let mut controller = state.race.lock().await;
    if node >= controller.race.node_count() {
        return Err(StoreError::Validation(format!(
            "Node index {node} out of range"
        )));
    }

    let raw = if is_enter {
        controller.race.profile.enter_ats.as_deref()
    } else {
        controller.race.profile.exit_ats.as_deref()
    };
    let mut levels: LevelSet = raw
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    levels.set(node, level);

    let patch = if is_enter {
        ProfilePatch {
            profile_id: controller.race.profile.id,
            enter_ats: Some(levels),
            ..Default::default()
        }
    } else {
        ProfilePatch {
            profile_id: controller.race.profile.id,
            exit_ats: Some(levels),
            ..Default::default()
        }
    };
    controller.race.profile = state.services.store.alter_profile(patch).await?;
    Ok(())
}

pub async fn set_min_lap(state: &AppState, min_lap: u32) -> StoreResult<Vec<ServerPush>> {
    state
        .services
        .store
        .set_option(options::MIN_LAP_SEC, &min_lap.to_string())
        .await?;
    state
        .services
        .ui
        .emit_priority_message(format!("Minimum lap time set to {min_lap} seconds"), false);
    Ok(vec![])
}

pub async fn set_min_lap_behavior(state: &AppState, behavior: u8) -> StoreResult<Vec<ServerPush>> {
    if behavior > 1 {
        return Err(StoreError::Validation(format!(
            "Unknown min-lap behavior {behavior}"
        )));
    }
    state
        .services
        .store
        .set_option(options::MIN_LAP_BEHAVIOR, &behavior.to_string())
        .await?;
    Ok(vec![])
}

pub(crate) fn push_frequency_data(state: &AppState, freqs: &FrequencySet) {
    let frequencies = (0..freqs.len())
        .map(|node| FrequencySlot {
            band: freqs.b[node].clone(),
            channel: freqs.c[node],
            frequency: freqs.f[node],
        })
        .collect();
    state
        .services
        .ui
        .push(ServerPush::FrequencyData { frequencies });
}
