use gatehawk_contracts::{FrequencySlot, ServerPush};
use serde_json::{Value, json};
use tracing::info;

use crate::api::state::AppState;
use crate::db::store::{StoreError, StoreResult};
use crate::events::Event;
use crate::results;

/// Build session-local data pushes for a `load_data` request. An empty type
/// list means the full connect snapshot.
pub async fn load_data(state: &AppState, types: &[String]) -> StoreResult<Vec<ServerPush>> {
    let all = types.is_empty();
    let wants = |name: &str| all || types.iter().any(|t| t == name);
    let store = &state.services.store;
    let mut replies = Vec::new();

    if wants("server_info") {
        replies.push(ServerPush::ServerInfo(state.server_info()));
    }
    if wants("pilot_data") {
        replies.push(ServerPush::PilotData {
            pilots: serde_json::to_value(store.list_pilots().await?)?,
        });
    }
    if wants("heat_data") {
        replies.push(ServerPush::HeatData {
            heats: serde_json::to_value(store.list_heats().await?)?,
        });
    }
    if wants("class_data") {
        replies.push(ServerPush::ClassData {
            classes: serde_json::to_value(store.list_classes().await?)?,
        });
    }
    if wants("format_data") {
        replies.push(ServerPush::FormatData {
            formats: serde_json::to_value(store.list_formats().await?)?,
        });
    }
    if wants("profile_data") {
        replies.push(ServerPush::ProfileData {
            profiles: serde_json::to_value(store.list_profiles().await?)?,
        });
    }
    if wants("frequency_data") {
        let controller = state.race.lock().await;
        let freqs = store.profile_frequencies(&controller.race.profile);
        let frequencies = (0..freqs.len())
            .map(|node| FrequencySlot {
                band: freqs.b[node].clone(),
                channel: freqs.c[node],
                frequency: freqs.f[node],
            })
            .collect();
        replies.push(ServerPush::FrequencyData { frequencies });
    }
    if wants("race_status") || wants("current_laps") || wants("leaderboard") {
        let mut controller = state.race.lock().await;
        if wants("race_status") {
            replies.push(ServerPush::RaceStatus {
                race_status: controller.race.race_status.as_u8(),
                race_mode: controller.race.format.race_mode as u8,
                race_time_sec: controller.race.format.race_time_sec as u32,
            });
        }
        if wants("current_laps") {
            replies.push(ServerPush::CurrentLaps {
                laps: serde_json::to_value(&controller.race.node_laps)?,
            });
        }
        if wants("leaderboard") {
            let board = controller.current_results().await;
            replies.push(ServerPush::Leaderboard {
                leaderboard: serde_json::to_value(board.as_ref())?,
            });
        }
    }
    if wants("result_data") {
        let board = results::event_results(store).await?;
        replies.push(ServerPush::Leaderboard {
            leaderboard: serde_json::to_value(board.as_ref())?,
        });
    }
    if wants("node_data") {
        replies.push(ServerPush::NodeData {
            nodes: serde_json::to_value(state.services.nodes.snapshot())?,
        });
    }
    if wants("cluster_status") {
        replies.push(ServerPush::ClusterStatus {
            secondaries: state.cluster.status(),
        });
    }

    Ok(replies)
}

/// Persist the effect assignment for an event; the LED renderer consumes
/// the option and the published event.
pub async fn set_led_event_effect(
    state: &AppState,
    event: &str,
    effect: &str,
) -> StoreResult<Vec<ServerPush>> {
    let store = &state.services.store;
    let mut effects: Value = store
        .get_option(crate::db::store::options::LED_EFFECTS)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(|| json!({}));
    if let Some(map) = effects.as_object_mut() {
        map.insert(event.to_string(), Value::String(effect.to_string()));
    }
    store
        .set_option(
            crate::db::store::options::LED_EFFECTS,
            &serde_json::to_string(&effects)?,
        )
        .await?;
    state.services.bus.publish(
        Event::LedSetManual,
        json!({ "event": event, "effect": effect }),
    );
    Ok(vec![])
}

pub fn use_led_effect(state: &AppState, effect: &str) -> StoreResult<Vec<ServerPush>> {
    state
        .services
        .bus
        .publish(Event::LedManual, json!({ "effect": effect }));
    Ok(vec![])
}

pub async fn set_led_brightness(state: &AppState, brightness: u8) -> StoreResult<Vec<ServerPush>> {
    state
        .services
        .store
        .set_option(
            crate::db::store::options::LED_BRIGHTNESS,
            &brightness.to_string(),
        )
        .await?;
    state
        .services
        .bus
        .publish(Event::LedBrightnessSet, json!({ "brightness": brightness }));
    Ok(vec![])
}

pub fn retry_secondary(state: &AppState, secondary_id: usize) -> StoreResult<Vec<ServerPush>> {
    if !state.cluster.retry_secondary(secondary_id) {
        return Err(StoreError::Validation(format!(
            "No secondary with id {secondary_id}"
        )));
    }
    Ok(vec![])
}

/// Shutdown/reboot/kill: publish SHUTDOWN, stop background work, terminate
/// the transport. The host action itself belongs to the platform layer.
pub async fn shutdown(state: &AppState, kind: &str) -> StoreResult<Vec<ServerPush>> {
    info!(kind, "Server stopping by operator request");
    state
        .services
        .bus
        .publish(Event::Shutdown, json!({ "kind": kind }));
    state
        .services
        .ui
        .emit_priority_message("Server is stopping", true);
    state.shutdown.notify_waiters();
    Ok(vec![])
}
