use gatehawk_contracts::ServerPush;
use tracing::info;

use crate::api::state::AppState;
use crate::db::store::{HeatPatch, ID_NONE, StoreError, StoreResult};
use crate::race::state::RaceStatus;
use crate::results;

pub async fn backup(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    let file_name = state.services.store.backup_database("bkp_").await?;
    state
        .services
        .ui
        .push(ServerPush::DatabaseBkpDone { file_name });
    Ok(vec![])
}

pub fn list_backups(state: &AppState) -> StoreResult<Vec<ServerPush>> {
    let backup_files = state.services.store.list_backups()?;
    Ok(vec![ServerPush::BackupsList { backup_files }])
}

pub async fn restore(state: &AppState, backup_file: &str) -> StoreResult<Vec<ServerPush>> {
    require_idle(state).await?;
    state.services.store.restore_database(backup_file).await?;

    // Re-anchor the controller on the restored data.
    {
        let mut controller = state.race.lock().await;
        let heats = state.services.store.list_heats().await?;
        controller.set_current_heat(heats[0].id).await?;
    }
    state
        .services
        .ui
        .emit_priority_message(format!("Database restored from {backup_file}"), true);
    Ok(vec![])
}

pub fn delete_backup(state: &AppState, backup_file: &str) -> StoreResult<Vec<ServerPush>> {
    state.services.store.delete_backup(backup_file)?;
    let backup_files = state.services.store.list_backups()?;
    Ok(vec![ServerPush::BackupsList { backup_files }])
}

pub async fn reset(state: &AppState, reset_type: &str) -> StoreResult<Vec<ServerPush>> {
    require_idle(state).await?;
    state.services.store.reset_database(reset_type).await?;

    {
        let mut controller = state.race.lock().await;
        let heats = state.services.store.list_heats().await?;
        controller.set_current_heat(heats[0].id).await?;
    }
    Ok(vec![ServerPush::ResetConfirm {
        reset_type: reset_type.to_string(),
    }])
}

pub async fn export(state: &AppState, exporter: &str) -> StoreResult<Vec<ServerPush>> {
    let data = state.services.store.export_database(exporter).await?;
    Ok(vec![ServerPush::ExportedData {
        export_file: format!("{exporter}.csv"),
        data,
    }])
}

/// Seed new heats in the output class from the input class's standings,
/// best-ranked pilots in the final heat.
pub async fn generate_heats(
    state: &AppState,
    generator: &str,
    input_class: i64,
    output_class: i64,
) -> StoreResult<Vec<ServerPush>> {
    if generator != "ranked" {
        return Err(StoreError::Validation(format!(
            "Unknown heat generator '{generator}'"
        )));
    }
    if state.services.store.get_class(output_class).await?.is_none() {
        return Err(StoreError::NotFound {
            kind: "class",
            id: output_class,
        });
    }

    let standings = results::class_results(&state.services.store, input_class).await?;
    if standings.rows.is_empty() {
        return Err(StoreError::Validation(
            "Input class has no ranked pilots".into(),
        ));
    }

    let node_count = state.services.nodes.node_count();
    let ranked: Vec<i64> = standings.rows.iter().map(|row| row.pilot_id).collect();

    // Fill heats from the bottom of the ranking so the main event holds the
    // top seeds.
    let mut heats_created = Vec::new();
    for (chunk_index, chunk) in ranked.rchunks(node_count).enumerate() {
        let heat = state.services.store.add_heat().await?;
        state
            .services
            .store
            .alter_heat(HeatPatch {
                heat: heat.id,
                note: Some(format!("Generated heat {}", chunk_index + 1)),
                class: Some(output_class),
                ..Default::default()
            })
            .await?;
        for (node, &pilot_id) in chunk.iter().enumerate() {
            if pilot_id == ID_NONE {
                continue;
            }
            state
                .services
                .store
                .alter_heat(HeatPatch {
                    heat: heat.id,
                    pilot: Some(pilot_id),
                    node: Some(node as i64),
                    ..Default::default()
                })
                .await?;
        }
        heats_created.push(heat.id);
    }

    info!(
        input_class,
        output_class,
        heats = heats_created.len(),
        "Generated heats from class standings"
    );

    let mut replies = Vec::new();
    for heat_id in heats_created {
        let slots = state.services.store.heat_slots(heat_id).await?;
        replies.push(ServerPush::HeatPlanResult {
            heat: heat_id,
            slots: serde_json::to_value(slots)?,
        });
    }

    let heats = state.services.store.list_heats().await?;
    state.services.ui.push(ServerPush::HeatData {
        heats: serde_json::to_value(heats)?,
    });
    Ok(replies)
}

async fn require_idle(state: &AppState) -> StoreResult<()> {
    let controller = state.race.lock().await;
    if !matches!(
        controller.race.race_status,
        RaceStatus::Ready | RaceStatus::Done
    ) {
        return Err(StoreError::Validation(
            "Database operations are blocked while a race is in progress".into(),
        ));
    }
    Ok(())
}
