use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{ID_NONE, Store, StoreError, StoreResult};
use crate::db::models::PilotRow;
use crate::events::Event;

/// Field set accepted by `alter_pilot`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PilotPatch {
    pub pilot_id: i64,
    pub name: Option<String>,
    pub callsign: Option<String>,
    #[serde(rename = "team_name")]
    pub team: Option<String>,
    pub phonetic: Option<String>,
}

impl Store {
    pub async fn get_pilot(&self, pilot_id: i64) -> StoreResult<Option<PilotRow>> {
        Ok(sqlx::query_as::<_, PilotRow>("SELECT * FROM pilots WHERE id = ?")
            .bind(pilot_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_pilots(&self) -> StoreResult<Vec<PilotRow>> {
        Ok(sqlx::query_as::<_, PilotRow>("SELECT * FROM pilots ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Add a pilot with generated name and callsign.
    pub async fn add_pilot(&self) -> StoreResult<PilotRow> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO pilots (name, callsign, team, phonetic) VALUES ('', '', 'A', '') RETURNING id",
        )
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("UPDATE pilots SET name = ?, callsign = ? WHERE id = ?")
            .bind(format!("Pilot {id} Name"))
            .bind(format!("Callsign {id}"))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.bus
            .publish(Event::PilotAdd, serde_json::json!({ "pilot_id": id }));
        info!(pilot_id = id, "Pilot added");

        self.get_pilot(id)
            .await?
            .ok_or(StoreError::NotFound { kind: "pilot", id })
    }

    /// Alter pilot fields. Callsign and team changes invalidate every heat,
    /// class, and saved race the pilot appears in plus the event cache.
    /// Returns the pilot and the ids of the affected saved races.
    pub async fn alter_pilot(&self, patch: PilotPatch) -> StoreResult<(PilotRow, Vec<i64>)> {
        let pilot_id = patch.pilot_id;
        let Some(existing) = self.get_pilot(pilot_id).await? else {
            return Err(StoreError::NotFound {
                kind: "pilot",
                id: pilot_id,
            });
        };

        let identity_changed = patch.callsign.is_some() || patch.team.is_some();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE pilots SET name = ?, callsign = ?, team = ?, phonetic = ? WHERE id = ?",
        )
        .bind(patch.name.as_deref().unwrap_or(&existing.name))
        .bind(patch.callsign.as_deref().unwrap_or(&existing.callsign))
        .bind(patch.team.as_deref().unwrap_or(&existing.team))
        .bind(patch.phonetic.as_deref().unwrap_or(&existing.phonetic))
        .bind(pilot_id)
        .execute(&mut *tx)
        .await?;

        let mut affected_races: Vec<i64> = Vec::new();
        let mut affected_heats: Vec<i64> = Vec::new();
        let mut affected_classes: Vec<i64> = Vec::new();

        if identity_changed {
            let heat_ids: Vec<(i64,)> = sqlx::query_as(
                "SELECT DISTINCT heat_id FROM heat_slots WHERE pilot_id = ?",
            )
            .bind(pilot_id)
            .fetch_all(&mut *tx)
            .await?;

            for (heat_id,) in heat_ids {
                affected_heats.push(heat_id);
                let class_id: Option<(i64,)> =
                    sqlx::query_as("SELECT class_id FROM heats WHERE id = ?")
                        .bind(heat_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                if let Some((class_id,)) = class_id {
                    if class_id != ID_NONE {
                        affected_classes.push(class_id);
                    }
                }
                let races: Vec<(i64,)> =
                    sqlx::query_as("SELECT id FROM saved_races WHERE heat_id = ?")
                        .bind(heat_id)
                        .fetch_all(&mut *tx)
                        .await?;
                affected_races.extend(races.into_iter().map(|(id,)| id));
            }

            if !affected_races.is_empty() {
                for &heat_id in &affected_heats {
                    super::races::invalidate_heat_row(&mut tx, heat_id).await?;
                }
                for &class_id in &affected_classes {
                    super::races::invalidate_class_row(&mut tx, class_id).await?;
                }
                for &race_id in &affected_races {
                    super::races::invalidate_race_row(&mut tx, race_id).await?;
                }
                super::races::invalidate_event_row(&mut tx).await?;
            }
        }

        tx.commit().await?;

        if !affected_races.is_empty() {
            self.apply_memory_invalidation(&affected_races, &affected_heats, &affected_classes);
        }

        self.bus
            .publish(Event::PilotAlter, serde_json::json!({ "pilot_id": pilot_id }));
        info!(pilot_id, "Pilot altered");

        let pilot = self.get_pilot(pilot_id).await?.ok_or(StoreError::NotFound {
            kind: "pilot",
            id: pilot_id,
        })?;
        Ok((pilot, affected_races))
    }

    /// Delete a pilot. Refused while any saved race references the pilot.
    /// Heat slots holding the pilot are cleared.
    pub async fn delete_pilot(&self, pilot_id: i64) -> StoreResult<()> {
        let referenced: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM saved_pilot_races WHERE pilot_id = ? LIMIT 1")
                .bind(pilot_id)
                .fetch_optional(&self.pool)
                .await?;
        if referenced.is_some() {
            info!(pilot_id, "Refusing to delete pilot: is in use");
            return Err(StoreError::Conflict(format!(
                "Pilot {pilot_id} has saved races and cannot be deleted"
            )));
        }

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM pilots WHERE id = ?")
            .bind(pilot_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "pilot",
                id: pilot_id,
            });
        }
        sqlx::query("UPDATE heat_slots SET pilot_id = ? WHERE pilot_id = ?")
            .bind(ID_NONE)
            .bind(pilot_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.bus
            .publish(Event::PilotDelete, serde_json::json!({ "pilot_id": pilot_id }));
        info!(pilot_id, "Pilot deleted");
        Ok(())
    }

    /// Record a frequency the pilot raced on (appended on race save,
    /// deduplicated, most recent last).
    pub async fn set_pilot_used_frequency(
        &self,
        pilot_id: i64,
        band: Option<&str>,
        channel: Option<u16>,
        frequency: u32,
    ) -> StoreResult<()> {
        let Some(pilot) = self.get_pilot(pilot_id).await? else {
            return Err(StoreError::NotFound {
                kind: "pilot",
                id: pilot_id,
            });
        };

        let mut used: Vec<Value> = pilot
            .used_frequencies
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        let entry = serde_json::json!({ "b": band, "c": channel, "f": frequency });
        used.retain(|existing| existing != &entry);
        used.push(entry);

        sqlx::query("UPDATE pilots SET used_frequencies = ? WHERE id = ?")
            .bind(serde_json::to_string(&used)?)
            .bind(pilot_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::memory_store;
    use super::*;

    #[tokio::test]
    async fn add_pilot_generates_callsign() {
        let store = memory_store().await;
        let pilot = store.add_pilot().await.unwrap();
        assert_eq!(pilot.callsign, format!("Callsign {}", pilot.id));
        assert_eq!(pilot.name, format!("Pilot {} Name", pilot.id));
    }

    #[tokio::test]
    async fn alter_pilot_patches_only_given_fields() {
        let store = memory_store().await;
        let pilot = store.add_pilot().await.unwrap();
        let (updated, races) = store
            .alter_pilot(PilotPatch {
                pilot_id: pilot.id,
                callsign: Some("KWAD".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.callsign, "KWAD");
        assert_eq!(updated.name, pilot.name);
        assert!(races.is_empty());
    }

    #[tokio::test]
    async fn delete_pilot_blocked_by_saved_race() {
        let store = memory_store().await;
        let pilot = store.add_pilot().await.unwrap();
        sqlx::query(
            "INSERT INTO saved_races (round_id, heat_id, start_time, start_time_wall) VALUES (1, 1, 0.0, '2026-01-01 10:00:00')",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO saved_pilot_races (race_id, node_index, pilot_id, enter_at, exit_at) VALUES (1, 0, ?, 90, 80)",
        )
        .bind(pilot.id)
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.delete_pilot(pilot.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn used_frequencies_deduplicate() {
        let store = memory_store().await;
        let pilot = store.add_pilot().await.unwrap();
        store
            .set_pilot_used_frequency(pilot.id, Some("R"), Some(1), 5658)
            .await
            .unwrap();
        store
            .set_pilot_used_frequency(pilot.id, Some("R"), Some(7), 5880)
            .await
            .unwrap();
        store
            .set_pilot_used_frequency(pilot.id, Some("R"), Some(1), 5658)
            .await
            .unwrap();

        let pilot = store.get_pilot(pilot.id).await.unwrap().unwrap();
        let used: Vec<Value> =
            serde_json::from_str(pilot.used_frequencies.as_deref().unwrap()).unwrap();
        assert_eq!(used.len(), 2);
        assert_eq!(used[1]["f"], 5658);
    }
}
