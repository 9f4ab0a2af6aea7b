use serde::Deserialize;
use tracing::info;

use super::{ID_NONE, Store, StoreError, StoreResult, unique_name};
use crate::db::models::{HeatRow, HeatSlotRow};
use crate::events::Event;

/// Field set accepted by `alter_heat`. A pilot change names the slot by node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeatPatch {
    pub heat: i64,
    pub note: Option<String>,
    pub class: Option<i64>,
    pub pilot: Option<i64>,
    pub node: Option<i64>,
    pub status: Option<i64>,
    pub auto_frequency: Option<bool>,
}

impl Store {
    pub async fn get_heat(&self, heat_id: i64) -> StoreResult<Option<HeatRow>> {
        Ok(sqlx::query_as::<_, HeatRow>("SELECT * FROM heats WHERE id = ?")
            .bind(heat_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_heats(&self) -> StoreResult<Vec<HeatRow>> {
        Ok(sqlx::query_as::<_, HeatRow>("SELECT * FROM heats ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn heat_slots(&self, heat_id: i64) -> StoreResult<Vec<HeatSlotRow>> {
        Ok(sqlx::query_as::<_, HeatSlotRow>(
            "SELECT * FROM heat_slots WHERE heat_id = ? ORDER BY node_index",
        )
        .bind(heat_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Add an empty heat with one unassigned slot per node.
    pub async fn add_heat(&self) -> StoreResult<HeatRow> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO heats (note, class_id) VALUES ('', ?) RETURNING id",
        )
        .bind(ID_NONE)
        .fetch_one(&mut *tx)
        .await?;
        for node in 0..self.node_count {
            sqlx::query(
                "INSERT INTO heat_slots (heat_id, node_index, pilot_id) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(node as i64)
            .bind(ID_NONE)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.bus
            .publish(Event::HeatAdd, serde_json::json!({ "heat_id": id }));
        info!(heat_id = id, "Heat added");

        self.get_heat(id)
            .await?
            .ok_or(StoreError::NotFound { kind: "heat", id })
    }

    /// Duplicate a heat with its slot assignments. The note gets a unique
    /// suffix; an explicit destination class overrides the source's.
    pub async fn duplicate_heat(
        &self,
        source_id: i64,
        dest_class: Option<i64>,
    ) -> StoreResult<HeatRow> {
        let Some(source) = self.get_heat(source_id).await? else {
            return Err(StoreError::NotFound {
                kind: "heat",
                id: source_id,
            });
        };

        let new_note = if source.note.is_empty() {
            String::new()
        } else {
            let all_notes: Vec<String> = self.list_heats().await?.into_iter().map(|h| h.note).collect();
            unique_name(&source.note, &all_notes)
        };
        let class_id = dest_class.unwrap_or(source.class_id);
        let slots = self.heat_slots(source_id).await?;

        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO heats (note, class_id, auto_frequency) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(&new_note)
        .bind(class_id)
        .bind(source.auto_frequency)
        .fetch_one(&mut *tx)
        .await?;
        for slot in &slots {
            sqlx::query(
                "INSERT INTO heat_slots (heat_id, node_index, pilot_id, method, seed_rank, seed_id) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(slot.node_index)
            .bind(slot.pilot_id)
            .bind(slot.method)
            .bind(slot.seed_rank)
            .bind(slot.seed_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.bus
            .publish(Event::HeatDuplicate, serde_json::json!({ "heat_id": id }));
        info!(source = source_id, heat_id = id, "Heat duplicated");

        self.get_heat(id)
            .await?
            .ok_or(StoreError::NotFound { kind: "heat", id })
    }

    /// Alter a heat. Class and pilot changes propagate into saved races and
    /// invalidate the touched race, heat, class, and event caches. Returns
    /// the heat and the ids of affected saved races.
    pub async fn alter_heat(&self, patch: HeatPatch) -> StoreResult<(HeatRow, Vec<i64>)> {
        let heat_id = patch.heat;
        let Some(heat) = self.get_heat(heat_id).await? else {
            return Err(StoreError::NotFound {
                kind: "heat",
                id: heat_id,
            });
        };

        if patch.pilot.is_some() && patch.node.is_none() {
            return Err(StoreError::Validation(
                "A pilot assignment requires a node index".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        if let Some(note) = &patch.note {
            sqlx::query("UPDATE heats SET note = ? WHERE id = ?")
                .bind(note)
                .bind(heat_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(status) = patch.status {
            sqlx::query("UPDATE heats SET status = ? WHERE id = ?")
                .bind(status)
                .bind(heat_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(auto) = patch.auto_frequency {
            sqlx::query("UPDATE heats SET auto_frequency = ? WHERE id = ?")
                .bind(auto)
                .bind(heat_id)
                .execute(&mut *tx)
                .await?;
        }

        let old_class_id = heat.class_id;
        if let Some(class_id) = patch.class {
            sqlx::query("UPDATE heats SET class_id = ? WHERE id = ?")
                .bind(class_id)
                .bind(heat_id)
                .execute(&mut *tx)
                .await?;
        }
        if let (Some(pilot_id), Some(node)) = (patch.pilot, patch.node) {
            sqlx::query("UPDATE heat_slots SET pilot_id = ? WHERE heat_id = ? AND node_index = ?")
                .bind(pilot_id)
                .bind(heat_id)
                .bind(node)
                .execute(&mut *tx)
                .await?;
        }

        let races: Vec<(i64,)> = sqlx::query_as("SELECT id FROM saved_races WHERE heat_id = ?")
            .bind(heat_id)
            .fetch_all(&mut *tx)
            .await?;
        let race_ids: Vec<i64> = races.into_iter().map(|(id,)| id).collect();

        let mut touched_caches = false;
        if !race_ids.is_empty() {
            if let Some(class_id) = patch.class {
                sqlx::query("UPDATE saved_races SET class_id = ? WHERE heat_id = ?")
                    .bind(class_id)
                    .bind(heat_id)
                    .execute(&mut *tx)
                    .await?;
                if old_class_id != ID_NONE {
                    super::races::invalidate_class_row(&mut tx, old_class_id).await?;
                }
                touched_caches = true;
            }

            if let (Some(pilot_id), Some(node)) = (patch.pilot, patch.node) {
                for &race_id in &race_ids {
                    sqlx::query(
                        "UPDATE saved_pilot_races SET pilot_id = ? WHERE race_id = ? AND node_index = ?",
                    )
                    .bind(pilot_id)
                    .bind(race_id)
                    .bind(node)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query(
                        "UPDATE saved_laps SET pilot_id = ? WHERE race_id = ? AND node_index = ?",
                    )
                    .bind(pilot_id)
                    .bind(race_id)
                    .bind(node)
                    .execute(&mut *tx)
                    .await?;
                    super::races::invalidate_race_row(&mut tx, race_id).await?;
                }
                touched_caches = true;
            }

            if touched_caches {
                super::races::invalidate_heat_row(&mut tx, heat_id).await?;
                let dest_class: (i64,) = sqlx::query_as("SELECT class_id FROM heats WHERE id = ?")
                    .bind(heat_id)
                    .fetch_one(&mut *tx)
                    .await?;
                if dest_class.0 != ID_NONE {
                    super::races::invalidate_class_row(&mut tx, dest_class.0).await?;
                }
                super::races::invalidate_event_row(&mut tx).await?;
            }
        }

        tx.commit().await?;

        if touched_caches {
            let classes: Vec<i64> = [old_class_id, patch.class.unwrap_or(ID_NONE)]
                .into_iter()
                .filter(|&c| c != ID_NONE)
                .collect();
            self.apply_memory_invalidation(&race_ids, &[heat_id], &classes);
        }

        self.bus
            .publish(Event::HeatAlter, serde_json::json!({ "heat_id": heat_id }));
        info!(heat_id, "Heat altered");

        let heat = self.get_heat(heat_id).await?.ok_or(StoreError::NotFound {
            kind: "heat",
            id: heat_id,
        })?;
        Ok((heat, race_ids))
    }

    /// Delete a heat. Refused for the last remaining heat or while saved
    /// races reference it. Heat ids are opaque and never renumbered.
    pub async fn delete_heat(&self, heat_id: i64) -> StoreResult<()> {
        let heat_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM heats")
            .fetch_one(&self.pool)
            .await?;
        if heat_count <= 1 {
            info!(heat_id, "Refusing to delete only heat");
            return Err(StoreError::Conflict("At least one heat must remain".into()));
        }

        let referenced: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM saved_races WHERE heat_id = ? LIMIT 1")
                .bind(heat_id)
                .fetch_optional(&self.pool)
                .await?;
        if referenced.is_some() {
            info!(heat_id, "Refusing to delete heat: is in use");
            return Err(StoreError::Conflict(format!(
                "Heat {heat_id} has saved races and cannot be deleted"
            )));
        }

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM heats WHERE id = ?")
            .bind(heat_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "heat",
                id: heat_id,
            });
        }
        sqlx::query("DELETE FROM heat_slots WHERE heat_id = ?")
            .bind(heat_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.bus
            .publish(Event::HeatDelete, serde_json::json!({ "heat_id": heat_id }));
        info!(heat_id, "Heat deleted");
        Ok(())
    }

    /// Highest saved round for a heat, 0 when none.
    pub async fn get_max_round(&self, heat_id: i64) -> StoreResult<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(round_id) FROM saved_races WHERE heat_id = ?")
                .bind(heat_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    /// The heat following this one in id order; the last heat stays current.
    pub async fn next_heat_id(&self, heat_id: i64) -> StoreResult<i64> {
        let next: Option<i64> =
            sqlx::query_scalar("SELECT id FROM heats WHERE id > ? ORDER BY id LIMIT 1")
                .bind(heat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(next.unwrap_or(heat_id))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::memory_store;
    use super::*;

    #[tokio::test]
    async fn add_heat_creates_slot_per_node() {
        let store = memory_store().await;
        let heat = store.add_heat().await.unwrap();
        let slots = store.heat_slots(heat.id).await.unwrap();
        assert_eq!(slots.len(), store.node_count());
        assert!(slots.iter().all(|s| s.pilot_id == ID_NONE));
    }

    #[tokio::test]
    async fn duplicate_heat_resolves_note_collision() {
        let store = memory_store().await;
        let heat = store.add_heat().await.unwrap();
        store
            .alter_heat(HeatPatch {
                heat: heat.id,
                note: Some("Finals".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let copy = store.duplicate_heat(heat.id, None).await.unwrap();
        assert_eq!(copy.note, "Finals 2");
        let copy2 = store.duplicate_heat(heat.id, None).await.unwrap();
        assert_eq!(copy2.note, "Finals 3");
    }

    #[tokio::test]
    async fn delete_last_heat_is_refused() {
        let store = memory_store().await;
        let heats = store.list_heats().await.unwrap();
        assert_eq!(heats.len(), 1);
        let err = store.delete_heat(heats[0].id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A second heat makes the first deletable.
        let extra = store.add_heat().await.unwrap();
        store.delete_heat(heats[0].id).await.unwrap();
        assert_eq!(store.list_heats().await.unwrap()[0].id, extra.id);
    }

    #[tokio::test]
    async fn pilot_assignment_requires_node() {
        let store = memory_store().await;
        let heat = store.add_heat().await.unwrap();
        let err = store
            .alter_heat(HeatPatch {
                heat: heat.id,
                pilot: Some(1),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn next_heat_advances_in_id_order() {
        let store = memory_store().await;
        let first = store.list_heats().await.unwrap()[0].id;
        let second = store.add_heat().await.unwrap().id;
        assert_eq!(store.next_heat_id(first).await.unwrap(), second);
        assert_eq!(store.next_heat_id(second).await.unwrap(), second);
    }
}
