use serde::Deserialize;
use tracing::info;

use super::{Store, StoreError, StoreResult, unique_name};
use crate::db::models::RaceFormatRow;
use crate::events::Event;

/// Field set accepted by `alter_format`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatPatch {
    pub format_id: i64,
    #[serde(rename = "format_name")]
    pub name: Option<String>,
    pub race_mode: Option<i64>,
    #[serde(rename = "race_time")]
    pub race_time_sec: Option<i64>,
    pub lap_grace_sec: Option<i64>,
    pub staging_fixed_tones: Option<i64>,
    #[serde(rename = "start_delay_min")]
    pub start_delay_min_ms: Option<i64>,
    #[serde(rename = "start_delay_max")]
    pub start_delay_max_ms: Option<i64>,
    pub staging_tones: Option<i64>,
    pub number_laps_win: Option<i64>,
    pub win_condition: Option<i64>,
    pub team_racing_mode: Option<bool>,
    pub start_behavior: Option<i64>,
}

impl Store {
    pub async fn get_format(&self, format_id: i64) -> StoreResult<Option<RaceFormatRow>> {
        Ok(
            sqlx::query_as::<_, RaceFormatRow>("SELECT * FROM race_formats WHERE id = ?")
                .bind(format_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_formats(&self) -> StoreResult<Vec<RaceFormatRow>> {
        Ok(
            sqlx::query_as::<_, RaceFormatRow>("SELECT * FROM race_formats ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// New formats are always copies of an existing one.
    pub async fn duplicate_format(&self, source_id: i64) -> StoreResult<RaceFormatRow> {
        let Some(source) = self.get_format(source_id).await? else {
            return Err(StoreError::NotFound {
                kind: "format",
                id: source_id,
            });
        };

        let all_names: Vec<String> =
            self.list_formats().await?.into_iter().map(|f| f.name).collect();
        let base = if source.name.is_empty() {
            "New Format"
        } else {
            &source.name
        };
        let new_name = unique_name(base, &all_names);

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO race_formats \
             (name, race_mode, race_time_sec, lap_grace_sec, staging_fixed_tones, \
              start_delay_min_ms, start_delay_max_ms, staging_tones, number_laps_win, \
              win_condition, team_racing_mode, start_behavior) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&new_name)
        .bind(source.race_mode)
        .bind(source.race_time_sec)
        .bind(source.lap_grace_sec)
        .bind(source.staging_fixed_tones)
        .bind(source.start_delay_min_ms)
        .bind(source.start_delay_max_ms)
        .bind(source.staging_tones)
        .bind(source.number_laps_win)
        .bind(source.win_condition)
        .bind(source.team_racing_mode)
        .bind(source.start_behavior)
        .fetch_one(&self.pool)
        .await?;

        self.bus
            .publish(Event::FormatAdd, serde_json::json!({ "format_id": id }));
        info!(source = source_id, format_id = id, "Format duplicated");

        self.get_format(id)
            .await?
            .ok_or(StoreError::NotFound { kind: "format", id })
    }

    /// Alter a format. Win-condition and start-behavior changes reorder
    /// existing results, so they cascade invalidation over the format's
    /// saved races, classes, and heats.
    pub async fn alter_format(&self, patch: FormatPatch) -> StoreResult<(RaceFormatRow, Vec<i64>)> {
        let format_id = patch.format_id;
        let Some(existing) = self.get_format(format_id).await? else {
            return Err(StoreError::NotFound {
                kind: "format",
                id: format_id,
            });
        };

        let ordering_changed = patch.win_condition.is_some_and(|w| w != existing.win_condition)
            || patch.start_behavior.is_some_and(|s| s != existing.start_behavior);

        if let Some(win_condition) = patch.win_condition {
            if !(0..=4).contains(&win_condition) {
                return Err(StoreError::Validation(format!(
                    "Unknown win condition {win_condition}"
                )));
            }
        }
        if let Some(race_mode) = patch.race_mode {
            if !(0..=1).contains(&race_mode) {
                return Err(StoreError::Validation(format!("Unknown race mode {race_mode}")));
            }
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE race_formats SET name = ?, race_mode = ?, race_time_sec = ?, \
             lap_grace_sec = ?, staging_fixed_tones = ?, start_delay_min_ms = ?, \
             start_delay_max_ms = ?, staging_tones = ?, number_laps_win = ?, \
             win_condition = ?, team_racing_mode = ?, start_behavior = ? WHERE id = ?",
        )
        .bind(patch.name.as_deref().unwrap_or(&existing.name))
        .bind(patch.race_mode.unwrap_or(existing.race_mode))
        .bind(patch.race_time_sec.unwrap_or(existing.race_time_sec))
        .bind(patch.lap_grace_sec.unwrap_or(existing.lap_grace_sec))
        .bind(patch.staging_fixed_tones.unwrap_or(existing.staging_fixed_tones))
        .bind(patch.start_delay_min_ms.unwrap_or(existing.start_delay_min_ms))
        .bind(patch.start_delay_max_ms.unwrap_or(existing.start_delay_max_ms))
        .bind(patch.staging_tones.unwrap_or(existing.staging_tones))
        .bind(patch.number_laps_win.unwrap_or(existing.number_laps_win))
        .bind(patch.win_condition.unwrap_or(existing.win_condition))
        .bind(patch.team_racing_mode.unwrap_or(existing.team_racing_mode))
        .bind(patch.start_behavior.unwrap_or(existing.start_behavior))
        .bind(format_id)
        .execute(&mut *tx)
        .await?;

        let mut race_ids: Vec<i64> = Vec::new();
        let mut heat_ids: Vec<i64> = Vec::new();
        let mut class_ids: Vec<i64> = Vec::new();

        if ordering_changed {
            let races: Vec<(i64,)> =
                sqlx::query_as("SELECT id FROM saved_races WHERE format_id = ?")
                    .bind(format_id)
                    .fetch_all(&mut *tx)
                    .await?;
            race_ids = races.into_iter().map(|(id,)| id).collect();

            if !race_ids.is_empty() {
                for &race_id in &race_ids {
                    super::races::invalidate_race_row(&mut tx, race_id).await?;
                }
                let classes: Vec<(i64,)> =
                    sqlx::query_as("SELECT id FROM race_classes WHERE format_id = ?")
                        .bind(format_id)
                        .fetch_all(&mut *tx)
                        .await?;
                class_ids = classes.into_iter().map(|(id,)| id).collect();
                for &class_id in &class_ids {
                    super::races::invalidate_class_row(&mut tx, class_id).await?;
                    let heats: Vec<(i64,)> =
                        sqlx::query_as("SELECT id FROM heats WHERE class_id = ?")
                            .bind(class_id)
                            .fetch_all(&mut *tx)
                            .await?;
                    heat_ids.extend(heats.into_iter().map(|(id,)| id));
                }
                for &heat_id in &heat_ids {
                    super::races::invalidate_heat_row(&mut tx, heat_id).await?;
                }
                super::races::invalidate_event_row(&mut tx).await?;
            }
        }

        tx.commit().await?;

        if !race_ids.is_empty() {
            self.apply_memory_invalidation(&race_ids, &heat_ids, &class_ids);
        }

        self.bus
            .publish(Event::FormatAlter, serde_json::json!({ "format_id": format_id }));
        info!(format_id, "Format altered");

        let format = self.get_format(format_id).await?.ok_or(StoreError::NotFound {
            kind: "format",
            id: format_id,
        })?;
        Ok((format, race_ids))
    }

    /// Delete a format. Refused for the last one or while a saved race
    /// references it.
    pub async fn delete_format(&self, format_id: i64) -> StoreResult<()> {
        let referenced: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM saved_races WHERE format_id = ? LIMIT 1")
                .bind(format_id)
                .fetch_optional(&self.pool)
                .await?;
        if referenced.is_some() {
            info!(format_id, "Refusing to delete format: saved race exists");
            return Err(StoreError::Conflict(format!(
                "Format {format_id} has saved races and cannot be deleted"
            )));
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM race_formats")
            .fetch_one(&self.pool)
            .await?;
        if count <= 1 {
            info!(format_id, "Refusing to delete only format");
            return Err(StoreError::Conflict("At least one format must remain".into()));
        }

        let deleted = sqlx::query("DELETE FROM race_formats WHERE id = ?")
            .bind(format_id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "format",
                id: format_id,
            });
        }

        self.bus
            .publish(Event::FormatDelete, serde_json::json!({ "format_id": format_id }));
        info!(format_id, "Format deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::memory_store;
    use super::*;

    #[tokio::test]
    async fn duplicate_format_copies_fields_with_fresh_name() {
        let store = memory_store().await;
        let source = store.list_formats().await.unwrap().remove(0);
        let copy = store.duplicate_format(source.id).await.unwrap();
        assert_eq!(copy.race_time_sec, source.race_time_sec);
        assert_ne!(copy.name, source.name);
        assert!(copy.name.starts_with(&source.name));
    }

    #[tokio::test]
    async fn alter_format_rejects_unknown_enums() {
        let store = memory_store().await;
        let format = store.list_formats().await.unwrap().remove(0);
        let err = store
            .alter_format(FormatPatch {
                format_id: format.id,
                win_condition: Some(9),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_keeps_at_least_one_format() {
        let store = memory_store().await;
        let formats = store.list_formats().await.unwrap();
        // Seeded with two; deleting down to one is allowed, below one is not.
        store.delete_format(formats[1].id).await.unwrap();
        let err = store.delete_format(formats[0].id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
