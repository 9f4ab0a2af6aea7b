use serde::Deserialize;
use tracing::info;

use super::{ID_NONE, Store, StoreError, StoreResult, unique_name};
use crate::db::models::RaceClassRow;
use crate::events::Event;

/// Field set accepted by `alter_class`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassPatch {
    pub class_id: i64,
    #[serde(rename = "class_name")]
    pub name: Option<String>,
    #[serde(rename = "class_description")]
    pub description: Option<String>,
    #[serde(rename = "class_format")]
    pub format_id: Option<i64>,
}

impl Store {
    pub async fn get_class(&self, class_id: i64) -> StoreResult<Option<RaceClassRow>> {
        Ok(
            sqlx::query_as::<_, RaceClassRow>("SELECT * FROM race_classes WHERE id = ?")
                .bind(class_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_classes(&self) -> StoreResult<Vec<RaceClassRow>> {
        Ok(
            sqlx::query_as::<_, RaceClassRow>("SELECT * FROM race_classes ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn add_class(&self) -> StoreResult<RaceClassRow> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO race_classes (name, description, format_id) VALUES ('', '', ?) RETURNING id",
        )
        .bind(ID_NONE)
        .fetch_one(&self.pool)
        .await?;

        self.bus
            .publish(Event::ClassAdd, serde_json::json!({ "class_id": id }));
        info!(class_id = id, "Class added");

        self.get_class(id)
            .await?
            .ok_or(StoreError::NotFound { kind: "class", id })
    }

    /// Deep copy: duplicates the class and every heat assigned to it.
    pub async fn duplicate_class(&self, source_id: i64) -> StoreResult<RaceClassRow> {
        let Some(source) = self.get_class(source_id).await? else {
            return Err(StoreError::NotFound {
                kind: "class",
                id: source_id,
            });
        };

        let new_name = if source.name.is_empty() {
            String::new()
        } else {
            let all_names: Vec<String> =
                self.list_classes().await?.into_iter().map(|c| c.name).collect();
            unique_name(&source.name, &all_names)
        };

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO race_classes (name, description, format_id) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(&new_name)
        .bind(&source.description)
        .bind(source.format_id)
        .fetch_one(&self.pool)
        .await?;

        let heats: Vec<(i64,)> = sqlx::query_as("SELECT id FROM heats WHERE class_id = ?")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;
        for (heat_id,) in heats {
            self.duplicate_heat(heat_id, Some(id)).await?;
        }

        self.bus
            .publish(Event::ClassDuplicate, serde_json::json!({ "class_id": id }));
        info!(source = source_id, class_id = id, "Class duplicated");

        self.get_class(id)
            .await?
            .ok_or(StoreError::NotFound { kind: "class", id })
    }

    /// Alter a class. A format change cascades to the class's saved races
    /// and heats and invalidates their caches. Returns the class and the
    /// affected saved race ids.
    pub async fn alter_class(&self, patch: ClassPatch) -> StoreResult<(RaceClassRow, Vec<i64>)> {
        let class_id = patch.class_id;
        let Some(existing) = self.get_class(class_id).await? else {
            return Err(StoreError::NotFound {
                kind: "class",
                id: class_id,
            });
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE race_classes SET name = ?, description = ?, format_id = ? WHERE id = ?")
            .bind(patch.name.as_deref().unwrap_or(&existing.name))
            .bind(patch.description.as_deref().unwrap_or(&existing.description))
            .bind(patch.format_id.unwrap_or(existing.format_id))
            .bind(class_id)
            .execute(&mut *tx)
            .await?;

        let races: Vec<(i64,)> = sqlx::query_as("SELECT id FROM saved_races WHERE class_id = ?")
            .bind(class_id)
            .fetch_all(&mut *tx)
            .await?;
        let race_ids: Vec<i64> = races.into_iter().map(|(id,)| id).collect();

        let mut heat_ids: Vec<i64> = Vec::new();
        let new_format_id = patch.format_id.filter(|&id| id != existing.format_id);
        let format_changed = new_format_id.is_some();
        if let Some(format_id) = new_format_id {
            sqlx::query("UPDATE saved_races SET format_id = ? WHERE class_id = ?")
                .bind(format_id)
                .bind(class_id)
                .execute(&mut *tx)
                .await?;

            if !race_ids.is_empty() {
                for &race_id in &race_ids {
                    super::races::invalidate_race_row(&mut tx, race_id).await?;
                }
                super::races::invalidate_class_row(&mut tx, class_id).await?;
                super::races::invalidate_event_row(&mut tx).await?;
            }

            let heats: Vec<(i64,)> = sqlx::query_as("SELECT id FROM heats WHERE class_id = ?")
                .bind(class_id)
                .fetch_all(&mut *tx)
                .await?;
            heat_ids = heats.into_iter().map(|(id,)| id).collect();
            for &heat_id in &heat_ids {
                super::races::invalidate_heat_row(&mut tx, heat_id).await?;
            }
        }

        tx.commit().await?;

        if format_changed && !race_ids.is_empty() {
            self.apply_memory_invalidation(&race_ids, &heat_ids, &[class_id]);
        }
        if patch.name.is_some() && !race_ids.is_empty() {
            self.set_page_cache_valid(false);
        }

        self.bus
            .publish(Event::ClassAlter, serde_json::json!({ "class_id": class_id }));
        info!(class_id, "Class altered");

        let class = self.get_class(class_id).await?.ok_or(StoreError::NotFound {
            kind: "class",
            id: class_id,
        })?;
        Ok((class, race_ids))
    }

    /// Delete a class. Refused while a saved race references it; heats in
    /// the class fall back to unclassified.
    pub async fn delete_class(&self, class_id: i64) -> StoreResult<()> {
        let referenced: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM saved_races WHERE class_id = ? LIMIT 1")
                .bind(class_id)
                .fetch_optional(&self.pool)
                .await?;
        if referenced.is_some() {
            info!(class_id, "Refusing to delete class: is in use");
            return Err(StoreError::Conflict(format!(
                "Class {class_id} has saved races and cannot be deleted"
            )));
        }

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM race_classes WHERE id = ?")
            .bind(class_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "class",
                id: class_id,
            });
        }
        sqlx::query("UPDATE heats SET class_id = ? WHERE class_id = ?")
            .bind(ID_NONE)
            .bind(class_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.bus
            .publish(Event::ClassDelete, serde_json::json!({ "class_id": class_id }));
        info!(class_id, "Class deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::memory_store;
    use super::*;
    use crate::db::store::heats::HeatPatch;

    #[tokio::test]
    async fn duplicate_class_copies_heats() {
        let store = memory_store().await;
        let class = store.add_class().await.unwrap();
        store
            .alter_class(ClassPatch {
                class_id: class.id,
                name: Some("Open".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let heat = store.add_heat().await.unwrap();
        store
            .alter_heat(HeatPatch {
                heat: heat.id,
                class: Some(class.id),
                ..Default::default()
            })
            .await
            .unwrap();

        let copy = store.duplicate_class(class.id).await.unwrap();
        assert_eq!(copy.name, "Open 2");
        let copied_heats: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM heats WHERE class_id = ?")
                .bind(copy.id)
                .fetch_all(&store.pool)
                .await
                .unwrap();
        assert_eq!(copied_heats.len(), 1);
    }

    #[tokio::test]
    async fn delete_class_clears_heat_references() {
        let store = memory_store().await;
        let class = store.add_class().await.unwrap();
        let heat = store.add_heat().await.unwrap();
        store
            .alter_heat(HeatPatch {
                heat: heat.id,
                class: Some(class.id),
                ..Default::default()
            })
            .await
            .unwrap();

        store.delete_class(class.id).await.unwrap();
        let heat = store.get_heat(heat.id).await.unwrap().unwrap();
        assert_eq!(heat.class_id, ID_NONE);
    }
}
