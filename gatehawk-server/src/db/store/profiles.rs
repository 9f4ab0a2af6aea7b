use serde::Deserialize;
use tracing::info;

use super::{Store, StoreError, StoreResult, unique_name};
use crate::db::models::ProfileRow;
use crate::events::Event;
use crate::freq::{FrequencySet, LevelSet};

/// Field set accepted by `alter_profile`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilePatch {
    pub profile_id: i64,
    #[serde(rename = "profile_name")]
    pub name: Option<String>,
    #[serde(rename = "profile_description")]
    pub description: Option<String>,
    pub frequencies: Option<FrequencySet>,
    pub enter_ats: Option<LevelSet>,
    pub exit_ats: Option<LevelSet>,
}

impl Store {
    pub async fn get_profile(&self, profile_id: i64) -> StoreResult<Option<ProfileRow>> {
        Ok(
            sqlx::query_as::<_, ProfileRow>("SELECT * FROM profiles WHERE id = ?")
                .bind(profile_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_profiles(&self) -> StoreResult<Vec<ProfileRow>> {
        Ok(
            sqlx::query_as::<_, ProfileRow>("SELECT * FROM profiles ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// New profiles are always copies of an existing one.
    pub async fn duplicate_profile(&self, source_id: i64) -> StoreResult<ProfileRow> {
        let Some(source) = self.get_profile(source_id).await? else {
            return Err(StoreError::NotFound {
                kind: "profile",
                id: source_id,
            });
        };

        let all_names: Vec<String> =
            self.list_profiles().await?.into_iter().map(|p| p.name).collect();
        let base = if source.name.is_empty() {
            "New Profile"
        } else {
            &source.name
        };
        let new_name = unique_name(base, &all_names);

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO profiles (name, description, frequencies, enter_ats, exit_ats) \
             VALUES (?, '', ?, ?, ?) RETURNING id",
        )
        .bind(&new_name)
        .bind(&source.frequencies)
        .bind(&source.enter_ats)
        .bind(&source.exit_ats)
        .fetch_one(&self.pool)
        .await?;

        self.bus
            .publish(Event::ProfileAdd, serde_json::json!({ "profile_id": id }));
        info!(source = source_id, profile_id = id, "Profile duplicated");

        self.get_profile(id)
            .await?
            .ok_or(StoreError::NotFound { kind: "profile", id })
    }

    pub async fn alter_profile(&self, patch: ProfilePatch) -> StoreResult<ProfileRow> {
        let profile_id = patch.profile_id;
        let Some(existing) = self.get_profile(profile_id).await? else {
            return Err(StoreError::NotFound {
                kind: "profile",
                id: profile_id,
            });
        };

        let frequencies = match &patch.frequencies {
            Some(freqs) => serde_json::to_string(freqs)?,
            None => existing.frequencies.clone(),
        };
        let enter_ats = match &patch.enter_ats {
            Some(levels) => Some(serde_json::to_string(levels)?),
            None => existing.enter_ats.clone(),
        };
        let exit_ats = match &patch.exit_ats {
            Some(levels) => Some(serde_json::to_string(levels)?),
            None => existing.exit_ats.clone(),
        };

        sqlx::query(
            "UPDATE profiles SET name = ?, description = ?, frequencies = ?, enter_ats = ?, exit_ats = ? WHERE id = ?",
        )
        .bind(patch.name.as_deref().unwrap_or(&existing.name))
        .bind(patch.description.as_deref().unwrap_or(&existing.description))
        .bind(&frequencies)
        .bind(&enter_ats)
        .bind(&exit_ats)
        .bind(profile_id)
        .execute(&self.pool)
        .await?;

        self.bus
            .publish(Event::ProfileAlter, serde_json::json!({ "profile_id": profile_id }));
        info!(profile_id, "Profile altered");

        self.get_profile(profile_id).await?.ok_or(StoreError::NotFound {
            kind: "profile",
            id: profile_id,
        })
    }

    /// Delete a profile; at least one profile must remain.
    pub async fn delete_profile(&self, profile_id: i64) -> StoreResult<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM profiles")
            .fetch_one(&self.pool)
            .await?;
        if count <= 1 {
            info!(profile_id, "Refusing to delete only profile");
            return Err(StoreError::Conflict("At least one profile must remain".into()));
        }

        let deleted = sqlx::query("DELETE FROM profiles WHERE id = ?")
            .bind(profile_id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "profile",
                id: profile_id,
            });
        }

        self.bus
            .publish(Event::ProfileDelete, serde_json::json!({ "profile_id": profile_id }));
        info!(profile_id, "Profile deleted");
        Ok(())
    }

    /// Frequencies of the profile, decoded and padded to the node count.
    pub fn profile_frequencies(&self, profile: &ProfileRow) -> FrequencySet {
        let mut freqs: FrequencySet = serde_json::from_str(&profile.frequencies)
            .unwrap_or_else(|_| FrequencySet::empty(self.node_count));
        if freqs.len() < self.node_count {
            freqs.resize(self.node_count);
        }
        freqs
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::memory_store;
    use super::*;

    #[tokio::test]
    async fn duplicate_profile_keeps_frequencies() {
        let store = memory_store().await;
        let source = store.list_profiles().await.unwrap().remove(0);
        let copy = store.duplicate_profile(source.id).await.unwrap();
        assert_eq!(copy.frequencies, source.frequencies);
        assert_eq!(copy.name, format!("{} 2", source.name));
    }

    #[tokio::test]
    async fn delete_keeps_at_least_one_profile() {
        let store = memory_store().await;
        let only = store.list_profiles().await.unwrap().remove(0);
        let err = store.delete_profile(only.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let copy = store.duplicate_profile(only.id).await.unwrap();
        store.delete_profile(copy.id).await.unwrap();
    }

    #[tokio::test]
    async fn alter_profile_updates_thresholds() {
        let store = memory_store().await;
        let profile = store.list_profiles().await.unwrap().remove(0);
        let mut enter_ats = LevelSet::empty(4);
        enter_ats.set(0, 92);

        let updated = store
            .alter_profile(ProfilePatch {
                profile_id: profile.id,
                enter_ats: Some(enter_ats.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        let decoded: LevelSet = serde_json::from_str(updated.enter_ats.as_deref().unwrap()).unwrap();
        assert_eq!(decoded.get(0), Some(92));
    }
}
