use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{info, warn};

use super::{ID_NONE, Store, StoreError, StoreResult, options};
use crate::events::Event;

const BACKUP_DIR: &str = "db_bkp";
pub const AUTO_BACKUP_PREFIX: &str = "autoBkp_";

impl Store {
    fn backup_dir(&self) -> PathBuf {
        Path::new(&self.db_path)
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(BACKUP_DIR)
    }

    /// Snapshot the live database into `db_bkp/` as a timestamped copy.
    /// `prefix` distinguishes operator backups from automatic ones.
    pub async fn backup_database(&self, prefix: &str) -> StoreResult<String> {
        if self.db_path == ":memory:" {
            return Err(StoreError::Validation(
                "An in-memory database cannot be backed up".into(),
            ));
        }

        let dir = self.backup_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Validation(format!("Cannot create backup dir: {e}")))?;

        let stem = Path::new(&self.db_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("database");
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let file_name = format!("{prefix}{stem}_{stamp}.db");
        let target = dir.join(&file_name);
        let target_str = target.to_string_lossy().replace('\'', "''");

        // VACUUM INTO snapshots a consistent copy without blocking writers.
        sqlx::query(&format!("VACUUM INTO '{target_str}'"))
            .execute(&self.pool)
            .await?;

        self.bus.publish(
            Event::DatabaseBackup,
            serde_json::json!({ "file_name": file_name }),
        );
        info!(file = %file_name, "Database backup written");
        Ok(file_name)
    }

    pub fn list_backups(&self) -> StoreResult<Vec<String>> {
        let dir = self.backup_dir();
        let mut files: Vec<String> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name.ends_with(".db"))
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        Ok(files)
    }

    /// Replace all persisted state with a backup's contents by re-importing
    /// every table through an attached connection, then re-prime caches.
    pub async fn restore_database(&self, backup_file: &str) -> StoreResult<()> {
        let source = self.backup_dir().join(backup_file);
        if backup_file.contains('/') || backup_file.contains('\\') || !source.is_file() {
            return Err(StoreError::Validation(format!(
                "Backup file {backup_file} not found"
            )));
        }
        let source_str = source.to_string_lossy().replace('\'', "''");

        let tables = [
            "pilots",
            "race_classes",
            "heats",
            "heat_slots",
            "race_formats",
            "profiles",
            "saved_races",
            "saved_pilot_races",
            "saved_laps",
            "lap_splits",
            "global_settings",
        ];

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("ATTACH DATABASE '{source_str}' AS restore_src"))
            .execute(&mut *tx)
            .await?;
        for table in tables {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "INSERT INTO {table} SELECT * FROM restore_src.{table}"
            ))
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DETACH DATABASE restore_src")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.prime_options_cache().await?;
        self.apply_memory_invalidation(&[], &[], &[]);

        self.bus.publish(
            Event::DatabaseRestore,
            serde_json::json!({ "file_name": backup_file }),
        );
        info!(file = %backup_file, "Database restored from backup");
        Ok(())
    }

    pub fn delete_backup(&self, backup_file: &str) -> StoreResult<()> {
        let target = self.backup_dir().join(backup_file);
        if backup_file.contains('/') || backup_file.contains('\\') || !target.is_file() {
            return Err(StoreError::Validation(format!(
                "Backup file {backup_file} not found"
            )));
        }
        std::fs::remove_file(&target)
            .map_err(|e| StoreError::Validation(format!("Cannot delete backup: {e}")))?;
        info!(file = %backup_file, "Backup file deleted");
        Ok(())
    }

    /// Drop automatic backups beyond the configured keep count, oldest
    /// first.
    pub fn prune_auto_backups(&self) {
        let keep = self.get_option_int(options::DB_AUTOBKP_NUM_KEEP, 30).max(0) as usize;
        let mut auto_backups: Vec<String> = match self.list_backups() {
            Ok(files) => files
                .into_iter()
                .filter(|f| f.starts_with(AUTO_BACKUP_PREFIX))
                .collect(),
            Err(_) => return,
        };
        if auto_backups.len() <= keep {
            return;
        }
        auto_backups.sort();
        let excess = auto_backups.len() - keep;
        for file in auto_backups.into_iter().take(excess) {
            if let Err(error) = self.delete_backup(&file) {
                warn!(file = %file, error = %error, "Failed to prune auto backup");
            }
        }
    }

    /// Selective wipe driven by the `reset_database` command.
    pub async fn reset_database(&self, reset_type: &str) -> StoreResult<()> {
        match reset_type {
            "races" => self.clear_race_data().await?,
            "heats" => {
                self.clear_race_data().await?;
                sqlx::query("DELETE FROM heat_slots").execute(&self.pool).await?;
                sqlx::query("DELETE FROM heats").execute(&self.pool).await?;
                self.add_heat().await?;
            }
            "classes" => {
                self.clear_race_data().await?;
                sqlx::query("DELETE FROM heat_slots").execute(&self.pool).await?;
                sqlx::query("DELETE FROM heats").execute(&self.pool).await?;
                sqlx::query("DELETE FROM race_classes").execute(&self.pool).await?;
                self.add_heat().await?;
            }
            "pilots" => {
                self.clear_race_data().await?;
                sqlx::query("DELETE FROM pilots").execute(&self.pool).await?;
                sqlx::query("UPDATE heat_slots SET pilot_id = ?")
                    .bind(ID_NONE)
                    .execute(&self.pool)
                    .await?;
            }
            "formats" => {
                self.clear_race_data().await?;
                sqlx::query("UPDATE race_classes SET format_id = ?")
                    .bind(ID_NONE)
                    .execute(&self.pool)
                    .await?;
                sqlx::query("DELETE FROM race_formats").execute(&self.pool).await?;
                self.seed_defaults().await?;
            }
            "all" => {
                self.clear_race_data().await?;
                sqlx::query("DELETE FROM heat_slots").execute(&self.pool).await?;
                sqlx::query("DELETE FROM heats").execute(&self.pool).await?;
                sqlx::query("DELETE FROM race_classes").execute(&self.pool).await?;
                sqlx::query("DELETE FROM pilots").execute(&self.pool).await?;
                sqlx::query("DELETE FROM race_formats").execute(&self.pool).await?;
                self.seed_defaults().await?;
            }
            other => {
                return Err(StoreError::Validation(format!(
                    "Unknown reset type '{other}'"
                )));
            }
        }

        self.bus.publish(
            Event::DatabaseReset,
            serde_json::json!({ "reset_type": reset_type }),
        );
        info!(reset_type, "Database reset");
        Ok(())
    }

    /// CSV export of a chosen entity set.
    pub async fn export_database(&self, exporter: &str) -> StoreResult<String> {
        let mut out = String::new();
        match exporter {
            "pilots" => {
                out.push_str("id,name,callsign,team,phonetic\n");
                for pilot in self.list_pilots().await? {
                    out.push_str(&format!(
                        "{},{},{},{},{}\n",
                        pilot.id,
                        csv_field(&pilot.name),
                        csv_field(&pilot.callsign),
                        csv_field(&pilot.team),
                        csv_field(&pilot.phonetic),
                    ));
                }
            }
            "heats" => {
                out.push_str("id,note,class_id,node_index,pilot_id\n");
                for heat in self.list_heats().await? {
                    for slot in self.heat_slots(heat.id).await? {
                        out.push_str(&format!(
                            "{},{},{},{},{}\n",
                            heat.id,
                            csv_field(&heat.note),
                            heat.class_id,
                            slot.node_index.map_or(String::new(), |n| n.to_string()),
                            slot.pilot_id,
                        ));
                    }
                }
            }
            "classes" => {
                out.push_str("id,name,description,format_id\n");
                for class in self.list_classes().await? {
                    out.push_str(&format!(
                        "{},{},{},{}\n",
                        class.id,
                        csv_field(&class.name),
                        csv_field(&class.description),
                        class.format_id,
                    ));
                }
            }
            "laps" => {
                out.push_str("race_id,round_id,heat_id,node_index,pilot_id,lap_number,lap_time_stamp,lap_time\n");
                for race in self.list_saved_races(super::RaceQuery::new()).await? {
                    for pilot_race in self.saved_pilot_races_for_race(race.id).await? {
                        for lap in self.active_laps_for_pilot_race(pilot_race.id).await? {
                            out.push_str(&format!(
                                "{},{},{},{},{},{},{},{}\n",
                                race.id,
                                race.round_id,
                                race.heat_id,
                                lap.node_index,
                                lap.pilot_id,
                                lap.lap_number.map_or(String::new(), |n| n.to_string()),
                                lap.lap_time_stamp,
                                lap.lap_time,
                            ));
                        }
                    }
                }
            }
            other => {
                return Err(StoreError::Validation(format!(
                    "Unknown exporter '{other}'"
                )));
            }
        }

        self.bus.publish(
            Event::DatabaseExport,
            serde_json::json!({ "exporter": exporter }),
        );
        Ok(out)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::memory_store;
    use super::*;

    #[tokio::test]
    async fn reset_races_clears_history_only() {
        let store = memory_store().await;
        let pilot = store.add_pilot().await.unwrap();
        sqlx::query(
            "INSERT INTO saved_races (round_id, heat_id, start_time, start_time_wall) VALUES (1, 1, 0.0, 'x')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        store.reset_database("races").await.unwrap();

        assert_eq!(store.count_saved_races().await.unwrap(), 0);
        assert!(store.get_pilot(pilot.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reset_all_reseeds_minimums() {
        let store = memory_store().await;
        store.add_pilot().await.unwrap();
        store.reset_database("all").await.unwrap();

        assert!(store.list_pilots().await.unwrap().is_empty());
        assert!(!store.list_heats().await.unwrap().is_empty());
        assert!(!store.list_formats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_reset_type_is_rejected() {
        let store = memory_store().await;
        let err = store.reset_database("everything").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn export_pilots_quotes_fields() {
        let store = memory_store().await;
        let pilot = store.add_pilot().await.unwrap();
        store
            .alter_pilot(super::super::PilotPatch {
                pilot_id: pilot.id,
                callsign: Some("fast, faster".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let csv = store.export_database("pilots").await.unwrap();
        assert!(csv.contains("\"fast, faster\""));
    }
}
