use sqlx::{Sqlite, Transaction};
use tracing::info;

use super::{CacheStatus, ID_NONE, Store, StoreError, StoreResult, options};
use crate::db::models::{SavedLapRow, SavedPilotRaceRow, SavedRaceRow};
use crate::results::cache::CacheKey;
use crate::results::leaderboard::RankMethod;

/// Ordering applied to saved-race listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RaceOrder {
    #[default]
    ById,
    ByIdDesc,
    /// Wall-clock start order; identical timestamps keep insertion order.
    ByStartTimeWall,
}

/// Query value accepted by the saved-race listing operations.
#[derive(Debug, Clone, Default)]
pub struct RaceQuery {
    heat_id: Option<i64>,
    class_id: Option<i64>,
    format_id: Option<i64>,
    order: RaceOrder,
    limit: Option<i64>,
}

impl RaceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heat(mut self, heat_id: i64) -> Self {
        self.heat_id = Some(heat_id);
        self
    }

    pub fn class(mut self, class_id: i64) -> Self {
        self.class_id = Some(class_id);
        self
    }

    pub fn format(mut self, format_id: i64) -> Self {
        self.format_id = Some(format_id);
        self
    }

    pub fn order(mut self, order: RaceOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Filter for the latest saved enter/exit levels, used by adaptive
/// calibration. Narrower filters are tried first by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct PilotRaceQuery {
    pub node_index: i64,
    pub pilot_id: Option<i64>,
    pub heat_id: Option<i64>,
    pub class_id: Option<i64>,
}

/// A complete race ready to be persisted by the save pipeline.
#[derive(Debug, Clone)]
pub struct NewSavedRace {
    pub round_id: i64,
    pub heat_id: i64,
    pub class_id: i64,
    pub format_id: i64,
    pub start_time: f64,
    pub start_time_wall: String,
    pub pilot_races: Vec<NewSavedPilotRace>,
}

#[derive(Debug, Clone)]
pub struct NewSavedPilotRace {
    pub node_index: i64,
    pub pilot_id: i64,
    pub enter_at: i64,
    pub exit_at: i64,
    pub rssi_history: String,
    pub time_history: String,
    pub laps: Vec<NewSavedLap>,
}

#[derive(Debug, Clone)]
pub struct NewSavedLap {
    pub lap_number: Option<i64>,
    pub lap_time_stamp: i64,
    pub lap_time: i64,
    pub source: i64,
    pub deleted: bool,
    pub invalid: bool,
    pub late_lap: bool,
}

pub(crate) async fn invalidate_race_row(
    tx: &mut Transaction<'_, Sqlite>,
    race_id: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE saved_races SET cache_status = 'invalid' WHERE id = ?")
        .bind(race_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) async fn invalidate_heat_row(
    tx: &mut Transaction<'_, Sqlite>,
    heat_id: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE heats SET cache_status = 'invalid' WHERE id = ?")
        .bind(heat_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) async fn invalidate_class_row(
    tx: &mut Transaction<'_, Sqlite>,
    class_id: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE race_classes SET cache_status = 'invalid' WHERE id = ?")
        .bind(class_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) async fn invalidate_event_row(tx: &mut Transaction<'_, Sqlite>) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO global_settings (option_name, option_value) VALUES (?, 'invalid') \
         ON CONFLICT(option_name) DO UPDATE SET option_value = 'invalid'",
    )
    .bind(options::EVENT_RESULTS_CACHE_STATUS)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl Store {
    /// Drop in-memory leaderboards and the page cache after a committed
    /// invalidation. The event cache always goes with them.
    pub(crate) fn apply_memory_invalidation(
        &self,
        race_ids: &[i64],
        heat_ids: &[i64],
        class_ids: &[i64],
    ) {
        for &race_id in race_ids {
            self.results.invalidate(CacheKey::Race(race_id));
        }
        for &heat_id in heat_ids {
            self.results.invalidate(CacheKey::Heat(heat_id));
        }
        for &class_id in class_ids {
            self.results.invalidate(CacheKey::Class(class_id));
        }
        self.results.invalidate(CacheKey::Event);
        self.set_page_cache_valid(false);
        self.options_cache
            .write()
            .expect("options cache poisoned")
            .insert(
                options::EVENT_RESULTS_CACHE_STATUS.to_string(),
                CacheStatus::Invalid.as_str().to_string(),
            );
    }

    /// Invalidate a saved race and every aggregate that includes it.
    pub async fn invalidate_race_results(&self, race_id: i64) -> StoreResult<()> {
        let Some(race) = self.get_saved_race(race_id).await? else {
            return Err(StoreError::NotFound {
                kind: "saved race",
                id: race_id,
            });
        };

        let mut tx = self.pool.begin().await?;
        invalidate_race_row(&mut tx, race_id).await?;
        invalidate_heat_row(&mut tx, race.heat_id).await?;
        if race.class_id != ID_NONE {
            invalidate_class_row(&mut tx, race.class_id).await?;
        }
        invalidate_event_row(&mut tx).await?;
        tx.commit().await?;

        let classes: Vec<i64> = if race.class_id != ID_NONE {
            vec![race.class_id]
        } else {
            vec![]
        };
        self.apply_memory_invalidation(&[race_id], &[race.heat_id], &classes);
        Ok(())
    }

    pub(crate) async fn mark_race_cache(&self, race_id: i64, status: CacheStatus) -> StoreResult<()> {
        sqlx::query("UPDATE saved_races SET cache_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(race_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn mark_heat_cache(&self, heat_id: i64, status: CacheStatus) -> StoreResult<()> {
        sqlx::query("UPDATE heats SET cache_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(heat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn mark_class_cache(&self, class_id: i64, status: CacheStatus) -> StoreResult<()> {
        sqlx::query("UPDATE race_classes SET cache_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(class_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_saved_race(&self, race_id: i64) -> StoreResult<Option<SavedRaceRow>> {
        Ok(
            sqlx::query_as::<_, SavedRaceRow>("SELECT * FROM saved_races WHERE id = ?")
                .bind(race_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_saved_races(&self, query: RaceQuery) -> StoreResult<Vec<SavedRaceRow>> {
        let mut builder = sqlx::QueryBuilder::<Sqlite>::new("SELECT * FROM saved_races WHERE 1=1");
        if let Some(heat_id) = query.heat_id {
            builder.push(" AND heat_id = ").push_bind(heat_id);
        }
        if let Some(class_id) = query.class_id {
            builder.push(" AND class_id = ").push_bind(class_id);
        }
        if let Some(format_id) = query.format_id {
            builder.push(" AND format_id = ").push_bind(format_id);
        }
        builder.push(match query.order {
            RaceOrder::ById => " ORDER BY id",
            RaceOrder::ByIdDesc => " ORDER BY id DESC",
            RaceOrder::ByStartTimeWall => " ORDER BY start_time_wall, id",
        });
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        Ok(builder
            .build_query_as::<SavedRaceRow>()
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn count_saved_races(&self) -> StoreResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM saved_races")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn saved_pilot_races_for_race(
        &self,
        race_id: i64,
    ) -> StoreResult<Vec<SavedPilotRaceRow>> {
        Ok(sqlx::query_as::<_, SavedPilotRaceRow>(
            "SELECT * FROM saved_pilot_races WHERE race_id = ? ORDER BY node_index",
        )
        .bind(race_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Non-deleted laps of one pilot race, in time order.
    pub async fn active_laps_for_pilot_race(
        &self,
        pilot_race_id: i64,
    ) -> StoreResult<Vec<SavedLapRow>> {
        Ok(sqlx::query_as::<_, SavedLapRow>(
            "SELECT * FROM saved_laps WHERE pilot_race_id = ? AND deleted = 0 ORDER BY lap_time_stamp",
        )
        .bind(pilot_race_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Ranking used for one saved race's leaderboard, from its format.
    pub(crate) async fn race_rank_method(&self, race_id: i64) -> StoreResult<RankMethod> {
        let Some(race) = self.get_saved_race(race_id).await? else {
            return Err(StoreError::NotFound {
                kind: "saved race",
                id: race_id,
            });
        };
        let win_condition = match self.get_format(race.format_id).await? {
            Some(format) => format.win_condition,
            None => 0,
        };
        Ok(match win_condition {
            3 => RankMethod::FastestLap,
            4 => RankMethod::FastestConsecutive,
            _ => RankMethod::RaceProgress,
        })
    }

    /// Most recent saved enter/exit levels matching the filter, searched by
    /// descending pilot-race id.
    pub async fn latest_saved_levels(
        &self,
        query: PilotRaceQuery,
    ) -> StoreResult<Option<(i64, i64)>> {
        let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
            "SELECT spr.enter_at, spr.exit_at FROM saved_pilot_races spr \
             JOIN saved_races sr ON sr.id = spr.race_id WHERE spr.node_index = ",
        );
        builder.push_bind(query.node_index);
        if let Some(pilot_id) = query.pilot_id {
            builder.push(" AND spr.pilot_id = ").push_bind(pilot_id);
        }
        if let Some(heat_id) = query.heat_id {
            builder.push(" AND sr.heat_id = ").push_bind(heat_id);
        }
        if let Some(class_id) = query.class_id {
            builder.push(" AND sr.class_id = ").push_bind(class_id);
        }
        builder.push(" ORDER BY spr.id DESC LIMIT 1");

        Ok(builder
            .build_query_as::<(i64, i64)>()
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Persist a finished race with its pilot races and laps, and
    /// invalidate the enclosing caches, in one transaction.
    pub async fn save_race(&self, race: NewSavedRace) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;

        let race_id: i64 = sqlx::query_scalar(
            "INSERT INTO saved_races (round_id, heat_id, class_id, format_id, start_time, start_time_wall) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(race.round_id)
        .bind(race.heat_id)
        .bind(race.class_id)
        .bind(race.format_id)
        .bind(race.start_time)
        .bind(&race.start_time_wall)
        .fetch_one(&mut *tx)
        .await?;

        for pilot_race in &race.pilot_races {
            let pilot_race_id: i64 = sqlx::query_scalar(
                "INSERT INTO saved_pilot_races \
                 (race_id, node_index, pilot_id, enter_at, exit_at, rssi_history, time_history) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(race_id)
            .bind(pilot_race.node_index)
            .bind(pilot_race.pilot_id)
            .bind(pilot_race.enter_at)
            .bind(pilot_race.exit_at)
            .bind(&pilot_race.rssi_history)
            .bind(&pilot_race.time_history)
            .fetch_one(&mut *tx)
            .await?;

            for lap in &pilot_race.laps {
                sqlx::query(
                    "INSERT INTO saved_laps \
                     (pilot_race_id, race_id, node_index, pilot_id, lap_number, lap_time_stamp, \
                      lap_time, source, deleted, invalid, late_lap) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(pilot_race_id)
                .bind(race_id)
                .bind(pilot_race.node_index)
                .bind(pilot_race.pilot_id)
                .bind(lap.lap_number)
                .bind(lap.lap_time_stamp)
                .bind(lap.lap_time)
                .bind(lap.source)
                .bind(lap.deleted)
                .bind(lap.invalid)
                .bind(lap.late_lap)
                .execute(&mut *tx)
                .await?;
            }
        }

        invalidate_heat_row(&mut tx, race.heat_id).await?;
        if race.class_id != ID_NONE {
            invalidate_class_row(&mut tx, race.class_id).await?;
        }
        invalidate_event_row(&mut tx).await?;
        tx.commit().await?;

        let classes: Vec<i64> = if race.class_id != ID_NONE {
            vec![race.class_id]
        } else {
            vec![]
        };
        self.apply_memory_invalidation(&[], &[race.heat_id], &classes);

        info!(race_id, heat_id = race.heat_id, round_id = race.round_id, "Race saved");
        Ok(race_id)
    }

    /// Move a saved race to another heat: both heats' rounds are renumbered
    /// in wall-clock order, the race takes the destination heat's class and
    /// format, and the touched caches go invalid.
    pub async fn reassign_race_to_heat(
        &self,
        race_id: i64,
        new_heat_id: i64,
    ) -> StoreResult<SavedRaceRow> {
        let Some(race) = self.get_saved_race(race_id).await? else {
            return Err(StoreError::NotFound {
                kind: "saved race",
                id: race_id,
            });
        };
        let Some(new_heat) = self.get_heat(new_heat_id).await? else {
            return Err(StoreError::NotFound {
                kind: "heat",
                id: new_heat_id,
            });
        };

        let old_heat_id = race.heat_id;
        let old_class_id = race.class_id;
        let old_format_id = race.format_id;

        let new_class_id = new_heat.class_id;
        let new_format_id = if new_class_id != ID_NONE {
            self.get_class(new_class_id)
                .await?
                .map(|class| class.format_id)
                .unwrap_or(race.format_id)
        } else {
            race.format_id
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE saved_races SET heat_id = ?, class_id = ?, format_id = ? WHERE id = ?")
            .bind(new_heat_id)
            .bind(new_class_id)
            .bind(new_format_id)
            .bind(race_id)
            .execute(&mut *tx)
            .await?;

        for heat_id in [old_heat_id, new_heat_id] {
            renumber_heat_rounds(&mut tx, heat_id).await?;
        }

        invalidate_heat_row(&mut tx, old_heat_id).await?;
        invalidate_heat_row(&mut tx, new_heat_id).await?;
        if old_format_id != new_format_id {
            invalidate_race_row(&mut tx, race_id).await?;
        }
        if old_class_id != new_class_id {
            if old_class_id != ID_NONE {
                invalidate_class_row(&mut tx, old_class_id).await?;
            }
            if new_class_id != ID_NONE {
                invalidate_class_row(&mut tx, new_class_id).await?;
            }
        }
        invalidate_event_row(&mut tx).await?;
        tx.commit().await?;

        let classes: Vec<i64> = [old_class_id, new_class_id]
            .into_iter()
            .filter(|&c| c != ID_NONE)
            .collect();
        self.apply_memory_invalidation(&[race_id], &[old_heat_id, new_heat_id], &classes);

        info!(race_id, new_heat_id, "Race reassigned to heat");

        self.get_saved_race(race_id).await?.ok_or(StoreError::NotFound {
            kind: "saved race",
            id: race_id,
        })
    }

    /// Delete all race history (split-secondary first join, database reset).
    pub async fn clear_race_data(&self) -> StoreResult<()> {
        let heats: Vec<(i64,)> = sqlx::query_as("SELECT id FROM heats")
            .fetch_all(&self.pool)
            .await?;
        let classes: Vec<(i64,)> = sqlx::query_as("SELECT id FROM race_classes")
            .fetch_all(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM saved_laps").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM lap_splits").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM saved_pilot_races").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM saved_races").execute(&mut *tx).await?;
        for (heat_id,) in &heats {
            invalidate_heat_row(&mut tx, *heat_id).await?;
        }
        for (class_id,) in &classes {
            invalidate_class_row(&mut tx, *class_id).await?;
        }
        invalidate_event_row(&mut tx).await?;
        tx.commit().await?;

        let heat_ids: Vec<i64> = heats.into_iter().map(|(id,)| id).collect();
        let class_ids: Vec<i64> = classes.into_iter().map(|(id,)| id).collect();
        self.apply_memory_invalidation(&[], &heat_ids, &class_ids);

        info!("Race data cleared");
        Ok(())
    }
}

async fn renumber_heat_rounds(
    tx: &mut Transaction<'_, Sqlite>,
    heat_id: i64,
) -> sqlx::Result<()> {
    // Identical wall-clock starts keep prior relative order via the id
    // tie-break.
    let races: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM saved_races WHERE heat_id = ? ORDER BY start_time_wall, id",
    )
    .bind(heat_id)
    .fetch_all(&mut **tx)
    .await?;

    for (round, (race_id,)) in races.iter().enumerate() {
        sqlx::query("UPDATE saved_races SET round_id = ? WHERE id = ?")
            .bind(round as i64 + 1)
            .bind(race_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::memory_store;
    use super::*;

    async fn insert_race(store: &Store, heat_id: i64, round_id: i64, wall: &str) -> i64 {
        sqlx::query_scalar(
            "INSERT INTO saved_races (round_id, heat_id, start_time, start_time_wall) \
             VALUES (?, ?, 0.0, ?) RETURNING id",
        )
        .bind(round_id)
        .bind(heat_id)
        .bind(wall)
        .fetch_one(&store.pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn reassign_renumbers_both_heats() {
        let store = memory_store().await;
        let h1 = store.list_heats().await.unwrap()[0].id;
        let h2 = store.add_heat().await.unwrap().id;

        let race_a = insert_race(&store, h1, 1, "2026-05-01 10:00:00").await;
        let race_b = insert_race(&store, h1, 2, "2026-05-01 10:20:00").await;

        store.reassign_race_to_heat(race_b, h2).await.unwrap();

        let a = store.get_saved_race(race_a).await.unwrap().unwrap();
        let b = store.get_saved_race(race_b).await.unwrap().unwrap();
        assert_eq!(a.heat_id, h1);
        assert_eq!(a.round_id, 1);
        assert_eq!(b.heat_id, h2);
        assert_eq!(b.round_id, 1);

        let h1_row = store.get_heat(h1).await.unwrap().unwrap();
        let h2_row = store.get_heat(h2).await.unwrap().unwrap();
        assert_eq!(h1_row.cache_status, "invalid");
        assert_eq!(h2_row.cache_status, "invalid");
        assert_eq!(
            store.get_option_or(options::EVENT_RESULTS_CACHE_STATUS, ""),
            "invalid"
        );
    }

    #[tokio::test]
    async fn rounds_order_by_wall_time_with_stable_ties() {
        let store = memory_store().await;
        let h1 = store.list_heats().await.unwrap()[0].id;
        let h2 = store.add_heat().await.unwrap().id;

        // Two races with identical wall time plus a later one.
        let tie_a = insert_race(&store, h2, 1, "2026-05-01 09:00:00").await;
        let tie_b = insert_race(&store, h2, 2, "2026-05-01 09:00:00").await;
        let late = insert_race(&store, h1, 1, "2026-05-01 11:00:00").await;

        store.reassign_race_to_heat(late, h2).await.unwrap();

        let a = store.get_saved_race(tie_a).await.unwrap().unwrap();
        let b = store.get_saved_race(tie_b).await.unwrap().unwrap();
        let c = store.get_saved_race(late).await.unwrap().unwrap();
        assert_eq!((a.round_id, b.round_id, c.round_id), (1, 2, 3));
    }

    #[tokio::test]
    async fn save_race_persists_laps_and_invalidates() {
        let store = memory_store().await;
        let heat_id = store.list_heats().await.unwrap()[0].id;
        let pilot = store.add_pilot().await.unwrap();

        let race_id = store
            .save_race(NewSavedRace {
                round_id: 1,
                heat_id,
                class_id: ID_NONE,
                format_id: ID_NONE,
                start_time: 100.0,
                start_time_wall: "2026-05-01 10:00:00".into(),
                pilot_races: vec![NewSavedPilotRace {
                    node_index: 0,
                    pilot_id: pilot.id,
                    enter_at: 90,
                    exit_at: 80,
                    rssi_history: "[]".into(),
                    time_history: "[]".into(),
                    laps: vec![
                        NewSavedLap {
                            lap_number: Some(0),
                            lap_time_stamp: 2_000,
                            lap_time: 2_000,
                            source: 0,
                            deleted: false,
                            invalid: false,
                            late_lap: false,
                        },
                        NewSavedLap {
                            lap_number: Some(1),
                            lap_time_stamp: 14_000,
                            lap_time: 12_000,
                            source: 0,
                            deleted: false,
                            invalid: false,
                            late_lap: false,
                        },
                    ],
                }],
            })
            .await
            .unwrap();

        let pilot_races = store.saved_pilot_races_for_race(race_id).await.unwrap();
        assert_eq!(pilot_races.len(), 1);
        let laps = store
            .active_laps_for_pilot_race(pilot_races[0].id)
            .await
            .unwrap();
        assert_eq!(laps.len(), 2);
        assert_eq!(laps[1].lap_time, 12_000);

        let heat = store.get_heat(heat_id).await.unwrap().unwrap();
        assert_eq!(heat.cache_status, "invalid");
    }

    #[tokio::test]
    async fn latest_saved_levels_picks_most_recent() {
        let store = memory_store().await;
        let heat_id = store.list_heats().await.unwrap()[0].id;
        let pilot = store.add_pilot().await.unwrap();

        for (round, enter_at) in [(1, 88), (2, 92)] {
            store
                .save_race(NewSavedRace {
                    round_id: round,
                    heat_id,
                    class_id: ID_NONE,
                    format_id: ID_NONE,
                    start_time: round as f64 * 100.0,
                    start_time_wall: format!("2026-05-01 10:0{round}:00"),
                    pilot_races: vec![NewSavedPilotRace {
                        node_index: 2,
                        pilot_id: pilot.id,
                        enter_at,
                        exit_at: enter_at - 10,
                        rssi_history: "[]".into(),
                        time_history: "[]".into(),
                        laps: vec![],
                    }],
                })
                .await
                .unwrap();
        }

        let levels = store
            .latest_saved_levels(PilotRaceQuery {
                node_index: 2,
                pilot_id: Some(pilot.id),
                heat_id: Some(heat_id),
                class_id: None,
            })
            .await
            .unwrap();
        assert_eq!(levels, Some((92, 82)));

        let none = store
            .latest_saved_levels(PilotRaceQuery {
                node_index: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(none, None);
    }
}
