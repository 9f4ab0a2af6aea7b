pub mod cache;
pub mod leaderboard;

use std::sync::Arc;

use crate::db::models::{SavedLapRow, SavedPilotRaceRow};
use crate::db::store::{CacheStatus, RaceOrder, RaceQuery, Store, StoreResult, options};
use cache::CacheKey;
use leaderboard::{Leaderboard, PilotLaps, RankMethod};

/// Leaderboard for one saved race, built on demand and cached.
pub async fn race_results(store: &Store, race_id: i64) -> StoreResult<Arc<Leaderboard>> {
    let built = store
        .results
        .get_or_build(CacheKey::Race(race_id), || build_race(store, race_id))
        .await?;
    store.mark_race_cache(race_id, CacheStatus::Valid).await?;
    Ok(built)
}

/// Aggregate leaderboard across every round of a heat.
pub async fn heat_results(store: &Store, heat_id: i64) -> StoreResult<Arc<Leaderboard>> {
    let built = store
        .results
        .get_or_build(CacheKey::Heat(heat_id), || build_for_query(
            store,
            RaceQuery::new().heat(heat_id),
        ))
        .await?;
    store.mark_heat_cache(heat_id, CacheStatus::Valid).await?;
    Ok(built)
}

/// Aggregate leaderboard across every race of a class.
pub async fn class_results(store: &Store, class_id: i64) -> StoreResult<Arc<Leaderboard>> {
    let built = store
        .results
        .get_or_build(CacheKey::Class(class_id), || build_for_query(
            store,
            RaceQuery::new().class(class_id),
        ))
        .await?;
    store.mark_class_cache(class_id, CacheStatus::Valid).await?;
    Ok(built)
}

/// Event-wide aggregate leaderboard.
pub async fn event_results(store: &Store) -> StoreResult<Arc<Leaderboard>> {
    let built = store
        .results
        .get_or_build(CacheKey::Event, || build_for_query(store, RaceQuery::new()))
        .await?;
    store
        .set_option(options::EVENT_RESULTS_CACHE_STATUS, CacheStatus::Valid.as_str())
        .await?;
    Ok(built)
}

async fn build_race(store: &Store, race_id: i64) -> StoreResult<Leaderboard> {
    let ranking = store.race_rank_method(race_id).await?;
    let inputs = load_race_pilot_laps(store, race_id).await?;
    Ok(leaderboard::compute(inputs, ranking))
}

async fn build_for_query(store: &Store, query: RaceQuery) -> StoreResult<Leaderboard> {
    let races = store
        .list_saved_races(query.order(RaceOrder::ByStartTimeWall))
        .await?;

    let mut merged: Vec<PilotLaps> = Vec::new();
    for race in &races {
        for input in load_race_pilot_laps(store, race.id).await? {
            match merged.iter_mut().find(|m| m.pilot_id == input.pilot_id) {
                Some(existing) => existing.laps.extend(input.laps),
                None => merged.push(input),
            }
        }
    }

    Ok(leaderboard::compute(merged, RankMethod::RaceProgress))
}

async fn load_race_pilot_laps(store: &Store, race_id: i64) -> StoreResult<Vec<PilotLaps>> {
    let pilot_races: Vec<SavedPilotRaceRow> = store.saved_pilot_races_for_race(race_id).await?;
    let mut inputs = Vec::with_capacity(pilot_races.len());

    for pilot_race in pilot_races {
        let pilot = store.get_pilot(pilot_race.pilot_id).await.ok().flatten();
        let laps: Vec<SavedLapRow> = store.active_laps_for_pilot_race(pilot_race.id).await?;
        inputs.push(PilotLaps {
            pilot_id: pilot_race.pilot_id,
            callsign: pilot
                .as_ref()
                .map(|p| p.callsign.clone())
                .unwrap_or_default(),
            team: pilot.map(|p| p.team).unwrap_or_default(),
            node_index: pilot_race.node_index as usize,
            laps: laps
                .into_iter()
                .map(|lap| leaderboard::LapTime {
                    lap_time_stamp: lap.lap_time_stamp,
                    lap_time: lap.lap_time,
                })
                .collect(),
        });
    }

    Ok(inputs)
}
