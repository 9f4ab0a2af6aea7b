use std::sync::Arc;

use chrono::DateTime;
use gatehawk_contracts::{SecondaryMode, ServerPush, StageReady};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use super::state::{CurrentRace, RaceFormat, RaceMode, RaceStatus, WinStatus};
use super::{RaceInput, WinCheckArgs};
use crate::Services;
use crate::calibration;
use crate::db::store::{
    ID_NONE, NewSavedLap, NewSavedPilotRace, NewSavedRace, StoreResult, options,
};
use crate::events::Event;
use crate::node::NodeIo;
use crate::results;
use crate::results::leaderboard::{self, Leaderboard, RankMethod};

/// Extra settle time between the stage command and the staging clock start.
const STAGE_DELAY_EXTRA_SECS: f64 = 0.5;

/// Forced end-crossings get this long to complete before the race stops.
const STOP_DEFER_SECS: f64 = 0.5;

/// A split gate crossing reported by a split secondary, attached to the
/// pilot's current lap.
#[derive(Debug, Clone)]
pub struct SplitRecord {
    pub node: usize,
    pub lap_number: i64,
    pub split_index: i64,
    pub split_time_stamp: i64,
    pub split_time: i64,
}

/// Owns the current race and its state machine. All mutation happens under
/// the controller mutex, either on command handlers or on the pass FIFO.
pub struct RaceController {
    pub services: Arc<Services>,
    pub race: CurrentRace,
    /// Snapshot taken at save/discard; never a live pointer.
    pub last_race: Option<Box<CurrentRace>>,
    pub secondary_mode: Option<SecondaryMode>,
    pub node_splits: Vec<Vec<SplitRecord>>,
    pub(crate) io: NodeIo,
}

impl RaceController {
    pub async fn new(services: Arc<Services>, io: NodeIo) -> StoreResult<Self> {
        let node_count = services.nodes.node_count();
        let format = load_current_format(&services).await?;
        let profile = load_current_profile(&services).await?;

        let mut controller = Self {
            race: CurrentRace::new(node_count, format, profile),
            last_race: None,
            secondary_mode: None,
            node_splits: vec![Vec::new(); node_count],
            services,
            io,
        };
        controller.apply_profile_to_nodes();
        Ok(controller)
    }

    pub fn enqueue(&self, input: RaceInput) {
        self.io.send(input);
    }

    /// Switch into (or out of) secondary operation. Split secondaries run
    /// the built-in secondary format.
    pub fn set_secondary_mode(&mut self, mode: Option<SecondaryMode>) {
        self.secondary_mode = mode;
        if matches!(mode, Some(SecondaryMode::Split)) {
            self.race.format = RaceFormat::secondary();
        }
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary_mode.is_some() || self.race.format.is_secondary()
    }

    /// Push frequencies and thresholds of the active profile onto the nodes.
    pub fn apply_profile_to_nodes(&mut self) {
        let freqs = self.services.store.profile_frequencies(&self.race.profile);
        let enter_ats: crate::freq::LevelSet = self
            .race
            .profile
            .enter_ats
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        let exit_ats: crate::freq::LevelSet = self
            .race
            .profile
            .exit_ats
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        for node in 0..self.race.node_count() {
            self.services
                .nodes
                .set_frequency(node, freqs.f.get(node).copied().unwrap_or(0));
            if let Some(level) = enter_ats.get(node) {
                self.services.nodes.set_enter_at_level(node, level);
            }
            if let Some(level) = exit_ats.get(node) {
                self.services.nodes.set_exit_at_level(node, level);
            }
        }
    }

    pub async fn set_profile(&mut self, profile_id: i64) -> StoreResult<()> {
        let Some(profile) = self.services.store.get_profile(profile_id).await? else {
            return Err(crate::db::store::StoreError::NotFound {
                kind: "profile",
                id: profile_id,
            });
        };
        self.services
            .store
            .set_option(options::CURRENT_PROFILE, &profile_id.to_string())
            .await?;
        self.race.profile = profile;
        self.apply_profile_to_nodes();
        Ok(())
    }

    pub async fn set_race_format(&mut self, format_id: i64) -> StoreResult<()> {
        if self.race.race_status != RaceStatus::Ready {
            return Err(crate::db::store::StoreError::Validation(
                "Cannot change the race format while a race is in progress".into(),
            ));
        }
        let Some(row) = self.services.store.get_format(format_id).await? else {
            return Err(crate::db::store::StoreError::NotFound {
                kind: "format",
                id: format_id,
            });
        };
        self.services
            .store
            .set_option(options::CURRENT_FORMAT, &format_id.to_string())
            .await?;
        self.race.format = RaceFormat::from_row(&row);
        self.push_race_status();
        Ok(())
    }

    /// Bind a heat (or practice mode) to the current race and refresh the
    /// per-node pilot bindings. Adaptive calibration runs when enabled.
    pub async fn set_current_heat(&mut self, heat_id: i64) -> StoreResult<()> {
        if matches!(
            self.race.race_status,
            RaceStatus::Staging | RaceStatus::Racing
        ) {
            return Err(crate::db::store::StoreError::Validation(
                "Cannot change the heat while a race is in progress".into(),
            ));
        }

        self.race.current_heat = heat_id;
        self.reload_node_bindings().await?;

        if heat_id != ID_NONE
            && self
                .services
                .store
                .get_option_int(options::CALIBRATION_MODE, 0)
                != 0
        {
            calibration::auto_update_calibration(&self.services, &self.race).await;
        }

        self.services.ui.push(ServerPush::RaceDetails {
            race: json!({
                "current_heat": self.race.current_heat,
                "race_status": self.race.race_status.as_u8(),
            }),
        });
        Ok(())
    }

    /// Refresh node-to-pilot bindings from the current heat's slots.
    pub async fn reload_node_bindings(&mut self) -> StoreResult<()> {
        let node_count = self.race.node_count();
        self.race.node_pilots = vec![ID_NONE; node_count];
        self.race.node_callsigns = vec![String::new(); node_count];
        self.race.node_teams = vec![None; node_count];

        if self.race.current_heat != ID_NONE {
            for slot in self.services.store.heat_slots(self.race.current_heat).await? {
                let Some(node) = slot.node_index else { continue };
                let node = node as usize;
                if node >= node_count || slot.pilot_id == ID_NONE {
                    continue;
                }
                self.race.node_pilots[node] = slot.pilot_id;
                if let Some(pilot) = self.services.store.get_pilot(slot.pilot_id).await? {
                    self.race.node_callsigns[node] = pilot.callsign;
                    self.race.node_teams[node] = Some(pilot.team);
                }
            }
        }

        let pilots = self.race.node_pilots.clone();
        self.services.nodes.with_nodes(|nodes| {
            for (node, state) in nodes.iter_mut().enumerate() {
                state.current_pilot_id = pilots.get(node).copied().unwrap_or(ID_NONE);
                state.first_cross_flag = false;
            }
        });
        Ok(())
    }

    /// Begin staging. Returns the token and start time for the arm task, or
    /// None when staging was refused.
    pub async fn stage_race(&mut self) -> StoreResult<Option<(u64, f64)>> {
        if self.race.race_status != RaceStatus::Ready {
            if self.is_secondary() {
                if self.race.race_status == RaceStatus::Racing {
                    return Ok(None);
                }
                info!("Forcing race clear/restart because running as secondary timer");
                self.discard_laps(false).await?;
            } else if self.race.race_status == RaceStatus::Done && !self.race.any_laps_recorded() {
                self.discard_laps(false).await?;
            } else {
                info!("Attempted to stage race while status is not 'ready'");
                self.services
                    .ui
                    .emit_priority_message("Race is already in progress", true);
                return Ok(None);
            }
        }

        // Nodes reset triggers on the next pass.
        self.services.nodes.enable_calibration_mode();

        // A heat class's format overrides the global selection.
        if self.race.current_heat != ID_NONE {
            if let Some(heat) = self.services.store.get_heat(self.race.current_heat).await? {
                if heat.class_id != ID_NONE {
                    if let Some(class) = self.services.store.get_class(heat.class_id).await? {
                        if class.format_id != ID_NONE {
                            if let Some(row) =
                                self.services.store.get_format(class.format_id).await?
                            {
                                info!(format = %row.name, "Forcing race format from class setting");
                                self.race.format = RaceFormat::from_row(&row);
                            }
                        }
                    }
                }
            }
        }

        self.reload_node_bindings().await?;
        self.clear_laps();
        self.last_race = None;
        self.race.timer_running = false;
        self.race.race_status = RaceStatus::Staging;
        self.race.win_status = WinStatus::None;
        self.race.status_message.clear();
        self.race.any_races_started = true;
        self.services.clock.freeze();
        self.services.nodes.set_race_status(RaceStatus::Staging);

        let format = &self.race.format;
        let staging_fixed_ms = if format.staging_fixed_tones <= 1 {
            0
        } else {
            (format.staging_fixed_tones - 1) * 1000
        };
        let staging_random_ms = if format.start_delay_max_ms > 0 {
            rand::random_range(0..=format.start_delay_max_ms)
        } else {
            0
        };
        let hide_stage_timer = format.start_delay_max_ms > 0;
        let staging_total_ms = staging_fixed_ms + format.start_delay_min_ms + staging_random_ms;

        let staging_tones = match format.staging_tones {
            super::state::StagingTones::None => {
                if staging_total_ms > 0 {
                    format.staging_fixed_tones
                } else {
                    staging_fixed_ms / 1000
                }
            }
            super::state::StagingTones::OnePerSecond => {
                let mut tones = staging_total_ms / 1000;
                if staging_random_ms % 1000 != 0 {
                    tones += 1;
                }
                tones
            }
        };

        self.race.stage_time_monotonic = self.services.clock.now() + STAGE_DELAY_EXTRA_SECS;
        self.race.start_time_monotonic =
            self.race.stage_time_monotonic + staging_total_ms as f64 / 1000.0;
        self.race.start_time_epoch_ms = self
            .services
            .clock
            .to_epoch_millis(self.race.start_time_monotonic);
        self.race.start_token = rand::random::<u64>();

        info!(
            format = %self.race.format.name,
            heat = self.race.current_heat,
            staging_total_ms,
            "Staging new race"
        );

        self.services.bus.publish(
            Event::RaceStage,
            json!({
                "hide_stage_timer": hide_stage_timer,
                "staging_at_s": self.race.stage_time_monotonic,
                "starts_at_s": self.race.start_time_monotonic,
                "staging_tones": staging_tones,
            }),
        );
        self.services.ui.push(ServerPush::StageReady(StageReady {
            hide_stage_timer,
            staging_at_s: self.race.stage_time_monotonic,
            starts_at_s: self.race.start_time_monotonic,
            staging_tones: staging_tones as u32,
            race_mode: self.race.format.race_mode as u8,
            race_time_sec: self.race.format.race_time_sec as u32,
        }));
        self.push_race_status();

        Ok(Some((self.race.start_token, self.race.start_time_monotonic)))
    }

    pub(crate) fn is_staging_with_token(&self, token: u64) -> bool {
        self.race.race_status == RaceStatus::Staging && self.race.start_token == token
    }

    /// The race starts now. Returns true when a countdown expiry task is
    /// needed.
    pub fn do_start(&mut self) -> bool {
        let is_secondary = self.is_secondary();
        let bindings: Vec<super::state::NodeBinding> = (0..self.race.node_count())
            .map(|node| self.race.node_binding(node))
            .collect();

        // Clear lingering crossings below the enter threshold, then apply
        // start-threshold lowering to eligible idle nodes.
        let lower_amount = self
            .services
            .store
            .get_option_int(options::START_THRESH_LOWER_AMOUNT, 0);
        let lower_duration = self
            .services
            .store
            .get_option_int(options::START_THRESH_LOWER_DURATION, 0);
        let lower_end_time = self.race.start_time_monotonic + lower_duration as f64;

        let mut force_end: Vec<usize> = Vec::new();
        let mut lowered: Vec<(usize, i64, i64)> = Vec::new();
        self.services.nodes.with_nodes(|nodes| {
            for state in nodes.iter_mut() {
                let eligible = state.frequency > 0
                    && (is_secondary
                        || bindings.get(state.index).is_some_and(|binding| {
                            *binding != super::state::NodeBinding::Unassigned
                        }));
                if !eligible {
                    continue;
                }
                if state.crossing_flag && state.current_rssi < state.enter_at_level {
                    force_end.push(state.index);
                }
                if lower_amount > 0
                    && lower_duration > 0
                    && state.current_rssi < state.enter_at_level
                {
                    let diff =
                        ((state.enter_at_level - state.exit_at_level) * lower_amount + 50) / 100;
                    if diff > 0 {
                        let new_enter = state.enter_at_level - diff;
                        let new_exit = (state.exit_at_level - diff).max(0);
                        state.start_thresh_lower_flag = true;
                        state.start_thresh_lower_time = lower_end_time;
                        lowered.push((state.index, new_enter, new_exit));
                    }
                }
                state.history_values.clear();
                state.history_times.clear();
                state.under_min_lap_count = 0;
            }
        });
        for node in force_end {
            info!(node = node + 1, "Forcing end crossing at race start");
            self.services.nodes.force_end_crossing(node);
        }
        for (node, enter, exit) in lowered {
            info!(
                node = node + 1,
                enter, exit, "Lowering enter/exit thresholds at race start"
            );
            self.services.nodes.transmit_enter_at_level(node, enter);
            self.services.nodes.transmit_exit_at_level(node, exit);
        }

        self.race.race_status = RaceStatus::Racing;
        self.race.timer_running = true;
        self.race.win_status = WinStatus::None;
        self.race.winning_lap_node = None;
        self.services.nodes.set_race_status(RaceStatus::Racing);

        self.services.bus.publish(
            Event::RaceStart,
            json!({ "start_time_epoch_ms": self.race.start_time_epoch_ms }),
        );
        self.push_race_status();
        info!(
            start_monotonic = self.race.start_time_monotonic,
            start_epoch_ms = self.race.start_time_epoch_ms,
            "Race started"
        );

        self.race.format.race_mode == RaceMode::CountDown
    }

    /// Stop the race. Returns true when the stop was deferred to let forced
    /// end-crossings complete.
    pub async fn stop_race(&mut self, do_save: bool) -> StoreResult<bool> {
        if self.race.race_status == RaceStatus::Racing {
            let bindings: Vec<super::state::NodeBinding> = (0..self.race.node_count())
                .map(|node| self.race.node_binding(node))
                .collect();
            let crossing: Vec<usize> = self.services.nodes.with_nodes(|nodes| {
                nodes
                    .iter()
                    .filter(|state| {
                        state.crossing_flag
                            && state.frequency > 0
                            && bindings.get(state.index).is_some_and(|binding| {
                                *binding != super::state::NodeBinding::Unassigned
                            })
                    })
                    .map(|state| state.index)
                    .collect()
            });
            if !crossing.is_empty() {
                for node in crossing {
                    info!(node = node + 1, "Forcing end crossing at race stop");
                    self.services.nodes.force_end_crossing(node);
                }
                self.services.ui.push(ServerPush::StopTimer);
                return Ok(true);
            }
        }
        self.do_stop_actions(do_save).await?;
        self.services.ui.push(ServerPush::StopTimer);
        Ok(false)
    }

    pub async fn do_stop_actions(&mut self, do_save: bool) -> StoreResult<()> {
        let mut delta_time = 0.0;
        match self.race.race_status {
            RaceStatus::Racing => {
                self.race.end_time = self.services.clock.now();
                delta_time = self.race.end_time - self.race.start_time_monotonic;
                info!(
                    end_monotonic = self.race.end_time,
                    duration_secs = delta_time as i64,
                    "Race stopped"
                );

                let under_min: Vec<(usize, i64)> = self.services.nodes.with_nodes(|nodes| {
                    nodes
                        .iter()
                        .filter(|state| state.under_min_lap_count > 0)
                        .map(|state| (state.index, state.under_min_lap_count))
                        .collect()
                });
                if !under_min.is_empty() {
                    info!(?under_min, "Nodes with laps under minimum");
                }

                self.race.race_status = RaceStatus::Done;
                self.services.nodes.set_race_status(RaceStatus::Done);
                self.services.bus.publish(Event::RaceStop, json!({}));
                self.enqueue(RaceInput::CheckWin(WinCheckArgs::default()));
            }
            RaceStatus::Staging => {
                info!("Stopping race during staging");
                self.race.race_status = RaceStatus::Ready;
                self.services.nodes.set_race_status(RaceStatus::Ready);
                self.services.bus.publish(Event::LapsClear, json!({}));
            }
            _ => {
                debug!("No active race to stop");
                self.race.race_status = RaceStatus::Done;
                self.services.nodes.set_race_status(RaceStatus::Done);
            }
        }

        // Nodes may still hold temporarily lowered thresholds.
        let lower_amount = self
            .services
            .store
            .get_option_int(options::START_THRESH_LOWER_AMOUNT, 0);
        let lower_duration = self
            .services
            .store
            .get_option_int(options::START_THRESH_LOWER_DURATION, 0);
        if lower_amount > 0 && delta_time < lower_duration as f64 {
            let end_time = self.race.end_time;
            self.services.nodes.with_nodes(|nodes| {
                for state in nodes.iter_mut() {
                    if state.start_thresh_lower_flag {
                        state.start_thresh_lower_time = end_time + 0.1;
                    }
                }
            });
        }

        self.race.timer_running = false;
        self.race.scheduled = false;
        self.push_race_status();
        self.push_leaderboard().await;

        if do_save {
            self.save_laps().await?;
        }
        Ok(())
    }

    /// Persist the current race: SavedRace + one SavedPilotRace per bound
    /// node + all laps and splits, then clear and advance the heat.
    pub async fn save_laps(&mut self) -> StoreResult<()> {
        if self.race.current_heat == ID_NONE {
            // Practice laps are not savable.
            self.discard_laps(true).await?;
            return Ok(());
        }

        let heat_id = self.race.current_heat;
        let Some(heat) = self.services.store.get_heat(heat_id).await? else {
            warn!(heat_id, "Cannot save race: heat is missing");
            return self.discard_laps(true).await;
        };

        let max_round = self.services.store.get_max_round(heat_id).await?;
        let round_id = max_round + 1;
        let freqs = self.services.store.profile_frequencies(&self.race.profile);
        let node_states = self.services.nodes.snapshot();

        let mut pilot_races: Vec<NewSavedPilotRace> = Vec::new();
        for node in 0..self.race.node_count() {
            if freqs.f.get(node).copied().unwrap_or(0) == 0 {
                continue;
            }
            let pilot_id = self.race.node_pilots[node];
            if pilot_id == ID_NONE {
                continue;
            }
            let state = &node_states[node];
            let laps = self.race.node_laps[node]
                .iter()
                .map(|lap| NewSavedLap {
                    lap_number: lap.lap_number,
                    lap_time_stamp: lap.lap_time_stamp,
                    lap_time: lap.lap_time,
                    source: lap.source as i64,
                    deleted: lap.deleted,
                    invalid: lap.invalid,
                    late_lap: lap.late_lap,
                })
                .collect();

            pilot_races.push(NewSavedPilotRace {
                node_index: node as i64,
                pilot_id,
                enter_at: state.enter_at_level,
                exit_at: state.exit_at_level,
                rssi_history: serde_json::to_string(&state.history_values)?,
                time_history: serde_json::to_string(&state.history_times)?,
                laps,
            });

            let band = freqs.b.get(node).cloned().flatten();
            self.services
                .store
                .set_pilot_used_frequency(
                    pilot_id,
                    band.as_deref(),
                    freqs.c.get(node).copied().flatten(),
                    freqs.f[node],
                )
                .await?;
        }

        let start_time_wall = DateTime::from_timestamp_millis(self.race.start_time_epoch_ms as i64)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();

        let race_id = self
            .services
            .store
            .save_race(NewSavedRace {
                round_id,
                heat_id,
                class_id: heat.class_id,
                format_id: self.race.format.id,
                start_time: self.race.start_time_monotonic,
                start_time_wall,
                pilot_races,
            })
            .await?;

        self.services
            .bus
            .publish(Event::LapsSave, json!({ "race_id": race_id }));
        info!(heat_id, round_id, race_id, "Current laps saved");

        self.discard_laps(true).await?;

        let next_heat = self.services.store.next_heat_id(heat_id).await?;
        if next_heat != heat_id {
            self.set_current_heat(next_heat).await?;
        }

        spawn_results_rebuild(self.services.clone(), race_id, heat_id, heat.class_id);
        Ok(())
    }

    /// Clear the current laps without saving.
    pub async fn discard_laps(&mut self, saved: bool) -> StoreResult<()> {
        if matches!(
            self.race.race_status,
            RaceStatus::Staging | RaceStatus::Racing
        ) {
            Box::pin(self.do_stop_actions(false)).await?;
        }

        self.clear_laps();
        self.race.race_status = RaceStatus::Ready;
        self.services.nodes.set_race_status(RaceStatus::Ready);
        self.race.win_status = WinStatus::None;
        self.race.status_message.clear();

        self.push_current_laps();
        self.push_leaderboard().await;
        self.push_race_status();

        if !saved {
            self.services.bus.publish(Event::LapsDiscard, json!({}));
        }
        self.services.bus.publish(Event::LapsClear, json!({}));
        Ok(())
    }

    /// Snapshot the concluded race, then empty the lap store.
    fn clear_laps(&mut self) {
        self.last_race = Some(Box::new(self.race.clone()));
        self.race.winning_lap_node = None;
        for laps in &mut self.race.node_laps {
            laps.clear();
        }
        for splits in &mut self.node_splits {
            splits.clear();
        }
        for finished in &mut self.race.node_finished {
            *finished = false;
        }
        self.race.clear_results();
        info!("Current laps cleared");
    }

    pub fn schedule_race(&mut self, total_secs: u64) {
        self.race.scheduled_time = self.services.clock.now() + total_secs as f64;
        self.race.scheduled = true;
        self.services.bus.publish(
            Event::RaceSchedule,
            json!({ "scheduled_at": self.race.scheduled_time }),
        );
        self.services.ui.push(ServerPush::RaceScheduled {
            scheduled: true,
            scheduled_at: self.race.scheduled_time,
        });
    }

    pub fn cancel_schedule(&mut self) {
        self.race.scheduled = false;
        self.services.bus.publish(Event::RaceScheduleCancel, json!({}));
        self.services.ui.push(ServerPush::RaceScheduled {
            scheduled: false,
            scheduled_at: self.race.scheduled_time,
        });
        self.services
            .ui
            .emit_priority_message("Scheduled race cancelled", false);
    }

    /// Delete a false lap: renumber, retime, and re-derive finished flags,
    /// then re-check the win status.
    pub async fn delete_lap(&mut self, node: usize, lap_index: usize) -> StoreResult<()> {
        let Some(lap) = self
            .race
            .node_laps
            .get(node)
            .and_then(|laps| laps.get(lap_index))
        else {
            return Err(crate::db::store::StoreError::Validation(format!(
                "No lap {lap_index} on node {node}"
            )));
        };
        let deleted_stamp = lap.lap_time_stamp;

        self.race.node_laps[node][lap_index].invalid = true;
        self.race.node_finished[node] = false;
        self.renumber_node_laps(node);

        // Retime the lap following the removed one against its new
        // predecessor (late laps still anchor timing).
        let mut last_stamp: Option<i64> = None;
        let mut next_index: Option<usize> = None;
        for (idx, lap) in self.race.node_laps[node].iter().enumerate() {
            if lap.invalid || (lap.deleted && !lap.late_lap) {
                continue;
            }
            if lap.lap_time_stamp < deleted_stamp {
                last_stamp = Some(lap.lap_time_stamp);
            } else if lap.lap_time_stamp > deleted_stamp {
                next_index = Some(idx);
                break;
            }
        }
        if let Some(idx) = next_index {
            let stamp = self.race.node_laps[node][idx].lap_time_stamp;
            self.race.node_laps[node][idx].lap_time = stamp - last_stamp.unwrap_or(0);
        }

        let deleted_lap_number = self.race.node_laps[node][lap_index].lap_number;
        if let Some(number) = deleted_lap_number {
            self.node_splits[node].retain(|split| split.lap_number != number);
        }

        self.services
            .bus
            .publish(Event::LapDelete, json!({ "node_index": node }));
        info!(node = node + 1, lap_index, "Lap deleted");

        self.race.clear_results();
        self.enqueue(RaceInput::CheckWin(WinCheckArgs {
            deleted_lap: true,
            ..Default::default()
        }));
        self.push_current_laps();
        self.push_leaderboard().await;
        Ok(())
    }

    /// Restore a deleted (or late) lap and renumber everything after it.
    pub async fn restore_deleted_lap(&mut self, node: usize, lap_index: usize) -> StoreResult<()> {
        let Some(lap) = self
            .race
            .node_laps
            .get_mut(node)
            .and_then(|laps| laps.get_mut(lap_index))
        else {
            return Err(crate::db::store::StoreError::Validation(format!(
                "No lap {lap_index} on node {node}"
            )));
        };
        lap.deleted = false;
        lap.late_lap = false;
        lap.invalid = false;

        let mut lap_number: i64 = 0;
        let mut last_stamp: i64 = 0;
        for (idx, lap) in self.race.node_laps[node].iter_mut().enumerate() {
            if !lap.deleted && !lap.invalid {
                if idx >= lap_index {
                    lap.lap_number = Some(lap_number);
                    lap.lap_time = lap.lap_time_stamp - last_stamp;
                }
                last_stamp = lap.lap_time_stamp;
                lap_number += 1;
            }
        }

        self.services
            .bus
            .publish(Event::LapRestoreDeleted, json!({ "node_index": node }));
        info!(node = node + 1, lap_index, "Restored deleted lap");

        self.race.clear_results();
        self.enqueue(RaceInput::CheckWin(WinCheckArgs {
            deleted_lap: true,
            ..Default::default()
        }));
        self.push_current_laps();
        self.push_leaderboard().await;
        Ok(())
    }

    /// Renumber a node's laps and re-derive its finished flag, marking laps
    /// beyond the finish as late.
    pub(crate) fn renumber_node_laps(&mut self, node: usize) {
        let format = self.race.format.clone();
        let mut lap_number: i64 = 0;
        let mut finished = self.race.node_finished[node];
        for lap in &mut self.race.node_laps[node] {
            lap.deleted = false;
            if finished {
                lap.late_lap = true;
                lap.deleted = true;
            } else {
                lap.late_lap = false;
            }
            if lap.invalid {
                lap.lap_number = None;
                lap.deleted = true;
            } else {
                lap.lap_number = Some(lap_number);
                let past_time = format.race_mode == RaceMode::CountDown
                    && lap.lap_time_stamp > format.race_time_sec * 1000;
                let past_laps = format.win_condition
                    == super::state::WinCondition::FirstToLapX
                    && lap_number >= format.number_laps_win;
                if past_time || past_laps {
                    finished = true;
                }
                lap_number += 1;
            }
        }
        self.race.node_finished[node] = finished;
    }

    /// Attach a split reported by a split secondary to the pilot's
    /// in-progress lap.
    pub fn record_split(&mut self, node: usize, split_time_stamp: i64) {
        if node >= self.race.node_count() || self.race.race_status != RaceStatus::Racing {
            return;
        }
        let lap_number = self.race.active_laps(node, false).len() as i64;
        let splits = &mut self.node_splits[node];
        let split_index = splits
            .iter()
            .filter(|split| split.lap_number == lap_number)
            .count() as i64;
        let previous = splits
            .iter()
            .filter(|split| split.lap_number == lap_number)
            .map(|split| split.split_time_stamp)
            .max()
            .unwrap_or(0);
        splits.push(SplitRecord {
            node,
            lap_number,
            split_index,
            split_time_stamp,
            split_time: split_time_stamp - previous,
        });
    }

    /// Leaderboard of the current race, computed on demand and cached until
    /// the next mutation.
    pub async fn current_results(&mut self) -> Arc<Leaderboard> {
        if let Some(results) = &self.race.results {
            return results.clone();
        }
        let ranking = match self.race.format.win_condition {
            super::state::WinCondition::FastestLap => RankMethod::FastestLap,
            super::state::WinCondition::FastestConsecutive => RankMethod::FastestConsecutive,
            _ => RankMethod::RaceProgress,
        };
        let board = Arc::new(leaderboard::compute(self.race.pilot_laps(), ranking));
        self.race.results = Some(board.clone());
        board
    }

    pub fn push_race_status(&self) {
        self.services.ui.push(ServerPush::RaceStatus {
            race_status: self.race.race_status.as_u8(),
            race_mode: self.race.format.race_mode as u8,
            race_time_sec: self.race.format.race_time_sec as u32,
        });
    }

    pub fn push_current_laps(&self) {
        if let Ok(laps) = serde_json::to_value(&self.race.node_laps) {
            self.services.ui.push(ServerPush::CurrentLaps { laps });
        }
    }

    pub async fn push_leaderboard(&mut self) {
        let board = self.current_results().await;
        if let Ok(leaderboard) = serde_json::to_value(board.as_ref()) {
            self.services.ui.push(ServerPush::Leaderboard { leaderboard });
        }
    }
}

async fn load_current_format(services: &Arc<Services>) -> StoreResult<RaceFormat> {
    let format_id = services.store.get_option_int(options::CURRENT_FORMAT, 0);
    if format_id != 0 {
        if let Some(row) = services.store.get_format(format_id).await? {
            return Ok(RaceFormat::from_row(&row));
        }
    }
    let formats = services.store.list_formats().await?;
    Ok(formats
        .first()
        .map(RaceFormat::from_row)
        .unwrap_or_else(RaceFormat::secondary))
}

async fn load_current_profile(
    services: &Arc<Services>,
) -> StoreResult<crate::db::models::ProfileRow> {
    let profile_id = services.store.get_option_int(options::CURRENT_PROFILE, 0);
    if profile_id != 0 {
        if let Some(row) = services.store.get_profile(profile_id).await? {
            return Ok(row);
        }
    }
    let mut profiles = services.store.list_profiles().await?;
    Ok(profiles.remove(0))
}

/// Stage the race and arm the start timer.
pub async fn stage_and_arm(race: &Arc<Mutex<RaceController>>) -> StoreResult<bool> {
    let staged = {
        let mut controller = race.lock().await;
        controller.stage_race().await?
    };
    match staged {
        Some((token, start_time)) => {
            spawn_arm_task(race.clone(), token, start_time);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Background start timer: cooperative sleep until T−0.5 s, busy-wait to T,
/// then transition to racing. A stale token exits silently.
pub fn spawn_arm_task(race: Arc<Mutex<RaceController>>, token: u64, start_time: f64) {
    tokio::spawn(async move {
        let clock = {
            let controller = race.lock().await;
            controller.services.clock.clone()
        };

        while clock.now() < start_time - 0.5 {
            sleep(Duration::from_millis(100)).await;
            let controller = race.lock().await;
            if !controller.is_staging_with_token(token) {
                debug!(token, "Arm task is unused");
                return;
            }
        }

        // Busy-wait the final stretch for sub-10 ms start jitter.
        while clock.now() < start_time {
            std::hint::spin_loop();
        }

        let mut controller = race.lock().await;
        if !controller.is_staging_with_token(token) {
            debug!(token, "Arm task is unused");
            return;
        }
        let countdown = controller.do_start();
        drop(controller);
        if countdown {
            spawn_expire_task(race.clone(), token);
        }
    });
}

/// Countdown expiry: publish the finish, run the win check behind the pass
/// queue, then stop after the grace window.
pub fn spawn_expire_task(race: Arc<Mutex<RaceController>>, token: u64) {
    tokio::spawn(async move {
        let (clock, race_time_sec, grace_sec, start_time) = {
            let controller = race.lock().await;
            (
                controller.services.clock.clone(),
                controller.race.format.race_time_sec,
                controller.race.format.lap_grace_sec,
                controller.race.start_time_monotonic,
            )
        };

        sleep(Duration::from_secs_f64(race_time_sec as f64)).await;
        {
            let mut controller = race.lock().await;
            if controller.race.race_status != RaceStatus::Racing
                || controller.race.start_token != token
            {
                debug!(token, "Race-time-expire task is unused");
                return;
            }
            info!("Race count-down timer reached expiration");
            controller.race.timer_running = false;
            controller.services.bus.publish(Event::RaceFinish, json!({}));
            // Behind any queued passes: late laps cannot race the winner.
            controller.enqueue(RaceInput::CheckWin(WinCheckArgs {
                at_finish: true,
                emit_leaderboard_on_win: true,
                start_token: Some(token),
                ..Default::default()
            }));
        }

        if grace_sec > -1 {
            let stop_at = start_time + race_time_sec as f64 + grace_sec as f64;
            let remaining = stop_at - clock.now();
            if remaining > 0.0 {
                sleep(Duration::from_secs_f64(remaining)).await;
            }
            let mut controller = race.lock().await;
            if controller.race.race_status == RaceStatus::Racing
                && controller.race.start_token == token
            {
                debug!("Race grace period reached");
                let deferred = controller.stop_race(false).await.unwrap_or(false);
                drop(controller);
                if deferred {
                    spawn_deferred_stop(race.clone(), false);
                }
            } else {
                debug!(token, "Grace period timer is unused");
            }
        }
    });
}

/// Give forced end-crossings a moment to complete, then finish the stop.
pub fn spawn_deferred_stop(race: Arc<Mutex<RaceController>>, do_save: bool) {
    tokio::spawn(async move {
        sleep(Duration::from_secs_f64(STOP_DEFER_SECS)).await;
        let mut controller = race.lock().await;
        if let Err(error) = controller.do_stop_actions(do_save).await {
            warn!(error = %error, "Deferred race stop failed");
        }
    });
}

/// Rebuild the leaderboard cache hierarchy after a save, off the save path.
pub fn spawn_results_rebuild(services: Arc<Services>, race_id: i64, heat_id: i64, class_id: i64) {
    tokio::spawn(async move {
        services.store.set_page_cache_valid(false);
        if let Err(error) = results::race_results(&services.store, race_id).await {
            warn!(race_id, error = %error, "Race results rebuild failed");
        }
        if let Err(error) = results::heat_results(&services.store, heat_id).await {
            warn!(heat_id, error = %error, "Heat results rebuild failed");
        }
        if class_id != ID_NONE {
            if let Err(error) = results::class_results(&services.store, class_id).await {
                warn!(class_id, error = %error, "Class results rebuild failed");
            }
        }
        match results::event_results(&services.store).await {
            Ok(board) => {
                services.store.set_page_cache_valid(true);
                if let Ok(leaderboard) = serde_json::to_value(board.as_ref()) {
                    services.ui.push(ServerPush::Leaderboard { leaderboard });
                }
            }
            Err(error) => warn!(error = %error, "Event results rebuild failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::HeatPatch;
    use crate::events::Event;
    use crate::race::state::LapSource;
    use crate::race::test_support::{build_controller, racing_controller};
    use proptest::prelude::*;

    #[tokio::test]
    async fn stage_transitions_and_issues_fresh_token() {
        let (race, _rx) = build_controller().await;
        let mut controller = race.lock().await;

        let (token, start_time) = controller.stage_race().await.unwrap().unwrap();
        assert_eq!(controller.race.race_status, RaceStatus::Staging);
        assert!(controller.is_staging_with_token(token));
        assert!(start_time > controller.race.stage_time_monotonic);
        assert!(controller.race.any_races_started);
        assert!(controller.services.clock.is_frozen());

        // Staging again is refused while not ready.
        assert!(controller.stage_race().await.unwrap().is_none());

        // Discarding invalidates the token.
        controller.discard_laps(false).await.unwrap();
        assert_eq!(controller.race.race_status, RaceStatus::Ready);
        assert!(!controller.is_staging_with_token(token));
    }

    #[tokio::test]
    async fn start_delay_stays_within_configured_window() {
        let (race, _rx) = build_controller().await;
        let mut controller = race.lock().await;
        controller.race.format.staging_fixed_tones = 3;
        controller.race.format.start_delay_min_ms = 1_000;
        controller.race.format.start_delay_max_ms = 2_000;

        for _ in 0..10 {
            let (_, start_time) = controller.stage_race().await.unwrap().unwrap();
            let staging_ms = ((start_time - controller.race.stage_time_monotonic) * 1000.0).round();
            // fixed (2 tones × 1s) + min + random(0..=max)
            assert!((3_000.0..=5_000.0).contains(&staging_ms), "got {staging_ms}");
            controller.discard_laps(false).await.unwrap();
        }
    }

    #[tokio::test]
    async fn do_start_applies_threshold_lowering() {
        let (race, _rx) = build_controller().await;
        let mut controller = race.lock().await;
        controller
            .services
            .store
            .set_option(options::START_THRESH_LOWER_AMOUNT, "25")
            .await
            .unwrap();
        controller
            .services
            .store
            .set_option(options::START_THRESH_LOWER_DURATION, "2")
            .await
            .unwrap();
        controller.race.current_heat = ID_NONE;
        controller.services.nodes.with_nodes(|nodes| {
            nodes[0].enter_at_level = 90;
            nodes[0].exit_at_level = 80;
            nodes[0].current_rssi = 40;
        });

        controller.stage_race().await.unwrap().unwrap();
        let countdown = controller.do_start();
        assert!(countdown);
        assert_eq!(controller.race.race_status, RaceStatus::Racing);

        let state = controller.services.nodes.snapshot().remove(0);
        assert!(state.start_thresh_lower_flag);
        // 25% of the 10-point window, rounded: levels restore after 2 s.
        assert!(
            (state.start_thresh_lower_time - controller.race.start_time_monotonic - 2.0).abs()
                < 1e-6
        );
        // Persisted levels are untouched; only the transmitted values drop.
        assert_eq!(state.enter_at_level, 90);
        assert_eq!(state.exit_at_level, 80);
    }

    #[tokio::test]
    async fn save_assigns_next_round_and_clears_laps() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;

        let store = controller.services.store.clone();
        let heat_id = store.list_heats().await.unwrap()[0].id;
        let pilot = store.add_pilot().await.unwrap();
        store
            .alter_heat(HeatPatch {
                heat: heat_id,
                pilot: Some(pilot.id),
                node: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        controller.race.current_heat = heat_id;
        controller.reload_node_bindings().await.unwrap();
        controller.race.race_status = RaceStatus::Racing;

        controller.process_pass(0, 102.0, LapSource::Rf).await;
        controller.process_pass(0, 115.0, LapSource::Rf).await;
        controller.do_stop_actions(false).await.unwrap();
        controller.save_laps().await.unwrap();

        let races = store
            .list_saved_races(crate::db::store::RaceQuery::new().heat(heat_id))
            .await
            .unwrap();
        assert_eq!(races.len(), 1);
        assert_eq!(races[0].round_id, 1);

        let pilot_races = store.saved_pilot_races_for_race(races[0].id).await.unwrap();
        assert_eq!(pilot_races.len(), 1);
        assert_eq!(pilot_races[0].pilot_id, pilot.id);
        let laps = store
            .active_laps_for_pilot_race(pilot_races[0].id)
            .await
            .unwrap();
        assert_eq!(laps.len(), 2);

        // The current race is cleared and ready for the next round.
        assert!(controller.race.node_laps.iter().all(|laps| laps.is_empty()));
        assert_eq!(controller.race.race_status, RaceStatus::Ready);

        // Used frequencies were recorded for the pilot.
        let pilot = store.get_pilot(pilot.id).await.unwrap().unwrap();
        assert!(pilot.used_frequencies.is_some());
    }

    #[tokio::test]
    async fn practice_laps_are_never_saved() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;
        controller.race.current_heat = ID_NONE;
        controller.process_pass(0, 102.0, LapSource::Rf).await;
        controller.do_stop_actions(false).await.unwrap();
        controller.save_laps().await.unwrap();

        let store = &controller.services.store;
        assert_eq!(store.count_saved_races().await.unwrap(), 0);
        assert!(controller.race.node_laps[0].is_empty());
    }

    #[tokio::test]
    async fn scheduled_race_stages_once_and_cancel_suppresses() {
        let (race, _rx) = build_controller().await;
        let mut stage_events = {
            let mut controller = race.lock().await;
            // Zero staging delays keep the arm task short.
            controller.race.format.staging_fixed_tones = 0;
            controller.race.format.start_delay_min_ms = 0;
            controller.race.format.start_delay_max_ms = 0;
            controller.services.bus.listen()
        };
        spawn_heartbeat(race.clone());

        // Schedule then cancel before it fires: no stage.
        {
            let mut controller = race.lock().await;
            controller.schedule_race(2);
            controller.cancel_schedule();
        }
        tokio::time::sleep(Duration::from_millis(2_600)).await;
        let mut staged = 0;
        while let Ok(message) = stage_events.try_recv() {
            if message.event == Event::RaceStage {
                staged += 1;
            }
        }
        assert_eq!(staged, 0);

        // Re-schedule one second out: exactly one stage.
        {
            let mut controller = race.lock().await;
            controller.schedule_race(1);
        }
        tokio::time::sleep(Duration::from_millis(2_600)).await;
        let mut staged = 0;
        while let Ok(message) = stage_events.try_recv() {
            if message.event == Event::RaceStage {
                staged += 1;
            }
        }
        assert_eq!(staged, 1);
    }

    // After any sequence of reassignments, every heat's rounds stay 1..n in
    // wall-clock order.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]
        #[test]
        fn round_id_law_holds_under_reassignment(
            moves in proptest::collection::vec((0usize..6, 0usize..3), 0..12)
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                let (race, _rx) = build_controller().await;
                let controller = race.lock().await;
                let store = controller.services.store.clone();
                drop(controller);

                let mut heats = vec![store.list_heats().await.unwrap()[0].id];
                heats.push(store.add_heat().await.unwrap().id);
                heats.push(store.add_heat().await.unwrap().id);

                let mut races = Vec::new();
                for i in 0..6i64 {
                    let heat_id = heats[(i % 3) as usize];
                    let round = store.get_max_round(heat_id).await.unwrap() + 1;
                    let race_id: i64 = sqlx::query_scalar(
                        "INSERT INTO saved_races (round_id, heat_id, start_time, start_time_wall) \
                         VALUES (?, ?, ?, ?) RETURNING id",
                    )
                    .bind(round)
                    .bind(heat_id)
                    .bind(i as f64)
                    .bind(format!("2026-07-01 10:{i:02}:00"))
                    .fetch_one(&store.pool)
                    .await
                    .unwrap();
                    races.push(race_id);
                }

                for (race_index, heat_index) in moves {
                    store
                        .reassign_race_to_heat(races[race_index], heats[heat_index])
                        .await
                        .unwrap();
                }

                for &heat_id in &heats {
                    let rows = store
                        .list_saved_races(
                            crate::db::store::RaceQuery::new()
                                .heat(heat_id)
                                .order(crate::db::store::RaceOrder::ByStartTimeWall),
                        )
                        .await
                        .unwrap();
                    for (index, row) in rows.iter().enumerate() {
                        assert_eq!(
                            row.round_id,
                            index as i64 + 1,
                            "heat {heat_id} rounds not contiguous"
                        );
                    }
                }
            });
        }
    }

    // After any sequence of deletions and restorations, lap times equal the
    // gap to the previous active lap.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]
        #[test]
        fn lap_time_law_holds_under_delete_restore(
            ops in proptest::collection::vec((proptest::bool::ANY, 0usize..6), 0..10)
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                let (race, _rx) = racing_controller().await;
                let mut controller = race.lock().await;
                controller.race.format.race_mode = RaceMode::NoTimeLimit;

                for i in 0..6u64 {
                    let ts = 100.0 + 15.0 * (i as f64 + 1.0);
                    controller.process_pass(0, ts, LapSource::Rf).await;
                }

                for (restore, index) in ops {
                    if restore {
                        let _ = controller.restore_deleted_lap(0, index).await;
                    } else {
                        let _ = controller.delete_lap(0, index).await;
                    }
                }

                let mut previous: Option<i64> = None;
                for lap in &controller.race.node_laps[0] {
                    if lap.deleted || lap.invalid {
                        continue;
                    }
                    let expected = lap.lap_time_stamp - previous.unwrap_or(0);
                    assert_eq!(lap.lap_time, expected, "lap time law violated");
                    previous = Some(lap.lap_time_stamp);
                }
            });
        }
    }
}

/// Heartbeat tick: node data push, scheduled-race trigger, and restoration
/// of temporarily lowered thresholds.
pub fn spawn_heartbeat(race: Arc<Mutex<RaceController>>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;

            let (services, scheduled_due) = {
                let controller = race.lock().await;
                let now = controller.services.clock.now();
                let due = controller.race.scheduled && now > controller.race.scheduled_time;
                (controller.services.clone(), due)
            };

            let nodes = services.nodes.snapshot();
            services.ui.push(ServerPush::Heartbeat {
                nodes: nodes
                    .iter()
                    .map(|state| gatehawk_contracts::HeartbeatNode {
                        frequency: state.frequency,
                        current_rssi: state.current_rssi as i32,
                        crossing_flag: state.crossing_flag,
                    })
                    .collect(),
            });

            // Restore persisted thresholds after the lowering window.
            let now = services.clock.now();
            let restore: Vec<(usize, i64, i64)> = services.nodes.with_nodes(|nodes| {
                nodes
                    .iter_mut()
                    .filter(|state| {
                        state.start_thresh_lower_flag && now >= state.start_thresh_lower_time
                    })
                    .map(|state| {
                        state.start_thresh_lower_flag = false;
                        (state.index, state.enter_at_level, state.exit_at_level)
                    })
                    .collect()
            });
            for (node, enter, exit) in restore {
                info!(node = node + 1, enter, exit, "Restoring enter/exit thresholds");
                services.nodes.transmit_enter_at_level(node, enter);
                services.nodes.transmit_exit_at_level(node, exit);
            }

            if scheduled_due {
                {
                    let mut controller = race.lock().await;
                    controller.race.scheduled = false;
                }
                if let Err(error) = stage_and_arm(&race).await {
                    warn!(error = %error, "Scheduled race stage failed");
                }
            }
        }
    });
}
