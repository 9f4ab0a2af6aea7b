use gatehawk_contracts::ServerPush;
use serde_json::json;
use tracing::{debug, info};

use super::controller::RaceController;
use super::state::{Lap, LapSource, NodeBinding, RaceMode, RaceStatus, WinCondition, WinStatus};
use super::win::{self, WinDecision};
use super::{RaceInput, WinCheckArgs};
use crate::db::store::options;
use crate::events::Event;

impl RaceController {
    /// Handle one pass record from the nodes. Malformed or out-of-window
    /// passes are dropped with a debug log; the race is never aborted.
    pub async fn process_pass(&mut self, node: usize, ts_abs: f64, source: LapSource) {
        if node >= self.race.node_count() {
            debug!(node, "Pass record dismissed: node index out of range");
            return;
        }
        let Some(state) = self.services.nodes.snapshot().into_iter().nth(node) else {
            return;
        };
        debug!(
            node = node + 1,
            abs_ts = ts_abs,
            source = source.as_str(),
            "Pass record"
        );

        if state.frequency == 0 {
            debug!(node = node + 1, "Pass record dismissed: frequency not defined");
            return;
        }

        let racing = self.race.race_status == RaceStatus::Racing;
        let in_done_window =
            self.race.race_status == RaceStatus::Done && ts_abs < self.race.end_time;
        if !racing && !in_done_window {
            debug!(node = node + 1, "Pass record dismissed: race not running");
            return;
        }

        let binding = self.race.node_binding(node);
        let is_secondary = self.is_secondary();
        if binding == NodeBinding::Unassigned && !is_secondary {
            debug!(node = node + 1, "Pass record dismissed: pilot not defined");
            return;
        }

        if ts_abs < self.race.start_time_monotonic {
            debug!(node = node + 1, abs_ts = ts_abs, "Pass record dismissed: race not started");
            return;
        }

        // Lowered thresholds are restored soon after the first real pass.
        if state.start_thresh_lower_flag {
            let now = self.services.clock.now();
            self.services.nodes.with_nodes(|nodes| {
                if let Some(state) = nodes.get_mut(node) {
                    state.start_thresh_lower_time = now;
                }
            });
        }

        let lap_time_stamp =
            ((ts_abs - self.race.start_time_monotonic) * 1000.0).round() as i64;
        let lap_number = self.race.active_laps(node, false).len() as i64;

        let lap_time = if lap_number == 0 {
            // Lap zero: launch pad to first gate pass.
            self.services.nodes.with_nodes(|nodes| {
                if let Some(state) = nodes.get_mut(node) {
                    state.first_cross_flag = true;
                }
            });
            lap_time_stamp
        } else {
            // Late laps anchor timing even though they are excluded from
            // the leaderboard.
            let last_stamp = self
                .race
                .active_laps(node, true)
                .last()
                .map(|lap| lap.lap_time_stamp)
                .unwrap_or(0);
            lap_time_stamp - last_stamp
        };

        let (min_lap_ms, discard_short) = if is_secondary {
            (0, false)
        } else {
            (
                self.services.store.get_option_int(options::MIN_LAP_SEC, 10) * 1000,
                self.services
                    .store
                    .get_option_int(options::MIN_LAP_BEHAVIOR, 0)
                    != 0,
            )
        };

        let mut lap_ok = true;
        if lap_number != 0 {
            if lap_time < min_lap_ms {
                self.services.nodes.with_nodes(|nodes| {
                    if let Some(state) = nodes.get_mut(node) {
                        state.under_min_lap_count += 1;
                    }
                });
                info!(
                    node = node + 1,
                    lap = lap_number,
                    lap_time_ms = lap_time,
                    "Pass record under lap minimum"
                );
                if discard_short {
                    lap_ok = false;
                }
            }

            // Countdown laps past the grace window are not recorded at all.
            let format = &self.race.format;
            if format.race_mode == RaceMode::CountDown
                && format.lap_grace_sec >= 0
                && lap_time_stamp > (format.race_time_sec + format.lap_grace_sec) * 1000
            {
                info!(
                    node = node + 1,
                    lap = lap_number,
                    lap_time_stamp,
                    "Ignoring lap after grace period expired"
                );
                return;
            }
        }

        if !lap_ok {
            // Short lap with discard behavior: kept for audit, never scored.
            self.race.node_laps[node].push(Lap {
                lap_number: Some(lap_number),
                lap_time_stamp,
                lap_time,
                source,
                deleted: true,
                invalid: true,
                late_lap: false,
            });
            return;
        }

        let was_finished = self.race.node_finished[node];
        let format = &self.race.format;
        let past_time = format.race_mode == RaceMode::CountDown
            && lap_time_stamp > format.race_time_sec * 1000;
        let past_laps = format.win_condition == WinCondition::FirstToLapX
            && lap_number >= format.number_laps_win;
        if past_time || past_laps {
            self.race.node_finished[node] = true;
            if !was_finished {
                info!(
                    node = node + 1,
                    callsign = %self.race.node_callsigns[node],
                    "Pilot done"
                );
                self.services
                    .bus
                    .publish(Event::RacePilotDone, json!({ "node_index": node }));
            }
        }

        let mut late_lap = false;
        if was_finished {
            late_lap = true;
            info!(node = node + 1, lap = lap_number, "Ignoring lap after pilot done");
        }
        // A pilot completing the target lap count after the winner is
        // already declared gets an audit record, not a scoring lap.
        if self.race.win_status == WinStatus::Declared
            && self.race.format.win_condition == WinCondition::FirstToLapX
            && past_laps
            && self.race.winning_lap_node != Some(node)
        {
            late_lap = true;
            info!(node = node + 1, lap = lap_number, "Ignoring lap after race winner declared");
        }
        if self.race.win_status == WinStatus::Declared
            && self.race.format.race_mode == RaceMode::NoTimeLimit
            && self.race.format.team_racing_mode
            && self.race.format.win_condition == WinCondition::FirstToLapX
        {
            late_lap = true;
            info!(node = node + 1, lap = lap_number, "Ignoring team lap after race winner declared");
        }

        self.race.node_laps[node].push(Lap {
            lap_number: Some(lap_number),
            lap_time_stamp,
            lap_time,
            source,
            deleted: late_lap,
            invalid: false,
            late_lap,
        });

        self.race.clear_results();
        let results = self.current_results().await;
        self.services.bus.publish(
            Event::RaceLapRecorded,
            json!({
                "node_index": node,
                "frequency": state.frequency,
                "lap": {
                    "lap_number": lap_number,
                    "lap_time_stamp": lap_time_stamp,
                    "lap_time": lap_time,
                    "late_lap": late_lap,
                },
                "laps": &self.race.node_laps[node],
                "results": serde_json::to_value(results.as_ref()).unwrap_or_default(),
            }),
        );

        self.push_current_laps();
        self.push_leaderboard().await;

        let announced_lap = match self.race.format.start_behavior {
            super::state::StartBehavior::FirstLap => lap_number + 1,
            _ => lap_number,
        };
        if announced_lap > 0 {
            // Behind the queue so every pending pass lands first.
            self.enqueue(RaceInput::CheckWin(WinCheckArgs {
                emit_leaderboard_on_win: true,
                ..Default::default()
            }));
        }
    }

    pub async fn check_win_condition(&mut self, args: WinCheckArgs) -> Option<WinDecision> {
        if let Some(token) = args.start_token {
            if self.race.start_token != token {
                debug!(token, "Win check is stale");
                return None;
            }
        }

        let previous = self.race.win_status;
        let undecided = matches!(
            previous,
            WinStatus::None | WinStatus::PendingCrossing | WinStatus::Overtime
        );
        if !undecided && !args.deleted_lap {
            return None;
        }

        let board = self.current_results().await;
        let crossing: Vec<bool> = self
            .services
            .nodes
            .snapshot()
            .iter()
            .map(|state| state.crossing_flag)
            .collect();
        let decision = win::evaluate(&self.race, &board, &crossing, args);
        self.race.win_status = decision.status;

        // A deletion that undoes the declaration reopens the race.
        if args.deleted_lap && decision.status == WinStatus::None && previous != WinStatus::None {
            self.race.status_message.clear();
            info!("Race status cleared after lap deletion");
            return Some(decision);
        }

        match decision.status {
            WinStatus::Declared => {
                let winner = decision.winner.as_ref()?;
                let message = match &winner.team {
                    Some(team) => format!("Winner is Team {team}"),
                    None => format!("Winner is {}", winner.callsign),
                };
                if !args.deleted_lap
                    || decision.status != previous
                    || message != self.race.status_message
                {
                    self.race.status_message = message.clone();
                    if self.race.format.win_condition == WinCondition::FirstToLapX {
                        self.race.winning_lap_node = Some(winner.node);
                    }
                    info!(message = %message, "Race status");
                    self.services.bus.publish(
                        Event::RaceWin,
                        json!({
                            "message": message,
                            "node_index": winner.node,
                            "pilot_id": winner.pilot_id,
                        }),
                    );
                    self.services.ui.emit_priority_message(message, false);
                }
            }
            WinStatus::Tie => {
                if previous != WinStatus::Tie {
                    self.race.status_message = "Race Tied".into();
                    info!("Race status: tied");
                }
            }
            WinStatus::Overtime => {
                if previous != WinStatus::Overtime {
                    self.race.status_message = "Race Tied: Overtime".into();
                    info!("Race status: overtime");
                }
            }
            _ => {}
        }

        if let Some(wait_ms) = decision.max_consideration_ms {
            info!(wait_ms, "Waiting to declare winner");
            let io = self.io.clone();
            let token = self.race.start_token;
            let at_finish = args.at_finish;
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(wait_ms as u64)).await;
                io.send(RaceInput::CheckWin(WinCheckArgs {
                    at_finish,
                    forced: true,
                    emit_leaderboard_on_win: true,
                    start_token: Some(token),
                    ..Default::default()
                }));
            });
        }

        if args.emit_leaderboard_on_win && self.race.win_status != WinStatus::None {
            self.push_leaderboard().await;
        }

        Some(decision)
    }

    /// LED gate indicators: announce enter/exit once the node's first
    /// crossing is complete.
    pub fn handle_crossing_change(&mut self, node: usize) {
        if self.race.race_status != RaceStatus::Racing {
            return;
        }
        let Some(state) = self.services.nodes.snapshot().into_iter().nth(node) else {
            return;
        };
        let announce = self.is_secondary()
            || (self.race.node_binding(node) != NodeBinding::Unassigned && state.first_cross_flag);
        if !announce {
            return;
        }
        let event = if state.crossing_flag {
            Event::CrossingEnter
        } else {
            Event::CrossingExit
        };
        self.services.bus.publish(event, json!({ "nodeIndex": node }));
    }

    /// A threshold capture finished on the node: persist the level into the
    /// active profile and announce it.
    pub async fn handle_level_captured(&mut self, node: usize, is_enter: bool, level: i64) {
        info!(
            node = node + 1,
            level,
            kind = if is_enter { "enter-at" } else { "exit-at" },
            "Finished level capture"
        );

        let mut levels: crate::freq::LevelSet = if is_enter {
            self.race.profile.enter_ats.as_deref()
        } else {
            self.race.profile.exit_ats.as_deref()
        }
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
        levels.set(node, level);

        let patch = if is_enter {
            crate::db::store::ProfilePatch {
                profile_id: self.race.profile.id,
                enter_ats: Some(levels),
                ..Default::default()
            }
        } else {
            crate::db::store::ProfilePatch {
                profile_id: self.race.profile.id,
                exit_ats: Some(levels),
                ..Default::default()
            }
        };
        match self.services.store.alter_profile(patch).await {
            Ok(profile) => self.race.profile = profile,
            Err(error) => debug!(error = %error, "Failed to persist captured level"),
        }

        if is_enter {
            self.services.nodes.set_enter_at_level(node, level);
            self.services.ui.push(ServerPush::EnterAtLevel {
                node,
                level: level as i32,
            });
        } else {
            self.services.nodes.set_exit_at_level(node, level);
            self.services.ui.push(ServerPush::ExitAtLevel {
                node,
                level: level as i32,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::test_support::racing_controller;
    use crate::race::state::StartBehavior;

    #[tokio::test]
    async fn pass_before_start_is_dropped() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;
        controller.process_pass(0, 99.0, LapSource::Rf).await;
        assert!(controller.race.node_laps[0].is_empty());
    }

    #[tokio::test]
    async fn pass_on_disabled_node_is_dropped() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;
        controller.services.nodes.set_frequency(1, 0);
        controller.process_pass(1, 110.0, LapSource::Rf).await;
        assert!(controller.race.node_laps[1].is_empty());
    }

    #[tokio::test]
    async fn min_lap_discard_records_invalid_lap() {
        // Passes at +0, +2, +7 with MinLapSec=5 and discard behavior.
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;
        controller
            .services
            .store
            .set_option(options::MIN_LAP_SEC, "5")
            .await
            .unwrap();
        controller
            .services
            .store
            .set_option(options::MIN_LAP_BEHAVIOR, "1")
            .await
            .unwrap();

        controller.process_pass(0, 100.0, LapSource::Rf).await;
        controller.process_pass(0, 102.0, LapSource::Rf).await;
        controller.process_pass(0, 107.0, LapSource::Rf).await;

        let laps = &controller.race.node_laps[0];
        assert_eq!(laps.len(), 3);
        assert!(laps[1].invalid && laps[1].deleted);
        assert_eq!(
            controller.services.nodes.snapshot()[0].under_min_lap_count,
            1
        );

        // The discarded lap never anchors timing: the surviving lap spans
        // the hole shot to +7s.
        let board = controller.current_results().await;
        let row = board.rows.iter().find(|r| r.node_index == 0).unwrap();
        assert_eq!(row.laps, 1);
        assert_eq!(row.fastest_lap_ms, Some(7_000));
    }

    #[tokio::test]
    async fn first_to_three_declares_winner_and_audits_late_lap() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;
        controller.race.format.race_mode = RaceMode::NoTimeLimit;
        controller.race.format.win_condition = WinCondition::FirstToLapX;
        controller.race.format.number_laps_win = 3;

        let mut done_events = controller.services.bus.listen();

        // Node 0 reaches 3 laps at +30s.
        for ts in [102.0, 110.0, 120.0, 130.0] {
            controller.process_pass(0, ts, LapSource::Rf).await;
        }
        assert!(controller.race.node_finished[0]);
        let decision = controller
            .check_win_condition(WinCheckArgs::default())
            .await
            .unwrap();
        assert_eq!(decision.status, WinStatus::Declared);
        assert_eq!(decision.winner.unwrap().node, 0);

        // Node 1's third lap lands at +31s: audit record only.
        for ts in [103.0, 111.0, 121.0, 131.0] {
            controller.process_pass(1, ts, LapSource::Rf).await;
        }
        let last = controller.race.node_laps[1].last().unwrap();
        assert!(last.deleted && last.late_lap);

        let mut pilot_done_seen = false;
        while let Ok(message) = done_events.try_recv() {
            if message.event == Event::RacePilotDone {
                assert_eq!(message.args["node_index"], 0);
                pilot_done_seen = true;
                break;
            }
        }
        assert!(pilot_done_seen);
    }

    #[tokio::test]
    async fn countdown_grace_accepts_then_drops() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;
        controller.race.format.race_mode = RaceMode::CountDown;
        controller.race.format.race_time_sec = 60;
        controller.race.format.lap_grace_sec = 5;

        controller.process_pass(0, 102.0, LapSource::Rf).await;
        // +62s: inside the grace window → recorded.
        controller.process_pass(0, 162.0, LapSource::Rf).await;
        assert_eq!(controller.race.node_laps[0].len(), 2);
        // +66s: past the grace window → dropped entirely.
        controller.process_pass(0, 166.0, LapSource::Rf).await;
        assert_eq!(controller.race.node_laps[0].len(), 2);
    }

    #[tokio::test]
    async fn every_pass_lands_exactly_once_or_is_dropped() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;

        let passes = [99.0, 102.0, 115.0, 128.0];
        for ts in passes {
            controller.process_pass(0, ts, LapSource::Rf).await;
        }
        // First pass predates the start; the rest land once each.
        assert_eq!(controller.race.node_laps[0].len(), 3);
        let stamps: Vec<i64> = controller.race.node_laps[0]
            .iter()
            .map(|lap| lap.lap_time_stamp)
            .collect();
        assert_eq!(stamps, vec![2_000, 15_000, 28_000]);
    }

    #[tokio::test]
    async fn delete_then_restore_recovers_original_list() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;

        for ts in [102.0, 112.0, 124.0, 133.0] {
            controller.process_pass(0, ts, LapSource::Rf).await;
        }
        let original = controller.race.node_laps[0].clone();

        controller.delete_lap(0, 2).await.unwrap();
        let deleted = &controller.race.node_laps[0][2];
        assert!(deleted.deleted && deleted.invalid);
        // The follower retimes against lap 1: 33s − 12s.
        assert_eq!(controller.race.node_laps[0][3].lap_time, 21_000);

        controller.restore_deleted_lap(0, 2).await.unwrap();
        let restored = &controller.race.node_laps[0];
        assert_eq!(restored.len(), original.len());
        for (a, b) in restored.iter().zip(original.iter()) {
            assert_eq!(a.lap_number, b.lap_number);
            assert_eq!(a.lap_time_stamp, b.lap_time_stamp);
            assert_eq!(a.lap_time, b.lap_time);
            assert_eq!(a.deleted, b.deleted);
        }
    }

    #[tokio::test]
    async fn first_lap_start_behavior_counts_hole_shot() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;
        controller.race.format.start_behavior = StartBehavior::FirstLap;
        controller.race.format.win_condition = WinCondition::FirstToLapX;
        controller.race.format.number_laps_win = 2;
        controller.race.format.race_mode = RaceMode::NoTimeLimit;

        controller.process_pass(0, 105.0, LapSource::Rf).await;
        controller.process_pass(0, 115.0, LapSource::Rf).await;
        let decision = controller
            .check_win_condition(WinCheckArgs::default())
            .await
            .unwrap();
        assert_eq!(decision.status, WinStatus::Declared);
    }

    #[tokio::test]
    async fn deleting_winning_lap_reopens_race() {
        let (race, _rx) = racing_controller().await;
        let mut controller = race.lock().await;
        controller.race.format.race_mode = RaceMode::NoTimeLimit;
        controller.race.format.win_condition = WinCondition::FirstToLapX;
        controller.race.format.number_laps_win = 2;

        for ts in [102.0, 112.0, 122.0] {
            controller.process_pass(0, ts, LapSource::Rf).await;
        }
        controller
            .check_win_condition(WinCheckArgs::default())
            .await
            .unwrap();
        assert_eq!(controller.race.win_status, WinStatus::Declared);

        controller.delete_lap(0, 2).await.unwrap();
        let decision = controller
            .check_win_condition(WinCheckArgs {
                deleted_lap: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(decision.status, WinStatus::None);
        assert!(controller.race.status_message.is_empty());
    }
}
