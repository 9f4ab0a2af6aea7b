use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::models::{ProfileRow, RaceFormatRow};
use crate::db::store::ID_NONE;
use crate::results::leaderboard::Leaderboard;

/// Race sequencing states. Numeric values are wire-level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RaceStatus {
    Ready = 0,
    Racing = 1,
    Done = 2,
    Staging = 3,
}

impl RaceStatus {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RaceMode {
    CountDown = 0,
    NoTimeLimit = 1,
}

impl RaceMode {
    pub fn from_i64(value: i64) -> RaceMode {
        match value {
            1 => RaceMode::NoTimeLimit,
            _ => RaceMode::CountDown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WinCondition {
    None = 0,
    MostLaps = 1,
    FirstToLapX = 2,
    FastestLap = 3,
    FastestConsecutive = 4,
}

impl WinCondition {
    pub fn from_i64(value: i64) -> WinCondition {
        match value {
            1 => WinCondition::MostLaps,
            2 => WinCondition::FirstToLapX,
            3 => WinCondition::FastestLap,
            4 => WinCondition::FastestConsecutive,
            _ => WinCondition::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WinStatus {
    None = 0,
    Tie = 1,
    PendingCrossing = 2,
    Declared = 3,
    Overtime = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StartBehavior {
    HoleShot = 0,
    FirstLap = 1,
    StaggeredStart = 2,
}

impl StartBehavior {
    pub fn from_i64(value: i64) -> StartBehavior {
        match value {
            1 => StartBehavior::FirstLap,
            2 => StartBehavior::StaggeredStart,
            _ => StartBehavior::HoleShot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StagingTones {
    None = 0,
    OnePerSecond = 1,
}

/// Where a lap record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LapSource {
    Rf = 0,
    Manual = 1,
    Api = 2,
    Recalc = 3,
}

impl LapSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LapSource::Rf => "RF",
            LapSource::Manual => "manual",
            LapSource::Api => "API",
            LapSource::Recalc => "recalc",
        }
    }
}

/// Race format resolved into domain types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceFormat {
    pub id: i64,
    pub name: String,
    pub race_mode: RaceMode,
    pub race_time_sec: i64,
    /// Negative disables the grace window.
    pub lap_grace_sec: i64,
    pub staging_fixed_tones: i64,
    pub start_delay_min_ms: i64,
    pub start_delay_max_ms: i64,
    pub staging_tones: StagingTones,
    pub number_laps_win: i64,
    pub win_condition: WinCondition,
    pub team_racing_mode: bool,
    pub start_behavior: StartBehavior,
}

impl RaceFormat {
    pub fn from_row(row: &RaceFormatRow) -> Self {
        Self {
            id: row.id,
            name: row.name.clone(),
            race_mode: RaceMode::from_i64(row.race_mode),
            race_time_sec: row.race_time_sec,
            lap_grace_sec: row.lap_grace_sec,
            staging_fixed_tones: row.staging_fixed_tones,
            start_delay_min_ms: row.start_delay_min_ms,
            start_delay_max_ms: row.start_delay_max_ms,
            staging_tones: if row.staging_tones == 1 {
                StagingTones::OnePerSecond
            } else {
                StagingTones::None
            },
            number_laps_win: row.number_laps_win,
            win_condition: WinCondition::from_i64(row.win_condition),
            team_racing_mode: row.team_racing_mode,
            start_behavior: StartBehavior::from_i64(row.start_behavior),
        }
    }

    /// Built-in format used while running as a split secondary: no minimum
    /// lap enforcement and no win condition.
    pub fn secondary() -> Self {
        Self {
            id: ID_NONE,
            name: "Secondary".into(),
            race_mode: RaceMode::NoTimeLimit,
            race_time_sec: 0,
            lap_grace_sec: -1,
            staging_fixed_tones: 0,
            start_delay_min_ms: 0,
            start_delay_max_ms: 0,
            staging_tones: StagingTones::None,
            number_laps_win: 0,
            win_condition: WinCondition::None,
            team_racing_mode: false,
            start_behavior: StartBehavior::HoleShot,
        }
    }

    pub fn is_secondary(&self) -> bool {
        self.id == ID_NONE && self.name == "Secondary"
    }
}

/// One lap in the current race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lap {
    /// None while the lap is invalid.
    pub lap_number: Option<i64>,
    /// Milliseconds since race start.
    pub lap_time_stamp: i64,
    /// Milliseconds; lap 0 carries the hole-shot time.
    pub lap_time: i64,
    pub source: LapSource,
    pub deleted: bool,
    pub invalid: bool,
    pub late_lap: bool,
}

/// How a node participates in the current heat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBinding {
    Assigned(i64),
    Unassigned,
    /// Practice mode: laps are recorded but can never be saved.
    Practice,
}

/// The process-wide current race, owned by the race controller.
#[derive(Debug, Clone)]
pub struct CurrentRace {
    pub current_heat: i64,
    pub format: RaceFormat,
    pub profile: ProfileRow,
    pub race_status: RaceStatus,
    pub stage_time_monotonic: f64,
    pub start_time_monotonic: f64,
    pub start_time_epoch_ms: f64,
    /// Fresh random value per staging; stale timers are no-ops.
    pub start_token: u64,
    pub end_time: f64,
    pub node_pilots: Vec<i64>,
    pub node_callsigns: Vec<String>,
    pub node_teams: Vec<Option<String>>,
    pub node_laps: Vec<Vec<Lap>>,
    pub node_finished: Vec<bool>,
    pub results: Option<Arc<Leaderboard>>,
    pub win_status: WinStatus,
    pub status_message: String,
    pub scheduled: bool,
    pub scheduled_time: f64,
    pub any_races_started: bool,
    /// Winning lap id while a first-to-X win stands; deletions that reach
    /// below it reopen the race.
    pub winning_lap_node: Option<usize>,
    pub timer_running: bool,
}

impl CurrentRace {
    pub fn new(node_count: usize, format: RaceFormat, profile: ProfileRow) -> Self {
        Self {
            current_heat: ID_NONE,
            format,
            profile,
            race_status: RaceStatus::Ready,
            stage_time_monotonic: 0.0,
            start_time_monotonic: 0.0,
            start_time_epoch_ms: 0.0,
            start_token: 0,
            end_time: 0.0,
            node_pilots: vec![ID_NONE; node_count],
            node_callsigns: vec![String::new(); node_count],
            node_teams: vec![None; node_count],
            node_laps: vec![Vec::new(); node_count],
            node_finished: vec![false; node_count],
            results: None,
            win_status: WinStatus::None,
            status_message: String::new(),
            scheduled: false,
            scheduled_time: 0.0,
            any_races_started: false,
            winning_lap_node: None,
            timer_running: false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_laps.len()
    }

    /// Binding of a node in the current heat.
    pub fn node_binding(&self, node: usize) -> NodeBinding {
        if self.current_heat == ID_NONE {
            return NodeBinding::Practice;
        }
        match self.node_pilots.get(node) {
            Some(&pilot_id) if pilot_id != ID_NONE => NodeBinding::Assigned(pilot_id),
            _ => NodeBinding::Unassigned,
        }
    }

    /// Laps that count: not deleted, or late laps when they are wanted for
    /// timing continuity.
    pub fn active_laps(&self, node: usize, include_late: bool) -> Vec<&Lap> {
        self.node_laps[node]
            .iter()
            .filter(|lap| {
                if lap.invalid {
                    return false;
                }
                if include_late {
                    !lap.deleted || lap.late_lap
                } else {
                    !lap.deleted
                }
            })
            .collect()
    }

    pub fn any_laps_recorded(&self) -> bool {
        self.node_laps.iter().any(|laps| !laps.is_empty())
    }

    /// Leaderboard inputs for the current race: every node with a pilot
    /// assignment or recorded laps.
    pub fn pilot_laps(&self) -> Vec<crate::results::leaderboard::PilotLaps> {
        use crate::results::leaderboard::{LapTime, PilotLaps};

        (0..self.node_count())
            .filter(|&node| {
                self.node_pilots[node] != ID_NONE || !self.node_laps[node].is_empty()
            })
            .map(|node| PilotLaps {
                pilot_id: self.node_pilots[node],
                callsign: self.node_callsigns[node].clone(),
                team: self.node_teams[node].clone().unwrap_or_default(),
                node_index: node,
                laps: self
                    .active_laps(node, false)
                    .into_iter()
                    .map(|lap| LapTime {
                        lap_time_stamp: lap.lap_time_stamp,
                        lap_time: lap.lap_time,
                    })
                    .collect(),
            })
            .collect()
    }

    /// Completed laps on a node; the hole shot counts only with first-lap
    /// start behavior.
    pub fn completed_laps(&self, node: usize) -> usize {
        let active = self.active_laps(node, false).len();
        match self.format.start_behavior {
            StartBehavior::HoleShot => active.saturating_sub(1),
            _ => active,
        }
    }

    pub fn clear_results(&mut self) {
        self.results = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ProfileRow {
        ProfileRow {
            id: 1,
            name: "Default".into(),
            description: String::new(),
            frequencies: r#"{"b":[],"c":[],"f":[]}"#.into(),
            enter_ats: None,
            exit_ats: None,
        }
    }

    #[test]
    fn practice_mode_binding_wins_over_assignment() {
        let mut race = CurrentRace::new(2, RaceFormat::secondary(), profile());
        race.node_pilots[0] = 7;
        assert_eq!(race.node_binding(0), NodeBinding::Practice);

        race.current_heat = 3;
        assert_eq!(race.node_binding(0), NodeBinding::Assigned(7));
        assert_eq!(race.node_binding(1), NodeBinding::Unassigned);
    }

    #[test]
    fn active_laps_filter_deleted_and_invalid() {
        let mut race = CurrentRace::new(1, RaceFormat::secondary(), profile());
        race.node_laps[0] = vec![
            Lap {
                lap_number: Some(0),
                lap_time_stamp: 1_000,
                lap_time: 1_000,
                source: LapSource::Rf,
                deleted: false,
                invalid: false,
                late_lap: false,
            },
            Lap {
                lap_number: None,
                lap_time_stamp: 2_000,
                lap_time: 1_000,
                source: LapSource::Rf,
                deleted: true,
                invalid: true,
                late_lap: false,
            },
            Lap {
                lap_number: Some(1),
                lap_time_stamp: 12_000,
                lap_time: 11_000,
                source: LapSource::Rf,
                deleted: true,
                invalid: false,
                late_lap: true,
            },
        ];

        assert_eq!(race.active_laps(0, false).len(), 1);
        // Late laps stay visible for timing continuity.
        assert_eq!(race.active_laps(0, true).len(), 2);
    }
}
