use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PilotRow {
    pub id: i64,
    pub name: String,
    pub callsign: String,
    pub team: String,
    pub phonetic: String,
    /// JSON list of `{b, c, f}` entries recorded on each race save.
    pub used_frequencies: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RaceClassRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub format_id: i64,
    pub cache_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HeatRow {
    pub id: i64,
    pub note: String,
    pub class_id: i64,
    /// 0 = planned, 1 = confirmed
    pub status: i64,
    pub auto_frequency: bool,
    pub cache_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HeatSlotRow {
    pub id: i64,
    pub heat_id: i64,
    /// Null until the heat plan is confirmed.
    pub node_index: Option<i64>,
    pub pilot_id: i64,
    /// 0 = direct assignment, 1 = seed by rank, 2 = seed by heat result
    pub method: i64,
    pub seed_rank: Option<i64>,
    pub seed_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RaceFormatRow {
    pub id: i64,
    pub name: String,
    pub race_mode: i64,
    pub race_time_sec: i64,
    pub lap_grace_sec: i64,
    pub staging_fixed_tones: i64,
    pub start_delay_min_ms: i64,
    pub start_delay_max_ms: i64,
    pub staging_tones: i64,
    pub number_laps_win: i64,
    pub win_condition: i64,
    pub team_racing_mode: bool,
    pub start_behavior: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProfileRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// JSON `{b: [band?], c: [chan?], f: [hz]}`
    pub frequencies: String,
    /// JSON `{v: [level?]}`
    pub enter_ats: Option<String>,
    pub exit_ats: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SavedRaceRow {
    pub id: i64,
    pub round_id: i64,
    pub heat_id: i64,
    pub class_id: i64,
    pub format_id: i64,
    /// Monotonic seconds at race start.
    pub start_time: f64,
    /// Wall-clock start, `YYYY-MM-DD HH:MM:SS`.
    pub start_time_wall: String,
    pub cache_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SavedPilotRaceRow {
    pub id: i64,
    pub race_id: i64,
    pub node_index: i64,
    pub pilot_id: i64,
    pub enter_at: i64,
    pub exit_at: i64,
    pub rssi_history: Option<String>,
    pub time_history: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SavedLapRow {
    pub id: i64,
    pub pilot_race_id: i64,
    pub race_id: i64,
    pub node_index: i64,
    pub pilot_id: i64,
    pub lap_number: Option<i64>,
    /// Milliseconds since race start.
    pub lap_time_stamp: i64,
    pub lap_time: i64,
    pub source: i64,
    pub deleted: bool,
    pub invalid: bool,
    pub late_lap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LapSplitRow {
    pub id: i64,
    pub race_id: i64,
    pub pilot_race_id: i64,
    pub node_index: i64,
    pub pilot_id: i64,
    pub lap_number: i64,
    pub split_index: i64,
    pub split_time_stamp: i64,
    pub split_time: i64,
}
