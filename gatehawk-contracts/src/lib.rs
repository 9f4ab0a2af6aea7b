use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const CLUSTER_PROTOCOL_VERSION: &str = "cluster.v1";

/// Role a secondary timer plays in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryMode {
    /// Independent timing at a split gate; reports passes to the primary.
    Split,
    /// Displays the primary's race state; forwards nothing upstream.
    Mirror,
}

/// Server identity reported on cluster join and on clock adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub node_count: usize,
    /// Program start as epoch milliseconds, stringified for wire stability.
    pub prog_start_epoch: String,
    pub prog_start_time: String,
}

/// A gate pass reported by a split secondary to its primary (advisory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassRecord {
    pub node: usize,
    pub frequency: u32,
    /// Milliseconds from the secondary's race start.
    pub lap_time_stamp: u64,
    /// Peak RSSI seen during the crossing, when known.
    pub rssi: Option<i32>,
}

/// Messages exchanged between primary and secondary timers. Names are
/// wire-level and must not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum ClusterMessage {
    CheckSecondaryQuery,
    CheckSecondaryResponse {
        /// Epoch milliseconds at the secondary when the query was handled.
        timestamp: f64,
    },
    JoinCluster,
    JoinClusterEx {
        mode: SecondaryMode,
    },
    JoinClusterResponse {
        #[serde(rename = "serverInfoItems")]
        server_info: ServerInfo,
    },
    ClusterEventTrigger {
        evt_name: String,
        /// Stringified JSON payload of the triggering event.
        evt_args: String,
    },
    ClusterMessageAck {
        #[serde(rename = "messageType")]
        message_type: String,
        #[serde(rename = "messagePayload")]
        message_payload: Option<Value>,
    },
    PassRecord(PassRecord),
}

impl ClusterMessage {
    /// The wire name used for ack matching on the per-secondary send queue.
    pub fn message_type(&self) -> &'static str {
        match self {
            ClusterMessage::CheckSecondaryQuery => "check_secondary_query",
            ClusterMessage::CheckSecondaryResponse { .. } => "check_secondary_response",
            ClusterMessage::JoinCluster => "join_cluster",
            ClusterMessage::JoinClusterEx { .. } => "join_cluster_ex",
            ClusterMessage::JoinClusterResponse { .. } => "join_cluster_response",
            ClusterMessage::ClusterEventTrigger { .. } => "cluster_event_trigger",
            ClusterMessage::ClusterMessageAck { .. } => "cluster_message_ack",
            ClusterMessage::PassRecord(_) => "pass_record",
        }
    }
}

/// Frequency assignment for one node slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrequencySlot {
    pub band: Option<String>,
    pub channel: Option<u16>,
    pub frequency: u32,
}

/// Commands sent by browser clients over the WebSocket. Names are wire-level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    LoadData { types: Vec<String> },
    StageRace,
    StopRace,
    SaveLaps,
    DiscardLaps,
    SetCurrentHeat { heat: i64 },
    ScheduleRace { m: u32, s: u32 },
    CancelScheduleRace,
    SetFrequency {
        node: usize,
        band: Option<String>,
        channel: Option<u16>,
        frequency: u32,
    },
    SetFrequencyPreset { preset: String },
    SetEnterAtLevel { node: usize, enter_at_level: i32 },
    SetExitAtLevel { node: usize, exit_at_level: i32 },
    CapEnterAtBtn { node: usize },
    CapExitAtBtn { node: usize },
    SetMinLap { min_lap: u32 },
    SetMinLapBehavior { min_lap_behavior: u8 },
    SetRaceFormat { race_format: i64 },
    SetProfile { profile: i64 },
    AddPilot,
    AlterPilot(Value),
    DeletePilot { pilot: i64 },
    AddHeat,
    DuplicateHeat { heat: i64 },
    AlterHeat(Value),
    DeleteHeat { heat: i64 },
    AddRaceClass,
    DuplicateRaceClass { class: i64 },
    AlterRaceClass(Value),
    DeleteClass { class: i64 },
    AddRaceFormat { source_format_id: i64 },
    AlterRaceFormat(Value),
    DeleteRaceFormat { format_id: i64 },
    AddProfile { source_profile_id: i64 },
    AlterProfile(Value),
    DeleteProfile,
    AlterRace { race_id: i64, heat_id: i64 },
    DeleteLap { node: usize, lap_index: usize },
    RestoreDeletedLap { node: usize, lap_index: usize },
    BackupDatabase,
    ListBackups,
    RestoreDatabase { backup_file: String },
    DeleteDatabaseFile { backup_file: String },
    ResetDatabase { reset_type: String },
    ExportDatabase { exporter: String },
    GenerateHeatsV2 {
        generator: String,
        input_class: i64,
        output_class: i64,
    },
    SetLedEventEffect { event: String, effect: String },
    UseLedEffect { effect: String },
    LedBrightnessSet { brightness: u8 },
    SetOption { option: String, value: String },
    GetPiTime,
    RetrySecondary { secondary_id: usize },
    ShutdownPi,
    RebootPi,
    KillServer,
}

/// One node's slice of the periodic heartbeat push.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatNode {
    pub frequency: u32,
    pub current_rssi: i32,
    pub crossing_flag: bool,
}

/// Staging parameters announced to clients when a race is staged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReady {
    pub hide_stage_timer: bool,
    pub staging_at_s: f64,
    pub starts_at_s: f64,
    pub staging_tones: u32,
    pub race_mode: u8,
    pub race_time_sec: u32,
}

/// Pushes from the server to browser clients. Names are wire-level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "push", rename_all = "snake_case")]
pub enum ServerPush {
    Heartbeat { nodes: Vec<HeartbeatNode> },
    RaceScheduled { scheduled: bool, scheduled_at: f64 },
    StageReady(StageReady),
    StopTimer,
    RaceStatus { race_status: u8, race_mode: u8, race_time_sec: u32 },
    CurrentLaps { laps: Value },
    Leaderboard { leaderboard: Value },
    RaceDetails { race: Value },
    PriorityMessage { message: String, interrupt: bool },
    ClusterStatus { secondaries: Vec<Value> },
    NodeData { nodes: Value },
    EnterAtLevel { node: usize, level: i32 },
    ExitAtLevel { node: usize, level: i32 },
    FrequencyData { frequencies: Vec<FrequencySlot> },
    PiTime { pi_time_s: f64 },
    DatabaseBkpDone { file_name: String },
    BackupsList { backup_files: Vec<String> },
    ExportedData { export_file: String, data: String },
    ResetConfirm { reset_type: String },
    PilotData { pilots: Value },
    HeatData { heats: Value },
    ClassData { classes: Value },
    FormatData { formats: Value },
    ProfileData { profiles: Value },
    HeatPlanResult { heat: i64, slots: Value },
    ServerInfo(ServerInfo),
}

/// Envelope wrapping a command with a session-scoped correlation id so a
/// reply can be routed only to the requesting session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
    #[serde(flatten)]
    pub command: ClientCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_message_wire_names_are_stable() {
        let msg = ClusterMessage::JoinClusterEx {
            mode: SecondaryMode::Split,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["message"], "join_cluster_ex");
        assert_eq!(json["mode"], "split");

        let ack = ClusterMessage::ClusterMessageAck {
            message_type: "pass_record".into(),
            message_payload: Some(serde_json::json!({"node": 2})),
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["message"], "cluster_message_ack");
        assert_eq!(json["messageType"], "pass_record");
        assert_eq!(json["messagePayload"]["node"], 2);
    }

    #[test]
    fn cluster_message_round_trips() {
        let msg = ClusterMessage::PassRecord(PassRecord {
            node: 3,
            frequency: 5880,
            lap_time_stamp: 32_450,
            rssi: Some(104),
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClusterMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClusterMessage::PassRecord(p) => {
                assert_eq!(p.node, 3);
                assert_eq!(p.lap_time_stamp, 32_450);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn client_command_parses_wire_form() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"command": "schedule_race", "m": 1, "s": 30}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ClientCommand::ScheduleRace { m: 1, s: 30 }));

        let cmd: ClientCommand = serde_json::from_str(
            r#"{"command": "set_frequency", "node": 0, "band": "R", "channel": 1, "frequency": 5658}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::SetFrequency {
                node, frequency, ..
            } => {
                assert_eq!(node, 0);
                assert_eq!(frequency, 5658);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn command_envelope_defaults_request_id() {
        let env: CommandEnvelope =
            serde_json::from_str(r#"{"command": "stage_race"}"#).unwrap();
        assert!(matches!(env.command, ClientCommand::StageRace));
    }

    #[test]
    fn message_type_matches_serialized_tag() {
        let messages = [
            ClusterMessage::CheckSecondaryQuery,
            ClusterMessage::JoinCluster,
            ClusterMessage::ClusterEventTrigger {
                evt_name: "RACE_START".into(),
                evt_args: "{}".into(),
            },
        ];
        for msg in messages {
            let json = serde_json::to_value(&msg).unwrap();
            assert_eq!(json["message"], msg.message_type());
        }
    }
}
