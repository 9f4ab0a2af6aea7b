use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Named events published on the bus. String forms are wire-level (used in
/// `cluster_event_trigger` messages) and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "STARTUP")]
    Startup,
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
    #[serde(rename = "PILOT_ADD")]
    PilotAdd,
    #[serde(rename = "PILOT_ALTER")]
    PilotAlter,
    #[serde(rename = "PILOT_DELETE")]
    PilotDelete,
    #[serde(rename = "CLASS_ADD")]
    ClassAdd,
    #[serde(rename = "CLASS_DUPLICATE")]
    ClassDuplicate,
    #[serde(rename = "CLASS_ALTER")]
    ClassAlter,
    #[serde(rename = "CLASS_DELETE")]
    ClassDelete,
    #[serde(rename = "HEAT_ADD")]
    HeatAdd,
    #[serde(rename = "HEAT_DUPLICATE")]
    HeatDuplicate,
    #[serde(rename = "HEAT_ALTER")]
    HeatAlter,
    #[serde(rename = "HEAT_DELETE")]
    HeatDelete,
    #[serde(rename = "PROFILE_ADD")]
    ProfileAdd,
    #[serde(rename = "PROFILE_ALTER")]
    ProfileAlter,
    #[serde(rename = "PROFILE_DELETE")]
    ProfileDelete,
    #[serde(rename = "FORMAT_ADD")]
    FormatAdd,
    #[serde(rename = "FORMAT_ALTER")]
    FormatAlter,
    #[serde(rename = "FORMAT_DELETE")]
    FormatDelete,
    #[serde(rename = "FREQUENCY_SET")]
    FrequencySet,
    #[serde(rename = "ENTER_AT_LEVEL_SET")]
    EnterAtLevelSet,
    #[serde(rename = "EXIT_AT_LEVEL_SET")]
    ExitAtLevelSet,
    #[serde(rename = "RACE_SCHEDULE")]
    RaceSchedule,
    #[serde(rename = "RACE_SCHEDULE_CANCEL")]
    RaceScheduleCancel,
    #[serde(rename = "RACE_STAGE")]
    RaceStage,
    #[serde(rename = "RACE_START")]
    RaceStart,
    #[serde(rename = "RACE_FINISH")]
    RaceFinish,
    #[serde(rename = "RACE_STOP")]
    RaceStop,
    #[serde(rename = "RACE_LAP_RECORDED")]
    RaceLapRecorded,
    #[serde(rename = "RACE_PILOT_DONE")]
    RacePilotDone,
    #[serde(rename = "RACE_WIN")]
    RaceWin,
    #[serde(rename = "LAPS_SAVE")]
    LapsSave,
    #[serde(rename = "LAPS_DISCARD")]
    LapsDiscard,
    #[serde(rename = "LAPS_CLEAR")]
    LapsClear,
    #[serde(rename = "LAP_DELETE")]
    LapDelete,
    #[serde(rename = "LAP_RESTORE_DELETED")]
    LapRestoreDeleted,
    #[serde(rename = "CROSSING_ENTER")]
    CrossingEnter,
    #[serde(rename = "CROSSING_EXIT")]
    CrossingExit,
    #[serde(rename = "LED_MANUAL")]
    LedManual,
    #[serde(rename = "LED_SET_MANUAL")]
    LedSetManual,
    #[serde(rename = "LED_BRIGHTNESS_SET")]
    LedBrightnessSet,
    #[serde(rename = "CLUSTER_JOIN")]
    ClusterJoin,
    #[serde(rename = "DATABASE_BACKUP")]
    DatabaseBackup,
    #[serde(rename = "DATABASE_RESTORE")]
    DatabaseRestore,
    #[serde(rename = "DATABASE_RESET")]
    DatabaseReset,
    #[serde(rename = "DATABASE_EXPORT")]
    DatabaseExport,
    #[serde(rename = "OPTION_SET")]
    OptionSet,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Startup => "STARTUP",
            Event::Shutdown => "SHUTDOWN",
            Event::PilotAdd => "PILOT_ADD",
            Event::PilotAlter => "PILOT_ALTER",
            Event::PilotDelete => "PILOT_DELETE",
            Event::ClassAdd => "CLASS_ADD",
            Event::ClassDuplicate => "CLASS_DUPLICATE",
            Event::ClassAlter => "CLASS_ALTER",
            Event::ClassDelete => "CLASS_DELETE",
            Event::HeatAdd => "HEAT_ADD",
            Event::HeatDuplicate => "HEAT_DUPLICATE",
            Event::HeatAlter => "HEAT_ALTER",
            Event::HeatDelete => "HEAT_DELETE",
            Event::ProfileAdd => "PROFILE_ADD",
            Event::ProfileAlter => "PROFILE_ALTER",
            Event::ProfileDelete => "PROFILE_DELETE",
            Event::FormatAdd => "FORMAT_ADD",
            Event::FormatAlter => "FORMAT_ALTER",
            Event::FormatDelete => "FORMAT_DELETE",
            Event::FrequencySet => "FREQUENCY_SET",
            Event::EnterAtLevelSet => "ENTER_AT_LEVEL_SET",
            Event::ExitAtLevelSet => "EXIT_AT_LEVEL_SET",
            Event::RaceSchedule => "RACE_SCHEDULE",
            Event::RaceScheduleCancel => "RACE_SCHEDULE_CANCEL",
            Event::RaceStage => "RACE_STAGE",
            Event::RaceStart => "RACE_START",
            Event::RaceFinish => "RACE_FINISH",
            Event::RaceStop => "RACE_STOP",
            Event::RaceLapRecorded => "RACE_LAP_RECORDED",
            Event::RacePilotDone => "RACE_PILOT_DONE",
            Event::RaceWin => "RACE_WIN",
            Event::LapsSave => "LAPS_SAVE",
            Event::LapsDiscard => "LAPS_DISCARD",
            Event::LapsClear => "LAPS_CLEAR",
            Event::LapDelete => "LAP_DELETE",
            Event::LapRestoreDeleted => "LAP_RESTORE_DELETED",
            Event::CrossingEnter => "CROSSING_ENTER",
            Event::CrossingExit => "CROSSING_EXIT",
            Event::LedManual => "LED_MANUAL",
            Event::LedSetManual => "LED_SET_MANUAL",
            Event::LedBrightnessSet => "LED_BRIGHTNESS_SET",
            Event::ClusterJoin => "CLUSTER_JOIN",
            Event::DatabaseBackup => "DATABASE_BACKUP",
            Event::DatabaseRestore => "DATABASE_RESTORE",
            Event::DatabaseReset => "DATABASE_RESET",
            Event::DatabaseExport => "DATABASE_EXPORT",
            Event::OptionSet => "OPTION_SET",
        }
    }

    pub fn parse(name: &str) -> Option<Event> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }

    /// Events forwarded from a primary to its secondaries.
    pub fn forwarded_to_cluster(&self) -> bool {
        matches!(
            self,
            Event::RaceStage
                | Event::RaceStart
                | Event::RaceFinish
                | Event::RaceStop
                | Event::RaceLapRecorded
                | Event::RacePilotDone
                | Event::RaceWin
                | Event::LapsSave
                | Event::LapsDiscard
                | Event::LapsClear
                | Event::LedSetManual
                | Event::LedBrightnessSet
        )
    }
}

/// A published event with its JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    pub event: Event,
    pub args: Value,
}

type Subscriber = Arc<dyn Fn(&EventMessage) + Send + Sync>;

/// Pub/sub bus: synchronous subscribers invoked in registration order on the
/// publishing task, plus a broadcast channel for async fan-out (websocket
/// clients, cluster forwarding).
///
/// Publication is safe from concurrent tasks; fan-out is serialized per event
/// so slow subscribers cannot reorder deliveries of the same event.
pub struct EventBus {
    subscribers: Mutex<HashMap<Event, Vec<Subscriber>>>,
    dispatch_locks: Mutex<HashMap<Event, Arc<Mutex<()>>>>,
    broadcast_tx: broadcast::Sender<Arc<EventMessage>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            dispatch_locks: Mutex::new(HashMap::new()),
            broadcast_tx,
        }
    }

    pub fn subscribe<F>(&self, event: Event, callback: F)
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .entry(event)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Receiver for async consumers. Every publish is delivered once per
    /// receiver, in publish order.
    pub fn listen(&self) -> broadcast::Receiver<Arc<EventMessage>> {
        self.broadcast_tx.subscribe()
    }

    pub fn publish(&self, event: Event, args: Value) {
        let message = EventMessage { event, args };

        let callbacks: Vec<Subscriber> = self
            .subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .get(&event)
            .map(|subs| subs.to_vec())
            .unwrap_or_default();

        let dispatch_lock = {
            let mut locks = self
                .dispatch_locks
                .lock()
                .expect("dispatch lock registry poisoned");
            locks.entry(event).or_default().clone()
        };

        {
            let _guard = dispatch_lock.lock().expect("dispatch lock poisoned");
            for callback in &callbacks {
                callback(&message);
            }
            if self.broadcast_tx.send(Arc::new(message)).is_err() {
                debug!(event = event.as_str(), "Event published with no listeners");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wire_names_round_trip() {
        for event in [
            Event::RaceStage,
            Event::RaceLapRecorded,
            Event::EnterAtLevelSet,
            Event::LapRestoreDeleted,
            Event::DatabaseBackup,
        ] {
            assert_eq!(Event::parse(event.as_str()), Some(event));
        }
        assert_eq!(Event::parse("NOT_AN_EVENT"), None);
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3usize {
            let order = order.clone();
            bus.subscribe(Event::RaceStart, move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        bus.publish(Event::RaceStart, Value::Null);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn delivery_is_once_per_subscription() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(Event::LapsClear, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::LapsClear, Value::Null);
        bus.publish(Event::LapsClear, Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broadcast_preserves_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.listen();

        bus.publish(Event::RaceStage, serde_json::json!({"n": 1}));
        bus.publish(Event::RaceStart, serde_json::json!({"n": 2}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event, Event::RaceStage);
        assert_eq!(second.event, Event::RaceStart);
    }

    #[test]
    fn cluster_forwarding_covers_race_events_only() {
        assert!(Event::RaceStage.forwarded_to_cluster());
        assert!(!Event::OptionSet.forwarded_to_cluster());
        assert!(!Event::Startup.forwarded_to_cluster());
    }
}
