pub mod mock;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::events::{Event, EventBus};
use crate::race::RaceInput;
use crate::race::state::{LapSource, RaceStatus};

const RSSI_HISTORY_LIMIT: usize = 2048;

/// Observable state of one receiver node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub index: usize,
    pub frequency: u32,
    pub enter_at_level: i64,
    pub exit_at_level: i64,
    pub current_rssi: i64,
    pub crossing_flag: bool,
    pub history_values: Vec<i64>,
    pub history_times: Vec<f64>,
    pub current_pilot_id: i64,
    pub first_cross_flag: bool,
    pub start_thresh_lower_flag: bool,
    pub start_thresh_lower_time: f64,
    pub under_min_lap_count: i64,
}

impl NodeState {
    fn new(index: usize) -> Self {
        Self {
            index,
            frequency: 0,
            enter_at_level: 0,
            exit_at_level: 0,
            current_rssi: 0,
            crossing_flag: false,
            history_values: Vec::new(),
            history_times: Vec::new(),
            current_pilot_id: crate::db::store::ID_NONE,
            first_cross_flag: false,
            start_thresh_lower_flag: false,
            start_thresh_lower_time: 0.0,
            under_min_lap_count: 0,
        }
    }
}

/// Command surface of the hardware driver. Implementations log and degrade
/// on failure; the core never aborts on a driver error.
pub trait NodeDriver: Send + Sync {
    fn set_frequency(&self, node: usize, frequency: u32);
    fn set_enter_at_level(&self, node: usize, level: i64);
    fn set_exit_at_level(&self, node: usize, level: i64);
    /// Non-persistent threshold write (start-threshold lowering).
    fn transmit_enter_at_level(&self, node: usize, level: i64);
    fn transmit_exit_at_level(&self, node: usize, level: i64);
    fn force_end_crossing(&self, node: usize);
    fn enable_calibration_mode(&self);
    fn set_race_status(&self, status: RaceStatus);
    fn start_capture_enter_at_level(&self, node: usize);
    fn start_capture_exit_at_level(&self, node: usize);
}

/// Sender half of the pass-record FIFO, handed to drivers so samples and
/// capture completions enter the race pipeline in arrival order.
#[derive(Clone)]
pub struct NodeIo {
    tx: mpsc::UnboundedSender<RaceInput>,
}

impl NodeIo {
    pub fn new(tx: mpsc::UnboundedSender<RaceInput>) -> Self {
        Self { tx }
    }

    pub fn send(&self, input: RaceInput) {
        let _ = self.tx.send(input);
    }
}

/// Owns per-node observable state and fans hardware callbacks into the pass
/// FIFO. Command methods are called only by the race controller, the
/// calibration task, and operator command handlers.
pub struct NodeManager {
    nodes: Mutex<Vec<NodeState>>,
    driver: Arc<dyn NodeDriver>,
    bus: Arc<EventBus>,
    io: NodeIo,
}

impl NodeManager {
    pub fn new(
        node_count: usize,
        driver: Arc<dyn NodeDriver>,
        bus: Arc<EventBus>,
        io: NodeIo,
    ) -> Self {
        Self {
            nodes: Mutex::new((0..node_count).map(NodeState::new).collect()),
            driver,
            bus,
            io,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().expect("node state poisoned").len()
    }

    pub fn snapshot(&self) -> Vec<NodeState> {
        self.nodes.lock().expect("node state poisoned").clone()
    }

    pub fn with_nodes<R>(&self, f: impl FnOnce(&mut Vec<NodeState>) -> R) -> R {
        let mut nodes = self.nodes.lock().expect("node state poisoned");
        f(&mut nodes)
    }

    // --- Commands ---

    pub fn set_frequency(&self, node: usize, frequency: u32) {
        self.with_nodes(|nodes| {
            if let Some(state) = nodes.get_mut(node) {
                state.frequency = frequency;
            }
        });
        self.driver.set_frequency(node, frequency);
        self.bus.publish(
            Event::FrequencySet,
            serde_json::json!({ "node": node, "frequency": frequency }),
        );
        info!(node = node + 1, frequency, "Frequency set");
    }

    pub fn set_enter_at_level(&self, node: usize, level: i64) {
        self.with_nodes(|nodes| {
            if let Some(state) = nodes.get_mut(node) {
                state.enter_at_level = level;
            }
        });
        self.driver.set_enter_at_level(node, level);
        self.bus.publish(
            Event::EnterAtLevelSet,
            serde_json::json!({ "node": node, "enter_at_level": level }),
        );
    }

    pub fn set_exit_at_level(&self, node: usize, level: i64) {
        self.with_nodes(|nodes| {
            if let Some(state) = nodes.get_mut(node) {
                state.exit_at_level = level;
            }
        });
        self.driver.set_exit_at_level(node, level);
        self.bus.publish(
            Event::ExitAtLevelSet,
            serde_json::json!({ "node": node, "exit_at_level": level }),
        );
    }

    /// Transmit without persisting; the node object keeps its saved levels.
    pub fn transmit_enter_at_level(&self, node: usize, level: i64) {
        self.driver.transmit_enter_at_level(node, level);
    }

    pub fn transmit_exit_at_level(&self, node: usize, level: i64) {
        self.driver.transmit_exit_at_level(node, level);
    }

    pub fn force_end_crossing(&self, node: usize) {
        self.driver.force_end_crossing(node);
        let was_crossing = self.with_nodes(|nodes| {
            nodes
                .get_mut(node)
                .map(|state| std::mem::replace(&mut state.crossing_flag, false))
                .unwrap_or(false)
        });
        if was_crossing {
            self.io.send(RaceInput::CrossingChange { node });
        }
    }

    pub fn enable_calibration_mode(&self) {
        self.driver.enable_calibration_mode();
    }

    pub fn set_race_status(&self, status: RaceStatus) {
        self.driver.set_race_status(status);
    }

    pub fn start_capture_enter_at_level(&self, node: usize) {
        self.driver.start_capture_enter_at_level(node);
    }

    pub fn start_capture_exit_at_level(&self, node: usize) {
        self.driver.start_capture_exit_at_level(node);
    }

    // --- Driver callbacks (enter the FIFO, never race state directly) ---

    pub fn ingest_pass(&self, node: usize, timestamp: f64, source: LapSource) {
        self.io.send(RaceInput::Pass {
            node,
            timestamp,
            source,
        });
    }

    pub fn ingest_crossing_change(&self, node: usize, crossing: bool) {
        self.with_nodes(|nodes| {
            if let Some(state) = nodes.get_mut(node) {
                state.crossing_flag = crossing;
            }
        });
        self.io.send(RaceInput::CrossingChange { node });
    }

    pub fn ingest_rssi(&self, node: usize, rssi: i64, timestamp: f64) {
        self.with_nodes(|nodes| {
            if let Some(state) = nodes.get_mut(node) {
                state.current_rssi = rssi;
                state.history_values.push(rssi);
                state.history_times.push(timestamp);
                if state.history_values.len() > RSSI_HISTORY_LIMIT {
                    state.history_values.remove(0);
                    state.history_times.remove(0);
                }
            }
        });
    }

    pub fn ingest_level_captured(&self, node: usize, is_enter: bool, level: i64) {
        self.io.send(RaceInput::LevelCaptured {
            node,
            is_enter,
            level,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::RaceInput;
    use super::mock::MockDriver;

    fn manager_with_rx() -> (NodeManager, mpsc::UnboundedReceiver<RaceInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let io = NodeIo::new(tx);
        let bus = Arc::new(EventBus::new());
        let driver = Arc::new(MockDriver::new(io.clone()));
        (NodeManager::new(4, driver, bus, io), rx)
    }

    #[test]
    fn set_frequency_updates_state() {
        let (manager, _rx) = manager_with_rx();
        manager.set_frequency(2, 5880);
        assert_eq!(manager.snapshot()[2].frequency, 5880);
    }

    #[test]
    fn pass_callbacks_enter_fifo_in_order() {
        let (manager, mut rx) = manager_with_rx();
        manager.ingest_pass(0, 10.0, LapSource::Rf);
        manager.ingest_pass(1, 10.5, LapSource::Rf);

        match rx.try_recv().unwrap() {
            RaceInput::Pass { node, .. } => assert_eq!(node, 0),
            other => panic!("unexpected input: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            RaceInput::Pass { node, .. } => assert_eq!(node, 1),
            other => panic!("unexpected input: {other:?}"),
        }
    }

    #[test]
    fn force_end_crossing_clears_flag_once() {
        let (manager, mut rx) = manager_with_rx();
        manager.ingest_crossing_change(1, true);
        let _ = rx.try_recv();

        manager.force_end_crossing(1);
        assert!(!manager.snapshot()[1].crossing_flag);
        assert!(matches!(
            rx.try_recv().unwrap(),
            RaceInput::CrossingChange { node: 1 }
        ));

        // Idle node: no spurious crossing-change input.
        manager.force_end_crossing(1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rssi_history_is_bounded() {
        let (manager, _rx) = manager_with_rx();
        for i in 0..(RSSI_HISTORY_LIMIT + 10) {
            manager.ingest_rssi(0, i as i64, i as f64);
        }
        let state = manager.snapshot().remove(0);
        assert_eq!(state.history_values.len(), RSSI_HISTORY_LIMIT);
        assert_eq!(*state.history_values.last().unwrap(), (RSSI_HISTORY_LIMIT + 9) as i64);
    }
}
