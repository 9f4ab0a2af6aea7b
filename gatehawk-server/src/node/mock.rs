use tracing::{debug, info};

use super::{NodeDriver, NodeIo};
use crate::race::state::RaceStatus;

/// Stand-in driver used when no hardware is configured. Commands are
/// accepted and logged so the UI stays usable; captures complete
/// immediately with nominal levels.
pub struct MockDriver {
    io: NodeIo,
}

const MOCK_CAPTURE_ENTER: i64 = 76;
const MOCK_CAPTURE_EXIT: i64 = 66;

impl MockDriver {
    pub fn new(io: NodeIo) -> Self {
        info!("Node interface running with mock driver");
        Self { io }
    }
}

impl NodeDriver for MockDriver {
    fn set_frequency(&self, node: usize, frequency: u32) {
        debug!(node = node + 1, frequency, "mock: set frequency");
    }

    fn set_enter_at_level(&self, node: usize, level: i64) {
        debug!(node = node + 1, level, "mock: set enter-at");
    }

    fn set_exit_at_level(&self, node: usize, level: i64) {
        debug!(node = node + 1, level, "mock: set exit-at");
    }

    fn transmit_enter_at_level(&self, node: usize, level: i64) {
        debug!(node = node + 1, level, "mock: transmit enter-at");
    }

    fn transmit_exit_at_level(&self, node: usize, level: i64) {
        debug!(node = node + 1, level, "mock: transmit exit-at");
    }

    fn force_end_crossing(&self, node: usize) {
        debug!(node = node + 1, "mock: force end crossing");
    }

    fn enable_calibration_mode(&self) {
        debug!("mock: calibration mode enabled");
    }

    fn set_race_status(&self, status: RaceStatus) {
        debug!(status = status.as_u8(), "mock: race status");
    }

    fn start_capture_enter_at_level(&self, node: usize) {
        self.io.send(crate::race::RaceInput::LevelCaptured {
            node,
            is_enter: true,
            level: MOCK_CAPTURE_ENTER,
        });
    }

    fn start_capture_exit_at_level(&self, node: usize) {
        self.io.send(crate::race::RaceInput::LevelCaptured {
            node,
            is_enter: false,
            level: MOCK_CAPTURE_EXIT,
        });
    }
}
