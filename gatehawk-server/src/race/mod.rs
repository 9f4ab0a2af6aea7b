pub mod controller;
pub mod crossing;
pub mod state;
pub mod win;

pub use controller::RaceController;

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use state::LapSource;

/// Items on the pass-record FIFO. Win checks ride the same queue so the
/// queue drains fully before a winner is declared.
#[derive(Debug, Clone)]
pub enum RaceInput {
    Pass {
        node: usize,
        /// Absolute monotonic seconds of the gate pass.
        timestamp: f64,
        source: LapSource,
    },
    CrossingChange {
        node: usize,
    },
    LevelCaptured {
        node: usize,
        is_enter: bool,
        level: i64,
    },
    CheckWin(WinCheckArgs),
}

/// Context of one win-condition check.
#[derive(Debug, Clone, Copy, Default)]
pub struct WinCheckArgs {
    pub at_finish: bool,
    pub emit_leaderboard_on_win: bool,
    pub deleted_lap: bool,
    pub forced: bool,
    pub start_token: Option<u64>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::Services;
    use crate::clock::Clock;
    use crate::db;
    use crate::db::store::Store;
    use crate::events::EventBus;
    use crate::node::mock::MockDriver;
    use crate::node::{NodeIo, NodeManager};
    use crate::race::state::RaceStatus;
    use crate::results::cache::ResultsCache;
    use crate::ui::UiChannel;

    /// Fully wired controller over an in-memory database.
    pub(crate) async fn build_controller()
    -> (Arc<Mutex<RaceController>>, mpsc::UnboundedReceiver<RaceInput>) {
        let pool = db::create_pool(":memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let bus = Arc::new(EventBus::new());
        let results = Arc::new(ResultsCache::new());
        let store = Store::new(pool, bus.clone(), results.clone(), ":memory:".into(), 4);
        store.init().await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let io = NodeIo::new(tx);
        let driver = Arc::new(MockDriver::new(io.clone()));
        let nodes = Arc::new(NodeManager::new(4, driver, bus.clone(), io.clone()));

        let services = Arc::new(Services {
            clock: Arc::new(Clock::new()),
            bus,
            store,
            results,
            nodes,
            ui: UiChannel::new(),
        });

        let controller = RaceController::new(services, io).await.unwrap();
        (Arc::new(Mutex::new(controller)), rx)
    }

    /// Controller already racing with a start time of T=100 s, so tests can
    /// feed passes with explicit absolute timestamps.
    pub(crate) async fn racing_controller()
    -> (Arc<Mutex<RaceController>>, mpsc::UnboundedReceiver<RaceInput>) {
        let (race, rx) = build_controller().await;
        {
            let mut controller = race.lock().await;
            controller.race.race_status = RaceStatus::Racing;
            controller.race.start_time_monotonic = 100.0;
            controller.race.any_races_started = true;
        }
        (race, rx)
    }
}

/// Single consumer of the pass FIFO. Application code never observes a
/// half-processed pass: each item is handled to completion under the
/// controller lock before the next is taken.
pub fn spawn_race_input_task(
    race: Arc<Mutex<RaceController>>,
    mut rx: mpsc::UnboundedReceiver<RaceInput>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(input) = rx.recv().await {
            let mut controller = race.lock().await;
            match input {
                RaceInput::Pass {
                    node,
                    timestamp,
                    source,
                } => {
                    controller.process_pass(node, timestamp, source).await;
                }
                RaceInput::CrossingChange { node } => {
                    controller.handle_crossing_change(node);
                }
                RaceInput::LevelCaptured {
                    node,
                    is_enter,
                    level,
                } => {
                    controller.handle_level_captured(node, is_enter, level).await;
                }
                RaceInput::CheckWin(args) => {
                    controller.check_win_condition(args).await;
                }
            }
        }
    })
}
