pub mod api;
pub mod calibration;
pub mod clock;
pub mod cluster;
pub mod db;
pub mod events;
pub mod freq;
pub mod node;
pub mod race;
pub mod results;
pub mod ui;

use std::sync::Arc;

use crate::clock::Clock;
use crate::db::store::Store;
use crate::events::EventBus;
use crate::node::NodeManager;
use crate::results::cache::ResultsCache;
use crate::ui::UiChannel;

/// Shared services wired together at startup and passed as context.
pub struct Services {
    pub clock: Arc<Clock>,
    pub bus: Arc<EventBus>,
    pub store: Store,
    pub results: Arc<ResultsCache>,
    pub nodes: Arc<NodeManager>,
    pub ui: UiChannel,
}
