use std::sync::Arc;

use gatehawk_contracts::ServerInfo;
use tokio::sync::{Mutex, Notify};

use crate::Services;
use crate::cluster::ClusterCoordinator;
use crate::race::RaceController;

/// Shared application state available to all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    /// The race controller (mutable, behind a mutex for shared access).
    pub race: Arc<Mutex<RaceController>>,
    pub cluster: Arc<ClusterCoordinator>,
    /// Signalled by shutdown/reboot/kill commands to stop the transport.
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(
        services: Arc<Services>,
        race: Arc<Mutex<RaceController>>,
        cluster: Arc<ClusterCoordinator>,
    ) -> Self {
        Self {
            services,
            race,
            cluster,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Identity payload sent on cluster join and in the client snapshot.
    pub fn server_info(&self) -> ServerInfo {
        let prog_start_epoch = self.services.clock.program_start_epoch_ms();
        let prog_start_time = chrono::DateTime::from_timestamp_millis(prog_start_epoch)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            node_count: self.services.nodes.node_count(),
            prog_start_epoch: prog_start_epoch.to_string(),
            prog_start_time,
        }
    }
}
