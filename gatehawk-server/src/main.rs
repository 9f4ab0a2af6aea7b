use std::sync::Arc;

use clap::Parser;
use gatehawk_contracts::SecondaryMode;
use gatehawk_server::api;
use gatehawk_server::api::state::AppState;
use gatehawk_server::clock::{Clock, spawn_clock_watcher};
use gatehawk_server::cluster::ClusterCoordinator;
use gatehawk_server::db;
use gatehawk_server::db::store::Store;
use gatehawk_server::events::{Event, EventBus};
use gatehawk_server::node::mock::MockDriver;
use gatehawk_server::node::{NodeDriver, NodeIo, NodeManager};
use gatehawk_server::race::controller::spawn_heartbeat;
use gatehawk_server::race::{RaceController, spawn_race_input_task};
use gatehawk_server::results::cache::ResultsCache;
use gatehawk_server::ui::UiChannel;
use gatehawk_server::Services;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

#[derive(Parser)]
#[command(name = "gatehawk-server")]
#[command(about = "RF lap timing server - interprets node crossings and streams live race state")]
struct Args {
    /// HTTP/WebSocket server port
    #[arg(long, default_value = "5000")]
    port: u16,

    /// SQLite database path
    #[arg(long, default_value = "gatehawk.db")]
    db_path: String,

    /// Number of receiver nodes
    #[arg(long, default_value = "4")]
    nodes: usize,

    /// Split secondary timer address (host:port), repeatable
    #[arg(long = "split-secondary")]
    split_secondaries: Vec<String>,

    /// Mirror secondary timer address (host:port), repeatable
    #[arg(long = "mirror-secondary")]
    mirror_secondaries: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    // Database, with corrupt-state recovery
    let pool = db::open_with_recovery(&args.db_path).await?;

    let bus = Arc::new(EventBus::new());
    let results = Arc::new(ResultsCache::new());
    let store = Store::new(
        pool,
        bus.clone(),
        results.clone(),
        args.db_path.clone(),
        args.nodes,
    );
    store.init().await?;

    // Pass-record FIFO feeding the race pipeline
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let io = NodeIo::new(input_tx);

    // The hardware driver that produces samples is an external collaborator;
    // without one configured the mock keeps the UI usable.
    let driver: Arc<dyn NodeDriver> = Arc::new(MockDriver::new(io.clone()));
    let nodes = Arc::new(NodeManager::new(args.nodes, driver, bus.clone(), io.clone()));

    let clock = Arc::new(Clock::new());
    let services = Arc::new(Services {
        clock: clock.clone(),
        bus: bus.clone(),
        store,
        results,
        nodes,
        ui: UiChannel::new(),
    });

    // Race controller bound to the first heat
    let mut controller = RaceController::new(services.clone(), io.clone()).await?;
    let first_heat = services.store.list_heats().await?[0].id;
    controller.set_current_heat(first_heat).await?;
    let race = Arc::new(Mutex::new(controller));

    // Synchronous hook points for the LED and callout collaborators; the
    // core only guarantees ordered delivery.
    bus.subscribe(Event::RaceWin, |message| {
        tracing::info!(args = %message.args, "Race winner announced");
    });
    bus.subscribe(Event::RacePilotDone, |message| {
        tracing::info!(args = %message.args, "Pilot finished");
    });
    bus.subscribe(Event::CrossingEnter, |message| {
        tracing::debug!(args = %message.args, "Gate crossing entered");
    });
    bus.subscribe(Event::CrossingExit, |message| {
        tracing::debug!(args = %message.args, "Gate crossing exited");
    });

    bus.publish(Event::Startup, serde_json::json!({}));

    // Background tasks: pass FIFO consumer, heartbeat, clock drift watcher
    spawn_race_input_task(race.clone(), input_rx);
    spawn_heartbeat(race.clone());
    spawn_clock_watcher(clock.clone(), bus.clone());

    // Cluster: dial configured secondaries
    let mut secondaries: Vec<(String, SecondaryMode)> = Vec::new();
    for address in &args.split_secondaries {
        secondaries.push((address.clone(), SecondaryMode::Split));
    }
    for address in &args.mirror_secondaries {
        secondaries.push((address.clone(), SecondaryMode::Mirror));
    }
    let cluster = ClusterCoordinator::new(services.clone(), secondaries);
    cluster.spawn(race.clone());

    let state = AppState::new(services.clone(), race.clone(), cluster);
    let shutdown = state.shutdown.clone();

    let app = api::router(state);
    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(port = %args.port, nodes = args.nodes, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
            info!("Transport shutting down");
        })
        .await?;

    Ok(())
}
