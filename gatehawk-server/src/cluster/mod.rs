pub mod ack;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use gatehawk_contracts::{ClusterMessage, SecondaryMode, ServerPush};
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, interval, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::Services;
use crate::race::RaceController;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);
const STATUS_PUSH_INTERVAL: Duration = Duration::from_secs(4);

/// One configured secondary timer as seen from the primary.
pub struct Secondary {
    pub id: usize,
    pub address: String,
    pub mode: SecondaryMode,
    pub connected: AtomicBool,
    pub latency_ms: AtomicI64,
    reconnect: Notify,
}

impl Secondary {
    fn status(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "address": self.address,
            "mode": self.mode,
            "connected": self.connected.load(Ordering::Relaxed),
            "latency_ms": self.latency_ms.load(Ordering::Relaxed),
        })
    }
}

/// Primary side of the cluster: dials each configured secondary, forwards
/// selected events, runs liveness checks, and collects split passes.
pub struct ClusterCoordinator {
    services: Arc<Services>,
    secondaries: Vec<Arc<Secondary>>,
}

impl ClusterCoordinator {
    pub fn new(services: Arc<Services>, configured: Vec<(String, SecondaryMode)>) -> Arc<Self> {
        let secondaries = configured
            .into_iter()
            .enumerate()
            .map(|(id, (address, mode))| {
                Arc::new(Secondary {
                    id,
                    address,
                    mode,
                    connected: AtomicBool::new(false),
                    latency_ms: AtomicI64::new(-1),
                    reconnect: Notify::new(),
                })
            })
            .collect();
        Arc::new(Self {
            services,
            secondaries,
        })
    }

    pub fn has_secondaries(&self) -> bool {
        !self.secondaries.is_empty()
    }

    /// Drop the current connection to a secondary and dial again.
    pub fn retry_secondary(&self, id: usize) -> bool {
        match self.secondaries.get(id) {
            Some(secondary) => {
                info!(id, address = %secondary.address, "Retrying secondary connection");
                secondary.reconnect.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> Vec<serde_json::Value> {
        self.secondaries.iter().map(|s| s.status()).collect()
    }

    pub fn spawn(self: &Arc<Self>, race: Arc<Mutex<RaceController>>) {
        for secondary in &self.secondaries {
            tokio::spawn(run_secondary_link(
                self.services.clone(),
                race.clone(),
                secondary.clone(),
            ));
        }

        if self.has_secondaries() {
            let coordinator = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(STATUS_PUSH_INTERVAL);
                loop {
                    tick.tick().await;
                    coordinator.services.ui.push(ServerPush::ClusterStatus {
                        secondaries: coordinator.status(),
                    });
                }
            });
        }
    }
}

/// Connection loop for one secondary: join, forward events, check liveness,
/// collect split passes. Reconnects with a fixed delay on any failure.
async fn run_secondary_link(
    services: Arc<Services>,
    race: Arc<Mutex<RaceController>>,
    secondary: Arc<Secondary>,
) {
    loop {
        let url = format!("ws://{}/ws", secondary.address);
        info!(id = secondary.id, url = %url, "Connecting to secondary timer");

        match connect_async(&url).await {
            Ok((socket, _response)) => {
                secondary.connected.store(true, Ordering::Relaxed);
                if let Err(error) =
                    drive_secondary_link(&services, &race, &secondary, socket).await
                {
                    warn!(id = secondary.id, error = %error, "Secondary link lost");
                }
                secondary.connected.store(false, Ordering::Relaxed);
            }
            Err(error) => {
                debug!(id = secondary.id, error = %error, "Failed to connect to secondary");
            }
        }

        sleep(RECONNECT_DELAY).await;
    }
}

async fn drive_secondary_link(
    services: &Arc<Services>,
    race: &Arc<Mutex<RaceController>>,
    secondary: &Arc<Secondary>,
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> anyhow::Result<()> {
    let (mut sink, mut stream) = socket.split();

    let join = ClusterMessage::JoinClusterEx {
        mode: secondary.mode,
    };
    sink.send(WsMessage::text(serde_json::to_string(&join)?)).await?;

    let mut events = services.bus.listen();
    let mut liveness = interval(LIVENESS_INTERVAL);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut query_sent: Option<Instant> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(message) = incoming else {
                    anyhow::bail!("connection closed by secondary");
                };
                let message = message?;
                let WsMessage::Text(text) = message else {
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<ClusterMessage>(&text) else {
                    debug!(id = secondary.id, "Unparsable message from secondary");
                    continue;
                };
                match parsed {
                    ClusterMessage::JoinClusterResponse { server_info } => {
                        info!(
                            id = secondary.id,
                            version = %server_info.version,
                            prog_start_epoch = %server_info.prog_start_epoch,
                            "Secondary joined cluster"
                        );
                    }
                    ClusterMessage::CheckSecondaryResponse { .. } => {
                        if let Some(sent) = query_sent.take() {
                            let latency = sent.elapsed().as_millis() as i64;
                            secondary.latency_ms.store(latency, Ordering::Relaxed);
                            info!(id = secondary.id, latency_ms = latency, "Secondary round trip");
                        }
                    }
                    ClusterMessage::PassRecord(pass) => {
                        if secondary.mode == SecondaryMode::Split {
                            let mut controller = race.lock().await;
                            controller.record_split(pass.node, pass.lap_time_stamp as i64);
                        }
                        let ack = ClusterMessage::ClusterMessageAck {
                            message_type: "pass_record".into(),
                            message_payload: Some(json!({
                                "lap_time_stamp": pass.lap_time_stamp,
                            })),
                        };
                        sink.send(WsMessage::text(serde_json::to_string(&ack)?)).await?;
                    }
                    other => {
                        debug!(id = secondary.id, message_type = other.message_type(), "Ignoring message from secondary");
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(message) if message.event.forwarded_to_cluster() => {
                        let trigger = ClusterMessage::ClusterEventTrigger {
                            evt_name: message.event.as_str().to_string(),
                            evt_args: message.args.to_string(),
                        };
                        sink.send(WsMessage::text(serde_json::to_string(&trigger)?)).await?;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(id = secondary.id, skipped, "Secondary event forwarding lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        anyhow::bail!("event bus closed");
                    }
                }
            }
            _ = liveness.tick() => {
                query_sent = Some(Instant::now());
                let query = ClusterMessage::CheckSecondaryQuery;
                sink.send(WsMessage::text(serde_json::to_string(&query)?)).await?;
            }
            _ = secondary.reconnect.notified() => {
                anyhow::bail!("reconnect requested");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::test_support::build_controller;

    #[tokio::test]
    async fn coordinator_tracks_configured_secondaries() {
        let (race, _rx) = build_controller().await;
        let services = race.lock().await.services.clone();

        let coordinator = ClusterCoordinator::new(
            services,
            vec![
                ("10.0.0.2:5000".into(), SecondaryMode::Split),
                ("10.0.0.3:5000".into(), SecondaryMode::Mirror),
            ],
        );

        assert!(coordinator.has_secondaries());
        let status = coordinator.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0]["mode"], "split");
        assert_eq!(status[1]["mode"], "mirror");
        assert_eq!(status[0]["connected"], false);

        assert!(coordinator.retry_secondary(1));
        assert!(!coordinator.retry_secondary(5));
    }
}
