use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use gatehawk_contracts::{ClusterMessage, CommandEnvelope, SecondaryMode, ServerPush};
use serde_json::Value;
use tokio::select;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::commands;
use super::state::AppState;
use crate::cluster::ack::SendAckQueue;
use crate::events::Event;
use crate::race::controller::{spawn_deferred_stop, stage_and_arm};
use crate::race::state::RaceStatus;
use crate::results::leaderboard::Leaderboard;

/// WebSocket upgrade handler. Browser sessions and primary-timer links
/// share the endpoint; the first cluster message marks a session as a
/// primary link.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

struct Session {
    /// Set when a primary timer joined the cluster through this socket.
    link_mode: Option<SecondaryMode>,
    joined_before: bool,
    /// Acknowledged channel towards the primary (pass records).
    queue: Arc<SendAckQueue>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");
    let (mut sender, mut receiver) = socket.split();

    // Full snapshot for newly connected clients.
    match commands::system::load_data(&state, &[]).await {
        Ok(replies) => {
            for push in replies {
                if send_push(&mut sender, &push).await.is_err() {
                    return;
                }
            }
        }
        Err(error) => warn!(error = %error, "Failed to build connect snapshot"),
    }

    let mut session = Session {
        link_mode: None,
        joined_before: false,
        queue: Arc::new(SendAckQueue::new()),
    };

    let mut ui_rx = state.services.ui.subscribe();
    let mut bus_rx = state.services.bus.listen();
    let mut retry = interval(session.queue.retry_interval());
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        select! {
            push = ui_rx.recv() => {
                match push {
                    Ok(push) => {
                        if send_push(&mut sender, push.as_ref()).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagging on pushes");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            event = bus_rx.recv() => {
                if let Ok(message) = event {
                    // A split secondary reports every locally recorded pass
                    // upstream on the acknowledged queue. Events republished
                    // from the primary are marked and never echo back.
                    if session.link_mode == Some(SecondaryMode::Split)
                        && message.event == Event::RaceLapRecorded
                        && message.args.get("from_primary").is_none()
                    {
                        if let Some(pass) = pass_record_from_lap(&message.args) {
                            session.queue.push(ClusterMessage::PassRecord(pass));
                        }
                    }
                    // A clock resync updates the program start epoch the
                    // joined primary knows about.
                    if session.link_mode.is_some()
                        && message.event == Event::ClusterJoin
                        && message.args.get("resync").and_then(Value::as_bool) == Some(true)
                    {
                        let response = ClusterMessage::JoinClusterResponse {
                            server_info: state.server_info(),
                        };
                        if send_cluster(&mut sender, &response).await.is_err() {
                            break;
                        }
                    }
                }
            }
            _ = retry.tick(), if session.link_mode.is_some() => {
                while let Some(message) = session.queue.due_message() {
                    if send_cluster(&mut sender, &message).await.is_err() {
                        return;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let replies = handle_text(&state, &mut session, &text).await;
                        for reply in replies {
                            if sender.send(WsMessage::text(reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(error = %error, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    if session.link_mode.is_some() {
        info!("Primary timer link disconnected");
    } else {
        info!("WebSocket client disconnected");
    }
}

async fn send_push(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    push: &ServerPush,
) -> Result<(), ()> {
    match serde_json::to_string(push) {
        Ok(json) => sender.send(WsMessage::text(json)).await.map_err(|_| ()),
        Err(error) => {
            warn!(error = %error, "Failed to serialize push");
            Ok(())
        }
    }
}

async fn send_cluster(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    message: &ClusterMessage,
) -> Result<(), ()> {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(WsMessage::text(json)).await.map_err(|_| ()),
        Err(error) => {
            warn!(error = %error, "Failed to serialize cluster message");
            Ok(())
        }
    }
}

/// One inbound text frame: cluster traffic first, then client commands.
async fn handle_text(state: &AppState, session: &mut Session, text: &str) -> Vec<String> {
    if let Ok(message) = serde_json::from_str::<ClusterMessage>(text) {
        let responses = handle_cluster_message(state, session, message).await;
        return responses
            .iter()
            .filter_map(|m| serde_json::to_string(m).ok())
            .collect();
    }

    match serde_json::from_str::<CommandEnvelope>(text) {
        Ok(envelope) => match commands::dispatch(state, envelope.command).await {
            Ok(replies) => replies
                .iter()
                .filter_map(|p| serde_json::to_string(p).ok())
                .collect(),
            Err(error) => {
                // Validation and conflict errors go back to the requester
                // as a priority message; the mutation was refused.
                info!(error = %error, "Command refused");
                serde_json::to_string(&ServerPush::PriorityMessage {
                    message: error.to_string(),
                    interrupt: true,
                })
                .into_iter()
                .collect()
            }
        },
        Err(error) => {
            debug!(error = %error, "Unparsable WebSocket message");
            Vec::new()
        }
    }
}

/// Secondary-side cluster protocol: a primary timer has dialed us.
async fn handle_cluster_message(
    state: &AppState,
    session: &mut Session,
    message: ClusterMessage,
) -> Vec<ClusterMessage> {
    match message {
        ClusterMessage::JoinCluster => {
            session.link_mode = Some(SecondaryMode::Split);
            join_as_secondary(state, session, SecondaryMode::Split).await;
            Vec::new()
        }
        ClusterMessage::JoinClusterEx { mode } => {
            session.link_mode = Some(mode);
            join_as_secondary(state, session, mode).await;
            vec![ClusterMessage::JoinClusterResponse {
                server_info: state.server_info(),
            }]
        }
        ClusterMessage::CheckSecondaryQuery => {
            let clock = &state.services.clock;
            vec![ClusterMessage::CheckSecondaryResponse {
                timestamp: clock.to_epoch_millis(clock.now()),
            }]
        }
        ClusterMessage::ClusterEventTrigger { evt_name, evt_args } => {
            handle_event_trigger(state, session, &evt_name, &evt_args).await;
            Vec::new()
        }
        ClusterMessage::ClusterMessageAck {
            message_type,
            message_payload,
        } => {
            session
                .queue
                .ack(&message_type, message_payload.as_ref());
            Vec::new()
        }
        other => {
            debug!(message_type = other.message_type(), "Ignoring cluster message");
            Vec::new()
        }
    }
}

async fn join_as_secondary(state: &AppState, session: &mut Session, mode: SecondaryMode) {
    info!(?mode, "Joined cluster");

    if mode == SecondaryMode::Split && !session.joined_before {
        // First join with race history: snapshot the database and clear
        // races so split timing starts clean.
        let store = &state.services.store;
        match store.count_saved_races().await {
            Ok(count) if count > 0 => {
                info!("Making database auto-backup and clearing races on split timer");
                if let Err(error) = store
                    .backup_database(crate::db::store::AUTO_BACKUP_PREFIX)
                    .await
                {
                    warn!(error = %error, "Auto-backup on cluster join failed");
                }
                if let Err(error) = store.clear_race_data().await {
                    warn!(error = %error, "Clearing race data on cluster join failed");
                }
                store.prune_auto_backups();
            }
            Ok(_) => {}
            Err(error) => warn!(error = %error, "Could not inspect race history on join"),
        }
    }
    session.joined_before = true;

    {
        let mut controller = state.race.lock().await;
        controller.set_secondary_mode(Some(mode));
        controller.push_race_status();
    }

    state.services.bus.publish(
        Event::ClusterJoin,
        serde_json::json!({ "message": "Joined cluster" }),
    );
}

/// Apply a forwarded event from the primary. Mirror mode applies race
/// status side effects; split mode mirrors the race lifecycle with its own
/// timing. `STARTUP` and `LED_SET_MANUAL` are never republished.
async fn handle_event_trigger(state: &AppState, session: &Session, evt_name: &str, evt_args: &str) {
    let Some(event) = Event::parse(evt_name) else {
        debug!(evt_name, "Unknown forwarded event");
        return;
    };
    let mut args: Value = serde_json::from_str(evt_args).unwrap_or(Value::Null);
    // Never republish the primary's race object locally, and tag the
    // payload so local subscribers can tell it came from the primary.
    if let Some(object) = args.as_object_mut() {
        object.remove("race");
        object.insert("from_primary".to_string(), Value::Bool(true));
    }

    match session.link_mode {
        Some(SecondaryMode::Mirror) => {
            let mut controller = state.race.lock().await;
            match event {
                Event::RaceStage => {
                    controller.race.race_status = RaceStatus::Staging;
                    controller.race.clear_results();
                }
                Event::RaceStart => controller.race.race_status = RaceStatus::Racing,
                Event::RaceStop => controller.race.race_status = RaceStatus::Done,
                Event::LapsClear => controller.race.race_status = RaceStatus::Ready,
                Event::RaceLapRecorded => {
                    if let Some(results) = args.get("results") {
                        if let Ok(board) =
                            serde_json::from_value::<Leaderboard>(results.clone())
                        {
                            controller.race.results = Some(Arc::new(board));
                        }
                    }
                }
                _ => {}
            }
            controller.push_race_status();
        }
        Some(SecondaryMode::Split) => match event {
            Event::RaceStage => {
                if let Err(error) = stage_and_arm(&state.race).await {
                    warn!(error = %error, "Split secondary failed to stage");
                }
            }
            Event::RaceStop => {
                let deferred = {
                    let mut controller = state.race.lock().await;
                    controller.stop_race(false).await.unwrap_or(false)
                };
                if deferred {
                    spawn_deferred_stop(state.race.clone(), false);
                }
            }
            Event::LapsSave => {
                let mut controller = state.race.lock().await;
                if let Err(error) = controller.save_laps().await {
                    warn!(error = %error, "Split secondary failed to save laps");
                }
            }
            Event::LapsDiscard => {
                let mut controller = state.race.lock().await;
                if let Err(error) = controller.discard_laps(false).await {
                    warn!(error = %error, "Split secondary failed to discard laps");
                }
            }
            _ => {}
        },
        None => {}
    }

    match event {
        Event::Startup => {}
        Event::LedSetManual => {
            // LED control from the primary routes through the manual effect.
            if args.get("effect").is_some() {
                state.services.bus.publish(Event::LedManual, args);
            }
        }
        _ => state.services.bus.publish(event, args),
    }
}

/// Build the advisory pass record for the primary from a recorded lap.
fn pass_record_from_lap(args: &Value) -> Option<gatehawk_contracts::PassRecord> {
    let node = args.get("node_index")?.as_u64()? as usize;
    let frequency = args.get("frequency")?.as_u64()? as u32;
    let lap = args.get("lap")?;
    Some(gatehawk_contracts::PassRecord {
        node,
        frequency,
        lap_time_stamp: lap.get("lap_time_stamp")?.as_i64()?.max(0) as u64,
        rssi: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_record_extraction_from_lap_event() {
        let args = serde_json::json!({
            "node_index": 2,
            "frequency": 5843,
            "lap": { "lap_number": 1, "lap_time_stamp": 31450, "lap_time": 29450 },
        });
        let pass = pass_record_from_lap(&args).unwrap();
        assert_eq!(pass.node, 2);
        assert_eq!(pass.frequency, 5843);
        assert_eq!(pass.lap_time_stamp, 31_450);

        assert!(pass_record_from_lap(&serde_json::json!({})).is_none());
    }
}
