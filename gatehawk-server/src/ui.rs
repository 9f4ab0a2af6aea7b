use std::sync::Arc;

use gatehawk_contracts::ServerPush;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast channel feeding every connected browser session. Session-scoped
/// replies (`load_data`, `pi_time`) never go through here; they are written
/// directly to the requesting socket.
#[derive(Clone)]
pub struct UiChannel {
    tx: broadcast::Sender<Arc<ServerPush>>,
}

impl UiChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ServerPush>> {
        self.tx.subscribe()
    }

    pub fn push(&self, push: ServerPush) {
        if self.tx.send(Arc::new(push)).is_err() {
            debug!("UI push with no connected sessions");
        }
    }

    pub fn emit_priority_message(&self, message: impl Into<String>, interrupt: bool) {
        self.push(ServerPush::PriorityMessage {
            message: message.into(),
            interrupt,
        });
    }
}

impl Default for UiChannel {
    fn default() -> Self {
        Self::new()
    }
}
