use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use gatehawk_contracts::ClusterMessage;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;

const MAX_ATTEMPTS: u32 = 8;
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

struct Pending {
    message: ClusterMessage,
    attempts: u32,
    last_sent: Option<Instant>,
}

/// Ordered queue of messages awaiting acknowledgement from the peer timer.
/// Messages are retried with exponential backoff; an unacknowledged message
/// is dropped after a bounded number of attempts so the queue cannot wedge.
pub struct SendAckQueue {
    pending: Mutex<VecDeque<Pending>>,
    pub notify: Notify,
}

impl SendAckQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, message: ClusterMessage) {
        self.pending
            .lock()
            .expect("ack queue poisoned")
            .push_back(Pending {
                message,
                attempts: 0,
                last_sent: None,
            });
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("ack queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Front message if it is due for (re)transmission. Marks the attempt.
    pub fn due_message(&self) -> Option<ClusterMessage> {
        let mut pending = self.pending.lock().expect("ack queue poisoned");
        loop {
            let front = pending.front_mut()?;
            if front.attempts >= MAX_ATTEMPTS {
                warn!(
                    message_type = front.message.message_type(),
                    attempts = front.attempts,
                    "Dropping unacknowledged cluster message"
                );
                pending.pop_front();
                continue;
            }
            let due = match front.last_sent {
                None => true,
                Some(sent) => sent.elapsed() >= backoff(front.attempts),
            };
            if !due {
                return None;
            }
            front.attempts += 1;
            front.last_sent = Some(Instant::now());
            return Some(front.message.clone());
        }
    }

    /// Interval after which the writer should poll for retransmissions.
    pub fn retry_interval(&self) -> Duration {
        BASE_BACKOFF
    }

    /// Acknowledge the front message when the type and identifying payload
    /// field match. Returns true when a message was retired.
    pub fn ack(&self, message_type: &str, payload: Option<&Value>) -> bool {
        let mut pending = self.pending.lock().expect("ack queue poisoned");
        let Some(front) = pending.front() else {
            return false;
        };
        if front.message.message_type() != message_type {
            return false;
        }
        if !payload_matches(&front.message, payload) {
            return false;
        }
        pending.pop_front();
        self.notify.notify_waiters();
        true
    }

    /// Reset retry state so the front message is sent again immediately
    /// (explicit operator retry).
    pub fn reset_backoff(&self) {
        let mut pending = self.pending.lock().expect("ack queue poisoned");
        if let Some(front) = pending.front_mut() {
            front.attempts = 0;
            front.last_sent = None;
        }
        self.notify.notify_waiters();
    }
}

impl Default for SendAckQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff(attempts: u32) -> Duration {
    let scaled = BASE_BACKOFF.saturating_mul(1u32 << attempts.min(6));
    scaled.min(MAX_BACKOFF)
}

/// The identifying field depends on the message: pass records match on the
/// lap timestamp, event triggers on the event name; everything else matches
/// unconditionally.
fn payload_matches(message: &ClusterMessage, payload: Option<&Value>) -> bool {
    match message {
        ClusterMessage::PassRecord(pass) => payload
            .and_then(|p| p.get("lap_time_stamp"))
            .and_then(Value::as_u64)
            .is_some_and(|stamp| stamp == pass.lap_time_stamp),
        ClusterMessage::ClusterEventTrigger { evt_name, .. } => payload
            .and_then(|p| p.get("evt_name"))
            .and_then(Value::as_str)
            .is_some_and(|name| name == evt_name),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehawk_contracts::PassRecord;

    fn pass(stamp: u64) -> ClusterMessage {
        ClusterMessage::PassRecord(PassRecord {
            node: 0,
            frequency: 5658,
            lap_time_stamp: stamp,
            rssi: None,
        })
    }

    #[test]
    fn messages_stay_ordered_until_acked() {
        let queue = SendAckQueue::new();
        queue.push(pass(1_000));
        queue.push(pass(2_000));

        // Front repeats until acknowledged; backoff keeps it quiet between
        // attempts.
        let first = queue.due_message().unwrap();
        assert!(matches!(first, ClusterMessage::PassRecord(ref p) if p.lap_time_stamp == 1_000));
        assert!(queue.due_message().is_none());

        assert!(queue.ack("pass_record", Some(&serde_json::json!({"lap_time_stamp": 1_000}))));
        let second = queue.due_message().unwrap();
        assert!(matches!(second, ClusterMessage::PassRecord(ref p) if p.lap_time_stamp == 2_000));
    }

    #[test]
    fn mismatched_ack_is_ignored() {
        let queue = SendAckQueue::new();
        queue.push(pass(1_000));
        let _ = queue.due_message();

        assert!(!queue.ack("pass_record", Some(&serde_json::json!({"lap_time_stamp": 999}))));
        assert!(!queue.ack("cluster_event_trigger", None));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn reset_backoff_makes_front_due_again() {
        let queue = SendAckQueue::new();
        queue.push(pass(1_000));
        let _ = queue.due_message();
        assert!(queue.due_message().is_none());

        queue.reset_backoff();
        assert!(queue.due_message().is_some());
    }

    #[test]
    fn unacknowledged_messages_drop_after_bound() {
        let queue = SendAckQueue::new();
        queue.push(pass(1_000));
        queue.push(pass(2_000));

        // Exhaust the front message's attempts.
        {
            let mut pending = queue.pending.lock().unwrap();
            let front = pending.front_mut().unwrap();
            front.attempts = MAX_ATTEMPTS;
            front.last_sent = None;
        }
        let next = queue.due_message().unwrap();
        assert!(matches!(next, ClusterMessage::PassRecord(ref p) if p.lap_time_stamp == 2_000));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn event_triggers_match_on_event_name() {
        let queue = SendAckQueue::new();
        queue.push(ClusterMessage::ClusterEventTrigger {
            evt_name: "RACE_STAGE".into(),
            evt_args: "{}".into(),
        });
        let _ = queue.due_message();

        assert!(!queue.ack(
            "cluster_event_trigger",
            Some(&serde_json::json!({"evt_name": "RACE_START"}))
        ));
        assert!(queue.ack(
            "cluster_event_trigger",
            Some(&serde_json::json!({"evt_name": "RACE_STAGE"}))
        ));
    }
}
