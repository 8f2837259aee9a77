//! Auto-iteration event broadcasting.
//!
//! Every stop transition of the loop is published as a JSON envelope
//! `{"channel", "task_id", "payload"}` on a `tokio::sync::broadcast`
//! channel. Publishing is fire-and-forget: with no subscribers the event
//! is dropped.

use autoloop_common::TaskVerificationResult;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Broadcast channel capacity.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum AutoIterateEvent {
    /// Iteration ceiling hit. Payload is the literal `"ask"`.
    MaxReached { task_id: i64 },
    ApprovalRequired { task_id: i64, count: u32 },
    Passed {
        task_id: i64,
        result: Box<TaskVerificationResult>,
    },
    ManualPending { task_id: i64, count: usize },
    Error { task_id: i64, message: String },
    Cancelled { task_id: i64 },
}

impl AutoIterateEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::MaxReached { .. } => "autoIterate:maxReached",
            Self::ApprovalRequired { .. } => "autoIterate:approvalRequired",
            Self::Passed { .. } => "autoIterate:passed",
            Self::ManualPending { .. } => "autoIterate:manualPending",
            Self::Error { .. } => "autoIterate:error",
            Self::Cancelled { .. } => "autoIterate:cancelled",
        }
    }

    pub fn task_id(&self) -> i64 {
        match self {
            Self::MaxReached { task_id }
            | Self::ApprovalRequired { task_id, .. }
            | Self::Passed { task_id, .. }
            | Self::ManualPending { task_id, .. }
            | Self::Error { task_id, .. }
            | Self::Cancelled { task_id } => *task_id,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::MaxReached { .. } => serde_json::Value::from("ask"),
            Self::ApprovalRequired { count, .. } => serde_json::Value::from(*count),
            Self::Passed { result, .. } => {
                serde_json::to_value(result.as_ref()).unwrap_or(serde_json::Value::Null)
            }
            Self::ManualPending { count, .. } => serde_json::Value::from(*count),
            Self::Error { message, .. } => serde_json::Value::from(message.as_str()),
            Self::Cancelled { .. } => serde_json::Value::Null,
        }
    }

    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            channel: self.channel().to_string(),
            task_id: self.task_id(),
            payload: self.payload(),
        }
    }
}

/// Wire form of one broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub channel: String,
    pub task_id: i64,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, event: &AutoIterateEvent) {
        debug!(channel = event.channel(), task_id = event.task_id(), "broadcast");
        broadcast_message(&self.tx, &event.envelope());
    }
}

pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &EventEnvelope) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            error!("Failed to serialize event envelope: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv(rx: &mut broadcast::Receiver<String>) -> EventEnvelope {
        let raw = rx.try_recv().expect("event broadcast");
        serde_json::from_str(&raw).expect("valid envelope")
    }

    #[test]
    fn test_max_reached_payload_is_ask() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.broadcast(&AutoIterateEvent::MaxReached { task_id: 3 });
        let env = recv(&mut rx);
        assert_eq!(env.channel, "autoIterate:maxReached");
        assert_eq!(env.task_id, 3);
        assert_eq!(env.payload, serde_json::json!("ask"));
    }

    #[test]
    fn test_approval_required_carries_count() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.broadcast(&AutoIterateEvent::ApprovalRequired {
            task_id: 1,
            count: 2,
        });
        let env = recv(&mut rx);
        assert_eq!(env.channel, "autoIterate:approvalRequired");
        assert_eq!(env.payload, serde_json::json!(2));
    }

    #[test]
    fn test_passed_payload_is_result() {
        let result = TaskVerificationResult::empty(9);
        let event = AutoIterateEvent::Passed {
            task_id: 9,
            result: Box::new(result.clone()),
        };
        let back: TaskVerificationResult = serde_json::from_value(event.payload()).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.broadcast(&AutoIterateEvent::Cancelled { task_id: 1 });
    }

    #[test]
    fn test_channel_names() {
        let cases = [
            (AutoIterateEvent::ManualPending { task_id: 1, count: 1 }, "autoIterate:manualPending"),
            (
                AutoIterateEvent::Error {
                    task_id: 1,
                    message: "x".into(),
                },
                "autoIterate:error",
            ),
            (AutoIterateEvent::Cancelled { task_id: 1 }, "autoIterate:cancelled"),
        ];
        for (event, channel) in cases {
            assert_eq!(event.channel(), channel);
        }
    }
}
