use chrono::NaiveDateTime;
use std::fmt;
use tokio::sync::mpsc;

/// An application message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    topic: String,
    payload: Vec<u8>,
    timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(32).collect();
        write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        MQTTMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}

/// Lifecycle and message notifications from the broker session
///
/// The controller consumes these from a single stream instead of registering
/// callbacks on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// CONNACK received; the session now accepts subscriptions and waits
    /// for `subscriptions_issued` before it reports `Ready`
    SubscribePending,
    /// All standing subscriptions are acknowledged; publishing is allowed
    Ready,
    Message(MQTTMessage),
    /// A connection that got past CONNACK is gone
    Disconnected { reason: String },
}

/// Receiving half of the session event stream
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let msg = MQTTMessage::from_topic("homeassistant/cover/window1/set", "X".repeat(100));
        let rendered = msg.to_string();
        assert!(rendered.ends_with(&"X".repeat(32)));
        assert!(!rendered.contains(&"X".repeat(33)));
    }

    #[test]
    fn display_handles_short_and_binary_payloads() {
        let msg = MQTTMessage::from_topic("t", vec![0xff, b'O']);
        assert!(msg.to_string().contains("t: "));
        assert_eq!(msg.payload(), &[0xff, b'O']);
    }
}
