use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Notification delivered to whoever drives the proxy (UI, CLI, tests)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProxyEvent {
    /// Lifecycle or progress notice
    Status {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Failure the operator should see
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProxyEvent {
    pub fn status(message: impl Into<String>) -> Self {
        ProxyEvent::Status {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ProxyEvent::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProxyEvent::Status { message, .. } | ProxyEvent::Error { message, .. } => message,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProxyEvent::Error { .. })
    }
}

/// Fan-out sender for proxy events
///
/// Sending never blocks; events are dropped when nobody is subscribed and
/// slow subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<ProxyEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.sender.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(ProxyEvent::status(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(ProxyEvent::error(message));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_delivers_to_every_subscriber() {
        let sink = EventSink::new(8);
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();

        sink.status("Proxy running");
        sink.error("Bind failed");

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.unwrap();
            assert!(!event.is_error());
            assert_eq!(event.message(), "Proxy running");

            let event = rx.recv().await.unwrap();
            assert!(event.is_error());
            assert_eq!(event.message(), "Bind failed");
        }
    }

    #[test]
    fn test_sink_without_subscribers_does_not_fail() {
        let sink = EventSink::default();
        sink.status("nobody listening");
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = ProxyEvent::error("upstream down");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "error");
        assert_eq!(value["message"], "upstream down");
        assert!(value["timestamp"].is_string());
    }
}
