//! Streaming events and the sink abstraction.
//!
//! Each request produces an ordered, append-only event sequence ending in
//! exactly one `Done` or one terminal `Error`. Sinks are supplied by the
//! caller; the transport layer serializes events to its own wire format
//! (one event per SSE `data:` line, a WebSocket frame, etc.).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One event in a request's ordered stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Incremental output text from the active provider.
    Token { text: String },

    /// The chain advanced from one provider to the next.
    ProviderSwitch {
        from: String,
        to: String,
        /// Error kind that caused the switch (e.g. "timeout").
        reason: String,
    },

    /// An agent began working on the request.
    AgentTaskStart {
        id: Uuid,
        agent: String,
        description: String,
    },

    /// Coarse progress for dashboards.
    AgentTaskProgress { id: Uuid, fraction: f64 },

    /// The agent finished (successfully or not).
    AgentTaskDone { id: Uuid, success: bool },

    /// Terminal failure. Always the last event when present.
    Error {
        kind: String,
        message: String,
        recoverable: bool,
    },

    /// Terminal success. Always the last event when present.
    Done {
        final_text: String,
        metadata: serde_json::Value,
    },
}

impl Event {
    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Done { .. } | Event::Error { .. })
    }
}

/// Ordered event receiver supplied by the caller.
///
/// `emit` must be non-blocking and infallible from the core's perspective:
/// a sink whose consumer went away silently drops events (the supervisor's
/// terminal result is still returned to the caller).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        let _ = self.send(event);
    }
}

impl EventSink for tokio::sync::broadcast::Sender<Event> {
    fn emit(&self, event: Event) {
        let _ = self.send(event);
    }
}

/// Sink that buffers events in memory. Used by tests and batch callers
/// that only care about the final transcript.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events received so far, in emission order.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Concatenation of all `Token` text received so far.
    pub fn token_text(&self) -> String {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::Token { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(Event::Done {
            final_text: "x".into(),
            metadata: serde_json::Value::Null
        }
        .is_terminal());
        assert!(Event::Error {
            kind: "cancelled".into(),
            message: String::new(),
            recoverable: false
        }
        .is_terminal());
        assert!(!Event::Token { text: "x".into() }.is_terminal());
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_value(Event::Token { text: "hi".into() }).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["text"], "hi");

        let json = serde_json::to_value(Event::ProviderSwitch {
            from: "a".into(),
            to: "b".into(),
            reason: "timeout".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "provider_switch");
    }

    #[test]
    fn memory_sink_preserves_order() {
        let sink = MemorySink::new();
        sink.emit(Event::Token { text: "a".into() });
        sink.emit(Event::Token { text: "b".into() });
        assert_eq!(sink.token_text(), "ab");
    }
}
