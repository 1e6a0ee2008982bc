//! Domain events and the sinks that receive them.
//!
//! Events are emitted only after the snapshot that produced them has
//! committed. Sinks are fire-and-forget: a sink can never fail a request.

use serde::Serialize;
use timebank_storage::{HandshakeRecord, ReportRecord};
use tokio::sync::broadcast;

/// Handshake lifecycle events produced by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeEvent {
    Created,
    Accepted,
    Completed,
    Cancelled,
    Disputed,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    #[serde(rename = "handshake.created")]
    HandshakeCreated { handshake: HandshakeRecord },
    #[serde(rename = "handshake.accepted")]
    HandshakeAccepted { handshake: HandshakeRecord },
    #[serde(rename = "handshake.completed")]
    HandshakeCompleted { handshake: HandshakeRecord },
    #[serde(rename = "handshake.cancelled")]
    HandshakeCancelled { handshake: HandshakeRecord },
    #[serde(rename = "handshake.disputed")]
    HandshakeDisputed {
        handshake: HandshakeRecord,
        report_id: Option<String>,
    },
    #[serde(rename = "handshake.paused")]
    HandshakePaused { handshake: HandshakeRecord },
    #[serde(rename = "report.resolved")]
    ReportResolved { report: ReportRecord },
    #[serde(rename = "user.warned")]
    UserWarned { user_id: String, message: String },
    #[serde(rename = "user.banned")]
    UserBanned { user_id: String },
    #[serde(rename = "user.unbanned")]
    UserUnbanned { user_id: String },
}

impl DomainEvent {
    pub fn handshake(event: HandshakeEvent, handshake: HandshakeRecord) -> Self {
        match event {
            HandshakeEvent::Created => DomainEvent::HandshakeCreated { handshake },
            HandshakeEvent::Accepted => DomainEvent::HandshakeAccepted { handshake },
            HandshakeEvent::Completed => DomainEvent::HandshakeCompleted { handshake },
            HandshakeEvent::Cancelled => DomainEvent::HandshakeCancelled { handshake },
            HandshakeEvent::Disputed => DomainEvent::HandshakeDisputed {
                handshake,
                report_id: None,
            },
            HandshakeEvent::Paused => DomainEvent::HandshakePaused { handshake },
        }
    }

    /// Dotted event name, e.g. `handshake.completed`.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::HandshakeCreated { .. } => "handshake.created",
            DomainEvent::HandshakeAccepted { .. } => "handshake.accepted",
            DomainEvent::HandshakeCompleted { .. } => "handshake.completed",
            DomainEvent::HandshakeCancelled { .. } => "handshake.cancelled",
            DomainEvent::HandshakeDisputed { .. } => "handshake.disputed",
            DomainEvent::HandshakePaused { .. } => "handshake.paused",
            DomainEvent::ReportResolved { .. } => "report.resolved",
            DomainEvent::UserWarned { .. } => "user.warned",
            DomainEvent::UserBanned { .. } => "user.banned",
            DomainEvent::UserUnbanned { .. } => "user.unbanned",
        }
    }

    /// Id of the record or user the event is about.
    pub fn subject_id(&self) -> &str {
        match self {
            DomainEvent::HandshakeCreated { handshake }
            | DomainEvent::HandshakeAccepted { handshake }
            | DomainEvent::HandshakeCompleted { handshake }
            | DomainEvent::HandshakeCancelled { handshake }
            | DomainEvent::HandshakeDisputed { handshake, .. }
            | DomainEvent::HandshakePaused { handshake } => &handshake.id,
            DomainEvent::ReportResolved { report } => &report.id,
            DomainEvent::UserWarned { user_id, .. }
            | DomainEvent::UserBanned { user_id }
            | DomainEvent::UserUnbanned { user_id } => user_id,
        }
    }
}

/// Receiver of committed domain events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// Writes one structured log line per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: DomainEvent) {
        tracing::info!(event = event.name(), subject = event.subject_id(), "domain event");
    }
}

/// Fans events out to in-process subscribers.
///
/// Events sent while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: DomainEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_dotted_type() {
        let event = DomainEvent::UserBanned {
            user_id: "mallory".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user.banned");
        assert_eq!(json["user_id"], "mallory");
        assert_eq!(event.name(), "user.banned");
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(DomainEvent::UserWarned {
            user_id: "mallory".into(),
            message: "be nice".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.subject_id(), "mallory");
    }

    #[test]
    fn broadcast_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(1);
        sink.emit(DomainEvent::UserUnbanned {
            user_id: "mallory".into(),
        });
    }
}
