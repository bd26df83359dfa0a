//! Events pushed by the resource manager.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::offer::{InverseOffer, Offer};
use crate::status::TaskStatus;

/// An inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Subscribed {
        framework_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat_interval_seconds: Option<f64>,
    },
    Offers {
        offers: Vec<Offer>,
    },
    InverseOffers {
        inverse_offers: Vec<InverseOffer>,
    },
    Rescind {
        offer_id: String,
    },
    RescindInverseOffer {
        inverse_offer_id: String,
    },
    Update {
        status: TaskStatus,
    },
    Message {
        agent_id: String,
        #[serde(default)]
        executor_id: Option<String>,
        data: String,
    },
    Failure {
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        executor_id: Option<String>,
        #[serde(default)]
        status: Option<i32>,
    },
    Error {
        message: String,
    },
    Heartbeat,
}

impl Event {
    /// Decode one JSON-encoded event.
    pub fn from_json(raw: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Subscribed { .. } => EventKind::Subscribed,
            Event::Offers { .. } => EventKind::Offers,
            Event::InverseOffers { .. } => EventKind::InverseOffers,
            Event::Rescind { .. } => EventKind::Rescind,
            Event::RescindInverseOffer { .. } => EventKind::RescindInverseOffer,
            Event::Update { .. } => EventKind::Update,
            Event::Message { .. } => EventKind::Message,
            Event::Failure { .. } => EventKind::Failure,
            Event::Error { .. } => EventKind::Error,
            Event::Heartbeat => EventKind::Heartbeat,
        }
    }
}

/// Discriminant of [`Event`], used to key handler tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Subscribed,
    Offers,
    InverseOffers,
    Rescind,
    RescindInverseOffer,
    Update,
    Message,
    Failure,
    Error,
    Heartbeat,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Subscribed,
        EventKind::Offers,
        EventKind::InverseOffers,
        EventKind::Rescind,
        EventKind::RescindInverseOffer,
        EventKind::Update,
        EventKind::Message,
        EventKind::Failure,
        EventKind::Error,
        EventKind::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Subscribed => "SUBSCRIBED",
            EventKind::Offers => "OFFERS",
            EventKind::InverseOffers => "INVERSE_OFFERS",
            EventKind::Rescind => "RESCIND",
            EventKind::RescindInverseOffer => "RESCIND_INVERSE_OFFER",
            EventKind::Update => "UPDATE",
            EventKind::Message => "MESSAGE",
            EventKind::Failure => "FAILURE",
            EventKind::Error => "ERROR",
            EventKind::Heartbeat => "HEARTBEAT",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TaskState;

    #[test]
    fn test_decode_update() {
        let event = Event::from_json(
            r#"{"type":"UPDATE","status":{"task_id":"fw.web-1.a","state":"TASK_RUNNING","uuid":"u1"}}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), EventKind::Update);
        match event {
            Event::Update { status } => {
                assert_eq!(status.state, TaskState::Running);
                assert_eq!(status.uuid.as_deref(), Some("u1"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_heartbeat_and_subscribed() {
        assert_eq!(
            Event::from_json(r#"{"type":"HEARTBEAT"}"#).unwrap(),
            Event::Heartbeat
        );
        let event = Event::from_json(r#"{"type":"SUBSCRIBED","framework_id":"fw-1"}"#).unwrap();
        assert_eq!(event.kind(), EventKind::Subscribed);
    }

    #[test]
    fn test_decode_error() {
        assert!(matches!(
            Event::from_json(r#"{"type":"NOPE"}"#),
            Err(EventError::Decode(_))
        ));
    }

    #[test]
    fn test_kind_wire_names_match_tags() {
        let event = Event::Rescind {
            offer_id: "o1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind().as_str());
        assert_eq!(EventKind::ALL.len(), 10);
    }
}
