//! Wire protocol for client-server communication.

use phonelink_core::{PhoneNumber, SessionEvent};
use serde::{Deserialize, Serialize};

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Follow one number's session events, replacing any earlier subscription.
    Subscribe { phone: String, country_code: u16 },
    /// Stop following events.
    Unsubscribe,
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Number named by a `Subscribe` message.
    #[must_use]
    pub fn subscription(&self) -> Option<PhoneNumber> {
        if let Self::Subscribe {
            phone,
            country_code,
        } = self
        {
            Some(PhoneNumber::new(phone.clone(), *country_code))
        } else {
            None
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription accepted; buffered history follows.
    Subscribed { phone: String, country_code: u16 },
    /// Session event for the subscribed number.
    Event {
        phone: String,
        country_code: u16,
        event: SessionEvent,
    },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Acknowledge a subscription to `number`.
    #[must_use]
    pub fn subscribed(number: &PhoneNumber) -> Self {
        Self::Subscribed {
            phone: number.phone.clone(),
            country_code: number.country_code,
        }
    }

    /// Wrap an event published for `number`.
    #[must_use]
    pub fn event(number: &PhoneNumber, event: SessionEvent) -> Self {
        Self::Event {
            phone: number.phone.clone(),
            country_code: number.country_code,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_subscribe_parses() {
        let parsed: ClientMessage = serde_json::from_value(json!({
            "type": "subscribe",
            "phone": "6281234567890",
            "country_code": 62
        }))
        .unwrap();

        assert_eq!(
            parsed.subscription(),
            Some(PhoneNumber::new("6281234567890", 62))
        );
        assert_eq!(ClientMessage::Ping.subscription(), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let parsed = serde_json::from_value::<ClientMessage>(json!({ "type": "activate" }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let number = PhoneNumber::new("6281234567890", 62);
        let msg = ServerMessage::event(
            &number,
            SessionEvent::HandshakeCode {
                code: "2@abc".to_string(),
            },
        );

        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "event",
                "phone": "6281234567890",
                "country_code": 62,
                "event": { "type": "handshake_code", "code": "2@abc" }
            })
        );
    }

    #[test]
    fn test_unit_messages() {
        assert_eq!(
            serde_json::to_string(&ServerMessage::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"unsubscribe"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::Unsubscribe);
    }
}
