//! Nostr relay protocol frames (NIP-01) and relay-layer types.

use serde_json::Value;
use thiserror::Error;

use crate::types::{Event, Filter};

/// Client-to-relay frames.
#[derive(Clone, Debug)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Event),
    /// `["REQ", <sub_id>, <filter>…]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", <sub_id>]`
    Close { subscription_id: String },
}

impl ClientMessage {
    pub fn event(event: Event) -> Self {
        Self::Event(event)
    }

    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self::Close {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, RelayError> {
        let value = match self {
            ClientMessage::Event(event) => {
                serde_json::to_value(("EVENT", event)).map_err(RelayError::Serialize)?
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut parts = vec![Value::from("REQ"), Value::from(subscription_id.as_str())];
                for filter in filters {
                    parts.push(serde_json::to_value(filter).map_err(RelayError::Serialize)?);
                }
                Value::Array(parts)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::to_value(("CLOSE", subscription_id)).map_err(RelayError::Serialize)?
            }
        };
        serde_json::to_string(&value).map_err(RelayError::Serialize)
    }
}

/// Relay-to-client frames.
#[derive(Clone, Debug)]
pub enum RelayMessage {
    /// `["EVENT", <sub_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", <sub_id>]`
    Eose { subscription_id: String },
    /// `["CLOSED", <sub_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },
    /// `["NOTICE", <message>]`
    Notice { message: String },
    /// `["AUTH", <challenge>]` — logged and ignored.
    Auth { challenge: String },
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(json)?;
        let array = value.as_array().ok_or(RelayError::InvalidMessage)?;
        let kind = array
            .first()
            .and_then(Value::as_str)
            .ok_or(RelayError::InvalidMessage)?;

        let str_at = |i: usize| -> Result<String, RelayError> {
            Ok(array
                .get(i)
                .and_then(Value::as_str)
                .ok_or(RelayError::InvalidMessage)?
                .to_string())
        };

        match kind {
            "EVENT" => {
                if array.len() != 3 {
                    return Err(RelayError::InvalidMessage);
                }
                let event: Event = serde_json::from_value(array[2].clone())?;
                Ok(RelayMessage::Event {
                    subscription_id: str_at(1)?,
                    event,
                })
            }
            "OK" => {
                if array.len() < 3 {
                    return Err(RelayError::InvalidMessage);
                }
                Ok(RelayMessage::Ok {
                    event_id: str_at(1)?,
                    accepted: array
                        .get(2)
                        .and_then(Value::as_bool)
                        .ok_or(RelayError::InvalidMessage)?,
                    message: str_at(3).unwrap_or_default(),
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: str_at(1)?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: str_at(1)?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: str_at(1)?,
            }),
            other => Err(RelayError::Protocol(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

/// What lands in a subscription mailbox.
#[derive(Clone, Debug)]
pub enum SubscriptionUpdate {
    /// A signature-verified event.
    Event(Event),
    /// The relay finished streaming stored events; live events follow.
    Eose,
    /// The relay closed the subscription.
    Closed(String),
}

/// A relay's answer to a published event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OkResult {
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("relay in backoff")]
    BackingOff,

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("serialize error: {0}")]
    Serialize(serde_json::Error),

    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("timeout")]
    Timeout,

    #[error("invalid message format")]
    InvalidMessage,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::WebSocket(e.to_string())
    }
}

/// Connection tunables.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub connect_timeout: std::time::Duration,
    /// Interval between WebSocket pings; must stay below the read deadline.
    pub ping_interval: std::time::Duration,
    /// Reader gives up when nothing (not even a pong) arrives for this long.
    pub read_deadline: std::time::Duration,
    /// Mailbox capacity for subscription updates.
    pub mailbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: std::time::Duration::from_secs(10),
            ping_interval: std::time::Duration::from_secs(25),
            read_deadline: std::time::Duration::from_secs(60),
            mailbox_capacity: 256,
        }
    }
}
