use std::error::Error as StdError;
use std::fmt;
use std::string::FromUtf8Error;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Discriminator carried in the `type` field of every frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `metrics_update`: live metrics pushed by the server
    MetricsUpdate,
    /// `ping`: liveness probe
    Ping,
    /// `pong`: answer to a liveness probe
    Pong,
    /// Any application-defined type. Holds the raw discriminator, empty when the frame had none.
    Unknown(String),
}

impl MessageKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::MetricsUpdate => "metrics_update",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown(other) => other,
        }
    }
}

impl From<&str> for MessageKind {
    fn from(discriminator: &str) -> Self {
        match discriminator {
            "metrics_update" => Self::MetricsUpdate,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded frame, handed to `on_message` once and then dropped.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Decoded `type` discriminator
    pub kind: MessageKind,
    /// The whole JSON frame, discriminator included
    pub payload: Value,
    /// When the frame was read from the transport
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Decodes a text frame. Only JSON well-formedness is checked; frames that are not
    /// objects or lack a string `type` decode as [`MessageKind::Unknown`].
    pub fn decode(text: &str, received_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_str(text)?;
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .map_or_else(|| MessageKind::Unknown(String::new()), MessageKind::from);

        Ok(Self {
            kind,
            payload,
            received_at,
        })
    }

    /// Try to deserialize the frame into an application type.
    #[must_use]
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        T::deserialize(&self.payload).ok()
    }
}

/// Why an inbound frame could not be turned into an [`InboundMessage`].
#[non_exhaustive]
#[derive(Debug)]
pub enum DecodeError {
    /// A binary frame was not valid UTF-8
    Utf8(FromUtf8Error),
    /// The text was not valid JSON
    Json(serde_json::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8(e) => write!(f, "invalid UTF-8: {e}"),
            Self::Json(e) => write!(f, "invalid JSON: {e}"),
        }
    }
}

impl StdError for DecodeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Utf8(e) => Some(e),
            Self::Json(e) => Some(e),
        }
    }
}

impl From<FromUtf8Error> for DecodeError {
    fn from(e: FromUtf8Error) -> Self {
        Self::Utf8(e)
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Frames the manager writes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Ping,
    Pong,
}

impl Control {
    pub(crate) fn frame(self) -> String {
        match self {
            Self::Ping => r#"{"type":"ping"}"#.to_owned(),
            Self::Pong => r#"{"type":"pong"}"#.to_owned(),
        }
    }
}
