//! Bus message types.
//!
//! A message is a subject, an optional reply subject and an opaque payload.
//! Node content travels as UTF-8 JSON; scalar attribute replies travel as bare
//! text.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use vbus_types::{VbusError, VbusResult};

/// A message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Where the publisher expects an answer, if anywhere.
    pub reply: Option<String>,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
        }
    }

    pub fn with_reply(
        subject: impl Into<String>,
        reply: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            subject: subject.into(),
            reply: Some(reply.into()),
            payload: payload.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Parse the payload as JSON.
    pub fn json(&self) -> VbusResult<serde_json::Value> {
        serde_json::from_slice(&self.payload).map_err(|e| VbusError::InvalidJson(e.to_string()))
    }
}

/// Error payload sent in answer to a `get` that does not resolve.
///
/// Serialized as `{"error":{"code":404,"message":"..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: u16,
    pub message: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorEnvelope {
    error: ErrorReply,
}

impl ErrorReply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(404, format!("not found: {path}"))
    }

    pub fn to_bytes(&self) -> Bytes {
        let envelope = ErrorEnvelope {
            error: self.clone(),
        };
        // A struct of a number and a string always serializes.
        Bytes::from(serde_json::to_vec(&envelope).unwrap_or_default())
    }

    /// Recognise an error payload. Anything else yields `None`.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice::<ErrorEnvelope>(payload)
            .ok()
            .map(|e| e.error)
    }
}

impl From<ErrorReply> for VbusError {
    fn from(e: ErrorReply) -> Self {
        VbusError::RemoteError {
            code: e.code,
            message: e.message,
        }
    }
}
