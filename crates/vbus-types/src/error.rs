//! Shared error types for vBus.

use crate::value::AttributeType;
use thiserror::Error;

/// Top-level error type for vBus operations.
#[derive(Error, Debug)]
pub enum VbusError {
    /// Every broker resolution strategy failed.
    #[error("No vBus broker found")]
    NoBrokerFound,

    /// The path or subject is malformed (whitespace or empty segment).
    #[error("Invalid vBus path: {0:?}")]
    InvalidPath(String),

    /// A payload could not be parsed as JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// The path does not resolve to a node.
    #[error("Not a node: {0}")]
    NotANode(String),

    /// The path does not resolve to a typed attribute.
    #[error("Not an attribute: {0}")]
    NotAnAttribute(String),

    /// The path does not resolve to a method.
    #[error("Not a method: {0}")]
    NotAMethod(String),

    /// A value's runtime type differs from the attribute's declared type.
    #[error("Value type incompatibility on {path}: {expected} expected, got {found}")]
    TypeMismatch {
        /// The attribute path.
        path: String,
        /// The declared type.
        expected: AttributeType,
        /// The type of the rejected value.
        found: AttributeType,
    },

    /// The value cannot be represented as an attribute.
    #[error("Value not compatible: {0}")]
    UnsupportedValue(String),

    /// The remote owner answered with an error payload.
    #[error("Remote error {code}: {message}")]
    RemoteError {
        /// Error code carried by the reply.
        code: u16,
        /// Error message carried by the reply.
        message: String,
    },

    /// A reply did not follow the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request/reply round trip timed out.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Nobody is subscribed to the requested subject.
    #[error("No responders on {0}")]
    Unreachable(String),

    /// A discovery window closed without any reply.
    #[error("Discover is empty: {0}")]
    DiscoverEmpty(String),

    /// The authorization service refused a grant.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The broker rejected the credentials.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The bus client reported an error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection or router is closed.
    #[error("Connection closed")]
    Closed,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for VbusError {
    fn from(e: serde_json::Error) -> Self {
        VbusError::Serialization(e.to_string())
    }
}

/// Alias for Result with VbusError.
pub type VbusResult<T> = Result<T, VbusError>;
