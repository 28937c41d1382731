//! The bus-client seam.
//!
//! The kernel talks to the broker only through [`BusTransport`] and obtains
//! connections through a [`Connector`]. [`crate::local::LocalBroker`] provides an
//! in-process implementation; the `nats` feature adds one over a real broker.

use crate::message::BusMessage;
use crate::subscription::Subscription;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vbus_types::VbusError;

/// User name and password of the unregistered principal.
pub const ANONYMOUS: &str = "anonymous";

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("No responders: {0}")]
    NoResponders(String),
    #[error("Invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("Subscription failed: {0}")]
    Subscription(String),
    #[error("Publish failed: {0}")]
    Publish(String),
}

impl From<TransportError> for VbusError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => VbusError::Io(e),
            TransportError::ConnectionClosed => VbusError::Closed,
            TransportError::AuthenticationFailed(m) => VbusError::AuthFailed(m),
            TransportError::Timeout(s) => VbusError::Timeout(s),
            TransportError::NoResponders(s) => VbusError::Unreachable(s),
            TransportError::InvalidSubject(s) => VbusError::InvalidPath(s),
            other => VbusError::Transport(other.to_string()),
        }
    }
}

/// Credentials presented to the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS, ANONYMOUS)
    }

    pub fn is_anonymous(&self) -> bool {
        self.user == ANONYMOUS
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An open connection to a broker.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Publish with a reply subject attached.
    async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Subscribe to a subject pattern.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError>;

    /// A fresh single-use reply subject.
    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
    }

    /// Single request/reply round trip, bounded by `timeout`.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, TransportError> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox).await?;
        self.publish_request(subject, &inbox, payload).await?;
        let reply = tokio::time::timeout(timeout, sub.recv()).await;
        sub.unsubscribe();
        match reply {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::Timeout(subject.to_string())),
        }
    }

    /// Wait until everything published so far reached the broker.
    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the connection. Subscriptions stop receiving.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens connections to a broker URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BusTransport>, TransportError>;

    /// Liveness probe: connect as the anonymous principal and close again.
    async fn probe(&self, url: &str) -> Result<(), TransportError> {
        let conn = self.connect(url, &Credentials::anonymous()).await?;
        conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = Credentials::new("svc.host", "s3cret");
        let out = format!("{creds:?}");
        assert!(out.contains("svc.host"));
        assert!(!out.contains("s3cret"));
    }

    #[test]
    fn test_error_conversion() {
        assert!(matches!(
            VbusError::from(TransportError::NoResponders("x".into())),
            VbusError::Unreachable(_)
        ));
        assert!(matches!(
            VbusError::from(TransportError::AuthenticationFailed("x".into())),
            VbusError::AuthFailed(_)
        ));
        assert!(matches!(
            VbusError::from(TransportError::Connect("x".into())),
            VbusError::Transport(_)
        ));
    }
}
