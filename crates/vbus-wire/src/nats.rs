//! NATS adapter for [`BusTransport`].

use crate::message::BusMessage;
use crate::subscription::{Subscription, SubscriptionGuard, SUBSCRIPTION_CAPACITY};
use crate::transport::{BusTransport, Connector, Credentials, TransportError};
use async_nats::{ConnectErrorKind, ConnectOptions, RequestErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Opens `async-nats` connections.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    connect_timeout: Duration,
}

impl NatsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for NatsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BusTransport>, TransportError> {
        let client = ConnectOptions::with_user_and_password(
            credentials.user.clone(),
            credentials.password.clone(),
        )
        .connection_timeout(self.connect_timeout)
        .connect(url)
        .await
        .map_err(|e| match e.kind() {
            ConnectErrorKind::AuthorizationViolation => {
                TransportError::AuthenticationFailed(e.to_string())
            }
            ConnectErrorKind::TimedOut => TransportError::Timeout(url.to_string()),
            _ => TransportError::Connect(e.to_string()),
        })?;
        debug!(url, user = %credentials.user, "Connected to NATS");
        Ok(Arc::new(NatsTransport::new(client)))
    }
}

/// A connection to a NATS server.
pub struct NatsTransport {
    client: async_nats::Client,
    closed: AtomicBool,
    /// Flips to `true` on close; every forwarding task watches it.
    shutdown: watch::Sender<bool>,
}

impl NatsTransport {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }
}

fn convert(msg: async_nats::Message) -> BusMessage {
    BusMessage {
        subject: msg.subject.to_string(),
        reply: msg.reply.map(|r| r.to_string()),
        payload: msg.payload,
    }
}

#[async_trait]
impl BusTransport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::Subscription(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut shutdown = self.shutdown.subscribe();
        let pattern = subject.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = shutdown.wait_for(|closed| *closed) => break,
                    next = subscriber.next() => match next {
                        Some(msg) => {
                            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(convert(msg)) {
                                warn!(pattern = %pattern, "Subscriber queue full, message dropped");
                            }
                        }
                        None => break,
                    },
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                debug!(pattern = %pattern, error = %e, "Unsubscribe failed");
            }
        });

        let guard = SubscriptionGuard::new(move || {
            let _ = stop_tx.send(());
        });
        Ok(Subscription::new(subject, rx, guard))
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, TransportError> {
        self.ensure_open()?;
        let fut = self.client.request(subject.to_string(), payload);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(msg)) => Ok(convert(msg)),
            Ok(Err(e)) => Err(match e.kind() {
                RequestErrorKind::NoResponders => TransportError::NoResponders(subject.to_string()),
                RequestErrorKind::TimedOut => TransportError::Timeout(subject.to_string()),
                _ => TransportError::Publish(e.to_string()),
            }),
            Err(_) => Err(TransportError::Timeout(subject.to_string())),
        }
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    /// Flush pending publishes, stop every forwarding task, then drain the
    /// client so the server drops its subscriptions and the socket closes.
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.flush().await {
            debug!(error = %e, "Flush before close failed");
        }
        self.shutdown.send_replace(true);
        self.client
            .drain()
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        debug!("NATS connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_url() -> String {
        std::env::var("VBUS_NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string())
    }

    #[tokio::test]
    #[ignore = "needs a NATS server at VBUS_NATS_URL"]
    async fn test_close_ends_subscriptions_and_rejects_io() {
        let transport = NatsConnector::default()
            .connect(&server_url(), &Credentials::anonymous())
            .await
            .unwrap();
        let mut sub = transport.subscribe("vbus.test.close").await.unwrap();

        transport.close().await.unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap();
        assert!(ended.is_none());
        assert!(matches!(
            transport.publish("vbus.test.close", Bytes::new()).await,
            Err(TransportError::ConnectionClosed)
        ));
        transport.close().await.unwrap();
    }
}
