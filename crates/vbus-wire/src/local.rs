//! In-process broker.
//!
//! [`LocalBroker`] routes messages between connections living in the same
//! process. It follows the same rules as a real broker: subjects are matched
//! with wildcards, delivery is at-most-once into bounded per-subscriber
//! queues, a request without any subscriber fails with no-responders, and
//! connections authenticate against a user table.

use crate::message::BusMessage;
use crate::subject::{is_valid_pattern, is_valid_publish_subject, subject_matches};
use crate::subscription::{Subscription, SubscriptionGuard, SUBSCRIPTION_CAPACITY};
use crate::transport::{BusTransport, Connector, Credentials, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Number of published messages kept for inspection.
const HISTORY_CAPACITY: usize = 256;

type Verifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct SubscriberEntry {
    pattern: String,
    sender: mpsc::Sender<BusMessage>,
    connection: u64,
}

struct BrokerInner {
    url: String,
    subscribers: DashMap<u64, SubscriberEntry>,
    users: DashMap<String, Verifier>,
    allow_anonymous: AtomicBool,
    next_id: AtomicU64,
    connects: AtomicU64,
    auth_failures: AtomicU64,
    published: AtomicU64,
    history: Mutex<VecDeque<BusMessage>>,
}

impl BrokerInner {
    fn route(&self, msg: BusMessage) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(msg.clone());
        }

        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            if !subject_matches(&entry.pattern, &msg.subject) {
                continue;
            }
            match entry.sender.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subject = %msg.subject, pattern = %entry.pattern, "Subscriber queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    fn has_subscriber(&self, subject: &str) -> bool {
        self.subscribers
            .iter()
            .any(|e| subject_matches(&e.pattern, subject))
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<(), TransportError> {
        if credentials.is_anonymous() {
            if self.allow_anonymous.load(Ordering::SeqCst) {
                return Ok(());
            }
            return Err(TransportError::AuthenticationFailed(
                "anonymous access disabled".to_string(),
            ));
        }
        let verifier = self.users.get(&credentials.user).map(|v| v.value().clone());
        match verifier {
            Some(verify) if verify(&credentials.password) => Ok(()),
            _ => Err(TransportError::AuthenticationFailed(format!(
                "authorization violation for user {}",
                credentials.user
            ))),
        }
    }
}

/// A broker that lives inside the process.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl LocalBroker {
    /// Create a broker reachable under `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                url: url.into(),
                subscribers: DashMap::new(),
                users: DashMap::new(),
                allow_anonymous: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                connects: AtomicU64::new(0),
                auth_failures: AtomicU64::new(0),
                published: AtomicU64::new(0),
                history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Register a user with a plain password.
    pub fn add_user(&self, user: impl Into<String>, password: impl Into<String>) {
        let password = password.into();
        self.add_user_with(user, move |candidate| candidate == password);
    }

    /// Register a user whose password is checked by `verify`.
    pub fn add_user_with(
        &self,
        user: impl Into<String>,
        verify: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) {
        self.inner.users.insert(user.into(), Arc::new(verify));
    }

    pub fn remove_user(&self, user: &str) {
        self.inner.users.remove(user);
    }

    pub fn has_user(&self, user: &str) -> bool {
        self.inner.users.contains_key(user)
    }

    pub fn set_allow_anonymous(&self, allow: bool) {
        self.inner.allow_anonymous.store(allow, Ordering::SeqCst);
    }

    /// Successful connections so far.
    pub fn connection_count(&self) -> u64 {
        self.inner.connects.load(Ordering::Relaxed)
    }

    /// Rejected connection attempts so far.
    pub fn auth_failure_count(&self) -> u64 {
        self.inner.auth_failures.load(Ordering::Relaxed)
    }

    /// Messages routed so far, from every connection.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Recently routed messages, oldest first.
    pub fn history(&self) -> Vec<BusMessage> {
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    /// Connect and return the concrete connection type.
    pub fn connect_local(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<LocalConnection>, TransportError> {
        if let Err(e) = self.inner.authenticate(credentials) {
            self.inner.auth_failures.fetch_add(1, Ordering::Relaxed);
            debug!(user = %credentials.user, "Local broker rejected credentials");
            return Err(e);
        }
        self.inner.connects.fetch_add(1, Ordering::Relaxed);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(LocalConnection {
            id,
            user: credentials.user.clone(),
            broker: self.inner.clone(),
            closed: AtomicBool::new(false),
            publishes: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        }))
    }
}

#[async_trait]
impl Connector for LocalBroker {
    async fn connect(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BusTransport>, TransportError> {
        if url != self.inner.url {
            return Err(TransportError::Connect(format!("no broker at {url}")));
        }
        let conn: Arc<dyn BusTransport> = self.connect_local(credentials)?;
        Ok(conn)
    }
}

/// One client connection to a [`LocalBroker`].
pub struct LocalConnection {
    id: u64,
    user: String,
    broker: Arc<BrokerInner>,
    closed: AtomicBool,
    publishes: AtomicU64,
    requests: AtomicU64,
}

impl LocalConnection {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Publishes issued on this connection, with or without reply subject.
    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }

    /// Request/reply round trips issued on this connection.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    fn send(&self, msg: BusMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !is_valid_publish_subject(&msg.subject) {
            return Err(TransportError::InvalidSubject(msg.subject));
        }
        self.publishes.fetch_add(1, Ordering::Relaxed);
        self.broker.route(msg);
        Ok(())
    }
}

#[async_trait]
impl BusTransport for LocalConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.send(BusMessage::new(subject, payload))
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.send(BusMessage::with_reply(subject, reply, payload))
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        if !is_valid_pattern(subject) {
            return Err(TransportError::InvalidSubject(subject.to_string()));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = self.broker.next_id.fetch_add(1, Ordering::Relaxed);
        self.broker.subscribers.insert(
            id,
            SubscriberEntry {
                pattern: subject.to_string(),
                sender: tx,
                connection: self.id,
            },
        );
        let broker: Weak<BrokerInner> = Arc::downgrade(&self.broker);
        let guard = SubscriptionGuard::new(move || {
            if let Some(broker) = broker.upgrade() {
                broker.subscribers.remove(&id);
            }
        });
        Ok(Subscription::new(subject, rx, guard))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, TransportError> {
        self.ensure_open()?;
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !self.broker.has_subscriber(subject) {
            return Err(TransportError::NoResponders(subject.to_string()));
        }
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

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker
            .subscribers
            .retain(|_, entry| entry.connection != self.id);
        debug!(user = %self.user, "Local connection closed");
        Ok(())
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        let id = self.id;
        self.broker
            .subscribers
            .retain(|_, entry| entry.connection != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "nats://test.local:21400";

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let broker = LocalBroker::new(URL);
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        let mut wide = conn.subscribe("a.>").await.unwrap();
        let mut exact = conn.subscribe("a.b").await.unwrap();
        let mut other = conn.subscribe("x").await.unwrap();

        conn.publish("a.b", Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(wide.recv().await.unwrap().payload_str(), "hi");
        assert_eq!(exact.recv().await.unwrap().subject, "a.b");
        assert!(other.try_recv().is_none());
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = LocalBroker::new(URL);
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        let mut sub = conn.subscribe("a").await.unwrap();
        sub.unsubscribe();
        conn.publish("a", Bytes::new()).await.unwrap();
        assert!(sub.recv().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let broker = LocalBroker::new(URL);
        let server = broker.connect_local(&Credentials::anonymous()).unwrap();
        let client = broker.connect_local(&Credentials::anonymous()).unwrap();
        let mut sub = server.subscribe("echo").await.unwrap();
        let responder = server.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                if let Some(reply) = msg.reply {
                    responder.publish(&reply, msg.payload).await.unwrap();
                }
            }
        });

        let reply = client
            .request("echo", Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload_str(), "ping");
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn test_request_without_subscriber() {
        let broker = LocalBroker::new(URL);
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        let err = conn
            .request("nobody", Bytes::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoResponders(_)));
    }

    #[tokio::test]
    async fn test_authentication() {
        let broker = LocalBroker::new(URL);
        broker.add_user("svc.host", "pw");
        assert!(broker.connect(URL, &Credentials::new("svc.host", "pw")).await.is_ok());
        assert!(matches!(
            broker.connect(URL, &Credentials::new("svc.host", "bad")).await,
            Err(TransportError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            broker.connect("nats://elsewhere:1", &Credentials::anonymous()).await,
            Err(TransportError::Connect(_))
        ));
        broker.set_allow_anonymous(false);
        assert!(broker.probe(URL).await.is_err());
        assert_eq!(broker.auth_failure_count(), 2);
    }

    #[tokio::test]
    async fn test_close_drops_subscriptions() {
        let broker = LocalBroker::new(URL);
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        let _sub = conn.subscribe("a").await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(broker.subscriber_count(), 0);
        assert!(matches!(
            conn.publish("a", Bytes::new()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
