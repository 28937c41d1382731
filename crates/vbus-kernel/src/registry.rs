//! Listener subscriptions owned by a router.
//!
//! Every listener a node handle opens (method invocation, add/set/get
//! listeners) is recorded here with its kind, so the router can skip subjects
//! another listener answers and so shutdown can close them all.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;
use vbus_wire::message::BusMessage;
use vbus_wire::subject::subject_matches;
use vbus_wire::{Subscription, SubscriptionGuard};

/// What a listener subscription is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Method invocation on `<path>.set`.
    Method,
    NodeAdd,
    NodeSet,
    /// Node content requests on `<path>.get`.
    NodeGet,
    /// Attribute value requests on `<path>.get`.
    AttributeGet,
    AttributeSet,
}

impl ListenerKind {
    /// Listeners that reply to requests instead of observing them.
    pub fn answers(&self) -> bool {
        matches!(
            self,
            ListenerKind::Method | ListenerKind::NodeGet | ListenerKind::AttributeGet
        )
    }
}

struct ListenerEntry {
    subject: String,
    kind: ListenerKind,
    registered_at: DateTime<Utc>,
    guard: SubscriptionGuard,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: HashMap<u64, ListenerEntry>,
}

/// Summary of one registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub id: u64,
    pub subject: String,
    pub kind: ListenerKind,
    pub registered_at: DateTime<Utc>,
}

/// Registry of listener subscriptions.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription guard. Returns the listener id.
    pub fn register(&self, subject: &str, kind: ListenerKind, guard: SubscriptionGuard) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.insert(
            id,
            ListenerEntry {
                subject: subject.to_string(),
                kind,
                registered_at: Utc::now(),
                guard,
                task: None,
            },
        );
        debug!(id, subject, ?kind, "Listener registered");
        id
    }

    /// Attach the task draining a listener. Aborts it if the listener is
    /// already closed.
    pub fn attach_task(&self, id: u64, task: JoinHandle<()>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.entries.get_mut(&id) {
            Some(entry) => entry.task = Some(task),
            None => task.abort(),
        }
    }

    /// Register `subscription` and drive `handler` for each message on a
    /// dedicated task.
    pub fn spawn<F, Fut>(
        &self,
        kind: ListenerKind,
        subscription: Subscription,
        mut handler: F,
    ) -> Listener
    where
        F: FnMut(BusMessage) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (subject, mut receiver, guard) = subscription.into_parts();
        let id = self.register(&subject, kind, guard);
        let task = tokio::spawn(async move {
            while let Some(msg) = receiver.recv().await {
                handler(msg).await;
            }
        });
        self.attach_task(id, task);
        Listener {
            id,
            subject,
            kind,
            registry: self.clone(),
        }
    }

    /// Whether a listener that answers requests covers `subject`.
    pub fn claims(&self, subject: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .values()
            .any(|e| e.kind.answers() && subject_matches(&e.subject, subject))
    }

    /// Subjects of every listener of `kind`.
    pub fn subjects(&self, kind: ListenerKind) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut subjects: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.kind == kind)
            .map(|e| e.subject.clone())
            .collect();
        subjects.sort();
        subjects
    }

    /// Every open listener, oldest first.
    pub fn list(&self) -> Vec<ListenerInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ListenerInfo> = inner
            .entries
            .iter()
            .map(|(id, e)| ListenerInfo {
                id: *id,
                subject: e.subject.clone(),
                kind: e.kind,
                registered_at: e.registered_at,
            })
            .collect();
        list.sort_by_key(|l| l.id);
        list
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unsubscribe one listener and wait for its task to finish.
    pub async fn close(&self, id: u64) {
        let entry = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.entries.remove(&id)
        };
        if let Some(entry) = entry {
            finish(entry).await;
        }
    }

    /// Close every listener.
    pub async fn close_all(&self) {
        let entries: Vec<ListenerEntry> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            finish(entry).await;
        }
    }
}

async fn finish(mut entry: ListenerEntry) {
    entry.guard.unsubscribe();
    if let Some(task) = entry.task.take() {
        if let Err(e) = task.await {
            debug!(subject = %entry.subject, error = %e, "Listener task ended abnormally");
        }
    }
    debug!(subject = %entry.subject, kind = ?entry.kind, "Listener closed");
}

/// Handle on a registered listener.
#[derive(Clone)]
pub struct Listener {
    id: u64,
    subject: String,
    kind: ListenerKind,
    registry: SubscriptionRegistry,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Stop listening. Idempotent.
    pub async fn close(&self) {
        self.registry.close(self.id).await;
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vbus_wire::{BusTransport, Credentials, LocalBroker};

    #[test]
    fn test_claims_only_answering_kinds() {
        let registry = SubscriptionRegistry::new();
        registry.register("a.m.set", ListenerKind::Method, SubscriptionGuard::noop());
        registry.register("a.x.set", ListenerKind::AttributeSet, SubscriptionGuard::noop());
        assert!(registry.claims("a.m.set"));
        assert!(!registry.claims("a.x.set"));
        assert_eq!(registry.subjects(ListenerKind::Method), vec!["a.m.set"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_node_get_listener_claims_subject() {
        let registry = SubscriptionRegistry::new();
        registry.register("svc.h.config.get", ListenerKind::NodeGet, SubscriptionGuard::noop());
        registry.register("svc.h.config.add", ListenerKind::NodeAdd, SubscriptionGuard::noop());
        assert!(registry.claims("svc.h.config.get"));
        assert!(!registry.claims("svc.h.config.add"));
        assert!(!registry.claims("svc.h.other.get"));
    }

    #[test]
    fn test_list_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        let before = Utc::now();
        let first = registry.register("a.m.set", ListenerKind::Method, SubscriptionGuard::noop());
        let second = registry.register("a.get", ListenerKind::NodeGet, SubscriptionGuard::noop());

        let list = registry.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, first);
        assert_eq!(list[0].subject, "a.m.set");
        assert_eq!(list[1].id, second);
        assert_eq!(list[1].kind, ListenerKind::NodeGet);
        assert!(list.iter().all(|l| l.registered_at >= before));
    }

    #[tokio::test]
    async fn test_spawn_and_close() {
        let broker = LocalBroker::new("nats://t:1");
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let sub = conn.subscribe("a.set").await.unwrap();
        let counter = seen.clone();
        let listener = registry.spawn(ListenerKind::NodeSet, sub, move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        conn.publish("a.set", Bytes::from_static(b"{}")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        listener.close().await;
        assert!(registry.is_empty());
        assert_eq!(broker.subscriber_count(), 0);

        conn.publish("a.set", Bytes::from_static(b"{}")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
