//! Subscription handles.

use crate::message::BusMessage;
use tokio::sync::mpsc;

/// Per-subscription queue depth. A subscriber that falls behind loses
/// messages rather than stalling the publisher.
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Stops delivery to a subscription when dropped or unsubscribed.
pub struct SubscriptionGuard {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// A guard with nothing to release.
    pub fn noop() -> Self {
        Self { on_drop: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("active", &self.on_drop.is_some())
            .finish()
    }
}

/// An active subscription: a message receiver plus its guard.
///
/// Messages already queued can still be drained after [`unsubscribe`].
///
/// [`unsubscribe`]: Subscription::unsubscribe
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    receiver: mpsc::Receiver<BusMessage>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn new(
        subject: impl Into<String>,
        receiver: mpsc::Receiver<BusMessage>,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            subject: subject.into(),
            receiver,
            guard,
        }
    }

    /// The subscribed pattern.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) {
        self.guard.unsubscribe();
    }

    pub fn into_parts(self) -> (String, mpsc::Receiver<BusMessage>, SubscriptionGuard) {
        (self.subject, self.receiver, self.guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_guard_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut guard = SubscriptionGuard::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        guard.unsubscribe();
        guard.unsubscribe();
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_after_unsubscribe() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new("a", rx, SubscriptionGuard::noop());
        tx.send(BusMessage::new("a", "1")).await.unwrap();
        sub.unsubscribe();
        drop(tx);
        assert_eq!(sub.recv().await.unwrap().payload_str(), "1");
        assert!(sub.recv().await.is_none());
    }
}
