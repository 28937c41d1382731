//! Command router: answers bus traffic addressed to a managed node.
//!
//! The router subscribes to the service root (`<service>` and `<service>.>`),
//! which covers the managed base path, its descendants, and its ancestors
//! down to the service root. Each subscription is drained by its own task;
//! all reads and writes of the content go through the [`SharedTree`] lock.

use crate::node::{respond, BusContext};
use crate::tree::{nest, ElementKind, SharedTree};
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vbus_types::path;
use vbus_types::{AttributeValue, Command, VbusError, VbusResult};
use vbus_wire::{BusMessage, ErrorReply, SubscriptionGuard};

/// Lifecycle of a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RouterState {
    Unregistered = 0,
    Registered = 1,
    Closed = 2,
}

impl RouterState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RouterState::Unregistered,
            1 => RouterState::Registered,
            _ => RouterState::Closed,
        }
    }
}

/// Routes `add`/`get`/`set`/`remove` commands and discovery probes to the
/// content of one managed node.
pub struct CommandRouter {
    base: String,
    service_root: String,
    tree: SharedTree,
    ctx: Arc<BusContext>,
    state: AtomicU8,
    running: Mutex<Vec<(SubscriptionGuard, JoinHandle<()>)>>,
}

impl CommandRouter {
    /// A router for `base`, subscribing under `service_root`.
    ///
    /// `service_root` must be `base` or one of its ancestors.
    pub fn new(
        base: impl Into<String>,
        service_root: impl Into<String>,
        tree: SharedTree,
        ctx: Arc<BusContext>,
    ) -> VbusResult<Self> {
        let base = base.into();
        let service_root = service_root.into();
        path::validate(&base)?;
        path::validate(&service_root)?;
        if !path::is_ancestor_or_self(&service_root, &base) {
            return Err(VbusError::InvalidPath(format!(
                "{service_root} does not contain {base}"
            )));
        }
        Ok(Self {
            base,
            service_root,
            tree,
            ctx,
            state: AtomicU8::new(RouterState::Unregistered as u8),
            running: Mutex::new(Vec::new()),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn state(&self) -> RouterState {
        RouterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Publish the initial content on the base subject, then start serving.
    pub async fn register(self: &Arc<Self>) -> VbusResult<()> {
        match self.state() {
            RouterState::Registered => return Ok(()),
            RouterState::Closed => return Err(VbusError::Closed),
            RouterState::Unregistered => {}
        }

        let content = self.tree.read().serialize();
        self.ctx
            .transport
            .publish(&self.base, Bytes::from(content))
            .await?;

        let subjects = [
            self.service_root.clone(),
            format!("{}.>", self.service_root),
        ];
        let mut started = Vec::with_capacity(subjects.len());
        for subject in &subjects {
            let subscription = self.ctx.transport.subscribe(subject).await?;
            let (_, mut receiver, guard) = subscription.into_parts();
            let router = Arc::clone(self);
            let task = tokio::spawn(async move {
                while let Some(msg) = receiver.recv().await {
                    if router.state() == RouterState::Closed {
                        break;
                    }
                    if let Some(payload) = router.dispatch(&msg) {
                        respond(router.ctx.transport.as_ref(), &msg, payload).await;
                    }
                }
            });
            started.push((guard, task));
        }

        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(started);
        self.state
            .store(RouterState::Registered as u8, Ordering::SeqCst);
        info!(base = %self.base, root = %self.service_root, "Router registered");
        Ok(())
    }

    /// Apply one message to the content. Returns the reply payload, if the
    /// message calls for one.
    pub fn dispatch(&self, msg: &BusMessage) -> Option<Bytes> {
        if self.state() == RouterState::Closed {
            return None;
        }
        let subject = msg.subject.as_str();

        // Discovery probe on the base or one of its ancestors.
        if path::is_ancestor_or_self(subject, &self.base) {
            msg.reply.as_ref()?;
            let below = path::strip_base(&self.base, subject)?;
            let content = self.tree.read().content().clone();
            debug!(subject, "Discovery probe");
            return Some(Bytes::from(nest(below, content).to_string()));
        }

        let tail = path::strip_base(subject, &self.base)?;
        if self.ctx.registry.claims(subject) {
            return None;
        }

        match Command::split(tail) {
            (target, Some(Command::Add)) => {
                self.apply_add(subject, target, msg);
                None
            }
            (target, Some(Command::Get)) => {
                msg.reply.as_ref()?;
                Some(
                    self.read(target)
                        .unwrap_or_else(|| ErrorReply::not_found(subject).to_bytes()),
                )
            }
            (target, Some(Command::Set)) => {
                self.apply_set(subject, target, msg);
                None
            }
            (target, Some(Command::Remove)) => {
                info!(subject, path = %target, "Remove is not supported, ignoring");
                None
            }
            (target, None) => {
                msg.reply.as_ref()?;
                self.read(target)
            }
        }
    }

    /// Serialized node or attribute wire text at `target`.
    fn read(&self, target: &str) -> Option<Bytes> {
        let tree = self.tree.read();
        match tree.kind(target)? {
            ElementKind::Node | ElementKind::Method => {
                Some(Bytes::from(tree.subtree(target).serialize()))
            }
            ElementKind::Attribute(_) => tree
                .attribute(target)
                .ok()
                .map(|v| Bytes::from(v.to_wire())),
            ElementKind::Value => None,
        }
    }

    fn apply_add(&self, subject: &str, target: &str, msg: &BusMessage) {
        let patch: Value = match msg.json() {
            Ok(v) => v,
            Err(e) => {
                warn!(subject, error = %e, "Ignoring add");
                return;
            }
        };
        let mut tree = self.tree.write();
        if tree.is_node(target) {
            tree.merge_at(target, &patch);
            debug!(subject, "Add merged");
        } else {
            debug!(subject, "Add on unknown node ignored");
        }
    }

    fn apply_set(&self, subject: &str, target: &str, msg: &BusMessage) {
        let mut tree = self.tree.write();
        if let Some(ty) = tree.attribute_type(target) {
            match AttributeValue::parse_wire(ty, &msg.payload_str()) {
                Ok(value) => tree.set(target, value.to_json()),
                Err(e) => warn!(subject, error = %e, "Ignoring attribute set"),
            }
            return;
        }
        if !tree.is_node(target) {
            debug!(subject, "Set on unknown node ignored");
            return;
        }
        match msg.json() {
            Ok(patch) => tree.merge_at(target, &patch),
            Err(e) => warn!(subject, error = %e, "Ignoring set"),
        }
    }

    /// Stop serving: unsubscribe, let in-flight handlers finish, wait for
    /// the tasks.
    pub async fn close(&self) {
        let previous = self.state.swap(RouterState::Closed as u8, Ordering::SeqCst);
        if RouterState::from_u8(previous) == RouterState::Closed {
            return;
        }
        let running = std::mem::take(&mut *self.running.lock().unwrap_or_else(|e| e.into_inner()));
        for (mut guard, task) in running {
            guard.unsubscribe();
            if let Err(e) = task.await {
                debug!(base = %self.base, error = %e, "Router task ended abnormally");
            }
        }
        info!(base = %self.base, "Router closed");
    }
}
