//! Node, attribute and method handles.
//!
//! A [`NodeHandle`] is a view into a [`SharedTree`]: an absolute base path on
//! the bus plus the matching relative prefix inside the tree. Handles on the
//! local root write to content the router serves; handles returned by
//! `VbusClient::remote_*` hold a private mirror of someone else's content.

use crate::registry::{Listener, ListenerKind, SubscriptionRegistry};
use crate::tree::{self, ElementKind, SharedTree, Tree};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vbus_types::config::TimeoutConfig;
use vbus_types::path;
use vbus_types::{AttributeType, AttributeValue, Command, VbusError, VbusResult};
use vbus_wire::{BusMessage, BusTransport, ErrorReply};

/// Everything a handle needs to talk to the bus.
pub struct BusContext {
    pub transport: Arc<dyn BusTransport>,
    pub registry: SubscriptionRegistry,
    pub timeouts: TimeoutConfig,
    pub hostname: String,
}

impl BusContext {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        registry: SubscriptionRegistry,
        timeouts: TimeoutConfig,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            registry,
            timeouts,
            hostname: hostname.into(),
        }
    }

    async fn publish_json(&self, subject: &str, value: &Value) -> VbusResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.transport.publish(subject, Bytes::from(payload)).await?;
        Ok(())
    }

    /// Request/reply where an error payload becomes [`VbusError::RemoteError`].
    ///
    /// Any reply shaped like `{"error": ..}` counts as an error payload,
    /// whatever the requested element.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> VbusResult<Bytes> {
        let reply = self.transport.request(subject, payload, timeout).await?;
        if let Some(err) = ErrorReply::parse(&reply.payload) {
            return Err(err.into());
        }
        Ok(reply.payload)
    }
}

/// Answer `msg` on its reply subject, if it has one.
pub(crate) async fn respond(transport: &dyn BusTransport, msg: &BusMessage, payload: Bytes) {
    let Some(reply) = msg.reply.as_deref() else {
        return;
    };
    if let Err(e) = transport.publish(reply, payload).await {
        warn!(subject = %msg.subject, error = %e, "Failed to publish reply");
    }
}

/// Callback invoked for each method call.
///
/// Returning `None` sends no reply.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn call(&self, payload: &[u8]) -> Option<Vec<u8>>;
}

#[async_trait]
impl<F> MethodHandler for F
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
{
    async fn call(&self, payload: &[u8]) -> Option<Vec<u8>> {
        (self)(payload)
    }
}

/// A view on a node.
#[derive(Clone)]
pub struct NodeHandle {
    base: String,
    prefix: String,
    tree: SharedTree,
    ctx: Arc<BusContext>,
}

impl NodeHandle {
    /// A view rooted at `base` over `tree`.
    pub fn new(base: impl Into<String>, tree: SharedTree, ctx: Arc<BusContext>) -> Self {
        Self {
            base: base.into(),
            prefix: String::new(),
            tree,
            ctx,
        }
    }

    /// Absolute path of this node on the bus.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Path of this node inside its tree.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn local(&self, sub: &str) -> String {
        path::join(&self.prefix, sub)
    }

    fn absolute(&self, sub: &str) -> String {
        path::join(&self.base, sub)
    }

    /// Snapshot of this node's content. Empty if not known yet.
    pub fn tree(&self) -> Tree {
        self.tree.read().subtree(&self.prefix)
    }

    pub fn serialize(&self) -> String {
        self.tree().serialize()
    }

    /// Whether `sub` resolves locally.
    pub fn exists(&self, sub: &str) -> bool {
        self.tree.read().exists(&self.local(sub))
    }

    pub fn kind(&self, sub: &str) -> Option<ElementKind> {
        self.tree.read().kind(&self.local(sub))
    }

    async fn publish_add(&self, patch: &Value) -> VbusResult<()> {
        self.tree.write().merge_at(&self.prefix, patch);
        self.ctx
            .publish_json(&Command::Add.subject(&self.base), patch)
            .await
    }

    /// Declare a child node at `sub` with the given JSON content.
    pub async fn add_node(&self, sub: &str, content: &str) -> VbusResult<NodeHandle> {
        path::validate(sub)?;
        let value: Value =
            serde_json::from_str(content).map_err(|e| VbusError::InvalidJson(e.to_string()))?;
        if !value.is_object() {
            return Err(VbusError::InvalidJson(format!(
                "node content must be an object: {content}"
            )));
        }
        self.publish_add(&tree::node_patch(sub, value)).await?;
        debug!(path = %self.absolute(sub), "Node added");
        self.node(sub)
    }

    /// Declare a typed attribute at `sub`.
    pub async fn add_attribute(
        &self,
        sub: &str,
        value: impl Into<AttributeValue>,
    ) -> VbusResult<AttributeHandle> {
        path::validate(sub)?;
        let value = value.into();
        value.ensure_representable()?;
        self.publish_add(&tree::attribute_patch(sub, &value)).await?;
        debug!(path = %self.absolute(sub), ty = %value.attr_type(), "Attribute added");
        Ok(self.attribute_handle(sub, value.attr_type()))
    }

    /// Declare a method at `sub`, invoking `handler` for each call.
    pub async fn add_method(
        &self,
        sub: &str,
        handler: impl MethodHandler,
    ) -> VbusResult<MethodHandle> {
        path::validate(sub)?;
        let base = self.absolute(sub);
        let subject = Command::Set.subject(&base);
        let subscription = self.ctx.transport.subscribe(&subject).await?;

        let handler = Arc::new(handler);
        let transport = self.ctx.transport.clone();
        let listener = self
            .ctx
            .registry
            .spawn(ListenerKind::Method, subscription, move |msg| {
                let handler = handler.clone();
                let transport = transport.clone();
                async move {
                    if let Some(answer) = handler.call(&msg.payload).await {
                        respond(transport.as_ref(), &msg, Bytes::from(answer)).await;
                    }
                }
            });

        self.publish_add(&tree::method_patch(sub)).await?;
        debug!(path = %base, "Method added");
        Ok(MethodHandle {
            base,
            ctx: self.ctx.clone(),
            listener: Some(listener),
        })
    }

    /// Merge a JSON patch into this node and publish it on `<base>.set`.
    pub async fn set(&self, content: &str) -> VbusResult<()> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| VbusError::InvalidJson(e.to_string()))?;
        self.tree.write().merge_at(&self.prefix, &value);
        self.ctx
            .publish_json(&Command::Set.subject(&self.base), &value)
            .await
    }

    /// Fetch this node's content from its owner and merge it locally.
    pub async fn get(&self) -> VbusResult<Tree> {
        let subject = Command::Get.subject(&self.base);
        let payload = self
            .ctx
            .request(&subject, Bytes::new(), self.ctx.timeouts.get())
            .await?;
        let fetched = Tree::parse(&payload)?;
        let mut tree = self.tree.write();
        tree.merge_at(&self.prefix, fetched.content());
        Ok(tree.subtree(&self.prefix))
    }

    /// A view on the child node at `sub`.
    ///
    /// Unknown children yield an empty placeholder; a known child that is
    /// not an object is an error.
    pub fn node(&self, sub: &str) -> VbusResult<NodeHandle> {
        path::validate_relative(sub)?;
        let local = self.local(sub);
        let tree = self.tree.read();
        if tree.exists(&local) && !tree.is_node(&local) {
            return Err(VbusError::NotANode(self.absolute(sub)));
        }
        Ok(NodeHandle {
            base: self.absolute(sub),
            prefix: local,
            tree: self.tree.clone(),
            ctx: self.ctx.clone(),
        })
    }

    /// Resolve the attribute at `sub`, fetching its parent node first when
    /// it is not known locally.
    pub async fn attribute(&self, sub: &str) -> VbusResult<AttributeHandle> {
        path::validate(sub)?;
        if !self.exists(sub) {
            let (parent, _) = path::split_last(sub);
            debug!(path = %self.absolute(sub), "Attribute unknown, fetching parent node");
            self.node(parent)?.get().await?;
        }
        let ty = self
            .tree
            .read()
            .attribute_type(&self.local(sub))
            .ok_or_else(|| VbusError::NotAnAttribute(self.absolute(sub)))?;
        Ok(self.attribute_handle(sub, ty))
    }

    fn attribute_handle(&self, sub: &str, ty: AttributeType) -> AttributeHandle {
        AttributeHandle {
            base: self.absolute(sub),
            path: self.local(sub),
            ty,
            tree: self.tree.clone(),
            ctx: self.ctx.clone(),
        }
    }

    /// A handle for calling the method at `sub`.
    pub fn method(&self, sub: &str) -> VbusResult<MethodHandle> {
        if sub.is_empty() {
            return Err(VbusError::NotAMethod(self.base.clone()));
        }
        path::validate(sub)?;
        match self.kind(sub) {
            None | Some(ElementKind::Method) => Ok(MethodHandle {
                base: self.absolute(sub),
                ctx: self.ctx.clone(),
                listener: None,
            }),
            Some(_) => Err(VbusError::NotAMethod(self.absolute(sub))),
        }
    }

    /// Observe `<base>.add`; every valid patch is merged then passed to `cb`.
    pub async fn subscribe_add(
        &self,
        cb: impl Fn(&Value) + Send + Sync + 'static,
    ) -> VbusResult<Listener> {
        self.subscribe_patch(Command::Add, ListenerKind::NodeAdd, cb)
            .await
    }

    /// Observe `<base>.set`; every valid patch is merged then passed to `cb`.
    pub async fn subscribe_set(
        &self,
        cb: impl Fn(&Value) + Send + Sync + 'static,
    ) -> VbusResult<Listener> {
        self.subscribe_patch(Command::Set, ListenerKind::NodeSet, cb)
            .await
    }

    /// Answer content requests on `<base>.get` with `cb`'s JSON.
    ///
    /// While this listener is open the router leaves those requests alone.
    /// Returning `None` sends no reply.
    pub async fn subscribe_get(
        &self,
        cb: impl Fn(&[u8]) -> Option<Value> + Send + Sync + 'static,
    ) -> VbusResult<Listener> {
        let subscription = self
            .ctx
            .transport
            .subscribe(&Command::Get.subject(&self.base))
            .await?;
        let transport = self.ctx.transport.clone();
        let cb = Arc::new(cb);
        Ok(self
            .ctx
            .registry
            .spawn(ListenerKind::NodeGet, subscription, move |msg| {
                let transport = transport.clone();
                let cb = cb.clone();
                async move {
                    let Some(content) = cb(&msg.payload) else {
                        return;
                    };
                    match serde_json::to_vec(&content) {
                        Ok(payload) => respond(transport.as_ref(), &msg, Bytes::from(payload)).await,
                        Err(e) => warn!(subject = %msg.subject, error = %e, "Unserializable node content"),
                    }
                }
            }))
    }

    async fn subscribe_patch(
        &self,
        command: Command,
        kind: ListenerKind,
        cb: impl Fn(&Value) + Send + Sync + 'static,
    ) -> VbusResult<Listener> {
        let subscription = self
            .ctx
            .transport
            .subscribe(&command.subject(&self.base))
            .await?;
        let tree = self.tree.clone();
        let prefix = self.prefix.clone();
        let cb = Arc::new(cb);
        Ok(self.ctx.registry.spawn(kind, subscription, move |msg| {
            let tree = tree.clone();
            let prefix = prefix.clone();
            let cb = cb.clone();
            async move {
                match msg.json() {
                    Ok(patch) => {
                        tree.write().merge_at(&prefix, &patch);
                        cb(&patch);
                    }
                    Err(e) => warn!(subject = %msg.subject, error = %e, "Ignoring patch"),
                }
            }
        }))
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("base", &self.base)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// A typed attribute.
#[derive(Clone)]
pub struct AttributeHandle {
    base: String,
    path: String,
    ty: AttributeType,
    tree: SharedTree,
    ctx: Arc<BusContext>,
}

impl AttributeHandle {
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn attr_type(&self) -> AttributeType {
        self.ty
    }

    /// Locally known value.
    pub fn value(&self) -> VbusResult<AttributeValue> {
        self.tree.read().attribute(&self.path)
    }

    /// Write a new value. The value's type must match the declared type.
    pub async fn set(&self, value: impl Into<AttributeValue>) -> VbusResult<()> {
        let value = value.into();
        if value.attr_type() != self.ty {
            return Err(VbusError::TypeMismatch {
                path: self.base.clone(),
                expected: self.ty,
                found: value.attr_type(),
            });
        }
        value.ensure_representable()?;
        self.tree.write().set(&self.path, value.to_json());
        self.ctx
            .transport
            .publish(
                &Command::Set.subject(&self.base),
                Bytes::from(value.to_wire()),
            )
            .await?;
        Ok(())
    }

    /// Fetch the current value from the owner.
    ///
    /// A string value whose text is an error envelope (`{"error": ..}`)
    /// cannot be told apart from a failed request and comes back as
    /// [`VbusError::RemoteError`].
    pub async fn get(&self) -> VbusResult<AttributeValue> {
        let payload = self
            .ctx
            .request(
                &Command::Get.subject(&self.base),
                Bytes::new(),
                self.ctx.timeouts.attribute_get(),
            )
            .await?;
        let text = String::from_utf8_lossy(&payload);
        let value = AttributeValue::parse_wire(self.ty, &text)?;
        self.tree.write().set(&self.path, value.to_json());
        Ok(value)
    }

    /// Observe writes on `<path>.set`.
    pub async fn subscribe_set(
        &self,
        cb: impl Fn(&AttributeValue) + Send + Sync + 'static,
    ) -> VbusResult<Listener> {
        let subscription = self
            .ctx
            .transport
            .subscribe(&Command::Set.subject(&self.base))
            .await?;
        let tree = self.tree.clone();
        let path = self.path.clone();
        let ty = self.ty;
        let cb = Arc::new(cb);
        Ok(self
            .ctx
            .registry
            .spawn(ListenerKind::AttributeSet, subscription, move |msg| {
                let tree = tree.clone();
                let path = path.clone();
                let cb = cb.clone();
                async move {
                    match AttributeValue::parse_wire(ty, &msg.payload_str()) {
                        Ok(value) => {
                            tree.write().set(&path, value.to_json());
                            cb(&value);
                        }
                        Err(e) => warn!(subject = %msg.subject, error = %e, "Ignoring attribute write"),
                    }
                }
            }))
    }

    /// Answer value requests on `<path>.get` with `cb`'s result.
    ///
    /// While this listener is open the router leaves those requests alone.
    pub async fn subscribe_get(
        &self,
        cb: impl Fn(&[u8]) -> Option<AttributeValue> + Send + Sync + 'static,
    ) -> VbusResult<Listener> {
        let subscription = self
            .ctx
            .transport
            .subscribe(&Command::Get.subject(&self.base))
            .await?;
        let transport = self.ctx.transport.clone();
        let cb = Arc::new(cb);
        Ok(self
            .ctx
            .registry
            .spawn(ListenerKind::AttributeGet, subscription, move |msg| {
                let transport = transport.clone();
                let cb = cb.clone();
                async move {
                    if let Some(value) = cb(&msg.payload) {
                        respond(transport.as_ref(), &msg, Bytes::from(value.to_wire())).await;
                    }
                }
            }))
    }
}

impl std::fmt::Debug for AttributeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeHandle")
            .field("base", &self.base)
            .field("type", &self.ty)
            .finish()
    }
}

/// A remotely callable method.
pub struct MethodHandle {
    base: String,
    ctx: Arc<BusContext>,
    listener: Option<Listener>,
}

impl MethodHandle {
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Invocation listener, for methods declared by this process.
    pub fn listener(&self) -> Option<&Listener> {
        self.listener.as_ref()
    }

    /// Call with a JSON argument and parse the JSON answer.
    pub async fn call(&self, args: &Value, timeout: Duration) -> VbusResult<Value> {
        let payload = serde_json::to_vec(args)?;
        let answer = self.call_raw(Bytes::from(payload), timeout).await?;
        serde_json::from_slice(&answer).map_err(|e| VbusError::InvalidJson(e.to_string()))
    }

    pub async fn call_raw(&self, payload: Bytes, timeout: Duration) -> VbusResult<Bytes> {
        self.ctx
            .request(&Command::Set.subject(&self.base), payload, timeout)
            .await
    }

    /// Fire-and-forget invocation.
    pub async fn set(&self, payload: Bytes) -> VbusResult<()> {
        self.ctx
            .transport
            .publish(&Command::Set.subject(&self.base), payload)
            .await?;
        Ok(())
    }

    /// Stop serving calls. No-op for handles on remote methods.
    pub async fn close(&self) {
        if let Some(listener) = &self.listener {
            listener.close().await;
        }
    }
}

impl std::fmt::Debug for MethodHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodHandle")
            .field("base", &self.base)
            .field("listener", &self.listener)
            .finish()
    }
}
