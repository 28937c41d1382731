//! `VbusClient`, the entry point for applications.
//!
//! A client owns the process identity, one bus connection, the command
//! router serving the local content under `<service_id>.<hostname>`, and the
//! registry of every listener opened through its handles.

use crate::bootstrap;
use crate::config;
use crate::discovery;
use crate::error::KernelResult;
use crate::identity::IdentityStore;
use crate::node::{AttributeHandle, BusContext, MethodHandle, NodeHandle};
use crate::permission::{self, PermissionOutcome};
use crate::registry::SubscriptionRegistry;
use crate::resolver::{self, BrokerResolver, ServiceBrowser};
use crate::router::CommandRouter;
use crate::tree::{SharedTree, Tree};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use vbus_types::config::VbusConfig;
use vbus_types::path;
use vbus_types::{VbusError, VbusResult};
use vbus_wire::{BusTransport, Connector};

/// A connected vBus participant.
pub struct VbusClient {
    config: VbusConfig,
    hostname: String,
    identity: String,
    store: Arc<IdentityStore>,
    ctx: Arc<BusContext>,
    router: Arc<CommandRouter>,
    root: NodeHandle,
}

impl VbusClient {
    /// Full bootstrap: identity, broker resolution, registration, router.
    pub async fn open(
        config: VbusConfig,
        connector: Arc<dyn Connector>,
        browser: Option<Arc<dyn ServiceBrowser>>,
    ) -> KernelResult<Self> {
        let local = resolver::local_hostname();
        let identity = format!("{}.{local}", config.service_id);
        path::validate(&identity)?;

        let state_dir = config::state_dir(&config);
        let (store, created) = IdentityStore::open(&state_dir, &config.service_id, &identity)?;
        let hostname = store.hostname().unwrap_or(local);
        debug!(identity = %identity, %hostname, created, "Identity ready");

        let resolution = BrokerResolver::new(connector.clone(), browser, &config)
            .resolve(store.broker_url().as_deref(), &hostname)
            .await?;
        store.set_broker(&resolution.url, &resolution.hostname)?;
        info!(url = %resolution.url, source = ?resolution.source, "Broker resolved");

        let transport = bootstrap::connect_registered(
            connector.as_ref(),
            &resolution.url,
            &store,
            &resolution.hostname,
            config.timeouts.registration_wait(),
        )
        .await?;

        Ok(Self::attach(config, transport, Arc::new(store), resolution.hostname).await?)
    }

    /// Build a client over an already open connection.
    pub async fn attach(
        config: VbusConfig,
        transport: Arc<dyn BusTransport>,
        store: Arc<IdentityStore>,
        hostname: impl Into<String>,
    ) -> VbusResult<Self> {
        let hostname = hostname.into();
        let identity = store.identity();
        let registry = SubscriptionRegistry::new();
        let ctx = Arc::new(BusContext::new(
            transport,
            registry,
            config.timeouts.clone(),
            hostname.clone(),
        ));
        let tree = SharedTree::new(Tree::node());
        let router = Arc::new(CommandRouter::new(
            identity.clone(),
            config.service_id.clone(),
            tree.clone(),
            ctx.clone(),
        )?);
        router.register().await?;
        let root = NodeHandle::new(identity.clone(), tree, ctx.clone());
        info!(identity = %identity, %hostname, "vBus client ready");

        Ok(Self {
            config,
            hostname,
            identity,
            store,
            ctx,
            router,
            root,
        })
    }

    /// The node this process owns.
    pub fn root(&self) -> &NodeHandle {
        &self.root
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// `<service_id>.<hostname>`.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &VbusConfig {
        &self.config
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn BusTransport> {
        &self.ctx.transport
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.ctx.registry
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    fn mirror(&self, base: &str) -> NodeHandle {
        NodeHandle::new(base, SharedTree::default(), self.ctx.clone())
    }

    /// Replace an interior `local` segment with this host's name.
    fn resolve_path(&self, raw: &str) -> VbusResult<String> {
        let resolved = path::sanitize_local(raw, &self.hostname);
        path::validate(&resolved)?;
        Ok(resolved)
    }

    /// A mirror of a node owned by someone else. Nothing is fetched until
    /// [`NodeHandle::get`].
    pub fn remote_node(&self, raw: &str) -> VbusResult<NodeHandle> {
        Ok(self.mirror(&self.resolve_path(raw)?))
    }

    /// Resolve a remote attribute, fetching its parent node.
    pub async fn remote_attribute(&self, raw: &str) -> VbusResult<AttributeHandle> {
        let resolved = self.resolve_path(raw)?;
        let (parent, name) = path::split_last(&resolved);
        if parent.is_empty() {
            return Err(VbusError::NotAnAttribute(resolved));
        }
        self.mirror(parent).attribute(name).await
    }

    /// A handle for calling a remote method.
    pub fn remote_method(&self, raw: &str) -> VbusResult<MethodHandle> {
        let resolved = self.resolve_path(raw)?;
        let (parent, name) = path::split_last(&resolved);
        if parent.is_empty() {
            return Err(VbusError::NotAMethod(resolved));
        }
        self.mirror(parent).method(name)
    }

    /// Scatter-gather every owner under `raw` for `timeout`.
    pub async fn discover(&self, raw: &str, timeout: Duration) -> VbusResult<Tree> {
        self.discover_with_filter(raw, &[], timeout).await
    }

    /// [`discover`](Self::discover) over the configured discovery window.
    pub async fn discover_default(&self, raw: &str) -> VbusResult<Tree> {
        self.discover(raw, self.config.timeouts.discover()).await
    }

    /// Like [`discover`](Self::discover), forwarding `filter` as the probe
    /// payload.
    pub async fn discover_with_filter(
        &self,
        raw: &str,
        filter: &[u8],
        timeout: Duration,
    ) -> VbusResult<Tree> {
        let resolved = self.resolve_path(raw)?;
        discovery::gather(self.ctx.transport.as_ref(), &resolved, filter, timeout).await
    }

    /// Ask the authorization service for rights on `permission`.
    pub async fn request_permission(&self, permission: &str) -> VbusResult<PermissionOutcome> {
        permission::request_permission(
            self.ctx.transport.as_ref(),
            &self.store,
            &self.hostname,
            permission,
            self.config.timeouts.permission(),
            self.config.timeouts.permission_settle(),
        )
        .await
    }

    /// Stop the router, close every listener, then the connection.
    pub async fn close(&self) -> VbusResult<()> {
        self.router.close().await;
        self.ctx.registry.close_all().await;
        self.ctx.transport.flush().await?;
        self.ctx.transport.close().await?;
        info!(identity = %self.identity, "vBus client closed");
        Ok(())
    }
}

impl std::fmt::Debug for VbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VbusClient")
            .field("identity", &self.identity)
            .field("hostname", &self.hostname)
            .field("router", &self.router.state())
            .finish()
    }
}
