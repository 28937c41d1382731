//! vBus kernel.
//!
//! Owns a process's share of the distributed object tree: the local content,
//! the command router that answers for it on the bus, scatter-gather
//! discovery, the persisted identity and its registration with the
//! authorization service, broker resolution and permission requests.
//! [`VbusClient`] ties these together.

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod logging;
#[cfg(feature = "mdns")]
pub mod mdns;
pub mod node;
pub mod permission;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod tree;

pub use client::VbusClient;
pub use error::{KernelError, KernelResult};
pub use identity::IdentityStore;
#[cfg(feature = "mdns")]
pub use mdns::MdnsBrowser;
pub use node::{AttributeHandle, MethodHandle, MethodHandler, NodeHandle};
pub use permission::PermissionOutcome;
pub use registry::{Listener, ListenerKind, SubscriptionRegistry};
pub use resolver::{BrokerResolver, Resolution, ResolutionSource, ServiceAdvert, ServiceBrowser};
pub use router::{CommandRouter, RouterState};
pub use tree::{ElementKind, SharedTree, Tree};
