//! vBus wire layer.
//!
//! Everything that touches the message bus goes through this crate.
//!
//! ## Architecture
//!
//! - **BusMessage**: subject, optional reply subject, payload
//! - **BusTransport**: trait for an open broker connection
//! - **Connector**: trait for opening connections to a broker URL
//! - **LocalBroker**: in-process broker used by tests and embedded setups
//! - **NatsConnector**: NATS client adapter (`nats` feature)

pub mod local;
pub mod message;
#[cfg(feature = "nats")]
pub mod nats;
pub mod subject;
pub mod subscription;
pub mod transport;

pub use local::{LocalBroker, LocalConnection};
pub use message::{BusMessage, ErrorReply};
#[cfg(feature = "nats")]
pub use nats::{NatsConnector, NatsTransport};
pub use subscription::{Subscription, SubscriptionGuard};
pub use transport::{BusTransport, Connector, Credentials, TransportError};
