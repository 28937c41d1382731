//! Core types for the vBus object tree.
//!
//! This crate defines the shared data structures used by the wire layer and
//! the kernel: path handling, typed attribute values, command suffixes,
//! permission grants, configuration and the error taxonomy. It contains no
//! I/O and no business logic.

pub mod command;
pub mod config;
pub mod error;
pub mod path;
pub mod permission;
pub mod value;

pub use command::Command;
pub use error::{VbusError, VbusResult};
pub use permission::Permissions;
pub use value::{AttributeType, AttributeValue};
