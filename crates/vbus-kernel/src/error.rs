//! Kernel-specific error types.

use thiserror::Error;
use vbus_types::error::VbusError;

/// Kernel error type wrapping VbusError with bootstrap context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped VbusError.
    #[error(transparent)]
    Vbus(#[from] VbusError),

    /// The client failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

impl From<vbus_wire::TransportError> for KernelError {
    fn from(e: vbus_wire::TransportError) -> Self {
        KernelError::Vbus(e.into())
    }
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
