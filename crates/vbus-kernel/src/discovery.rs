//! Scatter-gather discovery.
//!
//! A probe is published on the requested path with a single-use sandbox
//! reply subject. Every owner whose base lies under that path answers once;
//! the replies are merged for the whole window.

use crate::tree::Tree;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use vbus_types::path;
use vbus_types::{VbusError, VbusResult};
use vbus_wire::BusTransport;

/// Prefix of discovery reply subjects.
pub const SANDBOX_PREFIX: &str = "SANDBOX";

/// A fresh sandbox reply subject.
pub fn sandbox_subject() -> String {
    format!("{SANDBOX_PREFIX}.{}", uuid::Uuid::new_v4().simple())
}

/// Probe `path` and merge every reply received within `timeout`.
///
/// Always waits the full window. Fails with [`VbusError::DiscoverEmpty`]
/// when no valid reply arrived.
pub async fn gather(
    transport: &dyn BusTransport,
    target: &str,
    filter: &[u8],
    timeout: Duration,
) -> VbusResult<Tree> {
    path::validate(target)?;
    let sandbox = sandbox_subject();
    let mut subscription = transport.subscribe(&sandbox).await?;
    transport
        .publish_request(target, &sandbox, Bytes::copy_from_slice(filter))
        .await?;

    let deadline = Instant::now() + timeout;
    let mut accumulator = Tree::empty();
    let mut replies = 0usize;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, subscription.recv()).await {
            Ok(Some(msg)) => match Tree::parse(&msg.payload) {
                Ok(reply) => {
                    accumulator.merge(reply.content());
                    replies += 1;
                }
                Err(e) => debug!(path = %target, error = %e, "Ignoring discovery reply"),
            },
            Ok(None) | Err(_) => break,
        }
    }
    subscription.unsubscribe();

    if replies == 0 {
        return Err(VbusError::DiscoverEmpty(target.to_string()));
    }
    info!(path = %target, replies, "Discovery complete");
    Ok(accumulator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbus_wire::{Credentials, LocalBroker};

    #[test]
    fn test_sandbox_subject_is_single_token_below_prefix() {
        let subject = sandbox_subject();
        assert!(subject.starts_with("SANDBOX."));
        assert!(!path::bad_subject(&subject));
        assert_eq!(path::segments(&subject).count(), 2);
        assert_ne!(subject, sandbox_subject());
    }

    #[tokio::test]
    async fn test_no_responder_is_empty() {
        let broker = LocalBroker::new("nats://t:1");
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        let result = gather(conn.as_ref(), "system", b"", Duration::from_millis(30)).await;
        assert!(matches!(result, Err(VbusError::DiscoverEmpty(_))));
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let broker = LocalBroker::new("nats://t:1");
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        let result = gather(conn.as_ref(), "a..b", b"", Duration::from_millis(10)).await;
        assert!(matches!(result, Err(VbusError::InvalidPath(_))));
    }
}
