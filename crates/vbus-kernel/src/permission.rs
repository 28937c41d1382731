//! Permission requests against the authorization service.

use crate::identity::IdentityStore;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};
use vbus_types::path;
use vbus_types::value::parse_bool;
use vbus_types::{VbusError, VbusResult};
use vbus_wire::BusTransport;

/// Result of a successful [`request_permission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// The service accepted the grant and it was persisted.
    Granted,
    /// The grant was already held; nothing was sent.
    AlreadyGranted,
}

/// `system.authorization.<hostname>.<identity>.permissions.set`.
pub fn permissions_set_subject(hostname: &str, identity: &str) -> String {
    format!("system.authorization.{hostname}.{identity}.permissions.set")
}

/// Ask for subscribe and publish rights on `permission`.
///
/// The candidate list (current grants plus the new one) is sent to the
/// authorization service. The reply is a boolean in text form. The local
/// record is only updated once the service said yes, after `settle` has
/// passed so the broker can reload its configuration.
pub async fn request_permission(
    transport: &dyn BusTransport,
    store: &IdentityStore,
    hostname: &str,
    permission: &str,
    timeout: Duration,
    settle: Duration,
) -> VbusResult<PermissionOutcome> {
    if path::bad_subject(permission) {
        return Err(VbusError::InvalidPath(permission.to_string()));
    }
    let current = store.permissions();
    if current.contains(permission) {
        debug!(permission, "Permission already held");
        return Ok(PermissionOutcome::AlreadyGranted);
    }

    let candidate = current.with_grant(permission);
    let subject = permissions_set_subject(hostname, &store.identity());
    let payload = Bytes::from(serde_json::to_vec(&candidate)?);
    let reply = transport.request(&subject, payload, timeout).await?;

    let text = reply.payload_str();
    let accepted = parse_bool(text.trim()).ok_or_else(|| {
        VbusError::Protocol(format!("permission reply is not a boolean: {text:?}"))
    })?;
    if !accepted {
        warn!(permission, "Permission refused");
        return Err(VbusError::PermissionDenied(permission.to_string()));
    }

    tokio::time::sleep(settle).await;
    store.grant_permission(permission)?;
    info!(permission, "Permission granted");
    Ok(PermissionOutcome::Granted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbus_wire::{Credentials, LocalBroker, LocalConnection};
    use std::sync::Arc;

    async fn answer_with(broker: &LocalBroker, subject: &str, answer: &'static str) {
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        let mut sub = conn.subscribe(subject).await.unwrap();
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                if let Some(reply) = msg.reply {
                    conn.publish(&reply, Bytes::from_static(answer.as_bytes()))
                        .await
                        .unwrap();
                }
            }
        });
    }

    fn setup() -> (tempfile::TempDir, IdentityStore, LocalBroker, Arc<LocalConnection>) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = IdentityStore::open(dir.path(), "app.x", "app.x.hub").unwrap();
        let broker = LocalBroker::new("nats://hub:1");
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        (dir, store, broker, conn)
    }

    const SUBJECT: &str = "system.authorization.hub.app.x.hub.permissions.set";

    #[tokio::test]
    async fn test_granted_is_persisted() {
        let (_dir, store, broker, conn) = setup();
        answer_with(&broker, SUBJECT, "true").await;
        let outcome = request_permission(
            conn.as_ref(),
            &store,
            "hub",
            "system.>",
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert_eq!(outcome, PermissionOutcome::Granted);
        assert!(store.permissions().contains("system.>"));

        let (reloaded, created) =
            IdentityStore::open(store.path().parent().unwrap(), "app.x", "app.x.hub").unwrap();
        assert!(!created);
        assert!(reloaded.permissions().publish.contains(&"system.>".to_string()));
    }

    #[tokio::test]
    async fn test_second_request_sends_nothing() {
        let (_dir, store, broker, conn) = setup();
        answer_with(&broker, SUBJECT, "T").await;
        for _ in 0..2 {
            request_permission(
                conn.as_ref(),
                &store,
                "hub",
                "system.>",
                Duration::from_secs(1),
                Duration::ZERO,
            )
            .await
            .unwrap();
        }
        assert_eq!(conn.request_count(), 1);
    }

    #[tokio::test]
    async fn test_refused_leaves_record_untouched() {
        let (_dir, store, broker, conn) = setup();
        answer_with(&broker, SUBJECT, "false").await;
        let before = store.permissions();
        let result = request_permission(
            conn.as_ref(),
            &store,
            "hub",
            "system.>",
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .await;
        assert!(matches!(result, Err(VbusError::PermissionDenied(_))));
        assert_eq!(store.permissions(), before);
    }

    #[tokio::test]
    async fn test_garbled_reply_is_protocol_error() {
        let (_dir, store, broker, conn) = setup();
        answer_with(&broker, SUBJECT, "maybe").await;
        let result = request_permission(
            conn.as_ref(),
            &store,
            "hub",
            "system.>",
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .await;
        assert!(matches!(result, Err(VbusError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_silent_service_times_out() {
        let (_dir, store, broker, conn) = setup();
        let listener = broker.connect_local(&Credentials::anonymous()).unwrap();
        let _silent = listener.subscribe(SUBJECT).await.unwrap();
        let before = store.permissions();
        let result = request_permission(
            conn.as_ref(),
            &store,
            "hub",
            "system.>",
            Duration::from_millis(50),
            Duration::ZERO,
        )
        .await;
        assert!(matches!(result, Err(VbusError::Timeout(_))));
        assert_eq!(store.permissions(), before);
    }

    #[tokio::test]
    async fn test_invalid_permission_rejected_locally() {
        let (_dir, store, _broker, conn) = setup();
        let result = request_permission(
            conn.as_ref(),
            &store,
            "hub",
            "bad subject",
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .await;
        assert!(matches!(result, Err(VbusError::InvalidPath(_))));
        assert_eq!(conn.request_count(), 0);
    }
}
