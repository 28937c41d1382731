//! First connection and self-registration.

use crate::error::{KernelError, KernelResult};
use crate::identity::IdentityStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vbus_wire::{BusTransport, Connector, Credentials, TransportError};

/// Subject on which unregistered clients announce themselves.
pub fn authorization_add_subject(hostname: &str) -> String {
    format!("system.authorization.{hostname}.add")
}

/// Connect with the stored identity, registering it first if the broker
/// does not know it yet.
///
/// On an authentication failure the client connects anonymously, publishes
/// its `client` section on `system.authorization.<hostname>.add`, waits
/// `wait` for the authorization service and then retries once.
pub async fn connect_registered(
    connector: &dyn Connector,
    url: &str,
    store: &IdentityStore,
    hostname: &str,
    wait: Duration,
) -> KernelResult<Arc<dyn BusTransport>> {
    let credentials = store.credentials();
    match connector.connect(url, &credentials).await {
        Ok(transport) => {
            info!(user = %credentials.user, url, "Connected");
            return Ok(transport);
        }
        Err(TransportError::AuthenticationFailed(reason)) => {
            info!(user = %credentials.user, %reason, "Identity unknown to broker, registering");
        }
        Err(e) => {
            return Err(KernelError::BootFailed(format!("connect to {url}: {e}")));
        }
    }

    register(connector, url, store, hostname).await?;
    tokio::time::sleep(wait).await;

    connector.connect(url, &credentials).await.map_err(|e| {
        warn!(user = %credentials.user, error = %e, "Connect after registration failed");
        KernelError::BootFailed(format!("connect after registration: {e}"))
    })
}

async fn register(
    connector: &dyn Connector,
    url: &str,
    store: &IdentityStore,
    hostname: &str,
) -> KernelResult<()> {
    let anonymous = connector
        .connect(url, &Credentials::anonymous())
        .await
        .map_err(|e| KernelError::BootFailed(format!("anonymous connect: {e}")))?;
    let subject = authorization_add_subject(hostname);
    let payload = store.registration_payload()?;
    anonymous.publish(&subject, payload).await?;
    anonymous.flush().await?;
    anonymous.close().await?;
    info!(subject = %subject, "Registration published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::verify_password;
    use crate::identity::ClientSection;
    use vbus_wire::LocalBroker;

    const URL: &str = "nats://hub:21400";

    /// Stand-in authorization service: adds every announced client.
    async fn serve_authorization(broker: &LocalBroker, hostname: &str) {
        let conn = broker.connect_local(&Credentials::anonymous()).unwrap();
        let mut sub = conn.subscribe(&authorization_add_subject(hostname)).await.unwrap();
        let broker = broker.clone();
        tokio::spawn(async move {
            let _conn = conn;
            while let Some(msg) = sub.recv().await {
                let client: ClientSection = serde_json::from_slice(&msg.payload).unwrap();
                let hash = client.password.clone();
                broker.add_user_with(client.user, move |pw: &str| verify_password(pw, &hash));
            }
        });
    }

    #[tokio::test]
    async fn test_known_identity_connects_directly() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = IdentityStore::open(dir.path(), "app.x", "app.x.hub").unwrap();
        let broker = LocalBroker::new(URL);
        let creds = store.credentials();
        broker.add_user(creds.user, creds.password);

        connect_registered(&broker, URL, &store, "hub", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(broker.auth_failure_count(), 0);
        assert!(broker.history().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_identity_registers_then_connects() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = IdentityStore::open(dir.path(), "app.x", "app.x.hub").unwrap();
        let broker = LocalBroker::new(URL);
        serve_authorization(&broker, "hub").await;

        connect_registered(&broker, URL, &store, "hub", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(broker.has_user("app.x.hub"));
        assert_eq!(broker.auth_failure_count(), 1);
        let announced = broker.history();
        assert_eq!(announced[0].subject, "system.authorization.hub.add");
    }

    #[tokio::test]
    async fn test_registration_ignored_fails_boot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = IdentityStore::open(dir.path(), "app.x", "app.x.hub").unwrap();
        let broker = LocalBroker::new(URL);

        let err = connect_registered(&broker, URL, &store, "hub", Duration::ZERO)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, KernelError::BootFailed(_)));
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_boot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = IdentityStore::open(dir.path(), "app.x", "app.x.hub").unwrap();
        let broker = LocalBroker::new(URL);
        let result = connect_registered(&broker, "nats://elsewhere:1", &store, "hub", Duration::ZERO).await;
        assert!(matches!(result, Err(KernelError::BootFailed(_))));
    }
}
