//! Broker resolution.
//!
//! Candidates are tried in order, each validated by a liveness probe before
//! it is accepted:
//!
//! 1. the URL cached in the identity record
//! 2. the configured override (`VBUS_URL`)
//! 3. `nats://<hostname>.local:<port>`
//! 4. local-network discovery of the advertised broker service

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vbus_types::config::{DiscoveryConfig, VbusConfig};
use vbus_types::{VbusError, VbusResult};
use vbus_wire::Connector;

/// Which strategy produced the broker URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Cached,
    Environment,
    Convention,
    Discovery,
}

/// A validated broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub url: String,
    /// Hostname segment used in the identity and authorization subjects.
    pub hostname: String,
    pub source: ResolutionSource,
}

/// A service instance seen on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvert {
    pub instance: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// TXT properties.
    pub properties: HashMap<String, String>,
}

impl ServiceAdvert {
    /// `nats://<addr>:<port>`, preferring IPv4.
    pub fn url(&self) -> Option<String> {
        let addr = self
            .addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| self.addresses.first())?;
        Some(format!("nats://{}", SocketAddr::new(*addr, self.port)))
    }
}

/// Local-network service discovery.
#[async_trait]
pub trait ServiceBrowser: Send + Sync + 'static {
    /// Every advert of `service_type` seen within `timeout`.
    async fn browse(&self, service_type: &str, timeout: Duration) -> VbusResult<Vec<ServiceAdvert>>;
}

/// Hostname of this machine, up to the first dot.
pub fn local_hostname() -> String {
    let full = gethostname::gethostname().to_string_lossy().into_owned();
    match full.split('.').next() {
        Some(short) if !short.is_empty() => short.to_string(),
        _ => "localhost".to_string(),
    }
}

/// `nats://<hostname>.local:<port>`.
pub fn convention_url(hostname: &str, port: u16) -> String {
    format!("nats://{hostname}.local:{port}")
}

/// Runs the strategy chain.
pub struct BrokerResolver {
    connector: Arc<dyn Connector>,
    browser: Option<Arc<dyn ServiceBrowser>>,
    override_url: Option<String>,
    port: u16,
    discovery: DiscoveryConfig,
    probe_timeout: Duration,
}

impl BrokerResolver {
    pub fn new(
        connector: Arc<dyn Connector>,
        browser: Option<Arc<dyn ServiceBrowser>>,
        config: &VbusConfig,
    ) -> Self {
        Self {
            connector,
            browser,
            override_url: config.broker_url.clone(),
            port: config.broker_port,
            discovery: config.discovery.clone(),
            probe_timeout: config.timeouts.probe(),
        }
    }

    async fn validate(&self, url: &str) -> bool {
        match tokio::time::timeout(self.probe_timeout, self.connector.probe(url)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(url, error = %e, "Broker probe failed");
                false
            }
            Err(_) => {
                debug!(url, "Broker probe timed out");
                false
            }
        }
    }

    /// Find a live broker. `hostname` is kept unless discovery reports the
    /// broker's own hostname.
    pub async fn resolve(&self, cached_url: Option<&str>, hostname: &str) -> VbusResult<Resolution> {
        let found = |url: &str, source| Resolution {
            url: url.to_string(),
            hostname: hostname.to_string(),
            source,
        };

        if let Some(url) = cached_url {
            if self.validate(url).await {
                info!(url, "Broker from identity record");
                return Ok(found(url, ResolutionSource::Cached));
            }
            warn!(url, "Cached broker URL unreachable");
        }

        if let Some(url) = self.override_url.as_deref() {
            if self.validate(url).await {
                info!(url, "Broker from environment");
                return Ok(found(url, ResolutionSource::Environment));
            }
            warn!(url, "Broker URL override unreachable");
        }

        let url = convention_url(hostname, self.port);
        if self.validate(&url).await {
            info!(url = %url, "Broker from hostname convention");
            return Ok(found(&url, ResolutionSource::Convention));
        }
        debug!(url = %url, "Convention broker URL unreachable");

        if let Some(resolution) = self.discover(hostname).await {
            return Ok(resolution);
        }

        Err(VbusError::NoBrokerFound)
    }

    async fn discover(&self, hostname: &str) -> Option<Resolution> {
        let browser = self.browser.as_ref()?;
        let adverts = match browser
            .browse(&self.discovery.service_type, self.discovery.browse_timeout())
            .await
        {
            Ok(adverts) => adverts,
            Err(e) => {
                warn!(error = %e, "Broker discovery failed");
                return None;
            }
        };
        let advert = adverts
            .into_iter()
            .find(|a| a.instance == self.discovery.instance)?;
        let url = advert.url()?;
        if !self.validate(&url).await {
            warn!(url = %url, "Discovered broker unreachable");
            return None;
        }
        let hostname = advert
            .properties
            .get("hostname")
            .filter(|h| !h.is_empty())
            .cloned()
            .unwrap_or_else(|| hostname.to_string());
        info!(url = %url, hostname = %hostname, "Broker from network discovery");
        Some(Resolution {
            url,
            hostname,
            source: ResolutionSource::Discovery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use vbus_wire::{BusTransport, Credentials, LocalBroker, TransportError};

    /// Connector that only answers for one URL and records every attempt.
    struct Recording {
        broker: LocalBroker,
        attempts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Connector for Recording {
        async fn connect(
            &self,
            url: &str,
            credentials: &Credentials,
        ) -> Result<Arc<dyn BusTransport>, TransportError> {
            self.attempts
                .lock()
                .unwrap()
                .push(url.to_string());
            self.broker.connect(url, credentials).await
        }
    }

    struct FixedBrowser {
        adverts: Vec<ServiceAdvert>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServiceBrowser for FixedBrowser {
        async fn browse(&self, _: &str, _: Duration) -> VbusResult<Vec<ServiceAdvert>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.adverts.clone())
        }
    }

    fn setup(live: &str, adverts: Vec<ServiceAdvert>, override_url: Option<&str>) -> (BrokerResolver, Arc<Recording>, Arc<FixedBrowser>) {
        let connector = Arc::new(Recording {
            broker: LocalBroker::new(live),
            attempts: Mutex::new(Vec::new()),
        });
        let browser = Arc::new(FixedBrowser {
            adverts,
            calls: AtomicUsize::new(0),
        });
        let mut config = VbusConfig::default();
        config.broker_url = override_url.map(String::from);
        let resolver = BrokerResolver::new(connector.clone(), Some(browser.clone()), &config);
        (resolver, connector, browser)
    }

    fn advert(instance: &str, ip: &str, port: u16, host: Option<&str>) -> ServiceAdvert {
        let mut properties = HashMap::new();
        if let Some(h) = host {
            properties.insert("hostname".to_string(), h.to_string());
        }
        ServiceAdvert {
            instance: instance.to_string(),
            addresses: vec![ip.parse().unwrap()],
            port,
            properties,
        }
    }

    #[tokio::test]
    async fn test_cached_url_short_circuits() {
        let (resolver, connector, browser) =
            setup("nats://cached:1", vec![], Some("nats://env:1"));
        let res = resolver.resolve(Some("nats://cached:1"), "hub1").await.unwrap();
        assert_eq!(res.source, ResolutionSource::Cached);
        assert_eq!(res.hostname, "hub1");
        assert_eq!(*connector.attempts.lock().unwrap(), vec!["nats://cached:1"]);
        assert_eq!(browser.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_through_in_order() {
        let (resolver, connector, _) =
            setup("nats://hub1.local:21400", vec![], Some("nats://env:1"));
        let res = resolver.resolve(Some("nats://stale:1"), "hub1").await.unwrap();
        assert_eq!(res.source, ResolutionSource::Convention);
        assert_eq!(
            *connector.attempts.lock().unwrap(),
            vec!["nats://stale:1", "nats://env:1", "nats://hub1.local:21400"]
        );
    }

    #[tokio::test]
    async fn test_discovery_matches_instance_and_hostname() {
        let adverts = vec![
            advert("other", "10.0.0.9", 4222, None),
            advert("vBus", "10.0.0.5", 21400, Some("veea42")),
        ];
        let (resolver, _, browser) = setup("nats://10.0.0.5:21400", adverts, None);
        let res = resolver.resolve(None, "laptop").await.unwrap();
        assert_eq!(res.source, ResolutionSource::Discovery);
        assert_eq!(res.url, "nats://10.0.0.5:21400");
        assert_eq!(res.hostname, "veea42");
        assert_eq!(browser.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nothing_found() {
        let (resolver, _, _) = setup("nats://nowhere:1", vec![], None);
        assert!(matches!(
            resolver.resolve(None, "hub1").await,
            Err(VbusError::NoBrokerFound)
        ));
    }

    #[test]
    fn test_advert_url_prefers_ipv4() {
        let mut a = advert("vBus", "fe80::1", 21400, None);
        assert_eq!(a.url().unwrap(), "nats://[fe80::1]:21400");
        a.addresses.push("192.168.1.2".parse().unwrap());
        assert_eq!(a.url().unwrap(), "nats://192.168.1.2:21400");
    }

    #[test]
    fn test_convention_and_hostname() {
        assert_eq!(convention_url("hub1", 21400), "nats://hub1.local:21400");
        let host = local_hostname();
        assert!(!host.is_empty());
        assert!(!host.contains('.'));
    }
}
