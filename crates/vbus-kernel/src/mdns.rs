//! mDNS/DNS-SD browser backing the last resolution strategy.

use crate::resolver::{ServiceAdvert, ServiceBrowser};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vbus_types::{VbusError, VbusResult};

/// Browses with a fresh [`ServiceDaemon`] per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct MdnsBrowser;

impl MdnsBrowser {
    pub fn new() -> Self {
        Self
    }
}

/// Instance label of a DNS-SD full name such as `vBus._nats._tcp.local.`.
fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

fn browse_blocking(service_type: &str, timeout: Duration) -> VbusResult<Vec<ServiceAdvert>> {
    let daemon = ServiceDaemon::new().map_err(|e| VbusError::Transport(e.to_string()))?;
    let receiver = daemon
        .browse(service_type)
        .map_err(|e| VbusError::Transport(e.to_string()))?;

    let deadline = Instant::now() + timeout;
    let mut adverts = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let mut properties = HashMap::new();
                if let Some(host) = info.get_property_val_str("hostname") {
                    properties.insert("hostname".to_string(), host.to_string());
                }
                let advert = ServiceAdvert {
                    instance: instance_name(info.get_fullname(), service_type),
                    addresses: info.get_addresses().iter().map(|a| IpAddr::from(*a)).collect(),
                    port: info.get_port(),
                    properties,
                };
                debug!(instance = %advert.instance, port = advert.port, "mDNS service resolved");
                adverts.push(advert);
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    if let Err(e) = daemon.shutdown() {
        warn!(error = %e, "mDNS daemon shutdown failed");
    }
    Ok(adverts)
}

#[async_trait]
impl ServiceBrowser for MdnsBrowser {
    async fn browse(&self, service_type: &str, timeout: Duration) -> VbusResult<Vec<ServiceAdvert>> {
        let service_type = service_type.to_string();
        tokio::task::spawn_blocking(move || browse_blocking(&service_type, timeout))
            .await
            .map_err(|e| VbusError::Internal(format!("mDNS browse task failed: {e}")))?
    }
}
