//! mDNS discovery of networked radios
//!
//! [`ServiceRegistry`] turns resolved and withdrawn service announcements
//! into [`DiscoveryEvent`]s without touching the network. The browse loop
//! feeds it from an `mdns-sd` daemon.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::device::{Device, DeviceId, TransportType};
use crate::event::DiscoveryEvent;

/// TXT key carrying the node's short name
pub const TXT_SHORTNAME: &str = "shortname";

/// TXT key carrying the node id
pub const TXT_ID: &str = "id";

/// A service whose host and port are known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    /// Service instance name (first label of the full name)
    pub instance: String,
    /// Host name the service resolved to
    pub hostname: String,
    /// Addresses reported for the host
    pub addresses: Vec<IpAddr>,
    /// Service port
    pub port: u16,
    /// TXT `shortname`, if present
    pub shortname: Option<String>,
    /// TXT `id`, if present
    pub node_id: Option<String>,
    /// Whether the service carried any TXT properties
    pub has_txt: bool,
}

impl ServiceAnnouncement {
    fn ipv4(&self) -> Option<IpAddr> {
        self.addresses.iter().copied().find(IpAddr::is_ipv4)
    }

    fn host(&self) -> &str {
        self.hostname.trim_end_matches('.')
    }

    /// Human-readable label
    ///
    /// `shortname` joined with the last four characters of `id` when TXT
    /// data is present, otherwise `"<instance> (<ipv4>)"`.
    pub fn label(&self) -> String {
        let ip = self
            .ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "Unknown IP".to_string());

        if self.has_txt {
            let mut label = self.shortname.clone().unwrap_or_default();
            if let Some(id) = &self.node_id {
                let chars: Vec<char> = id.chars().collect();
                if chars.len() > 4 {
                    if !label.is_empty() {
                        label.push('_');
                    }
                    label.extend(&chars[chars.len() - 4..]);
                }
            }
            if !label.is_empty() {
                return label;
            }
        }
        format!("{} ({})", self.instance, ip)
    }

    /// Build the device this announcement describes
    pub fn to_device(&self) -> Device {
        let ip = self
            .ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "Unknown IP".to_string());
        let id = DeviceId::from_hash(&format!(
            "{}:{}:{}:{}",
            self.instance,
            self.host(),
            ip,
            self.port
        ));
        // Prefer the literal address so connecting does not depend on mDNS name lookup
        let address = self
            .ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| self.host().to_string());

        Device::new(
            id,
            self.label(),
            TransportType::Tcp,
            format!("{}:{}", address, self.port),
        )
    }
}

/// Services resolved during one discovery session
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    resolved: HashMap<String, Device>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resolved service
    ///
    /// The first resolution yields `DeviceFound`. A later resolution with
    /// different data yields `DeviceUpdated`, or `DeviceLost` then
    /// `DeviceFound` if the address moved; an identical one yields nothing.
    pub fn resolved(&mut self, announcement: &ServiceAnnouncement) -> Vec<DiscoveryEvent> {
        let device = announcement.to_device();
        match self.resolved.insert(announcement.instance.clone(), device.clone()) {
            None => vec![DiscoveryEvent::DeviceFound(device)],
            Some(previous) if previous.id != device.id => vec![
                DiscoveryEvent::DeviceLost(previous.id),
                DiscoveryEvent::DeviceFound(device),
            ],
            Some(previous) if previous != device => vec![DiscoveryEvent::DeviceUpdated(device)],
            Some(_) => Vec::new(),
        }
    }

    /// Record a withdrawn service
    ///
    /// Only services that were resolved produce `DeviceLost`.
    pub fn removed(&mut self, instance: &str) -> Option<DiscoveryEvent> {
        self.resolved
            .remove(instance)
            .map(|device| DiscoveryEvent::DeviceLost(device.id))
    }

    /// Number of resolved services
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    /// Whether no service is resolved
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.resolved.clear();
    }
}

/// Instance label of a full service name
pub fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fullname.split('.').next().unwrap_or(fullname))
        .to_string()
}

#[cfg(feature = "tcp")]
pub(crate) use self::browse::browse;

#[cfg(feature = "tcp")]
mod browse {
    use mdns_sd::{ServiceDaemon, ServiceEvent};
    use tokio::sync::mpsc;
    use tracing::{debug, info, warn};

    use super::{instance_name, ServiceAnnouncement, ServiceRegistry, TXT_ID, TXT_SHORTNAME};
    use crate::error::Result;
    use crate::event::DiscoveryEvent;

    /// Start browsing and forward events until the consumer goes away
    pub(crate) fn browse(
        service_type: String,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<()> {
        let daemon = ServiceDaemon::new()?;
        let receiver = daemon.browse(&service_type)?;
        info!(service_type = %service_type, "mDNS browse started");

        tokio::spawn(async move {
            let mut registry = ServiceRegistry::new();
            loop {
                tokio::select! {
                    event = receiver.recv_async() => {
                        let event = match event {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(error = %e, "mDNS browse channel closed");
                                break;
                            }
                        };
                        let outcome: Vec<DiscoveryEvent> = match event {
                            ServiceEvent::ServiceResolved(info) => {
                                let announcement = ServiceAnnouncement {
                                    instance: instance_name(info.get_fullname(), &service_type),
                                    hostname: info.get_hostname().to_string(),
                                    addresses: info.get_addresses().iter().copied().collect(),
                                    port: info.get_port(),
                                    shortname: info.get_property_val_str(TXT_SHORTNAME).map(str::to_string),
                                    node_id: info.get_property_val_str(TXT_ID).map(str::to_string),
                                    has_txt: info.get_properties().iter().next().is_some(),
                                };
                                debug!(instance = %announcement.instance, port = announcement.port, "mDNS service resolved");
                                registry.resolved(&announcement)
                            }
                            ServiceEvent::ServiceRemoved(_, fullname) => {
                                debug!(fullname = %fullname, "mDNS service removed");
                                registry
                                    .removed(&instance_name(&fullname, &service_type))
                                    .into_iter()
                                    .collect()
                            }
                            ServiceEvent::ServiceFound(_, fullname) => {
                                debug!(fullname = %fullname, "mDNS service found, resolving");
                                Vec::new()
                            }
                            _ => Vec::new(),
                        };
                        if outcome.into_iter().any(|event| events.send(event).is_err()) {
                            break;
                        }
                    }

                    _ = events.closed() => break,
                }
            }

            registry.clear();
            if let Err(e) = daemon.stop_browse(&service_type) {
                debug!(error = %e, "mDNS stop_browse failed");
            }
            if let Err(e) = daemon.shutdown() {
                debug!(error = %e, "mDNS daemon shutdown failed");
            }
            info!(service_type = %service_type, "mDNS browse stopped");
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn announcement(instance: &str) -> ServiceAnnouncement {
        ServiceAnnouncement {
            instance: instance.to_string(),
            hostname: "meshtastic-a1b2.local.".to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42))],
            port: 4403,
            shortname: Some("BASE".to_string()),
            node_id: Some("!deadbeef".to_string()),
            has_txt: true,
        }
    }

    #[test]
    fn test_label_from_txt() {
        assert_eq!(announcement("Meshtastic_beef").label(), "BASE_beef");
    }

    #[test]
    fn test_label_short_id_is_ignored() {
        let mut ann = announcement("x");
        ann.node_id = Some("abcd".to_string());
        assert_eq!(ann.label(), "BASE");
    }

    #[test]
    fn test_label_without_txt() {
        let mut ann = announcement("Meshtastic_beef");
        ann.has_txt = false;
        ann.shortname = None;
        ann.node_id = None;
        assert_eq!(ann.label(), "Meshtastic_beef (192.168.1.42)");
    }

    #[test]
    fn test_device_identifier_prefers_ipv4() {
        let device = announcement("m").to_device();
        assert_eq!(device.identifier, "192.168.1.42:4403");
        assert_eq!(device.transport_type, TransportType::Tcp);
        assert!(!device.is_manual);
        assert_eq!(
            device.id,
            DeviceId::from_hash("m:meshtastic-a1b2.local:192.168.1.42:4403")
        );
    }

    #[test]
    fn test_registry_found_updated_lost() {
        let mut registry = ServiceRegistry::new();
        let ann = announcement("radio");

        let found = registry.resolved(&ann).remove(0);
        assert!(matches!(found, DiscoveryEvent::DeviceFound(_)));
        // Identical re-resolution is silent
        assert!(registry.resolved(&ann).is_empty());

        let mut renamed = ann.clone();
        renamed.shortname = Some("ROOF".to_string());
        assert!(matches!(
            registry.resolved(&renamed).as_slice(),
            [DiscoveryEvent::DeviceUpdated(_)]
        ));

        let lost = registry.removed("radio").unwrap();
        assert_eq!(lost, DiscoveryEvent::DeviceLost(found.device_id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_moved_service_replaces_identity() {
        let mut registry = ServiceRegistry::new();
        let ann = announcement("radio");
        let first = registry.resolved(&ann).remove(0).device_id();

        let mut moved = ann.clone();
        moved.port = 4500;
        let events = registry.resolved(&moved);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], DiscoveryEvent::DeviceLost(first));
        assert!(matches!(&events[1], DiscoveryEvent::DeviceFound(d) if d.identifier.ends_with(":4500")));
    }

    #[test]
    fn test_unresolved_withdrawal_is_silent() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.removed("never-resolved").is_none());
    }

    #[test]
    fn test_instance_name() {
        let ty = "_meshtastic._tcp.local.";
        assert_eq!(
            instance_name("Meshtastic_beef._meshtastic._tcp.local.", ty),
            "Meshtastic_beef"
        );
        assert_eq!(instance_name("other.local.", ty), "other");
    }
}
