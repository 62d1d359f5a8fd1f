use log::{debug, warn};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Addresses that reach this host. A dial target resolving only into this
/// set would connect the proxy back to itself.
#[derive(Debug, Clone, Default)]
pub struct LoopbackAddressSet {
    addrs: HashSet<IpAddr>,
}

impl LoopbackAddressSet {
    /// Enumerate the interface addresses of this host.
    ///
    /// The loopback and unspecified addresses are always included, so a
    /// failed enumeration still protects against the obvious loops.
    pub fn detect() -> Self {
        let mut addrs: HashSet<IpAddr> = HashSet::new();
        match if_addrs::get_if_addrs() {
            Ok(interfaces) => {
                for iface in interfaces {
                    debug!("Local interface {} has address {}", iface.name, iface.ip());
                    addrs.insert(iface.ip());
                }
            }
            Err(e) => warn!("Failed to enumerate local interfaces: {}", e),
        }
        addrs.extend(Self::well_known());
        Self { addrs }
    }

    pub fn from_addrs<I: IntoIterator<Item = IpAddr>>(addrs: I) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }

    /// A set that excludes nothing, for wiring a dialer against local test servers.
    pub fn empty() -> Self {
        Self::default()
    }

    fn well_known() -> [IpAddr; 4] {
        [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        ]
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        if self.addrs.contains(ip) {
            return true;
        }
        // ::ffff:a.b.c.d reaches the same socket as a.b.c.d
        match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .is_some_and(|v4| self.addrs.contains(&IpAddr::V4(v4))),
            IpAddr::V4(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}
