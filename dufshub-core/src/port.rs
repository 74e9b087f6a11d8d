//! Port policy and allocation.
//!
//! The OS port namespace is shared with every other program on the machine, so
//! bindability is probed just-in-time and never cached.

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind as IoErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};
use std::path::Path;

/// Ports browsers refuse to connect to (Chromium/Firefox restricted list).
const BROWSER_RESTRICTED: &[u16] = &[
    1, 7, 9, 11, 13, 15, 17, 19, 20, 21, 22, 23, 25, 37, 42, 43, 53, 69, 77, 79, 87, 95, 101,
    102, 103, 104, 109, 110, 111, 113, 115, 117, 119, 123, 135, 137, 138, 139, 143, 161, 179,
    389, 427, 465, 512, 513, 514, 515, 526, 530, 531, 532, 540, 548, 554, 556, 563, 587, 601,
    636, 993, 995, 1719, 1720, 1723, 2049, 3659, 4045, 5060, 5061, 6000, 6566, 6665, 6666,
    6667, 6668, 6669, 6697, 10080,
];

/// Well-known ports of common local services.
const COMMONLY_RESERVED: &[u16] = &[
    80, 443, 445, 3306, 3389, 5432, 5900, 6379, 8080, 8443, 9200, 27017,
];

/// Policy table for which ports services may use. Loadable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortPolicy {
    pub min_port: u16,
    pub max_port: u16,
    /// Allocation starts here and walks upward.
    pub default_port: u16,
    /// Everything at or below this is treated as privileged.
    pub reserved_max: u16,
    pub deny_list: BTreeSet<u16>,
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self {
            min_port: 1025,
            max_port: 65535,
            default_port: 5001,
            reserved_max: 1024,
            deny_list: BROWSER_RESTRICTED
                .iter()
                .chain(COMMONLY_RESERVED)
                .copied()
                .collect(),
        }
    }
}

impl PortPolicy {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let policy: PortPolicy = serde_json::from_slice(&data)?;
        Ok(policy)
    }

    /// Static checks only (range, privileged, deny-list); no OS probing.
    pub fn check(&self, port: u16) -> Result<()> {
        let reason = if port < self.min_port || port > self.max_port {
            format!("outside permitted range {}..={}", self.min_port, self.max_port)
        } else if port <= self.reserved_max {
            "privileged port".to_string()
        } else if self.deny_list.contains(&port) {
            "blocked by browsers or reserved for system services".to_string()
        } else {
            return Ok(());
        };
        Err(ServiceError::PortUnavailable { port, reason })
    }
}

/// Searches the permitted range for a usable port.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    policy: PortPolicy,
}

impl PortAllocator {
    pub fn new(policy: PortPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PortPolicy {
        &self.policy
    }

    /// First acceptable port at or above the default, wrapping to the bottom
    /// of the range. `taken` holds ports already assigned to other services.
    pub fn allocate(&self, taken: &HashSet<u16>) -> Result<u16> {
        let start = self.policy.default_port.clamp(self.policy.min_port, self.policy.max_port);
        let upper = start..=self.policy.max_port;
        let lower = self.policy.min_port..start;
        for port in upper.chain(lower) {
            if taken.contains(&port) || self.policy.check(port).is_err() {
                continue;
            }
            if is_port_free(port) {
                return Ok(port);
            }
        }
        Err(ServiceError::NoPortAvailable {
            min: self.policy.min_port,
            max: self.policy.max_port,
        })
    }

    /// Full validation of an explicit port: policy, then a live bind probe.
    pub fn validate(&self, port: u16) -> Result<()> {
        self.policy.check(port)?;
        ensure_bindable(port)
    }
}

/// Fails with `PortUnavailable` when another process holds the port.
pub fn ensure_bindable(port: u16) -> Result<()> {
    if is_port_free(port) {
        Ok(())
    } else {
        Err(ServiceError::PortUnavailable {
            port,
            reason: "already bound by another process".into(),
        })
    }
}

/// Bind-and-release probe on loopback and the wildcard address.
pub fn is_port_free(port: u16) -> bool {
    [Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED].iter().all(|ip| {
        match TcpListener::bind(SocketAddrV4::new(*ip, port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => !matches!(
                e.kind(),
                IoErrorKind::AddrInUse | IoErrorKind::PermissionDenied
            ),
        }
    })
}

/// Primary LAN IPv4 address; connecting a UDP socket sends no packets.
pub fn local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// URL under which a service on `port` is reachable from the LAN.
pub fn local_url(port: u16) -> String {
    match local_ip() {
        Some(ip) => format!("http://{ip}:{port}"),
        None => format!("http://localhost:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn narrow_policy(min: u16, max: u16) -> PortPolicy {
        PortPolicy {
            min_port: min,
            max_port: max,
            default_port: min,
            reserved_max: 1024,
            deny_list: BTreeSet::new(),
        }
    }

    #[test]
    fn default_policy_blocks_known_ports() {
        let policy = PortPolicy::default();
        assert_eq!(policy.check(6667).unwrap_err().kind(), ErrorKind::PortUnavailable);
        assert_eq!(policy.check(8080).unwrap_err().kind(), ErrorKind::PortUnavailable);
        assert!(policy.check(22).is_err());
        assert!(policy.check(5001).is_ok());
    }

    #[test]
    fn bound_port_is_not_free() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_free(port));
        assert_eq!(
            ensure_bindable(port).unwrap_err().kind(),
            ErrorKind::PortUnavailable
        );
        drop(listener);
    }

    #[test]
    fn allocation_skips_bound_denied_and_taken_ports() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let floor = listener.local_addr().unwrap().port();
        let mut policy = narrow_policy(floor, floor.saturating_add(200));
        policy.deny_list.insert(floor + 1);
        let allocator = PortAllocator::new(policy);

        let mut taken = HashSet::new();
        taken.insert(floor + 2);

        let expected = (floor + 3..=floor + 200).find(|p| is_port_free(*p)).unwrap();
        assert_eq!(allocator.allocate(&taken).unwrap(), expected);
        drop(listener);
    }

    #[test]
    fn exhausted_range_reports_no_port() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::new(narrow_policy(port, port));
        let err = allocator.allocate(&HashSet::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPortAvailable);
        drop(listener);
    }

    #[test]
    fn policy_round_trips_through_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ports.json");
        std::fs::write(&path, r#"{"default_port": 7000, "deny_list": [7001]}"#).unwrap();
        let policy = PortPolicy::load(&path).unwrap();
        assert_eq!(policy.default_port, 7000);
        assert!(policy.check(7001).is_err());
        assert_eq!(policy.max_port, 65535);
    }
}
