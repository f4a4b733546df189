//! Local network interface descriptors
//!
//! Interfaces are plain value objects handed to the transport by whoever
//! enumerates the OS view (netlink, getifaddrs, test fixtures). The
//! transport itself never talks to the OS here; it only needs netmasks to
//! answer subnet questions and a stable device name to recognize an
//! interface that came back up under a new address.

use std::net::{IpAddr, Ipv4Addr};

/// One local network interface: name, address, netmask and optional
/// broadcast/gateway addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub ip: IpAddr,
    pub netmask: IpAddr,
    pub broadcast: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    /// Physical device name; `eth0:1` style aliases share a device.
    pub device: String,
}

impl NetInterface {
    pub fn new(name: &str, ip: IpAddr, netmask: IpAddr) -> Self {
        Self {
            name: name.to_string(),
            ip,
            netmask,
            broadcast: None,
            gateway: None,
            device: device_of(name),
        }
    }

    /// Synthetic "all interfaces" entry used when an endpoint binds the
    /// wildcard address.
    pub fn any() -> Self {
        Self {
            name: "any".to_string(),
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            netmask: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast: None,
            gateway: None,
            device: "any".to_string(),
        }
    }

    /// True when `ip` falls inside this interface's subnet.
    pub fn contains(&self, ip: IpAddr) -> bool {
        masked(self.ip, self.netmask)
            .zip(masked(ip, self.netmask))
            .map(|(a, b)| a == b)
            .unwrap_or(false)
    }
}

impl std::fmt::Display for NetInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.ip, self.netmask)
    }
}

/// Apply `netmask` to `ip`, widening IPv4 to u128 so both families share a
/// comparison path. Returns None on a family mismatch.
pub fn masked(ip: IpAddr, netmask: IpAddr) -> Option<u128> {
    match (ip, netmask) {
        (IpAddr::V4(ip), IpAddr::V4(mask)) => {
            Some((u32::from(ip) & u32::from(mask)) as u128)
        }
        (IpAddr::V6(ip), IpAddr::V6(mask)) => Some(u128::from(ip) & u128::from(mask)),
        _ => None,
    }
}

fn device_of(name: &str) -> String {
    // "eth0" -> "eth", "wlan1" -> "wlan"; aliases like "eth0:1" keep "eth0".
    match name.split_once(':') {
        Some((base, _)) => base.to_string(),
        None => name
            .trim_end_matches(|c: char| c.is_ascii_digit())
            .to_string(),
    }
}

/// Snapshot of the local interfaces, passed explicitly into whatever needs
/// to resolve addresses against them.
#[derive(Debug, Clone, Default)]
pub struct InterfaceTable {
    interfaces: Vec<NetInterface>,
}

impl InterfaceTable {
    pub fn new(interfaces: Vec<NetInterface>) -> Self {
        Self { interfaces }
    }

    pub fn push(&mut self, iface: NetInterface) {
        self.interfaces.push(iface);
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetInterface> {
        self.interfaces.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// First interface whose subnet contains `ip`.
    pub fn find_containing(&self, ip: IpAddr) -> Option<&NetInterface> {
        self.interfaces.iter().find(|i| i.contains(ip))
    }

    /// Interface currently carrying `name`, if any.
    pub fn by_name(&self, name: &str) -> Option<&NetInterface> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}
