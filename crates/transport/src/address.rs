//! Canonical socket-address value type
//!
//! An [`Address`] is the identity every contact ledger and vote tally is
//! keyed by: (ip, port, flowinfo, scopeid). The optionally attached
//! [`NetInterface`] is a cached resolution result and deliberately excluded
//! from equality and hashing.
//!
//! Parsing never fails. Malformed input degrades to the IPv4 wildcard
//! `0.0.0.0:0`; callers treat a wildcard result as "unknown", not as a
//! valid target.

use log::debug;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::iface::{masked, InterfaceTable, NetInterface};

/// IPv4/IPv6 socket endpoint. Equality and hashing cover (ip, port,
/// flowinfo, scopeid) only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
    /// IPv6 only
    pub flowinfo: u32,
    /// IPv6 only
    pub scopeid: u32,
    #[serde(skip)]
    pub iface: Option<NetInterface>,
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
            && self.port == other.port
            && self.flowinfo == other.flowinfo
            && self.scopeid == other.scopeid
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
        self.flowinfo.hash(state);
        self.scopeid.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ip, self.port, self.flowinfo, self.scopeid).cmp(&(
            other.ip,
            other.port,
            other.flowinfo,
            other.scopeid,
        ))
    }
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            flowinfo: 0,
            scopeid: 0,
            iface: None,
        }
    }

    /// IPv4 `0.0.0.0:0`, the "unknown" value all failed parses collapse to.
    pub fn wildcard() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    /// Parse any of the textual forms we accept:
    ///
    /// - bare decimal port ("12345", all interfaces)
    /// - `ip:port` or bare IPv4 ip
    /// - `[v6]:port` with optional `/flowinfo` and `%scopeid` suffixes
    /// - bare IPv6 ip
    ///
    /// Unparsable input falls back to [`Address::wildcard`].
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        match Self::try_parse(s) {
            Some(addr) => addr,
            None => {
                debug!("unparsable address {:?}, falling back to wildcard", s);
                Self::wildcard()
            }
        }
    }

    fn try_parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }
        // Bare port: bind all interfaces.
        if let Ok(port) = s.parse::<u16>() {
            return Some(Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        }
        if s.starts_with('[') {
            return Self::try_parse_v6(s);
        }
        // Bare IPv6 (more than one colon) without brackets.
        if s.matches(':').count() > 1 {
            return s.parse::<IpAddr>().ok().map(|ip| Self::new(ip, 0));
        }
        if let Some((ip, port)) = s.rsplit_once(':') {
            let ip = ip.parse::<Ipv4Addr>().ok()?;
            let port = port.parse::<u16>().ok()?;
            return Some(Self::new(IpAddr::V4(ip), port));
        }
        s.parse::<Ipv4Addr>()
            .ok()
            .map(|ip| Self::new(IpAddr::V4(ip), 0))
    }

    /// `[v6]:port/flowinfo%scopeid`; port, flowinfo and scopeid optional.
    fn try_parse_v6(s: &str) -> Option<Self> {
        let (body, scopeid) = match s.rsplit_once('%') {
            Some((body, id)) => (body, id.parse::<u32>().ok()?),
            None => (s, 0),
        };
        let (body, flowinfo) = match body.rsplit_once('/') {
            Some((body, info)) => (body, info.parse::<u32>().ok()?),
            None => (body, 0),
        };
        let (ip_part, port) = if let Some(rest) = body.strip_suffix(']') {
            (rest.strip_prefix('[')?, 0)
        } else {
            let (ip_part, port_part) = body.rsplit_once(':')?;
            let ip_part = ip_part.strip_prefix('[')?.strip_suffix(']')?;
            (ip_part, port_part.parse::<u16>().ok()?)
        };
        let ip = ip_part.parse::<IpAddr>().ok()?;
        Some(Self {
            ip,
            port,
            flowinfo,
            scopeid,
            iface: None,
        })
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    /// Zero ip: "unknown, not an error".
    pub fn is_wildcard(&self) -> bool {
        self.ip.is_unspecified()
    }

    pub fn is_wildcard_port(&self) -> bool {
        self.port == 0
    }

    /// Membership in the reserved IPv4 blocks (RFC 1918 plus CGNAT,
    /// loopback and link-local). IPv6 addresses are never classified
    /// private here.
    pub fn is_private(&self) -> bool {
        match self.ip {
            IpAddr::V4(ip) => is_private_ipv4(ip),
            IpAddr::V6(_) => false,
        }
    }

    /// Subnet membership of `other` under this address's interface netmask
    /// (or an explicitly supplied interface).
    pub fn same_subnet(&self, other: IpAddr, iface: Option<&NetInterface>) -> bool {
        let iface = match iface.or(self.iface.as_ref()) {
            Some(iface) => iface,
            None => return false,
        };
        masked(self.ip, iface.netmask)
            .zip(masked(other, iface.netmask))
            .map(|(a, b)| a == b)
            .unwrap_or(false)
    }

    /// Bind the first interface whose subnet contains this ip; the
    /// wildcard address binds the synthetic "all interfaces" entry.
    /// Returns false when no interface matches.
    pub fn resolve_interface(&mut self, table: &InterfaceTable) -> bool {
        if self.is_wildcard() {
            self.iface = Some(NetInterface::any());
            return true;
        }
        match table.find_containing(self.ip) {
            Some(iface) => {
                self.iface = Some(iface.clone());
                true
            }
            None => false,
        }
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::new(IpAddr::V4(*v4.ip()), v4.port()),
            SocketAddr::V6(v6) => Self {
                ip: IpAddr::V6(*v6.ip()),
                port: v6.port(),
                flowinfo: v6.flowinfo(),
                scopeid: v6.scope_id(),
                iface: None,
            },
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => {
                write!(f, "[{}]:{}", ip, self.port)?;
                if self.flowinfo != 0 {
                    write!(f, "/{}", self.flowinfo)?;
                }
                if self.scopeid != 0 {
                    write!(f, "%{}", self.scopeid)?;
                }
                Ok(())
            }
        }
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    // 10.0.0.0/8
    octets[0] == 10 ||
    // 172.16.0.0/12
    (octets[0] == 172 && (16..=31).contains(&octets[1])) ||
    // 192.168.0.0/16
    (octets[0] == 192 && octets[1] == 168) ||
    // 100.64.0.0/10 (CGNAT / Shared Address Space, RFC 6598)
    (octets[0] == 100 && (64..=127).contains(&octets[1])) ||
    // 127.0.0.0/8 (loopback)
    octets[0] == 127 ||
    // 169.254.0.0/16 (link-local)
    (octets[0] == 169 && octets[1] == 254)
}
