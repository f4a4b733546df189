//! Remote peer identity across multiple addresses
//!
//! A peer is reachable through several of its own sockets; each of those
//! sockets carries a 16-byte endpoint identifier plus a (LAN, WAN) address
//! pair. The WAN half starts out as a guess (often the LAN address echoed
//! back) and is upgraded as external observations arrive.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::address::Address;

/// Identifier a local socket attaches to everything it announces; 16
/// random bytes generated once per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub [u8; 16]);

impl EndpointId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

/// Overlay member identifier (public-key digest of the remote identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(pub [u8; 20]);

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

/// One remote node's set of (endpoint id, LAN address, WAN address)
/// triples, plus the member it belongs to once known.
#[derive(Debug, Clone, Default)]
pub struct Peer {
    addresses: HashMap<EndpointId, (Address, Address)>,
    member: Option<MemberId>,
}

impl Peer {
    /// Zips the three lists into the id-keyed map; excess entries in any
    /// list are dropped.
    pub fn new(lans: &[Address], wans: &[Address], ids: &[EndpointId]) -> Self {
        let addresses = ids
            .iter()
            .zip(lans.iter().zip(wans.iter()))
            .map(|(id, (lan, wan))| (*id, (lan.clone(), wan.clone())))
            .collect();
        Self {
            addresses,
            member: None,
        }
    }

    pub fn with_member(mut self, member: MemberId) -> Self {
        self.member = Some(member);
        self
    }

    pub fn member(&self) -> Option<MemberId> {
        self.member
    }

    pub fn set_member(&mut self, member: MemberId) {
        self.member = Some(member);
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn lan_addresses(&self) -> Vec<Address> {
        self.addresses.values().map(|(l, _)| l.clone()).collect()
    }

    pub fn wan_addresses(&self) -> Vec<Address> {
        self.addresses.values().map(|(_, w)| w.clone()).collect()
    }

    /// Union of all LAN and WAN addresses.
    pub fn addresses(&self) -> Vec<Address> {
        let mut all: Vec<Address> = Vec::with_capacity(self.addresses.len() * 2);
        for (lan, wan) in self.addresses.values() {
            if !all.contains(lan) {
                all.push(lan.clone());
            }
            if !all.contains(wan) {
                all.push(wan.clone());
            }
        }
        all
    }

    pub fn ids(&self) -> impl Iterator<Item = &EndpointId> {
        self.addresses.keys()
    }

    pub fn get(&self, id: &EndpointId) -> Option<&(Address, Address)> {
        self.addresses.get(id)
    }

    /// The endpoint id owning `addr`, either as LAN or WAN.
    pub fn get_id(&self, addr: &Address) -> Option<EndpointId> {
        self.addresses
            .iter()
            .find(|(_, (lan, wan))| lan == addr || wan == addr)
            .map(|(id, _)| *id)
    }

    pub fn has_address(&self, addr: &Address) -> bool {
        self.addresses
            .values()
            .any(|(lan, wan)| lan == addr || wan == addr)
    }

    /// True when any of `other`'s triples coincides with one of ours, by
    /// address or by endpoint id.
    pub fn matches(&self, other: &Peer) -> bool {
        other.addresses.iter().any(|(id, (lan, wan))| {
            self.addresses.contains_key(id) || self.has_address(lan) || self.has_address(wan)
        })
    }

    /// Fold `other`'s entries into this peer, entry by entry.
    pub fn merge(&mut self, other: &Peer) {
        for (id, (lan, wan)) in &other.addresses {
            self.update_address(lan.clone(), wan.clone(), *id);
        }
        if self.member.is_none() {
            self.member = other.member;
        }
    }

    /// Update the pair held under `id`. An existing entry is only
    /// overwritten when the LAN address changed or LAN differs from WAN,
    /// i.e. when the update carries a real WAN estimate rather than an
    /// echo of the LAN guess.
    pub fn update_address(&mut self, lan: Address, wan: Address, id: EndpointId) {
        match self.addresses.get(&id) {
            Some((known_lan, _)) => {
                if *known_lan != lan || lan != wan {
                    self.addresses.insert(id, (lan, wan));
                }
            }
            None => {
                self.addresses.insert(id, (lan, wan));
            }
        }
    }

    /// Overwrite the WAN half of the entry whose LAN address is `lan`.
    /// A vote where wan == lan is refused: it would downgrade a real WAN
    /// estimate to a LAN echo.
    pub fn update_wan(&mut self, lan: &Address, wan: Address) -> bool {
        if *lan == wan {
            return false;
        }
        let id = self
            .addresses
            .iter()
            .find(|(_, (l, _))| l == lan)
            .map(|(id, _)| *id);
        match id {
            Some(id) => {
                self.addresses.insert(id, (lan.clone(), wan));
                true
            }
            None => false,
        }
    }
}

impl PartialEq for Peer {
    /// Peers are the same node when their address sets intersect (and the
    /// member ids do not contradict each other).
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.member, other.member) {
            if a != b {
                return false;
            }
        }
        self.matches(other)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer[")?;
        for (i, (lan, wan)) in self.addresses.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}/{}", lan, wan)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s)
    }

    fn peer_one(lan: &str, wan: &str) -> (Peer, EndpointId) {
        let id = EndpointId::random();
        (Peer::new(&[addr(lan)], &[addr(wan)], &[id]), id)
    }

    #[test]
    fn test_simple_properties() {
        let lan = addr("213.23.212.22:123");
        let wan = addr("213.23.212.22:123");
        let id = EndpointId::random();
        let peer = Peer::new(&[lan.clone()], &[wan.clone()], &[id]);

        assert_eq!(peer.get(&id), Some(&(lan.clone(), wan.clone())));
        assert_eq!(peer.lan_addresses(), vec![lan.clone()]);
        assert_eq!(peer.wan_addresses(), vec![wan.clone()]);
        assert_eq!(peer.get_id(&lan), Some(id));
        // lan == wan collapses to a single distinct address
        assert_eq!(peer.addresses().len(), 1);
    }

    #[test]
    fn test_update_wan() {
        let (mut peer, _) = peer_one("213.23.212.22:123", "213.23.212.22:123");
        let lan = addr("213.23.212.22:123");
        let new_wan = addr("12.231.21.21:234");

        assert!(peer.update_wan(&lan, new_wan.clone()));
        assert_eq!(peer.wan_addresses(), vec![new_wan.clone()]);

        // wan == lan is a no-op: never downgrade a real estimate
        assert!(!peer.update_wan(&lan, lan.clone()));
        assert_eq!(peer.wan_addresses(), vec![new_wan]);
    }

    #[test]
    fn test_matches_by_address_and_id() {
        let id = EndpointId::random();
        let a = Peer::new(&[addr("10.0.0.1:1")], &[addr("1.2.3.4:1")], &[id]);
        let b = Peer::new(&[addr("10.0.0.9:1")], &[addr("1.2.3.4:1")], &[EndpointId::random()]);
        assert!(a.matches(&b)); // shared wan address

        let c = Peer::new(&[addr("10.9.9.9:1")], &[addr("9.9.9.9:1")], &[id]);
        assert!(a.matches(&c)); // shared endpoint id

        let d = Peer::new(&[addr("10.8.8.8:1")], &[addr("8.8.8.8:1")], &[EndpointId::random()]);
        assert!(!a.matches(&d));
    }

    #[test]
    fn test_merge_prefers_real_wan_estimate() {
        let id = EndpointId::random();
        let lan = addr("10.0.0.1:1");
        let mut a = Peer::new(&[lan.clone()], &[addr("1.2.3.4:1")], &[id]);

        // Incoming entry echoes lan as wan for the same id and same lan:
        // no real information, keep the existing estimate.
        let echo = Peer::new(&[lan.clone()], &[lan.clone()], &[id]);
        a.merge(&echo);
        assert_eq!(a.get(&id).unwrap().1, addr("1.2.3.4:1"));

        // A different wan for the same id is a superseding estimate.
        let update = Peer::new(&[lan.clone()], &[addr("5.6.7.8:1")], &[id]);
        a.merge(&update);
        assert_eq!(a.get(&id).unwrap().1, addr("5.6.7.8:1"));

        // Unknown id is inserted.
        let other_id = EndpointId::random();
        let extra = Peer::new(&[addr("10.0.0.2:1")], &[addr("7.7.7.7:1")], &[other_id]);
        a.merge(&extra);
        assert_eq!(a.get(&other_id).unwrap().1, addr("7.7.7.7:1"));
    }
}
