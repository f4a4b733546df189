//! Per-peer traffic ledgers
//!
//! A [`Contact`] is the record we keep about one remote party: packet and
//! byte counts per remote address, when we last heard from or spoke to
//! each address, which overlay communities the traffic belonged to, and,
//! once address exchange completed, the [`Peer`] identity behind it all.
//!
//! Contacts start out keyed by whatever source address a packet happened
//! to arrive from. The moment the remote announces its full address set,
//! [`ContactBook::absorb_peer`] collapses every record that turns out to
//! belong to that peer into a single surviving Contact, so the rest of the
//! stack sees at most one logical contact per peer.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::address::Address;
use crate::peer::Peer;

/// Overlay community identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommunityId(pub [u8; 20]);

/// Monotone packet/byte tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub packets: u64,
    pub bytes: u64,
}

impl Traffic {
    fn add(&mut self, packets: u64, bytes: u64) {
        self.packets += packets;
        self.bytes += bytes;
    }

    fn absorb(&mut self, other: &Traffic) {
        self.packets += other.packets;
        self.bytes += other.bytes;
    }
}

/// Traffic ledger and liveness state for one remote party.
#[derive(Debug, Clone)]
pub struct Contact {
    /// Canonical address: the one the overlay layer is told about, even
    /// when the peer sends from other sockets.
    address: Address,
    sent: HashMap<Address, Traffic>,
    rcvd: HashMap<Address, Traffic>,
    last_send: HashMap<Address, Instant>,
    last_recv: HashMap<Address, Instant>,
    communities: HashSet<CommunityId>,
    peer: Option<Peer>,
    puncture_attempts: HashMap<Address, u32>,
    last_puncture: HashMap<Address, Instant>,
    unreachable: HashSet<Address>,
    addresses_received: bool,
    last_addresses_sent: Option<Instant>,
    last_addresses_request: Option<Instant>,
}

impl Contact {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            sent: HashMap::new(),
            rcvd: HashMap::new(),
            last_send: HashMap::new(),
            last_recv: HashMap::new(),
            communities: HashSet::new(),
            peer: None,
            puncture_attempts: HashMap::new(),
            last_puncture: HashMap::new(),
            unreachable: HashSet::new(),
            addresses_received: false,
            last_addresses_sent: None,
            last_addresses_request: None,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_ref()
    }

    pub fn peer_mut(&mut self) -> Option<&mut Peer> {
        self.peer.as_mut()
    }

    pub fn set_peer(&mut self, peer: Peer) {
        self.addresses_received = true;
        self.peer = Some(peer);
    }

    /// Every address this contact is known under: the canonical address
    /// plus anything the peer identity announced.
    pub fn addresses(&self) -> Vec<Address> {
        let mut all = match &self.peer {
            Some(peer) => peer.addresses(),
            None => Vec::new(),
        };
        if !all.contains(&self.address) {
            all.insert(0, self.address.clone());
        }
        all
    }

    pub fn has_address(&self, addr: &Address) -> bool {
        self.address == *addr
            || self
                .peer
                .as_ref()
                .map(|p| p.has_address(addr))
                .unwrap_or(false)
    }

    /// Record `packets` outgoing packets totalling `bytes` to `addr`.
    pub fn sent(&mut self, packets: u64, bytes: u64, addr: &Address, now: Instant) {
        self.sent.entry(addr.clone()).or_default().add(packets, bytes);
        self.last_send.insert(addr.clone(), now);
    }

    /// Record `packets` incoming packets totalling `bytes` from `addr`.
    pub fn rcvd(&mut self, packets: u64, bytes: u64, addr: &Address, now: Instant) {
        self.rcvd.entry(addr.clone()).or_default().add(packets, bytes);
        self.last_recv.insert(addr.clone(), now);
        // Hearing from an address proves it reachable again.
        self.unreachable.remove(addr);
        self.puncture_attempts.remove(addr);
    }

    pub fn num_sent(&self) -> u64 {
        self.sent.values().map(|t| t.packets).sum()
    }

    pub fn num_rcvd(&self) -> u64 {
        self.rcvd.values().map(|t| t.packets).sum()
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.values().map(|t| t.bytes).sum()
    }

    pub fn total_rcvd(&self) -> u64 {
        self.rcvd.values().map(|t| t.bytes).sum()
    }

    /// max(last send, last recv) for `addr`; None when there has been no
    /// contact on that address at all.
    pub fn last_contact(&self, addr: &Address) -> Option<Instant> {
        match (self.last_send.get(addr), self.last_recv.get(addr)) {
            (Some(s), Some(r)) => Some(*s.max(r)),
            (Some(s), None) => Some(*s),
            (None, Some(r)) => Some(*r),
            (None, None) => None,
        }
    }

    /// Latest contact instant over all addresses.
    pub fn last_contact_any(&self) -> Option<Instant> {
        self.addresses()
            .iter()
            .filter_map(|a| self.last_contact(a))
            .max()
    }

    /// Addresses with no traffic in either direction within `window`.
    pub fn no_contact_since(&self, window: Duration, now: Instant) -> Vec<Address> {
        self.addresses()
            .into_iter()
            .filter(|a| match self.last_contact(a) {
                Some(t) => now.duration_since(t) > window,
                None => true,
            })
            .collect()
    }

    pub fn add_community(&mut self, community: CommunityId) {
        self.communities.insert(community);
    }

    pub fn communities(&self) -> &HashSet<CommunityId> {
        &self.communities
    }

    pub fn addresses_received(&self) -> bool {
        self.addresses_received
    }

    // --- puncture bookkeeping -------------------------------------------

    pub fn puncture_attempts(&self, addr: &Address) -> u32 {
        self.puncture_attempts.get(addr).copied().unwrap_or(0)
    }

    pub fn record_puncture(&mut self, addr: &Address, now: Instant) {
        *self.puncture_attempts.entry(addr.clone()).or_insert(0) += 1;
        self.last_puncture.insert(addr.clone(), now);
    }

    pub fn last_puncture(&self, addr: &Address) -> Option<Instant> {
        self.last_puncture.get(addr).copied()
    }

    pub fn mark_unreachable(&mut self, addr: &Address) {
        debug!("marking {} unreachable for contact {}", addr, self.address);
        self.unreachable.insert(addr.clone());
    }

    pub fn is_unreachable(&self, addr: &Address) -> bool {
        self.unreachable.contains(addr)
    }

    /// A new local interface may have changed what we can reach; give
    /// every demoted address another chance.
    pub fn reset_unreachable(&mut self) {
        self.unreachable.clear();
        self.puncture_attempts.clear();
    }

    pub fn record_addresses_sent(&mut self, now: Instant) {
        self.last_addresses_sent = Some(now);
    }

    pub fn last_addresses_sent(&self) -> Option<Instant> {
        self.last_addresses_sent
    }

    pub fn record_addresses_request(&mut self, now: Instant) {
        self.last_addresses_request = Some(now);
    }

    pub fn last_addresses_request(&self) -> Option<Instant> {
        self.last_addresses_request
    }

    /// Fold `other` into this contact: counters sum, timestamps take the
    /// max, membership and reachability state union.
    pub fn merge(&mut self, other: &Contact) {
        for (addr, traffic) in &other.sent {
            self.sent.entry(addr.clone()).or_default().absorb(traffic);
        }
        for (addr, traffic) in &other.rcvd {
            self.rcvd.entry(addr.clone()).or_default().absorb(traffic);
        }
        for (addr, t) in &other.last_send {
            let entry = self.last_send.entry(addr.clone()).or_insert(*t);
            *entry = (*entry).max(*t);
        }
        for (addr, t) in &other.last_recv {
            let entry = self.last_recv.entry(addr.clone()).or_insert(*t);
            *entry = (*entry).max(*t);
        }
        for (addr, n) in &other.puncture_attempts {
            let entry = self.puncture_attempts.entry(addr.clone()).or_insert(0);
            *entry = (*entry).max(*n);
        }
        for (addr, t) in &other.last_puncture {
            let entry = self.last_puncture.entry(addr.clone()).or_insert(*t);
            *entry = (*entry).max(*t);
        }
        self.communities.extend(other.communities.iter().copied());
        self.unreachable.extend(other.unreachable.iter().cloned());
        self.addresses_received |= other.addresses_received;
        self.last_addresses_sent = self.last_addresses_sent.max(other.last_addresses_sent);
        self.last_addresses_request =
            self.last_addresses_request.max(other.last_addresses_request);
        match (&mut self.peer, &other.peer) {
            (Some(mine), Some(theirs)) => mine.merge(theirs),
            (None, Some(theirs)) => self.peer = Some(theirs.clone()),
            _ => {}
        }
    }
}

// Identity is the canonical address.
impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Contact {}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (sent {}/{}B, rcvd {}/{}B)",
            self.address,
            self.num_sent(),
            self.total_sent(),
            self.num_rcvd(),
            self.total_rcvd()
        )
    }
}

/// The set of contacts known to one endpoint (or to the whole
/// multi-endpoint as an aggregate view).
#[derive(Debug, Clone, Default)]
pub struct ContactBook {
    contacts: Vec<Contact>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Contact> {
        self.contacts.iter_mut()
    }

    pub fn get(&self, addr: &Address) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.has_address(addr))
    }

    pub fn get_mut(&mut self, addr: &Address) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.has_address(addr))
    }

    fn get_or_create(&mut self, addr: &Address) -> &mut Contact {
        if let Some(i) = self.contacts.iter().position(|c| c.has_address(addr)) {
            return &mut self.contacts[i];
        }
        debug!("new contact {}", addr);
        self.contacts.push(Contact::new(addr.clone()));
        let last = self.contacts.len() - 1;
        &mut self.contacts[last]
    }

    /// Record outbound traffic, creating the contact on first use.
    pub fn on_sent(&mut self, addr: &Address, packets: u64, bytes: u64, now: Instant) {
        self.get_or_create(addr).sent(packets, bytes, addr, now);
    }

    /// Record inbound traffic, creating the contact on first use.
    /// Returns the contact's canonical address so callers can substitute
    /// it for the wire source before dispatching upward.
    pub fn on_recv(&mut self, addr: &Address, packets: u64, bytes: u64, now: Instant) -> Address {
        let contact = self.get_or_create(addr);
        contact.rcvd(packets, bytes, addr, now);
        contact.address.clone()
    }

    /// The canonical address a wire source address maps to, if known.
    pub fn canonical_addr(&self, wire: &Address) -> Option<Address> {
        self.get(wire).map(|c| c.address.clone())
    }

    /// Collapse every contact matching `peer` into one survivor carrying
    /// the merged stats and the unified peer identity learned through
    /// address exchange. Returns the survivor's canonical address,
    /// creating the contact if the peer was entirely unknown.
    pub fn absorb_peer(&mut self, peer: Peer) -> Address {
        let matches = |c: &Contact| {
            peer.addresses().iter().any(|a| c.has_address(a))
                || c.peer.as_ref().map(|p| p.matches(&peer)).unwrap_or(false)
                || (c.peer.as_ref().and_then(|p| p.member()).is_some()
                    && c.peer.as_ref().and_then(|p| p.member()) == peer.member())
        };

        let mut matching: Vec<Contact> = Vec::new();
        let mut rest: Vec<Contact> = Vec::new();
        for c in self.contacts.drain(..) {
            if matches(&c) {
                matching.push(c);
            } else {
                rest.push(c);
            }
        }

        // The oldest matching contact survives; its canonical address is
        // the one the overlay has been seeing all along.
        let mut survivor = if matching.is_empty() {
            Contact::new(
                peer.addresses()
                    .first()
                    .cloned()
                    .unwrap_or_else(Address::wildcard),
            )
        } else {
            matching.remove(0)
        };
        for absorbed in &matching {
            info!(
                "contact {} absorbed into {}",
                absorbed.address, survivor.address
            );
            survivor.merge(absorbed);
        }
        match &mut survivor.peer {
            Some(known) => {
                known.merge(&peer);
                survivor.addresses_received = true;
            }
            None => survivor.set_peer(peer),
        }
        let canonical = survivor.address.clone();
        rest.push(survivor);
        self.contacts = rest;
        canonical
    }

    /// Fold another book into this one, contact by contact. Used when a
    /// dead endpoint is evicted and its view moves to the aggregate.
    pub fn fold(&mut self, other: &ContactBook) {
        for contact in &other.contacts {
            match self
                .contacts
                .iter_mut()
                .find(|c| c.has_address(&contact.address))
            {
                Some(existing) => existing.merge(contact),
                None => self.contacts.push(contact.clone()),
            }
        }
    }

    pub fn reset_unreachable(&mut self) {
        for c in &mut self.contacts {
            c.reset_unreachable();
        }
    }
}
