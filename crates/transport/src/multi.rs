//! Multi-homed orchestrator
//!
//! The [`MultiEndpoint`] owns every bound [`Endpoint`], the aggregate
//! contact book, and the path-selection state. Sends pick the best
//! (endpoint, peer address) pair through a strict tier order; a periodic
//! maintenance pass evicts dead endpoints, schedules NAT punctures for
//! stale contacts and keeps the peer's view of our addresses fresh.
//!
//! One mutex guards all bookkeeping. It is never held across socket I/O:
//! inbound handling and maintenance compute what to send under the lock
//! and transmit after releasing it.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};
use tokio::net::UdpSocket;

use crate::address::Address;
use crate::config::TimingConfig;
use crate::contact::{CommunityId, ContactBook};
use crate::dispatch::OverlayDispatcher;
use crate::endpoint::{ConnectionType, Endpoint};
use crate::iface::InterfaceTable;
use crate::peer::{EndpointId, MemberId, Peer};
use crate::retry::{RetryScheduler, RetryTimer};
use crate::transfer::{ChannelStats, CommandQueue, DownloadId, EngineCommand, TransferEngine};
use crate::wire::{
    AddressEntry, AddressesMessage, AddressesRequestMessage, Message, PunctureMessage,
};

/// One control message to put on the wire, decided under the lock and
/// transmitted after it is released.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Local endpoint address to send from.
    pub via: Address,
    pub target: Address,
    pub message: Message,
}

/// What one maintenance cycle decided.
#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub outbound: Vec<Outbound>,
    pub evicted: Vec<Address>,
}

struct Inner {
    endpoints: Vec<Endpoint>,
    /// Aggregate view across all endpoints; the overlay-facing book.
    contacts: ContactBook,
    /// Round-robin position for the fallback selection tier.
    cursor: usize,
    queue: CommandQueue,
    retries: RetryScheduler,
    interfaces: InterfaceTable,
}

impl Inner {
    fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            contacts: ContactBook::new(),
            cursor: 0,
            queue: CommandQueue::new(),
            retries: RetryScheduler::new(),
            interfaces: InterfaceTable::new(Vec::new()),
        }
    }

    fn endpoint(&self, addr: &Address) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.address == *addr)
    }

    fn endpoint_mut(&mut self, addr: &Address) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.address == *addr)
    }

    /// (id, lan, wan) triple per live endpoint, the body of an addresses
    /// announcement.
    fn address_entries(&self) -> Vec<AddressEntry> {
        self.endpoints
            .iter()
            .filter(|e| e.is_alive)
            .map(|e| AddressEntry {
                id: e.id(),
                lan: e.address.clone(),
                wan: e.effective_wan_address(),
            })
            .collect()
    }

    /// A community to stamp on transport-initiated messages to `addr`:
    /// whichever one we have exchanged traffic with them in.
    fn community_for(&self, addr: &Address) -> CommunityId {
        self.contacts
            .get(addr)
            .and_then(|c| c.communities().iter().next().copied())
            .unwrap_or(CommunityId([0u8; 20]))
    }

    /// Close and remove every endpoint matching `pred`, folding its
    /// contact history into the aggregate book.
    fn remove_matching(&mut self, pred: impl Fn(&Endpoint) -> bool) -> Vec<Address> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.endpoints.len() {
            if pred(&self.endpoints[i]) {
                let mut endpoint = self.endpoints.remove(i);
                endpoint.close();
                self.contacts.fold(&endpoint.contacts);
                removed.push(endpoint.address.clone());
            } else {
                i += 1;
            }
        }
        if self.cursor >= self.endpoints.len() {
            self.cursor = 0;
        }
        removed
    }

    fn handle_addresses(&mut self, msg: &AddressesMessage, source: &Address) {
        let lans: Vec<Address> = msg.entries.iter().map(|e| e.lan.clone()).collect();
        let wans: Vec<Address> = msg.entries.iter().map(|e| e.wan.clone()).collect();
        let ids: Vec<EndpointId> = msg.entries.iter().map(|e| e.id).collect();
        let mut peer = Peer::new(&lans, &wans, &ids);
        if let Some(member) = msg.sender {
            peer.set_member(member);
        }
        let canonical = self.contacts.absorb_peer(peer);
        if let Some(contact) = self.contacts.get_mut(&canonical) {
            contact.add_community(msg.community);
        }
        // The announcement answers any outstanding addresses-request,
        // whichever address the timer was keyed by before the merge.
        self.retries.acknowledge(&canonical);
        self.retries.acknowledge(source);
    }

    fn handle_addresses_request(
        &mut self,
        idx: usize,
        msg: &AddressesRequestMessage,
        source: &Address,
        now: Instant,
    ) -> Option<Outbound> {
        // What the sender believes our WAN address to be is a vote.
        self.endpoints[idx].vote_wan_address(&msg.target_wan, &msg.sender_lan);
        if let Some(contact) = self.contacts.get_mut(source) {
            if let Some(peer) = contact.peer_mut() {
                peer.update_wan(&msg.sender_lan, msg.sender_wan.clone());
            }
            contact.record_addresses_sent(now);
        }
        let endpoint = &self.endpoints[idx];
        Some(Outbound {
            via: endpoint.address.clone(),
            target: source.clone(),
            message: Message::Addresses(AddressesMessage {
                community: self.community_for(source),
                sender: None,
                entries: self.address_entries(),
            }),
        })
    }

    fn handle_puncture(&mut self, idx: usize, msg: &PunctureMessage) {
        self.endpoints[idx].vote_wan_address(&msg.vote, &msg.sender_lan);
        let key = if self.contacts.get(&msg.sender_wan).is_some() {
            msg.sender_wan.clone()
        } else {
            msg.sender_lan.clone()
        };
        if let Some(contact) = self.contacts.get_mut(&key) {
            contact.add_community(msg.community);
            if let Some(peer) = contact.peer_mut() {
                peer.update_wan(&msg.sender_lan, msg.sender_wan.clone());
            }
        }
    }

    fn maintenance(
        &mut self,
        timing: &TimingConfig,
        stats: &[ChannelStats],
        now: Instant,
    ) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        // Dead-endpoint eviction: a persistent socket error older than the
        // timeout takes the endpoint out of rotation for good.
        let timeout = timing.socket_timeout();
        let evicted = self.remove_matching(|e| {
            e.socket_error_age(now)
                .map(|age| age >= timeout)
                .unwrap_or(false)
        });
        for addr in &evicted {
            warn!("evicting endpoint {} after persistent socket error", addr);
        }
        report.evicted = evicted;

        let grace = timing.socket_grace();
        let expiration = timing.contact_expiration();

        // Decide first, mutate after: path selection reads the contact
        // book we are iterating.
        let mut demote: Vec<(Address, Address)> = Vec::new();
        let mut punctures: Vec<(Address, Address, usize)> = Vec::new();
        let mut resend_addresses: Vec<(Address, usize)> = Vec::new();
        let mut requests: Vec<(Address, usize)> = Vec::new();
        {
            let endpoints = &self.endpoints;
            let contacts = &self.contacts;
            let cursor = &mut self.cursor;
            let channel_open = |a: &Address| stats.iter().any(|s| s.peer == *a);

            for contact in contacts.iter() {
                let canonical = contact.address().clone();
                let mut want_resend = false;

                for addr in contact.no_contact_since(expiration, now) {
                    if contact.is_unreachable(&addr) || channel_open(&addr) {
                        continue;
                    }
                    let attempts = contact.puncture_attempts(&addr);
                    if attempts >= timing.max_puncture_attempts {
                        demote.push((canonical.clone(), addr));
                        continue;
                    }
                    if let Some(last) = contact.last_puncture(&addr) {
                        if now.duration_since(last) < timing.min_puncture_interval() {
                            continue;
                        }
                    }
                    let Some((via, _)) =
                        select_path(endpoints, contacts, cursor, &addr, 0, stats, grace, now)
                    else {
                        continue;
                    };
                    punctures.push((canonical.clone(), addr, via));
                    if attempts + 1 >= timing.addresses_resend_after {
                        want_resend = true;
                    }
                }

                if want_resend {
                    let interval_ok = contact
                        .last_addresses_sent()
                        .map(|t| now.duration_since(t) >= timing.min_addresses_send_interval())
                        .unwrap_or(true);
                    if interval_ok {
                        if let Some((via, _)) = select_path(
                            endpoints, contacts, cursor, &canonical, 0, stats, grace, now,
                        ) {
                            resend_addresses.push((canonical.clone(), via));
                        }
                    }
                }

                // An established contact that never announced its full
                // address set gets asked for it, once per interval.
                let exchanged = contact.num_sent() + contact.num_rcvd();
                if exchanged > 1
                    && !contact.addresses_received()
                    && !self.retries.contains(&canonical)
                {
                    let interval_ok = contact
                        .last_addresses_request()
                        .map(|t| now.duration_since(t) >= timing.min_addresses_request_interval())
                        .unwrap_or(true);
                    if interval_ok {
                        if let Some((via, _)) = select_path(
                            endpoints, contacts, cursor, &canonical, 0, stats, grace, now,
                        ) {
                            requests.push((canonical.clone(), via));
                        }
                    }
                }
            }

            // Armed addresses-request timers that fired this cycle.
            for addr in self.retries.sweep(now) {
                let still_missing = contacts
                    .get(&addr)
                    .map(|c| !c.addresses_received())
                    .unwrap_or(false);
                if !still_missing {
                    continue;
                }
                if let Some((via, _)) =
                    select_path(endpoints, contacts, cursor, &addr, 0, stats, grace, now)
                {
                    requests.push((addr, via));
                }
            }
        }

        for (canonical, addr) in demote {
            if let Some(contact) = self.contacts.get_mut(&canonical) {
                contact.mark_unreachable(&addr);
            }
        }

        let entries = self.address_entries();
        for (canonical, target, via) in punctures {
            let endpoint = &self.endpoints[via];
            let message = Message::Puncture(PunctureMessage {
                community: self.community_for(&canonical),
                sender_lan: endpoint.address.clone(),
                sender_wan: endpoint.effective_wan_address(),
                sender_id: None,
                vote: target.clone(),
                endpoint_id: endpoint.id(),
            });
            let via = endpoint.address.clone();
            if let Some(contact) = self.contacts.get_mut(&canonical) {
                contact.record_puncture(&target, now);
            }
            debug!("puncture scheduled for {} via {}", target, via);
            report.outbound.push(Outbound {
                via,
                target,
                message,
            });
        }

        for (canonical, via) in resend_addresses {
            let endpoint = &self.endpoints[via];
            let message = Message::Addresses(AddressesMessage {
                community: self.community_for(&canonical),
                sender: None,
                entries: entries.clone(),
            });
            let via = endpoint.address.clone();
            if let Some(contact) = self.contacts.get_mut(&canonical) {
                contact.record_addresses_sent(now);
            }
            report.outbound.push(Outbound {
                via,
                target: canonical,
                message,
            });
        }

        for (canonical, via) in requests {
            let endpoint = &self.endpoints[via];
            let message = Message::AddressesRequest(AddressesRequestMessage {
                sender_lan: endpoint.address.clone(),
                sender_wan: endpoint.effective_wan_address(),
                endpoint_id: endpoint.id(),
                target_wan: canonical.clone(),
            });
            let via = endpoint.address.clone();
            if let Some(contact) = self.contacts.get_mut(&canonical) {
                contact.record_addresses_request(now);
            }
            if !self.retries.contains(&canonical) {
                self.retries.arm(
                    canonical.clone(),
                    RetryTimer::bounded(
                        timing.min_addresses_request_interval(),
                        timing.max_puncture_attempts,
                        now,
                    ),
                );
            }
            report.outbound.push(Outbound {
                via,
                target: canonical,
                message,
            });
        }

        report
    }
}

/// Pick the best (endpoint index, peer address) pair for `candidate`,
/// falling through five tiers in strict order. Every tier only considers
/// alive endpoints with a running socket; with one endpoint the choice is
/// trivial and with none the send fails upstream.
#[allow(clippy::too_many_arguments)]
fn select_path(
    endpoints: &[Endpoint],
    contacts: &ContactBook,
    cursor: &mut usize,
    candidate: &Address,
    packet_size: usize,
    stats: &[ChannelStats],
    grace: Duration,
    now: Instant,
) -> Option<(usize, Address)> {
    let usable: Vec<usize> = endpoints
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_usable(grace, now))
        .map(|(i, _)| i)
        .collect();
    if usable.is_empty() {
        return None;
    }
    if endpoints.len() == 1 {
        *cursor = 0;
        return Some((0, candidate.clone()));
    }

    // Every address this candidate is known under.
    let peer_addrs = {
        let mut addrs = contacts
            .get(candidate)
            .map(|c| c.addresses())
            .unwrap_or_default();
        if !addrs.contains(candidate) {
            addrs.push(candidate.clone());
        }
        addrs.retain(|a| !a.is_wildcard());
        addrs
    };

    // 1. Lowest estimated response time over an open transfer channel.
    let mut best: Option<(usize, Address, f64)> = None;
    for stat in stats {
        if !peer_addrs.contains(&stat.peer) {
            continue;
        }
        let Some(i) = usable
            .iter()
            .copied()
            .find(|&i| endpoints[i].address == stat.local)
        else {
            continue;
        };
        let estimate = if stat.channel_upload_speed > 0.0 {
            let backlog = if stat.upload_speed > 0.0 {
                stat.queued_bytes as f64 / stat.upload_speed
            } else {
                0.0
            };
            backlog + packet_size as f64 / stat.channel_upload_speed
        } else if let Some(rtt) = stat.round_trip {
            // No measured channel throughput yet; half the round trip is
            // the best guess for one-way delivery.
            rtt.as_secs_f64() / 2.0
        } else {
            continue;
        };
        if best.as_ref().map_or(true, |(_, _, b)| estimate < *b) {
            best = Some((i, stat.peer.clone(), estimate));
        }
    }
    if let Some((i, addr, _)) = best {
        *cursor = i;
        return Some((i, addr));
    }

    // 2. Most recent contact, per this endpoint's own ledger.
    let mut latest: Option<(usize, Address, Instant)> = None;
    for &i in &usable {
        for addr in &peer_addrs {
            if let Some(t) = endpoints[i]
                .contacts
                .get(addr)
                .and_then(|c| c.last_contact(addr))
            {
                if latest.as_ref().map_or(true, |(_, _, best)| t > *best) {
                    latest = Some((i, addr.clone(), t));
                }
            }
        }
    }
    if let Some((i, addr, _)) = latest {
        *cursor = i;
        return Some((i, addr));
    }

    // 3. Shared subnet between a local socket and a peer address.
    for &i in &usable {
        for addr in &peer_addrs {
            if endpoints[i].address.same_subnet(addr.ip, None) {
                *cursor = i;
                return Some((i, addr.clone()));
            }
        }
    }

    // 4. Random pairing of public endpoints with public peer addresses.
    let mut pairs: Vec<(usize, Address)> = Vec::new();
    for &i in &usable {
        let wan = endpoints[i].effective_wan_address();
        if wan.is_private() || wan.is_wildcard() {
            continue;
        }
        for addr in &peer_addrs {
            if !addr.is_private() && !addr.is_wildcard() {
                pairs.push((i, addr.clone()));
            }
        }
    }
    if let Some((i, addr)) = pairs.choose(&mut rand::thread_rng()) {
        *cursor = *i;
        return Some((*i, addr.clone()));
    }

    // 5. Round robin past the current position, liveness over optimality.
    let n = endpoints.len();
    for step in 1..=n {
        let i = (*cursor + step) % n;
        if usable.contains(&i) {
            *cursor = i;
            return Some((i, candidate.clone()));
        }
    }
    None
}

/// The multi-homed transport: every bound socket, one aggregate contact
/// view, and the seams to the transfer engine and the overlay layer.
pub struct MultiEndpoint {
    inner: Mutex<Inner>,
    engine: Arc<dyn TransferEngine>,
    dispatcher: Arc<dyn OverlayDispatcher>,
    timing: TimingConfig,
}

impl MultiEndpoint {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        dispatcher: Arc<dyn OverlayDispatcher>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            engine,
            dispatcher,
            timing,
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        // Bookkeeping stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    pub fn maintenance_interval(&self) -> Duration {
        self.timing.maintenance_interval()
    }

    /// Replace the local interface table and re-resolve every endpoint
    /// address against it.
    pub fn set_interfaces(&self, table: InterfaceTable) {
        let mut inner = self.locked();
        inner.interfaces = table.clone();
        for endpoint in &mut inner.endpoints {
            endpoint.address.iface = None;
            endpoint.address.resolve_interface(&table);
        }
    }

    pub fn add_endpoint(&self, mut endpoint: Endpoint) {
        endpoint.open();
        let addr = endpoint.address.clone();
        {
            let mut inner = self.locked();
            let table = inner.interfaces.clone();
            endpoint.address.resolve_interface(&table);
            inner.endpoints.push(endpoint);
        }
        info!("endpoint {} added", addr);
        if self.engine.is_ready() {
            self.engine.add_socket(&addr);
        } else {
            self.locked().queue.push(EngineCommand::AddSocket(addr));
        }
    }

    /// Remove the endpoint bound on `addr`, folding its contact history
    /// into the aggregate book.
    pub fn remove_endpoint(&self, addr: &Address) -> bool {
        let removed = self.locked().remove_matching(|e| e.address == *addr);
        for addr in &removed {
            info!("endpoint {} removed", addr);
        }
        !removed.is_empty()
    }

    pub fn endpoint_count(&self) -> usize {
        self.locked().endpoints.len()
    }

    pub fn local_addresses(&self) -> Vec<Address> {
        self.locked()
            .endpoints
            .iter()
            .map(|e| e.address.clone())
            .collect()
    }

    pub fn socket_of(&self, addr: &Address) -> Option<Arc<UdpSocket>> {
        self.locked().endpoint(addr).and_then(|e| e.socket())
    }

    pub fn queued_commands(&self) -> usize {
        self.locked().queue.len()
    }

    /// Feed an OS error code observed by a receive loop into the owning
    /// endpoint's health state.
    pub fn report_socket_error(&self, local: &Address, code: i32) {
        let now = Instant::now();
        if let Some(endpoint) = self.locked().endpoint_mut(local) {
            endpoint.report_socket_state(code, now);
        }
    }

    /// Per-endpoint NAT classification, for diagnostics.
    pub fn endpoint_status(&self) -> Vec<(Address, ConnectionType)> {
        self.locked()
            .endpoints
            .iter()
            .map(|e| (e.address.clone(), e.connection_type()))
            .collect()
    }

    /// Choose the (endpoint address, peer address) pair a packet of
    /// `packet_size` bytes for `candidate` would travel over right now.
    pub fn select_path(&self, candidate: &Address, packet_size: usize) -> Option<(Address, Address)> {
        let stats = self.engine.channel_stats();
        self.select_path_with_stats(candidate, packet_size, &stats, Instant::now())
    }

    fn select_path_with_stats(
        &self,
        candidate: &Address,
        packet_size: usize,
        stats: &[ChannelStats],
        now: Instant,
    ) -> Option<(Address, Address)> {
        let mut inner = self.locked();
        let inner = &mut *inner;
        select_path(
            &inner.endpoints,
            &inner.contacts,
            &mut inner.cursor,
            candidate,
            packet_size,
            stats,
            self.timing.socket_grace(),
            now,
        )
        .map(|(i, addr)| (inner.endpoints[i].address.clone(), addr))
    }

    /// Deliver `packets` to the first candidate a path can be found for.
    /// While the transfer engine is still starting up the send is queued
    /// and replayed on [`MultiEndpoint::on_ready`]; queuing counts as
    /// success.
    pub async fn send(&self, candidates: &[Address], packets: &[Vec<u8>]) -> bool {
        if !self.engine.is_ready() {
            self.locked().queue.push(EngineCommand::Send {
                candidates: candidates.to_vec(),
                packets: packets.to_vec(),
            });
            return true;
        }
        self.send_now(candidates, packets).await
    }

    async fn send_now(&self, candidates: &[Address], packets: &[Vec<u8>]) -> bool {
        let stats = self.engine.channel_stats();
        let now = Instant::now();
        let grace = self.timing.socket_grace();
        let total: usize = packets.iter().map(Vec::len).sum();

        let picked = {
            let mut inner = self.locked();
            let inner = &mut *inner;
            let mut picked = None;
            for candidate in candidates {
                if candidate.is_wildcard() {
                    continue;
                }
                if let Some((i, target)) = select_path(
                    &inner.endpoints,
                    &inner.contacts,
                    &mut inner.cursor,
                    candidate,
                    total,
                    &stats,
                    grace,
                    now,
                ) {
                    let endpoint = &inner.endpoints[i];
                    picked = Some((endpoint.address.clone(), endpoint.socket(), target));
                    break;
                }
            }
            picked
        };

        let Some((via, socket, target)) = picked else {
            warn!("no path to any of {} candidate addresses", candidates.len());
            return false;
        };
        let Some(socket) = socket else {
            warn!("endpoint {} has no bound socket", via);
            return false;
        };

        let mut sent = 0u64;
        let mut bytes = 0u64;
        let mut failure = None;
        for packet in packets {
            match socket.send_to(packet, target.socket_addr()).await {
                Ok(n) => {
                    sent += 1;
                    bytes += n as u64;
                }
                Err(e) => {
                    warn!("send to {} via {} failed: {}", target, via, e);
                    failure = Some(e.raw_os_error().unwrap_or(-1));
                    break;
                }
            }
        }

        // Packets that made it onto the wire before a mid-batch failure
        // still count toward the ledgers.
        let mut inner = self.locked();
        if let Some(endpoint) = inner.endpoint_mut(&via) {
            if sent > 0 {
                endpoint.record_sent(&target, sent, bytes, now);
            }
            if let Some(code) = failure {
                endpoint.report_socket_state(code, Instant::now());
            }
        }
        if sent > 0 {
            inner.contacts.on_sent(&target, sent, bytes, now);
        }
        failure.is_none()
    }

    /// The transfer engine signalled readiness: replay everything that
    /// was queued, oldest first.
    pub async fn on_ready(&self) {
        let commands = self.locked().queue.drain();
        if !commands.is_empty() {
            info!("engine ready, replaying {} queued commands", commands.len());
        }
        for command in commands {
            match command {
                EngineCommand::AddSocket(addr) => self.engine.add_socket(&addr),
                EngineCommand::AddPeer {
                    download,
                    addr,
                    sock_addr,
                } => self.engine.add_peer(download, &addr, sock_addr.as_ref()),
                EngineCommand::StartDownload(download) => self.engine.start_download(download),
                EngineCommand::RemoveDownload {
                    download,
                    rm_state,
                    rm_content,
                } => self.engine.remove_download(download, rm_state, rm_content),
                EngineCommand::Send {
                    candidates,
                    packets,
                } => {
                    self.send_now(&candidates, &packets).await;
                }
            }
        }
    }

    pub fn add_peer(&self, download: DownloadId, addr: &Address, sock_addr: Option<&Address>) {
        if self.engine.is_ready() {
            self.engine.add_peer(download, addr, sock_addr);
        } else {
            self.locked().queue.push(EngineCommand::AddPeer {
                download,
                addr: addr.clone(),
                sock_addr: sock_addr.cloned(),
            });
        }
    }

    pub fn start_download(&self, download: DownloadId) {
        if self.engine.is_ready() {
            self.engine.start_download(download);
        } else {
            self.locked().queue.push(EngineCommand::StartDownload(download));
        }
    }

    pub fn remove_download(&self, download: DownloadId, rm_state: bool, rm_content: bool) {
        if self.engine.is_ready() {
            self.engine.remove_download(download, rm_state, rm_content);
        } else {
            self.locked().queue.push(EngineCommand::RemoveDownload {
                download,
                rm_state,
                rm_content,
            });
        }
    }

    /// Route an externally observed WAN claim to the endpoint that has
    /// most recently heard from the claiming candidate.
    pub fn wan_address_vote(&self, claimed: &Address, from_candidate: &Address) {
        let mut inner = self.locked();
        let idx = inner
            .endpoints
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                e.contacts
                    .get(from_candidate)
                    .and_then(|c| c.last_contact(from_candidate))
                    .map(|t| (i, t))
            })
            .max_by_key(|(_, t)| *t)
            .map(|(i, _)| i)
            .or(if inner.endpoints.is_empty() { None } else { Some(0) });
        if let Some(i) = idx {
            inner.endpoints[i].vote_wan_address(claimed, from_candidate);
        }
    }

    /// A peer announced its full (id, lan, wan) set; collapse every
    /// contact that belongs to it. Returns the surviving canonical
    /// address.
    pub fn peer_endpoints_received(
        &self,
        community: CommunityId,
        member: Option<MemberId>,
        lans: &[Address],
        wans: &[Address],
        ids: &[EndpointId],
    ) -> Address {
        let mut inner = self.locked();
        let mut peer = Peer::new(lans, wans, ids);
        if let Some(member) = member {
            peer.set_member(member);
        }
        let canonical = inner.contacts.absorb_peer(peer);
        if let Some(contact) = inner.contacts.get_mut(&canonical) {
            contact.add_community(community);
        }
        inner.retries.acknowledge(&canonical);
        canonical
    }

    /// A puncture arrived on the endpoint bound at `local`: take the WAN
    /// vote it carries and update the sender's WAN estimate.
    pub fn incoming_puncture(&self, local: &Address, message: &PunctureMessage) {
        let mut inner = self.locked();
        let Some(idx) = inner.endpoints.iter().position(|e| e.address == *local) else {
            warn!("puncture for unknown endpoint {}", local);
            return;
        };
        inner.handle_puncture(idx, message);
    }

    /// A local interface appeared. Demoted addresses everywhere get
    /// another chance; a dead endpoint on the same ip is replaced, an
    /// already-running one is left alone. Returns the bound address.
    pub async fn interface_came_up(&self, addr: Address) -> Result<Address> {
        {
            let mut inner = self.locked();
            inner.contacts.reset_unreachable();
            for endpoint in &mut inner.endpoints {
                endpoint.contacts.reset_unreachable();
            }
            if let Some(endpoint) = inner
                .endpoints
                .iter_mut()
                .find(|e| e.address.ip == addr.ip && e.socket().is_some())
            {
                endpoint.open();
                endpoint.report_socket_state(0, Instant::now());
                return Ok(endpoint.address.clone());
            }
            // Socketless leftovers on that ip make way for the new bind.
            inner.remove_matching(|e| e.address.ip == addr.ip);
        }
        let endpoint = Endpoint::bind(addr)
            .await
            .context("binding endpoint for new interface")?;
        let bound = endpoint.address.clone();
        self.add_endpoint(endpoint);
        Ok(bound)
    }

    /// A local interface disappeared; close every endpoint bound on it.
    /// Returns how many endpoints were removed.
    pub fn interface_went_down(&self, addr: &Address) -> usize {
        let removed = self.locked().remove_matching(|e| {
            e.address.ip == addr.ip
                || e.address
                    .iface
                    .as_ref()
                    .map(|i| i.contains(addr.ip))
                    .unwrap_or(false)
        });
        for addr in &removed {
            info!("endpoint {} removed with its interface", addr);
        }
        removed.len()
    }

    /// Handle one inbound datagram from the receive loop of the endpoint
    /// bound at `local`. Control messages are consumed by the transport;
    /// everything else goes up to the overlay dispatcher under the
    /// contact's canonical address.
    pub async fn process_datagram(&self, local: &Address, wire_source: SocketAddr, data: &[u8]) {
        let now = Instant::now();
        let source = Address::from(wire_source);
        let decoded = Message::decode(data).ok();

        let (canonical, reply) = {
            let mut inner = self.locked();
            let Some(idx) = inner.endpoints.iter().position(|e| e.address == *local) else {
                warn!("datagram for unknown endpoint {}", local);
                return;
            };
            inner.endpoints[idx].receive(&source, data, now);
            let canonical = inner.contacts.on_recv(&source, 1, data.len() as u64, now);
            let reply = match &decoded {
                Some(Message::Addresses(msg)) => {
                    inner.handle_addresses(msg, &source);
                    None
                }
                Some(Message::AddressesRequest(msg)) => {
                    inner.handle_addresses_request(idx, msg, &source, now)
                }
                Some(Message::Puncture(msg)) => {
                    inner.handle_puncture(idx, msg);
                    None
                }
                None => None,
            };
            (canonical, reply)
        };

        if decoded.is_none() {
            self.dispatcher
                .dispatch_inbound(&canonical, data, SystemTime::now());
        }
        if let Some(out) = reply {
            if let Err(e) = self.transmit(&out).await {
                warn!("reply to {} failed: {:#}", out.target, e);
            }
        }
    }

    /// One maintenance pass with an explicit clock and channel snapshot;
    /// the returned report tells the driver what to transmit.
    pub fn maintenance_with_stats(
        &self,
        stats: &[ChannelStats],
        now: Instant,
    ) -> MaintenanceReport {
        self.locked().maintenance(&self.timing, stats, now)
    }

    /// Periodic driver entry point: run one cycle and perform its I/O.
    pub async fn run_maintenance_once(&self) {
        let stats = self.engine.channel_stats();
        let report = self.maintenance_with_stats(&stats, Instant::now());
        for out in report.outbound {
            if let Err(e) = self.transmit(&out).await {
                warn!("maintenance send to {} failed: {:#}", out.target, e);
            }
        }
    }

    async fn transmit(&self, out: &Outbound) -> Result<()> {
        let payload = out.message.encode()?;
        let socket = self.socket_of(&out.via);
        let Some(socket) = socket else {
            anyhow::bail!("no socket bound on {}", out.via);
        };
        socket
            .send_to(&payload, out.target.socket_addr())
            .await
            .context(format!("sending {} to {}", out.message.kind_name(), out.target))?;
        let now = Instant::now();
        let mut inner = self.locked();
        if let Some(endpoint) = inner.endpoint_mut(&out.via) {
            endpoint.record_sent(&out.target, 1, payload.len() as u64, now);
        }
        inner.contacts.on_sent(&out.target, 1, payload.len() as u64, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LogDispatcher;
    use crate::iface::NetInterface;
    use crate::transfer::NullTransferEngine;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    const GRACE: Duration = Duration::from_secs(1);

    fn addr(s: &str) -> Address {
        Address::parse(s)
    }

    fn live(s: &str) -> Endpoint {
        let mut e = Endpoint::new(addr(s));
        e.open();
        e.report_socket_state(0, Instant::now());
        e
    }

    fn dead(s: &str) -> Endpoint {
        let mut e = Endpoint::new(addr(s));
        e.open();
        e.report_socket_state(98, Instant::now());
        e
    }

    fn pick(inner: &mut Inner, candidate: &str, stats: &[ChannelStats]) -> Option<(usize, Address)> {
        let inner = &mut *inner;
        select_path(
            &inner.endpoints,
            &inner.contacts,
            &mut inner.cursor,
            &addr(candidate),
            100,
            stats,
            GRACE,
            Instant::now(),
        )
    }

    #[test]
    fn test_zero_endpoints_yields_nothing() {
        let mut inner = Inner::new();
        assert!(pick(&mut inner, "1.2.3.4:5", &[]).is_none());
    }

    #[test]
    fn test_single_endpoint_trivial_selection() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        let (i, target) = pick(&mut inner, "1.2.3.4:5", &[]).unwrap();
        assert_eq!(i, 0);
        assert_eq!(target, addr("1.2.3.4:5"));
    }

    #[test]
    fn test_never_returns_dead_endpoint() {
        let mut inner = Inner::new();
        inner.endpoints.push(dead("127.0.0.1:5000"));
        inner.endpoints.push(live("127.0.0.1:5001"));
        inner.endpoints.push(dead("127.0.0.1:5002"));
        for _ in 0..10 {
            let (i, _) = pick(&mut inner, "203.0.113.9:9", &[]).unwrap();
            assert_eq!(i, 1);
        }
    }

    #[test]
    fn test_all_dead_yields_nothing() {
        let mut inner = Inner::new();
        inner.endpoints.push(dead("127.0.0.1:5000"));
        inner.endpoints.push(dead("127.0.0.1:5001"));
        assert!(pick(&mut inner, "1.2.3.4:5", &[]).is_none());
    }

    #[test]
    fn test_round_robin_cycles() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        inner.endpoints.push(live("127.0.0.1:5001"));
        inner.endpoints.push(live("127.0.0.1:5002"));
        // No heuristic can match an unknown private candidate: the
        // fallback advances past the cursor every time.
        let order: Vec<usize> = (0..3)
            .map(|_| pick(&mut inner, "10.9.9.9:9", &[]).unwrap().0)
            .collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_most_recent_contact_preferred() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        inner.endpoints.push(live("127.0.0.1:5001"));
        let peer = addr("10.0.0.7:7");
        let earlier = Instant::now();
        let later = earlier + Duration::from_secs(5);
        inner.endpoints[0].contacts.on_recv(&peer, 1, 10, earlier);
        inner.endpoints[1].contacts.on_recv(&peer, 1, 10, later);
        let (i, target) = pick(&mut inner, "10.0.0.7:7", &[]).unwrap();
        assert_eq!(i, 1);
        assert_eq!(target, peer);
    }

    #[test]
    fn test_response_time_tier_picks_fastest_channel() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        inner.endpoints.push(live("127.0.0.1:5001"));
        let peer = addr("10.0.0.7:7");
        let stats = vec![
            ChannelStats {
                local: addr("127.0.0.1:5000"),
                peer: peer.clone(),
                upload_speed: 1000.0,
                download_speed: 0.0,
                queued_bytes: 100_000,
                channel_upload_speed: 500.0,
                round_trip: None,
            },
            ChannelStats {
                local: addr("127.0.0.1:5001"),
                peer: peer.clone(),
                upload_speed: 1000.0,
                download_speed: 0.0,
                queued_bytes: 0,
                channel_upload_speed: 500.0,
                round_trip: None,
            },
        ];
        let (i, target) = pick(&mut inner, "10.0.0.7:7", &stats).unwrap();
        assert_eq!(i, 1);
        assert_eq!(target, peer);
    }

    #[test]
    fn test_response_time_substitutes_half_rtt() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        inner.endpoints.push(live("127.0.0.1:5001"));
        let peer = addr("10.0.0.7:7");
        let stats = vec![
            ChannelStats {
                local: addr("127.0.0.1:5000"),
                peer: peer.clone(),
                upload_speed: 0.0,
                download_speed: 0.0,
                queued_bytes: 0,
                channel_upload_speed: 0.0,
                round_trip: Some(Duration::from_millis(10)),
            },
            ChannelStats {
                local: addr("127.0.0.1:5001"),
                peer: peer.clone(),
                upload_speed: 1000.0,
                download_speed: 0.0,
                queued_bytes: 1_000_000,
                channel_upload_speed: 10.0,
                round_trip: None,
            },
        ];
        // 5ms beats a kilosecond of backlog.
        let (i, _) = pick(&mut inner, "10.0.0.7:7", &stats).unwrap();
        assert_eq!(i, 0);
    }

    #[test]
    fn test_same_subnet_tier() {
        let table = InterfaceTable::new(vec![NetInterface::new(
            "eth0",
            "192.168.1.5".parse::<IpAddr>().unwrap(),
            "255.255.255.0".parse::<IpAddr>().unwrap(),
        )]);
        let mut on_subnet = live("192.168.1.5:100");
        on_subnet.address.resolve_interface(&table);
        let mut inner = Inner::new();
        inner.endpoints.push(live("10.0.0.1:1"));
        inner.endpoints.push(on_subnet);
        let (i, target) = pick(&mut inner, "192.168.1.77:5", &[]).unwrap();
        assert_eq!(i, 1);
        assert_eq!(target, addr("192.168.1.77:5"));
    }

    #[test]
    fn test_public_pairing_tier() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("10.0.0.1:1"));
        inner.endpoints.push(live("8.8.4.4:4444"));
        let (i, target) = pick(&mut inner, "203.0.113.9:9", &[]).unwrap();
        assert_eq!(i, 1);
        assert_eq!(target, addr("203.0.113.9:9"));
    }

    fn timing() -> TimingConfig {
        TimingConfig::default()
    }

    #[test]
    fn test_maintenance_punctures_stale_contact() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        let peer = addr("10.0.0.7:7");
        let t0 = Instant::now();
        inner.contacts.on_recv(&peer, 1, 10, t0);

        let cfg = timing();
        let later = t0 + cfg.contact_expiration() + Duration::from_secs(5);
        let report = inner.maintenance(&cfg, &[], later);
        assert_eq!(report.outbound.len(), 1);
        let out = &report.outbound[0];
        assert_eq!(out.target, peer);
        assert!(matches!(out.message, Message::Puncture(_)));
        assert_eq!(inner.contacts.get(&peer).unwrap().puncture_attempts(&peer), 1);

        // Throttled inside the minimum interval.
        let report = inner.maintenance(&cfg, &[], later + Duration::from_secs(1));
        assert!(report.outbound.is_empty());

        // Fires again once the interval elapsed.
        let report = inner.maintenance(&cfg, &[], later + cfg.min_puncture_interval());
        assert_eq!(report.outbound.len(), 1);
    }

    #[test]
    fn test_maintenance_skips_open_channels() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        let peer = addr("10.0.0.7:7");
        let t0 = Instant::now();
        inner.contacts.on_recv(&peer, 1, 10, t0);
        let stats = vec![ChannelStats {
            local: addr("127.0.0.1:5000"),
            peer: peer.clone(),
            upload_speed: 1.0,
            download_speed: 1.0,
            queued_bytes: 0,
            channel_upload_speed: 1.0,
            round_trip: None,
        }];
        let cfg = timing();
        let later = t0 + cfg.contact_expiration() + Duration::from_secs(5);
        let report = inner.maintenance(&cfg, &stats, later);
        assert!(report.outbound.is_empty());
    }

    #[test]
    fn test_unreachable_demotion_after_max_attempts() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        let peer = addr("10.0.0.7:7");
        let t0 = Instant::now();
        inner.contacts.on_recv(&peer, 1, 10, t0);

        let cfg = timing();
        for i in 0..cfg.max_puncture_attempts {
            inner
                .contacts
                .get_mut(&peer)
                .unwrap()
                .record_puncture(&peer, t0 + Duration::from_secs(i as u64));
        }
        let later = t0 + cfg.contact_expiration() + Duration::from_secs(60);
        let report = inner.maintenance(&cfg, &[], later);
        assert!(report
            .outbound
            .iter()
            .all(|o| !matches!(o.message, Message::Puncture(_))));
        assert!(inner.contacts.get(&peer).unwrap().is_unreachable(&peer));

        // Demoted addresses stay excluded.
        let report = inner.maintenance(&cfg, &[], later + Duration::from_secs(60));
        assert!(report
            .outbound
            .iter()
            .all(|o| !matches!(o.message, Message::Puncture(_))));
    }

    #[test]
    fn test_addresses_resent_after_repeated_punctures() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        let peer = addr("10.0.0.7:7");
        let t0 = Instant::now();
        inner.contacts.on_recv(&peer, 1, 10, t0);

        let cfg = timing();
        for _ in 0..cfg.addresses_resend_after - 1 {
            inner.contacts.get_mut(&peer).unwrap().record_puncture(&peer, t0);
        }
        let later = t0 + cfg.contact_expiration() + Duration::from_secs(60);
        let report = inner.maintenance(&cfg, &[], later);
        assert!(report
            .outbound
            .iter()
            .any(|o| matches!(o.message, Message::Puncture(_))));
        assert!(report
            .outbound
            .iter()
            .any(|o| matches!(o.message, Message::Addresses(_))));
    }

    #[test]
    fn test_address_request_for_unannounced_contact() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        let peer = addr("10.0.0.7:7");
        let t0 = Instant::now();
        // Two packets exchanged recently, no announcement yet.
        inner.contacts.on_recv(&peer, 2, 100, t0);

        let cfg = timing();
        let soon = t0 + Duration::from_secs(1);
        let report = inner.maintenance(&cfg, &[], soon);
        assert_eq!(report.outbound.len(), 1);
        assert!(matches!(
            report.outbound[0].message,
            Message::AddressesRequest(_)
        ));
        assert!(inner.retries.contains(&peer));

        // Not repeated while the timer is armed and the interval young.
        let report = inner.maintenance(&cfg, &[], soon + Duration::from_secs(1));
        assert!(report.outbound.is_empty());

        // The armed timer fires after its period and resends.
        let fired = soon + cfg.min_addresses_request_interval() + Duration::from_secs(1);
        let report = inner.maintenance(&cfg, &[], fired);
        assert!(report
            .outbound
            .iter()
            .any(|o| matches!(o.message, Message::AddressesRequest(_))));
    }

    #[test]
    fn test_request_timer_acknowledged_by_announcement() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.1:5000"));
        let peer = addr("10.0.0.7:7");
        let t0 = Instant::now();
        inner.contacts.on_recv(&peer, 2, 100, t0);

        let cfg = timing();
        inner.maintenance(&cfg, &[], t0 + Duration::from_secs(1));
        assert!(inner.retries.contains(&peer));

        let msg = AddressesMessage {
            community: CommunityId([1u8; 20]),
            sender: None,
            entries: vec![AddressEntry {
                id: EndpointId::random(),
                lan: peer.clone(),
                wan: addr("89.1.1.1:7"),
            }],
        };
        inner.handle_addresses(&msg, &peer);
        assert!(inner.contacts.get(&peer).unwrap().addresses_received());

        // Timer stopped; the sweep drops it without firing. The announced
        // WAN address has never carried traffic, so the same pass punctures
        // it, but no further request goes out.
        let fired = t0 + cfg.min_addresses_request_interval() + Duration::from_secs(2);
        let report = inner.maintenance(&cfg, &[], fired);
        assert!(!report
            .outbound
            .iter()
            .any(|o| matches!(o.message, Message::AddressesRequest(_))));
        assert!(report
            .outbound
            .iter()
            .all(|o| matches!(o.message, Message::Puncture(_)) && o.target == addr("89.1.1.1:7")));
        assert!(!inner.retries.contains(&peer));
    }

    #[test]
    fn test_maintenance_evicts_failed_endpoint() {
        let mut inner = Inner::new();
        let mut failed = live("127.0.0.1:5000");
        let t0 = Instant::now();
        let peer = addr("10.0.0.7:7");
        failed.contacts.on_recv(&peer, 1, 10, t0);
        failed.report_socket_state(98, t0);
        inner.endpoints.push(failed);
        inner.endpoints.push(live("127.0.0.1:5001"));

        let cfg = timing();
        let report = inner.maintenance(&cfg, &[], t0 + cfg.socket_timeout() + Duration::from_secs(1));
        assert_eq!(report.evicted, vec![addr("127.0.0.1:5000")]);
        assert_eq!(inner.endpoints.len(), 1);
        // The evicted endpoint's history moved to the aggregate book.
        assert!(inner.contacts.get(&peer).is_some());
    }

    #[test]
    fn test_puncture_vote_and_wan_update() {
        let mut inner = Inner::new();
        inner.endpoints.push(live("127.0.0.2:1"));
        let sender_lan = addr("10.0.0.5:1");
        let sender_wan = addr("89.2.2.2:2");
        let t0 = Instant::now();
        inner.contacts.on_recv(&sender_lan, 1, 10, t0);
        let id = EndpointId::random();
        inner
            .contacts
            .get_mut(&sender_lan)
            .unwrap()
            .set_peer(Peer::new(
                std::slice::from_ref(&sender_lan),
                std::slice::from_ref(&sender_lan),
                &[id],
            ));

        let msg = PunctureMessage {
            community: CommunityId([1u8; 20]),
            sender_lan: sender_lan.clone(),
            sender_wan: sender_wan.clone(),
            sender_id: None,
            vote: addr("1.2.3.4:1"),
            endpoint_id: id,
        };
        inner.handle_puncture(0, &msg);
        assert_eq!(inner.endpoints[0].vote_count(&addr("1.2.3.4:1")), 1);
        let peer = inner.contacts.get(&sender_lan).unwrap().peer().unwrap();
        assert_eq!(peer.wan_addresses(), vec![sender_wan]);
    }

    struct FlagEngine {
        ready: AtomicBool,
    }

    impl TransferEngine for FlagEngine {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
        fn add_socket(&self, _addr: &Address) {}
        fn add_peer(&self, _d: DownloadId, _a: &Address, _s: Option<&Address>) {}
        fn start_download(&self, _d: DownloadId) {}
        fn remove_download(&self, _d: DownloadId, _s: bool, _c: bool) {}
        fn channel_stats(&self) -> Vec<ChannelStats> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_send_queued_until_engine_ready() {
        let engine = Arc::new(FlagEngine {
            ready: AtomicBool::new(false),
        });
        let me = MultiEndpoint::new(
            engine.clone(),
            Arc::new(LogDispatcher),
            TimingConfig::default(),
        );
        assert!(me.send(&[addr("10.0.0.7:7")], &[vec![1, 2, 3]]).await);
        assert_eq!(me.queued_commands(), 1);

        engine.ready.store(true, Ordering::SeqCst);
        me.on_ready().await;
        assert_eq!(me.queued_commands(), 0);
    }

    #[tokio::test]
    async fn test_send_fails_with_no_endpoints() {
        let me = MultiEndpoint::new(
            Arc::new(NullTransferEngine),
            Arc::new(LogDispatcher),
            TimingConfig::default(),
        );
        assert!(!me.send(&[addr("10.0.0.7:7")], &[vec![1, 2, 3]]).await);
    }

    #[tokio::test]
    async fn test_send_between_bound_endpoints() {
        let me = MultiEndpoint::new(
            Arc::new(NullTransferEngine),
            Arc::new(LogDispatcher),
            TimingConfig::default(),
        );
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = Address::from(receiver.local_addr().unwrap());
        me.add_endpoint(Endpoint::bind(addr("127.0.0.1:0")).await.unwrap());

        assert!(me.send(&[target.clone()], &[vec![7u8; 16]]).await);
        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 16);
    }

    #[tokio::test]
    async fn test_send_records_partial_batch_on_failure() {
        let me = MultiEndpoint::new(
            Arc::new(NullTransferEngine),
            Arc::new(LogDispatcher),
            TimingConfig::default(),
        );
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = Address::from(receiver.local_addr().unwrap());
        me.add_endpoint(Endpoint::bind(addr("127.0.0.1:0")).await.unwrap());

        // The first packet fits in a datagram, the second cannot.
        let packets = vec![vec![7u8; 16], vec![0u8; 70_000]];
        assert!(!me.send(&[target.clone()], &packets).await);

        let inner = me.locked();
        let contact = inner.contacts.get(&target).unwrap();
        assert_eq!(contact.num_sent(), 1);
        assert_eq!(contact.total_sent(), 16);
    }

    #[test]
    fn test_incoming_puncture_classifies_nat() {
        let me = MultiEndpoint::new(
            Arc::new(NullTransferEngine),
            Arc::new(LogDispatcher),
            TimingConfig::default(),
        );
        let local = addr("127.0.0.2:1");
        let mut endpoint = Endpoint::new(local.clone());
        endpoint.report_socket_state(0, Instant::now());
        me.add_endpoint(endpoint);

        let puncture = |lan: &str, vote: &str| PunctureMessage {
            community: CommunityId([0u8; 20]),
            sender_lan: addr(lan),
            sender_wan: addr(lan),
            sender_id: None,
            vote: addr(vote),
            endpoint_id: EndpointId::random(),
        };
        me.incoming_puncture(&local, &puncture("10.0.0.5:1", "1.2.3.4:1"));
        assert_eq!(me.endpoint_status()[0].1, ConnectionType::Unknown);
        me.incoming_puncture(&local, &puncture("10.0.0.6:1", "1.2.3.4:2"));
        assert_eq!(me.endpoint_status()[0].1, ConnectionType::SymmetricNat);
    }

    #[test]
    fn test_remove_endpoint_folds_contacts() {
        let me = MultiEndpoint::new(
            Arc::new(NullTransferEngine),
            Arc::new(LogDispatcher),
            TimingConfig::default(),
        );
        let local = addr("127.0.0.1:5000");
        let peer = addr("10.0.0.7:7");
        let mut endpoint = Endpoint::new(local.clone());
        endpoint.contacts.on_recv(&peer, 3, 300, Instant::now());
        me.add_endpoint(endpoint);

        assert!(me.remove_endpoint(&local));
        assert_eq!(me.endpoint_count(), 0);
        let inner = me.locked();
        assert_eq!(inner.contacts.get(&peer).unwrap().num_rcvd(), 3);
    }

    #[test]
    fn test_interface_down_removes_endpoint() {
        let me = MultiEndpoint::new(
            Arc::new(NullTransferEngine),
            Arc::new(LogDispatcher),
            TimingConfig::default(),
        );
        me.add_endpoint(Endpoint::new(addr("192.168.1.5:100")));
        me.add_endpoint(Endpoint::new(addr("10.0.0.1:100")));
        assert_eq!(me.interface_went_down(&addr("192.168.1.5:0")), 1);
        assert_eq!(me.endpoint_count(), 1);
    }
}
