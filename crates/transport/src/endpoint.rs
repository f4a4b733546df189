//! One bound local socket and everything observed through it
//!
//! An [`Endpoint`] couples a UDP socket with the state that only makes
//! sense per-socket: the contact ledger as seen from this socket, the
//! WAN-address vote tally external peers have cast about it, and a health
//! state derived from the last OS error the socket reported.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use crate::address::Address;
use crate::contact::ContactBook;
use crate::peer::EndpointId;

/// UDP payload ceiling, leaving room for headers.
pub const MAX_PACKET_LEN: usize = u16::MAX as usize - 60;

/// What the vote tally says about this socket's connection to the
/// internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Not enough evidence yet.
    Unknown,
    /// One external address dominates; the socket is directly reachable.
    Public,
    /// Distinct observers see distinct external addresses: the NAT maps
    /// per destination.
    SymmetricNat,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::Unknown => write!(f, "unknown"),
            ConnectionType::Public => write!(f, "public"),
            ConnectionType::SymmetricNat => write!(f, "symmetric-NAT"),
        }
    }
}

/// EAGAIN/EWOULDBLOCK on Linux.
const EWOULDBLOCK: i32 = 11;

/// Socket health derived from the last reported OS error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketHealth {
    /// Not yet bound or no report received.
    Pending,
    /// Last report was code 0: bound and active.
    Running,
    /// Would-block reports are tolerated inside a grace window.
    Congested { since: Instant },
    /// Bind failures, address-unavailable and friends.
    Failed { code: i32, since: Instant },
}

#[derive(Debug, Clone, Copy)]
pub struct SocketState {
    health: SocketHealth,
}

impl SocketState {
    pub fn pending() -> Self {
        Self {
            health: SocketHealth::Pending,
        }
    }

    pub fn running() -> Self {
        Self {
            health: SocketHealth::Running,
        }
    }

    /// Feed the latest OS error code (0 means healthy).
    pub fn report(&mut self, code: i32, now: Instant) {
        self.health = match (code, self.health) {
            (0, _) => SocketHealth::Running,
            // Keep the first congestion instant so the grace window is
            // measured from when trouble started.
            (EWOULDBLOCK, SocketHealth::Congested { since }) => SocketHealth::Congested { since },
            (EWOULDBLOCK, _) => SocketHealth::Congested { since: now },
            (code, SocketHealth::Failed { code: prev, since }) if code == prev => {
                SocketHealth::Failed { code: prev, since }
            }
            (code, _) => SocketHealth::Failed { code, since: now },
        };
    }

    /// Running, with would-block errors forgiven inside `grace`.
    pub fn is_running(&self, grace: Duration, now: Instant) -> bool {
        match self.health {
            SocketHealth::Running => true,
            SocketHealth::Congested { since } => now.duration_since(since) <= grace,
            SocketHealth::Pending | SocketHealth::Failed { .. } => false,
        }
    }

    /// How long the socket has been in a persistent error state.
    pub fn error_age(&self, now: Instant) -> Option<Duration> {
        match self.health {
            SocketHealth::Failed { since, .. } => Some(now.duration_since(since)),
            _ => None,
        }
    }
}

/// One bound local socket plus its per-socket state.
pub struct Endpoint {
    id: EndpointId,
    pub address: Address,
    socket: Option<Arc<UdpSocket>>,
    pub is_alive: bool,
    socket_state: SocketState,
    pub contacts: ContactBook,
    /// claimed WAN address -> vote tally
    wan_votes: HashMap<Address, u32>,
    /// one vote slot per distinct voter LAN address
    wan_voters: HashMap<Address, Address>,
}

impl Endpoint {
    /// Endpoint without a socket; used before binding and in tests.
    pub fn new(address: Address) -> Self {
        Self {
            id: EndpointId::random(),
            address,
            socket: None,
            is_alive: false,
            socket_state: SocketState::pending(),
            contacts: ContactBook::new(),
            wan_votes: HashMap::new(),
            wan_voters: HashMap::new(),
        }
    }

    /// Bind a UDP socket on `address` (port 0 lets the OS pick) and start
    /// alive and running.
    pub async fn bind(address: Address) -> Result<Self> {
        let socket = UdpSocket::bind(address.socket_addr())
            .await
            .context(format!("failed to bind endpoint on {}", address))?;
        let local = socket.local_addr().context("no local address after bind")?;
        info!("endpoint bound on {}", local);

        let mut endpoint = Self::new(Address::from(local));
        endpoint.socket = Some(Arc::new(socket));
        endpoint.socket_state = SocketState::running();
        endpoint.is_alive = true;
        Ok(endpoint)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn open(&mut self) {
        self.is_alive = true;
    }

    pub fn close(&mut self) {
        self.is_alive = false;
        self.socket = None;
    }

    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.clone()
    }

    pub fn report_socket_state(&mut self, code: i32, now: Instant) {
        if code != 0 {
            debug!("endpoint {} socket error {}", self.address, code);
        }
        self.socket_state.report(code, now);
    }

    pub fn socket_running(&self, grace: Duration, now: Instant) -> bool {
        self.socket_state.is_running(grace, now)
    }

    pub fn socket_error_age(&self, now: Instant) -> Option<Duration> {
        self.socket_state.error_age(now)
    }

    /// Alive with a usable socket: the precondition every path-selection
    /// tier filters on.
    pub fn is_usable(&self, grace: Duration, now: Instant) -> bool {
        self.is_alive && self.socket_state.is_running(grace, now)
    }

    /// Transmit `packets` to `peer`, recording outbound traffic on the
    /// contact. Returns Ok(false) without sending when the socket is not
    /// ready; the caller decides whether to queue.
    pub async fn send(
        &mut self,
        peer: &Address,
        packets: &[Vec<u8>],
        grace: Duration,
        now: Instant,
    ) -> Result<bool> {
        if !self.is_usable(grace, now) {
            return Ok(false);
        }
        let socket = match &self.socket {
            Some(socket) => socket.clone(),
            None => return Ok(false),
        };
        if let Some(oversized) = packets.iter().find(|p| p.len() > MAX_PACKET_LEN) {
            anyhow::bail!("UDP cannot carry a {} byte packet", oversized.len());
        }

        let target: SocketAddr = peer.socket_addr();
        let mut bytes = 0u64;
        for packet in packets {
            match socket.send_to(packet, target).await {
                Ok(n) => bytes += n as u64,
                Err(e) => {
                    let code = e.raw_os_error().unwrap_or(-1);
                    self.socket_state.report(code, Instant::now());
                    warn!("send to {} via {} failed: {}", peer, self.address, e);
                    return Ok(false);
                }
            }
        }
        self.record_sent(peer, packets.len() as u64, bytes, now);
        Ok(true)
    }

    /// Bookkeeping half of a send, for callers that performed the socket
    /// I/O themselves (outside the multi-endpoint lock).
    pub fn record_sent(&mut self, peer: &Address, packets: u64, bytes: u64, now: Instant) {
        self.contacts.on_sent(peer, packets, bytes, now);
    }

    /// Record one inbound packet and return the canonical contact address
    /// the overlay should see instead of the raw wire source.
    pub fn receive(&mut self, remote: &Address, data: &[u8], now: Instant) -> Address {
        self.socket_state.report(0, now);
        self.contacts.on_recv(remote, 1, data.len() as u64, now)
    }

    // --- WAN voting ------------------------------------------------------

    /// Register one external opinion about this socket's WAN address.
    ///
    /// Idempotent per voter: a repeated identical vote changes nothing; a
    /// changed vote first retracts the old one. Private or wildcard
    /// claims are discarded; only externally observed addresses count.
    pub fn vote_wan_address(&mut self, claimed: &Address, sender_lan: &Address) {
        if let Some(previous) = self.wan_voters.get(sender_lan) {
            if previous == claimed {
                return;
            }
            let previous = previous.clone();
            if let Some(tally) = self.wan_votes.get_mut(&previous) {
                *tally = tally.saturating_sub(1);
                if *tally == 0 {
                    self.wan_votes.remove(&previous);
                }
            }
            self.wan_voters.remove(sender_lan);
        }
        if claimed.is_private() || claimed.is_wildcard() {
            debug!("discarding non-routable wan claim {} from {}", claimed, sender_lan);
            return;
        }
        debug!("wan vote {} from {}", claimed, sender_lan);
        *self.wan_votes.entry(claimed.clone()).or_insert(0) += 1;
        self.wan_voters.insert(sender_lan.clone(), claimed.clone());
    }

    pub fn vote_count(&self, claimed: &Address) -> u32 {
        self.wan_votes.get(claimed).copied().unwrap_or(0)
    }

    pub fn voter_count(&self) -> usize {
        self.wan_voters.len()
    }

    /// The address with the highest tally; stable tie-break on address
    /// ordering.
    pub fn wan_address(&self) -> Option<Address> {
        self.wan_votes
            .iter()
            .max_by(|(a, na), (b, nb)| na.cmp(nb).then_with(|| b.cmp(a)))
            .map(|(addr, _)| addr.clone())
    }

    /// Best known externally reachable address: the vote winner, or our
    /// own bound address while no votes have arrived.
    pub fn effective_wan_address(&self) -> Address {
        self.wan_address().unwrap_or_else(|| self.address.clone())
    }

    /// NAT classification from the vote ledger.
    ///
    /// Two or more distinct external addresses reported by two or more
    /// distinct senders can only happen when the NAT assigns a different
    /// external port per destination: symmetric NAT. A single dominant
    /// external address is public once confirmed (either it equals our
    /// bound address, or independent observers agree on it). Anything
    /// less is unknown.
    pub fn connection_type(&self) -> ConnectionType {
        let claims = self.wan_votes.len();
        let voters = self.wan_voters.len();
        match claims {
            0 => ConnectionType::Unknown,
            1 => {
                let claimed = self.wan_votes.keys().next().cloned();
                if claimed.as_ref() == Some(&self.address) || voters >= 2 {
                    ConnectionType::Public
                } else {
                    ConnectionType::Unknown
                }
            }
            _ => {
                if voters >= 2 {
                    ConnectionType::SymmetricNat
                } else {
                    ConnectionType::Unknown
                }
            }
        }
    }

    /// Drop the whole tally (contact cleanup); classification reverts
    /// toward unknown.
    pub fn clear_votes(&mut self) {
        self.wan_votes.clear();
        self.wan_voters.clear();
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.address, self.id)
    }
}
