//! # Multihome
//!
//! Multi-homed UDP transport for peer-to-peer overlays: several bound
//! sockets, one coherent view of every peer, and enough NAT machinery to
//! keep talking to them.
//!
//! ## Key Components
//!
//! ### Addressing
//! - [`Address`] - Canonical socket-endpoint value with lenient parsing
//! - [`NetInterface`] / [`InterfaceTable`] - Local interface snapshot
//! - [`Peer`] - A remote node's full (id, lan, wan) address set
//!
//! ### Bookkeeping
//! - [`Contact`] / [`ContactBook`] - Per-peer traffic ledgers and the
//!   single-contact-per-peer merge on address exchange
//! - [`RetryTimer`] - Resend-until-acknowledged state machine
//!
//! ### Transport
//! - [`Endpoint`] - One bound socket, its health and its WAN vote tally
//! - [`MultiEndpoint`] - Path selection across endpoints plus the
//!   puncture/announcement maintenance loop
//! - [`Message`] - Length-prefixed control messages (addresses,
//!   addresses-request, puncture)
//!
//! ## Example
//!
//! ```rust,ignore
//! use multihome::{Address, Endpoint, MultiEndpoint};
//!
//! let transport = MultiEndpoint::new(engine, dispatcher, timing);
//! transport.add_endpoint(Endpoint::bind(Address::parse("0.0.0.0:0")).await?);
//! transport.send(&[peer_addr], &[packet]).await;
//! ```

pub mod address;
pub mod config;
pub mod contact;
pub mod dispatch;
pub mod endpoint;
pub mod iface;
pub mod multi;
pub mod peer;
pub mod retry;
pub mod transfer;
pub mod wire;

pub use address::Address;
pub use config::{Config, TimingConfig};
pub use contact::{CommunityId, Contact, ContactBook};
pub use dispatch::{LogDispatcher, OverlayDispatcher};
pub use endpoint::{ConnectionType, Endpoint};
pub use iface::{InterfaceTable, NetInterface};
pub use multi::{MaintenanceReport, MultiEndpoint, Outbound};
pub use peer::{EndpointId, MemberId, Peer};
pub use retry::{RetryScheduler, RetryTimer, TimerAction};
pub use transfer::{
    ChannelStats, CommandQueue, DownloadId, EngineCommand, NullTransferEngine, TransferEngine,
};
pub use wire::Message;
