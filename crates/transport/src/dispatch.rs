//! Overlay messaging seam
//!
//! The overlay layer owns authentication, permissions and message
//! semantics; the transport only hands packets up through this trait.

use std::time::SystemTime;

use crate::address::Address;

/// Inbound hand-off to the overlay messaging layer.
pub trait OverlayDispatcher: Send + Sync {
    /// Deliver one raw packet. `source` is the contact's canonical
    /// address, not necessarily the wire source.
    fn dispatch_inbound(&self, source: &Address, packet: &[u8], timestamp: SystemTime);

    /// Best-effort message name for diagnostics and statistics; None when
    /// the packet cannot be interpreted (tolerated, never an error).
    fn packet_message_name(&self, _packet: &[u8]) -> Option<String> {
        None
    }
}

/// Dispatcher that only logs, for tests and the bare daemon binary.
#[derive(Debug, Default)]
pub struct LogDispatcher;

impl OverlayDispatcher for LogDispatcher {
    fn dispatch_inbound(&self, source: &Address, packet: &[u8], _timestamp: SystemTime) {
        log::debug!("inbound {} bytes from {}", packet.len(), source);
    }
}
