//! Transfer engine seam
//!
//! The bulk-transfer engine that moves file content is an external
//! collaborator: this module only defines the interface the transport
//! consumes, the per-channel statistics path selection reads, and the FIFO
//! command queue that buffers work while the engine is still starting up.

use log::debug;
use std::collections::VecDeque;
use std::time::Duration;

use crate::address::Address;

/// Opaque handle to one transfer (the engine's notion of a download).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DownloadId(pub [u8; 20]);

/// Live statistics for one transfer channel between a local socket and a
/// peer address.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub local: Address,
    pub peer: Address,
    /// Bytes per second over the whole socket.
    pub upload_speed: f64,
    pub download_speed: f64,
    /// Bytes queued on the socket, ahead of anything we submit.
    pub queued_bytes: u64,
    /// Bytes per second on this specific channel.
    pub channel_upload_speed: f64,
    pub round_trip: Option<Duration>,
}

/// The bulk-transfer engine as seen from the transport layer.
pub trait TransferEngine: Send + Sync {
    /// The engine accepts commands; anything submitted earlier must have
    /// been queued by the caller.
    fn is_ready(&self) -> bool;

    /// Announce a newly bound local socket to the engine.
    fn add_socket(&self, addr: &Address);

    /// Introduce a peer address for a transfer, optionally pinned to one
    /// local socket.
    fn add_peer(&self, download: DownloadId, addr: &Address, sock_addr: Option<&Address>);

    fn start_download(&self, download: DownloadId);

    fn remove_download(&self, download: DownloadId, rm_state: bool, rm_content: bool);

    /// Snapshot of all active channels; path selection's tier 1 input.
    fn channel_stats(&self) -> Vec<ChannelStats>;
}

/// Engine commands that can be deferred until readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    AddSocket(Address),
    AddPeer {
        download: DownloadId,
        addr: Address,
        sock_addr: Option<Address>,
    },
    StartDownload(DownloadId),
    RemoveDownload {
        download: DownloadId,
        rm_state: bool,
        rm_content: bool,
    },
    /// An overlay send deferred until the engine comes up.
    Send {
        candidates: Vec<Address>,
        packets: Vec<Vec<u8>>,
    },
}

/// Unbounded FIFO of deferred commands, replayed in order on readiness.
/// Buffers instead of blocking the caller.
#[derive(Debug, Default)]
pub struct CommandQueue {
    queue: VecDeque<EngineCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, command: EngineCommand) {
        debug!("queueing {} until engine is ready", command_name(&command));
        self.queue.push_back(command);
    }

    /// Drain everything, oldest first.
    pub fn drain(&mut self) -> Vec<EngineCommand> {
        self.queue.drain(..).collect()
    }
}

fn command_name(command: &EngineCommand) -> &'static str {
    match command {
        EngineCommand::AddSocket(_) => "add-socket",
        EngineCommand::AddPeer { .. } => "add-peer",
        EngineCommand::StartDownload(_) => "start-download",
        EngineCommand::RemoveDownload { .. } => "remove-download",
        EngineCommand::Send { .. } => "send",
    }
}

/// Engine stub for tests and for running the daemon without a transfer
/// backend: always ready, no channels.
#[derive(Debug, Default)]
pub struct NullTransferEngine;

impl TransferEngine for NullTransferEngine {
    fn is_ready(&self) -> bool {
        true
    }

    fn add_socket(&self, _addr: &Address) {}

    fn add_peer(&self, _download: DownloadId, _addr: &Address, _sock_addr: Option<&Address>) {}

    fn start_download(&self, _download: DownloadId) {}

    fn remove_download(&self, _download: DownloadId, _rm_state: bool, _rm_content: bool) {}

    fn channel_stats(&self) -> Vec<ChannelStats> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_replays_in_order() {
        let mut queue = CommandQueue::new();
        let a = Address::parse("1.1.1.1:1");
        let b = Address::parse("2.2.2.2:2");
        queue.push(EngineCommand::AddSocket(a.clone()));
        queue.push(EngineCommand::StartDownload(DownloadId([1u8; 20])));
        queue.push(EngineCommand::AddSocket(b.clone()));

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], EngineCommand::AddSocket(a));
        assert_eq!(drained[2], EngineCommand::AddSocket(b));
        assert!(queue.is_empty());
    }
}
