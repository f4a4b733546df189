//! Wire payloads for address exchange and NAT puncturing
//!
//! Frames are length-prefixed so a byte stream can re-synchronize after a
//! damaged frame: `u32 BE length | 1-byte kind | CBOR body`. The length
//! covers kind + body. Message kinds form a closed enum; decoding an
//! unknown kind is an error, never a panic.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::contact::CommunityId;
use crate::peer::{EndpointId, MemberId};

/// Message kind tags (0x21-0x2F, clear of the data-plane range).
pub const MSG_ADDRESSES: u8 = 0x21;
pub const MSG_ADDRESSES_REQUEST: u8 = 0x22;
pub const MSG_PUNCTURE: u8 = 0x23;

/// Upper bound on a frame body; anything larger is a framing error.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// One (endpoint id, LAN, WAN) triple in an addresses announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub id: EndpointId,
    pub lan: Address,
    pub wan: Address,
}

/// Full announcement of a node's local sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressesMessage {
    pub community: CommunityId,
    pub sender: Option<MemberId>,
    pub entries: Vec<AddressEntry>,
}

/// Request for the remote's addresses announcement, carrying what the
/// sender believes about itself and about the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressesRequestMessage {
    pub sender_lan: Address,
    pub sender_wan: Address,
    pub endpoint_id: EndpointId,
    pub target_wan: Address,
}

/// NAT puncture probe; doubles as a WAN vote for the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunctureMessage {
    pub community: CommunityId,
    pub sender_lan: Address,
    pub sender_wan: Address,
    pub sender_id: Option<MemberId>,
    /// The address the sender observed this node under.
    pub vote: Address,
    pub endpoint_id: EndpointId,
}

/// Closed set of transport control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Addresses(AddressesMessage),
    AddressesRequest(AddressesRequestMessage),
    Puncture(PunctureMessage),
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::Addresses(_) => MSG_ADDRESSES,
            Message::AddressesRequest(_) => MSG_ADDRESSES_REQUEST,
            Message::Puncture(_) => MSG_PUNCTURE,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Addresses(_) => "addresses",
            Message::AddressesRequest(_) => "addresses-request",
            Message::Puncture(_) => "puncture",
        }
    }

    /// Encode as one length-prefixed frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Message::Addresses(m) => serde_cbor::to_vec(m),
            Message::AddressesRequest(m) => serde_cbor::to_vec(m),
            Message::Puncture(m) => serde_cbor::to_vec(m),
        }
        .context("failed to encode message body")?;

        let len = body.len() + 1;
        if len > MAX_FRAME_LEN {
            bail!("frame too large: {} bytes", len);
        }
        let mut frame = Vec::with_capacity(4 + len);
        frame.extend_from_slice(&(len as u32).to_be_bytes());
        frame.push(self.kind());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode one frame. `buf` must contain exactly the frame produced by
    /// [`Message::encode`].
    pub fn decode(buf: &[u8]) -> Result<Message> {
        let (message, consumed) = Self::decode_prefix(buf)?;
        if consumed != buf.len() {
            bail!("trailing bytes after frame: {}", buf.len() - consumed);
        }
        Ok(message)
    }

    /// Decode the first complete frame at the start of `buf`, returning
    /// the message and the number of bytes consumed. Errors on malformed
    /// frames carry enough context for the caller to skip ahead and
    /// re-synchronize on the next length prefix.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Message, usize)> {
        if buf.len() < 5 {
            bail!("frame truncated: {} bytes", buf.len());
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            bail!("invalid frame length {}", len);
        }
        if buf.len() < 4 + len {
            bail!("frame truncated: have {} of {} bytes", buf.len() - 4, len);
        }
        let kind = buf[4];
        let body = &buf[5..4 + len];
        let message = match kind {
            MSG_ADDRESSES => Message::Addresses(
                serde_cbor::from_slice(body).context("malformed addresses body")?,
            ),
            MSG_ADDRESSES_REQUEST => Message::AddressesRequest(
                serde_cbor::from_slice(body).context("malformed addresses-request body")?,
            ),
            MSG_PUNCTURE => Message::Puncture(
                serde_cbor::from_slice(body).context("malformed puncture body")?,
            ),
            other => bail!("unknown message kind 0x{:02x}", other),
        };
        Ok((message, 4 + len))
    }

    /// Decode as many complete frames as `buf` holds, returning them along
    /// with the bytes consumed; a trailing partial frame is left for the
    /// caller to complete later.
    pub fn decode_stream(buf: &[u8]) -> Result<(Vec<Message>, usize)> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while buf.len() - offset >= 4 {
            let len =
                u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
                    as usize;
            if len == 0 || len > MAX_FRAME_LEN {
                bail!("invalid frame length {} at offset {}", len, offset);
            }
            if buf.len() - offset < 4 + len {
                break;
            }
            let (message, consumed) = Self::decode_prefix(&buf[offset..offset + 4 + len])?;
            messages.push(message);
            offset += consumed;
        }
        Ok((messages, offset))
    }
}
