// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Just enough of the IKE wire format to route datagrams
//!
//! Message construction and payload parsing belong to the protocol layer. The socket layer only
//! needs the fixed header to find which session owns a datagram.

use bytes::Buf;

/// Length of the fixed IKE header (RFC 7296 section 3.1)
pub const IKE_HEADER_LEN: usize = 28;

/// Four zero bytes that precede IKE messages on the NAT-T port
pub const NON_ESP_MARKER: [u8; 4] = [0; 4];

/// Payload of a NAT-T keepalive (RFC 3948 section 2.3)
pub const NATT_KEEPALIVE_PAYLOAD: [u8; 1] = [0xff];

const FLAG_INITIATOR: u8 = 0x08;
const FLAG_RESPONSE: u8 = 0x20;

/// Fixed IKE message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeHeader {
    /// SPI chosen by the original initiator of the IKE SA
    pub initiator_spi: u64,
    /// SPI chosen by the original responder, zero in the first IKE_SA_INIT request
    pub responder_spi: u64,
    /// Type of the first payload
    pub next_payload: u8,
    /// Major (high nibble) and minor version
    pub version: u8,
    /// Exchange type
    pub exchange_type: u8,
    /// Header flags
    pub flags: u8,
    /// Message ID
    pub message_id: u32,
    /// Total message length including the header
    pub length: u32,
}

impl IkeHeader {
    /// Decode the header at the start of `packet`
    ///
    /// Returns `None` if the datagram is too short or its declared length disagrees with the
    /// datagram length.
    pub fn decode(packet: &[u8]) -> Option<Self> {
        if packet.len() < IKE_HEADER_LEN {
            return None;
        }
        let mut buf = packet;
        let header = Self {
            initiator_spi: buf.get_u64(),
            responder_spi: buf.get_u64(),
            next_payload: buf.get_u8(),
            version: buf.get_u8(),
            exchange_type: buf.get_u8(),
            flags: buf.get_u8(),
            message_id: buf.get_u32(),
            length: buf.get_u32(),
        };
        if header.length as usize != packet.len() {
            return None;
        }
        Some(header)
    }

    /// Whether the sender is the original initiator of the IKE SA
    pub fn from_initiator(&self) -> bool {
        self.flags & FLAG_INITIATOR != 0
    }

    /// Whether the message is a response
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// SPI that the receiving side generated, used to find the owning session
    pub fn local_spi(&self) -> u64 {
        if self.from_initiator() {
            self.responder_spi
        } else {
            self.initiator_spi
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_header_for_test(
    initiator_spi: u64,
    responder_spi: u64,
    flags: u8,
    body: &[u8],
) -> Vec<u8> {
    use bytes::BufMut;

    let mut out = Vec::with_capacity(IKE_HEADER_LEN + body.len());
    out.put_u64(initiator_spi);
    out.put_u64(responder_spi);
    out.put_u8(33); // SA payload
    out.put_u8(0x20);
    out.put_u8(34); // IKE_SA_INIT
    out.put_u8(flags);
    out.put_u32(0);
    out.put_u32((IKE_HEADER_LEN + body.len()) as u32);
    out.extend_from_slice(body);
    out
}
