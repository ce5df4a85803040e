// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Shared IKE sockets
//!
//! Sockets are keyed by [`SocketRequest`] and shared by every controller asking for the same
//! network, kind and DSCP. Each controller holds one reference identified by its [`OwnerId`]; the
//! socket closes when the last owner releases it. Inbound IKE messages are routed to the session
//! owning the SPI found in the message header.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::network::Network;
use crate::packet::IkeHeader;
use crate::{SERVER_PORT_NON_UDP_ENCAPSULATED, SERVER_PORT_UDP_ENCAPSULATED};

mod udp;

pub use udp::UdpSocketProvider;

/// The four socket flavours an IKE session can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketKind {
    /// IPv4, server port 500
    Udp4,
    /// IPv6, server port 500
    Udp6,
    /// IPv4 ESP-in-UDP socket, server port 4500
    Udp4Encap,
    /// IPv6, server port 4500
    Udp6EncapPort,
}

impl SocketKind {
    /// Kind for a remote address family and server port choice
    pub fn select(is_ipv4: bool, use_encap_port: bool) -> Self {
        match (is_ipv4, use_encap_port) {
            (true, false) => Self::Udp4,
            (true, true) => Self::Udp4Encap,
            (false, false) => Self::Udp6,
            (false, true) => Self::Udp6EncapPort,
        }
    }

    /// Whether the socket carries IPv4
    pub fn is_ipv4(self) -> bool {
        matches!(self, Self::Udp4 | Self::Udp4Encap)
    }

    /// Whether the socket talks to server port 4500 and frames IKE with the non-ESP marker
    pub fn uses_encap_port(self) -> bool {
        matches!(self, Self::Udp4Encap | Self::Udp6EncapPort)
    }

    /// Whether ESP packets are UDP-encapsulated on this socket
    ///
    /// Only the IPv4 encap socket qualifies, NAT-T keepalives are sent on it alone.
    pub fn is_udp_encap(self) -> bool {
        self == Self::Udp4Encap
    }

    /// Server port packets are sent to
    pub fn server_port(self) -> u16 {
        if self.uses_encap_port() {
            SERVER_PORT_UDP_ENCAPSULATED
        } else {
            SERVER_PORT_NON_UDP_ENCAPSULATED
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Udp4Encap => "udp4-encap",
            Self::Udp6EncapPort => "udp6-encap-port",
        };
        f.write_str(name)
    }
}

/// Identifies a socket owner, one per controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub u32);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Everything that distinguishes one shared socket from another
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketRequest {
    /// Network the socket is bound to
    pub network: Network,
    /// Socket flavour
    pub kind: SocketKind,
    /// DSCP applied to outgoing packets
    pub dscp: u8,
}

/// An inbound IKE message routed to its session
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// SPI the message was routed by
    pub local_spi: u64,
    /// Decoded fixed header
    pub header: IkeHeader,
    /// The full IKE message, without any non-ESP marker
    pub data: Bytes,
}

/// Where a socket delivers the messages of a registered SPI
pub type PacketSink = mpsc::Sender<InboundPacket>;

/// A UDP socket shared by IKE sessions
pub trait IkeSocket: Send + Sync + fmt::Debug + 'static {
    /// Flavour of this socket
    fn kind(&self) -> SocketKind;

    /// Network the socket is bound to
    fn network(&self) -> &Network;

    /// Route messages whose local SPI is `spi` to `sink`, replacing any previous route
    fn register_ike(&self, spi: u64, sink: PacketSink);

    /// Stop routing messages for `spi`
    fn unregister_ike(&self, spi: u64);

    /// Send an IKE message to `remote` on the kind's server port
    ///
    /// Sockets using the encap port prepend the non-ESP marker.
    fn send_ike_packet(&self, packet: &[u8], remote: IpAddr) -> io::Result<()>;

    /// Send a single-byte NAT-T keepalive to `remote:4500`
    fn send_nat_keepalive(&self, remote: Ipv4Addr) -> io::Result<()>;

    /// Local port the socket is bound to
    fn local_port(&self) -> u16;

    /// Server port this socket talks to
    fn server_port(&self) -> u16 {
        self.kind().server_port()
    }

    /// Drop `owner`'s reference; the socket closes once no owner is left
    fn release_reference(&self, owner: OwnerId);
}

/// Creates or reuses shared sockets
pub trait SocketProvider: Send + Sync + 'static {
    /// Get the socket matching `request`, adding `owner` as a holder
    ///
    /// Acquiring the same socket twice with the same owner counts as a single reference.
    fn acquire(&self, request: SocketRequest, owner: OwnerId) -> io::Result<Arc<dyn IkeSocket>>;
}

/// Bind `socket` to the network's interface, if it names one
pub(crate) fn bind_to_network(socket: &socket2::Socket, network: &Network) -> io::Result<()> {
    let Some(interface) = network.interface.as_deref() else {
        return Ok(());
    };
    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    {
        socket.bind_device(Some(interface.as_bytes()))
    }
    #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
    {
        let _ = socket;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot bind to interface {interface} on this platform"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_selection_and_ports() {
        assert_eq!(SocketKind::select(true, false), SocketKind::Udp4);
        assert_eq!(SocketKind::select(true, true), SocketKind::Udp4Encap);
        assert_eq!(SocketKind::select(false, false), SocketKind::Udp6);
        assert_eq!(SocketKind::select(false, true), SocketKind::Udp6EncapPort);

        assert_eq!(SocketKind::Udp4.server_port(), 500);
        assert_eq!(SocketKind::Udp6EncapPort.server_port(), 4500);
        assert!(SocketKind::Udp4Encap.is_udp_encap());
        assert!(!SocketKind::Udp6EncapPort.is_udp_encap());
        assert!(!SocketKind::Udp6EncapPort.is_ipv4());
    }
}
