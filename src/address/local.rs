// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};

use crate::network::Network;
use crate::socket::bind_to_network;

/// Derives the source address used to reach a remote endpoint
pub trait LocalAddressGenerator: Send + Sync + 'static {
    /// Source address the kernel would pick for `remote:remote_port` on `network`
    ///
    /// The returned address must belong to the same family as `remote`.
    fn generate_local_address(
        &self,
        network: &Network,
        remote: IpAddr,
        remote_port: u16,
    ) -> io::Result<IpAddr>;
}

/// Asks the kernel by connecting a throwaway UDP socket
///
/// Connecting a datagram socket sends nothing but runs route selection, after which the socket's
/// local address is the answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpProbeAddressGenerator;

impl LocalAddressGenerator for UdpProbeAddressGenerator {
    fn generate_local_address(
        &self,
        network: &Network,
        remote: IpAddr,
        remote_port: u16,
    ) -> io::Result<IpAddr> {
        let remote = SocketAddr::new(remote, remote_port);
        let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
        bind_to_network(&socket, network)?;
        socket.connect(&remote.into())?;
        let local = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an IP socket"))?;
        Ok(local.ip())
    }
}
