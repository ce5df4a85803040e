// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{
    bind_to_network, IkeSocket, InboundPacket, OwnerId, PacketSink, SocketKind, SocketProvider,
    SocketRequest,
};
use crate::network::Network;
use crate::packet::{IkeHeader, NATT_KEEPALIVE_PAYLOAD, NON_ESP_MARKER};
use crate::SERVER_PORT_UDP_ENCAPSULATED;

/// Pause after a transient receive error, so a stream of ICMP-triggered errors cannot spin
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

type Registry = Mutex<FxHashMap<SocketRequest, Weak<UdpIkeSocket>>>;
type Routes = Mutex<FxHashMap<u64, PacketSink>>;

/// Kernel UDP sockets, shared per [`SocketRequest`]
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Default)]
pub struct UdpSocketProvider {
    registry: Arc<Registry>,
}

impl UdpSocketProvider {
    /// Provider with no open socket
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sockets currently open
    pub fn open_sockets(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|socket| socket.strong_count() > 0)
            .count()
    }
}

impl SocketProvider for UdpSocketProvider {
    fn acquire(&self, request: SocketRequest, owner: OwnerId) -> io::Result<Arc<dyn IkeSocket>> {
        let mut registry = self.registry.lock();
        if let Some(socket) = registry.get(&request).and_then(Weak::upgrade) {
            if socket.add_owner(owner) {
                return Ok(socket);
            }
        }

        let socket = UdpIkeSocket::open(request.clone(), Arc::downgrade(&self.registry))?;
        socket.add_owner(owner);
        debug!(
            network = %request.network,
            kind = %request.kind,
            port = socket.local_port,
            %owner,
            "opened IKE socket"
        );
        registry.insert(request, Arc::downgrade(&socket));
        Ok(socket)
    }
}

struct State {
    owners: BTreeSet<OwnerId>,
    recv_task: Option<JoinHandle<()>>,
    closed: bool,
}

/// One kernel UDP socket and its SPI routing table
struct UdpIkeSocket {
    request: SocketRequest,
    /// Duplicate of the receiving socket's descriptor, sends never wait on reactor readiness
    sender: std::net::UdpSocket,
    local_port: u16,
    routes: Arc<Routes>,
    state: Mutex<State>,
    registry: Weak<Registry>,
}

impl UdpIkeSocket {
    fn open(request: SocketRequest, registry: Weak<Registry>) -> io::Result<Arc<Self>> {
        let kind = request.kind;
        let (domain, bind_addr) = if kind.is_ipv4() {
            (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        } else {
            (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if !kind.is_ipv4() {
            socket.set_only_v6(true)?;
        }
        bind_to_network(&socket, &request.network)?;
        apply_dscp(&socket, kind, request.dscp)?;
        socket.set_nonblocking(true)?;
        socket.bind(&bind_addr.into())?;

        let socket: std::net::UdpSocket = socket.into();
        let sender = socket.try_clone()?;
        let socket = UdpSocket::from_std(socket)?;
        let local_port = socket.local_addr()?.port();
        let socket = Arc::new(socket);
        let routes = Arc::new(Routes::default());
        let recv_task = tokio::spawn(recv_loop(socket.clone(), kind, routes.clone()));

        Ok(Arc::new(Self {
            request,
            sender,
            local_port,
            routes,
            state: Mutex::new(State {
                owners: BTreeSet::new(),
                recv_task: Some(recv_task),
                closed: false,
            }),
            registry,
        }))
    }

    /// Returns false if the socket was already closed
    fn add_owner(&self, owner: OwnerId) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.owners.insert(owner);
        true
    }

    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()> {
        if dest.is_ipv4() != self.request.kind.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{dest} does not match {} socket", self.request.kind),
            ));
        }
        self.sender.send_to(datagram, dest).map(|_| ())
    }
}

impl IkeSocket for UdpIkeSocket {
    fn kind(&self) -> SocketKind {
        self.request.kind
    }

    fn network(&self) -> &Network {
        &self.request.network
    }

    fn register_ike(&self, spi: u64, sink: PacketSink) {
        self.routes.lock().insert(spi, sink);
    }

    fn unregister_ike(&self, spi: u64) {
        self.routes.lock().remove(&spi);
    }

    fn send_ike_packet(&self, packet: &[u8], remote: IpAddr) -> io::Result<()> {
        let dest = SocketAddr::new(remote, self.request.kind.server_port());
        if self.request.kind.uses_encap_port() {
            let mut framed = Vec::with_capacity(NON_ESP_MARKER.len() + packet.len());
            framed.extend_from_slice(&NON_ESP_MARKER);
            framed.extend_from_slice(packet);
            self.send_to(&framed, dest)
        } else {
            self.send_to(packet, dest)
        }
    }

    fn send_nat_keepalive(&self, remote: Ipv4Addr) -> io::Result<()> {
        let dest = SocketAddr::from((remote, SERVER_PORT_UDP_ENCAPSULATED));
        self.send_to(&NATT_KEEPALIVE_PAYLOAD, dest)
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn release_reference(&self, owner: OwnerId) {
        let recv_task = {
            let mut state = self.state.lock();
            if !state.owners.remove(&owner) || !state.owners.is_empty() {
                return;
            }
            state.closed = true;
            state.recv_task.take()
        };
        if let Some(task) = recv_task {
            task.abort();
        }
        self.routes.lock().clear();

        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock();
            let this: *const Self = self;
            if registry
                .get(&self.request)
                .is_some_and(|entry| entry.as_ptr() == this)
            {
                registry.remove(&self.request);
            }
        }
        debug!(
            network = %self.request.network,
            kind = %self.request.kind,
            port = self.local_port,
            "closed IKE socket"
        );
    }
}

impl fmt::Debug for UdpIkeSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpIkeSocket")
            .field("network", &self.request.network)
            .field("kind", &self.request.kind)
            .field("local_port", &self.local_port)
            .field("owners", &self.state.lock().owners.len())
            .finish_non_exhaustive()
    }
}

impl Drop for UdpIkeSocket {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().recv_task.take() {
            task.abort();
        }
    }
}

fn apply_dscp(socket: &Socket, kind: SocketKind, dscp: u8) -> io::Result<()> {
    if dscp == 0 {
        return Ok(());
    }
    if !kind.is_ipv4() {
        trace!(dscp, "DSCP not applied to IPv6 socket");
        return Ok(());
    }
    #[cfg(any(target_os = "android", target_os = "linux", target_os = "macos"))]
    {
        // DSCP is the upper six bits of the TOS byte
        socket.set_tos(u32::from(dscp) << 2)
    }
    #[cfg(not(any(target_os = "android", target_os = "linux", target_os = "macos")))]
    {
        let _ = socket;
        trace!(dscp, "DSCP not supported on this platform");
        Ok(())
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, kind: SocketKind, routes: Arc<Routes>) {
    let mut buf = vec![0u8; 65535];
    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => match recv_retry_delay(&e) {
                Some(delay) => {
                    trace!(error = %e, "transient receive error");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                None => {
                    warn!(error = %e, "receive failed, IKE socket stops reading");
                    return;
                }
            },
        };
        let Some((header, data)) = demux_datagram(kind, &buf[..len]) else {
            trace!(%source, len, "ignoring non-IKE datagram");
            continue;
        };

        let local_spi = header.local_spi();
        let sink = routes.lock().get(&local_spi).cloned();
        match sink {
            Some(sink) => {
                let packet = InboundPacket {
                    local_spi,
                    header,
                    data,
                };
                if sink.try_send(packet).is_err() {
                    debug!(spi = local_spi, "session not keeping up, dropping IKE message");
                }
            }
            None => debug!(spi = local_spi, %source, "no session for IKE message"),
        }
    }
}

/// How long to wait before reading again, `None` if the socket is unusable
///
/// Resets and refusals are reported by some platforms for ICMP errors triggered by earlier sends.
fn recv_retry_delay(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => Some(RECV_ERROR_BACKOFF),
        _ => None,
    }
}

/// Strip framing from a received datagram and decode its IKE header
///
/// On encap-port sockets, NAT-T keepalives and ESP packets (no non-ESP marker) yield `None`.
pub(crate) fn demux_datagram(kind: SocketKind, datagram: &[u8]) -> Option<(IkeHeader, Bytes)> {
    let message = if kind.uses_encap_port() {
        if datagram == NATT_KEEPALIVE_PAYLOAD {
            return None;
        }
        datagram.strip_prefix(&NON_ESP_MARKER[..])?
    } else {
        datagram
    };
    let header = IkeHeader::decode(message)?;
    Some((header, Bytes::copy_from_slice(message)))
}
