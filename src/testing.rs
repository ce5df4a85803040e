// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! In-memory stand-ins for the platform services a controller depends on

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::address::LocalAddressGenerator;
use crate::controller::{ConnectionCallback, SaRecord};
use crate::error::ConnectionError;
use crate::mobility::{
    MonitorError, NetworkEvent, NetworkMonitor, NetworkObserver, ObserverId, ObserverScope,
};
use crate::network::{is_global_ipv6, Connectivity, LinkProperties, Network, NetworkCapabilities};
use crate::packet::IkeHeader;
use crate::socket::{
    IkeSocket, InboundPacket, OwnerId, PacketSink, SocketKind, SocketProvider, SocketRequest,
};

#[derive(Debug, Default)]
struct ConnectivityState {
    active: Option<Network>,
    networks: FxHashMap<Network, (LinkProperties, NetworkCapabilities)>,
    /// `None` entries are failed lookups
    dns_script: VecDeque<Option<Vec<IpAddr>>>,
    dns_answer: Option<Vec<IpAddr>>,
    dns_calls: usize,
}

/// Networks and DNS answers under test control
#[derive(Debug, Default)]
pub(crate) struct MockConnectivity {
    state: Mutex<ConnectivityState>,
}

impl MockConnectivity {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_active(&self, network: Option<Network>) {
        self.state.lock().active = network;
    }

    pub(crate) fn set_network(
        &self,
        network: Network,
        link: LinkProperties,
        caps: NetworkCapabilities,
    ) {
        self.state.lock().networks.insert(network, (link, caps));
    }

    pub(crate) fn remove_network(&self, network: &Network) {
        self.state.lock().networks.remove(network);
    }

    /// Queue one failing lookup
    pub(crate) fn push_dns_failure(&self) {
        self.state.lock().dns_script.push_back(None);
    }

    /// Queue one lookup answer
    pub(crate) fn push_dns_answer(&self, addresses: Vec<IpAddr>) {
        self.state.lock().dns_script.push_back(Some(addresses));
    }

    /// Answer returned once the queue is drained
    pub(crate) fn set_dns_answer(&self, addresses: Vec<IpAddr>) {
        self.state.lock().dns_answer = Some(addresses);
    }

    pub(crate) fn dns_calls(&self) -> usize {
        self.state.lock().dns_calls
    }
}

#[async_trait]
impl Connectivity for MockConnectivity {
    fn active_network(&self) -> Option<Network> {
        self.state.lock().active.clone()
    }

    fn link_properties(&self, network: &Network) -> Option<LinkProperties> {
        self.state.lock().networks.get(network).map(|(l, _)| l.clone())
    }

    fn network_capabilities(&self, network: &Network) -> Option<NetworkCapabilities> {
        self.state.lock().networks.get(network).map(|(_, c)| c.clone())
    }

    async fn resolve(&self, _network: &Network, hostname: &str) -> io::Result<Vec<IpAddr>> {
        let mut state = self.state.lock();
        state.dns_calls += 1;
        let answer = match state.dns_script.pop_front() {
            Some(scripted) => scripted,
            None => state.dns_answer.clone(),
        };
        answer.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no answer for {hostname}"))
        })
    }
}

#[derive(Default)]
struct MonitorState {
    observers: Vec<(ObserverId, ObserverScope, Arc<dyn NetworkObserver>)>,
    next_id: u64,
    reject: bool,
}

/// Network monitor whose events are emitted by the test
#[derive(Default)]
pub(crate) struct MockNetworkMonitor {
    state: Mutex<MonitorState>,
}

impl MockNetworkMonitor {
    pub(crate) fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    pub(crate) fn scopes(&self) -> Vec<ObserverScope> {
        let state = self.state.lock();
        state.observers.iter().map(|(_, s, _)| s.clone()).collect()
    }

    pub(crate) fn reject_registrations(&self) {
        self.state.lock().reject = true;
    }

    /// Deliver `event` to every registered observer
    pub(crate) fn emit(&self, event: NetworkEvent) {
        let observers: Vec<_> = {
            let state = self.state.lock();
            state.observers.iter().map(|(_, _, o)| o.clone()).collect()
        };
        for observer in observers {
            observer.on_network_event(event.clone());
        }
    }
}

impl NetworkMonitor for MockNetworkMonitor {
    fn register_observer(
        &self,
        scope: ObserverScope,
        observer: Arc<dyn NetworkObserver>,
    ) -> Result<ObserverId, MonitorError> {
        let mut state = self.state.lock();
        if state.reject {
            return Err(MonitorError::Rejected("rejected by test".into()));
        }
        state.next_id += 1;
        let id = ObserverId(state.next_id);
        state.observers.push((id, scope, observer));
        Ok(id)
    }

    fn unregister_observer(&self, id: ObserverId) {
        self.state.lock().observers.retain(|(i, _, _)| *i != id);
    }
}

/// Socket operations in the order they happened, across every socket of a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SocketEvent {
    Acquire { kind: SocketKind, owner: OwnerId },
    Register { kind: SocketKind, spi: u64 },
    Unregister { kind: SocketKind, spi: u64 },
    Release { kind: SocketKind, owner: OwnerId },
}

type SocketLog = Arc<Mutex<Vec<SocketEvent>>>;

/// Socket recording everything sent on it
#[derive(Debug)]
pub(crate) struct MockSocket {
    kind: SocketKind,
    network: Network,
    local_port: u16,
    routes: Mutex<FxHashMap<u64, PacketSink>>,
    owners: Mutex<BTreeSet<OwnerId>>,
    sent: Mutex<Vec<(Vec<u8>, IpAddr)>>,
    keepalives: Mutex<Vec<Ipv4Addr>>,
    log: SocketLog,
}

impl MockSocket {
    pub(crate) fn new(kind: SocketKind, network: Network) -> Arc<Self> {
        Arc::new(Self::with_log(kind, network, 40_000, SocketLog::default()))
    }

    fn with_log(kind: SocketKind, network: Network, local_port: u16, log: SocketLog) -> Self {
        Self {
            kind,
            network,
            local_port,
            routes: Mutex::default(),
            owners: Mutex::default(),
            sent: Mutex::default(),
            keepalives: Mutex::default(),
            log,
        }
    }

    pub(crate) fn keepalives(&self) -> Vec<Ipv4Addr> {
        self.keepalives.lock().clone()
    }

    pub(crate) fn sent(&self) -> Vec<(Vec<u8>, IpAddr)> {
        self.sent.lock().clone()
    }

    pub(crate) fn registered_spis(&self) -> Vec<u64> {
        let mut spis: Vec<u64> = self.routes.lock().keys().copied().collect();
        spis.sort_unstable();
        spis
    }

    pub(crate) fn owners(&self) -> Vec<OwnerId> {
        self.owners.lock().iter().copied().collect()
    }

    fn is_open(&self) -> bool {
        !self.owners.lock().is_empty()
    }

    /// Deliver an inbound message as if it came off the wire; false if no session owns it
    pub(crate) fn inject(&self, packet: &[u8]) -> bool {
        let Some(header) = IkeHeader::decode(packet) else {
            return false;
        };
        let spi = header.local_spi();
        let Some(sink) = self.routes.lock().get(&spi).cloned() else {
            return false;
        };
        sink.try_send(InboundPacket {
            local_spi: spi,
            header,
            data: Bytes::copy_from_slice(packet),
        })
        .is_ok()
    }
}

impl IkeSocket for MockSocket {
    fn kind(&self) -> SocketKind {
        self.kind
    }

    fn network(&self) -> &Network {
        &self.network
    }

    fn register_ike(&self, spi: u64, sink: PacketSink) {
        self.routes.lock().insert(spi, sink);
        self.log.lock().push(SocketEvent::Register {
            kind: self.kind,
            spi,
        });
    }

    fn unregister_ike(&self, spi: u64) {
        self.routes.lock().remove(&spi);
        self.log.lock().push(SocketEvent::Unregister {
            kind: self.kind,
            spi,
        });
    }

    fn send_ike_packet(&self, packet: &[u8], remote: IpAddr) -> io::Result<()> {
        if remote.is_ipv4() != self.kind.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{remote} does not match a {} socket", self.kind),
            ));
        }
        self.sent.lock().push((packet.to_vec(), remote));
        Ok(())
    }

    fn send_nat_keepalive(&self, remote: Ipv4Addr) -> io::Result<()> {
        self.keepalives.lock().push(remote);
        Ok(())
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn release_reference(&self, owner: OwnerId) {
        if self.owners.lock().remove(&owner) {
            self.log.lock().push(SocketEvent::Release {
                kind: self.kind,
                owner,
            });
        }
    }
}

/// Provider sharing [`MockSocket`]s with the same owner semantics as the real one
#[derive(Debug)]
pub(crate) struct MockSocketProvider {
    sockets: Mutex<FxHashMap<SocketRequest, Arc<MockSocket>>>,
    log: SocketLog,
    fail_next: AtomicBool,
    next_port: AtomicU16,
}

impl Default for MockSocketProvider {
    fn default() -> Self {
        Self {
            sockets: Mutex::default(),
            log: SocketLog::default(),
            fail_next: AtomicBool::new(false),
            next_port: AtomicU16::new(50_000),
        }
    }
}

impl MockSocketProvider {
    /// Total number of references held across every socket
    pub(crate) fn live_references(&self) -> usize {
        let sockets = self.sockets.lock();
        sockets.values().map(|s| s.owners.lock().len()).sum()
    }

    /// The open socket of `kind`, if any
    pub(crate) fn socket(&self, kind: SocketKind) -> Option<Arc<MockSocket>> {
        let sockets = self.sockets.lock();
        sockets
            .values()
            .find(|s| s.kind == kind && s.is_open())
            .cloned()
    }

    /// Every socket ever handed out for `kind`, open or not
    pub(crate) fn sockets_of(&self, kind: SocketKind) -> Vec<Arc<MockSocket>> {
        let sockets = self.sockets.lock();
        sockets.values().filter(|s| s.kind == kind).cloned().collect()
    }

    pub(crate) fn events(&self) -> Vec<SocketEvent> {
        self.log.lock().clone()
    }

    pub(crate) fn clear_events(&self) {
        self.log.lock().clear();
    }

    /// Make the next acquisition fail
    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl SocketProvider for MockSocketProvider {
    fn acquire(&self, request: SocketRequest, owner: OwnerId) -> io::Result<Arc<dyn IkeSocket>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "socket creation failed",
            ));
        }

        let kind = request.kind;
        let socket = {
            let mut sockets = self.sockets.lock();
            match sockets.get(&request) {
                Some(socket) if socket.is_open() => socket.clone(),
                _ => {
                    let port = self.next_port.fetch_add(1, Ordering::SeqCst);
                    let socket = Arc::new(MockSocket::with_log(
                        kind,
                        request.network.clone(),
                        port,
                        self.log.clone(),
                    ));
                    sockets.insert(request, socket.clone());
                    socket
                }
            }
        };

        socket.owners.lock().insert(owner);
        self.log.lock().push(SocketEvent::Acquire { kind, owner });
        Ok(socket)
    }
}

/// Resolves local addresses from link properties instead of the kernel
#[derive(Debug)]
pub(crate) struct LinkAddressGenerator {
    default: LinkProperties,
    links: Mutex<FxHashMap<Network, LinkProperties>>,
}

impl LinkAddressGenerator {
    pub(crate) fn new(default: LinkProperties) -> Self {
        Self {
            default,
            links: Mutex::default(),
        }
    }

    pub(crate) fn set_link(&self, network: Network, link: LinkProperties) {
        self.links.lock().insert(network, link);
    }
}

impl LocalAddressGenerator for LinkAddressGenerator {
    fn generate_local_address(
        &self,
        network: &Network,
        remote: IpAddr,
        _remote_port: u16,
    ) -> io::Result<IpAddr> {
        let links = self.links.lock();
        let link = links.get(network).unwrap_or(&self.default);
        link.addresses
            .iter()
            .copied()
            .find(|addr| match (addr, remote) {
                (IpAddr::V4(_), IpAddr::V4(_)) => true,
                (IpAddr::V6(local), IpAddr::V6(_)) => is_global_ipv6(local),
                _ => false,
            })
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no local address for {remote} on {network}"),
                )
            })
    }
}

/// Callback recording every notification
#[derive(Debug, Default)]
pub(crate) struct RecordingCallback {
    updated: Mutex<usize>,
    died: Mutex<Vec<Network>>,
    errors: Mutex<Vec<String>>,
    packets: Mutex<Vec<(IkeHeader, Bytes)>>,
}

impl RecordingCallback {
    pub(crate) fn updated_count(&self) -> usize {
        *self.updated.lock()
    }

    pub(crate) fn died(&self) -> Vec<Network> {
        self.died.lock().clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub(crate) fn packets(&self) -> Vec<(IkeHeader, Bytes)> {
        self.packets.lock().clone()
    }
}

impl ConnectionCallback for RecordingCallback {
    fn on_underlying_network_updated(&self) {
        *self.updated.lock() += 1;
    }

    fn on_underlying_network_died(&self, network: &Network) {
        self.died.lock().push(network.clone());
    }

    fn on_ike_packet_received(&self, header: IkeHeader, packet: Bytes) {
        self.packets.lock().push((header, packet));
    }

    fn on_error(&self, error: ConnectionError) {
        self.errors.lock().push(error.to_string());
    }
}

/// IKE SA recording the address pairs it was moved to
#[derive(Debug)]
pub(crate) struct MockSaRecord {
    spi: u64,
    fail: bool,
    migrations: Mutex<Vec<(IpAddr, IpAddr)>>,
}

impl MockSaRecord {
    pub(crate) fn new(spi: u64) -> Arc<Self> {
        Arc::new(Self {
            spi,
            fail: false,
            migrations: Mutex::default(),
        })
    }

    /// SA whose migration always fails
    pub(crate) fn failing(spi: u64) -> Arc<Self> {
        Arc::new(Self {
            spi,
            fail: true,
            migrations: Mutex::default(),
        })
    }

    pub(crate) fn migrations(&self) -> Vec<(IpAddr, IpAddr)> {
        self.migrations.lock().clone()
    }
}

impl SaRecord for MockSaRecord {
    fn local_spi(&self) -> u64 {
        self.spi
    }

    fn migrate(&self, local: IpAddr, remote: IpAddr) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "SA refused to migrate",
            ));
        }
        self.migrations.lock().push((local, remote));
        Ok(())
    }
}
