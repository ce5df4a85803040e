// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! The connection controller
//!
//! [`ConnectionController`] owns every piece of network-layer state of one IKE session. It is not
//! thread-safe and is meant to be owned by a single task, see [`crate::driver`].

use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::address::{
    adjust_ip_version, AddressResolver, AddressSelector, IpVersionSet, LocalAddressGenerator,
    RemoteAddressPool,
};
use crate::config::{EncapType, IpVersion, KeepaliveDelay, SessionParams};
use crate::device_config::{DeviceConfig, CONFIG_USE_CACHED_ADDRS};
use crate::error::ConnectionError;
use crate::keepalive::{keepalive_delay_secs, KeepaliveScheduler};
use crate::mobility::{
    MobilityEvent, MobilityMonitor, MobilityQueue, NetworkMonitor, ObserverId, ObserverScope,
};
use crate::network::{
    Connectivity, LinkProperties, Network, NetworkCapabilities, UnderlyingNetworkType,
};
use crate::packet::IkeHeader;
use crate::socket::{
    IkeSocket, InboundPacket, OwnerId, PacketSink, SocketKind, SocketProvider, SocketRequest,
};
use crate::{SERVER_PORT_NON_UDP_ENCAPSULATED, SERVER_PORT_UDP_ENCAPSULATED};

/// Notifications delivered to the IKE state machine
///
/// Called from the controller's task.
pub trait ConnectionCallback: Send + Sync + 'static {
    /// The session now runs on a new network or address pair
    fn on_underlying_network_updated(&self);

    /// The network the session runs on is gone, or a network update could not be handled
    fn on_underlying_network_died(&self, network: &Network);

    /// An IKE message for one of the session's SPIs arrived
    fn on_ike_packet_received(&self, header: IkeHeader, packet: Bytes);

    /// A failure the session cannot recover from
    fn on_error(&self, error: ConnectionError);
}

/// An established IKE SA, as seen by the network layer
pub trait SaRecord: Send + Sync + 'static {
    /// SPI generated by this side
    fn local_spi(&self) -> u64;

    /// Move the SA to a new address pair
    fn migrate(&self, local: IpAddr, remote: IpAddr) -> io::Result<()>;
}

/// What is known about NAT between the session and its server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NatStatus {
    /// NAT detection has not run
    #[default]
    NotChecked,
    /// The server does not support NAT traversal
    Unsupported,
    /// NAT detection ran and found no NAT
    NotDetected,
    /// NAT detection found a NAT on the path
    Detected,
}

impl NatStatus {
    /// Whether the server is known to support NAT-T
    pub fn is_natt_supported(self) -> bool {
        matches!(self, Self::NotDetected | Self::Detected)
    }
}

impl fmt::Display for NatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotChecked => "not checked",
            Self::Unsupported => "unsupported",
            Self::NotDetected => "not detected",
            Self::Detected => "detected",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Created, `setup` has not succeeded yet
    Uninitialized,
    /// Set up and running
    Active,
    /// Torn down
    TornDown,
}

/// Per-session configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Session identifier, unique on the device
    pub session_id: u32,
    /// Network-layer session parameters
    pub params: SessionParams,
}

impl ControllerConfig {
    /// Configuration for session `session_id`
    pub fn new(session_id: u32, params: SessionParams) -> Self {
        Self { session_id, params }
    }
}

/// External collaborators of a controller
#[derive(Clone)]
pub struct Dependencies {
    /// Network lookup and DNS
    pub connectivity: Arc<dyn Connectivity>,
    /// Network change notifications
    pub monitor: Arc<dyn NetworkMonitor>,
    /// Shared sockets
    pub sockets: Arc<dyn SocketProvider>,
    /// Source address selection
    pub local_address_generator: Arc<dyn LocalAddressGenerator>,
    /// Device configuration store
    pub device_config: Arc<dyn DeviceConfig>,
    /// Notifications to the IKE state machine
    pub callback: Arc<dyn ConnectionCallback>,
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies").finish_non_exhaustive()
    }
}

/// Addressing of an established session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Local address
    pub local_address: IpAddr,
    /// Server address
    pub remote_address: IpAddr,
    /// Network the session runs on
    pub network: Network,
}

/// Serialisable dump of a controller's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    /// Session identifier
    pub session_id: u32,
    /// Lifecycle state
    pub lifecycle: Lifecycle,
    /// Current network
    pub network: Network,
    /// Underpinned network, if set
    pub underpinned_network: Option<Network>,
    /// NAT status
    pub nat_status: NatStatus,
    /// Local address
    pub local_address: Option<IpAddr>,
    /// Server address
    pub remote_address: Option<IpAddr>,
    /// Local port of the current socket
    pub local_port: Option<u16>,
    /// Server port of the current socket
    pub remote_port: Option<u16>,
    /// Kind of the current socket
    pub socket_kind: Option<SocketKind>,
    /// Whether mobility is enabled
    pub mobility_enabled: bool,
    /// ESP IP version
    pub ip_version: IpVersion,
    /// ESP encapsulation
    pub encap_type: EncapType,
}

fn display_or_none<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "none".to_owned(), ToString::to_string)
}

impl fmt::Display for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "connection controller (session {}, {:?}):", self.session_id, self.lifecycle)?;
        writeln!(f, "  network: {}", self.network)?;
        writeln!(f, "  underpinned network: {}", display_or_none(&self.underpinned_network))?;
        writeln!(f, "  nat status: {}", self.nat_status)?;
        writeln!(f, "  local address: {}", display_or_none(&self.local_address))?;
        writeln!(f, "  remote (server) address: {}", display_or_none(&self.remote_address))?;
        writeln!(f, "  mobility enabled: {}", self.mobility_enabled)?;
        writeln!(f, "  local port: {}", display_or_none(&self.local_port))?;
        writeln!(f, "  remote (server) port: {}", display_or_none(&self.remote_port))?;
        writeln!(f, "  esp ip version: {:?}", self.ip_version)?;
        write!(f, "  esp encap type: {:?}", self.encap_type)
    }
}

/// Network-layer state of one IKE session
pub struct ConnectionController {
    session_id: u32,
    owner: OwnerId,
    params: SessionParams,
    deps: Dependencies,
    resolver: AddressResolver,
    selector: AddressSelector,
    use_caller_configured_network: bool,
    force_port_4500: bool,
    dscp: u8,
    ip_version: IpVersion,
    encap_type: EncapType,

    network: Network,
    underpinned_network: Option<Network>,
    capabilities: Option<NetworkCapabilities>,
    remote_addresses: RemoteAddressPool,
    local_address: Option<IpAddr>,
    remote_address: Option<IpAddr>,
    socket: Option<Arc<dyn IkeSocket>>,
    sa_records: FxHashMap<u64, Arc<dyn SaRecord>>,
    keepalive: KeepaliveScheduler,
    nat_status: NatStatus,
    mobility_enabled: bool,
    lifecycle: Lifecycle,

    monitor: Option<(ObserverId, Arc<MobilityMonitor>)>,
    generation: u64,
    mobility_queue: MobilityQueue,
    packet_sink: PacketSink,
}

impl ConnectionController {
    /// Create a controller for the configured network, or the system default network
    ///
    /// Platform events are posted to `mobility_queue` and inbound IKE messages to `packet_sink`;
    /// the owner feeds them back through [`process_mobility_event`](Self::process_mobility_event)
    /// and [`process_inbound_packet`](Self::process_inbound_packet).
    pub fn new(
        config: ControllerConfig,
        deps: Dependencies,
        mobility_queue: MobilityQueue,
        packet_sink: PacketSink,
    ) -> Result<Self, ConnectionError> {
        let ControllerConfig { session_id, params } = config;
        let (network, use_caller_configured_network) = match params.configured_network() {
            Some(network) => (network.clone(), true),
            None => (
                deps.connectivity
                    .active_network()
                    .ok_or(ConnectionError::NoActiveNetwork)?,
                false,
            ),
        };
        let options = *params.options();

        Ok(Self {
            session_id,
            owner: OwnerId(session_id),
            resolver: AddressResolver::new(),
            selector: AddressSelector::new(options.automatic_address_family_selection),
            use_caller_configured_network,
            force_port_4500: options.force_port_4500,
            dscp: params.dscp(),
            ip_version: params.ip_version(),
            encap_type: params.encap_type(),
            network,
            underpinned_network: None,
            capabilities: None,
            remote_addresses: RemoteAddressPool::new(),
            local_address: None,
            remote_address: None,
            socket: None,
            sa_records: FxHashMap::default(),
            keepalive: KeepaliveScheduler::new(session_id, params.natt_keepalive_delay_secs()),
            nat_status: NatStatus::NotChecked,
            mobility_enabled: false,
            lifecycle: Lifecycle::Uninitialized,
            monitor: None,
            generation: 0,
            mobility_queue,
            packet_sink,
            params,
            deps,
        })
    }

    /// Resolve the server, pick addresses, open the socket and start observing the network
    ///
    /// Anything acquired before a failure is released again before the error is returned.
    pub async fn setup(&mut self) -> Result<(), ConnectionError> {
        self.unregister_resources();
        match self.try_setup().await {
            Ok(()) => {
                self.lifecycle = Lifecycle::Active;
                info!(
                    session = self.session_id,
                    network = %self.network,
                    local = %display_or_none(&self.local_address),
                    remote = %display_or_none(&self.remote_address),
                    "connection set up"
                );
                Ok(())
            }
            Err(e) => {
                warn!(session = self.session_id, error = %e, "connection setup failed");
                self.unregister_resources();
                Err(e)
            }
        }
    }

    async fn try_setup(&mut self) -> Result<(), ConnectionError> {
        let network = self.network.clone();
        let (link, caps) = self.network_info(&network)?;
        self.keepalive.set_delay(keepalive_delay_secs(
            &self.params,
            &caps,
            &*self.deps.device_config,
        ));
        self.capabilities = Some(caps.clone());

        self.remote_addresses = self
            .resolver
            .resolve(
                &*self.deps.connectivity,
                &network,
                self.params.server_hostname(),
                &link,
            )
            .await?;

        let remote_port = if self.force_port_4500 {
            SERVER_PORT_UDP_ENCAPSULATED
        } else {
            SERVER_PORT_NON_UDP_ENCAPSULATED
        };
        let (local, remote) = self.select_addresses(&link, &caps, remote_port)?;
        self.local_address = Some(local);
        self.remote_address = Some(remote);

        let socket = self.acquire_socket(remote.is_ipv4(), self.force_port_4500)?;
        self.socket = Some(socket.clone());
        self.update_keepalive(&socket)?;

        let scope = if self.use_caller_configured_network {
            ObserverScope::Specific(network.clone())
        } else {
            ObserverScope::Default
        };
        self.generation += 1;
        let monitor = Arc::new(MobilityMonitor::new(
            &scope,
            network,
            local,
            link,
            caps,
            self.generation,
            self.mobility_queue.clone(),
            self.deps.callback.clone(),
        ));
        let id = self
            .deps
            .monitor
            .register_observer(scope, monitor.clone())
            .map_err(|e| ConnectionError::MobilityRegistration(e.to_string()))?;
        self.monitor = Some((id, monitor));
        Ok(())
    }

    /// Release the socket, stop the keepalive and stop observing the network
    pub fn tear_down(&mut self) {
        self.unregister_resources();
        if self.lifecycle != Lifecycle::TornDown {
            debug!(session = self.session_id, "connection torn down");
        }
        self.lifecycle = Lifecycle::TornDown;
    }

    fn unregister_resources(&mut self) {
        self.keepalive.stop();

        if let Some((id, monitor)) = self.monitor.take() {
            monitor.deactivate();
            self.deps.monitor.unregister_observer(id);
        }

        if let Some(socket) = self.socket.take() {
            for spi in self.sa_records.keys() {
                socket.unregister_ike(*spi);
            }
            socket.release_reference(self.owner);
        }
        self.sa_records.clear();
    }

    /// Send an IKE message to the server
    pub fn send_ike_packet(&self, packet: &[u8]) -> Result<(), ConnectionError> {
        let socket = self.socket()?;
        let remote = self.remote_address.ok_or(ConnectionError::NotActive)?;
        socket
            .send_ike_packet(packet, remote)
            .map_err(ConnectionError::SocketUnavailable)
    }

    /// Route messages for an SPI awaiting the IKE_SA_INIT response to this session
    pub fn register_ike_spi(&self, spi: u64) -> Result<(), ConnectionError> {
        self.socket()?.register_ike(spi, self.packet_sink.clone());
        Ok(())
    }

    /// Stop routing messages for an SPI whose IKE_SA_INIT failed
    pub fn unregister_ike_spi(&self, spi: u64) -> Result<(), ConnectionError> {
        self.socket()?.unregister_ike(spi);
        Ok(())
    }

    /// Track a newly established IKE SA and route its messages to this session
    pub fn register_ike_sa_record(
        &mut self,
        record: Arc<dyn SaRecord>,
    ) -> Result<(), ConnectionError> {
        let socket = self.socket()?.clone();
        let spi = record.local_spi();
        self.sa_records.insert(spi, record);
        socket.register_ike(spi, self.packet_sink.clone());
        Ok(())
    }

    /// Forget a deleted IKE SA
    pub fn unregister_ike_sa_record(&mut self, local_spi: u64) -> Result<(), ConnectionError> {
        let socket = self.socket()?.clone();
        self.sa_records.remove(&local_spi);
        socket.unregister_ike(local_spi);
        Ok(())
    }

    /// Allow the session to follow network changes
    ///
    /// If the server is known to support NAT-T and the socket does not talk to port 4500 yet, the
    /// session switches to the encapsulation port of its current family.
    pub fn enable_mobility(&mut self) -> Result<(), ConnectionError> {
        self.mobility_enabled = true;

        let Some(socket) = self.socket.clone() else {
            return Ok(());
        };
        if self.nat_status.is_natt_supported()
            && socket.server_port() != SERVER_PORT_UDP_ENCAPSULATED
        {
            let is_ipv4 = self.require_remote()?.is_ipv4();
            self.get_and_switch_socket(is_ipv4, true)?;
        }
        Ok(())
    }

    /// Move the session to a network chosen by the user, possibly with new ESP preferences
    ///
    /// Fails, leaving the session untouched, if an explicit keepalive delay is out of range or the
    /// network has no link properties or capabilities. Failures while moving are
    /// reported through [`ConnectionCallback::on_error`].
    pub async fn on_network_set_by_user(
        &mut self,
        network: Network,
        ip_version: IpVersion,
        encap_type: EncapType,
        keepalive_delay: KeepaliveDelay,
    ) -> Result<(), ConnectionError> {
        keepalive_delay.validate()?;
        if !self.mobility_enabled {
            error!(
                session = self.session_id,
                "attempt to update network when mobility is disabled"
            );
            self.deps.callback.on_underlying_network_died(&self.network);
            return Ok(());
        }

        debug!(
            session = self.session_id,
            %network,
            ?ip_version,
            ?encap_type,
            ?keepalive_delay,
            "network set by user"
        );
        let (link, caps) = self.network_info(&network)?;

        self.ip_version = ip_version;
        self.encap_type = encap_type;

        // Auto follows the transport of the network being moved to, not the one being left
        let delay = match keepalive_delay {
            KeepaliveDelay::Auto => {
                keepalive_delay_secs(&self.params, &caps, &*self.deps.device_config)
            }
            KeepaliveDelay::Seconds(secs) => secs,
        };
        if self.keepalive.set_delay(delay) {
            self.restart_keepalive_if_running()?;
        }

        if let Some((_, monitor)) = &self.monitor {
            monitor.set_network(network.clone(), link.clone(), caps.clone());
        }
        self.handle_underlying_network_updated(network, link, caps, false)
            .await;
        Ok(())
    }

    /// Set the network underpinning the current one, used as keepalive context
    pub fn on_underpinned_network_set_by_user(
        &mut self,
        network: Network,
    ) -> Result<(), ConnectionError> {
        self.underpinned_network = Some(network);
        self.restart_keepalive_if_running()
    }

    /// Record the result of NAT detection in IKE_SA_INIT
    ///
    /// When a NAT is found the session moves to the IPv4 encapsulation socket, taking `local_spi`
    /// with it. NAT traversal over IPv6 is not supported.
    pub fn handle_nat_detection_result_in_ike_init(
        &mut self,
        nat_detected: bool,
        local_spi: u64,
    ) -> Result<(), ConnectionError> {
        if !self.on_nat_detection_result(nat_detected)? {
            return Ok(());
        }

        let socket = self.acquire_socket(true, true)?;
        self.update_keepalive_or_release(&socket)?;
        self.switch_to_socket(socket, &[local_spi]);
        Ok(())
    }

    /// Record the result of NAT detection in a MOBIKE exchange
    ///
    /// Like [`Self::handle_nat_detection_result_in_ike_init`] but every registered SA follows the
    /// switch.
    pub fn handle_nat_detection_result_in_mobike(
        &mut self,
        nat_detected: bool,
    ) -> Result<(), ConnectionError> {
        if !self.on_nat_detection_result(nat_detected)? {
            return Ok(());
        }
        self.get_and_switch_socket(true, true)
    }

    /// Returns whether the caller must switch to the encapsulation socket
    fn on_nat_detection_result(&mut self, nat_detected: bool) -> Result<bool, ConnectionError> {
        self.socket()?;
        if !nat_detected {
            self.set_nat_status(NatStatus::NotDetected);
            return Ok(false);
        }

        self.set_nat_status(NatStatus::Detected);
        if self.require_remote()?.is_ipv6() {
            return Err(ConnectionError::UnsupportedIpv6NatTraversal);
        }
        debug!(
            session = self.session_id,
            "switching to send to remote port 4500 if it's not already"
        );
        Ok(true)
    }

    /// Record that the server does not support NAT traversal
    pub fn mark_server_natt_unsupported(&mut self) {
        self.set_nat_status(NatStatus::Unsupported);
    }

    fn set_nat_status(&mut self, status: NatStatus) {
        if self.nat_status != status {
            debug!(
                session = self.session_id,
                from = %self.nat_status,
                to = %status,
                "NAT status changed"
            );
        }
        self.nat_status = status;
    }

    /// Apply an event posted by this controller's [`MobilityMonitor`]
    ///
    /// Events of a replaced monitor, or arriving outside the active state, are dropped.
    pub async fn process_mobility_event(&mut self, generation: u64, event: MobilityEvent) {
        if self.lifecycle != Lifecycle::Active || generation != self.generation {
            trace!(
                session = self.session_id,
                generation,
                current = self.generation,
                lifecycle = ?self.lifecycle,
                "dropping stale mobility event"
            );
            return;
        }

        match event {
            MobilityEvent::NetworkUpdated {
                network,
                link_properties,
                capabilities,
            } => {
                self.handle_underlying_network_updated(
                    network,
                    link_properties,
                    capabilities,
                    true,
                )
                .await
            }
            // No consumer needs a reaction beyond remembering them
            MobilityEvent::CapabilitiesUpdated(capabilities) => {
                self.capabilities = Some(capabilities);
            }
            MobilityEvent::NetworkDied => {
                self.deps.callback.on_underlying_network_died(&self.network);
            }
        }
    }

    /// Hand an inbound IKE message to the state machine
    pub fn process_inbound_packet(&self, packet: InboundPacket) {
        if self.lifecycle != Lifecycle::Active {
            trace!(spi = packet.local_spi, "dropping IKE message, controller not active");
            return;
        }
        self.deps
            .callback
            .on_ike_packet_received(packet.header, packet.data);
    }

    async fn handle_underlying_network_updated(
        &mut self,
        network: Network,
        link: LinkProperties,
        caps: NetworkCapabilities,
        skip_if_unchanged: bool,
    ) {
        if !self.mobility_enabled {
            debug!(session = self.session_id, "unable to handle network update, mobility disabled");
            self.deps.callback.on_underlying_network_died(&self.network);
            return;
        }

        match self
            .migrate_to_network(network, link, caps, skip_if_unchanged)
            .await
        {
            Ok(false) => {}
            Ok(true) => {
                if let (Some((_, monitor)), Some(local)) = (&self.monitor, self.local_address) {
                    monitor.set_address(local);
                }
                info!(
                    session = self.session_id,
                    network = %self.network,
                    local = %display_or_none(&self.local_address),
                    remote = %display_or_none(&self.remote_address),
                    "underlying network updated"
                );
                self.deps.callback.on_underlying_network_updated();
            }
            Err(e) => {
                warn!(session = self.session_id, error = %e, "network update failed");
                self.deps.callback.on_error(e);
            }
        }
    }

    /// Returns false if nothing changed and the update was skipped
    async fn migrate_to_network(
        &mut self,
        network: Network,
        link: LinkProperties,
        caps: NetworkCapabilities,
        skip_if_unchanged: bool,
    ) -> Result<bool, ConnectionError> {
        let old_network = mem::replace(&mut self.network, network);
        let old_local = self.local_address;
        let old_remote = self.remote_address;
        self.capabilities = Some(caps.clone());

        if IpVersionSet::of_link(&link).is_empty() {
            return Err(ConnectionError::NoLocalAddress {
                network: self.network.clone(),
            });
        }

        let purged = self.remote_addresses.purge_nat64();
        if purged > 0 {
            debug!(session = self.session_id, purged, "dropped NAT64 server addresses");
        }

        if self.is_dns_lookup_required(&old_network, &link) {
            self.remote_addresses = self
                .resolver
                .resolve(
                    &*self.deps.connectivity,
                    &self.network,
                    self.params.server_hostname(),
                    &link,
                )
                .await?;
        }

        let server_port = if self.nat_status.is_natt_supported() {
            SERVER_PORT_UDP_ENCAPSULATED
        } else {
            SERVER_PORT_NON_UDP_ENCAPSULATED
        };
        let (local, remote) = self.select_addresses(&link, &caps, server_port)?;
        self.local_address = Some(local);
        self.remote_address = Some(remote);

        if skip_if_unchanged
            && self.network == old_network
            && old_local == Some(local)
            && old_remote == Some(remote)
        {
            debug!(
                session = self.session_id,
                "none of network, local or remote address changed, nothing to do"
            );
            return Ok(false);
        }

        // Only a network change moves the session to another socket
        if self.network != old_network {
            let use_encap_port = self.force_port_4500 || self.nat_status.is_natt_supported();
            self.get_and_switch_socket(local.is_ipv4(), use_encap_port)?;
        }

        for (spi, record) in &self.sa_records {
            record
                .migrate(local, remote)
                .map_err(|source| ConnectionError::SaMigration { spi: *spi, source })?;
        }
        Ok(true)
    }

    /// Whether a mobility update needs a fresh DNS resolution
    fn is_dns_lookup_required(&self, old_network: &Network, link: &LinkProperties) -> bool {
        let local = IpVersionSet::of_link(link);
        let cached = self.remote_addresses.ip_versions();
        debug!(
            session = self.session_id,
            %local,
            %cached,
            "checking whether DNS lookup is required"
        );

        if local.is_empty() {
            error!(session = self.session_id, "no local address on the network");
            return true;
        }
        if self.params.options().force_dns_resolution {
            return true;
        }
        if self.network == *old_network && local == cached {
            return false;
        }
        if self
            .deps
            .device_config
            .get_bool(CONFIG_USE_CACHED_ADDRS, false)
            && cached.contains_all(&local)
        {
            return false;
        }
        true
    }

    fn select_addresses(
        &mut self,
        link: &LinkProperties,
        caps: &NetworkCapabilities,
        remote_port: u16,
    ) -> Result<(IpAddr, IpAddr), ConnectionError> {
        self.ip_version = adjust_ip_version(self.ip_version, self.encap_type);
        self.selector.select(
            &self.remote_addresses,
            link,
            self.ip_version,
            caps,
            &self.network,
            remote_port,
            &*self.deps.local_address_generator,
        )
    }

    fn network_info(
        &self,
        network: &Network,
    ) -> Result<(LinkProperties, NetworkCapabilities), ConnectionError> {
        let link = self.deps.connectivity.link_properties(network);
        let caps = self.deps.connectivity.network_capabilities(network);
        match (link, caps) {
            (Some(link), Some(caps)) => Ok((link, caps)),
            _ => Err(ConnectionError::MissingNetworkInfo {
                network: network.clone(),
            }),
        }
    }

    fn acquire_socket(
        &self,
        is_ipv4: bool,
        use_encap_port: bool,
    ) -> Result<Arc<dyn IkeSocket>, ConnectionError> {
        let request = SocketRequest {
            network: self.network.clone(),
            kind: SocketKind::select(is_ipv4, use_encap_port),
            dscp: self.dscp,
        };
        self.deps
            .sockets
            .acquire(request, self.owner)
            .map_err(ConnectionError::SocketUnavailable)
    }

    fn get_and_switch_socket(
        &mut self,
        is_ipv4: bool,
        use_encap_port: bool,
    ) -> Result<(), ConnectionError> {
        let socket = self.acquire_socket(is_ipv4, use_encap_port)?;
        self.update_keepalive_or_release(&socket)?;
        let spis: Vec<u64> = self.sa_records.keys().copied().collect();
        self.switch_to_socket(socket, &spis);
        Ok(())
    }

    /// Register `spis` on `new` before unregistering them from the old socket, then release it
    fn switch_to_socket(&mut self, new: Arc<dyn IkeSocket>, spis: &[u64]) {
        let old = match self.socket.take() {
            Some(old) if same_socket(&old, &new) => {
                self.socket = Some(old);
                return;
            }
            Some(old) => old,
            None => {
                self.socket = Some(new);
                return;
            }
        };

        for spi in spis {
            new.register_ike(*spi, self.packet_sink.clone());
            old.unregister_ike(*spi);
        }
        old.release_reference(self.owner);
        debug!(
            session = self.session_id,
            from = %old.kind(),
            to = %new.kind(),
            network = %new.network(),
            "switched IKE socket"
        );
        self.socket = Some(new);
    }

    fn update_keepalive(&mut self, socket: &Arc<dyn IkeSocket>) -> Result<(), ConnectionError> {
        let (Some(local), Some(remote)) = (self.local_address, self.remote_address) else {
            self.keepalive.stop();
            return Ok(());
        };
        self.keepalive
            .update(
                socket,
                local,
                remote,
                &self.network,
                self.underpinned_network.as_ref(),
            )
            .map_err(ConnectionError::Keepalive)
    }

    fn update_keepalive_or_release(
        &mut self,
        socket: &Arc<dyn IkeSocket>,
    ) -> Result<(), ConnectionError> {
        let result = self.update_keepalive(socket);
        if result.is_err() {
            let current = self.socket.as_ref().is_some_and(|s| same_socket(s, socket));
            if !current {
                socket.release_reference(self.owner);
            }
        }
        result
    }

    fn restart_keepalive_if_running(&mut self) -> Result<(), ConnectionError> {
        match self.socket.clone() {
            Some(socket) => self.update_keepalive(&socket),
            None => Ok(()),
        }
    }

    fn socket(&self) -> Result<&Arc<dyn IkeSocket>, ConnectionError> {
        self.socket.as_ref().ok_or(ConnectionError::NotActive)
    }

    fn require_remote(&self) -> Result<IpAddr, ConnectionError> {
        self.remote_address.ok_or(ConnectionError::NotActive)
    }

    /// Session identifier
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Local address of the session
    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    /// Server address of the session
    pub fn remote_address(&self) -> Option<IpAddr> {
        self.remote_address
    }

    /// Every resolved IPv4 server address
    pub fn all_remote_ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        self.remote_addresses.ipv4().to_vec()
    }

    /// Every resolved IPv6 server address, NAT64-derived ones last
    pub fn all_remote_ipv6_addresses(&self) -> Vec<Ipv6Addr> {
        self.remote_addresses
            .ipv6()
            .iter()
            .map(|c| c.address)
            .collect()
    }

    /// Local port of the current socket
    pub fn local_port(&self) -> Option<u16> {
        self.socket.as_ref().map(|s| s.local_port())
    }

    /// Server port of the current socket
    pub fn remote_port(&self) -> Option<u16> {
        self.socket.as_ref().map(|s| s.server_port())
    }

    /// Kind of the current socket
    pub fn socket_kind(&self) -> Option<SocketKind> {
        self.socket.as_ref().map(|s| s.kind())
    }

    /// Whether the session runs on the IPv4 UDP-encapsulation socket
    pub fn use_udp_encap_socket(&self) -> bool {
        self.socket_kind().is_some_and(SocketKind::is_udp_encap)
    }

    /// NAT status
    pub fn nat_status(&self) -> NatStatus {
        self.nat_status
    }

    /// Network the session runs on
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Underpinned network, if set
    pub fn underpinned_network(&self) -> Option<&Network> {
        self.underpinned_network.as_ref()
    }

    /// Whether mobility is enabled
    pub fn is_mobility_enabled(&self) -> bool {
        self.mobility_enabled
    }

    /// DSCP applied to the session's sockets
    pub fn dscp(&self) -> u8 {
        self.dscp
    }

    /// Current ESP IP version, after adjustment for the encapsulation type
    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    /// Current ESP encapsulation type
    pub fn encap_type(&self) -> EncapType {
        self.encap_type
    }

    /// Current keepalive delay in seconds
    pub fn keepalive_delay_secs(&self) -> u64 {
        self.keepalive.delay().as_secs()
    }

    /// Whether a NAT-T keepalive is running
    pub fn is_keepalive_running(&self) -> bool {
        self.keepalive.is_running()
    }

    /// Local SPIs of the registered IKE SAs
    pub fn sa_spis(&self) -> Vec<u64> {
        let mut spis: Vec<u64> = self.sa_records.keys().copied().collect();
        spis.sort_unstable();
        spis
    }

    /// Addressing of the session, once it has been set up
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        Some(ConnectionInfo {
            local_address: self.local_address?,
            remote_address: self.remote_address?,
            network: self.network.clone(),
        })
    }

    /// Network classification for metrics
    pub fn underlying_network_type(&self) -> UnderlyingNetworkType {
        self.capabilities
            .as_ref()
            .map_or(UnderlyingNetworkType::Unspecified, UnderlyingNetworkType::from)
    }

    /// Dump the controller's state
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            session_id: self.session_id,
            lifecycle: self.lifecycle,
            network: self.network.clone(),
            underpinned_network: self.underpinned_network.clone(),
            nat_status: self.nat_status,
            local_address: self.local_address,
            remote_address: self.remote_address,
            local_port: self.local_port(),
            remote_port: self.remote_port(),
            socket_kind: self.socket_kind(),
            mobility_enabled: self.mobility_enabled,
            ip_version: self.ip_version,
            encap_type: self.encap_type,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_nat_status_for_test(&mut self, status: NatStatus) {
        self.nat_status = status;
    }

    #[cfg(test)]
    pub(crate) fn remote_pool_mut(&mut self) -> &mut RemoteAddressPool {
        &mut self.remote_addresses
    }
}

impl fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionController")
            .field("session_id", &self.session_id)
            .field("lifecycle", &self.lifecycle)
            .field("network", &self.network)
            .field("local_address", &self.local_address)
            .field("remote_address", &self.remote_address)
            .field("nat_status", &self.nat_status)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        self.unregister_resources();
    }
}

fn same_socket(a: &Arc<dyn IkeSocket>, b: &Arc<dyn IkeSocket>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}
