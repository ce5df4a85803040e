// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Network-layer connection controller for IKE/IPsec sessions
//!
//! An IKE session needs someone to own everything below the protocol: which network it runs
//! on, which local and remote addresses it uses, which UDP socket carries its packets, whether a
//! NAT sits in the path, and what to do when the device moves between networks. This crate
//! provides that component, the [`ConnectionController`].
//!
//! The crate is organized into the following modules:
//! - `address`: DNS resolution with bounded retry, remote address pool and address selection
//! - `socket`: reference-counted UDP sockets shared between sessions, demultiplexed by SPI
//! - `keepalive`: NAT-T keepalive interval computation and the periodic sender
//! - `mobility`: observer of OS network changes, marshalled onto the controller's task
//! - `controller`: the orchestration core
//! - `driver`: the owner task that serialises every mutation of a controller
//!
//! # Threading model
//!
//! A controller is mutated from exactly one task. Calls from the IKE state machine go through a
//! [`ControllerHandle`]; callbacks from the OS network layer and inbound datagrams are posted onto
//! the same task's queues. Nothing in [`ConnectionController`] is ever touched concurrently.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ike_connection::*;
//! # async fn run(deps: Dependencies) -> Result<(), Box<dyn std::error::Error>> {
//! let params = SessionParams::builder("vpn.example.com")
//!     .ip_version(IpVersion::Auto)
//!     .build()?;
//! let (handle, _task) = driver::spawn(ControllerConfig::new(1, params), deps)?;
//! handle.setup().await?;
//! handle.send_ike_packet(bytes::Bytes::from_static(b"...")).await?;
//! handle.tear_down().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

pub mod address;
pub mod config;
pub mod controller;
pub mod device_config;
pub mod driver;
mod error;
pub mod keepalive;
pub mod mobility;
pub mod network;
pub mod packet;
pub mod socket;

pub use crate::address::{
    AddressResolver, AddressSelector, IpVersionSet, Ipv6Candidate, LocalAddressGenerator,
    RemoteAddressPool, UdpProbeAddressGenerator,
};
pub use crate::config::{
    ConfigError, EncapType, IkeOptions, IpVersion, KeepaliveDelay, SessionParams,
    SessionParamsBuilder,
};
pub use crate::controller::{
    ConnectionCallback, ConnectionController, ConnectionInfo, ConnectionSnapshot,
    ControllerConfig, Dependencies, Lifecycle, NatStatus, SaRecord,
};
pub use crate::device_config::{DeviceConfig, StaticDeviceConfig};
pub use crate::driver::ControllerHandle;
pub use crate::error::ConnectionError;
pub use crate::keepalive::{KeepaliveConfig, KeepaliveScheduler, NattKeepalive};
pub use crate::mobility::{
    MobilityEvent, MobilityMonitor, MobilityQueue, MonitorError, NetworkEvent, NetworkMonitor,
    NetworkObserver, ObserverId, ObserverScope,
};
pub use crate::network::{
    Connectivity, IpPrefix, LinkProperties, Network, NetworkCapabilities, TransportType,
    UnderlyingNetworkType,
};
pub use crate::packet::IkeHeader;
pub use crate::socket::{
    InboundPacket, IkeSocket, OwnerId, PacketSink, SocketKind, SocketProvider, SocketRequest,
    UdpSocketProvider,
};

/// IKE server port used when packets are not UDP-encapsulated
pub const SERVER_PORT_NON_UDP_ENCAPSULATED: u16 = 500;

/// IKE server port used for NAT-T (UDP-encapsulated) traffic
pub const SERVER_PORT_UDP_ENCAPSULATED: u16 = 4500;

#[cfg(test)]
mod testing;
