// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Boundary types of the OS network layer
//!
//! The controller never enumerates networks itself. It receives opaque [`Network`] handles and
//! immutable snapshots ([`LinkProperties`], [`NetworkCapabilities`]) from a [`Connectivity`]
//! implementation supplied by the platform.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv6Addr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Handle identifying one of the device's network attachments
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Network {
    /// Platform network identifier
    pub id: u64,
    /// Interface sockets are bound to, if the platform binds by device name
    pub interface: Option<String>,
}

impl Network {
    /// Create a handle that is not tied to a specific interface
    pub fn new(id: u64) -> Self {
        Self {
            id,
            interface: None,
        }
    }

    /// Create a handle whose sockets are bound to `interface`
    pub fn with_interface(id: u64, interface: impl Into<String>) -> Self {
        Self {
            id,
            interface: Some(interface.into()),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interface {
            Some(iface) => write!(f, "{}({iface})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// An IPv6 prefix, as advertised for NAT64
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPrefix {
    address: Ipv6Addr,
    len: u8,
}

impl IpPrefix {
    /// Create a prefix; `len` is clamped to 128
    pub fn new(address: Ipv6Addr, len: u8) -> Self {
        let len = len.min(128);
        let masked = u128::from(address) & Self::mask(len);
        Self {
            address: Ipv6Addr::from(masked),
            len,
        }
    }

    /// Network address of the prefix
    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    /// Prefix length in bits
    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// Whether `addr` lies inside this prefix
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        u128::from(*addr) & Self::mask(self.len) == u128::from(self.address)
    }

    fn mask(len: u8) -> u128 {
        match len {
            0 => 0,
            n => u128::MAX << (128 - u32::from(n)),
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.len)
    }
}

/// Snapshot of the addresses configured on a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkProperties {
    /// Every address assigned to the link
    pub addresses: Vec<IpAddr>,
    /// NAT64 prefix advertised on the link, if any
    pub nat64_prefix: Option<IpPrefix>,
}

impl LinkProperties {
    /// Link properties carrying `addresses` and no NAT64 prefix
    pub fn new(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
            nat64_prefix: None,
        }
    }

    /// Attach a NAT64 prefix
    pub fn with_nat64_prefix(mut self, prefix: IpPrefix) -> Self {
        self.nat64_prefix = Some(prefix);
        self
    }

    /// Whether any IPv4 address is assigned
    pub fn has_ipv4_address(&self) -> bool {
        self.addresses.iter().any(IpAddr::is_ipv4)
    }

    /// Whether a globally routable IPv6 address is assigned
    pub fn has_global_ipv6_address(&self) -> bool {
        self.addresses.iter().any(|addr| match addr {
            IpAddr::V6(v6) => is_global_ipv6(v6),
            IpAddr::V4(_) => false,
        })
    }

    /// Whether `addr` is one of the link's addresses
    pub fn contains_address(&self, addr: &IpAddr) -> bool {
        self.addresses.contains(addr)
    }
}

pub(crate) fn is_global_ipv6(addr: &Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_multicast()
        // link-local fe80::/10
        || first & 0xffc0 == 0xfe80
        // unique local fc00::/7
        || first & 0xfe00 == 0xfc00)
}

/// Physical transport of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// Wi-Fi
    Wifi,
    /// Cellular data
    Cellular,
    /// Wired Ethernet
    Ethernet,
    /// Bluetooth tethering
    Bluetooth,
    /// A VPN running on top of another network
    Vpn,
}

/// Snapshot of the transports a network runs over
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCapabilities {
    /// Transports of the network, a network may have several
    pub transports: Vec<TransportType>,
}

impl NetworkCapabilities {
    /// Capabilities with the given transports
    pub fn new(transports: impl IntoIterator<Item = TransportType>) -> Self {
        Self {
            transports: transports.into_iter().collect(),
        }
    }

    /// Whether the network runs over `transport`
    pub fn has_transport(&self, transport: TransportType) -> bool {
        self.transports.contains(&transport)
    }
}

/// Coarse network classification reported to metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnderlyingNetworkType {
    /// Wi-Fi, also used when a network is both Wi-Fi and cellular
    Wifi,
    /// Cellular
    Cellular,
    /// Anything else
    Unspecified,
}

impl From<&NetworkCapabilities> for UnderlyingNetworkType {
    fn from(caps: &NetworkCapabilities) -> Self {
        if caps.has_transport(TransportType::Wifi) {
            Self::Wifi
        } else if caps.has_transport(TransportType::Cellular) {
            Self::Cellular
        } else {
            Self::Unspecified
        }
    }
}

/// Network enumeration and lookup provided by the platform
#[async_trait]
pub trait Connectivity: Send + Sync + 'static {
    /// The current system default network
    fn active_network(&self) -> Option<Network>;

    /// Link properties of `network`, `None` if the network is unknown or gone
    fn link_properties(&self, network: &Network) -> Option<LinkProperties>;

    /// Capabilities of `network`, `None` if the network is unknown or gone
    fn network_capabilities(&self, network: &Network) -> Option<NetworkCapabilities>;

    /// Resolve `hostname` using the DNS servers of `network`
    async fn resolve(&self, network: &Network, hostname: &str) -> io::Result<Vec<IpAddr>>;
}
