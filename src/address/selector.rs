// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

use std::net::IpAddr;

use tracing::info;

use super::local::LocalAddressGenerator;
use super::pool::RemoteAddressPool;
use crate::config::{EncapType, IpVersion};
use crate::error::ConnectionError;
use crate::network::{LinkProperties, Network, NetworkCapabilities, TransportType};

/// Resolve an automatic IP version against a fixed encapsulation type
///
/// `Auto` becomes `V6` for [`EncapType::None`] and `V4` for [`EncapType::Udp`]. Any other
/// combination is returned unchanged.
pub fn adjust_ip_version(version: IpVersion, encap: EncapType) -> IpVersion {
    let adjusted = match (version, encap) {
        (IpVersion::Auto, EncapType::None) => IpVersion::V6,
        (IpVersion::Auto, EncapType::Udp) => IpVersion::V4,
        (version, _) => version,
    };
    if adjusted != version {
        info!(from = ?version, to = ?adjusted, "IP version preference overridden");
    }
    adjusted
}

/// Picks the local/remote address pair for a session
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressSelector {
    automatic_family_selection: bool,
}

impl AddressSelector {
    /// `automatic_family_selection` lets Wi-Fi sessions prefer IPv4 when the version is `Auto`
    pub fn new(automatic_family_selection: bool) -> Self {
        Self {
            automatic_family_selection,
        }
    }

    /// Whether IPv4 should win over IPv6 for `version` on a network with `caps`
    pub fn prefers_ipv4(&self, version: IpVersion, caps: &NetworkCapabilities) -> bool {
        matches!(version, IpVersion::Auto | IpVersion::V4)
            && self.automatic_family_selection
            && caps.has_transport(TransportType::Wifi)
    }

    /// Choose the remote address
    ///
    /// `version` must already be adjusted with [`adjust_ip_version`]. A fixed version is honoured
    /// or fails; otherwise IPv4 is taken when preferred, then IPv6, then IPv4.
    pub fn select_remote(
        &self,
        pool: &RemoteAddressPool,
        link: &LinkProperties,
        version: IpVersion,
        caps: &NetworkCapabilities,
    ) -> Result<IpAddr, ConnectionError> {
        let v4 = pool
            .ipv4()
            .first()
            .filter(|_| link.has_ipv4_address())
            .map(|a| IpAddr::V4(*a));
        let v6 = pool
            .ipv6()
            .first()
            .filter(|_| link.has_global_ipv6_address())
            .map(|c| IpAddr::V6(c.address));

        match version {
            IpVersion::V4 => v4.ok_or_else(|| {
                ConnectionError::NoUsableAddress(
                    "IPv4 required but no IPv4 address available".into(),
                )
            }),
            IpVersion::V6 => v6.ok_or_else(|| {
                ConnectionError::NoUsableAddress(
                    "IPv6 required but no global IPv6 address available".into(),
                )
            }),
            IpVersion::Auto => {
                let preferred = if self.prefers_ipv4(version, caps) {
                    v4.or(v6)
                } else {
                    v6.or(v4)
                };
                preferred.ok_or_else(|| {
                    ConnectionError::NoUsableAddress(
                        "no valid IPv4 or IPv6 addresses for peer".into(),
                    )
                })
            }
        }
    }

    /// Choose the remote address and derive the matching local address
    ///
    /// Returns `(local, remote)`; both always belong to the same family.
    #[allow(clippy::too_many_arguments)]
    pub fn select(
        &self,
        pool: &RemoteAddressPool,
        link: &LinkProperties,
        version: IpVersion,
        caps: &NetworkCapabilities,
        network: &Network,
        remote_port: u16,
        generator: &dyn LocalAddressGenerator,
    ) -> Result<(IpAddr, IpAddr), ConnectionError> {
        let remote = self.select_remote(pool, link, version, caps)?;
        let local = generator
            .generate_local_address(network, remote, remote_port)
            .map_err(ConnectionError::LocalAddressUnavailable)?;
        if local.is_ipv4() != remote.is_ipv4() {
            return Err(ConnectionError::NoUsableAddress(format!(
                "local address {local} does not match the family of {remote}"
            )));
        }
        Ok((local, remote))
    }
}
