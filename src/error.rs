// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::network::Network;

/// Errors raised by the connection controller
///
/// During [`setup`](crate::ConnectionController::setup) every variant is returned synchronously.
/// Failures found while handling a network change are delivered through
/// [`ConnectionCallback::on_error`](crate::ConnectionCallback::on_error) instead, and the session
/// is expected to terminate.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No network was pinned by the caller and the system has no default network
    #[error("no active default network found")]
    NoActiveNetwork,

    /// The OS returned no link properties or no capabilities for a network
    #[error("network {network} has no link properties or no capabilities")]
    MissingNetworkInfo {
        /// Network that was queried
        network: Network,
    },

    /// Every DNS attempt for the server hostname failed or returned nothing
    #[error("DNS resolution for {hostname} failed after {attempts} attempts")]
    DnsResolutionFailed {
        /// Hostname that was looked up
        hostname: String,
        /// Number of attempts made
        attempts: usize,
    },

    /// No local/remote address pair satisfies the IP version constraints
    #[error("no usable address: {0}")]
    NoUsableAddress(String),

    /// The network has neither a local IPv4 address nor a global IPv6 address
    #[error("no local address on network {network}")]
    NoLocalAddress {
        /// Network without addresses
        network: Network,
    },

    /// The local address for a remote endpoint could not be determined
    #[error("failed to determine local address")]
    LocalAddressUnavailable(#[source] io::Error),

    /// A UDP socket could not be created or bound to the network
    #[error("socket unavailable")]
    SocketUnavailable(#[source] io::Error),

    /// A NAT was detected on an IPv6 path, which this implementation cannot traverse
    #[error("IPv6 NAT-T not supported")]
    UnsupportedIpv6NatTraversal,

    /// The NAT-T keepalive could not be (re)started
    #[error("NAT-T keepalive failed")]
    Keepalive(#[source] io::Error),

    /// An IKE SA refused to move to the new address pair
    #[error("failed to migrate IKE SA {spi:#018x}")]
    SaMigration {
        /// Local SPI of the SA
        spi: u64,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// The network monitor refused the observer registration
    #[error("failed to register network observer: {0}")]
    MobilityRegistration(String),

    /// A parameter passed to the controller is out of range
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The operation needs a controller that has been set up and not torn down
    #[error("connection controller is not active")]
    NotActive,

    /// The controller's task is gone, so an event could not be marshalled onto it
    #[error("connection controller task stopped")]
    ControllerStopped,
}
