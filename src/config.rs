// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Session parameters consumed by the connection controller
//!
//! [`SessionParams`] carries the subset of IKE session configuration that affects the network
//! layer. It is built through [`SessionParams::builder`], which validates ranges, and can be
//! loaded from any serde format.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::Network;

/// Smallest NAT-T keepalive delay a session may request, in seconds
pub const NATT_KEEPALIVE_DELAY_SEC_MIN: u32 = 10;

/// Largest NAT-T keepalive delay a session may request, in seconds
pub const NATT_KEEPALIVE_DELAY_SEC_MAX: u32 = 3600;

/// Default NAT-T keepalive delay, in seconds
pub const NATT_KEEPALIVE_DELAY_SEC_DEFAULT: u32 = 20;

/// Largest valid DSCP value (6 bits)
pub const DSCP_MAX: u8 = 63;

/// IP version used for ESP traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IpVersion {
    /// Let the controller pick
    #[default]
    Auto,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
}

/// Encapsulation used for ESP traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncapType {
    /// Let the controller pick
    #[default]
    Auto,
    /// Plain ESP, no UDP encapsulation
    None,
    /// ESP-in-UDP on port 4500
    Udp,
}

/// Keepalive interval requested when the user moves the session to another network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepaliveDelay {
    /// Derive the interval from the network transport
    Auto,
    /// Use this many seconds
    Seconds(u32),
}

impl KeepaliveDelay {
    /// Reject an explicit delay outside the range a session may be configured with
    pub fn validate(self) -> Result<(), ConfigError> {
        let range = NATT_KEEPALIVE_DELAY_SEC_MIN..=NATT_KEEPALIVE_DELAY_SEC_MAX;
        match self {
            Self::Seconds(secs) if !range.contains(&secs) => {
                Err(ConfigError::KeepaliveDelayOutOfRange(secs))
            }
            _ => Ok(()),
        }
    }
}

/// IKE session options that influence the network layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IkeOptions {
    /// Always talk to the server on port 4500, even before NAT detection
    pub force_port_4500: bool,
    /// Prefer IPv4 over Wi-Fi when the IP version is automatic
    pub automatic_address_family_selection: bool,
    /// Derive the keepalive interval from the network transport
    pub automatic_natt_keepalives: bool,
    /// Resolve the server hostname again on every mobility update
    pub force_dns_resolution: bool,
}

/// Errors raised while validating [`SessionParams`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The server hostname is empty
    #[error("server hostname must not be empty")]
    EmptyHostname,

    /// The keepalive delay is outside the allowed range
    #[error(
        "NAT-T keepalive delay {0}s outside [{min}, {max}]",
        min = NATT_KEEPALIVE_DELAY_SEC_MIN,
        max = NATT_KEEPALIVE_DELAY_SEC_MAX
    )]
    KeepaliveDelayOutOfRange(u32),

    /// The DSCP value does not fit in 6 bits
    #[error("invalid DSCP value {0}")]
    InvalidDscp(u8),
}

/// Network-layer parameters of an IKE session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    server_hostname: String,
    #[serde(default)]
    configured_network: Option<Network>,
    #[serde(default)]
    ip_version: IpVersion,
    #[serde(default)]
    encap_type: EncapType,
    #[serde(default)]
    dscp: u8,
    #[serde(default = "default_keepalive_delay")]
    natt_keepalive_delay_secs: u32,
    #[serde(default)]
    options: IkeOptions,
}

fn default_keepalive_delay() -> u32 {
    NATT_KEEPALIVE_DELAY_SEC_DEFAULT
}

impl SessionParams {
    /// Begin building parameters for a session with `server_hostname`
    pub fn builder(server_hostname: impl Into<String>) -> SessionParamsBuilder {
        SessionParamsBuilder {
            params: Self {
                server_hostname: server_hostname.into(),
                configured_network: None,
                ip_version: IpVersion::Auto,
                encap_type: EncapType::Auto,
                dscp: 0,
                natt_keepalive_delay_secs: NATT_KEEPALIVE_DELAY_SEC_DEFAULT,
                options: IkeOptions::default(),
            },
        }
    }

    /// Check ranges, useful after deserialisation
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_hostname.is_empty() {
            return Err(ConfigError::EmptyHostname);
        }
        if !(NATT_KEEPALIVE_DELAY_SEC_MIN..=NATT_KEEPALIVE_DELAY_SEC_MAX)
            .contains(&self.natt_keepalive_delay_secs)
        {
            return Err(ConfigError::KeepaliveDelayOutOfRange(
                self.natt_keepalive_delay_secs,
            ));
        }
        if self.dscp > DSCP_MAX {
            return Err(ConfigError::InvalidDscp(self.dscp));
        }
        Ok(())
    }

    /// Hostname (or literal address) of the IKE server
    pub fn server_hostname(&self) -> &str {
        &self.server_hostname
    }

    /// Network pinned by the caller, `None` to follow the system default
    pub fn configured_network(&self) -> Option<&Network> {
        self.configured_network.as_ref()
    }

    /// Requested ESP IP version
    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    /// Requested ESP encapsulation
    pub fn encap_type(&self) -> EncapType {
        self.encap_type
    }

    /// DSCP applied to IKE packets
    pub fn dscp(&self) -> u8 {
        self.dscp
    }

    /// Explicit NAT-T keepalive delay in seconds
    pub fn natt_keepalive_delay_secs(&self) -> u32 {
        self.natt_keepalive_delay_secs
    }

    /// Session options
    pub fn options(&self) -> &IkeOptions {
        &self.options
    }
}

/// Builder for [`SessionParams`]
#[derive(Debug, Clone)]
pub struct SessionParamsBuilder {
    params: SessionParams,
}

impl SessionParamsBuilder {
    /// Pin the session to `network` instead of following the default network
    pub fn network(mut self, network: Network) -> Self {
        self.params.configured_network = Some(network);
        self
    }

    /// Set the ESP IP version
    pub fn ip_version(mut self, version: IpVersion) -> Self {
        self.params.ip_version = version;
        self
    }

    /// Set the ESP encapsulation type
    pub fn encap_type(mut self, encap: EncapType) -> Self {
        self.params.encap_type = encap;
        self
    }

    /// Set the DSCP of IKE packets
    pub fn dscp(mut self, dscp: u8) -> Self {
        self.params.dscp = dscp;
        self
    }

    /// Set the explicit NAT-T keepalive delay
    pub fn natt_keepalive_delay_secs(mut self, secs: u32) -> Self {
        self.params.natt_keepalive_delay_secs = secs;
        self
    }

    /// Replace all options at once
    pub fn options(mut self, options: IkeOptions) -> Self {
        self.params.options = options;
        self
    }

    /// Validate and return the parameters
    pub fn build(self) -> Result<SessionParams, ConfigError> {
        self.params.validate()?;
        Ok(self.params)
    }
}
