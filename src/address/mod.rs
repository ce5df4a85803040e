// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Remote address resolution and local/remote address selection
//!
//! The server hostname is resolved on the active network into a [`RemoteAddressPool`]. The
//! [`AddressSelector`] then picks one remote address according to the session's IP version
//! preference, and a [`LocalAddressGenerator`] derives the source address the kernel would use to
//! reach it.

mod local;
mod pool;
mod resolver;
mod selector;

pub use local::{LocalAddressGenerator, UdpProbeAddressGenerator};
pub use pool::{IpVersionSet, Ipv6Candidate, RemoteAddressPool};
pub use resolver::{AddressResolver, MAX_DNS_RESOLUTION_ATTEMPTS};
pub use selector::{adjust_ip_version, AddressSelector};
