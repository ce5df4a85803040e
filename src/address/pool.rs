// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::network::{IpPrefix, LinkProperties};

/// An IPv6 server address and whether it was synthesized by NAT64
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ipv6Candidate {
    /// The address
    pub address: Ipv6Addr,
    /// Whether the address lies inside the network's NAT64 prefix
    pub is_nat64: bool,
}

impl fmt::Display for Ipv6Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nat64 {
            write!(f, "{}(nat64)", self.address)
        } else {
            write!(f, "{}", self.address)
        }
    }
}

/// Set of IP versions, either reachable locally or present among cached server addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpVersionSet {
    /// IPv4 is in the set
    pub v4: bool,
    /// IPv6 is in the set
    pub v6: bool,
}

impl IpVersionSet {
    /// Versions a link can originate: any IPv4 address, or a global IPv6 address
    pub fn of_link(link: &LinkProperties) -> Self {
        Self {
            v4: link.has_ipv4_address(),
            v6: link.has_global_ipv6_address(),
        }
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        !self.v4 && !self.v6
    }

    /// Whether every version in `other` is also in `self`
    pub fn contains_all(&self, other: &Self) -> bool {
        (self.v4 || !other.v4) && (self.v6 || !other.v6)
    }
}

impl fmt::Display for IpVersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.v4, self.v6) {
            (true, true) => f.write_str("{v4, v6}"),
            (true, false) => f.write_str("{v4}"),
            (false, true) => f.write_str("{v6}"),
            (false, false) => f.write_str("{}"),
        }
    }
}

/// Server addresses obtained from DNS, split by family
///
/// Neither list contains duplicates. Addresses keep resolution order, except that NAT64-derived
/// IPv6 addresses always follow every native IPv6 address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteAddressPool {
    v4: Vec<Ipv4Addr>,
    v6: Vec<Ipv6Candidate>,
}

impl RemoteAddressPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from resolver output, tagging IPv6 addresses inside `nat64_prefix`
    pub fn from_resolved(
        addresses: impl IntoIterator<Item = IpAddr>,
        nat64_prefix: Option<&IpPrefix>,
    ) -> Self {
        let mut pool = Self::new();
        for address in addresses {
            match address {
                IpAddr::V4(v4) => pool.add_ipv4(v4),
                IpAddr::V6(v6) => {
                    let is_nat64 = nat64_prefix.is_some_and(|prefix| prefix.contains(&v6));
                    pool.add_ipv6(v6, is_nat64);
                }
            }
        }
        pool
    }

    /// Add a native address of either family
    pub fn add(&mut self, address: IpAddr) {
        match address {
            IpAddr::V4(v4) => self.add_ipv4(v4),
            IpAddr::V6(v6) => self.add_ipv6(v6, false),
        }
    }

    /// Add an IPv4 address unless already present
    pub fn add_ipv4(&mut self, address: Ipv4Addr) {
        if !self.v4.contains(&address) {
            self.v4.push(address);
        }
    }

    /// Add an IPv6 address unless already present
    pub fn add_ipv6(&mut self, address: Ipv6Addr, is_nat64: bool) {
        if self.v6.iter().any(|c| c.address == address) {
            return;
        }
        let candidate = Ipv6Candidate { address, is_nat64 };
        if is_nat64 {
            self.v6.push(candidate);
        } else {
            let at = self
                .v6
                .iter()
                .position(|c| c.is_nat64)
                .unwrap_or(self.v6.len());
            self.v6.insert(at, candidate);
        }
    }

    /// Drop every NAT64-derived address, returning how many were removed
    pub fn purge_nat64(&mut self) -> usize {
        let before = self.v6.len();
        self.v6.retain(|c| !c.is_nat64);
        before - self.v6.len()
    }

    /// IPv4 candidates in preference order
    pub fn ipv4(&self) -> &[Ipv4Addr] {
        &self.v4
    }

    /// IPv6 candidates in preference order
    pub fn ipv6(&self) -> &[Ipv6Candidate] {
        &self.v6
    }

    /// Families present in the pool
    pub fn ip_versions(&self) -> IpVersionSet {
        IpVersionSet {
            v4: !self.v4.is_empty(),
            v6: !self.v6.is_empty(),
        }
    }

    /// Whether the pool holds no address
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Remove every address
    pub fn clear(&mut self) {
        self.v4.clear();
        self.v6.clear();
    }
}

impl fmt::Display for RemoteAddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v4=[")?;
        for (i, a) in self.v4.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{a}")?;
        }
        write!(f, "] v6=[")?;
        for (i, c) in self.v6.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{c}")?;
        }
        f.write_str("]")
    }
}
