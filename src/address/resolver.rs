// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

use tracing::debug;

use super::pool::RemoteAddressPool;
use crate::error::ConnectionError;
use crate::network::{Connectivity, LinkProperties, Network};

/// Maximum number of lookups made for a single resolution
pub const MAX_DNS_RESOLUTION_ATTEMPTS: usize = 3;

/// Resolves the server hostname on a specific network
///
/// Failed or empty lookups are retried immediately, up to
/// [`MAX_DNS_RESOLUTION_ATTEMPTS`] in total. A resolution that exhausts its attempts is final;
/// callers do not retry it.
#[derive(Debug, Clone, Copy)]
pub struct AddressResolver {
    max_attempts: usize,
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self {
            max_attempts: MAX_DNS_RESOLUTION_ATTEMPTS,
        }
    }
}

impl AddressResolver {
    /// Resolver with the default attempt budget
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `hostname` on `network` into a fresh pool
    ///
    /// IPv6 results inside the link's NAT64 prefix are tagged as NAT64-derived.
    pub async fn resolve(
        &self,
        connectivity: &dyn Connectivity,
        network: &Network,
        hostname: &str,
        link: &LinkProperties,
    ) -> Result<RemoteAddressPool, ConnectionError> {
        for attempt in 1..=self.max_attempts {
            let will_retry = attempt < self.max_attempts;
            match connectivity.resolve(network, hostname).await {
                Ok(addresses) if !addresses.is_empty() => {
                    let pool =
                        RemoteAddressPool::from_resolved(addresses, link.nat64_prefix.as_ref());
                    debug!(%hostname, %network, %pool, attempt, "resolved server addresses");
                    return Ok(pool);
                }
                Ok(_) => {
                    debug!(%hostname, attempt, will_retry, "DNS lookup returned no address");
                }
                Err(e) => {
                    debug!(%hostname, attempt, will_retry, error = %e, "DNS lookup failed");
                }
            }
        }

        Err(ConnectionError::DnsResolutionFailed {
            hostname: hostname.to_owned(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::network::IpPrefix;
    use crate::testing::MockConnectivity;

    #[tokio::test]
    async fn retries_until_an_address_is_returned() {
        let connectivity = MockConnectivity::new();
        connectivity.push_dns_failure();
        connectivity.push_dns_answer(vec![]);
        connectivity.push_dns_answer(vec!["192.0.2.7".parse().unwrap()]);

        let pool = AddressResolver::new()
            .resolve(
                &connectivity,
                &Network::new(1),
                "vpn.example.com",
                &LinkProperties::default(),
            )
            .await
            .unwrap();
        assert_eq!(connectivity.dns_calls(), 3);
        assert_eq!(pool.ipv4().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let connectivity = MockConnectivity::new();
        for _ in 0..5 {
            connectivity.push_dns_failure();
        }

        let err = AddressResolver::new()
            .resolve(
                &connectivity,
                &Network::new(1),
                "vpn.example.com",
                &LinkProperties::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::DnsResolutionFailed { attempts: 3, .. }
        ));
        assert_eq!(connectivity.dns_calls(), 3);
    }

    #[tokio::test]
    async fn tags_addresses_inside_nat64_prefix() {
        let connectivity = MockConnectivity::new();
        let synthesized: IpAddr = "64:ff9b::c000:207".parse().unwrap();
        connectivity.push_dns_answer(vec![synthesized]);
        let link = LinkProperties::new(["2001:db8::2".parse().unwrap()])
            .with_nat64_prefix(IpPrefix::new("64:ff9b::".parse().unwrap(), 96));

        let pool = AddressResolver::new()
            .resolve(&connectivity, &Network::new(1), "vpn.example.com", &link)
            .await
            .unwrap();
        assert!(pool.ipv6()[0].is_nat64);
    }
}
