// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Common test utilities and platform stand-ins

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Once};

use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use ike_connection::packet::IKE_HEADER_LEN;
use ike_connection::{
    ConnectionCallback, ConnectionError, Connectivity, IkeHeader, LinkProperties, MonitorError,
    Network, NetworkCapabilities, NetworkEvent, NetworkMonitor, NetworkObserver, ObserverId,
    ObserverScope,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

static INIT: Once = Once::new();

/// Install a tracing subscriber honouring `RUST_LOG`, once for all tests
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Encode a bare IKE header followed by `body`
pub fn ike_message(initiator_spi: u64, responder_spi: u64, flags: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(IKE_HEADER_LEN + body.len());
    out.put_u64(initiator_spi);
    out.put_u64(responder_spi);
    out.put_u8(46); // Encrypted and authenticated
    out.put_u8(0x20);
    out.put_u8(37); // INFORMATIONAL
    out.put_u8(flags);
    out.put_u32(1);
    out.put_u32((IKE_HEADER_LEN + body.len()) as u32);
    out.extend_from_slice(body);
    out
}

/// A single network with a fixed DNS answer
#[derive(Debug)]
pub struct StaticConnectivity {
    pub network: Network,
    pub link: LinkProperties,
    pub caps: NetworkCapabilities,
    pub answer: Vec<IpAddr>,
}

#[async_trait]
impl Connectivity for StaticConnectivity {
    fn active_network(&self) -> Option<Network> {
        Some(self.network.clone())
    }

    fn link_properties(&self, network: &Network) -> Option<LinkProperties> {
        (*network == self.network).then(|| self.link.clone())
    }

    fn network_capabilities(&self, network: &Network) -> Option<NetworkCapabilities> {
        (*network == self.network).then(|| self.caps.clone())
    }

    async fn resolve(&self, _network: &Network, _hostname: &str) -> io::Result<Vec<IpAddr>> {
        Ok(self.answer.clone())
    }
}

/// Monitor delivering events emitted by the test
#[derive(Default)]
pub struct TestMonitor {
    observers: Mutex<Vec<(ObserverId, Arc<dyn NetworkObserver>)>>,
    next_id: Mutex<u64>,
}

impl TestMonitor {
    pub fn emit(&self, event: NetworkEvent) {
        let observers: Vec<_> = self.observers.lock().iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            observer.on_network_event(event.clone());
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl NetworkMonitor for TestMonitor {
    fn register_observer(
        &self,
        _scope: ObserverScope,
        observer: Arc<dyn NetworkObserver>,
    ) -> Result<ObserverId, MonitorError> {
        let mut next_id = self.next_id.lock();
        *next_id += 1;
        let id = ObserverId(*next_id);
        self.observers.lock().push((id, observer));
        Ok(id)
    }

    fn unregister_observer(&self, id: ObserverId) {
        self.observers.lock().retain(|(i, _)| *i != id);
    }
}

/// What the controller reported to the state machine
#[derive(Debug)]
pub enum Notification {
    Updated,
    Died(Network),
    Packet(IkeHeader, Bytes),
    Error(String),
}

/// Callback forwarding every notification into a channel
#[derive(Debug)]
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelCallback {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ConnectionCallback for ChannelCallback {
    fn on_underlying_network_updated(&self) {
        let _ = self.tx.send(Notification::Updated);
    }

    fn on_underlying_network_died(&self, network: &Network) {
        let _ = self.tx.send(Notification::Died(network.clone()));
    }

    fn on_ike_packet_received(&self, header: IkeHeader, packet: Bytes) {
        let _ = self.tx.send(Notification::Packet(header, packet));
    }

    fn on_error(&self, error: ConnectionError) {
        let _ = self.tx.send(Notification::Error(error.to_string()));
    }
}
