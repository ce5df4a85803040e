// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! NAT-T keepalives
//!
//! While a session runs over the IPv4 UDP-encapsulation socket, a single `0xFF` byte is sent to
//! the server's port 4500 at a fixed interval so that NAT bindings on the path stay open.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::{SessionParams, NATT_KEEPALIVE_DELAY_SEC_MAX, NATT_KEEPALIVE_DELAY_SEC_MIN};
use crate::device_config::{
    DeviceConfig, CONFIG_AUTO_NATT_KEEPALIVES_CELLULAR_TIMEOUT_OVERRIDE_SECONDS,
};
use crate::network::{Network, NetworkCapabilities, TransportType};
use crate::socket::IkeSocket;

/// Keepalive delay used on Wi-Fi with automatic keepalives
pub const AUTO_KEEPALIVE_DELAY_SEC_WIFI: u32 = 15;

/// Keepalive delay used on cellular with automatic keepalives, unless overridden by device config
pub const AUTO_KEEPALIVE_DELAY_SEC_CELL: u32 = 150;

/// Keepalive delay for a session on a network with `caps`
///
/// Without automatic keepalives this is the session's configured delay. With them, Wi-Fi caps the
/// delay at [`AUTO_KEEPALIVE_DELAY_SEC_WIFI`] and cellular at the device-configured cellular
/// timeout. Wi-Fi wins when a network reports both transports. The result never exceeds the
/// configured delay.
pub fn keepalive_delay_secs(
    params: &SessionParams,
    caps: &NetworkCapabilities,
    device_config: &dyn DeviceConfig,
) -> u32 {
    let configured = params.natt_keepalive_delay_secs();
    if !params.options().automatic_natt_keepalives {
        return configured;
    }

    if caps.has_transport(TransportType::Wifi) {
        configured.min(AUTO_KEEPALIVE_DELAY_SEC_WIFI)
    } else if caps.has_transport(TransportType::Cellular) {
        let cell = device_config.get_int(
            CONFIG_AUTO_NATT_KEEPALIVES_CELLULAR_TIMEOUT_OVERRIDE_SECONDS,
            i64::from(NATT_KEEPALIVE_DELAY_SEC_MIN),
            i64::from(NATT_KEEPALIVE_DELAY_SEC_MAX),
            i64::from(AUTO_KEEPALIVE_DELAY_SEC_CELL),
        );
        let cell = u32::try_from(cell).unwrap_or(AUTO_KEEPALIVE_DELAY_SEC_CELL);
        configured.min(cell)
    } else {
        configured
    }
}

/// Everything a running keepalive needs
#[derive(Clone)]
pub struct KeepaliveConfig {
    /// Local IPv4 address of the session
    pub local: Ipv4Addr,
    /// Server IPv4 address, keepalives go to its port 4500
    pub remote: Ipv4Addr,
    /// The UDP-encapsulation socket to send on
    pub socket: Arc<dyn IkeSocket>,
    /// Network the session runs on
    pub network: Network,
    /// Network underpinning `network`, if the caller set one
    pub underpinned_network: Option<Network>,
    /// Interval between keepalives
    pub delay: Duration,
    /// Identifier of the keepalive timer, unique per session
    pub alarm_tag: String,
}

impl fmt::Debug for KeepaliveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepaliveConfig")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("socket", &self.socket.kind())
            .field("network", &self.network)
            .field("underpinned_network", &self.underpinned_network)
            .field("delay", &self.delay)
            .field("alarm_tag", &self.alarm_tag)
            .finish()
    }
}

/// A periodic NAT-T keepalive sender
///
/// The first keepalive goes out one interval after start. The sender stops when dropped.
#[derive(Debug)]
pub struct NattKeepalive {
    config: KeepaliveConfig,
    task: Option<JoinHandle<()>>,
}

impl NattKeepalive {
    /// Start sending keepalives as described by `config`
    ///
    /// Fails if the socket does not UDP-encapsulate or the delay is zero.
    pub fn start(config: KeepaliveConfig) -> io::Result<Self> {
        let mut keepalive = Self { config, task: None };
        keepalive.restart(None)?;
        Ok(keepalive)
    }

    /// Restart the timer, switching to `config` if given
    pub fn restart(&mut self, config: Option<KeepaliveConfig>) -> io::Result<()> {
        let config = config.unwrap_or_else(|| self.config.clone());
        if !config.socket.kind().is_udp_encap() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("keepalives need a udp4-encap socket, got {}", config.socket.kind()),
            ));
        }
        if config.delay.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "keepalive delay must be positive",
            ));
        }

        self.stop();
        debug!(
            tag = %config.alarm_tag,
            local = %config.local,
            remote = %config.remote,
            network = %config.network,
            delay = ?config.delay,
            "starting NAT-T keepalive"
        );
        self.task = Some(tokio::spawn(run(config.clone())));
        self.config = config;
        Ok(())
    }

    /// Stop sending keepalives
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            trace!(tag = %self.config.alarm_tag, "stopped NAT-T keepalive");
        }
    }

    /// Whether the timer is running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Current configuration
    pub fn config(&self) -> &KeepaliveConfig {
        &self.config
    }
}

impl Drop for NattKeepalive {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(config: KeepaliveConfig) {
    let mut interval = interval_at(Instant::now() + config.delay, config.delay);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match config.socket.send_nat_keepalive(config.remote) {
            Ok(()) => {
                trace!(tag = %config.alarm_tag, remote = %config.remote, "sent NAT-T keepalive")
            }
            Err(e) => warn!(tag = %config.alarm_tag, error = %e, "failed to send NAT-T keepalive"),
        }
    }
}

/// Keeps a session's keepalive in line with its current socket
#[derive(Debug)]
pub struct KeepaliveScheduler {
    delay: Duration,
    alarm_tag: String,
    active: Option<NattKeepalive>,
}

impl KeepaliveScheduler {
    /// Scheduler for session `session_id`, initially idle
    pub fn new(session_id: u32, delay_secs: u32) -> Self {
        Self {
            delay: Duration::from_secs(u64::from(delay_secs)),
            alarm_tag: format!("ike-keepalive-{session_id}"),
            active: None,
        }
    }

    /// Start, restart or stop the keepalive for the session's current state
    ///
    /// Only the IPv4 UDP-encapsulation socket gets keepalives; any other socket stops them.
    pub fn update(
        &mut self,
        socket: &Arc<dyn IkeSocket>,
        local: IpAddr,
        remote: IpAddr,
        network: &Network,
        underpinned_network: Option<&Network>,
    ) -> io::Result<()> {
        if !socket.kind().is_udp_encap() {
            self.stop();
            return Ok(());
        }

        let (IpAddr::V4(local), IpAddr::V4(remote)) = (local, remote) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("keepalive needs IPv4 addresses, got {local} -> {remote}"),
            ));
        };
        let config = KeepaliveConfig {
            local,
            remote,
            socket: socket.clone(),
            network: network.clone(),
            underpinned_network: underpinned_network.cloned(),
            delay: self.delay,
            alarm_tag: self.alarm_tag.clone(),
        };

        if let Some(keepalive) = self.active.as_mut() {
            return keepalive.restart(Some(config));
        }
        self.active = Some(NattKeepalive::start(config)?);
        Ok(())
    }

    /// Change the interval, returning whether it differs from the previous one
    ///
    /// A running keepalive keeps its old interval until the next [`update`](Self::update).
    pub fn set_delay(&mut self, delay_secs: u32) -> bool {
        let delay = Duration::from_secs(u64::from(delay_secs));
        let changed = delay != self.delay;
        self.delay = delay;
        changed
    }

    /// Current interval
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Identifier of the session's keepalive timer
    pub fn alarm_tag(&self) -> &str {
        &self.alarm_tag
    }

    /// The running keepalive, if any
    pub fn active(&self) -> Option<&NattKeepalive> {
        self.active.as_ref()
    }

    /// Whether a keepalive is running
    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(NattKeepalive::is_running)
    }

    /// Stop and forget the keepalive
    pub fn stop(&mut self) {
        self.active = None;
    }
}
