// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Network change observation
//!
//! The platform reports raw network events to a [`NetworkObserver`] from its own threads. The
//! [`MobilityMonitor`] filters them down to the events a session cares about and posts those onto
//! the controller's queue. It never touches controller state itself.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::controller::ConnectionCallback;
use crate::error::ConnectionError;
use crate::network::{LinkProperties, Network, NetworkCapabilities};

/// A raw event from the platform's network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A network became available (for default observers: became the default)
    Available(Network),
    /// The transports of a network changed
    CapabilitiesChanged(Network, NetworkCapabilities),
    /// The addresses of a network changed
    LinkPropertiesChanged(Network, LinkProperties),
    /// A network went away
    Lost(Network),
}

/// Receives raw network events, possibly from a foreign thread
pub trait NetworkObserver: Send + Sync + 'static {
    /// Handle one event; must not block
    fn on_network_event(&self, event: NetworkEvent);
}

/// Which networks an observer is told about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObserverScope {
    /// Whatever network is currently the system default
    Default,
    /// Every network; the observer only reacts to this one
    Specific(Network),
}

/// Registration handle returned by a [`NetworkMonitor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

/// Errors raised by a [`NetworkMonitor`]
#[derive(Debug, Clone, Error)]
pub enum MonitorError {
    /// The platform refused the registration
    #[error("registration rejected: {0}")]
    Rejected(String),
    /// Too many observers are registered
    #[error("observer limit reached")]
    TooManyObservers,
}

/// Platform service delivering network events
pub trait NetworkMonitor: Send + Sync + 'static {
    /// Start delivering events in `scope` to `observer`
    fn register_observer(
        &self,
        scope: ObserverScope,
        observer: Arc<dyn NetworkObserver>,
    ) -> Result<ObserverId, MonitorError>;

    /// Stop delivering events to a registered observer
    fn unregister_observer(&self, id: ObserverId);
}

/// A network change relevant to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MobilityEvent {
    /// The session should move to (or refresh its addresses on) `network`
    NetworkUpdated {
        /// Network to run on
        network: Network,
        /// Its current link properties
        link_properties: LinkProperties,
        /// Its current capabilities
        capabilities: NetworkCapabilities,
    },
    /// The capabilities of the current network changed
    CapabilitiesUpdated(NetworkCapabilities),
    /// The current network is gone
    NetworkDied,
}

/// Where a [`MobilityMonitor`] posts events, tagged with its generation
///
/// Unbounded: platform callbacks must never be turned away while the owner task is busy, for
/// example while it awaits DNS during a network update.
pub type MobilityQueue = mpsc::UnboundedSender<(u64, MobilityEvent)>;

#[derive(Debug)]
struct Tracked {
    network: Network,
    address: IpAddr,
    link_properties: LinkProperties,
    capabilities: NetworkCapabilities,
    /// Capabilities of a network that is about to become the default
    pending: Option<(Network, NetworkCapabilities)>,
    active: bool,
}

/// Turns raw network events into [`MobilityEvent`]s for one controller
///
/// Events are posted with the generation the monitor was created with, so the controller can
/// discard events of a monitor it no longer uses.
pub struct MobilityMonitor {
    scope_is_default: bool,
    generation: u64,
    tracked: Mutex<Tracked>,
    queue: MobilityQueue,
    callback: Arc<dyn ConnectionCallback>,
}

impl MobilityMonitor {
    /// Monitor tracking `network`, on which the session uses `address`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scope: &ObserverScope,
        network: Network,
        address: IpAddr,
        link_properties: LinkProperties,
        capabilities: NetworkCapabilities,
        generation: u64,
        queue: MobilityQueue,
        callback: Arc<dyn ConnectionCallback>,
    ) -> Self {
        Self {
            scope_is_default: matches!(scope, ObserverScope::Default),
            generation,
            tracked: Mutex::new(Tracked {
                network,
                address,
                link_properties,
                capabilities,
                pending: None,
                active: true,
            }),
            queue,
            callback,
        }
    }

    /// Generation tag attached to posted events
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Track another network; posts nothing
    pub fn set_network(
        &self,
        network: Network,
        link_properties: LinkProperties,
        capabilities: NetworkCapabilities,
    ) {
        let mut tracked = self.tracked.lock();
        tracked.network = network;
        tracked.link_properties = link_properties;
        tracked.capabilities = capabilities;
        tracked.pending = None;
    }

    /// Record the local address now used by the session
    pub fn set_address(&self, address: IpAddr) {
        self.tracked.lock().address = address;
    }

    /// Network currently tracked
    pub fn network(&self) -> Network {
        self.tracked.lock().network.clone()
    }

    /// Stop posting; later platform events are dropped
    pub fn deactivate(&self) {
        self.tracked.lock().active = false;
    }

    fn post(&self, event: MobilityEvent) {
        trace!(generation = self.generation, ?event, "posting mobility event");
        // Only fails once the owner task, and with it the receiver, is gone
        if self.queue.send((self.generation, event)).is_err() {
            error!("failed to marshal mobility event onto the controller");
            self.callback.on_error(ConnectionError::ControllerStopped);
        }
    }

    fn on_default_event(
        &self,
        tracked: &mut Tracked,
        event: NetworkEvent,
    ) -> Option<MobilityEvent> {
        match event {
            NetworkEvent::Available(_) => None,
            NetworkEvent::CapabilitiesChanged(network, caps) => {
                if network == tracked.network {
                    tracked.capabilities = caps.clone();
                    Some(MobilityEvent::CapabilitiesUpdated(caps))
                } else {
                    tracked.pending = Some((network, caps));
                    None
                }
            }
            NetworkEvent::LinkPropertiesChanged(network, link) => {
                if network == tracked.network {
                    return self.on_tracked_link_changed(tracked, link);
                }
                // A new default network is only usable once its capabilities are known
                let caps = match tracked.pending.take() {
                    Some((pending, caps)) if pending == network => caps,
                    other => {
                        tracked.pending = other;
                        debug!(%network, "link properties before capabilities, waiting");
                        return None;
                    }
                };
                debug!(from = %tracked.network, to = %network, "default network changed");
                tracked.network = network.clone();
                tracked.link_properties = link.clone();
                tracked.capabilities = caps.clone();
                Some(MobilityEvent::NetworkUpdated {
                    network,
                    link_properties: link,
                    capabilities: caps,
                })
            }
            NetworkEvent::Lost(network) => {
                if tracked.pending.as_ref().is_some_and(|(n, _)| *n == network) {
                    tracked.pending = None;
                }
                (network == tracked.network).then_some(MobilityEvent::NetworkDied)
            }
        }
    }

    fn on_specific_event(
        &self,
        tracked: &mut Tracked,
        event: NetworkEvent,
    ) -> Option<MobilityEvent> {
        match event {
            NetworkEvent::CapabilitiesChanged(network, caps) if network == tracked.network => {
                tracked.capabilities = caps.clone();
                Some(MobilityEvent::CapabilitiesUpdated(caps))
            }
            NetworkEvent::LinkPropertiesChanged(network, link) if network == tracked.network => {
                self.on_tracked_link_changed(tracked, link)
            }
            NetworkEvent::Lost(network) if network == tracked.network => {
                Some(MobilityEvent::NetworkDied)
            }
            _ => None,
        }
    }

    fn on_tracked_link_changed(
        &self,
        tracked: &mut Tracked,
        link: LinkProperties,
    ) -> Option<MobilityEvent> {
        tracked.link_properties = link.clone();
        if link.contains_address(&tracked.address) {
            return None;
        }
        debug!(network = %tracked.network, address = %tracked.address, "local address lost");
        Some(MobilityEvent::NetworkUpdated {
            network: tracked.network.clone(),
            link_properties: link,
            capabilities: tracked.capabilities.clone(),
        })
    }
}

impl NetworkObserver for MobilityMonitor {
    fn on_network_event(&self, event: NetworkEvent) {
        let posted = {
            let mut tracked = self.tracked.lock();
            if !tracked.active {
                return;
            }
            if self.scope_is_default {
                self.on_default_event(&mut tracked, event)
            } else {
                self.on_specific_event(&mut tracked, event)
            }
        };
        if let Some(event) = posted {
            self.post(event);
        }
    }
}

impl std::fmt::Debug for MobilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MobilityMonitor")
            .field("default_scope", &self.scope_is_default)
            .field("generation", &self.generation)
            .field("tracked", &*self.tracked.lock())
            .finish_non_exhaustive()
    }
}
