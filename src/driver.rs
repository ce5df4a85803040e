// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! The task owning a [`ConnectionController`]
//!
//! Commands from the IKE state machine, events from the network monitor and inbound IKE messages
//! are all consumed by one task, so the controller is never mutated concurrently.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, trace, Instrument};

use crate::config::{EncapType, IpVersion, KeepaliveDelay};
use crate::controller::{
    ConnectionController, ConnectionInfo, ConnectionSnapshot, ControllerConfig, Dependencies,
    SaRecord,
};
use crate::error::ConnectionError;
use crate::mobility::MobilityEvent;
use crate::network::Network;
use crate::socket::InboundPacket;

const COMMAND_QUEUE_CAPACITY: usize = 32;
const PACKET_QUEUE_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

enum Command {
    Setup(Reply<()>),
    TearDown(Reply<()>),
    SendIkePacket(Bytes, Reply<()>),
    RegisterIkeSpi(u64, Reply<()>),
    UnregisterIkeSpi(u64, Reply<()>),
    RegisterIkeSaRecord(Arc<dyn SaRecord>, Reply<()>),
    UnregisterIkeSaRecord(u64, Reply<()>),
    EnableMobility(Reply<()>),
    NetworkSetByUser {
        network: Network,
        ip_version: IpVersion,
        encap_type: EncapType,
        keepalive_delay: KeepaliveDelay,
        reply: Reply<()>,
    },
    UnderpinnedNetworkSetByUser(Network, Reply<()>),
    NatDetectionInIkeInit {
        nat_detected: bool,
        local_spi: u64,
        reply: Reply<()>,
    },
    NatDetectionInMobike(bool, Reply<()>),
    MarkServerNattUnsupported(Reply<()>),
    Snapshot(Reply<ConnectionSnapshot>),
    ConnectionInfo(Reply<Option<ConnectionInfo>>),
}

/// Spawn a task owning a new controller
///
/// Must be called from within a tokio runtime. The task tears the controller down and exits once
/// every [`ControllerHandle`] is dropped.
pub fn spawn(
    config: ControllerConfig,
    deps: Dependencies,
) -> Result<(ControllerHandle, JoinHandle<()>), ConnectionError> {
    let session_id = config.session_id;
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (mobility_tx, mobility_rx) = mpsc::unbounded_channel();
    let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);

    let controller = ConnectionController::new(config, deps, mobility_tx, packet_tx)?;
    let task = tokio::spawn(
        run(controller, command_rx, mobility_rx, packet_rx)
            .instrument(debug_span!("ike-connection", session_id)),
    );
    Ok((
        ControllerHandle {
            session_id,
            commands: command_tx,
        },
        task,
    ))
}

async fn run(
    mut controller: ConnectionController,
    mut commands: mpsc::Receiver<Command>,
    mut mobility: mpsc::UnboundedReceiver<(u64, MobilityEvent)>,
    mut packets: mpsc::Receiver<InboundPacket>,
) {
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(command) => execute(&mut controller, command).await,
                None => break,
            },
            Some((generation, event)) = mobility.recv() => {
                controller.process_mobility_event(generation, event).await;
            }
            Some(packet) = packets.recv() => controller.process_inbound_packet(packet),
        }
    }

    debug!("all handles dropped");
    controller.tear_down();
}

async fn execute(controller: &mut ConnectionController, command: Command) {
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        Command::Setup(reply) => {
            let _ = reply.send(controller.setup().await);
        }
        Command::TearDown(reply) => {
            controller.tear_down();
            let _ = reply.send(Ok(()));
        }
        Command::SendIkePacket(packet, reply) => {
            trace!(len = packet.len(), "sending IKE message");
            let _ = reply.send(controller.send_ike_packet(&packet));
        }
        Command::RegisterIkeSpi(spi, reply) => {
            let _ = reply.send(controller.register_ike_spi(spi));
        }
        Command::UnregisterIkeSpi(spi, reply) => {
            let _ = reply.send(controller.unregister_ike_spi(spi));
        }
        Command::RegisterIkeSaRecord(record, reply) => {
            let _ = reply.send(controller.register_ike_sa_record(record));
        }
        Command::UnregisterIkeSaRecord(spi, reply) => {
            let _ = reply.send(controller.unregister_ike_sa_record(spi));
        }
        Command::EnableMobility(reply) => {
            let _ = reply.send(controller.enable_mobility());
        }
        Command::NetworkSetByUser {
            network,
            ip_version,
            encap_type,
            keepalive_delay,
            reply,
        } => {
            let result = controller
                .on_network_set_by_user(network, ip_version, encap_type, keepalive_delay)
                .await;
            let _ = reply.send(result);
        }
        Command::UnderpinnedNetworkSetByUser(network, reply) => {
            let _ = reply.send(controller.on_underpinned_network_set_by_user(network));
        }
        Command::NatDetectionInIkeInit {
            nat_detected,
            local_spi,
            reply,
        } => {
            let result =
                controller.handle_nat_detection_result_in_ike_init(nat_detected, local_spi);
            let _ = reply.send(result);
        }
        Command::NatDetectionInMobike(nat_detected, reply) => {
            let _ = reply.send(controller.handle_nat_detection_result_in_mobike(nat_detected));
        }
        Command::MarkServerNattUnsupported(reply) => {
            controller.mark_server_natt_unsupported();
            let _ = reply.send(Ok(()));
        }
        Command::Snapshot(reply) => {
            let _ = reply.send(Ok(controller.snapshot()));
        }
        Command::ConnectionInfo(reply) => {
            let _ = reply.send(Ok(controller.connection_info()));
        }
    }
}

/// Cloneable handle to a controller task
///
/// Every method waits for the task to execute the request. Once the task is gone they fail with
/// [`ConnectionError::ControllerStopped`].
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    session_id: u32,
    commands: mpsc::Sender<Command>,
}

impl ControllerHandle {
    /// Session identifier of the controller
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ConnectionError::ControllerStopped)?;
        rx.await.map_err(|_| ConnectionError::ControllerStopped)?
    }

    /// See [`ConnectionController::setup`]
    pub async fn setup(&self) -> Result<(), ConnectionError> {
        self.request(Command::Setup).await
    }

    /// See [`ConnectionController::tear_down`]
    pub async fn tear_down(&self) -> Result<(), ConnectionError> {
        self.request(Command::TearDown).await
    }

    /// See [`ConnectionController::send_ike_packet`]
    pub async fn send_ike_packet(&self, packet: Bytes) -> Result<(), ConnectionError> {
        self.request(|reply| Command::SendIkePacket(packet, reply))
            .await
    }

    /// See [`ConnectionController::register_ike_spi`]
    pub async fn register_ike_spi(&self, spi: u64) -> Result<(), ConnectionError> {
        self.request(|reply| Command::RegisterIkeSpi(spi, reply))
            .await
    }

    /// See [`ConnectionController::unregister_ike_spi`]
    pub async fn unregister_ike_spi(&self, spi: u64) -> Result<(), ConnectionError> {
        self.request(|reply| Command::UnregisterIkeSpi(spi, reply))
            .await
    }

    /// See [`ConnectionController::register_ike_sa_record`]
    pub async fn register_ike_sa_record(
        &self,
        record: Arc<dyn SaRecord>,
    ) -> Result<(), ConnectionError> {
        self.request(|reply| Command::RegisterIkeSaRecord(record, reply))
            .await
    }

    /// See [`ConnectionController::unregister_ike_sa_record`]
    pub async fn unregister_ike_sa_record(&self, local_spi: u64) -> Result<(), ConnectionError> {
        self.request(|reply| Command::UnregisterIkeSaRecord(local_spi, reply))
            .await
    }

    /// See [`ConnectionController::enable_mobility`]
    pub async fn enable_mobility(&self) -> Result<(), ConnectionError> {
        self.request(Command::EnableMobility).await
    }

    /// See [`ConnectionController::on_network_set_by_user`]
    pub async fn on_network_set_by_user(
        &self,
        network: Network,
        ip_version: IpVersion,
        encap_type: EncapType,
        keepalive_delay: KeepaliveDelay,
    ) -> Result<(), ConnectionError> {
        self.request(|reply| Command::NetworkSetByUser {
            network,
            ip_version,
            encap_type,
            keepalive_delay,
            reply,
        })
        .await
    }

    /// See [`ConnectionController::on_underpinned_network_set_by_user`]
    pub async fn on_underpinned_network_set_by_user(
        &self,
        network: Network,
    ) -> Result<(), ConnectionError> {
        self.request(|reply| Command::UnderpinnedNetworkSetByUser(network, reply))
            .await
    }

    /// See [`ConnectionController::handle_nat_detection_result_in_ike_init`]
    pub async fn handle_nat_detection_result_in_ike_init(
        &self,
        nat_detected: bool,
        local_spi: u64,
    ) -> Result<(), ConnectionError> {
        self.request(|reply| Command::NatDetectionInIkeInit {
            nat_detected,
            local_spi,
            reply,
        })
        .await
    }

    /// See [`ConnectionController::handle_nat_detection_result_in_mobike`]
    pub async fn handle_nat_detection_result_in_mobike(
        &self,
        nat_detected: bool,
    ) -> Result<(), ConnectionError> {
        self.request(|reply| Command::NatDetectionInMobike(nat_detected, reply))
            .await
    }

    /// See [`ConnectionController::mark_server_natt_unsupported`]
    pub async fn mark_server_natt_unsupported(&self) -> Result<(), ConnectionError> {
        self.request(Command::MarkServerNattUnsupported).await
    }

    /// See [`ConnectionController::snapshot`]
    pub async fn snapshot(&self) -> Result<ConnectionSnapshot, ConnectionError> {
        self.request(Command::Snapshot).await
    }

    /// See [`ConnectionController::connection_info`]
    pub async fn connection_info(&self) -> Result<Option<ConnectionInfo>, ConnectionError> {
        self.request(Command::ConnectionInfo).await
    }
}
