//! Session actor
//!
//! Runs one `ConnectionController` on a dedicated thread and serializes every
//! input through a single queue: caller commands from `SessionHandle` and
//! asynchronous `ControllerEvent`s from network callbacks, socket receive
//! threads and keepalive alarms. The thread is a plain OS thread because DNS
//! resolution and socket creation block.
//!
//! The event sink handed to the controller only holds a weak sender, so the
//! actor tears the controller down and exits once every `SessionHandle` is
//! dropped.

use crate::config::SessionParams;
use crate::controller::{
    Collaborators, ConnectionCallback, ConnectionController, ConnectionInfo, ControllerState,
    NatStatus, NetworkType,
};
use crate::error::{ConnectionError, Result};
use crate::events::{ControllerEvent, EventSink};
use crate::keepalive::KeepaliveDelay;
use crate::record::SaRecord;
use crate::selector::{EncapType, IpVersion};
use ikemob_transport::NetworkHandle;
use std::borrow::Cow;
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    SetUp(Reply<Result<()>>),
    TearDown(Reply<()>),
    EnableMobility(Reply<Result<()>>),
    NatDetected {
        detected: bool,
        local_spi: Option<u64>,
        reply: Reply<Result<()>>,
    },
    NetworkSetByUser {
        network: NetworkHandle,
        ip_version: IpVersion,
        encap_type: EncapType,
        keepalive_delay: KeepaliveDelay,
        reply: Reply<Result<()>>,
    },
    UnderpinnedNetworkSetByUser(NetworkHandle, Reply<Result<()>>),
    MarkServerNattUnsupported,
    ResetServerNattSupport,
    RegisterNewRecord(u64, Reply<Result<()>>),
    RegisterExistingRecord(Arc<dyn SaRecord>, Reply<Result<()>>),
    UnregisterRecord(u64),
    SendPacket(Vec<u8>, Reply<Result<usize>>),
    Status(Reply<SessionStatus>),
    Dump(Reply<String>),
    Event(ControllerEvent),
    Shutdown,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Lifecycle state
    pub state: ControllerState,
    /// Active network
    pub network: NetworkHandle,
    /// Address pair, once set up
    pub connection: Option<ConnectionInfo>,
    /// NAT status
    pub nat_status: NatStatus,
    /// Whether mobility is enabled
    pub mobility_enabled: bool,
    /// Whether the IPv4 encapsulation socket is active
    pub uses_udp_encap_socket: bool,
    /// Server port of the active socket
    pub remote_port: Option<u16>,
    /// Whether a NAT-T keepalive runs
    pub keepalive_running: bool,
    /// Registered SPIs, ascending
    pub registered_spis: Vec<u64>,
    /// Network type, for metrics
    pub network_type: NetworkType,
}

impl SessionStatus {
    fn of(controller: &ConnectionController) -> Self {
        Self {
            state: controller.state(),
            network: controller.network(),
            connection: controller.connection_info(),
            nat_status: controller.nat_status(),
            mobility_enabled: controller.is_mobility_enabled(),
            uses_udp_encap_socket: controller.uses_udp_encap_socket(),
            remote_port: controller.remote_port(),
            keepalive_running: controller.is_keepalive_running(),
            registered_spis: controller.registered_spis(),
            network_type: controller.network_type(),
        }
    }
}

/// Spawns session actors
pub struct SessionActor;

impl SessionActor {
    /// Build a controller for `params` and run it on its own thread.
    ///
    /// The controller is constructed before the thread starts, so construction
    /// errors are returned here. `set_up` is not called.
    ///
    /// # Errors
    /// Returns `SetupFailed` if the controller cannot be built or the thread
    /// cannot be spawned
    pub fn spawn(
        params: SessionParams,
        collaborators: Collaborators,
        callback: Arc<dyn ConnectionCallback>,
    ) -> Result<SessionHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let weak = tx.downgrade();
        let sink = EventSink::new(move |event| {
            if let Some(tx) = weak.upgrade() {
                // Closed means the actor already exited.
                let _ = tx.send(Command::Event(event));
            }
        });

        let hostname = params.server_hostname.clone();
        let mut controller = ConnectionController::new(params, collaborators, callback, sink)?;

        thread::Builder::new()
            .name("ikemob-session".to_string())
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    if !Self::apply(&mut controller, command) {
                        break;
                    }
                }
                controller.tear_down();
                tracing::debug!("Session actor for {} exited", hostname);
            })
            .map_err(|e| {
                ConnectionError::SetupFailed(Cow::Owned(format!(
                    "Failed to spawn session thread: {e}"
                )))
            })?;

        Ok(SessionHandle { tx })
    }

    /// Apply one command. Returns false when the actor should exit.
    fn apply(controller: &mut ConnectionController, command: Command) -> bool {
        // A dropped reply receiver means the caller gave up waiting.
        match command {
            Command::SetUp(reply) => {
                let _ = reply.send(controller.set_up());
            }
            Command::TearDown(reply) => {
                controller.tear_down();
                let _ = reply.send(());
            }
            Command::EnableMobility(reply) => {
                let _ = reply.send(controller.enable_mobility());
            }
            Command::NatDetected {
                detected,
                local_spi,
                reply,
            } => {
                let result = match local_spi {
                    Some(spi) => controller.handle_nat_detection_result(detected, spi),
                    None => controller.handle_nat_detection_result_in_mobike(detected),
                };
                let _ = reply.send(result);
            }
            Command::NetworkSetByUser {
                network,
                ip_version,
                encap_type,
                keepalive_delay,
                reply,
            } => {
                let _ = reply.send(controller.on_network_set_by_user(
                    network,
                    ip_version,
                    encap_type,
                    keepalive_delay,
                ));
            }
            Command::UnderpinnedNetworkSetByUser(network, reply) => {
                let _ = reply.send(controller.on_underpinned_network_set_by_user(network));
            }
            Command::MarkServerNattUnsupported => controller.mark_server_natt_unsupported(),
            Command::ResetServerNattSupport => controller.reset_server_natt_support(),
            Command::RegisterNewRecord(spi, reply) => {
                let _ = reply.send(controller.register_new_record(spi));
            }
            Command::RegisterExistingRecord(record, reply) => {
                let _ = reply.send(controller.register_existing_record(record));
            }
            Command::UnregisterRecord(spi) => controller.unregister_record(spi),
            Command::SendPacket(packet, reply) => {
                let _ = reply.send(controller.send_packet(&packet));
            }
            Command::Status(reply) => {
                let _ = reply.send(SessionStatus::of(controller));
            }
            Command::Dump(reply) => {
                let _ = reply.send(controller.to_string());
            }
            Command::Event(event) => controller.handle_event(event),
            Command::Shutdown => return false,
        }
        true
    }
}

/// Cloneable handle to a session actor
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| ConnectionError::invalid_state("Session actor has stopped"))
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply))?;
        response
            .await
            .map_err(|_| ConnectionError::invalid_state("Session actor has stopped"))
    }

    /// See `ConnectionController::set_up`
    ///
    /// # Errors
    /// The controller's setup error, or `InvalidState` if the actor stopped
    pub async fn set_up(&self) -> Result<()> {
        self.request(Command::SetUp).await?
    }

    /// See `ConnectionController::tear_down`
    ///
    /// # Errors
    /// `InvalidState` if the actor stopped
    pub async fn tear_down(&self) -> Result<()> {
        self.request(Command::TearDown).await
    }

    /// See `ConnectionController::enable_mobility`
    ///
    /// # Errors
    /// The controller's error, or `InvalidState` if the actor stopped
    pub async fn enable_mobility(&self) -> Result<()> {
        self.request(Command::EnableMobility).await?
    }

    /// See `ConnectionController::handle_nat_detection_result`
    ///
    /// # Errors
    /// The controller's error, or `InvalidState` if the actor stopped
    pub async fn handle_nat_detection_result(&self, detected: bool, local_spi: u64) -> Result<()> {
        self.request(|reply| Command::NatDetected {
            detected,
            local_spi: Some(local_spi),
            reply,
        })
        .await?
    }

    /// See `ConnectionController::handle_nat_detection_result_in_mobike`
    ///
    /// # Errors
    /// The controller's error, or `InvalidState` if the actor stopped
    pub async fn handle_nat_detection_result_in_mobike(&self, detected: bool) -> Result<()> {
        self.request(|reply| Command::NatDetected {
            detected,
            local_spi: None,
            reply,
        })
        .await?
    }

    /// See `ConnectionController::on_network_set_by_user`
    ///
    /// # Errors
    /// The controller's error, or `InvalidState` if the actor stopped
    pub async fn set_network(
        &self,
        network: NetworkHandle,
        ip_version: IpVersion,
        encap_type: EncapType,
        keepalive_delay: KeepaliveDelay,
    ) -> Result<()> {
        self.request(|reply| Command::NetworkSetByUser {
            network,
            ip_version,
            encap_type,
            keepalive_delay,
            reply,
        })
        .await?
    }

    /// See `ConnectionController::on_underpinned_network_set_by_user`
    ///
    /// # Errors
    /// The controller's error, or `InvalidState` if the actor stopped
    pub async fn set_underpinned_network(&self, network: NetworkHandle) -> Result<()> {
        self.request(|reply| Command::UnderpinnedNetworkSetByUser(network, reply))
            .await?
    }

    /// See `ConnectionController::mark_server_natt_unsupported`
    ///
    /// # Errors
    /// `InvalidState` if the actor stopped
    pub fn mark_server_natt_unsupported(&self) -> Result<()> {
        self.send(Command::MarkServerNattUnsupported)
    }

    /// See `ConnectionController::reset_server_natt_support`
    ///
    /// # Errors
    /// `InvalidState` if the actor stopped
    pub fn reset_server_natt_support(&self) -> Result<()> {
        self.send(Command::ResetServerNattSupport)
    }

    /// See `ConnectionController::register_new_record`
    ///
    /// # Errors
    /// The controller's error, or `InvalidState` if the actor stopped
    pub async fn register_new_record(&self, spi: u64) -> Result<()> {
        self.request(|reply| Command::RegisterNewRecord(spi, reply))
            .await?
    }

    /// See `ConnectionController::register_existing_record`
    ///
    /// # Errors
    /// The controller's error, or `InvalidState` if the actor stopped
    pub async fn register_existing_record(&self, record: Arc<dyn SaRecord>) -> Result<()> {
        self.request(|reply| Command::RegisterExistingRecord(record, reply))
            .await?
    }

    /// See `ConnectionController::unregister_record`
    ///
    /// # Errors
    /// `InvalidState` if the actor stopped
    pub fn unregister_record(&self, spi: u64) -> Result<()> {
        self.send(Command::UnregisterRecord(spi))
    }

    /// See `ConnectionController::send_packet`
    ///
    /// # Errors
    /// The controller's error, or `InvalidState` if the actor stopped
    pub async fn send_packet(&self, packet: Vec<u8>) -> Result<usize> {
        self.request(|reply| Command::SendPacket(packet, reply))
            .await?
    }

    /// Queue an asynchronous event, as a network callback or alarm would
    ///
    /// # Errors
    /// `InvalidState` if the actor stopped
    pub fn deliver(&self, event: ControllerEvent) -> Result<()> {
        self.send(Command::Event(event))
    }

    /// Snapshot of the session
    ///
    /// # Errors
    /// `InvalidState` if the actor stopped
    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(Command::Status).await
    }

    /// Human-readable dump of the controller
    ///
    /// # Errors
    /// `InvalidState` if the actor stopped
    pub async fn dump(&self) -> Result<String> {
        self.request(Command::Dump).await
    }

    /// Tear down and stop the actor. Later requests fail with `InvalidState`.
    pub fn shutdown(&self) {
        // Already stopped is fine.
        let _ = self.tx.send(Command::Shutdown);
    }
}
