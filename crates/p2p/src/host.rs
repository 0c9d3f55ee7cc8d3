//! libp2p host: node identity, transport and per-protocol streams.
//!
//! The swarm lives in a single background task. [`Host`] talks to it over a
//! command channel and exposes raw, protocol-negotiated streams through
//! `libp2p-stream`, so the DHT and block exchange can each own their wire
//! format without a dedicated `NetworkBehaviour`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::core::upgrade;
use libp2p::identify;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::noise;
use libp2p::ping;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{DialError, NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::tcp;
use libp2p::yamux;
use libp2p::{Multiaddr, PeerId, Stream, StreamProtocol, Transport};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identify protocol version announced to peers.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/letslive/id/1.0.0";

/// Errors raised by the host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerId, reason: String },
    #[error("handshake failed: expected {expected}, remote presented {obtained}")]
    HandshakeFailed { expected: PeerId, obtained: PeerId },
    #[error("no connection to peer {0}")]
    NoSuchPeer(PeerId),
    #[error("peer {peer} does not support {protocol}")]
    ProtocolUnsupported {
        peer: PeerId,
        protocol: StreamProtocol,
    },
    #[error("stream error: {0}")]
    Stream(#[from] io::Error),
    #[error("failed to listen on {address}: {reason}")]
    Listen { address: Multiaddr, reason: String },
    #[error("protocol {0} already has a handler")]
    AlreadyRegistered(StreamProtocol),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("transport setup failed: {0}")]
    Transport(String),
    #[error("host is shut down")]
    Shutdown,
}

/// A peer and the addresses it can be reached on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Addresses with the `/p2p/<PeerId>` suffix appended.
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .map(|addr| with_peer_id(addr, self.peer_id))
            .collect()
    }
}

/// Split `/…/p2p/<PeerId>` into the peer and its transport address.
pub fn peer_info_from_p2p_addr(address: &Multiaddr) -> Result<PeerInfo, HostError> {
    let mut transport = address.clone();
    match transport.pop() {
        Some(Protocol::P2p(peer_id)) if !transport.is_empty() => {
            Ok(PeerInfo::new(peer_id, vec![transport]))
        }
        Some(Protocol::P2p(_)) => Err(HostError::InvalidAddress(format!(
            "{address} has no transport component"
        ))),
        _ => Err(HostError::InvalidAddress(format!(
            "{address} must end with /p2p/<peer id>"
        ))),
    }
}

fn with_peer_id(address: &Multiaddr, peer_id: PeerId) -> Multiaddr {
    match address.iter().last() {
        Some(Protocol::P2p(_)) => address.clone(),
        _ => address.clone().with(Protocol::P2p(peer_id)),
    }
}

/// Configuration for the host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Node identity. A fresh Ed25519 keypair is generated when `None`.
    pub keypair: Option<Keypair>,
    /// Connections without open streams are closed after this long.
    pub idle_connection_timeout: Duration,
    /// Deadline applied by [`Host::dial`].
    pub dial_timeout: Duration,
    pub protocol_version: String,
    pub agent_version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            keypair: None,
            idle_connection_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(10),
            protocol_version: IDENTIFY_PROTOCOL_VERSION.to_string(),
            agent_version: format!("letslive-node/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Default listen address, all interfaces on TCP 4001.
pub fn default_listen_address() -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
        .with(Protocol::Tcp(4001))
}

/// Connection lifecycle notifications published by the swarm task.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { peer_id: PeerId, address: Multiaddr },
    Disconnected { peer_id: PeerId },
    /// The remote answered identify with its listen addresses.
    Identified {
        peer_id: PeerId,
        listen_addrs: Vec<Multiaddr>,
    },
    NewListenAddr { address: Multiaddr },
}

/// Commands used to control the background swarm task.
#[derive(Debug)]
enum HostCommand {
    Listen {
        address: Multiaddr,
        reply: oneshot::Sender<Result<Multiaddr, HostError>>,
    },
    Dial {
        peer: PeerInfo,
        reply: oneshot::Sender<Result<(), HostError>>,
    },
    Disconnect {
        peer_id: PeerId,
    },
}

#[derive(NetworkBehaviour)]
struct HostBehaviour {
    stream: libp2p_stream::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

#[derive(Default)]
struct HostState {
    listen_addrs: RwLock<Vec<Multiaddr>>,
    observed_addrs: RwLock<HashSet<Multiaddr>>,
    connected: RwLock<HashSet<PeerId>>,
}

/// Handle to the node's libp2p swarm.
pub struct Host {
    peer_id: PeerId,
    dial_timeout: Duration,
    command_tx: mpsc::UnboundedSender<HostCommand>,
    control: libp2p_stream::Control,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    state: Arc<HostState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Host {
    /// Build the transport and spawn the swarm task. Must be called from
    /// within a tokio runtime.
    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        let keypair = config
            .keypair
            .clone()
            .unwrap_or_else(Keypair::generate_ed25519);
        let peer_id = keypair.public().to_peer_id();
        info!(%peer_id, "initialising host");

        let noise = noise::Config::new(&keypair)
            .map_err(|err| HostError::Transport(format!("noise: {err}")))?;
        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1)
            .authenticate(noise)
            .multiplex(yamux::Config::default())
            .boxed();

        let behaviour = HostBehaviour {
            stream: libp2p_stream::Behaviour::new(),
            identify: identify::Behaviour::new(
                identify::Config::new(config.protocol_version.clone(), keypair.public())
                    .with_agent_version(config.agent_version.clone()),
            ),
            ping: ping::Behaviour::default(),
        };
        let control = behaviour.stream.new_control();

        let swarm_config = libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(config.idle_connection_timeout);
        let swarm = Swarm::new(transport, behaviour, peer_id, swarm_config);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(HostState::default());
        let cancel = CancellationToken::new();

        let driver = SwarmDriver {
            swarm,
            commands: command_rx,
            events: event_tx,
            state: state.clone(),
            pending_listens: HashMap::new(),
            pending_dials: HashMap::new(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            peer_id,
            dial_timeout: config.dial_timeout,
            command_tx,
            control,
            events_rx: Mutex::new(Some(events_rx)),
            state,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Start listening and wait for the bound address (port 0 resolved).
    pub async fn listen(&self, address: Multiaddr) -> Result<Multiaddr, HostError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Listen { address, reply })?;
        rx.await.map_err(|_| HostError::Shutdown)?
    }

    /// Dial with the configured deadline.
    pub async fn dial(&self, peer: &PeerInfo) -> Result<(), HostError> {
        self.dial_with_timeout(peer, self.dial_timeout).await
    }

    /// Connect to `peer`, reusing an existing connection. Concurrent dials to
    /// the same peer share one attempt.
    pub async fn dial_with_timeout(
        &self,
        peer: &PeerInfo,
        deadline: Duration,
    ) -> Result<(), HostError> {
        if peer.peer_id == self.peer_id {
            return Err(HostError::Unreachable {
                peer: peer.peer_id,
                reason: "refusing to dial self".to_string(),
            });
        }
        if self.is_connected(&peer.peer_id) {
            return Ok(());
        }

        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Dial {
            peer: peer.clone(),
            reply,
        })?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostError::Shutdown),
            Err(_) => Err(HostError::Unreachable {
                peer: peer.peer_id,
                reason: format!("dial timed out after {deadline:?}"),
            }),
        }
    }

    /// Close every connection to `peer_id`.
    pub fn disconnect(&self, peer_id: PeerId) -> Result<(), HostError> {
        self.send(HostCommand::Disconnect { peer_id })
    }

    /// Open a stream for `protocol` over the existing connection to `peer`.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Stream, HostError> {
        if self.cancel.is_cancelled() {
            return Err(HostError::Shutdown);
        }
        if !self.is_connected(&peer) {
            return Err(HostError::NoSuchPeer(peer));
        }

        let mut control = self.control.clone();
        control
            .open_stream(peer, protocol)
            .await
            .map_err(|err| match err {
                libp2p_stream::OpenStreamError::UnsupportedProtocol(protocol) => {
                    HostError::ProtocolUnsupported { peer, protocol }
                }
                libp2p_stream::OpenStreamError::Io(err) => HostError::Stream(err),
                #[allow(unreachable_patterns)]
                other => HostError::Stream(io::Error::other(other.to_string())),
            })
    }

    /// Register the handler for inbound streams of `protocol`.
    pub fn accept(
        &self,
        protocol: StreamProtocol,
    ) -> Result<libp2p_stream::IncomingStreams, HostError> {
        let mut control = self.control.clone();
        control
            .accept(protocol.clone())
            .map_err(|_| HostError::AlreadyRegistered(protocol))
    }

    /// Bound listen addresses.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.state.listen_addrs.read().clone()
    }

    /// Listen addresses plus the addresses peers observed us on.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let mut addrs = self.listen_addrs();
        for observed in self.state.observed_addrs.read().iter() {
            if !addrs.contains(observed) {
                addrs.push(observed.clone());
            }
        }
        addrs
    }

    /// This node as advertised to peers.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.peer_id, self.listen_addrs())
    }

    /// A dialable `/…/p2p/<PeerId>` address, preferring non-loopback ones.
    pub fn p2p_address(&self) -> Option<Multiaddr> {
        let addrs = self.listen_addrs();
        let is_loopback = |addr: &Multiaddr| {
            addr.iter()
                .any(|p| matches!(p, Protocol::Ip4(ip) if ip.is_loopback()))
        };
        addrs
            .iter()
            .find(|addr| !is_loopback(addr))
            .or_else(|| addrs.first())
            .map(|addr| with_peer_id(addr, self.peer_id))
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.state.connected.read().contains(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.state.connected.read().iter().copied().collect()
    }

    /// Acquire the connection-event receiver. Subsequent calls return `None`.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }

    /// Stop the swarm task and wait for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("host swarm task ended abnormally: {err}");
            }
        }
    }

    fn send(&self, command: HostCommand) -> Result<(), HostError> {
        self.command_tx
            .send(command)
            .map_err(|_| HostError::Shutdown)
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type DialWaiter = oneshot::Sender<Result<(), HostError>>;

struct SwarmDriver {
    swarm: Swarm<HostBehaviour>,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Arc<HostState>,
    pending_listens: HashMap<ListenerId, (Multiaddr, oneshot::Sender<Result<Multiaddr, HostError>>)>,
    pending_dials: HashMap<PeerId, Vec<DialWaiter>>,
    cancel: CancellationToken,
}

impl SwarmDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        for (_, (_, reply)) in self.pending_listens.drain() {
            let _ = reply.send(Err(HostError::Shutdown));
        }
        for (_, waiters) in self.pending_dials.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(HostError::Shutdown));
            }
        }
        self.state.connected.write().clear();
        info!(peer_id = %self.swarm.local_peer_id(), "host swarm task terminated");
    }

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Listen { address, reply } => {
                match self.swarm.listen_on(address.clone()) {
                    Ok(listener_id) => {
                        self.pending_listens.insert(listener_id, (address, reply));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(HostError::Listen {
                            address,
                            reason: err.to_string(),
                        }));
                    }
                }
            }
            HostCommand::Dial { peer, reply } => self.dial(peer, reply),
            HostCommand::Disconnect { peer_id } => {
                if self.swarm.disconnect_peer_id(peer_id).is_err() {
                    debug!(%peer_id, "disconnect requested for unconnected peer");
                }
            }
        }
    }

    fn dial(&mut self, peer: PeerInfo, reply: DialWaiter) {
        let peer_id = peer.peer_id;
        if self.swarm.is_connected(&peer_id) {
            let _ = reply.send(Ok(()));
            return;
        }

        for addr in &peer.addrs {
            self.swarm.add_peer_address(peer_id, addr.clone());
        }

        let waiters = self.pending_dials.entry(peer_id).or_default();
        waiters.push(reply);
        if waiters.len() > 1 {
            // Joined an attempt already in flight.
            return;
        }

        let opts = DialOpts::peer_id(peer_id)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .addresses(peer.addrs)
            .build();
        match self.swarm.dial(opts) {
            Ok(()) => debug!(%peer_id, "dialing"),
            // Another dial to the peer is running; its outcome resolves the waiters.
            Err(DialError::DialPeerConditionFalse(_)) => {}
            Err(err) => {
                let err = map_dial_error(peer_id, &err);
                self.resolve_dial(peer_id, Err(err));
            }
        }
    }

    fn resolve_dial(&mut self, peer_id: PeerId, outcome: Result<(), HostError>) {
        let Some(waiters) = self.pending_dials.remove(&peer_id) else {
            return;
        };
        for waiter in waiters {
            let result = match &outcome {
                Ok(()) => Ok(()),
                Err(err) => Err(clone_dial_error(err)),
            };
            let _ = waiter.send(result);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<HostBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                info!(%address, "listening");
                {
                    let mut addrs = self.state.listen_addrs.write();
                    if !addrs.contains(&address) {
                        addrs.push(address.clone());
                    }
                }
                if let Some((_, reply)) = self.pending_listens.remove(&listener_id) {
                    let _ = reply.send(Ok(address.clone()));
                }
                let _ = self.events.send(ConnectionEvent::NewListenAddr { address });
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.state.listen_addrs.write().retain(|addr| addr != &address);
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                addresses,
                reason,
            } => {
                self.state
                    .listen_addrs
                    .write()
                    .retain(|addr| !addresses.contains(addr));
                if let Some((address, reply)) = self.pending_listens.remove(&listener_id) {
                    let reason = match reason {
                        Ok(()) => "listener closed".to_string(),
                        Err(err) => err.to_string(),
                    };
                    let _ = reply.send(Err(HostError::Listen { address, reason }));
                }
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                warn!(?listener_id, "listener error: {error}");
                if let Some((address, reply)) = self.pending_listens.remove(&listener_id) {
                    let _ = reply.send(Err(HostError::Listen {
                        address,
                        reason: error.to_string(),
                    }));
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                self.state.connected.write().insert(peer_id);
                self.resolve_dial(peer_id, Ok(()));
                if num_established.get() == 1 {
                    let address = endpoint.get_remote_address().clone();
                    debug!(%peer_id, %address, "connection established");
                    let _ = self
                        .events
                        .send(ConnectionEvent::Connected { peer_id, address });
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                if num_established == 0 {
                    self.state.connected.write().remove(&peer_id);
                    debug!(%peer_id, ?cause, "disconnected");
                    let _ = self.events.send(ConnectionEvent::Disconnected { peer_id });
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if !self.swarm.is_connected(&peer_id) {
                    debug!(%peer_id, "outgoing connection failed: {error}");
                    let err = map_dial_error(peer_id, &error);
                    self.resolve_dial(peer_id, Err(err));
                }
            }
            SwarmEvent::Behaviour(HostBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                self.state
                    .observed_addrs
                    .write()
                    .insert(info.observed_addr.clone());
                for addr in &info.listen_addrs {
                    self.swarm.add_peer_address(peer_id, addr.clone());
                }
                let _ = self.events.send(ConnectionEvent::Identified {
                    peer_id,
                    listen_addrs: info.listen_addrs,
                });
            }
            _ => {}
        }
    }
}

fn map_dial_error(peer: PeerId, error: &DialError) -> HostError {
    match error {
        DialError::WrongPeerId { obtained, .. } => HostError::HandshakeFailed {
            expected: peer,
            obtained: *obtained,
        },
        other => HostError::Unreachable {
            peer,
            reason: other.to_string(),
        },
    }
}

fn clone_dial_error(error: &HostError) -> HostError {
    match error {
        HostError::HandshakeFailed { expected, obtained } => HostError::HandshakeFailed {
            expected: *expected,
            obtained: *obtained,
        },
        HostError::Unreachable { peer, reason } => HostError::Unreachable {
            peer: *peer,
            reason: reason.clone(),
        },
        HostError::Shutdown => HostError::Shutdown,
        other => HostError::Transport(other.to_string()),
    }
}
