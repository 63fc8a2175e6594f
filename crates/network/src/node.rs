//! Transport node
//!
//! One task owns the libp2p swarm and drives it with `tokio::select!` over
//! a command channel and swarm events. [`TransportNode`] is the cloneable
//! handle: every operation is a command with a oneshot reply, so no caller
//! ever touches the swarm directly.
//!
//! Disconnect cancels the node token (dial loops and stream tasks stop),
//! stops the driver and waits for all of it before returning.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncWriteExt, StreamExt};
use libp2p::identity::Keypair;
use libp2p::kad::{self, GetProvidersOk, GetRecordOk, QueryResult};
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundFailure, OutboundRequestId, ResponseChannel};
use libp2p::swarm::{dial_opts::DialOpts, ConnectionId, SwarmEvent};
use libp2p::{identify, mdns, noise, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use libp2p_stream::IncomingStreams;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use infermesh_core::{
    AddressBackoff, BackoffPolicy, JobOffer, JobOfferResponse, NetworkSettings, PeerRecord,
    StreamMessage, StreamOpen, StreamStatus, StreamSummary,
};

use crate::behaviour::{
    MeshBehaviour, MeshBehaviourEvent, CAPABILITY_REANNOUNCE_INTERVAL, TOKEN_STREAM_PROTOCOL,
};
use crate::protocol::{read_frame, read_json_frame, write_json_frame};
use crate::{
    CapabilityRecord, NetworkError, OfferHandler, PeerNetwork, ProviderHit, Result, TokenSource,
};

/// Capacity of the provider-hit channel handed to lookup callers
const PROVIDER_HIT_CAPACITY: usize = 128;

/// Capacity of the raw frame channel for an open token stream
const STREAM_FRAME_CAPACITY: usize = 256;

/// Transport node configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub listen_addrs: Vec<Multiaddr>,
    pub bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    pub enable_mdns: bool,
    pub idle_timeout: Duration,
    pub kad_query_timeout: Duration,
    /// Negotiation request timeout
    pub request_timeout: Duration,
    /// Per-address dial backoff
    pub dial_backoff: BackoffPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![tcp_listen_addr(Ipv4Addr::UNSPECIFIED)],
            bootstrap_peers: Vec::new(),
            enable_mdns: true,
            idle_timeout: Duration::from_secs(60),
            kad_query_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            dial_backoff: BackoffPolicy::new(Duration::from_millis(500), 5),
        }
    }
}

impl NetworkConfig {
    /// Loopback-only node without mDNS
    pub fn local() -> Self {
        Self {
            listen_addrs: vec![tcp_listen_addr(Ipv4Addr::LOCALHOST)],
            enable_mdns: false,
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &NetworkSettings, request_timeout: Duration) -> Result<Self> {
        let listen_addr = settings
            .listen_addr
            .parse::<Multiaddr>()
            .map_err(|_| NetworkError::InvalidAddress(settings.listen_addr.clone()))?;
        let bootstrap_peers = settings
            .bootstrap_peers
            .iter()
            .map(|s| parse_bootstrap_peer(s))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            listen_addrs: vec![listen_addr],
            bootstrap_peers,
            enable_mdns: settings.enable_mdns,
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            kad_query_timeout: Duration::from_secs(settings.kad_query_timeout_secs),
            request_timeout,
            dial_backoff: settings.dial_backoff(),
        })
    }
}

fn tcp_listen_addr(ip: Ipv4Addr) -> Multiaddr {
    Multiaddr::empty().with(Protocol::Ip4(ip)).with(Protocol::Tcp(0))
}

/// Parse a bootstrap peer as `peer_id@multiaddr` or `multiaddr/p2p/peer_id`
pub fn parse_bootstrap_peer(s: &str) -> Result<(PeerId, Multiaddr)> {
    if let Some((peer, addr)) = s.split_once('@') {
        let peer_id = parse_peer_id(peer)?;
        let addr = addr
            .parse::<Multiaddr>()
            .map_err(|_| NetworkError::InvalidAddress(addr.to_string()))?;
        return Ok((peer_id, addr));
    }

    let mut addr = s
        .parse::<Multiaddr>()
        .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;
    match addr.pop() {
        Some(Protocol::P2p(peer_id)) => Ok((peer_id, addr)),
        _ => Err(NetworkError::InvalidAddress(format!("{} has no peer id", s))),
    }
}

fn parse_peer_id(s: &str) -> Result<PeerId> {
    PeerId::from_str(s).map_err(|_| NetworkError::InvalidPeerId(s.to_string()))
}

fn parse_addrs(addrs: &[String]) -> Vec<Multiaddr> {
    addrs.iter().filter_map(|a| a.parse().ok()).collect()
}

/// Build the libp2p swarm: TCP + Noise + Yamux + DNS with [`MeshBehaviour`]
pub fn build_swarm(keypair: Keypair, config: &NetworkConfig) -> Result<Swarm<MeshBehaviour>> {
    let idle_timeout = config.idle_timeout;
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::TransportError(e.to_string()))?
        .with_dns()
        .map_err(|e| NetworkError::TransportError(e.to_string()))?
        .with_behaviour(|key| MeshBehaviour::new(key, config))
        .map_err(|e| NetworkError::TransportError(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();
    Ok(swarm)
}

enum Command {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<PeerId>>,
    },
    AddAddresses {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    },
    Announce {
        record: CapabilityRecord,
        reply: oneshot::Sender<Result<()>>,
    },
    FindProviders {
        workload: String,
        hits: mpsc::Sender<ProviderHit>,
    },
    SendOffer {
        peer: PeerId,
        offer: JobOffer,
        reply: oneshot::Sender<Result<JobOfferResponse>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

struct PendingOffer {
    request_id: String,
    reply: oneshot::Sender<Result<JobOfferResponse>>,
}

struct ProviderQuery {
    hits: mpsc::Sender<ProviderHit>,
    seen: HashSet<PeerId>,
}

struct RecordQuery {
    provider: PeerId,
    hits: mpsc::Sender<ProviderHit>,
}

type OfferReply = (ResponseChannel<JobOfferResponse>, JobOfferResponse);

struct SwarmDriver {
    swarm: Swarm<MeshBehaviour>,
    local_peer_id: PeerId,
    commands: mpsc::Receiver<Command>,
    replies_tx: mpsc::UnboundedSender<OfferReply>,
    replies_rx: mpsc::UnboundedReceiver<OfferReply>,
    offer_handler: Arc<dyn OfferHandler>,
    pending_dials: HashMap<ConnectionId, oneshot::Sender<Result<PeerId>>>,
    pending_offers: HashMap<OutboundRequestId, PendingOffer>,
    provider_queries: HashMap<kad::QueryId, ProviderQuery>,
    record_queries: HashMap<kad::QueryId, RecordQuery>,
    announced: Option<CapabilityRecord>,
    listen_addrs: Vec<Multiaddr>,
    cancel: CancellationToken,
    /// Node task set; inbound offer handlers run here
    tasks: TaskTracker,
}

impl SwarmDriver {
    async fn run(mut self) {
        let mut reannounce = tokio::time::interval(CAPABILITY_REANNOUNCE_INTERVAL);
        reannounce.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((channel, response)) = self.replies_rx.recv() => {
                    if self.swarm.behaviour_mut().negotiation.send_response(channel, response).is_err() {
                        debug!("Offer response dropped: requester went away");
                    }
                }
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                _ = reannounce.tick() => self.reannounce(),
            }
        }

        for (_, pending) in self.pending_offers.drain() {
            let _ = pending.reply.send(Err(NetworkError::NotConnected));
        }
        for (_, reply) in self.pending_dials.drain() {
            let _ = reply.send(Err(NetworkError::Cancelled));
        }
        info!("Swarm driver for {} stopped", self.local_peer_id);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { addr, reply } => {
                let opts = DialOpts::unknown_peer_id().address(addr.clone()).build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        debug!("Dialing {}", addr);
                        self.pending_dials.insert(connection_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NetworkError::DialFailed(format!("{}: {}", addr, e))));
                    }
                }
            }
            Command::AddAddresses { peer, addrs } => {
                for addr in addrs {
                    self.swarm.add_peer_address(peer, addr.clone());
                    self.swarm.behaviour_mut().add_address(&peer, addr);
                }
            }
            Command::Announce { record, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .announce_capabilities(&self.local_peer_id, &record)
                    .map_err(|e| NetworkError::DhtError(e.to_string()));
                if result.is_ok() {
                    info!(
                        "Announced capabilities for {} workload(s)",
                        record.capabilities.workloads.len()
                    );
                    self.announced = Some(record);
                }
                let _ = reply.send(result);
            }
            Command::FindProviders { workload, hits } => {
                let query_id = self.swarm.behaviour_mut().find_capability_providers(&workload);
                debug!("Provider lookup {:?} for {}", query_id, workload);
                self.provider_queries.insert(
                    query_id,
                    ProviderQuery {
                        hits,
                        seen: HashSet::new(),
                    },
                );
            }
            Command::SendOffer { peer, offer, reply } => {
                let request_id = offer.request_id.clone();
                let outbound = self.swarm.behaviour_mut().negotiation.send_request(&peer, offer);
                debug!("Sent offer {} to {}", request_id, peer);
                self.pending_offers
                    .insert(outbound, PendingOffer { request_id, reply });
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.listen_addrs.clone());
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().cloned().collect());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MeshBehaviourEvent::Kademlia(event)) => {
                self.handle_kad_event(event);
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Negotiation(event)) => {
                self.handle_negotiation_event(event);
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().add_address(&peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                for (peer_id, addr) in list {
                    debug!("mDNS discovered {} at {}", peer_id, addr);
                    self.swarm.behaviour_mut().add_address(&peer_id, addr);
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.listen_addrs.push(address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                ..
            } => {
                debug!("Connected to {}", peer_id);
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(peer_id));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                error,
                ..
            } => {
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(NetworkError::DialFailed(error.to_string())));
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("Connection to {} closed: {:?}", peer_id, cause);
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        let kad::Event::OutboundQueryProgressed {
            id, result, step, ..
        } = event
        else {
            return;
        };

        match result {
            QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                let mut fetches = Vec::new();
                if let Some(query) = self.provider_queries.get_mut(&id) {
                    for provider in providers {
                        if provider != self.local_peer_id && query.seen.insert(provider) {
                            fetches.push((provider, query.hits.clone()));
                        }
                    }
                }
                for (provider, hits) in fetches {
                    let record_query = self.swarm.behaviour_mut().fetch_peer_record(&provider);
                    self.record_queries
                        .insert(record_query, RecordQuery { provider, hits });
                }
            }
            QueryResult::GetProviders(Ok(GetProvidersOk::FinishedWithNoAdditionalRecord {
                ..
            })) => {
                self.provider_queries.remove(&id);
            }
            QueryResult::GetProviders(Err(e)) => {
                debug!("Provider lookup {:?} ended: {:?}", id, e);
                self.provider_queries.remove(&id);
            }
            QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(found))) => {
                if let Some(query) = self.record_queries.remove(&id) {
                    let hit = ProviderHit {
                        peer_id: query.provider.to_string(),
                        record: found.record.value,
                    };
                    if query.hits.try_send(hit).is_err() {
                        debug!("Lookup consumer gone, dropping record of {}", query.provider);
                    }
                    if let Some(mut running) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        running.finish();
                    }
                }
            }
            QueryResult::GetRecord(Ok(GetRecordOk::FinishedWithNoAdditionalRecord { .. })) => {
                self.record_queries.remove(&id);
            }
            QueryResult::GetRecord(Err(e)) => {
                debug!("Capability record lookup {:?} failed: {:?}", id, e);
                self.record_queries.remove(&id);
            }
            QueryResult::PutRecord(Err(e)) => {
                debug!("Capability record not replicated: {:?}", e);
            }
            QueryResult::StartProviding(Err(e)) => {
                debug!("Provider announcement not replicated: {:?}", e);
            }
            QueryResult::Bootstrap(Ok(ok)) => {
                debug!("Kademlia bootstrap step, {} remaining", ok.num_remaining);
            }
            _ => {}
        }

        if step.last {
            self.provider_queries.remove(&id);
            self.record_queries.remove(&id);
        }
    }

    fn handle_negotiation_event(
        &mut self,
        event: request_response::Event<JobOffer, JobOfferResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let handler = self.offer_handler.clone();
                    let replies = self.replies_tx.clone();
                    let cancel = self.cancel.child_token();
                    self.tasks.spawn(async move {
                        let peer_id = peer.to_string();
                        let response = tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!("Dropping offer from {}: node stopping", peer);
                                return;
                            }
                            response = handler.handle_offer(&peer_id, request) => response,
                        };
                        let _ = replies.send((channel, response));
                    });
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    let Some(pending) = self.pending_offers.remove(&request_id) else {
                        warn!("Dropping unmatched offer response from {}", peer);
                        return;
                    };
                    if response.request_id != pending.request_id {
                        warn!(
                            "Offer {} answered by {} with request id {}",
                            pending.request_id, peer, response.request_id
                        );
                        let _ = pending.reply.send(Err(NetworkError::ProtocolViolation(format!(
                            "response request id {} does not match offer {}",
                            response.request_id, pending.request_id
                        ))));
                        return;
                    }
                    let _ = pending.reply.send(Ok(response));
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                if let Some(pending) = self.pending_offers.remove(&request_id) {
                    let err = match error {
                        OutboundFailure::Timeout => NetworkError::Timeout(peer.to_string()),
                        OutboundFailure::DialFailure => NetworkError::DialFailed(peer.to_string()),
                        other => NetworkError::RequestFailed(other.to_string()),
                    };
                    let _ = pending.reply.send(Err(err));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("Inbound offer from {} failed: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn reannounce(&mut self) {
        let Some(record) = self.announced.as_ref().map(|r| r.refreshed()) else {
            return;
        };
        match self
            .swarm
            .behaviour_mut()
            .announce_capabilities(&self.local_peer_id, &record)
        {
            Ok(()) => {
                debug!("Re-announced capabilities");
                self.announced = Some(record);
            }
            Err(e) => warn!("Capability re-announce failed: {}", e),
        }
    }
}

struct NodeInner {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    cancel: CancellationToken,
    tasks: TaskTracker,
    driver: AsyncMutex<Option<JoinHandle<()>>>,
    dial_backoff: AddressBackoff,
}

/// Handle to a running libp2p node
#[derive(Clone)]
pub struct TransportNode {
    inner: Arc<NodeInner>,
}

impl TransportNode {
    /// Build the swarm, start listening and spawn the driver.
    ///
    /// Inbound offers go to `offer_handler`; inbound token streams are served
    /// from `token_source` when one is given.
    pub async fn start(
        keypair: Keypair,
        config: NetworkConfig,
        offer_handler: Arc<dyn OfferHandler>,
        token_source: Option<Arc<dyn TokenSource>>,
    ) -> Result<Self> {
        let local_peer_id = keypair.public().to_peer_id();
        let mut swarm = build_swarm(keypair, &config)?;

        for addr in &config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| NetworkError::TransportError(e.to_string()))?;
        }
        for (peer_id, addr) in &config.bootstrap_peers {
            swarm.behaviour_mut().add_address(peer_id, addr.clone());
        }
        if !config.bootstrap_peers.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                debug!("Kademlia bootstrap not started: {:?}", e);
            }
        }

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let mut control = swarm.behaviour().stream.new_control();
        if let Some(source) = token_source {
            let incoming = control
                .accept(TOKEN_STREAM_PROTOCOL)
                .map_err(|e| NetworkError::StreamError(e.to_string()))?;
            tasks.spawn(serve_token_streams(
                incoming,
                source,
                tasks.clone(),
                cancel.child_token(),
            ));
        }

        let (command_tx, command_rx) = mpsc::channel(256);
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let driver = SwarmDriver {
            swarm,
            local_peer_id,
            commands: command_rx,
            replies_tx,
            replies_rx,
            offer_handler,
            pending_dials: HashMap::new(),
            pending_offers: HashMap::new(),
            provider_queries: HashMap::new(),
            record_queries: HashMap::new(),
            announced: None,
            listen_addrs: Vec::new(),
            cancel: cancel.clone(),
            tasks: tasks.clone(),
        };
        let driver = tokio::spawn(driver.run());
        info!("Transport node {} started", local_peer_id);

        let node = Self {
            inner: Arc::new(NodeInner {
                local_peer_id,
                commands: command_tx,
                control,
                cancel,
                tasks,
                driver: AsyncMutex::new(Some(driver)),
                dial_backoff: AddressBackoff::new(config.dial_backoff.clone()),
            }),
        };

        for (peer_id, addr) in config.bootstrap_peers {
            let dialer = node.clone();
            node.inner.tasks.spawn(async move {
                match dialer.dial_with_backoff(addr.clone()).await {
                    Ok(_) => info!("Connected to bootstrap peer {}", peer_id),
                    Err(e) => warn!("Bootstrap peer {} at {} unreachable: {}", peer_id, addr, e),
                }
            });
        }

        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.local_peer_id
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(NetworkError::NotConnected);
        }
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| NetworkError::NotConnected)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx)).await?;
        rx.await.map_err(|_| NetworkError::NotConnected)
    }

    /// Dial an address once
    pub async fn dial(&self, addr: Multiaddr) -> Result<PeerId> {
        self.request(|reply| Command::Dial { addr, reply }).await?
    }

    /// Dial an address, backing off between failures.
    ///
    /// Each address has its own retry budget. Disconnect ends the loop with
    /// [`NetworkError::Cancelled`].
    pub async fn dial_with_backoff(&self, addr: Multiaddr) -> Result<PeerId> {
        let key = addr.to_string();
        let cancel = self.inner.cancel.clone();

        loop {
            let wait = self.inner.dial_backoff.wait_time(&key);
            if !wait.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(NetworkError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(NetworkError::Cancelled),
                result = self.dial(addr.clone()) => result,
            };

            match result {
                Ok(peer_id) => {
                    self.inner.dial_backoff.record_success(&key);
                    return Ok(peer_id);
                }
                Err(NetworkError::NotConnected) | Err(NetworkError::Cancelled) => {
                    return Err(NetworkError::Cancelled);
                }
                Err(e) => match self.inner.dial_backoff.record_failure(&key) {
                    Some(delay) => debug!("Dial {} failed ({}), next try in {:?}", key, e, delay),
                    None => {
                        return Err(NetworkError::DialFailed(format!(
                            "{} gave up after {} attempts: {}",
                            key,
                            self.inner.dial_backoff.policy().max_attempts(),
                            e
                        )))
                    }
                },
            }
        }
    }

    /// Make addresses known to the swarm for a peer
    pub async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<()> {
        if addrs.is_empty() {
            return Ok(());
        }
        self.send_command(Command::AddAddresses { peer, addrs }).await
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.request(|reply| Command::ListenAddrs { reply }).await
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        self.request(|reply| Command::ConnectedPeers { reply }).await
    }

    /// Stop everything and wait for it
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.cancel.cancel();
        let driver = self.inner.driver.lock().await.take();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        if let Some(driver) = driver {
            driver
                .await
                .map_err(|e| NetworkError::TransportError(e.to_string()))?;
            info!("Transport node {} disconnected", self.inner.local_peer_id);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerNetwork for TransportNode {
    fn local_peer_id(&self) -> String {
        self.inner.local_peer_id.to_string()
    }

    fn is_connected(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    async fn announce(&self, record: CapabilityRecord) -> Result<()> {
        self.request(|reply| Command::Announce { record, reply }).await?
    }

    async fn find_providers(&self, workload: &str) -> Result<mpsc::Receiver<ProviderHit>> {
        let (hits, rx) = mpsc::channel(PROVIDER_HIT_CAPACITY);
        self.send_command(Command::FindProviders {
            workload: workload.to_string(),
            hits,
        })
        .await?;
        Ok(rx)
    }

    async fn send_offer(&self, peer: &PeerRecord, offer: JobOffer) -> Result<JobOfferResponse> {
        let peer_id = parse_peer_id(&peer.peer_id)?;
        self.add_addresses(peer_id, parse_addrs(&peer.addresses)).await?;
        self.request(|reply| Command::SendOffer {
            peer: peer_id,
            offer,
            reply,
        })
        .await?
    }

    async fn open_token_stream(
        &self,
        peer: &PeerRecord,
        open: StreamOpen,
    ) -> Result<mpsc::Receiver<StreamMessage>> {
        let peer_id = parse_peer_id(&peer.peer_id)?;
        self.add_addresses(peer_id, parse_addrs(&peer.addresses)).await?;

        let mut control = self.inner.control.clone();
        let mut stream = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(NetworkError::NotConnected),
            stream = control.open_stream(peer_id, TOKEN_STREAM_PROTOCOL) => {
                stream.map_err(|e| NetworkError::StreamError(e.to_string()))?
            }
        };
        write_json_frame(&mut stream, &open).await?;
        debug!("Opened token stream for job {} with {}", open.job_id, peer_id);

        let (tx, rx) = mpsc::channel(STREAM_FRAME_CAPACITY);
        self.inner.tasks.spawn(read_token_stream(
            peer_id,
            stream,
            tx,
            self.inner.cancel.child_token(),
        ));
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown().await
    }
}

/// Forward frames from a token stream until it ends or the node stops
async fn read_token_stream(
    peer: PeerId,
    mut stream: libp2p::Stream,
    frames: mpsc::Sender<StreamMessage>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = read_frame(&mut stream) => next,
        };
        match next {
            Ok(payload) => match StreamMessage::from_bytes(&payload) {
                Some(message) => {
                    let end = matches!(message, StreamMessage::End(_));
                    if frames.send(message).await.is_err() || end {
                        break;
                    }
                }
                None => warn!("Dropping malformed stream frame from {}", peer),
            },
            Err(e) => {
                debug!("Token stream from {} ended: {}", peer, e);
                break;
            }
        }
    }
    let _ = stream.close().await;
}

async fn serve_token_streams(
    mut incoming: IncomingStreams,
    source: Arc<dyn TokenSource>,
    tasks: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = incoming.next() => next,
        };
        let Some((peer, stream)) = next else { break };
        let source = source.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = serve_token_stream(peer, stream, source, cancel).await {
                debug!("Token stream to {} failed: {}", peer, e);
            }
        });
    }
}

async fn serve_token_stream(
    peer: PeerId,
    mut stream: libp2p::Stream,
    source: Arc<dyn TokenSource>,
    cancel: CancellationToken,
) -> Result<()> {
    let open: StreamOpen = read_json_frame(&mut stream).await?;
    debug!(
        "Serving job {} to {} from index {}",
        open.job_id, peer, open.resume_from
    );
    let started = std::time::Instant::now();

    let mut frames = match source.open(&open.job_id, open.resume_from).await {
        Ok(frames) => frames,
        Err(e) => {
            let summary = StreamSummary {
                total_tokens: 0,
                duration_ms: 0,
                final_status: StreamStatus::Error,
            };
            write_json_frame(&mut stream, &StreamMessage::End(summary)).await?;
            return Err(e);
        }
    };

    let mut sent = 0u64;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if frame.index < open.resume_from {
            continue;
        }
        write_json_frame(&mut stream, &StreamMessage::Token(frame)).await?;
        sent += 1;
    }

    let summary = StreamSummary {
        total_tokens: sent,
        duration_ms: started.elapsed().as_millis() as u64,
        final_status: StreamStatus::Closed,
    };
    write_json_frame(&mut stream, &StreamMessage::End(summary)).await?;
    stream.close().await?;
    Ok(())
}
