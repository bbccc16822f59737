//! # File Transfers
//!
//! Contracts are negotiated over the message layer (SYN → SYN-ACK → ACK, or
//! RST) and then streamed over a TCP connection shared by every contract
//! between the same two nodes.
//!
//! ## Wire format
//!
//! ```text
//! dialer → acceptor : node id (20 bytes)                      once per connection
//! master → follower : contract id (32 bytes)                  per contract
//! holder → receiver : size (20 bytes ASCII, NUL padded) ‖ payload
//! receiver → holder : status (1 byte, 0x01 stored / 0x00 rejected)
//! master → follower : 32 zero bytes                           queue drained
//! ```
//!
//! The master (the side whose UNL sorts higher) decides the order; contracts
//! run strictly one at a time. A broken connection fails the contract that
//! was streaming and returns the rest to the queue for a fresh connection.
//!
//! ## Architecture
//!
//! [`TransferManager`] is a cheap handle; [`TransferProcessor`] owns all
//! contract and connection state and runs the accept loop. Each connection
//! gets its own task that asks the processor for work.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::bandwidth::{BandwidthLimiter, Direction};
use crate::config::TransferConfig;
use crate::contract::{Contract, ContractId, ContractStatus, Role};
use crate::error::{NodeError, RejectReason, Result};
use crate::identity::{ID_LEN, Keypair, NodeId, millis, now_ms};
use crate::messaging::Delivery;
use crate::store::{ShardId, ShardStore};
use crate::unl::{ConnectPlan, Unl, is_master, plan_connection};

const COMMAND_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 256;

const SIZE_FIELD_LEN: usize = 20;
const ACK_STORED: u8 = 0x01;
const ACK_REJECTED: u8 = 0x00;
const QUEUE_DRAINED: ContractId = [0u8; 32];

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const RENDEZVOUS_LEAD: Duration = Duration::from_secs(3);
const RENDEZVOUS_POLL: Duration = Duration::from_millis(500);
const RENDEZVOUS_ATTEMPTS: usize = 3;

// ============================================================================
// Signalling Seam
// ============================================================================

/// How the transfer layer reaches other nodes outside the TCP stream.
#[async_trait]
pub trait TransferSignals: Send + Sync + 'static {
    async fn send_contract(&self, to: NodeId, contract: &Contract) -> Result<()>;

    /// Publish the agreed dial instant (unix ms) for a simultaneous open.
    async fn publish_rendezvous(&self, key: &str, at_ms: u64) -> Result<()>;

    async fn lookup_rendezvous(&self, key: &str) -> Result<Option<u64>>;
}

pub fn rendezvous_key(contract: &ContractId) -> String {
    format!("rendezvous_{}", hex::encode(contract))
}

// ============================================================================
// Public Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Syn,
    SynAck,
    Ack,
    Streaming,
    Done,
    Rejected,
    Expired,
    Failed,
}

#[derive(Clone, Debug)]
pub struct TransferReport {
    pub contract_id: ContractId,
    pub shard: ShardId,
    pub role: Role,
    pub peer: NodeId,
    pub bytes: u64,
    pub started: Instant,
    pub finished: Instant,
}

impl TransferReport {
    pub fn elapsed(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }

    /// Bytes per second over the streaming phase.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64().max(1e-3);
        self.bytes as f64 / secs
    }
}

#[derive(Clone, Debug)]
pub enum TransferEvent {
    /// We accepted a SYN from `peer`.
    Accepted {
        contract_id: ContractId,
        shard: ShardId,
        role: Role,
        peer: NodeId,
    },
    Started {
        contract_id: ContractId,
        shard: ShardId,
        role: Role,
        peer: NodeId,
        at: Instant,
    },
    Completed(TransferReport),
    Failed {
        contract_id: ContractId,
        shard: ShardId,
        role: Role,
        peer: NodeId,
        error: String,
    },
}

impl TransferEvent {
    pub fn contract_id(&self) -> ContractId {
        match self {
            TransferEvent::Accepted { contract_id, .. }
            | TransferEvent::Started { contract_id, .. }
            | TransferEvent::Failed { contract_id, .. } => *contract_id,
            TransferEvent::Completed(report) => report.contract_id,
        }
    }
}

// ============================================================================
// Stream Codec
// ============================================================================

fn encode_size(size: u64) -> [u8; SIZE_FIELD_LEN] {
    let mut field = [0u8; SIZE_FIELD_LEN];
    let digits = size.to_string();
    field[..digits.len()].copy_from_slice(digits.as_bytes());
    field
}

fn decode_size(field: &[u8; SIZE_FIELD_LEN]) -> Result<u64> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(SIZE_FIELD_LEN);
    if field[end..].iter().any(|b| *b != 0) {
        return Err(NodeError::TransferError("size field not NUL padded".into()));
    }
    std::str::from_utf8(&field[..end])
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| NodeError::TransferError("malformed size field".into()))
}

/// Run one stream operation under the idle timeout.
async fn idle<T>(limit: Duration, op: impl Future<Output = std::io::Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, op).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(NodeError::TransferError(e.to_string())),
        Err(_) => Err(NodeError::TransferError("connection idle".into())),
    }
}

/// Stream a shard we hold: size, payload, then wait for the receiver's verdict.
async fn send_shard<S>(
    io: &mut S,
    path: &Path,
    contract: &ContractId,
    bandwidth: &BandwidthLimiter,
    config: &TransferConfig,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut file = fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    idle(config.idle_timeout, io.write_all(&encode_size(size))).await?;

    let mut buf = vec![0u8; config.chunk_size.max(1)];
    let mut remaining = size;
    while remaining > 0 {
        let mut budget = bandwidth.acquire(Direction::Upstream, contract, remaining).await?.min(remaining);
        let mut sent = 0u64;
        while budget > 0 {
            let n = (budget as usize).min(buf.len());
            file.read_exact(&mut buf[..n]).await?;
            idle(config.idle_timeout, io.write_all(&buf[..n])).await?;
            budget -= n as u64;
            sent += n as u64;
        }
        remaining -= sent;
        bandwidth.update(Direction::Upstream, sent, Some(contract));
    }
    idle(config.idle_timeout, io.flush()).await?;

    let mut ack = [0u8; 1];
    idle(config.idle_timeout, io.read_exact(&mut ack)).await?;
    if ack[0] != ACK_STORED {
        return Err(NodeError::RequestDenied(RejectReason::Aborted));
    }
    Ok(size)
}

/// Receive a shard into staging, verify its hash, and import it.
///
/// A hash mismatch deletes the staging file and answers `0x00`.
async fn receive_shard<S>(
    io: &mut S,
    expected: &ShardId,
    declared: u64,
    contract: &ContractId,
    store: &dyn ShardStore,
    bandwidth: &BandwidthLimiter,
    config: &TransferConfig,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut header = [0u8; SIZE_FIELD_LEN];
    idle(config.idle_timeout, io.read_exact(&mut header)).await?;
    let size = decode_size(&header)?;
    if declared != 0 && declared != size {
        return Err(NodeError::TransferError(format!("holder sent {size} bytes, contract says {declared}")));
    }
    let free = store.capacity().free;
    if size > free {
        return Err(NodeError::MemoryError { needed: size, free });
    }

    let staged = store.staging_path();
    let streamed = async {
        let mut file = fs::File::create(&staged).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; config.chunk_size.max(1)];
        let mut remaining = size;
        while remaining > 0 {
            let mut budget = bandwidth.acquire(Direction::Downstream, contract, remaining).await?.min(remaining);
            let mut received = 0u64;
            while budget > 0 {
                let n = (budget as usize).min(buf.len());
                idle(config.idle_timeout, io.read_exact(&mut buf[..n])).await?;
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                budget -= n as u64;
                received += n as u64;
            }
            remaining -= received;
            bandwidth.update(Direction::Downstream, received, Some(contract));
        }
        file.flush().await?;
        Ok::<_, NodeError>(ShardId::from_bytes(hasher.finalize().into()))
    }
    .await;

    let actual = match streamed {
        Ok(id) => id,
        Err(e) => {
            let _ = fs::remove_file(&staged).await;
            return Err(e);
        }
    };

    if &actual != expected {
        let _ = fs::remove_file(&staged).await;
        let _ = idle(config.idle_timeout, io.write_all(&[ACK_REJECTED])).await;
        warn!(expected = %&expected.to_hex()[..16], actual = %&actual.to_hex()[..16], "shard hash mismatch");
        return Err(NodeError::HashMismatch);
    }

    if let Err(e) = store.import(&staged, expected).await {
        let _ = fs::remove_file(&staged).await;
        let _ = idle(config.idle_timeout, io.write_all(&[ACK_REJECTED])).await;
        return Err(e);
    }
    idle(config.idle_timeout, io.write_all(&[ACK_STORED])).await?;
    idle(config.idle_timeout, io.flush()).await?;
    Ok(size)
}

/// Whether the stream is still in sync after a failed contract.
fn stream_survives(error: &NodeError) -> bool {
    matches!(error, NodeError::HashMismatch | NodeError::RequestDenied(_))
}

// ============================================================================
// Handle
// ============================================================================

struct Job {
    id: ContractId,
    shard: ShardId,
    role: Role,
    declared: u64,
}

enum Command {
    Start {
        contract: Contract,
        role: Role,
        reply: oneshot::Sender<Result<TransferReport>>,
    },
    Contract {
        from: NodeId,
        contract: Contract,
    },
    SendFailed {
        id: ContractId,
        error: String,
    },
    Inbound {
        peer: NodeId,
        stream: TcpStream,
    },
    Connected {
        peer: NodeId,
        stream: TcpStream,
    },
    ConnectFailed {
        peer: NodeId,
        error: String,
    },
    NextJob {
        peer: NodeId,
        conn: u64,
        reply: oneshot::Sender<Option<Job>>,
    },
    Claim {
        peer: NodeId,
        conn: u64,
        id: ContractId,
        reply: oneshot::Sender<Option<Job>>,
    },
    Finished {
        id: ContractId,
        conn: u64,
        result: Result<u64>,
    },
    ConnectionClosed {
        peer: NodeId,
        conn: u64,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<(ContractId, TransferState)>>,
    },
}

#[derive(Clone)]
pub struct TransferManager {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<TransferEvent>,
    keypair: Keypair,
    local: Unl,
    store: Arc<dyn ShardStore>,
}

impl TransferManager {
    pub fn new(
        keypair: Keypair,
        local: Unl,
        listener: TcpListener,
        store: Arc<dyn ShardStore>,
        bandwidth: Arc<BandwidthLimiter>,
        signals: Arc<dyn TransferSignals>,
        config: TransferConfig,
    ) -> (Self, TransferProcessor) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let manager = Self {
            cmd_tx: cmd_tx.clone(),
            events: events.clone(),
            keypair: keypair.clone(),
            local,
            store: store.clone(),
        };
        let processor = TransferProcessor {
            listener,
            cmd_rx,
            state: Transfers {
                keypair,
                local,
                store,
                bandwidth,
                signals,
                config,
                events,
                cmd_tx,
                contracts: HashMap::new(),
                queues: HashMap::new(),
                parked: HashMap::new(),
                connections: HashMap::new(),
                connecting: HashSet::new(),
                peers: HashMap::new(),
                next_conn: 1,
            },
        };
        (manager, processor)
    }

    pub fn local_unl(&self) -> &Unl {
        &self.local
    }

    pub fn store(&self) -> &Arc<dyn ShardStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Send a shard we hold to `remote` and wait until it is stored there.
    pub async fn upload(&self, remote: &Unl, shard: ShardId) -> Result<TransferReport> {
        let size = self
            .store
            .size_of(&shard)
            .await
            .ok_or(NodeError::RequestDenied(RejectReason::MissingShard))?;
        let contract = Contract::syn(&shard, size, &self.local, remote, &self.local).sign(&self.keypair)?;
        self.start(contract, Role::Send).await
    }

    /// Fetch a shard held by `remote` into the local store.
    pub async fn download(&self, remote: &Unl, shard: ShardId) -> Result<TransferReport> {
        if self.store.find(&shard).await.is_some() {
            return Err(NodeError::RequestDenied(RejectReason::AlreadyStored));
        }
        let contract = Contract::syn(&shard, 0, remote, remote, &self.local).sign(&self.keypair)?;
        self.start(contract, Role::Receive).await
    }

    async fn start(&self, contract: Contract, role: Role) -> Result<TransferReport> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start { contract, role, reply })
            .await
            .map_err(|_| NodeError::Cancelled)?;
        rx.await.map_err(|_| NodeError::Cancelled)?
    }

    /// Feed a contract received from the message layer.
    pub async fn handle_contract(&self, from: NodeId, contract: Contract) {
        let _ = self.cmd_tx.send(Command::Contract { from, contract }).await;
    }

    pub async fn transfers(&self) -> Vec<(ContractId, TransferState)> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

// ============================================================================
// Processor
// ============================================================================

struct PendingContract {
    contract: Contract,
    shard: ShardId,
    role: Role,
    peer: Unl,
    initiator: bool,
    state: TransferState,
    changed_at: Instant,
    conn: Option<u64>,
    started: Option<Instant>,
    result: Option<oneshot::Sender<Result<TransferReport>>>,
}

struct Connection {
    id: u64,
    abort: AbortHandle,
}

pub struct TransferProcessor {
    listener: TcpListener,
    cmd_rx: mpsc::Receiver<Command>,
    state: Transfers,
}

impl TransferProcessor {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let sweep_every = SWEEP_INTERVAL.min(self.state.config.handshake_expiry / 2).max(Duration::from_millis(10));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(addr = ?self.listener.local_addr().ok(), "transfer processor started");

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.state.handle(cmd).await,
                    None => break,
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.state.spawn_preamble_reader(stream, addr),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = sweep.tick() => self.state.sweep(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.state.shutdown();
        debug!("transfer processor stopped");
    }
}

struct Transfers {
    keypair: Keypair,
    local: Unl,
    store: Arc<dyn ShardStore>,
    bandwidth: Arc<BandwidthLimiter>,
    signals: Arc<dyn TransferSignals>,
    config: TransferConfig,
    events: broadcast::Sender<TransferEvent>,
    cmd_tx: mpsc::Sender<Command>,
    contracts: HashMap<ContractId, PendingContract>,
    /// Contracts waiting for a connection, per peer; only kept on the master side.
    queues: HashMap<NodeId, VecDeque<ContractId>>,
    /// A master connection task waiting for its next contract.
    parked: HashMap<NodeId, (u64, oneshot::Sender<Option<Job>>)>,
    connections: HashMap<NodeId, Connection>,
    connecting: HashSet<NodeId>,
    peers: HashMap<NodeId, Unl>,
    next_conn: u64,
}

fn direction_of(role: Role) -> Direction {
    match role {
        Role::Send => Direction::Upstream,
        Role::Receive => Direction::Downstream,
    }
}

impl Transfers {
    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start { contract, role, reply } => self.start(contract, role, reply),
            Command::Contract { from, contract } => self.on_contract(from, contract).await,
            Command::SendFailed { id, error } => {
                if self.contracts.get(&id).is_some_and(|p| p.state == TransferState::Syn) {
                    self.finish(id, Err(NodeError::Unreachable(error)));
                } else {
                    debug!(contract = %hex::encode(&id[..8]), %error, "contract reply not delivered");
                }
            }
            Command::Inbound { peer, stream } => {
                if self.peers.contains_key(&peer) {
                    self.register_connection(peer, stream);
                } else {
                    debug!(peer = %peer.short(), "inbound connection from unknown peer");
                }
            }
            Command::Connected { peer, stream } => {
                self.connecting.remove(&peer);
                self.register_connection(peer, stream);
            }
            Command::ConnectFailed { peer, error } => {
                self.connecting.remove(&peer);
                self.fail_waiting(&peer, &error);
            }
            Command::NextJob { peer, conn, reply } => {
                if self.connections.get(&peer).is_some_and(|c| c.id == conn) {
                    match self.pop_job(&peer, conn) {
                        Some(job) => self.hand_out(job, reply),
                        None => {
                            self.parked.insert(peer, (conn, reply));
                        }
                    }
                } else {
                    let _ = reply.send(None);
                }
            }
            Command::Claim { peer, conn, id, reply } => {
                let claimable = self.contracts.get(&id).is_some_and(|p| {
                    p.peer.node_id == peer && matches!(p.state, TransferState::SynAck | TransferState::Ack)
                });
                let job = claimable.then(|| self.start_job(id, conn)).flatten();
                if job.is_none() {
                    warn!(peer = %peer.short(), contract = %hex::encode(&id[..8]), "unknown contract on connection");
                }
                let _ = reply.send(job);
            }
            Command::Finished { id, conn, result } => {
                if self.contracts.get(&id).is_some_and(|p| p.conn == Some(conn)) {
                    self.finish(id, result);
                }
            }
            Command::ConnectionClosed { peer, conn } => self.connection_closed(peer, conn),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.contracts.iter().map(|(id, p)| (*id, p.state)).collect());
            }
        }
    }

    fn downloading(&self) -> HashSet<ShardId> {
        self.contracts
            .values()
            .filter(|p| p.role == Role::Receive)
            .map(|p| p.shard)
            .collect()
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    fn start(&mut self, contract: Contract, role: Role, reply: oneshot::Sender<Result<TransferReport>>) {
        let id = contract.contract_id();
        if self.contracts.contains_key(&id) {
            let _ = reply.send(Err(NodeError::Busy("transfer already pending")));
            return;
        }
        let Some(shard) = contract.shard_id() else {
            let _ = reply.send(Err(NodeError::InvalidContract("data id".into())));
            return;
        };
        if role == Role::Receive && self.downloading().contains(&shard) {
            let _ = reply.send(Err(NodeError::RequestDenied(RejectReason::AlreadyDownloading)));
            return;
        }
        let peer = match contract.counterparty(&self.local.node_id) {
            Ok(peer) => peer,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        debug!(contract = %hex::encode(&id[..8]), peer = %peer.node_id.short(), ?role, "sending SYN");
        self.send_contract(id, peer.node_id, contract.clone());
        self.peers.insert(peer.node_id, peer);
        self.contracts.insert(
            id,
            PendingContract {
                contract,
                shard,
                role,
                peer,
                initiator: true,
                state: TransferState::Syn,
                changed_at: Instant::now(),
                conn: None,
                started: None,
                result: Some(reply),
            },
        );
    }

    fn send_contract(&self, id: ContractId, to: NodeId, contract: Contract) {
        let signals = self.signals.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = signals.send_contract(to, &contract).await {
                let _ = cmd_tx
                    .send(Command::SendFailed {
                        id,
                        error: e.to_string(),
                    })
                    .await;
            }
        });
    }

    fn reply_with(&self, id: ContractId, to: NodeId, contract: &Contract, status: ContractStatus) {
        match contract.reply(status, &self.keypair) {
            Ok(reply) => self.send_contract(id, to, reply),
            Err(e) => warn!(error = %e, "failed to sign contract reply"),
        }
    }

    async fn on_contract(&mut self, from: NodeId, contract: Contract) {
        match contract.signer() {
            Ok(signer) if signer == from => {}
            _ => {
                debug!(from = %from.short(), "contract signature does not match sender");
                return;
            }
        }
        let id = contract.contract_id();
        match contract.status {
            ContractStatus::Syn => self.on_syn(from, id, contract).await,
            ContractStatus::SynAck => {
                let expected = self.contracts.get(&id).is_some_and(|p| {
                    p.initiator && p.state == TransferState::Syn && p.peer.node_id == from
                });
                if expected {
                    self.reply_with(id, from, &contract, ContractStatus::Ack);
                    self.advance(id, TransferState::Ack);
                    self.begin_connection(id);
                } else {
                    trace!(contract = %hex::encode(&id[..8]), "unexpected SYN-ACK");
                }
            }
            ContractStatus::Ack => {
                let expected = self.contracts.get(&id).is_some_and(|p| {
                    !p.initiator && p.state == TransferState::SynAck && p.peer.node_id == from
                });
                if expected {
                    self.advance(id, TransferState::Ack);
                    self.begin_connection(id);
                } else {
                    trace!(contract = %hex::encode(&id[..8]), "unexpected ACK");
                }
            }
            ContractStatus::Rst(reason) => self.on_rst(from, id, reason),
        }
    }

    async fn on_syn(&mut self, from: NodeId, id: ContractId, contract: Contract) {
        if self.contracts.contains_key(&id) {
            trace!(contract = %hex::encode(&id[..8]), "duplicate SYN");
            return;
        }
        let downloading = self.downloading();
        let validated = contract
            .is_valid_syn(&self.local, self.store.as_ref(), &downloading, self.config.max_contract_size)
            .await;
        let (role, peer, shard) = match validated.and_then(|role| {
            let peer = contract.counterparty(&self.local.node_id).map_err(|_| RejectReason::InvalidUnl)?;
            let shard = contract.shard_id().ok_or(RejectReason::InvalidDataId)?;
            Ok((role, peer, shard))
        }) {
            Ok(accepted) => accepted,
            Err(reason) => {
                info!(from = %from.short(), %reason, "rejecting transfer");
                self.reply_with(id, from, &contract, ContractStatus::Rst(reason));
                return;
            }
        };

        debug!(contract = %hex::encode(&id[..8]), peer = %from.short(), ?role, "accepted SYN");
        self.reply_with(id, from, &contract, ContractStatus::SynAck);
        // The master may connect before our SYN-ACK's ACK comes back.
        self.peers.insert(peer.node_id, peer);
        self.contracts.insert(
            id,
            PendingContract {
                contract,
                shard,
                role,
                peer,
                initiator: false,
                state: TransferState::SynAck,
                changed_at: Instant::now(),
                conn: None,
                started: None,
                result: None,
            },
        );
        self.emit(TransferEvent::Accepted {
            contract_id: id,
            shard,
            role,
            peer: from,
        });
    }

    fn on_rst(&mut self, from: NodeId, id: ContractId, reason: RejectReason) {
        let Some(p) = self.contracts.get(&id) else {
            return;
        };
        if p.peer.node_id != from {
            return;
        }
        if p.state == TransferState::Streaming
            && let Some(conn) = p.conn
        {
            info!(contract = %hex::encode(&id[..8]), %reason, "peer aborted streaming transfer");
            self.finish_as(id, TransferState::Rejected, Err(NodeError::RequestDenied(reason)));
            if let Some(c) = self.connections.get(&from)
                && c.id == conn
            {
                c.abort.abort();
                self.connection_closed(from, conn);
            }
            return;
        }
        self.finish_as(id, TransferState::Rejected, Err(NodeError::RequestDenied(reason)));
    }

    fn advance(&mut self, id: ContractId, state: TransferState) {
        if let Some(p) = self.contracts.get_mut(&id) {
            p.state = state;
            p.changed_at = Instant::now();
        }
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    fn begin_connection(&mut self, id: ContractId) {
        let Some(p) = self.contracts.get(&id) else {
            return;
        };
        let peer = p.peer;
        let plan = plan_connection(&self.local, &peer);
        if plan == ConnectPlan::NoPath {
            self.finish(id, Err(NodeError::NoPath));
            return;
        }
        self.peers.insert(peer.node_id, peer);
        if is_master(&self.local, &peer) {
            self.queues.entry(peer.node_id).or_default().push_back(id);
        }
        self.ensure_connection(peer.node_id, plan, id);
        self.feed_parked(&peer.node_id);
    }

    fn ensure_connection(&mut self, peer: NodeId, plan: ConnectPlan, contract: ContractId) {
        if self.connections.contains_key(&peer) || self.connecting.contains(&peer) {
            return;
        }
        let me = self.local.node_id;
        let cmd_tx = self.cmd_tx.clone();
        match plan {
            ConnectPlan::Dial { addr } => {
                self.connecting.insert(peer);
                tokio::spawn(async move {
                    let command = match dial(addr, me).await {
                        Ok(stream) => Command::Connected { peer, stream },
                        Err(e) => Command::ConnectFailed {
                            peer,
                            error: e.to_string(),
                        },
                    };
                    let _ = cmd_tx.send(command).await;
                });
            }
            ConnectPlan::Rendezvous { addr, master } => {
                self.connecting.insert(peer);
                let signals = self.signals.clone();
                let local_port = self.local.passive_port;
                let wait = self.config.handshake_expiry;
                tokio::spawn(async move {
                    let outcome = rendezvous(signals, contract, addr, local_port, me, peer, master, wait).await;
                    let command = match outcome {
                        Ok(stream) => Command::Connected { peer, stream },
                        Err(e) => Command::ConnectFailed {
                            peer,
                            error: e.to_string(),
                        },
                    };
                    let _ = cmd_tx.send(command).await;
                });
            }
            ConnectPlan::Listen => trace!(peer = %peer.short(), "waiting for inbound connection"),
            ConnectPlan::NoPath => {}
        }
    }

    fn spawn_preamble_reader(&self, mut stream: TcpStream, addr: SocketAddr) {
        let cmd_tx = self.cmd_tx.clone();
        let limit = self.config.idle_timeout;
        tokio::spawn(async move {
            let mut preamble = [0u8; ID_LEN];
            match tokio::time::timeout(limit, stream.read_exact(&mut preamble)).await {
                Ok(Ok(_)) => {
                    let peer = NodeId::from_bytes(preamble);
                    trace!(%addr, peer = %peer.short(), "inbound transfer connection");
                    let _ = cmd_tx.send(Command::Inbound { peer, stream }).await;
                }
                _ => debug!(%addr, "inbound connection sent no preamble"),
            }
        });
    }

    fn register_connection(&mut self, peer: NodeId, stream: TcpStream) {
        if self.connections.contains_key(&peer) {
            debug!(peer = %peer.short(), "dropping duplicate connection");
            return;
        }
        let Some(remote) = self.peers.get(&peer) else {
            return;
        };
        let conn = self.next_conn;
        self.next_conn += 1;
        let master = is_master(&self.local, remote);
        let ctx = ConnectionContext {
            cmd_tx: self.cmd_tx.clone(),
            store: self.store.clone(),
            bandwidth: self.bandwidth.clone(),
            config: self.config.clone(),
            peer,
            conn,
        };
        let task = tokio::spawn(run_connection(ctx, stream, master));
        self.connections.insert(
            peer,
            Connection {
                id: conn,
                abort: task.abort_handle(),
            },
        );
        debug!(peer = %peer.short(), conn, master, "transfer connection up");
    }

    fn connection_closed(&mut self, peer: NodeId, conn: u64) {
        if self.connections.get(&peer).is_some_and(|c| c.id == conn) {
            self.connections.remove(&peer);
        }
        if self.parked.get(&peer).is_some_and(|(c, _)| *c == conn) {
            self.parked.remove(&peer);
        }

        // Contracts caught mid-flight go back to the front of the queue.
        let master = self.peers.get(&peer).is_some_and(|remote| is_master(&self.local, remote));
        let interrupted: Vec<ContractId> = self
            .contracts
            .iter()
            .filter(|(_, p)| p.conn == Some(conn) && p.state == TransferState::Streaming)
            .map(|(id, _)| *id)
            .collect();
        for id in interrupted {
            if let Some(p) = self.contracts.get_mut(&id) {
                self.bandwidth.remove_transfer(direction_of(p.role), &id);
                p.state = TransferState::Ack;
                p.conn = None;
                p.changed_at = Instant::now();
            }
            if master {
                self.queues.entry(peer).or_default().push_front(id);
            }
        }

        let waiting = self
            .contracts
            .iter()
            .find(|(_, p)| p.peer.node_id == peer && p.state == TransferState::Ack)
            .map(|(id, p)| (*id, p.peer));
        if let Some((id, remote)) = waiting {
            debug!(peer = %peer.short(), "re-queueing transfers on a fresh connection");
            self.ensure_connection(peer, plan_connection(&self.local, &remote), id);
        }
    }

    fn fail_waiting(&mut self, peer: &NodeId, error: &str) {
        warn!(peer = %peer.short(), %error, "transfer connection failed");
        self.queues.remove(peer);
        let waiting: Vec<ContractId> = self
            .contracts
            .iter()
            .filter(|(_, p)| &p.peer.node_id == peer && p.state == TransferState::Ack)
            .map(|(id, _)| *id)
            .collect();
        for id in waiting {
            self.finish(id, Err(NodeError::Unreachable(error.to_string())));
        }
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    fn pop_job(&mut self, peer: &NodeId, conn: u64) -> Option<Job> {
        loop {
            let id = self.queues.get_mut(peer)?.pop_front()?;
            if self.contracts.get(&id).is_some_and(|p| p.state == TransferState::Ack)
                && let Some(job) = self.start_job(id, conn)
            {
                return Some(job);
            }
        }
    }

    fn hand_out(&mut self, job: Job, reply: oneshot::Sender<Option<Job>>) {
        if let Err(Some(job)) = reply.send(Some(job)) {
            // The connection task gave up waiting.
            if let Some(p) = self.contracts.get_mut(&job.id) {
                self.bandwidth.remove_transfer(direction_of(p.role), &job.id);
                p.state = TransferState::Ack;
                p.conn = None;
                let peer = p.peer.node_id;
                self.queues.entry(peer).or_default().push_front(job.id);
            }
        }
    }

    fn feed_parked(&mut self, peer: &NodeId) {
        let Some((conn, reply)) = self.parked.remove(peer) else {
            return;
        };
        match self.pop_job(peer, conn) {
            Some(job) => self.hand_out(job, reply),
            None => {
                self.parked.insert(*peer, (conn, reply));
            }
        }
    }

    fn start_job(&mut self, id: ContractId, conn: u64) -> Option<Job> {
        let p = self.contracts.get_mut(&id)?;
        let now = Instant::now();
        p.state = TransferState::Streaming;
        p.changed_at = now;
        p.conn = Some(conn);
        p.started = Some(now);
        self.bandwidth.register_transfer(direction_of(p.role), id);
        let job = Job {
            id,
            shard: p.shard,
            role: p.role,
            declared: p.contract.file_size,
        };
        let event = TransferEvent::Started {
            contract_id: id,
            shard: p.shard,
            role: p.role,
            peer: p.peer.node_id,
            at: now,
        };
        self.emit(event);
        Some(job)
    }

    fn finish(&mut self, id: ContractId, result: Result<u64>) {
        let state = if result.is_ok() {
            TransferState::Done
        } else {
            TransferState::Failed
        };
        self.finish_as(id, state, result);
    }

    fn finish_as(&mut self, id: ContractId, state: TransferState, result: Result<u64>) {
        let Some(mut p) = self.contracts.remove(&id) else {
            return;
        };
        p.state = state;
        self.bandwidth.remove_transfer(direction_of(p.role), &id);
        let peer = p.peer.node_id;
        let outcome = match result {
            Ok(bytes) => {
                let finished = Instant::now();
                let report = TransferReport {
                    contract_id: id,
                    shard: p.shard,
                    role: p.role,
                    peer,
                    bytes,
                    started: p.started.unwrap_or(finished),
                    finished,
                };
                info!(
                    contract = %hex::encode(&id[..8]),
                    peer = %peer.short(),
                    role = ?p.role,
                    bytes,
                    "transfer complete"
                );
                self.emit(TransferEvent::Completed(report.clone()));
                Ok(report)
            }
            Err(e) => {
                info!(contract = %hex::encode(&id[..8]), peer = %peer.short(), ?state, error = %e, "transfer ended");
                self.emit(TransferEvent::Failed {
                    contract_id: id,
                    shard: p.shard,
                    role: p.role,
                    peer,
                    error: e.to_string(),
                });
                Err(e)
            }
        };
        if let Some(tx) = p.result.take() {
            let _ = tx.send(outcome);
        }
    }

    /// Expire contracts stuck before streaming.
    fn sweep(&mut self) {
        let expiry = self.config.handshake_expiry;
        let expired: Vec<ContractId> = self
            .contracts
            .iter()
            .filter(|(_, p)| p.state != TransferState::Streaming && p.changed_at.elapsed() >= expiry)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.finish_as(id, TransferState::Expired, Err(NodeError::Timeout));
        }
    }

    fn shutdown(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.abort.abort();
        }
        let ids: Vec<ContractId> = self.contracts.keys().copied().collect();
        for id in ids {
            self.finish_as(id, TransferState::Failed, Err(NodeError::Cancelled));
        }
    }
}

// ============================================================================
// Connection Tasks
// ============================================================================

async fn dial(addr: SocketAddr, me: NodeId) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| NodeError::Timeout)??;
    stream.set_nodelay(true)?;
    stream.write_all(me.as_bytes()).await?;
    Ok(stream)
}

/// Simultaneous open: both sides dial from their passive port at an agreed instant.
#[allow(clippy::too_many_arguments)]
async fn rendezvous(
    signals: Arc<dyn TransferSignals>,
    contract: ContractId,
    addr: SocketAddr,
    local_port: u16,
    me: NodeId,
    peer: NodeId,
    master: bool,
    wait: Duration,
) -> Result<TcpStream> {
    let key = rendezvous_key(&contract);
    let at_ms = if master {
        let at = now_ms() + millis(RENDEZVOUS_LEAD);
        signals.publish_rendezvous(&key, at).await?;
        at
    } else {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(at) = signals.lookup_rendezvous(&key).await? {
                break at;
            }
            if Instant::now() >= deadline {
                return Err(NodeError::Timeout);
            }
            tokio::time::sleep(RENDEZVOUS_POLL).await;
        }
    };
    tokio::time::sleep(Duration::from_millis(at_ms.saturating_sub(now_ms()))).await;

    let attempts = if master { RENDEZVOUS_ATTEMPTS } else { 1 };
    let mut last_error = NodeError::Timeout;
    for attempt in 0..attempts {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], local_port)))?;
        match tokio::time::timeout(DIAL_TIMEOUT, socket.connect(addr)).await {
            Ok(Ok(mut stream)) => {
                stream.write_all(me.as_bytes()).await?;
                let mut preamble = [0u8; ID_LEN];
                stream.read_exact(&mut preamble).await?;
                if NodeId::from_bytes(preamble) != peer {
                    return Err(NodeError::TransferError("rendezvous with the wrong peer".into()));
                }
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = e.into(),
            Err(_) => last_error = NodeError::Timeout,
        }
        debug!(attempt, %addr, "simultaneous open failed");
    }
    Err(last_error)
}

struct ConnectionContext {
    cmd_tx: mpsc::Sender<Command>,
    store: Arc<dyn ShardStore>,
    bandwidth: Arc<BandwidthLimiter>,
    config: TransferConfig,
    peer: NodeId,
    conn: u64,
}

impl ConnectionContext {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<oneshot::Receiver<T>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.ok()?;
        Some(rx)
    }

    async fn run_job(&self, stream: &mut TcpStream, job: &Job) -> Result<u64> {
        match job.role {
            Role::Send => {
                let path = self
                    .store
                    .find(&job.shard)
                    .await
                    .ok_or_else(|| NodeError::TransferError("shard vanished before upload".into()))?;
                send_shard(stream, &path, &job.id, &self.bandwidth, &self.config).await
            }
            Role::Receive => {
                receive_shard(
                    stream,
                    &job.shard,
                    job.declared,
                    &job.id,
                    self.store.as_ref(),
                    &self.bandwidth,
                    &self.config,
                )
                .await
            }
        }
    }

    /// Report a finished contract; returns whether the stream is still usable.
    async fn finished(&self, id: ContractId, result: Result<u64>) -> bool {
        let usable = match &result {
            Ok(_) => true,
            Err(e) => stream_survives(e),
        };
        let _ = self
            .cmd_tx
            .send(Command::Finished {
                id,
                conn: self.conn,
                result,
            })
            .await;
        usable
    }

    async fn lead(&self, stream: &mut TcpStream) -> Result<()> {
        loop {
            let Some(rx) = self
                .request(|reply| Command::NextJob {
                    peer: self.peer,
                    conn: self.conn,
                    reply,
                })
                .await
            else {
                return Ok(());
            };
            let job = match tokio::time::timeout(self.config.idle_timeout, rx).await {
                Ok(Ok(Some(job))) => job,
                Ok(_) => return Ok(()),
                Err(_) => {
                    idle(self.config.idle_timeout, stream.write_all(&QUEUE_DRAINED)).await?;
                    return Ok(());
                }
            };

            let result = match idle(self.config.idle_timeout, stream.write_all(&job.id)).await {
                Ok(()) => self.run_job(stream, &job).await,
                Err(e) => Err(e),
            };
            if !self.finished(job.id, result).await {
                return Err(NodeError::TransferError("stream broken".into()));
            }
        }
    }

    async fn follow(&self, stream: &mut TcpStream) -> Result<()> {
        loop {
            let mut id = [0u8; 32];
            // The master only gives up after its own idle timeout; wait a little longer.
            match tokio::time::timeout(self.config.idle_timeout * 2, stream.read_exact(&mut id)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(()),
            }
            if id == QUEUE_DRAINED {
                trace!(peer = %self.peer.short(), "peer drained its queue");
                return Ok(());
            }

            let Some(rx) = self
                .request(|reply| Command::Claim {
                    peer: self.peer,
                    conn: self.conn,
                    id,
                    reply,
                })
                .await
            else {
                return Ok(());
            };
            let Ok(Some(job)) = rx.await else {
                return Ok(());
            };
            let result = self.run_job(stream, &job).await;
            if !self.finished(job.id, result).await {
                return Err(NodeError::TransferError("stream broken".into()));
            }
        }
    }
}

async fn run_connection(ctx: ConnectionContext, mut stream: TcpStream, master: bool) {
    let outcome = if master {
        ctx.lead(&mut stream).await
    } else {
        ctx.follow(&mut stream).await
    };
    if let Err(e) = outcome {
        debug!(peer = %ctx.peer.short(), conn = ctx.conn, error = %e, "transfer connection closed");
    }
    let _ = ctx
        .cmd_tx
        .send(Command::ConnectionClosed {
            peer: ctx.peer,
            conn: ctx.conn,
        })
        .await;
}

// ============================================================================
// Contract Pump
// ============================================================================

/// Drains contract messages from the message layer into the processor.
pub struct ContractPump {
    rx: mpsc::Receiver<Delivery>,
    manager: TransferManager,
    max_size: usize,
}

impl ContractPump {
    pub fn new(rx: mpsc::Receiver<Delivery>, manager: TransferManager, max_size: usize) -> Self {
        Self { rx, manager, max_size }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                delivery = self.rx.recv() => {
                    let Some(delivery) = delivery else { break };
                    match Contract::decode(&delivery.body, self.max_size) {
                        Ok(contract) => self.manager.handle_contract(delivery.sender, contract).await,
                        Err(e) => debug!(from = %delivery.sender.short(), error = %e, "undecodable contract"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BandwidthConfig;
    use crate::store::{FsShardStore, Layout};
    use crate::unl::{ForwardingType, NatType, NodeType};
    use parking_lot::{Mutex, RwLock};
    use std::net::Ipv4Addr;

    #[test]
    fn size_field_codec() {
        let field = encode_size(4096);
        assert_eq!(&field[..4], b"4096");
        assert!(field[4..].iter().all(|b| *b == 0));
        assert_eq!(decode_size(&field).expect("decode"), 4096);
        assert_eq!(decode_size(&encode_size(0)).expect("zero"), 0);
        assert_eq!(decode_size(&encode_size(u64::MAX)).expect("max"), u64::MAX);

        let mut bad = encode_size(12);
        bad[5] = b'7';
        assert!(decode_size(&bad).is_err());
        assert!(decode_size(&[0u8; SIZE_FIELD_LEN]).is_err());
    }

    fn unlimited() -> Arc<BandwidthLimiter> {
        Arc::new(BandwidthLimiter::new(&BandwidthConfig::default()).expect("limiter"))
    }

    #[tokio::test]
    async fn corrupted_payload_is_rejected_and_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsShardStore::open(dir.path(), 0, Layout::Flat).await.expect("open");
        let payload = vec![0x5au8; 4096];
        let id = ShardId::of(&payload);
        let bandwidth = unlimited();
        let config = TransferConfig::default();

        let (mut holder, mut receiver) = tokio::io::duplex(64 * 1024);
        let mut corrupted = payload.clone();
        corrupted[100] ^= 0xff;
        holder.write_all(&encode_size(4096)).await.expect("size");
        holder.write_all(&corrupted).await.expect("payload");

        let err = receive_shard(&mut receiver, &id, 4096, &[9u8; 32], store.as_ref(), &bandwidth, &config)
            .await
            .expect_err("mismatch");
        assert!(matches!(err, NodeError::HashMismatch));

        let mut ack = [0xffu8; 1];
        holder.read_exact(&mut ack).await.expect("ack");
        assert_eq!(ack[0], ACK_REJECTED);
        assert!(store.find(&id).await.is_none());
        let mut staged = fs::read_dir(dir.path().join("tmp")).await.expect("tmp");
        assert!(staged.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn send_and_receive_over_a_pipe() {
        let src_dir = tempfile::tempdir().expect("tempdir");
        let dst_dir = tempfile::tempdir().expect("tempdir");
        let src = FsShardStore::open(src_dir.path(), 0, Layout::Flat).await.expect("open");
        let dst = FsShardStore::open(dst_dir.path(), 0, Layout::Fanout).await.expect("open");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let id = src.add_bytes(&payload).await.expect("add");
        let path = src.find(&id).await.expect("path");
        let bandwidth = unlimited();
        let config = TransferConfig {
            chunk_size: 4096,
            ..TransferConfig::default()
        };

        let (mut a, mut b) = tokio::io::duplex(8 * 1024);
        let contract = [1u8; 32];
        let (sent, received) = tokio::join!(
            send_shard(&mut a, &path, &contract, &bandwidth, &config),
            receive_shard(&mut b, &id, 0, &contract, dst.as_ref(), &bandwidth, &config),
        );
        assert_eq!(sent.expect("sent"), payload.len() as u64);
        assert_eq!(received.expect("received"), payload.len() as u64);
        let stored = dst.find(&id).await.expect("stored");
        assert_eq!(fs::read(stored).await.expect("read"), payload);
    }

    // ------------------------------------------------------------------------
    // Two managers wired through an in-memory signalling hub
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct Hub {
        managers: RwLock<HashMap<NodeId, TransferManager>>,
        board: Mutex<HashMap<String, u64>>,
    }

    struct HubSignals {
        me: NodeId,
        hub: Arc<Hub>,
    }

    #[async_trait]
    impl TransferSignals for HubSignals {
        async fn send_contract(&self, to: NodeId, contract: &Contract) -> Result<()> {
            let manager = self
                .hub
                .managers
                .read()
                .get(&to)
                .cloned()
                .ok_or_else(|| NodeError::Unreachable(to.short()))?;
            manager.handle_contract(self.me, contract.clone()).await;
            Ok(())
        }

        async fn publish_rendezvous(&self, key: &str, at_ms: u64) -> Result<()> {
            self.hub.board.lock().insert(key.to_string(), at_ms);
            Ok(())
        }

        async fn lookup_rendezvous(&self, key: &str) -> Result<Option<u64>> {
            Ok(self.hub.board.lock().get(key).copied())
        }
    }

    struct Peer {
        manager: TransferManager,
        store: Arc<FsShardStore>,
        _dir: tempfile::TempDir,
    }

    async fn spawn_peer(hub: &Arc<Hub>, config: TransferConfig, shutdown: &watch::Receiver<bool>) -> Peer {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsShardStore::open(dir.path(), 0, Layout::Flat).await.expect("open");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let keypair = Keypair::generate();
        let loopback = Ipv4Addr::LOCALHOST;
        let unl = Unl::new(
            keypair.node_id(),
            NodeType::Passive,
            NatType::Preserving,
            ForwardingType::Manual,
            port,
            loopback,
            loopback,
        );
        let signals = Arc::new(HubSignals {
            me: keypair.node_id(),
            hub: hub.clone(),
        });
        let (manager, processor) = TransferManager::new(
            keypair.clone(),
            unl,
            listener,
            store.clone(),
            unlimited(),
            signals,
            config,
        );
        tokio::spawn(processor.run(shutdown.clone()));
        hub.managers.write().insert(keypair.node_id(), manager.clone());
        Peer {
            manager,
            store,
            _dir: dir,
        }
    }

    const WAIT: Duration = Duration::from_secs(20);

    #[tokio::test]
    async fn upload_then_download_roundtrip() {
        let hub = Arc::new(Hub::default());
        let (_stop_tx, stop) = watch::channel(false);
        let alice = spawn_peer(&hub, TransferConfig::default(), &stop).await;
        let bob = spawn_peer(&hub, TransferConfig::default(), &stop).await;

        let payload: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let id = alice.store.add_bytes(&payload).await.expect("add");

        let report = tokio::time::timeout(WAIT, alice.manager.upload(bob.manager.local_unl(), id))
            .await
            .expect("upload in time")
            .expect("upload");
        assert_eq!(report.bytes, payload.len() as u64);
        assert_eq!(report.role, Role::Send);
        assert!(bob.store.find(&id).await.is_some());

        alice.store.remove(&id).await.expect("remove");
        let report = tokio::time::timeout(WAIT, alice.manager.download(bob.manager.local_unl(), id))
            .await
            .expect("download in time")
            .expect("download");
        assert_eq!(report.role, Role::Receive);
        let path = alice.store.find(&id).await.expect("downloaded");
        assert_eq!(crate::store::hash_file(&path).await.expect("hash"), id);
    }

    #[tokio::test]
    async fn queued_contracts_share_one_connection() {
        let hub = Arc::new(Hub::default());
        let (_stop_tx, stop) = watch::channel(false);
        let alice = spawn_peer(&hub, TransferConfig::default(), &stop).await;
        let bob = spawn_peer(&hub, TransferConfig::default(), &stop).await;

        let mut ids = Vec::new();
        for i in 0..4u8 {
            ids.push(alice.store.add_bytes(&vec![i; 10_000 + i as usize]).await.expect("add"));
        }
        let bob_unl = *bob.manager.local_unl();
        let uploads = ids.iter().map(|id| {
            let manager = alice.manager.clone();
            let id = *id;
            async move { manager.upload(&bob_unl, id).await }
        });
        let results = tokio::time::timeout(WAIT, futures_join_all(uploads)).await.expect("in time");
        for result in results {
            result.expect("upload");
        }
        for id in &ids {
            assert!(bob.store.find(id).await.is_some());
        }
    }

    async fn futures_join_all<F, T>(futures: impl IntoIterator<Item = F>) -> Vec<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
        let mut out = Vec::new();
        for handle in handles {
            out.push(handle.await.expect("task"));
        }
        out
    }

    #[tokio::test]
    async fn missing_shard_is_rejected_with_reason() {
        let hub = Arc::new(Hub::default());
        let (_stop_tx, stop) = watch::channel(false);
        let alice = spawn_peer(&hub, TransferConfig::default(), &stop).await;
        let bob = spawn_peer(&hub, TransferConfig::default(), &stop).await;

        let err = tokio::time::timeout(
            WAIT,
            alice.manager.download(bob.manager.local_unl(), ShardId::of(b"nobody has this")),
        )
        .await
        .expect("in time")
        .expect_err("rejected");
        assert!(matches!(err, NodeError::RequestDenied(RejectReason::MissingShard)));
        assert!(alice.manager.transfers().await.is_empty());
    }

    #[tokio::test]
    async fn unanswered_syn_expires() {
        let hub = Arc::new(Hub::default());
        let (_stop_tx, stop) = watch::channel(false);
        let config = TransferConfig {
            handshake_expiry: Duration::from_millis(300),
            ..TransferConfig::default()
        };
        let alice = spawn_peer(&hub, config, &stop).await;
        let silent = spawn_peer(&hub, TransferConfig::default(), &stop).await;
        let silent_unl = *silent.manager.local_unl();
        // Contracts to the silent peer go nowhere.
        hub.managers.write().insert(silent_unl.node_id, alice.manager.clone());

        let id = alice.store.add_bytes(b"lonely").await.expect("add");
        let err = tokio::time::timeout(WAIT, alice.manager.upload(&silent_unl, id))
            .await
            .expect("in time")
            .expect_err("expired");
        assert!(matches!(err, NodeError::Timeout));
    }

    #[tokio::test]
    async fn events_follow_the_transfer() {
        let hub = Arc::new(Hub::default());
        let (_stop_tx, stop) = watch::channel(false);
        let alice = spawn_peer(&hub, TransferConfig::default(), &stop).await;
        let bob = spawn_peer(&hub, TransferConfig::default(), &stop).await;
        let mut bob_events = bob.manager.subscribe();

        let id = alice.store.add_bytes(&[3u8; 2048]).await.expect("add");
        tokio::time::timeout(WAIT, alice.manager.upload(bob.manager.local_unl(), id))
            .await
            .expect("in time")
            .expect("upload");

        let mut seen = Vec::new();
        while !seen.contains(&"completed") && !seen.contains(&"failed") {
            let event = tokio::time::timeout(WAIT, bob_events.recv())
                .await
                .expect("event in time")
                .expect("event");
            seen.push(match event {
                TransferEvent::Accepted { role, .. } => {
                    assert_eq!(role, Role::Receive);
                    "accepted"
                }
                TransferEvent::Started { .. } => "started",
                TransferEvent::Completed(report) => {
                    assert_eq!(report.bytes, 2048);
                    "completed"
                }
                TransferEvent::Failed { .. } => "failed",
            });
        }
        assert_eq!(seen, vec!["accepted", "started", "completed"]);
    }
}
