//! # Node
//!
//! [`Node`] wires every component into one running overlay peer.
//!
//! ```ignore
//! let node = Node::start(NodeConfig::default().with_bind("0.0.0.0:4000".parse()?)).await?;
//! node.put("greeting", b"hello".to_vec()).await?;
//! let unl = node.unl().encode();
//! ```
//!
//! ## Startup
//!
//! 1. bind the UDP RPC socket and start the dispatcher
//! 2. start the DHT, messaging workers and neighbor refresher, then bootstrap
//! 3. classify the NAT from STUN replies and probe the passive TCP port
//! 4. build the UNL and start the transfer layer on the passive listener
//! 5. start the bandwidth-test service, the info service and the monitor
//!
//! Every worker watches one stop flag; [`Node::shutdown`] flips it and waits.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::bandwidth::BandwidthLimiter;
use crate::bwtest::{self, BandwidthResult, BandwidthTestService, BandwidthTester};
use crate::config::NodeConfig;
use crate::contract::{CONTRACT_TOKEN, Contract};
use crate::dht::DhtNode;
use crate::error::{NodeError, Result};
use crate::identity::{Contact, Keypair, NodeId};
use crate::messages::{RpcRequest, RpcResponse};
use crate::messaging::{Delivery, MessageSender, Messenger};
use crate::monitor::{self, CrawlReport, Crawler, InfoService, LinkTester, Monitor, MonitorHandle, OverlayView};
use crate::nat::{
    PeerReachabilityCheck, ProbeContext, Reachability, classify_nat, default_probes, determine_reachability,
    local_ipv4, observe_addresses,
};
use crate::protocols::RpcHandler;
use crate::rpc::{self, RpcNode};
use crate::store::{FsShardStore, Layout, ShardId, ShardStore};
use crate::transfer::{ContractPump, TransferManager, TransferReport, TransferSignals};
use crate::unl::{NatType, Unl};

/// Peers asked for our observed address during NAT classification.
const STUN_PEERS: usize = 2;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Inbound RPC
// ============================================================================

/// Routes every inbound request to the component that owns it.
struct NodeRpcHandler {
    dht: DhtNode<RpcNode>,
    messenger: Messenger<RpcNode>,
    allow_private_probes: bool,
    probe_timeout: Duration,
}

#[async_trait]
impl RpcHandler for NodeRpcHandler {
    async fn handle(&self, from: Contact, request: RpcRequest) -> RpcResponse {
        if let Some(response) = rpc::handle_dht_request(&self.dht, &from, &request).await {
            return response;
        }
        match request {
            RpcRequest::DirectMessage { envelope } => {
                self.dht.observe_contact(from).await;
                self.messenger.handle_direct(&from, &envelope)
            }
            RpcRequest::RelayMessage {
                dest,
                hop_limit,
                envelope,
            } => {
                self.dht.observe_contact(from).await;
                self.messenger.handle_relay(&from, dest, hop_limit, envelope)
            }
            RpcRequest::Stun => RpcResponse::Observed(from.addr),
            RpcRequest::CheckReachability { port } => RpcResponse::Reachable(
                rpc::probe_reachability(from.addr, port, self.allow_private_probes, self.probe_timeout).await,
            ),
            other => RpcResponse::Error(format!("unsupported request {}", other.kind())),
        }
    }
}

// ============================================================================
// Transfer Signalling
// ============================================================================

/// Contracts travel as relay messages; rendezvous instants live in the DHT.
struct OverlaySignals {
    messages: Arc<dyn MessageSender>,
    overlay: Arc<dyn OverlayView>,
}

#[async_trait]
impl TransferSignals for OverlaySignals {
    async fn send_contract(&self, to: NodeId, contract: &Contract) -> Result<()> {
        self.messages.send_relay(to, CONTRACT_TOKEN, &contract.encode()?).await
    }

    async fn publish_rendezvous(&self, key: &str, at_ms: u64) -> Result<()> {
        self.overlay.put_value(key, at_ms.to_string().into_bytes()).await
    }

    async fn lookup_rendezvous(&self, key: &str) -> Result<Option<u64>> {
        let Some(value) = self.overlay.get_value(key).await? else {
            return Ok(None);
        };
        Ok(std::str::from_utf8(&value).ok().and_then(|s| s.parse().ok()))
    }
}

// ============================================================================
// Node
// ============================================================================

pub struct Node {
    keypair: Keypair,
    rpc: RpcNode,
    dht: DhtNode<RpcNode>,
    messenger: Messenger<RpcNode>,
    store: Arc<FsShardStore>,
    bandwidth: Arc<BandwidthLimiter>,
    transfers: TransferManager,
    tester: BandwidthTester,
    monitor: MonitorHandle,
    unl: Unl,
    reachability: Reachability,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a node with a fresh identity.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        Self::start_with_keypair(config, Keypair::generate()).await
    }

    pub async fn start_with_keypair(config: NodeConfig, keypair: Keypair) -> Result<Self> {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let mut workers = Vec::new();

        let rpc = RpcNode::bind(config.bind, keypair.clone(), config.dht.query_timeout).await?;
        let local_addr = rpc.local_addr();
        let contact = Contact::new(keypair.node_id(), local_addr);
        let dht = DhtNode::new(contact, rpc.clone(), config.dht.clone());
        let (messenger, messenger_workers) = Messenger::new(dht.clone(), keypair.clone(), config.messaging.clone());

        let handler: Arc<dyn RpcHandler> = Arc::new(NodeRpcHandler {
            dht: dht.clone(),
            messenger: messenger.clone(),
            allow_private_probes: config.nat.allow_private_probes,
            probe_timeout: config.nat.probe_timeout,
        });
        {
            let rpc = rpc.clone();
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move { rpc.serve(handler, shutdown).await }));
        }
        workers.extend(messenger_workers.spawn(shutdown.clone()));
        workers.push(tokio::spawn(dht.clone().run_maintenance(shutdown.clone())));
        info!(addr = %local_addr, node = %keypair.node_id().short(), "node listening");

        if !config.bootstrap.is_empty()
            && let Err(e) = dht.bootstrap(&config.bootstrap).await
        {
            warn!(error = %e, "bootstrap failed");
        }

        let lan_ip = match local_addr.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => ip,
            _ => local_ipv4().await,
        };
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.nat.passive_port))
            .await?;
        let passive_port = listener.local_addr()?.port();

        let contacts = dht.contacts().await;
        let observed = observe_addresses(&rpc, &contacts, STUN_PEERS).await;
        let nat_type = if observed.is_empty() {
            NatType::Random
        } else {
            classify_nat(local_addr.port(), &observed)
        };
        let wan_ip = observed
            .iter()
            .find_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .unwrap_or(lan_ip);

        let probe_ctx = ProbeContext {
            passive_port,
            lan_ip,
            check: Arc::new(PeerReachabilityCheck::new(
                Arc::new(rpc.clone()),
                contacts,
                config.nat.probe_timeout,
            )),
        };
        let probes = default_probes(&config.nat, lan_ip);
        let reachability = determine_reachability(&config.nat, &probe_ctx, &probes, nat_type).await;
        let unl = Unl::new(
            keypair.node_id(),
            reachability.node_type,
            reachability.nat_type,
            reachability.forwarding,
            passive_port,
            wan_ip,
            lan_ip,
        );
        info!(
            node_type = ?reachability.node_type,
            nat_type = ?reachability.nat_type,
            forwarding = ?reachability.forwarding,
            %wan_ip,
            %lan_ip,
            passive_port,
            "reachability determined"
        );

        let store = FsShardStore::open(config.shard_dir(), config.storage_limit, Layout::Flat).await?;
        let bandwidth_config = config.bandwidth.clone().with_usage_path(config.usage_path());
        let bandwidth = Arc::new(BandwidthLimiter::new(&bandwidth_config)?);

        let messages: Arc<dyn MessageSender> = Arc::new(messenger.clone());
        let overlay: Arc<dyn OverlayView> = Arc::new(dht.clone());
        let signals = Arc::new(OverlaySignals {
            messages: messages.clone(),
            overlay: overlay.clone(),
        });
        let (transfers, processor) = TransferManager::new(
            keypair.clone(),
            unl,
            listener,
            store.clone(),
            bandwidth.clone(),
            signals,
            config.transfer.clone(),
        );
        workers.push(tokio::spawn(processor.run(shutdown.clone())));
        let pump = ContractPump::new(
            messenger.subscribe(CONTRACT_TOKEN)?,
            transfers.clone(),
            config.transfer.max_contract_size,
        );
        workers.push(tokio::spawn(pump.run(shutdown.clone())));

        let tester = BandwidthTester::new(
            keypair.clone(),
            transfers.clone(),
            messages.clone(),
            config.bandwidth_test.clone(),
        );
        let service = BandwidthTestService::new(
            tester.clone(),
            messenger.subscribe(bwtest::REQUEST_TOKEN)?,
            messenger.subscribe(bwtest::RESPONSE_TOKEN)?,
        );
        workers.push(tokio::spawn(service.run(shutdown.clone())));

        let info_service = InfoService::new(
            messages.clone(),
            overlay.clone(),
            store.clone(),
            unl,
            messenger.subscribe(monitor::INFO_REQUEST_TOKEN)?,
            messenger.subscribe(monitor::PEERS_REQUEST_TOKEN)?,
        );
        workers.push(tokio::spawn(info_service.run(shutdown.clone())));

        let link_tester: Arc<dyn LinkTester> = Arc::new(tester.clone());
        let crawler = Crawler::new(
            keypair.clone(),
            messages,
            overlay,
            store.clone(),
            Some(link_tester),
            config.monitor.clone(),
            messenger.subscribe(monitor::INFO_RESPONSE_TOKEN)?,
            messenger.subscribe(monitor::PEERS_RESPONSE_TOKEN)?,
        );
        let (monitor, monitor_worker) = Monitor::new(crawler);
        workers.push(tokio::spawn(monitor_worker.run(shutdown)));

        Ok(Self {
            keypair,
            rpc,
            dht,
            messenger,
            store,
            bandwidth,
            transfers,
            tester,
            monitor,
            unl,
            reachability,
            shutdown_tx,
            workers: Mutex::new(workers),
        })
    }

    pub fn id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    pub fn contact(&self) -> Contact {
        self.dht.contact()
    }

    pub fn unl(&self) -> &Unl {
        &self.unl
    }

    pub fn reachability(&self) -> Reachability {
        self.reachability
    }

    pub fn dht(&self) -> &DhtNode<RpcNode> {
        &self.dht
    }

    pub fn store(&self) -> &Arc<FsShardStore> {
        &self.store
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthLimiter> {
        &self.bandwidth
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    // ------------------------------------------------------------------------
    // DHT
    // ------------------------------------------------------------------------

    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize> {
        self.dht.bootstrap(seeds).await
    }

    pub async fn add_contact(&self, contact: Contact) {
        self.dht.observe_contact(contact).await;
    }

    /// Store `value` under the DHT key derived from `name`.
    pub async fn put(&self, name: &str, value: Vec<u8>) -> Result<()> {
        self.dht.put_value(name, value).await
    }

    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.dht.get_value(name).await
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    pub async fn direct_message(&self, dest: NodeId, token: &str, body: &[u8]) -> Result<()> {
        self.messenger.direct_message(dest, token, body).await
    }

    pub async fn relay_message(&self, dest: NodeId, token: &str, body: &[u8]) -> Result<()> {
        self.messenger.relay_message(dest, token, body).await
    }

    /// Receive every message carrying `token`.
    pub fn subscribe(&self, token: &str) -> Result<mpsc::Receiver<Delivery>> {
        self.messenger.subscribe(token)
    }

    pub fn messenger(&self) -> &Messenger<RpcNode> {
        &self.messenger
    }

    // ------------------------------------------------------------------------
    // Shards and transfers
    // ------------------------------------------------------------------------

    /// Copy a local file into the shard store.
    pub async fn host_file(&self, path: &Path) -> Result<ShardId> {
        let staged = self.store.staging_path();
        tokio::fs::copy(path, &staged).await?;
        match self.store.add_file(&staged).await {
            Ok(id) => Ok(id),
            Err(e) => {
                let _ = tokio::fs::remove_file(&staged).await;
                Err(e)
            }
        }
    }

    pub async fn upload(&self, remote: &Unl, shard: ShardId) -> Result<TransferReport> {
        self.transfers.upload(remote, shard).await
    }

    pub async fn download(&self, remote: &Unl, shard: ShardId) -> Result<TransferReport> {
        self.transfers.download(remote, shard).await
    }

    pub async fn test_bandwidth(&self, target: &Unl) -> Result<BandwidthResult> {
        self.tester.test(*target).await
    }

    /// Crawl the overlay and publish the dataset.
    pub async fn crawl(&self, limit: Option<usize>) -> Result<CrawlReport> {
        self.monitor.crawl(limit).await
    }

    pub async fn last_crawl(&self) -> Option<CrawlReport> {
        self.monitor.last_report().await
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Stop every worker and wait for them to exit.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.dht.quit().await;
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for worker in workers {
                let _ = worker.await;
            }
        })
        .await;
        match joined {
            Ok(()) => info!(node = %self.id().short(), workers = count, "node stopped"),
            Err(_) => warn!(node = %self.id().short(), "workers did not stop in time"),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.shutdown_tx.send_replace(true) {
            debug!(node = %self.keypair.node_id().short(), "node dropped without shutdown");
        }
    }
}

/// Parse a shard id given on the command line or over an API.
pub fn parse_shard_id(s: &str) -> Result<ShardId> {
    ShardId::from_hex(s).ok_or_else(|| NodeError::InvalidContract(format!("bad shard id {s}")))
}
