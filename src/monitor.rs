//! # Overlay Monitor
//!
//! Crawls the reachable overlay and publishes a signed snapshot of it.
//!
//! Every peer moves through a fixed pipeline:
//!
//! ```text
//! toscan → scanning → scanned → bandwidth testing → processed
//! ```
//!
//! - **scanning**: an `info_request` and a `peers_request` are relayed to the
//!   peer and re-sent with exponential backoff (`retry_base × 2^(tries-1)`)
//!   until both replies are in or `max_tries` is spent. Peers named in a
//!   `peers_response` join `toscan`.
//! - **scanned**: FIFO of peers waiting for a bandwidth test.
//! - **bandwidth testing**: one test at a time; a failed test re-queues the
//!   peer at the tail.
//! - **processed**: the record is final.
//!
//! A crawl ends when the pipeline drains, the processed limit is reached or
//! the deadline passes. The dataset is then serialized to JSON, signed,
//! stored as a shard and announced in the DHT under
//! `monitor_dataset_{base58 id}_{n}` with the lowest free `n`.
//!
//! [`InfoService`] is the other side: every node answers the two requests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::bwtest::{BandwidthResult, BandwidthTester};
use crate::config::MonitorConfig;
use crate::crypto::{DATASET_SIGNATURE_DOMAIN, recover_with_domain, sign_with_domain};
use crate::dht::{DhtNode, key_for};
use crate::error::{NodeError, Result};
use crate::identity::{Keypair, NodeId, millis, now_secs};
use crate::messages::{PROTOCOL_VERSION, deserialize_bounded, serialize};
use crate::messaging::{Delivery, MessageSender};
use crate::protocols::DhtRpc;
use crate::store::{Capacity, ShardId, ShardStore, stage_bytes};
use crate::unl::Unl;

pub const INFO_REQUEST_TOKEN: &str = "info_request";
pub const INFO_RESPONSE_TOKEN: &str = "info_response";
pub const PEERS_REQUEST_TOKEN: &str = "peers_request";
pub const PEERS_RESPONSE_TOKEN: &str = "peers_response";
/// Sent direct to time a one-hop round trip; nobody handles it.
pub const PING_TOKEN: &str = "monitor_ping";

/// Neighbor ids returned by a `peers_request`.
pub const MAX_PEERS_PER_RESPONSE: usize = 20;
const PEERS_BODY_BUDGET: usize = 410;

/// Upper bound for the sequence search; reaching it means the board is garbage.
const MAX_SEQUENCE: u64 = 1 << 20;
const COMMAND_QUEUE_SIZE: usize = 8;
const LATENCY_QUEUE_SIZE: usize = 256;

// ============================================================================
// Overlay Seam
// ============================================================================

/// What the crawler and the services need from the DHT.
#[async_trait]
pub trait OverlayView: Send + Sync + 'static {
    /// Up to `limit` known neighbors, closest first.
    async fn neighbor_ids(&self, limit: usize) -> Vec<NodeId>;

    async fn put_value(&self, name: &str, value: Vec<u8>) -> Result<()>;

    async fn get_value(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
impl<N: DhtRpc> OverlayView for DhtNode<N> {
    async fn neighbor_ids(&self, limit: usize) -> Vec<NodeId> {
        self.find_neighbors(self.id(), limit, None)
            .await
            .into_iter()
            .map(|c| c.id)
            .collect()
    }

    async fn put_value(&self, name: &str, value: Vec<u8>) -> Result<()> {
        self.put(key_for(name), value).await.map(|_| ())
    }

    async fn get_value(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.get(&key_for(name)).await
    }
}

/// Measures the link to a scanned peer.
#[async_trait]
pub trait LinkTester: Send + Sync + 'static {
    async fn test_link(&self, target: Unl) -> Result<BandwidthResult>;
}

#[async_trait]
impl LinkTester for BandwidthTester {
    async fn test_link(&self, target: Unl) -> Result<BandwidthResult> {
        self.test(target).await
    }
}

// ============================================================================
// Wire Messages
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoRequest {
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub nonce: u64,
    pub version: String,
    pub protocol_version: u32,
    pub unl: Unl,
    pub capacity: Capacity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersRequest {
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersResponse {
    pub nonce: u64,
    pub peers: Vec<NodeId>,
}

/// Encode a peers response, dropping ids until it fits one envelope.
fn encode_peers(nonce: u64, mut peers: Vec<NodeId>) -> Result<Vec<u8>> {
    peers.truncate(MAX_PEERS_PER_RESPONSE);
    loop {
        let body = serialize(&PeersResponse {
            nonce,
            peers: peers.clone(),
        })?;
        if body.len() <= PEERS_BODY_BUDGET || peers.is_empty() {
            return Ok(body);
        }
        peers.pop();
    }
}

// ============================================================================
// Dataset
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatencyRecord {
    pub info_ms: u64,
    pub peers_ms: u64,
    pub direct_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BandwidthRecord {
    pub size: u64,
    pub upload_bps: f64,
    pub download_bps: f64,
}

impl From<BandwidthResult> for BandwidthRecord {
    fn from(result: BandwidthResult) -> Self {
        Self {
            size: result.size,
            upload_bps: result.upload_bps,
            download_bps: result.download_bps,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: String,
    pub unl: String,
    pub version: String,
    pub protocol_version: u32,
    pub capacity: Capacity,
    /// Neighbor ids the peer reported, hex.
    pub peers: Vec<String>,
    pub bandwidth: Option<BandwidthRecord>,
    pub latency: LatencyRecord,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonitorDataset {
    pub crawler: String,
    pub started_at: u64,
    pub finished_at: u64,
    pub peers: Vec<PeerRecord>,
}

/// The document stored as a shard: the JSON body plus the crawler's signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDataset {
    pub signer: String,
    pub body: String,
    pub signature: String,
}

impl SignedDataset {
    pub fn sign(keypair: &Keypair, dataset: &MonitorDataset) -> Result<Self> {
        let body = serde_json::to_string(dataset)?;
        let signature = sign_with_domain(keypair, DATASET_SIGNATURE_DOMAIN, body.as_bytes())
            .map_err(|e| NodeError::Fatal(e.to_string()))?;
        Ok(Self {
            signer: keypair.node_id().to_hex(),
            body,
            signature: hex::encode(signature),
        })
    }

    /// Check the signature and parse the body.
    pub fn open(&self) -> Result<MonitorDataset> {
        let signature = hex::decode(&self.signature).map_err(|_| NodeError::BadSignature)?;
        let signer = recover_with_domain(DATASET_SIGNATURE_DOMAIN, self.body.as_bytes(), &signature)
            .map_err(|_| NodeError::BadSignature)?;
        if signer.to_hex() != self.signer {
            return Err(NodeError::BadSignature);
        }
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn dataset_key(crawler: &NodeId, sequence: u64) -> String {
    format!("monitor_dataset_{}_{}", crawler.to_base58(), sequence)
}

/// Lowest free sequence number, assuming `0..n` are taken.
///
/// Doubles to find an unused upper bound, then bisects.
pub async fn next_sequence(overlay: &dyn OverlayView, crawler: &NodeId) -> Result<u64> {
    let taken = |n: u64| async move { Ok::<_, NodeError>(overlay.get_value(&dataset_key(crawler, n)).await?.is_some()) };

    if !taken(0).await? {
        return Ok(0);
    }
    let mut low = 0;
    let mut high = 1;
    while taken(high).await? {
        low = high;
        high *= 2;
        if high > MAX_SEQUENCE {
            return Err(NodeError::Fatal("monitor sequence space exhausted".into()));
        }
    }
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        if taken(mid).await? {
            low = mid;
        } else {
            high = mid;
        }
    }
    Ok(high)
}

#[derive(Clone, Debug)]
pub struct CrawlReport {
    pub shard: ShardId,
    pub key: String,
    pub sequence: u64,
    pub dataset: MonitorDataset,
}

// ============================================================================
// Info Service
// ============================================================================

/// Answers `info_request` and `peers_request` messages.
pub struct InfoService {
    messages: Arc<dyn MessageSender>,
    overlay: Arc<dyn OverlayView>,
    store: Arc<dyn ShardStore>,
    unl: Unl,
    info_requests: mpsc::Receiver<Delivery>,
    peers_requests: mpsc::Receiver<Delivery>,
}

impl InfoService {
    pub fn new(
        messages: Arc<dyn MessageSender>,
        overlay: Arc<dyn OverlayView>,
        store: Arc<dyn ShardStore>,
        unl: Unl,
        info_requests: mpsc::Receiver<Delivery>,
        peers_requests: mpsc::Receiver<Delivery>,
    ) -> Self {
        Self {
            messages,
            overlay,
            store,
            unl,
            info_requests,
            peers_requests,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                Some(delivery) = self.info_requests.recv() => {
                    if let Err(e) = self.answer_info(&delivery).await {
                        debug!(from = %delivery.sender.short(), error = %e, "info request not answered");
                    }
                }
                Some(delivery) = self.peers_requests.recv() => {
                    if let Err(e) = self.answer_peers(&delivery).await {
                        debug!(from = %delivery.sender.short(), error = %e, "peers request not answered");
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

    async fn answer_info(&self, delivery: &Delivery) -> Result<()> {
        let request: InfoRequest = deserialize_bounded(&delivery.body)?;
        let response = InfoResponse {
            nonce: request.nonce,
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            unl: self.unl,
            capacity: self.store.capacity(),
        };
        self.messages
            .send_relay(delivery.sender, INFO_RESPONSE_TOKEN, &serialize(&response)?)
            .await
    }

    async fn answer_peers(&self, delivery: &Delivery) -> Result<()> {
        let request: PeersRequest = deserialize_bounded(&delivery.body)?;
        let peers = self.overlay.neighbor_ids(MAX_PEERS_PER_RESPONSE).await;
        let body = encode_peers(request.nonce, peers)?;
        self.messages.send_relay(delivery.sender, PEERS_RESPONSE_TOKEN, &body).await
    }
}

// ============================================================================
// Crawl Pipeline
// ============================================================================

struct Scan {
    /// Every request nonce sent to the peer, with its send time. Each retry
    /// gets a fresh nonce so the envelope is never a duplicate of the last.
    sent: Vec<(u64, Instant)>,
    tries: u32,
    next_retry: Instant,
    info: Option<(InfoResponse, Duration)>,
    peers: Option<(Vec<NodeId>, Duration)>,
}

struct Scanned {
    id: NodeId,
    info: InfoResponse,
    peers: Vec<NodeId>,
    latency: LatencyRecord,
    test_failures: u32,
}

impl Scan {
    fn new(now: Instant, retry_base: Duration) -> Self {
        Self {
            sent: vec![(rand::random(), now)],
            tries: 1,
            next_retry: now + retry_base,
            info: None,
            peers: None,
        }
    }

    fn latest_nonce(&self) -> u64 {
        self.sent.last().map(|(nonce, _)| *nonce).unwrap_or_default()
    }

    fn resend(&mut self, now: Instant) -> u64 {
        let nonce = rand::random();
        self.sent.push((nonce, now));
        nonce
    }

    /// Round trip for a reply carrying `nonce`, if we sent it.
    fn rtt(&self, nonce: u64, now: Instant) -> Option<Duration> {
        self.sent
            .iter()
            .find(|(sent, _)| *sent == nonce)
            .map(|(_, at)| now.saturating_duration_since(*at))
    }
}

impl Scanned {
    fn into_record(self, bandwidth: Option<BandwidthResult>) -> PeerRecord {
        PeerRecord {
            node_id: self.id.to_hex(),
            unl: self.info.unl.encode(),
            version: self.info.version,
            protocol_version: self.info.protocol_version,
            capacity: self.info.capacity,
            peers: self.peers.iter().map(|p| p.to_hex()).collect(),
            bandwidth: bandwidth.map(BandwidthRecord::from),
            latency: self.latency,
        }
    }
}

/// Runs crawls. Owns the response channels so replies are never split
/// between concurrent crawls.
pub struct Crawler {
    keypair: Keypair,
    messages: Arc<dyn MessageSender>,
    overlay: Arc<dyn OverlayView>,
    store: Arc<dyn ShardStore>,
    tester: Option<Arc<dyn LinkTester>>,
    config: MonitorConfig,
    info_responses: mpsc::Receiver<Delivery>,
    peers_responses: mpsc::Receiver<Delivery>,
}

/// Per-crawl state.
struct Pipeline {
    seen: HashSet<NodeId>,
    toscan: VecDeque<NodeId>,
    scanning: HashMap<NodeId, Scan>,
    scanned: VecDeque<Scanned>,
    testing: Option<(Scanned, JoinHandle<Result<BandwidthResult>>)>,
    processed: Vec<PeerRecord>,
    direct: HashMap<NodeId, Duration>,
}

impl Pipeline {
    fn drained(&self) -> bool {
        self.toscan.is_empty() && self.scanning.is_empty() && self.scanned.is_empty() && self.testing.is_none()
    }

    fn enqueue(&mut self, id: NodeId) {
        if self.seen.insert(id) {
            self.toscan.push_back(id);
        }
    }
}

impl Crawler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: Keypair,
        messages: Arc<dyn MessageSender>,
        overlay: Arc<dyn OverlayView>,
        store: Arc<dyn ShardStore>,
        tester: Option<Arc<dyn LinkTester>>,
        config: MonitorConfig,
        info_responses: mpsc::Receiver<Delivery>,
        peers_responses: mpsc::Receiver<Delivery>,
    ) -> Self {
        Self {
            keypair,
            messages,
            overlay,
            store,
            tester,
            config,
            info_responses,
            peers_responses,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Crawl, then sign, store and announce the dataset.
    pub async fn crawl(&mut self, limit: Option<usize>, shutdown: &watch::Receiver<bool>) -> Result<CrawlReport> {
        let started_at = now_secs();
        let peers = self.scan(limit, shutdown).await?;
        let local = self.keypair.node_id();
        let dataset = MonitorDataset {
            crawler: local.to_base58(),
            started_at,
            finished_at: now_secs(),
            peers,
        };
        self.publish(dataset).await
    }

    async fn publish(&self, dataset: MonitorDataset) -> Result<CrawlReport> {
        let local = self.keypair.node_id();
        let document = SignedDataset::sign(&self.keypair, &dataset)?.to_bytes()?;
        let staged = stage_bytes(self.store.as_ref(), &document).await?;
        let shard = match self.store.add_file(&staged).await {
            Ok(shard) => shard,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(e);
            }
        };

        let sequence = next_sequence(self.overlay.as_ref(), &local).await?;
        let key = dataset_key(&local, sequence);
        self.overlay.put_value(&key, shard.to_hex().into_bytes()).await?;
        info!(
            key = %key,
            shard = %shard,
            peers = dataset.peers.len(),
            "monitor dataset published"
        );
        Ok(CrawlReport {
            shard,
            key,
            sequence,
            dataset,
        })
    }

    /// Run the pipeline until it drains, the limit is hit or time runs out.
    async fn scan(&mut self, limit: Option<usize>, shutdown: &watch::Receiver<bool>) -> Result<Vec<PeerRecord>> {
        let local = self.keypair.node_id();
        let limit = limit.or(self.config.limit);
        let deadline = Instant::now() + self.config.deadline;

        // Replies to an earlier crawl.
        while self.info_responses.try_recv().is_ok() {}
        while self.peers_responses.try_recv().is_ok() {}

        let mut pipeline = Pipeline {
            seen: HashSet::from([local]),
            toscan: VecDeque::new(),
            scanning: HashMap::new(),
            scanned: VecDeque::new(),
            testing: None,
            processed: Vec::new(),
            direct: HashMap::new(),
        };
        for id in self.overlay.neighbor_ids(MAX_PEERS_PER_RESPONSE).await {
            pipeline.enqueue(id);
        }
        info!(seeds = pipeline.toscan.len(), limit = ?limit, "crawl started");

        let (latency_tx, mut latency_rx) = mpsc::channel(LATENCY_QUEUE_SIZE);
        let mut tick = tokio::time::interval(self.config.tick);

        loop {
            if *shutdown.borrow() {
                if let Some((_, handle)) = pipeline.testing.take() {
                    handle.abort();
                }
                return Err(NodeError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(processed = pipeline.processed.len(), "crawl deadline reached");
                break;
            }
            if limit.is_some_and(|n| pipeline.processed.len() >= n) || pipeline.drained() {
                break;
            }

            while let Ok((id, rtt)) = latency_rx.try_recv() {
                pipeline.direct.insert(id, rtt);
            }
            self.collect_replies(&mut pipeline, now);
            self.start_scans(&mut pipeline, &latency_tx, now);
            self.retry_scans(&mut pipeline, now);
            self.promote_scanned(&mut pipeline);
            self.advance_tests(&mut pipeline).await;

            tick.tick().await;
        }

        if let Some((_, handle)) = pipeline.testing.take() {
            handle.abort();
        }
        let mut processed = pipeline.processed;
        if let Some(n) = limit {
            processed.truncate(n);
        }
        info!(processed = processed.len(), "crawl finished");
        Ok(processed)
    }

    fn collect_replies(&mut self, pipeline: &mut Pipeline, now: Instant) {
        while let Ok(delivery) = self.info_responses.try_recv() {
            let Ok(response) = deserialize_bounded::<InfoResponse>(&delivery.body) else {
                continue;
            };
            if let Some(scan) = pipeline.scanning.get_mut(&delivery.sender)
                && response.unl.node_id == delivery.sender
                && scan.info.is_none()
                && let Some(rtt) = scan.rtt(response.nonce, now)
            {
                scan.info = Some((response, rtt));
            }
        }
        while let Ok(delivery) = self.peers_responses.try_recv() {
            let Ok(response) = deserialize_bounded::<PeersResponse>(&delivery.body) else {
                continue;
            };
            let matched = match pipeline.scanning.get_mut(&delivery.sender) {
                Some(scan) if scan.peers.is_none() => match scan.rtt(response.nonce, now) {
                    Some(rtt) => {
                        scan.peers = Some((response.peers.clone(), rtt));
                        true
                    }
                    None => false,
                },
                _ => false,
            };
            if matched {
                for peer in response.peers {
                    pipeline.enqueue(peer);
                }
            }
        }
    }

    fn start_scans(&self, pipeline: &mut Pipeline, latency_tx: &mpsc::Sender<(NodeId, Duration)>, now: Instant) {
        while pipeline.scanning.len() < self.config.max_scanning {
            let Some(id) = pipeline.toscan.pop_front() else {
                break;
            };
            let scan = Scan::new(now, self.config.retry_base);
            trace!(peer = %id.short(), "scanning");
            self.send_requests(id, scan.latest_nonce());

            let messages = self.messages.clone();
            let latency_tx = latency_tx.clone();
            // Repeated pings must not look like duplicates to the target.
            let ping: [u8; 8] = rand::random();
            tokio::spawn(async move {
                let started = Instant::now();
                if messages.send_direct(id, PING_TOKEN, &ping).await.is_ok() {
                    let _ = latency_tx.send((id, started.elapsed())).await;
                }
            });
            pipeline.scanning.insert(id, scan);
        }
    }

    fn retry_scans(&self, pipeline: &mut Pipeline, now: Instant) {
        let mut abandoned = Vec::new();
        for (id, scan) in pipeline.scanning.iter_mut() {
            if (scan.info.is_some() && scan.peers.is_some()) || now < scan.next_retry {
                continue;
            }
            if scan.tries >= self.config.max_tries {
                abandoned.push(*id);
                continue;
            }
            scan.tries += 1;
            scan.next_retry = now + backoff(self.config.retry_base, scan.tries);
            let nonce = scan.resend(now);
            debug!(peer = %id.short(), tries = scan.tries, "re-sending scan requests");
            self.send_requests(*id, nonce);
        }
        for id in abandoned {
            debug!(peer = %id.short(), "peer did not answer, dropping");
            pipeline.scanning.remove(&id);
        }
    }

    fn send_requests(&self, id: NodeId, nonce: u64) {
        let messages = self.messages.clone();
        tokio::spawn(async move {
            let info = serialize(&InfoRequest { nonce });
            let peers = serialize(&PeersRequest { nonce });
            if let (Ok(info), Ok(peers)) = (info, peers) {
                if let Err(e) = messages.send_relay(id, INFO_REQUEST_TOKEN, &info).await {
                    debug!(peer = %id.short(), error = %e, "info request failed");
                }
                if let Err(e) = messages.send_relay(id, PEERS_REQUEST_TOKEN, &peers).await {
                    debug!(peer = %id.short(), error = %e, "peers request failed");
                }
            }
        });
    }

    fn promote_scanned(&self, pipeline: &mut Pipeline) {
        let complete: Vec<NodeId> = pipeline
            .scanning
            .iter()
            .filter(|(_, scan)| scan.info.is_some() && scan.peers.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in complete {
            let Some(scan) = pipeline.scanning.remove(&id) else {
                continue;
            };
            let (Some((info, info_rtt)), Some((peers, peers_rtt))) = (scan.info, scan.peers) else {
                continue;
            };
            pipeline.scanned.push_back(Scanned {
                id,
                info,
                peers,
                latency: LatencyRecord {
                    info_ms: millis(info_rtt),
                    peers_ms: millis(peers_rtt),
                    direct_ms: pipeline.direct.get(&id).copied().map(millis),
                },
                test_failures: 0,
            });
        }
    }

    async fn advance_tests(&self, pipeline: &mut Pipeline) {
        let finished = pipeline.testing.as_ref().is_some_and(|(_, handle)| handle.is_finished());
        if finished && let Some((scanned, handle)) = pipeline.testing.take() {
            match handle.await {
                Ok(Ok(result)) => pipeline.processed.push(scanned.into_record(Some(result))),
                Ok(Err(e)) => self.test_failed(pipeline, scanned, e.to_string()),
                Err(e) => self.test_failed(pipeline, scanned, e.to_string()),
            }
        }

        if pipeline.testing.is_some() {
            return;
        }
        let Some(scanned) = pipeline.scanned.pop_front() else {
            return;
        };
        match (&self.tester, self.config.bandwidth_test) {
            (Some(tester), true) => {
                let tester = tester.clone();
                let target = scanned.info.unl;
                let handle = tokio::spawn(async move { tester.test_link(target).await });
                pipeline.testing = Some((scanned, handle));
            }
            _ => pipeline.processed.push(scanned.into_record(None)),
        }
    }

    fn test_failed(&self, pipeline: &mut Pipeline, mut scanned: Scanned, error: String) {
        scanned.test_failures += 1;
        if scanned.test_failures >= self.config.max_tries {
            warn!(peer = %scanned.id.short(), %error, "bandwidth test kept failing, recording without it");
            pipeline.processed.push(scanned.into_record(None));
        } else {
            debug!(peer = %scanned.id.short(), %error, "bandwidth test failed, re-queued");
            pipeline.scanned.push_back(scanned);
        }
    }
}

fn backoff(base: Duration, tries: u32) -> Duration {
    base * 2u32.saturating_pow(tries.saturating_sub(1)).min(1 << 16)
}

// ============================================================================
// Monitor Worker
// ============================================================================

enum MonitorCommand {
    Crawl {
        limit: Option<usize>,
        reply: oneshot::Sender<Result<CrawlReport>>,
    },
    LastReport(oneshot::Sender<Option<CrawlReport>>),
}

#[derive(Clone)]
pub struct MonitorHandle {
    cmd_tx: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
    /// Run a crawl now; `limit` overrides the configured processed limit.
    pub async fn crawl(&self, limit: Option<usize>) -> Result<CrawlReport> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MonitorCommand::Crawl { limit, reply })
            .await
            .map_err(|_| NodeError::Cancelled)?;
        rx.await.map_err(|_| NodeError::Cancelled)?
    }

    pub async fn last_report(&self) -> Option<CrawlReport> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(MonitorCommand::LastReport(reply)).await.ok()?;
        rx.await.ok().flatten()
    }
}

/// Serves crawl requests and, when configured, crawls on an interval.
pub struct Monitor {
    crawler: Crawler,
    cmd_rx: mpsc::Receiver<MonitorCommand>,
    last: Option<CrawlReport>,
}

impl Monitor {
    pub fn new(crawler: Crawler) -> (MonitorHandle, Self) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        (
            MonitorHandle { cmd_tx },
            Self {
                crawler,
                cmd_rx,
                last: None,
            },
        )
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.crawler.config().interval;
        let mut next_crawl = interval.map(|i| Instant::now() + i);
        loop {
            let scheduled = async {
                match next_crawl {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(MonitorCommand::Crawl { limit, reply }) => {
                        let result = self.crawler.crawl(limit, &shutdown).await;
                        if let Ok(report) = &result {
                            self.last = Some(report.clone());
                        }
                        let _ = reply.send(result);
                    }
                    Some(MonitorCommand::LastReport(reply)) => {
                        let _ = reply.send(self.last.clone());
                    }
                    None => break,
                },
                _ = scheduled => {
                    match self.crawler.crawl(None, &shutdown).await {
                        Ok(report) => self.last = Some(report),
                        Err(NodeError::Cancelled) => break,
                        Err(e) => warn!(error = %e, "scheduled crawl failed"),
                    }
                    next_crawl = interval.map(|i| Instant::now() + i);
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
