//! # Application Messaging
//!
//! Authenticated application messages between arbitrary peers.
//!
//! | Mode | Path | Failure |
//! |------|------|---------|
//! | Direct | locate the target with FIND_NODE, then one `direct_message` RPC | `Unreachable` |
//! | Relay | forward hop by hop, each hop strictly closer to the destination | silent drop |
//!
//! Relayed messages are re-sent by a [`RebroadcastQueue`] on a fixed
//! schedule; receivers de-duplicate by envelope hash in an
//! [`EnvelopeDedup`], so a message reaches its handlers at most once per
//! retention window no matter how many copies arrive.
//!
//! ## Workers
//!
//! [`Messenger::new`] returns the handle plus three workers the caller
//! spawns: the relay processor (one-hop forwarding, FIFO), the rebroadcast
//! scheduler and the message dispatcher (runs application handlers).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::MessagingConfig;
use crate::crypto::sha256;
use crate::dht::DhtNode;
use crate::error::{NodeError, Result};
use crate::identity::{Contact, Keypair, NodeId};
use crate::messages::{Envelope, RpcResponse, MAX_TOKEN_LEN};
use crate::protocols::MessageRpc;

const RELAY_QUEUE_SIZE: usize = 1024;
const DELIVERY_QUEUE_SIZE: usize = 1024;
const SUBSCRIBER_QUEUE_SIZE: usize = 256;
const MAX_REBROADCAST_ENTRIES: usize = 4096;

pub type Digest = [u8; 32];

// ============================================================================
// Deliveries and Handlers
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    Direct,
    /// `hops` counts every relay step including the final one; `via` is the
    /// node that handed us the envelope.
    Relayed { hops: u8, via: NodeId },
    /// Sent by this node to itself.
    Local,
}

/// A verified application message handed to handlers.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub sender: NodeId,
    pub token: String,
    pub body: Vec<u8>,
    pub mode: DeliveryMode,
    pub received_at: Instant,
}

/// Application callback for one token.
///
/// Called from the dispatcher worker; implementations must not block. A
/// returned error is logged and never affects delivery to other handlers.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, delivery: &Delivery) -> anyhow::Result<()>;

    /// Closed handlers are pruned at the next dispatch.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> MessageHandler for F
where
    F: Fn(&Delivery) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_message(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self(delivery)
    }
}

/// Forwards deliveries into a bounded channel.
pub struct ChannelHandler {
    tx: mpsc::Sender<Delivery>,
}

impl ChannelHandler {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl MessageHandler for ChannelHandler {
    fn on_message(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self.tx
            .try_send(delivery.clone())
            .map_err(|e| anyhow::anyhow!("subscriber not keeping up: {e}"))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Typed handler registry keyed by token.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Arc<dyn MessageHandler>)>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: &str, handler: Arc<dyn MessageHandler>) -> Result<HandlerId> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(NodeError::BadEnvelope(format!("token length {}", token.len())));
        }
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(token.to_string())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub fn has_handler(&self, token: &str) -> bool {
        self.handlers.read().contains_key(token)
    }

    /// Run every handler for the delivery's token; returns how many ran.
    pub fn dispatch(&self, delivery: &Delivery) -> usize {
        let targets: Vec<Arc<dyn MessageHandler>> = match self.handlers.read().get(&delivery.token) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };

        let mut invoked = 0;
        let mut saw_closed = false;
        for handler in targets {
            if handler.is_closed() {
                saw_closed = true;
                continue;
            }
            invoked += 1;
            if let Err(e) = handler.on_message(delivery) {
                warn!(
                    token = %delivery.token,
                    sender = %delivery.sender.short(),
                    error = %e,
                    "message handler failed"
                );
            }
        }

        if saw_closed {
            let mut handlers = self.handlers.write();
            if let Some(list) = handlers.get_mut(&delivery.token) {
                list.retain(|(_, h)| !h.is_closed());
                if list.is_empty() {
                    handlers.remove(&delivery.token);
                }
            }
        }
        invoked
    }
}

// ============================================================================
// Envelope De-duplication
// ============================================================================

struct SeenEntry {
    last_seen: Instant,
    repeats: u32,
}

/// Remembers envelope hashes so a message is delivered at most once per
/// retention window.
///
/// A hash stays for `retention` after its latest sighting; every duplicate
/// pushes that out again until the entry has absorbed `max_repeats`
/// duplicates.
pub struct EnvelopeDedup {
    seen: Mutex<LruCache<Digest, SeenEntry>>,
    retention: Duration,
    max_repeats: u32,
}

impl EnvelopeDedup {
    pub fn new(capacity: usize, retention: Duration, max_repeats: u32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
            retention,
            max_repeats,
        }
    }

    pub fn from_config(config: &MessagingConfig) -> Self {
        Self::new(config.dedup_capacity, config.dedup_retention, config.dedup_max_repeats)
    }

    /// True on the first sighting of `digest` within the window.
    pub fn first_sighting(&self, digest: &Digest) -> bool {
        self.first_sighting_at(digest, Instant::now())
    }

    pub fn first_sighting_at(&self, digest: &Digest, now: Instant) -> bool {
        let mut seen = self.seen.lock();
        if let Some(entry) = seen.get_mut(digest)
            && now.saturating_duration_since(entry.last_seen) < self.retention
        {
            if entry.repeats < self.max_repeats {
                entry.repeats += 1;
                entry.last_seen = now;
            }
            return false;
        }
        seen.put(*digest, SeenEntry { last_seen: now, repeats: 0 });
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Rebroadcast Queue
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayJob {
    pub dest: NodeId,
    pub hop_limit: u8,
    pub envelope: Vec<u8>,
}

struct RebroadcastEntry {
    dest: NodeId,
    hop_limit: u8,
    envelope: Vec<u8>,
    submitted: Instant,
    next_threshold: usize,
}

/// Resend schedule for relayed messages, keyed by envelope hash.
pub struct RebroadcastQueue {
    entries: HashMap<Digest, RebroadcastEntry>,
    schedule: Vec<Duration>,
    expiry: Duration,
}

impl RebroadcastQueue {
    pub fn new(schedule: Vec<Duration>, expiry: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            schedule,
            expiry,
        }
    }

    /// Returns false when the digest is already queued or the queue is full.
    pub fn submit(&mut self, digest: Digest, job: RelayJob, now: Instant) -> bool {
        if self.entries.contains_key(&digest) || self.entries.len() >= MAX_REBROADCAST_ENTRIES {
            return false;
        }
        self.entries.insert(
            digest,
            RebroadcastEntry {
                dest: job.dest,
                hop_limit: job.hop_limit,
                envelope: job.envelope,
                submitted: now,
                next_threshold: 0,
            },
        );
        true
    }

    /// Jobs whose next threshold has passed. Several missed thresholds
    /// produce one resend. Entries past the expiry leave the queue after
    /// their last emission.
    pub fn due(&mut self, now: Instant) -> Vec<RelayJob> {
        let mut out = Vec::new();
        for entry in self.entries.values_mut() {
            let elapsed = now.saturating_duration_since(entry.submitted);
            let mut fire = false;
            while entry.next_threshold < self.schedule.len()
                && elapsed >= self.schedule[entry.next_threshold]
            {
                entry.next_threshold += 1;
                fire = true;
            }
            if fire {
                out.push(RelayJob {
                    dest: entry.dest,
                    hop_limit: entry.hop_limit,
                    envelope: entry.envelope.clone(),
                });
            }
        }
        let expiry = self.expiry;
        let schedule_len = self.schedule.len();
        self.entries.retain(|_, e| {
            now.saturating_duration_since(e.submitted) < expiry && e.next_threshold < schedule_len
        });
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Messenger
// ============================================================================

pub struct Messenger<N: MessageRpc> {
    dht: DhtNode<N>,
    keypair: Keypair,
    config: MessagingConfig,
    dedup: Arc<EnvelopeDedup>,
    handlers: Arc<HandlerRegistry>,
    rebroadcast: Arc<Mutex<RebroadcastQueue>>,
    relay_tx: mpsc::Sender<RelayJob>,
    delivery_tx: mpsc::Sender<Delivery>,
}

impl<N: MessageRpc> Clone for Messenger<N> {
    fn clone(&self) -> Self {
        Self {
            dht: self.dht.clone(),
            keypair: self.keypair.clone(),
            config: self.config.clone(),
            dedup: self.dedup.clone(),
            handlers: self.handlers.clone(),
            rebroadcast: self.rebroadcast.clone(),
            relay_tx: self.relay_tx.clone(),
            delivery_tx: self.delivery_tx.clone(),
        }
    }
}

/// The three messaging workers, ready to be spawned.
pub struct MessengerWorkers<N: MessageRpc> {
    pub relay: RelayProcessor<N>,
    pub rebroadcast: RebroadcastScheduler,
    pub dispatcher: MessageDispatcher,
}

impl<N: MessageRpc> MessengerWorkers<N> {
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.relay.run(shutdown.clone())),
            tokio::spawn(self.rebroadcast.run(shutdown.clone())),
            tokio::spawn(self.dispatcher.run(shutdown)),
        ]
    }
}

impl<N: MessageRpc> Messenger<N> {
    pub fn new(dht: DhtNode<N>, keypair: Keypair, config: MessagingConfig) -> (Self, MessengerWorkers<N>) {
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_QUEUE_SIZE);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_SIZE);
        let handlers = Arc::new(HandlerRegistry::new());
        let rebroadcast = Arc::new(Mutex::new(RebroadcastQueue::new(
            config.rebroadcast_schedule.clone(),
            config.rebroadcast_expiry,
        )));

        let messenger = Self {
            dht,
            keypair,
            dedup: Arc::new(EnvelopeDedup::from_config(&config)),
            handlers: handlers.clone(),
            rebroadcast: rebroadcast.clone(),
            relay_tx: relay_tx.clone(),
            delivery_tx,
            config,
        };

        let workers = MessengerWorkers {
            relay: RelayProcessor {
                messenger: messenger.clone(),
                rx: relay_rx,
            },
            rebroadcast: RebroadcastScheduler {
                queue: rebroadcast,
                relay_tx,
                tick: messenger.config.rebroadcast_tick,
            },
            dispatcher: MessageDispatcher {
                handlers,
                rx: delivery_rx,
            },
        };
        (messenger, workers)
    }

    pub fn id(&self) -> NodeId {
        self.dht.id()
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn register_handler(&self, token: &str, handler: Arc<dyn MessageHandler>) -> Result<HandlerId> {
        self.handlers.register(token, handler)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.handlers.unregister(id)
    }

    /// Receive every delivery for `token` on a channel.
    pub fn subscribe(&self, token: &str) -> Result<mpsc::Receiver<Delivery>> {
        let (handler, rx) = ChannelHandler::new(SUBSCRIBER_QUEUE_SIZE);
        self.handlers.register(token, Arc::new(handler))?;
        Ok(rx)
    }

    /// Locate `dest` and hand it the message in one RPC.
    pub async fn direct_message(&self, dest: NodeId, token: &str, body: &[u8]) -> Result<()> {
        let envelope = Envelope::sign(&self.keypair, token, body)?;
        let packed = envelope.encode()?;
        if dest == self.id() {
            self.accept(&packed, envelope, DeliveryMode::Local);
            return Ok(());
        }

        let contact = self.locate(dest).await?;
        self.dht
            .network()
            .direct_message(&contact, packed)
            .await
            .map_err(|e| match e {
                NodeError::Cancelled => NodeError::Cancelled,
                other => NodeError::Unreachable(format!("{}: {other}", dest.short())),
            })?;
        trace!(dest = %dest.short(), token, "direct message delivered");
        Ok(())
    }

    async fn locate(&self, dest: NodeId) -> Result<Contact> {
        if let Some(contact) = self.dht.lookup_contact(&dest).await {
            return Ok(contact);
        }
        let closest = self.dht.iterative_find_node(dest).await?;
        closest
            .into_iter()
            .find(|c| c.id == dest)
            .ok_or_else(|| NodeError::Unreachable(format!("{} not found", dest.short())))
    }

    /// Start a relay toward `dest` and schedule its rebroadcasts.
    ///
    /// Success means the message was queued; delivery is never confirmed.
    pub async fn relay_message(&self, dest: NodeId, token: &str, body: &[u8]) -> Result<()> {
        let envelope = Envelope::sign(&self.keypair, token, body)?;
        let packed = envelope.encode()?;
        if dest == self.id() {
            self.accept(&packed, envelope, DeliveryMode::Local);
            return Ok(());
        }

        let job = RelayJob {
            dest,
            hop_limit: self.config.hop_limit,
            envelope: packed,
        };
        let digest = sha256(&job.envelope);
        if !self.rebroadcast.lock().submit(digest, job.clone(), Instant::now()) {
            debug!(dest = %dest.short(), "rebroadcast queue full or duplicate");
        }
        self.relay_tx.send(job).await.map_err(|_| NodeError::Cancelled)
    }

    /// One relay step: hand the envelope to the known contact strictly
    /// closest to `dest`, or drop it when no contact makes progress.
    async fn forward(&self, job: RelayJob) {
        let next = self.dht.find_neighbors(job.dest, 1, Some(self.id())).await;
        let Some(next) = next.first().copied() else {
            trace!(dest = %job.dest.short(), "no neighbor closer than us, dropping relay");
            return;
        };
        trace!(
            dest = %job.dest.short(),
            next = %next.id.short(),
            hop_limit = job.hop_limit,
            "forwarding relay"
        );
        if let Err(e) = self
            .dht
            .network()
            .relay_message(&next, job.dest, job.hop_limit, job.envelope)
            .await
        {
            debug!(next = %next.id.short(), error = %e, "relay hop failed");
        }
    }

    /// Inbound `direct_message` RPC.
    pub fn handle_direct(&self, from: &Contact, envelope: &[u8]) -> RpcResponse {
        match Envelope::open(envelope) {
            Ok(opened) => {
                self.accept(envelope, opened, DeliveryMode::Direct);
                RpcResponse::Delivered
            }
            Err(e) => {
                debug!(from = %from.id.short(), error = %e, "dropping direct message");
                RpcResponse::Error("invalid envelope".into())
            }
        }
    }

    /// Inbound `relay_message` RPC: deliver when addressed to us, otherwise
    /// decrement the hop budget and queue the next hop.
    pub fn handle_relay(&self, from: &Contact, dest: NodeId, hop_limit: u8, envelope: Vec<u8>) -> RpcResponse {
        let opened = match Envelope::open(&envelope) {
            Ok(opened) => opened,
            Err(e) => {
                debug!(from = %from.id.short(), error = %e, "dropping relay message");
                return RpcResponse::Error("invalid envelope".into());
            }
        };

        if dest == self.id() {
            let hops = self
                .config
                .hop_limit
                .saturating_sub(hop_limit)
                .saturating_add(1);
            self.accept(&envelope, opened, DeliveryMode::Relayed { hops, via: from.id });
            return RpcResponse::Delivered;
        }

        let remaining = hop_limit.saturating_sub(1);
        if remaining == 0 {
            debug!(dest = %dest.short(), from = %from.id.short(), "hop limit exhausted");
            return RpcResponse::Relayed;
        }
        let job = RelayJob {
            dest,
            hop_limit: remaining,
            envelope,
        };
        if self.relay_tx.try_send(job).is_err() {
            debug!(dest = %dest.short(), "relay queue full, dropping");
        }
        RpcResponse::Relayed
    }

    /// Hand a verified envelope to the dispatcher unless it is a duplicate or
    /// nobody listens for its token.
    fn accept(&self, packed: &[u8], envelope: Envelope, mode: DeliveryMode) -> bool {
        if !self.dedup.first_sighting(&sha256(packed)) {
            trace!(token = %envelope.token, sender = %envelope.sender.short(), "duplicate envelope");
            return false;
        }
        if !self.handlers.has_handler(&envelope.token) {
            trace!(token = %envelope.token, "no handler for token");
            return false;
        }
        let delivery = Delivery {
            sender: envelope.sender,
            token: envelope.token,
            body: envelope.body,
            mode,
            received_at: Instant::now(),
        };
        if self.delivery_tx.try_send(delivery).is_err() {
            warn!("delivery queue full, dropping message");
            return false;
        }
        true
    }
}

/// Outbound messaging as seen by services built on top of it.
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    fn local_id(&self) -> NodeId;

    async fn send_direct(&self, dest: NodeId, token: &str, body: &[u8]) -> Result<()>;

    async fn send_relay(&self, dest: NodeId, token: &str, body: &[u8]) -> Result<()>;
}

#[async_trait]
impl<N: MessageRpc> MessageSender for Messenger<N> {
    fn local_id(&self) -> NodeId {
        self.id()
    }

    async fn send_direct(&self, dest: NodeId, token: &str, body: &[u8]) -> Result<()> {
        self.direct_message(dest, token, body).await
    }

    async fn send_relay(&self, dest: NodeId, token: &str, body: &[u8]) -> Result<()> {
        self.relay_message(dest, token, body).await
    }
}

// ============================================================================
// Workers
// ============================================================================

/// Drains the relay queue one hop at a time.
pub struct RelayProcessor<N: MessageRpc> {
    messenger: Messenger<N>,
    rx: mpsc::Receiver<RelayJob>,
}

impl<N: MessageRpc> RelayProcessor<N> {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let job = tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            self.messenger.forward(job).await;
        }
        trace!("relay processor stopped");
    }
}

pub struct RebroadcastScheduler {
    queue: Arc<Mutex<RebroadcastQueue>>,
    relay_tx: mpsc::Sender<RelayJob>,
    tick: Duration,
}

impl RebroadcastScheduler {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            let due = self.queue.lock().due(Instant::now());
            for job in due {
                trace!(dest = %job.dest.short(), "rebroadcasting relay");
                if self.relay_tx.try_send(job).is_err() {
                    debug!("relay queue full, skipping rebroadcast");
                }
            }
        }
        trace!("rebroadcast scheduler stopped");
    }
}

pub struct MessageDispatcher {
    handlers: Arc<HandlerRegistry>,
    rx: mpsc::Receiver<Delivery>,
}

impl MessageDispatcher {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delivery = tokio::select! {
                d = self.rx.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            let invoked = self.handlers.dispatch(&delivery);
            trace!(token = %delivery.token, invoked, "dispatched message");
        }
        trace!("message dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::distance_cmp;
    use crate::testnet::{self, MemNet, Registry};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    // ------------------------------------------------------------------
    // De-dup and rebroadcast bookkeeping
    // ------------------------------------------------------------------

    #[test]
    fn duplicate_within_retention_is_suppressed() {
        let dedup = EnvelopeDedup::new(16, Duration::from_secs(30), 100);
        let digest = sha256(b"envelope");
        let t0 = Instant::now();
        assert!(dedup.first_sighting_at(&digest, t0));
        assert!(!dedup.first_sighting_at(&digest, t0 + Duration::from_secs(29)));
        // Each duplicate extended the window.
        assert!(!dedup.first_sighting_at(&digest, t0 + Duration::from_secs(58)));
        assert!(dedup.first_sighting_at(&digest, t0 + Duration::from_secs(89)));
    }

    #[test]
    fn repeats_stop_extending_after_cap() {
        let dedup = EnvelopeDedup::new(16, Duration::from_secs(30), 2);
        let digest = sha256(b"envelope");
        let t0 = Instant::now();
        assert!(dedup.first_sighting_at(&digest, t0));
        assert!(!dedup.first_sighting_at(&digest, t0 + Duration::from_secs(10)));
        assert!(!dedup.first_sighting_at(&digest, t0 + Duration::from_secs(20)));
        // Cap reached: the window stays anchored at t0 + 20s.
        assert!(!dedup.first_sighting_at(&digest, t0 + Duration::from_secs(40)));
        assert!(dedup.first_sighting_at(&digest, t0 + Duration::from_secs(50)));
    }

    fn job(dest: u8) -> RelayJob {
        RelayJob {
            dest: NodeId::from_bytes([dest; 20]),
            hop_limit: 64,
            envelope: vec![dest; 8],
        }
    }

    #[test]
    fn rebroadcast_follows_schedule_then_expires() {
        let config = MessagingConfig::default();
        let mut queue = RebroadcastQueue::new(config.rebroadcast_schedule, config.rebroadcast_expiry);
        let t0 = Instant::now();
        assert!(queue.submit([1; 32], job(1), t0));
        assert!(!queue.submit([1; 32], job(1), t0));

        assert!(queue.due(t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(queue.due(t0 + Duration::from_secs(10)).len(), 1);
        assert!(queue.due(t0 + Duration::from_secs(15)).is_empty());
        assert_eq!(queue.due(t0 + Duration::from_secs(30)).len(), 1);
        // 60s and 120s were both missed: one resend, then the entry expires.
        assert_eq!(queue.due(t0 + Duration::from_secs(125)).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn registry_isolates_handler_failures() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                "test",
                Arc::new(|_: &Delivery| -> anyhow::Result<()> { anyhow::bail!("boom") }),
            )
            .expect("register");
        let counter = calls.clone();
        registry
            .register(
                "test",
                Arc::new(move |_: &Delivery| -> anyhow::Result<()> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .expect("register");

        let delivery = Delivery {
            sender: NodeId::from_bytes([0; 20]),
            token: "test".into(),
            body: b"hello".to_vec(),
            mode: DeliveryMode::Direct,
            received_at: Instant::now(),
        };
        assert_eq!(registry.dispatch(&delivery), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let other = Delivery {
            token: "other".into(),
            ..delivery
        };
        assert_eq!(registry.dispatch(&other), 0);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let registry = HandlerRegistry::new();
        let (handler, rx) = ChannelHandler::new(4);
        registry.register("chat", Arc::new(handler)).expect("register");
        drop(rx);

        let delivery = Delivery {
            sender: NodeId::from_bytes([0; 20]),
            token: "chat".into(),
            body: Vec::new(),
            mode: DeliveryMode::Direct,
            received_at: Instant::now(),
        };
        assert_eq!(registry.dispatch(&delivery), 0);
        assert!(!registry.has_handler("chat"));
    }

    #[test]
    fn unregister_removes_only_that_handler() {
        let registry = HandlerRegistry::new();
        let a = registry.register("t", Arc::new(|_: &Delivery| -> anyhow::Result<()> { Ok(()) })).expect("register");
        let _b = registry.register("t", Arc::new(|_: &Delivery| -> anyhow::Result<()> { Ok(()) })).expect("register");
        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));
        assert!(registry.has_handler("t"));
    }

    // ------------------------------------------------------------------
    // In-memory network
    // ------------------------------------------------------------------

    struct Peer {
        dht: DhtNode<MemNet>,
        messenger: Messenger<MemNet>,
        inbox: mpsc::Receiver<Delivery>,
    }

    impl Peer {
        fn contact(&self) -> Contact {
            self.dht.contact()
        }
    }

    fn keypair(seed: u32) -> Keypair {
        let mut secret = [0x11u8; 32];
        secret[..4].copy_from_slice(&seed.to_be_bytes());
        Keypair::from_secret_key_bytes(&secret).expect("valid key")
    }

    async fn spawn_peer(
        registry: &Arc<Registry>,
        kp: Keypair,
        port: u16,
        config: MessagingConfig,
        shutdown: &watch::Receiver<bool>,
    ) -> Peer {
        let (dht, messenger) = testnet::join(registry, kp, port, config, shutdown);
        let inbox = messenger.subscribe("test").expect("subscribe");
        Peer { dht, messenger, inbox }
    }

    async fn recv(inbox: &mut mpsc::Receiver<Delivery>, within: Duration) -> Option<Delivery> {
        tokio::time::timeout(within, inbox.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn direct_message_reaches_only_target() {
        let registry = Arc::new(Registry::default());
        let (_stop, shutdown) = watch::channel(false);
        let mut peers = Vec::new();
        for i in 0..3u32 {
            peers.push(spawn_peer(&registry, keypair(i), 4000 + i as u16, MessagingConfig::default(), &shutdown).await);
        }
        for a in 0..3 {
            for b in 0..3 {
                if a != b {
                    peers[a].dht.observe_contact(peers[b].contact()).await;
                }
            }
        }

        let target = peers[1].contact().id;
        peers[0]
            .messenger
            .direct_message(target, "test", b"hello")
            .await
            .expect("direct");

        let got = recv(&mut peers[1].inbox, Duration::from_secs(2)).await.expect("delivered");
        assert_eq!(got.body, b"hello");
        assert_eq!(got.sender, peers[0].contact().id);
        assert_eq!(got.mode, DeliveryMode::Direct);
        assert!(recv(&mut peers[1].inbox, Duration::from_millis(100)).await.is_none());
        assert!(recv(&mut peers[2].inbox, Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn direct_message_to_unknown_node_is_unreachable() {
        let registry = Arc::new(Registry::default());
        let (_stop, shutdown) = watch::channel(false);
        let a = spawn_peer(&registry, keypair(1), 4100, MessagingConfig::default(), &shutdown).await;
        let result = a
            .messenger
            .direct_message(keypair(99).node_id(), "test", b"x")
            .await;
        assert!(matches!(result, Err(NodeError::Unreachable(_))));
    }

    /// Ten nodes ordered by decreasing distance to the last one, each
    /// knowing only its immediate neighbors.
    async fn line(registry: &Arc<Registry>, config: MessagingConfig, shutdown: &watch::Receiver<bool>) -> Vec<Peer> {
        let dest = keypair(1000);
        let dest_id = dest.node_id();
        let mut others: Vec<Keypair> = (0..9u32).map(|i| keypair(2000 + i)).collect();
        others.sort_by(|a, b| {
            distance_cmp(&b.node_id().xor_distance(&dest_id), &a.node_id().xor_distance(&dest_id))
        });
        others.push(dest);

        let mut peers = Vec::new();
        for (i, kp) in others.into_iter().enumerate() {
            peers.push(spawn_peer(registry, kp, 5000 + i as u16, config.clone(), shutdown).await);
        }
        for i in 0..peers.len() - 1 {
            peers[i].dht.observe_contact(peers[i + 1].contact()).await;
            peers[i + 1].dht.observe_contact(peers[i].contact()).await;
        }
        peers
    }

    #[tokio::test]
    async fn relay_walks_line_with_monotone_progress() {
        let registry = Arc::new(Registry::default());
        let (_stop, shutdown) = watch::channel(false);
        let mut peers = line(&registry, MessagingConfig::default(), &shutdown).await;
        let dest = peers[9].contact().id;

        peers[0].messenger.relay_message(dest, "test", b"ping").await.expect("relay");

        let got = recv(&mut peers[9].inbox, Duration::from_secs(5)).await.expect("delivered");
        assert_eq!(got.body, b"ping");
        let DeliveryMode::Relayed { hops, via } = got.mode else {
            panic!("expected relayed delivery");
        };
        assert!(hops <= 9, "took {hops} hops");
        assert_eq!(via, peers[8].contact().id);

        for (from, to, target) in registry.hops.lock().iter() {
            assert!(to.is_closer_than(from, target));
        }
    }

    #[tokio::test]
    async fn rebroadcast_copies_are_delivered_once() {
        let registry = Arc::new(Registry::default());
        let (_stop, shutdown) = watch::channel(false);
        let mut config = MessagingConfig::default().with_rebroadcast_schedule(
            vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(300)],
            Duration::from_millis(400),
        );
        config.rebroadcast_tick = Duration::from_millis(20);
        let mut peers = line(&registry, config, &shutdown).await;
        let dest = peers[9].contact().id;

        peers[0].messenger.relay_message(dest, "test", b"once").await.expect("relay");
        assert!(recv(&mut peers[9].inbox, Duration::from_secs(5)).await.is_some());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(recv(&mut peers[9].inbox, Duration::from_millis(100)).await.is_none());
        let arrivals = registry
            .hops
            .lock()
            .iter()
            .filter(|(_, to, _)| *to == dest)
            .count();
        assert!(arrivals > 1, "rebroadcasts should have re-sent the message");
    }

    #[tokio::test]
    async fn hop_limit_bounds_relay_length() {
        let registry = Arc::new(Registry::default());
        let (_stop, shutdown) = watch::channel(false);
        let mut peers = line(&registry, MessagingConfig::default().with_hop_limit(3), &shutdown).await;
        let dest = peers[9].contact().id;

        peers[0].messenger.relay_message(dest, "test", b"short").await.expect("relay");
        assert!(recv(&mut peers[9].inbox, Duration::from_millis(500)).await.is_none());
        assert!(registry.hops.lock().len() <= 3);
    }

    #[tokio::test]
    async fn relay_without_closer_neighbor_is_dropped() {
        let registry = Arc::new(Registry::default());
        let (_stop, shutdown) = watch::channel(false);
        let peers = line(&registry, MessagingConfig::default(), &shutdown).await;
        // peers[8] only knows peers[7] (farther) and peers[9]; forget peers[9].
        peers[8].dht.remove_contact(peers[9].contact().id).await;

        peers[8]
            .messenger
            .relay_message(peers[9].contact().id, "test", b"x")
            .await
            .expect("relay queued");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.hops.lock().is_empty());
    }

    #[tokio::test]
    async fn tampered_relay_is_rejected() {
        let registry = Arc::new(Registry::default());
        let (_stop, shutdown) = watch::channel(false);
        let a = spawn_peer(&registry, keypair(1), 4200, MessagingConfig::default(), &shutdown).await;
        let mut packed = Envelope::sign(&keypair(2), "test", b"hi")
            .expect("sign")
            .encode()
            .expect("encode");
        let last = packed.len() - 1;
        packed[last] ^= 0xFF;
        let from = Contact::new(keypair(2).node_id(), SocketAddr::from(([10, 0, 0, 2], 1)));
        assert!(matches!(
            a.messenger.handle_relay(&from, a.contact().id, 64, packed),
            RpcResponse::Error(_)
        ));
    }
}
