//! # Kademlia-style Distributed Hash Table
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `put(key, value)` | Store locally, then at the k closest nodes |
//! | `get(key)` | Local hit, else iterative FIND_VALUE |
//! | `iterative_find_node(id)` | Walk toward the contacts closest to an id |
//! | `find_neighbors(id, k, exclude)` | Routing-table query with a strict-progress bound |
//! | `bootstrap(addrs)` | Join via seed addresses |
//!
//! ## Routing Table
//!
//! 160 k-buckets indexed by the length of the shared id prefix. A full
//! bucket pings its least-recently-seen contact before admitting a
//! newcomer; the newcomer only replaces it when the ping fails.
//!
//! ## Local Store
//!
//! Forgetful and write-once: a key keeps its first value until the entry
//! expires (TTL) or is evicted (LRU over a fixed entry count).
//!
//! ## Actor Architecture
//!
//! - [`DhtNode`]: public handle, cheap to clone
//! - `DhtNodeActor`: owns routing table and store, answers over oneshots

use std::collections::{BinaryHeap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::config::DhtConfig;
use crate::crypto::sha256;
use crate::error::{NodeError, Result};
use crate::identity::{distance_cmp, millis, Contact, NodeId, ID_LEN};
use crate::messages::MAX_VALUE_SIZE;
use crate::protocols::{DhtRpc, FindValueReply};

/// DHT keys are exactly as wide as node ids.
pub type Key = [u8; ID_LEN];

/// Map an application name of any length onto a DHT key.
pub fn key_for(name: impl AsRef<[u8]>) -> Key {
    let digest = sha256(name.as_ref());
    let mut key = [0u8; ID_LEN];
    key.copy_from_slice(&digest[..ID_LEN]);
    key
}

const NUM_BUCKETS: usize = ID_LEN * 8;

const MAX_LOOKUP_ITERATIONS: usize = 32;

const COMMAND_CHANNEL_SIZE: usize = 256;

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Debug, Clone)]
struct RoutingBucket {
    /// Least-recently-seen first.
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full { new_contact: Contact, oldest: Contact },
}

#[derive(Clone, Debug)]
struct PendingBucketUpdate {
    bucket_index: usize,
    oldest: Contact,
    new_contact: Contact,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn touch(&mut self, contact: Contact, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            // A node that moved keeps its slot but takes the new address.
            self.contacts.remove(pos);
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Inserted;
        }

        match self.contacts.first() {
            Some(oldest) => BucketTouchOutcome::Full {
                new_contact: contact,
                oldest: *oldest,
            },
            // k == 0: nothing can ever be admitted.
            None => BucketTouchOutcome::Refreshed,
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }
}

fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    NUM_BUCKETS - 1
}

/// A random id that falls into `bucket_idx` relative to `self_id`.
fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let self_bytes = self_id.as_bytes();

    let mut distance = [0u8; ID_LEN];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add(bucket_idx.wrapping_mul(i + 1) as u8);
        }
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; ID_LEN];
    for i in 0..ID_LEN {
        target[i] = self_bytes[i] ^ distance[i];
    }
    NodeId::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: (0..NUM_BUCKETS).map(|_| RoutingBucket::new()).collect(),
        }
    }

    #[cfg(test)]
    pub fn update(&mut self, contact: Contact) {
        let _ = self.update_with_pending(contact);
    }

    fn update_with_pending(&mut self, contact: Contact) -> Option<PendingBucketUpdate> {
        if contact.id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, &contact.id);
        match self.buckets[idx].touch(contact, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full { new_contact, oldest } => Some(PendingBucketUpdate {
                bucket_index: idx,
                oldest,
                new_contact,
            }),
        }
    }

    /// Up to `k` contacts ordered by `(distance to target, id)`.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Contact> {
        self.closest_where(target, k, |_| true)
    }

    /// Up to `k` contacts strictly closer to `target` than `exclude` is.
    ///
    /// With `exclude = self` this never yields a hop that fails to make
    /// progress toward `target`, which is what relay routing relies on.
    pub fn find_neighbors(&self, target: &NodeId, k: usize, exclude: Option<&NodeId>) -> Vec<Contact> {
        match exclude {
            Some(bound) => {
                let bound = bound.xor_distance(target);
                self.closest_where(target, k, |dist| {
                    distance_cmp(dist, &bound) == std::cmp::Ordering::Less
                })
            }
            None => self.closest(target, k),
        }
    }

    fn closest_where<F>(&self, target: &NodeId, k: usize, admit: F) -> Vec<Contact>
    where
        F: Fn(&[u8; ID_LEN]) -> bool,
    {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistEntry {
            dist: [u8; ID_LEN],
            contact: Contact,
        }

        impl Ord for DistEntry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
                    .then_with(|| self.contact.id.cmp(&other.contact.id))
            }
        }

        impl PartialOrd for DistEntry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistEntry> = BinaryHeap::with_capacity(k + 1);

        for bucket in &self.buckets {
            for contact in &bucket.contacts {
                let dist = contact.id.xor_distance(target);
                if !admit(&dist) {
                    continue;
                }
                let entry = DistEntry { dist, contact: *contact };
                if heap.len() < k {
                    heap.push(entry);
                } else if let Some(max_entry) = heap.peek()
                    && entry < *max_entry
                {
                    heap.push(entry);
                    heap.pop();
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|e| e.contact).collect()
    }

    fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.id);
            return;
        }

        let _ = bucket.remove(&pending.oldest.id);
        let already_present = bucket
            .contacts
            .iter()
            .any(|contact| contact.id == pending.new_contact.id);
        if already_present {
            return;
        }
        if bucket.contacts.len() < self.k {
            bucket.contacts.push(pending.new_contact);
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if *id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].remove(id)
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.contacts.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }

    fn lookup_contact(&self, id: &NodeId) -> Option<Contact> {
        if *id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].contacts.iter().find(|c| c.id == *id).copied()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all_contacts(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|b| b.contacts.iter().copied()).collect()
    }
}

// ============================================================================
// Local Storage
// ============================================================================

struct StoredEntry {
    value: Vec<u8>,
    inserted_at: Instant,
    /// Put by this node rather than received through STORE.
    origin: bool,
}

struct LocalStore {
    entries: LruCache<Key, StoredEntry>,
    ttl: Duration,
}

impl LocalStore {
    fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Returns false when the key already holds a live value or the value
    /// is oversized.
    fn store(&mut self, key: Key, value: &[u8], origin: bool) -> bool {
        self.store_at(key, value, origin, Instant::now())
    }

    fn store_at(&mut self, key: Key, value: &[u8], origin: bool, now: Instant) -> bool {
        if value.len() > MAX_VALUE_SIZE {
            return false;
        }
        if let Some(existing) = self.entries.get_mut(&key)
            && now.saturating_duration_since(existing.inserted_at) < self.ttl
        {
            // A local put of a value we already hold makes us its origin.
            if origin && existing.value == value {
                existing.origin = true;
            }
            return false;
        }
        self.entries.put(
            key,
            StoredEntry {
                value: value.to_vec(),
                inserted_at: now,
                origin,
            },
        );
        true
    }

    fn get(&mut self, key: &Key) -> Option<Vec<u8>> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&mut self, key: &Key, now: Instant) -> Option<Vec<u8>> {
        let expired = match self.entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.inserted_at) >= self.ttl,
            None => return None,
        };
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<Key> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.inserted_at) >= self.ttl)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    fn originated(&self) -> Vec<(Key, Vec<u8>)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.origin)
            .map(|(k, e)| (*k, e.value.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// DHT Node
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhtStats {
    pub contacts: usize,
    pub stored_keys: usize,
}

struct LookupOutcome {
    closest: Vec<Contact>,
    value: Option<Vec<u8>>,
}

pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    self_contact: Contact,
    network: Arc<N>,
    config: DhtConfig,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            self_contact: self.self_contact,
            network: self.network.clone(),
            config: self.config.clone(),
        }
    }
}

struct DhtNodeActor<N: DhtRpc> {
    routing: RoutingTable,
    store: LocalStore,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    id: NodeId,
    k: usize,
}

enum Command {
    // State updates
    ObserveContact(Contact),
    RemoveContact(NodeId),

    // Queries
    GetLookupSeeds(NodeId, oneshot::Sender<Vec<Contact>>),
    FindNeighbors(NodeId, usize, Option<NodeId>, oneshot::Sender<Vec<Contact>>),
    LookupContact(NodeId, oneshot::Sender<Option<Contact>>),
    AllContacts(oneshot::Sender<Vec<Contact>>),
    GetLocal(Key, oneshot::Sender<Option<Vec<u8>>>),
    StoreLocal(Key, Vec<u8>, bool, oneshot::Sender<bool>),
    Originated(oneshot::Sender<Vec<(Key, Vec<u8>)>>),
    Stats(oneshot::Sender<DhtStats>),

    // RPC Handlers
    HandleFindNode(Contact, NodeId, oneshot::Sender<Vec<Contact>>),
    HandleFindValue(Contact, Key, oneshot::Sender<FindValueReply>),
    HandleStore(Contact, Key, Vec<u8>),

    // Maintenance
    GetStaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingBucketUpdate, bool),
    ExpireEntries,

    Quit,
}

impl<N: DhtRpc> DhtNode<N> {
    pub fn new(self_contact: Contact, network: N, config: DhtConfig) -> Self {
        Self::with_shared_network(self_contact, Arc::new(network), config)
    }

    pub fn with_shared_network(self_contact: Contact, network: Arc<N>, config: DhtConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let actor = DhtNodeActor {
            routing: RoutingTable::new(self_contact.id, config.k),
            store: LocalStore::new(config.max_entries, config.ttl),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            id: self_contact.id,
            k: config.k,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            self_contact,
            network,
            config,
        }
    }

    pub fn id(&self) -> NodeId {
        self.self_contact.id
    }

    pub fn contact(&self) -> Contact {
        self.self_contact
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| NodeError::Cancelled)?;
        rx.await.map_err(|_| NodeError::Cancelled)
    }

    /// Record a contact we heard from. Never inserts ourselves.
    pub async fn observe_contact(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ObserveContact(contact)).await;
    }

    pub async fn remove_contact(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::RemoveContact(id)).await;
    }

    pub async fn lookup_contact(&self, id: &NodeId) -> Option<Contact> {
        self.request(|tx| Command::LookupContact(*id, tx)).await.ok().flatten()
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.request(Command::AllContacts).await.unwrap_or_default()
    }

    pub async fn stats(&self) -> DhtStats {
        self.request(Command::Stats).await.unwrap_or_default()
    }

    /// Up to `k` known contacts strictly closer to `target` than `exclude`.
    pub async fn find_neighbors(&self, target: NodeId, k: usize, exclude: Option<NodeId>) -> Vec<Contact> {
        self.request(|tx| Command::FindNeighbors(target, k, exclude, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_find_node(&self, from: &Contact, target: NodeId) -> Vec<Contact> {
        self.request(|tx| Command::HandleFindNode(*from, target, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_find_value(&self, from: &Contact, key: Key) -> FindValueReply {
        self.request(|tx| Command::HandleFindValue(*from, key, tx))
            .await
            .unwrap_or(FindValueReply::Closer(Vec::new()))
    }

    pub async fn handle_store(&self, from: &Contact, key: Key, value: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::HandleStore(*from, key, value)).await;
    }

    pub async fn get_local(&self, key: &Key) -> Option<Vec<u8>> {
        self.request(|tx| Command::GetLocal(*key, tx)).await.ok().flatten()
    }

    async fn store_local(&self, key: Key, value: Vec<u8>, origin: bool) -> bool {
        self.request(|tx| Command::StoreLocal(key, value, origin, tx))
            .await
            .unwrap_or(false)
    }

    /// Ping each seed to learn its id, then look ourselves up.
    ///
    /// Returns the number of contacts known afterwards.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let mut join_set = JoinSet::new();
        for &addr in seeds {
            let net = self.network.clone();
            let timeout = self.config.query_timeout;
            join_set.spawn(async move {
                let result = tokio::time::timeout(timeout, net.ping_addr(addr)).await;
                (addr, result.unwrap_or(Err(NodeError::Timeout)))
            });
        }

        let mut reached = 0usize;
        while let Some(joined) = join_set.join_next().await {
            let Ok((addr, result)) = joined else { continue };
            match result {
                Ok(id) if id != self.id() => {
                    reached += 1;
                    self.observe_contact(Contact::new(id, addr)).await;
                }
                Ok(_) => debug!(%addr, "bootstrap seed is ourselves"),
                Err(e) => debug!(%addr, error = %e, "bootstrap seed unreachable"),
            }
        }

        if !seeds.is_empty() && reached == 0 {
            return Err(NodeError::Unreachable("no bootstrap seed answered".into()));
        }

        self.iterative_find_node(self.id()).await?;
        let known = self.stats().await.contacts;
        info!(seeds = seeds.len(), reached, known, "bootstrap complete");
        Ok(known)
    }

    pub async fn iterative_find_node(&self, target: NodeId) -> Result<Vec<Contact>> {
        Ok(self.iterative_lookup(target, None).await?.closest)
    }

    async fn iterative_lookup(&self, target: NodeId, value_key: Option<Key>) -> Result<LookupOutcome> {
        let lookup_start = Instant::now();
        let k = self.config.k;
        let alpha = self.config.alpha.max(1);
        let self_id = self.id();

        let mut shortlist = self.request(|tx| Command::GetLookupSeeds(target, tx)).await?;
        let mut seen: HashSet<NodeId> = shortlist.iter().map(|c| c.id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut best_distance = shortlist
            .first()
            .map(|c| c.id.xor_distance(&target))
            .unwrap_or([0xff; ID_LEN]);
        // After a round without progress, query every unqueried contact among
        // the k closest once before giving up.
        let mut exhaustive = false;

        for _ in 0..MAX_LOOKUP_ITERATIONS {
            if lookup_start.elapsed() > self.config.walk_timeout {
                debug!(
                    target = %target.short(),
                    elapsed_ms = millis(lookup_start.elapsed()),
                    "iterative lookup hit walk timeout"
                );
                break;
            }

            let batch = if exhaustive { k } else { alpha };
            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.id) && c.id != self_id)
                .take(batch)
                .copied()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.id);
            }

            let query_timeout = self.config.query_timeout;
            let mut join_set = JoinSet::new();
            for contact in candidates {
                let net = self.network.clone();
                join_set.spawn(async move {
                    let result = match value_key {
                        Some(key) => tokio::time::timeout(query_timeout, net.find_value(&contact, key)).await,
                        None => tokio::time::timeout(query_timeout, async {
                            net.find_node(&contact, target).await.map(FindValueReply::Closer)
                        })
                        .await,
                    };
                    (contact, result.unwrap_or(Err(NodeError::Timeout)))
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, result)) = joined else { continue };
                match result {
                    Ok(FindValueReply::Value(value)) => {
                        self.observe_contact(contact).await;
                        join_set.abort_all();
                        trace!(target = %target.short(), from = %contact.id.short(), "value found");
                        return Ok(LookupOutcome {
                            closest: shortlist,
                            value: Some(value),
                        });
                    }
                    Ok(FindValueReply::Closer(nodes)) => {
                        self.observe_contact(contact).await;
                        for n in nodes.into_iter().take(k) {
                            if n.id != self_id && seen.insert(n.id) {
                                shortlist.push(n);
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %contact.id.short(), error = %e, "lookup query failed");
                        self.remove_contact(contact.id).await;
                        shortlist.retain(|c| c.id != contact.id);
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                distance_cmp(&a.id.xor_distance(&target), &b.id.xor_distance(&target))
                    .then_with(|| a.id.cmp(&b.id))
            });
            shortlist.truncate(k);

            let improved = shortlist.first().is_some_and(|first| {
                let new_best = first.id.xor_distance(&target);
                if distance_cmp(&new_best, &best_distance) == std::cmp::Ordering::Less {
                    best_distance = new_best;
                    true
                } else {
                    false
                }
            });

            if improved {
                exhaustive = false;
            } else if exhaustive {
                break;
            } else {
                exhaustive = true;
            }
        }

        debug!(
            target = %target.short(),
            found = shortlist.len(),
            queried = queried.len(),
            "iterative lookup completed"
        );

        Ok(LookupOutcome {
            closest: shortlist,
            value: None,
        })
    }

    /// Store locally, then best-effort at the k closest nodes.
    ///
    /// Returns the number of remote nodes that acknowledged the store.
    pub async fn put(&self, key: Key, value: Vec<u8>) -> Result<usize> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(NodeError::MessageTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.store_local(key, value.clone(), true).await;
        let stored = self.replicate(key, value).await?;
        debug!(key = %hex::encode(&key[..8]), replicas = stored, "put complete");
        Ok(stored)
    }

    async fn replicate(&self, key: Key, value: Vec<u8>) -> Result<usize> {
        let closest = self.iterative_find_node(NodeId::from_bytes(key)).await?;

        let mut join_set = JoinSet::new();
        for contact in closest.into_iter().take(self.config.k) {
            let net = self.network.clone();
            let value = value.clone();
            let timeout = self.config.query_timeout;
            join_set.spawn(async move {
                matches!(
                    tokio::time::timeout(timeout, net.store(&contact, key, value)).await,
                    Ok(Ok(()))
                )
            });
        }

        let mut stored = 0;
        while let Some(joined) = join_set.join_next().await {
            if let Ok(true) = joined {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Local hit first, then the first value observed during an iterative
    /// FIND_VALUE.
    pub async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.get_local(key).await {
            return Ok(Some(value));
        }
        let outcome = self.iterative_lookup(NodeId::from_bytes(*key), Some(*key)).await?;
        Ok(outcome.value)
    }

    /// Re-store every locally originated entry at the current k closest.
    pub async fn republish(&self) -> usize {
        let entries = self.request(Command::Originated).await.unwrap_or_default();
        let mut republished = 0;
        for (key, value) in entries {
            match self.replicate(key, value).await {
                Ok(n) if n > 0 => republished += 1,
                Ok(_) => {}
                Err(e) => debug!(key = %hex::encode(&key[..8]), error = %e, "republish failed"),
            }
        }
        republished
    }

    /// One maintenance pass: drop expired entries, re-walk toward our own id
    /// and refresh buckets that saw no traffic for a refresh interval.
    pub async fn refresh(&self) {
        let _ = self.cmd_tx.send(Command::ExpireEntries).await;

        if let Err(e) = self.iterative_find_node(self.id()).await {
            debug!(error = %e, "self lookup failed during refresh");
        }

        let threshold = self.config.refresh_interval;
        let stale = self
            .request(|tx| Command::GetStaleBuckets(threshold, tx))
            .await
            .unwrap_or_default();
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "refreshing stale routing buckets");
        for bucket_idx in stale {
            let target = random_id_for_bucket(&self.id(), bucket_idx);
            if let Err(e) = self.iterative_find_node(target).await {
                debug!(bucket = bucket_idx, error = %e, "bucket refresh lookup failed");
            }
            let _ = self.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
        }
    }

    /// Neighbor refresher loop. Runs until the stop flag flips.
    pub async fn run_maintenance(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        interval.tick().await;
        let mut last_republish = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.refresh().await;
            if last_republish.elapsed() >= self.config.republish_interval {
                let count = self.republish().await;
                debug!(count, "republished local entries");
                last_republish = Instant::now();
            }
        }
        trace!("dht maintenance stopped");
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<N: DhtRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObserveContact(contact) => {
                    self.handle_observe_contact(contact);
                }
                Command::RemoveContact(id) => {
                    self.routing.remove(&id);
                }
                Command::GetLookupSeeds(target, reply) => {
                    let _ = reply.send(self.routing.closest(&target, self.k));
                }
                Command::FindNeighbors(target, k, exclude, reply) => {
                    let _ = reply.send(self.routing.find_neighbors(&target, k, exclude.as_ref()));
                }
                Command::LookupContact(id, reply) => {
                    let _ = reply.send(self.routing.lookup_contact(&id));
                }
                Command::AllContacts(reply) => {
                    let _ = reply.send(self.routing.all_contacts());
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.store.get(&key));
                }
                Command::StoreLocal(key, value, origin, reply) => {
                    let _ = reply.send(self.store.store(key, &value, origin));
                }
                Command::Originated(reply) => {
                    let _ = reply.send(self.store.originated());
                }
                Command::Stats(reply) => {
                    let _ = reply.send(DhtStats {
                        contacts: self.routing.len(),
                        stored_keys: self.store.len(),
                    });
                }
                Command::HandleFindNode(from, target, reply) => {
                    self.handle_observe_contact(from);
                    let _ = reply.send(self.routing.closest(&target, self.k));
                }
                Command::HandleFindValue(from, key, reply) => {
                    self.handle_observe_contact(from);
                    let response = match self.store.get(&key) {
                        Some(value) => FindValueReply::Value(value),
                        None => FindValueReply::Closer(
                            self.routing.closest(&NodeId::from_bytes(key), self.k),
                        ),
                    };
                    let _ = reply.send(response);
                }
                Command::HandleStore(from, key, value) => {
                    self.handle_observe_contact(from);
                    let accepted = self.store.store(key, &value, false);
                    trace!(
                        from = %from.id.short(),
                        key = %hex::encode(&key[..8]),
                        accepted,
                        "handled STORE"
                    );
                }
                Command::GetStaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_bucket_indices(threshold));
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.routing.mark_bucket_refreshed(idx);
                }
                Command::ApplyPingResult(pending, alive) => {
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::ExpireEntries => {
                    let expired = self.store.expire(Instant::now());
                    if expired > 0 {
                        debug!(expired, "expired dht entries");
                    }
                }
                Command::Quit => break,
            }
        }
    }

    fn handle_observe_contact(&mut self, contact: Contact) {
        if contact.id == self.id {
            return;
        }
        if let Some(update) = self.routing.update_with_pending(contact) {
            let network = self.network.clone();
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let alive = network.ping(&update.oldest).await.is_ok();
                let _ = tx.send(Command::ApplyPingResult(update, alive)).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use async_trait::async_trait;
    use tokio::sync::{Mutex, RwLock};
    use tokio::time::sleep;

    #[derive(Clone)]
    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        self_contact: Contact,
        failures: Arc<Mutex<HashSet<NodeId>>>,
        stores: Arc<Mutex<Vec<(NodeId, Key)>>>,
        pings: Arc<Mutex<Vec<NodeId>>>,
    }

    impl TestNetwork {
        fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
            Self {
                registry,
                self_contact,
                failures: Arc::new(Mutex::new(HashSet::new())),
                stores: Arc::new(Mutex::new(Vec::new())),
                pings: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn set_failure(&self, node: NodeId, fail: bool) {
            let mut failures = self.failures.lock().await;
            if fail {
                failures.insert(node);
            } else {
                failures.remove(&node);
            }
        }

        async fn store_calls(&self) -> Vec<(NodeId, Key)> {
            self.stores.lock().await.clone()
        }

        async fn ping_calls(&self) -> Vec<NodeId> {
            self.pings.lock().await.clone()
        }

        async fn check(&self, node: &NodeId) -> Result<DhtNode<TestNetwork>> {
            if self.failures.lock().await.contains(node) {
                return Err(NodeError::Timeout);
            }
            self.registry
                .get(node)
                .await
                .ok_or_else(|| NodeError::Unreachable("peer not registered".into()))
        }
    }

    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<NodeId, DhtNode<TestNetwork>>>,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &DhtNode<TestNetwork>) {
            self.peers.write().await.insert(node.id(), node.clone());
        }

        async fn get(&self, id: &NodeId) -> Option<DhtNode<TestNetwork>> {
            self.peers.read().await.get(id).cloned()
        }

        async fn by_addr(&self, addr: SocketAddr) -> Option<DhtNode<TestNetwork>> {
            self.peers
                .read()
                .await
                .values()
                .find(|n| n.contact().addr == addr)
                .cloned()
        }
    }

    #[async_trait]
    impl DhtRpc for TestNetwork {
        async fn ping(&self, to: &Contact) -> Result<()> {
            self.pings.lock().await.push(to.id);
            self.check(&to.id).await.map(|_| ())
        }

        async fn ping_addr(&self, addr: SocketAddr) -> Result<NodeId> {
            let peer = self
                .registry
                .by_addr(addr)
                .await
                .ok_or(NodeError::Timeout)?;
            peer.observe_contact(self.self_contact).await;
            Ok(peer.id())
        }

        async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
            let peer = self.check(&to.id).await?;
            Ok(peer.handle_find_node(&self.self_contact, target).await)
        }

        async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply> {
            let peer = self.check(&to.id).await?;
            Ok(peer.handle_find_value(&self.self_contact, key).await)
        }

        async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
            let peer = self.check(&to.id).await?;
            self.stores.lock().await.push((to.id, key));
            peer.handle_store(&self.self_contact, key, value).await;
            Ok(())
        }
    }

    struct TestNode {
        node: DhtNode<TestNetwork>,
        network: TestNetwork,
    }

    impl TestNode {
        async fn new(registry: Arc<NetworkRegistry>, index: u32, k: usize) -> Self {
            let contact = make_contact(index);
            let network = TestNetwork::new(registry.clone(), contact);
            let config = DhtConfig::default()
                .with_k(k)
                .with_query_timeout(Duration::from_millis(500));
            let node = DhtNode::new(contact, network.clone(), config);
            registry.register(&node).await;
            Self { node, network }
        }

        fn contact(&self) -> Contact {
            self.node.contact()
        }
    }

    fn make_id(index: u32) -> NodeId {
        NodeId::from_bytes(key_for(index.to_be_bytes()))
    }

    fn make_contact(index: u32) -> Contact {
        let hi = ((index >> 8) & 0xFF) as u8;
        let lo = (index & 0xFF) as u8;
        Contact::new(make_id(index), SocketAddr::from(([10, hi, lo, 1], 9001)))
    }

    fn find_same_bucket_indices() -> (u32, u32, u32) {
        let main_id = make_id(0);
        for incumbent_idx in 1u32..1000 {
            let bucket = bucket_index(&main_id, &make_id(incumbent_idx));
            for challenger_idx in (incumbent_idx + 1)..1000 {
                if bucket_index(&main_id, &make_id(challenger_idx)) == bucket {
                    return (0, incumbent_idx, challenger_idx);
                }
            }
        }
        panic!("could not find same-bucket indices");
    }

    // ------------------------------------------------------------------
    // Routing table
    // ------------------------------------------------------------------

    #[test]
    fn routing_table_never_holds_self() {
        let self_contact = make_contact(0);
        let mut table = RoutingTable::new(self_contact.id, 20);
        table.update(self_contact);
        assert!(table.is_empty());
    }

    #[test]
    fn closest_orders_by_distance() {
        let mut table = RoutingTable::new(make_id(0), 20);
        for i in 1..50 {
            table.update(make_contact(i));
        }
        let target = make_id(1000);
        let closest = table.closest(&target, 10);
        assert_eq!(closest.len(), 10);
        for pair in closest.windows(2) {
            assert_eq!(
                distance_cmp(&pair[0].id.xor_distance(&target), &pair[1].id.xor_distance(&target)),
                std::cmp::Ordering::Less
            );
        }
    }

    #[test]
    fn find_neighbors_only_returns_strictly_closer_contacts() {
        let self_id = make_id(0);
        let mut table = RoutingTable::new(self_id, 20);
        for i in 1..60 {
            table.update(make_contact(i));
        }
        let dest = make_id(5000);
        let neighbors = table.find_neighbors(&dest, 20, Some(&self_id));
        let own = self_id.xor_distance(&dest);
        for n in &neighbors {
            assert_eq!(
                distance_cmp(&n.id.xor_distance(&dest), &own),
                std::cmp::Ordering::Less
            );
        }

        let best = table.find_neighbors(&dest, 1, Some(&self_id));
        if let Some(first) = best.first() {
            assert_eq!(Some(*first), table.closest(&dest, 1).first().copied());
        }
    }

    #[test]
    fn find_neighbors_empty_when_self_is_closest() {
        let self_id = make_id(0);
        let mut table = RoutingTable::new(self_id, 20);
        for i in 1..20 {
            table.update(make_contact(i));
        }
        assert!(table.find_neighbors(&self_id, 5, Some(&self_id)).is_empty());
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let self_id = make_id(7);
        for bucket in [0usize, 1, 7, 8, 63, 159] {
            let id = random_id_for_bucket(&self_id, bucket);
            assert_eq!(bucket_index(&self_id, &id), bucket);
        }
    }

    #[test]
    fn key_for_is_deterministic_and_sized() {
        assert_eq!(key_for("k"), key_for(b"k"));
        assert_ne!(key_for("k"), key_for("v"));
        assert_eq!(key_for("k").len(), ID_LEN);
    }

    // ------------------------------------------------------------------
    // Local store
    // ------------------------------------------------------------------

    #[test]
    fn store_is_write_once() {
        let mut store = LocalStore::new(16, Duration::from_secs(60));
        let key = key_for("k");
        assert!(store.store(key, b"v", false));
        assert!(!store.store(key, b"v2", false));
        assert_eq!(store.get(&key), Some(b"v".to_vec()));
    }

    #[test]
    fn store_expires_after_ttl() {
        let ttl = Duration::from_secs(604_800);
        let mut store = LocalStore::new(16, ttl);
        let key = key_for("k");
        let start = Instant::now();
        assert!(store.store_at(key, b"v", false, start));
        assert!(store.get_at(&key, start + ttl - Duration::from_secs(1)).is_some());
        assert!(store.get_at(&key, start + ttl).is_none());

        // An expired key accepts a new value.
        assert!(store.store_at(key, b"v2", false, start + ttl));
        assert_eq!(store.get_at(&key, start + ttl), Some(b"v2".to_vec()));
    }

    #[test]
    fn store_evicts_least_recently_used() {
        let mut store = LocalStore::new(2, Duration::from_secs(60));
        let (a, b, c) = (key_for("a"), key_for("b"), key_for("c"));
        store.store(a, b"1", false);
        store.store(b, b"2", false);
        assert!(store.get(&a).is_some());
        store.store(c, b"3", false);
        assert_eq!(store.len(), 2);
        assert!(store.get(&b).is_none());
        assert!(store.get(&a).is_some());
    }

    #[test]
    fn store_rejects_oversized_values() {
        let mut store = LocalStore::new(2, Duration::from_secs(60));
        assert!(!store.store(key_for("big"), &[0u8; MAX_VALUE_SIZE + 1], false));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn originated_entries_are_tracked() {
        let mut store = LocalStore::new(8, Duration::from_secs(60));
        store.store(key_for("mine"), b"1", true);
        store.store(key_for("theirs"), b"2", false);
        let originated = store.originated();
        assert_eq!(originated, vec![(key_for("mine"), b"1".to_vec())]);
    }

    // ------------------------------------------------------------------
    // Bucket maintenance
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn responsive_contacts_survive_bucket_eviction() {
        let (main_idx, responsive_idx, challenger_idx) = find_same_bucket_indices();
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::new(registry.clone(), main_idx, 1).await;
        let responsive = TestNode::new(registry.clone(), responsive_idx, 1).await;
        let challenger = TestNode::new(registry.clone(), challenger_idx, 1).await;

        main.node.observe_contact(responsive.contact()).await;
        main.node.observe_contact(challenger.contact()).await;

        sleep(Duration::from_millis(50)).await;

        let closest = main
            .node
            .handle_find_node(&main.contact(), challenger.contact().id)
            .await;
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, responsive.contact().id);
    }

    #[tokio::test]
    async fn failed_pings_trigger_bucket_replacement() {
        let (main_idx, stale_idx, newcomer_idx) = find_same_bucket_indices();
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::new(registry.clone(), main_idx, 1).await;
        let stale = TestNode::new(registry.clone(), stale_idx, 1).await;
        let newcomer = TestNode::new(registry.clone(), newcomer_idx, 1).await;

        main.node.observe_contact(stale.contact()).await;
        main.network.set_failure(stale.contact().id, true).await;
        main.node.observe_contact(newcomer.contact()).await;

        sleep(Duration::from_millis(50)).await;

        let closest = main
            .node
            .handle_find_node(&main.contact(), newcomer.contact().id)
            .await;
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, newcomer.contact().id);
    }

    #[tokio::test]
    async fn full_bucket_pings_oldest_before_eviction() {
        let (main_idx, incumbent_idx, challenger_idx) = find_same_bucket_indices();
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::new(registry.clone(), main_idx, 1).await;
        let incumbent = TestNode::new(registry.clone(), incumbent_idx, 1).await;
        let challenger = TestNode::new(registry.clone(), challenger_idx, 1).await;

        main.node.observe_contact(incumbent.contact()).await;
        main.node.observe_contact(challenger.contact()).await;

        sleep(Duration::from_millis(50)).await;

        assert_eq!(main.network.ping_calls().await, vec![incumbent.contact().id]);
    }

    // ------------------------------------------------------------------
    // Lookups and storage over the test network
    // ------------------------------------------------------------------

    async fn fully_connected(registry: &Arc<NetworkRegistry>, count: u32) -> Vec<TestNode> {
        let mut nodes = Vec::new();
        for i in 0..count {
            nodes.push(TestNode::new(registry.clone(), 0x10 + i, 20).await);
        }
        for i in 0..nodes.len() {
            for j in 0..nodes.len() {
                if i != j {
                    nodes[i].node.observe_contact(nodes[j].contact()).await;
                }
            }
        }
        nodes
    }

    #[tokio::test]
    async fn iterative_find_node_returns_expected_contacts() {
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::new(registry.clone(), 0x10, 20).await;
        let peer_one = TestNode::new(registry.clone(), 0x11, 20).await;
        let peer_two = TestNode::new(registry.clone(), 0x12, 20).await;

        for peer in [&peer_one, &peer_two] {
            main.node.observe_contact(peer.contact()).await;
            peer.node.observe_contact(main.contact()).await;
        }

        let target = peer_two.contact().id;
        let results = main.node.iterative_find_node(target).await.expect("lookup succeeds");

        assert_eq!(results.first().map(|c| c.id), Some(target));
        assert!(results.iter().any(|c| c.id == peer_one.contact().id));
    }

    #[tokio::test]
    async fn lookup_drops_failing_contacts() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = fully_connected(&registry, 4).await;
        let dead = nodes[3].contact().id;
        nodes[0].network.set_failure(dead, true).await;

        let results = nodes[0].node.iterative_find_node(make_id(9999)).await.expect("lookup");
        assert!(results.iter().all(|c| c.id != dead));
        assert!(nodes[0].node.lookup_contact(&dead).await.is_none());
    }

    #[tokio::test]
    async fn put_then_get_from_another_node() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = fully_connected(&registry, 8).await;

        let key = key_for("k");
        let replicas = nodes[0].node.put(key, b"v".to_vec()).await.expect("put");
        assert!(replicas > 0);

        let value = nodes[7].node.get(&key).await.expect("get");
        assert_eq!(value, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn second_put_keeps_first_value() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = fully_connected(&registry, 4).await;

        let key = key_for("once");
        nodes[0].node.put(key, b"first".to_vec()).await.expect("put");
        nodes[1].node.put(key, b"second".to_vec()).await.expect("put");

        for node in &nodes {
            assert_eq!(node.node.get(&key).await.expect("get"), Some(b"first".to_vec()));
        }
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = fully_connected(&registry, 3).await;
        assert_eq!(nodes[0].node.get(&key_for("missing")).await.expect("get"), None);
    }

    #[tokio::test]
    async fn put_rejects_oversized_value() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(registry.clone(), 1, 20).await;
        let result = node.node.put(key_for("big"), vec![0u8; MAX_VALUE_SIZE + 1]).await;
        assert!(matches!(result, Err(NodeError::MessageTooLarge { .. })));
    }

    #[tokio::test]
    async fn bootstrap_learns_seed_ids() {
        let registry = Arc::new(NetworkRegistry::default());
        let seed = TestNode::new(registry.clone(), 0x70, 20).await;
        let other = TestNode::new(registry.clone(), 0x71, 20).await;
        seed.node.observe_contact(other.contact()).await;
        other.node.observe_contact(seed.contact()).await;

        let joiner = TestNode::new(registry.clone(), 0x72, 20).await;
        let known = joiner.node.bootstrap(&[seed.contact().addr]).await.expect("bootstrap");

        assert_eq!(known, 2);
        assert!(joiner.node.lookup_contact(&seed.contact().id).await.is_some());
        assert!(joiner.node.lookup_contact(&other.contact().id).await.is_some());
    }

    #[tokio::test]
    async fn bootstrap_fails_when_no_seed_answers() {
        let registry = Arc::new(NetworkRegistry::default());
        let joiner = TestNode::new(registry.clone(), 0x80, 20).await;
        let result = joiner
            .node
            .bootstrap(&[SocketAddr::from(([10, 9, 9, 9], 1))])
            .await;
        assert!(matches!(result, Err(NodeError::Unreachable(_))));
    }

    #[tokio::test]
    async fn republish_restores_originated_entries() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = fully_connected(&registry, 3).await;

        let key = key_for("republished");
        nodes[0].node.put(key, b"v".to_vec()).await.expect("put");
        let before = nodes[0].network.store_calls().await.len();

        assert_eq!(nodes[0].node.republish().await, 1);
        let after = nodes[0].network.store_calls().await;
        assert!(after.len() > before);
        assert!(after.iter().all(|(_, k)| *k == key));
    }

    #[tokio::test]
    async fn stats_report_contacts_and_keys() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = fully_connected(&registry, 3).await;
        nodes[0].node.put(key_for("a"), b"1".to_vec()).await.expect("put");

        let stats = nodes[0].node.stats().await;
        assert_eq!(stats.contacts, 2);
        assert_eq!(stats.stored_keys, 1);
    }
}
