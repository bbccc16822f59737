//! # Bandwidth Test
//!
//! Measures the link between two nodes by pushing real shards through the
//! transfer layer in both directions:
//!
//! 1. the requester stores a random shard and relays a signed
//!    `test_bandwidth_request` naming it;
//! 2. the target checks the request, stores a random shard of its own and
//!    relays a signed `test_bandwidth_response` naming that one;
//! 3. the requester uploads its shard to the target while the target uploads
//!    its shard to the requester;
//! 4. each side times both transfers from start to completion.
//!
//! While a direction finishes faster than the escalation threshold the test
//! repeats at the next size on the schedule. One test per node at a time;
//! every test deletes its shards when it ends, however it ends.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::BandwidthTestConfig;
use crate::contract::Role;
use crate::crypto::{BANDWIDTH_TEST_SIGNATURE_DOMAIN, recover_with_domain, sha256, sign_with_domain};
use crate::error::{NodeError, RejectReason, Result};
use crate::identity::{Keypair, NodeId};
use crate::messages::{deserialize_bounded, serialize};
use crate::messaging::{Delivery, MessageSender};
use crate::store::{ShardId, ShardStore};
use crate::transfer::{TransferEvent, TransferManager, TransferReport};
use crate::unl::Unl;

pub const REQUEST_TOKEN: &str = "test_bandwidth_request";
pub const RESPONSE_TOKEN: &str = "test_bandwidth_response";

const BUSY_RETRIES: usize = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(500);
const TIMEOUT_TICK: Duration = Duration::from_secs(1);
const FILL_CHUNK: usize = 64 * 1024;

// ============================================================================
// Messages
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRequest {
    pub nonce: u64,
    pub requester: Unl,
    pub target: Unl,
    pub data_id: [u8; 32],
    pub file_size: u64,
    pub signature: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestRejection {
    Busy,
    NotAddressed,
    BadSignature,
    Storage,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestOutcome {
    Accepted { data_id: [u8; 32], file_size: u64 },
    Rejected(TestRejection),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResponse {
    pub nonce: u64,
    pub request_digest: [u8; 32],
    pub responder: Unl,
    pub outcome: TestOutcome,
    pub signature: Vec<u8>,
}

fn sign_fields<T: Serialize>(keypair: &Keypair, fields: &T) -> Result<Vec<u8>> {
    let bytes = serialize(fields)?;
    sign_with_domain(keypair, BANDWIDTH_TEST_SIGNATURE_DOMAIN, &bytes)
        .map(|sig| sig.to_vec())
        .map_err(|_| NodeError::BadSignature)
}

fn recover_fields<T: Serialize>(fields: &T, signature: &[u8]) -> Result<NodeId> {
    let bytes = serialize(fields)?;
    recover_with_domain(BANDWIDTH_TEST_SIGNATURE_DOMAIN, &bytes, signature).map_err(|_| NodeError::BadSignature)
}

impl TestRequest {
    fn unsigned_fields(&self) -> (u64, &Unl, &Unl, &[u8; 32], u64) {
        (self.nonce, &self.requester, &self.target, &self.data_id, self.file_size)
    }

    pub fn sign(mut self, keypair: &Keypair) -> Result<Self> {
        self.signature = sign_fields(keypair, &self.unsigned_fields())?;
        Ok(self)
    }

    /// The requester named in the request must have signed it.
    pub fn verify(&self) -> Result<()> {
        if recover_fields(&self.unsigned_fields(), &self.signature)? != self.requester.node_id {
            return Err(NodeError::BadSignature);
        }
        Ok(())
    }

    pub fn digest(&self) -> Result<[u8; 32]> {
        Ok(sha256(&serialize(self)?))
    }
}

impl TestResponse {
    fn unsigned_fields(&self) -> (u64, &[u8; 32], &Unl, &TestOutcome) {
        (self.nonce, &self.request_digest, &self.responder, &self.outcome)
    }

    pub fn sign(mut self, keypair: &Keypair) -> Result<Self> {
        self.signature = sign_fields(keypair, &self.unsigned_fields())?;
        Ok(self)
    }

    pub fn verify(&self) -> Result<()> {
        if recover_fields(&self.unsigned_fields(), &self.signature)? != self.responder.node_id {
            return Err(NodeError::BadSignature);
        }
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BandwidthResult {
    /// Size of each test shard.
    pub size: u64,
    /// Requester → target, bytes per second.
    pub upload_bps: f64,
    /// Target → requester, bytes per second.
    pub download_bps: f64,
    pub upload_time: Duration,
    pub download_time: Duration,
}

/// A test that finished quickly in some direction says little; try a bigger one.
pub fn should_escalate(result: &BandwidthResult, threshold: Duration) -> bool {
    let fast = result.upload_time < threshold || result.download_time < threshold;
    let measured = result.upload_bps > 0.0 && result.download_bps > 0.0;
    fast && measured
}

// ============================================================================
// Tester
// ============================================================================

enum TestState {
    Idle,
    Requesting {
        nonce: u64,
        target: NodeId,
        reply: Option<oneshot::Sender<TestResponse>>,
    },
    Serving {
        nonce: u64,
        requester: NodeId,
        shards: Vec<ShardId>,
        since: Instant,
    },
}

struct TesterInner {
    keypair: Keypair,
    transfers: TransferManager,
    store: Arc<dyn ShardStore>,
    messages: Arc<dyn MessageSender>,
    config: BandwidthTestConfig,
    state: Mutex<TestState>,
    last: Mutex<Option<BandwidthResult>>,
}

#[derive(Clone)]
pub struct BandwidthTester {
    inner: Arc<TesterInner>,
}

/// Resets a requester-side test however `test` exits.
struct RequestGuard<'a>(&'a TesterInner);

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        if matches!(*state, TestState::Requesting { .. }) {
            *state = TestState::Idle;
        }
    }
}

impl BandwidthTester {
    pub fn new(
        keypair: Keypair,
        transfers: TransferManager,
        messages: Arc<dyn MessageSender>,
        config: BandwidthTestConfig,
    ) -> Self {
        let store = transfers.store().clone();
        Self {
            inner: Arc::new(TesterInner {
                keypair,
                transfers,
                store,
                messages,
                config,
                state: Mutex::new(TestState::Idle),
                last: Mutex::new(None),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(*self.inner.state.lock(), TestState::Idle)
    }

    /// The most recent successful measurement.
    pub fn last_result(&self) -> Option<BandwidthResult> {
        *self.inner.last.lock()
    }

    /// Measure the link to `target`, escalating the size while tests finish fast.
    pub async fn test(&self, target: Unl) -> Result<BandwidthResult> {
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, TestState::Idle) {
                return Err(NodeError::Busy("bandwidth test already running"));
            }
            *state = TestState::Requesting {
                nonce: 0,
                target: target.node_id,
                reply: None,
            };
        }
        let _guard = RequestGuard(&self.inner);

        let threshold = self.inner.config.escalation_threshold;
        let mut best: Option<BandwidthResult> = None;
        for &size in &self.inner.config.sizes {
            let result = match self.round_with_retry(&target, size).await {
                Ok(result) => result,
                Err(e) => match best {
                    Some(_) => {
                        warn!(peer = %target.node_id.short(), size, error = %e, "escalated bandwidth test failed");
                        break;
                    }
                    None => return Err(e),
                },
            };
            info!(
                peer = %target.node_id.short(),
                size,
                upload_bps = result.upload_bps as u64,
                download_bps = result.download_bps as u64,
                "bandwidth test round complete"
            );
            best = Some(result);
            if !should_escalate(&result, threshold) {
                break;
            }
        }

        let best = best.ok_or(NodeError::Busy("no test sizes configured"))?;
        *self.inner.last.lock() = Some(best);
        Ok(best)
    }

    async fn round_with_retry(&self, target: &Unl, size: u64) -> Result<BandwidthResult> {
        let mut attempt = 0;
        loop {
            match self.round(target, size).await {
                Err(NodeError::Busy(reason)) if attempt + 1 < BUSY_RETRIES => {
                    debug!(peer = %target.node_id.short(), reason, "target busy, retrying");
                    attempt += 1;
                    tokio::time::sleep(BUSY_BACKOFF).await;
                }
                other => return other,
            }
        }
    }

    async fn round(&self, target: &Unl, size: u64) -> Result<BandwidthResult> {
        let inner = &self.inner;
        let events = inner.transfers.subscribe();
        let ours = random_shard(inner.store.as_ref(), size).await?;

        let outcome = self.exchange(target, size, ours, events).await;
        let _ = inner.store.remove(&ours).await;
        if let Ok((_, theirs)) = &outcome {
            let _ = inner.store.remove(theirs).await;
        }
        outcome.map(|(result, _)| result)
    }

    async fn exchange(
        &self,
        target: &Unl,
        size: u64,
        ours: ShardId,
        mut events: broadcast::Receiver<TransferEvent>,
    ) -> Result<(BandwidthResult, ShardId)> {
        let inner = &self.inner;
        let request = TestRequest {
            nonce: rand::random(),
            requester: *inner.transfers.local_unl(),
            target: *target,
            data_id: *ours.as_bytes(),
            file_size: size,
            signature: Vec::new(),
        }
        .sign(&inner.keypair)?;
        let digest = request.digest()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = inner.state.lock();
            *state = TestState::Requesting {
                nonce: request.nonce,
                target: target.node_id,
                reply: Some(tx),
            };
        }
        inner
            .messages
            .send_relay(target.node_id, REQUEST_TOKEN, &serialize(&request)?)
            .await?;

        let response = tokio::time::timeout(inner.config.timeout, rx)
            .await
            .map_err(|_| NodeError::Timeout)?
            .map_err(|_| NodeError::Cancelled)?;
        if response.request_digest != digest {
            return Err(NodeError::BadEnvelope("response for a different request".into()));
        }
        let theirs = match response.outcome {
            TestOutcome::Accepted { data_id, .. } => ShardId::from_bytes(data_id),
            TestOutcome::Rejected(TestRejection::Busy) => return Err(NodeError::Busy("peer already testing")),
            TestOutcome::Rejected(other) => {
                debug!(peer = %target.node_id.short(), ?other, "bandwidth test refused");
                return Err(NodeError::RequestDenied(RejectReason::Aborted));
            }
        };

        let both = async {
            tokio::join!(
                inner.transfers.upload(target, ours),
                wait_for_transfer(&mut events, theirs, Role::Receive),
            )
        };
        let (up, down) = match tokio::time::timeout(inner.config.timeout, both).await {
            Ok(pair) => pair,
            Err(_) => {
                // Whatever arrived is deleted with the rest.
                let _ = inner.store.remove(&theirs).await;
                return Err(NodeError::Timeout);
            }
        };
        let (up, down) = match (up, down) {
            (Ok(up), Ok(down)) => (up, down),
            (Err(e), _) | (_, Err(e)) => {
                let _ = inner.store.remove(&theirs).await;
                return Err(e);
            }
        };

        Ok((
            BandwidthResult {
                size,
                upload_bps: up.rate(),
                download_bps: down.rate(),
                upload_time: up.elapsed(),
                download_time: down.elapsed(),
            },
            theirs,
        ))
    }

    // ------------------------------------------------------------------------
    // Target side
    // ------------------------------------------------------------------------

    async fn respond(&self, to: NodeId, request: &TestRequest, outcome: TestOutcome) -> Result<()> {
        let response = TestResponse {
            nonce: request.nonce,
            request_digest: request.digest()?,
            responder: *self.inner.transfers.local_unl(),
            outcome,
            signature: Vec::new(),
        }
        .sign(&self.inner.keypair)?;
        self.inner
            .messages
            .send_relay(to, RESPONSE_TOKEN, &serialize(&response)?)
            .await
    }

    async fn on_request(&self, delivery: Delivery) {
        let request: TestRequest = match deserialize_bounded(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                debug!(from = %delivery.sender.short(), error = %e, "undecodable bandwidth test request");
                return;
            }
        };
        let from = delivery.sender;
        let local = *self.inner.transfers.local_unl();

        let rejection = if request.verify().is_err() || request.requester.node_id != from {
            Some(TestRejection::BadSignature)
        } else if request.target.node_id != local.node_id {
            Some(TestRejection::NotAddressed)
        } else {
            let mut state = self.inner.state.lock();
            if matches!(*state, TestState::Idle) {
                *state = TestState::Serving {
                    nonce: request.nonce,
                    requester: from,
                    shards: vec![ShardId::from_bytes(request.data_id)],
                    since: Instant::now(),
                };
                None
            } else {
                Some(TestRejection::Busy)
            }
        };
        if let Some(reason) = rejection {
            info!(from = %from.short(), ?reason, "rejecting bandwidth test");
            if let Err(e) = self.respond(from, &request, TestOutcome::Rejected(reason)).await {
                debug!(error = %e, "failed to send bandwidth test rejection");
            }
            return;
        }

        let tester = self.clone();
        tokio::spawn(async move { tester.serve(from, request).await });
    }

    async fn serve(&self, requester: NodeId, request: TestRequest) {
        let inner = &self.inner;
        let theirs = ShardId::from_bytes(request.data_id);
        let mut events = inner.transfers.subscribe();

        let ours = match random_shard(inner.store.as_ref(), request.file_size).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "cannot create bandwidth test shard");
                let _ = self.respond(requester, &request, TestOutcome::Rejected(TestRejection::Storage)).await;
                self.finish_serving(request.nonce).await;
                return;
            }
        };
        if let TestState::Serving { nonce, shards, .. } = &mut *inner.state.lock()
            && *nonce == request.nonce
        {
            shards.push(ours);
        }

        let accepted = TestOutcome::Accepted {
            data_id: *ours.as_bytes(),
            file_size: request.file_size,
        };
        if let Err(e) = self.respond(requester, &request, accepted).await {
            warn!(error = %e, "failed to send bandwidth test response");
            self.finish_serving(request.nonce).await;
            return;
        }

        let both = async {
            tokio::join!(
                inner.transfers.upload(&request.requester, ours),
                wait_for_transfer(&mut events, theirs, Role::Receive),
            )
        };
        match tokio::time::timeout(inner.config.timeout, both).await {
            Ok((Ok(up), Ok(down))) => info!(
                peer = %requester.short(),
                size = request.file_size,
                upload_bps = up.rate() as u64,
                download_bps = down.rate() as u64,
                "served bandwidth test"
            ),
            Ok((up, down)) => debug!(
                peer = %requester.short(),
                upload = ?up.err(),
                download = ?down.err(),
                "bandwidth test failed on our side"
            ),
            Err(_) => debug!(peer = %requester.short(), "bandwidth test timed out"),
        }
        self.finish_serving(request.nonce).await;
    }

    /// Delete a served test's shards and go idle.
    async fn finish_serving(&self, nonce: u64) {
        let shards = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                TestState::Serving { nonce: current, shards, .. } if *current == nonce => {
                    let shards = std::mem::take(shards);
                    *state = TestState::Idle;
                    shards
                }
                _ => return,
            }
        };
        for shard in shards {
            let _ = self.inner.store.remove(&shard).await;
        }
    }

    fn on_response(&self, delivery: Delivery) {
        let response: TestResponse = match deserialize_bounded(&delivery.body) {
            Ok(response) => response,
            Err(e) => {
                debug!(from = %delivery.sender.short(), error = %e, "undecodable bandwidth test response");
                return;
            }
        };
        if response.verify().is_err() || response.responder.node_id != delivery.sender {
            debug!(from = %delivery.sender.short(), "bandwidth test response with a bad signature");
            return;
        }
        let mut state = self.inner.state.lock();
        if let TestState::Requesting { nonce, target, reply } = &mut *state
            && *nonce == response.nonce
            && *target == delivery.sender
            && let Some(reply) = reply.take()
        {
            let _ = reply.send(response);
        }
    }

    /// Reset a served test that outlived the timeout.
    async fn expire_stalled(&self) {
        let stalled = match &*self.inner.state.lock() {
            TestState::Serving { nonce, since, requester, .. } if since.elapsed() >= self.inner.config.timeout => {
                warn!(peer = %requester.short(), "bandwidth test stalled, resetting");
                Some(*nonce)
            }
            _ => None,
        };
        if let Some(nonce) = stalled {
            self.finish_serving(nonce).await;
        }
    }
}

async fn wait_for_transfer(
    events: &mut broadcast::Receiver<TransferEvent>,
    shard: ShardId,
    role: Role,
) -> Result<TransferReport> {
    loop {
        match events.recv().await {
            Ok(TransferEvent::Completed(report)) if report.shard == shard && report.role == role => {
                return Ok(report);
            }
            Ok(TransferEvent::Failed {
                shard: failed,
                role: failed_role,
                error,
                ..
            }) if failed == shard && failed_role == role => {
                return Err(NodeError::TransferError(error));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "transfer events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(NodeError::Cancelled),
        }
    }
}

/// Fill a shard with random bytes, streamed so large sizes stay off the heap.
async fn random_shard(store: &dyn ShardStore, size: u64) -> Result<ShardId> {
    let capacity = store.capacity();
    if size > capacity.free {
        return Err(NodeError::MemoryError {
            needed: size,
            free: capacity.free,
        });
    }
    let staged = store.staging_path();
    let written = async {
        let mut file = tokio::fs::File::create(&staged).await?;
        let mut buf = vec![0u8; FILL_CHUNK];
        let mut remaining = size;
        while remaining > 0 {
            let n = (remaining as usize).min(FILL_CHUNK);
            rand::thread_rng().fill_bytes(&mut buf[..n]);
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;
        Ok::<_, NodeError>(())
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(e);
    }
    store.add_file(&staged).await
}

// ============================================================================
// Worker
// ============================================================================

/// Serves incoming test requests and responses, and resets stalled tests.
pub struct BandwidthTestService {
    tester: BandwidthTester,
    requests: mpsc::Receiver<Delivery>,
    responses: mpsc::Receiver<Delivery>,
}

impl BandwidthTestService {
    pub fn new(tester: BandwidthTester, requests: mpsc::Receiver<Delivery>, responses: mpsc::Receiver<Delivery>) -> Self {
        Self {
            tester,
            requests,
            responses,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(TIMEOUT_TICK);
        loop {
            tokio::select! {
                Some(delivery) = self.requests.recv() => self.tester.on_request(delivery).await,
                Some(delivery) = self.responses.recv() => self.tester.on_response(delivery),
                _ = tick.tick() => self.tester.expire_stalled().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
