//! # RPC Layer
//!
//! Request/response over a single UDP socket. Every datagram is an
//! [`RpcFrame`] sealed in a signed envelope, so the sender of each request
//! and each reply is authenticated by its signature rather than by the
//! address it came from.
//!
//! ## Architecture
//!
//! - [`RpcNode`]: cheap-to-clone handle for outbound calls
//! - [`RpcNode::serve`]: the dispatcher loop; routes replies to waiting
//!   callers by nonce and hands requests to an [`RpcHandler`]
//!
//! A call registers its nonce before sending and is completed by the
//! dispatcher, by its own timeout, or with `Cancelled` when the dispatcher
//! stops.
//!
//! ## Protocol Traits
//!
//! `RpcNode` implements [`DhtRpc`], [`MessageRpc`] and [`NatRpc`], so the
//! DHT and messaging engines can run on top of it unchanged.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Semaphore, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::dht::{DhtNode, Key};
use crate::error::{NodeError, Result};
use crate::identity::{Contact, Keypair, NodeId};
use crate::messages::{FrameKind, RpcFrame, RpcRequest, RpcResponse, MAX_RPC_DATAGRAM_SIZE, MAX_VALUE_SIZE};
use crate::protocols::{DhtRpc, FindValueReply, MessageRpc, NatRpc, RpcHandler};

// ============================================================================
// Limits
// ============================================================================

/// Contacts accepted from a single FIND_NODE/FIND_VALUE reply.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 20;

/// Receive buffer; anything longer than the datagram ceiling is dropped.
const RECV_BUFFER_SIZE: usize = 2048;

/// Inbound requests handled concurrently; datagrams beyond this are dropped.
pub const MAX_INFLIGHT_REQUESTS: usize = 256;

// ============================================================================
// RpcNode
// ============================================================================

type CallReply = oneshot::Sender<Result<(NodeId, RpcResponse)>>;

struct PendingCall {
    /// Node id the reply must be signed by; `None` for address-only pings.
    expect: Option<NodeId>,
    reply: CallReply,
}

struct RpcInner {
    socket: UdpSocket,
    keypair: Keypair,
    local_addr: SocketAddr,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_nonce: AtomicU64,
    closed: AtomicBool,
    query_timeout: Duration,
    inflight: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct RpcNode {
    inner: Arc<RpcInner>,
}

/// Drops the pending entry if the call future goes away early.
struct PendingGuard<'a> {
    inner: &'a RpcInner,
    nonce: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.nonce);
    }
}

impl RpcNode {
    pub async fn bind(addr: SocketAddr, keypair: Keypair, query_timeout: Duration) -> Result<Self> {
        Self::bind_with_limit(addr, keypair, query_timeout, MAX_INFLIGHT_REQUESTS).await
    }

    /// Like [`RpcNode::bind`], handling at most `max_inflight` requests at once.
    pub async fn bind_with_limit(
        addr: SocketAddr,
        keypair: Keypair,
        query_timeout: Duration,
        max_inflight: usize,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!(%local_addr, node = %keypair.node_id().short(), "rpc socket bound");
        Ok(Self {
            inner: Arc::new(RpcInner {
                socket,
                keypair,
                local_addr,
                pending: Mutex::new(HashMap::new()),
                next_nonce: AtomicU64::new(rand::random()),
                closed: AtomicBool::new(false),
                query_timeout,
                inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.keypair.node_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    pub fn query_timeout(&self) -> Duration {
        self.inner.query_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Send `request` to `addr` and wait for the matching reply.
    ///
    /// With `expect` set, only a reply signed by that node completes the call.
    pub async fn call(
        &self,
        addr: SocketAddr,
        expect: Option<NodeId>,
        request: RpcRequest,
    ) -> Result<(NodeId, RpcResponse)> {
        if self.is_closed() {
            return Err(NodeError::Cancelled);
        }

        let nonce = self.inner.next_nonce.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        let datagram = RpcFrame {
            nonce,
            kind: FrameKind::Request(request),
        }
        .seal(&self.inner.keypair)?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .insert(nonce, PendingCall { expect, reply: tx });
        let _guard = PendingGuard {
            inner: &self.inner,
            nonce,
        };

        trace!(%addr, kind, nonce, "sending rpc request");
        self.inner.socket.send_to(&datagram, addr).await?;

        match tokio::time::timeout(self.inner.query_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NodeError::Cancelled),
            Err(_) => {
                trace!(%addr, kind, nonce, "rpc request timed out");
                Err(NodeError::Timeout)
            }
        }
    }

    async fn call_contact(&self, to: &Contact, request: RpcRequest) -> Result<RpcResponse> {
        self.call(to.addr, Some(to.id), request).await.map(|(_, response)| response)
    }

    /// Receive datagrams until `shutdown` flips; then fail every waiting call
    /// with `Cancelled`.
    pub async fn serve(&self, handler: Arc<dyn RpcHandler>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, from) = tokio::select! {
                received = self.inner.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP unreachable surfaces here on some platforms.
                        trace!(error = %e, "recv_from failed");
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };
            if *shutdown.borrow() {
                break;
            }
            if len > MAX_RPC_DATAGRAM_SIZE {
                warn!(%from, len, max = MAX_RPC_DATAGRAM_SIZE, "dropping oversized datagram");
                continue;
            }
            self.dispatch(&buf[..len], from, &handler);
        }

        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<PendingCall> = self.inner.pending.lock().drain().map(|(_, c)| c).collect();
        for call in drained {
            let _ = call.reply.send(Err(NodeError::Cancelled));
        }
        debug!(addr = %self.inner.local_addr, "rpc dispatcher stopped");
    }

    fn dispatch(&self, datagram: &[u8], from: SocketAddr, handler: &Arc<dyn RpcHandler>) {
        let (sender, frame) = match RpcFrame::open(datagram) {
            Ok(opened) => opened,
            Err(e) => {
                debug!(%from, error = %e, "discarding invalid datagram");
                return;
            }
        };

        match frame.kind {
            FrameKind::Response(response) => {
                let mut pending = self.inner.pending.lock();
                let matches = pending
                    .get(&frame.nonce)
                    .is_some_and(|call| call.expect.is_none_or(|id| id == sender));
                if !matches {
                    trace!(%from, nonce = frame.nonce, "unsolicited or mismatched reply");
                    return;
                }
                if let Some(call) = pending.remove(&frame.nonce) {
                    let _ = call.reply.send(Ok((sender, response)));
                }
            }
            FrameKind::Request(request) => {
                let Ok(permit) = self.inner.inflight.clone().try_acquire_owned() else {
                    debug!(%from, kind = request.kind(), "request handlers saturated, dropping");
                    return;
                };
                let rpc = self.clone();
                let handler = handler.clone();
                let nonce = frame.nonce;
                tokio::spawn(async move {
                    let kind = request.kind();
                    let response = handler.handle(Contact::new(sender, from), request).await;
                    drop(permit);
                    let reply = RpcFrame {
                        nonce,
                        kind: FrameKind::Response(response),
                    };
                    match reply.seal(&rpc.inner.keypair) {
                        Ok(datagram) => {
                            if let Err(e) = rpc.inner.socket.send_to(&datagram, from).await {
                                debug!(%from, kind, error = %e, "failed to send reply");
                            }
                        }
                        Err(e) => warn!(%from, kind, error = %e, "failed to seal reply"),
                    }
                });
            }
        }
    }
}

fn unexpected(op: &str, response: RpcResponse) -> NodeError {
    match response {
        RpcResponse::Error(message) => NodeError::Unreachable(format!("{op} refused: {message}")),
        other => NodeError::BadEnvelope(format!("unexpected response to {op}: {other:?}")),
    }
}

fn cap_contacts(to: &Contact, nodes: Vec<Contact>) -> Vec<Contact> {
    if nodes.len() > MAX_CONTACTS_PER_RESPONSE {
        warn!(
            peer = %to.id.short(),
            count = nodes.len(),
            max = MAX_CONTACTS_PER_RESPONSE,
            "peer returned too many contacts, truncating"
        );
        nodes.into_iter().take(MAX_CONTACTS_PER_RESPONSE).collect()
    } else {
        nodes
    }
}

#[async_trait]
impl DhtRpc for RpcNode {
    async fn ping(&self, to: &Contact) -> Result<()> {
        match self.call_contact(to, RpcRequest::Ping).await? {
            RpcResponse::Pong => Ok(()),
            other => Err(unexpected("ping", other)),
        }
    }

    async fn ping_addr(&self, addr: SocketAddr) -> Result<NodeId> {
        match self.call(addr, None, RpcRequest::Ping).await? {
            (id, RpcResponse::Pong) => Ok(id),
            (_, other) => Err(unexpected("ping", other)),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        match self.call_contact(to, RpcRequest::FindNode { target }).await? {
            RpcResponse::Nodes(nodes) => Ok(cap_contacts(to, nodes)),
            other => Err(unexpected("find_node", other)),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply> {
        match self.call_contact(to, RpcRequest::FindValue { key }).await? {
            RpcResponse::Value(value) => {
                if value.len() > MAX_VALUE_SIZE {
                    warn!(
                        peer = %to.id.short(),
                        size = value.len(),
                        max = MAX_VALUE_SIZE,
                        "peer returned oversized value, rejecting"
                    );
                    return Err(NodeError::MessageTooLarge {
                        size: value.len(),
                        max: MAX_VALUE_SIZE,
                    });
                }
                Ok(FindValueReply::Value(value))
            }
            RpcResponse::Nodes(nodes) => Ok(FindValueReply::Closer(cap_contacts(to, nodes))),
            other => Err(unexpected("find_value", other)),
        }
    }

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
        match self.call_contact(to, RpcRequest::Store { key, value }).await? {
            RpcResponse::Stored => Ok(()),
            other => Err(unexpected("store", other)),
        }
    }
}

#[async_trait]
impl MessageRpc for RpcNode {
    async fn direct_message(&self, to: &Contact, envelope: Vec<u8>) -> Result<()> {
        match self.call_contact(to, RpcRequest::DirectMessage { envelope }).await? {
            RpcResponse::Delivered => Ok(()),
            other => Err(unexpected("direct_message", other)),
        }
    }

    async fn relay_message(
        &self,
        to: &Contact,
        dest: NodeId,
        hop_limit: u8,
        envelope: Vec<u8>,
    ) -> Result<()> {
        let request = RpcRequest::RelayMessage {
            dest,
            hop_limit,
            envelope,
        };
        match self.call_contact(to, request).await? {
            RpcResponse::Relayed | RpcResponse::Delivered => Ok(()),
            other => Err(unexpected("relay_message", other)),
        }
    }
}

#[async_trait]
impl NatRpc for RpcNode {
    async fn stun(&self, to: &Contact) -> Result<SocketAddr> {
        match self.call_contact(to, RpcRequest::Stun).await? {
            RpcResponse::Observed(addr) => Ok(addr),
            other => Err(unexpected("stun", other)),
        }
    }

    async fn check_reachability(&self, to: &Contact, port: u16) -> Result<bool> {
        match self.call_contact(to, RpcRequest::CheckReachability { port }).await? {
            RpcResponse::Reachable(reachable) => Ok(reachable),
            other => Err(unexpected("check_reachability", other)),
        }
    }
}

// ============================================================================
// Inbound Request Handling
// ============================================================================

/// Answer the DHT part of the request set. Returns `None` for requests that
/// belong to another component.
pub async fn handle_dht_request<N: DhtRpc>(
    node: &DhtNode<N>,
    from: &Contact,
    request: &RpcRequest,
) -> Option<RpcResponse> {
    let response = match request {
        RpcRequest::Ping => {
            trace!(from = %from.id.short(), "handling PING");
            node.observe_contact(*from).await;
            RpcResponse::Pong
        }
        RpcRequest::FindNode { target } => {
            let nodes = node.handle_find_node(from, *target).await;
            trace!(from = %from.id.short(), target = %target.short(), returned = nodes.len(), "FIND_NODE");
            RpcResponse::Nodes(nodes)
        }
        RpcRequest::FindValue { key } => match node.handle_find_value(from, *key).await {
            FindValueReply::Value(value) => {
                trace!(from = %from.id.short(), key = %hex::encode(&key[..8]), "FIND_VALUE hit");
                RpcResponse::Value(value)
            }
            FindValueReply::Closer(nodes) => RpcResponse::Nodes(nodes),
        },
        RpcRequest::Store { key, value } => {
            if value.len() > MAX_VALUE_SIZE {
                return Some(RpcResponse::Error("value too large".into()));
            }
            debug!(
                from = %from.id.short(),
                key = %hex::encode(&key[..8]),
                value_len = value.len(),
                "handling STORE"
            );
            node.handle_store(from, *key, value.clone()).await;
            RpcResponse::Stored
        }
        _ => return None,
    };
    Some(response)
}

pub(crate) fn is_private_or_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_unspecified()
        }
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Try a TCP connect back to the requester's observed IP on `port`.
///
/// Private and loopback targets are refused unless `allow_private` is set,
/// so the node cannot be used to scan a requester's internal network.
pub async fn probe_reachability(
    from: SocketAddr,
    port: u16,
    allow_private: bool,
    timeout: Duration,
) -> bool {
    if port == 0 {
        return false;
    }
    if !allow_private && is_private_or_internal(from.ip()) {
        debug!(%from, port, "reachability probe refused: private address");
        return false;
    }
    let target = SocketAddr::new(from.ip(), port);
    let reachable = matches!(
        tokio::time::timeout(timeout, TcpStream::connect(target)).await,
        Ok(Ok(_))
    );
    debug!(%target, reachable, "reachability probe finished");
    reachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::key_for;
    use crate::messages::Envelope;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, from: Contact, request: RpcRequest) -> RpcResponse {
            match request {
                RpcRequest::Ping => RpcResponse::Pong,
                RpcRequest::Stun => RpcResponse::Observed(from.addr),
                RpcRequest::FindNode { .. } => RpcResponse::Nodes(
                    (0..25u8)
                        .map(|i| {
                            Contact::new(
                                NodeId::from_bytes([i; 20]),
                                SocketAddr::from(([10, 0, 0, i], 9000)),
                            )
                        })
                        .collect(),
                ),
                RpcRequest::Store { .. } => RpcResponse::Error("full".into()),
                _ => RpcResponse::Error("unsupported".into()),
            }
        }
    }

    async fn spawn_node(handler: Arc<dyn RpcHandler>) -> (RpcNode, watch::Sender<bool>) {
        let rpc = RpcNode::bind(
            "127.0.0.1:0".parse().expect("addr"),
            Keypair::generate(),
            Duration::from_millis(500),
        )
        .await
        .expect("bind");
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = rpc.clone();
        tokio::spawn(async move { server.serve(handler, stop_rx).await });
        (rpc, stop_tx)
    }

    fn contact_of(rpc: &RpcNode) -> Contact {
        Contact::new(rpc.node_id(), rpc.local_addr())
    }

    #[tokio::test]
    async fn ping_addr_learns_node_id() {
        let (a, _stop_a) = spawn_node(Arc::new(EchoHandler)).await;
        let (b, _stop_b) = spawn_node(Arc::new(EchoHandler)).await;

        let id = a.ping_addr(b.local_addr()).await.expect("ping");
        assert_eq!(id, b.node_id());
        assert!(a.ping(&contact_of(&b)).await.is_ok());
        assert_eq!(a.pending_calls(), 0);
    }

    #[tokio::test]
    async fn reply_from_wrong_node_is_ignored() {
        let (a, _stop_a) = spawn_node(Arc::new(EchoHandler)).await;
        let (b, _stop_b) = spawn_node(Arc::new(EchoHandler)).await;

        let wrong = Contact::new(Keypair::generate().node_id(), b.local_addr());
        assert!(matches!(a.ping(&wrong).await, Err(NodeError::Timeout)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (a, _stop) = spawn_node(Arc::new(EchoHandler)).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = silent.local_addr().expect("addr");

        assert!(matches!(a.ping_addr(addr).await, Err(NodeError::Timeout)));
        assert_eq!(a.pending_calls(), 0);
    }

    #[tokio::test]
    async fn stun_reports_observed_address() {
        let (a, _stop_a) = spawn_node(Arc::new(EchoHandler)).await;
        let (b, _stop_b) = spawn_node(Arc::new(EchoHandler)).await;

        let observed = a.stun(&contact_of(&b)).await.expect("stun");
        assert_eq!(observed, a.local_addr());
    }

    #[tokio::test]
    async fn oversized_contact_lists_are_truncated() {
        let (a, _stop_a) = spawn_node(Arc::new(EchoHandler)).await;
        let (b, _stop_b) = spawn_node(Arc::new(EchoHandler)).await;

        let nodes = a.find_node(&contact_of(&b), a.node_id()).await.expect("find_node");
        assert_eq!(nodes.len(), MAX_CONTACTS_PER_RESPONSE);
    }

    #[tokio::test]
    async fn error_reply_maps_to_unreachable() {
        let (a, _stop_a) = spawn_node(Arc::new(EchoHandler)).await;
        let (b, _stop_b) = spawn_node(Arc::new(EchoHandler)).await;

        let result = a.store(&contact_of(&b), key_for("k"), b"v".to_vec()).await;
        assert!(matches!(result, Err(NodeError::Unreachable(_))));
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_calls() {
        let (a, stop) = spawn_node(Arc::new(EchoHandler)).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = silent.local_addr().expect("addr");

        let caller = a.clone();
        let call = tokio::spawn(async move { caller.ping_addr(addr).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(true).expect("stop");

        let result = call.await.expect("join");
        assert!(matches!(result, Err(NodeError::Cancelled)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(a.ping_addr(addr).await, Err(NodeError::Cancelled)));
    }

    #[tokio::test]
    async fn garbage_datagrams_do_not_stop_the_dispatcher() {
        let (a, _stop_a) = spawn_node(Arc::new(EchoHandler)).await;
        let (b, _stop_b) = spawn_node(Arc::new(EchoHandler)).await;

        let raw = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        raw.send_to(&[0xFF; 32], b.local_addr()).await.expect("send");
        raw.send_to(&vec![0u8; MAX_RPC_DATAGRAM_SIZE + 100], b.local_addr())
            .await
            .expect("send");
        let app = Envelope::sign(&Keypair::generate(), "chat", b"hi")
            .expect("sign")
            .encode()
            .expect("encode");
        raw.send_to(&app, b.local_addr()).await.expect("send");

        assert!(a.ping(&contact_of(&b)).await.is_ok());
    }

    /// Answers pings after a pause and counts how often it ran.
    struct SlowHandler {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for SlowHandler {
        async fn handle(&self, _from: Contact, _request: RpcRequest) -> RpcResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            RpcResponse::Pong
        }
    }

    #[tokio::test]
    async fn requests_beyond_the_handler_limit_are_dropped() {
        let handler = Arc::new(SlowHandler {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let server = RpcNode::bind_with_limit(
            "127.0.0.1:0".parse().expect("addr"),
            Keypair::generate(),
            Duration::from_millis(500),
            1,
        )
        .await
        .expect("bind");
        let (_stop_tx, stop_rx) = watch::channel(false);
        {
            let server = server.clone();
            let handler: Arc<dyn RpcHandler> = handler.clone();
            tokio::spawn(async move { server.serve(handler, stop_rx).await });
        }
        let (client, _stop_client) = spawn_node(Arc::new(EchoHandler)).await;
        let target = contact_of(&server);

        let (first, second, third) = tokio::join!(
            client.ping(&target),
            client.ping(&target),
            client.ping(&target),
        );
        let answered = [&first, &second, &third].iter().filter(|r| r.is_ok()).count();
        assert_eq!(answered, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        // The permit is released once the slow request finishes.
        assert!(client.ping(&target).await.is_ok());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn private_ranges_are_detected() {
        assert!(is_private_or_internal("127.0.0.1".parse().expect("ip")));
        assert!(is_private_or_internal("192.168.1.4".parse().expect("ip")));
        assert!(is_private_or_internal("fe80::1".parse().expect("ip")));
        assert!(!is_private_or_internal("8.8.8.8".parse().expect("ip")));
    }

    #[tokio::test]
    async fn reachability_probe_respects_private_flag() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let from: SocketAddr = "127.0.0.1:5555".parse().expect("addr");

        assert!(!probe_reachability(from, port, false, Duration::from_secs(1)).await);
        assert!(probe_reachability(from, port, true, Duration::from_secs(1)).await);
    }
}
