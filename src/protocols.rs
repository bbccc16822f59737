//! Protocol trait definitions for the overlay's networking layer.
//!
//! The DHT and messaging engines depend only on these traits, never on the
//! UDP implementation, so both can be driven by an in-memory network in
//! tests.
//!
//! | Protocol | Trait | Purpose |
//! |----------|-------|---------|
//! | DHT | [`DhtRpc`] | Routing and key/value storage |
//! | Messaging | [`MessageRpc`] | Direct and relayed application envelopes |
//! | NAT | [`NatRpc`] | Address discovery and reachability checks |
//! | Inbound | [`RpcHandler`] | Serving requests received by the dispatcher |

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::dht::Key;
use crate::error::Result;
use crate::identity::{Contact, NodeId};
use crate::messages::{RpcRequest, RpcResponse};

/// Reply to a FIND_VALUE: either the value or contacts closer to the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueReply {
    Value(Vec<u8>),
    Closer(Vec<Contact>),
}

#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Ping a known contact.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// Ping a bare address and learn the node id that answers there.
    async fn ping_addr(&self, addr: SocketAddr) -> Result<NodeId>;

    /// Ask a node for its k closest contacts to `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply>;

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait MessageRpc: DhtRpc {
    /// Hand a packed envelope to its destination.
    async fn direct_message(&self, to: &Contact, envelope: Vec<u8>) -> Result<()>;

    /// Hand a packed envelope to the next hop toward `dest`.
    async fn relay_message(
        &self,
        to: &Contact,
        dest: NodeId,
        hop_limit: u8,
        envelope: Vec<u8>,
    ) -> Result<()>;
}

#[async_trait]
pub trait NatRpc: Send + Sync + 'static {
    /// The address `to` observed our request arriving from.
    async fn stun(&self, to: &Contact) -> Result<SocketAddr>;

    /// Ask `to` to open a TCP connection back to our observed IP on `port`.
    async fn check_reachability(&self, to: &Contact, port: u16) -> Result<bool>;
}

/// Serves requests arriving at the RPC dispatcher.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, from: Contact, request: RpcRequest) -> RpcResponse;
}
