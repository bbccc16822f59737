//! In-memory overlay for unit tests: every RPC is a direct call into the
//! target's DHT node or messenger.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Duration;

use crate::config::{DhtConfig, MessagingConfig};
use crate::dht::{DhtNode, Key};
use crate::error::{NodeError, Result};
use crate::identity::{Contact, Keypair, NodeId};
use crate::messages::RpcResponse;
use crate::messaging::Messenger;
use crate::protocols::{DhtRpc, FindValueReply, MessageRpc};

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) peers: RwLock<HashMap<NodeId, (DhtNode<MemNet>, Messenger<MemNet>)>>,
    /// Every relay hop as (from, to, destination).
    pub(crate) hops: Mutex<Vec<(NodeId, NodeId, NodeId)>>,
}

impl Registry {
    fn peer(&self, id: &NodeId) -> Result<(DhtNode<MemNet>, Messenger<MemNet>)> {
        self.peers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NodeError::Unreachable("not registered".into()))
    }
}

pub(crate) struct MemNet {
    registry: Arc<Registry>,
    me: Contact,
}

#[async_trait]
impl DhtRpc for MemNet {
    async fn ping(&self, to: &Contact) -> Result<()> {
        self.registry.peer(&to.id).map(|_| ())
    }

    async fn ping_addr(&self, _addr: SocketAddr) -> Result<NodeId> {
        Err(NodeError::Timeout)
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let (dht, _) = self.registry.peer(&to.id)?;
        Ok(dht.handle_find_node(&self.me, target).await)
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply> {
        let (dht, _) = self.registry.peer(&to.id)?;
        Ok(dht.handle_find_value(&self.me, key).await)
    }

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
        let (dht, _) = self.registry.peer(&to.id)?;
        dht.handle_store(&self.me, key, value).await;
        Ok(())
    }
}

#[async_trait]
impl MessageRpc for MemNet {
    async fn direct_message(&self, to: &Contact, envelope: Vec<u8>) -> Result<()> {
        let (_, messenger) = self.registry.peer(&to.id)?;
        match messenger.handle_direct(&self.me, &envelope) {
            RpcResponse::Delivered => Ok(()),
            other => Err(NodeError::Unreachable(format!("{other:?}"))),
        }
    }

    async fn relay_message(&self, to: &Contact, dest: NodeId, hop_limit: u8, envelope: Vec<u8>) -> Result<()> {
        let (_, messenger) = self.registry.peer(&to.id)?;
        self.registry.hops.lock().push((self.me.id, to.id, dest));
        match messenger.handle_relay(&self.me, dest, hop_limit, envelope) {
            RpcResponse::Delivered | RpcResponse::Relayed => Ok(()),
            other => Err(NodeError::Unreachable(format!("{other:?}"))),
        }
    }
}

/// Start a DHT node and messenger for `keypair` and register them.
pub(crate) fn join(
    registry: &Arc<Registry>,
    keypair: Keypair,
    port: u16,
    config: MessagingConfig,
    shutdown: &watch::Receiver<bool>,
) -> (DhtNode<MemNet>, Messenger<MemNet>) {
    let me = Contact::new(keypair.node_id(), SocketAddr::from(([10, 0, 0, 1], port)));
    let net = MemNet {
        registry: registry.clone(),
        me,
    };
    let dht = DhtNode::new(me, net, DhtConfig::default().with_query_timeout(Duration::from_millis(200)));
    let (messenger, workers) = Messenger::new(dht.clone(), keypair, config);
    workers.spawn(shutdown.clone());
    registry.peers.write().insert(me.id, (dht.clone(), messenger.clone()));
    (dht, messenger)
}
