//! # Shardnet - Peer-to-Peer Storage Overlay
//!
//! Shardnet runs one node of a decentralized storage overlay:
//!
//! - **Identity**: secp256k1 keypairs; a node id is a hash of the public key
//! - **DHT**: Kademlia routing and key/value storage over signed UDP RPCs
//! - **Messaging**: authenticated direct and hop-by-hop relayed messages
//! - **Transfers**: signed SYN/SYN-ACK/ACK contracts, then shards streamed
//!   over TCP with NAT-aware connection planning
//! - **Bandwidth**: per-second "cake" slices and monthly budgets shared by
//!   concurrent transfers, plus a two-way link test
//! - **Monitor**: a crawler that publishes signed snapshots of the overlay
//!
//! ## Architecture
//!
//! Components follow a handle + actor layout: a cheap `Clone` handle talks to
//! a task that owns the mutable state. Short critical sections (pending RPCs,
//! the bandwidth cake, the de-dup cache) use `parking_lot` mutexes instead.
//! Network-facing engines depend on the traits in `protocols`, so tests can
//! drive them over an in-memory network.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Wires every component into a running peer |
//! | `identity` | Keypairs, node ids, contacts |
//! | `crypto` | Hashing and domain-separated signatures |
//! | `messages` | Envelopes and RPC frames |
//! | `rpc` | UDP request/response dispatcher |
//! | `dht` | Routing table, local store, iterative lookups |
//! | `messaging` | Direct and relay delivery, rebroadcast, handlers |
//! | `unl` | Universal node locators and connection planning |
//! | `nat` | NAT classification and port-forwarding probes |
//! | `store` | Filesystem shard store |
//! | `contract` | Transfer contracts |
//! | `transfer` | Handshake state machine and TCP streaming |
//! | `bandwidth` | Bandwidth limiter |
//! | `bwtest` | Two-way bandwidth test |
//! | `monitor` | Overlay crawler and info services |

mod bandwidth;
mod bwtest;
mod config;
mod contract;
mod crypto;
mod dht;
mod error;
mod identity;
mod messages;
mod messaging;
mod monitor;
mod nat;
mod node;
mod protocols;
mod rpc;
mod store;
#[cfg(test)]
mod testnet;
mod transfer;
mod unl;

pub use bandwidth::{BandwidthLimiter, Clock, Direction, ManualClock, SystemClock};
pub use bwtest::{BandwidthResult, BandwidthTester, should_escalate};
pub use config::{
    BandwidthConfig, BandwidthTestConfig, DhtConfig, MessagingConfig, MonitorConfig, NatConfig, NodeConfig,
    TransferConfig, MONITOR_MAX_TRIES_ENV, QUERY_TIMEOUT, WALK_TIMEOUT,
};
pub use contract::{CONTRACT_TOKEN, Contract, ContractId, ContractStatus, Role};
pub use dht::{DhtNode, Key, key_for};
pub use error::{NodeError, RejectReason, Result};
pub use identity::{Contact, Keypair, NodeId};
pub use messages::{Envelope, MAX_ENVELOPE_SIZE, PROTOCOL_VERSION};
pub use messaging::{Delivery, DeliveryMode, MessageHandler, MessageSender, Messenger};
pub use monitor::{BandwidthRecord, CrawlReport, LinkTester, MonitorDataset, PeerRecord, SignedDataset, dataset_key};
pub use nat::Reachability;
pub use node::{Node, parse_shard_id};
pub use protocols::{DhtRpc, MessageRpc, NatRpc};
pub use rpc::RpcNode;
pub use store::{Capacity, FsShardStore, Layout, ShardId, ShardStore};
pub use transfer::{TransferEvent, TransferManager, TransferReport, TransferState};
pub use unl::{ConnectPlan, ForwardingType, NatType, NodeType, Unl, plan_connection};
