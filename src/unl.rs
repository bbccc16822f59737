//! # Universal Node Locator
//!
//! A UNL is a base58check string advertising everything a peer needs to open
//! a TCP connection to us: node id, reachability class, NAT behaviour,
//! how the passive port is forwarded, and both WAN and LAN addresses.
//!
//! ```text
//! version(1) node_id(20) node_type(1) nat_type(1) forwarding(1)
//! passive_port(2) wan_ip(4) lan_ip(4) issued_at(8) nonce(4)
//! ```
//!
//! base58check appends the first four bytes of `sha256(sha256(payload))`.
//!
//! [`plan_connection`] decides who dials whom for a pair of UNLs.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};
use crate::identity::{now_secs, NodeId, ID_LEN};

pub const UNL_VERSION: u8 = 1;

const PAYLOAD_LEN: usize = 1 + ID_LEN + 3 + 2 + 4 + 4 + 8 + 4;

/// Reachability class of a node's passive TCP port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Accepts inbound TCP.
    Passive,
    /// Outbound only.
    Active,
    /// Behind an address-preserving NAT; can hole-punch with another of its kind.
    Simultaneous,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NatType {
    Random,
    /// The NAT maps our local port to the same external port.
    Preserving,
    /// The NAT reuses one external port for every destination.
    Reuse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForwardingType {
    /// No forwarding needed (public address) or none in place.
    Mapped,
    Upnp,
    NatPmp,
    Manual,
}

macro_rules! tag_codec {
    ($ty:ident { $($variant:ident = $tag:literal),+ $(,)? }) => {
        impl $ty {
            pub fn tag(self) -> u8 {
                match self {
                    $($ty::$variant => $tag),+
                }
            }

            pub fn from_tag(tag: u8) -> Option<Self> {
                match tag {
                    $($tag => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

tag_codec!(NodeType { Passive = 0, Active = 1, Simultaneous = 2 });
tag_codec!(NatType { Random = 0, Preserving = 1, Reuse = 2 });
tag_codec!(ForwardingType { Mapped = 0, Upnp = 1, NatPmp = 2, Manual = 3 });

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unl {
    pub version: u8,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub nat_type: NatType,
    pub forwarding: ForwardingType,
    pub passive_port: u16,
    pub wan_ip: Ipv4Addr,
    pub lan_ip: Ipv4Addr,
    pub issued_at: u64,
    pub nonce: u32,
}

impl Unl {
    pub fn new(
        node_id: NodeId,
        node_type: NodeType,
        nat_type: NatType,
        forwarding: ForwardingType,
        passive_port: u16,
        wan_ip: Ipv4Addr,
        lan_ip: Ipv4Addr,
    ) -> Self {
        Self {
            version: UNL_VERSION,
            node_id,
            node_type,
            nat_type,
            forwarding,
            passive_port,
            wan_ip,
            lan_ip,
            issued_at: now_secs(),
            nonce: rand::random(),
        }
    }

    fn payload(&self) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            out[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&[self.version]);
        put(self.node_id.as_bytes());
        put(&[self.node_type.tag(), self.nat_type.tag(), self.forwarding.tag()]);
        put(&self.passive_port.to_be_bytes());
        put(&self.wan_ip.octets());
        put(&self.lan_ip.octets());
        put(&self.issued_at.to_be_bytes());
        put(&self.nonce.to_be_bytes());
        out
    }

    pub fn encode(&self) -> String {
        bs58::encode(self.payload()).with_check().into_string()
    }

    pub fn decode(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| NodeError::InvalidUnl(e.to_string()))?;
        if bytes.len() != PAYLOAD_LEN {
            return Err(NodeError::InvalidUnl(format!("payload length {}", bytes.len())));
        }
        if bytes[0] != UNL_VERSION {
            return Err(NodeError::InvalidUnl(format!("version {}", bytes[0])));
        }

        let node_id = NodeId::from_slice(&bytes[1..1 + ID_LEN])
            .ok_or_else(|| NodeError::InvalidUnl("node id".into()))?;
        let mut at = 1 + ID_LEN;
        let node_type = NodeType::from_tag(bytes[at])
            .ok_or_else(|| NodeError::InvalidUnl(format!("node type tag {}", bytes[at])))?;
        let nat_type = NatType::from_tag(bytes[at + 1])
            .ok_or_else(|| NodeError::InvalidUnl(format!("nat type tag {}", bytes[at + 1])))?;
        let forwarding = ForwardingType::from_tag(bytes[at + 2])
            .ok_or_else(|| NodeError::InvalidUnl(format!("forwarding tag {}", bytes[at + 2])))?;
        at += 3;

        let passive_port = u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        at += 2;
        let wan_ip = Ipv4Addr::new(bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]);
        at += 4;
        let lan_ip = Ipv4Addr::new(bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]);
        at += 4;
        let mut issued = [0u8; 8];
        issued.copy_from_slice(&bytes[at..at + 8]);
        at += 8;
        let mut nonce = [0u8; 4];
        nonce.copy_from_slice(&bytes[at..at + 4]);

        Ok(Self {
            version: UNL_VERSION,
            node_id,
            node_type,
            nat_type,
            forwarding,
            passive_port,
            wan_ip,
            lan_ip,
            issued_at: u64::from_be_bytes(issued),
            nonce: u32::from_be_bytes(nonce),
        })
    }

    pub fn wan_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.wan_ip, self.passive_port))
    }

    pub fn lan_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.lan_ip, self.passive_port))
    }

    /// Human-readable breakdown, as printed by `deconstruct_unl`.
    pub fn describe(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl std::fmt::Display for Unl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for Unl {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

// ============================================================================
// Connection Planning
// ============================================================================

/// What the local side does to connect to a remote UNL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectPlan {
    /// Open a TCP connection to `addr`.
    Dial { addr: SocketAddr },
    /// Wait for the remote side to connect to our passive port.
    Listen,
    /// Both sides dial each other at an agreed instant; the master retries.
    Rendezvous { addr: SocketAddr, master: bool },
    NoPath,
}

/// The side whose encoded UNL sorts higher is the master.
pub fn is_master(local: &Unl, remote: &Unl) -> bool {
    local.encode() > remote.encode()
}

pub fn plan_connection(local: &Unl, remote: &Unl) -> ConnectPlan {
    let master = is_master(local, remote);

    // Behind the same NAT: talk over the LAN, both reachable.
    if local.wan_ip == remote.wan_ip {
        return if master {
            ConnectPlan::Dial {
                addr: remote.lan_addr(),
            }
        } else {
            ConnectPlan::Listen
        };
    }

    use NodeType::*;
    match (local.node_type, remote.node_type) {
        (Passive, Passive) => {
            if master {
                ConnectPlan::Dial {
                    addr: remote.wan_addr(),
                }
            } else {
                ConnectPlan::Listen
            }
        }
        (Passive, _) => ConnectPlan::Listen,
        (_, Passive) => ConnectPlan::Dial {
            addr: remote.wan_addr(),
        },
        (Simultaneous, Simultaneous) => ConnectPlan::Rendezvous {
            addr: remote.wan_addr(),
            master,
        },
        _ => ConnectPlan::NoPath,
    }
}
