//! # NAT Traversal and Reachability
//!
//! Decides how this node advertises itself in its UNL:
//!
//! 1. a manual port-forward confirmed by a peer connecting back → `Passive`
//! 2. a UPnP mapping, re-confirmed → `Passive`
//! 3. a NAT-PMP mapping, re-confirmed → `Passive`
//! 4. an address-preserving NAT (from STUN observations) → `Simultaneous`
//! 5. otherwise → `Active`
//!
//! Each step is a [`ReachabilityProbe`]; a failed probe reports a typed
//! [`ProbeError`] that is logged before the next probe runs.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use igd_next::aio::tokio as igd_tokio;
use igd_next::{PortMappingProtocol, SearchOptions};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::NatConfig;
use crate::identity::Contact;
use crate::protocols::NatRpc;
use crate::unl::{ForwardingType, NatType, NodeType};

const NATPMP_PORT: u16 = 5351;
const NATPMP_LIFETIME_SECS: u32 = 7200;
const UPNP_LEASE_SECS: u32 = 3600;
const MAPPING_DESCRIPTION: &str = "shardnet";

/// Peers asked to confirm reachability.
const REACHABILITY_WITNESSES: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("no gateway found: {0}")]
    NoGateway(String),
    #[error("port mapping refused: {0}")]
    MappingRefused(String),
    #[error("port not reachable from outside")]
    NotReachable,
    #[error("probe timed out")]
    Timeout,
    #[error("probe i/o error: {0}")]
    Io(String),
}

// ============================================================================
// Reachability Checks
// ============================================================================

/// Answers "can the outside world open a TCP connection to this port?".
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    async fn is_reachable(&self, port: u16) -> bool;
}

/// Asks known peers to connect back to us.
pub struct PeerReachabilityCheck<N: NatRpc> {
    nat: Arc<N>,
    witnesses: Vec<Contact>,
    timeout: Duration,
}

impl<N: NatRpc> PeerReachabilityCheck<N> {
    pub fn new(nat: Arc<N>, mut witnesses: Vec<Contact>, timeout: Duration) -> Self {
        witnesses.truncate(REACHABILITY_WITNESSES);
        Self {
            nat,
            witnesses,
            timeout,
        }
    }
}

#[async_trait]
impl<N: NatRpc> ReachabilityCheck for PeerReachabilityCheck<N> {
    async fn is_reachable(&self, port: u16) -> bool {
        for witness in &self.witnesses {
            match tokio::time::timeout(self.timeout, self.nat.check_reachability(witness, port)).await {
                Ok(Ok(true)) => return true,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => debug!(witness = %witness.id.short(), error = %e, "reachability check failed"),
                Err(_) => debug!(witness = %witness.id.short(), "reachability check timed out"),
            }
        }
        false
    }
}

// ============================================================================
// Probes
// ============================================================================

pub struct ProbeContext {
    pub passive_port: u16,
    pub lan_ip: Ipv4Addr,
    pub check: Arc<dyn ReachabilityCheck>,
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Make the passive port reachable (if this probe can) and confirm it.
    async fn probe(&self, ctx: &ProbeContext) -> Result<ForwardingType, ProbeError>;
}

/// The port is already forwarded by hand, or the node has a public address.
pub struct ManualProbe;

#[async_trait]
impl ReachabilityProbe for ManualProbe {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn probe(&self, ctx: &ProbeContext) -> Result<ForwardingType, ProbeError> {
        if ctx.check.is_reachable(ctx.passive_port).await {
            Ok(ForwardingType::Manual)
        } else {
            Err(ProbeError::NotReachable)
        }
    }
}

pub struct UpnpProbe {
    pub search_timeout: Duration,
}

#[async_trait]
impl ReachabilityProbe for UpnpProbe {
    fn name(&self) -> &'static str {
        "upnp"
    }

    async fn probe(&self, ctx: &ProbeContext) -> Result<ForwardingType, ProbeError> {
        let opts = SearchOptions {
            timeout: Some(self.search_timeout),
            ..Default::default()
        };
        let gateway = igd_tokio::search_gateway(opts)
            .await
            .map_err(|e| ProbeError::NoGateway(e.to_string()))?;

        let local = SocketAddr::V4(SocketAddrV4::new(ctx.lan_ip, ctx.passive_port));
        gateway
            .add_port(
                PortMappingProtocol::TCP,
                ctx.passive_port,
                local,
                UPNP_LEASE_SECS,
                MAPPING_DESCRIPTION,
            )
            .await
            .map_err(|e| ProbeError::MappingRefused(e.to_string()))?;
        debug!(port = ctx.passive_port, %local, "upnp mapping added");

        if ctx.check.is_reachable(ctx.passive_port).await {
            Ok(ForwardingType::Upnp)
        } else {
            Err(ProbeError::NotReachable)
        }
    }
}

/// NAT-PMP (RFC 6886) TCP mapping request: 12 bytes.
pub fn natpmp_mapping_request(internal_port: u16, external_port: u16, lifetime: u32) -> [u8; 12] {
    let mut req = [0u8; 12];
    req[0] = 0; // version
    req[1] = 2; // map TCP
    req[4..6].copy_from_slice(&internal_port.to_be_bytes());
    req[6..8].copy_from_slice(&external_port.to_be_bytes());
    req[8..12].copy_from_slice(&lifetime.to_be_bytes());
    req
}

/// Parse a NAT-PMP TCP mapping response; returns the mapped external port.
pub fn natpmp_parse_mapping(resp: &[u8], internal_port: u16) -> Result<u16, ProbeError> {
    if resp.len() < 16 {
        return Err(ProbeError::Io(format!("short response ({} bytes)", resp.len())));
    }
    if resp[0] != 0 || resp[1] != 130 {
        return Err(ProbeError::Io(format!("unexpected opcode {}", resp[1])));
    }
    let result = u16::from_be_bytes([resp[2], resp[3]]);
    if result != 0 {
        return Err(ProbeError::MappingRefused(format!("result code {result}")));
    }
    let internal = u16::from_be_bytes([resp[8], resp[9]]);
    if internal != internal_port {
        return Err(ProbeError::Io(format!("mapping for port {internal}")));
    }
    Ok(u16::from_be_bytes([resp[10], resp[11]]))
}

pub struct NatPmpProbe {
    pub gateway: SocketAddr,
    pub timeout: Duration,
}

impl NatPmpProbe {
    /// Gateway guessed as `a.b.c.1` of the LAN address unless configured.
    pub fn for_lan(lan_ip: Ipv4Addr, gateway: Option<Ipv4Addr>, timeout: Duration) -> Self {
        let [a, b, c, _] = lan_ip.octets();
        let gateway = gateway.unwrap_or(Ipv4Addr::new(a, b, c, 1));
        Self {
            gateway: SocketAddr::V4(SocketAddrV4::new(gateway, NATPMP_PORT)),
            timeout,
        }
    }

    async fn request_mapping(&self, port: u16) -> Result<u16, ProbeError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ProbeError::Io(e.to_string()))?;
        let request = natpmp_mapping_request(port, port, NATPMP_LIFETIME_SECS);
        socket
            .send_to(&request, self.gateway)
            .await
            .map_err(|e| ProbeError::Io(e.to_string()))?;

        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| ProbeError::Timeout)?
            .map_err(|e| ProbeError::Io(e.to_string()))?;
        if from.ip() != self.gateway.ip() {
            return Err(ProbeError::Io(format!("reply from {from}")));
        }
        natpmp_parse_mapping(&buf[..len], port)
    }
}

#[async_trait]
impl ReachabilityProbe for NatPmpProbe {
    fn name(&self) -> &'static str {
        "nat-pmp"
    }

    async fn probe(&self, ctx: &ProbeContext) -> Result<ForwardingType, ProbeError> {
        let mapped = self.request_mapping(ctx.passive_port).await?;
        if mapped != ctx.passive_port {
            // The UNL carries a single port; a shifted mapping is useless.
            return Err(ProbeError::MappingRefused(format!(
                "gateway mapped {} to {mapped}",
                ctx.passive_port
            )));
        }
        if ctx.check.is_reachable(ctx.passive_port).await {
            Ok(ForwardingType::NatPmp)
        } else {
            Err(ProbeError::NotReachable)
        }
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Classify NAT behaviour from the addresses peers saw our UDP socket at.
pub fn classify_nat(local_port: u16, observed: &[SocketAddr]) -> NatType {
    let Some(first) = observed.first() else {
        return NatType::Random;
    };
    if observed.iter().all(|a| a.port() == local_port) {
        NatType::Preserving
    } else if observed.len() > 1 && observed.iter().all(|a| a.port() == first.port()) {
        NatType::Reuse
    } else {
        NatType::Random
    }
}

/// STUN against up to `limit` peers; returns the observed addresses.
pub async fn observe_addresses<N: NatRpc>(nat: &N, peers: &[Contact], limit: usize) -> Vec<SocketAddr> {
    let mut observed = Vec::new();
    for peer in peers.iter().take(limit) {
        match nat.stun(peer).await {
            Ok(addr) => observed.push(addr),
            Err(e) => debug!(peer = %peer.id.short(), error = %e, "stun failed"),
        }
    }
    observed
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reachability {
    pub node_type: NodeType,
    pub nat_type: NatType,
    pub forwarding: ForwardingType,
}

/// Run the probes in order; the first success makes the node passive.
pub async fn determine_reachability(
    config: &NatConfig,
    ctx: &ProbeContext,
    probes: &[Box<dyn ReachabilityProbe>],
    nat_type: NatType,
) -> Reachability {
    if let Some(node_type) = config.node_type_override {
        return Reachability {
            node_type,
            nat_type,
            forwarding: ForwardingType::Manual,
        };
    }

    if ctx.passive_port != 0 {
        for probe in probes {
            match probe.probe(ctx).await {
                Ok(forwarding) => {
                    info!(probe = probe.name(), port = ctx.passive_port, "passive port reachable");
                    return Reachability {
                        node_type: NodeType::Passive,
                        nat_type,
                        forwarding,
                    };
                }
                Err(e) => debug!(probe = probe.name(), error = %e, "reachability probe failed"),
            }
        }
    }

    let node_type = if nat_type == NatType::Preserving {
        NodeType::Simultaneous
    } else {
        NodeType::Active
    };
    info!(?node_type, ?nat_type, "no inbound path; outbound only");
    Reachability {
        node_type,
        nat_type,
        forwarding: ForwardingType::Mapped,
    }
}

/// The probe sequence enabled by `config`.
pub fn default_probes(config: &NatConfig, lan_ip: Ipv4Addr) -> Vec<Box<dyn ReachabilityProbe>> {
    let mut probes: Vec<Box<dyn ReachabilityProbe>> = vec![Box::new(ManualProbe)];
    if config.enable_upnp {
        probes.push(Box::new(UpnpProbe {
            search_timeout: config.probe_timeout,
        }));
    }
    if config.enable_natpmp {
        probes.push(Box::new(NatPmpProbe::for_lan(
            lan_ip,
            config.natpmp_gateway,
            config.probe_timeout,
        )));
    }
    probes
}

/// LAN address of the default route, found without sending packets.
pub async fn local_ipv4() -> Ipv4Addr {
    let probe = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect("8.8.8.8:80").await.ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    };
    match probe.await {
        Some(ip) => ip,
        None => {
            warn!("could not determine LAN address, using loopback");
            Ipv4Addr::LOCALHOST
        }
    }
}
