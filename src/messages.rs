//! # Wire Protocol Messages
//!
//! Every byte exchanged over UDP is a signed [`Envelope`]. Application
//! messages are envelopes whose `token` names the message kind; RPC
//! datagrams are envelopes with token [`RPC_TOKEN`] whose body is an
//! [`RpcFrame`].
//!
//! | Record | Bound |
//! |--------|-------|
//! | Application envelope | [`MAX_ENVELOPE_SIZE`] packed bytes |
//! | RPC datagram | [`MAX_RPC_DATAGRAM_SIZE`] bytes |
//! | DHT value | [`MAX_VALUE_SIZE`] bytes |
//!
//! All decoding goes through [`deserialize_bounded`], which enforces a size
//! limit and rejects trailing bytes.

use std::net::SocketAddr;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::{recover_with_domain, sha256, sign_with_domain, ENVELOPE_SIGNATURE_DOMAIN};
use crate::dht::Key;
use crate::error::{NodeError, Result};
use crate::identity::{Contact, Keypair, NodeId, SIGNATURE_LEN};

/// Wire protocol version; envelopes carrying any other version are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a packed application envelope.
pub const MAX_ENVELOPE_SIZE: usize = 519;

/// Upper bound on an RPC datagram. Large enough to carry a relayed
/// application envelope or a full DHT value inside a signed frame.
pub const MAX_RPC_DATAGRAM_SIZE: usize = 1232;

/// Maximum size of a stored DHT value.
pub const MAX_VALUE_SIZE: usize = 512;

/// Maximum token length in bytes.
pub const MAX_TOKEN_LEN: usize = 32;

/// Token reserved for RPC datagrams.
pub const RPC_TOKEN: &str = "rpc";

const MAX_DESERIALIZE_SIZE: u64 = MAX_RPC_DATAGRAM_SIZE as u64;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_varint_encoding()
        .reject_trailing_bytes()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> std::result::Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Envelope
// ============================================================================

/// Signed, versioned record carrying one message.
///
/// The signature covers `(protocol_version, token, body)`; the sender field
/// is checked against the key recovered from the signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: NodeId,
    pub protocol_version: u32,
    pub token: String,
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
}

fn signed_payload(protocol_version: u32, token: &str, body: &[u8]) -> Result<Vec<u8>> {
    Ok(serialize(&(protocol_version, token, body))?)
}

fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return Err(NodeError::BadEnvelope(format!("token length {}", token.len())));
    }
    if !token.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(NodeError::BadEnvelope("token is not printable ascii".into()));
    }
    Ok(())
}

impl Envelope {
    /// Sign an application message. Fails with `MessageTooLarge` when the
    /// packed envelope would exceed [`MAX_ENVELOPE_SIZE`].
    pub fn sign(keypair: &Keypair, token: &str, body: &[u8]) -> Result<Self> {
        Self::sign_bounded(keypair, token, body, MAX_ENVELOPE_SIZE)
    }

    pub(crate) fn sign_bounded(keypair: &Keypair, token: &str, body: &[u8], max: usize) -> Result<Self> {
        validate_token(token)?;
        let payload = signed_payload(PROTOCOL_VERSION, token, body)?;
        let signature = sign_with_domain(keypair, ENVELOPE_SIGNATURE_DOMAIN, &payload)
            .map_err(|e| NodeError::Fatal(e.to_string()))?;
        let envelope = Self {
            sender: keypair.node_id(),
            protocol_version: PROTOCOL_VERSION,
            token: token.to_string(),
            body: body.to_vec(),
            signature: signature.to_vec(),
        };
        let size = envelope.packed_len()?;
        if size > max {
            return Err(NodeError::MessageTooLarge { size, max });
        }
        Ok(envelope)
    }

    /// Check structure and signature; returns the authenticated sender.
    pub fn verify(&self) -> Result<NodeId> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(NodeError::BadEnvelope(format!(
                "protocol version {}",
                self.protocol_version
            )));
        }
        validate_token(&self.token)?;
        if self.signature.len() != SIGNATURE_LEN {
            return Err(NodeError::BadEnvelope(format!(
                "signature length {}",
                self.signature.len()
            )));
        }
        let payload = signed_payload(self.protocol_version, &self.token, &self.body)?;
        let signer = recover_with_domain(ENVELOPE_SIGNATURE_DOMAIN, &payload, &self.signature)
            .map_err(|_| NodeError::BadSignature)?;
        if signer != self.sender {
            return Err(NodeError::BadSignature);
        }
        Ok(signer)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serialize(self)?)
    }

    /// Decode without verifying. Oversized input fails with `MessageTooLarge`,
    /// anything unparseable with `BadEnvelope`.
    pub fn decode(bytes: &[u8], max: usize) -> Result<Self> {
        if bytes.len() > max {
            return Err(NodeError::MessageTooLarge { size: bytes.len(), max });
        }
        deserialize_bounded(bytes).map_err(|e| NodeError::BadEnvelope(e.to_string()))
    }

    /// Decode and verify an application envelope.
    pub fn open(bytes: &[u8]) -> Result<Self> {
        let envelope = Self::decode(bytes, MAX_ENVELOPE_SIZE)?;
        envelope.verify()?;
        Ok(envelope)
    }

    pub fn packed_len(&self) -> Result<usize> {
        Ok(bincode_options().serialized_size(self)? as usize)
    }

    /// `sha256` of the packed envelope; the de-duplication key.
    pub fn digest(&self) -> Result<[u8; 32]> {
        Ok(sha256(&self.encode()?))
    }
}

// ============================================================================
// RPC Frames
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    Ping,
    Store { key: Key, value: Vec<u8> },
    FindNode { target: NodeId },
    FindValue { key: Key },
    /// Packed application envelope addressed to the receiver.
    DirectMessage { envelope: Vec<u8> },
    /// Packed application envelope travelling toward `dest`.
    RelayMessage { dest: NodeId, hop_limit: u8, envelope: Vec<u8> },
    /// Ask the receiver which address our datagram arrived from.
    Stun,
    /// Ask the receiver to open a TCP connection to our observed IP on `port`.
    CheckReachability { port: u16 },
}

impl RpcRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            RpcRequest::Ping => "ping",
            RpcRequest::Store { .. } => "store",
            RpcRequest::FindNode { .. } => "find_node",
            RpcRequest::FindValue { .. } => "find_value",
            RpcRequest::DirectMessage { .. } => "direct_message",
            RpcRequest::RelayMessage { .. } => "relay_message",
            RpcRequest::Stun => "stun",
            RpcRequest::CheckReachability { .. } => "check_reachability",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    Pong,
    Stored,
    Nodes(Vec<Contact>),
    Value(Vec<u8>),
    Delivered,
    Relayed,
    Observed(SocketAddr),
    Reachable(bool),
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Request(RpcRequest),
    Response(RpcResponse),
}

/// Body of an RPC envelope: the caller's nonce plus the request or reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFrame {
    pub nonce: u64,
    pub kind: FrameKind,
}

impl RpcFrame {
    /// Wrap the frame in a signed RPC envelope and pack it into a datagram.
    pub fn seal(&self, keypair: &Keypair) -> Result<Vec<u8>> {
        let body = serialize(self)?;
        let envelope = Envelope::sign_bounded(keypair, RPC_TOKEN, &body, MAX_RPC_DATAGRAM_SIZE)?;
        envelope.encode()
    }

    /// Verify a datagram and extract its frame and authenticated sender.
    pub fn open(datagram: &[u8]) -> Result<(NodeId, RpcFrame)> {
        let envelope = Envelope::decode(datagram, MAX_RPC_DATAGRAM_SIZE)?;
        let sender = envelope.verify()?;
        if envelope.token != RPC_TOKEN {
            return Err(NodeError::BadEnvelope(format!("unexpected token {}", envelope.token)));
        }
        let frame = deserialize_bounded(&envelope.body)
            .map_err(|e| NodeError::BadEnvelope(e.to_string()))?;
        Ok((sender, frame))
    }
}
