//! Transfer contracts: the signed records exchanged during the
//! SYN / SYN-ACK / ACK / RST handshake.
//!
//! A contract names one shard moving between two UNLs. Its id is a hash of
//! a canonical fixed-field encoding, so every handshake step (and every
//! signature) refers to the same transfer.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crypto::{CONTRACT_SIGNATURE_DOMAIN, recover_with_domain, sha256, sign_with_domain};
use crate::error::{NodeError, RejectReason, Result};
use crate::identity::{Keypair, NodeId};
use crate::messages::{deserialize_bounded, serialize};
use crate::store::{ShardId, ShardStore};
use crate::unl::Unl;

/// Message token carrying contracts over the relay network.
pub const CONTRACT_TOKEN: &str = "transfer_contract";

pub type ContractId = [u8; 32];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractStatus {
    Syn,
    SynAck,
    Ack,
    Rst(RejectReason),
}

/// Which way the shard moves relative to the node validating a SYN.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Send,
    Receive,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub status: ContractStatus,
    /// Lowercase hex sha-256 of the shard.
    pub data_id: String,
    /// 0 on a download SYN means "unknown"; the holder writes the real size.
    pub file_size: u64,
    /// The UNL that holds the shard before the transfer.
    pub host_unl: String,
    /// The UNL the SYN is addressed to.
    pub dest_unl: String,
    /// The UNL that initiated the transfer.
    pub src_unl: String,
    pub signature: Vec<u8>,
}

/// Decoded view of a contract's UNL fields.
#[derive(Clone, Copy, Debug)]
pub struct Parties {
    pub host: Unl,
    pub dest: Unl,
    pub src: Unl,
}

impl Contract {
    /// An unsigned SYN from `src` to `dest`.
    pub fn syn(data_id: &ShardId, file_size: u64, host: &Unl, dest: &Unl, src: &Unl) -> Self {
        Self {
            status: ContractStatus::Syn,
            data_id: data_id.to_hex(),
            file_size,
            host_unl: host.encode(),
            dest_unl: dest.encode(),
            src_unl: src.encode(),
            signature: Vec::new(),
        }
    }

    /// Length-prefixed big-endian encoding of the fields that identify a transfer.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            24 + self.data_id.len() + self.host_unl.len() + self.dest_unl.len() + self.src_unl.len(),
        );
        let mut field = |bytes: &[u8]| {
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(bytes);
        };
        field(self.data_id.as_bytes());
        field(&self.file_size.to_be_bytes());
        field(self.host_unl.as_bytes());
        field(self.dest_unl.as_bytes());
        field(self.src_unl.as_bytes());
        out
    }

    /// Independent of status and signature.
    pub fn contract_id(&self) -> ContractId {
        sha256(&self.canonical_bytes())
    }

    fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serialize(&self.status)?;
        bytes.extend_from_slice(&self.contract_id());
        Ok(bytes)
    }

    pub fn sign(mut self, keypair: &Keypair) -> Result<Self> {
        let sig = sign_with_domain(keypair, CONTRACT_SIGNATURE_DOMAIN, &self.signing_bytes()?)
            .map_err(|_| NodeError::BadSignature)?;
        self.signature = sig.to_vec();
        Ok(self)
    }

    /// The node that signed this step of the handshake.
    pub fn signer(&self) -> Result<NodeId> {
        recover_with_domain(CONTRACT_SIGNATURE_DOMAIN, &self.signing_bytes()?, &self.signature)
            .map_err(|_| NodeError::BadSignature)
    }

    /// The same contract with a new status, signed by `keypair`.
    pub fn reply(&self, status: ContractStatus, keypair: &Keypair) -> Result<Self> {
        let mut next = self.clone();
        next.status = status;
        next.signature.clear();
        next.sign(keypair)
    }

    pub fn shard_id(&self) -> Option<ShardId> {
        ShardId::from_hex(&self.data_id)
    }

    pub fn parties(&self) -> Result<Parties> {
        Ok(Parties {
            host: Unl::decode(&self.host_unl)?,
            dest: Unl::decode(&self.dest_unl)?,
            src: Unl::decode(&self.src_unl)?,
        })
    }

    /// Which way data flows for the node identified by `local`.
    pub fn role_of(&self, local: &NodeId) -> Result<Role> {
        let parties = self.parties()?;
        if &parties.host.node_id == local {
            Ok(Role::Send)
        } else if &parties.src.node_id == local || &parties.dest.node_id == local {
            Ok(Role::Receive)
        } else {
            Err(NodeError::InvalidContract("node is not a party".into()))
        }
    }

    /// The UNL of the other side, as seen by `local`.
    pub fn counterparty(&self, local: &NodeId) -> Result<Unl> {
        let parties = self.parties()?;
        if &parties.src.node_id == local {
            Ok(parties.dest)
        } else {
            Ok(parties.src)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serialize(self)?)
    }

    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self> {
        if bytes.len() > max_size {
            return Err(NodeError::MessageTooLarge { size: bytes.len(), max: max_size });
        }
        Ok(deserialize_bounded(bytes)?)
    }

    /// Field checks that need no local state.
    ///
    /// Returns the role this node would play.
    pub fn check_syn_fields(&self, local: &Unl, max_size: usize) -> std::result::Result<Role, RejectReason> {
        if self.shard_id().is_none() {
            return Err(RejectReason::InvalidDataId);
        }
        let packed = self.encode().map_err(|_| RejectReason::ContractTooLarge)?;
        if packed.len() > max_size {
            return Err(RejectReason::ContractTooLarge);
        }
        let parties = self.parties().map_err(|_| RejectReason::InvalidUnl)?;
        if self.host_unl != self.src_unl && self.host_unl != self.dest_unl {
            return Err(RejectReason::InvalidHost);
        }
        if parties.dest.node_id != local.node_id {
            return Err(RejectReason::NotAddressedToUs);
        }
        match self.signer() {
            Ok(signer) if signer == parties.src.node_id => {}
            _ => return Err(RejectReason::BadSignature),
        }
        if self.host_unl == self.dest_unl {
            Ok(Role::Send)
        } else {
            Ok(Role::Receive)
        }
    }

    /// Full SYN validation against local storage and in-flight downloads.
    pub async fn is_valid_syn(
        &self,
        local: &Unl,
        store: &dyn ShardStore,
        downloading: &HashSet<ShardId>,
        max_size: usize,
    ) -> std::result::Result<Role, RejectReason> {
        let role = self.check_syn_fields(local, max_size)?;
        let shard = self.shard_id().ok_or(RejectReason::InvalidDataId)?;
        match role {
            Role::Send => {
                let size = store.size_of(&shard).await.ok_or(RejectReason::MissingShard)?;
                if self.file_size != 0 && self.file_size != size {
                    return Err(RejectReason::SizeMismatch);
                }
            }
            Role::Receive => {
                if store.find(&shard).await.is_some() {
                    return Err(RejectReason::AlreadyStored);
                }
                if downloading.contains(&shard) {
                    return Err(RejectReason::AlreadyDownloading);
                }
            }
        }
        Ok(role)
    }
}
