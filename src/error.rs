//! Error types shared by every overlay component.
//!
//! Single-peer failures are recovered locally by the component that hit them;
//! everything surfaced to a caller flows through [`NodeError`].

use thiserror::Error;

/// Reasons a file-transfer handshake can be rejected.
///
/// Carried inside RST contracts so the initiator learns why its SYN failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RejectReason {
    /// `data_id` is not 64 lowercase hex characters.
    InvalidDataId,
    /// Serialized contract exceeds the maximum contract size.
    ContractTooLarge,
    /// One of the UNLs failed to decode or has a bad checksum.
    InvalidUnl,
    /// `host_unl` is neither the source nor the destination.
    InvalidHost,
    /// The contract is not addressed to this node.
    NotAddressedToUs,
    /// We are asked to send a shard we do not hold.
    MissingShard,
    /// We are asked to receive a shard we already hold.
    AlreadyStored,
    /// We are already downloading this shard.
    AlreadyDownloading,
    /// Declared file size does not match the shard on disk.
    SizeMismatch,
    /// Contract signature does not recover to the expected signer.
    BadSignature,
    /// The peer aborted the transfer.
    Aborted,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::InvalidDataId => "invalid data id",
            RejectReason::ContractTooLarge => "contract too large",
            RejectReason::InvalidUnl => "invalid unl",
            RejectReason::InvalidHost => "host is neither source nor destination",
            RejectReason::NotAddressedToUs => "contract not addressed to this node",
            RejectReason::MissingShard => "shard not held by sender",
            RejectReason::AlreadyStored => "shard already stored",
            RejectReason::AlreadyDownloading => "shard already downloading",
            RejectReason::SizeMismatch => "file size mismatch",
            RejectReason::BadSignature => "bad contract signature",
            RejectReason::Aborted => "transfer aborted by peer",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("malformed envelope: {0}")]
    BadEnvelope(String),

    #[error("envelope signature verification failed")]
    BadSignature,

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("request timed out")]
    Timeout,

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("request denied: {0}")]
    RequestDenied(RejectReason),

    #[error("downloaded data does not match its id")]
    HashMismatch,

    #[error("transfer failed: {0}")]
    TransferError(String),

    #[error("shard store full: need {needed} bytes, {free} free")]
    MemoryError { needed: u64, free: u64 },

    #[error("bandwidth limit reached")]
    RateLimited,

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("no connection path between nodes")]
    NoPath,

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("invalid unl: {0}")]
    InvalidUnl(String),

    #[error("invalid contract: {0}")]
    InvalidContract(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for NodeError {
    fn from(e: bincode::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl NodeError {
    /// Errors that are dropped silently at the RPC boundary.
    pub fn is_envelope_error(&self) -> bool {
        matches!(
            self,
            NodeError::BadEnvelope(_) | NodeError::BadSignature | NodeError::MessageTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_errors_are_classified() {
        assert!(NodeError::BadSignature.is_envelope_error());
        assert!(NodeError::BadEnvelope("x".into()).is_envelope_error());
        assert!(NodeError::MessageTooLarge { size: 600, max: 519 }.is_envelope_error());
        assert!(!NodeError::Timeout.is_envelope_error());
        assert!(!NodeError::Cancelled.is_envelope_error());
    }

    #[test]
    fn reject_reason_display_is_human_readable() {
        let err = NodeError::RequestDenied(RejectReason::MissingShard);
        assert_eq!(err.to_string(), "request denied: shard not held by sender");
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(NodeError::Io(_))));
    }
}
