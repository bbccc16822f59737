//! # Cryptographic Helpers
//!
//! - **Content hashing**: SHA-256 for shard ids, envelope digests and DHT keys
//! - **Signatures**: domain-separated, recoverable secp256k1 signing
//!
//! Every signed record type uses its own domain prefix so a signature made
//! for one record can never verify as another.

use sha2::{Digest, Sha256};

use crate::identity::{recover_signer, Keypair, NodeId, SIGNATURE_LEN};

// ============================================================================
// Signature Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature is not 65 bytes.
    InvalidLength,
    /// `r`, `s` or the recovery id are out of range.
    Malformed,
    /// No public key recovers from this signature and message.
    VerificationFailed,
    /// The recovered key does not belong to the claimed signer.
    WrongSigner,
    /// The secret key bytes are not a valid scalar.
    InvalidSecretKey,
    SigningFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::Malformed => write!(f, "signature is malformed"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::WrongSigner => write!(f, "signature made by a different key"),
            SignatureError::InvalidSecretKey => write!(f, "invalid secret key"),
            SignatureError::SigningFailed => write!(f, "signing failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Application and RPC envelopes.
pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"shardnet-envelope-v1:";

/// File-transfer contracts.
pub const CONTRACT_SIGNATURE_DOMAIN: &[u8] = b"shardnet-contract-v1:";

/// Monitor datasets.
pub const DATASET_SIGNATURE_DOMAIN: &[u8] = b"shardnet-dataset-v1:";

/// Bandwidth test requests.
pub const BANDWIDTH_TEST_SIGNATURE_DOMAIN: &[u8] = b"shardnet-bwtest-v1:";

// ============================================================================
// Hashing
// ============================================================================

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

fn domain_digest(domain: &[u8], data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign `sha256(domain ‖ data)`; returns the 65-byte recoverable signature.
pub fn sign_with_domain(
    keypair: &Keypair,
    domain: &[u8],
    data: &[u8],
) -> Result<[u8; SIGNATURE_LEN], SignatureError> {
    keypair.sign_prehash(&domain_digest(domain, data))
}

/// Recover the signer's node id from a domain-separated signature.
pub fn recover_with_domain(
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<NodeId, SignatureError> {
    recover_signer(&domain_digest(domain, data), signature).map(|(id, _)| id)
}

/// Verify that `signature` over `data` was made by `signer`.
pub fn verify_with_domain(
    signer: &NodeId,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let recovered = recover_with_domain(domain, data, signature)?;
    if &recovered != signer {
        return Err(SignatureError::WrongSigner);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, CONTRACT_SIGNATURE_DOMAIN, b"payload").expect("sign");
        assert!(verify_with_domain(&kp.node_id(), CONTRACT_SIGNATURE_DOMAIN, b"payload", &sig).is_ok());
    }

    #[test]
    fn domains_do_not_cross_verify() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, CONTRACT_SIGNATURE_DOMAIN, b"payload").expect("sign");
        let result = verify_with_domain(&kp.node_id(), DATASET_SIGNATURE_DOMAIN, b"payload", &sig);
        assert!(result.is_err());
    }

    #[test]
    fn wrong_signer_is_reported() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sig = sign_with_domain(&kp, ENVELOPE_SIGNATURE_DOMAIN, b"body").expect("sign");
        assert_eq!(
            verify_with_domain(&other.node_id(), ENVELOPE_SIGNATURE_DOMAIN, b"body", &sig),
            Err(SignatureError::WrongSigner)
        );
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
