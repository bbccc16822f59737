//! # Identity
//!
//! Core identity types used throughout the overlay:
//!
//! - [`Keypair`]: secp256k1 signing key
//! - [`NodeId`]: 20-byte identifier, `sha256(compressed public key)[..20]`
//! - [`Contact`]: a node id paired with the UDP address it was last seen at
//!
//! Signatures are recoverable (`r ‖ s ‖ recovery_id`, 65 bytes), so a signed
//! record needs to carry only the signer's node id: the verifier recovers the
//! public key from the signature and re-derives the id.
//!
//! Distance between ids is XOR interpreted as a big-endian unsigned integer;
//! [`distance_cmp`] compares two distances without widening them.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::SignatureError;

/// Length of a [`NodeId`] in bytes.
pub const ID_LEN: usize = 20;

/// Length of a recoverable signature: `r ‖ s ‖ recovery_id`.
pub const SIGNATURE_LEN: usize = 65;

/// Length of a compressed SEC1 public key.
pub const PUBLIC_KEY_LEN: usize = 33;

/// Seconds since the Unix epoch.
#[inline]
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    millis(SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default())
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
#[inline]
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        let signing_key =
            SigningKey::from_bytes(bytes.into()).map_err(|_| SignatureError::InvalidSecretKey)?;
        Ok(Self { signing_key })
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    /// Compressed SEC1 encoding of the public key.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        compressed_public_key(self.signing_key.verifying_key())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key_bytes())
    }

    /// Sign a 32-byte digest, returning the 65-byte recoverable signature.
    pub fn sign_prehash(&self, prehash: &[u8; 32]) -> Result<[u8; SIGNATURE_LEN], SignatureError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(prehash)
            .map_err(|_| SignatureError::SigningFailed)?;
        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(out)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

fn compressed_public_key(key: &VerifyingKey) -> [u8; PUBLIC_KEY_LEN] {
    let sec1 = key.to_sec1_bytes();
    let mut out = [0u8; PUBLIC_KEY_LEN];
    out.copy_from_slice(&sec1[..PUBLIC_KEY_LEN]);
    out
}

/// Recover the signer of `prehash` from a 65-byte recoverable signature.
///
/// Returns the signer's node id and compressed public key.
pub fn recover_signer(
    prehash: &[u8; 32],
    signature: &[u8],
) -> Result<(NodeId, [u8; PUBLIC_KEY_LEN]), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != SIGNATURE_LEN {
        return Err(SignatureError::InvalidLength);
    }
    let sig = Signature::from_slice(&signature[..64]).map_err(|_| SignatureError::Malformed)?;
    let recovery_id =
        RecoveryId::from_byte(signature[64]).ok_or(SignatureError::Malformed)?;
    let key = VerifyingKey::recover_from_prehash(prehash, &sig, recovery_id)
        .map_err(|_| SignatureError::VerificationFailed)?;
    let public_key = compressed_public_key(&key);
    Ok((NodeId::from_public_key(&public_key), public_key))
}

// ============================================================================
// NodeId
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// `sha256(public_key)[..20]`.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&digest[..ID_LEN]);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// True when `self` is strictly closer to `target` than `other` is.
    pub fn is_closer_than(&self, other: &NodeId, target: &NodeId) -> bool {
        distance_cmp(&self.xor_distance(target), &other.xor_distance(target))
            == std::cmp::Ordering::Less
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Base58 form used in human-facing keys such as monitor dataset names.
    pub fn to_base58(self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Short prefix for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compare two XOR distances as big-endian unsigned integers.
#[inline]
pub fn distance_cmp(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; ID_LEN] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Contact
// ============================================================================

/// A peer as the routing table knows it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    #[test]
    fn millis_saturates_instead_of_wrapping() {
        assert_eq!(millis(Duration::from_millis(1234)), 1234);
        assert_eq!(millis(Duration::from_micros(1999)), 1);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_keypair_generation() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.node_id(), kp2.node_id());
        assert_ne!(kp1.public_key_bytes(), kp2.public_key_bytes());
    }

    #[test]
    fn test_node_id_derivation_is_pure() {
        let kp = Keypair::from_secret_key_bytes(&[0x42; 32]).expect("valid key");
        let pk = kp.public_key_bytes();
        assert_eq!(NodeId::from_public_key(&pk), NodeId::from_public_key(&pk));
        assert_eq!(kp.node_id(), NodeId::from_public_key(&pk));
        assert_eq!(&sha256(&pk)[..ID_LEN], kp.node_id().as_bytes());
    }

    #[test]
    fn test_secret_key_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&kp.secret_key_bytes()).expect("valid key");
        assert_eq!(kp.node_id(), restored.node_id());
    }

    #[test]
    fn test_zero_secret_key_rejected() {
        assert!(Keypair::from_secret_key_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_recover_signer() {
        let kp = Keypair::generate();
        let digest = sha256(b"hello world");
        let sig = kp.sign_prehash(&digest).expect("sign");

        let (id, pk) = recover_signer(&digest, &sig).expect("recover");
        assert_eq!(id, kp.node_id());
        assert_eq!(pk, kp.public_key_bytes());

        let other = sha256(b"wrong message");
        let recovered = recover_signer(&other, &sig).map(|(id, _)| id);
        assert_ne!(recovered.ok(), Some(kp.node_id()));
    }

    #[test]
    fn test_recover_rejects_bad_lengths() {
        let digest = sha256(b"x");
        assert_eq!(recover_signer(&digest, &[]), Err(SignatureError::Missing));
        assert_eq!(recover_signer(&digest, &[0u8; 64]), Err(SignatureError::InvalidLength));
    }

    #[test]
    fn test_xor_distance() {
        let a = NodeId::from_bytes([0xFF; ID_LEN]);
        let b = NodeId::from_bytes([0x00; ID_LEN]);

        assert_eq!(a.xor_distance(&a), [0u8; ID_LEN]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xFF; ID_LEN]);
    }

    #[test]
    fn test_is_closer_than() {
        let target = NodeId::from_bytes([0u8; ID_LEN]);
        let mut near = [0u8; ID_LEN];
        near[ID_LEN - 1] = 1;
        let mut far = [0u8; ID_LEN];
        far[0] = 1;
        let near = NodeId::from_bytes(near);
        let far = NodeId::from_bytes(far);

        assert!(near.is_closer_than(&far, &target));
        assert!(!far.is_closer_than(&near, &target));
        assert!(!near.is_closer_than(&near, &target));
    }

    #[test]
    fn test_hex_roundtrip_and_length_check() {
        let id = Keypair::generate().node_id();
        assert_eq!(NodeId::from_hex(&id.to_hex()).expect("hex"), id);
        assert!(NodeId::from_hex("abcd").is_err());
    }
}
