//! Cryptographic helpers: keccak hashing, EIP-191 message hashing and ECDSA recovery.
//!
//! Purpose: derive EOA addresses for session identities and check that approvals and
//! operations were signed by the identity they claim.

use alloy_primitives::{Address, B256};
use k256::{
    ecdsa::{RecoveryId, Signature, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use crate::signer::SignerError;

pub fn keccak256_bytes(bytes: &[u8]) -> B256 {
    let mut h = Keccak256::new();
    h.update(bytes);
    B256::from_slice(h.finalize().as_slice())
}

/// `keccak256("\x19Ethereum Signed Message:\n32" || hash)`.
pub fn eth_message_hash(hash: B256) -> B256 {
    let mut buf = Vec::with_capacity(28 + 32);
    buf.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    buf.extend_from_slice(hash.as_slice());
    keccak256_bytes(&buf)
}

/// EOA address of a secp256k1 public key: the low 20 bytes of `keccak256(x || y)`.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let digest = keccak256_bytes(&point.as_bytes()[1..]);
    Address::from_slice(&digest[12..])
}

/// Recover an EOA address from a 32-byte digest and an `r || s || v` signature.
///
/// Accepts v in {0, 1, 27, 28}.
pub fn recover_address(digest: B256, sig: &[u8; 65]) -> Result<Address, SignerError> {
    let v = match sig[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        other => return Err(SignerError::InvalidRecoveryId(other)),
    };
    let recovery_id = RecoveryId::from_byte(v).ok_or(SignerError::InvalidRecoveryId(sig[64]))?;
    let signature =
        Signature::from_slice(&sig[..64]).map_err(|_| SignerError::MalformedSignature)?;
    let key = VerifyingKey::recover_from_prehash(digest.as_slice(), &signature, recovery_id)
        .map_err(|_| SignerError::RecoveryFailed)?;
    Ok(address_of(&key))
}
