//! Pluggable signing capability for master and session validators.
//!
//! The core only needs an address and a way to sign a 32-byte digest; where the key
//! lives is up to the implementation. [`LocalSigner`] keeps a secp256k1 key in memory.

use core::fmt;

use alloy_primitives::{Address, B256};
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::{
    errors::ConfigError,
    utils::crypto::{address_of, eth_message_hash},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("invalid recovery id {0}")]
    InvalidRecoveryId(u8),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature recovery failed")]
    RecoveryFailed,
    #[error("signer backend failure: {0}")]
    Backend(String),
}

/// ECDSA signature laid out as `r || s || v` with v in {27, 28}.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EcdsaSignature(pub [u8; 65]);

impl EcdsaSignature {
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }
}

impl fmt::Debug for EcdsaSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EcdsaSignature(0x{})", hex::encode(self.0))
    }
}

pub trait Signer: Send + Sync {
    /// Public identity of the signer.
    fn address(&self) -> Address;

    /// Sign a raw 32-byte digest.
    fn sign_hash(&self, hash: B256) -> Result<EcdsaSignature, SignerError>;

    /// Sign `hash` under the EIP-191 personal-message prefix.
    fn sign_message_hash(&self, hash: B256) -> Result<EcdsaSignature, SignerError> {
        self.sign_hash(eth_message_hash(hash))
    }
}

/// In-memory secp256k1 signer.
#[derive(Clone)]
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl LocalSigner {
    pub fn random() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let key = SigningKey::from_slice(bytes).map_err(|_| ConfigError::InvalidKey)?;
        Ok(Self::from_signing_key(key))
    }

    /// Parse a 32-byte hex private key, with or without `0x`.
    pub fn from_hex(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        let raw = hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|_| ConfigError::InvalidKey)?;
        if raw.len() != 32 {
            return Err(ConfigError::InvalidKey);
        }
        Self::from_bytes(&raw)
    }

    /// Hex-encoded private key. Only for handing a freshly generated session key to its holder.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.key.to_bytes()))
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner").field("address", &self.address).finish_non_exhaustive()
    }
}

impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign_hash(&self, hash: B256) -> Result<EcdsaSignature, SignerError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| SignerError::Backend(e.to_string()))?;
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = 27 + recovery_id.to_byte();
        Ok(EcdsaSignature(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::crypto::recover_address;

    // Well-known development key (anvil account #0).
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn derives_the_expected_address() {
        let signer = LocalSigner::from_hex(DEV_KEY).unwrap();
        assert_eq!(
            signer.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse::<Address>().unwrap()
        );
        assert_eq!(signer.to_hex(), DEV_KEY);
    }

    #[test]
    fn signatures_recover_to_the_signer() {
        let signer = LocalSigner::random();
        let digest = B256::repeat_byte(0x11);
        let sig = signer.sign_hash(digest).unwrap();
        assert_eq!(recover_address(digest, sig.as_bytes()).unwrap(), signer.address());

        let sig = signer.sign_message_hash(digest).unwrap();
        assert_eq!(
            recover_address(eth_message_hash(digest), sig.as_bytes()).unwrap(),
            signer.address()
        );
    }

    #[test]
    fn rejects_bad_key_material() {
        assert_eq!(LocalSigner::from_hex("0x1234").unwrap_err(), ConfigError::InvalidKey);
        assert_eq!(LocalSigner::from_hex(&"00".repeat(32)).unwrap_err(), ConfigError::InvalidKey);
        assert_eq!(LocalSigner::from_hex("zz").unwrap_err(), ConfigError::InvalidKey);
    }
}
