//! Approval artifacts: the secret-free hand-off from owner to agent.
//!
//! An artifact is base64 of a big-endian envelope:
//!
//! - u16 format version
//! - u8 entry point version, u8 kernel version
//! - u64 chain id
//! - address account, address owner
//! - bytes4 permission id
//! - address session
//! - u8 expiry flag (+ u64 valid until)
//! - policies (see [`crate::policy::codec`])
//! - u16 sig_len (must be 65)
//! - bytes owner signature over [`approval_digest`]
//!
//! Trailing bytes are rejected.

use core::{fmt, str::FromStr};
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    account::{Account, MasterValidator, SessionValidator, Validator, ValidatorRole},
    errors::{DecodeError, SessionError},
    kernel::{EntryPointVersion, KernelVersion, PermissionId},
    policy::codec::decode_policies,
    signer::{EcdsaSignature, Signer},
    utils::{
        bytes::{read_address, read_fixed, read_u16_be, read_u64_be, read_u8, read_vec},
        crypto::{keccak256_bytes, recover_address},
    },
};

/// Envelope format produced by this build.
pub const ARTIFACT_VERSION: u16 = 1;

const SIGNATURE_LEN: u16 = 65;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalArtifact(String);

impl ApprovalArtifact {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode and check the owner signature, without binding a session signer.
    pub fn decode(&self) -> Result<DecodedApproval, SessionError> {
        let bytes = STANDARD
            .decode(self.0.trim())
            .map_err(|e| DecodeError::Encoding(e.to_string()))?;
        DecodedApproval::from_bytes(&bytes)
    }
}

impl fmt::Display for ApprovalArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ApprovalArtifact {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().to_string()))
    }
}

/// Contents of an artifact whose owner signature has been verified.
#[derive(Clone, Debug)]
pub struct DecodedApproval {
    pub version: u16,
    pub entry_point: EntryPointVersion,
    pub kernel: KernelVersion,
    pub chain_id: u64,
    pub account: Address,
    pub owner: Address,
    pub session: SessionValidator,
    pub owner_signature: EcdsaSignature,
}

impl DecodedApproval {
    fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        let mut i = 0usize;

        let version = read_u16_be(bytes, &mut i)?;
        if version != ARTIFACT_VERSION {
            return Err(SessionError::VersionMismatch(format!("artifact format v{version}")));
        }
        let entry_point = EntryPointVersion::try_from(read_u8(bytes, &mut i)?)
            .map_err(|tag| SessionError::VersionMismatch(format!("entry point tag 0x{tag:02x}")))?;
        let kernel = KernelVersion::try_from(read_u8(bytes, &mut i)?)
            .map_err(|tag| SessionError::VersionMismatch(format!("kernel tag 0x{tag:02x}")))?;

        let chain_id = read_u64_be(bytes, &mut i)?;
        let account = read_address(bytes, &mut i)?;
        let owner = read_address(bytes, &mut i)?;
        let permission_id: PermissionId = read_fixed::<4>(bytes, &mut i)?;
        let session = read_address(bytes, &mut i)?;
        let valid_until = match read_u8(bytes, &mut i)? {
            0 => None,
            1 => Some(read_u64_be(bytes, &mut i)?),
            other => return Err(DecodeError::UnknownTag(other).into()),
        };
        let policies = decode_policies(bytes, &mut i)?;

        let sig_len = read_u16_be(bytes, &mut i)?;
        if sig_len != SIGNATURE_LEN {
            return Err(DecodeError::InvalidPolicy(format!("signature length {sig_len}")).into());
        }
        let raw_signature = read_vec(bytes, &mut i, SIGNATURE_LEN as usize)?;
        if i != bytes.len() {
            return Err(DecodeError::TrailingBytes.into());
        }
        let mut owner_signature = [0u8; 65];
        owner_signature.copy_from_slice(&raw_signature);

        let session = SessionValidator::new(session, policies, valid_until)
            .map_err(|e| DecodeError::InvalidPolicy(e.to_string()))?;
        if session.permission_id() != permission_id {
            return Err(DecodeError::InvalidPolicy("permission id does not match policies".into()).into());
        }

        let decoded = Self {
            version,
            entry_point,
            kernel,
            chain_id,
            account,
            owner,
            session,
            owner_signature: EcdsaSignature(owner_signature),
        };
        decoded.verify_owner_signature()?;
        Ok(decoded)
    }

    pub fn digest(&self) -> B256 {
        approval_digest(
            self.chain_id,
            self.account,
            self.session.permission_id(),
            self.session.session(),
            self.session.valid_until(),
            self.session.policy_bytes(),
        )
    }

    fn verify_owner_signature(&self) -> Result<(), SessionError> {
        let invalid = SessionError::InvalidApproval { owner: self.owner };
        match recover_address(self.digest(), self.owner_signature.as_bytes()) {
            Ok(recovered) if recovered == self.owner => Ok(()),
            _ => Err(invalid),
        }
    }
}

/// Owner-signed approval for a session, bound to the account and chain.
pub fn serialize(account: &Account, validator: &SessionValidator) -> Result<ApprovalArtifact, SessionError> {
    let owner = account
        .sudo()
        .signer()
        .ok_or(SessionError::MissingSigner(ValidatorRole::Sudo))?;
    let policy_bytes = validator.policy_bytes();
    let digest = approval_digest(
        account.chain_id(),
        account.address(),
        validator.permission_id(),
        validator.session(),
        validator.valid_until(),
        policy_bytes,
    );
    let signature = owner.sign_hash(digest)?;

    let mut out = Vec::with_capacity(2 + 2 + 8 + 20 + 20 + 4 + 20 + 9 + policy_bytes.len() + 2 + 65);
    out.extend_from_slice(&ARTIFACT_VERSION.to_be_bytes());
    out.push(account.entry_point() as u8);
    out.push(account.kernel() as u8);
    out.extend_from_slice(&account.chain_id().to_be_bytes());
    out.extend_from_slice(account.address().as_slice());
    out.extend_from_slice(account.sudo().owner().as_slice());
    out.extend_from_slice(validator.permission_id().as_slice());
    out.extend_from_slice(validator.session().as_slice());
    match validator.valid_until() {
        Some(until) => {
            out.push(1);
            out.extend_from_slice(&until.to_be_bytes());
        }
        None => out.push(0),
    }
    out.extend_from_slice(policy_bytes);
    out.extend_from_slice(&SIGNATURE_LEN.to_be_bytes());
    out.extend_from_slice(signature.as_bytes());

    debug!(
        account = %account.address(),
        session = %validator.session(),
        permission_id = %validator.permission_id(),
        "serialized approval artifact"
    );
    Ok(ApprovalArtifact(STANDARD.encode(out)))
}

/// Rebuild the agent's view of the account from an artifact and the session key.
pub fn deserialize(artifact: &ApprovalArtifact, signer: Arc<dyn Signer>) -> Result<Account, SessionError> {
    let decoded = artifact.decode()?;
    let session = decoded.session.with_signer(signer)?;
    let account = Account::at(
        decoded.account,
        MasterValidator::watch_only(decoded.owner),
        decoded.chain_id,
        decoded.entry_point,
        decoded.kernel,
    );
    account.install_validator(Validator::Session(session), ValidatorRole::Regular)
}

/// EIP-712 digest the owner signs to approve a session.
///
/// Domain: `("Session Key Approval", "1", chainId, account)`. Message:
/// `SessionApproval(address account,bytes4 permissionId,address sessionSigner,uint64 validUntil,bytes32 policyHash)`.
pub fn approval_digest(
    chain_id: u64,
    account: Address,
    permission_id: PermissionId,
    session: Address,
    valid_until: Option<u64>,
    policy_bytes: &[u8],
) -> B256 {
    let domain_type_hash = keccak256_bytes(
        b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
    );
    let mut domain_buf = Vec::with_capacity(32 * 5);
    domain_buf.extend_from_slice(domain_type_hash.as_slice());
    domain_buf.extend_from_slice(keccak256_bytes(b"Session Key Approval").as_slice());
    domain_buf.extend_from_slice(keccak256_bytes(b"1").as_slice());
    domain_buf.extend_from_slice(&U256::from(chain_id).to_be_bytes::<32>());
    domain_buf.extend_from_slice(account.into_word().as_slice());
    let domain_separator = keccak256_bytes(&domain_buf);

    let msg_type_hash = keccak256_bytes(
        b"SessionApproval(address account,bytes4 permissionId,address sessionSigner,uint64 validUntil,bytes32 policyHash)",
    );
    let mut struct_buf = Vec::with_capacity(32 * 6);
    struct_buf.extend_from_slice(msg_type_hash.as_slice());
    struct_buf.extend_from_slice(account.into_word().as_slice());
    // bytesN is left-aligned.
    let mut pid_word = [0u8; 32];
    pid_word[..4].copy_from_slice(permission_id.as_slice());
    struct_buf.extend_from_slice(&pid_word);
    struct_buf.extend_from_slice(session.into_word().as_slice());
    struct_buf.extend_from_slice(&U256::from(valid_until.unwrap_or(0)).to_be_bytes::<32>());
    struct_buf.extend_from_slice(keccak256_bytes(policy_bytes).as_slice());
    let struct_hash = keccak256_bytes(&struct_buf);

    let mut final_buf = Vec::with_capacity(2 + 32 + 32);
    final_buf.extend_from_slice(b"\x19\x01");
    final_buf.extend_from_slice(domain_separator.as_slice());
    final_buf.extend_from_slice(struct_hash.as_slice());
    keccak256_bytes(&final_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::FunctionAbi,
        policy::{CallPolicy, Permission, Policy},
        signer::LocalSigner,
    };

    fn setup() -> (Account, SessionValidator, Arc<LocalSigner>) {
        let owner = Arc::new(LocalSigner::random());
        let account = Account::create(owner, 11155111, EntryPointVersion::V07, KernelVersion::V3_1);
        let session_key = Arc::new(LocalSigner::random());
        let permission = Permission::new(
            Address::repeat_byte(0x11),
            FunctionAbi::parse("transfer(address,uint256)").unwrap(),
        );
        let validator = SessionValidator::new(
            session_key.address(),
            vec![Policy::Call(CallPolicy::new(vec![permission]))],
            Some(4_000_000_000),
        )
        .unwrap();
        (account, validator, session_key)
    }

    fn rewrite(artifact: &ApprovalArtifact, f: impl FnOnce(&mut Vec<u8>)) -> ApprovalArtifact {
        let mut bytes = STANDARD.decode(artifact.as_str()).unwrap();
        f(&mut bytes);
        ApprovalArtifact(STANDARD.encode(bytes))
    }

    #[test]
    fn deserializes_with_the_session_key() {
        let (account, validator, key) = setup();
        let artifact = serialize(&account, &validator).unwrap();
        let agent_view = deserialize(&artifact, key).unwrap();

        assert_eq!(agent_view.address(), account.address());
        assert_eq!(agent_view.sudo().owner(), account.sudo().owner());
        assert!(agent_view.sudo().signer().is_none());
        let session = agent_view.regular().unwrap();
        assert_eq!(session.permission_id(), validator.permission_id());
        assert_eq!(session.valid_until(), Some(4_000_000_000));
        assert!(session.signer().is_some());
    }

    #[test]
    fn other_keys_are_rejected() {
        let (account, validator, _) = setup();
        let artifact = serialize(&account, &validator).unwrap();
        assert!(matches!(
            deserialize(&artifact, Arc::new(LocalSigner::random())),
            Err(SessionError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn artifacts_carry_no_key_material() {
        let (account, validator, key) = setup();
        let artifact = serialize(&account, &validator).unwrap();
        let bytes = STANDARD.decode(artifact.as_str()).unwrap();
        let secret = hex::decode(key.to_hex().trim_start_matches("0x")).unwrap();
        assert!(!bytes.windows(32).any(|w| w == secret.as_slice()));
    }

    #[test]
    fn serialize_needs_the_owner_signer() {
        let (account, validator, _) = setup();
        let watch_only = Account::at(
            account.address(),
            MasterValidator::watch_only(account.sudo().owner()),
            account.chain_id(),
            account.entry_point(),
            account.kernel(),
        );
        assert!(matches!(
            serialize(&watch_only, &validator),
            Err(SessionError::MissingSigner(ValidatorRole::Sudo))
        ));
    }

    #[test]
    fn version_and_encoding_errors() {
        let (account, validator, key) = setup();
        let artifact = serialize(&account, &validator).unwrap();

        let future = rewrite(&artifact, |b| b[..2].copy_from_slice(&2u16.to_be_bytes()));
        assert!(matches!(deserialize(&future, key.clone()), Err(SessionError::VersionMismatch(_))));

        let other_kernel = rewrite(&artifact, |b| b[3] = 0x20);
        assert!(matches!(deserialize(&other_kernel, key.clone()), Err(SessionError::VersionMismatch(_))));

        let trailing = rewrite(&artifact, |b| b.push(0));
        assert!(matches!(
            deserialize(&trailing, key.clone()),
            Err(SessionError::MalformedArtifact(DecodeError::TrailingBytes))
        ));

        let garbage: ApprovalArtifact = "not base64!".parse().unwrap();
        assert!(matches!(
            deserialize(&garbage, key),
            Err(SessionError::MalformedArtifact(DecodeError::Encoding(_)))
        ));
    }

    #[test]
    fn tampering_breaks_the_owner_signature() {
        let (account, validator, key) = setup();
        let artifact = serialize(&account, &validator).unwrap();

        // Push the expiry (flag at 76, value at 77..85) further out.
        let extended = rewrite(&artifact, |b| b[77] ^= 0x01);
        assert!(matches!(
            deserialize(&extended, key),
            Err(SessionError::InvalidApproval { .. })
        ));
    }
}
