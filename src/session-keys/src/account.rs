//! Account and validator model.
//!
//! An [`Account`] always holds exactly one sudo validator (the owner) and at most one
//! regular validator (a session). Installs and uninstalls return a new `Account`; the
//! lifecycle manager only swaps it in after the matching operation is included.

use core::fmt;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{ConfigError, DecodeError, DenyReason, SessionError},
    kernel::{EntryPointVersion, KernelVersion, PermissionId, ValidationId},
    policy::{
        codec::{decode_policies, encode_policies},
        evaluate, Call, Policy, Verdict,
    },
    signer::Signer,
    utils::{
        bytes::{read_address, read_u64_be},
        kernel::{permission_id, permission_validation_id, root_validation_id},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorRole {
    Sudo,
    Regular,
}

impl fmt::Display for ValidatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidatorRole::Sudo => f.write_str("sudo"),
            ValidatorRole::Regular => f.write_str("regular"),
        }
    }
}

/// The owner's unconditional authority over the account.
#[derive(Clone)]
pub struct MasterValidator {
    owner: Address,
    signer: Option<Arc<dyn Signer>>,
}

impl MasterValidator {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { owner: signer.address(), signer: Some(signer) }
    }

    /// Owner identity without a live signer, as seen from the agent side.
    pub fn watch_only(owner: Address) -> Self {
        Self { owner, signer: None }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn signer(&self) -> Option<&Arc<dyn Signer>> {
        self.signer.as_ref()
    }

    pub fn validation_id(&self) -> ValidationId {
        root_validation_id()
    }
}

impl fmt::Debug for MasterValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterValidator")
            .field("owner", &self.owner)
            .field("live_signer", &self.signer.is_some())
            .finish()
    }
}

/// A session key scoped by call policies.
#[derive(Clone)]
pub struct SessionValidator {
    session: Address,
    permission_id: PermissionId,
    policies: Vec<Policy>,
    policy_bytes: Vec<u8>,
    valid_until: Option<u64>,
    signer: Option<Arc<dyn Signer>>,
}

impl SessionValidator {
    /// A session validator with no live signer. The owner only needs the session address.
    ///
    /// `valid_until = Some(0)` is rejected: a zero expiry is how the install data and the
    /// approval digest say "no expiry".
    pub fn new(
        session: Address,
        policies: Vec<Policy>,
        valid_until: Option<u64>,
    ) -> Result<Self, ConfigError> {
        if valid_until == Some(0) {
            return Err(ConfigError::Invalid {
                field: "valid_until",
                reason: "0 is reserved for sessions without expiry".to_string(),
            });
        }
        if policies.iter().any(Policy::is_sudo) {
            return Err(ConfigError::SudoPolicyOnSession);
        }
        let policy_bytes = encode_policies(&policies)?;
        let permission_id = permission_id(session, &policy_bytes);
        Ok(Self { session, permission_id, policies, policy_bytes, valid_until, signer: None })
    }

    /// Bind the session key. Its address must be the session identity.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Result<Self, SessionError> {
        let actual = signer.address();
        if actual != self.session {
            return Err(SessionError::SignerMismatch { expected: self.session, actual });
        }
        self.signer = Some(signer);
        Ok(self)
    }

    pub fn session(&self) -> Address {
        self.session
    }

    pub fn permission_id(&self) -> PermissionId {
        self.permission_id
    }

    pub fn validation_id(&self) -> ValidationId {
        permission_validation_id(self.permission_id)
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn valid_until(&self) -> Option<u64> {
        self.valid_until
    }

    pub fn signer(&self) -> Option<&Arc<dyn Signer>> {
        self.signer.as_ref()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.valid_until.is_some_and(|until| now > until)
    }

    pub fn policy_bytes(&self) -> &[u8] {
        &self.policy_bytes
    }

    /// Allow iff at least one attached policy allows. No policies denies everything.
    pub fn evaluate(&self, call: &Call) -> Verdict {
        let mut first_denial = None;
        for policy in &self.policies {
            match evaluate(policy, call) {
                Verdict::Allow => return Verdict::Allow,
                Verdict::Deny(reason) => {
                    first_denial.get_or_insert(reason);
                }
            }
        }
        Verdict::Deny(first_denial.unwrap_or(DenyReason::NoPolicies))
    }

    /// Validator install data: `session (20) || validUntil u64 (0 = none) || policies`.
    pub fn install_data(&self) -> Bytes {
        let mut out = Vec::with_capacity(28 + self.policy_bytes.len());
        out.extend_from_slice(self.session.as_slice());
        out.extend_from_slice(&self.valid_until.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&self.policy_bytes);
        out.into()
    }

    /// Inverse of [`SessionValidator::install_data`].
    pub fn from_install_data(data: &[u8]) -> Result<Self, DecodeError> {
        let mut i = 0usize;
        let session = read_address(data, &mut i)?;
        let valid_until = match read_u64_be(data, &mut i)? {
            0 => None,
            until => Some(until),
        };
        let policies = decode_policies(data, &mut i)?;
        if i != data.len() {
            return Err(DecodeError::TrailingBytes);
        }
        Self::new(session, policies, valid_until).map_err(|e| DecodeError::InvalidPolicy(e.to_string()))
    }
}

impl fmt::Debug for SessionValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionValidator")
            .field("session", &self.session)
            .field("permission_id", &self.permission_id)
            .field("policies", &self.policies.len())
            .field("valid_until", &self.valid_until)
            .field("live_signer", &self.signer.is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum Validator {
    Master(MasterValidator),
    Session(SessionValidator),
}

impl Validator {
    pub fn validation_id(&self) -> ValidationId {
        match self {
            Validator::Master(master) => master.validation_id(),
            Validator::Session(session) => session.validation_id(),
        }
    }

    pub fn signer(&self) -> Option<&Arc<dyn Signer>> {
        match self {
            Validator::Master(master) => master.signer(),
            Validator::Session(session) => session.signer(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Account {
    address: Address,
    chain_id: u64,
    entry_point: EntryPointVersion,
    kernel: KernelVersion,
    sudo: MasterValidator,
    regular: Option<SessionValidator>,
}

impl Account {
    /// EIP-7702 account: the owner's EOA is the account.
    pub fn create(
        owner: Arc<dyn Signer>,
        chain_id: u64,
        entry_point: EntryPointVersion,
        kernel: KernelVersion,
    ) -> Self {
        let master = MasterValidator::new(owner);
        Self::at(master.owner(), master, chain_id, entry_point, kernel)
    }

    /// An account at a known address.
    pub fn at(
        address: Address,
        master: MasterValidator,
        chain_id: u64,
        entry_point: EntryPointVersion,
        kernel: KernelVersion,
    ) -> Self {
        Self { address, chain_id, entry_point, kernel, sudo: master, regular: None }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn entry_point(&self) -> EntryPointVersion {
        self.entry_point
    }

    pub fn kernel(&self) -> KernelVersion {
        self.kernel
    }

    pub fn sudo(&self) -> &MasterValidator {
        &self.sudo
    }

    pub fn regular(&self) -> Option<&SessionValidator> {
        self.regular.as_ref()
    }

    pub fn has_validator(&self, validation_id: ValidationId) -> bool {
        self.sudo.validation_id() == validation_id
            || self.regular.as_ref().is_some_and(|v| v.validation_id() == validation_id)
    }

    pub fn install_validator(&self, validator: Validator, role: ValidatorRole) -> Result<Account, SessionError> {
        let mut next = self.clone();
        match (role, validator) {
            (ValidatorRole::Sudo, Validator::Master(master)) => next.sudo = master,
            (ValidatorRole::Regular, Validator::Session(session)) => {
                if self.regular.is_some() {
                    return Err(SessionError::ValidatorAlreadyInstalled);
                }
                next.regular = Some(session);
            }
            (role, _) => return Err(SessionError::RoleMismatch(role)),
        }
        Ok(next)
    }

    /// Remove the regular validator with `validation_id`. Absent validators leave the
    /// account unchanged.
    pub fn uninstall_validator(&self, validation_id: ValidationId) -> Result<Account, SessionError> {
        if self.sudo.validation_id() == validation_id {
            return Err(SessionError::CannotUninstallSudo);
        }
        let mut next = self.clone();
        if next.regular.as_ref().is_some_and(|v| v.validation_id() == validation_id) {
            next.regular = None;
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{abi::FunctionAbi, policy::{CallPolicy, Permission}, signer::LocalSigner};

    fn account() -> Account {
        Account::create(
            Arc::new(LocalSigner::random()),
            1,
            EntryPointVersion::V07,
            KernelVersion::V3_1,
        )
    }

    fn session_validator(session: Address) -> SessionValidator {
        let permission = Permission::new(
            Address::repeat_byte(0x11),
            FunctionAbi::parse("transfer(address,uint256)").unwrap(),
        );
        SessionValidator::new(session, vec![Policy::Call(CallPolicy::new(vec![permission]))], None)
            .unwrap()
    }

    #[test]
    fn zero_expiry_is_refused() {
        let policies = session_validator(Address::ZERO).policies().to_vec();
        assert!(matches!(
            SessionValidator::new(Address::repeat_byte(0x5e), policies.clone(), Some(0)),
            Err(ConfigError::Invalid { field: "valid_until", .. })
        ));

        // Earliest real expiry survives the install data round trip distinct from "none".
        let one = SessionValidator::new(Address::repeat_byte(0x5e), policies, Some(1)).unwrap();
        let restored = SessionValidator::from_install_data(&one.install_data()).unwrap();
        assert_eq!(restored.valid_until(), Some(1));
        assert!(restored.is_expired(2));
    }

    #[test]
    fn account_address_is_the_owner() {
        let account = account();
        assert_eq!(account.address(), account.sudo().owner());
        assert!(account.regular().is_none());
    }

    #[test]
    fn only_one_regular_validator() {
        let account = account();
        let first = session_validator(Address::repeat_byte(1));
        let installed = account
            .install_validator(Validator::Session(first.clone()), ValidatorRole::Regular)
            .unwrap();
        assert!(installed.has_validator(first.validation_id()));

        let second = session_validator(Address::repeat_byte(2));
        assert!(matches!(
            installed.install_validator(Validator::Session(second), ValidatorRole::Regular),
            Err(SessionError::ValidatorAlreadyInstalled)
        ));
    }

    #[test]
    fn roles_must_match_validator_kinds() {
        let account = account();
        let session = session_validator(Address::repeat_byte(1));
        assert!(matches!(
            account.install_validator(Validator::Session(session), ValidatorRole::Sudo),
            Err(SessionError::RoleMismatch(ValidatorRole::Sudo))
        ));
        let master = MasterValidator::watch_only(Address::repeat_byte(9));
        assert!(matches!(
            account.install_validator(Validator::Master(master), ValidatorRole::Regular),
            Err(SessionError::RoleMismatch(ValidatorRole::Regular))
        ));
    }

    #[test]
    fn uninstall_is_idempotent() {
        let session = session_validator(Address::repeat_byte(1));
        let vid = session.validation_id();
        let account = account()
            .install_validator(Validator::Session(session), ValidatorRole::Regular)
            .unwrap();

        let once = account.uninstall_validator(vid).unwrap();
        assert!(!once.has_validator(vid));
        let twice = once.uninstall_validator(vid).unwrap();
        assert!(twice.regular().is_none());

        assert!(matches!(
            twice.uninstall_validator(twice.sudo().validation_id()),
            Err(SessionError::CannotUninstallSudo)
        ));
    }

    #[test]
    fn sessions_refuse_sudo_policies_and_foreign_signers() {
        assert_eq!(
            SessionValidator::new(Address::ZERO, vec![Policy::Sudo], None).unwrap_err(),
            ConfigError::SudoPolicyOnSession
        );

        let key = Arc::new(LocalSigner::random());
        let session = session_validator(key.address());
        assert!(session.clone().with_signer(key).is_ok());
        assert!(matches!(
            session.with_signer(Arc::new(LocalSigner::random())),
            Err(SessionError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn empty_session_denies_everything() {
        let session = SessionValidator::new(Address::repeat_byte(1), Vec::new(), None).unwrap();
        assert_eq!(
            session.evaluate(&Call::new(Address::ZERO, vec![0u8; 4])),
            Verdict::Deny(DenyReason::NoPolicies)
        );
    }

    #[test]
    fn install_data_reconstructs_the_validator() {
        let session = SessionValidator::new(
            Address::repeat_byte(3),
            session_validator(Address::repeat_byte(3)).policies().to_vec(),
            Some(1_700_000_000),
        )
        .unwrap();
        let decoded = SessionValidator::from_install_data(&session.install_data()).unwrap();
        assert_eq!(decoded.permission_id(), session.permission_id());
        assert_eq!(decoded.valid_until(), Some(1_700_000_000));
        assert_eq!(decoded.policies(), session.policies());
    }
}
