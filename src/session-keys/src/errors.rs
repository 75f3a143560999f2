use alloy_primitives::{Address, FixedBytes, U256};
use thiserror::Error;

use session_policy_types::{LedgerError, ParamCondition, UnknownCondition, UnknownParamType};

use crate::{account::ValidatorRole, session::SessionState, signer::SignerError};

pub type Result<T, E = SessionError> = core::result::Result<T, E>;

/// Fatal configuration and policy-construction errors. Raised before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("invalid private key material")]
    InvalidKey,
    #[error(transparent)]
    UnknownCondition(#[from] UnknownCondition),
    #[error(transparent)]
    UnknownParamType(#[from] UnknownParamType),
    #[error("malformed function signature `{0}`")]
    InvalidSignature(String),
    #[error("no ABI registered for `{signature}` on {target}")]
    UnknownFunction { target: Address, signature: String },
    #[error("`{signature}` has no argument `{argument}`")]
    UnknownArgument { signature: String, argument: String },
    #[error("argument {index} of `{signature}` is `{param}`; conditions need an elementary static type")]
    UnsupportedArgument { signature: String, index: usize, param: String },
    #[error("invalid comparand for argument {index}: {reason}")]
    InvalidComparand { index: usize, reason: String },
    #[error("sudo policy cannot be attached to a session validator")]
    SudoPolicyOnSession,
}

/// Errors while decoding call data against a declared function ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallDecodeError {
    #[error("call data shorter than a selector")]
    MissingSelector,
    #[error("selector does not match the declared function")]
    SelectorMismatch,
    #[error("call data truncated")]
    Truncated,
    #[error("argument {index} is not a valid word for its type")]
    DirtyWord { index: usize },
    #[error("argument {index} has an out-of-bounds offset")]
    BadOffset { index: usize },
}

/// Why a policy refused a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("no policy attached")]
    NoPolicies,
    #[error("no permission for selector {selector} on {target}")]
    NoMatchingPermission { target: Address, selector: FixedBytes<4> },
    #[error("argument {argument} failed {condition} (permission {permission})")]
    ConditionFailed { permission: usize, argument: usize, condition: ParamCondition },
    #[error("value {value} exceeds limit {limit}")]
    ValueLimitExceeded { value: U256, limit: U256 },
    #[error("MALFORMED_CALL: {0}")]
    MalformedCall(CallDecodeError),
}

/// Errors during approval artifact decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("artifact is not valid base64: {0}")]
    Encoding(String),
    #[error("artifact truncated")]
    Truncated,
    #[error("trailing bytes after artifact body")]
    TrailingBytes,
    #[error("unknown tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

/// Errors surfaced by the lifecycle manager, the approval codec and the gateway.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("policy denied: {0}")]
    PolicyDenied(DenyReason),
    #[error("runtime signer {actual} does not match session identity {expected}")]
    SignerMismatch { expected: Address, actual: Address },
    #[error("unsupported artifact version: {0}")]
    VersionMismatch(String),
    #[error("malformed approval artifact: {0}")]
    MalformedArtifact(#[from] DecodeError),
    #[error("approval signature does not recover to owner {owner}")]
    InvalidApproval { owner: Address },
    #[error("fee sponsorship unavailable: {0}")]
    SponsorshipUnavailable(String),
    #[error("session validator is not installed")]
    ValidatorNotInstalled,
    #[error("a regular validator is already installed")]
    ValidatorAlreadyInstalled,
    #[error("session install {0} has not resolved yet")]
    InstallPending(String),
    #[error("the sudo validator cannot be uninstalled")]
    CannotUninstallSudo,
    #[error("validator kind does not fit the {0} role")]
    RoleMismatch(ValidatorRole),
    #[error("session expired at {valid_until}")]
    SessionExpired { valid_until: u64 },
    #[error("no live signer for the {0} validator")]
    MissingSigner(ValidatorRole),
    #[error("operation batch is empty")]
    EmptyBatch,
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("timed out waiting for operation {0}")]
    NetworkTimeout(String),
    #[error("operation reverted: {0}")]
    Reverted(String),
    #[error("operation rejected by broadcaster: {0}")]
    Rejected(String),
    #[error("ledger read failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("broadcaster failure: {0}")]
    Broadcast(String),
    #[error(transparent)]
    Signing(#[from] SignerError),
}

impl SessionError {
    /// Transient failures worth retrying with backoff. Everything else needs a new
    /// artifact, a new policy, or a new operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::SponsorshipUnavailable(_)
            | SessionError::NetworkTimeout(_)
            | SessionError::InstallPending(_)
            | SessionError::Broadcast(_) => true,
            SessionError::Ledger(err) => err.is_transient(),
            _ => false,
        }
    }
}
