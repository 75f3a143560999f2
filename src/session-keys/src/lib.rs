//! Policy-scoped session keys for Kernel smart accounts.
//!
//! An owner account delegates narrowly scoped execution rights to an agent-held session key.
//! The owner proposes a session, installs its validator and hands the agent a compact
//! approval artifact; the agent rebuilds a signing-capable account from that artifact and
//! submits sponsored operations that must pass the session's call policies.

pub mod abi;
pub mod account;
pub mod approval;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod kernel;
pub mod memory;
pub mod policy;
pub mod session;
pub mod signer;
pub mod utils;

#[cfg(test)]
mod tests;

pub use abi::{AbiRegistry, FunctionAbi};
pub use account::{Account, MasterValidator, SessionValidator, Validator, ValidatorRole};
pub use approval::{ApprovalArtifact, DecodedApproval};
pub use config::Config;
pub use errors::{CallDecodeError, ConfigError, DecodeError, DenyReason, SessionError};
pub use gateway::{Broadcaster, Gateway, OperationHandle, Receipt, RetryPolicy, SponsorshipService};
pub use kernel::{EntryPointVersion, KernelVersion, PermissionId, ValidationId};
pub use memory::InMemoryChain;
pub use policy::{Call, CallPolicy, Permission, Policy, Verdict};
pub use session::{AgentSession, OwnerSessions, RevokeOutcome, SessionHandle, SessionState};
pub use signer::{LocalSigner, Signer};

pub use session_policy_types::{LedgerClient, ParamCondition, ParamType};
