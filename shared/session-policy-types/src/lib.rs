//! Shared types for call-policy permissions and ledger reads.
//!
//! Both the owner process and the agent process link this crate; it carries no
//! signing or network code of its own.

pub mod conditions;
pub mod ledger;

pub use conditions::{
    ArgumentCondition, CallPolicyVersion, Comparand, ParamCondition, ParamType, UnknownCondition,
    UnknownParamType,
};
pub use ledger::{LedgerClient, LedgerError, LedgerQuery, LedgerValue};
