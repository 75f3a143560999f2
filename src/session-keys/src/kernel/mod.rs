//! Kernel (ERC-7579 / Kernel v3) compatibility shims.
//!
//! Keeps call encodings, nonce keys and identifiers aligned with Kernel v3 while the
//! session logic stays elsewhere.

pub mod constants;
pub mod interfaces;
pub mod types;

pub use types::{EntryPointVersion, KernelVersion, PermissionId, ValidationId};
