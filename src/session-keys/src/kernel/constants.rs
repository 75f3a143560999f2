//! Kernel constants mirrored from Kernel (ERC-7579 / Kernel v3) and ERC-4337.

use alloy_primitives::{address, Address};

// Kernel v3 validation types (first byte of a `ValidationId`).
pub const VALIDATION_TYPE_ROOT: u8 = 0x00;
pub const VALIDATION_TYPE_PERMISSION: u8 = 0x02;

// Kernel v3 validation modes (first byte of the nonce key).
pub const VALIDATION_MODE_DEFAULT: u8 = 0x00;

// ERC-7579 execution modes: call type byte.
pub const CALLTYPE_SINGLE: u8 = 0x00;
pub const CALLTYPE_BATCH: u8 = 0x01;

/// Kernel's "no hook" sentinel for `ValidationConfig.hook`.
pub const HOOK_NOT_REQUIRED: Address = address!("0000000000000000000000000000000000000001");

/// Canonical ERC-4337 v0.7 EntryPoint.
pub const ENTRY_POINT_V07: Address = address!("0000000071727De22E5E9d8BAf0edAc6f37da032");
