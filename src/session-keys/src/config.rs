//! Process-boundary configuration.
//!
//! Values come from the environment (optionally seeded from a `.env` file). Anything missing
//! or malformed is a fatal [`ConfigError`] raised before the first network call.

use core::{fmt, str::FromStr};
use std::{sync::Arc, time::Duration};

use alloy_primitives::Address;

use crate::{
    errors::ConfigError,
    kernel::{EntryPointVersion, KernelVersion},
    signer::{LocalSigner, Signer},
};

pub const RPC_URL: &str = "RPC_URL";
pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
pub const TARGET_CONTRACT: &str = "TARGET_CONTRACT";
pub const CHAIN_ID: &str = "CHAIN_ID";
pub const ENTRY_POINT_VERSION: &str = "ENTRY_POINT_VERSION";
pub const KERNEL_VERSION: &str = "KERNEL_VERSION";
pub const RECEIPT_TIMEOUT_SECS: &str = "RECEIPT_TIMEOUT_SECS";
pub const RECEIPT_POLL_MS: &str = "RECEIPT_POLL_MS";

/// Sepolia.
pub const DEFAULT_CHAIN_ID: u64 = 11_155_111;

#[derive(Clone)]
pub struct Config {
    pub rpc_url: String,
    owner_key: LocalSigner,
    pub target_contract: Address,
    pub chain_id: u64,
    pub entry_point: EntryPointVersion,
    pub kernel: KernelVersion,
    pub receipt_timeout: Duration,
    pub receipt_poll: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("rpc_url", &self.rpc_url)
            .field("owner", &self.owner_key.address())
            .field("private_key", &"<redacted>")
            .field("target_contract", &self.target_contract)
            .field("chain_id", &self.chain_id)
            .field("entry_point", &self.entry_point)
            .field("kernel", &self.kernel)
            .field("receipt_timeout", &self.receipt_timeout)
            .field("receipt_poll", &self.receipt_poll)
            .finish()
    }
}

impl Config {
    /// Load from the process environment after applying `.env`, if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine; the variables may already be exported.
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rpc_url = required(&lookup, RPC_URL)?;
        if !(rpc_url.starts_with("http://") || rpc_url.starts_with("https://") || rpc_url.starts_with("ws")) {
            return Err(ConfigError::Invalid { field: RPC_URL, reason: "expected an http(s) or ws(s) URL".into() });
        }

        let owner_key = LocalSigner::from_hex(&required(&lookup, PRIVATE_KEY)?).map_err(|_| {
            ConfigError::Invalid { field: PRIVATE_KEY, reason: "expected a 32-byte hex secp256k1 key".into() }
        })?;

        let target_contract = parse_required(&lookup, TARGET_CONTRACT)?;
        let chain_id = parse_or(&lookup, CHAIN_ID, DEFAULT_CHAIN_ID)?;
        if chain_id == 0 {
            return Err(ConfigError::Invalid { field: CHAIN_ID, reason: "must be non-zero".into() });
        }
        let entry_point = parse_or(&lookup, ENTRY_POINT_VERSION, EntryPointVersion::V07)?;
        let kernel = parse_or(&lookup, KERNEL_VERSION, KernelVersion::V3_1)?;
        let receipt_timeout = Duration::from_secs(parse_or(&lookup, RECEIPT_TIMEOUT_SECS, 60u64)?);
        let receipt_poll = Duration::from_millis(parse_or(&lookup, RECEIPT_POLL_MS, 500u64)?);

        Ok(Self {
            rpc_url,
            owner_key,
            target_contract,
            chain_id,
            entry_point,
            kernel,
            receipt_timeout,
            receipt_poll,
        })
    }

    pub fn owner(&self) -> Address {
        self.owner_key.address()
    }

    pub fn owner_signer(&self) -> Arc<dyn Signer> {
        Arc::new(self.owner_key.clone())
    }
}

fn required<F>(lookup: &F, field: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(field) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::Missing(field)),
    }
}

fn parse_required<F, T>(lookup: &F, field: &'static str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = required(lookup, field)?;
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid { field, reason: e.to_string() })
}

fn parse_or<F, T>(lookup: &F, field: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(field) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid { field, reason: e.to_string() })
        }
        _ => Ok(default),
    }
}
