use alloy_primitives::{Address, FixedBytes, U256};
use async_trait::async_trait;

/// Errors during ledger reads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Used by partial providers that do not answer every query.
    #[error("ledger query not implemented")]
    NotImplemented,
    #[error("ledger read timed out")]
    Timeout,
    /// The underlying transport failed; the read may be retried.
    #[error("ledger transport failure: {0}")]
    Transport(String),
    /// Return data was malformed or of the wrong shape.
    #[error("malformed ledger response")]
    MalformedReturn,
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Timeout | LedgerError::Transport(_))
    }
}

/// Read-only queries the core issues against account and entry-point state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerQuery {
    /// EntryPoint `getNonce(sender, key)`; addressed to the entry point.
    Nonce { sender: Address, key: U256 },
    /// Whether a validation (Kernel `ValidationId`) is installed; addressed to the account.
    ValidatorInstalled { validation_id: FixedBytes<21> },
    /// Kernel `currentNonce()` used to configure new validations; addressed to the account.
    ValidationNonce,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerValue {
    Word(U256),
    Flag(bool),
}

/// Ledger client abstraction. The core never writes through it.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn read(&self, address: Address, query: LedgerQuery) -> Result<LedgerValue, LedgerError>;

    async fn nonce(
        &self,
        entry_point: Address,
        sender: Address,
        key: U256,
    ) -> Result<U256, LedgerError> {
        match self.read(entry_point, LedgerQuery::Nonce { sender, key }).await? {
            LedgerValue::Word(nonce) => Ok(nonce),
            LedgerValue::Flag(_) => Err(LedgerError::MalformedReturn),
        }
    }

    async fn is_validator_installed(
        &self,
        account: Address,
        validation_id: FixedBytes<21>,
    ) -> Result<bool, LedgerError> {
        match self
            .read(account, LedgerQuery::ValidatorInstalled { validation_id })
            .await?
        {
            LedgerValue::Flag(installed) => Ok(installed),
            LedgerValue::Word(_) => Err(LedgerError::MalformedReturn),
        }
    }

    async fn validation_nonce(&self, account: Address) -> Result<u32, LedgerError> {
        match self.read(account, LedgerQuery::ValidationNonce).await? {
            LedgerValue::Word(word) if word <= U256::from(u32::MAX) => Ok(word.to::<u32>()),
            _ => Err(LedgerError::MalformedReturn),
        }
    }
}
