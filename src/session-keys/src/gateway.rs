//! Execution gateway: turns a batch of calls into a signed, sponsored ERC-4337 operation
//! and tracks it to a terminal receipt.

use core::fmt;
use std::{future::Future, sync::Arc, time::Duration};

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use session_policy_types::LedgerClient;

use crate::{
    account::{Account, ValidatorRole},
    errors::{Result, SessionError},
    kernel::{interfaces::PackedUserOperation, ValidationId},
    policy::{Call, Verdict},
    signer::{EcdsaSignature, Signer},
    utils::kernel::{encode_execute, nonce_key, pack_u128_pair, user_op_hash},
};

pub const DEFAULT_CALL_GAS_LIMIT: u128 = 500_000;
pub const DEFAULT_VERIFICATION_GAS_LIMIT: u128 = 300_000;
pub const DEFAULT_PRE_VERIFICATION_GAS: u128 = 60_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeQuote {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasLimits {
    pub call_gas_limit: u128,
    pub verification_gas_limit: u128,
    pub pre_verification_gas: u128,
}

impl Default for GasLimits {
    fn default() -> Self {
        Self {
            call_gas_limit: DEFAULT_CALL_GAS_LIMIT,
            verification_gas_limit: DEFAULT_VERIFICATION_GAS_LIMIT,
            pre_verification_gas: DEFAULT_PRE_VERIFICATION_GAS,
        }
    }
}

/// What the sponsor sees: everything but the paymaster fields and the signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedOperation {
    pub sender: Address,
    pub nonce: U256,
    pub call_data: Bytes,
    pub fees: FeeQuote,
    pub gas: GasLimits,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SponsorshipData {
    pub paymaster_and_data: Bytes,
    /// Limits estimated by the sponsor; they replace the defaults.
    pub gas: GasLimits,
}

/// A signed, sponsored operation ready for the broadcaster.
#[derive(Clone, Debug)]
pub struct Operation {
    pub calls: Vec<Call>,
    pub unsigned: UnsignedOperation,
    pub sponsorship: SponsorshipData,
    pub signature: EcdsaSignature,
}

impl Operation {
    pub fn to_packed(&self) -> PackedUserOperation {
        build_packed(&self.unsigned, &self.sponsorship, Bytes::copy_from_slice(self.signature.as_bytes()))
    }
}

fn build_packed(unsigned: &UnsignedOperation, sponsorship: &SponsorshipData, signature: Bytes) -> PackedUserOperation {
    let gas = sponsorship.gas;
    PackedUserOperation {
        sender: unsigned.sender,
        nonce: unsigned.nonce,
        initCode: Bytes::new(),
        callData: unsigned.call_data.clone(),
        accountGasLimits: pack_u128_pair(gas.verification_gas_limit, gas.call_gas_limit),
        preVerificationGas: U256::from(gas.pre_verification_gas),
        gasFees: pack_u128_pair(
            unsigned.fees.max_priority_fee_per_gas,
            unsigned.fees.max_fee_per_gas,
        ),
        paymasterAndData: sponsorship.paymaster_and_data.clone(),
        signature,
    }
}

/// Identifies a submitted operation by its user operation hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    pub hash: B256,
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub hash: B256,
    pub success: bool,
    pub block_number: u64,
    pub revert_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    /// Refused before inclusion (bad signature, stale nonce, ...).
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
}

impl From<BroadcastError> for SessionError {
    fn from(err: BroadcastError) -> Self {
        match err {
            BroadcastError::Rejected(reason) => SessionError::Rejected(reason),
            BroadcastError::Transport(reason) => SessionError::Broadcast(reason),
            BroadcastError::Timeout => SessionError::NetworkTimeout("broadcaster request".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SponsorshipError {
    #[error("sponsorship denied: {0}")]
    Denied(String),
    #[error("sponsor unreachable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SponsorshipService: Send + Sync {
    async fn sponsor(&self, op: &UnsignedOperation) -> core::result::Result<SponsorshipData, SponsorshipError>;
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn fee_quote(&self) -> core::result::Result<FeeQuote, BroadcastError>;

    async fn submit(&self, op: PackedUserOperation) -> core::result::Result<OperationHandle, BroadcastError>;

    /// `None` while the operation is pending.
    async fn receipt(&self, handle: &OperationHandle) -> core::result::Result<Option<Receipt>, BroadcastError>;
}

/// Exponential backoff for [`Gateway::send_with_retry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

pub(crate) fn unix_now() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

#[derive(Clone)]
pub struct Gateway {
    ledger: Arc<dyn LedgerClient>,
    sponsor: Arc<dyn SponsorshipService>,
    broadcaster: Arc<dyn Broadcaster>,
    poll_interval: Duration,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("chain_id", &self.ledger.chain_id())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        sponsor: Arc<dyn SponsorshipService>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self { ledger, sponsor, broadcaster, poll_interval: Duration::from_millis(500) }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    /// Validate, sign and hand `calls` to the broadcaster. Returns once accepted; use
    /// [`Gateway::await_receipt`] for the outcome.
    pub async fn submit(&self, account: &Account, role: ValidatorRole, calls: Vec<Call>) -> Result<OperationHandle> {
        if calls.is_empty() {
            return Err(SessionError::EmptyBatch);
        }

        let (validation_id, signer) = self.authorize(account, role, &calls).await?;

        let key = nonce_key(validation_id);
        let nonce = self
            .ledger
            .nonce(account.entry_point().address(), account.address(), key)
            .await?;
        let call_data = encode_execute(&calls);

        let fees = self.broadcaster.fee_quote().await?;
        let unsigned = UnsignedOperation {
            sender: account.address(),
            nonce,
            call_data,
            fees,
            gas: GasLimits::default(),
        };
        let sponsorship = self.sponsor.sponsor(&unsigned).await.map_err(|e| {
            warn!(account = %account.address(), error = %e, "sponsorship failed");
            SessionError::SponsorshipUnavailable(e.to_string())
        })?;

        let unsigned_packed = build_packed(&unsigned, &sponsorship, Bytes::new());
        let hash = user_op_hash(&unsigned_packed, account.entry_point().address(), account.chain_id());
        let signature = signer.sign_message_hash(hash)?;
        let operation = Operation { calls, unsigned, sponsorship, signature };

        let handle = self.broadcaster.submit(operation.to_packed()).await?;
        info!(
            account = %account.address(),
            %role,
            calls = operation.calls.len(),
            nonce = %operation.unsigned.nonce,
            op = %handle,
            "operation submitted"
        );
        Ok(handle)
    }

    /// Steps that can refuse before the network sees anything.
    async fn authorize(
        &self,
        account: &Account,
        role: ValidatorRole,
        calls: &[Call],
    ) -> Result<(ValidationId, Arc<dyn Signer>)> {
        match role {
            ValidatorRole::Sudo => {
                let master = account.sudo();
                let signer = master.signer().cloned().ok_or(SessionError::MissingSigner(role))?;
                Ok((master.validation_id(), signer))
            }
            ValidatorRole::Regular => {
                let session = account.regular().ok_or(SessionError::ValidatorNotInstalled)?;
                let signer = session.signer().cloned().ok_or(SessionError::MissingSigner(role))?;

                if session.is_expired(unix_now()) {
                    return Err(SessionError::SessionExpired {
                        valid_until: session.valid_until().unwrap_or_default(),
                    });
                }
                let validation_id = session.validation_id();
                if !self.ledger.is_validator_installed(account.address(), validation_id).await? {
                    debug!(account = %account.address(), vid = %validation_id, "session validator not on ledger");
                    return Err(SessionError::ValidatorNotInstalled);
                }
                for call in calls {
                    if let Verdict::Deny(reason) = session.evaluate(call) {
                        debug!(to = %call.target, %reason, "call denied by policy");
                        return Err(SessionError::PolicyDenied(reason));
                    }
                }
                Ok((validation_id, signer))
            }
        }
    }

    /// Poll until the operation reaches a terminal status or `timeout` elapses.
    ///
    /// Giving up (or dropping this future) does not cancel the operation.
    pub async fn await_receipt(&self, handle: &OperationHandle, timeout: Duration) -> Result<Receipt> {
        let receipt = tokio::time::timeout(timeout, self.poll_receipt(handle))
            .await
            .map_err(|_| {
                warn!(op = %handle, ?timeout, "gave up waiting for receipt");
                SessionError::NetworkTimeout(handle.to_string())
            })??;

        if !receipt.success {
            let reason = receipt.revert_reason.clone().unwrap_or_else(|| "execution reverted".into());
            warn!(op = %handle, %reason, "operation reverted");
            return Err(SessionError::Reverted(reason));
        }
        info!(op = %handle, block = receipt.block_number, "operation included");
        Ok(receipt)
    }

    /// Current status of a submitted operation, without waiting.
    pub async fn receipt(&self, handle: &OperationHandle) -> Result<Option<Receipt>> {
        Ok(self.broadcaster.receipt(handle).await?)
    }

    async fn poll_receipt(&self, handle: &OperationHandle) -> Result<Receipt> {
        loop {
            if let Some(receipt) = self.broadcaster.receipt(handle).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Submit and wait for the receipt. `timeout` bounds the whole round trip, including
    /// the nonce read, fee quote and sponsorship.
    pub async fn send(
        &self,
        account: &Account,
        role: ValidatorRole,
        calls: Vec<Call>,
        timeout: Duration,
    ) -> Result<Receipt> {
        within(timeout, "send", async {
            let handle = self.submit(account, role, calls).await?;
            self.await_receipt(&handle, timeout).await
        })
        .await
    }

    /// [`Gateway::send`], retrying transient failures.
    ///
    /// A retry after a receipt timeout builds a fresh operation; if the first one lands
    /// later, the retry fails on its nonce.
    pub async fn send_with_retry(
        &self,
        account: &Account,
        role: ValidatorRole,
        calls: Vec<Call>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Receipt> {
        let mut attempt = 1;
        loop {
            match self.send(account, role, calls.clone(), timeout).await {
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(attempt, ?delay, error = %err, "retrying operation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

/// Run `task` under a single deadline. Expiry maps to [`SessionError::NetworkTimeout`].
pub(crate) async fn within<T>(
    timeout: Duration,
    operation: &'static str,
    task: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, task).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(operation, ?timeout, "deadline elapsed");
            Err(SessionError::NetworkTimeout(operation.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
        assert_eq!(retry.backoff(64), Duration::from_millis(500));
    }

    #[test]
    fn broadcast_errors_map_to_session_errors() {
        assert!(matches!(
            SessionError::from(BroadcastError::Rejected("nonce".into())),
            SessionError::Rejected(_)
        ));
        assert!(SessionError::from(BroadcastError::Transport("reset".into())).is_retryable());
        assert!(SessionError::from(BroadcastError::Timeout).is_retryable());
    }

    #[test]
    fn packed_operation_layout() {
        let unsigned = UnsignedOperation {
            sender: Address::repeat_byte(1),
            nonce: U256::from(3u8),
            call_data: Bytes::from(vec![1, 2, 3]),
            fees: FeeQuote { max_fee_per_gas: 20, max_priority_fee_per_gas: 2 },
            gas: GasLimits::default(),
        };
        let sponsorship = SponsorshipData { paymaster_and_data: Bytes::from(vec![9]), gas: GasLimits::default() };
        let packed = build_packed(&unsigned, &sponsorship, Bytes::new());
        assert_eq!(packed.gasFees, pack_u128_pair(2, 20));
        assert_eq!(
            packed.accountGasLimits,
            pack_u128_pair(DEFAULT_VERIFICATION_GAS_LIMIT, DEFAULT_CALL_GAS_LIMIT)
        );
        assert_eq!(packed.preVerificationGas, U256::from(DEFAULT_PRE_VERIFICATION_GAS));
    }
}
