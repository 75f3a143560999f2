//! In-memory ledger, paymaster and bundler.
//!
//! Simulates EIP-7702 Kernel accounts behind a v0.7 EntryPoint closely enough to exercise
//! the lifecycle end to end: signatures, nonces, installed validators, session expiry and
//! call policies are all enforced again at inclusion, in submission order.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolInterface;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use session_policy_types::{LedgerClient, LedgerError, LedgerQuery, LedgerValue};

use crate::{
    account::SessionValidator,
    gateway::{
        unix_now, BroadcastError, Broadcaster, FeeQuote, OperationHandle, Receipt, SponsorshipData,
        SponsorshipError, SponsorshipService, UnsignedOperation,
    },
    kernel::{
        constants::{ENTRY_POINT_V07, VALIDATION_TYPE_PERMISSION},
        interfaces::{IKernel::IKernelCalls, PackedUserOperation},
        ValidationId,
    },
    policy::{Call, Verdict},
    utils::{
        crypto::{eth_message_hash, recover_address},
        kernel::{decode_execute, root_validation_id, user_op_hash, validation_id_of_nonce},
    },
};

/// Placeholder paymaster address stamped into sponsored operations.
const SIMULATED_PAYMASTER: Address = Address::repeat_byte(0x9a);

#[derive(Clone, Debug, Default)]
struct AccountState {
    owner: Address,
    validations: HashMap<ValidationId, SessionValidator>,
    validation_nonce: u32,
    /// Next sequence number per 192-bit nonce key.
    nonces: HashMap<U256, u64>,
}

struct PendingOp {
    hash: B256,
    op: PackedUserOperation,
    ready_at: Instant,
}

struct ChainState {
    accounts: HashMap<Address, AccountState>,
    pending: VecDeque<PendingOp>,
    receipts: HashMap<B256, Receipt>,
    block_number: u64,
    executed: Vec<Call>,
    sponsorship_denied: bool,
    inclusion_delay: Duration,
    fees: FeeQuote,
}

pub struct InMemoryChain {
    chain_id: u64,
    entry_point: Address,
    state: Mutex<ChainState>,
}

impl InMemoryChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            entry_point: ENTRY_POINT_V07,
            state: Mutex::new(ChainState {
                accounts: HashMap::new(),
                pending: VecDeque::new(),
                receipts: HashMap::new(),
                block_number: 0,
                executed: Vec::new(),
                sponsorship_denied: false,
                inclusion_delay: Duration::ZERO,
                fees: FeeQuote { max_fee_per_gas: 2_000_000_000, max_priority_fee_per_gas: 1_000_000_000 },
            }),
        }
    }

    /// How long a submitted operation stays pending before a receipt poll includes it.
    pub fn with_inclusion_delay(self, delay: Duration) -> Self {
        self.set_inclusion_delay(delay);
        self
    }

    pub fn set_inclusion_delay(&self, delay: Duration) {
        self.state().inclusion_delay = delay;
    }

    pub fn set_sponsorship_denied(&self, denied: bool) {
        self.state().sponsorship_denied = denied;
    }

    pub fn set_fees(&self, fees: FeeQuote) {
        self.state().fees = fees;
    }

    /// Delegate `account` to Kernel with `owner` as root validator. For EIP-7702 accounts
    /// both are the same address.
    pub fn register_account(&self, account: Address, owner: Address) {
        self.state()
            .accounts
            .entry(account)
            .or_insert_with(|| AccountState { owner, ..AccountState::default() });
    }

    /// Include every pending operation now, regardless of the inclusion delay.
    pub fn mine(&self) -> usize {
        let mut state = self.state();
        let mut included = 0;
        while let Some(pending) = state.pending.pop_front() {
            self.include(&mut state, pending);
            included += 1;
        }
        included
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn block_number(&self) -> u64 {
        self.state().block_number
    }

    /// External calls executed so far, in inclusion order.
    pub fn executed_calls(&self) -> Vec<Call> {
        self.state().executed.clone()
    }

    pub fn installed_validations(&self, account: Address) -> Vec<ValidationId> {
        self.state()
            .accounts
            .get(&account)
            .map(|a| a.validations.keys().copied().collect())
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn include_ready(&self, state: &mut ChainState) {
        let now = Instant::now();
        while state.pending.front().is_some_and(|p| p.ready_at <= now) {
            if let Some(pending) = state.pending.pop_front() {
                self.include(state, pending);
            }
        }
    }

    fn include(&self, state: &mut ChainState, pending: PendingOp) {
        state.block_number += 1;
        let outcome = self.execute(state, &pending.op);
        let receipt = match outcome {
            Ok(()) => {
                info!(op = %pending.hash, block = state.block_number, "operation included");
                Receipt {
                    hash: pending.hash,
                    success: true,
                    block_number: state.block_number,
                    revert_reason: None,
                }
            }
            Err(reason) => {
                warn!(op = %pending.hash, %reason, "operation failed at inclusion");
                Receipt {
                    hash: pending.hash,
                    success: false,
                    block_number: state.block_number,
                    revert_reason: Some(reason),
                }
            }
        };
        state.receipts.insert(pending.hash, receipt);
    }

    /// Validate then execute one operation. Validation failures leave the nonce untouched.
    fn execute(&self, state: &mut ChainState, op: &PackedUserOperation) -> Result<(), String> {
        let account = state
            .accounts
            .get(&op.sender)
            .cloned()
            .ok_or_else(|| "AA20 account not deployed".to_string())?;

        let key = op.nonce >> 64;
        let sequence = (op.nonce & U256::from(u64::MAX)).to::<u64>();
        let expected = account.nonces.get(&key).copied().unwrap_or(0);
        if sequence != expected {
            return Err("AA25 invalid account nonce".into());
        }

        let validation_id = validation_id_of_nonce(op.nonce);
        let session = self.signer_for(&account, validation_id)?;
        let expected_signer = session.as_ref().map_or(account.owner, SessionValidator::session);

        let hash = user_op_hash(op, self.entry_point, self.chain_id);
        let signature = <[u8; 65]>::try_from(op.signature.as_ref())
            .map_err(|_| "AA24 signature error".to_string())?;
        match recover_address(eth_message_hash(hash), &signature) {
            Ok(recovered) if recovered == expected_signer => {}
            _ => return Err("AA24 signature error".into()),
        }

        let calls = decode_execute(&op.callData).map_err(|e| format!("unsupported call data: {e}"))?;
        if let Some(session) = &session {
            if session.is_expired(unix_now()) {
                return Err("AA22 expired".into());
            }
            for call in &calls {
                if let Verdict::Deny(reason) = session.evaluate(call) {
                    return Err(format!("policy denied: {reason}"));
                }
            }
        }

        // Validation passed: the nonce is consumed even if execution reverts.
        let mut next = account;
        next.nonces.insert(key, expected + 1);
        let mut executed = Vec::new();
        let mut staged = next.clone();
        let result = calls.iter().try_for_each(|call| {
            if call.target == op.sender {
                apply_self_call(&mut staged, &call.data)
            } else {
                executed.push(call.clone());
                Ok(())
            }
        });
        match result {
            Ok(()) => {
                state.accounts.insert(op.sender, staged);
                state.executed.extend(executed);
                Ok(())
            }
            Err(reason) => {
                state.accounts.insert(op.sender, next);
                Err(reason)
            }
        }
    }

    /// `None` for the root validator, the installed session otherwise.
    fn signer_for(
        &self,
        account: &AccountState,
        validation_id: ValidationId,
    ) -> Result<Option<SessionValidator>, String> {
        if validation_id == root_validation_id() {
            return Ok(None);
        }
        if validation_id[0] != VALIDATION_TYPE_PERMISSION {
            return Err("AA24 unsupported validation type".into());
        }
        account
            .validations
            .get(&validation_id)
            .cloned()
            .map(Some)
            .ok_or_else(|| "validator not installed".to_string())
    }
}

fn apply_self_call(account: &mut AccountState, data: &Bytes) -> Result<(), String> {
    let call = IKernelCalls::abi_decode(data, true).map_err(|_| "unknown self call".to_string())?;
    match call {
        IKernelCalls::installValidations(install) => {
            if install.vIds.len() != install.configs.len() || install.vIds.len() != install.validationData.len() {
                return Err("install length mismatch".into());
            }
            for ((vid, config), data) in install.vIds.iter().zip(&install.configs).zip(&install.validationData) {
                if account.validations.contains_key(vid) {
                    return Err("validator already installed".into());
                }
                if config.nonce < account.validation_nonce {
                    return Err("invalid validation nonce".into());
                }
                let session = SessionValidator::from_install_data(data)
                    .map_err(|e| format!("invalid install data: {e}"))?;
                if session.validation_id() != *vid {
                    return Err("validation id does not match install data".into());
                }
                account.validations.insert(*vid, session);
                account.validation_nonce = account.validation_nonce.saturating_add(1);
                debug!(%vid, "validator installed");
            }
            Ok(())
        }
        IKernelCalls::uninstallValidation(uninstall) => {
            if account.validations.remove(&uninstall.vId).is_some() {
                debug!(vid = %uninstall.vId, "validator uninstalled");
            }
            Ok(())
        }
        IKernelCalls::execute(_) => Err("nested execute".into()),
    }
}

#[async_trait]
impl LedgerClient for InMemoryChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn read(&self, address: Address, query: LedgerQuery) -> Result<LedgerValue, LedgerError> {
        let state = self.state();
        let value = match query {
            LedgerQuery::Nonce { sender, key } => {
                if address != self.entry_point {
                    return Err(LedgerError::MalformedReturn);
                }
                let sequence = state
                    .accounts
                    .get(&sender)
                    .and_then(|a| a.nonces.get(&key).copied())
                    .unwrap_or(0);
                LedgerValue::Word((key << 64) | U256::from(sequence))
            }
            LedgerQuery::ValidatorInstalled { validation_id } => {
                let installed = state.accounts.get(&address).is_some_and(|a| {
                    validation_id == root_validation_id() || a.validations.contains_key(&validation_id)
                });
                LedgerValue::Flag(installed)
            }
            LedgerQuery::ValidationNonce => LedgerValue::Word(U256::from(
                state.accounts.get(&address).map_or(0, |a| a.validation_nonce),
            )),
        };
        Ok(value)
    }
}

#[async_trait]
impl SponsorshipService for InMemoryChain {
    async fn sponsor(&self, op: &UnsignedOperation) -> Result<SponsorshipData, SponsorshipError> {
        if self.state().sponsorship_denied {
            return Err(SponsorshipError::Denied("paymaster policy rejected the operation".into()));
        }
        Ok(SponsorshipData {
            paymaster_and_data: Bytes::copy_from_slice(SIMULATED_PAYMASTER.as_slice()),
            gas: op.gas,
        })
    }
}

#[async_trait]
impl Broadcaster for InMemoryChain {
    async fn fee_quote(&self) -> Result<FeeQuote, BroadcastError> {
        Ok(self.state().fees)
    }

    async fn submit(&self, op: PackedUserOperation) -> Result<OperationHandle, BroadcastError> {
        let mut state = self.state();
        let Some(account) = state.accounts.get(&op.sender) else {
            return Err(BroadcastError::Rejected("AA20 account not deployed".into()));
        };
        let key = op.nonce >> 64;
        let sequence = (op.nonce & U256::from(u64::MAX)).to::<u64>();
        if sequence < account.nonces.get(&key).copied().unwrap_or(0) {
            return Err(BroadcastError::Rejected("AA25 invalid account nonce".into()));
        }

        let hash = user_op_hash(&op, self.entry_point, self.chain_id);
        if state.receipts.contains_key(&hash) || state.pending.iter().any(|p| p.hash == hash) {
            return Err(BroadcastError::Rejected("duplicate operation".into()));
        }
        let ready_at = Instant::now() + state.inclusion_delay;
        state.pending.push_back(PendingOp { hash, op, ready_at });
        debug!(op = %hash, pending = state.pending.len(), "operation queued");
        Ok(OperationHandle { hash })
    }

    async fn receipt(&self, handle: &OperationHandle) -> Result<Option<Receipt>, BroadcastError> {
        let mut state = self.state();
        self.include_ready(&mut state);
        if let Some(receipt) = state.receipts.get(&handle.hash) {
            return Ok(Some(receipt.clone()));
        }
        if state.pending.iter().any(|p| p.hash == handle.hash) {
            return Ok(None);
        }
        Err(BroadcastError::Rejected(format!("unknown operation {}", handle.hash)))
    }
}
