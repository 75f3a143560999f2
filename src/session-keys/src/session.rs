//! Session lifecycle.
//!
//! The owner side ([`OwnerSessions`]) proposes, approves (installs) and revokes sessions
//! through the sudo validator. The agent side ([`AgentSession`]) rebuilds its view from an
//! approval artifact and executes calls through the regular validator. The two sides share
//! nothing but the ledger and the artifact.

use std::{sync::Arc, time::Duration};

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    account::{Account, SessionValidator, Validator, ValidatorRole},
    approval::{self, ApprovalArtifact},
    errors::{DenyReason, Result, SessionError},
    gateway::{unix_now, within, Gateway, OperationHandle, Receipt},
    kernel::ValidationId,
    policy::{Call, Policy, Verdict},
    signer::Signer,
    utils::kernel::{encode_install_validation, encode_uninstall_validation},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unconfigured,
    SessionProposed,
    SessionApproved,
    SessionActive,
    Revoked,
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Revoked | SessionState::Expired)
    }

    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unconfigured, SessionProposed)
                | (SessionProposed, SessionApproved)
                | (SessionApproved, SessionActive)
                | (SessionApproved | SessionActive, Revoked | Expired)
        )
    }
}

fn transition(state: &mut SessionState, next: SessionState) -> Result<()> {
    if !state.can_become(next) {
        return Err(SessionError::InvalidTransition { from: *state, to: next });
    }
    info!(from = ?*state, to = ?next, "session state change");
    *state = next;
    Ok(())
}

/// The owner's record of one session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    state: SessionState,
    validator: SessionValidator,
    artifact: Option<ApprovalArtifact>,
    install_op: Option<OperationHandle>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn validator(&self) -> &SessionValidator {
        &self.validator
    }

    pub fn validation_id(&self) -> ValidationId {
        self.validator.validation_id()
    }

    /// Present once the session is approved.
    pub fn artifact(&self) -> Option<&ApprovalArtifact> {
        self.artifact.as_ref()
    }

    pub fn install_op(&self) -> Option<&OperationHandle> {
        self.install_op.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked(Receipt),
    /// Neither the ledger nor the local model had the validator; nothing was submitted.
    AlreadyRevoked,
}

/// An install whose approval gave up before seeing the receipt.
#[derive(Clone, Debug)]
struct PendingInstall {
    validator: SessionValidator,
    op: OperationHandle,
}

struct OwnerState {
    account: Account,
    pending: Vec<PendingInstall>,
}

/// Owner-side session management for one account.
pub struct OwnerSessions {
    state: Mutex<OwnerState>,
    gateway: Gateway,
}

impl OwnerSessions {
    pub fn new(account: Account, gateway: Gateway) -> Result<Self> {
        if account.sudo().signer().is_none() {
            return Err(SessionError::MissingSigner(ValidatorRole::Sudo));
        }
        Ok(Self { state: Mutex::new(OwnerState { account, pending: Vec::new() }), gateway })
    }

    /// Snapshot of the current account model.
    pub async fn account(&self) -> Account {
        self.state.lock().await.account.clone()
    }

    pub fn propose(
        &self,
        session: Address,
        policies: Vec<Policy>,
        valid_until: Option<u64>,
    ) -> Result<SessionHandle> {
        let validator = SessionValidator::new(session, policies, valid_until)?;
        let mut state = SessionState::Unconfigured;
        transition(&mut state, SessionState::SessionProposed)?;
        info!(%session, permission_id = %validator.permission_id(), "session proposed");
        Ok(SessionHandle { state, validator, artifact: None, install_op: None })
    }

    /// Install the session validator on the account and produce its artifact.
    ///
    /// `timeout` bounds the whole call. A handle that timed out keeps its install
    /// operation; approving it again waits on that operation, or adopts the validator if
    /// the ledger already has it, instead of installing twice. While an install is
    /// unresolved no other session can be approved.
    pub async fn approve(&self, handle: &mut SessionHandle, timeout: Duration) -> Result<ApprovalArtifact> {
        if handle.state != SessionState::SessionProposed {
            return Err(SessionError::InvalidTransition {
                from: handle.state,
                to: SessionState::SessionApproved,
            });
        }
        within(timeout, "session install", self.install(handle, timeout)).await
    }

    async fn install(&self, handle: &mut SessionHandle, timeout: Duration) -> Result<ApprovalArtifact> {
        let mut owner = self.state.lock().await;
        let validation_id = handle.validation_id();
        let address = owner.account.address();

        if let Some(op) = handle.install_op {
            match self.gateway.await_receipt(&op, timeout).await {
                Ok(_) => {}
                Err(SessionError::Reverted(reason)) => {
                    warn!(%op, %reason, "earlier session install reverted");
                    owner.pending.retain(|p| p.op != op);
                    handle.install_op = None;
                }
                Err(err) => return Err(err),
            }
        }

        // The ledger decides; an earlier install may have landed and been revoked since.
        let landed = self.gateway.ledger().is_validator_installed(address, validation_id).await?;
        if !landed {
            self.settle_pending(&mut owner).await?;
            // Refuses while the model holds another regular validator.
            owner.account.install_validator(
                Validator::Session(handle.validator.clone()),
                ValidatorRole::Regular,
            )?;

            let validation_nonce = self.gateway.ledger().validation_nonce(address).await?;
            let install = Call::new(
                address,
                encode_install_validation(validation_id, validation_nonce, handle.validator.install_data()),
            );
            let op = self.gateway.submit(&owner.account, ValidatorRole::Sudo, vec![install]).await?;
            handle.install_op = Some(op);
            owner.pending.push(PendingInstall { validator: handle.validator.clone(), op });

            if let Err(err) = self.gateway.await_receipt(&op, timeout).await {
                if matches!(err, SessionError::Reverted(_)) {
                    owner.pending.retain(|p| p.op != op);
                    handle.install_op = None;
                }
                return Err(err);
            }
        }

        owner.pending.retain(|p| p.validator.validation_id() != validation_id);
        owner.account = owner.account.install_validator(
            Validator::Session(handle.validator.clone()),
            ValidatorRole::Regular,
        )?;
        let artifact = approval::serialize(&owner.account, &handle.validator)?;
        transition(&mut handle.state, SessionState::SessionApproved)?;
        info!(
            account = %address,
            session = %handle.validator.session(),
            "session installed"
        );
        handle.artifact = Some(artifact.clone());
        Ok(artifact)
    }

    /// Resolve installs left behind by timed-out approvals. One still in flight blocks new
    /// installs; one that landed is adopted into the model.
    async fn settle_pending(&self, owner: &mut OwnerState) -> Result<()> {
        let address = owner.account.address();
        for pending in owner.pending.clone() {
            let validation_id = pending.validator.validation_id();
            if self.gateway.receipt(&pending.op).await?.is_none() {
                warn!(op = %pending.op, vid = %validation_id, "earlier session install still in flight");
                return Err(SessionError::InstallPending(pending.op.to_string()));
            }
            let installed = self
                .gateway
                .ledger()
                .is_validator_installed(address, validation_id)
                .await?;
            owner.pending.retain(|p| p.op != pending.op);
            if installed {
                info!(vid = %validation_id, "adopting session install that landed late");
                owner.account = owner
                    .account
                    .install_validator(Validator::Session(pending.validator), ValidatorRole::Regular)?;
                return Err(SessionError::ValidatorAlreadyInstalled);
            }
        }
        Ok(())
    }

    /// Uninstall a session validator. Safe to repeat. `timeout` bounds the whole call.
    pub async fn revoke(&self, validation_id: ValidationId, timeout: Duration) -> Result<RevokeOutcome> {
        within(timeout, "session uninstall", self.uninstall(validation_id, timeout)).await
    }

    async fn uninstall(&self, validation_id: ValidationId, timeout: Duration) -> Result<RevokeOutcome> {
        let mut owner = self.state.lock().await;
        if owner.account.sudo().validation_id() == validation_id {
            return Err(SessionError::CannotUninstallSudo);
        }

        let address = owner.account.address();
        let in_model = owner.account.has_validator(validation_id);
        let on_ledger = self
            .gateway
            .ledger()
            .is_validator_installed(address, validation_id)
            .await?;
        if !on_ledger {
            let pending = owner.pending.iter().find(|p| p.validator.validation_id() == validation_id).cloned();
            if let Some(pending) = pending {
                if self.gateway.receipt(&pending.op).await?.is_none() {
                    return Err(SessionError::InstallPending(pending.op.to_string()));
                }
                owner.pending.retain(|p| p.op != pending.op);
                if self.gateway.ledger().is_validator_installed(address, validation_id).await? {
                    return self.send_uninstall(&mut owner, validation_id, in_model, timeout).await;
                }
            }
            if in_model {
                owner.account = owner.account.uninstall_validator(validation_id)?;
            }
            info!(vid = %validation_id, "session already revoked");
            return Ok(RevokeOutcome::AlreadyRevoked);
        }
        self.send_uninstall(&mut owner, validation_id, in_model, timeout).await
    }

    async fn send_uninstall(
        &self,
        owner: &mut OwnerState,
        validation_id: ValidationId,
        in_model: bool,
        timeout: Duration,
    ) -> Result<RevokeOutcome> {
        let address = owner.account.address();
        let uninstall = Call::new(address, encode_uninstall_validation(validation_id));
        let receipt = self
            .gateway
            .send(&owner.account, ValidatorRole::Sudo, vec![uninstall], timeout)
            .await?;
        owner.pending.retain(|p| p.validator.validation_id() != validation_id);
        if in_model {
            owner.account = owner.account.uninstall_validator(validation_id)?;
        }
        info!(account = %address, vid = %validation_id, "session revoked");
        Ok(RevokeOutcome::Revoked(receipt))
    }

    /// [`OwnerSessions::revoke`] for a handle, moving it to `Revoked`.
    pub async fn revoke_session(&self, handle: &mut SessionHandle, timeout: Duration) -> Result<RevokeOutcome> {
        if handle.state == SessionState::Revoked {
            return self.revoke(handle.validation_id(), timeout).await;
        }
        if !handle.state.can_become(SessionState::Revoked) {
            return Err(SessionError::InvalidTransition { from: handle.state, to: SessionState::Revoked });
        }
        let outcome = self.revoke(handle.validation_id(), timeout).await?;
        transition(&mut handle.state, SessionState::Revoked)?;
        Ok(outcome)
    }
}

/// Agent-side session, rebuilt from an approval artifact.
pub struct AgentSession {
    account: Account,
    gateway: Gateway,
    state: SessionState,
}

impl AgentSession {
    pub fn activate(artifact: &ApprovalArtifact, signer: Arc<dyn Signer>, gateway: Gateway) -> Result<Self> {
        let account = approval::deserialize(artifact, signer)?;
        let session = account.regular().ok_or(SessionError::ValidatorNotInstalled)?;
        if session.is_expired(unix_now()) {
            return Err(SessionError::SessionExpired {
                valid_until: session.valid_until().unwrap_or_default(),
            });
        }
        info!(account = %account.address(), session = %session.session(), "session activated");
        Ok(Self { account, gateway, state: SessionState::SessionActive })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn session(&self) -> Option<&SessionValidator> {
        self.account.regular()
    }

    /// Local policy check without touching the network.
    pub fn check(&self, call: &Call) -> Verdict {
        match self.account.regular() {
            Some(session) => session.evaluate(call),
            None => Verdict::Deny(DenyReason::NoPolicies),
        }
    }

    pub async fn execute(&mut self, calls: Vec<Call>, timeout: Duration) -> Result<Receipt> {
        match self.state {
            SessionState::SessionActive => {}
            SessionState::Revoked => return Err(SessionError::ValidatorNotInstalled),
            SessionState::Expired => {
                let valid_until = self.session().and_then(SessionValidator::valid_until).unwrap_or_default();
                return Err(SessionError::SessionExpired { valid_until });
            }
            other => {
                return Err(SessionError::InvalidTransition { from: other, to: SessionState::SessionActive })
            }
        }

        let result = self
            .gateway
            .send(&self.account, ValidatorRole::Regular, calls, timeout)
            .await;
        match &result {
            Err(SessionError::ValidatorNotInstalled) => self.end(SessionState::Revoked),
            Err(SessionError::SessionExpired { .. }) => self.end(SessionState::Expired),
            _ => {}
        }
        result
    }

    /// Re-read installation status from the ledger.
    pub async fn refresh(&mut self) -> Result<SessionState> {
        if self.state != SessionState::SessionActive {
            return Ok(self.state);
        }
        let (expired, validation_id) = match self.account.regular() {
            Some(session) => (session.is_expired(unix_now()), session.validation_id()),
            None => return Ok(self.state),
        };
        if expired {
            self.end(SessionState::Expired);
        } else if !self
            .gateway
            .ledger()
            .is_validator_installed(self.account.address(), validation_id)
            .await?
        {
            self.end(SessionState::Revoked);
        }
        Ok(self.state)
    }

    fn end(&mut self, terminal: SessionState) {
        if !self.state.is_terminal() {
            info!(from = ?self.state, to = ?terminal, "agent session ended");
            self.state = terminal;
        }
    }
}
