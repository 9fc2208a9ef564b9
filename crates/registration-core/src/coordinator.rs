//! Registration coordinator: drives one registration mode through its
//! network and cryptographic steps.
//!
//! The coordinator records the step it is at and never moves past a
//! failed one, so a flow is re-enterable exactly where it stopped: a
//! network failure after the verification code was consumed server-side
//! resumes at attribute submission without burning a second code. Local
//! identity changes happen in a single write transaction at the finalize
//! step; everything before it leaves the device state untouched, and
//! everything after it is best effort.

use crate::attributes::build_account_attributes;
use crate::config::Config;
use crate::deps::{
    ChangeNumberRequest, KeyBackupState, PreKeyService, ProfileKeySource, RegistrationService,
    StorageSyncService, VerificationTransport, VerifiedAccount,
};
use crate::error::RegistrationError;
use crate::manager::AccountManager;
use crate::mode::RegistrationMode;
use crate::types::{DeviceKind, E164, PendingVerification, PRIMARY_DEVICE_ID};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

/// External collaborators the coordinator drives.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub manager: Arc<AccountManager>,
    pub service: Arc<dyn RegistrationService>,
    pub pre_keys: Arc<dyn PreKeyService>,
    pub storage_sync: Arc<dyn StorageSyncService>,
    pub key_backup: Arc<dyn KeyBackupState>,
    pub profile: Arc<dyn ProfileKeySource>,
}

/// Where the flow currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ObtainVerification,
    ConfirmVerification,
    BuildAndSendAttributes,
    ProvisionKeys,
    FinalizeLocal,
    PostRegistrationSync,
    Complete,
}

impl Step {
    fn describe(self) -> &'static str {
        match self {
            Step::ObtainVerification => "obtain-verification",
            Step::ConfirmVerification => "confirm-verification",
            Step::BuildAndSendAttributes => "build-and-send-attributes",
            Step::ProvisionKeys => "provision-keys",
            Step::FinalizeLocal => "finalize-local",
            Step::PostRegistrationSync => "post-registration-sync",
            Step::Complete => "complete",
        }
    }
}

/// Drives exactly one [`RegistrationMode`] to completion or well-defined
/// failure, without corrupting account state on partial progress.
pub struct RegistrationCoordinator {
    mode: RegistrationMode,
    deps: CoordinatorDeps,
    config: Config,
    step: Step,
    target_e164: Option<E164>,
    verified: Option<VerifiedAccount>,
}

impl RegistrationCoordinator {
    /// Select a mode. Linking flows already hold a provisioning code, so
    /// they start at confirmation; every other mode starts by obtaining a
    /// verification code.
    ///
    /// # Panics
    ///
    /// Panics if asked to change numbers from a linked device; only the
    /// primary may originate a number change.
    pub fn new(mode: RegistrationMode, deps: CoordinatorDeps, config: Config) -> Self {
        if let RegistrationMode::ChangingNumber { device_id, .. } = &mode {
            if *device_id != PRIMARY_DEVICE_ID {
                panic!("number changes may only originate from the primary device");
            }
        }
        let step = Self::initial_step(&mode);
        info!(mode = mode.describe(), "registration flow selected");
        Self {
            mode,
            deps,
            config,
            step,
            target_e164: None,
            verified: None,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn mode(&self) -> &RegistrationMode {
        &self.mode
    }

    /// Ask the service to deliver a verification code for `e164` (the
    /// number being registered, or the new number of a number change).
    ///
    /// On failure the flow stays at this step with the specific error
    /// surfaced; nothing is retried silently.
    #[instrument(skip(self, captcha_token), fields(mode = self.mode.describe()))]
    pub async fn request_verification(
        &mut self,
        e164: E164,
        transport: VerificationTransport,
        captcha_token: Option<&str>,
    ) -> Result<(), RegistrationError> {
        self.require_step(Step::ObtainVerification)?;

        let e164 = match &self.mode {
            RegistrationMode::ReRegistering { e164: known, .. } if *known != e164 => {
                // Re-registration is the same number by definition.
                return Err(RegistrationError::WrongAccount);
            }
            RegistrationMode::LinkingSecondary { .. } => {
                unreachable!("linking flows never request verification codes")
            }
            _ => e164,
        };

        Self::bounded(
            "verification request",
            self.config.timeouts.verification_request,
            self.deps
                .service
                .request_verification_code(&e164, transport, captcha_token),
        )
        .await?;

        // Identity queries made while the code is in flight see the
        // candidate number.
        self.deps
            .manager
            .set_pending_verification(PendingVerification::Number { e164: e164.clone() });
        self.target_e164 = Some(e164);
        self.step = Step::ConfirmVerification;
        Ok(())
    }

    /// Submit the user-entered code. On acceptance the remaining steps run
    /// to completion; a failure partway leaves the flow re-enterable at
    /// the failed step via [`resume`](Self::resume).
    #[instrument(skip(self, code), fields(mode = self.mode.describe()))]
    pub async fn submit_verification_code(&mut self, code: &str) -> Result<(), RegistrationError> {
        self.require_step(Step::ConfirmVerification)?;

        // Linking confirms with a provisioning code, not a user-entered
        // one, and never holds a target number at this step.
        if matches!(self.mode, RegistrationMode::LinkingSecondary { .. }) {
            return Err(RegistrationError::InvalidStep {
                expected: "complete-provisioning",
                actual: self.step.describe(),
            });
        }

        let e164 = match self.target_e164.clone() {
            Some(e164) => e164,
            None => unreachable!("confirm step reached without a target number"),
        };

        let limit = self.config.timeouts.network_step;
        let verified = match &self.mode {
            RegistrationMode::Registering => {
                Self::bounded(
                    "code confirmation",
                    limit,
                    self.deps.service.confirm_verification_code(&e164, code, None),
                )
                .await?
            }
            RegistrationMode::ReRegistering { aci, .. } => {
                let reglock = self.reglock_token();
                let verified = Self::bounded(
                    "code confirmation",
                    limit,
                    self.deps
                        .service
                        .confirm_verification_code(&e164, code, reglock.as_deref()),
                )
                .await?;
                if verified.aci != *aci {
                    warn!("re-registration verified a different account, aborting");
                    return Err(self.abort_wrong_account());
                }
                verified
            }
            RegistrationMode::ChangingNumber {
                old_auth,
                aci,
                linked_device_ids,
                ..
            } => {
                let request = ChangeNumberRequest {
                    new_e164: e164.clone(),
                    verification_code: code.to_string(),
                    reglock_token: self.reglock_token(),
                    linked_device_ids: linked_device_ids.clone(),
                };
                let verified = Self::bounded(
                    "number change",
                    limit,
                    self.deps.service.change_number(&request, old_auth),
                )
                .await?;
                if verified.aci != *aci {
                    warn!("number change answered for a different account, aborting");
                    return Err(self.abort_wrong_account());
                }
                verified
            }
            RegistrationMode::LinkingSecondary { .. } => unreachable!("rejected above"),
        };

        self.accept_verified(e164, verified);
        self.advance().await
    }

    /// Complete a secondary-device link using the provisioning code held
    /// by the mode. The reconciliation against the predicted identifiers
    /// is a hard failure: a mismatch means a different underlying account
    /// than the one provisioned.
    #[instrument(skip(self), fields(mode = self.mode.describe()))]
    pub async fn complete_provisioning(&mut self, e164: E164) -> Result<(), RegistrationError> {
        self.require_step(Step::ConfirmVerification)?;

        let (provisioning_code, expected_aci, predicted_pni, device_name) = match &self.mode {
            RegistrationMode::LinkingSecondary {
                provisioning_code,
                expected_aci,
                predicted_pni,
                encrypted_device_name,
            } => (
                provisioning_code.clone(),
                *expected_aci,
                *predicted_pni,
                encrypted_device_name.clone(),
            ),
            _ => {
                return Err(RegistrationError::InvalidStep {
                    expected: "submit-verification-code",
                    actual: self.step.describe(),
                })
            }
        };

        let verified = Self::bounded(
            "provisioning confirmation",
            self.config.timeouts.network_step,
            self.deps
                .service
                .confirm_provisioning(&provisioning_code, device_name.as_deref()),
        )
        .await?;

        if verified.aci != expected_aci {
            warn!("provisioning answered for a different account, aborting");
            return Err(self.abort_wrong_account());
        }
        if let Some(predicted) = predicted_pni {
            if verified.pni != predicted {
                warn!("provisioned PNI differs from prediction, aborting");
                return Err(self.abort_wrong_account());
            }
        }

        self.accept_verified(e164, verified);
        self.advance().await
    }

    /// Re-enter the flow at the step it failed at. Only meaningful once
    /// verification has been confirmed; before that, restarting from
    /// [`request_verification`](Self::request_verification) is safe
    /// because no state was consumed.
    pub async fn resume(&mut self) -> Result<(), RegistrationError> {
        match self.step {
            Step::BuildAndSendAttributes
            | Step::ProvisionKeys
            | Step::FinalizeLocal
            | Step::PostRegistrationSync => self.advance().await,
            other => Err(RegistrationError::InvalidStep {
                expected: "a post-confirmation step",
                actual: other.describe(),
            }),
        }
    }

    /// Re-run the best-effort restore/sync after a completed flow.
    pub async fn retry_post_registration_sync(&mut self) -> Result<(), RegistrationError> {
        self.require_step(Step::Complete)?;
        self.post_registration_sync().await;
        Ok(())
    }

    /// Abandon the attempt: drop the verification overlay so identity
    /// queries stop answering with the candidate values, and return to the
    /// mode's starting step. State already committed by a finished flow is
    /// untouched.
    pub fn abandon(&mut self) {
        info!(mode = self.mode.describe(), "registration flow abandoned");
        self.deps.manager.clear_pending_verification();
        self.target_e164 = None;
        self.verified = None;
        self.step = Self::initial_step(&self.mode);
    }

    /// A cross-account answer aborts the flow outright; nothing of it may
    /// keep shadowing identity queries.
    fn abort_wrong_account(&mut self) -> RegistrationError {
        self.abandon();
        RegistrationError::WrongAccount
    }

    fn initial_step(mode: &RegistrationMode) -> Step {
        match mode {
            // Linking flows already hold a provisioning code.
            RegistrationMode::LinkingSecondary { .. } => Step::ConfirmVerification,
            _ => Step::ObtainVerification,
        }
    }

    async fn bounded<T>(
        what: &'static str,
        limit: Duration,
        fut: impl Future<Output = Result<T, RegistrationError>>,
    ) -> Result<T, RegistrationError> {
        match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RegistrationError::Timeout(what)),
        }
    }

    fn accept_verified(&mut self, e164: E164, verified: VerifiedAccount) {
        info!(aci = %verified.aci, device_id = verified.device_id, "verification confirmed");
        self.deps
            .manager
            .set_pending_verification(PendingVerification::Identity {
                e164: e164.clone(),
                aci: verified.aci,
                pni: verified.pni,
            });
        self.target_e164 = Some(e164);
        self.verified = Some(verified);
        self.step = Step::BuildAndSendAttributes;
    }

    async fn advance(&mut self) -> Result<(), RegistrationError> {
        loop {
            match self.step {
                Step::BuildAndSendAttributes => self.build_and_send_attributes().await?,
                Step::ProvisionKeys => self.provision_keys().await?,
                Step::FinalizeLocal => self.finalize_local()?,
                Step::PostRegistrationSync => self.post_registration_sync().await,
                Step::Complete => return Ok(()),
                other => {
                    return Err(RegistrationError::InvalidStep {
                        expected: "a post-confirmation step",
                        actual: other.describe(),
                    })
                }
            }
        }
    }

    /// Attributes must reach the server before any dependent key upload,
    /// so the session can authorize the key material.
    async fn build_and_send_attributes(&mut self) -> Result<(), RegistrationError> {
        let verified = self.verified_account();
        let device_kind = DeviceKind::from_device_id(verified.device_id);
        let device_name = match &self.mode {
            RegistrationMode::LinkingSecondary {
                encrypted_device_name,
                ..
            } => encrypted_device_name.clone(),
            _ => None,
        };

        // The transaction is closed before the network call; it only
        // assembles the payload.
        let manager = self.deps.manager.clone();
        let attributes = manager.store().write(|tx| {
            build_account_attributes(
                tx,
                &manager,
                device_kind,
                device_name.as_deref(),
                self.deps.key_backup.as_ref(),
                self.deps.profile.as_ref(),
                &self.config.features,
            )
        })?;

        let auth = verified.auth();
        Self::bounded(
            "attribute submission",
            self.config.timeouts.network_step,
            self.deps.service.update_account_attributes(&attributes, &auth),
        )
        .await?;
        self.step = Step::ProvisionKeys;
        Ok(())
    }

    async fn provision_keys(&mut self) -> Result<(), RegistrationError> {
        let verified = self.verified_account();
        let auth = verified.auth();
        Self::bounded(
            "key provisioning",
            self.config.timeouts.network_step,
            self.deps
                .pre_keys
                .create_registration_pre_keys(verified.aci, verified.pni, &auth),
        )
        .await?;
        self.step = Step::FinalizeLocal;
        Ok(())
    }

    /// Commit the new identity in one write transaction. Registration is
    /// successful once this returns; later failures never roll it back.
    fn finalize_local(&mut self) -> Result<(), RegistrationError> {
        let verified = self.verified_account();
        let manager = self.deps.manager.clone();

        match &self.mode {
            RegistrationMode::ChangingNumber { .. } => {
                let e164 = match self.target_e164.clone() {
                    Some(e164) => e164,
                    None => unreachable!("finalize reached without a target number"),
                };
                manager.store().write(|tx| {
                    manager.update_local_phone_number(&e164, verified.aci, verified.pni, tx)?;
                    manager.set_stored_server_auth_token(
                        &verified.auth_token,
                        verified.device_id,
                        tx,
                    )
                })?;
                manager.clear_pending_verification();
            }
            _ => {
                manager.store().write(|tx| {
                    manager.did_register(&verified.auth_token, verified.device_id, tx)
                })?;
            }
        }

        info!(step = Step::FinalizeLocal.describe(), "local identity committed");
        self.step = Step::PostRegistrationSync;
        Ok(())
    }

    /// Best effort: failures are logged and do not affect the committed
    /// registration. Retried only on explicit request.
    async fn post_registration_sync(&mut self) {
        self.step = Step::Complete;

        match timeout(
            self.config.timeouts.storage_restore,
            self.deps.storage_sync.restore_from_service(),
        )
        .await
        {
            Ok(Ok(())) => info!("storage service restore finished"),
            Ok(Err(e)) => warn!("storage service restore failed: {e}"),
            Err(_) => warn!("storage service restore timed out"),
        }

        match timeout(
            self.config.timeouts.initial_sync,
            self.deps.storage_sync.sync_contacts_and_groups(),
        )
        .await
        {
            Ok(Ok(())) => info!("initial contact/group sync finished"),
            Ok(Err(e)) => warn!("initial contact/group sync failed: {e}"),
            Err(_) => warn!("initial contact/group sync timed out"),
        }
    }

    fn reglock_token(&self) -> Option<String> {
        if self.deps.key_backup.is_v2_reglock_enabled() {
            self.deps.key_backup.reglock_token()
        } else {
            None
        }
    }

    fn require_step(&self, expected: Step) -> Result<(), RegistrationError> {
        if self.step == expected {
            Ok(())
        } else {
            Err(RegistrationError::InvalidStep {
                expected: expected.describe(),
                actual: self.step.describe(),
            })
        }
    }

    /// # Panics
    ///
    /// Steps past confirmation always have a verified account; reaching
    /// one without it is a bug in the step machine itself.
    fn verified_account(&self) -> VerifiedAccount {
        match &self.verified {
            Some(v) => v.clone(),
            None => panic!("step {} reached without a verified account", self.step.describe()),
        }
    }
}

impl VerifiedAccount {
    fn auth(&self) -> crate::types::AccountAuth {
        crate::types::AccountAuth::for_device(self.aci, self.device_id, self.auth_token.clone())
    }
}
