//! Capability interfaces for the core's external collaborators.
//!
//! One plain trait per collaborator; production implementations live with
//! their subsystems (the HTTP registration service ships in this crate),
//! test doubles live with the tests.

use crate::attributes::AccountAttributes;
use crate::error::RegistrationError;
use crate::types::{AccountAuth, Aci, E164, Pni};
use account_store::WriteTransaction;
use async_trait::async_trait;

/// How the verification code should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTransport {
    Sms,
    Voice,
}

/// Canonical account identity the server returns once a verification code
/// or provisioning confirmation is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAccount {
    pub aci: Aci,
    pub pni: Pni,
    pub device_id: u32,
    pub auth_token: String,
}

/// Parameters for moving a primary's account to a new number.
#[derive(Debug, Clone)]
pub struct ChangeNumberRequest {
    pub new_e164: E164,
    pub verification_code: String,
    pub reglock_token: Option<String>,
    /// Every linked device must receive a PNI key rotation as part of the
    /// change; the server rejects the request if any is missing.
    pub linked_device_ids: Vec<u32>,
}

/// The registration-affecting service endpoints.
#[async_trait]
pub trait RegistrationService: Send + Sync {
    /// Ask the server to deliver a verification code.
    async fn request_verification_code(
        &self,
        e164: &E164,
        transport: VerificationTransport,
        captcha_token: Option<&str>,
    ) -> Result<(), RegistrationError>;

    /// Submit the user-entered code. On acceptance the server returns the
    /// canonical identifiers for the account that owns the number.
    async fn confirm_verification_code(
        &self,
        e164: &E164,
        code: &str,
        reglock_token: Option<&str>,
    ) -> Result<VerifiedAccount, RegistrationError>;

    /// Complete linking of this device to an existing account, using the
    /// code scanned from the primary's provisioning flow.
    async fn confirm_provisioning(
        &self,
        provisioning_code: &str,
        encrypted_device_name: Option<&[u8]>,
    ) -> Result<VerifiedAccount, RegistrationError>;

    /// Submit the signed attribute payload. Must succeed before any
    /// dependent key material can be authorized.
    async fn update_account_attributes(
        &self,
        attributes: &AccountAttributes,
        auth: &AccountAuth,
    ) -> Result<(), RegistrationError>;

    /// Move the account to a new number.
    async fn change_number(
        &self,
        request: &ChangeNumberRequest,
        auth: &AccountAuth,
    ) -> Result<VerifiedAccount, RegistrationError>;
}

/// Identity/pre-key provisioning, for both identifier namespaces.
#[async_trait]
pub trait PreKeyService: Send + Sync {
    async fn create_registration_pre_keys(
        &self,
        aci: Aci,
        pni: Pni,
        auth: &AccountAuth,
    ) -> Result<(), RegistrationError>;
}

/// Post-registration restore and initial sync. Best effort; failures do
/// not unwind a committed registration.
#[async_trait]
pub trait StorageSyncService: Send + Sync {
    async fn restore_from_service(&self) -> Result<(), RegistrationError>;
    async fn sync_contacts_and_groups(&self) -> Result<(), RegistrationError>;
}

/// Locally cached key-backup state. All reads are synchronous; the escrow
/// round-trips themselves belong to the key-backup subsystem.
pub trait KeyBackupState: Send + Sync {
    /// Registration-lock token derived from the escrowed master key.
    fn reglock_token(&self) -> Option<String>;

    /// Whether the user has registration lock v2 enabled.
    fn is_v2_reglock_enabled(&self) -> bool;

    /// Whether a master key has ever been backed up. Once one has, the
    /// legacy PIN path is dead even if a PIN is still cached.
    fn has_backed_up_master_key(&self) -> bool;

    /// Locally cached legacy PIN, if any.
    fn local_pin_code(&self) -> Option<String>;

    /// The unwrapped master key, if available locally.
    fn master_key(&self) -> Option<[u8; 32]>;
}

/// Source of the local profile key.
pub trait ProfileKeySource: Send + Sync {
    fn local_profile_key(&self) -> Option<[u8; 32]>;
}

/// Transient-state wiping hooks invoked during a re-registration reset.
/// Implementations stage their deletions on the same transaction so the
/// reset commits as one unit.
pub trait RegistrationCleanup: Send + Sync {
    /// Drop sessions, sender keys and cached service credentials.
    fn wipe_transient_account_data(&self, tx: &mut WriteTransaction);

    /// Drop payment state. Called only when the device was not primary;
    /// primaries keep payment state across re-registration.
    fn clear_payment_state(&self, tx: &mut WriteTransaction);
}

/// No-op cleanup for embeddings that keep nothing outside the account
/// collection.
pub struct NoopCleanup;

impl RegistrationCleanup for NoopCleanup {
    fn wipe_transient_account_data(&self, _tx: &mut WriteTransaction) {}
    fn clear_payment_state(&self, _tx: &mut WriteTransaction) {}
}
