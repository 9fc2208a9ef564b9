//! Recording fakes for the coordinator's external collaborators.

use async_trait::async_trait;
use registration_core::attributes::AccountAttributes;
use registration_core::deps::{
    ChangeNumberRequest, KeyBackupState, PreKeyService, ProfileKeySource, RegistrationService,
    StorageSyncService, VerificationTransport, VerifiedAccount,
};
use registration_core::error::RegistrationError;
use registration_core::types::{AccountAuth, Aci, E164, Pni};
use registration_core::{AccountEvents, AccountManager, Config, CoordinatorDeps};
use account_store::KeyValueStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn injected() -> RegistrationError {
    RegistrationError::NetworkFailure("injected failure".into())
}

/// Registration service double: serves a configured verified account and
/// counts every call, with one-shot failure injection per endpoint.
#[derive(Default)]
pub struct FakeRegistrationService {
    pub verified: Mutex<Option<VerifiedAccount>>,
    pub code_requests: AtomicUsize,
    pub code_confirms: AtomicUsize,
    pub provisioning_confirms: AtomicUsize,
    pub attribute_updates: AtomicUsize,
    pub change_requests: AtomicUsize,
    pub fail_next_code_request: AtomicBool,
    pub fail_next_attribute_update: AtomicBool,
    pub hang_confirms: AtomicBool,
    pub last_attributes: Mutex<Option<AccountAttributes>>,
    pub last_change_request: Mutex<Option<ChangeNumberRequest>>,
    pub last_reglock_token: Mutex<Option<String>>,
}

impl FakeRegistrationService {
    pub fn with_verified(verified: VerifiedAccount) -> Arc<Self> {
        let service = Self::default();
        *service.verified.lock().unwrap() = Some(verified);
        Arc::new(service)
    }

    fn verified_account(&self) -> VerifiedAccount {
        self.verified
            .lock()
            .unwrap()
            .clone()
            .expect("fake service has no verified account configured")
    }
}

#[async_trait]
impl RegistrationService for FakeRegistrationService {
    async fn request_verification_code(
        &self,
        _e164: &E164,
        _transport: VerificationTransport,
        _captcha_token: Option<&str>,
    ) -> Result<(), RegistrationError> {
        self.code_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_code_request.swap(false, Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }

    async fn confirm_verification_code(
        &self,
        _e164: &E164,
        _code: &str,
        reglock_token: Option<&str>,
    ) -> Result<VerifiedAccount, RegistrationError> {
        self.code_confirms.fetch_add(1, Ordering::SeqCst);
        *self.last_reglock_token.lock().unwrap() = reglock_token.map(str::to_string);
        if self.hang_confirms.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.verified_account())
    }

    async fn confirm_provisioning(
        &self,
        _provisioning_code: &str,
        _encrypted_device_name: Option<&[u8]>,
    ) -> Result<VerifiedAccount, RegistrationError> {
        self.provisioning_confirms.fetch_add(1, Ordering::SeqCst);
        Ok(self.verified_account())
    }

    async fn update_account_attributes(
        &self,
        attributes: &AccountAttributes,
        _auth: &AccountAuth,
    ) -> Result<(), RegistrationError> {
        self.attribute_updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_attribute_update.swap(false, Ordering::SeqCst) {
            return Err(injected());
        }
        *self.last_attributes.lock().unwrap() = Some(attributes.clone());
        Ok(())
    }

    async fn change_number(
        &self,
        request: &ChangeNumberRequest,
        _auth: &AccountAuth,
    ) -> Result<VerifiedAccount, RegistrationError> {
        self.change_requests.fetch_add(1, Ordering::SeqCst);
        *self.last_change_request.lock().unwrap() = Some(request.clone());
        Ok(self.verified_account())
    }
}

#[derive(Default)]
pub struct FakePreKeyService {
    pub calls: AtomicUsize,
    pub fail_next: AtomicBool,
}

#[async_trait]
impl PreKeyService for FakePreKeyService {
    async fn create_registration_pre_keys(
        &self,
        _aci: Aci,
        _pni: Pni,
        _auth: &AccountAuth,
    ) -> Result<(), RegistrationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStorageSync {
    pub restores: AtomicUsize,
    pub syncs: AtomicUsize,
    pub fail_restores: AtomicBool,
}

#[async_trait]
impl StorageSyncService for FakeStorageSync {
    async fn restore_from_service(&self) -> Result<(), RegistrationError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        if self.fail_restores.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }

    async fn sync_contacts_and_groups(&self) -> Result<(), RegistrationError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeKeyBackup {
    pub reglock_token: Option<String>,
    pub v2_enabled: bool,
    pub backed_up: bool,
    pub pin: Option<String>,
    pub master_key: Option<[u8; 32]>,
}

impl KeyBackupState for FakeKeyBackup {
    fn reglock_token(&self) -> Option<String> {
        self.reglock_token.clone()
    }
    fn is_v2_reglock_enabled(&self) -> bool {
        self.v2_enabled
    }
    fn has_backed_up_master_key(&self) -> bool {
        self.backed_up
    }
    fn local_pin_code(&self) -> Option<String> {
        self.pin.clone()
    }
    fn master_key(&self) -> Option<[u8; 32]> {
        self.master_key
    }
}

pub struct FakeProfile;

impl ProfileKeySource for FakeProfile {
    fn local_profile_key(&self) -> Option<[u8; 32]> {
        Some([3u8; 32])
    }
}

/// One harness per test: a fresh in-memory manager plus recording fakes.
pub struct Harness {
    pub manager: Arc<AccountManager>,
    pub service: Arc<FakeRegistrationService>,
    pub pre_keys: Arc<FakePreKeyService>,
    pub storage_sync: Arc<FakeStorageSync>,
}

impl Harness {
    pub fn new(verified: VerifiedAccount) -> Self {
        let manager = Arc::new(AccountManager::new(
            KeyValueStore::in_memory(),
            AccountEvents::new(),
            Arc::new(registration_core::deps::NoopCleanup),
        ));
        Self {
            manager,
            service: FakeRegistrationService::with_verified(verified),
            pre_keys: Arc::new(FakePreKeyService::default()),
            storage_sync: Arc::new(FakeStorageSync::default()),
        }
    }

    pub fn deps(&self) -> CoordinatorDeps {
        self.deps_with_key_backup(FakeKeyBackup::default())
    }

    pub fn deps_with_key_backup(&self, key_backup: FakeKeyBackup) -> CoordinatorDeps {
        CoordinatorDeps {
            manager: self.manager.clone(),
            service: self.service.clone(),
            pre_keys: self.pre_keys.clone(),
            storage_sync: self.storage_sync.clone(),
            key_backup: Arc::new(key_backup),
            profile: Arc::new(FakeProfile),
        }
    }

    pub fn config(&self) -> Config {
        Config::default()
    }
}

pub fn verified(device_id: u32) -> VerifiedAccount {
    VerifiedAccount {
        aci: Aci(Uuid::new_v4()),
        pni: Pni(Uuid::new_v4()),
        device_id,
        auth_token: "server-token".into(),
    }
}

pub fn e164(number: &str) -> E164 {
    E164::parse(number).unwrap()
}
