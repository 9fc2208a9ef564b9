//! Account manager: cache plus sole mutation authority for local identity.

use crate::deps::RegistrationCleanup;
use crate::events::{AccountEvent, AccountEvents};
use crate::state::{keys, AccountState, ACCOUNT_COLLECTION};
use crate::types::{Aci, E164, Pni, PendingVerification};
use account_store::{KeyValueStore, StoreError, StoreRead, WriteTransaction};
use chrono::Utc;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Registration ids are 14-bit values; zero is reserved.
const MAX_REGISTRATION_ID: u32 = 0x3FFF;

#[derive(Default)]
struct CacheSlot {
    /// Latest loaded snapshot. `None` until first load, and again after a
    /// cross-process write discards it.
    state: Option<Arc<AccountState>>,
    /// In-flight verification overlay; never persisted.
    pending: Option<PendingVerification>,
}

/// Single source of truth for "who are we".
///
/// Owns the lock-protected cached [`AccountState`] and serializes every
/// identity mutation. The cache lock is only ever taken for in-memory
/// work; it is never held while a storage transaction is opened, so the
/// lock order store-then-cache is the same everywhere.
///
/// Mutating operations stage their writes on the supplied transaction and
/// install the transaction's view into the cache through a commit effect:
/// the install happens at commit, still inside the exclusive section, so
/// readers unblocked afterwards observe the new value immediately, while a
/// rolled-back transaction leaves the cache on the committed state. Event
/// publication is deferred to post-commit completions, so observers are
/// never notified of data that is not yet durable.
pub struct AccountManager {
    store: KeyValueStore,
    events: AccountEvents,
    cleanup: Arc<dyn RegistrationCleanup>,
    cache: Arc<Mutex<CacheSlot>>,
}

impl AccountManager {
    pub fn new(
        store: KeyValueStore,
        events: AccountEvents,
        cleanup: Arc<dyn RegistrationCleanup>,
    ) -> Self {
        Self {
            store,
            events,
            cleanup,
            cache: Arc::new(Mutex::new(CacheSlot::default())),
        }
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    pub fn events(&self) -> &AccountEvents {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, CacheSlot> {
        lock_slot(&self.cache)
    }

    // ---- Reads ----------------------------------------------------------

    /// Current account state, as seen through any in-flight verification
    /// overlay. Loads and caches from the transaction on a cache miss.
    pub fn current_state(&self, tx: &impl StoreRead) -> Arc<AccountState> {
        let (cached, pending) = {
            let slot = self.lock();
            (slot.state.clone(), slot.pending.clone())
        };

        let state = match cached {
            Some(state) => state,
            None => {
                // Load outside the lock; the caller already holds the
                // transaction.
                let loaded = Arc::new(AccountState::load(tx));
                let mut slot = self.lock();
                slot.state = Some(loaded.clone());
                loaded
            }
        };

        match pending {
            Some(ref pending) => Arc::new(state.shadowed_by(pending)),
            None => state,
        }
    }

    /// Current state without a caller-supplied transaction. Answers from
    /// cache when possible; otherwise opens its own read transaction
    /// (never while holding the cache lock).
    pub fn current_state_sneaky(&self) -> Arc<AccountState> {
        {
            let slot = self.lock();
            if let Some(ref state) = slot.state {
                return match slot.pending {
                    Some(ref pending) => Arc::new(state.shadowed_by(pending)),
                    None => state.clone(),
                };
            }
        }
        self.store.read(|tx| self.current_state(tx))
    }

    /// Discard the cached snapshot after an external (cross-process)
    /// write. The next read reloads from the store.
    pub fn invalidate_cached_state(&self) {
        debug!("discarding cached account state");
        self.lock().state = None;
    }

    // ---- Verification overlay -------------------------------------------

    pub fn pending_verification(&self) -> Option<PendingVerification> {
        self.lock().pending.clone()
    }

    pub fn set_pending_verification(&self, pending: PendingVerification) {
        debug!(e164 = %pending.e164(), "setting pending verification overlay");
        self.lock().pending = Some(pending);
    }

    /// Drop an abandoned attempt's overlay.
    pub fn clear_pending_verification(&self) {
        self.lock().pending = None;
    }

    // ---- Identity mutations ---------------------------------------------

    /// Persist the identity triple. Clears any deregistered/re-registering
    /// markers: storing an identity means this device is that account.
    ///
    /// Must be called inside a write transaction; publishes
    /// `LocalNumberChanged` after it commits.
    pub fn store_local_identity(
        &self,
        e164: &E164,
        aci: Aci,
        pni: Pni,
        tx: &mut WriteTransaction,
    ) -> Result<(), StoreError> {
        info!(e164 = %e164, aci = %aci, "storing local identity");
        tx.set(ACCOUNT_COLLECTION, keys::LOCAL_PHONE_NUMBER, e164)?;
        tx.set(ACCOUNT_COLLECTION, keys::LOCAL_ACI, &aci)?;
        tx.set(ACCOUNT_COLLECTION, keys::LOCAL_PNI, &pni)?;
        tx.set(ACCOUNT_COLLECTION, keys::IS_DEREGISTERED, &false)?;
        tx.remove(ACCOUNT_COLLECTION, keys::REREGISTRATION_PHONE_NUMBER);
        tx.remove(ACCOUNT_COLLECTION, keys::REREGISTRATION_ACI);
        if !tx.contains(ACCOUNT_COLLECTION, keys::REGISTERED_AT) {
            tx.set(ACCOUNT_COLLECTION, keys::REGISTERED_AT, &Utc::now())?;
        }

        self.reload_cache(tx);
        let events = self.events.clone();
        tx.add_completion(move || events.publish(AccountEvent::LocalNumberChanged));
        Ok(())
    }

    /// Finalize a verified registration: fold the awaiting-verification
    /// identity into the persisted snapshot and clear the overlay.
    ///
    /// # Panics
    ///
    /// Panics if no server-confirmed verification is pending. That is a
    /// bug in the calling flow, not a recoverable error: there is nothing
    /// coherent to register.
    pub fn did_register(
        &self,
        auth_token: &str,
        device_id: u32,
        tx: &mut WriteTransaction,
    ) -> Result<(), StoreError> {
        let (e164, aci, pni) = match self.pending_verification() {
            Some(PendingVerification::Identity { e164, aci, pni }) => (e164, aci, pni),
            other => panic!(
                "did_register without a confirmed pending verification (overlay: {other:?})"
            ),
        };

        self.store_local_identity(&e164, aci, pni, tx)?;
        tx.set(ACCOUNT_COLLECTION, keys::SERVER_AUTH_TOKEN, &auth_token)?;
        tx.set(ACCOUNT_COLLECTION, keys::DEVICE_ID, &device_id)?;

        // The overlay stops shadowing at the same commit that makes the
        // identity durable.
        let loaded = Arc::new(AccountState::load(tx));
        let cache = Arc::clone(&self.cache);
        tx.add_commit_effect(move || {
            let mut slot = lock_slot(&cache);
            slot.pending = None;
            slot.state = Some(loaded);
        });

        let events = self.events.clone();
        tx.add_completion(move || events.publish(AccountEvent::RegistrationStateChanged));
        Ok(())
    }

    /// Wipe local registration so the same number can be re-registered.
    ///
    /// Retains the previous number and ACI as re-registration parameters,
    /// delegates transient-data wiping to the cleanup collaborator, and
    /// clears payment state only if this device was not primary.
    ///
    /// # Panics
    ///
    /// Panics if the account was never registered; there is no identity to
    /// re-establish.
    pub fn reset_for_reregistration(&self, tx: &mut WriteTransaction) -> Result<(), StoreError> {
        let state = AccountState::load(tx);
        let (e164, aci) = match (state.local_phone_number.clone(), state.aci) {
            (Some(e164), Some(aci)) => (e164, aci),
            _ => panic!("reset_for_reregistration on a never-registered account"),
        };
        let was_primary = state.is_primary_device();

        info!(e164 = %e164, was_primary, "resetting for re-registration");

        tx.remove_collection(ACCOUNT_COLLECTION);
        tx.set(ACCOUNT_COLLECTION, keys::REREGISTRATION_PHONE_NUMBER, &e164)?;
        tx.set(ACCOUNT_COLLECTION, keys::REREGISTRATION_ACI, &aci)?;

        self.cleanup.wipe_transient_account_data(tx);
        if !was_primary {
            self.cleanup.clear_payment_state(tx);
        }

        self.reload_cache(tx);
        let events = self.events.clone();
        tx.add_completion(move || {
            events.publish(AccountEvent::RegistrationStateChanged);
            events.publish(AccountEvent::OnboardingStateChanged);
        });
        Ok(())
    }

    /// Commit a phone number change for an already-registered primary.
    ///
    /// # Panics
    ///
    /// Panics if the stored ACI differs from `aci`: a number change never
    /// changes which account this device belongs to.
    pub fn update_local_phone_number(
        &self,
        e164: &E164,
        aci: Aci,
        pni: Pni,
        tx: &mut WriteTransaction,
    ) -> Result<(), StoreError> {
        let state = AccountState::load(tx);
        if let Some(stored) = state.aci {
            if stored != aci {
                panic!("phone number change for a different ACI (stored {stored}, got {aci})");
            }
        }
        self.store_local_identity(e164, aci, pni, tx)
    }

    // ---- Narrow persisted-field setters ---------------------------------
    //
    // Each stages a cache install with the transaction so readers
    // unblocked after commit observe the new value immediately.

    pub fn set_is_onboarded(&self, value: bool, tx: &mut WriteTransaction) -> Result<(), StoreError> {
        tx.set(ACCOUNT_COLLECTION, keys::IS_ONBOARDED, &value)?;
        self.reload_cache(tx);
        let events = self.events.clone();
        tx.add_completion(move || events.publish(AccountEvent::OnboardingStateChanged));
        Ok(())
    }

    pub fn set_is_manual_message_fetch_enabled(
        &self,
        value: bool,
        tx: &mut WriteTransaction,
    ) -> Result<(), StoreError> {
        tx.set(
            ACCOUNT_COLLECTION,
            keys::IS_MANUAL_MESSAGE_FETCH_ENABLED,
            &value,
        )?;
        self.reload_cache(tx);
        Ok(())
    }

    pub fn set_stored_server_auth_token(
        &self,
        auth_token: &str,
        device_id: u32,
        tx: &mut WriteTransaction,
    ) -> Result<(), StoreError> {
        tx.set(ACCOUNT_COLLECTION, keys::SERVER_AUTH_TOKEN, &auth_token)?;
        tx.set(ACCOUNT_COLLECTION, keys::DEVICE_ID, &device_id)?;
        self.reload_cache(tx);
        Ok(())
    }

    /// Record the server's signal that this device's registration is no
    /// longer valid.
    pub fn set_is_deregistered(&self, value: bool, tx: &mut WriteTransaction) -> Result<(), StoreError> {
        let state = AccountState::load(tx);
        if state.is_deregistered == value {
            return Ok(());
        }
        if value {
            warn!("recording deregistration by the service");
        }
        tx.set(ACCOUNT_COLLECTION, keys::IS_DEREGISTERED, &value)?;
        self.reload_cache(tx);
        let events = self.events.clone();
        tx.add_completion(move || events.publish(AccountEvent::RegistrationStateChanged));
        Ok(())
    }

    pub fn set_is_transfer_in_progress(
        &self,
        value: bool,
        tx: &mut WriteTransaction,
    ) -> Result<(), StoreError> {
        tx.set(ACCOUNT_COLLECTION, keys::IS_TRANSFER_IN_PROGRESS, &value)?;
        self.reload_cache(tx);
        let events = self.events.clone();
        tx.add_completion(move || events.publish(AccountEvent::RegistrationStateChanged));
        Ok(())
    }

    pub fn set_was_transferred(&self, value: bool, tx: &mut WriteTransaction) -> Result<(), StoreError> {
        tx.set(ACCOUNT_COLLECTION, keys::WAS_TRANSFERRED, &value)?;
        self.reload_cache(tx);
        let events = self.events.clone();
        tx.add_completion(move || events.publish(AccountEvent::RegistrationStateChanged));
        Ok(())
    }

    pub fn set_registration_lock_mode(
        &self,
        mode: &crate::types::RegistrationLockMode,
        tx: &mut WriteTransaction,
    ) -> Result<(), StoreError> {
        tx.set(ACCOUNT_COLLECTION, keys::REGISTRATION_LOCK_MODE, mode)?;
        self.reload_cache(tx);
        Ok(())
    }

    pub fn set_is_discoverable_by_phone_number(
        &self,
        value: bool,
        tx: &mut WriteTransaction,
    ) -> Result<(), StoreError> {
        tx.set(
            ACCOUNT_COLLECTION,
            keys::IS_DISCOVERABLE_BY_PHONE_NUMBER,
            &value,
        )?;
        self.reload_cache(tx);
        Ok(())
    }

    /// Registration ids for both identifier namespaces, generated once and
    /// persisted on first use.
    pub fn get_or_generate_registration_ids(
        &self,
        tx: &mut WriteTransaction,
    ) -> Result<(u32, u32), StoreError> {
        let aci_id = self.get_or_generate_id(keys::REGISTRATION_ID, tx)?;
        let pni_id = self.get_or_generate_id(keys::PNI_REGISTRATION_ID, tx)?;
        Ok((aci_id, pni_id))
    }

    fn get_or_generate_id(&self, key: &str, tx: &mut WriteTransaction) -> Result<u32, StoreError> {
        if let Some(id) = tx.get::<u32>(ACCOUNT_COLLECTION, key) {
            return Ok(id);
        }
        let id = rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID);
        tx.set(ACCOUNT_COLLECTION, key, &id)?;
        self.reload_cache(tx);
        Ok(id)
    }

    /// Stage a cache install of the transaction's current view, applied
    /// at commit while the store's exclusive section is still held. A
    /// rollback drops the install along with the staged writes.
    fn reload_cache(&self, tx: &mut WriteTransaction) {
        let loaded = Arc::new(AccountState::load(tx));
        let cache = Arc::clone(&self.cache);
        tx.add_commit_effect(move || {
            lock_slot(&cache).state = Some(loaded);
        });
    }
}

fn lock_slot(cache: &Mutex<CacheSlot>) -> MutexGuard<'_, CacheSlot> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}
