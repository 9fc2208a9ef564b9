//! Immutable account state snapshot and its derived classification.

use crate::types::{
    Aci, E164, Pni, PendingVerification, RegistrationLockMode, ReregistrationParams,
    PRIMARY_DEVICE_ID,
};
use account_store::StoreRead;
use chrono::{DateTime, Utc};

/// The single collection all account identity fields live in. Key names
/// are on-disk schema and must not change across versions.
pub const ACCOUNT_COLLECTION: &str = "LocalAccount";

pub mod keys {
    pub const LOCAL_PHONE_NUMBER: &str = "localPhoneNumber";
    pub const LOCAL_ACI: &str = "localAci";
    pub const LOCAL_PNI: &str = "localPni";
    pub const DEVICE_ID: &str = "deviceId";
    pub const SERVER_AUTH_TOKEN: &str = "serverAuthToken";
    pub const REGISTERED_AT: &str = "registeredAt";
    pub const IS_ONBOARDED: &str = "isOnboarded";
    pub const IS_MANUAL_MESSAGE_FETCH_ENABLED: &str = "isManualMessageFetchEnabled";
    pub const IS_DEREGISTERED: &str = "isDeregistered";
    pub const IS_DISCOVERABLE_BY_PHONE_NUMBER: &str = "isDiscoverableByPhoneNumber";
    pub const REREGISTRATION_PHONE_NUMBER: &str = "reregistrationPhoneNumber";
    pub const REREGISTRATION_ACI: &str = "reregistrationAci";
    pub const IS_TRANSFER_IN_PROGRESS: &str = "isTransferInProgress";
    pub const WAS_TRANSFERRED: &str = "wasTransferred";
    pub const REGISTRATION_ID: &str = "registrationId";
    pub const PNI_REGISTRATION_ID: &str = "pniRegistrationId";
    pub const REGISTRATION_LOCK_MODE: &str = "registrationLockMode";
}

/// Everything this device knows about its own identity, loaded in one
/// read and never mutated in place. Mutations replace the whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub local_phone_number: Option<E164>,
    pub aci: Option<Aci>,
    pub pni: Option<Pni>,
    pub device_id: u32,
    pub server_auth_token: Option<String>,
    pub registered_at: Option<DateTime<Utc>>,
    pub is_onboarded: bool,
    pub is_manual_message_fetch_enabled: bool,
    pub is_deregistered: bool,
    pub is_discoverable_by_phone_number: bool,
    pub registration_lock_mode: RegistrationLockMode,
    pub reregistration_params: Option<ReregistrationParams>,
    pub is_transfer_in_progress: bool,
    pub was_transferred: bool,
}

/// Mutually exclusive reading of an account state. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    PendingBackupRestore,
    Reregistering,
    Deregistered,
    Registered,
}

impl AccountState {
    /// Load a snapshot from the account collection. Usable inside either
    /// transaction kind, so mutators can reload from their own staged view.
    pub fn load(tx: &impl StoreRead) -> Self {
        let reregistration_params = match (
            tx.get::<E164>(ACCOUNT_COLLECTION, keys::REREGISTRATION_PHONE_NUMBER),
            tx.get::<Aci>(ACCOUNT_COLLECTION, keys::REREGISTRATION_ACI),
        ) {
            (Some(e164), Some(aci)) => Some(ReregistrationParams { e164, aci }),
            _ => None,
        };

        Self {
            local_phone_number: tx.get(ACCOUNT_COLLECTION, keys::LOCAL_PHONE_NUMBER),
            aci: tx.get(ACCOUNT_COLLECTION, keys::LOCAL_ACI),
            pni: tx.get(ACCOUNT_COLLECTION, keys::LOCAL_PNI),
            device_id: tx
                .get(ACCOUNT_COLLECTION, keys::DEVICE_ID)
                .unwrap_or(PRIMARY_DEVICE_ID),
            server_auth_token: tx.get(ACCOUNT_COLLECTION, keys::SERVER_AUTH_TOKEN),
            registered_at: tx.get(ACCOUNT_COLLECTION, keys::REGISTERED_AT),
            is_onboarded: tx
                .get(ACCOUNT_COLLECTION, keys::IS_ONBOARDED)
                .unwrap_or(false),
            is_manual_message_fetch_enabled: tx
                .get(ACCOUNT_COLLECTION, keys::IS_MANUAL_MESSAGE_FETCH_ENABLED)
                .unwrap_or(false),
            is_deregistered: tx
                .get(ACCOUNT_COLLECTION, keys::IS_DEREGISTERED)
                .unwrap_or(false),
            is_discoverable_by_phone_number: tx
                .get(ACCOUNT_COLLECTION, keys::IS_DISCOVERABLE_BY_PHONE_NUMBER)
                .unwrap_or(true),
            registration_lock_mode: tx
                .get(ACCOUNT_COLLECTION, keys::REGISTRATION_LOCK_MODE)
                .unwrap_or(RegistrationLockMode::None),
            reregistration_params,
            is_transfer_in_progress: tx
                .get(ACCOUNT_COLLECTION, keys::IS_TRANSFER_IN_PROGRESS)
                .unwrap_or(false),
            was_transferred: tx
                .get(ACCOUNT_COLLECTION, keys::WAS_TRANSFERRED)
                .unwrap_or(false),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.local_phone_number.is_some() && self.aci.is_some()
    }

    pub fn is_primary_device(&self) -> bool {
        self.device_id == PRIMARY_DEVICE_ID
    }

    /// Classify this snapshot.
    ///
    /// Order matters: the transfer marker and the re-registration marker
    /// are specific stored facts and take priority over a plain
    /// `Registered` reading when both could apply.
    pub fn registration_state(&self) -> RegistrationState {
        if self.is_transfer_in_progress || self.was_transferred {
            RegistrationState::PendingBackupRestore
        } else if self.reregistration_params.is_some() {
            RegistrationState::Reregistering
        } else if self.is_deregistered && self.is_registered() {
            RegistrationState::Deregistered
        } else if self.is_registered() {
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        }
    }

    /// The view returned to callers while a verification attempt is in
    /// flight: overlay values shadow the stored identity. The stored
    /// snapshot itself is untouched.
    pub(crate) fn shadowed_by(&self, pending: &PendingVerification) -> AccountState {
        let mut view = self.clone();
        match pending {
            PendingVerification::Number { e164 } => {
                view.local_phone_number = Some(e164.clone());
            }
            PendingVerification::Identity { e164, aci, pni } => {
                view.local_phone_number = Some(e164.clone());
                view.aci = Some(*aci);
                view.pni = Some(*pni);
            }
        }
        view
    }
}
