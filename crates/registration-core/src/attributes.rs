//! Signed account attribute payload sent on registration-affecting calls.

use crate::config::FeaturesConfig;
use crate::deps::{KeyBackupState, ProfileKeySource};
use crate::manager::AccountManager;
use crate::state::AccountState;
use crate::types::DeviceKind;
use account_store::{StoreError, WriteTransaction};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Domain separator for deriving the recovery password from the master key.
const RECOVERY_PASSWORD_INFO: &[u8] = b"RegistrationRecoveryPassword";

/// The three mutually exclusive two-factor representations. Serialized
/// flattened into the attribute payload: `pin` for the legacy mode,
/// `registrationLock` for v2, nothing for none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwoFactorAuthMode {
    None,
    LegacyPin(String),
    V2(String),
}

impl Serialize for TwoFactorAuthMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            TwoFactorAuthMode::None => {}
            TwoFactorAuthMode::LegacyPin(pin) => map.serialize_entry("pin", pin)?,
            TwoFactorAuthMode::V2(token) => map.serialize_entry("registrationLock", token)?,
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub backup: bool,
}

/// Attribute payload for `updateAccountAttributes` and registration
/// confirmation calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAttributes {
    pub registration_id: u32,
    pub pni_registration_id: u32,
    pub fetches_messages: bool,
    /// Base64 key derived from the local profile key; gates unidentified
    /// delivery.
    pub unidentified_access_key: String,
    pub unrestricted_unidentified_access: bool,
    #[serde(flatten)]
    pub two_factor: TwoFactorAuthMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_password: Option<String>,
    /// Only present when the discoverability feature is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discoverable_by_phone_number: Option<bool>,
    /// Encrypted device name, base64. Secondary devices only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub capabilities: DeviceCapabilities,
}

/// Derive the two-factor representation for the payload.
///
/// Secondary devices never compute this; the server ignores it for them.
/// A v2 token wins whenever one is available and v2 is enabled. A legacy
/// PIN is used only if no master key has ever been backed up: v2
/// supersedes v1 even when a PIN is still cached locally.
pub fn two_factor_auth_mode(
    key_backup: &dyn KeyBackupState,
    device_kind: DeviceKind,
) -> TwoFactorAuthMode {
    if device_kind == DeviceKind::Secondary {
        return TwoFactorAuthMode::None;
    }
    if key_backup.is_v2_reglock_enabled() {
        if let Some(token) = key_backup.reglock_token() {
            return TwoFactorAuthMode::V2(token);
        }
    }
    if let Some(pin) = key_backup.local_pin_code() {
        if !key_backup.has_backed_up_master_key() {
            return TwoFactorAuthMode::LegacyPin(pin);
        }
    }
    TwoFactorAuthMode::None
}

/// Derive the unidentified-access key from the profile key: the AES-GCM
/// tag over an empty message under a zero nonce, which is a deterministic
/// function of the key.
///
/// # Panics
///
/// Panics if derivation fails. Unidentified delivery is a hard product
/// requirement; a failure here means the local cryptographic state is
/// corrupt and must not be silently tolerated.
pub fn derive_unidentified_access_key(profile_key: &[u8; 32]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(profile_key));
    let nonce = Nonce::from_slice(&[0u8; 12]);
    let tag = cipher
        .encrypt(nonce, b"".as_ref())
        .unwrap_or_else(|_| panic!("unidentified access key derivation failed"));
    debug_assert_eq!(tag.len(), 16);
    tag
}

fn derive_recovery_password(master_key: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(RECOVERY_PASSWORD_INFO);
    hasher.update(master_key);
    BASE64.encode(hasher.finalize())
}

/// Assemble the attribute payload from current state plus fresh
/// cryptographic material, inside a write transaction (registration ids
/// are generated and persisted on first use).
///
/// # Panics
///
/// Panics if no local profile key exists; see
/// [`derive_unidentified_access_key`].
pub fn build_account_attributes(
    tx: &mut WriteTransaction,
    manager: &AccountManager,
    device_kind: DeviceKind,
    encrypted_device_name: Option<&[u8]>,
    key_backup: &dyn KeyBackupState,
    profile: &dyn ProfileKeySource,
    features: &FeaturesConfig,
) -> Result<AccountAttributes, StoreError> {
    let (registration_id, pni_registration_id) = manager.get_or_generate_registration_ids(tx)?;
    let state = AccountState::load(tx);

    let profile_key = profile
        .local_profile_key()
        .unwrap_or_else(|| panic!("missing local profile key"));
    let unidentified_access_key = BASE64.encode(derive_unidentified_access_key(&profile_key));

    let two_factor = two_factor_auth_mode(key_backup, device_kind);
    let recovery_password = key_backup
        .master_key()
        .map(|mk| derive_recovery_password(&mk));

    let discoverable_by_phone_number = features
        .phone_number_discoverability
        .then_some(state.is_discoverable_by_phone_number);

    Ok(AccountAttributes {
        registration_id,
        pni_registration_id,
        fetches_messages: state.is_manual_message_fetch_enabled,
        unidentified_access_key,
        unrestricted_unidentified_access: features.unrestricted_unidentified_access,
        two_factor,
        recovery_password,
        discoverable_by_phone_number,
        name: encrypted_device_name.map(|n| BASE64.encode(n)),
        capabilities: DeviceCapabilities { backup: true },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeKeyBackup {
        reglock_token: Option<String>,
        v2_enabled: bool,
        backed_up: bool,
        pin: Option<String>,
        master_key: Option<[u8; 32]>,
    }

    impl Default for FakeKeyBackup {
        fn default() -> Self {
            Self {
                reglock_token: None,
                v2_enabled: false,
                backed_up: false,
                pin: None,
                master_key: None,
            }
        }
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

    #[test]
    fn v2_token_wins_over_cached_legacy_pin() {
        let kbs = FakeKeyBackup {
            reglock_token: Some("reglock-token".into()),
            v2_enabled: true,
            backed_up: true,
            pin: Some("1234".into()),
            ..Default::default()
        };
        assert_eq!(
            two_factor_auth_mode(&kbs, DeviceKind::Primary),
            TwoFactorAuthMode::V2("reglock-token".into())
        );
    }

    #[test]
    fn legacy_pin_used_only_without_master_key_backup() {
        let kbs = FakeKeyBackup {
            pin: Some("1234".into()),
            ..Default::default()
        };
        assert_eq!(
            two_factor_auth_mode(&kbs, DeviceKind::Primary),
            TwoFactorAuthMode::LegacyPin("1234".into())
        );

        let kbs = FakeKeyBackup {
            pin: Some("1234".into()),
            backed_up: true,
            ..Default::default()
        };
        assert_eq!(
            two_factor_auth_mode(&kbs, DeviceKind::Primary),
            TwoFactorAuthMode::None
        );
    }

    #[test]
    fn v2_disabled_falls_through_even_with_token() {
        let kbs = FakeKeyBackup {
            reglock_token: Some("reglock-token".into()),
            v2_enabled: false,
            backed_up: true,
            pin: Some("1234".into()),
            ..Default::default()
        };
        // Token present but v2 disabled; PIN cached but superseded.
        assert_eq!(
            two_factor_auth_mode(&kbs, DeviceKind::Primary),
            TwoFactorAuthMode::None
        );
    }

    #[test]
    fn no_two_factor_state_yields_none() {
        let kbs = FakeKeyBackup::default();
        assert_eq!(
            two_factor_auth_mode(&kbs, DeviceKind::Primary),
            TwoFactorAuthMode::None
        );
    }

    #[test]
    fn secondary_devices_always_get_none() {
        let kbs = FakeKeyBackup {
            reglock_token: Some("reglock-token".into()),
            v2_enabled: true,
            pin: Some("1234".into()),
            ..Default::default()
        };
        assert_eq!(
            two_factor_auth_mode(&kbs, DeviceKind::Secondary),
            TwoFactorAuthMode::None
        );
    }

    #[test]
    fn access_key_derivation_is_deterministic() {
        let key = [7u8; 32];
        let a = derive_unidentified_access_key(&key);
        let b = derive_unidentified_access_key(&key);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, derive_unidentified_access_key(&[8u8; 32]));
    }

    #[test]
    fn two_factor_serializes_flattened() {
        let attrs = AccountAttributes {
            registration_id: 123,
            pni_registration_id: 456,
            fetches_messages: false,
            unidentified_access_key: "abc=".into(),
            unrestricted_unidentified_access: false,
            two_factor: TwoFactorAuthMode::V2("token".into()),
            recovery_password: None,
            discoverable_by_phone_number: None,
            name: None,
            capabilities: DeviceCapabilities { backup: true },
        };
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(json["registrationLock"], "token");
        assert_eq!(json.get("pin"), None);
        assert_eq!(json.get("discoverableByPhoneNumber"), None);
        assert_eq!(json["registrationId"], 123);
        assert_eq!(json["capabilities"]["backup"], true);

        let attrs = AccountAttributes {
            two_factor: TwoFactorAuthMode::LegacyPin("1234".into()),
            ..attrs
        };
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(json["pin"], "1234");
        assert_eq!(json.get("registrationLock"), None);
    }
}
