//! Registration mode descriptor.

use crate::types::{AccountAuth, Aci, E164, Pni};

/// Which of the mutually exclusive flows a coordinator drives, plus the
/// parameters each requires. Chosen once, before any network step.
#[derive(Debug, Clone)]
pub enum RegistrationMode {
    /// First-time registration of a primary device.
    Registering,

    /// Re-registering the same number after a reset. The server must
    /// return the same ACI; anything else is a different account.
    ReRegistering { e164: E164, aci: Aci },

    /// Linking this device to an existing primary account. The
    /// provisioning message predicts the account identifiers; the server's
    /// answer must agree.
    LinkingSecondary {
        provisioning_code: String,
        expected_aci: Aci,
        predicted_pni: Option<Pni>,
        encrypted_device_name: Option<Vec<u8>>,
    },

    /// Moving a primary's account to a new number. Only device id 1 may
    /// originate this.
    ChangingNumber {
        old_e164: E164,
        old_auth: AccountAuth,
        aci: Aci,
        device_id: u32,
        linked_device_ids: Vec<u32>,
    },
}

impl RegistrationMode {
    pub(crate) fn describe(&self) -> &'static str {
        match self {
            RegistrationMode::Registering => "registering",
            RegistrationMode::ReRegistering { .. } => "re-registering",
            RegistrationMode::LinkingSecondary { .. } => "linking-secondary",
            RegistrationMode::ChangingNumber { .. } => "changing-number",
        }
    }
}
