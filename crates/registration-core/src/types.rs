//! Identity and registration value types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Device id of the primary device. Linked devices get ids greater than
/// this, assigned by the server.
pub const PRIMARY_DEVICE_ID: u32 = 1;

/// A phone number in E.164 format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct E164(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum E164Error {
    #[error("phone number must contain at least one digit")]
    Empty,
    #[error("phone number too short")]
    TooShort,
    #[error("phone number too long")]
    TooLong,
    #[error("phone number must include country code")]
    MissingCountryCode,
}

impl E164 {
    /// Parse and normalize a phone number to E.164.
    ///
    /// Accepts human formatting ("+1 (415) 555-1234") and strips it.
    pub fn parse(number: &str) -> Result<Self, E164Error> {
        let has_plus = number.starts_with('+');
        let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();

        if digits.is_empty() {
            return Err(E164Error::Empty);
        }
        if digits.len() < 7 {
            return Err(E164Error::TooShort);
        }
        if digits.len() > 15 {
            return Err(E164Error::TooLong);
        }
        if !has_plus && digits.len() < 10 {
            return Err(E164Error::MissingCountryCode);
        }

        Ok(E164(format!("+{digits}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for E164 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for E164 {
    type Err = E164Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        E164::parse(s)
    }
}

impl TryFrom<String> for E164 {
    type Error = E164Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        E164::parse(&s)
    }
}

impl From<E164> for String {
    fn from(e164: E164) -> Self {
        e164.0
    }
}

/// Stable account identifier, fixed across phone number changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aci(pub Uuid);

/// Privacy number identifier, rotates independently of the ACI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pni(pub Uuid);

impl fmt::Display for Aci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Pni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Whether this device owns the account or is linked to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Primary,
    Secondary,
}

impl DeviceKind {
    pub fn from_device_id(device_id: u32) -> Self {
        if device_id == PRIMARY_DEVICE_ID {
            DeviceKind::Primary
        } else {
            DeviceKind::Secondary
        }
    }
}

/// The registration-lock state the server enforces for this account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationLockMode {
    None,
    /// Legacy PIN sent directly on registration-affecting calls.
    LegacyPin(String),
    /// Key-backup-derived registration lock token.
    V2(String),
}

/// In-flight registration identity, never persisted.
///
/// While set, these values shadow the stored snapshot so that identity
/// queries made during an in-flight attempt answer consistently. The two
/// stages keep the "all or nothing" shape explicit: candidate identifiers
/// only exist once the server has confirmed the verification code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingVerification {
    /// A verification code has been requested for this number.
    Number { e164: E164 },
    /// The server confirmed the code and returned the account identity.
    Identity { e164: E164, aci: Aci, pni: Pni },
}

impl PendingVerification {
    pub fn e164(&self) -> &E164 {
        match self {
            PendingVerification::Number { e164 } => e164,
            PendingVerification::Identity { e164, .. } => e164,
        }
    }
}

/// Prior identity retained across a re-registration reset, so the flow
/// knows which account it is re-establishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReregistrationParams {
    pub e164: E164,
    pub aci: Aci,
}

/// Basic-auth credential pair for authenticated service calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAuth {
    pub username: String,
    pub password: String,
}

impl AccountAuth {
    /// Credentials for a specific device of an account.
    pub fn for_device(aci: Aci, device_id: u32, password: impl Into<String>) -> Self {
        let username = if device_id == PRIMARY_DEVICE_ID {
            aci.to_string()
        } else {
            format!("{aci}.{device_id}")
        };
        Self {
            username,
            password: password.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e164_normalization() {
        assert_eq!(
            E164::parse("+1 (415) 555-1234").unwrap().as_str(),
            "+14155551234"
        );
        assert_eq!(E164::parse("+14155551234").unwrap().as_str(), "+14155551234");
        assert_eq!(E164::parse("14155551234").unwrap().as_str(), "+14155551234");
        assert_eq!(E164::parse("123"), Err(E164Error::TooShort));
        assert_eq!(E164::parse(""), Err(E164Error::Empty));
        assert_eq!(E164::parse("5551234"), Err(E164Error::MissingCountryCode));
        assert_eq!(
            E164::parse("+12345678901234567890"),
            Err(E164Error::TooLong)
        );
    }

    #[test]
    fn e164_serde_round_trip() {
        let e164 = E164::parse("+15551234567").unwrap();
        let json = serde_json::to_string(&e164).unwrap();
        assert_eq!(json, "\"+15551234567\"");
        let back: E164 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e164);
    }

    #[test]
    fn device_kind_from_id() {
        assert_eq!(DeviceKind::from_device_id(1), DeviceKind::Primary);
        assert_eq!(DeviceKind::from_device_id(2), DeviceKind::Secondary);
    }

    #[test]
    fn auth_username_includes_secondary_device_id() {
        let aci = Aci(Uuid::new_v4());
        let primary = AccountAuth::for_device(aci, PRIMARY_DEVICE_ID, "pw");
        assert_eq!(primary.username, aci.to_string());

        let linked = AccountAuth::for_device(aci, 3, "pw");
        assert_eq!(linked.username, format!("{aci}.3"));
    }
}
