//! Typed errors for registration flows.
//!
//! Programming-invariant violations (calling `did_register` without a
//! confirmed pending verification, resetting a never-registered account)
//! are not represented here; those are caller bugs and panic instead.

use crate::types::E164Error;
use account_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Transport-level failure; the same step may be retried.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// Unexpected server response.
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    /// The server demands a captcha before it will send a code.
    #[error("captcha required")]
    CaptchaRequired,

    /// Too many attempts; wait before retrying.
    #[error("rate limited")]
    RateLimited,

    /// The submitted verification code was rejected.
    #[error("invalid verification code")]
    InvalidVerificationCode,

    /// Re-registering this number requires the registration lock secret.
    #[error("registration lock enforced")]
    RegistrationLocked,

    /// The server returned identifiers for a different account than the
    /// flow expected. The flow is aborted; nothing local was written.
    #[error("server returned a different account than expected")]
    WrongAccount,

    /// A step exceeded its configured deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The coordinator was asked to run a step it is not at.
    #[error("flow is at step {actual}, not {expected}")]
    InvalidStep {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid phone number: {0}")]
    InvalidPhoneNumber(#[from] E164Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RegistrationError {
    /// Whether the failed step can be retried as-is, with no side effects
    /// recorded anywhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistrationError::NetworkFailure(_)
                | RegistrationError::Timeout(_)
                | RegistrationError::RateLimited
        )
    }
}

impl From<reqwest::Error> for RegistrationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RegistrationError::Timeout("service response")
        } else {
            RegistrationError::NetworkFailure(e.to_string())
        }
    }
}
