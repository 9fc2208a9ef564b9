//! Device registration, re-registration, device linking and number-change
//! flows, plus the local account identity store they mutate.
//!
//! The [`AccountManager`] is the single authority over "who are we": it
//! caches the latest [`AccountState`] snapshot and serializes every
//! identity mutation through the transactional store. A
//! [`RegistrationCoordinator`] drives one [`RegistrationMode`] through its
//! network and cryptographic steps, committing the new identity through
//! the manager only at its finalize step, so a partial failure never
//! leaves the device with half an identity.

pub mod attributes;
pub mod config;
pub mod coordinator;
pub mod deps;
pub mod error;
pub mod events;
pub mod manager;
pub mod mode;
pub mod service;
pub mod state;
pub mod types;

pub use attributes::{AccountAttributes, TwoFactorAuthMode};
pub use config::Config;
pub use coordinator::{CoordinatorDeps, RegistrationCoordinator, Step};
pub use deps::{VerificationTransport, VerifiedAccount};
pub use error::RegistrationError;
pub use events::{AccountEvent, AccountEvents};
pub use manager::AccountManager;
pub use mode::RegistrationMode;
pub use service::HttpRegistrationService;
pub use state::{AccountState, RegistrationState};
pub use types::{Aci, E164, PendingVerification, Pni, RegistrationLockMode};
