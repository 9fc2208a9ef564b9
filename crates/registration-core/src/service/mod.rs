//! Production network collaborator.

mod client;

pub use client::HttpRegistrationService;
