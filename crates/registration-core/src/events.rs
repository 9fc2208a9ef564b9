//! Account state-change events.

use tokio::sync::broadcast;

/// Fire-and-forget state-change signals. No payload: consumers re-query
/// current state, which by publication time is already durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEvent {
    RegistrationStateChanged,
    OnboardingStateChanged,
    LocalNumberChanged,
}

/// Typed event channel the account manager publishes to.
#[derive(Clone)]
pub struct AccountEvents {
    sender: broadcast::Sender<AccountEvent>,
}

impl AccountEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: AccountEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for AccountEvents {
    fn default() -> Self {
        Self::new()
    }
}
