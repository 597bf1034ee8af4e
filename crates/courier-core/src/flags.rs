//! Process-wide feature flags.
//!
//! One [`FeatureFlags`] value is created by the hub and shared by reference.
//! Writers are the configuration at startup and the long-poll kill-switch
//! monitor; everything else only reads.

use std::sync::atomic::{AtomicBool, Ordering};

/// Runtime switches read on the hot path.
#[derive(Debug)]
pub struct FeatureFlags {
    client_broadcasts: AtomicBool,
    longpoll_disabled: AtomicBool,
}

impl FeatureFlags {
    /// Create flags with client broadcasts on or off and long-poll enabled.
    #[must_use]
    pub fn new(client_broadcasts: bool) -> Self {
        Self {
            client_broadcasts: AtomicBool::new(client_broadcasts),
            longpoll_disabled: AtomicBool::new(false),
        }
    }

    /// Whether clients may publish `message` commands.
    #[must_use]
    pub fn client_broadcasts(&self) -> bool {
        self.client_broadcasts.load(Ordering::Relaxed)
    }

    pub fn set_client_broadcasts(&self, enabled: bool) {
        self.client_broadcasts.store(enabled, Ordering::Relaxed);
    }

    /// Whether the long-poll kill-switch is on.
    #[must_use]
    pub fn longpoll_disabled(&self) -> bool {
        self.longpoll_disabled.load(Ordering::Relaxed)
    }

    pub fn set_longpoll_disabled(&self, disabled: bool) {
        self.longpoll_disabled.store(disabled, Ordering::Relaxed);
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::new(true)
    }
}
