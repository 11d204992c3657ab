//! Expiring CSRF state store.
//!
//! Each authorization attempt gets a random state token bound to the
//! provider that issued it. Tokens are single use and expire after a TTL.

use crate::provider::ProviderKind;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Issued state awaiting its callback
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub provider: ProviderKind,
    pub created_at: DateTime<Utc>,
}

/// CSRF state store with automatic expiration
#[derive(Clone)]
pub struct StateManager {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    expiry_duration: Duration,
    exclusive_per_provider: bool,
}

impl StateManager {
    /// Create a new state manager
    ///
    /// # Arguments
    /// * `expiry_seconds` - How long states remain valid (default: 600 = 10 minutes)
    /// * `exclusive_per_provider` - A new state replaces any in-flight state
    ///   of the same provider
    pub fn new(expiry_seconds: i64, exclusive_per_provider: bool) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: Duration::seconds(expiry_seconds),
            exclusive_per_provider,
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, StateEntry>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate a new state token for `provider` and store it
    ///
    /// Returns the state token (UUID v4)
    pub fn create_state(&self, provider: ProviderKind) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = StateEntry {
            provider,
            created_at: Utc::now(),
        };

        let mut states = self.states();
        if self.exclusive_per_provider {
            states.retain(|_, existing| existing.provider != provider);
        }
        states.insert(state.clone(), entry);

        state
    }

    /// Validate and consume a state token
    ///
    /// Returns the entry if it was issued for `provider` and has not expired.
    /// The state is removed either way (single-use).
    pub fn validate_and_consume(&self, state: &str, provider: ProviderKind) -> Option<StateEntry> {
        let entry = self.states().remove(state)?;

        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }
        if entry.provider != provider {
            return None;
        }

        Some(entry)
    }

    /// Drop expired states
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let expiry = self.expiry_duration;
        self.states().retain(|_, entry| now - entry.created_at <= expiry);
    }

    /// Number of live states
    pub fn count(&self) -> usize {
        self.states().len()
    }
}

/// Background task to periodically clean up expired states
///
/// An interval of 0 is treated as 1 second.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!(remaining = manager.count(), "OAuth state cleanup complete");
    }
}
