//! Token lifecycle management.
//!
//! [`TokenManager`] wraps a provider's [`TokenStore`] and [`ProviderClient`]
//! and hands out access tokens that are valid right now:
//!
//! 1. Load the record for the scope (absent → not connected)
//! 2. If `now >= expires_at - skew`, redeem the refresh token
//! 3. On success persist the refreshed record and return it
//! 4. On failure return "expired" and leave the stored record alone, so a
//!    later call can retry once the provider recovers
//!
//! Refreshes are serialized per scope so two concurrent requests cannot
//! both redeem (and clobber) the same rotating refresh token.

use crate::credentials::{CredentialRecord, TokenStore};
use crate::error::{BrokerError, UnauthorizedReason};
use crate::provider::{ProviderClient, ProviderKind};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};


/// Result of looking up a scope's token.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenLookup {
    Valid(CredentialRecord),
    NotConnected,
    /// Expired (or about to) and the refresh attempt failed
    Expired,
}

impl TokenLookup {
    pub fn into_record(self) -> Option<CredentialRecord> {
        match self {
            TokenLookup::Valid(record) => Some(record),
            TokenLookup::NotConnected | TokenLookup::Expired => None,
        }
    }
}

/// Delivers always-valid tokens for one provider.
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    client: Arc<dyn ProviderClient>,
    skew: Duration,
    // One lock per scope id, dropped once the scope is gone and unused
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn TokenStore>, client: Arc<dyn ProviderClient>, skew: Duration) -> Self {
        Self {
            store,
            client,
            skew,
            locks: DashMap::new(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.client.kind()
    }

    pub fn client(&self) -> &Arc<dyn ProviderClient> {
        &self.client
    }

    /// All stored records, without refreshing.
    pub fn list_all(&self) -> Result<Vec<CredentialRecord>, BrokerError> {
        Ok(self.store.list_all()?)
    }

    fn scope_lock(&self, scope_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(scope_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Forgets the lock of a scope that no longer has a record, unless
    /// another task still holds or awaits it.
    fn release_lock(&self, scope_id: &str) {
        self.locks
            .remove_if(scope_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Looks up the token for `scope_id`, refreshing it when due.
    ///
    /// # Errors
    /// Only storage failures. An upstream refresh failure is reported as
    /// [`TokenLookup::Expired`].
    pub async fn lookup(&self, scope_id: &str) -> Result<TokenLookup, BrokerError> {
        let lock = self.scope_lock(scope_id);
        let result = {
            let _guard = lock.lock().await;
            self.lookup_locked(scope_id).await
        };
        drop(lock);

        if matches!(result, Ok(TokenLookup::NotConnected)) {
            self.release_lock(scope_id);
        }
        result
    }

    async fn lookup_locked(&self, scope_id: &str) -> Result<TokenLookup, BrokerError> {
        let Some(record) = self.store.get(scope_id)? else {
            debug!(provider = %self.kind(), scope = %scope_id, "No stored token");
            return Ok(TokenLookup::NotConnected);
        };

        if !record.needs_refresh(Utc::now(), self.skew) {
            return Ok(TokenLookup::Valid(record));
        }

        if record.refresh_token.is_empty() {
            warn!(provider = %self.kind(), scope = %scope_id, "Token expired and no refresh token stored");
            return Ok(TokenLookup::Expired);
        }

        info!(
            provider = %self.kind(),
            scope = %scope_id,
            expires_at = %record.expires_at,
            "Refreshing OAuth token"
        );

        match self.client.refresh(&record.refresh_token).await {
            Ok(response) => {
                let refreshed = record.refreshed(response, Utc::now());
                self.store.put(scope_id, &refreshed)?;

                info!(
                    provider = %self.kind(),
                    scope = %scope_id,
                    expires_at = %refreshed.expires_at,
                    "OAuth token refreshed successfully"
                );
                Ok(TokenLookup::Valid(refreshed))
            }
            Err(e) => {
                warn!(
                    provider = %self.kind(),
                    scope = %scope_id,
                    error = %e,
                    "Token refresh failed, keeping stored record"
                );
                Ok(TokenLookup::Expired)
            }
        }
    }

    /// The record for `scope_id` if a valid token is available.
    pub async fn get_valid(&self, scope_id: &str) -> Result<Option<CredentialRecord>, BrokerError> {
        Ok(self.lookup(scope_id).await?.into_record())
    }

    /// Like [`get_valid`](Self::get_valid) but maps absence to `Unauthorized`.
    pub async fn require_valid(&self, scope_id: &str) -> Result<CredentialRecord, BrokerError> {
        match self.lookup(scope_id).await? {
            TokenLookup::Valid(record) => Ok(record),
            TokenLookup::NotConnected => Err(BrokerError::Unauthorized {
                scope: scope_id.to_string(),
                reason: UnauthorizedReason::NotConnected,
            }),
            TokenLookup::Expired => Err(BrokerError::Unauthorized {
                scope: scope_id.to_string(),
                reason: UnauthorizedReason::Expired,
            }),
        }
    }

    /// Persists a newly authorized record (insert or replace).
    pub async fn save(&self, record: &CredentialRecord) -> Result<(), BrokerError> {
        let lock = self.scope_lock(&record.scope_id);
        let _guard = lock.lock().await;

        self.store.put(&record.scope_id, record)?;
        info!(
            provider = %self.kind(),
            scope = %record.scope_id,
            has_refresh_token = !record.refresh_token.is_empty(),
            "Credentials stored"
        );
        Ok(())
    }

    /// Revokes (best effort) and deletes one scope.
    ///
    /// Succeeds when the scope does not exist. Returns whether a record was
    /// removed.
    pub async fn disconnect(&self, scope_id: &str) -> Result<bool, BrokerError> {
        let removed = self.disconnect_scope(scope_id).await?;
        if removed {
            info!(provider = %self.kind(), scope = %scope_id, "Scope disconnected");
        } else {
            debug!(provider = %self.kind(), scope = %scope_id, "Disconnect for unknown scope");
        }
        Ok(removed)
    }

    /// Revokes (best effort) and deletes every scope of this provider.
    ///
    /// Each scope is removed under its own lock, so a refresh in flight
    /// finishes first and its result is the one revoked.
    pub async fn disconnect_all(&self) -> Result<usize, BrokerError> {
        let mut removed = 0;
        for record in self.store.list_all()? {
            if self.disconnect_scope(&record.scope_id).await? {
                removed += 1;
            }
        }

        info!(provider = %self.kind(), removed, "All scopes disconnected");
        Ok(removed)
    }

    async fn disconnect_scope(&self, scope_id: &str) -> Result<bool, BrokerError> {
        let lock = self.scope_lock(scope_id);
        let result = {
            let _guard = lock.lock().await;
            // Re-read under the lock; a refresh may have replaced the record
            match self.store.get(scope_id)? {
                Some(record) => {
                    self.revoke(&record).await;
                    self.store.delete(scope_id)?
                }
                None => false,
            }
        };
        drop(lock);

        self.release_lock(scope_id);
        Ok(result)
    }

    async fn revoke(&self, record: &CredentialRecord) {
        // Revoking the refresh token ends the whole grant
        let token = if record.refresh_token.is_empty() {
            &record.access_token
        } else {
            &record.refresh_token
        };

        if !self.client.revoke(token).await {
            warn!(
                provider = %self.kind(),
                scope = %record.scope_id,
                "Revocation failed, deleting local credentials anyway"
            );
        }
    }
}
