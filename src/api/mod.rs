//! HTTP surface.
//!
//! Routes are registered per provider with static prefixes
//! (`/auth/xero`, `/api/quickbooks/*rest`, ...). Each provider route carries
//! a [`ProviderState`] naming the provider it serves.

mod auth;
mod providers;

pub use auth::create_auth_router;
pub use providers::{build_status, create_provider_router, CompanyStatus, StatusResponse};

use crate::config::{BrokerConfig, StorageBackend};
use crate::credentials::{JsonFileStore, SqliteTokenStore, TokenStore, SINGLETON_SCOPE};
use crate::error::BrokerError;
use crate::lifecycle::TokenManager;
use crate::oauth::{AuthFlow, StateManager};
use crate::provider::{HttpProviderClient, ProviderClient, ProviderDescriptor, ProviderKind};
use crate::proxy::ApiProxy;
use anyhow::{Context, Result};
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// SQLite database file name inside the storage directory
pub const SQLITE_FILE: &str = "credentials.db";

/// Everything the routes need for one configured provider
#[derive(Clone)]
pub struct ProviderHandle {
    pub tokens: Arc<TokenManager>,
    pub flow: Arc<AuthFlow>,
    pub proxy: Arc<ApiProxy>,
}

impl ProviderHandle {
    pub fn new(tokens: Arc<TokenManager>, states: StateManager) -> Self {
        Self {
            flow: Arc::new(AuthFlow::new(tokens.clone(), states)),
            proxy: Arc::new(ApiProxy::new(tokens.clone())),
            tokens,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.tokens.kind()
    }
}

/// Shared application state
#[derive(Clone, Default)]
pub struct BrokerAppState {
    providers: HashMap<ProviderKind, ProviderHandle>,
    /// Serve the debug token routes
    pub expose_tokens: bool,
}

impl BrokerAppState {
    pub fn new(expose_tokens: bool) -> Self {
        Self {
            providers: HashMap::new(),
            expose_tokens,
        }
    }

    pub fn with_provider(mut self, handle: ProviderHandle) -> Self {
        self.providers.insert(handle.kind(), handle);
        self
    }

    /// Builds stores, clients and token managers for every provider whose
    /// credentials are configured.
    pub fn from_config(config: &BrokerConfig, states: StateManager) -> Result<Self> {
        let mut state = Self::new(config.server.expose_tokens);
        let timeout = Duration::from_secs(config.http.timeout_seconds);
        let skew = chrono::Duration::seconds(config.oauth.refresh_skew_seconds);

        for kind in ProviderKind::ALL {
            let settings = match kind {
                ProviderKind::Xero => &config.xero,
                ProviderKind::QuickBooks => &config.quickbooks,
            };
            let Some(descriptor) = ProviderDescriptor::from_settings(kind, settings) else {
                warn!(provider = %kind, "Client id/secret not set, provider disabled");
                continue;
            };

            let store = open_store(config, kind)?;
            let client: Arc<dyn ProviderClient> = Arc::new(HttpProviderClient::new(descriptor, timeout)?);
            let tokens = Arc::new(TokenManager::new(store, client, skew));

            info!(provider = %kind, backend = ?config.storage.backend, "Provider enabled");
            state = state.with_provider(ProviderHandle::new(tokens, states.clone()));
        }

        Ok(state)
    }

    /// Handle for `kind`, or `NotConfigured` when the provider is disabled.
    pub fn provider(&self, kind: ProviderKind) -> Result<&ProviderHandle, BrokerError> {
        self.providers.get(&kind).ok_or_else(|| {
            BrokerError::NotConfigured(format!("Provider '{}' is not configured", kind))
        })
    }

    pub fn configured(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.providers.keys().copied()
    }
}

fn open_store(config: &BrokerConfig, kind: ProviderKind) -> Result<Arc<dyn TokenStore>> {
    let dir = &config.storage.directory;
    match config.storage.backend {
        StorageBackend::Json => {
            let default_scope = (!kind.is_multi_tenant()).then_some(SINGLETON_SCOPE);
            let store = JsonFileStore::new(dir.join(kind.store_file()), default_scope);
            Ok(Arc::new(store))
        }
        StorageBackend::Sqlite => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let store = SqliteTokenStore::new(dir.join(SQLITE_FILE), kind.as_str())?;
            Ok(Arc::new(store))
        }
    }
}

/// Route state for handlers registered under one provider's prefix
#[derive(Clone)]
pub struct ProviderState {
    pub kind: ProviderKind,
    pub app: Arc<BrokerAppState>,
}

impl ProviderState {
    fn handle(&self) -> Result<&ProviderHandle, BrokerError> {
        self.app.provider(self.kind)
    }
}

/// All broker routes (without middleware layers)
pub fn create_router(state: Arc<BrokerAppState>) -> Router {
    create_auth_router(state.clone()).merge(create_provider_router(state))
}
