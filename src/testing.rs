//! Test doubles shared by unit tests.

use crate::credentials::{CompanyInfo, CredentialRecord, JsonFileStore, TenantDescriptor};
use crate::error::BrokerError;
use crate::provider::{
    ApiRequest, Enrichment, ProviderClient, ProviderDescriptor, ProviderKind, TokenResponse,
    UpstreamResponse,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

pub(crate) fn descriptor(kind: ProviderKind) -> ProviderDescriptor {
    ProviderDescriptor {
        kind,
        auth_url: "https://provider.test/authorize".to_string(),
        token_url: "https://provider.test/token".to_string(),
        revoke_url: "https://provider.test/revoke".to_string(),
        enrichment_url: "https://provider.test/connections".to_string(),
        api_base_url: "https://provider.test/api".to_string(),
        scopes: vec!["openid".to_string(), "offline_access".to_string()],
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        redirect_uri: format!("http://localhost:3000/auth/{}/callback", kind),
    }
}

/// JSON store in a temp dir. Keep the `TempDir` alive for the test.
pub(crate) fn temp_store(kind: ProviderKind) -> (TempDir, Arc<JsonFileStore>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let default_scope = (!kind.is_multi_tenant()).then_some(crate::credentials::SINGLETON_SCOPE);
    let store = JsonFileStore::new(dir.path().join(kind.store_file()), default_scope);
    (dir, Arc::new(store))
}

pub(crate) fn record(scope_id: &str, access_token: &str, expires_at: DateTime<Utc>) -> CredentialRecord {
    CredentialRecord {
        scope_id: scope_id.to_string(),
        access_token: access_token.to_string(),
        refresh_token: format!("{}-refresh", access_token),
        expires_at,
        token_type: Some("Bearer".to_string()),
        id_token: None,
        tenants: Vec::new(),
        company: None,
    }
}

/// Provider double with call counters and switchable failures.
pub(crate) struct MockProviderClient {
    descriptor: ProviderDescriptor,
    pub exchange_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    pub enrich_calls: AtomicUsize,
    pub api_calls: AtomicUsize,
    pub fail_exchange: AtomicBool,
    pub fail_refresh: AtomicBool,
    pub fail_revoke: AtomicBool,
    pub revoked: Mutex<Vec<String>>,
    pub api_response: Mutex<UpstreamResponse>,
    pub last_api_call: Mutex<Option<(String, String, ApiRequest)>>,
    /// When set, `refresh` signals the first notify and waits on the second
    pub refresh_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl MockProviderClient {
    pub(crate) fn new(kind: ProviderKind) -> Self {
        Self {
            descriptor: descriptor(kind),
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
            enrich_calls: AtomicUsize::new(0),
            api_calls: AtomicUsize::new(0),
            fail_exchange: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
            fail_revoke: AtomicBool::new(false),
            revoked: Mutex::new(Vec::new()),
            api_response: Mutex::new(UpstreamResponse {
                status: 200,
                content_type: Some("application/json".to_string()),
                body: b"{}".to_vec(),
            }),
            last_api_call: Mutex::new(None),
            refresh_gate: Mutex::new(None),
        }
    }

    pub(crate) fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, BrokerError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_exchange.load(Ordering::SeqCst) {
            return Err(BrokerError::UpstreamAuth {
                message: r#"Token exchange failed with status 400: {"error":"invalid_grant"}"#
                    .to_string(),
            });
        }
        Ok(TokenResponse {
            access_token: format!("access-for-{}", code),
            refresh_token: Some(format!("refresh-for-{}", code)),
            expires_in: Some(3600),
            token_type: Some("Bearer".to_string()),
            id_token: None,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse, BrokerError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = self.refresh_gate.lock().ok().and_then(|gate| gate.clone());
        if let Some((started, release)) = gate {
            started.notify_one();
            release.notified().await;
        }
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(BrokerError::UpstreamAuth {
                message: "Token refresh failed with status 503: unavailable".to_string(),
            });
        }
        Ok(TokenResponse {
            access_token: format!("refreshed-{}", n),
            refresh_token: Some(format!("rotated-{}", n)),
            expires_in: Some(3600),
            token_type: Some("Bearer".to_string()),
            id_token: None,
        })
    }

    async fn revoke(&self, token: &str) -> bool {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut revoked) = self.revoked.lock() {
            revoked.push(token.to_string());
        }
        !self.fail_revoke.load(Ordering::SeqCst)
    }

    async fn enrich(&self, _access_token: &str, scope_id: &str) -> Result<Enrichment, BrokerError> {
        self.enrich_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match self.descriptor.kind {
            ProviderKind::Xero => Enrichment::Tenants(vec![TenantDescriptor {
                id: "tenant-1".to_string(),
                name: "Demo Company (UK)".to_string(),
            }]),
            ProviderKind::QuickBooks => Enrichment::Company(CompanyInfo {
                id: "1".to_string(),
                name: Some(format!("Company {}", scope_id)),
                country: Some("US".to_string()),
            }),
        })
    }

    async fn call_api(
        &self,
        access_token: &str,
        scope_id: &str,
        request: &ApiRequest,
    ) -> Result<UpstreamResponse, BrokerError> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_api_call.lock() {
            *last = Some((access_token.to_string(), scope_id.to_string(), request.clone()));
        }
        self.api_response
            .lock()
            .map(|r| r.clone())
            .map_err(|_| BrokerError::Transport("mock poisoned".to_string()))
    }
}
