use super::state_store::StateManager;
use crate::credentials::{CredentialRecord, ScopeSummary, SINGLETON_SCOPE};
use crate::error::BrokerError;
use crate::lifecycle::TokenManager;
use crate::provider::ProviderKind;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// OAuth callback query parameters
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "realmId")]
    pub realm_id: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Authorization code flow for one provider.
pub struct AuthFlow {
    tokens: Arc<TokenManager>,
    states: StateManager,
}

impl AuthFlow {
    pub fn new(tokens: Arc<TokenManager>, states: StateManager) -> Self {
        Self { tokens, states }
    }

    pub fn kind(&self) -> ProviderKind {
        self.tokens.kind()
    }

    /// Issues a CSRF state and returns the consent URL to redirect to.
    pub fn begin_auth(&self) -> String {
        let state = self.states.create_state(self.kind());
        info!(provider = %self.kind(), "Redirecting to OAuth provider");
        self.tokens.client().descriptor().build_auth_url(&state)
    }

    /// Completes an authorization: validates state, exchanges the code,
    /// enriches and persists the record.
    ///
    /// # Errors
    /// - `UpstreamAuth` when the provider reported an error or rejected the code
    /// - `InvalidState` on a missing, unknown or expired state (no exchange happens)
    /// - `BadRequest` when `code` (or QuickBooks' `realmId`) is missing
    pub async fn handle_callback(&self, query: CallbackQuery) -> Result<ScopeSummary, BrokerError> {
        let provider = self.kind();
        debug!(provider = %provider, "OAuth callback received");

        if let Some(error) = query.error {
            let message = match query.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            };
            warn!(provider = %provider, error = %message, "OAuth authorization failed");
            return Err(BrokerError::UpstreamAuth { message });
        }

        let state = query.state.unwrap_or_default();
        if self.states.validate_and_consume(&state, provider).is_none() {
            warn!(provider = %provider, "Invalid or expired OAuth state");
            return Err(BrokerError::InvalidState);
        }

        let scope_id = if provider.is_multi_tenant() {
            query
                .realm_id
                .filter(|id| !id.is_empty())
                .ok_or_else(|| BrokerError::BadRequest("Missing realmId parameter".to_string()))?
        } else {
            SINGLETON_SCOPE.to_string()
        };

        let code = query
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BrokerError::BadRequest("Missing 'code' parameter".to_string()))?;

        let client = self.tokens.client();
        let response = client.exchange_code(&code).await?;
        let mut record = CredentialRecord::from_token_response(&scope_id, response, Utc::now());

        client
            .enrich(&record.access_token, &scope_id)
            .await?
            .apply(&mut record);

        self.tokens.save(&record).await?;

        info!(
            provider = %provider,
            scope = %scope_id,
            tenants = record.tenants.len(),
            "OAuth authorization complete"
        );
        Ok(record.summary(provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{temp_store, MockProviderClient};
    use chrono::Duration;
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        client: Arc<MockProviderClient>,
        tokens: Arc<TokenManager>,
        flow: AuthFlow,
    }

    fn fixture(kind: ProviderKind) -> Fixture {
        let (dir, store) = temp_store(kind);
        let client = Arc::new(MockProviderClient::new(kind));
        let tokens = Arc::new(TokenManager::new(store, client.clone(), Duration::seconds(300)));
        let flow = AuthFlow::new(tokens.clone(), StateManager::new(600, true));
        Fixture {
            _dir: dir,
            client,
            tokens,
            flow,
        }
    }

    fn state_from(url: &str) -> String {
        let query = url.split_once('?').unwrap().1;
        serde_urlencoded::from_str::<Vec<(String, String)>>(query)
            .unwrap()
            .into_iter()
            .find(|(k, _)| k == "state")
            .unwrap()
            .1
    }

    fn callback(state: &str, realm_id: Option<&str>) -> CallbackQuery {
        CallbackQuery {
            code: Some("auth-code".to_string()),
            state: Some(state.to_string()),
            realm_id: realm_id.map(|r| r.to_string()),
            ..CallbackQuery::default()
        }
    }

    #[test]
    fn test_begin_auth_url() {
        let f = fixture(ProviderKind::Xero);
        let url = f.flow.begin_auth();

        assert!(url.starts_with("https://provider.test/authorize?response_type=code"));
        assert!(url.contains("client_id=client-id"));
        assert!(!state_from(&url).is_empty());
    }

    #[tokio::test]
    async fn test_callback_with_wrong_state_never_exchanges() {
        let f = fixture(ProviderKind::QuickBooks);
        f.flow.begin_auth();

        let err = f
            .flow
            .handle_callback(callback("forged", Some("realm-1")))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::InvalidState));
        assert_eq!(MockProviderClient::count(&f.client.exchange_calls), 0);
        assert!(f.tokens.list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_superseded_state_is_rejected() {
        let f = fixture(ProviderKind::Xero);
        let first = state_from(&f.flow.begin_auth());
        let second = state_from(&f.flow.begin_auth());

        let err = f.flow.handle_callback(callback(&first, None)).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState));

        f.flow.handle_callback(callback(&second, None)).await.unwrap();
        assert_eq!(MockProviderClient::count(&f.client.exchange_calls), 1);
    }

    #[tokio::test]
    async fn test_provider_error_is_surfaced() {
        let f = fixture(ProviderKind::Xero);
        let query = CallbackQuery {
            error: Some("access_denied".to_string()),
            error_description: Some("User cancelled".to_string()),
            ..CallbackQuery::default()
        };

        let err = f.flow.handle_callback(query).await.unwrap_err();
        assert_eq!(err.to_string(), "access_denied: User cancelled");
        assert_eq!(MockProviderClient::count(&f.client.exchange_calls), 0);
    }

    #[tokio::test]
    async fn test_quickbooks_requires_realm() {
        let f = fixture(ProviderKind::QuickBooks);
        let state = state_from(&f.flow.begin_auth());

        let err = f.flow.handle_callback(callback(&state, None)).await.unwrap_err();
        assert!(matches!(err, BrokerError::BadRequest(_)));
        assert_eq!(MockProviderClient::count(&f.client.exchange_calls), 0);
    }

    #[tokio::test]
    async fn test_quickbooks_callback_persists_realm() {
        let f = fixture(ProviderKind::QuickBooks);
        let state = state_from(&f.flow.begin_auth());

        let summary = f
            .flow
            .handle_callback(callback(&state, Some("9130348")))
            .await
            .unwrap();

        assert_eq!(summary.scope_id, "9130348");
        assert_eq!(
            summary.company.as_ref().and_then(|c| c.name.as_deref()),
            Some("Company 9130348")
        );

        let stored = f.tokens.get_valid("9130348").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access-for-auth-code");
        assert_eq!(stored.refresh_token, "refresh-for-auth-code");
        assert!(stored.company.is_some());

        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("access-for-auth-code"));
        assert!(!json.contains("refresh-for-auth-code"));
    }

    #[tokio::test]
    async fn test_xero_callback_stores_singleton_with_tenants() {
        let f = fixture(ProviderKind::Xero);
        let state = state_from(&f.flow.begin_auth());

        let summary = f.flow.handle_callback(callback(&state, None)).await.unwrap();

        assert_eq!(summary.scope_id, SINGLETON_SCOPE);
        assert_eq!(summary.tenants.len(), 1);
        assert_eq!(MockProviderClient::count(&f.client.enrich_calls), 1);
        assert_eq!(f.tokens.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_code_stores_nothing() {
        let f = fixture(ProviderKind::QuickBooks);
        f.client.fail_exchange.store(true, Ordering::SeqCst);
        let state = state_from(&f.flow.begin_auth());

        let err = f
            .flow
            .handle_callback(callback(&state, Some("realm-1")))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::UpstreamAuth { .. }));
        assert!(err.to_string().contains("invalid_grant"));
        assert!(f.tokens.list_all().unwrap().is_empty());
    }
}
