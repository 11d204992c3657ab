//! Transparent API proxy.
//!
//! Every call is gated on [`TokenManager::require_valid`]; the upstream
//! status and body come back untouched, error bodies included.

use crate::error::BrokerError;
use crate::lifecycle::TokenManager;
use crate::provider::{ApiRequest, ProviderKind, UpstreamResponse};
use reqwest::Method;
use std::sync::Arc;
use tracing::debug;

pub struct ApiProxy {
    tokens: Arc<TokenManager>,
}

impl ApiProxy {
    pub fn new(tokens: Arc<TokenManager>) -> Self {
        Self { tokens }
    }

    pub fn kind(&self) -> ProviderKind {
        self.tokens.kind()
    }

    /// Forwards `method path?query` on behalf of `scope_id`.
    ///
    /// For Xero `scope_id` is the tenant sent in the tenant header; the token
    /// itself comes from the single stored record.
    pub async fn forward(
        &self,
        scope_id: &str,
        path: &str,
        method: Method,
        query: Vec<(String, String)>,
    ) -> Result<UpstreamResponse, BrokerError> {
        let kind = self.kind();
        let record = self.tokens.require_valid(kind.store_key(scope_id)).await?;

        let request = ApiRequest {
            method,
            path: path.to_string(),
            query,
        };
        let response = self
            .tokens
            .client()
            .call_api(&record.access_token, scope_id, &request)
            .await?;

        debug!(
            provider = %kind,
            scope = %scope_id,
            path = %path,
            status = response.status,
            "Proxied API call"
        );
        Ok(response)
    }

    /// Forwards a call whose scope arrives as the provider's scope query
    /// parameter (`tenantId` / `realmId`). Remaining parameters pass through.
    pub async fn forward_scoped(
        &self,
        path: &str,
        method: Method,
        params: Vec<(String, String)>,
    ) -> Result<UpstreamResponse, BrokerError> {
        let (scope_id, query) = split_scope(self.kind(), params)?;
        self.forward(&scope_id, path, method, query).await
    }

    /// QuickBooks structured query: `GET {api}/{realm}/query?query=...`.
    pub async fn query(&self, realm_id: &str, statement: &str) -> Result<UpstreamResponse, BrokerError> {
        if self.kind() != ProviderKind::QuickBooks {
            return Err(BrokerError::BadRequest(format!(
                "Structured queries are not supported for {}",
                self.kind()
            )));
        }
        self.forward(
            realm_id,
            "query",
            Method::GET,
            vec![("query".to_string(), statement.to_string())],
        )
        .await
    }
}

/// Removes the scope parameter from `params`, returning its value.
pub fn split_scope(
    kind: ProviderKind,
    params: Vec<(String, String)>,
) -> Result<(String, Vec<(String, String)>), BrokerError> {
    let name = kind.scope_param();
    let (scope, rest): (Vec<_>, Vec<_>) = params.into_iter().partition(|(k, _)| k == name);

    let scope_id = scope
        .into_iter()
        .map(|(_, v)| v)
        .find(|v| !v.is_empty())
        .ok_or_else(|| BrokerError::BadRequest(format!("{} query param required", name)))?;

    Ok((scope_id, rest))
}
