//! Provider API endpoints.
//!
//! Everything under `/api/{provider}/` goes through one wildcard route per
//! provider and is dispatched on the remaining path:
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `status` | connection status, never refreshes |
//! | GET | `token[/{scope}]` | debug: current tokens (if exposed) |
//! | GET | `connections` | Xero tenants from a valid token |
//! | GET | anything else | proxied upstream |
//! | POST | `disconnect[/{scope}]` | revoke + delete one scope |
//! | POST | `disconnect-all` | revoke + delete every scope |

use super::{BrokerAppState, ProviderHandle, ProviderState};
use crate::credentials::{CompanyInfo, CredentialRecord, TenantDescriptor, SINGLETON_SCOPE};
use crate::error::BrokerError;
use crate::provider::{ProviderKind, UpstreamResponse};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};


/// GET /api/{provider}/status
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenants: Option<Vec<TenantDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub companies: Option<Vec<CompanyStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<String>,
}

/// One QuickBooks realm in the status payload
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CompanyStatus {
    #[serde(rename = "realmId")]
    pub realm_id: String,
    pub name: Option<String>,
    pub country: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
}

/// Debug view of the current tokens for one scope
#[derive(Serialize)]
struct TokenDebugResponse {
    #[serde(rename = "scopeId")]
    scope_id: String,
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tenants: Vec<TenantDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    company: Option<CompanyInfo>,
}

#[derive(Serialize)]
struct ConnectionsResponse {
    tenants: Vec<TenantDescriptor>,
}

#[derive(Serialize)]
struct DisconnectResponse {
    success: bool,
    removed: usize,
}

/// Create provider API router
pub fn create_provider_router(state: Arc<BrokerAppState>) -> Router {
    let mut router = Router::new().route(
        "/api/quickbooks-query",
        get(quickbooks_query).with_state(state.clone()),
    );

    for kind in ProviderKind::ALL {
        router = router.route(
            &format!("/api/{}/*rest", kind),
            get(dispatch_get).post(dispatch_post).with_state(ProviderState {
                kind,
                app: state.clone(),
            }),
        );
    }

    router
}

/// Status payload from the stored records (no refresh attempted).
///
/// Xero reports its single record; QuickBooks lists one entry per realm.
pub fn build_status(
    kind: ProviderKind,
    records: &[CredentialRecord],
    scopes: String,
    now: DateTime<Utc>,
) -> StatusResponse {
    let disconnected = StatusResponse {
        connected: false,
        expires_at: None,
        expired: None,
        tenants: None,
        companies: kind.is_multi_tenant().then(Vec::new),
        scopes: None,
    };

    match kind {
        ProviderKind::Xero => {
            let Some(record) = records.first() else {
                return disconnected;
            };
            StatusResponse {
                connected: true,
                expires_at: Some(record.expires_at),
                expired: Some(record.is_expired(now)),
                tenants: Some(record.tenants.clone()),
                companies: None,
                scopes: Some(scopes),
            }
        }
        ProviderKind::QuickBooks => {
            if records.is_empty() {
                return disconnected;
            }
            let companies = records
                .iter()
                .map(|record| CompanyStatus {
                    realm_id: record.scope_id.clone(),
                    name: record.company.as_ref().and_then(|c| c.name.clone()),
                    country: record.company.as_ref().and_then(|c| c.country.clone()),
                    expires_at: record.expires_at,
                    expired: record.is_expired(now),
                })
                .collect();
            StatusResponse {
                connected: true,
                expires_at: None,
                expired: None,
                tenants: None,
                companies: Some(companies),
                scopes: Some(scopes),
            }
        }
    }
}

/// Splits `token/abc` into (`token`, Some(`abc`)).
fn split_route(rest: &str) -> (&str, Option<&str>) {
    match rest.trim_matches('/').split_once('/') {
        Some((head, tail)) if !tail.is_empty() => (head, Some(tail)),
        Some((head, _)) => (head, None),
        None => (rest.trim_matches('/'), None),
    }
}

/// GET /api/{provider}/*rest
async fn dispatch_get(
    State(state): State<ProviderState>,
    Path(rest): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, BrokerError> {
    let handle = state.handle()?;

    match split_route(&rest) {
        ("status", None) => status(handle).await,
        ("token", scope) => token(&state, handle, scope, &params).await,
        ("connections", None) if state.kind == ProviderKind::Xero => connections(handle).await,
        _ => {
            let response = handle
                .proxy
                .forward_scoped(&rest, reqwest::Method::GET, params)
                .await?;
            Ok(upstream_response(response))
        }
    }
}

/// POST /api/{provider}/*rest
async fn dispatch_post(
    State(state): State<ProviderState>,
    Path(rest): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, BrokerError> {
    let handle = state.handle()?;

    match split_route(&rest) {
        ("disconnect", scope) => disconnect(handle, scope, &params).await,
        ("disconnect-all", None) => disconnect_all(handle).await,
        _ => Err(BrokerError::NotFound(format!(
            "No route for POST /api/{}/{}",
            state.kind, rest
        ))),
    }
}

async fn status(handle: &ProviderHandle) -> Result<Response, BrokerError> {
    let kind = handle.kind();
    let records = handle.tokens.list_all()?;
    let scopes = handle.tokens.client().descriptor().scope_string();

    debug!(provider = %kind, records = records.len(), "Status requested");
    Ok(Json(build_status(kind, &records, scopes, Utc::now())).into_response())
}

/// Scope from the path, else the scope query parameter, else the singleton.
fn resolve_scope(
    kind: ProviderKind,
    path_scope: Option<&str>,
    params: &[(String, String)],
) -> Result<String, BrokerError> {
    let from_query = params
        .iter()
        .find(|(k, v)| k == kind.scope_param() && !v.is_empty())
        .map(|(_, v)| v.as_str());

    match path_scope.or(from_query) {
        Some(scope) => Ok(kind.store_key(scope).to_string()),
        None if !kind.is_multi_tenant() => Ok(SINGLETON_SCOPE.to_string()),
        None => Err(BrokerError::BadRequest(format!(
            "{} required",
            kind.scope_param()
        ))),
    }
}

async fn token(
    state: &ProviderState,
    handle: &ProviderHandle,
    path_scope: Option<&str>,
    params: &[(String, String)],
) -> Result<Response, BrokerError> {
    if !state.app.expose_tokens {
        return Err(BrokerError::NotFound("Token inspection is disabled".to_string()));
    }

    let scope = resolve_scope(state.kind, path_scope, params)?;
    let record = handle.tokens.require_valid(&scope).await?;

    Ok(Json(TokenDebugResponse {
        scope_id: record.scope_id,
        access_token: record.access_token,
        refresh_token: record.refresh_token,
        expires_at: record.expires_at,
        tenants: record.tenants,
        company: record.company,
    })
    .into_response())
}

async fn connections(handle: &ProviderHandle) -> Result<Response, BrokerError> {
    let record = handle.tokens.require_valid(SINGLETON_SCOPE).await?;
    Ok(Json(ConnectionsResponse {
        tenants: record.tenants,
    })
    .into_response())
}

async fn disconnect(
    handle: &ProviderHandle,
    path_scope: Option<&str>,
    params: &[(String, String)],
) -> Result<Response, BrokerError> {
    let scope = resolve_scope(handle.kind(), path_scope, params)?;
    let removed = handle.tokens.disconnect(&scope).await?;

    info!(provider = %handle.kind(), scope = %scope, removed, "Disconnect requested");
    Ok(Json(DisconnectResponse {
        success: true,
        removed: usize::from(removed),
    })
    .into_response())
}

async fn disconnect_all(handle: &ProviderHandle) -> Result<Response, BrokerError> {
    let removed = handle.tokens.disconnect_all().await?;
    Ok(Json(DisconnectResponse {
        success: true,
        removed,
    })
    .into_response())
}

/// GET /api/quickbooks-query?realmId=..&query=..
async fn quickbooks_query(
    State(state): State<Arc<BrokerAppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, BrokerError> {
    let handle = state.provider(ProviderKind::QuickBooks)?;

    let realm_id = params
        .get("realmId")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BrokerError::BadRequest("realmId query param required".to_string()))?;
    let statement = params
        .get("query")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BrokerError::BadRequest("query param required".to_string()))?;

    let response = handle.proxy.query(realm_id, statement).await?;
    Ok(upstream_response(response))
}

/// Replays an upstream answer: same status, content type and bytes.
fn upstream_response(upstream: UpstreamResponse) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .content_type
        .unwrap_or_else(|| "application/json".to_string());

    (
        status,
        [(header::CONTENT_TYPE, content_type)],
        Body::from(upstream.body),
    )
        .into_response()
}
