//! OAuth provider descriptors and the client seam.
//!
//! Xero and QuickBooks differ only in data (endpoints, scopes) and a handful
//! of quirks keyed off [`ProviderKind`]:
//!
//! | | Xero | QuickBooks |
//! |---|---|---|
//! | records | one (`default`) | one per realm |
//! | scope param | `tenantId` | `realmId` |
//! | API scoping | `Xero-Tenant-Id` header | realm path segment |
//! | enrichment | `/connections` | `/companyinfo/{realm}` |
//! | revocation body | form | JSON |

mod client;

pub use client::HttpProviderClient;

use crate::config::{Environment, ProviderSettings};
use crate::credentials::{CompanyInfo, CredentialRecord, TenantDescriptor, SINGLETON_SCOPE};
use crate::error::BrokerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const XERO_AUTH_URL: &str = "https://login.xero.com/identity/connect/authorize";
pub const XERO_TOKEN_URL: &str = "https://identity.xero.com/connect/token";
pub const XERO_REVOKE_URL: &str = "https://identity.xero.com/connect/revocation";
pub const XERO_CONNECTIONS_URL: &str = "https://api.xero.com/connections";
pub const XERO_API_BASE_URL: &str = "https://api.xero.com/api.xro/2.0";

pub const QB_AUTH_URL: &str = "https://appcenter.intuit.com/connect/oauth2";
pub const QB_TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";
pub const QB_REVOKE_URL: &str = "https://developer.api.intuit.com/v2/oauth2/tokens/revoke";
pub const QB_SANDBOX_API_URL: &str = "https://sandbox-quickbooks.api.intuit.com/v3/company";
pub const QB_PRODUCTION_API_URL: &str = "https://quickbooks.api.intuit.com/v3/company";

/// Header Xero uses to select the organisation an API call applies to.
pub const XERO_TENANT_HEADER: &str = "Xero-Tenant-Id";

const XERO_SCOPES: &[&str] = &[
    "openid",
    "profile",
    "email",
    "accounting.transactions.read",
    "accounting.contacts.read",
    "accounting.settings.read",
    "accounting.journals.read",
    "offline_access",
];

const QB_SCOPES: &[&str] = &["com.intuit.quickbooks.accounting", "openid", "profile", "email"];

/// Supported accounting platforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Xero,
    QuickBooks,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Xero, ProviderKind::QuickBooks];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Xero => "xero",
            ProviderKind::QuickBooks => "quickbooks",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "xero" => Some(ProviderKind::Xero),
            "quickbooks" => Some(ProviderKind::QuickBooks),
            _ => None,
        }
    }

    /// True when the provider keeps one record per tenant scope.
    pub fn is_multi_tenant(&self) -> bool {
        matches!(self, ProviderKind::QuickBooks)
    }

    /// Query parameter identifying the scope on proxy calls.
    pub fn scope_param(&self) -> &'static str {
        match self {
            ProviderKind::Xero => "tenantId",
            ProviderKind::QuickBooks => "realmId",
        }
    }

    /// Default token file name for the JSON store.
    pub fn store_file(&self) -> &'static str {
        match self {
            ProviderKind::Xero => "tokens.json",
            ProviderKind::QuickBooks => "qb-tokens.json",
        }
    }

    /// Store key for a request addressing `scope_id`.
    ///
    /// Xero keeps one record regardless of the tenant being addressed.
    pub fn store_key<'a>(&self, scope_id: &'a str) -> &'a str {
        if self.is_multi_tenant() {
            scope_id
        } else {
            SINGLETON_SCOPE
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved provider configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,

    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Token revocation endpoint URL
    pub revoke_url: String,

    /// Xero connections listing. Unused for QuickBooks, whose company
    /// lookup lives under `api_base_url`.
    pub enrichment_url: String,

    /// Root for proxied API calls
    pub api_base_url: String,

    /// Required OAuth scopes
    pub scopes: Vec<String>,

    pub client_id: String,

    pub client_secret: String,

    pub redirect_uri: String,
}

impl ProviderDescriptor {
    /// Resolves a descriptor from settings, filling provider defaults.
    ///
    /// Returns `None` when the client id or secret is missing, which leaves
    /// the provider disabled.
    pub fn from_settings(kind: ProviderKind, settings: &ProviderSettings) -> Option<Self> {
        let client_id = settings.client_id.clone().filter(|s| !s.is_empty())?;
        let client_secret = settings.client_secret.clone().filter(|s| !s.is_empty())?;

        let (auth_url, token_url, revoke_url, enrichment_url, api_base_url, scopes) = match kind {
            ProviderKind::Xero => (
                XERO_AUTH_URL,
                XERO_TOKEN_URL,
                XERO_REVOKE_URL,
                XERO_CONNECTIONS_URL,
                XERO_API_BASE_URL,
                XERO_SCOPES,
            ),
            ProviderKind::QuickBooks => {
                let api = match settings.environment {
                    Environment::Production => QB_PRODUCTION_API_URL,
                    Environment::Sandbox => QB_SANDBOX_API_URL,
                };
                (QB_AUTH_URL, QB_TOKEN_URL, QB_REVOKE_URL, api, api, QB_SCOPES)
            }
        };

        let pick = |value: &Option<String>, default: &str| {
            value.clone().unwrap_or_else(|| default.to_string())
        };

        Some(Self {
            kind,
            auth_url: pick(&settings.auth_url, auth_url),
            token_url: pick(&settings.token_url, token_url),
            revoke_url: pick(&settings.revoke_url, revoke_url),
            enrichment_url: pick(&settings.enrichment_url, enrichment_url),
            api_base_url: pick(&settings.api_base_url, api_base_url),
            scopes: settings
                .scopes
                .clone()
                .unwrap_or_else(|| scopes.iter().map(|s| s.to_string()).collect()),
            client_id,
            client_secret,
            redirect_uri: settings
                .redirect_uri
                .clone()
                .unwrap_or_else(|| format!("http://localhost:3000/auth/{}/callback", kind)),
        })
    }

    /// Space-separated scope list, as sent on the consent URL.
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// Build authorization URL with state
    pub fn build_auth_url(&self, state: &str) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&self.scope_string()),
            urlencoding::encode(state)
        )
    }
}

/// OAuth token endpoint response (standard OAuth 2.0 fields).
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Scope metadata fetched right after code exchange.
#[derive(Clone, Debug, PartialEq)]
pub enum Enrichment {
    Tenants(Vec<TenantDescriptor>),
    Company(CompanyInfo),
}

impl Enrichment {
    pub fn apply(self, record: &mut CredentialRecord) {
        match self {
            Enrichment::Tenants(tenants) => record.tenants = tenants,
            Enrichment::Company(company) => record.company = Some(company),
        }
    }
}

/// A downstream API call, relative to the provider's API base.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: reqwest::Method,
    pub path: String,
    pub query: Vec<(String, String)>,
}

/// Upstream answer, kept byte-for-byte.
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network operations against one provider.
///
/// Stateless given the descriptor; callers own persistence.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn kind(&self) -> ProviderKind {
        self.descriptor().kind
    }

    /// Exchanges an authorization code (`grant_type=authorization_code`).
    ///
    /// # Errors
    /// `UpstreamAuth` with the provider's raw error body on non-2xx.
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, BrokerError>;

    /// Redeems a refresh token (`grant_type=refresh_token`).
    ///
    /// # Errors
    /// `UpstreamAuth` with the provider's raw error body on non-2xx.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, BrokerError>;

    /// Best-effort revocation. Failures are logged and reported as `false`.
    async fn revoke(&self, token: &str) -> bool;

    /// Fetches tenant (Xero) or company (QuickBooks) metadata.
    async fn enrich(&self, access_token: &str, scope_id: &str) -> Result<Enrichment, BrokerError>;

    /// Sends a downstream API call scoped to `scope_id`.
    ///
    /// Any HTTP status is a successful call; only transport failures error.
    async fn call_api(
        &self,
        access_token: &str,
        scope_id: &str,
        request: &ApiRequest,
    ) -> Result<UpstreamResponse, BrokerError>;
}
