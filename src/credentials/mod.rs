//! Credential records and their persistence.
//!
//! A [`CredentialRecord`] holds the OAuth tokens for one scope (a Xero
//! connection set or a QuickBooks realm). Records live in a [`TokenStore`],
//! one store per provider.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenStore (trait)                 │
//! │  - get / put / delete per scope          │
//! │  - list_all / delete_all                 │
//! └─────────────────────────────────────────┘
//!          ↓                    ↓
//! ┌──────────────────┐  ┌───────────────────┐
//! │  JsonFileStore   │  │  SqliteTokenStore │
//! │  keyed JSON file │  │  one row / scope  │
//! │  legacy upgrade  │  │  ACID upserts     │
//! └──────────────────┘  └───────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use ledger_broker::credentials::{CredentialRecord, JsonFileStore, TokenStore};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = JsonFileStore::new("qb-tokens.json", None);
//!
//! let record = CredentialRecord {
//!     scope_id: "9130348".to_string(),
//!     access_token: "eyJ...".to_string(),
//!     refresh_token: "AB11...".to_string(),
//!     expires_at: Utc::now() + Duration::hours(1),
//!     token_type: Some("bearer".to_string()),
//!     id_token: None,
//!     tenants: Vec::new(),
//!     company: None,
//! };
//! store.put("9130348", &record)?;
//!
//! if let Some(record) = store.get("9130348")? {
//!     println!("expires at {}", record.expires_at);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Tokens are stored in clear text. This is a local development posture,
//! not a secrets vault.

use crate::provider::{ProviderKind, TokenResponse};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod sqlite;
mod storage;

pub use sqlite::SqliteTokenStore;
pub use storage::{JsonFileStore, TokenStore};

/// Store key used by providers that keep a single record per installation.
pub const SINGLETON_SCOPE: &str = "default";

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECONDS: i64 = 1800;

/// OAuth credentials for one scope of one provider.
///
/// `scope_id`, `tenants` and `company` identify the scope and are carried
/// over unchanged on refresh. Everything else is replaced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Store key. Realm id for QuickBooks, [`SINGLETON_SCOPE`] for Xero.
    #[serde(default, alias = "realmId")]
    pub scope_id: String,

    /// Bearer token for API requests
    pub access_token: String,

    /// Rotating refresh token
    #[serde(default)]
    pub refresh_token: String,

    /// Absolute expiry of `access_token` (UTC)
    #[serde(with = "expiry")]
    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Xero tenants reachable with this grant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<TenantDescriptor>,

    /// QuickBooks company metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<CompanyInfo>,
}

impl CredentialRecord {
    /// Builds a fresh record from a code-exchange response.
    pub fn from_token_response(scope_id: &str, response: TokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            access_token: response.access_token,
            refresh_token: response.refresh_token.unwrap_or_default(),
            expires_at: expiry_after(now, response.expires_in),
            token_type: response.token_type,
            id_token: response.id_token,
            tenants: Vec::new(),
            company: None,
        }
    }

    /// Returns the record that replaces `self` after a successful refresh.
    ///
    /// Scope identity and enrichment metadata are preserved. A provider that
    /// does not rotate the refresh token keeps the previous one.
    pub fn refreshed(&self, response: TokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            scope_id: self.scope_id.clone(),
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .unwrap_or_else(|| self.refresh_token.clone()),
            expires_at: expiry_after(now, response.expires_in),
            token_type: response.token_type.or_else(|| self.token_type.clone()),
            id_token: response.id_token.or_else(|| self.id_token.clone()),
            tenants: self.tenants.clone(),
            company: self.company.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True once `now` is within `skew` of expiry (or past it).
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now >= self.expires_at - skew
    }

    /// Public, token-free description of the scope.
    pub fn summary(&self, provider: ProviderKind) -> ScopeSummary {
        ScopeSummary {
            provider,
            scope_id: self.scope_id.clone(),
            tenants: self.tenants.clone(),
            company: self.company.clone(),
        }
    }
}

/// `now + expires_in`, falling back to the default lifetime when the value
/// is missing or out of range.
fn expiry_after(now: DateTime<Utc>, expires_in: Option<i64>) -> DateTime<Utc> {
    let default = Duration::seconds(DEFAULT_EXPIRES_IN_SECONDS);
    expires_in
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(now + default)
}

/// A Xero organisation reachable through a connection.
///
/// Serialized as `{id, name}`. Also reads raw Xero connection objects
/// (`tenantId` / `tenantName`), which earlier files stored verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TenantRepr")]
pub struct TenantDescriptor {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize)]
struct TenantRepr {
    #[serde(default, rename = "tenantId")]
    tenant_id: Option<String>,
    #[serde(default, rename = "tenantName")]
    tenant_name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl From<TenantRepr> for TenantDescriptor {
    fn from(repr: TenantRepr) -> Self {
        // On a raw connection `id` is the connection id, not the tenant
        Self {
            id: repr.tenant_id.or(repr.id).unwrap_or_default(),
            name: repr.tenant_name.or(repr.name).unwrap_or_default(),
        }
    }
}

/// QuickBooks company metadata captured at authorization time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Minimal data handed back to the browser after authorization. Never
/// contains tokens.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSummary {
    pub provider: ProviderKind,
    pub scope_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<TenantDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<CompanyInfo>,
}

/// `expires_at` is written as RFC 3339. Epoch milliseconds (the format of
/// older token files) are accepted on read.
mod expiry {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(i64),
        Float(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Millis(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| D::Error::custom("expires_at out of range")),
            Repr::Float(ms) => DateTime::<Utc>::from_timestamp_millis(ms as i64)
                .ok_or_else(|| D::Error::custom("expires_at out of range")),
            Repr::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(D::Error::custom),
        }
    }
}
