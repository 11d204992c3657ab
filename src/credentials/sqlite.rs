//! Credential storage using SQLite.
//!
//! Alternative to the JSON file backend for installations that want ACID
//! upserts instead of whole-file rewrites. Each record is kept as a JSON
//! document so the shape matches the file backend exactly.

use super::storage::TokenStore;
use super::CredentialRecord;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed [`TokenStore`] for one provider.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     provider TEXT NOT NULL,
///     scope_id TEXT NOT NULL,
///     record TEXT NOT NULL,       -- CredentialRecord as JSON
///     expires_at TEXT NOT NULL,   -- ISO 8601 timestamp
///     created_at TEXT NOT NULL,   -- ISO 8601 timestamp
///     updated_at TEXT NOT NULL,   -- ISO 8601 timestamp
///     PRIMARY KEY(provider, scope_id)
/// );
/// ```
///
/// Several providers can share one database file; every query is filtered
/// by the provider this store was opened for.
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
    provider: String,
}

impl SqliteTokenStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `provider` - Provider name used to partition the table
    pub fn new<P: AsRef<Path>>(db_path: P, provider: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                provider TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                record TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY(provider, scope_id)
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            provider: provider.to_string(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("credential database lock poisoned"))
    }
}

fn decode(scope_id: &str, json: &str) -> Result<CredentialRecord> {
    let mut record: CredentialRecord = serde_json::from_str(json)
        .with_context(|| format!("Failed to decode token record '{}'", scope_id))?;
    if record.scope_id.is_empty() {
        record.scope_id = scope_id.to_string();
    }
    Ok(record)
}

impl TokenStore for SqliteTokenStore {
    fn get(&self, scope_id: &str) -> Result<Option<CredentialRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT record FROM credentials WHERE provider = ?1 AND scope_id = ?2")
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![self.provider, scope_id])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => {
                let json: String = row.get(0)?;
                Ok(Some(decode(scope_id, &json)?))
            }
            None => Ok(None),
        }
    }

    fn put(&self, scope_id: &str, record: &CredentialRecord) -> Result<()> {
        let mut record = record.clone();
        record.scope_id = scope_id.to_string();
        let json = serde_json::to_string(&record).context("Failed to serialize token record")?;
        let now = Utc::now().to_rfc3339();

        self.conn()?
            .execute(
                r#"
                INSERT INTO credentials (provider, scope_id, record, expires_at, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                ON CONFLICT(provider, scope_id) DO UPDATE SET
                    record = excluded.record,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    self.provider,
                    scope_id,
                    json,
                    record.expires_at.to_rfc3339(),
                    now,
                ],
            )
            .context("Failed to store credentials")?;

        Ok(())
    }

    fn delete(&self, scope_id: &str) -> Result<bool> {
        let rows_affected = self
            .conn()?
            .execute(
                "DELETE FROM credentials WHERE provider = ?1 AND scope_id = ?2",
                params![self.provider, scope_id],
            )
            .context("Failed to delete credentials")?;

        Ok(rows_affected > 0)
    }

    fn list_all(&self) -> Result<Vec<CredentialRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT scope_id, record FROM credentials WHERE provider = ?1 ORDER BY scope_id")
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params![self.provider], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to execute query")?
            .collect::<Result<Vec<(String, String)>, _>>()
            .context("Failed to read results")?;

        rows.iter()
            .map(|(scope_id, json)| decode(scope_id, json))
            .collect()
    }

    fn delete_all(&self) -> Result<usize> {
        let rows_affected = self
            .conn()?
            .execute(
                "DELETE FROM credentials WHERE provider = ?1",
                params![self.provider],
            )
            .context("Failed to delete credentials")?;

        Ok(rows_affected)
    }
}
