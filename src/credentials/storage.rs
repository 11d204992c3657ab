//! Keyed JSON credential storage.
//!
//! One file per provider, shaped `{ "<scope_id>": CredentialRecord, ... }`.
//! Every operation loads the whole collection, touches one entry and writes
//! the whole collection back. Fine for dozens of scopes.

use super::CredentialRecord;
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Durable keyed persistence of credential records.
///
/// Providers with a single record per installation address it with
/// [`super::SINGLETON_SCOPE`].
pub trait TokenStore: Send + Sync {
    /// Returns the record for `scope_id`, if any.
    fn get(&self, scope_id: &str) -> Result<Option<CredentialRecord>>;

    /// Inserts or replaces the record for `scope_id`.
    fn put(&self, scope_id: &str, record: &CredentialRecord) -> Result<()>;

    /// Removes the record for `scope_id`. Returns false if there was none.
    fn delete(&self, scope_id: &str) -> Result<bool>;

    /// All records, ordered by scope id.
    fn list_all(&self) -> Result<Vec<CredentialRecord>>;

    /// Removes every record. Returns how many were removed.
    fn delete_all(&self) -> Result<usize>;
}

type Collection = BTreeMap<String, CredentialRecord>;

/// [`TokenStore`] backed by a single JSON file.
///
/// # Legacy shapes
/// Two older layouts are upgraded to the keyed layout the first time the
/// file is read:
/// - a flat record (`{"access_token": ..., "realmId": ...}`), keyed under its
///   `realmId`, or under `default_scope` when it has none
/// - a `{"realms": {...}}` wrapper around the keyed map
///
/// # Durability
/// Writes go to a sibling `.tmp` file which is fsynced and renamed over the
/// original, so a crash mid-write leaves the previous collection intact.
pub struct JsonFileStore {
    path: PathBuf,
    default_scope: Option<String>,
    // Serializes load-mutate-write cycles within this process
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Creates a store over `path`. The file is created on first write.
    ///
    /// # Arguments
    /// * `path` - Location of the JSON file
    /// * `default_scope` - Key given to a legacy flat record that carries no
    ///   scope id of its own
    pub fn new<P: AsRef<Path>>(path: P, default_scope: Option<&str>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            default_scope: default_scope.map(|s| s.to_string()),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_collection<T>(&self, f: impl FnOnce(&mut Collection) -> (T, bool)) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("token store lock poisoned"))?;

        let mut collection = self.load()?;
        let (result, dirty) = f(&mut collection);
        if dirty {
            self.save(&collection)?;
        }
        Ok(result)
    }

    fn load(&self) -> Result<Collection> {
        if !self.path.exists() {
            return Ok(Collection::new());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read token file {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Collection::new());
        }

        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse token file {}", self.path.display()))?;

        let (collection, migrated) = self.decode(value)?;
        if migrated {
            info!(
                path = %self.path.display(),
                scopes = collection.len(),
                "Upgrading legacy token file to keyed layout"
            );
            self.save(&collection)?;
        }

        Ok(collection)
    }

    /// Decodes any supported layout. The flag is true when the input was a
    /// legacy layout and must be rewritten.
    fn decode(&self, value: Value) -> Result<(Collection, bool)> {
        let Value::Object(mut object) = value else {
            bail!("Token file {} is not a JSON object", self.path.display());
        };

        if object.contains_key("access_token") {
            let mut record: CredentialRecord = serde_json::from_value(Value::Object(object))
                .context("Failed to decode legacy token record")?;

            let scope_id = if record.scope_id.is_empty() {
                self.default_scope.clone().ok_or_else(|| {
                    anyhow!(
                        "Legacy token record in {} has no scope id",
                        self.path.display()
                    )
                })?
            } else {
                record.scope_id.clone()
            };
            record.scope_id = scope_id.clone();

            let mut collection = Collection::new();
            collection.insert(scope_id, record);
            return Ok((collection, true));
        }

        let wrapped = object.len() == 1 && matches!(object.get("realms"), Some(Value::Object(_)));
        let (entries, migrated) = match object.remove("realms") {
            Some(Value::Object(realms)) if wrapped => (realms, true),
            Some(other) => {
                object.insert("realms".to_string(), other);
                (object, false)
            }
            None => (object, false),
        };

        let mut collection = Collection::new();
        for (scope_id, entry) in entries {
            let mut record: CredentialRecord = serde_json::from_value(entry)
                .with_context(|| format!("Failed to decode token record '{}'", scope_id))?;
            if record.scope_id.is_empty() {
                record.scope_id = scope_id.clone();
            }
            collection.insert(scope_id, record);
        }

        Ok((collection, migrated))
    }

    fn save(&self, collection: &Collection) -> Result<()> {
        let json = serde_json::to_string_pretty(collection)
            .context("Failed to serialize token collection")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create token directory")?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp_file =
                File::create(&tmp_path).context("Failed to create temporary token file")?;
            tmp_file
                .write_all(json.as_bytes())
                .context("Failed to write token file")?;
            tmp_file
                .sync_all()
                .context("Failed to sync token file to disk")?;
        }

        fs::rename(&tmp_path, &self.path).context("Failed to rename temporary token file")?;

        debug!(path = %self.path.display(), scopes = collection.len(), "Token file written");
        Ok(())
    }
}

impl TokenStore for JsonFileStore {
    fn get(&self, scope_id: &str) -> Result<Option<CredentialRecord>> {
        self.with_collection(|collection| (collection.get(scope_id).cloned(), false))
    }

    fn put(&self, scope_id: &str, record: &CredentialRecord) -> Result<()> {
        let mut record = record.clone();
        record.scope_id = scope_id.to_string();
        self.with_collection(|collection| {
            collection.insert(scope_id.to_string(), record);
            ((), true)
        })
    }

    fn delete(&self, scope_id: &str) -> Result<bool> {
        self.with_collection(|collection| {
            let removed = collection.remove(scope_id).is_some();
            (removed, removed)
        })
    }

    fn list_all(&self) -> Result<Vec<CredentialRecord>> {
        self.with_collection(|collection| (collection.values().cloned().collect(), false))
    }

    fn delete_all(&self) -> Result<usize> {
        self.with_collection(|collection| {
            let count = collection.len();
            collection.clear();
            (count, count > 0)
        })
    }
}
