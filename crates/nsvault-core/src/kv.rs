//! KV v2 secrets engine.
//!
//! Stores versioned key/value secrets inside a mount's storage view.
//! Each write creates a new version; reads return the latest live version.
//!
//! Paths relative to the mount:
//! - `data/<key>`: read, write (new version), delete (soft-delete latest)
//! - `metadata/<key>`: read, delete (all versions)
//! - `metadata/<prefix>`: list immediate children, folders end in `/`
//! - `config`: read/write `max_versions`
//!
//! Storage layout inside the view: `data/<key>` holds a [`KvSecret`] with
//! every retained version, `config` holds the mount configuration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::EngineError;
use crate::request::{Operation, Payload};
use crate::view::{StorageView, immediate_children};

/// Versions kept per secret unless configured otherwise.
pub const DEFAULT_MAX_VERSIONS: u32 = 10;

/// Stored secret with version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvSecret {
    /// Retained versions keyed by version number.
    versions: BTreeMap<u32, KvVersion>,
    /// Latest version number.
    current_version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A single version of a secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvVersion {
    data: Payload,
    created_at: DateTime<Utc>,
    /// Set by a soft delete.
    deleted_at: Option<DateTime<Utc>>,
}

/// Mount-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvConfig {
    max_versions: u32,
}

/// A parsed engine path.
enum KvPath<'a> {
    Data(&'a str),
    Metadata(&'a str),
    Config,
}

impl<'a> KvPath<'a> {
    fn parse(path: &'a str) -> Result<Self, EngineError> {
        let path = path.trim_start_matches('/');
        if path == "config" {
            return Ok(Self::Config);
        }
        if let Some(key) = path.strip_prefix("data/") {
            return Ok(Self::Data(key));
        }
        if path == "metadata" {
            return Ok(Self::Metadata(""));
        }
        if let Some(key) = path.strip_prefix("metadata/") {
            return Ok(Self::Metadata(key));
        }
        Err(EngineError::NotFound {
            path: path.to_owned(),
        })
    }
}

/// KV v2 engine bound to one mount's storage.
pub struct KvEngine {
    view: StorageView,
    default_max_versions: u32,
}

impl KvEngine {
    /// Create an engine over a mount's storage view.
    #[must_use]
    pub fn new(view: StorageView, default_max_versions: u32) -> Self {
        Self {
            view,
            default_max_versions,
        }
    }

    /// Whether a write to `path` would update existing state (as opposed to
    /// creating it). Used to pick between `create` and `update`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if storage fails.
    pub async fn exists(&self, path: &str) -> Result<bool, EngineError> {
        match KvPath::parse(path) {
            Ok(KvPath::Data(key)) => Ok(self
                .load(key)
                .await?
                .is_some_and(|s| latest_live(&s).is_some())),
            Ok(KvPath::Metadata(key)) => Ok(self.load(key).await?.is_some()),
            Ok(KvPath::Config) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Handle a request to this engine.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] for unknown paths or missing secrets.
    /// - [`EngineError::InvalidRequest`] for unsupported operations or bad
    ///   payloads.
    /// - [`EngineError::Store`] if storage fails.
    pub async fn handle(
        &self,
        operation: Operation,
        path: &str,
        data: &Payload,
    ) -> Result<Option<Payload>, EngineError> {
        let unsupported = || EngineError::InvalidRequest {
            reason: format!("{operation} is not supported on '{path}'"),
        };
        match (KvPath::parse(path)?, operation) {
            (KvPath::Data(key), Operation::Read) => self.read(key).await.map(Some),
            (KvPath::Data(key), Operation::Write) => self.write(key, data).await.map(Some),
            (KvPath::Data(key), Operation::Delete) => self.soft_delete(key).await.map(|()| None),
            (KvPath::Metadata(key), Operation::Read) => self.metadata(key).await.map(Some),
            (KvPath::Metadata(prefix), Operation::List) => self.list(prefix).await,
            (KvPath::Metadata(key), Operation::Delete) => {
                self.delete_all(key).await.map(|()| None)
            }
            (KvPath::Config, Operation::Read) => {
                let config = self.config().await?;
                Ok(Some(to_payload(json!({ "max_versions": config.max_versions }))))
            }
            (KvPath::Config, Operation::Write) => self.write_config(data).await.map(|()| None),
            _ => Err(unsupported()),
        }
    }

    async fn load(&self, key: &str) -> Result<Option<KvSecret>, EngineError> {
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self.view.get_json(&format!("data/{key}")).await?)
    }

    async fn config(&self) -> Result<KvConfig, EngineError> {
        Ok(self
            .view
            .get_json("config")
            .await?
            .unwrap_or(KvConfig {
                max_versions: self.default_max_versions,
            }))
    }

    async fn write_config(&self, data: &Payload) -> Result<(), EngineError> {
        let max_versions = data
            .get("max_versions")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| EngineError::InvalidRequest {
                reason: "'max_versions' must be a non-negative integer".to_owned(),
            })?;
        self.view
            .put_json("config", &KvConfig { max_versions })
            .await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Payload, EngineError> {
        let not_found = || EngineError::NotFound {
            path: format!("data/{key}"),
        };
        let secret = self.load(key).await?.ok_or_else(not_found)?;
        let (number, version) = latest_live(&secret).ok_or_else(not_found)?;

        Ok(to_payload(json!({
            "data": version.data,
            "metadata": {
                "version": number,
                "created_time": version.created_at.to_rfc3339(),
                "deletion_time": "",
            }
        })))
    }

    async fn write(&self, key: &str, data: &Payload) -> Result<Payload, EngineError> {
        if key.is_empty() || key.ends_with('/') {
            return Err(EngineError::InvalidRequest {
                reason: "secret path must name a key".to_owned(),
            });
        }
        let Some(Value::Object(kv_data)) = data.get("data") else {
            return Err(EngineError::InvalidRequest {
                reason: "no 'data' object provided".to_owned(),
            });
        };

        let now = Utc::now();
        let mut secret = self.load(key).await?.unwrap_or(KvSecret {
            versions: BTreeMap::new(),
            current_version: 0,
            created_at: now,
            updated_at: now,
        });

        secret.current_version = secret.current_version.saturating_add(1);
        secret.updated_at = now;
        secret.versions.insert(
            secret.current_version,
            KvVersion {
                data: kv_data.clone(),
                created_at: now,
                deleted_at: None,
            },
        );

        let max_versions = self.config().await?.max_versions;
        if max_versions > 0 {
            while secret.versions.len() > max_versions as usize {
                secret.versions.pop_first();
            }
        }

        self.view.put_json(&format!("data/{key}"), &secret).await?;
        debug!(key = %key, version = secret.current_version, "kv secret written");

        Ok(to_payload(json!({
            "version": secret.current_version,
            "created_time": now.to_rfc3339(),
        })))
    }

    async fn soft_delete(&self, key: &str) -> Result<(), EngineError> {
        let Some(mut secret) = self.load(key).await? else {
            return Ok(());
        };
        if let Some(version) = secret.versions.get_mut(&secret.current_version) {
            version.deleted_at.get_or_insert_with(Utc::now);
        }
        self.view.put_json(&format!("data/{key}"), &secret).await?;
        debug!(key = %key, version = secret.current_version, "kv version deleted");
        Ok(())
    }

    async fn delete_all(&self, key: &str) -> Result<(), EngineError> {
        self.view.delete(&format!("data/{key}")).await?;
        debug!(key = %key, "kv metadata deleted");
        Ok(())
    }

    async fn metadata(&self, key: &str) -> Result<Payload, EngineError> {
        let secret = self
            .load(key)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                path: format!("metadata/{key}"),
            })?;
        let config = self.config().await?;

        let versions: serde_json::Map<String, Value> = secret
            .versions
            .iter()
            .map(|(n, v)| {
                (
                    n.to_string(),
                    json!({
                        "created_time": v.created_at.to_rfc3339(),
                        "deletion_time": v.deleted_at.map(|d| d.to_rfc3339()).unwrap_or_default(),
                    }),
                )
            })
            .collect();

        Ok(to_payload(json!({
            "current_version": secret.current_version,
            "oldest_version": secret.versions.keys().next().copied().unwrap_or(0),
            "created_time": secret.created_at.to_rfc3339(),
            "updated_time": secret.updated_at.to_rfc3339(),
            "max_versions": config.max_versions,
            "versions": versions,
        })))
    }

    async fn list(&self, prefix: &str) -> Result<Option<Payload>, EngineError> {
        let prefix = prefix.trim_end_matches('/');
        let storage_prefix = if prefix.is_empty() {
            "data/".to_owned()
        } else {
            format!("data/{prefix}/")
        };
        let keys = self.view.list(&storage_prefix).await?;
        let children = immediate_children(keys.iter().map(String::as_str));
        if children.is_empty() {
            return Ok(None);
        }
        Ok(Some(to_payload(json!({ "keys": children }))))
    }
}

impl std::fmt::Debug for KvEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEngine")
            .field("prefix", &self.view.prefix())
            .finish_non_exhaustive()
    }
}

fn latest_live(secret: &KvSecret) -> Option<(u32, &KvVersion)> {
    secret
        .versions
        .get(&secret.current_version)
        .filter(|v| v.deleted_at.is_none())
        .map(|v| (secret.current_version, v))
}

fn to_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
