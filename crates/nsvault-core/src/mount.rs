//! Engine mount tables for `nsvault`.
//!
//! Each namespace has one mount table mapping path prefixes to engine
//! instances. Secret engines live at `<path>/`, auth methods at
//! `auth/<path>/`; sharing one table keeps prefixes unique across both.
//! A request for `secret/data/foo` resolves to the longest mounted prefix
//! (`secret/`) and the remainder (`data/foo`).
//!
//! Tables persist at `ns/<id>/core/mounts` and are cached per namespace.
//! Engine data lives under `ns/<id>/logical/<uuid>/` (secret engines) or
//! `ns/<id>/auth/<uuid>/` (auth methods), so disabling a mount is a single
//! view purge and re-enabling a path starts empty.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::MountError;
use crate::namespace::NamespaceId;
use crate::view::StorageView;

/// Path of the built-in token auth mount.
pub const TOKEN_MOUNT_PATH: &str = "auth/token/";

/// Storage key (inside `ns/<id>/`) of the mount table.
const MOUNT_TABLE_KEY: &str = "core/mounts";

/// Whether a mount serves secrets or authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// Secret engine under `<path>/`.
    Secret,
    /// Auth method under `auth/<path>/`.
    Auth,
}

/// Engine types that can be mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineType {
    /// Versioned key/value secrets.
    KvV2,
    /// AppRole machine authentication.
    Approle,
    /// Username/password authentication.
    Userpass,
    /// The built-in token auth method.
    Token,
}

impl EngineType {
    /// The type name as reported in mount listings.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KvV2 => "kv",
            Self::Approle => "approle",
            Self::Userpass => "userpass",
            Self::Token => "token",
        }
    }

    /// Which table section the engine belongs to.
    #[must_use]
    pub fn kind(self) -> MountKind {
        match self {
            Self::KvV2 => MountKind::Secret,
            Self::Approle | Self::Userpass | Self::Token => MountKind::Auth,
        }
    }

    /// Parse a secret engine type. `kv` requires `version = "2"`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::UnknownEngineType`] for anything else.
    pub fn parse_secret(engine_type: &str, version: Option<&str>) -> Result<Self, MountError> {
        match (engine_type, version) {
            ("kv-v2", _) | ("kv", Some("2")) => Ok(Self::KvV2),
            ("kv", v) => Err(MountError::UnknownEngineType {
                engine_type: format!("kv version {}", v.unwrap_or("1")),
            }),
            (other, _) => Err(MountError::UnknownEngineType {
                engine_type: other.to_owned(),
            }),
        }
    }

    /// Parse an auth method type. `token` cannot be enabled.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::UnknownEngineType`] for unknown types or
    /// [`MountError::Protected`] for `token`.
    pub fn parse_auth(engine_type: &str) -> Result<Self, MountError> {
        match engine_type {
            "approle" => Ok(Self::Approle),
            "userpass" => Ok(Self::Userpass),
            "token" => Err(MountError::Protected {
                path: TOKEN_MOUNT_PATH.to_owned(),
                action: "enabled twice",
            }),
            other => Err(MountError::UnknownEngineType {
                engine_type: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mount entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountEntry {
    /// Full mount path with trailing `/` (`secret/`, `auth/approle/`).
    pub path: String,
    /// The engine type.
    pub engine_type: EngineType,
    /// Unique id naming the mount's storage area.
    pub uuid: String,
    /// Optional description.
    pub description: String,
    /// When the mount was created.
    pub created_at: DateTime<Utc>,
}

impl MountEntry {
    /// Secret or auth.
    #[must_use]
    pub fn kind(&self) -> MountKind {
        self.engine_type.kind()
    }

    /// The path as addressed inside its table section: `approle/` for
    /// `auth/approle/`, unchanged for secret mounts.
    #[must_use]
    pub fn relative_path(&self) -> &str {
        match self.kind() {
            MountKind::Auth => self.path.strip_prefix("auth/").unwrap_or(&self.path),
            MountKind::Secret => &self.path,
        }
    }

    /// JSON summary used in listings and reads.
    #[must_use]
    pub fn describe(&self) -> serde_json::Value {
        let mut info = serde_json::json!({
            "type": self.engine_type.as_str(),
            "description": self.description,
            "uuid": self.uuid,
            "created_time": self.created_at.to_rfc3339(),
        });
        if self.engine_type == EngineType::KvV2 {
            info["options"] = serde_json::json!({ "version": "2" });
        }
        info
    }
}

/// A namespace's mount table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountTable {
    /// Mount entries keyed by full path.
    pub entries: BTreeMap<String, MountEntry>,
}

impl MountTable {
    /// The longest mounted prefix of `path`, with the remainder.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<(&MountEntry, String)> {
        let with_slash = format!("{}/", path.trim_end_matches('/'));
        self.entries
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()) || with_slash == **prefix)
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, entry)| {
                let rest = path.strip_prefix(prefix.as_str()).unwrap_or_default();
                (entry, rest.to_owned())
            })
    }
}

/// Manages the mount tables of every namespace.
pub struct MountManager {
    /// View on `ns/`.
    view: StorageView,
    tables: RwLock<HashMap<NamespaceId, MountTable>>,
}

impl MountManager {
    /// Create a mount manager over the `ns/` storage view.
    #[must_use]
    pub fn new(view: StorageView) -> Self {
        Self {
            view,
            tables: RwLock::new(HashMap::new()),
        }
    }

    fn ns_view(&self, namespace: &NamespaceId) -> StorageView {
        self.view.sub_view(&format!("{namespace}/"))
    }

    /// The namespace's table, loading it on first use. Only stored tables
    /// are cached, so a deleted namespace never re-enters the cache.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Store`] if storage fails.
    pub async fn table(&self, namespace: &NamespaceId) -> Result<MountTable, MountError> {
        if let Some(table) = self.tables.read().await.get(namespace) {
            return Ok(table.clone());
        }
        let Some(table) = self
            .ns_view(namespace)
            .get_json::<MountTable>(MOUNT_TABLE_KEY)
            .await?
        else {
            return Ok(MountTable::default());
        };
        self.tables
            .write()
            .await
            .insert(namespace.clone(), table.clone());
        Ok(table)
    }

    async fn persist(&self, namespace: &NamespaceId, table: MountTable) -> Result<(), MountError> {
        self.ns_view(namespace)
            .put_json(MOUNT_TABLE_KEY, &table)
            .await?;
        self.tables.write().await.insert(namespace.clone(), table);
        Ok(())
    }

    /// Create the namespace's initial table holding only `auth/token/`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Store`] if persistence fails.
    pub async fn seed(&self, namespace: &NamespaceId) -> Result<(), MountError> {
        let mut table = MountTable::default();
        let entry = new_entry(TOKEN_MOUNT_PATH.to_owned(), EngineType::Token, "token based credentials");
        table.entries.insert(entry.path.clone(), entry);
        self.persist(namespace, table).await
    }

    /// Mount an engine. `path` is relative to its section (`secret`,
    /// `approle`); slashes around it are ignored.
    ///
    /// # Errors
    ///
    /// - [`MountError::InvalidPath`] for empty, malformed or reserved paths.
    /// - [`MountError::AlreadyMounted`] if the path overlaps an existing
    ///   mount.
    /// - [`MountError::Store`] if persistence fails.
    pub async fn mount(
        &self,
        namespace: &NamespaceId,
        path: &str,
        engine_type: EngineType,
        description: &str,
    ) -> Result<MountEntry, MountError> {
        let full_path = full_path(engine_type.kind(), path)?;

        let mut table = self.table(namespace).await?;
        if let Some(existing) = table
            .entries
            .keys()
            .find(|p| p.starts_with(&full_path) || full_path.starts_with(p.as_str()))
        {
            return Err(MountError::AlreadyMounted {
                path: existing.clone(),
            });
        }

        let entry = new_entry(full_path.clone(), engine_type, description);
        table.entries.insert(full_path.clone(), entry.clone());
        self.persist(namespace, table).await?;

        info!(namespace = %namespace, path = %full_path, engine_type = %engine_type, "engine mounted");

        Ok(entry)
    }

    /// Remove a mount from the table and purge its storage.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotFound`] if nothing is mounted there.
    /// - [`MountError::Protected`] for the token auth mount.
    /// - [`MountError::Store`] if storage fails.
    pub async fn unmount(
        &self,
        namespace: &NamespaceId,
        kind: MountKind,
        path: &str,
    ) -> Result<MountEntry, MountError> {
        let full_path = full_path(kind, path)?;
        if full_path == TOKEN_MOUNT_PATH {
            return Err(MountError::Protected {
                path: full_path,
                action: "disabled",
            });
        }

        let mut table = self.table(namespace).await?;
        let entry = table
            .entries
            .remove(&full_path)
            .ok_or_else(|| MountError::NotFound {
                path: full_path.clone(),
            })?;
        self.persist(namespace, table).await?;

        let purged = self.data_view(namespace, &entry).clear().await?;

        info!(namespace = %namespace, path = %full_path, purged, "engine unmounted");

        Ok(entry)
    }

    /// A single mount by section-relative path.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotFound`] if nothing is mounted there.
    /// - [`MountError::Store`] if storage fails.
    pub async fn get(
        &self,
        namespace: &NamespaceId,
        kind: MountKind,
        path: &str,
    ) -> Result<MountEntry, MountError> {
        let full_path = full_path(kind, path)?;
        self.table(namespace)
            .await?
            .entries
            .remove(&full_path)
            .ok_or(MountError::NotFound { path: full_path })
    }

    /// Mounts of one kind, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Store`] if storage fails.
    pub async fn list(
        &self,
        namespace: &NamespaceId,
        kind: MountKind,
    ) -> Result<Vec<MountEntry>, MountError> {
        Ok(self
            .table(namespace)
            .await?
            .entries
            .into_values()
            .filter(|e| e.kind() == kind)
            .collect())
    }

    /// Resolve a request path to its mount and the path inside it.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Store`] if storage fails.
    pub async fn resolve(
        &self,
        namespace: &NamespaceId,
        path: &str,
    ) -> Result<Option<(MountEntry, String)>, MountError> {
        let table = self.table(namespace).await?;
        Ok(table
            .resolve(path)
            .map(|(entry, rest)| (entry.clone(), rest)))
    }

    /// The storage area owned by a mount.
    #[must_use]
    pub fn data_view(&self, namespace: &NamespaceId, entry: &MountEntry) -> StorageView {
        let area = match entry.kind() {
            MountKind::Secret => "logical",
            MountKind::Auth => "auth",
        };
        self.ns_view(namespace)
            .sub_view(&format!("{area}/{}/", entry.uuid))
    }

    /// Drop the cached table of a deleted namespace.
    pub async fn forget(&self, namespace: &NamespaceId) {
        self.tables.write().await.remove(namespace);
    }
}

impl fmt::Debug for MountManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountManager").finish_non_exhaustive()
    }
}

fn new_entry(path: String, engine_type: EngineType, description: &str) -> MountEntry {
    MountEntry {
        path,
        engine_type,
        uuid: uuid::Uuid::new_v4().to_string(),
        description: description.to_owned(),
        created_at: Utc::now(),
    }
}

/// Normalize a section-relative path into a full table key.
fn full_path(kind: MountKind, path: &str) -> Result<String, MountError> {
    let invalid = |reason: &str| MountError::InvalidPath {
        reason: reason.to_owned(),
    };
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(invalid("mount path cannot be empty"));
    }
    if trimmed.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
        return Err(invalid("mount path has empty or relative segments"));
    }
    if trimmed.contains(['*', '+']) {
        return Err(invalid("mount path cannot contain wildcards"));
    }
    match kind {
        MountKind::Secret => {
            let first = trimmed.split('/').next().unwrap_or_default();
            if matches!(first, "sys" | "auth") {
                return Err(invalid("secret mounts cannot live under sys/ or auth/"));
            }
            Ok(format!("{trimmed}/"))
        }
        MountKind::Auth => Ok(format!("auth/{trimmed}/")),
    }
}
