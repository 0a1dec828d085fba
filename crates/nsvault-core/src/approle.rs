//! AppRole authentication method for `nsvault`.
//!
//! Provides machine-to-machine authentication using role IDs and secret IDs.
//! An operator creates a role with policies, reads its role ID, generates
//! secret IDs, and distributes them to applications. Applications exchange a
//! `(role_id, secret_id)` pair for a token minted in the namespace that owns
//! the mount.
//!
//! Storage layout inside the mount's view:
//! - `role/<name>`: the [`AppRole`] definition
//! - `role-id/<role_id>`: role name (login index)
//! - `secret-id/<name>/<sha256(secret_id)>`: [`SecretIdEntry`]
//! - `accessor/<name>/<accessor>`: secret ID hash

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::AppRoleError;
use crate::view::StorageView;

/// An AppRole role definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRole {
    /// Role name (lowercase).
    pub name: String,
    /// Stable role ID.
    pub role_id: String,
    /// Policies attached to tokens issued via this role.
    pub policies: Vec<String>,
    /// Token TTL in seconds (0 = engine default).
    pub token_ttl_secs: i64,
    /// Token max TTL in seconds (0 = engine default).
    pub token_max_ttl_secs: i64,
    /// Whether a secret ID is required at login.
    pub bind_secret_id: bool,
    /// Uses per generated secret ID (0 = unlimited).
    pub secret_id_num_uses: u32,
    /// Secret ID TTL in seconds (0 = no expiry).
    pub secret_id_ttl_secs: i64,
}

/// Fields accepted when creating or updating a role. `None` keeps the
/// current value (or the default for a new role).
#[derive(Debug, Clone, Default)]
pub struct RoleParams {
    /// Token policies.
    pub policies: Option<Vec<String>>,
    /// Token TTL in seconds.
    pub token_ttl_secs: Option<i64>,
    /// Token max TTL in seconds.
    pub token_max_ttl_secs: Option<i64>,
    /// Require a secret ID at login.
    pub bind_secret_id: Option<bool>,
    /// Uses per secret ID.
    pub secret_id_num_uses: Option<u32>,
    /// Secret ID TTL in seconds.
    pub secret_id_ttl_secs: Option<i64>,
}

/// A generated secret ID entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretIdEntry {
    /// SHA-256 of the secret ID.
    pub secret_id_hash: String,
    /// Non-secret handle for the secret ID.
    pub accessor: String,
    /// Role this secret ID belongs to.
    pub role_name: String,
    /// Remaining uses (0 = unlimited).
    pub num_uses_left: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry (`None` = never).
    pub expires_at: Option<DateTime<Utc>>,
}

/// A freshly generated secret ID.
#[derive(Debug, Clone)]
pub struct IssuedSecretId {
    /// The plaintext secret ID (returned once).
    pub secret_id: String,
    /// Its accessor.
    pub accessor: String,
    /// Seconds until expiry (0 = never).
    pub ttl_secs: i64,
}

/// The AppRole store of one mount.
pub struct AppRoleStore {
    view: StorageView,
}

impl AppRoleStore {
    /// Create a store over a mount's storage view.
    #[must_use]
    pub fn new(view: StorageView) -> Self {
        Self { view }
    }

    fn role_key(name: &str) -> String {
        format!("role/{name}")
    }

    fn secret_id_key(role_name: &str, hash: &str) -> String {
        format!("secret-id/{role_name}/{hash}")
    }

    fn hash_secret_id(secret_id: &str) -> String {
        hex::encode(Sha256::digest(secret_id.as_bytes()))
    }

    /// Create a role or update an existing one.
    ///
    /// # Errors
    ///
    /// - [`AppRoleError::InvalidConfig`] for a bad name or negative TTLs.
    /// - [`AppRoleError::Store`] if storage fails.
    pub async fn write_role(&self, name: &str, params: RoleParams) -> Result<AppRole, AppRoleError> {
        let name = normalize_name(name)?;
        let existing = self.view.get_json::<AppRole>(&Self::role_key(&name)).await?;

        let mut role = existing.clone().unwrap_or_else(|| AppRole {
            name: name.clone(),
            role_id: uuid::Uuid::new_v4().to_string(),
            policies: Vec::new(),
            token_ttl_secs: 0,
            token_max_ttl_secs: 0,
            bind_secret_id: true,
            secret_id_num_uses: 0,
            secret_id_ttl_secs: 0,
        });
        if let Some(policies) = params.policies {
            role.policies = policies;
        }
        if let Some(v) = params.token_ttl_secs {
            role.token_ttl_secs = v;
        }
        if let Some(v) = params.token_max_ttl_secs {
            role.token_max_ttl_secs = v;
        }
        if let Some(v) = params.bind_secret_id {
            role.bind_secret_id = v;
        }
        if let Some(v) = params.secret_id_num_uses {
            role.secret_id_num_uses = v;
        }
        if let Some(v) = params.secret_id_ttl_secs {
            role.secret_id_ttl_secs = v;
        }
        if role.token_ttl_secs < 0 || role.token_max_ttl_secs < 0 || role.secret_id_ttl_secs < 0 {
            return Err(AppRoleError::InvalidConfig {
                reason: "TTLs cannot be negative".to_owned(),
            });
        }

        self.view.put_json(&Self::role_key(&name), &role).await?;
        if existing.is_none() {
            self.view
                .put(&format!("role-id/{}", role.role_id), name.as_bytes())
                .await?;
            info!(role = %name, policies = ?role.policies, "approle role created");
        } else {
            info!(role = %name, policies = ?role.policies, "approle role updated");
        }
        Ok(role)
    }

    /// Get a role by name.
    ///
    /// # Errors
    ///
    /// - [`AppRoleError::RoleNotFound`] if the role does not exist.
    /// - [`AppRoleError::Store`] if storage fails.
    pub async fn get_role(&self, name: &str) -> Result<AppRole, AppRoleError> {
        let name = normalize_name(name)?;
        self.view
            .get_json(&Self::role_key(&name))
            .await?
            .ok_or(AppRoleError::RoleNotFound { name })
    }

    /// Whether a role exists.
    ///
    /// # Errors
    ///
    /// Returns [`AppRoleError::Store`] if storage fails.
    pub async fn role_exists(&self, name: &str) -> Result<bool, AppRoleError> {
        let name = normalize_name(name)?;
        Ok(self.view.exists(&Self::role_key(&name)).await?)
    }

    /// Delete a role with its role-id index and all its secret IDs.
    ///
    /// # Errors
    ///
    /// - [`AppRoleError::RoleNotFound`] if the role does not exist.
    /// - [`AppRoleError::Store`] if storage fails.
    pub async fn delete_role(&self, name: &str) -> Result<(), AppRoleError> {
        let role = self.get_role(name).await?;

        self.view.delete(&Self::role_key(&role.name)).await?;
        self.view.delete(&format!("role-id/{}", role.role_id)).await?;
        for area in ["secret-id", "accessor"] {
            let prefix = format!("{area}/{}/", role.name);
            for key in self.view.list(&prefix).await? {
                self.view.delete(&format!("{prefix}{key}")).await?;
            }
        }

        info!(role = %role.name, "approle role deleted");
        Ok(())
    }

    /// List all role names, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`AppRoleError::Store`] if storage fails.
    pub async fn list_roles(&self) -> Result<Vec<String>, AppRoleError> {
        Ok(self.view.list("role/").await?)
    }

    /// The role ID of a named role.
    ///
    /// # Errors
    ///
    /// - [`AppRoleError::RoleNotFound`] if the role does not exist.
    /// - [`AppRoleError::Store`] if storage fails.
    pub async fn get_role_id(&self, name: &str) -> Result<String, AppRoleError> {
        Ok(self.get_role(name).await?.role_id)
    }

    /// Generate a new secret ID for a role.
    ///
    /// # Errors
    ///
    /// - [`AppRoleError::RoleNotFound`] if the role does not exist.
    /// - [`AppRoleError::Store`] if storage fails.
    pub async fn generate_secret_id(&self, role_name: &str) -> Result<IssuedSecretId, AppRoleError> {
        let role = self.get_role(role_name).await?;
        let secret_id = uuid::Uuid::new_v4().to_string();
        let accessor = uuid::Uuid::new_v4().to_string();
        let hash = Self::hash_secret_id(&secret_id);
        let now = Utc::now();

        let entry = SecretIdEntry {
            secret_id_hash: hash.clone(),
            accessor: accessor.clone(),
            role_name: role.name.clone(),
            num_uses_left: role.secret_id_num_uses,
            created_at: now,
            expires_at: (role.secret_id_ttl_secs > 0)
                .then(|| now + Duration::seconds(role.secret_id_ttl_secs)),
        };

        self.view
            .put_json(&Self::secret_id_key(&role.name, &hash), &entry)
            .await?;
        self.view
            .put(&format!("accessor/{}/{accessor}", role.name), hash.as_bytes())
            .await?;

        info!(role = %role.name, accessor = %accessor, "approle secret id generated");

        Ok(IssuedSecretId {
            secret_id,
            accessor,
            ttl_secs: role.secret_id_ttl_secs,
        })
    }

    /// Look up a secret ID's metadata.
    ///
    /// # Errors
    ///
    /// - [`AppRoleError::RoleNotFound`] if the role does not exist.
    /// - [`AppRoleError::InvalidSecretId`] if the secret ID is unknown.
    /// - [`AppRoleError::Store`] if storage fails.
    pub async fn lookup_secret_id(
        &self,
        role_name: &str,
        secret_id: &str,
    ) -> Result<SecretIdEntry, AppRoleError> {
        let role = self.get_role(role_name).await?;
        let key = Self::secret_id_key(&role.name, &Self::hash_secret_id(secret_id));
        self.view
            .get_json(&key)
            .await?
            .ok_or(AppRoleError::InvalidSecretId {
                role_name: role.name,
            })
    }

    /// Accessors of a role's live secret IDs.
    ///
    /// # Errors
    ///
    /// - [`AppRoleError::RoleNotFound`] if the role does not exist.
    /// - [`AppRoleError::Store`] if storage fails.
    pub async fn list_secret_id_accessors(&self, role_name: &str) -> Result<Vec<String>, AppRoleError> {
        let role = self.get_role(role_name).await?;
        Ok(self.view.list(&format!("accessor/{}/", role.name)).await?)
    }

    /// Destroy a secret ID. Destroying an unknown secret ID is not an error.
    ///
    /// # Errors
    ///
    /// - [`AppRoleError::RoleNotFound`] if the role does not exist.
    /// - [`AppRoleError::Store`] if storage fails.
    pub async fn destroy_secret_id(&self, role_name: &str, secret_id: &str) -> Result<(), AppRoleError> {
        let role = self.get_role(role_name).await?;
        let key = Self::secret_id_key(&role.name, &Self::hash_secret_id(secret_id));
        if let Some(entry) = self.view.get_json::<SecretIdEntry>(&key).await? {
            self.remove_secret_id(&entry).await?;
            info!(role = %role.name, accessor = %entry.accessor, "approle secret id destroyed");
        }
        Ok(())
    }

    async fn remove_secret_id(&self, entry: &SecretIdEntry) -> Result<(), AppRoleError> {
        self.view
            .delete(&Self::secret_id_key(&entry.role_name, &entry.secret_id_hash))
            .await?;
        self.view
            .delete(&format!("accessor/{}/{}", entry.role_name, entry.accessor))
            .await?;
        Ok(())
    }

    /// Validate a `(role_id, secret_id)` pair and return the role to mint a
    /// token for. Limited-use secret IDs are consumed.
    ///
    /// # Errors
    ///
    /// - [`AppRoleError::InvalidRoleId`] if no role on this mount has the ID.
    /// - [`AppRoleError::InvalidSecretId`] if the secret ID is unknown,
    ///   destroyed, used up or expired.
    /// - [`AppRoleError::Store`] if storage fails.
    pub async fn login(&self, role_id: &str, secret_id: &str) -> Result<AppRole, AppRoleError> {
        let role = self.find_role_by_id(role_id).await?;

        if role.bind_secret_id {
            let invalid = || AppRoleError::InvalidSecretId {
                role_name: role.name.clone(),
            };
            let key = Self::secret_id_key(&role.name, &Self::hash_secret_id(secret_id));
            let Some(mut entry) = self.view.get_json::<SecretIdEntry>(&key).await? else {
                warn!(role = %role.name, "approle login with invalid secret id");
                return Err(invalid());
            };

            if entry.expires_at.is_some_and(|at| Utc::now() > at) {
                self.remove_secret_id(&entry).await?;
                warn!(role = %role.name, "approle login with expired secret id");
                return Err(invalid());
            }

            if entry.num_uses_left > 0 {
                entry.num_uses_left -= 1;
                if entry.num_uses_left == 0 {
                    self.remove_secret_id(&entry).await?;
                } else {
                    self.view.put_json(&key, &entry).await?;
                }
            }
        }

        info!(role = %role.name, "approle login");
        Ok(role)
    }

    async fn find_role_by_id(&self, role_id: &str) -> Result<AppRole, AppRoleError> {
        if role_id.is_empty() {
            return Err(AppRoleError::InvalidRoleId);
        }
        let name = self
            .view
            .get(&format!("role-id/{role_id}"))
            .await?
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or(AppRoleError::InvalidRoleId)?;
        self.view
            .get_json(&Self::role_key(&name))
            .await?
            .ok_or(AppRoleError::InvalidRoleId)
    }
}

impl std::fmt::Debug for AppRoleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppRoleStore").finish_non_exhaustive()
    }
}

fn normalize_name(name: &str) -> Result<String, AppRoleError> {
    let name = name.trim();
    if name.is_empty() || name.contains('/') {
        return Err(AppRoleError::InvalidConfig {
            reason: format!("invalid role name '{name}'"),
        });
    }
    Ok(name.to_lowercase())
}
