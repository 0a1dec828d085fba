//! Userpass authentication method for `nsvault`.
//!
//! Users are stored per mount under `user/<name>`. Passwords are never kept
//! in plaintext: each user gets a random salt and the stored value is
//! `HMAC-SHA256(salt, password)`, compared in constant time at login.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::UserpassError;
use crate::view::StorageView;

type HmacSha256 = Hmac<Sha256>;

/// A stored user.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserEntry {
    /// Lowercase username.
    pub username: String,
    /// Hex-encoded salt.
    salt: String,
    /// Hex-encoded `HMAC-SHA256(salt, password)`.
    password_hash: String,
    /// Token policies.
    pub policies: Vec<String>,
    /// Token TTL in seconds (0 = engine default).
    pub token_ttl_secs: i64,
    /// Token max TTL in seconds (0 = engine default).
    pub token_max_ttl_secs: i64,
}

impl std::fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEntry")
            .field("username", &self.username)
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

/// Fields accepted when creating or updating a user. `None` keeps the
/// current value.
#[derive(Clone, Default)]
pub struct UserParams {
    /// New password (required on creation).
    pub password: Option<String>,
    /// Token policies.
    pub policies: Option<Vec<String>>,
    /// Token TTL in seconds.
    pub token_ttl_secs: Option<i64>,
    /// Token max TTL in seconds.
    pub token_max_ttl_secs: Option<i64>,
}

impl std::fmt::Debug for UserParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserParams")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

/// The userpass store of one mount.
pub struct UserpassStore {
    view: StorageView,
}

impl UserpassStore {
    /// Create a store over a mount's storage view.
    #[must_use]
    pub fn new(view: StorageView) -> Self {
        Self { view }
    }

    fn user_key(name: &str) -> String {
        format!("user/{name}")
    }

    /// Create a user or update an existing one.
    ///
    /// # Errors
    ///
    /// - [`UserpassError::InvalidConfig`] for a bad name, a missing password
    ///   on creation, or negative TTLs.
    /// - [`UserpassError::Store`] if storage fails.
    pub async fn write_user(&self, username: &str, params: UserParams) -> Result<UserEntry, UserpassError> {
        let username = normalize_username(username)?;
        let existing = self.view.get_json::<UserEntry>(&Self::user_key(&username)).await?;
        let created = existing.is_none();

        let mut user = match (existing, params.password.as_deref()) {
            (Some(user), _) => user,
            (None, Some(_)) => UserEntry {
                username: username.clone(),
                salt: String::new(),
                password_hash: String::new(),
                policies: Vec::new(),
                token_ttl_secs: 0,
                token_max_ttl_secs: 0,
            },
            (None, None) => {
                return Err(UserpassError::InvalidConfig {
                    reason: "'password' is required when creating a user".to_owned(),
                });
            }
        };

        if let Some(password) = params.password.as_deref() {
            set_password(&mut user, password)?;
        }
        if let Some(policies) = params.policies {
            user.policies = policies;
        }
        if let Some(v) = params.token_ttl_secs {
            user.token_ttl_secs = v;
        }
        if let Some(v) = params.token_max_ttl_secs {
            user.token_max_ttl_secs = v;
        }
        if user.token_ttl_secs < 0 || user.token_max_ttl_secs < 0 {
            return Err(UserpassError::InvalidConfig {
                reason: "TTLs cannot be negative".to_owned(),
            });
        }

        self.view.put_json(&Self::user_key(&username), &user).await?;
        if created {
            info!(user = %username, policies = ?user.policies, "userpass user created");
        } else {
            info!(user = %username, policies = ?user.policies, "userpass user updated");
        }
        Ok(user)
    }

    /// Get a user by name.
    ///
    /// # Errors
    ///
    /// - [`UserpassError::UserNotFound`] if the user does not exist.
    /// - [`UserpassError::Store`] if storage fails.
    pub async fn get_user(&self, username: &str) -> Result<UserEntry, UserpassError> {
        let username = normalize_username(username)?;
        self.view
            .get_json(&Self::user_key(&username))
            .await?
            .ok_or(UserpassError::UserNotFound { username })
    }

    /// Whether a user exists.
    ///
    /// # Errors
    ///
    /// Returns [`UserpassError::Store`] if storage fails.
    pub async fn user_exists(&self, username: &str) -> Result<bool, UserpassError> {
        let username = normalize_username(username)?;
        Ok(self.view.exists(&Self::user_key(&username)).await?)
    }

    /// Delete a user. Deleting an unknown user is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`UserpassError::Store`] if storage fails.
    pub async fn delete_user(&self, username: &str) -> Result<(), UserpassError> {
        let username = normalize_username(username)?;
        self.view.delete(&Self::user_key(&username)).await?;
        info!(user = %username, "userpass user deleted");
        Ok(())
    }

    /// List all usernames, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`UserpassError::Store`] if storage fails.
    pub async fn list_users(&self) -> Result<Vec<String>, UserpassError> {
        Ok(self.view.list("user/").await?)
    }

    /// Verify a username and password.
    ///
    /// # Errors
    ///
    /// - [`UserpassError::InvalidCredentials`] for an unknown user or a
    ///   wrong password.
    /// - [`UserpassError::Store`] if storage fails.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserEntry, UserpassError> {
        let username = normalize_username(username).map_err(|_| UserpassError::InvalidCredentials)?;
        let Some(user) = self
            .view
            .get_json::<UserEntry>(&Self::user_key(&username))
            .await?
        else {
            warn!(user = %username, "userpass login for unknown user");
            return Err(UserpassError::InvalidCredentials);
        };

        let expected = hex::decode(&user.password_hash).unwrap_or_default();
        let actual = hash_password(&user.salt, password)?;
        if !bool::from(expected.ct_eq(&actual)) {
            warn!(user = %username, "userpass login with wrong password");
            return Err(UserpassError::InvalidCredentials);
        }

        info!(user = %username, "userpass login");
        Ok(user)
    }
}

impl std::fmt::Debug for UserpassStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserpassStore").finish_non_exhaustive()
    }
}

fn set_password(user: &mut UserEntry, password: &str) -> Result<(), UserpassError> {
    if password.is_empty() {
        return Err(UserpassError::InvalidConfig {
            reason: "password cannot be empty".to_owned(),
        });
    }
    let salt = hex::encode(uuid::Uuid::new_v4().as_bytes());
    user.password_hash = hex::encode(hash_password(&salt, password)?);
    user.salt = salt;
    Ok(())
}

fn hash_password(salt: &str, password: &str) -> Result<Vec<u8>, UserpassError> {
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes()).map_err(|e| UserpassError::InvalidConfig {
        reason: format!("password hashing failed: {e}"),
    })?;
    mac.update(password.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn normalize_username(name: &str) -> Result<String, UserpassError> {
    let name = name.trim();
    if name.is_empty() || name.contains('/') {
        return Err(UserpassError::InvalidConfig {
            reason: format!("invalid username '{name}'"),
        });
    }
    Ok(name.to_lowercase())
}
