//! Auth methods as a closed set of variants.
//!
//! Every auth mount resolves to one [`AuthMethod`]. Each variant owns only
//! its own credential store; [`AuthMethod::authenticate`] turns presented
//! [`Credentials`] into the policy set and lifetimes of the token to mint.
//! Minting itself is left to the caller, which knows the namespace and mount.

use std::collections::BTreeMap;

use crate::approle::AppRoleStore;
use crate::error::RequestError;
use crate::mount::{EngineType, MountEntry};
use crate::userpass::UserpassStore;
use crate::view::StorageView;

/// Credentials presented at a login endpoint.
#[derive(Clone, Copy)]
pub enum Credentials<'a> {
    /// AppRole `(role_id, secret_id)` pair.
    AppRole { role_id: &'a str, secret_id: &'a str },
    /// Username and password.
    Userpass { username: &'a str, password: &'a str },
}

impl std::fmt::Debug for Credentials<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AppRole { .. } => f.write_str("Credentials::AppRole"),
            Self::Userpass { username, .. } => f
                .debug_struct("Credentials::Userpass")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// What a successful authentication grants.
#[derive(Debug, Clone)]
pub struct Authenticated {
    /// Policies for the new token (before normalization).
    pub policies: Vec<String>,
    /// Requested token TTL in seconds (0 = engine default).
    pub ttl_secs: i64,
    /// Requested max TTL in seconds (0 = engine default).
    pub max_ttl_secs: i64,
    /// Display name for the new token.
    pub display_name: String,
    /// Metadata for the new token.
    pub meta: BTreeMap<String, String>,
}

/// An auth mount's backend.
#[derive(Debug)]
pub enum AuthMethod {
    /// The built-in token method. Tokens are minted through
    /// `auth/token/create`, never by login.
    Token,
    /// AppRole.
    AppRole(AppRoleStore),
    /// Userpass.
    Userpass(UserpassStore),
}

impl AuthMethod {
    /// The backend for an auth mount, over that mount's storage view.
    /// Returns `None` for secret engine mounts.
    #[must_use]
    pub fn for_mount(entry: &MountEntry, view: StorageView) -> Option<Self> {
        match entry.engine_type {
            EngineType::Token => Some(Self::Token),
            EngineType::Approle => Some(Self::AppRole(AppRoleStore::new(view))),
            EngineType::Userpass => Some(Self::Userpass(UserpassStore::new(view))),
            EngineType::KvV2 => None,
        }
    }

    /// Whether `path` (relative to the mount) is this method's login
    /// endpoint, which is served without a client token.
    #[must_use]
    pub fn is_login_path(&self, path: &str) -> bool {
        match self {
            Self::Token => false,
            Self::AppRole(_) => path == "login",
            Self::Userpass(_) => path
                .strip_prefix("login/")
                .is_some_and(|user| !user.is_empty() && !user.contains('/')),
        }
    }

    /// Verify `credentials` against this method's store.
    ///
    /// # Errors
    ///
    /// - [`RequestError::InvalidRequest`] if the credentials do not belong to
    ///   this method, or the method has no login.
    /// - The method's own error for rejected credentials.
    pub async fn authenticate(&self, credentials: Credentials<'_>) -> Result<Authenticated, RequestError> {
        match (self, credentials) {
            (Self::AppRole(store), Credentials::AppRole { role_id, secret_id }) => {
                let role = store.login(role_id, secret_id).await?;
                Ok(Authenticated {
                    policies: role.policies,
                    ttl_secs: role.token_ttl_secs,
                    max_ttl_secs: role.token_max_ttl_secs,
                    display_name: "approle".to_owned(),
                    meta: BTreeMap::from([("role_name".to_owned(), role.name)]),
                })
            }
            (Self::Userpass(store), Credentials::Userpass { username, password }) => {
                let user = store.login(username, password).await?;
                Ok(Authenticated {
                    policies: user.policies,
                    ttl_secs: user.token_ttl_secs,
                    max_ttl_secs: user.token_max_ttl_secs,
                    display_name: format!("userpass-{}", user.username),
                    meta: BTreeMap::from([("username".to_owned(), user.username)]),
                })
            }
            (Self::Token, _) => Err(RequestError::invalid("the token auth method has no login")),
            _ => Err(RequestError::invalid("credentials do not match this auth method")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use nsvault_storage::MemoryBackend;

    use super::*;
    use crate::approle::RoleParams;
    use crate::error::ErrorKind;
    use crate::userpass::UserParams;

    fn entry(engine_type: EngineType) -> MountEntry {
        MountEntry {
            path: "auth/m/".to_owned(),
            engine_type,
            uuid: "u".to_owned(),
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    fn view() -> StorageView {
        StorageView::new(Arc::new(MemoryBackend::new()), "ns/root/auth/u/")
    }

    #[test]
    fn login_paths_per_method() {
        let approle = AuthMethod::for_mount(&entry(EngineType::Approle), view()).unwrap();
        assert!(approle.is_login_path("login"));
        assert!(!approle.is_login_path("role/x"));

        let userpass = AuthMethod::for_mount(&entry(EngineType::Userpass), view()).unwrap();
        assert!(userpass.is_login_path("login/alice"));
        assert!(!userpass.is_login_path("login/"));
        assert!(!userpass.is_login_path("users/alice"));

        assert!(!AuthMethod::Token.is_login_path("login"));
        assert!(AuthMethod::for_mount(&entry(EngineType::KvV2), view()).is_none());
    }

    #[tokio::test]
    async fn approle_grants_role_policies() {
        let store = AppRoleStore::new(view());
        store
            .write_role(
                "myrole",
                RoleParams {
                    policies: Some(vec!["readpolicy".to_owned()]),
                    ..RoleParams::default()
                },
            )
            .await
            .unwrap();
        let role_id = store.get_role_id("myrole").await.unwrap();
        let secret = store.generate_secret_id("myrole").await.unwrap();

        let method = AuthMethod::AppRole(store);
        let granted = method
            .authenticate(Credentials::AppRole {
                role_id: &role_id,
                secret_id: &secret.secret_id,
            })
            .await
            .unwrap();
        assert_eq!(granted.policies, vec!["readpolicy"]);
        assert_eq!(granted.meta["role_name"], "myrole");
    }

    #[tokio::test]
    async fn mismatched_credentials_are_rejected() {
        let store = UserpassStore::new(view());
        store
            .write_user(
                "alice",
                UserParams {
                    password: Some("pw".to_owned()),
                    ..UserParams::default()
                },
            )
            .await
            .unwrap();
        let method = AuthMethod::Userpass(store);

        let err = method
            .authenticate(Credentials::AppRole {
                role_id: "r",
                secret_id: "s",
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = method
            .authenticate(Credentials::Userpass {
                username: "alice",
                password: "wrong",
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
    }
}
