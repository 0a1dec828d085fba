//! Token store for `nsvault`.
//!
//! Tokens are the bearer credentials every authenticated request carries.
//! A token belongs to the namespace that minted it and carries a set of
//! policy names resolved against that namespace's policy store.
//!
//! # Security model
//!
//! - Plaintext tokens are `s.<32 hex>` (root namespace) or
//!   `s.<32 hex>.<namespace id>`; the randomness is a UUID v4.
//! - Only `SHA-256(token)` is persisted, under
//!   `sys/tokens/<namespace id>/<hash>`. The plaintext is returned once.
//! - Revoking a token revokes every token it created (tree revocation),
//!   following the `sys/token-children/<parent>/<child>` index, across
//!   namespaces.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::TokenError;
use crate::namespace::NamespaceId;
use crate::policy::{DEFAULT_POLICY, ROOT_POLICY};
use crate::view::StorageView;

/// Prefix (inside `sys/`) for token entries.
const TOKEN_PREFIX: &str = "tokens/";

/// Prefix (inside `sys/`) for the parent→children index.
const TOKEN_CHILDREN_PREFIX: &str = "token-children/";

/// A stored token entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// SHA-256 hash of the token (hex-encoded).
    pub token_hash: String,
    /// The namespace the token was minted in.
    pub namespace_id: NamespaceId,
    /// Normalized policy names.
    pub policies: Vec<String>,
    /// When the token was created.
    pub created_at: DateTime<Utc>,
    /// When the token expires (`None` = never).
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the token can be renewed.
    pub renewable: bool,
    /// Maximum lifetime from creation, in seconds. Renewals stop there.
    pub max_ttl_secs: Option<i64>,
    /// Hash of the token that created this one (`None` for orphans).
    pub parent_hash: Option<String>,
    /// Arbitrary metadata.
    pub meta: BTreeMap<String, String>,
    /// Human-readable label.
    pub display_name: String,
    /// Mount path the token was issued through (e.g. `auth/approle/`).
    pub issued_by: String,
}

impl TokenEntry {
    /// Whether the token carries the `root` policy.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.policies.iter().any(|p| p == ROOT_POLICY)
    }

    /// Seconds until expiry (0 for tokens that never expire).
    #[must_use]
    pub fn ttl_secs(&self) -> i64 {
        self.expires_at
            .map_or(0, |at| (at - Utc::now()).num_seconds().max(0))
    }

    /// A short hash prefix that is safe to log.
    #[must_use]
    pub fn log_id(&self) -> &str {
        hash_prefix(&self.token_hash)
    }
}

/// Parameters for creating a new token.
#[derive(Debug, Clone, Default)]
pub struct CreateTokenParams {
    /// Namespace the token belongs to.
    pub namespace_id: NamespaceId,
    /// Requested policies (normalized by the store).
    pub policies: Vec<String>,
    /// Do not add `default` to the policy set.
    pub no_default_policy: bool,
    /// Time-to-live from now (`None` = never expires).
    pub ttl: Option<Duration>,
    /// Maximum lifetime from now.
    pub max_ttl: Option<Duration>,
    /// Whether the token can be renewed.
    pub renewable: bool,
    /// Parent token hash, for tree revocation.
    pub parent_hash: Option<String>,
    /// Arbitrary metadata.
    pub meta: BTreeMap<String, String>,
    /// Human-readable label.
    pub display_name: String,
    /// Mount path the token is issued through.
    pub issued_by: String,
    /// Use this plaintext instead of generating one (dev root tokens).
    pub id: Option<String>,
}

/// Manages token creation, lookup, renewal and revocation.
pub struct TokenStore {
    /// View on `sys/`.
    view: StorageView,
}

impl TokenStore {
    /// Create a token store over the `sys/` storage view.
    #[must_use]
    pub fn new(view: StorageView) -> Self {
        Self { view }
    }

    fn entry_key(namespace: &NamespaceId, hash: &str) -> String {
        format!("{TOKEN_PREFIX}{namespace}/{hash}")
    }

    /// Create a token and persist its hash.
    ///
    /// Returns the plaintext token (shown once, never stored) and the entry.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if storage fails.
    pub async fn create(
        &self,
        params: CreateTokenParams,
    ) -> Result<(String, TokenEntry), TokenError> {
        let plaintext = params
            .id
            .clone()
            .unwrap_or_else(|| generate_token(&params.namespace_id));
        let token_hash = hash_token(&plaintext);
        let now = Utc::now();

        let entry = TokenEntry {
            token_hash: token_hash.clone(),
            namespace_id: params.namespace_id,
            policies: normalize_policies(&params.policies, params.no_default_policy),
            created_at: now,
            expires_at: params.ttl.map(|ttl| now + ttl),
            renewable: params.renewable,
            max_ttl_secs: params.max_ttl.map(|d| d.num_seconds()),
            parent_hash: params.parent_hash,
            meta: params.meta,
            display_name: params.display_name,
            issued_by: params.issued_by,
        };

        self.view
            .put_json(&Self::entry_key(&entry.namespace_id, &token_hash), &entry)
            .await?;

        if let Some(ref parent) = entry.parent_hash {
            let child_key = format!("{TOKEN_CHILDREN_PREFIX}{parent}/{token_hash}");
            self.view
                .put(&child_key, entry.namespace_id.as_str().as_bytes())
                .await?;
        }

        info!(
            token = %entry.log_id(),
            namespace = %entry.namespace_id,
            display_name = %entry.display_name,
            policies = ?entry.policies,
            "token created"
        );

        Ok((plaintext, entry))
    }

    /// Look up a token by its plaintext value.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if the token doesn't exist or was revoked.
    /// - [`TokenError::Expired`] if the token's TTL has passed.
    /// - [`TokenError::Store`] if storage fails.
    pub async fn lookup(&self, plaintext: &str) -> Result<TokenEntry, TokenError> {
        let namespace = token_namespace(plaintext);
        let entry: TokenEntry = self
            .view
            .get_json(&Self::entry_key(&namespace, &hash_token(plaintext)))
            .await?
            .ok_or(TokenError::NotFound)?;

        if let Some(expires_at) = entry.expires_at {
            if Utc::now() > expires_at {
                return Err(TokenError::Expired {
                    expired_at: expires_at.to_rfc3339(),
                });
            }
        }

        Ok(entry)
    }

    /// Renew a token, extending its TTL by `increment` from now.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] / [`TokenError::Expired`] as for lookup.
    /// - [`TokenError::NotRenewable`] if the token isn't renewable.
    /// - [`TokenError::MaxTtlExceeded`] if the max TTL has been reached.
    /// - [`TokenError::Store`] if storage fails.
    pub async fn renew(
        &self,
        plaintext: &str,
        increment: Duration,
    ) -> Result<TokenEntry, TokenError> {
        let mut entry = self.lookup(plaintext).await?;

        if !entry.renewable {
            return Err(TokenError::NotRenewable);
        }

        let now = Utc::now();
        let mut new_expires = now + increment;

        if let Some(max_ttl_secs) = entry.max_ttl_secs {
            let absolute_max = entry.created_at + Duration::seconds(max_ttl_secs);
            if new_expires > absolute_max {
                if now >= absolute_max {
                    return Err(TokenError::MaxTtlExceeded { max_ttl_secs });
                }
                new_expires = absolute_max;
            }
        }

        entry.expires_at = Some(new_expires);
        self.view
            .put_json(
                &Self::entry_key(&entry.namespace_id, &entry.token_hash),
                &entry,
            )
            .await?;

        info!(token = %entry.log_id(), expires_at = %new_expires, "token renewed");

        Ok(entry)
    }

    /// Revoke a token and all its descendants. Revoking an unknown token is
    /// not an error. Returns how many tokens were removed.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if storage fails.
    pub async fn revoke(&self, plaintext: &str) -> Result<usize, TokenError> {
        let namespace = token_namespace(plaintext);
        let hash = hash_token(plaintext);
        let parent = self
            .view
            .get_json::<TokenEntry>(&Self::entry_key(&namespace, &hash))
            .await?
            .and_then(|e| e.parent_hash);
        if let Some(parent) = parent {
            self.view
                .delete(&format!("{TOKEN_CHILDREN_PREFIX}{parent}/{hash}"))
                .await?;
        }
        self.revoke_tree(&namespace, &hash).await
    }

    /// Revoke a stored entry and its descendants.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if storage fails.
    pub async fn revoke_entry(&self, entry: &TokenEntry) -> Result<usize, TokenError> {
        if let Some(ref parent) = entry.parent_hash {
            self.view
                .delete(&format!(
                    "{TOKEN_CHILDREN_PREFIX}{parent}/{}",
                    entry.token_hash
                ))
                .await?;
        }
        self.revoke_tree(&entry.namespace_id, &entry.token_hash)
            .await
    }

    async fn revoke_tree(&self, namespace: &NamespaceId, hash: &str) -> Result<usize, TokenError> {
        let mut revoked = 0;

        let children_prefix = format!("{TOKEN_CHILDREN_PREFIX}{hash}/");
        for child_hash in self.view.list(&children_prefix).await? {
            let index_key = format!("{children_prefix}{child_hash}");
            let child_ns = self
                .view
                .get(&index_key)
                .await?
                .and_then(|b| String::from_utf8(b).ok())
                .map_or_else(NamespaceId::root, NamespaceId::from);
            revoked += Box::pin(self.revoke_tree(&child_ns, &child_hash)).await?;
            self.view.delete(&index_key).await?;
        }

        let key = Self::entry_key(namespace, hash);
        if self.view.exists(&key).await? {
            self.view.delete(&key).await?;
            revoked += 1;
            info!(token = %hash_prefix(hash), namespace = %namespace, "token revoked");
        }

        Ok(revoked)
    }

    /// Revoke every token owned by a namespace, with their descendants.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if storage fails.
    pub async fn revoke_namespace(&self, namespace: &NamespaceId) -> Result<usize, TokenError> {
        let prefix = format!("{TOKEN_PREFIX}{namespace}/");
        let mut revoked = 0;
        for hash in self.view.list(&prefix).await? {
            if let Some(entry) = self
                .view
                .get_json::<TokenEntry>(&format!("{prefix}{hash}"))
                .await?
            {
                revoked += self.revoke_entry(&entry).await?;
            }
        }
        if revoked > 0 {
            info!(namespace = %namespace, revoked, "namespace tokens revoked");
        }
        Ok(revoked)
    }

    /// Revoke every token in `namespace` issued through `mount_path`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if storage fails.
    pub async fn revoke_issued_by(
        &self,
        namespace: &NamespaceId,
        mount_path: &str,
    ) -> Result<usize, TokenError> {
        let prefix = format!("{TOKEN_PREFIX}{namespace}/");
        let mut revoked = 0;
        for hash in self.view.list(&prefix).await? {
            match self
                .view
                .get_json::<TokenEntry>(&format!("{prefix}{hash}"))
                .await?
            {
                Some(entry) if entry.issued_by == mount_path => {
                    revoked += self.revoke_entry(&entry).await?;
                }
                _ => {}
            }
        }
        if revoked > 0 {
            info!(namespace = %namespace, mount = %mount_path, revoked, "mount tokens revoked");
        }
        Ok(revoked)
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

/// Hash a plaintext token with SHA-256, returning the hex digest.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

fn hash_prefix(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

fn generate_token(namespace: &NamespaceId) -> String {
    let random = uuid::Uuid::new_v4().simple();
    if namespace.is_root() {
        format!("s.{random}")
    } else {
        format!("s.{random}.{namespace}")
    }
}

/// The namespace a plaintext token claims to belong to, from its suffix.
/// Tokens without a suffix (including caller-chosen dev tokens) belong to
/// the root namespace.
#[must_use]
pub fn token_namespace(plaintext: &str) -> NamespaceId {
    plaintext
        .strip_prefix("s.")
        .and_then(|rest| rest.split_once('.'))
        .map_or_else(NamespaceId::root, |(_, ns)| NamespaceId::from(ns))
}

/// Normalize a requested policy set.
///
/// `root` anywhere collapses the set to `["root"]`. Otherwise `default` is
/// added unless `no_default` is set, blanks are dropped, and the result is
/// sorted and de-duplicated.
#[must_use]
pub fn normalize_policies(policies: &[String], no_default: bool) -> Vec<String> {
    let mut out: Vec<String> = policies
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    if out.iter().any(|p| p == ROOT_POLICY) {
        return vec![ROOT_POLICY.to_owned()];
    }
    if !no_default {
        out.push(DEFAULT_POLICY.to_owned());
    }
    out.sort();
    out.dedup();
    out
}
