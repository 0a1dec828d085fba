//! Policy store for `nsvault`.
//!
//! A policy is a named, namespace-scoped list of path rules. Each rule maps a
//! path pattern to a set of capabilities (`read`, `create`, `update`,
//! `delete`, `list`, plus `deny` and `sudo`). Policies are written as text in
//! the rule language parsed by [`crate::policy_parser`] and stored verbatim
//! alongside their parsed rules.
//!
//! Policies never inherit across namespaces: each namespace has its own store
//! under `ns/<id>/sys/policies/acl/`. Two built-ins exist:
//! - `root`: grants everything; cannot be written or deleted.
//! - `default`: seeded into every namespace at creation; may be overwritten
//!   but never deleted.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PolicyError;
use crate::namespace::NamespaceId;
use crate::policy_parser;
use crate::view::StorageView;

/// Name of the built-in superuser policy.
pub const ROOT_POLICY: &str = "root";

/// Name of the per-namespace baseline policy.
pub const DEFAULT_POLICY: &str = "default";

/// Rules the `default` policy is seeded with.
pub const DEFAULT_POLICY_TEXT: &str = r#"
# Allow tokens to look up their own properties
path "auth/token/lookup-self" {
    capabilities = ["read"]
}

# Allow tokens to renew themselves
path "auth/token/renew-self" {
    capabilities = ["update"]
}

# Allow tokens to revoke themselves
path "auth/token/revoke-self" {
    capabilities = ["update"]
}

# Allow a token to look up its own capabilities on a path
path "sys/capabilities-self" {
    capabilities = ["update"]
}
"#;

/// An access capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Read a value.
    Read,
    /// Create a value that does not exist yet.
    Create,
    /// Overwrite an existing value or trigger an action.
    Update,
    /// Delete a value.
    Delete,
    /// List keys under a prefix.
    List,
    /// Privileged operations. Accepted and stored; grants nothing extra here.
    Sudo,
    /// Explicitly deny (overrides everything else on the matched rule).
    Deny,
}

impl Capability {
    /// Lowercase name as written in policies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Sudo => "sudo",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "list" => Ok(Self::List),
            "sudo" => Ok(Self::Sudo),
            "deny" => Ok(Self::Deny),
            other => Err(PolicyError::Invalid {
                reason: format!("unknown capability '{other}'"),
            }),
        }
    }
}

/// A single access rule within a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Path pattern (literal segments, `+` segments, optional trailing `*`).
    pub path: String,
    /// Capabilities granted on matching paths.
    pub capabilities: BTreeSet<Capability>,
}

/// A named policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Policy name, unique within its namespace.
    pub name: String,
    /// The text the policy was written with.
    pub raw: String,
    /// Parsed rules, in declaration order.
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    /// Parse policy text into a named policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] on malformed text or patterns.
    pub fn parse(name: &str, text: &str) -> Result<Self, PolicyError> {
        let rules = policy_parser::parse_rules(text)?;
        if rules.is_empty() {
            return Err(PolicyError::Invalid {
                reason: "policy must contain at least one path rule".to_owned(),
            });
        }
        Ok(Self {
            name: name.to_owned(),
            raw: text.to_owned(),
            rules,
        })
    }
}

/// The built-in `root` policy: every capability on every path.
#[must_use]
pub fn root_policy() -> Policy {
    Policy {
        name: ROOT_POLICY.to_owned(),
        raw: String::new(),
        rules: vec![PolicyRule {
            path: "*".to_owned(),
            capabilities: [
                Capability::Read,
                Capability::Create,
                Capability::Update,
                Capability::Delete,
                Capability::List,
                Capability::Sudo,
            ]
            .into_iter()
            .collect(),
        }],
    }
}

/// Manages policy CRUD for every namespace.
pub struct PolicyStore {
    /// View on `ns/`.
    view: StorageView,
}

impl PolicyStore {
    /// Create a policy store over the `ns/` storage view.
    #[must_use]
    pub fn new(view: StorageView) -> Self {
        Self { view }
    }

    fn ns_view(&self, namespace: &NamespaceId) -> StorageView {
        self.view.sub_view(&format!("{namespace}/sys/policies/acl/"))
    }

    /// Write the `default` policy into a freshly created namespace.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if persistence fails.
    pub async fn seed(&self, namespace: &NamespaceId) -> Result<(), PolicyError> {
        let policy = Policy::parse(DEFAULT_POLICY, DEFAULT_POLICY_TEXT)?;
        self.ns_view(namespace)
            .put_json(DEFAULT_POLICY, &policy)
            .await?;
        debug!(namespace = %namespace, "default policy seeded");
        Ok(())
    }

    /// Parse and store a policy, atomically replacing any previous version.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] when writing `root`.
    /// - [`PolicyError::Invalid`] on a bad name or malformed rule text.
    /// - [`PolicyError::Store`] if persistence fails.
    pub async fn put(
        &self,
        namespace: &NamespaceId,
        name: &str,
        text: &str,
    ) -> Result<Policy, PolicyError> {
        let name = normalize_name(name)?;
        if name == ROOT_POLICY {
            return Err(PolicyError::BuiltIn {
                name,
                action: "modify",
            });
        }

        let policy = Policy::parse(&name, text)?;
        self.ns_view(namespace).put_json(&name, &policy).await?;

        info!(namespace = %namespace, name = %name, rules = policy.rules.len(), "policy written");

        Ok(policy)
    }

    /// Read a policy by name. `root` is synthesized without a storage lookup.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::NotFound`] if the policy doesn't exist.
    /// - [`PolicyError::Store`] if storage fails.
    pub async fn get(&self, namespace: &NamespaceId, name: &str) -> Result<Policy, PolicyError> {
        let name = normalize_name(name)?;
        if name == ROOT_POLICY {
            return Ok(root_policy());
        }
        self.ns_view(namespace)
            .get_json::<Policy>(&name)
            .await?
            .ok_or(PolicyError::NotFound { name })
    }

    /// Whether a policy exists in the namespace.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if storage fails.
    pub async fn exists(&self, namespace: &NamespaceId, name: &str) -> Result<bool, PolicyError> {
        let name = normalize_name(name)?;
        if name == ROOT_POLICY {
            return Ok(true);
        }
        Ok(self.ns_view(namespace).exists(&name).await?)
    }

    /// Delete a policy.
    ///
    /// Tokens that still name the policy keep working; the name simply
    /// contributes no rules from now on.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] for `root` and `default`.
    /// - [`PolicyError::NotFound`] if no such policy exists.
    /// - [`PolicyError::Store`] if storage fails.
    pub async fn delete(&self, namespace: &NamespaceId, name: &str) -> Result<(), PolicyError> {
        let name = normalize_name(name)?;
        if name == ROOT_POLICY || name == DEFAULT_POLICY {
            return Err(PolicyError::BuiltIn {
                name,
                action: "delete",
            });
        }

        let view = self.ns_view(namespace);
        if !view.exists(&name).await? {
            return Err(PolicyError::NotFound { name });
        }
        view.delete(&name).await?;

        info!(namespace = %namespace, name = %name, "policy deleted");

        Ok(())
    }

    /// List the policy names stored directly in a namespace, sorted.
    ///
    /// `root` is included only for the root namespace.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if storage fails.
    pub async fn list(&self, namespace: &NamespaceId) -> Result<Vec<String>, PolicyError> {
        let mut names = self.ns_view(namespace).list("").await?;
        if namespace.is_root() && !names.iter().any(|n| n == ROOT_POLICY) {
            names.push(ROOT_POLICY.to_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Load every named policy that still exists, skipping missing names.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if storage fails.
    pub async fn load_many(
        &self,
        namespace: &NamespaceId,
        names: &[String],
    ) -> Result<Vec<Policy>, PolicyError> {
        let mut policies = Vec::with_capacity(names.len());
        for name in names {
            match self.get(namespace, name).await {
                Ok(policy) => policies.push(policy),
                Err(PolicyError::NotFound { name }) => {
                    debug!(namespace = %namespace, name = %name, "token references missing policy");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(policies)
    }
}

impl fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

/// Policy names are case-insensitive and stored lowercase.
fn normalize_name(name: &str) -> Result<String, PolicyError> {
    let name = name.trim();
    if name.is_empty() || name.contains('/') {
        return Err(PolicyError::Invalid {
            reason: format!("invalid policy name '{name}'"),
        });
    }
    Ok(name.to_lowercase())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use nsvault_storage::MemoryBackend;

    use super::*;

    const READ_RULE: &str = r#"path "auth/approle/role/*" { capabilities = ["read"] }"#;

    fn make_store() -> PolicyStore {
        PolicyStore::new(StorageView::new(Arc::new(MemoryBackend::new()), "ns/"))
    }

    fn child() -> NamespaceId {
        NamespaceId::from("abcd1234")
    }

    #[tokio::test]
    async fn put_list_delete_round_trip() {
        let store = make_store();
        let ns = child();
        store.seed(&ns).await.unwrap();
        store.put(&ns, "p", READ_RULE).await.unwrap();
        assert_eq!(store.list(&ns).await.unwrap(), vec!["default", "p"]);

        store.delete(&ns, "p").await.unwrap();
        assert_eq!(store.list(&ns).await.unwrap(), vec!["default"]);
        assert!(matches!(
            store.delete(&ns, "p").await,
            Err(PolicyError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn root_namespace_lists_root_policy() {
        let store = make_store();
        let ns = NamespaceId::root();
        store.seed(&ns).await.unwrap();
        assert_eq!(store.list(&ns).await.unwrap(), vec!["default", "root"]);
    }

    #[tokio::test]
    async fn default_can_be_overwritten_but_not_deleted() {
        let store = make_store();
        let ns = child();
        store.seed(&ns).await.unwrap();
        store.put(&ns, "default", READ_RULE).await.unwrap();
        let policy = store.get(&ns, "default").await.unwrap();
        assert_eq!(policy.rules[0].path, "auth/approle/role/*");

        let err = store.delete(&ns, "default").await.unwrap_err();
        assert!(matches!(err, PolicyError::BuiltIn { .. }));
    }

    #[tokio::test]
    async fn root_is_immutable() {
        let store = make_store();
        let ns = NamespaceId::root();
        assert!(matches!(
            store.put(&ns, "root", READ_RULE).await,
            Err(PolicyError::BuiltIn { .. })
        ));
        assert!(matches!(
            store.delete(&ns, "ROOT").await,
            Err(PolicyError::BuiltIn { .. })
        ));
        assert_eq!(store.get(&ns, "root").await.unwrap().rules.len(), 1);
    }

    #[tokio::test]
    async fn malformed_text_is_rejected_and_nothing_stored() {
        let store = make_store();
        let ns = child();
        let err = store.put(&ns, "bad", "path \"x\" {").await.unwrap_err();
        assert!(matches!(err, PolicyError::Invalid { .. }));
        assert!(!store.exists(&ns, "bad").await.unwrap());
    }

    #[tokio::test]
    async fn policies_do_not_cross_namespaces() {
        let store = make_store();
        let root = NamespaceId::root();
        let ns = child();
        store.put(&root, "readpolicy", READ_RULE).await.unwrap();
        store.put(&ns, "readpolicy", READ_RULE).await.unwrap();
        store.delete(&ns, "readpolicy").await.unwrap();

        assert!(store.exists(&root, "readpolicy").await.unwrap());
        assert!(matches!(
            store.get(&ns, "readpolicy").await,
            Err(PolicyError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn load_many_skips_deleted_names() {
        let store = make_store();
        let ns = child();
        store.seed(&ns).await.unwrap();
        store.put(&ns, "gone", READ_RULE).await.unwrap();
        store.delete(&ns, "gone").await.unwrap();

        let names = vec!["default".to_owned(), "gone".to_owned()];
        let loaded = store.load_many(&ns, &names).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "default");
    }

    #[tokio::test]
    async fn names_are_case_insensitive() {
        let store = make_store();
        let ns = child();
        store.put(&ns, "ReadPolicy", READ_RULE).await.unwrap();
        assert!(store.exists(&ns, "readpolicy").await.unwrap());
        assert_eq!(store.list(&ns).await.unwrap(), vec!["readpolicy"]);
    }

    #[test]
    fn capability_parses_lowercase_names() {
        assert_eq!("list".parse::<Capability>().unwrap(), Capability::List);
        assert!("write".parse::<Capability>().is_err());
    }
}
