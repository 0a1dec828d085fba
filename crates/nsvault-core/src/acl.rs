//! Path-capability evaluation.
//!
//! A token's policies are compiled into an [`Acl`]: one entry per distinct
//! path pattern, with capabilities unioned across policies. For a request
//! path, the single most specific matching pattern decides.
//!
//! Pattern syntax:
//! - literal segments (`secret/data/app`)
//! - `+` as a whole segment matches exactly one segment (`+/kv/data/*`)
//! - a trailing `*` is a prefix glob (`secret/data/*`, `secret/da*`)
//!
//! The [`Evaluator`] layers namespace rules on top: a token acts in its own
//! namespace, and reaches direct child namespaces only through rules whose
//! first segment is `+`. Root tokens act in their namespace and every
//! descendant.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{AccessError, DenyReason};
use crate::namespace::{Namespace, NamespaceTree};
use crate::policy::{Capability, Policy, PolicyStore};
use crate::token::TokenEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
}

/// A compiled policy path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
    glob: bool,
}

impl PathPattern {
    /// Compile a pattern. A leading `/` is ignored.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem for empty patterns, `*` anywhere
    /// but the end, or `+` mixed with other characters in a segment.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim_start_matches('/');
        if raw.is_empty() {
            return Err("empty path pattern".to_owned());
        }
        let (body, glob) = match raw.strip_suffix('*') {
            Some(body) => (body, true),
            None => (raw, false),
        };
        if body.contains('*') {
            return Err("'*' is only allowed at the end of a pattern".to_owned());
        }

        let segments = body
            .split('/')
            .map(|seg| {
                if seg == "+" {
                    Ok(Segment::Any)
                } else if seg.contains('+') {
                    Err(format!("'+' must be a whole segment, found '{seg}'"))
                } else {
                    Ok(Segment::Literal(seg.to_owned()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_owned(),
            segments,
            glob,
        })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the first segment is a `+` wildcard.
    #[must_use]
    pub fn starts_with_wildcard(&self) -> bool {
        matches!(self.segments.first(), Some(Segment::Any))
    }

    /// Test a request path against the pattern.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').collect();
        let Some((last, init)) = self.segments.split_last() else {
            return false;
        };

        if self.glob {
            if parts.len() < self.segments.len() {
                return false;
            }
        } else if parts.len() != self.segments.len() {
            return false;
        }

        let head_matches = init.iter().zip(&parts).all(|(seg, part)| match seg {
            Segment::Literal(lit) => lit == part,
            Segment::Any => !part.is_empty(),
        });
        if !head_matches {
            return false;
        }

        let part = parts.get(init.len()).copied().unwrap_or_default();
        match (last, self.glob) {
            (Segment::Literal(lit), false) => lit == part,
            (Segment::Literal(lit), true) => part.starts_with(lit.as_str()),
            (Segment::Any, false) => !part.is_empty(),
            (Segment::Any, true) => true,
        }
    }

    fn specificity(&self) -> Specificity {
        let first_wildcard = self
            .raw
            .find(['+', '*'])
            .unwrap_or(self.raw.len());
        let plus_segments = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Any))
            .count();
        Specificity {
            first_wildcard,
            exact: !self.glob,
            plus_segments,
            len: self.raw.len(),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Ordering key for competing patterns; greater is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Specificity {
    first_wildcard: usize,
    exact: bool,
    plus_segments: usize,
    len: usize,
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.first_wildcard
            .cmp(&other.first_wildcard)
            .then(self.exact.cmp(&other.exact))
            .then(other.plus_segments.cmp(&self.plus_segments))
            .then(self.len.cmp(&other.len))
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct AclRule {
    pattern: PathPattern,
    capabilities: BTreeSet<Capability>,
}

/// The compiled rules of a token's policy set.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    rules: Vec<AclRule>,
}

impl Acl {
    /// Compile policies, merging rules with identical patterns.
    #[must_use]
    pub fn new(policies: &[Policy]) -> Self {
        let mut rules: Vec<AclRule> = Vec::new();
        for policy in policies {
            for rule in &policy.rules {
                let pattern = match PathPattern::parse(&rule.path) {
                    Ok(p) => p,
                    Err(reason) => {
                        warn!(policy = %policy.name, path = %rule.path, reason = %reason, "skipping stored rule with invalid pattern");
                        continue;
                    }
                };
                match rules.iter_mut().find(|r| r.pattern == pattern) {
                    Some(existing) => existing.capabilities.extend(rule.capabilities.iter().copied()),
                    None => rules.push(AclRule {
                        pattern,
                        capabilities: rule.capabilities.clone(),
                    }),
                }
            }
        }
        Self { rules }
    }

    /// Keep only the rules that reach into child namespaces (`+/...`).
    #[must_use]
    pub fn cross_namespace(&self) -> Self {
        Self {
            rules: self
                .rules
                .iter()
                .filter(|r| r.pattern.starts_with_wildcard())
                .cloned()
                .collect(),
        }
    }

    /// Number of distinct patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the ACL has no rules at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The capability set of the most specific rule matching `path`.
    #[must_use]
    pub fn capabilities(&self, path: &str) -> Option<&BTreeSet<Capability>> {
        self.rules
            .iter()
            .filter(|r| r.pattern.matches(path))
            .max_by(|a, b| {
                a.pattern
                    .specificity()
                    .cmp(&b.pattern.specificity())
                    .then(a.capabilities.len().cmp(&b.capabilities.len()))
            })
            .map(|r| &r.capabilities)
    }

    /// Check a single capability on `path`.
    ///
    /// # Errors
    ///
    /// Returns the [`DenyReason`] of the step that refused.
    pub fn check(&self, path: &str, capability: Capability) -> Result<(), DenyReason> {
        let caps = self.capabilities(path).ok_or(DenyReason::NoMatchingRule)?;
        if caps.contains(&Capability::Deny) {
            return Err(DenyReason::ExplicitDeny);
        }
        if caps.contains(&capability) {
            Ok(())
        } else {
            Err(DenyReason::CapabilityMissing)
        }
    }
}

/// How a token relates to the namespace a request is evaluated in.
enum Scope {
    /// Root token in the namespace or an ancestor of it.
    Root,
    /// Policy rules apply, checked against `path_prefix + path`.
    Rules { acl: Acl, path_prefix: String },
    /// The token cannot act here at all.
    Mismatch,
}

/// Computes allow/deny decisions for tokens.
pub struct Evaluator {
    tree: Arc<NamespaceTree>,
    policies: Arc<PolicyStore>,
}

impl Evaluator {
    /// Create an evaluator over the shared tree and policy store.
    #[must_use]
    pub fn new(tree: Arc<NamespaceTree>, policies: Arc<PolicyStore>) -> Self {
        Self { tree, policies }
    }

    async fn scope(&self, token: &TokenEntry, namespace: &Namespace) -> Result<Scope, AccessError> {
        let home = &token.namespace_id;

        if token.is_root() {
            return Ok(if self.tree.is_ancestor_or_self(home, namespace.id()).await {
                Scope::Root
            } else {
                Scope::Mismatch
            });
        }

        let path_prefix = if home == namespace.id() {
            String::new()
        } else if namespace.parent() == Some(home) {
            format!("{}/", namespace.name())
        } else {
            return Ok(Scope::Mismatch);
        };

        let policies = self.policies.load_many(home, &token.policies).await?;
        let acl = Acl::new(&policies);
        let acl = if path_prefix.is_empty() {
            acl
        } else {
            acl.cross_namespace()
        };
        Ok(Scope::Rules { acl, path_prefix })
    }

    /// Decide whether `token` may exercise `capability` on `path` inside
    /// `namespace`.
    ///
    /// # Errors
    ///
    /// - [`AccessError::Denied`] naming the failing step.
    /// - [`AccessError::Policy`] if the token's policies cannot be loaded.
    pub async fn authorize(
        &self,
        token: &TokenEntry,
        namespace: &Namespace,
        path: &str,
        capability: Capability,
    ) -> Result<(), AccessError> {
        let denied = |reason: DenyReason| {
            debug!(
                namespace = %namespace,
                path = %path,
                capability = %capability,
                reason = %reason,
                "request denied"
            );
            AccessError::Denied {
                namespace: namespace.to_string(),
                path: path.to_owned(),
                capability: capability.to_string(),
                reason,
            }
        };

        match self.scope(token, namespace).await? {
            Scope::Root => Ok(()),
            Scope::Mismatch => Err(denied(DenyReason::NamespaceMismatch)),
            Scope::Rules { acl, path_prefix } => acl
                .check(&format!("{path_prefix}{path}"), capability)
                .map_err(denied),
        }
    }

    /// The capabilities `token` holds on `path` inside `namespace`, as
    /// reported by `sys/capabilities-self`: `["root"]` for root tokens,
    /// `["deny"]` when nothing is granted.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Policy`] if the token's policies cannot be
    /// loaded.
    pub async fn capabilities(
        &self,
        token: &TokenEntry,
        namespace: &Namespace,
        path: &str,
    ) -> Result<Vec<String>, AccessError> {
        let caps = match self.scope(token, namespace).await? {
            Scope::Root => return Ok(vec!["root".to_owned()]),
            Scope::Mismatch => None,
            Scope::Rules { acl, path_prefix } => acl
                .capabilities(&format!("{path_prefix}{path}"))
                .filter(|caps| !caps.contains(&Capability::Deny))
                .map(|caps| caps.iter().map(ToString::to_string).collect::<Vec<_>>()),
        };
        Ok(caps
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| vec![Capability::Deny.to_string()]))
    }
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator").finish_non_exhaustive()
    }
}
