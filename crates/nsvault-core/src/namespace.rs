//! The namespace tree.
//!
//! Namespaces form a strict hierarchy rooted at the root namespace. The tree
//! is an arena keyed by [`NamespaceId`]: each node owns the name→id map of its
//! children and refers to its parent by id only. Handles are shared as
//! `Arc<Namespace>`.
//!
//! Creation is two-phase. [`NamespaceTree::reserve`] claims the name under
//! the tree lock (so concurrent duplicates cannot both succeed) and returns a
//! pending handle; the caller seeds the namespace's policies and mounts, then
//! [`NamespaceTree::commit`] persists the record and opens the ready barrier.
//! Requests resolve pending namespaces but wait on the barrier before doing
//! any work.
//!
//! Records persist at `sys/namespaces/<id>` as `{id, name, parent_id}`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};
use tracing::{info, warn};

use crate::error::NamespaceError;
use crate::view::StorageView;

/// Names that cannot be used for a namespace.
const RESERVED_NAMES: &[&str] = &["root", "sys", "auth", "cubbyhole", "identity"];

/// Identifier of a namespace. The root namespace is `root`; every other
/// namespace gets 8 random hex characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(String);

impl NamespaceId {
    /// The root namespace id.
    #[must_use]
    pub fn root() -> Self {
        Self("root".to_owned())
    }

    /// Whether this is the root namespace id.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "root"
    }

    /// A fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NamespaceId {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NamespaceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for NamespaceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Readiness of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Ready,
    Deleted,
}

/// A namespace handle.
pub struct Namespace {
    id: NamespaceId,
    name: String,
    path: String,
    parent: Option<NamespaceId>,
    write_lock: Mutex<()>,
    ready: watch::Sender<ReadyState>,
}

impl Namespace {
    fn new(id: NamespaceId, name: String, path: String, parent: Option<NamespaceId>) -> Self {
        let (ready, _) = watch::channel(ReadyState::Pending);
        Self {
            id,
            name,
            path,
            parent,
            write_lock: Mutex::new(()),
            ready,
        }
    }

    /// The namespace id.
    #[must_use]
    pub fn id(&self) -> &NamespaceId {
        &self.id
    }

    /// The last path segment (empty for root).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full path without leading or trailing slashes (empty for root).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The parent's id (`None` for root).
    #[must_use]
    pub fn parent(&self) -> Option<&NamespaceId> {
        self.parent.as_ref()
    }

    /// Whether this is the root namespace.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Take the namespace's write lock. Mutations of policies, mounts,
    /// credentials and child namespaces hold it for their duration.
    pub async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Whether the namespace has finished initialisation.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow() == ReadyState::Ready
    }

    /// Wait until the namespace is ready.
    ///
    /// # Errors
    ///
    /// - [`NamespaceError::NotReady`] if `timeout` elapses first.
    /// - [`NamespaceError::NotFound`] if the namespace is deleted meanwhile.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), NamespaceError> {
        let mut rx = self.ready.subscribe();
        let state = tokio::time::timeout(timeout, rx.wait_for(|s| *s != ReadyState::Pending))
            .await
            .map_err(|_| NamespaceError::NotReady {
                path: self.to_string(),
            })?
            .map(|s| *s)
            .unwrap_or(ReadyState::Deleted);

        match state {
            ReadyState::Ready => Ok(()),
            ReadyState::Pending | ReadyState::Deleted => Err(NamespaceError::NotFound {
                path: self.to_string(),
            }),
        }
    }

    fn set_state(&self, state: ReadyState) {
        self.ready.send_replace(state);
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str("root")
        } else {
            f.write_str(&self.path)
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Persisted form of a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NamespaceRecord {
    id: NamespaceId,
    name: String,
    parent_id: NamespaceId,
}

struct Node {
    namespace: Arc<Namespace>,
    children: BTreeMap<String, NamespaceId>,
}

#[derive(Default)]
struct Arena {
    nodes: HashMap<NamespaceId, Node>,
}

impl Arena {
    fn insert(&mut self, namespace: Arc<Namespace>) {
        if let Some(parent) = namespace.parent().and_then(|p| self.nodes.get_mut(p)) {
            parent
                .children
                .insert(namespace.name().to_owned(), namespace.id().clone());
        }
        self.nodes.insert(
            namespace.id().clone(),
            Node {
                namespace,
                children: BTreeMap::new(),
            },
        );
    }

    fn remove(&mut self, id: &NamespaceId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        if let Some(parent) = node
            .namespace
            .parent()
            .and_then(|p| self.nodes.get_mut(p))
        {
            parent.children.remove(node.namespace.name());
        }
        Some(node)
    }
}

/// The namespace hierarchy.
pub struct NamespaceTree {
    /// View on `sys/namespaces/`.
    view: StorageView,
    arena: RwLock<Arena>,
}

impl NamespaceTree {
    /// A tree containing only the (ready) root namespace.
    #[must_use]
    pub fn new(view: StorageView) -> Self {
        let root = Arc::new(Namespace::new(
            NamespaceId::root(),
            String::new(),
            String::new(),
            None,
        ));
        root.set_state(ReadyState::Ready);
        let mut arena = Arena::default();
        arena.insert(root);
        Self {
            view,
            arena: RwLock::new(arena),
        }
    }

    /// Rebuild the tree from persisted records. Every loaded namespace is
    /// ready.
    ///
    /// # Errors
    ///
    /// Returns [`NamespaceError::Store`] if storage fails.
    pub async fn load(view: StorageView) -> Result<Self, NamespaceError> {
        let tree = Self::new(view);

        let mut pending = Vec::new();
        for key in tree.view.list("").await? {
            if let Some(record) = tree.view.get_json::<NamespaceRecord>(&key).await? {
                pending.push(record);
            }
        }

        let mut arena = tree.arena.write().await;
        // Parents must be placed before children; records come back in id
        // order, so sweep until no more progress is made.
        loop {
            let before = pending.len();
            pending.retain(|record| {
                let Some(parent) = arena.nodes.get(&record.parent_id) else {
                    return true;
                };
                let parent = &parent.namespace;
                let path = join_path(parent.path(), &record.name);
                let ns = Arc::new(Namespace::new(
                    record.id.clone(),
                    record.name.clone(),
                    path,
                    Some(record.parent_id.clone()),
                ));
                ns.set_state(ReadyState::Ready);
                arena.insert(ns);
                false
            });
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for record in &pending {
            warn!(id = %record.id, name = %record.name, "skipping namespace with missing parent");
        }
        let count = arena.nodes.len();
        drop(arena);

        info!(namespaces = count, "namespace tree loaded");
        Ok(tree)
    }

    /// The root namespace.
    ///
    /// # Errors
    ///
    /// Returns [`NamespaceError::NotFound`] only if the arena is corrupt.
    pub async fn root(&self) -> Result<Arc<Namespace>, NamespaceError> {
        self.get(&NamespaceId::root())
            .await
            .ok_or_else(|| NamespaceError::NotFound {
                path: "root".to_owned(),
            })
    }

    /// Look up a namespace by id.
    pub async fn get(&self, id: &NamespaceId) -> Option<Arc<Namespace>> {
        let arena = self.arena.read().await;
        arena.nodes.get(id).map(|n| Arc::clone(&n.namespace))
    }

    /// Resolve a path such as `pname/cname` by descending segment by
    /// segment from the root. Empty paths and surrounding slashes are
    /// tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`NamespaceError::NotFound`] if any segment is missing.
    pub async fn resolve(&self, path: &str) -> Result<Arc<Namespace>, NamespaceError> {
        let arena = self.arena.read().await;
        let not_found = || NamespaceError::NotFound {
            path: path.trim_matches('/').to_owned(),
        };

        let mut node = arena.nodes.get(&NamespaceId::root()).ok_or_else(not_found)?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let child = node.children.get(segment).ok_or_else(not_found)?;
            node = arena.nodes.get(child).ok_or_else(not_found)?;
        }
        Ok(Arc::clone(&node.namespace))
    }

    /// A direct child by name.
    ///
    /// # Errors
    ///
    /// Returns [`NamespaceError::NotFound`] if there is no such child.
    pub async fn child(
        &self,
        parent: &Namespace,
        name: &str,
    ) -> Result<Arc<Namespace>, NamespaceError> {
        let arena = self.arena.read().await;
        arena
            .nodes
            .get(parent.id())
            .and_then(|p| p.children.get(name))
            .and_then(|id| arena.nodes.get(id))
            .map(|n| Arc::clone(&n.namespace))
            .ok_or_else(|| NamespaceError::NotFound {
                path: join_path(parent.path(), name),
            })
    }

    /// Ready direct children of a namespace, ordered by name.
    pub async fn children(&self, parent: &Namespace) -> Vec<Arc<Namespace>> {
        let arena = self.arena.read().await;
        arena
            .nodes
            .get(parent.id())
            .map(|p| {
                p.children
                    .values()
                    .filter_map(|id| arena.nodes.get(id))
                    .map(|n| Arc::clone(&n.namespace))
                    .filter(|ns| ns.is_ready())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of children of a namespace, pending ones included.
    pub async fn child_count(&self, namespace: &Namespace) -> usize {
        self.arena
            .read()
            .await
            .nodes
            .get(namespace.id())
            .map_or(0, |n| n.children.len())
    }

    /// Whether `ancestor` is `id` or one of its ancestors.
    pub async fn is_ancestor_or_self(&self, ancestor: &NamespaceId, id: &NamespaceId) -> bool {
        let arena = self.arena.read().await;
        let mut current = Some(id);
        while let Some(cur) = current {
            if cur == ancestor {
                return true;
            }
            current = arena.nodes.get(cur).and_then(|n| n.namespace.parent());
        }
        false
    }

    /// Claim `name` under `parent` and insert a pending namespace.
    ///
    /// # Errors
    ///
    /// - [`NamespaceError::InvalidName`] for empty, reserved or malformed
    ///   names.
    /// - [`NamespaceError::AlreadyExists`] if a sibling has the name.
    /// - [`NamespaceError::NotFound`] if `parent` has been deleted.
    pub async fn reserve(
        &self,
        parent: &Namespace,
        name: &str,
    ) -> Result<Arc<Namespace>, NamespaceError> {
        validate_name(name)?;
        let path = join_path(parent.path(), name);

        let mut arena = self.arena.write().await;
        let parent_node = arena
            .nodes
            .get(parent.id())
            .ok_or_else(|| NamespaceError::NotFound {
                path: parent.to_string(),
            })?;
        if parent_node.children.contains_key(name) {
            return Err(NamespaceError::AlreadyExists { path });
        }

        let mut id = NamespaceId::generate();
        while arena.nodes.contains_key(&id) {
            id = NamespaceId::generate();
        }

        let ns = Arc::new(Namespace::new(
            id,
            name.to_owned(),
            path,
            Some(parent.id().clone()),
        ));
        arena.insert(Arc::clone(&ns));
        Ok(ns)
    }

    /// Persist a reserved namespace and open its ready barrier.
    ///
    /// # Errors
    ///
    /// Returns [`NamespaceError::Store`] if persistence fails; the namespace
    /// stays pending and should be passed to [`abort`](Self::abort).
    pub async fn commit(&self, namespace: &Namespace) -> Result<(), NamespaceError> {
        let Some(parent_id) = namespace.parent() else {
            return Ok(());
        };
        let record = NamespaceRecord {
            id: namespace.id().clone(),
            name: namespace.name().to_owned(),
            parent_id: parent_id.clone(),
        };
        self.view.put_json(namespace.id().as_str(), &record).await?;
        namespace.set_state(ReadyState::Ready);

        info!(namespace = %namespace, id = %namespace.id(), "namespace created");
        Ok(())
    }

    /// Drop a reserved namespace whose initialisation failed.
    pub async fn abort(&self, namespace: &Namespace) {
        self.arena.write().await.remove(namespace.id());
        namespace.set_state(ReadyState::Deleted);
        warn!(namespace = %namespace, "namespace creation aborted");
    }

    /// Remove a childless namespace from the tree and delete its record.
    ///
    /// The child check and the removal happen under one hold of the tree
    /// lock, so a concurrent creation below `namespace` cannot slip in
    /// between.
    ///
    /// # Errors
    ///
    /// - [`NamespaceError::HasChildren`] if child namespaces exist.
    /// - [`NamespaceError::NotFound`] if it was already removed.
    /// - [`NamespaceError::Store`] if the record cannot be deleted.
    pub async fn detach(&self, namespace: &Namespace) -> Result<(), NamespaceError> {
        let mut arena = self.arena.write().await;
        let node = arena
            .nodes
            .get(namespace.id())
            .ok_or_else(|| NamespaceError::NotFound {
                path: namespace.to_string(),
            })?;
        if !node.children.is_empty() {
            return Err(NamespaceError::HasChildren {
                path: namespace.to_string(),
                children: node.children.len(),
            });
        }

        self.view.delete(namespace.id().as_str()).await?;
        arena.remove(namespace.id());
        drop(arena);

        namespace.set_state(ReadyState::Deleted);
        info!(namespace = %namespace, id = %namespace.id(), "namespace detached");
        Ok(())
    }
}

impl fmt::Debug for NamespaceTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceTree").finish_non_exhaustive()
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

fn validate_name(name: &str) -> Result<(), NamespaceError> {
    let invalid = |reason: &str| NamespaceError::InvalidName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(invalid("name is reserved"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(
            "only ASCII letters, digits, '-', '_' and '.' are allowed",
        ));
    }
    Ok(())
}
