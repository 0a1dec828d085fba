//! The engine handle.
//!
//! [`Core`] owns every store and is the single entry point for requests.
//! [`Core::handle`] runs the pipeline: resolve the namespace and wait for it
//! to be ready, route the path to `sys/`, an auth method or a secret engine,
//! authenticate the token, derive the capability, authorize, then execute.
//! Mutations hold the namespace's write lock from the capability decision
//! through execution.

mod credentials;
mod sys;
mod tokens;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};
use nsvault_storage::StorageBackend;
use serde_json::json;
use tokio::sync::MutexGuard;
use tracing::{debug, info};

use crate::acl::Evaluator;
use crate::auth::AuthMethod;
use crate::config::CoreConfig;
use crate::error::{AccessError, DenyReason, NamespaceError, RequestError};
use crate::kv::KvEngine;
use crate::mount::{MountEntry, MountManager, TOKEN_MOUNT_PATH};
use crate::namespace::{Namespace, NamespaceId, NamespaceTree};
use crate::policy::{Capability, PolicyStore, ROOT_POLICY};
use crate::request::{AuthResponse, Operation, Payload, Request, Response};
use crate::token::{CreateTokenParams, TokenEntry, TokenStore, token_namespace};
use crate::view::StorageView;

/// Key (inside `sys/`) marking an initialized backend.
const INIT_KEY: &str = "init";

/// The engine handle. All state hangs off it; there are no globals.
pub struct Core {
    storage: Arc<dyn StorageBackend>,
    tree: Arc<NamespaceTree>,
    policies: Arc<PolicyStore>,
    mounts: MountManager,
    tokens: TokenStore,
    evaluator: Evaluator,
    config: CoreConfig,
    closed: AtomicBool,
}

/// Where a request path lands.
enum Route {
    /// `sys/...`, with the `sys/` prefix removed.
    Sys(String),
    /// An auth mount and the path inside it.
    Auth {
        entry: MountEntry,
        method: AuthMethod,
        rest: String,
    },
    /// A KV mount and the path inside it.
    Kv { engine: KvEngine, rest: String },
}

/// An authenticated request on its way to a handler.
struct Ctx<'a> {
    ns: &'a Namespace,
    token: &'a TokenEntry,
    client_token: &'a str,
    operation: Operation,
    path: &'a str,
    data: &'a Payload,
}

impl Ctx<'_> {
    fn unsupported(&self) -> RequestError {
        RequestError::UnsupportedOperation {
            path: self.path.to_owned(),
            operation: self.operation.to_string(),
        }
    }

    fn unknown_path(&self) -> RequestError {
        RequestError::UnsupportedPath {
            path: self.path.to_owned(),
        }
    }

    fn denied(&self, capability: Capability, reason: DenyReason) -> RequestError {
        AccessError::Denied {
            namespace: self.ns.to_string(),
            path: self.path.to_owned(),
            capability: capability.to_string(),
            reason,
        }
        .into()
    }
}

impl Core {
    fn build(storage: Arc<dyn StorageBackend>, tree: NamespaceTree, config: CoreConfig) -> Self {
        let ns_view = StorageView::new(Arc::clone(&storage), "ns/");
        let tree = Arc::new(tree);
        let policies = Arc::new(PolicyStore::new(ns_view.clone()));
        Self {
            evaluator: Evaluator::new(Arc::clone(&tree), Arc::clone(&policies)),
            mounts: MountManager::new(ns_view),
            tokens: TokenStore::new(StorageView::new(Arc::clone(&storage), "sys/")),
            storage,
            tree,
            policies,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Initialize a fresh backend: seed the root namespace and mint a root
    /// token. Returns the engine and the root token's plaintext.
    ///
    /// # Errors
    ///
    /// - [`NamespaceError::AlreadyInitialized`] if the backend already holds
    ///   an engine.
    /// - Store errors if seeding fails.
    pub async fn initialize(
        storage: Arc<dyn StorageBackend>,
        config: CoreConfig,
    ) -> Result<(Self, String), RequestError> {
        Self::bootstrap(storage, config, None).await
    }

    /// Like [`Core::initialize`], but the root token has the given value.
    ///
    /// # Errors
    ///
    /// As for [`Core::initialize`], plus [`RequestError::InvalidRequest`]
    /// for an empty token or one whose suffix names another namespace
    /// (`s.<body>.<suffix>`), which lookups would never find.
    pub async fn initialize_with_root_token(
        storage: Arc<dyn StorageBackend>,
        config: CoreConfig,
        root_token: &str,
    ) -> Result<(Self, String), RequestError> {
        if root_token.trim().is_empty() || root_token.contains('/') {
            return Err(RequestError::invalid("root token must be a non-empty string without '/'"));
        }
        if token_namespace(root_token) != NamespaceId::root() {
            return Err(RequestError::invalid(
                "root token must not take the form 's.<body>.<suffix>'",
            ));
        }
        Self::bootstrap(storage, config, Some(root_token.to_owned())).await
    }

    async fn bootstrap(
        storage: Arc<dyn StorageBackend>,
        config: CoreConfig,
        root_token: Option<String>,
    ) -> Result<(Self, String), RequestError> {
        let sys = StorageView::new(Arc::clone(&storage), "sys/");
        if sys.exists(INIT_KEY).await? {
            return Err(NamespaceError::AlreadyInitialized.into());
        }

        let core = Self::build(storage, NamespaceTree::new(sys.sub_view("namespaces/")), config);
        let root = NamespaceId::root();
        core.policies.seed(&root).await?;
        core.mounts.seed(&root).await?;
        let (token, _) = core
            .tokens
            .create(CreateTokenParams {
                namespace_id: root,
                policies: vec![ROOT_POLICY.to_owned()],
                display_name: ROOT_POLICY.to_owned(),
                issued_by: TOKEN_MOUNT_PATH.to_owned(),
                id: root_token,
                ..CreateTokenParams::default()
            })
            .await?;
        sys.put_json(INIT_KEY, &json!({ "initialized_at": Utc::now().to_rfc3339() }))
            .await?;

        info!("engine initialized");
        Ok((core, token))
    }

    /// Open an initialized backend, reloading the namespace tree.
    ///
    /// # Errors
    ///
    /// - [`NamespaceError::NotInitialized`] if the backend was never
    ///   initialized.
    /// - Store errors if loading fails.
    pub async fn open(storage: Arc<dyn StorageBackend>, config: CoreConfig) -> Result<Self, RequestError> {
        let sys = StorageView::new(Arc::clone(&storage), "sys/");
        if !sys.exists(INIT_KEY).await? {
            return Err(NamespaceError::NotInitialized.into());
        }
        let tree = NamespaceTree::load(sys.sub_view("namespaces/")).await?;
        info!("engine opened");
        Ok(Self::build(storage, tree, config))
    }

    /// Stop serving. Every later request fails with `Unavailable`.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("engine shut down");
        }
    }

    /// Whether [`Core::shutdown`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Wait until the namespace at `path` is ready to serve requests.
    ///
    /// # Errors
    ///
    /// - [`NamespaceError::NotFound`] if the path does not resolve or the
    ///   namespace is deleted while waiting.
    /// - [`NamespaceError::NotReady`] if the configured timeout passes.
    pub async fn wait_for_namespace(&self, path: &str) -> Result<(), RequestError> {
        let ns = self.tree.resolve(path).await?;
        ns.wait_ready(self.config.namespace_ready_timeout).await?;
        Ok(())
    }

    /// Handle one request.
    ///
    /// # Errors
    ///
    /// Returns a [`RequestError`] whose [`kind`](RequestError::kind) names
    /// the failing step.
    pub async fn handle(&self, req: Request) -> Result<Response, RequestError> {
        if self.is_closed() {
            return Err(RequestError::Closed);
        }

        let ns = self.tree.resolve(&req.namespace).await?;
        ns.wait_ready(self.config.namespace_ready_timeout).await?;

        let path = req.path.trim_matches('/');
        let operation = req.operation;
        let route = self.route(&ns, path).await?;

        if operation == Operation::Write {
            if let Route::Auth { entry, method, rest } = &route {
                if method.is_login_path(rest) {
                    let _guard = lock_live(&ns).await?;
                    return self.login(&ns, entry, method, rest, &req.data).await;
                }
            }
        }

        let client_token = req
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(RequestError::MissingToken)?;
        let token = self.tokens.lookup(client_token).await?;

        // Create vs update is decided under the same lock that covers dispatch.
        let _guard = if operation.is_mutation() {
            Some(lock_live(&ns).await?)
        } else {
            None
        };

        let capability = match operation {
            Operation::Read => Capability::Read,
            Operation::List => Capability::List,
            Operation::Delete => Capability::Delete,
            Operation::Write => {
                if self.exists(&ns, &route).await? {
                    Capability::Update
                } else {
                    Capability::Create
                }
            }
        };
        let acl_path = if operation == Operation::List && !path.is_empty() {
            format!("{path}/")
        } else {
            path.to_owned()
        };
        self.evaluator
            .authorize(&token, &ns, &acl_path, capability)
            .await?;

        let ctx = Ctx {
            ns: &ns,
            token: &token,
            client_token,
            operation,
            path,
            data: &req.data,
        };
        let result = match &route {
            Route::Sys(rest) => self.handle_sys(&ctx, rest).await,
            Route::Auth { method, rest, .. } => match method {
                AuthMethod::Token => self.handle_token(&ctx, rest).await,
                AuthMethod::AppRole(store) => credentials::handle_approle(&ctx, store, rest).await,
                AuthMethod::Userpass(store) => credentials::handle_userpass(&ctx, store, rest).await,
            },
            Route::Kv { engine, rest } => engine
                .handle(operation, rest, &req.data)
                .await
                .map(|data| Response { data, auth: None })
                .map_err(RequestError::from),
        };

        match &result {
            Ok(_) => debug!(namespace = %ns, path = %path, operation = %operation, "request handled"),
            Err(e) => debug!(
                namespace = %ns,
                path = %path,
                operation = %operation,
                kind = %e.kind(),
                error = %e,
                "request failed"
            ),
        }
        result
    }

    async fn route(&self, ns: &Namespace, path: &str) -> Result<Route, RequestError> {
        if path == "sys" || path.starts_with("sys/") {
            let rest = path.strip_prefix("sys").unwrap_or_default();
            return Ok(Route::Sys(rest.trim_start_matches('/').to_owned()));
        }

        let Some((entry, rest)) = self.mounts.resolve(ns.id(), path).await? else {
            return Err(RequestError::UnsupportedPath {
                path: path.to_owned(),
            });
        };
        let view = self.mounts.data_view(ns.id(), &entry);
        match AuthMethod::for_mount(&entry, view.clone()) {
            Some(method) => Ok(Route::Auth { entry, method, rest }),
            None => Ok(Route::Kv {
                engine: KvEngine::new(view, self.config.kv_max_versions),
                rest,
            }),
        }
    }

    /// Whether a write to the routed path updates existing state, which
    /// selects `update` over `create`. Action endpoints always count as
    /// updates.
    async fn exists(&self, ns: &Namespace, route: &Route) -> Result<bool, RequestError> {
        match route {
            Route::Kv { engine, rest } => Ok(engine.exists(rest).await?),
            Route::Sys(rest) => {
                if let Some(name) = single_name(rest, "policies/acl/").or_else(|| single_name(rest, "policy/")) {
                    return Ok(self.policies.exists(ns.id(), name).await?);
                }
                if let Some(name) = single_name(rest, "namespaces/") {
                    return Ok(self.tree.child(ns, name).await.is_ok());
                }
                Ok(true)
            }
            Route::Auth { method, rest, .. } => match method {
                AuthMethod::AppRole(store) => match single_name(rest, "role/") {
                    Some(name) => Ok(store.role_exists(name).await?),
                    None => Ok(true),
                },
                AuthMethod::Userpass(store) => match single_name(rest, "users/") {
                    Some(name) => Ok(store.user_exists(name).await?),
                    None => Ok(true),
                },
                AuthMethod::Token => Ok(true),
            },
        }
    }

    /// The namespace path as reported in responses: `pname/cname/`, empty
    /// for root.
    async fn namespace_path(&self, id: &NamespaceId) -> String {
        self.tree
            .get(id)
            .await
            .map(|ns| display_path(&ns))
            .unwrap_or_default()
    }

    async fn auth_response(&self, client_token: String, entry: &TokenEntry) -> AuthResponse {
        AuthResponse {
            client_token,
            accessor: entry.log_id().to_owned(),
            policies: entry.policies.clone(),
            token_policies: entry.policies.clone(),
            metadata: entry.meta.clone(),
            lease_duration: entry.ttl_secs(),
            renewable: entry.renewable,
            namespace_path: self.namespace_path(&entry.namespace_id).await,
        }
    }

    fn namespace_view(&self, id: &NamespaceId) -> StorageView {
        StorageView::new(Arc::clone(&self.storage), format!("ns/{id}/"))
    }

    /// Lifetimes for a login token, with zeros meaning the engine defaults.
    fn login_lifetimes(&self, ttl_secs: i64, max_ttl_secs: i64) -> (Duration, Duration) {
        let max_ttl = if max_ttl_secs > 0 {
            max_ttl_secs
        } else {
            self.config.default_max_ttl_secs
        };
        let ttl = if ttl_secs > 0 {
            ttl_secs
        } else {
            self.config.default_token_ttl_secs
        };
        (Duration::seconds(ttl.min(max_ttl)), Duration::seconds(max_ttl))
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Take the namespace write lock, failing if the namespace was deleted
/// while the caller waited for it.
async fn lock_live(ns: &Namespace) -> Result<MutexGuard<'_, ()>, RequestError> {
    let guard = ns.lock_writes().await;
    if !ns.is_ready() {
        return Err(NamespaceError::NotFound {
            path: ns.to_string(),
        }
        .into());
    }
    Ok(guard)
}

/// `name` when `path` is exactly `<prefix><name>` with a single segment.
fn single_name<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

fn display_path(ns: &Namespace) -> String {
    if ns.is_root() {
        String::new()
    } else {
        format!("{}/", ns.path())
    }
}
