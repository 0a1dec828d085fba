//! Handlers for `sys/` paths: namespaces, policies, mounts and
//! `capabilities-self`.

use serde_json::{Value, json};
use tracing::{info, warn};

use super::{Core, Ctx, display_path};
use crate::error::{NamespaceError, RequestError};
use crate::mount::{EngineType, MountKind};
use crate::namespace::{Namespace, NamespaceId};
use crate::request::{Operation, Payload, Response, opt_str, opt_str_list, req_str};

/// Splits `sys/<section>[/<name>]`: `Some(None)` for the section itself,
/// `Some(Some(name))` for an entry below it.
fn split_section<'a>(rest: &'a str, section: &str) -> Option<Option<&'a str>> {
    if rest == section {
        return Some(None);
    }
    rest.strip_prefix(section)?
        .strip_prefix('/')
        .map(|name| (!name.is_empty()).then_some(name))
}

impl Core {
    pub(super) async fn handle_sys(&self, ctx: &Ctx<'_>, rest: &str) -> Result<Response, RequestError> {
        if let Some(name) = split_section(rest, "namespaces") {
            return self.sys_namespaces(ctx, name).await;
        }
        if let Some(name) = split_section(rest, "policies/acl") {
            return self.sys_policies(ctx, name, false).await;
        }
        if let Some(name) = split_section(rest, "policy") {
            return self.sys_policies(ctx, name, true).await;
        }
        if let Some(path) = split_section(rest, "mounts") {
            return self.sys_mounts(ctx, MountKind::Secret, path).await;
        }
        if let Some(path) = split_section(rest, "auth") {
            return self.sys_mounts(ctx, MountKind::Auth, path).await;
        }
        if rest == "capabilities-self" {
            return self.capabilities_self(ctx).await;
        }
        Err(ctx.unknown_path())
    }

    async fn sys_namespaces(&self, ctx: &Ctx<'_>, name: Option<&str>) -> Result<Response, RequestError> {
        match (ctx.operation, name) {
            (Operation::List, None) => {
                let children = self.tree.children(ctx.ns).await;
                if children.is_empty() {
                    return Ok(Response::empty());
                }
                let mut key_info = Payload::new();
                let mut keys = Vec::with_capacity(children.len());
                for child in &children {
                    let key = format!("{}/", child.name());
                    key_info.insert(key.clone(), describe_namespace(child));
                    keys.push(key);
                }
                Ok(Response::with_data(json!({ "keys": keys, "key_info": key_info })))
            }
            (Operation::Read, Some(name)) => {
                let child = self.tree.child(ctx.ns, name).await?;
                if !child.is_ready() {
                    return Err(NamespaceError::NotFound {
                        path: child.path().to_owned(),
                    }
                    .into());
                }
                Ok(Response::with_data(describe_namespace(&child)))
            }
            (Operation::Write, Some(name)) => self.create_namespace(ctx.ns, name).await,
            (Operation::Delete, Some(name)) => self.delete_namespace(ctx.ns, name).await,
            _ => Err(ctx.unsupported()),
        }
    }

    async fn create_namespace(&self, parent: &Namespace, name: &str) -> Result<Response, RequestError> {
        let child = self.tree.reserve(parent, name).await?;
        if let Err(e) = self.seed_namespace(&child).await {
            self.tree.abort(&child).await;
            self.purge_namespace(child.id()).await;
            return Err(e);
        }
        Ok(Response::with_data(describe_namespace(&child)))
    }

    async fn seed_namespace(&self, ns: &Namespace) -> Result<(), RequestError> {
        self.policies.seed(ns.id()).await?;
        self.mounts.seed(ns.id()).await?;
        self.tree.commit(ns).await?;
        Ok(())
    }

    async fn purge_namespace(&self, id: &NamespaceId) {
        if let Err(e) = self.namespace_view(id).clear().await {
            warn!(id = %id, error = %e, "failed to purge namespace storage");
        }
        self.mounts.forget(id).await;
    }

    async fn delete_namespace(&self, parent: &Namespace, name: &str) -> Result<Response, RequestError> {
        let child = self.tree.child(parent, name).await?;
        if !child.is_ready() {
            return Err(NamespaceError::NotReady {
                path: child.path().to_owned(),
            }
            .into());
        }

        // Children are only created under this lock, so the check holds
        // until `detach` repeats it atomically.
        let _guard = child.lock_writes().await;
        let children = self.tree.child_count(&child).await;
        if children > 0 {
            return Err(NamespaceError::HasChildren {
                path: child.path().to_owned(),
                children,
            }
            .into());
        }
        let revoked = self.tokens.revoke_namespace(child.id()).await?;
        let purged = self.namespace_view(child.id()).clear().await?;
        self.tree.detach(&child).await?;
        self.mounts.forget(child.id()).await;

        info!(namespace = %child, id = %child.id(), revoked, purged, "namespace deleted");
        Ok(Response::empty())
    }

    async fn sys_policies(
        &self,
        ctx: &Ctx<'_>,
        name: Option<&str>,
        legacy: bool,
    ) -> Result<Response, RequestError> {
        let ns = ctx.ns.id();
        match (ctx.operation, name) {
            (Operation::List, None) => Ok(Response::list(self.policies.list(ns).await?)),
            (Operation::Read, None) if legacy => {
                let names = self.policies.list(ns).await?;
                Ok(Response::with_data(json!({ "keys": names, "policies": names })))
            }
            (Operation::Read, Some(name)) => {
                let policy = self.policies.get(ns, name).await?;
                let field = if legacy { "rules" } else { "policy" };
                Ok(Response::with_data(json!({ "name": policy.name, field: policy.raw })))
            }
            (Operation::Write, Some(name)) => {
                let text = match opt_str(ctx.data, "policy")? {
                    Some(text) => text,
                    None => req_str(ctx.data, "rules")?,
                };
                self.policies.put(ns, name, text).await?;
                Ok(Response::empty())
            }
            (Operation::Delete, Some(name)) => {
                self.policies.delete(ns, name).await?;
                Ok(Response::empty())
            }
            _ => Err(ctx.unsupported()),
        }
    }

    async fn sys_mounts(
        &self,
        ctx: &Ctx<'_>,
        kind: MountKind,
        path: Option<&str>,
    ) -> Result<Response, RequestError> {
        let ns = ctx.ns.id();
        match (ctx.operation, path) {
            (Operation::Read, None) => {
                let mut table = Payload::new();
                for entry in self.mounts.list(ns, kind).await? {
                    table.insert(entry.relative_path().to_owned(), entry.describe());
                }
                Ok(Response {
                    data: Some(table),
                    auth: None,
                })
            }
            (Operation::Read, Some(path)) => {
                let entry = self.mounts.get(ns, kind, path).await?;
                Ok(Response::with_data(entry.describe()))
            }
            (Operation::Write, Some(path)) => {
                let engine_type = req_str(ctx.data, "type")?;
                let engine_type = match kind {
                    MountKind::Secret => {
                        EngineType::parse_secret(engine_type, mount_version(ctx.data).as_deref())?
                    }
                    MountKind::Auth => EngineType::parse_auth(engine_type)?,
                };
                let description = opt_str(ctx.data, "description")?.unwrap_or_default();
                self.mounts.mount(ns, path, engine_type, description).await?;
                Ok(Response::empty())
            }
            (Operation::Delete, Some(path)) => {
                let entry = self.mounts.unmount(ns, kind, path).await?;
                if kind == MountKind::Auth {
                    self.tokens.revoke_issued_by(ns, &entry.path).await?;
                }
                Ok(Response::empty())
            }
            _ => Err(ctx.unsupported()),
        }
    }

    async fn capabilities_self(&self, ctx: &Ctx<'_>) -> Result<Response, RequestError> {
        if ctx.operation != Operation::Write {
            return Err(ctx.unsupported());
        }
        let paths = match opt_str_list(ctx.data, "paths")? {
            Some(paths) if !paths.is_empty() => paths,
            _ => vec![req_str(ctx.data, "path")?.to_owned()],
        };

        let mut data = Payload::new();
        for path in &paths {
            let caps = self
                .evaluator
                .capabilities(ctx.token, ctx.ns, path.trim_start_matches('/'))
                .await?;
            if !data.contains_key("capabilities") {
                data.insert("capabilities".to_owned(), json!(caps));
            }
            data.insert(path.clone(), json!(caps));
        }
        Ok(Response {
            data: Some(data),
            auth: None,
        })
    }
}

fn describe_namespace(ns: &Namespace) -> Value {
    json!({ "id": ns.id(), "path": display_path(ns) })
}

/// `options.version` of a mount request, as a string.
fn mount_version(data: &Payload) -> Option<String> {
    match data.get("options")?.get("version")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
