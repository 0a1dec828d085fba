//! Handlers for the built-in token auth method at `auth/token/`.

use chrono::Duration;
use serde_json::{Value, json};
use tracing::info;

use super::{Core, Ctx};
use crate::error::{DenyReason, RequestError};
use crate::mount::TOKEN_MOUNT_PATH;
use crate::policy::{Capability, DEFAULT_POLICY, ROOT_POLICY};
use crate::request::{
    Operation, Response, opt_bool, opt_duration_secs, opt_str, opt_str_list, opt_string_map,
    req_str,
};
use crate::token::{CreateTokenParams, TokenEntry, normalize_policies, token_namespace};

impl Core {
    pub(super) async fn handle_token(&self, ctx: &Ctx<'_>, rest: &str) -> Result<Response, RequestError> {
        match (rest, ctx.operation) {
            ("create", Operation::Write) => self.token_create(ctx).await,
            ("lookup-self", Operation::Read) => {
                let data = self.describe_token(ctx.client_token, ctx.token).await;
                Ok(Response::with_data(data))
            }
            ("lookup", Operation::Write) => {
                let target = req_str(ctx.data, "token")?;
                self.ensure_reachable(ctx, target).await?;
                let entry = self.tokens.lookup(target).await?;
                Ok(Response::with_data(self.describe_token(target, &entry).await))
            }
            ("revoke", Operation::Write) => {
                let target = req_str(ctx.data, "token")?;
                self.ensure_reachable(ctx, target).await?;
                let revoked = self.tokens.revoke(target).await?;
                info!(namespace = %ctx.ns, revoked, "token revoked by request");
                Ok(Response::empty())
            }
            ("revoke-self", Operation::Write) => {
                self.tokens.revoke_entry(ctx.token).await?;
                Ok(Response::empty())
            }
            ("renew-self", Operation::Write) => {
                let increment = opt_duration_secs(ctx.data, "increment")?
                    .filter(|secs| *secs > 0)
                    .unwrap_or(self.config.default_token_ttl_secs);
                let entry = self
                    .tokens
                    .renew(ctx.client_token, Duration::seconds(increment))
                    .await?;
                Ok(Response {
                    data: None,
                    auth: Some(self.auth_response(ctx.client_token.to_owned(), &entry).await),
                })
            }
            ("create" | "lookup-self" | "lookup" | "revoke" | "revoke-self" | "renew-self", _) => {
                Err(ctx.unsupported())
            }
            _ => Err(ctx.unknown_path()),
        }
    }

    async fn token_create(&self, ctx: &Ctx<'_>) -> Result<Response, RequestError> {
        let caller = ctx.token;
        let data = ctx.data;

        let no_parent = opt_bool(data, "no_parent")?.unwrap_or(false);
        if no_parent && !caller.is_root() {
            return Err(ctx.denied(Capability::Sudo, DenyReason::CapabilityMissing));
        }
        // Policy names only mean something in the caller's own namespace.
        if !caller.is_root() && ctx.ns.id() != &caller.namespace_id {
            return Err(ctx.denied(Capability::Create, DenyReason::NamespaceMismatch));
        }
        let no_default = opt_bool(data, "no_default_policy")?.unwrap_or(false);

        let requested = opt_str_list(data, "policies")?.unwrap_or_default();
        let mut policies = if requested.is_empty() {
            caller.policies.clone()
        } else {
            if !caller.is_root() {
                let held = normalize_policies(&caller.policies, true);
                if let Some(extra) = normalize_policies(&requested, true)
                    .into_iter()
                    .find(|p| p != DEFAULT_POLICY && !held.contains(p))
                {
                    return Err(RequestError::invalid(format!(
                        "child token policies must be a subset of the caller's; '{extra}' is not held"
                    )));
                }
            }
            requested
        };
        if no_default {
            policies.retain(|p| p != DEFAULT_POLICY);
        }
        let minting_root = policies.iter().any(|p| p == ROOT_POLICY);

        let mut ttl_secs = opt_duration_secs(data, "ttl")?.filter(|secs| *secs > 0);
        if ttl_secs.is_none() && !minting_root {
            ttl_secs = Some(self.config.default_token_ttl_secs);
        }
        if !no_parent && caller.expires_at.is_some() {
            let remaining = caller.ttl_secs();
            ttl_secs = Some(ttl_secs.map_or(remaining, |ttl| ttl.min(remaining)));
        }
        let max_ttl_secs = opt_duration_secs(data, "explicit_max_ttl")?
            .filter(|secs| *secs > 0)
            .or((!minting_root).then_some(self.config.default_max_ttl_secs));

        let display_name = match opt_str(data, "display_name")? {
            Some(name) if !name.is_empty() => format!("token-{name}"),
            _ => "token".to_owned(),
        };

        let (client_token, entry) = self
            .tokens
            .create(CreateTokenParams {
                namespace_id: ctx.ns.id().clone(),
                policies,
                no_default_policy: no_default,
                ttl: ttl_secs.map(Duration::seconds),
                max_ttl: max_ttl_secs.map(Duration::seconds),
                renewable: opt_bool(data, "renewable")?.unwrap_or(true),
                parent_hash: (!no_parent).then(|| caller.token_hash.clone()),
                meta: opt_string_map(data, "meta")?.unwrap_or_default(),
                display_name,
                issued_by: TOKEN_MOUNT_PATH.to_owned(),
                id: None,
            })
            .await?;

        Ok(Response {
            data: None,
            auth: Some(self.auth_response(client_token, &entry).await),
        })
    }

    /// Another token may be looked up or revoked when it lives in the
    /// request namespace or below it, or when the caller is a root token
    /// whose own namespace is an ancestor-or-self of the target's.
    async fn ensure_reachable(&self, ctx: &Ctx<'_>, target: &str) -> Result<(), RequestError> {
        let target_ns = token_namespace(target);
        if self.tree.is_ancestor_or_self(ctx.ns.id(), &target_ns).await {
            return Ok(());
        }
        if ctx.token.is_root()
            && self
                .tree
                .is_ancestor_or_self(&ctx.token.namespace_id, &target_ns)
                .await
        {
            return Ok(());
        }
        Err(ctx.denied(Capability::Update, DenyReason::NamespaceMismatch))
    }

    async fn describe_token(&self, client_token: &str, entry: &TokenEntry) -> Value {
        json!({
            "id": client_token,
            "accessor": entry.log_id(),
            "policies": entry.policies,
            "namespace_path": self.namespace_path(&entry.namespace_id).await,
            "display_name": entry.display_name,
            "meta": entry.meta,
            "path": entry.issued_by,
            "creation_time": entry.created_at.timestamp(),
            "expire_time": entry.expires_at.map(|at| at.to_rfc3339()),
            "ttl": entry.ttl_secs(),
            "explicit_max_ttl": entry.max_ttl_secs.unwrap_or(0),
            "renewable": entry.renewable,
            "orphan": entry.parent_hash.is_none(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use nsvault_storage::MemoryBackend;
    use serde_json::json;

    use crate::config::CoreConfig;
    use crate::engine::Core;
    use crate::error::ErrorKind;
    use crate::request::Request;

    async fn setup() -> (Core, String) {
        Core::initialize(Arc::new(MemoryBackend::new()), CoreConfig::default())
            .await
            .unwrap()
    }

    async fn mint(core: &Core, parent: &str, body: serde_json::Value) -> String {
        core.handle(Request::write("auth/token/create").token(parent).data(body))
            .await
            .unwrap()
            .auth
            .unwrap()
            .client_token
    }

    #[tokio::test]
    async fn lookup_self_reports_sorted_policies() {
        let (core, root) = setup().await;
        core.handle(
            Request::write("sys/policies/acl/readpolicy")
                .token(&root)
                .data(json!({ "policy": r#"path "kv/data/*" { capabilities = ["read"] }"# })),
        )
        .await
        .unwrap();
        let token = mint(&core, &root, json!({ "policies": ["readpolicy"] })).await;

        let me = core
            .handle(Request::read("auth/token/lookup-self").token(&token))
            .await
            .unwrap();
        assert_eq!(me.get("policies").unwrap(), &json!(["default", "readpolicy"]));
        assert_eq!(me.get("namespace_path").unwrap(), &json!(""));
    }

    #[tokio::test]
    async fn non_root_cannot_escalate() {
        let (core, root) = setup().await;
        let token = mint(&core, &root, json!({ "policies": ["default"] })).await;

        // `default` does not grant auth/token/create.
        let err = core
            .handle(
                Request::write("auth/token/create")
                    .token(&token)
                    .data(json!({ "policies": ["root"] })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn child_policies_must_be_held_by_caller() {
        let (core, root) = setup().await;
        core.handle(
            Request::write("sys/policies/acl/minter")
                .token(&root)
                .data(json!({ "policy": r#"path "auth/token/create" { capabilities = ["update"] }"# })),
        )
        .await
        .unwrap();
        let minter = mint(&core, &root, json!({ "policies": ["minter"] })).await;

        let err = core
            .handle(
                Request::write("auth/token/create")
                    .token(&minter)
                    .data(json!({ "policies": ["other"] })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let child = mint(&core, &minter, json!({})).await;
        let me = core
            .handle(Request::read("auth/token/lookup-self").token(&child))
            .await
            .unwrap();
        assert_eq!(me.get("policies").unwrap(), &json!(["default", "minter"]));
        assert_eq!(me.get("orphan").unwrap(), &json!(false));

        let err = core
            .handle(
                Request::write("auth/token/create")
                    .token(&minter)
                    .data(json!({ "no_parent": true })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn revoking_a_parent_revokes_children() {
        let (core, root) = setup().await;
        let parent = mint(&core, &root, json!({ "policies": ["root"] })).await;
        let child = mint(&core, &parent, json!({ "policies": ["default"] })).await;

        core.handle(
            Request::write("auth/token/revoke")
                .token(&root)
                .data(json!({ "token": parent })),
        )
        .await
        .unwrap();

        for token in [&parent, &child] {
            let err = core
                .handle(Request::read("auth/token/lookup-self").token(token))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unauthenticated);
        }
    }

    #[tokio::test]
    async fn revoke_self_and_renew_self() {
        let (core, root) = setup().await;
        let token = mint(&core, &root, json!({ "policies": ["default"], "ttl": "1h" })).await;

        let renewed = core
            .handle(
                Request::write("auth/token/renew-self")
                    .token(&token)
                    .data(json!({ "increment": "2h" })),
            )
            .await
            .unwrap();
        let lease = renewed.auth.unwrap().lease_duration;
        assert!(lease > 3600 && lease <= 7200);

        core.handle(Request::write("auth/token/revoke-self").token(&token))
            .await
            .unwrap();
        let err = core
            .handle(Request::read("auth/token/lookup-self").token(&token))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn wrong_operation_is_invalid_request() {
        let (core, root) = setup().await;
        let err = core
            .handle(Request::delete("auth/token/create").token(&root))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = core
            .handle(Request::read("auth/token/bogus").token(&root))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
