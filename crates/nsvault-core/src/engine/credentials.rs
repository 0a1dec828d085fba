//! Handlers for AppRole and userpass mounts, and the shared login flow.

use serde_json::json;

use super::{Core, Ctx};
use crate::approle::{AppRole, AppRoleStore, RoleParams};
use crate::auth::{AuthMethod, Credentials};
use crate::error::{RequestError, UserpassError};
use crate::mount::MountEntry;
use crate::namespace::Namespace;
use crate::request::{
    Operation, Payload, Response, opt_bool, opt_duration_secs, opt_str, opt_str_list, opt_u32,
    req_str,
};
use crate::token::CreateTokenParams;
use crate::userpass::{UserEntry, UserParams, UserpassStore};

impl Core {
    /// Verify login credentials against an auth mount and mint a token in
    /// the mount's namespace.
    pub(super) async fn login(
        &self,
        ns: &Namespace,
        entry: &MountEntry,
        method: &AuthMethod,
        rest: &str,
        data: &Payload,
    ) -> Result<Response, RequestError> {
        let credentials = match method {
            AuthMethod::AppRole(_) => Credentials::AppRole {
                role_id: req_str(data, "role_id")?,
                secret_id: opt_str(data, "secret_id")?.unwrap_or_default(),
            },
            AuthMethod::Userpass(_) => Credentials::Userpass {
                username: rest.strip_prefix("login/").unwrap_or_default(),
                password: req_str(data, "password")?,
            },
            AuthMethod::Token => {
                return Err(RequestError::UnsupportedPath {
                    path: format!("{}{rest}", entry.path),
                });
            }
        };
        let granted = method.authenticate(credentials).await?;

        let (ttl, max_ttl) = self.login_lifetimes(granted.ttl_secs, granted.max_ttl_secs);
        let (client_token, token) = self
            .tokens
            .create(CreateTokenParams {
                namespace_id: ns.id().clone(),
                policies: granted.policies,
                ttl: Some(ttl),
                max_ttl: Some(max_ttl),
                renewable: true,
                meta: granted.meta,
                display_name: granted.display_name,
                issued_by: entry.path.clone(),
                ..CreateTokenParams::default()
            })
            .await?;

        Ok(Response {
            data: None,
            auth: Some(self.auth_response(client_token, &token).await),
        })
    }
}

pub(super) async fn handle_approle(
    ctx: &Ctx<'_>,
    store: &AppRoleStore,
    rest: &str,
) -> Result<Response, RequestError> {
    let segments: Vec<&str> = rest.split('/').collect();
    match (segments.as_slice(), ctx.operation) {
        (["role"], Operation::List) => Ok(Response::list(store.list_roles().await?)),
        (["role", name], Operation::Read) => {
            let role = store.get_role(name).await?;
            Ok(Response::with_data(describe_role(&role)))
        }
        (["role", name], Operation::Write) => {
            store.write_role(name, role_params(ctx.data)?).await?;
            Ok(Response::empty())
        }
        (["role", name], Operation::Delete) => {
            store.delete_role(name).await?;
            Ok(Response::empty())
        }
        (["role", name, "role-id"], Operation::Read) => {
            let role_id = store.get_role_id(name).await?;
            Ok(Response::with_data(json!({ "role_id": role_id })))
        }
        (["role", name, "secret-id"], Operation::Write) => {
            let issued = store.generate_secret_id(name).await?;
            Ok(Response::with_data(json!({
                "secret_id": issued.secret_id,
                "secret_id_accessor": issued.accessor,
                "secret_id_ttl": issued.ttl_secs,
            })))
        }
        (["role", name, "secret-id"], Operation::List) => {
            Ok(Response::list(store.list_secret_id_accessors(name).await?))
        }
        (["role", name, "secret-id", "lookup"], Operation::Write) => {
            let entry = store
                .lookup_secret_id(name, req_str(ctx.data, "secret_id")?)
                .await?;
            Ok(Response::with_data(json!({
                "secret_id_accessor": entry.accessor,
                "secret_id_num_uses": entry.num_uses_left,
                "creation_time": entry.created_at.to_rfc3339(),
                "expiration_time": entry.expires_at.map(|at| at.to_rfc3339()),
            })))
        }
        (["role", name, "secret-id", "destroy"], Operation::Write | Operation::Delete) => {
            store
                .destroy_secret_id(name, req_str(ctx.data, "secret_id")?)
                .await?;
            Ok(Response::empty())
        }
        (
            ["role"]
            | ["role", _]
            | ["role", _, "role-id" | "secret-id"]
            | ["role", _, "secret-id", "lookup" | "destroy"],
            _,
        ) => Err(ctx.unsupported()),
        _ => Err(ctx.unknown_path()),
    }
}

fn role_params(data: &Payload) -> Result<RoleParams, RequestError> {
    Ok(RoleParams {
        policies: policies_field(data)?,
        token_ttl_secs: opt_duration_secs(data, "token_ttl")?,
        token_max_ttl_secs: opt_duration_secs(data, "token_max_ttl")?,
        bind_secret_id: opt_bool(data, "bind_secret_id")?,
        secret_id_num_uses: opt_u32(data, "secret_id_num_uses")?,
        secret_id_ttl_secs: opt_duration_secs(data, "secret_id_ttl")?,
    })
}

fn describe_role(role: &AppRole) -> serde_json::Value {
    json!({
        "policies": role.policies,
        "token_policies": role.policies,
        "token_ttl": role.token_ttl_secs,
        "token_max_ttl": role.token_max_ttl_secs,
        "bind_secret_id": role.bind_secret_id,
        "secret_id_num_uses": role.secret_id_num_uses,
        "secret_id_ttl": role.secret_id_ttl_secs,
    })
}

pub(super) async fn handle_userpass(
    ctx: &Ctx<'_>,
    store: &UserpassStore,
    rest: &str,
) -> Result<Response, RequestError> {
    let segments: Vec<&str> = rest.split('/').collect();
    match (segments.as_slice(), ctx.operation) {
        (["users"], Operation::List) => Ok(Response::list(store.list_users().await?)),
        (["users", name], Operation::Read) => {
            let user = store.get_user(name).await?;
            Ok(Response::with_data(describe_user(&user)))
        }
        (["users", name], Operation::Write) => {
            store.write_user(name, user_params(ctx.data)?).await?;
            Ok(Response::empty())
        }
        (["users", name], Operation::Delete) => {
            store.delete_user(name).await?;
            Ok(Response::empty())
        }
        (["users", name, "password"], Operation::Write) => {
            store.get_user(name).await?;
            let params = UserParams {
                password: Some(req_str(ctx.data, "password")?.to_owned()),
                ..UserParams::default()
            };
            store.write_user(name, params).await?;
            Ok(Response::empty())
        }
        (["users", name, "policies"], Operation::Write) => {
            store.get_user(name).await?;
            let policies = policies_field(ctx.data)?.ok_or_else(|| {
                UserpassError::InvalidConfig {
                    reason: "missing required field 'policies'".to_owned(),
                }
            })?;
            let params = UserParams {
                policies: Some(policies),
                ..UserParams::default()
            };
            store.write_user(name, params).await?;
            Ok(Response::empty())
        }
        (["users"] | ["users", _] | ["users", _, "password" | "policies"] | ["login", _], _) => {
            Err(ctx.unsupported())
        }
        _ => Err(ctx.unknown_path()),
    }
}

fn user_params(data: &Payload) -> Result<UserParams, RequestError> {
    Ok(UserParams {
        password: opt_str(data, "password")?.map(String::from),
        policies: policies_field(data)?,
        token_ttl_secs: opt_duration_secs(data, "token_ttl")?,
        token_max_ttl_secs: opt_duration_secs(data, "token_max_ttl")?,
    })
}

fn describe_user(user: &UserEntry) -> serde_json::Value {
    json!({
        "policies": user.policies,
        "token_policies": user.policies,
        "token_ttl": user.token_ttl_secs,
        "token_max_ttl": user.token_max_ttl_secs,
    })
}

/// `token_policies`, falling back to `policies`.
fn policies_field(data: &Payload) -> Result<Option<Vec<String>>, RequestError> {
    match opt_str_list(data, "token_policies")? {
        Some(policies) => Ok(Some(policies)),
        None => opt_str_list(data, "policies"),
    }
}
