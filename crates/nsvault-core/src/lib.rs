//! Core library for `nsvault`.
//!
//! A hierarchical, multi-tenant authorization and identity engine for a
//! secrets manager: the namespace tree, per-namespace policy stores and
//! mount tables, token issuance through the token, userpass and AppRole
//! auth methods, the path/capability evaluator, and a KV v2 secrets engine.
//! Everything is reached through one [`Core`] handle and its uniform
//! [`Request`] interface. Persistence goes through the `nsvault-storage`
//! backend trait.

pub mod acl;
pub mod approle;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod kv;
pub mod mount;
pub mod namespace;
pub mod policy;
pub mod policy_parser;
pub mod request;
pub mod token;
pub mod userpass;
pub mod view;

pub use crate::config::CoreConfig;
pub use crate::engine::Core;
pub use crate::error::{ErrorKind, RequestError};
pub use crate::request::{AuthResponse, Operation, Payload, Request, Response};
