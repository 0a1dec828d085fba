//! Error types for `nsvault-core`.
//!
//! Each component has its own error enum carrying enough context to diagnose
//! the failure without a debugger. Every enum maps onto the closed set of
//! [`ErrorKind`]s, which is what callers (and the HTTP layer) branch on.
//! None of these errors are retryable from the engine's point of view.

use nsvault_storage::StorageError;

/// The semantic category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown namespace, policy, mount, role, user, secret or route.
    NotFound,
    /// Duplicate creation.
    Conflict,
    /// Namespace deletion blocked by child namespaces.
    NotEmpty,
    /// Malformed policy text.
    InvalidPolicy,
    /// Attempt to remove or alter a built-in object.
    Protected,
    /// Missing, expired or revoked token.
    Unauthenticated,
    /// A capability check failed.
    PermissionDenied,
    /// Login with a bad secret.
    InvalidCredentials,
    /// Malformed request payload or unsupported operation.
    InvalidRequest,
    /// Engine shut down or namespace not ready in time.
    Unavailable,
    /// Storage or serialization failure.
    Internal,
}

impl ErrorKind {
    /// Stable snake_case identifier for wire formats and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::NotEmpty => "not_empty",
            Self::InvalidPolicy => "invalid_policy",
            Self::Protected => "protected",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidRequest => "invalid_request",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the storage view every store persists through.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stored value could not be encoded or decoded.
    #[error("codec error for key '{key}': {reason}")]
    Codec { key: String, reason: String },
}

/// Errors from namespace tree operations.
#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    /// A path segment does not exist.
    #[error("namespace not found: {path}")]
    NotFound { path: String },

    /// A sibling with the same name already exists.
    #[error("namespace already exists: {path}")]
    AlreadyExists { path: String },

    /// The namespace still has child namespaces.
    #[error("namespace '{path}' still has {children} child namespace(s)")]
    HasChildren { path: String, children: usize },

    /// The requested name is not a valid single path segment.
    #[error("invalid namespace name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// The namespace did not become ready within the configured timeout.
    #[error("namespace '{path}' is not ready")]
    NotReady { path: String },

    /// The engine has not been initialized on this storage backend.
    #[error("engine is not initialized")]
    NotInitialized,

    /// The engine was already initialized on this storage backend.
    #[error("engine is already initialized")]
    AlreadyInitialized,

    /// Persisting namespace state failed.
    #[error("namespace store error: {0}")]
    Store(#[from] StoreError),
}

impl NamespaceError {
    /// The semantic category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } | Self::AlreadyInitialized => ErrorKind::Conflict,
            Self::HasChildren { .. } => ErrorKind::NotEmpty,
            Self::InvalidName { .. } => ErrorKind::InvalidRequest,
            Self::NotReady { .. } | Self::NotInitialized => ErrorKind::Unavailable,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from policy operations.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The requested policy was not found.
    #[error("policy not found: {name}")]
    NotFound { name: String },

    /// The policy text is malformed.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// The policy is built in and cannot be changed this way.
    #[error("cannot {action} built-in policy '{name}'")]
    BuiltIn { name: String, action: &'static str },

    /// Persisting the policy failed.
    #[error("policy store error: {0}")]
    Store(#[from] StoreError),
}

impl PolicyError {
    /// The semantic category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Invalid { .. } => ErrorKind::InvalidPolicy,
            Self::BuiltIn { .. } => ErrorKind::Protected,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from mount table operations.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// The mount path is already in use.
    #[error("path is already in use at {path}")]
    AlreadyMounted { path: String },

    /// Nothing is mounted at the path.
    #[error("no mount at {path}")]
    NotFound { path: String },

    /// The mount path is malformed or reserved.
    #[error("invalid mount path: {reason}")]
    InvalidPath { reason: String },

    /// The engine type is unknown or not allowed at this table.
    #[error("unsupported engine type: {engine_type}")]
    UnknownEngineType { engine_type: String },

    /// The mount cannot be removed or replaced.
    #[error("mount {path} cannot be {action}")]
    Protected { path: String, action: &'static str },

    /// Persisting the mount table failed.
    #[error("mount store error: {0}")]
    Store(#[from] StoreError),
}

impl MountError {
    /// The semantic category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyMounted { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidPath { .. } | Self::UnknownEngineType { .. } => ErrorKind::InvalidRequest,
            Self::Protected { .. } => ErrorKind::Protected,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token is unknown or has been revoked.
    #[error("invalid token")]
    NotFound,

    /// The token's TTL has passed.
    #[error("token expired at {expired_at}")]
    Expired { expired_at: String },

    /// The token cannot be renewed.
    #[error("token is not renewable")]
    NotRenewable,

    /// The token has reached its maximum lifetime.
    #[error("token has exceeded max TTL of {max_ttl_secs}s")]
    MaxTtlExceeded { max_ttl_secs: i64 },

    /// Persisting the token failed.
    #[error("token store error: {0}")]
    Store(#[from] StoreError),
}

impl TokenError {
    /// The semantic category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound | Self::Expired { .. } => ErrorKind::Unauthenticated,
            Self::NotRenewable | Self::MaxTtlExceeded { .. } => ErrorKind::InvalidRequest,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from the KV v2 secrets engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No live secret at the path.
    #[error("secret not found at path '{path}'")]
    NotFound { path: String },

    /// The request is malformed for this engine.
    #[error("invalid engine request: {reason}")]
    InvalidRequest { reason: String },

    /// Persisting the secret failed.
    #[error("engine store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// The semantic category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from the AppRole auth method.
#[derive(Debug, thiserror::Error)]
pub enum AppRoleError {
    /// The named role does not exist.
    #[error("approle role not found: {name}")]
    RoleNotFound { name: String },

    /// No role on this mount carries the presented role ID.
    #[error("invalid role ID")]
    InvalidRoleId,

    /// The secret ID is unknown, destroyed, exhausted or expired.
    #[error("invalid secret ID for role '{role_name}'")]
    InvalidSecretId { role_name: String },

    /// The role definition or request is malformed.
    #[error("invalid approle request: {reason}")]
    InvalidConfig { reason: String },

    /// Persisting the role failed.
    #[error("approle store error: {0}")]
    Store(#[from] StoreError),
}

impl AppRoleError {
    /// The semantic category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoleNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidRoleId => ErrorKind::PermissionDenied,
            Self::InvalidSecretId { .. } => ErrorKind::InvalidCredentials,
            Self::InvalidConfig { .. } => ErrorKind::InvalidRequest,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from the userpass auth method.
#[derive(Debug, thiserror::Error)]
pub enum UserpassError {
    /// The named user does not exist.
    #[error("user not found: {username}")]
    UserNotFound { username: String },

    /// Unknown user or wrong password.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// The user definition or request is malformed.
    #[error("invalid userpass request: {reason}")]
    InvalidConfig { reason: String },

    /// Persisting the user failed.
    #[error("userpass store error: {0}")]
    Store(#[from] StoreError),
}

impl UserpassError {
    /// The semantic category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UserNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::InvalidConfig { .. } => ErrorKind::InvalidRequest,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Which evaluator step refused the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The token belongs to a namespace that cannot act here.
    NamespaceMismatch,
    /// No rule pattern matched the path.
    NoMatchingRule,
    /// The matched rule lacks the capability.
    CapabilityMissing,
    /// The matched rule carries an explicit `deny`.
    ExplicitDeny,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NamespaceMismatch => "token is not valid in this namespace",
            Self::NoMatchingRule => "no policy rule matches the path",
            Self::CapabilityMissing => "capability not granted",
            Self::ExplicitDeny => "explicitly denied",
        };
        f.write_str(text)
    }
}

/// Errors from the authorization evaluator.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The request was refused.
    #[error("permission denied: {capability} on '{path}' in namespace '{namespace}' ({reason})")]
    Denied {
        namespace: String,
        path: String,
        capability: String,
        reason: DenyReason,
    },

    /// Loading the token's policies failed.
    #[error("access policy error: {0}")]
    Policy(#[from] PolicyError),
}

impl AccessError {
    /// The semantic category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Denied { .. } => ErrorKind::PermissionDenied,
            Self::Policy(e) => e.kind(),
        }
    }
}

/// Top-level error returned by [`Core::handle`](crate::engine::Core::handle).
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Namespace resolution or lifecycle failure.
    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    /// Policy store failure.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Mount table failure.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// Token store failure.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// KV engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// AppRole failure.
    #[error(transparent)]
    AppRole(#[from] AppRoleError),

    /// Userpass failure.
    #[error(transparent)]
    Userpass(#[from] UserpassError),

    /// Authorization failure.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// Raw storage failure outside a specific store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The request carried no token on an authenticated path.
    #[error("missing client token")]
    MissingToken,

    /// The payload is malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Nothing handles this path.
    #[error("no handler for route '{path}'")]
    UnsupportedPath { path: String },

    /// The path exists but does not support the operation.
    #[error("unsupported operation {operation} on '{path}'")]
    UnsupportedOperation { path: String, operation: String },

    /// The engine has been shut down.
    #[error("engine is shut down")]
    Closed,
}

impl RequestError {
    /// The semantic category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Namespace(e) => e.kind(),
            Self::Policy(e) => e.kind(),
            Self::Mount(e) => e.kind(),
            Self::Token(e) => e.kind(),
            Self::Engine(e) => e.kind(),
            Self::AppRole(e) => e.kind(),
            Self::Userpass(e) => e.kind(),
            Self::Access(e) => e.kind(),
            Self::Store(_) => ErrorKind::Internal,
            Self::MissingToken => ErrorKind::Unauthenticated,
            Self::InvalidRequest { .. } | Self::UnsupportedOperation { .. } => {
                ErrorKind::InvalidRequest
            }
            Self::UnsupportedPath { .. } => ErrorKind::NotFound,
            Self::Closed => ErrorKind::Unavailable,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}
