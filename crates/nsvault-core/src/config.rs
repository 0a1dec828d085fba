//! Engine configuration.

use std::time::Duration;

use crate::kv::DEFAULT_MAX_VERSIONS;

/// Default token TTL: 32 days (`768h`).
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 768 * 3600;

/// Tunables for a [`Core`](crate::engine::Core).
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How long a request waits for a freshly created namespace to become
    /// ready before failing with `Unavailable`.
    pub namespace_ready_timeout: Duration,
    /// TTL for issued tokens when neither the request nor the auth method
    /// sets one.
    pub default_token_ttl_secs: i64,
    /// Upper bound on renewals when nothing else sets one.
    pub default_max_ttl_secs: i64,
    /// `max_versions` for KV mounts without their own config.
    pub kv_max_versions: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            namespace_ready_timeout: Duration::from_secs(5),
            default_token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            default_max_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            kv_max_versions: DEFAULT_MAX_VERSIONS,
        }
    }
}
