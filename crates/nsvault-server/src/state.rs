//! Shared application state for the `nsvault` server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. Everything the handlers need is reached through
//! the engine handle it owns.

use chrono::{DateTime, Utc};

use nsvault_core::Core;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// The authorization and identity engine.
    pub core: Core,
    /// When the server started serving.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wrap an engine for serving.
    #[must_use]
    pub fn new(core: Core) -> Self {
        Self {
            core,
            started_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
