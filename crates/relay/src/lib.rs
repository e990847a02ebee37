//! Session registry and message-routing engine of the chat relay.
//!
//! Transports hand each accepted connection to [`connection::drive`] together
//! with a stream of raw text frames; everything after that (authentication,
//! chat resolution, persistence, fan-out, chat-list refreshes) happens here.

use std::sync::Arc;

use shared::error::ApiError;
use storage::ChatStore;
use tracing::error;

pub mod auth;
pub mod connection;
pub mod directory;
pub mod projector;
pub mod registry;
pub mod resolver;
pub mod router;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

pub use connection::drive;
pub use registry::{ConnectionHandle, Outbox, Session, SessionRegistry};

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const DEFAULT_SEARCH_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub bcrypt_cost: u32,
    pub history_limit: u32,
    pub search_limit: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bcrypt_cost: bcrypt::DEFAULT_COST,
            history_limit: DEFAULT_HISTORY_LIMIT,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

#[derive(Clone)]
pub struct RelayContext {
    pub store: Arc<dyn ChatStore>,
    pub sessions: SessionRegistry,
    pub settings: RelaySettings,
}

impl RelayContext {
    pub fn new(store: impl ChatStore + 'static, settings: RelaySettings) -> Self {
        Self {
            store: Arc::new(store),
            sessions: SessionRegistry::default(),
            settings,
        }
    }
}

/// Store failures never leave the component that hit them: they are logged
/// here and reported to the initiating connection as a persistence error.
pub(crate) fn persistence(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "store operation failed");
    ApiError::persistence("storage is unavailable, try again later")
}
