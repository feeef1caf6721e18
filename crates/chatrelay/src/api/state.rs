//! Application state shared across handlers.

use std::sync::Arc;

use crate::history::HistoryStore;
use crate::relay::RelayConfig;
use crate::upstream::UpstreamClient;

/// Shared state for the relay and history endpoints.
#[derive(Clone)]
pub struct AppState {
    /// Completion provider client.
    pub upstream: Arc<UpstreamClient>,
    /// Conversation history store.
    pub history: Arc<dyn HistoryStore>,
    /// Relay behaviour.
    pub relay: RelayConfig,
    /// Origins allowed to call the API with credentials. Empty means localhost only.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        upstream: UpstreamClient,
        history: Arc<dyn HistoryStore>,
        relay: RelayConfig,
    ) -> Self {
        Self {
            upstream: Arc::new(upstream),
            history,
            relay,
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}
