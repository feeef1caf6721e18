//! Model and temperature selection, persisted in the local cache.

use tracing::debug;

use super::cache::LocalCache;
use crate::chat::{Settings, clamp_temperature};

/// Holds the current settings and writes every change through to the cache.
#[derive(Debug, Clone)]
pub struct SettingsPanel {
    cache: LocalCache,
    settings: Settings,
}

impl SettingsPanel {
    /// Load cached settings, falling back to defaults on a miss.
    pub async fn mount(cache: LocalCache) -> Self {
        let settings = cache
            .load_settings()
            .await
            .map(Settings::normalized)
            .unwrap_or_default();
        Self { cache, settings }
    }

    pub fn current(&self) -> &Settings {
        &self.settings
    }

    /// Select a model. Identifiers outside the known list are accepted.
    pub async fn set_model(&mut self, model: impl Into<String>) -> &Settings {
        self.settings.model = model.into();
        self.settings = std::mem::take(&mut self.settings).normalized();
        self.persist().await;
        &self.settings
    }

    pub async fn set_temperature(&mut self, temperature: f32) -> &Settings {
        self.settings.temperature = clamp_temperature(temperature);
        self.persist().await;
        &self.settings
    }

    async fn persist(&self) {
        if let Err(err) = self.cache.store_settings(&self.settings).await {
            debug!(error = %err, "settings not cached");
        }
    }
}
