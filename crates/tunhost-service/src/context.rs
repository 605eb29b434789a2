//! Process-scoped service context.

use crate::settings::ServiceSettings;
use std::sync::Arc;
use tunhost_config::{ConfigStore, EmbeddedValues, TunnelConfigManager};

/// Everything the service shares with the rest of the process. Built
/// once at process start and handed to the service explicitly.
#[derive(Clone)]
pub struct ServiceContext {
    pub settings: ServiceSettings,
    pub embedded: Arc<EmbeddedValues>,
    pub config: Arc<TunnelConfigManager>,
}

impl ServiceContext {
    pub fn new(
        settings: ServiceSettings,
        embedded: Arc<EmbeddedValues>,
        config: Arc<TunnelConfigManager>,
    ) -> Self {
        Self {
            settings,
            embedded,
            config,
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        self.config.store()
    }
}
