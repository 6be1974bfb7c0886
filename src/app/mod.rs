//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::engine::EngineRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<EngineRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(EngineRegistry::new(config.clone()));

        Self { config, registry }
    }
}
