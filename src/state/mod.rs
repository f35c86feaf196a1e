pub mod code;
pub mod lane;
pub mod registry;
pub mod session;
pub mod tally;

pub use lane::{SessionHandle, SessionSnapshot};
pub use registry::SessionRegistry;
pub use session::{Departure, Poll, PollDefinition};

use crate::abuse::AbuseConfig;
use crate::config::ServerConfig;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub config: Arc<ServerConfig>,
    pub abuse: Arc<AbuseConfig>,
}

impl AppState {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default(), AbuseConfig::default())
    }

    pub fn with_config(config: ServerConfig, abuse: AbuseConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config.limits.clone(), config.max_code_attempts),
            config: Arc::new(config),
            abuse: Arc::new(abuse),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
