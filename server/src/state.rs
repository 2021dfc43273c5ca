//! Shared gateway state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::tunnel::hub::HubHandle;

#[derive(Clone)]
pub struct GatewayState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Command channel into the relay reactor.
    pub hub: HubHandle,
    /// Monotonic instant when the gateway started (for uptime calculation).
    pub start_time: Instant,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, hub: HubHandle) -> Self {
        Self {
            config,
            hub,
            start_time: Instant::now(),
        }
    }
}
