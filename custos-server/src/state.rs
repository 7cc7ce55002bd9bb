//! Application state shared across all request handlers.

use std::sync::Arc;

use custos_core::config::{ConfigStore, SharedConfig};
use custos_core::engine::TradeFlow;
use custos_core::store::PgStore;

use crate::telegram::TelegramGateway;

/// The concrete engine the server runs: Postgres store, Telegram gateway.
pub type Engine = TradeFlow<PgStore, TelegramGateway>;

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    /// The trade orchestration engine.
    pub flow: Arc<Engine>,
    /// Validated runtime configuration. The admin roster and secret hash
    /// reload via SIGHUP; the rest is fixed for the life of the process.
    pub config: SharedConfig,
    /// Shared secret the frontend service must present. Reloads via SIGHUP.
    pub service_secret: ConfigStore<String>,
}

impl AppState {
    pub fn new(flow: Arc<Engine>, config: SharedConfig, service_secret: String) -> Self {
        Self {
            flow,
            config,
            service_secret: ConfigStore::new(service_secret),
        }
    }
}
