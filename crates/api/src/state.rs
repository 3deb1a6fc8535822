//! Application state

use std::sync::Arc;

use repurpose_credits::{CreditEngine, TierTable};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub engine: CreditEngine,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, tiers: TierTable) -> Self {
        let engine = CreditEngine::new(pool.clone(), tiers, config.lock_timeout_ms);
        Self {
            pool,
            config: Arc::new(config),
            engine,
        }
    }
}
