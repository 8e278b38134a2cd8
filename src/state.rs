// src/state.rs
// Explicit dependency wiring: one store, one cache, one service, one batch
// executor, assembled at startup and shared by reference.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::batch::{BatchConfig, BatchExecutor};
use crate::config::CONFIG;
use crate::context::cache::{CacheConfig, ContextCache};
use crate::context::service::ContextService;
use crate::context::store::{ContextStore, SqliteContextStore};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ContextService>,
    pub batch: Arc<BatchExecutor>,
}

/// Assemble the application state from explicit component configs.
pub fn create_app_state_with(
    pool: SqlitePool,
    cache_config: CacheConfig,
    batch_config: BatchConfig,
) -> AppState {
    let store: Arc<dyn ContextStore> = Arc::new(SqliteContextStore::new(pool));
    let cache = Arc::new(ContextCache::new(cache_config));
    let service = Arc::new(ContextService::new(store.clone(), cache));
    let batch = Arc::new(BatchExecutor::new(service.clone(), store, batch_config));
    AppState { service, batch }
}

/// Assemble the application state from CONFIG.
pub fn create_app_state(pool: SqlitePool) -> AppState {
    create_app_state_with(
        pool,
        CacheConfig::default()
            .with_capacity(CONFIG.cache_capacity)
            .with_ttl(Duration::from_secs(CONFIG.cache_ttl_secs)),
        BatchConfig {
            max_parallel: CONFIG.batch_max_parallel,
            op_timeout: Duration::from_secs(CONFIG.batch_op_timeout_secs),
        },
    )
}
