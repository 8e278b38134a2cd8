// src/context/mod.rs
// The context hierarchy engine: types, persistence, inheritance resolution,
// caching, and the orchestrating service.

pub mod cache;
pub mod error;
pub mod merge;
pub mod migration;
pub mod resolver;
pub mod service;
pub mod store;
pub mod types;

pub use cache::{CacheConfig, CacheKey, ContextCache};
pub use error::{ContextError, ContextResult};
pub use migration::{create_pool, run_migrations};
pub use service::ContextService;
pub use store::{ContextStore, SqliteContextStore};
pub use types::{
    Context, ContextFilter, ContextLevel, Delegation, DelegationStatus, Insight, InsightCategory,
    InsightImportance, JsonMap, ProgressEntry, ResolvedContext, UserScope,
};
