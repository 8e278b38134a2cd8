// src/context/migration.rs
//! Schema migrations for the SQLite backend.
//! Run at startup; every statement is idempotent.

use anyhow::Result;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Executor;
use std::time::Duration;
use tracing::info;

/// One row per context node, keyed by owning user + level + id. The payload
/// lives in `data` as JSON; `project_id` / `git_branch_id` are denormalized
/// copies of the conventional data keys so list filters stay in SQL.
const CREATE_CONTEXTS: &str = r#"
CREATE TABLE IF NOT EXISTS contexts (
    user_id TEXT NOT NULL,
    level TEXT NOT NULL,
    context_id TEXT NOT NULL,
    parent_id TEXT,
    project_id TEXT,
    git_branch_id TEXT,
    data TEXT NOT NULL DEFAULT '{}',
    version INTEGER NOT NULL DEFAULT 1,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    PRIMARY KEY (user_id, level, context_id)
);
"#;

/// Append-only insight log per context.
const CREATE_CONTEXT_INSIGHTS: &str = r#"
CREATE TABLE IF NOT EXISTS context_insights (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    level TEXT NOT NULL,
    context_id TEXT NOT NULL,
    content TEXT NOT NULL,
    category TEXT,
    importance TEXT,
    agent TEXT,
    created_at DATETIME NOT NULL
);
"#;

/// Append-only progress log per context.
const CREATE_CONTEXT_PROGRESS: &str = r#"
CREATE TABLE IF NOT EXISTS context_progress (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    level TEXT NOT NULL,
    context_id TEXT NOT NULL,
    content TEXT NOT NULL,
    agent TEXT,
    created_at DATETIME NOT NULL
);
"#;

/// Record of upward data promotions. Applied eagerly, kept for audit.
const CREATE_DELEGATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS delegations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    source_level TEXT NOT NULL,
    source_context_id TEXT NOT NULL,
    target_level TEXT NOT NULL,
    target_context_id TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT '{}',
    reason TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at DATETIME NOT NULL,
    processed_at DATETIME
);
"#;

const CREATE_INDICES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_contexts_project ON contexts(user_id, project_id);
CREATE INDEX IF NOT EXISTS idx_contexts_branch ON contexts(user_id, git_branch_id);
CREATE INDEX IF NOT EXISTS idx_insights_context ON context_insights(user_id, level, context_id);
CREATE INDEX IF NOT EXISTS idx_progress_context ON context_progress(user_id, level, context_id);
CREATE INDEX IF NOT EXISTS idx_delegations_target ON delegations(user_id, target_level, target_context_id);
"#;

/// Create a SQLite connection pool tuned for a single-writer workload.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        // SQLite is single-writer, but can have multiple readers
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .max_lifetime(Duration::from_secs(1800))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))
}

/// Runs all required migrations. Safe to call at every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    pool.execute(CREATE_CONTEXTS).await?;
    pool.execute(CREATE_CONTEXT_INSIGHTS).await?;
    pool.execute(CREATE_CONTEXT_PROGRESS).await?;
    pool.execute(CREATE_DELEGATIONS).await?;
    pool.execute(CREATE_INDICES).await?;

    info!("Migrations complete");
    Ok(())
}
