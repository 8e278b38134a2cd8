// src/context/store.rs
//! Persistence contract for context rows and its SQLite implementation.
//!
//! Every method is scoped by [`UserScope`]: a row belonging to a different
//! user is invisible even when the context_id collides. The service layer is
//! the only writer; the resolver and cache only read.

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::context::error::{ContextError, ContextResult};
use crate::context::types::{
    Context, ContextFilter, ContextLevel, Delegation, DelegationStatus, Insight, InsightCategory,
    InsightImportance, JsonMap, ProgressEntry, UserScope,
};

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Fetch a context with its appended insight/progress logs.
    async fn get(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<Option<Context>>;

    /// Insert a new context row. Duplicate `(level, context_id)` for the
    /// same user fails with `AlreadyExists`.
    async fn insert(&self, scope: &UserScope, context: &Context) -> ContextResult<()>;

    /// Guarded full-row write: succeeds only when the stored version still
    /// equals `expected_version` (single-row version-check-and-increment).
    /// A stale writer gets `ConcurrentModification`.
    async fn save(
        &self,
        scope: &UserScope,
        context: &Context,
        expected_version: i64,
    ) -> ContextResult<()>;

    /// Unguarded reinsert of a full snapshot (context row plus appended
    /// logs). Used by transactional rollback to put pre-images back.
    async fn restore(&self, scope: &UserScope, context: &Context) -> ContextResult<()>;

    /// Delete a context row and its own appended logs. Returns whether a
    /// row existed. Descendant contexts are left untouched (orphan-and-skip
    /// delete policy).
    async fn delete(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<bool>;

    async fn exists(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<bool>;

    /// List context rows at a level with ANDed filters. Rows come back
    /// without their appended logs; use `get` for the full picture.
    async fn list(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        filter: &ContextFilter,
    ) -> ContextResult<Vec<Context>>;

    /// Append an insight and bump the context's version/updated_at.
    async fn append_insight(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        insight: &Insight,
    ) -> ContextResult<()>;

    /// Append a progress entry and bump the context's version/updated_at.
    async fn append_progress(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        entry: &ProgressEntry,
    ) -> ContextResult<()>;

    async fn record_delegation(
        &self,
        scope: &UserScope,
        delegation: &Delegation,
    ) -> ContextResult<()>;

    async fn list_delegations(
        &self,
        scope: &UserScope,
        target_level: ContextLevel,
        target_context_id: &str,
    ) -> ContextResult<Vec<Delegation>>;
}

pub struct SqliteContextStore {
    pool: SqlitePool,
}

impl SqliteContextStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn data_to_json(data: &JsonMap) -> ContextResult<String> {
        Ok(serde_json::to_string(data)?)
    }

    fn row_to_context(row: &sqlx::sqlite::SqliteRow) -> ContextResult<Context> {
        let level_str: String = row.get("level");
        let level = ContextLevel::from_str(&level_str)?;
        let data_json: String = row.get("data");
        let data: JsonMap = serde_json::from_str(&data_json)?;
        let created_at: NaiveDateTime = row.get("created_at");
        let updated_at: NaiveDateTime = row.get("updated_at");

        Ok(Context {
            level,
            context_id: row.get("context_id"),
            user_id: row.get("user_id"),
            parent_id: row.get("parent_id"),
            data,
            insights: Vec::new(),
            progress: Vec::new(),
            version: row.get("version"),
            created_at: Utc.from_utc_datetime(&created_at),
            updated_at: Utc.from_utc_datetime(&updated_at),
        })
    }

    async fn load_insights(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<Vec<Insight>> {
        let rows = sqlx::query(
            r#"
            SELECT content, category, importance, agent, created_at
            FROM context_insights
            WHERE user_id = ? AND level = ? AND context_id = ?
            ORDER BY id
            "#,
        )
        .bind(scope.user_id())
        .bind(level.as_str())
        .bind(context_id)
        .fetch_all(&self.pool)
        .await?;

        let mut insights = Vec::with_capacity(rows.len());
        for row in rows {
            let category: Option<String> = row.get("category");
            let importance: Option<String> = row.get("importance");
            let created_at: NaiveDateTime = row.get("created_at");
            insights.push(Insight {
                content: row.get("content"),
                category: category.as_deref().and_then(|s| InsightCategory::from_str(s).ok()),
                importance: importance
                    .as_deref()
                    .and_then(|s| InsightImportance::from_str(s).ok()),
                agent: row.get("agent"),
                created_at: Utc.from_utc_datetime(&created_at),
            });
        }
        Ok(insights)
    }

    async fn load_progress(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<Vec<ProgressEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT content, agent, created_at
            FROM context_progress
            WHERE user_id = ? AND level = ? AND context_id = ?
            ORDER BY id
            "#,
        )
        .bind(scope.user_id())
        .bind(level.as_str())
        .bind(context_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: NaiveDateTime = row.get("created_at");
            entries.push(ProgressEntry {
                content: row.get("content"),
                agent: row.get("agent"),
                created_at: Utc.from_utc_datetime(&created_at),
            });
        }
        Ok(entries)
    }

    /// Touch the context row for an append operation. Returns false when the
    /// context does not exist.
    async fn bump_version(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE contexts
            SET version = version + 1, updated_at = ?
            WHERE user_id = ? AND level = ? AND context_id = ?
            "#,
        )
        .bind(Utc::now().naive_utc())
        .bind(scope.user_id())
        .bind(level.as_str())
        .bind(context_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ContextStore for SqliteContextStore {
    async fn get(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<Option<Context>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, level, context_id, parent_id, data, version, created_at, updated_at
            FROM contexts
            WHERE user_id = ? AND level = ? AND context_id = ?
            "#,
        )
        .bind(scope.user_id())
        .bind(level.as_str())
        .bind(context_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut context = Self::row_to_context(&row)?;
        context.insights = self.load_insights(scope, level, context_id).await?;
        context.progress = self.load_progress(scope, level, context_id).await?;
        Ok(Some(context))
    }

    async fn insert(&self, scope: &UserScope, context: &Context) -> ContextResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO contexts (
                user_id, level, context_id, parent_id, project_id, git_branch_id,
                data, version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(scope.user_id())
        .bind(context.level.as_str())
        .bind(&context.context_id)
        .bind(&context.parent_id)
        .bind(crate::context::types::data_str(&context.data, "project_id"))
        .bind(crate::context::types::data_str(&context.data, "branch_id"))
        .bind(Self::data_to_json(&context.data)?)
        .bind(context.version)
        .bind(context.created_at.naive_utc())
        .bind(context.updated_at.naive_utc())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(ContextError::AlreadyExists {
                    level: context.level,
                    context_id: context.context_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(
        &self,
        scope: &UserScope,
        context: &Context,
        expected_version: i64,
    ) -> ContextResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE contexts
            SET parent_id = ?, project_id = ?, git_branch_id = ?,
                data = ?, version = ?, updated_at = ?
            WHERE user_id = ? AND level = ? AND context_id = ? AND version = ?
            "#,
        )
        .bind(&context.parent_id)
        .bind(crate::context::types::data_str(&context.data, "project_id"))
        .bind(crate::context::types::data_str(&context.data, "branch_id"))
        .bind(Self::data_to_json(&context.data)?)
        .bind(context.version)
        .bind(context.updated_at.naive_utc())
        .bind(scope.user_id())
        .bind(context.level.as_str())
        .bind(&context.context_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Disambiguate: the row vanished, or another writer got there first.
        if self.exists(scope, context.level, &context.context_id).await? {
            Err(ContextError::ConcurrentModification {
                level: context.level,
                context_id: context.context_id.clone(),
                expected: expected_version,
            })
        } else {
            Err(ContextError::NotFound {
                level: context.level,
                context_id: context.context_id.clone(),
            })
        }
    }

    async fn restore(&self, scope: &UserScope, context: &Context) -> ContextResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO contexts (
                user_id, level, context_id, parent_id, project_id, git_branch_id,
                data, version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(scope.user_id())
        .bind(context.level.as_str())
        .bind(&context.context_id)
        .bind(&context.parent_id)
        .bind(crate::context::types::data_str(&context.data, "project_id"))
        .bind(crate::context::types::data_str(&context.data, "branch_id"))
        .bind(Self::data_to_json(&context.data)?)
        .bind(context.version)
        .bind(context.created_at.naive_utc())
        .bind(context.updated_at.naive_utc())
        .execute(&self.pool)
        .await?;

        // Reinsert appended logs from the snapshot.
        sqlx::query("DELETE FROM context_insights WHERE user_id = ? AND level = ? AND context_id = ?")
            .bind(scope.user_id())
            .bind(context.level.as_str())
            .bind(&context.context_id)
            .execute(&self.pool)
            .await?;
        for insight in &context.insights {
            sqlx::query(
                r#"
                INSERT INTO context_insights (user_id, level, context_id, content, category, importance, agent, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(scope.user_id())
            .bind(context.level.as_str())
            .bind(&context.context_id)
            .bind(&insight.content)
            .bind(insight.category.map(|c| c.as_str()))
            .bind(insight.importance.map(|i| i.as_str()))
            .bind(&insight.agent)
            .bind(insight.created_at.naive_utc())
            .execute(&self.pool)
            .await?;
        }

        sqlx::query("DELETE FROM context_progress WHERE user_id = ? AND level = ? AND context_id = ?")
            .bind(scope.user_id())
            .bind(context.level.as_str())
            .bind(&context.context_id)
            .execute(&self.pool)
            .await?;
        for entry in &context.progress {
            sqlx::query(
                r#"
                INSERT INTO context_progress (user_id, level, context_id, content, agent, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(scope.user_id())
            .bind(context.level.as_str())
            .bind(&context.context_id)
            .bind(&entry.content)
            .bind(&entry.agent)
            .bind(entry.created_at.naive_utc())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn delete(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<bool> {
        sqlx::query("DELETE FROM context_insights WHERE user_id = ? AND level = ? AND context_id = ?")
            .bind(scope.user_id())
            .bind(level.as_str())
            .bind(context_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM context_progress WHERE user_id = ? AND level = ? AND context_id = ?")
            .bind(scope.user_id())
            .bind(level.as_str())
            .bind(context_id)
            .execute(&self.pool)
            .await?;

        let result = sqlx::query(
            "DELETE FROM contexts WHERE user_id = ? AND level = ? AND context_id = ?",
        )
        .bind(scope.user_id())
        .bind(level.as_str())
        .bind(context_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn exists(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<bool> {
        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM contexts WHERE user_id = ? AND level = ? AND context_id = ?",
        )
        .bind(scope.user_id())
        .bind(level.as_str())
        .bind(context_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn list(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        filter: &ContextFilter,
    ) -> ContextResult<Vec<Context>> {
        let mut sql = String::from(
            r#"
            SELECT user_id, level, context_id, parent_id, data, version, created_at, updated_at
            FROM contexts
            WHERE user_id = ? AND level = ?
            "#,
        );
        if filter.project_id.is_some() {
            sql.push_str(" AND project_id = ?");
        }
        if filter.git_branch_id.is_some() {
            sql.push_str(" AND git_branch_id = ?");
        }
        sql.push_str(" ORDER BY created_at, context_id");

        let mut query = sqlx::query(&sql).bind(scope.user_id()).bind(level.as_str());
        if let Some(project_id) = &filter.project_id {
            query = query.bind(project_id);
        }
        if let Some(git_branch_id) = &filter.git_branch_id {
            query = query.bind(git_branch_id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut contexts = Vec::with_capacity(rows.len());
        for row in rows {
            contexts.push(Self::row_to_context(&row)?);
        }

        // Free-form filters match against the payload, after the SQL pass.
        if let Some(status) = &filter.status {
            contexts.retain(|c| {
                crate::context::types::data_str(&c.data, "status").as_deref() == Some(status)
            });
        }

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        if offset > 0 {
            contexts = contexts.into_iter().skip(offset).collect();
        }
        if let Some(limit) = filter.limit {
            contexts.truncate(limit.max(0) as usize);
        }

        Ok(contexts)
    }

    async fn append_insight(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        insight: &Insight,
    ) -> ContextResult<()> {
        if !self.bump_version(scope, level, context_id).await? {
            return Err(ContextError::NotFound {
                level,
                context_id: context_id.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO context_insights (user_id, level, context_id, content, category, importance, agent, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(scope.user_id())
        .bind(level.as_str())
        .bind(context_id)
        .bind(&insight.content)
        .bind(insight.category.map(|c| c.as_str()))
        .bind(insight.importance.map(|i| i.as_str()))
        .bind(&insight.agent)
        .bind(insight.created_at.naive_utc())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_progress(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        entry: &ProgressEntry,
    ) -> ContextResult<()> {
        if !self.bump_version(scope, level, context_id).await? {
            return Err(ContextError::NotFound {
                level,
                context_id: context_id.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO context_progress (user_id, level, context_id, content, agent, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(scope.user_id())
        .bind(level.as_str())
        .bind(context_id)
        .bind(&entry.content)
        .bind(&entry.agent)
        .bind(entry.created_at.naive_utc())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_delegation(
        &self,
        scope: &UserScope,
        delegation: &Delegation,
    ) -> ContextResult<()> {
        sqlx::query(
            r#"
            INSERT INTO delegations (
                id, user_id, source_level, source_context_id,
                target_level, target_context_id, data, reason, status,
                created_at, processed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&delegation.id)
        .bind(scope.user_id())
        .bind(delegation.source_level.as_str())
        .bind(&delegation.source_context_id)
        .bind(delegation.target_level.as_str())
        .bind(&delegation.target_context_id)
        .bind(Self::data_to_json(&delegation.data)?)
        .bind(&delegation.reason)
        .bind(delegation.status.as_str())
        .bind(delegation.created_at.naive_utc())
        .bind(delegation.processed_at.map(|t| t.naive_utc()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_delegations(
        &self,
        scope: &UserScope,
        target_level: ContextLevel,
        target_context_id: &str,
    ) -> ContextResult<Vec<Delegation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, source_level, source_context_id,
                   target_level, target_context_id, data, reason, status,
                   created_at, processed_at
            FROM delegations
            WHERE user_id = ? AND target_level = ? AND target_context_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(scope.user_id())
        .bind(target_level.as_str())
        .bind(target_context_id)
        .fetch_all(&self.pool)
        .await?;

        let mut delegations = Vec::with_capacity(rows.len());
        for row in rows {
            let source_level: String = row.get("source_level");
            let target_level: String = row.get("target_level");
            let status: String = row.get("status");
            let data_json: String = row.get("data");
            let created_at: NaiveDateTime = row.get("created_at");
            let processed_at: Option<NaiveDateTime> = row.get("processed_at");

            delegations.push(Delegation {
                id: row.get("id"),
                user_id: row.get("user_id"),
                source_level: ContextLevel::from_str(&source_level)?,
                source_context_id: row.get("source_context_id"),
                target_level: ContextLevel::from_str(&target_level)?,
                target_context_id: row.get("target_context_id"),
                data: serde_json::from_str(&data_json)?,
                reason: row.get("reason"),
                status: DelegationStatus::from_str(&status)
                    .unwrap_or(DelegationStatus::Pending),
                created_at: Utc.from_utc_datetime(&created_at),
                processed_at: processed_at.map(|t| Utc.from_utc_datetime(&t)),
            });
        }
        Ok(delegations)
    }
}
