// src/context/service.rs
//! ContextService - the only component that mutates the context store.
//!
//! Each operation is a short-lived transaction: validate, write, then
//! synchronously invalidate every cached view the write could have gone
//! stale. Callers get typed errors; nothing here panics the process.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::cache::{CacheKey, ContextCache};
use crate::context::error::{ContextError, ContextResult};
use crate::context::merge::merge_into;
use crate::context::resolver::InheritanceResolver;
use crate::context::store::ContextStore;
use crate::context::types::{
    Context, ContextFilter, ContextLevel, Delegation, DelegationStatus, Insight, InsightCategory,
    InsightImportance, JsonMap, ProgressEntry, ResolvedContext, UserScope,
};

pub struct ContextService {
    store: Arc<dyn ContextStore>,
    cache: Arc<ContextCache>,
    resolver: InheritanceResolver,
}

impl ContextService {
    pub fn new(store: Arc<dyn ContextStore>, cache: Arc<ContextCache>) -> Self {
        let resolver = InheritanceResolver::new(store.clone(), cache.clone());
        Self {
            store,
            cache,
            resolver,
        }
    }

    /// Every user has their own GLOBAL context, created on first access.
    async fn ensure_global(&self, scope: &UserScope) -> ContextResult<()> {
        if self
            .store
            .exists(scope, ContextLevel::Global, scope.user_id())
            .await?
        {
            return Ok(());
        }

        let global = Context::new(
            ContextLevel::Global,
            scope.user_id(),
            scope.user_id(),
            JsonMap::new(),
        );
        match self.store.insert(scope, &global).await {
            Ok(()) => {
                info!("Auto-created global context for user {}", scope.user_id());
                self.cache.invalidate_inheritance(&CacheKey::new(
                    scope,
                    ContextLevel::Global,
                    scope.user_id(),
                ));
                Ok(())
            }
            // Another call won the race; the context is there either way.
            Err(ContextError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Create a context. Not idempotent: an existing `(level, context_id)`
    /// fails with `AlreadyExists` (use the batch UPSERT for idempotence).
    pub async fn create(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        mut data: JsonMap,
        project_id: Option<String>,
        git_branch_id: Option<String>,
    ) -> ContextResult<Context> {
        if level != ContextLevel::Global {
            self.ensure_global(scope).await?;
        }

        // Explicit parent params seed the conventional data keys.
        if let Some(project_id) = project_id {
            data.entry("project_id".to_string())
                .or_insert_with(|| Value::String(project_id));
        }
        if let Some(git_branch_id) = git_branch_id {
            data.entry("branch_id".to_string())
                .or_insert_with(|| Value::String(git_branch_id));
        }

        let mut context = Context::new(level, context_id, scope.user_id(), data);
        context.parent_id = match level {
            ContextLevel::Global => None,
            ContextLevel::Project => Some(scope.user_id().to_string()),
            ContextLevel::Branch | ContextLevel::Task => {
                let parent_level = level.parent().expect("non-global level");
                let parent_id = context.parent_ref().ok_or_else(|| {
                    ContextError::Operation(format!(
                        "{level} context '{context_id}' requires a {parent_level} reference"
                    ))
                })?;
                if !self.store.exists(scope, parent_level, &parent_id).await? {
                    return Err(ContextError::NotFound {
                        level: parent_level,
                        context_id: parent_id,
                    });
                }
                Some(parent_id)
            }
        };

        self.store.insert(scope, &context).await?;
        info!("Created {} context '{}'", level, context_id);

        // A fresh context has no descendants of record, but anything that
        // resolved while it was absent registered interest in this key.
        let key = CacheKey::new(scope, level, context_id);
        self.cache.invalidate_context(&key);
        self.cache.invalidate_inheritance(&key);

        Ok(context)
    }

    /// Direct store read, user-scoped. Inheritance-aware reads go through
    /// [`resolve`](Self::resolve).
    pub async fn get(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<Context> {
        self.store
            .get(scope, level, context_id)
            .await?
            .ok_or_else(|| ContextError::NotFound {
                level,
                context_id: context_id.to_string(),
            })
    }

    /// Merge `data` into the context (one-level-deep rule) and bump the
    /// version through the guarded store write.
    ///
    /// With `propagate_changes` unset, descendants keep their cached
    /// resolved views until their own next write - a documented
    /// performance/consistency tradeoff; only this context's entries are
    /// dropped.
    pub async fn update(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        data: &JsonMap,
        propagate_changes: bool,
    ) -> ContextResult<Context> {
        let mut context = self.get(scope, level, context_id).await?;
        let expected_version = context.version;

        merge_into(&mut context.data, data);
        context.version += 1;
        context.updated_at = Utc::now();

        self.store.save(scope, &context, expected_version).await?;
        debug!(
            "Updated {} context '{}' to version {}",
            level, context_id, context.version
        );

        let key = CacheKey::new(scope, level, context_id);
        self.cache.invalidate_context(&key);
        if propagate_changes {
            self.cache.invalidate_inheritance(&key);
        }

        Ok(context)
    }

    /// Delete a context. Descendants are orphaned, not cascaded: their rows
    /// stay and their resolution skips the now-missing ancestor. Returns
    /// whether a row existed.
    pub async fn delete(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<bool> {
        let existed = self.store.delete(scope, level, context_id).await?;

        // A missing ancestor changes descendants' resolution, so the
        // cascade runs even though the rows stay.
        let key = CacheKey::new(scope, level, context_id);
        self.cache.invalidate_context(&key);
        self.cache.invalidate_inheritance(&key);

        if existed {
            info!("Deleted {} context '{}'", level, context_id);
        }
        Ok(existed)
    }

    /// Inheritance-aware read: cache hit unless `force_refresh`, otherwise
    /// resolve, then re-populate (an invalidation racing the populate wins).
    pub async fn resolve(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        force_refresh: bool,
    ) -> ContextResult<ResolvedContext> {
        let key = CacheKey::new(scope, level, context_id);

        if !force_refresh {
            if let Some(resolved) = self.cache.get_resolved(&key) {
                debug!("Resolved {} '{}' from cache", level, context_id);
                return Ok(resolved);
            }
        }

        let epoch = self.cache.begin_resolved(&key);
        let (resolved, ancestors) = self
            .resolver
            .resolve(scope, level, context_id, !force_refresh)
            .await?;
        self.cache
            .put_resolved(&key, resolved.clone(), &ancestors, epoch);

        Ok(resolved)
    }

    /// Promote data from a context into one of its ancestors. Delegation is
    /// eager: the record is created and the data merged into the target in
    /// the same operation.
    pub async fn delegate(
        &self,
        scope: &UserScope,
        source_level: ContextLevel,
        source_context_id: &str,
        delegate_to: ContextLevel,
        data: JsonMap,
        reason: Option<String>,
    ) -> ContextResult<Delegation> {
        if !delegate_to.is_above(source_level) {
            return Err(ContextError::InvalidDelegationTarget {
                from_level: source_level,
                target: delegate_to,
            });
        }

        let source = self.get(scope, source_level, source_context_id).await?;

        // Walk the ancestor refs until the target level's id is known.
        let target_id = if delegate_to == ContextLevel::Global {
            scope.user_id().to_string()
        } else {
            let mut current = source;
            loop {
                let parent_level = current.level.parent().expect("source is below target");
                let parent_id = current.parent_ref().ok_or_else(|| {
                    ContextError::Operation(format!(
                        "{} context '{}' carries no {} reference to delegate through",
                        current.level, current.context_id, parent_level
                    ))
                })?;
                if parent_level == delegate_to {
                    break parent_id;
                }
                current = self.get(scope, parent_level, &parent_id).await?;
            }
        };

        // The target may not have a context row yet.
        if !self.store.exists(scope, delegate_to, &target_id).await? {
            let target = Context::new(delegate_to, &target_id, scope.user_id(), JsonMap::new());
            self.store.insert(scope, &target).await?;
            debug!(
                "Auto-created {} context '{}' as delegation target",
                delegate_to, target_id
            );
        }

        let mut target = self.get(scope, delegate_to, &target_id).await?;
        let expected_version = target.version;
        merge_into(&mut target.data, &data);
        target.version += 1;
        target.updated_at = Utc::now();
        self.store.save(scope, &target, expected_version).await?;

        let now = Utc::now();
        let delegation = Delegation {
            id: Uuid::new_v4().to_string(),
            user_id: scope.user_id().to_string(),
            source_level,
            source_context_id: source_context_id.to_string(),
            target_level: delegate_to,
            target_context_id: target_id.clone(),
            data,
            reason,
            status: DelegationStatus::Applied,
            created_at: now,
            processed_at: Some(now),
        };
        self.store.record_delegation(scope, &delegation).await?;
        info!(
            "Delegated data from {} '{}' to {} '{}'",
            source_level, source_context_id, delegate_to, target_id
        );

        let key = CacheKey::new(scope, delegate_to, &target_id);
        self.cache.invalidate_context(&key);
        self.cache.invalidate_inheritance(&key);

        Ok(delegation)
    }

    /// Append an insight. Insights live only in the context's own view, so
    /// only its direct cache entries are dropped.
    pub async fn add_insight(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        content: String,
        category: Option<InsightCategory>,
        importance: Option<InsightImportance>,
        agent: Option<String>,
    ) -> ContextResult<Insight> {
        let insight = Insight {
            content,
            category,
            importance,
            agent,
            created_at: Utc::now(),
        };
        self.store
            .append_insight(scope, level, context_id, &insight)
            .await?;

        self.cache
            .invalidate_context(&CacheKey::new(scope, level, context_id));
        Ok(insight)
    }

    /// Append a progress note; same cache behavior as insights.
    pub async fn add_progress(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        content: String,
        agent: Option<String>,
    ) -> ContextResult<ProgressEntry> {
        let entry = ProgressEntry {
            content,
            agent,
            created_at: Utc::now(),
        };
        self.store
            .append_progress(scope, level, context_id, &entry)
            .await?;

        self.cache
            .invalidate_context(&CacheKey::new(scope, level, context_id));
        Ok(entry)
    }

    pub async fn list(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        filter: &ContextFilter,
    ) -> ContextResult<Vec<Context>> {
        self.store.list(scope, level, filter).await
    }

    pub async fn list_delegations(
        &self,
        scope: &UserScope,
        target_level: ContextLevel,
        target_context_id: &str,
    ) -> ContextResult<Vec<Delegation>> {
        self.store
            .list_delegations(scope, target_level, target_context_id)
            .await
    }

    /// Targeted or cascading invalidation, used by the batch executor's
    /// post-batch sweep.
    pub fn invalidate(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        cascade: bool,
    ) {
        let key = CacheKey::new(scope, level, context_id);
        self.cache.invalidate_context(&key);
        if cascade {
            self.cache.invalidate_inheritance(&key);
        }
    }
}
