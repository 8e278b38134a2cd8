// tests/test_context_hierarchy.rs
// Inheritance resolution, cache behavior, and CRUD round trips.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use strata::context::{
    CacheConfig, ContextCache, ContextError, ContextFilter, ContextLevel, ContextResult,
    ContextService, ContextStore, SqliteContextStore, UserScope,
};
use strata::context::types::{Context, Delegation, Insight, JsonMap, ProgressEntry};

/// Helper to create a test database with migrations
async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create in-memory database");

    strata::context::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

fn map(v: serde_json::Value) -> JsonMap {
    v.as_object().expect("object literal").clone()
}

async fn build_service() -> Arc<ContextService> {
    let pool = create_test_db().await;
    let store: Arc<dyn ContextStore> = Arc::new(SqliteContextStore::new(pool));
    let cache = Arc::new(ContextCache::new(CacheConfig::default()));
    Arc::new(ContextService::new(store, cache))
}

/// Store wrapper that counts reads, for cache-hit assertions.
struct CountingStore {
    inner: Arc<dyn ContextStore>,
    reads: AtomicUsize,
}

impl CountingStore {
    fn new(inner: Arc<dyn ContextStore>) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
        }
    }

    fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextStore for CountingStore {
    async fn get(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<Option<Context>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(scope, level, context_id).await
    }

    async fn insert(&self, scope: &UserScope, context: &Context) -> ContextResult<()> {
        self.inner.insert(scope, context).await
    }

    async fn save(
        &self,
        scope: &UserScope,
        context: &Context,
        expected_version: i64,
    ) -> ContextResult<()> {
        self.inner.save(scope, context, expected_version).await
    }

    async fn restore(&self, scope: &UserScope, context: &Context) -> ContextResult<()> {
        self.inner.restore(scope, context).await
    }

    async fn delete(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<bool> {
        self.inner.delete(scope, level, context_id).await
    }

    async fn exists(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
    ) -> ContextResult<bool> {
        self.inner.exists(scope, level, context_id).await
    }

    async fn list(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        filter: &ContextFilter,
    ) -> ContextResult<Vec<Context>> {
        self.inner.list(scope, level, filter).await
    }

    async fn append_insight(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        insight: &Insight,
    ) -> ContextResult<()> {
        self.inner.append_insight(scope, level, context_id, insight).await
    }

    async fn append_progress(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        entry: &ProgressEntry,
    ) -> ContextResult<()> {
        self.inner.append_progress(scope, level, context_id, entry).await
    }

    async fn record_delegation(
        &self,
        scope: &UserScope,
        delegation: &Delegation,
    ) -> ContextResult<()> {
        self.inner.record_delegation(scope, delegation).await
    }

    async fn list_delegations(
        &self,
        scope: &UserScope,
        target_level: ContextLevel,
        target_context_id: &str,
    ) -> ContextResult<Vec<Delegation>> {
        self.inner
            .list_delegations(scope, target_level, target_context_id)
            .await
    }
}

/// Build the standard four-level fixture: global -> P1 -> B1 -> T1.
async fn create_fixture(service: &ContextService, scope: &UserScope) {
    service
        .create(
            scope,
            ContextLevel::Global,
            scope.user_id(),
            map(json!({"standard": "v1"})),
            None,
            None,
        )
        .await
        .expect("create global");
    service
        .create(
            scope,
            ContextLevel::Project,
            "P1",
            map(json!({"standard": "v2", "name": "Proj"})),
            None,
            None,
        )
        .await
        .expect("create project");
    service
        .create(
            scope,
            ContextLevel::Branch,
            "B1",
            map(json!({"name": "main"})),
            Some("P1".to_string()),
            None,
        )
        .await
        .expect("create branch");
    service
        .create(
            scope,
            ContextLevel::Task,
            "T1",
            map(json!({"title": "Do X"})),
            None,
            Some("B1".to_string()),
        )
        .await
        .expect("create task");
}

#[tokio::test]
async fn test_concrete_inheritance_scenario() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    let resolved = service
        .resolve(&scope, ContextLevel::Task, "T1", false)
        .await
        .expect("resolve task");

    // Project overrides global, branch overrides project, task-only keys pass.
    assert_eq!(resolved.data.get("standard"), Some(&json!("v2")));
    assert_eq!(resolved.data.get("name"), Some(&json!("main")));
    assert_eq!(resolved.data.get("title"), Some(&json!("Do X")));
    assert_eq!(
        resolved.inheritance_chain,
        vec![
            ContextLevel::Global,
            ContextLevel::Project,
            ContextLevel::Branch,
            ContextLevel::Task
        ]
    );
}

#[tokio::test]
async fn test_resolution_at_global_has_chain_of_one() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    service
        .create(
            &scope,
            ContextLevel::Global,
            "u1",
            map(json!({"standard": "v1"})),
            None,
            None,
        )
        .await
        .unwrap();

    let resolved = service
        .resolve(&scope, ContextLevel::Global, "u1", false)
        .await
        .unwrap();
    assert_eq!(resolved.inheritance_chain, vec![ContextLevel::Global]);
    assert_eq!(resolved.data.get("standard"), Some(&json!("v1")));
}

#[tokio::test]
async fn test_nested_settings_merge_one_level_deep() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    service
        .create(
            &scope,
            ContextLevel::Global,
            "u1",
            map(json!({"settings": {"theme": "dark", "tabs": 4}})),
            None,
            None,
        )
        .await
        .unwrap();
    service
        .create(
            &scope,
            ContextLevel::Project,
            "P1",
            map(json!({"settings": {"tabs": 2}})),
            None,
            None,
        )
        .await
        .unwrap();

    let resolved = service
        .resolve(&scope, ContextLevel::Project, "P1", false)
        .await
        .unwrap();
    assert_eq!(
        resolved.data.get("settings"),
        Some(&json!({"theme": "dark", "tabs": 2}))
    );
}

#[tokio::test]
async fn test_idempotent_resolution_hits_cache() {
    let pool = create_test_db().await;
    let counting = Arc::new(CountingStore::new(Arc::new(SqliteContextStore::new(pool))));
    let store: Arc<dyn ContextStore> = counting.clone();
    let cache = Arc::new(ContextCache::new(CacheConfig::default()));
    let service = ContextService::new(store, cache);

    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    let first = service
        .resolve(&scope, ContextLevel::Task, "T1", false)
        .await
        .unwrap();
    let reads_after_first = counting.read_count();

    let second = service
        .resolve(&scope, ContextLevel::Task, "T1", false)
        .await
        .unwrap();
    let reads_after_second = counting.read_count();

    assert_eq!(first, second);
    assert_eq!(
        reads_after_first, reads_after_second,
        "second resolve must not touch the store"
    );
}

#[tokio::test]
async fn test_force_refresh_bypasses_cache() {
    let pool = create_test_db().await;
    let counting = Arc::new(CountingStore::new(Arc::new(SqliteContextStore::new(pool))));
    let store: Arc<dyn ContextStore> = counting.clone();
    let cache = Arc::new(ContextCache::new(CacheConfig::default()));
    let service = ContextService::new(store, cache);

    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    service
        .resolve(&scope, ContextLevel::Task, "T1", false)
        .await
        .unwrap();
    let reads_before = counting.read_count();
    service
        .resolve(&scope, ContextLevel::Task, "T1", true)
        .await
        .unwrap();
    assert!(counting.read_count() > reads_before);
}

#[tokio::test]
async fn test_invalidation_cascade_on_project_update() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    // Unrelated chain: P2 -> B2 -> T2.
    service
        .create(&scope, ContextLevel::Project, "P2", map(json!({"marker": "p2"})), None, None)
        .await
        .unwrap();
    service
        .create(&scope, ContextLevel::Branch, "B2", JsonMap::new(), Some("P2".into()), None)
        .await
        .unwrap();
    service
        .create(&scope, ContextLevel::Task, "T2", JsonMap::new(), None, Some("B2".into()))
        .await
        .unwrap();

    // Warm both caches.
    service.resolve(&scope, ContextLevel::Task, "T1", false).await.unwrap();
    let t2_before = service.resolve(&scope, ContextLevel::Task, "T2", false).await.unwrap();

    service
        .update(
            &scope,
            ContextLevel::Project,
            "P1",
            &map(json!({"standard": "v3"})),
            true,
        )
        .await
        .unwrap();

    let t1 = service.resolve(&scope, ContextLevel::Task, "T1", false).await.unwrap();
    assert_eq!(t1.data.get("standard"), Some(&json!("v3")), "stale cache served");

    let t2_after = service.resolve(&scope, ContextLevel::Task, "T2", false).await.unwrap();
    assert_eq!(t2_before, t2_after, "unrelated task must be unaffected");
}

#[tokio::test]
async fn test_no_propagation_keeps_descendants_stale() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    let before = service.resolve(&scope, ContextLevel::Task, "T1", false).await.unwrap();
    assert_eq!(before.data.get("standard"), Some(&json!("v2")));

    service
        .update(
            &scope,
            ContextLevel::Project,
            "P1",
            &map(json!({"standard": "v9"})),
            false,
        )
        .await
        .unwrap();

    // The project's own view is fresh immediately...
    let project = service.get(&scope, ContextLevel::Project, "P1").await.unwrap();
    assert_eq!(project.data.get("standard"), Some(&json!("v9")));

    // ...while the task keeps its cached resolution until its own next
    // write (documented tradeoff of propagate_changes=false).
    let stale = service.resolve(&scope, ContextLevel::Task, "T1", false).await.unwrap();
    assert_eq!(stale.data.get("standard"), Some(&json!("v2")));

    // A forced refresh sees through.
    let fresh = service.resolve(&scope, ContextLevel::Task, "T1", true).await.unwrap();
    assert_eq!(fresh.data.get("standard"), Some(&json!("v9")));
}

#[tokio::test]
async fn test_crud_round_trip() {
    let service = build_service().await;
    let scope = UserScope::new("u1");

    let created = service
        .create(&scope, ContextLevel::Project, "P1", map(json!({"a": 1})), None, None)
        .await
        .unwrap();
    assert_eq!(created.version, 1);

    let fetched = service.get(&scope, ContextLevel::Project, "P1").await.unwrap();
    assert_eq!(fetched.data, map(json!({"a": 1})));

    // Update merges, it does not replace.
    let updated = service
        .update(&scope, ContextLevel::Project, "P1", &map(json!({"b": 2})), true)
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.data, map(json!({"a": 1, "b": 2})));

    let fetched = service.get(&scope, ContextLevel::Project, "P1").await.unwrap();
    assert_eq!(fetched.data, map(json!({"a": 1, "b": 2})));

    assert!(service.delete(&scope, ContextLevel::Project, "P1").await.unwrap());
    assert!(!service.delete(&scope, ContextLevel::Project, "P1").await.unwrap());

    let err = service.get(&scope, ContextLevel::Project, "P1").await.unwrap_err();
    assert!(matches!(err, ContextError::NotFound { .. }));
}

#[tokio::test]
async fn test_create_is_not_idempotent() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    service
        .create(&scope, ContextLevel::Project, "P1", JsonMap::new(), None, None)
        .await
        .unwrap();

    let err = service
        .create(&scope, ContextLevel::Project, "P1", JsonMap::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ContextError::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_create_validates_parent() {
    let service = build_service().await;
    let scope = UserScope::new("u1");

    let err = service
        .create(
            &scope,
            ContextLevel::Branch,
            "B1",
            JsonMap::new(),
            Some("no-such-project".to_string()),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ContextError::NotFound { level: ContextLevel::Project, .. }
    ));
}

#[tokio::test]
async fn test_global_context_auto_created() {
    let service = build_service().await;
    let scope = UserScope::new("u1");

    service
        .create(&scope, ContextLevel::Project, "P1", JsonMap::new(), None, None)
        .await
        .unwrap();

    let global = service.get(&scope, ContextLevel::Global, "u1").await.unwrap();
    assert_eq!(global.level, ContextLevel::Global);
}

#[tokio::test]
async fn test_orphaned_task_skips_missing_branch() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    service.delete(&scope, ContextLevel::Branch, "B1").await.unwrap();

    // The task resolves with the broken link skipped: the project is
    // unreachable through the missing branch, but the user's global
    // context still contributes.
    let resolved = service
        .resolve(&scope, ContextLevel::Task, "T1", false)
        .await
        .unwrap();
    assert_eq!(
        resolved.inheritance_chain,
        vec![ContextLevel::Global, ContextLevel::Task]
    );
    assert_eq!(resolved.data.get("standard"), Some(&json!("v1")));
    assert_eq!(resolved.data.get("title"), Some(&json!("Do X")));
    assert_eq!(resolved.data.get("name"), None);
}

#[tokio::test]
async fn test_newly_created_ancestor_invalidates_resolution() {
    let service = build_service().await;
    let scope = UserScope::new("u1");

    // Project without a global context yet.
    service
        .create(&scope, ContextLevel::Project, "P1", map(json!({"name": "Proj"})), None, None)
        .await
        .unwrap();
    // ensure_global created an empty one; enrich it after the resolve.
    let before = service.resolve(&scope, ContextLevel::Project, "P1", false).await.unwrap();
    assert_eq!(before.data.get("org"), None);

    service
        .update(&scope, ContextLevel::Global, "u1", &map(json!({"org": "acme"})), true)
        .await
        .unwrap();

    let after = service.resolve(&scope, ContextLevel::Project, "P1", false).await.unwrap();
    assert_eq!(after.data.get("org"), Some(&json!("acme")));
}

#[tokio::test]
async fn test_delegation_merges_into_target() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    let delegation = service
        .delegate(
            &scope,
            ContextLevel::Task,
            "T1",
            ContextLevel::Project,
            map(json!({"pattern": "builder"})),
            Some("Useful for all tasks".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(delegation.target_context_id, "P1");
    assert_eq!(
        delegation.status,
        strata::context::DelegationStatus::Applied
    );
    assert!(delegation.processed_at.is_some());

    let project = service.get(&scope, ContextLevel::Project, "P1").await.unwrap();
    assert_eq!(project.data.get("pattern"), Some(&json!("builder")));
    assert_eq!(project.version, 2);

    // The promoted value flows back down through resolution.
    let resolved = service.resolve(&scope, ContextLevel::Task, "T1", false).await.unwrap();
    assert_eq!(resolved.data.get("pattern"), Some(&json!("builder")));

    let recorded = service
        .list_delegations(&scope, ContextLevel::Project, "P1")
        .await
        .unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].source_context_id, "T1");
}

#[tokio::test]
async fn test_delegation_rejects_downward_and_sideways() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    let err = service
        .delegate(
            &scope,
            ContextLevel::Project,
            "P1",
            ContextLevel::Task,
            JsonMap::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ContextError::InvalidDelegationTarget { .. }));

    let err = service
        .delegate(
            &scope,
            ContextLevel::Branch,
            "B1",
            ContextLevel::Branch,
            JsonMap::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ContextError::InvalidDelegationTarget { .. }));
}

#[tokio::test]
async fn test_insights_and_progress_append() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    let insight = service
        .add_insight(
            &scope,
            ContextLevel::Task,
            "T1",
            "Cache invalidation is the hard part".to_string(),
            Some(strata::context::InsightCategory::Technical),
            Some(strata::context::InsightImportance::High),
            Some("agent-1".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(insight.content, "Cache invalidation is the hard part");

    service
        .add_progress(&scope, ContextLevel::Task, "T1", "Half done".to_string(), None)
        .await
        .unwrap();

    let task = service.get(&scope, ContextLevel::Task, "T1").await.unwrap();
    assert_eq!(task.insights.len(), 1);
    assert_eq!(task.progress.len(), 1);
    assert_eq!(
        task.insights[0].category,
        Some(strata::context::InsightCategory::Technical)
    );
    // Appends bump the version like a normal update.
    assert_eq!(task.version, 3);

    let err = service
        .add_insight(
            &scope,
            ContextLevel::Task,
            "missing",
            "x".to_string(),
            None,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ContextError::NotFound { .. }));
}

#[tokio::test]
async fn test_list_with_filters() {
    let service = build_service().await;
    let scope = UserScope::new("u1");
    create_fixture(&service, &scope).await;

    service
        .create(
            &scope,
            ContextLevel::Task,
            "T2",
            map(json!({"status": "done"})),
            None,
            Some("B1".to_string()),
        )
        .await
        .unwrap();

    let all = service
        .list(&scope, ContextLevel::Task, &ContextFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let by_branch = service
        .list(
            &scope,
            ContextLevel::Task,
            &ContextFilter {
                git_branch_id: Some("B1".to_string()),
                ..ContextFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(by_branch.len(), 2);

    let by_status = service
        .list(
            &scope,
            ContextLevel::Task,
            &ContextFilter {
                status: Some("done".to_string()),
                ..ContextFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].context_id, "T2");

    let limited = service
        .list(
            &scope,
            ContextLevel::Task,
            &ContextFilter {
                limit: Some(1),
                ..ContextFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}
