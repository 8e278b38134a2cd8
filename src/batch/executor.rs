// src/batch/executor.rs
//! Batch execution of context operations.
//!
//! One batch runs under a chosen policy: sequential continue-on-error,
//! sequential stop-on-error, transactional (stop-on-error with compensating
//! rollback of already-applied writes), or parallel with bounded
//! concurrency. Per-operation failures never escape `execute_batch`; each
//! becomes a failed result row with its error text and timing.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::error::{ContextError, ContextResult};
use crate::context::service::ContextService;
use crate::context::store::ContextStore;
use crate::context::types::{Context, ContextFilter, ContextLevel, JsonMap, UserScope};

/// Error text recorded on operations never attempted after a stop. The
/// exact string is load-bearing: external callers pattern-match on it, and
/// it is used uniformly whether or not `transaction` was set.
pub const ROLLBACK_MARKER: &str = "Transaction rolled back";

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Concurrency bound for parallel mode.
    pub max_parallel: usize,
    /// Per-operation timeout, applied in parallel mode only.
    pub op_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            op_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOperationType {
    Create,
    Update,
    Delete,
    Upsert,
}

impl FromStr for BatchOperationType {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(BatchOperationType::Create),
            "update" => Ok(BatchOperationType::Update),
            "delete" => Ok(BatchOperationType::Delete),
            "upsert" => Ok(BatchOperationType::Upsert),
            other => Err(ContextError::UnknownOperationType(other.to_string())),
        }
    }
}

fn default_propagate() -> bool {
    true
}

/// One operation of a batch. `operation` stays a string so an unknown type
/// fails that single operation instead of rejecting the whole batch at the
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOperation {
    pub operation: String,
    pub level: ContextLevel,
    pub context_id: String,
    #[serde(default)]
    pub data: Option<JsonMap>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub git_branch_id: Option<String>,
    #[serde(default = "default_propagate")]
    pub propagate_changes: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOperationResult {
    pub operation: BatchOperation,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: f64,
}

impl BatchOperationResult {
    fn ok(operation: BatchOperation, result: Value, elapsed_ms: f64) -> Self {
        Self {
            operation,
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms: elapsed_ms,
        }
    }

    fn failed(operation: BatchOperation, error: String, elapsed_ms: f64) -> Self {
        Self {
            operation,
            success: false,
            result: None,
            error: Some(error),
            execution_time_ms: elapsed_ms,
        }
    }

    fn rolled_back(operation: BatchOperation) -> Self {
        Self::failed(operation, ROLLBACK_MARKER.to_string(), 0.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchOptions {
    /// Stop on first failure and reverse already-applied writes.
    #[serde(default)]
    pub transaction: bool,
    /// Dispatch all operations concurrently; `stop_on_error` has no effect.
    #[serde(default)]
    pub parallel: bool,
    /// Stop on first failure without reversing applied writes.
    #[serde(default)]
    pub stop_on_error: bool,
    /// Applied to operations that carry no explicit user_id.
    #[serde(default)]
    pub default_user_id: Option<String>,
}

/// Reversal steps for transactional mode, replayed last-in-first-out.
enum UndoAction {
    DeleteCreated {
        scope: UserScope,
        level: ContextLevel,
        context_id: String,
    },
    RestoreSnapshot {
        scope: UserScope,
        context: Context,
    },
}

pub struct BatchExecutor {
    service: Arc<ContextService>,
    store: Arc<dyn ContextStore>,
    config: BatchConfig,
}

impl BatchExecutor {
    pub fn new(
        service: Arc<ContextService>,
        store: Arc<dyn ContextStore>,
        config: BatchConfig,
    ) -> Self {
        Self {
            service,
            store,
            config,
        }
    }

    /// Run a batch under the options' policy. Always returns one result per
    /// operation, in input order.
    pub async fn execute_batch(
        &self,
        mut operations: Vec<BatchOperation>,
        options: &BatchOptions,
    ) -> Vec<BatchOperationResult> {
        for op in &mut operations {
            if op.user_id.is_none() {
                op.user_id = options.default_user_id.clone();
            }
        }

        let results = if options.parallel {
            self.execute_parallel(operations).await
        } else {
            self.execute_sequential(operations, options).await
        };

        // Batched invalidation: once per distinct touched context for
        // successful non-delete operations. DELETE already invalidated
        // inline, while the descendant bookkeeping still existed.
        let mut touched: HashSet<(String, ContextLevel, String)> = HashSet::new();
        for result in &results {
            let op = &result.operation;
            if !result.success || op.operation.eq_ignore_ascii_case("delete") {
                continue;
            }
            let Some(user_id) = &op.user_id else { continue };
            if touched.insert((user_id.clone(), op.level, op.context_id.clone())) {
                let scope = UserScope::new(user_id.clone());
                self.service
                    .invalidate(&scope, op.level, &op.context_id, true);
            }
        }

        info!(
            "Batch finished: {}/{} operations succeeded",
            results.iter().filter(|r| r.success).count(),
            results.len()
        );
        results
    }

    async fn execute_sequential(
        &self,
        operations: Vec<BatchOperation>,
        options: &BatchOptions,
    ) -> Vec<BatchOperationResult> {
        let mut results = Vec::with_capacity(operations.len());
        let mut undo_log: Vec<UndoAction> = Vec::new();
        let mut stopped = false;

        for op in operations {
            if stopped {
                results.push(BatchOperationResult::rolled_back(op));
                continue;
            }

            let started = Instant::now();
            let outcome = self
                .dispatch(&op, if options.transaction { Some(&mut undo_log) } else { None })
                .await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            match outcome {
                Ok(value) => results.push(BatchOperationResult::ok(op, value, elapsed_ms)),
                Err(e) => {
                    results.push(BatchOperationResult::failed(op, e.to_string(), elapsed_ms));
                    if options.transaction || options.stop_on_error {
                        if options.transaction {
                            self.rollback(&mut undo_log).await;
                        }
                        stopped = true;
                    }
                }
            }
        }

        results
    }

    async fn execute_parallel(&self, operations: Vec<BatchOperation>) -> Vec<BatchOperationResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));

        let tasks = operations.into_iter().map(|op| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let started = Instant::now();
                let outcome =
                    tokio::time::timeout(self.config.op_timeout, self.dispatch(&op, None)).await;
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

                match outcome {
                    Ok(Ok(value)) => BatchOperationResult::ok(op, value, elapsed_ms),
                    Ok(Err(e)) => BatchOperationResult::failed(op, e.to_string(), elapsed_ms),
                    Err(_) => BatchOperationResult::failed(
                        op,
                        format!(
                            "Operation timed out after {}ms",
                            self.config.op_timeout.as_millis()
                        ),
                        elapsed_ms,
                    ),
                }
            }
        });

        futures::future::join_all(tasks).await
    }

    async fn dispatch(
        &self,
        op: &BatchOperation,
        mut undo: Option<&mut Vec<UndoAction>>,
    ) -> ContextResult<Value> {
        let op_type = BatchOperationType::from_str(&op.operation)?;
        let user_id = op.user_id.clone().ok_or_else(|| {
            ContextError::Operation("batch operation carries no user_id".to_string())
        })?;
        let scope = UserScope::new(user_id);
        let data = op.data.clone().unwrap_or_default();

        match op_type {
            BatchOperationType::Create => {
                let context = self
                    .service
                    .create(
                        &scope,
                        op.level,
                        &op.context_id,
                        data,
                        op.project_id.clone(),
                        op.git_branch_id.clone(),
                    )
                    .await?;
                if let Some(log) = undo.as_mut() {
                    log.push(UndoAction::DeleteCreated {
                        scope: scope.clone(),
                        level: op.level,
                        context_id: op.context_id.clone(),
                    });
                }
                Ok(serde_json::to_value(context)?)
            }
            BatchOperationType::Update => {
                if let Some(log) = undo.as_mut() {
                    if let Some(before) = self.store.get(&scope, op.level, &op.context_id).await? {
                        log.push(UndoAction::RestoreSnapshot {
                            scope: scope.clone(),
                            context: before,
                        });
                    }
                }
                let context = self
                    .service
                    .update(&scope, op.level, &op.context_id, &data, op.propagate_changes)
                    .await?;
                Ok(serde_json::to_value(context)?)
            }
            BatchOperationType::Delete => {
                if let Some(log) = undo.as_mut() {
                    if let Some(before) = self.store.get(&scope, op.level, &op.context_id).await? {
                        log.push(UndoAction::RestoreSnapshot {
                            scope: scope.clone(),
                            context: before,
                        });
                    }
                }
                let existed = self.service.delete(&scope, op.level, &op.context_id).await?;
                Ok(serde_json::json!({ "deleted": existed }))
            }
            BatchOperationType::Upsert => {
                if self.store.exists(&scope, op.level, &op.context_id).await? {
                    if let Some(log) = undo.as_mut() {
                        if let Some(before) =
                            self.store.get(&scope, op.level, &op.context_id).await?
                        {
                            log.push(UndoAction::RestoreSnapshot {
                                scope: scope.clone(),
                                context: before,
                            });
                        }
                    }
                    let context = self
                        .service
                        .update(&scope, op.level, &op.context_id, &data, op.propagate_changes)
                        .await?;
                    Ok(serde_json::to_value(context)?)
                } else {
                    let context = self
                        .service
                        .create(
                            &scope,
                            op.level,
                            &op.context_id,
                            data,
                            op.project_id.clone(),
                            op.git_branch_id.clone(),
                        )
                        .await?;
                    if let Some(log) = undo.as_mut() {
                        log.push(UndoAction::DeleteCreated {
                            scope: scope.clone(),
                            level: op.level,
                            context_id: op.context_id.clone(),
                        });
                    }
                    Ok(serde_json::to_value(context)?)
                }
            }
        }
    }

    /// Reverse applied writes, newest first. Rollback is best-effort: a
    /// failing compensation is logged and the rest still run.
    async fn rollback(&self, undo_log: &mut Vec<UndoAction>) {
        while let Some(action) = undo_log.pop() {
            match action {
                UndoAction::DeleteCreated {
                    scope,
                    level,
                    context_id,
                } => {
                    if let Err(e) = self.store.delete(&scope, level, &context_id).await {
                        warn!("Rollback delete of {} '{}' failed: {}", level, context_id, e);
                    }
                    self.service.invalidate(&scope, level, &context_id, true);
                }
                UndoAction::RestoreSnapshot { scope, context } => {
                    let (level, context_id) = (context.level, context.context_id.clone());
                    if let Err(e) = self.store.restore(&scope, &context).await {
                        warn!("Rollback restore of {} '{}' failed: {}", level, context_id, e);
                    }
                    self.service.invalidate(&scope, level, &context_id, true);
                }
            }
        }
    }

    /// Sequential continue-on-error CREATE over the given operations.
    pub async fn bulk_create(
        &self,
        operations: Vec<BatchOperation>,
        default_user_id: Option<String>,
    ) -> Vec<BatchOperationResult> {
        let operations = operations
            .into_iter()
            .map(|mut op| {
                op.operation = "create".to_string();
                op
            })
            .collect();
        self.execute_batch(
            operations,
            &BatchOptions {
                default_user_id,
                ..BatchOptions::default()
            },
        )
        .await
    }

    /// Sequential continue-on-error UPDATE over the given operations.
    pub async fn bulk_update(
        &self,
        operations: Vec<BatchOperation>,
        default_user_id: Option<String>,
    ) -> Vec<BatchOperationResult> {
        let operations = operations
            .into_iter()
            .map(|mut op| {
                op.operation = "update".to_string();
                op
            })
            .collect();
        self.execute_batch(
            operations,
            &BatchOptions {
                default_user_id,
                ..BatchOptions::default()
            },
        )
        .await
    }

    /// Copy a branch context (and optionally its task contexts) onto another
    /// branch. A missing source is a no-op, not an error. Task copies get
    /// fresh ids with their branch reference rewritten to the target.
    pub async fn copy_contexts(
        &self,
        scope: &UserScope,
        source_branch_id: &str,
        target_branch_id: &str,
        include_task_contexts: bool,
    ) -> Vec<BatchOperationResult> {
        let source = match self
            .store
            .get(scope, ContextLevel::Branch, source_branch_id)
            .await
        {
            Ok(Some(context)) => context,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("copy_contexts failed to load source branch: {}", e);
                return Vec::new();
            }
        };

        let mut operations = vec![BatchOperation {
            operation: "upsert".to_string(),
            level: ContextLevel::Branch,
            context_id: target_branch_id.to_string(),
            data: Some(source.data.clone()),
            user_id: Some(scope.user_id().to_string()),
            project_id: None,
            git_branch_id: None,
            propagate_changes: true,
        }];

        if include_task_contexts {
            let filter = ContextFilter {
                git_branch_id: Some(source_branch_id.to_string()),
                ..ContextFilter::default()
            };
            match self.store.list(scope, ContextLevel::Task, &filter).await {
                Ok(tasks) => {
                    for task in tasks {
                        let mut data = task.data.clone();
                        data.insert(
                            "branch_id".to_string(),
                            Value::String(target_branch_id.to_string()),
                        );
                        operations.push(BatchOperation {
                            operation: "create".to_string(),
                            level: ContextLevel::Task,
                            context_id: Uuid::new_v4().to_string(),
                            data: Some(data),
                            user_id: Some(scope.user_id().to_string()),
                            project_id: None,
                            git_branch_id: Some(target_branch_id.to_string()),
                            propagate_changes: true,
                        });
                    }
                }
                Err(e) => warn!("copy_contexts failed to list task contexts: {}", e),
            }
        }

        self.execute_batch(
            operations,
            &BatchOptions {
                default_user_id: Some(scope.user_id().to_string()),
                ..BatchOptions::default()
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_parsing() {
        assert_eq!(
            BatchOperationType::from_str("CREATE").unwrap(),
            BatchOperationType::Create
        );
        assert_eq!(
            BatchOperationType::from_str("upsert").unwrap(),
            BatchOperationType::Upsert
        );
        assert!(matches!(
            BatchOperationType::from_str("merge"),
            Err(ContextError::UnknownOperationType(_))
        ));
    }

    #[test]
    fn test_operation_deserialization_defaults() {
        let op: BatchOperation = serde_json::from_str(
            r#"{"operation": "create", "level": "task", "context_id": "t1"}"#,
        )
        .unwrap();
        assert!(op.propagate_changes);
        assert!(op.data.is_none());
        assert!(op.user_id.is_none());
    }

    #[test]
    fn test_rollback_marker_text() {
        let op: BatchOperation = serde_json::from_str(
            r#"{"operation": "update", "level": "task", "context_id": "t1"}"#,
        )
        .unwrap();
        let result = BatchOperationResult::rolled_back(op);
        assert_eq!(result.error.as_deref(), Some("Transaction rolled back"));
        assert!(!result.success);
        assert_eq!(result.execution_time_ms, 0.0);
    }
}
