// src/mcp/handlers.rs
// Per-action handlers for the MCP tools. Each normalizes its inputs and
// calls the core; typed errors bubble up as anyhow for the tool layer to
// render.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::str::FromStr;

use crate::batch::{BatchOperation, BatchOptions};
use crate::context::types::{
    ContextFilter, ContextLevel, InsightCategory, InsightImportance, JsonMap, UserScope,
};
use crate::mcp::types::{BatchContextRequest, DelegateContextRequest, ManageContextRequest};
use crate::mcp::StrataServer;

/// Same normalization rule as the REST boundary: object, or JSON-encoded
/// object string.
fn normalize_data(value: Option<Value>) -> Result<JsonMap> {
    match value {
        None | Some(Value::Null) => Ok(JsonMap::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => Ok(map),
            _ => bail!("data string must contain a JSON object"),
        },
        Some(_) => bail!("data must be a JSON object or a JSON-encoded object string"),
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("{name} required"))
}

pub async fn create(server: &StrataServer, req: &ManageContextRequest) -> Result<Value> {
    let scope = server.scope_for(&req.user_id);
    let level = ContextLevel::from_str(&req.level)?;
    let context_id = required(&req.context_id, "context_id")?;
    let data = normalize_data(req.data.clone())?;

    let context = server
        .service
        .create(
            &scope,
            level,
            context_id,
            data,
            req.project_id.clone(),
            req.git_branch_id.clone(),
        )
        .await?;
    Ok(serde_json::to_value(context)?)
}

pub async fn get(server: &StrataServer, req: &ManageContextRequest) -> Result<Value> {
    let scope = server.scope_for(&req.user_id);
    let level = ContextLevel::from_str(&req.level)?;
    let context_id = required(&req.context_id, "context_id")?;

    if req.include_inherited.unwrap_or(false) {
        let resolved = server
            .service
            .resolve(&scope, level, context_id, req.force_refresh.unwrap_or(false))
            .await?;
        Ok(serde_json::to_value(resolved)?)
    } else {
        let context = server.service.get(&scope, level, context_id).await?;
        Ok(serde_json::to_value(context)?)
    }
}

pub async fn update(server: &StrataServer, req: &ManageContextRequest) -> Result<Value> {
    let scope = server.scope_for(&req.user_id);
    let level = ContextLevel::from_str(&req.level)?;
    let context_id = required(&req.context_id, "context_id")?;
    let data = normalize_data(req.data.clone())?;

    let context = server
        .service
        .update(
            &scope,
            level,
            context_id,
            &data,
            req.propagate_changes.unwrap_or(true),
        )
        .await?;
    Ok(serde_json::to_value(context)?)
}

pub async fn delete(server: &StrataServer, req: &ManageContextRequest) -> Result<Value> {
    let scope = server.scope_for(&req.user_id);
    let level = ContextLevel::from_str(&req.level)?;
    let context_id = required(&req.context_id, "context_id")?;

    let deleted = server.service.delete(&scope, level, context_id).await?;
    Ok(json!({ "deleted": deleted }))
}

pub async fn resolve(server: &StrataServer, req: &ManageContextRequest) -> Result<Value> {
    let scope = server.scope_for(&req.user_id);
    let level = ContextLevel::from_str(&req.level)?;
    let context_id = required(&req.context_id, "context_id")?;

    let resolved = server
        .service
        .resolve(&scope, level, context_id, req.force_refresh.unwrap_or(false))
        .await?;
    Ok(serde_json::to_value(resolved)?)
}

pub async fn add_insight(server: &StrataServer, req: &ManageContextRequest) -> Result<Value> {
    let scope = server.scope_for(&req.user_id);
    let level = ContextLevel::from_str(&req.level)?;
    let context_id = required(&req.context_id, "context_id")?;
    let content = required(&req.content, "content")?;
    let category = req
        .category
        .as_deref()
        .map(InsightCategory::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;
    let importance = req
        .importance
        .as_deref()
        .map(InsightImportance::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let insight = server
        .service
        .add_insight(
            &scope,
            level,
            context_id,
            content.to_string(),
            category,
            importance,
            req.agent.clone(),
        )
        .await?;
    Ok(serde_json::to_value(insight)?)
}

pub async fn add_progress(server: &StrataServer, req: &ManageContextRequest) -> Result<Value> {
    let scope = server.scope_for(&req.user_id);
    let level = ContextLevel::from_str(&req.level)?;
    let context_id = required(&req.context_id, "context_id")?;
    let content = required(&req.content, "content")?;

    let entry = server
        .service
        .add_progress(&scope, level, context_id, content.to_string(), req.agent.clone())
        .await?;
    Ok(serde_json::to_value(entry)?)
}

pub async fn list(server: &StrataServer, req: &ManageContextRequest) -> Result<Value> {
    let scope = server.scope_for(&req.user_id);
    let level = ContextLevel::from_str(&req.level)?;
    let filter = ContextFilter {
        project_id: req.project_id.clone(),
        git_branch_id: req.git_branch_id.clone(),
        status: req.status.clone(),
        limit: req.limit,
        offset: req.offset,
    };

    let contexts = server.service.list(&scope, level, &filter).await?;
    let total = contexts.len();
    Ok(json!({ "contexts": contexts, "total": total }))
}

pub async fn delegate(server: &StrataServer, req: &DelegateContextRequest) -> Result<Value> {
    let scope = server.scope_for(&req.user_id);
    let level = ContextLevel::from_str(&req.level)?;
    let delegate_to = ContextLevel::from_str(&req.delegate_to)?;
    let data = normalize_data(req.data.clone())?;

    let delegation = server
        .service
        .delegate(
            &scope,
            level,
            &req.context_id,
            delegate_to,
            data,
            req.reason.clone(),
        )
        .await?;
    Ok(serde_json::to_value(delegation)?)
}

pub async fn batch(server: &StrataServer, req: BatchContextRequest) -> Result<Value> {
    let operations: Vec<BatchOperation> = serde_json::from_value(req.operations)
        .map_err(|e| anyhow::anyhow!("invalid operations array: {e}"))?;
    let scope = server.scope_for(&req.user_id);
    let options = BatchOptions {
        transaction: req.transaction.unwrap_or(false),
        parallel: req.parallel.unwrap_or(false),
        stop_on_error: req.stop_on_error.unwrap_or(false),
        default_user_id: Some(scope.user_id().to_string()),
    };

    let results = server.batch.execute_batch(operations, &options).await;
    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;
    Ok(json!({ "results": results, "succeeded": succeeded, "failed": failed }))
}

/// Scope helper shared by the handlers.
pub fn scope_from(user_id: &Option<String>, default_user: &str) -> UserScope {
    match user_id.as_deref().filter(|s| !s.is_empty()) {
        Some(user_id) => UserScope::new(user_id),
        None => UserScope::new(default_user),
    }
}
