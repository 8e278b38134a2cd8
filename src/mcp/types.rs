// src/mcp/types.rs
// Request types for MCP tools.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ManageContextRequest {
    #[schemars(description = "Action: create/get/update/delete/resolve/add_insight/add_progress/list")]
    pub action: String,
    #[schemars(description = "Context level: global/project/branch/task")]
    pub level: String,
    #[schemars(description = "Context ID (for global, the user id)")]
    pub context_id: Option<String>,
    #[schemars(description = "Context data (JSON object, or JSON-encoded object string)")]
    pub data: Option<Value>,
    #[schemars(description = "User id owning the context (defaults to the configured user)")]
    pub user_id: Option<String>,
    #[schemars(description = "Parent project id (for branch contexts)")]
    pub project_id: Option<String>,
    #[schemars(description = "Parent branch id (for task contexts)")]
    pub git_branch_id: Option<String>,
    #[schemars(description = "get/resolve: include inherited ancestor data")]
    pub include_inherited: Option<bool>,
    #[schemars(description = "resolve: bypass the cache and re-resolve")]
    pub force_refresh: Option<bool>,
    #[schemars(description = "update: invalidate descendants' cached views (default true)")]
    pub propagate_changes: Option<bool>,
    #[schemars(description = "add_insight/add_progress: entry content")]
    pub content: Option<String>,
    #[schemars(description = "add_insight: technical/business/performance/risk/discovery")]
    pub category: Option<String>,
    #[schemars(description = "add_insight: low/medium/high/critical")]
    pub importance: Option<String>,
    #[schemars(description = "add_insight/add_progress: reporting agent")]
    pub agent: Option<String>,
    #[schemars(description = "list: filter by status key in data")]
    pub status: Option<String>,
    #[schemars(description = "list: max results")]
    pub limit: Option<i64>,
    #[schemars(description = "list: skip results")]
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DelegateContextRequest {
    #[schemars(description = "Source context level: project/branch/task")]
    pub level: String,
    #[schemars(description = "Source context ID")]
    pub context_id: String,
    #[schemars(description = "Target ancestor level: global/project/branch")]
    pub delegate_to: String,
    #[schemars(description = "Data to promote into the target (JSON object)")]
    pub data: Option<Value>,
    #[schemars(description = "Why this data is being promoted")]
    pub reason: Option<String>,
    #[schemars(description = "User id owning the contexts")]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BatchContextRequest {
    #[schemars(description = "Operations array; each: {operation, level, context_id, data?, user_id?, project_id?, git_branch_id?, propagate_changes?}")]
    pub operations: Value,
    #[schemars(description = "Stop on first failure and roll back applied writes")]
    pub transaction: Option<bool>,
    #[schemars(description = "Dispatch operations concurrently")]
    pub parallel: Option<bool>,
    #[schemars(description = "Stop on first failure (no rollback)")]
    pub stop_on_error: Option<bool>,
    #[schemars(description = "User id applied to operations without one")]
    pub user_id: Option<String>,
}
