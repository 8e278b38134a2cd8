// src/api/types.rs
// Request/response shapes for the REST surface. The boundary owns data
// normalization: `data` may arrive as a JSON object or a JSON-encoded
// string; the core only ever sees typed maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::error::ApiError;
use crate::batch::{BatchOperation, BatchOperationResult};
use crate::context::types::{Context, JsonMap};

#[derive(Debug, Deserialize)]
pub struct CreateContextRequest {
    pub level: String,
    pub context_id: String,
    #[serde(default)]
    pub data: Option<Value>,
    pub project_id: Option<String>,
    pub git_branch_id: Option<String>,
}

fn default_propagate() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct UpdateContextRequest {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default = "default_propagate")]
    pub propagate_changes: bool,
}

#[derive(Debug, Deserialize)]
pub struct DelegateContextRequest {
    pub delegate_to: String,
    #[serde(default)]
    pub data: Option<Value>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddInsightRequest {
    pub content: String,
    pub category: Option<String>,
    pub importance: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddProgressRequest {
    pub content: String,
    pub agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetContextQuery {
    #[serde(default)]
    pub include_inherited: bool,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveQuery {
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListContextsQuery {
    pub project_id: Option<String>,
    pub git_branch_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<BatchOperation>,
    #[serde(default)]
    pub transaction: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub stop_on_error: bool,
}

#[derive(Debug, Serialize)]
pub struct ContextsResponse {
    pub contexts: Vec<Context>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchOperationResult>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Normalize a `data` payload: a JSON object passes through, a JSON-encoded
/// object string is parsed, anything else is rejected. Absent means empty.
pub fn normalize_data(value: Option<Value>) -> Result<JsonMap, ApiError> {
    match value {
        None | Some(Value::Null) => Ok(JsonMap::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(ApiError::bad_request(
                "data string must contain a JSON object",
            )),
        },
        Some(_) => Err(ApiError::bad_request(
            "data must be a JSON object or a JSON-encoded object string",
        )),
    }
}
