// src/mcp/mod.rs
// MCP server: the tool-call surface over the context engine.

pub mod handlers;
pub mod types;

use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::batch::BatchExecutor;
use crate::config::CONFIG;
use crate::context::service::ContextService;
use crate::context::types::UserScope;
use crate::state::AppState;
use types::{BatchContextRequest, DelegateContextRequest, ManageContextRequest};

fn json_response<T: Serialize>(value: T) -> CallToolResult {
    let text = serde_json::to_string_pretty(&value)
        .unwrap_or_else(|e| format!("serialization error: {e}"));
    CallToolResult::success(vec![Content::text(text)])
}

/// Helper to create an unknown action error response
fn unknown_action(action: &str, valid_actions: &str) -> CallToolResult {
    CallToolResult::error(vec![Content::text(format!(
        "Unknown action: {}. Use {}",
        action, valid_actions
    ))])
}

#[derive(Clone)]
pub struct StrataServer {
    pub service: Arc<ContextService>,
    pub batch: Arc<BatchExecutor>,
    tool_router: ToolRouter<Self>,
}

impl StrataServer {
    pub fn new(state: AppState) -> Self {
        Self {
            service: state.service,
            batch: state.batch,
            tool_router: Self::tool_router(),
        }
    }

    /// Scope from an explicit user id, or the configured default user.
    pub fn scope_for(&self, user_id: &Option<String>) -> UserScope {
        handlers::scope_from(user_id, &CONFIG.default_user_id)
    }
}

#[tool_router]
impl StrataServer {
    #[tool(
        description = "Manage hierarchical contexts (global/project/branch/task). Actions: create/get/update/delete/resolve/add_insight/add_progress/list"
    )]
    async fn manage_context(
        &self,
        Parameters(req): Parameters<ManageContextRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result = match req.action.as_str() {
            "create" => handlers::create(self, &req).await,
            "get" => handlers::get(self, &req).await,
            "update" => handlers::update(self, &req).await,
            "delete" => handlers::delete(self, &req).await,
            "resolve" => handlers::resolve(self, &req).await,
            "add_insight" => handlers::add_insight(self, &req).await,
            "add_progress" => handlers::add_progress(self, &req).await,
            "list" => handlers::list(self, &req).await,
            action => {
                return Ok(unknown_action(
                    action,
                    "create/get/update/delete/resolve/add_insight/add_progress/list",
                ));
            }
        };

        match result {
            Ok(value) => Ok(json_response(value)),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    #[tool(
        description = "Promote data from a context into one of its ancestors (task/branch -> project/global). Delegation applies immediately."
    )]
    async fn delegate_context(
        &self,
        Parameters(req): Parameters<DelegateContextRequest>,
    ) -> Result<CallToolResult, McpError> {
        match handlers::delegate(self, &req).await {
            Ok(value) => Ok(json_response(value)),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    #[tool(
        description = "Execute a batch of context operations (create/update/delete/upsert) under sequential, stop-on-error, transactional, or parallel policy."
    )]
    async fn batch_context(
        &self,
        Parameters(req): Parameters<BatchContextRequest>,
    ) -> Result<CallToolResult, McpError> {
        match handlers::batch(self, req).await {
            Ok(value) => Ok(json_response(value)),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }
}

#[tool_handler]
impl ServerHandler for StrataServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "strata".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Strata provides hierarchical context storage for AI agents: a \
                 global/project/branch/task hierarchy with inheritance resolution, \
                 upward delegation, and batch operations. All data is scoped per user."
                    .to_string(),
            ),
        }
    }
}
