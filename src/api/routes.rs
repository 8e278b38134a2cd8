// src/api/routes.rs
// HTTP handlers: translate requests into ContextService/BatchExecutor calls.
// The caller's identity arrives resolved in the X-User-Id header; the
// boundary only scopes, it never authenticates.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::str::FromStr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::error::{ApiError, ApiResult};
use crate::api::types::{
    AddInsightRequest, AddProgressRequest, BatchRequest, BatchResponse, ContextsResponse,
    CreateContextRequest, DelegateContextRequest, GetContextQuery, ListContextsQuery,
    ResolveQuery, UpdateContextRequest, normalize_data,
};
use crate::batch::BatchOptions;
use crate::context::types::{
    ContextFilter, ContextLevel, InsightCategory, InsightImportance, UserScope,
};
use crate::state::AppState;

const USER_HEADER: &str = "x-user-id";

fn user_scope(headers: &HeaderMap) -> ApiResult<UserScope> {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing X-User-Id header"))?;
    Ok(UserScope::new(user_id))
}

fn parse_level(level: &str) -> ApiResult<ContextLevel> {
    level.parse::<ContextLevel>().map_err(ApiError::from)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/contexts", post(create_context))
        .route("/contexts/batch", post(execute_batch))
        .route("/contexts/{level}", get(list_contexts))
        .route(
            "/contexts/{level}/{context_id}",
            get(get_context).put(update_context).delete(delete_context),
        )
        .route("/contexts/{level}/{context_id}/resolve", post(resolve_context))
        .route("/contexts/{level}/{context_id}/delegate", post(delegate_context))
        .route("/contexts/{level}/{context_id}/insights", post(add_insight))
        .route("/contexts/{level}/{context_id}/progress", post(add_progress))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn create_context(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateContextRequest>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let level = parse_level(&req.level)?;
    let data = normalize_data(req.data)?;

    let context = state
        .service
        .create(
            &scope,
            level,
            &req.context_id,
            data,
            req.project_id,
            req.git_branch_id,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(context)).into_response())
}

async fn get_context(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((level, context_id)): Path<(String, String)>,
    Query(query): Query<GetContextQuery>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let level = parse_level(&level)?;

    let response = if query.include_inherited {
        let resolved = state
            .service
            .resolve(&scope, level, &context_id, query.force_refresh)
            .await?;
        Json(resolved).into_response()
    } else {
        let context = state.service.get(&scope, level, &context_id).await?;
        Json(context).into_response()
    };
    Ok(response)
}

async fn update_context(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((level, context_id)): Path<(String, String)>,
    Json(req): Json<UpdateContextRequest>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let level = parse_level(&level)?;
    let data = normalize_data(req.data)?;

    let context = state
        .service
        .update(&scope, level, &context_id, &data, req.propagate_changes)
        .await?;
    Ok(Json(context).into_response())
}

async fn delete_context(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((level, context_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let level = parse_level(&level)?;

    let deleted = state.service.delete(&scope, level, &context_id).await?;
    Ok(Json(json!({ "deleted": deleted })).into_response())
}

async fn resolve_context(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((level, context_id)): Path<(String, String)>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let level = parse_level(&level)?;

    let resolved = state
        .service
        .resolve(&scope, level, &context_id, query.force_refresh)
        .await?;
    Ok(Json(resolved).into_response())
}

async fn delegate_context(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((level, context_id)): Path<(String, String)>,
    Json(req): Json<DelegateContextRequest>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let level = parse_level(&level)?;
    let delegate_to = parse_level(&req.delegate_to)?;
    let data = normalize_data(req.data)?;

    let delegation = state
        .service
        .delegate(&scope, level, &context_id, delegate_to, data, req.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(delegation)).into_response())
}

async fn add_insight(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((level, context_id)): Path<(String, String)>,
    Json(req): Json<AddInsightRequest>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let level = parse_level(&level)?;
    let category = req
        .category
        .as_deref()
        .map(InsightCategory::from_str)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let importance = req
        .importance
        .as_deref()
        .map(InsightImportance::from_str)
        .transpose()
        .map_err(ApiError::bad_request)?;

    let insight = state
        .service
        .add_insight(
            &scope,
            level,
            &context_id,
            req.content,
            category,
            importance,
            req.agent,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(insight)).into_response())
}

async fn add_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((level, context_id)): Path<(String, String)>,
    Json(req): Json<AddProgressRequest>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let level = parse_level(&level)?;

    let entry = state
        .service
        .add_progress(&scope, level, &context_id, req.content, req.agent)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

async fn list_contexts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(level): Path<String>,
    Query(query): Query<ListContextsQuery>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let level = parse_level(&level)?;
    let filter = ContextFilter {
        project_id: query.project_id,
        git_branch_id: query.git_branch_id,
        status: query.status,
        limit: query.limit,
        offset: query.offset,
    };

    let contexts = state.service.list(&scope, level, &filter).await?;
    let total = contexts.len();
    Ok(Json(ContextsResponse { contexts, total }).into_response())
}

async fn execute_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchRequest>,
) -> ApiResult<Response> {
    let scope = user_scope(&headers)?;
    let options = BatchOptions {
        transaction: req.transaction,
        parallel: req.parallel,
        stop_on_error: req.stop_on_error,
        default_user_id: Some(scope.user_id().to_string()),
    };

    let results = state.batch.execute_batch(req.operations, &options).await;
    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;
    Ok(Json(BatchResponse {
        results,
        succeeded,
        failed,
    })
    .into_response())
}
