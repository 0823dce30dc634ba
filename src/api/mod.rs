//! HTTP API server for petrel.
//!
//! Two audiences share this surface: clients submit and inspect workflows
//! under `/v1/workflows`, and the net-execution substrate plus job services
//! drive running workflows through `/v1/callbacks`. Callback handlers never
//! let an internal fault go silent: the failure response link is answered
//! through the outbox so the net keeps moving.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method as HttpMethod, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::clients::NetClient;
use crate::config::Config;
use crate::coordinator::{persist_workflow, CallbackBody, Coordinator};
use crate::document::Document;
use crate::error::Error;
use crate::graph;
use crate::net::translate;
use crate::store::models::{Execution, OwnerKind, Task, TaskKind};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub net: NetClient,
    pub config: Config,
}

/// Error wrapper translating [`Error`] into a sanitized HTTP response.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let e = self.0;
        if e.is_client_error() {
            warn!(code = e.code(), "request rejected: {}", e);
        } else {
            error!(code = e.code(), "API error: {:?}", e);
        }
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(e.to_external_json())).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Create CORS layer based on environment configuration.
///
/// - PETREL_CORS_ORIGINS: comma-separated list of allowed origins
/// - PETREL_CORS_ALLOW_ALL: "true" allows all origins (not for production)
pub fn create_cors_layer() -> CorsLayer {
    let allow_all = std::env::var("PETREL_CORS_ALLOW_ALL")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);
    if allow_all {
        warn!("CORS configured to allow all origins - this is NOT secure for production!");
        return CorsLayer::very_permissive();
    }

    let origins: Vec<HeaderValue> = std::env::var("PETREL_CORS_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(hv) => Some(hv),
                Err(e) => {
                    warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            HttpMethod::GET,
            HttpMethod::POST,
            HttpMethod::PATCH,
            HttpMethod::DELETE,
            HttpMethod::OPTIONS,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

/// Default maximum concurrent requests.
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

fn max_concurrent_requests() -> usize {
    std::env::var("PETREL_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS)
}

/// Create the API router (without state applied).
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/v1/workflows/{id}",
            get(get_workflow).patch(patch_workflow).delete(delete_workflow),
        )
        .route("/v1/workflows/{id}/details", get(workflow_details))
        .route("/v1/workflows/{id}/outputs", get(workflow_outputs))
        .route("/v1/workflows/{id}/submission", get(workflow_submission))
        .route("/v1/executions/{id}", get(get_execution).patch(patch_execution))
        .route("/v1/callbacks/tasks/{id}", post(task_callback))
        .route("/v1/callbacks/methods/{id}", post(method_callback))
}

/// Create the complete API router with state.
pub fn create_router(state: AppState) -> Router {
    create_api_routes()
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            max_concurrent_requests(),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer())
        .with_state(state)
}

// ============================================================================
// Health
// ============================================================================

async fn health_check(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let count = state
        .coordinator
        .store()
        .read(|tx| Ok(tx.list_workflows()?.len()))
        .await?;
    Ok(Json(json!({"status": "ok", "workflows": count})))
}

// ============================================================================
// Workflow endpoints
// ============================================================================

/// Submit a workflow: validate, build, compile, persist, then hand the plan
/// to the net-execution substrate. Submission failure unwinds the persisted
/// rows so a retry under the same name can succeed.
async fn create_workflow(
    State(state): State<AppState>,
    Json(document): Json<Document>,
) -> ApiResult<Response> {
    let built = graph::build(&document)?;
    let plan = translate(&state.config, &built);

    let store = state.coordinator.store().clone();
    let workflow = store
        .with_tx(|tx| persist_workflow(tx, &built, &plan))
        .await?;

    match state.net.submit_plan(&plan).await {
        Ok(net_key) => {
            store
                .with_tx(|tx| tx.set_net_key(&workflow.id, &net_key))
                .await?;
            Ok((
                StatusCode::CREATED,
                Json(json!({
                    "id": workflow.id,
                    "name": workflow.name,
                    "net_key": net_key,
                })),
            )
                .into_response())
        }
        Err(e) => {
            error!(workflow = %workflow.name, error = %e, "plan submission failed, unwinding");
            if let Err(cleanup) = store.with_tx(|tx| tx.delete_workflow(&workflow.id)).await {
                error!(workflow = %workflow.name, error = %cleanup, "unwind failed");
            }
            Err(e.into())
        }
    }
}

async fn list_workflows(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let rows = state
        .coordinator
        .store()
        .read(|tx| {
            let mut rows = Vec::new();
            for workflow in tx.list_workflows()? {
                let status = tx
                    .find_execution(OwnerKind::Workflow, &workflow.id, 0)?
                    .map(|e| e.status.to_string());
                rows.push(json!({
                    "id": workflow.id,
                    "name": workflow.name,
                    "status": status,
                    "canceled": workflow.canceled,
                    "created_at": workflow.created_at.to_rfc3339(),
                }));
            }
            Ok(rows)
        })
        .await?;
    Ok(Json(json!({"workflows": rows})))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let body = state
        .coordinator
        .store()
        .read(|tx| {
            let workflow = tx.get_workflow(&id)?;
            let execution = tx.find_execution(OwnerKind::Workflow, &workflow.id, 0)?;
            let history = match &execution {
                Some(e) => tx
                    .status_history(&e.id)?
                    .into_iter()
                    .map(|entry| {
                        json!({
                            "status": entry.status.to_string(),
                            "at": entry.created_at.to_rfc3339(),
                        })
                    })
                    .collect(),
                None => Vec::new(),
            };
            Ok(json!({
                "id": workflow.id,
                "name": workflow.name,
                "net_key": workflow.net_key,
                "status": execution.map(|e| e.status.to_string()),
                "status_history": history,
                "canceled": workflow.canceled,
                "created_at": workflow.created_at.to_rfc3339(),
            }))
        })
        .await?;
    Ok(Json(body))
}

#[derive(Deserialize)]
struct WorkflowPatch {
    #[serde(default)]
    is_canceled: bool,
}

async fn patch_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<WorkflowPatch>,
) -> ApiResult<Json<Value>> {
    if !patch.is_canceled {
        return Err(Error::Validation(
            "only {\"is_canceled\": true} is supported".to_string(),
        )
        .into());
    }
    state.coordinator.cancel_workflow(&id).await?;
    Ok(Json(json!({"id": id, "canceled": true})))
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .coordinator
        .store()
        .with_tx(|tx| tx.delete_workflow(&id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The full execution picture: every task with its status records, every
/// method with its own.
async fn workflow_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let body = state
        .coordinator
        .store()
        .read(|tx| {
            let workflow = tx.get_workflow(&id)?;
            let mut tasks = Vec::new();
            for task in tx.tasks_for_workflow(&workflow.id)? {
                let executions: Vec<Value> = tx
                    .executions_for_owner(OwnerKind::Task, &task.id)?
                    .iter()
                    .map(execution_json)
                    .collect();
                let mut methods = Vec::new();
                for method in tx.methods_for_task(&task.id)? {
                    let method_executions: Vec<Value> = tx
                        .executions_for_owner(OwnerKind::Method, &method.id)?
                        .iter()
                        .map(execution_json)
                        .collect();
                    methods.push(json!({
                        "id": method.id,
                        "name": method.name,
                        "kind": method.kind.to_string(),
                        "executions": method_executions,
                    }));
                }
                tasks.push(json!({
                    "id": task.id,
                    "name": task.name,
                    "kind": task.kind.to_string(),
                    "parent_method_id": task.parent_method_id,
                    "topological_index": task.topological_index,
                    "parallel_by": task.parallel_by,
                    "canceled": task.canceled,
                    "executions": executions,
                    "methods": methods,
                }));
            }
            Ok(json!({
                "id": workflow.id,
                "name": workflow.name,
                "tasks": tasks,
            }))
        })
        .await?;
    Ok(Json(body))
}

/// The workflow outputs: the root task's color-0 results, published by the
/// root scope's output connector.
async fn workflow_outputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let body = state
        .coordinator
        .store()
        .read(|tx| {
            let workflow = tx.get_workflow(&id)?;
            let tasks = tx.tasks_for_workflow(&workflow.id)?;
            let root = root_task(&tasks).ok_or(Error::NoSuchEntity {
                kind: "task",
                id: format!("root of workflow {}", workflow.id),
            })?;
            let mut outputs = Map::new();
            for result in tx.results_for_task_at_color(&root.id, 0)? {
                outputs.insert(result.name, result.data);
            }
            Ok(json!({"id": workflow.id, "outputs": outputs}))
        })
        .await?;
    Ok(Json(body))
}

/// The submitted inputs and the compiled plan, for inspection.
async fn workflow_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let body = state
        .coordinator
        .store()
        .read(|tx| {
            let workflow = tx.get_workflow(&id)?;
            let holder = tx
                .tasks_for_workflow(&workflow.id)?
                .into_iter()
                .find(|t| t.kind == TaskKind::InputHolder);
            let inputs = match holder {
                Some(holder) => tx
                    .find_execution(OwnerKind::Task, &holder.id, 0)?
                    .and_then(|e| e.outputs)
                    .unwrap_or_else(|| Value::Object(Map::new())),
                None => Value::Object(Map::new()),
            };
            Ok(json!({
                "id": workflow.id,
                "name": workflow.name,
                "net_key": workflow.net_key,
                "inputs": inputs,
                "plan": workflow.plan,
            }))
        })
        .await?;
    Ok(Json(body))
}

// ============================================================================
// Execution endpoints
// ============================================================================

fn execution_json(execution: &Execution) -> Value {
    json!({
        "id": execution.id,
        "color": execution.color,
        "parent_color": execution.parent_color,
        "status": execution.status.to_string(),
        "data": execution.data,
        "outputs": execution.outputs,
        "job_url": execution.job_url,
        "created_at": execution.created_at.to_rfc3339(),
    })
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let body = state
        .coordinator
        .store()
        .read(|tx| {
            let execution = tx.get_execution(&id)?;
            let history: Vec<Value> = tx
                .status_history(&execution.id)?
                .into_iter()
                .map(|entry| {
                    json!({
                        "status": entry.status.to_string(),
                        "at": entry.created_at.to_rfc3339(),
                    })
                })
                .collect();
            let mut body = execution_json(&execution);
            body["workflow_id"] = json!(execution.workflow_id);
            body["owner_kind"] = json!(execution.owner_kind.to_string());
            body["owner_id"] = json!(execution.owner_id);
            body["status_history"] = json!(history);
            Ok(body)
        })
        .await?;
    Ok(Json(body))
}

async fn patch_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<Json<Value>> {
    let execution = state.coordinator.update_execution(&id, patch).await?;
    Ok(Json(execution_json(&execution)))
}

// ============================================================================
// Callback endpoints
// ============================================================================

#[derive(Deserialize)]
struct CallbackQuery {
    callback_type: String,
    #[serde(default)]
    execution_id: Option<String>,
}

async fn task_callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CallbackQuery>,
    Json(body): Json<CallbackBody>,
) -> ApiResult<StatusCode> {
    let failure_link = body.response_links.failure.clone();
    let result = state
        .coordinator
        .handle_task_callback(&id, &query.callback_type, body)
        .await;
    finish_callback(&state, "task", &id, result, failure_link).await
}

async fn method_callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CallbackQuery>,
    Json(body): Json<CallbackBody>,
) -> ApiResult<StatusCode> {
    let failure_link = body.response_links.failure.clone();
    let result = state
        .coordinator
        .handle_method_callback(&id, &query.callback_type, query.execution_id.as_deref(), body)
        .await;
    finish_callback(&state, "method", &id, result, failure_link).await
}

/// A fault inside a callback handler rolled its transaction back; answer
/// the failure response link anyway so the net does not hang on a place
/// that will never receive a token.
async fn finish_callback(
    state: &AppState,
    entity: &'static str,
    id: &str,
    result: crate::error::Result<()>,
    failure_link: Option<String>,
) -> ApiResult<StatusCode> {
    match result {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) if e.is_client_error() => Err(e.into()),
        Err(e) => {
            error!(entity, id, error = %e, "callback handling failed");
            if let Some(url) = failure_link {
                let enqueue = state
                    .coordinator
                    .store()
                    .with_tx(|tx| {
                        tx.enqueue_notification(None, &url, &json!({"fault": true}))?;
                        Ok(())
                    })
                    .await;
                if let Err(enqueue_err) = enqueue {
                    error!(entity, id, error = %enqueue_err, "failure-link answer lost");
                }
            }
            Err(e.into())
        }
    }
}

fn root_task(tasks: &[Task]) -> Option<&Task> {
    tasks
        .iter()
        .find(|t| t.parent_method_id.is_none() && t.kind == TaskKind::MethodList)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_builds() {
        // Route registration panics on malformed paths at construction.
        let _router: Router<AppState> = create_api_routes();
    }
}
