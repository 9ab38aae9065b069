//! HTTP operator API.
//!
//! Maps the controller's operator surface onto an axum router:
//!
//! - `POST /flags/rollout` - create a rollout flag and start progressing it
//! - `POST /flags/{key}/evaluate` - evaluate a flag for a context
//! - `DELETE /flags/{key}` - delete a flag (deployment cleanup)
//! - `GET /rollouts/{key}` / `POST /rollouts/{key}/pause|resume`
//! - `POST /deployments/{id}/revert`
//! - `POST|GET|DELETE /deployments/{id}/triggers`
//! - `POST /deployments/{id}/rollback` / `GET /deployments/{id}/rollbacks`
//! - `GET /health` - daemon health check

use crate::controller::Controller;
use crate::providers::{ActionExecutor, MetricsProvider, TrafficActuator};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use pdc_common::{ControlError, DeploymentId, EvalContext, FlagKey, RollbackTrigger};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Shared state for HTTP handlers.
pub struct ApiContext<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor> {
    pub controller: Arc<Controller<M, T, A>>,
    pub started_at: Instant,
    pub version: &'static str,
}

impl<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor> Clone for ApiContext<M, T, A> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            started_at: self.started_at,
            version: self.version,
        }
    }
}

/// Create the operator API router.
pub fn create_router<M, T, A>(context: ApiContext<M, T, A>) -> Router
where
    M: MetricsProvider,
    T: TrafficActuator,
    A: ActionExecutor,
{
    Router::new()
        .route("/health", get(health_handler::<M, T, A>))
        .route("/flags/rollout", post(create_rollout_flag::<M, T, A>))
        .route("/flags/{key}/evaluate", post(evaluate_flag::<M, T, A>))
        .route("/flags/{key}", delete(delete_flag::<M, T, A>))
        .route("/rollouts", get(list_rollouts::<M, T, A>))
        .route("/rollouts/{key}", get(rollout_status::<M, T, A>))
        .route("/rollouts/{key}/pause", post(pause_rollout::<M, T, A>))
        .route("/rollouts/{key}/resume", post(resume_rollout::<M, T, A>))
        .route("/deployments/{id}/revert", post(revert_rollout::<M, T, A>))
        .route(
            "/deployments/{id}/triggers",
            post(attach_trigger::<M, T, A>)
                .get(trigger_status::<M, T, A>)
                .delete(detach_triggers::<M, T, A>),
        )
        .route("/deployments/{id}/rollback", post(trigger_rollback::<M, T, A>))
        .route("/deployments/{id}/rollbacks", get(rollback_history::<M, T, A>))
        .with_state(Arc::new(context))
}

// ── Error mapping ──────────────────────────────────────────────────────────

struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::UnknownFlag(_) | ControlError::UnknownRollout(_) => {
                StatusCode::NOT_FOUND
            }
            ControlError::CooldownViolation { .. } | ControlError::RollbackInFlight { .. } => {
                StatusCode::CONFLICT
            }
            ControlError::Configuration(_) | ControlError::Expr(_) => StatusCode::BAD_REQUEST,
            ControlError::Exhausted { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ── Requests ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateRolloutRequest {
    feature_name: String,
    #[serde(default)]
    deployment_id: Option<String>,
    #[serde(default)]
    initial_percentage: Option<f64>,
    #[serde(default)]
    increment_interval_minutes: Option<u64>,
    #[serde(default)]
    max_duration_minutes: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CreateRolloutResponse {
    flag_key: String,
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    reason: String,
}

// ── Handlers ───────────────────────────────────────────────────────────────

async fn health_handler<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": ctx.version,
        "uptime_seconds": ctx.started_at.elapsed().as_secs(),
    }))
}

async fn create_rollout_flag<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Json(request): Json<CreateRolloutRequest>,
) -> Result<Json<CreateRolloutResponse>, ApiError> {
    let flag_key = ctx
        .controller
        .create_rollout_flag(
            &request.feature_name,
            request.deployment_id.map(DeploymentId::new),
            request.initial_percentage,
            request.increment_interval_minutes,
            request.max_duration_minutes,
        )
        .await?;
    Ok(Json(CreateRolloutResponse {
        flag_key: flag_key.to_string(),
    }))
}

async fn evaluate_flag<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(key): Path<String>,
    Json(context): Json<EvalContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let value = ctx
        .controller
        .evaluate_flag(&FlagKey::new(key), &context)
        .await?;
    Ok(Json(json!({ "value": value })))
}

async fn delete_flag<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.controller.delete_flag(&FlagKey::new(key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_rollouts<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
) -> impl IntoResponse {
    Json(ctx.controller.get_all_rollouts().await)
}

async fn rollout_status<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    match ctx.controller.get_rollout_status(&FlagKey::new(key.clone())).await {
        Some(state) => Ok(Json(state).into_response()),
        None => Err(ControlError::UnknownRollout(key).into()),
    }
}

async fn pause_rollout<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.controller.pause_rollout(&FlagKey::new(key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_rollout<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.controller.resume_rollout(&FlagKey::new(key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn revert_rollout<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let reverted = ctx
        .controller
        .revert_rollout(&DeploymentId::new(id))
        .await;
    Json(json!({ "reverted": reverted }))
}

async fn attach_trigger<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(id): Path<String>,
    Json(trigger): Json<RollbackTrigger>,
) -> Result<StatusCode, ApiError> {
    ctx.controller
        .attach_trigger(DeploymentId::new(id), trigger)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn trigger_status<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(ctx.controller.get_trigger_status(&DeploymentId::new(id)).await)
}

async fn detach_triggers<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(id): Path<String>,
) -> StatusCode {
    ctx.controller.detach_triggers(&DeploymentId::new(id)).await;
    StatusCode::NO_CONTENT
}

async fn trigger_rollback<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<crate::rollback::RollbackExecution>, ApiError> {
    let execution = ctx
        .controller
        .trigger_rollback(&DeploymentId::new(id), &request.reason)
        .await?;
    Ok(Json(execution))
}

async fn rollback_history<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor>(
    State(ctx): State<Arc<ApiContext<M, T, A>>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(ctx.controller.get_rollback_history(&DeploymentId::new(id)).await)
}
