//! REST surface for the IP workflow stage engine.
//!
//! The sweep endpoint is the externally scheduled trigger: a cron-style
//! caller POSTs with no body and gets the sweep summary back. The rest of
//! the routes cover the stage lifecycle the engine owns: records,
//! stages, extensions, the materials sub-workflow, SLA policies, and the
//! notification feed the UI reads.

#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use ipflow_engine::{EngineError, LogNotifier, StageEngine, SweepFailure, SweepReport};
use ipflow_storage::{
    InMemoryIpStore, NotificationStore, PostgresIpStore, RecordStore, SlaPolicyStore,
    StorageError,
};
use ipflow_types::{
    DurationUnit, IpRecord, Notification, RecordId, SlaPolicy, Stage, StageInstance,
    StageInstanceId, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// ── Configuration ────────────────────────────────────────────────────

/// Storage backend selection.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub notification_cooldown_hours: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            notification_cooldown_hours: 24,
        }
    }
}

// ── State ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<StageEngine>,
    pub records: Arc<dyn RecordStore>,
    pub policies: Arc<dyn SlaPolicyStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub storage_backend: &'static str,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let cooldown = Duration::hours(config.notification_cooldown_hours);
        match config.storage {
            StorageConfig::Memory => {
                let store = Arc::new(InMemoryIpStore::new());
                Ok(Self::from_parts(
                    store.clone(),
                    store.clone(),
                    store.clone(),
                    store,
                    cooldown,
                    "memory",
                ))
            }
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store =
                    Arc::new(PostgresIpStore::connect_with_options(&database_url, max_connections, 5).await?);
                Ok(Self::from_parts(
                    store.clone(),
                    store.clone(),
                    store.clone(),
                    store,
                    cooldown,
                    "postgres",
                ))
            }
        }
    }

    fn from_parts(
        records: Arc<dyn RecordStore>,
        instances: Arc<dyn ipflow_storage::StageInstanceStore>,
        policies: Arc<dyn SlaPolicyStore>,
        notifications: Arc<dyn NotificationStore>,
        cooldown: Duration,
        storage_backend: &'static str,
    ) -> Self {
        let engine = StageEngine::new(
            records.clone(),
            instances,
            policies.clone(),
            notifications.clone(),
            Arc::new(LogNotifier),
        )
        .with_cooldown(cooldown);

        Self {
            engine: Arc::new(engine),
            records,
            policies,
            notifications,
            storage_backend,
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/sweep", post(run_sweep))
        .route("/v1/records", post(create_record))
        .route("/v1/records/:record_id/stages", post(open_stage))
        .route(
            "/v1/records/:record_id/materials/request",
            post(request_materials),
        )
        .route("/v1/stages/:instance_id/complete", post(complete_stage))
        .route("/v1/stages/:instance_id/extend", post(grant_extension))
        .route(
            "/v1/stages/:instance_id/materials/submit",
            post(submit_materials),
        )
        .route("/v1/policies", get(list_policies).put(upsert_policy))
        .route("/v1/notifications", get(list_notifications))
        .with_state(state)
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn storage_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::Conflict(_) | StorageError::InvariantViolation(_) => StatusCode::CONFLICT,
        StorageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Storage(inner) => storage_status(inner),
        EngineError::RecordNotFound(_) | EngineError::InstanceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        EngineError::StageMismatch { .. } => StatusCode::BAD_REQUEST,
        EngineError::ExtensionNotAllowed(_)
        | EngineError::AlreadyResolved(_)
        | EngineError::SweepInProgress => StatusCode::CONFLICT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Http { status, message } => (*status, message.clone()),
            ApiError::Engine(err) => (engine_status(err), err.to_string()),
            ApiError::Storage(err) => (storage_status(err), err.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Sweep ────────────────────────────────────────────────────────────

/// Body of a successful sweep trigger.
#[derive(Debug, Clone, Serialize)]
pub struct SweepResponse {
    pub timestamp: DateTime<Utc>,
    pub stage_checks_completed: usize,
    pub marked_overdue: usize,
    pub marked_expired: usize,
    pub notifications_sent: usize,
    pub errors: Vec<SweepFailure>,
    pub message: String,
}

impl SweepResponse {
    pub fn from_report(report: &SweepReport) -> Self {
        Self {
            timestamp: report.started_at,
            stage_checks_completed: report.checked,
            marked_overdue: report.marked_overdue,
            marked_expired: report.marked_expired,
            notifications_sent: report.notifications_sent,
            errors: report.errors.clone(),
            message: report.summary_message(),
        }
    }
}

async fn run_sweep(State(state): State<ServiceState>) -> Response {
    let now = Utc::now();
    match state.engine.sweep_at(now).await {
        Ok(report) => (StatusCode::OK, Json(SweepResponse::from_report(&report))).into_response(),
        Err(EngineError::SweepInProgress) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "a sweep is already in progress",
                "timestamp": now,
            })),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "sweep failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": err.to_string(),
                    "timestamp": now,
                })),
            )
                .into_response()
        }
    }
}

// ── Health ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "ipflow-service",
        storage_backend: state.storage_backend,
    })
}

// ── Records & Stages ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct CreateRecordRequest {
    title: String,
    applicant_id: String,
    supervisor_id: Option<String>,
    evaluator_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CreateRecordResponse {
    record: IpRecord,
    stage_instance: StageInstance,
}

async fn create_record(
    State(state): State<ServiceState>,
    Json(request): Json<CreateRecordRequest>,
) -> Result<Json<CreateRecordResponse>, ApiError> {
    if request.title.trim().is_empty() {
        return Err(ApiError::bad_request("title is required"));
    }

    let mut record = IpRecord::new(request.title, UserId::new(request.applicant_id));
    if let Some(supervisor) = request.supervisor_id {
        record = record.with_supervisor(UserId::new(supervisor));
    }
    if let Some(evaluator) = request.evaluator_id {
        record = record.with_evaluator(UserId::new(evaluator));
    }

    state.records.create_record(record.clone()).await?;
    let stage_instance = state
        .engine
        .open_stage(&record.id, Stage::Submission, None, Utc::now())
        .await?;

    Ok(Json(CreateRecordResponse {
        record,
        stage_instance,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct OpenStageRequest {
    stage: String,
    assigned_user_id: Option<String>,
}

async fn open_stage(
    State(state): State<ServiceState>,
    Path(record_id): Path<String>,
    Json(request): Json<OpenStageRequest>,
) -> Result<Json<StageInstance>, ApiError> {
    let stage: Stage = request
        .stage
        .parse()
        .map_err(|e| ApiError::bad_request(format!("{e}")))?;

    let instance = state
        .engine
        .open_stage(
            &RecordId::new(record_id),
            stage,
            request.assigned_user_id.map(UserId::new),
            Utc::now(),
        )
        .await?;
    Ok(Json(instance))
}

#[derive(Debug, Clone, Serialize)]
struct StageActionResponse {
    instance_id: String,
    status: &'static str,
}

async fn complete_stage(
    State(state): State<ServiceState>,
    Path(instance_id): Path<String>,
) -> Result<Json<StageActionResponse>, ApiError> {
    let id = StageInstanceId::new(instance_id);
    state.engine.complete_stage(&id, Utc::now()).await?;
    Ok(Json(StageActionResponse {
        instance_id: id.0,
        status: "completed",
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct ExtendRequest {
    granted_by: String,
}

async fn grant_extension(
    State(state): State<ServiceState>,
    Path(instance_id): Path<String>,
    Json(request): Json<ExtendRequest>,
) -> Result<Json<StageInstance>, ApiError> {
    let instance = state
        .engine
        .grant_extension(
            &StageInstanceId::new(instance_id),
            &UserId::new(request.granted_by),
            Utc::now(),
        )
        .await?;
    Ok(Json(instance))
}

async fn request_materials(
    State(state): State<ServiceState>,
    Path(record_id): Path<String>,
) -> Result<Json<StageInstance>, ApiError> {
    let instance = state
        .engine
        .request_materials(&RecordId::new(record_id), Utc::now())
        .await?;
    Ok(Json(instance))
}

async fn submit_materials(
    State(state): State<ServiceState>,
    Path(instance_id): Path<String>,
) -> Result<Json<StageActionResponse>, ApiError> {
    let id = StageInstanceId::new(instance_id);
    state.engine.submit_materials(&id, Utc::now()).await?;
    Ok(Json(StageActionResponse {
        instance_id: id.0,
        status: "completed",
    }))
}

// ── Policies & Notifications ─────────────────────────────────────────

async fn list_policies(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<SlaPolicy>>, ApiError> {
    Ok(Json(state.policies.list_policies().await?))
}

#[derive(Debug, Clone, Deserialize)]
struct UpsertPolicyRequest {
    stage: String,
    duration_days: u32,
    #[serde(default)]
    duration_unit: DurationUnit,
    #[serde(default)]
    grace_days: i64,
    #[serde(default)]
    allow_extensions: bool,
    #[serde(default)]
    max_extensions: u32,
    #[serde(default)]
    extension_days: u32,
}

async fn upsert_policy(
    State(state): State<ServiceState>,
    Json(request): Json<UpsertPolicyRequest>,
) -> Result<Json<SlaPolicy>, ApiError> {
    let stage: Stage = request
        .stage
        .parse()
        .map_err(|e| ApiError::bad_request(format!("{e}")))?;

    let mut policy = SlaPolicy::new(stage, request.duration_days);
    policy.duration_unit = request.duration_unit;
    policy.grace_days = request.grace_days;
    policy.allow_extensions = request.allow_extensions;
    policy.max_extensions = request.max_extensions;
    policy.extension_days = request.extension_days;

    state.policies.upsert_policy(policy.clone()).await?;
    Ok(Json(policy))
}

#[derive(Debug, Clone, Deserialize)]
struct NotificationsQuery {
    recipient: Option<String>,
}

async fn list_notifications(
    State(state): State<ServiceState>,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let recipient = query
        .recipient
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("recipient is required"))?;
    Ok(Json(
        state
            .notifications
            .list_notifications_for(&UserId::new(recipient))
            .await?,
    ))
}
