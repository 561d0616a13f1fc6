use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use jornada_api::{
    load_rules, AdjustPointsRequest, ApiError, MigrateResult, ProfileView, ProgressionApi,
    RegisterQuizRequest, RegisterQuizResult, ScoreQuizRequest, API_CONTRACT_VERSION,
    DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_MAX_SUBMIT_ATTEMPTS,
};
use jornada_core::{
    ActivityClaim, ActivityPayload, AwardSummary, BadgeDefinition, CreditedActivity,
    ProgressionError, QuizScore, UserId,
};
use jornada_store_sqlite::{LeaderboardEntry, PointAdjustment, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ProgressionApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    kind: &'static str,
    retry_safe: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "jornada-service")]
#[command(about = "Local HTTP service for Jornada progression")]
struct Args {
    #[arg(long, env = "JORNADA_DB", default_value = "./jornada.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "JORNADA_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// YAML file overriding weights, level thresholds, and badges.
    #[arg(long, env = "JORNADA_RULES")]
    rules: Option<PathBuf>,
    /// Log filter directive used when `RUST_LOG` is unset.
    #[arg(long, env = "JORNADA_LOG", default_value = "info")]
    log: String,
    /// Attempts per activity submission before a write conflict is returned.
    #[arg(long, env = "JORNADA_MAX_SUBMIT_ATTEMPTS", default_value_t = DEFAULT_MAX_SUBMIT_ATTEMPTS)]
    max_submit_attempts: u32,
    /// Milliseconds a write waits on another writer before it counts as a conflict.
    #[arg(long, env = "JORNADA_BUSY_TIMEOUT_MS", default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    busy_timeout_ms: u64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<ApiError> for ServiceError {
    fn from(value: ApiError) -> Self {
        let status = match value {
            ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            let detail = format!("{value:#}");
            tracing::error!(error = %detail, "storage failure");
        }
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: value.to_string(),
            kind: value.kind(),
            retry_safe: value.is_retry_safe(),
        }
    }
}

impl From<ProgressionError> for ServiceError {
    fn from(value: ProgressionError) -> Self {
        ApiError::from(value).into()
    }
}

impl ServiceError {
    fn invalid(message: impl Into<String>) -> Self {
        ApiError::Invalid(message.into()).into()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/activities", post(activity_submit))
        .route("/v1/profiles/:user_id", get(profile_show))
        .route("/v1/profiles/:user_id/activities", get(profile_activities))
        .route("/v1/profiles/:user_id/adjustments", post(profile_adjust))
        .route("/v1/badges", get(badges))
        .route("/v1/leaderboard", get(leaderboard))
        .route("/v1/quizzes", post(quiz_register))
        .route("/v1/quizzes/score", post(quiz_score))
        .with_state(state)
}

fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log);

    let api = build_api(&args)?;
    api.migrate(false)?;

    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        db = %args.db.display(),
        max_submit_attempts = args.max_submit_attempts,
        "jornada service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn build_api(args: &Args) -> Result<ProgressionApi> {
    let rules = load_rules(args.rules.as_deref())?;
    Ok(ProgressionApi::new(args.db.clone(), rules)
        .with_max_submit_attempts(args.max_submit_attempts)
        .with_busy_timeout(Duration::from_millis(args.busy_timeout_ms)))
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

fn caller_id(headers: &HeaderMap) -> Result<UserId, ServiceError> {
    let Some(raw) = headers.get(USER_ID_HEADER) else {
        return Err(ServiceError::invalid(format!("missing {USER_ID_HEADER} header")));
    };
    let raw = raw
        .to_str()
        .map_err(|_| ServiceError::invalid(format!("{USER_ID_HEADER} header is not valid text")))?;
    Ok(UserId::parse(raw)?)
}

/// Split a submission body into its reference and typed payload. Metadata may
/// be omitted for activity types whose fields are all optional.
fn parse_claim(mut body: serde_json::Value) -> Result<ActivityClaim, ServiceError> {
    let Some(object) = body.as_object_mut() else {
        return Err(ServiceError::invalid("request body MUST be a JSON object"));
    };
    let activity_ref = match object.remove("activity_ref") {
        Some(serde_json::Value::String(value)) => value,
        Some(_) => return Err(ServiceError::invalid("activity_ref MUST be a string")),
        None => return Err(ServiceError::invalid("activity_ref MUST be provided")),
    };
    if object.get("metadata").map_or(true, serde_json::Value::is_null) {
        object.insert("metadata".to_string(), serde_json::json!({}));
    }

    let activity = ActivityPayload::from_json(body)?;
    Ok(ActivityClaim { activity_ref, activity })
}

async fn activity_submit(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ServiceEnvelope<AwardSummary>>, ServiceError> {
    let user_id = caller_id(&headers)?;
    let claim = parse_claim(body).inspect_err(|err| {
        tracing::debug!(user_id = %user_id, error = %err.error, "rejected activity claim");
    })?;
    let summary = state.api.submit_activity(&user_id, &claim)?;
    Ok(Json(envelope(summary)))
}

async fn profile_show(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ProfileView>>, ServiceError> {
    let user_id = UserId::parse(&user_id)?;
    let view = state.api.get_profile(&user_id)?;
    Ok(Json(envelope(view)))
}

async fn profile_activities(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<CreditedActivity>>>, ServiceError> {
    let user_id = UserId::parse(&user_id)?;
    let activities = state.api.list_activities(&user_id)?;
    Ok(Json(envelope(activities)))
}

async fn profile_adjust(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    Json(request): Json<AdjustPointsRequest>,
) -> Result<Json<ServiceEnvelope<PointAdjustment>>, ServiceError> {
    let user_id = UserId::parse(&user_id)?;
    let adjustment = state.api.adjust_points(&user_id, &request)?;
    Ok(Json(envelope(adjustment)))
}

async fn badges(State(state): State<ServiceState>) -> Json<ServiceEnvelope<Vec<BadgeDefinition>>> {
    Json(envelope(state.api.list_badges()))
}

async fn leaderboard(
    State(state): State<ServiceState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<ServiceEnvelope<Vec<LeaderboardEntry>>>, ServiceError> {
    let entries = state.api.leaderboard(query.limit)?;
    Ok(Json(envelope(entries)))
}

async fn quiz_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterQuizRequest>,
) -> Result<Json<ServiceEnvelope<RegisterQuizResult>>, ServiceError> {
    let result = state.api.register_quiz(&request)?;
    Ok(Json(envelope(result)))
}

async fn quiz_score(
    State(state): State<ServiceState>,
    Json(request): Json<ScoreQuizRequest>,
) -> Result<Json<ServiceEnvelope<QuizScore>>, ServiceError> {
    let score = state.api.score_quiz(&request)?;
    Ok(Json(envelope(score)))
}
