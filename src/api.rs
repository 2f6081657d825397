use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dispatch_common::{Job, JobId, QueueMetrics};
use serde_json::{Value, json};

use crate::board::BoardListMapping;
use crate::config::DispatchConfig;
use crate::errors::{IntakeError, QueueError, WorkspaceError};
use crate::events::EventBus;
use crate::webhook::{
    IntakeOutcome, SIGNATURE_HEADER, WebhookProcessor, WebhookRequest, verify_signature,
};
use crate::workspace::{QueueRegistry, Workspace, WorkspaceService, resolve_workspace};
use crate::ws;

/// Secret key looked up in a workspace `secrets` file.
pub const WEBHOOK_SECRET_KEY: &str = "WEBHOOK_SECRET";

const DELIVERY_HEADERS: &[&str] = &["x-delivery-id", "x-github-delivery"];
const EVENT_HEADERS: &[&str] = &["x-event-type", "x-github-event"];

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub config: DispatchConfig,
    pub workspaces: Arc<WorkspaceService>,
    pub queues: Arc<QueueRegistry>,
    pub events: EventBus,
    pub board: BoardListMapping,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

// Error bodies stay short; details only go to the log.

impl From<WorkspaceError> for ApiError {
    fn from(e: WorkspaceError) -> Self {
        match e {
            WorkspaceError::NotFound(_) | WorkspaceError::InvalidId(_) => {
                ApiError::NotFound("Workspace not found".into())
            }
            WorkspaceError::Queue(e) => e.into(),
            other => {
                tracing::error!(error = %other, "Workspace error");
                ApiError::Internal("Workspace error".into())
            }
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            e if e.is_fatal() => {
                tracing::error!(error = %e, "Queue unavailable");
                ApiError::Unavailable("Queue unavailable".into())
            }
            e => {
                tracing::error!(error = %e, "Queue error");
                ApiError::Internal("Queue error".into())
            }
        }
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        match e {
            IntakeError::Validation(e) => ApiError::BadRequest(e.to_string()),
            IntakeError::Queue(e) => e.into(),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// Routes under `X-Workspace-Id` resolution, plus the unscoped health check.
pub fn api_router(state: &SharedState) -> Router<SharedState> {
    let scoped = Router::new()
        .route("/webhooks/{source}", post(receive_webhook))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/metrics", get(get_metrics))
        .route("/ws", get(ws::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.workspaces.clone(),
            resolve_workspace,
        ));

    Router::new().route("/health", get(health)).merge(scoped)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

fn first_header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Workspace secret first, then the server-wide fallback.
fn webhook_secret(state: &AppState, workspace: &Workspace) -> Result<Option<String>, ApiError> {
    let secret = workspace.secret(WEBHOOK_SECRET_KEY).map_err(|e| {
        tracing::error!(workspace = %workspace.id, error = %e, "Failed to read workspace secrets");
        ApiError::Internal("Failed to read workspace secrets".into())
    })?;
    Ok(secret.or_else(|| state.config.server.webhook_secret.clone()))
}

async fn receive_webhook(
    State(state): State<SharedState>,
    Extension(workspace): Extension<Workspace>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(secret) = webhook_secret(&state, &workspace)? {
        let signature = first_header(&headers, &[SIGNATURE_HEADER]).unwrap_or_default();
        if !verify_signature(&secret, &body, &signature) {
            tracing::warn!(workspace = %workspace.id, source = %source, "Webhook signature rejected");
            return Err(ApiError::Unauthorized("Invalid signature".into()));
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))?;
    let request = WebhookRequest {
        event_type: first_header(&headers, EVENT_HEADERS).unwrap_or_else(|| source.clone()),
        delivery_id: first_header(&headers, DELIVERY_HEADERS),
        source,
        payload,
    };

    let queue = state.queues.get(&workspace).await?;
    let processor = WebhookProcessor::new(
        workspace.id.as_str(),
        queue,
        state.events.clone(),
        state.board.clone(),
    );
    let response = match processor.process(request).await? {
        IntakeOutcome::Enqueued(id) => {
            (StatusCode::ACCEPTED, Json(json!({"job_id": id}))).into_response()
        }
        IntakeOutcome::DuplicateIgnored => {
            (StatusCode::OK, Json(json!({"status": "duplicate"}))).into_response()
        }
        IntakeOutcome::Skipped { reason } => (
            StatusCode::OK,
            Json(json!({"status": "skipped", "reason": reason})),
        )
            .into_response(),
    };
    Ok(response)
}

async fn get_job(
    State(state): State<SharedState>,
    Extension(workspace): Extension<Workspace>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = JobId::from_str(&id).map_err(|_| ApiError::BadRequest("Invalid job id".into()))?;
    let queue = state.queues.get(&workspace).await?;
    queue
        .get_job(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))
}

async fn get_metrics(
    State(state): State<SharedState>,
    Extension(workspace): Extension<Workspace>,
) -> Result<Json<QueueMetrics>, ApiError> {
    let queue = state.queues.get(&workspace).await?;
    Ok(Json(queue.get_metrics().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, QueueProvider};
    use crate::server::build_router;
    use crate::webhook::sign;
    use crate::workspace::WORKSPACE_HEADER;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        _root: TempDir,
        state: SharedState,
    }

    async fn test_app(secret: Option<&str>) -> TestApp {
        let root = tempfile::tempdir().unwrap();
        let mut config = DispatchConfig::default();
        config.workspaces.root = root.path().to_path_buf();
        config.queue = QueueConfig {
            provider: QueueProvider::Sqlite,
            ..QueueConfig::default()
        };
        config.server.webhook_secret = secret.map(str::to_string);
        let workspaces = Arc::new(WorkspaceService::open(&config).unwrap());
        workspaces.bootstrap().await.unwrap();
        workspaces.provision("acme", None, None).await.unwrap();
        let state = Arc::new(AppState {
            queues: Arc::new(QueueRegistry::new(config.queue.clone())),
            board: BoardListMapping::from_config(&config.board),
            config,
            workspaces,
            events: EventBus::new(),
        });
        TestApp { _root: root, state }
    }

    fn github_issue() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "action": "opened",
            "issue": {"number": 7, "title": "Crash on start", "body": "stack trace"},
            "repository": {"full_name": "acme/widgets"}
        }))
        .unwrap()
    }

    fn webhook(workspace: Option<&str>, delivery: &str, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header("content-type", "application/json")
            .header("x-github-event", "issues")
            .header("x-github-delivery", delivery);
        if let Some(ws) = workspace {
            builder = builder.header(WORKSPACE_HEADER, ws);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(app.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(None).await;
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_webhook_enqueues_then_dedups() {
        let app = test_app(None).await;
        let (status, body) = send(&app, webhook(Some("acme"), "d1", github_issue())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, webhook(Some("acme"), "d1", github_issue())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "duplicate");

        let request = Request::builder()
            .uri(format!("/api/jobs/{}", job_id))
            .header(WORKSPACE_HEADER, "acme")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "PENDING");
        assert_eq!(body["delivery_id"], "d1");
    }

    #[tokio::test]
    async fn test_unknown_workspace_is_not_found() {
        let app = test_app(None).await;
        let (status, body) = send(&app, webhook(Some("globex"), "d1", github_issue())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Workspace not found");

        let (status, _) = send(&app, webhook(Some("../acme"), "d2", github_issue())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_jobs_are_not_visible_across_workspaces() {
        let app = test_app(None).await;
        let (_, body) = send(&app, webhook(Some("acme"), "d1", github_issue())).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let request = Request::builder()
            .uri(format!("/api/jobs/{}", job_id))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_delivery_id_is_bad_request() {
        let app = test_app(None).await;
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header("x-github-event", "issues")
            .body(Body::from(github_issue()))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("delivery id"));
    }

    #[tokio::test]
    async fn test_invalid_json_is_bad_request() {
        let app = test_app(None).await;
        let (status, _) = send(&app, webhook(None, "d1", b"{not json".to_vec())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_signature_is_enforced_when_secret_configured() {
        let app = test_app(Some("s3cret")).await;
        let (status, _) = send(&app, webhook(None, "d1", github_issue())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let body = github_issue();
        let mut request = webhook(None, "d1", body.clone());
        request
            .headers_mut()
            .insert(SIGNATURE_HEADER, sign("s3cret", &body).parse().unwrap());
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_ping_is_skipped() {
        let app = test_app(None).await;
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header("x-github-event", "ping")
            .header("x-github-delivery", "p1")
            .body(Body::from(r#"{"zen":"Keep it simple"}"#))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped");
    }

    #[tokio::test]
    async fn test_metrics_for_workspace() {
        let app = test_app(None).await;
        send(&app, webhook(Some("acme"), "d1", github_issue())).await;
        let request = Request::builder()
            .uri("/api/metrics")
            .header(WORKSPACE_HEADER, "acme")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue_size"], 1);
        assert_eq!(body["backend"], "sqlite");
    }

    #[test]
    fn test_queue_unavailable_maps_to_503() {
        let err: ApiError = QueueError::unavailable("redis", anyhow::anyhow!("refused")).into();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
