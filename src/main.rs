mod directory;
mod error;
mod http;
mod idempotency;
mod jobs;
mod metrics;
mod models;
mod publication;
mod publisher;
mod resilience;
mod security;
mod store;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use directory::DirectoryConfig;
use error::ErrorCode;
use idempotency::IdempotencyCache;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, Listing, ListingDraft, ListingStatus, PublishAccepted, UploadAttempt};
use once_cell::sync::Lazy;
use publication::{ProcessError, PublicationReport, PublicationService};
use publisher::{ListingPublisher, PublisherBreakers, reviewers::ReviewerRules};
use resilience::BreakerSnapshot;
use security::{AgentContext, AuthState, require_api_auth};
use serde_json::json;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use store::{MemoryStore, StoreError};
use thiserror::Error;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

static METRICS_KEY: Lazy<Option<String>> = Lazy::new(|| {
    std::env::var("METRICS_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
});

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "realty.api", error = %err, "server_crashed");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Arc::new(DirectoryConfig::from_env());
    let reviewers = ReviewerRules::load(
        std::env::var("REVIEWER_RULES_PATH")
            .ok()
            .map(PathBuf::from)
            .as_deref(),
        &config.defaults.reviewer_id,
    );
    let http_settings = http::HttpSettings::from_env();
    let breakers = PublisherBreakers::from_env();
    for breaker in breakers.all() {
        let _watcher = metrics::watch_breaker(breaker);
        if breaker.config().timeout >= http_settings.timeout {
            warn!(
                target = "realty.api",
                breaker = breaker.name(),
                breaker_timeout_ms = breaker.config().timeout.as_millis() as u64,
                http_timeout_ms = http_settings.timeout.as_millis() as u64,
                "breaker_timeout_not_below_http_timeout"
            );
        }
    }
    let publisher =
        ListingPublisher::new(config.clone(), http_settings.client(), breakers, reviewers);
    if config.credentials().is_none() {
        warn!(
            target = "realty.api",
            "directory credentials missing; publishes will fail with CONFIG_ERROR"
        );
    }
    let service = PublicationService::new(Arc::new(MemoryStore::new()), Arc::new(publisher));
    let (queue, _worker) = jobs::JobQueue::spawn(service.clone());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre::eyre!("prometheus recorder: {err}"))?;

    let state = AppState {
        service,
        queue,
        idempotency: IdempotencyCache::from_env(),
        prometheus_handle,
    };
    let app = router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "realty.api", %addr, directory = %config.base_url, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    service: PublicationService,
    queue: jobs::JobQueue,
    idempotency: IdempotencyCache,
    prometheus_handle: PrometheusHandle,
}

fn router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/breakers", get(list_breakers))
        .route("/breakers/{name}/reset", post(reset_breaker))
        .route("/listings", post(create_listing))
        .route("/listings/{id}", get(get_listing))
        .route("/listings/{id}/attempts", get(list_attempts))
        .route("/listings/{id}/publish", post(publish_listing))
        .route("/listings/{id}/publish/wait", post(publish_listing_wait))
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Liveness check. No auth.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "realty-publisher-rs",
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = METRICS_KEY.as_deref() {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Rolling counts and state of every upstream breaker.
async fn list_breakers(State(state): State<AppState>) -> Json<Vec<BreakerSnapshot>> {
    crate::metrics::inc_requests("/breakers");
    Json(state.service.publisher().breakers().snapshots())
}

async fn reset_breaker(
    State(state): State<AppState>,
    Extension(context): Extension<AgentContext>,
    Path(name): Path<String>,
) -> Result<Json<BreakerSnapshot>, AppError> {
    crate::metrics::inc_requests("/breakers/reset");
    let breakers = state.service.publisher().breakers();
    let Some(breaker) = breakers.find(&name) else {
        return Err(AppError::NotFound(format!("no breaker named `{name}`")));
    };
    warn!(
        target = "realty.api",
        breaker = breaker.name(),
        agent_id = %context.agent_id,
        "breaker_manual_reset"
    );
    breaker.reset();
    Ok(Json(breaker.snapshot()))
}

/// Stores a new draft listing.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Auth: `Authorization: Bearer <key>` or `X-Agency-Key: <key>`
/// - Body: `ListingDraft`; numeric fields accept numbers or numeric strings
/// - Response: `201` with the stored `Listing`
async fn create_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AgentContext>,
    Json(draft): Json<ListingDraft>,
) -> Result<(StatusCode, Json<Listing>), AppError> {
    crate::metrics::inc_requests("/listings");
    if draft.title.trim().is_empty() {
        return Err(AppError::BadRequest("title must not be empty".into()));
    }
    let listing = Listing::from_draft(draft, Some(&context.agent_id));
    let stored = state.service.store().create_listing(listing).await?;
    info!(
        target = "realty.api",
        listing_id = %stored.id,
        agent_id = %context.agent_id,
        key_id = %context.key_id,
        kind = stored.kind.bundle(),
        "listing_created"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_listing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}");
    let id = parse_id(&id)?;
    Ok(Json(state.service.store().listing(id).await?))
}

async fn list_attempts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<UploadAttempt>>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/attempts");
    let id = parse_id(&id)?;
    Ok(Json(state.service.store().attempts(id).await?))
}

/// Queues a listing for background publishing.
///
/// - Method: `POST`
/// - Path: `/listings/{id}/publish`
/// - Headers: optional `Idempotency-Key`; a replay returns the first answer
/// - Response: `202` with `{listing_id, status, job_id}`
async fn publish_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AgentContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<PublishAccepted>), AppError> {
    crate::metrics::inc_requests("/listings/{id}/publish");
    let id = parse_id(&id)?;
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|key| IdempotencyCache::scoped_key(&context.agent_id, &id, key));

    if let Some(key) = &idempotency_key
        && let Some(existing) = state.idempotency.get(key).await
    {
        info!(target = "realty.api", listing_id = %id, "publish_replayed");
        return Ok((StatusCode::ACCEPTED, Json(existing)));
    }

    let listing = state.service.enqueue(id).await?;
    let job_id = state.queue.enqueue_publish(id, context).await;
    let accepted = PublishAccepted {
        listing_id: id,
        status: listing.status,
        job_id,
    };
    if let Some(key) = &idempotency_key {
        state.idempotency.put(key, &accepted).await;
    }
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Publishes inline and returns the run's report; failures keep their code.
async fn publish_listing_wait(
    State(state): State<AppState>,
    Extension(context): Extension<AgentContext>,
    Path(id): Path<String>,
) -> Result<Json<PublicationReport>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/publish/wait");
    let id = parse_id(&id)?;
    info!(
        target = "realty.api",
        listing_id = %id,
        agent_id = %context.agent_id,
        "publish_inline_requested"
    );
    let report = state.service.publish_now(id).await?;
    match (report.status, report.error_code) {
        (ListingStatus::Failed, Some(code)) => Err(AppError::Publish {
            code,
            listing_id: id,
            attempt: report.attempt_number,
        }),
        _ => Ok(Json(report)),
    }
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let id = parse_id(&id)?;
    state
        .queue
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest(format!("`{raw}` is not a valid id")))
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("publish of {listing_id} failed on attempt {attempt} with {}", .code.as_str())]
    Publish {
        code: ErrorCode,
        listing_id: Uuid,
        attempt: u32,
    },
}

impl From<ProcessError> for AppError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Store(err) => AppError::Store(err),
            other => AppError::Unavailable(other.to_string()),
        }
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) | AppError::Store(StoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            AppError::Store(_) => StatusCode::CONFLICT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Publish { code, .. } => match code {
                ErrorCode::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorCode::NetworkError => StatusCode::BAD_GATEWAY,
                ErrorCode::ConfigError | ErrorCode::OauthError => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) | AppError::Store(StoreError::NotFound(_)) => "not_found",
            AppError::Store(_) => "conflict",
            AppError::Unavailable(_) => "unavailable",
            AppError::Publish { code, .. } => code.as_str(),
        }
    }

    fn public_detail(&self) -> String {
        match self {
            AppError::Publish { code, .. } => match code {
                ErrorCode::CircuitOpen => {
                    "The listing directory is temporarily unavailable, retry later.".to_string()
                }
                ErrorCode::Timeout | ErrorCode::NetworkError => {
                    "The listing directory could not be reached, please retry.".to_string()
                }
                ErrorCode::ValidationError => {
                    "The listing directory rejected this listing; see its attempts.".to_string()
                }
                ErrorCode::ConfigError | ErrorCode::OauthError => {
                    "Publishing is not configured correctly; please contact support.".to_string()
                }
            },
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4().to_string();
        let status = self.status();
        if status.is_server_error() {
            error!(target = "realty.api", %correlation_id, error = %self, "request_failed");
        } else {
            warn!(target = "realty.api", %correlation_id, error = %self, "request_rejected");
        }
        let payload = ApiError {
            error: self.code().to_string(),
            detail: Some(self.public_detail()),
            correlation_id: Some(correlation_id),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ListingKind;
    use crate::testing::{fast_breakers, mount_token, publisher_for, sample_listing};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "secret-key";

    fn app_for(server: &MockServer) -> (Router, PublicationService) {
        let service = PublicationService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(publisher_for(server, fast_breakers())),
        );
        let (queue, _worker) = jobs::JobQueue::spawn(service.clone());
        let state = AppState {
            service: service.clone(),
            queue,
            idempotency: IdempotencyCache::in_memory(),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        (router(state, AuthState::from_list(&format!("maria:{KEY}"))), service)
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-Agency-Key", KEY)
            .header("content-type", "application/json");
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        builder.body(body).expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn health_is_public() {
        let server = MockServer::start().await;
        let (app, _) = app_for(&server);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("req"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_routes_need_a_key() {
        let server = MockServer::start().await;
        let (app, _) = app_for(&server);
        let response = app
            .oneshot(Request::builder().uri("/breakers").body(Body::empty()).expect("req"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_listing_uses_agent_as_submitter() {
        let server = MockServer::start().await;
        let (app, _) = app_for(&server);
        let response = app
            .oneshot(request(
                "POST",
                "/listings",
                Some(json!({"kind": "property", "title": "Flat", "price": "120000"})),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["status"], json!("draft"));
        assert_eq!(body["submitter"], json!("maria"));
        assert_eq!(body["price"], json!(120000.0));
    }

    #[tokio::test]
    async fn publish_replay_returns_same_job() {
        let server = MockServer::start().await;
        let (app, service) = app_for(&server);
        let id = service
            .store()
            .create_listing(sample_listing(ListingKind::Property))
            .await
            .expect("seeded")
            .id;

        let publish = || {
            let mut req = request("POST", &format!("/listings/{id}/publish"), None);
            req.headers_mut()
                .insert("Idempotency-Key", "abc".parse().expect("header"));
            req
        };
        let first = app.clone().oneshot(publish()).await.expect("first");
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let first = json_body(first).await;
        let second = app.oneshot(publish()).await.expect("second");
        assert_eq!(second.status(), StatusCode::ACCEPTED);
        let second = json_body(second).await;
        assert_eq!(first["job_id"], second["job_id"]);
        assert_eq!(first["status"], json!("queued"));
    }

    #[tokio::test]
    async fn open_circuit_maps_to_503_with_correlation_id() {
        let server = MockServer::start().await;
        mount_token(&server, "tok", 1).await;
        Mock::given(method("POST"))
            .and(path("/jsonapi/node/property"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (app, service) = app_for(&server);

        let mut last = None;
        for _ in 0..6 {
            let id = service
                .store()
                .create_listing(sample_listing(ListingKind::Property))
                .await
                .expect("seeded")
                .id;
            let response = app
                .clone()
                .oneshot(request("POST", &format!("/listings/{id}/publish/wait"), None))
                .await
                .expect("response");
            last = Some(response);
        }
        let response = last.expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["error"], json!("CIRCUIT_OPEN"));
        assert!(body["correlation_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn unknown_listing_is_404_and_bad_id_is_400() {
        let server = MockServer::start().await;
        let (app, _) = app_for(&server);
        let missing = app
            .clone()
            .oneshot(request("GET", &format!("/listings/{}", Uuid::new_v4()), None))
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let bad = app
            .oneshot(request("GET", "/listings/not-a-uuid", None))
            .await
            .expect("response");
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn breaker_reset_by_name() {
        let server = MockServer::start().await;
        let (app, _) = app_for(&server);
        let ok = app
            .clone()
            .oneshot(request("POST", "/breakers/land_create/reset", None))
            .await
            .expect("response");
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["state"], json!("closed"));
        let missing = app
            .oneshot(request("POST", "/breakers/nope/reset", None))
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
