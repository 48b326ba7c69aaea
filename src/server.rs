//! Status HTTP endpoint
//!
//! `GET /health` and `GET /status` report scheduler state. Every request goes
//! through the fixed-window [`RateLimiter`], keyed by client address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::clock::elapsed_between;
use crate::config::{RateLimitConfig, ServerConfig};
use crate::failsafe::{RateLimitDecision, RateLimiter};
use crate::scheduler::{LockRecord, RunningJobInfo, Scheduler, ShutdownCoordinator, ShutdownPhase};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Scheduler being reported on
    pub scheduler: Arc<Scheduler>,
    /// Shutdown coordinator, for the current phase
    pub coordinator: Arc<ShutdownCoordinator>,
    /// Inbound request limiter
    pub limiter: Arc<RateLimiter>,
    /// Requests allowed per window
    pub limit: u32,
    /// Window length
    pub window: Duration,
    /// How often expired limiter entries are evicted
    pub cleanup_interval: Duration,
}

impl AppState {
    /// Build state with a fresh limiter from `rate_limit`
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>, coordinator: Arc<ShutdownCoordinator>, rate_limit: &RateLimitConfig) -> Self {
        Self {
            scheduler,
            coordinator,
            limiter: Arc::new(RateLimiter::new()),
            limit: rate_limit.limit,
            window: rate_limit.window,
            cleanup_interval: rate_limit.cleanup_interval,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskStatus {
    name: String,
    schedule: String,
    #[serde(with = "crate::config::humantime_serde")]
    timeout: Duration,
    next_run: Option<DateTime<Utc>>,
    running: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    phase: ShutdownPhase,
    suppressed: bool,
    tasks: Vec<TaskStatus>,
    running: Vec<RunningJobInfo>,
    locks: Vec<LockRecord>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve(config: &ServerConfig, state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("Cannot bind status server to {addr}: {e}")))?;
    info!(addr = %addr, "Status server listening");

    let cleanup = state.limiter.spawn_cleanup(state.cleanup_interval, cancel.clone());

    let app = create_router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    cleanup.abort();
    info!("Status server stopped");
    Ok(())
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let phase = state.coordinator.phase();
    let status = if phase == ShutdownPhase::Idle {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "healthy" } else { "shutting-down" },
            "version": env!("CARGO_PKG_VERSION"),
            "phase": phase,
        })),
    )
}

/// GET /status
async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let supervisor = state.scheduler.supervisor();
    let locks = match supervisor.locks().list() {
        Ok(locks) => locks,
        Err(e) => {
            warn!(error = %e, "Failed to list locks");
            Vec::new()
        }
    };
    let tasks = state
        .scheduler
        .next_fire_times()
        .into_iter()
        .map(|(task, next_run)| TaskStatus {
            running: supervisor.is_running(&task.name),
            name: task.name,
            schedule: task.schedule,
            timeout: task.timeout,
            next_run,
        })
        .collect();

    Json(StatusResponse {
        phase: state.coordinator.phase(),
        suppressed: state.scheduler.is_suppressed(),
        tasks,
        running: supervisor.running_jobs(),
        locks,
    })
    .into_response()
}

/// Reject callers over their quota with 429 and `Retry-After`
async fn rate_limit_middleware(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_id(request.headers(), peer);
    let decision = state.limiter.check(&client, state.limit, state.window);

    if !decision.allowed {
        warn!(client = %client, reset_at = %decision.reset_at, "Rate limit exceeded");
        let wait = elapsed_between(Utc::now(), decision.reset_at);
        let retry_after = (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Too many requests" })),
        )
            .into_response();
        insert_rate_headers(response.headers_mut(), state.limit, &decision);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    let mut response = next.run(request).await;
    insert_rate_headers(response.headers_mut(), state.limit, &decision);
    response
}

fn insert_rate_headers(headers: &mut HeaderMap, limit: u32, decision: &RateLimitDecision) {
    headers.insert(HeaderName::from_static("x-ratelimit-limit"), HeaderValue::from(limit));
    headers.insert(HeaderName::from_static("x-ratelimit-remaining"), HeaderValue::from(decision.remaining));
    headers.insert(HeaderName::from_static("x-ratelimit-reset"), HeaderValue::from(decision.reset_at.timestamp()));
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address
fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(String::from)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::scheduler::supervisor::tests::{FakeLauncher, lock_manager};
    use crate::scheduler::{ScheduledTask, ShutdownTrigger, Supervisor};
    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use serde_json::Value;
    use tower::ServiceExt;

    fn state(limit: u32) -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(Supervisor::new(lock_manager(dir.path()), FakeLauncher::with(&[])));
        let scheduler = Arc::new(Scheduler::new(supervisor, clock::system()));
        scheduler
            .register_task(ScheduledTask {
                name: "nightly-report".into(),
                schedule: "0 2 * * *".into(),
                timeout: Duration::from_secs(600),
            })
            .unwrap();
        let coordinator = Arc::new(ShutdownCoordinator::new(Arc::clone(&scheduler), Duration::from_secs(1)));
        let rate_limit = RateLimitConfig {
            limit,
            window: Duration::from_secs(60),
            ..RateLimitConfig::default()
        };
        (dir, Arc::new(AppState::new(scheduler, coordinator, &rate_limit)))
    }

    fn get(uri: &str, client: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (_dir, state) = state(100);
        let app = create_router(state);

        let response = app.clone().oneshot(get("/health", "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "100");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "99");
        assert_eq!(body_json(response).await["status"], "healthy");

        let response = app.oneshot(get("/status", "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["tasks"][0]["name"], "nightly-report");
        assert_eq!(body["tasks"][0]["running"], false);
        assert!(body["tasks"][0]["nextRun"].is_string());
    }

    #[tokio::test]
    async fn test_rate_limited_per_client() {
        let (_dir, state) = state(2);
        let app = create_router(state);

        for _ in 0..2 {
            let response = app.clone().oneshot(get("/health", "10.0.0.1, 172.16.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(get("/health", "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        let retry_after: u64 = response.headers()[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry_after));

        let response = app.oneshot(get("/health", "10.0.0.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_shutdown() {
        let (_dir, state) = state(100);
        state.coordinator.shutdown(ShutdownTrigger::Requested).await.unwrap();
        let response = create_router(state).oneshot(get("/health", "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["phase"], "exited");
    }

    #[test]
    fn test_client_id_fallbacks() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.9:5555".parse().unwrap();
        assert_eq!(client_id(&headers, Some(peer)), "192.168.1.9");
        assert_eq!(client_id(&headers, None), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_id(&headers, Some(peer)), "203.0.113.7");

        headers.insert("x-forwarded-for", HeaderValue::from_static(" 198.51.100.1 , 10.0.0.1"));
        assert_eq!(client_id(&headers, Some(peer)), "198.51.100.1");
    }
}
