//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness), `/readyz` (readiness) and `/metrics`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::k8s::{Error, KubePodSource};
use crate::shutdown::Shutdown;
use crate::traefik::BackendPublisher;

/// Default port for the health server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Time allowed for each readiness check.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// A dependency that must be reachable for the service to be ready.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Name reported in `/readyz`.
    fn name(&self) -> &'static str;

    /// Succeeds if the dependency is reachable.
    async fn check(&self) -> Result<(), Error>;
}

#[async_trait]
impl ReadinessCheck for KubePodSource {
    fn name(&self) -> &'static str {
        "kubernetes_api"
    }

    async fn check(&self) -> Result<(), Error> {
        self.probe().await
    }
}

#[async_trait]
impl ReadinessCheck for BackendPublisher {
    fn name(&self) -> &'static str {
        "traefik_api"
    }

    async fn check(&self) -> Result<(), Error> {
        Ok(self.health_check().await?)
    }
}

/// Shared state for health endpoints.
pub struct HealthState {
    ready: AtomicBool,
    started_at: Instant,
    checks: Vec<Arc<dyn ReadinessCheck>>,
    publisher: Option<Arc<BackendPublisher>>,
}

impl HealthState {
    /// Creates state with no checks, not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            started_at: Instant::now(),
            checks: Vec::new(),
            publisher: None,
        }
    }

    /// Adds a readiness check.
    #[must_use]
    pub fn with_check(mut self, check: Arc<dyn ReadinessCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Reports `publisher`'s circuit breaker in `/metrics`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<BackendPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Sets whether startup has completed.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        info!(ready, "Health check: readiness changed");
    }

    /// Returns `true` once startup has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the health endpoint router.
#[must_use]
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Binds the health listener on all interfaces.
///
/// # Errors
///
/// Returns the bind error.
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
}

/// Serves health endpoints on `listener` until `shutdown` fires.
///
/// # Errors
///
/// Returns a fatal server error.
pub async fn serve(
    state: Arc<HealthState>,
    listener: TcpListener,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Starting health check server");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Liveness probe. Always OK while the process runs.
async fn healthz() -> (StatusCode, Json<Value>) {
    debug!("Liveness probe: OK");
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "check": "liveness"})),
    )
}

/// Readiness probe.
///
/// Returns 503 before startup completes, or if any check fails.
async fn readyz(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    if !state.is_ready() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reason": "application not initialized"})),
        );
    }

    let results = join_all(state.checks.iter().map(|check| async move {
        let outcome = match timeout(READINESS_TIMEOUT, check.check()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {READINESS_TIMEOUT:?}")),
        };
        (check.name(), outcome)
    }))
    .await;

    let mut healthy = true;
    let mut checks = BTreeMap::new();

    for (name, outcome) in results {
        match outcome {
            Ok(()) => {
                checks.insert(name, "healthy".to_string());
            }
            Err(e) => {
                warn!(check = name, error = %e, "Readiness check failed");
                healthy = false;
                checks.insert(name, format!("unhealthy: {e}"));
            }
        }
    }

    if healthy {
        (StatusCode::OK, Json(json!({"status": "ok", "checks": checks})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "checks": checks})),
        )
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> Json<Value> {
    let circuit_breaker = state.publisher.as_ref().map(|p| p.breaker_stats());

    Json(json!({
        "ready": state.is_ready(),
        "checkers_count": state.checks.len(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "circuit_breaker": circuit_breaker,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traefik::PublisherConfig;

    struct FakeCheck {
        name: &'static str,
        result: Result<(), &'static str>,
        delay: Duration,
    }

    impl FakeCheck {
        fn healthy(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                result: Ok(()),
                delay: Duration::ZERO,
            })
        }

        fn failing(name: &'static str, error: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                result: Err(error),
                delay: Duration::ZERO,
            })
        }

        fn hanging(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                result: Ok(()),
                delay: Duration::from_secs(3600),
            })
        }
    }

    #[async_trait]
    impl ReadinessCheck for FakeCheck {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn check(&self) -> Result<(), Error> {
            tokio::time::sleep(self.delay).await;
            self.result.map_err(Error::from)
        }
    }

    fn ready_state(checks: Vec<Arc<FakeCheck>>) -> Arc<HealthState> {
        let state = checks
            .into_iter()
            .fold(HealthState::new(), |state, check| state.with_check(check));
        state.set_ready(true);
        Arc::new(state)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (status, Json(body)) = healthz().await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "check": "liveness"}));
    }

    #[tokio::test]
    async fn readyz_unavailable_before_ready() {
        let state = Arc::new(HealthState::new().with_check(FakeCheck::healthy("kubernetes_api")));

        let (status, Json(body)) = readyz(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["reason"], "application not initialized");
    }

    #[tokio::test]
    async fn readyz_ok_when_all_checks_pass() {
        let state = ready_state(vec![
            FakeCheck::healthy("kubernetes_api"),
            FakeCheck::healthy("traefik_api"),
        ]);

        let (status, Json(body)) = readyz(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "status": "ok",
                "checks": {"kubernetes_api": "healthy", "traefik_api": "healthy"}
            })
        );
    }

    #[tokio::test]
    async fn readyz_degraded_when_a_check_fails() {
        let state = ready_state(vec![
            FakeCheck::healthy("kubernetes_api"),
            FakeCheck::failing("traefik_api", "connection refused"),
        ]);

        let (status, Json(body)) = readyz(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"]["kubernetes_api"], "healthy");
        assert_eq!(body["checks"]["traefik_api"], "unhealthy: connection refused");
    }

    #[tokio::test(start_paused = true)]
    async fn readyz_times_out_slow_checks() {
        let state = ready_state(vec![FakeCheck::hanging("kubernetes_api")]);

        let (status, Json(body)) = readyz(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let message = body["checks"]["kubernetes_api"].as_str().unwrap();
        assert!(message.starts_with("unhealthy: timed out"));
    }

    #[tokio::test]
    async fn set_ready_toggles() {
        let state = HealthState::new();
        assert!(!state.is_ready());

        state.set_ready(true);
        state.set_ready(true);
        assert!(state.is_ready());

        state.set_ready(false);
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn metrics_reports_breaker() {
        let publisher =
            BackendPublisher::new(PublisherConfig::new("http://127.0.0.1:1/api/providers/rest"))
                .unwrap();

        let state = Arc::new(
            HealthState::new()
                .with_check(FakeCheck::healthy("traefik_api"))
                .with_publisher(Arc::new(publisher)),
        );

        let Json(body) = metrics(State(state)).await;

        assert_eq!(body["ready"], false);
        assert_eq!(body["checkers_count"], 1);
        assert!(body["uptime_seconds"].is_u64());
        assert_eq!(body["circuit_breaker"]["state"], "closed");
        assert_eq!(body["circuit_breaker"]["requests"], 0);
    }

    #[tokio::test]
    async fn metrics_without_publisher() {
        let Json(body) = metrics(State(Arc::new(HealthState::new()))).await;

        assert!(body["circuit_breaker"].is_null());
        assert_eq!(body["checkers_count"], 0);
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let state = ready_state(vec![FakeCheck::healthy("kubernetes_api")]);
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = Shutdown::new();
        let server = tokio::spawn(serve(state, listener, shutdown.clone()));

        let client = reqwest::Client::new();
        let live = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(live.status(), reqwest::StatusCode::OK);

        let ready: Value = client
            .get(format!("http://{addr}/readyz"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ready["checks"]["kubernetes_api"], "healthy");

        drop(client);
        shutdown.trigger();
        timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop on shutdown")
            .unwrap()
            .unwrap();
    }
}
