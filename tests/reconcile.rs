//! End-to-end reconciliation: pods in, Traefik configuration out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::routing::any;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use traefik_lb_k8s::{
    BackendPublisher, BreakerConfig, DiscoveryConfig, PodDiscoverer, PodEvent, PodEventStream,
    PodSource, PublisherConfig, RouteSettings, Shutdown, State as BreakerState, coordinator,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pods are whatever the test last set; one watch session is handed out.
#[derive(Clone, Default)]
struct Cluster {
    pods: Arc<Mutex<Vec<Pod>>>,
    events: Arc<Mutex<Option<PodEventStream>>>,
}

impl Cluster {
    fn with_watch() -> (Self, UnboundedSender<Result<PodEvent, BoxError>>) {
        let (tx, rx) = unbounded();
        let cluster = Self::default();
        *cluster.events.lock().unwrap() = Some(rx.boxed());
        (cluster, tx)
    }

    fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }
}

#[async_trait]
impl PodSource for Cluster {
    async fn list(&self) -> Result<Vec<Pod>, BoxError> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn watch(&self) -> Result<PodEventStream, BoxError> {
        let events = self.events.lock().unwrap().take();
        Ok(events.unwrap_or_else(|| futures::stream::pending().boxed()))
    }
}

fn pod(phase: &str, ip: &str) -> Pod {
    Pod {
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Default)]
struct Traefik {
    status: AtomicU16,
    documents: Mutex<Vec<Value>>,
}

async fn provider(
    State(traefik): State<Arc<Traefik>>,
    method: Method,
    body: Bytes,
) -> StatusCode {
    if method == Method::PUT {
        let document = serde_json::from_slice(&body).unwrap_or(Value::Null);
        traefik.documents.lock().unwrap().push(document);
    }

    StatusCode::from_u16(traefik.status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn start_traefik(status: u16) -> (Arc<Traefik>, String) {
    let traefik = Arc::new(Traefik::default());
    traefik.status.store(status, Ordering::SeqCst);

    let app = Router::new()
        .route("/api/providers/rest", any(provider))
        .with_state(traefik.clone());

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    (traefik, format!("http://{addr}/api/providers/rest"))
}

fn documents(traefik: &Traefik) -> Vec<Value> {
    traefik.documents.lock().unwrap().clone()
}

async fn wait_for_documents(traefik: &Traefik, count: usize) -> Vec<Value> {
    timeout(Duration::from_secs(5), async {
        loop {
            let seen = documents(traefik);
            if seen.len() >= count {
                return seen;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {count} documents, got {:?}", documents(traefik)))
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !done() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn expected(addresses: &[&str]) -> Value {
    let servers: Vec<Value> = addresses.iter().map(|a| json!({"address": a})).collect();

    json!({
        "tcp": {
            "routers": {
                "relay-router": {
                    "entryPoints": ["tcp"],
                    "rule": "HostSNI(`*`)",
                    "service": "relay-service"
                }
            },
            "services": {
                "relay-service": {
                    "loadBalancer": {"method": "leastconn", "servers": servers}
                }
            }
        }
    })
}

#[tokio::test]
async fn watch_pipeline_publishes_running_pods() {
    let (traefik, url) = start_traefik(200).await;
    let publisher = Arc::new(BackendPublisher::new(PublisherConfig::new(url)).unwrap());

    let (cluster, events) = Cluster::with_watch();
    cluster.set_pods(vec![pod("Running", "10.0.0.1"), pod("Pending", "10.0.0.2")]);

    let shutdown = Shutdown::new();
    let discovery = PodDiscoverer::new(
        cluster.clone(),
        DiscoveryConfig::new("app=relay", 3333_u16).namespace("relay"),
    )
    .start(&shutdown);

    let running = publisher.clone();
    let stop = shutdown.clone();
    let task = tokio::spawn(async move { coordinator::run(discovery, &running, &stop).await });

    let seen = wait_for_documents(&traefik, 1).await;
    assert_eq!(seen[0], expected(&["10.0.0.1:3333"]));

    // A pod starts running.
    cluster.set_pods(vec![
        pod("Running", "10.0.0.1"),
        pod("Pending", "10.0.0.2"),
        pod("Running", "10.0.0.3"),
    ]);
    events.unbounded_send(Ok(PodEvent::Added)).unwrap();

    let seen = wait_for_documents(&traefik, 2).await;
    assert_eq!(seen[1], expected(&["10.0.0.1:3333", "10.0.0.3:3333"]));

    // Status-only churn does not republish.
    events.unbounded_send(Ok(PodEvent::Modified)).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(documents(&traefik).len(), 2);

    // Every pod goes away.
    cluster.set_pods(Vec::new());
    events.unbounded_send(Ok(PodEvent::Deleted)).unwrap();

    let seen = wait_for_documents(&traefik, 3).await;
    assert_eq!(seen[2], expected(&[]));
    wait_until(|| publisher.breaker_stats().total_successes == 3).await;

    shutdown.trigger();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn polling_pipeline_uses_custom_route() {
    let (traefik, url) = start_traefik(201).await;
    let route = RouteSettings {
        router_name: "edge".to_string(),
        service_name: "pool".to_string(),
        lb_method: "wrr".to_string(),
    };
    let publisher = BackendPublisher::new(PublisherConfig::new(url).route(route)).unwrap();

    let cluster = Cluster::default();
    cluster.set_pods(vec![pod("Running", "10.1.0.2"), pod("Running", "10.1.0.1")]);

    let shutdown = Shutdown::new();
    let discovery = PodDiscoverer::new(
        cluster,
        DiscoveryConfig::new("app=relay", 7000_u16).poll(Duration::from_millis(20)),
    )
    .start(&shutdown);

    let stop = shutdown.clone();
    let task = tokio::spawn(async move { coordinator::run(discovery, &publisher, &stop).await });

    let seen = wait_for_documents(&traefik, 1).await;
    let document = &seen[0]["tcp"];
    assert_eq!(document["routers"]["edge"]["service"], "pool");
    assert_eq!(document["services"]["pool"]["loadBalancer"]["method"], "wrr");
    assert_eq!(
        document["services"]["pool"]["loadBalancer"]["servers"],
        json!([{"address": "10.1.0.1:7000"}, {"address": "10.1.0.2:7000"}])
    );

    // Several more ticks with no change.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(documents(&traefik).len(), 1);

    shutdown.trigger();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_traefik_opens_breaker_and_recovers() {
    let (traefik, url) = start_traefik(503).await;
    let breaker = BreakerConfig {
        max_half_open_requests: 1,
        closed_window_interval: Duration::from_secs(60),
        open_timeout: Duration::from_millis(200),
        consecutive_failure_threshold: 2,
    };
    let publisher = Arc::new(BackendPublisher::new(PublisherConfig::new(url).breaker(breaker)).unwrap());

    let (cluster, events) = Cluster::with_watch();
    cluster.set_pods(vec![pod("Running", "10.0.0.1")]);

    let shutdown = Shutdown::new();
    let discovery =
        PodDiscoverer::new(cluster.clone(), DiscoveryConfig::new("app=relay", 3333_u16))
            .start(&shutdown);

    let running = publisher.clone();
    let stop = shutdown.clone();
    let task = tokio::spawn(async move { coordinator::run(discovery, &running, &stop).await });

    wait_for_documents(&traefik, 1).await;

    cluster.set_pods(vec![pod("Running", "10.0.0.1"), pod("Running", "10.0.0.2")]);
    events.unbounded_send(Ok(PodEvent::Added)).unwrap();
    wait_for_documents(&traefik, 2).await;

    wait_until(|| publisher.breaker_state() == BreakerState::Open).await;

    // Rejected while open; Traefik sees nothing.
    cluster.set_pods(vec![pod("Running", "10.0.0.2")]);
    events.unbounded_send(Ok(PodEvent::Deleted)).unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(documents(&traefik).len(), 2);

    // Traefik recovers; the next change after the open timeout goes through.
    traefik.status.store(200, Ordering::SeqCst);
    sleep(Duration::from_millis(250)).await;
    cluster.set_pods(vec![pod("Running", "10.0.0.3")]);
    events.unbounded_send(Ok(PodEvent::Added)).unwrap();

    let seen = wait_for_documents(&traefik, 3).await;
    assert_eq!(seen[2], expected(&["10.0.0.3:3333"]));
    wait_until(|| publisher.breaker_state() == BreakerState::Closed).await;

    shutdown.trigger();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}
