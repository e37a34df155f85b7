use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use traefik_lb_k8s::{
    BackendPublisher, Config, HealthState, KubePodSource, LogFormat, PodDiscoverer, Shutdown,
    coordinator, health,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        use_watch = config.use_watch,
        "Starting Traefik backend sync"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let publisher = Arc::new(
        BackendPublisher::new(config.publisher_config())
            .context("Failed to create Traefik client")?,
    );

    let discovery_config = config.discovery_config();
    let source = KubePodSource::new(client, &discovery_config);
    let namespace = source.namespace().to_string();

    let state = Arc::new(
        HealthState::new()
            .with_check(Arc::new(source.clone()))
            .with_check(publisher.clone())
            .with_publisher(publisher.clone()),
    );

    let listener = health::bind(config.health_check_port)
        .await
        .with_context(|| format!("Failed to bind health port {}", config.health_check_port))?;

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone()).context("Failed to setup signal handlers")?;

    let health_server = tokio::spawn(health::serve(state.clone(), listener, shutdown.clone()));

    let discovery = PodDiscoverer::new(source, discovery_config).start(&shutdown);

    state.set_ready(true);
    info!(
        namespace = %namespace,
        label_selector = %config.pod_labels,
        health_port = config.health_check_port,
        "Application ready"
    );

    coordinator::run(discovery, &publisher, &shutdown).await;

    state.set_ready(false);
    shutdown.trigger();

    match health_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server error"),
        Err(e) => error!(error = %e, "Health server task failed"),
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Triggers `shutdown` on the first SIGTERM or SIGINT.
fn spawn_signal_handler(shutdown: Shutdown) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
        }
        shutdown.trigger();
    });

    Ok(())
}
