//! Feeds discovered backend sets to the publisher.

use crate::k8s::{BackendSet, Discovery, DiscoveryError};
use crate::shutdown::Shutdown;
use crate::traefik::BackendPublisher;

/// Publishes every emitted backend set until `shutdown` fires or discovery
/// stops.
///
/// Publish failures and discovery errors are logged and never end the loop;
/// the next change is the retry. On return, discovery has been stopped and
/// its task joined.
pub async fn run(discovery: Discovery, publisher: &BackendPublisher, shutdown: &Shutdown) {
    let Discovery {
        mut backends,
        mut errors,
        handle,
    } = discovery;

    let mut errors_open = true;

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                tracing::info!("Shutting down");
                break;
            }

            backends = backends.recv() => match backends {
                Some(backends) => publish(publisher, &backends).await,
                None => {
                    tracing::info!("Backend stream closed");
                    break;
                }
            },

            error = errors.recv(), if errors_open => match error {
                Some(e) => log_discovery_error(&e),
                None => errors_open = false,
            },
        }
    }

    handle.close();
    handle.stopped().await;
}

async fn publish(publisher: &BackendPublisher, backends: &BackendSet) {
    tracing::info!(backend_count = backends.len(), "Received backend update");

    if let Err(e) = publisher.update_backends(backends).await {
        tracing::error!(
            error = %e,
            circuit_breaker_state = %publisher.breaker_state(),
            rejected = e.is_rejection(),
            "Failed to update Traefik backends"
        );
    }
}

fn log_discovery_error(e: &DiscoveryError) {
    tracing::error!(error = %e, "Pod watcher error");
}
