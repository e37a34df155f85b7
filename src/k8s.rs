//! Kubernetes pod discovery.
//!
//! This module lists pods matching a label selector and turns the running ones
//! into a [`BackendSet`]. A set is emitted only when it differs from the
//! previously emitted one.
//!
//! # How It Works
//!
//! 1. Either watches pods for the selector, or polls on a fixed interval
//! 2. On every watch event or tick, re-lists all matching pods
//! 3. Keeps pods in the `Running` phase that have a pod IP
//! 4. Compares the resulting set against the last one and emits on change
//!
//! Every watch event triggers a full re-list instead of applying the event
//! payload, so duplicate or out-of-order events cannot make the set drift.
//!
//! # Example
//!
//! ```ignore
//! use traefik_lb_k8s::{DiscoveryConfig, KubePodSource, PodDiscoverer, Shutdown};
//!
//! let client = kube::Client::try_default().await?;
//! let config = DiscoveryConfig::new("app=relay", 3333_u16).namespace("relay");
//! let source = KubePodSource::new(client, &config);
//!
//! let shutdown = Shutdown::new();
//! let mut discovery = PodDiscoverer::new(source, config).start(&shutdown);
//!
//! while let Some(backends) = discovery.backends.recv().await {
//!     println!("{} backends", backends.len());
//! }
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Client};
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};

use crate::shutdown::Shutdown;

/// Error type for pod source failures.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pod source operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Default delay before re-subscribing after a watch failure.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Shortest accepted polling interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default capacity of the backend and error queues.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

const POD_RUNNING: &str = "Running";

/// Port specification for the backends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Port {
    /// A numeric port number.
    Number(u16),
    /// A named container port, resolved per pod.
    Name(String),
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// How pod changes are detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Subscribe to pod events and re-list on each one.
    Watch,
    /// Re-list on a fixed interval.
    Poll(Duration),
}

/// A `host:port` backend address, compared byte for byte.
pub type BackendAddress = String;

/// A sorted, deduplicated set of `host:port` backend addresses.
///
/// Sorting only makes comparisons between successive sets independent of
/// listing order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendSet(BTreeSet<BackendAddress>);

impl BackendSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no backends.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if `address` is in the set.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.0.contains(address)
    }

    /// Iterates addresses in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromIterator<String> for BackendSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for BackendSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Pod change notification.
///
/// The payload is not needed, since every change triggers a full re-list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodEvent {
    /// A pod was added.
    Added,
    /// A pod was modified.
    Modified,
    /// A pod was deleted.
    Deleted,
    /// Resource version checkpoint.
    Bookmark,
    /// The API server reported an error on the stream.
    Error(String),
}

/// Stream of pod events for one watch session.
pub type PodEventStream = BoxStream<'static, Result<PodEvent>>;

/// Source of pods matching a fixed selector.
#[async_trait]
pub trait PodSource: Send + Sync + 'static {
    /// Lists all matching pods.
    async fn list(&self) -> Result<Vec<Pod>>;

    /// Opens a watch session. The stream ends when the session does.
    async fn watch(&self) -> Result<PodEventStream>;
}

/// [`PodSource`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePodSource {
    pods: Api<Pod>,
    namespace: String,
    label_selector: String,
}

impl KubePodSource {
    /// Creates a source for the namespace and label selector in `config`.
    ///
    /// Without an explicit namespace, uses the current namespace from the
    /// kube client configuration.
    #[must_use]
    pub fn new(client: Client, config: &DiscoveryConfig) -> Self {
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());

        Self {
            pods: Api::namespaced(client, &namespace),
            namespace,
            label_selector: config.label_selector.clone(),
        }
    }

    /// Namespace the pods are listed in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Checks API connectivity with a minimal list call.
    ///
    /// # Errors
    ///
    /// Returns the Kubernetes API error.
    pub async fn probe(&self) -> Result<()> {
        let params = ListParams::default()
            .labels(&self.label_selector)
            .limit(1);
        self.pods.list(&params).await?;
        Ok(())
    }
}

#[async_trait]
impl PodSource for KubePodSource {
    async fn list(&self) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&self.label_selector);
        Ok(self.pods.list(&params).await?.items)
    }

    async fn watch(&self) -> Result<PodEventStream> {
        let params = WatchParams::default().labels(&self.label_selector);
        let stream = self.pods.watch(&params, "0").await?;

        Ok(stream
            .map_ok(|event| match event {
                WatchEvent::Added(_) => PodEvent::Added,
                WatchEvent::Modified(_) => PodEvent::Modified,
                WatchEvent::Deleted(_) => PodEvent::Deleted,
                WatchEvent::Bookmark(_) => PodEvent::Bookmark,
                WatchEvent::Error(e) => PodEvent::Error(format!("{e:?}")),
            })
            .map_err(Error::from)
            .boxed())
    }
}

/// Error type for discovery failures, delivered on [`Discovery::errors`].
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Listing pods failed.
    #[error("failed to list pods: {0}")]
    List(#[source] Error),

    /// Opening the watch failed.
    #[error("failed to start watch: {0}")]
    WatchStart(#[source] Error),

    /// The watch stream failed mid-session.
    #[error("watch stream failed: {0}")]
    Watch(#[source] Error),

    /// The watch stream ended.
    #[error("watch channel closed")]
    WatchClosed,
}

/// Configuration for pod discovery.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// The label selector for backend pods, used by [`KubePodSource`].
    pub label_selector: String,

    /// The Kubernetes namespace of the pods, used by [`KubePodSource`].
    /// If `None`, uses the current namespace from the kube client.
    pub namespace: Option<String>,

    /// The backend port (number or container port name).
    pub port: Port,

    /// Watch or poll.
    pub mode: DiscoveryMode,

    /// Delay before re-subscribing after a watch failure.
    pub restart_delay: Duration,

    /// Capacity of the backend and error queues.
    pub channel_capacity: usize,
}

impl DiscoveryConfig {
    /// Creates a new discovery configuration in watch mode.
    ///
    /// The port can be specified as a number (`3333`) or a name (`"relay"`).
    /// Uses the current namespace from the kube client configuration.
    #[must_use]
    pub fn new(label_selector: impl Into<String>, port: impl Into<Port>) -> Self {
        Self {
            label_selector: label_selector.into(),
            namespace: None,
            port: port.into(),
            mode: DiscoveryMode::Watch,
            restart_delay: DEFAULT_RESTART_DELAY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Sets an explicit namespace for the pods.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Polls on `interval` instead of watching.
    ///
    /// Intervals below [`MIN_POLL_INTERVAL`] are raised to it.
    #[must_use]
    pub fn poll(mut self, interval: Duration) -> Self {
        self.mode = DiscoveryMode::Poll(interval.max(MIN_POLL_INTERVAL));
        self
    }

    /// Sets the delay before re-subscribing after a watch failure.
    #[must_use]
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Sets the capacity of the output queues.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

/// Running discovery: its output queues and a handle to stop it.
#[derive(Debug)]
pub struct Discovery {
    /// Changed backend sets, oldest first.
    pub backends: Receiver<BackendSet>,
    /// Non-fatal discovery errors.
    pub errors: Receiver<DiscoveryError>,
    /// Handle to the background loop.
    pub handle: DiscoveryHandle,
}

/// Handle to a running discovery loop.
///
/// Dropping the handle stops the loop.
#[derive(Debug)]
pub struct DiscoveryHandle {
    stop: Shutdown,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Asks the loop to stop. Both output queues close once it has.
    pub fn close(&self) {
        self.stop.trigger();
    }

    /// Waits for the loop to finish.
    pub async fn stopped(mut self) {
        if let Err(e) = (&mut self.task).await {
            tracing::error!("pod discovery task failed: {e}");
        }
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

/// Produces backend sets from pods, emitting only on change.
pub struct PodDiscoverer<S> {
    source: S,
    config: DiscoveryConfig,
}

impl<S: PodSource> PodDiscoverer<S> {
    /// Creates a discoverer reading from `source`.
    #[must_use]
    pub fn new(source: S, config: DiscoveryConfig) -> Self {
        Self { source, config }
    }

    /// Spawns the discovery loop.
    ///
    /// The loop runs until `shutdown` is triggered or the
    /// [`DiscoveryHandle`] is closed or dropped; it then finishes any
    /// in-flight reconciliation and closes both queues.
    #[must_use]
    pub fn start(self, shutdown: &Shutdown) -> Discovery {
        let capacity = self.config.channel_capacity.max(1);
        let (backends_tx, backends) = mpsc::channel(capacity);
        let (errors_tx, errors) = mpsc::channel(capacity);

        let stop = shutdown.child();
        let reconciler = Reconciler::new(self.config.port.clone(), backends_tx, errors_tx);

        let task = tokio::spawn(discovery_loop(
            self.source,
            self.config,
            reconciler,
            stop.clone(),
        ));

        Discovery {
            backends,
            errors,
            handle: DiscoveryHandle { stop, task },
        }
    }
}

/// Background task that drives the configured mode.
async fn discovery_loop<S: PodSource>(
    source: S,
    config: DiscoveryConfig,
    mut reconciler: Reconciler,
    stop: Shutdown,
) {
    match config.mode {
        DiscoveryMode::Watch => {
            tracing::info!(
                label_selector = %config.label_selector,
                port = %config.port,
                "Starting pod watcher with Kubernetes watch API"
            );
            watch_loop(&source, &mut reconciler, config.restart_delay, &stop).await;
        }
        DiscoveryMode::Poll(every) => {
            tracing::info!(
                label_selector = %config.label_selector,
                port = %config.port,
                interval = ?every,
                "Starting pod watcher with polling"
            );
            poll_loop(&source, &mut reconciler, every, &stop).await;
        }
    }

    tracing::info!("Pod watcher stopped");
}

async fn watch_loop<S: PodSource>(
    source: &S,
    reconciler: &mut Reconciler,
    restart_delay: Duration,
    stop: &Shutdown,
) {
    while !stop.is_triggered() {
        let Err(e) = watch_session(source, reconciler, stop).await else {
            return;
        };

        tracing::error!(error = %e, "Watch error, restarting");
        reconciler.report(e);

        tokio::select! {
            biased;
            () = stop.cancelled() => return,
            () = sleep(restart_delay) => {}
        }
    }
}

/// Runs one watch session. Returns `Ok` only when stopped.
async fn watch_session<S: PodSource>(
    source: &S,
    reconciler: &mut Reconciler,
    stop: &Shutdown,
) -> std::result::Result<(), DiscoveryError> {
    let mut events = source.watch().await.map_err(DiscoveryError::WatchStart)?;

    reconciler.update_backend_list(source).await?;

    loop {
        let event = tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            event = events.next() => event,
        };

        match event {
            None => return Err(DiscoveryError::WatchClosed),
            Some(Err(e)) => return Err(DiscoveryError::Watch(e)),
            Some(Ok(PodEvent::Added | PodEvent::Modified | PodEvent::Deleted)) => {
                if let Err(e) = reconciler.update_backend_list(source).await {
                    tracing::error!(error = %e, "Failed to update backend list");
                    reconciler.report(e);
                }
            }
            Some(Ok(PodEvent::Bookmark)) => {}
            Some(Ok(PodEvent::Error(message))) => {
                tracing::error!(error = %message, "Received error event from watch");
            }
        }
    }
}

async fn poll_loop<S: PodSource>(
    source: &S,
    reconciler: &mut Reconciler,
    every: Duration,
    stop: &Shutdown,
) {
    let mut ticker = interval(every.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if let Err(e) = reconciler.update_backend_list(source).await {
            tracing::error!(error = %e, "Failed to update backend list");
            reconciler.report(e);
        }
    }
}

/// Diff-and-emit state owned by the discovery loop.
struct Reconciler {
    port: Port,
    last: BackendSet,
    backends_tx: Sender<BackendSet>,
    errors_tx: Sender<DiscoveryError>,
}

impl Reconciler {
    fn new(port: Port, backends_tx: Sender<BackendSet>, errors_tx: Sender<DiscoveryError>) -> Self {
        Self {
            port,
            last: BackendSet::new(),
            backends_tx,
            errors_tx,
        }
    }

    /// Lists pods and emits the backend set if it changed.
    async fn update_backend_list<S: PodSource>(
        &mut self,
        source: &S,
    ) -> std::result::Result<(), DiscoveryError> {
        let pods = source.list().await.map_err(DiscoveryError::List)?;
        let backends = extract_backends(&pods, &self.port);
        self.observe(backends);
        Ok(())
    }

    /// Emits `backends` if it differs from the last observed set.
    ///
    /// The new set becomes the baseline even if the queue was full.
    fn observe(&mut self, backends: BackendSet) {
        if backends == self.last {
            return;
        }

        tracing::info!(
            old_count = self.last.len(),
            new_count = backends.len(),
            "Pod backends changed"
        );

        self.last = backends.clone();

        match self.backends_tx.try_send(backends) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Backend channel full, skipping update");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Backend channel closed, dropping update");
            }
        }
    }

    /// Delivers a non-fatal error to the error queue.
    fn report(&self, error: DiscoveryError) {
        match self.errors_tx.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(e)) => {
                tracing::warn!(error = %e, "Error channel full, dropping error");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Extracts backend addresses of running pods with an IP.
fn extract_backends(pods: &[Pod], port: &Port) -> BackendSet {
    pods.iter()
        .filter_map(|pod| backend_address(pod, port))
        .collect()
}

fn backend_address(pod: &Pod, port: &Port) -> Option<String> {
    let status = pod.status.as_ref()?;

    if status.phase.as_deref() != Some(POD_RUNNING) {
        return None;
    }

    let ip = status.pod_ip.as_deref().filter(|ip| !ip.is_empty())?;
    let port = resolve_port(pod, port)?;

    // Bracket IPv6 literals so the result is a valid host:port.
    if ip.contains(':') {
        Some(format!("[{ip}]:{port}"))
    } else {
        Some(format!("{ip}:{port}"))
    }
}

/// Resolves the port number for a pod.
fn resolve_port(pod: &Pod, port: &Port) -> Option<u16> {
    match port {
        Port::Number(n) => Some(*n),
        Port::Name(name) => pod
            .spec
            .as_ref()?
            .containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .and_then(|p| u16::try_from(p.container_port).ok()),
    }
}
