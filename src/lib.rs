#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Keeps [Traefik](https://doc.traefik.io/traefik/) TCP load balancer backends in sync with
//! Kubernetes pods.
//!
//! Traefik's REST provider accepts a complete dynamic configuration document. This crate
//! discovers the running pods that match a label selector and, whenever their addresses
//! change, pushes a document with one TCP router and one load-balanced service listing
//! every pod as a server.
//!
//! # Features
//!
//! - **Pod discovery**: Kubernetes watch with automatic restart, or fixed-interval polling
//! - **Change detection**: Only a changed backend set is published
//! - **Circuit breaker**: Publishing stops while Traefik keeps failing, then probes for recovery
//! - **Health endpoints**: `/healthz`, `/readyz` and `/metrics` for Kubernetes probes
//!
//! # Usage
//!
//! ```ignore
//! use traefik_lb_k8s::{
//!     BackendPublisher, DiscoveryConfig, KubePodSource, PodDiscoverer, PublisherConfig,
//!     Shutdown, coordinator,
//! };
//!
//! let client = kube::Client::try_default().await?;
//! let config = DiscoveryConfig::new("app=relay", 3333_u16).namespace("relay");
//! let source = KubePodSource::new(client, &config);
//!
//! let publisher = BackendPublisher::new(PublisherConfig::new(
//!     "http://traefik:8080/api/providers/rest",
//! ))?;
//!
//! let shutdown = Shutdown::new();
//! let discovery = PodDiscoverer::new(source, config).start(&shutdown);
//!
//! coordinator::run(discovery, &publisher, &shutdown).await;
//! ```

pub mod breaker;
pub mod config;
pub mod coordinator;
pub mod health;
mod k8s;
mod shutdown;
pub mod traefik;

pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, State, Stats};
pub use config::{Config, ConfigError, LogFormat};
pub use health::{HealthState, ReadinessCheck};
pub use k8s::{
    BackendAddress, BackendSet, Discovery, DiscoveryConfig, DiscoveryError, DiscoveryHandle,
    DiscoveryMode, KubePodSource, MIN_POLL_INTERVAL, PodDiscoverer, PodEvent, PodEventStream,
    PodSource, Port,
};
pub use shutdown::Shutdown;
pub use traefik::{BackendPublisher, PublishError, PublisherConfig, RouteSettings};
