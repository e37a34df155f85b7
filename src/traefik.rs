//! Pushes backend sets to Traefik's REST configuration provider.
//!
//! Each update renders a [`ConfigurationDocument`] describing one TCP router
//! bound to one service whose load balancer lists every backend, then `PUT`s
//! it to the configured endpoint. Every submission goes through a
//! [`CircuitBreaker`] owned by the publisher.
//!
//! The health probe bypasses the breaker and does not count toward its
//! statistics.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::{BreakerConfig, BreakerError, CircuitBreaker, State, Stats};
use crate::k8s::BackendSet;

/// Default timeout for a single request to the Traefik API.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ENTRY_POINT: &str = "tcp";
const CATCH_ALL_RULE: &str = "HostSNI(`*`)";

/// Error type for publishing failures.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The document could not be serialized.
    #[error("failed to marshal config: {0}")]
    Encode(#[from] serde_json::Error),

    /// The HTTP request could not be built.
    #[error("failed to create request: {0}")]
    Request(#[source] reqwest::Error),

    /// The request could not be sent or the response could not be read.
    #[error("failed to send request: {0}")]
    Transport(#[source] reqwest::Error),

    /// Traefik answered with an unexpected status.
    #[error("unexpected status code {status}: {body}")]
    Status {
        /// Response status.
        status: StatusCode,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The circuit breaker is open; nothing was sent.
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// The circuit breaker is half-open with no probe quota left; nothing was
    /// sent.
    #[error("circuit breaker is half-open and max requests reached")]
    BreakerQuotaExhausted,
}

impl PublishError {
    /// Returns `true` when the breaker refused the call, as opposed to Traefik
    /// rejecting it.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::BreakerOpen | Self::BreakerQuotaExhausted)
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Self::Request(e)
        } else {
            Self::Transport(e)
        }
    }
}

impl From<BreakerError<PublishError>> for PublishError {
    fn from(e: BreakerError<PublishError>) -> Self {
        match e {
            BreakerError::Open => Self::BreakerOpen,
            BreakerError::QuotaExhausted => Self::BreakerQuotaExhausted,
            BreakerError::Inner(e) => e,
        }
    }
}

/// Naming and balancing settings for the rendered document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteSettings {
    /// Name of the TCP router.
    pub router_name: String,
    /// Name of the TCP service the router points at.
    pub service_name: String,
    /// Load balancing method, e.g. `leastconn`.
    pub lb_method: String,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            router_name: "relay-router".to_string(),
            service_name: "relay-service".to_string(),
            lb_method: "leastconn".to_string(),
        }
    }
}

/// Configuration for [`BackendPublisher`].
#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Traefik REST provider URL.
    pub api_url: String,
    /// Router and service naming.
    pub route: RouteSettings,
    /// Timeout for each HTTP request.
    pub request_timeout: Duration,
    /// Circuit breaker tuning.
    pub breaker: BreakerConfig,
}

impl PublisherConfig {
    /// Creates a configuration with default naming, timeout and breaker.
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            route: RouteSettings::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            breaker: BreakerConfig::default(),
        }
    }

    /// Sets router and service naming.
    #[must_use]
    pub fn route(mut self, route: RouteSettings) -> Self {
        self.route = route;
        self
    }

    /// Sets the circuit breaker tuning.
    #[must_use]
    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Dynamic configuration accepted by Traefik's REST provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDocument {
    /// TCP section.
    pub tcp: TcpConfiguration,
}

/// TCP routers and services.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfiguration {
    /// Routers by name.
    pub routers: BTreeMap<String, TcpRouter>,
    /// Services by name.
    pub services: BTreeMap<String, TcpService>,
}

/// A TCP router.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouter {
    /// Entry points the router listens on.
    pub entry_points: Vec<String>,
    /// Matching rule.
    pub rule: String,
    /// Target service name.
    pub service: String,
}

/// A TCP service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpService {
    /// Load balancer definition.
    pub load_balancer: LoadBalancer,
}

/// Load balancer over a list of servers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    /// Balancing method.
    pub method: String,
    /// Backend servers.
    pub servers: Vec<Server>,
}

/// A single backend server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// `host:port` address.
    pub address: String,
}

impl ConfigurationDocument {
    /// Renders a document with one server per address, in iteration order.
    #[must_use]
    pub fn render<'a, I>(route: &RouteSettings, addresses: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let servers = addresses
            .into_iter()
            .map(|address| Server {
                address: address.to_string(),
            })
            .collect();

        let router = TcpRouter {
            entry_points: vec![ENTRY_POINT.to_string()],
            rule: CATCH_ALL_RULE.to_string(),
            service: route.service_name.clone(),
        };

        let service = TcpService {
            load_balancer: LoadBalancer {
                method: route.lb_method.clone(),
                servers,
            },
        };

        Self {
            tcp: TcpConfiguration {
                routers: BTreeMap::from([(route.router_name.clone(), router)]),
                services: BTreeMap::from([(route.service_name.clone(), service)]),
            },
        }
    }

    /// Addresses of every server in every service.
    pub fn server_addresses(&self) -> impl Iterator<Item = &str> {
        self.tcp
            .services
            .values()
            .flat_map(|s| s.load_balancer.servers.iter())
            .map(|s| s.address.as_str())
    }
}

/// Publishes backend sets to Traefik behind a circuit breaker.
#[derive(Debug)]
pub struct BackendPublisher {
    api_url: String,
    route: RouteSettings,
    client: Client,
    breaker: CircuitBreaker,
}

impl BackendPublisher {
    /// Creates a publisher with a pooled HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Request`] if the HTTP client cannot be built.
    pub fn new(config: PublisherConfig) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(PublishError::Request)?;

        Ok(Self {
            api_url: config.api_url,
            route: config.route,
            client,
            breaker: CircuitBreaker::new(config.breaker),
        })
    }

    /// Replaces Traefik's backend list with `backends`.
    ///
    /// No retries happen here; the caller tries again on the next change.
    ///
    /// # Errors
    ///
    /// Returns the breaker's rejection, or the reason the update failed.
    pub async fn update_backends(&self, backends: &BackendSet) -> Result<(), PublishError> {
        self.breaker
            .execute(|| self.put_configuration(backends))
            .await?;

        tracing::info!(
            backend_count = backends.len(),
            circuit_breaker_state = %self.breaker.state(),
            "Updated Traefik configuration"
        );

        Ok(())
    }

    async fn put_configuration(&self, backends: &BackendSet) -> Result<(), PublishError> {
        let document = ConfigurationDocument::render(&self.route, backends.iter());
        let body = serde_json::to_vec(&document)?;

        let response = self
            .client
            .put(&self.api_url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(PublishError::from_reqwest)?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(PublishError::Status { status, body })
    }

    /// Checks that the Traefik API is reachable.
    ///
    /// `405 Method Not Allowed` counts as healthy, since the endpoint may only
    /// accept `PUT`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Transport`] or [`PublishError::Status`].
    pub async fn health_check(&self) -> Result<(), PublishError> {
        let response = self
            .client
            .get(&self.api_url)
            .send()
            .await
            .map_err(PublishError::from_reqwest)?;

        match response.status() {
            StatusCode::OK | StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status => Err(PublishError::Status {
                status,
                body: String::new(),
            }),
        }
    }

    /// Current circuit breaker state.
    #[must_use]
    pub fn breaker_state(&self) -> State {
        self.breaker.state()
    }

    /// Current circuit breaker statistics.
    #[must_use]
    pub fn breaker_stats(&self) -> Stats {
        self.breaker.stats()
    }
}
