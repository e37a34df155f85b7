//! Environment-variable configuration.
//!
//! Unset and empty variables fall back to their defaults. Durations accept a
//! bare number of seconds (`30`, `1.5`) or one or more numbers with a unit
//! (`500ms`, `1.5s`, `1m30s`). Units are `ns`, `us`, `µs`, `ms`, `s`, `m`
//! and `h`.

use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::health::DEFAULT_HEALTH_PORT;
use crate::k8s::{DEFAULT_RESTART_DELAY, DiscoveryConfig, Port};
use crate::traefik::{PublisherConfig, RouteSettings};

const DEFAULT_BACKEND_PORT: u16 = 3333;
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Error type for configuration failures. Each variant names the variable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    /// A variable has a value that cannot be used.
    #[error("invalid {var} {value:?}: {reason}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable text.
    Text,
}

/// Service configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Label selector for backend pods (`POD_LABELS`).
    pub pod_labels: String,
    /// Pod namespace (`POD_NAMESPACE`). `None` uses the kube client default.
    pub pod_namespace: Option<String>,
    /// Traefik REST provider URL (`TRAEFIK_API_URL`).
    pub traefik_api_url: String,
    /// Router, service and balancing method.
    pub route: RouteSettings,
    /// Polling interval (`UPDATE_INTERVAL`).
    pub update_interval: Duration,
    /// Watch instead of polling (`USE_WATCH`).
    pub use_watch: bool,
    /// Backend port (`BACKEND_PORT`).
    pub backend_port: Port,
    /// Port of the health server (`HEALTH_CHECK_PORT`).
    pub health_check_port: u16,
    /// Log filter directive (`LOG_LEVEL`).
    pub log_level: String,
    /// Log format (`LOG_FORMAT`).
    pub log_format: LogFormat,
    /// Circuit breaker tuning (`CB_*`).
    pub breaker: BreakerConfig,
    /// Delay before re-subscribing a failed watch (`WATCH_RESTART_DELAY`).
    pub watch_restart_delay: Duration,
}

impl Config {
    /// Loads and validates configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns the first missing or invalid variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads and validates configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first missing or invalid variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let pod_labels = get("POD_LABELS").ok_or(ConfigError::Missing("POD_LABELS"))?;
        let traefik_api_url =
            get("TRAEFIK_API_URL").ok_or(ConfigError::Missing("TRAEFIK_API_URL"))?;

        let defaults = RouteSettings::default();
        let route = RouteSettings {
            router_name: get("ROUTER_NAME").unwrap_or(defaults.router_name),
            service_name: get("SERVICE_NAME").unwrap_or(defaults.service_name),
            lb_method: get("LB_METHOD").unwrap_or(defaults.lb_method),
        };

        let breaker_defaults = BreakerConfig::default();
        let breaker = BreakerConfig {
            max_half_open_requests: parse_or(
                "CB_MAX_REQUESTS",
                get("CB_MAX_REQUESTS").as_deref(),
                breaker_defaults.max_half_open_requests,
            )?,
            closed_window_interval: duration_or(
                "CB_INTERVAL",
                get("CB_INTERVAL").as_deref(),
                breaker_defaults.closed_window_interval,
            )?,
            open_timeout: duration_or(
                "CB_TIMEOUT",
                get("CB_TIMEOUT").as_deref(),
                breaker_defaults.open_timeout,
            )?,
            consecutive_failure_threshold: parse_or(
                "CB_CONSECUTIVE_FAILURES",
                get("CB_CONSECUTIVE_FAILURES").as_deref(),
                breaker_defaults.consecutive_failure_threshold,
            )?,
        };

        let config = Self {
            pod_labels,
            pod_namespace: get("POD_NAMESPACE"),
            traefik_api_url,
            route,
            update_interval: duration_or(
                "UPDATE_INTERVAL",
                get("UPDATE_INTERVAL").as_deref(),
                DEFAULT_UPDATE_INTERVAL,
            )?,
            use_watch: get("USE_WATCH").is_none_or(|v| parse_flag(&v)),
            backend_port: get("BACKEND_PORT")
                .map_or(Ok(Port::Number(DEFAULT_BACKEND_PORT)), |v| parse_port(&v))?,
            health_check_port: parse_or(
                "HEALTH_CHECK_PORT",
                get("HEALTH_CHECK_PORT").as_deref(),
                DEFAULT_HEALTH_PORT,
            )?,
            log_level: get("LOG_LEVEL").map_or_else(|| "info".to_string(), |v| v.to_lowercase()),
            log_format: get("LOG_FORMAT").map_or(LogFormat::Json, |v| parse_log_format(&v)),
            breaker,
            watch_restart_delay: duration_or(
                "WATCH_RESTART_DELAY",
                get("WATCH_RESTART_DELAY").as_deref(),
                DEFAULT_RESTART_DELAY,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the service relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pod_labels.trim().is_empty() {
            return Err(ConfigError::Missing("POD_LABELS"));
        }

        if self.traefik_api_url.is_empty() {
            return Err(ConfigError::Missing("TRAEFIK_API_URL"));
        }

        Url::parse(&self.traefik_api_url)
            .map_err(|e| ConfigError::invalid("TRAEFIK_API_URL", &self.traefik_api_url, e.to_string()))?;

        match &self.backend_port {
            Port::Number(0) => {
                return Err(ConfigError::invalid(
                    "BACKEND_PORT",
                    "0",
                    "must be between 1 and 65535",
                ));
            }
            Port::Name(name) if name.trim().is_empty() => {
                return Err(ConfigError::invalid(
                    "BACKEND_PORT",
                    name.as_str(),
                    "port name must not be blank",
                ));
            }
            _ => {}
        }

        if self.update_interval < MIN_UPDATE_INTERVAL {
            return Err(ConfigError::invalid(
                "UPDATE_INTERVAL",
                format!("{:?}", self.update_interval),
                "must be at least 1 second",
            ));
        }

        Ok(())
    }

    /// Discovery settings. These also select the pods [`KubePodSource`] lists.
    ///
    /// [`KubePodSource`]: crate::KubePodSource
    #[must_use]
    pub fn discovery_config(&self) -> DiscoveryConfig {
        let mut config = DiscoveryConfig::new(self.pod_labels.clone(), self.backend_port.clone())
            .restart_delay(self.watch_restart_delay);

        if let Some(namespace) = &self.pod_namespace {
            config = config.namespace(namespace.clone());
        }

        if self.use_watch {
            config
        } else {
            config.poll(self.update_interval)
        }
    }

    /// Publisher settings.
    #[must_use]
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig::new(self.traefik_api_url.clone())
            .route(self.route.clone())
            .breaker(self.breaker.clone())
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    value: Option<&str>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(var, v, e.to_string())),
    }
}

fn duration_or(
    var: &'static str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => parse_duration(v).ok_or_else(|| {
            ConfigError::invalid(var, v, "expected seconds or a duration such as 500ms or 1m30s")
        }),
    }
}

/// Parses `30`, `1.5`, `500ms`, `1.5s` or `1m30s`.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();

    if value.is_empty() {
        return None;
    }

    if let Some(secs) = parse_decimal(value, 1_000_000_000) {
        return Some(Duration::from_nanos(u64::try_from(secs).ok()?));
    }

    let mut rest = value;
    let mut total: u128 = 0;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let nanos_per_unit: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return None,
        };

        total = total.checked_add(parse_decimal(number, nanos_per_unit)?)?;
        rest = tail;
    }

    Some(Duration::from_nanos(u64::try_from(total).ok()?))
}

/// Scales a plain decimal like `1.25` by `scale`, truncating below one unit.
fn parse_decimal(number: &str, scale: u128) -> Option<u128> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));

    if whole.is_empty() && fraction.is_empty() {
        return None;
    }

    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !digits(whole) || !digits(fraction) {
        return None;
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut total = whole.checked_mul(scale)?;

    let mut place = scale;
    for digit in fraction.bytes().take(18) {
        place /= 10;
        total = total.checked_add(u128::from(digit - b'0') * place)?;
    }

    Some(total)
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn parse_port(value: &str) -> Result<Port, ConfigError> {
    let value = value.trim();

    if value.bytes().all(|b| b.is_ascii_digit()) {
        return match value.parse::<u16>() {
            Ok(n) if n > 0 => Ok(Port::Number(n)),
            _ => Err(ConfigError::invalid(
                "BACKEND_PORT",
                value,
                "must be between 1 and 65535",
            )),
        };
    }

    Ok(Port::Name(value.to_string()))
}

/// `json` in any case selects JSON; every other value selects text.
fn parse_log_format(value: &str) -> LogFormat {
    if value.trim().eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}
