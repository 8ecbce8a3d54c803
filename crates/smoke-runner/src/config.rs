//! Smoke runner configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default matching the reference topology (namespaces `public`/`private`,
//! service port 9090, tunnels on 9090/9091), so a bare `smoke-runner`
//! invocation against the current kube context works.

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::transport::{ReadStrategy, TransportSettings};
use crate::tunnel::TunnelWait;

/// Default namespace for the public environment.
pub const DEFAULT_PUBLIC_NAMESPACE: &str = "public";

/// Default namespace for the private environment.
pub const DEFAULT_PRIVATE_NAMESPACE: &str = "private";

/// Port the workload is exposed on inside the overlay.
pub const DEFAULT_SERVICE_PORT: u16 = 9090;

/// Local port for the public tunnel.
pub const DEFAULT_PUBLIC_TUNNEL_PORT: u16 = 9090;

/// Local port for the private tunnel.
pub const DEFAULT_PRIVATE_TUNNEL_PORT: u16 = 9091;

/// Public readiness budget. Covers image pull and overlay init.
pub const DEFAULT_PUBLIC_READY_TIMEOUT_SECONDS: u64 = 600;

/// Private readiness budget. Only link propagation remains by then.
pub const DEFAULT_PRIVATE_READY_TIMEOUT_SECONDS: u64 = 180;

/// Default readiness poll interval in milliseconds.
pub const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 2000;

/// Fixed grace period between opening tunnels and using them.
pub const DEFAULT_TUNNEL_GRACE_MS: u64 = 2000;

/// Upper bound for tunnel readiness probing.
pub const DEFAULT_TUNNEL_PROBE_TIMEOUT_SECONDS: u64 = 30;

/// Initial delay between tunnel readiness probes.
pub const DEFAULT_TUNNEL_PROBE_INTERVAL_MS: u64 = 100;

/// Default connect timeout for the transport verifier.
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 5;

/// Default read timeout for the transport verifier.
pub const DEFAULT_READ_TIMEOUT_SECONDS: u64 = 10;

/// Default timeout for synchronous CLI invocations.
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 300;

/// Default probe payload.
pub const DEFAULT_PROBE_PAYLOAD: &str = "Halo";

/// Upper bound for any configured timeout or interval (one day).
pub const MAX_DURATION_SECONDS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Cluster context for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub namespace: String,
    /// kube context name; `None` uses the current context.
    pub context: Option<String>,
    /// kubeconfig path; `None` uses the default lookup.
    pub kubeconfig: Option<String>,
}

/// Smoke runner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub public: EnvironmentConfig,
    pub private: EnvironmentConfig,

    /// kubectl executable (default: "kubectl").
    pub kubectl_bin: String,

    /// Overlay CLI executable (default: "skupper").
    pub skupper_bin: String,

    /// Where the public environment writes the connection token.
    pub token_path: PathBuf,

    /// Port the workload is exposed on, and the remote side of both tunnels.
    pub service_port: u16,

    pub public_tunnel_port: u16,
    pub private_tunnel_port: u16,

    pub public_ready_timeout: Duration,
    pub private_ready_timeout: Duration,
    pub ready_poll_interval: Duration,

    /// How to decide a freshly opened tunnel is usable.
    pub tunnel_wait: TunnelWait,

    pub transport: TransportSettings,

    /// Timeout for synchronous CLI invocations.
    pub command_timeout: Duration,

    /// Payload sent through each tunnel.
    pub probe_payload: String,

    /// Emit JSON-formatted logs.
    pub json_logs: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let public = EnvironmentConfig {
            namespace: string_var(vars, "SMOKE_PUBLIC_NAMESPACE", DEFAULT_PUBLIC_NAMESPACE),
            context: optional_var(vars, "SMOKE_PUBLIC_CONTEXT"),
            kubeconfig: optional_var(vars, "SMOKE_PUBLIC_KUBECONFIG"),
        };

        let private = EnvironmentConfig {
            namespace: string_var(vars, "SMOKE_PRIVATE_NAMESPACE", DEFAULT_PRIVATE_NAMESPACE),
            context: optional_var(vars, "SMOKE_PRIVATE_CONTEXT"),
            kubeconfig: optional_var(vars, "SMOKE_PRIVATE_KUBECONFIG"),
        };

        // Per-run token file so concurrent runs on one host never share it
        let token_path = optional_var(vars, "SMOKE_TOKEN_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                env::temp_dir().join(format!("public-secret-{}.yaml", Uuid::new_v4()))
            });

        let tunnel_wait = match vars.get("SMOKE_TUNNEL_WAIT").map(String::as_str) {
            None | Some("probe") => TunnelWait::Probe {
                timeout: seconds_var(
                    vars,
                    "SMOKE_TUNNEL_PROBE_TIMEOUT_SECONDS",
                    DEFAULT_TUNNEL_PROBE_TIMEOUT_SECONDS,
                )?,
                interval: Duration::from_millis(DEFAULT_TUNNEL_PROBE_INTERVAL_MS),
            },
            Some("fixed") => TunnelWait::FixedDelay(millis_var(
                vars,
                "SMOKE_TUNNEL_GRACE_MS",
                DEFAULT_TUNNEL_GRACE_MS,
            )?),
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "SMOKE_TUNNEL_WAIT must be 'probe' or 'fixed', got '{other}'"
                )))
            }
        };

        let read_strategy = match vars.get("SMOKE_READ_STRATEGY").map(String::as_str) {
            None | Some("single") => ReadStrategy::SingleRead,
            Some("accumulate") => ReadStrategy::Accumulate,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "SMOKE_READ_STRATEGY must be 'single' or 'accumulate', got '{other}'"
                )))
            }
        };

        let transport = TransportSettings {
            connect_timeout: seconds_var(
                vars,
                "SMOKE_CONNECT_TIMEOUT_SECONDS",
                DEFAULT_CONNECT_TIMEOUT_SECONDS,
            )?,
            read_timeout: seconds_var(
                vars,
                "SMOKE_READ_TIMEOUT_SECONDS",
                DEFAULT_READ_TIMEOUT_SECONDS,
            )?,
            read_strategy,
        };

        let public_tunnel_port =
            parse_var(vars, "SMOKE_PUBLIC_TUNNEL_PORT", DEFAULT_PUBLIC_TUNNEL_PORT)?;
        let private_tunnel_port =
            parse_var(vars, "SMOKE_PRIVATE_TUNNEL_PORT", DEFAULT_PRIVATE_TUNNEL_PORT)?;

        // Both tunnels listen on the same host at the same time
        if public_tunnel_port == private_tunnel_port {
            return Err(ConfigError::InvalidValue(format!(
                "SMOKE_PUBLIC_TUNNEL_PORT and SMOKE_PRIVATE_TUNNEL_PORT must differ, both are {public_tunnel_port}"
            )));
        }

        let probe_payload = string_var(vars, "SMOKE_PROBE_PAYLOAD", DEFAULT_PROBE_PAYLOAD);
        if probe_payload.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SMOKE_PROBE_PAYLOAD must not be empty".to_string(),
            ));
        }

        Ok(Self {
            public,
            private,
            kubectl_bin: string_var(vars, "SMOKE_KUBECTL_BIN", "kubectl"),
            skupper_bin: string_var(vars, "SMOKE_SKUPPER_BIN", "skupper"),
            token_path,
            service_port: parse_var(vars, "SMOKE_SERVICE_PORT", DEFAULT_SERVICE_PORT)?,
            public_tunnel_port,
            private_tunnel_port,
            public_ready_timeout: seconds_var(
                vars,
                "SMOKE_PUBLIC_READY_TIMEOUT_SECONDS",
                DEFAULT_PUBLIC_READY_TIMEOUT_SECONDS,
            )?,
            private_ready_timeout: seconds_var(
                vars,
                "SMOKE_PRIVATE_READY_TIMEOUT_SECONDS",
                DEFAULT_PRIVATE_READY_TIMEOUT_SECONDS,
            )?,
            ready_poll_interval: millis_var(
                vars,
                "SMOKE_READY_POLL_INTERVAL_MS",
                DEFAULT_READY_POLL_INTERVAL_MS,
            )?,
            tunnel_wait,
            transport,
            command_timeout: seconds_var(
                vars,
                "SMOKE_COMMAND_TIMEOUT_SECONDS",
                DEFAULT_COMMAND_TIMEOUT_SECONDS,
            )?,
            probe_payload,
            json_logs: parse_var(vars, "SMOKE_LOG_JSON", false)?,
        })
    }
}

fn string_var(vars: &HashMap<String, String>, name: &str, default: &str) -> String {
    vars.get(name)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn optional_var(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name).filter(|v| !v.is_empty()).cloned()
}

fn seconds_var(vars: &HashMap<String, String>, name: &str, default: u64) -> Result<Duration, ConfigError> {
    bounded(name, Duration::from_secs(parse_var(vars, name, default)?))
}

fn millis_var(vars: &HashMap<String, String>, name: &str, default: u64) -> Result<Duration, ConfigError> {
    bounded(name, Duration::from_millis(parse_var(vars, name, default)?))
}

fn bounded(name: &str, value: Duration) -> Result<Duration, ConfigError> {
    if value > Duration::from_secs(MAX_DURATION_SECONDS) {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be at most {MAX_DURATION_SECONDS} seconds, got {value:?}"
        )));
    }
    Ok(value)
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match vars.get(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{name}='{raw}': {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_match_reference_topology() {
        let config = Config::from_vars(&HashMap::new()).unwrap();

        assert_eq!(config.public.namespace, "public");
        assert_eq!(config.private.namespace, "private");
        assert_eq!(config.public.context, None);
        assert_eq!(config.kubectl_bin, "kubectl");
        assert_eq!(config.skupper_bin, "skupper");
        assert_eq!(config.service_port, 9090);
        assert_eq!(config.public_tunnel_port, 9090);
        assert_eq!(config.private_tunnel_port, 9091);
        assert_eq!(config.public_ready_timeout, Duration::from_secs(600));
        assert_eq!(config.private_ready_timeout, Duration::from_secs(180));
        assert_eq!(config.probe_payload, "Halo");
        assert_eq!(config.transport.read_strategy, ReadStrategy::SingleRead);
        assert!(matches!(config.tunnel_wait, TunnelWait::Probe { .. }));
        assert!(!config.json_logs);
    }

    #[test]
    fn test_token_path_is_unique_per_run() {
        let a = Config::from_vars(&HashMap::new()).unwrap();
        let b = Config::from_vars(&HashMap::new()).unwrap();
        assert_ne!(a.token_path, b.token_path);
        assert!(a
            .token_path
            .to_string_lossy()
            .contains("public-secret-"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_vars(&vars(&[
            ("SMOKE_PUBLIC_NAMESPACE", "edge"),
            ("SMOKE_PRIVATE_CONTEXT", "kind-private"),
            ("SMOKE_TOKEN_PATH", "/tmp/token.yaml"),
            ("SMOKE_TUNNEL_WAIT", "fixed"),
            ("SMOKE_TUNNEL_GRACE_MS", "2500"),
            ("SMOKE_READ_STRATEGY", "accumulate"),
            ("SMOKE_PRIVATE_READY_TIMEOUT_SECONDS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.public.namespace, "edge");
        assert_eq!(config.private.context.as_deref(), Some("kind-private"));
        assert_eq!(config.token_path, PathBuf::from("/tmp/token.yaml"));
        assert_eq!(
            config.tunnel_wait,
            TunnelWait::FixedDelay(Duration::from_millis(2500))
        );
        assert_eq!(config.transport.read_strategy, ReadStrategy::Accumulate);
        assert_eq!(config.private_ready_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = Config::from_vars(&vars(&[("SMOKE_SERVICE_PORT", "ninety")])).unwrap_err();
        assert!(err.to_string().contains("SMOKE_SERVICE_PORT"));
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        let err = Config::from_vars(&vars(&[(
            "SMOKE_READ_TIMEOUT_SECONDS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("SMOKE_READ_TIMEOUT_SECONDS"));

        let err = Config::from_vars(&vars(&[("SMOKE_TUNNEL_GRACE_MS", "90000000"), ("SMOKE_TUNNEL_WAIT", "fixed")]))
            .unwrap_err();
        assert!(err.to_string().contains("SMOKE_TUNNEL_GRACE_MS"));

        // One day is still accepted
        let config = Config::from_vars(&vars(&[("SMOKE_PUBLIC_READY_TIMEOUT_SECONDS", "86400")])).unwrap();
        assert_eq!(config.public_ready_timeout, Duration::from_secs(86_400));
    }

    #[test]
    fn test_unknown_tunnel_wait_is_rejected() {
        let err = Config::from_vars(&vars(&[("SMOKE_TUNNEL_WAIT", "sleep")])).unwrap_err();
        assert!(err.to_string().contains("SMOKE_TUNNEL_WAIT"));
    }

    #[test]
    fn test_tunnel_ports_must_differ() {
        let err = Config::from_vars(&vars(&[
            ("SMOKE_PUBLIC_TUNNEL_PORT", "9095"),
            ("SMOKE_PRIVATE_TUNNEL_PORT", "9095"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_empty_context_is_treated_as_unset() {
        let config = Config::from_vars(&vars(&[("SMOKE_PUBLIC_CONTEXT", "")])).unwrap();
        assert_eq!(config.public.context, None);
    }
}
