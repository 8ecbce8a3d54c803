//! Smoke runner error types.
//!
//! Each capability has its own error enum. `SmokeError` is the run-level
//! error: every variant names the environment that failed and maps to the
//! lifecycle phase it aborted, so a failed run always says where it broke.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::environment::Role;
use crate::lifecycle::Phase;

/// CLI invocation errors (kubectl, skupper).
#[derive(Debug, Error)]
pub enum CliError {
    /// The program could not be started at all.
    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully.
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The program did not finish within the command timeout.
    #[error("`{command}` did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    /// Feeding stdin or collecting output failed.
    #[error("I/O error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Cluster API errors.
#[derive(Debug, Error)]
pub enum ClusterApiError {
    /// No usable kubeconfig or client for the environment's context.
    #[error("Failed to load cluster configuration: {0}")]
    Config(String),

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} still present {waited:?} after deletion")]
    DeletionTimeout {
        kind: &'static str,
        name: String,
        waited: Duration,
    },

    #[error("Kubernetes API request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("Cluster API error: {0}")]
    Api(String),
}

impl ClusterApiError {
    /// Map a kube error for `kind`/`name` onto the conflict and absence
    /// variants using the API status code.
    pub fn from_kube(err: kube::Error, kind: &'static str, name: &str) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 404 => ClusterApiError::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(response) if response.code == 409 => ClusterApiError::AlreadyExists {
                kind,
                name: name.to_string(),
            },
            other => ClusterApiError::Kube(other),
        }
    }
}

/// Overlay link errors.
///
/// Token misuse is detected before any CLI call is made, so these variants
/// are deterministic regardless of cluster state.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Connection token {path} has not been issued")]
    TokenNotIssued { path: String },

    #[error("Connection token {path} was already issued by the {issuer} environment")]
    TokenAlreadyIssued { path: String, issuer: Role },

    #[error("Connection token {path} was already consumed by the {consumer} environment")]
    TokenAlreadyConsumed { path: String, consumer: Role },

    #[error("The {role} environment cannot consume its own connection token")]
    SelfLink { role: Role },

    #[error("Overlay command failed: {0}")]
    Cli(#[from] CliError),
}

/// Readiness polling errors.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The resource never appeared within the budget.
    #[error("Resource {resource} not ready after {waited:?}")]
    Timeout { resource: String, waited: Duration },

    /// The cluster could not be queried. Not retried.
    #[error("Failed to query resource {resource}: {source}")]
    Query {
        resource: String,
        #[source]
        source: ClusterApiError,
    },
}

/// Port-forward tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelSetupError {
    #[error("Failed to start tunnel to {resource}: {source}")]
    Spawn {
        resource: String,
        #[source]
        source: CliError,
    },

    #[error("Tunnel to {resource} exited: {reason}")]
    Exited { resource: String, reason: String },

    #[error("Tunnel to {resource} not accepting connections on {local_addr} after {waited:?}")]
    NotReady {
        resource: String,
        local_addr: SocketAddr,
        waited: Duration,
    },
}

/// Transport verification errors.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Failed to resolve {address}: {reason}")]
    AddressResolution { address: String, reason: String },

    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Failed to write probe to {address}: {source}")]
    Write {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read reply from {address}: {reason}")]
    Read { address: String, reason: String },

    #[error("Unexpected response: got {got:?}, want reply containing {want:?}")]
    UnexpectedResponse { got: String, want: String },
}

/// Run-level error. Any of these fails the smoke run.
#[derive(Debug, Error)]
pub enum SmokeError {
    #[error("Provisioning failed in {role} environment: {source}")]
    Provisioning {
        role: Role,
        #[source]
        source: ClusterApiError,
    },

    #[error("Linking failed in {role} environment: {source}")]
    Linking {
        role: Role,
        #[source]
        source: LinkError,
    },

    #[error("Readiness failed in {role} environment: {source}")]
    Readiness {
        role: Role,
        #[source]
        source: ReadinessError,
    },

    #[error("Tunnel setup failed in {role} environment: {source}")]
    TunnelSetup {
        role: Role,
        #[source]
        source: TunnelSetupError,
    },

    #[error("Verification failed in {role} environment: {source}")]
    Verification {
        role: Role,
        #[source]
        source: VerificationError,
    },

    /// Setup or verification panicked; caught so teardown still runs.
    #[error("Smoke run aborted during {phase}: {message}")]
    Internal { phase: Phase, message: String },
}

impl SmokeError {
    /// The lifecycle phase this error aborted.
    pub fn phase(&self) -> Phase {
        match self {
            SmokeError::Provisioning { .. } => Phase::Provisioning,
            SmokeError::Linking { .. } => Phase::Linking,
            SmokeError::Readiness { .. } => Phase::AwaitingReadiness,
            SmokeError::TunnelSetup { .. } | SmokeError::Verification { .. } => Phase::Verifying,
            SmokeError::Internal { phase, .. } => *phase,
        }
    }

    /// The environment that failed, if the failure belongs to one.
    pub fn role(&self) -> Option<Role> {
        match self {
            SmokeError::Provisioning { role, .. }
            | SmokeError::Linking { role, .. }
            | SmokeError::Readiness { role, .. }
            | SmokeError::TunnelSetup { role, .. }
            | SmokeError::Verification { role, .. } => Some(*role),
            SmokeError::Internal { .. } => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_mapping() {
        let err = SmokeError::Provisioning {
            role: Role::Public,
            source: ClusterApiError::Api("quota exceeded".to_string()),
        };
        assert_eq!(err.phase(), Phase::Provisioning);
        assert_eq!(err.role(), Some(Role::Public));

        let err = SmokeError::Linking {
            role: Role::Private,
            source: LinkError::TokenNotIssued {
                path: "/tmp/token.yaml".to_string(),
            },
        };
        assert_eq!(err.phase(), Phase::Linking);
        assert_eq!(err.role(), Some(Role::Private));

        let err = SmokeError::Readiness {
            role: Role::Private,
            source: ReadinessError::Timeout {
                resource: "tcp-go-echo".to_string(),
                waited: Duration::from_secs(180),
            },
        };
        assert_eq!(err.phase(), Phase::AwaitingReadiness);

        let err = SmokeError::Verification {
            role: Role::Public,
            source: VerificationError::UnexpectedResponse {
                got: "halo".to_string(),
                want: "HALO".to_string(),
            },
        };
        assert_eq!(err.phase(), Phase::Verifying);

        let err = SmokeError::Internal {
            phase: Phase::Linking,
            message: "boom".to_string(),
        };
        assert_eq!(err.phase(), Phase::Linking);
        assert_eq!(err.role(), None);
    }

    #[test]
    fn test_display_names_stage_and_environment() {
        let err = SmokeError::Verification {
            role: Role::Private,
            source: VerificationError::Connect {
                address: "127.0.0.1:9091".to_string(),
                reason: "connection refused".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "Verification failed in private environment: \
             Failed to connect to 127.0.0.1:9091: connection refused"
        );

        let err = SmokeError::Readiness {
            role: Role::Public,
            source: ReadinessError::Timeout {
                resource: "tcp-go-echo".to_string(),
                waited: Duration::from_secs(600),
            },
        };
        assert_eq!(
            err.to_string(),
            "Readiness failed in public environment: Resource tcp-go-echo not ready after 600s"
        );
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} for test"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_kube_status_codes_are_classified() {
        let err = ClusterApiError::from_kube(api_error(409, "AlreadyExists"), "namespace", "public");
        assert!(matches!(err, ClusterApiError::AlreadyExists { kind: "namespace", ref name } if name == "public"));

        let err = ClusterApiError::from_kube(api_error(404, "NotFound"), "deployment", "tcp-go-echo");
        assert!(matches!(err, ClusterApiError::NotFound { kind: "deployment", .. }));

        // Anything else keeps the original kube error
        let err = ClusterApiError::from_kube(api_error(403, "Forbidden"), "namespace", "public");
        assert!(matches!(err, ClusterApiError::Kube(kube::Error::Api(ref r)) if r.code == 403));
    }

    #[test]
    fn test_cli_error_converts_into_link_error() {
        let cli = CliError::Failed {
            command: "skupper connect /tmp/token.yaml".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "token expired".to_string(),
        };
        let link: LinkError = cli.into();
        assert!(matches!(link, LinkError::Cli(CliError::Failed { .. })));
    }
}
