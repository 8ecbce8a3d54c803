//! Cluster environment facade.
//!
//! A `ClusterEnvironment` wraps one cluster context for one logical role
//! ("public" or "private"): its namespace, its cluster API client, and the
//! port-forward and overlay command prefixes for that context. One instance
//! exists per role for a single run.
//!
//! # Overlay link
//!
//! The link is asymmetric. The public environment issues a
//! `ConnectionToken`, the private environment consumes it exactly once.
//! Token misuse (consume before issue, consume twice, consume on the issuer)
//! is rejected before any CLI call is made.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::cluster::{ClusterApi, KubeClusterApi, ServiceHandle};
use crate::config::Config;
use crate::errors::{CliError, ClusterApiError, LinkError};
use crate::process::{Invocation, ProcessRunner};
use crate::workload::{WorkloadSpec, WorkloadStatus};

/// Logical role of an environment in the overlay topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Hosts the workload and issues the connection token.
    Public,
    /// Joins the overlay by consuming the token.
    Private,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Public => write!(f, "public"),
            Role::Private => write!(f, "private"),
        }
    }
}

/// Lifecycle of a connection token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Path chosen, nothing written yet.
    Reserved,
    Issued { issuer: Role },
    Consumed { issuer: Role, consumer: Role },
}

/// One-time credential admitting a remote environment into the overlay.
#[derive(Debug)]
pub struct ConnectionToken {
    path: PathBuf,
    state: TokenState,
}

impl ConnectionToken {
    /// Reserve a token file at `path`. It must be issued before use.
    pub fn reserve(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: TokenState::Reserved,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    fn path_string(&self) -> String {
        self.path.display().to_string()
    }
}

/// One cluster context in one role.
pub struct ClusterEnvironment {
    role: Role,
    namespace: String,
    api: Arc<dyn ClusterApi>,
    runner: Arc<dyn ProcessRunner>,
    kubectl: Invocation,
    overlay: Invocation,
}

impl ClusterEnvironment {
    /// Environment using `kubectl` and `skupper` from `PATH` against the
    /// current kube context.
    pub fn new(
        role: Role,
        namespace: impl Into<String>,
        api: Arc<dyn ClusterApi>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let namespace = namespace.into();
        let overlay = Invocation::new("skupper").args(["--namespace", namespace.as_str()]);
        Self {
            role,
            namespace,
            api,
            runner,
            kubectl: Invocation::new("kubectl"),
            overlay,
        }
    }

    /// Environment for `role` using the binaries and cluster context from
    /// `config`.
    pub fn from_config(
        role: Role,
        config: &Config,
        api: Arc<dyn ClusterApi>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let env = match role {
            Role::Public => &config.public,
            Role::Private => &config.private,
        };

        let mut kubectl = Invocation::new(&config.kubectl_bin);
        let mut overlay = Invocation::new(&config.skupper_bin);
        if let Some(kubeconfig) = &env.kubeconfig {
            kubectl = kubectl.args(["--kubeconfig", kubeconfig.as_str()]);
            overlay = overlay.args(["--kubeconfig", kubeconfig.as_str()]);
        }
        if let Some(context) = &env.context {
            kubectl = kubectl.args(["--context", context.as_str()]);
            overlay = overlay.args(["--context", context.as_str()]);
        }
        overlay = overlay.args(["--namespace", env.namespace.as_str()]);

        Self {
            role,
            namespace: env.namespace.clone(),
            api,
            runner,
            kubectl,
            overlay,
        }
    }

    /// Environment for `role` with a Kubernetes API client for its context.
    /// Overlay commands and port-forwards go through `runner`.
    pub async fn connect(
        role: Role,
        config: &Config,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self, ClusterApiError> {
        let env = match role {
            Role::Public => &config.public,
            Role::Private => &config.private,
        };
        let api = KubeClusterApi::connect(env, config.command_timeout).await?;
        info!(
            target: "smoke.environment",
            role = %role,
            context = ?env.context,
            kubeconfig = ?env.kubeconfig,
            "Cluster client ready"
        );
        Ok(Self::from_config(role, config, Arc::new(api), runner))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn runner(&self) -> &Arc<dyn ProcessRunner> {
        &self.runner
    }

    pub async fn create_namespace(&self) -> Result<(), ClusterApiError> {
        self.api.create_namespace(&self.namespace).await?;
        info!(target: "smoke.environment", role = %self.role, namespace = %self.namespace, "Namespace created");
        Ok(())
    }

    pub async fn delete_namespace(&self) -> Result<(), ClusterApiError> {
        self.api.delete_namespace(&self.namespace).await?;
        info!(target: "smoke.environment", role = %self.role, namespace = %self.namespace, "Namespace deleted");
        Ok(())
    }

    pub async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadStatus, ClusterApiError> {
        let status = self.api.create_deployment(&self.namespace, spec).await?;
        info!(
            target: "smoke.environment",
            role = %self.role,
            namespace = %self.namespace,
            deployment = %status.name,
            "Deployment created"
        );
        Ok(status)
    }

    pub async fn list_workloads(&self) -> Result<Vec<WorkloadStatus>, ClusterApiError> {
        self.api.list_deployments(&self.namespace).await
    }

    /// Delete a deployment, blocking until its pods are gone.
    pub async fn delete_workload(&self, name: &str) -> Result<(), ClusterApiError> {
        self.api.delete_deployment(&self.namespace, name).await?;
        info!(target: "smoke.environment", role = %self.role, deployment = %name, "Deployment deleted");
        Ok(())
    }

    pub async fn get_service(&self, name: &str) -> Result<Option<ServiceHandle>, ClusterApiError> {
        self.api.get_service(&self.namespace, name).await
    }

    /// Join the overlay in cluster-local mode.
    pub async fn init_overlay(&self) -> Result<(), LinkError> {
        self.overlay_command(["init", "--cluster-local"]).await?;
        info!(target: "smoke.environment", role = %self.role, "Overlay initialized");
        Ok(())
    }

    /// Expose a deployment's port into the overlay.
    pub async fn expose(&self, deployment: &str, port: u16) -> Result<(), LinkError> {
        let port = port.to_string();
        self.overlay_command(["expose", "--port", port.as_str(), "deployment", deployment])
            .await?;
        info!(target: "smoke.environment", role = %self.role, deployment = %deployment, port = %port, "Deployment exposed");
        Ok(())
    }

    /// Write a connection token for other environments to consume.
    pub async fn issue_token(&self, token: &mut ConnectionToken) -> Result<(), LinkError> {
        match token.state {
            TokenState::Reserved => {}
            TokenState::Issued { issuer } | TokenState::Consumed { issuer, .. } => {
                return Err(LinkError::TokenAlreadyIssued {
                    path: token.path_string(),
                    issuer,
                });
            }
        }

        let path = token.path_string();
        self.overlay_command(["connection-token", path.as_str()])
            .await?;
        token.state = TokenState::Issued { issuer: self.role };
        info!(target: "smoke.environment", role = %self.role, path = %path, "Connection token issued");
        Ok(())
    }

    /// Join the issuer's overlay using `token`. A token is consumed once.
    pub async fn consume_token(&self, token: &mut ConnectionToken) -> Result<(), LinkError> {
        let issuer = match token.state {
            TokenState::Reserved => {
                return Err(LinkError::TokenNotIssued {
                    path: token.path_string(),
                });
            }
            TokenState::Consumed { consumer, .. } => {
                return Err(LinkError::TokenAlreadyConsumed {
                    path: token.path_string(),
                    consumer,
                });
            }
            TokenState::Issued { issuer } => issuer,
        };

        if issuer == self.role {
            return Err(LinkError::SelfLink { role: self.role });
        }

        let path = token.path_string();
        self.overlay_command(["connect", path.as_str()]).await?;
        token.state = TokenState::Consumed {
            issuer,
            consumer: self.role,
        };
        info!(target: "smoke.environment", role = %self.role, issuer = %issuer, "Connected to overlay");
        Ok(())
    }

    /// Remove all overlay state from this environment.
    pub async fn delete_overlay(&self) -> Result<(), CliError> {
        self.overlay_command(["delete"]).await?;
        info!(target: "smoke.environment", role = %self.role, "Overlay deleted");
        Ok(())
    }

    /// Command that forwards `local_port` to `service/<resource>:<remote_port>`.
    pub fn port_forward(&self, resource: &str, local_port: u16, remote_port: u16) -> Invocation {
        self.kubectl.clone().args([
            "port-forward".to_string(),
            "-n".to_string(),
            self.namespace.clone(),
            format!("service/{resource}"),
            format!("{local_port}:{remote_port}"),
        ])
    }

    async fn overlay_command<const N: usize>(&self, args: [&str; N]) -> Result<(), CliError> {
        let invocation = self.overlay.clone().args(args);
        self.runner.run(&invocation).await?;
        Ok(())
    }
}
