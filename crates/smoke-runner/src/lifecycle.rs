//! Smoke run lifecycle.
//!
//! A run moves through a fixed sequence of phases:
//!
//! ```text
//! Idle -> Provisioning -> Linking -> AwaitingReadiness -> Verifying
//!                                                             |
//!          (any failure or panic in an earlier phase) ------> TearingDown -> Done
//! ```
//!
//! `TearingDown` is entered exactly once on every path. `SmokeTestRunner::run`
//! takes the runner by value, so a finished runner cannot be torn down again.
//! Teardown is best effort: every step is attempted even if an earlier one
//! failed, and step failures are reported without replacing the run outcome.

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::environment::{ClusterEnvironment, ConnectionToken, Role, TokenState};
use crate::errors::{ClusterApiError, SmokeError};
use crate::readiness::await_ready;
use crate::transport::{self, ProbeExchange};
use crate::tunnel::open_tunnel;
use crate::workload::WorkloadSpec;

/// Lifecycle phase of a smoke run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Provisioning,
    Linking,
    AwaitingReadiness,
    Verifying,
    TearingDown,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Provisioning => "provisioning",
            Phase::Linking => "linking",
            Phase::AwaitingReadiness => "awaiting readiness",
            Phase::Verifying => "verifying",
            Phase::TearingDown => "tearing down",
            Phase::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// A cleanup action performed during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    DeleteWorkload,
    DeleteOverlay,
    DeleteNamespace,
    RemoveToken,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStep::DeleteWorkload => write!(f, "delete workload"),
            TeardownStep::DeleteOverlay => write!(f, "delete overlay"),
            TeardownStep::DeleteNamespace => write!(f, "delete namespace"),
            TeardownStep::RemoveToken => write!(f, "remove connection token"),
        }
    }
}

/// A teardown step that failed. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub role: Role,
    pub step: TeardownStep,
    pub message: String,
}

/// Result of one smoke run.
#[derive(Debug)]
pub struct RunReport {
    /// `Ok` only if both environments verified.
    pub outcome: Result<(), SmokeError>,
    /// Phases in the order they were entered.
    pub phases: Vec<Phase>,
    pub teardown_failures: Vec<TeardownFailure>,
    /// Environments whose tunnel returned the expected reply.
    pub verified: Vec<Role>,
}

impl RunReport {
    /// Teardown failures do not affect this.
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&SmokeError> {
        self.outcome.as_ref().err()
    }
}

/// Drives one smoke run over a public and a private environment.
pub struct SmokeTestRunner {
    public: ClusterEnvironment,
    private: ClusterEnvironment,
    config: Config,
    workload: WorkloadSpec,
    /// Set once linking starts; teardown removes the file only if issued.
    token: Option<ConnectionToken>,
    phase: Phase,
    phases: Vec<Phase>,
    verified: Vec<Role>,
}

impl SmokeTestRunner {
    pub fn new(public: ClusterEnvironment, private: ClusterEnvironment, config: Config) -> Self {
        let workload = WorkloadSpec::tcp_echo(config.service_port);
        Self {
            public,
            private,
            config,
            workload,
            token: None,
            phase: Phase::Idle,
            phases: vec![Phase::Idle],
            verified: Vec::new(),
        }
    }

    /// Run every phase, then tear down.
    pub async fn run(mut self) -> RunReport {
        info!(
            target: "smoke.lifecycle",
            public_namespace = %self.public.namespace(),
            private_namespace = %self.private.namespace(),
            workload = %self.workload.name,
            "Smoke run starting"
        );

        let outcome = match AssertUnwindSafe(self.setup_and_verify()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(SmokeError::Internal {
                phase: self.phase,
                message: panic_message(panic.as_ref()),
            }),
        };

        if let Err(e) = &outcome {
            error!(
                target: "smoke.lifecycle",
                phase = %e.phase(),
                role = ?e.role(),
                error = %e,
                "Smoke run failed"
            );
        }

        self.enter(Phase::TearingDown);
        let teardown_failures = self.teardown().await;
        self.enter(Phase::Done);

        info!(
            target: "smoke.lifecycle",
            succeeded = outcome.is_ok(),
            verified = ?self.verified,
            teardown_failures = teardown_failures.len(),
            "Smoke run finished"
        );

        RunReport {
            outcome,
            phases: self.phases,
            teardown_failures,
            verified: self.verified,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(target: "smoke.lifecycle", from = %self.phase, to = %phase, "Phase transition");
        self.phase = phase;
        self.phases.push(phase);
        info!(target: "smoke.lifecycle", phase = %phase, "Entering phase");
    }

    async fn setup_and_verify(&mut self) -> Result<(), SmokeError> {
        self.enter(Phase::Provisioning);
        self.provision().await?;

        self.enter(Phase::Linking);
        self.link().await?;

        self.enter(Phase::AwaitingReadiness);
        self.await_services().await?;

        self.enter(Phase::Verifying);
        self.verify_environments().await
    }

    async fn provision(&mut self) -> Result<(), SmokeError> {
        for env in [&self.public, &self.private] {
            env.create_namespace()
                .await
                .map_err(|source| SmokeError::Provisioning {
                    role: env.role(),
                    source,
                })?;
        }

        self.public
            .create_workload(&self.workload)
            .await
            .map_err(|source| SmokeError::Provisioning {
                role: Role::Public,
                source,
            })?;

        // Diagnostic only
        match self.public.list_workloads().await {
            Ok(workloads) => {
                for w in workloads {
                    info!(
                        target: "smoke.lifecycle",
                        namespace = %self.public.namespace(),
                        deployment = %w.name,
                        replicas = w.replicas,
                        ready_replicas = w.ready_replicas,
                        "Deployment present"
                    );
                }
            }
            Err(e) => {
                warn!(target: "smoke.lifecycle", namespace = %self.public.namespace(), error = %e, "Failed to list deployments");
            }
        }

        Ok(())
    }

    async fn link(&mut self) -> Result<(), SmokeError> {
        let link_error = |role: Role| move |source| SmokeError::Linking { role, source };

        self.public
            .init_overlay()
            .await
            .map_err(link_error(Role::Public))?;
        self.public
            .expose(&self.workload.name, self.workload.port)
            .await
            .map_err(link_error(Role::Public))?;

        let token = self
            .token
            .insert(ConnectionToken::reserve(&self.config.token_path));
        self.public
            .issue_token(token)
            .await
            .map_err(link_error(Role::Public))?;

        self.private
            .init_overlay()
            .await
            .map_err(link_error(Role::Private))?;
        self.private
            .consume_token(token)
            .await
            .map_err(link_error(Role::Private))?;

        Ok(())
    }

    async fn await_services(&self) -> Result<(), SmokeError> {
        let budgets = [
            (&self.public, self.config.public_ready_timeout),
            (&self.private, self.config.private_ready_timeout),
        ];

        for (env, budget) in budgets {
            let handle = await_ready(env, &self.workload.name, budget, self.config.ready_poll_interval)
                .await
                .map_err(|source| SmokeError::Readiness {
                    role: env.role(),
                    source,
                })?;

            info!(
                target: "smoke.lifecycle",
                role = %env.role(),
                service = %handle.name,
                internal_address = ?handle.internal_address(self.workload.port),
                "Service available"
            );
        }

        Ok(())
    }

    async fn verify_environments(&mut self) -> Result<(), SmokeError> {
        let config = &self.config;
        let service = self.workload.name.as_str();
        let tunnel_error = |role: Role| move |source| SmokeError::TunnelSetup { role, source };

        let public_tunnel = open_tunnel(&self.public, service, config.public_tunnel_port, config.service_port)
            .map_err(tunnel_error(Role::Public))?;
        let private_tunnel = open_tunnel(&self.private, service, config.private_tunnel_port, config.service_port)
            .map_err(tunnel_error(Role::Private))?;

        let (public_ready, private_ready) = tokio::join!(
            public_tunnel.wait_until_usable(&config.tunnel_wait),
            private_tunnel.wait_until_usable(&config.tunnel_wait),
        );
        public_ready.map_err(tunnel_error(Role::Public))?;
        private_ready.map_err(tunnel_error(Role::Private))?;

        let exchange = ProbeExchange::uppercase_echo(config.probe_payload.as_str());

        // Sequential, public first; the first failure aborts
        for tunnel in [&public_tunnel, &private_tunnel] {
            let role = tunnel.role();
            tunnel.ensure_running().map_err(tunnel_error(role))?;

            let outcome = transport::verify(&tunnel.local_address(), &exchange, &config.transport).await;

            // A reply only counts if the forwarder carried it
            tunnel.ensure_running().map_err(tunnel_error(role))?;
            let reply = outcome.map_err(|source| SmokeError::Verification { role, source })?;

            info!(target: "smoke.lifecycle", role = %role, reply = %reply.text(), "Environment verified");
            self.verified.push(role);
        }

        public_tunnel.close();
        private_tunnel.close();
        Ok(())
    }

    async fn teardown(&mut self) -> Vec<TeardownFailure> {
        let mut failures = Vec::new();

        // The workload lives in the public environment only
        match self.public.delete_workload(&self.workload.name).await {
            Ok(()) => {}
            Err(ClusterApiError::NotFound { .. }) => {
                debug!(target: "smoke.lifecycle", deployment = %self.workload.name, "Deployment already gone");
            }
            Err(e) => failures.push(teardown_failure(Role::Public, TeardownStep::DeleteWorkload, &e)),
        }

        for env in [&self.public, &self.private] {
            if let Err(e) = env.delete_overlay().await {
                failures.push(teardown_failure(env.role(), TeardownStep::DeleteOverlay, &e));
            }
        }

        for env in [&self.public, &self.private] {
            if let Err(e) = env.delete_namespace().await {
                failures.push(teardown_failure(env.role(), TeardownStep::DeleteNamespace, &e));
            }
        }

        if let Some(token) = self.token.as_ref().filter(|t| t.state() != TokenState::Reserved) {
            match tokio::fs::remove_file(token.path()).await {
                Ok(()) => {
                    debug!(target: "smoke.lifecycle", path = %token.path().display(), "Connection token removed");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => failures.push(teardown_failure(Role::Public, TeardownStep::RemoveToken, &e)),
            }
        }

        failures
    }
}

fn teardown_failure(role: Role, step: TeardownStep, error: &dyn fmt::Display) -> TeardownFailure {
    warn!(target: "smoke.lifecycle", role = %role, step = %step, error = %error, "Teardown step failed");
    TeardownFailure {
        role,
        step,
        message: error.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
