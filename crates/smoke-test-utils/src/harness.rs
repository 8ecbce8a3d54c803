//! Two-environment test harness.
//!
//! `TestHarness` wires a public and a private `ClusterEnvironment` over
//! in-memory mocks that share one `CallJournal`, with a configuration tuned
//! for tests (short budgets, free tunnel ports). Port-forwards are faked by
//! starting an `EchoPeer` on the tunnel's local port and announcing it the
//! way kubectl does, so the transport verifier talks to a real socket.
//!
//! # Example
//!
//! ```rust,ignore
//! let harness = TestHarness::new();
//! harness.private_runner.fail_on(&["connect"], "token rejected");
//!
//! let report = harness.runner().run().await;
//! assert!(!report.succeeded());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use smoke_runner::cluster::mock::MockClusterApi;
use smoke_runner::cluster::ClusterApi;
use smoke_runner::config::Config;
use smoke_runner::environment::{ClusterEnvironment, Role};
use smoke_runner::errors::CliError;
use smoke_runner::lifecycle::SmokeTestRunner;
use smoke_runner::process::mock::{controlled_process, CallJournal, MockProcessRunner};
use smoke_runner::process::{Invocation, ProcessRunner};
use smoke_runner::workload::ECHO_WORKLOAD_NAME;

use crate::echo_peer::{free_port, EchoBehavior, EchoPeer};

/// Mocks and configuration for one smoke run.
pub struct TestHarness {
    pub journal: CallJournal,
    pub public_api: Arc<MockClusterApi>,
    pub private_api: Arc<MockClusterApi>,
    pub public_runner: Arc<MockProcessRunner>,
    pub private_runner: Arc<MockProcessRunner>,
    vars: HashMap<String, String>,
}

impl TestHarness {
    /// Services present in both environments, both tunnels forwarding to
    /// upper-casing echo peers.
    pub fn new() -> Self {
        let journal = CallJournal::new();
        Self::with_apis(
            journal.clone(),
            MockClusterApi::new("public", journal.clone()).with_service(ECHO_WORKLOAD_NAME, "10.96.0.10"),
            MockClusterApi::new("private", journal).with_service(ECHO_WORKLOAD_NAME, "10.96.0.20"),
        )
    }

    /// Harness over caller-built cluster mocks. They must record into
    /// `journal`.
    pub fn with_apis(journal: CallJournal, public_api: MockClusterApi, private_api: MockClusterApi) -> Self {
        let harness = Self {
            public_runner: Arc::new(MockProcessRunner::new("public", journal.clone())),
            private_runner: Arc::new(MockProcessRunner::new("private", journal.clone())),
            public_api: Arc::new(public_api),
            private_api: Arc::new(private_api),
            journal,
            vars: default_vars(),
        };
        harness.forward_tunnels(Role::Public, EchoBehavior::Uppercase);
        harness.forward_tunnels(Role::Private, EchoBehavior::Uppercase);
        harness
    }

    /// Override a configuration variable.
    #[must_use]
    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    /// Serve `role`'s port-forwards with an echo peer of `behavior`.
    pub fn forward_tunnels(&self, role: Role, behavior: EchoBehavior) {
        self.process_runner(role).on_spawn(move |invocation| {
            let port = local_port(invocation).expect("port-forward invocation ends with local:remote");
            let peer = EchoPeer::start_on(port, behavior.clone()).map_err(|source| CliError::Spawn {
                command: invocation.to_string(),
                source,
            })?;

            let (process, control) = controlled_process(invocation.to_string());
            control.print(format!("Forwarding from 127.0.0.1:{port} -> {}", remote_port(invocation)));

            // Peer lives until the tunnel handle stops the fake forwarder
            let stopped = control.stop_token();
            tokio::spawn(async move {
                stopped.cancelled().await;
                drop(peer);
            });
            Ok(process)
        });
    }

    pub fn process_runner(&self, role: Role) -> &Arc<MockProcessRunner> {
        match role {
            Role::Public => &self.public_runner,
            Role::Private => &self.private_runner,
        }
    }

    pub fn cluster_api(&self, role: Role) -> &Arc<MockClusterApi> {
        match role {
            Role::Public => &self.public_api,
            Role::Private => &self.private_api,
        }
    }

    pub fn config(&self) -> Config {
        Config::from_vars(&self.vars).expect("harness configuration is valid")
    }

    pub fn environment(&self, role: Role) -> ClusterEnvironment {
        ClusterEnvironment::new(
            role,
            role.to_string(),
            Arc::clone(self.cluster_api(role)) as Arc<dyn ClusterApi>,
            Arc::clone(self.process_runner(role)) as Arc<dyn ProcessRunner>,
        )
    }

    pub fn runner(&self) -> SmokeTestRunner {
        SmokeTestRunner::new(
            self.environment(Role::Public),
            self.environment(Role::Private),
            self.config(),
        )
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn default_vars() -> HashMap<String, String> {
    let public_port = free_port();
    let mut private_port = free_port();
    while private_port == public_port {
        private_port = free_port();
    }

    HashMap::from([
        ("SMOKE_PUBLIC_TUNNEL_PORT".to_string(), public_port.to_string()),
        ("SMOKE_PRIVATE_TUNNEL_PORT".to_string(), private_port.to_string()),
        ("SMOKE_PUBLIC_READY_TIMEOUT_SECONDS".to_string(), "1".to_string()),
        ("SMOKE_PRIVATE_READY_TIMEOUT_SECONDS".to_string(), "1".to_string()),
        ("SMOKE_READY_POLL_INTERVAL_MS".to_string(), "10".to_string()),
        ("SMOKE_TUNNEL_WAIT".to_string(), "probe".to_string()),
        ("SMOKE_TUNNEL_PROBE_TIMEOUT_SECONDS".to_string(), "2".to_string()),
        ("SMOKE_CONNECT_TIMEOUT_SECONDS".to_string(), "2".to_string()),
        ("SMOKE_READ_TIMEOUT_SECONDS".to_string(), "2".to_string()),
    ])
}

/// Local port of a `kubectl port-forward ... local:remote` invocation.
pub fn local_port(invocation: &Invocation) -> Option<u16> {
    invocation
        .args
        .last()
        .and_then(|mapping| mapping.split(':').next())
        .and_then(|port| port.parse().ok())
}

fn remote_port(invocation: &Invocation) -> &str {
    invocation
        .args
        .last()
        .and_then(|mapping| mapping.split_once(':'))
        .map_or("", |(_, remote)| remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_port_parsing() {
        let invocation = Invocation::new("kubectl").args(["port-forward", "service/tcp-go-echo", "9091:9090"]);
        assert_eq!(local_port(&invocation), Some(9091));
        assert_eq!(local_port(&Invocation::new("kubectl")), None);
    }

    #[test]
    fn test_harness_config_uses_distinct_tunnel_ports() {
        let config = TestHarness::new().config();
        assert_ne!(config.public_tunnel_port, config.private_tunnel_port);
    }
}
