//! Port-forward tunnels into an environment.
//!
//! `open_tunnel` starts the forwarder in the background and returns at once.
//! A returned handle is not yet usable: callers wait with
//! `TunnelHandle::wait_until_usable` before sending traffic, and keep the
//! handle alive until verification through it has finished. Dropping the
//! handle stops the forwarder.
//!
//! In probe mode a tunnel counts as usable only after kubectl has announced
//! its own listener on the IPv4 loopback address and a connection to that
//! address succeeds. Any other process already listening on the local port
//! accepts connections too, so a connect alone never proves the forwarder is
//! up.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::environment::{ClusterEnvironment, Role};
use crate::errors::TunnelSetupError;
use crate::process::BackgroundProcess;

/// Longest pause between two readiness probes.
const MAX_PROBE_DELAY: Duration = Duration::from_secs(1);

/// How to decide that a freshly opened tunnel accepts traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelWait {
    /// Sleep a fixed grace period, then check the forwarder is still alive.
    FixedDelay(Duration),
    /// Wait for the forwarder to announce the local listener, then
    /// connect-and-close against it, with exponential backoff starting at
    /// `interval`, for at most `timeout`.
    Probe { timeout: Duration, interval: Duration },
}

/// A running local-to-remote forward.
#[derive(Debug)]
pub struct TunnelHandle {
    role: Role,
    resource: String,
    local_addr: SocketAddr,
    process: BackgroundProcess,
}

/// Start forwarding `127.0.0.1:<local_port>` to `service/<resource>:<remote_port>`
/// in `env`. Non-blocking.
pub fn open_tunnel(
    env: &ClusterEnvironment,
    resource: &str,
    local_port: u16,
    remote_port: u16,
) -> Result<TunnelHandle, TunnelSetupError> {
    let invocation = env.port_forward(resource, local_port, remote_port);
    let process = env
        .runner()
        .spawn(&invocation)
        .map_err(|source| TunnelSetupError::Spawn {
            resource: resource.to_string(),
            source,
        })?;

    info!(
        target: "smoke.tunnel",
        role = %env.role(),
        service = %resource,
        local_port,
        remote_port,
        "Tunnel started"
    );

    Ok(TunnelHandle {
        role: env.role(),
        resource: resource.to_string(),
        local_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)),
        process,
    })
}

impl TunnelHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    /// `127.0.0.1:<port>` for the transport verifier.
    pub fn local_address(&self) -> String {
        self.local_addr.to_string()
    }

    /// Fail if the forwarder has exited.
    pub fn ensure_running(&self) -> Result<(), TunnelSetupError> {
        match self.process.exit_reason() {
            None => Ok(()),
            Some(reason) => {
                warn!(
                    target: "smoke.tunnel",
                    role = %self.role,
                    command = %self.process.command(),
                    reason = %reason,
                    "Tunnel forwarder exited"
                );
                Err(TunnelSetupError::Exited {
                    resource: self.resource.clone(),
                    reason,
                })
            }
        }
    }

    /// True once kubectl reports listening on our IPv4 loopback address.
    fn forwarder_listening(&self) -> bool {
        self.process
            .printed(&format!("Forwarding from {} ->", self.local_addr))
    }

    /// Block until the tunnel can carry traffic.
    pub async fn wait_until_usable(&self, wait: &TunnelWait) -> Result<(), TunnelSetupError> {
        match wait {
            TunnelWait::FixedDelay(grace) => {
                sleep(*grace).await;
                self.ensure_running()
            }
            TunnelWait::Probe {
                timeout: budget,
                interval,
            } => self.probe_until_accepting(*budget, *interval).await,
        }
    }

    async fn probe_until_accepting(
        &self,
        budget: Duration,
        interval: Duration,
    ) -> Result<(), TunnelSetupError> {
        let start = Instant::now();
        let mut delay = interval;
        let mut attempts: u32 = 0;

        loop {
            self.ensure_running()?;
            attempts += 1;

            if self.forwarder_listening() && self.accepts_connection(delay).await {
                // A forwarder that failed to bind may still be on its way out
                self.ensure_running()?;
                info!(
                    target: "smoke.tunnel",
                    role = %self.role,
                    local_addr = %self.local_addr,
                    attempts,
                    "Tunnel accepting connections"
                );
                return Ok(());
            }
            debug!(
                target: "smoke.tunnel",
                role = %self.role,
                local_addr = %self.local_addr,
                listening = self.forwarder_listening(),
                attempts,
                "Tunnel not usable yet"
            );

            let elapsed = start.elapsed();
            if elapsed >= budget {
                return Err(TunnelSetupError::NotReady {
                    resource: self.resource.clone(),
                    local_addr: self.local_addr,
                    waited: elapsed,
                });
            }

            sleep(delay.min(budget - elapsed)).await;
            delay = delay.saturating_mul(2).min(MAX_PROBE_DELAY);
        }
    }

    async fn accepts_connection(&self, delay: Duration) -> bool {
        let attempt_timeout = delay.max(Duration::from_millis(100));
        matches!(
            timeout(attempt_timeout, TcpStream::connect(self.local_addr)).await,
            Ok(Ok(_))
        )
    }

    /// Stop the forwarder now instead of on drop.
    pub fn close(self) {
        self.process.stop();
        debug!(target: "smoke.tunnel", role = %self.role, local_addr = %self.local_addr, "Tunnel closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cluster::mock::MockClusterApi;
    use crate::process::mock::{controlled_process, exited_process, CallJournal, MockProcessRunner};
    use crate::process::{Invocation, ProcessRunner, SystemProcessRunner};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const CONNECT_CHECK: TunnelWait = TunnelWait::Probe {
        timeout: Duration::from_secs(5),
        interval: Duration::from_millis(10),
    };

    fn environment(runner: &Arc<MockProcessRunner>, journal: &CallJournal) -> ClusterEnvironment {
        ClusterEnvironment::new(
            Role::Public,
            "public",
            Arc::new(MockClusterApi::new("public", journal.clone())),
            Arc::clone(runner) as Arc<dyn ProcessRunner>,
        )
    }

    /// Spawn hook whose forwarders announce their listener like kubectl does.
    fn announcing_runner(journal: &CallJournal) -> Arc<MockProcessRunner> {
        let runner = Arc::new(MockProcessRunner::new("public", journal.clone()));
        runner.on_spawn(|invocation| {
            let mapping = invocation.args.last().cloned().unwrap_or_default();
            let (local, remote) = mapping.split_once(':').unwrap();
            let (process, control) = controlled_process(invocation.to_string());
            control.print(format!("Forwarding from 127.0.0.1:{local} -> {remote}"));
            control.print(format!("Forwarding from [::1]:{local} -> {remote}"));
            Ok(process)
        });
        runner
    }

    fn handle(process: BackgroundProcess, port: u16) -> TunnelHandle {
        TunnelHandle {
            role: Role::Public,
            resource: "tcp-go-echo".to_string(),
            local_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            process,
        }
    }

    #[tokio::test]
    async fn test_open_tunnel_spawns_port_forward() {
        let journal = CallJournal::new();
        let runner = Arc::new(MockProcessRunner::new("public", journal.clone()));
        let env = environment(&runner, &journal);

        let tunnel = open_tunnel(&env, "tcp-go-echo", 9090, 9090).unwrap();
        assert_eq!(tunnel.local_address(), "127.0.0.1:9090");
        assert_eq!(tunnel.role(), Role::Public);
        assert!(tunnel.ensure_running().is_ok());
        assert_eq!(
            journal.entries(),
            vec!["public: spawn kubectl port-forward -n public service/tcp-go-echo 9090:9090".to_string()]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_immediately() {
        let journal = CallJournal::new();
        let runner = Arc::new(MockProcessRunner::new("public", journal.clone()));
        runner.fail_on(&["port-forward"], "kubectl not found");
        let env = environment(&runner, &journal);

        let err = open_tunnel(&env, "tcp-go-echo", 9090, 9090).unwrap_err();
        assert!(matches!(err, TunnelSetupError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_exited_forwarder_surfaces_on_first_use() {
        let journal = CallJournal::new();
        let runner = Arc::new(MockProcessRunner::new("public", journal.clone()));
        runner.on_spawn(|invocation| {
            Ok(exited_process(
                invocation.to_string(),
                "unable to listen on port 9090: address already in use",
            ))
        });
        let env = environment(&runner, &journal);

        let tunnel = open_tunnel(&env, "tcp-go-echo", 9090, 9090).unwrap();
        let err = tunnel
            .wait_until_usable(&TunnelWait::FixedDelay(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelSetupError::Exited { ref reason, .. } if reason.contains("already in use")));
    }

    #[tokio::test]
    async fn test_probe_succeeds_once_forwarder_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let journal = CallJournal::new();
        let runner = announcing_runner(&journal);
        let env = environment(&runner, &journal);

        let tunnel = open_tunnel(&env, "tcp-go-echo", port, 9090).unwrap();
        tunnel.wait_until_usable(&CONNECT_CHECK).await.unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_waits_for_forwarder_announcement() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (process, control) = controlled_process("kubectl port-forward");
        let tunnel = handle(process, port);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            // IPv6 alone does not cover the address we connect to
            control.print(format!("Forwarding from [::1]:{port} -> 9090"));
            tokio::time::sleep(Duration::from_millis(150)).await;
            control.print(format!("Forwarding from 127.0.0.1:{port} -> 9090"));
            control.stop_token().cancelled().await;
        });

        let start = Instant::now();
        tunnel.wait_until_usable(&CONNECT_CHECK).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_occupied_port_is_not_reported_usable() {
        // Another process owns the local port and accepts connections
        let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = squatter.local_addr().unwrap().port();
        let (process, control) = controlled_process("kubectl port-forward");
        let tunnel = handle(process, port);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            control.exit("exit status: 1");
        });

        let err = tunnel.wait_until_usable(&CONNECT_CHECK).await.unwrap_err();
        assert!(matches!(err, TunnelSetupError::Exited { ref reason, .. } if reason == "exit status: 1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_forwarder_process_on_occupied_port() {
        let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = squatter.local_addr().unwrap().port();
        let process = SystemProcessRunner::new(Duration::from_secs(5))
            .spawn(&Invocation::new("sh").args([
                "-c",
                "echo 'Unable to listen on port: address already in use' >&2; sleep 0.3; exit 1",
            ]))
            .unwrap();
        let tunnel = handle(process, port);

        let err = tunnel.wait_until_usable(&CONNECT_CHECK).await.unwrap_err();
        assert!(matches!(err, TunnelSetupError::Exited { ref reason, .. } if reason.contains('1')));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_announcing_forwarder_process_is_usable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let script = format!("echo 'Forwarding from 127.0.0.1:{port} -> 9090'; sleep 5");
        let process = SystemProcessRunner::new(Duration::from_secs(5))
            .spawn(&Invocation::new("sh").args(["-c", script.as_str()]))
            .unwrap();
        let tunnel = handle(process, port);

        tunnel.wait_until_usable(&CONNECT_CHECK).await.unwrap();
        tunnel.close();
    }

    #[tokio::test]
    async fn test_probe_gives_up_after_budget() {
        // Reserve a port, then free it so nothing listens there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let journal = CallJournal::new();
        let runner = announcing_runner(&journal);
        let env = environment(&runner, &journal);

        let tunnel = open_tunnel(&env, "tcp-go-echo", port, 9090).unwrap();
        let err = tunnel
            .wait_until_usable(&TunnelWait::Probe {
                timeout: Duration::from_millis(300),
                interval: Duration::from_millis(20),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelSetupError::NotReady { .. }));
    }
}
