//! Readiness polling for overlay services.
//!
//! The overlay creates the exposed service asynchronously in every linked
//! environment. `await_ready` blocks until it exists or the caller's budget
//! runs out. Budgets differ per call site: the public side waits for
//! provisioning plus overlay init, the private side only for link
//! propagation.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cluster::ServiceHandle;
use crate::environment::ClusterEnvironment;
use crate::errors::ReadinessError;

/// Poll `env` for service `resource` until found or `timeout` elapses.
///
/// Checks once immediately, then every `interval` (capped at the remaining
/// budget). A zero budget with an absent service times out after that first
/// check. Lookup failures abort at once; only "not found yet" is retried.
pub async fn await_ready(
    env: &ClusterEnvironment,
    resource: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<ServiceHandle, ReadinessError> {
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match env.get_service(resource).await {
            Ok(Some(handle)) => {
                info!(
                    target: "smoke.readiness",
                    role = %env.role(),
                    service = %resource,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Service ready"
                );
                return Ok(handle);
            }
            Ok(None) => {
                debug!(target: "smoke.readiness", role = %env.role(), service = %resource, attempts, "Service not found yet");
            }
            Err(source) => {
                warn!(target: "smoke.readiness", role = %env.role(), service = %resource, error = %source, "Service lookup failed");
                return Err(ReadinessError::Query {
                    resource: resource.to_string(),
                    source,
                });
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ReadinessError::Timeout {
                resource: resource.to_string(),
                waited: elapsed,
            });
        }

        sleep(interval.min(timeout - elapsed)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cluster::mock::{MockClusterApi, MockOp};
    use crate::environment::Role;
    use crate::process::mock::{CallJournal, MockProcessRunner};
    use std::sync::Arc;

    fn environment(api: Arc<MockClusterApi>) -> ClusterEnvironment {
        ClusterEnvironment::new(
            Role::Private,
            "private",
            api,
            Arc::new(MockProcessRunner::new("private", CallJournal::new())),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately() {
        let api = Arc::new(
            MockClusterApi::new("private", CallJournal::new()).with_service("tcp-go-echo", "10.0.0.7"),
        );
        let env = environment(Arc::clone(&api));

        let handle = await_ready(&env, "tcp-go-echo", Duration::from_secs(180), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(handle.cluster_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(api.service_lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_on_first_successful_poll() {
        let api = Arc::new(
            MockClusterApi::new("private", CallJournal::new())
                .with_service_after("tcp-go-echo", "10.0.0.7", 3),
        );
        let env = environment(Arc::clone(&api));

        let start = Instant::now();
        await_ready(&env, "tcp-go-echo", Duration::from_secs(180), Duration::from_secs(2))
            .await
            .unwrap();

        // Three misses, three intervals, then found
        assert_eq!(api.service_lookups(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_times_out_immediately() {
        let api = Arc::new(MockClusterApi::new("private", CallJournal::new()));
        let env = environment(Arc::clone(&api));

        let start = Instant::now();
        let err = await_ready(&env, "tcp-go-echo", Duration::ZERO, Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(matches!(err, ReadinessError::Timeout { ref resource, .. } if resource == "tcp-go-echo"));
        assert_eq!(api.service_lookups(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_within_budget() {
        let api = Arc::new(MockClusterApi::new("private", CallJournal::new()));
        let env = environment(Arc::clone(&api));

        let start = Instant::now();
        let err = await_ready(&env, "tcp-go-echo", Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap_err();

        match err {
            ReadinessError::Timeout { waited, .. } => assert_eq!(waited, Duration::from_secs(5)),
            other => panic!("expected timeout, got {other:?}"),
        }
        // Last sleep is capped at the remaining budget
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_failure_is_distinct_from_timeout() {
        let api = Arc::new(MockClusterApi::new("private", CallJournal::new()));
        api.fail(MockOp::GetService, "connection refused");
        let env = environment(Arc::clone(&api));

        let err = await_ready(&env, "tcp-go-echo", Duration::from_secs(180), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::Query { .. }));
        assert_eq!(api.service_lookups(), 0);
    }
}
