//! Live smoke run against real clusters.
//!
//! Uses the same environment variables as the binary (`SMOKE_PUBLIC_CONTEXT`,
//! `SMOKE_PRIVATE_CONTEXT`, ...). Run with:
//!
//! ```text
//! cargo test -p smoke-runner --features live-cluster --test live_cluster
//! ```

#![cfg(feature = "live-cluster")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use smoke_runner::config::Config;
use smoke_runner::environment::{ClusterEnvironment, Role};
use smoke_runner::lifecycle::SmokeTestRunner;
use smoke_runner::process::{ProcessRunner, SystemProcessRunner};

#[tokio::test]
async fn test_overlay_connectivity() {
    let config = Config::from_env().expect("Invalid SMOKE_* configuration");
    let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner::new(config.command_timeout));

    let public = ClusterEnvironment::connect(Role::Public, &config, Arc::clone(&runner))
        .await
        .expect("public kubeconfig context is usable");
    let private = ClusterEnvironment::connect(Role::Private, &config, runner)
        .await
        .expect("private kubeconfig context is usable");

    let report = SmokeTestRunner::new(public, private, config).run().await;

    assert!(report.teardown_failures.is_empty(), "{:?}", report.teardown_failures);
    assert!(report.succeeded(), "{:?}", report.outcome);
    assert_eq!(report.verified, vec![Role::Public, Role::Private]);
}
