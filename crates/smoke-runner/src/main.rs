//! Overlay smoke runner
//!
//! Runs the cross-cluster overlay smoke test once against two kube contexts
//! and exits with its outcome.
//!
//! # Exit codes
//!
//! - `0`: both environments verified
//! - `1`: the run failed (teardown still ran)
//! - `2`: invalid configuration or unusable kubeconfig, nothing was touched
//!
//! # Startup Flow
//!
//! 1. Initialize tracing (`RUST_LOG`, `SMOKE_LOG_JSON`)
//! 2. Load configuration from environment
//! 3. Connect a Kubernetes client per context and build the two environments
//! 4. Run the lifecycle and report

use std::process::ExitCode;
use std::sync::Arc;

use smoke_runner::config::Config;
use smoke_runner::environment::{ClusterEnvironment, Role};
use smoke_runner::lifecycle::SmokeTestRunner;
use smoke_runner::process::{ProcessRunner, SystemProcessRunner};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();
    init_tracing(config.as_ref().is_ok_and(|c| c.json_logs));

    info!("Starting overlay smoke run");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    info!(
        public_namespace = %config.public.namespace,
        private_namespace = %config.private.namespace,
        public_context = ?config.public.context,
        private_context = ?config.private.context,
        token_path = %config.token_path.display(),
        service_port = config.service_port,
        public_tunnel_port = config.public_tunnel_port,
        private_tunnel_port = config.private_tunnel_port,
        tunnel_wait = ?config.tunnel_wait,
        read_strategy = ?config.transport.read_strategy,
        "Configuration loaded successfully"
    );

    let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner::new(config.command_timeout));
    let (public, private) = match tokio::try_join!(
        ClusterEnvironment::connect(Role::Public, &config, Arc::clone(&runner)),
        ClusterEnvironment::connect(Role::Private, &config, runner),
    ) {
        Ok(environments) => environments,
        Err(e) => {
            error!("Failed to build cluster client: {}", e);
            return ExitCode::from(2);
        }
    };

    let report = SmokeTestRunner::new(public, private, config).run().await;

    for failure in &report.teardown_failures {
        warn!(
            role = %failure.role,
            step = %failure.step,
            error = %failure.message,
            "Leftover resources may need manual cleanup"
        );
    }

    match &report.outcome {
        Ok(()) => {
            info!(verified = ?report.verified, "Smoke run passed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(phase = %e.phase(), role = ?e.role(), error = %e, "Smoke run failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "smoke=info".into());

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
