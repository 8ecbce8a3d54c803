//! Overlay smoke runner library.
//!
//! End-to-end connectivity check for a cross-cluster service overlay:
//!
//! - Provisions a TCP echo workload in the "public" environment
//! - Links the "private" environment to it through the overlay
//! - Waits for the exposed service to appear in both environments
//! - Sends a probe through a port-forward tunnel into each environment and
//!   checks the echoed reply
//! - Tears everything down again, whatever happened before
//!
//! # Architecture
//!
//! ```text
//! SmokeTestRunner (lifecycle state machine)
//! ├── ClusterEnvironment (public)  ── ClusterApi + ProcessRunner
//! ├── ClusterEnvironment (private) ── ClusterApi + ProcessRunner
//! ├── readiness::await_ready       (service polling)
//! ├── tunnel::open_tunnel          (port-forward lifetime)
//! └── transport::verify            (TCP probe exchange)
//! ```
//!
//! The Kubernetes API is reached through `ClusterApi` (backed by a `kube`
//! client), the overlay CLI and `kubectl port-forward` through
//! `ProcessRunner`. Both traits have in-memory mocks for tests.
//!
//! # Modules
//!
//! - [`cluster`] - Namespace, deployment and service access per context
//! - [`config`] - Configuration from environment
//! - [`environment`] - Per-cluster facade and the one-time connection token
//! - [`errors`] - Error types with stage and environment attribution
//! - [`lifecycle`] - Phase sequencing and guaranteed teardown
//! - [`process`] - External command execution and background processes
//! - [`readiness`] - Polling until a service exists
//! - [`transport`] - TCP probe exchange and reply check
//! - [`tunnel`] - Port-forward lifetime and usability wait
//! - [`workload`] - Echo workload template and observed status

pub mod cluster;
pub mod config;
pub mod environment;
pub mod errors;
pub mod lifecycle;
pub mod process;
pub mod readiness;
pub mod transport;
pub mod tunnel;
pub mod workload;
