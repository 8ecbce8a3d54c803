//! # Smoke Test Utilities
//!
//! Shared test utilities for the overlay smoke runner.
//!
//! Lets the full lifecycle run without clusters: cluster and CLI calls go to
//! the in-memory mocks from `smoke_runner::{cluster, process}::mock`, and
//! port-forwards are replaced by local TCP peers.
//!
//! ## Modules
//!
//! - `echo_peer` - TCP peers with configurable reply behavior
//! - `harness` - Two-environment harness with a shared call journal
//!
//! ## Usage
//!
//! ```rust,ignore
//! use smoke_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::new();
//!     harness.forward_tunnels(Role::Private, EchoBehavior::Verbatim);
//!
//!     let report = harness.runner().run().await;
//!     assert!(!report.succeeded());
//! }
//! ```

pub mod echo_peer;
pub mod harness;

pub use echo_peer::{free_port, EchoBehavior, EchoPeer};
pub use harness::{local_port, TestHarness};
