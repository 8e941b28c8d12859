//! Trellis - CRD-driven ingress control plane for a data-plane proxy fleet
//!
//! Trellis watches routing-intent custom resources (TrellisProxy,
//! TrellisCertificateDelegation) together with the Secrets, Services and
//! Endpoints they reference, compiles them into a validated routing graph,
//! and publishes a generation-numbered configuration snapshot that proxy
//! subscribers read concurrently. Per-object validity is written back to the
//! cluster as status conditions.
//!
//! # Architecture
//!
//! The pipeline is event driven:
//!
//! - Watch events mutate the [`cache`] (single writer)
//! - The [`trigger`] coalesces bursts of events into single-flight rebuilds
//! - Each rebuild runs the pure [`dag`] builder over a point-in-time cache
//!   snapshot, producing the routing graph and a status verdict per object
//! - The [`snapshot`] renderer turns the graph into sorted wire resources
//!   and publishes them atomically for subscribers
//! - The [`status`] reconciler writes verdicts back with conflict-safe,
//!   deduplicated updates
//!
//! Validation failures (hostname conflicts, include cycles, missing
//! delegations, malformed backends) are carried as per-object status data
//! and never abort a rebuild.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (TrellisProxy, TrellisCertificateDelegation)
//! - [`cache`] - Indexed mirror of watched objects with snapshot isolation
//! - [`trigger`] - Debounced, single-flight rebuild scheduling
//! - [`dag`] - Routing graph builder (pure, deterministic)
//! - [`snapshot`] - Snapshot rendering and atomic publication
//! - [`status`] - Status write-back with optimistic concurrency
//! - [`watch`] - Kubernetes watch boundary feeding the cache
//! - [`serve`] - Subscriber-facing snapshot endpoint
//! - [`retry`] - Bounded backoff for transient store errors
//! - [`error`] - Error types for the control plane

#![deny(missing_docs)]

pub mod cache;
pub mod crd;
pub mod dag;
pub mod error;
pub mod retry;
pub mod serve;
pub mod snapshot;
pub mod status;
pub mod trigger;
pub mod watch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout Trellis.
// Centralizing them here ensures consistency across CLI defaults and
// test fixtures.

/// Default idle debounce window for the rebuild trigger, in milliseconds.
///
/// Each change notification re-arms a timer of this length; when it fires
/// with no further notifications, one rebuild is dispatched.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Maximum coalescing window, in milliseconds.
///
/// A sustained stream of notifications cannot postpone a rebuild past this
/// bound, measured from the first pending notification.
pub const DEFAULT_MAX_COALESCE_MS: u64 = 500;

/// Default bound on status-write retry attempts after a version conflict
pub const DEFAULT_STATUS_RETRY_ATTEMPTS: u32 = 4;

/// Default port for the subscriber-facing snapshot endpoint
pub const DEFAULT_SERVE_PORT: u16 = 8090;
