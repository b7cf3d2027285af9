#![deny(missing_docs)]

//! Shared error types, identifiers, configuration, and observability
//! primitives for quarry crates.
//!
//! Architecture role:
//! - defines the [`QuarryError`] / [`Result`] contracts used across layers
//! - provides strongly-typed query/stage/task identifiers
//! - hosts output-buffer configuration passed at task construction
//! - hosts the task-lifecycle metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Output-buffer configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::OutputBufferLimits;
pub use error::{QuarryError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
