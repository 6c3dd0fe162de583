//! Orchestration layer for sandboxed snippet execution
//!
//! [`ConcurrencyScheduler`] is the single entry point the documentation
//! pipeline talks to: it resolves policies, serializes snippets that share
//! a context group in document order, dispatches independent snippets to a
//! bounded worker pool in parallel, and caches results across incremental
//! builds.

pub mod cache;
pub mod metrics;
pub mod scheduler;

pub use cache::{CachedExecution, ResultCache};
pub use metrics::{BuildMetrics, MetricsSnapshot};
pub use scheduler::{ConcurrencyScheduler, SchedulerConfig, SubmitError};
