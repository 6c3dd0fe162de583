//! Shared data model for the snippet-execution subsystem.
//!
//! Provides the value types exchanged between the documentation pipeline,
//! the validator, the sandbox and the scheduler:
//! - [`Snippet`] - a unit of documentation-embedded source code
//! - [`ExecutionResult`] / [`ExecutionStatus`] - the terminal outcome of a submission
//! - [`Fingerprint`] - content-derived cache key
//! - [`Bindings`] - ordered context-group bindings

pub mod bindings;
pub mod fingerprint;
pub mod result;
pub mod snippet;

pub use bindings::{bindings_fingerprint, BindingValue, Bindings};
pub use fingerprint::{Fingerprint, FingerprintError};
pub use result::{ExecutionResult, ExecutionStatus};
pub use snippet::Snippet;
