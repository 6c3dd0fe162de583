//! Bounded worker execution of validated snippets
//!
//! The executor runs each validated snippet in an isolated subprocess with
//! a hard wall-clock timeout, a sampled memory ceiling and no network
//! capability unless the policy grants it. Context-group bindings are
//! injected as the worker's initial environment; new bindings come back in
//! a sentinel-marked envelope and are applied atomically on success only.
//!
//! Timeouts and memory breaches always take the hard-termination path
//! (`start_kill`), never a cooperative signal: post-validation code may
//! still loop tightly or block.

pub mod context;
pub mod executor;
pub mod harness;

pub use context::{ContextError, ContextGroup, ContextRegistry, GroupLease};
pub use executor::{SandboxError, SandboxExecutor, SandboxRun};
pub use harness::{PythonBackend, WorkerBackend, WorkerEnvelope, WorkerJob};
