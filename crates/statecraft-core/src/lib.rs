//! Statecraft core: an interpreter for Amazon States Language machines.
//!
//! This crate contains the engine:
//! - `definition` -- machine construction and structural validation
//! - `path` -- reference-path parsing and document addressing
//! - `intrinsics` -- the `States.*` function library
//! - `template` -- `Parameters` / `ResultSelector` payload templates
//! - `pipeline` -- the six-stage I/O filter sequence around every state
//! - `choice` -- choice rule evaluation (comparators and combinators)
//! - `retry` -- retrier/catcher matching and backoff arithmetic
//! - `task` -- the task execution boundary and shared execution context
//! - `executor` -- the execution record and transition loop
//! - `parallel` -- concurrent branch execution with ordered output merge
//!
//! The crate performs no I/O of its own: side effects happen inside the
//! caller-supplied [`task::TaskExecutor`].

pub mod choice;
pub mod definition;
pub mod executor;
pub mod intrinsics;
pub mod parallel;
pub mod path;
pub mod pipeline;
pub mod retry;
pub mod task;
pub mod template;

pub use definition::{DefinitionError, Machine};
pub use executor::Execution;
pub use task::{ExecutionContext, FnTaskExecutor, ParallelOutputMode, TaskError, TaskExecutor};
