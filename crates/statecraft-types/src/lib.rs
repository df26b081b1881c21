//! Shared domain types for Statecraft.
//!
//! This crate contains the canonical intermediate representation for state
//! machine definitions (the parsed Amazon States Language tree), execution
//! tracking types, and the protocol error record with its reserved
//! `States.*` error names.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod error;
pub mod execution;
pub mod machine;
