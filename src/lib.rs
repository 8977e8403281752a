//! # Taskloom
//!
//! Taskloom is a persistent, concurrency-safe task orchestration engine.
//! User-approved features are decomposed into a directed acyclic graph of
//! tasks, scheduled across a pool of registered agents honoring priority,
//! dependencies, and resource constraints, with user-supplied lifecycle
//! hooks able to block, modify, or observe execution.
//!
//! ## Architecture
//!
//! The system consists of:
//! - **Project Store**: file-locked, atomically replaced JSON document
//!   holding features, tasks, agents, and the completed-task ledger
//! - **Dependency Resolver**: cycle detection, execution levels, critical
//!   path, and the ready/blocked partition
//! - **Scheduler**: composite-priority dispatch under agent capacity and
//!   named resource pools
//! - **Execution Engine**: per-task state machine with retries, timeouts,
//!   cancellation, and recovery tasks
//! - **Hook Manager**: synchronous out-of-process callouts with structured
//!   stdin/stdout contracts
//! - **Supervisor**: the public façade tying the collaborators together
//!
//! ## Usage
//!
//! Embedders construct a [`supervisor::Supervisor`] over a project file,
//! register agents with their execute functions, and either call `start`
//! for continuous scheduling or drive ticks manually. Terminal UIs, CLI
//! parsing, and HTTP surfaces are intentionally out of scope; everything is
//! an in-process API plus file I/O plus hook sub-processes.

/// Agent executor trait and in-process registry
pub mod agents;
/// Runtime configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Execution engine and task state machine
pub mod engine;
/// Error types and handling
pub mod error;
/// Typed lifecycle events and the broadcast bus
pub mod events;
/// Lifecycle hook manager
pub mod hooks;
/// Core data models
pub mod models;
/// Dependency resolver
pub mod resolver;
/// Priority scheduler and resource pools
pub mod scheduler;
/// Persistent project store
pub mod store;
/// Public API façade
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use error::{LoomError, Result};
