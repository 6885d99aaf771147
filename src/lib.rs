//! Ember - request-processing core of an in-memory data server.
//!
//! Ember turns a parsed client command into a validated, executed and
//! durably-propagated state change, while a cooperative scheduler
//! interleaves that work with background maintenance on a single reactor
//! task.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     I/O worker threads                          │
//! │        (parse / serialize per-connection buffers only)          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ mpsc
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Reactor (one task)                         │
//! │  pre-sleep hook → admission pipeline → invoker → post-sleep     │
//! │        maintenance cron │ adaptive client cron                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Propagation buffer                           │
//! │   staged ops, atomic flush → durable log │ replica stream       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Rejection taxonomy
//! - [`core::time`] - Cached wall clock
//! - [`command`] - Descriptors, registry, builtin table
//! - [`client`] - Per-connection command state and the client table
//! - [`server`] - The explicit server context and collaborator interfaces
//! - [`admission`] - The ordered gate sequence
//! - [`exec`] - Execution units and the invoker
//! - [`propagate`] - Staging and atomic flush of mutation ops
//! - [`sched`] - Maintenance crons, sleep hooks and the reactor loop
//!
//! # Key Invariants
//!
//! - Gate rejections happen strictly before any dataset mutation
//! - The cached clock refreshes only on the 0→1 nesting transition
//! - The propagation buffer flushes exactly once per execution unit,
//!   preserving staging order
//! - No scheduler tick ever overlaps a command with respect to the dataset
//!   or the propagation buffer

pub mod admission;
pub mod client;
pub mod command;
pub mod core;
pub mod exec;
pub mod propagate;
pub mod sched;
pub mod server;

pub use crate::core::{config, error, time};
pub use admission::Admission;
pub use client::{Client, ClientId, ClientTable};
pub use command::registry::CommandRegistry;
pub use exec::{CallFlags, ExecState};
pub use propagate::{PropTarget, PropagationBuffer};
pub use sched::reactor::{Reactor, ReactorEvent};
pub use server::Server;
