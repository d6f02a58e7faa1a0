//! A deterministic interpreter for concurrent programs — rendezvous MVars,
//! shared cells under three memory models, software transactional memory,
//! exception masking, and nested subconcurrency — paired with a bounded
//! Dynamic Partial-Order Reduction explorer that searches the space of
//! thread interleavings for one that exercises a bug.
//!
//! The engine never schedules itself: every run is driven by a
//! [`Scheduler`], from a trivial round-robin up to the [`dpor`] module's
//! bounded search. [`run_concurrency`] drives one schedule to completion;
//! [`explore`] drives the full bounded search, yielding one execution per
//! schedule tried.

pub mod action;
pub mod cref;
pub mod dpor;
pub mod error;
pub mod exec;
pub mod ids;
pub mod membuf;
pub mod mvar;
pub mod options;
pub mod runloop;
pub mod scheduler;
pub mod stm;
pub mod thread;
pub mod trace;
pub mod value;

pub use action::Action;
pub use dpor::{explore, Exploration};
pub use error::Failure;
pub use ids::{CRefId, MVarId, ThreadId, TVarId};
pub use membuf::MemoryModel;
pub use options::{Bounds, ExecutionOptions};
pub use runloop::run_concurrency;
pub use scheduler::Scheduler;
pub use trace::{Decision, Lookahead, ThreadAction, Trace, TraceEntry};
pub use value::Value;
