//! The engine's single terminal-outcome type.
//!
//! All three error tiers described by the design (user-program failures,
//! bound-driven aborts, engine invariant violations) live in one enum rather
//! than three, so `run_concurrency` has a single `Result<Value, Failure>`
//! contract (see DESIGN.md).

use crate::ids::ThreadId;
use thiserror::Error;

/// Terminal outcome of a `run_concurrency` call that is not a successful
/// return value.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Failure {
    /// No thread is runnable and at least one (including the initial thread)
    /// is blocked on an MVar or mask operation.
    #[error("deadlock: {0} thread(s) blocked with nothing left runnable")]
    Deadlock(usize),

    /// No thread is runnable and at least one is blocked retrying an STM
    /// transaction with no writer left to wake it.
    #[error("STM deadlock: {0} thread(s) blocked on retry with no writer remaining")]
    StmDeadlock(usize),

    /// An exception reached the initial thread's handler stack with no
    /// handler left to catch it.
    #[error("uncaught exception on the initial thread: {0}")]
    UncaughtException(String),

    /// The scheduler returned `None`: every in-bound choice at this point was
    /// exhausted. Not a bug — the explorer records it and moves on.
    #[error("execution aborted: scheduler exhausted every in-bound choice")]
    Abort,

    /// `Subconcurrency` was invoked while more than one thread was live.
    #[error("subconcurrency invoked with {0} other thread(s) still live")]
    IllegalSubconcurrency(usize),

    /// The scheduler chose a thread that is not runnable, or not present.
    /// Never happens under a conforming scheduler.
    #[error("scheduler returned {0:?}, which is not a runnable thread")]
    InternalError(ThreadId),

    /// A core engine invariant (§8, I1-I6) was violated. Indicates a bug in
    /// the engine itself, not in the program under test.
    #[error("engine invariant violated: {0}")]
    InvariantFailure(String),
}
