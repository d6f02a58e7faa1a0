//! The external scheduling boundary. The engine never picks a thread
//! itself; every choice — random, round-robin, or DPOR-seeded replay —
//! goes through this trait, the same way a workflow VM never touches
//! persistence directly and instead goes through a single store trait.

use crate::ids::ThreadId;
use crate::trace::{Lookahead, ThreadAction, Trace};

/// Chooses which runnable thread advances next.
pub trait Scheduler {
    /// State threaded between calls (an RNG seed, DPOR's remaining prefix,
    /// ...). Each scheduler owns its own shape.
    type State;

    /// Choose the next thread to run, or `None` to abort the execution.
    fn schedule(
        &self,
        prefix: &Trace,
        prior: Option<(ThreadId, ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
        state: Self::State,
    ) -> (Option<ThreadId>, Self::State);
}
