//! The DPOR scheduler and the outer explore loop that drives it (§4.7).
//!
//! Outer loop modeled on `engine.rs`'s top-level drive-to-completion
//! method: classify state, pick the next unit of work, run it, fold the
//! result back in, repeat until nothing is left to try.

use crate::action::Action;
use crate::dpor::backtrack::find_backtrack_steps;
use crate::dpor::bounds::within_bounds;
use crate::dpor::deps::{dependent, DepState};
use crate::dpor::tree::{find_schedule_prefix, incorporate_backtrack_steps, incorporate_trace, Tree};
use crate::error::Failure;
use crate::ids::{ThreadId, INITIAL_THREAD};
use crate::options::ExecutionOptions;
use crate::runloop::run_concurrency;
use crate::scheduler::Scheduler;
use crate::trace::{is_release, Decision, Lookahead, ThreadAction, Trace, TraceEntry};
use crate::value::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// State threaded through one `DporScheduler` run: the remaining replay
/// prefix, the sleep set in effect, the dependency bookkeeping the
/// dependence relation needs, and the flags the explorer reads back once
/// the run ends.
pub struct DporState {
    remaining: VecDeque<ThreadId>,
    sleep: BTreeMap<ThreadId, ThreadAction>,
    dep_state: DepState,
    bounds: crate::options::Bounds,
    prior_action: Option<ThreadAction>,
    ignore: bool,
    bound_kill: bool,
    /// The sleep set in effect after each step decided so far, one entry
    /// per `schedule()` call, in order. Handed back to `explore` so the
    /// tree's `Node::sleep` can be seeded with what the scheduler actually
    /// computed instead of an empty placeholder.
    history: Vec<BTreeMap<ThreadId, ThreadAction>>,
}

impl DporState {
    fn new(prefix: Vec<ThreadId>, sleep: BTreeMap<ThreadId, ThreadAction>, bounds: crate::options::Bounds) -> Self {
        Self {
            remaining: prefix.into(),
            sleep,
            dep_state: DepState::new(),
            bounds,
            prior_action: None,
            ignore: false,
            bound_kill: false,
            history: Vec::new(),
        }
    }
}

/// A scheduler whose choices are fully determined by a DPOR tree node: it
/// replays a fixed prefix, then at the divergence point picks according to
/// §4.7's initialise / bound-filter / sleep-filter pipeline.
pub struct DporScheduler;

impl Scheduler for DporScheduler {
    type State = DporState;

    fn schedule(
        &self,
        prefix: &Trace,
        prior: Option<(ThreadId, ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
        mut state: Self::State,
    ) -> (Option<ThreadId>, Self::State) {
        if let Some((_, action)) = &prior {
            state.dep_state.observe(action);
            state.prior_action = Some(action.clone());
        }

        if let Some(tid) = state.remaining.pop_front() {
            state.history.push(state.sleep.clone());
            return (Some(tid), state);
        }

        // -- initialise: order candidates -------------------------------
        let mut candidates: Vec<ThreadId> = runnable.iter().map(|(t, _)| *t).collect();
        if let Some((prior_tid, prior_action)) = &prior {
            if candidates.contains(prior_tid) && !matches!(prior_action, ThreadAction::Yield) {
                candidates.sort_by_key(|t| if t == prior_tid { 0 } else { 1 });
            }
        }
        let is_yielding = |t: &ThreadId| {
            runnable
                .iter()
                .find(|(rt, _)| rt == t)
                .map(|(_, la)| is_release(&lookahead_to_placeholder(la)))
                .unwrap_or(false)
        };
        candidates.sort_by_key(|t| if is_yielding(t) { 1 } else { 0 });
        let terminating = |t: &ThreadId| {
            runnable
                .iter()
                .find(|(rt, _)| rt == t)
                .map(|(_, la)| matches!(la, Lookahead::Stop))
                .unwrap_or(false)
        };
        if candidates.len() > 1 && candidates.iter().any(terminating) {
            candidates.sort_by_key(|t| if terminating(t) { 0 } else { 1 });
        }

        // -- bound filter --------------------------------------------------
        let bound_filtered: Vec<ThreadId> = candidates
            .iter()
            .copied()
            .filter(|t| {
                let decision = match &prior {
                    Some((p, _)) if p == t => Decision::Continue,
                    _ => Decision::SwitchTo(*t),
                };
                let mut hypothetical = prefix.clone();
                hypothetical.push(TraceEntry {
                    decision,
                    runnable: runnable.to_vec(),
                    action: runnable
                        .iter()
                        .find(|(rt, _)| rt == t)
                        .map(|(_, la)| lookahead_to_placeholder(la))
                        .unwrap_or(ThreadAction::MyTid),
                });
                within_bounds(&hypothetical, &state.bounds)
            })
            .collect();

        if bound_filtered.is_empty() {
            state.bound_kill = true;
            state.history.push(state.sleep.clone());
            return (None, state);
        }

        // -- sleep filter ----------------------------------------------------
        // A sleeping candidate wakes only once the *just-executed* action is
        // dependent with the action it was put to sleep against — not with
        // its own (not-yet-run) lookahead.
        let mut sleep_filtered = Vec::new();
        for t in &bound_filtered {
            match state.sleep.get(t) {
                None => sleep_filtered.push(*t),
                Some(sleeping_action) => {
                    let wakes = match (&prior, &state.prior_action) {
                        (Some((prior_tid, _)), Some(prior_action)) => {
                            dependent(*prior_tid, prior_action, *t, sleeping_action, &state.dep_state)
                        }
                        _ => false,
                    };
                    if wakes {
                        state.sleep.remove(t);
                        sleep_filtered.push(*t);
                    }
                }
            }
        }

        if sleep_filtered.is_empty() {
            state.ignore = true;
            state.history.push(state.sleep.clone());
            return (None, state);
        }

        let chosen = sleep_filtered[0];
        for t in &sleep_filtered[1..] {
            if let Some(action) = prior.as_ref().map(|(_, a)| a.clone()) {
                state.sleep.entry(*t).or_insert(action);
            }
        }
        state.history.push(state.sleep.clone());
        (Some(chosen), state)
    }
}

/// A coarse stand-in `ThreadAction` for a not-yet-forced step, used only to
/// feed the bound predicates (which only look at `Yield`/`Decision` shape,
/// not exact payloads).
fn lookahead_to_placeholder(la: &Lookahead) -> ThreadAction {
    match la {
        Lookahead::Yield => ThreadAction::Yield,
        Lookahead::Stop => ThreadAction::Stop,
        _ => ThreadAction::MyTid,
    }
}

/// One discovered execution, paired with the bound/id source state needed
/// to reproduce it.
pub struct Exploration {
    pub result: Result<Value, Failure>,
    pub trace: Trace,
}

/// Runs the full bounded DPOR search over `program`, yielding one
/// [`Exploration`] per schedule tried. Builder functions must be able to
/// rebuild `program` fresh for every run (the same way the interpreter
/// itself treats `Action` trees as disposable), so `program` is supplied as
/// a factory rather than a single value.
pub fn explore<F>(options: &ExecutionOptions, mut program: F) -> Vec<Exploration>
where
    F: FnMut() -> Action,
{
    let mut tree = Tree::new();
    // Seed the root with the only schedule there is to try before anything
    // has executed: starting the initial thread. Without this the very
    // first `find_schedule_prefix` finds nothing and the search never runs.
    tree.root.backtrack.insert(INITIAL_THREAD, false);
    let mut results = Vec::new();

    loop {
        let span = tracing::info_span!("explore_iteration");
        let _guard = span.enter();

        let Some(candidate) = find_schedule_prefix(&mut tree) else {
            debug!(explored = results.len(), "tree drained");
            break;
        };

        // The prefix replays verbatim, then `candidate.tid` is the forced
        // divergence this candidate was extracted to cover — it must run
        // immediately after the prefix, not be left to the scheduler's own
        // initialise ordering to rediscover.
        let mut prefix_tids: Vec<ThreadId> = crate::dpor::bounds::tids_of(&candidate.prefix);
        prefix_tids.push(candidate.tid);
        let sched_state = DporState::new(prefix_tids, candidate.sleep, options.bounds);
        let scheduler = DporScheduler;
        let (result, trace, final_state) = run_concurrency(&scheduler, options, program(), sched_state);

        if final_state.ignore {
            debug!("execution ignored: every candidate already slept");
            continue;
        }

        // `history` holds one sleep-set snapshot per `schedule()` call, in
        // step order; a trailing call that aborted the run (bound-kill or
        // ignore) doesn't correspond to a trace entry, so trim to match.
        let bound_kill = final_state.bound_kill;
        let mut sleep_at = final_state.history;
        sleep_at.truncate(trace.len());
        incorporate_trace(&mut tree, &trace, &sleep_at);
        let bsteps = find_backtrack_steps(&trace, bound_kill);
        incorporate_backtrack_steps(&mut tree, &trace, &bsteps);

        results.push(Exploration { result, trace });
    }

    results
}
