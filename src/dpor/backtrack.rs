//! Backtracking-point discovery and insertion (§4.6).
//!
//! Walks a completed trace left to right the same way `vm.rs::resolve_race`
//! walks a completed tick's side effects, building one `BacktrackStep` per
//! executed entry and mutating a side table (`backtracks`) in place.

use crate::dpor::bounds::tids_of;
use crate::dpor::deps::{dependent_lookahead, DepState};
use crate::ids::ThreadId;
use crate::trace::{Lookahead, Trace, TraceEntry};
use std::collections::BTreeMap;

/// One entry's worth of backtracking bookkeeping: what ran, what else was
/// runnable, and the backtracking points discovered so far that target
/// this position in the trace.
#[derive(Debug, Clone)]
pub struct BacktrackStep {
    pub thread: ThreadId,
    pub entry: TraceEntry,
    pub backtracks: BTreeMap<ThreadId, bool>,
}

/// `backtrackAt`: record that thread `tid` should be tried at step `i`
/// instead of whatever ran there. If `tid` wasn't even runnable at that
/// point, fall back to every thread that *was* runnable there — there's no
/// more specific point to aim at.
fn backtrack_at(steps: &mut [BacktrackStep], i: usize, tid: ThreadId, conservative: bool) {
    let was_runnable = steps[i].entry.runnable.iter().any(|(t, _)| *t == tid);
    if was_runnable {
        insert_point(&mut steps[i].backtracks, tid, conservative);
    } else {
        let runnable: Vec<ThreadId> = steps[i].entry.runnable.iter().map(|(t, _)| *t).collect();
        for t in runnable {
            insert_point(&mut steps[i].backtracks, t, conservative);
        }
    }
}

fn insert_point(backtracks: &mut BTreeMap<ThreadId, bool>, tid: ThreadId, conservative: bool) {
    match backtracks.get(&tid) {
        Some(false) if conservative => {
            backtracks.insert(tid, true);
        }
        None => {
            backtracks.insert(tid, conservative);
        }
        _ => {}
    }
}

/// Scans backward from `before` for the nearest prior pre-emption point —
/// an index where the running thread differs from its predecessor and
/// neither step is a synthetic `CommitCRef` — and adds a conservative
/// backtracking point there for `tid`. This counteracts the artificial
/// dependencies the pre-emption bound itself introduces.
fn conservative_preemption_backtrack(steps: &mut [BacktrackStep], tids: &[ThreadId], before: usize, tid: ThreadId) {
    let mut i = before;
    while i > 0 {
        i -= 1;
        let differs = tids[i] != tids[i.saturating_sub(1)] || i == 0;
        let neither_commit =
            !matches!(steps[i].entry.action, crate::trace::ThreadAction::CommitCRef(_))
                && (i == 0 || !matches!(steps[i - 1].entry.action, crate::trace::ThreadAction::CommitCRef(_)));
        if i > 0 && differs && neither_commit {
            backtrack_at(steps, i, tid, true);
            return;
        }
    }
}

/// `findBacktrackSteps`: the full left-to-right walk, producing one
/// `BacktrackStep` per trace entry with its `backtracks` table populated.
pub fn find_backtrack_steps(trace: &Trace, bound_kill: bool) -> Vec<BacktrackStep> {
    let tids = tids_of(trace);
    let mut steps: Vec<BacktrackStep> = trace
        .iter()
        .zip(tids.iter())
        .map(|(entry, &tid)| BacktrackStep {
            thread: tid,
            entry: entry.clone(),
            backtracks: BTreeMap::new(),
        })
        .collect();

    let mut dep_state = DepState::new();
    let mut dep_states: Vec<DepState> = Vec::with_capacity(trace.len());
    for entry in trace {
        dep_states.push(dep_state.clone());
        dep_state.observe(&entry.action);
    }

    for j in 0..trace.len() {
        let tid_j = tids[j];
        for (u, lookahead) in trace[j].entry_runnable_excluding(tid_j) {
            let found = (0..j)
                .rev()
                .find(|&i| dependent_lookahead(tids[i], &trace[i].action, u, &lookahead, &dep_states[i]));
            let Some(i) = found else { continue };

            backtrack_at(&mut steps, i, u, false);
            conservative_preemption_backtrack(&mut steps, &tids, i, u);

            if is_release_lookahead(&lookahead) {
                let runnable: Vec<ThreadId> = steps[i].entry.runnable.iter().map(|(t, _)| *t).collect();
                for t in runnable {
                    backtrack_at(&mut steps, i, t, true);
                }
            }
        }
    }

    if bound_kill {
        if let Some(last) = trace.last() {
            for (u, _) in &last.runnable {
                backtrack_at(&mut steps, 0, *u, true);
            }
        }
    }

    steps
}

fn is_release_lookahead(lookahead: &Lookahead) -> bool {
    matches!(
        lookahead,
        Lookahead::Yield
            | Lookahead::PutMVar(_)
            | Lookahead::TryPutMVar(_)
            | Lookahead::TakeMVar(_)
            | Lookahead::TryTakeMVar(_)
            | Lookahead::ReadMVar(_)
            | Lookahead::TryReadMVar(_)
            | Lookahead::Stm(_)
            | Lookahead::ThrowTo(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdSource;
    use crate::trace::Decision;

    fn entry(decision: Decision, action: ThreadAction, runnable: Vec<(ThreadId, Lookahead)>) -> TraceEntry {
        TraceEntry { decision, runnable, action }
    }

    #[test]
    fn dependent_write_pair_gets_a_backtrack_point() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let c = ids.next_cref();

        // t0 writes c at step 0, then continues (step 1) while t1 is still
        // sitting runnable with a same-cell write queued up. The dependent
        // pair (step 0's write, t1's pending write) should yield a
        // backtrack point for t1 at step 0.
        let trace = vec![
            entry(
                Decision::Start(t0),
                ThreadAction::WriteCRef(c),
                vec![(t0, Lookahead::WriteCRef(c)), (t1, Lookahead::WriteCRef(c))],
            ),
            entry(Decision::Continue, ThreadAction::Yield, vec![(t0, Lookahead::Yield), (t1, Lookahead::WriteCRef(c))]),
        ];

        let steps = find_backtrack_steps(&trace, false);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].backtracks.get(&t1), Some(&false));
    }

    #[test]
    fn disjoint_cells_get_no_backtrack_point() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let c1 = ids.next_cref();
        let c2 = ids.next_cref();

        let trace = vec![
            entry(
                Decision::Start(t0),
                ThreadAction::WriteCRef(c1),
                vec![(t0, Lookahead::WriteCRef(c1)), (t1, Lookahead::WriteCRef(c2))],
            ),
            entry(Decision::Continue, ThreadAction::Yield, vec![(t0, Lookahead::Yield), (t1, Lookahead::WriteCRef(c2))]),
        ];

        let steps = find_backtrack_steps(&trace, false);
        assert!(steps[0].backtracks.is_empty());
    }

    #[test]
    fn bound_kill_backtracks_every_thread_runnable_at_the_end() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();

        let trace = vec![entry(Decision::Start(t0), ThreadAction::Yield, vec![(t0, Lookahead::Yield), (t1, Lookahead::Yield)])];

        let steps = find_backtrack_steps(&trace, true);
        assert_eq!(steps[0].backtracks.get(&t1), Some(&true));
    }
}

trait RunnableExcluding {
    fn entry_runnable_excluding(&self, tid: ThreadId) -> Vec<(ThreadId, Lookahead)>;
}

impl RunnableExcluding for TraceEntry {
    fn entry_runnable_excluding(&self, tid: ThreadId) -> Vec<(ThreadId, Lookahead)> {
        self.runnable.iter().filter(|(t, _)| *t != tid).cloned().collect()
    }
}
