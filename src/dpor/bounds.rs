//! Pre-emption bound, fair bound, and their combination (§4.5).
//!
//! Free predicates over a trace-so-far, in the same small-helper style as
//! `deps.rs`. `is_release` (needed by the fair bound's "not a Yield"
//! exemption and reused by backtracking/the explorer) lives in `trace.rs`
//! beside `ThreadAction` rather than here — see DESIGN.md.

use crate::ids::ThreadId;
use crate::options::Bounds;
use crate::trace::{Decision, ThreadAction, TraceEntry};
use std::collections::BTreeMap;

/// Reconstructs the executing thread id for each trace entry. `TraceEntry`
/// only records a `Decision` (`Continue` carries no id of its own), so the
/// id sequence has to be threaded forward the same way the run-loop builds
/// it in the first place.
pub fn tids_of(prefix: &[TraceEntry]) -> Vec<ThreadId> {
    let mut out = Vec::with_capacity(prefix.len());
    let mut current: Option<ThreadId> = None;
    for entry in prefix {
        let tid = match entry.decision {
            Decision::SwitchTo(t) | Decision::Start(t) => t,
            Decision::Continue => current.expect("Continue with no prior thread"),
        };
        current = Some(tid);
        out.push(tid);
    }
    out
}

/// Counts pre-emptions: a `SwitchTo` whose interrupted thread's previous
/// step was not a voluntary `Yield`. A `SwitchTo` away from a thread that
/// had just yielded is cooperative, not a forced pre-emption, so it is not
/// counted.
pub fn preemption_count(prefix: &[TraceEntry]) -> u32 {
    let mut count = 0u32;
    for (i, entry) in prefix.iter().enumerate() {
        if matches!(entry.decision, Decision::SwitchTo(_)) {
            let previous_was_yield = i > 0 && matches!(prefix[i - 1].action, ThreadAction::Yield);
            if !previous_was_yield {
                count += 1;
            }
        }
    }
    count
}

pub fn within_preemption_bound(prefix: &[TraceEntry], pb: u32) -> bool {
    preemption_count(prefix) <= pb
}

/// Per-thread `Yield` tallies across `prefix`.
fn yield_counts(prefix: &[TraceEntry]) -> BTreeMap<ThreadId, u32> {
    let tids = tids_of(prefix);
    let mut counts = BTreeMap::new();
    for (tid, entry) in tids.into_iter().zip(prefix.iter()) {
        if matches!(entry.action, ThreadAction::Yield) {
            *counts.entry(tid).or_insert(0u32) += 1;
        }
    }
    counts
}

/// Rejects prefixes where the spread between the most- and least-frequent
/// yielder exceeds `fb`. Threads that have never yielded count as zero.
pub fn within_fair_bound(prefix: &[TraceEntry], fb: u32) -> bool {
    let counts = yield_counts(prefix);
    let Some(&max) = counts.values().max() else {
        return true;
    };
    let min = counts.values().min().copied().unwrap_or(0);
    max.saturating_sub(min) <= fb
}

pub fn within_bounds(prefix: &[TraceEntry], bounds: &Bounds) -> bool {
    within_preemption_bound(prefix, bounds.preemption) && within_fair_bound(prefix, bounds.fair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdSource;

    fn entry(decision: Decision, action: ThreadAction) -> TraceEntry {
        TraceEntry { decision, runnable: Vec::new(), action }
    }

    #[test]
    fn switch_after_yield_is_not_a_preemption() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let prefix = vec![
            entry(Decision::Start(t0), ThreadAction::Yield),
            entry(Decision::SwitchTo(t1), ThreadAction::Stop),
        ];
        assert_eq!(preemption_count(&prefix), 0);
    }

    #[test]
    fn switch_after_non_yield_is_a_preemption() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let cref = ids.next_cref();
        let prefix = vec![
            entry(Decision::Start(t0), ThreadAction::WriteCRef(cref)),
            entry(Decision::SwitchTo(t1), ThreadAction::Stop),
        ];
        assert_eq!(preemption_count(&prefix), 1);
    }

    #[test]
    fn within_preemption_bound_rejects_once_exceeded() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let cref = ids.next_cref();
        let prefix = vec![
            entry(Decision::Start(t0), ThreadAction::WriteCRef(cref)),
            entry(Decision::SwitchTo(t1), ThreadAction::Stop),
        ];
        assert!(within_preemption_bound(&prefix, 1));
        assert!(!within_preemption_bound(&prefix, 0));
    }

    #[test]
    fn fair_bound_rejects_lopsided_yield_counts() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let mut prefix = vec![entry(Decision::Start(t0), ThreadAction::Yield)];
        for _ in 0..3 {
            prefix.push(entry(Decision::Continue, ThreadAction::Yield));
        }
        prefix.push(entry(Decision::SwitchTo(t1), ThreadAction::Yield));
        assert!(within_fair_bound(&prefix, 4));
        assert!(!within_fair_bound(&prefix, 3));
    }

    #[test]
    fn tids_of_threads_continue_through_prior_thread() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let prefix = vec![
            entry(Decision::Start(t0), ThreadAction::Yield),
            entry(Decision::Continue, ThreadAction::Yield),
            entry(Decision::SwitchTo(t1), ThreadAction::Stop),
        ];
        assert_eq!(tids_of(&prefix), vec![t0, t0, t1]);
    }
}
