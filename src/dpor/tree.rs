//! The DPOR schedule tree (§4.4): a trie over executed traces, annotated at
//! each node with the sleep set in effect there and the backtracking
//! points still owed.
//!
//! No prior art for this in a workflow VM (it has no exploration tree to
//! speak of); built anyway in the idiom of a plain struct of maps mutated
//! in place, the same shape as `store_memory.rs::Inner`.

use crate::ids::ThreadId;
use crate::trace::{ThreadAction, Trace, TraceEntry};
use std::collections::{BTreeMap, BTreeSet};

/// One node of the tree: the step that led here (`None` at the root), the
/// sleep set in effect afterward, the backtracking points still owed
/// (`ThreadId -> conservative?`), which of those have already been turned
/// into a child, and the children themselves.
#[derive(Debug, Default)]
pub struct Node {
    pub entry: Option<TraceEntry>,
    pub sleep: BTreeMap<ThreadId, ThreadAction>,
    pub backtrack: BTreeMap<ThreadId, bool>,
    pub taken: BTreeSet<ThreadId>,
    pub done: BTreeMap<ThreadId, Node>,
}

impl Node {
    fn root() -> Self {
        Self::default()
    }
}

/// The whole tree, rooted at the empty trace.
#[derive(Debug)]
pub struct Tree {
    pub root: Node,
}

impl Tree {
    pub fn new() -> Self {
        Self { root: Node::root() }
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

/// A candidate schedule prefix extracted by [`find_schedule_prefix`]: replay
/// `prefix` verbatim, then let the thread named `tid` run next (with
/// `sleep` as the starting sleep set at the divergence point).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub prefix: Trace,
    pub tid: ThreadId,
    pub conservative: bool,
    pub sleep: BTreeMap<ThreadId, ThreadAction>,
}

fn tid_of(entry: &TraceEntry, current: &mut Option<ThreadId>) -> ThreadId {
    use crate::trace::Decision;
    let tid = match entry.decision {
        Decision::SwitchTo(t) | Decision::Start(t) => t,
        Decision::Continue => current.expect("Continue with no prior thread"),
    };
    *current = Some(tid);
    tid
}

fn collect_candidates(node: &Node, path: &mut Trace, out: &mut Vec<Candidate>) {
    for (&tid, conservative) in &node.backtrack {
        if node.taken.contains(&tid) {
            continue;
        }
        out.push(Candidate {
            prefix: path.clone(),
            tid,
            conservative: *conservative,
            sleep: node.sleep.clone(),
        });
    }
    for child in node.done.values() {
        let entry = child
            .entry
            .clone()
            .expect("a `done` child always records the entry that produced it");
        path.push(entry);
        collect_candidates(child, path, out);
        path.pop();
    }
}

/// Finds the next schedule to try: walk the tree, gather every un-taken
/// backtracking point reachable through `done` children, and return the one
/// with the most pre-emptions in its prefix (so deeper pre-emption budgets
/// get explored first, per §4.4's tie-break). Marks the chosen point
/// `taken` so a second call won't return it again before its trace is
/// incorporated. Returns `None` once the tree is fully drained.
pub fn find_schedule_prefix(tree: &mut Tree) -> Option<Candidate> {
    let mut path = Vec::new();
    let mut candidates = Vec::new();
    collect_candidates(&tree.root, &mut path, &mut candidates);

    let best_index = candidates
        .iter()
        .enumerate()
        .max_by_key(|(_, c)| crate::dpor::bounds::preemption_count(&c.prefix))
        .map(|(i, _)| i)?;
    let chosen = candidates.swap_remove(best_index);

    mark_taken(&mut tree.root, &chosen.prefix, chosen.tid);
    Some(chosen)
}

fn mark_taken(node: &mut Node, prefix: &[TraceEntry], tid: ThreadId) {
    let mut cursor = node;
    let mut current = None;
    for entry in prefix {
        let step_tid = tid_of(entry, &mut current);
        cursor = cursor.done.get_mut(&step_tid).expect("prefix must already be in the tree");
    }
    cursor.taken.insert(tid);
}

/// Folds an executed trace into the tree, creating `done` children for any
/// step not already present. `sleep_for` supplies the sleep set recorded at
/// each step (the DPOR scheduler's own bookkeeping, since the tree doesn't
/// re-derive it).
pub fn incorporate_trace(tree: &mut Tree, trace: &Trace, sleep_at: &[BTreeMap<ThreadId, ThreadAction>]) {
    let mut node = &mut tree.root;
    let mut current = None;
    for (i, entry) in trace.iter().enumerate() {
        let tid = tid_of(entry, &mut current);
        node = node.done.entry(tid).or_insert_with(|| Node {
            entry: Some(entry.clone()),
            ..Node::default()
        });
        if let Some(sleep) = sleep_at.get(i) {
            node.sleep = sleep.clone();
        }
    }
}

/// Inserts backtracking points discovered for one completed trace, per
/// [`crate::dpor::backtrack::BacktrackStep`], at the tree node each step
/// corresponds to.
pub fn incorporate_backtrack_steps(tree: &mut Tree, trace: &Trace, steps: &[crate::dpor::backtrack::BacktrackStep]) {
    let mut node = &mut tree.root;
    let mut current = None;
    for (entry, step) in trace.iter().zip(steps.iter()) {
        let tid = tid_of(entry, &mut current);
        for (&target, &conservative) in &step.backtracks {
            insert_backtrack(node, target, conservative);
        }
        node = node.done.entry(tid).or_insert_with(|| Node {
            entry: Some(entry.clone()),
            ..Node::default()
        });
    }
}

fn insert_backtrack(node: &mut Node, tid: ThreadId, conservative: bool) {
    match node.backtrack.get(&tid) {
        Some(false) if conservative => {
            node.backtrack.insert(tid, true);
        }
        None => {
            node.backtrack.insert(tid, conservative);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdSource;
    use crate::trace::Decision;

    fn entry(decision: Decision, action: ThreadAction) -> TraceEntry {
        TraceEntry { decision, runnable: Vec::new(), action }
    }

    #[test]
    fn empty_tree_has_no_candidate() {
        let mut tree = Tree::new();
        assert!(find_schedule_prefix(&mut tree).is_none());
    }

    #[test]
    fn root_backtrack_point_is_found_and_marked_taken() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let mut tree = Tree::new();
        tree.root.backtrack.insert(t0, false);

        let candidate = find_schedule_prefix(&mut tree).expect("a backtrack point was seeded");
        assert_eq!(candidate.tid, t0);
        assert!(candidate.prefix.is_empty());
        assert!(tree.root.taken.contains(&t0));

        // A second call must not return the same point again.
        assert!(find_schedule_prefix(&mut tree).is_none());
    }

    #[test]
    fn incorporate_trace_then_incorporate_backtrack_steps_is_findable() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let mut tree = Tree::new();

        let trace = vec![
            entry(Decision::Start(t0), ThreadAction::Yield),
            entry(Decision::SwitchTo(t1), ThreadAction::Stop),
        ];
        let sleep_at = vec![BTreeMap::new(), BTreeMap::new()];
        incorporate_trace(&mut tree, &trace, &sleep_at);

        // No backtrack point yet.
        assert!(find_schedule_prefix(&mut tree).is_none());

        let steps = vec![
            crate::dpor::backtrack::BacktrackStep {
                thread: t0,
                entry: trace[0].clone(),
                backtracks: BTreeMap::from([(t1, false)]),
            },
            crate::dpor::backtrack::BacktrackStep {
                thread: t1,
                entry: trace[1].clone(),
                backtracks: BTreeMap::new(),
            },
        ];
        incorporate_backtrack_steps(&mut tree, &trace, &steps);

        let candidate = find_schedule_prefix(&mut tree).expect("backtrack point inserted at the root");
        assert_eq!(candidate.tid, t1);
        assert!(candidate.prefix.is_empty());
    }

    #[test]
    fn conservative_upgrade_never_downgrades() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let mut node = Node::default();
        insert_backtrack(&mut node, t0, false);
        insert_backtrack(&mut node, t0, true);
        assert_eq!(node.backtrack.get(&t0), Some(&true));
        insert_backtrack(&mut node, t0, false);
        assert_eq!(node.backtrack.get(&t0), Some(&true));
    }
}
