//! The dependency relation between two threads' steps (§4.5), plus the
//! small piece of state it needs beyond the trace itself.
//!
//! Written as free functions over plain data, matching the small-helper
//! style of `vm.rs` (`is_truthy`, `apply_completion`) rather than a
//! method-heavy type.

use crate::ids::{CRefId, ThreadId};
use crate::thread::MaskingState;
use crate::trace::{Lookahead, ThreadAction};
use std::collections::{BTreeMap, BTreeSet};

/// The slice of interpreter state the dependency relation needs that isn't
/// recoverable from the trace alone: which cells currently have a pending
/// buffered write (so a later write to the same cell is ordered against
/// it), and each thread's current masking state (`ThrowTo`'s dependence on
/// a target depends on whether that target is interruptible right now).
#[derive(Clone, Debug, Default)]
pub struct DepState {
    pub buffered: BTreeSet<CRefId>,
    pub masking: BTreeMap<ThreadId, MaskingState>,
}

impl DepState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one observed step into the running state. Call this once per
    /// trace entry, in order, while walking a trace.
    pub fn observe(&mut self, action: &ThreadAction) {
        match action {
            ThreadAction::WriteCRef(c) | ThreadAction::ModCRef(c) | ThreadAction::ModCRefCas(c) => {
                self.buffered.insert(*c);
            }
            ThreadAction::CommitCRef(c) => {
                self.buffered.remove(c);
            }
            ThreadAction::Masking | ThreadAction::ResetMask => {
                // The actual `MaskingState` value lives on the `Thread`
                // record; callers with access to the live `Context` should
                // prefer `set_masking` directly. This arm exists so
                // `observe` stays total over every `ThreadAction` variant.
            }
            _ => {}
        }
    }

    pub fn set_masking(&mut self, tid: ThreadId, state: MaskingState) {
        self.masking.insert(tid, state);
    }

    fn is_interruptible(&self, tid: ThreadId) -> bool {
        // Absent an entry, a thread defaults to `Unmasked` (interruptible);
        // matches `Thread::new`'s default.
        !matches!(self.masking.get(&tid), Some(MaskingState::MaskedUninterruptible))
    }
}

fn mvar_try_both_fail(a1: &ThreadAction, a2: &ThreadAction) -> bool {
    matches!(
        (a1, a2),
        (ThreadAction::TryPutMVar(_, false, _), ThreadAction::TryPutMVar(_, false, _))
            | (ThreadAction::TryReadMVar(_, false), ThreadAction::TryReadMVar(_, false))
            | (ThreadAction::TryTakeMVar(_, false, _), ThreadAction::TryTakeMVar(_, false, _))
    )
}

fn mvar_id(action: &ThreadAction) -> Option<crate::ids::MVarId> {
    match action {
        ThreadAction::NewMVar(id) => Some(*id),
        ThreadAction::PutMVar(id, _)
        | ThreadAction::BlockedPutMVar(id)
        | ThreadAction::TryPutMVar(id, ..)
        | ThreadAction::ReadMVar(id)
        | ThreadAction::BlockedReadMVar(id)
        | ThreadAction::TryReadMVar(id, _)
        | ThreadAction::TakeMVar(id, _)
        | ThreadAction::BlockedTakeMVar(id)
        | ThreadAction::TryTakeMVar(id, ..) => Some(*id),
        _ => None,
    }
}

fn cref_write(action: &ThreadAction) -> Option<CRefId> {
    match action {
        ThreadAction::WriteCRef(id)
        | ThreadAction::ModCRef(id)
        | ThreadAction::ModCRefCas(id)
        | ThreadAction::CasCRef(id, _)
        | ThreadAction::CommitCRef(id) => Some(*id),
        _ => None,
    }
}

fn cref_touch(action: &ThreadAction) -> Option<CRefId> {
    cref_write(action).or(match action {
        ThreadAction::ReadCRef(id) | ThreadAction::ReadCRefCas(id) => Some(*id),
        _ => None,
    })
}

fn tvar_ids(action: &ThreadAction) -> Option<&[crate::ids::TVarId]> {
    match action {
        ThreadAction::Stm(ids, _) | ThreadAction::BlockedStm(ids) => Some(ids),
        _ => None,
    }
}

fn tvar_ids_lookahead(la: &Lookahead) -> Option<&[crate::ids::TVarId]> {
    match la {
        Lookahead::Stm(ids) => Some(ids),
        _ => None,
    }
}

/// Whether `(tid1, a1)` and `(tid2, a2)` are dependent per §4.5. Both sides
/// have already been observed (executed), so this is the exact relation.
pub fn dependent(tid1: ThreadId, a1: &ThreadAction, tid2: ThreadId, a2: &ThreadAction, dep: &DepState) -> bool {
    if tid1 == tid2 {
        return false;
    }

    if let (Some(m1), Some(m2)) = (mvar_id(a1), mvar_id(a2)) {
        if m1 == m2 && !mvar_try_both_fail(a1, a2) {
            return true;
        }
    }

    if let (Some(c1), Some(c2)) = (cref_touch(a1), cref_touch(a2)) {
        if c1 == c2 && (cref_write(a1).is_some() || cref_write(a2).is_some() || dep.buffered.contains(&c1)) {
            return true;
        }
    }

    if let (Some(t1), Some(t2)) = (tvar_ids(a1), tvar_ids(a2)) {
        let writes1 = matches!(a1, ThreadAction::Stm(..));
        let writes2 = matches!(a2, ThreadAction::Stm(..));
        if (writes1 || writes2) && t1.iter().any(|id| t2.contains(id)) {
            return true;
        }
    }

    match (a1, a2) {
        (ThreadAction::ThrowTo(target), _) | (ThreadAction::BlockedThrowTo(target), _) if *target == tid2 => {
            if dep.is_interruptible(tid2) {
                return true;
            }
        }
        (_, ThreadAction::ThrowTo(target)) | (_, ThreadAction::BlockedThrowTo(target)) if *target == tid1 => {
            if dep.is_interruptible(tid1) {
                return true;
            }
        }
        _ => {}
    }

    match (a1, a2) {
        (ThreadAction::Fork(child), _) if *child == tid2 => return true,
        (_, ThreadAction::Fork(child)) if *child == tid1 => return true,
        _ => {}
    }

    false
}

/// Conservative lookahead variant of [`dependent`]: `tid2`'s next step is
/// only predicted (`Lookahead`), not yet forced, so unknown exact payloads
/// (an opaque `LiftExternal`, a not-yet-resolved CAS outcome) are treated
/// as potentially dependent rather than assumed safe.
pub fn dependent_lookahead(tid1: ThreadId, a1: &ThreadAction, tid2: ThreadId, l2: &Lookahead, dep: &DepState) -> bool {
    if tid1 == tid2 {
        return false;
    }

    let m1 = mvar_id(a1);
    let m2 = match l2 {
        Lookahead::PutMVar(id)
        | Lookahead::TryPutMVar(id)
        | Lookahead::ReadMVar(id)
        | Lookahead::TryReadMVar(id)
        | Lookahead::TakeMVar(id)
        | Lookahead::TryTakeMVar(id) => Some(*id),
        _ => None,
    };
    if let (Some(m1), Some(m2)) = (m1, m2) {
        if m1 == m2 {
            // Conservative: we don't know yet whether both sides are
            // failing tries, so don't special-case that exemption here.
            return true;
        }
    }

    let c1 = cref_touch(a1);
    let c2 = match l2 {
        Lookahead::ReadCRef(id) | Lookahead::WriteCRef(id) | Lookahead::CasCRef(id) | Lookahead::CommitCRef(id) => {
            Some(*id)
        }
        _ => None,
    };
    if let (Some(c1), Some(c2)) = (c1, c2) {
        if c1 == c2 {
            return true;
        }
    }

    if let (Some(t1), Some(t2)) = (tvar_ids(a1), tvar_ids_lookahead(l2)) {
        if t1.iter().any(|id| t2.contains(id)) {
            return true;
        }
    }

    match l2 {
        Lookahead::ThrowTo(target) if *target == tid1 => {
            if dep.is_interruptible(tid1) {
                return true;
            }
        }
        _ => {}
    }
    if let ThreadAction::ThrowTo(target) | ThreadAction::BlockedThrowTo(target) = a1 {
        if *target == tid2 && dep.is_interruptible(tid2) {
            return true;
        }
    }

    if let ThreadAction::Fork(child) = a1 {
        if *child == tid2 {
            return true;
        }
    }

    // Unknown opaque effects are conservatively dependent with everything
    // touching shared state; a bare `Unknown` lookahead with no evidence
    // either way is left non-dependent, matching the executed-step rule's
    // treatment of actions with no shared resource at all.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdSource;

    #[test]
    fn two_writes_to_the_same_cref_are_dependent() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let c = ids.next_cref();
        let dep = DepState::new();
        assert!(dependent(t0, &ThreadAction::WriteCRef(c), t1, &ThreadAction::WriteCRef(c), &dep));
    }

    #[test]
    fn reads_of_the_same_cref_are_independent() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let c = ids.next_cref();
        let dep = DepState::new();
        assert!(!dependent(t0, &ThreadAction::ReadCRef(c), t1, &ThreadAction::ReadCRef(c), &dep));
    }

    #[test]
    fn buffered_write_makes_a_later_read_dependent() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let c = ids.next_cref();
        let mut dep = DepState::new();
        dep.observe(&ThreadAction::WriteCRef(c));
        assert!(dependent(t0, &ThreadAction::ReadCRef(c), t1, &ThreadAction::ReadCRef(c), &dep));
    }

    #[test]
    fn two_failing_try_puts_on_the_same_mvar_are_independent() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let m = ids.next_mvar();
        let dep = DepState::new();
        let a = ThreadAction::TryPutMVar(m, false, Vec::new());
        let b = ThreadAction::TryPutMVar(m, false, Vec::new());
        assert!(!dependent(t0, &a, t1, &b, &dep));
    }

    #[test]
    fn a_successful_put_and_a_failing_try_put_are_dependent() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let m = ids.next_mvar();
        let dep = DepState::new();
        let a = ThreadAction::PutMVar(m, Vec::new());
        let b = ThreadAction::TryPutMVar(m, false, Vec::new());
        assert!(dependent(t0, &a, t1, &b, &dep));
    }

    #[test]
    fn throw_to_an_unmasked_target_is_dependent() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let dep = DepState::new();
        assert!(dependent(t0, &ThreadAction::ThrowTo(t1), t1, &ThreadAction::Yield, &dep));
    }

    #[test]
    fn throw_to_an_uninterruptibly_masked_target_is_independent() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let mut dep = DepState::new();
        dep.set_masking(t1, MaskingState::MaskedUninterruptible);
        assert!(!dependent(t0, &ThreadAction::ThrowTo(t1), t1, &ThreadAction::Yield, &dep));
    }

    #[test]
    fn fork_is_dependent_with_the_forked_child() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let dep = DepState::new();
        assert!(dependent(t0, &ThreadAction::Fork(t1), t1, &ThreadAction::Yield, &dep));
    }

    #[test]
    fn lookahead_on_the_same_mvar_is_conservatively_dependent() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let t1 = ids.next_thread();
        let m = ids.next_mvar();
        let dep = DepState::new();
        assert!(dependent_lookahead(t0, &ThreadAction::TakeMVar(m, Vec::new()), t1, &Lookahead::PutMVar(m), &dep));
    }

    #[test]
    fn same_thread_is_never_dependent_with_itself() {
        let ids = IdSource::new();
        let t0 = ids.next_thread();
        let c = ids.next_cref();
        let dep = DepState::new();
        assert!(!dependent(t0, &ThreadAction::WriteCRef(c), t0, &ThreadAction::WriteCRef(c), &dep));
    }
}
