//! Per-thread state: continuation, blocking reason, masking, handler stack.

use crate::action::{Action, Exc};
use crate::ids::{CRefId, MVarId, ThreadId, TVarId};
use std::collections::BTreeSet;
use std::fmt;

/// Why a thread is currently not runnable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockReason {
    OnMVarFull(MVarId),
    OnMVarEmpty(MVarId),
    OnTVar(BTreeSet<TVarId>),
    OnMask(ThreadId),
}

/// A thread's masking state, controlling whether `ThrowTo` can interrupt it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MaskingState {
    #[default]
    Unmasked,
    MaskedInterruptible,
    MaskedUninterruptible,
}

/// Installed by `Catching`. Tries to produce a resuming `Action` for a
/// thrown exception; declining (returning `None`) lets the search continue
/// to the next handler out.
pub type Handler = Box<dyn Fn(&Exc) -> Option<Action>>;

/// One simulated thread's full state.
pub struct Thread {
    pub id: ThreadId,
    pub continuation: Option<Action>,
    pub blocking: Option<BlockReason>,
    pub masking: MaskingState,
    pub handlers: Vec<Handler>,
    pub known_mvars: BTreeSet<MVarId>,
    pub known_crefs: BTreeSet<CRefId>,
    #[cfg(feature = "diagnostic-tags")]
    pub tag: Option<String>,
}

impl Thread {
    pub fn new(id: ThreadId, start: Action) -> Self {
        Self {
            id,
            continuation: Some(start),
            blocking: None,
            masking: MaskingState::Unmasked,
            handlers: Vec::new(),
            known_mvars: BTreeSet::new(),
            known_crefs: BTreeSet::new(),
            #[cfg(feature = "diagnostic-tags")]
            tag: None,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.blocking.is_none()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("blocking", &self.blocking)
            .field("masking", &self.masking)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Whether `thread` can currently be the target of an asynchronous
/// `ThrowTo`. Shared between the run-loop's `OnMask` wakeup check and
/// `ThrowTo`'s own dispatch arm so the two can never drift apart (DESIGN.md,
/// open question 1).
pub fn interruptible(thread: &Thread) -> bool {
    match thread.masking {
        MaskingState::Unmasked => true,
        MaskingState::MaskedUninterruptible => false,
        MaskingState::MaskedInterruptible => matches!(
            thread.blocking,
            Some(BlockReason::OnMVarFull(_))
                | Some(BlockReason::OnMVarEmpty(_))
                | Some(BlockReason::OnTVar(_))
        ),
    }
}
