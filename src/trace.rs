//! The observed-step record types: what the executor emits, what schedulers
//! see ahead of time, and the full per-execution log built from both.
//!
//! Grounded on `RuntimeEvent` — a flat, serializable enum recording every
//! kind of step a fiber can take — generalized here to one thread-action
//! variant per primitive in the action ADT.

use crate::ids::{CRefId, MVarId, ThreadId, TVarId};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An observed step, emitted once per successful call into the executor.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ThreadAction {
    Fork(ThreadId),
    MyTid,
    Yield,
    Return,
    Stop,
    LiftExternal,
    GetCaps(usize),
    SetCaps(usize),
    Message(String),

    NewMVar(MVarId),
    PutMVar(MVarId, Vec<ThreadId>),
    BlockedPutMVar(MVarId),
    TryPutMVar(MVarId, bool, Vec<ThreadId>),
    ReadMVar(MVarId),
    BlockedReadMVar(MVarId),
    TryReadMVar(MVarId, bool),
    TakeMVar(MVarId, Vec<ThreadId>),
    BlockedTakeMVar(MVarId),
    TryTakeMVar(MVarId, bool, Vec<ThreadId>),

    NewCRef(CRefId),
    ReadCRef(CRefId),
    ReadCRefCas(CRefId),
    ModCRef(CRefId),
    ModCRefCas(CRefId),
    WriteCRef(CRefId),
    CasCRef(CRefId, bool),
    CommitCRef(CRefId),

    NewTVar(TVarId),
    Stm(Vec<TVarId>, Vec<ThreadId>),
    BlockedStm(Vec<TVarId>),

    Throw,
    ThrowTo(ThreadId),
    BlockedThrowTo(ThreadId),
    Catching,
    PopCatching,
    Masking,
    ResetMask,

    Subconcurrency,
    StopSubconcurrency,
}

/// A coarse, one-step-ahead prediction of a thread's next `ThreadAction`,
/// used by schedulers and the dependency function without forcing the step.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Lookahead {
    Fork,
    MyTid,
    Yield,
    Return,
    Stop,
    LiftExternal,
    Caps,
    Message,
    NewMVar,
    PutMVar(MVarId),
    TryPutMVar(MVarId),
    ReadMVar(MVarId),
    TryReadMVar(MVarId),
    TakeMVar(MVarId),
    TryTakeMVar(MVarId),
    NewCRef,
    ReadCRef(CRefId),
    WriteCRef(CRefId),
    CasCRef(CRefId),
    CommitCRef(CRefId),
    NewTVar,
    Stm(Vec<TVarId>),
    Throw,
    ThrowTo(ThreadId),
    Catching,
    Masking,
    Subconcurrency,
    /// Used when the lookahead source cannot peek past an opaque
    /// `LiftExternal` or similar without running it.
    Unknown,
}

/// How the scheduler's choice at one step related to its choice at the
/// previous step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Decision {
    Continue,
    SwitchTo(ThreadId),
    Start(ThreadId),
}

/// One entry of a full execution trace.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TraceEntry {
    pub decision: Decision,
    pub runnable: Vec<(ThreadId, Lookahead)>,
    pub action: ThreadAction,
}

/// The full ordered record of one execution.
pub type Trace = Vec<TraceEntry>;

/// Whether `action` is a "release" operation for fair-bound purposes: one
/// that could plausibly hand control to another thread even absent a
/// pre-emption. Used both by backtracking insertion (§4.6) and the
/// explorer's daemon-kill reordering heuristic (§4.7, DESIGN.md open
/// question 3).
pub fn is_release(action: &ThreadAction) -> bool {
    matches!(
        action,
        ThreadAction::Yield
            | ThreadAction::PutMVar(..)
            | ThreadAction::BlockedPutMVar(..)
            | ThreadAction::TakeMVar(..)
            | ThreadAction::BlockedTakeMVar(..)
            | ThreadAction::ReadMVar(..)
            | ThreadAction::BlockedReadMVar(..)
            | ThreadAction::Stm(..)
            | ThreadAction::BlockedStm(..)
            | ThreadAction::ThrowTo(..)
            | ThreadAction::BlockedThrowTo(..)
    )
}
