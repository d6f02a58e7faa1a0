//! The single-step executor: consumes one chosen thread's next `Action` and
//! produces the resulting state change plus the `ThreadAction` it observed.
//!
//! Grounded on `vm.rs::tick_fiber` — one large `match` over a tagged
//! instruction, each arm mutating state, appending one record, and
//! returning an outcome. Here the "instruction" is `Action` and the
//! "record" is `ThreadAction`.

use crate::action::Action;
use crate::cref::CRef;
use crate::error::Failure;
use crate::ids::{CRefId, IdSource, MVarId, ThreadId, TVarId, INITIAL_THREAD};
use crate::membuf::{BufferKey, BufferedWrite, MemoryModel, WriteBuffer};
use crate::mvar::MVar;
use crate::stm::{run_transaction, StmOutcome};
use crate::thread::{interruptible, BlockReason, Thread};
use crate::trace::ThreadAction;
use crate::value::Value;
use std::collections::BTreeMap;

/// All simulated state for one `run_concurrency` call.
pub struct Context {
    pub threads: BTreeMap<ThreadId, Thread>,
    pub mvars: BTreeMap<MVarId, MVar>,
    pub crefs: BTreeMap<CRefId, CRef>,
    pub tvars: BTreeMap<TVarId, Value>,
    pub write_buffer: WriteBuffer,
    pub ids: IdSource,
    pub memory_model: MemoryModel,
    pub caps: usize,
}

impl Context {
    pub fn new(memory_model: MemoryModel, start: Action) -> Self {
        let ids = IdSource::new();
        let mut threads = BTreeMap::new();
        threads.insert(INITIAL_THREAD, Thread::new(INITIAL_THREAD, start));
        Self {
            threads,
            mvars: BTreeMap::new(),
            crefs: BTreeMap::new(),
            tvars: BTreeMap::new(),
            write_buffer: WriteBuffer::default(),
            ids,
            memory_model,
            caps: 1,
        }
    }

    pub fn is_runnable(&self, tid: ThreadId) -> bool {
        self.threads.get(&tid).map(|t| t.is_runnable()).unwrap_or(false)
    }
}

fn take_continuation(ctx: &mut Context, tid: ThreadId) -> Action {
    ctx.threads
        .get_mut(&tid)
        .and_then(|t| t.continuation.take())
        .expect("executor only invoked on a thread with a pending continuation")
}

fn resume(ctx: &mut Context, tid: ThreadId, next: Action) {
    if let Some(thread) = ctx.threads.get_mut(&tid) {
        thread.continuation = Some(next);
    }
}

/// Records which MVars/CRefs this step's action names, for the `Thread`
/// record's `known_mvars`/`known_crefs` sets (§3's "set of ids touched").
fn note_touched(ctx: &mut Context, tid: ThreadId, action: &Action) {
    let mvar = match action {
        Action::PutMVar(id, ..)
        | Action::TryPutMVar(id, ..)
        | Action::ReadMVar(id, _)
        | Action::TryReadMVar(id, _)
        | Action::TakeMVar(id, _)
        | Action::TryTakeMVar(id, _) => Some(*id),
        _ => None,
    };
    let cref = match action {
        Action::ReadCRef(id, _)
        | Action::ReadCRefCas(id, _)
        | Action::ModCRef(id, ..)
        | Action::ModCRefCas(id, ..)
        | Action::WriteCRef(id, ..)
        | Action::CasCRef(id, ..) => Some(*id),
        _ => None,
    };
    if let Some(thread) = ctx.threads.get_mut(&tid) {
        if let Some(id) = mvar {
            thread.known_mvars.insert(id);
        }
        if let Some(id) = cref {
            thread.known_crefs.insert(id);
        }
    }
}

/// Flushes every buffered write of `thread`, committing each in enqueued
/// order. Called before any synchronising action (§4.3).
fn write_barrier(ctx: &mut Context, thread: ThreadId) {
    if ctx.memory_model == MemoryModel::SequentialConsistency {
        return;
    }
    for key in ctx.write_buffer.pending_keys_for(thread) {
        while let Some(BufferedWrite { cref, value }) = ctx.write_buffer.pop_front(key) {
            if let Some(cell) = ctx.crefs.get_mut(&cref) {
                cell.commit(value);
            }
        }
    }
}

fn store_cref(ctx: &mut Context, thread: ThreadId, cref: CRefId, value: Value) {
    match ctx.memory_model {
        MemoryModel::SequentialConsistency => {
            if let Some(cell) = ctx.crefs.get_mut(&cref) {
                cell.commit(value);
            }
        }
        model => {
            let key = WriteBuffer::key_for(model, thread, cref);
            ctx.write_buffer.push(&ctx.ids, key, BufferedWrite { cref, value });
        }
    }
}

fn read_cref(ctx: &Context, thread: ThreadId, cref: CRefId) -> Value {
    ctx.write_buffer
        .forwarded(ctx.memory_model, thread, cref)
        .unwrap_or_else(|| ctx.crefs.get(&cref).map(|c| c.value.clone()).unwrap_or(Value::Unit))
}

/// Clears the blocking flag for every id in `drained` (already removed from
/// its wait queue) and returns them in FIFO order.
fn wake_all(ctx: &mut Context, drained: std::collections::VecDeque<ThreadId>) -> Vec<ThreadId> {
    let woken: Vec<ThreadId> = drained.into_iter().collect();
    for tid in &woken {
        if let Some(t) = ctx.threads.get_mut(tid) {
            t.blocking = None;
        }
    }
    woken
}

fn wake_tvar_waiters(ctx: &mut Context, written: &std::collections::BTreeSet<TVarId>) -> Vec<ThreadId> {
    let mut woken = Vec::new();
    for (tid, thread) in ctx.threads.iter_mut() {
        if let Some(BlockReason::OnTVar(watch)) = &thread.blocking {
            if !watch.is_disjoint(written) {
                thread.blocking = None;
                woken.push(*tid);
            }
        }
    }
    woken
}

/// Delivers `exc` to `tid`'s handler stack, searching top-down. If no
/// handler accepts it: the initial thread fails the whole execution with
/// `UncaughtException`; any other thread simply dies.
fn deliver_throw(ctx: &mut Context, tid: ThreadId, exc: Value) -> Result<ThreadAction, Failure> {
    loop {
        let handler = match ctx.threads.get_mut(&tid) {
            Some(t) => t.handlers.pop(),
            None => None,
        };
        match handler {
            Some(h) => {
                if let Some(next) = h(&exc) {
                    resume(ctx, tid, next);
                    return Ok(ThreadAction::Throw);
                }
                // Handler declined; keep unwinding.
            }
            None => {
                if tid == INITIAL_THREAD {
                    return Err(Failure::UncaughtException(format!("{exc:?}")));
                }
                ctx.threads.remove(&tid);
                return Ok(ThreadAction::Throw);
            }
        }
    }
}

/// What the executor produced for one chosen thread on one step.
pub enum Step {
    Single(ThreadAction),
    /// A `Subconcurrency` completed; the embedded sub-trace should be
    /// appended verbatim to the caller's trace alongside this one step.
    SubC(crate::trace::Trace, ThreadAction),
}

/// Executes one step for `tid`, which must be runnable with a pending
/// continuation.
pub fn step(ctx: &mut Context, tid: ThreadId) -> Result<Step, Failure> {
    let action = take_continuation(ctx, tid);
    note_touched(ctx, tid, &action);
    let single = |ta: ThreadAction| Ok(Step::Single(ta));

    match action {
        Action::Fork(body, k) => {
            let new_tid = ctx.ids.next_thread();
            let start = body();
            ctx.threads.insert(new_tid, Thread::new(new_tid, start));
            resume(ctx, tid, k(new_tid));
            single(ThreadAction::Fork(new_tid))
        }
        Action::MyTid(k) => {
            resume(ctx, tid, k(tid));
            single(ThreadAction::MyTid)
        }
        Action::Yield(k) => {
            resume(ctx, tid, k());
            single(ThreadAction::Yield)
        }
        Action::Return(k) => {
            resume(ctx, tid, k());
            single(ThreadAction::Return)
        }
        Action::Stop => {
            ctx.threads.remove(&tid);
            single(ThreadAction::Stop)
        }
        Action::LiftExternal(effect, k) => {
            let v = effect();
            resume(ctx, tid, k(v));
            single(ThreadAction::LiftExternal)
        }
        Action::GetCaps(k) => {
            let caps = ctx.caps;
            resume(ctx, tid, k(caps));
            single(ThreadAction::GetCaps(caps))
        }
        Action::SetCaps(n, k) => {
            ctx.caps = n;
            resume(ctx, tid, k());
            single(ThreadAction::SetCaps(n))
        }
        Action::Message(msg, k) => {
            resume(ctx, tid, k());
            single(ThreadAction::Message(msg))
        }

        Action::NewMVar(k) => {
            let id = ctx.ids.next_mvar();
            ctx.mvars.insert(id, MVar::new_empty());
            resume(ctx, tid, k(id));
            single(ThreadAction::NewMVar(id))
        }
        Action::PutMVar(id, v, k) => {
            write_barrier(ctx, tid);
            let full = ctx.mvars.get(&id).expect("unknown MVarId").is_full();
            if full {
                ctx.mvars.get_mut(&id).unwrap().waiting_full.push_back(tid);
                ctx.threads.get_mut(&tid).unwrap().blocking = Some(BlockReason::OnMVarFull(id));
                resume(ctx, tid, Action::PutMVar(id, v, k));
                single(ThreadAction::BlockedPutMVar(id))
            } else {
                let drained = {
                    let mvar = ctx.mvars.get_mut(&id).unwrap();
                    mvar.value = Some(v);
                    std::mem::take(&mut mvar.waiting_empty)
                };
                let woken = wake_all(ctx, drained);
                resume(ctx, tid, k());
                single(ThreadAction::PutMVar(id, woken))
            }
        }
        Action::TryPutMVar(id, v, k) => {
            write_barrier(ctx, tid);
            let full = ctx.mvars.get(&id).expect("unknown MVarId").is_full();
            if full {
                resume(ctx, tid, k(false));
                single(ThreadAction::TryPutMVar(id, false, Vec::new()))
            } else {
                let drained = {
                    let mvar = ctx.mvars.get_mut(&id).unwrap();
                    mvar.value = Some(v);
                    std::mem::take(&mut mvar.waiting_empty)
                };
                let woken = wake_all(ctx, drained);
                resume(ctx, tid, k(true));
                single(ThreadAction::TryPutMVar(id, true, woken))
            }
        }
        Action::ReadMVar(id, k) => {
            write_barrier(ctx, tid);
            let current = ctx.mvars.get(&id).expect("unknown MVarId").value.clone();
            if let Some(v) = current {
                resume(ctx, tid, k(v));
                single(ThreadAction::ReadMVar(id))
            } else {
                ctx.mvars.get_mut(&id).unwrap().waiting_empty.push_back(tid);
                ctx.threads.get_mut(&tid).unwrap().blocking = Some(BlockReason::OnMVarEmpty(id));
                resume(ctx, tid, Action::ReadMVar(id, k));
                single(ThreadAction::BlockedReadMVar(id))
            }
        }
        Action::TryReadMVar(id, k) => {
            write_barrier(ctx, tid);
            let v = ctx.mvars.get(&id).expect("unknown MVarId").value.clone();
            let was_full = v.is_some();
            resume(ctx, tid, k(v));
            single(ThreadAction::TryReadMVar(id, was_full))
        }
        Action::TakeMVar(id, k) => {
            write_barrier(ctx, tid);
            let taken = ctx.mvars.get_mut(&id).expect("unknown MVarId").value.take();
            if let Some(v) = taken {
                let drained = std::mem::take(&mut ctx.mvars.get_mut(&id).unwrap().waiting_full);
                let woken = wake_all(ctx, drained);
                resume(ctx, tid, k(v));
                single(ThreadAction::TakeMVar(id, woken))
            } else {
                ctx.mvars.get_mut(&id).unwrap().waiting_empty.push_back(tid);
                ctx.threads.get_mut(&tid).unwrap().blocking = Some(BlockReason::OnMVarEmpty(id));
                resume(ctx, tid, Action::TakeMVar(id, k));
                single(ThreadAction::BlockedTakeMVar(id))
            }
        }
        Action::TryTakeMVar(id, k) => {
            write_barrier(ctx, tid);
            let taken = ctx.mvars.get_mut(&id).expect("unknown MVarId").value.take();
            if let Some(v) = taken {
                let drained = std::mem::take(&mut ctx.mvars.get_mut(&id).unwrap().waiting_full);
                let woken = wake_all(ctx, drained);
                resume(ctx, tid, k(Some(v)));
                single(ThreadAction::TryTakeMVar(id, true, woken))
            } else {
                resume(ctx, tid, k(None));
                single(ThreadAction::TryTakeMVar(id, false, Vec::new()))
            }
        }

        Action::NewCRef(v, k) => {
            let id = ctx.ids.next_cref();
            ctx.crefs.insert(id, CRef::new(v));
            resume(ctx, tid, k(id));
            single(ThreadAction::NewCRef(id))
        }
        Action::ReadCRef(id, k) => {
            let v = read_cref(ctx, tid, id);
            resume(ctx, tid, k(v));
            single(ThreadAction::ReadCRef(id))
        }
        Action::ReadCRefCas(id, k) => {
            let ticket = ctx.crefs.get(&id).expect("unknown CRefId").ticket_for(tid);
            resume(ctx, tid, k(ticket));
            single(ThreadAction::ReadCRefCas(id))
        }
        Action::ModCRef(id, f, k) => {
            write_barrier(ctx, tid);
            let current = read_cref(ctx, tid, id);
            let (new_value, ret) = f(current);
            store_cref(ctx, tid, id, new_value);
            resume(ctx, tid, k(ret));
            single(ThreadAction::ModCRef(id))
        }
        Action::ModCRefCas(id, f, k) => {
            // Single-stepped execution means no other thread can interleave
            // inside this callback, so this coincides with `ModCRef`.
            write_barrier(ctx, tid);
            let current = read_cref(ctx, tid, id);
            let (new_value, ret) = f(current);
            store_cref(ctx, tid, id, new_value);
            resume(ctx, tid, k(ret));
            single(ThreadAction::ModCRefCas(id))
        }
        Action::WriteCRef(id, v, k) => {
            store_cref(ctx, tid, id, v);
            resume(ctx, tid, k());
            single(ThreadAction::WriteCRef(id))
        }
        Action::CasCRef(id, ticket, v, k) => {
            write_barrier(ctx, tid);
            let cell = ctx.crefs.get_mut(&id).expect("unknown CRefId");
            let ok = cell.cas(&ticket, v);
            let new_ticket = cell.ticket_for(tid);
            resume(ctx, tid, k(ok, new_ticket));
            single(ThreadAction::CasCRef(id, ok))
        }

        Action::NewTVar(v, k) => {
            let id = ctx.ids.next_tvar();
            ctx.tvars.insert(id, v);
            resume(ctx, tid, k(id));
            single(ThreadAction::NewTVar(id))
        }
        Action::Atomically(build, k) => {
            write_barrier(ctx, tid);
            let tvars = &ctx.tvars;
            let outcome = run_transaction(build(), |id| tvars.get(&id).cloned().unwrap_or(Value::Unit));
            match outcome {
                StmOutcome::Success { read_set, write_set, value } => {
                    for (id, v) in &write_set {
                        ctx.tvars.insert(*id, v.clone());
                    }
                    let written = write_set.keys().copied().collect();
                    let woken = wake_tvar_waiters(ctx, &written);
                    resume(ctx, tid, k(value));
                    single(ThreadAction::Stm(read_set.into_iter().collect(), woken))
                }
                StmOutcome::Retry { watch_set } => {
                    ctx.threads.get_mut(&tid).unwrap().blocking =
                        Some(BlockReason::OnTVar(watch_set.clone()));
                    resume(ctx, tid, Action::Atomically(build, k));
                    single(ThreadAction::BlockedStm(watch_set.into_iter().collect()))
                }
                StmOutcome::Exception(e) => deliver_throw(ctx, tid, e).map(Step::Single),
            }
        }

        Action::Throw(e) => deliver_throw(ctx, tid, e).map(Step::Single),
        Action::ThrowTo(target, e, k) => {
            let target_interruptible = ctx
                .threads
                .get(&target)
                .map(interruptible)
                .unwrap_or(true); // target already gone: nothing to deliver to
            if target_interruptible {
                if ctx.threads.contains_key(&target) {
                    deliver_throw(ctx, target, e)?;
                }
                if ctx.threads.contains_key(&tid) {
                    resume(ctx, tid, k());
                }
                single(ThreadAction::ThrowTo(target))
            } else {
                ctx.threads.get_mut(&tid).unwrap().blocking = Some(BlockReason::OnMask(target));
                resume(ctx, tid, Action::ThrowTo(target, e, k));
                single(ThreadAction::BlockedThrowTo(target))
            }
        }
        Action::Catching(handler, body) => {
            ctx.threads.get_mut(&tid).unwrap().handlers.push(handler);
            resume(ctx, tid, body());
            single(ThreadAction::Catching)
        }
        Action::PopCatching(k) => {
            ctx.threads.get_mut(&tid).unwrap().handlers.pop();
            resume(ctx, tid, k());
            single(ThreadAction::PopCatching)
        }
        Action::Masking(state, body) => {
            ctx.threads.get_mut(&tid).unwrap().masking = state;
            resume(ctx, tid, body());
            single(ThreadAction::Masking)
        }
        Action::ResetMask(_is_set, _is_explicit, state, k) => {
            ctx.threads.get_mut(&tid).unwrap().masking = state;
            resume(ctx, tid, k());
            single(ThreadAction::ResetMask)
        }

        Action::Subconcurrency(inner, k) => {
            let others = ctx.threads.len() - 1;
            if others != 0 {
                return Err(Failure::IllegalSubconcurrency(others));
            }
            let (result, subtrace) = crate::runloop::run_nested(ctx, tid, inner());
            resume(ctx, tid, k(result));
            Ok(Step::SubC(subtrace, ThreadAction::Subconcurrency))
        }
        Action::StopSubconcurrency => single(ThreadAction::StopSubconcurrency),
    }
}

/// Executes one synthetic commit step for `key`'s oldest buffered write —
/// the run-loop's ephemeral "commit thread" (§4.2 step 2).
pub fn commit_step(ctx: &mut Context, key: BufferKey) -> ThreadAction {
    let write = ctx
        .write_buffer
        .pop_front(key)
        .expect("commit thread only ever scheduled when its queue is non-empty");
    if let Some(cell) = ctx.crefs.get_mut(&write.cref) {
        cell.commit(write.value);
    }
    ThreadAction::CommitCRef(write.cref)
}
