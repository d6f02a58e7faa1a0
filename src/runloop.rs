//! The run-loop: repeatedly asks the scheduler which thread advances, ticks
//! the executor, and folds the result into a trace.
//!
//! Grounded on `engine.rs`'s `tick_instance`/`start`: classify state, pick
//! the next unit of work, tick it, record one event, loop until terminal.

use crate::action::Action;
use crate::error::Failure;
use crate::exec::{self, Context, Step};
use crate::ids::{ThreadId, INITIAL_THREAD};
use crate::membuf::MemoryModel;
use crate::options::ExecutionOptions;
use crate::scheduler::Scheduler;
use crate::thread::{interruptible, BlockReason};
use crate::trace::{Decision, Lookahead, Trace, TraceEntry};
use crate::value::Value;
use tracing::{debug, warn};

/// One-step-ahead prediction for `tid`, without forcing its continuation.
///
/// This is necessarily approximate for variants whose payload is opaque
/// (`LiftExternal`'s effect, a `ModCRef` closure): the lookahead only
/// inspects the tag and any already-known arguments.
fn lookahead_for(ctx: &Context, tid: ThreadId) -> Lookahead {
    let Some(thread) = ctx.threads.get(&tid) else {
        return Lookahead::Unknown;
    };
    match &thread.continuation {
        Some(Action::Fork(..)) => Lookahead::Fork,
        Some(Action::MyTid(_)) => Lookahead::MyTid,
        Some(Action::Yield(_)) => Lookahead::Yield,
        Some(Action::Return(_)) => Lookahead::Return,
        Some(Action::Stop) => Lookahead::Stop,
        Some(Action::LiftExternal(..)) => Lookahead::LiftExternal,
        Some(Action::GetCaps(_)) | Some(Action::SetCaps(..)) => Lookahead::Caps,
        Some(Action::Message(..)) => Lookahead::Message,
        Some(Action::NewMVar(_)) => Lookahead::NewMVar,
        Some(Action::PutMVar(id, ..)) => Lookahead::PutMVar(*id),
        Some(Action::TryPutMVar(id, ..)) => Lookahead::TryPutMVar(*id),
        Some(Action::ReadMVar(id, _)) => Lookahead::ReadMVar(*id),
        Some(Action::TryReadMVar(id, _)) => Lookahead::TryReadMVar(*id),
        Some(Action::TakeMVar(id, _)) => Lookahead::TakeMVar(*id),
        Some(Action::TryTakeMVar(id, _)) => Lookahead::TryTakeMVar(*id),
        Some(Action::NewCRef(..)) => Lookahead::NewCRef,
        Some(Action::ReadCRef(id, _)) | Some(Action::ReadCRefCas(id, _)) => Lookahead::ReadCRef(*id),
        Some(Action::ModCRef(id, ..)) | Some(Action::ModCRefCas(id, ..)) | Some(Action::WriteCRef(id, ..)) => {
            Lookahead::WriteCRef(*id)
        }
        Some(Action::CasCRef(id, ..)) => Lookahead::CasCRef(*id),
        Some(Action::NewTVar(..)) => Lookahead::NewTVar,
        Some(Action::Atomically(build, _)) => {
            // Peek by running the builder once outside the committed
            // interpreter state; this is safe because it only inspects
            // reads/writes, never applied here.
            let peek = crate::stm::run_transaction(build(), |_| Value::Unit);
            match peek {
                crate::stm::StmOutcome::Success { read_set, .. } => {
                    Lookahead::Stm(read_set.into_iter().collect())
                }
                crate::stm::StmOutcome::Retry { watch_set } => Lookahead::Stm(watch_set.into_iter().collect()),
                crate::stm::StmOutcome::Exception(_) => Lookahead::Throw,
            }
        }
        Some(Action::Throw(_)) => Lookahead::Throw,
        Some(Action::ThrowTo(target, ..)) => Lookahead::ThrowTo(*target),
        Some(Action::Catching(..)) => Lookahead::Catching,
        Some(Action::PopCatching(_)) => Lookahead::Catching,
        Some(Action::Masking(..)) | Some(Action::ResetMask(..)) => Lookahead::Masking,
        Some(Action::Subconcurrency(..)) | Some(Action::StopSubconcurrency) => Lookahead::Subconcurrency,
        None => Lookahead::Unknown,
    }
}

fn runnable_with_lookahead(ctx: &Context) -> Vec<(ThreadId, Lookahead)> {
    let mut out: Vec<(ThreadId, Lookahead)> = ctx
        .threads
        .iter()
        .filter(|(_, t)| t.is_runnable())
        .map(|(id, _)| (*id, lookahead_for(ctx, *id)))
        .collect();
    // Ephemeral commit "threads": each pending write-buffer queue gets its
    // own id (never colliding with a real thread id, see `WriteBuffer`), so
    // the scheduler can choose to run a commit just like a regular thread.
    for (commit_id, key) in ctx.write_buffer.pending_commits() {
        if let Some(cref) = ctx.write_buffer.peek_front_cref(key) {
            out.push((commit_id, Lookahead::CommitCRef(cref)));
        }
    }
    out.sort_by_key(|(id, _)| *id);
    out
}

fn classify_deadlock(ctx: &Context, runnable: &[(ThreadId, Lookahead)]) -> Option<Failure> {
    if !runnable.is_empty() {
        return None;
    }
    let blocked_on_tvar = ctx
        .threads
        .values()
        .filter(|t| matches!(t.blocking, Some(BlockReason::OnTVar(_))))
        .count();
    let blocked_other = ctx
        .threads
        .values()
        .filter(|t| {
            matches!(
                t.blocking,
                Some(BlockReason::OnMVarFull(_)) | Some(BlockReason::OnMVarEmpty(_)) | Some(BlockReason::OnMask(_))
            )
        })
        .count();
    if blocked_other > 0 {
        Some(Failure::Deadlock(blocked_other))
    } else if blocked_on_tvar > 0 {
        Some(Failure::StmDeadlock(blocked_on_tvar))
    } else {
        None
    }
}

/// Runs `program` to completion under `scheduler`, starting from a fresh
/// `IdSource` and thread table.
///
/// Returns the scheduler's final state alongside the result and trace so
/// callers that thread bookkeeping through `S::State` (the DPOR explorer's
/// `ignore`/`bound_kill` flags, in particular) can inspect it after an
/// aborted run without that state having to be smuggled out some other way.
pub fn run_concurrency<S: Scheduler>(
    scheduler: &S,
    options: &ExecutionOptions,
    program: Action,
    initial_state: S::State,
) -> (Result<Value, Failure>, Trace, S::State) {
    let mut ctx = Context::new(options.memory_model, program);
    let mut trace = Vec::new();
    let mut sched_state = initial_state;
    let mut prior: Option<(ThreadId, crate::trace::ThreadAction)> = None;

    let span = tracing::info_span!("run_concurrency", model = ?options.memory_model);
    let _guard = span.enter();

    loop {
        if !ctx.threads.contains_key(&INITIAL_THREAD) {
            debug!("initial thread gone, execution complete");
            return (Ok(Value::Unit), trace, sched_state);
        }

        let runnable = runnable_with_lookahead(&ctx);
        if let Some(fail) = classify_deadlock(&ctx, &runnable) {
            warn!(?fail, "no runnable thread");
            return (Err(fail), trace, sched_state);
        }

        let (choice, next_state) = scheduler.schedule(&trace, prior.clone(), &runnable, sched_state);
        sched_state = next_state;
        let Some(tid) = choice else {
            debug!("scheduler aborted execution");
            return (Err(Failure::Abort), trace, sched_state);
        };

        let decision = match &prior {
            Some((p, _)) if *p == tid => Decision::Continue,
            Some((p, _)) if ctx.is_runnable(*p) => Decision::SwitchTo(tid),
            _ => Decision::Start(tid),
        };

        if let Some(key) = ctx.write_buffer.key_for_commit_id(tid) {
            let action = exec::commit_step(&mut ctx, key);
            trace.push(TraceEntry {
                decision,
                runnable: runnable.clone(),
                action: action.clone(),
            });
            prior = Some((tid, action));
            continue;
        }

        if !ctx.is_runnable(tid) {
            return (Err(Failure::InternalError(tid)), trace, sched_state);
        }

        match exec::step(&mut ctx, tid) {
            Ok(Step::Single(action)) => {
                wake_mask_waiters(&mut ctx, tid);
                trace.push(TraceEntry {
                    decision,
                    runnable: runnable.clone(),
                    action: action.clone(),
                });
                prior = Some((tid, action));
            }
            Ok(Step::SubC(subtrace, action)) => {
                wake_mask_waiters(&mut ctx, tid);
                trace.extend(subtrace);
                trace.push(TraceEntry {
                    decision,
                    runnable: runnable.clone(),
                    action: action.clone(),
                });
                prior = Some((tid, action));
            }
            Err(fail) => return (Err(fail), trace, sched_state),
        }
    }
}

/// After `tid` steps, wakes any thread blocked `OnMask(tid)` if `tid` has
/// become interruptible (its blocking state may have just changed).
fn wake_mask_waiters(ctx: &mut Context, tid: ThreadId) {
    let now_interruptible = ctx.threads.get(&tid).map(interruptible).unwrap_or(true);
    if !now_interruptible {
        return;
    }
    let waiters: Vec<ThreadId> = ctx
        .threads
        .iter()
        .filter(|(_, t)| matches!(&t.blocking, Some(BlockReason::OnMask(m)) if *m == tid))
        .map(|(id, _)| *id)
        .collect();
    for w in waiters {
        ctx.threads.get_mut(&w).unwrap().blocking = None;
    }
}

/// A trivial round-robin scheduler used to drive a `Subconcurrency`'s nested
/// execution: a full DPOR exploration of the nested part is out of scope
/// (see DESIGN.md) — `Subconcurrency` is restricted to single-thread
/// contexts, so the interesting choice is only ever among the inner threads
/// the nested computation itself forks.
struct RoundRobin;

impl Scheduler for RoundRobin {
    type State = Option<ThreadId>;

    fn schedule(
        &self,
        _prefix: &Trace,
        _prior: Option<(ThreadId, crate::trace::ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
        state: Self::State,
    ) -> (Option<ThreadId>, Self::State) {
        if runnable.is_empty() {
            return (None, state);
        }
        let next = match state {
            Some(last) => runnable
                .iter()
                .find(|(id, _)| *id > last)
                .or_else(|| runnable.first())
                .map(|(id, _)| *id),
            None => runnable.first().map(|(id, _)| *id),
        };
        (next, next)
    }
}

/// Runs `start` as a nested computation sharing `ctx`'s cells, id
/// source, memory model and capabilities, per `Subconcurrency`'s contract
/// (§4.1). `caller` is the thread that invoked `Subconcurrency`: its
/// continuation was already taken before this call, so it must be
/// excluded from the nested loop's runnable set even though nothing
/// else marks it blocked. Returns the nested outcome (approximated as
/// `Value::Unit` on success, see DESIGN.md) and its trace.
pub fn run_nested(ctx: &mut Context, caller: ThreadId, start: Action) -> (Result<Value, Failure>, Trace) {
    let root = ctx.ids.next_thread();
    ctx.threads.insert(root, crate::thread::Thread::new(root, start));
    let scheduler = RoundRobin;
    let mut sched_state = None;
    let mut trace = Vec::new();
    let mut prior: Option<(ThreadId, crate::trace::ThreadAction)> = None;

    let result = loop {
        if !ctx.threads.contains_key(&root) {
            break Ok(Value::Unit);
        }
        let runnable: Vec<(ThreadId, Lookahead)> =
            runnable_with_lookahead(ctx).into_iter().filter(|(id, _)| *id != caller).collect();
        if let Some(fail) = classify_deadlock(ctx, &runnable) {
            break Err(fail);
        }
        let (choice, next_state) = scheduler.schedule(&trace, prior.clone(), &runnable, sched_state);
        sched_state = next_state;
        let Some(tid) = choice else {
            break Err(Failure::Abort);
        };
        let decision = match &prior {
            Some((p, _)) if *p == tid => Decision::Continue,
            Some((p, _)) if ctx.is_runnable(*p) => Decision::SwitchTo(tid),
            _ => Decision::Start(tid),
        };

        if let Some(key) = ctx.write_buffer.key_for_commit_id(tid) {
            let action = exec::commit_step(ctx, key);
            trace.push(TraceEntry {
                decision,
                runnable: runnable.clone(),
                action: action.clone(),
            });
            prior = Some((tid, action));
            continue;
        }

        match exec::step(ctx, tid) {
            Ok(Step::Single(action)) => {
                trace.push(TraceEntry {
                    decision,
                    runnable: runnable.clone(),
                    action: action.clone(),
                });
                prior = Some((tid, action));
            }
            Ok(Step::SubC(sub, action)) => {
                trace.extend(sub);
                trace.push(TraceEntry {
                    decision,
                    runnable: runnable.clone(),
                    action: action.clone(),
                });
                prior = Some((tid, action));
            }
            Err(fail) => break Err(fail),
        }
    };

    (result, trace)
}
