//! End-to-end scenarios against the public interpreter/explorer surface.

use std::cell::RefCell;
use std::rc::Rc;

use concheck::stm::Stm;
use concheck::{explore, run_concurrency, Action, ExecutionOptions, Failure, Lookahead, Scheduler, ThreadAction, ThreadId, Trace, Value};

/// Always picks the lowest-numbered runnable thread. Deterministic, so it's
/// only suitable for programs whose outcome doesn't depend on scheduling
/// order; races are explored with `explore` instead.
struct FirstRunnable;

impl Scheduler for FirstRunnable {
    type State = ();

    fn schedule(
        &self,
        _prefix: &Trace,
        _prior: Option<(ThreadId, ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
        state: Self::State,
    ) -> (Option<ThreadId>, Self::State) {
        (runnable.first().map(|(t, _)| *t), state)
    }
}

#[test]
fn mvar_deadlock_on_take_from_empty() {
    let program = Action::NewMVar(Box::new(|id| Action::TakeMVar(id, Box::new(|_| Action::Stop))));
    let options = ExecutionOptions::new();
    let (result, trace, _) = run_concurrency(&FirstRunnable, &options, program, ());
    assert!(matches!(result, Err(Failure::Deadlock(1))));
    assert!(matches!(trace.last().unwrap().action, ThreadAction::BlockedTakeMVar(_)));
}

#[test]
fn atomically_return_is_a_single_stm_step_with_empty_sets() {
    let program = Action::Atomically(
        Box::new(|| Stm::Return(Value::Int(42))),
        Box::new(|_v| Action::Stop),
    );
    let options = ExecutionOptions::new();
    let (result, trace, _) = run_concurrency(&FirstRunnable, &options, program, ());
    assert!(result.is_ok());
    let stm_steps: Vec<_> = trace.iter().filter(|e| matches!(e.action, ThreadAction::Stm(..))).collect();
    assert_eq!(stm_steps.len(), 1);
    match &stm_steps[0].action {
        ThreadAction::Stm(read_set, woken) => {
            assert!(read_set.is_empty());
            assert!(woken.is_empty());
        }
        _ => unreachable!(),
    }
}

#[test]
fn masking_then_reset_round_trips_through_the_trace() {
    use concheck::thread::MaskingState;

    let program = Action::Masking(
        MaskingState::MaskedUninterruptible,
        Box::new(|| Action::ResetMask(true, true, MaskingState::Unmasked, Box::new(|| Action::Stop))),
    );
    let options = ExecutionOptions::new();
    let (result, trace, _) = run_concurrency(&FirstRunnable, &options, program, ());
    assert!(result.is_ok());
    let actions: Vec<_> = trace.iter().map(|e| &e.action).collect();
    assert!(matches!(actions[0], ThreadAction::Masking));
    assert!(matches!(actions[1], ThreadAction::ResetMask));
}

#[test]
fn cas_progress_has_exactly_one_success_and_one_failure() {
    let outcomes: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(Vec::new()));
    let options = ExecutionOptions::new();
    let out = outcomes.clone();

    let explorations = explore(&options, move || {
        let out = out.clone();
        Action::NewCRef(
            Value::Int(0),
            Box::new(move |c| {
                let out = out.clone();
                Action::ReadCRefCas(
                    c,
                    Box::new(move |ticket| {
                        let out = out.clone();
                        Action::Fork(
                            Box::new(move || Action::WriteCRef(c, Value::Int(8), Box::new(|| Action::Stop))),
                            Box::new(move |_child| {
                                Action::CasCRef(
                                    c,
                                    ticket,
                                    Value::Int(7),
                                    Box::new(move |ok, _new_ticket| {
                                        out.borrow_mut().push(ok);
                                        Action::Stop
                                    }),
                                )
                            }),
                        )
                    }),
                )
            }),
        )
    });

    assert!(!explorations.is_empty());
    let recorded = outcomes.borrow();
    assert_eq!(recorded.iter().filter(|&&ok| ok).count(), 1, "expected exactly one successful CAS across all schedules");
    assert_eq!(recorded.iter().filter(|&&ok| !ok).count(), 1, "expected exactly one failed CAS across all schedules");
}

#[test]
fn stm_retry_wakeup_appears_in_some_schedule_and_is_avoided_in_another() {
    let options = ExecutionOptions::new();

    let explorations = explore(&options, || {
        Action::NewTVar(
            Value::Int(0),
            Box::new(|tv| {
                Action::Fork(
                    Box::new(move || {
                        Action::Atomically(
                            Box::new(move || Stm::WriteTVar(tv, Value::Int(1), Box::new(|| Stm::Return(Value::Unit)))),
                            Box::new(|_| Action::Stop),
                        )
                    }),
                    Box::new(move |_writer| {
                        Action::Atomically(
                            Box::new(move || {
                                Stm::ReadTVar(
                                    tv,
                                    Box::new(|v| match v {
                                        Value::Int(1) => Stm::Return(Value::Unit),
                                        _ => Stm::Retry,
                                    }),
                                )
                            }),
                            Box::new(|_| Action::Stop),
                        )
                    }),
                )
            }),
        )
    });

    assert!(!explorations.is_empty());
    let any_blocked = explorations
        .iter()
        .any(|e| e.trace.iter().any(|t| matches!(t.action, ThreadAction::BlockedStm(_))));
    let any_unblocked = explorations
        .iter()
        .any(|e| !e.trace.iter().any(|t| matches!(t.action, ThreadAction::BlockedStm(_))));
    assert!(any_blocked, "expected at least one schedule where the reader retries before the writer runs");
    assert!(any_unblocked, "expected at least one schedule where the writer runs first and the reader never blocks");
}

#[test]
fn two_writer_race_under_sequential_consistency_reaches_both_outcomes() {
    let reads: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
    let options = ExecutionOptions::new();
    let out = reads.clone();

    let explorations = explore(&options, move || {
        let out = out.clone();
        Action::NewCRef(
            Value::Int(0),
            Box::new(move |cref| {
                let out = out.clone();
                Action::NewMVar(Box::new(move |done1| {
                    let out = out.clone();
                    Action::NewMVar(Box::new(move |done2| {
                        let out = out.clone();
                        Action::Fork(
                            Box::new(move || {
                                Action::WriteCRef(
                                    cref,
                                    Value::Int(1),
                                    Box::new(move || Action::PutMVar(done1, Value::Unit, Box::new(|| Action::Stop))),
                                )
                            }),
                            Box::new(move |_w1| {
                                let out = out.clone();
                                Action::Fork(
                                    Box::new(move || {
                                        Action::WriteCRef(
                                            cref,
                                            Value::Int(2),
                                            Box::new(move || Action::PutMVar(done2, Value::Unit, Box::new(|| Action::Stop))),
                                        )
                                    }),
                                    Box::new(move |_w2| {
                                        let out = out.clone();
                                        Action::TakeMVar(
                                            done1,
                                            Box::new(move |_| {
                                                let out = out.clone();
                                                Action::TakeMVar(
                                                    done2,
                                                    Box::new(move |_| {
                                                        Action::ReadCRef(
                                                            cref,
                                                            Box::new(move |v| {
                                                                if let Value::Int(n) = v {
                                                                    out.borrow_mut().push(n);
                                                                }
                                                                Action::Stop
                                                            }),
                                                        )
                                                    }),
                                                )
                                            }),
                                        )
                                    }),
                                )
                            }),
                        )
                    }))
                }))
            }),
        )
    });

    assert!(!explorations.is_empty());
    let mut distinct: Vec<i64> = reads.borrow().clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct, vec![1, 2], "both final reads of the racing writers should be reachable");
}
