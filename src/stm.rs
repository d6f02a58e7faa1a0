//! The STM sub-interpreter: a small CPS language of its own, scoped to the
//! primitives available inside `atomically`.
//!
//! A transaction never partially commits: `run_transaction` only ever
//! returns a `write_set` to be applied all at once on `Success`, or nothing
//! at all on `Retry`/`Exception`. Built directly from the read-set/
//! write-set/retry contract STM needs, in the same "plain struct plus a
//! match on the outcome" shape used elsewhere in this crate.

use crate::ids::TVarId;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One step of a transaction in progress.
pub enum Stm {
    ReadTVar(TVarId, Box<dyn FnOnce(Value) -> Stm>),
    WriteTVar(TVarId, Value, Box<dyn FnOnce() -> Stm>),
    Retry,
    OrElse(Box<dyn FnOnce() -> Stm>, Box<dyn FnOnce() -> Stm>, Box<dyn FnOnce(Value) -> Stm>),
    Throw(Value),
    Return(Value),
}

/// Outcome of running a transaction to completion or to its first blocking
/// point.
pub enum StmOutcome {
    Success {
        read_set: BTreeSet<TVarId>,
        write_set: BTreeMap<TVarId, Value>,
        value: Value,
    },
    Retry {
        watch_set: BTreeSet<TVarId>,
    },
    Exception(Value),
}

/// Runs `stm` against `reader`, a view of committed TVar values. Writes made
/// earlier in the same transaction shadow `reader` so a transaction always
/// sees its own uncommitted writes.
pub fn run_transaction(stm: Stm, reader: impl Fn(TVarId) -> Value) -> StmOutcome {
    let mut read_set = BTreeSet::new();
    let mut write_set = BTreeMap::new();
    run_inner(stm, &reader, &mut read_set, &mut write_set)
}

fn run_inner(
    stm: Stm,
    reader: &impl Fn(TVarId) -> Value,
    read_set: &mut BTreeSet<TVarId>,
    write_set: &mut BTreeMap<TVarId, Value>,
) -> StmOutcome {
    match stm {
        Stm::ReadTVar(id, k) => {
            read_set.insert(id);
            let v = write_set.get(&id).cloned().unwrap_or_else(|| reader(id));
            run_inner(k(v), reader, read_set, write_set)
        }
        Stm::WriteTVar(id, v, k) => {
            write_set.insert(id, v);
            run_inner(k(), reader, read_set, write_set)
        }
        Stm::Retry => StmOutcome::Retry {
            watch_set: read_set.clone(),
        },
        Stm::OrElse(left, right, k) => {
            let mut left_reads = read_set.clone();
            let mut left_writes = write_set.clone();
            match run_inner(left(), reader, &mut left_reads, &mut left_writes) {
                StmOutcome::Retry { .. } => {
                    // Left branch retried: fall through to the right branch,
                    // but still count left's reads as part of the watch set
                    // if right also retries.
                    *read_set = left_reads;
                    match run_inner(right(), reader, read_set, write_set) {
                        StmOutcome::Success { value, .. } => run_inner(k(value), reader, read_set, write_set),
                        other => other,
                    }
                }
                StmOutcome::Success { read_set: rs, write_set: ws, value } => {
                    *read_set = rs;
                    *write_set = ws;
                    run_inner(k(value), reader, read_set, write_set)
                }
                exc => exc,
            }
        }
        Stm::Throw(e) => StmOutcome::Exception(e),
        Stm::Return(v) => StmOutcome::Success {
            read_set: read_set.clone(),
            write_set: write_set.clone(),
            value: v,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdSource;

    #[test]
    fn pure_return_has_empty_sets() {
        let out = run_transaction(Stm::Return(Value::Int(7)), |_| Value::Unit);
        match out {
            StmOutcome::Success { read_set, write_set, value } => {
                assert!(read_set.is_empty());
                assert!(write_set.is_empty());
                assert_eq!(value, Value::Int(7));
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn write_then_read_sees_own_write() {
        let ids = IdSource::new();
        let tv = ids.next_tvar();
        let stm = Stm::WriteTVar(
            tv,
            Value::Int(5),
            Box::new(move || Stm::ReadTVar(tv, Box::new(|v| Stm::Return(v)))),
        );
        let out = run_transaction(stm, |_| Value::Int(0));
        match out {
            StmOutcome::Success { value, .. } => assert_eq!(value, Value::Int(5)),
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn retry_reports_watch_set() {
        let ids = IdSource::new();
        let tv = ids.next_tvar();
        let stm = Stm::ReadTVar(tv, Box::new(|_| Stm::Retry));
        let out = run_transaction(stm, |_| Value::Bool(false));
        match out {
            StmOutcome::Retry { watch_set } => assert!(watch_set.contains(&tv)),
            _ => panic!("expected retry"),
        }
    }
}
