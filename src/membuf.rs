//! Per-thread (or per-thread-per-cell) write buffering for the relaxed
//! memory models.

use crate::ids::{CRefId, IdSource, ThreadId};
use crate::value::Value;
use std::collections::{BTreeMap, VecDeque};

/// Which relaxed-memory discipline governs buffered `CRef` writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MemoryModel {
    #[default]
    SequentialConsistency,
    TotalStoreOrder,
    PartialStoreOrder,
}

/// A pending write not yet folded into its cell's authoritative value.
#[derive(Clone, Debug)]
pub struct BufferedWrite {
    pub cref: CRefId,
    pub value: Value,
}

/// Keys a write-buffer queue: per-thread under TSO, per-thread-per-cell
/// under PSO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BufferKey(pub ThreadId, pub Option<CRefId>);

#[derive(Debug)]
struct Queue {
    /// A dedicated id for this queue's commit pseudo-step, allocated from
    /// the same `IdSource` as real threads so it can never collide with
    /// one. The run-loop schedules it just like a thread; `exec::commit_step`
    /// is what it actually runs.
    commit_id: ThreadId,
    writes: VecDeque<BufferedWrite>,
}

/// Pending buffered writes, queued per `BufferKey`.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    queues: BTreeMap<BufferKey, Queue>,
}

impl WriteBuffer {
    pub fn key_for(model: MemoryModel, thread: ThreadId, cref: CRefId) -> BufferKey {
        match model {
            MemoryModel::SequentialConsistency => {
                unreachable!("sequential consistency never buffers writes")
            }
            MemoryModel::TotalStoreOrder => BufferKey(thread, None),
            MemoryModel::PartialStoreOrder => BufferKey(thread, Some(cref)),
        }
    }

    pub fn push(&mut self, ids: &IdSource, key: BufferKey, write: BufferedWrite) {
        let queue = self.queues.entry(key).or_insert_with(|| Queue {
            commit_id: ids.next_thread(),
            writes: VecDeque::new(),
        });
        queue.writes.push_back(write);
    }

    /// The value most recently written to `cref` by `thread` and still
    /// buffered, if any (thread-local store forwarding).
    pub fn forwarded(&self, model: MemoryModel, thread: ThreadId, cref: CRefId) -> Option<Value> {
        if model == MemoryModel::SequentialConsistency {
            return None;
        }
        let key = Self::key_for(model, thread, cref);
        self.queues
            .get(&key)?
            .writes
            .iter()
            .rev()
            .find(|w| w.cref == cref)
            .map(|w| w.value.clone())
    }

    /// Pops the oldest buffered write under `key`, if any, removing the
    /// queue (and its commit id) once drained.
    pub fn pop_front(&mut self, key: BufferKey) -> Option<BufferedWrite> {
        let queue = self.queues.get_mut(&key)?;
        let w = queue.writes.pop_front();
        if queue.writes.is_empty() {
            self.queues.remove(&key);
        }
        w
    }

    pub fn peek_front_cref(&self, key: BufferKey) -> Option<CRefId> {
        self.queues.get(&key).and_then(|q| q.writes.front()).map(|w| w.cref)
    }

    /// Every key with a pending write belonging to `thread` — used by the
    /// write barrier to flush a thread's own buffer.
    pub fn pending_keys_for(&self, thread: ThreadId) -> Vec<BufferKey> {
        self.queues.keys().filter(|k| k.0 == thread).copied().collect()
    }

    /// `(commit_id, key)` for every queue with at least one pending write —
    /// the run-loop's ephemeral commit threads (§4.2 step 2).
    pub fn pending_commits(&self) -> Vec<(ThreadId, BufferKey)> {
        self.queues.iter().map(|(k, q)| (q.commit_id, *k)).collect()
    }

    /// The buffer key owned by `id`, if `id` is a live commit pseudo-step.
    pub fn key_for_commit_id(&self, id: ThreadId) -> Option<BufferKey> {
        self.queues.iter().find(|(_, q)| q.commit_id == id).map(|(k, _)| *k)
    }

    pub fn is_empty_for(&self, thread: ThreadId) -> bool {
        !self.queues.keys().any(|k| k.0 == thread)
    }
}
