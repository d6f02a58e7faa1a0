//! The synchronous rendezvous cell: empty or full, with FIFO wait queues on
//! each side.

use crate::ids::ThreadId;
use crate::value::Value;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct MVar {
    pub value: Option<Value>,
    pub waiting_full: VecDeque<ThreadId>,
    pub waiting_empty: VecDeque<ThreadId>,
}

impl MVar {
    pub fn new_empty() -> Self {
        Self::default()
    }

    pub fn is_full(&self) -> bool {
        self.value.is_some()
    }
}
