//! Top-level knobs for one `run_concurrency`/`explore` call.
//!
//! Plain structs with `new()`/`with_*` builders, in the same spirit as the
//! `CompileResult`/inspection-struct pattern elsewhere in this crate — no
//! external config-file format is implied anywhere in this crate's surface.

use crate::membuf::MemoryModel;

/// Exploration bounds. Defaults follow common pre-emption-bounding practice:
/// a small pre-emption budget catches almost every real bug while keeping
/// the search tractable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bounds {
    pub preemption: u32,
    pub fair: u32,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            preemption: 2,
            fair: 5,
        }
    }
}

impl Bounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preemption(mut self, pb: u32) -> Self {
        self.preemption = pb;
        self
    }

    pub fn with_fair(mut self, fb: u32) -> Self {
        self.fair = fb;
        self
    }
}

/// Options for one `run_concurrency` call.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    pub memory_model: MemoryModel,
    pub bounds: Bounds,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_model(mut self, model: MemoryModel) -> Self {
        self.memory_model = model;
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }
}
