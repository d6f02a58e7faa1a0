//! Opaque identifiers for simulated threads and memory cells.

use std::cell::Cell;
use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(ThreadId);
id_type!(MVarId);
id_type!(CRefId);
id_type!(TVarId);

/// The root thread every `run_concurrency` call starts with. A program
/// terminates the instant this id disappears from the thread table (I6).
pub const INITIAL_THREAD: ThreadId = ThreadId(0);

/// Monotonically increasing source of identifiers, one per `run_concurrency`
/// call. The engine is single-host-threaded, so a `Cell` is enough; there is
/// never a second caller to race with.
#[derive(Debug, Default)]
pub struct IdSource {
    threads: Cell<u64>,
    mvars: Cell<u64>,
    crefs: Cell<u64>,
    tvars: Cell<u64>,
}

impl IdSource {
    pub fn new() -> Self {
        Self {
            threads: Cell::new(INITIAL_THREAD.raw() + 1),
            mvars: Cell::new(0),
            crefs: Cell::new(0),
            tvars: Cell::new(0),
        }
    }

    pub fn next_thread(&self) -> ThreadId {
        let v = self.threads.get();
        self.threads.set(v + 1);
        ThreadId(v)
    }

    pub fn next_mvar(&self) -> MVarId {
        let v = self.mvars.get();
        self.mvars.set(v + 1);
        MVarId(v)
    }

    pub fn next_cref(&self) -> CRefId {
        let v = self.crefs.get();
        self.crefs.set(v + 1);
        CRefId(v)
    }

    pub fn next_tvar(&self) -> TVarId {
        let v = self.tvars.get();
        self.tvars.set(v + 1);
        TVarId(v)
    }
}

/// A random, human-readable tag for diagnostics (trace dumps, test failure
/// messages). Not used for identity — only ever compared as a string.
#[cfg(feature = "diagnostic-tags")]
pub fn random_tag() -> String {
    uuid::Uuid::new_v4().to_string()
}
