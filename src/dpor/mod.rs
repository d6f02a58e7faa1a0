//! The bounded Dynamic Partial-Order Reduction explorer: a schedule tree,
//! the dependency and bound predicates over it, backtracking-point
//! discovery, and the scheduler/driver that ties them together.
//!
//! No prior art for any of this in a workflow VM — it runs exactly one
//! schedule per process instance — so everything here is built from
//! first principles, in an idiom of plain structs and small free
//! functions rather than a framework of traits.

pub mod backtrack;
pub mod bounds;
pub mod deps;
pub mod explorer;
pub mod tree;

pub use explorer::{explore, Exploration};
