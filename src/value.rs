//! The closed set of values simulated cells, exceptions and transaction
//! results carry.

use crate::ids::CRefId;

/// A value flowing through MVars, CRefs, TVars, and thrown as an exception.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    Ref(CRefId),
}

/// Whether `v` counts as true for `BrIf`-style branching primitives built on
/// top of the engine. Mirrors the host language's usual truthiness: only
/// `Unit` and `Bool(false)` are falsy.
pub fn is_truthy(v: &Value) -> bool {
    !matches!(v, Value::Unit | Value::Bool(false))
}
