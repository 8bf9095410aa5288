use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fields::Fields;

// -- Range reads --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Entries with key <= bound (or the newest when unbounded); the last
    /// `limit` of them, returned oldest first.
    #[default]
    Backward,
    /// Entries with key >= bound (or the oldest when unbounded); the first
    /// `limit` of them.
    Forward,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeQuery {
    pub bound: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Hard cap on a single range read.
pub const MAX_RANGE_LIMIT: u32 = 500;

// -- Writes --

/// Keys may be `/`-separated paths; `null` removes the addressed field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteRequest {
    pub fields: Fields,
}

// -- Path values and compare-and-set --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueQuery {
    pub path: String,
}

/// A value at a path together with the revision of the entry that holds it.
/// Revision 0 means the entry does not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Option<Value>,
    pub revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareAndSetRequest {
    pub path: String,
    pub expected_revision: u64,
    pub value: Value,
}
