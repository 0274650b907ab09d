//! Replication primitives: the per-field LWW envelope, the grow-only
//! tombstone set, and the consistent map that composes the two.
//!
//! All three merges are commutative, associative, and idempotent on resolved
//! state, and the map merge is *driving*: applying its `local` output
//! locally and its `remote` output remotely reaches a fixed point after one
//! round.

mod envelope;
mod growset;
mod map;

pub use envelope::{Consistent, Envelope, FieldEdit, FieldMeta, LwwMerge, merge};
pub use growset::{GrowSet, GrowSetMerge};
pub use map::{ConsistentMap, MapMerge, MapSideEffect};
