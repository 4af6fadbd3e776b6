//! B+tree read and write paths: point lookup, range walking, the batched
//! copy-on-write modifier, and the sorted-tree builders used by
//! compaction.

pub mod builder;
pub mod lookup;
pub mod modify;

pub use lookup::TreeWalker;
pub use modify::{Action, Modifier, ModifySpec, PurgeAction, PurgeHook};
