//! The four stage kinds.
//!
//! Single-input kinds are [`StageLogic`](crate::runtime::StageLogic)
//! implementations driven by a [`StageRuntime`](crate::runtime::StageRuntime):
//!
//! - [`TransformStage`]: per-row filter / map / projection, forwarded as it goes.
//! - [`KeyedReducer`]: fold per key tuple, flushed when the session closes.
//! - [`TopKSorter`]: K best rows per group, flushed when the session closes.
//!
//! [`TwoStreamJoiner`] has two inputs and drives itself.

mod join;
mod reduce;
mod topk;
pub mod transform;

pub use join::{JoinInput, JoinSpec, Side, TwoStreamJoiner};
pub use reduce::KeyedReducer;
pub use topk::TopKSorter;
pub use transform::{Predicate, Rewrite, Step, TransformStage};
