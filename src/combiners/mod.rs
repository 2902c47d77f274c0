//! Reusable folding and ranking pieces for the stateful stages.
//!
//! - [`RowCombiner`]: the reduce function a [`KeyedReducer`](crate::stages::KeyedReducer)
//!   applies per key. Built-ins: [`SumField`] and [`CountRows`].
//! - [`SortedGroup`]: the capped, descending list a
//!   [`TopKSorter`](crate::stages::TopKSorter) keeps per group key, ordered by a
//!   pair of [`SortValue`]s.
//!
//! # Examples
//! ```
//! use stageflow::combiners::{RowCombiner, SumField};
//! use stageflow::row;
//!
//! let sum = SumField::new("final_amount", "tpv");
//! let mut acc = sum.create();
//! assert!(sum.add_input(&mut acc, &row! { "final_amount" => "10.25" }));
//! assert!(sum.add_input(&mut acc, &row! { "final_amount" => "4.75" }));
//! assert_eq!(sum.finish(acc), "15");
//! ```

mod basic;
mod topk;

pub use basic::{CountRows, RowCombiner, SumField, format_amount};
pub use topk::{SortValue, SortedGroup};
