//! Batching: key sources, range calculation and iteration.

pub mod iterator;
pub mod relation;

pub use iterator::{next_range, next_sub_batch, range_from, BatchRange};
pub use relation::{compute_bounds, quote_qualified, validate_identifier, KeySource, TableRelation};
