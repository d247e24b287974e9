//! Datastream indexes
//!
//! - [`TagIndex`]: query-tag identity lookup plus an inverted
//!   `(key, value) → metrics` index for partial-match queries

mod tag_index;

pub use tag_index::TagIndex;
