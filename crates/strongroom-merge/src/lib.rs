//! strongroom-merge: three-way reconciliation of two database replicas.
//!
//! The target is mutated in place; the source is read-only. Reconciliation
//! is driven by modification timestamps, `location_changed` stamps, per-entry
//! history, and deletion tombstones, so merging is deterministic for a given
//! pair of inputs and strategy.

pub mod merger;

pub use merger::{Merger, MergeSummary};
