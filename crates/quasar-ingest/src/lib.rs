//! Quasar Ingest Coalescer
//!
//! Inserting a handful of records at a time into a copy-on-write tree
//! would rewrite the root path once per handful. This crate batches
//! per-stream insertions in memory and commits each batch through the
//! tree engine exactly once, when either
//!
//! - the batch reaches `coalesce_max_points` records (committed
//!   synchronously by the inserting task), or
//! - the batch turns `coalesce_max_interval_ms` old (committed by a
//!   per-batch timer task).
//!
//! ## Serialisation
//!
//! All mutation of one stream - batch appends, commits, range deletes -
//! happens under that stream's mutex, so at most one commit per stream
//! is in flight at any instant and a batch never spans two commits.
//!
//! ## Seams
//!
//! The actual tree writes are behind [`TreeEngine`]; this crate never
//! touches storage directly except to ask the block provider whether a
//! stream exists before opening a batch for it.

pub mod coalescer;
pub mod engine;

pub use coalescer::IngestCoalescer;
pub use engine::TreeEngine;
