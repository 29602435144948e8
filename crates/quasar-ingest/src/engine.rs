//! Tree Engine Seam
//!
//! The coalescer hands committed batches to the tree engine, which
//! owns the copy-on-write tree algorithms (node splits, statistical
//! rollups, superblock advancement) and performs the actual block
//! writes through the storage provider. Keeping it behind a trait
//! lets the coalescer be tested with a recording stub and keeps the
//! tree logic out of this crate entirely.

use async_trait::async_trait;
use quasar_core::{Record, Result};
use uuid::Uuid;

/// The external tree logic the coalescer commits through.
#[async_trait]
pub trait TreeEngine: Send + Sync {
    /// Insert a committed batch into the stream's tree, advancing its
    /// generation. Called under the stream's ingest mutex.
    async fn insert_values(&self, uuid: Uuid, records: Vec<Record>) -> Result<()>;

    /// Delete all records in `[start, end)` from the stream's tree.
    /// Called under the stream's ingest mutex, after any pending batch
    /// has been committed.
    async fn delete_range(&self, uuid: Uuid, start: i64, end: i64) -> Result<()>;
}
