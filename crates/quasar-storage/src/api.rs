//! Storage Contracts
//!
//! The two traits the rest of the system programs against:
//!
//! - [`BlockProvider`]: consumed by the tree engine. Lock a per-stream
//!   segment, append node blobs, read them back by address, and manage
//!   superblocks and stream versions.
//! - [`StreamCatalog`]: consumed by the query API. Create and look up
//!   streams by collection and tags, and manage annotations.
//!
//! Both are implemented by
//! [`crate::provider::ObjectStorageProvider`] and shared as
//! `Arc<dyn BlockProvider>` / `Arc<dyn StreamCatalog>`.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use quasar_core::{Result, StreamInfo};
use uuid::Uuid;

/// A locked per-stream write session.
///
/// At most one segment may be locked per UUID at a time; the ingest
/// layer's per-stream mutex enforces this. Writes are strictly
/// sequential: each call must pass the address returned by the
/// previous one (or [`Segment::base_address`] for the first).
#[async_trait]
pub trait Segment: Send {
    /// The address of the first free byte when the segment was locked.
    fn base_address(&self) -> u64;

    /// Append one blob at `address`, which must equal the previous
    /// return value. Returns the address for the next write - usually
    /// `address + len + 2`, or the base of a freshly allocated object
    /// when the next blob would no longer fit in the current one.
    async fn write(&mut self, address: u64, data: &[u8]) -> Result<u64>;

    /// Ensure every earlier write is persisted before returning.
    async fn flush(&mut self) -> Result<()>;

    /// Flush, release the write handle, and remember the final address
    /// so a later lock of the same stream can keep filling this object.
    /// The segment must not be used afterwards.
    async fn unlock(&mut self) -> Result<()>;
}

/// Block storage consumed by the tree engine.
#[async_trait]
pub trait BlockProvider: Send + Sync {
    /// Lock the write segment for a stream, blocking for a write
    /// handle and an address allocation.
    async fn lock_segment(&self, uuid: Uuid) -> Result<Box<dyn Segment>>;

    /// Read the blob at `address`. Only addresses previously returned
    /// by a segment write (and flushed) are valid.
    async fn read(&self, uuid: Uuid, address: u64) -> Result<Bytes>;

    /// Read the 16-byte superblock for a version. Reading a version
    /// that was never written is an unrecoverable fault.
    async fn read_superblock(&self, uuid: Uuid, version: u64) -> Result<Bytes>;

    /// Write the 16-byte superblock for a version.
    async fn write_superblock(&self, uuid: Uuid, version: u64, data: &[u8]) -> Result<()>;

    /// Latest generation of a stream; 0 if the stream does not exist.
    async fn get_stream_version(&self, uuid: Uuid) -> Result<u64>;

    /// Set the latest generation of a stream. Callers serialise version
    /// changes per stream; writing a version lower than the current one
    /// is a rollback and is permitted, though no space is reclaimed and
    /// superblocks above the new version remain readable.
    async fn set_stream_version(&self, uuid: Uuid, version: u64) -> Result<()>;

    /// Whether the stream has been created.
    async fn stream_exists(&self, uuid: Uuid) -> Result<bool>;
}

/// Stream catalog consumed by the query API.
#[async_trait]
pub trait StreamCatalog: Send + Sync {
    /// Create a stream. Fails with `StreamExists` if the UUID is taken,
    /// `SameStream`/`AmbiguousStream` if the (collection, tags) pair
    /// collides, and `WrongEndpoint` if this node does not own the UUID.
    async fn create_stream(
        &self,
        uuid: Uuid,
        collection: &str,
        tags: &HashMap<String, String>,
        annotation: &[u8],
    ) -> Result<()>;

    /// Collection, tags and current version of a stream.
    async fn get_stream_info(&self, uuid: Uuid) -> Result<(StreamInfo, u64)>;

    /// Streams in a collection. With `partial` every stream is
    /// returned and `tags` is ignored; otherwise `tags` must identify
    /// exactly one stream.
    async fn list_streams(
        &self,
        collection: &str,
        partial: bool,
        tags: &HashMap<String, String>,
    ) -> Result<Vec<StreamInfo>>;

    /// Up to `limit` collection names with the given prefix, starting
    /// strictly after `start_from` (pass "" to start at the beginning).
    async fn list_collections(
        &self,
        prefix: &str,
        start_from: &str,
        limit: u64,
    ) -> Result<Vec<String>>;

    /// The stream's annotation and its version.
    async fn get_stream_annotation(&self, uuid: Uuid) -> Result<(Bytes, u64)>;

    /// Replace the annotation. `expected_version` must match the
    /// current version, or be 0 to overwrite unconditionally.
    async fn set_stream_annotation(
        &self,
        uuid: Uuid,
        expected_version: u64,
        annotation: &[u8],
    ) -> Result<()>;
}
