//! Object Store Adapter
//!
//! This module defines the seam between the storage engine and the
//! remote object store. The engine needs more than plain GET/PUT: it
//! reads and writes byte ranges inside objects, attaches extended
//! attributes, maintains ordered key/value maps, and takes advisory
//! locks. [`ObjectAdapter`] and [`ObjectHandle`] model exactly that
//! surface and nothing more.
//!
//! ## Handles
//!
//! A handle corresponds to one open connection into a pool of objects.
//! Handles are expensive to open and cheap to share, so the engine
//! opens a fixed number at startup and recycles them through
//! [`crate::pool::HandlePool`].
//!
//! ## Failure Model
//!
//! Every operation fails with one of three [`AdapterError`] kinds:
//!
//! - `NotFound`: the object (or attribute) does not exist
//! - `Transient`: the store was reachable but the operation failed;
//!   safe to retry at a higher level
//! - `Fatal`: the connection or cluster is unusable
//!
//! Callers decide what `NotFound` means: listings treat it as an empty
//! result, a missing `version` attribute reads as version 0, and a
//! missing superblock is an unrecoverable fault.
//!
//! ## Implementations
//!
//! - [`memory::MemoryObjectAdapter`]: hermetic in-memory backend for
//!   tests and local development
//! - A production backend binds the same trait to the real cluster
//!   client.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quasar_core::AdapterResult;

pub use memory::MemoryObjectAdapter;

/// One open connection to an object pool.
///
/// All methods are `&self`: a handle may be used from one task at a
/// time (the pool enforces this) but holds no client-visible state
/// between calls.
#[async_trait]
pub trait ObjectHandle: Send + Sync {
    /// Read up to `len` bytes at `offset`. Returns fewer bytes when the
    /// object ends early; fails with `NotFound` when it does not exist.
    async fn read(&self, oid: &str, offset: u64, len: usize) -> AdapterResult<Bytes>;

    /// Write `data` at `offset`, extending the object as needed. The
    /// adapter owns `data` until the write completes.
    async fn write(&self, oid: &str, offset: u64, data: Bytes) -> AdapterResult<()>;

    /// Replace the object's entire contents.
    async fn write_full(&self, oid: &str, data: Bytes) -> AdapterResult<()>;

    /// Read one extended attribute.
    async fn get_xattr(&self, oid: &str, name: &str) -> AdapterResult<Bytes>;

    /// Set one extended attribute, creating the object if necessary.
    async fn set_xattr(&self, oid: &str, name: &str, value: Bytes) -> AdapterResult<()>;

    /// List every extended attribute on an object.
    async fn list_xattrs(&self, oid: &str) -> AdapterResult<HashMap<String, Bytes>>;

    /// Insert entries into the object's ordered key/value map, creating
    /// the object if necessary.
    async fn set_omap(&self, oid: &str, entries: Vec<(String, Bytes)>) -> AdapterResult<()>;

    /// List ordered-map entries with keys strictly after `start_after`
    /// that begin with `prefix`, up to `limit` of them, in key order.
    async fn get_omap_range(
        &self,
        oid: &str,
        start_after: &str,
        prefix: &str,
        limit: u64,
    ) -> AdapterResult<Vec<(String, Bytes)>>;

    /// Take a named exclusive advisory lock on an object. Does not
    /// return until the lock is held (waiting out a live holder or its
    /// TTL) or the store reports a fatal fault.
    async fn lock_exclusive(
        &self,
        oid: &str,
        lock_name: &str,
        cookie: &str,
        owner: &str,
        ttl: Duration,
    ) -> AdapterResult<()>;

    /// Release a named advisory lock.
    async fn unlock(&self, oid: &str, lock_name: &str, cookie: &str) -> AdapterResult<()>;
}

/// Factory for object handles, one per backing store.
#[async_trait]
pub trait ObjectAdapter: Send + Sync {
    /// Open a connection to the named pool.
    async fn open(&self, pool: &str) -> AdapterResult<Arc<dyn ObjectHandle>>;
}
