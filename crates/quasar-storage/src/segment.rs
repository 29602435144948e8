//! Segment Writer - The Per-Stream Append Path
//!
//! A segment is a locked write session for one stream. Node blobs are
//! length-prefixed and packed back to back into 16 MiB objects; the
//! segment keeps a 1 MiB write buffer so that many small blobs turn
//! into few object-store writes.
//!
//! ## Address Discipline
//!
//! Writes are strictly sequential: each call passes the address the
//! previous call returned. A blob never straddles two objects - when
//! the *next* blob could no longer fit before the 16 MiB boundary, the
//! segment pulls a fresh object allocation and the write returns that
//! new base instead of `address + len + 2`.
//!
//! ## Blob Layout
//!
//! ```text
//! ┌────────────┬───────────────────┐
//! │ len (2 LE) │ payload (len ≤ 20485)
//! └────────────┴───────────────────┘
//! ```
//!
//! ## The Segment-Address Cache
//!
//! Objects average far below 16 MiB if every session starts a new one.
//! On unlock, if the final address still has room for another blob in
//! its object, the (uuid, address) pair goes into a small cache; the
//! next lock of the same stream resumes exactly there, so consecutive
//! sessions keep filling the same object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use quasar_core::{Error, Result};
use uuid::Uuid;

use crate::adapter::ObjectHandle;
use crate::api::Segment;
use crate::pool::PooledHandle;
use crate::provider::ProviderShared;
use crate::{
    oid, MAX_EXPECTED_OBJECT_SIZE, OFFSET_MASK, SEGCACHE_SIZE, WORTH_CACHING, WRITE_CACHE_SIZE,
};

/// Remembers where each stream's last segment stopped writing.
///
/// Bounded at [`SEGCACHE_SIZE`] entries; overflow drops the whole map.
/// That is rare enough that the cost (one short object per stream) is
/// not worth an eviction policy.
#[derive(Default)]
pub struct SegmentAddressCache {
    map: Mutex<HashMap<Uuid, u64>>,
}

impl SegmentAddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the cached resume address for a stream.
    pub fn take(&self, uuid: &Uuid) -> Option<u64> {
        self.map.lock().expect("segcache poisoned").remove(uuid)
    }

    /// Remember a resume address, pruning wholesale at capacity.
    pub fn insert(&self, uuid: Uuid, naddr: u64) {
        let mut map = self.map.lock().expect("segcache poisoned");
        if map.len() >= SEGCACHE_SIZE {
            map.clear();
        }
        map.insert(uuid, naddr);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().expect("segcache poisoned").len()
    }
}

/// A locked per-stream write session over the object store.
pub struct ObjectSegment {
    shared: Arc<ProviderShared>,
    /// Write handle, held until unlock.
    handle: Option<PooledHandle>,
    uuid: Uuid,
    /// First free address when the segment was locked.
    base: u64,
    /// Next expected write address.
    naddr: u64,
    /// Pending bytes not yet sent to the store.
    wcache: BytesMut,
    /// Address of the first byte in `wcache`.
    wcache_base: u64,
}

impl ObjectSegment {
    pub(crate) fn new(
        shared: Arc<ProviderShared>,
        handle: PooledHandle,
        uuid: Uuid,
        base: u64,
    ) -> Self {
        Self {
            shared,
            handle: Some(handle),
            uuid,
            base,
            naddr: base,
            wcache: BytesMut::with_capacity(WRITE_CACHE_SIZE),
            wcache_base: base,
        }
    }

    fn handle(&self) -> Result<&PooledHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("segment already unlocked".into()))
    }

    /// Push the write buffer to the object store and invalidate any
    /// read-cache chunks it overlaps.
    async fn flush_write(&mut self) -> Result<()> {
        if self.wcache.is_empty() {
            return Ok(());
        }
        let buf = std::mem::replace(&mut self.wcache, BytesMut::with_capacity(WRITE_CACHE_SIZE))
            .freeze();
        let base = self.wcache_base;
        let object_id = base >> 24;
        let offset = base & OFFSET_MASK;
        let oid = oid::data(&self.uuid, object_id);

        // The adapter owns `buf` until the write completes, so the
        // bytes stay alive for the store's benefit without any pinning
        // bookkeeping here.
        self.handle()?
            .handle()
            .write(&oid, offset, buf.clone())
            .await?;

        let mut invalidated = base & crate::CHUNK_ADDR_MASK;
        let end = base + buf.len() as u64;
        while invalidated < end {
            self.shared.rcache.invalidate(invalidated);
            invalidated += crate::CHUNK_SIZE;
        }

        self.wcache_base = self.naddr;
        Ok(())
    }
}

#[async_trait]
impl Segment for ObjectSegment {
    fn base_address(&self) -> u64 {
        self.base
    }

    async fn write(&mut self, address: u64, data: &[u8]) -> Result<u64> {
        if address != self.naddr {
            return Err(Error::InvalidArgument(format!(
                "non-sequential write: expected {:#x}, got {address:#x}",
                self.naddr
            )));
        }
        if data.len() > MAX_EXPECTED_OBJECT_SIZE {
            return Err(Error::InvalidArgument(format!(
                "blob of {} bytes exceeds the {MAX_EXPECTED_OBJECT_SIZE} byte limit",
                data.len()
            )));
        }

        if self.wcache.len() + data.len() + 2 > WRITE_CACHE_SIZE {
            self.flush_write().await?;
        }

        self.wcache.put_u16_le(data.len() as u16);
        self.wcache.put_slice(data);
        self.shared.note_bytes_written(data.len());

        let naddr = address + data.len() as u64 + 2;

        // The next blob, at worst case size, must stay inside this
        // object; otherwise later reads through the chunk cache would
        // see a blob spanning objects.
        if (naddr + MAX_EXPECTED_OBJECT_SIZE as u64 + 2) >> 24 != address >> 24 {
            let fresh = self.shared.alloc.next().await?;
            self.naddr = fresh;
            self.flush_write().await?;
            return Ok(fresh);
        }
        self.naddr = naddr;
        Ok(naddr)
    }

    async fn flush(&mut self) -> Result<()> {
        self.flush_write().await
    }

    async fn unlock(&mut self) -> Result<()> {
        self.flush_write().await?;
        if self.naddr & OFFSET_MASK < WORTH_CACHING {
            self.shared.segcache.insert(self.uuid, self.naddr);
        }
        // Returns the write handle to the pool.
        self.handle.take();
        Ok(())
    }
}

// Unit tests for the boundary arithmetic live here; end-to-end segment
// behaviour (including the cache interplay) is exercised in
// tests/provider_test.rs where a full provider is available.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segcache_insert_take() {
        let cache = SegmentAddressCache::new();
        let id = Uuid::new_v4();
        cache.insert(id, 0x0100_2000);
        assert_eq!(cache.take(&id), Some(0x0100_2000));
        assert_eq!(cache.take(&id), None);
    }

    #[test]
    fn test_segcache_prunes_wholesale_at_capacity() {
        let cache = SegmentAddressCache::new();
        for _ in 0..SEGCACHE_SIZE {
            cache.insert(Uuid::new_v4(), 1);
        }
        assert_eq!(cache.len(), SEGCACHE_SIZE);
        // The insert that would exceed capacity clears everything first.
        let survivor = Uuid::new_v4();
        cache.insert(survivor, 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.take(&survivor), Some(2));
    }

    #[test]
    fn test_boundary_predicate() {
        // A fresh object has plenty of room.
        let address = 0x0100_0000u64;
        let naddr = address + 100 + 2;
        assert_eq!(
            (naddr + MAX_EXPECTED_OBJECT_SIZE as u64 + 2) >> 24,
            address >> 24
        );

        // Near the end of the object the worst-case next blob no
        // longer fits, even though this blob did.
        let address = 0x01FF_FB00u64;
        let naddr = address + 100 + 2;
        assert_ne!(
            (naddr + MAX_EXPECTED_OBJECT_SIZE as u64 + 2) >> 24,
            address >> 24
        );
    }
}
