//! Chunk Read Cache with Single-Flight Coalescing
//!
//! Reads arrive blob by blob, but the object store is only efficient
//! when asked for large ranges. This cache turns per-blob reads into
//! amortised 1 MiB chunk reads:
//!
//! 1. A blob read maps to one (rarely two) chunk-aligned addresses.
//! 2. Each chunk is fetched once and kept in a sharded LRU.
//! 3. Concurrent misses on the same chunk coalesce: one fetch runs,
//!    every waiter gets the same `Bytes`.
//!
//! ## Sharding
//!
//! Sixteen shards keyed by the chunk address, each behind its own
//! mutex, so concurrent lookups of different chunks never contend.
//! Shard mutexes guard only map operations - never I/O.
//!
//! ## Eviction
//!
//! Chunks are shared immutable `Bytes`; evicting one only drops the
//! cache's reference, so readers holding it keep a live slice.
//!
//! ## Single Flight
//!
//! A separate table tracks in-flight fetches per (stream, chunk). The
//! first miss becomes the fetcher; later misses park on a oneshot
//! receiver and are fanned the result - including a failure, so an
//! object-store fault propagates to every coalesced reader.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use lru::LruCache;
use quasar_core::Result;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{CHUNK_SIZE, NUM_RHANDLES};

const NUM_SHARDS: usize = 16;

/// Identity of one in-flight chunk fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub uuid: Uuid,
    /// Chunk-aligned address.
    pub addr: u64,
}

/// Outcome of [`ChunkCache::begin`] for a chunk lookup.
pub enum ChunkSlot {
    /// The chunk was cached.
    Cached(Bytes),
    /// Nobody is fetching this chunk; the caller must fetch and then
    /// call [`ChunkCache::complete`].
    MustFetch,
    /// Another task is fetching; await the receiver for the outcome.
    Wait(oneshot::Receiver<Result<Bytes>>),
}

/// Sharded LRU of 1 MiB read chunks plus the single-flight table.
pub struct ChunkCache {
    shards: Vec<Mutex<LruCache<u64, Bytes>>>,
    in_flight: Mutex<HashMap<ChunkKey, Vec<oneshot::Sender<Result<Bytes>>>>>,
    /// Bytes actually fetched from the store.
    actual_read: AtomicI64,
    /// Blob bytes served to readers.
    read_used: AtomicI64,
}

impl ChunkCache {
    /// Build a cache holding up to `budget_mib` one-MiB chunks. The
    /// floor of twice the read-handle count keeps one chunk per
    /// concurrent fetch plus headroom.
    pub fn new(budget_mib: u64) -> Self {
        let total = (budget_mib as usize).max(2 * NUM_RHANDLES);
        let per_shard = NonZeroUsize::new(total.div_ceil(NUM_SHARDS).max(1))
            .expect("per-shard capacity is positive");
        let shards = (0..NUM_SHARDS)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self {
            shards,
            in_flight: Mutex::new(HashMap::new()),
            actual_read: AtomicI64::new(0),
            read_used: AtomicI64::new(0),
        }
    }

    fn shard(&self, addr: u64) -> &Mutex<LruCache<u64, Bytes>> {
        &self.shards[((addr >> CHUNK_SIZE.trailing_zeros()) as usize) % NUM_SHARDS]
    }

    /// Cached chunk at a chunk-aligned address, refreshing recency.
    pub fn get(&self, addr: u64) -> Option<Bytes> {
        self.shard(addr)
            .lock()
            .expect("chunk shard poisoned")
            .get(&addr)
            .cloned()
    }

    /// Insert a chunk, evicting the least recently used on overflow.
    pub fn put(&self, addr: u64, chunk: Bytes) {
        self.shard(addr)
            .lock()
            .expect("chunk shard poisoned")
            .put(addr, chunk);
    }

    /// Drop the chunk at `addr`; called after a write mutated the
    /// chunk's backing object.
    pub fn invalidate(&self, addr: u64) {
        self.shard(addr)
            .lock()
            .expect("chunk shard poisoned")
            .pop(&addr);
    }

    /// Look up a chunk, joining or starting a single-flight fetch on a
    /// miss. See [`ChunkSlot`].
    pub fn begin(&self, key: ChunkKey) -> ChunkSlot {
        if let Some(chunk) = self.get(key.addr) {
            return ChunkSlot::Cached(chunk);
        }
        let mut in_flight = self.in_flight.lock().expect("in-flight table poisoned");
        // Re-check under the table lock: the fetcher may have completed
        // between the cache miss and here.
        if let Some(chunk) = self.get(key.addr) {
            return ChunkSlot::Cached(chunk);
        }
        match in_flight.get_mut(&key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                ChunkSlot::Wait(rx)
            }
            None => {
                in_flight.insert(key, Vec::new());
                ChunkSlot::MustFetch
            }
        }
    }

    /// Finish a single-flight fetch: cache the chunk on success and fan
    /// the outcome out to every parked waiter.
    pub fn complete(&self, key: ChunkKey, outcome: Result<Bytes>) {
        if let Ok(chunk) = &outcome {
            self.put(key.addr, chunk.clone());
        }
        let waiters = self
            .in_flight
            .lock()
            .expect("in-flight table poisoned")
            .remove(&key)
            .unwrap_or_default();
        for tx in waiters {
            // A waiter that gave up dropped its receiver; that's fine.
            let _ = tx.send(outcome.clone());
        }
    }

    /// Record bytes fetched from the store.
    pub fn note_actual_read(&self, n: usize) {
        self.actual_read.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// Record blob bytes served to a reader.
    pub fn note_read_used(&self, n: usize) {
        self.read_used.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// (bytes fetched, bytes served) - the cache's amortisation ratio.
    pub fn stats(&self) -> (i64, i64) {
        (
            self.actual_read.load(Ordering::Relaxed),
            self.read_used.load(Ordering::Relaxed),
        )
    }
}
