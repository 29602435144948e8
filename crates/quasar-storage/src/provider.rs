//! Object Storage Provider
//!
//! `ObjectStorageProvider` is the concrete storage engine: it owns the
//! handle pools, the address allocator, the chunk cache and the
//! segment-address cache, and implements the [`BlockProvider`] contract
//! the tree engine writes through.
//!
//! ## Initialisation
//!
//! [`ObjectStorageProvider::create_database`] runs once per database
//! lifetime and seeds the allocator counter.
//! [`ObjectStorageProvider::initialize`] runs at every startup: it
//! opens the handle pools, reserves the first lock-range, and starts
//! the background workers (allocation vendor, cache stats ticker).
//!
//! ## Ownership Model
//!
//! Global mutable state lives in explicit provider-owned objects, not
//! ambient singletons. Segments hold an `Arc` of the shared core
//! ([`ProviderShared`]) rather than the provider itself, so the
//! provider always outlives the pieces a segment needs.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use quasar_core::{AdapterError, ClusterState, Error, Result, StorageConfig};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::adapter::{ObjectAdapter, ObjectHandle};
use crate::allocator::AddressAllocator;
use crate::api::{BlockProvider, Segment};
use crate::chunk_cache::{ChunkCache, ChunkKey, ChunkSlot};
use crate::oid;
use crate::pool::HandlePool;
use crate::segment::{ObjectSegment, SegmentAddressCache};
use crate::{
    CHUNK_ADDR_MASK, CHUNK_OFFSET_MASK, CHUNK_SIZE, INITIAL_BASE_ADDRESS,
    MAX_EXPECTED_OBJECT_SIZE, NUM_RHANDLES, NUM_WHANDLES, OFFSET_MASK, SUPERBLOCK_CHUNK_MASK,
    SUPERBLOCK_CHUNK_SHIFT, SUPERBLOCK_SIZE,
};

/// Minimum chunk cache budget in MiB: one chunk per read handle, plus
/// the same again for readahead overlap.
const MIN_READ_CACHE_MIB: u64 = 40;

/// State shared between the provider and its live segments.
pub struct ProviderShared {
    pub(crate) alloc: AddressAllocator,
    pub(crate) rcache: ChunkCache,
    pub(crate) segcache: SegmentAddressCache,
    total_bytes_written: AtomicI64,
}

impl ProviderShared {
    pub(crate) fn note_bytes_written(&self, n: usize) {
        self.total_bytes_written.fetch_add(n as i64, Ordering::Relaxed);
    }
}

/// The object-store-backed block storage engine.
pub struct ObjectStorageProvider {
    pub(crate) cfg: StorageConfig,
    pub(crate) cluster: Arc<dyn ClusterState>,
    pub(crate) read_pool: Arc<HandlePool>,
    pub(crate) write_pool: Arc<HandlePool>,
    pub(crate) shared: Arc<ProviderShared>,
    /// Serialises annotation read-modify-write cycles in this process;
    /// cross-node exclusion comes from stream ownership.
    pub(crate) annotation_mu: tokio::sync::Mutex<()>,
    stats_task: JoinHandle<()>,
}

impl ObjectStorageProvider {
    /// Create the database: seed the allocator counter. Runs once, with
    /// no other node active - there is nothing to lock against yet.
    pub async fn create_database(adapter: &dyn ObjectAdapter, cfg: &StorageConfig) -> Result<()> {
        let handle = adapter.open(&cfg.data_pool).await?;
        handle
            .write_full(
                oid::ALLOCATOR,
                Bytes::copy_from_slice(&INITIAL_BASE_ADDRESS.to_le_bytes()),
            )
            .await
            .map_err(|e| Error::Unrecoverable(format!("could not seed the allocator: {e}")))?;
        info!(pool = %cfg.data_pool, "database created");
        Ok(())
    }

    /// Open the provider for a normal run.
    pub async fn initialize(
        adapter: &dyn ObjectAdapter,
        cfg: StorageConfig,
        cluster: Arc<dyn ClusterState>,
    ) -> Result<Arc<Self>> {
        let cache_mib = cfg.read_cache_mib.max(MIN_READ_CACHE_MIB);
        let read_pool = HandlePool::open(adapter, &cfg.data_pool, NUM_RHANDLES, "read").await?;
        let write_pool = HandlePool::open(adapter, &cfg.data_pool, NUM_WHANDLES, "write").await?;

        let alloc = AddressAllocator::start(Arc::clone(&read_pool)).await?;

        let shared = Arc::new(ProviderShared {
            alloc,
            rcache: ChunkCache::new(cache_mib),
            segcache: SegmentAddressCache::new(),
            total_bytes_written: AtomicI64::new(0),
        });

        let stats_task = tokio::spawn(log_cache_stats(Arc::clone(&shared)));

        info!(
            data_pool = %cfg.data_pool,
            cache_mib,
            "storage provider initialised"
        );
        Ok(Arc::new(Self {
            cfg,
            cluster,
            read_pool,
            write_pool,
            shared,
            annotation_mu: tokio::sync::Mutex::new(()),
            stats_task,
        }))
    }

    /// Fetch one chunk from the store, bypassing the cache.
    async fn fetch_chunk(&self, uuid: Uuid, chunk_addr: u64) -> Result<Bytes> {
        let guard = self.read_pool.acquire().await?;
        let oid = oid::data(&uuid, chunk_addr >> 24);
        let offset = chunk_addr & OFFSET_MASK;
        let chunk = guard
            .handle()
            .read(&oid, offset, CHUNK_SIZE as usize)
            .await?;
        self.shared.rcache.note_actual_read(chunk.len());
        Ok(chunk)
    }

    /// Chunk at a chunk-aligned address, through the cache with
    /// single-flight coalescing of concurrent misses.
    async fn obtain_chunk(&self, uuid: Uuid, chunk_addr: u64) -> Result<Bytes> {
        let key = ChunkKey {
            uuid,
            addr: chunk_addr,
        };
        match self.shared.rcache.begin(key) {
            ChunkSlot::Cached(chunk) => Ok(chunk),
            ChunkSlot::Wait(rx) => rx
                .await
                .map_err(|_| Error::Unrecoverable("chunk fetch abandoned".into()))?,
            ChunkSlot::MustFetch => {
                let outcome = self.fetch_chunk(uuid, chunk_addr).await;
                self.shared.rcache.complete(key, outcome.clone());
                outcome
            }
        }
    }

    /// Total blob bytes accepted by segment writes (diagnostics).
    pub fn total_bytes_written(&self) -> i64 {
        self.shared.total_bytes_written.load(Ordering::Relaxed)
    }

    /// The configuration this provider was initialised with.
    pub fn config(&self) -> &StorageConfig {
        &self.cfg
    }
}

impl Drop for ObjectStorageProvider {
    fn drop(&mut self) {
        self.stats_task.abort();
    }
}

/// Periodic amortisation log: how many bytes the cache fetched versus
/// how many blob bytes it served.
async fn log_cache_stats(shared: Arc<ProviderShared>) {
    let mut last = (0, 0);
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let now = shared.rcache.stats();
        if now != last {
            debug!(fetched = now.0, served = now.1, "chunk cache throughput");
            last = now;
        }
    }
}

#[async_trait]
impl BlockProvider for ObjectStorageProvider {
    async fn lock_segment(&self, uuid: Uuid) -> Result<Box<dyn Segment>> {
        let handle = self.write_pool.acquire().await?;
        let fresh = self.shared.alloc.next().await?;
        // Prefer continuing the object a previous session left behind;
        // the fresh allocation simply goes unused then (space is never
        // reclaimed within a generation).
        let base = self.shared.segcache.take(&uuid).unwrap_or(fresh);
        Ok(Box::new(ObjectSegment::new(
            Arc::clone(&self.shared),
            handle,
            uuid,
            base,
        )))
    }

    async fn read(&self, uuid: Uuid, address: u64) -> Result<Bytes> {
        let first = self.obtain_chunk(uuid, address & CHUNK_ADDR_MASK).await?;
        let offset = (address & CHUNK_OFFSET_MASK) as usize;
        if offset >= first.len() {
            return Err(Error::Corrupt(format!(
                "address {address:#x} is beyond the stored object"
            )));
        }
        let mut chunk1 = first.slice(offset..);
        let mut chunk2: Option<Bytes> = None;

        let len = if chunk1.len() < 2 {
            // The length prefix itself straddles the chunk boundary:
            // one byte here, one byte in the next chunk.
            let next = self
                .obtain_chunk(uuid, (address + CHUNK_SIZE) & CHUNK_ADDR_MASK)
                .await?;
            if next.is_empty() {
                return Err(Error::Corrupt(format!(
                    "length prefix at {address:#x} is truncated"
                )));
            }
            let len = chunk1[0] as usize | ((next[0] as usize) << 8);
            chunk1 = chunk1.slice(1..);
            chunk2 = Some(next.slice(1..));
            len
        } else {
            let len = chunk1[0] as usize | ((chunk1[1] as usize) << 8);
            chunk1 = chunk1.slice(2..);
            len
        };

        if len > MAX_EXPECTED_OBJECT_SIZE {
            return Err(Error::Corrupt(format!(
                "blob at {address:#x} claims {len} bytes"
            )));
        }

        let mut out = BytesMut::with_capacity(len);
        let from_first = len.min(chunk1.len());
        out.put_slice(&chunk1[..from_first]);
        if from_first < len {
            let rest = match chunk2 {
                Some(c) => c,
                None => {
                    self.obtain_chunk(uuid, (address + CHUNK_SIZE) & CHUNK_ADDR_MASK)
                        .await?
                }
            };
            let needed = len - from_first;
            if rest.len() < needed {
                return Err(Error::Corrupt(format!(
                    "blob at {address:#x} is truncated: wanted {len} bytes"
                )));
            }
            out.put_slice(&rest[..needed]);
        }
        self.shared.rcache.note_read_used(len);
        Ok(out.freeze())
    }

    async fn read_superblock(&self, uuid: Uuid, version: u64) -> Result<Bytes> {
        let oid = oid::superblock(&uuid, version >> SUPERBLOCK_CHUNK_SHIFT);
        let offset = (version & SUPERBLOCK_CHUNK_MASK) * SUPERBLOCK_SIZE as u64;
        let guard = self.read_pool.acquire().await?;
        let data = guard
            .handle()
            .read(&oid, offset, SUPERBLOCK_SIZE)
            .await
            .map_err(|e| {
                error!(%uuid, version, error = %e, "superblock unreadable");
                Error::Unrecoverable(format!("superblock {version} of {uuid} unreadable: {e}"))
            })?;
        if data.len() != SUPERBLOCK_SIZE {
            error!(%uuid, version, got = data.len(), "short superblock read");
            return Err(Error::Unrecoverable(format!(
                "superblock {version} of {uuid}: short read of {} bytes",
                data.len()
            )));
        }
        Ok(data)
    }

    async fn write_superblock(&self, uuid: Uuid, version: u64, data: &[u8]) -> Result<()> {
        if data.len() != SUPERBLOCK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "superblock must be {SUPERBLOCK_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let oid = oid::superblock(&uuid, version >> SUPERBLOCK_CHUNK_SHIFT);
        let offset = (version & SUPERBLOCK_CHUNK_MASK) * SUPERBLOCK_SIZE as u64;
        let guard = self.write_pool.acquire().await?;
        guard
            .handle()
            .write(&oid, offset, Bytes::copy_from_slice(data))
            .await
            .map_err(|e| {
                error!(%uuid, version, error = %e, "superblock write failed");
                Error::Unrecoverable(format!("superblock {version} of {uuid} unwritable: {e}"))
            })
        // Superblocks live in their own oid namespace; no chunk cache
        // invalidation is needed.
    }

    async fn get_stream_version(&self, uuid: Uuid) -> Result<u64> {
        let oid = oid::metadata(&uuid);
        let guard = self.read_pool.acquire().await?;
        match guard.handle().get_xattr(&oid, "version").await {
            Ok(data) if data.len() == 8 => {
                Ok(u64::from_le_bytes(data[..8].try_into().expect("8 bytes")))
            }
            Ok(data) => Err(Error::Unrecoverable(format!(
                "version attribute of {uuid} is {} bytes, not 8",
                data.len()
            ))),
            Err(AdapterError::NotFound(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_stream_version(&self, uuid: Uuid, version: u64) -> Result<()> {
        let oid = oid::metadata(&uuid);
        let guard = self.read_pool.acquire().await?;
        guard
            .handle()
            .set_xattr(&oid, "version", Bytes::copy_from_slice(&version.to_le_bytes()))
            .await
            .map_err(|e| {
                error!(%uuid, version, error = %e, "stream version write failed");
                Error::Unrecoverable(format!("version of {uuid} unwritable: {e}"))
            })
    }

    async fn stream_exists(&self, uuid: Uuid) -> Result<bool> {
        Ok(self.get_stream_version(uuid).await? != 0)
    }
}
