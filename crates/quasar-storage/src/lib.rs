//! Quasar Block Storage Layer
//!
//! This crate implements the object-backed block storage for the quasar
//! tree engine: variable-length node blobs packed into fixed 16 MiB
//! objects in a remote object store, with a globally monotonic address
//! space, an amortising read cache, and the stream catalog layered on
//! the same store.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐          ┌──────────────┐
//! │ Tree engine  │          │  Query API   │
//! └──────┬───────┘          └──────┬───────┘
//!        │ BlockProvider           │ StreamCatalog
//!        ▼                        ▼
//! ┌─────────────────────────────────────────┐
//! │        ObjectStorageProvider            │
//! │  ┌──────────┐ ┌───────────┐ ┌────────┐  │
//! │  │ Segments │ │ ChunkCache│ │Catalog │  │
//! │  └────┬─────┘ └─────┬─────┘ └───┬────┘  │
//! │       │   ┌─────────┴───────┐   │       │
//! │       │   │ AddressAllocator│   │       │
//! │       │   └─────────┬───────┘   │       │
//! │  ┌────┴─────────────┴───────────┴────┐  │
//! │  │        Handle pools (16r/16w)     │  │
//! │  └────────────────┬──────────────────┘  │
//! └───────────────────┼─────────────────────┘
//!                     ▼
//!            ┌─────────────────┐
//!            │  ObjectAdapter  │  (remote object store)
//!            └─────────────────┘
//! ```
//!
//! ## The Address Space
//!
//! Every stored blob is addressed by a 64-bit handle:
//!
//! - bits 63..24: object id (the 16 MiB object holding the blob)
//! - bits 23..0: byte offset within that object
//!
//! Addresses are vended by [`allocator::AddressAllocator`] from a
//! cluster-shared persisted counter, so no two nodes ever write to the
//! same address. The top byte `0xFF` is reserved for metadata objects
//! and never produced by the allocator.
//!
//! ## Main Components
//!
//! - [`adapter`]: the [`adapter::ObjectAdapter`] seam over the remote
//!   store (byte-range I/O, xattrs, ordered maps, advisory locks), plus
//!   the in-memory backend used by tests
//! - [`pool::HandlePool`]: fixed pools of read and write connections
//! - [`allocator::AddressAllocator`]: lock-range reservation and 16 MiB
//!   allocation vending
//! - [`segment::ObjectSegment`]: the per-stream append-only write path
//! - [`chunk_cache::ChunkCache`]: sharded LRU over 1 MiB read chunks
//!   with single-flight fetch coalescing
//! - [`provider::ObjectStorageProvider`]: ties it together and
//!   implements the [`api::BlockProvider`] and [`api::StreamCatalog`]
//!   contracts

pub mod adapter;
pub mod allocator;
pub mod api;
pub mod catalog;
pub mod chunk_cache;
pub mod oid;
pub mod pool;
pub mod provider;
pub mod segment;

pub use api::{BlockProvider, Segment, StreamCatalog};
pub use provider::ObjectStorageProvider;

/// Read handles in the pool.
pub const NUM_RHANDLES: usize = 16;

/// Write handles in the pool.
pub const NUM_WHANDLES: usize = 16;

/// Addresses at or above this base are reserved for metadata and never
/// produced by the allocator.
pub const METADATA_BASE: u64 = 0xFF00_0000_0000_0000;

/// Bytes reserved per lock-range: 4096 objects of 16 MiB each.
pub const ADDR_LOCK_SIZE: u64 = 0x10_0000_0000;

/// Bytes per object: one 16 MiB object per object id.
pub const ADDR_OBJ_SIZE: u64 = 0x0100_0000;

/// Largest blob the tree engine ever writes (just over its node size).
pub const MAX_EXPECTED_OBJECT_SIZE: usize = 20485;

/// Mask extracting the intra-object byte offset from an address.
pub const OFFSET_MASK: u64 = 0xFF_FFFF;

/// Read-cache chunk size.
pub const CHUNK_SIZE: u64 = 1 << 20;

/// Mask aligning an address down to its containing chunk.
pub const CHUNK_ADDR_MASK: u64 = !(CHUNK_SIZE - 1);

/// Mask extracting the intra-chunk offset from an address.
pub const CHUNK_OFFSET_MASK: u64 = CHUNK_SIZE - 1;

/// A segment's final address is only worth remembering if the next
/// blob could still fit in the same object.
pub const WORTH_CACHING: u64 = OFFSET_MASK - MAX_EXPECTED_OBJECT_SIZE as u64;

/// Capacity of the per-stream segment-address cache.
pub const SEGCACHE_SIZE: usize = 1024;

/// Write cache buffer size per segment.
pub const WRITE_CACHE_SIZE: usize = 1 << 20;

/// Superblocks per superblock object: 16 MiB of 16-byte records.
pub const SUPERBLOCK_CHUNK_SHIFT: u64 = 20;
pub const SUPERBLOCK_CHUNK_MASK: u64 = 0xF_FFFF;
pub const SUPERBLOCK_SIZE: usize = 16;

/// Largest accepted stream annotation.
pub const MAX_ANNOTATION_SIZE: usize = 256 * 1024;

/// Stream version meaning "created, nothing committed yet".
pub const SPECIAL_VERSION_CREATED: u64 = 1;

/// Passed by readers that want the newest superblock.
pub const LATEST_GENERATION: u64 = u64::MAX;

/// First address handed out by a freshly created database (object id 1;
/// object id 0 is never used so a zero address can mean "none").
pub const INITIAL_BASE_ADDRESS: u64 = 0x100_0000;
