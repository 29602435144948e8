//! Address Allocator
//!
//! Owns the globally monotonic 64-bit address space shared by every
//! node in the cluster.
//!
//! ## How Reservation Works
//!
//! The object store holds a single 8-byte little-endian counter in the
//! `allocator` object. To reserve, a node takes the advisory lock on
//! that object, reads the counter, writes back `counter + 2^36`, and
//! unlocks. The 2^36-byte lock-range it now owns covers 4096 objects
//! of 16 MiB; those are carved up locally with no further round trips.
//!
//! ## The Vendor Task
//!
//! A background task pre-computes 16 MiB allocations from the current
//! lock-range and buffers them on a bounded channel. Segment locking
//! pulls from that channel, so the reservation round trip is off the
//! write path except once per 64 GiB of data. When the task cannot
//! reserve a new lock-range it logs the fault and closes the channel;
//! callers then observe [`Error::NoSpace`].
//!
//! ## Invariants
//!
//! - No two nodes ever see the same allocated address: the counter
//!   read and write happen under one advisory lock hold.
//! - The persisted counter never decreases.

use std::sync::Arc;

use bytes::Bytes;
use quasar_core::{Error, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use crate::adapter::ObjectHandle;
use crate::oid;
use crate::pool::HandlePool;
use crate::{ADDR_LOCK_SIZE, ADDR_OBJ_SIZE, METADATA_BASE};

/// Advisory lock TTL on the allocator object.
const ALLOC_LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(5);

/// Allocations buffered ahead of demand.
const ALLOC_BUFFER: usize = 128;

/// Vends 16 MiB object allocations from cluster-reserved lock-ranges.
pub struct AddressAllocator {
    alloc_rx: Mutex<mpsc::Receiver<u64>>,
    vendor: tokio::task::JoinHandle<()>,
}

impl AddressAllocator {
    /// Reserve the first lock-range and start the vendor task.
    pub async fn start(pool: Arc<HandlePool>) -> Result<Self> {
        let base = obtain_base_address(&pool).await?;
        info!("base address obtained as {base:#018x}");

        let (tx, rx) = mpsc::channel(ALLOC_BUFFER);
        let vendor = tokio::spawn(vend_allocations(pool, tx, base));
        Ok(Self {
            alloc_rx: Mutex::new(rx),
            vendor,
        })
    }

    /// Next 16 MiB allocation. Fails with `NoSpace` once the vendor
    /// has stopped because the address space could not be extended.
    pub async fn next(&self) -> Result<u64> {
        self.alloc_rx.lock().await.recv().await.ok_or(Error::NoSpace)
    }
}

impl Drop for AddressAllocator {
    fn drop(&mut self) {
        self.vendor.abort();
    }
}

async fn vend_allocations(pool: Arc<HandlePool>, tx: mpsc::Sender<u64>, mut base: u64) {
    let mut ptr = base;
    loop {
        if tx.send(ptr).await.is_err() {
            // Allocator dropped; nothing left to vend.
            return;
        }
        ptr += ADDR_OBJ_SIZE;
        if ptr >= base + ADDR_LOCK_SIZE {
            match obtain_base_address(&pool).await {
                Ok(next_base) => {
                    base = next_base;
                    ptr = next_base;
                }
                Err(e) => {
                    error!(error = %e, "could not reserve a new lock-range; allocation stops");
                    return;
                }
            }
        }
    }
}

/// Reserve one lock-range from the shared persisted counter.
///
/// The advisory lock is held across the read and the write, so the
/// reservation is atomic cluster-wide. A failed counter write while
/// the lock is held is unrecoverable: another node may already have
/// observed the old value.
pub(crate) async fn obtain_base_address(pool: &Arc<HandlePool>) -> Result<u64> {
    let guard = pool.acquire().await?;
    let h = guard.handle();

    h.lock_exclusive(
        oid::ALLOCATOR,
        oid::ALLOC_LOCK_NAME,
        oid::ALLOC_LOCK_COOKIE,
        oid::ALLOC_LOCK_OWNER,
        ALLOC_LOCK_TTL,
    )
    .await?;

    let result = reserve_under_lock(h).await;

    if let Err(e) = h
        .unlock(oid::ALLOCATOR, oid::ALLOC_LOCK_NAME, oid::ALLOC_LOCK_COOKIE)
        .await
    {
        // The TTL will clear it; the reservation itself already happened.
        error!(error = %e, "failed to release allocator lock");
    }
    result
}

async fn reserve_under_lock(h: &dyn ObjectHandle) -> Result<u64> {
    let counter = h
        .read(oid::ALLOCATOR, 0, 8)
        .await
        .map_err(|e| Error::Unrecoverable(format!("allocator counter unreadable: {e}")))?;
    if counter.len() != 8 {
        return Err(Error::Unrecoverable(format!(
            "allocator counter is {} bytes, not 8; was the database created?",
            counter.len()
        )));
    }
    let current = u64::from_le_bytes(counter[..8].try_into().expect("length checked"));

    // The top byte of the address space belongs to metadata objects
    // and must never be handed to a segment.
    let next = current + ADDR_LOCK_SIZE;
    if next > METADATA_BASE {
        return Err(Error::NoSpace);
    }
    h.write_full(oid::ALLOCATOR, Bytes::copy_from_slice(&next.to_le_bytes()))
        .await
        .map_err(|e| Error::Unrecoverable(format!("allocator counter write failed: {e}")))?;

    Ok(current)
}
