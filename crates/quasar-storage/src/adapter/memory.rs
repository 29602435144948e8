//! In-Memory Object Adapter
//!
//! A complete implementation of [`ObjectAdapter`] backed by process
//! memory. It plays the role an in-memory database plays for a SQL
//! layer: hermetic tests with zero external services, exercising the
//! exact code paths production uses.
//!
//! Objects live in per-pool maps; each object carries its byte
//! contents, extended attributes and ordered key/value map. Advisory
//! locks are modelled with cookies and TTL expiry, and a contended
//! `lock_exclusive` waits just as the real store's client would.
//!
//! ## Usage
//!
//! ```ignore
//! let adapter = Arc::new(MemoryObjectAdapter::new());
//! let handle = adapter.open("quasar").await?;
//! handle.write_full("allocator", Bytes::from(vec![0u8; 8])).await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quasar_core::{AdapterError, AdapterResult};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ObjectAdapter, ObjectHandle};

/// How often a blocked lock acquisition re-checks the holder.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct ObjectState {
    data: Vec<u8>,
    xattrs: HashMap<String, Bytes>,
    omap: BTreeMap<String, Bytes>,
}

struct LockState {
    // Locks are owned per connection, as on the real store: the same
    // cookie from a different handle is a different locker.
    handle_id: u64,
    cookie: String,
    expires: Instant,
}

#[derive(Default)]
struct PoolState {
    objects: HashMap<String, ObjectState>,
    // (oid, lock name) -> holder
    locks: HashMap<(String, String), LockState>,
}

/// In-memory object store; all pools share one adapter instance.
#[derive(Default)]
pub struct MemoryObjectAdapter {
    pools: Mutex<HashMap<String, Arc<Mutex<PoolState>>>>,
    next_handle_id: AtomicU64,
}

impl MemoryObjectAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectAdapter for MemoryObjectAdapter {
    async fn open(&self, pool: &str) -> AdapterResult<Arc<dyn ObjectHandle>> {
        let mut pools = self.pools.lock().await;
        let state = pools.entry(pool.to_string()).or_default().clone();
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryObjectHandle { state, id }))
    }
}

/// Handle into one in-memory pool.
pub struct MemoryObjectHandle {
    state: Arc<Mutex<PoolState>>,
    id: u64,
}

impl MemoryObjectHandle {
    fn not_found(oid: &str) -> AdapterError {
        AdapterError::NotFound(oid.to_string())
    }
}

#[async_trait]
impl ObjectHandle for MemoryObjectHandle {
    async fn read(&self, oid: &str, offset: u64, len: usize) -> AdapterResult<Bytes> {
        let state = self.state.lock().await;
        let obj = state.objects.get(oid).ok_or_else(|| Self::not_found(oid))?;
        let start = (offset as usize).min(obj.data.len());
        let end = (start + len).min(obj.data.len());
        Ok(Bytes::copy_from_slice(&obj.data[start..end]))
    }

    async fn write(&self, oid: &str, offset: u64, data: Bytes) -> AdapterResult<()> {
        let mut state = self.state.lock().await;
        let obj = state.objects.entry(oid.to_string()).or_default();
        let end = offset as usize + data.len();
        if obj.data.len() < end {
            obj.data.resize(end, 0);
        }
        obj.data[offset as usize..end].copy_from_slice(&data);
        Ok(())
    }

    async fn write_full(&self, oid: &str, data: Bytes) -> AdapterResult<()> {
        let mut state = self.state.lock().await;
        let obj = state.objects.entry(oid.to_string()).or_default();
        obj.data = data.to_vec();
        Ok(())
    }

    async fn get_xattr(&self, oid: &str, name: &str) -> AdapterResult<Bytes> {
        let state = self.state.lock().await;
        let obj = state.objects.get(oid).ok_or_else(|| Self::not_found(oid))?;
        obj.xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("{oid}:{name}")))
    }

    async fn set_xattr(&self, oid: &str, name: &str, value: Bytes) -> AdapterResult<()> {
        let mut state = self.state.lock().await;
        let obj = state.objects.entry(oid.to_string()).or_default();
        obj.xattrs.insert(name.to_string(), value);
        Ok(())
    }

    async fn list_xattrs(&self, oid: &str) -> AdapterResult<HashMap<String, Bytes>> {
        let state = self.state.lock().await;
        let obj = state.objects.get(oid).ok_or_else(|| Self::not_found(oid))?;
        Ok(obj.xattrs.clone())
    }

    async fn set_omap(&self, oid: &str, entries: Vec<(String, Bytes)>) -> AdapterResult<()> {
        let mut state = self.state.lock().await;
        let obj = state.objects.entry(oid.to_string()).or_default();
        for (k, v) in entries {
            obj.omap.insert(k, v);
        }
        Ok(())
    }

    async fn get_omap_range(
        &self,
        oid: &str,
        start_after: &str,
        prefix: &str,
        limit: u64,
    ) -> AdapterResult<Vec<(String, Bytes)>> {
        let state = self.state.lock().await;
        let obj = state.objects.get(oid).ok_or_else(|| Self::not_found(oid))?;
        let range = obj.omap.range::<str, _>((
            Bound::Excluded(start_after),
            Bound::Unbounded,
        ));
        Ok(range
            .filter(|(k, _)| k.starts_with(prefix))
            .take(limit as usize)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn lock_exclusive(
        &self,
        oid: &str,
        lock_name: &str,
        cookie: &str,
        _owner: &str,
        ttl: Duration,
    ) -> AdapterResult<()> {
        let key = (oid.to_string(), lock_name.to_string());
        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let free = match state.locks.get(&key) {
                    None => true,
                    Some(holder) => {
                        (holder.handle_id == self.id && holder.cookie == cookie)
                            || holder.expires <= now
                    }
                };
                if free {
                    state.locks.insert(
                        key,
                        LockState {
                            handle_id: self.id,
                            cookie: cookie.to_string(),
                            expires: now + ttl,
                        },
                    );
                    return Ok(());
                }
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self, oid: &str, lock_name: &str, cookie: &str) -> AdapterResult<()> {
        let key = (oid.to_string(), lock_name.to_string());
        let mut state = self.state.lock().await;
        match state.locks.get(&key) {
            Some(holder) if holder.handle_id == self.id && holder.cookie == cookie => {
                state.locks.remove(&key);
                Ok(())
            }
            _ => Err(AdapterError::NotFound(format!("{oid}:{lock_name}"))),
        }
    }
}
