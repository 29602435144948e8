//! Handle Pool
//!
//! Fixed-size pools of object-store connections. Opening a connection
//! is expensive, so the provider opens a small number at startup (16
//! for reads, 16 for writes) and recycles them: acquire hands out a
//! free handle or waits for one, release happens automatically when
//! the guard drops.
//!
//! ## Hand-off
//!
//! Free handle indices travel through a channel. Acquire receives from
//! it (waiting while every handle is out) and release sends the index
//! back, so every released handle becomes re-acquirable; strict FIFO
//! among waiters is not guaranteed and not needed.
//!
//! ## Stuck-pool Detection
//!
//! A wait longer than [`ACQUIRE_TIMEOUT`] means handles are leaking or
//! the store has wedged every connection. That surfaces as
//! [`Error::HandleTimeout`] carrying the number of handles provided so
//! far - a hard error for the request, not a process abort.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quasar_core::{Error, Result};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::adapter::{ObjectAdapter, ObjectHandle};

/// Longest an acquire will wait before declaring the pool stuck.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// A fixed-size pool of object handles.
pub struct HandlePool {
    name: &'static str,
    handles: Vec<Arc<dyn ObjectHandle>>,
    free_tx: mpsc::Sender<usize>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<usize>>,
    provided: AtomicI64,
}

impl HandlePool {
    /// Open `count` handles against `pool` and make them all available.
    pub async fn open(
        adapter: &dyn ObjectAdapter,
        pool: &str,
        count: usize,
        name: &'static str,
    ) -> Result<Arc<Self>> {
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            handles.push(adapter.open(pool).await?);
        }
        let (free_tx, free_rx) = mpsc::channel(count + 1);
        for idx in 0..count {
            free_tx.send(idx).await.expect("fresh channel has capacity");
        }
        Ok(Arc::new(Self {
            name,
            handles,
            free_tx,
            free_rx: tokio::sync::Mutex::new(free_rx),
            provided: AtomicI64::new(0),
        }))
    }

    /// Borrow a handle, waiting up to [`ACQUIRE_TIMEOUT`] for one to
    /// free up. The handle returns to the pool when the guard drops.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledHandle> {
        let idx = {
            let mut rx = self.free_rx.lock().await;
            match timeout(ACQUIRE_TIMEOUT, rx.recv()).await {
                Ok(Some(idx)) => idx,
                // The sender lives in self, so the channel never closes.
                Ok(None) => unreachable!("handle pool channel closed"),
                Err(_) => {
                    let provided = self.provided.load(Ordering::Relaxed);
                    tracing::error!(
                        pool = self.name,
                        provided,
                        "no free handle within acquire timeout"
                    );
                    return Err(Error::HandleTimeout {
                        waited: ACQUIRE_TIMEOUT,
                        provided,
                    });
                }
            }
        };
        self.provided.fetch_add(1, Ordering::Relaxed);
        Ok(PooledHandle {
            pool: Arc::clone(self),
            handle: Arc::clone(&self.handles[idx]),
            idx,
        })
    }

    /// Handles handed out over the pool's lifetime (diagnostics).
    pub fn provided(&self) -> i64 {
        self.provided.load(Ordering::Relaxed)
    }
}

/// RAII guard over one pooled handle.
pub struct PooledHandle {
    pool: Arc<HandlePool>,
    handle: Arc<dyn ObjectHandle>,
    idx: usize,
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle").field("idx", &self.idx).finish()
    }
}

impl PooledHandle {
    pub fn handle(&self) -> &dyn ObjectHandle {
        self.handle.as_ref()
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        // Capacity is count + 1, so returning an index cannot fail.
        let _ = self.pool.free_tx.try_send(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryObjectAdapter;

    async fn pool(count: usize) -> Arc<HandlePool> {
        let adapter = MemoryObjectAdapter::new();
        HandlePool::open(&adapter, "test", count, "read")
            .await
            .expect("open")
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let p = pool(2).await;
        let a = p.acquire().await.expect("a");
        let b = p.acquire().await.expect("b");
        drop(a);
        let c = p.acquire().await.expect("c");
        drop(b);
        drop(c);
        assert_eq!(p.provided(), 3);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let p = pool(1).await;
        let guard = p.acquire().await.expect("first");

        let p2 = Arc::clone(&p);
        let waiter = tokio::spawn(async move { p2.acquire().await.map(|g| g.idx) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let idx = waiter.await.expect("join").expect("second");
        assert_eq!(idx, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let p = pool(1).await;
        let _held = p.acquire().await.expect("first");

        match p.acquire().await {
            Err(Error::HandleTimeout { waited, provided }) => {
                assert_eq!(waited, ACQUIRE_TIMEOUT);
                assert_eq!(provided, 1);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_handles_usable() {
        let p = pool(4).await;
        let guards: Vec<_> = acquire_n(&p, 4).await;
        let mut idxs: Vec<_> = guards.iter().map(|g| g.idx).collect();
        idxs.sort_unstable();
        assert_eq!(idxs, vec![0, 1, 2, 3]);
    }

    async fn acquire_n(p: &Arc<HandlePool>, n: usize) -> Vec<PooledHandle> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(p.acquire().await.expect("acquire"));
        }
        out
    }
}
