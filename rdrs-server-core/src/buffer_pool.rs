//! Pool of fixed size buffers lent to the native layer for request and
//! response marshalling.

use crate::native::ADDRESS_SIZE;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

/// Fixed size memory region handed to the native layer. Its length is a
/// whole number of address words.
pub struct NativeBuffer {
    bytes: Box<[u8]>,
}

impl NativeBuffer {
    pub fn new(size: u32) -> Self {
        let len = (size - size % ADDRESS_SIZE) as usize;
        Self {
            bytes: vec![0u8; len].into_boxed_slice(),
        }
    }

    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub allocations_count: u64,
    pub deallocations_count: u64,
    pub buffers_count: u64,
    pub free_buffers: u64,
}

struct PoolState {
    free: Vec<NativeBuffer>,
    stats: MemoryStats,
    shut_down: bool,
}

pub struct BufferPool {
    buffer_size: u32,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(buffer_size: u32, pre_allocated: u32) -> Result<Arc<Self>> {
        if buffer_size == 0 || buffer_size % ADDRESS_SIZE != 0 {
            return Err(anyhow!(
                "buffer size must be a positive multiple of {}, got {}",
                ADDRESS_SIZE,
                buffer_size
            ));
        }
        let free: Vec<NativeBuffer> = (0..pre_allocated)
            .map(|_| NativeBuffer::new(buffer_size))
            .collect();
        let count = free.len() as u64;
        tracing::debug!(
            "Allocated {} native buffers of {} bytes",
            count,
            buffer_size
        );
        Ok(Arc::new(Self {
            buffer_size,
            state: Mutex::new(PoolState {
                free,
                stats: MemoryStats {
                    allocations_count: count,
                    deallocations_count: 0,
                    buffers_count: count,
                    free_buffers: count,
                },
                shut_down: false,
            }),
        }))
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pops the most recently returned buffer, growing the pool when empty.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledBuffer> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(anyhow!("buffer pool has been shut down"));
        }
        let buffer = match state.free.pop() {
            Some(buffer) => {
                state.stats.free_buffers -= 1;
                buffer
            }
            None => {
                state.stats.allocations_count += 1;
                state.stats.buffers_count += 1;
                NativeBuffer::new(self.buffer_size)
            }
        };
        Ok(PooledBuffer {
            buffer: Some(buffer),
            pool: self.clone(),
        })
    }

    // TODO: free buffers above the pre-allocated count once load settles.
    fn release(&self, mut buffer: NativeBuffer) {
        let mut state = self.lock();
        if state.shut_down {
            state.stats.deallocations_count += 1;
            state.stats.buffers_count = state.stats.buffers_count.saturating_sub(1);
            return;
        }
        if let Some(first) = buffer.as_bytes_mut().first_mut() {
            *first = 0;
        }
        state.free.push(buffer);
        state.stats.free_buffers += 1;
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Frees every pooled buffer. Buffers still on loan are freed when their
    /// guard drops.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.lock();
        if state.shut_down {
            return Ok(());
        }
        state.shut_down = true;
        let freed = state.free.len() as u64;
        state.free.clear();
        state.stats.deallocations_count += freed;
        state.stats.buffers_count -= freed;
        state.stats.free_buffers = 0;
        if state.stats.buffers_count != 0 {
            return Err(anyhow!(
                "buffer pool shut down with {} buffers still in use",
                state.stats.buffers_count
            ));
        }
        Ok(())
    }
}

/// A buffer on loan from the pool. Returned to the pool on drop.
pub struct PooledBuffer {
    buffer: Option<NativeBuffer>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = NativeBuffer;

    fn deref(&self) -> &Self::Target {
        self.buffer
            .as_ref()
            .unwrap_or_else(|| unreachable!("buffer is only taken on drop"))
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer
            .as_mut()
            .unwrap_or_else(|| unreachable!("buffer is only taken on drop"))
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_accounting(stats: MemoryStats, in_flight: u64) {
        assert_eq!(stats.free_buffers + in_flight, stats.buffers_count);
        assert_eq!(
            stats.allocations_count - stats.deallocations_count,
            stats.buffers_count
        );
    }

    #[test]
    fn buffer_bytes_cover_the_configured_size() -> Result<()> {
        let pool = BufferPool::new(64, 1)?;
        let mut buffer = pool.acquire()?;
        assert_eq!(buffer.size(), 64);
        assert_eq!(buffer.as_bytes().len(), 64);
        buffer.as_bytes_mut()[63] = 7;
        assert_eq!(buffer.as_bytes()[63], 7);
        drop(buffer);

        // returned buffers are marked so stale responses do not decode
        let buffer = pool.acquire()?;
        assert_eq!(buffer.as_bytes()[0], 0);
        Ok(())
    }

    #[test]
    fn rejects_unaligned_buffer_size() {
        assert!(BufferPool::new(1023, 1).is_err());
        assert!(BufferPool::new(0, 1).is_err());
    }

    #[test]
    fn preallocated_buffers_count_as_allocations() -> Result<()> {
        let pool = BufferPool::new(1024, 8)?;
        assert_eq!(
            pool.stats(),
            MemoryStats {
                allocations_count: 8,
                deallocations_count: 0,
                buffers_count: 8,
                free_buffers: 8,
            }
        );
        Ok(())
    }

    #[test]
    fn acquire_release_keeps_accounting() -> Result<()> {
        let pool = BufferPool::new(64, 2)?;
        let a = pool.acquire()?;
        let b = pool.acquire()?;
        let c = pool.acquire()?;
        assert_eq!(a.size(), 64);
        assert_accounting(pool.stats(), 3);
        assert_eq!(pool.stats().allocations_count, 3);
        drop(b);
        assert_accounting(pool.stats(), 2);
        drop(a);
        drop(c);
        let stats = pool.stats();
        assert_accounting(stats, 0);
        assert_eq!(stats.free_buffers, 3);
        Ok(())
    }

    #[test]
    fn pool_is_lifo() -> Result<()> {
        let pool = BufferPool::new(16, 0)?;
        let mut first = pool.acquire()?;
        first.as_bytes_mut()[4] = 42;
        let second = pool.acquire()?;
        drop(second);
        drop(first);
        let again = pool.acquire()?;
        assert_eq!(again.as_bytes()[4], 42);
        Ok(())
    }

    #[test]
    fn concurrent_loans_never_share_a_buffer() -> Result<()> {
        let pool = BufferPool::new(64, 4)?;
        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(pool.acquire()?);
        }
        let addresses: HashSet<usize> = held
            .iter_mut()
            .map(|buffer| buffer.as_mut_ptr() as usize)
            .collect();
        assert_eq!(addresses.len(), 16);
        assert_accounting(pool.stats(), 16);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn grows_under_burst_and_returns_everything() -> Result<()> {
        let pool = BufferPool::new(256, 4)?;
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let barrier = barrier.clone();
            tasks.spawn(async move {
                let buffer = pool.acquire()?;
                barrier.wait().await;
                drop(buffer);
                Ok::<_, anyhow::Error>(())
            });
        }
        while let Some(res) = tasks.join_next().await {
            res??;
        }
        let stats = pool.stats();
        assert_eq!(stats.buffers_count, 16);
        assert_eq!(stats.free_buffers, 16);
        assert_eq!(stats.allocations_count, 16);
        Ok(())
    }

    #[test]
    fn shutdown_frees_everything() -> Result<()> {
        let pool = BufferPool::new(64, 3)?;
        let loaned = pool.acquire()?;
        drop(loaned);
        pool.shutdown()?;
        let stats = pool.stats();
        assert_eq!(stats.buffers_count, 0);
        assert_eq!(stats.deallocations_count, 3);
        assert!(pool.acquire().is_err());
        Ok(())
    }

    #[test]
    fn shutdown_reports_outstanding_loans() -> Result<()> {
        let pool = BufferPool::new(64, 1)?;
        let loaned = pool.acquire()?;
        assert!(pool.shutdown().is_err());
        drop(loaned);
        let stats = pool.stats();
        assert_eq!(stats.buffers_count, 0);
        assert_eq!(stats.allocations_count, stats.deallocations_count);
        Ok(())
    }
}
