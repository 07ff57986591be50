//! The read engine: one ring plus the pool that feeds it.
//!
//! Submission lives in [`submit`](crate::submit) and completion handling in
//! [`reap`](crate::reap); both are `impl Engine` blocks so the ring and pool
//! are always borrowed together.

use crate::error::Result;
use crate::kernel::{Kernel, SysKernel};
use crate::pool::{Buffer, BufferPool, PoolConfig};
use crate::ring::Ring;

/// Single-threaded io_uring read engine.
#[derive(Debug)]
pub struct Engine<K: Kernel = SysKernel> {
    pub(crate) ring: Ring<K>,
    pub(crate) pool: BufferPool,
}

impl Engine<SysKernel> {
    /// Ring of `capacity` entries on the real kernel with a default pool.
    pub fn new(capacity: u32) -> Result<Self> {
        Self::with_kernel(SysKernel, capacity, PoolConfig::default())
    }
}

impl<K: Kernel> Engine<K> {
    pub fn with_kernel(kernel: K, capacity: u32, pool: PoolConfig) -> Result<Self> {
        let pool = BufferPool::new(pool)?;
        let ring = Ring::create(kernel, capacity)?;
        Ok(Self { ring, pool })
    }

    pub fn ring(&self) -> &Ring<K> {
        &self.ring
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Negotiated queue depth
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }

    /// Reads submitted and not yet reaped
    #[inline]
    pub fn in_flight(&self) -> u32 {
        self.ring.in_flight()
    }

    /// Bytes per read
    #[inline]
    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Contents of a completed read
    pub fn data(&self, buffer: &Buffer) -> Result<&[u8]> {
        self.pool.data(buffer)
    }

    /// Give a completed read's buffer back to the pool.
    pub fn release(&mut self, buffer: Buffer) -> Result<()> {
        self.pool.release(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    #[test]
    fn test_engine_starts_idle() {
        let kernel = SimKernel::new(vec![0; 4096]);
        let engine = Engine::with_kernel(kernel, 4, PoolConfig::default()).unwrap();
        assert_eq!(engine.capacity(), 4);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.block_size(), 4096);
        assert!(engine.pool().is_empty());
    }

    #[test]
    fn test_engine_rejects_bad_pool_config() {
        let config = PoolConfig {
            block_size: 4096,
            alignment: 3,
        };
        let kernel = SimKernel::new(Vec::new());
        assert!(Engine::with_kernel(kernel, 4, config).is_err());
    }
}
