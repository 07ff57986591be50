//! Recycling pool of aligned I/O blocks
//!
//! Blocks are allocated one at a time with anonymous `mmap`, which gives page
//! alignment and satisfies `O_DIRECT`. A block is handed out as a move-only
//! [`Buffer`] token, loaned to the kernel by id while a read is in flight, and
//! pushed back on the free stack when released. The pool grows on demand and
//! never shrinks.
//!
//! While a block sits on the free stack its first eight bytes hold [`CANARY`].
//! Anything that writes into a free block (a stale kernel read, a second
//! release racing a reuse) is caught at the next allocation.

use crate::error::{Error, Result};
use nix::libc;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

/// Page size constant
pub const PAGE_SIZE: usize = 4096;

/// Default block size: one page
pub const DEFAULT_BLOCK_SIZE: usize = PAGE_SIZE;

/// Default alignment: one 512-byte sector
pub const DEFAULT_ALIGNMENT: usize = 512;

/// Marker stored in a free block
pub const CANARY: u64 = 0xdead_beef;

/// Serial handed to the next pool, so a buffer can name the pool that issued it
static NEXT_POOL_SERIAL: AtomicU32 = AtomicU32::new(0);

/// Configuration for the buffer pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Bytes per block; every read transfers exactly one block
    pub block_size: usize,
    /// Required buffer alignment (power of two, at most one page)
    pub alignment: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl PoolConfig {
    /// Pool of `block_size`-byte blocks with default alignment
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }

    /// Bytes mapped per block
    pub fn mapped_size(&self) -> usize {
        self.block_size.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidConfig("alignment must be power of 2".into()));
        }
        if self.alignment > PAGE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "alignment {} exceeds page size {}",
                self.alignment, PAGE_SIZE
            )));
        }
        if self.block_size < std::mem::size_of::<u64>() {
            return Err(Error::InvalidConfig(format!(
                "block_size {} cannot hold the free-block canary",
                self.block_size
            )));
        }
        if self.block_size % self.alignment != 0 {
            return Err(Error::InvalidConfig(format!(
                "block_size {} is not a multiple of alignment {}",
                self.block_size, self.alignment
            )));
        }
        if self.block_size > u32::MAX as usize {
            return Err(Error::InvalidConfig("block_size must fit in 32 bits".into()));
        }
        Ok(())
    }
}

/// Opaque handle naming one block; doubles as the SQE tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

impl BufferId {
    /// Index into the pool's block table
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Value placed in `user_data`
    #[inline]
    pub fn tag(self) -> u64 {
        self.0 as u64
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ownership token for one allocated block.
///
/// Not `Clone`: the only way to give a block back is to move the token into
/// [`BufferPool::release`]. The token remembers which pool issued it; any
/// other pool rejects it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a Buffer must be released back to its pool"]
pub struct Buffer {
    id: BufferId,
    pool: u32,
}

impl Buffer {
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }
}

/// Where a block currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// On the free stack, canary set
    Free,
    /// Owned by the caller through a `Buffer`
    Held,
    /// Address handed to the kernel, awaiting completion
    Loaned,
}

#[derive(Debug)]
struct Block {
    ptr: NonNull<u8>,
    state: BlockState,
}

/// Allocation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks created with a fresh mapping
    pub fresh: u64,
    /// Allocations served from the free stack
    pub recycled: u64,
    /// Releases back onto the free stack
    pub releases: u64,
    /// Blocks currently held or loaned
    pub in_use: u64,
    /// Highest `in_use` ever observed
    pub peak_in_use: u64,
}

impl PoolStats {
    fn record_alloc(&mut self, fresh: bool) {
        if fresh {
            self.fresh += 1;
        } else {
            self.recycled += 1;
        }
        self.in_use += 1;
        self.peak_in_use = self.peak_in_use.max(self.in_use);
    }

    fn record_release(&mut self) {
        self.releases += 1;
        self.in_use -= 1;
    }

    /// Share of allocations served without a new mapping
    pub fn reuse_percentage(&self) -> f64 {
        let allocs = self.fresh + self.recycled;
        if allocs == 0 {
            return 100.0;
        }
        (self.recycled as f64 / allocs as f64) * 100.0
    }
}

/// Single-owner pool of aligned blocks.
pub struct BufferPool {
    serial: u32,
    config: PoolConfig,
    blocks: Vec<Block>,
    free: Vec<BufferId>,
    stats: PoolStats,
}

// SAFETY: block memory is owned by the pool and only reachable through it
unsafe impl Send for BufferPool {}

impl BufferPool {
    /// Create an empty pool
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let serial = NEXT_POOL_SERIAL.fetch_add(1, Ordering::Relaxed);
        debug!(
            serial,
            block_size = config.block_size,
            alignment = config.alignment,
            "buffer pool created"
        );
        Ok(Self {
            serial,
            config,
            blocks: Vec::new(),
            free: Vec::new(),
            stats: PoolStats::default(),
        })
    }

    /// Empty pool of one-page blocks
    pub fn with_defaults() -> Self {
        Self {
            serial: NEXT_POOL_SERIAL.fetch_add(1, Ordering::Relaxed),
            config: PoolConfig::default(),
            blocks: Vec::new(),
            free: Vec::new(),
            stats: PoolStats::default(),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Blocks ever allocated
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks on the free stack
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Blocks held by callers or loaned to the kernel
    pub fn in_use(&self) -> usize {
        self.blocks.len() - self.free.len()
    }

    /// Get statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// State of block `id`, if it exists
    pub fn state(&self, id: BufferId) -> Option<BlockState> {
        self.blocks.get(id.index()).map(|b| b.state)
    }

    /// Take a block: pop the free stack, or map a new one if it is empty.
    pub fn allocate(&mut self) -> Result<Buffer> {
        let Some(id) = self.free.pop() else {
            return self.allocate_fresh();
        };

        let block = &mut self.blocks[id.index()];
        debug_assert_eq!(block.state, BlockState::Free);
        let canary_ptr = block.ptr.as_ptr().cast::<u64>();
        // SAFETY: block memory is mapped, page aligned, at least 8 bytes, and
        // not loaned to the kernel while Free
        let found = unsafe { canary_ptr.read() };
        if found != CANARY {
            return Err(Error::CanaryMismatch {
                id: id.0,
                found,
                expected: CANARY,
            });
        }
        unsafe { canary_ptr.write(0) };
        block.state = BlockState::Held;

        self.stats.record_alloc(false);
        trace!(%id, "buffer recycled");
        Ok(self.issue(id))
    }

    fn allocate_fresh(&mut self) -> Result<Buffer> {
        let index = self.blocks.len();
        let raw = u32::try_from(index).map_err(|_| Error::PoolExhausted(index))?;
        let ptr = Self::allocate_aligned(self.config.mapped_size())?;
        self.blocks.push(Block {
            ptr,
            state: BlockState::Held,
        });

        let id = BufferId(raw);
        self.stats.record_alloc(true);
        debug!(%id, blocks = self.blocks.len(), "buffer pool grew");
        Ok(self.issue(id))
    }

    fn issue(&self, id: BufferId) -> Buffer {
        Buffer {
            id,
            pool: self.serial,
        }
    }

    /// Index of the block behind `buffer`, checked to be this pool's and held.
    fn held_index(&self, buffer: &Buffer) -> Result<usize> {
        let id = buffer.id;
        let block = match self.blocks.get(id.index()) {
            Some(block) if buffer.pool == self.serial => block,
            _ => return Err(Error::ForeignBuffer(id.0)),
        };
        if block.state != BlockState::Held {
            return Err(Error::DoubleRelease(id.0));
        }
        Ok(id.index())
    }

    /// Allocate aligned memory
    fn allocate_aligned(size: usize) -> Result<NonNull<u8>> {
        // SAFETY: anonymous private mapping, no file involved
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Alloc(io::Error::last_os_error()));
        }
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Alloc(io::Error::other("mmap returned null")))
    }

    /// Return a block to the free stack and set its canary.
    ///
    /// A buffer issued by another pool is rejected and leaves this pool untouched.
    pub fn release(&mut self, buffer: Buffer) -> Result<()> {
        let index = self.held_index(&buffer)?;
        let id = buffer.id;
        let block = &mut self.blocks[index];
        // SAFETY: held blocks are not in use by the kernel
        unsafe { block.ptr.as_ptr().cast::<u64>().write(CANARY) };
        block.state = BlockState::Free;
        self.free.push(id);

        self.stats.record_release();
        trace!(%id, "buffer released");
        Ok(())
    }

    /// Contents of a held block
    pub fn data(&self, buffer: &Buffer) -> Result<&[u8]> {
        let block = &self.blocks[self.held_index(buffer)?];
        // SAFETY: a Held block is owned by the caller; the kernel is done with it
        Ok(unsafe { std::slice::from_raw_parts(block.ptr.as_ptr(), self.config.block_size) })
    }

    /// Mutable contents of a held block
    pub fn data_mut(&mut self, buffer: &mut Buffer) -> Result<&mut [u8]> {
        let block = &self.blocks[self.held_index(buffer)?];
        let len = self.config.block_size;
        // SAFETY: as in `data`, plus `&mut Buffer` proves exclusive access
        Ok(unsafe { std::slice::from_raw_parts_mut(block.ptr.as_ptr(), len) })
    }

    /// Hand a block's address to the kernel. Returns the tag and destination address.
    pub(crate) fn loan(&mut self, buffer: Buffer) -> (u64, *mut u8) {
        debug_assert_eq!(buffer.pool, self.serial);
        let block = &mut self.blocks[buffer.id.index()];
        debug_assert_eq!(block.state, BlockState::Held);
        block.state = BlockState::Loaned;
        (buffer.id.tag(), block.ptr.as_ptr())
    }

    /// Recover the block named by a completion tag.
    pub(crate) fn reclaim(&mut self, tag: u64) -> Result<Buffer> {
        let raw = u32::try_from(tag).map_err(|_| Error::UnknownTag(tag))?;
        let block = self
            .blocks
            .get_mut(raw as usize)
            .ok_or(Error::UnknownTag(tag))?;
        if block.state != BlockState::Loaned {
            return Err(Error::UnknownTag(tag));
        }
        block.state = BlockState::Held;
        Ok(self.issue(BufferId(raw)))
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let size = self.config.mapped_size();
        for block in &self.blocks {
            if block.state == BlockState::Loaned {
                // The kernel may still write here; leak instead of unmapping under it
                continue;
            }
            // SAFETY: mapped in allocate_aligned with this size
            unsafe { libc::munmap(block.ptr.as_ptr().cast(), size) };
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("serial", &self.serial)
            .field("config", &self.config)
            .field("blocks", &self.blocks.len())
            .field("free", &self.free.len())
            .field("stats", &self.stats)
            .finish()
    }
}
