//! Fixed-size block allocator
//!
//! Hands out slots of a single type from a pool that grows in fixed-size
//! chunks and never shrinks. Freed slots are recycled first, so the hot
//! submission path only touches the general-purpose heap when the pool is
//! exhausted.

use alloc::vec::Vec;
use core::fmt;

/// Errors from the block allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAllocatorError {
    /// The pool reached its block limit
    OutOfBlocks,
    /// The index does not name an allocated block
    InvalidBlock,
}

impl fmt::Display for BlockAllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockAllocatorError::OutOfBlocks => f.write_str("block allocator: out of blocks"),
            BlockAllocatorError::InvalidBlock => f.write_str("block allocator: invalid block"),
        }
    }
}

/// A growable pool of `T` slots addressed by index.
pub struct BlockAllocator<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    expansion_count: usize,
    limit: usize,
}

impl<T> BlockAllocator<T> {
    /// Create an empty pool that grows by `expansion_count` blocks at a time.
    pub const fn new(expansion_count: usize) -> Self {
        Self::with_limit(expansion_count, usize::MAX)
    }

    /// Create an empty pool that never holds more than `limit` blocks.
    pub const fn with_limit(expansion_count: usize, limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            expansion_count: if expansion_count == 0 { 1 } else { expansion_count },
            limit,
        }
    }

    /// Store `value` in a free block and return its index.
    pub fn allocate(&mut self, value: T) -> Result<usize, BlockAllocatorError> {
        if self.free.is_empty() {
            self.expand()?;
        }

        let index = self.free.pop().ok_or(BlockAllocatorError::OutOfBlocks)?;
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(value);
        Ok(index)
    }

    /// Release a block, returning its contents.
    pub fn free(&mut self, index: usize) -> Result<T, BlockAllocatorError> {
        let value = self
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(BlockAllocatorError::InvalidBlock)?;
        self.free.push(index);
        Ok(value)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Number of allocated blocks
    pub fn allocated(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Number of blocks the pool currently owns
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn expand(&mut self) -> Result<(), BlockAllocatorError> {
        let start = self.slots.len();
        let end = start.saturating_add(self.expansion_count).min(self.limit);
        if end <= start {
            return Err(BlockAllocatorError::OutOfBlocks);
        }

        self.slots.resize_with(end, || None);
        // Hand out low indices first.
        self.free.extend((start..end).rev());
        Ok(())
    }
}
