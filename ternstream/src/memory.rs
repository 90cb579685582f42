//! Recyclable, versioned byte blocks.
//!
//! The pool owns every block. Callers hold a [`BlockHandle`], which pairs a
//! slot index with the version observed when the block was handed out.
//! Returning a block bumps its version, so any handle still pointing at the
//! slot is rejected with [`TernStreamError::StaleBlock`] instead of reading
//! someone else's data.
//!
//! Capacity grows in steps picked from the requested length:
//!
//! ```text
//! length < 256    -> 64 byte steps
//! length < 1024   -> 256 byte steps
//! length < 4096   -> 1024 byte steps
//! length < 16384  -> 4096 byte steps
//! otherwise       -> 16384 byte steps
//! ```
//!
//! A block keeps growing in its current step unless the new length is more
//! than four steps out, in which case it moves to the step for that length.
//! Storage is never released on return, only the bookkeeping is reset.
//!
//! The pool is not synchronized; it belongs to the I/O worker.

use bytes::Bytes;

use crate::error::{Result, TernStreamError};

/// Largest length a block can take.
pub const MAX_BLOCK_LEN: usize = 65536;

/// A versioned reference to a pooled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    slot: u32,
    version: u32,
}

impl BlockHandle {
    /// Version of the block when this handle was issued.
    pub fn version(&self) -> u32 {
        self.version
    }
}

#[derive(Debug, Default)]
struct Block {
    data: Vec<u8>,
    len: usize,
    capacity: usize,
    step: usize,
    version: u32,
}

impl Block {
    fn grow(&mut self, len: usize) {
        if len <= self.capacity {
            return;
        }
        if self.step == 0 || (self.step << 2) < len {
            self.step = step_for(len);
        }
        self.capacity = len.div_ceil(self.step) * self.step;
        self.data.resize(self.capacity, 0);
    }

    fn set_len(&mut self, len: usize) -> Result<()> {
        if len > MAX_BLOCK_LEN {
            return Err(TernStreamError::CapacityExceeded {
                requested: len,
                max: MAX_BLOCK_LEN,
            });
        }
        self.grow(len);
        if len > self.len {
            self.data[self.len..len].fill(0);
        }
        self.len = len;
        Ok(())
    }
}

fn step_for(len: usize) -> usize {
    match len {
        0..=255 => 64,
        256..=1023 => 256,
        1024..=4095 => 1024,
        4096..=16383 => 4096,
        _ => 16384,
    }
}

/// A free-list of reusable byte blocks.
#[derive(Debug, Default)]
pub struct MemoryPool {
    blocks: Vec<Block>,
    free: Vec<u32>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks ever allocated by this pool.
    pub fn allocated(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks waiting on the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Take a block from the free list, or allocate one if the list is empty.
    ///
    /// The block comes back with zero length and capacity and a version no
    /// earlier handle to the same slot carries.
    pub fn get(&mut self) -> BlockHandle {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.blocks.push(Block::default());
                (self.blocks.len() - 1) as u32
            }
        };
        let block = &mut self.blocks[slot as usize];
        block.version = block.version.wrapping_add(1);
        block.len = 0;
        BlockHandle {
            slot,
            version: block.version,
        }
    }

    /// Hand a block back. Every outstanding handle to it becomes stale.
    pub fn return_block(&mut self, handle: BlockHandle) -> Result<()> {
        let block = self.block_mut(handle)?;
        block.version = block.version.wrapping_add(1);
        block.len = 0;
        block.capacity = 0;
        block.step = 0;
        block.data.clear();
        self.free.push(handle.slot);
        Ok(())
    }

    /// Current version of the handle's slot, failing if the handle is stale.
    pub fn version(&self, handle: BlockHandle) -> Result<u32> {
        Ok(self.block(handle)?.version)
    }

    pub fn len(&self, handle: BlockHandle) -> Result<usize> {
        Ok(self.block(handle)?.len)
    }

    pub fn capacity(&self, handle: BlockHandle) -> Result<usize> {
        Ok(self.block(handle)?.capacity)
    }

    /// Resize the logical length, growing capacity through the step table.
    pub fn set_len(&mut self, handle: BlockHandle, len: usize) -> Result<()> {
        self.block_mut(handle)?.set_len(len)
    }

    pub fn read(&self, handle: BlockHandle, index: usize) -> Result<u8> {
        let block = self.block(handle)?;
        if index >= block.len {
            return Err(TernStreamError::IndexOutOfRange {
                index,
                len: block.len,
            });
        }
        Ok(block.data[index])
    }

    /// Store `value` at `index`, extending the length to cover it.
    pub fn write(&mut self, handle: BlockHandle, index: usize, value: u8) -> Result<()> {
        let block = self.block_mut(handle)?;
        if index >= MAX_BLOCK_LEN {
            return Err(TernStreamError::IndexOutOfRange {
                index,
                len: block.len,
            });
        }
        if index >= block.len {
            block.set_len(index + 1)?;
        }
        block.data[index] = value;
        Ok(())
    }

    /// Replace the contents with `src`.
    pub fn copy_from(&mut self, handle: BlockHandle, src: &[u8]) -> Result<()> {
        let block = self.block_mut(handle)?;
        block.set_len(src.len())?;
        block.data[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Copy the contents into `dst`, returning the number of bytes written.
    pub fn copy_to(&self, handle: BlockHandle, dst: &mut [u8]) -> Result<usize> {
        let block = self.block(handle)?;
        if dst.len() < block.len {
            return Err(TernStreamError::BufferTooSmall {
                need: block.len,
                have: dst.len(),
            });
        }
        dst[..block.len].copy_from_slice(&block.data[..block.len]);
        Ok(block.len)
    }

    pub fn as_slice(&self, handle: BlockHandle) -> Result<&[u8]> {
        let block = self.block(handle)?;
        Ok(&block.data[..block.len])
    }

    /// Copy the contents out into an owned buffer for the application.
    pub fn to_bytes(&self, handle: BlockHandle) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.as_slice(handle)?))
    }

    fn block(&self, handle: BlockHandle) -> Result<&Block> {
        let block = self
            .blocks
            .get(handle.slot as usize)
            .ok_or(TernStreamError::StaleBlock {
                held: handle.version,
                current: 0,
            })?;
        if block.version != handle.version {
            return Err(TernStreamError::StaleBlock {
                held: handle.version,
                current: block.version,
            });
        }
        Ok(block)
    }

    fn block_mut(&mut self, handle: BlockHandle) -> Result<&mut Block> {
        let block = self
            .blocks
            .get_mut(handle.slot as usize)
            .ok_or(TernStreamError::StaleBlock {
                held: handle.version,
                current: 0,
            })?;
        if block.version != handle.version {
            return Err(TernStreamError::StaleBlock {
                held: handle.version,
                current: block.version,
            });
        }
        Ok(block)
    }
}
