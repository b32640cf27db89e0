//! Block device abstraction consumed by the firmware update store.
//!
//! [`BlockIo`] is the block-granular read/write primitive the GPT accessor is built on. Platforms implement it
//! over their flash driver; [`RamDisk`] is an in-memory implementation used by tests, benchmarks and host tools.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{vec, vec::Vec};

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::error::{FwuError, Result};

/// Geometry of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMedia {
    /// Identifier of the media currently in the device.
    pub media_id: u32,
    /// Size of a device block in bytes. Need not be a power of two.
    pub block_size: u32,
    /// Index of the last addressable block.
    pub last_block: u64,
}

impl BlockMedia {
    /// Total size of the device in bytes.
    pub fn size(&self) -> u64 {
        (self.last_block + 1) * self.block_size as u64
    }
}

/// Block-granular access to a storage device.
///
/// `buffer.len()` must be a multiple of the block size for both reads and writes.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait BlockIo {
    /// Returns the device geometry.
    fn media(&self) -> BlockMedia;

    /// Reads `buffer.len()` bytes starting at block `lba`.
    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes `buffer.len()` bytes starting at block `lba`.
    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<()>;
}

impl<T: BlockIo + ?Sized> BlockIo for &mut T {
    fn media(&self) -> BlockMedia {
        (**self).media()
    }

    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<()> {
        (**self).read_blocks(lba, buffer)
    }

    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<()> {
        (**self).write_blocks(lba, buffer)
    }
}

/// An in-memory block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamDisk {
    block_size: u32,
    data: Vec<u8>,
    writes: usize,
}

impl RamDisk {
    /// Creates a zero-filled disk of `block_count` blocks of `block_size` bytes.
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self { block_size, data: vec![0; block_size as usize * block_count as usize], writes: 0 }
    }

    /// Wraps an existing image. The image length is truncated to a whole number of blocks.
    pub fn from_bytes(block_size: u32, mut data: Vec<u8>) -> Self {
        let len = data.len() - data.len() % block_size as usize;
        data.truncate(len);
        Self { block_size, data, writes: 0 }
    }

    /// The raw disk contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The raw disk contents, for tests that corrupt the disk behind the store's back.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the disk, returning its contents.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of `write_blocks` calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    fn range(&self, lba: u64, len: usize) -> Result<core::ops::Range<usize>> {
        let bs = self.block_size as usize;
        if bs == 0 || len % bs != 0 {
            return Err(FwuError::InvalidParameter);
        }
        let start = (lba as usize).checked_mul(bs).ok_or(FwuError::InvalidParameter)?;
        let end = start.checked_add(len).ok_or(FwuError::InvalidParameter)?;
        if end > self.data.len() {
            log::error!(target: "fwu_gpt", "RamDisk access {:#x}..{:#x} past end {:#x}.", start, end, self.data.len());
            return Err(FwuError::DeviceError);
        }
        Ok(start..end)
    }
}

impl BlockIo for RamDisk {
    fn media(&self) -> BlockMedia {
        let blocks = (self.data.len() / self.block_size.max(1) as usize) as u64;
        BlockMedia { media_id: 0, block_size: self.block_size, last_block: blocks.saturating_sub(1) }
    }

    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<()> {
        let range = self.range(lba, buffer.len())?;
        buffer.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<()> {
        let range = self.range(lba, buffer.len())?;
        self.data[range].copy_from_slice(buffer);
        self.writes += 1;
        Ok(())
    }
}
