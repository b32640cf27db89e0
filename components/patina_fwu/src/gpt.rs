//! GPT partition accessor.
//!
//! Opens a GPT formatted block device, caches the partition table, and provides byte-granular reads and writes
//! inside partitions. GPT addresses are expressed in 512-byte logical blocks while the underlying device may use
//! any block size, so every access is spliced through a scratch buffer covering the enclosing device blocks.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{string::String, vec, vec::Vec};
use core::mem::size_of;

use r_efi::efi;
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::*;

use crate::{
    block_io::{BlockIo, RamDisk},
    error::{FwuError, Result},
};

/// Size of a GPT logical block.
pub const GPT_PARTITION_LBA_SIZE: u64 = 512;
/// Size of the protective MBR preceding the GPT header.
pub const GPT_PROTECTIVE_MBR_SIZE: u64 = 512;
/// "EFI PART"
pub const GPT_HEADER_SIGNATURE: u64 = 0x5452_4150_2049_4645;
pub const GPT_HEADER_REVISION: u32 = 0x0001_0000;
/// Number of UTF-16 code units in a partition name.
pub const PARTITION_NAME_LEN: usize = 36;

/// On-disk GPT header.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GptHeader {
    pub signature: u64,
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub reserved: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: u64,
    pub number_of_partition_entries: u32,
    pub size_of_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
}

/// On-disk GPT partition entry.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PartitionEntry {
    pub partition_type_guid: [u8; 16],
    pub unique_partition_guid: [u8; 16],
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    pub partition_name: [u16; PARTITION_NAME_LEN],
}

const _: () = assert!(size_of::<GptHeader>() == 92);
const _: () = assert!(size_of::<PartitionEntry>() == 128);

impl PartitionEntry {
    pub fn type_guid(&self) -> efi::Guid {
        efi::Guid::from_bytes(&self.partition_type_guid)
    }

    /// Returns true if the NUL terminated UTF-16 partition name equals `name`.
    pub fn has_name(&self, name: &str) -> bool {
        let stored = self.partition_name;
        let len = stored.iter().position(|&c| c == 0).unwrap_or(PARTITION_NAME_LEN);
        stored[..len].iter().copied().eq(name.encode_utf16())
    }

    /// The partition name, with invalid UTF-16 replaced.
    pub fn name(&self) -> String {
        let stored = self.partition_name;
        let len = stored.iter().position(|&c| c == 0).unwrap_or(PARTITION_NAME_LEN);
        char::decode_utf16(stored[..len].iter().copied()).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
    }

    /// Size of the partition in bytes.
    pub fn size(&self) -> u64 {
        let (start, end) = (self.starting_lba, self.ending_lba);
        (end.saturating_sub(start) + 1) * GPT_PARTITION_LBA_SIZE
    }

    fn is_unused(&self) -> bool {
        self.partition_type_guid == [0u8; 16]
    }
}

/// Location of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStats {
    /// First GPT LBA of the partition.
    pub start_lba: u64,
    /// Size of the partition in bytes.
    pub size: u64,
}

/// An opened GPT disk.
pub struct GptDisk<B: BlockIo> {
    device: B,
    header: GptHeader,
    entries: Vec<PartitionEntry>,
}

impl<B: BlockIo> GptDisk<B> {
    /// Reads the GPT header behind the protective MBR and caches the partition array.
    ///
    /// Fails with [`FwuError::Aborted`] if the header can't be read, isn't a GPT header, describes entries of an
    /// unexpected size, or the partition array can't be read.
    pub fn open(mut device: B) -> Result<Self> {
        let mut raw = [0u8; size_of::<GptHeader>()];
        if let Err(e) = read_spliced(&mut device, &mut raw, GPT_PROTECTIVE_MBR_SIZE, 0) {
            log::error!(target: "fwu_gpt", "Cannot retrieve GPT header: {:?}", e);
            return Err(FwuError::Aborted);
        }
        let header = GptHeader::read_from_bytes(&raw).map_err(|_| FwuError::Aborted)?;

        let (signature, entry_lba, count, entry_size) = (
            header.signature,
            header.partition_entry_lba,
            header.number_of_partition_entries,
            header.size_of_partition_entry,
        );
        log::debug!(
            target: "fwu_gpt",
            "GPT header: signature {:#x} entries at lba {:#x}, {} entries of {} bytes.",
            signature,
            entry_lba,
            count,
            entry_size
        );

        if signature != GPT_HEADER_SIGNATURE {
            log::error!(target: "fwu_gpt", "Invalid GPT signature {:#x}.", signature);
            return Err(FwuError::Aborted);
        }
        if entry_size as usize != size_of::<PartitionEntry>() {
            log::error!(target: "fwu_gpt", "Partition entry size mismatch ({:#x}).", entry_size);
            return Err(FwuError::Aborted);
        }

        let array_size = count as u64 * entry_size as u64;
        if entry_lba.saturating_mul(GPT_PARTITION_LBA_SIZE).saturating_add(array_size) > device.media().size() {
            log::error!(target: "fwu_gpt", "Partition array exceeds the device.");
            return Err(FwuError::Aborted);
        }

        let mut entries = vec![PartitionEntry::new_zeroed(); count as usize];
        if count > 0 {
            if let Err(e) = read_spliced(&mut device, entries.as_mut_slice().as_mut_bytes(), 0, entry_lba) {
                log::error!(target: "fwu_gpt", "Failed to read GPT partition table: {:?}", e);
                return Err(FwuError::Aborted);
            }
        }

        Ok(Self { device, header, entries })
    }

    pub fn header(&self) -> &GptHeader {
        &self.header
    }

    /// The cached partition array, unused entries included.
    pub fn partitions(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn block_io(&self) -> &B {
        &self.device
    }

    /// Reads `buffer.len()` bytes at `offset` bytes from the start of the partition beginning at `base_lba`.
    pub fn read_partition(&mut self, buffer: &mut [u8], offset: u64, base_lba: u64) -> Result<()> {
        read_spliced(&mut self.device, buffer, offset, base_lba)
    }

    /// Writes `data` at `offset` bytes from the start of the partition beginning at `base_lba`.
    pub fn write_partition(&mut self, data: &[u8], offset: u64, base_lba: u64) -> Result<()> {
        write_spliced(&mut self.device, data, offset, base_lba)
    }

    /// Returns the location of the first partition accepted by `matcher`.
    pub fn matched_partition_stats<F>(&self, matcher: F) -> Result<PartitionStats>
    where
        F: Fn(&PartitionEntry) -> bool,
    {
        self.entries
            .iter()
            .filter(|entry| !entry.is_unused())
            .find(|entry| matcher(entry))
            .map(|entry| PartitionStats { start_lba: entry.starting_lba, size: entry.size() })
            .ok_or(FwuError::NotFound)
    }

    /// Releases the cached table and hands the block device back.
    pub fn release(self) -> B {
        self.device
    }
}

/// Device block window covering a byte range.
struct Window {
    lba: u64,
    head: usize,
    len: usize,
}

fn window(block_size: u32, size: usize, offset: u64, base_lba: u64) -> Result<Window> {
    if size == 0 || block_size == 0 {
        return Err(FwuError::InvalidParameter);
    }
    let bs = block_size as u64;
    let start = base_lba
        .checked_mul(GPT_PARTITION_LBA_SIZE)
        .and_then(|b| b.checked_add(offset))
        .ok_or(FwuError::InvalidParameter)?;
    let end = start.checked_add(size as u64).ok_or(FwuError::InvalidParameter)?;
    let lba = start / bs;
    let end_lba = end.div_ceil(bs);
    Ok(Window { lba, head: (start - lba * bs) as usize, len: ((end_lba - lba) * bs) as usize })
}

fn read_spliced<B: BlockIo + ?Sized>(device: &mut B, buffer: &mut [u8], offset: u64, base_lba: u64) -> Result<()> {
    let w = window(device.media().block_size, buffer.len(), offset, base_lba)?;
    let mut scratch = vec![0u8; w.len];
    device.read_blocks(w.lba, &mut scratch).inspect_err(|e| {
        log::error!(target: "fwu_gpt", "Flash read failed lba {:#x} size {:#x}: {:?}", w.lba, w.len, e);
    })?;
    buffer.copy_from_slice(&scratch[w.head..w.head + buffer.len()]);
    Ok(())
}

fn write_spliced<B: BlockIo + ?Sized>(device: &mut B, data: &[u8], offset: u64, base_lba: u64) -> Result<()> {
    let w = window(device.media().block_size, data.len(), offset, base_lba)?;
    let mut scratch = vec![0u8; w.len];
    device.read_blocks(w.lba, &mut scratch).inspect_err(|e| {
        log::error!(target: "fwu_gpt", "Flash read failed lba {:#x} size {:#x}: {:?}", w.lba, w.len, e);
    })?;
    scratch[w.head..w.head + data.len()].copy_from_slice(data);
    device.write_blocks(w.lba, &scratch).inspect_err(|e| {
        log::error!(target: "fwu_gpt", "Flash write failed lba {:#x} size {:#x}: {:?}", w.lba, data.len(), e);
    })
}

/// Lays out a GPT disk image in memory.
///
/// Partitions are placed back to back after the primary partition array, in the order they are added.
pub struct GptDiskBuilder {
    block_size: u32,
    entry_count: u32,
    disk_guid: efi::Guid,
    partitions: Vec<(String, efi::Guid, u64)>,
}

impl GptDiskBuilder {
    /// Number of entries in the partition array unless overridden.
    pub const DEFAULT_ENTRY_COUNT: u32 = 128;

    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            entry_count: Self::DEFAULT_ENTRY_COUNT,
            disk_guid: efi::Guid::from_fields(
                0x2c8e_7a61,
                0x1f0d,
                0x4b59,
                0x9e,
                0x21,
                &[0x5d, 0x3b, 0x7a, 0x60, 0x12, 0xc4],
            ),
            partitions: Vec::new(),
        }
    }

    pub fn with_entry_count(mut self, count: u32) -> Self {
        self.entry_count = count;
        self
    }

    /// Adds a partition of at least `size` bytes, rounded up to whole GPT blocks.
    pub fn partition(mut self, name: &str, type_guid: efi::Guid, size: u64) -> Self {
        self.partitions.push((String::from(name), type_guid, size));
        self
    }

    /// Builds the disk image.
    pub fn build(self) -> Result<RamDisk> {
        if self.block_size == 0 || self.partitions.len() > self.entry_count as usize {
            return Err(FwuError::InvalidParameter);
        }
        let lba = GPT_PARTITION_LBA_SIZE;
        let array_size = self.entry_count as u64 * size_of::<PartitionEntry>() as u64;
        let array_lbas = array_size.div_ceil(lba);
        let first_usable = 2 + array_lbas;

        let mut entries = vec![PartitionEntry::new_zeroed(); self.entry_count as usize];
        let mut next = first_usable;
        for (idx, (name, type_guid, size)) in self.partitions.iter().enumerate() {
            let blocks = size.div_ceil(lba).max(1);
            let units: Vec<u16> = name.encode_utf16().collect();
            if units.len() > PARTITION_NAME_LEN {
                return Err(FwuError::InvalidParameter);
            }
            let mut partition_name = [0u16; PARTITION_NAME_LEN];
            partition_name[..units.len()].copy_from_slice(&units);

            let mut unique = *self.disk_guid.as_bytes();
            unique[15] = unique[15].wrapping_add(idx as u8 + 1);
            entries[idx] = PartitionEntry {
                partition_type_guid: *type_guid.as_bytes(),
                unique_partition_guid: unique,
                starting_lba: next,
                ending_lba: next + blocks - 1,
                attributes: 0,
                partition_name,
            };
            next += blocks;
        }
        let last_usable = next.max(first_usable) - 1;
        // Room for the backup array and header.
        let total_lbas = next + array_lbas + 1;
        let disk_size = (total_lbas * lba).div_ceil(self.block_size as u64) * self.block_size as u64;

        let mut image = vec![0u8; disk_size as usize];
        // Protective MBR boot signature.
        image[510] = 0x55;
        image[511] = 0xAA;

        let array_bytes = entries.as_slice().as_bytes();
        let mut header = GptHeader {
            signature: GPT_HEADER_SIGNATURE,
            revision: GPT_HEADER_REVISION,
            header_size: size_of::<GptHeader>() as u32,
            header_crc32: 0,
            reserved: 0,
            my_lba: 1,
            alternate_lba: total_lbas - 1,
            first_usable_lba: first_usable,
            last_usable_lba: last_usable,
            disk_guid: *self.disk_guid.as_bytes(),
            partition_entry_lba: 2,
            number_of_partition_entries: self.entry_count,
            size_of_partition_entry: size_of::<PartitionEntry>() as u32,
            partition_entry_array_crc32: crc32fast::hash(array_bytes),
        };
        header.header_crc32 = crc32fast::hash(header.as_bytes());

        let header_at = GPT_PROTECTIVE_MBR_SIZE as usize;
        image[header_at..header_at + size_of::<GptHeader>()].copy_from_slice(header.as_bytes());
        let array_at = (2 * lba) as usize;
        image[array_at..array_at + array_bytes.len()].copy_from_slice(array_bytes);

        log::debug!(
            target: "fwu_gpt",
            "Built GPT disk: {} partitions, {:#x} bytes, device block size {}.",
            self.partitions.len(),
            disk_size,
            self.block_size
        );
        Ok(RamDisk::from_bytes(self.block_size, image))
    }
}
