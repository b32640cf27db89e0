//! Firmware store device.
//!
//! An A/B bank abstraction over GPT partitions. The device tracks three bank indices:
//!
//! - the boot index, the bank the platform booted from, fixed for the lifetime of the device;
//! - the active index, the bank the metadata currently marks authoritative;
//! - the update index, the bank receiving new images, always `(active + 1) % banks`.
//!
//! Each bank partition is split evenly between the images the metadata describes, in metadata order, and every
//! image owns its slot in every bank.
//!
//! Images are opened as [`ImageFile`]s, read from the boot bank and written to the update bank. The first write to
//! a file invalidates the update bank in the metadata before any byte of the bank changes, so an interrupted update
//! is never mistaken for a usable bank.
//!
//! [`FirmwareStore`] is the seam between the MM service and the storage; [`FwsDevice`] is the GPT backed
//! implementation.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec;

use r_efi::efi;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::{
    block_io::BlockIo,
    config::FwuConfig,
    error::{FwuError, Result},
    gpt::{GptDisk, PartitionStats},
    metadata::{AcceptRequest, BankState, FwsMetadata},
    psa::FwuOpType,
};

mod image_directory;

pub use image_directory::{ImageDirectory, ImageInfo, DEFAULT_IMAGE_PERMISSIONS};

/// Chunk size of bulk partition copies and erases.
pub const INTERNAL_BUFFER_SIZE: usize = 0x10_0000;

/// Whether an update is in progress on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Off,
    On,
}

/// Work reported by [`FirmwareStore::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseProgress {
    pub progress: u32,
    pub total_work: u32,
}

/// An image opened on a firmware store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    image_type_guid: efi::Guid,
    image_guid: efi::Guid,
    op_type: FwuOpType,
    bank: u32,
    start_lba: u64,
    offset: u64,
    file_size: u64,
    max_size: u64,
    dirty: bool,
    ignore_dirty: bool,
    open: bool,
}

impl ImageFile {
    /// Creates an open, clean image file spanning `size` bytes from `start_lba`.
    pub fn new(
        image_type_guid: efi::Guid,
        image_guid: efi::Guid,
        op_type: FwuOpType,
        bank: u32,
        start_lba: u64,
        size: u64,
    ) -> Self {
        Self {
            image_type_guid,
            image_guid,
            op_type,
            bank,
            start_lba,
            offset: 0,
            file_size: size,
            max_size: size,
            dirty: false,
            ignore_dirty: false,
            open: true,
        }
    }

    /// Places the image `offset` bytes into the partition starting at `start_lba`.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn image_type_guid(&self) -> efi::Guid {
        self.image_type_guid
    }

    /// The GUID of the image stored in the file's bank.
    pub fn image_guid(&self) -> efi::Guid {
        self.image_guid
    }

    pub fn op_type(&self) -> FwuOpType {
        self.op_type
    }

    pub fn bank(&self) -> u32 {
        self.bank
    }

    /// Byte offset of the image inside its bank partition.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// True once the file has been written or erased.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Discard pending changes on release instead of applying them.
    pub fn set_ignore_dirty(&mut self) {
        self.ignore_dirty = true;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// Operations of a firmware store, as driven by the MM service.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait FirmwareStore {
    fn image_directory(&self) -> &ImageDirectory;

    /// Opens `image_type` from the update bank for writing or from the boot bank for reading.
    fn open(&mut self, image_type: &efi::Guid, op_type: FwuOpType) -> Result<ImageFile>;

    /// Reads up to `buffer.len()` bytes at `offset`, clamped to the file size. Returns the number of bytes read.
    fn read(&mut self, file: &ImageFile, offset: u64, buffer: &mut [u8]) -> Result<usize>;

    /// Writes `data` at `offset`. Fails with [`FwuError::InvalidParameter`] past the file's maximum size.
    fn write(&mut self, file: &mut ImageFile, offset: u64, data: &[u8]) -> Result<()>;

    /// Zeroes the whole image.
    fn erase(&mut self, file: &mut ImageFile) -> Result<()>;

    /// Closes `file`. [`FwuError::Timeout`] means the client must call again to complete the release.
    fn release(&mut self, file: &mut ImageFile, max_atomic_time_ns: u32) -> Result<ReleaseProgress>;

    /// Accepts `image_type` on the update bank or, if `on_update_bank` is false, on the active bank.
    fn accept_image(&mut self, image_type: &efi::Guid, on_update_bank: bool) -> Result<()>;

    fn update_start(&mut self, vendor_flags: u32) -> Result<()>;

    /// Activates the update bank, or just leaves the update when `abort` is set.
    fn update_end(&mut self, abort: bool) -> Result<()>;

    /// Restores a bank from its backup: the update bank from the active bank while updating, otherwise the active
    /// bank from the previously active one.
    fn rollback(&mut self) -> Result<()>;

    /// True if the active bank holds images that are not all accepted.
    fn check_trial_state(&self) -> bool;

    /// True if the platform booted from the active bank.
    fn check_correct_boot(&self) -> bool;
}

/// GPT backed firmware store.
pub struct FwsDevice<B: BlockIo> {
    gpt: GptDisk<B>,
    metadata: FwsMetadata,
    config: FwuConfig,
    directory: ImageDirectory,
    boot_index: u32,
    active_index: u32,
    update_index: u32,
    update_state: UpdateState,
    vendor_flags: u32,
    open_files: usize,
}

impl<B: BlockIo> FwsDevice<B> {
    /// Opens the GPT on `block_io`, loads the metadata and builds the image directory.
    pub fn open_device(block_io: B, config: FwuConfig) -> Result<Self> {
        config.validate()?;
        let mut gpt = GptDisk::open(block_io)?;
        let metadata = FwsMetadata::init(&mut gpt, &config)?;

        let num_banks = metadata.num_banks() as u32;
        let active_index = metadata.active_index();
        let boot_index = config.boot_index.unwrap_or(active_index);
        if boot_index >= num_banks {
            log::error!(target: "fwu_store", "Boot index {} out of {} banks.", boot_index, num_banks);
            return Err(FwuError::InvalidParameter);
        }
        let update_index = (active_index + 1) % num_banks;
        log::debug!(target: "fwu_store", "BootIndex: {}", boot_index);
        log::debug!(target: "fwu_store", "ActiveIndex: {}", active_index);
        log::debug!(target: "fwu_store", "UpdateIndex: {}", update_index);

        let boot_bank = bank_stats(&gpt, &config, boot_index)?;
        let directory = ImageDirectory::build(&metadata, boot_index, boot_bank.size, &config)?;

        Ok(Self {
            gpt,
            metadata,
            config,
            directory,
            boot_index,
            active_index,
            update_index,
            update_state: UpdateState::Off,
            vendor_flags: 0,
            open_files: 0,
        })
    }

    /// Tears the device down and hands the block device back.
    ///
    /// Refused while image files are open; the device is returned unchanged in that case.
    pub fn release_device(self) -> core::result::Result<B, Self> {
        if self.open_files != 0 {
            log::error!(target: "fwu_store", "Release device busy! Open image file count: {}", self.open_files);
            return Err(self);
        }
        Ok(self.gpt.release())
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files
    }

    pub fn boot_index(&self) -> u32 {
        self.boot_index
    }

    pub fn active_index(&self) -> u32 {
        self.active_index
    }

    pub fn update_index(&self) -> u32 {
        self.update_index
    }

    pub fn update_state(&self) -> UpdateState {
        self.update_state
    }

    /// Vendor flags recorded by the last update start.
    pub fn vendor_flags(&self) -> u32 {
        self.vendor_flags
    }

    pub fn metadata(&self) -> &FwsMetadata {
        &self.metadata
    }

    pub fn gpt(&self) -> &GptDisk<B> {
        &self.gpt
    }

    fn rollback_bank(&mut self, backup: u32, target: u32) -> Result<()> {
        if self.metadata.bank_state(backup)? != BankState::Accepted {
            log::error!(target: "fwu_store", "Backup bank {} isn't accepted, nothing to roll back to.", backup);
            return Err(FwuError::InvalidParameter);
        }
        let source = bank_stats(&self.gpt, &self.config, backup)?;
        let dest = bank_stats(&self.gpt, &self.config, target)?;
        if source.size > dest.size {
            log::error!(
                target: "fwu_store",
                "Backup bank {} ({:#x} bytes) doesn't fit bank {} ({:#x} bytes).",
                backup,
                source.size,
                target,
                dest.size
            );
            return Err(FwuError::InvalidParameter);
        }

        let mut buffer = vec![0u8; INTERNAL_BUFFER_SIZE.min(source.size as usize)];
        let mut offset = 0u64;
        while offset < source.size {
            let chunk = (source.size - offset).min(INTERNAL_BUFFER_SIZE as u64) as usize;
            let buffer = &mut buffer[..chunk];
            self.gpt.read_partition(buffer, offset, source.start_lba).inspect_err(|e| {
                log::error!(target: "fwu_store", "Fail to read from Backup Partition: {:?}", e);
            })?;
            self.gpt.write_partition(buffer, offset, dest.start_lba).inspect_err(|e| {
                log::error!(target: "fwu_store", "Fail to write to Target Partition: {:?}", e);
            })?;
            offset += chunk as u64;
        }

        self.metadata.rollback(backup, target)?;
        self.metadata.save(&mut self.gpt)
    }
}

/// Byte offset and size of `image_type` in a bank of `bank_size` bytes.
///
/// The bank is split evenly between the images, in metadata order.
fn image_slot(metadata: &FwsMetadata, image_type: &efi::Guid, bank_size: u64) -> Result<(u64, u64)> {
    let guids = metadata.image_type_guids();
    let index = guids.iter().position(|g| g == image_type).ok_or(FwuError::NotFound)? as u64;
    let size = bank_size / guids.len() as u64;
    Ok((index * size, size))
}

fn bank_stats<B: BlockIo>(gpt: &GptDisk<B>, config: &FwuConfig, bank: u32) -> Result<PartitionStats> {
    let name = config.bank_partition_names.get(bank as usize).ok_or(FwuError::InvalidParameter)?;
    gpt.matched_partition_stats(|entry| entry.has_name(name)).inspect_err(|e| {
        log::error!(target: "fwu_store", "Fail to find bank {} partition {}: {:?}", bank, name, e);
    })
}

impl<B: BlockIo> FirmwareStore for FwsDevice<B> {
    fn image_directory(&self) -> &ImageDirectory {
        &self.directory
    }

    fn open(&mut self, image_type: &efi::Guid, op_type: FwuOpType) -> Result<ImageFile> {
        let bank = match op_type {
            FwuOpType::Write => self.update_index,
            FwuOpType::Read => self.boot_index,
        };
        let stats = bank_stats(&self.gpt, &self.config, bank)?;
        let image_guid = self.metadata.image_guid(image_type, bank).inspect_err(|_| {
            log::error!(target: "fwu_store", "Fail to find image type {:?} in bank {}.", image_type, bank);
        })?;
        let (offset, size) = image_slot(&self.metadata, image_type, stats.size)?;
        let max_size = self.directory.entry(image_type).map_or(size, |e| size.min(e.max_size as u64));

        self.open_files += 1;
        log::debug!(
            target: "fwu_store",
            "Opened {:?} on bank {} for {:?}, {:#x} bytes at lba {:#x} offset {:#x}.",
            image_type,
            bank,
            op_type,
            max_size,
            stats.start_lba,
            offset
        );
        Ok(ImageFile::new(*image_type, image_guid, op_type, bank, stats.start_lba, max_size).with_offset(offset))
    }

    fn read(&mut self, file: &ImageFile, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        if !file.open {
            return Err(FwuError::InvalidParameter);
        }
        let len = file.file_size.saturating_sub(offset).min(buffer.len() as u64) as usize;
        if len == 0 {
            return Ok(0);
        }
        self.gpt.read_partition(&mut buffer[..len], file.offset + offset, file.start_lba)?;
        Ok(len)
    }

    fn write(&mut self, file: &mut ImageFile, offset: u64, data: &[u8]) -> Result<()> {
        if !file.open {
            return Err(FwuError::InvalidParameter);
        }
        if offset.saturating_add(data.len() as u64) > file.max_size {
            log::error!(
                target: "fwu_store",
                "Request write out of bounds. offset {:#x}, size {:#x}, image size {:#x}",
                offset,
                data.len(),
                file.max_size
            );
            return Err(FwuError::InvalidParameter);
        }

        if !file.dirty {
            self.metadata
                .set_accept_state(&file.image_type_guid, self.update_index, AcceptRequest::UnacceptOnWriteStart)
                .inspect_err(|e| log::error!(target: "fwu_store", "Fail to change accept state: {:?}", e))?;
            self.metadata.save(&mut self.gpt)?;
            self.metadata.crc_check()?;
            file.dirty = true;
        }

        if data.is_empty() {
            return Ok(());
        }
        self.gpt.write_partition(data, file.offset + offset, file.start_lba)
    }

    fn erase(&mut self, file: &mut ImageFile) -> Result<()> {
        if !file.open {
            return Err(FwuError::InvalidParameter);
        }
        let zeros = vec![0u8; INTERNAL_BUFFER_SIZE.min(file.file_size as usize)];
        let mut offset = 0u64;
        while offset < file.file_size {
            let chunk = (file.file_size - offset).min(INTERNAL_BUFFER_SIZE as u64) as usize;
            self.gpt.write_partition(&zeros[..chunk], file.offset + offset, file.start_lba)?;
            offset += chunk as u64;
        }
        file.dirty = true;
        Ok(())
    }

    fn release(&mut self, file: &mut ImageFile, max_atomic_time_ns: u32) -> Result<ReleaseProgress> {
        if !file.open {
            return Err(FwuError::InvalidParameter);
        }
        // Writes are applied synchronously, so there is nothing left to yield on.
        let _ = max_atomic_time_ns;
        if file.dirty && file.ignore_dirty {
            log::warn!(target: "fwu_store", "Discarding changes to {:?} on bank {}.", file.image_type_guid, file.bank);
        }
        file.open = false;
        self.open_files = self.open_files.saturating_sub(1);
        Ok(ReleaseProgress { progress: 100, total_work: 100 })
    }

    fn accept_image(&mut self, image_type: &efi::Guid, on_update_bank: bool) -> Result<()> {
        if self.boot_index != self.active_index {
            return Err(FwuError::NotReady);
        }
        let bank = if on_update_bank {
            debug_assert_eq!(self.update_state, UpdateState::On);
            self.update_index
        } else {
            debug_assert_eq!(self.update_state, UpdateState::Off);
            self.active_index
        };

        self.metadata
            .set_accept_state(image_type, bank, AcceptRequest::Accept)
            .inspect_err(|e| log::error!(target: "fwu_store", "Failed to set accept state: {:?}", e))?;
        if on_update_bank {
            return Ok(());
        }

        self.metadata.update_bank_state(bank)?;
        self.metadata.save(&mut self.gpt)?;
        self.directory.set_accepted(image_type);
        log::info!(target: "fwu_store", "Accepted {:?} on active bank {}.", image_type, bank);
        Ok(())
    }

    fn update_start(&mut self, vendor_flags: u32) -> Result<()> {
        if self.boot_index != self.active_index {
            return Err(FwuError::NotReady);
        }
        self.update_state = UpdateState::On;
        self.vendor_flags = vendor_flags;
        log::info!(target: "fwu_store", "Update started on bank {}.", self.update_index);
        Ok(())
    }

    fn update_end(&mut self, abort: bool) -> Result<()> {
        if self.update_state != UpdateState::On {
            return Err(FwuError::NotReady);
        }
        if abort {
            self.update_state = UpdateState::Off;
            log::info!(target: "fwu_store", "Update aborted.");
            return Ok(());
        }

        let (active, update) = (self.active_index, self.update_index);
        let snapshot = self.metadata.as_bytes().to_vec();
        let result = self
            .metadata
            .set_previous_active_index(active)
            .and_then(|_| self.metadata.set_active_index(update))
            .and_then(|_| self.metadata.update_bank_state(update))
            .and_then(|_| self.metadata.save(&mut self.gpt))
            .and_then(|_| self.metadata.crc_check());
        if let Err(e) = result {
            log::error!(target: "fwu_store", "Failed to activate bank {}: {:?}", update, e);
            // Keep the in-memory metadata in line with the indices the device still uses.
            self.metadata.restore(&snapshot)?;
            return Err(FwuError::Aborted);
        }

        self.active_index = update;
        self.update_state = UpdateState::Off;
        self.update_index = (update + 1) % self.metadata.num_banks() as u32;
        debug_assert_ne!(self.active_index, self.boot_index);
        self.directory.set_correct_boot(false);
        log::info!(target: "fwu_store", "Bank {} activated, previous active bank {}.", update, active);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.metadata.crc_check().is_err() {
            log::error!(target: "fwu_store", "Failed to check crc of metadata before rollback.");
            return Err(FwuError::DeviceError);
        }
        let (backup, target) = match self.update_state {
            UpdateState::On => (self.active_index, self.update_index),
            UpdateState::Off => (self.metadata.previous_active_index(), self.active_index),
        };
        self.rollback_bank(backup, target).inspect_err(|e| {
            log::error!(target: "fwu_store", "Failed to rollback from {} to {}: {:?}", backup, target, e);
        })?;
        if self.metadata.crc_check().is_err() {
            log::error!(target: "fwu_store", "Failed to check crc of metadata after rollback.");
            return Err(FwuError::DeviceError);
        }
        log::info!(target: "fwu_store", "Rolled back bank {} from bank {}.", target, backup);
        Ok(())
    }

    fn check_trial_state(&self) -> bool {
        self.metadata.check_trial_run_state()
    }

    fn check_correct_boot(&self) -> bool {
        self.boot_index == self.active_index
    }
}
