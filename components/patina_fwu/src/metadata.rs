//! Firmware update metadata store.
//!
//! The metadata records which bank is active, which bank was active before it, and the accept state of every
//! image in every bank. Two copies are kept in dedicated GPT partitions (active and backup), each protected by a
//! CRC32 over everything but the CRC field itself.
//!
//! The on-disk layout is versioned. Every version starts with the same common header; the version field selects a
//! [`MetadataFormat`] implementation which owns the bytes and interprets the version specific body.
//!
//! ```text
//! offset  size  field
//! 0x00    4     crc32 over [0x04, metadata size)
//! 0x04    4     version
//! 0x08    4     active index
//! 0x0C    4     previous active index
//! 0x10    ...   version specific
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{boxed::Box, vec::Vec};
use core::mem::size_of;

use r_efi::efi;
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::*;

use crate::{
    block_io::BlockIo,
    config::FwuConfig,
    error::{FwuError, Result},
    gpt::{GptDisk, PartitionStats},
    psa::PSA_FWU_METADATA_GUID,
};

pub mod v2;

/// Number of attempts made to persist each metadata copy.
pub const MAX_SAVE_RETRIES: usize = 3;

/// Header shared by every metadata format version.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MetadataCommonHeader {
    pub crc32: u32,
    pub version: u32,
    pub active_index: u32,
    pub previous_active_index: u32,
}

/// How [`MetadataFormat::set_accept_state`] changes an image's accept state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptRequest {
    /// Mark the image unaccepted.
    Unaccept,
    /// Mark the image accepted.
    Accept,
    /// Mark the image unaccepted and invalidate its bank because a write is starting.
    UnacceptOnWriteStart,
}

/// Aggregate state of a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankState {
    /// The bank doesn't hold a usable image set.
    Invalid,
    /// The bank holds an image set of which at least one image is unaccepted.
    Valid,
    /// Every image in the bank is accepted.
    Accepted,
}

/// Version specific interpretation of the metadata bytes.
///
/// Loading is the job of the per-version module (see [`v2::load`]); dropping the value releases the metadata.
pub trait MetadataFormat {
    /// The on-disk format version.
    fn version(&self) -> u32;

    fn num_banks(&self) -> u8;

    /// Number of images per bank.
    fn num_images(&self) -> u16;

    /// True if the active bank holds images that are not all accepted yet.
    fn check_trial_run_state(&self) -> bool;

    /// Every image type managed by the store, in metadata order.
    fn image_type_guids(&self) -> Vec<efi::Guid>;

    fn location_guid(&self, image_type: &efi::Guid) -> Result<efi::Guid>;

    /// The GUID of the image of type `image_type` stored in `bank`.
    fn image_guid(&self, image_type: &efi::Guid, bank: u32) -> Result<efi::Guid>;

    fn accept_state(&self, image_type: &efi::Guid, bank: u32) -> Result<bool>;

    fn set_accept_state(&mut self, image_type: &efi::Guid, bank: u32, request: AcceptRequest) -> Result<()>;

    /// Recomputes the aggregate state of `bank` from its images' accept flags.
    fn update_bank_state(&mut self, bank: u32) -> Result<()>;

    /// Copies the image properties and state of the `backup` bank onto the `target` bank.
    ///
    /// Fails with [`FwuError::InvalidParameter`] unless `backup` is accepted.
    fn rollback(&mut self, backup: u32, target: u32) -> Result<()>;

    fn bank_state(&self, bank: u32) -> Result<BankState>;

    /// The full metadata, `metadata size` bytes long.
    fn as_bytes(&self) -> &[u8];

    fn as_bytes_mut(&mut self) -> &mut [u8];
}

/// Loaded metadata together with the location of its two on-disk copies.
pub struct FwsMetadata {
    format: Box<dyn MetadataFormat>,
    active_lba: u64,
    backup_lba: u64,
}

/// Returns true if `entry` is the metadata partition called `name`.
pub fn is_metadata_partition(entry: &crate::gpt::PartitionEntry, name: &str) -> bool {
    entry.type_guid() == PSA_FWU_METADATA_GUID && entry.has_name(name)
}

/// Locates a metadata copy by partition name and metadata type GUID.
pub(crate) fn find_metadata_partition<B: BlockIo>(gpt: &GptDisk<B>, name: &str) -> Result<PartitionStats> {
    gpt.matched_partition_stats(|entry| is_metadata_partition(entry, name)).inspect_err(|_| {
        log::error!(target: "fwu_metadata", "Metadata partition {} not found.", name);
    })
}

fn read_common_header<B: BlockIo>(gpt: &mut GptDisk<B>, name: &str) -> Result<MetadataCommonHeader> {
    let stats = find_metadata_partition(gpt, name)?;
    let mut raw = [0u8; size_of::<MetadataCommonHeader>()];
    gpt.read_partition(&mut raw, 0, stats.start_lba).inspect_err(|e| {
        log::error!(target: "fwu_metadata", "Failed to read {} common header: {:?}", name, e);
    })?;
    MetadataCommonHeader::read_from_bytes(&raw).map_err(|_| FwuError::InvalidParameter)
}

/// Computes the metadata CRC32, which covers everything after the CRC field.
pub fn metadata_crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes.get(size_of::<u32>()..).unwrap_or_default())
}

impl FwsMetadata {
    /// Loads the metadata, dispatching on the version in the copies' common headers.
    ///
    /// The active copy's version is used when supported, otherwise the backup's; the copy with the bad version is
    /// then repaired by the loader. Fails with [`FwuError::Unsupported`] when neither copy carries a known version
    /// and [`FwuError::Aborted`] when neither copy is valid. A single invalid copy is repaired from the valid one
    /// before this returns.
    pub fn init<B: BlockIo>(gpt: &mut GptDisk<B>, config: &FwuConfig) -> Result<Self> {
        let active = read_common_header(gpt, &config.metadata_partition_name)?.version;
        let backup = read_common_header(gpt, &config.backup_metadata_partition_name)?.version;

        match [active, backup].into_iter().find(|&version| version == v2::METADATA_V2_VERSION) {
            Some(v2::METADATA_V2_VERSION) => {
                if active != backup {
                    log::warn!(target: "fwu_metadata", "Metadata versions: active {}, backup {}.", active, backup);
                }
                let loaded = v2::load(gpt, config)?;
                Ok(Self {
                    format: Box::new(loaded.metadata),
                    active_lba: loaded.active_lba,
                    backup_lba: loaded.backup_lba,
                })
            }
            _ => {
                log::error!(target: "fwu_metadata", "Invalid metadata version: active {}, backup {}", active, backup);
                Err(FwuError::Unsupported)
            }
        }
    }

    /// Wraps already loaded metadata.
    pub fn from_format(format: Box<dyn MetadataFormat>, active_lba: u64, backup_lba: u64) -> Self {
        Self { format, active_lba, backup_lba }
    }

    pub fn format(&self) -> &dyn MetadataFormat {
        self.format.as_ref()
    }

    pub fn format_mut(&mut self) -> &mut dyn MetadataFormat {
        self.format.as_mut()
    }

    pub fn active_lba(&self) -> u64 {
        self.active_lba
    }

    pub fn backup_lba(&self) -> u64 {
        self.backup_lba
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.format.as_bytes()
    }

    /// Puts back bytes previously taken from [`Self::as_bytes`], undoing in-memory changes.
    pub fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let bytes = self.format.as_bytes_mut();
        if bytes.len() != snapshot.len() {
            return Err(FwuError::InvalidParameter);
        }
        bytes.copy_from_slice(snapshot);
        Ok(())
    }

    fn header(&self) -> MetadataCommonHeader {
        // Every format guarantees at least a common header worth of bytes.
        MetadataCommonHeader::read_from_prefix(self.format.as_bytes())
            .map(|(header, _)| header)
            .unwrap_or_else(|_| MetadataCommonHeader::new_zeroed())
    }

    fn header_mut(&mut self) -> Result<&mut MetadataCommonHeader> {
        MetadataCommonHeader::mut_from_prefix(self.format.as_bytes_mut())
            .map(|(header, _)| header)
            .map_err(|_| FwuError::InvalidParameter)
    }

    /// Verifies the CRC32 of the in-memory metadata.
    pub fn crc_check(&self) -> Result<()> {
        let expected = self.header().crc32;
        let actual = metadata_crc32(self.format.as_bytes());
        if expected != actual {
            log::error!(
                target: "fwu_metadata",
                "Metadata CRC mismatch: stored {:#x}, computed {:#x}.",
                expected,
                actual
            );
            return Err(FwuError::CrcError);
        }
        Ok(())
    }

    /// Refreshes the CRC32 and writes the metadata to the active copy, then to the backup copy.
    ///
    /// Each copy is attempted up to [`MAX_SAVE_RETRIES`] times. A copy that still fails leaves the store
    /// possibly inoperative and the error is returned to the caller.
    pub fn save<B: BlockIo>(&mut self, gpt: &mut GptDisk<B>) -> Result<()> {
        let crc = metadata_crc32(self.format.as_bytes());
        self.header_mut()?.crc32 = crc;

        for (lba, which) in [(self.active_lba, "Active"), (self.backup_lba, "Backup")] {
            let mut attempt = 0;
            let result = loop {
                attempt += 1;
                match gpt.write_partition(self.format.as_bytes(), 0, lba) {
                    Ok(()) => break Ok(()),
                    Err(e) if attempt >= MAX_SAVE_RETRIES => break Err(e),
                    Err(_) => {
                        log::warn!(target: "fwu_metadata", "{} metadata write attempt {} failed.", which, attempt)
                    }
                }
            };
            if let Err(e) = result {
                log::error!(
                    target: "fwu_metadata",
                    "{} metadata failed to persist! FW Store may be inoperative. {:?}",
                    which,
                    e
                );
                return Err(e);
            }
        }
        log::trace!(target: "fwu_metadata", "Metadata saved, crc {:#x}.", crc);
        Ok(())
    }

    pub fn active_index(&self) -> u32 {
        self.header().active_index
    }

    pub fn set_active_index(&mut self, index: u32) -> Result<()> {
        if index >= self.format.num_banks() as u32 {
            log::error!(target: "fwu_metadata", "Active index {} out of range.", index);
            return Err(FwuError::InvalidParameter);
        }
        self.header_mut()?.active_index = index;
        Ok(())
    }

    pub fn previous_active_index(&self) -> u32 {
        self.header().previous_active_index
    }

    pub fn set_previous_active_index(&mut self, index: u32) -> Result<()> {
        if index >= self.format.num_banks() as u32 {
            log::error!(target: "fwu_metadata", "Previous active index {} out of range.", index);
            return Err(FwuError::InvalidParameter);
        }
        self.header_mut()?.previous_active_index = index;
        Ok(())
    }

    pub fn num_banks(&self) -> u8 {
        self.format.num_banks()
    }

    pub fn num_images(&self) -> u16 {
        self.format.num_images()
    }

    pub fn check_trial_run_state(&self) -> bool {
        self.format.check_trial_run_state()
    }

    pub fn image_type_guids(&self) -> Vec<efi::Guid> {
        self.format.image_type_guids()
    }

    pub fn location_guid(&self, image_type: &efi::Guid) -> Result<efi::Guid> {
        self.format.location_guid(image_type)
    }

    pub fn image_guid(&self, image_type: &efi::Guid, bank: u32) -> Result<efi::Guid> {
        self.format.image_guid(image_type, bank)
    }

    pub fn accept_state(&self, image_type: &efi::Guid, bank: u32) -> Result<bool> {
        self.format.accept_state(image_type, bank)
    }

    pub fn set_accept_state(&mut self, image_type: &efi::Guid, bank: u32, request: AcceptRequest) -> Result<()> {
        self.format.set_accept_state(image_type, bank, request)
    }

    pub fn update_bank_state(&mut self, bank: u32) -> Result<()> {
        self.format.update_bank_state(bank)
    }

    pub fn rollback(&mut self, backup: u32, target: u32) -> Result<()> {
        self.format.rollback(backup, target)
    }

    pub fn bank_state(&self, bank: u32) -> Result<BankState> {
        self.format.bank_state(bank)
    }
}
