//! Version 2 of the firmware update metadata format.
//!
//! ```text
//! offset              size                   field
//! 0x00                32                     MetadataV2Header (common header, size, descriptor offset, bank states)
//! desc                8                      FwStoreDescV2
//! desc + 8 + i * E    32                     ImageEntryHeaderV2 of image i (E = img_entry_size)
//!   + 32 + b * 24     24                     ImageBankInfoV2 of image i in bank b
//! ```
//!
//! The bank state array in the header always has [`V2_MAX_BANKS`] slots; slots past the bank count must read
//! [`BANK_STATE_INVALID`].
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{vec, vec::Vec};
use core::{fmt, mem::size_of};

use r_efi::efi;
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::*;

use super::{find_metadata_partition, metadata_crc32, AcceptRequest, BankState, MetadataFormat};
use crate::{
    block_io::BlockIo,
    config::FwuConfig,
    error::{FwuError, Result},
    gpt::{GptDisk, PartitionStats},
};

pub const METADATA_V2_VERSION: u32 = 2;
pub const V2_MAX_BANKS: usize = 4;

pub const BANK_STATE_INVALID: u8 = 0xFF;
pub const BANK_STATE_VALID: u8 = 0xFE;
pub const BANK_STATE_ACCEPTED: u8 = 0xFC;

pub const IMAGE_ACCEPTED: u32 = 1;
pub const IMAGE_UNACCEPTED: u32 = 0;

/// Descriptor offset written by [`MetadataV2Builder`]: right after the header.
pub const DEFAULT_DESCRIPTOR_OFFSET: u16 = size_of::<MetadataV2Header>() as u16;

const MIN_METADATA_SIZE: usize = size_of::<MetadataV2Header>() + size_of::<FwStoreDescV2>();

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MetadataV2Header {
    pub crc32: u32,
    pub version: u32,
    pub active_index: u32,
    pub previous_active_index: u32,
    pub metadata_size: u32,
    pub descriptor_offset: u16,
    pub reserved0: u16,
    pub bank_state: [u8; V2_MAX_BANKS],
    pub reserved1: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FwStoreDescV2 {
    pub num_banks: u8,
    pub reserved: u8,
    pub num_images: u16,
    /// Size of one image entry, bank info included.
    pub img_entry_size: u16,
    pub bank_info_entry_size: u16,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ImageEntryHeaderV2 {
    pub img_type_guid: [u8; 16],
    pub location_guid: [u8; 16],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ImageBankInfoV2 {
    pub img_guid: [u8; 16],
    pub accepted: u32,
    pub reserved: u32,
}

const _: () = assert!(size_of::<MetadataV2Header>() == 32);
const _: () = assert!(size_of::<FwStoreDescV2>() == 8);
const _: () = assert!(size_of::<ImageEntryHeaderV2>() == 32);
const _: () = assert!(size_of::<ImageBankInfoV2>() == 24);

/// Size of one image entry for `num_banks` banks.
pub const fn image_entry_size(num_banks: usize) -> usize {
    size_of::<ImageEntryHeaderV2>() + num_banks * size_of::<ImageBankInfoV2>()
}

fn invalid(reason: fmt::Arguments) -> FwuError {
    log::error!(target: "fwu_metadata", "Invalid V2 metadata: {}", reason);
    FwuError::InvalidParameter
}

/// Structural and CRC validation of a V2 blob exactly `metadata_size` bytes long.
fn validate(bytes: &[u8], max_banks: u32) -> Result<()> {
    let (header, _) = MetadataV2Header::read_from_prefix(bytes).map_err(|_| FwuError::InvalidParameter)?;
    let size = header.metadata_size as usize;
    if size != bytes.len() {
        return Err(invalid(format_args!("size {:#x} but {:#x} bytes present", size, bytes.len())));
    }
    let version = header.version;
    if version != METADATA_V2_VERSION {
        return Err(invalid(format_args!("version {}", version)));
    }

    let desc_offset = header.descriptor_offset as usize;
    if desc_offset == 0 {
        return Err(invalid(format_args!("descriptor offset shouldn't be zero")));
    }
    if desc_offset < size_of::<MetadataV2Header>() || desc_offset + size_of::<FwStoreDescV2>() > size {
        return Err(invalid(format_args!("descriptor offset {:#x} out of bounds", desc_offset)));
    }
    let (desc, _) =
        FwStoreDescV2::read_from_prefix(&bytes[desc_offset..]).map_err(|_| FwuError::InvalidParameter)?;

    let num_banks = desc.num_banks as usize;
    if num_banks > V2_MAX_BANKS || num_banks > max_banks as usize {
        return Err(invalid(format_args!(
            "{} banks, at most {} supported",
            num_banks,
            V2_MAX_BANKS.min(max_banks as usize)
        )));
    }
    let (active, previous) = (header.active_index, header.previous_active_index);
    if active as usize >= num_banks || previous as usize >= num_banks {
        return Err(invalid(format_args!("active {} or previous {} over bank count {}", active, previous, num_banks)));
    }
    let bank_info_entry_size = desc.bank_info_entry_size;
    if bank_info_entry_size as usize != size_of::<ImageBankInfoV2>() {
        return Err(invalid(format_args!("bank info entry size {}", bank_info_entry_size)));
    }
    let img_entry_size = desc.img_entry_size as usize;
    if img_entry_size != image_entry_size(num_banks) {
        return Err(invalid(format_args!(
            "image entry size {}, expected {}",
            img_entry_size,
            image_entry_size(num_banks)
        )));
    }
    let expected_size = desc_offset + size_of::<FwStoreDescV2>() + desc.num_images as usize * img_entry_size;
    if expected_size != size {
        return Err(invalid(format_args!("metadata size {:#x}, expected {:#x}", size, expected_size)));
    }

    let entries = desc_offset + size_of::<FwStoreDescV2>();
    for bank in 0..num_banks {
        let state = header.bank_state[bank];
        if !matches!(state, BANK_STATE_INVALID | BANK_STATE_VALID | BANK_STATE_ACCEPTED) {
            return Err(invalid(format_args!("bank {} state {:#x}", bank, state)));
        }
        for image in 0..desc.num_images as usize {
            let offset = entries + image * img_entry_size + image_entry_size(bank);
            let (info, _) =
                ImageBankInfoV2::read_from_prefix(&bytes[offset..]).map_err(|_| FwuError::InvalidParameter)?;
            if info.accepted == IMAGE_UNACCEPTED && state == BANK_STATE_ACCEPTED {
                return Err(invalid(format_args!("bank {} accepted with unaccepted image {}", bank, image)));
            }
        }
    }
    for bank in num_banks..V2_MAX_BANKS {
        if header.bank_state[bank] != BANK_STATE_INVALID {
            return Err(invalid(format_args!("unused bank slot {} isn't invalid", bank)));
        }
    }

    let stored = header.crc32;
    let computed = metadata_crc32(bytes);
    if stored != computed {
        log::error!(target: "fwu_metadata", "Crc32 value should be {:#x}, stored {:#x}.", computed, stored);
        return Err(FwuError::CrcError);
    }
    Ok(())
}

/// Validated V2 metadata, owning its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataV2 {
    bytes: Vec<u8>,
    desc: FwStoreDescV2Fields,
}

// Descriptor fields cached after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FwStoreDescV2Fields {
    offset: usize,
    num_banks: u8,
    num_images: u16,
    img_entry_size: usize,
}

impl MetadataV2 {
    /// Validates `bytes` and takes a copy of the first `metadata_size` bytes.
    ///
    /// `max_banks` is the platform bank count; metadata describing more banks is rejected. A CRC mismatch fails
    /// with [`FwuError::CrcError`], any structural problem with [`FwuError::InvalidParameter`].
    pub fn parse(bytes: &[u8], max_banks: u32) -> Result<Self> {
        let (header, _) = MetadataV2Header::read_from_prefix(bytes).map_err(|_| FwuError::InvalidParameter)?;
        let size = header.metadata_size as usize;
        if !(MIN_METADATA_SIZE..=bytes.len()).contains(&size) {
            return Err(invalid(format_args!("metadata size {:#x} with {:#x} bytes available", size, bytes.len())));
        }
        let bytes = &bytes[..size];
        validate(bytes, max_banks)?;

        let offset = header.descriptor_offset as usize;
        let (desc, _) = FwStoreDescV2::read_from_prefix(&bytes[offset..]).map_err(|_| FwuError::InvalidParameter)?;
        Ok(Self {
            bytes: bytes.to_vec(),
            desc: FwStoreDescV2Fields {
                offset,
                num_banks: desc.num_banks,
                num_images: desc.num_images,
                img_entry_size: desc.img_entry_size as usize,
            },
        })
    }

    pub fn header(&self) -> MetadataV2Header {
        // Parsing guarantees the header is present.
        MetadataV2Header::read_from_prefix(&self.bytes)
            .map(|(h, _)| h)
            .unwrap_or_else(|_| MetadataV2Header::new_zeroed())
    }

    fn header_mut(&mut self) -> Result<&mut MetadataV2Header> {
        MetadataV2Header::mut_from_prefix(&mut self.bytes).map(|(h, _)| h).map_err(|_| FwuError::InvalidParameter)
    }

    fn entry_offset(&self, image: usize) -> usize {
        self.desc.offset + size_of::<FwStoreDescV2>() + image * self.desc.img_entry_size
    }

    fn entry(&self, image: usize) -> Result<ImageEntryHeaderV2> {
        let offset = self.entry_offset(image);
        let raw = self.bytes.get(offset..).ok_or(FwuError::InvalidParameter)?;
        ImageEntryHeaderV2::read_from_prefix(raw).map(|(e, _)| e).map_err(|_| FwuError::InvalidParameter)
    }

    fn bank_info_range(&self, image: usize, bank: usize) -> core::ops::Range<usize> {
        let start = self.entry_offset(image) + image_entry_size(bank);
        start..start + size_of::<ImageBankInfoV2>()
    }

    fn bank_info(&self, image: usize, bank: usize) -> Result<ImageBankInfoV2> {
        let raw = self.bytes.get(self.bank_info_range(image, bank)).ok_or(FwuError::InvalidParameter)?;
        ImageBankInfoV2::read_from_bytes(raw).map_err(|_| FwuError::InvalidParameter)
    }

    fn bank_info_mut(&mut self, image: usize, bank: usize) -> Result<&mut ImageBankInfoV2> {
        let range = self.bank_info_range(image, bank);
        let raw = self.bytes.get_mut(range).ok_or(FwuError::InvalidParameter)?;
        ImageBankInfoV2::mut_from_bytes(raw).map_err(|_| FwuError::InvalidParameter)
    }

    fn check_bank(&self, bank: u32) -> Result<usize> {
        if bank >= self.desc.num_banks as u32 {
            log::error!(target: "fwu_metadata", "Bank {} out of range ({} banks).", bank, self.desc.num_banks);
            return Err(FwuError::InvalidParameter);
        }
        Ok(bank as usize)
    }

    fn image_index(&self, image_type: &efi::Guid) -> Result<usize> {
        let wanted = image_type.as_bytes();
        for image in 0..self.desc.num_images as usize {
            if &self.entry(image)?.img_type_guid == wanted {
                return Ok(image);
            }
        }
        Err(FwuError::NotFound)
    }
}

impl MetadataFormat for MetadataV2 {
    fn version(&self) -> u32 {
        METADATA_V2_VERSION
    }

    fn num_banks(&self) -> u8 {
        self.desc.num_banks
    }

    fn num_images(&self) -> u16 {
        self.desc.num_images
    }

    fn check_trial_run_state(&self) -> bool {
        let header = self.header();
        header.bank_state.get(header.active_index as usize) == Some(&BANK_STATE_VALID)
    }

    fn image_type_guids(&self) -> Vec<efi::Guid> {
        (0..self.desc.num_images as usize)
            .filter_map(|image| self.entry(image).ok())
            .map(|entry| efi::Guid::from_bytes(&entry.img_type_guid))
            .collect()
    }

    fn location_guid(&self, image_type: &efi::Guid) -> Result<efi::Guid> {
        let entry = self.entry(self.image_index(image_type)?)?;
        Ok(efi::Guid::from_bytes(&entry.location_guid))
    }

    fn image_guid(&self, image_type: &efi::Guid, bank: u32) -> Result<efi::Guid> {
        let bank = self.check_bank(bank)?;
        let info = self.bank_info(self.image_index(image_type)?, bank)?;
        Ok(efi::Guid::from_bytes(&info.img_guid))
    }

    fn accept_state(&self, image_type: &efi::Guid, bank: u32) -> Result<bool> {
        let bank = self.check_bank(bank)?;
        let info = self.bank_info(self.image_index(image_type)?, bank)?;
        Ok(info.accepted == IMAGE_ACCEPTED)
    }

    fn set_accept_state(&mut self, image_type: &efi::Guid, bank: u32, request: AcceptRequest) -> Result<()> {
        let bank = self.check_bank(bank)?;
        let image = self.image_index(image_type)?;
        self.bank_info_mut(image, bank)?.accepted = match request {
            AcceptRequest::Accept => IMAGE_ACCEPTED,
            AcceptRequest::Unaccept | AcceptRequest::UnacceptOnWriteStart => IMAGE_UNACCEPTED,
        };
        if request == AcceptRequest::UnacceptOnWriteStart {
            self.header_mut()?.bank_state[bank] = BANK_STATE_INVALID;
        }
        Ok(())
    }

    fn update_bank_state(&mut self, bank: u32) -> Result<()> {
        let bank = self.check_bank(bank)?;
        let mut state = BANK_STATE_ACCEPTED;
        for image in 0..self.desc.num_images as usize {
            if self.bank_info(image, bank)?.accepted != IMAGE_ACCEPTED {
                state = BANK_STATE_VALID;
                break;
            }
        }
        self.header_mut()?.bank_state[bank] = state;
        Ok(())
    }

    fn rollback(&mut self, backup: u32, target: u32) -> Result<()> {
        let backup = self.check_bank(backup)?;
        let target = self.check_bank(target)?;
        let backup_state = self.header().bank_state[backup];
        if backup_state != BANK_STATE_ACCEPTED {
            log::error!(
                target: "fwu_metadata",
                "Backup bank {} state {:#x} isn't accepted.",
                backup,
                backup_state
            );
            return Err(FwuError::InvalidParameter);
        }
        for image in 0..self.desc.num_images as usize {
            let info = self.bank_info(image, backup)?;
            *self.bank_info_mut(image, target)? = info;
        }
        self.header_mut()?.bank_state[target] = backup_state;
        Ok(())
    }

    fn bank_state(&self, bank: u32) -> Result<BankState> {
        let bank = self.check_bank(bank)?;
        Ok(match self.header().bank_state[bank] {
            BANK_STATE_ACCEPTED => BankState::Accepted,
            BANK_STATE_VALID => BankState::Valid,
            _ => BankState::Invalid,
        })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

fn guid(bytes: &[u8; 16]) -> uuid::Uuid {
    uuid::Uuid::from_bytes_le(*bytes)
}

impl fmt::Display for MetadataV2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        let (crc32, active, previous, size, desc_offset, bank_state) = (
            header.crc32,
            header.active_index,
            header.previous_active_index,
            header.metadata_size,
            header.descriptor_offset,
            header.bank_state,
        );
        writeln!(f, "Metadata V2")?;
        writeln!(f, "  crc32:                 {:#010x}", crc32)?;
        writeln!(f, "  version:               {}", METADATA_V2_VERSION)?;
        writeln!(f, "  active_index:          {}", active)?;
        writeln!(f, "  previous_active_index: {}", previous)?;
        writeln!(f, "  metadata_size:         {:#x}", size)?;
        writeln!(f, "  descriptor_offset:     {:#x}", desc_offset)?;
        writeln!(f, "  bank_state:            {:02x?}", bank_state)?;
        writeln!(f, "Fw store descriptor")?;
        writeln!(f, "  num_banks:             {}", self.desc.num_banks)?;
        writeln!(f, "  num_images:            {}", self.desc.num_images)?;
        writeln!(f, "  img_entry_size:        {:#x}", self.desc.img_entry_size)?;
        writeln!(f, "  bank_info_entry_size:  {:#x}", size_of::<ImageBankInfoV2>())?;
        for image in 0..self.desc.num_images as usize {
            let entry = self.entry(image).map_err(|_| fmt::Error)?;
            writeln!(f, "Image entry [{}]", image)?;
            writeln!(f, "  img_type_guid:         {}", guid(&entry.img_type_guid))?;
            writeln!(f, "  location_guid:         {}", guid(&entry.location_guid))?;
            for bank in 0..self.desc.num_banks as usize {
                let info = self.bank_info(image, bank).map_err(|_| fmt::Error)?;
                let accepted = info.accepted;
                writeln!(f, "  bank [{}] img_guid:     {}", bank, guid(&info.img_guid))?;
                writeln!(f, "  bank [{}] accepted:     {}", bank, accepted)?;
            }
        }
        Ok(())
    }
}

/// Result of [`load`]: the metadata in use and where its two copies live.
pub struct LoadedV2 {
    pub metadata: MetadataV2,
    pub active_lba: u64,
    pub backup_lba: u64,
}

/// Reads one metadata copy. A copy whose version or size field can't be right comes back as the bare header so
/// that validation rejects it.
fn read_copy<B: BlockIo>(gpt: &mut GptDisk<B>, name: &str) -> Result<(PartitionStats, Vec<u8>)> {
    let stats = find_metadata_partition(gpt, name)?;

    let mut raw = vec![0u8; size_of::<MetadataV2Header>()];
    gpt.read_partition(&mut raw, 0, stats.start_lba).inspect_err(|e| {
        log::error!(target: "fwu_metadata", "Failed to read {} header: {:?}", name, e);
    })?;
    let (header, _) = MetadataV2Header::read_from_prefix(&raw).map_err(|_| FwuError::InvalidParameter)?;

    let version = header.version;
    if version != METADATA_V2_VERSION {
        log::error!(target: "fwu_metadata", "Invalid metadata version {} in {}.", version, name);
        return Ok((stats, raw));
    }

    let size = header.metadata_size as u64;
    if size < MIN_METADATA_SIZE as u64 || size > stats.size {
        log::error!(target: "fwu_metadata", "{} metadata size {:#x} doesn't fit the partition.", name, size);
        return Ok((stats, raw));
    }

    raw.resize(size as usize, 0);
    gpt.read_partition(&mut raw, 0, stats.start_lba).inspect_err(|e| {
        log::error!(target: "fwu_metadata", "Failed to read {}: {:?}", name, e);
    })?;
    Ok((stats, raw))
}

/// Loads both V2 copies and repairs a single invalid copy from the valid one.
///
/// Both copies invalid is unrecoverable and fails with [`FwuError::Aborted`] without touching the disk. When both
/// are valid the active copy is used as is, even if the two differ; the next save brings them back in line.
pub fn load<B: BlockIo>(gpt: &mut GptDisk<B>, config: &FwuConfig) -> Result<LoadedV2> {
    let (active_stats, active_raw) = read_copy(gpt, &config.metadata_partition_name)?;
    let (backup_stats, backup_raw) = read_copy(gpt, &config.backup_metadata_partition_name)?;

    let active = MetadataV2::parse(&active_raw, config.number_of_banks)
        .inspect_err(|e| log::warn!(target: "fwu_metadata", "Active metadata is invalid: {:?}", e))
        .ok();
    let backup = MetadataV2::parse(&backup_raw, config.number_of_banks)
        .inspect_err(|e| log::warn!(target: "fwu_metadata", "Backup metadata is invalid: {:?}", e))
        .ok();

    let metadata = match (active, backup) {
        (None, None) => {
            log::error!(target: "fwu_metadata", "Both of metadata are invalid.");
            return Err(FwuError::Aborted);
        }
        (None, Some(backup)) => {
            log::warn!(target: "fwu_metadata", "Restoring active metadata from backup.");
            gpt.write_partition(backup.as_bytes(), 0, active_stats.start_lba).inspect_err(|e| {
                log::error!(target: "fwu_metadata", "Fail to overwrite metadata from Backup to Active: {:?}", e);
            })?;
            backup
        }
        (Some(active), None) => {
            log::warn!(target: "fwu_metadata", "Restoring backup metadata from active.");
            gpt.write_partition(active.as_bytes(), 0, backup_stats.start_lba).inspect_err(|e| {
                log::error!(target: "fwu_metadata", "Fail to overwrite metadata from Active to Backup: {:?}", e);
            })?;
            active
        }
        (Some(active), Some(_)) => active,
    };

    log::debug!(
        target: "fwu_metadata",
        "Metadata V2 loaded: {} banks, {} images, active lba {:#x}, backup lba {:#x}.",
        metadata.num_banks(),
        metadata.num_images(),
        active_stats.start_lba,
        backup_stats.start_lba
    );
    Ok(LoadedV2 { metadata, active_lba: active_stats.start_lba, backup_lba: backup_stats.start_lba })
}

/// Generates V2 metadata blobs for provisioning and tests.
///
/// The generated metadata has active index 0 and previous active index 1, every image accepted in every bank with
/// its image GUID equal to its type GUID, and every configured bank accepted.
#[derive(Debug, Clone)]
pub struct MetadataV2Builder {
    num_banks: u8,
    active_index: u32,
    previous_active_index: u32,
    images: Vec<(efi::Guid, efi::Guid)>,
}

impl MetadataV2Builder {
    pub fn new(num_banks: u8) -> Self {
        let previous_active_index = if num_banks > 1 { 1 } else { 0 };
        Self { num_banks, active_index: 0, previous_active_index, images: Vec::new() }
    }

    /// Adds an image of type `image_type` stored at `location`.
    pub fn image(mut self, image_type: efi::Guid, location: efi::Guid) -> Self {
        self.images.push((image_type, location));
        self
    }

    pub fn with_indices(mut self, active_index: u32, previous_active_index: u32) -> Self {
        self.active_index = active_index;
        self.previous_active_index = previous_active_index;
        self
    }

    /// Lays out the blob and seals it with its CRC32.
    pub fn build(&self) -> Result<Vec<u8>> {
        let num_banks = self.num_banks as usize;
        if num_banks == 0 || num_banks > V2_MAX_BANKS {
            log::error!(target: "fwu_metadata", "Cannot generate metadata for {} banks.", num_banks);
            return Err(FwuError::InvalidParameter);
        }
        let num_images = u16::try_from(self.images.len()).map_err(|_| FwuError::InvalidParameter)?;
        let entry_size = image_entry_size(num_banks);
        let desc_offset = DEFAULT_DESCRIPTOR_OFFSET as usize;
        let size = desc_offset + size_of::<FwStoreDescV2>() + self.images.len() * entry_size;

        let mut bank_state = [BANK_STATE_INVALID; V2_MAX_BANKS];
        bank_state[..num_banks].fill(BANK_STATE_ACCEPTED);
        let header = MetadataV2Header {
            crc32: 0,
            version: METADATA_V2_VERSION,
            active_index: self.active_index,
            previous_active_index: self.previous_active_index,
            metadata_size: u32::try_from(size).map_err(|_| FwuError::InvalidParameter)?,
            descriptor_offset: DEFAULT_DESCRIPTOR_OFFSET,
            reserved0: 0,
            bank_state,
            reserved1: 0,
        };
        let desc = FwStoreDescV2 {
            num_banks: self.num_banks,
            reserved: 0,
            num_images,
            img_entry_size: u16::try_from(entry_size).map_err(|_| FwuError::InvalidParameter)?,
            bank_info_entry_size: size_of::<ImageBankInfoV2>() as u16,
        };

        let mut blob = Vec::with_capacity(size);
        blob.extend_from_slice(header.as_bytes());
        blob.extend_from_slice(desc.as_bytes());
        for (image_type, location) in &self.images {
            let entry =
                ImageEntryHeaderV2 { img_type_guid: *image_type.as_bytes(), location_guid: *location.as_bytes() };
            blob.extend_from_slice(entry.as_bytes());
            for _ in 0..num_banks {
                let info = ImageBankInfoV2 { img_guid: *image_type.as_bytes(), accepted: IMAGE_ACCEPTED, reserved: 0 };
                blob.extend_from_slice(info.as_bytes());
            }
        }

        let crc = metadata_crc32(&blob);
        blob[..size_of::<u32>()].copy_from_slice(&crc.to_ne_bytes());
        Ok(blob)
    }
}
