//! Image directory of the firmware store.
//!
//! The directory lists every updatable image type with its permissions, size limit, versions and the accept state
//! of the copy in the boot bank. It is built when the device is opened and served to clients verbatim as a
//! read-only pseudo image.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec::Vec;
use core::mem::size_of;

use r_efi::efi;
use zerocopy::IntoBytes;

use crate::{
    config::FwuConfig,
    error::{FwuError, Result},
    metadata::FwsMetadata,
    psa::{
        ImageDirectoryHeader, ImgInfoEntry, FWU_ACCEPT_AFTER_ACTIVATION, FWU_IMAGE_ACCEPTED, FWU_IMAGE_UNACCEPTED,
        FWU_READ_PERMISSION, FWU_WRITE_PERMISSION, IMAGE_DIRECTORY_VERSION,
    },
};

/// Permissions granted to clients on every image of the store.
pub const DEFAULT_IMAGE_PERMISSIONS: u32 = FWU_WRITE_PERMISSION | FWU_READ_PERMISSION | FWU_ACCEPT_AFTER_ACTIVATION;

/// In-memory image directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDirectory {
    correct_boot: bool,
    entries: Vec<ImageInfo>,
}

/// One image directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub image_type_guid: efi::Guid,
    pub client_permissions: u32,
    pub max_size: u32,
    pub lowest_accepted_version: u32,
    pub version: u32,
    pub accepted: bool,
}

impl ImageDirectory {
    /// Builds the directory from the metadata as seen from `boot_index`.
    ///
    /// `boot_bank_size` is the byte size of the boot bank partition, shared evenly between the images. Fails with
    /// [`FwuError::NotFound`] if the configured system firmware image isn't described by the metadata.
    pub fn build(metadata: &FwsMetadata, boot_index: u32, boot_bank_size: u64, config: &FwuConfig) -> Result<Self> {
        let guids = metadata.image_type_guids();
        let num_images = guids.len().max(1) as u64;
        let max_size = u32::try_from(boot_bank_size / num_images).unwrap_or(u32::MAX);

        let mut entries = Vec::with_capacity(guids.len());
        for guid in guids {
            let accepted = metadata.accept_state(&guid, boot_index).inspect_err(|e| {
                log::error!(target: "fwu_store", "Failed to get accept state for {:?}: {:?}", guid, e);
            })?;
            entries.push(ImageInfo {
                image_type_guid: guid,
                client_permissions: DEFAULT_IMAGE_PERMISSIONS,
                max_size,
                lowest_accepted_version: config.lowest_supported_version,
                version: config.firmware_version,
                accepted,
            });
        }

        if !entries.iter().any(|e| e.image_type_guid == config.system_firmware_image_type_guid) {
            log::error!(target: "fwu_store", "No system firmware information found in metadata!");
            return Err(FwuError::NotFound);
        }

        Ok(Self { correct_boot: boot_index == metadata.active_index(), entries })
    }

    pub fn correct_boot(&self) -> bool {
        self.correct_boot
    }

    pub(crate) fn set_correct_boot(&mut self, correct_boot: bool) {
        self.correct_boot = correct_boot;
    }

    pub fn num_images(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ImageInfo] {
        &self.entries
    }

    pub fn entry(&self, image_type: &efi::Guid) -> Option<&ImageInfo> {
        self.entries.iter().find(|e| &e.image_type_guid == image_type)
    }

    pub(crate) fn set_accepted(&mut self, image_type: &efi::Guid) {
        if let Some(entry) = self.entries.iter_mut().find(|e| &e.image_type_guid == image_type) {
            entry.accepted = true;
        }
    }

    /// Size of the serialized directory.
    pub fn byte_size(&self) -> usize {
        size_of::<ImageDirectoryHeader>() + self.entries.len() * size_of::<ImgInfoEntry>()
    }

    /// Serializes the directory in its wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = ImageDirectoryHeader {
            directory_version: IMAGE_DIRECTORY_VERSION,
            img_info_offset: size_of::<ImageDirectoryHeader>() as u32,
            num_images: self.entries.len() as u32,
            correct_boot: self.correct_boot as u32,
            img_info_size: (self.entries.len() * size_of::<ImgInfoEntry>()) as u32,
            reserved: 0,
        };
        let mut bytes = Vec::with_capacity(self.byte_size());
        bytes.extend_from_slice(header.as_bytes());
        for entry in &self.entries {
            let raw = ImgInfoEntry {
                img_type_guid: *entry.image_type_guid.as_bytes(),
                client_permissions: entry.client_permissions,
                img_max_size: entry.max_size,
                lowest_accepted_version: entry.lowest_accepted_version,
                img_version: entry.version,
                accepted: if entry.accepted { FWU_IMAGE_ACCEPTED } else { FWU_IMAGE_UNACCEPTED },
                reserved: 0,
            };
            bytes.extend_from_slice(raw.as_bytes());
        }
        bytes
    }
}
