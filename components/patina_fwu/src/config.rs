//! Platform configuration for the firmware update store.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use r_efi::efi;

use crate::error::{FwuError, Result};

/// Default communication buffer size shared with the non-secure world.
pub const DEFAULT_COMM_BUFFER_SIZE: usize = 0x10000;
/// The largest bank count the store supports.
pub const MAX_NUMBER_OF_BANKS: u32 = 4;

/// Discover flag advertising partial update support.
pub const FWU_FLAG_PARTIAL_UPDATE: u32 = 0x1;

/// Configuration of a firmware update store instance.
///
/// The values describe the platform: how many banks it has, which GPT partitions back them, which
/// image type represents the system firmware, and the size of the MM communication buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwuConfig {
    /// Number of banks the platform provides. Metadata describing more banks is rejected.
    pub number_of_banks: u32,
    /// GPT partition name of each bank, indexed by bank.
    pub bank_partition_names: Vec<String>,
    /// GPT partition name of the active metadata copy.
    pub metadata_partition_name: String,
    /// GPT partition name of the backup metadata copy.
    pub backup_metadata_partition_name: String,
    /// Image type that must be present in the metadata.
    pub system_firmware_image_type_guid: efi::Guid,
    /// Version reported for every image in the image directory.
    pub firmware_version: u32,
    /// Lowest supported version reported for every image in the image directory.
    pub lowest_supported_version: u32,
    /// Size of the MM communication buffer.
    pub comm_buffer_size: usize,
    /// Flags reported by discover.
    pub fwu_flags: u32,
    /// Vendor flags reported by discover and accepted by begin staging.
    pub vendor_flags: u32,
    /// Bank the platform booted from. `None` means the active bank.
    pub boot_index: Option<u32>,
}

impl FwuConfig {
    /// Creates a configuration with platform defaults for the given system firmware image type.
    pub fn new(system_firmware_image_type_guid: efi::Guid) -> Self {
        Self {
            number_of_banks: 2,
            bank_partition_names: ["FIP_A", "FIP_B"].iter().map(|n| n.to_string()).collect(),
            metadata_partition_name: "FWU-Metadata".to_string(),
            backup_metadata_partition_name: "Bkup-FWU-Metadata".to_string(),
            system_firmware_image_type_guid,
            firmware_version: 0,
            lowest_supported_version: 0,
            comm_buffer_size: DEFAULT_COMM_BUFFER_SIZE,
            fwu_flags: 0,
            vendor_flags: 0,
            boot_index: None,
        }
    }

    /// Sets the bank count and the partition name of every bank.
    pub fn with_banks(mut self, names: &[&str]) -> Self {
        self.number_of_banks = names.len() as u32;
        self.bank_partition_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Sets the names of the active and backup metadata partitions.
    pub fn with_metadata_partitions(mut self, active: &str, backup: &str) -> Self {
        self.metadata_partition_name = active.to_string();
        self.backup_metadata_partition_name = backup.to_string();
        self
    }

    pub fn with_versions(mut self, firmware_version: u32, lowest_supported_version: u32) -> Self {
        self.firmware_version = firmware_version;
        self.lowest_supported_version = lowest_supported_version;
        self
    }

    pub fn with_comm_buffer_size(mut self, size: usize) -> Self {
        self.comm_buffer_size = size;
        self
    }

    pub fn with_flags(mut self, fwu_flags: u32, vendor_flags: u32) -> Self {
        self.fwu_flags = fwu_flags;
        self.vendor_flags = vendor_flags;
        self
    }

    /// Reports the platform as booted from `bank` instead of the active bank.
    pub fn with_boot_index(mut self, bank: u32) -> Self {
        self.boot_index = Some(bank);
        self
    }

    /// Returns true if the platform advertises partial update support.
    pub fn partial_update_supported(&self) -> bool {
        self.fwu_flags & FWU_FLAG_PARTIAL_UPDATE != 0
    }

    /// Checks the configuration for values the store cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.number_of_banks == 0 || self.number_of_banks > MAX_NUMBER_OF_BANKS {
            log::error!(target: "fwu_store", "Unsupported bank count {}.", self.number_of_banks);
            return Err(FwuError::InvalidParameter);
        }
        if self.bank_partition_names.len() < self.number_of_banks as usize {
            log::error!(
                target: "fwu_store",
                "{} bank partition names for {} banks.",
                self.bank_partition_names.len(),
                self.number_of_banks
            );
            return Err(FwuError::InvalidParameter);
        }
        if let Some(boot) = self.boot_index {
            if boot >= self.number_of_banks {
                return Err(FwuError::InvalidParameter);
            }
        }
        if self.comm_buffer_size == 0 {
            return Err(FwuError::InvalidParameter);
        }
        Ok(())
    }
}
