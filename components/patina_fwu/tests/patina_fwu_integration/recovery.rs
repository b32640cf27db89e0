//! Metadata redundancy and persistence.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use patina_fwu::{
    block_io::RamDisk,
    error::FwuError,
    gpt::{GptDisk, GPT_PARTITION_LBA_SIZE},
    metadata::{v2::MetadataV2, AcceptRequest, BankState, FwsMetadata, MetadataFormat, MAX_SAVE_RETRIES},
    psa::FwuOpType,
    FirmwareStore, FwsDevice, FwuConfig, FwuService,
};

use super::common::*;

fn config() -> FwuConfig {
    FwuConfig::new(SYS_FW)
}

fn load(disk: &mut RamDisk) -> Result<FwsMetadata, FwuError> {
    let mut gpt = GptDisk::open(disk)?;
    FwsMetadata::init(&mut gpt, &config())
}

/// Reads a metadata copy out of the disk owned by a device.
fn copy_at(disk: &RamDisk, lba: u64, len: usize) -> Vec<u8> {
    let at = (lba * GPT_PARTITION_LBA_SIZE) as usize;
    disk.as_bytes()[at..at + len].to_vec()
}

/// Opens the system firmware for writing and writes a few bytes, persisting the invalidated update bank.
fn first_write<B: patina_fwu::block_io::BlockIo>(device: &mut FwsDevice<B>) -> Result<(), FwuError> {
    let mut file = device.open(&SYS_FW, FwuOpType::Write)?;
    let result = device.write(&mut file, 0x40, &[0xEE; 0x40]);
    device.release(&mut file, 0)?;
    result
}

#[test]
fn test_saved_metadata_reloads_identically() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    let saved = {
        let mut device = FwsDevice::open_device(&mut disk, config()).unwrap();
        first_write(&mut device).unwrap();
        device.metadata().as_bytes().to_vec()
    };
    assert_ne!(saved, metadata_blob());

    assert_eq!(partition_bytes(&mut disk, ACTIVE_METADATA, saved.len()), saved);
    assert_eq!(partition_bytes(&mut disk, BACKUP_METADATA, saved.len()), saved);

    let reloaded = load(&mut disk).unwrap();
    assert!(reloaded.crc_check().is_ok());
    assert_eq!(reloaded.as_bytes(), saved.as_slice());
    assert_eq!(reloaded.accept_state(&SYS_FW, 1), Ok(false));
    assert_eq!(reloaded.accept_state(&AUX_FW, 1), Ok(true));
}

#[test]
fn test_single_corrupt_copy_is_repaired() {
    let blob = metadata_blob();
    for (corrupted, block_size) in [(ACTIVE_METADATA, 512), (BACKUP_METADATA, 4096)] {
        let mut disk = provisioned_disk(block_size, &blob);
        corrupt(&mut disk, corrupted, 8);
        assert_ne!(partition_bytes(&mut disk, corrupted, blob.len()), blob);

        let metadata = load(&mut disk).unwrap();
        assert_eq!(metadata.as_bytes(), blob.as_slice());
        assert_eq!(partition_bytes(&mut disk, ACTIVE_METADATA, blob.len()), blob, "{corrupted} corrupted");
        assert_eq!(partition_bytes(&mut disk, BACKUP_METADATA, blob.len()), blob, "{corrupted} corrupted");
    }
}

#[test]
fn test_both_copies_corrupt_is_fatal() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    corrupt(&mut disk, ACTIVE_METADATA, 0);
    corrupt(&mut disk, BACKUP_METADATA, 0x10);
    let writes = disk.write_count();

    assert!(matches!(FwsDevice::open_device(&mut disk, config()), Err(FwuError::Aborted)));
    assert!(matches!(FwuService::new(&mut disk, config()), Err(FwuError::Aborted)));
    assert_eq!(disk.write_count(), writes);
}

#[test]
fn test_corrupt_header_field_is_repaired() {
    let blob = metadata_blob();
    // Version, active index, metadata size and descriptor offset.
    for offset in [4, 8, 16, 20] {
        for damaged in [ACTIVE_METADATA, BACKUP_METADATA] {
            let mut disk = provisioned_disk(512, &blob);
            corrupt(&mut disk, damaged, offset);

            let device = FwsDevice::open_device(&mut disk, config()).unwrap();
            assert_eq!(device.metadata().as_bytes(), blob.as_slice(), "{damaged} byte {offset}");
            drop(device);
            assert_eq!(partition_bytes(&mut disk, ACTIVE_METADATA, blob.len()), blob, "{damaged} byte {offset}");
            assert_eq!(partition_bytes(&mut disk, BACKUP_METADATA, blob.len()), blob, "{damaged} byte {offset}");
        }
    }
}

#[test]
fn test_unknown_metadata_version_is_unsupported() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    for name in [ACTIVE_METADATA, BACKUP_METADATA] {
        let at = (partition(&mut disk, name).start_lba * GPT_PARTITION_LBA_SIZE) as usize + 4;
        disk.as_bytes_mut()[at..at + 4].copy_from_slice(&3u32.to_le_bytes());
    }
    assert!(matches!(load(&mut disk), Err(FwuError::Unsupported)));
}

#[test]
fn test_first_write_invalidates_bank_on_disk() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    {
        let mut device = FwsDevice::open_device(&mut disk, config()).unwrap();
        first_write(&mut device).unwrap();
        assert_eq!(device.metadata().bank_state(1), Ok(BankState::Invalid));
    }

    let device = FwsDevice::open_device(&mut disk, config()).unwrap();
    assert_eq!(device.metadata().bank_state(1), Ok(BankState::Invalid));
    assert_eq!(device.metadata().bank_state(0), Ok(BankState::Accepted));
    assert!(!device.check_trial_state());
    assert!(device.check_correct_boot());
}

#[test]
fn test_rollback_requires_accepted_backup() {
    let mut metadata = MetadataV2::parse(&metadata_blob(), 2).unwrap();
    metadata.set_accept_state(&SYS_FW, 0, AcceptRequest::Unaccept).unwrap();
    metadata.update_bank_state(0).unwrap();
    assert_eq!(metadata.bank_state(0), Ok(BankState::Valid));
    assert_eq!(metadata.rollback(0, 1), Err(FwuError::InvalidParameter));

    metadata.set_accept_state(&SYS_FW, 0, AcceptRequest::Accept).unwrap();
    metadata.update_bank_state(0).unwrap();
    assert_eq!(metadata.rollback(0, 1), Ok(()));
}

#[test]
fn test_metadata_save_retries_transient_failures() {
    let mut disk = FaultyDisk::new(provisioned_disk(512, &metadata_blob()));
    disk.fail_writes_to(ACTIVE_METADATA, MAX_SAVE_RETRIES - 1);
    let faults = disk.faults();

    let mut device = FwsDevice::open_device(disk, config()).unwrap();
    first_write(&mut device).unwrap();
    assert_eq!(faults.borrow().rejected, MAX_SAVE_RETRIES - 1);

    let saved = device.metadata().as_bytes().to_vec();
    let (active, backup) = (device.metadata().active_lba(), device.metadata().backup_lba());
    let ram = device.gpt().block_io().disk();
    assert_eq!(copy_at(ram, active, saved.len()), saved);
    assert_eq!(copy_at(ram, backup, saved.len()), saved);
}

#[test]
fn test_metadata_save_gives_up_on_active_copy() {
    let blob = metadata_blob();
    let mut disk = FaultyDisk::new(provisioned_disk(512, &blob));
    disk.fail_writes_to(ACTIVE_METADATA, MAX_SAVE_RETRIES);
    let faults = disk.faults();

    let mut device = FwsDevice::open_device(disk, config()).unwrap();
    assert_eq!(first_write(&mut device), Err(FwuError::DeviceError));
    assert_eq!(faults.borrow().rejected, MAX_SAVE_RETRIES);

    // The backup is only written once the active copy is safe.
    let (active, backup) = (device.metadata().active_lba(), device.metadata().backup_lba());
    let ram = device.gpt().block_io().disk();
    assert_eq!(copy_at(ram, active, blob.len()), blob);
    assert_eq!(copy_at(ram, backup, blob.len()), blob);
    // Nothing reached the update bank either.
    let bank = partition(&mut ram.clone(), "FIP_B");
    assert!(copy_at(ram, bank.start_lba, 0x100).iter().all(|&b| b == BANK_FILL[1]));
}

#[test]
fn test_metadata_save_reports_backup_failure() {
    let mut disk = FaultyDisk::new(provisioned_disk(512, &metadata_blob()));
    disk.fail_writes_to(BACKUP_METADATA, MAX_SAVE_RETRIES);

    let mut device = FwsDevice::open_device(disk, config()).unwrap();
    assert_eq!(first_write(&mut device), Err(FwuError::DeviceError));

    let saved = device.metadata().as_bytes().to_vec();
    let (active, backup) = (device.metadata().active_lba(), device.metadata().backup_lba());
    let ram = device.gpt().block_io().disk();
    assert_eq!(copy_at(ram, active, saved.len()), saved);
    assert_ne!(copy_at(ram, backup, saved.len()), saved);

    // The next boot sees two valid but diverged copies and runs from the active one.
    let mut ram = ram.clone();
    let reloaded = load(&mut ram).unwrap();
    assert_eq!(reloaded.as_bytes(), saved.as_slice());
}

#[test]
fn test_failed_repair_is_reported() {
    let mut ram = provisioned_disk(512, &metadata_blob());
    corrupt(&mut ram, ACTIVE_METADATA, 8);
    let mut disk = FaultyDisk::new(ram);
    disk.fail_writes_to(ACTIVE_METADATA, 1);

    assert!(matches!(FwsDevice::open_device(disk, config()), Err(FwuError::DeviceError)));
}
