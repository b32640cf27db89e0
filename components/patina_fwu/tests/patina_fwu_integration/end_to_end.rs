//! Update flows driven through the MM handler, across simulated reboots.
//!
//! A reboot is modelled by dropping the service and creating a new one on the same disk. Without an explicit boot
//! index the platform boots from the bank the metadata marks active.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use patina_fwu::{
    block_io::RamDisk,
    config::FWU_FLAG_PARTIAL_UPDATE,
    metadata::BankState,
    psa::{FwuCommand, FwuOpType, FwuStatus},
    FirmwareStore, FwStoreState, FwuConfig, FwuService,
};

use super::common::*;

fn config() -> FwuConfig {
    FwuConfig::new(SYS_FW).with_flags(FWU_FLAG_PARTIAL_UPDATE, 0)
}

/// Stages `image` as the system firmware and activates it, leaving the disk ready to boot into bank 1.
fn stage_system_firmware(disk: &mut RamDisk, image: &[u8]) {
    let mut service = FwuService::new(disk, config()).unwrap();
    assert_eq!(service.state(), FwStoreState::Regular);

    assert_eq!(begin_staging(&mut service, &[SYS_FW]), FwuStatus::Success);
    let handle = open(&mut service, SYS_FW, FwuOpType::Write).unwrap();
    write_image(&mut service, handle, image);
    assert_eq!(commit(&mut service, handle, 1), FwuStatus::Success);
    assert_eq!(command(&mut service, FwuCommand::EndStaging), FwuStatus::Success);

    assert_eq!(service.state(), FwStoreState::Trial);
    let device = service.store();
    assert_eq!(device.active_index(), 1);
    assert_eq!(device.metadata().active_index(), 1);
    assert_eq!(device.metadata().previous_active_index(), 0);
    assert_eq!(device.metadata().bank_state(1), Ok(BankState::Valid));
    assert!(!device.check_correct_boot());
}

#[test]
fn test_update_boots_into_staged_image() {
    let mut disk = provisioned_disk(4096, &metadata_blob());
    let image = pattern(0x1800);
    stage_system_firmware(&mut disk, &image);

    let mut service = FwuService::new(&mut disk, config()).unwrap();
    assert_eq!(service.store().boot_index(), 1);
    assert_eq!(service.state(), FwStoreState::Trial);

    let handle = open(&mut service, SYS_FW, FwuOpType::Read).unwrap();
    assert_eq!(read_image(&mut service, handle, image.len()), image);
    assert_eq!(commit(&mut service, handle, 1), FwuStatus::Success);

    // The auxiliary image wasn't part of the update and still holds the provisioned contents.
    let handle = open(&mut service, AUX_FW, FwuOpType::Read).unwrap();
    assert!(read_image(&mut service, handle, 0x100).iter().all(|&b| b == BANK_FILL[1]));
    assert_eq!(commit(&mut service, handle, 1), FwuStatus::Success);

    assert_eq!(accept_image(&mut service, SYS_FW), FwuStatus::Success);
    assert_eq!(service.state(), FwStoreState::Regular);
    assert_eq!(service.store().metadata().bank_state(1), Ok(BankState::Accepted));
}

#[test]
fn test_trial_image_rejected_restores_previous_bank() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    stage_system_firmware(&mut disk, &pattern(0x300));

    let mut service = FwuService::new(&mut disk, config()).unwrap();
    assert_eq!(service.state(), FwStoreState::Trial);
    assert_eq!(command(&mut service, FwuCommand::SelectPrevious), FwuStatus::Success);
    assert_eq!(service.state(), FwStoreState::Regular);
    assert_eq!(service.store().metadata().bank_state(1), Ok(BankState::Accepted));

    let handle = open(&mut service, SYS_FW, FwuOpType::Read).unwrap();
    assert!(read_image(&mut service, handle, 0x300).iter().all(|&b| b == BANK_FILL[0]));
}

#[test]
fn test_full_update_of_every_image() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    let (system, aux) = (pattern(0x1234), vec![0x5Au8; 0x777]);
    {
        let mut service = FwuService::new(&mut disk, FwuConfig::new(SYS_FW)).unwrap();
        assert_eq!(begin_staging(&mut service, &[]), FwuStatus::Success);
        for (guid, image) in [(SYS_FW, &system), (AUX_FW, &aux)] {
            let handle = open(&mut service, guid, FwuOpType::Write).unwrap();
            write_image(&mut service, handle, image);
            assert_eq!(commit(&mut service, handle, 1), FwuStatus::Success);
        }
        assert_eq!(command(&mut service, FwuCommand::EndStaging), FwuStatus::Success);
        assert_eq!(service.state(), FwStoreState::Trial);
    }

    let mut service = FwuService::new(&mut disk, FwuConfig::new(SYS_FW)).unwrap();
    for (guid, image) in [(SYS_FW, &system), (AUX_FW, &aux)] {
        let handle = open(&mut service, guid, FwuOpType::Read).unwrap();
        assert_eq!(&read_image(&mut service, handle, image.len()), image);
        assert_eq!(commit(&mut service, handle, 1), FwuStatus::Success);
    }

    assert_eq!(accept_image(&mut service, SYS_FW), FwuStatus::Success);
    assert_eq!(service.state(), FwStoreState::Trial);
    assert_eq!(accept_image(&mut service, AUX_FW), FwuStatus::Success);
    assert_eq!(service.state(), FwStoreState::Regular);
}

#[test]
fn test_staging_is_mutually_exclusive() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    let mut service = FwuService::new(&mut disk, config()).unwrap();

    assert_eq!(begin_staging(&mut service, &[SYS_FW]), FwuStatus::Success);
    assert_eq!(begin_staging(&mut service, &[SYS_FW]), FwuStatus::Denied);
    assert_eq!(begin_staging(&mut service, &[]), FwuStatus::Denied);
    assert_eq!(service.state(), FwStoreState::Staging);

    assert_eq!(command(&mut service, FwuCommand::CancelStaging), FwuStatus::Success);
    assert_eq!(service.state(), FwStoreState::Regular);
    assert_eq!(begin_staging(&mut service, &[]), FwuStatus::Success);
}

#[test]
fn test_one_open_handle_per_image() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    let mut service = FwuService::new(&mut disk, config()).unwrap();

    // A reader outside staging blocks staging of that image.
    let reader = open(&mut service, SYS_FW, FwuOpType::Read).unwrap();
    assert_eq!(begin_staging(&mut service, &[SYS_FW]), FwuStatus::Busy);
    assert_eq!(service.state(), FwStoreState::Regular);
    assert_eq!(commit(&mut service, reader, 1), FwuStatus::Success);

    assert_eq!(begin_staging(&mut service, &[SYS_FW]), FwuStatus::Success);
    let writer = open(&mut service, SYS_FW, FwuOpType::Write).unwrap();
    assert_eq!(open(&mut service, SYS_FW, FwuOpType::Write), Err(FwuStatus::Denied));
    assert_eq!(open(&mut service, SYS_FW, FwuOpType::Read), Err(FwuStatus::Denied));
    // The auxiliary image isn't staged.
    assert_eq!(open(&mut service, AUX_FW, FwuOpType::Write), Err(FwuStatus::Denied));

    assert_eq!(write_stream(&mut service, writer, &[1, 2, 3]), FwuStatus::Success);
    assert_eq!(commit(&mut service, writer, 1), FwuStatus::Success);
    assert!(open(&mut service, SYS_FW, FwuOpType::Write).is_ok());
}

#[test]
fn test_cancelled_update_keeps_running_firmware() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    {
        let mut service = FwuService::new(&mut disk, config()).unwrap();
        assert_eq!(begin_staging(&mut service, &[SYS_FW]), FwuStatus::Success);
        let handle = open(&mut service, SYS_FW, FwuOpType::Write).unwrap();
        write_image(&mut service, handle, &pattern(0x800));
        assert_eq!(command(&mut service, FwuCommand::CancelStaging), FwuStatus::Success);
        assert_eq!(service.state(), FwStoreState::Regular);
        assert_eq!(service.store().open_file_count(), 0);
    }
    assert!(partition_bytes(&mut disk, "FIP_B", BANK_SIZE as usize).iter().all(|&b| b == BANK_FILL[0]));

    // The update bank was restored from the active bank, so a new device sees two accepted banks.
    let mut service = FwuService::new(&mut disk, config()).unwrap();
    assert_eq!(service.store().active_index(), 0);
    assert_eq!(service.store().metadata().bank_state(1), Ok(BankState::Accepted));
    assert_eq!(service.state(), FwStoreState::Regular);
    let handle = open(&mut service, SYS_FW, FwuOpType::Read).unwrap();
    assert!(read_image(&mut service, handle, 0x800).iter().all(|&b| b == BANK_FILL[0]));
}

#[test]
fn test_image_directory_reflects_trial() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    stage_system_firmware(&mut disk, &pattern(0x100));

    let mut service = FwuService::new(&mut disk, config()).unwrap();
    let directory = service.store().image_directory().clone();
    assert!(directory.correct_boot());
    assert_eq!(directory.entry(&SYS_FW).map(|e| e.accepted), Some(false));
    assert_eq!(directory.entry(&AUX_FW).map(|e| e.accepted), Some(true));

    let handle = open(&mut service, patina_fwu::psa::PSA_FWU_IMAGE_DIRECTORY_GUID, FwuOpType::Read).unwrap();
    let (status, bytes, total) = read_stream(&mut service, handle);
    assert_eq!(status, FwuStatus::Success);
    assert_eq!(total as usize, directory.byte_size());
    assert_eq!(bytes, directory.to_bytes());
}

#[test]
fn test_images_stay_within_their_slots() {
    let mut disk = provisioned_disk(512, &metadata_blob());
    let max_size = BANK_SIZE as usize / 2;
    {
        let mut service = FwuService::new(&mut disk, FwuConfig::new(SYS_FW)).unwrap();
        let advertised = service.store().image_directory().entry(&SYS_FW).map(|e| e.max_size as usize);
        assert_eq!(advertised, Some(max_size));

        assert_eq!(begin_staging(&mut service, &[]), FwuStatus::Success);
        let handle = open(&mut service, SYS_FW, FwuOpType::Write).unwrap();
        write_image(&mut service, handle, &vec![0x11; max_size]);
        assert_eq!(write_stream(&mut service, handle, &[0x11; 0x100]), FwuStatus::OutOfBounds);
        assert_eq!(commit(&mut service, handle, 1), FwuStatus::Success);

        let handle = open(&mut service, AUX_FW, FwuOpType::Write).unwrap();
        write_image(&mut service, handle, &[0x16; 0x10]);
        assert_eq!(commit(&mut service, handle, 1), FwuStatus::Success);
        assert_eq!(command(&mut service, FwuCommand::EndStaging), FwuStatus::Success);
    }

    let mut service = FwuService::new(&mut disk, FwuConfig::new(SYS_FW)).unwrap();
    let handle = open(&mut service, SYS_FW, FwuOpType::Read).unwrap();
    assert!(read_image(&mut service, handle, max_size).iter().all(|&b| b == 0x11));
    assert_eq!(commit(&mut service, handle, 1), FwuStatus::Success);
    let handle = open(&mut service, AUX_FW, FwuOpType::Read).unwrap();
    assert_eq!(read_image(&mut service, handle, 0x10), vec![0x16; 0x10]);
}
