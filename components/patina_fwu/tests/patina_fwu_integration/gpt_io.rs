//! Byte addressed partition I/O on devices whose block size differs from the GPT LBA size.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use patina_fwu::{
    block_io::{BlockIo, RamDisk},
    error::FwuError,
    gpt::{GptDisk, GPT_PARTITION_LBA_SIZE},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::common::*;

const BLOCK_SIZES: [u32; 4] = [512, 520, 2048, 4096];

fn open_disk(block_size: u32) -> GptDisk<RamDisk> {
    GptDisk::open(provisioned_disk(block_size, &metadata_blob())).unwrap()
}

#[test]
fn test_random_unaligned_round_trips() {
    let mut rng = StdRng::seed_from_u64(0x5eed_f00d);
    for block_size in BLOCK_SIZES {
        let mut gpt = open_disk(block_size);
        let bank = gpt.matched_partition_stats(|e| e.has_name("FIP_A")).unwrap();
        let mut shadow = vec![BANK_FILL[0]; BANK_SIZE as usize];

        for _ in 0..64 {
            let len = rng.gen_range(1..=3 * block_size as usize);
            let offset = rng.gen_range(0..BANK_SIZE as usize - len);
            let mut data = vec![0u8; len];
            rng.fill(&mut data[..]);

            gpt.write_partition(&data, offset as u64, bank.start_lba).unwrap();
            shadow[offset..offset + len].copy_from_slice(&data);

            let mut out = vec![0u8; len];
            gpt.read_partition(&mut out, offset as u64, bank.start_lba).unwrap();
            assert_eq!(out, data, "block size {block_size}, offset {offset:#x}, len {len:#x}");
        }

        // Bytes around every write are left alone.
        let mut whole = vec![0u8; BANK_SIZE as usize];
        gpt.read_partition(&mut whole, 0, bank.start_lba).unwrap();
        assert_eq!(whole, shadow, "block size {block_size}");
    }
}

#[test]
fn test_boundary_spans() {
    for block_size in BLOCK_SIZES {
        let bs = block_size as u64;
        let bank = open_disk(block_size).matched_partition_stats(|e| e.has_name("FIP_B")).unwrap();
        let base = bank.start_lba * GPT_PARTITION_LBA_SIZE;
        // First byte past a device block boundary, relative to the partition.
        let boundary = base.div_ceil(bs) * bs - base + bs;

        // Within one block, across one boundary, across several boundaries. Each case starts from a fresh disk so
        // its edges still hold the provisioned fill.
        for (offset, len) in [(boundary + 1, 10), (boundary - 7, 14), (boundary - 3, 2 * bs + 6)] {
            let mut gpt = open_disk(block_size);
            let data = pattern(len as usize);
            gpt.write_partition(&data, offset, bank.start_lba).unwrap();
            let mut out = vec![0u8; data.len()];
            gpt.read_partition(&mut out, offset, bank.start_lba).unwrap();
            assert_eq!(out, data, "block size {block_size}, offset {offset:#x}");

            let mut edges = [0u8; 2];
            gpt.read_partition(&mut edges[..1], offset - 1, bank.start_lba).unwrap();
            gpt.read_partition(&mut edges[1..], offset + len, bank.start_lba).unwrap();
            assert_eq!(edges, [BANK_FILL[1]; 2]);
        }
    }
}

#[test]
fn test_partition_io_leaves_neighbours_intact() {
    let mut gpt = open_disk(4096);
    let a = gpt.matched_partition_stats(|e| e.has_name("FIP_A")).unwrap();
    let b = gpt.matched_partition_stats(|e| e.has_name("FIP_B")).unwrap();

    // The last bytes of FIP_A share a device block with the first bytes of FIP_B.
    gpt.write_partition(&[0x11; 0x30], BANK_SIZE - 0x30, a.start_lba).unwrap();
    let mut head = [0u8; 0x40];
    gpt.read_partition(&mut head, 0, b.start_lba).unwrap();
    assert!(head.iter().all(|&x| x == BANK_FILL[1]));

    let ram = gpt.release();
    let at = ((a.start_lba * GPT_PARTITION_LBA_SIZE) + BANK_SIZE) as usize;
    assert!(ram.as_bytes()[at - 0x30..at].iter().all(|&x| x == 0x11));
}

#[test]
fn test_io_past_device_end_fails() {
    let mut gpt = open_disk(512);
    let last = gpt.block_io().media().last_block;
    let mut buf = [0u8; 16];
    assert_eq!(gpt.read_partition(&mut buf, 0, last + 1), Err(FwuError::DeviceError));
    assert_eq!(gpt.write_partition(&buf, 0, last + 1), Err(FwuError::DeviceError));
    assert_eq!(gpt.read_partition(&mut [], 0, 0), Err(FwuError::InvalidParameter));
}
