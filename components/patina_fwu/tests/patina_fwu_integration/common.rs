//! Common Test Infrastructure for Patina FWU Integration Tests
//!
//! Disk fixtures, a fault injecting block device and helpers speaking the PSA firmware update wire protocol to an
//! [`MmiHandler`].
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use std::{cell::RefCell, mem::size_of, ops::Range, rc::Rc};

use patina_fwu::{
    block_io::{BlockIo, BlockMedia, RamDisk},
    error::{FwuError, Result},
    gpt::{GptDisk, GptDiskBuilder, PartitionStats, GPT_PARTITION_LBA_SIZE},
    metadata::v2::MetadataV2Builder,
    psa::{
        AcceptImageReq, BeginStagingReq, CommitReq, FwuCommand, FwuOpType, FwuStatus, OpenReq, OpenResp,
        ParameterHeader, ReadStreamReq, ReadStreamResp, WriteStreamReq, PSA_FWU_METADATA_GUID,
    },
    MmiHandler,
};
use r_efi::efi;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const SYS_FW: efi::Guid =
    efi::Guid::from_fields(0x5bc8_1b5e, 0x7d2f, 0x4e1a, 0x8c, 0x33, &[0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
pub const AUX_FW: efi::Guid =
    efi::Guid::from_fields(0x91e4_6a02, 0x33c1, 0x4bd8, 0xa4, 0x17, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);

pub const BANK_SIZE: u64 = 0x4000;
pub const METADATA_PARTITION_SIZE: u64 = 0x1000;
pub const ACTIVE_METADATA: &str = "FWU-Metadata";
pub const BACKUP_METADATA: &str = "Bkup-FWU-Metadata";

/// Fill byte of each bank on a freshly provisioned disk.
pub const BANK_FILL: [u8; 2] = [0xA0, 0xB0];

pub const BUFFER_SIZE: usize = 0x1000;
const HEADER_SIZE: usize = size_of::<ParameterHeader>();

/// Two banks, both holding an accepted system and auxiliary image.
pub fn metadata_blob() -> Vec<u8> {
    MetadataV2Builder::new(2).image(SYS_FW, SYS_FW).image(AUX_FW, AUX_FW).build().unwrap()
}

/// A disk with two filled banks and both metadata copies holding `metadata`.
pub fn provisioned_disk(block_size: u32, metadata: &[u8]) -> RamDisk {
    let ram = GptDiskBuilder::new(block_size)
        .partition("FIP_A", SYS_FW, BANK_SIZE)
        .partition("FIP_B", SYS_FW, BANK_SIZE)
        .partition(ACTIVE_METADATA, PSA_FWU_METADATA_GUID, METADATA_PARTITION_SIZE)
        .partition(BACKUP_METADATA, PSA_FWU_METADATA_GUID, METADATA_PARTITION_SIZE)
        .build()
        .unwrap();
    let mut gpt = GptDisk::open(ram).unwrap();
    for name in [ACTIVE_METADATA, BACKUP_METADATA] {
        let part = gpt.matched_partition_stats(|e| e.has_name(name)).unwrap();
        gpt.write_partition(metadata, 0, part.start_lba).unwrap();
    }
    for (name, fill) in [("FIP_A", BANK_FILL[0]), ("FIP_B", BANK_FILL[1])] {
        let part = gpt.matched_partition_stats(|e| e.has_name(name)).unwrap();
        gpt.write_partition(&vec![fill; BANK_SIZE as usize], 0, part.start_lba).unwrap();
    }
    gpt.release()
}

pub fn partition<B: BlockIo>(disk: B, name: &str) -> PartitionStats {
    GptDisk::open(disk).unwrap().matched_partition_stats(|e| e.has_name(name)).unwrap()
}

/// Reads `len` bytes of the named partition straight from the disk image.
pub fn partition_bytes(disk: &mut RamDisk, name: &str, len: usize) -> Vec<u8> {
    let start = (partition(&mut *disk, name).start_lba * GPT_PARTITION_LBA_SIZE) as usize;
    disk.as_bytes()[start..start + len].to_vec()
}

/// Flips every bit of the byte at `offset` in the named partition.
pub fn corrupt(disk: &mut RamDisk, name: &str, offset: u64) {
    let at = (partition(&mut *disk, name).start_lba * GPT_PARTITION_LBA_SIZE + offset) as usize;
    disk.as_bytes_mut()[at] ^= 0xFF;
}

/// A recognizable image payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

/// Write faults injected into a [`FaultyDisk`].
#[derive(Debug, Default)]
pub struct Faults {
    /// Device blocks whose writes fail.
    pub lbas: Range<u64>,
    /// Number of writes touching `lbas` that fail before the device recovers.
    pub write_failures: usize,
    /// Writes rejected so far.
    pub rejected: usize,
}

/// A [`RamDisk`] whose writes can be made to fail while the store owns it.
pub struct FaultyDisk {
    disk: RamDisk,
    faults: Rc<RefCell<Faults>>,
}

impl FaultyDisk {
    pub fn new(disk: RamDisk) -> Self {
        Self { disk, faults: Rc::new(RefCell::new(Faults::default())) }
    }

    /// Handle for arming faults after the disk has been handed over.
    pub fn faults(&self) -> Rc<RefCell<Faults>> {
        self.faults.clone()
    }

    pub fn disk(&self) -> &RamDisk {
        &self.disk
    }

    /// Arms `count` failures on the device blocks backing the named partition.
    pub fn fail_writes_to(&mut self, name: &str, count: usize) {
        let stats = partition(&mut self.disk, name);
        let block_size = self.disk.media().block_size as u64;
        let start = stats.start_lba * GPT_PARTITION_LBA_SIZE / block_size;
        let end = (stats.start_lba * GPT_PARTITION_LBA_SIZE + stats.size).div_ceil(block_size);
        let mut faults = self.faults.borrow_mut();
        faults.lbas = start..end;
        faults.write_failures = count;
    }
}

impl BlockIo for FaultyDisk {
    fn media(&self) -> BlockMedia {
        self.disk.media()
    }

    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<()> {
        self.disk.read_blocks(lba, buffer)
    }

    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<()> {
        let blocks = (buffer.len() / self.disk.media().block_size as usize) as u64;
        {
            let mut faults = self.faults.borrow_mut();
            let hits = lba < faults.lbas.end && lba + blocks > faults.lbas.start;
            if hits && faults.write_failures > 0 {
                faults.write_failures -= 1;
                faults.rejected += 1;
                return Err(FwuError::DeviceError);
            }
        }
        self.disk.write_blocks(lba, buffer)
    }
}

pub fn message<T: IntoBytes + Immutable>(command: FwuCommand, req: &T, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let header = ParameterHeader { command: command as u32, response_status: 0 };
    header.write_to_prefix(&mut buffer).unwrap();
    req.write_to_prefix(&mut buffer[HEADER_SIZE..]).unwrap();
    let start = HEADER_SIZE + size_of::<T>();
    buffer[start..start + payload.len()].copy_from_slice(payload);
    buffer
}

pub fn status(buffer: &[u8]) -> FwuStatus {
    let (header, _) = ParameterHeader::read_from_prefix(buffer).unwrap();
    match header.response_status {
        0 => FwuStatus::Success,
        -1 => FwuStatus::Unknown,
        -2 => FwuStatus::Busy,
        -3 => FwuStatus::OutOfBounds,
        -4 => FwuStatus::AuthFail,
        -5 => FwuStatus::NoPermission,
        -6 => FwuStatus::Denied,
        -7 => FwuStatus::Resume,
        -8 => FwuStatus::NotAvailable,
        other => panic!("unexpected status {other}"),
    }
}

pub fn response<T: FromBytes>(buffer: &[u8]) -> T {
    T::read_from_prefix(&buffer[HEADER_SIZE..]).unwrap().0
}

/// Sends one request through the handler and returns the status with the whole buffer.
pub fn call<H: MmiHandler + ?Sized, T: IntoBytes + Immutable>(
    handler: &mut H,
    command: FwuCommand,
    req: &T,
    payload: &[u8],
) -> (FwuStatus, Vec<u8>) {
    let mut buffer = message(command, req, payload);
    handler.handle(&mut buffer).unwrap();
    (status(&buffer), buffer)
}

/// Sends a command without a request body.
pub fn command<H: MmiHandler + ?Sized>(handler: &mut H, command: FwuCommand) -> FwuStatus {
    call(handler, command, &[0u8; 0], &[]).0
}

pub fn begin_staging<H: MmiHandler + ?Sized>(handler: &mut H, guids: &[efi::Guid]) -> FwuStatus {
    let payload: Vec<u8> = guids.iter().flat_map(|g| *g.as_bytes()).collect();
    let req = BeginStagingReq { reserved: 0, vendor_flags: 0, partial_update_count: guids.len() as u32 };
    call(handler, FwuCommand::BeginStaging, &req, &payload).0
}

/// Opens an image and returns its handle.
pub fn open<H: MmiHandler + ?Sized>(
    handler: &mut H,
    guid: efi::Guid,
    op_type: FwuOpType,
) -> core::result::Result<u32, FwuStatus> {
    let req = OpenReq { image_type_guid: *guid.as_bytes(), op_type: op_type as u8, reserved: [0; 3] };
    match call(handler, FwuCommand::Open, &req, &[]) {
        (FwuStatus::Success, buffer) => Ok(response::<OpenResp>(&buffer).handle),
        (status, _) => Err(status),
    }
}

pub fn write_stream<H: MmiHandler + ?Sized>(handler: &mut H, handle: u32, data: &[u8]) -> FwuStatus {
    let req = WriteStreamReq { handle, data_len: data.len() as u32 };
    call(handler, FwuCommand::WriteStream, &req, data).0
}

/// Streams `image` in chunks that fit the communication buffer.
pub fn write_image<H: MmiHandler + ?Sized>(handler: &mut H, handle: u32, image: &[u8]) {
    let chunk = BUFFER_SIZE - HEADER_SIZE - size_of::<WriteStreamReq>();
    for data in image.chunks(chunk) {
        assert_eq!(write_stream(handler, handle, data), FwuStatus::Success);
    }
}

/// Reads the next chunk and returns it with the total size of the open file.
pub fn read_stream<H: MmiHandler + ?Sized>(handler: &mut H, handle: u32) -> (FwuStatus, Vec<u8>, u32) {
    let (status, buffer) = call(handler, FwuCommand::ReadStream, &ReadStreamReq { handle }, &[]);
    let resp = response::<ReadStreamResp>(&buffer);
    let (read, total) = (resp.read_bytes as usize, resp.total_bytes);
    let start = HEADER_SIZE + size_of::<ReadStreamResp>();
    let data = if status == FwuStatus::Success { buffer[start..start + read].to_vec() } else { Vec::new() };
    (status, data, total)
}

/// Reads the first `len` bytes of an open file.
pub fn read_image<H: MmiHandler + ?Sized>(handler: &mut H, handle: u32, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        let (status, data, _) = read_stream(handler, handle);
        assert_eq!(status, FwuStatus::Success);
        assert!(!data.is_empty());
        out.extend_from_slice(&data);
    }
    out.truncate(len);
    out
}

pub fn commit<H: MmiHandler + ?Sized>(handler: &mut H, handle: u32, acceptance_req: u32) -> FwuStatus {
    let req = CommitReq { handle, acceptance_req, max_atomic_len: 0 };
    call(handler, FwuCommand::Commit, &req, &[]).0
}

pub fn accept_image<H: MmiHandler + ?Sized>(handler: &mut H, guid: efi::Guid) -> FwuStatus {
    let req = AcceptImageReq { reserved: 0, image_type_guid: *guid.as_bytes() };
    call(handler, FwuCommand::AcceptImage, &req, &[]).0
}
