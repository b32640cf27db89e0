//! PSA firmware update wire protocol definitions.
//!
//! Layouts of the messages exchanged with the non-secure update client through the MM communication buffer, the
//! image directory exposed as a pseudo image, and the well-known GUIDs of the protocol. All multi-byte fields use
//! the host byte order.
//!
//! A message is a [`ParameterHeader`] followed by a command specific request. The handler overwrites the same
//! buffer with the command specific response and stores the command status in the header.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::mem::size_of;

use r_efi::efi;
use zerocopy_derive::*;

// {6823a838-1b06-470e-9774-0cce8bfb53fd}
pub const PSA_FWU_UPDATE_AGENT_GUID: efi::Guid =
    efi::Guid::from_fields(0x6823a838, 0x1b06, 0x470e, 0x97, 0x74, &[0x0c, 0xce, 0x8b, 0xfb, 0x53, 0xfd]);

// {deee58d9-5147-4ad3-a290-77666e2341a5}
pub const PSA_FWU_IMAGE_DIRECTORY_GUID: efi::Guid =
    efi::Guid::from_fields(0xdeee58d9, 0x5147, 0x4ad3, 0xa2, 0x90, &[0x77, 0x66, 0x6e, 0x23, 0x41, 0xa5]);

// {8a7a84a0-8387-40f6-ab41-a8b9a5a60d23}
pub const PSA_FWU_METADATA_GUID: efi::Guid =
    efi::Guid::from_fields(0x8a7a84a0, 0x8387, 0x40f6, 0xab, 0x41, &[0xa8, 0xb9, 0xa5, 0xa6, 0x0d, 0x23]);

pub const PSA_FWU_ABI_MAJOR_VERSION: u8 = 1;
pub const PSA_FWU_ABI_MINOR_VERSION: u8 = 0;

/// Size of the MM communicate header (GUID + message length) preceding the message in the shared buffer.
pub const MM_COMMUNICATE_HEADER_SIZE: usize = 24;

/// Image directory format version.
pub const IMAGE_DIRECTORY_VERSION: u32 = 2;

// Client permission bits of an image directory entry.
pub const FWU_WRITE_PERMISSION: u32 = 1 << 0;
pub const FWU_READ_PERMISSION: u32 = 1 << 1;
pub const FWU_ACCEPT_AFTER_ACTIVATION: u32 = 1 << 2;

pub const FWU_IMAGE_ACCEPTED: u32 = 1;
pub const FWU_IMAGE_UNACCEPTED: u32 = 0;

// Service status reported by discover.
pub const SERVICE_STATUS_OPERATIVE: i16 = 0;
pub const SERVICE_STATUS_ERR_INIT: i16 = -1;

/// PSA firmware update command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FwuCommand {
    Discover = 0,
    BeginStaging = 16,
    EndStaging = 17,
    CancelStaging = 18,
    Open = 19,
    WriteStream = 20,
    ReadStream = 21,
    Commit = 22,
    AcceptImage = 23,
    SelectPrevious = 24,
}

/// One past the largest command identifier.
pub const FWU_COMMAND_MAX_ID: u32 = 25;

impl FwuCommand {
    /// Every implemented command, in identifier order.
    pub const ALL: [FwuCommand; 10] = [
        FwuCommand::Discover,
        FwuCommand::BeginStaging,
        FwuCommand::EndStaging,
        FwuCommand::CancelStaging,
        FwuCommand::Open,
        FwuCommand::WriteStream,
        FwuCommand::ReadStream,
        FwuCommand::Commit,
        FwuCommand::AcceptImage,
        FwuCommand::SelectPrevious,
    ];

    /// Size of the command's request body.
    pub const fn request_size(self) -> usize {
        match self {
            FwuCommand::BeginStaging => size_of::<BeginStagingReq>(),
            FwuCommand::Open => size_of::<OpenReq>(),
            FwuCommand::WriteStream => size_of::<WriteStreamReq>(),
            FwuCommand::ReadStream => size_of::<ReadStreamReq>(),
            FwuCommand::Commit => size_of::<CommitReq>(),
            FwuCommand::AcceptImage => size_of::<AcceptImageReq>(),
            _ => 0,
        }
    }

    /// Size of the command's fixed response body. Discover is followed by `num_func` function identifiers.
    pub const fn response_size(self, num_func: usize) -> usize {
        match self {
            FwuCommand::Discover => size_of::<DiscoverResp>() + num_func * size_of::<u16>(),
            FwuCommand::Open => size_of::<OpenResp>(),
            FwuCommand::ReadStream => size_of::<ReadStreamResp>(),
            FwuCommand::Commit => size_of::<CommitResp>(),
            _ => 0,
        }
    }

    /// Smallest message able to carry the command's request and response.
    pub const fn required_size(self, num_func: usize) -> usize {
        let req = self.request_size();
        let resp = self.response_size(num_func);
        (if req > resp { req } else { resp }) + size_of::<ParameterHeader>()
    }
}

impl TryFrom<u32> for FwuCommand {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        FwuCommand::ALL.into_iter().find(|c| *c as u32 == value).ok_or(value)
    }
}

/// PSA firmware update command status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FwuStatus {
    Success = 0,
    Unknown = -1,
    Busy = -2,
    OutOfBounds = -3,
    AuthFail = -4,
    NoPermission = -5,
    Denied = -6,
    Resume = -7,
    NotAvailable = -8,
}

/// Operation an image is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FwuOpType {
    Read = 0,
    Write = 1,
}

impl TryFrom<u8> for FwuOpType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FwuOpType::Read),
            1 => Ok(FwuOpType::Write),
            other => Err(other),
        }
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ParameterHeader {
    pub command: u32,
    pub response_status: i32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DiscoverResp {
    pub service_status: i16,
    pub version_major: u8,
    pub version_minor: u8,
    pub off_function_presence: u16,
    pub num_func: u16,
    pub max_payload_size: u64,
    pub flags: u32,
    pub vendor_specific_flags: u32,
}

/// Followed by `partial_update_count` image type GUIDs.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BeginStagingReq {
    pub reserved: u32,
    pub vendor_flags: u32,
    pub partial_update_count: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OpenReq {
    pub image_type_guid: [u8; 16],
    pub op_type: u8,
    pub reserved: [u8; 3],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OpenResp {
    pub handle: u32,
}

/// Followed by `data_len` payload bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WriteStreamReq {
    pub handle: u32,
    pub data_len: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ReadStreamReq {
    pub handle: u32,
}

/// Followed by `read_bytes` payload bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ReadStreamResp {
    pub read_bytes: u32,
    pub total_bytes: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CommitReq {
    pub handle: u32,
    pub acceptance_req: u32,
    pub max_atomic_len: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CommitResp {
    pub progress: u32,
    pub total_work: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcceptImageReq {
    pub reserved: u32,
    pub image_type_guid: [u8; 16],
}

/// Image directory header, followed by `num_images` [`ImgInfoEntry`] records.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ImageDirectoryHeader {
    pub directory_version: u32,
    pub img_info_offset: u32,
    pub num_images: u32,
    pub correct_boot: u32,
    pub img_info_size: u32,
    pub reserved: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ImgInfoEntry {
    pub img_type_guid: [u8; 16],
    pub client_permissions: u32,
    pub img_max_size: u32,
    pub lowest_accepted_version: u32,
    pub img_version: u32,
    pub accepted: u32,
    pub reserved: u32,
}

const _: () = assert!(size_of::<ParameterHeader>() == 8);
const _: () = assert!(size_of::<DiscoverResp>() == 24);
const _: () = assert!(size_of::<BeginStagingReq>() == 12);
const _: () = assert!(size_of::<OpenReq>() == 20);
const _: () = assert!(size_of::<CommitReq>() == 12);
const _: () = assert!(size_of::<AcceptImageReq>() == 20);
const _: () = assert!(size_of::<ImageDirectoryHeader>() == 24);
const _: () = assert!(size_of::<ImgInfoEntry>() == 40);
