//! A/B firmware update store and PSA firmware update MM service.
//!
//! The crate implements the secure side of a PSA firmware update: an update agent running in MM that receives
//! commands from a non-secure client through a shared communication buffer and stages new firmware images into the
//! inactive bank of an A/B firmware store kept on a GPT formatted block device.
//!
//! It is layered bottom up:
//!
//! - [`block_io`]: the block device primitive the store is built on.
//! - [`gpt`]: byte addressed access to GPT partitions, independent of the device block size.
//! - [`metadata`]: the redundant, CRC protected firmware update metadata recording active bank and accept states.
//! - [`store`]: the firmware store device, mapping images to bank partitions.
//! - [`service`]: the PSA firmware update agent and its MM handler entry.
//!
//! [`psa`] holds the wire protocol definitions shared by the service and its clients.
//!
//! ## Examples and Usage
//!
//! ```rust
//! use patina_fwu::{
//!     config::FwuConfig,
//!     gpt::{GptDisk, GptDiskBuilder},
//!     metadata::v2::MetadataV2Builder,
//!     psa::{FwuCommand, PSA_FWU_METADATA_GUID},
//!     service::{FwuService, MmiHandler},
//! };
//! use r_efi::efi;
//!
//! let system_fw =
//!     efi::Guid::from_fields(0x5bc81b5e, 0x7d2f, 0x4e1a, 0x8c, 0x33, &[0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
//!
//! // Lay out the banks and the two metadata copies, then provision the metadata.
//! let disk = GptDiskBuilder::new(512)
//!     .partition("FIP_A", system_fw, 0x4000)
//!     .partition("FIP_B", system_fw, 0x4000)
//!     .partition("FWU-Metadata", PSA_FWU_METADATA_GUID, 0x1000)
//!     .partition("Bkup-FWU-Metadata", PSA_FWU_METADATA_GUID, 0x1000)
//!     .build()?;
//! let metadata = MetadataV2Builder::new(2).image(system_fw, system_fw).build()?;
//! let mut gpt = GptDisk::open(disk)?;
//! for name in ["FWU-Metadata", "Bkup-FWU-Metadata"] {
//!     let partition = gpt.matched_partition_stats(|e| e.has_name(name))?;
//!     gpt.write_partition(&metadata, 0, partition.start_lba)?;
//! }
//!
//! let mut service = FwuService::new(gpt.release(), FwuConfig::new(system_fw))?;
//! let mut message = [0u8; 64];
//! message[..4].copy_from_slice(&(FwuCommand::Discover as u32).to_ne_bytes());
//! service.handle(&mut message)?;
//! assert_eq!(&message[4..8], &0i32.to_ne_bytes());
//! # Ok::<(), patina_fwu::error::FwuError>(())
//! ```
//!
//! ## Logging
//!
//! Each layer logs with its own target: `fwu_gpt`, `fwu_metadata`, `fwu_store` and `fwu_mm`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test), not(feature = "mockall")), no_std)]

pub mod block_io;
pub mod config;
pub mod error;
pub mod gpt;
pub mod metadata;
pub mod psa;
pub mod service;
pub mod store;

pub use config::FwuConfig;
pub use error::{FwuError, Result};
pub use service::{FwStoreState, FwuService, MmiHandler};
pub use store::{FirmwareStore, FwsDevice};

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "mockall"))] {
        pub use block_io::MockBlockIo;
        pub use service::MockMmiHandler;
        pub use store::MockFirmwareStore;
    }
}
