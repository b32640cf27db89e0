//! Error type for the firmware update store.
//!
//! Every layer of the store (GPT accessor, metadata store, firmware store device) reports failures as
//! [`FwuError`], which maps one-to-one onto the EFI status codes those layers produce. The MM service
//! handler is the only place these errors are translated into PSA firmware update wire status codes.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt::Display;

use r_efi::efi;

/// A specialized [`Result`](core::result::Result) type for firmware update operations.
pub type Result<T> = core::result::Result<T, FwuError>;

/// Firmware update store error, modelled on the EFI status codes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FwuError {
    /// The parameter was incorrect.
    InvalidParameter,
    /// The operation is not supported, e.g. an unknown metadata format version.
    Unsupported,
    /// The buffer was not large enough to hold the requested data.
    BufferTooSmall,
    /// The object is busy, e.g. image files are still open.
    NotReady,
    /// The physical device reported an error, or the metadata failed its integrity check.
    DeviceError,
    /// The resource has run out.
    OutOfResources,
    /// The item was not found.
    NotFound,
    /// A timeout time expired.
    Timeout,
    /// The operation was aborted. The store is unusable when this is returned from initialization.
    Aborted,
    /// The function was not performed due to a security violation.
    SecurityViolation,
    /// A CRC error was detected.
    CrcError,
    /// An EFI status code without a dedicated variant.
    Unknown(efi::Status),
}

impl FwuError {
    /// Converts an `r_efi::efi::Status` to a `Result`.
    ///
    /// If the status is `SUCCESS`, it returns `Ok(())`.
    /// Otherwise, it returns an `Err` with the corresponding `FwuError`.
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        match status {
            efi::Status::SUCCESS => Ok(()),
            efi::Status::INVALID_PARAMETER => Err(FwuError::InvalidParameter),
            efi::Status::UNSUPPORTED => Err(FwuError::Unsupported),
            efi::Status::BUFFER_TOO_SMALL => Err(FwuError::BufferTooSmall),
            efi::Status::NOT_READY => Err(FwuError::NotReady),
            efi::Status::DEVICE_ERROR => Err(FwuError::DeviceError),
            efi::Status::OUT_OF_RESOURCES => Err(FwuError::OutOfResources),
            efi::Status::NOT_FOUND => Err(FwuError::NotFound),
            efi::Status::TIMEOUT => Err(FwuError::Timeout),
            efi::Status::ABORTED => Err(FwuError::Aborted),
            efi::Status::SECURITY_VIOLATION => Err(FwuError::SecurityViolation),
            efi::Status::CRC_ERROR => Err(FwuError::CrcError),
            _ => Err(FwuError::Unknown(status)),
        }
    }
}

impl From<FwuError> for efi::Status {
    fn from(e: FwuError) -> efi::Status {
        match e {
            FwuError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            FwuError::Unsupported => efi::Status::UNSUPPORTED,
            FwuError::BufferTooSmall => efi::Status::BUFFER_TOO_SMALL,
            FwuError::NotReady => efi::Status::NOT_READY,
            FwuError::DeviceError => efi::Status::DEVICE_ERROR,
            FwuError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            FwuError::NotFound => efi::Status::NOT_FOUND,
            FwuError::Timeout => efi::Status::TIMEOUT,
            FwuError::Aborted => efi::Status::ABORTED,
            FwuError::SecurityViolation => efi::Status::SECURITY_VIOLATION,
            FwuError::CrcError => efi::Status::CRC_ERROR,
            FwuError::Unknown(status) => status,
        }
    }
}

impl From<efi::Status> for FwuError {
    fn from(status: efi::Status) -> FwuError {
        match FwuError::status_to_result(status) {
            Ok(()) => FwuError::Unknown(status),
            Err(e) => e,
        }
    }
}

impl Display for FwuError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FwuError::InvalidParameter => write!(f, "invalid parameter"),
            FwuError::Unsupported => write!(f, "unsupported"),
            FwuError::BufferTooSmall => write!(f, "buffer too small"),
            FwuError::NotReady => write!(f, "not ready"),
            FwuError::DeviceError => write!(f, "device error"),
            FwuError::OutOfResources => write!(f, "out of resources"),
            FwuError::NotFound => write!(f, "not found"),
            FwuError::Timeout => write!(f, "timeout"),
            FwuError::Aborted => write!(f, "aborted"),
            FwuError::SecurityViolation => write!(f, "security violation"),
            FwuError::CrcError => write!(f, "crc error"),
            FwuError::Unknown(status) => write!(f, "unknown status {:#x}", status.as_usize()),
        }
    }
}

impl core::error::Error for FwuError {}
