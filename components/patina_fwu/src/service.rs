//! PSA firmware update MM service.
//!
//! [`FwuService`] is the update agent behind the MM communication buffer. It decodes a PSA firmware update message,
//! runs the command against a [`FirmwareStore`] and writes the response and the command status back into the same
//! buffer. Transport level failures (short buffer, unknown command) are reported as [`FwuError`] from
//! [`MmiHandler::handle`]; command outcomes are reported to the client as [`FwuStatus`] in the message header.
//!
//! The service tracks the firmware store state:
//!
//! ```text
//!            begin staging            end staging
//!  REGULAR ----------------> STAGING -------------> TRIAL / REGULAR
//!     ^                         |
//!     +-------------------------+ cancel staging
//! ```
//!
//! ## Logging
//!
//! Command dispatch and state transitions are logged with the `fwu_mm` log target.
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
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::{
    block_io::BlockIo,
    config::FwuConfig,
    error::{FwuError, Result},
    psa::{
        AcceptImageReq, BeginStagingReq, CommitReq, CommitResp, DiscoverResp, FwuCommand, FwuOpType, FwuStatus,
        OpenReq, OpenResp, ParameterHeader, ReadStreamReq, ReadStreamResp, WriteStreamReq, FWU_ACCEPT_AFTER_ACTIVATION,
        FWU_COMMAND_MAX_ID, FWU_READ_PERMISSION, FWU_WRITE_PERMISSION, MM_COMMUNICATE_HEADER_SIZE,
        PSA_FWU_ABI_MAJOR_VERSION, PSA_FWU_ABI_MINOR_VERSION, PSA_FWU_UPDATE_AGENT_GUID, SERVICE_STATUS_ERR_INIT,
        SERVICE_STATUS_OPERATIVE,
    },
    store::{FirmwareStore, FwsDevice},
};

pub mod fd_table;

use fd_table::{ClearMode, FdTable, OpenHandle, Selection};

const HEADER_SIZE: usize = size_of::<ParameterHeader>();
const GUID_SIZE: usize = size_of::<efi::Guid>();

/// State of the firmware store as seen by the update client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwStoreState {
    /// Every image of the active bank is accepted.
    Regular,
    /// An update is being staged into the update bank.
    Staging,
    /// The active bank holds unaccepted images.
    Trial,
}

/// A handler of MM communication messages.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait MmiHandler {
    /// GUID the handler is registered under.
    fn handler_guid(&self) -> efi::Guid;

    /// Handles the message in `message` and writes the response back in place.
    fn handle(&mut self, message: &mut [u8]) -> Result<()>;
}

/// The PSA firmware update agent.
pub struct FwuService<S: FirmwareStore> {
    store: S,
    config: FwuConfig,
    fd_table: FdTable,
    state: FwStoreState,
    staging_flags: u32,
    service_status: i16,
}

impl<B: BlockIo> FwuService<FwsDevice<B>> {
    /// Opens the firmware store on `block_io` and starts the service on it.
    pub fn new(block_io: B, config: FwuConfig) -> Result<Self> {
        let device = FwsDevice::open_device(block_io, config.clone()).inspect_err(|e| {
            log::error!(target: "fwu_mm", "Failed to open firmware store device: {:?}", e);
        })?;
        Ok(Self::with_store(device, config))
    }
}

impl<S: FirmwareStore> FwuService<S> {
    /// Starts the service on an already opened store.
    pub fn with_store(store: S, config: FwuConfig) -> Self {
        let fd_table = FdTable::new(store.image_directory());
        let mut service = Self {
            store,
            config,
            fd_table,
            state: FwStoreState::Regular,
            staging_flags: 0,
            service_status: SERVICE_STATUS_ERR_INIT,
        };
        service.state = service.settled_state();
        service.service_status = SERVICE_STATUS_OPERATIVE;
        log::info!(
            target: "fwu_mm",
            "Firmware update agent ready: {} images, state {:?}.",
            service.store.image_directory().num_images(),
            service.state
        );
        service
    }

    pub fn state(&self) -> FwStoreState {
        self.state
    }

    /// Vendor flags the client passed to the running begin staging, 0 outside of staging.
    pub fn staging_flags(&self) -> u32 {
        self.staging_flags
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn fd_table(&self) -> &FdTable {
        &self.fd_table
    }

    /// Stops the service and hands the store back.
    pub fn into_store(self) -> S {
        self.store
    }

    fn settled_state(&self) -> FwStoreState {
        if self.store.check_trial_state() {
            FwStoreState::Trial
        } else {
            FwStoreState::Regular
        }
    }

    fn set_state(&mut self, state: FwStoreState) {
        if self.state != state {
            log::info!(target: "fwu_mm", "Firmware store state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
    }

    fn num_func() -> usize {
        FwuCommand::ALL.len()
    }

    fn dispatch(&mut self, command: FwuCommand, message: &mut [u8]) -> FwuStatus {
        match command {
            FwuCommand::Discover => self.discover(message),
            FwuCommand::BeginStaging => self.begin_staging(message),
            FwuCommand::EndStaging => self.end_staging(),
            FwuCommand::CancelStaging => self.cancel_staging(),
            FwuCommand::Open => self.open(message),
            FwuCommand::WriteStream => self.write_stream(message),
            FwuCommand::ReadStream => self.read_stream(message),
            FwuCommand::Commit => self.commit(message),
            FwuCommand::AcceptImage => self.accept_image(message),
            FwuCommand::SelectPrevious => self.select_previous(),
        }
    }

    fn discover(&mut self, message: &mut [u8]) -> FwuStatus {
        let num_func = Self::num_func();
        let available = self.config.comm_buffer_size.saturating_sub(MM_COMMUNICATE_HEADER_SIZE);
        let max_write = available.saturating_sub(FwuCommand::WriteStream.required_size(num_func));
        let max_read = available.saturating_sub(FwuCommand::ReadStream.required_size(num_func));

        let resp = DiscoverResp {
            service_status: self.service_status,
            version_major: PSA_FWU_ABI_MAJOR_VERSION,
            version_minor: PSA_FWU_ABI_MINOR_VERSION,
            off_function_presence: size_of::<DiscoverResp>() as u16,
            num_func: num_func as u16,
            max_payload_size: max_write.min(max_read) as u64,
            flags: self.config.fwu_flags,
            vendor_specific_flags: self.config.vendor_flags,
        };
        respond(message, &resp);

        let ids: Vec<u8> = FwuCommand::ALL.iter().flat_map(|c| (*c as u16).to_ne_bytes()).collect();
        let start = HEADER_SIZE + size_of::<DiscoverResp>();
        if let Some(out) = message.get_mut(start..start + ids.len()) {
            out.copy_from_slice(&ids);
        }
        FwuStatus::Success
    }

    fn begin_staging(&mut self, message: &mut [u8]) -> FwuStatus {
        if self.state == FwStoreState::Staging {
            log::error!(target: "fwu_mm", "Staging is already in progress.");
            return FwuStatus::Denied;
        }
        if !self.store.check_correct_boot() || self.store.check_trial_state() {
            return FwuStatus::Denied;
        }
        let Some((req, guid_bytes)) = request::<BeginStagingReq>(message) else {
            return FwuStatus::Unknown;
        };

        let count = req.partial_update_count as usize;
        if count > 0 && !self.config.partial_update_supported() {
            log::error!(target: "fwu_mm", "Partial update of {} images requested but not supported.", count);
            return FwuStatus::Busy;
        }
        let Some(guid_bytes) = guid_bytes.get(..count.saturating_mul(GUID_SIZE)) else {
            log::error!(target: "fwu_mm", "Begin staging lists {} images past the end of the message.", count);
            return FwuStatus::Unknown;
        };
        let guids: Vec<efi::Guid> = guid_bytes
            .chunks_exact(GUID_SIZE)
            .filter_map(|c| <[u8; GUID_SIZE]>::try_from(c).ok())
            .map(|b| efi::Guid::from_bytes(&b))
            .collect();
        let selection = if guids.is_empty() { self.fd_table.all() } else { Selection::Guids(&guids) };

        match self.fd_table.set_staging(&mut self.store, &selection) {
            Ok(()) => (),
            Err(FwuError::NotFound) => return FwuStatus::Unknown,
            Err(_) => return FwuStatus::Busy,
        }

        if let Err(e) = self.store.update_start(req.vendor_flags & self.config.vendor_flags) {
            log::error!(target: "fwu_mm", "Failed to start update: {:?}", e);
            if let Err(e) = self.fd_table.clear_staging(&mut self.store, &selection, ClearMode::Error) {
                log::error!(target: "fwu_mm", "Failed to clear staging after update start failure: {:?}", e);
            }
            return FwuStatus::Busy;
        }

        self.set_state(FwStoreState::Staging);
        self.staging_flags = req.vendor_flags;
        FwuStatus::Success
    }

    fn end_staging(&mut self) -> FwuStatus {
        if self.state != FwStoreState::Staging {
            return FwuStatus::Denied;
        }
        let all = self.fd_table.all();
        if self.fd_table.clear_staging(&mut self.store, &all, ClearMode::Normal).is_err() {
            return FwuStatus::Busy;
        }

        match self.store.update_end(false) {
            Ok(()) => (),
            Err(FwuError::SecurityViolation) => return FwuStatus::AuthFail,
            Err(e) => {
                log::error!(target: "fwu_mm", "Failed to end update: {:?}", e);
                return FwuStatus::NotAvailable;
            }
        }

        let state = self.settled_state();
        self.set_state(state);
        self.staging_flags = 0;
        FwuStatus::Success
    }

    fn cancel_staging(&mut self) -> FwuStatus {
        if self.state != FwStoreState::Staging {
            return FwuStatus::Denied;
        }
        let all = self.fd_table.all();
        if let Err(e) = self.fd_table.clear_staging(&mut self.store, &all, ClearMode::Cancel) {
            log::error!(target: "fwu_mm", "Failed to close images on cancel: {:?}", e);
        }
        // Writes land on storage directly, so the update bank is restored from the active bank.
        if let Err(e) = self.store.rollback() {
            log::error!(target: "fwu_mm", "Failed to restore update bank: {:?}", e);
        }
        if let Err(e) = self.store.update_end(true) {
            log::error!(target: "fwu_mm", "Failed to abort update: {:?}", e);
        }

        self.set_state(FwStoreState::Regular);
        self.staging_flags = 0;
        FwuStatus::Success
    }

    fn open(&mut self, message: &mut [u8]) -> FwuStatus {
        let Some((req, _)) = request::<OpenReq>(message) else {
            return FwuStatus::Unknown;
        };
        let Ok(op_type) = FwuOpType::try_from(req.op_type) else {
            return FwuStatus::NotAvailable;
        };
        let image_type = efi::Guid::from_bytes(&req.image_type_guid);
        let Some(index) = self.fd_table.find(&image_type) else {
            return FwuStatus::Unknown;
        };
        let Some(slot) = self.fd_table.slot_mut(index) else {
            return FwuStatus::Unknown;
        };

        match op_type {
            FwuOpType::Write => {
                if slot.client_permissions() & FWU_WRITE_PERMISSION == 0 {
                    return FwuStatus::NotAvailable;
                }
                if !slot.is_staging() {
                    return FwuStatus::Denied;
                }
            }
            FwuOpType::Read => {
                if slot.client_permissions() & FWU_READ_PERMISSION == 0 {
                    return FwuStatus::NotAvailable;
                }
            }
        }
        if slot.is_open() {
            log::error!(target: "fwu_mm", "Image {:?} is already open.", image_type);
            return FwuStatus::Denied;
        }

        let handle = if slot.is_directory() {
            OpenHandle::Directory(self.store.image_directory().to_bytes())
        } else {
            match self.store.open(&image_type, op_type) {
                Ok(file) => OpenHandle::Image(file),
                Err(e) => {
                    log::error!(target: "fwu_mm", "Failed to open {:?}: {:?}", image_type, e);
                    return FwuStatus::NotAvailable;
                }
            }
        };
        slot.open(handle, op_type);
        log::debug!(target: "fwu_mm", "Opened {:?} for {:?} as handle {}.", image_type, op_type, index);

        respond(message, &OpenResp { handle: index as u32 });
        FwuStatus::Success
    }

    fn write_stream(&mut self, message: &mut [u8]) -> FwuStatus {
        if self.state != FwStoreState::Staging {
            return FwuStatus::Denied;
        }
        let Some((req, payload)) = request::<WriteStreamReq>(message) else {
            return FwuStatus::Unknown;
        };
        let Some(slot) = self.fd_table.opened_mut(req.handle) else {
            return FwuStatus::Unknown;
        };
        if slot.op_type() != FwuOpType::Write {
            return FwuStatus::NoPermission;
        }
        let Some(data) = payload.get(..req.data_len as usize) else {
            log::error!(target: "fwu_mm", "Write of {:#x} bytes runs past the message.", { req.data_len });
            return FwuStatus::OutOfBounds;
        };
        if data.is_empty() {
            return FwuStatus::Success;
        }
        if slot.pos() + data.len() as u64 > slot.max_size() {
            return FwuStatus::OutOfBounds;
        }
        let pos = slot.pos();
        let Some(OpenHandle::Image(file)) = slot.handle.as_mut() else {
            return FwuStatus::NoPermission;
        };
        if let Err(e) = self.store.write(file, pos, data) {
            log::error!(target: "fwu_mm", "Failed to write {:#x} bytes at {:#x}: {:?}", data.len(), pos, e);
            return FwuStatus::NoPermission;
        }
        slot.pos += data.len() as u64;
        FwuStatus::Success
    }

    fn read_stream(&mut self, message: &mut [u8]) -> FwuStatus {
        let Some((req, _)) = request::<ReadStreamReq>(message) else {
            return FwuStatus::Unknown;
        };
        let Some(slot) = self.fd_table.opened_mut(req.handle) else {
            return FwuStatus::Unknown;
        };
        if slot.op_type() != FwuOpType::Read {
            return FwuStatus::NoPermission;
        }
        let total = slot.file_size();
        let pos = slot.pos();
        if pos >= total {
            return FwuStatus::OutOfBounds;
        }

        let start = HEADER_SIZE + size_of::<ReadStreamResp>();
        let capacity = message.len().saturating_sub(start) as u64;
        let mut len = capacity.min(total - pos) as usize;
        if len > 0 {
            let out = &mut message[start..start + len];
            match slot.handle.as_ref() {
                Some(OpenHandle::Directory(bytes)) => out.copy_from_slice(&bytes[pos as usize..pos as usize + len]),
                Some(OpenHandle::Image(file)) => match self.store.read(file, pos, out) {
                    Ok(read) => len = read,
                    Err(e) => {
                        log::error!(target: "fwu_mm", "Failed to read {:#x} bytes at {:#x}: {:?}", len, pos, e);
                        return FwuStatus::NoPermission;
                    }
                },
                None => return FwuStatus::Unknown,
            }
        }

        let resp = ReadStreamResp {
            read_bytes: len as u32,
            total_bytes: u32::try_from(total).unwrap_or(u32::MAX),
        };
        respond(message, &resp);
        slot.pos += len as u64;
        FwuStatus::Success
    }

    fn commit(&mut self, message: &mut [u8]) -> FwuStatus {
        let Some((req, _)) = request::<CommitReq>(message) else {
            return FwuStatus::Unknown;
        };
        let correct_boot = self.store.check_correct_boot();
        let state = self.state;
        let Some(slot) = self.fd_table.opened_mut(req.handle) else {
            return FwuStatus::Unknown;
        };
        if slot.is_directory() {
            slot.close();
            return FwuStatus::Success;
        }

        let op_type = slot.op_type();
        let untouched = op_type == FwuOpType::Write && slot.pos() == 0;
        let accept_now = req.acceptance_req == 0;
        if accept_now {
            let after_activation = slot.client_permissions() & FWU_ACCEPT_AFTER_ACTIVATION != 0;
            if after_activation && (op_type == FwuOpType::Write || !correct_boot) {
                return FwuStatus::Denied;
            }
            if untouched {
                return FwuStatus::Denied;
            }
        }

        let image_type = slot.image_type_guid();
        let Some(OpenHandle::Image(file)) = slot.handle.as_mut() else {
            return FwuStatus::Unknown;
        };
        if untouched {
            if let Err(e) = self.store.erase(file) {
                log::error!(target: "fwu_mm", "Failed to erase {:?}: {:?}", image_type, e);
            }
        }
        let progress = match self.store.release(file, req.max_atomic_len) {
            Ok(progress) => progress,
            Err(FwuError::Timeout) => return FwuStatus::Resume,
            Err(FwuError::SecurityViolation) => {
                slot.close();
                return FwuStatus::AuthFail;
            }
            Err(e) => {
                log::error!(target: "fwu_mm", "Failed to release {:?}: {:?}", image_type, e);
                return FwuStatus::Unknown;
            }
        };
        slot.close();

        if accept_now {
            // Outside of staging a read commit accepts the image the platform runs from.
            let on_update_bank = !(op_type == FwuOpType::Read && state != FwStoreState::Staging);
            if let Err(e) = self.store.accept_image(&image_type, on_update_bank) {
                log::error!(target: "fwu_mm", "Failed to accept {:?}: {:?}", image_type, e);
                return FwuStatus::Denied;
            }
        }

        respond(message, &CommitResp { progress: progress.progress, total_work: progress.total_work });
        FwuStatus::Success
    }

    fn accept_image(&mut self, message: &mut [u8]) -> FwuStatus {
        let Some((req, _)) = request::<AcceptImageReq>(message) else {
            return FwuStatus::Unknown;
        };
        if self.state == FwStoreState::Staging {
            log::error!(target: "fwu_mm", "Accept image during staging.");
            return FwuStatus::Denied;
        }
        if !self.store.check_correct_boot() {
            return FwuStatus::Denied;
        }

        let image_type = efi::Guid::from_bytes(&req.image_type_guid);
        match self.store.accept_image(&image_type, false) {
            Ok(()) => (),
            Err(FwuError::NotFound) => return FwuStatus::Unknown,
            Err(e) => {
                log::error!(target: "fwu_mm", "Failed to accept {:?}: {:?}", image_type, e);
                return FwuStatus::Denied;
            }
        }

        let state = self.settled_state();
        self.set_state(state);
        FwuStatus::Success
    }

    fn select_previous(&mut self) -> FwuStatus {
        if !self.store.check_trial_state() && self.store.check_correct_boot() {
            return FwuStatus::Denied;
        }
        if let Err(e) = self.store.rollback() {
            log::error!(target: "fwu_mm", "Failed to select previous bank: {:?}", e);
            return FwuStatus::Denied;
        }
        self.set_state(FwStoreState::Regular);
        FwuStatus::Success
    }
}

impl<S: FirmwareStore> MmiHandler for FwuService<S> {
    fn handler_guid(&self) -> efi::Guid {
        PSA_FWU_UPDATE_AGENT_GUID
    }

    fn handle(&mut self, message: &mut [u8]) -> Result<()> {
        let Ok((header, _)) = ParameterHeader::read_from_prefix(message) else {
            log::error!(target: "fwu_mm", "Message of {} bytes is too small.", message.len());
            return Err(FwuError::InvalidParameter);
        };
        let command = header.command;
        if command >= FWU_COMMAND_MAX_ID {
            log::error!(target: "fwu_mm", "Invalid command {}.", command);
            return Err(FwuError::InvalidParameter);
        }
        let Ok(command) = FwuCommand::try_from(command) else {
            log::error!(target: "fwu_mm", "Command {} is not implemented.", command);
            return Err(FwuError::Unsupported);
        };

        let required = command.required_size(Self::num_func());
        if message.len() < required {
            log::error!(
                target: "fwu_mm",
                "The communication buffer is too small {:#x}, need {:#x}",
                message.len(),
                required
            );
            return Err(FwuError::InvalidParameter);
        }

        log::debug!(target: "fwu_mm", "--> {:?}, data size {:#x}", command, message.len() - HEADER_SIZE);
        let status = self.dispatch(command, message);
        log::debug!(target: "fwu_mm", "<-- {:?}: {:?}", command, status);

        let header = ParameterHeader { command: command as u32, response_status: status as i32 };
        header.write_to_prefix(message).map_err(|_| FwuError::BufferTooSmall)
    }
}

fn request<T: FromBytes>(message: &[u8]) -> Option<(T, &[u8])> {
    T::read_from_prefix(message.get(HEADER_SIZE..)?).ok()
}

fn respond<T: IntoBytes + Immutable>(message: &mut [u8], resp: &T) {
    if let Some(body) = message.get_mut(HEADER_SIZE..) {
        let _ = resp.write_to_prefix(body);
    }
}
