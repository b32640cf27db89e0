//! Image file descriptor table.
//!
//! One slot per image type: slot 0 is the image directory pseudo image, slots 1.. follow the image directory order.
//! A handle given to the client is the slot index, so at most one handle per image type can be open at a time.
//! Slots also carry the staging mark set by begin staging, which gates opening an image for write.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec::Vec;

use r_efi::efi;

use crate::{
    error::{FwuError, Result},
    psa::{FwuOpType, FWU_READ_PERMISSION, PSA_FWU_IMAGE_DIRECTORY_GUID},
    store::{FirmwareStore, ImageDirectory, ImageFile},
};

/// How [`FdTable::clear_staging`] treats slots that are still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    /// Open slots fail the call with [`FwuError::NotReady`].
    Normal,
    /// Open slots are force closed and their pending changes discarded.
    Cancel,
    /// Open slots are left alone. Used to unwind a failed begin staging.
    Error,
}

/// The slots a staging operation applies to.
#[derive(Debug, Clone, Copy)]
pub enum Selection<'a> {
    /// The slots of the listed image types. Unknown types resolve to no slot.
    Guids(&'a [efi::Guid]),
    /// The first `n` slots of the table.
    First(usize),
}

impl Selection<'_> {
    fn len(&self) -> usize {
        match self {
            Selection::Guids(guids) => guids.len(),
            Selection::First(n) => *n,
        }
    }

    fn prefix(&self, n: usize) -> Self {
        match *self {
            Selection::Guids(guids) => Selection::Guids(&guids[..n.min(guids.len())]),
            Selection::First(_) => Selection::First(n),
        }
    }
}

/// What an open slot refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenHandle {
    /// Snapshot of the serialized image directory taken at open time.
    Directory(Vec<u8>),
    Image(ImageFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdSlot {
    image_type_guid: efi::Guid,
    client_permissions: u32,
    pub(crate) pos: u64,
    op_type: FwuOpType,
    staging: bool,
    pub(crate) handle: Option<OpenHandle>,
}

impl FdSlot {
    fn new(image_type_guid: efi::Guid, client_permissions: u32) -> Self {
        Self { image_type_guid, client_permissions, pos: 0, op_type: FwuOpType::Read, staging: false, handle: None }
    }

    pub fn image_type_guid(&self) -> efi::Guid {
        self.image_type_guid
    }

    pub fn client_permissions(&self) -> u32 {
        self.client_permissions
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn op_type(&self) -> FwuOpType {
        self.op_type
    }

    pub fn is_staging(&self) -> bool {
        self.staging
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_directory(&self) -> bool {
        self.image_type_guid == PSA_FWU_IMAGE_DIRECTORY_GUID
    }

    /// Current size of the open image, 0 when closed.
    pub fn file_size(&self) -> u64 {
        match &self.handle {
            Some(OpenHandle::Directory(bytes)) => bytes.len() as u64,
            Some(OpenHandle::Image(file)) => file.file_size(),
            None => 0,
        }
    }

    /// Largest size the open image can grow to, 0 when closed.
    pub fn max_size(&self) -> u64 {
        match &self.handle {
            Some(OpenHandle::Directory(bytes)) => bytes.len() as u64,
            Some(OpenHandle::Image(file)) => file.max_size(),
            None => 0,
        }
    }

    pub(crate) fn open(&mut self, handle: OpenHandle, op_type: FwuOpType) {
        self.handle = Some(handle);
        self.pos = 0;
        self.op_type = op_type;
    }

    pub(crate) fn close(&mut self) {
        self.handle = None;
        self.pos = 0;
        self.op_type = FwuOpType::Read;
    }
}

/// The image file descriptor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdTable {
    slots: Vec<FdSlot>,
}

impl FdTable {
    /// Builds the table from the image directory: the directory slot followed by one slot per image.
    pub fn new(directory: &ImageDirectory) -> Self {
        let mut slots = Vec::with_capacity(directory.num_images() + 1);
        slots.push(FdSlot::new(PSA_FWU_IMAGE_DIRECTORY_GUID, FWU_READ_PERMISSION));
        slots.extend(directory.entries().iter().map(|e| FdSlot::new(e.image_type_guid, e.client_permissions)));
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Every slot of the table.
    pub fn all(&self) -> Selection<'static> {
        Selection::First(self.slots.len())
    }

    pub fn slots(&self) -> &[FdSlot] {
        &self.slots
    }

    /// Index of the slot of `image_type`, open or not.
    pub fn find(&self, image_type: &efi::Guid) -> Option<usize> {
        self.slots.iter().position(|s| &s.image_type_guid == image_type)
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> Option<&mut FdSlot> {
        self.slots.get_mut(index)
    }

    /// The slot behind a client handle, if the handle refers to an open slot.
    pub fn opened(&self, handle: u32) -> Option<&FdSlot> {
        self.slots.get(handle as usize).filter(|s| s.is_open())
    }

    pub(crate) fn opened_mut(&mut self, handle: u32) -> Option<&mut FdSlot> {
        self.slots.get_mut(handle as usize).filter(|s| s.is_open())
    }

    fn resolve(&self, selection: &Selection, i: usize) -> Option<usize> {
        match selection {
            Selection::Guids(guids) => guids.get(i).and_then(|g| self.find(g)),
            Selection::First(_) => (i < self.slots.len()).then_some(i),
        }
    }

    /// Marks the selected slots as staging.
    ///
    /// Fails with [`FwuError::NotFound`] on an unknown image type and with [`FwuError::NotReady`] if a selected slot
    /// is open for read. Marks set before the failure are cleared again.
    pub fn set_staging<S: FirmwareStore + ?Sized>(&mut self, store: &mut S, selection: &Selection) -> Result<()> {
        for i in 0..selection.len() {
            let Some(index) = self.resolve(selection, i) else {
                self.clear_staging(store, &selection.prefix(i), ClearMode::Error)?;
                return Err(FwuError::NotFound);
            };
            let slot = &mut self.slots[index];
            if slot.is_open() {
                debug_assert_eq!(slot.op_type, FwuOpType::Read, "image open for write outside of staging");
                log::error!(target: "fwu_mm", "Image {:?} is open, can't start staging.", slot.image_type_guid);
                self.clear_staging(store, &selection.prefix(i), ClearMode::Error)?;
                return Err(FwuError::NotReady);
            }
            if !slot.is_directory() {
                slot.staging = true;
            }
        }
        Ok(())
    }

    /// Clears the staging mark of the selected slots, handling open slots according to `mode`.
    pub fn clear_staging<S: FirmwareStore + ?Sized>(
        &mut self,
        store: &mut S,
        selection: &Selection,
        mode: ClearMode,
    ) -> Result<()> {
        for i in 0..selection.len() {
            let Some(index) = self.resolve(selection, i) else {
                continue;
            };
            let slot = &mut self.slots[index];
            if slot.is_open() {
                match mode {
                    ClearMode::Cancel => {
                        if let Some(OpenHandle::Image(mut file)) = slot.handle.take() {
                            file.set_ignore_dirty();
                            if let Err(e) = store.release(&mut file, 0) {
                                log::error!(target: "fwu_mm", "Failed to release {:?}: {:?}", slot.image_type_guid, e);
                            }
                        }
                        slot.close();
                    }
                    ClearMode::Error => {
                        debug_assert_ne!(slot.op_type, FwuOpType::Write);
                        continue;
                    }
                    ClearMode::Normal => {
                        log::error!(target: "fwu_mm", "Image {:?} is still open.", slot.image_type_guid);
                        return Err(FwuError::NotReady);
                    }
                }
            }
            slot.staging = false;
        }
        Ok(())
    }
}
