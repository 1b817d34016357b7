// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootloader side of the firmware update service.
//!
//! The update server speaks in portable [`ImageType`]s; an [`FwuBootloader`]
//! turns those into flash operations on the slots its bootloader owns.
//! [`Mcuboot`] is the backend for MCUboot's slot and trailer layout.

#![cfg_attr(not(test), no_std)]

use drv_fwu_api::{FwuError, ImageInfo, ImageType, InstallOutcome};

pub mod flash;
pub mod mcuboot;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use flash::{Flash, FlashArea, FlashAreaId, FlashError};
pub use mcuboot::{ImageCount, Mcuboot, McubootConfig, UpgradeStrategy};

pub trait FwuBootloader {
    /// Loads the metadata the bootloader handed over at boot.
    fn initialize(&mut self) -> Result<(), FwuError>;

    /// Opens and erases the staging area for `image_type`, releasing any
    /// staging area that was already open.
    fn stage_begin(&mut self, image_type: ImageType) -> Result<(), FwuError>;

    /// Writes `block` at `offset` into the open staging area.
    fn stage_write(
        &mut self,
        image_type: ImageType,
        offset: u32,
        block: &[u8],
    ) -> Result<(), FwuError>;

    /// Marks the staged image to be tried on the next boot.
    fn mark_candidate(
        &mut self,
        image_type: ImageType,
    ) -> Result<InstallOutcome, FwuError>;

    /// Makes the running image permanent.
    fn mark_accepted(&mut self) -> Result<(), FwuError>;

    /// Releases the staging area for `image_type`.
    fn abort(&mut self, image_type: ImageType) -> Result<(), FwuError>;

    /// Describes the running image (`active`) or the staged one.
    fn query(
        &mut self,
        image_type: ImageType,
        active: bool,
    ) -> Result<ImageInfo, FwuError>;
}
