// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API types for the firmware update service.
//!
//! These types cross the boundary between the update service and its callers,
//! so their encodings are fixed: an [`ImageId`] is a packed `u32` and an
//! [`ImageVersion`] is the 8-byte layout the bootloader also uses.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// Largest block accepted by a single write.
pub const MAX_BLOCK_SIZE: usize = 1024;

/// Size of an image digest in bytes.
pub const MAX_DIGEST_SIZE: usize = 32;

/// Fill byte for a digest that is not reported.
pub const INVALID_DIGEST: u8 = 0xFF;

/// Raw image id value that never names an image.
pub const INVALID_IMAGE_ID: u32 = 0;

const SLOT_SHIFT: u32 = 0;
const TYPE_SHIFT: u32 = 8;
const DISCRIMINATOR_SHIFT: u32 = 16;

/// Which copy of an image an id refers to.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u8)]
pub enum ImageSlot {
    /// The image currently running.
    Active = 1,
    /// The area an incoming image is written to.
    Staging = 2,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u8)]
pub enum ImageType {
    Nonsecure = 1,
    Secure = 2,
    /// Secure and non-secure images combined.
    Full = 3,
}

/// Portable image identifier.
///
/// On the wire this is a `u32`: bits 7:0 hold the [`ImageSlot`], bits 15:8
/// the [`ImageType`] and bits 31:16 a caller-chosen discriminator. An
/// `ImageId` can only be built from a valid slot and type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ImageId {
    slot: ImageSlot,
    image_type: ImageType,
    discriminator: u16,
}

impl ImageId {
    pub const fn new(
        slot: ImageSlot,
        image_type: ImageType,
        discriminator: u16,
    ) -> Self {
        Self {
            slot,
            image_type,
            discriminator,
        }
    }

    /// Id of the staging copy of `image_type`, as handed back to callers that
    /// need to supply a dependency.
    pub const fn staging(image_type: ImageType) -> Self {
        Self::new(ImageSlot::Staging, image_type, 0)
    }

    pub fn from_raw(raw: u32) -> Result<Self, FwuError> {
        let slot = ImageSlot::from_u8((raw >> SLOT_SHIFT) as u8)
            .ok_or(FwuError::BadImageId)?;
        let image_type = ImageType::from_u8((raw >> TYPE_SHIFT) as u8)
            .ok_or(FwuError::BadImageId)?;
        Ok(Self::new(slot, image_type, (raw >> DISCRIMINATOR_SHIFT) as u16))
    }

    pub const fn raw(self) -> u32 {
        (self.slot as u32) << SLOT_SHIFT
            | (self.image_type as u32) << TYPE_SHIFT
            | (self.discriminator as u32) << DISCRIMINATOR_SHIFT
    }

    pub const fn slot(self) -> ImageSlot {
        self.slot
    }

    pub const fn image_type(self) -> ImageType {
        self.image_type
    }

    pub const fn discriminator(self) -> u16 {
        self.discriminator
    }
}

impl TryFrom<u32> for ImageId {
    type Error = FwuError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<ImageId> for u32 {
    fn from(id: ImageId) -> Self {
        id.raw()
    }
}

impl SerializedSize for ImageId {
    const MAX_SIZE: usize = u32::MAX_SIZE;
}

/// Image version, laid out as the bootloader's `image_version`.
///
/// The multi-byte fields are native integers, so the byte layout matches the
/// bootloader's only on a little-endian target.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    SerializedSize,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
)]
#[repr(C)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build: u32,
}

const_assert_eq!(core::mem::size_of::<ImageVersion>(), 8);

#[cfg(target_endian = "big")]
compile_error!("ImageVersion is read from little-endian image headers");

/// Lifecycle state of an image as seen by the update service.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u8)]
pub enum ImageState {
    /// No update in progress.
    #[default]
    Invalid = 0,
    /// Image is being written.
    Candidate = 1,
    /// Installation has been requested.
    Install = 2,
    /// The running image has been made permanent.
    Accepted = 3,
    /// Staging failed; writing may start over.
    Rejected = 4,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct ImageInfo {
    pub id: ImageId,
    pub version: ImageVersion,
    pub state: ImageState,
    /// Hash over the image's flash footprint. Only reported for the staging
    /// image; filled with [`INVALID_DIGEST`] otherwise.
    pub digest: [u8; MAX_DIGEST_SIZE],
}

impl ImageInfo {
    pub fn new(id: ImageId) -> Self {
        Self {
            id,
            version: ImageVersion::default(),
            state: ImageState::Invalid,
            digest: [INVALID_DIGEST; MAX_DIGEST_SIZE],
        }
    }
}

/// Successful result of an install request.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum InstallOutcome {
    /// The image is installed and no restart is needed.
    Installed,
    /// The image is marked for the next boot; a restart is needed.
    RebootRequired,
    /// Another image must be installed first, at `version` or newer.
    DependencyRequired { id: ImageId, version: ImageVersion },
}

impl InstallOutcome {
    pub fn status(self) -> FwuStatus {
        match self {
            InstallOutcome::Installed => FwuStatus::Success,
            InstallOutcome::RebootRequired => FwuStatus::RebootRequired,
            InstallOutcome::DependencyRequired { .. } => {
                FwuStatus::DependencyRequired
            }
        }
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
    counters::Count,
)]
#[repr(u32)]
pub enum FwuError {
    /// Slot or type bits of an image id are not recognized.
    BadImageId = 1,
    /// Writes and installs only target the staging slot.
    NotStagingSlot,
    /// Block is empty or larger than [`MAX_BLOCK_SIZE`].
    BadLength,
    /// The bootloader cannot map this image type in this build.
    UnsupportedImageType,
    /// The operation is not legal in the current update state.
    InvalidState,
    /// Write would land outside the staging area.
    OutOfBounds,
    FlashOpen,
    FlashErase,
    FlashWrite,
    FlashRead,
    /// No staging area is open for this image type.
    NoStagingArea,
    /// Writing a boot trailer flag failed.
    TrailerWrite,
    /// Boot trailer holds something other than a magic or erased flash.
    BadTrailer,
    /// Staging area does not start with an image header.
    NoImageHeader,
    /// No boot data was handed over by the bootloader.
    NoBootData,
    /// Boot data holds no version for this image.
    BootDataNotFound,
    /// Boot data version entry has the wrong size.
    BootDataMalformed,
}

impl FwuError {
    /// The caller-visible outcome for this error.
    pub fn status(self) -> FwuStatus {
        match self {
            FwuError::BadImageId
            | FwuError::NotStagingSlot
            | FwuError::BadLength
            | FwuError::UnsupportedImageType
            | FwuError::InvalidState
            | FwuError::NoBootData => FwuStatus::InvalidArgument,

            FwuError::OutOfBounds
            | FwuError::FlashWrite
            | FwuError::NoStagingArea => FwuStatus::StorageFailure,

            FwuError::FlashOpen
            | FwuError::FlashErase
            | FwuError::FlashRead
            | FwuError::TrailerWrite
            | FwuError::BadTrailer
            | FwuError::NoImageHeader
            | FwuError::BootDataNotFound
            | FwuError::BootDataMalformed => FwuStatus::ServiceFailure,
        }
    }
}

impl fmt::Display for FwuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Status codes returned to clients, in PSA numbering.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(i32)]
pub enum FwuStatus {
    Success = 0,
    RebootRequired = 1,
    DependencyRequired = 2,
    InvalidArgument = -135,
    ServiceFailure = -144,
    StorageFailure = -146,
}

impl From<FwuError> for FwuStatus {
    fn from(e: FwuError) -> Self {
        e.status()
    }
}

impl<T> From<Result<T, FwuError>> for FwuStatus {
    fn from(r: Result<T, FwuError>) -> Self {
        match r {
            Ok(_) => FwuStatus::Success,
            Err(e) => e.status(),
        }
    }
}
