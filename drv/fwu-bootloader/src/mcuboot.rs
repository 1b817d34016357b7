// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MCUboot backend.
//!
//! MCUboot gives every image index a primary slot, which runs, and a
//! secondary slot, which receives upgrades. An upgrade is requested by
//! writing the boot magic into the secondary slot's trailer; under the swap
//! strategy the new image must then confirm itself by setting `image_ok` in
//! the primary slot's trailer or it is reverted on the next reset.
//!
//! ```text
//!   slot start                                         slot end
//!   +--------------+-------------------+----------+-----------+
//!   | image header | image ...         | image_ok | magic[16] |
//!   +--------------+-------------------+----------+-----------+
//!                                      ^ end - 16 - BOOT_MAX_ALIGN
//! ```
//!
//! The versions of the running images come from the shared data region the
//! bootloader fills in before jumping to the runtime.

use core::marker::PhantomData;
use counters::{count, counters};
use digest::Digest;
use drv_fwu_api::{
    FwuError, ImageId, ImageInfo, ImageSlot, ImageType, ImageVersion,
    InstallOutcome, MAX_DIGEST_SIZE,
};
use ringbuf::{ringbuf, ringbuf_entry};
use shared_data::{
    ShareError, SharedDataReader, SharedDataWriter, HEADER_SIZE,
};
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

use crate::flash::{Flash, FlashArea, FlashAreaId, FlashError};
use crate::FwuBootloader;

/// Shared data major type for firmware update entries.
pub const TLV_MAJOR_FWU: u8 = 0x2;

/// Claim holding the version of a booted image.
pub const SW_VERSION: u8 = 0x05;

/// `ih_magic` of a valid MCUboot image header.
pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;

/// Room for the firmware update entries copied out of the boot data.
pub const BOOT_DATA_CACHE_SIZE: usize = 0x40;

/// Size of the image header at the start of a slot.
pub const IMAGE_HEADER_SIZE: usize = core::mem::size_of::<ImageHeader>();

/// Boot magic, as the four words `f395c277 7fefd260 0f505235 8079b62c`
/// stored little-endian.
const BOOT_MAGIC: [u8; BOOT_MAGIC_SIZE as usize] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f,
    0x2c, 0xb6, 0x79, 0x80,
];
const BOOT_MAGIC_SIZE: u32 = 16;
const BOOT_MAX_ALIGN: u32 = 8;
const BOOT_FLAG_SET: u8 = 0x01;
const BOOT_FLAG_UNSET: u8 = 0xFF;

const HASH_CHUNK_SIZE: usize = 256;

/// Shared data minor type carrying the version of image `index`.
pub const fn version_claim_minor(index: u8) -> u8 {
    (index << 6) | SW_VERSION
}

/// MCUboot's `image_header`.
#[derive(
    Copy,
    Clone,
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
)]
#[repr(C)]
pub struct ImageHeader {
    pub magic: U32,
    pub load_addr: U32,
    pub hdr_size: U16,
    pub protect_tlv_size: U16,
    pub img_size: U32,
    pub flags: U32,
    pub version: ImageVersion,
    pub pad1: U32,
}

const_assert_eq!(IMAGE_HEADER_SIZE, 32);

/// Records the version of booted image `index` in the shared data region.
/// Run by the bootloader before it hands over to the runtime.
pub fn save_shared_data(
    w: &mut SharedDataWriter<'_>,
    index: u8,
    header: &ImageHeader,
) -> Result<(), ShareError> {
    w.add(
        TLV_MAJOR_FWU,
        version_claim_minor(index),
        header.version.as_bytes(),
    )
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageCount {
    /// One image holds both the secure and non-secure code.
    Single,
    /// Secure image at index 0, non-secure image at index 1.
    Multi,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpgradeStrategy {
    Swap,
    OverwriteOnly,
    DirectXip,
    RamLoad,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct McubootConfig {
    pub images: ImageCount,
    pub strategy: UpgradeStrategy,
}

cfg_if::cfg_if! {
    if #[cfg(feature = "multi-image")] {
        const IMAGES: ImageCount = ImageCount::Multi;
    } else {
        const IMAGES: ImageCount = ImageCount::Single;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "overwrite-only")] {
        const STRATEGY: UpgradeStrategy = UpgradeStrategy::OverwriteOnly;
    } else if #[cfg(feature = "direct-xip")] {
        const STRATEGY: UpgradeStrategy = UpgradeStrategy::DirectXip;
    } else if #[cfg(feature = "ram-load")] {
        const STRATEGY: UpgradeStrategy = UpgradeStrategy::RamLoad;
    } else {
        const STRATEGY: UpgradeStrategy = UpgradeStrategy::Swap;
    }
}

impl McubootConfig {
    /// Configuration selected by this crate's features.
    pub const DEFAULT: Self = Self {
        images: IMAGES,
        strategy: STRATEGY,
    };

    pub fn image_count(&self) -> u8 {
        match self.images {
            ImageCount::Single => 1,
            ImageCount::Multi => 2,
        }
    }

    /// Bootloader image index for `image_type`.
    pub fn image_index(&self, image_type: ImageType) -> Result<u8, FwuError> {
        match (self.images, image_type) {
            (ImageCount::Single, ImageType::Full) => Ok(0),
            (ImageCount::Multi, ImageType::Secure) => Ok(0),
            (ImageCount::Multi, ImageType::Nonsecure) => Ok(1),
            _ => Err(FwuError::UnsupportedImageType),
        }
    }

    pub fn image_type(&self, index: u8) -> Result<ImageType, FwuError> {
        match (self.images, index) {
            (ImageCount::Single, 0) => Ok(ImageType::Full),
            (ImageCount::Multi, 0) => Ok(ImageType::Secure),
            (ImageCount::Multi, 1) => Ok(ImageType::Nonsecure),
            _ => Err(FwuError::UnsupportedImageType),
        }
    }
}

impl Default for McubootConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    BootData { len: usize },
    BootDataRejected(ShareError),
    StageBegin { index: u8, size: u32 },
    FlashFailed(FwuError, FlashError),
    CandidateMarked(u8),
    Confirmed(u8),
    AlreadyConfirmed(u8),
    BadTrailer(u8),
    NoImageHeader(u8),
    Aborted(u8),
}

ringbuf!(Trace, 16, Trace::None);
counters!(FlashError);

fn flash_error(op: FwuError, e: FlashError) -> FwuError {
    count!(e);
    ringbuf_entry!(Trace::FlashFailed(op, e));
    op
}

#[derive(Copy, Clone, Debug)]
struct Staging {
    index: u8,
    area: FlashArea,
}

/// MCUboot backend over flash `F`, boot data `S` and image hash `H`.
pub struct Mcuboot<F, S, H = sha2::Sha256> {
    flash: F,
    boot_data: S,
    cache: [u8; BOOT_DATA_CACHE_SIZE],
    staging: Option<Staging>,
    config: McubootConfig,
    hash: PhantomData<H>,
}

impl<F, S, H> Mcuboot<F, S, H>
where
    F: Flash,
    S: AsRef<[u8]>,
    H: Digest,
{
    pub fn new(flash: F, boot_data: S) -> Self {
        Self::with_config(flash, boot_data, McubootConfig::DEFAULT)
    }

    pub fn with_config(flash: F, boot_data: S, config: McubootConfig) -> Self {
        Self {
            flash,
            boot_data,
            cache: [0; BOOT_DATA_CACHE_SIZE],
            staging: None,
            config,
            hash: PhantomData,
        }
    }

    pub fn config(&self) -> &McubootConfig {
        &self.config
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    fn load_boot_data(&mut self) -> Result<(), FwuError> {
        let reader = SharedDataReader::new(self.boot_data.as_ref())
            .map_err(|e| {
                ringbuf_entry!(Trace::BootDataRejected(e));
                FwuError::NoBootData
            })?;
        let len = reader
            .copy_major(TLV_MAJOR_FWU, &mut self.cache)
            .map_err(|e| {
                ringbuf_entry!(Trace::BootDataRejected(e));
                FwuError::BootDataMalformed
            })?;
        if len == HEADER_SIZE {
            return Err(FwuError::BootDataNotFound);
        }
        ringbuf_entry!(Trace::BootData { len });
        Ok(())
    }

    fn staging_for(&self, image_type: ImageType) -> Result<Staging, FwuError> {
        let index = self.config.image_index(image_type)?;
        self.staging
            .filter(|s| s.index == index)
            .ok_or(FwuError::NoStagingArea)
    }

    /// Dependencies between images are not tracked yet, so no image ever
    /// waits on another.
    fn check_dependency(&self, _index: u8) -> Option<(u8, ImageVersion)> {
        None
    }

    fn write_magic(&mut self, area: &FlashArea) -> Result<(), FwuError> {
        let off = area
            .size
            .checked_sub(BOOT_MAGIC_SIZE)
            .ok_or(FwuError::TrailerWrite)?;
        self.flash
            .write(area, off, &BOOT_MAGIC)
            .map_err(|e| flash_error(FwuError::TrailerWrite, e))
    }

    /// MCUboot's `boot_set_confirmed` for the primary slot of `index`.
    fn set_confirmed(&mut self, index: u8) -> Result<(), FwuError> {
        let area = self
            .flash
            .open(FlashAreaId::Primary(index))
            .map_err(|e| flash_error(FwuError::FlashOpen, e))?;
        let r = self.confirm_area(index, &area);
        self.flash.close(&area);
        r
    }

    fn confirm_area(
        &mut self,
        index: u8,
        area: &FlashArea,
    ) -> Result<(), FwuError> {
        let magic_off = area
            .size
            .checked_sub(BOOT_MAGIC_SIZE + BOOT_MAX_ALIGN)
            .map(|o| o + BOOT_MAX_ALIGN)
            .ok_or(FwuError::BadTrailer)?;
        let mut magic = [0u8; BOOT_MAGIC_SIZE as usize];
        self.flash
            .read(area, magic_off, &mut magic)
            .map_err(|e| flash_error(FwuError::FlashRead, e))?;

        if magic.iter().all(|&b| b == BOOT_FLAG_UNSET) {
            // Nothing was ever swapped in, so there is nothing to revert.
            ringbuf_entry!(Trace::AlreadyConfirmed(index));
            return Ok(());
        }
        if magic != BOOT_MAGIC {
            ringbuf_entry!(Trace::BadTrailer(index));
            return Err(FwuError::BadTrailer);
        }

        let ok_off = magic_off - BOOT_MAX_ALIGN;
        let mut image_ok = [0u8; 1];
        self.flash
            .read(area, ok_off, &mut image_ok)
            .map_err(|e| flash_error(FwuError::FlashRead, e))?;
        if image_ok[0] != BOOT_FLAG_UNSET {
            ringbuf_entry!(Trace::AlreadyConfirmed(index));
            return Ok(());
        }

        let mut flag = [BOOT_FLAG_UNSET; BOOT_MAX_ALIGN as usize];
        flag[0] = BOOT_FLAG_SET;
        self.flash
            .write(area, ok_off, &flag)
            .map_err(|e| flash_error(FwuError::TrailerWrite, e))?;
        ringbuf_entry!(Trace::Confirmed(index));
        Ok(())
    }

    fn active_info(
        &self,
        index: u8,
        info: &mut ImageInfo,
    ) -> Result<(), FwuError> {
        let reader = SharedDataReader::new(&self.cache)
            .map_err(|_| FwuError::NoBootData)?;
        let raw = reader
            .lookup(TLV_MAJOR_FWU, version_claim_minor(index))
            .map_err(|_| FwuError::BootDataNotFound)?;
        info.version = ImageVersion::read_from_bytes(raw)
            .map_err(|_| FwuError::BootDataMalformed)?;
        // The running image was verified at boot; its digest stays private.
        Ok(())
    }

    fn staged_info(
        &mut self,
        index: u8,
        area: &FlashArea,
        info: &mut ImageInfo,
    ) -> Result<(), FwuError> {
        let mut raw = [0u8; IMAGE_HEADER_SIZE];
        self.flash
            .read(area, 0, &mut raw)
            .map_err(|e| flash_error(FwuError::FlashRead, e))?;
        let header = ImageHeader::read_from_bytes(&raw[..])
            .map_err(|_| FwuError::NoImageHeader)?;
        if header.magic.get() != IMAGE_MAGIC {
            ringbuf_entry!(Trace::NoImageHeader(index));
            return Err(FwuError::NoImageHeader);
        }
        info.version = header.version;

        // The whole slot is hashed, trailer included.
        let mut hasher = H::new();
        let mut chunk = [0u8; HASH_CHUNK_SIZE];
        let mut off = 0;
        while off < area.size {
            let n = (area.size - off).min(HASH_CHUNK_SIZE as u32) as usize;
            self.flash
                .read(area, off, &mut chunk[..n])
                .map_err(|e| flash_error(FwuError::FlashRead, e))?;
            hasher.update(&chunk[..n]);
            off += n as u32;
        }
        let digest = hasher.finalize();
        let n = digest.len().min(MAX_DIGEST_SIZE);
        info.digest[..n].copy_from_slice(&digest[..n]);
        Ok(())
    }
}

impl<F, S, H> FwuBootloader for Mcuboot<F, S, H>
where
    F: Flash,
    S: AsRef<[u8]>,
    H: Digest,
{
    fn initialize(&mut self) -> Result<(), FwuError> {
        let r = self.load_boot_data();
        if r.is_err() {
            self.cache.fill(0);
        }
        r
    }

    fn stage_begin(&mut self, image_type: ImageType) -> Result<(), FwuError> {
        let index = self.config.image_index(image_type)?;

        if let Some(old) = self.staging.take() {
            self.flash.close(&old.area);
        }

        let area = self
            .flash
            .open(FlashAreaId::Secondary(index))
            .map_err(|e| flash_error(FwuError::FlashOpen, e))?;
        if let Err(e) = self.flash.erase(&area, 0, area.size) {
            self.flash.close(&area);
            return Err(flash_error(FwuError::FlashErase, e));
        }

        ringbuf_entry!(Trace::StageBegin {
            index,
            size: area.size
        });
        self.staging = Some(Staging { index, area });
        Ok(())
    }

    fn stage_write(
        &mut self,
        image_type: ImageType,
        offset: u32,
        block: &[u8],
    ) -> Result<(), FwuError> {
        let staging = self.staging_for(image_type)?;
        if !staging.area.contains(offset, block.len()) {
            return Err(FwuError::OutOfBounds);
        }
        self.flash
            .write(&staging.area, offset, block)
            .map_err(|e| flash_error(FwuError::FlashWrite, e))
    }

    fn mark_candidate(
        &mut self,
        image_type: ImageType,
    ) -> Result<InstallOutcome, FwuError> {
        let staging = self.staging_for(image_type)?;

        if let Some((index, version)) = self.check_dependency(staging.index) {
            let image_type = self.config.image_type(index)?;
            return Ok(InstallOutcome::DependencyRequired {
                id: ImageId::staging(image_type),
                version,
            });
        }

        self.write_magic(&staging.area)?;
        ringbuf_entry!(Trace::CandidateMarked(staging.index));
        Ok(InstallOutcome::RebootRequired)
    }

    fn mark_accepted(&mut self) -> Result<(), FwuError> {
        match self.config.strategy {
            UpgradeStrategy::Swap => {
                for index in 0..self.config.image_count() {
                    self.set_confirmed(index)?;
                }
                Ok(())
            }
            // No revert under these strategies, so nothing to confirm.
            UpgradeStrategy::OverwriteOnly
            | UpgradeStrategy::DirectXip
            | UpgradeStrategy::RamLoad => Ok(()),
        }
    }

    fn abort(&mut self, image_type: ImageType) -> Result<(), FwuError> {
        let staging = self.staging_for(image_type)?;
        self.flash.close(&staging.area);
        self.staging = None;
        ringbuf_entry!(Trace::Aborted(staging.index));
        Ok(())
    }

    fn query(
        &mut self,
        image_type: ImageType,
        active: bool,
    ) -> Result<ImageInfo, FwuError> {
        let index = self.config.image_index(image_type)?;
        let slot = if active {
            ImageSlot::Active
        } else {
            ImageSlot::Staging
        };
        let mut info = ImageInfo::new(ImageId::new(slot, image_type, 0));

        if active {
            self.active_info(index, &mut info)?;
        } else {
            let area = self
                .flash
                .open(FlashAreaId::Secondary(index))
                .map_err(|e| flash_error(FwuError::FlashOpen, e))?;
            let r = self.staged_info(index, &area, &mut info);
            self.flash.close(&area);
            r?;
        }
        Ok(info)
    }
}
