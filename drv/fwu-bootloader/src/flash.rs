// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash areas as the bootloader lays them out.

/// Names one of the bootloader's flash areas by image index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashAreaId {
    /// Slot the image at this index runs from.
    Primary(u8),
    /// Slot an upgrade for this index is staged in.
    Secondary(u8),
}

/// An open flash area. Offsets passed to [`Flash`] are relative to the start
/// of the area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashArea {
    pub id: FlashAreaId,
    /// Absolute offset of the area within the device.
    pub offset: u32,
    pub size: u32,
}

impl FlashArea {
    /// Checks that `len` bytes starting at `offset` lie inside the area.
    pub fn contains(&self, offset: u32, len: usize) -> bool {
        let Ok(len) = u32::try_from(len) else {
            return false;
        };
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.size)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, counters::Count)]
pub enum FlashError {
    NoSuchArea,
    OutOfBounds,
    Io,
}

pub trait Flash {
    fn open(&mut self, id: FlashAreaId) -> Result<FlashArea, FlashError>;

    fn close(&mut self, area: &FlashArea);

    fn erase(
        &mut self,
        area: &FlashArea,
        offset: u32,
        len: u32,
    ) -> Result<(), FlashError>;

    fn write(
        &mut self,
        area: &FlashArea,
        offset: u32,
        data: &[u8],
    ) -> Result<(), FlashError>;

    fn read(
        &mut self,
        area: &FlashArea,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FlashError>;
}
