// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RAM-backed [`Flash`] for host tests.
//!
//! Memory starts out erased (`0xFF`) and writes can only clear bits, as on
//! NOR flash. Each operation can be made to fail through [`Faults`].

use crate::flash::{Flash, FlashArea, FlashAreaId, FlashError};

/// Most areas a [`RamFlash`] can lay out.
pub const MAX_AREAS: usize = 4;

const ERASED: u8 = 0xFF;

/// Operations that should fail with [`FlashError::Io`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Faults {
    pub open: bool,
    pub erase: bool,
    pub write: bool,
    pub read: bool,
}

pub struct RamFlash<const N: usize> {
    mem: [u8; N],
    areas: [Option<FlashArea>; MAX_AREAS],
    pub faults: Faults,
    pub opens: usize,
    pub closes: usize,
    pub erases: usize,
}

impl<const N: usize> RamFlash<N> {
    /// Builds a device with the given area layout. Areas past
    /// [`MAX_AREAS`] are ignored.
    pub fn new(layout: &[FlashArea]) -> Self {
        let mut areas = [None; MAX_AREAS];
        for (slot, area) in areas.iter_mut().zip(layout) {
            *slot = Some(*area);
        }
        Self {
            mem: [ERASED; N],
            areas,
            faults: Faults::default(),
            opens: 0,
            closes: 0,
            erases: 0,
        }
    }

    /// Primary and secondary slot for image 0, `slot_size` bytes each.
    pub fn single(slot_size: u32) -> Self {
        Self::new(&[
            area(FlashAreaId::Primary(0), 0, slot_size),
            area(FlashAreaId::Secondary(0), slot_size, slot_size),
        ])
    }

    /// Primary and secondary slots for images 0 and 1.
    pub fn dual(slot_size: u32) -> Self {
        Self::new(&[
            area(FlashAreaId::Primary(0), 0, slot_size),
            area(FlashAreaId::Secondary(0), slot_size, slot_size),
            area(FlashAreaId::Primary(1), 2 * slot_size, slot_size),
            area(FlashAreaId::Secondary(1), 3 * slot_size, slot_size),
        ])
    }

    fn lookup(&self, id: FlashAreaId) -> Option<FlashArea> {
        self.areas.iter().flatten().copied().find(|a| a.id == id)
    }

    /// Overwrites bytes of an area directly, bypassing fault injection and
    /// the bit-clearing rule.
    pub fn program(&mut self, id: FlashAreaId, offset: u32, data: &[u8]) {
        let span = self
            .lookup(id)
            .and_then(|a| self.span(&a, offset, data.len()).ok());
        if let Some(r) = span {
            self.mem[r].copy_from_slice(data);
        }
    }

    /// Contents of an area, if it is part of the layout.
    pub fn area_bytes(&self, id: FlashAreaId) -> Option<&[u8]> {
        let a = self.lookup(id)?;
        let r = self.span(&a, 0, a.size as usize).ok()?;
        Some(&self.mem[r])
    }

    fn span(
        &self,
        area: &FlashArea,
        offset: u32,
        len: usize,
    ) -> Result<core::ops::Range<usize>, FlashError> {
        if !area.contains(offset, len) {
            return Err(FlashError::OutOfBounds);
        }
        let start = area.offset as usize + offset as usize;
        let end = start + len;
        if end > N {
            return Err(FlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

fn area(id: FlashAreaId, offset: u32, size: u32) -> FlashArea {
    FlashArea { id, offset, size }
}

impl<const N: usize> Flash for RamFlash<N> {
    fn open(&mut self, id: FlashAreaId) -> Result<FlashArea, FlashError> {
        if self.faults.open {
            return Err(FlashError::Io);
        }
        let a = self.lookup(id).ok_or(FlashError::NoSuchArea)?;
        self.opens += 1;
        Ok(a)
    }

    fn close(&mut self, _area: &FlashArea) {
        self.closes += 1;
    }

    fn erase(
        &mut self,
        area: &FlashArea,
        offset: u32,
        len: u32,
    ) -> Result<(), FlashError> {
        if self.faults.erase {
            return Err(FlashError::Io);
        }
        let r = self.span(area, offset, len as usize)?;
        self.mem[r].fill(ERASED);
        self.erases += 1;
        Ok(())
    }

    fn write(
        &mut self,
        area: &FlashArea,
        offset: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        if self.faults.write {
            return Err(FlashError::Io);
        }
        let r = self.span(area, offset, data.len())?;
        for (m, d) in self.mem[r].iter_mut().zip(data) {
            *m &= *d;
        }
        Ok(())
    }

    fn read(
        &mut self,
        area: &FlashArea,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FlashError> {
        if self.faults.read {
            return Err(FlashError::Io);
        }
        let r = self.span(area, offset, buf.len())?;
        buf.copy_from_slice(&self.mem[r]);
        Ok(())
    }
}
