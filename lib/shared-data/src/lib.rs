// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-to-runtime shared data region.
//!
//! The bootloader leaves a small block of RAM behind describing the images it
//! booted. The block starts with a [`RegionHeader`] and is followed by tightly
//! packed type-length-value entries:
//!
//! ```text
//! +-----------+-------------+---------+-----------+-------------+------
//! | magic u32 | total_len u16 | type u16 | len u16 | value[len] | ...
//! +-----------+-------------+---------+-----------+-------------+------
//! ```
//!
//! All integers are little-endian. `total_len` includes the header itself.
//! An entry type is split into a `major` byte, naming the consumer of the
//! entry, and a `minor` byte, naming what the entry holds.
//!
//! [`SharedDataWriter`] is used on the bootloader side to append entries and
//! [`SharedDataReader`] is used on the runtime side to scan them. Neither one
//! cares where the region lives; callers hand in a slice, or an address range
//! through the `from_addr` constructors.

#![cfg_attr(not(test), no_std)]

use core::ops::Range;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

/// Value of [`RegionHeader::magic`] in an initialized region.
pub const SHARED_DATA_TLV_INFO_MAGIC: u32 = 0x2016;

/// Size of the region header in bytes.
pub const HEADER_SIZE: usize = core::mem::size_of::<RegionHeader>();

/// Size of a single entry header in bytes.
pub const ENTRY_HEADER_SIZE: usize = core::mem::size_of::<EntryHeader>();

/// Errors produced while adding to or scanning a shared data region.
#[derive(Copy, Clone, Debug, Eq, PartialEq, counters::Count)]
pub enum ShareError {
    /// An entry with the same `(major, minor)` type is already present.
    AlreadyExists,
    /// The new total length does not fit in the 16-bit length field.
    LengthOverflow,
    /// The new total length does not fit in the region.
    CapacityExceeded,
    /// The region does not start with [`SHARED_DATA_TLV_INFO_MAGIC`].
    BadMagic,
    /// The header declares a length shorter than itself or longer than the
    /// region.
    BadLength,
    /// No entry with the requested type precedes the declared end.
    NotFound,
    /// An entry claims more bytes than remain before the declared end.
    Truncated,
}

#[derive(
    Copy,
    Clone,
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct RegionHeader {
    pub magic: U32,
    pub total_len: U16,
}

#[derive(
    Copy,
    Clone,
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct EntryHeader {
    pub tlv_type: U16,
    pub len: U16,
}

const_assert_eq!(core::mem::size_of::<RegionHeader>(), 6);
const_assert_eq!(core::mem::size_of::<EntryHeader>(), 4);

/// Entry type: a `major` consumer id and a `minor` item id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TlvType {
    major: u8,
    minor: u8,
}

impl TlvType {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self {
            major: (raw >> 8) as u8,
            minor: raw as u8,
        }
    }

    pub const fn raw(self) -> u16 {
        ((self.major as u16) << 8) | self.minor as u16
    }

    pub const fn major(self) -> u8 {
        self.major
    }

    pub const fn minor(self) -> u8 {
        self.minor
    }
}

/// One entry found while scanning a region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TlvEntry<'a> {
    pub tlv_type: TlvType,
    pub value: &'a [u8],
}

/// Returns the declared total length of an initialized region, checking the
/// magic and that the length lies within `HEADER_SIZE..=region.len()`.
fn declared_len(region: &[u8]) -> Result<usize, ShareError> {
    let (header, _) = RegionHeader::read_from_prefix(region)
        .map_err(|_| ShareError::BadMagic)?;
    if header.magic.get() != SHARED_DATA_TLV_INFO_MAGIC {
        return Err(ShareError::BadMagic);
    }
    let total = usize::from(header.total_len.get());
    if total < HEADER_SIZE || total > region.len() {
        return Err(ShareError::BadLength);
    }
    Ok(total)
}

/// Looks up the first entry of type `(major, minor)` in `region`.
///
/// An uninitialized region simply has no entries, so this reports
/// [`ShareError::NotFound`] rather than [`ShareError::BadMagic`].
pub fn lookup(
    region: &[u8],
    major: u8,
    minor: u8,
) -> Result<&[u8], ShareError> {
    match SharedDataReader::new(region) {
        Ok(reader) => reader.lookup(major, minor),
        Err(ShareError::BadMagic) => Err(ShareError::NotFound),
        Err(e) => Err(e),
    }
}

/// Read-only view of an initialized region.
#[derive(Copy, Clone, Debug)]
pub struct SharedDataReader<'a> {
    // Only the bytes up to the declared total length.
    data: &'a [u8],
}

impl<'a> SharedDataReader<'a> {
    pub fn new(region: &'a [u8]) -> Result<Self, ShareError> {
        let total = declared_len(region)?;
        Ok(Self {
            data: &region[..total],
        })
    }

    /// Builds a reader over the memory in `range`.
    ///
    /// # Safety
    ///
    /// `range` must denote readable memory that nothing writes to for the
    /// lifetime `'a`.
    pub unsafe fn from_addr(range: Range<usize>) -> Result<Self, ShareError> {
        let region = unsafe {
            core::slice::from_raw_parts(
                range.start as *const u8,
                range.end.saturating_sub(range.start),
            )
        };
        Self::new(region)
    }

    /// Declared length of the region, header included.
    pub fn total_len(&self) -> usize {
        self.data.len()
    }

    /// The region bytes up to the declared end.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Returns a fresh iterator over the entries.
    pub fn iter(&self) -> TlvIter<'a> {
        TlvIter {
            data: self.data,
            offset: HEADER_SIZE,
        }
    }

    /// Entries up to the declared end, stopping silently at a truncated one.
    pub fn scan(&self) -> impl Iterator<Item = TlvEntry<'a>> {
        // Nothing beyond a truncated entry can be trusted.
        self.iter().map_while(Result::ok)
    }

    pub fn lookup(
        &self,
        major: u8,
        minor: u8,
    ) -> Result<&'a [u8], ShareError> {
        let want = TlvType::new(major, minor);
        self.scan()
            .find(|e| e.tlv_type == want)
            .map(|e| e.value)
            .ok_or(ShareError::NotFound)
    }

    /// Copies every entry with the given `major` into `dest` as a new,
    /// self-contained region. Returns the total length of the new region.
    pub fn copy_major(
        &self,
        major: u8,
        dest: &mut [u8],
    ) -> Result<usize, ShareError> {
        let mut out = SharedDataWriter::new(dest);
        out.clear()?;
        for entry in self.iter() {
            let entry = entry?;
            if entry.tlv_type.major() == major {
                out.add(major, entry.tlv_type.minor(), entry.value)?;
            }
        }
        out.total_len().ok_or(ShareError::BadMagic)
    }
}

impl<'a> IntoIterator for &SharedDataReader<'a> {
    type Item = Result<TlvEntry<'a>, ShareError>;
    type IntoIter = TlvIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the entries of a region.
///
/// Yields `Err(ShareError::Truncated)` once if an entry runs past the declared
/// end, and nothing after that.
#[derive(Clone, Debug)]
pub struct TlvIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<TlvEntry<'a>, ShareError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.offset..)?;
        if rest.is_empty() {
            return None;
        }

        // Copy the header out rather than casting in place; the region has
        // no alignment guarantees.
        let Ok((header, body)) = EntryHeader::read_from_prefix(rest) else {
            self.offset = self.data.len();
            return Some(Err(ShareError::Truncated));
        };
        let len = usize::from(header.len.get());
        let Some(value) = body.get(..len) else {
            self.offset = self.data.len();
            return Some(Err(ShareError::Truncated));
        };

        self.offset += ENTRY_HEADER_SIZE + len;
        Some(Ok(TlvEntry {
            tlv_type: TlvType::from_raw(header.tlv_type.get()),
            value,
        }))
    }
}

/// Append-only writer over a region. The slice length is the capacity.
#[derive(Debug)]
pub struct SharedDataWriter<'a> {
    region: &'a mut [u8],
}

impl<'a> SharedDataWriter<'a> {
    pub fn new(region: &'a mut [u8]) -> Self {
        Self { region }
    }

    /// Builds a writer over the memory in `range`.
    ///
    /// # Safety
    ///
    /// `range` must denote writable memory that is not otherwise referenced
    /// for the lifetime `'a`.
    pub unsafe fn from_addr(range: Range<usize>) -> Self {
        let region = unsafe {
            core::slice::from_raw_parts_mut(
                range.start as *mut u8,
                range.end.saturating_sub(range.start),
            )
        };
        Self::new(region)
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Declared total length, or `None` if the region is not initialized.
    pub fn total_len(&self) -> Option<usize> {
        declared_len(self.region).ok()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.region
    }

    pub fn reader(&self) -> Result<SharedDataReader<'_>, ShareError> {
        SharedDataReader::new(self.region)
    }

    pub fn lookup(&self, major: u8, minor: u8) -> Result<&[u8], ShareError> {
        lookup(self.region, major, minor)
    }

    /// Writes an empty header, discarding any entries.
    pub fn clear(&mut self) -> Result<(), ShareError> {
        self.write_header(HEADER_SIZE)
    }

    /// Appends one entry.
    ///
    /// The header is written on first use. Existing entries are walked in
    /// full, so a truncated one fails the add with `Truncated`. On error the
    /// region is left untouched, including the header of a region that was
    /// never initialized.
    pub fn add(
        &mut self,
        major: u8,
        minor: u8,
        payload: &[u8],
    ) -> Result<(), ShareError> {
        if self.region.len() < HEADER_SIZE {
            return Err(ShareError::CapacityExceeded);
        }

        let total = match declared_len(self.region) {
            Ok(total) => {
                let reader = SharedDataReader {
                    data: &self.region[..total],
                };
                let tlv_type = TlvType::new(major, minor);
                for entry in reader.iter() {
                    if entry?.tlv_type == tlv_type {
                        return Err(ShareError::AlreadyExists);
                    }
                }
                total
            }
            Err(ShareError::BadMagic) => HEADER_SIZE,
            Err(e) => return Err(e),
        };

        let new_total = total
            .checked_add(ENTRY_HEADER_SIZE)
            .and_then(|t| t.checked_add(payload.len()))
            .ok_or(ShareError::LengthOverflow)?;
        if new_total > usize::from(u16::MAX) {
            return Err(ShareError::LengthOverflow);
        }
        if new_total > self.region.len() {
            return Err(ShareError::CapacityExceeded);
        }

        let header = EntryHeader {
            tlv_type: U16::new(TlvType::new(major, minor).raw()),
            // new_total fits in u16, so does the payload length
            len: U16::new(payload.len() as u16),
        };
        let value_start = total + ENTRY_HEADER_SIZE;
        self.region[total..value_start].copy_from_slice(header.as_bytes());
        self.region[value_start..new_total].copy_from_slice(payload);

        self.write_header(new_total)
    }

    fn write_header(&mut self, total: usize) -> Result<(), ShareError> {
        let total =
            u16::try_from(total).map_err(|_| ShareError::LengthOverflow)?;
        let header = RegionHeader {
            magic: U32::new(SHARED_DATA_TLV_INFO_MAGIC),
            total_len: U16::new(total),
        };
        self.region
            .get_mut(..HEADER_SIZE)
            .ok_or(ShareError::CapacityExceeded)?
            .copy_from_slice(header.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::{btree_map, vec};
    use proptest::prelude::*;

    const VERSION: [u8; 8] = [1, 2, 3, 0, 4, 0, 0, 0];

    #[test]
    fn first_add_initializes_header() {
        let mut buf = [0u8; 64];
        let mut w = SharedDataWriter::new(&mut buf);
        assert_eq!(w.total_len(), None);

        w.add(2, 0x41, &VERSION).unwrap();

        assert_eq!(w.total_len(), Some(HEADER_SIZE + ENTRY_HEADER_SIZE + 8));
        assert_eq!(w.lookup(2, 0x41), Ok(&VERSION[..]));
        assert_eq!(&buf[..4], &0x2016u32.to_le_bytes());
        assert_eq!(&buf[4..6], &18u16.to_le_bytes());
        // type = major << 8 | minor, then length
        assert_eq!(&buf[6..10], &[0x41, 0x02, 8, 0]);
        assert_eq!(&buf[10..18], &VERSION);
    }

    #[test]
    fn duplicate_add_fails_and_leaves_region() {
        let mut buf = [0u8; 64];
        let mut w = SharedDataWriter::new(&mut buf);
        w.add(2, 1, &[0xaa]).unwrap();
        let before = w.as_bytes().to_vec();

        assert_eq!(w.add(2, 1, &[0xbb, 0xcc]), Err(ShareError::AlreadyExists));
        assert_eq!(w.as_bytes(), &before[..]);

        // Same minor under another major is a different type.
        w.add(3, 1, &[0xbb]).unwrap();
    }

    #[test]
    fn capacity_and_length_overflow_are_distinct() {
        let mut small = [0u8; 16];
        let mut w = SharedDataWriter::new(&mut small);
        assert_eq!(w.add(1, 1, &[0; 7]), Err(ShareError::CapacityExceeded));
        assert_eq!(w.total_len(), None);
        assert!(w.as_bytes().iter().all(|&b| b == 0));
        w.add(1, 1, &[0; 6]).unwrap();
        assert_eq!(w.add(1, 2, &[]), Err(ShareError::CapacityExceeded));

        let mut big = vec![0u8; 0x2_0000];
        let mut w = SharedDataWriter::new(&mut big);
        let payload = vec![0x5a; 0xfff0];
        w.add(1, 1, &payload).unwrap();
        assert_eq!(w.add(1, 2, &payload), Err(ShareError::LengthOverflow));
    }

    #[test]
    fn lookup_without_magic_is_not_found() {
        let buf = [0u8; 32];
        assert_eq!(lookup(&buf, 2, 0x41), Err(ShareError::NotFound));
        assert_eq!(
            SharedDataReader::new(&buf).unwrap_err(),
            ShareError::BadMagic
        );
    }

    #[test]
    fn reader_rejects_length_past_region() {
        let mut buf = [0u8; 32];
        SharedDataWriter::new(&mut buf).add(1, 1, &[1, 2]).unwrap();
        buf[4..6].copy_from_slice(&40u16.to_le_bytes());
        assert_eq!(
            SharedDataReader::new(&buf).unwrap_err(),
            ShareError::BadLength
        );
    }

    #[test]
    fn scan_stops_at_declared_end() {
        let mut buf = [0u8; 64];
        let mut w = SharedDataWriter::new(&mut buf);
        w.add(1, 1, &[1, 1]).unwrap();
        w.add(1, 2, &[2, 2, 2]).unwrap();

        // Claim the second entry's payload is longer than what was declared.
        let second = HEADER_SIZE + ENTRY_HEADER_SIZE + 2;
        buf[second + 2..second + 4].copy_from_slice(&9u16.to_le_bytes());

        let r = SharedDataReader::new(&buf).unwrap();
        let entries: Vec<_> = r.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            Ok(TlvEntry {
                tlv_type: TlvType::new(1, 1),
                value: &[1, 1],
            })
        );
        assert_eq!(entries[1], Err(ShareError::Truncated));
        assert_eq!(r.scan().count(), 1);
        assert_eq!(r.lookup(1, 2), Err(ShareError::NotFound));
        assert_eq!(r.lookup(1, 1), Ok(&[1u8, 1][..]));
    }

    #[test]
    fn add_refuses_region_with_truncated_entry() {
        let mut buf = [0u8; 64];
        let mut w = SharedDataWriter::new(&mut buf);
        w.add(1, 1, &[1, 1]).unwrap();
        w.add(1, 2, &[2, 2, 2]).unwrap();

        let second = HEADER_SIZE + ENTRY_HEADER_SIZE + 2;
        buf[second + 2..second + 4].copy_from_slice(&9u16.to_le_bytes());
        let before = buf;

        // A new key and a key hidden behind the bad entry both fail.
        let mut w = SharedDataWriter::new(&mut buf);
        assert_eq!(w.add(7, 7, &[7]), Err(ShareError::Truncated));
        assert_eq!(w.add(1, 2, &[2]), Err(ShareError::Truncated));
        assert_eq!(buf, before);
    }

    #[test]
    fn from_addr_over_local_memory() {
        let mut buf = [0u8; 48];
        let range = {
            let start = buf.as_mut_ptr() as usize;
            start..start + buf.len()
        };

        {
            let mut w = unsafe { SharedDataWriter::from_addr(range.clone()) };
            assert_eq!(w.capacity(), 48);
            w.add(2, 5, &VERSION).unwrap();
            assert_eq!(
                w.add(2, 5, &VERSION),
                Err(ShareError::AlreadyExists)
            );
        }

        let r = unsafe { SharedDataReader::from_addr(range.clone()) }.unwrap();
        assert_eq!(r.total_len(), HEADER_SIZE + ENTRY_HEADER_SIZE + 8);
        assert_eq!(r.lookup(2, 5), Ok(&VERSION[..]));

        // A range shorter than the declared length is refused.
        let short = range.start..range.start + HEADER_SIZE + 2;
        assert!(unsafe { SharedDataReader::from_addr(short) }.is_err());
    }

    #[test]
    fn scan_is_restartable() {
        let mut buf = [0u8; 64];
        let mut w = SharedDataWriter::new(&mut buf);
        w.add(4, 0, &[0]).unwrap();
        w.add(4, 1, &[1]).unwrap();
        let r = w.reader().unwrap();
        assert_eq!(r.iter().count(), 2);
        assert_eq!((&r).into_iter().count(), 2);
    }

    #[test]
    fn copy_major_filters_entries() {
        let mut buf = [0u8; 64];
        let mut w = SharedDataWriter::new(&mut buf);
        w.add(1, 0, &[0xa]).unwrap();
        w.add(2, 0x05, &VERSION).unwrap();
        w.add(3, 0, &[0xb]).unwrap();
        w.add(2, 0x45, &VERSION).unwrap();

        let mut dest = [0xffu8; 48];
        let len = w.reader().unwrap().copy_major(2, &mut dest).unwrap();
        assert_eq!(len, HEADER_SIZE + 2 * (ENTRY_HEADER_SIZE + 8));

        let copy = SharedDataReader::new(&dest).unwrap();
        assert_eq!(copy.iter().count(), 2);
        assert_eq!(copy.lookup(2, 0x45), Ok(&VERSION[..]));
        assert_eq!(copy.lookup(1, 0), Err(ShareError::NotFound));

        let mut tiny = [0u8; 12];
        assert_eq!(
            w.reader().unwrap().copy_major(2, &mut tiny),
            Err(ShareError::CapacityExceeded)
        );
    }

    #[test]
    fn tlv_type_packing() {
        let t = TlvType::from_raw(0x0241);
        assert_eq!(t.major(), 2);
        assert_eq!(t.minor(), 0x41);
        assert_eq!(t.raw(), 0x0241);
    }

    proptest! {
        #[test]
        fn distinct_adds_are_all_found(
            entries in btree_map(
                (any::<u8>(), any::<u8>()),
                vec(any::<u8>(), 0..32),
                0..16,
            )
        ) {
            let mut buf = [0u8; 1024];
            let mut w = SharedDataWriter::new(&mut buf);
            for (&(major, minor), payload) in &entries {
                prop_assert_eq!(w.add(major, minor, payload), Ok(()));
            }
            for (&(major, minor), payload) in &entries {
                prop_assert_eq!(w.lookup(major, minor), Ok(&payload[..]));
            }
        }

        #[test]
        fn failed_add_does_not_mutate(
            payload in vec(any::<u8>(), 0..64),
            extra in 1usize..64,
        ) {
            let mut buf = vec![0u8; HEADER_SIZE + ENTRY_HEADER_SIZE + 64];
            let mut w = SharedDataWriter::new(&mut buf);
            w.add(7, 7, &payload).unwrap();
            let before = w.as_bytes().to_vec();

            prop_assert_eq!(w.add(7, 7, &[1]), Err(ShareError::AlreadyExists));
            prop_assert_eq!(w.as_bytes(), &before[..]);

            let room = w.capacity() - w.total_len().unwrap();
            let too_big = vec![0u8; room + extra];
            prop_assert_eq!(
                w.add(7, 8, &too_big),
                Err(ShareError::CapacityExceeded)
            );
            prop_assert_eq!(w.as_bytes(), &before[..]);
        }
    }
}
