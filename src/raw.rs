//! Bit-exact layouts of the swap header and record header.
//!
//! Flash bits can only be cleared without an erase, so every flag is stored inverted: a set bit
//! means the event is still pending, a cleared bit means it happened. All multibyte fields are
//! little endian.

use crate::platform::FnCrc32;
use core::fmt::{Debug, Formatter};

/// Largest payload of a single record.
pub const MAX_VALUE_SIZE: usize = 255;

pub(crate) const RECORD_HEADER_SIZE: usize = 8;
pub(crate) const MAX_SWAP_HEADER_SIZE: usize = 8;
pub(crate) const MAX_RECORD_SIZE: usize = RECORD_HEADER_SIZE + MAX_VALUE_SIZE + 1;

/// Offset of the flags within the record header, the only field rewritten in place.
pub(crate) const RECORD_FLAGS_OFFSET: usize = 2;
pub(crate) const RECORD_FLAGS_SIZE: usize = 2;

const FLAG_ADD_BEGIN: u16 = 1 << 0;
const FLAG_ADD_COMPLETE: u16 = 1 << 1;
const FLAG_DELETE: u16 = 1 << 2;
const FLAG_FIRST: u16 = 1 << 3;
const FLAGS_UNUSED: u16 = 0x0FF0;
const FLAGS_TAG_SHIFT: u16 = 12;

const MARKER_TAG_SHIFT: u32 = 28;
const MARKER_PATTERN_MASK: u32 = 0x0FFF_FFFF;
const MARKER_ACTIVE: u32 = 0x0e5c_c5ef;
// Deactivation only clears bits, so it can be done in place.
const MARKER_INACTIVE: u32 = MARKER_ACTIVE & !0b11;

/// On-media format of a swap area. It is resolved once from the swap header marker and decides
/// the word size and which integrity features the area carries.
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Format {
    /// 4-byte marker only, 4-byte alignment, no checksum and no erase counter. Only ever read and
    /// migrated away from.
    Legacy = 0xB,
    /// 8-byte swap header with erase counter, 8-byte alignment and a record checksum.
    V1 = 0xE,
}

impl Format {
    /// The format every write produces.
    pub(crate) const CURRENT: Format = Format::V1;

    pub(crate) const fn swap_header_size(self) -> u32 {
        match self {
            Format::Legacy => 4,
            Format::V1 => 8,
        }
    }

    pub(crate) const fn word_size(self) -> u32 {
        match self {
            Format::Legacy => 4,
            Format::V1 => 8,
        }
    }

    pub(crate) const fn has_checksum(self) -> bool {
        matches!(self, Format::V1)
    }

    pub(crate) const fn has_erase_counter(self) -> bool {
        matches!(self, Format::V1)
    }

    /// Legacy areas cannot be marked inactive and have to be erased instead.
    pub(crate) const fn deactivates_in_place(self) -> bool {
        matches!(self, Format::V1)
    }

    /// Upper nibble of the record flags.
    const fn record_tag(self) -> u16 {
        match self {
            Format::Legacy => 0xF,
            Format::V1 => Format::V1 as u16,
        }
    }

    pub(crate) const fn align(self, size: u32) -> u32 {
        let mask = self.word_size() - 1;
        (size + mask) & !mask
    }
}

/// Stored at offset 0 of each swap area.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct SwapHeader {
    marker: u32,
    erase_counter: u32,
}

impl SwapHeader {
    pub(crate) fn active(format: Format, erase_counter: u32) -> Self {
        Self {
            marker: ((format as u32) << MARKER_TAG_SHIFT) | MARKER_ACTIVE,
            erase_counter,
        }
    }

    pub(crate) fn from_bytes(raw: [u8; MAX_SWAP_HEADER_SIZE]) -> Self {
        let [m0, m1, m2, m3, c0, c1, c2, c3] = raw;
        Self {
            marker: u32::from_le_bytes([m0, m1, m2, m3]),
            erase_counter: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; MAX_SWAP_HEADER_SIZE] {
        let mut raw = [0xFFu8; MAX_SWAP_HEADER_SIZE];
        raw[..4].copy_from_slice(&self.marker.to_le_bytes());
        raw[4..].copy_from_slice(&self.erase_counter.to_le_bytes());
        raw
    }

    /// The format of the area if the marker says it is the live one.
    pub(crate) fn active_format(&self) -> Option<Format> {
        if self.marker & MARKER_PATTERN_MASK != MARKER_ACTIVE {
            return None;
        }
        Format::from_repr((self.marker >> MARKER_TAG_SHIFT) as u8)
    }

    /// Legacy areas have no counter, they count as never erased.
    pub(crate) fn erase_counter(&self, format: Format) -> u32 {
        if format.has_erase_counter() {
            self.erase_counter
        } else {
            0
        }
    }

    /// The marker word with the liveness bits cleared, written over the existing marker.
    pub(crate) fn inactive_marker(&self) -> [u8; 4] {
        ((self.marker & !MARKER_PATTERN_MASK) | MARKER_INACTIVE).to_le_bytes()
    }
}

impl Debug for SwapHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let marker = self.marker;
        let erase_counter = self.erase_counter;
        f.write_fmt(format_args!(
            "SwapHeader {{ marker: 0x{marker:0>8x}, erase_counter: {erase_counter} }}"
        ))
    }
}

/// What a record header says about the record it precedes.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum RecordState {
    /// Never written, the log ends here.
    Free,
    /// The write of this record was interrupted.
    Torn,
    /// The header does not belong to this format or its fields are out of range.
    Corrupt,
    Valid,
    Deleted,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub(crate) key: u16,
    flags: u16,
    pub(crate) length: u16,
    checksum: u16,
}

impl RecordHeader {
    /// A header whose write has started but is not complete yet.
    pub(crate) fn new(format: Format, key: u16, length: u16, first: bool) -> Self {
        let mut flags = (u16::MAX & !(0xF << FLAGS_TAG_SHIFT))
            | (format.record_tag() << FLAGS_TAG_SHIFT);
        flags &= !FLAG_ADD_BEGIN;
        if first {
            flags &= !FLAG_FIRST;
        }
        Self {
            key,
            flags,
            length,
            checksum: u16::MAX,
        }
    }

    pub(crate) fn from_bytes(raw: [u8; RECORD_HEADER_SIZE]) -> Self {
        let [k0, k1, f0, f1, l0, l1, c0, c1] = raw;
        Self {
            key: u16::from_le_bytes([k0, k1]),
            flags: u16::from_le_bytes([f0, f1]),
            length: u16::from_le_bytes([l0, l1]),
            checksum: u16::from_le_bytes([c0, c1]),
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; RECORD_HEADER_SIZE] {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        raw[0..2].copy_from_slice(&self.key.to_le_bytes());
        raw[2..4].copy_from_slice(&self.flags.to_le_bytes());
        raw[4..6].copy_from_slice(&self.length.to_le_bytes());
        raw[6..8].copy_from_slice(&self.checksum.to_le_bytes());
        raw
    }

    /// Header plus payload rounded up to the word size of the format.
    pub(crate) fn size(&self, format: Format) -> u32 {
        RECORD_HEADER_SIZE as u32 + format.align(self.length as u32)
    }

    pub(crate) fn state(&self, format: Format) -> RecordState {
        if self.to_bytes() == [0xFF; RECORD_HEADER_SIZE] {
            return RecordState::Free;
        }
        if self.flags & FLAG_ADD_BEGIN != 0 {
            return RecordState::Torn;
        }
        if self.flags >> FLAGS_TAG_SHIFT != format.record_tag()
            || self.flags & FLAGS_UNUSED != FLAGS_UNUSED
            || self.length as usize > MAX_VALUE_SIZE
        {
            return RecordState::Corrupt;
        }
        if self.flags & FLAG_ADD_COMPLETE != 0 {
            return RecordState::Torn;
        }
        if self.flags & FLAG_DELETE == 0 {
            RecordState::Deleted
        } else {
            RecordState::Valid
        }
    }

    /// The write completed and the record has not been deleted.
    pub(crate) fn is_valid(&self) -> bool {
        self.flags & (FLAG_ADD_COMPLETE | FLAG_DELETE) == FLAG_DELETE
    }

    pub(crate) fn is_first(&self) -> bool {
        self.flags & FLAG_FIRST == 0
    }

    pub(crate) fn set_add_complete(&mut self) {
        self.flags &= !FLAG_ADD_COMPLETE;
    }

    pub(crate) fn set_deleted(&mut self) {
        self.flags &= !FLAG_DELETE;
    }

    pub(crate) fn seal(&mut self, format: Format, crc32: FnCrc32, payload: &[u8]) {
        if format.has_checksum() {
            self.checksum = Self::calculate_checksum(crc32, self.key, self.length, payload);
        }
    }

    /// Legacy records carry no checksum and always pass.
    pub(crate) fn verify(&self, format: Format, crc32: FnCrc32, payload: &[u8]) -> bool {
        !format.has_checksum()
            || self.checksum == Self::calculate_checksum(crc32, self.key, self.length, payload)
    }

    /// The flags are excluded so that they can be cleared later on without invalidating the
    /// checksum.
    fn calculate_checksum(crc32: FnCrc32, key: u16, length: u16, payload: &[u8]) -> u16 {
        let mut result = u32::MAX;
        result = crc32(result, &key.to_le_bytes());
        result = crc32(result, &length.to_le_bytes());
        result = crc32(result, payload);
        (result as u16) ^ ((result >> 16) as u16)
    }
}

impl Debug for RecordHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let key = self.key;
        let flags = self.flags;
        let length = self.length;
        let checksum = self.checksum;
        f.write_fmt(format_args!("RecordHeader {{ key: 0x{key:0>4x}, flags: 0b{flags:0>16b}, length: {length:>3}, checksum: 0x{checksum:0>4x} }}"))
    }
}
