//! VFAT long-name fragments.
//!
//! A long name is split into 13-unit UTF-16 pieces, each stored in a 32-byte
//! slot that overlays a short entry with attribute byte 0x0F. Fragments sit
//! immediately before their short entry, highest ordinal first; the first one
//! on disk carries the 0x40 "last" flag.

use crate::error::{FatError, Result};

use super::{
    entry::{ATTR_LONG_NAME, DIR_ENTRY_SIZE},
    short_name::ShortName,
};

pub const CHARS_PER_FRAGMENT: usize = 13;
pub const MAX_FRAGMENTS: usize = 20;
pub const MAX_LONG_NAME_UNITS: usize = 255;

const LAST_FRAGMENT_FLAG: u8 = 0x40;
const ORDINAL_MASK: u8 = 0x1F;
const OFFSET_ATTRIBUTES: usize = 11;
const OFFSET_CHECKSUM: usize = 13;
const CHAR_OFFSETS: [usize; CHARS_PER_FRAGMENT] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

pub type FragmentGroup = heapless::Vec<LongNameFragment, MAX_FRAGMENTS>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LongNameFragment {
    /// 1-based position of this piece within the name.
    pub ordinal: u8,
    pub is_last: bool,
    pub checksum: u8,
    pub units: [u16; CHARS_PER_FRAGMENT],
}

impl LongNameFragment {
    pub fn parse(raw: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut units = [0u16; CHARS_PER_FRAGMENT];
        for (unit, offset) in units.iter_mut().zip(CHAR_OFFSETS) {
            *unit = u16::from_le_bytes([raw[offset], raw[offset + 1]]);
        }
        Self {
            ordinal: raw[0] & ORDINAL_MASK,
            is_last: raw[0] & LAST_FRAGMENT_FLAG != 0,
            checksum: raw[OFFSET_CHECKSUM],
            units,
        }
    }

    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[0] = self.ordinal
            | if self.is_last {
                LAST_FRAGMENT_FLAG
            } else {
                0
            };
        raw[OFFSET_ATTRIBUTES] = ATTR_LONG_NAME;
        raw[OFFSET_CHECKSUM] = self.checksum;
        for (unit, offset) in self.units.iter().zip(CHAR_OFFSETS) {
            raw[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
        }
        raw
    }
}

/// Builds the fragments for `name` in on-disk order. The name is terminated
/// by 0x0000 when it does not fill the final fragment, then padded with
/// 0xFFFF.
pub fn fragments_for(name: &str, checksum: u8) -> Result<FragmentGroup> {
    let units = name.encode_utf16().collect::<Vec<_>>();
    if units.is_empty() {
        return Err(FatError::InvalidName);
    }
    if units.len() > MAX_LONG_NAME_UNITS {
        return Err(FatError::NameTooLong);
    }

    let count = units.len().div_ceil(CHARS_PER_FRAGMENT);
    let mut group = FragmentGroup::new();
    for index in (0..count).rev() {
        let start = index * CHARS_PER_FRAGMENT;
        let mut piece = [0xFFFFu16; CHARS_PER_FRAGMENT];
        for (slot, value) in piece.iter_mut().enumerate() {
            let pos = start + slot;
            if pos < units.len() {
                *value = units[pos];
            } else if pos == units.len() {
                *value = 0x0000;
            }
        }
        let fragment = LongNameFragment {
            ordinal: (index + 1) as u8,
            is_last: index + 1 == count,
            checksum,
            units: piece,
        };
        group
            .push(fragment)
            .map_err(|_| FatError::NameTooLong)?;
    }
    Ok(group)
}

/// Reassembles a long name from fragments in on-disk order and checks them
/// against the short entry they precede.
pub fn assemble(fragments: &[LongNameFragment], short_name: &ShortName) -> Result<String> {
    let count = fragments.len();
    if count == 0 || count > MAX_FRAGMENTS {
        return Err(FatError::CorruptEntry("long name fragment count"));
    }
    let checksum = short_name.checksum();
    for (position, fragment) in fragments.iter().enumerate() {
        let expected = (count - position) as u8;
        if fragment.ordinal != expected || fragment.is_last != (position == 0) {
            return Err(FatError::CorruptEntry("long name fragment out of sequence"));
        }
        if fragment.checksum != checksum {
            return Err(FatError::CorruptEntry("long name checksum mismatch"));
        }
    }

    let mut units = Vec::with_capacity(count * CHARS_PER_FRAGMENT);
    'outer: for fragment in fragments.iter().rev() {
        for unit in fragment.units.iter() {
            if *unit == 0x0000 {
                break 'outer;
            }
            units.push(*unit);
        }
    }
    // Padding after a full final fragment is tolerated.
    while units.last() == Some(&0xFFFF) {
        units.pop();
    }
    if units.is_empty() {
        return Err(FatError::CorruptEntry("empty long name"));
    }
    Ok(char::decode_utf16(units.iter().copied())
        .map(|ch| ch.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}
