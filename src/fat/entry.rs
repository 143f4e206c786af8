//! 32-byte short directory entry codec, attributes and DOS timestamps.

use bitflags::bitflags;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use super::{
    lfn::LongNameFragment,
    short_name::ShortName,
    variant::FatVariant,
};

pub use super::boot_sector::DIR_ENTRY_SIZE;
pub const END_MARKER: u8 = 0x00;
pub const DELETED_MARKER: u8 = 0xE5;
/// On-disk stand-in for a leading 0xE5 name byte.
const KANJI_ESCAPE: u8 = 0x05;
/// Attribute byte of a long-name fragment.
pub const ATTR_LONG_NAME: u8 = 0x0F;

const LOWERCASE_BASE: u8 = 0x08;
const LOWERCASE_EXT: u8 = 0x10;

const OFFSET_ATTRIBUTES: usize = 0x0B;
const OFFSET_CASE: usize = 0x0C;
const OFFSET_CREATED_TENTHS: usize = 0x0D;
const OFFSET_CREATED_TIME: usize = 0x0E;
const OFFSET_CREATED_DATE: usize = 0x10;
const OFFSET_ACCESSED_DATE: usize = 0x12;
const OFFSET_CLUSTER_HIGH: usize = 0x14;
const OFFSET_MODIFIED_TIME: usize = 0x16;
const OFFSET_MODIFIED_DATE: usize = 0x18;
const OFFSET_CLUSTER_LOW: usize = 0x1A;
const OFFSET_LENGTH: usize = 0x1C;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_LABEL = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// True when the raw attribute byte marks a long-name fragment rather than a
/// real entry.
pub fn is_lfn_fragment(raw_attributes: u8) -> bool {
    raw_attributes & ATTR_LONG_NAME == ATTR_LONG_NAME
}

/// Packed DOS date and time (two-second resolution).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DosDateTime {
    pub date: u16,
    pub time: u16,
}

const DOS_EPOCH_YEAR: i32 = 1980;

pub fn encode_dos_date(date: NaiveDate) -> u16 {
    let year = (date.year() - DOS_EPOCH_YEAR).clamp(0, 127) as u16;
    (year << 9) | ((date.month() as u16) << 5) | date.day() as u16
}

pub fn decode_dos_date(raw: u16) -> Option<NaiveDate> {
    let year = DOS_EPOCH_YEAR + (raw >> 9) as i32;
    let month = ((raw >> 5) & 0x0F) as u32;
    let day = (raw & 0x1F) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
}

impl DosDateTime {
    pub fn from_naive(value: NaiveDateTime) -> Self {
        let time = ((value.hour() as u16) << 11)
            | ((value.minute() as u16) << 5)
            | (value.second() as u16 / 2);
        Self {
            date: encode_dos_date(value.date()),
            time,
        }
    }

    /// `None` for the all-zero value and other out-of-range encodings.
    pub fn to_naive(self) -> Option<NaiveDateTime> {
        let date = decode_dos_date(self.date)?;
        let hour = (self.time >> 11) as u32;
        let minute = ((self.time >> 5) & 0x3F) as u32;
        let second = ((self.time & 0x1F) * 2) as u32;
        let time = NaiveTime::from_hms_opt(hour, minute, second)?;
        Some(NaiveDateTime::new(date, time))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub short_name: ShortName,
    pub attributes: Attributes,
    pub lowercase_base: bool,
    pub lowercase_ext: bool,
    pub created: DosDateTime,
    pub accessed_date: u16,
    pub modified: DosDateTime,
    pub start_cluster: u32,
    pub length: u32,
}

/// Classification of one 32-byte directory slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParsedSlot {
    /// First byte 0: no live entries follow.
    End,
    Deleted,
    LongName(LongNameFragment),
    Entry(DirectoryEntry),
}

fn u16_at(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([raw[offset], raw[offset + 1]])
}

pub fn parse_slot(raw: &[u8; DIR_ENTRY_SIZE], variant: FatVariant) -> ParsedSlot {
    match raw[0] {
        END_MARKER => ParsedSlot::End,
        DELETED_MARKER => ParsedSlot::Deleted,
        _ if is_lfn_fragment(raw[OFFSET_ATTRIBUTES]) => {
            ParsedSlot::LongName(LongNameFragment::parse(raw))
        }
        _ => ParsedSlot::Entry(DirectoryEntry::parse(raw, variant)),
    }
}

impl DirectoryEntry {
    pub fn new(short_name: ShortName, attributes: Attributes, now: NaiveDateTime) -> Self {
        let stamp = DosDateTime::from_naive(now);
        Self {
            short_name,
            attributes,
            lowercase_base: false,
            lowercase_ext: false,
            created: stamp,
            accessed_date: stamp.date,
            modified: stamp,
            start_cluster: 0,
            length: 0,
        }
    }

    pub fn volume_label(label: ShortName, now: NaiveDateTime) -> Self {
        Self::new(label, Attributes::VOLUME_LABEL, now)
    }

    /// Decodes a slot already known to be a live short entry.
    pub fn parse(raw: &[u8; DIR_ENTRY_SIZE], variant: FatVariant) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[..11]);
        if name[0] == KANJI_ESCAPE {
            name[0] = DELETED_MARKER;
        }
        let high = if variant == FatVariant::Fat32 {
            u16_at(raw, OFFSET_CLUSTER_HIGH) as u32
        } else {
            0
        };
        Self {
            short_name: ShortName::from_raw(name),
            attributes: Attributes::from_bits_retain(raw[OFFSET_ATTRIBUTES]),
            lowercase_base: raw[OFFSET_CASE] & LOWERCASE_BASE != 0,
            lowercase_ext: raw[OFFSET_CASE] & LOWERCASE_EXT != 0,
            created: DosDateTime {
                date: u16_at(raw, OFFSET_CREATED_DATE),
                time: u16_at(raw, OFFSET_CREATED_TIME),
            },
            accessed_date: u16_at(raw, OFFSET_ACCESSED_DATE),
            modified: DosDateTime {
                date: u16_at(raw, OFFSET_MODIFIED_DATE),
                time: u16_at(raw, OFFSET_MODIFIED_TIME),
            },
            start_cluster: (high << 16) | u16_at(raw, OFFSET_CLUSTER_LOW) as u32,
            length: u32::from_le_bytes([
                raw[OFFSET_LENGTH],
                raw[OFFSET_LENGTH + 1],
                raw[OFFSET_LENGTH + 2],
                raw[OFFSET_LENGTH + 3],
            ]),
        }
    }

    pub fn encode(&self, variant: FatVariant) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[..11].copy_from_slice(self.short_name.as_bytes());
        if raw[0] == DELETED_MARKER {
            raw[0] = KANJI_ESCAPE;
        }
        raw[OFFSET_ATTRIBUTES] = self.attributes.bits();
        let mut case = 0u8;
        if self.lowercase_base {
            case |= LOWERCASE_BASE;
        }
        if self.lowercase_ext {
            case |= LOWERCASE_EXT;
        }
        raw[OFFSET_CASE] = case;
        raw[OFFSET_CREATED_TENTHS] = 0;
        raw[OFFSET_CREATED_TIME..OFFSET_CREATED_TIME + 2]
            .copy_from_slice(&self.created.time.to_le_bytes());
        raw[OFFSET_CREATED_DATE..OFFSET_CREATED_DATE + 2]
            .copy_from_slice(&self.created.date.to_le_bytes());
        raw[OFFSET_ACCESSED_DATE..OFFSET_ACCESSED_DATE + 2]
            .copy_from_slice(&self.accessed_date.to_le_bytes());
        if variant == FatVariant::Fat32 {
            raw[OFFSET_CLUSTER_HIGH..OFFSET_CLUSTER_HIGH + 2]
                .copy_from_slice(&((self.start_cluster >> 16) as u16).to_le_bytes());
        }
        raw[OFFSET_MODIFIED_TIME..OFFSET_MODIFIED_TIME + 2]
            .copy_from_slice(&self.modified.time.to_le_bytes());
        raw[OFFSET_MODIFIED_DATE..OFFSET_MODIFIED_DATE + 2]
            .copy_from_slice(&self.modified.date.to_le_bytes());
        raw[OFFSET_CLUSTER_LOW..OFFSET_CLUSTER_LOW + 2]
            .copy_from_slice(&(self.start_cluster as u16).to_le_bytes());
        raw[OFFSET_LENGTH..OFFSET_LENGTH + 4].copy_from_slice(&self.length.to_le_bytes());
        raw
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes.contains(Attributes::VOLUME_LABEL)
            && !self.attributes.contains(Attributes::DIRECTORY)
            && !is_lfn_fragment(self.attributes.bits())
    }

    pub fn is_dot_entry(&self) -> bool {
        self.short_name.is_dot_entry()
    }

    pub fn display_name(&self) -> heapless::String<12> {
        self.short_name
            .display_name(self.lowercase_base, self.lowercase_ext)
    }

    pub fn created_at(&self) -> Option<NaiveDateTime> {
        self.created.to_naive()
    }

    pub fn modified_at(&self) -> Option<NaiveDateTime> {
        self.modified.to_naive()
    }

    pub fn accessed_on(&self) -> Option<NaiveDate> {
        decode_dos_date(self.accessed_date)
    }

    pub fn touch_modified(&mut self, now: NaiveDateTime) {
        self.modified = DosDateTime::from_naive(now);
        self.accessed_date = self.modified.date;
    }

    pub fn touch_accessed(&mut self, now: NaiveDateTime) {
        self.accessed_date = encode_dos_date(now.date());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(13, 37, 42)
            .unwrap()
    }

    #[test]
    fn dos_timestamps_round_trip_at_two_second_resolution() {
        let packed = DosDateTime::from_naive(stamp());
        assert_eq!(packed.date, (44 << 9) | (2 << 5) | 29);
        assert_eq!(packed.time, (13 << 11) | (37 << 5) | 21);
        assert_eq!(packed.to_naive(), Some(stamp()));
        assert_eq!(DosDateTime::default().to_naive(), None);
    }

    #[test]
    fn entry_fields_land_at_fixed_offsets() {
        let mut entry = DirectoryEntry::new(
            ShortName::from_raw(*b"DATA    BIN"),
            Attributes::ARCHIVE,
            stamp(),
        );
        entry.start_cluster = 0x0012_3456;
        entry.length = 100_000;
        entry.lowercase_ext = true;

        let raw = entry.encode(FatVariant::Fat32);
        assert_eq!(&raw[..11], b"DATA    BIN");
        assert_eq!(raw[0x0B], 0x20);
        assert_eq!(raw[0x0C], 0x10);
        assert_eq!(u16_at(&raw, 0x14), 0x0012);
        assert_eq!(u16_at(&raw, 0x1A), 0x3456);
        assert_eq!(&raw[0x1C..0x20], &100_000u32.to_le_bytes());
        assert_eq!(parse_slot(&raw, FatVariant::Fat32), ParsedSlot::Entry(entry));
    }

    #[test]
    fn fat16_ignores_high_cluster_word() {
        let mut entry = DirectoryEntry::new(
            ShortName::from_raw(*b"A          "),
            Attributes::empty(),
            stamp(),
        );
        entry.start_cluster = 0x1234;
        let mut raw = entry.encode(FatVariant::Fat16);
        assert_eq!(u16_at(&raw, 0x14), 0);
        raw[0x14] = 0x77;
        assert_eq!(DirectoryEntry::parse(&raw, FatVariant::Fat16).start_cluster, 0x1234);
    }

    #[test]
    fn leading_e5_is_escaped_on_disk() {
        let mut name = *b"XNAME   TXT";
        name[0] = 0xE5;
        let entry = DirectoryEntry::new(ShortName::from_raw(name), Attributes::empty(), stamp());
        let raw = entry.encode(FatVariant::Fat16);
        assert_eq!(raw[0], 0x05);
        match parse_slot(&raw, FatVariant::Fat16) {
            ParsedSlot::Entry(back) => assert_eq!(back.short_name.as_bytes()[0], 0xE5),
            other => panic!("unexpected slot {other:?}"),
        }
    }

    #[test]
    fn slot_markers_and_label_detection() {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        assert_eq!(parse_slot(&raw, FatVariant::Fat12), ParsedSlot::End);
        raw[0] = 0xE5;
        assert_eq!(parse_slot(&raw, FatVariant::Fat12), ParsedSlot::Deleted);

        let label = DirectoryEntry::volume_label(ShortName::from_raw(*b"MYDISK     "), stamp());
        assert!(label.is_volume_label());
        let mut dir_with_label_bit = label;
        dir_with_label_bit.attributes |= Attributes::DIRECTORY;
        assert!(!dir_with_label_bit.is_volume_label());

        assert!(is_lfn_fragment(0x0F));
        assert!(is_lfn_fragment(0x2F));
        assert!(!is_lfn_fragment(0x0E));
    }
}
