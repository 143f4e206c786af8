use chrono::NaiveDateTime;

use crate::fat::variant::FatVariant;

/// Source of the timestamps written into directory entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Clock {
    /// Local wall-clock time.
    #[default]
    System,
    /// Always the same instant; useful for reproducible images.
    Fixed(NaiveDateTime),
}

impl Clock {
    pub fn now(&self) -> NaiveDateTime {
        match self {
            Self::System => chrono::Local::now().naive_local(),
            Self::Fixed(at) => *at,
        }
    }
}

/// Mount-time options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsConfig {
    pub read_only: bool,
    pub clock: Clock,
}

impl FsConfig {
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

/// Knobs for [`crate::fat::format::format_volume`]. Every field left at
/// `None` is derived from the device size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatOptions {
    pub variant: Option<FatVariant>,
    pub label: Option<String>,
    pub oem_name: Option<[u8; 8]>,
    pub fat_count: Option<u8>,
    pub root_entry_count: Option<u16>,
    pub sectors_per_cluster: Option<u8>,
    pub volume_id: Option<u32>,
}

impl FormatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variant(mut self, variant: FatVariant) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_oem_name(mut self, oem_name: [u8; 8]) -> Self {
        self.oem_name = Some(oem_name);
        self
    }

    pub fn with_fat_count(mut self, fat_count: u8) -> Self {
        self.fat_count = Some(fat_count);
        self
    }

    pub fn with_root_entry_count(mut self, count: u16) -> Self {
        self.root_entry_count = Some(count);
        self
    }

    pub fn with_sectors_per_cluster(mut self, sectors: u8) -> Self {
        self.sectors_per_cluster = Some(sectors);
        self
    }

    pub fn with_volume_id(mut self, volume_id: u32) -> Self {
        self.volume_id = Some(volume_id);
        self
    }
}
