use core::fmt;

/// Largest data-cluster count a FAT12 volume may have.
pub const MAX_FAT12_CLUSTERS: u32 = 4084;
/// Largest data-cluster count a FAT16 volume may have.
pub const MAX_FAT16_CLUSTERS: u32 = 65524;
/// Largest data-cluster count a FAT32 volume may have (28-bit entries minus
/// reserved values).
pub const MAX_FAT32_CLUSTERS: u32 = 0x0FFF_FFF5;

pub const FIRST_DATA_CLUSTER: u32 = 2;

/// Offsets of the fields whose position differs between the FAT12/16 and the
/// FAT32 boot sector layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootLayout {
    pub jump: [u8; 3],
    pub drive_number: usize,
    pub ext_boot_signature: usize,
    pub volume_id: usize,
    pub volume_label: usize,
    pub fs_type: usize,
}

const FAT16_LAYOUT: BootLayout = BootLayout {
    jump: [0xEB, 0x3C, 0x90],
    drive_number: 0x24,
    ext_boot_signature: 0x26,
    volume_id: 0x27,
    volume_label: 0x2B,
    fs_type: 0x36,
};

const FAT32_LAYOUT: BootLayout = BootLayout {
    jump: [0xEB, 0x58, 0x90],
    drive_number: 0x40,
    ext_boot_signature: 0x42,
    volume_id: 0x43,
    volume_label: 0x47,
    fs_type: 0x52,
};

/// Decoded meaning of one allocation table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterEntry {
    Free,
    Next(u32),
    Reserved(u32),
    Eof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

impl FatVariant {
    /// Classifies a volume by its data-cluster count, the only rule the
    /// on-disk format honours.
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters <= MAX_FAT12_CLUSTERS {
            Self::Fat12
        } else if clusters <= MAX_FAT16_CLUSTERS {
            Self::Fat16
        } else {
            Self::Fat32
        }
    }

    pub const fn entry_bits(self) -> u32 {
        match self {
            Self::Fat12 => 12,
            Self::Fat16 => 16,
            Self::Fat32 => 32,
        }
    }

    pub const fn mask(self) -> u32 {
        match self {
            Self::Fat12 => 0x0FFF,
            Self::Fat16 => 0xFFFF,
            Self::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Value written to terminate a chain.
    pub const fn eof_marker(self) -> u32 {
        self.mask()
    }

    /// Entries at or above this value all mean end-of-chain.
    pub const fn eof_threshold(self) -> u32 {
        self.mask() & !0x7
    }

    /// Value marking a cluster as bad. Values between the largest data
    /// cluster and this mark are plain links that run past the volume.
    pub const fn bad_cluster_marker(self) -> u32 {
        self.mask() - 8
    }

    pub const fn max_clusters(self) -> u32 {
        match self {
            Self::Fat12 => MAX_FAT12_CLUSTERS,
            Self::Fat16 => MAX_FAT16_CLUSTERS,
            Self::Fat32 => MAX_FAT32_CLUSTERS,
        }
    }

    pub const fn min_clusters(self) -> u32 {
        match self {
            Self::Fat12 => 1,
            Self::Fat16 => MAX_FAT12_CLUSTERS + 1,
            Self::Fat32 => MAX_FAT16_CLUSTERS + 1,
        }
    }

    pub const fn layout(self) -> &'static BootLayout {
        match self {
            Self::Fat12 | Self::Fat16 => &FAT16_LAYOUT,
            Self::Fat32 => &FAT32_LAYOUT,
        }
    }

    pub const fn fs_type_label(self) -> &'static [u8; 8] {
        match self {
            Self::Fat12 => b"FAT12   ",
            Self::Fat16 => b"FAT16   ",
            Self::Fat32 => b"FAT32   ",
        }
    }

    /// Number of whole entries that fit into `table_bytes`.
    pub const fn entries_in(self, table_bytes: usize) -> usize {
        match self {
            Self::Fat12 => table_bytes * 2 / 3,
            Self::Fat16 => table_bytes / 2,
            Self::Fat32 => table_bytes / 4,
        }
    }

    /// Bytes needed to store `entries` entries.
    pub const fn bytes_for(self, entries: u64) -> u64 {
        match self {
            Self::Fat12 => (entries * 3).div_ceil(2),
            Self::Fat16 => entries * 2,
            Self::Fat32 => entries * 4,
        }
    }

    pub fn decode(self, raw: u32) -> ClusterEntry {
        let value = raw & self.mask();
        if value == 0 {
            ClusterEntry::Free
        } else if value >= self.eof_threshold() {
            ClusterEntry::Eof
        } else if value == self.bad_cluster_marker() || value < FIRST_DATA_CLUSTER {
            ClusterEntry::Reserved(value)
        } else {
            ClusterEntry::Next(value)
        }
    }

    /// Reads entry `index` from a raw table image. FAT32 entries keep their
    /// reserved top nibble so it can be written back untouched.
    pub fn read_entry(self, data: &[u8], index: usize) -> u32 {
        match self {
            Self::Fat12 => {
                let idx = index + index / 2;
                let value = u16::from_le_bytes([data[idx], data[idx + 1]]) as u32;
                if index % 2 == 0 {
                    value & 0x0FFF
                } else {
                    value >> 4
                }
            }
            Self::Fat16 => {
                let idx = index * 2;
                u16::from_le_bytes([data[idx], data[idx + 1]]) as u32
            }
            Self::Fat32 => {
                let idx = index * 4;
                u32::from_le_bytes([data[idx], data[idx + 1], data[idx + 2], data[idx + 3]])
            }
        }
    }

    pub fn write_entry(self, data: &mut [u8], index: usize, value: u32) {
        match self {
            Self::Fat12 => {
                let idx = index + index / 2;
                let value = value & 0x0FFF;
                if index % 2 == 0 {
                    data[idx] = value as u8;
                    data[idx + 1] = (data[idx + 1] & 0xF0) | ((value >> 8) as u8 & 0x0F);
                } else {
                    data[idx] = (data[idx] & 0x0F) | ((value << 4) as u8 & 0xF0);
                    data[idx + 1] = (value >> 4) as u8;
                }
            }
            Self::Fat16 => {
                let idx = index * 2;
                data[idx..idx + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
            Self::Fat32 => {
                let idx = index * 4;
                data[idx..idx + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

impl fmt::Display for FatVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fat12 => "FAT12",
            Self::Fat16 => "FAT16",
            Self::Fat32 => "FAT32",
        })
    }
}
