//! Boot sector (BIOS parameter block) and the volume geometry derived from it.

use crate::{
    device::BlockDevice,
    error::{FatError, Result},
};

use super::variant::{FatVariant, FIRST_DATA_CLUSTER};

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const DIR_ENTRY_SIZE: usize = 32;
/// Label value for volumes that carry none.
pub const NO_NAME_LABEL: &[u8; 11] = b"NO NAME    ";
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const EXT_BOOT_SIGNATURE: u8 = 0x29;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootSector {
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub root_entry_count: u16,
    pub total_sectors: u32,
    pub medium_descriptor: u8,
    pub sectors_per_fat: u32,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u32,
    /// FAT32 only.
    pub root_dir_first_cluster: u32,
    /// FAT32 only.
    pub fs_info_sector: u16,
    /// FAT32 only.
    pub backup_boot_sector: u16,
    pub drive_number: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub variant: FatVariant,
    raw: [u8; BOOT_SECTOR_SIZE],
}

fn u16_at(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([raw[offset], raw[offset + 1]])
}

fn u32_at(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        raw[offset],
        raw[offset + 1],
        raw[offset + 2],
        raw[offset + 3],
    ])
}

impl BootSector {
    pub fn read<D: BlockDevice>(device: &mut D) -> Result<Self> {
        let mut raw = [0u8; BOOT_SECTOR_SIZE];
        device.read(0, &mut raw)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8; BOOT_SECTOR_SIZE]) -> Result<Self> {
        if raw[510..512] != BOOT_SIGNATURE {
            return Err(FatError::InvalidBootSector);
        }

        let bytes_per_sector = u16_at(raw, 0x0B);
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(FatError::UnsupportedSectorSize(bytes_per_sector));
        }
        let sectors_per_cluster = raw[0x0D];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(FatError::UnsupportedSectorsPerCluster(sectors_per_cluster));
        }
        let reserved_sectors = u16_at(raw, 0x0E);
        let fat_count = raw[0x10];
        if reserved_sectors == 0 || fat_count == 0 {
            return Err(FatError::InvalidBootSector);
        }

        let root_entry_count = u16_at(raw, 0x11);
        let total_16 = u16_at(raw, 0x13) as u32;
        let total_32 = u32_at(raw, 0x20);
        let total_sectors = if total_16 != 0 { total_16 } else { total_32 };
        let fat_size_16 = u16_at(raw, 0x16) as u32;
        let sectors_per_fat = if fat_size_16 != 0 {
            fat_size_16
        } else {
            u32_at(raw, 0x24)
        };
        if total_sectors == 0 || sectors_per_fat == 0 {
            return Err(FatError::InvalidBootSector);
        }

        let mut boot = Self {
            oem_name: raw[3..11].try_into().unwrap_or([b' '; 8]),
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            root_entry_count,
            total_sectors,
            medium_descriptor: raw[0x15],
            sectors_per_fat,
            sectors_per_track: u16_at(raw, 0x18),
            heads: u16_at(raw, 0x1A),
            hidden_sectors: u32_at(raw, 0x1C),
            root_dir_first_cluster: 0,
            fs_info_sector: 0,
            backup_boot_sector: 0,
            drive_number: 0,
            volume_id: 0,
            volume_label: *NO_NAME_LABEL,
            variant: FatVariant::Fat12,
            raw: *raw,
        };

        let data_sectors = boot
            .total_sectors
            .checked_sub(boot.first_data_sector())
            .filter(|sectors| *sectors > 0)
            .ok_or(FatError::InvalidBootSector)?;
        let clusters = data_sectors / boot.sectors_per_cluster as u32;
        boot.variant = FatVariant::from_cluster_count(clusters);

        if boot.variant == FatVariant::Fat32 {
            if fat_size_16 != 0 || root_entry_count != 0 {
                return Err(FatError::UnsupportedFatType);
            }
            boot.root_dir_first_cluster = u32_at(raw, 0x2C);
            if boot.root_dir_first_cluster < FIRST_DATA_CLUSTER {
                return Err(FatError::InvalidBootSector);
            }
            boot.fs_info_sector = u16_at(raw, 0x30);
            boot.backup_boot_sector = u16_at(raw, 0x32);
        } else if root_entry_count == 0 {
            return Err(FatError::InvalidBootSector);
        }

        let table_entries = boot.variant.entries_in(boot.fat_bytes() as usize) as u64;
        if table_entries < clusters as u64 + FIRST_DATA_CLUSTER as u64 {
            log::warn!(
                "fat: table holds {} entries for {} clusters, tail clusters unusable",
                table_entries,
                clusters
            );
        }

        let layout = boot.variant.layout();
        boot.drive_number = raw[layout.drive_number];
        if raw[layout.ext_boot_signature] == EXT_BOOT_SIGNATURE {
            boot.volume_id = u32_at(raw, layout.volume_id);
            boot.volume_label
                .copy_from_slice(&raw[layout.volume_label..layout.volume_label + 11]);
        }

        Ok(boot)
    }

    /// Builds a fresh boot sector; the formatter fills in the geometry.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        variant: FatVariant,
        oem_name: [u8; 8],
        bytes_per_sector: u16,
        sectors_per_cluster: u8,
        reserved_sectors: u16,
        fat_count: u8,
        root_entry_count: u16,
        total_sectors: u32,
        sectors_per_fat: u32,
        medium_descriptor: u8,
    ) -> Self {
        Self {
            oem_name,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            root_entry_count,
            total_sectors,
            medium_descriptor,
            sectors_per_fat,
            sectors_per_track: 32,
            heads: 64,
            hidden_sectors: 0,
            root_dir_first_cluster: if variant == FatVariant::Fat32 {
                FIRST_DATA_CLUSTER
            } else {
                0
            },
            fs_info_sector: if variant == FatVariant::Fat32 { 1 } else { 0 },
            backup_boot_sector: if variant == FatVariant::Fat32 { 6 } else { 0 },
            drive_number: 0x80,
            volume_id: 0,
            volume_label: *NO_NAME_LABEL,
            variant,
            raw: [0u8; BOOT_SECTOR_SIZE],
        }
    }

    /// Serialises all fields over the sector image read at mount, so boot code
    /// and unknown fields survive.
    pub fn encode(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut raw = self.raw;
        let layout = self.variant.layout();
        if raw[0] != 0xEB && raw[0] != 0xE9 {
            raw[..3].copy_from_slice(&layout.jump);
        }
        raw[3..11].copy_from_slice(&self.oem_name);
        raw[0x0B..0x0D].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        raw[0x0D] = self.sectors_per_cluster;
        raw[0x0E..0x10].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        raw[0x10] = self.fat_count;
        raw[0x11..0x13].copy_from_slice(&self.root_entry_count.to_le_bytes());
        let (total_16, total_32) = match u16::try_from(self.total_sectors) {
            Ok(small) if self.variant != FatVariant::Fat32 => (small, 0),
            _ => (0, self.total_sectors),
        };
        raw[0x13..0x15].copy_from_slice(&total_16.to_le_bytes());
        raw[0x15] = self.medium_descriptor;
        raw[0x18..0x1A].copy_from_slice(&self.sectors_per_track.to_le_bytes());
        raw[0x1A..0x1C].copy_from_slice(&self.heads.to_le_bytes());
        raw[0x1C..0x20].copy_from_slice(&self.hidden_sectors.to_le_bytes());
        raw[0x20..0x24].copy_from_slice(&total_32.to_le_bytes());

        if self.variant == FatVariant::Fat32 {
            raw[0x16..0x18].copy_from_slice(&0u16.to_le_bytes());
            raw[0x24..0x28].copy_from_slice(&self.sectors_per_fat.to_le_bytes());
            raw[0x2C..0x30].copy_from_slice(&self.root_dir_first_cluster.to_le_bytes());
            raw[0x30..0x32].copy_from_slice(&self.fs_info_sector.to_le_bytes());
            raw[0x32..0x34].copy_from_slice(&self.backup_boot_sector.to_le_bytes());
        } else {
            raw[0x16..0x18].copy_from_slice(&(self.sectors_per_fat as u16).to_le_bytes());
        }

        raw[layout.drive_number] = self.drive_number;
        raw[layout.ext_boot_signature] = EXT_BOOT_SIGNATURE;
        raw[layout.volume_id..layout.volume_id + 4].copy_from_slice(&self.volume_id.to_le_bytes());
        raw[layout.volume_label..layout.volume_label + 11].copy_from_slice(&self.volume_label);
        raw[layout.fs_type..layout.fs_type + 8].copy_from_slice(self.variant.fs_type_label());
        raw[510..512].copy_from_slice(&BOOT_SIGNATURE);
        raw
    }

    /// Writes the sector and, on FAT32, its backup copy.
    pub fn write<D: BlockDevice>(&mut self, device: &mut D) -> Result<()> {
        let raw = self.encode();
        device.write(0, &raw)?;
        if self.variant == FatVariant::Fat32 && self.backup_boot_sector != 0 {
            let offset = self.backup_boot_sector as u64 * self.bytes_per_sector as u64;
            device.write(offset, &raw)?;
        }
        self.raw = raw;
        Ok(())
    }

    pub fn volume_label_text(&self) -> String {
        let label = String::from_utf8_lossy(&self.volume_label);
        label.trim_end().to_string()
    }

    /// Stores an already padded label; `None` restores "NO NAME".
    pub fn set_volume_label(&mut self, label: Option<[u8; 11]>) {
        self.volume_label = label.unwrap_or(*NO_NAME_LABEL);
    }

    pub fn root_dir_sectors(&self) -> u32 {
        let bytes = self.root_entry_count as u32 * DIR_ENTRY_SIZE as u32;
        bytes.div_ceil(self.bytes_per_sector as u32)
    }

    pub fn fat_bytes(&self) -> u64 {
        self.sectors_per_fat as u64 * self.bytes_per_sector as u64
    }

    fn first_data_sector(&self) -> u32 {
        self.reserved_sectors as u32
            + self.fat_count as u32 * self.sectors_per_fat
            + self.root_dir_sectors()
    }

    pub fn geometry(&self) -> Geometry {
        let sector = self.bytes_per_sector as u64;
        let data_sectors = self.total_sectors.saturating_sub(self.first_data_sector());
        let cluster_count = data_sectors / self.sectors_per_cluster as u32;
        let fat_offset = self.reserved_sectors as u64 * sector;
        let root_dir_offset = fat_offset + self.fat_count as u64 * self.fat_bytes();
        Geometry {
            variant: self.variant,
            bytes_per_sector: self.bytes_per_sector as u32,
            sectors_per_cluster: self.sectors_per_cluster as u32,
            reserved_sectors: self.reserved_sectors as u32,
            fat_count: self.fat_count,
            sectors_per_fat: self.sectors_per_fat,
            root_entry_count: self.root_entry_count as u32,
            root_dir_first_cluster: self.root_dir_first_cluster,
            medium_descriptor: self.medium_descriptor,
            cluster_count,
            fat_offset,
            root_dir_offset,
            data_offset: root_dir_offset + self.root_dir_sectors() as u64 * sector,
        }
    }
}

/// Everything the allocation table, chains and directories need to know about
/// the volume layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub variant: FatVariant,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub fat_count: u8,
    pub sectors_per_fat: u32,
    pub root_entry_count: u32,
    pub root_dir_first_cluster: u32,
    pub medium_descriptor: u8,
    /// Number of data clusters.
    pub cluster_count: u32,
    pub fat_offset: u64,
    pub root_dir_offset: u64,
    pub data_offset: u64,
}

impl Geometry {
    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    pub fn fat_bytes(&self) -> u64 {
        self.sectors_per_fat as u64 * self.bytes_per_sector as u64
    }

    /// Byte offset of FAT copy `index`.
    pub fn fat_copy_offset(&self, index: u8) -> u64 {
        self.fat_offset + index as u64 * self.fat_bytes()
    }

    pub fn root_dir_bytes(&self) -> u64 {
        self.root_entry_count as u64 * DIR_ENTRY_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fat16_sector() -> [u8; BOOT_SECTOR_SIZE] {
        let mut raw = [0u8; BOOT_SECTOR_SIZE];
        raw[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        raw[3..11].copy_from_slice(b"MSWIN4.1");
        raw[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        raw[0x0D] = 4;
        raw[0x0E..0x10].copy_from_slice(&1u16.to_le_bytes());
        raw[0x10] = 2;
        raw[0x11..0x13].copy_from_slice(&512u16.to_le_bytes());
        raw[0x13..0x15].copy_from_slice(&40_000u16.to_le_bytes());
        raw[0x15] = 0xF8;
        raw[0x16..0x18].copy_from_slice(&40u16.to_le_bytes());
        raw[0x26] = 0x29;
        raw[0x2B..0x36].copy_from_slice(b"DATA       ");
        raw[510] = 0x55;
        raw[511] = 0xAA;
        raw
    }

    #[test]
    fn parses_fat16_geometry() {
        let boot = BootSector::parse(&fat16_sector()).unwrap();
        assert_eq!(boot.variant, FatVariant::Fat16);
        assert_eq!(boot.volume_label_text(), "DATA");
        let geo = boot.geometry();
        assert_eq!(geo.cluster_size(), 2048);
        assert_eq!(geo.fat_offset, 512);
        assert_eq!(geo.root_dir_offset, 512 + 2 * 40 * 512);
        assert_eq!(geo.data_offset, geo.root_dir_offset + 512 * 32);
        assert_eq!(geo.cluster_count, (40_000 - 1 - 80 - 32) / 4);
    }

    #[test]
    fn rejects_missing_signature_and_odd_sizes() {
        let mut raw = fat16_sector();
        raw[511] = 0;
        assert!(matches!(
            BootSector::parse(&raw),
            Err(FatError::InvalidBootSector)
        ));

        let mut raw = fat16_sector();
        raw[0x0D] = 3;
        assert!(matches!(
            BootSector::parse(&raw),
            Err(FatError::UnsupportedSectorsPerCluster(3))
        ));

        let mut raw = fat16_sector();
        raw[0x0B..0x0D].copy_from_slice(&500u16.to_le_bytes());
        assert!(matches!(
            BootSector::parse(&raw),
            Err(FatError::UnsupportedSectorSize(500))
        ));
    }

    #[test]
    fn encode_preserves_parsed_fields() {
        let raw = fat16_sector();
        let mut boot = BootSector::parse(&raw).unwrap();
        boot.set_volume_label(Some(*b"BACKUP     "));
        let encoded = boot.encode();
        let again = BootSector::parse(&encoded).unwrap();
        assert_eq!(again.volume_label_text(), "BACKUP");
        assert_eq!(again.geometry(), boot.geometry());
        assert_eq!(&encoded[3..11], b"MSWIN4.1");
    }
}
