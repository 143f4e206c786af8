//! Super-floppy formatter: one FAT volume spanning the whole device, no
//! partition table.

use crate::{
    config::{Clock, FormatOptions},
    device::BlockDevice,
    error::{FatError, Result},
};

use super::{
    boot_sector::{BootSector, DIR_ENTRY_SIZE},
    directory::{encode_label, Directory},
    entry::DirectoryEntry,
    fs_info::FsInfoSector,
    short_name::ShortName,
    table::AllocationTable,
    variant::{FatVariant, FIRST_DATA_CLUSTER},
};

const MIB: u64 = 1024 * 1024;
/// Devices below this size get FAT12.
const FAT12_SIZE_LIMIT: u64 = 5 * MIB;
/// Devices below this size get FAT16.
const FAT16_SIZE_LIMIT: u64 = 512 * MIB;
const MAX_FAT12_CLUSTER_BYTES: u32 = 4096;

const DEFAULT_ROOT_ENTRIES: u16 = 512;
const DEFAULT_FAT_COUNT: u8 = 2;
const FAT32_RESERVED_SECTORS: u16 = 32;
const MEDIUM_FIXED_DISK: u8 = 0xF8;
const DEFAULT_OEM_NAME: [u8; 8] = *b"FATVOL  ";
const ZERO_CHUNK: usize = 64 * 1024;

/// Upper bound of the disk size in 512-byte sectors and the cluster size (in
/// 512-byte sectors) to use up to it; 0 marks a disk too small for the type.
const FAT16_CLUSTER_SIZES: [(u64, u32); 7] = [
    (8_400, 0),
    (32_680, 2),
    (262_144, 4),
    (524_288, 8),
    (1_048_576, 16),
    (2_097_152, 32),
    (4_194_304, 64),
];
const FAT32_CLUSTER_SIZES: [(u64, u32); 6] = [
    (66_600, 0),
    (532_480, 1),
    (16_777_216, 8),
    (33_554_432, 16),
    (67_108_864, 32),
    (u64::MAX, 64),
];

fn variant_for_size(size: u64) -> FatVariant {
    if size < FAT12_SIZE_LIMIT {
        FatVariant::Fat12
    } else if size < FAT16_SIZE_LIMIT {
        FatVariant::Fat16
    } else {
        FatVariant::Fat32
    }
}

fn lookup_cluster_size(table: &[(u64, u32)], size: u64, bytes_per_sector: u32) -> Result<u32> {
    let sectors_512 = size / 512;
    let (_, sectors) = table
        .iter()
        .find(|(limit, _)| sectors_512 <= *limit)
        .ok_or(FatError::DeviceTooLarge)?;
    if *sectors == 0 {
        return Err(FatError::DeviceTooSmall);
    }
    Ok((*sectors * 512 / bytes_per_sector).max(1))
}

fn default_sectors_per_cluster(
    variant: FatVariant,
    size: u64,
    bytes_per_sector: u32,
    total_sectors: u32,
) -> Result<u32> {
    match variant {
        FatVariant::Fat12 => {
            let mut sectors = 1u32;
            while total_sectors / sectors > FatVariant::Fat12.max_clusters() {
                sectors *= 2;
                if sectors * bytes_per_sector > MAX_FAT12_CLUSTER_BYTES {
                    return Err(FatError::DeviceTooLarge);
                }
            }
            Ok(sectors)
        }
        FatVariant::Fat16 => lookup_cluster_size(&FAT16_CLUSTER_SIZES, size, bytes_per_sector),
        FatVariant::Fat32 => lookup_cluster_size(&FAT32_CLUSTER_SIZES, size, bytes_per_sector),
    }
}

/// Table size in sectors, after the FAT specification's approximation. It
/// errs on the large side, which is harmless.
fn sectors_per_fat(
    variant: FatVariant,
    total_sectors: u32,
    reserved_sectors: u32,
    root_dir_sectors: u32,
    sectors_per_cluster: u32,
    fat_count: u32,
    bytes_per_sector: u32,
) -> Result<u32> {
    let available = total_sectors
        .checked_sub(reserved_sectors + root_dir_sectors)
        .filter(|sectors| *sectors > 0)
        .ok_or(FatError::DeviceTooSmall)?;
    let mut divisor = (bytes_per_sector / 2) * sectors_per_cluster + fat_count;
    if variant == FatVariant::Fat32 {
        divisor /= 2;
    }
    Ok(available.div_ceil(divisor))
}

fn zero_region<D: BlockDevice>(device: &mut D, offset: u64, len: u64) -> Result<()> {
    let zero = vec![0u8; ZERO_CHUNK];
    let mut done = 0u64;
    while done < len {
        let chunk = (len - done).min(ZERO_CHUNK as u64) as usize;
        device.write(offset + done, &zero[..chunk])?;
        done += chunk as u64;
    }
    Ok(())
}

/// Writes an empty FAT file system over the whole device and returns its
/// boot sector.
pub fn format_volume<D: BlockDevice>(device: &mut D, options: &FormatOptions) -> Result<BootSector> {
    if device.is_read_only() {
        return Err(FatError::ReadOnlyViolation);
    }
    let bytes_per_sector = device.sector_size();
    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(FatError::UnsupportedSectorSize(bytes_per_sector as u16));
    }
    let size = device.size_in_bytes();
    let total_sectors =
        u32::try_from(size / bytes_per_sector as u64).map_err(|_| FatError::DeviceTooLarge)?;

    let variant = options.variant.unwrap_or_else(|| variant_for_size(size));
    let reserved_sectors = if variant == FatVariant::Fat32 {
        FAT32_RESERVED_SECTORS
    } else {
        1
    };
    let fat_count = options.fat_count.unwrap_or(DEFAULT_FAT_COUNT);
    if fat_count == 0 {
        return Err(FatError::InvalidBootSector);
    }
    let root_entry_count = if variant == FatVariant::Fat32 {
        0
    } else {
        options.root_entry_count.unwrap_or(DEFAULT_ROOT_ENTRIES)
    };
    let sectors_per_cluster = match options.sectors_per_cluster {
        Some(sectors) if sectors == 0 || !sectors.is_power_of_two() => {
            return Err(FatError::UnsupportedSectorsPerCluster(sectors));
        }
        Some(sectors) => sectors as u32,
        None => default_sectors_per_cluster(variant, size, bytes_per_sector, total_sectors)?,
    };
    let sectors_per_cluster_u8 = u8::try_from(sectors_per_cluster)
        .map_err(|_| FatError::DeviceTooLarge)?;

    let root_dir_sectors =
        (root_entry_count as u32 * DIR_ENTRY_SIZE as u32).div_ceil(bytes_per_sector);
    let fat_sectors = sectors_per_fat(
        variant,
        total_sectors,
        reserved_sectors as u32,
        root_dir_sectors,
        sectors_per_cluster,
        fat_count as u32,
        bytes_per_sector,
    )?;
    let first_data_sector =
        reserved_sectors as u32 + fat_count as u32 * fat_sectors + root_dir_sectors;
    let clusters = total_sectors
        .checked_sub(first_data_sector)
        .ok_or(FatError::DeviceTooSmall)?
        / sectors_per_cluster;
    if clusters < variant.min_clusters() {
        return Err(FatError::DeviceTooSmall);
    }
    if clusters > variant.max_clusters() {
        return Err(FatError::DeviceTooLarge);
    }

    let mut boot = BootSector::new(
        variant,
        options.oem_name.unwrap_or(DEFAULT_OEM_NAME),
        bytes_per_sector as u16,
        sectors_per_cluster_u8,
        reserved_sectors,
        fat_count,
        root_entry_count,
        total_sectors,
        fat_sectors,
        MEDIUM_FIXED_DISK,
    );
    boot.volume_id = options
        .volume_id
        .unwrap_or_else(|| chrono::Utc::now().timestamp() as u32);
    let label = options.label.as_deref().map(encode_label).transpose()?;
    boot.set_volume_label(label);

    let geometry = boot.geometry();
    zero_region(device, 0, geometry.data_offset)?;

    let mut fat = AllocationTable::new(&geometry);
    if variant == FatVariant::Fat32 {
        let root = fat.allocate_one()?;
        let cluster_size = geometry.cluster_size() as u64;
        zero_region(
            device,
            geometry.data_offset + (root - FIRST_DATA_CLUSTER) as u64 * cluster_size,
            cluster_size,
        )?;
        boot.root_dir_first_cluster = root;
    }
    fat.write(device)?;
    boot.write(device)?;

    if variant == FatVariant::Fat32 {
        let mut info = FsInfoSector::new(boot.fs_info_sector as u64 * bytes_per_sector as u64);
        info.free_cluster_count = fat.free_cluster_count();
        info.next_free_cluster = fat.next_free_hint();
        info.write(device)?;
    }

    if let Some(label) = label {
        let mut root = Directory::open_root(device, &fat, &geometry)?;
        let entry = DirectoryEntry::volume_label(ShortName::from_raw(label), Clock::System.now());
        root.set_label(&mut fat, Some(entry))?;
        root.flush(&mut fat, device)?;
    }
    device.flush()?;

    log::debug!(
        "fat: format variant={} clusters={} cluster_size={} fat_sectors={}",
        variant,
        clusters,
        geometry.cluster_size(),
        fat_sectors
    );
    Ok(boot)
}
