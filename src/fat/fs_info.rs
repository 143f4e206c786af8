//! FAT32 FS-information sector: advisory free-cluster count and allocation
//! hint.

use crate::{
    device::BlockDevice,
    error::{FatError, Result},
};

const LEAD_SIGNATURE: u32 = 0x4161_5252;
const STRUCT_SIGNATURE: u32 = 0x6141_7272;
const TRAIL_SIGNATURE: u32 = 0xAA55_0000;
const OFFSET_LEAD: usize = 0;
const OFFSET_STRUCT: usize = 484;
const OFFSET_FREE_COUNT: usize = 488;
const OFFSET_NEXT_FREE: usize = 492;
const OFFSET_TRAIL: usize = 508;
const SECTOR_SIZE: usize = 512;

/// Value meaning "unknown" for both counters.
pub const UNKNOWN: u32 = 0xFFFF_FFFF;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsInfoSector {
    offset: u64,
    pub free_cluster_count: u32,
    pub next_free_cluster: u32,
}

impl FsInfoSector {
    pub fn read<D: BlockDevice>(device: &mut D, offset: u64) -> Result<Self> {
        let mut raw = [0u8; SECTOR_SIZE];
        device.read(offset, &mut raw)?;
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        if word(OFFSET_LEAD) != LEAD_SIGNATURE
            || word(OFFSET_STRUCT) != STRUCT_SIGNATURE
            || word(OFFSET_TRAIL) != TRAIL_SIGNATURE
        {
            return Err(FatError::CorruptEntry("fs-info signature mismatch"));
        }
        Ok(Self {
            offset,
            free_cluster_count: word(OFFSET_FREE_COUNT),
            next_free_cluster: word(OFFSET_NEXT_FREE),
        })
    }

    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            free_cluster_count: UNKNOWN,
            next_free_cluster: UNKNOWN,
        }
    }

    pub fn encode(&self) -> [u8; SECTOR_SIZE] {
        let mut raw = [0u8; SECTOR_SIZE];
        raw[OFFSET_LEAD..OFFSET_LEAD + 4].copy_from_slice(&LEAD_SIGNATURE.to_le_bytes());
        raw[OFFSET_STRUCT..OFFSET_STRUCT + 4].copy_from_slice(&STRUCT_SIGNATURE.to_le_bytes());
        raw[OFFSET_FREE_COUNT..OFFSET_FREE_COUNT + 4]
            .copy_from_slice(&self.free_cluster_count.to_le_bytes());
        raw[OFFSET_NEXT_FREE..OFFSET_NEXT_FREE + 4]
            .copy_from_slice(&self.next_free_cluster.to_le_bytes());
        raw[OFFSET_TRAIL..OFFSET_TRAIL + 4].copy_from_slice(&TRAIL_SIGNATURE.to_le_bytes());
        raw
    }

    pub fn write<D: BlockDevice>(&self, device: &mut D) -> Result<()> {
        device.write(self.offset, &self.encode())?;
        Ok(())
    }

    pub fn next_free_hint(&self) -> Option<u32> {
        (self.next_free_cluster != UNKNOWN).then_some(self.next_free_cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    #[test]
    fn writes_and_reads_counters() {
        let mut dev = MemoryDevice::new(4096);
        let mut info = FsInfoSector::new(512);
        info.free_cluster_count = 1234;
        info.next_free_cluster = 77;
        info.write(&mut dev).unwrap();

        let back = FsInfoSector::read(&mut dev, 512).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.next_free_hint(), Some(77));
        assert_eq!(&dev.as_bytes()[512 + 510..512 + 512], &[0x55, 0xAA]);
    }

    #[test]
    fn blank_sector_is_rejected() {
        let mut dev = MemoryDevice::new(1024);
        assert!(matches!(
            FsInfoSector::read(&mut dev, 512),
            Err(FatError::CorruptEntry(_))
        ));
    }
}
