//! In-memory copy of the File Allocation Table.
//!
//! The whole table is loaded at mount and written back to every redundant
//! copy on flush. Cluster numbers are `u32`; clusters 0 and 1 are reserved and
//! data clusters live in `[2, last_cluster)`.

use crate::{
    device::BlockDevice,
    error::{FatError, Result},
};

use super::{
    boot_sector::Geometry,
    variant::{ClusterEntry, FatVariant, FIRST_DATA_CLUSTER},
};

#[derive(Clone, Debug)]
pub struct AllocationTable {
    variant: FatVariant,
    entries: Vec<u32>,
    /// Exclusive upper bound of allocatable clusters. Smaller than
    /// `entries.len()` when the table is sized for more clusters than the data
    /// region holds.
    last_cluster: u32,
    next_free: u32,
    fat_bytes: usize,
    fat_count: u8,
    fat_offset: u64,
    medium_descriptor: u8,
    dirty: bool,
}

impl AllocationTable {
    /// Table for a freshly formatted volume: everything free, entry 0 holds the
    /// medium descriptor and entry 1 an end-of-chain mark.
    pub fn new(geometry: &Geometry) -> Self {
        let variant = geometry.variant;
        let fat_bytes = geometry.fat_bytes() as usize;
        let len = variant.entries_in(fat_bytes);
        let mut entries = vec![0u32; len];
        entries[0] = (geometry.medium_descriptor as u32) | (variant.mask() & !0xFF);
        entries[1] = variant.eof_marker();
        let mut table = Self::with_entries(geometry, entries);
        table.dirty = true;
        table
    }

    pub fn read<D: BlockDevice>(device: &mut D, geometry: &Geometry) -> Result<Self> {
        let variant = geometry.variant;
        let fat_bytes = geometry.fat_bytes() as usize;
        let mut data = vec![0u8; fat_bytes];
        device.read(geometry.fat_copy_offset(0), &mut data)?;

        let len = variant.entries_in(fat_bytes);
        let entries = (0..len).map(|i| variant.read_entry(&data, i)).collect::<Vec<_>>();
        if entries.len() <= FIRST_DATA_CLUSTER as usize {
            return Err(FatError::CorruptEntry("allocation table too small"));
        }
        if (entries[0] & 0xFF) as u8 != geometry.medium_descriptor {
            log::warn!(
                "fat: medium descriptor mismatch fat0={:#04x} boot={:#04x}",
                entries[0] & 0xFF,
                geometry.medium_descriptor
            );
        }

        let table = Self::with_entries(geometry, entries);
        log::debug!(
            "fat: read variant={} entries={} usable={} free={}",
            variant,
            table.entries.len(),
            table.last_cluster - FIRST_DATA_CLUSTER,
            table.free_cluster_count()
        );
        Ok(table)
    }

    fn with_entries(geometry: &Geometry, entries: Vec<u32>) -> Self {
        let data_limit = geometry.cluster_count.saturating_add(FIRST_DATA_CLUSTER);
        let last_cluster = data_limit.min(entries.len() as u32);
        Self {
            variant: geometry.variant,
            entries,
            last_cluster,
            next_free: FIRST_DATA_CLUSTER,
            fat_bytes: geometry.fat_bytes() as usize,
            fat_count: geometry.fat_count,
            fat_offset: geometry.fat_offset,
            medium_descriptor: geometry.medium_descriptor,
            dirty: false,
        }
    }

    /// Writes the table to every FAT copy.
    pub fn write<D: BlockDevice>(&mut self, device: &mut D) -> Result<()> {
        let mut data = vec![0u8; self.fat_bytes];
        for (index, raw) in self.entries.iter().enumerate() {
            self.variant.write_entry(&mut data, index, *raw);
        }
        for copy in 0..self.fat_count {
            let offset = self.fat_offset + copy as u64 * self.fat_bytes as u64;
            device.write(offset, &data)?;
        }
        self.dirty = false;
        log::debug!(
            "fat: wrote copies={} bytes={} free={}",
            self.fat_count,
            self.fat_bytes,
            self.free_cluster_count()
        );
        Ok(())
    }

    pub fn variant(&self) -> FatVariant {
        self.variant
    }

    pub fn medium_descriptor(&self) -> u8 {
        self.medium_descriptor
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of table slots, including the two reserved ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_cluster(&self) -> u32 {
        self.last_cluster
    }

    pub fn next_free_hint(&self) -> u32 {
        self.next_free
    }

    /// Seeds the round-robin search, typically from the FAT32 FS-info sector.
    pub fn set_next_free_hint(&mut self, cluster: u32) {
        self.next_free = if (FIRST_DATA_CLUSTER..self.last_cluster).contains(&cluster) {
            cluster
        } else {
            FIRST_DATA_CLUSTER
        };
    }

    fn check_cluster(&self, cluster: u32) -> Result<()> {
        if cluster < FIRST_DATA_CLUSTER || cluster >= self.last_cluster {
            return Err(FatError::InvalidCluster(cluster));
        }
        Ok(())
    }

    pub fn entry(&self, cluster: u32) -> Result<ClusterEntry> {
        self.check_cluster(cluster)?;
        Ok(self.variant.decode(self.entries[cluster as usize]))
    }

    fn store(&mut self, cluster: u32, value: u32) {
        let slot = &mut self.entries[cluster as usize];
        let mask = self.variant.mask();
        *slot = (*slot & !mask) | (value & mask);
        self.dirty = true;
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        self.variant.decode(self.entries[cluster as usize]) == ClusterEntry::Free
    }

    pub fn free_cluster_count(&self) -> u32 {
        (FIRST_DATA_CLUSTER..self.last_cluster)
            .filter(|cluster| self.is_free(*cluster))
            .count() as u32
    }

    /// Follows one link. `Ok(None)` marks the end of the chain.
    pub fn next_cluster(&self, cluster: u32) -> Result<Option<u32>> {
        match self.entry(cluster)? {
            ClusterEntry::Eof => Ok(None),
            ClusterEntry::Next(next) => {
                if next >= self.last_cluster {
                    return Err(FatError::InvalidCluster(next));
                }
                Ok(Some(next))
            }
            ClusterEntry::Free => Err(FatError::CorruptEntry("chain runs into a free cluster")),
            ClusterEntry::Reserved(value) => Err(FatError::InvalidCluster(value)),
        }
    }

    /// Every cluster of the chain starting at `start`, in order. A chain
    /// longer than the table means a cycle.
    pub fn enumerate_chain(&self, start: u32) -> Result<Vec<u32>> {
        self.check_cluster(start)?;
        let limit = self.last_cluster as usize;
        let mut chain = vec![start];
        let mut cluster = start;
        while let Some(next) = self.next_cluster(cluster)? {
            if chain.len() >= limit {
                return Err(FatError::CorruptEntry("cluster chain loops"));
            }
            chain.push(next);
            cluster = next;
        }
        log::trace!("fat: chain start={} len={}", start, chain.len());
        Ok(chain)
    }

    /// Last cluster of the chain starting at `start`.
    pub fn chain_tail(&self, start: u32) -> Result<u32> {
        self.check_cluster(start)?;
        let mut visited = 1usize;
        let mut cluster = start;
        while let Some(next) = self.next_cluster(cluster)? {
            if visited >= self.last_cluster as usize {
                return Err(FatError::CorruptEntry("cluster chain loops"));
            }
            visited += 1;
            cluster = next;
        }
        Ok(cluster)
    }

    fn find_free(&self) -> Option<u32> {
        let start = self.next_free.max(FIRST_DATA_CLUSTER);
        (start..self.last_cluster)
            .chain(FIRST_DATA_CLUSTER..start.min(self.last_cluster))
            .find(|cluster| self.is_free(*cluster))
    }

    /// Takes one free cluster, marks it end-of-chain and advances the
    /// round-robin hint past it.
    pub fn allocate_one(&mut self) -> Result<u32> {
        let cluster = self.find_free().ok_or(FatError::VolumeFull)?;
        self.store(cluster, self.variant.eof_marker());
        let hint = (cluster + 1) % self.last_cluster;
        self.next_free = hint.max(FIRST_DATA_CLUSTER);
        log::trace!("fat: alloc cluster={} hint={}", cluster, self.next_free);
        Ok(cluster)
    }

    /// Allocates a linked chain of `count` clusters. Nothing is allocated when
    /// the volume cannot hold all of them.
    pub fn allocate_chain(&mut self, count: u32) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.free_cluster_count() {
            return Err(FatError::VolumeFull);
        }
        let mut chain = Vec::with_capacity(count as usize);
        let mut tail = self.allocate_one()?;
        chain.push(tail);
        for _ in 1..count {
            let next = self.allocate_one()?;
            self.store(tail, next);
            chain.push(next);
            tail = next;
        }
        log::debug!("fat: alloc chain start={} len={}", chain[0], count);
        Ok(chain)
    }

    /// Extends the chain containing `cluster` by one cluster.
    pub fn append_to(&mut self, cluster: u32) -> Result<u32> {
        let tail = self.chain_tail(cluster)?;
        self.link_after(tail)
    }

    /// Allocates one cluster and links it after `tail`, which must currently
    /// be the end of its chain.
    pub fn link_after(&mut self, tail: u32) -> Result<u32> {
        if self.entry(tail)? != ClusterEntry::Eof {
            return Err(FatError::CorruptEntry("append target is not a chain end"));
        }
        let new = self.allocate_one()?;
        self.store(tail, new);
        Ok(new)
    }

    pub fn set_free(&mut self, cluster: u32) -> Result<()> {
        self.check_cluster(cluster)?;
        self.store(cluster, 0);
        Ok(())
    }

    pub fn set_eof(&mut self, cluster: u32) -> Result<()> {
        self.check_cluster(cluster)?;
        self.store(cluster, self.variant.eof_marker());
        Ok(())
    }

    /// Releases a whole chain. The chain is walked first so a corrupt link
    /// leaves the table untouched.
    pub fn free_chain(&mut self, start: u32) -> Result<u32> {
        let chain = self.enumerate_chain(start)?;
        for cluster in chain.iter() {
            self.store(*cluster, 0);
        }
        log::debug!("fat: free chain start={} len={}", start, chain.len());
        Ok(chain.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::MemoryDevice, fat::variant::FatVariant};

    fn geometry(variant: FatVariant, clusters: u32) -> Geometry {
        let sectors_per_fat = variant.bytes_for(clusters as u64 + 2).div_ceil(512) as u32;
        Geometry {
            variant,
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_count: 2,
            sectors_per_fat,
            root_entry_count: 16,
            root_dir_first_cluster: 0,
            medium_descriptor: 0xF8,
            cluster_count: clusters,
            fat_offset: 512,
            root_dir_offset: 512 + 2 * sectors_per_fat as u64 * 512,
            data_offset: 512 + 2 * sectors_per_fat as u64 * 512 + 512,
        }
    }

    #[test]
    fn fresh_table_reserves_first_two_entries() {
        let table = AllocationTable::new(&geometry(FatVariant::Fat16, 100));
        assert_eq!(table.entries[0], 0xFFF8);
        assert_eq!(table.entries[1], 0xFFFF);
        assert_eq!(table.free_cluster_count(), 100);
    }

    #[test]
    fn allocation_wraps_around_the_hint() {
        let mut table = AllocationTable::new(&geometry(FatVariant::Fat12, 10));
        table.set_next_free_hint(10);
        assert_eq!(table.allocate_one().unwrap(), 10);
        assert_eq!(table.allocate_one().unwrap(), 11);
        assert_eq!(table.next_free_hint(), FIRST_DATA_CLUSTER);
        assert_eq!(table.allocate_one().unwrap(), 2);
    }

    #[test]
    fn chain_alloc_links_in_order_and_frees_back() {
        let mut table = AllocationTable::new(&geometry(FatVariant::Fat32, 64));
        let before = table.free_cluster_count();
        let chain = table.allocate_chain(5).unwrap();
        assert_eq!(table.enumerate_chain(chain[0]).unwrap(), chain);
        assert_eq!(table.entry(chain[4]).unwrap(), ClusterEntry::Eof);
        assert_eq!(table.free_cluster_count(), before - 5);

        let appended = table.append_to(chain[2]).unwrap();
        assert_eq!(table.chain_tail(chain[0]).unwrap(), appended);

        assert_eq!(table.free_chain(chain[0]).unwrap(), 6);
        assert_eq!(table.free_cluster_count(), before);
    }

    #[test]
    fn full_volume_allocates_nothing() {
        let mut table = AllocationTable::new(&geometry(FatVariant::Fat16, 4));
        table.allocate_chain(3).unwrap();
        let free = table.free_cluster_count();
        assert!(matches!(table.allocate_chain(2), Err(FatError::VolumeFull)));
        assert_eq!(table.free_cluster_count(), free);
        table.allocate_one().unwrap();
        assert!(matches!(table.allocate_one(), Err(FatError::VolumeFull)));
    }

    #[test]
    fn cyclic_chain_is_reported_not_followed() {
        let mut table = AllocationTable::new(&geometry(FatVariant::Fat16, 16));
        table.store(2, 3);
        table.store(3, 4);
        table.store(4, 2);
        assert!(matches!(
            table.enumerate_chain(2),
            Err(FatError::CorruptEntry(_))
        ));
        assert!(matches!(table.append_to(2), Err(FatError::CorruptEntry(_))));
        assert!(matches!(table.free_chain(2), Err(FatError::CorruptEntry(_))));
        assert!(!table.is_free(2));
    }

    #[test]
    fn out_of_range_links_are_invalid() {
        let mut table = AllocationTable::new(&geometry(FatVariant::Fat16, 16));
        table.store(2, 500);
        assert!(matches!(
            table.enumerate_chain(2),
            Err(FatError::InvalidCluster(500))
        ));
        assert!(matches!(table.set_free(1), Err(FatError::InvalidCluster(1))));
    }

    #[test]
    fn links_into_the_highest_clusters_are_followed() {
        let mut table = AllocationTable::new(&geometry(FatVariant::Fat16, 65524));
        assert_eq!(table.last_cluster(), 0xFFF6);
        table.set_next_free_hint(0xFFF3);
        let chain = table.allocate_chain(3).unwrap();
        assert_eq!(chain, [0xFFF3, 0xFFF4, 0xFFF5]);
        assert_eq!(table.enumerate_chain(0xFFF3).unwrap(), chain);
        assert_eq!(table.free_chain(0xFFF3).unwrap(), 3);

        table.store(2, 0xFFF7);
        assert!(matches!(
            table.next_cluster(2),
            Err(FatError::InvalidCluster(0xFFF7))
        ));
    }

    #[test]
    fn fat12_table_survives_write_and_read() {
        let geo = geometry(FatVariant::Fat12, 40);
        let mut dev = MemoryDevice::new(64 * 1024);
        let mut table = AllocationTable::new(&geo);
        let chain = table.allocate_chain(7).unwrap();
        table.write(&mut dev).unwrap();
        assert!(!table.is_dirty());

        let back = AllocationTable::read(&mut dev, &geo).unwrap();
        assert_eq!(back.enumerate_chain(chain[0]).unwrap(), chain);
        assert_eq!(back.free_cluster_count(), 33);

        let copy0 = geo.fat_copy_offset(0) as usize;
        let copy1 = geo.fat_copy_offset(1) as usize;
        let len = geo.fat_bytes() as usize;
        assert_eq!(
            &dev.as_bytes()[copy0..copy0 + len],
            &dev.as_bytes()[copy1..copy1 + len]
        );
    }
}
