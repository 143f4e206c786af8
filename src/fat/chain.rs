//! Byte addressing over one cluster chain.

use core::cmp;

use crate::{
    device::BlockDevice,
    error::{FatError, Result},
};

use super::{
    boot_sector::Geometry,
    table::AllocationTable,
    variant::FIRST_DATA_CLUSTER,
};

/// A chain identified by its first cluster; `start_cluster == 0` is the
/// empty chain. The allocation table is passed into every call instead of
/// being owned, so many chains can share one table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterChain {
    start_cluster: u32,
    cluster_size: u32,
    data_offset: u64,
}

pub fn clusters_for_size(size: u64, cluster_size: u32) -> u64 {
    size.div_ceil(cluster_size as u64)
}

impl ClusterChain {
    pub fn new(geometry: &Geometry, start_cluster: u32) -> Self {
        Self {
            start_cluster,
            cluster_size: geometry.cluster_size(),
            data_offset: geometry.data_offset,
        }
    }

    pub fn start_cluster(&self) -> u32 {
        self.start_cluster
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn is_empty(&self) -> bool {
        self.start_cluster == 0
    }

    pub fn device_offset(&self, cluster: u32, intra_cluster_offset: u32) -> u64 {
        self.data_offset
            + intra_cluster_offset as u64
            + (cluster - FIRST_DATA_CLUSTER) as u64 * self.cluster_size as u64
    }

    pub fn clusters(&self, fat: &AllocationTable) -> Result<Vec<u32>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        fat.enumerate_chain(self.start_cluster)
    }

    pub fn chain_length(&self, fat: &AllocationTable) -> Result<u32> {
        Ok(self.clusters(fat)?.len() as u32)
    }

    pub fn length_on_disk(&self, fat: &AllocationTable) -> Result<u64> {
        Ok(self.chain_length(fat)? as u64 * self.cluster_size as u64)
    }

    /// Resizes the chain to hold `size` bytes and returns the resulting
    /// capacity (a whole number of clusters).
    pub fn set_size(&mut self, fat: &mut AllocationTable, size: u64) -> Result<u64> {
        let clusters = clusters_for_size(size, self.cluster_size);
        let clusters = u32::try_from(clusters).map_err(|_| FatError::VolumeFull)?;
        self.set_chain_length(fat, clusters)?;
        Ok(clusters as u64 * self.cluster_size as u64)
    }

    /// Grows or shrinks the chain to exactly `count` clusters. Growth fails up
    /// front with `VolumeFull` when not enough clusters are free.
    pub fn set_chain_length(&mut self, fat: &mut AllocationTable, count: u32) -> Result<()> {
        if self.is_empty() {
            if count > 0 {
                let chain = fat.allocate_chain(count)?;
                self.start_cluster = chain[0];
            }
            return Ok(());
        }

        let chain = fat.enumerate_chain(self.start_cluster)?;
        let current = chain.len() as u32;
        if count > current {
            if count - current > fat.free_cluster_count() {
                return Err(FatError::VolumeFull);
            }
            let mut tail = chain[chain.len() - 1];
            for _ in current..count {
                tail = fat.link_after(tail)?;
            }
            log::debug!(
                "fat: chain start={} grow {}->{}",
                self.start_cluster,
                current,
                count
            );
        } else if count < current {
            if count > 0 {
                fat.set_eof(chain[count as usize - 1])?;
            }
            for cluster in chain[count as usize..].iter() {
                fat.set_free(*cluster)?;
            }
            if count == 0 {
                self.start_cluster = 0;
            }
            log::debug!("fat: chain shrink {}->{}", current, count);
        }
        Ok(())
    }

    /// Finds the chain index and device offset for each cluster-sized piece of
    /// the byte range `[offset, offset + len)`.
    fn segments(
        &self,
        fat: &AllocationTable,
        offset: u64,
        len: usize,
    ) -> Result<Vec<(u64, usize)>> {
        let chain = self.clusters(fat)?;
        let cluster_size = self.cluster_size as u64;
        let capacity = chain.len() as u64 * cluster_size;
        let end = offset.checked_add(len as u64).unwrap_or(u64::MAX);
        if end > capacity {
            return Err(FatError::OutOfRange {
                offset,
                len,
                length: capacity,
            });
        }

        let mut out = Vec::new();
        let mut pos = offset;
        while pos < end {
            let index = (pos / cluster_size) as usize;
            let intra = (pos % cluster_size) as u32;
            let chunk = cmp::min(end - pos, cluster_size - intra as u64) as usize;
            out.push((self.device_offset(chain[index], intra), chunk));
            pos += chunk as u64;
        }
        Ok(out)
    }

    pub fn read_data<D: BlockDevice>(
        &self,
        fat: &AllocationTable,
        device: &mut D,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut done = 0usize;
        for (device_offset, chunk) in self.segments(fat, offset, buf.len())? {
            device.read(device_offset, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Writes `data` at `offset`, growing the chain first when it is too short.
    pub fn write_data<D: BlockDevice>(
        &mut self,
        fat: &mut AllocationTable,
        device: &mut D,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FatError::FileTooLarge)?;
        if self.length_on_disk(fat)? < end {
            self.set_size(fat, end)?;
        }
        let mut done = 0usize;
        for (device_offset, chunk) in self.segments(fat, offset, data.len())? {
            device.write(device_offset, &data[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Zero-fills `[offset, offset + len)` without growing the chain.
    pub fn write_zeroes<D: BlockDevice>(
        &self,
        fat: &AllocationTable,
        device: &mut D,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let zero = vec![0u8; cmp::min(len, self.cluster_size as u64) as usize];
        let len = usize::try_from(len).map_err(|_| FatError::FileTooLarge)?;
        for (device_offset, chunk) in self.segments(fat, offset, len)? {
            device.write(device_offset, &zero[..chunk])?;
        }
        Ok(())
    }
}
