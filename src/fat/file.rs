//! Byte-level access to one file's contents.

use crate::{
    config::Clock,
    device::BlockDevice,
    error::{FatError, Result},
};

use super::{
    boot_sector::Geometry,
    chain::ClusterChain,
    entry::DirectoryEntry,
    lfn_dir::{EntryId, LfnDirectory},
    table::AllocationTable,
};

/// A file opened through its directory entry. The entry's length is the
/// file length; the chain may hold more. Chain writes go straight to the
/// device, entry changes are flushed with the owning directory.
pub struct File<'a, D: BlockDevice> {
    device: &'a mut D,
    fat: &'a mut AllocationTable,
    dir: &'a mut LfnDirectory,
    id: EntryId,
    entry: DirectoryEntry,
    geometry: Geometry,
    clock: Clock,
    read_only: bool,
}

impl<'a, D: BlockDevice> File<'a, D> {
    pub fn new(
        device: &'a mut D,
        fat: &'a mut AllocationTable,
        dir: &'a mut LfnDirectory,
        id: EntryId,
        geometry: Geometry,
        clock: Clock,
        read_only: bool,
    ) -> Result<Self> {
        let entry = dir.get(id)?.entry;
        if entry.is_directory() {
            return Err(FatError::IsDirectory);
        }
        Ok(Self {
            device,
            fat,
            dir,
            id,
            entry,
            geometry,
            clock,
            read_only,
        })
    }

    pub fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }

    pub fn length(&self) -> u64 {
        self.entry.length as u64
    }

    fn chain(&self) -> ClusterChain {
        ClusterChain::new(&self.geometry, self.entry.start_cluster)
    }

    pub fn chain_length(&self) -> Result<u32> {
        self.chain().chain_length(&*self.fat)
    }

    fn store(&mut self) -> Result<()> {
        let entry = self.entry;
        self.dir.update_entry(self.id, |stored| *stored = entry)
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(FatError::ReadOnlyViolation);
        }
        Ok(())
    }

    fn resize(&mut self, length: u64) -> Result<()> {
        let new_length = u32::try_from(length).map_err(|_| FatError::FileTooLarge)?;
        let mut chain = self.chain();
        chain.set_size(&mut *self.fat, length)?;
        self.entry.start_cluster = chain.start_cluster();
        self.entry.length = new_length;
        self.entry.touch_modified(self.clock.now());
        self.store()
    }

    /// Truncates or extends the file. Extension is zero-filled.
    pub fn set_length(&mut self, length: u64) -> Result<()> {
        self.check_writable()?;
        let old = self.length();
        self.resize(length)?;
        if length > old {
            self.chain()
                .write_zeroes(&*self.fat, &mut *self.device, old, length - old)?;
        }
        log::trace!("fat: file set_length {}->{}", old, length);
        Ok(())
    }

    /// Fills `buf` from `offset`. Reading past the end of the file is an
    /// error rather than a short read.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let length = self.length();
        let in_range = offset
            .checked_add(buf.len() as u64)
            .is_some_and(|end| end <= length);
        if !in_range {
            return Err(FatError::OutOfRange {
                offset,
                len: buf.len(),
                length,
            });
        }
        self.chain()
            .read_data(&*self.fat, &mut *self.device, offset, buf)?;
        if !self.read_only {
            self.entry.touch_accessed(self.clock.now());
            self.store()?;
        }
        Ok(())
    }

    /// Writes `data` at `offset`, extending the file first when needed. A gap
    /// between the old end and `offset` reads back as zeroes. A failed write
    /// leaves the length and chain as they were.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FatError::FileTooLarge)?;
        let saved = self.entry;
        let result = self.write_extending(offset, data, end);
        if result.is_err() && self.entry.length != saved.length {
            self.roll_back(saved);
        }
        result
    }

    fn write_extending(&mut self, offset: u64, data: &[u8], end: u64) -> Result<()> {
        let old = self.length();
        if end > old {
            self.resize(end)?;
            if offset > old {
                self.chain()
                    .write_zeroes(&*self.fat, &mut *self.device, old, offset - old)?;
            }
        }
        let mut chain = self.chain();
        chain.write_data(&mut *self.fat, &mut *self.device, offset, data)?;
        self.entry.touch_modified(self.clock.now());
        self.store()
    }

    fn roll_back(&mut self, saved: DirectoryEntry) {
        let mut chain = self.chain();
        if let Err(err) = chain.set_size(&mut *self.fat, saved.length as u64) {
            log::warn!(
                "fat: write rollback left chain start={} err={}",
                chain.start_cluster(),
                err
            );
            return;
        }
        self.entry = saved;
        if let Err(err) = self.store() {
            log::warn!("fat: write rollback entry err={}", err);
        }
    }

    /// Reads the whole file.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.length() as usize];
        self.read(0, &mut out)?;
        Ok(out)
    }

    /// Chain writes are immediate; entry metadata is persisted when the
    /// directory is flushed.
    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
