//! Byte-addressed block devices the engine reads and writes through.
//!
//! The engine never caches sectors itself; every component issues byte-range
//! reads and writes against a [`BlockDevice`].

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
};

use embedded_storage::{ReadStorage, Storage};

pub const DEFAULT_SECTOR_SIZE: u32 = 512;

pub trait BlockDevice {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    fn sector_size(&self) -> u32;

    fn size_in_bytes(&self) -> u64;

    fn is_read_only(&self) -> bool {
        false
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        (**self).write(offset, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn size_in_bytes(&self) -> u64 {
        (**self).size_in_bytes()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

fn check_range(offset: u64, len: usize, size: u64) -> io::Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
    if end > size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("access offset={offset} len={len} beyond device size {size}"),
        ));
    }
    Ok(())
}

/// Vec-backed device, mostly for tests and image building.
#[derive(Clone, Debug)]
pub struct MemoryDevice {
    data: Vec<u8>,
    sector_size: u32,
    read_only: bool,
}

impl MemoryDevice {
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0; size])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            sector_size: DEFAULT_SECTOR_SIZE,
            read_only: false,
        }
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for MemoryDevice {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "memory device is read-only",
            ));
        }
        check_range(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn size_in_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Disk image stored in a regular file.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    size: u64,
    read_only: bool,
}

impl FileDevice {
    pub fn open(file: File, read_only: bool) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            read_only,
        })
    }

    /// Grows (or truncates) the backing file to `size` bytes.
    pub fn create(file: File, size: u64) -> io::Result<Self> {
        file.set_len(size)?;
        Self::open(file, false)
    }

    pub fn into_inner(self) -> File {
        self.file
    }
}

impl BlockDevice for FileDevice {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file device opened read-only",
            ));
        }
        check_range(offset, buf.len(), self.size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.flush()?;
        self.file.sync_data()
    }

    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    fn size_in_bytes(&self) -> u64 {
        self.size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Adapter for any `embedded-storage` backend (NOR flash partitions, RAM
/// disks on microcontrollers). Offsets are limited to the 32-bit range those
/// traits expose.
pub struct StorageDevice<S> {
    storage: S,
    sector_size: u32,
}

impl<S: Storage> StorageDevice<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    fn storage_offset(offset: u64) -> io::Result<u32> {
        u32::try_from(offset).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} beyond 32-bit storage range"),
            )
        })
    }
}

impl<S> BlockDevice for StorageDevice<S>
where
    S: Storage,
    S::Error: core::fmt::Debug,
{
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.size_in_bytes())?;
        let offset = Self::storage_offset(offset)?;
        self.storage
            .read(offset, buf)
            .map_err(|err| io::Error::other(format!("storage read failed: {err:?}")))
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.size_in_bytes())?;
        let offset = Self::storage_offset(offset)?;
        self.storage
            .write(offset, buf)
            .map_err(|err| io::Error::other(format!("storage write failed: {err:?}")))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn size_in_bytes(&self) -> u64 {
        self.storage.capacity() as u64
    }
}
