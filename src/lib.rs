//! FAT12/16/32 volume engine: allocation table, cluster chains and VFAT
//! directories over any byte-addressed block device.

pub mod config;
pub mod device;
pub mod error;
pub mod fat;
pub mod fs;

pub use config::{Clock, FormatOptions, FsConfig};
pub use device::{BlockDevice, FileDevice, MemoryDevice, StorageDevice};
pub use error::{FatError, Result};
pub use fat::{format_volume, Attributes, FatVariant};
pub use fs::{DirHandle, EntryInfo, EntryRef, FileSystem};
