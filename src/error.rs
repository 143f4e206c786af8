use core::fmt;
use std::io;

pub type Result<T> = core::result::Result<T, FatError>;

#[derive(Debug)]
pub enum FatError {
    Io(io::Error),
    VolumeFull,
    DirectoryFull,
    InvalidCluster(u32),
    CorruptEntry(&'static str),
    ReadOnlyViolation,
    NameGenerationFailure,
    InvalidBootSector,
    UnsupportedFatType,
    UnsupportedSectorSize(u16),
    UnsupportedSectorsPerCluster(u8),
    InvalidName,
    NameTooLong,
    NotFound,
    AlreadyExists,
    NotDirectory,
    IsDirectory,
    NotEmpty,
    DotEntry,
    NotRootDirectory,
    CyclicMove,
    OutOfRange { offset: u64, len: usize, length: u64 },
    FileTooLarge,
    DeviceTooSmall,
    DeviceTooLarge,
    StaleHandle,
}

impl FatError {
    /// True for the two capacity errors, which callers usually want to report
    /// differently from hard failures.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Self::VolumeFull | Self::DirectoryFull)
    }
}

impl From<io::Error> for FatError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl fmt::Display for FatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "device i/o failed: {err}"),
            Self::VolumeFull => f.write_str("no free clusters left on the volume"),
            Self::DirectoryFull => f.write_str("directory has no room for more entries"),
            Self::InvalidCluster(cluster) => write!(f, "invalid cluster reference {cluster}"),
            Self::CorruptEntry(what) => write!(f, "corrupt on-disk structure: {what}"),
            Self::ReadOnlyViolation => f.write_str("volume is mounted read-only"),
            Self::NameGenerationFailure => f.write_str("could not derive a free 8.3 name"),
            Self::InvalidBootSector => f.write_str("invalid boot sector"),
            Self::UnsupportedFatType => f.write_str("unsupported FAT type"),
            Self::UnsupportedSectorSize(size) => write!(f, "unsupported sector size {size}"),
            Self::UnsupportedSectorsPerCluster(count) => {
                write!(f, "unsupported sectors per cluster {count}")
            }
            Self::InvalidName => f.write_str("invalid name"),
            Self::NameTooLong => f.write_str("name too long"),
            Self::NotFound => f.write_str("entry not found"),
            Self::AlreadyExists => f.write_str("entry already exists"),
            Self::NotDirectory => f.write_str("not a directory"),
            Self::IsDirectory => f.write_str("is a directory"),
            Self::NotEmpty => f.write_str("directory not empty"),
            Self::DotEntry => f.write_str("the \".\" and \"..\" entries cannot be changed"),
            Self::NotRootDirectory => f.write_str("operation only valid on the root directory"),
            Self::CyclicMove => f.write_str("cannot move a directory below itself"),
            Self::OutOfRange {
                offset,
                len,
                length,
            } => write!(
                f,
                "range offset={offset} len={len} exceeds file length {length}"
            ),
            Self::FileTooLarge => f.write_str("file length exceeds 4 GiB - 1"),
            Self::DeviceTooSmall => f.write_str("device too small for a FAT volume"),
            Self::DeviceTooLarge => f.write_str("device too large for the requested FAT type"),
            Self::StaleHandle => f.write_str("handle no longer refers to a live entry"),
        }
    }
}

impl std::error::Error for FatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}
