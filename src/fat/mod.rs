pub mod boot_sector;
pub mod chain;
pub mod directory;
pub mod entry;
pub mod file;
pub mod format;
pub mod fs_info;
pub mod lfn;
pub mod lfn_dir;
pub mod short_name;
pub mod table;
pub mod variant;

pub use boot_sector::{BootSector, Geometry};
pub use entry::{Attributes, DirectoryEntry};
pub use file::File;
pub use format::format_volume;
pub use lfn_dir::{EntryId, LfnDirectory, NamedEntry};
pub use short_name::ShortName;
pub use table::AllocationTable;
pub use variant::FatVariant;
