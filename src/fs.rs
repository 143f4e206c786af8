//! Mount handle tying the boot sector, allocation table and directory cache
//! to one device.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};

use crate::{
    config::{FormatOptions, FsConfig},
    device::BlockDevice,
    error::{FatError, Result},
    fat::{
        boot_sector::{BootSector, Geometry, NO_NAME_LABEL},
        directory::{encode_label, Directory},
        entry::{Attributes, DirectoryEntry},
        file::File,
        format::format_volume,
        fs_info::{FsInfoSector, UNKNOWN},
        lfn_dir::{EntryId, LfnDirectory},
        short_name::ShortName,
        table::AllocationTable,
        variant::{ClusterEntry, FatVariant},
    },
};

/// A materialized directory, identified by its first cluster. The root is
/// always `DirHandle::ROOT`, matching the 0 that ".." entries store for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirHandle(u32);

impl DirHandle {
    pub const ROOT: Self = Self(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

/// One entry inside one directory. Valid until the entry is removed or moved
/// away, after which calls using it fail with [`FatError::StaleHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryRef {
    pub dir: DirHandle,
    pub id: EntryId,
}

/// Snapshot of an entry's metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub short_name: String,
    pub attributes: Attributes,
    pub length: u32,
    pub start_cluster: u32,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub accessed: Option<NaiveDate>,
}

impl EntryInfo {
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }
}

pub struct FileSystem<D: BlockDevice> {
    device: D,
    boot: BootSector,
    geometry: Geometry,
    fat: AllocationTable,
    fs_info: Option<FsInfoSector>,
    config: FsConfig,
    dirs: HashMap<DirHandle, LfnDirectory>,
    boot_dirty: bool,
    read_only: bool,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Reads the boot sector, the allocation table and the root directory.
    /// The mount is read-only when asked to be or when the device is.
    pub fn mount(mut device: D, config: FsConfig) -> Result<Self> {
        let boot = BootSector::read(&mut device)?;
        let geometry = boot.geometry();
        let mut fat = AllocationTable::read(&mut device, &geometry)?;

        let fs_info = if boot.variant == FatVariant::Fat32 && boot.fs_info_sector != 0 {
            let offset = boot.fs_info_sector as u64 * geometry.bytes_per_sector as u64;
            match FsInfoSector::read(&mut device, offset) {
                Ok(info) => {
                    if let Some(hint) = info.next_free_hint() {
                        fat.set_next_free_hint(hint);
                    }
                    let free = fat.free_cluster_count();
                    if info.free_cluster_count != UNKNOWN && info.free_cluster_count != free {
                        log::warn!(
                            "fat: stale fs-info free count stored={} actual={}",
                            info.free_cluster_count,
                            free
                        );
                    }
                    Some(info)
                }
                Err(err) => {
                    log::warn!("fat: ignoring fs-info sector err={}", err);
                    None
                }
            }
        } else {
            None
        };

        let read_only = config.read_only || device.is_read_only();
        let root = LfnDirectory::new(Directory::open_root(&mut device, &fat, &geometry)?);
        let mut dirs = HashMap::new();
        dirs.insert(DirHandle::ROOT, root);

        log::debug!(
            "fat: mount variant={} clusters={} cluster_size={} read_only={}",
            geometry.variant,
            geometry.cluster_count,
            geometry.cluster_size(),
            read_only
        );
        Ok(Self {
            device,
            boot,
            geometry,
            fat,
            fs_info,
            config,
            dirs,
            boot_dirty: false,
            read_only,
        })
    }

    /// Formats the whole device, then mounts it.
    pub fn format(mut device: D, options: &FormatOptions, config: FsConfig) -> Result<Self> {
        format_volume(&mut device, options)?;
        Self::mount(device, config)
    }

    pub fn variant(&self) -> FatVariant {
        self.geometry.variant
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn root_dir(&self) -> DirHandle {
        DirHandle::ROOT
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(FatError::ReadOnlyViolation);
        }
        Ok(())
    }

    fn dir(&self, dir: DirHandle) -> Result<&LfnDirectory> {
        self.dirs.get(&dir).ok_or(FatError::StaleHandle)
    }

    fn handle_for_cluster(&self, cluster: u32) -> DirHandle {
        let fat32_root = self.geometry.variant == FatVariant::Fat32
            && cluster == self.geometry.root_dir_first_cluster;
        if cluster == 0 || fat32_root {
            DirHandle::ROOT
        } else {
            DirHandle(cluster)
        }
    }

    /// Returns the cached directory stored at `cluster`, reading it on first
    /// use.
    fn load_dir(&mut self, cluster: u32) -> Result<DirHandle> {
        let handle = self.handle_for_cluster(cluster);
        if self.dirs.contains_key(&handle) {
            return Ok(handle);
        }
        if self.fat.entry(cluster)? == ClusterEntry::Free {
            return Err(FatError::StaleHandle);
        }
        let dir = Directory::open_chain(&mut self.device, &self.fat, &self.geometry, cluster, false)?;
        self.dirs.insert(handle, LfnDirectory::new(dir));
        Ok(handle)
    }

    /// Materializes the directory an entry refers to. "." yields the
    /// directory itself and ".." its parent.
    pub fn open_dir(&mut self, entry: EntryRef) -> Result<DirHandle> {
        let named = self.dir(entry.dir)?.get(entry.id)?.entry;
        if !named.is_directory() {
            return Err(FatError::NotDirectory);
        }
        if named.short_name == ShortName::DOT {
            return Ok(entry.dir);
        }
        self.load_dir(named.start_cluster)
    }

    /// Every entry of `dir`, "." and ".." included, in on-disk order.
    pub fn entries(&self, dir: DirHandle) -> Result<Vec<EntryRef>> {
        Ok(self
            .dir(dir)?
            .iter()
            .map(|(id, _)| EntryRef { dir, id })
            .collect())
    }

    /// Metadata of every entry of `dir` except "." and "..".
    pub fn list(&self, dir: DirHandle) -> Result<Vec<EntryInfo>> {
        let lfn = self.dir(dir)?;
        lfn.iter()
            .filter(|(_, named)| !named.entry.is_dot_entry())
            .map(|(id, _)| self.info_in(lfn, id))
            .collect()
    }

    pub fn entry_info(&self, entry: EntryRef) -> Result<EntryInfo> {
        self.info_in(self.dir(entry.dir)?, entry.id)
    }

    fn info_in(&self, lfn: &LfnDirectory, id: EntryId) -> Result<EntryInfo> {
        let named = lfn.get(id)?;
        let entry = &named.entry;
        Ok(EntryInfo {
            name: named.name(),
            short_name: entry.short_name.as_simple_string().as_str().to_string(),
            attributes: entry.attributes,
            length: entry.length,
            start_cluster: entry.start_cluster,
            created: entry.created_at(),
            modified: entry.modified_at(),
            accessed: entry.accessed_on(),
        })
    }

    /// Finds `name` in `dir` by long name or 8.3 name, ignoring case.
    pub fn lookup(&self, dir: DirHandle, name: &str) -> Result<EntryRef> {
        let id = self.dir(dir)?.lookup(name).ok_or(FatError::NotFound)?;
        Ok(EntryRef { dir, id })
    }

    /// Resolves a `/`-separated path to the directory it names. The empty
    /// path and "/" are the root.
    pub fn resolve_dir(&mut self, path: &str) -> Result<DirHandle> {
        let mut dir = DirHandle::ROOT;
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            dir = self.step(dir, segment)?;
        }
        Ok(dir)
    }

    /// Resolves a `/`-separated path to an entry. Every segment but the last
    /// must name a directory.
    pub fn resolve(&mut self, path: &str) -> Result<EntryRef> {
        let trimmed = path.trim_end_matches('/');
        let (parent, name) = match trimmed.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", trimmed),
        };
        if name.is_empty() {
            return Err(FatError::InvalidName);
        }
        let dir = self.resolve_dir(parent)?;
        self.lookup(dir, name)
    }

    fn step(&mut self, dir: DirHandle, segment: &str) -> Result<DirHandle> {
        match segment {
            "." => Ok(dir),
            ".." if dir.is_root() => Ok(dir),
            _ => {
                let entry = self.lookup(dir, segment)?;
                self.open_dir(entry)
            }
        }
    }

    pub fn add_file(&mut self, dir: DirHandle, name: &str) -> Result<EntryRef> {
        self.check_writable()?;
        let now = self.config.clock.now();
        let lfn = self.dirs.get_mut(&dir).ok_or(FatError::StaleHandle)?;
        let id = lfn.add_file(&mut self.fat, name, now)?;
        Ok(EntryRef { dir, id })
    }

    /// Creates a subdirectory and caches it; the returned handle is usable
    /// right away.
    pub fn add_directory(&mut self, dir: DirHandle, name: &str) -> Result<(EntryRef, DirHandle)> {
        self.check_writable()?;
        let now = self.config.clock.now();
        let Self {
            device,
            geometry,
            fat,
            dirs,
            ..
        } = self;
        let lfn = dirs.get_mut(&dir).ok_or(FatError::StaleHandle)?;
        let (id, child) = lfn.create_subdirectory(fat, device, geometry, name, now)?;
        let handle = DirHandle(child.storage_cluster());
        dirs.insert(handle, child);
        Ok((EntryRef { dir, id }, handle))
    }

    /// Deletes an entry and releases its clusters. Directories must hold
    /// nothing but "." and "..".
    pub fn remove(&mut self, entry: EntryRef) -> Result<()> {
        self.check_writable()?;
        let target = self.dir(entry.dir)?.get(entry.id)?.entry;
        if target.is_dot_entry() {
            return Err(FatError::DotEntry);
        }
        let child = if target.is_directory() {
            let handle = self.load_dir(target.start_cluster)?;
            if !self.dir(handle)?.has_only_dot_entries() {
                return Err(FatError::NotEmpty);
            }
            Some(handle)
        } else {
            None
        };

        let Self {
            device, fat, dirs, ..
        } = self;
        let lfn = dirs.get_mut(&entry.dir).ok_or(FatError::StaleHandle)?;
        lfn.remove(fat, entry.id)?;
        lfn.flush(fat, device)?;
        if let Some(handle) = child {
            dirs.remove(&handle);
        }
        Ok(())
    }

    pub fn rename(&mut self, entry: EntryRef, new_name: &str) -> Result<()> {
        self.check_writable()?;
        let lfn = self.dirs.get_mut(&entry.dir).ok_or(FatError::StaleHandle)?;
        lfn.rename(&mut self.fat, entry.id, new_name)
    }

    /// Replaces the user-settable attribute bits. The directory bit is kept
    /// as it is.
    pub fn set_attributes(&mut self, entry: EntryRef, attributes: Attributes) -> Result<()> {
        self.check_writable()?;
        let settable = Attributes::READ_ONLY
            | Attributes::HIDDEN
            | Attributes::SYSTEM
            | Attributes::ARCHIVE;
        let lfn = self.dirs.get_mut(&entry.dir).ok_or(FatError::StaleHandle)?;
        if lfn.get(entry.id)?.entry.is_dot_entry() {
            return Err(FatError::DotEntry);
        }
        lfn.update_entry(entry.id, |stored| {
            stored.attributes = (stored.attributes - settable) | (attributes & settable);
        })
    }

    fn parent_of(&mut self, dir: DirHandle) -> Result<Option<DirHandle>> {
        if dir.is_root() {
            return Ok(None);
        }
        let cluster = {
            let lfn = self.dir(dir)?;
            let id = lfn
                .lookup("..")
                .ok_or(FatError::CorruptEntry("directory has no \"..\" entry"))?;
            lfn.get(id)?.entry.start_cluster
        };
        self.load_dir(cluster).map(Some)
    }

    fn is_within(&mut self, dir: DirHandle, ancestor: DirHandle) -> Result<bool> {
        let mut current = Some(dir);
        for _ in 0..=self.geometry.cluster_count {
            match current {
                Some(handle) if handle == ancestor => return Ok(true),
                Some(handle) => current = self.parent_of(handle)?,
                None => return Ok(false),
            }
        }
        Err(FatError::CorruptEntry("directory parents form a cycle"))
    }

    /// Moves an entry into `target`, optionally under a new name. Clusters
    /// stay where they are; a moved directory gets its ".." rewritten.
    pub fn move_entry(
        &mut self,
        entry: EntryRef,
        target: DirHandle,
        new_name: Option<&str>,
    ) -> Result<EntryRef> {
        self.check_writable()?;
        let named = self.dir(entry.dir)?.get(entry.id)?.clone();
        if named.entry.is_dot_entry() {
            return Err(FatError::DotEntry);
        }
        self.dir(target)?;
        if target == entry.dir {
            if let Some(name) = new_name {
                self.rename(entry, name)?;
            }
            return Ok(entry);
        }

        let moved_dir = if named.entry.is_directory() {
            let handle = self.load_dir(named.entry.start_cluster)?;
            if self.is_within(target, handle)? {
                return Err(FatError::CyclicMove);
            }
            Some(handle)
        } else {
            None
        };

        let name = new_name.map_or_else(|| named.name(), str::to_string);
        let Self { fat, dirs, .. } = self;
        let destination = dirs.get_mut(&target).ok_or(FatError::StaleHandle)?;
        let id = destination.insert_named(fat, &name, named.entry)?;
        let parent_reference = destination.parent_reference();

        let detached = dirs
            .get_mut(&entry.dir)
            .ok_or(FatError::StaleHandle)
            .and_then(|source| source.detach(fat, entry.id));
        if let Err(err) = detached {
            if let Some(destination) = dirs.get_mut(&target) {
                destination.detach(fat, id)?;
            }
            return Err(err);
        }

        if let Some(handle) = moved_dir {
            dirs.get_mut(&handle)
                .ok_or(FatError::StaleHandle)?
                .set_parent_reference(parent_reference)?;
        }
        log::debug!("fat: move name={} to_dir={:?}", name, target);
        Ok(EntryRef { dir: target, id })
    }

    /// Opens a regular file for byte access. Metadata changes land in the
    /// owning directory and are persisted by [`FileSystem::flush`].
    pub fn file(&mut self, entry: EntryRef) -> Result<File<'_, D>> {
        let Self {
            device,
            geometry,
            fat,
            dirs,
            config,
            read_only,
            ..
        } = self;
        let lfn = dirs.get_mut(&entry.dir).ok_or(FatError::StaleHandle)?;
        File::new(device, fat, lfn, entry.id, *geometry, config.clock, *read_only)
    }

    pub fn free_clusters(&self) -> u32 {
        self.fat.free_cluster_count()
    }

    pub fn free_space(&self) -> u64 {
        self.free_clusters() as u64 * self.geometry.cluster_size() as u64
    }

    pub fn total_space(&self) -> u64 {
        self.geometry.cluster_count as u64 * self.geometry.cluster_size() as u64
    }

    /// The root directory's label entry, falling back to the boot sector
    /// copy.
    pub fn volume_label(&self) -> Option<String> {
        if let Some(label) = self.dir(DirHandle::ROOT).ok().and_then(|root| root.label()) {
            let text = String::from_utf8_lossy(label.short_name.as_bytes());
            return Some(text.trim_end().to_string());
        }
        if &self.boot.volume_label == NO_NAME_LABEL {
            return None;
        }
        Some(self.boot.volume_label_text())
    }

    /// Sets or clears the label in both the root directory and the boot
    /// sector.
    pub fn set_volume_label(&mut self, label: Option<&str>) -> Result<()> {
        self.check_writable()?;
        let raw = label.map(encode_label).transpose()?;
        let now = self.config.clock.now();
        let entry = raw.map(|raw| DirectoryEntry::volume_label(ShortName::from_raw(raw), now));
        let root = self
            .dirs
            .get_mut(&DirHandle::ROOT)
            .ok_or(FatError::StaleHandle)?;
        root.set_label(&mut self.fat, entry)?;
        self.boot.set_volume_label(raw);
        self.boot_dirty = true;
        Ok(())
    }

    /// Writes every dirty directory, the allocation table, the FS-info
    /// sector and the boot sector, then flushes the device.
    pub fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let Self {
            device,
            boot,
            fat,
            fs_info,
            dirs,
            boot_dirty,
            ..
        } = self;
        for dir in dirs.values_mut() {
            dir.flush(fat, device)?;
        }
        if fat.is_dirty() {
            fat.write(device)?;
            if let Some(info) = fs_info {
                info.free_cluster_count = fat.free_cluster_count();
                info.next_free_cluster = fat.next_free_hint();
                info.write(device)?;
            }
        }
        if *boot_dirty {
            boot.write(device)?;
            *boot_dirty = false;
        }
        device.flush()?;
        log::debug!("fat: flush free={}", fat.free_cluster_count());
        Ok(())
    }

    /// Flushes and hands the device back.
    pub fn close(mut self) -> Result<D> {
        self.flush()?;
        Ok(self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Clock, device::MemoryDevice};
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn fresh(size: usize, options: FormatOptions) -> FileSystem<MemoryDevice> {
        let config = FsConfig::default().with_clock(Clock::Fixed(at()));
        FileSystem::format(MemoryDevice::new(size), &options, config).unwrap()
    }

    #[test]
    fn paths_resolve_through_subdirectories() {
        let mut fs = fresh(2 * 1024 * 1024, FormatOptions::new());
        let (_, docs) = fs.add_directory(DirHandle::ROOT, "Documents").unwrap();
        let (_, notes) = fs.add_directory(docs, "Notes").unwrap();
        let file = fs.add_file(notes, "todo list.txt").unwrap();

        assert_eq!(fs.resolve("/Documents/Notes/todo list.txt").unwrap(), file);
        assert_eq!(fs.resolve("documents/NOTES/TODOLI~1.TXT").unwrap(), file);
        assert_eq!(fs.resolve_dir("/Documents/Notes/..").unwrap(), docs);
        assert_eq!(fs.resolve_dir("/Documents/Notes/../..").unwrap(), DirHandle::ROOT);
        assert_eq!(fs.resolve_dir("/").unwrap(), DirHandle::ROOT);
        assert!(matches!(fs.resolve("/missing/x"), Err(FatError::NotFound)));
        assert!(matches!(
            fs.resolve_dir("/Documents/Notes/todo list.txt"),
            Err(FatError::NotDirectory)
        ));
    }

    #[test]
    fn remove_refuses_non_empty_directories() {
        let mut fs = fresh(2 * 1024 * 1024, FormatOptions::new());
        let baseline = fs.free_clusters();
        let (dir_ref, dir) = fs.add_directory(DirHandle::ROOT, "box").unwrap();
        let inner = fs.add_file(dir, "item").unwrap();
        assert!(matches!(fs.remove(dir_ref), Err(FatError::NotEmpty)));

        fs.remove(inner).unwrap();
        fs.remove(dir_ref).unwrap();
        assert_eq!(fs.free_clusters(), baseline);
        assert!(matches!(fs.list(dir), Err(FatError::StaleHandle)));
        assert!(fs.list(DirHandle::ROOT).unwrap().is_empty());
    }

    #[test]
    fn dot_entries_cannot_be_removed_or_renamed() {
        let mut fs = fresh(2 * 1024 * 1024, FormatOptions::new());
        let (_, dir) = fs.add_directory(DirHandle::ROOT, "sub").unwrap();
        let dot = fs.lookup(dir, ".").unwrap();
        let dot_dot = fs.lookup(dir, "..").unwrap();
        assert!(matches!(fs.remove(dot), Err(FatError::DotEntry)));
        assert!(matches!(fs.rename(dot_dot, "up"), Err(FatError::DotEntry)));
        assert_eq!(fs.open_dir(dot).unwrap(), dir);
        assert_eq!(fs.open_dir(dot_dot).unwrap(), DirHandle::ROOT);
    }

    #[test]
    fn move_rewrites_parent_reference() {
        let mut fs = fresh(2 * 1024 * 1024, FormatOptions::new());
        let (_, a) = fs.add_directory(DirHandle::ROOT, "a").unwrap();
        let (b_ref, b) = fs.add_directory(DirHandle::ROOT, "b").unwrap();
        let moved = fs.move_entry(b_ref, a, Some("b moved")).unwrap();

        assert_eq!(moved.dir, a);
        assert!(matches!(fs.lookup(DirHandle::ROOT, "b"), Err(FatError::NotFound)));
        assert_eq!(fs.open_dir(moved).unwrap(), b);
        let dot_dot = fs.lookup(b, "..").unwrap();
        assert_eq!(fs.open_dir(dot_dot).unwrap(), a);
        assert_eq!(
            fs.entry_info(dot_dot).unwrap().start_cluster,
            fs.entry_info(fs.lookup(a, ".").unwrap()).unwrap().start_cluster
        );

        let a_ref = fs.lookup(DirHandle::ROOT, "a").unwrap();
        assert!(matches!(fs.move_entry(a_ref, b, None), Err(FatError::CyclicMove)));
    }

    #[test]
    fn label_lives_in_root_and_boot_sector() {
        let mut fs = fresh(2 * 1024 * 1024, FormatOptions::new());
        assert_eq!(fs.volume_label(), None);
        fs.set_volume_label(Some("photos")).unwrap();
        assert_eq!(fs.volume_label().as_deref(), Some("PHOTOS"));

        let mut dev = fs.close().unwrap();
        assert_eq!(BootSector::read(&mut dev).unwrap().volume_label_text(), "PHOTOS");
        let mut fs = FileSystem::mount(dev, FsConfig::default()).unwrap();
        assert_eq!(fs.volume_label().as_deref(), Some("PHOTOS"));
        fs.set_volume_label(None).unwrap();
        assert_eq!(fs.volume_label(), None);
    }

    #[test]
    fn read_only_mount_rejects_every_mutation() {
        let fs = fresh(2 * 1024 * 1024, FormatOptions::new());
        let dev = fs.close().unwrap();
        let mut fs = FileSystem::mount(dev, FsConfig::default().with_read_only(true)).unwrap();
        assert!(fs.is_read_only());
        assert!(matches!(
            fs.add_file(DirHandle::ROOT, "x"),
            Err(FatError::ReadOnlyViolation)
        ));
        assert!(matches!(
            fs.add_directory(DirHandle::ROOT, "x"),
            Err(FatError::ReadOnlyViolation)
        ));
        assert!(matches!(
            fs.set_volume_label(Some("X")),
            Err(FatError::ReadOnlyViolation)
        ));
    }
}
