//! Named view over a [`Directory`]: groups long-name fragments with their
//! short entries, keeps short and long name indices, and performs the
//! add/remove/rename operations.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;

use crate::{
    device::BlockDevice,
    error::{FatError, Result},
};

use super::{
    boot_sector::Geometry,
    chain::ClusterChain,
    directory::{Directory, Slot},
    entry::{Attributes, DirectoryEntry},
    lfn::{assemble, fragments_for, FragmentGroup, MAX_LONG_NAME_UNITS},
    short_name::{generate_short_name, GeneratedName, ShortName},
    table::AllocationTable,
};

/// Stable identity of an entry within one directory for the life of a mount.
/// Ids grow monotonically, so iteration order is on-disk order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedEntry {
    pub entry: DirectoryEntry,
    pub long_name: Option<String>,
}

impl NamedEntry {
    /// Long name when present, else the short name with its case flags.
    pub fn name(&self) -> String {
        match &self.long_name {
            Some(name) => name.clone(),
            None => self.entry.display_name().as_str().to_string(),
        }
    }

    fn slots(&self) -> Result<Vec<Slot>> {
        let mut slots = Vec::new();
        if let Some(name) = &self.long_name {
            let fragments = fragments_for(name, self.entry.short_name.checksum())?;
            slots.extend(fragments.into_iter().map(Slot::Fragment));
        }
        slots.push(Slot::Entry(self.entry));
        Ok(slots)
    }
}

fn index_key(name: &str) -> String {
    name.to_lowercase()
}

/// Trims surrounding spaces and rejects names no FAT driver would accept.
fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim_matches(' ');
    if name.is_empty() || name == "." || name == ".." {
        return Err(FatError::InvalidName);
    }
    if name.chars().any(|ch| {
        ch < ' ' || matches!(ch, '"' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|')
    }) {
        return Err(FatError::InvalidName);
    }
    if name.encode_utf16().count() > MAX_LONG_NAME_UNITS {
        return Err(FatError::NameTooLong);
    }
    Ok(name)
}

#[derive(Debug)]
pub struct LfnDirectory {
    dir: Directory,
    entries: BTreeMap<EntryId, NamedEntry>,
    short_index: HashMap<ShortName, EntryId>,
    long_index: HashMap<String, EntryId>,
    next_id: u32,
}

impl LfnDirectory {
    /// Builds the named view from the slots `dir` was read with. Fragments
    /// that do not form a valid group are dropped with a warning and the
    /// entry falls back to its short name.
    pub fn new(dir: Directory) -> Self {
        let slots = dir.slots().to_vec();
        let mut this = Self {
            dir,
            entries: BTreeMap::new(),
            short_index: HashMap::new(),
            long_index: HashMap::new(),
            next_id: 0,
        };

        let mut pending = FragmentGroup::new();
        for slot in slots {
            match slot {
                Slot::Fragment(fragment) => {
                    if fragment.is_last && !pending.is_empty() {
                        log::warn!("fat: orphaned long name fragments count={}", pending.len());
                        pending.clear();
                    }
                    if pending.push(fragment).is_err() {
                        log::warn!("fat: long name has too many fragments");
                        pending.clear();
                    }
                }
                Slot::Entry(entry) => {
                    let long_name = if pending.is_empty() {
                        None
                    } else if entry.is_dot_entry() {
                        log::warn!("fat: ignoring long name on dot entry");
                        None
                    } else {
                        match assemble(&pending, &entry.short_name) {
                            Ok(name) => Some(name),
                            Err(err) => {
                                log::warn!(
                                    "fat: long name dropped short={} err={}",
                                    entry.short_name,
                                    err
                                );
                                None
                            }
                        }
                    };
                    pending.clear();
                    this.insert_indexed(NamedEntry { entry, long_name });
                }
            }
        }
        if !pending.is_empty() {
            log::warn!("fat: trailing long name fragments count={}", pending.len());
        }
        this.drop_unused_fragments();
        this
    }

    /// Removes fragments that were not attached to any entry from the slot
    /// list, so they no longer count against the directory's capacity.
    fn drop_unused_fragments(&mut self) {
        match self.collect_slots(None, None) {
            Ok(slots) if slots.len() < self.dir.slots().len() => {
                log::debug!(
                    "fat: dropped unused fragments count={}",
                    self.dir.slots().len() - slots.len()
                );
                self.dir.replace_with_fewer(slots);
            }
            Ok(_) => {}
            Err(err) => log::warn!("fat: slot list rebuild failed err={}", err),
        }
    }

    fn insert_indexed(&mut self, named: NamedEntry) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.index(id, &named);
        self.entries.insert(id, named);
        id
    }

    fn index(&mut self, id: EntryId, named: &NamedEntry) {
        self.short_index.insert(named.entry.short_name, id);
        if self.long_index.insert(index_key(&named.name()), id).is_some() {
            log::warn!("fat: duplicate name in directory name={}", named.name());
        }
    }

    fn unindex(&mut self, id: EntryId, named: &NamedEntry) {
        if self.short_index.get(&named.entry.short_name) == Some(&id) {
            self.short_index.remove(&named.entry.short_name);
        }
        let key = index_key(&named.name());
        if self.long_index.get(&key) == Some(&id) {
            self.long_index.remove(&key);
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.dir
    }

    pub fn is_root(&self) -> bool {
        self.dir.is_root()
    }

    pub fn storage_cluster(&self) -> u32 {
        self.dir.storage_cluster()
    }

    /// Cluster number children record in their ".." entry.
    pub fn parent_reference(&self) -> u32 {
        if self.dir.is_root() {
            0
        } else {
            self.dir.storage_cluster()
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dir.is_dirty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when nothing but "." and ".." is left.
    pub fn has_only_dot_entries(&self) -> bool {
        self.entries.values().all(|named| named.entry.is_dot_entry())
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &NamedEntry)> {
        self.entries.iter().map(|(id, named)| (*id, named))
    }

    pub fn get(&self, id: EntryId) -> Result<&NamedEntry> {
        self.entries.get(&id).ok_or(FatError::StaleHandle)
    }

    /// Looks `name` up by long name first, then as an 8.3 name. Both are
    /// case-insensitive.
    pub fn lookup(&self, name: &str) -> Option<EntryId> {
        let name = name.trim_matches(' ');
        if let Some(id) = self.long_index.get(&index_key(name)) {
            return Some(*id);
        }
        ShortName::try_parse(name).and_then(|short| self.short_index.get(&short).copied())
    }

    fn name_taken(&self, name: &str, except: Option<EntryId>) -> bool {
        let other = |id: &EntryId| Some(*id) != except;
        if self.long_index.get(&index_key(name)).is_some_and(other) {
            return true;
        }
        ShortName::try_parse(name)
            .and_then(|short| self.short_index.get(&short))
            .is_some_and(other)
    }

    fn generate(&self, name: &str, except: Option<EntryId>) -> Result<GeneratedName> {
        generate_short_name(name, |candidate| {
            let other = |id: &EntryId| Some(*id) != except;
            self.short_index.get(candidate).is_some_and(other)
                || self
                    .long_index
                    .get(&index_key(&candidate.as_simple_string()))
                    .is_some_and(other)
        })
    }

    /// Serialises every entry in id order. `replacement` substitutes one
    /// entry and `skip` leaves one out.
    fn collect_slots(
        &self,
        skip: Option<EntryId>,
        replacement: Option<(EntryId, &NamedEntry)>,
    ) -> Result<Vec<Slot>> {
        let mut slots = Vec::new();
        for (id, named) in self.entries.iter() {
            if Some(*id) == skip {
                continue;
            }
            let named = match replacement {
                Some((replaced, with)) if replaced == *id => with,
                _ => named,
            };
            slots.extend(named.slots()?);
        }
        Ok(slots)
    }

    pub fn add_file(
        &mut self,
        fat: &mut AllocationTable,
        name: &str,
        now: NaiveDateTime,
    ) -> Result<EntryId> {
        let template = DirectoryEntry::new(ShortName::DOT, Attributes::ARCHIVE, now);
        self.insert_named(fat, name, template)
    }

    /// Adds an entry under `name` carrying `template`'s attributes,
    /// timestamps, start cluster and length. The short name is generated.
    pub fn insert_named(
        &mut self,
        fat: &mut AllocationTable,
        name: &str,
        template: DirectoryEntry,
    ) -> Result<EntryId> {
        let name = validate_name(name)?;
        if self.name_taken(name, None) {
            return Err(FatError::AlreadyExists);
        }
        let generated = self.generate(name, None)?;
        let mut entry = template;
        entry.short_name = generated.short_name;
        entry.lowercase_base = generated.lowercase_base;
        entry.lowercase_ext = generated.lowercase_ext;

        let named = NamedEntry {
            entry,
            long_name: Some(name.to_string()),
        };
        self.dir.add_entries(fat, named.slots()?)?;
        let id = self.insert_indexed(named);
        log::debug!("fat: add name={} short={}", name, generated.short_name);
        Ok(id)
    }

    /// Creates a subdirectory entry plus its first cluster holding "." and
    /// "..". Nothing stays allocated when any step fails.
    pub fn create_subdirectory<D: BlockDevice>(
        &mut self,
        fat: &mut AllocationTable,
        device: &mut D,
        geometry: &Geometry,
        name: &str,
        now: NaiveDateTime,
    ) -> Result<(EntryId, LfnDirectory)> {
        let checked = validate_name(name)?;
        if self.name_taken(checked, None) {
            return Err(FatError::AlreadyExists);
        }

        let mut chain = ClusterChain::new(geometry, 0);
        chain.set_chain_length(fat, 1)?;
        let mut template = DirectoryEntry::new(ShortName::DOT, Attributes::DIRECTORY, now);
        template.start_cluster = chain.start_cluster();

        let id = match self.insert_named(fat, checked, template) {
            Ok(id) => id,
            Err(err) => {
                chain.set_chain_length(fat, 0)?;
                return Err(err);
            }
        };

        match self.init_subdirectory(fat, device, geometry, chain, id) {
            Ok(child) => Ok((id, child)),
            Err(err) => {
                if let Err(rollback) = self.take(fat, id, false) {
                    log::warn!("fat: mkdir rollback failed err={}", rollback);
                }
                chain.set_chain_length(fat, 0)?;
                Err(err)
            }
        }
    }

    fn init_subdirectory<D: BlockDevice>(
        &self,
        fat: &mut AllocationTable,
        device: &mut D,
        geometry: &Geometry,
        chain: ClusterChain,
        id: EntryId,
    ) -> Result<LfnDirectory> {
        // Timestamps come from the parent's own "." entry; the root has none,
        // so its children take the new entry's.
        let parent_dot = self
            .short_index
            .get(&ShortName::DOT)
            .filter(|_| !self.is_root());
        let stamps = match parent_dot {
            Some(dot_id) => self.get(*dot_id)?.entry,
            None => self.get(id)?.entry,
        };
        let mut dot = stamps;
        dot.short_name = ShortName::DOT;
        dot.lowercase_base = false;
        dot.lowercase_ext = false;
        dot.attributes = Attributes::DIRECTORY;
        dot.start_cluster = chain.start_cluster();
        dot.length = 0;
        let mut dot_dot = dot;
        dot_dot.short_name = ShortName::DOT_DOT;
        dot_dot.start_cluster = self.parent_reference();

        let mut child = LfnDirectory::new(Directory::create(fat, geometry, chain)?);
        child.dir.add_entries(fat, vec![Slot::Entry(dot), Slot::Entry(dot_dot)])?;
        child.insert_indexed(NamedEntry {
            entry: dot,
            long_name: None,
        });
        child.insert_indexed(NamedEntry {
            entry: dot_dot,
            long_name: None,
        });
        child.flush(fat, device)?;
        Ok(child)
    }

    /// Removes an entry and releases its cluster chain.
    pub fn remove(&mut self, fat: &mut AllocationTable, id: EntryId) -> Result<NamedEntry> {
        self.take(fat, id, true)
    }

    /// Removes an entry but leaves its clusters allocated, for moving it to
    /// another directory.
    pub fn detach(&mut self, fat: &mut AllocationTable, id: EntryId) -> Result<NamedEntry> {
        self.take(fat, id, false)
    }

    fn take(&mut self, fat: &mut AllocationTable, id: EntryId, free_chain: bool) -> Result<NamedEntry> {
        let named = self.get(id)?.clone();
        if named.entry.is_dot_entry() {
            return Err(FatError::DotEntry);
        }
        let start = named.entry.start_cluster;
        if free_chain && start != 0 {
            // Walk first so a broken chain fails before anything changes.
            fat.enumerate_chain(start)?;
        }

        let slots = self.collect_slots(Some(id), None)?;
        self.dir.set_slots(fat, slots)?;
        if free_chain && start != 0 {
            fat.free_chain(start)?;
        }
        self.unindex(id, &named);
        self.entries.remove(&id);
        log::debug!("fat: remove name={} freed={}", named.name(), free_chain);
        Ok(named)
    }

    /// Renames in place; the entry keeps its id. Renaming to a different
    /// case of the same name is allowed.
    pub fn rename(&mut self, fat: &mut AllocationTable, id: EntryId, new_name: &str) -> Result<()> {
        let current = self.get(id)?.clone();
        if current.entry.is_dot_entry() {
            return Err(FatError::DotEntry);
        }
        let name = validate_name(new_name)?;
        if self.name_taken(name, Some(id)) {
            return Err(FatError::AlreadyExists);
        }
        let generated = self.generate(name, Some(id))?;

        let mut renamed = current.clone();
        renamed.entry.short_name = generated.short_name;
        renamed.entry.lowercase_base = generated.lowercase_base;
        renamed.entry.lowercase_ext = generated.lowercase_ext;
        renamed.long_name = Some(name.to_string());

        let slots = self.collect_slots(None, Some((id, &renamed)))?;
        self.dir.set_slots(fat, slots)?;
        self.unindex(id, &current);
        self.index(id, &renamed);
        self.entries.insert(id, renamed);
        log::debug!("fat: rename from={} to={}", current.name(), name);
        Ok(())
    }

    /// Applies `update` to an entry's metadata. The short name is kept.
    pub fn update_entry(
        &mut self,
        id: EntryId,
        update: impl FnOnce(&mut DirectoryEntry),
    ) -> Result<()> {
        let named = self.entries.get_mut(&id).ok_or(FatError::StaleHandle)?;
        let short_name = named.entry.short_name;
        update(&mut named.entry);
        named.entry.short_name = short_name;
        self.dir.mark_dirty();
        Ok(())
    }

    /// Points ".." at a new parent after the directory moved.
    pub fn set_parent_reference(&mut self, cluster: u32) -> Result<()> {
        let id = self
            .short_index
            .get(&ShortName::DOT_DOT)
            .copied()
            .ok_or(FatError::CorruptEntry("directory has no \"..\" entry"))?;
        self.update_entry(id, |entry| entry.start_cluster = cluster)
    }

    pub fn label(&self) -> Option<&DirectoryEntry> {
        self.dir.label()
    }

    pub fn set_label(
        &mut self,
        fat: &mut AllocationTable,
        label: Option<DirectoryEntry>,
    ) -> Result<()> {
        self.dir.set_label(fat, label)
    }

    /// Re-derives the slot list from the entries and writes it out when
    /// anything changed.
    pub fn flush<D: BlockDevice>(
        &mut self,
        fat: &mut AllocationTable,
        device: &mut D,
    ) -> Result<()> {
        if !self.dir.is_dirty() {
            return Ok(());
        }
        let slots = self.collect_slots(None, None)?;
        self.dir.set_slots(fat, slots)?;
        self.dir.flush(fat, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::MemoryDevice,
        fat::{entry::ParsedSlot, lfn::LongNameFragment, variant::FatVariant},
    };
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 11, 5)
            .unwrap()
            .and_hms_opt(10, 20, 30)
            .unwrap()
    }

    fn geometry() -> Geometry {
        Geometry {
            variant: FatVariant::Fat16,
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_count: 1,
            sectors_per_fat: 1,
            root_entry_count: 32,
            root_dir_first_cluster: 0,
            medium_descriptor: 0xF8,
            cluster_count: 200,
            fat_offset: 512,
            root_dir_offset: 1024,
            data_offset: 1024 + 32 * 32,
        }
    }

    struct Fixture {
        dev: MemoryDevice,
        fat: AllocationTable,
        geo: Geometry,
    }

    impl Fixture {
        fn new() -> Self {
            let geo = geometry();
            Self {
                dev: MemoryDevice::new(256 * 1024),
                fat: AllocationTable::new(&geo),
                geo,
            }
        }

        fn root(&mut self) -> LfnDirectory {
            LfnDirectory::new(Directory::open_root(&mut self.dev, &self.fat, &self.geo).unwrap())
        }
    }

    #[test]
    fn add_indexes_long_and_short_forms() {
        let mut fx = Fixture::new();
        let mut root = fx.root();
        let id = root
            .add_file(&mut fx.fat, "TextFile1.Mine.txt", now())
            .unwrap();
        assert_eq!(root.lookup("textfile1.mine.TXT"), Some(id));
        assert_eq!(root.lookup("TEXTFI~1.TXT"), Some(id));
        assert_eq!(root.lookup("  TextFile1.Mine.txt "), Some(id));
        assert_eq!(root.get(id).unwrap().entry.short_name.as_simple_string(), "TEXTFI~1.TXT");
        // two fragments + one short entry
        assert_eq!(root.directory().used_slots(), 3);
    }

    #[test]
    fn duplicates_are_rejected_case_insensitively() {
        let mut fx = Fixture::new();
        let mut root = fx.root();
        root.add_file(&mut fx.fat, "notes.txt", now()).unwrap();
        assert!(matches!(
            root.add_file(&mut fx.fat, "NOTES.TXT", now()),
            Err(FatError::AlreadyExists)
        ));

        root.add_file(&mut fx.fat, "A Long Report.doc", now()).unwrap();
        assert!(matches!(
            root.add_file(&mut fx.fat, "alongr~1.doc", now()),
            Err(FatError::AlreadyExists)
        ));
        assert!(matches!(
            root.add_file(&mut fx.fat, "bad:name", now()),
            Err(FatError::InvalidName)
        ));
        assert!(matches!(
            root.add_file(&mut fx.fat, "   ", now()),
            Err(FatError::InvalidName)
        ));
    }

    #[test]
    fn similar_long_names_get_distinct_short_names() {
        let mut fx = Fixture::new();
        let mut root = fx.root();
        let a = root.add_file(&mut fx.fat, "Holiday Photo 1.jpeg", now()).unwrap();
        let b = root.add_file(&mut fx.fat, "Holiday Photo 2.jpeg", now()).unwrap();
        let short_a = root.get(a).unwrap().entry.short_name;
        let short_b = root.get(b).unwrap().entry.short_name;
        assert_eq!(short_a.as_simple_string(), "HOLIDA~1.JPE");
        assert_eq!(short_b.as_simple_string(), "HOLIDA~2.JPE");
    }

    #[test]
    fn flush_and_reread_restore_names_in_order() {
        let mut fx = Fixture::new();
        let mut root = fx.root();
        for name in ["zeta.bin", "Alpha Document.txt", "mid"] {
            root.add_file(&mut fx.fat, name, now()).unwrap();
        }
        root.flush(&mut fx.fat, &mut fx.dev).unwrap();

        let again = fx.root();
        let names = again.iter().map(|(_, named)| named.name()).collect::<Vec<_>>();
        assert_eq!(names, ["zeta.bin", "Alpha Document.txt", "mid"]);
        let zeta = again.get(again.lookup("ZETA.BIN").unwrap()).unwrap();
        assert!(zeta.entry.lowercase_base && zeta.entry.lowercase_ext);
    }

    #[test]
    fn remove_releases_chain_and_slots() {
        let mut fx = Fixture::new();
        let mut root = fx.root();
        let baseline = fx.fat.free_cluster_count();
        let id = root.add_file(&mut fx.fat, "data.bin", now()).unwrap();
        let chain = fx.fat.allocate_chain(3).unwrap();
        root.update_entry(id, |entry| {
            entry.start_cluster = chain[0];
            entry.length = 1500;
        })
        .unwrap();

        let removed = root.remove(&mut fx.fat, id).unwrap();
        assert_eq!(removed.name(), "data.bin");
        assert_eq!(fx.fat.free_cluster_count(), baseline);
        assert_eq!(root.directory().used_slots(), 0);
        assert!(root.lookup("data.bin").is_none());
        assert!(matches!(root.get(id), Err(FatError::StaleHandle)));
    }

    #[test]
    fn rename_checks_collisions_before_touching_anything() {
        let mut fx = Fixture::new();
        let mut root = fx.root();
        let a = root.add_file(&mut fx.fat, "first.txt", now()).unwrap();
        root.add_file(&mut fx.fat, "second.txt", now()).unwrap();
        let before = root.directory().slots().to_vec();

        assert!(matches!(
            root.rename(&mut fx.fat, a, "Second.TXT"),
            Err(FatError::AlreadyExists)
        ));
        assert_eq!(root.directory().slots(), &before[..]);
        assert_eq!(root.lookup("first.txt"), Some(a));

        root.rename(&mut fx.fat, a, "FIRST.txt").unwrap();
        assert_eq!(root.get(a).unwrap().name(), "FIRST.txt");
        assert_eq!(root.get(a).unwrap().entry.short_name.as_simple_string(), "FIRST.TXT");

        root.rename(&mut fx.fat, a, "a much longer name.txt").unwrap();
        assert!(root.lookup("first.txt").is_none());
        assert_eq!(root.lookup("A MUCH LONGER NAME.TXT"), Some(a));
    }

    #[test]
    fn subdirectory_gets_dot_entries_without_long_names() {
        let mut fx = Fixture::new();
        let mut root = fx.root();
        let geo = fx.geo;
        let (id, child) = root
            .create_subdirectory(&mut fx.fat, &mut fx.dev, &geo, "Projects", now())
            .unwrap();
        let own = root.get(id).unwrap().entry;
        assert!(own.is_directory());
        assert_eq!(child.storage_cluster(), own.start_cluster);

        let dot = child.get(child.lookup(".").unwrap()).unwrap();
        let dot_dot = child.get(child.lookup("..").unwrap()).unwrap();
        assert_eq!(dot.entry.start_cluster, own.start_cluster);
        assert_eq!(dot_dot.entry.start_cluster, 0);
        assert_eq!(dot.entry.created, own.created);
        assert_eq!(dot_dot.entry.created, own.created);
        assert!(dot.long_name.is_none() && dot_dot.long_name.is_none());
        assert!(child.has_only_dot_entries());

        // The cluster on disk starts with the two dot entries and no fragments.
        let offset = geo.data_offset + (own.start_cluster as u64 - 2) * 512;
        let mut raw = [0u8; 32];
        fx.dev.read(offset, &mut raw).unwrap();
        assert!(matches!(
            crate::fat::entry::parse_slot(&raw, FatVariant::Fat16),
            ParsedSlot::Entry(e) if e.short_name == ShortName::DOT
        ));

        let mut child = child;
        let dot_id = child.lookup(".").unwrap();
        assert!(matches!(
            child.remove(&mut fx.fat, dot_id),
            Err(FatError::DotEntry)
        ));
        assert!(matches!(
            child.rename(&mut fx.fat, dot_id, "x"),
            Err(FatError::DotEntry)
        ));
    }

    #[test]
    fn nested_dot_entries_take_the_parent_timestamps() {
        let mut fx = Fixture::new();
        let mut root = fx.root();
        let geo = fx.geo;
        let (outer_id, mut outer) = root
            .create_subdirectory(&mut fx.fat, &mut fx.dev, &geo, "Outer", now())
            .unwrap();
        let later = NaiveDate::from_ymd_opt(2023, 1, 9)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap();
        let (inner_id, inner) = outer
            .create_subdirectory(&mut fx.fat, &mut fx.dev, &geo, "Inner", later)
            .unwrap();

        let outer_entry = root.get(outer_id).unwrap().entry;
        let inner_entry = outer.get(inner_id).unwrap().entry;
        assert_eq!(inner_entry.created_at(), Some(later));
        for name in [".", ".."] {
            let dot = inner.get(inner.lookup(name).unwrap()).unwrap().entry;
            assert_eq!(dot.created, outer_entry.created, "{name}");
            assert_eq!(dot.modified, outer_entry.modified, "{name}");
            assert_ne!(dot.created, inner_entry.created, "{name}");
        }
        let dot = inner.get(inner.lookup(".").unwrap()).unwrap().entry;
        assert_eq!(dot.start_cluster, inner_entry.start_cluster);
    }

    #[test]
    fn unattached_fragments_free_their_slots() {
        let mut fx = Fixture::new();
        let keep = DirectoryEntry::new(
            ShortName::from_raw(*b"KEEP    TXT"),
            Attributes::ARCHIVE,
            now(),
        );
        // Three 40-character names whose checksum matches nothing.
        let mut image = Vec::new();
        for _ in 0..3 {
            let group = fragments_for(&"n".repeat(40), 0x5A).unwrap();
            for fragment in group.iter() {
                image.extend_from_slice(&fragment.encode());
            }
        }
        image.extend_from_slice(&keep.encode(FatVariant::Fat16));
        assert_eq!(image.len(), 13 * 32);
        fx.dev.write(fx.geo.root_dir_offset, &image).unwrap();

        let mut root = fx.root();
        assert_eq!(root.directory().used_slots(), 1);
        let mut added = 0;
        while root
            .add_file(&mut fx.fat, &format!("f{added:02}.txt"), now())
            .is_ok()
        {
            added += 1;
        }
        assert_eq!(added, 15);
        root.flush(&mut fx.fat, &mut fx.dev).unwrap();
        assert_eq!(fx.root().len(), 16);
    }

    #[test]
    fn bad_fragments_fall_back_to_the_short_name() {
        let mut fx = Fixture::new();
        let entry = DirectoryEntry::new(
            ShortName::from_raw(*b"REPORT  TXT"),
            Attributes::ARCHIVE,
            now(),
        );
        let fragment = LongNameFragment {
            ordinal: 1,
            is_last: true,
            checksum: entry.short_name.checksum().wrapping_add(1),
            units: [b'x' as u16, 0, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF],
        };
        let mut image = vec![0u8; 64];
        image[..32].copy_from_slice(&fragment.encode());
        image[32..].copy_from_slice(&entry.encode(FatVariant::Fat16));
        fx.dev.write(fx.geo.root_dir_offset, &image).unwrap();

        let root = fx.root();
        let names = root.iter().map(|(_, named)| named.name()).collect::<Vec<_>>();
        assert_eq!(names, ["REPORT.TXT"]);
    }

    #[test]
    fn fixed_root_fills_up_with_directory_full() {
        let mut fx = Fixture::new();
        let mut root = fx.root();
        // 32 slots, two per name
        for n in 0..16 {
            root.add_file(&mut fx.fat, &format!("f{n:02}.txt"), now()).unwrap();
        }
        let err = root.add_file(&mut fx.fat, "one-too-many.txt", now()).unwrap_err();
        assert!(matches!(err, FatError::DirectoryFull));
        assert_eq!(root.len(), 16);
    }
}
