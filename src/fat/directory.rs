//! Raw directory storage: an ordered list of 32-byte slots backed either by the
//! fixed FAT12/16 root region or by a cluster chain.
//!
//! The whole slot list is decoded on open and re-serialised wholesale on
//! flush; deleted slots are dropped in the process.

use crate::{
    device::BlockDevice,
    error::{FatError, Result},
};

use super::{
    boot_sector::Geometry,
    chain::ClusterChain,
    entry::{parse_slot, DirectoryEntry, ParsedSlot, DIR_ENTRY_SIZE},
    lfn::LongNameFragment,
    short_name::is_valid_short_char,
    table::AllocationTable,
    variant::FatVariant,
};

/// Largest size a cluster-backed directory may grow to.
pub const MAX_DIRECTORY_BYTES: u64 = 65536 * DIR_ENTRY_SIZE as u64;
const LABEL_LEN: usize = 11;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Entry(DirectoryEntry),
    Fragment(LongNameFragment),
}

impl Slot {
    fn encode(&self, variant: FatVariant) -> [u8; DIR_ENTRY_SIZE] {
        match self {
            Self::Entry(entry) => entry.encode(variant),
            Self::Fragment(fragment) => fragment.encode(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Backing {
    Fixed { offset: u64, capacity: u32 },
    Chain(ClusterChain),
}

#[derive(Debug)]
pub struct Directory {
    backing: Backing,
    variant: FatVariant,
    is_root: bool,
    slots: Vec<Slot>,
    label: Option<DirectoryEntry>,
    /// Slots the backing storage currently holds.
    capacity: u32,
    dirty: bool,
}

/// Validates and pads a volume label to its 11-byte on-disk form.
pub fn encode_label(label: &str) -> Result<[u8; LABEL_LEN]> {
    let label = label.trim_end();
    if label.is_empty() {
        return Err(FatError::InvalidName);
    }
    if label.len() > LABEL_LEN {
        return Err(FatError::NameTooLong);
    }
    let mut raw = [b' '; LABEL_LEN];
    for (dst, src) in raw.iter_mut().zip(label.bytes()) {
        let upper = src.to_ascii_uppercase();
        if upper != b' ' && !is_valid_short_char(upper) {
            return Err(FatError::InvalidName);
        }
        *dst = upper;
    }
    if raw[0] == b' ' {
        return Err(FatError::InvalidName);
    }
    Ok(raw)
}

impl Directory {
    /// Opens the root directory: the fixed region on FAT12/16, the root chain
    /// on FAT32.
    pub fn open_root<D: BlockDevice>(
        device: &mut D,
        fat: &AllocationTable,
        geometry: &Geometry,
    ) -> Result<Self> {
        if geometry.variant == FatVariant::Fat32 {
            return Self::open_chain(device, fat, geometry, geometry.root_dir_first_cluster, true);
        }

        let mut raw = vec![0u8; geometry.root_dir_bytes() as usize];
        device.read(geometry.root_dir_offset, &mut raw)?;
        let (slots, label) = decode_slots(&raw, geometry.variant, true);
        log::debug!(
            "fat: root dir fixed slots={} capacity={}",
            slots.len(),
            geometry.root_entry_count
        );
        Ok(Self {
            backing: Backing::Fixed {
                offset: geometry.root_dir_offset,
                capacity: geometry.root_entry_count,
            },
            variant: geometry.variant,
            is_root: true,
            slots,
            label,
            capacity: geometry.root_entry_count,
            dirty: false,
        })
    }

    pub fn open_chain<D: BlockDevice>(
        device: &mut D,
        fat: &AllocationTable,
        geometry: &Geometry,
        start_cluster: u32,
        is_root: bool,
    ) -> Result<Self> {
        let chain = ClusterChain::new(geometry, start_cluster);
        let bytes = chain.length_on_disk(fat)?;
        let mut raw = vec![0u8; bytes as usize];
        chain.read_data(fat, device, 0, &mut raw)?;
        let (slots, label) = decode_slots(&raw, geometry.variant, is_root);
        log::trace!(
            "fat: dir open start={} slots={} bytes={}",
            start_cluster,
            slots.len(),
            bytes
        );
        Ok(Self {
            backing: Backing::Chain(chain),
            variant: geometry.variant,
            is_root,
            slots,
            label,
            capacity: (bytes / DIR_ENTRY_SIZE as u64) as u32,
            dirty: false,
        })
    }

    /// Wraps a freshly allocated chain as an empty directory.
    pub fn create(fat: &AllocationTable, geometry: &Geometry, chain: ClusterChain) -> Result<Self> {
        let bytes = chain.length_on_disk(fat)?;
        Ok(Self {
            backing: Backing::Chain(chain),
            variant: geometry.variant,
            is_root: false,
            slots: Vec::new(),
            label: None,
            capacity: (bytes / DIR_ENTRY_SIZE as u64) as u32,
            dirty: true,
        })
    }

    pub fn variant(&self) -> FatVariant {
        self.variant
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn label(&self) -> Option<&DirectoryEntry> {
        self.label.as_ref()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots in use, the label included.
    pub fn used_slots(&self) -> u32 {
        self.slots.len() as u32 + u32::from(self.label.is_some())
    }

    /// First cluster of the backing chain; 0 for the fixed root region.
    pub fn storage_cluster(&self) -> u32 {
        match self.backing {
            Backing::Fixed { .. } => 0,
            Backing::Chain(chain) => chain.start_cluster(),
        }
    }

    pub fn chain(&self) -> Option<ClusterChain> {
        match self.backing {
            Backing::Fixed { .. } => None,
            Backing::Chain(chain) => Some(chain),
        }
    }

    /// Makes room for exactly `count` slots. Fixed directories can only
    /// refuse; chain-backed ones resize in whole clusters and never drop below
    /// one cluster.
    fn change_size(&mut self, fat: &mut AllocationTable, count: u32) -> Result<()> {
        match &mut self.backing {
            Backing::Fixed { capacity, .. } => {
                if count > *capacity {
                    return Err(FatError::DirectoryFull);
                }
                Ok(())
            }
            Backing::Chain(chain) => {
                let bytes = count as u64 * DIR_ENTRY_SIZE as u64;
                if bytes > MAX_DIRECTORY_BYTES {
                    return Err(FatError::DirectoryFull);
                }
                let before = self.capacity;
                let target = bytes.max(chain.cluster_size() as u64);
                let actual = chain.set_size(fat, target)?;
                self.capacity = (actual / DIR_ENTRY_SIZE as u64) as u32;
                if self.capacity != before {
                    log::debug!(
                        "fat: dir resize start={} slots {}->{}",
                        chain.start_cluster(),
                        before,
                        self.capacity
                    );
                }
                Ok(())
            }
        }
    }

    /// Appends slots as one unit: either all of them fit (growing the chain
    /// if needed) or nothing changes.
    pub fn add_entries(&mut self, fat: &mut AllocationTable, slots: Vec<Slot>) -> Result<()> {
        let needed = self.used_slots() + slots.len() as u32;
        if needed > self.capacity {
            self.change_size(fat, needed)?;
        }
        self.slots.extend(slots);
        self.dirty = true;
        Ok(())
    }

    pub fn add_entry(&mut self, fat: &mut AllocationTable, entry: DirectoryEntry) -> Result<()> {
        self.add_entries(fat, vec![Slot::Entry(entry)])
    }

    pub fn remove_entry(&mut self, fat: &mut AllocationTable, index: usize) -> Result<Slot> {
        if index >= self.slots.len() {
            return Err(FatError::NotFound);
        }
        self.change_size(fat, self.used_slots() - 1)?;
        let slot = self.slots.remove(index);
        self.dirty = true;
        Ok(slot)
    }

    /// Replaces the whole slot list, resizing the backing store first.
    pub fn set_slots(&mut self, fat: &mut AllocationTable, slots: Vec<Slot>) -> Result<()> {
        let needed = slots.len() as u32 + u32::from(self.label.is_some());
        self.change_size(fat, needed)?;
        self.slots = slots;
        self.dirty = true;
        Ok(())
    }

    /// Swaps in a slot list no longer than the current one. The backing store
    /// keeps its size until the next resize.
    pub fn replace_with_fewer(&mut self, slots: Vec<Slot>) {
        if slots.len() <= self.slots.len() {
            self.slots = slots;
            self.dirty = true;
        }
    }

    /// Adds, replaces or removes the volume-label entry. Root only.
    pub fn set_label(
        &mut self,
        fat: &mut AllocationTable,
        label: Option<DirectoryEntry>,
    ) -> Result<()> {
        if !self.is_root {
            return Err(FatError::NotRootDirectory);
        }
        let needed = self.slots.len() as u32 + u32::from(label.is_some());
        if needed > self.capacity || label.is_none() {
            self.change_size(fat, needed)?;
        }
        self.label = label;
        self.dirty = true;
        Ok(())
    }

    pub fn flush<D: BlockDevice>(
        &mut self,
        fat: &mut AllocationTable,
        device: &mut D,
    ) -> Result<()> {
        let mut raw = vec![0u8; self.capacity as usize * DIR_ENTRY_SIZE];
        let slots = self.label.iter().map(|label| Slot::Entry(*label)).chain(self.slots.iter().copied());
        for (chunk, slot) in raw.chunks_exact_mut(DIR_ENTRY_SIZE).zip(slots) {
            chunk.copy_from_slice(&slot.encode(self.variant));
        }

        match &mut self.backing {
            Backing::Fixed { offset, .. } => device.write(*offset, &raw)?,
            Backing::Chain(chain) => chain.write_data(fat, device, 0, &raw)?,
        }
        self.dirty = false;
        log::debug!(
            "fat: dir flush start={} slots={} capacity={}",
            self.storage_cluster(),
            self.used_slots(),
            self.capacity
        );
        Ok(())
    }
}

fn decode_slots(
    raw: &[u8],
    variant: FatVariant,
    is_root: bool,
) -> (Vec<Slot>, Option<DirectoryEntry>) {
    let mut slots = Vec::new();
    let mut label = None;
    for chunk in raw.chunks_exact(DIR_ENTRY_SIZE) {
        let mut bytes = [0u8; DIR_ENTRY_SIZE];
        bytes.copy_from_slice(chunk);
        match parse_slot(&bytes, variant) {
            ParsedSlot::End => break,
            ParsedSlot::Deleted => continue,
            ParsedSlot::LongName(fragment) => slots.push(Slot::Fragment(fragment)),
            ParsedSlot::Entry(entry) => {
                if is_root && label.is_none() && entry.is_volume_label() {
                    label = Some(entry);
                } else {
                    slots.push(Slot::Entry(entry));
                }
            }
        }
    }
    (slots, label)
}
