use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use ordered_index::{NodeId, OrderedIndex};
use spin::RwLock;

use crate::dirent::{Attributes, NtRes, ShortEntry};
use crate::name::ShortName;
use crate::xde::XdeInfo;
use crate::{FatType, FsError, FsResult};

/// Identifies an open node across calls. Carries the mount epoch it was
/// issued under so handles from before a remount are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
    pub(crate) epoch: u16,
}

impl NodeHandle {
    pub fn epoch(&self) -> u16 {
        self.epoch
    }
}

/// One 32-byte record slot of a directory. Cluster 0 is the FAT16 fixed
/// root region; `offset` is the byte offset inside the cluster (or region).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DePos {
    pub cluster: u32,
    pub offset: u32,
}

/// Where a DE lives in its parent directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeLocation {
    /// First cluster of the parent directory (0 for a FAT16 root).
    pub dir_cluster: u32,
    /// Byte offset of the first record in the parent's record stream.
    pub stream_offset: u32,
    pub start: DePos,
    pub sfne: DePos,
    pub end: DePos,
    /// Records in the DE, long-name, short-name and XDE together.
    pub records: u8,
    /// Long-name records before the SFNE.
    pub long_records: u8,
}

impl DeLocation {
    pub fn sfne_stream_offset(&self) -> u32 {
        self.stream_offset + u32::from(self.long_records) * 32
    }

    pub fn has_xde_slot(&self) -> bool {
        self.records > self.long_records + 1
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct NodeFlags: u8 {
        /// Backed by a live DE (or the root).
        const VALID = 1 << 0;

        /// Removed from its directory while still open; its clusters are
        /// released at last close.
        const OPEN_UNLINKED = 1 << 1;

        /// XDE metadata is cached on the node but not on disk, because the
        /// volume is mounted without XDE.
        const XDE_PENDING = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Position-to-cluster cache: the last `(cluster index, cluster)` pair a
/// chain walk resolved. Packed into one atomic so readers holding only a
/// shared node lock can refresh it.
#[derive(Debug)]
pub(crate) struct PalCache(AtomicU64);

impl PalCache {
    const EMPTY: u64 = u64::MAX;

    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(Self::EMPTY))
    }

    pub(crate) fn get(&self) -> Option<(u32, u32)> {
        match self.0.load(Ordering::Relaxed) {
            Self::EMPTY => None,
            packed => Some(((packed >> 32) as u32, packed as u32)),
        }
    }

    pub(crate) fn set(&self, index: u32, cluster: u32) {
        let packed = (u64::from(index) << 32) | u64::from(cluster);
        self.0.store(packed, Ordering::Relaxed);
    }

    pub(crate) fn clear(&self) {
        self.0.store(Self::EMPTY, Ordering::Relaxed);
    }
}

/// Just enough of a directory node to walk its record stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DirRef<'n> {
    pub(crate) first_cluster: u32,
    pub(crate) pal: &'n PalCache,
}

/// In-memory state of an open file or directory.
#[derive(Debug)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) name: String,
    pub(crate) short_name: ShortName,
    pub(crate) first_cluster: u32,
    pub(crate) size: u32,
    pub(crate) attr: Attributes,
    pub(crate) nt_res: NtRes,
    pub(crate) location: Option<DeLocation>,
    pub(crate) pal: PalCache,
    pub(crate) flags: NodeFlags,
    pub(crate) xde: XdeInfo,
    pub(crate) is_root: bool,
}

impl Node {
    pub(crate) fn root(first_cluster: u32, xde: XdeInfo) -> Self {
        Self {
            kind: NodeKind::Directory,
            name: String::new(),
            short_name: ShortName::DOT,
            first_cluster,
            size: 0,
            attr: Attributes::DIRECTORY,
            nt_res: NtRes::empty(),
            location: None,
            pal: PalCache::new(),
            flags: NodeFlags::VALID,
            xde,
            is_root: true,
        }
    }

    pub(crate) fn from_entry(
        name: String,
        entry: &ShortEntry,
        location: DeLocation,
        xde: XdeInfo,
        fat_type: FatType,
    ) -> Self {
        let attr = entry.attributes();
        Self {
            kind: if attr.contains(Attributes::DIRECTORY) {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            name,
            short_name: ShortName(entry.name),
            first_cluster: entry.first_cluster(fat_type),
            size: entry.size,
            attr,
            nt_res: entry.nt_res(),
            location: Some(location),
            pal: PalCache::new(),
            flags: NodeFlags::VALID,
            xde,
            is_root: false,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    pub fn location(&self) -> Option<&DeLocation> {
        self.location.as_ref()
    }

    pub(crate) fn as_dir(&self) -> DirRef<'_> {
        DirRef {
            first_cluster: self.first_cluster,
            pal: &self.pal,
        }
    }

    /// The SFNE as it should be on disk, built over the current one.
    pub(crate) fn apply_to(&self, entry: &mut ShortEntry, fat_type: FatType) {
        entry.set_first_cluster(self.first_cluster, fat_type);
        entry.size = if self.is_dir() { 0 } else { self.size };
        entry.set_attributes(self.attr);
        entry.set_nt_res(self.nt_res);
    }
}

pub(crate) type NodeRef = Arc<RwLock<Node>>;

#[derive(Debug)]
struct Slot {
    generation: u32,
    refs: u32,
    key: Option<NodeId>,
    node: Option<NodeRef>,
}

/// Open nodes, addressed by slot index and generation, and indexed by the
/// device offset of their SFNE so a second lookup of the same file finds
/// the same node.
#[derive(Debug)]
pub(crate) struct NodeTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Keyed by SFNE device offset / 32; the value holds the full offset
    /// (to disambiguate huge volumes) and the slot index.
    by_location: OrderedIndex<(u64, u32)>,
}

impl NodeTable {
    pub(crate) const ROOT_INDEX: u32 = 0;

    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_location: OrderedIndex::new(),
        }
    }

    fn index_key(offset: u64) -> u32 {
        (offset >> 5) as u32
    }

    /// Adds a node with one reference and returns `(index, generation)`.
    pub(crate) fn insert(&mut self, node: Node, sfne_offset: Option<u64>) -> (u32, u32) {
        let node = Arc::new(RwLock::new(node));
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    refs: 0,
                    key: None,
                    node: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let key = sfne_offset.map(|offset| {
            self.by_location
                .insert(Self::index_key(offset), (offset, index))
        });

        let slot = &mut self.slots[index as usize];
        slot.refs = 1;
        slot.key = key;
        slot.node = Some(node);
        (index, slot.generation)
    }

    pub(crate) fn get(&self, index: u32, generation: u32) -> FsResult<NodeRef> {
        match self.slots.get(index as usize) {
            Some(Slot {
                generation: g,
                node: Some(node),
                ..
            }) if *g == generation => Ok(node.clone()),
            _ => Err(FsError::Invalid),
        }
    }

    /// Finds the open node whose SFNE is at `sfne_offset`.
    pub(crate) fn find(&self, sfne_offset: u64) -> Option<(u32, u32)> {
        let key = Self::index_key(sfne_offset);
        let mut id = self.by_location.get(key);
        while let Some(found) = id {
            if self.by_location.key(found) != key {
                break;
            }
            let (offset, index) = *self.by_location.value(found);
            if offset == sfne_offset {
                return Some((index, self.slots[index as usize].generation));
            }
            id = self.by_location.next(found);
        }
        None
    }

    /// Generation of an occupied slot.
    pub(crate) fn generation(&self, index: u32) -> Option<u32> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.node.is_some())
            .map(|slot| slot.generation)
    }

    pub(crate) fn retain(&mut self, index: u32) {
        self.slots[index as usize].refs += 1;
    }

    pub(crate) fn refs(&self, index: u32) -> u32 {
        self.slots.get(index as usize).map_or(0, |slot| slot.refs)
    }

    /// Drops one reference. When it was the last, the slot is recycled and
    /// the node returned so the caller can finish any deferred work.
    pub(crate) fn release(&mut self, index: u32, generation: u32) -> FsResult<Option<NodeRef>> {
        let slot = match self.slots.get_mut(index as usize) {
            Some(slot) if slot.generation == generation && slot.node.is_some() => slot,
            _ => return Err(FsError::Invalid),
        };
        if index == Self::ROOT_INDEX {
            return Ok(None);
        }

        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(None);
        }

        let node = slot.node.take();
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(key) = slot.key.take() {
            self.by_location.remove(key);
        }
        self.free.push(index);
        Ok(node)
    }

    /// Re-indexes a node after its DE moved (or drops it from the index
    /// when `sfne_offset` is `None`).
    pub(crate) fn rekey(&mut self, index: u32, sfne_offset: Option<u64>) {
        if let Some(key) = self.slots[index as usize].key.take() {
            self.by_location.remove(key);
        }
        let key = sfne_offset.map(|offset| {
            self.by_location
                .insert(Self::index_key(offset), (offset, index))
        });
        self.slots[index as usize].key = key;
    }

    /// Open nodes other than the root.
    pub(crate) fn open_count(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, slot)| *i as u32 != Self::ROOT_INDEX && slot.node.is_some())
            .count()
    }

    /// Every open node other than the root.
    /// Every open node but the root, with its slot index.
    pub(crate) fn open_nodes(&self) -> impl Iterator<Item = (u32, &NodeRef)> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(index, slot)| slot.node.as_ref().map(|node| (index as u32, node)))
    }

    /// Forgets every node. Slot generations are bumped so no handle issued
    /// before survives.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.node = None;
            slot.refs = 0;
            slot.key = None;
            slot.generation = slot.generation.wrapping_add(1);
        }
        self.free.clear();
        self.by_location.clear();
        self.free.extend((0..self.slots.len() as u32).rev());
    }
}
