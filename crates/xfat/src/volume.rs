//! Volume lifecycle and the per-node operations a host calls.
//!
//! A `Volume` owns its block device and every piece of mutable state: the
//! control block behind the per-volume lock, the allocator state, the open
//! node table and the scratch arenas. Each public operation takes the
//! volume lock first, then builds a `VolumeCtx` and hands off to the
//! directory engine, the allocator, the XDE layer or file I/O.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use spin::{Mutex, RwLock, RwLockWriteGuard};
use stack_arena::{ArenaSet, StackArena};

use crate::allocator::{AllocFlags, FatState};
use crate::ctx::{Counters, VolumeCtx, SCRATCH_ARENA};
use crate::dir::{pos_offset, RawDirEntry, ReadDirFlags};
use crate::dirent::{Attributes, ShortEntry};
use crate::fat::FatTable;
use crate::io::write_struct;
use crate::name::{
    label_bytes, label_string, long_records, validate_long_name, AsciiFold, Exact, NameCompare,
};
use crate::node::{
    DeLocation, DirRef, Node, NodeFlags, NodeHandle, NodeKind, NodeRef, NodeTable, PalCache,
};
use crate::txlog::{NoLog, TransactionLog};
use crate::vc::VectoredCluster;
use crate::xde::{xde_carry_over, xde_create, VolumeXde, XdeInfo};
use crate::{BlockDevice, FatType, FsError, FsInfo, FsResult, Geometry};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct MountFlags: u32 {
        const READ_ONLY = 1 << 0;

        /// No transaction log hook runs.
        const LOG_OFF = 1 << 1;
        /// Metadata hooks run.
        const LOG_PARTIAL = 1 << 2;
        /// Metadata and file data hooks run.
        const LOG_FULL = 1 << 3;

        const CASE_SENSITIVE = 1 << 4;
        /// Names are compared by the host-supplied `NameCompare`.
        const OS_CHARSET = 1 << 5;

        /// Flush the device after every metadata change.
        const SYNC_META = 1 << 6;
        /// Flush the device after every file write.
        const SYNC_DATA = 1 << 7;

        /// FAT writes go to every FAT copy.
        const FAT_MIRROR = 1 << 8;
        const XDE = 1 << 9;

        /// New files get no cluster until their first write.
        const LAZY_CREATE = 1 << 10;
    }
}

impl MountFlags {
    pub const LOG_MODES: Self = Self::LOG_OFF.union(Self::LOG_PARTIAL).union(Self::LOG_FULL);

    /// The flag set a mount actually runs with.
    pub fn resolve(self) -> Self {
        let mut flags = self;
        let log_mode = [Self::LOG_FULL, Self::LOG_PARTIAL, Self::LOG_OFF]
            .into_iter()
            .find(|mode| self.contains(*mode))
            .unwrap_or(Self::LOG_PARTIAL);
        flags.remove(Self::LOG_MODES);
        flags.insert(log_mode);

        if flags.contains(Self::READ_ONLY) {
            flags.remove(Self::LOG_MODES | Self::LAZY_CREATE | Self::SYNC_META | Self::SYNC_DATA);
            flags.insert(Self::LOG_OFF);
        }
        flags
    }
}

impl Default for MountFlags {
    fn default() -> Self {
        Self::LOG_PARTIAL | Self::FAT_MIRROR | Self::LAZY_CREATE
    }
}

/// Everything `Volume::mount` takes besides the device.
pub struct MountOptions {
    pub flags: MountFlags,
    pub log: Box<dyn TransactionLog>,
    pub names: Box<dyn NameCompare>,
    /// Size of the scratch arena used for zero-filling clusters.
    pub scratch_bytes: usize,
}

impl MountOptions {
    /// Options with no transaction log and the built-in name comparison
    /// matching `flags`.
    pub fn new(flags: MountFlags) -> Self {
        let names: Box<dyn NameCompare> = if flags.contains(MountFlags::CASE_SENSITIVE) {
            Box::new(Exact)
        } else {
            Box::new(AsciiFold)
        };
        Self {
            flags,
            log: Box::new(NoLog),
            names,
            scratch_bytes: 64 * 1024,
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: Box<dyn TransactionLog>) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub fn with_names(mut self, names: Box<dyn NameCompare>) -> Self {
        self.names = names;
        self.flags |= MountFlags::OS_CHARSET;
        self
    }
}

impl Default for MountOptions {
    fn default() -> Self {
        Self::new(MountFlags::default())
    }
}

impl fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOptions")
            .field("flags", &self.flags)
            .field("scratch_bytes", &self.scratch_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Mounting,
    Mounted,
    Unmounted,
}

/// Volume control block.
#[derive(Debug)]
pub struct Vcb {
    pub(crate) geo: Geometry,
    pub(crate) flags: MountFlags,
    pub(crate) epoch: u16,
    pub(crate) state: VolumeState,
    pub(crate) volume_xde: VolumeXde,
    pub(crate) label: [u8; 11],
}

impl Vcb {
    fn check_mounted(&self) -> FsResult<()> {
        if self.state == VolumeState::Mounted {
            Ok(())
        } else {
            Err(FsError::CrossDevice)
        }
    }

    fn check_handle(&self, handle: NodeHandle) -> FsResult<()> {
        self.check_mounted()?;
        if handle.epoch == self.epoch {
            Ok(())
        } else {
            Err(FsError::CrossDevice)
        }
    }

    /// Cluster the root directory is addressed by: 0 for the FAT16 fixed
    /// region.
    fn root_cluster(&self) -> u32 {
        if self.geo.has_fixed_root() {
            0
        } else {
            self.geo.root_cluster
        }
    }
}

/// Epochs skip 0 so a zeroed handle never matches.
fn next_epoch(epoch: u16) -> u16 {
    match epoch.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// One directory entry as `read_dir` reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub short_name: String,
    pub kind: NodeKind,
    pub size: u32,
    pub first_cluster: u32,
    pub attributes: Attributes,
    pub xde: XdeInfo,
    /// The entry carries an XDE record on disk.
    pub has_xde: bool,
}

impl DirEntry {
    fn from_raw(raw: RawDirEntry, fat_type: FatType) -> Self {
        Self {
            kind: if raw.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            short_name: raw.short_name.display_name(),
            size: raw.entry.size,
            first_cluster: raw.entry.first_cluster(fat_type),
            attributes: raw.entry.attributes(),
            xde: raw.xde,
            has_xde: raw.has_xde,
            name: raw.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub kind: NodeKind,
    pub size: u32,
    pub first_cluster: u32,
    pub attributes: Attributes,
    pub xde: XdeInfo,
    /// Still reachable from its directory.
    pub linked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStatus {
    pub fat_type: FatType,
    pub bytes_per_sector: u32,
    pub cluster_size: u32,
    pub total_clusters: u32,
    pub free_clusters: u32,
    pub flags: MountFlags,
    pub epoch: u16,
    pub label: String,
    pub volume_xde: VolumeXde,
    pub open_nodes: usize,
    pub orphan_xde_skips: u32,
    pub lfn_discards: u32,
    pub xde_checksum_mismatches: u32,
    pub xde_marked_entries: u32,
}

/// A mounted FAT volume.
pub struct Volume<D> {
    device: D,
    vcb: RwLock<Vcb>,
    fat: Mutex<FatState>,
    namespace: Mutex<()>,
    nodes: Mutex<NodeTable>,
    scratch: Mutex<ArenaSet<Box<[u8]>>>,
    log: Box<dyn TransactionLog>,
    names: Box<dyn NameCompare>,
    counters: Counters,
}

impl<D: BlockDevice> fmt::Debug for Volume<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("device", &self.device)
            .field("vcb", &*self.vcb.read())
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Mounts the volume on `device`. Nothing of a failed mount survives:
    /// the device is dropped along with the partial state.
    pub fn mount(device: D, options: MountOptions) -> FsResult<Self> {
        let geo = Geometry::read(&device)?;
        let flags = options.flags.resolve();
        let fat = load_fat_state(&device, &geo, flags)?;

        let mut scratch = ArenaSet::new();
        if options.scratch_bytes > 0 {
            scratch.add(
                SCRATCH_ARENA,
                StackArena::new(vec![0_u8; options.scratch_bytes].into_boxed_slice()),
            );
        }

        let label = geo.label;
        let volume = Self {
            device,
            vcb: RwLock::new(Vcb {
                geo,
                flags,
                epoch: 1,
                state: VolumeState::Mounting,
                volume_xde: VolumeXde::default(),
                label,
            }),
            fat: Mutex::new(fat),
            namespace: Mutex::new(()),
            nodes: Mutex::new(NodeTable::new()),
            scratch: Mutex::new(scratch),
            log: options.log,
            names: options.names,
            counters: Counters::default(),
        };
        volume.finish_mount()?;
        Ok(volume)
    }

    fn finish_mount(&self) -> FsResult<()> {
        let mut vcb = self.vcb.write();
        let root_cluster = vcb.root_cluster();
        let pal = PalCache::new();
        let root = DirRef {
            first_cluster: root_cluster,
            pal: &pal,
        };

        let (volume_xde, label) = {
            let ctx = self.ctx(&vcb);
            let volume_xde = if ctx.xde_active() {
                ctx.mount_xde(&root)?
            } else {
                let marked = ctx.count_marked_entries(&root);
                if marked > 0 {
                    log::warn!(
                        "{marked} root entries carry XDE records but the volume is mounted without XDE"
                    );
                }
                self.counters
                    .xde_marked_entries
                    .store(marked, core::sync::atomic::Ordering::Relaxed);
                VolumeXde::default()
            };
            let label = find_label(&ctx, &root)?.map_or(vcb.label, |entry| entry.entry.name);
            (volume_xde, label)
        };

        vcb.volume_xde = volume_xde;
        vcb.label = label;
        self.nodes
            .lock()
            .insert(Node::root(root_cluster, volume_xde.dir_default()), None);
        vcb.state = VolumeState::Mounted;
        log::debug!(
            "mounted {:?} volume: {} clusters of {} bytes, flags {:?}",
            vcb.geo.fat_type,
            vcb.geo.total_clusters,
            vcb.geo.cluster_size,
            vcb.flags
        );
        Ok(())
    }

    fn ctx<'a>(&'a self, vcb: &'a Vcb) -> VolumeCtx<'a, D> {
        self.ctx_with(vcb, vcb.flags)
    }

    fn ctx_with<'a>(&'a self, vcb: &'a Vcb, flags: MountFlags) -> VolumeCtx<'a, D> {
        VolumeCtx {
            device: &self.device,
            geo: &vcb.geo,
            flags,
            log: &*self.log,
            names: &*self.names,
            fat_state: &self.fat,
            namespace: &self.namespace,
            scratch: &self.scratch,
            counters: &self.counters,
            volume_xde: &vcb.volume_xde,
        }
    }

    fn node(&self, vcb: &Vcb, handle: NodeHandle) -> FsResult<NodeRef> {
        vcb.check_handle(handle)?;
        self.nodes.lock().get(handle.index, handle.generation)
    }

    fn handle(vcb: &Vcb, (index, generation): (u32, u32)) -> NodeHandle {
        NodeHandle {
            index,
            generation,
            epoch: vcb.epoch,
        }
    }

    /// Writes the free-cluster hint back to FSInfo if it changed.
    fn write_fs_info(&self, geo: &Geometry) -> FsResult<()> {
        let Some(offset) = geo.fs_info_offset else {
            return Ok(());
        };
        let mut state = self.fat.lock();
        if !state.dirty {
            return Ok(());
        }
        let mut info = geo
            .read_fs_info(&self.device)?
            .unwrap_or_else(|| FsInfo::new(FsInfo::UNKNOWN, FsInfo::UNKNOWN));
        info.free_count = state.free_clusters;
        info.next_free = state.next_free;
        write_struct(&self.device, offset, &info)?;
        state.dirty = false;
        Ok(())
    }

    /// Frees the chains of nodes that were unlinked while open. Used when
    /// every handle is about to go stale. Errors are logged: the clusters
    /// are only leaked.
    fn release_unlinked(&self, ctx: &VolumeCtx<'_, D>) {
        let nodes: Vec<NodeRef> = self
            .nodes
            .lock()
            .open_nodes()
            .map(|(_, node)| node.clone())
            .collect();
        for node in nodes {
            let mut node = node.write();
            if !node.flags.contains(NodeFlags::OPEN_UNLINKED) || node.first_cluster == 0 {
                continue;
            }
            match ctx.deallocate_cluster(0, node.first_cluster, 0, None, alloc_flags(node.kind)) {
                Ok(_) => node.first_cluster = 0,
                Err(err) => log::warn!(
                    "leaking clusters of unlinked node at {}: {err}",
                    node.first_cluster
                ),
            }
        }
    }

    /// Forgets every node and re-creates the root under the current epoch.
    fn reset_nodes(&self, vcb: &Vcb) {
        let mut nodes = self.nodes.lock();
        nodes.clear();
        nodes.insert(
            Node::root(vcb.root_cluster(), vcb.volume_xde.dir_default()),
            None,
        );
    }

    /// Changes the mount flags. Only `READ_ONLY` and the log mode may change,
    /// plus switching XDE on for a writable volume, which writes out the
    /// metadata cached on open nodes. On success every non-root handle goes
    /// stale and the root must be fetched again.
    pub fn remount(&self, flags: MountFlags) -> FsResult<()> {
        let mut vcb = self.vcb.write();
        vcb.check_mounted()?;
        let old = vcb.flags;
        let new = flags.resolve();

        let changed = old ^ new;
        let mut allowed = MountFlags::READ_ONLY | MountFlags::LOG_MODES;
        if changed.contains(MountFlags::READ_ONLY) {
            allowed |= MountFlags::LAZY_CREATE | MountFlags::SYNC_META | MountFlags::SYNC_DATA;
        }
        if new.contains(MountFlags::XDE) && !new.contains(MountFlags::READ_ONLY) {
            allowed |= MountFlags::XDE;
        }
        if !(changed - allowed).is_empty() {
            log::debug!("remount refused: {:?} cannot change", changed - allowed);
            return Err(FsError::Invalid);
        }

        let mut volume_xde = vcb.volume_xde;
        if changed.contains(MountFlags::XDE) {
            let ctx = self.ctx_with(&vcb, new);
            let pal = PalCache::new();
            let root = DirRef {
                first_cluster: vcb.root_cluster(),
                pal: &pal,
            };
            volume_xde = ctx.mount_xde(&root)?;

            // Each node leaves XDE_PENDING as its record lands, and a record
            // that moved is rekeyed at once, so a failure part way leaves
            // only the unwritten nodes pending for the next attempt.
            let pending: Vec<(u32, NodeRef)> = self
                .nodes
                .lock()
                .open_nodes()
                .map(|(index, node)| (index, node.clone()))
                .collect();
            for (index, node) in pending {
                let mut node = node.write();
                if !node.flags.contains(NodeFlags::XDE_PENDING) || node.location.is_none() {
                    continue;
                }
                let info = node.xde;
                match ctx.update_xde(&mut node, info) {
                    Ok(Some(key)) => self.nodes.lock().rekey(index, Some(key)),
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!("remount with XDE stopped writing pending metadata: {err}");
                        return Err(err);
                    }
                }
            }
        }

        if !old.contains(MountFlags::READ_ONLY) {
            self.release_unlinked(&self.ctx(&vcb));
            if new.contains(MountFlags::READ_ONLY) {
                self.write_fs_info(&vcb.geo)?;
                self.device.flush()?;
            }
        }

        vcb.flags = new;
        vcb.volume_xde = volume_xde;
        vcb.epoch = next_epoch(vcb.epoch);
        self.reset_nodes(&vcb);
        log::debug!("remounted with {new:?}, epoch {}", vcb.epoch);
        Ok(())
    }

    /// Flushes everything and detaches every handle. Fails with `Busy` while
    /// non-root nodes are open, unless `force`.
    pub fn unmount(&self, force: bool) -> FsResult<()> {
        let mut vcb = self.vcb.write();
        vcb.check_mounted()?;
        let open = self.nodes.lock().open_count();
        if open > 0 && !force {
            log::debug!("unmount refused: {open} nodes open");
            return Err(FsError::Busy);
        }

        if !vcb.flags.contains(MountFlags::READ_ONLY) {
            self.release_unlinked(&self.ctx(&vcb));
            self.write_fs_info(&vcb.geo)?;
        }
        self.device.flush()?;

        self.nodes.lock().clear();
        vcb.epoch = next_epoch(vcb.epoch);
        vcb.state = VolumeState::Unmounted;
        log::debug!("unmounted ({open} nodes dropped)");
        Ok(())
    }

    /// Unmounts (forcibly, if still mounted) and hands back the device.
    pub fn into_device(self) -> FsResult<D> {
        if self.vcb.read().state == VolumeState::Mounted {
            self.unmount(true)?;
        }
        Ok(self.device)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn status(&self) -> FsResult<VolumeStatus> {
        let vcb = self.vcb.read();
        vcb.check_mounted()?;
        let free_clusters = self.fat.lock().free_clusters;
        let open_nodes = self.nodes.lock().open_count();
        let counters = &self.counters;
        Ok(VolumeStatus {
            fat_type: vcb.geo.fat_type,
            bytes_per_sector: vcb.geo.bytes_per_sector,
            cluster_size: vcb.geo.cluster_size,
            total_clusters: vcb.geo.total_clusters,
            free_clusters,
            flags: vcb.flags,
            epoch: vcb.epoch,
            label: label_string(&vcb.label),
            volume_xde: vcb.volume_xde,
            open_nodes,
            orphan_xde_skips: Counters::get(&counters.orphan_xde_skips),
            lfn_discards: Counters::get(&counters.lfn_discards),
            xde_checksum_mismatches: Counters::get(&counters.xde_checksum_mismatches),
            xde_marked_entries: Counters::get(&counters.xde_marked_entries),
        })
    }

    /// Flushes the FSInfo hint and the device.
    pub fn sync(&self) -> FsResult<()> {
        let vcb = self.vcb.read();
        vcb.check_mounted()?;
        if !vcb.flags.contains(MountFlags::READ_ONLY) {
            self.write_fs_info(&vcb.geo)?;
        }
        self.device.flush()
    }

    pub fn volume_label(&self) -> FsResult<String> {
        let vcb = self.vcb.read();
        vcb.check_mounted()?;
        Ok(label_string(&vcb.label))
    }

    /// Writes `label` into the root directory's label entry (creating it if
    /// needed) and into the boot sector.
    pub fn set_volume_label(&self, label: &str) -> FsResult<()> {
        let raw = label_bytes(label)?;
        let mut vcb = self.vcb.write();
        vcb.check_mounted()?;
        {
            let ctx = self.ctx(&vcb);
            ctx.check_writable()?;
            let root = {
                let nodes = self.nodes.lock();
                let generation = nodes
                    .generation(NodeTable::ROOT_INDEX)
                    .ok_or(FsError::Invalid)?;
                nodes.get(NodeTable::ROOT_INDEX, generation)?
            };
            let root = root.write();
            let root_dir = root.as_dir();

            let existing = find_label(&ctx, &root_dir)?;
            let _namespace = ctx.namespace.lock();
            match existing {
                Some(found) => {
                    let mut entry = found.entry;
                    entry.name = raw;
                    ctx.write_record(found.location.sfne, &entry.to_raw())?;
                }
                None => {
                    let entry = ShortEntry::new(raw, Attributes::VOLUME_ID | Attributes::ARCHIVE);
                    ctx.create_entries(&root_dir, &[entry.to_raw()], 0)?;
                }
            }

            let offset = vcb.geo.label_offset();
            self.device.write_at(offset, &raw)?;
            if let Some(backup) = vcb.geo.backup_boot_offset {
                self.device.write_at(backup + offset, &raw)?;
            }
            ctx.sync_meta()?;
        }
        vcb.label = raw;
        log::debug!("volume label set to {label:?}");
        Ok(())
    }

    pub fn root(&self) -> FsResult<NodeHandle> {
        let vcb = self.vcb.read();
        vcb.check_mounted()?;
        let generation = self
            .nodes
            .lock()
            .generation(NodeTable::ROOT_INDEX)
            .ok_or(FsError::Invalid)?;
        Ok(Self::handle(&vcb, (NodeTable::ROOT_INDEX, generation)))
    }

    /// Opens the entry called `name` in `dir`. Looking up an entry that is
    /// already open returns the same node with one more reference.
    pub fn lookup(&self, dir: NodeHandle, name: &str) -> FsResult<NodeHandle> {
        validate_long_name(name)?;
        let vcb = self.vcb.read();
        let dir_node = self.node(&vcb, dir)?;
        let dir_node = dir_node.read();
        check_live_dir(&dir_node)?;

        let ctx = self.ctx(&vcb);
        let entry = ctx
            .lookup(&dir_node.as_dir(), name)?
            .ok_or(FsError::NotFound)?;
        Ok(self.open_entry(&vcb, entry))
    }

    fn open_entry(&self, vcb: &Vcb, entry: RawDirEntry) -> NodeHandle {
        let key = pos_offset(&vcb.geo, entry.location.sfne);
        let mut nodes = self.nodes.lock();
        if let Some(found) = nodes.find(key) {
            nodes.retain(found.0);
            return Self::handle(vcb, found);
        }
        let node = Node::from_entry(
            entry.name,
            &entry.entry,
            entry.location,
            entry.xde,
            vcb.geo.fat_type,
        );
        Self::handle(vcb, nodes.insert(node, Some(key)))
    }

    /// Drops one reference. The last close of an unlinked node frees its
    /// clusters.
    pub fn close(&self, handle: NodeHandle) -> FsResult<()> {
        let vcb = self.vcb.read();
        vcb.check_handle(handle)?;
        let released = self.nodes.lock().release(handle.index, handle.generation)?;
        let Some(node) = released else {
            return Ok(());
        };

        let node = node.read();
        if node.flags.contains(NodeFlags::OPEN_UNLINKED) && node.first_cluster != 0 {
            let freed = self.ctx(&vcb).deallocate_cluster(
                0,
                node.first_cluster,
                0,
                None,
                alloc_flags(node.kind),
            )?;
            log::debug!("released {freed} clusters of unlinked {:?}", node.name);
        }
        Ok(())
    }

    /// The entry at or after `offset` in `dir` and the offset of the one
    /// after it. Label entries are skipped.
    pub fn read_dir(&self, dir: NodeHandle, offset: u32) -> FsResult<Option<(DirEntry, u32)>> {
        self.read_dir_with(dir, offset, ReadDirFlags::SKIP_VOLUME_LABEL)
    }

    pub fn read_dir_with(
        &self,
        dir: NodeHandle,
        offset: u32,
        flags: ReadDirFlags,
    ) -> FsResult<Option<(DirEntry, u32)>> {
        let vcb = self.vcb.read();
        let node = self.node(&vcb, dir)?;
        let node = node.read();
        check_live_dir(&node)?;
        let fat_type = vcb.geo.fat_type;
        Ok(self
            .ctx(&vcb)
            .read_dir(&node.as_dir(), offset, flags)?
            .map(|(raw, next)| (DirEntry::from_raw(raw, fat_type), next)))
    }

    pub fn is_empty(&self, dir: NodeHandle) -> FsResult<bool> {
        let vcb = self.vcb.read();
        let node = self.node(&vcb, dir)?;
        let node = node.read();
        check_live_dir(&node)?;
        self.ctx(&vcb).is_empty(&node.as_dir(), node.is_root)
    }

    pub fn create_file(&self, dir: NodeHandle, name: &str) -> FsResult<NodeHandle> {
        self.create(dir, name, NodeKind::File)
    }

    pub fn create_dir(&self, dir: NodeHandle, name: &str) -> FsResult<NodeHandle> {
        self.create(dir, name, NodeKind::Directory)
    }

    fn create(&self, dir: NodeHandle, name: &str, kind: NodeKind) -> FsResult<NodeHandle> {
        let units = validate_long_name(name)?;
        let vcb = self.vcb.read();
        let ctx = self.ctx(&vcb);
        ctx.check_writable()?;
        let dir_node = self.node(&vcb, dir)?;
        let dir_node = dir_node.write();
        check_live_dir(&dir_node)?;
        let dir_ref = dir_node.as_dir();

        if ctx.lookup(&dir_ref, name)?.is_some() {
            return Err(FsError::Exists);
        }

        let is_dir = kind == NodeKind::Directory;
        let fat_type = vcb.geo.fat_type;
        let _namespace = ctx.namespace.lock();
        let (short, needs_long) = ctx.short_name_for(&dir_ref, name)?;
        let attr = if is_dir {
            Attributes::DIRECTORY
        } else {
            Attributes::ARCHIVE
        };
        let mut entry = ShortEntry::new(short.0, attr);

        let cluster = if is_dir || !vcb.flags.contains(MountFlags::LAZY_CREATE) {
            let vc = ctx.allocate_cluster(0, 1, alloc_flags(kind))?;
            vc.first().ok_or(FsError::NoSpace)?
        } else {
            0
        };

        let result: FsResult<(DeLocation, XdeInfo)> = (|| {
            if is_dir {
                let parent = if dir_node.is_root {
                    0
                } else {
                    dir_node.first_cluster
                };
                ctx.init_cluster(cluster, parent)?;
            }
            entry.set_first_cluster(cluster, fat_type);

            let info = if is_dir {
                vcb.volume_xde.dir_default()
            } else {
                vcb.volume_xde.file_default()
            };
            let mut records = if needs_long {
                long_records(&units, short.checksum())
            } else {
                Vec::new()
            };
            let long = records.len() as u8;
            let xde_record = xde_create(&ctx, &mut entry, &info);
            records.push(entry.to_raw());
            records.extend(xde_record);
            let location = ctx.create_entries(&dir_ref, &records, long)?;
            Ok((location, info))
        })();

        let (location, info) = match result {
            Ok(done) => done,
            Err(err) => {
                if cluster != 0 {
                    if let Err(undo) = ctx.deallocate_cluster(0, cluster, 1, None, alloc_flags(kind)) {
                        log::warn!("could not release cluster {cluster} of failed create: {undo}");
                    }
                }
                return Err(err);
            }
        };

        let node = Node::from_entry(String::from(name), &entry, location, info, fat_type);
        let key = pos_offset(&vcb.geo, location.sfne);
        log::debug!("created {kind:?} {name:?} as {short:?}");
        Ok(Self::handle(&vcb, self.nodes.lock().insert(node, Some(key))))
    }

    /// Removes the file called `name` from `dir`.
    pub fn unlink(&self, dir: NodeHandle, name: &str) -> FsResult<()> {
        self.remove_by_name(dir, name, NodeKind::File)
    }

    /// Removes the empty directory called `name` from `dir`.
    pub fn remove_dir(&self, dir: NodeHandle, name: &str) -> FsResult<()> {
        self.remove_by_name(dir, name, NodeKind::Directory)
    }

    fn remove_by_name(&self, dir: NodeHandle, name: &str, kind: NodeKind) -> FsResult<()> {
        let vcb = self.vcb.read();
        let ctx = self.ctx(&vcb);
        ctx.check_writable()?;
        let dir_ref = self.node(&vcb, dir)?;

        // The entry's open node, if any, is locked together with the
        // directory. Which node that is only shows after the lookup, so a
        // different answer than the one locked starts over.
        let mut expected: Option<(u32, NodeRef)> = None;
        loop {
            let open = {
                let mut slots = vec![(dir.index, &dir_ref)];
                slots.extend(expected.as_ref().map(|(index, node)| (*index, node)));
                let mut locks = NodeGuards::lock(slots);
                let dir_node = locks.take(&dir_ref)?;
                check_live_dir(&dir_node)?;

                let entry = ctx
                    .lookup(&dir_node.as_dir(), name)?
                    .ok_or(FsError::NotFound)?;
                match (kind, entry.is_dir()) {
                    (NodeKind::File, true) => return Err(FsError::IsDir),
                    (NodeKind::Directory, false) => return Err(FsError::NotDir),
                    _ => {}
                }
                let first_cluster = entry.entry.first_cluster(vcb.geo.fat_type);
                if kind == NodeKind::Directory {
                    let pal = PalCache::new();
                    let sub = DirRef {
                        first_cluster,
                        pal: &pal,
                    };
                    if !ctx.is_empty(&sub, false)? {
                        return Err(FsError::NotEmpty);
                    }
                }

                let open = self.find_open(&vcb, &entry.location);
                if let Some((_, node)) = &open {
                    if Arc::ptr_eq(node, &dir_ref) {
                        return Err(FsError::Invalid);
                    }
                }
                if same_node(open.as_ref(), expected.as_ref()) {
                    let child = match &expected {
                        Some((index, node)) => Some((*index, locks.take(node)?)),
                        None => None,
                    };

                    if ctx.logging() {
                        ctx.log.before_remove(&entry.location)?;
                    }
                    {
                        let _namespace = ctx.namespace.lock();
                        ctx.mark_free(&entry.location)?;
                    }

                    match child {
                        Some((index, mut node)) => {
                            detach(&mut node);
                            node.flags |= NodeFlags::OPEN_UNLINKED;
                            self.nodes.lock().rekey(index, None);
                        }
                        None if first_cluster != 0 => {
                            ctx.deallocate_cluster(0, first_cluster, 0, None, alloc_flags(kind))?;
                        }
                        None => {}
                    }
                    log::debug!("removed {kind:?} {name:?}");
                    return Ok(());
                }
                open
            };
            expected = open;
        }
    }

    /// The open node backed by the DE at `location`, if any.
    fn find_open(&self, vcb: &Vcb, location: &DeLocation) -> Option<(u32, NodeRef)> {
        let nodes = self.nodes.lock();
        let (index, generation) = nodes.find(pos_offset(&vcb.geo, location.sfne))?;
        nodes.get(index, generation).ok().map(|node| (index, node))
    }

    /// Removes the directory `node` from `parent`, by handle. Its clusters
    /// are freed now, or at last close when other references remain.
    pub fn remove(&self, parent: NodeHandle, node: NodeHandle) -> FsResult<()> {
        let vcb = self.vcb.read();
        let ctx = self.ctx(&vcb);
        ctx.check_writable()?;
        let parent_ref = self.node(&vcb, parent)?;
        let child_ref = self.node(&vcb, node)?;
        if Arc::ptr_eq(&parent_ref, &child_ref) {
            return Err(FsError::Invalid);
        }

        let mut locks = NodeGuards::lock(vec![(parent.index, &parent_ref), (node.index, &child_ref)]);
        let parent_node = locks.take(&parent_ref)?;
        let mut child = locks.take(&child_ref)?;
        if !child.flags.contains(NodeFlags::VALID) || child.is_root {
            return Err(FsError::Invalid);
        }
        if !child.is_dir() {
            return Err(FsError::NotDir);
        }
        let location = child.location.ok_or(FsError::Invalid)?;
        if location.dir_cluster != parent_node.first_cluster {
            return Err(FsError::Invalid);
        }
        if !ctx.is_empty(&child.as_dir(), false)? {
            return Err(FsError::NotEmpty);
        }

        if ctx.logging() {
            ctx.log.before_remove(&location)?;
        }
        {
            let _namespace = ctx.namespace.lock();
            ctx.mark_free(&location)?;
        }
        detach(&mut child);

        let mut nodes = self.nodes.lock();
        nodes.rekey(node.index, None);
        if nodes.refs(node.index) > 1 {
            child.flags |= NodeFlags::OPEN_UNLINKED;
            return Ok(());
        }
        drop(nodes);

        if child.first_cluster != 0 {
            ctx.deallocate_cluster(0, child.first_cluster, 0, None, AllocFlags::DIRECTORY)?;
            child.first_cluster = 0;
        }
        log::debug!("removed directory {:?}", child.name);
        Ok(())
    }

    /// Moves the entry `from_name` of `from_dir` to `to_name` in `to_dir`.
    /// Either the entry ends up under its new name, or every record is as
    /// it was.
    pub fn rename(
        &self,
        from_dir: NodeHandle,
        from_name: &str,
        to_dir: NodeHandle,
        to_name: &str,
    ) -> FsResult<()> {
        let units = validate_long_name(to_name)?;
        let vcb = self.vcb.read();
        let ctx = self.ctx(&vcb);
        ctx.check_writable()?;
        let fat_type = vcb.geo.fat_type;

        let src_ref = self.node(&vcb, from_dir)?;
        let dst_ref = self.node(&vcb, to_dir)?;
        let same_dir = Arc::ptr_eq(&src_ref, &dst_ref);

        // As in `remove_by_name`: the source's open node joins the locked
        // set, and the whole thing restarts if it changed meanwhile.
        let mut expected: Option<(u32, NodeRef)> = None;
        loop {
            let open = {
                let mut slots = vec![(from_dir.index, &src_ref), (to_dir.index, &dst_ref)];
                slots.extend(expected.as_ref().map(|(index, node)| (*index, node)));
                let mut locks = NodeGuards::lock(slots);
                let src_dir = locks.take(&src_ref)?;
                let dst_dir = if same_dir {
                    None
                } else {
                    Some(locks.take(&dst_ref)?)
                };
                let dst_node: &Node = dst_dir.as_deref().unwrap_or(&src_dir);
                check_live_dir(&src_dir)?;
                check_live_dir(dst_node)?;
                let src_list = src_dir.as_dir();
                let dst_list = dst_node.as_dir();

                let source = ctx
                    .lookup(&src_list, from_name)?
                    .ok_or(FsError::NotFound)?;
                if let Some(existing) = ctx.lookup(&dst_list, to_name)? {
                    if existing.location != source.location {
                        return Err(FsError::Exists);
                    }
                }

                let moving = source.entry.first_cluster(fat_type);
                let moves_dir = source.is_dir() && !same_dir;
                if moves_dir {
                    check_not_inside(&ctx, moving, dst_node)?;
                }

                let open = self.find_open(&vcb, &source.location);
                if let Some((_, node)) = &open {
                    if Arc::ptr_eq(node, &src_ref) || Arc::ptr_eq(node, &dst_ref) {
                        return Err(FsError::Invalid);
                    }
                }
                if same_node(open.as_ref(), expected.as_ref()) {
                    let child = match &expected {
                        Some((index, node)) => Some((*index, locks.take(node)?)),
                        None => None,
                    };

                    let _namespace = ctx.namespace.lock();
                    let (short, needs_long) = ctx.short_name_for(&dst_list, to_name)?;
                    let mut entry = source.entry;
                    entry.name = short.0;
                    let xde_record = xde_carry_over(&source, &mut entry);
                    let mut records = if needs_long {
                        long_records(&units, short.checksum())
                    } else {
                        Vec::new()
                    };
                    let long = records.len() as u8;
                    records.push(entry.to_raw());
                    records.extend(xde_record);

                    let saved = ctx.save_records(&source.location)?;
                    let reparent = moves_dir && moving != 0;
                    let old_parent = if reparent {
                        ctx.parent_cluster(moving)?
                    } else {
                        0
                    };
                    let new_parent = if dst_node.is_root {
                        0
                    } else {
                        dst_node.first_cluster
                    };

                    if ctx.logging() {
                        ctx.log
                            .before_rename(&source.location, dst_list.first_cluster, to_name)?;
                    }
                    let location = ctx.create_entries(&dst_list, &records, long)?;
                    let committed = ctx
                        .mark_free(&source.location)
                        .and_then(|()| {
                            if reparent {
                                ctx.set_parent_cluster(moving, new_parent)
                            } else {
                                Ok(())
                            }
                        })
                        .and_then(|()| ctx.sync_meta());
                    if let Err(err) = committed {
                        let undone = if reparent {
                            ctx.set_parent_cluster(moving, old_parent)
                        } else {
                            Ok(())
                        }
                        .and_then(|()| ctx.restore_records(&saved, &source.location))
                        .and_then(|()| ctx.mark_free(&location));
                        if let Err(undo) = undone {
                            log::error!("could not undo rename of {from_name:?}: {undo}");
                        }
                        return Err(err);
                    }

                    if let Some((index, mut node)) = child {
                        node.location = Some(location);
                        node.name = String::from(to_name);
                        node.short_name = short;
                        node.nt_res = entry.nt_res();
                        self.nodes
                            .lock()
                            .rekey(index, Some(pos_offset(&vcb.geo, location.sfne)));
                    }
                    log::debug!("renamed {from_name:?} to {to_name:?}");
                    return Ok(());
                }
                open
            };
            expected = open;
        }
    }

    pub fn read(&self, handle: NodeHandle, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let vcb = self.vcb.read();
        let node = self.node(&vcb, handle)?;
        let node = node.read();
        self.ctx(&vcb).read_file(&node, offset, buf)
    }

    pub fn write(&self, handle: NodeHandle, offset: u64, data: &[u8]) -> FsResult<usize> {
        let vcb = self.vcb.read();
        let node = self.node(&vcb, handle)?;
        let mut node = node.write();
        self.ctx(&vcb).write_file(&mut node, offset, data)
    }

    pub fn truncate(&self, handle: NodeHandle, size: u64) -> FsResult<()> {
        let vcb = self.vcb.read();
        let node = self.node(&vcb, handle)?;
        let mut node = node.write();
        self.ctx(&vcb).truncate_file(&mut node, size)
    }

    pub fn metadata(&self, handle: NodeHandle) -> FsResult<Metadata> {
        let vcb = self.vcb.read();
        let node = self.node(&vcb, handle)?;
        let node = node.read();
        Ok(Metadata {
            name: node.name.clone(),
            kind: node.kind,
            size: node.size,
            first_cluster: node.first_cluster,
            attributes: node.attr,
            xde: node.xde,
            linked: node.flags.contains(NodeFlags::VALID),
        })
    }

    pub fn get_xde(&self, handle: NodeHandle) -> FsResult<XdeInfo> {
        let vcb = self.vcb.read();
        let node = self.node(&vcb, handle)?;
        let xde = node.read().xde;
        Ok(xde)
    }

    pub fn set_xde(&self, handle: NodeHandle, info: XdeInfo) -> FsResult<()> {
        let vcb = self.vcb.read();
        let node = self.node(&vcb, handle)?;
        let mut node = node.write();
        if let Some(key) = self.ctx(&vcb).update_xde(&mut node, info)? {
            self.nodes.lock().rekey(handle.index, Some(key));
        }
        Ok(())
    }

    /// Grows the directory `dir` by `clusters` clusters, counting clusters
    /// already chained after `last_known`. Returns the newly allocated ones.
    pub fn expand_dir(
        &self,
        dir: NodeHandle,
        clusters: u32,
        last_known: u32,
    ) -> FsResult<VectoredCluster> {
        let vcb = self.vcb.read();
        let node = self.node(&vcb, dir)?;
        let node = node.write();
        check_live_dir(&node)?;
        self.ctx(&vcb).expand(&node.as_dir(), clusters, last_known)
    }
}

/// Reads the allocator state: the FSInfo hint when plausible, else a full
/// FAT scan.
fn load_fat_state<D: BlockDevice>(
    device: &D,
    geo: &Geometry,
    flags: MountFlags,
) -> FsResult<FatState> {
    let hint = geo.read_fs_info(device)?.filter(|info| {
        let free = info.free_count;
        free != FsInfo::UNKNOWN && free <= geo.total_clusters
    });
    if let Some(info) = hint {
        let next_free = info.next_free;
        let next_free = if geo.is_data_cluster(next_free) { next_free } else { 2 };
        return Ok(FatState::new(info.free_count, next_free));
    }

    let table = FatTable::new(device, geo, flags.contains(MountFlags::FAT_MIRROR));
    let free = table.count_free()?;
    log::debug!("counted {free} free clusters");
    Ok(FatState::new(free, 2))
}

/// The root directory's label entry.
fn find_label<D: BlockDevice>(
    ctx: &VolumeCtx<'_, D>,
    root: &DirRef<'_>,
) -> FsResult<Option<RawDirEntry>> {
    let mut offset = 0;
    while let Some((entry, next)) = ctx.read_dir(root, offset, ReadDirFlags::empty())? {
        if entry.is_label() {
            return Ok(Some(entry));
        }
        offset = next;
    }
    Ok(None)
}

fn check_live_dir(node: &Node) -> FsResult<()> {
    if !node.is_dir() {
        Err(FsError::NotDir)
    } else if !node.flags.contains(NodeFlags::VALID) {
        Err(FsError::NotFound)
    } else {
        Ok(())
    }
}

/// Fails when `moving` is `target` or one of its ancestors.
fn check_not_inside<D: BlockDevice>(
    ctx: &VolumeCtx<'_, D>,
    moving: u32,
    target: &Node,
) -> FsResult<()> {
    if target.is_root {
        return Ok(());
    }
    let mut cursor = target.first_cluster;
    for _ in 0..=ctx.geo.total_clusters {
        if cursor == moving {
            return Err(FsError::Invalid);
        }
        cursor = ctx.parent_cluster(cursor)?;
        if cursor == 0 {
            return Ok(());
        }
    }
    log::error!("\"..\" entries above directory {} form a loop", target.first_cluster);
    Err(FsError::Corrupt)
}

/// Write guards over several nodes, always taken in ascending slot-index
/// order. Every operation that holds more than one node lock at a time
/// takes them through here.
struct NodeGuards<'a> {
    guards: Vec<(&'a NodeRef, RwLockWriteGuard<'a, Node>)>,
}

impl<'a> NodeGuards<'a> {
    fn lock(mut nodes: Vec<(u32, &'a NodeRef)>) -> Self {
        nodes.sort_unstable_by_key(|&(index, _)| index);
        nodes.dedup_by(|a, b| Arc::ptr_eq(a.1, b.1));
        Self {
            guards: nodes
                .into_iter()
                .map(|(_, node)| (node, node.write()))
                .collect(),
        }
    }

    /// Hands out the guard of `node`.
    fn take(&mut self, node: &NodeRef) -> FsResult<RwLockWriteGuard<'a, Node>> {
        let at = self
            .guards
            .iter()
            .position(|(held, _)| Arc::ptr_eq(held, node))
            .ok_or(FsError::Invalid)?;
        Ok(self.guards.swap_remove(at).1)
    }
}

fn same_node(a: Option<&(u32, NodeRef)>, b: Option<&(u32, NodeRef)>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some((_, a)), Some((_, b))) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Cuts a node loose from its DE and drops what it cached about it.
fn detach(node: &mut Node) {
    node.flags -= NodeFlags::VALID | NodeFlags::XDE_PENDING;
    node.location = None;
    node.pal.clear();
}

fn alloc_flags(kind: NodeKind) -> AllocFlags {
    match kind {
        NodeKind::Directory => AllocFlags::DIRECTORY,
        NodeKind::File => AllocFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::format::{format, FormatOptions};
    use crate::xde::Permissions;
    use crate::RamDisk;

    const MIB: usize = 1024 * 1024;

    fn formatted(size: usize, options: &FormatOptions) -> RamDisk {
        let disk = RamDisk::new(size);
        format(&disk, options).unwrap();
        disk
    }

    fn fat32(flags: MountFlags) -> Volume<RamDisk> {
        let disk = formatted(8 * MIB, &FormatOptions::default());
        Volume::mount(disk, MountOptions::new(flags)).unwrap()
    }

    fn free(volume: &Volume<RamDisk>) -> u32 {
        volume.status().unwrap().free_clusters
    }

    fn names(volume: &Volume<RamDisk>, dir: NodeHandle) -> Vec<String> {
        let mut names = Vec::new();
        let mut offset = 0;
        while let Some((entry, next)) = volume.read_dir(dir, offset).unwrap() {
            names.push(entry.name);
            offset = next;
        }
        names
    }

    #[test]
    fn flag_resolution() {
        let ro = (MountFlags::READ_ONLY | MountFlags::LOG_FULL | MountFlags::LAZY_CREATE | MountFlags::SYNC_META)
            .resolve();
        assert_eq!(ro, MountFlags::READ_ONLY | MountFlags::LOG_OFF);

        let both = (MountFlags::LOG_OFF | MountFlags::LOG_FULL).resolve();
        assert_eq!(both & MountFlags::LOG_MODES, MountFlags::LOG_FULL);

        let none = MountFlags::FAT_MIRROR.resolve();
        assert_eq!(none, MountFlags::FAT_MIRROR | MountFlags::LOG_PARTIAL);
    }

    #[test]
    fn mount_rejects_garbage() {
        let disk = RamDisk::new(MIB);
        assert_eq!(
            Volume::mount(disk, MountOptions::default()).unwrap_err(),
            FsError::Invalid
        );
    }

    #[test]
    fn create_lookup_and_list() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let file = volume.create_file(root, "Long File Name.txt").unwrap();
        let dir = volume.create_dir(root, "SUB").unwrap();

        assert_eq!(volume.lookup(root, "long file name.TXT").unwrap(), file);
        assert_eq!(volume.lookup(root, "LONGFI~1.TXT").unwrap(), file);
        assert_eq!(names(&volume, root), ["Long File Name.txt", "SUB"]);
        assert_eq!(names(&volume, dir), [".", ".."]);
        assert!(volume.is_empty(dir).unwrap());
        assert!(!volume.is_empty(root).unwrap());

        assert_eq!(
            volume.create_file(root, "long file name.txt").unwrap_err(),
            FsError::Exists
        );
        assert_eq!(volume.lookup(root, "missing").unwrap_err(), FsError::NotFound);
        assert_eq!(volume.lookup(file, "x").unwrap_err(), FsError::NotDir);
        assert_eq!(volume.create_file(root, "a/b").unwrap_err(), FsError::Invalid);
    }

    #[test]
    fn lazy_create_controls_preallocation() {
        let lazy = fat32(MountFlags::default());
        let before = free(&lazy);
        let root = lazy.root().unwrap();
        let file = lazy.create_file(root, "a").unwrap();
        assert_eq!(free(&lazy), before);
        assert_eq!(lazy.metadata(file).unwrap().first_cluster, 0);

        let eager = fat32(MountFlags::LOG_PARTIAL | MountFlags::FAT_MIRROR);
        let before = free(&eager);
        let root = eager.root().unwrap();
        let file = eager.create_file(root, "a").unwrap();
        assert_eq!(free(&eager), before - 1);
        assert_eq!(eager.write(file, 0, b"hi").unwrap(), 2);
        assert_eq!(free(&eager), before - 1);
    }

    #[test]
    fn write_read_across_clusters() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let file = volume.create_file(root, "data.bin").unwrap();
        let data: Vec<u8> = (0..3 * 4096 + 100).map(|i| (i % 251) as u8).collect();
        assert_eq!(volume.write(file, 0, &data).unwrap(), data.len());

        volume.close(file).unwrap();
        let file = volume.lookup(root, "DATA.BIN").unwrap();
        assert_eq!(volume.metadata(file).unwrap().size as usize, data.len());
        let mut back = vec![0; data.len() + 10];
        assert_eq!(volume.read(file, 0, &mut back).unwrap(), data.len());
        assert_eq!(&back[..data.len()], &data[..]);
    }

    #[test]
    fn is_empty_follows_removal() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let dir = volume.create_dir(root, "d").unwrap();
        volume.create_file(dir, "f").unwrap();
        assert!(!volume.is_empty(dir).unwrap());
        assert_eq!(volume.remove_dir(root, "d").unwrap_err(), FsError::NotEmpty);
        assert_eq!(volume.remove(root, dir).unwrap_err(), FsError::NotEmpty);

        volume.unlink(dir, "f").unwrap();
        assert!(volume.is_empty(dir).unwrap());
        assert_eq!(names(&volume, dir), [".", ".."]);
    }

    #[test]
    fn remove_twice_leaves_free_count_alone() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let before = free(&volume);

        let dir = volume.create_dir(root, "gone").unwrap();
        volume.remove(root, dir).unwrap();
        assert_eq!(free(&volume), before);
        assert_eq!(volume.remove(root, dir).unwrap_err(), FsError::Invalid);
        assert_eq!(free(&volume), before);

        volume.create_dir(root, "again").unwrap();
        volume.remove_dir(root, "again").unwrap();
        let after = free(&volume);
        assert_eq!(volume.remove_dir(root, "again").unwrap_err(), FsError::NotFound);
        assert_eq!(free(&volume), after);
    }

    #[test]
    fn remove_checks_kinds() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let file = volume.create_file(root, "f").unwrap();
        volume.create_dir(root, "d").unwrap();
        assert_eq!(volume.remove(root, file).unwrap_err(), FsError::NotDir);
        assert_eq!(volume.remove_dir(root, "f").unwrap_err(), FsError::NotDir);
        assert_eq!(volume.unlink(root, "d").unwrap_err(), FsError::IsDir);
    }

    #[test]
    fn unlinked_file_lives_until_last_close() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let before = free(&volume);
        let file = volume.create_file(root, "tmp").unwrap();
        volume.write(file, 0, &[7; 5000]).unwrap();
        let second = volume.lookup(root, "tmp").unwrap();

        volume.unlink(root, "tmp").unwrap();
        assert_eq!(volume.lookup(root, "tmp").unwrap_err(), FsError::NotFound);
        assert!(!volume.metadata(file).unwrap().linked);

        let mut buf = [0; 5000];
        assert_eq!(volume.read(file, 0, &mut buf).unwrap(), 5000);
        assert!(buf.iter().all(|&b| b == 7));

        volume.close(file).unwrap();
        assert_eq!(free(&volume), before - 2);
        volume.close(second).unwrap();
        assert_eq!(free(&volume), before);
    }

    #[test]
    fn rename_moves_between_directories() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let a = volume.create_dir(root, "a").unwrap();
        let b = volume.create_dir(root, "b").unwrap();
        let file = volume.create_file(a, "note.txt").unwrap();
        volume.write(file, 0, b"hello").unwrap();

        volume.rename(a, "note.txt", b, "renamed note.txt").unwrap();
        assert!(volume.is_empty(a).unwrap());
        assert_eq!(names(&volume, b), [".", "..", "renamed note.txt"]);
        assert_eq!(volume.metadata(file).unwrap().name, "renamed note.txt");

        volume.close(file).unwrap();
        let moved = volume.lookup(b, "RENAMED NOTE.TXT").unwrap();
        let mut buf = [0; 5];
        volume.read(moved, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn rename_rejects_collisions_and_cycles() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let outer = volume.create_dir(root, "outer").unwrap();
        let inner = volume.create_dir(outer, "inner").unwrap();
        volume.create_file(root, "x").unwrap();
        volume.create_file(root, "y").unwrap();

        assert_eq!(volume.rename(root, "x", root, "y").unwrap_err(), FsError::Exists);
        assert_eq!(
            volume.rename(root, "outer", inner, "loop").unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(volume.rename(root, "nope", root, "z").unwrap_err(), FsError::NotFound);
        volume.rename(root, "x", root, "X").unwrap();
        assert_eq!(names(&volume, root), ["outer", "y", "X"]);
    }

    #[test]
    fn rename_updates_dotdot() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let a = volume.create_dir(root, "a").unwrap();
        let child = volume.create_dir(root, "child").unwrap();
        let a_cluster = volume.metadata(a).unwrap().first_cluster;
        let child_cluster = volume.metadata(child).unwrap().first_cluster;

        volume.rename(root, "child", a, "child").unwrap();
        let vcb = volume.vcb.read();
        assert_eq!(volume.ctx(&vcb).parent_cluster(child_cluster).unwrap(), a_cluster);
        drop(vcb);

        volume.rename(a, "child", root, "child").unwrap();
        let vcb = volume.vcb.read();
        assert_eq!(volume.ctx(&vcb).parent_cluster(child_cluster).unwrap(), 0);
    }

    #[test]
    fn xde_survives_remount() {
        let disk = formatted(8 * MIB, &FormatOptions::default());
        let flags = MountFlags::default() | MountFlags::XDE;
        let volume = Volume::mount(disk, MountOptions::new(flags)).unwrap();
        let root = volume.root().unwrap();
        let file = volume.create_file(root, "owned by alice").unwrap();
        let info = XdeInfo::new(1000, 100, Permissions::from_mode(0o440));
        volume.set_xde(file, info).unwrap();
        volume.close(file).unwrap();

        let disk = volume.into_device().unwrap();
        let volume = Volume::mount(disk, MountOptions::new(flags)).unwrap();
        let root = volume.root().unwrap();
        let file = volume.lookup(root, "owned by alice").unwrap();
        assert_eq!(volume.get_xde(file).unwrap(), info);
        let (entry, _) = volume.read_dir(root, 0).unwrap().unwrap();
        assert!(entry.has_xde);
        assert!(entry.attributes.contains(Attributes::READ_ONLY));
    }

    #[test]
    fn xde_pending_is_written_when_remounted_with_xde() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let file = volume.create_file(root, "f").unwrap();
        let info = XdeInfo::new(5, 6, Permissions::from_mode(0o640));
        volume.set_xde(file, info).unwrap();
        assert_eq!(volume.get_xde(file).unwrap(), info);

        volume.remount(MountFlags::default() | MountFlags::XDE).unwrap();
        assert_eq!(volume.get_xde(file).unwrap_err(), FsError::CrossDevice);
        let root = volume.root().unwrap();
        let file = volume.lookup(root, "f").unwrap();
        assert_eq!(volume.get_xde(file).unwrap(), info);
    }

    #[test]
    fn remount_with_xde_keeps_moved_nodes_indexed_on_write_errors() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let info = XdeInfo::new(5, 6, Permissions::from_mode(0o640));
        // Packed back to back, so all but the last must move to make room.
        let files: Vec<NodeHandle> = ["f1", "f2", "f3", "f4"]
            .iter()
            .map(|name| {
                let file = volume.create_file(root, name).unwrap();
                volume.set_xde(file, info).unwrap();
                file
            })
            .collect();

        let mut failures = 0;
        loop {
            volume.device().fail_write_after(failures);
            let remounted = volume.remount(MountFlags::default() | MountFlags::XDE);
            volume.device().clear_write_fault();
            match remounted {
                Ok(()) => break,
                Err(err) => assert_eq!(err, FsError::Io),
            }
            failures += 1;

            let vcb = volume.vcb.read();
            for file in &files {
                let node = volume.node(&vcb, *file).unwrap();
                let node = node.read();
                let location = node.location.unwrap();
                assert_eq!(
                    volume.nodes.lock().find(pos_offset(&vcb.geo, location.sfne)),
                    Some((file.index, file.generation))
                );
            }
        }
        assert!(failures > 4);

        let root = volume.root().unwrap();
        assert_eq!(names(&volume, root), ["f1", "f2", "f3", "f4"]);
        for name in ["f1", "f2", "f3", "f4"] {
            let file = volume.lookup(root, name).unwrap();
            assert_eq!(volume.get_xde(file).unwrap(), info);
        }
    }

    #[test]
    fn rename_and_remove_do_not_deadlock() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let filler = volume.create_file(root, "filler").unwrap();
        let parent = volume.create_dir(root, "parent").unwrap();
        volume.close(filler).unwrap();
        let free_before = free(&volume);

        for _ in 0..200 {
            // Reuses the filler's slot, below the parent's.
            let child = volume.create_dir(parent, "child").unwrap();
            assert!(child.index < parent.index);
            let file = volume.create_file(parent, "f").unwrap();
            volume.close(file).unwrap();

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    let _ = volume.rename(parent, "f", child, "f");
                });
                scope.spawn(|| {
                    let _ = volume.remove(parent, child);
                });
            });

            let _ = volume.unlink(child, "f");
            let _ = volume.unlink(parent, "f");
            let _ = volume.remove(parent, child);
            volume.close(child).unwrap();
        }

        assert_eq!(names(&volume, parent), [".", ".."]);
        assert_eq!(free(&volume), free_before);
    }

    #[test]
    fn rename_unwinds_on_write_errors() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let a = volume.create_dir(root, "a").unwrap();
        let b = volume.create_dir(root, "b").unwrap();
        let sub = volume.create_dir(a, "sub dir").unwrap();
        let inner = volume.create_file(sub, "inner").unwrap();
        volume.close(inner).unwrap();
        let sub_cluster = volume.metadata(sub).unwrap().first_cluster;
        volume.close(sub).unwrap();
        let a_cluster = volume.metadata(a).unwrap().first_cluster;
        let b_cluster = volume.metadata(b).unwrap().first_cluster;
        let free_before = free(&volume);

        let mut failures = 0;
        loop {
            volume.device().fail_write_after(failures);
            let renamed = volume.rename(a, "sub dir", b, "moved dir");
            volume.device().clear_write_fault();
            match renamed {
                Ok(()) => break,
                Err(err) => assert_eq!(err, FsError::Io),
            }
            failures += 1;

            assert_eq!(names(&volume, a), [".", "..", "sub dir"]);
            assert_eq!(names(&volume, b), [".", ".."]);
            assert_eq!(free(&volume), free_before);
            let vcb = volume.vcb.read();
            assert_eq!(volume.ctx(&vcb).parent_cluster(sub_cluster).unwrap(), a_cluster);
            drop(vcb);
            let found = volume.lookup(a, "sub dir").unwrap();
            assert_eq!(names(&volume, found), [".", "..", "inner"]);
            volume.close(found).unwrap();
        }
        // Both halves of the new entry, both of the old one, and "..".
        assert!(failures >= 5);

        assert_eq!(names(&volume, a), [".", ".."]);
        assert_eq!(names(&volume, b), [".", "..", "moved dir"]);
        let moved = volume.lookup(b, "moved dir").unwrap();
        assert_eq!(names(&volume, moved), [".", "..", "inner"]);
        let vcb = volume.vcb.read();
        assert_eq!(volume.ctx(&vcb).parent_cluster(sub_cluster).unwrap(), b_cluster);
    }

    #[test]
    fn expand_dir_unwinds_on_write_errors() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let dir = volume.create_dir(root, "d").unwrap();
        let first = volume.metadata(dir).unwrap().first_cluster;
        let free_before = free(&volume);
        let on_disk = |volume: &Volume<RamDisk>| {
            let vcb = volume.vcb.read();
            let ctx = volume.ctx(&vcb);
            (ctx.fat().count_free().unwrap(), ctx.chain_length(first).unwrap())
        };

        let mut failures = 0;
        let added = loop {
            volume.device().fail_write_after(failures);
            let expanded = volume.expand_dir(dir, 2, 0);
            volume.device().clear_write_fault();
            match expanded {
                Ok(vc) => break vc,
                Err(err) => assert_eq!(err, FsError::Io),
            }
            failures += 1;

            assert_eq!(free(&volume), free_before);
            assert_eq!(on_disk(&volume), (free_before, 1));
            assert_eq!(names(&volume, dir), [".", ".."]);
        };

        assert!(failures > 0);
        assert_eq!(added.total(), 2);
        assert_eq!(free(&volume), free_before - 2);
        assert_eq!(on_disk(&volume), (free_before - 2, 3));
        assert_eq!(names(&volume, dir), [".", ".."]);
    }

    #[test]
    fn non_xde_mount_reports_marked_entries() {
        let disk = formatted(8 * MIB, &FormatOptions::default());
        let flags = MountFlags::default() | MountFlags::XDE;
        let volume = Volume::mount(disk, MountOptions::new(flags)).unwrap();
        let root = volume.root().unwrap();
        volume.create_file(root, "a").unwrap();
        volume.create_file(root, "b").unwrap();

        let disk = volume.into_device().unwrap();
        let volume = Volume::mount(disk, MountOptions::default()).unwrap();
        assert_eq!(volume.status().unwrap().xde_marked_entries, 2);
        let root = volume.root().unwrap();
        assert_eq!(names(&volume, root), ["a", "b"]);
    }

    #[test]
    fn remount_invalidates_handles() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let file = volume.create_file(root, "f").unwrap();
        let epoch = volume.status().unwrap().epoch;

        volume.remount(MountFlags::default() | MountFlags::LOG_FULL).unwrap();
        assert_eq!(volume.status().unwrap().epoch, epoch + 1);
        assert_eq!(volume.metadata(file).unwrap_err(), FsError::CrossDevice);
        assert_eq!(volume.lookup(root, "f").unwrap_err(), FsError::CrossDevice);
        let root = volume.root().unwrap();
        assert!(volume.lookup(root, "f").is_ok());
    }

    #[test]
    fn remount_rejects_other_flags() {
        let volume = fat32(MountFlags::default());
        let before = volume.status().unwrap();
        assert_eq!(
            volume.remount(MountFlags::default() | MountFlags::CASE_SENSITIVE).unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(
            volume.remount(MountFlags::default() - MountFlags::FAT_MIRROR).unwrap_err(),
            FsError::Invalid
        );
        let after = volume.status().unwrap();
        assert_eq!(after.flags, before.flags);
        assert_eq!(after.epoch, before.epoch);
    }

    #[test]
    fn read_only_remount_blocks_writes() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        volume.create_file(root, "f").unwrap();

        volume.remount(MountFlags::default() | MountFlags::READ_ONLY).unwrap();
        let flags = volume.status().unwrap().flags;
        assert_eq!(flags, MountFlags::READ_ONLY | MountFlags::LOG_OFF | MountFlags::FAT_MIRROR);

        let root = volume.root().unwrap();
        let file = volume.lookup(root, "f").unwrap();
        assert_eq!(volume.write(file, 0, b"x").unwrap_err(), FsError::ReadOnly);
        assert_eq!(volume.create_file(root, "g").unwrap_err(), FsError::ReadOnly);
        assert_eq!(volume.set_volume_label("RO").unwrap_err(), FsError::ReadOnly);

        volume.remount(MountFlags::default()).unwrap();
        let root = volume.root().unwrap();
        volume.create_file(root, "g").unwrap();
    }

    #[test]
    fn unmount_busy_then_forced() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let file = volume.create_file(root, "f").unwrap();

        assert_eq!(volume.unmount(false).unwrap_err(), FsError::Busy);
        volume.unmount(true).unwrap();
        assert_eq!(volume.metadata(file).unwrap_err(), FsError::CrossDevice);
        assert_eq!(volume.root().unwrap_err(), FsError::CrossDevice);
        assert_eq!(volume.status().unwrap_err(), FsError::CrossDevice);
        assert_eq!(volume.unmount(true).unwrap_err(), FsError::CrossDevice);
    }

    #[test]
    fn free_count_persists_through_fs_info() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let file = volume.create_file(root, "f").unwrap();
        volume.write(file, 0, &[1; 3 * 4096]).unwrap();
        let expected = free(&volume);
        volume.close(file).unwrap();

        let disk = volume.into_device().unwrap();
        let geo = Geometry::read(&disk).unwrap();
        let info = geo.read_fs_info(&disk).unwrap().unwrap();
        let stored = info.free_count;
        assert_eq!(stored, expected);

        let volume = Volume::mount(disk, MountOptions::default()).unwrap();
        assert_eq!(free(&volume), expected);
    }

    #[test]
    fn expand_dir_allocates_zeroed_clusters() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        let dir = volume.create_dir(root, "d").unwrap();
        let before = free(&volume);

        let vc = volume.expand_dir(dir, 2, 0).unwrap();
        assert_eq!(vc.total(), 2);
        assert_eq!(free(&volume), before - 2);
        assert!(volume.is_empty(dir).unwrap());
    }

    #[test]
    fn label_round_trip() {
        let volume = fat32(MountFlags::default());
        assert_eq!(volume.volume_label().unwrap(), "NO NAME");
        volume.set_volume_label("backup").unwrap();
        assert_eq!(volume.volume_label().unwrap(), "BACKUP");
        let root = volume.root().unwrap();
        assert!(names(&volume, root).is_empty());

        let disk = volume.into_device().unwrap();
        assert_eq!(label_string(&Geometry::read(&disk).unwrap().label), "BACKUP");
        let volume = Volume::mount(disk, MountOptions::default()).unwrap();
        assert_eq!(volume.volume_label().unwrap(), "BACKUP");
    }

    #[test]
    fn label_on_full_fixed_root_is_no_space() {
        let options = FormatOptions {
            root_entries: 16,
            ..FormatOptions::fat16()
        };
        let disk = formatted(4 * MIB, &options);
        let volume = Volume::mount(disk, MountOptions::default()).unwrap();
        let root = volume.root().unwrap();
        for i in 0..16 {
            let name = alloc::format!("F{i}");
            volume.create_file(root, &name).unwrap();
        }
        assert_eq!(volume.create_file(root, "ONE MORE").unwrap_err(), FsError::NoSpace);
        assert_eq!(volume.set_volume_label("FULL").unwrap_err(), FsError::NoSpace);
        assert_eq!(volume.volume_label().unwrap(), "NO NAME");
    }

    #[test]
    fn label_grows_full_fat32_root() {
        let volume = fat32(MountFlags::default());
        let root = volume.root().unwrap();
        // One 4 KiB cluster holds 128 records.
        for i in 0..128 {
            let name = alloc::format!("F{i}");
            let file = volume.create_file(root, &name).unwrap();
            volume.close(file).unwrap();
        }
        let before = free(&volume);
        volume.set_volume_label("GROWN").unwrap();
        assert_eq!(free(&volume), before - 1);
        assert_eq!(volume.volume_label().unwrap(), "GROWN");
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 16, .. ProptestConfig::default() })]

        #[test]
        fn is_empty_agrees_with_read_dir(
            ops in proptest::collection::vec((0_u8..6, any::<bool>()), 0..24),
        ) {
            let volume = fat32(MountFlags::default());
            let root = volume.root().unwrap();
            let dir = volume.create_dir(root, "d").unwrap();

            for (slot, create) in ops {
                let name = alloc::format!("entry number {slot}");
                if create {
                    if let Ok(file) = volume.create_file(dir, &name) {
                        volume.close(file).unwrap();
                    }
                } else {
                    let _ = volume.unlink(dir, &name);
                }
                let listed = names(&volume, dir).len() - 2;
                prop_assert_eq!(volume.is_empty(dir).unwrap(), listed == 0);
            }
        }
    }
}
