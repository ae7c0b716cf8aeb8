//! XDE layer: POSIX ownership and permission bits kept in a record right
//! after the SFNE, shaped so other FAT drivers skip it as a broken
//! long-name fragment.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::ctx::{Counters, VolumeCtx};
use crate::dir::{pos_offset, ReadDirFlags, RawDirEntry};
use crate::dirent::{
    Attributes, NtRes, RawRecord, Record, ShortEntry, XdeRecord, END_MARKER, FREE_MARKER,
    RECORD_SIZE,
};
use crate::name::ShortName;
use crate::node::{DeLocation, DirRef, Node, NodeFlags, PalCache};
use crate::{BlockDevice, FsError, FsResult};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    /// POSIX permission bits.
    pub struct Permissions: u16 {
        const IXOTH = 0o1;
        const IWOTH = 0o2;
        const IROTH = 0o4;
        const IXGRP = 0o10;
        const IWGRP = 0o20;
        const IRGRP = 0o40;
        const IXUSR = 0o100;
        const IWUSR = 0o200;
        const IRUSR = 0o400;

        /// Sticky bit.
        const ISVTX = 0o1000;
        const ISGID = 0o2000;
        const ISUID = 0o4000;

        const EXECUTE = Self::IXUSR.bits() | Self::IXGRP.bits() | Self::IXOTH.bits();
    }
}

impl Permissions {
    /// Keeps the permission bits of a `st_mode`-style value.
    pub const fn from_mode(mode: u16) -> Self {
        Self::from_bits_truncate(mode)
    }

    pub const fn mode(self) -> u16 {
        self.bits()
    }
}

/// Ownership and permissions of one file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdeInfo {
    pub uid: u32,
    pub gid: u32,
    pub perm: Permissions,
}

impl XdeInfo {
    pub const fn new(uid: u32, gid: u32, perm: Permissions) -> Self {
        Self { uid, gid, perm }
    }

    fn from_record(record: &XdeRecord) -> Self {
        let (uid, gid, perm) = (record.uid, record.gid, record.perm);
        Self::new(uid, gid, Permissions::from_mode(perm))
    }
}

/// Volume-wide XDE defaults, stored in a root directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeXde {
    pub guid: [u8; 16],
    pub uid: u32,
    pub gid: u32,
    /// Directory permissions. Files get the same minus execute.
    pub perm: Permissions,
}

impl Default for VolumeXde {
    fn default() -> Self {
        Self {
            guid: [0; 16],
            uid: 0,
            gid: 0,
            perm: Permissions::from_mode(0o755),
        }
    }
}

impl VolumeXde {
    /// Defaults for a volume, with a GUID derived from its serial number.
    pub fn for_volume_id(volume_id: u32) -> Self {
        let mut guid = [0; 16];
        let mut state = volume_id ^ 0x5844_4500;
        for byte in &mut guid {
            // xorshift32
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            *byte = state as u8;
        }
        Self {
            guid,
            ..Self::default()
        }
    }

    pub fn from_record(record: &XdeRecord) -> Self {
        let (uid, gid, perm) = (record.uid, record.gid, record.perm);
        Self {
            guid: record.guid(),
            uid,
            gid,
            perm: Permissions::from_mode(perm),
        }
    }

    pub fn to_record(&self) -> XdeRecord {
        XdeRecord::for_volume(self.guid, self.uid, self.gid, self.perm.bits())
    }

    pub fn dir_default(&self) -> XdeInfo {
        XdeInfo::new(self.uid, self.gid, self.perm)
    }

    pub fn file_default(&self) -> XdeInfo {
        XdeInfo::new(self.uid, self.gid, self.perm - Permissions::EXECUTE)
    }
}

/// Files whose permissions are fixed: system log and debug files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    LogFile,
    DebugFile,
}

impl Protection {
    pub fn of(entry: &ShortEntry) -> Self {
        if !entry.attributes().contains(Attributes::SYSTEM) {
            return Self::None;
        }
        match ShortName(entry.name).extension() {
            b"LOG" => Self::LogFile,
            b"DBG" => Self::DebugFile,
            _ => Self::None,
        }
    }

    pub fn is_protected(self) -> bool {
        self != Self::None
    }
}

/// What an entry without a (valid) XDE record reports.
pub(crate) fn default_info(volume: &VolumeXde, entry: &ShortEntry) -> XdeInfo {
    let attr = entry.attributes();
    let perm = match Protection::of(entry) {
        Protection::LogFile => Permissions::from_mode(0o400),
        Protection::DebugFile => Permissions::from_mode(0o640),
        Protection::None if attr.contains(Attributes::READ_ONLY) => Permissions::from_mode(0o555),
        Protection::None if attr.contains(Attributes::DIRECTORY) => volume.perm,
        Protection::None => volume.file_default().perm,
    };
    XdeInfo::new(volume.uid, volume.gid, perm)
}

/// Validates the XDE record that followed an SFNE whose LFN checksum is
/// `sfn_checksum`. A mismatch means "no XDE", not corruption.
pub(crate) fn xde_lookup<D: BlockDevice>(
    ctx: &VolumeCtx<'_, D>,
    record: &XdeRecord,
    sfn_checksum: u8,
) -> Option<XdeInfo> {
    if record.checksum_matches(sfn_checksum) {
        Some(XdeInfo::from_record(record))
    } else {
        Counters::bump(&ctx.counters.xde_checksum_mismatches);
        log::warn!("XDE record checksum mismatch; using default metadata");
        None
    }
}

/// Attaches `info` to a DE being built: sets the marker on `entry` and
/// returns the record to store after it. Returns `None` (nothing to write)
/// when the volume is mounted without XDE.
pub(crate) fn xde_create<D: BlockDevice>(
    ctx: &VolumeCtx<'_, D>,
    entry: &mut ShortEntry,
    info: &XdeInfo,
) -> Option<RawRecord> {
    if !ctx.xde_active() {
        return None;
    }
    entry.set_nt_res(entry.nt_res() | NtRes::XDE);
    let checksum = ShortName(entry.name).checksum();
    Some(XdeRecord::for_file(info.uid, info.gid, info.perm.bits(), checksum).to_raw())
}

/// Rename carry-over: the XDE of `source`, re-bound to the SFNE `entry`
/// that replaces it. Clears the marker when there is nothing valid to
/// carry.
pub(crate) fn xde_carry_over(source: &RawDirEntry, entry: &mut ShortEntry) -> Option<RawRecord> {
    if !source.has_xde {
        entry.set_nt_res(entry.nt_res() - NtRes::XDE);
        return None;
    }
    entry.set_nt_res(entry.nt_res() | NtRes::XDE);
    let checksum = ShortName(entry.name).checksum();
    let info = source.xde;
    Some(XdeRecord::for_file(info.uid, info.gid, info.perm.bits(), checksum).to_raw())
}

impl<D: BlockDevice> VolumeCtx<'_, D> {
    /// Stores new ownership and permissions for `node`. Returns the new
    /// device offset of its SFNE when the DE had to move to make room for
    /// the XDE record.
    ///
    /// Without XDE the metadata is only cached on the node
    /// (`XDE_PENDING`).
    pub(crate) fn update_xde(&self, node: &mut Node, info: XdeInfo) -> FsResult<Option<u64>> {
        self.check_writable()?;
        if node.is_root {
            return Err(FsError::Invalid);
        }
        let location = node.location.ok_or(FsError::Invalid)?;

        let _namespace = self.namespace.lock();
        let mut entry: ShortEntry = zerocopy::transmute!(self.read_record(location.sfne)?);
        if Protection::of(&entry).is_protected() {
            return Err(FsError::Access);
        }

        if !self.xde_active() {
            node.xde = info;
            node.flags |= NodeFlags::XDE_PENDING;
            return Ok(None);
        }

        if self.logging() {
            self.log.before_update_xde(&location, &info)?;
        }

        entry.set_nt_res(entry.nt_res() | NtRes::XDE);
        let mut attr = entry.attributes();
        attr.set(
            Attributes::READ_ONLY,
            !info.perm.contains(Permissions::IWUSR),
        );
        entry.set_attributes(attr);
        let checksum = ShortName(entry.name).checksum();
        let record = XdeRecord::for_file(info.uid, info.gid, info.perm.bits(), checksum).to_raw();

        let pal = PalCache::new();
        let dir = DirRef {
            first_cluster: location.dir_cluster,
            pal: &pal,
        };
        let (new_location, moved) = if location.has_xde_slot() {
            self.write_record(location.end, &record)?;
            self.write_record(location.sfne, &entry.to_raw())?;
            (location, false)
        } else {
            let next = location.sfne_stream_offset() + RECORD_SIZE;
            let free_slot = match self.record_pos(&dir, next)? {
                Some(pos) => is_free_slot(&self.read_record(pos)?).then_some(pos),
                None => None,
            };
            match free_slot {
                Some(pos) => {
                    self.write_record(pos, &record)?;
                    self.write_record(location.sfne, &entry.to_raw())?;
                    let mut grown = location;
                    grown.end = pos;
                    grown.records += 1;
                    (grown, false)
                }
                None => (self.relocate(&dir, &location, &entry, record)?, true),
            }
        };
        self.sync_meta()?;

        node.xde = info;
        node.attr = attr;
        node.nt_res = entry.nt_res();
        node.location = Some(new_location);
        node.flags -= NodeFlags::XDE_PENDING;
        Ok(moved.then(|| pos_offset(self.geo, new_location.sfne)))
    }

    /// Rewrites a DE somewhere in its directory with room for the XDE
    /// record, then frees the old run.
    fn relocate(
        &self,
        dir: &DirRef<'_>,
        location: &DeLocation,
        entry: &ShortEntry,
        record: RawRecord,
    ) -> FsResult<DeLocation> {
        let positions = self.record_positions(location)?;
        let mut records: Vec<RawRecord> = positions
            .iter()
            .take(usize::from(location.long_records))
            .map(|&pos| self.read_record(pos))
            .collect::<FsResult<_>>()?;
        records.push(entry.to_raw());
        records.push(record);

        let saved = self.save_records(location)?;
        let moved = self.create_entries(dir, &records, location.long_records)?;
        if let Err(err) = self.mark_free(location) {
            let undone = self
                .restore_records(&saved, location)
                .and_then(|()| self.mark_free(&moved));
            if let Err(undo) = undone {
                log::error!("could not undo DE move: {undo}");
            }
            return Err(err);
        }
        log::debug!(
            "moved DE from directory offset {:#x} to {:#x} to fit its XDE record",
            location.stream_offset,
            moved.stream_offset
        );
        Ok(moved)
    }

    /// Mount with XDE: loads the volume record from the root directory, or
    /// writes one on a writable volume that has none.
    pub(crate) fn mount_xde(&self, root: &DirRef<'_>) -> FsResult<VolumeXde> {
        if let Some(found) = self.find_volume_xde(root)? {
            log::debug!("loaded volume XDE defaults: {found:?}");
            return Ok(found);
        }
        let volume = VolumeXde::for_volume_id(self.geo.volume_id);
        if self.read_only() {
            return Ok(volume);
        }
        self.create_entries(root, &[volume.to_record().to_raw()], 0)?;
        log::debug!("created volume XDE record");
        Ok(volume)
    }

    fn find_volume_xde(&self, root: &DirRef<'_>) -> FsResult<Option<VolumeXde>> {
        let mut offset = 0;
        while let Some(pos) = self.record_pos(root, offset)? {
            match Record::classify(&self.read_record(pos)?) {
                Record::End => break,
                Record::VolumeXde(record) if record.checksum_matches(0) => {
                    return Ok(Some(VolumeXde::from_record(&record)));
                }
                _ => {}
            }
            offset += RECORD_SIZE;
        }
        Ok(None)
    }

    /// Mount without XDE: counts XDE-marked entries in the root directory.
    /// Best effort; scan errors only produce a warning.
    pub(crate) fn count_marked_entries(&self, root: &DirRef<'_>) -> u32 {
        let mut marked = 0;
        let mut offset = 0;
        loop {
            match self.read_dir(root, offset, ReadDirFlags::SKIP_VOLUME_LABEL) {
                Ok(Some((entry, next))) => {
                    if entry.entry.nt_res().contains(NtRes::XDE) {
                        marked += 1;
                    }
                    offset = next;
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("could not scan the root directory for XDE entries: {err}");
                    break;
                }
            }
        }
        marked
    }
}

fn is_free_slot(raw: &RawRecord) -> bool {
    raw[0] == END_MARKER || raw[0] == FREE_MARKER
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::string::String;

    use crate::ctx::testing::Fixture;
    use crate::node::NodeKind;
    use crate::MountFlags;

    fn xde_flags() -> MountFlags {
        MountFlags::LOG_PARTIAL | MountFlags::FAT_MIRROR | MountFlags::XDE
    }

    fn file(name: &[u8; 11], attr: Attributes) -> ShortEntry {
        ShortEntry::new(*name, attr)
    }

    #[test]
    fn manufactured_defaults() {
        let volume = VolumeXde {
            uid: 1000,
            gid: 100,
            ..VolumeXde::default()
        };
        let perm = |entry: ShortEntry| default_info(&volume, &entry).perm.mode();

        assert_eq!(perm(file(b"BOOT    LOG", Attributes::SYSTEM)), 0o400);
        assert_eq!(perm(file(b"CRASH   DBG", Attributes::SYSTEM)), 0o640);
        assert_eq!(perm(file(b"PLAIN   LOG", Attributes::ARCHIVE)), 0o644);
        assert_eq!(perm(file(b"FROZEN  TXT", Attributes::READ_ONLY)), 0o555);
        assert_eq!(perm(file(b"SUBDIR     ", Attributes::DIRECTORY)), 0o755);

        let info = default_info(&volume, &file(b"A          ", Attributes::ARCHIVE));
        assert_eq!((info.uid, info.gid), (1000, 100));
        assert_eq!(
            Protection::of(&file(b"BOOT    LOG", Attributes::SYSTEM)),
            Protection::LogFile
        );
    }

    #[test]
    fn volume_guid_is_stable() {
        let a = VolumeXde::for_volume_id(0x1234_5678);
        assert_eq!(a, VolumeXde::for_volume_id(0x1234_5678));
        assert_ne!(a.guid, VolumeXde::for_volume_id(0x1234_5679).guid);
        assert_eq!(VolumeXde::from_record(&a.to_record()), a);
    }

    #[test]
    fn checksum_mismatch_reads_as_default() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(xde_flags());
        let pal = PalCache::new();
        let root = DirRef {
            first_cluster: fixture.geo.root_cluster,
            pal: &pal,
        };

        let mut entry = file(b"DATA    BIN", Attributes::ARCHIVE);
        entry.set_nt_res(NtRes::XDE);
        let wrong = ShortName(entry.name).checksum().wrapping_add(3);
        let record = XdeRecord::for_file(7, 8, 0o600, wrong).to_raw();
        let after = file(b"NEXT       ", Attributes::ARCHIVE).to_raw();
        ctx.create_entries(&root, &[entry.to_raw(), record, after], 0)
            .unwrap();

        let (found, next) = ctx.read_dir(&root, 0, ReadDirFlags::empty()).unwrap().unwrap();
        assert_eq!(found.name, "DATA.BIN");
        assert!(!found.has_xde);
        assert_eq!(found.xde, default_info(&fixture.volume_xde, &entry));
        assert_eq!(found.location.records, 2);
        assert_eq!(next, 2 * RECORD_SIZE);
        assert_eq!(Counters::get(&fixture.counters.xde_checksum_mismatches), 1);

        // The record is not mistaken for a long name of the next entry.
        let (second, _) = ctx.read_dir(&root, next, ReadDirFlags::empty()).unwrap().unwrap();
        assert_eq!(second.name, "NEXT");
    }

    fn node_for(entry: &RawDirEntry, ctx: &VolumeCtx<'_, crate::RamDisk>) -> Node {
        Node::from_entry(
            entry.name.clone(),
            &entry.entry,
            entry.location,
            entry.xde,
            ctx.geo.fat_type,
        )
    }

    #[test]
    fn update_in_place_and_by_relocation() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(xde_flags());
        let pal = PalCache::new();
        let root = DirRef {
            first_cluster: fixture.geo.root_cluster,
            pal: &pal,
        };

        // `FIRST` is boxed in by `SECOND`; `SECOND` has a free slot after it.
        let first = file(b"FIRST      ", Attributes::ARCHIVE).to_raw();
        let second = file(b"SECOND     ", Attributes::ARCHIVE).to_raw();
        ctx.create_entries(&root, &[first], 0).unwrap();
        ctx.create_entries(&root, &[second], 0).unwrap();

        let info = XdeInfo::new(1000, 1000, Permissions::from_mode(0o444));
        let found = ctx.lookup(&root, "SECOND").unwrap().unwrap();
        let mut node = node_for(&found, &ctx);
        assert_eq!(ctx.update_xde(&mut node, info).unwrap(), None);
        assert!(node.attr.contains(Attributes::READ_ONLY));
        let reread = ctx.lookup(&root, "SECOND").unwrap().unwrap();
        assert!(reread.has_xde);
        assert_eq!(reread.xde, info);
        assert_eq!(reread.location.stream_offset, RECORD_SIZE);

        let found = ctx.lookup(&root, "FIRST").unwrap().unwrap();
        let mut node = node_for(&found, &ctx);
        let writable = XdeInfo::new(5, 6, Permissions::from_mode(0o640));
        let moved = ctx.update_xde(&mut node, writable).unwrap();
        assert!(moved.is_some());
        let reread = ctx.lookup(&root, "FIRST").unwrap().unwrap();
        assert_eq!(reread.xde, writable);
        assert_eq!(Some(reread.location), node.location);
        assert!(!reread.entry.attributes().contains(Attributes::READ_ONLY));

        // Updating again reuses the record slot.
        let again = XdeInfo::new(5, 6, Permissions::from_mode(0o600));
        assert_eq!(ctx.update_xde(&mut node, again).unwrap(), None);
        assert_eq!(ctx.lookup(&root, "FIRST").unwrap().unwrap().xde, again);

        let mut names = Vec::new();
        let mut offset = 0;
        while let Some((entry, next)) = ctx.read_dir(&root, offset, ReadDirFlags::empty()).unwrap() {
            names.push(entry.name);
            offset = next;
        }
        assert_eq!(names, [String::from("SECOND"), String::from("FIRST")]);
    }

    #[test]
    fn update_is_refused_or_deferred() {
        let fixture = Fixture::fat32();
        let pal = PalCache::new();
        let root = DirRef {
            first_cluster: fixture.geo.root_cluster,
            pal: &pal,
        };
        let plain = fixture.ctx(MountFlags::LOG_PARTIAL | MountFlags::FAT_MIRROR);
        plain
            .create_entries(&root, &[file(b"BOOT    LOG", Attributes::SYSTEM).to_raw()], 0)
            .unwrap();
        plain
            .create_entries(&root, &[file(b"PLAIN      ", Attributes::ARCHIVE).to_raw()], 0)
            .unwrap();
        let info = XdeInfo::new(1, 1, Permissions::from_mode(0o777));

        let ctx = fixture.ctx(xde_flags());
        let log_file = ctx.lookup(&root, "BOOT.LOG").unwrap().unwrap();
        let mut node = node_for(&log_file, &ctx);
        assert_eq!(ctx.update_xde(&mut node, info).unwrap_err(), FsError::Access);

        let read_only = fixture.ctx(MountFlags::READ_ONLY | MountFlags::LOG_OFF | MountFlags::XDE);
        assert_eq!(read_only.update_xde(&mut node, info).unwrap_err(), FsError::ReadOnly);

        // Without XDE the change only lives on the node.
        let entry = plain.lookup(&root, "PLAIN").unwrap().unwrap();
        let mut node = node_for(&entry, &plain);
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(plain.update_xde(&mut node, info).unwrap(), None);
        assert!(node.flags.contains(NodeFlags::XDE_PENDING));
        assert_eq!(node.xde, info);
        assert!(!plain.lookup(&root, "PLAIN").unwrap().unwrap().has_xde);
    }

    #[test]
    fn volume_record_is_created_once() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(xde_flags());
        let pal = PalCache::new();
        let root = DirRef {
            first_cluster: fixture.geo.root_cluster,
            pal: &pal,
        };

        let created = ctx.mount_xde(&root).unwrap();
        assert_eq!(created, VolumeXde::for_volume_id(fixture.geo.volume_id));
        assert_eq!(ctx.mount_xde(&root).unwrap(), created);
        // The record is invisible to scans.
        assert!(ctx.is_empty(&root, true).unwrap());

        let mut entry = file(b"MARKED     ", Attributes::ARCHIVE);
        let record = xde_create(&ctx, &mut entry, &created.file_default()).unwrap();
        ctx.create_entries(&root, &[entry.to_raw(), record], 0).unwrap();
        let plain = fixture.ctx(MountFlags::LOG_PARTIAL | MountFlags::FAT_MIRROR);
        assert_eq!(plain.count_marked_entries(&root), 1);
        assert!(xde_create(&plain, &mut file(b"X          ", Attributes::ARCHIVE), &created.file_default()).is_none());
    }
}
