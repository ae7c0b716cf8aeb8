//! Directory entry engine: walks a directory's record stream, turns record
//! runs into entries, and writes new runs.
//!
//! A directory is a linear stream of 32-byte records. Stream offsets map to
//! clusters through the chain (or straight into the fixed FAT16 root
//! region). A DE is zero or more long-name records, one SFNE, and, when the
//! SFNE carries the XDE marker, one XDE record.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;
use zerocopy::AsBytes;

use crate::allocator::AllocFlags;
use crate::ctx::{Counters, VolumeCtx};
use crate::dirent::{
    Attributes, NtRes, RawRecord, Record, ShortEntry, END_MARKER, FREE_MARKER, RECORD_SIZE,
};
use crate::name::{label_string, LfnAccumulator, LongName, ShortName};
use crate::node::{DeLocation, DePos, DirRef, PalCache};
use crate::vc::VectoredCluster;
use crate::xde::{self, XdeInfo};
use crate::{BlockDevice, FsError, FsResult, Geometry};

/// Stream offset of the first entry after "." and "..".
pub(crate) const FIRST_ENTRY_OFFSET: u32 = 2 * RECORD_SIZE;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct ReadDirFlags: u8 {
        const SKIP_VOLUME_LABEL = 1 << 0;
    }
}

/// One parsed DE.
#[derive(Debug, Clone)]
pub(crate) struct RawDirEntry {
    /// Long name when valid, else the short name.
    pub(crate) name: String,
    pub(crate) short_name: ShortName,
    pub(crate) entry: ShortEntry,
    pub(crate) location: DeLocation,
    /// From the XDE record, or the default for this entry.
    pub(crate) xde: XdeInfo,
    /// A valid XDE record was read.
    pub(crate) has_xde: bool,
}

impl RawDirEntry {
    pub(crate) fn is_dir(&self) -> bool {
        self.entry.attributes().contains(Attributes::DIRECTORY)
    }

    pub(crate) fn is_label(&self) -> bool {
        self.entry.attributes().contains(Attributes::VOLUME_ID)
    }
}

/// Device offset of a record slot.
pub(crate) fn pos_offset(geo: &Geometry, pos: DePos) -> u64 {
    if pos.cluster == 0 {
        geo.root_offset + u64::from(pos.offset)
    } else {
        geo.cluster_offset(pos.cluster) + u64::from(pos.offset)
    }
}

impl<D: BlockDevice> VolumeCtx<'_, D> {
    /// The slot at stream offset `offset`, or `None` past the end of the
    /// directory.
    pub(crate) fn record_pos(&self, dir: &DirRef<'_>, offset: u32) -> FsResult<Option<DePos>> {
        if dir.first_cluster == 0 {
            return Ok((offset < self.geo.root_size).then_some(DePos { cluster: 0, offset }));
        }
        let mask = self.geo.cluster_size - 1;
        Ok(self
            .cluster_of_offset(dir.first_cluster, dir.pal, u64::from(offset))?
            .map(|cluster| DePos {
                cluster,
                offset: offset & mask,
            }))
    }

    pub(crate) fn read_record(&self, pos: DePos) -> FsResult<RawRecord> {
        let mut raw = [0; RECORD_SIZE as usize];
        self.device.read_at(pos_offset(self.geo, pos), &mut raw)?;
        Ok(raw)
    }

    pub(crate) fn write_record(&self, pos: DePos, raw: &RawRecord) -> FsResult<()> {
        self.device.write_at(pos_offset(self.geo, pos), raw)
    }

    /// Slots of every record of `location`, in stream order.
    pub(crate) fn record_positions(&self, location: &DeLocation) -> FsResult<Vec<DePos>> {
        let pal = PalCache::new();
        let dir = DirRef {
            first_cluster: location.dir_cluster,
            pal: &pal,
        };
        (0..u32::from(location.records))
            .map(|i| {
                self.record_pos(&dir, location.stream_offset + i * RECORD_SIZE)?
                    .ok_or(FsError::Corrupt)
            })
            .collect()
    }

    /// Reads the next DE at or after `offset`. Returns the entry and the
    /// offset just past it, or `None` at the end of the directory.
    pub(crate) fn read_dir(
        &self,
        dir: &DirRef<'_>,
        offset: u32,
        flags: ReadDirFlags,
    ) -> FsResult<Option<(RawDirEntry, u32)>> {
        let mut lfn = LfnAccumulator::new();
        let mut run_start: Option<(u32, DePos)> = None;
        let mut cursor = offset;

        loop {
            let Some(pos) = self.record_pos(dir, cursor)? else {
                return Ok(None);
            };
            let raw = self.read_record(pos)?;
            let here = cursor;
            cursor += RECORD_SIZE;

            let entry = match Record::classify(&raw) {
                Record::End => return Ok(None),
                Record::Long(long) => {
                    if lfn.push(&long) {
                        if long.is_last() {
                            run_start = Some((here, pos));
                        }
                    } else {
                        run_start = None;
                    }
                    continue;
                }
                Record::Xde(_) => {
                    // Its SFNE was not part of this step: a create or rename
                    // raced the scan, or the SFNE is gone.
                    Counters::bump(&self.counters.orphan_xde_skips);
                    log::warn!("skipping orphan XDE record at directory offset {here:#x}");
                    lfn.reset();
                    run_start = None;
                    continue;
                }
                Record::Free | Record::Foreign | Record::VolumeXde(_) => {
                    lfn.reset();
                    run_start = None;
                    continue;
                }
                Record::Short(entry) => entry,
            };

            let short_name = ShortName(entry.name);
            if entry.attributes().contains(Attributes::VOLUME_ID) {
                lfn.reset();
                run_start = None;
                if flags.contains(ReadDirFlags::SKIP_VOLUME_LABEL) {
                    continue;
                }
                let location = single_location(dir.first_cluster, here, pos);
                let found = RawDirEntry {
                    name: label_string(&entry.name),
                    short_name,
                    entry,
                    location,
                    xde: XdeInfo::new(0, 0, crate::Permissions::empty()),
                    has_xde: false,
                };
                return Ok(Some((found, cursor)));
            }

            let checksum = short_name.checksum();
            let long_records = lfn.records();
            let (name, start) = match lfn.finish(checksum) {
                LongName::Valid(name) => match run_start {
                    Some(start) => (name, start),
                    None => (name, (here, pos)),
                },
                LongName::Absent => (short_name.display_name(), (here, pos)),
                LongName::Discarded => {
                    Counters::bump(&self.counters.lfn_discards);
                    log::warn!(
                        "long name before {:?} does not match its checksum; using the short name",
                        short_name
                    );
                    (short_name.display_name(), (here, pos))
                }
            };
            let long_records = if start.0 == here { 0 } else { long_records };

            let mut location = DeLocation {
                dir_cluster: dir.first_cluster,
                stream_offset: start.0,
                start: start.1,
                sfne: pos,
                end: pos,
                records: long_records + 1,
                long_records,
            };

            let mut info = None;
            if entry.nt_res().contains(NtRes::XDE) {
                if let Some(xde_pos) = self.record_pos(dir, cursor)? {
                    if let Record::Xde(record) = Record::classify(&self.read_record(xde_pos)?) {
                        cursor += RECORD_SIZE;
                        location.end = xde_pos;
                        location.records += 1;
                        info = xde::xde_lookup(self, &record, checksum);
                    }
                }
            }

            let has_xde = info.is_some();
            let xde = info.unwrap_or_else(|| xde::default_info(self.volume_xde, &entry));
            let found = RawDirEntry {
                name,
                short_name,
                entry,
                location,
                xde,
                has_xde,
            };
            return Ok(Some((found, cursor)));
        }
    }

    /// Whether `dir` holds nothing but "." and "..". The root has neither,
    /// so its scan starts at 0.
    pub(crate) fn is_empty(&self, dir: &DirRef<'_>, is_root: bool) -> FsResult<bool> {
        let start = if is_root { 0 } else { FIRST_ENTRY_OFFSET };
        Ok(self
            .read_dir(dir, start, ReadDirFlags::SKIP_VOLUME_LABEL)?
            .is_none())
    }

    /// Finds the entry called `name`, matching either its long or short
    /// name through the volume's name comparison.
    pub(crate) fn lookup(&self, dir: &DirRef<'_>, name: &str) -> FsResult<Option<RawDirEntry>> {
        let mut offset = 0;
        while let Some((entry, next)) = self.read_dir(dir, offset, ReadDirFlags::SKIP_VOLUME_LABEL)? {
            offset = next;
            if entry.short_name.is_dot_entry() {
                continue;
            }
            if self.names.eq(name, &entry.name)
                || self.names.eq(name, &entry.short_name.display_name())
            {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// A short name for `long` that no entry of `dir` uses. The second value
    /// is whether long-name records must accompany it.
    pub(crate) fn short_name_for(
        &self,
        dir: &DirRef<'_>,
        long: &str,
    ) -> FsResult<(ShortName, bool)> {
        if let Some(exact) = ShortName::parse_exact(long) {
            return Ok((exact, false));
        }

        let mut taken = Vec::new();
        let mut offset = 0;
        while let Some((entry, next)) = self.read_dir(dir, offset, ReadDirFlags::empty())? {
            taken.push(entry.short_name);
            offset = next;
        }

        let basis = ShortName::basis(long);
        (1..=999_999)
            .map(|n| basis.with_tail(n))
            .find(|candidate| !taken.contains(candidate))
            .map(|name| (name, true))
            .ok_or(FsError::Exists)
    }

    /// Looks for `count` consecutive free slots.
    fn find_free_run(&self, dir: &DirRef<'_>, count: u32) -> FsResult<FreeRun> {
        let mut offset = 0;
        let mut run_start = 0;
        let mut run_len = 0;
        while let Some(pos) = self.record_pos(dir, offset)? {
            let raw = self.read_record(pos)?;
            if raw[0] == END_MARKER || raw[0] == FREE_MARKER {
                if run_len == 0 {
                    run_start = offset;
                }
                run_len += 1;
                if run_len == count {
                    return Ok(FreeRun::Found(run_start));
                }
            } else {
                run_len = 0;
            }
            offset += RECORD_SIZE;
        }

        Ok(FreeRun::Short {
            start: if run_len > 0 { run_start } else { offset },
            len: run_len,
        })
    }

    /// Writes a new DE into `dir`, growing the directory when no run of
    /// free slots is long enough. `records` holds the long-name records,
    /// the SFNE, and optionally an XDE record, in stream order.
    ///
    /// N.B. the SFNE is written last: until then the DE does not exist for
    /// a reader.
    pub(crate) fn create_entries(
        &self,
        dir: &DirRef<'_>,
        records: &[RawRecord],
        long_records: u8,
    ) -> FsResult<DeLocation> {
        let count = records.len() as u32;
        let start = match self.find_free_run(dir, count)? {
            FreeRun::Found(start) => start,
            FreeRun::Short { start, len } => {
                if dir.first_cluster == 0 {
                    log::debug!("fixed root directory is full");
                    return Err(FsError::NoSpace);
                }
                let missing = (count - len) * RECORD_SIZE;
                self.expand(dir, missing.div_ceil(self.geo.cluster_size), 0)?;
                start
            }
        };

        let mut positions = Vec::with_capacity(records.len());
        for i in 0..count {
            let pos = self
                .record_pos(dir, start + i * RECORD_SIZE)?
                .ok_or(FsError::Corrupt)?;
            positions.push(pos);
        }

        let sfne = usize::from(long_records);
        let written = positions
            .iter()
            .zip(records)
            .enumerate()
            .filter(|&(i, _)| i != sfne)
            .try_for_each(|(_, (pos, raw))| self.write_record(*pos, raw))
            .and_then(|()| self.write_record(positions[sfne], &records[sfne]));
        if let Err(err) = written {
            // Without its SFNE nothing was visible; drop the stray records.
            for pos in &positions {
                if let Err(undo) = self.device.write_at(pos_offset(self.geo, *pos), &[FREE_MARKER]) {
                    log::warn!("could not clear record at {pos:?}: {undo}");
                }
            }
            return Err(err);
        }
        self.sync_meta()?;

        Ok(DeLocation {
            dir_cluster: dir.first_cluster,
            stream_offset: start,
            start: positions[0],
            sfne: positions[sfne],
            end: positions[positions.len() - 1],
            records: count as u8,
            long_records,
        })
    }

    /// Marks every record of the DE free, SFNE first so the entry vanishes
    /// before its long name does.
    pub(crate) fn mark_free(&self, location: &DeLocation) -> FsResult<()> {
        let positions = self.record_positions(location)?;
        let sfne = usize::from(location.long_records);
        let order = core::iter::once(sfne).chain((0..positions.len()).filter(|&i| i != sfne));
        for i in order {
            self.device
                .write_at(pos_offset(self.geo, positions[i]), &[FREE_MARKER])?;
        }
        self.sync_meta()
    }

    /// Grows `dir` by `requested` clusters. Clusters already chained after
    /// `last_known` count towards the request; the rest are allocated
    /// zero-filled. Returns the newly allocated clusters.
    pub(crate) fn expand(
        &self,
        dir: &DirRef<'_>,
        requested: u32,
        last_known: u32,
    ) -> FsResult<VectoredCluster> {
        if dir.first_cluster == 0 {
            return Err(FsError::NoSpace);
        }
        if requested == 0 {
            return Ok(VectoredCluster::new());
        }
        self.check_writable()?;
        if self.logging() {
            self.log
                .before_expand_directory(dir.first_cluster, requested)?;
        }

        let (_, last) = self.last_cluster(dir.first_cluster, dir.pal)?;
        let reused = if last_known == 0 || last_known == last {
            0
        } else {
            self.chain_length(last_known)? - 1
        };

        let fresh = requested.saturating_sub(reused);
        let vc = if fresh > 0 {
            self.allocate_cluster(last, fresh, AllocFlags::ZERO_FILL | AllocFlags::DIRECTORY)?
        } else {
            VectoredCluster::new()
        };
        log::debug!(
            "expanded directory {} by {} clusters ({reused} reused)",
            dir.first_cluster,
            vc.total()
        );
        Ok(vc)
    }

    /// Zero-fills a new directory cluster and writes its "." and ".."
    /// entries. `parent` is 0 when the parent is the root.
    pub(crate) fn init_cluster(&self, cluster: u32, parent: u32) -> FsResult<()> {
        let mut vc = VectoredCluster::new();
        vc.push(cluster);
        self.zero_clusters(&vc)?;

        let fat_type = self.geo.fat_type;
        let mut dot = ShortEntry::new(ShortName::DOT.0, Attributes::DIRECTORY);
        dot.set_first_cluster(cluster, fat_type);
        let mut dotdot = ShortEntry::new(ShortName::DOTDOT.0, Attributes::DIRECTORY);
        dotdot.set_first_cluster(parent, fat_type);

        let base = self.geo.cluster_offset(cluster);
        self.device.write_at(base, dot.as_bytes())?;
        self.device
            .write_at(base + u64::from(RECORD_SIZE), dotdot.as_bytes())?;
        Ok(())
    }

    /// The cluster a directory's ".." entry points at (0 for the root).
    pub(crate) fn parent_cluster(&self, dir_cluster: u32) -> FsResult<u32> {
        let raw = self.read_record(DePos {
            cluster: dir_cluster,
            offset: RECORD_SIZE,
        })?;
        match Record::classify(&raw) {
            Record::Short(entry) if ShortName(entry.name) == ShortName::DOTDOT => {
                Ok(entry.first_cluster(self.geo.fat_type))
            }
            _ => {
                log::error!("directory {dir_cluster} has no \"..\" entry");
                Err(FsError::Corrupt)
            }
        }
    }

    /// Reads every record of `location`, to put them back with
    /// `restore_records` if a later step fails.
    pub(crate) fn save_records(&self, location: &DeLocation) -> FsResult<Vec<(DePos, RawRecord)>> {
        self.record_positions(location)?
            .into_iter()
            .map(|pos| Ok((pos, self.read_record(pos)?)))
            .collect()
    }

    /// Writes saved records back, SFNE last. Best effort: failures are
    /// logged and the first one is returned after every record was tried.
    pub(crate) fn restore_records(
        &self,
        saved: &[(DePos, RawRecord)],
        location: &DeLocation,
    ) -> FsResult<()> {
        let sfne = usize::from(location.long_records);
        let order = (0..saved.len()).filter(|&i| i != sfne).chain(core::iter::once(sfne));
        let mut result = Ok(());
        for (pos, raw) in order.filter_map(|i| saved.get(i)) {
            if let Err(err) = self.write_record(*pos, raw) {
                log::error!("could not restore directory record at {pos:?}: {err}");
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Points the ".." entry of `dir_cluster` at `parent`.
    pub(crate) fn set_parent_cluster(&self, dir_cluster: u32, parent: u32) -> FsResult<()> {
        let pos = DePos {
            cluster: dir_cluster,
            offset: RECORD_SIZE,
        };
        let mut entry: ShortEntry = zerocopy::transmute!(self.read_record(pos)?);
        entry.set_first_cluster(parent, self.geo.fat_type);
        self.write_record(pos, &entry.to_raw())
    }
}

enum FreeRun {
    Found(u32),
    /// Not enough room; a run of `len` free slots reaches the end of the
    /// stream at `start` (`len` may be 0).
    Short { start: u32, len: u32 },
}

fn single_location(dir_cluster: u32, offset: u32, pos: DePos) -> DeLocation {
    DeLocation {
        dir_cluster,
        stream_offset: offset,
        start: pos,
        sfne: pos,
        end: pos,
        records: 1,
        long_records: 0,
    }
}
