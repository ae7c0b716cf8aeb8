use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;
use stack_arena::ArenaSet;

use crate::allocator::FatState;
use crate::fat::FatTable;
use crate::name::NameCompare;
use crate::txlog::TransactionLog;
use crate::vc::VectoredCluster;
use crate::xde::VolumeXde;
use crate::{BlockDevice, FsError, FsResult, Geometry, MountFlags};

/// Name of the arena that backs cluster-sized scratch buffers.
pub(crate) const SCRATCH_ARENA: &str = "scratch";

/// Tolerated on-disk anomalies, reported through `Volume::status`.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) orphan_xde_skips: AtomicU32,
    pub(crate) lfn_discards: AtomicU32,
    pub(crate) xde_checksum_mismatches: AtomicU32,
    /// XDE-marked root entries seen on a mount without XDE.
    pub(crate) xde_marked_entries: AtomicU32,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.orphan_xde_skips.store(0, Ordering::Relaxed);
        self.lfn_discards.store(0, Ordering::Relaxed);
        self.xde_checksum_mismatches.store(0, Ordering::Relaxed);
        self.xde_marked_entries.store(0, Ordering::Relaxed);
    }
}

/// Everything a core operation needs from its volume, borrowed for the
/// duration of one call. Built by `Volume` under its own lock.
pub(crate) struct VolumeCtx<'a, D> {
    pub(crate) device: &'a D,
    pub(crate) geo: &'a Geometry,
    pub(crate) flags: MountFlags,
    pub(crate) log: &'a dyn TransactionLog,
    pub(crate) names: &'a dyn NameCompare,
    pub(crate) fat_state: &'a Mutex<FatState>,
    /// Serializes every change to directory records.
    pub(crate) namespace: &'a Mutex<()>,
    pub(crate) scratch: &'a Mutex<ArenaSet<Box<[u8]>>>,
    pub(crate) counters: &'a Counters,
    pub(crate) volume_xde: &'a VolumeXde,
}

impl<'a, D: BlockDevice> VolumeCtx<'a, D> {
    pub(crate) fn fat(&self) -> FatTable<'a, D> {
        FatTable::new(
            self.device,
            self.geo,
            self.flags.contains(MountFlags::FAT_MIRROR),
        )
    }

    /// Metadata log hooks run unless logging is off.
    pub(crate) fn logging(&self) -> bool {
        !self.flags.contains(MountFlags::LOG_OFF)
    }

    pub(crate) fn full_logging(&self) -> bool {
        self.flags.contains(MountFlags::LOG_FULL)
    }

    pub(crate) fn xde_active(&self) -> bool {
        self.flags.contains(MountFlags::XDE)
    }

    pub(crate) fn read_only(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY)
    }

    pub(crate) fn check_writable(&self) -> FsResult<()> {
        if self.read_only() {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Flushes the device if `SYNC_META` asks for it.
    pub(crate) fn sync_meta(&self) -> FsResult<()> {
        if self.flags.contains(MountFlags::SYNC_META) {
            self.device.flush()?;
        }
        Ok(())
    }

    /// Writes zeros over every cluster of `vc`, through a buffer taken from
    /// the scratch arena.
    pub(crate) fn zero_clusters(&self, vc: &VectoredCluster) -> FsResult<()> {
        let arenas = self.scratch.lock();
        let arena = arenas.get(None).ok_or(FsError::NoMem)?;
        let chunk = (self.geo.cluster_size as usize).min(arena.remaining());
        if chunk == 0 {
            return Err(FsError::NoMem);
        }
        let zeros = arena.try_alloc_zeroed(chunk).ok_or(FsError::NoMem)?;

        for run in vc.runs() {
            let start = self.geo.cluster_offset(run.start);
            let len = u64::from(run.len) << self.geo.cluster_shift;
            let mut done = 0;
            while done < len {
                let count = (len - done).min(chunk as u64) as usize;
                self.device.write_at(start + done, &zeros[..count])?;
                done += count as u64;
            }
        }
        Ok(())
    }
}
