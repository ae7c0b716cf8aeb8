//! Cluster allocator: finds free clusters, links them into chains, frees
//! chains, and keeps the free-cluster counter.
//!
//! An allocation goes `REQUESTED -> PARTIAL` when the volume cannot satisfy
//! it, or `REQUESTED -> LINKED -> COMMITTED`. Any way out of `LINKED` other
//! than `COMMITTED` deallocates what was linked.

use bitflags::bitflags;
use ordered_index::OrderedIndex;

use crate::ctx::VolumeCtx;
use crate::fat::{FatEntry, FatTable};
use crate::node::PalCache;
use crate::vc::{ClusterRun, VectoredCluster, VC_BATCH_RUNS};
use crate::{BlockDevice, FsError, FsResult, Geometry};

/// Freed extents remembered as allocation hints. The oldest (lowest) is
/// dropped when full.
const MAX_FREED_EXTENTS: usize = 64;

/// Free-space bookkeeping of a volume. Only touched inside the allocation
/// critical section (the mutex around it).
#[derive(Debug)]
pub(crate) struct FatState {
    /// Only decremented by `make_cluster_chain` and only incremented by
    /// `release_locked`, the core of `deallocate_cluster` that an unwinding
    /// `allocate_cluster` also goes through.
    pub(crate) free_clusters: u32,
    /// Where the next search without a hint starts.
    pub(crate) next_free: u32,
    /// Recently freed extents, start cluster -> length.
    freed: OrderedIndex<u32>,
    /// The counter changed since FSInfo was last written.
    pub(crate) dirty: bool,
}

impl FatState {
    pub(crate) fn new(free_clusters: u32, next_free: u32) -> Self {
        Self {
            free_clusters,
            next_free,
            freed: OrderedIndex::new(),
            dirty: false,
        }
    }

    pub(crate) fn freed_extents(&self) -> usize {
        self.freed.len()
    }

    fn remember_freed(&mut self, run: ClusterRun) {
        if self.freed.len() >= MAX_FREED_EXTENTS {
            if let Some(oldest) = self.freed.first() {
                self.freed.remove(oldest);
            }
        }
        self.freed.insert(run.start, run.len);
    }

    /// Drops every remembered extent that overlaps `vc`.
    fn forget_allocated(&mut self, vc: &VectoredCluster) {
        for run in vc.runs() {
            let mut id = self.freed.floor(run.end() - 1);
            while let Some(found) = id {
                let start = self.freed.key(found);
                let len = *self.freed.value(found);
                id = self.freed.prev(found);
                if start + len <= run.start {
                    // Extents never overlap each other, so nothing further
                    // left can reach this run either.
                    break;
                }
                self.freed.remove(found);
            }
        }
    }

    /// Where a search should begin: the hint when it is a data cluster,
    /// else the first remembered freed extent at or after the rover, else
    /// the rover itself.
    fn preferred_start(&self, hint: u32, geo: &Geometry) -> u32 {
        if geo.is_data_cluster(hint) {
            return hint;
        }
        let rover = if geo.is_data_cluster(self.next_free) {
            self.next_free
        } else {
            2
        };
        self.freed
            .ceiling(rover)
            .or_else(|| self.freed.first())
            .map_or(rover, |id| self.freed.key(id))
    }
}

/// Why `get_free_clusters` came back short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortfallReason {
    /// Fewer free clusters exist than were requested.
    VolumeFull,
    /// The VC ran out of run slots before it held enough clusters.
    RunsExhausted,
    /// Reading the FAT failed.
    Failed(FsError),
}

/// A partial result: the clusters that were found, and why there are not
/// more.
#[derive(Debug)]
pub struct Shortfall {
    pub vc: VectoredCluster,
    pub reason: ShortfallReason,
}

impl From<Shortfall> for FsError {
    fn from(shortfall: Shortfall) -> Self {
        match shortfall.reason {
            ShortfallReason::Failed(err) => err,
            ShortfallReason::VolumeFull | ShortfallReason::RunsExhausted => Self::NoSpace,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct AllocFlags: u8 {
        /// Zero new clusters before they are linked.
        const ZERO_FILL = 1 << 0;

        /// The chain belongs to a directory. Frees flush the device so a
        /// reused cluster is never read through a stale cache.
        const DIRECTORY = 1 << 1;
    }
}

impl<D: BlockDevice> VolumeCtx<'_, D> {
    /// Collects up to `count` free clusters, starting near `hint` and
    /// wrapping around the end of the volume. Nothing is marked in the FAT.
    pub(crate) fn get_free_clusters(
        &self,
        state: &FatState,
        count: u32,
        hint: u32,
        max_runs: usize,
    ) -> Result<VectoredCluster, Shortfall> {
        let mut vc = VectoredCluster::with_run_limit(max_runs);
        if count == 0 {
            return Ok(vc);
        }

        let start = state.preferred_start(hint, self.geo);
        let table = self.fat();
        let mut exhausted = false;
        for (from, to) in [(start, self.geo.cluster_limit()), (2, start)] {
            if exhausted || vc.total() >= count {
                break;
            }
            let scanned = table.scan_free(from, to, |cluster| {
                if !vc.push(cluster) {
                    exhausted = true;
                    return false;
                }
                vc.total() < count
            });
            if let Err(err) = scanned {
                return Err(Shortfall {
                    vc,
                    reason: ShortfallReason::Failed(err),
                });
            }
        }

        if vc.total() == count {
            Ok(vc)
        } else {
            let reason = if exhausted {
                ShortfallReason::RunsExhausted
            } else {
                ShortfallReason::VolumeFull
            };
            Err(Shortfall { vc, reason })
        }
    }

    /// Links the clusters of `vc` into one chain hanging off `prev_end` (0
    /// starts a new chain). The only place the free counter goes down.
    pub(crate) fn make_cluster_chain(
        &self,
        state: &mut FatState,
        prev_end: u32,
        vc: &VectoredCluster,
    ) -> FsResult<()> {
        let Some(last) = vc.last() else {
            return Ok(());
        };
        if self.logging() {
            self.log.before_make_cluster_chain(prev_end, vc)?;
        }

        let table = self.fat();
        if let Err(err) = link_chain(&table, prev_end, vc) {
            log::error!("linking {} clusters after {prev_end} failed: {err}", vc.total());
            release_quietly(&table, prev_end, vc);
            return Err(err);
        }

        state.free_clusters = state.free_clusters.saturating_sub(vc.total());
        state.next_free = if last + 1 < self.geo.cluster_limit() {
            last + 1
        } else {
            2
        };
        state.forget_allocated(vc);
        state.dirty = true;
        Ok(())
    }

    /// Extends the chain ending at `eoc` (0 for a new chain) by exactly
    /// `count` clusters and returns them. All or nothing: on failure every
    /// cluster linked by this call is freed again.
    pub(crate) fn allocate_cluster(
        &self,
        eoc: u32,
        count: u32,
        flags: AllocFlags,
    ) -> FsResult<VectoredCluster> {
        self.check_writable()?;
        let mut state = self.fat_state.lock();
        if state.free_clusters < count {
            log::debug!(
                "allocation of {count} clusters refused: {} free",
                state.free_clusters
            );
            return Err(FsError::NoSpace);
        }

        let mut all = VectoredCluster::new();
        let mut prev_end = eoc;
        while all.total() < count {
            let hint = if prev_end == 0 { 0 } else { prev_end + 1 };
            let batch = match self.get_free_clusters(&state, count - all.total(), hint, VC_BATCH_RUNS)
            {
                Ok(vc) => vc,
                Err(Shortfall {
                    vc,
                    reason: ShortfallReason::RunsExhausted,
                }) if !vc.is_empty() => vc,
                Err(shortfall) => {
                    log::debug!(
                        "allocation of {count} clusters short: {:?} after {}",
                        shortfall.reason,
                        all.total() + shortfall.vc.total()
                    );
                    self.unwind(&mut state, eoc, &all);
                    return Err(shortfall.into());
                }
            };

            let linked = if flags.contains(AllocFlags::ZERO_FILL) {
                self.zero_clusters(&batch)
            } else {
                Ok(())
            }
            .and_then(|()| self.make_cluster_chain(&mut state, prev_end, &batch));
            if let Err(err) = linked {
                self.unwind(&mut state, eoc, &all);
                return Err(err);
            }

            if let Some(last) = batch.last() {
                prev_end = last;
            }
            all.append(&batch);
        }

        log::debug!(
            "allocated {count} clusters in {} runs after {eoc}",
            all.runs().len()
        );
        drop(state);
        self.sync_meta()?;
        Ok(all)
    }

    /// Compensates a failed `allocate_cluster`: frees what it linked and
    /// restores the old end of chain, inside the critical section it already
    /// holds.
    fn unwind(&self, state: &mut FatState, eoc: u32, linked: &VectoredCluster) {
        if linked.is_empty() {
            return;
        }
        let (freed, result) = self.release_locked(state, eoc, 0, 0, Some(linked));
        if let Err(err) = result {
            log::warn!(
                "unwinding allocation after {eoc} freed {freed} of {} clusters: {err}",
                linked.total()
            );
        }
    }

    /// Frees clusters and returns how many were freed. With `vc`, exactly
    /// those clusters are freed; otherwise the chain is walked from `first`
    /// for `count` clusters (0 meaning to its end). `new_eoc`, when not 0,
    /// becomes the end of the chain that kept its head.
    ///
    /// N.B. the free counter reflects every cluster actually freed, even
    /// when the walk stops on an error.
    pub(crate) fn deallocate_cluster(
        &self,
        new_eoc: u32,
        first: u32,
        count: u32,
        vc: Option<&VectoredCluster>,
        flags: AllocFlags,
    ) -> FsResult<u32> {
        self.check_writable()?;
        let mut state = self.fat_state.lock();
        let (freed, result) = self.release_locked(&mut state, new_eoc, first, count, vc);
        drop(state);

        log::debug!("freed {freed} clusters from {first}");
        result?;
        if flags.contains(AllocFlags::DIRECTORY) {
            self.device.flush()?;
        } else {
            self.sync_meta()?;
        }
        Ok(freed)
    }

    /// Marks clusters free in the FAT and credits them to the counter, with
    /// the allocation critical section held. Returns how many were freed
    /// alongside the outcome, since a failed walk may still have freed some.
    fn release_locked(
        &self,
        state: &mut FatState,
        new_eoc: u32,
        first: u32,
        count: u32,
        vc: Option<&VectoredCluster>,
    ) -> (u32, FsResult<()>) {
        let table = self.fat();
        let mut freed = VectoredCluster::new();

        let result = (|| {
            if new_eoc != 0 {
                table.set(new_eoc, FatEntry::EndOfChain)?;
            }
            match vc {
                Some(vc) => {
                    for cluster in vc.clusters() {
                        table.set(cluster, FatEntry::Free)?;
                        freed.push(cluster);
                    }
                    Ok(())
                }
                None => self.free_chain(&table, first, count, &mut freed),
            }
        })();

        state.free_clusters += freed.total();
        for &run in freed.runs() {
            state.remember_freed(run);
        }
        if !freed.is_empty() {
            state.dirty = true;
        }
        (freed.total(), result)
    }

    fn free_chain(
        &self,
        table: &FatTable<'_, D>,
        first: u32,
        count: u32,
        freed: &mut VectoredCluster,
    ) -> FsResult<()> {
        let mut cluster = first;
        while count == 0 || freed.total() < count {
            if !self.geo.is_data_cluster(cluster) || freed.total() >= self.geo.total_clusters {
                log::error!("chain from {first} leaves the data region at {cluster}");
                return Err(FsError::Corrupt);
            }
            let entry = table.get(cluster)?;
            table.set(cluster, FatEntry::Free)?;
            freed.push(cluster);
            match entry {
                FatEntry::Next(next) => cluster = next,
                FatEntry::EndOfChain => break,
                FatEntry::Free | FatEntry::Bad => {
                    log::error!("chain from {first} runs into {entry:?} at {cluster}");
                    return Err(FsError::Corrupt);
                }
            }
        }
        Ok(())
    }

    /// Number of clusters in the chain starting at `first`.
    pub(crate) fn chain_length(&self, first: u32) -> FsResult<u32> {
        if first == 0 {
            return Ok(0);
        }
        let table = self.fat();
        let mut len = 1;
        let mut cluster = self.checked_cluster(first)?;
        while let Some(next) = table.next(cluster)? {
            len += 1;
            if len > self.geo.total_clusters {
                log::error!("cluster chain from {first} loops");
                return Err(FsError::Corrupt);
            }
            cluster = next;
        }
        Ok(len)
    }

    /// The last cluster of the chain, and its index in the chain.
    pub(crate) fn last_cluster(&self, first: u32, pal: &PalCache) -> FsResult<(u32, u32)> {
        let table = self.fat();
        let (mut index, mut cluster) = match pal.get() {
            Some(cached) => cached,
            None => (0, self.checked_cluster(first)?),
        };
        while let Some(next) = table.next(cluster)? {
            index += 1;
            if index >= self.geo.total_clusters {
                log::error!("cluster chain from {first} loops");
                return Err(FsError::Corrupt);
            }
            cluster = next;
        }
        pal.set(index, cluster);
        Ok((index, cluster))
    }

    /// The cluster holding byte `offset` of the chain starting at `first`,
    /// or `None` when the chain is shorter. Starts from the PAL cache when
    /// it is at or before the target.
    pub(crate) fn cluster_of_offset(
        &self,
        first: u32,
        pal: &PalCache,
        offset: u64,
    ) -> FsResult<Option<u32>> {
        let Ok(target) = u32::try_from(offset >> self.geo.cluster_shift) else {
            return Ok(None);
        };
        let (mut index, mut cluster) = match pal.get() {
            Some((index, cluster)) if index <= target => (index, cluster),
            _ => (0, self.checked_cluster(first)?),
        };

        let table = self.fat();
        while index < target {
            match table.next(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(None),
            }
            index += 1;
            if index >= self.geo.total_clusters {
                log::error!("cluster chain from {first} loops");
                return Err(FsError::Corrupt);
            }
        }
        pal.set(index, cluster);
        Ok(Some(cluster))
    }

    /// Up to `count` clusters of the chain, starting with the one holding
    /// `offset`. The result is shorter when the chain ends first; its cursor
    /// is the chain index of its first cluster.
    pub(crate) fn vectored_cluster(
        &self,
        first: u32,
        pal: &PalCache,
        offset: u64,
        count: u32,
    ) -> FsResult<VectoredCluster> {
        let mut vc = VectoredCluster::new();
        if count == 0 {
            return Ok(vc);
        }
        let Some(mut cluster) = self.cluster_of_offset(first, pal, offset)? else {
            return Ok(vc);
        };
        let start_index = (offset >> self.geo.cluster_shift) as u32;
        vc.set_cursor(start_index);
        vc.push(cluster);

        let table = self.fat();
        while vc.total() < count {
            match table.next(cluster)? {
                Some(next) => {
                    cluster = next;
                    vc.push(cluster);
                }
                None => break,
            }
            if vc.total() > self.geo.total_clusters {
                log::error!("cluster chain from {first} loops");
                return Err(FsError::Corrupt);
            }
        }
        pal.set(start_index + vc.total() - 1, cluster);
        Ok(vc)
    }

    fn checked_cluster(&self, cluster: u32) -> FsResult<u32> {
        if self.geo.is_data_cluster(cluster) {
            Ok(cluster)
        } else {
            log::error!("cluster {cluster} is outside the data region");
            Err(FsError::Corrupt)
        }
    }
}

/// Writes the links of `vc`, tail first, then hangs it off `prev_end`.
fn link_chain<D: BlockDevice>(
    table: &FatTable<'_, D>,
    prev_end: u32,
    vc: &VectoredCluster,
) -> FsResult<()> {
    let mut next = FatEntry::EndOfChain;
    for cluster in vc.clusters().rev() {
        table.set(cluster, next)?;
        next = FatEntry::Next(cluster);
    }
    if prev_end != 0 {
        table.set(prev_end, next)?;
    }
    Ok(())
}

/// Best-effort undo of `link_chain`.
fn release_quietly<D: BlockDevice>(table: &FatTable<'_, D>, prev_end: u32, vc: &VectoredCluster) {
    if prev_end != 0 {
        if let Err(err) = table.set(prev_end, FatEntry::EndOfChain) {
            log::warn!("could not restore end of chain at {prev_end}: {err}");
        }
    }
    for cluster in vc.clusters() {
        if let Err(err) = table.set(cluster, FatEntry::Free) {
            log::warn!("could not release cluster {cluster}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::collections::HashSet;

    use proptest::prelude::*;

    use crate::ctx::testing::Fixture;
    use crate::txlog::testing::RecordingLog;
    use crate::MountFlags;

    fn flags() -> MountFlags {
        MountFlags::LOG_PARTIAL | MountFlags::FAT_MIRROR
    }

    #[test]
    fn get_free_clusters_reports_what_exists() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(flags());
        let free = fixture.free_clusters();

        // Leave exactly six clusters free.
        ctx.allocate_cluster(0, free - 6, AllocFlags::empty()).unwrap();
        assert_eq!(fixture.free_clusters(), 6);

        let state = fixture.fat_state.lock();
        let shortfall = ctx.get_free_clusters(&state, 10, 0, usize::MAX).unwrap_err();
        assert_eq!(shortfall.reason, ShortfallReason::VolumeFull);
        assert_eq!(shortfall.vc.total(), 6);
        assert_eq!(FsError::from(shortfall), FsError::NoSpace);
    }

    #[test]
    fn run_limit_shortfall() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(flags());

        // Free every other cluster of a contiguous chain.
        let vc = ctx.allocate_cluster(0, 20, AllocFlags::empty()).unwrap();
        assert_eq!(vc.runs().len(), 1);
        let mut holes = VectoredCluster::new();
        for cluster in vc.clusters().step_by(2) {
            holes.push(cluster);
        }
        let table = ctx.fat();
        for cluster in holes.clusters() {
            table.set(cluster, FatEntry::Free).unwrap();
        }

        let state = fixture.fat_state.lock();
        let start = vc.first().unwrap();
        let shortfall = ctx.get_free_clusters(&state, 5, start, 3).unwrap_err();
        assert_eq!(shortfall.reason, ShortfallReason::RunsExhausted);
        assert_eq!(shortfall.vc.total(), 3);
        assert_eq!(shortfall.vc.runs().len(), 3);
    }

    #[test]
    fn allocate_links_and_deallocate_restores() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(flags());
        let free = fixture.free_clusters();

        let vc = ctx.allocate_cluster(0, 5, AllocFlags::ZERO_FILL).unwrap();
        assert_eq!(vc.total(), 5);
        assert_eq!(fixture.free_clusters(), free - 5);
        let first = vc.first().unwrap();
        assert_eq!(ctx.chain_length(first).unwrap(), 5);

        // Grow the same chain.
        let more = ctx.allocate_cluster(vc.last().unwrap(), 3, AllocFlags::empty()).unwrap();
        assert_eq!(more.total(), 3);
        assert_eq!(ctx.chain_length(first).unwrap(), 8);

        // Cut it back to two clusters.
        let second = vc.get(1).unwrap();
        let third = vc.get(2).unwrap();
        let freed = ctx
            .deallocate_cluster(second, third, 0, None, AllocFlags::empty())
            .unwrap();
        assert_eq!(freed, 6);
        assert_eq!(ctx.chain_length(first).unwrap(), 2);
        assert_eq!(fixture.free_clusters(), free - 2);
        assert!(fixture.fat_state.lock().freed_extents() > 0);

        ctx.deallocate_cluster(0, first, 0, None, AllocFlags::DIRECTORY)
            .unwrap();
        assert_eq!(fixture.free_clusters(), free);
        assert_eq!(ctx.fat().count_free().unwrap(), free);
    }

    #[test]
    fn freed_extents_are_reused_first() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(flags());

        let a = ctx.allocate_cluster(0, 4, AllocFlags::empty()).unwrap();
        let _b = ctx.allocate_cluster(0, 4, AllocFlags::empty()).unwrap();
        ctx.deallocate_cluster(0, a.first().unwrap(), 0, None, AllocFlags::empty())
            .unwrap();

        // The rover is past `b`; the remembered extent still wins.
        fixture.fat_state.lock().next_free = 2;
        let c = ctx.allocate_cluster(0, 4, AllocFlags::empty()).unwrap();
        assert_eq!(c.first(), a.first());
        assert_eq!(fixture.fat_state.lock().freed_extents(), 0);
    }

    #[test]
    fn log_failure_leaves_volume_untouched() {
        let mut fixture = Fixture::fat32();
        let log = Arc::new(RecordingLog::default());
        *log.fail_on.lock() = Some("make_cluster_chain");
        fixture.log = Box::new(log.clone());
        let ctx = fixture.ctx(flags());
        let free = fixture.free_clusters();

        assert_eq!(
            ctx.allocate_cluster(0, 3, AllocFlags::empty()).unwrap_err(),
            FsError::Io
        );
        assert_eq!(fixture.free_clusters(), free);
        assert_eq!(ctx.fat().count_free().unwrap(), free);

        // With logging off the hook is not consulted.
        let ctx = fixture.ctx(MountFlags::LOG_OFF | MountFlags::FAT_MIRROR);
        ctx.allocate_cluster(0, 3, AllocFlags::empty()).unwrap();
        assert!(log.events.lock().is_empty());
    }

    #[test]
    fn read_only_refuses() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(MountFlags::READ_ONLY | MountFlags::LOG_OFF);
        assert_eq!(
            ctx.allocate_cluster(0, 1, AllocFlags::empty()).unwrap_err(),
            FsError::ReadOnly
        );
    }

    #[test]
    fn offsets_resolve_through_pal() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(flags());
        let vc = ctx.allocate_cluster(0, 6, AllocFlags::empty()).unwrap();
        let first = vc.first().unwrap();
        let size = u64::from(fixture.geo.cluster_size);
        let pal = PalCache::new();

        assert_eq!(ctx.cluster_of_offset(first, &pal, 0).unwrap(), Some(first));
        assert_eq!(
            ctx.cluster_of_offset(first, &pal, 3 * size + 7).unwrap(),
            vc.get(3)
        );
        assert_eq!(pal.get(), Some((3, vc.get(3).unwrap())));
        // Going backwards restarts from the head.
        assert_eq!(ctx.cluster_of_offset(first, &pal, size).unwrap(), vc.get(1));
        assert_eq!(ctx.cluster_of_offset(first, &pal, 6 * size).unwrap(), None);

        let span = ctx.vectored_cluster(first, &pal, 2 * size, 10).unwrap();
        assert_eq!(span.cursor(), 2);
        assert_eq!(span.total(), 4);
        assert_eq!(span.first(), vc.get(2));

        pal.clear();
        assert_eq!(ctx.last_cluster(first, &pal).unwrap(), (5, vc.last().unwrap()));
    }

    #[test]
    fn cycles_are_corruption() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(flags());
        let vc = ctx.allocate_cluster(0, 3, AllocFlags::empty()).unwrap();
        let first = vc.first().unwrap();
        ctx.fat()
            .set(vc.last().unwrap(), FatEntry::Next(first))
            .unwrap();

        assert_eq!(ctx.chain_length(first).unwrap_err(), FsError::Corrupt);
        assert_eq!(
            ctx.last_cluster(first, &PalCache::new()).unwrap_err(),
            FsError::Corrupt
        );
    }

    #[test]
    fn multi_batch_allocation_unwinds_on_write_errors() {
        let fixture = Fixture::fat32();
        let ctx = fixture.ctx(flags());
        let base = ctx.allocate_cluster(0, 2, AllocFlags::empty()).unwrap();
        let first = base.first().unwrap();

        // Single-cluster holes right after the chain, one run each.
        let singles: Vec<VectoredCluster> = (0..40)
            .map(|_| ctx.allocate_cluster(0, 1, AllocFlags::empty()).unwrap())
            .collect();
        for single in singles.iter().step_by(2) {
            ctx.deallocate_cluster(0, single.first().unwrap(), 0, None, AllocFlags::empty())
                .unwrap();
        }
        let free = fixture.free_clusters();

        let mut failures = 0;
        let grown = loop {
            fixture.disk.fail_write_after(failures);
            let result = ctx.allocate_cluster(base.last().unwrap(), 20, AllocFlags::empty());
            fixture.disk.clear_write_fault();
            match result {
                Ok(vc) => break vc,
                Err(err) => assert_eq!(err, FsError::Io),
            }
            failures += 1;

            assert_eq!(fixture.free_clusters(), free);
            assert_eq!(ctx.fat().count_free().unwrap(), free);
            assert_eq!(ctx.chain_length(first).unwrap(), 2);
        };

        assert!(grown.runs().len() > VC_BATCH_RUNS);
        assert!(failures > (VC_BATCH_RUNS + 1) as u64);
        assert_eq!(ctx.chain_length(first).unwrap(), 22);
        assert_eq!(fixture.free_clusters(), free - 20);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32, .. ProptestConfig::default()
        })]

        #[test]
        fn allocations_never_overlap(
            counts in proptest::collection::vec(1_u32..40, 1..12),
            frees in proptest::collection::vec(any::<bool>(), 12),
        ) {
            let fixture = Fixture::fat32();
            let ctx = fixture.ctx(flags());
            let mut live: Vec<VectoredCluster> = Vec::new();

            for (i, &count) in counts.iter().enumerate() {
                let before = fixture.free_clusters();
                let vc = ctx.allocate_cluster(0, count, AllocFlags::empty()).unwrap();
                prop_assert_eq!(vc.total(), count);
                prop_assert_eq!(fixture.free_clusters(), before - count);
                prop_assert_eq!(ctx.chain_length(vc.first().unwrap()).unwrap(), count);
                live.push(vc);

                if frees[i] && live.len() > 1 {
                    let victim = live.remove(0);
                    ctx.deallocate_cluster(0, victim.first().unwrap(), 0, None, AllocFlags::empty())
                        .unwrap();
                }

                let mut seen = HashSet::new();
                for cluster in live.iter().flat_map(VectoredCluster::clusters) {
                    prop_assert!(seen.insert(cluster), "cluster {} handed out twice", cluster);
                }
            }
        }
    }
}
