//! File contents: reads and writes through the cluster chain, growing and
//! shrinking it through the allocator.

use crate::allocator::AllocFlags;
use crate::ctx::VolumeCtx;
use crate::dirent::{Attributes, ShortEntry};
use crate::node::Node;
use crate::vc::VectoredCluster;
use crate::{BlockDevice, FsError, FsResult, MountFlags};

/// Largest file FAT can describe.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

impl<D: BlockDevice> VolumeCtx<'_, D> {
    /// Calls `f(device_offset, start, len)` for each contiguous device span
    /// backing bytes `offset..offset + len` of the node's chain, where
    /// `start` is the position within the requested range.
    fn for_each_span<F>(&self, node: &Node, offset: u64, len: usize, mut f: F) -> FsResult<()>
    where
        F: FnMut(u64, usize, usize) -> FsResult<()>,
    {
        if len == 0 {
            return Ok(());
        }
        let shift = self.geo.cluster_shift;
        let first_index = offset >> shift;
        let last_index = (offset + len as u64 - 1) >> shift;
        let count = (last_index - first_index + 1) as u32;

        let vc = self.vectored_cluster(node.first_cluster, &node.pal, offset, count)?;
        if vc.total() < count {
            log::error!(
                "chain from {} holds {} of {count} clusters needed at offset {offset}",
                node.first_cluster,
                vc.total()
            );
            return Err(FsError::Corrupt);
        }

        let mut done = 0;
        let mut in_cluster = offset & (u64::from(self.geo.cluster_size) - 1);
        for run in vc.runs() {
            let run_bytes = (u64::from(run.len) << shift) - in_cluster;
            let span = run_bytes.min((len - done) as u64) as usize;
            f(self.geo.cluster_offset(run.start) + in_cluster, done, span)?;
            done += span;
            in_cluster = 0;
            if done == len {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn read_file(&self, node: &Node, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        if node.is_dir() {
            return Err(FsError::IsDir);
        }
        let size = u64::from(node.size);
        if offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        self.for_each_span(node, offset, len, |device_offset, start, span| {
            self.device
                .read_at(device_offset, &mut buf[start..start + span])
        })?;
        Ok(len)
    }

    /// Writes `data` at `offset`, allocating clusters as needed. A gap
    /// between the old end of file and `offset` reads back as zeros.
    pub(crate) fn write_file(&self, node: &mut Node, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.check_writable()?;
        if node.is_dir() {
            return Err(FsError::IsDir);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or(FsError::Invalid)?;

        let (prev_last, added) = self.reserve(node, end)?;
        if let Err(err) = self.write_data(node, offset, data) {
            self.release_reserved(node, prev_last, &added);
            return Err(err);
        }

        node.size = node.size.max(end as u32);
        node.attr |= Attributes::ARCHIVE;
        self.update_sfne(node)?;
        if self.flags.contains(MountFlags::SYNC_DATA) {
            self.device.flush()?;
        }
        Ok(data.len())
    }

    fn write_data(&self, node: &Node, offset: u64, data: &[u8]) -> FsResult<()> {
        let size = u64::from(node.size);
        if offset > size {
            self.zero_file_range(node, size, offset)?;
        }
        if self.full_logging() {
            self.log
                .before_write_data(node.first_cluster, offset, data.len())?;
        }
        self.for_each_span(node, offset, data.len(), |device_offset, start, span| {
            self.device
                .write_at(device_offset, &data[start..start + span])
        })
    }

    /// Makes the chain long enough to hold `end` bytes. Returns the old
    /// last cluster (0 for an empty file) and the clusters added.
    fn reserve(&self, node: &mut Node, end: u64) -> FsResult<(u32, VectoredCluster)> {
        let needed = self.geo.clusters_for(end) as u32;
        let (have, last) = if node.first_cluster == 0 {
            (0, 0)
        } else {
            let (index, last) = self.last_cluster(node.first_cluster, &node.pal)?;
            (index + 1, last)
        };
        if needed <= have {
            return Ok((last, VectoredCluster::new()));
        }

        let added = self.allocate_cluster(last, needed - have, AllocFlags::empty())?;
        if node.first_cluster == 0 {
            if let Some(first) = added.first() {
                node.first_cluster = first;
                node.pal.clear();
            }
        }
        Ok((last, added))
    }

    /// Undoes `reserve` after a failed data write.
    fn release_reserved(&self, node: &mut Node, prev_last: u32, added: &VectoredCluster) {
        if added.is_empty() {
            return;
        }
        if prev_last == 0 {
            node.first_cluster = 0;
        }
        node.pal.clear();
        if let Err(err) = self.deallocate_cluster(prev_last, 0, 0, Some(added), AllocFlags::empty()) {
            log::warn!("could not release clusters after a failed write: {err}");
        }
    }

    /// Zeros bytes `from..to` of the file's existing clusters.
    fn zero_file_range(&self, node: &Node, from: u64, to: u64) -> FsResult<()> {
        let allocated = if node.first_cluster == 0 {
            0
        } else {
            let (index, _) = self.last_cluster(node.first_cluster, &node.pal)?;
            u64::from(index + 1) << self.geo.cluster_shift
        };
        let to = to.min(allocated);
        if from >= to {
            return Ok(());
        }
        self.for_each_span(node, from, (to - from) as usize, |device_offset, _, span| {
            crate::format::zero_range(self.device, device_offset, span as u64)
        })
    }

    /// Sets the file size to `size`, freeing clusters past it or adding
    /// zero-filled ones.
    pub(crate) fn truncate_file(&self, node: &mut Node, size: u64) -> FsResult<()> {
        self.check_writable()?;
        if node.is_dir() {
            return Err(FsError::IsDir);
        }
        if size > MAX_FILE_SIZE {
            return Err(FsError::Invalid);
        }
        let old = u64::from(node.size);

        if size < old {
            let keep = self.geo.clusters_for(size) as u32;
            if keep == 0 {
                if node.first_cluster != 0 {
                    self.deallocate_cluster(0, node.first_cluster, 0, None, AllocFlags::empty())?;
                    node.first_cluster = 0;
                }
            } else {
                let last_offset = u64::from(keep - 1) << self.geo.cluster_shift;
                let last = self
                    .cluster_of_offset(node.first_cluster, &node.pal, last_offset)?
                    .ok_or(FsError::Corrupt)?;
                if let Some(next) = self.fat().next(last)? {
                    self.deallocate_cluster(last, next, 0, None, AllocFlags::empty())?;
                }
            }
            node.pal.clear();
        } else if size > old {
            self.reserve(node, size)?;
            self.zero_file_range(node, old, size)?;
        }

        node.size = size as u32;
        node.attr |= Attributes::ARCHIVE;
        self.update_sfne(node)
    }

    /// Writes the node's size, first cluster, and attributes back into its
    /// SFNE.
    pub(crate) fn update_sfne(&self, node: &Node) -> FsResult<()> {
        let Some(location) = node.location else {
            return Ok(());
        };
        let _namespace = self.namespace.lock();
        let mut entry: ShortEntry = zerocopy::transmute!(self.read_record(location.sfne)?);
        node.apply_to(&mut entry, self.geo.fat_type);
        self.write_record(location.sfne, &entry.to_raw())?;
        self.sync_meta()
    }
}
