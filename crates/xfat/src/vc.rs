use alloc::vec::Vec;

/// Default run capacity of the VCs the allocator fills in one pass.
pub const VC_BATCH_RUNS: usize = 16;

/// `len` consecutive clusters starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterRun {
    pub start: u32,
    pub len: u32,
}

impl ClusterRun {
    pub const fn end(&self) -> u32 {
        self.start + self.len
    }

    pub const fn contains(&self, cluster: u32) -> bool {
        cluster >= self.start && cluster < self.end()
    }
}

/// Vectored cluster: an ordered list of cluster runs describing a span of a
/// chain (or a set of free clusters about to become one), with a cached
/// total and a cursor recording which cluster index of the owning chain the
/// first run starts at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectoredCluster {
    runs: Vec<ClusterRun>,
    max_runs: usize,
    total: u32,
    cursor: u32,
}

impl Default for VectoredCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl VectoredCluster {
    /// A VC with no run limit.
    pub fn new() -> Self {
        Self::with_run_limit(usize::MAX)
    }

    pub fn with_run_limit(max_runs: usize) -> Self {
        Self {
            runs: Vec::new(),
            max_runs,
            total: 0,
            cursor: 0,
        }
    }

    pub fn runs(&self) -> &[ClusterRun] {
        &self.runs
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: u32) {
        self.cursor = cursor;
    }

    pub fn first(&self) -> Option<u32> {
        self.runs.first().map(|run| run.start)
    }

    pub fn last(&self) -> Option<u32> {
        self.runs.last().map(|run| run.end() - 1)
    }

    /// Whether the run list is at capacity, so a cluster that does not
    /// extend the last run cannot be added.
    pub fn runs_full(&self) -> bool {
        self.runs.len() >= self.max_runs
    }

    /// Appends one cluster, extending the last run when contiguous. Returns
    /// `false` if a new run was needed and the run list is full.
    pub fn push(&mut self, cluster: u32) -> bool {
        self.push_run(ClusterRun {
            start: cluster,
            len: 1,
        })
    }

    pub fn push_run(&mut self, run: ClusterRun) -> bool {
        if run.len == 0 {
            return true;
        }
        if let Some(last) = self.runs.last_mut() {
            if last.end() == run.start {
                last.len += run.len;
                self.total += run.len;
                return true;
            }
        }
        if self.runs_full() {
            return false;
        }
        self.runs.push(run);
        self.total += run.len;
        true
    }

    /// Appends every run of `other`. The run limit of `self` does not apply
    /// here; merging is how batches are combined.
    pub fn append(&mut self, other: &Self) {
        for &run in &other.runs {
            match self.runs.last_mut() {
                Some(last) if last.end() == run.start => last.len += run.len,
                _ => self.runs.push(run),
            }
            self.total += run.len;
        }
    }

    pub fn contains(&self, cluster: u32) -> bool {
        self.runs.iter().any(|run| run.contains(cluster))
    }

    /// The `index`th cluster of the VC.
    pub fn get(&self, index: u32) -> Option<u32> {
        let mut skipped = 0;
        for run in &self.runs {
            if index < skipped + run.len {
                return Some(run.start + (index - skipped));
            }
            skipped += run.len;
        }
        None
    }

    /// Drops everything after the first `count` clusters.
    pub fn truncate(&mut self, count: u32) {
        if count >= self.total {
            return;
        }
        let mut kept = 0;
        let mut runs_kept = 0;
        for run in &mut self.runs {
            if kept == count {
                break;
            }
            run.len = run.len.min(count - kept);
            kept += run.len;
            runs_kept += 1;
        }
        self.runs.truncate(runs_kept);
        self.total = count;
    }

    pub fn clear(&mut self) {
        self.runs.clear();
        self.total = 0;
        self.cursor = 0;
    }

    /// Every cluster, in order.
    pub fn clusters(&self) -> impl DoubleEndedIterator<Item = u32> + '_ {
        self.runs.iter().flat_map(|run| run.start..run.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_merge_when_contiguous() {
        let mut vc = VectoredCluster::new();
        for cluster in [5, 6, 7, 10, 11, 3] {
            assert!(vc.push(cluster));
        }
        assert_eq!(
            vc.runs(),
            [
                ClusterRun { start: 5, len: 3 },
                ClusterRun { start: 10, len: 2 },
                ClusterRun { start: 3, len: 1 },
            ]
        );
        assert_eq!(vc.total(), 6);
        assert_eq!(vc.first(), Some(5));
        assert_eq!(vc.last(), Some(3));
        assert_eq!(vc.get(3), Some(10));
        assert_eq!(vc.get(6), None);
        assert!(vc.contains(11));
        assert!(!vc.contains(8));
        assert_eq!(vc.clusters().rev().collect::<Vec<_>>(), [3, 11, 10, 7, 6, 5]);
    }

    #[test]
    fn run_limit() {
        let mut vc = VectoredCluster::with_run_limit(2);
        assert!(vc.push(1));
        assert!(vc.push(3));
        assert!(vc.push(4));
        assert!(vc.runs_full());
        assert!(!vc.push(9));
        assert_eq!(vc.total(), 3);

        let mut merged = VectoredCluster::with_run_limit(1);
        merged.push(20);
        merged.append(&vc);
        assert_eq!(merged.runs().len(), 3);
        assert_eq!(merged.total(), 4);
    }

    #[test]
    fn truncate_splits_runs() {
        let mut vc = VectoredCluster::new();
        vc.push_run(ClusterRun { start: 10, len: 4 });
        vc.push_run(ClusterRun { start: 20, len: 4 });
        vc.truncate(6);
        assert_eq!(
            vc.runs(),
            [
                ClusterRun { start: 10, len: 4 },
                ClusterRun { start: 20, len: 2 },
            ]
        );
        vc.truncate(2);
        assert_eq!(vc.runs(), [ClusterRun { start: 10, len: 2 }]);
        assert_eq!(vc.total(), 2);
    }
}
