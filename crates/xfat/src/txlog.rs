use crate::node::DeLocation;
use crate::vc::VectoredCluster;
use crate::xde::XdeInfo;
use crate::FsResult;

/// Hooks into a write-ahead log. Each hook runs before the matching
/// mutation touches the disk; an error aborts the mutation with nothing
/// changed.
///
/// With `LOG_OFF` no hook runs. `LOG_PARTIAL` runs the metadata hooks;
/// `LOG_FULL` also runs `before_write_data`.
pub trait TransactionLog: Send + Sync {
    /// `clusters` are about to be linked after `prev_end` (0 for a new
    /// chain).
    fn before_make_cluster_chain(&self, prev_end: u32, clusters: &VectoredCluster) -> FsResult<()> {
        let _ = (prev_end, clusters);
        Ok(())
    }

    fn before_update_xde(&self, entry: &DeLocation, info: &XdeInfo) -> FsResult<()> {
        let _ = (entry, info);
        Ok(())
    }

    fn before_expand_directory(&self, dir_cluster: u32, clusters: u32) -> FsResult<()> {
        let _ = (dir_cluster, clusters);
        Ok(())
    }

    fn before_rename(&self, from: &DeLocation, to_dir_cluster: u32, new_name: &str) -> FsResult<()> {
        let _ = (from, to_dir_cluster, new_name);
        Ok(())
    }

    fn before_remove(&self, entry: &DeLocation) -> FsResult<()> {
        let _ = entry;
        Ok(())
    }

    fn before_write_data(&self, first_cluster: u32, offset: u64, len: usize) -> FsResult<()> {
        let _ = (first_cluster, offset, len);
        Ok(())
    }
}

/// Logs nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLog;

impl TransactionLog for NoLog {}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use spin::Mutex;

    use crate::FsError;

    /// Records hook names and can be told to fail one of them.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingLog {
        pub(crate) events: Mutex<Vec<&'static str>>,
        pub(crate) fail_on: Mutex<Option<&'static str>>,
    }

    impl RecordingLog {
        fn record(&self, event: &'static str) -> FsResult<()> {
            if *self.fail_on.lock() == Some(event) {
                return Err(FsError::Io);
            }
            self.events.lock().push(event);
            Ok(())
        }
    }

    impl TransactionLog for RecordingLog {
        fn before_make_cluster_chain(&self, _: u32, _: &VectoredCluster) -> FsResult<()> {
            self.record("make_cluster_chain")
        }

        fn before_update_xde(&self, _: &DeLocation, _: &XdeInfo) -> FsResult<()> {
            self.record("update_xde")
        }

        fn before_expand_directory(&self, _: u32, _: u32) -> FsResult<()> {
            self.record("expand_directory")
        }

        fn before_rename(&self, _: &DeLocation, _: u32, _: &str) -> FsResult<()> {
            self.record("rename")
        }

        fn before_remove(&self, _: &DeLocation) -> FsResult<()> {
            self.record("remove")
        }

        fn before_write_data(&self, _: u32, _: u64, _: usize) -> FsResult<()> {
            self.record("write_data")
        }
    }

    impl TransactionLog for alloc::sync::Arc<RecordingLog> {
        fn before_make_cluster_chain(&self, a: u32, b: &VectoredCluster) -> FsResult<()> {
            (**self).before_make_cluster_chain(a, b)
        }

        fn before_update_xde(&self, a: &DeLocation, b: &XdeInfo) -> FsResult<()> {
            (**self).before_update_xde(a, b)
        }

        fn before_expand_directory(&self, a: u32, b: u32) -> FsResult<()> {
            (**self).before_expand_directory(a, b)
        }

        fn before_rename(&self, a: &DeLocation, b: u32, c: &str) -> FsResult<()> {
            (**self).before_rename(a, b, c)
        }

        fn before_remove(&self, a: &DeLocation) -> FsResult<()> {
            (**self).before_remove(a)
        }

        fn before_write_data(&self, a: u32, b: u64, c: usize) -> FsResult<()> {
            (**self).before_write_data(a, b, c)
        }
    }
}
