use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Debug;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::RwLock;

use crate::{FsError, FsResult};

/// Something that can read and write bytes at absolute offsets of the media
/// backing a volume. The core always reads and writes whole directory
/// records, FAT entries, or cluster ranges, so implementations may assume
/// accesses never straddle the end of the device.
pub trait BlockDevice: Debug + Send + Sync {
    /// Size of the device in bytes.
    fn len(&self) -> u64;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<()>;

    fn write_at(&self, offset: u64, data: &[u8]) -> FsResult<()>;

    /// Makes every completed write durable.
    fn flush(&self) -> FsResult<()>;
}

/// `RamDisk::fault_at` value meaning no single-write fault is armed.
const NO_FAULT: u64 = u64::MAX;

/// A block device backed by memory. Used by the tests and by tools that
/// build images in memory before writing them out.
#[derive(Debug)]
pub struct RamDisk {
    data: RwLock<Vec<u8>>,
    fail_writes: AtomicBool,
    /// Writes left to pass before one fails.
    fault_at: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl RamDisk {
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            fail_writes: AtomicBool::new(false),
            fault_at: AtomicU64::new(NO_FAULT),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_inner()
    }

    /// Makes every later write fail with `FsError::Io`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Lets `passing` more writes through, then fails exactly one with
    /// `FsError::Io`. Writes after that one succeed again.
    pub fn fail_write_after(&self, passing: u64) {
        self.fault_at.store(passing, Ordering::SeqCst);
    }

    /// Disarms `fail_write_after`. Returns whether the fault was still
    /// pending, i.e. fewer writes happened than it waited for.
    pub fn clear_write_fault(&self) -> bool {
        self.fault_at.swap(NO_FAULT, Ordering::SeqCst) != NO_FAULT
    }

    /// Number of successful `write_at` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    fn range(len: usize, offset: u64, count: usize) -> FsResult<core::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| FsError::Io)?;
        let end = start.checked_add(count).ok_or(FsError::Io)?;
        if end > len {
            log::error!("ram disk access {start:#x}..{end:#x} past end {len:#x}");
            return Err(FsError::Io);
        }
        Ok(start..end)
    }
}

impl BlockDevice for RamDisk {
    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let data = self.data.read();
        let range = Self::range(data.len(), offset, buf.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> FsResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FsError::Io);
        }
        let fault = self
            .fault_at
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                NO_FAULT => None,
                0 => Some(NO_FAULT),
                left => Some(left - 1),
            });
        if fault == Ok(0) {
            return Err(FsError::Io);
        }
        let mut data = self.data.write();
        let range = Self::range(data.len(), offset, bytes.len())?;
        data[range].copy_from_slice(bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> FsResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
