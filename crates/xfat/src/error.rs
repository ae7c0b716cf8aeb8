use core::fmt;

/// Every failure the filesystem core reports. Each variant maps onto one
/// errno value for the host glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsError {
    /// Bad argument, bad geometry, or a stale node handle.
    Invalid,
    /// Scratch memory (or another bounded resource) is exhausted.
    NoMem,
    /// No free clusters, or no room in a fixed-size root directory.
    NoSpace,
    /// The block device failed.
    Io,
    /// The on-disk FAT or directory structure is inconsistent (EFAT).
    Corrupt,
    /// The volume was remounted or unmounted since the handle was issued.
    CrossDevice,
    /// Mutation on a read-only mount.
    ReadOnly,
    /// Permission metadata of a protected file cannot be changed.
    Access,
    NotDir,
    IsDir,
    NotEmpty,
    NotFound,
    Exists,
    /// Nodes are still open.
    Busy,
    NameTooLong,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// Negative errno value, the way a kernel VFS layer would return it.
    pub const fn errno(self) -> i32 {
        let positive = match self {
            Self::Invalid => 22,
            Self::NoMem => 12,
            Self::NoSpace => 28,
            Self::Io => 5,
            // Linux uses EUCLEAN for filesystem corruption.
            Self::Corrupt => 117,
            Self::CrossDevice => 18,
            Self::ReadOnly => 30,
            Self::Access => 13,
            Self::NotDir => 20,
            Self::IsDir => 21,
            Self::NotEmpty => 39,
            Self::NotFound => 2,
            Self::Exists => 17,
            Self::Busy => 16,
            Self::NameTooLong => 36,
        };
        -positive
    }

    const fn message(self) -> &'static str {
        match self {
            Self::Invalid => "invalid argument",
            Self::NoMem => "out of scratch memory",
            Self::NoSpace => "no space left on volume",
            Self::Io => "block device I/O error",
            Self::Corrupt => "corrupt FAT structure",
            Self::CrossDevice => "stale handle from another mount",
            Self::ReadOnly => "read-only volume",
            Self::Access => "permission denied",
            Self::NotDir => "not a directory",
            Self::IsDir => "is a directory",
            Self::NotEmpty => "directory not empty",
            Self::NotFound => "no such file or directory",
            Self::Exists => "file exists",
            Self::Busy => "volume busy",
            Self::NameTooLong => "file name too long",
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values() {
        assert_eq!(FsError::NoSpace.errno(), -28);
        assert_eq!(FsError::CrossDevice.errno(), -18);
        assert_eq!(FsError::NotFound.errno(), -2);
        assert_eq!(FsError::Corrupt.to_string(), "corrupt FAT structure");
    }
}
