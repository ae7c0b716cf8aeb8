use genio::error::ReadExactError;
use zerocopy::{AsBytes, FromBytes};

use crate::{BlockDevice, FsError, FsResult};

pub fn zero_copy_read<R, T>(reader: &mut R) -> Result<T, ReadExactError<R::ReadError>>
where
    R: genio::Read,
    T: AsBytes + FromBytes,
{
    let mut s = T::new_zeroed();
    let buf = s.as_bytes_mut();
    reader.read_exact(buf)?;
    Ok(s)
}

/// A `genio` reader over a [`BlockDevice`], starting at a byte offset.
#[derive(Debug)]
pub struct DeviceReader<'a, D> {
    device: &'a D,
    offset: u64,
}

impl<'a, D: BlockDevice> DeviceReader<'a, D> {
    pub fn new(device: &'a D, offset: u64) -> Self {
        Self { device, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<D: BlockDevice> genio::Read for DeviceReader<'_, D> {
    type ReadError = FsError;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::ReadError> {
        let remaining = self.device.len().saturating_sub(self.offset);
        let count = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if count == 0 {
            return Ok(0);
        }
        self.device.read_at(self.offset, &mut buf[..count])?;
        self.offset += count as u64;
        Ok(count)
    }
}

/// Reads one on-disk structure at `offset`. Running off the end of the
/// device is a geometry problem, so it maps to `Invalid`.
pub fn read_struct<D, T>(device: &D, offset: u64) -> FsResult<T>
where
    D: BlockDevice,
    T: AsBytes + FromBytes,
{
    let mut reader = DeviceReader::new(device, offset);
    zero_copy_read(&mut reader).map_err(|err| match err {
        ReadExactError::Other(err) => err,
        ReadExactError::UnexpectedEnd => FsError::Invalid,
    })
}

/// Writes one on-disk structure at `offset`.
pub fn write_struct<D, T>(device: &D, offset: u64, value: &T) -> FsResult<()>
where
    D: BlockDevice,
    T: AsBytes,
{
    device.write_at(offset, value.as_bytes())
}
