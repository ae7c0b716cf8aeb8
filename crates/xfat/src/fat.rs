use crate::{BlockDevice, FatType, FsError, FsResult, Geometry};

/// Decoded value of one FAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    /// Next cluster of the chain. May be out of range on a corrupt volume.
    Next(u32),
    Bad,
    EndOfChain,
}

impl FatEntry {
    const FAT16_BAD: u32 = 0xFFF7;
    const FAT16_EOC: u32 = 0xFFFF;
    const FAT32_BAD: u32 = 0x0FFF_FFF7;
    const FAT32_EOC: u32 = 0x0FFF_FFFF;
    const FAT32_MASK: u32 = 0x0FFF_FFFF;

    pub fn decode(raw: u32, fat_type: FatType) -> Self {
        let (raw, bad) = match fat_type {
            FatType::Fat16 => (raw & 0xFFFF, Self::FAT16_BAD),
            FatType::Fat32 => (raw & Self::FAT32_MASK, Self::FAT32_BAD),
        };
        match raw {
            0 => Self::Free,
            r if r == bad => Self::Bad,
            r if r > bad => Self::EndOfChain,
            r => Self::Next(r),
        }
    }

    pub fn encode(self, fat_type: FatType) -> u32 {
        match (self, fat_type) {
            (Self::Free, _) => 0,
            (Self::Next(n), _) => n,
            (Self::Bad, FatType::Fat16) => Self::FAT16_BAD,
            (Self::Bad, FatType::Fat32) => Self::FAT32_BAD,
            (Self::EndOfChain, FatType::Fat16) => Self::FAT16_EOC,
            (Self::EndOfChain, FatType::Fat32) => Self::FAT32_EOC,
        }
    }
}

/// Bytes of FAT read per device access while scanning.
const SCAN_CHUNK: usize = 512;

/// Access to the file allocation table(s) of a volume.
///
/// Reads always come from the active FAT. Writes go to every copy when
/// mirroring is on, else only to the active one.
#[derive(Debug)]
pub struct FatTable<'a, D> {
    device: &'a D,
    geometry: &'a Geometry,
    mirror: bool,
}

impl<'a, D: BlockDevice> FatTable<'a, D> {
    pub fn new(device: &'a D, geometry: &'a Geometry, mirror: bool) -> Self {
        Self {
            device,
            geometry,
            mirror: mirror && geometry.mirrored,
        }
    }

    pub fn get(&self, cluster: u32) -> FsResult<FatEntry> {
        let raw = self.read_raw(self.geometry.active_fat, cluster)?;
        Ok(FatEntry::decode(raw, self.geometry.fat_type))
    }

    pub fn set(&self, cluster: u32, entry: FatEntry) -> FsResult<()> {
        if !self.geometry.is_data_cluster(cluster) {
            log::error!("refusing to write FAT entry of out-of-range cluster {cluster}");
            return Err(FsError::Corrupt);
        }
        self.set_raw(cluster, entry.encode(self.geometry.fat_type))
    }

    /// Writes a raw value, including the reserved entries 0 and 1.
    pub fn set_raw(&self, cluster: u32, value: u32) -> FsResult<()> {
        let fats = if self.mirror {
            0..self.geometry.fat_count
        } else {
            self.geometry.active_fat..self.geometry.active_fat + 1
        };
        for fat in fats {
            self.write_raw(fat, cluster, value)?;
        }
        Ok(())
    }

    /// Follows one link. `Ok(None)` at end of chain; `Corrupt` when the
    /// entry is free, bad, or points outside the data region.
    pub fn next(&self, cluster: u32) -> FsResult<Option<u32>> {
        match self.get(cluster)? {
            FatEntry::EndOfChain => Ok(None),
            FatEntry::Next(next) if self.geometry.is_data_cluster(next) => Ok(Some(next)),
            entry => {
                log::error!("broken cluster chain: cluster {cluster} has FAT entry {entry:?}");
                Err(FsError::Corrupt)
            }
        }
    }

    /// Calls `f` for every free cluster in `start..end`, in order, reading
    /// the FAT in chunks. Stops early when `f` returns `false`.
    pub fn scan_free<F>(&self, start: u32, end: u32, mut f: F) -> FsResult<()>
    where
        F: FnMut(u32) -> bool,
    {
        let entry_bytes = self.geometry.fat_type.entry_bytes();
        let per_chunk = SCAN_CHUNK as u32 / entry_bytes;
        let mut buf = [0_u8; SCAN_CHUNK];
        let mut cluster = start.max(2);
        let end = end.min(self.geometry.cluster_limit());

        while cluster < end {
            let count = per_chunk.min(end - cluster);
            let bytes = &mut buf[..(count * entry_bytes) as usize];
            self.device.read_at(
                self.geometry
                    .fat_entry_offset(self.geometry.active_fat, cluster),
                bytes,
            )?;
            for (i, raw) in bytes.chunks_exact(entry_bytes as usize).enumerate() {
                let raw = match self.geometry.fat_type {
                    FatType::Fat16 => u32::from(u16::from_le_bytes([raw[0], raw[1]])),
                    FatType::Fat32 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                };
                if FatEntry::decode(raw, self.geometry.fat_type) == FatEntry::Free
                    && !f(cluster + i as u32)
                {
                    return Ok(());
                }
            }
            cluster += count;
        }
        Ok(())
    }

    pub fn count_free(&self) -> FsResult<u32> {
        let mut free = 0;
        self.scan_free(2, self.geometry.cluster_limit(), |_| {
            free += 1;
            true
        })?;
        Ok(free)
    }

    fn read_raw(&self, fat: u32, cluster: u32) -> FsResult<u32> {
        let offset = self.geometry.fat_entry_offset(fat, cluster);
        match self.geometry.fat_type {
            FatType::Fat16 => {
                let mut buf = [0; 2];
                self.device.read_at(offset, &mut buf)?;
                Ok(u32::from(u16::from_le_bytes(buf)))
            }
            FatType::Fat32 => {
                let mut buf = [0; 4];
                self.device.read_at(offset, &mut buf)?;
                Ok(u32::from_le_bytes(buf))
            }
        }
    }

    fn write_raw(&self, fat: u32, cluster: u32, value: u32) -> FsResult<()> {
        let offset = self.geometry.fat_entry_offset(fat, cluster);
        match self.geometry.fat_type {
            FatType::Fat16 => self.device.write_at(offset, &(value as u16).to_le_bytes()),
            FatType::Fat32 => {
                // The top four bits are reserved and must be preserved.
                let old = self.read_raw(fat, cluster)?;
                let value = (old & !FatEntry::FAT32_MASK) | (value & FatEntry::FAT32_MASK);
                self.device.write_at(offset, &value.to_le_bytes())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::format::{format, FormatOptions};
    use crate::RamDisk;

    fn fat32() -> (RamDisk, Geometry) {
        let disk = RamDisk::new(2 * 1024 * 1024);
        let geometry = format(&disk, &FormatOptions::default()).unwrap();
        (disk, geometry)
    }

    #[test]
    fn entry_codec() {
        assert_eq!(FatEntry::decode(0, FatType::Fat16), FatEntry::Free);
        assert_eq!(FatEntry::decode(0xFFF8, FatType::Fat16), FatEntry::EndOfChain);
        assert_eq!(FatEntry::decode(0xFFF7, FatType::Fat16), FatEntry::Bad);
        assert_eq!(FatEntry::decode(0xF000_0005, FatType::Fat32), FatEntry::Next(5));
        assert_eq!(FatEntry::EndOfChain.encode(FatType::Fat32), 0x0FFF_FFFF);
    }

    #[test]
    fn writes_mirror_to_every_fat() {
        let (disk, geometry) = fat32();
        let table = FatTable::new(&disk, &geometry, true);
        table.set(10, FatEntry::Next(11)).unwrap();
        assert_eq!(table.get(10).unwrap(), FatEntry::Next(11));

        let mut second = [0; 4];
        disk.read_at(geometry.fat_entry_offset(1, 10), &mut second).unwrap();
        assert_eq!(u32::from_le_bytes(second), 11);

        let unmirrored = FatTable::new(&disk, &geometry, false);
        unmirrored.set(10, FatEntry::Free).unwrap();
        disk.read_at(geometry.fat_entry_offset(1, 10), &mut second).unwrap();
        assert_eq!(u32::from_le_bytes(second), 11);
        assert_eq!(table.get(10).unwrap(), FatEntry::Free);
    }

    #[test]
    fn chain_walk_detects_corruption() {
        let (disk, geometry) = fat32();
        let table = FatTable::new(&disk, &geometry, true);
        table.set(3, FatEntry::Next(4)).unwrap();
        table.set(4, FatEntry::EndOfChain).unwrap();
        assert_eq!(table.next(3).unwrap(), Some(4));
        assert_eq!(table.next(4).unwrap(), None);
        assert_eq!(table.next(5), Err(FsError::Corrupt));

        table.set(4, FatEntry::Next(geometry.cluster_limit() + 7)).unwrap();
        assert_eq!(table.next(4), Err(FsError::Corrupt));
    }

    #[test]
    fn scan_counts_free_entries() {
        let (disk, geometry) = fat32();
        let table = FatTable::new(&disk, &geometry, true);
        let initial = table.count_free().unwrap();
        // Only the root directory cluster is in use on a fresh volume.
        assert_eq!(initial, geometry.total_clusters - 1);

        table.set(200, FatEntry::EndOfChain).unwrap();
        assert_eq!(table.count_free().unwrap(), initial - 1);

        let mut seen = Vec::new();
        table
            .scan_free(198, 203, |c| {
                seen.push(c);
                true
            })
            .unwrap();
        assert_eq!(seen, [198, 199, 201, 202]);
    }
}
