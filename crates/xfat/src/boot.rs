use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::io::read_struct;
use crate::{BlockDevice, FsError, FsResult};

/// Boot sectors end with this signature at byte offset 510.
pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// The BIOS parameter block is the first part of the boot sector.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub struct BIOSParameterBlock {
    pub jmp_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub root_dir_entries: u16,
    pub total_sectors: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat: u16,
    pub sectors_per_track: u16,
    pub head_count: u16,
    pub hidden_sectors: u32,
    pub total_sectors_large: u32,
}

impl BIOSParameterBlock {
    pub const SIZE: u64 = core::mem::size_of::<Self>() as u64;
}

/// Extended BPB of FAT12/FAT16 volumes, directly after the common BPB.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub struct Fat16ExtendedBpb {
    pub drive_number: u8,
    pub reserved: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

/// Extended BPB of FAT32 volumes, directly after the common BPB.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub struct Fat32ExtendedBpb {
    pub sectors_per_fat: u32,
    /// Bit 7 set means only the FAT in bits 0-3 is active (no mirroring).
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

impl Fat32ExtendedBpb {
    pub const NO_MIRRORING: u16 = 1 << 7;
    pub const ACTIVE_FAT_MASK: u16 = 0x0F;
}

/// The FAT32 FSInfo sector. Its free count is only a hint and is ignored
/// when it is implausible.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub struct FsInfo {
    pub lead_signature: u32,
    pub reserved1: [u8; 480],
    pub struct_signature: u32,
    pub free_count: u32,
    pub next_free: u32,
    pub reserved2: [u8; 12],
    pub trail_signature: u32,
}

impl FsInfo {
    pub const LEAD_SIGNATURE: u32 = 0x4161_5252;
    pub const STRUCT_SIGNATURE: u32 = 0x6141_7272;
    pub const TRAIL_SIGNATURE: u32 = 0xAA55_0000;
    pub const UNKNOWN: u32 = 0xFFFF_FFFF;

    pub fn new(free_count: u32, next_free: u32) -> Self {
        let mut info = Self::new_zeroed();
        info.lead_signature = Self::LEAD_SIGNATURE;
        info.struct_signature = Self::STRUCT_SIGNATURE;
        info.trail_signature = Self::TRAIL_SIGNATURE;
        info.free_count = free_count;
        info.next_free = next_free;
        info
    }

    pub fn signatures_valid(&self) -> bool {
        let (lead, strukt, trail) = (
            self.lead_signature,
            self.struct_signature,
            self.trail_signature,
        );
        lead == Self::LEAD_SIGNATURE
            && strukt == Self::STRUCT_SIGNATURE
            && trail == Self::TRAIL_SIGNATURE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

impl FatType {
    /// Bytes per FAT entry.
    pub const fn entry_bytes(self) -> u32 {
        match self {
            Self::Fat16 => 2,
            Self::Fat32 => 4,
        }
    }

    /// Largest cluster count the entry width can address, leaving room for
    /// the reserved, bad and end-of-chain values.
    pub const fn max_clusters(self) -> u32 {
        match self {
            Self::Fat16 => 0xFFF4,
            Self::Fat32 => 0x0FFF_FFF4,
        }
    }
}

/// Everything derived from the boot sector that the rest of the core needs
/// to turn clusters and directory records into device offsets.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub fat_type: FatType,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub cluster_size: u32,
    pub cluster_shift: u32,
    /// Byte offset of the first FAT.
    pub fat_offset: u64,
    /// Bytes per FAT copy.
    pub fat_size: u64,
    pub fat_count: u32,
    pub active_fat: u32,
    pub mirrored: bool,
    /// Fixed root directory region (FAT16 only; zero-sized on FAT32).
    pub root_offset: u64,
    pub root_size: u32,
    /// First cluster of the root directory (FAT32 only; zero on FAT16).
    pub root_cluster: u32,
    pub data_offset: u64,
    pub total_clusters: u32,
    pub fs_info_offset: Option<u64>,
    pub backup_boot_offset: Option<u64>,
    pub volume_id: u32,
    pub label: [u8; 11],
}

impl Geometry {
    /// Byte offset of the volume label field inside the boot sector.
    pub const fn label_offset(&self) -> u64 {
        match self.fat_type {
            FatType::Fat16 => BIOSParameterBlock::SIZE + 7,
            FatType::Fat32 => BIOSParameterBlock::SIZE + 35,
        }
    }

    /// Reads and validates the boot sector of `device`.
    pub fn read<D: BlockDevice>(device: &D) -> FsResult<Self> {
        let bpb: BIOSParameterBlock = read_struct(device, 0)?;
        let signature: u16 = read_struct(device, 510)?;
        if signature != BOOT_SIGNATURE {
            log::debug!("boot signature {signature:#06x} missing");
            return Err(FsError::Invalid);
        }

        let bytes_per_sector = u32::from(bpb.bytes_per_sector);
        let sectors_per_cluster = u32::from(bpb.sectors_per_cluster);
        if !(512..=4096).contains(&bytes_per_sector) || !bytes_per_sector.is_power_of_two() {
            return Err(FsError::Invalid);
        }
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(FsError::Invalid);
        }
        let cluster_size = bytes_per_sector * sectors_per_cluster;
        if cluster_size > 64 * 1024 {
            return Err(FsError::Invalid);
        }

        let reserved_sectors = u32::from(bpb.reserved_sectors);
        let fat_count = u32::from(bpb.fat_count);
        if reserved_sectors == 0 || !(1..=2).contains(&fat_count) {
            return Err(FsError::Invalid);
        }

        let total_sectors = if bpb.total_sectors == 0 {
            bpb.total_sectors_large
        } else {
            u32::from(bpb.total_sectors)
        };
        if u64::from(total_sectors) * u64::from(bytes_per_sector) > device.len() {
            log::debug!("boot sector claims more sectors than the device has");
            return Err(FsError::Invalid);
        }

        // N.B. The FAT type follows the BPB layout rather than the cluster
        // count thresholds, so small FAT32 images are accepted.
        let fat32 = bpb.sectors_per_fat == 0 && bpb.root_dir_entries == 0;
        let (
            fat_type,
            sectors_per_fat,
            root_cluster,
            active_fat,
            mirrored,
            fs_info_sector,
            backup_sector,
            volume_id,
            label,
        ) = if fat32 {
            let ext: Fat32ExtendedBpb = read_struct(device, BIOSParameterBlock::SIZE)?;
            let flags = ext.ext_flags;
            let mirrored = flags & Fat32ExtendedBpb::NO_MIRRORING == 0;
            let active = if mirrored {
                0
            } else {
                u32::from(flags & Fat32ExtendedBpb::ACTIVE_FAT_MASK)
            };
            (
                FatType::Fat32,
                ext.sectors_per_fat,
                ext.root_cluster,
                active,
                mirrored,
                u32::from(ext.fs_info_sector),
                u32::from(ext.backup_boot_sector),
                ext.volume_id,
                ext.volume_label,
            )
        } else {
            let ext: Fat16ExtendedBpb = read_struct(device, BIOSParameterBlock::SIZE)?;
            let fs_type = ext.fs_type;
            if &fs_type == b"FAT12   " {
                log::debug!("FAT12 volumes are not supported");
                return Err(FsError::Invalid);
            }
            (
                FatType::Fat16,
                u32::from(bpb.sectors_per_fat),
                0,
                0,
                true,
                0,
                0,
                ext.volume_id,
                ext.volume_label,
            )
        };

        if sectors_per_fat == 0 || active_fat >= fat_count {
            return Err(FsError::Invalid);
        }

        let root_bytes = u32::from(bpb.root_dir_entries) * 32;
        let root_sectors = root_bytes.div_ceil(bytes_per_sector);
        let data_start = u64::from(reserved_sectors)
            + u64::from(fat_count) * u64::from(sectors_per_fat)
            + u64::from(root_sectors);
        if data_start >= u64::from(total_sectors) {
            return Err(FsError::Invalid);
        }
        let total_clusters =
            ((u64::from(total_sectors) - data_start) / u64::from(sectors_per_cluster)) as u32;
        if total_clusters == 0 || total_clusters > fat_type.max_clusters() {
            return Err(FsError::Invalid);
        }

        let fat_size = u64::from(sectors_per_fat) * u64::from(bytes_per_sector);
        let needed = (u64::from(total_clusters) + 2) * u64::from(fat_type.entry_bytes());
        if fat_size < needed {
            log::debug!("FAT of {fat_size} bytes cannot map {total_clusters} clusters");
            return Err(FsError::Invalid);
        }

        let sector = |n: u32| u64::from(n) * u64::from(bytes_per_sector);
        let fat_offset = sector(reserved_sectors);
        let root_offset = fat_offset + u64::from(fat_count) * fat_size;

        let geometry = Self {
            fat_type,
            bytes_per_sector,
            sectors_per_cluster,
            cluster_size,
            cluster_shift: cluster_size.trailing_zeros(),
            fat_offset,
            fat_size,
            fat_count,
            active_fat,
            mirrored,
            root_offset,
            root_size: if fat32 { 0 } else { root_bytes },
            root_cluster,
            data_offset: data_start * u64::from(bytes_per_sector),
            total_clusters,
            fs_info_offset: (fat32 && fs_info_sector != 0 && fs_info_sector < reserved_sectors)
                .then(|| sector(fs_info_sector)),
            backup_boot_offset: (fat32 && backup_sector != 0 && backup_sector < reserved_sectors)
                .then(|| sector(backup_sector)),
            volume_id,
            label,
        };

        if fat32 && !geometry.is_data_cluster(root_cluster) {
            return Err(FsError::Invalid);
        }
        if !fat32 && root_bytes == 0 {
            return Err(FsError::Invalid);
        }

        Ok(geometry)
    }

    /// Reads the FSInfo sector if the volume has a valid one.
    pub fn read_fs_info<D: BlockDevice>(&self, device: &D) -> FsResult<Option<FsInfo>> {
        let Some(offset) = self.fs_info_offset else {
            return Ok(None);
        };
        let info: FsInfo = read_struct(device, offset)?;
        Ok(info.signatures_valid().then_some(info))
    }

    pub const fn has_fixed_root(&self) -> bool {
        matches!(self.fat_type, FatType::Fat16)
    }

    /// First cluster number past the end of the data region.
    pub const fn cluster_limit(&self) -> u32 {
        self.total_clusters + 2
    }

    pub const fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.cluster_limit()
    }

    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        debug_assert!(self.is_data_cluster(cluster), "cluster {cluster} out of range");
        self.data_offset + (u64::from(cluster - 2) << self.cluster_shift)
    }

    /// Byte offset of `cluster`'s entry in FAT copy `fat`.
    pub fn fat_entry_offset(&self, fat: u32, cluster: u32) -> u64 {
        self.fat_offset
            + u64::from(fat) * self.fat_size
            + u64::from(cluster) * u64::from(self.fat_type.entry_bytes())
    }

    /// Number of clusters needed to hold `bytes`.
    pub fn clusters_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.cluster_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::format::{format, FormatOptions};
    use crate::RamDisk;

    #[test]
    fn struct_sizes() {
        assert_eq!(core::mem::size_of::<BIOSParameterBlock>(), 36);
        assert_eq!(core::mem::size_of::<Fat16ExtendedBpb>(), 26);
        assert_eq!(core::mem::size_of::<Fat32ExtendedBpb>(), 54);
        assert_eq!(core::mem::size_of::<FsInfo>(), 512);
    }

    #[test]
    fn blank_device_is_invalid() {
        let disk = RamDisk::new(1024 * 1024);
        assert_eq!(Geometry::read(&disk).unwrap_err(), FsError::Invalid);
    }

    #[test]
    fn formatted_fat32_geometry() {
        let disk = RamDisk::new(8 * 1024 * 1024);
        let options = FormatOptions {
            sectors_per_cluster: 8,
            ..FormatOptions::default()
        };
        format(&disk, &options).unwrap();

        let geometry = Geometry::read(&disk).unwrap();
        assert_eq!(geometry.fat_type, FatType::Fat32);
        assert_eq!(geometry.cluster_size, 4096);
        assert_eq!(geometry.cluster_shift, 12);
        assert_eq!(geometry.root_cluster, 2);
        assert!(geometry.mirrored);
        assert!(geometry.total_clusters > 1900 && geometry.total_clusters < 2048);
        assert_eq!(geometry.cluster_offset(2), geometry.data_offset);

        let info = geometry.read_fs_info(&disk).unwrap().unwrap();
        let free = info.free_count;
        assert_eq!(free, geometry.total_clusters - 1);
    }

    #[test]
    fn corrupt_bpb_is_rejected() {
        let disk = RamDisk::new(4 * 1024 * 1024);
        format(&disk, &FormatOptions::fat16()).unwrap();
        assert_eq!(Geometry::read(&disk).unwrap().fat_type, FatType::Fat16);

        // Three sectors per cluster is not a power of two.
        disk.write_at(13, &[3]).unwrap();
        assert_eq!(Geometry::read(&disk).unwrap_err(), FsError::Invalid);
    }
}
