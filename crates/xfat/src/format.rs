use zerocopy::{AsBytes, FromZeroes};

use crate::dirent::{Attributes, ShortEntry, XdeRecord, RECORD_SIZE};
use crate::fat::{FatEntry, FatTable};
use crate::io::write_struct;
use crate::name::label_bytes;
use crate::xde::VolumeXde;
use crate::{
    BIOSParameterBlock, BlockDevice, Fat16ExtendedBpb, Fat32ExtendedBpb, FatType, FsError,
    FsInfo, FsResult, Geometry, BOOT_SIGNATURE,
};

const SECTOR_SIZE: u32 = 512;
const MEDIA_FIXED_DISK: u8 = 0xF8;
const FAT32_RESERVED_SECTORS: u32 = 32;
const FAT16_RESERVED_SECTORS: u32 = 4;
const FS_INFO_SECTOR: u16 = 1;
const BACKUP_BOOT_SECTOR: u16 = 6;

/// How to lay out a new volume.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub fat_type: FatType,
    pub sectors_per_cluster: u8,
    pub fat_count: u8,
    /// Size of the fixed root directory, in records (FAT16 only).
    pub root_entries: u16,
    pub volume_id: u32,
    pub label: Option<[u8; 11]>,
    /// Writes the volume XDE default record into the root directory.
    pub xde: Option<VolumeXde>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            fat_type: FatType::Fat32,
            sectors_per_cluster: 8,
            fat_count: 2,
            root_entries: 512,
            volume_id: 0x5846_4154,
            label: None,
            xde: None,
        }
    }
}

impl FormatOptions {
    pub fn fat16() -> Self {
        Self {
            fat_type: FatType::Fat16,
            sectors_per_cluster: 4,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: &str) -> FsResult<Self> {
        self.label = Some(label_bytes(label)?);
        Ok(self)
    }
}

/// Writes an empty FAT16 or FAT32 file system covering the whole device and
/// returns its geometry.
pub fn format<D: BlockDevice>(device: &D, options: &FormatOptions) -> FsResult<Geometry> {
    let spc = u32::from(options.sectors_per_cluster);
    let fat_count = u32::from(options.fat_count);
    if spc == 0 || !spc.is_power_of_two() || spc > 128 || !(1..=2).contains(&fat_count) {
        return Err(FsError::Invalid);
    }
    let total_sectors =
        u32::try_from(device.len() / u64::from(SECTOR_SIZE)).map_err(|_| FsError::Invalid)?;

    let fat_type = options.fat_type;
    let (reserved, root_sectors) = match fat_type {
        FatType::Fat32 => (FAT32_RESERVED_SECTORS, 0),
        FatType::Fat16 => {
            if options.root_entries == 0 {
                return Err(FsError::Invalid);
            }
            let root_bytes = u32::from(options.root_entries) * RECORD_SIZE;
            (FAT16_RESERVED_SECTORS, root_bytes.div_ceil(SECTOR_SIZE))
        }
    };

    // Grow the FAT until it can map every cluster left over after it.
    let mut sectors_per_fat = 1_u32;
    let clusters = loop {
        let overhead = reserved + fat_count * sectors_per_fat + root_sectors;
        let data = total_sectors.checked_sub(overhead).ok_or(FsError::Invalid)?;
        let clusters = data / spc;
        let needed = ((clusters + 2) * fat_type.entry_bytes()).div_ceil(SECTOR_SIZE);
        if needed <= sectors_per_fat {
            break clusters;
        }
        sectors_per_fat = needed;
    };
    if clusters < 2 || clusters > fat_type.max_clusters() {
        log::debug!("{clusters} clusters do not fit {fat_type:?}");
        return Err(FsError::Invalid);
    }

    // Zero the reserved area, the FATs, the fixed root, and the FAT32 root
    // cluster.
    let mut metadata_sectors = reserved + fat_count * sectors_per_fat + root_sectors;
    if fat_type == FatType::Fat32 {
        metadata_sectors += spc;
    }
    zero_range(device, 0, u64::from(metadata_sectors) * u64::from(SECTOR_SIZE))?;

    let mut bpb = BIOSParameterBlock::new_zeroed();
    bpb.jmp_boot = [0xEB, 0x58, 0x90];
    bpb.oem_name = *b"XFAT    ";
    bpb.bytes_per_sector = SECTOR_SIZE as u16;
    bpb.sectors_per_cluster = options.sectors_per_cluster;
    bpb.reserved_sectors = reserved as u16;
    bpb.fat_count = options.fat_count;
    bpb.media_descriptor = MEDIA_FIXED_DISK;
    bpb.sectors_per_track = 32;
    bpb.head_count = 64;
    match u16::try_from(total_sectors) {
        Ok(small) if fat_type == FatType::Fat16 => bpb.total_sectors = small,
        _ => bpb.total_sectors_large = total_sectors,
    }

    let label = options.label.unwrap_or(*b"NO NAME    ");
    let mut boot_sector = [0_u8; SECTOR_SIZE as usize];
    match fat_type {
        FatType::Fat32 => {
            let mut ext = Fat32ExtendedBpb::new_zeroed();
            ext.sectors_per_fat = sectors_per_fat;
            ext.root_cluster = 2;
            ext.fs_info_sector = FS_INFO_SECTOR;
            ext.backup_boot_sector = BACKUP_BOOT_SECTOR;
            ext.drive_number = 0x80;
            ext.boot_signature = 0x29;
            ext.volume_id = options.volume_id;
            ext.volume_label = label;
            ext.fs_type = *b"FAT32   ";
            ext.write_to_prefix(&mut boot_sector[BIOSParameterBlock::SIZE as usize..])
                .ok_or(FsError::Invalid)?;
        }
        FatType::Fat16 => {
            bpb.root_dir_entries = options.root_entries;
            bpb.sectors_per_fat = sectors_per_fat as u16;
            let mut ext = Fat16ExtendedBpb::new_zeroed();
            ext.drive_number = 0x80;
            ext.boot_signature = 0x29;
            ext.volume_id = options.volume_id;
            ext.volume_label = label;
            ext.fs_type = *b"FAT16   ";
            ext.write_to_prefix(&mut boot_sector[BIOSParameterBlock::SIZE as usize..])
                .ok_or(FsError::Invalid)?;
        }
    }
    bpb.write_to_prefix(&mut boot_sector[..])
        .ok_or(FsError::Invalid)?;
    boot_sector[510..].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());

    device.write_at(0, &boot_sector)?;
    if fat_type == FatType::Fat32 {
        let backup = u64::from(BACKUP_BOOT_SECTOR) * u64::from(SECTOR_SIZE);
        device.write_at(backup, &boot_sector)?;
    }

    let geometry = Geometry::read(device)?;
    let table = FatTable::new(device, &geometry, true);
    let media = match fat_type {
        FatType::Fat16 => 0xFF00 | u32::from(MEDIA_FIXED_DISK),
        FatType::Fat32 => 0x0FFF_FF00 | u32::from(MEDIA_FIXED_DISK),
    };
    table.set_raw(0, media)?;
    table.set_raw(1, FatEntry::EndOfChain.encode(fat_type))?;

    let mut free = geometry.total_clusters;
    if fat_type == FatType::Fat32 {
        table.set(geometry.root_cluster, FatEntry::EndOfChain)?;
        free -= 1;
    }

    // Root directory records: the label first, then the XDE defaults.
    let root_start = match fat_type {
        FatType::Fat16 => geometry.root_offset,
        FatType::Fat32 => geometry.cluster_offset(geometry.root_cluster),
    };
    let mut slot = root_start;
    if let Some(label) = options.label {
        let entry = ShortEntry::new(label, Attributes::VOLUME_ID | Attributes::ARCHIVE);
        write_struct(device, slot, &entry)?;
        slot += u64::from(RECORD_SIZE);
    }
    if let Some(xde) = &options.xde {
        let record = XdeRecord::for_volume(xde.guid, xde.uid, xde.gid, xde.perm.bits());
        write_struct(device, slot, &record)?;
    }

    if let Some(offset) = geometry.fs_info_offset {
        write_struct(device, offset, &FsInfo::new(free, 3))?;
    }

    device.flush()?;
    log::debug!(
        "formatted {:?}: {} clusters of {} bytes",
        fat_type,
        geometry.total_clusters,
        geometry.cluster_size
    );
    Ok(geometry)
}

/// Writes zeros over `len` bytes starting at `offset`.
pub(crate) fn zero_range<D: BlockDevice>(device: &D, offset: u64, len: u64) -> FsResult<()> {
    const ZEROS: [u8; 4096] = [0; 4096];
    let mut done = 0;
    while done < len {
        let count = (len - done).min(ZEROS.len() as u64);
        device.write_at(offset + done, &ZEROS[..count as usize])?;
        done += count;
    }
    Ok(())
}
