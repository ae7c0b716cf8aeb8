//! On-disk directory records. Every record is 32 bytes; a directory is a
//! stream of them.
//!
//! A file's directory entry (DE) is a run of records: zero or more long-name
//! records (LFNEs), one short-name record (SFNE), and, when the SFNE carries
//! the XDE marker, one XDE record holding POSIX ownership and permissions.

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::FatType;

pub const RECORD_SIZE: u32 = 32;

pub type RawRecord = [u8; RECORD_SIZE as usize];

/// First byte of a record that ends the directory: it and everything after
/// it are free.
pub const END_MARKER: u8 = 0x00;

/// First byte of a deleted (free) record.
pub const FREE_MARKER: u8 = 0xE5;

/// An SFNE whose name really starts with 0xE5 stores 0x05 instead.
pub const KANJI_LEAD: u8 = 0x05;

/// Long-name records set this in `ord` on the record holding the end of the
/// name, which is physically the first one.
pub const LAST_LONG_ENTRY: u8 = 0x40;
pub const LONG_ORD_MASK: u8 = 0x1F;

/// 255 UTF-16 units at 13 per record.
pub const MAX_LONG_RECORDS: u8 = 20;
pub const UNITS_PER_LONG: usize = 13;

/// First byte of XDE-shaped records.
pub const XDE_SIGNATURE: u8 = b'X';
/// `kind` byte of a per-file XDE record. Legacy drivers skip long-name
/// records whose type byte is not zero.
pub const XDE_KIND_FILE: u8 = 0xE1;
/// `kind` byte of the volume-wide XDE default record in the root directory.
pub const XDE_KIND_VOLUME: u8 = 0xE2;

/// 1980-01-01, the earliest date FAT can store.
pub const DOS_EPOCH_DATE: u16 = (1 << 5) | 1;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    /// SFNE attribute byte.
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;

        const HIDDEN = 0x02;

        const SYSTEM = 0x04;

        /// The record is the volume label, not a file.
        const VOLUME_ID = 0x08;

        const DIRECTORY = 0x10;

        /// Set whenever the file is written.
        const ARCHIVE = 0x20;

        /// All four low bits together mark a long-name record.
        const LONG_NAME = 0x0F;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    /// SFNE `NTRes` byte. Bits 3 and 4 are the Windows case hints; bit 7 is
    /// unused by every other FAT driver and marks an XDE record.
    pub struct NtRes: u8 {
        /// Base name is displayed lower case.
        const LOWER_BASE = 0x08;

        /// Extension is displayed lower case.
        const LOWER_EXT = 0x10;

        /// An XDE record directly follows this SFNE.
        const XDE = 0x80;
    }
}

/// Short-name entry.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub struct ShortEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub nt_res: u8,
    pub create_time_tenth: u8,
    pub create_time: u16,
    pub create_date: u16,
    pub access_date: u16,
    pub cluster_hi: u16,
    pub modify_time: u16,
    pub modify_date: u16,
    pub cluster_lo: u16,
    pub size: u32,
}

impl ShortEntry {
    pub fn new(name: [u8; 11], attr: Attributes) -> Self {
        let mut entry = Self::new_zeroed();
        entry.name = name;
        entry.attr = attr.bits();
        entry.create_date = DOS_EPOCH_DATE;
        entry.access_date = DOS_EPOCH_DATE;
        entry.modify_date = DOS_EPOCH_DATE;
        entry
    }

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_retain(self.attr)
    }

    pub fn set_attributes(&mut self, attr: Attributes) {
        self.attr = attr.bits();
    }

    pub fn nt_res(&self) -> NtRes {
        NtRes::from_bits_retain(self.nt_res)
    }

    pub fn set_nt_res(&mut self, nt_res: NtRes) {
        self.nt_res = nt_res.bits();
    }

    /// FAT16 has no high cluster word; whatever is stored there is ignored.
    pub fn first_cluster(&self, fat_type: FatType) -> u32 {
        let lo = u32::from(self.cluster_lo);
        match fat_type {
            FatType::Fat16 => lo,
            FatType::Fat32 => (u32::from(self.cluster_hi) << 16) | lo,
        }
    }

    pub fn set_first_cluster(&mut self, cluster: u32, fat_type: FatType) {
        self.cluster_lo = (cluster & 0xFFFF) as u16;
        self.cluster_hi = match fat_type {
            FatType::Fat16 => 0,
            FatType::Fat32 => (cluster >> 16) as u16,
        };
    }

    pub fn to_raw(self) -> RawRecord {
        zerocopy::transmute!(self)
    }
}

/// Long-name entry. The UTF-16 name units are kept as raw bytes because the
/// record is unaligned.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub struct LongEntry {
    pub ord: u8,
    pub name1: [u8; 10],
    pub attr: u8,
    pub kind: u8,
    pub checksum: u8,
    pub name2: [u8; 12],
    pub cluster_lo: u16,
    pub name3: [u8; 4],
}

impl LongEntry {
    pub fn new(ord: u8, checksum: u8, units: &[u16; UNITS_PER_LONG]) -> Self {
        let mut entry = Self::new_zeroed();
        entry.ord = ord;
        entry.attr = Attributes::LONG_NAME.bits();
        entry.checksum = checksum;

        let mut bytes = [0_u8; UNITS_PER_LONG * 2];
        for (chunk, unit) in bytes.chunks_exact_mut(2).zip(units) {
            chunk.copy_from_slice(&unit.to_le_bytes());
        }
        entry.name1.copy_from_slice(&bytes[0..10]);
        entry.name2.copy_from_slice(&bytes[10..22]);
        entry.name3.copy_from_slice(&bytes[22..26]);
        entry
    }

    /// Position of this record in the name, counting from 1.
    pub fn sequence(&self) -> u8 {
        self.ord & LONG_ORD_MASK
    }

    pub fn is_last(&self) -> bool {
        self.ord & LAST_LONG_ENTRY != 0
    }

    pub fn units(&self) -> [u16; UNITS_PER_LONG] {
        let (name1, name2, name3) = (self.name1, self.name2, self.name3);
        let mut units = [0_u16; UNITS_PER_LONG];
        let bytes = name1.iter().chain(&name2).chain(&name3);
        let pairs = bytes.clone().step_by(2).zip(bytes.skip(1).step_by(2));
        for (unit, (&lo, &hi)) in units.iter_mut().zip(pairs) {
            *unit = u16::from_le_bytes([lo, hi]);
        }
        units
    }

    pub fn to_raw(self) -> RawRecord {
        zerocopy::transmute!(self)
    }
}

/// XDE record: POSIX ownership and permission bits of the file whose SFNE
/// immediately precedes it. Shaped like a long-name record so other drivers
/// ignore it.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub struct XdeRecord {
    pub signature: u8,
    pub uid: u32,
    pub gid: u32,
    pub perm: u16,
    pub attr: u8,
    pub kind: u8,
    pub checksum: u8,
    /// Volume GUID bytes 0..12 on the volume record; zero otherwise.
    pub reserved: [u8; 12],
    pub cluster_lo: u16,
    /// Volume GUID bytes 12..16 on the volume record; zero otherwise.
    pub reserved2: [u8; 4],
}

impl XdeRecord {
    /// A per-file record bound to the SFNE with checksum `sfn_checksum`.
    pub fn for_file(uid: u32, gid: u32, perm: u16, sfn_checksum: u8) -> Self {
        let mut record = Self::shaped(XDE_KIND_FILE, uid, gid, perm);
        record.checksum = record.compute_checksum(sfn_checksum);
        record
    }

    /// The volume-wide default record.
    pub fn for_volume(guid: [u8; 16], uid: u32, gid: u32, perm: u16) -> Self {
        let mut record = Self::shaped(XDE_KIND_VOLUME, uid, gid, perm);
        record.reserved.copy_from_slice(&guid[..12]);
        record.reserved2.copy_from_slice(&guid[12..]);
        record.checksum = record.compute_checksum(0);
        record
    }

    fn shaped(kind: u8, uid: u32, gid: u32, perm: u16) -> Self {
        let mut record = Self::new_zeroed();
        record.signature = XDE_SIGNATURE;
        record.uid = uid;
        record.gid = gid;
        record.perm = perm;
        record.attr = Attributes::LONG_NAME.bits();
        record.kind = kind;
        record
    }

    pub fn guid(&self) -> [u8; 16] {
        let (reserved, reserved2) = (self.reserved, self.reserved2);
        let mut guid = [0; 16];
        guid[..12].copy_from_slice(&reserved);
        guid[12..].copy_from_slice(&reserved2);
        guid
    }

    /// Rotate-add over the payload, seeded with the owning SFNE's checksum
    /// (or zero for the volume record, which also covers the GUID).
    pub fn compute_checksum(&self, seed: u8) -> u8 {
        let bytes = self.as_bytes();
        let payload = &bytes[1..11];
        let sum = rotate_add(seed, payload);
        if self.kind == XDE_KIND_VOLUME {
            rotate_add(rotate_add(sum, &bytes[14..26]), &bytes[28..32])
        } else {
            sum
        }
    }

    pub fn checksum_matches(&self, seed: u8) -> bool {
        self.checksum == self.compute_checksum(seed)
    }

    pub fn to_raw(self) -> RawRecord {
        zerocopy::transmute!(self)
    }
}

fn rotate_add(seed: u8, bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(seed, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

/// Checksum of an 11-byte short name, stored in every LFNE of the DE and
/// used to seed the XDE checksum.
pub fn lfn_checksum(name: &[u8; 11]) -> u8 {
    rotate_add(0, name)
}

/// A raw record, classified.
#[derive(Debug, Clone, Copy)]
pub enum Record {
    /// End of directory.
    End,
    /// Deleted record.
    Free,
    Long(LongEntry),
    Short(ShortEntry),
    Xde(XdeRecord),
    VolumeXde(XdeRecord),
    /// Long-name shaped record of some other extension; skipped.
    Foreign,
}

impl Record {
    pub fn classify(raw: &RawRecord) -> Self {
        match raw[0] {
            END_MARKER => return Self::End,
            FREE_MARKER => return Self::Free,
            _ => {}
        }

        let attr = raw[11] & 0x3F;
        if attr != Attributes::LONG_NAME.bits() {
            return Self::Short(zerocopy::transmute!(*raw));
        }

        match (raw[0], raw[12]) {
            (_, 0) => Self::Long(zerocopy::transmute!(*raw)),
            (XDE_SIGNATURE, XDE_KIND_FILE) => Self::Xde(zerocopy::transmute!(*raw)),
            (XDE_SIGNATURE, XDE_KIND_VOLUME) => Self::VolumeXde(zerocopy::transmute!(*raw)),
            _ => Self::Foreign,
        }
    }
}
