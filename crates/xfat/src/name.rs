//! File names: the comparison contract, short (8.3) names, and long-name
//! (LFN) encoding and decoding.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::dirent::{
    lfn_checksum, LongEntry, RawRecord, KANJI_LEAD, LAST_LONG_ENTRY, MAX_LONG_RECORDS,
    UNITS_PER_LONG,
};
use crate::{FsError, FsResult};

/// Longest long name, in UTF-16 units.
pub const MAX_NAME_UNITS: usize = 255;

/// How names are compared and hashed. Hosts with a real charset layer plug
/// in their own; the core ships an ASCII case-folding and an exact variant.
pub trait NameCompare: Send + Sync {
    fn eq(&self, a: &str, b: &str) -> bool;

    /// Must agree with `eq`: equal names hash equally.
    fn hash(&self, name: &str) -> u32;
}

/// Case-insensitive for ASCII letters, exact for everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiFold;

impl NameCompare for AsciiFold {
    fn eq(&self, a: &str, b: &str) -> bool {
        a.eq_ignore_ascii_case(b)
    }

    fn hash(&self, name: &str) -> u32 {
        fnv1a(name.bytes().map(|b| b.to_ascii_uppercase()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Exact;

impl NameCompare for Exact {
    fn eq(&self, a: &str, b: &str) -> bool {
        a == b
    }

    fn hash(&self, name: &str) -> u32 {
        fnv1a(name.bytes())
    }
}

fn fnv1a(bytes: impl Iterator<Item = u8>) -> u32 {
    bytes.fold(0x811C_9DC5, |hash, b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

/// Characters that may not appear in a long name.
const ILLEGAL_LONG: &[u8] = b"\"*/:<>?\\|";

/// Characters that may additionally not appear in a short name.
const ILLEGAL_SHORT_EXTRA: &[u8] = b"+,.;=[] ";

fn is_legal_short_byte(b: u8) -> bool {
    b > 0x20 && b < 0x7F && !ILLEGAL_LONG.contains(&b) && !ILLEGAL_SHORT_EXTRA.contains(&b)
}

/// Checks a long name and returns it as UTF-16 units.
pub fn validate_long_name(name: &str) -> FsResult<Vec<u16>> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::Invalid);
    }
    if name.chars().any(|c| (c as u32) < 0x20 || (c.is_ascii() && ILLEGAL_LONG.contains(&(c as u8)))) {
        return Err(FsError::Invalid);
    }
    if name.ends_with(' ') || name.ends_with('.') {
        return Err(FsError::Invalid);
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > MAX_NAME_UNITS {
        return Err(FsError::NameTooLong);
    }
    Ok(units)
}

/// An 11-byte space-padded short name, base then extension.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortName(pub [u8; 11]);

impl ShortName {
    pub const DOT: Self = Self(*b".          ");
    pub const DOTDOT: Self = Self(*b"..         ");

    /// Parses `name` if it already is a valid upper-case 8.3 name, in which
    /// case no long-name records are needed to store it.
    pub fn parse_exact(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        let (base, ext) = match name.rfind('.') {
            Some(dot) => (&bytes[..dot], &bytes[dot + 1..]),
            None => (bytes, &[][..]),
        };
        if base.is_empty() || base.len() > 8 || ext.len() > 3 {
            return None;
        }
        if name.contains('.') && ext.is_empty() {
            return None;
        }
        let legal = |b: &u8| is_legal_short_byte(*b) && !b.is_ascii_lowercase();
        if !base.iter().all(legal) || !ext.iter().all(legal) {
            return None;
        }

        let mut raw = [b' '; 11];
        raw[..base.len()].copy_from_slice(base);
        raw[8..8 + ext.len()].copy_from_slice(ext);
        if raw[0] == 0xE5 {
            raw[0] = KANJI_LEAD;
        }
        Some(Self(raw))
    }

    /// The numeric-tail-free short name derived from a long name: upper
    /// case, spaces and extra dots dropped, other illegal characters turned
    /// into `_`.
    pub fn basis(long: &str) -> Self {
        let trimmed = long.trim_start_matches(&['.', ' '][..]);
        let (base, ext) = match trimmed.rfind('.') {
            Some(dot) => (&trimmed[..dot], &trimmed[dot + 1..]),
            None => (trimmed, ""),
        };

        let convert = |c: char| -> Option<u8> {
            if c == ' ' || c == '.' {
                return None;
            }
            let b = if c.is_ascii() { c.to_ascii_uppercase() as u8 } else { b'_' };
            Some(if is_legal_short_byte(b) { b } else { b'_' })
        };

        let mut raw = [b' '; 11];
        let mut len = 0;
        for b in base.chars().filter_map(convert).take(8) {
            raw[len] = b;
            len += 1;
        }
        if len == 0 {
            raw[0] = b'_';
        }
        for (slot, b) in raw[8..].iter_mut().zip(ext.chars().filter_map(convert)) {
            *slot = b;
        }
        Self(raw)
    }

    /// This name with a `~N` tail, truncating the base to make room.
    pub fn with_tail(&self, n: u32) -> Self {
        let mut digits = [0_u8; 10];
        let mut count = 0;
        let mut value = n;
        loop {
            digits[count] = b'0' + (value % 10) as u8;
            count += 1;
            value /= 10;
            if value == 0 {
                break;
            }
        }

        let base_len = self.0[..8].iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        let keep = base_len.min(8 - count - 1);
        let mut raw = self.0;
        raw[keep] = b'~';
        for i in 0..count {
            raw[keep + 1 + i] = digits[count - 1 - i];
        }
        for slot in &mut raw[keep + 1 + count..8] {
            *slot = b' ';
        }
        Self(raw)
    }

    pub fn checksum(&self) -> u8 {
        lfn_checksum(&self.0)
    }

    pub fn is_dot_entry(&self) -> bool {
        *self == Self::DOT || *self == Self::DOTDOT
    }

    /// Upper-case extension bytes without padding.
    pub fn extension(&self) -> &[u8] {
        let ext = &self.0[8..];
        let len = ext.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        &ext[..len]
    }

    /// The name as a host would print it: `BASE.EXT`.
    pub fn display_name(&self) -> String {
        let mut raw = self.0;
        if raw[0] == KANJI_LEAD {
            raw[0] = 0xE5;
        }
        let to_char = |&b: &u8| if b.is_ascii() { b as char } else { '_' };
        let base_len = raw[..8].iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        let mut name: String = raw[..base_len].iter().map(to_char).collect();
        let ext = self.extension();
        if !ext.is_empty() {
            name.push('.');
            name.extend(ext.iter().map(to_char));
        }
        name
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortName({:?})", self.display_name())
    }
}

/// Converts a volume label to its 11-byte on-disk form.
pub fn label_bytes(label: &str) -> FsResult<[u8; 11]> {
    let label = label.trim_end();
    if label.is_empty() || label.len() > 11 || !label.is_ascii() {
        return Err(FsError::Invalid);
    }
    let mut raw = [b' '; 11];
    for (slot, b) in raw.iter_mut().zip(label.bytes()) {
        let b = b.to_ascii_uppercase();
        if b != b' ' && !is_legal_short_byte(b) {
            return Err(FsError::Invalid);
        }
        *slot = b;
    }
    Ok(raw)
}

pub fn label_string(raw: &[u8; 11]) -> String {
    let len = raw.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    raw[..len]
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '_' })
        .collect()
}

/// Builds the long-name records for `units` in on-disk order: the record
/// holding the end of the name comes first.
pub fn long_records(units: &[u16], checksum: u8) -> Vec<RawRecord> {
    let count = units.len().div_ceil(UNITS_PER_LONG);
    let mut records = Vec::with_capacity(count);
    for seq in (1..=count).rev() {
        let start = (seq - 1) * UNITS_PER_LONG;
        let mut chunk = [0xFFFF_u16; UNITS_PER_LONG];
        for (i, slot) in chunk.iter_mut().enumerate() {
            match units.get(start + i) {
                Some(&unit) => *slot = unit,
                None => {
                    // NUL-terminate, then pad with 0xFFFF.
                    *slot = 0;
                    break;
                }
            }
        }
        let mut ord = seq as u8;
        if seq == count {
            ord |= LAST_LONG_ENTRY;
        }
        records.push(LongEntry::new(ord, checksum, &chunk).to_raw());
    }
    records
}

/// What a run of long-name records turned into once its SFNE was reached.
#[derive(Debug, PartialEq, Eq)]
pub enum LongName {
    /// No long-name records preceded the SFNE.
    Absent,
    Valid(String),
    /// Records were present but incomplete or bound to a different SFNE.
    Discarded,
}

/// Collects long-name records while scanning a directory.
#[derive(Debug)]
pub(crate) struct LfnAccumulator {
    units: [u16; MAX_LONG_RECORDS as usize * UNITS_PER_LONG],
    total: u8,
    expected: u8,
    checksum: u8,
    active: bool,
    broken: bool,
}

impl LfnAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            units: [0; MAX_LONG_RECORDS as usize * UNITS_PER_LONG],
            total: 0,
            expected: 0,
            checksum: 0,
            active: false,
            broken: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.active = false;
        self.broken = false;
        self.total = 0;
    }

    /// Number of long-name records collected so far.
    pub(crate) fn records(&self) -> u8 {
        if self.active {
            self.total - self.expected
        } else {
            0
        }
    }

    /// Feeds the next record. Returns `false` if the record breaks the run;
    /// the caller then starts over.
    pub(crate) fn push(&mut self, entry: &LongEntry) -> bool {
        let seq = entry.sequence();
        if entry.is_last() {
            if seq == 0 || seq > MAX_LONG_RECORDS {
                self.reset();
                return false;
            }
            self.active = true;
            self.broken = false;
            self.total = seq;
            self.expected = seq;
            self.checksum = entry.checksum;
        } else if !self.active || self.broken || seq != self.expected || entry.checksum != self.checksum {
            self.reset();
            return false;
        }

        let start = usize::from(seq - 1) * UNITS_PER_LONG;
        self.units[start..start + UNITS_PER_LONG].copy_from_slice(&entry.units());
        self.expected -= 1;
        true
    }

    /// Binds the collected records to the SFNE whose checksum is given.
    pub(crate) fn finish(&mut self, sfn_checksum: u8) -> LongName {
        if !self.active {
            return LongName::Absent;
        }
        let complete = self.expected == 0;
        let matches = self.checksum == sfn_checksum;
        let total = usize::from(self.total) * UNITS_PER_LONG;
        let result = if complete && matches {
            let len = self.units[..total]
                .iter()
                .position(|&u| u == 0)
                .unwrap_or(total);
            LongName::Valid(
                char::decode_utf16(self.units[..len].iter().copied())
                    .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect(),
            )
        } else {
            LongName::Discarded
        };
        self.reset();
        result
    }
}
