//! POSIX tar reader (§4.13): 512-byte block headers, octal ASCII fields,
//! GNU long names and PAX extended records.
//!
//! Grounded on `ext/unarr/tar/{parse-tar,tar}.c`: this reader performs the
//! same header validation and GNU/PAX override handling, but eagerly
//! indexes every entry up front (like [`crate::rar::RarArchive`] and
//! [`crate::zip::ZipArchive`]) instead of the reference's one-entry-at-a-
//! time `tar_parse_entry` recursion, since tar has no solid-stream state to
//! preserve across entries and entries are stored, never compressed.

use chrono::{DateTime, Utc};

use crate::datetime::{filetime_ticks_to_utc, tar_mtime_secs_to_filetime_ticks};
use crate::encoding::{decode_dos_or_utf8, normalize_path_separators};
use crate::error::{Error, FormatError};
use crate::stream::{SeekOrigin, Stream};

const BLOCK_SIZE: usize = 512;

const TYPE_FILE: u8 = b'0';
const TYPE_FILE_OLD: u8 = 0;
const TYPE_DIRECTORY: u8 = b'5';
const TYPE_GNU_LONGNAME: u8 = b'L';
const TYPE_PAX_GLOBAL: u8 = b'g';
const TYPE_PAX_EXTENDED: u8 = b'x';

fn is_zeroed_block(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

fn is_octal_field(data: &[u8]) -> bool {
    data.iter().all(|&b| (b'0'..=b'7').contains(&b) || b == b' ' || b == 0)
}

fn parse_octal(data: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in data {
        if b == b' ' || b == 0 {
            continue;
        }
        if !(b'0'..=b'7').contains(&b) {
            break;
        }
        value = value * 8 + (b - b'0') as u64;
    }
    value
}

fn trim_nul(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == 0) {
        Some(pos) => &data[..pos],
        None => data,
    }
}

fn round_up_block(size: u64) -> u64 {
    (size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64 * BLOCK_SIZE as u64
}

/// One parsed 512-byte header block, before any GNU/PAX override is applied.
struct RawHeader {
    name: String,
    size: u64,
    mtime_ticks: i64,
    filetype: u8,
}

/// `tar_parse_header`: validate the checksum (unsigned sum, falling back to
/// the signed-byte sum with a logged note) and pull out the fields this
/// crate cares about.
fn parse_header_block(block: &[u8]) -> Result<RawHeader, Error> {
    if !is_octal_field(&block[124..136])
        || !is_octal_field(&block[136..148])
        || !is_octal_field(&block[148..156])
    {
        return Err(FormatError::InvalidTarField.into());
    }

    let size = parse_octal(&block[124..136]);
    let mtime_secs = parse_octal(&block[136..148]);
    let declared_checksum = parse_octal(&block[148..156]) as u32;
    let mut filetype = block[156];

    if filetype == TYPE_FILE_OLD {
        let name_field = &block[0..100];
        let mut i = 100usize;
        while i > 0 && name_field[i - 1] == 0 {
            i -= 1;
        }
        if i > 0 && name_field[i - 1] == b'/' {
            filetype = TYPE_DIRECTORY;
        }
    }

    let is_ustar = &block[257..265] == b"ustar\x0000" && &block[508..512] != b"tar\0";

    let mut unsigned_sum: u32 = 0;
    let mut signed_sum: i32 = 0;
    for (i, &b) in block.iter().enumerate() {
        let b = if (148..156).contains(&i) { b' ' } else { b };
        unsigned_sum = unsigned_sum.wrapping_add(b as u32);
        signed_sum = signed_sum.wrapping_add(b as i8 as i32);
    }

    let checksum = if unsigned_sum != signed_sum as u32 && declared_checksum == signed_sum as u32 {
        tracing::warn!("TAR checksum was calculated using signed data");
        signed_sum as u32
    } else {
        unsigned_sum
    };
    if checksum != declared_checksum {
        return Err(FormatError::BadTarChecksum.into());
    }

    let name = if is_ustar && block[345] != 0 {
        let prefix = trim_nul(&block[345..345 + 156]);
        let name = trim_nul(&block[0..100]);
        let mut s = decode_dos_or_utf8(prefix);
        s.push('/');
        s.push_str(&decode_dos_or_utf8(name));
        s
    } else {
        decode_dos_or_utf8(trim_nul(&block[0..100]))
    };

    Ok(RawHeader {
        name,
        size,
        mtime_ticks: tar_mtime_secs_to_filetime_ticks(mtime_secs as f64),
        filetype,
    })
}

/// Probe: does the first block parse as a tar header with a valid
/// checksum? Mirrors `ar_open_tar_archive`'s own probe (`tar_parse_header`
/// succeeding with a nonzero checksum) — an all-zero block, which is what a
/// truncated or non-tar stream starts with, always fails the checksum
/// comparison in [`parse_header_block`], so a plain `is_ok()` already
/// matches the reference's "and `tar->entry.checksum` is nonzero" check.
pub(crate) fn sniff(first_block: &[u8]) -> bool {
    first_block.len() == BLOCK_SIZE && parse_header_block(first_block).is_ok()
}

/// A single file entry, as returned by [`TarArchive::current_entry`].
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub name: String,
    pub offset: u64,
    pub uncompressed_size: u64,
    pub modified: DateTime<Utc>,
    index: usize,
}

impl TarEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }
}

#[derive(Debug, Clone)]
struct TarEntryMeta {
    name: String,
    header_offset: u64,
    data_offset: u64,
    size: u64,
    mtime_ticks: i64,
}

/// Pending GNU-longname / PAX-extended overrides, applied to the next
/// "real" file header encountered.
#[derive(Default)]
struct Pending {
    name: Option<String>,
    mtime_ticks: Option<i64>,
    size: Option<u64>,
}

/// A POSIX tar archive opened over a seekable [`Stream`].
pub struct TarArchive {
    buf: Vec<u8>,
    entries: Vec<TarEntryMeta>,
    current: Option<usize>,
    extract_cursor: usize,
    at_eof: bool,
}

impl TarArchive {
    /// Read the whole stream, then walk every 512-byte header block,
    /// applying GNU longname / PAX extended overrides to the following
    /// entry and skipping directory / PAX-global records, mirroring
    /// `tar_parse_entry`'s dispatch on `tar->entry.filetype`.
    pub fn open(mut stream: Box<dyn Stream>) -> Result<Self, Error> {
        let size = stream.len()?;
        stream.seek(0, SeekOrigin::Start)?;
        let buf = stream.read_vec(size as usize)?;

        let mut entries = Vec::new();
        let mut pending = Pending::default();
        let mut last_seen_dir: Option<u64> = None;
        let mut offset: u64 = 0;

        loop {
            if offset as usize + BLOCK_SIZE > buf.len() {
                break;
            }
            let block = &buf[offset as usize..offset as usize + BLOCK_SIZE];
            if is_zeroed_block(block) {
                break;
            }

            let header = parse_header_block(block)?;
            let data_offset = offset + BLOCK_SIZE as u64;
            let data_end = data_offset
                .checked_add(header.size)
                .ok_or(FormatError::InvalidTarField)?;
            if data_end as usize > buf.len() {
                return Err(FormatError::InvalidTarField.into());
            }
            let next_offset = data_offset + round_up_block(header.size);

            let shadowed_by_dir = last_seen_dir.is_some_and(|d| d > offset);

            match header.filetype {
                TYPE_DIRECTORY => {
                    tracing::debug!(name = %header.name, "skipping TAR directory entry");
                    last_seen_dir = Some(offset);
                    pending = Pending::default();
                }
                TYPE_PAX_GLOBAL => {
                    tracing::debug!("skipping PAX global extended header record");
                }
                TYPE_PAX_EXTENDED => {
                    if !shadowed_by_dir {
                        let body = &buf[data_offset as usize..data_end as usize];
                        apply_pax_records(body, &mut pending)?;
                    }
                }
                TYPE_GNU_LONGNAME => {
                    if !shadowed_by_dir && pending.name.is_none() {
                        let body = &buf[data_offset as usize..data_end as usize];
                        let mut name = decode_dos_or_utf8(trim_nul(body));
                        normalize_path_separators(&mut name);
                        pending.name = Some(name);
                    }
                }
                _ => {
                    let mut name = pending.name.take().unwrap_or(header.name);
                    normalize_path_separators(&mut name);
                    let size = pending.size.take().unwrap_or(header.size);
                    let mtime_ticks = pending.mtime_ticks.take().unwrap_or(header.mtime_ticks);
                    pending = Pending::default();
                    entries.push(TarEntryMeta {
                        name,
                        header_offset: offset,
                        data_offset,
                        size,
                        mtime_ticks,
                    });
                }
            }

            offset = next_offset;
        }

        Ok(Self {
            buf,
            entries,
            current: None,
            extract_cursor: 0,
            at_eof: false,
        })
    }

    pub fn at_eof(&self) -> bool {
        self.at_eof
    }

    fn entry_view(&self, index: usize) -> TarEntry {
        let meta = &self.entries[index];
        TarEntry {
            name: meta.name.clone(),
            offset: meta.header_offset,
            uncompressed_size: meta.size,
            modified: filetime_ticks_to_utc(meta.mtime_ticks).unwrap_or_default(),
            index,
        }
    }

    pub fn parse_next_entry(&mut self) -> Option<TarEntry> {
        let next = self.current.map_or(0, |i| i + 1);
        if next >= self.entries.len() {
            self.at_eof = true;
            self.current = None;
            return None;
        }
        self.current = Some(next);
        self.extract_cursor = 0;
        self.at_eof = false;
        Some(self.entry_view(next))
    }

    pub fn parse_entry_at(&mut self, offset: u64) -> Option<TarEntry> {
        let index = self.entries.iter().position(|e| e.header_offset == offset)?;
        self.current = Some(index);
        self.extract_cursor = 0;
        self.at_eof = false;
        Some(self.entry_view(index))
    }

    pub fn parse_entry_for(&mut self, name: &str) -> Option<TarEntry> {
        let index = self.entries.iter().position(|e| e.name == name)?;
        self.current = Some(index);
        self.extract_cursor = 0;
        self.at_eof = false;
        Some(self.entry_view(index))
    }

    pub fn current_entry(&self) -> Option<TarEntry> {
        self.current.map(|i| self.entry_view(i))
    }

    /// Read exactly `dst.len()` bytes of the current entry, starting where
    /// the previous call left off. Tar entries are never compressed, so
    /// this is a direct slice of the whole-archive buffer; there's no
    /// per-entry content checksum to verify (§8: "CRC is 0" only applies to
    /// the zero-size boundary case, tar carries no data CRC at all).
    pub fn extract(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        let index = self
            .current
            .ok_or(FormatError::InvalidTarField)?;
        let meta = &self.entries[index];
        let start = meta.data_offset as usize + self.extract_cursor;
        let end = (start + dst.len()).min((meta.data_offset + meta.size) as usize);
        let n = end - start;
        dst[..n].copy_from_slice(&self.buf[start..end]);
        self.extract_cursor += n;
        if n < dst.len() {
            return Err(FormatError::InvalidTarField.into());
        }
        Ok(())
    }
}

/// `tar_handle_pax_extended`'s record parser: `"%d %s=%s\n"`-formatted
/// length-prefixed lines.
fn apply_pax_records(data: &[u8], pending: &mut Pending) -> Result<(), Error> {
    let mut line = 0usize;
    while line < data.len() {
        let rest = &data[line..];
        let eq = match rest.iter().position(|&b| b == b'=') {
            Some(p) => p,
            None => {
                tracing::warn!("invalid PAX extended header record");
                break;
            }
        };
        if eq == 0 || !(b'1'..=b'9').contains(&rest[0]) {
            tracing::warn!("invalid PAX extended header record");
            break;
        }
        // `strtoul` parses only the leading decimal run of `rest` (up to
        // the first non-digit, which must be the separating space); `eq` is
        // the record's overall key=value separator, found independently.
        let len_str = std::str::from_utf8(&rest[..eq]).map_err(|_| FormatError::InvalidPaxRecord)?;
        let digits_end = len_str.find(|c: char| !c.is_ascii_digit()).unwrap_or(len_str.len());
        let length: usize = len_str[..digits_end]
            .parse()
            .map_err(|_| FormatError::InvalidPaxRecord)?;
        let value_start = eq + 1;

        if length == 0
            || length > rest.len()
            || length <= value_start
            || rest[length - 1] != b'\n'
            || rest.get(digits_end) != Some(&b' ')
        {
            tracing::warn!("invalid PAX extended header record");
            break;
        }

        let key = std::str::from_utf8(&rest[digits_end + 1..eq]).unwrap_or("");
        let value = &rest[value_start..length - 1];

        match key {
            "path" => {
                let mut name = decode_dos_or_utf8(value);
                normalize_path_separators(&mut name);
                pending.name = Some(name);
            }
            "mtime" => {
                if let Ok(s) = std::str::from_utf8(value) {
                    if let Ok(secs) = s.trim().parse::<f64>() {
                        pending.mtime_ticks = Some(tar_mtime_secs_to_filetime_ticks(secs));
                    }
                }
            }
            "size" => {
                if let Ok(s) = std::str::from_utf8(value) {
                    if let Ok(size) = s.trim().parse::<u64>() {
                        pending.size = Some(size);
                    }
                }
            }
            other => tracing::debug!(key = other, "skipping PAX extended header value"),
        }

        line += length;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn header_block(name: &str, size: u64, filetype: u8) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        let name_bytes = name.as_bytes();
        block[..name_bytes.len()].copy_from_slice(name_bytes);
        let size_octal = format!("{size:011o}\0");
        block[124..124 + size_octal.len()].copy_from_slice(size_octal.as_bytes());
        let mtime_octal = format!("{:011o}\0", 0);
        block[136..136 + mtime_octal.len()].copy_from_slice(mtime_octal.as_bytes());
        block[156] = filetype;
        // checksum field starts as spaces, then gets filled in below.
        block[148..156].copy_from_slice(b"        ");
        let mut sum: u32 = 0;
        for &b in block.iter() {
            sum = sum.wrapping_add(b as u32);
        }
        let checksum = format!("{sum:06o}\0 ");
        block[148..148 + checksum.len()].copy_from_slice(checksum.as_bytes());
        block
    }

    #[test]
    fn single_file_entry_round_trips() {
        let mut data = Vec::new();
        data.extend_from_slice(&header_block("hello.txt", 5, TYPE_FILE));
        let mut body = b"world".to_vec();
        body.resize(BLOCK_SIZE, 0);
        data.extend_from_slice(&body);
        data.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);

        let stream = Box::new(MemoryStream::new(data));
        let mut archive = TarArchive::open(stream).unwrap();
        let entry = archive.parse_next_entry().unwrap();
        assert_eq!(entry.name(), "hello.txt");
        assert_eq!(entry.uncompressed_size(), 5);

        let mut out = vec![0u8; 5];
        archive.extract(&mut out).unwrap();
        assert_eq!(&out, b"world");

        assert!(archive.parse_next_entry().is_none());
        assert!(archive.at_eof());
    }

    #[test]
    fn gnu_long_name_overrides_short_name() {
        let long_name = "a".repeat(200);
        let mut data = Vec::new();
        data.extend_from_slice(&header_block("././@LongLink", long_name.len() as u64, TYPE_GNU_LONGNAME));
        let mut name_body = long_name.clone().into_bytes();
        name_body.resize(round_up_block(name_body.len() as u64) as usize, 0);
        data.extend_from_slice(&name_body);
        data.extend_from_slice(&header_block("short.txt", 0, TYPE_FILE));
        data.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);

        let stream = Box::new(MemoryStream::new(data));
        let mut archive = TarArchive::open(stream).unwrap();
        let entry = archive.parse_next_entry().unwrap();
        assert_eq!(entry.name(), long_name);
    }

    #[test]
    fn pax_extended_path_overrides_short_name() {
        let record = b"26 path=long/pax/name.txt\n";
        assert_eq!(record.len(), 26);

        let mut data = Vec::new();
        data.extend_from_slice(&header_block("PaxHeaders/short.txt", record.len() as u64, TYPE_PAX_EXTENDED));
        let mut body = record.to_vec();
        body.resize(BLOCK_SIZE, 0);
        data.extend_from_slice(&body);
        data.extend_from_slice(&header_block("short.txt", 0, TYPE_FILE));
        data.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);

        let stream = Box::new(MemoryStream::new(data));
        let mut archive = TarArchive::open(stream).unwrap();
        let entry = archive.parse_next_entry().unwrap();
        assert_eq!(entry.name(), "long/pax/name.txt");
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut block = header_block("x", 0, TYPE_FILE);
        // Flip one checksum digit to a different (still-octal) value so the
        // field stays parseable but no longer matches the computed sum.
        block[153] = b'0' + ((block[153] - b'0') ^ 1);
        let mut data = block.to_vec();
        data.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);
        let stream = Box::new(MemoryStream::new(data));
        assert!(matches!(
            TarArchive::open(stream),
            Err(Error::Format(FormatError::BadTarChecksum))
        ));
    }
}
