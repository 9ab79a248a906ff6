//! Top-level ZIP archive and entry reader.
//!
//! Grounded on `fsm/archive.rs`'s `ArchiveFsm` (EOCD scan, ZIP64 locator
//! chain, central directory walk, `chardetng`-based encoding detection) and
//! `parse/{central_directory_file_header,local_headers,eocd}.rs`'s parsers,
//! but driven synchronously over a whole-file buffer instead of the
//! teacher's incremental `wants_read`/`process` state machine — the same
//! trade-off the RAR reader in [`crate::rar`] makes, for the same reason
//! (no caller-facing async I/O surface to preserve).
//!
//! Entry data is decompressed on demand, one entry at a time, into an owned
//! buffer served by `extract` (see [`ZipArchive::extract`]), mirroring
//! [`crate::rar::RarArchive`]'s `cached_entry_bytes` pattern.

mod decompress;

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use winnow::{Parser, Partial};

use crate::config::{CrcPolicy, OpenOptions};
use crate::error::{Error, FormatError};
use crate::parse::{
    CentralDirectoryFileHeader, Encoding, EndOfCentralDirectory, EndOfCentralDirectory64Locator,
    EndOfCentralDirectory64Record, EndOfCentralDirectoryRecord, Entry, LocalFileHeader, Located,
    Method, Mode,
};
use crate::stream::{SeekOrigin, Stream};

/// A single ZIP entry, as returned by [`ZipArchive::parse_next_entry`] /
/// [`ZipArchive::current_entry`]. A thin view over the richer
/// [`crate::parse::Entry`] kept internally, mirroring
/// [`crate::rar::RarEntry`]'s shape.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub name: String,
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub method: Method,
    pub crc32: u32,
    pub modified: DateTime<Utc>,
    pub mode: Mode,
    index: usize,
}

/// A ZIP archive opened over a seekable [`Stream`].
pub struct ZipArchive {
    buf: Vec<u8>,
    entries: Vec<Entry>,
    comment: String,
    encoding: Encoding,
    options: OpenOptions,
    current: Option<usize>,
    at_eof: bool,
    /// Full decoded bytes of the current entry plus a read cursor, filled
    /// in lazily by the first `extract` call on that entry.
    cached_entry_bytes: Option<(Option<usize>, Vec<u8>, usize)>,
}

impl ZipArchive {
    /// Read the whole stream into memory, locate the end-of-central-directory
    /// record, walk the central directory, and fall back to a forward scan
    /// for local file header signatures if the central directory can't be
    /// read (truncated archive, corrupted EOCD — see §4.9's degrade path).
    pub fn open(mut stream: Box<dyn Stream>, options: OpenOptions) -> Result<Self, Error> {
        let size = stream.len()?;
        stream.seek(0, SeekOrigin::Start)?;
        let buf = stream.read_vec(size as usize)?;

        let (entries, comment, encoding) = match Self::read_central_directory(&buf, size) {
            Ok(result) => result,
            Err(primary_err) => match Self::scan_local_headers(&buf) {
                Ok(result) => result,
                Err(_) => return Err(primary_err),
            },
        };

        Ok(Self {
            buf,
            entries,
            comment,
            encoding,
            options,
            current: None,
            at_eof: false,
            cached_entry_bytes: None,
        })
    }

    fn read_central_directory(
        buf: &[u8],
        size: u64,
    ) -> Result<(Vec<Entry>, String, Encoding), Error> {
        let haystack_size = (65 * 1024u64).min(size);
        let haystack_start = size - haystack_size;
        let haystack = &buf[haystack_start as usize..];

        let located = EndOfCentralDirectoryRecord::find_in_block(haystack)
            .ok_or(FormatError::DirectoryEndSignatureNotFound)?;
        let eocdr = Located {
            offset: haystack_start + located.offset,
            inner: located.inner,
        };

        let dir64 = if eocdr.offset >= EndOfCentralDirectory64Locator::LENGTH as u64 {
            let locator_offset = eocdr.offset - EndOfCentralDirectory64Locator::LENGTH as u64;
            let mut input = Partial::new(&buf[locator_offset as usize..]);
            match EndOfCentralDirectory64Locator::parser.parse_next(&mut input) {
                Ok(locator) => {
                    let start = locator.directory_offset as usize;
                    let mut input64 = Partial::new(
                        buf.get(start..)
                            .ok_or(FormatError::Directory64EndRecordInvalid)?,
                    );
                    let eocdr64 = EndOfCentralDirectory64Record::parser
                        .parse_next(&mut input64)
                        .map_err(|_| FormatError::Directory64EndRecordInvalid)?;
                    Some(Located {
                        offset: locator.directory_offset,
                        inner: eocdr64,
                    })
                }
                Err(_) => None,
            }
        } else {
            None
        };

        let eocd = EndOfCentralDirectory::new(size, eocdr, dir64)?;

        let dir_start = eocd.directory_offset() as usize;
        let dir_slice = buf
            .get(dir_start..)
            .ok_or(FormatError::DirectoryOffsetPointsOutsideFile)?;

        let mut input = Partial::new(dir_slice);
        let mut headers = Vec::new();
        while !input.is_empty() {
            match CentralDirectoryFileHeader::parser.parse_next(&mut input) {
                Ok(h) => headers.push(h),
                Err(_) => break,
            }
        }

        let expected = eocd.directory_records() as u16;
        let actual = headers.len() as u16;
        if expected != actual {
            return Err(FormatError::InvalidCentralRecord {
                expected: eocd.directory_records(),
                actual: headers.len() as u64,
            }
            .into());
        }

        let encoding = detect_encoding(&headers);
        let global_offset = eocd.global_offset as u64;

        let entries: Result<Vec<Entry>, Error> = headers
            .iter()
            .map(|h| h.as_entry(encoding, global_offset))
            .collect();
        let entries = entries?;

        let comment_bytes = eocd.comment();
        let comment = if comment_bytes.is_empty() {
            String::new()
        } else {
            encoding.decode(comment_bytes)?
        };

        Ok((entries, comment, encoding))
    }

    /// §4.9's degrade path: scan forward from offset 0 for local file header
    /// signatures, building entries directly from them (no central-directory
    /// metadata — no global comment, uid/gid, or extra timestamps).
    fn scan_local_headers(buf: &[u8]) -> Result<(Vec<Entry>, String, Encoding), Error> {
        let mut entries = Vec::new();
        let mut offset = 0usize;

        while offset + 4 <= buf.len() {
            if &buf[offset..offset + 4] != LocalFileHeader::SIGNATURE.as_bytes() {
                offset += 1;
                continue;
            }

            let mut input = Partial::new(&buf[offset..]);
            let len_before = input.len();
            match LocalFileHeader::parser.parse_next(&mut input) {
                Ok(lfh) => {
                    let consumed = len_before - input.len();
                    let data_start = offset as u64 + consumed as u64;
                    let mut entry = lfh.as_entry()?;
                    entry.header_offset = offset as u64;
                    offset = (data_start + entry.compressed_size) as usize;
                    entries.push(entry);
                }
                Err(_) => {
                    offset += 1;
                }
            }
        }

        if entries.is_empty() {
            return Err(FormatError::DirectoryEndSignatureNotFound.into());
        }
        Ok((entries, String::new(), Encoding::Utf8))
    }

    /// True once `parse_next_entry` has cleanly run past the last entry.
    pub fn at_eof(&self) -> bool {
        self.at_eof
    }

    /// Returns the detected character encoding for text fields in this
    /// archive (names, comments).
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn entry_view(&self, index: usize) -> ZipEntry {
        let e = &self.entries[index];
        ZipEntry {
            name: e.name.clone(),
            offset: e.header_offset,
            compressed_size: e.compressed_size,
            uncompressed_size: e.uncompressed_size,
            method: e.method,
            crc32: e.crc32,
            modified: e.modified,
            mode: e.mode,
            index,
        }
    }

    /// Advance to the next entry in central-directory order.
    pub fn parse_next_entry(&mut self) -> Option<ZipEntry> {
        let next = self.current.map_or(0, |i| i + 1);
        if next >= self.entries.len() {
            self.at_eof = true;
            self.current = None;
            return None;
        }
        self.current = Some(next);
        self.at_eof = false;
        Some(self.entry_view(next))
    }

    /// Random access by the entry's local-header offset (as returned by
    /// [`ZipEntry::offset`] via the `offset` field).
    pub fn parse_entry_at(&mut self, offset: u64) -> Option<ZipEntry> {
        let index = self.entries.iter().position(|e| e.header_offset == offset)?;
        self.current = Some(index);
        self.at_eof = false;
        Some(self.entry_view(index))
    }

    /// Linear search by name.
    pub fn parse_entry_for(&mut self, name: &str) -> Option<ZipEntry> {
        let index = self.entries.iter().position(|e| e.name == name)?;
        self.current = Some(index);
        self.at_eof = false;
        Some(self.entry_view(index))
    }

    /// The currently selected entry, if any.
    pub fn current_entry(&self) -> Option<ZipEntry> {
        self.current.map(|i| self.entry_view(i))
    }

    /// Copy up to `dst.len()` bytes of this archive's global comment.
    pub fn global_comment(&self, dst: &mut [u8]) -> usize {
        let bytes = self.comment.as_bytes();
        let n = bytes.len().min(dst.len());
        dst[..n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Find the exact start of entry `index`'s compressed data by parsing
    /// its local file header, whose extra-field length may differ from the
    /// one recorded in the central directory.
    fn compressed_data(&self, index: usize) -> Result<&[u8], Error> {
        let entry = &self.entries[index];
        let start = entry.header_offset as usize;
        let header_slice = self
            .buf
            .get(start..)
            .ok_or(FormatError::InvalidHeaderOffset)?;

        let mut input = Partial::new(header_slice);
        let len_before = input.len();
        LocalFileHeader::parser
            .parse_next(&mut input)
            .map_err(|_| FormatError::InvalidLocalHeader)?;
        let consumed = len_before - input.len();

        let data_start = start + consumed;
        let data_end = data_start + entry.compressed_size as usize;
        self.buf
            .get(data_start..data_end)
            .ok_or_else(|| FormatError::WrongSize {
                expected: entry.compressed_size,
                actual: (self.buf.len().saturating_sub(data_start)) as u64,
            }.into())
    }

    /// Decompress the current entry and check its CRC, returning the full
    /// uncompressed bytes. The public `extract` call is a cursor over this.
    fn full_entry_bytes(&mut self) -> Result<Vec<u8>, Error> {
        let index = self.current.ok_or(FormatError::InvalidHeaderOffset)?;
        let entry = self.entries[index].clone();

        let compressed = self.compressed_data(index)?;
        let bytes = decompress::decompress_entry(
            entry.method,
            entry.flags,
            compressed,
            entry.uncompressed_size,
        )?;

        let actual_crc = crc32fast::hash(&bytes);
        if actual_crc != entry.crc32 {
            match self.options.crc_policy {
                CrcPolicy::Strict => {
                    return Err(Error::BadCrc {
                        expected: entry.crc32,
                        actual: actual_crc,
                    })
                }
                CrcPolicy::WarnOnly => {
                    tracing::warn!(expected_crc = entry.crc32, actual_crc, "ZIP entry CRC mismatch");
                }
            }
        }
        Ok(bytes)
    }

    /// Read exactly `dst.len()` bytes of the current entry's uncompressed
    /// data, starting where the previous `extract` call on this entry left
    /// off.
    pub fn extract(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        if self.cached_entry_bytes.as_ref().map(|c| c.0) != Some(self.current) {
            let bytes = self.full_entry_bytes()?;
            self.cached_entry_bytes = Some((self.current, bytes, 0));
        }
        let (_, bytes, cursor) = self.cached_entry_bytes.as_mut().unwrap();
        let end = (*cursor + dst.len()).min(bytes.len());
        let n = end - *cursor;
        dst[..n].copy_from_slice(&bytes[*cursor..end]);
        *cursor = end;
        if n < dst.len() {
            return Err(FormatError::WrongSize {
                expected: dst.len() as u64,
                actual: n as u64,
            }
            .into());
        }
        Ok(())
    }
}

impl ZipEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    pub fn is_directory(&self) -> bool {
        self.mode.has(Mode::DIR)
    }
}

/// `fsm/archive.rs`'s `chardetng`-based encoding detection: feed up to 4096
/// bytes of non-UTF8-flagged names/comments to the detector, then
/// disambiguate a Shift-JIS guess from the common CP437-misdetected-as-
/// Shift-JIS case by checking for box-drawing-range bytes that never appear
/// in legitimate CP437 file names.
fn detect_encoding(headers: &[CentralDirectoryFileHeader<'_>]) -> Encoding {
    let mut detector = chardetng::EncodingDetector::new();
    let mut all_utf8 = true;
    let mut suspicious_for_cp437 = false;

    {
        let max_feed = 4096usize;
        let mut total_fed = 0usize;
        let mut feed = |slice: &Cow<'_, [u8]>| -> bool {
            detector.feed(slice, false);
            for b in slice.iter() {
                if (0xB0..=0xDF).contains(b) {
                    suspicious_for_cp437 = true;
                }
            }
            total_fed += slice.len();
            total_fed < max_feed
        };

        'recognize: for h in headers.iter().filter(|h| h.is_non_utf8()) {
            all_utf8 = false;
            if !feed(&h.name) || !feed(&h.comment) {
                break 'recognize;
            }
        }
    }

    if all_utf8 {
        return Encoding::Utf8;
    }

    let guess = detector.guess(None, true);
    if guess == encoding_rs::SHIFT_JIS {
        if suspicious_for_cp437 {
            Encoding::ShiftJis
        } else {
            Encoding::Cp437
        }
    } else if guess == encoding_rs::UTF_8 {
        Encoding::Utf8
    } else {
        Encoding::Cp437
    }
}
