//! Top-level format dispatcher (§4.14).
//!
//! [`Archive::open`] probes the stream for each format's signature in a
//! fixed order — RAR, then ZIP, then 7z, then TAR — and wraps whichever one
//! recognizes the stream in a tagged [`Archive`] enum. Like the rest of this
//! crate it favors a closed match-dispatched sum over a `Box<dyn Trait>`:
//! the four formats are known and finite, and a `match` lets the compiler
//! check every `Entry`/`Archive` method handles all of them.
//!
//! Each probe only peeks at the stream (reading a prefix or tail and
//! seeking back to the start) so that a failed probe never consumes bytes
//! the next one needs; only the winning format's `open` takes ownership of
//! the stream.

use chrono::{DateTime, Utc};

use crate::config::OpenOptions;
use crate::error::{Error, FormatError};
use crate::parse::EndOfCentralDirectoryRecord;
use crate::rar::{self, RarArchive, RarEntry};
use crate::sevenz::{SevenZArchive, SevenZEntry};
use crate::stream::{SeekOrigin, Stream};
use crate::tar::{self, TarArchive, TarEntry};
use crate::zip::{ZipArchive, ZipEntry};

/// Standard 7z signature, `"7z\xBC\xAF\x27\x1C"` — not one of this crate's
/// own format constants (7z parsing is delegated to `sevenz_rust2`), so it's
/// hardcoded here purely for dispatch.
const SEVENZ_SIGNATURE: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// How much of the tail to search for a ZIP end-of-central-directory
/// record: the record itself plus up to a 64 KiB comment.
const ZIP_EOCD_SEARCH_WINDOW: u64 = 66_000;

/// Read up to `buf.len()` bytes starting at `offset` from the start of the
/// stream, returning the slice actually filled (shorter at end of stream),
/// then restore the stream position to the start.
fn peek_at(stream: &mut dyn Stream, offset: i64, origin: SeekOrigin, buf: &mut [u8]) -> std::io::Result<usize> {
    stream.seek(offset, origin)?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    stream.seek(0, SeekOrigin::Start)?;
    Ok(filled)
}

fn looks_like_rar(stream: &mut dyn Stream) -> std::io::Result<bool> {
    let mut sig = [0u8; 7];
    let n = peek_at(stream, 0, SeekOrigin::Start, &mut sig)?;
    Ok(n == sig.len() && sig == rar::parse::SIGNATURE)
}

fn looks_like_zip(stream: &mut dyn Stream) -> std::io::Result<bool> {
    let len = stream.len()?;
    let window = len.min(ZIP_EOCD_SEARCH_WINDOW);
    let mut tail = vec![0u8; window as usize];
    let n = peek_at(stream, -(window as i64), SeekOrigin::End, &mut tail)?;
    Ok(EndOfCentralDirectoryRecord::find_in_block(&tail[..n]).is_some())
}

fn looks_like_sevenz(stream: &mut dyn Stream) -> std::io::Result<bool> {
    let mut sig = [0u8; 6];
    let n = peek_at(stream, 0, SeekOrigin::Start, &mut sig)?;
    Ok(n == sig.len() && sig == SEVENZ_SIGNATURE)
}

fn looks_like_tar(stream: &mut dyn Stream) -> std::io::Result<bool> {
    let mut block = [0u8; 512];
    let n = peek_at(stream, 0, SeekOrigin::Start, &mut block)?;
    Ok(tar::sniff(&block[..n]))
}

/// A unified archive entry, regardless of which of the four formats backs
/// it. Each variant wraps the format's own entry type rather than
/// flattening them into one struct, so format-specific fields (RAR's
/// `solid`, ZIP's `method`/`mode`, 7z's `is_directory`) stay available via
/// a `match` on the caller's side when needed.
#[derive(Debug, Clone)]
pub enum Entry {
    Rar(RarEntry),
    Zip(ZipEntry),
    SevenZ(SevenZEntry),
    Tar(TarEntry),
}

impl Entry {
    /// The entry's path within the archive, normalized to forward slashes.
    pub fn name(&self) -> &str {
        match self {
            Entry::Rar(e) => &e.name,
            Entry::Zip(e) => e.name(),
            Entry::SevenZ(e) => e.name(),
            Entry::Tar(e) => e.name(),
        }
    }

    /// A format-specific handle usable with [`Archive::parse_entry_at`]:
    /// a byte offset for RAR/ZIP/TAR, an entry index for 7z.
    pub fn offset(&self) -> u64 {
        match self {
            Entry::Rar(e) => e.offset,
            Entry::Zip(e) => e.offset(),
            Entry::SevenZ(e) => e.offset(),
            Entry::Tar(e) => e.offset(),
        }
    }

    /// The entry's uncompressed size in bytes.
    pub fn uncompressed_size(&self) -> u64 {
        match self {
            Entry::Rar(e) => e.uncompressed_size,
            Entry::Zip(e) => e.uncompressed_size(),
            Entry::SevenZ(e) => e.uncompressed_size(),
            Entry::Tar(e) => e.uncompressed_size(),
        }
    }

    /// Whether this entry is a directory. RAR, 7z and TAR record this
    /// directly; ZIP has no directory flag of its own (§4.9's Non-goal),
    /// so a ZIP entry is never reported as one here.
    pub fn is_directory(&self) -> bool {
        match self {
            Entry::Rar(e) => e.is_directory,
            Entry::Zip(_) => false,
            Entry::SevenZ(e) => e.is_directory(),
            Entry::Tar(_) => false,
        }
    }

    /// Last-modified time, where the format records one. RAR's DOS date
    /// and TAR's PAX `mtime` are both already normalized to UTC by their
    /// respective readers; this just exposes that value uniformly.
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        match self {
            Entry::Rar(e) => crate::datetime::rar_dosdate_to_utc(e.dosdate),
            Entry::Zip(e) => Some(e.modified),
            Entry::SevenZ(e) => Some(e.modified),
            Entry::Tar(e) => Some(e.modified),
        }
    }

    /// [`Entry::modified`] re-expressed as raw 100ns FILETIME ticks since
    /// 1601-01-01 UTC, for callers that want the wire-format value rather
    /// than a `chrono` type.
    pub fn filetime_ticks(&self) -> Option<i64> {
        self.modified()
            .map(crate::datetime::utc_to_filetime_ticks)
    }
}

/// A tagged union over the four archive formats this crate reads, with a
/// uniform open/iterate/extract API dispatched by `match` instead of
/// dynamic dispatch (§9).
pub enum Archive {
    Rar(RarArchive),
    Zip(ZipArchive),
    SevenZ(SevenZArchive),
    Tar(TarArchive),
}

impl Archive {
    /// Probe the stream for each format's signature in turn — RAR, ZIP,
    /// 7z, TAR — and open it as the first one that matches. Returns
    /// [`FormatError::UnrecognizedFormat`] if none do; that error is
    /// terminal; it never falls further back to content-sniffing.
    ///
    /// Once a format is identified by its signature, any error from that
    /// format's own `open` (corrupt header, unsupported variant, and so
    /// on) is returned as-is rather than trying the next probe — the
    /// signature match means the format is no longer ambiguous.
    pub fn open(mut stream: Box<dyn Stream>, options: OpenOptions) -> Result<Self, Error> {
        if looks_like_rar(stream.as_mut())? {
            return Ok(Archive::Rar(RarArchive::open(stream, options)?));
        }
        if looks_like_zip(stream.as_mut())? {
            return Ok(Archive::Zip(ZipArchive::open(stream, options)?));
        }
        if looks_like_sevenz(stream.as_mut())? {
            return Ok(Archive::SevenZ(SevenZArchive::open(stream, options)?));
        }
        if looks_like_tar(stream.as_mut())? {
            return Ok(Archive::Tar(TarArchive::open(stream)?));
        }
        Err(FormatError::UnrecognizedFormat.into())
    }

    /// Whether the last [`Archive::parse_next_entry`] call ran past the
    /// final entry.
    pub fn at_eof(&self) -> bool {
        match self {
            Archive::Rar(a) => a.at_eof(),
            Archive::Zip(a) => a.at_eof(),
            Archive::SevenZ(a) => a.at_eof(),
            Archive::Tar(a) => a.at_eof(),
        }
    }

    /// Advance to and return the next entry, or `None` at end of archive.
    pub fn parse_next_entry(&mut self) -> Option<Entry> {
        match self {
            Archive::Rar(a) => a.parse_next_entry().map(Entry::Rar),
            Archive::Zip(a) => a.parse_next_entry().map(Entry::Zip),
            Archive::SevenZ(a) => a.parse_next_entry().map(Entry::SevenZ),
            Archive::Tar(a) => a.parse_next_entry().map(Entry::Tar),
        }
    }

    /// Seek directly to the entry at a previously-observed `offset` (see
    /// [`Entry::offset`]) and make it current.
    pub fn parse_entry_at(&mut self, offset: u64) -> Option<Entry> {
        match self {
            Archive::Rar(a) => a.parse_entry_at(offset).map(Entry::Rar),
            Archive::Zip(a) => a.parse_entry_at(offset).map(Entry::Zip),
            Archive::SevenZ(a) => a.parse_entry_at(offset).map(Entry::SevenZ),
            Archive::Tar(a) => a.parse_entry_at(offset).map(Entry::Tar),
        }
    }

    /// Find and make current the entry with the given path, if any.
    pub fn parse_entry_for(&mut self, name: &str) -> Option<Entry> {
        match self {
            Archive::Rar(a) => a.parse_entry_for(name).map(Entry::Rar),
            Archive::Zip(a) => a.parse_entry_for(name).map(Entry::Zip),
            Archive::SevenZ(a) => a.parse_entry_for(name).map(Entry::SevenZ),
            Archive::Tar(a) => a.parse_entry_for(name).map(Entry::Tar),
        }
    }

    /// The currently selected entry, if any.
    pub fn current_entry(&self) -> Option<Entry> {
        match self {
            Archive::Rar(a) => a.current_entry().map(Entry::Rar),
            Archive::Zip(a) => a.current_entry().map(Entry::Zip),
            Archive::SevenZ(a) => a.current_entry().map(Entry::SevenZ),
            Archive::Tar(a) => a.current_entry().map(Entry::Tar),
        }
    }

    /// Copy up to `dst.len()` bytes of the archive's global comment. Only
    /// ZIP archives carry one; every other format copies nothing and
    /// returns 0.
    pub fn global_comment(&self, dst: &mut [u8]) -> usize {
        match self {
            Archive::Zip(a) => a.global_comment(dst),
            Archive::Rar(_) | Archive::SevenZ(_) | Archive::Tar(_) => 0,
        }
    }

    /// Read the next `dst.len()` bytes of the current entry's uncompressed
    /// data, continuing from wherever the previous call on this entry left
    /// off.
    pub fn extract(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        match self {
            Archive::Rar(a) => a.extract(dst),
            Archive::Zip(a) => a.extract(dst),
            Archive::SevenZ(a) => a.extract(dst),
            Archive::Tar(a) => a.extract(dst),
        }
    }
}
