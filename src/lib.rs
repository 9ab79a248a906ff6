#![warn(missing_docs)]

//! unarr-core is a unified reader for RAR (v2/v3), ZIP (including
//! Deflate64/BZIP2/LZMA/PPMd variants), 7z and POSIX tar archives.
//!
//! It's made up of a bunch of types representing the various parts of each
//! archive format, parsers that turn byte buffers into those types, and
//! per-format readers ([`rar::RarArchive`], [`zip::ZipArchive`],
//! [`sevenz::SevenZArchive`], [`tar::TarArchive`]) that drive them from a
//! seekable [`stream::Stream`]. [`archive::Archive`] ties the four together
//! behind one open/iterate/extract API, probing each format's signature to
//! figure out which reader to hand the stream to.

pub mod archive;
pub mod bitreader;
pub mod config;
pub mod datetime;
pub mod encoding;
pub mod error;
pub mod huffman;
pub mod lzss;
pub mod parse;
pub mod rar;
pub mod rarvm;
pub mod sevenz;
pub mod stream;
pub mod tar;
pub mod zip;
