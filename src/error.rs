//! All error types used in this crate.

use crate::encoding;

/// Any archive-related error: invalid structures, unsupported features,
/// bitstream corruption, or encoding problems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not a valid archive of any supported format.
    #[error("format: {0}")]
    Format(#[from] FormatError),

    /// Something is not supported by this crate.
    #[error("unsupported: {0}")]
    Unsupported(#[from] UnsupportedError),

    /// Invalid UTF-8, Shift-JIS, CP-437, or any problem encountered while
    /// decoding a filename.
    #[error("encoding: {0:?}")]
    Encoding(#[from] encoding::DecodingError),

    /// I/O error from the underlying stream.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Decompression-related error.
    #[error("{method} decompression error: {msg}")]
    Decompression {
        /// Name of the compression method that failed.
        method: &'static str,
        /// Additional information.
        msg: String,
    },

    /// The decoded content of an entry didn't match its declared checksum.
    ///
    /// The caller has already received the bytes extracted so far; whether
    /// this is reported depends on [`crate::config::CrcPolicy`].
    #[error("checksum didn't match: expected {expected:08x}, got {actual:08x}")]
    BadCrc {
        /// Expected CRC-32, from the entry header.
        expected: u32,
        /// Actual CRC-32 of the decompressed bytes.
        actual: u32,
    },

    /// A RAR-VM bytecode filter failed to validate or exceeded its
    /// instruction budget.
    #[error("vm program error: {0}")]
    BadVmProgram(#[from] VmProgramError),

    /// Could not read as an archive because size could not be determined.
    #[error("size must be known to open this archive")]
    UnknownSize,

    /// A buffer sized directly from a header-declared field (an entry's
    /// uncompressed size, a name length, a VM program length) could not be
    /// allocated.
    #[error("out of memory allocating {requested} bytes")]
    Oom {
        /// The size, in bytes, that allocation was attempted for.
        requested: usize,
    },
}

impl Error {
    /// Build an [`UnsupportedError::MethodNotSupported`] error.
    pub fn method_not_supported(method: impl Into<String>) -> Self {
        Self::Unsupported(UnsupportedError::MethodNotSupported(method.into()))
    }
}

/// Allocate a zeroed buffer of `len` bytes via fallible reservation, for
/// call sites where `len` comes directly from a header-declared field
/// rather than from an already-validated stream length. Header fields that
/// declare a size are never trusted to drive an infallible allocation
/// directly (§7).
pub(crate) fn try_zeroed_vec(len: usize) -> Result<Vec<u8>, Error> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::Oom { requested: len })?;
    v.resize(len, 0);
    Ok(v)
}

/// Some part of a bytecode filter program failed to validate or execute.
#[derive(Debug, thiserror::Error)]
pub enum VmProgramError {
    /// The bytecode's leading XOR checksum byte didn't match.
    #[error("bytecode checksum mismatch")]
    BadChecksum,

    /// An addressing mode or opcode outside the known set was decoded.
    #[error("unknown opcode or addressing mode at instruction {index}")]
    UnknownOpcode {
        /// Index of the offending instruction.
        index: usize,
    },

    /// Execution exceeded the configured instruction budget.
    #[error("instruction budget of {budget} exceeded")]
    BudgetExceeded {
        /// The configured budget.
        budget: u64,
    },
}

/// Some part of the archive format is not supported by this crate.
#[derive(Debug, thiserror::Error)]
pub enum UnsupportedError {
    /// The compression method is not supported.
    #[error("compression method not supported: {0}")]
    MethodNotSupported(String),

    /// The entry is encrypted; this crate does not implement decryption.
    #[error("encrypted entries are not supported")]
    Encrypted,

    /// RAR5 archives are not supported; only RAR v2/v3.
    #[error("RAR5 format is not supported")]
    Rar5,

    /// A multi-volume archive was detected; this crate does not assemble
    /// volumes.
    #[error("multi-volume archives are not supported")]
    MultiVolume,

    /// The LZMA version found in the properties header is not supported.
    #[error("only LZMA2.0 is supported, found LZMA{minor}.{major}")]
    LzmaVersionUnsupported {
        /// Major version read from the LZMA properties header.
        major: u8,
        /// Minor version read from the LZMA properties header.
        minor: u8,
    },

    /// The LZMA properties header is not the expected size.
    #[error("LZMA properties header wrong size: expected {expected} bytes, got {actual} bytes")]
    LzmaPropertiesHeaderWrongSize {
        /// Expected size in bytes.
        expected: u16,
        /// Actual size in bytes.
        actual: u16,
    },
}

/// Specific archive format errors, mostly due to invalid archives but that
/// could also stem from implementation shortcomings.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    // --- generic / dispatcher ---
    /// None of the known format probes (RAR, ZIP, 7z, TAR) recognized the
    /// stream.
    #[error("not a recognized archive format")]
    UnrecognizedFormat,

    // --- ZIP ---
    /// The end of central directory record was not found.
    #[error("end of central directory record not found")]
    DirectoryEndSignatureNotFound,

    /// The zip64 end of central directory record could not be parsed.
    #[error("zip64 end of central directory record not found")]
    Directory64EndRecordInvalid,

    /// Corrupted/partial zip file: the offset we found for the central
    /// directory points outside of the current file.
    #[error("directory offset points outside of file")]
    DirectoryOffsetPointsOutsideFile,

    /// The central record is corrupted somewhat.
    #[error("invalid central record: expected to read {expected} files, got {actual}")]
    InvalidCentralRecord {
        /// Expected number of files.
        expected: u64,
        /// Actual number of files.
        actual: u64,
    },

    /// An extra field (that we support) was not decoded correctly.
    #[error("could not decode extra field")]
    InvalidExtraField,

    /// The header offset of an entry is invalid.
    #[error("invalid header offset")]
    InvalidHeaderOffset,

    /// End of central directory record claims an impossible number of files.
    #[error("impossible number of files: claims to have {claimed_records_count}, but zip size is {zip_size}")]
    ImpossibleNumberOfFiles {
        /// Number of files claimed in the end of central directory record.
        claimed_records_count: u64,
        /// Total size of the zip file.
        zip_size: u64,
    },

    /// The local file header could not be parsed correctly.
    #[error("invalid local file header")]
    InvalidLocalHeader,

    /// The data descriptor (after the file data) could not be parsed
    /// correctly.
    #[error("invalid data descriptor")]
    InvalidDataDescriptor,

    /// The uncompressed size didn't match.
    #[error("uncompressed size didn't match: expected {expected}, got {actual}")]
    WrongSize {
        /// Expected size in bytes.
        expected: u64,
        /// Actual size in bytes.
        actual: u64,
    },

    // --- RAR ---
    /// The 7-byte RAR signature didn't match.
    #[error("bad RAR signature")]
    BadRarSignature,

    /// A block header's declared size was smaller than the data already
    /// read, or otherwise inconsistent.
    #[error("invalid RAR block header")]
    InvalidRarBlockHeader,

    /// A block's CRC-16 didn't match its contents.
    #[error("RAR block header checksum mismatch")]
    BadRarBlockChecksum,

    /// A Huffman code table was malformed (duplicate or conflicting prefix,
    /// or a symbol outside the valid range).
    #[error("malformed Huffman table: {0}")]
    BadHuffmanTable(&'static str),

    /// The compressed bitstream contained an invalid symbol or escape
    /// sequence.
    #[error("bad RAR bitstream: {0}")]
    BadBitstream(&'static str),

    // --- TAR ---
    /// A numeric TAR header field contained non-octal, non-padding bytes.
    #[error("invalid TAR header field")]
    InvalidTarField,

    /// Neither the signed nor the unsigned TAR header checksum matched.
    #[error("TAR header checksum mismatch")]
    BadTarChecksum,

    /// A PAX extended header record was malformed.
    #[error("invalid PAX extended header record")]
    InvalidPaxRecord,

    // --- 7z ---
    /// The 7z signature header failed to validate.
    #[error("invalid 7z signature header")]
    InvalidSevenZSignature,

    /// The 7z archive's header stream failed to decode.
    #[error("invalid 7z header stream")]
    InvalidSevenZHeader,
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            e => std::io::Error::other(e),
        }
    }
}
