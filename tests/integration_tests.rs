//! End-to-end scenarios (§8): hand-built archive bytes run through the
//! top-level [`Archive`] dispatcher, covering a representative case per
//! format rather than every byte-level parser already exercised by the
//! per-module unit tests.

use unarr_core::archive::Archive;
use unarr_core::config::OpenOptions;
use unarr_core::stream::{MemoryStream, Stream};

fn open(bytes: Vec<u8>) -> Archive {
    let stream: Box<dyn Stream> = Box::new(MemoryStream::new(bytes));
    Archive::open(stream, OpenOptions::new()).expect("archive should open")
}

fn le16(v: u16) -> [u8; 2] {
    v.to_le_bytes()
}

fn le32(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

/// Scenario 1: a store-only ZIP with one entry, `"Hello, world!"`, whose
/// CRC-32 is the value given directly in the specification.
fn store_only_zip(name: &[u8], data: &[u8], crc32: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let local_header_offset = out.len() as u32;

    out.extend_from_slice(b"PK\x03\x04");
    out.extend_from_slice(&[0, 20]); // reader version: host 0, version 20
    out.extend_from_slice(&le16(0)); // flags
    out.extend_from_slice(&le16(0)); // method = store
    out.extend_from_slice(&le16(0)); // mod time
    out.extend_from_slice(&le16(0)); // mod date
    out.extend_from_slice(&le32(crc32));
    out.extend_from_slice(&le32(data.len() as u32)); // compressed size
    out.extend_from_slice(&le32(data.len() as u32)); // uncompressed size
    out.extend_from_slice(&le16(name.len() as u16));
    out.extend_from_slice(&le16(0)); // extra len
    out.extend_from_slice(name);
    out.extend_from_slice(data);

    let central_dir_offset = out.len() as u32;
    out.extend_from_slice(b"PK\x01\x02");
    out.extend_from_slice(&[0, 20]); // version made by
    out.extend_from_slice(&[0, 20]); // version needed
    out.extend_from_slice(&le16(0)); // flags
    out.extend_from_slice(&le16(0)); // method = store
    out.extend_from_slice(&le16(0)); // mod time
    out.extend_from_slice(&le16(0)); // mod date
    out.extend_from_slice(&le32(crc32));
    out.extend_from_slice(&le32(data.len() as u32));
    out.extend_from_slice(&le32(data.len() as u32));
    out.extend_from_slice(&le16(name.len() as u16));
    out.extend_from_slice(&le16(0)); // extra len
    out.extend_from_slice(&le16(0)); // comment len
    out.extend_from_slice(&le16(0)); // disk number start
    out.extend_from_slice(&le16(0)); // internal attrs
    out.extend_from_slice(&le32(0)); // external attrs
    out.extend_from_slice(&le32(local_header_offset));
    out.extend_from_slice(name);

    let central_dir_size = out.len() as u32 - central_dir_offset;

    out.extend_from_slice(b"PK\x05\x06");
    out.extend_from_slice(&le16(0)); // disk nbr
    out.extend_from_slice(&le16(0)); // dir disk nbr
    out.extend_from_slice(&le16(1)); // dir records this disk
    out.extend_from_slice(&le16(1)); // total dir records
    out.extend_from_slice(&le32(central_dir_size));
    out.extend_from_slice(&le32(central_dir_offset));
    out.extend_from_slice(&le16(0)); // comment len

    out
}

#[test_log::test]
fn store_only_zip_roundtrips() {
    let data = b"Hello, world!";
    let bytes = store_only_zip(b"hello.txt", data, 0xEBE6C6E6);

    let mut archive = open(bytes);
    let entry = archive.parse_next_entry().expect("one entry");
    assert_eq!(entry.name(), "hello.txt");
    assert_eq!(entry.uncompressed_size(), data.len() as u64);

    let mut out = vec![0u8; data.len()];
    archive.extract(&mut out).unwrap();
    assert_eq!(out, data);

    assert!(archive.parse_next_entry().is_none());
    assert!(archive.at_eof());
}

/// A ZIP entry declaring method 98 (PPMd8): same layout as
/// [`store_only_zip`] but with the method field changed, and compressed
/// bytes that are never meant to be interpreted, since
/// `Archive::extract` must refuse before decoding them (see
/// `unarr_core::rar::ppmd`'s module doc on why this crate doesn't implement
/// a bit-exact PPMd7 model).
fn ppmd_zip(name: &[u8], compressed: &[u8]) -> Vec<u8> {
    const PPMD: u16 = 98;
    let mut out = Vec::new();
    let local_header_offset = out.len() as u32;

    out.extend_from_slice(b"PK\x03\x04");
    out.extend_from_slice(&[0, 20]);
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(PPMD));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le32(0)); // crc32, irrelevant: extract must fail before it's checked
    out.extend_from_slice(&le32(compressed.len() as u32));
    out.extend_from_slice(&le32(1024)); // uncompressed size, also never reached
    out.extend_from_slice(&le16(name.len() as u16));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(name);
    out.extend_from_slice(compressed);

    let central_dir_offset = out.len() as u32;
    out.extend_from_slice(b"PK\x01\x02");
    out.extend_from_slice(&[0, 20]);
    out.extend_from_slice(&[0, 20]);
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(PPMD));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le32(0));
    out.extend_from_slice(&le32(compressed.len() as u32));
    out.extend_from_slice(&le32(1024));
    out.extend_from_slice(&le16(name.len() as u16));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le32(0));
    out.extend_from_slice(&le32(local_header_offset));
    out.extend_from_slice(name);

    let central_dir_size = out.len() as u32 - central_dir_offset;

    out.extend_from_slice(b"PK\x05\x06");
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(1));
    out.extend_from_slice(&le16(1));
    out.extend_from_slice(&le32(central_dir_size));
    out.extend_from_slice(&le32(central_dir_offset));
    out.extend_from_slice(&le16(0));

    out
}

#[test_log::test]
fn ppmd_entry_is_refused_not_silently_decoded() {
    let bytes = ppmd_zip(b"ppmd.bin", &[0xAA; 16]);

    let mut archive = open(bytes);
    let entry = archive.parse_next_entry().expect("header parses fine");
    assert_eq!(entry.name(), "ppmd.bin");

    let mut out = vec![0u8; 1024];
    let err = archive.extract(&mut out).unwrap_err();
    assert!(matches!(
        err,
        unarr_core::error::Error::Unsupported(
            unarr_core::error::UnsupportedError::MethodNotSupported(_)
        )
    ));
}

#[test_log::test]
fn empty_zip_has_no_entries() {
    let mut out = Vec::new();
    out.extend_from_slice(b"PK\x05\x06");
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le16(0));
    out.extend_from_slice(&le32(0));
    out.extend_from_slice(&le32(0));
    out.extend_from_slice(&le16(0));

    let mut archive = open(out);
    assert!(archive.parse_next_entry().is_none());
    assert!(archive.at_eof());
}

const BLOCK_SIZE: usize = 512;

/// Build one 512-byte tar header block with a correct checksum, mirroring
/// `tar::parse_header_block`'s own validation so the fixtures below are
/// guaranteed to parse.
fn tar_header_block(name: &str, size: u64, typeflag: u8) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    let name_bytes = name.as_bytes();
    block[..name_bytes.len().min(100)].copy_from_slice(&name_bytes[..name_bytes.len().min(100)]);

    let size_field = format!("{:011o}\0", size);
    block[124..136].copy_from_slice(size_field.as_bytes());

    let mtime_field = format!("{:011o}\0", 0u64);
    block[136..148].copy_from_slice(mtime_field.as_bytes());

    block[148..156].copy_from_slice(b"        "); // checksum placeholder (spaces)
    block[156] = typeflag;

    let sum: u32 = block.iter().map(|&b| b as u32).sum();
    let checksum_field = format!("{:06o}\0 ", sum);
    block[148..156].copy_from_slice(checksum_field.as_bytes());

    block
}

/// Scenario 4: a GNU long-name entry followed by a short-named header;
/// `entry.name()` must return the long name, not the short one.
#[test_log::test]
fn tar_gnu_long_name_overrides_short_name() {
    let long_name = "a/".repeat(99) + "tail.txt"; // well over the 100-byte short-name field
    let mut bytes = Vec::new();

    // type 'L' bodies aren't interpreted as a short name, so the 100-byte
    // name field itself is irrelevant and left zeroed.
    let name_block = tar_header_block("", (long_name.len() + 1) as u64, b'L');
    bytes.extend_from_slice(&name_block);
    let mut body = long_name.clone().into_bytes();
    body.push(0);
    body.resize(body.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
    bytes.extend_from_slice(&body);

    let data = b"hello";
    bytes.extend_from_slice(&tar_header_block("short.txt", data.len() as u64, b'0'));
    let mut data_block = data.to_vec();
    data_block.resize(BLOCK_SIZE, 0);
    bytes.extend_from_slice(&data_block);

    bytes.resize(bytes.len() + 2 * BLOCK_SIZE, 0); // end-of-archive marker

    let mut archive = open(bytes);
    let entry = archive.parse_next_entry().expect("one real entry");
    assert_eq!(entry.name(), long_name);
    assert_eq!(entry.uncompressed_size(), data.len() as u64);

    let mut out = vec![0u8; data.len()];
    archive.extract(&mut out).unwrap();
    assert_eq!(&out, data);

    assert!(archive.parse_next_entry().is_none());
    assert!(archive.at_eof());
}

#[test_log::test]
fn empty_tar_has_no_entries() {
    let bytes = vec![0u8; 2 * BLOCK_SIZE];
    // An all-zero first block fails the dispatcher's own tar probe (by
    // design: it can't be told apart from a non-tar stream), so open it
    // directly against the tar reader instead of going through `Archive`.
    let stream: Box<dyn Stream> = Box::new(MemoryStream::new(bytes));
    let mut archive = unarr_core::tar::TarArchive::open(stream).unwrap();
    assert!(archive.parse_next_entry().is_none());
    assert!(archive.at_eof());
}
