//! A Rust library for Huffman-coded file archives with per-entry
//! integrity and optional tree encryption.
//!
//! `huffarc` packs files and empty directories into a single
//! self-describing container. Every file is compressed independently
//! with order-0 Huffman coding, authenticated with an MD5 digest, and
//! may have its coding tree encrypted with AES-128-ECB under a
//! password-derived key, so that holders of the archive cannot decode a
//! protected file without the password.
//!
//! ## Usage
//!
//! The [`write_archive()`] and [`read_archive()`] functions cover the
//! common cases:
//!
//! ```
//! use huffarc::{read_archive, write_archive, Entry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let input = dir.path().join("hello.txt");
//! std::fs::write(&input, b"hello hello hello")?;
//!
//! let archive = dir.path().join("hello.hfa");
//! write_archive(&archive, &[Entry::file(&input, "hello.txt")])?;
//!
//! let out = dir.path().join("restored");
//! let report = read_archive(&archive, &out, None)?;
//! assert_eq!(report.files, 1);
//! assert_eq!(std::fs::read(out.join("hello.txt"))?, b"hello hello hello");
//! # Ok(())
//! # }
//! ```
//!
//! For UTF-8 text archives, encrypted entries, block sizing, or progress
//! reporting, use [`ArchiveWriter`] and [`ArchiveReader`] directly:
//!
//! ```no_run
//! use huffarc::{key_from_password, ArchiveReader, DirSink};
//!
//! # fn main() -> Result<(), huffarc::ArchiveError> {
//! let mut keys = |_path: &str, _attempt: u32| Some(key_from_password("hunter2"));
//! let mut reader = ArchiveReader::open("secrets.hfa")?;
//! reader.with_keys(&mut keys);
//! let mut sink = DirSink::new("restored/");
//! let report = reader.extract_to(&mut sink)?;
//! println!("skipped: {:?}", report.skipped);
//! # Ok(())
//! # }
//! ```
//!
//! ## Format overview
//!
//! An archive is a 36-byte preamble (magic, version, codec flag,
//! reserved zeros) followed by one record per entry. Each record holds
//! flag bytes, the relative path, the serialized Huffman tree
//! (non-empty files only, optionally AES-encrypted), the bit-packed
//! payload, and a 16-byte MD5 trailer over the path, the plaintext
//! tree, and the decoded payload. Variable-length regions end with
//! fixed 4-byte sentinels found by literal scan, which is what lets the
//! reader skip past a protected entry it cannot decode and resume at
//! the next one. The full layout, the sentinel values, and the tree
//! wire encoding are documented in the [`format`] module.
//!
//! Two symbol alphabets are supported ([`Codec`]): raw bytes, and
//! Unicode scalar values for UTF-8 text archives.
//!
//! ## Collaborators
//!
//! The codec does not walk directories, prompt for passwords, or draw
//! progress bars. Callers enumerate [`Entry`] values for the writer,
//! implement [`KeySource`] to supply 16-byte keys (see
//! [`key_from_password()`]), implement [`EntrySink`] to place decoded
//! output (or use [`DirSink`]), and may implement [`Progress`] to
//! observe throughput.

mod bits;
mod decode;
mod encode;
mod entry;
mod huffman;
mod sink;

pub mod aes;
pub mod errors;
pub mod format;
pub mod md5;

pub use decode::{
    read_archive, ArchiveReader, ExtractReport, DEFAULT_READ_BLOCK, PASSWORD_ATTEMPTS,
};
pub use encode::{write_archive, ArchiveWriter, DEFAULT_WRITE_BLOCK};
pub use entry::{key_from_password, Entry, EntryKind, Key, KeySource, Progress};
pub use errors::ArchiveError;
pub use format::{ArchiveHeader, Codec};
pub use sink::{DirSink, EntrySink};
