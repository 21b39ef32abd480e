use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the archive codec.
///
/// Structural problems ([`BadMagic`], [`Malformed`], [`Truncated`],
/// [`HashMismatch`], ...) abort the archive. A failed password is not an
/// error: the reader skips the entry and records it in the
/// [`ExtractReport`](crate::ExtractReport).
///
/// [`BadMagic`]: ArchiveError::BadMagic
/// [`Malformed`]: ArchiveError::Malformed
/// [`Truncated`]: ArchiveError::Truncated
/// [`HashMismatch`]: ArchiveError::HashMismatch
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a huffarc archive (bad magic bytes)")]
    BadMagic,
    #[error("unsupported archive version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported codec flag {0:#04x}")]
    UnsupportedCodec(u8),
    #[error("invalid entry tag {0:#04x}")]
    InvalidEntryTag(u8),
    #[error("malformed archive structure: {0}")]
    Malformed(&'static str),
    #[error("archive truncated while reading {0}")]
    Truncated(String),
    #[error("integrity check failed for [{0}]")]
    HashMismatch(String),
    #[error("[{0}] is not valid UTF-8 text")]
    InvalidUtf8(String),
    #[error("input not found or not a regular file: [{}]", .0.display())]
    MissingInput(PathBuf),
    #[error("archive already exists: [{}]", .0.display())]
    ArchiveExists(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}
