//! Writer-side inputs: entry descriptions produced by an external
//! walker, per-entry key lookup, and the progress sink.

use std::path::PathBuf;

use crate::md5;

/// A 16-byte symmetric key protecting an entry's Huffman tree.
pub type Key = [u8; 16];

/// Derive the archive key for a password: MD5 over the password bytes.
///
/// Both sides of the codec take raw keys, so interactive front-ends and
/// tests must agree on this derivation.
pub fn key_from_password(password: &str) -> Key {
    md5::digest(password.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    EmptyDir,
}

/// One unit of work for [`ArchiveWriter`](crate::ArchiveWriter).
///
/// Walking the input tree is the caller's concern; the writer only needs
/// the source location and the relative name to record in the archive.
#[derive(Debug, Clone)]
pub struct Entry {
    pub(crate) source: Option<PathBuf>,
    pub(crate) name: String,
    pub(crate) kind: EntryKind,
}

impl Entry {
    /// A file entry: read from `source`, stored under `name`.
    pub fn file(source: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            name: name.into(),
            kind: EntryKind::File,
        }
    }

    /// An empty-directory entry stored under `name`.
    pub fn empty_dir(name: impl Into<String>) -> Self {
        Self {
            source: None,
            name: name.into(),
            kind: EntryKind::EmptyDir,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }
}

/// Supplies per-entry encryption keys.
///
/// The writer asks once per entry (`attempt` is 0); `Some` key encrypts
/// that entry's tree. The reader asks up to three times per protected
/// entry with `attempt` counting up; `None` skips the entry immediately.
pub trait KeySource {
    fn key_for(&mut self, path: &str, attempt: u32) -> Option<Key>;
}

impl<F> KeySource for F
where
    F: FnMut(&str, u32) -> Option<Key>,
{
    fn key_for(&mut self, path: &str, attempt: u32) -> Option<Key> {
        self(path, attempt)
    }
}

/// Observes byte-level progress. Implementations decide how to render
/// it; the codec only reports totals and increments.
pub trait Progress {
    /// Called before a batch of work with the number of input bytes it
    /// covers.
    fn begin(&mut self, _total: u64) {}

    /// Called as input bytes are consumed.
    fn advance(&mut self, _bytes: u64) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn password_key_is_md5_of_password() {
        assert_eq!(key_from_password("abc"), md5::digest(b"abc"));
    }

    #[test]
    fn closures_are_key_sources() {
        let key = [7u8; 16];
        let mut source = |path: &str, _attempt: u32| {
            if path == "secret.txt" {
                Some(key)
            } else {
                None
            }
        };
        let source: &mut dyn KeySource = &mut source;
        assert_eq!(source.key_for("secret.txt", 0), Some(key));
        assert_eq!(source.key_for("plain.txt", 0), None);
    }
}
