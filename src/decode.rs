use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::{debug, warn};

use crate::aes::Aes128;
use crate::bits::BitString;
use crate::entry::{Key, KeySource, Progress};
use crate::errors::ArchiveError;
use crate::format::{
    ArchiveHeader, Codec, AUTH_BYTES, END_DATA, END_PATH, END_TREE, PREAMBLE_LEN,
};
use crate::huffman::{symbols_to_bytes, HuffmanTree};
use crate::md5::Md5;
use crate::sink::{DirSink, EntrySink};

/// Archive read granularity.
pub const DEFAULT_READ_BLOCK: usize = 512;

/// Password attempts per protected entry before it is skipped.
pub const PASSWORD_ATTEMPTS: u32 = 3;

/// How many bytes the payload scanner holds back from the decoder: up to
/// 3 bytes of a sentinel straddling the next refill, plus the final
/// partial byte and the pad-count byte.
const PAYLOAD_HOLDBACK: usize = 5;

/// What an extraction did: entry counts plus the paths that were skipped
/// because no offered key verified.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub files: usize,
    pub dirs: usize,
    pub skipped: Vec<String>,
}

/// What to materialize once an entry's digest verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Dir,
    EmptyFile,
    File,
}

/// Per-entry context threaded through the states.
struct EntryCtx {
    path: String,
    hasher: Md5,
    pending: Pending,
    key: Option<Key>,
    tree: Option<HuffmanTree>,
}

/// Flags parsed ahead of the path.
struct EntryFlags {
    dir: bool,
    not_empty: bool,
    auth: Option<[u8; 16]>,
}

/// The reader advances entry by entry through these states; every
/// variable-length region is terminated by a sentinel scan. `Resync` is
/// the skip path: scan forward to the end of the entry and start over.
enum State {
    ExpectTag,
    ExpectFlags { tag: u8 },
    ExpectPath { flags: EntryFlags },
    ExpectTree { ctx: EntryCtx },
    ExpectData { ctx: EntryCtx },
    ExpectHash { ctx: EntryCtx },
    Resync,
}

/// Streams an archive back out through an [`EntrySink`].
///
/// ```no_run
/// use huffarc::read_archive;
///
/// # fn main() -> Result<(), huffarc::ArchiveError> {
/// let report = read_archive("backup.hfa", "restored/", None)?;
/// println!("{} files, {} dirs", report.files, report.dirs);
/// # Ok(())
/// # }
/// ```
pub struct ArchiveReader<'a, R: Read> {
    src: R,
    buf: Vec<u8>,
    eof: bool,
    block_size: usize,
    header: Option<ArchiveHeader>,
    keys: Option<&'a mut dyn KeySource>,
    progress: Option<&'a mut dyn Progress>,
    /// path of the entry being parsed, for error context
    current: Option<String>,
}

impl<'a> ArchiveReader<'a, BufReader<File>> {
    /// Open the archive file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArchiveError::MissingInput(path.into())
            } else {
                ArchiveError::Io(e)
            }
        })?;
        Ok(Self::for_reader(BufReader::new(file)))
    }
}

impl<'a, R: Read> ArchiveReader<'a, R> {
    /// Read an archive from any byte source.
    pub fn for_reader(src: R) -> Self {
        Self {
            src,
            buf: Vec::new(),
            eof: false,
            block_size: DEFAULT_READ_BLOCK,
            header: None,
            keys: None,
            progress: None,
            current: None,
        }
    }

    /// Archive read granularity in bytes.
    pub fn block_size(&mut self, bytes: usize) -> &mut Self {
        self.block_size = bytes.max(1);
        self
    }

    /// Supply keys for protected entries. Without a source every
    /// protected entry is skipped.
    pub fn with_keys(&mut self, keys: &'a mut dyn KeySource) -> &mut Self {
        self.keys = Some(keys);
        self
    }

    /// Report archive bytes consumed.
    pub fn with_progress(&mut self, progress: &'a mut dyn Progress) -> &mut Self {
        self.progress = Some(progress);
        self
    }

    /// The archive preamble, validating magic, version, and codec flag.
    pub fn header(&mut self) -> Result<ArchiveHeader, ArchiveError> {
        if let Some(header) = self.header {
            return Ok(header);
        }
        let raw = self.take_exact(PREAMBLE_LEN, "archive preamble")?;
        let header = ArchiveHeader::parse(&raw)?;
        self.header = Some(header);
        Ok(header)
    }

    /// Decode every entry into `sink`, in archive order.
    ///
    /// Entries whose key never verifies are skipped and reported;
    /// structural damage and digest mismatches abort with an error.
    pub fn extract_to(&mut self, sink: &mut dyn EntrySink) -> Result<ExtractReport, ArchiveError> {
        let codec = self.header()?.codec;
        let mut report = ExtractReport::default();
        let mut state = State::ExpectTag;

        loop {
            state = match state {
                State::ExpectTag => {
                    self.current = None;
                    match self.try_take_tag()? {
                        Some(tag) => State::ExpectFlags { tag },
                        None => break,
                    }
                }

                State::ExpectFlags { tag } => {
                    let flags = self.read_flags(tag)?;
                    State::ExpectPath { flags }
                }

                State::ExpectPath { flags } => {
                    let raw = self.scan(&END_PATH, "entry path")?;
                    let path = String::from_utf8(raw)
                        .map_err(|_| ArchiveError::Malformed("entry path is not valid UTF-8"))?;
                    self.current = Some(path.clone());
                    let mut hasher = Md5::new();
                    hasher.update(path.as_bytes());

                    let verified = match &flags.auth {
                        Some(auth) => self.authenticate(&path, auth).map(Some),
                        None => Some(None),
                    };
                    match verified {
                        None => {
                            warn!("skipping [{}]: no key verified", path);
                            report.skipped.push(path);
                            State::Resync
                        }
                        Some(key) => {
                            let pending = if flags.dir {
                                Pending::Dir
                            } else if flags.not_empty {
                                Pending::File
                            } else {
                                Pending::EmptyFile
                            };
                            debug!("entry [{}] ({:?})", path, pending);
                            let ctx = EntryCtx {
                                path,
                                hasher,
                                pending,
                                key,
                                tree: None,
                            };
                            match pending {
                                Pending::File => State::ExpectTree { ctx },
                                _ => State::ExpectData { ctx },
                            }
                        }
                    }
                }

                State::ExpectTree { mut ctx } => {
                    let raw = self.scan(&END_TREE, "huffman tree")?;
                    let plain = match &ctx.key {
                        Some(key) => {
                            let (pad, cipher) = raw
                                .split_last()
                                .ok_or(ArchiveError::Malformed("empty encrypted tree"))?;
                            Aes128::new(key).decrypt_padded(cipher, *pad)?
                        }
                        None => raw,
                    };
                    ctx.hasher.update(&plain);
                    ctx.tree = Some(HuffmanTree::from_bytes(&plain)?);
                    State::ExpectData { ctx }
                }

                State::ExpectData { mut ctx } => {
                    match ctx.pending {
                        Pending::File => {
                            sink.begin_file(&ctx.path)?;
                            self.decode_payload(&mut ctx, codec, sink)?;
                        }
                        Pending::Dir | Pending::EmptyFile => {
                            // nothing between END_PATH and END_DATA
                            let region = self.scan(&END_DATA, "end of entry")?;
                            if !region.is_empty() {
                                return Err(ArchiveError::Malformed(
                                    "unexpected bytes in a payload-free entry",
                                ));
                            }
                        }
                    }
                    State::ExpectHash { ctx }
                }

                State::ExpectHash { ctx } => {
                    let stored = self.take_exact(16, "entry digest")?;
                    let computed = ctx.hasher.finalize();
                    if stored != computed {
                        return Err(ArchiveError::HashMismatch(ctx.path));
                    }
                    match ctx.pending {
                        Pending::Dir => {
                            sink.create_dir(&ctx.path)?;
                            report.dirs += 1;
                        }
                        Pending::EmptyFile => {
                            sink.begin_file(&ctx.path)?;
                            sink.finish_file()?;
                            report.files += 1;
                        }
                        Pending::File => {
                            sink.finish_file()?;
                            report.files += 1;
                        }
                    }
                    State::ExpectTag
                }

                State::Resync => {
                    self.scan(&END_DATA, "skipped entry")?;
                    self.take_exact(16, "skipped entry digest")?;
                    State::ExpectTag
                }
            };
        }

        Ok(report)
    }

    fn read_flags(&mut self, tag: u8) -> Result<EntryFlags, ArchiveError> {
        match tag {
            0x00 => {
                let rest = self.take_exact(2, "directory flags")?;
                if rest != [0x00, 0x00] {
                    return Err(ArchiveError::Malformed("nonzero empty-directory flags"));
                }
                Ok(EntryFlags {
                    dir: true,
                    not_empty: false,
                    auth: None,
                })
            }
            0x01 => {
                let rest = self.take_exact(2, "entry flags")?;
                let not_empty = match rest[0] {
                    0x00 => false,
                    0x01 => true,
                    _ => return Err(ArchiveError::Malformed("invalid emptiness flag")),
                };
                let auth = match rest[1] {
                    0x00 => None,
                    0x01 => {
                        let raw = self.take_exact(16, "auth block")?;
                        let mut auth = [0u8; 16];
                        auth.copy_from_slice(&raw);
                        Some(auth)
                    }
                    _ => return Err(ArchiveError::Malformed("invalid encryption flag")),
                };
                Ok(EntryFlags {
                    dir: false,
                    not_empty,
                    auth,
                })
            }
            unk => Err(ArchiveError::InvalidEntryTag(unk)),
        }
    }

    /// Offer the stored auth block to the key source, up to
    /// [`PASSWORD_ATTEMPTS`] times. `None` means no key verified.
    fn authenticate(&mut self, path: &str, auth: &[u8; 16]) -> Option<Key> {
        let keys = self.keys.as_mut()?;
        for attempt in 0..PASSWORD_ATTEMPTS {
            let key = keys.key_for(path, attempt)?;
            if Aes128::new(&key).decrypt_block(auth) == AUTH_BYTES {
                return Some(key);
            }
            warn!(
                "wrong key for [{}] (attempt {}/{})",
                path,
                attempt + 1,
                PASSWORD_ATTEMPTS
            );
        }
        None
    }

    /// Decode the bit-packed payload up to END_DATA, streaming decoded
    /// bytes into `sink` and the entry hasher.
    fn decode_payload(
        &mut self,
        ctx: &mut EntryCtx,
        codec: Codec,
        sink: &mut dyn EntrySink,
    ) -> Result<(), ArchiveError> {
        let tree = ctx
            .tree
            .as_ref()
            .ok_or(ArchiveError::Malformed("file entry without a tree"))?;
        let mut bits = BitString::new();
        let mut decoded = Vec::new();

        loop {
            if let Some(at) = find(&self.buf, &END_DATA) {
                if at == 0 {
                    return Err(ArchiveError::Malformed("payload missing its pad count"));
                }
                let pad = self.buf[at - 1];
                if pad > 7 {
                    return Err(ArchiveError::Malformed("invalid payload pad count"));
                }
                bits.extend_from_slice(&self.buf[..at]);
                self.consume(at + END_DATA.len());

                let (syms, rest) = tree.decode(&bits, Some(pad))?;
                if !rest.is_empty() {
                    // a code left hanging mid-symbol; the digest check decides
                    warn!("[{}]: payload ends inside a code", ctx.path);
                }
                decoded.clear();
                symbols_to_bytes(codec, &syms, &mut decoded)?;
                ctx.hasher.update(&decoded);
                sink.write_chunk(&decoded)?;
                return Ok(());
            }

            if self.eof {
                return Err(ArchiveError::Truncated(ctx.path.clone()));
            }

            // decode what cannot be part of the trailer yet
            if self.buf.len() > PAYLOAD_HOLDBACK {
                let take = self.buf.len() - PAYLOAD_HOLDBACK;
                bits.extend_from_slice(&self.buf[..take]);
                self.consume(take);

                let (syms, rest) = tree.decode(&bits, None)?;
                bits = rest;
                decoded.clear();
                symbols_to_bytes(codec, &syms, &mut decoded)?;
                ctx.hasher.update(&decoded);
                sink.write_chunk(&decoded)?;
            }

            self.refill()?;
        }
    }

    /// Collect bytes up to (and consuming) the next `sentinel`.
    ///
    /// The last 3 buffered bytes are always retained across refills so a
    /// sentinel straddling two reads is still found.
    fn scan(&mut self, sentinel: &[u8; 4], what: &str) -> Result<Vec<u8>, ArchiveError> {
        let mut region = Vec::new();
        loop {
            if let Some(at) = find(&self.buf, sentinel) {
                region.extend_from_slice(&self.buf[..at]);
                self.consume(at + sentinel.len());
                return Ok(region);
            }
            if self.eof {
                return Err(self.truncated(what));
            }
            if self.buf.len() > 3 {
                let take = self.buf.len() - 3;
                region.extend_from_slice(&self.buf[..take]);
                self.consume(take);
            }
            self.refill()?;
        }
    }

    /// The next entry tag, or `None` on a clean end of archive.
    fn try_take_tag(&mut self) -> Result<Option<u8>, ArchiveError> {
        while self.buf.is_empty() {
            if self.eof {
                return Ok(None);
            }
            self.refill()?;
        }
        let tag = self.buf[0];
        self.consume(1);
        Ok(Some(tag))
    }

    fn take_exact(&mut self, n: usize, what: &str) -> Result<Vec<u8>, ArchiveError> {
        while self.buf.len() < n {
            if self.eof {
                return Err(self.truncated(what));
            }
            self.refill()?;
        }
        let rest = self.buf.split_off(n);
        Ok(std::mem::replace(&mut self.buf, rest))
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    fn refill(&mut self) -> Result<(), ArchiveError> {
        if self.eof {
            return Ok(());
        }
        let start = self.buf.len();
        self.buf.resize(start + self.block_size, 0);
        let n = self.src.read(&mut self.buf[start..])?;
        self.buf.truncate(start + n);
        if n == 0 {
            self.eof = true;
        } else if let Some(p) = self.progress.as_mut() {
            p.advance(n as u64);
        }
        Ok(())
    }

    fn truncated(&self, what: &str) -> ArchiveError {
        ArchiveError::Truncated(match &self.current {
            Some(path) => path.clone(),
            None => what.to_string(),
        })
    }
}

fn find(haystack: &[u8], needle: &[u8; 4]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract the archive at `path` into `out_root`, creating it as needed.
///
/// `keys` supplies keys for protected entries; pass `None` to skip all
/// of them. Returns what was extracted and what was skipped.
pub fn read_archive<P: AsRef<Path>, Q: AsRef<Path>>(
    path: P,
    out_root: Q,
    keys: Option<&mut dyn KeySource>,
) -> Result<ExtractReport, ArchiveError> {
    let mut reader = ArchiveReader::open(path)?;
    if let Some(keys) = keys {
        reader.with_keys(keys);
    }
    let mut sink = DirSink::new(out_root.as_ref());
    reader.extract_to(&mut sink)
}
