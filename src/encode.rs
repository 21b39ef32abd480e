use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::debug;

use crate::aes::Aes128;
use crate::bits::BitPacker;
use crate::entry::{Entry, EntryKind, Key, KeySource, Progress};
use crate::errors::ArchiveError;
use crate::format::{ArchiveHeader, Codec, AUTH_BYTES, END_DATA, END_PATH, END_TREE};
use crate::huffman::{Code, FreqTable, HuffmanTree, Symbol, SymbolBuffer};
use crate::md5::Md5;

/// Input read granularity while modeling and encoding files.
pub const DEFAULT_WRITE_BLOCK: usize = 256;

/// Streams entries into an archive.
///
/// Create one with [`create()`] (a fresh archive file) or
/// [`for_writer()`] (any `Write` sink), adjust settings, then feed it
/// batches of entries. Entries land in the archive in the order given.
/// ```no_run
/// use huffarc::{ArchiveWriter, Entry};
///
/// # fn main() -> Result<(), huffarc::ArchiveError> {
/// let mut writer = ArchiveWriter::create("backup.hfa")?;
/// writer.write_entries(&[
///     Entry::file("/data/notes/todo.txt", "notes/todo.txt"),
///     Entry::empty_dir("notes/drafts"),
/// ])?;
/// writer.finish()?;
/// # Ok(())
/// # }
/// ```
///
/// [`create()`]: ArchiveWriter::create
/// [`for_writer()`]: ArchiveWriter::for_writer
pub struct ArchiveWriter<'a, W: Write> {
    sink: W,
    codec: Codec,
    block_size: usize,
    keys: Option<&'a mut dyn KeySource>,
    progress: Option<&'a mut dyn Progress>,
    started: bool,
}

impl<'a> ArchiveWriter<'a, BufWriter<File>> {
    /// Create the archive file at `path`. An existing file at that path
    /// is refused, not overwritten.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    ArchiveError::ArchiveExists(path.into())
                } else {
                    ArchiveError::Io(e)
                }
            })?;
        Ok(Self::for_writer(BufWriter::new(file)))
    }
}

impl<'a, W: Write> ArchiveWriter<'a, W> {
    /// Write an archive to any byte sink.
    pub fn for_writer(sink: W) -> Self {
        Self {
            sink,
            codec: Codec::Binary,
            block_size: DEFAULT_WRITE_BLOCK,
            keys: None,
            progress: None,
            started: false,
        }
    }

    /// Select the symbol alphabet. Must be set before the first batch of
    /// entries; the choice is recorded in the archive header.
    pub fn codec(&mut self, codec: Codec) -> &mut Self {
        self.codec = codec;
        self
    }

    /// Input read granularity in bytes.
    pub fn block_size(&mut self, bytes: usize) -> &mut Self {
        self.block_size = bytes.max(1);
        self
    }

    /// Encrypt the Huffman tree of every entry the source returns a key
    /// for.
    pub fn with_keys(&mut self, keys: &'a mut dyn KeySource) -> &mut Self {
        self.keys = Some(keys);
        self
    }

    /// Report input bytes consumed while encoding.
    pub fn with_progress(&mut self, progress: &'a mut dyn Progress) -> &mut Self {
        self.progress = Some(progress);
        self
    }

    /// Append `entries` to the archive in order. The preamble is written
    /// once, before the first entry.
    pub fn write_entries(&mut self, entries: &[Entry]) -> Result<(), ArchiveError> {
        // validate sources and size the batch before emitting anything
        let mut total = 0u64;
        for entry in entries {
            if let EntryKind::File = entry.kind {
                total += file_size(entry)?;
            }
        }
        if let Some(p) = self.progress.as_mut() {
            p.begin(total);
        }

        if !self.started {
            ArchiveHeader::new(self.codec).write(&mut self.sink)?;
            self.started = true;
        }

        for entry in entries {
            match entry.kind {
                EntryKind::File => self.write_file(entry)?,
                EntryKind::EmptyDir => self.write_empty_dir(entry)?,
            }
        }
        self.sink.flush()?;
        Ok(())
    }

    /// Flush and return the underlying sink.
    pub fn finish(mut self) -> Result<W, ArchiveError> {
        self.sink.flush()?;
        Ok(self.sink)
    }

    fn write_file(&mut self, entry: &Entry) -> Result<(), ArchiveError> {
        let source = entry
            .source
            .as_deref()
            .ok_or(ArchiveError::Malformed("file entry without a source path"))?;
        let size = file_size(entry)?;
        let key = self
            .keys
            .as_mut()
            .and_then(|keys| keys.key_for(entry.name(), 0));
        debug!(
            "file [{}]: {} bytes{}",
            entry.name(),
            size,
            if key.is_some() { ", encrypted tree" } else { "" }
        );

        let mut hasher = Md5::new();
        self.sink.write_all(&[0x01])?;
        self.sink.write_all(&[(size > 0) as u8])?;
        match &key {
            Some(key) => {
                self.sink.write_all(&[0x01])?;
                let auth = Aes128::new(key).encrypt_block(&AUTH_BYTES);
                self.sink.write_all(&auth)?;
            }
            None => self.sink.write_all(&[0x00])?,
        }

        self.sink.write_all(entry.name().as_bytes())?;
        hasher.update(entry.name().as_bytes());
        self.sink.write_all(&END_PATH)?;

        if size > 0 {
            let tree = self.model_file(source, entry.name())?;
            let codes = tree.codes();
            let raw = tree.to_bytes()?;
            hasher.update(&raw);
            self.write_tree(&raw, key.as_ref())?;
            self.sink.write_all(&END_TREE)?;
            self.write_data(source, entry.name(), &codes, &mut hasher)?;
        }

        self.sink.write_all(&END_DATA)?;
        self.sink.write_all(&hasher.finalize())?;
        Ok(())
    }

    fn write_empty_dir(&mut self, entry: &Entry) -> Result<(), ArchiveError> {
        debug!("empty directory [{}]", entry.name());
        let mut hasher = Md5::new();
        self.sink.write_all(&[0x00, 0x00, 0x00])?;
        self.sink.write_all(entry.name().as_bytes())?;
        hasher.update(entry.name().as_bytes());
        self.sink.write_all(&END_PATH)?;
        self.sink.write_all(&END_DATA)?;
        self.sink.write_all(&hasher.finalize())?;
        Ok(())
    }

    /// First pass: stream the file once to accumulate frequencies.
    fn model_file(&mut self, source: &Path, name: &str) -> Result<HuffmanTree, ArchiveError> {
        let mut rdr = BufReader::new(File::open(source)?);
        let mut block = vec![0u8; self.block_size];
        let mut symbols = SymbolBuffer::new(self.codec);
        let mut syms = Vec::new();
        let mut freqs = FreqTable::new();

        loop {
            let n = rdr.read(&mut block)?;
            if n == 0 {
                break;
            }
            syms.clear();
            symbols
                .feed(&block[..n], &mut syms)
                .map_err(|_| ArchiveError::InvalidUtf8(name.to_string()))?;
            freqs.add_all(&syms);
        }
        symbols
            .finish()
            .map_err(|_| ArchiveError::InvalidUtf8(name.to_string()))?;

        HuffmanTree::build(&freqs)
    }

    fn write_tree(&mut self, raw: &[u8], key: Option<&Key>) -> Result<(), ArchiveError> {
        match key {
            Some(key) => {
                let (cipher, pad) = Aes128::new(key).encrypt_padded(raw);
                self.sink.write_all(&cipher)?;
                self.sink.write_all(&[pad])?;
            }
            None => self.sink.write_all(raw)?,
        }
        Ok(())
    }

    /// Second pass: stream the file again, mapping symbols to codes and
    /// emitting packed bytes as they fill.
    fn write_data(
        &mut self,
        source: &Path,
        name: &str,
        codes: &HashMap<Symbol, Code>,
        hasher: &mut Md5,
    ) -> Result<(), ArchiveError> {
        let mut rdr = BufReader::new(File::open(source)?);
        let mut block = vec![0u8; self.block_size];
        let mut symbols = SymbolBuffer::new(self.codec);
        let mut syms = Vec::new();
        let mut packer = BitPacker::new();

        loop {
            let n = rdr.read(&mut block)?;
            if n == 0 {
                break;
            }
            hasher.update(&block[..n]);
            syms.clear();
            symbols
                .feed(&block[..n], &mut syms)
                .map_err(|_| ArchiveError::InvalidUtf8(name.to_string()))?;
            for sym in &syms {
                // the file changing between the two passes can surface here
                let code = codes.get(sym).ok_or(ArchiveError::Malformed(
                    "symbol missing from the code table",
                ))?;
                code.pack_into(&mut packer);
            }
            self.sink.write_all(&packer.take_bytes())?;
            if let Some(p) = self.progress.as_mut() {
                p.advance(n as u64);
            }
        }
        symbols
            .finish()
            .map_err(|_| ArchiveError::InvalidUtf8(name.to_string()))?;

        let (rest, partial, pad) = packer.finish();
        self.sink.write_all(&rest)?;
        match partial {
            Some(byte) => self.sink.write_all(&[byte, pad])?,
            None => self.sink.write_all(&[0x00])?,
        }
        Ok(())
    }
}

fn file_size(entry: &Entry) -> Result<u64, ArchiveError> {
    let source = entry
        .source
        .as_deref()
        .ok_or(ArchiveError::Malformed("file entry without a source path"))?;
    match fs::metadata(source) {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        _ => Err(ArchiveError::MissingInput(source.to_path_buf())),
    }
}

/// Write a binary-mode archive of `entries` at `path`.
///
/// This is a convenience wrapper; use [`ArchiveWriter`] for UTF-8 mode,
/// tree encryption, or progress reporting.
pub fn write_archive<P: AsRef<Path>>(path: P, entries: &[Entry]) -> Result<(), ArchiveError> {
    let mut writer = ArchiveWriter::create(path)?;
    writer.write_entries(entries)?;
    writer.finish()?;
    Ok(())
}
