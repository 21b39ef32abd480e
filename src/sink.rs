//! Reader-side output: where decoded entries are materialized.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

/// Receives decoded archive contents in archive order.
///
/// For every non-empty file the reader calls [`begin_file`], then
/// [`write_chunk`] zero or more times, then [`finish_file`] once the
/// entry digest has verified. Empty files get the begin/finish pair with
/// no chunks. Directories get [`create_dir`].
///
/// [`begin_file`]: EntrySink::begin_file
/// [`write_chunk`]: EntrySink::write_chunk
/// [`finish_file`]: EntrySink::finish_file
/// [`create_dir`]: EntrySink::create_dir
pub trait EntrySink {
    fn create_dir(&mut self, path: &str) -> io::Result<()>;
    fn begin_file(&mut self, path: &str) -> io::Result<()>;
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;
    fn finish_file(&mut self) -> io::Result<()>;
}

/// Materializes entries under a root directory, creating parent
/// directories as needed.
///
/// Archive paths are untrusted: absolute paths and `..` components are
/// rejected before anything touches the filesystem.
#[derive(Debug)]
pub struct DirSink {
    root: PathBuf,
    file: Option<BufWriter<File>>,
}

impl DirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file: None,
        }
    }

    fn resolve(&self, rel: &str) -> io::Result<PathBuf> {
        let rel = Path::new(rel);
        for part in rel.components() {
            match part {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unsafe path in archive: [{}]", rel.display()),
                    ));
                }
            }
        }
        Ok(self.root.join(rel))
    }
}

impl EntrySink for DirSink {
    fn create_dir(&mut self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path)?)
    }

    fn begin_file(&mut self, path: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        self.file = Some(BufWriter::new(File::create(full)?));
        Ok(())
    }

    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "no file entry in progress",
            )),
        }
    }

    fn finish_file(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "no file entry in progress",
            )),
        }
    }
}
