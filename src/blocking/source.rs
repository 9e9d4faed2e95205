//! Openable byte sources which back an intent's data and metadata.

use crate::error::Result;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Cursor, Error as IoError, ErrorKind as IoErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Something an intent can read its bson frames or metadata from.
///
/// Every call to [open](DataSource::open) starts from the beginning, the returned reader is
/// closed when it's dropped.
pub trait DataSource: Send + Sync + fmt::Debug {
    /// open a new reader.
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    /// total bytes of this source, used for progress.
    fn size(&self) -> u64;

    /// where the data lives, used for logs and to detect duplicated sources.
    fn location(&self) -> String;
}

/// A file on local disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Create a source for file at `path`, it's size is read from file system.
    pub fn new(path: impl Into<PathBuf>) -> Result<FileSource> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        Ok(FileSource { path, size })
    }

    /// get file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for FileSource {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In memory bytes, cheap to clone.
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    /// Create a source named `name` holding `data`.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> MemorySource {
        MemorySource {
            name: name.into(),
            data: Arc::new(data),
        }
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

impl DataSource for MemorySource {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(SharedBytes(self.data.clone()))))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn location(&self) -> String {
        self.name.clone()
    }
}

/// A stream which can only be read once, like stdin.
///
/// The first [open](DataSource::open) hands the stream out, later calls fail.
pub struct ReaderSource {
    name: String,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
}

impl ReaderSource {
    /// Create a source named `name` reading from `reader`.
    pub fn new(name: impl Into<String>, reader: Box<dyn Read + Send>) -> ReaderSource {
        ReaderSource {
            name: name.into(),
            reader: Mutex::new(Some(reader)),
        }
    }
}

impl fmt::Debug for ReaderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderSource")
            .field("name", &self.name)
            .field("consumed", &self.reader.lock().is_none())
            .finish()
    }
}

impl DataSource for ReaderSource {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self.reader.lock().take() {
            Some(reader) => Ok(reader),
            None => Err(IoError::new(
                IoErrorKind::Other,
                format!("{} can only be read once", self.name),
            )
            .into()),
        }
    }

    /// unknown, progress isn't reported for streams.
    fn size(&self) -> u64 {
        0
    }

    fn location(&self) -> String {
        self.name.clone()
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
