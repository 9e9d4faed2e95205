//! Turn a mongodump `--archive` stream into restore intents.
//!
//! Layout:
//! ```text
//! magic number, u32 little endian 0x8199e26d
//! prelude:   header document, one document per collection, terminator
//! body:      namespace header, frames, terminator   (repeated, interleaved)
//!            namespace header with EOF and CRC, terminator   (once per collection)
//! ```
//!
//! A terminator is a length prefix of `0xffffffff`.  The oplog is stored under database `""`
//! and collection `oplog`.
//!
//! Collections are interleaved in the body, so every selected collection is spooled into a
//! file of its own before anything is restored.

use super::dump_dir::{put_oplog_file, ScanOptions, Scanner};
use super::frame::{decode_document, ArchiveBlock, FrameReader};
use super::intent::{Intent, Namespace};
use super::manager::IntentManager;
use crate::blocking::{FileSource, MemorySource};
use crate::error::{RestoreError, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// First four bytes of every archive.
pub const ARCHIVE_MAGIC: u32 = 0x8199_e26d;

const OPLOG_COLL: &str = "oplog";
const CRC64_ECMA_POLY: u64 = 0xc96c_5795_d787_0f42;
const CRC64_TABLE: [u64; 256] = crc64_table();

const fn crc64_table() -> [u64; 256] {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ CRC64_ECMA_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-64 with the ECMA polynomial, the checksum an archive keeps per collection.
#[derive(Debug, Clone)]
pub struct Crc64 {
    state: u64,
}

impl Default for Crc64 {
    fn default() -> Self {
        Crc64::new()
    }
}

impl Crc64 {
    /// checksum of nothing.
    pub fn new() -> Self {
        Crc64 { state: !0 }
    }

    /// feed `bytes` into the checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        for byte in bytes {
            let index = ((self.state ^ *byte as u64) & 0xff) as usize;
            self.state = CRC64_TABLE[index] ^ (self.state >> 8);
        }
    }

    /// checksum of everything fed so far.
    pub fn sum(&self) -> u64 {
        !self.state
    }
}

/// First document of the prelude.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveHeader {
    /// how many collections mongodump wrote at the same time.
    #[serde(default)]
    pub concurrent_collections: i32,
    /// archive format version.
    #[serde(default)]
    pub version: String,
    /// version of the dumped server.
    #[serde(default)]
    pub server_version: String,
    /// version of mongodump.
    #[serde(default)]
    pub tool_version: String,
}

#[derive(Debug, Deserialize)]
struct PreludeEntry {
    db: String,
    collection: String,
    #[serde(default)]
    metadata: String,
}

#[derive(Debug, Deserialize)]
struct NamespaceHeader {
    db: String,
    collection: String,
    #[serde(rename = "EOF", default)]
    eof: bool,
    #[serde(rename = "CRC", default)]
    crc: i64,
}

/// A demultiplexed archive, the spool files live as long as this value.
#[derive(Debug)]
pub struct SpooledArchive {
    header: ArchiveHeader,
    dir: TempDir,
}

impl SpooledArchive {
    /// the archive's prelude header.
    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// directory holding the spool files.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Data of one namespace while the body is read.
struct Spool {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    crc: Crc64,
    finished: bool,
}

impl Spool {
    fn create(path: Option<PathBuf>) -> Result<Spool> {
        let writer = match &path {
            Some(path) => Some(BufWriter::new(File::create(path)?)),
            None => None,
        };
        Ok(Spool {
            writer,
            path,
            crc: Crc64::new(),
            finished: false,
        })
    }

    fn write(&mut self, ns: &Namespace, frame: &[u8]) -> Result<()> {
        if self.finished {
            return Err(invalid(format!("{} has data after its end marker", ns)));
        }
        self.crc.update(frame);
        if let Some(writer) = &mut self.writer {
            writer.write_all(frame)?;
        }
        Ok(())
    }

    fn finish(&mut self, ns: &Namespace, crc: i64) -> Result<()> {
        if self.finished {
            return Err(invalid(format!("{} is ended twice", ns)));
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        let actual = self.crc.sum();
        if actual != crc as u64 {
            return Err(invalid(format!(
                "checksum mismatch for {}, expected {:#x} but computed {:#x}",
                ns, crc as u64, actual
            )));
        }
        self.finished = true;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> RestoreError {
    RestoreError::InvalidArchive(message.into())
}

fn from_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(bson::from_document(decode_document(frame)?)?)
}

fn is_oplog(ns: &Namespace) -> bool {
    ns.db.is_empty() && ns.coll == OPLOG_COLL
}

/// Read the whole archive from `reader`, spool the selected collections into a temporary
/// directory and put an intent for each of them into `manager`.
///
/// Every collection's checksum is verified, including the ones which aren't selected.  The
/// returned [SpooledArchive] must be kept alive until the restore ends.
pub fn scan<R: Read>(
    reader: R,
    options: &ScanOptions,
    manager: &IntentManager,
) -> Result<SpooledArchive> {
    let scanner = Scanner::new(options)?;
    let mut reader = BufReader::new(reader);
    read_magic(&mut reader)?;
    let mut frames = FrameReader::new(reader);

    let header: ArchiveHeader = match frames.next_block()? {
        Some(ArchiveBlock::Frame(frame)) => from_frame(frame)?,
        _ => return Err(invalid("missing archive header")),
    };
    info!(
        version = %header.version,
        server_version = %header.server_version,
        tool_version = %header.tool_version,
        "Read archive header."
    );
    let mut prelude = vec![];
    loop {
        match frames.next_block()? {
            Some(ArchiveBlock::Frame(frame)) => prelude.push(from_frame::<PreludeEntry>(frame)?),
            Some(ArchiveBlock::Terminator) => break,
            None => return Err(invalid("archive ends inside its prelude")),
        }
    }

    let dir = tempfile::Builder::new().prefix("mongo_restore").tempdir()?;
    let selected = |ns: &Namespace| is_oplog(ns) || scanner.selects(&ns.db, &ns.coll);
    let mut spools: BTreeMap<Namespace, Spool> = BTreeMap::new();
    loop {
        let ns_header: NamespaceHeader = match frames.next_block()? {
            None => break,
            Some(ArchiveBlock::Frame(frame)) => from_frame(frame)?,
            Some(ArchiveBlock::Terminator) => {
                return Err(invalid("terminator without a namespace header"))
            }
        };
        let ns = Namespace::new(&ns_header.db, &ns_header.collection);
        let next_index = spools.len();
        let spool = match spools.entry(ns.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = if selected(&ns) {
                    Some(dir.path().join(format!("{:05}.bson", next_index)))
                } else {
                    debug!(%ns, "Skip archived collection.");
                    None
                };
                entry.insert(Spool::create(path)?)
            }
        };

        if ns_header.eof {
            match frames.next_block()? {
                Some(ArchiveBlock::Terminator) => spool.finish(&ns, ns_header.crc)?,
                _ => return Err(invalid(format!("end marker of {} isn't terminated", ns))),
            }
            continue;
        }
        loop {
            match frames.next_block()? {
                Some(ArchiveBlock::Frame(frame)) => spool.write(&ns, frame)?,
                Some(ArchiveBlock::Terminator) => break,
                None => return Err(invalid(format!("archive ends inside {}", ns))),
            }
        }
    }

    if let Some((ns, _)) = spools.iter().find(|(_, spool)| !spool.finished) {
        return Err(invalid(format!("archive ends before {} is complete", ns)));
    }

    let mut metadata: BTreeMap<Namespace, String> = BTreeMap::new();
    for entry in prelude {
        let ns = Namespace::new(&entry.db, &entry.collection);
        if let Entry::Vacant(vacant) = spools.entry(ns.clone()) {
            vacant.insert(Spool::create(None)?);
        }
        metadata.insert(ns, entry.metadata);
    }
    for (ns, spool) in spools {
        if !selected(&ns) {
            continue;
        }
        if is_oplog(&ns) {
            if let Some(path) = spool.path {
                debug!(path = %path.display(), "Found archived oplog.");
                manager.put(Intent::oplog(Arc::new(FileSource::new(path)?)));
            }
            continue;
        }
        let mut intent = Intent::new(ns.db.clone(), ns.coll.clone());
        if let Some(path) = spool.path {
            intent = intent.with_data(Arc::new(FileSource::new(path)?));
        }
        if let Some(json) = metadata.remove(&ns).filter(|json| !json.is_empty()) {
            let name = format!("archive:{}.metadata.json", ns);
            intent = intent.with_metadata(Arc::new(MemorySource::new(name, json.into_bytes())));
        }
        let intent = scanner.renamed(intent)?;
        debug!(%intent, "Found archived intent.");
        manager.put(intent);
    }

    put_oplog_file(options, manager)?;
    Ok(SpooledArchive { header, dir })
}

fn read_magic<R: Read>(reader: &mut R) -> Result<()> {
    let mut magic = [0; 4];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == IoErrorKind::UnexpectedEof => {
            return Err(invalid("stream is too short to be an archive"))
        }
        Err(e) => return Err(e.into()),
    }
    let magic = u32::from_le_bytes(magic);
    if magic != ARCHIVE_MAGIC {
        return Err(invalid(format!(
            "bad magic number {:#010x}, not a mongodump archive",
            magic
        )));
    }
    Ok(())
}
