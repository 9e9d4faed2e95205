//! Turn a mongodump output directory into restore intents.
//!
//! Layout:
//! ```text
//! <root>/oplog.bson
//! <root>/<db>/<coll>.bson            (or <coll>.bin)
//! <root>/<db>/<coll>.metadata.json
//! ```

use super::intent::{Intent, IntentKind, Namespace};
use super::manager::IntentManager;
use super::ns_matcher::{NsFilter, NsRenamer};
use crate::blocking::{FileSource, ReaderSource};
use crate::error::{RestoreError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const OPLOG_FILE: &str = "oplog.bson";
const METADATA_SUFFIX: &str = ".metadata.json";
const DATA_SUFFIXES: [&str; 2] = [".bson", ".bin"];
const PROFILE_COLL: &str = "system.profile";

/// What to pick from a dump.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// only restore this database.
    pub db: Option<String>,
    /// only restore this collection, requires `db`.
    pub collection: Option<String>,
    /// namespace patterns to restore, everything when empty.
    pub ns_include: Vec<String>,
    /// namespace patterns to skip.
    pub ns_exclude: Vec<String>,
    /// `(from, to)` namespace rename patterns.
    pub renames: Vec<(String, String)>,
    /// oplog file to replay, in addition to the dump's own `oplog.bson`.
    pub oplog_file: Option<PathBuf>,
}

/// Scan `path` and put every intent found into `manager`.
///
/// `path` is either a dump directory or a single `.bson` file, the latter requires
/// [ScanOptions::db].
pub fn scan(path: &Path, options: &ScanOptions, manager: &IntentManager) -> Result<()> {
    let scanner = Scanner::new(options)?;
    if path.is_file() {
        scanner.scan_file(path, manager)?;
    } else if path.is_dir() {
        scanner.scan_root(path, manager)?;
    } else {
        return Err(RestoreError::ConfigError(format!(
            "{} is neither a file nor a directory",
            path.display()
        )));
    }

    put_oplog_file(options, manager)
}

/// Put a single collection read from `reader`, usually stdin, into `manager`.
///
/// A stream has no file name to take names from, so both [ScanOptions::db] and
/// [ScanOptions::collection] are required.
pub fn scan_stream(
    reader: Box<dyn Read + Send>,
    options: &ScanOptions,
    manager: &IntentManager,
) -> Result<()> {
    let scanner = Scanner::new(options)?;
    let (db, coll) = match (&options.db, &options.collection) {
        (Some(db), Some(coll)) => (db.clone(), coll.clone()),
        _ => {
            return Err(RestoreError::ConfigError(
                "restoring from stdin requires both a database and a collection".to_string(),
            ))
        }
    };
    let intent = Intent::new(db, coll).with_data(Arc::new(ReaderSource::new("stdin", reader)));
    let intent = scanner.renamed(intent)?;
    debug!(%intent, "Found stdin intent.");
    manager.put(intent);
    put_oplog_file(options, manager)
}

pub(super) fn put_oplog_file(options: &ScanOptions, manager: &IntentManager) -> Result<()> {
    if let Some(oplog_file) = &options.oplog_file {
        info!(path = %oplog_file.display(), "Use oplog file.");
        manager.put(Intent::oplog(Arc::new(FileSource::new(oplog_file)?)));
    }
    Ok(())
}

/// Namespace selection and renaming shared by every kind of dump.
pub(super) struct Scanner<'a> {
    options: &'a ScanOptions,
    filter: NsFilter,
    renamer: NsRenamer,
}

impl<'a> Scanner<'a> {
    pub(super) fn new(options: &'a ScanOptions) -> Result<Self> {
        if options.collection.is_some() && options.db.is_none() {
            return Err(RestoreError::ConfigError(
                "restoring a single collection requires a database".to_string(),
            ));
        }
        Ok(Scanner {
            options,
            filter: NsFilter::new(&options.ns_include, &options.ns_exclude)?,
            renamer: NsRenamer::new(&options.renames)?,
        })
    }

    fn scan_file(&self, path: &Path, manager: &IntentManager) -> Result<()> {
        let file_name = file_name(path)?;
        let stem = match data_collection_name(&file_name) {
            Some(stem) => stem,
            None => {
                return Err(RestoreError::ConfigError(format!(
                    "{} is not a .bson file",
                    path.display()
                )))
            }
        };
        let db = match &self.options.db {
            Some(db) => db.clone(),
            None => {
                return Err(RestoreError::ConfigError(
                    "restoring a single file requires a database".to_string(),
                ))
            }
        };
        let coll = self
            .options
            .collection
            .clone()
            .unwrap_or_else(|| stem.to_string());

        let mut intent = Intent::new(db, coll).with_data(Arc::new(FileSource::new(path)?));
        let metadata_path = path.with_file_name(format!("{}{}", stem, METADATA_SUFFIX));
        if metadata_path.is_file() {
            intent = intent.with_metadata(Arc::new(FileSource::new(metadata_path)?));
        }
        let intent = self.renamed(intent)?;
        debug!(%intent, "Found single file intent.");
        manager.put(intent);
        Ok(())
    }

    fn scan_root(&self, root: &Path, manager: &IntentManager) -> Result<()> {
        for entry in sorted_entries(root)? {
            let name = file_name(&entry)?;
            if entry.is_dir() {
                if let Some(db) = &self.options.db {
                    if db != &name {
                        continue;
                    }
                }
                self.scan_db(&name, &entry, manager)?;
            } else if name == OPLOG_FILE {
                debug!(path = %entry.display(), "Found oplog.");
                manager.put(Intent::oplog(Arc::new(FileSource::new(&entry)?)));
            } else {
                debug!(path = %entry.display(), "Skip unknown file in dump root.");
            }
        }
        Ok(())
    }

    fn scan_db(&self, db: &str, dir: &Path, manager: &IntentManager) -> Result<()> {
        for entry in sorted_entries(dir)? {
            if !entry.is_file() {
                continue;
            }
            let name = file_name(&entry)?;
            let (coll, is_metadata) = match name.strip_suffix(METADATA_SUFFIX) {
                Some(coll) => (coll.to_string(), true),
                None => match data_collection_name(&name) {
                    Some(coll) => (coll.to_string(), false),
                    None => {
                        debug!(path = %entry.display(), "Skip unknown file.");
                        continue;
                    }
                },
            };
            if !self.selects(db, &coll) {
                continue;
            }

            let source = Arc::new(FileSource::new(&entry)?);
            let intent = if is_metadata {
                Intent::new(db, coll).with_metadata(source)
            } else {
                Intent::new(db, coll).with_data(source)
            };
            manager.put(self.renamed(intent)?);
        }
        Ok(())
    }

    /// true if `db.coll` should be restored.
    pub(super) fn selects(&self, db: &str, coll: &str) -> bool {
        if let Some(only) = &self.options.db {
            if only != db {
                return false;
            }
        }
        if coll == PROFILE_COLL {
            debug!(db, "Skip system.profile.");
            return false;
        }
        if let Some(only) = &self.options.collection {
            if only != coll {
                return false;
            }
        }
        // special collections ignore namespace patterns.
        match IntentKind::classify(db, coll) {
            IntentKind::Regular => self.filter.is_selected(&format!("{}.{}", db, coll)),
            _ => true,
        }
    }

    /// Apply rename patterns to a regular intent.
    pub(super) fn renamed(&self, intent: Intent) -> Result<Intent> {
        if intent.kind != IntentKind::Regular || self.renamer.is_empty() {
            return Ok(intent);
        }
        let renamed = self.renamer.rename(&intent.key());
        let dest = Namespace::parse(&renamed).ok_or_else(|| {
            RestoreError::ConfigError(format!(
                "{} is renamed to {:?}, which is not a valid namespace",
                intent.source, renamed
            ))
        })?;
        Ok(intent.with_dest(dest))
    }
}

/// collection name of a data file, None if `name` isn't a data file.
fn data_collection_name(name: &str) -> Option<&str> {
    DATA_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .filter(|coll| !coll.is_empty())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| RestoreError::ConfigError(format!("invalid file name: {}", path.display())))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = vec![];
    for entry in std::fs::read_dir(dir)? {
        entries.push(entry?.path());
    }
    entries.sort();
    Ok(entries)
}
