//! Mongo restore lib, which provides an easily usage api to restore a mongodump directory into mongodb.
//!
//! The entry point is [MongoRestore], which pulls restore work ([Intent]s) out of an [IntentManager]
//! and writes them into a [RestoreTarget] (usually a [Connection]).  When oplog replay is enabled,
//! the dumped oplog is replayed by an [OplogReplayer] after all collections are restored.
//!
//! # Restore a dump directory:
//! ```no_run
//! use mongo_restore::{dump_dir, Connection, IntentManager, MongoRestore, RestoreOptions};
//! use std::path::Path;
//!
//! let options = RestoreOptions::default();
//! let manager = IntentManager::new();
//! dump_dir::scan(Path::new("dump"), &dump_dir::ScanOptions::default(), &manager).unwrap();
//!
//! let conn = Connection::new("mongodb://localhost:27017").unwrap();
//! let restore = MongoRestore::new(conn, options, manager);
//! let result = restore.restore();
//! println!("{} documents restored, {} failed", result.successes, result.failures);
//! ```
//!
//! # Decode a bson dump file:
//! ```no_run
//! use mongo_restore::FrameReader;
//! let file = std::fs::File::open("dump/db/coll.bson").unwrap();
//! let mut reader = FrameReader::new(file);
//! while let Some(doc) = reader.next_document().unwrap() {
//!     println!("{}", doc);
//! }
//! ```

#![warn(missing_docs)]

#[doc(hidden)]
pub mod blocking;
pub mod config;
mod error;

/// mongodb internal database for admin.
const ADMIN_DB_NAME: &str = "admin";
/// mongodb internal database which saves oplogs.
const OPLOG_DB: &str = "local";
/// mongodb database which saves sessions and transaction tables.
const CONFIG_DB: &str = "config";

/// oplog namespace key name.
const NAMESPACE_KEY: &str = "ns";
/// oplog timestamp key name.
const TIMESTAMP_KEY: &str = "ts";
/// oplog operation key name.
const OP_KEY: &str = "op";
/// oplog version key name.
const VERSION_KEY: &str = "v";
/// oplog history id key name.
const HISTORY_KEY: &str = "h";
/// oplog collection uuid key name.
const UUID_KEY: &str = "ui";
/// oplog operation object key name.
const OBJ_KEY: &str = "o";

/// Largest document mongodb accepts, also the largest frame in a dump file.
pub const MAX_BSON_SIZE: usize = 16 * 1024 * 1024;

pub use blocking::mongo_restore::{
    archive, dump_dir, BufferedBulkInserter, CollectionMetadata, FrameReader, Intent, IntentKind,
    IntentManager, MongoRestore, Namespace, OpType, OplogEntry, OplogReplayer, PriorityStrategy,
    ReplayStats, RestoreResult, SpooledArchive, Termination,
};
pub use blocking::{
    BatchOutcome, Connection, DataSource, FileSource, MemorySource, ReaderSource, RestoreTarget,
    WriteFailure, WriteFailureKind, WriteOptions,
};
pub use config::{RestoreConf, RestoreOptions};
pub use error::{ErrorKind, RestoreError, Result};
