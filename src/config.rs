//! mongo_restore configuration, express in toml.
//!
//! Basic configuration file example:
//! ```toml
//! [target]
//! # mongodb to restore into.
//! uri = "mongodb://localhost:27017"
//!
//! [input]
//! # directory created by mongodump, or a single `.bson` file.
//! dir = "dump"
//! # or a file created by `mongodump --archive`, this takes precedence over `dir`.
//! # archive = "dump.archive"
//! # only restore this database.
//! db = "bb"
//! ns_exclude = ["bb.tmp_*"]
//!
//! [restore]
//! drop = true
//! num_parallel_collections = 4
//! num_insertion_workers = 2
//! write_concern = "majority"
//!
//! [oplog]
//! replay = true
//! limit = "1625097600:1"
//! ```
//!
//! Every table and key is optional.  Library users who don't read config files can build
//! [RestoreOptions] directly.
use crate::blocking::mongo_restore::{time_helper, PriorityStrategy};
use crate::error::{RestoreError, Result};
use crate::dump_dir::ScanOptions;
use bson::{doc, Document, Timestamp};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default number of documents per insert batch.
pub const DEFAULT_BULK_BUFFER_SIZE: usize = 1000;

/// Options which control how a restore run behaves.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// drop each collection before restoring it.
    pub drop: bool,
    /// validate everything, log the plan, but don't touch the target.
    pub dry_run: bool,
    /// write concern document sent with every insert command, e.g. `{"w": "majority"}`.
    pub write_concern: Option<Document>,
    /// how many collections are restored concurrently.
    pub num_parallel_collections: usize,
    /// how many insertion workers run for one collection.
    pub num_insertion_workers: usize,
    /// restore documents in dump file order, implies one worker, ordered inserts and stop on error.
    pub maintain_insertion_order: bool,
    /// treat the first rejected document as a fatal error.
    pub stop_on_error: bool,
    /// send `bypassDocumentValidation` with every insert command.
    pub bypass_document_validation: bool,
    /// validate every document before it's sent to the server.
    pub objcheck: bool,
    /// don't create indexes recorded in metadata.
    pub no_index_restore: bool,
    /// don't pass collection options recorded in metadata to `create`.
    pub no_options_restore: bool,
    /// create collections with the uuid recorded in metadata, requires `drop`.
    pub preserve_uuid: bool,
    /// restore `admin.system.users` and `admin.system.roles` when they are dumped.
    pub restore_users_and_roles: bool,
    /// replay the dumped oplog after collections are restored.
    pub oplog_replay: bool,
    /// only replay oplog entries before this timestamp.
    pub oplog_limit: Option<Timestamp>,
    /// max documents in one insert command.
    pub bulk_buffer_size: usize,
    /// order in which collections are handed to workers.
    pub strategy: PriorityStrategy,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        RestoreOptions {
            drop: false,
            dry_run: false,
            write_concern: None,
            num_parallel_collections: number_of_cpus(),
            num_insertion_workers: 1,
            maintain_insertion_order: false,
            stop_on_error: false,
            bypass_document_validation: false,
            objcheck: false,
            no_index_restore: false,
            no_options_restore: false,
            preserve_uuid: false,
            restore_users_and_roles: true,
            oplog_replay: false,
            oplog_limit: None,
            bulk_buffer_size: DEFAULT_BULK_BUFFER_SIZE,
            strategy: PriorityStrategy::MultiDatabaseRoundRobin,
        }
    }
}

impl RestoreOptions {
    /// Check that options don't contradict each other.
    pub fn check(&self) -> Result<()> {
        if self.preserve_uuid && !self.drop {
            return Err(RestoreError::ConfigError(
                "cannot preserve collection uuids without dropping collections first".to_string(),
            ));
        }
        if self.oplog_limit.is_some() && !self.oplog_replay {
            return Err(RestoreError::ConfigError(
                "an oplog limit requires oplog replay to be enabled".to_string(),
            ));
        }
        if self.num_parallel_collections == 0 {
            return Err(RestoreError::ConfigError(
                "number of parallel collections must be greater than 0".to_string(),
            ));
        }
        if self.num_insertion_workers == 0 {
            return Err(RestoreError::ConfigError(
                "number of insertion workers must be greater than 0".to_string(),
            ));
        }
        if self.bulk_buffer_size == 0 {
            return Err(RestoreError::ConfigError(
                "bulk buffer size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// insertion workers actually used for one collection.
    pub fn insertion_workers(&self) -> usize {
        if self.maintain_insertion_order {
            1
        } else {
            self.num_insertion_workers
        }
    }

    /// true if insert commands must be ordered.
    pub fn ordered(&self) -> bool {
        self.maintain_insertion_order
    }

    /// true if a rejected document stops the restore.
    pub fn fail_fast(&self) -> bool {
        self.stop_on_error || self.maintain_insertion_order
    }
}

/// Global restore configuration, read from toml.
#[derive(Deserialize, Debug, Default)]
pub struct RestoreConf {
    /// target server.
    #[serde(default)]
    pub target: TargetConf,
    /// where the dump comes from.
    #[serde(default)]
    pub input: InputConf,
    /// restore behaviour.
    #[serde(default)]
    pub restore: RestoreSection,
    /// oplog replay behaviour.
    #[serde(default)]
    pub oplog: OplogConf,
}

impl RestoreConf {
    /// Read configuration from toml file at `path`.
    pub fn from_file(path: &Path) -> Result<RestoreConf> {
        let data = std::fs::read(path)?;
        toml::from_slice(&data).map_err(|source| RestoreError::ConfigFileError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// get target mongodb uri.
    pub fn get_target_uri(&self) -> &str {
        &self.target.uri
    }

    /// get the dump location.
    pub fn get_dir(&self) -> &Path {
        &self.input.dir
    }

    /// get the archive to restore, if any.
    pub fn get_archive(&self) -> Option<&str> {
        self.input.archive.as_deref()
    }

    /// Build [RestoreOptions] from this configuration.
    pub fn restore_options(&self) -> Result<RestoreOptions> {
        let section = &self.restore;
        let oplog_limit = match &self.oplog.limit {
            Some(limit) => Some(time_helper::parse_timestamp(limit)?),
            None => None,
        };
        Ok(RestoreOptions {
            drop: section.drop,
            dry_run: section.dry_run,
            write_concern: section.write_concern.as_ref().map(WriteConcernConf::to_document),
            num_parallel_collections: section.num_parallel_collections,
            num_insertion_workers: section.num_insertion_workers,
            maintain_insertion_order: section.maintain_insertion_order,
            stop_on_error: section.stop_on_error,
            bypass_document_validation: section.bypass_document_validation,
            objcheck: section.objcheck,
            no_index_restore: section.no_index_restore,
            no_options_restore: section.no_options_restore,
            preserve_uuid: section.preserve_uuid,
            restore_users_and_roles: section.restore_users_and_roles,
            oplog_replay: self.oplog.replay,
            oplog_limit,
            bulk_buffer_size: section.bulk_buffer_size,
            strategy: section.strategy,
        })
    }

    /// Build dump scanning options from this configuration.
    pub fn scan_options(&self) -> Result<ScanOptions> {
        let input = &self.input;
        if input.ns_from.len() != input.ns_to.len() {
            return Err(RestoreError::ConfigError(format!(
                "{} ns_from patterns but {} ns_to patterns, they must be paired",
                input.ns_from.len(),
                input.ns_to.len()
            )));
        }
        if input.collection.is_some() && input.db.is_none() {
            return Err(RestoreError::ConfigError(
                "restoring a single collection requires a database".to_string(),
            ));
        }
        Ok(ScanOptions {
            db: input.db.clone(),
            collection: input.collection.clone(),
            ns_include: input.ns_include.clone(),
            ns_exclude: input.ns_exclude.clone(),
            renames: input
                .ns_from
                .iter()
                .cloned()
                .zip(input.ns_to.iter().cloned())
                .collect(),
            oplog_file: input.oplog_file.clone(),
        })
    }
}

/// Target database configuration.
#[derive(Deserialize, Debug)]
pub struct TargetConf {
    /// Target database uri.  Which begins with 'mongodb://'
    #[serde(default = "default_uri")]
    pub uri: String,
}

impl Default for TargetConf {
    fn default() -> Self {
        TargetConf { uri: default_uri() }
    }
}

/// Dump location configuration.
#[derive(Deserialize, Debug)]
pub struct InputConf {
    /// dump directory, or a single bson file, `-` reads one collection from stdin.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    /// mongodump archive file to restore instead of `dir`, `-` reads it from stdin.
    pub archive: Option<String>,
    /// only restore this database.
    pub db: Option<String>,
    /// only restore this collection, `db` must be given too.
    pub collection: Option<String>,
    /// namespace patterns to restore, default is everything.
    #[serde(default)]
    pub ns_include: Vec<String>,
    /// namespace patterns to skip.
    #[serde(default)]
    pub ns_exclude: Vec<String>,
    /// rename source patterns, paired with `ns_to`.
    #[serde(default)]
    pub ns_from: Vec<String>,
    /// rename destination patterns, paired with `ns_from`.
    #[serde(default)]
    pub ns_to: Vec<String>,
    /// oplog file to replay, instead of `oplog.bson` in the dump directory.
    pub oplog_file: Option<PathBuf>,
}

impl Default for InputConf {
    fn default() -> Self {
        InputConf {
            dir: default_dir(),
            archive: None,
            db: None,
            collection: None,
            ns_include: vec![],
            ns_exclude: vec![],
            ns_from: vec![],
            ns_to: vec![],
            oplog_file: None,
        }
    }
}

/// `[restore]` table.
#[derive(Deserialize, Debug)]
pub struct RestoreSection {
    /// See [RestoreOptions::drop].
    #[serde(default)]
    pub drop: bool,
    /// See [RestoreOptions::dry_run].
    #[serde(default)]
    pub dry_run: bool,
    /// `w` of the write concern sent with inserts.
    pub write_concern: Option<WriteConcernConf>,
    /// how many collections will be restored concurrently.
    #[serde(default = "number_of_cpus")]
    pub num_parallel_collections: usize,
    /// how many threads will insert documents for one collection.
    #[serde(default = "one")]
    pub num_insertion_workers: usize,
    /// See [RestoreOptions::maintain_insertion_order].
    #[serde(default)]
    pub maintain_insertion_order: bool,
    /// See [RestoreOptions::stop_on_error].
    #[serde(default)]
    pub stop_on_error: bool,
    /// See [RestoreOptions::bypass_document_validation].
    #[serde(default)]
    pub bypass_document_validation: bool,
    /// See [RestoreOptions::objcheck].
    #[serde(default)]
    pub objcheck: bool,
    /// See [RestoreOptions::no_index_restore].
    #[serde(default)]
    pub no_index_restore: bool,
    /// See [RestoreOptions::no_options_restore].
    #[serde(default)]
    pub no_options_restore: bool,
    /// See [RestoreOptions::preserve_uuid].
    #[serde(default)]
    pub preserve_uuid: bool,
    /// See [RestoreOptions::restore_users_and_roles].
    #[serde(default = "yes")]
    pub restore_users_and_roles: bool,
    /// max documents in one insert command.
    #[serde(default = "default_bulk_buffer_size")]
    pub bulk_buffer_size: usize,
    /// order in which collections are restored.
    #[serde(default)]
    pub strategy: PriorityStrategy,
}

impl Default for RestoreSection {
    fn default() -> Self {
        // keep in sync with the serde defaults above.
        RestoreSection {
            drop: false,
            dry_run: false,
            write_concern: None,
            num_parallel_collections: number_of_cpus(),
            num_insertion_workers: one(),
            maintain_insertion_order: false,
            stop_on_error: false,
            bypass_document_validation: false,
            objcheck: false,
            no_index_restore: false,
            no_options_restore: false,
            preserve_uuid: false,
            restore_users_and_roles: yes(),
            bulk_buffer_size: default_bulk_buffer_size(),
            strategy: PriorityStrategy::default(),
        }
    }
}

/// `w` value of a write concern, either a number of nodes or a tag like "majority".
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum WriteConcernConf {
    /// number of nodes.
    Nodes(i32),
    /// tag name.
    Tag(String),
}

impl WriteConcernConf {
    /// Parse a command line value, numbers become [WriteConcernConf::Nodes].
    pub fn parse(value: &str) -> WriteConcernConf {
        match value.parse::<i32>() {
            Ok(n) => WriteConcernConf::Nodes(n),
            Err(_) => WriteConcernConf::Tag(value.to_string()),
        }
    }

    /// Convert to the `writeConcern` document of a command.
    pub fn to_document(&self) -> Document {
        match self {
            WriteConcernConf::Nodes(n) => doc! {"w": *n},
            WriteConcernConf::Tag(t) => doc! {"w": t.as_str()},
        }
    }
}

/// `[oplog]` table.
#[derive(Deserialize, Debug, Default)]
pub struct OplogConf {
    /// replay dumped oplog after restore.
    #[serde(default)]
    pub replay: bool,
    /// `<seconds>[:<ordinal>]`, entries at or after it are not replayed.
    pub limit: Option<String>,
}

fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_dir() -> PathBuf {
    PathBuf::from("dump")
}

fn default_bulk_buffer_size() -> usize {
    DEFAULT_BULK_BUFFER_SIZE
}

fn number_of_cpus() -> usize {
    num_cpus::get()
}

fn one() -> usize {
    1
}

fn yes() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let conf: RestoreConf = toml::from_str(
            r#"
            [target]
            uri = "mongodb://localhost:27018"

            [input]
            dir = "/tmp/dump"
            db = "bb"
            ns_from = ["bb.*"]
            ns_to = ["cc.*"]

            [restore]
            drop = true
            num_parallel_collections = 3
            num_insertion_workers = 2
            write_concern = "majority"
            strategy = "legacy"

            [oplog]
            replay = true
            limit = "100:2"
            "#,
        )
        .unwrap();
        assert_eq!(conf.get_target_uri(), "mongodb://localhost:27018");
        assert_eq!(conf.get_dir(), Path::new("/tmp/dump"));
        assert_eq!(conf.get_archive(), None);

        let options = conf.restore_options().unwrap();
        assert!(options.drop);
        assert_eq!(options.num_parallel_collections, 3);
        assert_eq!(options.num_insertion_workers, 2);
        assert_eq!(options.write_concern, Some(doc! {"w": "majority"}));
        assert_eq!(options.strategy, PriorityStrategy::Legacy);
        assert_eq!(
            options.oplog_limit,
            Some(Timestamp {
                time: 100,
                increment: 2
            })
        );

        let scan = conf.scan_options().unwrap();
        assert_eq!(scan.db.as_deref(), Some("bb"));
        assert_eq!(
            scan.renames,
            vec![("bb.*".to_string(), "cc.*".to_string())]
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let conf: RestoreConf = toml::from_str("").unwrap();
        let options = conf.restore_options().unwrap();
        assert_eq!(options.num_insertion_workers, 1);
        assert_eq!(options.bulk_buffer_size, DEFAULT_BULK_BUFFER_SIZE);
        assert!(options.restore_users_and_roles);
        assert!(options.check().is_ok());
    }

    #[test]
    fn test_parse_archive_input() {
        let conf: RestoreConf = toml::from_str(
            r#"
            [input]
            archive = "-"
            "#,
        )
        .unwrap();
        assert_eq!(conf.get_archive(), Some("-"));
    }

    #[test]
    fn test_unpaired_renames_are_rejected() {
        let conf: RestoreConf = toml::from_str(
            r#"
            [input]
            ns_from = ["a.*", "b.*"]
            ns_to = ["c.*"]
            "#,
        )
        .unwrap();
        assert!(conf.scan_options().is_err());
    }

    #[test]
    fn test_check_options() {
        let mut options = RestoreOptions::default();
        options.preserve_uuid = true;
        assert!(options.check().is_err());
        options.drop = true;
        assert!(options.check().is_ok());

        options.oplog_limit = Some(Timestamp {
            time: 1,
            increment: 0,
        });
        assert!(options.check().is_err());
        options.oplog_replay = true;
        assert!(options.check().is_ok());

        options.num_insertion_workers = 0;
        assert!(options.check().is_err());
    }

    #[test]
    fn test_maintain_insertion_order_forces_one_worker() {
        let mut options = RestoreOptions::default();
        options.num_insertion_workers = 8;
        options.maintain_insertion_order = true;
        assert_eq!(options.insertion_workers(), 1);
        assert!(options.ordered());
        assert!(options.fail_fast());
    }

    #[test]
    fn test_write_concern_parse() {
        assert_eq!(WriteConcernConf::parse("2").to_document(), doc! {"w": 2});
        assert_eq!(
            WriteConcernConf::parse("majority").to_document(),
            doc! {"w": "majority"}
        );
    }
}
