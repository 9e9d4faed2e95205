use clap::Parser;
use mongo_restore::config::{RestoreConf, WriteConcernConf};
use mongo_restore::{archive, dump_dir, Connection, IntentManager, MongoRestore, Termination};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// dump directory, a single .bson file, or - to read one collection from stdin.
    dir: Option<PathBuf>,
    /// restore a mongodump archive file, or stdin when no file is given.
    #[clap(long, min_values = 0, require_equals = true, default_missing_value = "-")]
    archive: Option<String>,
    /// configuration file, command line flags override it.
    #[clap(long)]
    conf: Option<PathBuf>,
    /// mongodb uri to restore into.
    #[clap(long)]
    uri: Option<String>,
    /// log file path, if not specified, all log information will be output to stdout.
    #[clap(long)]
    log_path: Option<String>,
    /// only restore this database.
    #[clap(short, long)]
    db: Option<String>,
    /// only restore this collection.
    #[clap(short, long)]
    collection: Option<String>,
    /// namespace pattern to restore, can be given many times.
    #[clap(long)]
    ns_include: Vec<String>,
    /// namespace pattern to skip, can be given many times.
    #[clap(long)]
    ns_exclude: Vec<String>,
    /// rename namespaces matching this pattern, paired with --ns-to.
    #[clap(long)]
    ns_from: Vec<String>,
    /// rename target pattern, paired with --ns-from.
    #[clap(long)]
    ns_to: Vec<String>,
    /// drop each collection before restoring it.
    #[clap(long)]
    drop: bool,
    /// only show what would be restored.
    #[clap(long)]
    dry_run: bool,
    /// write concern, a number of nodes or a tag like "majority".
    #[clap(long = "w")]
    write_concern: Option<String>,
    /// how many collections are restored concurrently.
    #[clap(short = 'j', long)]
    num_parallel_collections: Option<usize>,
    /// how many insertion workers run for one collection.
    #[clap(long)]
    num_insertion_workers: Option<usize>,
    /// restore documents in dump order, with one worker per collection.
    #[clap(long)]
    maintain_insertion_order: bool,
    /// stop at the first rejected document.
    #[clap(long)]
    stop_on_error: bool,
    /// skip schema validation on the server.
    #[clap(long)]
    bypass_document_validation: bool,
    /// validate every document before sending it.
    #[clap(long)]
    objcheck: bool,
    /// don't restore indexes.
    #[clap(long)]
    no_index_restore: bool,
    /// don't restore collection options.
    #[clap(long)]
    no_options_restore: bool,
    /// create collections with their dumped uuid, requires --drop.
    #[clap(long)]
    preserve_uuid: bool,
    /// replay oplog.bson after collections are restored.
    #[clap(long)]
    oplog_replay: bool,
    /// only replay oplog entries before <seconds>[:<ordinal>].
    #[clap(long)]
    oplog_limit: Option<String>,
    /// oplog file to replay.
    #[clap(long)]
    oplog_file: Option<PathBuf>,
}

impl Opts {
    /// Load configuration file if any, then apply command line flags on top of it.
    fn into_conf(self) -> Result<RestoreConf, Box<dyn std::error::Error>> {
        let mut conf = match &self.conf {
            Some(path) => RestoreConf::from_file(path)?,
            None => RestoreConf::default(),
        };

        if let Some(uri) = self.uri {
            conf.target.uri = uri;
        }
        let input = &mut conf.input;
        if let Some(dir) = self.dir {
            input.dir = dir;
        }
        if self.archive.is_some() {
            input.archive = self.archive;
        }
        if self.db.is_some() {
            input.db = self.db;
        }
        if self.collection.is_some() {
            input.collection = self.collection;
        }
        input.ns_include.extend(self.ns_include);
        input.ns_exclude.extend(self.ns_exclude);
        input.ns_from.extend(self.ns_from);
        input.ns_to.extend(self.ns_to);
        if self.oplog_file.is_some() {
            input.oplog_file = self.oplog_file;
        }

        let restore = &mut conf.restore;
        restore.drop |= self.drop;
        restore.dry_run |= self.dry_run;
        if let Some(w) = self.write_concern {
            restore.write_concern = Some(WriteConcernConf::parse(&w));
        }
        if let Some(n) = self.num_parallel_collections {
            restore.num_parallel_collections = n;
        }
        if let Some(n) = self.num_insertion_workers {
            restore.num_insertion_workers = n;
        }
        restore.maintain_insertion_order |= self.maintain_insertion_order;
        restore.stop_on_error |= self.stop_on_error;
        restore.bypass_document_validation |= self.bypass_document_validation;
        restore.objcheck |= self.objcheck;
        restore.no_index_restore |= self.no_index_restore;
        restore.no_options_restore |= self.no_options_restore;
        restore.preserve_uuid |= self.preserve_uuid;

        conf.oplog.replay |= self.oplog_replay;
        if self.oplog_limit.is_some() {
            conf.oplog.limit = self.oplog_limit;
        }
        Ok(conf)
    }
}

/// Raise `termination` on Ctrl-C.
fn watch_ctrl_c(termination: Termination) -> std::io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("signal handler".to_string())
        .spawn(move || {
            rt.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Received Ctrl-C, stop after in-flight writes are done.");
                    termination.terminate();
                }
            })
        })?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match &opts.log_path {
        Some(path) => {
            let path = Path::new(path);
            let dir_name = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or("log path must point to a file")?;
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let conf = opts.into_conf()?;
    let options = conf.restore_options()?;
    let scan_options = conf.scan_options()?;

    let manager = IntentManager::new();
    // spool files of an archive are removed when this is dropped.
    let _spooled = match conf.get_archive() {
        Some("-") => {
            info!("Reading archive from stdin.");
            Some(archive::scan(std::io::stdin(), &scan_options, &manager)?)
        }
        Some(path) => {
            info!(path, "Reading archive.");
            Some(archive::scan(File::open(path)?, &scan_options, &manager)?)
        }
        None if conf.get_dir() == Path::new("-") => {
            info!("Reading collection from stdin.");
            dump_dir::scan_stream(Box::new(std::io::stdin()), &scan_options, &manager)?;
            None
        }
        None => {
            info!(dir = %conf.get_dir().display(), "Scanning dump.");
            dump_dir::scan(conf.get_dir(), &scan_options, &manager)?;
            None
        }
    };

    let conn = Connection::new(conf.get_target_uri())?;
    if !options.dry_run {
        conn.check_permissions()?;
    }
    let restore = MongoRestore::new(conn, options, manager);
    watch_ctrl_c(restore.termination())?;

    let result = restore.restore();
    if let Some(e) = result.err {
        error!(error = %e, "Restore failed.");
        return Err(e.into());
    }
    Ok(())
}
