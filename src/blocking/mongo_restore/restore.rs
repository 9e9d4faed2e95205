use super::bulk::BufferedBulkInserter;
use super::frame::{validate_frame, FrameReader};
use super::intent::{Intent, Namespace};
use super::known_colls::KnownCollections;
use super::manager::IntentManager;
use super::metadata::{check_index_name, ensure_index_name, indexes_from_catalog, CollectionMetadata};
use super::oplog_replay::{OplogReplayer, ReplayStats};
use super::progress::Progress;
use super::result::RestoreResult;
use super::termination::Termination;
use super::bson_helper;
use crate::blocking::{BatchOutcome, DataSource, RestoreTarget, WriteFailureKind, WriteOptions};
use crate::config::RestoreOptions;
use crate::error::{RestoreError, Result};
use crate::ADMIN_DB_NAME;
use bson::{Bson, Document};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use rayon::ThreadPoolBuilder;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Frames buffered between the producer and the insertion workers, per worker.
const DOC_CHANNEL_DEPTH_PER_WORKER: usize = 256;

const TEMP_USERS_COLL: &str = "tempusers";
const TEMP_ROLES_COLL: &str = "temproles";
const AUTH_SCHEMA_ID: &str = "authSchema";
/// First auth schema version which stores SCRAM credentials, older ones can't be mixed with it.
const AUTH_SCHEMA_SCRAM: i32 = 3;

/// `system.indexes` content per database.
type IndexCatalogs = HashMap<String, Vec<Document>>;

/// One restore run.
///
/// Holds everything a run needs, nothing is shared between runs.  Create it with the
/// intents to restore, then call [restore](MongoRestore::restore) once.
pub struct MongoRestore<T: RestoreTarget> {
    target: T,
    options: RestoreOptions,
    manager: IntentManager,
    known: KnownCollections,
    termination: Termination,
}

impl<T: RestoreTarget> MongoRestore<T> {
    /// create a restore run which restores intents of `manager` into `target`.
    pub fn new(target: T, options: RestoreOptions, manager: IntentManager) -> Self {
        MongoRestore {
            target,
            options,
            manager,
            known: KnownCollections::new(),
            termination: Termination::new(),
        }
    }

    /// Handle to stop the run from outside, e.g. from a signal handler.
    pub fn termination(&self) -> Termination {
        self.termination.clone()
    }

    /// get the restore target.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// get the intent manager.
    pub fn manager(&self) -> &IntentManager {
        &self.manager
    }

    /// Restore every intent, then users and roles, then replay the oplog when asked to.
    ///
    /// Counts of every collection are added up, the first fatal error stops new work and is
    /// returned in [RestoreResult::err].  Nothing already written is rolled back.
    pub fn restore(&self) -> RestoreResult {
        if let Err(e) = self.prepare() {
            error!(?e, "Invalid restore configuration.");
            return RestoreResult::from_err(e);
        }
        if self.options.dry_run {
            self.log_plan();
            return RestoreResult::default();
        }
        if let Err(e) = self.check_auth_version() {
            error!(?e, "Can't restore users and roles.");
            return RestoreResult::from_err(e);
        }

        let mut result = self.restore_intents();
        if result.is_ok() && self.termination.is_terminated() {
            // stopped from outside before any intent failed.
            result.combine(RestoreResult::from_err(RestoreError::Terminated));
        }
        if result.is_ok() {
            result.combine(self.restore_users_and_roles());
        }
        if result.is_ok() && self.options.oplog_replay {
            if let Err(e) = self.replay_oplog() {
                error!(?e, "Replay oplog failed.");
                result.combine(RestoreResult::from_err(e));
            }
        }

        match &result.err {
            None => info!("{}", result),
            Some(e) => error!(error = %e, "Restore failed. {}", result),
        }
        result
    }

    /// Validate options and intents, before anything touches the target.
    fn prepare(&self) -> Result<()> {
        self.options.check()?;
        if self.options.oplog_replay && self.manager.oplog().is_none() {
            return Err(RestoreError::ConfigError(
                "no oplog file to replay, the dump should contain oplog.bson".to_string(),
            ));
        }
        if !self.options.oplog_replay && self.manager.oplog().is_some() {
            debug!("Found an oplog, but oplog replay is not enabled.");
        }
        self.manager.finalize(self.options.strategy)
    }

    fn log_plan(&self) {
        info!("Dry run, nothing is written.");
        for intent in self.manager.queued() {
            info!(
                %intent,
                size = intent.size,
                has_data = intent.data.is_some(),
                has_metadata = intent.metadata.is_some(),
                drop = self.options.drop,
                "Would restore collection."
            );
        }
        if self.options.restore_users_and_roles
            && (self.manager.users().is_some() || self.manager.roles().is_some())
        {
            info!("Would restore users and roles.");
        }
        if self.options.oplog_replay {
            info!(limit = ?self.options.oplog_limit, "Would replay oplog.");
        }
    }

    /// Restore queued intents with `num_parallel_collections` workers.
    fn restore_intents(&self) -> RestoreResult {
        let catalogs = match self.load_index_catalogs() {
            Ok(c) => c,
            Err(e) => return RestoreResult::from_err(e),
        };
        let workers = self.options.num_parallel_collections;
        let pool = match ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("restore-worker-{}", idx))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => return RestoreResult::from_err(e.into()),
        };

        info!(collections = self.manager.len(), workers, "Start restoring collections.");
        let (sender, receiver) = channel::unbounded();
        pool.scope(|s| {
            for _ in 0..workers {
                let sender = sender.clone();
                let catalogs = &catalogs;
                s.spawn(move |_| self.intent_worker(catalogs, sender));
            }
        });
        drop(sender);

        let mut result = RestoreResult::default();
        for intent_result in receiver.try_iter() {
            result.combine(intent_result);
        }
        result
    }

    fn intent_worker(&self, catalogs: &IndexCatalogs, sender: Sender<RestoreResult>) {
        while !self.termination.is_terminated() {
            let intent = match self.manager.pop() {
                Some(intent) => intent,
                None => break,
            };
            let result = self.restore_intent(&intent, catalogs);
            if let Some(e) = &result.err {
                if !e.is_terminated() {
                    error!(error = %e, "Restore collection failed, stop restoring.");
                }
                self.termination.terminate();
            }
            self.manager.finish(&intent);
            let _ = sender.send(result);
        }
    }

    /// Restore one intent, errors come back with its namespace attached.
    fn restore_intent(&self, intent: &Intent, catalogs: &IndexCatalogs) -> RestoreResult {
        let ns = intent.dest.to_string();
        info!(%intent, "Restoring collection.");
        let mut result = self.restore_collection(intent, catalogs);
        info!(
            %ns,
            "restored {} documents, {} failures",
            result.successes,
            result.failures
        );
        result.err = result.err.map(|e| e.with_namespace(ns));
        result
    }

    fn restore_collection(&self, intent: &Intent, catalogs: &IndexCatalogs) -> RestoreResult {
        let dest = &intent.dest;
        let metadata = match self.collection_metadata(intent, catalogs) {
            Ok(m) => m,
            Err(e) => return RestoreResult::from_err(e),
        };
        let indexes = match self.indexes_to_build(dest, &metadata) {
            Ok(indexes) => indexes,
            Err(e) => return RestoreResult::from_err(e),
        };

        if let Err(e) = self.setup_collection(dest, &metadata) {
            return RestoreResult::from_err(e);
        }

        let mut result = match &intent.data {
            Some(data) => self.restore_documents(dest, data.as_ref()),
            None => {
                debug!(%dest, "No data file, only create collection.");
                RestoreResult::default()
            }
        };
        if !result.is_ok() {
            return result;
        }

        if !indexes.is_empty() {
            info!(%dest, count = indexes.len(), "Building indexes.");
            if let Err(e) = self.target.create_indexes(dest, indexes) {
                result.err = Some(e);
            }
        }
        result
    }

    fn collection_metadata(&self, intent: &Intent, catalogs: &IndexCatalogs) -> Result<CollectionMetadata> {
        let mut metadata = match &intent.metadata {
            Some(source) => CollectionMetadata::read(source.as_ref())?,
            None => CollectionMetadata::default(),
        };
        if metadata.indexes.is_empty() {
            if let Some(catalog) = catalogs.get(&intent.source.db) {
                metadata.indexes = indexes_from_catalog(catalog, &intent.source);
            }
        }
        if self.options.no_options_restore {
            metadata.options = Document::new();
        }
        if self.options.preserve_uuid && metadata.uuid.is_none() {
            warn!(ns = %intent.dest, "No uuid in metadata, the collection gets a new one.");
        }
        Ok(metadata)
    }

    /// Secondary indexes to build after documents are inserted, checked before anything
    /// is written.
    fn indexes_to_build(&self, dest: &Namespace, metadata: &CollectionMetadata) -> Result<Vec<Document>> {
        if self.options.no_index_restore {
            return Ok(vec![]);
        }
        let mut indexes = metadata.secondary_indexes();
        for spec in indexes.iter_mut() {
            ensure_index_name(spec);
            check_index_name(dest, spec)?;
        }
        Ok(indexes)
    }

    /// CheckExists, drop when asked to, then create with options.
    fn setup_collection(&self, dest: &Namespace, metadata: &CollectionMetadata) -> Result<()> {
        let mut exists = self.known.exists(&self.target, &dest.db, &dest.coll)?;
        if exists && self.options.drop {
            info!(%dest, "Dropping collection before restoring.");
            self.target.drop_collection(dest)?;
            self.known.remove(&dest.db, &dest.coll);
            exists = false;
        }
        if exists {
            info!(%dest, "Collection already exists, skip creating it.");
            return Ok(());
        }

        let mut options = metadata.options.clone();
        if let Some(id_index) = metadata.id_index() {
            options.insert("idIndex", id_index);
        }
        let uuid = if self.options.preserve_uuid {
            metadata.uuid
        } else {
            None
        };
        debug!(%dest, ?options, ?uuid, "Creating collection.");
        self.target.create_collection(dest, options, uuid)?;
        self.known.add(&dest.db, &dest.coll);
        Ok(())
    }

    /// Stream frames of `data` into `dest`: this thread reads, insertion workers write.
    fn restore_documents(&self, dest: &Namespace, data: &dyn DataSource) -> RestoreResult {
        let mut reader = match data.open() {
            Ok(r) => FrameReader::new(r),
            Err(e) => return RestoreResult::from_err(e),
        };
        let progress = Progress::new(dest.to_string(), data.size());
        let workers = self.options.insertion_workers();
        let write_options = WriteOptions {
            ordered: self.options.ordered(),
            bypass_document_validation: self.options.bypass_document_validation,
            write_concern: self.options.write_concern.clone(),
        };
        let (doc_tx, doc_rx) = channel::bounded(workers * DOC_CHANNEL_DEPTH_PER_WORKER);

        std::thread::scope(|s| {
            let mut result = RestoreResult::default();
            let mut handles = Vec::with_capacity(workers);
            for idx in 0..workers {
                let doc_rx = doc_rx.clone();
                let (progress, write_options) = (&progress, &write_options);
                let spawned = std::thread::Builder::new()
                    .name(format!("insert-{}-{}", dest, idx))
                    .spawn_scoped(s, move || {
                        self.insertion_worker(dest, doc_rx, write_options, progress)
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        result.err = Some(e.into());
                        self.termination.terminate();
                        break;
                    }
                }
            }
            drop(doc_rx);

            if let Err(e) = self.produce(&mut reader, doc_tx) {
                if !e.is_terminated() {
                    self.termination.terminate();
                }
                result.combine(RestoreResult::from_err(e));
            }

            for handle in handles {
                match handle.join() {
                    Ok(worker_result) => result.combine(worker_result),
                    Err(_) => {
                        self.termination.terminate();
                        result.combine(RestoreResult::from_err(RestoreError::WorkerPanicked));
                    }
                }
            }
            result
        })
    }

    /// Feed frames to insertion workers until the stream ends or the run is terminated.
    ///
    /// `doc_tx` is dropped on return, which tells workers there is nothing more to insert.
    fn produce<R: Read>(&self, reader: &mut FrameReader<R>, doc_tx: Sender<Vec<u8>>) -> Result<()> {
        let term_rx = self.termination.receiver();
        while let Some(frame) = reader.next_owned_frame()? {
            if self.termination.is_terminated() {
                return Err(RestoreError::Terminated);
            }
            select! {
                send(doc_tx, frame) -> res => {
                    if res.is_err() {
                        // every worker is gone, they report why.
                        return Ok(());
                    }
                }
                recv(term_rx) -> _ => return Err(RestoreError::Terminated),
            }
        }
        Ok(())
    }

    fn insertion_worker(
        &self,
        ns: &Namespace,
        doc_rx: Receiver<Vec<u8>>,
        write_options: &WriteOptions,
        progress: &Progress,
    ) -> RestoreResult {
        let mut inserter = BufferedBulkInserter::new(
            &self.target,
            ns,
            write_options.clone(),
            self.options.bulk_buffer_size,
        );
        let mut result = RestoreResult::default();

        for frame in doc_rx.iter() {
            if self.termination.is_terminated() {
                result.err = Some(RestoreError::Terminated);
                return result;
            }
            let inserted = self.validate(&frame).and_then(|_| inserter.insert_raw(&frame));
            let tallied = inserted.and_then(|outcome| match outcome {
                Some(outcome) => self.tally(&mut result, outcome),
                None => Ok(()),
            });
            if let Err(e) = tallied {
                self.termination.terminate();
                result.err = Some(e);
                return result;
            }
            progress.add(frame.len() as u64);
        }

        if self.termination.is_terminated() {
            result.err = Some(RestoreError::Terminated);
            return result;
        }
        if let Err(e) = inserter.flush().and_then(|outcome| self.tally(&mut result, outcome)) {
            self.termination.terminate();
            result.err = Some(e);
        }
        result
    }

    fn validate(&self, frame: &[u8]) -> Result<()> {
        if self.options.objcheck {
            validate_frame(frame)?;
        }
        Ok(())
    }

    /// Count a batch outcome into `result`, rejected documents are fatal under fail fast.
    fn tally(&self, result: &mut RestoreResult, outcome: BatchOutcome) -> Result<()> {
        result.successes += outcome.inserted;
        for failure in outcome.failures {
            if failure.kind() == WriteFailureKind::Other || self.options.fail_fast() {
                return Err(RestoreError::WriteError {
                    code: failure.code,
                    message: failure.message,
                });
            }
            result.failures += 1;
            debug!(code = failure.code, message = %failure.message, "Document rejected.");
        }
        Ok(())
    }

    fn load_index_catalogs(&self) -> Result<IndexCatalogs> {
        let mut catalogs = IndexCatalogs::new();
        for db in self.manager.system_index_dbs() {
            let data = match self.manager.system_indexes(&db).and_then(|i| i.data) {
                Some(data) => data,
                None => continue,
            };
            let specs = FrameReader::new(data.open()?).collect::<Result<Vec<_>>>()?;
            debug!(%db, count = specs.len(), "Loaded system.indexes.");
            catalogs.insert(db, specs);
        }
        Ok(catalogs)
    }

    /// Refuse to restore users and roles between servers which store credentials differently.
    fn check_auth_version(&self) -> Result<()> {
        if !self.restores_users_and_roles() {
            return Ok(());
        }
        let dump_version = match self.dumped_auth_version()? {
            Some(v) => v,
            None => {
                warn!("No auth schema version in dump, assume it's compatible with the server.");
                return Ok(());
            }
        };
        let server_version = match self.target.auth_schema_version()? {
            Some(v) => v,
            None => {
                warn!("Server doesn't record its auth schema version, assume it's compatible.");
                return Ok(());
            }
        };
        if (dump_version < AUTH_SCHEMA_SCRAM) != (server_version < AUTH_SCHEMA_SCRAM) {
            return Err(RestoreError::ConfigError(format!(
                "users and roles dumped with auth schema version {} can't be restored into a server with version {}",
                dump_version, server_version
            )));
        }
        Ok(())
    }

    fn dumped_auth_version(&self) -> Result<Option<i32>> {
        let data = match self.manager.auth_version().and_then(|i| i.data) {
            Some(data) => data,
            None => return Ok(None),
        };
        for doc in FrameReader::new(data.open()?) {
            let doc = doc?;
            if doc.get("_id") == Some(&Bson::String(AUTH_SCHEMA_ID.to_string())) {
                return Ok(Some(bson_helper::get_number(&doc, "currentVersion")? as i32));
            }
        }
        Ok(None)
    }

    fn restores_users_and_roles(&self) -> bool {
        self.options.restore_users_and_roles
            && (has_data(self.manager.users()) || has_data(self.manager.roles()))
    }

    /// Restore users and roles into temporary collections, then let the server merge them.
    fn restore_users_and_roles(&self) -> RestoreResult {
        if !self.restores_users_and_roles() {
            return RestoreResult::default();
        }
        let temp_users = Namespace::new(ADMIN_DB_NAME, TEMP_USERS_COLL);
        let temp_roles = Namespace::new(ADMIN_DB_NAME, TEMP_ROLES_COLL);
        let users = self.manager.users().and_then(|i| i.data);
        let roles = self.manager.roles().and_then(|i| i.data);

        let mut result = RestoreResult::default();
        for (data, temp) in [(&users, &temp_users), (&roles, &temp_roles)] {
            if let Some(data) = data {
                result.combine(self.restore_temp_collection(temp, data));
                if !result.is_ok() {
                    return result;
                }
            }
        }

        info!("Merging users and roles.");
        let merged = self.target.merge_auth_collections(
            users.as_ref().map(|_| &temp_users),
            roles.as_ref().map(|_| &temp_roles),
            self.options.drop,
            None,
        );
        for temp in [&temp_users, &temp_roles] {
            if let Err(e) = self.target.drop_collection(temp) {
                warn!(ns = %temp, error = %e, "Can't drop temporary collection.");
            }
        }
        if let Err(e) = merged {
            result.combine(RestoreResult::from_err(e.with_namespace("admin.system.users")));
        }
        result
    }

    fn restore_temp_collection(&self, temp: &Namespace, data: &Arc<dyn DataSource>) -> RestoreResult {
        if let Err(e) = self.target.drop_collection(temp) {
            return RestoreResult::from_err(e.with_namespace(temp.to_string()));
        }
        let mut result = self.restore_documents(temp, data.as_ref());
        result.err = result.err.map(|e| e.with_namespace(temp.to_string()));
        result
    }

    fn replay_oplog(&self) -> Result<ReplayStats> {
        let data = match self.manager.oplog().and_then(|i| i.data) {
            Some(data) => data,
            None => return Err(RestoreError::ConfigError("no oplog file to replay".to_string())),
        };
        info!(source = %data.location(), "Replaying oplog.");
        let mut reader = FrameReader::new(data.open()?);
        OplogReplayer::new(&self.target)
            .with_limit(self.options.oplog_limit)
            .with_preserve_uuid(self.options.preserve_uuid)
            .with_termination(self.termination.clone())
            .replay(&mut reader)
    }
}

fn has_data(intent: Option<Intent>) -> bool {
    intent.map(|i| i.data.is_some()).unwrap_or(false)
}
