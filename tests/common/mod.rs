#![allow(dead_code)]

use bson::{doc, Bson, Document};
use mongo_restore::archive::{Crc64, ARCHIVE_MAGIC};
use mongo_restore::blocking::mongo_restore::frame::{encode_document, write_document};
use mongo_restore::{
    BatchOutcome, Namespace, RestoreError, RestoreTarget, Result, WriteFailure, WriteOptions,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// A collection of [MemoryTarget].
#[derive(Debug, Default, Clone)]
pub struct MemCollection {
    pub options: Document,
    pub uuid: Option<Uuid>,
    pub docs: Vec<Document>,
    pub indexes: Vec<Document>,
    ids: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct TargetState {
    pub collections: BTreeMap<String, MemCollection>,
    pub dropped: Vec<String>,
    pub insert_commands: usize,
    pub apply_batches: Vec<Vec<Document>>,
    pub merges: Vec<(Option<String>, Option<String>, bool)>,
    pub auth_version: Option<i32>,
    /// `applyOps` call (0 based) which fails.
    pub fail_apply_at: Option<usize>,
    /// namespace -> number of insert commands which succeed before every later one fails
    /// like a lost connection.
    pub fail_inserts_after: BTreeMap<String, usize>,
    /// insert commands received per namespace.
    pub insert_counts: BTreeMap<String, usize>,
    /// how long each insert command takes.
    pub insert_delay: Option<Duration>,
}

/// In memory destination, rejects duplicated `_id` like a real server, and rejects documents
/// which have `"invalid": true` like a collection validator would.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    pub state: Mutex<TargetState>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// create `ns` with `docs` before a restore runs.
    pub fn with_collection(self, ns: &str, docs: Vec<Document>) -> Self {
        {
            let mut state = self.state.lock();
            let coll = state.collections.entry(ns.to_string()).or_default();
            for d in docs {
                coll.ids.insert(id_key(&d));
                coll.docs.push(d);
            }
        }
        self
    }

    pub fn docs(&self, ns: &str) -> Vec<Document> {
        self.state
            .lock()
            .collections
            .get(ns)
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    pub fn collection(&self, ns: &str) -> Option<MemCollection> {
        self.state.lock().collections.get(ns).cloned()
    }

    /// let `after` insert commands into `ns` succeed, then fail every later one.
    pub fn failing_inserts(self, ns: &str, after: usize) -> Self {
        self.state
            .lock()
            .fail_inserts_after
            .insert(ns.to_string(), after);
        self
    }

    pub fn ids(&self, ns: &str) -> Vec<i32> {
        self.docs(ns)
            .iter()
            .filter_map(|d| d.get_i32("_id").ok())
            .collect()
    }
}

fn id_key(doc: &Document) -> String {
    format!("{:?}", doc.get("_id"))
}

impl RestoreTarget for MemoryTarget {
    fn collection_names(&self, db: &str) -> Result<Vec<String>> {
        let prefix = format!("{}.", db);
        Ok(self
            .state
            .lock()
            .collections
            .keys()
            .filter_map(|ns| ns.strip_prefix(&prefix).map(|c| c.to_string()))
            .collect())
    }

    fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        let mut state = self.state.lock();
        state.collections.remove(&ns.to_string());
        state.dropped.push(ns.to_string());
        Ok(())
    }

    fn create_collection(&self, ns: &Namespace, options: Document, uuid: Option<Uuid>) -> Result<()> {
        let mut state = self.state.lock();
        if state.collections.contains_key(&ns.to_string()) {
            return Err(RestoreError::ConfigError(format!("collection {} already exists", ns)));
        }
        state.collections.insert(
            ns.to_string(),
            MemCollection {
                options,
                uuid,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn insert_documents(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
        options: &WriteOptions,
    ) -> Result<BatchOutcome> {
        let delay = self.state.lock().insert_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock();
        state.insert_commands += 1;
        let key = ns.to_string();
        let received = {
            let count = state.insert_counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some(after) = state.fail_inserts_after.get(&key) {
            if received > *after {
                return Err(RestoreError::WriteConcernError {
                    code: 64,
                    message: "waiting for replication timed out".to_string(),
                });
            }
        }
        let coll = state.collections.entry(key).or_default();
        let mut outcome = BatchOutcome::default();
        for (index, d) in docs.into_iter().enumerate() {
            let failure = if coll.ids.contains(&id_key(&d)) {
                Some((11000, "E11000 duplicate key error"))
            } else if !options.bypass_document_validation && d.get_bool("invalid").unwrap_or(false) {
                Some((121, "Document failed validation"))
            } else {
                None
            };
            match failure {
                Some((code, message)) => {
                    outcome.failures.push(WriteFailure {
                        index,
                        code,
                        message: message.to_string(),
                    });
                    if options.ordered {
                        break;
                    }
                }
                None => {
                    coll.ids.insert(id_key(&d));
                    coll.docs.push(d);
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn create_indexes(&self, ns: &Namespace, indexes: Vec<Document>) -> Result<()> {
        let mut state = self.state.lock();
        let coll = state.collections.entry(ns.to_string()).or_default();
        coll.indexes.extend(indexes);
        Ok(())
    }

    fn apply_ops(&self, entries: Vec<Document>) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_apply_at == Some(state.apply_batches.len()) {
            return Err(RestoreError::ApplyOplogError(doc! {"ok": 0, "errmsg": "apply failed"}));
        }
        state.apply_batches.push(entries);
        Ok(())
    }

    fn auth_schema_version(&self) -> Result<Option<i32>> {
        Ok(self.state.lock().auth_version)
    }

    fn merge_auth_collections(
        &self,
        temp_users: Option<&Namespace>,
        temp_roles: Option<&Namespace>,
        drop: bool,
        _db: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        for (temp, real) in [
            (temp_users, "admin.system.users"),
            (temp_roles, "admin.system.roles"),
        ] {
            if let Some(temp) = temp {
                let docs = state
                    .collections
                    .get(&temp.to_string())
                    .map(|c| c.docs.clone())
                    .unwrap_or_default();
                let coll = state.collections.entry(real.to_string()).or_default();
                if drop {
                    coll.docs.clear();
                }
                coll.docs.extend(docs);
            }
        }
        state.merges.push((
            temp_users.map(|ns| ns.to_string()),
            temp_roles.map(|ns| ns.to_string()),
            drop,
        ));
        Ok(())
    }
}

/// A dump directory on disk, removed on drop.
pub struct Context {
    pub dir: TempDir,
}

impl Context {
    pub fn new() -> Self {
        Context {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// write `docs` as `<db>/<coll>.bson`.
    pub fn write_collection(&self, db: &str, coll: &str, docs: &[Document]) -> PathBuf {
        let path = self.db_dir(db).join(format!("{}.bson", coll));
        write_bson(&path, docs);
        path
    }

    /// write `<db>/<coll>.metadata.json`.
    pub fn write_metadata(&self, db: &str, coll: &str, metadata: &str) -> PathBuf {
        let path = self.db_dir(db).join(format!("{}.metadata.json", coll));
        std::fs::write(&path, metadata).unwrap();
        path
    }

    /// write `oplog.bson` in dump root.
    pub fn write_oplog(&self, entries: &[Document]) -> PathBuf {
        let path = self.root().join("oplog.bson");
        write_bson(&path, entries);
        path
    }

    fn db_dir(&self, db: &str) -> PathBuf {
        let dir = self.root().join(db);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}

pub fn write_bson(path: &Path, docs: &[Document]) {
    let mut data = vec![];
    for d in docs {
        write_document(&mut data, d).unwrap();
    }
    std::fs::write(path, data).unwrap();
}

const ARCHIVE_TERMINATOR: [u8; 4] = [0xff; 4];

/// A collection in an archive built by [build_archive]: `(db, collection, metadata, docs)`.
pub type ArchivedCollection<'a> = (&'a str, &'a str, &'a str, &'a [Document]);

/// Build a mongodump archive, collections are interleaved two documents at a time like a
/// concurrent mongodump does.
pub fn build_archive(collections: &[ArchivedCollection]) -> Vec<u8> {
    let mut out = ARCHIVE_MAGIC.to_le_bytes().to_vec();
    let header = doc! {
        "concurrent_collections": 4,
        "version": "0.1",
        "server_version": "5.0.6",
        "tool_version": "100.5.2",
    };
    write_document(&mut out, &header).unwrap();
    for (db, coll, metadata, _) in collections {
        let entry = doc! {
            "db": *db,
            "collection": *coll,
            "metadata": *metadata,
            "size": 0,
            "type": "collection",
        };
        write_document(&mut out, &entry).unwrap();
    }
    out.extend(ARCHIVE_TERMINATOR);

    let mut crcs = vec![Crc64::new(); collections.len()];
    let mut offset = 0;
    loop {
        let mut wrote = false;
        for (i, (db, coll, _, docs)) in collections.iter().enumerate() {
            let rest = docs.get(offset..).unwrap_or(&[]);
            let chunk = &rest[..rest.len().min(2)];
            if chunk.is_empty() {
                continue;
            }
            wrote = true;
            let header = doc! {"db": *db, "collection": *coll, "EOF": false, "CRC": 0i64};
            write_document(&mut out, &header).unwrap();
            for d in chunk {
                let frame = encode_document(d).unwrap();
                crcs[i].update(&frame);
                out.extend(frame);
            }
            out.extend(ARCHIVE_TERMINATOR);
        }
        if !wrote {
            break;
        }
        offset += 2;
    }
    for ((db, coll, _, _), crc) in collections.iter().zip(crcs) {
        let crc = crc.sum() as i64;
        let header = doc! {"db": *db, "collection": *coll, "EOF": true, "CRC": crc};
        write_document(&mut out, &header).unwrap();
        out.extend(ARCHIVE_TERMINATOR);
    }
    out
}

/// `n` documents with `_id` 1..=n.
pub fn numbered_docs(n: i32) -> Vec<Document> {
    (1..=n).map(|i| doc! {"_id": i, "value": format!("doc-{}", i)}).collect()
}

pub fn insert_entry(time: u32, ns: &str, id: i32) -> Document {
    doc! {
        "ts": bson::Timestamp { time, increment: 1 },
        "v": 2,
        "op": "i",
        "ns": ns,
        "o": {"_id": id, "payload": Bson::String("x".repeat(100))},
    }
}
