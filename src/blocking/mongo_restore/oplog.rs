//! Oplog entries as they are found in a dumped `oplog.bson`.
//!
//! Useful fields:
//! ts: The time when the oplog entry was created. (Timestamp)
//! h: History id, unique per entry on old servers. (i64, optional)
//! v: Version. (i32)
//! op: The operation type. (i/u/d/c/n)
//! ns: The namespace on which to apply the operation. (String)
//! ui: The uuid of the collection. (Binary, optional)
//! o: The operation applied. (Document)
//! o2: Additional information about the operation applied. (Document, optional)

use super::frame::decode_document;
use crate::error::{RestoreError, Result};
use crate::{
    CONFIG_DB, HISTORY_KEY, NAMESPACE_KEY, OBJ_KEY, OPLOG_DB, OP_KEY, TIMESTAMP_KEY,
    UUID_KEY, VERSION_KEY,
};
use bson::{Bson, Document, Timestamp};
use std::fmt;

const INSERT_OP: &str = "i";
const UPDATE_OP: &str = "u";
const DELETE_OP: &str = "d";
const COMMAND_OP: &str = "c";
const NOOP_OP: &str = "n";

/// Namespaces in `config` which only make sense on the server which wrote the oplog.
const SKIPPED_CONFIG_COLLS: [&str; 2] = ["system.sessions", "transactions"];

/// Operation type of an oplog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// `i`
    Insert,
    /// `u`
    Update,
    /// `d`
    Delete,
    /// `c`
    Command,
    /// `n`
    Noop,
}

impl OpType {
    fn parse(op: &str) -> Option<OpType> {
        match op {
            INSERT_OP => Some(OpType::Insert),
            UPDATE_OP => Some(OpType::Update),
            DELETE_OP => Some(OpType::Delete),
            COMMAND_OP => Some(OpType::Command),
            NOOP_OP => Some(OpType::Noop),
            _ => None,
        }
    }
}

/// One decoded oplog entry.
///
/// The whole document is kept, it's sent back to the server unchanged (apart from `ui`).
#[derive(Debug, Clone)]
pub struct OplogEntry {
    /// logical time of the entry.
    pub ts: Timestamp,
    /// history id, not written by recent servers.
    pub history: Option<i64>,
    /// format version.
    pub version: i32,
    /// operation type.
    pub op: OpType,
    /// target namespace.
    pub ns: String,
    raw: Document,
    size: usize,
}

impl OplogEntry {
    /// Decode an entry from one frame, the frame length is kept as entry size.
    pub fn from_frame(frame: &[u8]) -> Result<OplogEntry> {
        let mut entry = OplogEntry::from_doc(decode_document(frame)?)?;
        entry.size = frame.len();
        Ok(entry)
    }

    /// Parse an entry from document `doc`.
    pub fn from_doc(doc: Document) -> Result<OplogEntry> {
        let op = doc.get_str(OP_KEY)?;
        let op = OpType::parse(op).ok_or_else(|| {
            RestoreError::InvalidOplogEntry(format!("unknown operation type {:?}", op))
        })?;
        let history = match doc.get(HISTORY_KEY) {
            Some(Bson::Int64(h)) => Some(*h),
            Some(Bson::Int32(h)) => Some(*h as i64),
            _ => None,
        };
        let version = match doc.get(VERSION_KEY) {
            Some(Bson::Int32(v)) => *v,
            Some(Bson::Int64(v)) => *v as i32,
            _ => 1,
        };
        Ok(OplogEntry {
            ts: doc.get_timestamp(TIMESTAMP_KEY)?,
            history,
            version,
            op,
            ns: doc.get_str(NAMESPACE_KEY)?.to_string(),
            size: 0,
            raw: doc,
        })
    }

    /// Remove collection uuids, including the ones of entries nested in an `applyOps` command.
    ///
    /// Collections restored without their original uuid would reject entries which name it.
    pub fn strip_uuid(&mut self) {
        strip_uuid(&mut self.raw);
        if self.op != OpType::Command {
            return;
        }
        if let Ok(obj) = self.raw.get_document_mut(OBJ_KEY) {
            if let Ok(nested) = obj.get_array_mut("applyOps") {
                for entry in nested.iter_mut() {
                    if let Bson::Document(entry) = entry {
                        strip_uuid(entry);
                    }
                }
            }
        }
    }

    /// true if the entry shouldn't be replayed on another server.
    pub fn is_skipped_namespace(&self) -> bool {
        let (db, coll) = self.ns.split_once('.').unwrap_or((self.ns.as_str(), ""));
        db == OPLOG_DB || (db == CONFIG_DB && SKIPPED_CONFIG_COLLS.contains(&coll))
    }

    /// encoded size, 0 if the entry wasn't decoded from a frame.
    pub fn size(&self) -> usize {
        self.size
    }

    /// get the entry document back.
    pub fn into_document(self) -> Document {
        self.raw
    }
}

impl fmt::Display for OplogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} on {} at {}:{}", self.op, self.ns, self.ts.time, self.ts.increment)
    }
}

fn strip_uuid(doc: &mut Document) {
    doc.remove(UUID_KEY);
}
