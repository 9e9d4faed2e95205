//! The destination a dump is restored into.

use super::mongo_restore::Namespace;
use crate::error::Result;
use bson::Document;
use uuid::Uuid;

/// mongodb error code for duplicate key.
pub const DUPLICATE_KEY_CODE: i32 = 11000;
/// mongodb error code for document validation failure.
pub const DOCUMENT_VALIDATION_CODE: i32 = 121;

/// Options passed through unchanged to every insert command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOptions {
    /// stop at the first failing document.
    pub ordered: bool,
    /// skip schema validation on the server.
    pub bypass_document_validation: bool,
    /// `writeConcern` document.
    pub write_concern: Option<Document>,
}

/// How a rejected document failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailureKind {
    /// unique index violation.
    DuplicateKey,
    /// collection validator rejected the document.
    Validation,
    /// anything else.
    Other,
}

/// One document rejected by an insert command.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteFailure {
    /// position of the document in the batch.
    pub index: usize,
    /// server error code.
    pub code: i32,
    /// server error message.
    pub message: String,
}

impl WriteFailure {
    /// Classify the failure by its server error code.
    pub fn kind(&self) -> WriteFailureKind {
        match self.code {
            DUPLICATE_KEY_CODE => WriteFailureKind::DuplicateKey,
            DOCUMENT_VALIDATION_CODE => WriteFailureKind::Validation,
            _ => WriteFailureKind::Other,
        }
    }
}

/// Result of one insert command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// documents written.
    pub inserted: u64,
    /// documents rejected.
    pub failures: Vec<WriteFailure>,
}

impl BatchOutcome {
    /// Merge `other` into this outcome.
    pub fn merge(&mut self, other: BatchOutcome) {
        self.inserted += other.inserted;
        self.failures.extend(other.failures);
    }
}

/// Operations the restore engine and oplog replayer need from a destination.
///
/// Errors returned from these methods are fatal; rejected documents are not errors, they
/// come back in [BatchOutcome::failures].
pub trait RestoreTarget: Send + Sync {
    /// names of collections which exist in database `db`.
    fn collection_names(&self, db: &str) -> Result<Vec<String>>;

    /// drop collection `ns`, it's fine if it doesn't exist.
    fn drop_collection(&self, ns: &Namespace) -> Result<()>;

    /// create collection `ns` with `options` (including `idIndex` if any).
    ///
    /// When `uuid` is given the collection must be created with that uuid.
    fn create_collection(&self, ns: &Namespace, options: Document, uuid: Option<Uuid>) -> Result<()>;

    /// insert `docs` into `ns` with one command.
    fn insert_documents(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
        options: &WriteOptions,
    ) -> Result<BatchOutcome>;

    /// create `indexes` on `ns` with one command.
    fn create_indexes(&self, ns: &Namespace, indexes: Vec<Document>) -> Result<()>;

    /// apply `entries` with one atomic `applyOps` command.
    fn apply_ops(&self, entries: Vec<Document>) -> Result<()>;

    /// auth schema version of the server, None if it's not recorded.
    fn auth_schema_version(&self) -> Result<Option<i32>>;

    /// merge users and roles restored into temporary collections into the server's auth data.
    ///
    /// When `db` is given only users and roles of that database are merged.
    fn merge_auth_collections(
        &self,
        temp_users: Option<&Namespace>,
        temp_roles: Option<&Namespace>,
        drop: bool,
        db: Option<&str>,
    ) -> Result<()>;
}
