use bson::Document;
use mongodb::error::Error as MongoError;
use std::path::PathBuf;
use std::result::Result as StdResult;
use thiserror::Error;

/// Coarse classification of a [RestoreError], fixed where the error is created.
///
/// The restore engine uses it to decide whether a failure is tolerated (counted)
/// or fatal, so nothing has to look at error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// bad frame length, truncated frame, malformed document.
    StreamCorruption,
    /// a document was rejected by the destination (duplicate key, validation).
    DocumentRejected,
    /// create / drop / index creation failed.
    CollectionSetup,
    /// connection or server failure, never retried.
    Transport,
    /// an `applyOps` batch failed.
    OplogApply,
    /// invalid options or conflicting inputs, detected before touching the destination.
    Configuration,
    /// the run was asked to stop.
    Interrupted,
    /// local file system failure, outside of the bson stream itself.
    Io,
    /// a bug in the restore tool, like a panicked worker.
    Internal,
}

/// Errors raised while restoring a dump.
#[derive(Error, Debug)]
pub enum RestoreError {
    /// connection or server failure reported by the driver.
    #[error("Mongodb connection error")]
    MongoError(#[from] MongoError),
    /// the target refused the permission check.
    #[error("Check permission for database {db:?} failed, connection string: {uri:?}, detailed: {detail:?}")]
    PermissionError {
        /// target uri.
        uri: String,
        /// database checked.
        db: String,
        /// driver error.
        detail: MongoError,
    },
    /// local file system failure.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    /// a frame length prefix outside of `[5, 16MiB]`.
    #[error("corrupt bson stream: invalid document size {size}")]
    InvalidDocumentSize {
        /// the length prefix read.
        size: i32,
    },
    /// the stream ended inside a frame.
    #[error("corrupt bson stream: truncated document, expected {expected} bytes but only {read} available")]
    TruncatedDocument {
        /// bytes the frame should have.
        expected: usize,
        /// bytes actually read.
        read: usize,
    },
    /// a frame which isn't well formed bson.
    #[error("corrupt bson document: {0}")]
    InvalidDocument(#[from] bson::raw::Error),
    /// an oplog entry with an unknown shape.
    #[error("invalid oplog entry: {0}")]
    InvalidOplogEntry(String),
    /// a malformed mongodump archive.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
    /// a frame which can't be decoded into a document.
    #[error("can't decode bson document: {0}")]
    BsonDecodeError(#[from] bson::de::Error),
    /// a document which can't be encoded.
    #[error("can't encode bson document: {0}")]
    BsonEncodeError(#[from] bson::ser::Error),
    /// a field is missing or has an unexpected type.
    #[error("unexpected bson value: {0}")]
    BsonError(#[from] bson::document::ValueAccessError),
    /// extended json which doesn't map to bson.
    #[error("invalid extended json: {0}")]
    ExtJsonError(#[from] bson::extjson::de::Error),
    /// a `.metadata.json` file which isn't json.
    #[error("can't parse metadata file {path:?}: {source}")]
    MetadataError {
        /// where the metadata comes from.
        path: String,
        /// parse error.
        source: serde_json::Error,
    },
    /// a config file which isn't valid toml.
    #[error("can't read config file {path:?}: {source}")]
    ConfigFileError {
        /// config file path.
        path: PathBuf,
        /// parse error.
        source: toml::de::Error,
    },
    /// a document rejected by the server, fatal under stop on error.
    #[error("document rejected by server (code {code}): {message}")]
    WriteError {
        /// server error code.
        code: i32,
        /// server error message.
        message: String,
    },
    /// the server couldn't satisfy the write concern.
    #[error("write concern error (code {code}): {message}")]
    WriteConcernError {
        /// server error code.
        code: i32,
        /// server error message.
        message: String,
    },
    /// create, drop or index creation failed.
    #[error("failed to {op} collection: {source}")]
    CollectionSetup {
        /// the failed operation.
        op: &'static str,
        /// driver error.
        source: MongoError,
    },
    /// `ns.$name` of an index is too long for the server.
    #[error("index name {full_name:?} is {len} bytes, longer than the 127 bytes limit")]
    IndexNameTooLong {
        /// `ns.$name`.
        full_name: String,
        /// its length in bytes.
        len: usize,
    },
    /// an `applyOps` command failed.
    #[error("apply oplog failed, server reply: {0:?}")]
    ApplyOplogError(Document),
    /// invalid options or conflicting inputs.
    #[error("{0}")]
    ConfigError(String),
    /// the worker pool couldn't be started.
    #[error("can't build worker pool: {0}")]
    PoolError(#[from] rayon::ThreadPoolBuildError),
    /// an insertion worker panicked.
    #[error("insertion worker panicked")]
    WorkerPanicked,
    /// the run was told to stop.
    #[error("received termination signal")]
    Terminated,
    /// an error of one namespace.
    #[error("{ns}: {source}")]
    Namespaced {
        /// destination namespace.
        ns: String,
        /// the error.
        source: Box<RestoreError>,
    },
}

impl RestoreError {
    /// Get the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        use RestoreError::*;
        match self {
            MongoError(_) | PermissionError { .. } | WriteConcernError { .. } => ErrorKind::Transport,
            InvalidDocumentSize { .. }
            | TruncatedDocument { .. }
            | InvalidDocument(_)
            | InvalidOplogEntry(_)
            | InvalidArchive(_)
            | BsonDecodeError(_)
            | BsonEncodeError(_)
            | BsonError(_) => ErrorKind::StreamCorruption,
            IoError(_) => ErrorKind::Io,
            WorkerPanicked => ErrorKind::Internal,
            WriteError { .. } => ErrorKind::DocumentRejected,
            CollectionSetup { .. } | IndexNameTooLong { .. } => ErrorKind::CollectionSetup,
            ApplyOplogError(_) => ErrorKind::OplogApply,
            ExtJsonError(_)
            | MetadataError { .. }
            | ConfigFileError { .. }
            | ConfigError(_)
            | PoolError(_) => ErrorKind::Configuration,
            Terminated => ErrorKind::Interrupted,
            Namespaced { source, .. } => source.kind(),
        }
    }

    /// Prepend namespace `ns` to this error, unless it already carries one.
    pub fn with_namespace(self, ns: impl Into<String>) -> Self {
        match self {
            e @ RestoreError::Namespaced { .. } => e,
            e => RestoreError::Namespaced {
                ns: ns.into(),
                source: Box::new(e),
            },
        }
    }

    /// true if the error only reports that the run was told to stop.
    pub fn is_terminated(&self) -> bool {
        self.kind() == ErrorKind::Interrupted
    }
}

/// Result of restore operations.
pub type Result<T> = StdResult<T, RestoreError>;
