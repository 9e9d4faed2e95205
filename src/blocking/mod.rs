/// provide mongo restore blocking apis.
mod connection;
#[doc(hidden)]
pub mod mongo_restore;
mod source;
mod target;

pub use connection::Connection;
pub use source::{DataSource, FileSource, MemorySource, ReaderSource};
pub use target::{BatchOutcome, RestoreTarget, WriteFailure, WriteFailureKind, WriteOptions};
