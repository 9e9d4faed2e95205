pub mod archive;
#[doc(hidden)]
pub mod bson_helper;
mod bulk;
pub mod dump_dir;
pub mod frame;
mod intent;
mod known_colls;
mod manager;
#[doc(hidden)]
pub mod metadata;
#[doc(hidden)]
pub mod ns_matcher;
mod oplog;
mod oplog_replay;
mod progress;
mod restore;
mod result;
mod termination;
#[doc(hidden)]
pub mod time_helper;

pub use archive::SpooledArchive;
pub use bulk::BufferedBulkInserter;
pub use frame::{ArchiveBlock, FrameReader};
pub use intent::{Intent, IntentKind, Namespace};
pub use known_colls::KnownCollections;
pub use manager::{IntentManager, PriorityStrategy};
pub use metadata::CollectionMetadata;
pub use oplog::{OpType, OplogEntry};
pub use oplog_replay::{OplogReplayer, ReplayStats, OPLOG_BATCH_CEILING};
pub use progress::Progress;
pub use restore::MongoRestore;
pub use result::RestoreResult;
pub use termination::Termination;
