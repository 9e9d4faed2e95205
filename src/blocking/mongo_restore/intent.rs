//! Restore work units.

use crate::blocking::DataSource;
use crate::ADMIN_DB_NAME;
use std::fmt;
use std::sync::Arc;

const USERS_COLL: &str = "system.users";
const ROLES_COLL: &str = "system.roles";
const VERSION_COLL: &str = "system.version";
const INDEXES_COLL: &str = "system.indexes";

/// A collection namespace, `db.coll`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    /// database name.
    pub db: String,
    /// collection name.
    pub coll: String,
}

impl Namespace {
    /// construct a namespace from `db` and `coll`.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse `db.coll`, the collection part may contain dots.
    pub fn parse(ns: &str) -> Option<Self> {
        let (db, coll) = ns.split_once('.')?;
        if db.is_empty() {
            return None;
        }
        Some(Namespace::new(db, coll))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// What an intent restores, decided once when the intent is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    /// an ordinary collection.
    Regular,
    /// the oplog to replay.
    Oplog,
    /// `admin.system.users`.
    Users,
    /// `admin.system.roles`.
    Roles,
    /// `<db>.system.indexes`, index specs of a legacy dump.
    SystemIndexes,
    /// `admin.system.version`, holds the auth schema version.
    AuthVersion,
}

impl IntentKind {
    /// Classify collection `coll` of database `db`.
    pub fn classify(db: &str, coll: &str) -> IntentKind {
        match (db, coll) {
            (ADMIN_DB_NAME, USERS_COLL) => IntentKind::Users,
            (ADMIN_DB_NAME, ROLES_COLL) => IntentKind::Roles,
            (ADMIN_DB_NAME, VERSION_COLL) => IntentKind::AuthVersion,
            (_, INDEXES_COLL) => IntentKind::SystemIndexes,
            _ => IntentKind::Regular,
        }
    }
}

/// One unit of restore work: a collection's data and metadata.
#[derive(Debug, Clone)]
pub struct Intent {
    /// namespace in the dump.
    pub source: Namespace,
    /// namespace to restore into, differs from `source` when renamed.
    pub dest: Namespace,
    /// what this intent restores.
    pub kind: IntentKind,
    /// bson frames.
    pub data: Option<Arc<dyn DataSource>>,
    /// `.metadata.json` content.
    pub metadata: Option<Arc<dyn DataSource>>,
    /// bytes of data, for progress.
    pub size: u64,
}

impl Intent {
    /// Create an intent for collection `coll` in database `db`, without any source attached.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Intent {
        let source = Namespace::new(db, coll);
        Intent {
            kind: IntentKind::classify(&source.db, &source.coll),
            dest: source.clone(),
            source,
            data: None,
            metadata: None,
            size: 0,
        }
    }

    /// Create the oplog intent, reading entries from `data`.
    pub fn oplog(data: Arc<dyn DataSource>) -> Intent {
        let source = Namespace::new("", "oplog");
        Intent {
            kind: IntentKind::Oplog,
            dest: source.clone(),
            source,
            size: data.size(),
            data: Some(data),
            metadata: None,
        }
    }

    /// attach bson data.
    pub fn with_data(mut self, data: Arc<dyn DataSource>) -> Intent {
        self.size = data.size();
        self.data = Some(data);
        self
    }

    /// attach metadata.
    pub fn with_metadata(mut self, metadata: Arc<dyn DataSource>) -> Intent {
        self.metadata = Some(metadata);
        self
    }

    /// restore into `dest` instead of the dumped namespace.
    pub fn with_dest(mut self, dest: Namespace) -> Intent {
        self.dest = dest;
        self
    }

    /// deduplication key, the dumped namespace.
    pub fn key(&self) -> String {
        self.source.to_string()
    }

    /// Fill fields missing here from `other`.
    pub(crate) fn merge(&mut self, other: Intent) {
        if self.data.is_none() && other.data.is_some() {
            self.data = other.data;
            self.size = other.size;
        }
        if self.metadata.is_none() {
            self.metadata = other.metadata;
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source == self.dest {
            write!(f, "{}", self.dest)
        } else {
            write!(f, "{} (from {})", self.dest, self.source)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySource;

    #[test]
    fn test_classify() {
        assert_eq!(IntentKind::classify("admin", "system.users"), IntentKind::Users);
        assert_eq!(IntentKind::classify("admin", "system.roles"), IntentKind::Roles);
        assert_eq!(
            IntentKind::classify("admin", "system.version"),
            IntentKind::AuthVersion
        );
        assert_eq!(
            IntentKind::classify("db1", "system.indexes"),
            IntentKind::SystemIndexes
        );
        assert_eq!(IntentKind::classify("db1", "system.users"), IntentKind::Regular);
        assert_eq!(IntentKind::classify("db1", "c1"), IntentKind::Regular);
    }

    #[test]
    fn test_namespace_parse() {
        assert_eq!(Namespace::parse("a.b.c"), Some(Namespace::new("a", "b.c")));
        assert_eq!(Namespace::parse("a"), None);
        assert_eq!(Namespace::parse(".b"), None);
        assert_eq!(Namespace::new("a", "b").to_string(), "a.b");
    }

    #[test]
    fn test_merge_keeps_first_seen_fields() {
        let first = Arc::new(MemorySource::new("first", vec![1, 2]));
        let second = Arc::new(MemorySource::new("second", vec![1, 2, 3]));
        let meta = Arc::new(MemorySource::new("meta", vec![]));

        let mut intent = Intent::new("a", "b").with_data(first);
        intent.merge(Intent::new("a", "b").with_data(second).with_metadata(meta));
        assert_eq!(intent.data.as_ref().unwrap().location(), "first");
        assert_eq!(intent.size, 2);
        assert_eq!(intent.metadata.as_ref().unwrap().location(), "meta");
    }
}
