use crate::blocking::RestoreTarget;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Per database cache of collection names which exist on the destination.
///
/// Each database is listed once, later lookups and changes only touch the cache.
#[derive(Debug, Default)]
pub struct KnownCollections {
    dbs: Mutex<HashMap<String, HashSet<String>>>,
}

impl KnownCollections {
    /// create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// true if collection `coll` exists in `db`.
    ///
    /// The listing runs without holding the cache lock.  When two workers list the same
    /// database at once, the first listing stored wins.
    pub fn exists<T: RestoreTarget + ?Sized>(&self, target: &T, db: &str, coll: &str) -> Result<bool> {
        if let Some(colls) = self.dbs.lock().get(db) {
            return Ok(colls.contains(coll));
        }
        let names: HashSet<String> = target.collection_names(db)?.into_iter().collect();
        let mut dbs = self.dbs.lock();
        let colls = dbs.entry(db.to_string()).or_insert(names);
        Ok(colls.contains(coll))
    }

    /// record that `coll` now exists in `db`.
    pub fn add(&self, db: &str, coll: &str) {
        let mut dbs = self.dbs.lock();
        if let Some(colls) = dbs.get_mut(db) {
            colls.insert(coll.to_string());
        }
    }

    /// record that `coll` no longer exists in `db`.
    pub fn remove(&self, db: &str, coll: &str) {
        let mut dbs = self.dbs.lock();
        if let Some(colls) = dbs.get_mut(db) {
            colls.remove(coll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::mongo_restore::Namespace;
    use crate::blocking::{BatchOutcome, WriteOptions};
    use crate::error::RestoreError;
    use bson::Document;
    use parking_lot::Condvar;
    use std::time::Duration;
    use uuid::Uuid;

    /// Every listing waits until `expected` listings are running at the same time.
    #[derive(Default)]
    struct ListingTarget {
        running: Mutex<usize>,
        all_running: Condvar,
        expected: usize,
        listed: Mutex<Vec<String>>,
    }

    impl RestoreTarget for ListingTarget {
        fn collection_names(&self, db: &str) -> Result<Vec<String>> {
            self.listed.lock().push(db.to_string());
            let mut running = self.running.lock();
            *running += 1;
            self.all_running.notify_all();
            while *running < self.expected {
                if self
                    .all_running
                    .wait_for(&mut running, Duration::from_secs(5))
                    .timed_out()
                {
                    return Err(RestoreError::ConfigError(format!("listing {} waited alone", db)));
                }
            }
            Ok(vec!["c1".to_string()])
        }

        fn drop_collection(&self, _ns: &Namespace) -> Result<()> {
            Ok(())
        }

        fn create_collection(&self, _ns: &Namespace, _options: Document, _uuid: Option<Uuid>) -> Result<()> {
            Ok(())
        }

        fn insert_documents(
            &self,
            _ns: &Namespace,
            _docs: Vec<Document>,
            _options: &WriteOptions,
        ) -> Result<BatchOutcome> {
            Ok(BatchOutcome::default())
        }

        fn create_indexes(&self, _ns: &Namespace, _indexes: Vec<Document>) -> Result<()> {
            Ok(())
        }

        fn apply_ops(&self, _entries: Vec<Document>) -> Result<()> {
            Ok(())
        }

        fn auth_schema_version(&self) -> Result<Option<i32>> {
            Ok(None)
        }

        fn merge_auth_collections(
            &self,
            _temp_users: Option<&Namespace>,
            _temp_roles: Option<&Namespace>,
            _drop: bool,
            _db: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_list_once_then_use_cache() {
        let target = ListingTarget {
            expected: 1,
            ..Default::default()
        };
        let known = KnownCollections::new();
        assert!(known.exists(&target, "db1", "c1").unwrap());
        assert!(!known.exists(&target, "db1", "c2").unwrap());

        known.add("db1", "c2");
        known.remove("db1", "c1");
        assert!(known.exists(&target, "db1", "c2").unwrap());
        assert!(!known.exists(&target, "db1", "c1").unwrap());
        assert_eq!(*target.listed.lock(), vec!["db1"]);
    }

    #[test]
    fn test_databases_are_listed_concurrently() {
        let target = ListingTarget {
            expected: 2,
            ..Default::default()
        };
        let known = KnownCollections::new();
        std::thread::scope(|s| {
            let first = s.spawn(|| known.exists(&target, "db1", "c1"));
            let second = s.spawn(|| known.exists(&target, "db2", "c1"));
            assert!(first.join().unwrap().unwrap());
            assert!(second.join().unwrap().unwrap());
        });
        let mut listed = target.listed.lock().clone();
        listed.sort();
        assert_eq!(listed, vec!["db1", "db2"]);
    }
}
