//! Thread safe registry of discovered intents, and the queue restore workers pull from.

use super::intent::{Intent, IntentKind, Namespace};
use crate::error::{RestoreError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, warn};

/// Order in which queued intents are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityStrategy {
    /// first discovered, first restored.
    Legacy,
    /// first collection of every database before the second collection of any database.
    ///
    /// Many servers serialize writes per database, so spreading early work over as many
    /// databases as possible keeps parallel workers busy.
    #[default]
    #[serde(alias = "round_robin")]
    MultiDatabaseRoundRobin,
    /// biggest collections first.
    LongestTaskFirst,
}

/// Registry of restore intents.
///
/// Ordinary collections are queued and handed out by [pop](IntentManager::pop), special
/// collections (oplog, users, roles, auth version, `system.indexes`) are kept aside and
/// only reachable through their own getters.
#[derive(Default)]
pub struct IntentManager {
    state: Mutex<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    /// intents in discovery order, taken out when popped.
    slots: Vec<Option<Intent>>,
    /// namespace key -> position in `slots`.
    index: HashMap<String, usize>,
    /// positions in `slots`, in pop order.
    queue: VecDeque<usize>,
    oplog: Option<Intent>,
    /// every distinct oplog data location we've seen.
    oplog_sources: Vec<String>,
    users: Option<Intent>,
    roles: Option<Intent>,
    auth_version: Option<Intent>,
    system_indexes: BTreeMap<String, Intent>,
    finished: Vec<Namespace>,
}

impl IntentManager {
    /// create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `intent`.
    ///
    /// An intent for a namespace we've already seen is merged into the existing one, it keeps
    /// its place in the queue.
    pub fn put(&self, intent: Intent) {
        let mut state = self.state.lock();
        match intent.kind {
            IntentKind::Oplog => {
                if let Some(data) = &intent.data {
                    let location = data.location();
                    if !state.oplog_sources.contains(&location) {
                        state.oplog_sources.push(location);
                    }
                }
                put_special(&mut state.oplog, intent);
            }
            IntentKind::Users => put_special(&mut state.users, intent),
            IntentKind::Roles => put_special(&mut state.roles, intent),
            IntentKind::AuthVersion => put_special(&mut state.auth_version, intent),
            IntentKind::SystemIndexes => {
                let slot = state
                    .system_indexes
                    .entry(intent.source.db.clone())
                    .or_insert_with(|| Intent::new(intent.source.db.clone(), intent.source.coll.clone()));
                if slot.data.is_none() && slot.metadata.is_none() {
                    *slot = intent;
                } else {
                    let mut existing = Some(slot.clone());
                    put_special(&mut existing, intent);
                    if let Some(merged) = existing {
                        *slot = merged;
                    }
                }
            }
            IntentKind::Regular => {
                let key = intent.key();
                match state.index.get(&key).copied() {
                    Some(pos) => match state.slots[pos].as_mut() {
                        Some(existing) => existing.merge(intent),
                        None => warn!(%key, "Intent is already restored, ignore the new one."),
                    },
                    None => {
                        let pos = state.slots.len();
                        state.slots.push(Some(intent));
                        state.index.insert(key, pos);
                        state.queue.push_back(pos);
                    }
                }
            }
        }
    }

    /// Take next intent to restore, None if nothing is left.
    pub fn pop(&self) -> Option<Intent> {
        let mut state = self.state.lock();
        while let Some(pos) = state.queue.pop_front() {
            if let Some(intent) = state.slots[pos].take() {
                return Some(intent);
            }
        }
        None
    }

    /// Mark `intent` as restored.
    pub fn finish(&self, intent: &Intent) {
        let mut state = self.state.lock();
        state.finished.push(intent.dest.clone());
        debug!(ns = %intent.dest, finished = state.finished.len(), "Intent finished.");
    }

    /// Fix the pop order and check discovered intents don't conflict.
    ///
    /// Must be called before anything is written to the destination.
    pub fn finalize(&self, strategy: PriorityStrategy) -> Result<()> {
        let mut state = self.state.lock();
        state.check_conflicts()?;

        let queued: Vec<usize> = state.queue.drain(..).collect();
        let ordered = match strategy {
            PriorityStrategy::Legacy => queued,
            PriorityStrategy::MultiDatabaseRoundRobin => {
                let slots = &state.slots;
                round_robin(queued, |pos| {
                    slots[*pos]
                        .as_ref()
                        .map(|i| i.dest.db.clone())
                        .unwrap_or_default()
                })
            }
            PriorityStrategy::LongestTaskFirst => {
                let mut queued = queued;
                let slots = &state.slots;
                // stable sort, equal sizes keep discovery order.
                queued.sort_by_key(|pos| {
                    std::cmp::Reverse(slots[*pos].as_ref().map(|i| i.size).unwrap_or(0))
                });
                queued
            }
        };
        state.queue = ordered.into();
        Ok(())
    }

    /// get the oplog intent.
    pub fn oplog(&self) -> Option<Intent> {
        self.state.lock().oplog.clone()
    }

    /// get the `admin.system.users` intent.
    pub fn users(&self) -> Option<Intent> {
        self.state.lock().users.clone()
    }

    /// get the `admin.system.roles` intent.
    pub fn roles(&self) -> Option<Intent> {
        self.state.lock().roles.clone()
    }

    /// get the `admin.system.version` intent.
    pub fn auth_version(&self) -> Option<Intent> {
        self.state.lock().auth_version.clone()
    }

    /// get the `system.indexes` intent of database `db`.
    pub fn system_indexes(&self, db: &str) -> Option<Intent> {
        self.state.lock().system_indexes.get(db).cloned()
    }

    /// databases which have a `system.indexes` intent.
    pub fn system_index_dbs(&self) -> Vec<String> {
        self.state.lock().system_indexes.keys().cloned().collect()
    }

    /// queued intents, in pop order.
    pub fn queued(&self) -> Vec<Intent> {
        let state = self.state.lock();
        state
            .queue
            .iter()
            .filter_map(|pos| state.slots[*pos].clone())
            .collect()
    }

    /// how many intents are waiting to be popped.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state
            .queue
            .iter()
            .filter(|pos| state.slots[**pos].is_some())
            .count()
    }

    /// true if nothing is waiting to be popped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// namespaces of finished intents, in finish order.
    pub fn finished(&self) -> Vec<Namespace> {
        self.state.lock().finished.clone()
    }
}

impl ManagerState {
    fn check_conflicts(&self) -> Result<()> {
        if self.oplog_sources.len() > 1 {
            return Err(RestoreError::ConfigError(format!(
                "found more than one oplog to replay: {}",
                self.oplog_sources.join(", ")
            )));
        }

        let mut dest_to_source: HashMap<&Namespace, &Namespace> = HashMap::new();
        for intent in self.slots.iter().flatten() {
            match dest_to_source.get(&intent.dest) {
                Some(source) if *source != &intent.source => {
                    return Err(RestoreError::ConfigError(format!(
                        "both {} and {} would be restored into {}",
                        source, intent.source, intent.dest
                    )));
                }
                Some(_) => {}
                None => {
                    dest_to_source.insert(&intent.dest, &intent.source);
                }
            }
        }
        Ok(())
    }
}

/// Store a special intent, a newly found data file replaces the old one, a metadata only
/// rediscovery is merged into it.
fn put_special(slot: &mut Option<Intent>, intent: Intent) {
    match slot.take() {
        None => *slot = Some(intent),
        Some(mut existing) => {
            if intent.data.is_some() {
                let mut intent = intent;
                intent.merge(existing);
                *slot = Some(intent);
            } else {
                existing.merge(intent);
                *slot = Some(existing);
            }
        }
    }
}

/// Group `items` by `group_of` (groups in first seen order), then take one item from each
/// group in turn.
fn round_robin<T, F>(items: Vec<T>, group_of: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let total = items.len();
    let mut group_order: Vec<String> = vec![];
    let mut groups: HashMap<String, VecDeque<T>> = HashMap::new();
    for item in items {
        let group = group_of(&item);
        if !groups.contains_key(&group) {
            group_order.push(group.clone());
        }
        groups.entry(group).or_default().push_back(item);
    }

    let mut result = Vec::with_capacity(total);
    while result.len() < total {
        for group in group_order.iter() {
            if let Some(item) = groups.get_mut(group).and_then(|g| g.pop_front()) {
                result.push(item);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::{DataSource, MemorySource};
    use std::sync::Arc;

    fn source(name: &str, len: usize) -> Arc<dyn DataSource> {
        Arc::new(MemorySource::new(name, vec![0; len]))
    }

    fn data_intent(db: &str, coll: &str) -> Intent {
        Intent::new(db, coll).with_data(source(&format!("{}/{}.bson", db, coll), 10))
    }

    fn popped_names(manager: &IntentManager) -> Vec<String> {
        std::iter::from_fn(|| manager.pop())
            .map(|i| i.dest.to_string())
            .collect()
    }

    #[test]
    fn test_merge_data_then_metadata() {
        let manager = IntentManager::new();
        manager.put(data_intent("db1", "c1"));
        manager.put(Intent::new("db1", "c1").with_metadata(source("db1/c1.metadata.json", 2)));
        assert_eq!(manager.len(), 1);

        let intent = manager.pop().unwrap();
        assert!(intent.data.is_some());
        assert!(intent.metadata.is_some());
        assert!(manager.pop().is_none());
    }

    #[test]
    fn test_merge_metadata_then_data() {
        let manager = IntentManager::new();
        manager.put(Intent::new("db1", "c1").with_metadata(source("db1/c1.metadata.json", 2)));
        manager.put(data_intent("db1", "c1"));
        manager.finalize(PriorityStrategy::Legacy).unwrap();

        let intent = manager.pop().unwrap();
        assert_eq!(intent.data.as_ref().unwrap().location(), "db1/c1.bson");
        assert_eq!(intent.size, 10);
        assert_eq!(intent.metadata.as_ref().unwrap().location(), "db1/c1.metadata.json");
        assert!(manager.pop().is_none());
    }

    #[test]
    fn test_merge_does_not_reorder() {
        let manager = IntentManager::new();
        manager.put(data_intent("db1", "a"));
        manager.put(data_intent("db1", "b"));
        manager.put(Intent::new("db1", "a").with_metadata(source("meta", 1)));
        manager.finalize(PriorityStrategy::Legacy).unwrap();
        assert_eq!(popped_names(&manager), vec!["db1.a", "db1.b"]);
    }

    #[test]
    fn test_special_intents_are_not_queued() {
        let manager = IntentManager::new();
        manager.put(Intent::oplog(source("oplog.bson", 5)));
        manager.put(data_intent("admin", "system.users"));
        manager.put(data_intent("admin", "system.roles"));
        manager.put(data_intent("admin", "system.version"));
        manager.put(data_intent("db1", "system.indexes"));
        manager.put(data_intent("db1", "c1"));

        assert_eq!(manager.len(), 1);
        assert!(manager.oplog().is_some());
        assert!(manager.users().is_some());
        assert!(manager.roles().is_some());
        assert!(manager.auth_version().is_some());
        assert!(manager.system_indexes("db1").is_some());
        assert!(manager.system_indexes("db2").is_none());
        assert_eq!(manager.system_index_dbs(), vec!["db1".to_string()]);
        assert_eq!(popped_names(&manager), vec!["db1.c1"]);
    }

    #[test]
    fn test_metadata_only_rediscovery_keeps_special_data() {
        let manager = IntentManager::new();
        manager.put(data_intent("admin", "system.users"));
        manager.put(Intent::new("admin", "system.users").with_metadata(source("users.metadata.json", 1)));
        let users = manager.users().unwrap();
        assert_eq!(users.data.unwrap().location(), "admin/system.users.bson");
        assert!(users.metadata.is_some());

        // a new data file replaces the old one, and keeps old metadata.
        manager.put(Intent::new("admin", "system.users").with_data(source("other.bson", 3)));
        let users = manager.users().unwrap();
        assert_eq!(users.data.unwrap().location(), "other.bson");
        assert!(users.metadata.is_some());
    }

    #[test]
    fn test_legacy_order() {
        let manager = IntentManager::new();
        for (db, coll) in [("a", "1"), ("a", "2"), ("b", "1"), ("c", "1")] {
            manager.put(data_intent(db, coll));
        }
        manager.finalize(PriorityStrategy::Legacy).unwrap();
        assert_eq!(popped_names(&manager), vec!["a.1", "a.2", "b.1", "c.1"]);
    }

    #[test]
    fn test_round_robin_order() {
        let manager = IntentManager::new();
        // discovery order is not grouped by database.
        for (db, coll) in [("a", "1"), ("b", "1"), ("a", "2"), ("a", "3"), ("c", "1"), ("b", "2")] {
            manager.put(data_intent(db, coll));
        }
        manager.finalize(PriorityStrategy::MultiDatabaseRoundRobin).unwrap();
        assert_eq!(
            popped_names(&manager),
            vec!["a.1", "b.1", "c.1", "a.2", "b.2", "a.3"]
        );
    }

    #[test]
    fn test_longest_task_first_order() {
        let manager = IntentManager::new();
        manager.put(Intent::new("a", "small").with_data(source("s", 1)));
        manager.put(Intent::new("a", "big").with_data(source("b", 100)));
        manager.put(Intent::new("b", "medium").with_data(source("m", 10)));
        manager.put(Intent::new("b", "medium2").with_data(source("m2", 10)));
        manager.finalize(PriorityStrategy::LongestTaskFirst).unwrap();
        assert_eq!(
            popped_names(&manager),
            vec!["a.big", "b.medium", "b.medium2", "a.small"]
        );
    }

    #[test]
    fn test_dest_conflict() {
        let manager = IntentManager::new();
        manager.put(data_intent("a", "x"));
        manager.put(data_intent("b", "x").with_dest(Namespace::new("a", "x")));
        let err = manager.finalize(PriorityStrategy::Legacy).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn test_duplicate_oplog_conflict() {
        let manager = IntentManager::new();
        manager.put(Intent::oplog(source("dump/oplog.bson", 5)));
        manager.put(Intent::oplog(source("dump/oplog.bson", 5)));
        assert!(manager.finalize(PriorityStrategy::Legacy).is_ok());

        manager.put(Intent::oplog(source("/tmp/other_oplog.bson", 5)));
        assert!(manager.finalize(PriorityStrategy::Legacy).is_err());
    }

    #[test]
    fn test_concurrent_pop_hands_out_each_intent_once() {
        let manager = IntentManager::new();
        for i in 0..200 {
            manager.put(data_intent(&format!("db{}", i % 7), &format!("c{}", i)));
        }
        manager.finalize(PriorityStrategy::MultiDatabaseRoundRobin).unwrap();

        let popped: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let mut names = vec![];
                        while let Some(intent) = manager.pop() {
                            manager.finish(&intent);
                            names.push(intent.dest.to_string());
                        }
                        names
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let mut sorted = popped.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(popped.len(), 200);
        assert_eq!(sorted.len(), 200);
        assert_eq!(manager.finished().len(), 200);
    }
}
