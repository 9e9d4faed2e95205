mod common;

use bson::Document;
use common::{build_archive, insert_entry, numbered_docs, MemoryTarget};
use mongo_restore::archive;
use mongo_restore::dump_dir::{self, ScanOptions};
use mongo_restore::{
    DataSource, ErrorKind, FrameReader, IntentManager, MongoRestore, PriorityStrategy,
    ReaderSource, RestoreOptions,
};
use std::io::Cursor;

const C1_METADATA: &str = r#"{
    "options": {},
    "indexes": [
        {"v": 2, "key": {"_id": 1}, "name": "_id_", "ns": "db1.c1"},
        {"v": 2, "key": {"value": 1}, "name": "value_1", "ns": "db1.c1"}
    ]
}"#;

fn queued_names(manager: &IntentManager) -> Vec<String> {
    manager.queued().iter().map(|i| i.dest.to_string()).collect()
}

#[test]
fn test_restore_archive_with_oplog() {
    let c1 = numbered_docs(7);
    let c2 = numbered_docs(5);
    let empty: Vec<Document> = vec![];
    let oplog = vec![
        insert_entry(100, "db1.c1", 8),
        insert_entry(101, "db1.c1", 9),
        insert_entry(102, "db1.c1", 10),
    ];
    let bytes = build_archive(&[
        ("db1", "c1", C1_METADATA, c1.as_slice()),
        ("db1", "c2", "", c2.as_slice()),
        ("db2", "empty", "{}", empty.as_slice()),
        ("", "oplog", "", oplog.as_slice()),
    ]);

    let manager = IntentManager::new();
    let spooled = archive::scan(Cursor::new(bytes), &ScanOptions::default(), &manager).unwrap();
    assert_eq!(spooled.header().tool_version, "100.5.2");
    assert!(manager.oplog().is_some());

    let options = RestoreOptions {
        oplog_replay: true,
        num_insertion_workers: 2,
        bulk_buffer_size: 3,
        ..Default::default()
    };
    let restore = MongoRestore::new(MemoryTarget::new(), options, manager);
    let result = restore.restore();
    assert!(result.err.is_none(), "{:?}", result.err);
    assert_eq!(result.successes, 12);

    let target = restore.target();
    let mut ids = target.ids("db1.c1");
    ids.sort_unstable();
    assert_eq!(ids, (1..=7).collect::<Vec<_>>());
    assert_eq!(target.docs("db1.c2").len(), 5);
    assert_eq!(target.collection("db1.c1").unwrap().indexes.len(), 1);
    // metadata alone still creates the collection.
    assert!(target.collection("db2.empty").is_some());

    let applied: Vec<i32> = target
        .state
        .lock()
        .apply_batches
        .iter()
        .flatten()
        .map(|entry| entry.get_document("o").unwrap().get_i32("_id").unwrap())
        .collect();
    assert_eq!(applied, vec![8, 9, 10]);
}

#[test]
fn test_archive_honors_filters_and_renames() {
    let docs = numbered_docs(3);
    let bytes = build_archive(&[
        ("db1", "c1", "", docs.as_slice()),
        ("db1", "tmp_1", "", docs.as_slice()),
        ("db1", "system.profile", "", docs.as_slice()),
        ("db2", "c1", "", docs.as_slice()),
    ]);
    let options = ScanOptions {
        db: Some("db1".to_string()),
        ns_exclude: vec!["db1.tmp_*".to_string()],
        renames: vec![("db1.*".to_string(), "copy.*".to_string())],
        ..Default::default()
    };
    let manager = IntentManager::new();
    let spooled = archive::scan(Cursor::new(bytes), &options, &manager).unwrap();
    manager.finalize(PriorityStrategy::Legacy).unwrap();
    assert_eq!(queued_names(&manager), vec!["copy.c1"]);

    // only the selected collection is spooled.
    assert_eq!(std::fs::read_dir(spooled.path()).unwrap().count(), 1);
    let intent = &manager.queued()[0];
    let mut reader = FrameReader::new(intent.data.as_ref().unwrap().open().unwrap());
    let mut read = vec![];
    while let Some(doc) = reader.next_document().unwrap() {
        read.push(doc);
    }
    assert_eq!(read, docs);
}

#[test]
fn test_archive_corruption_is_reported() {
    let docs = numbered_docs(4);
    let bytes = build_archive(&[
        ("db1", "c1", "", docs.as_slice()),
        ("db1", "c2", "", docs.as_slice()),
    ]);

    // a flipped bit inside the first document keeps the frame well formed.
    let mut corrupt = bytes.clone();
    let position = corrupt
        .windows(5)
        .position(|w| w == b"doc-1")
        .unwrap();
    corrupt[position + 4] ^= 0x01;
    let manager = IntentManager::new();
    let err = archive::scan(Cursor::new(corrupt), &ScanOptions::default(), &manager).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamCorruption);
    assert!(err.to_string().contains("checksum mismatch for db1.c1"), "{}", err);

    let mut truncated = bytes;
    truncated.truncate(truncated.len() - 10);
    let err = archive::scan(Cursor::new(truncated), &ScanOptions::default(), &manager).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamCorruption, "{}", err);
    assert!(manager.queued().is_empty());
}

#[test]
fn test_spool_files_removed_with_archive() {
    let docs = numbered_docs(2);
    let bytes = build_archive(&[("db1", "c1", "", docs.as_slice())]);
    let manager = IntentManager::new();
    let spooled = archive::scan(Cursor::new(bytes), &ScanOptions::default(), &manager).unwrap();
    let path = spooled.path().to_path_buf();
    assert!(path.is_dir());
    drop(spooled);
    assert!(!path.exists());
}

#[test]
fn test_restore_collection_from_stream() {
    let mut data = vec![];
    for doc in numbered_docs(25) {
        doc.to_writer(&mut data).unwrap();
    }
    let options = ScanOptions {
        db: Some("db1".to_string()),
        collection: Some("c1".to_string()),
        ..Default::default()
    };
    let manager = IntentManager::new();
    dump_dir::scan_stream(Box::new(Cursor::new(data)), &options, &manager).unwrap();

    let restore = MongoRestore::new(MemoryTarget::new(), RestoreOptions::default(), manager);
    let result = restore.restore();
    assert!(result.err.is_none(), "{:?}", result.err);
    assert_eq!(result.successes, 25);
    assert_eq!(restore.target().docs("db1.c1").len(), 25);
}

#[test]
fn test_stream_source_reads_once() {
    let source = ReaderSource::new("stdin", Box::new(Cursor::new(vec![1, 2, 3])));
    assert!(source.open().is_ok());
    assert!(source.open().is_err());
    assert_eq!(source.location(), "stdin");
}
