//! Unit and integration tests for the event store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tempfile::TempDir;

use crate::{
    EventStore, ExpectedRevision, Matcher, StoreConfig, StoreError, StoreEvent,
};

fn open_store(dir: &TempDir) -> EventStore {
    EventStore::open(StoreConfig::new(dir.path())).unwrap()
}

fn event(name: &str) -> Value {
    json!({"type": name})
}

// ============================================================================
// Commits and stream versions
// ============================================================================

#[test]
fn commit_assigns_dense_sequences_and_revisions() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let result = store
        .commit(
            "orders",
            vec![event("a"), event("b"), event("c")],
            ExpectedRevision::Any,
            None,
        )
        .unwrap();

    assert_eq!(result.first_sequence.as_u64(), 1);
    assert_eq!(result.last_sequence.as_u64(), 3);
    assert_eq!(store.stream_version("orders"), 3);
    assert_eq!(store.sequence(), 3);

    let envelopes: Vec<_> = store
        .event_stream("orders")
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(envelopes.len(), 3);
    for (i, envelope) in envelopes.iter().enumerate() {
        assert_eq!(envelope.metadata.stream_version, i as u64 + 1);
        assert_eq!(envelope.metadata.commit_version, i as u32);
        assert_eq!(envelope.metadata.commit_size, 3);
        assert_eq!(envelope.metadata.commit_id, result.commit_id);
    }
}

#[test]
fn commit_metadata_flows_into_every_envelope() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let mut metadata = serde_json::Map::new();
    metadata.insert("tenant".to_string(), json!("acme"));
    store
        .commit("orders", vec![event("a")], ExpectedRevision::Any, Some(metadata))
        .unwrap();

    let mut stream = store.event_stream("orders").unwrap();
    let envelope = stream.next().unwrap().unwrap();
    assert_eq!(envelope.metadata.extra["tenant"], json!("acme"));
}

#[test]
fn commit_rejects_empty_arguments() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    assert!(matches!(
        store.commit("", vec![event("a")], ExpectedRevision::Any, None),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.commit("orders", vec![], ExpectedRevision::Any, None),
        Err(StoreError::InvalidArgument(_))
    ));
}

// ============================================================================
// Optimistic concurrency
// ============================================================================

#[test]
fn expected_revision_guards_the_stream_head() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store
        .commit(
            "account",
            vec![event("e1"), event("e2"), event("e3")],
            ExpectedRevision::exact(0),
            None,
        )
        .unwrap();

    // Stale expectation: the head is already at 3.
    let err = store
        .commit("account", vec![event("e4")], ExpectedRevision::exact(2), None)
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::OptimisticConcurrency { expected: 2, actual: 3, .. }
    ));

    // Retry with the observed head.
    store
        .commit("account", vec![event("e4")], ExpectedRevision::exact(3), None)
        .unwrap();

    let mut stream = store.event_stream("account").unwrap().last(1);
    let envelope = stream.next().unwrap().unwrap();
    assert_eq!(envelope.payload, event("e4"));
    assert_eq!(envelope.metadata.stream_version, 4);
}

#[test]
fn no_stream_expectation_requires_an_empty_stream() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store
        .commit("fresh", vec![event("a")], ExpectedRevision::NoStream, None)
        .unwrap();
    let err = store
        .commit("fresh", vec![event("b")], ExpectedRevision::NoStream, None)
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::OptimisticConcurrency { expected: 0, actual: 1, .. }
    ));
}

#[test]
fn any_expectation_skips_the_check() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();
    store.commit("s", vec![event("b")], ExpectedRevision::Any, None).unwrap();
    assert_eq!(store.stream_version("s"), 2);
}

// ============================================================================
// Stream iteration
// ============================================================================

#[test]
fn event_stream_supports_bounds_and_directions() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    let events: Vec<Value> = (1..=5).map(|i| json!({"n": i})).collect();
    store.commit("s", events, ExpectedRevision::Any, None).unwrap();

    let first_two = store.event_stream("s").unwrap().first(2).events().unwrap();
    assert_eq!(first_two, vec![json!({"n": 1}), json!({"n": 2})]);

    let last_two = store.event_stream("s").unwrap().last(2).events().unwrap();
    assert_eq!(last_two, vec![json!({"n": 4}), json!({"n": 5})]);

    let middle = store.event_stream("s").unwrap().from(2).until(4).events().unwrap();
    assert_eq!(middle.len(), 3);

    let backwards = store.event_stream("s").unwrap().backwards().events().unwrap();
    let ns: Vec<i64> = backwards.iter().map(|e| e["n"].as_i64().unwrap()).collect();
    assert_eq!(ns, vec![5, 4, 3, 2, 1]);
}

#[test]
fn event_stream_clamps_to_what_exists() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store
        .commit("s", vec![event("a"), event("b")], ExpectedRevision::Any, None)
        .unwrap();

    let events = store.event_stream("s").unwrap().first(10).events().unwrap();
    assert_eq!(events.len(), 2);
}

#[test]
fn event_stream_over_empty_stream_is_empty() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();
    store.create_stream("none", Matcher::fields(&json!({"tenant": "nobody"})).unwrap()).unwrap();

    let events = store.event_stream("none").unwrap().events().unwrap();
    assert!(events.is_empty());
}

#[test]
fn event_stream_ignores_documents_committed_after_construction() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();

    // The head is captured when the stream is opened; a later commit through
    // a second handle must not extend the range. Two handles cannot coexist
    // on one store (single writer), so snapshot the head by bounds instead.
    let events = store.event_stream("s").unwrap().events().unwrap();
    store.commit("s", vec![event("b")], ExpectedRevision::Any, None).unwrap();
    assert_eq!(events.len(), 1);
}

#[test]
fn event_stream_reset_restarts_iteration() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store
        .commit("s", vec![event("a"), event("b")], ExpectedRevision::Any, None)
        .unwrap();

    let mut stream = store.event_stream("s").unwrap();
    assert!(stream.next().is_some());
    assert!(stream.next().is_some());
    assert!(stream.next().is_none());

    stream.reset();
    assert_eq!(stream.events().unwrap().len(), 2);
}

#[test]
fn unknown_stream_is_an_error() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    assert!(matches!(
        store.event_stream("missing"),
        Err(StoreError::UnknownStream(_))
    ));
}

// ============================================================================
// Join streams
// ============================================================================

#[test]
fn join_preserves_global_insertion_order() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    store.commit("foo", vec![json!({"e": "A"})], ExpectedRevision::Any, None).unwrap();
    store.commit("bar", vec![json!({"e": "B"})], ExpectedRevision::Any, None).unwrap();
    store.commit("foo", vec![json!({"e": "C"})], ExpectedRevision::Any, None).unwrap();

    let merged = store.join_streams(&["foo", "bar"]).unwrap().events().unwrap();
    let order: Vec<&str> = merged.iter().map(|e| e["e"].as_str().unwrap()).collect();
    assert_eq!(order, vec!["A", "B", "C"]);

    let reversed = store
        .join_streams(&["foo", "bar"])
        .unwrap()
        .backwards()
        .events()
        .unwrap();
    let order: Vec<&str> = reversed.iter().map(|e| e["e"].as_str().unwrap()).collect();
    assert_eq!(order, vec!["C", "B", "A"]);
}

#[test]
fn join_requires_at_least_one_known_stream() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.commit("foo", vec![event("a")], ExpectedRevision::Any, None).unwrap();

    assert!(matches!(
        store.join_streams(&[]),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.join_streams(&["foo", "missing"]),
        Err(StoreError::UnknownStream(_))
    ));
}

// ============================================================================
// Created read streams and the catalog
// ============================================================================

#[test]
fn created_stream_replays_history_and_follows_new_commits() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let acme = |n: u64| {
        let mut m = serde_json::Map::new();
        m.insert("tenant".to_string(), json!("acme"));
        (json!({"n": n}), m)
    };

    let (payload, metadata) = acme(1);
    store.commit("orders", vec![payload], ExpectedRevision::Any, Some(metadata)).unwrap();
    store.commit("orders", vec![json!({"n": 2})], ExpectedRevision::Any, None).unwrap();

    // Replay: only the first commit carried the tenant field.
    store
        .create_stream("acme", Matcher::fields(&json!({"tenant": "acme"})).unwrap())
        .unwrap();
    assert_eq!(store.event_stream("acme").unwrap().events().unwrap().len(), 1);

    // New commits flow in as they match.
    let (payload, metadata) = acme(3);
    store.commit("orders", vec![payload], ExpectedRevision::Any, Some(metadata)).unwrap();
    let events = store.event_stream("acme").unwrap().events().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], json!({"n": 3}));
}

#[test]
fn duplicate_stream_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.commit("orders", vec![event("a")], ExpectedRevision::Any, None).unwrap();

    assert!(matches!(
        store.create_stream("orders", Matcher::fields(&json!({})).unwrap()),
        Err(StoreError::StreamExists(_))
    ));

    store.create_stream("copy", Matcher::fields(&json!({})).unwrap()).unwrap();
    assert!(matches!(
        store.create_stream("copy", Matcher::fields(&json!({})).unwrap()),
        Err(StoreError::StreamExists(_))
    ));
}

#[test]
fn field_streams_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = || StoreConfig::new(dir.path()).with_catalog_secret("s3cret");

    {
        let mut store = EventStore::open(config()).unwrap();
        let mut metadata = serde_json::Map::new();
        metadata.insert("tenant".to_string(), json!("acme"));
        store
            .commit("orders", vec![event("a")], ExpectedRevision::Any, Some(metadata))
            .unwrap();
        store
            .create_stream("acme", Matcher::fields(&json!({"tenant": "acme"})).unwrap())
            .unwrap();
        store.close().unwrap();
    }

    let mut store = EventStore::open(config()).unwrap();
    assert_eq!(store.event_stream("acme").unwrap().events().unwrap().len(), 1);

    // The restored matcher still routes new commits.
    let mut metadata = serde_json::Map::new();
    metadata.insert("tenant".to_string(), json!("acme"));
    store
        .commit("orders", vec![event("b")], ExpectedRevision::Any, Some(metadata))
        .unwrap();
    assert_eq!(store.event_stream("acme").unwrap().events().unwrap().len(), 2);
    store.close().unwrap();
}

#[test]
fn tampered_catalog_fails_to_open() {
    let dir = TempDir::new().unwrap();
    let config = || StoreConfig::new(dir.path()).with_catalog_secret("s3cret");

    {
        let mut store = EventStore::open(config()).unwrap();
        store.commit("orders", vec![event("a")], ExpectedRevision::Any, None).unwrap();
        store
            .create_stream("acme", Matcher::fields(&json!({"tenant": "acme"})).unwrap())
            .unwrap();
        store.close().unwrap();
    }

    // Redirect the matcher behind the store's back.
    let catalog_path = dir.path().join("storage.streams");
    let tampered = std::fs::read_to_string(&catalog_path)
        .unwrap()
        .replace("acme", "evil");
    std::fs::write(&catalog_path, tampered).unwrap();

    let err = EventStore::open(config()).unwrap_err();
    assert!(matches!(err, StoreError::FingerprintMismatch { .. }));
}

#[test]
fn predicate_streams_need_restoring_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open_store(&dir);
        store.commit("s", vec![json!({"n": 1}), json!({"n": 2})], ExpectedRevision::Any, None).unwrap();
        store
            .create_stream(
                "odd",
                Matcher::Predicate(Arc::new(|e| e.payload["n"].as_i64().unwrap_or(0) % 2 == 1)),
            )
            .unwrap();
        assert_eq!(store.event_stream("odd").unwrap().events().unwrap().len(), 1);
        store.close().unwrap();
    }

    let mut store = open_store(&dir);
    // The index survived; history is still readable.
    assert_eq!(store.event_stream("odd").unwrap().events().unwrap().len(), 1);

    // Without the predicate, new commits bypass the stream.
    store.commit("s", vec![json!({"n": 3})], ExpectedRevision::Any, None).unwrap();
    assert_eq!(store.event_stream("odd").unwrap().events().unwrap().len(), 1);

    // Re-arm and commit again.
    store
        .restore_stream(
            "odd",
            Matcher::Predicate(Arc::new(|e| e.payload["n"].as_i64().unwrap_or(0) % 2 == 1)),
        )
        .unwrap();
    store.commit("s", vec![json!({"n": 5})], ExpectedRevision::Any, None).unwrap();
    assert_eq!(store.event_stream("odd").unwrap().events().unwrap().len(), 2);
    store.close().unwrap();
}

// ============================================================================
// Locking
// ============================================================================

#[test]
fn second_writer_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let err = EventStore::open(StoreConfig::new(dir.path())).unwrap_err();
    assert!(matches!(err, StoreError::LockHeld { .. }));
    drop(store);
}

#[test]
fn read_only_instances_take_no_lock() {
    let dir = TempDir::new().unwrap();
    let mut writer = open_store(&dir);
    writer.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();

    let mut reader = EventStore::open(StoreConfig::new(dir.path()).read_only()).unwrap();
    assert_eq!(reader.event_stream("s").unwrap().events().unwrap().len(), 1);

    // The reader must not be able to write.
    assert!(matches!(
        reader.commit("s", vec![event("b")], ExpectedRevision::Any, None),
        Err(StoreError::ReadOnly)
    ));
}

#[test]
fn read_only_refresh_sees_new_commits() {
    let dir = TempDir::new().unwrap();
    let mut writer = open_store(&dir);
    writer.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();

    let mut reader = EventStore::open(StoreConfig::new(dir.path()).read_only()).unwrap();
    assert_eq!(reader.event_stream("s").unwrap().events().unwrap().len(), 1);

    writer.commit("s", vec![event("b")], ExpectedRevision::Any, None).unwrap();
    writer.commit("later", vec![event("c")], ExpectedRevision::Any, None).unwrap();

    reader.refresh().unwrap();
    assert_eq!(reader.event_stream("s").unwrap().events().unwrap().len(), 2);
    assert_eq!(reader.event_stream("later").unwrap().events().unwrap().len(), 1);
}

#[test]
fn clean_close_releases_the_lock() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open_store(&dir);
        store.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();
        store.close().unwrap();
    }
    assert!(!dir.path().join("storage.lock").exists());

    // Reopen cleanly.
    let mut store = open_store(&dir);
    assert_eq!(store.stream_version("s"), 1);
    store.close().unwrap();
}

// ============================================================================
// Crash recovery
// ============================================================================

#[test]
fn unclean_shutdown_recovers_a_torn_partition_tail() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open_store(&dir);
        store
            .commit("s", vec![event("a"), event("b")], ExpectedRevision::Any, None)
            .unwrap();
        // Simulated crash: no close(), the lock file stays behind.
    }
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("storage.s"))
            .unwrap();
        file.write_all(b"999       torn").unwrap();
    }

    let mut store = open_store(&dir);
    assert_eq!(store.stream_version("s"), 2);
    assert_eq!(store.event_stream("s").unwrap().events().unwrap().len(), 2);
    store.close().unwrap();
}

#[test]
fn recovery_truncates_index_entries_for_lost_documents() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open_store(&dir);
        store
            .commit("s", vec![event("a"), event("b")], ExpectedRevision::Any, None)
            .unwrap();
    }
    // Chop bytes off the tail so the second document is torn.
    let partition_path = dir.path().join("storage.s");
    let len = std::fs::metadata(&partition_path).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&partition_path)
        .unwrap();
    file.set_len(len - 5).unwrap();
    drop(file);

    let mut store = open_store(&dir);
    assert_eq!(store.stream_version("s"), 1);
    let events = store.event_stream("s").unwrap().events().unwrap();
    assert_eq!(events, vec![event("a")]);

    // Recovery ran before anyone could subscribe; its truncate
    // notifications are replayed to the subscriber on attach.
    let truncations = Arc::new(Mutex::new(Vec::new()));
    {
        let truncations = Arc::clone(&truncations);
        store.subscribe(move |e| {
            if matches!(
                e,
                StoreEvent::Truncated { .. } | StoreEvent::PartitionTruncated { .. }
            ) {
                truncations.lock().unwrap().push(e.clone());
            }
        });
    }
    let seen = truncations.lock().unwrap();
    assert!(seen.iter().any(|e| matches!(
        e,
        StoreEvent::PartitionTruncated { partition, .. } if partition == "s"
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        StoreEvent::Truncated { stream, prev_length: 2, new_length: 1 } if stream == "primary"
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        StoreEvent::Truncated { stream, prev_length: 2, new_length: 1 } if stream == "s"
    )));
    drop(seen);

    // The stream accepts new commits at the recovered head.
    store.commit("s", vec![event("c")], ExpectedRevision::exact(1), None).unwrap();
    assert_eq!(store.stream_version("s"), 2);
    store.close().unwrap();
}

// ============================================================================
// Reindex
// ============================================================================

#[test]
fn reindex_rebuilds_the_same_ordering() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.commit("foo", vec![json!({"e": "A"})], ExpectedRevision::Any, None).unwrap();
    store.commit("bar", vec![json!({"e": "B"})], ExpectedRevision::Any, None).unwrap();
    store.commit("foo", vec![json!({"e": "C"})], ExpectedRevision::Any, None).unwrap();

    let truncations = Arc::new(Mutex::new(Vec::new()));
    {
        let truncations = Arc::clone(&truncations);
        store.subscribe(move |e| {
            if let StoreEvent::Truncated { .. } = e {
                truncations.lock().unwrap().push(e.clone());
            }
        });
    }

    store.reindex().unwrap();

    // Every rewritten index announces its truncation, lengths preserved.
    let seen = truncations.lock().unwrap();
    assert!(seen.iter().any(|e| matches!(
        e,
        StoreEvent::Truncated { stream, prev_length: 3, new_length: 3 } if stream == "primary"
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        StoreEvent::Truncated { stream, prev_length: 2, new_length: 2 } if stream == "foo"
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        StoreEvent::Truncated { stream, prev_length: 1, new_length: 1 } if stream == "bar"
    )));
    drop(seen);

    let merged = store.join_streams(&["foo", "bar"]).unwrap().events().unwrap();
    let order: Vec<&str> = merged.iter().map(|e| e["e"].as_str().unwrap()).collect();
    assert_eq!(order, vec!["A", "B", "C"]);
    assert_eq!(store.stream_version("foo"), 2);
    assert_eq!(store.stream_version("bar"), 1);
    store.close().unwrap();
}

// ============================================================================
// Consumers
// ============================================================================

#[test]
fn consumer_with_state_is_exactly_once() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.commit("s", vec![json!({"d": 1})], ExpectedRevision::Any, None).unwrap();

    store
        .create_consumer("s", "counter", json!({"v": 0}), |_envelope, ctx| {
            let v = ctx.state()["v"].as_i64().unwrap();
            ctx.set_state(json!({"v": v + 1}));
            Ok(())
        })
        .unwrap();

    store
        .commit("s", vec![json!({"d": 1}), json!({"d": 1})], ExpectedRevision::Any, None)
        .unwrap();

    assert_eq!(store.consumer_state("s", "counter").unwrap(), json!({"v": 3}));
    assert_eq!(store.consumer_position("s", "counter").unwrap(), 3);

    // The checkpoint on disk couples position and state atomically.
    let checkpoint: Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("storage.s.counter.state")).unwrap(),
    )
    .unwrap();
    assert_eq!(checkpoint["position"], json!(3));
    assert_eq!(checkpoint["state"], json!({"v": 3}));
    store.close().unwrap();
}

#[test]
fn consumer_resumes_from_its_checkpoint_after_a_crash() {
    let dir = TempDir::new().unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));

    {
        let mut store = open_store(&dir);
        store
            .commit("s", vec![json!({"d": 1}), json!({"d": 2})], ExpectedRevision::Any, None)
            .unwrap();
        let delivered = Arc::clone(&delivered);
        store
            .create_consumer("s", "c1", json!({"v": 0}), move |_envelope, ctx| {
                delivered.fetch_add(1, Ordering::SeqCst);
                let v = ctx.state()["v"].as_i64().unwrap();
                ctx.set_state(json!({"v": v + 1}));
                Ok(())
            })
            .unwrap();
        store.close().unwrap();
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 2);

    // "Crash" and restart: the consumer must not re-process events 1 and 2.
    let mut store = open_store(&dir);
    let delivered2 = Arc::new(AtomicUsize::new(0));
    {
        let delivered2 = Arc::clone(&delivered2);
        store
            .create_consumer("s", "c1", json!({"v": 0}), move |_envelope, ctx| {
                delivered2.fetch_add(1, Ordering::SeqCst);
                let v = ctx.state()["v"].as_i64().unwrap();
                ctx.set_state(json!({"v": v + 1}));
                Ok(())
            })
            .unwrap();
    }
    assert_eq!(delivered2.load(Ordering::SeqCst), 0);
    assert_eq!(store.consumer_state("s", "c1").unwrap(), json!({"v": 2}));

    store.commit("s", vec![json!({"d": 3})], ExpectedRevision::Any, None).unwrap();
    assert_eq!(delivered2.load(Ordering::SeqCst), 1);
    assert_eq!(store.consumer_state("s", "c1").unwrap(), json!({"v": 3}));
    store.close().unwrap();
}

#[test]
fn consumer_without_state_still_advances_its_position() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    // The stream does not exist yet.
    let result = store.create_consumer("s", "log", Value::Null, |_envelope, _ctx| Ok(()));
    assert!(matches!(result, Err(StoreError::UnknownStream(_))));

    let seen = Arc::new(Mutex::new(Vec::new()));

    store.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();
    {
        let seen = Arc::clone(&seen);
        store
            .create_consumer("s", "log", Value::Null, move |envelope, _ctx| {
                seen.lock().unwrap().push(envelope.payload.clone());
                Ok(())
            })
            .unwrap();
    }
    store.commit("s", vec![event("b")], ExpectedRevision::Any, None).unwrap();

    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(store.consumer_position("s", "log").unwrap(), 2);
    store.close().unwrap();
}

#[test]
fn failing_handler_stops_the_consumer() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        store.subscribe(move |e| {
            if let StoreEvent::ConsumerError { message, .. } = e {
                errors.lock().unwrap().push(message.clone());
            }
        });
    }

    store
        .create_consumer("s", "bad", Value::Null, |_envelope, _ctx| {
            Err("boom".into())
        })
        .unwrap();

    assert_eq!(store.consumer_position("s", "bad").unwrap(), 0);
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert_eq!(errors.lock().unwrap()[0], "boom");

    // Further commits do not reach the stopped consumer.
    store.commit("s", vec![event("b")], ExpectedRevision::Any, None).unwrap();
    assert_eq!(store.consumer_position("s", "bad").unwrap(), 0);
    store.close().unwrap();
}

#[test]
fn reset_consumer_replays_from_the_start() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store
        .commit("s", vec![json!({"d": 1}), json!({"d": 2})], ExpectedRevision::Any, None)
        .unwrap();

    store
        .create_consumer("s", "c", json!({"v": 0}), |_envelope, ctx| {
            let v = ctx.state()["v"].as_i64().unwrap();
            ctx.set_state(json!({"v": v + 1}));
            Ok(())
        })
        .unwrap();
    assert_eq!(store.consumer_state("s", "c").unwrap(), json!({"v": 2}));

    store.reset_consumer("s", "c", None, 0).unwrap();
    assert_eq!(store.consumer_state("s", "c").unwrap(), json!({"v": 2}));
    assert_eq!(store.consumer_position("s", "c").unwrap(), 2);
    store.close().unwrap();
}

// ============================================================================
// Notifications
// ============================================================================

#[test]
fn subscribers_observe_the_commit_lifecycle() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        store.subscribe(move |e| seen.lock().unwrap().push(e.clone()));
    }

    store.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&StoreEvent::PartitionCreated { partition: "s".to_string() }));
    assert!(seen.contains(&StoreEvent::IndexCreated { stream: "s".to_string() }));
    assert!(seen.iter().any(|e| matches!(
        e,
        StoreEvent::Wrote { stream, sequence: 1, .. } if stream == "s"
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        StoreEvent::IndexAdd { stream, number: 1 } if stream == "s"
    )));
}

#[test]
fn caught_up_fires_when_a_consumer_reaches_the_head() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();

    let caught_up = Arc::new(AtomicUsize::new(0));
    {
        let caught_up = Arc::clone(&caught_up);
        store.subscribe(move |e| {
            if matches!(e, StoreEvent::CaughtUp { .. }) {
                caught_up.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    store
        .create_consumer("s", "c", Value::Null, |_envelope, _ctx| Ok(()))
        .unwrap();
    assert_eq!(caught_up.load(Ordering::SeqCst), 1);

    // Falls behind on the next commit, then catches up again.
    store.commit("s", vec![event("b")], ExpectedRevision::Any, None).unwrap();
    assert_eq!(caught_up.load(Ordering::SeqCst), 2);
    store.close().unwrap();
}

// ============================================================================
// Reopen round-trips
// ============================================================================

#[test]
fn store_state_survives_close_and_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open_store(&dir);
        store
            .commit("orders", vec![event("a"), event("b")], ExpectedRevision::Any, None)
            .unwrap();
        store.commit("payments", vec![event("c")], ExpectedRevision::Any, None).unwrap();
        store.close().unwrap();
    }

    let mut store = open_store(&dir);
    assert_eq!(store.sequence(), 3);
    assert_eq!(store.stream_version("orders"), 2);
    assert_eq!(store.stream_version("payments"), 1);

    let merged = store
        .join_streams(&["orders", "payments"])
        .unwrap()
        .events()
        .unwrap();
    assert_eq!(merged.len(), 3);

    // Optimistic concurrency picks up exactly where it left off.
    store
        .commit("orders", vec![event("d")], ExpectedRevision::exact(2), None)
        .unwrap();
    store.close().unwrap();
}

#[test]
fn closed_store_rejects_commits() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    store.commit("s", vec![event("a")], ExpectedRevision::Any, None).unwrap();
    store.close().unwrap();

    assert!(matches!(
        store.commit("s", vec![event("b")], ExpectedRevision::Any, None),
        Err(StoreError::Closed)
    ));
}
