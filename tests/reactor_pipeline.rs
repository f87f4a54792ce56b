//! End-to-end tests for the event pipeline: traffic decoding, the
//! reactor graph, batched storage, and the event log.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pion::reactor::event::EventPtr;
use pion::reactor::inserter::{
    Database, DatabaseInserter, DatabaseOutputReactor, InserterConfig, Row,
};
use pion::reactor::log_output::{JsonCodec, LogOutputReactor};
use pion::reactor::protocol::{clickstream_vocabulary, terms, Direction, HttpProtocol};
use pion::reactor::{Emitter, Reactor, ReactorEngine, ReactorKind, TermId};
use pion::Result;

const REQUEST: &[u8] = b"GET /page HTTP/1.1\r\nHost: shop.example\r\nReferer: /home\r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
const RESPONSE_304: &[u8] = b"HTTP/1.1 304 Not Modified\r\n\r\n";

fn term(uri: &str) -> TermId {
    clickstream_vocabulary().find_term(uri).unwrap()
}

/// Replays one request/response pair through the protocol decoder.
fn replay(response: &[u8]) -> EventPtr {
    let vocabulary = clickstream_vocabulary();
    let mut protocol = HttpProtocol::new(&vocabulary).unwrap();
    assert!(protocol
        .read_next(Direction::ClientToServer, REQUEST)
        .unwrap()
        .is_none());
    protocol
        .read_next(Direction::ServerToClient, response)
        .unwrap()
        .expect("one event per exchange")
}

#[test]
fn traffic_replay_produces_exactly_one_event() {
    let event = replay(RESPONSE);
    assert_eq!(event.get_uint(term(terms::STATUS)), Some(200));
    assert_eq!(
        event.get_uint(term(terms::BYTES)),
        Some((REQUEST.len() + RESPONSE.len()) as u64)
    );
    assert_eq!(event.get_uint(term(terms::CACHED)), Some(0));
    assert_eq!(event.get_str(term(terms::HOST)), Some("shop.example"));
    assert_eq!(event.get_str(term(terms::REFERER)), Some("/home"));
}

#[test]
fn not_modified_replay_is_cached() {
    let event = replay(RESPONSE_304);
    assert_eq!(event.get_uint(term(terms::STATUS)), Some(304));
    assert_eq!(event.get_uint(term(terms::CACHED)), Some(1));
}

#[derive(Default)]
struct MemoryDatabase {
    batches: Arc<Mutex<Vec<Vec<Row>>>>,
    pending: Vec<Row>,
}

impl Database for MemoryDatabase {
    fn begin(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn insert(&mut self, row: &Row) -> Result<()> {
        self.pending.push(row.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.batches
            .lock()
            .unwrap()
            .push(std::mem::take(&mut self.pending));
        Ok(())
    }
}

fn clickstream_inserter(
    batch_size: usize,
) -> (DatabaseInserter, Arc<Mutex<Vec<Vec<Row>>>>) {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let database = MemoryDatabase {
        batches: batches.clone(),
        pending: Vec::new(),
    };
    let mapping = vec![
        ("uri".to_string(), term(terms::URI)),
        ("status".to_string(), term(terms::STATUS)),
        ("bytes".to_string(), term(terms::BYTES)),
    ];
    let config = InserterConfig {
        batch_size,
        flush_interval: Duration::from_secs(10),
        ..InserterConfig::default()
    };
    (
        DatabaseInserter::new(Box::new(database), mapping, Some(term(terms::URI)), config),
        batches,
    )
}

fn wait_for<F: Fn() -> bool>(predicate: F) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached in time");
}

/// Builds a distinct clickstream event keyed by its URI.
fn click(uri: &str, status: u64) -> EventPtr {
    let mut event = pion::reactor::Event::new(term(terms::EVENT_TYPE));
    event.set_str(term(terms::URI), uri);
    event.set_uint(term(terms::STATUS), status);
    event.set_uint(term(terms::BYTES), 100);
    Arc::new(event)
}

#[test]
fn inserter_batches_and_dedupes() {
    let (mut inserter, batches) = clickstream_inserter(3);
    inserter.start().unwrap();

    // Four distinct rows plus one duplicate key inside the batch.
    inserter.insert(&click("/a", 200)).unwrap();
    inserter.insert(&click("/b", 200)).unwrap();
    inserter.insert(&click("/a", 304)).unwrap();
    inserter.insert(&click("/c", 200)).unwrap();
    wait_for(|| !batches.lock().unwrap().is_empty());
    inserter.insert(&click("/d", 200)).unwrap();
    inserter.stop();

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 2, "one three-row batch, then a one-row batch");
    assert_eq!(batches[0].len(), 3);
    assert_eq!(batches[1].len(), 1);
    assert_eq!(inserter.dedupe_count(), 1);
    assert_eq!(inserter.inserted_count(), 4);

    // Projected rows carry the configured columns.
    let first = &batches[0][0];
    assert!(first.get("uri").is_some());
    assert!(first.get("status").is_some());
    assert!(first.get("bytes").is_some());
}

#[test]
fn graph_routes_replayed_events_to_storage() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("clicks.log");

    let engine = ReactorEngine::new();
    let log_reactor = LogOutputReactor::new(Box::new(JsonCodec), &log_path);
    let (inserter, batches) = clickstream_inserter(1);

    engine.add_reactor("log", Box::new(log_reactor)).unwrap();
    engine
        .add_reactor("database", Box::new(DatabaseOutputReactor::new(inserter)))
        .unwrap();
    engine.add_connection("log", "database").unwrap();
    engine.start().unwrap();

    let event = replay(RESPONSE);
    engine.post("log", event).unwrap();
    wait_for(|| !batches.lock().unwrap().is_empty());

    let log_stats = engine.stats("log").unwrap();
    assert_eq!(log_stats.events_in, 1);
    assert_eq!(log_stats.events_out, 1);
    assert_eq!(log_stats.kind, ReactorKind::Storage);
    let db_stats = engine.stats("database").unwrap();
    assert_eq!(db_stats.events_in, 1);

    engine.stop().unwrap();
    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(contents.lines().count(), 1);
    let parsed: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(parsed["event_type"], u64::from(term(terms::EVENT_TYPE)));
}

#[test]
fn cycle_rejection_across_a_deeper_graph() {
    struct Forward;
    impl Reactor for Forward {
        fn kind(&self) -> ReactorKind {
            ReactorKind::Processing
        }
        fn process(&mut self, event: &EventPtr, out: &mut Emitter<'_>) -> Result<()> {
            out.deliver(event.clone());
            Ok(())
        }
    }

    let engine = ReactorEngine::new();
    for id in ["a", "b", "c", "d"] {
        engine.add_reactor(id, Box::new(Forward)).unwrap();
    }
    engine.add_connection("a", "b").unwrap();
    engine.add_connection("b", "c").unwrap();
    engine.add_connection("c", "d").unwrap();

    // Any back edge, however long the path, is rejected.
    for (from, to) in [("d", "a"), ("d", "b"), ("c", "a"), ("b", "a")] {
        assert!(
            engine.add_connection(from, to).unwrap_err().is_reactor_cycle(),
            "{from} -> {to} must be rejected"
        );
    }
    // Forward and diamond edges remain legal.
    engine.add_connection("a", "c").unwrap();
    engine.add_connection("b", "d").unwrap();
}
