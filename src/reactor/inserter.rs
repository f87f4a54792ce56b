//! Buffered, batched insertion of events into a database.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::error::Storage;
use crate::reactor::event::{EventPtr, EventValue};
use crate::reactor::vocabulary::TermId;
use crate::reactor::{Emitter, Reactor, ReactorKind};
use crate::{Error, Result};

/// A projected database row: column name, value pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<(String, EventValue)>,
}

impl Row {
    /// The value stored under a column.
    pub fn get(&self, column: &str) -> Option<&EventValue> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Iterates over the columns in mapping order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &EventValue)> {
        self.values.iter().map(|(c, v)| (c.as_str(), v))
    }
}

/// Blocking database collaborator driven by the writer thread.
pub trait Database: Send {
    /// Opens a transaction.
    fn begin(&mut self) -> Result<()>;
    /// Inserts one row inside the open transaction.
    fn insert(&mut self, row: &Row) -> Result<()>;
    /// Commits the open transaction.
    fn commit(&mut self) -> Result<()>;
}

/// Tuning knobs for a [`DatabaseInserter`].
#[derive(Debug, Clone)]
pub struct InserterConfig {
    /// Rows per transaction; reaching it wakes the writer.
    pub batch_size: usize,
    /// Maximum queued rows before the writer is force-woken.
    pub queue_max: usize,
    /// The writer flushes at least this often.
    pub flush_interval: Duration,
    /// Whole-batch retries before dead-lettering.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff.
    pub retry_backoff: Duration,
    /// Where dead-lettered events are appended as JSON lines.
    pub dead_letter_path: Option<PathBuf>,
}

impl Default for InserterConfig {
    fn default() -> Self {
        InserterConfig {
            batch_size: 100,
            queue_max: 10_000,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            dead_letter_path: None,
        }
    }
}

struct Shared {
    mapping: Vec<(String, TermId)>,
    key_term: Option<TermId>,
    config: InserterConfig,
    database: Mutex<Box<dyn Database>>,
    queue: Mutex<VecDeque<(Row, EventPtr)>>,
    key_cache: Mutex<HashSet<String>>,
    running: AtomicBool,
    dedupe_count: AtomicU64,
    inserted_count: AtomicU64,
    dead_letter_count: AtomicU64,
}

/// Buffers rows projected from events and flushes them to a
/// [`Database`] in batched transactions on a dedicated writer thread.
///
/// A row whose primary key was already queued in the current batch
/// window is dropped as a duplicate. Failed batches are retried with
/// exponential backoff and finally appended to the dead-letter file.
pub struct DatabaseInserter {
    shared: Arc<Shared>,
    signal: Sender<()>,
    signal_rx: Option<Receiver<()>>,
    writer: Option<JoinHandle<()>>,
}

impl fmt::Debug for DatabaseInserter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseInserter")
            .field("queued", &self.queued())
            .field("running", &self.shared.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl DatabaseInserter {
    /// Creates a stopped inserter.
    ///
    /// `mapping` lists `(column, term)` projections applied to every
    /// event; `key_term` selects the term treated as the primary key
    /// for de-duplication.
    pub fn new(
        database: Box<dyn Database>,
        mapping: Vec<(String, TermId)>,
        key_term: Option<TermId>,
        config: InserterConfig,
    ) -> DatabaseInserter {
        let (signal, signal_rx) = bounded(1);
        DatabaseInserter {
            shared: Arc::new(Shared {
                mapping,
                key_term,
                config,
                database: Mutex::new(database),
                queue: Mutex::new(VecDeque::new()),
                key_cache: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
                dedupe_count: AtomicU64::new(0),
                inserted_count: AtomicU64::new(0),
                dead_letter_count: AtomicU64::new(0),
            }),
            signal,
            signal_rx: Some(signal_rx),
            writer: None,
        }
    }

    /// Starts the writer thread.
    pub fn start(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let receiver = self.signal_rx.take().ok_or_else(|| {
            Error::new_storage(Storage::Transaction, "inserter cannot be restarted".to_string())
        })?;
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let writer = std::thread::Builder::new()
            .name("pion-db-writer".to_string())
            .spawn(move || writer_loop(shared, receiver))
            .map_err(Error::new_io)?;
        self.writer = Some(writer);
        info!("database inserter started");
        Ok(())
    }

    /// Flushes outstanding rows and joins the writer thread.
    pub fn stop(&mut self) {
        if self.writer.is_none() {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.signal.try_send(());
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        info!(
            inserted = self.shared.inserted_count.load(Ordering::Relaxed),
            deduped = self.shared.dedupe_count.load(Ordering::Relaxed),
            "database inserter stopped"
        );
    }

    /// Projects an event to a row and queues it for insertion.
    pub fn insert(&self, event: &EventPtr) -> Result<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(Error::new_storage(
                Storage::Transaction,
                "database inserter is not running".to_string(),
            ));
        }
        let row = self.shared.project(event);

        if let Some(key) = self.shared.row_key(&row) {
            let mut keys = lock(&self.shared.key_cache);
            if !keys.insert(key) {
                self.shared.dedupe_count.fetch_add(1, Ordering::Relaxed);
                debug!("dropped duplicate row");
                return Ok(());
            }
        }

        let queued = {
            let mut queue = lock(&self.shared.queue);
            queue.push_back((row, event.clone()));
            queue.len()
        };
        if queued >= self.shared.config.batch_size || queued >= self.shared.config.queue_max {
            // Wake the writer; a full channel means it is already due.
            let _ = self.signal.try_send(());
        }
        Ok(())
    }

    /// Rows currently waiting for the writer.
    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Keys cached in the current batch window.
    pub fn key_cache_size(&self) -> usize {
        lock(&self.shared.key_cache).len()
    }

    /// Rows dropped as in-batch duplicates.
    pub fn dedupe_count(&self) -> u64 {
        self.shared.dedupe_count.load(Ordering::Relaxed)
    }

    /// Rows committed to the database.
    pub fn inserted_count(&self) -> u64 {
        self.shared.inserted_count.load(Ordering::Relaxed)
    }

    /// Events diverted to the dead-letter sink.
    pub fn dead_letter_count(&self) -> u64 {
        self.shared.dead_letter_count.load(Ordering::Relaxed)
    }
}

impl Drop for DatabaseInserter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn project(&self, event: &EventPtr) -> Row {
        let values = self
            .mapping
            .iter()
            .map(|(column, term)| {
                let value = event
                    .get(*term)
                    .cloned()
                    .unwrap_or_else(|| EventValue::Str(String::new()));
                (column.clone(), value)
            })
            .collect();
        Row { values }
    }

    fn row_key(&self, row: &Row) -> Option<String> {
        let key_term = self.key_term?;
        let column = self
            .mapping
            .iter()
            .find(|(_, term)| *term == key_term)
            .map(|(column, _)| column.as_str())?;
        row.get(column).map(|value| value.to_string())
    }
}

fn writer_loop(shared: Arc<Shared>, receiver: Receiver<()>) {
    loop {
        match receiver.recv_timeout(shared.config.flush_interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        flush(&shared);
        if !shared.running.load(Ordering::SeqCst) {
            // Drain whatever arrived while stopping, then exit.
            flush(&shared);
            break;
        }
    }
    debug!("database writer thread exiting");
}

fn flush(shared: &Arc<Shared>) {
    let batch: Vec<(Row, EventPtr)> = {
        let mut queue = lock(&shared.queue);
        queue.drain(..).collect()
    };
    // The de-duplication window closes with the batch.
    lock(&shared.key_cache).clear();
    if batch.is_empty() {
        return;
    }

    let mut attempt = 0u32;
    loop {
        match commit_batch(shared, &batch) {
            Ok(()) => {
                shared
                    .inserted_count
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(rows = batch.len(), "committed batch");
                return;
            }
            Err(e) if attempt < shared.config.max_retries => {
                attempt += 1;
                let backoff = shared.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    error = %e,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "batch insert failed; retrying"
                );
                std::thread::sleep(backoff);
            }
            Err(e) => {
                error!(error = %e, rows = batch.len(), "batch insert failed; dead-lettering");
                dead_letter(shared, &batch);
                return;
            }
        }
    }
}

fn commit_batch(shared: &Arc<Shared>, batch: &[(Row, EventPtr)]) -> Result<()> {
    let mut database = lock(&shared.database);
    database.begin()?;
    for (row, _) in batch {
        database.insert(row)?;
    }
    database.commit()
}

fn dead_letter(shared: &Arc<Shared>, batch: &[(Row, EventPtr)]) {
    shared
        .dead_letter_count
        .fetch_add(batch.len() as u64, Ordering::Relaxed);
    let path = match shared.config.dead_letter_path {
        Some(ref path) => path,
        None => {
            warn!(rows = batch.len(), "no dead-letter file configured; dropping batch");
            return;
        }
    };
    let mut file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            error!(error = %e, "could not open dead-letter file");
            return;
        }
    };
    for (_, event) in batch {
        match serde_json::to_string(&**event) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    error!(error = %e, "could not append to dead-letter file");
                    return;
                }
            }
            Err(e) => error!(error = %e, "could not serialize dead-lettered event"),
        }
    }
}

/// A storage reactor delivering events through a [`DatabaseInserter`]
/// and forwarding them downstream.
#[derive(Debug)]
pub struct DatabaseOutputReactor {
    inserter: DatabaseInserter,
}

impl DatabaseOutputReactor {
    /// Wraps an inserter as a reactor.
    pub fn new(inserter: DatabaseInserter) -> DatabaseOutputReactor {
        DatabaseOutputReactor { inserter }
    }

    /// The wrapped inserter.
    pub fn inserter(&self) -> &DatabaseInserter {
        &self.inserter
    }
}

impl Reactor for DatabaseOutputReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::Storage
    }

    fn start(&mut self) -> Result<()> {
        self.inserter.start()
    }

    fn stop(&mut self) -> Result<()> {
        self.inserter.stop();
        Ok(())
    }

    fn process(&mut self, event: &EventPtr, out: &mut Emitter<'_>) -> Result<()> {
        self.inserter.insert(event)?;
        out.deliver(event.clone());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::event::Event;

    #[derive(Default)]
    struct MemoryDatabase {
        batches: Arc<Mutex<Vec<Vec<Row>>>>,
        pending: Vec<Row>,
        fail_commits: Arc<AtomicU64>,
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
            if self.fail_commits.load(Ordering::SeqCst) > 0 {
                self.fail_commits.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::new_storage(
                    Storage::Transaction,
                    "injected failure".to_string(),
                ));
            }
            lock(&self.batches).push(std::mem::take(&mut self.pending));
            Ok(())
        }
    }

    const KEY: TermId = 1;
    const NAME: TermId = 2;

    fn event(key: u64, name: &str) -> EventPtr {
        let mut event = Event::new(100);
        event.set_uint(KEY, key);
        event.set_str(NAME, name);
        Arc::new(event)
    }

    fn inserter(
        batch_size: usize,
        fail_commits: u64,
        dead_letter: Option<PathBuf>,
    ) -> (DatabaseInserter, Arc<Mutex<Vec<Vec<Row>>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let database = MemoryDatabase {
            batches: batches.clone(),
            pending: Vec::new(),
            fail_commits: Arc::new(AtomicU64::new(fail_commits)),
        };
        // A long interval keeps these tests signal-driven; flushes
        // happen at batch_size or on stop, never on the timer.
        let config = InserterConfig {
            batch_size,
            flush_interval: Duration::from_secs(5),
            max_retries: 1,
            retry_backoff: Duration::from_millis(10),
            dead_letter_path: dead_letter,
            ..InserterConfig::default()
        };
        let mapping = vec![("id".to_string(), KEY), ("name".to_string(), NAME)];
        (
            DatabaseInserter::new(Box::new(database), mapping, Some(KEY), config),
            batches,
        )
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn batches_flush_at_batch_size_then_on_stop() {
        let (mut inserter, batches) = inserter(3, 0, None);
        inserter.start().unwrap();

        inserter.insert(&event(1, "a")).unwrap();
        inserter.insert(&event(2, "b")).unwrap();
        inserter.insert(&event(1, "dup")).unwrap();
        inserter.insert(&event(3, "c")).unwrap();
        wait_for(|| !lock(&batches).is_empty());

        inserter.insert(&event(4, "d")).unwrap();
        inserter.stop();

        let batches = lock(&batches);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(inserter.dedupe_count(), 1);
        assert_eq!(inserter.inserted_count(), 4);
    }

    #[test]
    fn key_cache_clears_after_flush() {
        let (mut inserter, batches) = inserter(2, 0, None);
        inserter.start().unwrap();
        inserter.insert(&event(7, "x")).unwrap();
        inserter.insert(&event(8, "y")).unwrap();
        wait_for(|| !lock(&batches).is_empty());
        wait_for(|| inserter.key_cache_size() == 0);
        // The same key is no longer a duplicate in the next window.
        inserter.insert(&event(7, "again")).unwrap();
        assert_eq!(inserter.dedupe_count(), 0);
        inserter.stop();
        assert_eq!(inserter.inserted_count(), 3);
    }

    #[test]
    fn failed_batches_retry_then_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let dead = dir.path().join("dead-letter.jsonl");
        // Two injected failures exceed max_retries (1).
        let (mut inserter, batches) = inserter(1, 2, Some(dead.clone()));
        inserter.start().unwrap();
        inserter.insert(&event(1, "doomed")).unwrap();
        wait_for(|| inserter.dead_letter_count() == 1);
        inserter.stop();

        assert!(lock(&batches).is_empty());
        let contents = std::fs::read_to_string(&dead).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["event_type"], 100);
    }

    #[test]
    fn retry_succeeds_within_budget() {
        // One failure, one retry allowed: the batch lands.
        let (mut inserter, batches) = inserter(1, 1, None);
        inserter.start().unwrap();
        inserter.insert(&event(5, "ok")).unwrap();
        wait_for(|| !lock(&batches).is_empty());
        inserter.stop();
        assert_eq!(inserter.inserted_count(), 1);
        assert_eq!(inserter.dead_letter_count(), 0);
    }

    #[test]
    fn insert_requires_running() {
        let (inserter, _batches) = inserter(1, 0, None);
        assert!(inserter.insert(&event(1, "early")).unwrap_err().is_storage());
    }
}
