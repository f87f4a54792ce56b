//! The reactor engine: a directed acyclic multigraph of event
//! processors.
//!
//! Every event emitted by a reactor is delivered synchronously, on the
//! delivering thread, to each of its downstream reactors in
//! declared-connection order. Delivery holds the graph's reader lock;
//! mutations take the writer lock and therefore drain in-flight
//! deliveries before they proceed. Reactors that want asynchrony post
//! work onto the [`Scheduler`](crate::Scheduler) from their own
//! `process`.

pub mod event;
pub mod inserter;
pub mod log_output;
pub mod protocol;
pub mod vocabulary;

pub use self::event::{Event, EventPtr, EventValue};
pub use self::vocabulary::{TermId, TermType, Vocabulary};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use crate::error::Reactor as ReactorKindError;
use crate::{Error, Result};

/// The general role a reactor plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorKind {
    /// Produces events from an outside source.
    Collection,
    /// Transforms or filters events.
    Processing,
    /// Delivers events to a terminal sink.
    Storage,
}

/// Collects the events a reactor emits during one `process` call; the
/// engine forwards them downstream afterwards.
#[derive(Debug)]
pub struct Emitter<'a> {
    events: &'a mut Vec<EventPtr>,
}

impl Emitter<'_> {
    /// Emits an event to every downstream connection.
    pub fn deliver(&mut self, event: EventPtr) {
        self.events.push(event);
    }
}

/// A node in the event-processing graph.
pub trait Reactor: Send {
    /// The role this reactor plays.
    fn kind(&self) -> ReactorKind;

    /// Consumes one event, possibly emitting events downstream.
    fn process(&mut self, event: &EventPtr, out: &mut Emitter<'_>) -> Result<()>;

    /// Called when event processing starts.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when event processing stops.
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called whenever the global vocabulary is updated, even while
    /// the reactor is stopped.
    fn update_vocabulary(&mut self, vocabulary: &Vocabulary) {
        let _ = vocabulary;
    }
}

/// Monotonic counters for one reactor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorStats {
    /// Events delivered to the reactor (including dropped ones).
    pub events_in: u64,
    /// Events the reactor emitted downstream.
    pub events_out: u64,
    /// Whether the reactor is currently processing events.
    pub running: bool,
    /// The reactor's declared role.
    pub kind: ReactorKind,
}

struct Node {
    reactor: Mutex<Box<dyn Reactor>>,
    kind: ReactorKind,
    outputs: Mutex<Vec<String>>,
    inputs: Mutex<Vec<String>>,
    running: AtomicBool,
    events_in: AtomicU64,
    events_out: AtomicU64,
}

type Graph = HashMap<String, Arc<Node>>;

/// Routes events through a user-defined graph of reactors.
pub struct ReactorEngine {
    graph: RwLock<Graph>,
    running: AtomicBool,
}

impl fmt::Debug for ReactorEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorEngine")
            .field("reactors", &self.reactor_count())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ReactorEngine {
    fn default() -> Self {
        ReactorEngine::new()
    }
}

impl ReactorEngine {
    /// Creates an empty, stopped engine.
    pub fn new() -> ReactorEngine {
        ReactorEngine {
            graph: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Adds a reactor under a unique id. If the engine is running the
    /// reactor is started immediately.
    pub fn add_reactor(&self, id: &str, reactor: Box<dyn Reactor>) -> Result<()> {
        let mut graph = self.write_graph();
        if graph.contains_key(id) {
            return Err(Error::new_reactor(
                ReactorKindError::Duplicate,
                format!("duplicate reactor identifier: {id}"),
            ));
        }
        let kind = reactor.kind();
        let node = Arc::new(Node {
            reactor: Mutex::new(reactor),
            kind,
            outputs: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            events_in: AtomicU64::new(0),
            events_out: AtomicU64::new(0),
        });
        if self.running.load(Ordering::SeqCst) {
            lock(&node.reactor).start()?;
            node.running.store(true, Ordering::SeqCst);
        }
        info!(reactor = id, ?kind, "added reactor");
        graph.insert(id.to_string(), node);
        Ok(())
    }

    /// Removes a reactor and detaches every connection touching it.
    /// Blocks until in-flight deliveries drain.
    pub fn remove_reactor(&self, id: &str) -> Result<()> {
        let mut graph = self.write_graph();
        let node = graph.remove(id).ok_or_else(|| not_found(id))?;
        if node.running.swap(false, Ordering::SeqCst) {
            lock(&node.reactor).stop()?;
        }
        for other in graph.values() {
            lock(&other.outputs).retain(|o| o != id);
            lock(&other.inputs).retain(|i| i != id);
        }
        info!(reactor = id, "removed reactor");
        Ok(())
    }

    /// Connects `from` to `to`: every event emitted by `from` will be
    /// delivered to `to`. Rejected when it would create a cycle.
    pub fn add_connection(&self, from: &str, to: &str) -> Result<()> {
        let graph = self.write_graph();
        let from_node = graph.get(from).ok_or_else(|| not_found(from))?;
        graph.get(to).ok_or_else(|| not_found(to))?;
        if from == to || has_path(&graph, to, from) {
            return Err(Error::new_reactor(
                ReactorKindError::Cycle,
                format!("connection {from} -> {to} would create a cycle"),
            ));
        }
        lock(&from_node.outputs).push(to.to_string());
        if let Some(to_node) = graph.get(to) {
            lock(&to_node.inputs).push(from.to_string());
        }
        debug!(%from, %to, "added reactor connection");
        Ok(())
    }

    /// Removes one connection from `from` to `to`.
    pub fn remove_connection(&self, from: &str, to: &str) -> Result<()> {
        let graph = self.write_graph();
        let from_node = graph.get(from).ok_or_else(|| not_found(from))?;
        let mut outputs = lock(&from_node.outputs);
        match outputs.iter().position(|o| o == to) {
            Some(index) => {
                outputs.remove(index);
            }
            None => return Err(not_found(to)),
        }
        drop(outputs);
        if let Some(to_node) = graph.get(to) {
            let mut inputs = lock(&to_node.inputs);
            if let Some(index) = inputs.iter().position(|i| i == from) {
                inputs.remove(index);
            }
        }
        Ok(())
    }

    /// Starts every reactor and begins routing events.
    pub fn start(&self) -> Result<()> {
        let graph = self.write_graph();
        for (id, node) in graph.iter() {
            if !node.running.swap(true, Ordering::SeqCst) {
                debug!(reactor = %id, "starting reactor");
                lock(&node.reactor).start()?;
            }
        }
        self.running.store(true, Ordering::SeqCst);
        info!("reactor engine started");
        Ok(())
    }

    /// Stops every reactor; stopped reactors drop delivered events.
    pub fn stop(&self) -> Result<()> {
        let graph = self.write_graph();
        for (id, node) in graph.iter() {
            if node.running.swap(false, Ordering::SeqCst) {
                debug!(reactor = %id, "stopping reactor");
                lock(&node.reactor).stop()?;
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("reactor engine stopped");
        Ok(())
    }

    /// Starts one reactor.
    pub fn start_reactor(&self, id: &str) -> Result<()> {
        let graph = self.read_graph();
        let node = graph.get(id).ok_or_else(|| not_found(id))?;
        if !node.running.swap(true, Ordering::SeqCst) {
            lock(&node.reactor).start()?;
        }
        Ok(())
    }

    /// Stops one reactor; events delivered to it are dropped silently.
    pub fn stop_reactor(&self, id: &str) -> Result<()> {
        let graph = self.read_graph();
        let node = graph.get(id).ok_or_else(|| not_found(id))?;
        if node.running.swap(false, Ordering::SeqCst) {
            lock(&node.reactor).stop()?;
        }
        Ok(())
    }

    /// Delivers an event to the reactor `id`, cascading everything it
    /// and its descendants emit. Runs synchronously on this thread.
    pub fn post(&self, id: &str, event: EventPtr) -> Result<()> {
        let graph = self.read_graph();
        let node = graph.get(id).ok_or_else(|| not_found(id))?;
        deliver(&graph, node, &event)
    }

    /// Pushes a vocabulary update to every reactor, running or not.
    pub fn update_vocabulary(&self, vocabulary: &Vocabulary) {
        let graph = self.read_graph();
        for node in graph.values() {
            lock(&node.reactor).update_vocabulary(vocabulary);
        }
    }

    /// Counters for one reactor.
    pub fn stats(&self, id: &str) -> Result<ReactorStats> {
        let graph = self.read_graph();
        let node = graph.get(id).ok_or_else(|| not_found(id))?;
        Ok(ReactorStats {
            events_in: node.events_in.load(Ordering::Relaxed),
            events_out: node.events_out.load(Ordering::Relaxed),
            running: node.running.load(Ordering::Relaxed),
            kind: node.kind,
        })
    }

    /// Number of reactors in the graph.
    pub fn reactor_count(&self) -> usize {
        self.read_graph().len()
    }

    /// True when a connection from `from` to `to` exists.
    pub fn has_connection(&self, from: &str, to: &str) -> bool {
        let graph = self.read_graph();
        graph
            .get(from)
            .map(|node| lock(&node.outputs).iter().any(|o| o == to))
            .unwrap_or(false)
    }

    fn read_graph(&self) -> std::sync::RwLockReadGuard<'_, Graph> {
        self.graph.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_graph(&self) -> std::sync::RwLockWriteGuard<'_, Graph> {
        self.graph.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn deliver(graph: &Graph, node: &Arc<Node>, event: &EventPtr) -> Result<()> {
    node.events_in.fetch_add(1, Ordering::Relaxed);
    if !node.running.load(Ordering::SeqCst) {
        // A stopped reactor silently drops events.
        return Ok(());
    }
    let mut emitted = Vec::new();
    {
        let mut reactor = lock(&node.reactor);
        reactor.process(event, &mut Emitter { events: &mut emitted })?;
    }
    node.events_out
        .fetch_add(emitted.len() as u64, Ordering::Relaxed);
    let outputs = lock(&node.outputs).clone();
    for out_event in emitted {
        for child_id in &outputs {
            if let Some(child) = graph.get(child_id) {
                deliver(graph, child, &out_event)?;
            }
        }
    }
    Ok(())
}

/// Depth-first search for a path between two nodes along output edges.
fn has_path(graph: &Graph, from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    let mut stack = vec![from.to_string()];
    let mut seen = std::collections::HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        if let Some(node) = graph.get(&current) {
            for next in lock(&node.outputs).iter() {
                if next == to {
                    return true;
                }
                stack.push(next.clone());
            }
        }
    }
    false
}

fn not_found(id: &str) -> Error {
    Error::new_reactor(
        ReactorKindError::NotFound,
        format!("no reactor found for identifier: {id}"),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forwards every event, tagging it with its own marker term.
    struct Relay {
        marker: TermId,
    }

    impl Reactor for Relay {
        fn kind(&self) -> ReactorKind {
            ReactorKind::Processing
        }

        fn process(&mut self, event: &EventPtr, out: &mut Emitter<'_>) -> Result<()> {
            let mut tagged = (**event).clone();
            tagged.set_uint(self.marker, 1);
            out.deliver(Arc::new(tagged));
            Ok(())
        }
    }

    /// Remembers every event it sees.
    #[derive(Default)]
    struct Sink {
        seen: Arc<Mutex<Vec<EventPtr>>>,
    }

    impl Reactor for Sink {
        fn kind(&self) -> ReactorKind {
            ReactorKind::Storage
        }

        fn process(&mut self, event: &EventPtr, _out: &mut Emitter<'_>) -> Result<()> {
            lock(&self.seen).push(event.clone());
            Ok(())
        }
    }

    fn engine_with_chain() -> (ReactorEngine, Arc<Mutex<Vec<EventPtr>>>) {
        let engine = ReactorEngine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        engine
            .add_reactor("relay", Box::new(Relay { marker: 99 }))
            .unwrap();
        engine
            .add_reactor("sink", Box::new(Sink { seen: seen.clone() }))
            .unwrap();
        engine.add_connection("relay", "sink").unwrap();
        (engine, seen)
    }

    #[test]
    fn events_flow_through_connections() {
        let (engine, seen) = engine_with_chain();
        engine.start().unwrap();
        engine.post("relay", Arc::new(Event::new(1))).unwrap();
        engine.post("relay", Arc::new(Event::new(1))).unwrap();

        let seen = lock(&seen);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].get_uint(99), Some(1));

        let relay = engine.stats("relay").unwrap();
        assert_eq!(relay.events_in, 2);
        assert_eq!(relay.events_out, 2);
        let sink = engine.stats("sink").unwrap();
        assert_eq!(sink.events_in, 2);
        assert_eq!(sink.events_out, 0);
    }

    #[test]
    fn stopped_reactor_drops_events() {
        let (engine, seen) = engine_with_chain();
        engine.start().unwrap();
        engine.stop_reactor("sink").unwrap();
        engine.post("relay", Arc::new(Event::new(1))).unwrap();
        assert!(lock(&seen).is_empty());
        // Delivered-but-dropped events still count as inputs.
        assert_eq!(engine.stats("sink").unwrap().events_in, 1);
    }

    #[test]
    fn cycles_are_rejected() {
        let engine = ReactorEngine::new();
        for id in ["a", "b", "c"] {
            engine.add_reactor(id, Box::new(Relay { marker: 1 })).unwrap();
        }
        engine.add_connection("a", "b").unwrap();
        engine.add_connection("b", "c").unwrap();

        assert!(engine.add_connection("c", "a").unwrap_err().is_reactor_cycle());
        assert!(engine.add_connection("b", "a").unwrap_err().is_reactor_cycle());
        assert!(engine.add_connection("a", "a").unwrap_err().is_reactor_cycle());
        // A parallel edge is allowed (multigraph), as is a diamond.
        engine.add_connection("a", "b").unwrap();
        engine.add_connection("a", "c").unwrap();
    }

    #[test]
    fn remove_reactor_detaches_edges() {
        let (engine, _seen) = engine_with_chain();
        engine.remove_reactor("sink").unwrap();
        assert!(!engine.has_connection("relay", "sink"));
        assert!(engine.post("sink", Arc::new(Event::new(1))).unwrap_err().is_reactor());
        // Delivery to the remaining reactor is unaffected.
        engine.start().unwrap();
        engine.post("relay", Arc::new(Event::new(1))).unwrap();
    }

    #[test]
    fn duplicate_identifier_rejected() {
        let engine = ReactorEngine::new();
        engine.add_reactor("x", Box::new(Relay { marker: 1 })).unwrap();
        let err = engine.add_reactor("x", Box::new(Relay { marker: 2 })).unwrap_err();
        assert!(err.is_reactor());
    }

    #[test]
    fn declared_connection_order_is_preserved() {
        let engine = ReactorEngine::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct OrderedSink {
            name: &'static str,
            order: Arc<Mutex<Vec<&'static str>>>,
        }
        impl Reactor for OrderedSink {
            fn kind(&self) -> ReactorKind {
                ReactorKind::Storage
            }
            fn process(&mut self, _event: &EventPtr, _out: &mut Emitter<'_>) -> Result<()> {
                lock(&self.order).push(self.name);
                Ok(())
            }
        }

        engine.add_reactor("relay", Box::new(Relay { marker: 1 })).unwrap();
        engine
            .add_reactor(
                "first",
                Box::new(OrderedSink { name: "first", order: order.clone() }),
            )
            .unwrap();
        engine
            .add_reactor(
                "second",
                Box::new(OrderedSink { name: "second", order: order.clone() }),
            )
            .unwrap();
        engine.add_connection("relay", "first").unwrap();
        engine.add_connection("relay", "second").unwrap();
        engine.start().unwrap();
        engine.post("relay", Arc::new(Event::new(1))).unwrap();
        assert_eq!(&*lock(&order), &["first", "second"]);
    }
}
