//! Events: the unit of data flowing through the reactor graph.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::reactor::vocabulary::TermId;

/// A typed value stored on an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventValue {
    /// Unsigned integer.
    UInt(u64),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Str(String),
    /// Opaque bytes.
    Blob(Bytes),
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValue::UInt(v) => write!(f, "{v}"),
            EventValue::Int(v) => write!(f, "{v}"),
            EventValue::Float(v) => write!(f, "{v}"),
            EventValue::Str(v) => f.write_str(v),
            EventValue::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// A schema-less ordered map of term id to typed value.
///
/// Events are shared by reference count ([`EventPtr`]); a reactor may
/// retain one past the call that delivered it. Duplicate terms are
/// allowed and kept in insertion order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Event {
    event_type: TermId,
    fields: Vec<(TermId, EventValue)>,
}

/// Reference-counted handle to an [`Event`].
pub type EventPtr = Arc<Event>;

impl Event {
    /// Creates an empty event of the given type term.
    pub fn new(event_type: TermId) -> Event {
        Event {
            event_type,
            fields: Vec::new(),
        }
    }

    /// The term describing this event's type.
    pub fn event_type(&self) -> TermId {
        self.event_type
    }

    /// Appends a value under a term.
    pub fn set(&mut self, term: TermId, value: EventValue) {
        self.fields.push((term, value));
    }

    /// Appends an unsigned integer value.
    pub fn set_uint(&mut self, term: TermId, value: u64) {
        self.set(term, EventValue::UInt(value));
    }

    /// Appends a signed integer value.
    pub fn set_int(&mut self, term: TermId, value: i64) {
        self.set(term, EventValue::Int(value));
    }

    /// Appends a floating point value.
    pub fn set_float(&mut self, term: TermId, value: f64) {
        self.set(term, EventValue::Float(value));
    }

    /// Appends a text value.
    pub fn set_str(&mut self, term: TermId, value: impl Into<String>) {
        self.set(term, EventValue::Str(value.into()));
    }

    /// Appends an opaque byte value.
    pub fn set_blob(&mut self, term: TermId, value: Bytes) {
        self.set(term, EventValue::Blob(value));
    }

    /// Returns the first value stored under `term`.
    pub fn get(&self, term: TermId) -> Option<&EventValue> {
        self.fields
            .iter()
            .find(|(t, _)| *t == term)
            .map(|(_, v)| v)
    }

    /// Returns every value stored under `term`, in insertion order.
    pub fn get_all<'a>(&'a self, term: TermId) -> impl Iterator<Item = &'a EventValue> + 'a {
        self.fields
            .iter()
            .filter(move |(t, _)| *t == term)
            .map(|(_, v)| v)
    }

    /// Returns the first unsigned integer stored under `term`.
    pub fn get_uint(&self, term: TermId) -> Option<u64> {
        match self.get(term) {
            Some(EventValue::UInt(v)) => Some(*v),
            _ => None,
        }
    }

    /// Returns the first text value stored under `term`.
    pub fn get_str(&self, term: TermId) -> Option<&str> {
        match self.get(term) {
            Some(EventValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// Iterates over all fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(TermId, EventValue)> {
        self.fields.iter()
    }

    /// Number of stored fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no fields are stored.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
