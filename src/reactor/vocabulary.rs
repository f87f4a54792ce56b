//! The term registry mapping string URIs to numeric ids.

use std::collections::HashMap;

use crate::{Error, Result};

/// Numeric identifier assigned to a vocabulary term.
pub type TermId = u32;

/// The data type a term's values are expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermType {
    /// Unsigned integer values.
    UInt,
    /// Signed integer values.
    Int,
    /// Floating point values.
    Float,
    /// Text values.
    String,
    /// Opaque byte values.
    Blob,
    /// A grouping term for event types.
    Object,
}

#[derive(Debug, Clone)]
struct Term {
    uri: String,
    term_type: TermType,
}

/// In-memory vocabulary: URIs are registered once and referred to by
/// id afterwards. Ids are assigned sequentially starting at 1.
#[derive(Debug, Default, Clone)]
pub struct Vocabulary {
    terms: Vec<Term>,
    index: HashMap<String, TermId>,
}

impl Vocabulary {
    /// Creates an empty vocabulary.
    pub fn new() -> Vocabulary {
        Vocabulary::default()
    }

    /// Registers a term, returning its id. Registering an existing
    /// URI returns the id already assigned.
    pub fn add_term(&mut self, uri: &str, term_type: TermType) -> TermId {
        if let Some(id) = self.index.get(uri) {
            return *id;
        }
        self.terms.push(Term {
            uri: uri.to_string(),
            term_type,
        });
        let id = self.terms.len() as TermId;
        self.index.insert(uri.to_string(), id);
        id
    }

    /// Looks up a term id by URI.
    pub fn find_term(&self, uri: &str) -> Option<TermId> {
        self.index.get(uri).copied()
    }

    /// Looks up a term id by URI, failing with a configuration error
    /// when it is not defined.
    pub fn require_term(&self, uri: &str) -> Result<TermId> {
        self.find_term(uri)
            .ok_or_else(|| Error::new_config(format!("vocabulary term is not defined: {uri}")))
    }

    /// The expected type of a term's values.
    pub fn term_type(&self, id: TermId) -> Option<TermType> {
        self.term(id).map(|t| t.term_type)
    }

    /// The URI a term id was registered under.
    pub fn term_uri(&self, id: TermId) -> Option<&str> {
        self.term(id).map(|t| t.uri.as_str())
    }

    /// Number of registered terms.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// True when no terms are registered.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    fn term(&self, id: TermId) -> Option<&Term> {
        if id == 0 {
            return None;
        }
        self.terms.get((id - 1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_round_trip() {
        let mut vocabulary = Vocabulary::new();
        let status = vocabulary.add_term("urn:vocab:clickstream#status", TermType::UInt);
        let method = vocabulary.add_term("urn:vocab:clickstream#method", TermType::String);
        assert_ne!(status, method);
        assert_eq!(
            vocabulary.find_term("urn:vocab:clickstream#status"),
            Some(status)
        );
        assert_eq!(vocabulary.term_type(status), Some(TermType::UInt));
        assert_eq!(
            vocabulary.term_uri(method),
            Some("urn:vocab:clickstream#method")
        );
        assert_eq!(vocabulary.find_term("urn:vocab:unknown"), None);
        assert!(vocabulary.require_term("urn:vocab:unknown").is_err());
    }

    #[test]
    fn duplicate_registration_is_idempotent() {
        let mut vocabulary = Vocabulary::new();
        let a = vocabulary.add_term("urn:a", TermType::String);
        let b = vocabulary.add_term("urn:a", TermType::String);
        assert_eq!(a, b);
        assert_eq!(vocabulary.len(), 1);
    }
}
