//! Chained change events.
//!
//! A `ChangeEvent` names the property that changed at one level of an object
//! graph and optionally wraps the event from the level below that caused it.
//! Walking the chain yields the dotted full path (`Parent.Child.Field`) and the
//! innermost, original event.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the cell, registry or object that raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub fn next() -> Self {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable, cheap-to-clone link in a change chain.
#[derive(Clone)]
pub struct ChangeEvent {
    inner: Arc<EventNode>,
}

struct EventNode {
    property_name: String,
    source: SourceId,
    inner_event: Option<ChangeEvent>,
}

impl ChangeEvent {
    pub fn new(property_name: impl Into<String>, source: SourceId) -> Self {
        Self {
            inner: Arc::new(EventNode {
                property_name: property_name.into(),
                source,
                inner_event: None,
            }),
        }
    }

    /// Wrap an already finalized event one level up.
    pub fn wrap(property_name: impl Into<String>, source: SourceId, inner: ChangeEvent) -> Self {
        Self {
            inner: Arc::new(EventNode {
                property_name: property_name.into(),
                source,
                inner_event: Some(inner),
            }),
        }
    }

    pub fn property_name(&self) -> &str {
        &self.inner.property_name
    }

    pub fn source(&self) -> SourceId {
        self.inner.source
    }

    pub fn inner_event(&self) -> Option<&ChangeEvent> {
        self.inner.inner_event.as_ref()
    }

    /// The innermost event of the chain; `self` when nothing is wrapped.
    pub fn original_event(&self) -> &ChangeEvent {
        let mut current = self;
        while let Some(next) = current.inner_event() {
            current = next;
        }
        current
    }

    pub fn segments(&self) -> Segments<'_> {
        Segments {
            next: Some(self),
        }
    }

    pub fn full_path(&self) -> String {
        let mut path = String::with_capacity(self.inner.property_name.len() * 2);
        for (i, segment) in self.segments().enumerate() {
            if i > 0 {
                path.push('.');
            }
            path.push_str(segment);
        }
        path
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Reference equality of two chain nodes.
    pub fn ptr_eq(&self, other: &ChangeEvent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("full_path", &self.full_path())
            .field("source", &self.inner.source)
            .finish()
    }
}

/// Property names from the outermost level inwards.
pub struct Segments<'a> {
    next: Option<&'a ChangeEvent>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.inner_event();
        Some(current.property_name())
    }
}
