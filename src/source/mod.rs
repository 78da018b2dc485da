//! Source adapters: the capability interface the planner and executor use to
//! reach concrete data backends.

mod file;
mod memory;
mod remote;
mod resolver;

use std::fmt;
use std::sync::Arc;

use crate::error::SourceError;
use crate::model::{Binding, PatternShape, QuadPattern};

pub use file::{FileFormat, FileSource};
pub use memory::MemoryGraph;
pub use remote::{HttpTransport, RemoteOptions, ReqwestTransport, SparqlEndpoint, TransportError};
pub use resolver::{DefaultSourceResolver, SourceDescriptor, SourceResolver};

/// Lazy stream of pattern matches produced by [`SourceAdapter::scan`].
///
/// Each item binds exactly the variables of the scanned pattern.
pub type QuadScan = Box<dyn Iterator<Item = Result<Binding, SourceError>> + Send>;

/// Bound-slot combination an adapter can answer without a full scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessPath {
    /// Slots that must be bound for the path to apply.
    pub required: PatternShape,
}

impl AccessPath {
    /// Lookup by bound subject.
    pub const SUBJECT: AccessPath = AccessPath {
        required: PatternShape {
            subject: true,
            predicate: false,
            object: false,
            graph: false,
        },
    };

    /// Lookup by bound predicate.
    pub const PREDICATE: AccessPath = AccessPath {
        required: PatternShape {
            subject: false,
            predicate: true,
            object: false,
            graph: false,
        },
    };

    /// Lookup by bound object.
    pub const OBJECT: AccessPath = AccessPath {
        required: PatternShape {
            subject: false,
            predicate: false,
            object: true,
            graph: false,
        },
    };

    /// Lookup by bound graph name.
    pub const GRAPH: AccessPath = AccessPath {
        required: PatternShape {
            subject: false,
            predicate: false,
            object: false,
            graph: true,
        },
    };
}

/// What an adapter can answer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Unrestricted scans of any shape.
    pub scan: bool,
    /// Index lookups.
    pub lookups: Vec<AccessPath>,
}

impl Capabilities {
    /// Capabilities of an adapter that answers every shape.
    pub fn full_scan() -> Self {
        Self {
            scan: true,
            lookups: Vec::new(),
        }
    }

    /// Capabilities of an adapter that only answers the given lookups.
    pub fn lookups(paths: impl IntoIterator<Item = AccessPath>) -> Self {
        Self {
            scan: false,
            lookups: paths.into_iter().collect(),
        }
    }

    /// Whether a pattern with this shape can be answered.
    pub fn supports(&self, shape: &PatternShape) -> bool {
        self.scan || self.lookups.iter().any(|path| shape.covers(&path.required))
    }
}

/// A backend the engine can match quad patterns against.
///
/// Adapters are shared between concurrently running queries, so every method
/// takes `&self`.
pub trait SourceAdapter: Send + Sync {
    /// Name used in explain output and error messages.
    fn name(&self) -> &str;

    /// Access paths this adapter offers.
    fn capabilities(&self) -> Capabilities;

    /// Whether a pattern evaluated with `shape` can be answered.
    fn supports(&self, shape: &PatternShape) -> bool {
        self.capabilities().supports(shape)
    }

    /// Estimated number of matches for `pattern`.
    fn count(&self, pattern: &QuadPattern) -> Result<u64, SourceError>;

    /// Starts a lazy scan of `pattern`.
    fn scan(&self, pattern: &QuadPattern) -> Result<QuadScan, SourceError>;

    /// Whether scans finish in bounded time and memory, allowing operators to
    /// materialise them.
    fn is_bounded(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn SourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceAdapter")
            .field("name", &self.name())
            .finish()
    }
}

/// Index of an adapter within a query's [`SourceSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub usize);

/// Adapters resolved for one query.
#[derive(Clone, Debug, Default)]
pub struct SourceSet {
    sources: Vec<Arc<dyn SourceAdapter>>,
}

impl SourceSet {
    /// Creates a set from resolved adapters.
    pub fn new(sources: Vec<Arc<dyn SourceAdapter>>) -> Self {
        Self { sources }
    }

    /// Adapter by id.
    pub fn get(&self, id: SourceId) -> Option<&Arc<dyn SourceAdapter>> {
        self.sources.get(id.0)
    }

    /// Adapters with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (SourceId, &Arc<dyn SourceAdapter>)> {
        self.sources
            .iter()
            .enumerate()
            .map(|(idx, source)| (SourceId(idx), source))
    }

    /// Number of adapters.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl FromIterator<Arc<dyn SourceAdapter>> for SourceSet {
    fn from_iter<T: IntoIterator<Item = Arc<dyn SourceAdapter>>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_capabilities_need_bound_slots() {
        let caps = Capabilities::lookups([AccessPath::SUBJECT]);
        let unbound = PatternShape::default();
        let subject = PatternShape {
            subject: true,
            ..PatternShape::default()
        };
        let subject_object = PatternShape {
            subject: true,
            object: true,
            ..PatternShape::default()
        };
        assert!(!caps.supports(&unbound));
        assert!(caps.supports(&subject));
        assert!(caps.supports(&subject_object));
        assert!(Capabilities::full_scan().supports(&unbound));
    }
}
