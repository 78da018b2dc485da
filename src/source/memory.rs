//! Dictionary-encoded in-memory quad store.

use std::collections::{BTreeSet, VecDeque};
use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{SourceError, SourceErrorKind};
use crate::model::{Binding, GraphName, GraphPattern, Quad, QuadPattern, Term, TermPattern};
use crate::source::file::{read_quads, FileFormat};
use crate::source::{Capabilities, QuadScan, SourceAdapter};

/// Id reserved for the default graph in the graph slot.
const DEFAULT_GRAPH: u32 = 0;

/// Keys handed out per read-lock acquisition during a scan.
const SCAN_BATCH: usize = 256;

type Key = [u32; 4];

/// Slot positions (subject, predicate, object, graph) in key order.
const INDEX_ORDERS: [[usize; 4]; 4] = [
    [0, 1, 2, 3], // SPOG
    [1, 2, 0, 3], // POSG
    [2, 0, 1, 3], // OSPG
    [3, 0, 1, 2], // GSPO
];

#[derive(Default)]
struct Inner {
    terms: Vec<Term>,
    ids: FxHashMap<Term, u32>,
    indexes: [BTreeSet<Key>; 4],
}

impl Inner {
    fn intern(&mut self, term: Term) -> u32 {
        if let Some(id) = self.ids.get(&term) {
            return *id;
        }
        self.terms.push(term.clone());
        let id = self.terms.len() as u32;
        self.ids.insert(term, id);
        id
    }

    fn term(&self, id: u32) -> Option<&Term> {
        id.checked_sub(1).and_then(|idx| self.terms.get(idx as usize))
    }

    fn insert(&mut self, quad: Quad) -> bool {
        let graph = match quad.graph {
            GraphName::DefaultGraph => DEFAULT_GRAPH,
            GraphName::Named(iri) => self.intern(Term::Iri(iri)),
        };
        let slots = [
            self.intern(quad.subject),
            self.intern(quad.predicate),
            self.intern(quad.object),
            graph,
        ];
        let mut added = false;
        for (index, order) in self.indexes.iter_mut().zip(INDEX_ORDERS) {
            added |= index.insert(to_key(&slots, &order));
        }
        added
    }

    fn decode(&self, key: &Key, order: &[usize; 4]) -> Option<Quad> {
        let mut slots = [0u32; 4];
        for (pos, slot) in order.iter().enumerate() {
            slots[*slot] = key[pos];
        }
        let graph = match slots[3] {
            DEFAULT_GRAPH => GraphName::DefaultGraph,
            id => match self.term(id)? {
                Term::Iri(iri) => GraphName::Named(iri.clone()),
                _ => return None,
            },
        };
        Some(Quad {
            subject: self.term(slots[0])?.clone(),
            predicate: self.term(slots[1])?.clone(),
            object: self.term(slots[2])?.clone(),
            graph,
        })
    }

    /// Encodes the constant slots of `pattern`. `None` when a constant was
    /// never stored, so nothing can match.
    fn bound_slots(&self, pattern: &QuadPattern) -> Option<[Option<u32>; 4]> {
        let slot = |slot: &TermPattern| match slot {
            TermPattern::Term(term) => self.ids.get(term).copied().map(Some),
            TermPattern::Variable(_) => Some(None),
        };
        let graph = match &pattern.graph {
            GraphPattern::DefaultGraph => Some(DEFAULT_GRAPH),
            GraphPattern::Named(iri) => Some(*self.ids.get(&Term::Iri(iri.clone()))?),
            GraphPattern::Variable(_) => None,
        };
        Some([
            slot(&pattern.subject)?,
            slot(&pattern.predicate)?,
            slot(&pattern.object)?,
            graph,
        ])
    }
}

fn to_key(slots: &[u32; 4], order: &[usize; 4]) -> Key {
    [
        slots[order[0]],
        slots[order[1]],
        slots[order[2]],
        slots[order[3]],
    ]
}

/// Index whose key order has the longest bound prefix, with its key range.
fn choose_index(bound: &[Option<u32>; 4]) -> (usize, Key, Key) {
    let prefix_len = |order: &[usize; 4]| {
        order
            .iter()
            .take_while(|slot| bound[**slot].is_some())
            .count()
    };
    let mut best = 0;
    for (idx, order) in INDEX_ORDERS.iter().enumerate() {
        if prefix_len(order) > prefix_len(&INDEX_ORDERS[best]) {
            best = idx;
        }
    }
    let order = &INDEX_ORDERS[best];
    let len = prefix_len(order);
    let mut lower = [0u32; 4];
    let mut upper = [u32::MAX; 4];
    for pos in 0..len {
        if let Some(id) = bound[order[pos]] {
            lower[pos] = id;
            upper[pos] = id;
        }
    }
    (best, lower, upper)
}

fn key_matches(key: &Key, order: &[usize; 4], bound: &[Option<u32>; 4]) -> bool {
    order
        .iter()
        .enumerate()
        .all(|(pos, slot)| bound[*slot].map_or(true, |id| key[pos] == id))
}

/// In-memory quad store with four sorted indexes (SPOG, POSG, OSPG, GSPO).
///
/// Clones share the same data. Readers run concurrently; scans take the read
/// lock once per batch, never across pulls, so a long scan does not block
/// writers.
#[derive(Clone)]
pub struct MemoryGraph {
    name: Arc<str>,
    inner: Arc<RwLock<Inner>>,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGraph")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

impl MemoryGraph {
    /// Creates an empty graph named `memory`.
    pub fn new() -> Self {
        Self::with_name("memory")
    }

    /// Creates an empty graph with the given adapter name.
    pub fn with_name(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Loads an RDF file, guessing its format from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let format = FileFormat::from_path(path).ok_or_else(|| {
            SourceError::new(
                &name,
                SourceErrorKind::Resolution,
                "unknown file extension; expected .nt, .nq or .ttl",
            )
        })?;
        let file = File::open(path).map_err(|err| SourceError::io(&name, &err))?;
        let graph = Self::with_name(name);
        graph.load(format, BufReader::new(file))?;
        Ok(graph)
    }

    /// Inserts one quad. Returns whether it was new.
    pub fn insert(&self, quad: Quad) -> bool {
        self.inner.write().insert(quad)
    }

    /// Inserts quads under a single write lock. Returns how many were new.
    pub fn extend(&self, quads: impl IntoIterator<Item = Quad>) -> usize {
        let mut inner = self.inner.write();
        quads
            .into_iter()
            .map(|quad| inner.insert(quad))
            .filter(|added| *added)
            .count()
    }

    /// Parses `reader` and inserts its quads.
    ///
    /// Parsing finishes before anything is inserted, so a malformed document
    /// leaves the graph unchanged.
    pub fn load<R: Read>(&self, format: FileFormat, reader: R) -> Result<usize, SourceError> {
        let quads = read_quads(&self.name, format, reader).collect::<Result<Vec<_>, _>>()?;
        let parsed = quads.len();
        let added = self.extend(quads);
        debug!(source = %self.name, parsed, added, "source.memory.loaded");
        Ok(added)
    }

    /// Number of stored quads.
    pub fn len(&self) -> usize {
        self.inner.read().indexes[0].len()
    }

    /// Whether the graph holds no quads.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SourceAdapter for MemoryGraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full_scan()
    }

    fn count(&self, pattern: &QuadPattern) -> Result<u64, SourceError> {
        let inner = self.inner.read();
        let Some(bound) = inner.bound_slots(pattern) else {
            return Ok(0);
        };
        let (index, lower, upper) = choose_index(&bound);
        let order = &INDEX_ORDERS[index];
        let count = inner.indexes[index]
            .range(lower..=upper)
            .filter(|key| key_matches(key, order, &bound))
            .count();
        Ok(count as u64)
    }

    fn scan(&self, pattern: &QuadPattern) -> Result<QuadScan, SourceError> {
        let bound = self.inner.read().bound_slots(pattern);
        let Some(bound) = bound else {
            return Ok(Box::new(std::iter::empty()));
        };
        let (index, lower, upper) = choose_index(&bound);
        Ok(Box::new(MemoryScan {
            inner: Arc::clone(&self.inner),
            pattern: pattern.clone(),
            bound,
            index,
            next: Bound::Included(lower),
            upper,
            buffer: VecDeque::new(),
            done: false,
        }))
    }
}

/// Cursor over one index range.
struct MemoryScan {
    inner: Arc<RwLock<Inner>>,
    pattern: QuadPattern,
    bound: [Option<u32>; 4],
    index: usize,
    next: Bound<Key>,
    upper: Key,
    buffer: VecDeque<Binding>,
    done: bool,
}

impl MemoryScan {
    fn fill(&mut self) {
        let inner = self.inner.read();
        let order = &INDEX_ORDERS[self.index];
        let mut taken = 0;
        let mut last = None;
        for key in inner.indexes[self.index].range((self.next, Bound::Included(self.upper))) {
            taken += 1;
            last = Some(*key);
            if !key_matches(key, order, &self.bound) {
                if taken == SCAN_BATCH {
                    break;
                }
                continue;
            }
            if let Some(row) = inner.decode(key, order).and_then(|quad| self.pattern.matches(&quad)) {
                self.buffer.push_back(row);
            }
            if taken == SCAN_BATCH {
                break;
            }
        }
        match last {
            Some(key) if taken == SCAN_BATCH => self.next = Bound::Excluded(key),
            _ => self.done = true,
        }
    }
}

impl Iterator for MemoryScan {
    type Item = Result<Binding, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() && !self.done {
            self.fill();
        }
        self.buffer.pop_front().map(Ok)
    }
}
