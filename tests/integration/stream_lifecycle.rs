#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sparrow::error::{SourceError, SourceErrorKind};
use sparrow::source::{Capabilities, QuadScan};
use sparrow::{
    Binding, MemoryGraph, Pulled, Quad, QuadPattern, QueryContext, QueryEngine, QueryError,
    ResultHandle, SourceAdapter, StreamState, Term,
};

#[derive(Default)]
struct Tally {
    pulled: AtomicUsize,
    released: AtomicBool,
}

/// Wraps a graph, counting rows handed to the engine and noticing when the
/// engine drops the scan.
struct TracedSource {
    graph: MemoryGraph,
    tally: Arc<Tally>,
    delay: Option<Duration>,
    fail_after: Option<usize>,
}

impl TracedSource {
    fn new(graph: MemoryGraph) -> (Self, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        let source = Self {
            graph,
            tally: Arc::clone(&tally),
            delay: None,
            fail_after: None,
        };
        (source, tally)
    }
}

struct TracedScan {
    inner: QuadScan,
    tally: Arc<Tally>,
    delay: Option<Duration>,
    fail_after: Option<usize>,
    yielded: usize,
}

impl Iterator for TracedScan {
    type Item = Result<Binding, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.fail_after == Some(self.yielded) {
            return Some(Err(SourceError::new(
                "traced",
                SourceErrorKind::Io,
                "connection reset",
            )));
        }
        let item = self.inner.next()?;
        self.yielded += 1;
        self.tally.pulled.fetch_add(1, Ordering::SeqCst);
        Some(item)
    }
}

impl Drop for TracedScan {
    fn drop(&mut self) {
        self.tally.released.store(true, Ordering::SeqCst);
    }
}

impl SourceAdapter for TracedSource {
    fn name(&self) -> &str {
        "traced"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full_scan()
    }

    fn count(&self, pattern: &QuadPattern) -> Result<u64, SourceError> {
        self.graph.count(pattern)
    }

    fn scan(&self, pattern: &QuadPattern) -> Result<QuadScan, SourceError> {
        Ok(Box::new(TracedScan {
            inner: self.graph.scan(pattern)?,
            tally: Arc::clone(&self.tally),
            delay: self.delay,
            fail_after: self.fail_after,
            yielded: 0,
        }))
    }
}

fn numbered(count: usize) -> MemoryGraph {
    let graph = MemoryGraph::new();
    graph.extend((0..count).map(|idx| {
        Quad::triple(
            Term::iri(format!("http://ex/item{idx:03}")),
            Term::iri("http://ex/rank"),
            Term::iri("http://ex/Item"),
        )
    }));
    graph
}

fn run(source: TracedSource, query: &str, context: QueryContext) -> ResultHandle {
    QueryEngine::new()
        .query(query, &context.with_source(source))
        .expect("query prepares")
}

#[test]
fn limit_pulls_at_most_k_rows_from_the_source() {
    let (source, tally) = TracedSource::new(numbered(500));
    let mut handle = run(
        source,
        "SELECT ?s WHERE { ?s <http://ex/rank> ?o } LIMIT 3",
        QueryContext::new(),
    );
    assert_eq!(handle.bindings().expect("select").count(), 3);
    assert!(tally.pulled.load(Ordering::SeqCst) <= 3);
    assert_eq!(handle.state(), StreamState::Exhausted);
}

#[test]
fn nothing_is_pulled_before_the_first_row_is_requested() {
    let (source, tally) = TracedSource::new(numbered(10));
    let handle = run(source, "SELECT * WHERE { ?s ?p ?o }", QueryContext::new());
    assert_eq!(handle.state(), StreamState::Idle);
    assert_eq!(tally.pulled.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_after_partial_consumption_releases_the_scan() {
    let (source, tally) = TracedSource::new(numbered(100));
    let mut handle = run(source, "SELECT * WHERE { ?s ?p ?o }", QueryContext::new());
    assert!(matches!(handle.pull(), Pulled::Row(_)));
    assert!(matches!(handle.pull(), Pulled::Row(_)));
    handle.cancel();
    assert!(tally.released.load(Ordering::SeqCst));
    assert_eq!(handle.state(), StreamState::Cancelled);
    assert_eq!(handle.pull(), Pulled::Cancelled);
    assert_eq!(handle.pull(), Pulled::Cancelled);
    assert!(tally.pulled.load(Ordering::SeqCst) < 100);
}

#[test]
fn cancel_from_another_thread_stops_the_next_pull() {
    let (source, _tally) = TracedSource::new(numbered(100));
    let mut handle = run(source, "SELECT * WHERE { ?s ?p ?o }", QueryContext::new());
    assert!(matches!(handle.pull(), Pulled::Row(_)));
    let canceller = handle.cancel_handle();
    thread::spawn(move || canceller.cancel())
        .join()
        .expect("cancel thread");
    assert_eq!(handle.pull(), Pulled::Cancelled);
    assert_eq!(handle.state(), StreamState::Cancelled);
}

#[test]
fn cancelled_select_iterator_simply_ends() {
    let (source, _tally) = TracedSource::new(numbered(20));
    let mut handle = run(source, "SELECT * WHERE { ?s ?p ?o }", QueryContext::new());
    let canceller = handle.cancel_handle();
    let mut rows = handle.bindings().expect("select");
    assert!(rows.next().is_some());
    canceller.cancel();
    assert!(rows.next().is_none());
}

#[test]
fn slow_source_hits_the_timeout() {
    let (mut source, tally) = TracedSource::new(numbered(50));
    source.delay = Some(Duration::from_millis(60));
    let mut handle = run(
        source,
        "SELECT * WHERE { ?s ?p ?o }",
        QueryContext::new().with_timeout(Duration::from_millis(30)),
    );
    let failure = loop {
        match handle.pull() {
            Pulled::Row(_) => continue,
            other => break other,
        }
    };
    let Pulled::Failed(err) = failure else {
        panic!("expected timeout, got {failure:?}");
    };
    assert!(matches!(err, QueryError::Timeout { .. }));
    assert_eq!(handle.state(), StreamState::Failed);
    assert!(tally.released.load(Ordering::SeqCst));
    assert!(tally.pulled.load(Ordering::SeqCst) < 50);
}

#[test]
fn timeout_budget_applies_to_each_pull() {
    let (source, _tally) = TracedSource::new(numbered(5));
    let mut handle = run(
        source,
        "SELECT * WHERE { ?s ?p ?o }",
        QueryContext::new().with_timeout(Duration::from_millis(50)),
    );
    assert!(matches!(handle.pull(), Pulled::Row(_)));
    thread::sleep(Duration::from_millis(120));
    assert!(matches!(handle.pull(), Pulled::Row(_)));
    assert_eq!(handle.state(), StreamState::Running);
}

#[test]
fn blocking_operator_times_out_within_one_pull() {
    let (mut source, tally) = TracedSource::new(numbered(50));
    source.delay = Some(Duration::from_millis(15));
    let mut handle = run(
        source,
        "SELECT * WHERE { ?s ?p ?o } ORDER BY ?s",
        QueryContext::new().with_timeout(Duration::from_millis(40)),
    );
    let Pulled::Failed(err) = handle.pull() else {
        panic!("expected the sort to run out of budget");
    };
    assert!(matches!(err, QueryError::Timeout { .. }));
    assert!(tally.pulled.load(Ordering::SeqCst) < 50);
}

#[test]
fn describe_scans_respect_the_timeout() {
    let (mut source, tally) = TracedSource::new(numbered(5));
    source.delay = Some(Duration::from_millis(60));
    let mut handle = run(
        source,
        "DESCRIBE <http://ex/item000>",
        QueryContext::new().with_timeout(Duration::from_millis(30)),
    );
    let first = handle
        .quads()
        .expect("describe")
        .next()
        .expect("an outcome");
    assert!(matches!(first, Err(QueryError::Timeout { .. })));
    assert_eq!(handle.state(), StreamState::Failed);
    assert!(tally.released.load(Ordering::SeqCst));
}

#[test]
fn source_failure_keeps_rows_already_delivered() {
    let (mut source, _tally) = TracedSource::new(numbered(10));
    source.fail_after = Some(2);
    let mut handle = run(source, "SELECT * WHERE { ?s ?p ?o }", QueryContext::new());
    assert!(matches!(handle.pull(), Pulled::Row(_)));
    assert!(matches!(handle.pull(), Pulled::Row(_)));
    let Pulled::Failed(err) = handle.pull() else {
        panic!("expected source failure");
    };
    assert_eq!(err.code(), "SourceError");
    assert_eq!(handle.state(), StreamState::Failed);
    assert_eq!(handle.pull(), Pulled::Failed(err));
}

#[test]
fn failed_select_iterator_yields_the_error_once() {
    let (mut source, _tally) = TracedSource::new(numbered(10));
    source.fail_after = Some(1);
    let mut handle = run(source, "SELECT * WHERE { ?s ?p ?o }", QueryContext::new());
    let items: Vec<_> = handle.bindings().expect("select").collect();
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(items[1].is_err());
}
