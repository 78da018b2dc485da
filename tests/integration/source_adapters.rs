#![allow(missing_docs)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sparrow::source::{FileSource, HttpTransport, RemoteOptions, SparqlEndpoint, TransportError};
use sparrow::{
    Binding, Pulled, QueryContext, QueryEngine, Result, SourceDescriptor, StreamState, Term,
};
use tempfile::TempDir;

const PEOPLE_NT: &str = "\
<http://ex/alice> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://ex/Person> .
<http://ex/bob> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://ex/Person> .
<http://ex/alice> <http://ex/name> \"Alice\" .
<http://ex/bob> <http://ex/name> \"Bob\"@en .
";

fn write_file(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create data file");
    file.write_all(body.as_bytes()).expect("write data file");
    path
}

fn rows(context: &QueryContext, query: &str) -> Vec<Binding> {
    let mut handle = QueryEngine::new().query(query, context).expect("query");
    handle
        .bindings()
        .expect("select")
        .collect::<Result<Vec<_>>>()
        .expect("rows")
}

fn names_query() -> &'static str {
    "SELECT ?s ?n WHERE { ?s a <http://ex/Person> ; <http://ex/name> ?n } ORDER BY ?s"
}

fn assert_names(found: &[Binding]) {
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].get_str("s"), Some(&Term::iri("http://ex/alice")));
    assert_eq!(
        found[1].get_str("n").and_then(Term::as_literal).and_then(|lit| lit.language()),
        Some("en")
    );
}

#[test]
fn streamed_file_source_answers_joins() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_file(&dir, "people.nt", PEOPLE_NT);
    let context = QueryContext::new().with_source(FileSource::open(&path).expect("open"));
    assert_names(&rows(&context, names_query()));
}

#[test]
fn descriptors_resolve_file_and_memory_sources() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_file(&dir, "people.nt", PEOPLE_NT);
    let streamed = QueryContext::new().with_descriptor(SourceDescriptor::File { path: path.clone() });
    let loaded = QueryContext::new().with_descriptor(SourceDescriptor::Memory { path });
    assert_eq!(rows(&streamed, names_query()), rows(&loaded, names_query()));
}

#[test]
fn turtle_is_loaded_into_memory() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_file(
        &dir,
        "people.ttl",
        "@prefix ex: <http://ex/> .\n\
         ex:alice a ex:Person ; ex:name \"Alice\" .\n\
         ex:bob a ex:Person ; ex:name \"Bob\"@en .\n",
    );
    let context = QueryContext::new().with_descriptor(SourceDescriptor::parse(&format!(
        "mem:{}",
        path.display()
    )));
    assert_names(&rows(&context, names_query()));
}

#[test]
fn named_graphs_are_only_visible_through_graph_patterns() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_file(
        &dir,
        "graphs.nq",
        "<http://ex/a> <http://ex/p> <http://ex/b> .\n\
         <http://ex/c> <http://ex/p> <http://ex/d> <http://ex/g1> .\n\
         <http://ex/e> <http://ex/p> <http://ex/f> <http://ex/g1> .\n",
    );
    let context = QueryContext::new().with_source(FileSource::open(&path).expect("open"));
    assert_eq!(rows(&context, "SELECT * WHERE { ?s ?p ?o }").len(), 1);
    let named = rows(&context, "SELECT ?s ?g WHERE { GRAPH ?g { ?s ?p ?o } }");
    assert_eq!(named.len(), 2);
    assert!(named
        .iter()
        .all(|row| row.get_str("g") == Some(&Term::iri("http://ex/g1"))));
}

#[test]
fn malformed_line_fails_the_stream_after_good_rows() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_file(
        &dir,
        "broken.nt",
        "<http://ex/a> <http://ex/p> <http://ex/b> .\n\
         <http://ex/c> <http://ex/p> this is not rdf\n",
    );
    let context = QueryContext::new().with_source(FileSource::open(&path).expect("open"));
    let mut handle = QueryEngine::new()
        .query("SELECT * WHERE { ?s ?p ?o }", &context)
        .expect("query prepares");
    assert!(matches!(handle.pull(), Pulled::Row(_)));
    let Pulled::Failed(err) = handle.pull() else {
        panic!("expected parse failure");
    };
    assert_eq!(err.code(), "SourceError");
    assert_eq!(handle.state(), StreamState::Failed);
}

#[test]
fn unknown_extension_is_rejected_synchronously() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_file(&dir, "people.csv", "a,b,c\n");
    let context = QueryContext::new().with_descriptor(SourceDescriptor::File { path });
    let err = QueryEngine::new()
        .query("SELECT * WHERE { ?s ?p ?o }", &context)
        .expect_err("unsupported file");
    assert_eq!(err.code(), "SourceError");
}

/// Answers the handful of requests a single typed pattern produces.
#[derive(Default)]
struct FakeEndpoint {
    requests: Mutex<Vec<String>>,
    fail_first: Mutex<bool>,
}

impl HttpTransport for FakeEndpoint {
    fn get(
        &self,
        _endpoint: &str,
        query: &str,
        accept: &str,
        _timeout: Option<Duration>,
    ) -> std::result::Result<String, TransportError> {
        assert!(accept.contains("sparql-results+json"));
        self.requests.lock().push(query.to_owned());
        if std::mem::take(&mut *self.fail_first.lock()) {
            return Err(TransportError::transient("503 Service Unavailable"));
        }
        let body = if query.starts_with("SELECT (COUNT(*)") {
            serde_json::json!({ "results": { "bindings": [ { "count": {
                "type": "literal",
                "value": "2",
                "datatype": "http://www.w3.org/2001/XMLSchema#integer"
            } } ] } })
        } else if query.contains("OFFSET 0") {
            serde_json::json!({
                "head": { "vars": ["v0"] },
                "results": { "bindings": [
                    { "v0": { "type": "uri", "value": "http://ex/alice" } },
                    { "v0": { "type": "uri", "value": "http://ex/bob" } }
                ] }
            })
        } else {
            serde_json::json!({ "head": { "vars": ["v0"] }, "results": { "bindings": [] } })
        };
        Ok(body.to_string())
    }
}

fn remote(transport: Arc<FakeEndpoint>) -> SparqlEndpoint {
    let options = RemoteOptions {
        page_size: 100,
        retries: 1,
        retry_backoff: Duration::from_millis(5),
        timeout: Some(Duration::from_secs(1)),
    };
    SparqlEndpoint::with_transport("http://remote.example/sparql", options, transport)
}

#[test]
fn remote_endpoint_pages_pattern_matches() {
    let transport = Arc::new(FakeEndpoint::default());
    let context = QueryContext::new().with_source(remote(Arc::clone(&transport)));
    let found = rows(
        &context,
        "SELECT ?s WHERE { ?s a <http://ex/Person> } ORDER BY ?s",
    );
    assert_eq!(found.len(), 2);
    assert_eq!(found[1].get_str("s"), Some(&Term::iri("http://ex/bob")));
    let requests = transport.requests.lock();
    assert!(requests
        .iter()
        .any(|query| query.contains("LIMIT 100") && query.contains("<http://ex/Person>")));
}

#[test]
fn transient_remote_failure_is_retried() {
    let transport = Arc::new(FakeEndpoint::default());
    *transport.fail_first.lock() = true;
    let context = QueryContext::new().with_source(remote(Arc::clone(&transport)));
    let found = rows(&context, "SELECT ?s WHERE { ?s a <http://ex/Person> }");
    assert_eq!(found.len(), 2);
}
