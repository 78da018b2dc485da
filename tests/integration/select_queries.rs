#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use sparrow::error::SourceError;
use sparrow::model::Literal;
use sparrow::source::{AccessPath, Capabilities, QuadScan};
use sparrow::{
    Binding, EngineConfig, MemoryGraph, Quad, QuadPattern, QueryContext, QueryEngine, Result,
    SourceAdapter, Term,
};

const PREFIXES: &str = "PREFIX ex: <http://ex/> PREFIX xsd: <http://www.w3.org/2001/XMLSchema#> ";
const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

fn ex(local: &str) -> Term {
    Term::iri(format!("http://ex/{local}"))
}

fn people() -> MemoryGraph {
    let graph = MemoryGraph::new();
    let kind = Term::iri(RDF_TYPE);
    graph.extend([
        Quad::triple(ex("alice"), kind.clone(), ex("Person")),
        Quad::triple(ex("bob"), kind.clone(), ex("Person")),
        Quad::triple(ex("carol"), kind.clone(), ex("Person")),
        Quad::triple(ex("rex"), kind.clone(), ex("Dog")),
        Quad::triple(ex("tom"), kind, ex("Cat")),
        Quad::triple(ex("alice"), ex("age"), Literal::integer(30).into()),
        Quad::triple(ex("carol"), ex("age"), Literal::integer(41).into()),
        Quad::triple(ex("alice"), ex("knows"), ex("bob")),
        Quad::triple(ex("bob"), ex("knows"), ex("carol")),
        Quad::triple(ex("alice"), ex("knows"), ex("carol")),
    ]);
    graph
}

fn select_with(engine: &QueryEngine, graph: MemoryGraph, query: &str) -> Vec<Binding> {
    let context = QueryContext::new().with_source(graph);
    let mut handle = engine
        .query(&format!("{PREFIXES}{query}"), &context)
        .expect("query prepares");
    handle
        .bindings()
        .expect("select query")
        .collect::<Result<Vec<_>>>()
        .expect("rows")
}

fn select(query: &str) -> Vec<Binding> {
    select_with(&QueryEngine::new(), people(), query)
}

fn column(rows: &[Binding], name: &str) -> Vec<Term> {
    rows.iter()
        .filter_map(|row| row.get_str(name).cloned())
        .collect()
}

#[test]
fn persons_are_returned_once_each() {
    let rows = select("SELECT ?s WHERE { ?s a ex:Person }");
    let mut subjects = column(&rows, "s");
    subjects.sort();
    assert_eq!(subjects, vec![ex("alice"), ex("bob"), ex("carol")]);
    assert!(rows.iter().all(|row| row.len() == 1));
}

#[test]
fn optional_age_leaves_missing_values_unbound() {
    let graph = MemoryGraph::new();
    graph.extend([
        Quad::triple(ex("alice"), Term::iri(RDF_TYPE), ex("Person")),
        Quad::triple(ex("bob"), Term::iri(RDF_TYPE), ex("Person")),
        Quad::triple(ex("alice"), ex("age"), Literal::integer(30).into()),
    ]);
    let rows = select_with(
        &QueryEngine::new(),
        graph,
        "SELECT ?s ?a WHERE { ?s a ex:Person OPTIONAL { ?s ex:age ?a } } ORDER BY ?s",
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_str("s"), Some(&ex("alice")));
    assert_eq!(rows[0].get_str("a"), Some(&Literal::integer(30).into()));
    assert_eq!(rows[1].get_str("s"), Some(&ex("bob")));
    assert_eq!(rows[1].get_str("a"), None);
}

#[test]
fn filter_and_order_by_descending_age() {
    let rows = select("SELECT ?s ?a WHERE { ?s ex:age ?a FILTER(?a > 18) } ORDER BY DESC(?a)");
    assert_eq!(column(&rows, "s"), vec![ex("carol"), ex("alice")]);
}

#[test]
fn group_by_counts_acquaintances() {
    let rows = select(
        "SELECT ?s (COUNT(?o) AS ?n) WHERE { ?s ex:knows ?o } GROUP BY ?s ORDER BY DESC(?n)",
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_str("s"), Some(&ex("alice")));
    assert_eq!(rows[0].get_str("n"), Some(&Literal::integer(2).into()));
    assert_eq!(rows[1].get_str("n"), Some(&Literal::integer(1).into()));
}

#[test]
fn count_over_empty_input_is_zero() {
    let rows = select("SELECT (COUNT(*) AS ?n) WHERE { ?s a ex:Unicorn }");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str("n"), Some(&Literal::integer(0).into()));
}

#[test]
fn union_minus_and_distinct_compose() {
    let rows = select(
        "SELECT DISTINCT ?x WHERE { { ?x a ex:Dog } UNION { ?x a ex:Person } MINUS { ?x ex:age ?a } }",
    );
    let mut found = column(&rows, "x");
    found.sort();
    assert_eq!(found, vec![ex("bob"), ex("rex")]);
}

#[test]
fn values_and_bind_extend_rows() {
    let rows = select(
        "SELECT ?s ?next WHERE { VALUES ?s { ex:alice ex:carol } ?s ex:age ?a BIND(?a + 1 AS ?next) } ORDER BY ?next",
    );
    assert_eq!(
        column(&rows, "next"),
        vec![Literal::integer(31).into(), Literal::integer(42).into()]
    );
}

#[test]
fn filter_not_exists_sees_outer_row() {
    let rows = select("SELECT ?s WHERE { ?s a ex:Person FILTER NOT EXISTS { ?s ex:knows ?o } }");
    assert_eq!(column(&rows, "s"), vec![ex("carol")]);
}

#[test]
fn optimized_and_unoptimized_engines_agree() {
    let query = "SELECT ?s ?o ?a WHERE { ?s ex:knows ?o . ?o a ex:Person OPTIONAL { ?o ex:age ?a } FILTER(?s != ex:bob) }";
    let mut optimized = select_with(&QueryEngine::new(), people(), query);
    let mut plain = select_with(
        &QueryEngine::with_config(EngineConfig::unoptimized()),
        people(),
        query,
    );
    optimized.sort();
    plain.sort();
    assert_eq!(optimized.len(), 2);
    assert_eq!(optimized, plain);
}

#[test]
fn low_memory_preset_returns_same_rows() {
    let query = "SELECT ?s ?o WHERE { ?s ex:knows ?o . ?o a ex:Person }";
    let mut low = select_with(
        &QueryEngine::with_config(EngineConfig::low_memory()),
        people(),
        query,
    );
    let mut default = select(query);
    low.sort();
    default.sort();
    assert_eq!(low, default);
}

#[test]
fn limit_and_offset_overrides_replace_query_modifiers() {
    let context = QueryContext::new()
        .with_source(people())
        .with_limit(1)
        .with_offset(1);
    let mut handle = QueryEngine::new()
        .query(
            &format!("{PREFIXES}SELECT ?s WHERE {{ ?s a ex:Person }} ORDER BY ?s LIMIT 10"),
            &context,
        )
        .expect("query");
    let rows = handle
        .bindings()
        .expect("select")
        .collect::<Result<Vec<_>>>()
        .expect("rows");
    assert_eq!(column(&rows, "s"), vec![ex("bob")]);
}

#[test]
fn sources_are_queried_as_one_dataset() {
    let pets = MemoryGraph::with_name("pets");
    pets.insert(Quad::triple(ex("dora"), Term::iri(RDF_TYPE), ex("Person")));
    let context = QueryContext::new().with_source(people()).with_source(pets);
    let mut handle = QueryEngine::new()
        .query(&format!("{PREFIXES}SELECT ?s WHERE {{ ?s a ex:Person }}"), &context)
        .expect("query");
    assert_eq!(handle.bindings().expect("select").count(), 4);
}

struct SubjectIndex {
    graph: MemoryGraph,
}

impl SourceAdapter for SubjectIndex {
    fn name(&self) -> &str {
        "subject-index"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::lookups([AccessPath::SUBJECT])
    }

    fn count(&self, pattern: &QuadPattern) -> std::result::Result<u64, SourceError> {
        self.graph.count(pattern)
    }

    fn scan(&self, pattern: &QuadPattern) -> std::result::Result<QuadScan, SourceError> {
        self.graph.scan(pattern)
    }
}

#[test]
fn lookup_only_source_rejects_unbound_subject_before_execution() {
    let context = QueryContext::new().with_source(SubjectIndex { graph: people() });
    let err = QueryEngine::new()
        .query(&format!("{PREFIXES}SELECT ?s WHERE {{ ?s a ex:Person }}"), &context)
        .expect_err("no source answers an unbound subject");
    assert_eq!(err.code(), "NoCapableSource");
    assert!(err.is_static());
}

#[test]
fn lookup_only_source_answers_bound_subject() {
    let context = QueryContext::new().with_source(SubjectIndex { graph: people() });
    let mut handle = QueryEngine::new()
        .query(&format!("{PREFIXES}SELECT ?o WHERE {{ ex:alice ex:knows ?o }}"), &context)
        .expect("subject lookup");
    assert_eq!(handle.bindings().expect("select").count(), 2);
}

#[test]
fn syntax_and_scope_errors_are_synchronous() {
    let engine = QueryEngine::new();
    let context = QueryContext::new().with_source(people());
    let syntax = engine
        .query("SELECT ?s WHERE { ?s ?p }", &context)
        .expect_err("syntax");
    assert!(syntax.is_static());
    let scope = engine
        .query("SELECT ?s WHERE { ?s ?p ?o FILTER(?missing > 1) }", &context)
        .expect_err("scope");
    assert!(scope.is_static());
    assert_ne!(syntax.code(), scope.code());
}

#[test]
fn engine_is_shared_across_threads() {
    let engine = Arc::new(QueryEngine::new());
    let graph = people();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let graph = graph.clone();
            thread::spawn(move || {
                let context = QueryContext::new().with_source(graph);
                let mut handle = engine
                    .query(&format!("{PREFIXES}SELECT ?s WHERE {{ ?s a ex:Person }}"), &context)
                    .expect("query");
                handle.bindings().expect("select").count()
            })
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().expect("worker"), 3);
    }
}
