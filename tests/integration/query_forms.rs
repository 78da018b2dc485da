#![allow(missing_docs)]

use sparrow::model::Literal;
use sparrow::{
    MemoryGraph, Quad, QueryContext, QueryEngine, QueryKind, ResultHandle, Result, Term, Variable,
};

const PREFIXES: &str = "PREFIX ex: <http://ex/> ";

fn ex(local: &str) -> Term {
    Term::iri(format!("http://ex/{local}"))
}

fn graph() -> MemoryGraph {
    let graph = MemoryGraph::new();
    graph.extend([
        Quad::triple(ex("alice"), ex("knows"), ex("bob")),
        Quad::triple(ex("alice"), ex("knows"), ex("carol")),
        Quad::triple(ex("bob"), ex("knows"), ex("carol")),
        Quad::triple(ex("alice"), ex("name"), Literal::simple("Alice").into()),
        Quad::triple(ex("bob"), ex("name"), Literal::lang("Bob", "en").into()),
    ]);
    graph
}

fn run(query: &str) -> ResultHandle {
    let context = QueryContext::new().with_source(graph());
    QueryEngine::new()
        .query(&format!("{PREFIXES}{query}"), &context)
        .expect("query prepares")
}

fn quads(handle: &mut ResultHandle) -> Vec<Quad> {
    handle
        .quads()
        .expect("graph form")
        .collect::<Result<Vec<_>>>()
        .expect("quads")
}

#[test]
fn select_reports_header_in_projection_order() {
    let handle = run("SELECT ?name ?who WHERE { ?who ex:name ?name }");
    assert_eq!(handle.form(), QueryKind::Select);
    assert_eq!(
        handle.variables(),
        &[Variable::new("name"), Variable::new("who")]
    );
}

#[test]
fn ask_answers_without_draining() {
    let mut yes = run("ASK { ?a ex:knows ?b }");
    assert_eq!(yes.form(), QueryKind::Ask);
    assert!(yes.boolean().expect("ask"));
    assert!(!run("ASK { ex:carol ex:knows ?x }").boolean().expect("ask"));
}

#[test]
fn construct_builds_template_triples() {
    let mut handle = run("CONSTRUCT { ?b ex:knownBy ?a } WHERE { ?a ex:knows ?b }");
    assert_eq!(handle.form(), QueryKind::Construct);
    let mut built = quads(&mut handle);
    built.sort();
    assert_eq!(built.len(), 3);
    assert!(built.contains(&Quad::triple(ex("carol"), ex("knownBy"), ex("bob"))));
}

#[test]
fn construct_drops_duplicate_triples() {
    let mut handle = run("CONSTRUCT { ?a a ex:Knower } WHERE { ?a ex:knows ?b }");
    let built = quads(&mut handle);
    assert_eq!(built.len(), 2);
}

#[test]
fn construct_skips_triples_with_unbound_slots() {
    let mut handle = run(
        "CONSTRUCT { ?p ex:label ?n } WHERE { ?p ex:knows ?x OPTIONAL { ?p ex:name ?n } }",
    );
    let built = quads(&mut handle);
    assert_eq!(built.len(), 2);
    assert!(built.iter().all(|quad| quad.predicate == ex("label")));
}

#[test]
fn describe_collects_outgoing_triples_of_matches() {
    let mut handle = run("DESCRIBE ?who WHERE { ?who ex:name \"Bob\"@en }");
    assert_eq!(handle.form(), QueryKind::Describe);
    let described = quads(&mut handle);
    assert_eq!(described.len(), 2);
    assert!(described.iter().all(|quad| quad.subject == ex("bob")));
}

#[test]
fn accessors_reject_other_forms() {
    let mut select = run("SELECT * WHERE { ?s ?p ?o }");
    assert_eq!(select.boolean().expect_err("not ask").code(), "Invalid");
    assert!(select.quads().is_err());
    let mut ask = run("ASK { ?s ?p ?o }");
    assert!(ask.bindings().is_err());
}

#[test]
fn explain_tree_names_sources_and_redacts_constants() {
    let context = QueryContext::new().with_source(MemoryGraph::with_name("people"));
    let output = QueryEngine::new()
        .explain(
            &format!("{PREFIXES}SELECT ?x WHERE {{ ex:alice ex:knows ?x }} LIMIT 5"),
            &context,
        )
        .expect("explain");
    let full = output.explain.to_string();
    assert!(full.contains("people"));
    assert!(full.contains("http://ex/alice"));
    assert!(!output.explain.redacted().contains("http://ex/alice"));
}

#[test]
fn plan_hash_is_stable_across_runs() {
    let context = QueryContext::new().with_source(graph());
    let engine = QueryEngine::new();
    let query = format!("{PREFIXES}SELECT ?a WHERE {{ ?a ex:knows ?b . ?b ex:name ?n }}");
    let first = engine.explain(&query, &context).expect("explain");
    let second = engine.explain(&query, &context).expect("explain");
    assert_eq!(first.plan_hash, second.plan_hash);
}
