//! Query engine facade: wires parser, translator, optimizer, planner and
//! executor together and hands out result handles.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;
use tracing::{debug, info};

use crate::error::{QueryError, Result};
use crate::model::{Binding, Quad, QuadPattern, Term, TermPattern, Variable};
use crate::query::ast::{PatternTerm, TriplePattern, VarOrIri};
use crate::query::executor::{CancelHandle, Executor, Pulled, SolutionStream, StreamState};
use crate::query::optimizer::{Optimizer, OptimizerConfig};
use crate::query::parser::parse;
use crate::query::planner::{PlanExplain, Planner, PlannerConfig, PlannerOutput};
use crate::query::stats::SourceSetEstimator;
use crate::query::translate::{translate, QueryKind, TranslateOptions, Translated};
use crate::source::{
    DefaultSourceResolver, QuadScan, SourceAdapter, SourceDescriptor, SourceResolver, SourceSet,
};

/// Stage wiring and defaults of a [`QueryEngine`].
#[derive(Clone)]
pub struct EngineConfig {
    /// Physical planner settings.
    pub planner: PlannerConfig,
    /// Logical optimizer settings.
    pub optimizer: OptimizerConfig,
    /// Timeout applied when a context sets none.
    pub default_timeout: Option<Duration>,
    /// Resolver for source descriptors.
    pub resolver: Arc<dyn SourceResolver>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            planner: PlannerConfig::default(),
            optimizer: OptimizerConfig::default(),
            default_timeout: None,
            resolver: Arc::new(DefaultSourceResolver),
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("planner", &self.planner)
            .field("optimizer", &self.optimizer)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Keeps hash tables small, preferring streaming nested-loop joins.
    pub fn low_memory() -> Self {
        Self {
            planner: PlannerConfig {
                hash_join_budget: 1_000,
                ..PlannerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Runs translated trees without logical rewrites.
    pub fn unoptimized() -> Self {
        Self {
            optimizer: OptimizerConfig {
                enabled: false,
                ..OptimizerConfig::default()
            },
            ..Self::default()
        }
    }
}

/// A source named in a [`QueryContext`].
#[derive(Clone, Debug)]
pub enum SourceSpec {
    /// Ready-made adapter.
    Adapter(Arc<dyn SourceAdapter>),
    /// Descriptor resolved by the engine's resolver.
    Descriptor(SourceDescriptor),
}

/// Per-query inputs. Read-only once execution starts.
#[derive(Clone, Debug, Default)]
pub struct QueryContext {
    /// Sources queried together, in order.
    pub sources: Vec<SourceSpec>,
    /// Execution budget measured from the first pull.
    pub timeout: Option<Duration>,
    /// Variables bound before evaluation.
    pub initial_bindings: Binding,
    /// Replaces the query's LIMIT.
    pub limit: Option<usize>,
    /// Replaces the query's OFFSET.
    pub offset: Option<usize>,
}

impl QueryContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an adapter.
    pub fn with_source(self, source: impl SourceAdapter + 'static) -> Self {
        self.with_adapter(Arc::new(source))
    }

    /// Adds a shared adapter.
    pub fn with_adapter(mut self, source: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(SourceSpec::Adapter(source));
        self
    }

    /// Adds a source to resolve.
    pub fn with_descriptor(mut self, descriptor: SourceDescriptor) -> Self {
        self.sources.push(SourceSpec::Descriptor(descriptor));
        self
    }

    /// Sets the execution budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets pre-bound variables.
    pub fn with_initial_bindings(mut self, bindings: Binding) -> Self {
        self.initial_bindings = bindings;
        self
    }

    /// Overrides LIMIT.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Overrides OFFSET.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Entry point for running queries.
///
/// The engine holds no per-query state and can be shared across threads.
pub struct QueryEngine {
    config: EngineConfig,
    optimizer: Optimizer,
    planner: Planner,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEngine {
    /// Engine with the default wiring.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine with explicit wiring.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            optimizer: Optimizer::new(config.optimizer.clone()),
            planner: Planner::new(config.planner.clone()),
            config,
        }
    }

    /// Wiring in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parses, plans and prepares `text` for execution.
    ///
    /// Syntax, scope, planning and source resolution errors are returned
    /// here; nothing is pulled from any source until the handle is read.
    pub fn query(&self, text: &str, context: &QueryContext) -> Result<ResultHandle> {
        let prepared = self.prepare(text, context)?;
        let timeout = self.timeout(context);
        let stream = Executor::new(prepared.sources.clone()).execute(&prepared.output.plan, timeout)?;
        info!(
            form = ?prepared.translated.kind,
            plan_hash = %format!("{:016x}", prepared.output.plan_hash),
            "engine.query.ready"
        );
        Ok(ResultHandle {
            form: prepared.translated.kind,
            variables: prepared.translated.variables,
            template: prepared.translated.template,
            describe: prepared.translated.describe,
            explain: prepared.output.explain,
            sources: prepared.sources,
            stream,
        })
    }

    /// Plans `text` without executing it.
    pub fn explain(&self, text: &str, context: &QueryContext) -> Result<PlannerOutput> {
        Ok(self.prepare(text, context)?.output)
    }

    fn timeout(&self, context: &QueryContext) -> Option<Duration> {
        context.timeout.or(self.config.default_timeout)
    }

    fn prepare(&self, text: &str, context: &QueryContext) -> Result<Prepared> {
        let query = parse(text)?;
        let options = TranslateOptions {
            initial_bindings: context.initial_bindings.clone(),
            limit: context.limit,
            offset: context.offset,
        };
        let translated = translate(&query, &options)?;
        let sources = self.resolve(context)?;
        let estimator = SourceSetEstimator::new(&sources);
        let root = self.optimizer.optimize(translated.root.clone(), &estimator);
        let output = self.planner.plan(&root, &sources, &estimator)?;
        debug!(sources = sources.len(), "engine.prepare");
        Ok(Prepared {
            translated,
            sources,
            output,
        })
    }

    fn resolve(&self, context: &QueryContext) -> Result<SourceSet> {
        let budget = self.timeout(context);
        context
            .sources
            .iter()
            .map(|spec| match spec {
                SourceSpec::Adapter(adapter) => Ok(Arc::clone(adapter)),
                SourceSpec::Descriptor(descriptor) => self
                    .config
                    .resolver
                    .resolve(descriptor, budget)
                    .map_err(QueryError::from),
            })
            .collect()
    }
}

struct Prepared {
    translated: Translated,
    sources: SourceSet,
    output: PlannerOutput,
}

/// Handle over the lazily evaluated results of one query.
pub struct ResultHandle {
    form: QueryKind,
    variables: Vec<Variable>,
    template: Vec<TriplePattern>,
    describe: Vec<VarOrIri>,
    explain: PlanExplain,
    sources: SourceSet,
    stream: SolutionStream,
}

impl fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("form", &self.form)
            .field("variables", &self.variables)
            .field("state", &self.stream.state())
            .finish_non_exhaustive()
    }
}

impl ResultHandle {
    /// Query form.
    pub fn form(&self) -> QueryKind {
        self.form
    }

    /// SELECT header in projection order.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Explain tree of the running plan.
    pub fn explain(&self) -> &PlanExplain {
        &self.explain
    }

    /// Current stream state.
    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    /// Pulls the next raw solution, for any query form.
    pub fn pull(&mut self) -> Pulled {
        match self.stream.pull() {
            Pulled::Row(row) => Pulled::Row(row.without_hidden()),
            other => other,
        }
    }

    /// Solutions of a SELECT query.
    pub fn bindings(&mut self) -> Result<Bindings<'_>> {
        self.expect_form(&[QueryKind::Select], "bindings")?;
        Ok(Bindings {
            stream: &mut self.stream,
        })
    }

    /// Answer of an ASK query. Pulls at most one solution.
    pub fn boolean(&mut self) -> Result<bool> {
        self.expect_form(&[QueryKind::Ask], "boolean")?;
        match self.stream.pull() {
            Pulled::Row(_) => Ok(true),
            Pulled::Exhausted => Ok(false),
            Pulled::Cancelled => Err(QueryError::Cancelled),
            Pulled::Failed(err) => Err(err),
        }
    }

    /// Quads produced by a CONSTRUCT or DESCRIBE query, without duplicates.
    pub fn quads(&mut self) -> Result<Quads<'_>> {
        self.expect_form(&[QueryKind::Construct, QueryKind::Describe], "quads")?;
        Ok(Quads {
            handle: self,
            pending: VecDeque::new(),
            seen: FxHashSet::default(),
            described: FxHashSet::default(),
            solutions: 0,
            finished: false,
        })
    }

    /// Cancels evaluation and releases held resources.
    pub fn cancel(&mut self) {
        self.stream.cancel();
    }

    /// Handle that cancels this query from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.stream.cancel_handle()
    }

    fn expect_form(&self, allowed: &[QueryKind], accessor: &str) -> Result<()> {
        if allowed.contains(&self.form) {
            Ok(())
        } else {
            Err(QueryError::Invalid(format!(
                "{accessor}() is not available for {:?} queries",
                self.form
            )))
        }
    }
}

/// Iterator over SELECT solutions.
///
/// Ends after exhaustion or cancellation; a failure is yielded once as an
/// error.
pub struct Bindings<'a> {
    stream: &'a mut SolutionStream,
}

impl Iterator for Bindings<'_> {
    type Item = Result<Binding>;

    fn next(&mut self) -> Option<Self::Item> {
        self.stream
            .next()
            .map(|row| row.map(Binding::without_hidden))
    }
}

/// Iterator over CONSTRUCT or DESCRIBE output.
pub struct Quads<'a> {
    handle: &'a mut ResultHandle,
    pending: VecDeque<Quad>,
    seen: FxHashSet<Quad>,
    described: FxHashSet<Term>,
    solutions: usize,
    finished: bool,
}

impl Quads<'_> {
    fn expand(&mut self, row: &Binding) -> Result<()> {
        match self.handle.form {
            QueryKind::Construct => {
                for triple in &self.handle.template {
                    if let Some(quad) = instantiate(triple, row, self.solutions) {
                        self.pending.push_back(quad);
                    }
                }
            }
            _ => {
                let resources: Vec<Term> = self
                    .handle
                    .describe
                    .iter()
                    .filter_map(|target| match target {
                        VarOrIri::Iri(iri) => Some(Term::Iri(iri.clone())),
                        VarOrIri::Variable(var) => row.get(var).cloned(),
                    })
                    .filter(Term::is_resource)
                    .collect();
                for resource in resources {
                    if self.described.insert(resource.clone()) {
                        self.describe(resource)?;
                    }
                }
            }
        }
        self.solutions += 1;
        Ok(())
    }

    fn describe(&mut self, resource: Term) -> Result<()> {
        let predicate = Variable::new("p");
        let object = Variable::new("o");
        let pattern = QuadPattern::new(
            resource.clone(),
            TermPattern::Variable(predicate.clone()),
            TermPattern::Variable(object.clone()),
        );
        for (_, source) in self.handle.sources.iter() {
            self.handle.stream.check()?;
            let scan: QuadScan = source.scan(&pattern)?;
            for row in scan {
                self.handle.stream.check()?;
                let row = row?;
                if let (Some(p), Some(o)) = (row.get(&predicate), row.get(&object)) {
                    self.pending
                        .push_back(Quad::triple(resource.clone(), p.clone(), o.clone()));
                }
            }
        }
        Ok(())
    }
}

fn instantiate(triple: &TriplePattern, row: &Binding, solution: usize) -> Option<Quad> {
    let slot = |term: &PatternTerm| -> Option<Term> {
        match term {
            PatternTerm::Term(term) => Some(term.clone()),
            PatternTerm::Variable(var) => row.get(var).cloned(),
            PatternTerm::BlankNode(label) => Some(Term::blank(format!("c{solution}_{label}"))),
        }
    };
    let subject = slot(&triple.subject).filter(Term::is_resource)?;
    let predicate = slot(&triple.predicate).filter(|term| matches!(term, Term::Iri(_)))?;
    let object = slot(&triple.object)?;
    Some(Quad::triple(subject, predicate, object))
}

impl Iterator for Quads<'_> {
    type Item = Result<Quad>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while let Some(quad) = self.pending.pop_front() {
                if self.seen.insert(quad.clone()) {
                    return Some(Ok(quad));
                }
            }
            if self.finished {
                return None;
            }
            match self.handle.stream.pull() {
                Pulled::Row(row) => {
                    if let Err(err) = self.expand(&row) {
                        self.finished = true;
                        self.handle.stream.fail(err.clone());
                        if err == QueryError::Cancelled {
                            return None;
                        }
                        return Some(Err(err));
                    }
                }
                Pulled::Exhausted | Pulled::Cancelled => self.finished = true,
                Pulled::Failed(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Literal;
    use crate::source::MemoryGraph;

    const EX: &str = "PREFIX ex: <http://ex/> ";

    fn graph() -> MemoryGraph {
        let graph = MemoryGraph::new();
        let iri = |local: &str| Term::iri(format!("http://ex/{local}"));
        graph.extend([
            Quad::triple(iri("alice"), iri("knows"), iri("bob")),
            Quad::triple(iri("bob"), iri("knows"), iri("carol")),
            Quad::triple(iri("alice"), iri("age"), Literal::integer(30).into()),
        ]);
        graph
    }

    fn run(text: &str) -> ResultHandle {
        let context = QueryContext::new().with_source(graph());
        QueryEngine::new().query(&format!("{EX}{text}"), &context).expect("query")
    }

    #[test]
    fn ask_reports_existence() {
        assert!(run("ASK { ex:alice ex:knows ?x }").boolean().expect("ask"));
        assert!(!run("ASK { ex:carol ex:knows ?x }").boolean().expect("ask"));
    }

    #[test]
    fn wrong_accessor_is_invalid() {
        let mut handle = run("ASK { ?s ?p ?o }");
        let err = handle.bindings().err().expect("invalid");
        assert_eq!(err.code(), "Invalid");
    }

    #[test]
    fn construct_deduplicates_and_mints_blank_nodes() {
        let mut handle = run(
            "CONSTRUCT { ?a ex:linked _:n . _:n ex:to ?b } WHERE { ?a ex:knows ?b }",
        );
        let quads = handle.quads().expect("quads").collect::<Result<Vec<_>>>().expect("ok");
        assert_eq!(quads.len(), 4);
        let blanks: FxHashSet<_> = quads
            .iter()
            .filter_map(|quad| match &quad.subject {
                Term::BlankNode(node) => Some(node.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(blanks.len(), 2);
    }

    #[test]
    fn describe_returns_outgoing_triples() {
        let mut handle = run("DESCRIBE ex:alice");
        let quads = handle.quads().expect("quads").collect::<Result<Vec<_>>>().expect("ok");
        assert_eq!(quads.len(), 2);
        assert!(quads
            .iter()
            .all(|quad| quad.subject == Term::iri("http://ex/alice")));
    }

    #[test]
    fn explain_does_not_execute() {
        let context = QueryContext::new().with_source(graph());
        let output = QueryEngine::new()
            .explain(&format!("{EX}SELECT ?x WHERE {{ ex:alice ex:knows ?x }}"), &context)
            .expect("explain");
        assert!(output.explain.to_string().contains("Scan"));
    }

    #[test]
    fn initial_bindings_restrict_results() {
        let context = QueryContext::new()
            .with_source(graph())
            .with_initial_bindings(Binding::new().with("a", Term::iri("http://ex/bob")));
        let mut handle = QueryEngine::new()
            .query(&format!("{EX}SELECT ?a ?b WHERE {{ ?a ex:knows ?b }}"), &context)
            .expect("query");
        let rows = handle
            .bindings()
            .expect("select")
            .collect::<Result<Vec<_>>>()
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("b"), Some(&Term::iri("http://ex/carol")));
    }

    #[test]
    fn missing_descriptor_source_fails_synchronously() {
        let context = QueryContext::new().with_descriptor(SourceDescriptor::File {
            path: "/no/such/file.nt".into(),
        });
        let err = QueryEngine::new()
            .query("SELECT * WHERE { ?s ?p ?o }", &context)
            .expect_err("unresolvable");
        assert_eq!(err.code(), "SourceError");
    }
}
