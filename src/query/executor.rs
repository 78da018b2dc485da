//! Pull-based executor for physical plans.
//!
//! Every operator is a [`BindingStream`]; a pull on the root pulls through the
//! tree on demand. Operators check the shared [`ExecControl`] before pulling
//! from a child, so cancellation and the deadline take effect within one pull
//! boundary.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::model::{Binding, QuadPattern, Term, Variable};
use crate::query::errors::PlanningError;
use crate::query::expr::{order_terms, Accumulator, Aggregate, ExistsProbe, ExprEvaluator};
use crate::query::physical::{PhysicalExpr, PhysicalNode, PhysicalOp, PhysicalPlan, SortKey};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::source::{QuadScan, SourceAdapter, SourceId, SourceSet};

/// Cancellation flag and per-pull deadline shared by every operator of one
/// stream.
///
/// The timeout bounds a single pull: the deadline is re-armed each time the
/// consumer asks for the next row, so time spent by the consumer between
/// pulls never counts against the budget.
#[derive(Debug)]
pub struct ExecControl {
    cancelled: AtomicBool,
    timeout: Option<Duration>,
    deadline: Mutex<Option<Instant>>,
}

impl ExecControl {
    /// Creates a control block. No deadline is armed until the first pull.
    pub fn new(timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            timeout,
            deadline: Mutex::new(None),
        })
    }

    /// Starts the budget for one pull.
    pub(crate) fn arm(&self) {
        if let Some(timeout) = self.timeout {
            *self.deadline.lock() = Some(Instant::now() + timeout);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    /// Fails with `Cancelled` or `Timeout` when execution must stop.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let deadline = *self.deadline.lock();
        if let (Some(deadline), Some(budget)) = (deadline, self.timeout) {
            if Instant::now() >= deadline {
                return Err(QueryError::Timeout { budget });
            }
        }
        Ok(())
    }
}

/// Cloneable handle that cancels a running stream from any thread.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    control: Arc<ExecControl>,
}

impl CancelHandle {
    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

/// Lifecycle of a result stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// No row pulled yet.
    Idle,
    /// At least one pull happened and more rows may follow.
    Running,
    /// Every row was delivered.
    Exhausted,
    /// Stopped by a cancel request.
    Cancelled,
    /// Stopped by an error.
    Failed,
}

impl StreamState {
    /// Whether no further rows can be produced.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Exhausted | StreamState::Cancelled | StreamState::Failed
        )
    }
}

/// Outcome of one [`SolutionStream::pull`].
#[derive(Clone, Debug, PartialEq)]
pub enum Pulled {
    /// Next solution.
    Row(Binding),
    /// No more solutions.
    Exhausted,
    /// The stream was cancelled.
    Cancelled,
    /// The stream failed; repeated on every later pull.
    Failed(QueryError),
}

/// Lazy, non-restartable stream of solutions.
pub struct SolutionStream {
    root: Option<BoxBindingStream>,
    control: Arc<ExecControl>,
    state: StreamState,
    error: Option<QueryError>,
    reported: bool,
}

impl SolutionStream {
    fn new(root: BoxBindingStream, control: Arc<ExecControl>) -> Self {
        Self {
            root: Some(root),
            control,
            state: StreamState::Idle,
            error: None,
            reported: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Terminal error of a failed stream.
    pub fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    /// Handle that cancels this stream from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Cancels the stream and releases its operators. No-op once terminal.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.control.cancel();
        self.transition(StreamState::Cancelled);
    }

    /// Pulls the next solution.
    pub fn pull(&mut self) -> Pulled {
        match self.state {
            StreamState::Exhausted => return Pulled::Exhausted,
            StreamState::Cancelled => return Pulled::Cancelled,
            StreamState::Failed => {
                return Pulled::Failed(self.error.clone().unwrap_or(QueryError::Cancelled))
            }
            StreamState::Idle | StreamState::Running => {}
        }
        if self.control.is_cancelled() {
            self.transition(StreamState::Cancelled);
            return Pulled::Cancelled;
        }
        self.control.arm();
        if self.state == StreamState::Idle {
            self.transition(StreamState::Running);
        }
        let Some(root) = self.root.as_mut() else {
            self.transition(StreamState::Exhausted);
            return Pulled::Exhausted;
        };
        match root.try_next() {
            Ok(Some(row)) => Pulled::Row(row),
            Ok(None) => {
                self.transition(StreamState::Exhausted);
                Pulled::Exhausted
            }
            Err(QueryError::Cancelled) => {
                self.transition(StreamState::Cancelled);
                Pulled::Cancelled
            }
            Err(err) => {
                self.error = Some(err.clone());
                self.transition(StreamState::Failed);
                Pulled::Failed(err)
            }
        }
    }

    /// Checks cancellation and the current pull's budget for work done on
    /// behalf of this stream outside the operator tree.
    pub(crate) fn check(&self) -> Result<()> {
        self.control.check()
    }

    /// Ends the stream with an error raised outside the operator tree.
    pub(crate) fn fail(&mut self, err: QueryError) {
        if self.state.is_terminal() {
            return;
        }
        if err == QueryError::Cancelled {
            self.transition(StreamState::Cancelled);
            return;
        }
        self.error = Some(err);
        self.reported = true;
        self.transition(StreamState::Failed);
    }

    fn transition(&mut self, next: StreamState) {
        if self.state == next {
            return;
        }
        debug!(from = ?self.state, to = ?next, "executor.stream.state");
        self.state = next;
        if next.is_terminal() {
            self.root = None;
        }
    }
}

impl Iterator for SolutionStream {
    type Item = Result<Binding>;

    /// Yields rows, then the terminal error once if the stream failed.
    fn next(&mut self) -> Option<Self::Item> {
        match self.pull() {
            Pulled::Row(row) => Some(Ok(row)),
            Pulled::Exhausted | Pulled::Cancelled => None,
            Pulled::Failed(err) => {
                if self.reported {
                    None
                } else {
                    self.reported = true;
                    Some(Err(err))
                }
            }
        }
    }
}

/// Query executor responsible for running physical query plans.
#[derive(Clone)]
pub struct Executor {
    sources: SourceSet,
}

impl Executor {
    /// Creates an executor over the query's resolved sources.
    pub fn new(sources: SourceSet) -> Self {
        Self { sources }
    }

    /// Builds the operator tree for `plan`. Nothing is pulled until the
    /// returned stream is.
    pub fn execute(&self, plan: &PhysicalPlan, timeout: Option<Duration>) -> Result<SolutionStream> {
        let control = ExecControl::new(timeout);
        let env = Env {
            sources: self.sources.clone(),
            control: Arc::clone(&control),
        };
        let root = build(&plan.root, &Binding::new(), &env)?;
        Ok(SolutionStream::new(root, control))
    }
}

pub(crate) trait BindingStream: Send {
    fn try_next(&mut self) -> Result<Option<Binding>>;
}

type BoxBindingStream = Box<dyn BindingStream>;

#[derive(Clone)]
struct Env {
    sources: SourceSet,
    control: Arc<ExecControl>,
}

impl Env {
    fn check(&self) -> Result<()> {
        self.control.check()
    }
}

/// Answers `EXISTS` by building the planned body seeded with the row.
struct PlanProbe<'a> {
    env: &'a Env,
}

impl ExistsProbe<PhysicalNode> for PlanProbe<'_> {
    fn exists(&mut self, pattern: &PhysicalNode, row: &Binding) -> Result<bool> {
        let mut stream = build(pattern, row, self.env)?;
        Ok(stream.try_next()?.is_some())
    }
}

fn malformed(op: &str, inputs: usize) -> QueryError {
    PlanningError::Malformed(format!("{op} cannot run with {inputs} inputs")).into()
}

fn unary(node: &PhysicalNode, seed: &Binding, env: &Env) -> Result<BoxBindingStream> {
    match node.inputs.as_slice() {
        [input] => build(input, seed, env),
        other => Err(malformed(node.op.name(), other.len())),
    }
}

fn binary<'a>(
    node: &'a PhysicalNode,
    seed: &Binding,
    env: &Env,
) -> Result<(BoxBindingStream, &'a PhysicalNode)> {
    match node.inputs.as_slice() {
        [left, right] => Ok((build(left, seed, env)?, right)),
        other => Err(malformed(node.op.name(), other.len())),
    }
}

/// Builds the stream for `node`. Scans substitute `seed` into their patterns
/// and include it in every row they produce.
fn build(node: &PhysicalNode, seed: &Binding, env: &Env) -> Result<BoxBindingStream> {
    Ok(match &node.op {
        PhysicalOp::Scan {
            pattern, sources, ..
        } => Box::new(ScanStream::new(pattern, sources, seed, env)),
        PhysicalOp::Values { rows, .. } => Box::new(ValuesStream {
            rows: rows.clone().into_iter(),
            seed: seed.clone(),
        }),
        PhysicalOp::Unit => Box::new(ValuesStream {
            rows: vec![Binding::new()].into_iter(),
            seed: seed.clone(),
        }),
        PhysicalOp::HashJoin { keys, build_left } => {
            let (left, right) = binary(node, seed, env)?;
            let right = build(right, seed, env)?;
            let (build_side, probe) = if *build_left {
                (left, right)
            } else {
                (right, left)
            };
            Box::new(HashJoinStream::new(build_side, probe, keys.clone(), None, false, env))
        }
        PhysicalOp::NestedLoopJoin => {
            let (outer, inner) = binary(node, seed, env)?;
            Box::new(NestedLoopStream::new(outer, inner.clone(), None, false, env))
        }
        PhysicalOp::HashLeftJoin { keys, expr } => {
            let (left, right) = binary(node, seed, env)?;
            let right = build(right, seed, env)?;
            Box::new(HashJoinStream::new(right, left, keys.clone(), expr.clone(), true, env))
        }
        PhysicalOp::NestedLoopLeftJoin { expr } => {
            let (outer, inner) = binary(node, seed, env)?;
            Box::new(NestedLoopStream::new(outer, inner.clone(), expr.clone(), true, env))
        }
        PhysicalOp::Union => {
            let inputs = node
                .inputs
                .iter()
                .map(|input| build(input, seed, env))
                .collect::<Result<Vec<_>>>()?;
            Box::new(UnionStream {
                inputs,
                current: 0,
                env: env.clone(),
            })
        }
        PhysicalOp::Minus => {
            let (left, right) = binary(node, seed, env)?;
            let right = build(right, seed, env)?;
            Box::new(MinusStream {
                left,
                right: Some(right),
                rows: Vec::new(),
                env: env.clone(),
            })
        }
        PhysicalOp::Filter { expr } => Box::new(FilterStream {
            input: unary(node, seed, env)?,
            expr: expr.clone(),
            evaluator: ExprEvaluator::new(),
            env: env.clone(),
        }),
        PhysicalOp::Extend { var, expr } => Box::new(ExtendStream {
            input: unary(node, seed, env)?,
            var: var.clone(),
            expr: expr.clone(),
            evaluator: ExprEvaluator::new(),
            env: env.clone(),
        }),
        PhysicalOp::HashAggregate { keys, aggregates } => Box::new(AggregateStream {
            input: Some(unary(node, seed, env)?),
            keys: keys.clone(),
            aggregates: aggregates.clone(),
            output: Vec::new().into_iter(),
            evaluator: ExprEvaluator::new(),
            env: env.clone(),
        }),
        PhysicalOp::Project { variables } => Box::new(ProjectStream {
            input: unary(node, seed, env)?,
            variables: variables.clone(),
            env: env.clone(),
        }),
        PhysicalOp::Distinct => Box::new(DistinctStream {
            input: unary(node, seed, env)?,
            seen: FxHashSet::default(),
            env: env.clone(),
        }),
        PhysicalOp::Reduced => Box::new(ReducedStream {
            input: unary(node, seed, env)?,
            last: None,
            env: env.clone(),
        }),
        PhysicalOp::Sort { keys } => {
            let input = unary(node, seed, env)?;
            Box::new(SortStream::new(input, keys.clone(), None, env))
        }
        PhysicalOp::TopK { keys, limit } => {
            let input = unary(node, seed, env)?;
            Box::new(SortStream::new(input, keys.clone(), Some(*limit), env))
        }
        PhysicalOp::Slice { offset, limit } => Box::new(SliceStream {
            input: unary(node, seed, env)?,
            offset: *offset,
            limit: *limit,
            produced: 0,
            env: env.clone(),
        }),
    })
}

fn collect_rows(stream: &mut dyn BindingStream) -> Result<Vec<Binding>> {
    let mut rows = Vec::new();
    while let Some(row) = stream.try_next()? {
        rows.push(row);
    }
    Ok(rows)
}

struct ScanStream {
    pattern: Option<QuadPattern>,
    sources: Vec<Arc<dyn SourceAdapter>>,
    next_source: usize,
    current: Option<QuadScan>,
    seed: Binding,
    env: Env,
}

impl ScanStream {
    fn new(pattern: &QuadPattern, ids: &[SourceId], seed: &Binding, env: &Env) -> Self {
        let sources = ids
            .iter()
            .filter_map(|id| env.sources.get(*id).cloned())
            .collect();
        Self {
            // A graph variable seeded with a non-IRI matches nothing.
            pattern: pattern.substitute(seed),
            sources,
            next_source: 0,
            current: None,
            seed: seed.clone(),
            env: env.clone(),
        }
    }

    fn try_next_inner(&mut self) -> Result<Option<Binding>> {
        let Some(pattern) = &self.pattern else {
            return Ok(None);
        };
        loop {
            self.env.check()?;
            if let Some(scan) = self.current.as_mut() {
                match scan.next() {
                    Some(Ok(row)) => {
                        // A row that arrives after the budget does not count.
                        self.env.check()?;
                        if let Some(merged) = row.merge(&self.seed) {
                            return Ok(Some(merged));
                        }
                        continue;
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        self.current = None;
                        continue;
                    }
                }
            }
            let Some(source) = self.sources.get(self.next_source) else {
                return Ok(None);
            };
            self.next_source += 1;
            self.current = Some(source.scan(pattern)?);
        }
    }
}

impl BindingStream for ScanStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        let timer = profile_timer();
        let result = self.try_next_inner();
        record_profile_timer(QueryProfileKind::Scan, timer);
        result
    }
}

struct ValuesStream {
    rows: std::vec::IntoIter<Binding>,
    seed: Binding,
}

impl BindingStream for ValuesStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        for row in self.rows.by_ref() {
            if let Some(merged) = row.merge(&self.seed) {
                return Ok(Some(merged));
            }
        }
        Ok(None)
    }
}

fn key_of(row: &Binding, keys: &[Variable]) -> Option<Vec<Term>> {
    keys.iter().map(|key| row.get(key).cloned()).collect()
}

/// Hash join; with `optional` set, a left outer join whose build side is the
/// optional input and whose probe side is the required one.
struct HashJoinStream {
    build_input: Option<BoxBindingStream>,
    table: FxHashMap<Vec<Term>, Vec<Binding>>,
    /// Build rows missing a key variable; checked against every probe row.
    loose: Vec<Binding>,
    all: Vec<Binding>,
    probe: BoxBindingStream,
    keys: Vec<Variable>,
    expr: Option<PhysicalExpr>,
    optional: bool,
    pending: std::vec::IntoIter<Binding>,
    evaluator: ExprEvaluator,
    env: Env,
}

impl HashJoinStream {
    fn new(
        build_input: BoxBindingStream,
        probe: BoxBindingStream,
        keys: Vec<Variable>,
        expr: Option<PhysicalExpr>,
        optional: bool,
        env: &Env,
    ) -> Self {
        Self {
            build_input: Some(build_input),
            table: FxHashMap::default(),
            loose: Vec::new(),
            all: Vec::new(),
            probe,
            keys,
            expr,
            optional,
            pending: Vec::new().into_iter(),
            evaluator: ExprEvaluator::new(),
            env: env.clone(),
        }
    }

    fn materialize(&mut self) -> Result<()> {
        let Some(mut input) = self.build_input.take() else {
            return Ok(());
        };
        while let Some(row) = input.try_next()? {
            self.env.check()?;
            match key_of(&row, &self.keys) {
                Some(key) => self.table.entry(key).or_default().push(row.clone()),
                None => self.loose.push(row.clone()),
            }
            self.all.push(row);
        }
        Ok(())
    }

    fn try_next_inner(&mut self) -> Result<Option<Binding>> {
        self.materialize()?;
        loop {
            if let Some(row) = self.pending.next() {
                return Ok(Some(row));
            }
            self.env.check()?;
            let Some(probe_row) = self.probe.try_next()? else {
                return Ok(None);
            };
            let candidates: Vec<&Binding> = match key_of(&probe_row, &self.keys) {
                Some(key) => self
                    .table
                    .get(&key)
                    .into_iter()
                    .flatten()
                    .chain(self.loose.iter())
                    .collect(),
                None => self.all.iter().collect(),
            };
            let mut out = Vec::new();
            for candidate in candidates {
                let Some(merged) = probe_row.merge(candidate) else {
                    continue;
                };
                let keep = match &self.expr {
                    Some(expr) => {
                        let mut probe = PlanProbe { env: &self.env };
                        self.evaluator.test(expr, &merged, &mut probe)?
                    }
                    None => true,
                };
                if keep {
                    out.push(merged);
                }
            }
            if out.is_empty() && self.optional {
                out.push(probe_row);
            }
            self.pending = out.into_iter();
        }
    }
}

impl BindingStream for HashJoinStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        let timer = profile_timer();
        let result = self.try_next_inner();
        record_profile_timer(QueryProfileKind::Join, timer);
        result
    }
}

/// Nested-loop join; the inner plan is rebuilt per outer row with that row as
/// its seed. With `optional` set, unmatched outer rows are emitted alone.
struct NestedLoopStream {
    outer: BoxBindingStream,
    inner_plan: PhysicalNode,
    inner: Option<BoxBindingStream>,
    outer_row: Option<Binding>,
    matched: bool,
    expr: Option<PhysicalExpr>,
    optional: bool,
    evaluator: ExprEvaluator,
    env: Env,
}

impl NestedLoopStream {
    fn new(
        outer: BoxBindingStream,
        inner_plan: PhysicalNode,
        expr: Option<PhysicalExpr>,
        optional: bool,
        env: &Env,
    ) -> Self {
        Self {
            outer,
            inner_plan,
            inner: None,
            outer_row: None,
            matched: false,
            expr,
            optional,
            evaluator: ExprEvaluator::new(),
            env: env.clone(),
        }
    }

    fn try_next_inner(&mut self) -> Result<Option<Binding>> {
        loop {
            self.env.check()?;
            if let (Some(inner), Some(outer_row)) = (self.inner.as_mut(), self.outer_row.as_ref()) {
                match inner.try_next()? {
                    Some(row) => {
                        let Some(merged) = outer_row.merge(&row) else {
                            continue;
                        };
                        if let Some(expr) = &self.expr {
                            let mut probe = PlanProbe { env: &self.env };
                            if !self.evaluator.test(expr, &merged, &mut probe)? {
                                continue;
                            }
                        }
                        self.matched = true;
                        return Ok(Some(merged));
                    }
                    None => {
                        self.inner = None;
                        let finished = self.outer_row.take();
                        if self.optional && !self.matched {
                            return Ok(finished);
                        }
                        continue;
                    }
                }
            }
            let Some(outer_row) = self.outer.try_next()? else {
                return Ok(None);
            };
            self.inner = Some(build(&self.inner_plan, &outer_row, &self.env)?);
            self.outer_row = Some(outer_row);
            self.matched = false;
        }
    }
}

impl BindingStream for NestedLoopStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        let timer = profile_timer();
        let result = self.try_next_inner();
        record_profile_timer(QueryProfileKind::Join, timer);
        result
    }
}

struct UnionStream {
    inputs: Vec<BoxBindingStream>,
    current: usize,
    env: Env,
}

impl BindingStream for UnionStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        while self.current < self.inputs.len() {
            self.env.check()?;
            match self.inputs[self.current].try_next()? {
                Some(row) => return Ok(Some(row)),
                None => self.current += 1,
            }
        }
        Ok(None)
    }
}

struct MinusStream {
    left: BoxBindingStream,
    right: Option<BoxBindingStream>,
    rows: Vec<Binding>,
    env: Env,
}

impl BindingStream for MinusStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if let Some(mut right) = self.right.take() {
            self.env.check()?;
            self.rows = collect_rows(right.as_mut())?;
        }
        loop {
            self.env.check()?;
            let Some(row) = self.left.try_next()? else {
                return Ok(None);
            };
            let removed = self.rows.iter().any(|other| {
                other.variables().any(|var| row.contains(var)) && row.is_compatible(other)
            });
            if !removed {
                return Ok(Some(row));
            }
        }
    }
}

struct FilterStream {
    input: BoxBindingStream,
    expr: PhysicalExpr,
    evaluator: ExprEvaluator,
    env: Env,
}

impl FilterStream {
    fn try_next_inner(&mut self) -> Result<Option<Binding>> {
        loop {
            self.env.check()?;
            let Some(row) = self.input.try_next()? else {
                return Ok(None);
            };
            let mut probe = PlanProbe { env: &self.env };
            if self.evaluator.test(&self.expr, &row, &mut probe)? {
                return Ok(Some(row));
            }
        }
    }
}

impl BindingStream for FilterStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        let timer = profile_timer();
        let result = self.try_next_inner();
        record_profile_timer(QueryProfileKind::Filter, timer);
        result
    }
}

struct ExtendStream {
    input: BoxBindingStream,
    var: Variable,
    expr: PhysicalExpr,
    evaluator: ExprEvaluator,
    env: Env,
}

impl BindingStream for ExtendStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        self.env.check()?;
        let Some(mut row) = self.input.try_next()? else {
            return Ok(None);
        };
        let mut probe = PlanProbe { env: &self.env };
        if let Some(value) = self.evaluator.evaluate(&self.expr, &row, &mut probe)? {
            if !row.contains(&self.var) {
                row.insert(self.var.clone(), value);
            }
        }
        Ok(Some(row))
    }
}

struct AggregateStream {
    input: Option<BoxBindingStream>,
    keys: Vec<Variable>,
    aggregates: Vec<(Variable, Aggregate<PhysicalNode>)>,
    output: std::vec::IntoIter<Binding>,
    evaluator: ExprEvaluator,
    env: Env,
}

impl AggregateStream {
    fn compute(&mut self, mut input: BoxBindingStream) -> Result<Vec<Binding>> {
        let mut order: Vec<Vec<Option<Term>>> = Vec::new();
        let mut groups: FxHashMap<Vec<Option<Term>>, Vec<Accumulator>> = FxHashMap::default();
        while let Some(row) = input.try_next()? {
            self.env.check()?;
            let key: Vec<Option<Term>> = self.keys.iter().map(|k| row.get(k).cloned()).collect();
            if !groups.contains_key(&key) {
                let fresh = self
                    .aggregates
                    .iter()
                    .map(|(_, agg)| Accumulator::new(agg))
                    .collect();
                order.push(key.clone());
                groups.insert(key.clone(), fresh);
            }
            let Some(accumulators) = groups.get_mut(&key) else {
                continue;
            };
            for ((_, agg), acc) in self.aggregates.iter().zip(accumulators.iter_mut()) {
                match &agg.arg {
                    None => acc.add_row(&row),
                    Some(arg) => {
                        let mut probe = PlanProbe { env: &self.env };
                        acc.add(self.evaluator.evaluate(arg, &row, &mut probe)?);
                    }
                }
            }
        }
        if order.is_empty() && self.keys.is_empty() {
            order.push(Vec::new());
            groups.insert(
                Vec::new(),
                self.aggregates
                    .iter()
                    .map(|(_, agg)| Accumulator::new(agg))
                    .collect(),
            );
        }
        let mut out = Vec::with_capacity(order.len());
        for key in order {
            let Some(accumulators) = groups.remove(&key) else {
                continue;
            };
            let mut row = Binding::new();
            for (var, value) in self.keys.iter().zip(key) {
                if let Some(value) = value {
                    row.insert(var.clone(), value);
                }
            }
            for ((var, _), acc) in self.aggregates.iter().zip(accumulators) {
                if let Some(value) = acc.finish() {
                    row.insert(var.clone(), value);
                }
            }
            out.push(row);
        }
        Ok(out)
    }
}

impl BindingStream for AggregateStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if let Some(input) = self.input.take() {
            self.env.check()?;
            let rows = self.compute(input)?;
            self.output = rows.into_iter();
        }
        Ok(self.output.next())
    }
}

struct ProjectStream {
    input: BoxBindingStream,
    variables: Vec<Variable>,
    env: Env,
}

impl BindingStream for ProjectStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        self.env.check()?;
        Ok(self.input.try_next()?.map(|row| row.project(&self.variables)))
    }
}

struct DistinctStream {
    input: BoxBindingStream,
    seen: FxHashSet<Binding>,
    env: Env,
}

impl BindingStream for DistinctStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        loop {
            self.env.check()?;
            let Some(row) = self.input.try_next()? else {
                return Ok(None);
            };
            if self.seen.insert(row.clone()) {
                return Ok(Some(row));
            }
        }
    }
}

struct ReducedStream {
    input: BoxBindingStream,
    last: Option<Binding>,
    env: Env,
}

impl BindingStream for ReducedStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        loop {
            self.env.check()?;
            let Some(row) = self.input.try_next()? else {
                return Ok(None);
            };
            if self.last.as_ref() != Some(&row) {
                self.last = Some(row.clone());
                return Ok(Some(row));
            }
        }
    }
}

/// Blocking stable sort; with a limit, only the first `limit` rows are kept
/// while consuming the input.
struct SortStream {
    input: Option<BoxBindingStream>,
    keys: Vec<SortKey>,
    limit: Option<usize>,
    output: std::vec::IntoIter<Binding>,
    evaluator: ExprEvaluator,
    env: Env,
}

impl SortStream {
    fn new(input: BoxBindingStream, keys: Vec<SortKey>, limit: Option<usize>, env: &Env) -> Self {
        Self {
            input: Some(input),
            keys,
            limit,
            output: Vec::new().into_iter(),
            evaluator: ExprEvaluator::new(),
            env: env.clone(),
        }
    }

    fn compare(&self, left: &[Option<Term>], right: &[Option<Term>]) -> Ordering {
        for (idx, key) in self.keys.iter().enumerate() {
            let ordering = order_terms(left[idx].as_ref(), right[idx].as_ref());
            let ordering = if key.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    fn sort(&mut self, mut input: BoxBindingStream) -> Result<Vec<Binding>> {
        let mut keyed: Vec<(Vec<Option<Term>>, Binding)> = Vec::new();
        while let Some(row) = input.try_next()? {
            self.env.check()?;
            let mut values = Vec::with_capacity(self.keys.len());
            for key in &self.keys {
                let mut probe = PlanProbe { env: &self.env };
                values.push(self.evaluator.evaluate(&key.expr, &row, &mut probe)?);
            }
            match self.limit {
                Some(limit) => {
                    // Insert after equal keys to stay stable.
                    let pos = keyed.partition_point(|(existing, _)| {
                        self.compare(existing, &values) != Ordering::Greater
                    });
                    if pos < limit {
                        keyed.insert(pos, (values, row));
                        keyed.truncate(limit);
                    }
                }
                None => keyed.push((values, row)),
            }
        }
        if self.limit.is_none() {
            keyed.sort_by(|(a, _), (b, _)| self.compare(a, b));
        }
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }
}

impl BindingStream for SortStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if let Some(input) = self.input.take() {
            self.env.check()?;
            let timer = profile_timer();
            let rows = self.sort(input);
            record_profile_timer(QueryProfileKind::Sort, timer);
            self.output = rows?.into_iter();
        }
        Ok(self.output.next())
    }
}

struct SliceStream {
    input: BoxBindingStream,
    offset: usize,
    limit: Option<usize>,
    produced: usize,
    env: Env,
}

impl BindingStream for SliceStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(None);
        }
        while self.offset > 0 {
            self.env.check()?;
            if self.input.try_next()?.is_none() {
                self.offset = 0;
                self.limit = Some(self.produced);
                return Ok(None);
            }
            self.offset -= 1;
        }
        self.env.check()?;
        let row = self.input.try_next()?;
        if row.is_some() {
            self.produced += 1;
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::error::{SourceError, SourceErrorKind};
    use crate::model::{Literal, PatternShape, Quad, TermPattern};
    use crate::query::expr::{BinaryOp, Expression};
    use crate::source::Capabilities;

    /// Adapter over a fixed quad list that counts rows handed out.
    struct ListSource {
        quads: Vec<Quad>,
        pulled: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    impl ListSource {
        fn new(quads: Vec<Quad>) -> Self {
            Self {
                quads,
                pulled: Arc::new(AtomicUsize::new(0)),
                fail_after: None,
            }
        }
    }

    impl SourceAdapter for ListSource {
        fn name(&self) -> &str {
            "list"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::full_scan()
        }

        fn count(&self, _pattern: &QuadPattern) -> std::result::Result<u64, SourceError> {
            Ok(self.quads.len() as u64)
        }

        fn scan(&self, pattern: &QuadPattern) -> std::result::Result<QuadScan, SourceError> {
            let pattern = pattern.clone();
            let pulled = Arc::clone(&self.pulled);
            let fail_after = self.fail_after;
            let rows: Vec<_> = self.quads.iter().filter_map(|q| pattern.matches(q)).collect();
            Ok(Box::new(rows.into_iter().enumerate().map(move |(idx, row)| {
                if fail_after == Some(idx) {
                    return Err(SourceError::new("list", SourceErrorKind::Io, "disk went away"));
                }
                pulled.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(row)
            })))
        }
    }

    fn people() -> Vec<Quad> {
        (0..5)
            .map(|idx| {
                Quad::triple(
                    Term::iri(format!("http://ex/p{idx}")),
                    Term::iri("http://ex/age"),
                    Literal::integer(20 + idx).into(),
                )
            })
            .collect()
    }

    fn scan_node(sources: &[usize]) -> PhysicalNode {
        let pattern = QuadPattern::new(
            TermPattern::Variable(Variable::new("s")),
            Term::iri("http://ex/age"),
            TermPattern::Variable(Variable::new("age")),
        );
        PhysicalNode::new(PhysicalOp::Scan {
            pattern,
            shape: PatternShape::default(),
            sources: sources.iter().map(|idx| SourceId(*idx)).collect(),
        })
    }

    fn run(plan: PhysicalNode, source: ListSource) -> (SolutionStream, Arc<AtomicUsize>) {
        let pulled = Arc::clone(&source.pulled);
        let sources = SourceSet::new(vec![Arc::new(source) as Arc<dyn SourceAdapter>]);
        let stream = Executor::new(sources)
            .execute(&PhysicalPlan::new(plan), None)
            .expect("builds");
        (stream, pulled)
    }

    #[test]
    fn slice_stops_pulling_at_limit() {
        let plan = PhysicalNode::unary(
            PhysicalOp::Slice {
                offset: 0,
                limit: Some(2),
            },
            scan_node(&[0]),
        );
        let (stream, pulled) = run(plan, ListSource::new(people()));
        let rows: Vec<_> = stream.collect::<Result<_>>().expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(pulled.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn limit_zero_never_pulls() {
        let plan = PhysicalNode::unary(
            PhysicalOp::Slice {
                offset: 0,
                limit: Some(0),
            },
            scan_node(&[0]),
        );
        let (mut stream, pulled) = run(plan, ListSource::new(people()));
        assert_eq!(stream.pull(), Pulled::Exhausted);
        assert_eq!(pulled.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn filter_and_sort_descending() {
        let filter = PhysicalNode::unary(
            PhysicalOp::Filter {
                expr: Expression::binary(
                    BinaryOp::GreaterOrEqual,
                    Expression::Variable(Variable::new("age")),
                    Expression::Constant(Literal::integer(22).into()),
                ),
            },
            scan_node(&[0]),
        );
        let plan = PhysicalNode::unary(
            PhysicalOp::Sort {
                keys: vec![SortKey {
                    expr: Expression::Variable(Variable::new("age")),
                    descending: true,
                }],
            },
            filter,
        );
        let (stream, _) = run(plan, ListSource::new(people()));
        let ages: Vec<String> = stream
            .map(|row| {
                row.expect("row")
                    .get_str("age")
                    .and_then(Term::as_literal)
                    .map(|lit| lit.value().to_owned())
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(ages, vec!["24", "23", "22"]);
    }

    #[test]
    fn top_k_keeps_smallest_rows() {
        let plan = PhysicalNode::unary(
            PhysicalOp::TopK {
                keys: vec![SortKey {
                    expr: Expression::Variable(Variable::new("age")),
                    descending: false,
                }],
                limit: 2,
            },
            scan_node(&[0]),
        );
        let (stream, _) = run(plan, ListSource::new(people()));
        let rows: Vec<_> = stream.collect::<Result<_>>().expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].get_str("age"),
            Some(&Term::Literal(Literal::integer(20)))
        );
    }

    #[test]
    fn cancel_is_terminal_and_idempotent() {
        let (mut stream, pulled) = run(scan_node(&[0]), ListSource::new(people()));
        assert!(matches!(stream.pull(), Pulled::Row(_)));
        stream.cancel();
        stream.cancel();
        assert_eq!(stream.state(), StreamState::Cancelled);
        assert_eq!(stream.pull(), Pulled::Cancelled);
        assert_eq!(pulled.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn cancel_handle_stops_next_pull() {
        let (mut stream, _) = run(scan_node(&[0]), ListSource::new(people()));
        let handle = stream.cancel_handle();
        assert!(matches!(stream.pull(), Pulled::Row(_)));
        handle.cancel();
        assert_eq!(stream.pull(), Pulled::Cancelled);
        assert_eq!(stream.state(), StreamState::Cancelled);
    }

    #[test]
    fn cancel_after_exhaustion_is_noop() {
        let plan = PhysicalNode::unary(
            PhysicalOp::Slice {
                offset: 0,
                limit: Some(1),
            },
            scan_node(&[0]),
        );
        let (mut stream, _) = run(plan, ListSource::new(people()));
        assert!(matches!(stream.pull(), Pulled::Row(_)));
        assert_eq!(stream.pull(), Pulled::Exhausted);
        stream.cancel();
        assert_eq!(stream.state(), StreamState::Exhausted);
    }

    #[test]
    fn source_failure_keeps_delivered_rows() {
        let mut source = ListSource::new(people());
        source.fail_after = Some(2);
        let (mut stream, _) = run(scan_node(&[0]), source);
        assert!(matches!(stream.pull(), Pulled::Row(_)));
        assert!(matches!(stream.pull(), Pulled::Row(_)));
        let Pulled::Failed(err) = stream.pull() else {
            panic!("expected failure");
        };
        assert_eq!(err.code(), "SourceError");
        assert_eq!(stream.state(), StreamState::Failed);
        assert_eq!(stream.pull(), Pulled::Failed(err));
    }

    #[test]
    fn zero_timeout_fails_with_timeout() {
        let sources = SourceSet::new(vec![
            Arc::new(ListSource::new(people())) as Arc<dyn SourceAdapter>
        ]);
        let mut stream = Executor::new(sources)
            .execute(&PhysicalPlan::new(scan_node(&[0])), Some(Duration::ZERO))
            .expect("builds");
        let Pulled::Failed(err) = stream.pull() else {
            panic!("expected timeout");
        };
        assert_eq!(err, QueryError::Timeout { budget: Duration::ZERO });
    }

    #[test]
    fn nested_loop_seeds_inner_scan() {
        let outer = PhysicalNode::new(PhysicalOp::Values {
            variables: vec![Variable::new("s")],
            rows: vec![
                Binding::new().with("s", Term::iri("http://ex/p1")),
                Binding::new().with("s", Term::iri("http://ex/nobody")),
            ],
        });
        let plan = PhysicalNode::with_inputs(
            PhysicalOp::NestedLoopLeftJoin { expr: None },
            vec![outer, scan_node(&[0])],
        );
        let (stream, pulled) = run(plan, ListSource::new(people()));
        let rows: Vec<_> = stream.collect::<Result<_>>().expect("rows");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].get_str("age").is_some());
        assert!(rows[1].get_str("age").is_none());
        assert_eq!(pulled.load(AtomicOrdering::SeqCst), 1);
    }
}
