//! Physical planner: picks join algorithms and source adapters for an
//! optimized algebra tree.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hasher;

use tracing::{debug, warn};
use xxhash_rust::xxh64::Xxh64;

use crate::model::{QuadPattern, Variable};
use crate::query::algebra::{AlgebraExpr, AlgebraNode, AlgebraOp, OrderKey};
use crate::query::errors::PlanningError;
use crate::query::expr::{Aggregate, Expression};
use crate::query::physical::{PhysicalExpr, PhysicalNode, PhysicalOp, PhysicalPlan, SortKey};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::stats::{CardinalityEstimator, SourceSetEstimator};
use crate::source::{SourceId, SourceSet};

/// Default number of estimated rows a hash join may materialise.
pub const DEFAULT_HASH_JOIN_BUDGET: usize = 100_000;

/// Planner inputs that influence rule selection.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// Largest estimated build side for which a hash join is chosen.
    pub hash_join_budget: usize,
    /// Whether to enable hash join optimization
    pub enable_hash_join: bool,
    /// Whether ORDER BY under LIMIT becomes a bounded top-k sort.
    pub enable_top_k: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            hash_join_budget: DEFAULT_HASH_JOIN_BUDGET,
            enable_hash_join: true,
            enable_top_k: true,
        }
    }
}

/// Planner output containing the chosen physical plan and explain tree.
#[derive(Clone, Debug)]
pub struct PlannerOutput {
    /// The generated physical query plan
    pub plan: PhysicalPlan,
    /// Human-readable explain tree
    pub explain: PlanExplain,
    /// Deterministic plan hash for explain/caching.
    pub plan_hash: u64,
}

/// Human-readable explain tree.
#[derive(Clone, Debug)]
pub struct PlanExplain {
    /// Root node of the explain tree
    pub root: ExplainNode,
    /// Deterministic hash for the plan.
    pub plan_hash: u64,
}

impl PlanExplain {
    /// Renders the tree with redactable values replaced by `?`.
    pub fn redacted(&self) -> String {
        let mut out = String::new();
        render(&self.root, 0, true, &mut out);
        out
    }
}

impl fmt::Display for PlanExplain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        render(&self.root, 0, false, &mut out);
        f.write_str(&out)?;
        write!(f, "plan_hash: {:016x}", self.plan_hash)
    }
}

fn render(node: &ExplainNode, depth: usize, redact: bool, out: &mut String) {
    use std::fmt::Write as _;
    let _ = write!(out, "{:indent$}{}", "", node.op, indent = depth * 2);
    if !node.props.is_empty() {
        out.push_str(" [");
        for (idx, prop) in node.props.iter().enumerate() {
            if idx > 0 {
                out.push_str(", ");
            }
            let value = if redact && prop.redactable {
                "?"
            } else {
                prop.value.as_str()
            };
            let _ = write!(out, "{}={}", prop.key, value);
        }
        out.push(']');
    }
    out.push('\n');
    for input in &node.inputs {
        render(input, depth + 1, redact, out);
    }
}

/// Explain node representing an operator with optional metadata.
#[derive(Clone, Debug)]
pub struct ExplainNode {
    /// Operator name
    pub op: String,
    /// Additional properties describing the operator
    pub props: Vec<ExplainProp>,
    /// Input operators
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Looks up a property value by key.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|prop| prop.key == key)
            .map(|prop| prop.value.as_str())
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

/// Query planner that converts algebra trees to physical execution plans.
#[derive(Clone, Debug, Default)]
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    /// Creates a new planner with the given configuration.
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Planner configuration.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Converts an algebra tree into a physical plan.
    pub fn plan(
        &self,
        root: &AlgebraNode,
        sources: &SourceSet,
        estimator: &dyn CardinalityEstimator,
    ) -> Result<PlannerOutput, PlanningError> {
        let start = profile_timer();
        let ctx = PlanContext {
            config: &self.config,
            sources,
            estimator,
        };
        let planned = ctx.plan_node(root, &BTreeSet::new())?;
        let physical = PhysicalPlan::new(planned.node);
        let explain_root = build_explain_tree(&physical.root, sources);
        let plan_hash = hash_explain(&explain_root);
        record_profile_timer(QueryProfileKind::Plan, start);
        debug!(
            plan_hash = %format!("{plan_hash:016x}"),
            estimate = planned.estimate,
            "planner.plan"
        );
        Ok(PlannerOutput {
            plan: physical,
            explain: PlanExplain {
                root: explain_root,
                plan_hash,
            },
            plan_hash,
        })
    }
}

/// Plans `root` with source-backed estimates.
pub fn plan(
    root: &AlgebraNode,
    sources: &SourceSet,
    config: &PlannerConfig,
) -> Result<PlannerOutput, PlanningError> {
    let estimator = SourceSetEstimator::new(sources);
    Planner::new(config.clone()).plan(root, sources, &estimator)
}

struct Planned {
    node: PhysicalNode,
    estimate: f64,
    /// All reachable sources finish in bounded time, so the subtree may be
    /// materialised.
    bounded: bool,
}

impl Planned {
    fn leaf(op: PhysicalOp, estimate: f64) -> Self {
        Self {
            node: PhysicalNode::new(op),
            estimate,
            bounded: true,
        }
    }

    fn wrap(self, op: PhysicalOp, estimate: f64) -> Self {
        Self {
            node: PhysicalNode::unary(op, self.node),
            estimate,
            bounded: self.bounded,
        }
    }
}

struct PlanContext<'a> {
    config: &'a PlannerConfig,
    sources: &'a SourceSet,
    estimator: &'a dyn CardinalityEstimator,
}

impl PlanContext<'_> {
    /// Plans `node` given the variables an outer seed binds.
    fn plan_node(
        &self,
        node: &AlgebraNode,
        bound: &BTreeSet<Variable>,
    ) -> Result<Planned, PlanningError> {
        match &node.op {
            AlgebraOp::Pattern(pattern) => self.plan_scan(pattern, bound),
            AlgebraOp::Unit => Ok(Planned::leaf(PhysicalOp::Unit, 1.0)),
            AlgebraOp::Values { variables, rows } => Ok(Planned::leaf(
                PhysicalOp::Values {
                    variables: variables.clone(),
                    rows: rows.clone(),
                },
                rows.len() as f64,
            )),
            AlgebraOp::Join => self.plan_join(&node.inputs, bound),
            AlgebraOp::LeftJoin { expr } => {
                let [left, right] = two_inputs(node, "LeftJoin")?;
                self.plan_left_join(left, right, expr.as_ref(), bound)
            }
            AlgebraOp::Union => {
                if node.inputs.is_empty() {
                    return Err(PlanningError::Malformed("Union without inputs".into()));
                }
                let mut inputs = Vec::with_capacity(node.inputs.len());
                let mut estimate = 0.0;
                let mut bounded = true;
                for input in &node.inputs {
                    let planned = self.plan_node(input, bound)?;
                    estimate += planned.estimate;
                    bounded &= planned.bounded;
                    inputs.push(planned.node);
                }
                Ok(Planned {
                    node: PhysicalNode::with_inputs(PhysicalOp::Union, inputs),
                    estimate,
                    bounded,
                })
            }
            AlgebraOp::Minus => {
                let [left, right] = two_inputs(node, "Minus")?;
                let left = self.plan_node(left, bound)?;
                let right = self.plan_node(right, bound)?;
                Ok(Planned {
                    estimate: left.estimate,
                    bounded: left.bounded && right.bounded,
                    node: PhysicalNode::with_inputs(PhysicalOp::Minus, vec![left.node, right.node]),
                })
            }
            AlgebraOp::Filter { expr } => {
                let input_node = one_input(node, "Filter")?;
                let input = self.plan_node(input_node, bound)?;
                let expr = self.plan_expr(expr, input_node, bound)?;
                let estimate = input.estimate * 0.5;
                Ok(input.wrap(PhysicalOp::Filter { expr }, estimate))
            }
            AlgebraOp::Extend { var, expr } => {
                let input_node = one_input(node, "Extend")?;
                let input = self.plan_node(input_node, bound)?;
                let expr = self.plan_expr(expr, input_node, bound)?;
                let estimate = input.estimate;
                Ok(input.wrap(
                    PhysicalOp::Extend {
                        var: var.clone(),
                        expr,
                    },
                    estimate,
                ))
            }
            AlgebraOp::Group { keys, aggregates } => {
                let input_node = one_input(node, "Group")?;
                let input = self.plan_node(input_node, bound)?;
                let mut planned_aggregates = Vec::with_capacity(aggregates.len());
                for (var, agg) in aggregates {
                    planned_aggregates.push((var.clone(), self.plan_aggregate(agg, input_node, bound)?));
                }
                let estimate = self.estimator.estimate(node);
                Ok(input.wrap(
                    PhysicalOp::HashAggregate {
                        keys: keys.clone(),
                        aggregates: planned_aggregates,
                    },
                    estimate,
                ))
            }
            AlgebraOp::Project { variables } => {
                let input = self.plan_node(one_input(node, "Project")?, bound)?;
                let estimate = input.estimate;
                Ok(input.wrap(
                    PhysicalOp::Project {
                        variables: variables.clone(),
                    },
                    estimate,
                ))
            }
            AlgebraOp::Distinct => {
                let input = self.plan_node(one_input(node, "Distinct")?, bound)?;
                let estimate = input.estimate;
                Ok(input.wrap(PhysicalOp::Distinct, estimate))
            }
            AlgebraOp::Reduced => {
                let input = self.plan_node(one_input(node, "Reduced")?, bound)?;
                let estimate = input.estimate;
                Ok(input.wrap(PhysicalOp::Reduced, estimate))
            }
            AlgebraOp::OrderBy { keys } => {
                let input_node = one_input(node, "OrderBy")?;
                let input = self.plan_node(input_node, bound)?;
                let keys = self.plan_keys(keys, input_node, bound)?;
                let estimate = input.estimate;
                Ok(input.wrap(PhysicalOp::Sort { keys }, estimate))
            }
            AlgebraOp::Slice { offset, limit } => {
                let input_node = one_input(node, "Slice")?;
                let input = match limit {
                    Some(limit) if self.config.enable_top_k => {
                        self.plan_top_k(input_node, offset.saturating_add(*limit), bound)?
                    }
                    _ => self.plan_node(input_node, bound)?,
                };
                let estimate = match limit {
                    Some(limit) => input.estimate.min(*limit as f64),
                    None => input.estimate,
                };
                Ok(input.wrap(
                    PhysicalOp::Slice {
                        offset: *offset,
                        limit: *limit,
                    },
                    estimate,
                ))
            }
        }
    }

    /// Plans the input of a limited slice, turning a reachable OrderBy into
    /// a bounded sort. Projections between the two are looked through.
    fn plan_top_k(
        &self,
        node: &AlgebraNode,
        limit: usize,
        bound: &BTreeSet<Variable>,
    ) -> Result<Planned, PlanningError> {
        match &node.op {
            AlgebraOp::OrderBy { keys } => {
                let input_node = one_input(node, "OrderBy")?;
                let input = self.plan_node(input_node, bound)?;
                let keys = self.plan_keys(keys, input_node, bound)?;
                let estimate = input.estimate.min(limit as f64);
                debug!(limit, "planner.top_k");
                Ok(input.wrap(PhysicalOp::TopK { keys, limit }, estimate))
            }
            AlgebraOp::Project { variables } => {
                let input = self.plan_top_k(one_input(node, "Project")?, limit, bound)?;
                let estimate = input.estimate;
                Ok(input.wrap(
                    PhysicalOp::Project {
                        variables: variables.clone(),
                    },
                    estimate,
                ))
            }
            _ => self.plan_node(node, bound),
        }
    }

    fn plan_scan(
        &self,
        pattern: &QuadPattern,
        bound: &BTreeSet<Variable>,
    ) -> Result<Planned, PlanningError> {
        if self.sources.is_empty() {
            return Err(PlanningError::NoSources);
        }
        let shape = pattern.shape(bound);
        let mut chosen: Vec<SourceId> = Vec::new();
        let mut bounded = true;
        for (id, source) in self.sources.iter() {
            if source.supports(&shape) {
                bounded &= source.is_bounded();
                chosen.push(id);
            } else {
                warn!(
                    source = source.name(),
                    pattern = %pattern,
                    shape = %shape,
                    "planner.source_skipped"
                );
            }
        }
        if chosen.is_empty() {
            return Err(PlanningError::NoCapableSource {
                pattern: pattern.to_string(),
                shape: shape.to_string(),
            });
        }
        Ok(Planned {
            node: PhysicalNode::new(PhysicalOp::Scan {
                pattern: pattern.clone(),
                shape,
                sources: chosen,
            }),
            estimate: self.estimator.pattern(pattern),
            bounded,
        })
    }

    /// Plans an n-ary join left-deep in input order. An input that cannot be
    /// planned yet is deferred until the accumulated left side binds enough
    /// of its variables.
    fn plan_join(
        &self,
        inputs: &[AlgebraNode],
        bound: &BTreeSet<Variable>,
    ) -> Result<Planned, PlanningError> {
        let mut remaining: Vec<&AlgebraNode> = inputs.iter().collect();
        let mut current: Option<(Planned, BTreeSet<Variable>)> = None;
        while !remaining.is_empty() {
            let mut chosen = None;
            let mut first_err = None;
            for (idx, candidate) in remaining.iter().enumerate() {
                let step = match &current {
                    None => self.plan_node(candidate, bound),
                    Some((left, left_vars)) => self.plan_join_step(left, left_vars, candidate, bound),
                };
                match step {
                    Ok(planned) => {
                        chosen = Some((idx, planned));
                        break;
                    }
                    Err(err) => {
                        first_err.get_or_insert(err);
                    }
                }
            }
            let Some((idx, planned)) = chosen else {
                return Err(first_err
                    .unwrap_or_else(|| PlanningError::Malformed("join without inputs".into())));
            };
            let joined = remaining.remove(idx);
            let mut vars = current.map(|(_, vars)| vars).unwrap_or_default();
            vars.extend(joined.certain_variables());
            current = Some((planned, vars));
        }
        match current {
            Some((planned, _)) => Ok(planned),
            None => Ok(Planned::leaf(PhysicalOp::Unit, 1.0)),
        }
    }

    /// Joins `right` onto an already planned left side.
    fn plan_join_step(
        &self,
        left: &Planned,
        left_vars: &BTreeSet<Variable>,
        right: &AlgebraNode,
        bound: &BTreeSet<Variable>,
    ) -> Result<Planned, PlanningError> {
        let standalone = self.plan_node(right, bound);
        let seedable = seed_safe(right);
        let left_node = left.node.clone();
        match standalone {
            Ok(planned) => {
                let fits = self.config.enable_hash_join
                    && left.bounded
                    && planned.bounded
                    && left.estimate.min(planned.estimate) <= self.config.hash_join_budget as f64;
                if fits || !seedable {
                    let keys: Vec<Variable> = left_vars
                        .intersection(&right.certain_variables())
                        .cloned()
                        .collect();
                    let build_left = fits && left.estimate < planned.estimate;
                    debug!(
                        algorithm = "hash",
                        build_left,
                        left_estimate = left.estimate,
                        right_estimate = planned.estimate,
                        "planner.join"
                    );
                    return Ok(Planned {
                        estimate: left.estimate.min(planned.estimate),
                        bounded: left.bounded && planned.bounded,
                        node: PhysicalNode::with_inputs(
                            PhysicalOp::HashJoin { keys, build_left },
                            vec![left_node, planned.node],
                        ),
                    });
                }
                self.nested_loop(left, left_vars, right, bound)
            }
            Err(err) if seedable => self.nested_loop(left, left_vars, right, bound).map_err(|_| err),
            Err(err) => Err(err),
        }
    }

    fn nested_loop(
        &self,
        left: &Planned,
        left_vars: &BTreeSet<Variable>,
        right: &AlgebraNode,
        bound: &BTreeSet<Variable>,
    ) -> Result<Planned, PlanningError> {
        let seeded_bound: BTreeSet<Variable> = bound.union(left_vars).cloned().collect();
        let inner = self.plan_node(right, &seeded_bound)?;
        debug!(
            algorithm = "nested_loop",
            left_estimate = left.estimate,
            right_estimate = inner.estimate,
            "planner.join"
        );
        Ok(Planned {
            estimate: left.estimate.min(inner.estimate),
            bounded: left.bounded && inner.bounded,
            node: PhysicalNode::with_inputs(
                PhysicalOp::NestedLoopJoin,
                vec![left.node.clone(), inner.node],
            ),
        })
    }

    fn plan_left_join(
        &self,
        left: &AlgebraNode,
        right: &AlgebraNode,
        expr: Option<&AlgebraExpr>,
        bound: &BTreeSet<Variable>,
    ) -> Result<Planned, PlanningError> {
        let left_planned = self.plan_node(left, bound)?;
        let left_vars: BTreeSet<Variable> = bound.union(&left.certain_variables()).cloned().collect();
        let expr = expr
            .map(|expr| self.plan_expr_with(expr, &left_vars))
            .transpose()?;
        let standalone = self.plan_node(right, bound);
        let seedable = seed_safe(right);
        let hash = |right_planned: Planned, left_planned: Planned, expr: Option<PhysicalExpr>| {
            let keys: Vec<Variable> = left
                .certain_variables()
                .intersection(&right.certain_variables())
                .cloned()
                .collect();
            debug!(algorithm = "hash", "planner.left_join");
            Planned {
                estimate: left_planned.estimate,
                bounded: left_planned.bounded && right_planned.bounded,
                node: PhysicalNode::with_inputs(
                    PhysicalOp::HashLeftJoin { keys, expr },
                    vec![left_planned.node, right_planned.node],
                ),
            }
        };
        match standalone {
            Ok(right_planned) => {
                let fits = self.config.enable_hash_join
                    && left_planned.bounded
                    && right_planned.bounded
                    && right_planned.estimate <= self.config.hash_join_budget as f64;
                if fits || !seedable {
                    return Ok(hash(right_planned, left_planned, expr));
                }
                let inner = self.plan_node(right, &left_vars)?;
                Ok(nested_left_join(left_planned, inner, expr))
            }
            Err(err) if seedable => {
                let inner = self.plan_node(right, &left_vars).map_err(|_| err)?;
                Ok(nested_left_join(left_planned, inner, expr))
            }
            Err(err) => Err(err),
        }
    }

    fn plan_expr(
        &self,
        expr: &AlgebraExpr,
        input: &AlgebraNode,
        bound: &BTreeSet<Variable>,
    ) -> Result<PhysicalExpr, PlanningError> {
        let scope: BTreeSet<Variable> = bound.union(&input.certain_variables()).cloned().collect();
        self.plan_expr_with(expr, &scope)
    }

    /// Plans `EXISTS` bodies with `scope` supplied by the probed row.
    fn plan_expr_with(
        &self,
        expr: &AlgebraExpr,
        scope: &BTreeSet<Variable>,
    ) -> Result<PhysicalExpr, PlanningError> {
        expr.try_map_patterns(&mut |pattern: &AlgebraNode| {
            self.plan_node(pattern, scope).map(|planned| planned.node)
        })
    }

    fn plan_aggregate(
        &self,
        agg: &Aggregate<AlgebraNode>,
        input: &AlgebraNode,
        bound: &BTreeSet<Variable>,
    ) -> Result<Aggregate<PhysicalNode>, PlanningError> {
        Ok(Aggregate {
            func: agg.func,
            distinct: agg.distinct,
            arg: agg
                .arg
                .as_ref()
                .map(|arg| self.plan_expr(arg, input, bound))
                .transpose()?,
            separator: agg.separator.clone(),
        })
    }

    fn plan_keys(
        &self,
        keys: &[OrderKey],
        input: &AlgebraNode,
        bound: &BTreeSet<Variable>,
    ) -> Result<Vec<SortKey>, PlanningError> {
        keys.iter()
            .map(|key| {
                Ok(SortKey {
                    expr: self.plan_expr(&key.expr, input, bound)?,
                    descending: key.descending,
                })
            })
            .collect()
    }
}

fn nested_left_join(left: Planned, inner: Planned, expr: Option<PhysicalExpr>) -> Planned {
    debug!(algorithm = "nested_loop", "planner.left_join");
    Planned {
        estimate: left.estimate,
        bounded: left.bounded && inner.bounded,
        node: PhysicalNode::with_inputs(
            PhysicalOp::NestedLoopLeftJoin { expr },
            vec![left.node, inner.node],
        ),
    }
}

fn one_input<'a>(node: &'a AlgebraNode, name: &str) -> Result<&'a AlgebraNode, PlanningError> {
    match node.inputs.as_slice() {
        [input] => Ok(input),
        other => Err(PlanningError::Malformed(format!(
            "{name} expects 1 input, found {}",
            other.len()
        ))),
    }
}

fn two_inputs<'a>(node: &'a AlgebraNode, name: &str) -> Result<[&'a AlgebraNode; 2], PlanningError> {
    match node.inputs.as_slice() {
        [left, right] => Ok([left, right]),
        other => Err(PlanningError::Malformed(format!(
            "{name} expects 2 inputs, found {}",
            other.len()
        ))),
    }
}

/// Whether evaluating `node` with an outer row substituted into its patterns
/// yields exactly the rows of the unseeded subtree compatible with that row.
pub(crate) fn seed_safe(node: &AlgebraNode) -> bool {
    match &node.op {
        AlgebraOp::Pattern(_) | AlgebraOp::Unit | AlgebraOp::Values { .. } => true,
        AlgebraOp::Join | AlgebraOp::Union => node.inputs.iter().all(seed_safe),
        AlgebraOp::Filter { expr } => match node.inputs.as_slice() {
            [input] => {
                !expr.contains_exists()
                    && expr.variables().is_subset(&input.certain_variables())
                    && seed_safe(input)
            }
            _ => false,
        },
        _ => false,
    }
}

fn build_explain_tree(node: &PhysicalNode, sources: &SourceSet) -> ExplainNode {
    let mut explain = ExplainNode::new(node.op.name());
    explain.props = op_props(&node.op, sources);
    explain.inputs = node
        .inputs
        .iter()
        .map(|child| build_explain_tree(child, sources))
        .collect();
    explain
}

fn hash_explain(root: &ExplainNode) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_explain_node(root, &mut hasher);
    hasher.finish()
}

fn hash_explain_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write_u8(0);
        hasher.write(prop.value.as_bytes());
        hasher.write_u8(0);
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_explain_node(child, hasher);
    }
}

fn op_props(op: &PhysicalOp, sources: &SourceSet) -> Vec<ExplainProp> {
    match op {
        PhysicalOp::Scan {
            pattern,
            shape,
            sources: ids,
        } => {
            let names: Vec<&str> = ids
                .iter()
                .filter_map(|id| sources.get(*id).map(|source| source.name()))
                .collect();
            vec![
                ExplainProp::literal("pattern", pattern.to_string()),
                ExplainProp::plain("shape", shape.to_string()),
                ExplainProp::plain("sources", names.join(",")),
            ]
        }
        PhysicalOp::Values { variables, rows } => vec![
            ExplainProp::plain("vars", describe_vars(variables)),
            ExplainProp::plain("rows", rows.len().to_string()),
        ],
        PhysicalOp::HashJoin { keys, build_left } => vec![
            ExplainProp::plain("keys", describe_vars(keys)),
            ExplainProp::plain("build", if *build_left { "left" } else { "right" }),
        ],
        PhysicalOp::HashLeftJoin { keys, expr } => {
            let mut props = vec![ExplainProp::plain("keys", describe_vars(keys))];
            if let Some(expr) = expr {
                props.push(ExplainProp::literal("expr", expr.to_string()));
            }
            props
        }
        PhysicalOp::NestedLoopLeftJoin { expr: Some(expr) } => {
            vec![ExplainProp::literal("expr", expr.to_string())]
        }
        PhysicalOp::Filter { expr } => vec![ExplainProp::literal("expr", expr.to_string())],
        PhysicalOp::Extend { var, expr } => vec![
            ExplainProp::plain("var", var.to_string()),
            ExplainProp::literal("expr", expr.to_string()),
        ],
        PhysicalOp::HashAggregate { keys, aggregates } => {
            let aggs: Vec<String> = aggregates
                .iter()
                .map(|(var, agg)| format!("{var}={}", Expression::Aggregate(Box::new(agg.clone()))))
                .collect();
            vec![
                ExplainProp::plain("keys", describe_vars(keys)),
                ExplainProp::plain("aggregates", aggs.join(" ")),
            ]
        }
        PhysicalOp::Project { variables } => vec![ExplainProp::plain("vars", describe_vars(variables))],
        PhysicalOp::Sort { keys } => vec![ExplainProp::literal("keys", describe_keys(keys))],
        PhysicalOp::TopK { keys, limit } => vec![
            ExplainProp::literal("keys", describe_keys(keys)),
            ExplainProp::plain("limit", limit.to_string()),
        ],
        PhysicalOp::Slice { offset, limit } => {
            let mut props = vec![ExplainProp::plain("offset", offset.to_string())];
            if let Some(limit) = limit {
                props.push(ExplainProp::plain("limit", limit.to_string()));
            }
            props
        }
        PhysicalOp::Unit
        | PhysicalOp::NestedLoopJoin
        | PhysicalOp::NestedLoopLeftJoin { expr: None }
        | PhysicalOp::Union
        | PhysicalOp::Minus
        | PhysicalOp::Distinct
        | PhysicalOp::Reduced => Vec::new(),
    }
}

fn describe_vars(vars: &[Variable]) -> String {
    vars.iter()
        .map(Variable::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_keys(keys: &[SortKey]) -> String {
    keys.iter()
        .map(|key| {
            let dir = if key.descending { "DESC" } else { "ASC" };
            format!("{dir}({})", key.expr)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::error::SourceError;
    use crate::model::{Term, TermPattern};
    use crate::query::stats::HeuristicEstimator;
    use crate::source::{AccessPath, Capabilities, QuadScan, SourceAdapter};

    struct StubSource {
        name: &'static str,
        caps: Capabilities,
        bounded: bool,
    }

    impl SourceAdapter for StubSource {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            self.caps.clone()
        }

        fn count(&self, _pattern: &QuadPattern) -> Result<u64, SourceError> {
            Ok(10)
        }

        fn scan(&self, _pattern: &QuadPattern) -> Result<QuadScan, SourceError> {
            Ok(Box::new(std::iter::empty()))
        }

        fn is_bounded(&self) -> bool {
            self.bounded
        }
    }

    fn source_set(caps: Capabilities, bounded: bool) -> SourceSet {
        SourceSet::new(vec![Arc::new(StubSource {
            name: "stub",
            caps,
            bounded,
        }) as Arc<dyn SourceAdapter>])
    }

    fn var(name: &str) -> TermPattern {
        TermPattern::Variable(Variable::new(name))
    }

    fn typed(s: &str) -> AlgebraNode {
        AlgebraNode::pattern(QuadPattern::new(
            var(s),
            Term::iri("http://type"),
            Term::iri("http://Person"),
        ))
    }

    fn edge(s: &str, p: &str, o: &str) -> AlgebraNode {
        AlgebraNode::pattern(QuadPattern::new(var(s), Term::iri(p), var(o)))
    }

    fn planner() -> Planner {
        Planner::new(PlannerConfig::default())
    }

    #[test]
    fn bounded_sources_get_hash_join() {
        let sources = source_set(Capabilities::full_scan(), true);
        let tree = AlgebraNode::with_inputs(
            AlgebraOp::Join,
            vec![typed("s"), edge("s", "http://name", "n")],
        );
        let output = planner()
            .plan(&tree, &sources, &HeuristicEstimator)
            .expect("plans");
        let PhysicalOp::HashJoin { keys, .. } = &output.plan.root.op else {
            panic!("expected hash join, got {:?}", output.plan.root.op);
        };
        assert_eq!(keys, &vec![Variable::new("s")]);
        assert_eq!(output.explain.root.op, "HashJoin");
        assert_eq!(output.explain.root.inputs[0].prop("sources"), Some("stub"));
    }

    #[test]
    fn unbounded_sources_get_nested_loop_with_seeded_shape() {
        let sources = source_set(Capabilities::full_scan(), false);
        let tree = AlgebraNode::with_inputs(
            AlgebraOp::Join,
            vec![typed("s"), edge("s", "http://name", "n")],
        );
        let output = planner()
            .plan(&tree, &sources, &HeuristicEstimator)
            .expect("plans");
        assert!(matches!(output.plan.root.op, PhysicalOp::NestedLoopJoin));
        let PhysicalOp::Scan { shape, .. } = &output.plan.root.inputs[1].op else {
            panic!("expected inner scan");
        };
        assert!(shape.subject);
    }

    #[test]
    fn lookup_only_source_rejects_unbound_subject() {
        let sources = source_set(Capabilities::lookups([AccessPath::SUBJECT]), true);
        let err = planner()
            .plan(&typed("s"), &sources, &HeuristicEstimator)
            .unwrap_err();
        assert!(matches!(err, PlanningError::NoCapableSource { .. }));
    }

    #[test]
    fn lookup_only_inner_side_is_forced_to_nested_loop() {
        let sources = source_set(Capabilities::lookups([AccessPath::SUBJECT]), true);
        let seed = AlgebraNode::new(AlgebraOp::Values {
            variables: vec![Variable::new("s")],
            rows: vec![crate::model::Binding::new().with("s", Term::iri("http://alice"))],
        });
        let tree = AlgebraNode::with_inputs(
            AlgebraOp::Join,
            vec![seed, edge("s", "http://name", "n")],
        );
        let output = planner()
            .plan(&tree, &sources, &HeuristicEstimator)
            .expect("plans");
        assert!(matches!(output.plan.root.op, PhysicalOp::NestedLoopJoin));
        assert_eq!(output.explain.root.inputs[1].prop("shape"), Some("SP??"));
    }

    #[test]
    fn incapable_source_is_skipped_when_another_answers() {
        let scan_all: Arc<dyn SourceAdapter> = Arc::new(StubSource {
            name: "people",
            caps: Capabilities::full_scan(),
            bounded: true,
        });
        let lookups: Arc<dyn SourceAdapter> = Arc::new(StubSource {
            name: "profiles",
            caps: Capabilities::lookups([AccessPath::SUBJECT]),
            bounded: true,
        });
        let sources = SourceSet::new(vec![scan_all, lookups]);
        let output = planner()
            .plan(&typed("s"), &sources, &HeuristicEstimator)
            .expect("plans");
        assert_eq!(output.explain.root.prop("sources"), Some("people"));
    }

    #[test]
    fn order_by_under_limit_becomes_top_k() {
        let sources = source_set(Capabilities::full_scan(), true);
        let tree = AlgebraNode::unary(
            AlgebraOp::Slice {
                offset: 2,
                limit: Some(3),
            },
            AlgebraNode::unary(
                AlgebraOp::OrderBy {
                    keys: vec![OrderKey {
                        expr: Expression::Variable(Variable::new("s")),
                        descending: false,
                    }],
                },
                typed("s"),
            ),
        );
        let output = planner()
            .plan(&tree, &sources, &HeuristicEstimator)
            .expect("plans");
        let PhysicalOp::TopK { limit, .. } = &output.plan.root.inputs[0].op else {
            panic!("expected top-k");
        };
        assert_eq!(*limit, 5);
    }

    #[test]
    fn plan_hash_is_deterministic() {
        let sources = source_set(Capabilities::full_scan(), true);
        let tree = AlgebraNode::with_inputs(
            AlgebraOp::Join,
            vec![typed("s"), edge("s", "http://name", "n")],
        );
        let first = planner().plan(&tree, &sources, &HeuristicEstimator).expect("plans");
        let second = planner().plan(&tree, &sources, &HeuristicEstimator).expect("plans");
        assert_eq!(first.plan_hash, second.plan_hash);
        assert!(first.explain.to_string().contains("HashJoin"));
        assert!(first.explain.redacted().contains("pattern=?"));
    }

    #[test]
    fn empty_source_set_is_rejected() {
        let err = planner()
            .plan(&typed("s"), &SourceSet::default(), &HeuristicEstimator)
            .unwrap_err();
        assert_eq!(err, PlanningError::NoSources);
    }
}
