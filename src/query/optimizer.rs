//! Rule-based logical optimizer.
//!
//! Rules rewrite one node at a time. A pass applies every rule bottom-up over
//! the whole tree; passes repeat until the tree stops changing or the pass
//! budget runs out.

use std::collections::BTreeSet;

use tracing::debug;

use crate::model::Variable;
use crate::query::algebra::{AlgebraExpr, AlgebraNode, AlgebraOp};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::stats::CardinalityEstimator;

/// Upper bound on optimizer passes.
pub const DEFAULT_MAX_PASSES: usize = 32;

/// Optimizer settings.
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    /// When false, trees are returned unchanged.
    pub enabled: bool,
    /// Pass budget for reaching a fixpoint.
    pub max_passes: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }
}

/// A local rewrite applied to every node of the tree.
///
/// Rules see nodes whose inputs were already rewritten in the same pass and
/// must preserve the multiset of solutions the node produces.
pub trait OptimizerRule: Send + Sync {
    /// Name reported in logs.
    fn name(&self) -> &'static str;

    /// Rewrites a single node.
    fn apply(&self, node: AlgebraNode, estimator: &dyn CardinalityEstimator) -> AlgebraNode;
}

/// Ordered list of rules run to a fixpoint.
pub struct Optimizer {
    rules: Vec<Box<dyn OptimizerRule>>,
    config: OptimizerConfig,
}

impl Optimizer {
    /// Creates an optimizer with the default rule list.
    pub fn new(config: OptimizerConfig) -> Self {
        Self::with_rules(config, default_rules())
    }

    /// Creates an optimizer with a custom rule list.
    pub fn with_rules(config: OptimizerConfig, rules: Vec<Box<dyn OptimizerRule>>) -> Self {
        Self { rules, config }
    }

    /// Rewrites `root` until no rule changes it.
    pub fn optimize(&self, root: AlgebraNode, estimator: &dyn CardinalityEstimator) -> AlgebraNode {
        if !self.config.enabled || self.rules.is_empty() {
            return root;
        }
        let start = profile_timer();
        let mut current = root;
        for pass in 0..self.config.max_passes {
            let next = self.pass(current.clone(), estimator);
            let changed = next != current;
            debug!(pass, changed, nodes = next.size(), "optimizer.pass");
            current = next;
            if !changed {
                break;
            }
        }
        record_profile_timer(QueryProfileKind::Optimize, start);
        current
    }

    fn pass(&self, node: AlgebraNode, estimator: &dyn CardinalityEstimator) -> AlgebraNode {
        let AlgebraNode { op, inputs } = node;
        let inputs = inputs
            .into_iter()
            .map(|input| self.pass(input, estimator))
            .collect();
        let mut node = AlgebraNode::with_inputs(op, inputs);
        for rule in &self.rules {
            node = rule.apply(node, estimator);
        }
        node
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

/// Runs the default optimizer.
pub fn optimize(root: AlgebraNode, estimator: &dyn CardinalityEstimator) -> AlgebraNode {
    Optimizer::default().optimize(root, estimator)
}

/// The rules every engine starts with, in application order.
pub fn default_rules() -> Vec<Box<dyn OptimizerRule>> {
    vec![
        Box::new(FlattenJoins),
        Box::new(PushDownFilters),
        Box::new(ReorderJoins),
        Box::new(EliminateRedundancy),
    ]
}

/// Merges nested joins into one n-ary join and drops `Unit` inputs.
pub struct FlattenJoins;

impl OptimizerRule for FlattenJoins {
    fn name(&self) -> &'static str {
        "flatten_joins"
    }

    fn apply(&self, node: AlgebraNode, _estimator: &dyn CardinalityEstimator) -> AlgebraNode {
        if !matches!(node.op, AlgebraOp::Join) {
            return node;
        }
        let mut flat = Vec::with_capacity(node.inputs.len());
        for input in node.inputs {
            match input.op {
                AlgebraOp::Join => flat.extend(input.inputs),
                AlgebraOp::Unit => {}
                _ => flat.push(input),
            }
        }
        match flat.len() {
            0 => AlgebraNode::unit(),
            1 => flat.pop().unwrap_or_else(AlgebraNode::unit),
            _ => AlgebraNode::with_inputs(AlgebraOp::Join, flat),
        }
    }
}

/// Moves filter conjuncts onto the join input that binds all their variables.
pub struct PushDownFilters;

impl OptimizerRule for PushDownFilters {
    fn name(&self) -> &'static str {
        "push_down_filters"
    }

    fn apply(&self, node: AlgebraNode, _estimator: &dyn CardinalityEstimator) -> AlgebraNode {
        let expr = match node.op {
            AlgebraOp::Filter { expr } => expr,
            _ => return node,
        };
        let mut inputs = node.inputs;
        let Some(input) = inputs.pop() else {
            return AlgebraNode::new(AlgebraOp::Filter { expr });
        };
        match input.op {
            AlgebraOp::Filter { expr: inner } => {
                let mut conjuncts = inner.into_conjuncts();
                conjuncts.extend(expr.into_conjuncts());
                wrap_filter(conjuncts, input.inputs.into_iter().next().unwrap_or_else(AlgebraNode::unit))
            }
            AlgebraOp::Join => {
                let mut join_inputs = input.inputs;
                let certain: Vec<BTreeSet<Variable>> =
                    join_inputs.iter().map(AlgebraNode::certain_variables).collect();
                let mut pushed: Vec<Vec<AlgebraExpr>> = vec![Vec::new(); join_inputs.len()];
                let mut kept = Vec::new();
                for conjunct in expr.into_conjuncts() {
                    let target = if conjunct.contains_exists() || join_inputs.len() < 2 {
                        None
                    } else {
                        let vars = conjunct.variables();
                        certain.iter().position(|bound| vars.is_subset(bound))
                    };
                    match target {
                        Some(idx) => pushed[idx].push(conjunct),
                        None => kept.push(conjunct),
                    }
                }
                for (slot, conjuncts) in join_inputs.iter_mut().zip(pushed) {
                    if conjuncts.is_empty() {
                        continue;
                    }
                    let taken = std::mem::replace(slot, AlgebraNode::unit());
                    *slot = merge_into(conjuncts, taken);
                }
                wrap_filter(kept, AlgebraNode::with_inputs(AlgebraOp::Join, join_inputs))
            }
            AlgebraOp::LeftJoin { expr: left_expr } => {
                let mut sides = input.inputs;
                if sides.len() != 2 {
                    return wrap_filter(
                        expr.into_conjuncts(),
                        AlgebraNode::with_inputs(AlgebraOp::LeftJoin { expr: left_expr }, sides),
                    );
                }
                let certain = sides[0].certain_variables();
                let (pushed, kept): (Vec<_>, Vec<_>) = expr
                    .into_conjuncts()
                    .into_iter()
                    .partition(|conjunct| {
                        !conjunct.contains_exists() && conjunct.variables().is_subset(&certain)
                    });
                if !pushed.is_empty() {
                    let left = std::mem::replace(&mut sides[0], AlgebraNode::unit());
                    sides[0] = merge_into(pushed, left);
                }
                wrap_filter(
                    kept,
                    AlgebraNode::with_inputs(AlgebraOp::LeftJoin { expr: left_expr }, sides),
                )
            }
            _ => AlgebraNode::unary(AlgebraOp::Filter { expr }, input),
        }
    }
}

/// Adds conjuncts to `node`, merging with an existing filter.
fn merge_into(conjuncts: Vec<AlgebraExpr>, node: AlgebraNode) -> AlgebraNode {
    match node.op {
        AlgebraOp::Filter { expr } => {
            let mut all = expr.into_conjuncts();
            all.extend(conjuncts);
            wrap_filter(all, node.inputs.into_iter().next().unwrap_or_else(AlgebraNode::unit))
        }
        op => wrap_filter(conjuncts, AlgebraNode::with_inputs(op, node.inputs)),
    }
}

fn wrap_filter(conjuncts: Vec<AlgebraExpr>, input: AlgebraNode) -> AlgebraNode {
    match AlgebraExpr::conjunction(conjuncts) {
        Some(expr) => AlgebraNode::unary(AlgebraOp::Filter { expr }, input),
        None => input,
    }
}

/// Stably sorts join inputs by ascending estimated cardinality.
pub struct ReorderJoins;

impl OptimizerRule for ReorderJoins {
    fn name(&self) -> &'static str {
        "reorder_joins"
    }

    fn apply(&self, node: AlgebraNode, estimator: &dyn CardinalityEstimator) -> AlgebraNode {
        if !matches!(node.op, AlgebraOp::Join) || node.inputs.len() < 2 {
            return node;
        }
        let mut keyed: Vec<(f64, AlgebraNode)> = node
            .inputs
            .into_iter()
            .map(|input| (estimator.estimate(&input), input))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| a.total_cmp(b));
        AlgebraNode::with_inputs(
            AlgebraOp::Join,
            keyed.into_iter().map(|(_, input)| input).collect(),
        )
    }
}

/// Removes operators that cannot change the solutions they pass through.
pub struct EliminateRedundancy;

impl OptimizerRule for EliminateRedundancy {
    fn name(&self) -> &'static str {
        "eliminate_redundancy"
    }

    fn apply(&self, node: AlgebraNode, _estimator: &dyn CardinalityEstimator) -> AlgebraNode {
        match &node.op {
            AlgebraOp::Slice {
                offset: 0,
                limit: None,
            } => first_input(node),
            AlgebraOp::Distinct
                if matches!(node.inputs.first(), Some(input) if matches!(input.op, AlgebraOp::Distinct)) =>
            {
                first_input(node)
            }
            AlgebraOp::Project { variables } => {
                let Some(input) = node.inputs.first() else {
                    return node;
                };
                if let AlgebraOp::Project { variables: inner } = &input.op {
                    let kept: Vec<Variable> = variables
                        .iter()
                        .filter(|var| inner.contains(var))
                        .cloned()
                        .collect();
                    let grandchild = input.inputs.clone();
                    return AlgebraNode::with_inputs(AlgebraOp::Project { variables: kept }, grandchild);
                }
                let possible = input.possible_variables();
                if possible.iter().all(|var| variables.contains(var)) {
                    first_input(node)
                } else {
                    node
                }
            }
            _ => node,
        }
    }
}

fn first_input(node: AlgebraNode) -> AlgebraNode {
    node.inputs.into_iter().next().unwrap_or_else(AlgebraNode::unit)
}
