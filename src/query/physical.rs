//! Physical operator tree selected by the planner.

use crate::model::{Binding, PatternShape, QuadPattern, Variable};
use crate::query::expr::{Aggregate, Expression};
use crate::source::SourceId;

/// Expression whose `EXISTS` bodies are planned subtrees.
pub type PhysicalExpr = Expression<PhysicalNode>;

/// Physical plan produced by the planner.
#[derive(Clone, Debug)]
pub struct PhysicalPlan {
    /// The root node of the physical plan tree.
    pub root: PhysicalNode,
}

impl PhysicalPlan {
    /// Creates a new physical plan with the given root node.
    pub fn new(root: PhysicalNode) -> Self {
        Self { root }
    }
}

/// Node within the physical plan tree.
#[derive(Clone, Debug)]
pub struct PhysicalNode {
    /// The physical operator at this node.
    pub op: PhysicalOp,
    /// Child nodes that provide input to this operator.
    pub inputs: Vec<PhysicalNode>,
}

impl PhysicalNode {
    /// Creates a new physical node with no inputs.
    pub fn new(op: PhysicalOp) -> Self {
        Self {
            op,
            inputs: Vec::new(),
        }
    }

    /// Creates a new physical node with the given inputs.
    pub fn with_inputs(op: PhysicalOp, inputs: Vec<PhysicalNode>) -> Self {
        Self { op, inputs }
    }

    /// Creates a node over a single input.
    pub fn unary(op: PhysicalOp, input: PhysicalNode) -> Self {
        Self::with_inputs(op, vec![input])
    }
}

/// Sort key evaluated per row.
#[derive(Clone, Debug)]
pub struct SortKey {
    /// Key expression.
    pub expr: PhysicalExpr,
    /// Descending order.
    pub descending: bool,
}

/// Physical operators.
///
/// Operators whose inner input is "seeded" evaluate that input once per outer
/// row with the row substituted into its patterns.
#[derive(Clone, Debug)]
pub enum PhysicalOp {
    /// Matches a pattern against every listed source and concatenates results.
    Scan {
        /// Pattern to match.
        pattern: QuadPattern,
        /// Bound slots when the scan is evaluated.
        shape: PatternShape,
        /// Sources able to answer the pattern, in set order.
        sources: Vec<SourceId>,
    },
    /// Inline rows.
    Values {
        /// Column variables.
        variables: Vec<Variable>,
        /// Rows.
        rows: Vec<Binding>,
    },
    /// Single empty solution.
    Unit,
    /// Builds a hash table over one side and streams the other.
    HashJoin {
        /// Variables bound on both sides, used as the hash key.
        keys: Vec<Variable>,
        /// Whether the left input is the build side.
        build_left: bool,
    },
    /// Streams the left input and re-evaluates the seeded right input per row.
    NestedLoopJoin,
    /// Left outer join with a hash table built over the right input.
    HashLeftJoin {
        /// Hash key variables.
        keys: Vec<Variable>,
        /// Optional condition over the joined row.
        expr: Option<PhysicalExpr>,
    },
    /// Left outer join that re-evaluates the seeded right input per left row.
    NestedLoopLeftJoin {
        /// Optional condition over the joined row.
        expr: Option<PhysicalExpr>,
    },
    /// Concatenates inputs in order.
    Union,
    /// Removes left rows matched by the materialised right input.
    Minus,
    /// Keeps rows whose expression is true.
    Filter {
        /// Condition.
        expr: PhysicalExpr,
    },
    /// Binds a computed value.
    Extend {
        /// Target variable.
        var: Variable,
        /// Computed value.
        expr: PhysicalExpr,
    },
    /// Blocking hash aggregation.
    HashAggregate {
        /// Grouping variables.
        keys: Vec<Variable>,
        /// Aggregate outputs.
        aggregates: Vec<(Variable, Aggregate<PhysicalNode>)>,
    },
    /// Restricts rows to the listed variables.
    Project {
        /// Output variables.
        variables: Vec<Variable>,
    },
    /// Removes duplicate rows, preserving first occurrence order.
    Distinct,
    /// Removes consecutive duplicate rows.
    Reduced,
    /// Blocking stable sort.
    Sort {
        /// Sort keys, most significant first.
        keys: Vec<SortKey>,
    },
    /// Bounded sort keeping only the first `limit` rows.
    TopK {
        /// Sort keys, most significant first.
        keys: Vec<SortKey>,
        /// Rows retained, including any offset applied above.
        limit: usize,
    },
    /// OFFSET/LIMIT window.
    Slice {
        /// Rows to skip.
        offset: usize,
        /// Rows to keep.
        limit: Option<usize>,
    },
}

impl PhysicalOp {
    /// Operator name used in explain output and plan hashes.
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOp::Scan { .. } => "Scan",
            PhysicalOp::Values { .. } => "Values",
            PhysicalOp::Unit => "Unit",
            PhysicalOp::HashJoin { .. } => "HashJoin",
            PhysicalOp::NestedLoopJoin => "NestedLoopJoin",
            PhysicalOp::HashLeftJoin { .. } => "HashLeftJoin",
            PhysicalOp::NestedLoopLeftJoin { .. } => "NestedLoopLeftJoin",
            PhysicalOp::Union => "Union",
            PhysicalOp::Minus => "Minus",
            PhysicalOp::Filter { .. } => "Filter",
            PhysicalOp::Extend { .. } => "Extend",
            PhysicalOp::HashAggregate { .. } => "HashAggregate",
            PhysicalOp::Project { .. } => "Project",
            PhysicalOp::Distinct => "Distinct",
            PhysicalOp::Reduced => "Reduced",
            PhysicalOp::Sort { .. } => "Sort",
            PhysicalOp::TopK { .. } => "TopK",
            PhysicalOp::Slice { .. } => "Slice",
        }
    }
}
