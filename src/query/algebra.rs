//! Algebra operator tree produced by the translator and rewritten by the
//! optimizer before physical planning.

use std::collections::BTreeSet;
use std::fmt;

use crate::model::{Binding, QuadPattern, Variable};
use crate::query::expr::{Aggregate, Expression};

/// Expression whose `EXISTS` bodies are algebra trees.
pub type AlgebraExpr = Expression<AlgebraNode>;

/// Node within the algebra tree. Children are exclusively owned.
#[derive(Clone, Debug, PartialEq)]
pub struct AlgebraNode {
    /// The operator at this node.
    pub op: AlgebraOp,
    /// Child nodes that provide input to this operator.
    pub inputs: Vec<AlgebraNode>,
}

/// Sort key of an `OrderBy`.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderKey {
    /// Key expression.
    pub expr: AlgebraExpr,
    /// Descending order.
    pub descending: bool,
}

/// Algebra operators.
///
/// Arity: `Pattern`, `Values` and `Unit` are leaves; `LeftJoin` and `Minus`
/// take `[left, right]`; `Join` and `Union` are n-ary; the rest are unary.
#[derive(Clone, Debug, PartialEq)]
pub enum AlgebraOp {
    /// Quad pattern matched against the sources.
    Pattern(QuadPattern),
    /// Natural join of all inputs.
    Join,
    /// Left outer join with an optional filter over the joined row.
    LeftJoin {
        /// Condition from the OPTIONAL group's filters.
        expr: Option<AlgebraExpr>,
    },
    /// Bag union of all inputs.
    Union,
    /// Left rows with no compatible, variable-sharing right row.
    Minus,
    /// Keeps rows whose expression is true.
    Filter {
        /// Condition.
        expr: AlgebraExpr,
    },
    /// Binds `var` to the expression value (left unbound on error).
    Extend {
        /// Target variable.
        var: Variable,
        /// Computed value.
        expr: AlgebraExpr,
    },
    /// Groups on `keys` and computes aggregates per group.
    Group {
        /// Grouping variables.
        keys: Vec<Variable>,
        /// Aggregate outputs.
        aggregates: Vec<(Variable, Aggregate<AlgebraNode>)>,
    },
    /// Inline rows.
    Values {
        /// Column variables.
        variables: Vec<Variable>,
        /// Rows; unbound cells are absent from the binding.
        rows: Vec<Binding>,
    },
    /// Single empty solution.
    Unit,
    /// Restricts rows to the listed variables.
    Project {
        /// Output variables.
        variables: Vec<Variable>,
    },
    /// Removes duplicate rows.
    Distinct,
    /// May remove duplicate rows.
    Reduced,
    /// Stable sort.
    OrderBy {
        /// Sort keys, most significant first.
        keys: Vec<OrderKey>,
    },
    /// OFFSET/LIMIT window.
    Slice {
        /// Rows to skip.
        offset: usize,
        /// Rows to keep.
        limit: Option<usize>,
    },
}

impl AlgebraNode {
    /// Creates a leaf node.
    pub fn new(op: AlgebraOp) -> Self {
        Self {
            op,
            inputs: Vec::new(),
        }
    }

    /// Creates a node with the given inputs.
    pub fn with_inputs(op: AlgebraOp, inputs: Vec<AlgebraNode>) -> Self {
        Self { op, inputs }
    }

    /// Single empty solution.
    pub fn unit() -> Self {
        Self::new(AlgebraOp::Unit)
    }

    /// Pattern leaf.
    pub fn pattern(pattern: QuadPattern) -> Self {
        Self::new(AlgebraOp::Pattern(pattern))
    }

    /// Unary node over `input`.
    pub fn unary(op: AlgebraOp, input: AlgebraNode) -> Self {
        Self::with_inputs(op, vec![input])
    }

    /// Joins two trees, absorbing `Unit` and extending an existing n-ary join
    /// on the left.
    pub fn join(left: AlgebraNode, right: AlgebraNode) -> Self {
        match (left, right) {
            (AlgebraNode { op: AlgebraOp::Unit, .. }, right) => right,
            (left, AlgebraNode { op: AlgebraOp::Unit, .. }) => left,
            (
                AlgebraNode {
                    op: AlgebraOp::Join,
                    mut inputs,
                },
                right,
            ) => {
                inputs.push(right);
                Self::with_inputs(AlgebraOp::Join, inputs)
            }
            (left, right) => Self::with_inputs(AlgebraOp::Join, vec![left, right]),
        }
    }

    /// Whether the node is the single-empty-solution leaf.
    pub fn is_unit(&self) -> bool {
        matches!(self.op, AlgebraOp::Unit)
    }

    /// Variables that may be bound in some output row.
    pub fn possible_variables(&self) -> BTreeSet<Variable> {
        let mut out = BTreeSet::new();
        self.collect_possible(&mut out);
        out
    }

    fn collect_possible(&self, out: &mut BTreeSet<Variable>) {
        match &self.op {
            AlgebraOp::Pattern(pattern) => out.extend(pattern.variables()),
            AlgebraOp::Join | AlgebraOp::Union | AlgebraOp::LeftJoin { .. } => {
                self.inputs.iter().for_each(|input| input.collect_possible(out));
            }
            AlgebraOp::Minus => {
                if let Some(left) = self.inputs.first() {
                    left.collect_possible(out);
                }
            }
            AlgebraOp::Extend { var, .. } => {
                self.inputs.iter().for_each(|input| input.collect_possible(out));
                out.insert(var.clone());
            }
            AlgebraOp::Group { keys, aggregates } => {
                out.extend(keys.iter().cloned());
                out.extend(aggregates.iter().map(|(var, _)| var.clone()));
            }
            AlgebraOp::Values { variables, .. } => out.extend(variables.iter().cloned()),
            AlgebraOp::Unit => {}
            AlgebraOp::Project { variables } => out.extend(variables.iter().cloned()),
            AlgebraOp::Filter { .. }
            | AlgebraOp::Distinct
            | AlgebraOp::Reduced
            | AlgebraOp::OrderBy { .. }
            | AlgebraOp::Slice { .. } => {
                self.inputs.iter().for_each(|input| input.collect_possible(out));
            }
        }
    }

    /// Variables bound in every output row.
    pub fn certain_variables(&self) -> BTreeSet<Variable> {
        match &self.op {
            AlgebraOp::Pattern(pattern) => pattern.variables().into_iter().collect(),
            AlgebraOp::Join => self
                .inputs
                .iter()
                .flat_map(|input| input.certain_variables())
                .collect(),
            AlgebraOp::LeftJoin { .. } | AlgebraOp::Minus => self
                .inputs
                .first()
                .map(AlgebraNode::certain_variables)
                .unwrap_or_default(),
            AlgebraOp::Union => {
                let mut iter = self.inputs.iter().map(AlgebraNode::certain_variables);
                let first = iter.next().unwrap_or_default();
                iter.fold(first, |acc, next| acc.intersection(&next).cloned().collect())
            }
            AlgebraOp::Group { keys, .. } => {
                let input = self
                    .inputs
                    .first()
                    .map(AlgebraNode::certain_variables)
                    .unwrap_or_default();
                keys.iter().filter(|key| input.contains(*key)).cloned().collect()
            }
            AlgebraOp::Values { variables, rows } => variables
                .iter()
                .filter(|var| rows.iter().all(|row| row.contains(var)))
                .cloned()
                .collect(),
            AlgebraOp::Unit => BTreeSet::new(),
            AlgebraOp::Project { variables } => {
                let input = self
                    .inputs
                    .first()
                    .map(AlgebraNode::certain_variables)
                    .unwrap_or_default();
                variables.iter().filter(|v| input.contains(*v)).cloned().collect()
            }
            AlgebraOp::Filter { .. }
            | AlgebraOp::Extend { .. }
            | AlgebraOp::Distinct
            | AlgebraOp::Reduced
            | AlgebraOp::OrderBy { .. }
            | AlgebraOp::Slice { .. } => self
                .inputs
                .first()
                .map(AlgebraNode::certain_variables)
                .unwrap_or_default(),
        }
    }

    /// Number of nodes in the tree, excluding `EXISTS` bodies.
    pub fn size(&self) -> usize {
        1 + self.inputs.iter().map(AlgebraNode::size).sum::<usize>()
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}", "", indent = depth * 2)?;
        match &self.op {
            AlgebraOp::Pattern(pattern) => write!(f, "Pattern({pattern})")?,
            AlgebraOp::Join => f.write_str("Join")?,
            AlgebraOp::LeftJoin { expr: Some(expr) } => write!(f, "LeftJoin({expr})")?,
            AlgebraOp::LeftJoin { expr: None } => f.write_str("LeftJoin")?,
            AlgebraOp::Union => f.write_str("Union")?,
            AlgebraOp::Minus => f.write_str("Minus")?,
            AlgebraOp::Filter { expr } => write!(f, "Filter({expr})")?,
            AlgebraOp::Extend { var, expr } => write!(f, "Extend({var} := {expr})")?,
            AlgebraOp::Group { keys, aggregates } => {
                f.write_str("Group(")?;
                write_vars(f, keys)?;
                for (var, agg) in aggregates {
                    write!(f, "; {var} := {}", Expression::Aggregate(Box::new(agg.clone())))?;
                }
                f.write_str(")")?;
            }
            AlgebraOp::Values { variables, rows } => {
                f.write_str("Values(")?;
                write_vars(f, variables)?;
                write!(f, "; {} rows)", rows.len())?;
            }
            AlgebraOp::Unit => f.write_str("Unit")?,
            AlgebraOp::Project { variables } => {
                f.write_str("Project(")?;
                write_vars(f, variables)?;
                f.write_str(")")?;
            }
            AlgebraOp::Distinct => f.write_str("Distinct")?,
            AlgebraOp::Reduced => f.write_str("Reduced")?,
            AlgebraOp::OrderBy { keys } => {
                f.write_str("OrderBy(")?;
                for (idx, key) in keys.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    let dir = if key.descending { "DESC" } else { "ASC" };
                    write!(f, "{dir} {}", key.expr)?;
                }
                f.write_str(")")?;
            }
            AlgebraOp::Slice { offset, limit } => match limit {
                Some(limit) => write!(f, "Slice(offset={offset}, limit={limit})")?,
                None => write!(f, "Slice(offset={offset})")?,
            },
        }
        writeln!(f)?;
        for input in &self.inputs {
            input.fmt_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

fn write_vars(f: &mut fmt::Formatter<'_>, vars: &[Variable]) -> fmt::Result {
    for (idx, var) in vars.iter().enumerate() {
        if idx > 0 {
            f.write_str(" ")?;
        }
        fmt::Display::fmt(var, f)?;
    }
    Ok(())
}

impl fmt::Display for AlgebraNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}
