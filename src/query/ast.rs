//! Abstract syntax tree for the supported query language subset.
//!
//! The parser produces these structures with prefixes already expanded and
//! relative IRIs resolved. Scoping is not checked here; the translator lowers
//! the tree into algebra and rejects scoping violations.

use crate::model::{Iri, Term, Variable};
use crate::query::expr::Expression;

/// Expression as written in the query: EXISTS bodies are still graph patterns.
pub type AstExpression = Expression<GroupPattern>;

/// Parsed query.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// Query form and its form-specific parts.
    pub form: QueryForm,
    /// WHERE clause. Empty for `DESCRIBE <iri>` without WHERE.
    pub pattern: GroupPattern,
    /// GROUP BY, HAVING, ORDER BY, LIMIT and OFFSET.
    pub modifiers: SolutionModifiers,
    /// Trailing VALUES block.
    pub values: Option<InlineData>,
}

/// SELECT, CONSTRUCT, ASK or DESCRIBE.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryForm {
    /// Tabular results.
    Select {
        /// DISTINCT/REDUCED modifier.
        modifier: SelectModifier,
        /// Projection list.
        projection: Projection,
    },
    /// Graph built from a template per solution.
    Construct {
        /// Triples to instantiate.
        template: Vec<TriplePattern>,
    },
    /// Whether any solution exists.
    Ask,
    /// Description of resources. An empty target list means `DESCRIBE *`.
    Describe {
        /// Resources to describe.
        targets: Vec<VarOrIri>,
    },
}

/// Duplicate handling requested in a SELECT clause.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectModifier {
    /// Keep duplicates.
    #[default]
    None,
    /// Remove duplicates.
    Distinct,
    /// Duplicates may be removed.
    Reduced,
}

/// SELECT projection.
#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    /// `SELECT *`.
    All,
    /// Explicit item list.
    Items(Vec<SelectItem>),
}

/// Single projection item.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectItem {
    /// Plain variable.
    Variable(Variable),
    /// `(expr AS ?alias)`.
    Expression {
        /// Computed expression.
        expr: AstExpression,
        /// Output variable.
        alias: Variable,
    },
}

/// Solution modifiers following the WHERE clause.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SolutionModifiers {
    /// GROUP BY conditions.
    pub group_by: Vec<GroupCondition>,
    /// HAVING constraints, conjunctive.
    pub having: Vec<AstExpression>,
    /// ORDER BY keys.
    pub order_by: Vec<OrderCondition>,
    /// LIMIT.
    pub limit: Option<usize>,
    /// OFFSET.
    pub offset: Option<usize>,
}

/// GROUP BY key.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupCondition {
    /// Group by a variable.
    Variable(Variable),
    /// Group by an expression, optionally named.
    Expression(AstExpression, Option<Variable>),
}

/// ORDER BY key.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderCondition {
    /// Sort key.
    pub expr: AstExpression,
    /// Descending order.
    pub descending: bool,
}

/// Variable or IRI (GRAPH names, DESCRIBE targets).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VarOrIri {
    /// Variable.
    Variable(Variable),
    /// Constant IRI.
    Iri(Iri),
}

/// Slot of a triple pattern as written.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PatternTerm {
    /// Constant term.
    Term(Term),
    /// Named variable.
    Variable(Variable),
    /// Blank node label; behaves as a hidden variable in WHERE clauses and as
    /// a fresh blank node in CONSTRUCT templates.
    BlankNode(String),
}

/// Triple pattern.
#[derive(Clone, Debug, PartialEq)]
pub struct TriplePattern {
    /// Subject.
    pub subject: PatternTerm,
    /// Predicate.
    pub predicate: PatternTerm,
    /// Object.
    pub object: PatternTerm,
}

/// `{ ... }` group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupPattern {
    /// Elements in textual order.
    pub elements: Vec<PatternElement>,
}

/// Element of a group graph pattern.
#[derive(Clone, Debug, PartialEq)]
pub enum PatternElement {
    /// Block of triples.
    Triples(Vec<TriplePattern>),
    /// `OPTIONAL { }`.
    Optional(GroupPattern),
    /// `{ } UNION { } ...`.
    Union(Vec<GroupPattern>),
    /// `MINUS { }`.
    Minus(GroupPattern),
    /// `FILTER (expr)`.
    Filter(AstExpression),
    /// `BIND (expr AS ?v)`.
    Bind(AstExpression, Variable),
    /// `GRAPH (iri|?v) { }`.
    Graph(VarOrIri, GroupPattern),
    /// Inline `VALUES`.
    Values(InlineData),
    /// Nested `{ }`.
    Group(GroupPattern),
    /// Nested `{ SELECT ... }`.
    SubSelect(Box<Query>),
}

/// VALUES block; `None` cells are `UNDEF`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineData {
    /// Column variables.
    pub variables: Vec<Variable>,
    /// Rows, one cell per variable.
    pub rows: Vec<Vec<Option<Term>>>,
}
