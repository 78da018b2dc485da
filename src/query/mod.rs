//! Query pipeline stages, from query text to streamed solutions.

/// Abstract syntax tree produced by the parser.
pub mod ast;

/// Algebra operator tree shared by the translator, optimizer and planner.
pub mod algebra;

/// Stage-specific error types.
pub mod errors;

/// Pull-based execution of physical plans.
///
/// Every operator checks cancellation and the deadline before pulling from
/// its children.
pub mod executor;

/// Expression evaluation: FILTER, BIND, ORDER BY keys and aggregates.
pub mod expr;

/// Tokenizer for query text.
pub mod lexer;

/// Logical rewrites applied until a fixpoint.
pub mod optimizer;

/// Recursive-descent parser.
pub mod parser;

/// Physical operator tree.
pub mod physical;

/// Physical plan selection, explain output and plan hashing.
pub mod planner;

/// Opt-in per-stage profiling counters.
pub mod profile;

/// Cardinality estimation.
pub mod stats;

/// Lowering of the AST to algebra.
pub mod translate;

pub use parser::parse;
pub use planner::{PlanExplain, PlannerOutput};
