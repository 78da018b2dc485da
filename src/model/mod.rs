//! Core data model shared by every stage: terms, variables, quads and
//! solution bindings.

mod binding;
mod quad;
mod term;
pub mod vocab;

pub use binding::Binding;
pub use quad::{GraphName, GraphPattern, PatternShape, Quad, QuadPattern, TermPattern};
pub use term::{BlankNode, Iri, Literal, Term, Variable};
