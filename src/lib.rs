//! Sparrow: a modular, pull-based SPARQL query engine.
//!
//! Queries flow through a fixed pipeline of stages: the parser produces an
//! AST, the translator lowers it to an algebra tree, the optimizer rewrites
//! that tree, the planner picks algorithms and source adapters, and the
//! executor evaluates the plan lazily as results are pulled.
//!
//! ```no_run
//! use sparrow::{QueryContext, QueryEngine, SourceDescriptor};
//!
//! let engine = QueryEngine::new();
//! let context = QueryContext::new().with_descriptor(SourceDescriptor::parse("people.nt"));
//! let mut results = engine.query("SELECT ?s WHERE { ?s ?p ?o } LIMIT 10", &context)?;
//! for row in results.bindings()? {
//!     println!("{}", row?);
//! }
//! # Ok::<(), sparrow::QueryError>(())
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod engine;
pub mod error;
pub mod model;
pub mod query;
pub mod source;

pub use engine::{EngineConfig, QueryContext, QueryEngine, ResultHandle, SourceSpec};
pub use error::{QueryError, Result, SourceError, SourceErrorKind};
pub use model::{Binding, Quad, QuadPattern, Term, Variable};
pub use query::executor::{CancelHandle, Pulled, StreamState};
pub use query::translate::QueryKind;
pub use source::{MemoryGraph, SourceAdapter, SourceDescriptor};
