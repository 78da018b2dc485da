//! Turns source descriptors into adapters before planning.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::SourceError;
use crate::source::{FileSource, MemoryGraph, RemoteOptions, SourceAdapter, SparqlEndpoint};

/// Declarative description of a data source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// RDF file loaded fully into an in-memory graph.
    Memory {
        /// File to load (`.nt`, `.nq` or `.ttl`).
        path: PathBuf,
    },
    /// RDF file streamed on every scan.
    File {
        /// File to stream (`.nt` or `.nq`).
        path: PathBuf,
    },
    /// Remote SPARQL endpoint.
    Sparql {
        /// Endpoint URL.
        endpoint: String,
        /// Client settings.
        options: RemoteOptions,
    },
}

impl SourceDescriptor {
    /// Descriptor for a command-line style source string.
    ///
    /// `http(s)://` URLs become endpoints, `mem:` prefixed paths are loaded
    /// into memory and anything else is streamed from disk.
    pub fn parse(value: &str) -> SourceDescriptor {
        if value.starts_with("http://") || value.starts_with("https://") {
            SourceDescriptor::Sparql {
                endpoint: value.to_owned(),
                options: RemoteOptions::default(),
            }
        } else if let Some(path) = value.strip_prefix("mem:") {
            SourceDescriptor::Memory { path: path.into() }
        } else {
            SourceDescriptor::File { path: value.into() }
        }
    }
}

/// Resolves descriptors to adapters.
pub trait SourceResolver: Send + Sync {
    /// Opens the adapter for `descriptor`. `budget` is the query's time
    /// budget, which bounds any network timeouts.
    fn resolve(
        &self,
        descriptor: &SourceDescriptor,
        budget: Option<Duration>,
    ) -> Result<Arc<dyn SourceAdapter>, SourceError>;
}

/// Resolver for the built-in adapters.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSourceResolver;

impl SourceResolver for DefaultSourceResolver {
    fn resolve(
        &self,
        descriptor: &SourceDescriptor,
        budget: Option<Duration>,
    ) -> Result<Arc<dyn SourceAdapter>, SourceError> {
        debug!(?descriptor, "source.resolve");
        Ok(match descriptor {
            SourceDescriptor::Memory { path } => Arc::new(MemoryGraph::from_path(path)?),
            SourceDescriptor::File { path } => Arc::new(FileSource::open(path)?),
            SourceDescriptor::Sparql { endpoint, options } => Arc::new(SparqlEndpoint::new(
                endpoint.clone(),
                options.clone().bounded_by(budget),
            )?),
        })
    }
}
