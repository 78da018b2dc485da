//! File-backed source that re-reads its file on every scan.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use oxrdfio::{RdfFormat, RdfParser};
use tracing::debug;

use crate::error::{SourceError, SourceErrorKind};
use crate::model::vocab::xsd;
use crate::model::{BlankNode, GraphName, Iri, Literal, Quad, QuadPattern, Term};
use crate::source::{Capabilities, QuadScan, SourceAdapter};

/// RDF serialisations understood by the file-backed and in-memory sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    /// One triple per line.
    NTriples,
    /// One quad per line.
    NQuads,
    /// Turtle; only loadable, never streamed line by line.
    Turtle,
}

impl FileFormat {
    /// Guesses the format from a file extension.
    pub fn from_path(path: &Path) -> Option<FileFormat> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "nt" => Some(FileFormat::NTriples),
            "nq" => Some(FileFormat::NQuads),
            "ttl" => Some(FileFormat::Turtle),
            _ => None,
        }
    }

    pub(crate) fn rdf_format(self) -> RdfFormat {
        match self {
            FileFormat::NTriples => RdfFormat::NTriples,
            FileFormat::NQuads => RdfFormat::NQuads,
            FileFormat::Turtle => RdfFormat::Turtle,
        }
    }
}

/// Parses `reader` into model quads.
pub(crate) fn read_quads<R: Read>(
    source_name: &str,
    format: FileFormat,
    reader: R,
) -> impl Iterator<Item = Result<Quad, SourceError>> {
    let name = source_name.to_owned();
    RdfParser::from_format(format.rdf_format())
        .for_reader(reader)
        .map(move |parsed| match parsed {
            Ok(quad) => convert_quad(quad)
                .map_err(|message| SourceError::new(&name, SourceErrorKind::Parse, message)),
            Err(err) => Err(SourceError::new(&name, SourceErrorKind::Parse, err.to_string())),
        })
}

#[allow(unreachable_patterns)]
fn convert_quad(quad: oxrdf::Quad) -> Result<Quad, String> {
    let subject = match quad.subject {
        oxrdf::Subject::NamedNode(node) => Term::Iri(Iri::new(node.as_str())),
        oxrdf::Subject::BlankNode(node) => Term::BlankNode(BlankNode::new(node.as_str())),
        _ => return Err("quoted triples are not supported".to_owned()),
    };
    let predicate = Term::Iri(Iri::new(quad.predicate.as_str()));
    let object = match quad.object {
        oxrdf::Term::NamedNode(node) => Term::Iri(Iri::new(node.as_str())),
        oxrdf::Term::BlankNode(node) => Term::BlankNode(BlankNode::new(node.as_str())),
        oxrdf::Term::Literal(literal) => Term::Literal(convert_literal(&literal)),
        _ => return Err("quoted triples are not supported".to_owned()),
    };
    let graph = match quad.graph_name {
        oxrdf::GraphName::DefaultGraph => GraphName::DefaultGraph,
        oxrdf::GraphName::NamedNode(node) => GraphName::Named(Iri::new(node.as_str())),
        oxrdf::GraphName::BlankNode(node) => {
            return Err(format!("blank graph name _:{} is not supported", node.as_str()))
        }
    };
    Ok(Quad {
        subject,
        predicate,
        object,
        graph,
    })
}

fn convert_literal(literal: &oxrdf::Literal) -> Literal {
    if let Some(language) = literal.language() {
        return Literal::lang(literal.value(), language);
    }
    let datatype = literal.datatype().as_str();
    if datatype == xsd::STRING {
        Literal::simple(literal.value())
    } else {
        Literal::typed(literal.value(), Iri::new(datatype))
    }
}

/// Adapter over an N-Triples or N-Quads file.
///
/// Nothing is indexed: every scan streams the whole file. Counts are derived
/// from a line census taken when the source is opened.
#[derive(Debug)]
pub struct FileSource {
    name: String,
    path: PathBuf,
    format: FileFormat,
    lines: u64,
}

impl FileSource {
    /// Opens `path`, guessing the format from its extension.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let format = FileFormat::from_path(path).ok_or_else(|| {
            SourceError::new(
                path.display().to_string(),
                SourceErrorKind::Resolution,
                "unknown file extension; expected .nt or .nq",
            )
        })?;
        Self::with_format(path, format)
    }

    /// Opens `path` as `format`.
    pub fn with_format(path: impl AsRef<Path>, format: FileFormat) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();
        if format == FileFormat::Turtle {
            return Err(SourceError::new(
                name,
                SourceErrorKind::Unsupported,
                "turtle files cannot be streamed; load them into a memory graph",
            ));
        }
        let file = File::open(&path).map_err(|err| SourceError::io(&name, &err))?;
        let mut lines = 0u64;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| SourceError::io(&name, &err))?;
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                lines += 1;
            }
        }
        debug!(source = %name, lines, "source.file.opened");
        Ok(Self {
            name,
            path,
            format,
            lines,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceAdapter for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full_scan()
    }

    fn count(&self, pattern: &QuadPattern) -> Result<u64, SourceError> {
        let shape = pattern.shape(&Default::default());
        let bound = [shape.subject, shape.predicate, shape.object, shape.graph]
            .iter()
            .filter(|bound| **bound)
            .count();
        // Each constant slot is assumed to keep a tenth of the lines.
        let estimate = (self.lines as f64) / 10f64.powi(bound as i32);
        Ok(estimate.ceil().max(1.0) as u64)
    }

    fn scan(&self, pattern: &QuadPattern) -> Result<QuadScan, SourceError> {
        let file = File::open(&self.path).map_err(|err| SourceError::io(&self.name, &err))?;
        let pattern = pattern.clone();
        let quads = read_quads(&self.name, self.format, BufReader::new(file));
        Ok(Box::new(quads.filter_map(move |quad| match quad {
            Ok(quad) => pattern.matches(&quad).map(Ok),
            Err(err) => Some(Err(err)),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::model::{TermPattern, Variable};

    fn write_file(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("temp file");
        file.write_all(body.as_bytes()).expect("write");
        file
    }

    #[test]
    fn scans_matching_triples_and_counts_lines() {
        let file = write_file(
            ".nt",
            "# people\n\
             <http://ex/alice> <http://ex/name> \"Alice\" .\n\
             <http://ex/bob> <http://ex/name> \"Bob\"@en .\n\
             <http://ex/bob> <http://ex/age> \"42\"^^<http://www.w3.org/2001/XMLSchema#integer> .\n",
        );
        let source = FileSource::open(file.path()).expect("open");
        let pattern = QuadPattern::new(
            TermPattern::Variable(Variable::new("s")),
            Term::iri("http://ex/name"),
            TermPattern::Variable(Variable::new("n")),
        );
        let rows: Vec<_> = source
            .scan(&pattern)
            .expect("scan")
            .collect::<Result<_, _>>()
            .expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1].get_str("n"),
            Some(&Term::Literal(Literal::lang("Bob", "en")))
        );
        let open = QuadPattern::new(
            TermPattern::Variable(Variable::new("s")),
            TermPattern::Variable(Variable::new("p")),
            TermPattern::Variable(Variable::new("o")),
        );
        assert_eq!(source.count(&open).expect("count"), 3);
    }

    #[test]
    fn malformed_line_surfaces_parse_error_mid_scan() {
        let file = write_file(
            ".nt",
            "<http://ex/a> <http://ex/p> <http://ex/b> .\nthis is not rdf\n",
        );
        let source = FileSource::open(file.path()).expect("open");
        let pattern = QuadPattern::new(
            TermPattern::Variable(Variable::new("s")),
            TermPattern::Variable(Variable::new("p")),
            TermPattern::Variable(Variable::new("o")),
        );
        let mut scan = source.scan(&pattern).expect("scan");
        assert!(matches!(scan.next(), Some(Ok(_))));
        let err = scan
            .find_map(|item| item.err())
            .expect("parse error");
        assert_eq!(err.kind, SourceErrorKind::Parse);
    }

    #[test]
    fn unknown_extension_is_a_resolution_error() {
        let file = write_file(".csv", "a,b,c\n");
        let err = FileSource::open(file.path()).expect_err("rejected");
        assert_eq!(err.kind, SourceErrorKind::Resolution);
    }
}
