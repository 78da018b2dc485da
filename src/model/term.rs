//! RDF terms and query variables.

use std::fmt;
use std::sync::Arc;

use crate::model::vocab::{rdf, xsd};

/// Absolute IRI reference.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Iri(Arc<str>);

impl Iri {
    /// Wraps an IRI string without validation.
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    /// Returns the IRI text without angle brackets.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Iri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

/// Blank node identifier, scoped to the source or result that produced it.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlankNode(Arc<str>);

impl BlankNode {
    /// Creates a blank node with the supplied label.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the label without the `_:` prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlankNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_:{}", self.0)
    }
}

/// Literal with lexical form, datatype and optional language tag.
///
/// Language-tagged literals always carry `rdf:langString` as datatype and the
/// tag is stored lowercased so that term equality matches RDF semantics.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Literal {
    value: Arc<str>,
    datatype: Iri,
    language: Option<Arc<str>>,
}

impl Literal {
    /// Simple literal (`xsd:string`).
    pub fn simple(value: impl Into<Arc<str>>) -> Self {
        Self {
            value: value.into(),
            datatype: Iri::new(xsd::STRING),
            language: None,
        }
    }

    /// Literal with an explicit datatype.
    pub fn typed(value: impl Into<Arc<str>>, datatype: Iri) -> Self {
        Self {
            value: value.into(),
            datatype,
            language: None,
        }
    }

    /// Language-tagged string.
    pub fn lang(value: impl Into<Arc<str>>, language: &str) -> Self {
        Self {
            value: value.into(),
            datatype: Iri::new(rdf::LANG_STRING),
            language: Some(language.to_ascii_lowercase().into()),
        }
    }

    /// `xsd:integer` literal.
    pub fn integer(value: i64) -> Self {
        Self::typed(value.to_string(), Iri::new(xsd::INTEGER))
    }

    /// `xsd:decimal` literal using the canonical lexical form.
    pub fn decimal(value: f64) -> Self {
        let mut text = format!("{value}");
        if !text.contains('.') && !text.contains('e') && !text.contains("inf") && !text.contains("NaN") {
            text.push_str(".0");
        }
        Self::typed(text, Iri::new(xsd::DECIMAL))
    }

    /// `xsd:double` literal.
    pub fn double(value: f64) -> Self {
        let text = if value.is_nan() {
            "NaN".to_owned()
        } else if value.is_infinite() {
            if value > 0.0 { "INF" } else { "-INF" }.to_owned()
        } else {
            format!("{value:E}")
        };
        Self::typed(text, Iri::new(xsd::DOUBLE))
    }

    /// `xsd:boolean` literal.
    pub fn boolean(value: bool) -> Self {
        Self::typed(if value { "true" } else { "false" }, Iri::new(xsd::BOOLEAN))
    }

    /// Lexical form.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Datatype IRI.
    pub fn datatype(&self) -> &Iri {
        &self.datatype
    }

    /// Language tag, if any.
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Plain `xsd:string` literal without a language tag.
    pub fn is_simple(&self) -> bool {
        self.language.is_none() && self.datatype.as_str() == xsd::STRING
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for ch in self.value.chars() {
            match ch {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                '\n' => f.write_str("\\n")?,
                '\r' => f.write_str("\\r")?,
                '\t' => f.write_str("\\t")?,
                other => write!(f, "{other}")?,
            }
        }
        f.write_str("\"")?;
        if let Some(lang) = &self.language {
            write!(f, "@{lang}")
        } else if self.datatype.as_str() == xsd::STRING {
            Ok(())
        } else {
            write!(f, "^^{}", self.datatype)
        }
    }
}

/// Concrete RDF term bound to a variable or stored in a source.
///
/// The derived ordering is structural and only used for indexes and
/// deterministic containers; query-level ordering lives in the expression
/// evaluator.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Term {
    /// IRI reference.
    Iri(Iri),
    /// Blank node.
    BlankNode(BlankNode),
    /// Literal value.
    Literal(Literal),
}

impl Term {
    /// Shorthand for an IRI term.
    pub fn iri(value: impl Into<Arc<str>>) -> Self {
        Term::Iri(Iri::new(value))
    }

    /// Shorthand for a blank node term.
    pub fn blank(id: impl Into<Arc<str>>) -> Self {
        Term::BlankNode(BlankNode::new(id))
    }

    /// Shorthand for a simple literal term.
    pub fn literal(value: impl Into<Arc<str>>) -> Self {
        Term::Literal(Literal::simple(value))
    }

    /// Returns the literal payload if this is a literal.
    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Term::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    /// Returns the IRI if this is an IRI.
    pub fn as_iri(&self) -> Option<&Iri> {
        match self {
            Term::Iri(iri) => Some(iri),
            _ => None,
        }
    }

    /// Whether this term may appear in subject position.
    pub fn is_resource(&self) -> bool {
        !matches!(self, Term::Literal(_))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => fmt::Display::fmt(iri, f),
            Term::BlankNode(node) => fmt::Display::fmt(node, f),
            Term::Literal(lit) => fmt::Display::fmt(lit, f),
        }
    }
}

impl From<Iri> for Term {
    fn from(value: Iri) -> Self {
        Term::Iri(value)
    }
}

impl From<Literal> for Term {
    fn from(value: Literal) -> Self {
        Term::Literal(value)
    }
}

impl From<BlankNode> for Term {
    fn from(value: BlankNode) -> Self {
        Term::BlankNode(value)
    }
}

/// Query variable.
///
/// Names beginning with `#` are reserved for variables the translator
/// introduces (anonymous blank nodes, aggregate slots). They cannot be written
/// in query text and are filtered from `SELECT *` output.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Variable(Arc<str>);

impl Variable {
    /// Creates a variable from its name (without `?`).
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// Creates a translator-internal variable.
    pub fn hidden(kind: &str, index: usize) -> Self {
        Self(format!("#{kind}{index}").into())
    }

    /// Variable name without the leading `?`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the variable was introduced by the translator.
    pub fn is_hidden(&self) -> bool {
        self.0.starts_with('#')
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_display_uses_ntriples_syntax() {
        assert_eq!(Literal::simple("a\"b").to_string(), "\"a\\\"b\"");
        assert_eq!(Literal::lang("chat", "FR").to_string(), "\"chat\"@fr");
        assert_eq!(
            Literal::integer(42).to_string(),
            "\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>"
        );
    }

    #[test]
    fn language_tags_compare_case_insensitively() {
        assert_eq!(Literal::lang("x", "EN-gb"), Literal::lang("x", "en-GB"));
    }

    #[test]
    fn hidden_variables_are_flagged() {
        assert!(Variable::hidden("b", 3).is_hidden());
        assert!(!Variable::new("s").is_hidden());
    }

    #[test]
    fn decimal_keeps_fraction_marker() {
        assert_eq!(Literal::decimal(2.0).value(), "2.0");
        assert_eq!(Literal::decimal(2.5).value(), "2.5");
    }
}
