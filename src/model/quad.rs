//! Quads and quad patterns.

use std::collections::BTreeSet;
use std::fmt;

use crate::model::binding::Binding;
use crate::model::term::{Iri, Term, Variable};

/// Graph component of a stored quad.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum GraphName {
    /// The default graph.
    DefaultGraph,
    /// A named graph.
    Named(Iri),
}

impl fmt::Display for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphName::DefaultGraph => f.write_str("DEFAULT"),
            GraphName::Named(iri) => fmt::Display::fmt(iri, f),
        }
    }
}

/// Subject, predicate, object and graph.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Quad {
    /// Subject term.
    pub subject: Term,
    /// Predicate term.
    pub predicate: Term,
    /// Object term.
    pub object: Term,
    /// Graph the quad belongs to.
    pub graph: GraphName,
}

impl Quad {
    /// Quad in the default graph.
    pub fn triple(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
            graph: GraphName::DefaultGraph,
        }
    }

    /// Quad in a named graph.
    pub fn in_graph(subject: Term, predicate: Term, object: Term, graph: Iri) -> Self {
        Self {
            subject,
            predicate,
            object,
            graph: GraphName::Named(graph),
        }
    }
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)?;
        if let GraphName::Named(graph) = &self.graph {
            write!(f, " {graph}")?;
        }
        f.write_str(" .")
    }
}

/// A pattern slot: either a fixed term or a variable.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TermPattern {
    /// Constant term.
    Term(Term),
    /// Variable to bind.
    Variable(Variable),
}

impl TermPattern {
    /// Returns the variable if the slot is not constant.
    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            TermPattern::Variable(var) => Some(var),
            TermPattern::Term(_) => None,
        }
    }

    fn substitute(&self, binding: &Binding) -> TermPattern {
        match self {
            TermPattern::Variable(var) => match binding.get(var) {
                Some(term) => TermPattern::Term(term.clone()),
                None => self.clone(),
            },
            TermPattern::Term(_) => self.clone(),
        }
    }

    fn is_bound(&self, bound: &BTreeSet<Variable>) -> bool {
        match self {
            TermPattern::Term(_) => true,
            TermPattern::Variable(var) => bound.contains(var),
        }
    }
}

impl From<Term> for TermPattern {
    fn from(value: Term) -> Self {
        TermPattern::Term(value)
    }
}

impl From<Variable> for TermPattern {
    fn from(value: Variable) -> Self {
        TermPattern::Variable(value)
    }
}

impl fmt::Display for TermPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermPattern::Term(term) => fmt::Display::fmt(term, f),
            TermPattern::Variable(var) => fmt::Display::fmt(var, f),
        }
    }
}

/// Graph slot of a quad pattern.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum GraphPattern {
    /// Matches the default graph only.
    DefaultGraph,
    /// Matches one named graph.
    Named(Iri),
    /// Ranges over the named graphs.
    Variable(Variable),
}

impl fmt::Display for GraphPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphPattern::DefaultGraph => f.write_str("DEFAULT"),
            GraphPattern::Named(iri) => fmt::Display::fmt(iri, f),
            GraphPattern::Variable(var) => fmt::Display::fmt(var, f),
        }
    }
}

/// Which slots of a pattern are bound at evaluation time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct PatternShape {
    /// Subject is constant or bound by an outer binding.
    pub subject: bool,
    /// Predicate is bound.
    pub predicate: bool,
    /// Object is bound.
    pub object: bool,
    /// Graph is bound (a named IRI or an outer-bound graph variable).
    pub graph: bool,
}

impl PatternShape {
    /// Whether every slot `required` binds is also bound here.
    pub fn covers(&self, required: &PatternShape) -> bool {
        (!required.subject || self.subject)
            && (!required.predicate || self.predicate)
            && (!required.object || self.object)
            && (!required.graph || self.graph)
    }
}

impl fmt::Display for PatternShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = |bound: bool, ch: char| if bound { ch } else { '?' };
        write!(
            f,
            "{}{}{}{}",
            slot(self.subject, 'S'),
            slot(self.predicate, 'P'),
            slot(self.object, 'O'),
            slot(self.graph, 'G')
        )
    }
}

/// Triple/quad pattern matched against a source.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QuadPattern {
    /// Subject slot.
    pub subject: TermPattern,
    /// Predicate slot.
    pub predicate: TermPattern,
    /// Object slot.
    pub object: TermPattern,
    /// Graph slot.
    pub graph: GraphPattern,
}

impl QuadPattern {
    /// Pattern over the default graph.
    pub fn new(
        subject: impl Into<TermPattern>,
        predicate: impl Into<TermPattern>,
        object: impl Into<TermPattern>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            graph: GraphPattern::DefaultGraph,
        }
    }

    /// Replaces the graph slot.
    pub fn in_graph(mut self, graph: GraphPattern) -> Self {
        self.graph = graph;
        self
    }

    /// Distinct variables of the pattern in slot order.
    pub fn variables(&self) -> Vec<Variable> {
        let mut out: Vec<Variable> = Vec::with_capacity(4);
        let graph_var = match &self.graph {
            GraphPattern::Variable(var) => Some(var),
            _ => None,
        };
        for var in [
            self.subject.as_variable(),
            self.predicate.as_variable(),
            self.object.as_variable(),
            graph_var,
        ]
        .into_iter()
        .flatten()
        {
            if !out.contains(var) {
                out.push(var.clone());
            }
        }
        out
    }

    /// Shape given the variables an outer binding will supply.
    pub fn shape(&self, bound: &BTreeSet<Variable>) -> PatternShape {
        PatternShape {
            subject: self.subject.is_bound(bound),
            predicate: self.predicate.is_bound(bound),
            object: self.object.is_bound(bound),
            graph: match &self.graph {
                GraphPattern::DefaultGraph => false,
                GraphPattern::Named(_) => true,
                GraphPattern::Variable(var) => bound.contains(var),
            },
        }
    }

    /// Replaces variables bound in `binding` with their terms.
    ///
    /// A graph variable bound to something other than an IRI can never match;
    /// `None` is returned in that case.
    pub fn substitute(&self, binding: &Binding) -> Option<QuadPattern> {
        let graph = match &self.graph {
            GraphPattern::Variable(var) => match binding.get(var) {
                Some(Term::Iri(iri)) => GraphPattern::Named(iri.clone()),
                Some(_) => return None,
                None => self.graph.clone(),
            },
            other => other.clone(),
        };
        Some(QuadPattern {
            subject: self.subject.substitute(binding),
            predicate: self.predicate.substitute(binding),
            object: self.object.substitute(binding),
            graph,
        })
    }

    /// Matches a quad, producing the binding of the pattern's variables.
    ///
    /// A variable repeated across slots must bind the same term everywhere.
    pub fn matches(&self, quad: &Quad) -> Option<Binding> {
        let mut binding = Binding::new();
        bind_slot(&self.subject, &quad.subject, &mut binding)?;
        bind_slot(&self.predicate, &quad.predicate, &mut binding)?;
        bind_slot(&self.object, &quad.object, &mut binding)?;
        match (&self.graph, &quad.graph) {
            (GraphPattern::DefaultGraph, GraphName::DefaultGraph) => {}
            (GraphPattern::Named(want), GraphName::Named(have)) if want == have => {}
            (GraphPattern::Variable(var), GraphName::Named(have)) => {
                bind_slot(
                    &TermPattern::Variable(var.clone()),
                    &Term::Iri(have.clone()),
                    &mut binding,
                )?;
            }
            _ => return None,
        }
        Some(binding)
    }
}

fn bind_slot(slot: &TermPattern, term: &Term, binding: &mut Binding) -> Option<()> {
    match slot {
        TermPattern::Term(expected) => (expected == term).then_some(()),
        TermPattern::Variable(var) => match binding.get(var) {
            Some(existing) => (existing == term).then_some(()),
            None => {
                binding.insert(var.clone(), term.clone());
                Some(())
            }
        },
    }
}

impl fmt::Display for QuadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.graph {
            GraphPattern::DefaultGraph => {
                write!(f, "{} {} {}", self.subject, self.predicate, self.object)
            }
            graph => write!(
                f,
                "GRAPH {graph} {{ {} {} {} }}",
                self.subject, self.predicate, self.object
            ),
        }
    }
}
