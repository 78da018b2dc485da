//! Solution mappings.

use std::collections::BTreeMap;
use std::fmt;

use crate::model::term::{Term, Variable};

/// One solution: an immutable mapping from variables to terms.
///
/// Entries are kept ordered by variable name so iteration and display are
/// deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binding {
    entries: BTreeMap<Variable, Term>,
}

impl Binding {
    /// Empty binding (the join identity).
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this binding extended with `var -> term`.
    pub fn with(mut self, var: impl Into<Variable>, term: impl Into<Term>) -> Self {
        self.entries.insert(var.into(), term.into());
        self
    }

    pub(crate) fn insert(&mut self, var: Variable, term: Term) {
        self.entries.insert(var, term);
    }

    pub(crate) fn remove(&mut self, var: &Variable) -> Option<Term> {
        self.entries.remove(var)
    }

    /// Value bound to `var`, if any.
    pub fn get(&self, var: &Variable) -> Option<&Term> {
        self.entries.get(var)
    }

    /// Lookup by variable name.
    pub fn get_str(&self, name: &str) -> Option<&Term> {
        self.entries
            .iter()
            .find(|(var, _)| var.as_str() == name)
            .map(|(_, term)| term)
    }

    /// Whether `var` is bound.
    pub fn contains(&self, var: &Variable) -> bool {
        self.entries.contains_key(var)
    }

    /// Iterates bound variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &Term)> {
        self.entries.iter()
    }

    /// Bound variables in name order.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.entries.keys()
    }

    /// Number of bound variables.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no variable is bound.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Two bindings are compatible when every shared variable maps to the
    /// same term.
    pub fn is_compatible(&self, other: &Binding) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small
            .entries
            .iter()
            .all(|(var, term)| large.entries.get(var).map_or(true, |other| other == term))
    }

    /// Union of two compatible bindings, or `None` when they disagree.
    pub fn merge(&self, other: &Binding) -> Option<Binding> {
        if !self.is_compatible(other) {
            return None;
        }
        let (mut base, extra) = if self.len() >= other.len() {
            (self.clone(), other)
        } else {
            (other.clone(), self)
        };
        for (var, term) in &extra.entries {
            base.entries
                .entry(var.clone())
                .or_insert_with(|| term.clone());
        }
        Some(base)
    }

    /// Restricts the binding to `vars`.
    pub fn project(&self, vars: &[Variable]) -> Binding {
        let entries = vars
            .iter()
            .filter_map(|var| self.entries.get(var).map(|term| (var.clone(), term.clone())))
            .collect();
        Binding { entries }
    }

    /// Drops translator-internal variables.
    pub fn without_hidden(mut self) -> Binding {
        self.entries.retain(|var, _| !var.is_hidden());
        self
    }
}

impl FromIterator<(Variable, Term)> for Binding {
    fn from_iter<I: IntoIterator<Item = (Variable, Term)>>(iter: I) -> Self {
        Binding {
            entries: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (var, term)) in self.entries.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{var} -> {term}")?;
        }
        f.write_str("}")
    }
}

impl From<&str> for Variable {
    fn from(value: &str) -> Self {
        Variable::new(value)
    }
}
