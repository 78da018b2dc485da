//! Expression tree shared by every stage, plus its evaluation semantics.
//!
//! `Expression<P>` is generic over the payload of `EXISTS`: the parser stores
//! group patterns, the translator algebra nodes, and the planner physical
//! plans. Evaluation follows SPARQL error semantics: a type error or unbound
//! variable yields `Ok(None)`, which FILTER treats as false. `Err` is reserved
//! for failures of the engine itself (source errors, timeout) raised while
//! probing an `EXISTS` sub-plan.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use regex::{Regex, RegexBuilder};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::Result;
use crate::model::vocab::{rdf, xsd};
use crate::model::{Binding, Iri, Literal, Term, Variable};

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `||`
    Or,
    /// `&&`
    And,
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    Less,
    /// `>`
    Greater,
    /// `<=`
    LessOrEqual,
    /// `>=`
    GreaterOrEqual,
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*`
    Multiply,
    /// `/`
    Divide,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::Greater => ">",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `+`
    Plus,
    /// `-`
    Minus,
}

/// Built-in functions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Function {
    Bound,
    If,
    Coalesce,
    SameTerm,
    IsIri,
    IsBlank,
    IsLiteral,
    IsNumeric,
    Str,
    Lang,
    Datatype,
    LangMatches,
    Regex,
    Contains,
    StrStarts,
    StrEnds,
    StrLen,
    UCase,
    LCase,
    Concat,
    Abs,
    /// XSD constructor function, e.g. `xsd:integer(?x)`.
    Cast(Iri),
}

impl Function {
    /// Looks up a built-in by keyword, case-insensitively.
    pub fn from_keyword(name: &str) -> Option<Function> {
        let function = match name.to_ascii_uppercase().as_str() {
            "BOUND" => Function::Bound,
            "IF" => Function::If,
            "COALESCE" => Function::Coalesce,
            "SAMETERM" => Function::SameTerm,
            "ISIRI" | "ISURI" => Function::IsIri,
            "ISBLANK" => Function::IsBlank,
            "ISLITERAL" => Function::IsLiteral,
            "ISNUMERIC" => Function::IsNumeric,
            "STR" => Function::Str,
            "LANG" => Function::Lang,
            "DATATYPE" => Function::Datatype,
            "LANGMATCHES" => Function::LangMatches,
            "REGEX" => Function::Regex,
            "CONTAINS" => Function::Contains,
            "STRSTARTS" => Function::StrStarts,
            "STRENDS" => Function::StrEnds,
            "STRLEN" => Function::StrLen,
            "UCASE" => Function::UCase,
            "LCASE" => Function::LCase,
            "CONCAT" => Function::Concat,
            "ABS" => Function::Abs,
            _ => return None,
        };
        Some(function)
    }

    /// Casts supported through XSD constructor syntax.
    pub fn cast(datatype: &Iri) -> Option<Function> {
        const CASTABLE: &[&str] = &[
            xsd::STRING,
            xsd::BOOLEAN,
            xsd::INTEGER,
            xsd::DECIMAL,
            xsd::FLOAT,
            xsd::DOUBLE,
            xsd::DATE_TIME,
        ];
        CASTABLE
            .contains(&datatype.as_str())
            .then(|| Function::Cast(datatype.clone()))
    }

    /// Accepted argument counts as `(min, max)`; `None` means unbounded.
    pub fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Function::If => (3, Some(3)),
            Function::Coalesce | Function::Concat => (0, None),
            Function::Regex => (2, Some(3)),
            Function::SameTerm
            | Function::LangMatches
            | Function::Contains
            | Function::StrStarts
            | Function::StrEnds => (2, Some(2)),
            _ => (1, Some(1)),
        }
    }

    fn name(&self) -> String {
        let name = match self {
            Function::Bound => "BOUND",
            Function::If => "IF",
            Function::Coalesce => "COALESCE",
            Function::SameTerm => "sameTerm",
            Function::IsIri => "isIRI",
            Function::IsBlank => "isBlank",
            Function::IsLiteral => "isLiteral",
            Function::IsNumeric => "isNumeric",
            Function::Str => "STR",
            Function::Lang => "LANG",
            Function::Datatype => "DATATYPE",
            Function::LangMatches => "langMatches",
            Function::Regex => "REGEX",
            Function::Contains => "CONTAINS",
            Function::StrStarts => "STRSTARTS",
            Function::StrEnds => "STRENDS",
            Function::StrLen => "STRLEN",
            Function::UCase => "UCASE",
            Function::LCase => "LCASE",
            Function::Concat => "CONCAT",
            Function::Abs => "ABS",
            Function::Cast(iri) => return iri.to_string(),
        };
        name.to_owned()
    }
}

/// Aggregate functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Sample,
    GroupConcat,
}

impl AggregateFunction {
    /// Looks up an aggregate by keyword, case-insensitively.
    pub fn from_keyword(name: &str) -> Option<AggregateFunction> {
        let func = match name.to_ascii_uppercase().as_str() {
            "COUNT" => AggregateFunction::Count,
            "SUM" => AggregateFunction::Sum,
            "AVG" => AggregateFunction::Avg,
            "MIN" => AggregateFunction::Min,
            "MAX" => AggregateFunction::Max,
            "SAMPLE" => AggregateFunction::Sample,
            "GROUP_CONCAT" => AggregateFunction::GroupConcat,
            _ => return None,
        };
        Some(func)
    }

    fn name(self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Sample => "SAMPLE",
            AggregateFunction::GroupConcat => "GROUP_CONCAT",
        }
    }
}

/// Aggregate call. `arg == None` is `COUNT(*)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate<P> {
    /// Function applied.
    pub func: AggregateFunction,
    /// `DISTINCT` inside the call.
    pub distinct: bool,
    /// Argument expression.
    pub arg: Option<Expression<P>>,
    /// GROUP_CONCAT separator.
    pub separator: Option<String>,
}

/// Expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expression<P> {
    /// Variable reference.
    Variable(Variable),
    /// Constant term.
    Constant(Term),
    /// Binary operator application.
    Binary(BinaryOp, Box<Expression<P>>, Box<Expression<P>>),
    /// Unary operator application.
    Unary(UnaryOp, Box<Expression<P>>),
    /// `expr [NOT] IN (list)`.
    In {
        /// Tested expression.
        expr: Box<Expression<P>>,
        /// Candidates.
        list: Vec<Expression<P>>,
        /// `NOT IN`.
        negated: bool,
    },
    /// Built-in call.
    Call(Function, Vec<Expression<P>>),
    /// `[NOT] EXISTS { pattern }`.
    Exists {
        /// Pattern probed with the current row.
        pattern: Box<P>,
        /// `NOT EXISTS`.
        negated: bool,
    },
    /// Aggregate call; removed by the translator.
    Aggregate(Box<Aggregate<P>>),
}

impl<P> Expression<P> {
    /// Shorthand for a binary node.
    pub fn binary(op: BinaryOp, left: Expression<P>, right: Expression<P>) -> Self {
        Expression::Binary(op, Box::new(left), Box::new(right))
    }

    /// Free variables referenced outside of `EXISTS` bodies.
    pub fn variables(&self) -> BTreeSet<Variable> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<Variable>) {
        match self {
            Expression::Variable(var) => {
                out.insert(var.clone());
            }
            Expression::Constant(_) | Expression::Exists { .. } => {}
            Expression::Binary(_, left, right) => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
            Expression::Unary(_, inner) => inner.collect_variables(out),
            Expression::In { expr, list, .. } => {
                expr.collect_variables(out);
                list.iter().for_each(|item| item.collect_variables(out));
            }
            Expression::Call(_, args) => args.iter().for_each(|arg| arg.collect_variables(out)),
            Expression::Aggregate(agg) => {
                if let Some(arg) = &agg.arg {
                    arg.collect_variables(out);
                }
            }
        }
    }

    /// Whether any `EXISTS` appears in the tree.
    pub fn contains_exists(&self) -> bool {
        self.any(&|expr| matches!(expr, Expression::Exists { .. }))
    }

    /// Whether any aggregate appears in the tree.
    pub fn contains_aggregate(&self) -> bool {
        self.any(&|expr| matches!(expr, Expression::Aggregate(_)))
    }

    fn any(&self, pred: &dyn Fn(&Expression<P>) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Expression::Variable(_) | Expression::Constant(_) | Expression::Exists { .. } => false,
            Expression::Binary(_, left, right) => left.any(pred) || right.any(pred),
            Expression::Unary(_, inner) => inner.any(pred),
            Expression::In { expr, list, .. } => expr.any(pred) || list.iter().any(|e| e.any(pred)),
            Expression::Call(_, args) => args.iter().any(|e| e.any(pred)),
            Expression::Aggregate(agg) => agg.arg.as_ref().is_some_and(|e| e.any(pred)),
        }
    }

    /// Splits top-level `&&` into conjuncts.
    pub fn into_conjuncts(self) -> Vec<Expression<P>> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            match expr {
                Expression::Binary(BinaryOp::And, left, right) => {
                    stack.push(*right);
                    stack.push(*left);
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Folds conjuncts back into a left-nested `&&` chain.
    pub fn conjunction(conjuncts: Vec<Expression<P>>) -> Option<Expression<P>> {
        conjuncts
            .into_iter()
            .reduce(|acc, next| Expression::binary(BinaryOp::And, acc, next))
    }

    /// Rebuilds the tree with every `EXISTS` payload converted by `f`.
    pub fn try_map_patterns<Q, E>(
        &self,
        f: &mut dyn FnMut(&P) -> std::result::Result<Q, E>,
    ) -> std::result::Result<Expression<Q>, E> {
        Ok(match self {
            Expression::Variable(var) => Expression::Variable(var.clone()),
            Expression::Constant(term) => Expression::Constant(term.clone()),
            Expression::Binary(op, left, right) => Expression::Binary(
                *op,
                Box::new(left.try_map_patterns(f)?),
                Box::new(right.try_map_patterns(f)?),
            ),
            Expression::Unary(op, inner) => {
                Expression::Unary(*op, Box::new(inner.try_map_patterns(f)?))
            }
            Expression::In {
                expr,
                list,
                negated,
            } => Expression::In {
                expr: Box::new(expr.try_map_patterns(f)?),
                list: list
                    .iter()
                    .map(|item| item.try_map_patterns(f))
                    .collect::<std::result::Result<_, E>>()?,
                negated: *negated,
            },
            Expression::Call(func, args) => Expression::Call(
                func.clone(),
                args.iter()
                    .map(|arg| arg.try_map_patterns(f))
                    .collect::<std::result::Result<_, E>>()?,
            ),
            Expression::Exists { pattern, negated } => Expression::Exists {
                pattern: Box::new(f(pattern)?),
                negated: *negated,
            },
            Expression::Aggregate(agg) => Expression::Aggregate(Box::new(Aggregate {
                func: agg.func,
                distinct: agg.distinct,
                arg: agg.arg.as_ref().map(|arg| arg.try_map_patterns(f)).transpose()?,
                separator: agg.separator.clone(),
            })),
        })
    }
}

impl<P> fmt::Display for Expression<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Variable(var) => fmt::Display::fmt(var, f),
            Expression::Constant(term) => fmt::Display::fmt(term, f),
            Expression::Binary(op, left, right) => {
                write!(f, "({left} {} {right})", op.symbol())
            }
            Expression::Unary(UnaryOp::Not, inner) => write!(f, "!{inner}"),
            Expression::Unary(UnaryOp::Plus, inner) => write!(f, "+{inner}"),
            Expression::Unary(UnaryOp::Minus, inner) => write!(f, "-{inner}"),
            Expression::In {
                expr,
                list,
                negated,
            } => {
                write!(f, "({expr} {}IN (", if *negated { "NOT " } else { "" })?;
                write_list(f, list)?;
                f.write_str("))")
            }
            Expression::Call(func, args) => {
                write!(f, "{}(", func.name())?;
                write_list(f, args)?;
                f.write_str(")")
            }
            Expression::Exists { negated, .. } => {
                write!(f, "{}EXISTS {{..}}", if *negated { "NOT " } else { "" })
            }
            Expression::Aggregate(agg) => {
                write!(f, "{}(", agg.func.name())?;
                if agg.distinct {
                    f.write_str("DISTINCT ")?;
                }
                match &agg.arg {
                    Some(arg) => fmt::Display::fmt(arg, f)?,
                    None => f.write_str("*")?,
                }
                if let Some(sep) = &agg.separator {
                    write!(f, "; SEPARATOR={}", Literal::simple(sep.as_str()))?;
                }
                f.write_str(")")
            }
        }
    }
}

fn write_list<P>(f: &mut fmt::Formatter<'_>, items: &[Expression<P>]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        fmt::Display::fmt(item, f)?;
    }
    Ok(())
}

/// Answers `EXISTS` probes for the evaluator.
pub trait ExistsProbe<P> {
    /// Whether `pattern` has at least one solution compatible with `row`.
    fn exists(&mut self, pattern: &P, row: &Binding) -> Result<bool>;
}

/// Probe for contexts where `EXISTS` cannot occur.
pub struct NoExists;

impl<P> ExistsProbe<P> for NoExists {
    fn exists(&mut self, _pattern: &P, _row: &Binding) -> Result<bool> {
        Ok(false)
    }
}

/// Stateful evaluator; caches compiled regular expressions.
#[derive(Default)]
pub struct ExprEvaluator {
    regexes: FxHashMap<String, Option<Regex>>,
}

impl ExprEvaluator {
    /// Creates an evaluator with an empty regex cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates `expr` against `row`; `Ok(None)` is an evaluation error.
    pub fn evaluate<P>(
        &mut self,
        expr: &Expression<P>,
        row: &Binding,
        probe: &mut dyn ExistsProbe<P>,
    ) -> Result<Option<Term>> {
        Ok(match expr {
            Expression::Variable(var) => row.get(var).cloned(),
            Expression::Constant(term) => Some(term.clone()),
            Expression::Binary(BinaryOp::Or, left, right) => {
                let l = self.ebv(left, row, probe)?;
                let r = self.ebv(right, row, probe)?;
                match (l, r) {
                    (Some(true), _) | (_, Some(true)) => Some(bool_term(true)),
                    (Some(false), Some(false)) => Some(bool_term(false)),
                    _ => None,
                }
            }
            Expression::Binary(BinaryOp::And, left, right) => {
                let l = self.ebv(left, row, probe)?;
                let r = self.ebv(right, row, probe)?;
                match (l, r) {
                    (Some(false), _) | (_, Some(false)) => Some(bool_term(false)),
                    (Some(true), Some(true)) => Some(bool_term(true)),
                    _ => None,
                }
            }
            Expression::Binary(op, left, right) => {
                let l = self.evaluate(left, row, probe)?;
                let r = self.evaluate(right, row, probe)?;
                match (l, r) {
                    (Some(l), Some(r)) => binary(*op, &l, &r),
                    _ => None,
                }
            }
            Expression::Unary(op, inner) => match op {
                UnaryOp::Not => self.ebv(inner, row, probe)?.map(|b| bool_term(!b)),
                UnaryOp::Plus => self
                    .evaluate(inner, row, probe)?
                    .as_ref()
                    .and_then(numeric)
                    .map(Numeric::into_term),
                UnaryOp::Minus => self
                    .evaluate(inner, row, probe)?
                    .as_ref()
                    .and_then(numeric)
                    .and_then(Numeric::negate)
                    .map(Numeric::into_term),
            },
            Expression::In {
                expr,
                list,
                negated,
            } => {
                let Some(needle) = self.evaluate(expr, row, probe)? else {
                    return Ok(None);
                };
                let mut errored = false;
                let mut found = false;
                for candidate in list {
                    match self.evaluate(candidate, row, probe)? {
                        Some(term) => match terms_equal(&needle, &term) {
                            Some(true) => {
                                found = true;
                                break;
                            }
                            Some(false) => {}
                            None => errored = true,
                        },
                        None => errored = true,
                    }
                }
                if found {
                    Some(bool_term(!negated))
                } else if errored {
                    None
                } else {
                    Some(bool_term(*negated))
                }
            }
            Expression::Exists { pattern, negated } => {
                let exists = probe.exists(pattern, row)?;
                Some(bool_term(exists != *negated))
            }
            Expression::Call(func, args) => self.call(func, args, row, probe)?,
            Expression::Aggregate(_) => None,
        })
    }

    /// Effective boolean value; `Ok(None)` is an evaluation error.
    pub fn ebv<P>(
        &mut self,
        expr: &Expression<P>,
        row: &Binding,
        probe: &mut dyn ExistsProbe<P>,
    ) -> Result<Option<bool>> {
        Ok(self
            .evaluate(expr, row, probe)?
            .as_ref()
            .and_then(effective_boolean))
    }

    /// FILTER semantics: errors count as false.
    pub fn test<P>(
        &mut self,
        expr: &Expression<P>,
        row: &Binding,
        probe: &mut dyn ExistsProbe<P>,
    ) -> Result<bool> {
        Ok(self.ebv(expr, row, probe)?.unwrap_or(false))
    }

    fn call<P>(
        &mut self,
        func: &Function,
        args: &[Expression<P>],
        row: &Binding,
        probe: &mut dyn ExistsProbe<P>,
    ) -> Result<Option<Term>> {
        match func {
            Function::Bound => {
                return Ok(match args.first() {
                    Some(Expression::Variable(var)) => Some(bool_term(row.contains(var))),
                    _ => None,
                })
            }
            Function::If => {
                let (Some(cond), Some(then), Some(other)) = (args.first(), args.get(1), args.get(2))
                else {
                    return Ok(None);
                };
                return match self.ebv(cond, row, probe)? {
                    Some(true) => self.evaluate(then, row, probe),
                    Some(false) => self.evaluate(other, row, probe),
                    None => Ok(None),
                };
            }
            Function::Coalesce => {
                for arg in args {
                    if let Some(term) = self.evaluate(arg, row, probe)? {
                        return Ok(Some(term));
                    }
                }
                return Ok(None);
            }
            _ => {}
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match self.evaluate(arg, row, probe)? {
                Some(term) => values.push(term),
                None => return Ok(None),
            }
        }
        Ok(self.apply(func, &values))
    }

    fn apply(&mut self, func: &Function, values: &[Term]) -> Option<Term> {
        let first = values.first();
        match func {
            Function::SameTerm => Some(bool_term(values.first()? == values.get(1)?)),
            Function::IsIri => Some(bool_term(matches!(first?, Term::Iri(_)))),
            Function::IsBlank => Some(bool_term(matches!(first?, Term::BlankNode(_)))),
            Function::IsLiteral => Some(bool_term(matches!(first?, Term::Literal(_)))),
            Function::IsNumeric => Some(bool_term(numeric(first?).is_some())),
            Function::Str => str_value(first?).map(|s| Term::literal(s)),
            Function::Lang => match first? {
                Term::Literal(lit) => Some(Term::literal(lit.language().unwrap_or(""))),
                _ => None,
            },
            Function::Datatype => match first? {
                Term::Literal(lit) => Some(Term::Iri(lit.datatype().clone())),
                _ => None,
            },
            Function::LangMatches => {
                let tag = simple_string(values.first()?)?;
                let range = simple_string(values.get(1)?)?;
                Some(bool_term(lang_matches(tag, range)))
            }
            Function::Regex => {
                let text = string_literal(values.first()?)?.value();
                let pattern = simple_string(values.get(1)?)?;
                let flags = match values.get(2) {
                    Some(term) => simple_string(term)?,
                    None => "",
                };
                let regex = self.regex(pattern, flags)?;
                Some(bool_term(regex.is_match(text)))
            }
            Function::Contains => {
                let (hay, needle) = string_pair(values)?;
                Some(bool_term(hay.contains(needle)))
            }
            Function::StrStarts => {
                let (hay, needle) = string_pair(values)?;
                Some(bool_term(hay.starts_with(needle)))
            }
            Function::StrEnds => {
                let (hay, needle) = string_pair(values)?;
                Some(bool_term(hay.ends_with(needle)))
            }
            Function::StrLen => {
                let lit = string_literal(first?)?;
                Some(Literal::integer(lit.value().chars().count() as i64).into())
            }
            Function::UCase => map_string(first?, |s| s.to_uppercase()),
            Function::LCase => map_string(first?, |s| s.to_lowercase()),
            Function::Concat => {
                let mut out = String::new();
                let mut lang: Option<Option<&str>> = None;
                for value in values {
                    let lit = string_literal(value)?;
                    out.push_str(lit.value());
                    lang = match lang {
                        None => Some(lit.language()),
                        Some(prev) if prev == lit.language() => Some(prev),
                        Some(_) => Some(None),
                    };
                }
                Some(match lang.flatten() {
                    Some(tag) => Literal::lang(out, tag).into(),
                    None => Term::literal(out),
                })
            }
            Function::Abs => numeric(first?)?.abs().map(Numeric::into_term),
            Function::Cast(target) => cast(first?, target),
            Function::Bound | Function::If | Function::Coalesce => None,
        }
    }

    fn regex(&mut self, pattern: &str, flags: &str) -> Option<&Regex> {
        let key = format!("{flags}\u{0}{pattern}");
        self.regexes
            .entry(key)
            .or_insert_with(|| compile_regex(pattern, flags))
            .as_ref()
    }
}

fn compile_regex(pattern: &str, flags: &str) -> Option<Regex> {
    let mut builder = if flags.contains('q') {
        RegexBuilder::new(&regex::escape(pattern))
    } else {
        RegexBuilder::new(pattern)
    };
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            'q' => {}
            _ => return None,
        }
    }
    builder.size_limit(1 << 20).build().ok()
}

fn lang_matches(tag: &str, range: &str) -> bool {
    if range == "*" {
        return !tag.is_empty();
    }
    let tag = tag.to_ascii_lowercase();
    let range = range.to_ascii_lowercase();
    tag == range || (tag.starts_with(&range) && tag.as_bytes().get(range.len()) == Some(&b'-'))
}

pub(crate) fn bool_term(value: bool) -> Term {
    Literal::boolean(value).into()
}

/// Numeric literal value with its position in the promotion lattice.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Numeric {
    Integer(i64),
    Decimal(f64),
    Float(f64),
    Double(f64),
}

impl Numeric {
    fn rank(self) -> u8 {
        match self {
            Numeric::Integer(_) => 0,
            Numeric::Decimal(_) => 1,
            Numeric::Float(_) => 2,
            Numeric::Double(_) => 3,
        }
    }

    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Numeric::Integer(v) => v as f64,
            Numeric::Decimal(v) | Numeric::Float(v) | Numeric::Double(v) => v,
        }
    }

    fn with_rank(rank: u8, value: f64) -> Numeric {
        match rank {
            0 | 1 => Numeric::Decimal(value),
            2 => Numeric::Float(value),
            _ => Numeric::Double(value),
        }
    }

    fn negate(self) -> Option<Numeric> {
        Some(match self {
            Numeric::Integer(v) => Numeric::Integer(v.checked_neg()?),
            Numeric::Decimal(v) => Numeric::Decimal(-v),
            Numeric::Float(v) => Numeric::Float(-v),
            Numeric::Double(v) => Numeric::Double(-v),
        })
    }

    fn abs(self) -> Option<Numeric> {
        Some(match self {
            Numeric::Integer(v) => Numeric::Integer(v.checked_abs()?),
            Numeric::Decimal(v) => Numeric::Decimal(v.abs()),
            Numeric::Float(v) => Numeric::Float(v.abs()),
            Numeric::Double(v) => Numeric::Double(v.abs()),
        })
    }

    pub(crate) fn into_term(self) -> Term {
        match self {
            Numeric::Integer(v) => Literal::integer(v).into(),
            Numeric::Decimal(v) => Literal::decimal(v).into(),
            Numeric::Float(v) => Literal::typed(format!("{v:E}"), Iri::new(xsd::FLOAT)).into(),
            Numeric::Double(v) => Literal::double(v).into(),
        }
    }

    fn compare(self, other: Numeric) -> Option<Ordering> {
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }

    pub(crate) fn arithmetic(op: BinaryOp, left: Numeric, right: Numeric) -> Option<Numeric> {
        if let (Numeric::Integer(a), Numeric::Integer(b)) = (left, right) {
            let exact = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Subtract => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                BinaryOp::Divide => {
                    if b == 0 {
                        return None;
                    }
                    return Some(Numeric::Decimal(a as f64 / b as f64));
                }
                _ => return None,
            };
            if let Some(value) = exact {
                return Some(Numeric::Integer(value));
            }
        }
        let rank = left.rank().max(right.rank());
        let (a, b) = (left.as_f64(), right.as_f64());
        let value = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => {
                if b == 0.0 && rank <= 1 {
                    return None;
                }
                a / b
            }
            _ => return None,
        };
        Some(Numeric::with_rank(rank, value))
    }
}

/// Numeric value of a literal with a numeric datatype and valid lexical form.
pub(crate) fn numeric(term: &Term) -> Option<Numeric> {
    let lit = term.as_literal()?;
    let datatype = lit.datatype().as_str();
    let text = lit.value().trim();
    if xsd::INTEGER_DERIVED.contains(&datatype) {
        return text.parse::<i64>().ok().map(Numeric::Integer);
    }
    let parse_float = || -> Option<f64> {
        match text {
            "INF" | "+INF" => Some(f64::INFINITY),
            "-INF" => Some(f64::NEG_INFINITY),
            "NaN" => Some(f64::NAN),
            other => other.parse::<f64>().ok(),
        }
    };
    match datatype {
        xsd::DECIMAL => text
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Numeric::Decimal),
        xsd::FLOAT => parse_float().map(Numeric::Float),
        xsd::DOUBLE => parse_float().map(Numeric::Double),
        _ => None,
    }
}

fn boolean(lit: &Literal) -> Option<bool> {
    if lit.datatype().as_str() != xsd::BOOLEAN {
        return None;
    }
    match lit.value() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Effective boolean value of a term.
pub(crate) fn effective_boolean(term: &Term) -> Option<bool> {
    let lit = term.as_literal()?;
    if lit.datatype().as_str() == xsd::BOOLEAN {
        return Some(boolean(lit).unwrap_or(false));
    }
    if let Some(num) = numeric(term) {
        let value = num.as_f64();
        return Some(value != 0.0 && !value.is_nan());
    }
    if lit.language().is_some() || lit.datatype().as_str() == xsd::STRING {
        return Some(!lit.value().is_empty());
    }
    None
}

fn string_literal(term: &Term) -> Option<&Literal> {
    let lit = term.as_literal()?;
    (lit.language().is_some() || lit.datatype().as_str() == xsd::STRING).then_some(lit)
}

fn simple_string(term: &Term) -> Option<&str> {
    let lit = term.as_literal()?;
    lit.is_simple().then(|| lit.value())
}

fn string_pair(values: &[Term]) -> Option<(&str, &str)> {
    let hay = string_literal(values.first()?)?;
    let needle = string_literal(values.get(1)?)?;
    if needle.language().is_some() && needle.language() != hay.language() {
        return None;
    }
    Some((hay.value(), needle.value()))
}

fn map_string(term: &Term, f: impl Fn(&str) -> String) -> Option<Term> {
    let lit = string_literal(term)?;
    Some(match lit.language() {
        Some(tag) => Literal::lang(f(lit.value()), tag).into(),
        None => Term::literal(f(lit.value())),
    })
}

/// Lexical form for STR(); blank nodes have none.
pub(crate) fn str_value(term: &Term) -> Option<&str> {
    match term {
        Term::Iri(iri) => Some(iri.as_str()),
        Term::Literal(lit) => Some(lit.value()),
        Term::BlankNode(_) => None,
    }
}

fn cast(term: &Term, target: &Iri) -> Option<Term> {
    if let Term::BlankNode(_) = term {
        return None;
    }
    let lexical = str_value(term)?.trim();
    let from_numeric = numeric(term);
    let from_bool = term.as_literal().and_then(boolean);
    let is_string = term.as_literal().is_some_and(|lit| lit.is_simple());
    match target.as_str() {
        xsd::STRING => Some(Term::literal(str_value(term)?)),
        xsd::BOOLEAN => {
            if let Some(value) = from_bool {
                return Some(bool_term(value));
            }
            if let Some(num) = from_numeric {
                let value = num.as_f64();
                return Some(bool_term(value != 0.0 && !value.is_nan()));
            }
            match (is_string, lexical) {
                (true, "true" | "1") => Some(bool_term(true)),
                (true, "false" | "0") => Some(bool_term(false)),
                _ => None,
            }
        }
        xsd::INTEGER => {
            if let Some(num) = from_numeric {
                let value = match num {
                    Numeric::Integer(v) => v,
                    other => {
                        let v = other.as_f64().trunc();
                        if !v.is_finite() || v.abs() >= i64::MAX as f64 {
                            return None;
                        }
                        v as i64
                    }
                };
                return Some(Literal::integer(value).into());
            }
            if let Some(value) = from_bool {
                return Some(Literal::integer(i64::from(value)).into());
            }
            is_string
                .then(|| lexical.parse::<i64>().ok())
                .flatten()
                .map(|v| Literal::integer(v).into())
        }
        xsd::DECIMAL | xsd::FLOAT | xsd::DOUBLE => {
            let value = if let Some(num) = from_numeric {
                num.as_f64()
            } else if let Some(value) = from_bool {
                if value {
                    1.0
                } else {
                    0.0
                }
            } else if is_string {
                lexical.parse::<f64>().ok()?
            } else {
                return None;
            };
            let rank = match target.as_str() {
                xsd::DECIMAL if !value.is_finite() => return None,
                xsd::DECIMAL => 1,
                xsd::FLOAT => 2,
                _ => 3,
            };
            Some(Numeric::with_rank(rank, value).into_term())
        }
        xsd::DATE_TIME => {
            let lit = term.as_literal()?;
            let valid = (lit.is_simple() || lit.datatype().as_str() == xsd::DATE_TIME)
                && lexical.len() >= 19
                && lexical.as_bytes().get(10) == Some(&b'T');
            valid.then(|| Literal::typed(lexical, Iri::new(xsd::DATE_TIME)).into())
        }
        _ => None,
    }
}

fn binary(op: BinaryOp, left: &Term, right: &Term) -> Option<Term> {
    match op {
        BinaryOp::Equal => terms_equal(left, right).map(bool_term),
        BinaryOp::NotEqual => terms_equal(left, right).map(|eq| bool_term(!eq)),
        BinaryOp::Less => compare_values(left, right).map(|o| bool_term(o == Ordering::Less)),
        BinaryOp::Greater => compare_values(left, right).map(|o| bool_term(o == Ordering::Greater)),
        BinaryOp::LessOrEqual => {
            compare_values(left, right).map(|o| bool_term(o != Ordering::Greater))
        }
        BinaryOp::GreaterOrEqual => {
            compare_values(left, right).map(|o| bool_term(o != Ordering::Less))
        }
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => {
            Numeric::arithmetic(op, numeric(left)?, numeric(right)?).map(Numeric::into_term)
        }
        BinaryOp::Or | BinaryOp::And => None,
    }
}

/// `=` semantics: value equality for comparable literals, term equality
/// otherwise.
pub(crate) fn terms_equal(left: &Term, right: &Term) -> Option<bool> {
    if left == right {
        return Some(true);
    }
    match (left, right) {
        (Term::Literal(_), Term::Literal(_)) => match compare_values(left, right) {
            Some(order) => Some(order == Ordering::Equal),
            None => Some(false),
        },
        _ => Some(false),
    }
}

/// Value comparison for `<`, `>` and friends. `None` when the operands are
/// not comparable.
pub(crate) fn compare_values(left: &Term, right: &Term) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (numeric(left), numeric(right)) {
        return a.compare(b);
    }
    let (Term::Literal(a), Term::Literal(b)) = (left, right) else {
        return None;
    };
    if let (Some(x), Some(y)) = (boolean(a), boolean(b)) {
        return Some(x.cmp(&y));
    }
    if a.is_simple() && b.is_simple() {
        return Some(a.value().cmp(b.value()));
    }
    let same_type = a.datatype() == b.datatype() && a.language() == b.language();
    if same_type && a.datatype().as_str() == xsd::DATE_TIME {
        return Some(a.value().cmp(b.value()));
    }
    if same_type && a.datatype().as_str() == rdf::LANG_STRING {
        return Some(a.value().cmp(b.value()));
    }
    None
}

/// Total order used by ORDER BY: unbound, blank nodes, IRIs, literals.
pub fn order_terms(left: Option<&Term>, right: Option<&Term>) -> Ordering {
    fn rank(term: Option<&Term>) -> u8 {
        match term {
            None => 0,
            Some(Term::BlankNode(_)) => 1,
            Some(Term::Iri(_)) => 2,
            Some(Term::Literal(_)) => 3,
        }
    }
    match (left, right) {
        (Some(Term::BlankNode(a)), Some(Term::BlankNode(b))) => a.as_str().cmp(b.as_str()),
        (Some(Term::Iri(a)), Some(Term::Iri(b))) => a.as_str().cmp(b.as_str()),
        (Some(l @ Term::Literal(a)), Some(r @ Term::Literal(b))) => {
            let (na, nb) = (numeric(l), numeric(r));
            match (na, nb) {
                (Some(x), Some(y)) => x
                    .compare(y)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.cmp(b)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => compare_values(l, r)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.value().cmp(b.value()))
                    .then_with(|| a.datatype().as_str().cmp(b.datatype().as_str()))
                    .then_with(|| a.language().cmp(&b.language())),
            }
        }
        _ => rank(left).cmp(&rank(right)),
    }
}

/// Running state of one aggregate within one group.
pub(crate) struct Accumulator {
    func: AggregateFunction,
    distinct: bool,
    separator: String,
    seen: FxHashSet<Term>,
    seen_rows: FxHashSet<Binding>,
    count: i64,
    sum: Option<Numeric>,
    best: Option<Term>,
    concat: Option<String>,
    failed: bool,
}

impl Accumulator {
    pub(crate) fn new<P>(agg: &Aggregate<P>) -> Self {
        Self {
            func: agg.func,
            distinct: agg.distinct,
            separator: agg.separator.clone().unwrap_or_else(|| " ".to_owned()),
            seen: FxHashSet::default(),
            seen_rows: FxHashSet::default(),
            count: 0,
            sum: Some(Numeric::Integer(0)),
            best: None,
            concat: None,
            failed: false,
        }
    }

    /// Feeds one solution to a `COUNT(*)`.
    pub(crate) fn add_row(&mut self, row: &Binding) {
        if self.distinct && !self.seen_rows.insert(row.clone()) {
            return;
        }
        self.count += 1;
    }

    /// Feeds one evaluated argument; `None` is an evaluation error.
    pub(crate) fn add(&mut self, value: Option<Term>) {
        let Some(term) = value else {
            if !matches!(self.func, AggregateFunction::Count | AggregateFunction::Sample) {
                self.failed = true;
            }
            return;
        };
        if self.distinct && !self.seen.insert(term.clone()) {
            return;
        }
        self.count += 1;
        match self.func {
            AggregateFunction::Count => {}
            AggregateFunction::Sum | AggregateFunction::Avg => {
                self.sum = match (self.sum, numeric(&term)) {
                    (Some(acc), Some(value)) => Numeric::arithmetic(BinaryOp::Add, acc, value),
                    _ => None,
                };
            }
            AggregateFunction::Min => {
                if self
                    .best
                    .as_ref()
                    .map_or(true, |best| order_terms(Some(&term), Some(best)) == Ordering::Less)
                {
                    self.best = Some(term);
                }
            }
            AggregateFunction::Max => {
                if self
                    .best
                    .as_ref()
                    .map_or(true, |best| order_terms(Some(&term), Some(best)) == Ordering::Greater)
                {
                    self.best = Some(term);
                }
            }
            AggregateFunction::Sample => {
                if self.best.is_none() {
                    self.best = Some(term);
                }
            }
            AggregateFunction::GroupConcat => match str_value(&term) {
                Some(text) => {
                    let concat = self.concat.get_or_insert_with(String::new);
                    if self.count > 1 {
                        concat.push_str(&self.separator);
                    }
                    concat.push_str(text);
                }
                None => self.failed = true,
            },
        }
    }

    /// Final aggregate value; `None` leaves the output variable unbound.
    pub(crate) fn finish(self) -> Option<Term> {
        if self.failed {
            return None;
        }
        match self.func {
            AggregateFunction::Count => Some(Literal::integer(self.count).into()),
            AggregateFunction::Sum => self.sum.map(Numeric::into_term),
            AggregateFunction::Avg => {
                if self.count == 0 {
                    return Some(Literal::integer(0).into());
                }
                let sum = self.sum?;
                Numeric::arithmetic(BinaryOp::Divide, sum, Numeric::Integer(self.count))
                    .map(Numeric::into_term)
            }
            AggregateFunction::Min | AggregateFunction::Max | AggregateFunction::Sample => {
                self.best
            }
            AggregateFunction::GroupConcat => {
                Some(Term::literal(self.concat.unwrap_or_default()))
            }
        }
    }
}
