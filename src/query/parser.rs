//! Recursive-descent parser producing [`Query`] trees.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::model::vocab::{rdf, xsd};
use crate::model::{Iri, Literal, Term, Variable};
use crate::query::ast::{
    AstExpression, GroupCondition, GroupPattern, InlineData, OrderCondition, PatternElement,
    PatternTerm, Projection, Query, QueryForm, SelectItem, SelectModifier, SolutionModifiers,
    TriplePattern, VarOrIri,
};
use crate::query::errors::SyntaxError;
use crate::query::expr::{Aggregate, AggregateFunction, BinaryOp, Expression, Function, UnaryOp};
use crate::query::lexer::{tokenize, Spanned, Token};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};

/// Nesting bound for groups and parenthesised expressions.
const MAX_DEPTH: usize = 128;

/// Parses a query string.
pub fn parse(text: &str) -> Result<Query, SyntaxError> {
    let timer = profile_timer();
    let tokens = tokenize(text)?;
    debug!(bytes = text.len(), tokens = tokens.len(), "query.parse");
    let mut parser = Parser {
        text,
        tokens,
        pos: 0,
        prefixes: FxHashMap::default(),
        base: None,
        anon: 0,
        depth: 0,
    };
    parser.prologue()?;
    let query = parser.query()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected input after the end of the query"));
    }
    record_profile_timer(QueryProfileKind::Parse, timer);
    Ok(query)
}

struct Parser<'s> {
    text: &'s str,
    tokens: Vec<Spanned<'s>>,
    pos: usize,
    prefixes: FxHashMap<String, String>,
    base: Option<oxiri::Iri<String>>,
    anon: usize,
    depth: usize,
}

impl<'s> Parser<'s> {
    // ---- token plumbing -------------------------------------------------

    fn peek(&self) -> Option<&Token<'s>> {
        self.tokens.get(self.pos).map(|(tok, _)| tok)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token<'s>> {
        self.tokens.get(self.pos + ahead).map(|(tok, _)| tok)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.text.len(), |(_, span)| span.start)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::at(self.text, self.offset(), message)
    }

    fn describe_next(&self) -> String {
        match self.tokens.get(self.pos) {
            Some((_, span)) => format!("'{}'", &self.text[span.clone()]),
            None => "end of input".to_owned(),
        }
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        self.error(format!("expected {expected}, found {}", self.describe_next()))
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn is_keyword_at(&self, ahead: usize, keyword: &str) -> bool {
        matches!(self.peek_at(ahead), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), SyntaxError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn eat(&mut self, token: &Token<'_>) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token<'_>, what: &str) -> Result<(), SyntaxError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn enter(&mut self) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!("query nesting exceeds {MAX_DEPTH} levels")));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ---- prologue and IRIs ----------------------------------------------

    fn prologue(&mut self) -> Result<(), SyntaxError> {
        loop {
            if self.eat_keyword("BASE") {
                let raw = self.expect_iri_ref("IRI after BASE")?;
                let resolved = self.resolve_iri(raw)?;
                self.base = Some(
                    oxiri::Iri::parse(resolved.as_str().to_owned())
                        .map_err(|err| self.error(format!("invalid BASE IRI: {err}")))?,
                );
            } else if self.eat_keyword("PREFIX") {
                let prefix = match self.peek() {
                    Some(Token::PrefixedName(name)) if name.ends_with(':') => {
                        name[..name.len() - 1].to_owned()
                    }
                    _ => return Err(self.unexpected("prefix declaration like 'ex:'")),
                };
                self.pos += 1;
                let raw = self.expect_iri_ref("IRI after PREFIX")?;
                let iri = self.resolve_iri(raw)?;
                self.prefixes.insert(prefix, iri.as_str().to_owned());
            } else {
                return Ok(());
            }
        }
    }

    fn expect_iri_ref(&mut self, what: &str) -> Result<&'s str, SyntaxError> {
        match self.peek() {
            Some(Token::IriRef(raw)) => {
                let raw = *raw;
                self.pos += 1;
                Ok(raw)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn resolve_iri(&self, raw: &str) -> Result<Iri, SyntaxError> {
        let resolved = match &self.base {
            Some(base) => base
                .resolve(raw)
                .map(|iri| iri.into_inner())
                .map_err(|err| self.error(format!("invalid IRI <{raw}>: {err}")))?,
            None => oxiri::Iri::parse(raw.to_owned())
                .map(|iri| iri.into_inner())
                .map_err(|err| self.error(format!("invalid IRI <{raw}>: {err}")))?,
        };
        Ok(Iri::new(resolved))
    }

    fn expand_prefixed(&self, name: &str) -> Result<Iri, SyntaxError> {
        let (prefix, local) = name.split_once(':').unwrap_or(("", name));
        let Some(namespace) = self.prefixes.get(prefix) else {
            return Err(self.error(format!("undefined prefix '{prefix}:'")));
        };
        Ok(Iri::new(format!("{namespace}{local}")))
    }

    /// Consumes an IRI in either syntax if one is next.
    fn iri(&mut self) -> Result<Option<Iri>, SyntaxError> {
        let iri = match self.peek() {
            Some(Token::IriRef(raw)) => {
                let raw = *raw;
                self.resolve_iri(raw)?
            }
            Some(Token::PrefixedName(name)) => {
                let name = *name;
                self.expand_prefixed(name)?
            }
            _ => return Ok(None),
        };
        self.pos += 1;
        Ok(Some(iri))
    }

    fn variable(&mut self) -> Option<Variable> {
        match self.peek() {
            Some(Token::Var(name)) => {
                let var = Variable::new(*name);
                self.pos += 1;
                Some(var)
            }
            _ => None,
        }
    }

    fn expect_variable(&mut self) -> Result<Variable, SyntaxError> {
        self.variable().ok_or_else(|| self.unexpected("variable"))
    }

    // ---- query forms ------------------------------------------------------

    fn query(&mut self) -> Result<Query, SyntaxError> {
        let mut query = if self.eat_keyword("SELECT") {
            self.select_query()?
        } else if self.eat_keyword("CONSTRUCT") {
            self.construct_query()?
        } else if self.eat_keyword("ASK") {
            self.reject_dataset_clause()?;
            self.eat_keyword("WHERE");
            let pattern = self.group_pattern()?;
            let modifiers = self.solution_modifiers()?;
            Query {
                form: QueryForm::Ask,
                pattern,
                modifiers,
                values: None,
            }
        } else if self.eat_keyword("DESCRIBE") {
            self.describe_query()?
        } else {
            for update in ["INSERT", "DELETE", "LOAD", "CLEAR", "DROP", "CREATE", "WITH"] {
                if self.is_keyword(update) {
                    return Err(self.error("update operations are not supported"));
                }
            }
            return Err(self.unexpected("SELECT, CONSTRUCT, ASK or DESCRIBE"));
        };
        query.values = self.trailing_values()?;
        Ok(query)
    }

    fn reject_dataset_clause(&self) -> Result<(), SyntaxError> {
        if self.is_keyword("FROM") {
            return Err(self.error("FROM dataset clauses are not supported"));
        }
        Ok(())
    }

    fn select_query(&mut self) -> Result<Query, SyntaxError> {
        let modifier = if self.eat_keyword("DISTINCT") {
            SelectModifier::Distinct
        } else if self.eat_keyword("REDUCED") {
            SelectModifier::Reduced
        } else {
            SelectModifier::None
        };
        let projection = if self.eat(&Token::Star) {
            Projection::All
        } else {
            let mut items = Vec::new();
            loop {
                if let Some(var) = self.variable() {
                    items.push(SelectItem::Variable(var));
                } else if self.eat(&Token::LParen) {
                    let expr = self.expression()?;
                    self.expect_keyword("AS")?;
                    let alias = self.expect_variable()?;
                    self.expect(&Token::RParen, "')'")?;
                    items.push(SelectItem::Expression { expr, alias });
                } else {
                    break;
                }
            }
            if items.is_empty() {
                return Err(self.unexpected("'*' or projection variables"));
            }
            Projection::Items(items)
        };
        self.reject_dataset_clause()?;
        self.eat_keyword("WHERE");
        let pattern = self.group_pattern()?;
        let modifiers = self.solution_modifiers()?;
        Ok(Query {
            form: QueryForm::Select {
                modifier,
                projection,
            },
            pattern,
            modifiers,
            values: None,
        })
    }

    fn construct_query(&mut self) -> Result<Query, SyntaxError> {
        let (template, pattern) = if self.eat_keyword("WHERE") {
            let start = self.offset();
            let pattern = self.group_pattern()?;
            let mut template = Vec::new();
            for element in &pattern.elements {
                match element {
                    PatternElement::Triples(triples) => template.extend(triples.iter().cloned()),
                    _ => {
                        return Err(SyntaxError::at(
                            self.text,
                            start,
                            "CONSTRUCT WHERE only allows triple patterns",
                        ))
                    }
                }
            }
            (template, pattern)
        } else {
            self.expect(&Token::LBrace, "'{' opening the CONSTRUCT template")?;
            let mut template = Vec::new();
            while !self.eat(&Token::RBrace) {
                if self.eat(&Token::Dot) {
                    continue;
                }
                self.triples_same_subject(&mut template)?;
            }
            self.reject_dataset_clause()?;
            self.eat_keyword("WHERE");
            (template, self.group_pattern()?)
        };
        let modifiers = self.solution_modifiers()?;
        Ok(Query {
            form: QueryForm::Construct { template },
            pattern,
            modifiers,
            values: None,
        })
    }

    fn describe_query(&mut self) -> Result<Query, SyntaxError> {
        let mut targets = Vec::new();
        if !self.eat(&Token::Star) {
            loop {
                if let Some(var) = self.variable() {
                    targets.push(VarOrIri::Variable(var));
                } else if let Some(iri) = self.iri()? {
                    targets.push(VarOrIri::Iri(iri));
                } else {
                    break;
                }
            }
            if targets.is_empty() {
                return Err(self.unexpected("'*', variable or IRI to describe"));
            }
        }
        self.reject_dataset_clause()?;
        let has_where = self.eat_keyword("WHERE");
        let pattern = if has_where || self.peek() == Some(&Token::LBrace) {
            self.group_pattern()?
        } else {
            GroupPattern::default()
        };
        let modifiers = self.solution_modifiers()?;
        Ok(Query {
            form: QueryForm::Describe { targets },
            pattern,
            modifiers,
            values: None,
        })
    }

    fn trailing_values(&mut self) -> Result<Option<InlineData>, SyntaxError> {
        if self.eat_keyword("VALUES") {
            Ok(Some(self.data_block()?))
        } else {
            Ok(None)
        }
    }

    // ---- solution modifiers ---------------------------------------------

    fn solution_modifiers(&mut self) -> Result<SolutionModifiers, SyntaxError> {
        let mut modifiers = SolutionModifiers::default();
        if self.is_keyword("GROUP") && self.is_keyword_at(1, "BY") {
            self.pos += 2;
            loop {
                if let Some(var) = self.variable() {
                    modifiers.group_by.push(GroupCondition::Variable(var));
                } else if self.eat(&Token::LParen) {
                    let expr = self.expression()?;
                    let alias = if self.eat_keyword("AS") {
                        Some(self.expect_variable()?)
                    } else {
                        None
                    };
                    self.expect(&Token::RParen, "')'")?;
                    modifiers.group_by.push(GroupCondition::Expression(expr, alias));
                } else if self.at_call() {
                    let expr = self.primary()?;
                    modifiers.group_by.push(GroupCondition::Expression(expr, None));
                } else {
                    break;
                }
            }
            if modifiers.group_by.is_empty() {
                return Err(self.unexpected("GROUP BY condition"));
            }
        }
        if self.eat_keyword("HAVING") {
            loop {
                if self.peek() == Some(&Token::LParen) || self.at_call() {
                    modifiers.having.push(self.primary()?);
                } else {
                    break;
                }
            }
            if modifiers.having.is_empty() {
                return Err(self.unexpected("HAVING constraint"));
            }
        }
        if self.is_keyword("ORDER") && self.is_keyword_at(1, "BY") {
            self.pos += 2;
            loop {
                let descending = if self.eat_keyword("ASC") {
                    Some(false)
                } else if self.eat_keyword("DESC") {
                    Some(true)
                } else {
                    None
                };
                if let Some(descending) = descending {
                    self.expect(&Token::LParen, "'('")?;
                    let expr = self.expression()?;
                    self.expect(&Token::RParen, "')'")?;
                    modifiers.order_by.push(OrderCondition { expr, descending });
                } else if let Some(var) = self.variable() {
                    modifiers.order_by.push(OrderCondition {
                        expr: Expression::Variable(var),
                        descending: false,
                    });
                } else if self.peek() == Some(&Token::LParen) || self.at_call() {
                    let expr = self.primary()?;
                    modifiers.order_by.push(OrderCondition {
                        expr,
                        descending: false,
                    });
                } else {
                    break;
                }
            }
            if modifiers.order_by.is_empty() {
                return Err(self.unexpected("ORDER BY condition"));
            }
        }
        for _ in 0..2 {
            if modifiers.limit.is_none() && self.eat_keyword("LIMIT") {
                modifiers.limit = Some(self.unsigned()?);
            } else if modifiers.offset.is_none() && self.eat_keyword("OFFSET") {
                modifiers.offset = Some(self.unsigned()?);
            }
        }
        Ok(modifiers)
    }

    fn unsigned(&mut self) -> Result<usize, SyntaxError> {
        match self.peek() {
            Some(Token::Integer(digits)) => {
                let value = digits
                    .parse::<usize>()
                    .map_err(|_| self.error(format!("integer {digits} is out of range")))?;
                self.pos += 1;
                Ok(value)
            }
            _ => Err(self.unexpected("non-negative integer")),
        }
    }

    /// Whether a function or aggregate call starts here.
    fn at_call(&self) -> bool {
        let next_is_paren = self.peek_at(1) == Some(&Token::LParen);
        match self.peek() {
            Some(Token::Ident(word)) => {
                next_is_paren
                    && (Function::from_keyword(word).is_some()
                        || AggregateFunction::from_keyword(word).is_some())
            }
            Some(Token::IriRef(_)) | Some(Token::PrefixedName(_)) => next_is_paren,
            _ => false,
        }
    }

    // ---- graph patterns -------------------------------------------------

    fn group_pattern(&mut self) -> Result<GroupPattern, SyntaxError> {
        self.expect(&Token::LBrace, "'{'")?;
        self.enter()?;
        if self.is_keyword("SELECT") {
            self.pos += 1;
            let mut sub = self.select_query()?;
            sub.values = self.trailing_values()?;
            self.expect(&Token::RBrace, "'}' closing the sub-select")?;
            self.leave();
            return Ok(GroupPattern {
                elements: vec![PatternElement::SubSelect(Box::new(sub))],
            });
        }
        let mut elements: Vec<PatternElement> = Vec::new();
        loop {
            if self.eat(&Token::RBrace) {
                break;
            }
            if self.eat(&Token::Dot) {
                continue;
            }
            if self.peek().is_none() {
                return Err(self.unexpected("'}'"));
            }
            if self.eat_keyword("OPTIONAL") {
                elements.push(PatternElement::Optional(self.group_pattern()?));
            } else if self.eat_keyword("MINUS") {
                elements.push(PatternElement::Minus(self.group_pattern()?));
            } else if self.eat_keyword("FILTER") {
                elements.push(PatternElement::Filter(self.constraint()?));
            } else if self.eat_keyword("BIND") {
                self.expect(&Token::LParen, "'('")?;
                let expr = self.expression()?;
                self.expect_keyword("AS")?;
                let var = self.expect_variable()?;
                self.expect(&Token::RParen, "')'")?;
                elements.push(PatternElement::Bind(expr, var));
            } else if self.eat_keyword("GRAPH") {
                let name = if let Some(var) = self.variable() {
                    VarOrIri::Variable(var)
                } else if let Some(iri) = self.iri()? {
                    VarOrIri::Iri(iri)
                } else {
                    return Err(self.unexpected("graph name"));
                };
                elements.push(PatternElement::Graph(name, self.group_pattern()?));
            } else if self.eat_keyword("VALUES") {
                elements.push(PatternElement::Values(self.data_block()?));
            } else if self.is_keyword("SERVICE") {
                return Err(self.error("SERVICE is not supported"));
            } else if self.peek() == Some(&Token::LBrace) {
                let first = self.group_pattern()?;
                let mut branches = vec![first];
                while self.eat_keyword("UNION") {
                    branches.push(self.group_pattern()?);
                }
                if branches.len() == 1 {
                    let group = branches.pop().unwrap_or_default();
                    elements.push(PatternElement::Group(group));
                } else {
                    elements.push(PatternElement::Union(branches));
                }
            } else {
                let mut triples = Vec::new();
                self.triples_same_subject(&mut triples)?;
                if !matches!(self.peek(), Some(Token::Dot) | Some(Token::RBrace))
                    && !self.at_group_keyword()
                {
                    return Err(self.unexpected("'.' or '}' after triple pattern"));
                }
                match elements.last_mut() {
                    Some(PatternElement::Triples(existing)) => existing.extend(triples),
                    _ => elements.push(PatternElement::Triples(triples)),
                }
            }
        }
        self.leave();
        Ok(GroupPattern { elements })
    }

    fn at_group_keyword(&self) -> bool {
        ["OPTIONAL", "MINUS", "FILTER", "BIND", "GRAPH", "VALUES", "SERVICE"]
            .iter()
            .any(|kw| self.is_keyword(kw))
            || self.peek() == Some(&Token::LBrace)
    }

    fn constraint(&mut self) -> Result<AstExpression, SyntaxError> {
        if self.peek() == Some(&Token::LParen)
            || self.at_call()
            || self.is_keyword("EXISTS")
            || self.is_keyword("NOT")
        {
            self.primary()
        } else {
            Err(self.unexpected("'(' or function call after FILTER"))
        }
    }

    fn data_block(&mut self) -> Result<InlineData, SyntaxError> {
        let mut data = InlineData::default();
        if let Some(var) = self.variable() {
            data.variables.push(var);
            self.expect(&Token::LBrace, "'{'")?;
            while !self.eat(&Token::RBrace) {
                let value = self.data_value()?;
                data.rows.push(vec![value]);
            }
            return Ok(data);
        }
        self.expect(&Token::LParen, "'(' or variable after VALUES")?;
        while !self.eat(&Token::RParen) {
            data.variables.push(self.expect_variable()?);
        }
        self.expect(&Token::LBrace, "'{'")?;
        while !self.eat(&Token::RBrace) {
            let start = self.offset();
            self.expect(&Token::LParen, "'(' starting a VALUES row")?;
            let mut row = Vec::with_capacity(data.variables.len());
            while !self.eat(&Token::RParen) {
                row.push(self.data_value()?);
            }
            if row.len() != data.variables.len() {
                return Err(SyntaxError::at(
                    self.text,
                    start,
                    format!(
                        "VALUES row has {} values but {} variables are declared",
                        row.len(),
                        data.variables.len()
                    ),
                ));
            }
            data.rows.push(row);
        }
        Ok(data)
    }

    fn data_value(&mut self) -> Result<Option<Term>, SyntaxError> {
        if self.eat_keyword("UNDEF") {
            return Ok(None);
        }
        if let Some(iri) = self.iri()? {
            return Ok(Some(Term::Iri(iri)));
        }
        match self.literal()? {
            Some(lit) => Ok(Some(Term::Literal(lit))),
            None => Err(self.unexpected("IRI, literal or UNDEF")),
        }
    }

    fn triples_same_subject(&mut self, out: &mut Vec<TriplePattern>) -> Result<(), SyntaxError> {
        if self.peek() == Some(&Token::LBracket) && self.peek_at(1) != Some(&Token::RBracket) {
            let subject = self.blank_node_property_list(out)?;
            if self.starts_verb() {
                self.property_list(subject, out)?;
            }
            return Ok(());
        }
        let subject = self.term_or_var("subject")?;
        self.property_list(subject, out)
    }

    fn starts_verb(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Var(_) | Token::IriRef(_) | Token::PrefixedName(_))
        ) || self.is_keyword("a")
            || matches!(self.peek(), Some(Token::Caret | Token::Bang | Token::LParen))
    }

    fn property_list(
        &mut self,
        subject: PatternTerm,
        out: &mut Vec<TriplePattern>,
    ) -> Result<(), SyntaxError> {
        loop {
            let predicate = self.verb()?;
            loop {
                let object = self.object(out)?;
                out.push(TriplePattern {
                    subject: subject.clone(),
                    predicate: predicate.clone(),
                    object,
                });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            if !self.eat(&Token::Semicolon) {
                return Ok(());
            }
            while self.eat(&Token::Semicolon) {}
            if !self.starts_verb() {
                return Ok(());
            }
        }
    }

    fn verb(&mut self) -> Result<PatternTerm, SyntaxError> {
        if matches!(self.peek(), Some(Token::Caret | Token::Bang | Token::LParen)) {
            return Err(self.error("property paths are not supported"));
        }
        let predicate = if self.eat_keyword("a") {
            PatternTerm::Term(Term::iri(rdf::TYPE))
        } else if let Some(var) = self.variable() {
            PatternTerm::Variable(var)
        } else if let Some(iri) = self.iri()? {
            PatternTerm::Term(Term::Iri(iri))
        } else {
            return Err(self.unexpected("predicate"));
        };
        if matches!(
            self.peek(),
            Some(Token::Slash | Token::Pipe | Token::Star | Token::Question)
        ) {
            return Err(self.error("property paths are not supported"));
        }
        Ok(predicate)
    }

    fn object(&mut self, out: &mut Vec<TriplePattern>) -> Result<PatternTerm, SyntaxError> {
        if self.peek() == Some(&Token::LBracket) && self.peek_at(1) != Some(&Token::RBracket) {
            return self.blank_node_property_list(out);
        }
        self.term_or_var("object")
    }

    fn blank_node_property_list(
        &mut self,
        out: &mut Vec<TriplePattern>,
    ) -> Result<PatternTerm, SyntaxError> {
        self.expect(&Token::LBracket, "'['")?;
        let node = self.fresh_blank();
        self.property_list(node.clone(), out)?;
        self.expect(&Token::RBracket, "']'")?;
        Ok(node)
    }

    fn fresh_blank(&mut self) -> PatternTerm {
        self.anon += 1;
        PatternTerm::BlankNode(format!("#anon{}", self.anon))
    }

    fn term_or_var(&mut self, position: &str) -> Result<PatternTerm, SyntaxError> {
        if let Some(var) = self.variable() {
            return Ok(PatternTerm::Variable(var));
        }
        if let Some(iri) = self.iri()? {
            return Ok(PatternTerm::Term(Term::Iri(iri)));
        }
        match self.peek() {
            Some(Token::BlankLabel(label)) => {
                let label = (*label).to_owned();
                self.pos += 1;
                return Ok(PatternTerm::BlankNode(label));
            }
            Some(Token::LBracket) if self.peek_at(1) == Some(&Token::RBracket) => {
                self.pos += 2;
                return Ok(self.fresh_blank());
            }
            Some(Token::LParen) => {
                return Err(self.error("RDF collections are not supported"));
            }
            _ => {}
        }
        match self.literal()? {
            Some(lit) => Ok(PatternTerm::Term(Term::Literal(lit))),
            None => Err(self.unexpected(position)),
        }
    }

    // ---- literals ----------------------------------------------------------

    fn literal(&mut self) -> Result<Option<Literal>, SyntaxError> {
        let negative = match self.peek() {
            Some(Token::Minus | Token::Plus)
                if matches!(
                    self.peek_at(1),
                    Some(Token::Integer(_) | Token::Decimal(_) | Token::Double(_))
                ) =>
            {
                let negative = self.peek() == Some(&Token::Minus);
                self.pos += 1;
                negative
            }
            _ => false,
        };
        let sign = if negative { "-" } else { "" };
        let literal = match self.peek().cloned() {
            Some(Token::Integer(digits)) => {
                Literal::typed(format!("{sign}{digits}"), Iri::new(xsd::INTEGER))
            }
            Some(Token::Decimal(digits)) => {
                Literal::typed(format!("{sign}{digits}"), Iri::new(xsd::DECIMAL))
            }
            Some(Token::Double(digits)) => {
                Literal::typed(format!("{sign}{digits}"), Iri::new(xsd::DOUBLE))
            }
            Some(Token::Ident(word)) if word == "true" || word == "false" => {
                Literal::boolean(word == "true")
            }
            Some(Token::String(raw)) => {
                self.pos += 1;
                let value = self.unescape(&raw[1..raw.len() - 1])?;
                return self.literal_suffix(value).map(Some);
            }
            Some(Token::LongString(raw)) => {
                self.pos += 1;
                let value = self.unescape(raw)?;
                return self.literal_suffix(value).map(Some);
            }
            _ => return Ok(None),
        };
        self.pos += 1;
        Ok(Some(literal))
    }

    fn literal_suffix(&mut self, value: String) -> Result<Literal, SyntaxError> {
        if let Some(Token::LangTag(tag)) = self.peek() {
            let tag = *tag;
            self.pos += 1;
            return Ok(Literal::lang(value, tag));
        }
        if self.eat(&Token::DoubleCaret) {
            let Some(datatype) = self.iri()? else {
                return Err(self.unexpected("datatype IRI after '^^'"));
            };
            return Ok(Literal::typed(value, datatype));
        }
        Ok(Literal::simple(value))
    }

    fn unescape(&self, raw: &str) -> Result<String, SyntaxError> {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            let escaped = match chars.next() {
                Some('t') => '\t',
                Some('n') => '\n',
                Some('r') => '\r',
                Some('b') => '\u{8}',
                Some('f') => '\u{c}',
                Some('"') => '"',
                Some('\'') => '\'',
                Some('\\') => '\\',
                Some(kind @ ('u' | 'U')) => {
                    let width = if kind == 'u' { 4 } else { 8 };
                    let hex: String = chars.by_ref().take(width).collect();
                    u32::from_str_radix(&hex, 16)
                        .ok()
                        .filter(|_| hex.len() == width)
                        .and_then(char::from_u32)
                        .ok_or_else(|| self.error(format!("invalid unicode escape \\{kind}{hex}")))?
                }
                other => {
                    return Err(self.error(format!(
                        "invalid escape sequence \\{}",
                        other.map(String::from).unwrap_or_default()
                    )))
                }
            };
            out.push(escaped);
        }
        Ok(out)
    }

    // ---- expressions ------------------------------------------------------

    fn expression(&mut self) -> Result<AstExpression, SyntaxError> {
        self.enter()?;
        let mut expr = self.and_expression()?;
        while self.eat(&Token::OrOr) {
            let right = self.and_expression()?;
            expr = Expression::binary(BinaryOp::Or, expr, right);
        }
        self.leave();
        Ok(expr)
    }

    fn and_expression(&mut self) -> Result<AstExpression, SyntaxError> {
        let mut expr = self.relational()?;
        while self.eat(&Token::AndAnd) {
            let right = self.relational()?;
            expr = Expression::binary(BinaryOp::And, expr, right);
        }
        Ok(expr)
    }

    fn relational(&mut self) -> Result<AstExpression, SyntaxError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Equal,
            Some(Token::NotEq) => BinaryOp::NotEqual,
            Some(Token::Lt) => BinaryOp::Less,
            Some(Token::Gt) => BinaryOp::Greater,
            Some(Token::LtEq) => BinaryOp::LessOrEqual,
            Some(Token::GtEq) => BinaryOp::GreaterOrEqual,
            _ => {
                let negated = if self.is_keyword("NOT") && self.is_keyword_at(1, "IN") {
                    self.pos += 2;
                    true
                } else if self.eat_keyword("IN") {
                    false
                } else {
                    return Ok(left);
                };
                let list = self.expression_list()?;
                return Ok(Expression::In {
                    expr: Box::new(left),
                    list,
                    negated,
                });
            }
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(Expression::binary(op, left, right))
    }

    fn expression_list(&mut self) -> Result<Vec<AstExpression>, SyntaxError> {
        self.expect(&Token::LParen, "'('")?;
        let mut list = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(list);
        }
        loop {
            list.push(self.expression()?);
            if self.eat(&Token::RParen) {
                return Ok(list);
            }
            self.expect(&Token::Comma, "',' or ')'")?;
        }
    }

    fn additive(&mut self) -> Result<AstExpression, SyntaxError> {
        let mut expr = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Subtract,
                _ => return Ok(expr),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            expr = Expression::binary(op, expr, right);
        }
    }

    fn multiplicative(&mut self) -> Result<AstExpression, SyntaxError> {
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Multiply,
                Some(Token::Slash) => BinaryOp::Divide,
                _ => return Ok(expr),
            };
            self.pos += 1;
            let right = self.unary()?;
            expr = Expression::binary(op, expr, right);
        }
    }

    fn unary(&mut self) -> Result<AstExpression, SyntaxError> {
        let op = match self.peek() {
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Plus) => UnaryOp::Plus,
            Some(Token::Minus) => UnaryOp::Minus,
            _ => return self.primary(),
        };
        self.pos += 1;
        self.enter()?;
        let inner = self.unary()?;
        self.leave();
        Ok(Expression::Unary(op, Box::new(inner)))
    }

    fn primary(&mut self) -> Result<AstExpression, SyntaxError> {
        if self.eat(&Token::LParen) {
            let expr = self.expression()?;
            self.expect(&Token::RParen, "')'")?;
            return Ok(expr);
        }
        if let Some(var) = self.variable() {
            return Ok(Expression::Variable(var));
        }
        if self.eat_keyword("EXISTS") {
            let pattern = self.group_pattern()?;
            return Ok(Expression::Exists {
                pattern: Box::new(pattern),
                negated: false,
            });
        }
        if self.is_keyword("NOT") && self.is_keyword_at(1, "EXISTS") {
            self.pos += 2;
            let pattern = self.group_pattern()?;
            return Ok(Expression::Exists {
                pattern: Box::new(pattern),
                negated: true,
            });
        }
        let start = self.offset();
        if let Some(iri) = self.iri()? {
            if self.peek() != Some(&Token::LParen) {
                return Ok(Expression::Constant(Term::Iri(iri)));
            }
            let Some(function) = Function::cast(&iri) else {
                return Err(SyntaxError::at(
                    self.text,
                    start,
                    format!("unsupported function {iri}"),
                ));
            };
            let args = self.expression_list()?;
            return self.checked_call(function, args, start);
        }
        if let Some(Token::Ident(word)) = self.peek().cloned() {
            if word != "true" && word != "false" {
                self.pos += 1;
                if let Some(func) = AggregateFunction::from_keyword(word) {
                    return self.aggregate(func);
                }
                if let Some(function) = Function::from_keyword(word) {
                    if function == Function::Bound {
                        self.expect(&Token::LParen, "'('")?;
                        let var = self.expect_variable()?;
                        self.expect(&Token::RParen, "')'")?;
                        return Ok(Expression::Call(function, vec![Expression::Variable(var)]));
                    }
                    let args = self.expression_list()?;
                    return self.checked_call(function, args, start);
                }
                return Err(SyntaxError::at(
                    self.text,
                    start,
                    format!("unknown function or keyword '{word}'"),
                ));
            }
        }
        match self.literal()? {
            Some(lit) => Ok(Expression::Constant(Term::Literal(lit))),
            None => Err(self.unexpected("expression")),
        }
    }

    fn checked_call(
        &self,
        function: Function,
        args: Vec<AstExpression>,
        start: usize,
    ) -> Result<AstExpression, SyntaxError> {
        let (min, max) = function.arity();
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            return Err(SyntaxError::at(
                self.text,
                start,
                format!("wrong number of arguments ({}) for function", args.len()),
            ));
        }
        Ok(Expression::Call(function, args))
    }

    fn aggregate(&mut self, func: AggregateFunction) -> Result<AstExpression, SyntaxError> {
        self.expect(&Token::LParen, "'('")?;
        let distinct = self.eat_keyword("DISTINCT");
        let arg = if func == AggregateFunction::Count && self.eat(&Token::Star) {
            None
        } else {
            Some(self.expression()?)
        };
        let mut separator = None;
        if func == AggregateFunction::GroupConcat && self.eat(&Token::Semicolon) {
            self.expect_keyword("SEPARATOR")?;
            self.expect(&Token::Eq, "'='")?;
            separator = match self.literal()? {
                Some(lit) if lit.is_simple() => Some(lit.value().to_owned()),
                _ => return Err(self.unexpected("separator string")),
            };
        }
        self.expect(&Token::RParen, "')'")?;
        Ok(Expression::Aggregate(Box::new(Aggregate {
            func,
            distinct,
            arg,
            separator,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_pattern(text: &str) -> GroupPattern {
        parse(text).expect("parses").pattern
    }

    #[test]
    fn parses_prefixed_triples_with_lists() {
        let pattern = select_pattern(
            "PREFIX ex: <http://example.org/>
             SELECT ?s WHERE { ?s a ex:Person ; ex:knows ?a , ?b . }",
        );
        let PatternElement::Triples(triples) = &pattern.elements[0] else {
            panic!("expected triples");
        };
        assert_eq!(triples.len(), 3);
        assert_eq!(triples[0].predicate, PatternTerm::Term(Term::iri(rdf::TYPE)));
        assert_eq!(
            triples[0].object,
            PatternTerm::Term(Term::iri("http://example.org/Person"))
        );
    }

    #[test]
    fn default_prefix_and_typed_literals() {
        let pattern = select_pattern(
            "PREFIX : <http://ex/> PREFIX xsd: <http://www.w3.org/2001/XMLSchema#>
             SELECT ?s WHERE { ?s a :Person ; :age \"3\"^^xsd:int }",
        );
        let PatternElement::Triples(triples) = &pattern.elements[0] else {
            panic!("expected triples");
        };
        assert_eq!(triples[0].object, PatternTerm::Term(Term::iri("http://ex/Person")));
        assert_eq!(triples[1].predicate, PatternTerm::Term(Term::iri("http://ex/age")));
    }

    #[test]
    fn base_resolves_relative_iris() {
        let pattern = select_pattern("BASE <http://example.org/a/> SELECT * { <b> <../c> ?o }");
        let PatternElement::Triples(triples) = &pattern.elements[0] else {
            panic!("expected triples");
        };
        assert_eq!(
            triples[0].subject,
            PatternTerm::Term(Term::iri("http://example.org/a/b"))
        );
        assert_eq!(
            triples[0].predicate,
            PatternTerm::Term(Term::iri("http://example.org/c"))
        );
    }

    #[test]
    fn parses_optional_union_filter() {
        let pattern = select_pattern(
            "SELECT * WHERE {
                { ?s <http://p> ?o } UNION { ?s <http://q> ?o }
                OPTIONAL { ?s <http://age> ?a FILTER(?a > 18) }
                FILTER (!BOUND(?a) || ?a < 65)
            }",
        );
        assert!(matches!(pattern.elements[0], PatternElement::Union(ref b) if b.len() == 2));
        assert!(matches!(pattern.elements[1], PatternElement::Optional(_)));
        assert!(matches!(pattern.elements[2], PatternElement::Filter(_)));
    }

    #[test]
    fn parses_aggregates_and_modifiers() {
        let query = parse(
            "SELECT ?g (COUNT(DISTINCT ?x) AS ?n) (GROUP_CONCAT(?x; SEPARATOR=\",\") AS ?all)
             WHERE { ?x <http://in> ?g }
             GROUP BY ?g HAVING (COUNT(?x) > 1) ORDER BY DESC(?n) ?g LIMIT 5 OFFSET 2",
        )
        .expect("parses");
        assert_eq!(query.modifiers.group_by.len(), 1);
        assert_eq!(query.modifiers.having.len(), 1);
        assert_eq!(query.modifiers.order_by.len(), 2);
        assert!(query.modifiers.order_by[0].descending);
        assert_eq!(query.modifiers.limit, Some(5));
        assert_eq!(query.modifiers.offset, Some(2));
    }

    #[test]
    fn parses_values_and_bind() {
        let pattern = select_pattern(
            "SELECT * { VALUES (?x ?y) { (<http://a> 1) (UNDEF \"b\"@en) } BIND(?y + 1 AS ?z) }",
        );
        let PatternElement::Values(data) = &pattern.elements[0] else {
            panic!("expected values");
        };
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[1][0], None);
        assert!(matches!(pattern.elements[1], PatternElement::Bind(_, _)));
    }

    #[test]
    fn parses_construct_ask_describe() {
        let construct = parse("CONSTRUCT { ?s <http://p> [] } WHERE { ?s ?p ?o }").expect("ok");
        assert!(matches!(construct.form, QueryForm::Construct { ref template } if template.len() == 1));
        let short = parse("CONSTRUCT WHERE { ?s ?p ?o }").expect("ok");
        assert!(matches!(short.form, QueryForm::Construct { ref template } if template.len() == 1));
        assert!(matches!(parse("ASK { ?s ?p ?o }").expect("ok").form, QueryForm::Ask));
        let describe = parse("DESCRIBE <http://a>").expect("ok");
        assert!(describe.pattern.elements.is_empty());
    }

    #[test]
    fn rejects_unsupported_constructs() {
        for (text, fragment) in [
            ("SELECT * { ?s <http://p>/<http://q> ?o }", "property paths"),
            ("SELECT * { ?s <http://p> (1 2) }", "collections"),
            ("SELECT * FROM <http://g> { ?s ?p ?o }", "FROM"),
            ("SELECT * { SERVICE <http://x> { ?s ?p ?o } }", "SERVICE"),
            ("INSERT DATA { <http://a> <http://b> <http://c> }", "update"),
        ] {
            let err = parse(text).expect_err(text);
            assert!(err.message.contains(fragment), "{text}: {}", err.message);
        }
    }

    #[test]
    fn reports_error_position() {
        let err = parse("SELECT ?s WHERE {\n  ?s ?p }").expect_err("missing object");
        assert_eq!(err.position.line, 2);
        assert!(err.message.contains("object"));
    }

    #[test]
    fn undefined_prefix_is_an_error() {
        let err = parse("SELECT * { ?s ex:p ?o }").expect_err("no prefix");
        assert!(err.message.contains("undefined prefix"));
    }

    #[test]
    fn sub_select_is_a_group_element() {
        let pattern =
            select_pattern("SELECT ?s { { SELECT ?s WHERE { ?s ?p ?o } LIMIT 1 } ?s ?q ?r }");
        let PatternElement::Group(group) = &pattern.elements[0] else {
            panic!("expected group");
        };
        assert!(matches!(group.elements[0], PatternElement::SubSelect(_)));
    }

    #[test]
    fn negative_numbers_and_strings() {
        let pattern = select_pattern(r#"SELECT * { ?s <http://p> -5 , "a\tb" , """x"y""" }"#);
        let PatternElement::Triples(triples) = &pattern.elements[0] else {
            panic!("expected triples");
        };
        assert_eq!(
            triples[0].object,
            PatternTerm::Term(Term::Literal(Literal::typed("-5", Iri::new(xsd::INTEGER))))
        );
        assert_eq!(triples[1].object, PatternTerm::Term(Term::literal("a\tb")));
        assert_eq!(triples[2].object, PatternTerm::Term(Term::literal("x\"y")));
    }
}
