//! Lowering of parsed queries into algebra trees.
//!
//! The lowering is structural and deterministic. Static scoping rules are
//! checked here so later stages can assume every filter variable has a chance
//! of being bound.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::model::{Binding, GraphPattern, QuadPattern, Term, TermPattern, Variable};
use crate::query::algebra::{AlgebraExpr, AlgebraNode, AlgebraOp, OrderKey};
use crate::query::ast::{
    AstExpression, GroupCondition, GroupPattern, InlineData, PatternElement, PatternTerm,
    Projection, Query, QueryForm, SelectItem, SelectModifier, TriplePattern, VarOrIri,
};
use crate::query::errors::ScopeError;
use crate::query::expr::{Aggregate, Expression};

/// Caller-supplied adjustments applied during translation.
#[derive(Clone, Debug, Default)]
pub struct TranslateOptions {
    /// Pre-bound variables, joined in as a single-row table.
    pub initial_bindings: Binding,
    /// Replaces the query's own LIMIT.
    pub limit: Option<usize>,
    /// Replaces the query's own OFFSET.
    pub offset: Option<usize>,
}

/// Query form of a translated query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    /// Tabular bindings.
    Select,
    /// Single boolean.
    Ask,
    /// Quads from a template.
    Construct,
    /// Quads describing resources.
    Describe,
}

/// Translation output.
#[derive(Clone, Debug)]
pub struct Translated {
    /// Query form.
    pub kind: QueryKind,
    /// Output variables for SELECT, in projection order.
    pub variables: Vec<Variable>,
    /// CONSTRUCT template.
    pub template: Vec<TriplePattern>,
    /// DESCRIBE targets; empty with `DESCRIBE *` means every projected variable.
    pub describe: Vec<VarOrIri>,
    /// Algebra root.
    pub root: AlgebraNode,
}

/// Translates a parsed query.
pub fn translate(query: &Query, options: &TranslateOptions) -> Result<Translated, ScopeError> {
    let mut translator = Translator::default();
    let outer: BTreeSet<Variable> = options.initial_bindings.variables().cloned().collect();
    let root = translator.query(query, &outer, Some(options))?;
    let (kind, variables, template, describe) = match &query.form {
        QueryForm::Select { .. } => (
            QueryKind::Select,
            projected_variables(&root),
            Vec::new(),
            Vec::new(),
        ),
        QueryForm::Ask => (QueryKind::Ask, Vec::new(), Vec::new(), Vec::new()),
        QueryForm::Construct { template } => (
            QueryKind::Construct,
            Vec::new(),
            template.clone(),
            Vec::new(),
        ),
        QueryForm::Describe { targets } => {
            let targets = if targets.is_empty() {
                visible_variables(&root)
                    .into_iter()
                    .map(VarOrIri::Variable)
                    .collect()
            } else {
                targets.clone()
            };
            (QueryKind::Describe, Vec::new(), Vec::new(), targets)
        }
    };
    debug!(kind = ?kind, nodes = root.size(), "query.translate");
    Ok(Translated {
        kind,
        variables,
        template,
        describe,
        root,
    })
}

fn projected_variables(root: &AlgebraNode) -> Vec<Variable> {
    let mut node = root;
    loop {
        match &node.op {
            AlgebraOp::Project { variables } => return variables.clone(),
            AlgebraOp::Distinct | AlgebraOp::Reduced | AlgebraOp::Slice { .. } => {
                match node.inputs.first() {
                    Some(input) => node = input,
                    None => return Vec::new(),
                }
            }
            _ => return visible_variables(node),
        }
    }
}

/// Non-hidden variables in order of first appearance.
fn visible_variables(node: &AlgebraNode) -> Vec<Variable> {
    fn walk(node: &AlgebraNode, out: &mut Vec<Variable>) {
        let mut push = |var: &Variable| {
            if !var.is_hidden() && !out.contains(var) {
                out.push(var.clone());
            }
        };
        match &node.op {
            AlgebraOp::Pattern(pattern) => pattern.variables().iter().for_each(push),
            AlgebraOp::Values { variables, .. } => variables.iter().for_each(push),
            AlgebraOp::Project { variables } => {
                variables.iter().for_each(push);
                return;
            }
            AlgebraOp::Group { keys, aggregates } => {
                keys.iter().for_each(&mut push);
                aggregates.iter().for_each(|(var, _)| push(var));
                return;
            }
            AlgebraOp::Minus => {
                if let Some(left) = node.inputs.first() {
                    walk(left, out);
                }
                return;
            }
            AlgebraOp::Extend { var, .. } => {
                for input in &node.inputs {
                    walk(input, out);
                }
                if !var.is_hidden() && !out.contains(var) {
                    out.push(var.clone());
                }
                return;
            }
            _ => {}
        }
        for input in &node.inputs {
            walk(input, out);
        }
    }
    let mut out = Vec::new();
    walk(node, &mut out);
    out
}

#[derive(Default)]
struct Translator {
    blank_vars: FxHashMap<String, Variable>,
    hidden: usize,
    graph: Option<GraphPattern>,
}

impl Translator {
    fn fresh(&mut self, kind: &str) -> Variable {
        self.hidden += 1;
        Variable::hidden(kind, self.hidden)
    }

    fn query(
        &mut self,
        query: &Query,
        outer: &BTreeSet<Variable>,
        top: Option<&TranslateOptions>,
    ) -> Result<AlgebraNode, ScopeError> {
        let seed = match top {
            Some(options) if !options.initial_bindings.is_empty() => {
                AlgebraNode::new(AlgebraOp::Values {
                    variables: options.initial_bindings.variables().cloned().collect(),
                    rows: vec![options.initial_bindings.clone()],
                })
            }
            _ => AlgebraNode::unit(),
        };
        let mut node = self.group_from(seed, &query.pattern, outer)?;
        if let Some(data) = &query.values {
            node = AlgebraNode::join(node, values_node(data));
        }

        let select_items: &[SelectItem] = match &query.form {
            QueryForm::Select {
                projection: Projection::Items(items),
                ..
            } => items,
            _ => &[],
        };
        let is_select_all = matches!(
            query.form,
            QueryForm::Select {
                projection: Projection::All,
                ..
            }
        );

        let aggregated = !query.modifiers.group_by.is_empty()
            || select_items.iter().any(|item| match item {
                SelectItem::Expression { expr, .. } => expr.contains_aggregate(),
                SelectItem::Variable(_) => false,
            })
            || query.modifiers.having.iter().any(Expression::contains_aggregate)
            || query
                .modifiers
                .order_by
                .iter()
                .any(|cond| cond.expr.contains_aggregate());

        let mut projection: Vec<Variable> = Vec::new();
        let mut order_keys: Vec<OrderKey> = Vec::new();

        if aggregated {
            if is_select_all {
                return Err(ScopeError::UngroupedVariable { var: "*".into() });
            }
            let mut keys = Vec::new();
            for condition in &query.modifiers.group_by {
                match condition {
                    GroupCondition::Variable(var) => keys.push(var.clone()),
                    GroupCondition::Expression(expr, alias) => {
                        let var = match alias {
                            Some(var) => var.clone(),
                            None => self.fresh("g"),
                        };
                        let expr = self.expression(expr, &node.possible_variables(), outer, "GROUP BY")?;
                        node = AlgebraNode::unary(AlgebraOp::Extend { var: var.clone(), expr }, node);
                        keys.push(var);
                    }
                }
            }

            let mut aggregates: Vec<(Variable, Aggregate<AlgebraNode>)> = Vec::new();
            let scope = node.possible_variables();
            let mut extends: Vec<(Variable, AlgebraExpr)> = Vec::new();
            let mut available: BTreeSet<Variable> = keys.iter().cloned().collect();
            for item in select_items {
                match item {
                    SelectItem::Variable(var) => {
                        if !available.contains(var) {
                            return Err(ScopeError::UngroupedVariable {
                                var: var.as_str().to_owned(),
                            });
                        }
                        push_projection(&mut projection, var)?;
                    }
                    SelectItem::Expression { expr, alias } => {
                        if available.contains(alias) || scope.contains(alias) {
                            return Err(ScopeError::rebound(alias.as_str(), "SELECT expression"));
                        }
                        let expr = self.aggregate_expression(expr, &scope, outer, &mut aggregates)?;
                        if let Some(var) = ungrouped(&expr, &available, &aggregates) {
                            return Err(ScopeError::UngroupedVariable {
                                var: var.as_str().to_owned(),
                            });
                        }
                        available.insert(alias.clone());
                        extends.push((alias.clone(), expr));
                        push_projection(&mut projection, alias)?;
                    }
                }
            }
            let mut having = Vec::new();
            for expr in &query.modifiers.having {
                let expr = self.aggregate_expression(expr, &scope, outer, &mut aggregates)?;
                if let Some(var) = ungrouped(&expr, &available, &aggregates) {
                    return Err(ScopeError::unbound(var.as_str(), "HAVING"));
                }
                having.push(expr);
            }
            for cond in &query.modifiers.order_by {
                let expr = self.aggregate_expression(&cond.expr, &scope, outer, &mut aggregates)?;
                order_keys.push(OrderKey {
                    expr,
                    descending: cond.descending,
                });
            }

            node = AlgebraNode::unary(AlgebraOp::Group { keys, aggregates }, node);
            for (var, expr) in extends {
                node = AlgebraNode::unary(AlgebraOp::Extend { var, expr }, node);
            }
            if let Some(expr) = Expression::conjunction(having) {
                node = AlgebraNode::unary(AlgebraOp::Filter { expr }, node);
            }
        } else {
            for item in select_items {
                match item {
                    SelectItem::Variable(var) => push_projection(&mut projection, var)?,
                    SelectItem::Expression { expr, alias } => {
                        let scope = node.possible_variables();
                        if scope.contains(alias) {
                            return Err(ScopeError::rebound(alias.as_str(), "SELECT expression"));
                        }
                        let expr = self.expression(expr, &scope, outer, "SELECT expression")?;
                        node = AlgebraNode::unary(
                            AlgebraOp::Extend {
                                var: alias.clone(),
                                expr,
                            },
                            node,
                        );
                        push_projection(&mut projection, alias)?;
                    }
                }
            }
            let scope = node.possible_variables();
            for cond in &query.modifiers.order_by {
                let expr = self.expression(&cond.expr, &scope, outer, "ORDER BY")?;
                order_keys.push(OrderKey {
                    expr,
                    descending: cond.descending,
                });
            }
        }

        if !order_keys.is_empty() {
            node = AlgebraNode::unary(AlgebraOp::OrderBy { keys: order_keys }, node);
        }

        match &query.form {
            QueryForm::Select { .. } => {
                let variables = if is_select_all {
                    visible_variables(&node)
                } else {
                    projection
                };
                node = AlgebraNode::unary(AlgebraOp::Project { variables }, node);
            }
            QueryForm::Describe { targets } if !targets.is_empty() => {
                let variables = targets
                    .iter()
                    .filter_map(|target| match target {
                        VarOrIri::Variable(var) => Some(var.clone()),
                        VarOrIri::Iri(_) => None,
                    })
                    .collect();
                node = AlgebraNode::unary(AlgebraOp::Project { variables }, node);
            }
            _ => {}
        }

        match &query.form {
            QueryForm::Select {
                modifier: SelectModifier::Distinct,
                ..
            } => node = AlgebraNode::unary(AlgebraOp::Distinct, node),
            QueryForm::Select {
                modifier: SelectModifier::Reduced,
                ..
            } => node = AlgebraNode::unary(AlgebraOp::Reduced, node),
            _ => {}
        }

        let limit = top.and_then(|o| o.limit).or(query.modifiers.limit);
        let offset = top
            .and_then(|o| o.offset)
            .or(query.modifiers.offset)
            .unwrap_or(0);
        if limit.is_some() || offset > 0 {
            node = AlgebraNode::unary(AlgebraOp::Slice { offset, limit }, node);
        }
        Ok(node)
    }

    fn group(
        &mut self,
        group: &GroupPattern,
        outer: &BTreeSet<Variable>,
    ) -> Result<AlgebraNode, ScopeError> {
        self.group_from(AlgebraNode::unit(), group, outer)
    }

    /// Translates a group whose elements are joined onto `seed`.
    fn group_from(
        &mut self,
        seed: AlgebraNode,
        group: &GroupPattern,
        outer: &BTreeSet<Variable>,
    ) -> Result<AlgebraNode, ScopeError> {
        let (node, filters) = self.group_parts(seed, group, outer)?;
        if filters.is_empty() {
            return Ok(node);
        }
        let scope = node.possible_variables();
        let mut translated = Vec::with_capacity(filters.len());
        for filter in filters {
            translated.push(self.expression(filter, &scope, outer, "FILTER")?);
        }
        check_scope(&translated, &scope, outer, "FILTER")?;
        match Expression::conjunction(translated) {
            Some(expr) => Ok(AlgebraNode::unary(AlgebraOp::Filter { expr }, node)),
            None => Ok(node),
        }
    }

    /// Translates a group, returning its top-level filters untranslated.
    fn group_parts<'q>(
        &mut self,
        seed: AlgebraNode,
        group: &'q GroupPattern,
        outer: &BTreeSet<Variable>,
    ) -> Result<(AlgebraNode, Vec<&'q AstExpression>), ScopeError> {
        let mut acc = seed;
        let mut filters = Vec::new();
        for element in &group.elements {
            match element {
                PatternElement::Triples(triples) => {
                    for triple in triples {
                        let pattern = self.quad_pattern(triple);
                        acc = AlgebraNode::join(acc, AlgebraNode::pattern(pattern));
                    }
                }
                PatternElement::Optional(inner) => {
                    let (right, inner_filters) = self.group_parts(AlgebraNode::unit(), inner, outer)?;
                    let mut scope = acc.possible_variables();
                    scope.extend(right.possible_variables());
                    let mut translated = Vec::with_capacity(inner_filters.len());
                    for filter in inner_filters {
                        translated.push(self.expression(filter, &scope, outer, "OPTIONAL filter")?);
                    }
                    check_scope(&translated, &scope, outer, "OPTIONAL filter")?;
                    acc = AlgebraNode::with_inputs(
                        AlgebraOp::LeftJoin {
                            expr: Expression::conjunction(translated),
                        },
                        vec![acc, right],
                    );
                }
                PatternElement::Minus(inner) => {
                    let right = self.group(inner, outer)?;
                    acc = AlgebraNode::with_inputs(AlgebraOp::Minus, vec![acc, right]);
                }
                PatternElement::Filter(expr) => {
                    if expr.contains_aggregate() {
                        return Err(ScopeError::MisplacedAggregate { context: "FILTER" });
                    }
                    filters.push(expr);
                }
                PatternElement::Bind(expr, var) => {
                    let scope = acc.possible_variables();
                    if scope.contains(var) {
                        return Err(ScopeError::rebound(var.as_str(), "BIND"));
                    }
                    let expr = self.expression(expr, &scope, outer, "BIND")?;
                    acc = AlgebraNode::unary(
                        AlgebraOp::Extend {
                            var: var.clone(),
                            expr,
                        },
                        acc,
                    );
                }
                PatternElement::Graph(name, inner) => {
                    let graph = match name {
                        VarOrIri::Iri(iri) => GraphPattern::Named(iri.clone()),
                        VarOrIri::Variable(var) => GraphPattern::Variable(var.clone()),
                    };
                    let saved = self.graph.replace(graph);
                    let inner = self.group(inner, outer);
                    self.graph = saved;
                    acc = AlgebraNode::join(acc, inner?);
                }
                PatternElement::Values(data) => {
                    acc = AlgebraNode::join(acc, values_node(data));
                }
                PatternElement::Group(inner) => {
                    let inner = self.group(inner, outer)?;
                    acc = AlgebraNode::join(acc, inner);
                }
                PatternElement::Union(branches) => {
                    let mut inputs = Vec::with_capacity(branches.len());
                    for branch in branches {
                        inputs.push(self.group(branch, outer)?);
                    }
                    acc = AlgebraNode::join(acc, AlgebraNode::with_inputs(AlgebraOp::Union, inputs));
                }
                PatternElement::SubSelect(sub) => {
                    let saved = self.graph.take();
                    let inner = self.query(sub, outer, None);
                    self.graph = saved;
                    acc = AlgebraNode::join(acc, inner?);
                }
            }
        }
        Ok((acc, filters))
    }

    fn quad_pattern(&mut self, triple: &TriplePattern) -> QuadPattern {
        let pattern = QuadPattern::new(
            self.pattern_term(&triple.subject),
            self.pattern_term(&triple.predicate),
            self.pattern_term(&triple.object),
        );
        match &self.graph {
            Some(graph) => pattern.in_graph(graph.clone()),
            None => pattern,
        }
    }

    fn pattern_term(&mut self, term: &PatternTerm) -> TermPattern {
        match term {
            PatternTerm::Term(term) => TermPattern::Term(term.clone()),
            PatternTerm::Variable(var) => TermPattern::Variable(var.clone()),
            PatternTerm::BlankNode(label) => {
                if let Some(var) = self.blank_vars.get(label) {
                    return TermPattern::Variable(var.clone());
                }
                let var = self.fresh("b");
                self.blank_vars.insert(label.clone(), var.clone());
                TermPattern::Variable(var)
            }
        }
    }

    /// Translates `EXISTS` bodies with `scope` visible as outer variables.
    fn expression(
        &mut self,
        expr: &AstExpression,
        scope: &BTreeSet<Variable>,
        outer: &BTreeSet<Variable>,
        context: &'static str,
    ) -> Result<AlgebraExpr, ScopeError> {
        if expr.contains_aggregate() {
            return Err(ScopeError::MisplacedAggregate { context });
        }
        let inner_outer: BTreeSet<Variable> = scope.union(outer).cloned().collect();
        expr.try_map_patterns(&mut |pattern: &GroupPattern| self.group(pattern, &inner_outer))
    }

    /// Translates an expression of an aggregate query, replacing aggregate
    /// calls with hidden variables.
    fn aggregate_expression(
        &mut self,
        expr: &AstExpression,
        scope: &BTreeSet<Variable>,
        outer: &BTreeSet<Variable>,
        aggregates: &mut Vec<(Variable, Aggregate<AlgebraNode>)>,
    ) -> Result<AlgebraExpr, ScopeError> {
        let inner_outer: BTreeSet<Variable> = scope.union(outer).cloned().collect();
        let mapped =
            expr.try_map_patterns(&mut |pattern: &GroupPattern| self.group(pattern, &inner_outer))?;
        Ok(self.replace_aggregates(mapped, aggregates))
    }

    fn replace_aggregates(
        &mut self,
        expr: AlgebraExpr,
        aggregates: &mut Vec<(Variable, Aggregate<AlgebraNode>)>,
    ) -> AlgebraExpr {
        match expr {
            Expression::Aggregate(agg) => {
                if let Some((var, _)) = aggregates.iter().find(|(_, existing)| *existing == *agg) {
                    return Expression::Variable(var.clone());
                }
                let var = self.fresh("agg");
                aggregates.push((var.clone(), *agg));
                Expression::Variable(var)
            }
            Expression::Binary(op, left, right) => Expression::Binary(
                op,
                Box::new(self.replace_aggregates(*left, aggregates)),
                Box::new(self.replace_aggregates(*right, aggregates)),
            ),
            Expression::Unary(op, inner) => {
                Expression::Unary(op, Box::new(self.replace_aggregates(*inner, aggregates)))
            }
            Expression::In {
                expr,
                list,
                negated,
            } => Expression::In {
                expr: Box::new(self.replace_aggregates(*expr, aggregates)),
                list: list
                    .into_iter()
                    .map(|item| self.replace_aggregates(item, aggregates))
                    .collect(),
                negated,
            },
            Expression::Call(func, args) => Expression::Call(
                func,
                args.into_iter()
                    .map(|arg| self.replace_aggregates(arg, aggregates))
                    .collect(),
            ),
            other => other,
        }
    }
}

fn ungrouped(
    expr: &AlgebraExpr,
    available: &BTreeSet<Variable>,
    aggregates: &[(Variable, Aggregate<AlgebraNode>)],
) -> Option<Variable> {
    expr.variables().into_iter().find(|var| {
        !available.contains(var) && !aggregates.iter().any(|(agg_var, _)| agg_var == var)
    })
}

fn push_projection(projection: &mut Vec<Variable>, var: &Variable) -> Result<(), ScopeError> {
    if projection.contains(var) {
        return Err(ScopeError::DuplicateProjection {
            var: var.as_str().to_owned(),
        });
    }
    projection.push(var.clone());
    Ok(())
}

fn check_scope(
    exprs: &[AlgebraExpr],
    scope: &BTreeSet<Variable>,
    outer: &BTreeSet<Variable>,
    context: &'static str,
) -> Result<(), ScopeError> {
    for expr in exprs {
        for var in expr.variables() {
            if !scope.contains(&var) && !outer.contains(&var) {
                return Err(ScopeError::unbound(var.as_str(), context));
            }
        }
    }
    Ok(())
}

fn values_node(data: &InlineData) -> AlgebraNode {
    let rows = data
        .rows
        .iter()
        .map(|row| {
            data.variables
                .iter()
                .zip(row)
                .filter_map(|(var, cell)| cell.as_ref().map(|term: &Term| (var.clone(), term.clone())))
                .collect::<Binding>()
        })
        .collect();
    AlgebraNode::new(AlgebraOp::Values {
        variables: data.variables.clone(),
        rows,
    })
}
