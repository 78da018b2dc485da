//! Cardinality estimates consulted by the optimizer and planner.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::model::QuadPattern;
use crate::query::algebra::{AlgebraNode, AlgebraOp};
use crate::source::SourceSet;

/// Row estimate used when nothing better is known.
pub const DEFAULT_PATTERN_ESTIMATE: f64 = 1_000.0;

const FILTER_SELECTIVITY: f64 = 0.5;
const GROUP_REDUCTION: f64 = 0.1;

/// Source of row-count estimates.
pub trait CardinalityEstimator {
    /// Estimated matches for a single pattern.
    fn pattern(&self, pattern: &QuadPattern) -> f64;

    /// Estimated output rows of a subtree.
    fn estimate(&self, node: &AlgebraNode) -> f64 {
        estimate_tree(self, node)
    }
}

/// Estimates a subtree with `pattern` supplying leaf counts.
pub fn estimate_tree<E: CardinalityEstimator + ?Sized>(estimator: &E, node: &AlgebraNode) -> f64 {
    let child = |idx: usize| {
        node.inputs
            .get(idx)
            .map(|input| estimator.estimate(input))
            .unwrap_or(1.0)
    };
    match &node.op {
        AlgebraOp::Pattern(pattern) => estimator.pattern(pattern),
        AlgebraOp::Unit => 1.0,
        AlgebraOp::Values { rows, .. } => rows.len() as f64,
        AlgebraOp::Join => {
            let mut estimates = node.inputs.iter().map(|input| estimator.estimate(input));
            let Some(first) = estimates.next() else {
                return 1.0;
            };
            // Joined inputs usually share variables; the smallest side bounds the result.
            estimates.fold(first, f64::min)
        }
        AlgebraOp::LeftJoin { .. } | AlgebraOp::Minus => child(0),
        AlgebraOp::Union => node.inputs.iter().map(|input| estimator.estimate(input)).sum(),
        AlgebraOp::Filter { .. } => child(0) * FILTER_SELECTIVITY,
        AlgebraOp::Group { keys, .. } => {
            if keys.is_empty() {
                1.0
            } else {
                (child(0) * GROUP_REDUCTION).max(1.0)
            }
        }
        AlgebraOp::Slice { limit, .. } => match limit {
            Some(limit) => child(0).min(*limit as f64),
            None => child(0),
        },
        AlgebraOp::Extend { .. }
        | AlgebraOp::Project { .. }
        | AlgebraOp::Distinct
        | AlgebraOp::Reduced
        | AlgebraOp::OrderBy { .. } => child(0),
    }
}

/// Estimator that ranks patterns by how many slots are constant.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicEstimator;

impl CardinalityEstimator for HeuristicEstimator {
    fn pattern(&self, pattern: &QuadPattern) -> f64 {
        let shape = pattern.shape(&Default::default());
        let bound = [shape.subject, shape.predicate, shape.object]
            .iter()
            .filter(|bound| **bound)
            .count();
        let base = match bound {
            3 => 1.0,
            2 => 10.0,
            1 if shape.predicate => DEFAULT_PATTERN_ESTIMATE / 2.0,
            1 => 100.0,
            _ => DEFAULT_PATTERN_ESTIMATE * 10.0,
        };
        if shape.graph {
            base / 2.0
        } else {
            base
        }
    }
}

/// Estimator backed by the `count` of every adapter in a source set.
///
/// Counts are cached per pattern; failing counts fall back to the heuristic.
pub struct SourceSetEstimator<'a> {
    sources: &'a SourceSet,
    cache: Mutex<FxHashMap<QuadPattern, f64>>,
}

impl<'a> SourceSetEstimator<'a> {
    /// Creates an estimator over `sources`.
    pub fn new(sources: &'a SourceSet) -> Self {
        Self {
            sources,
            cache: Mutex::new(FxHashMap::default()),
        }
    }
}

impl CardinalityEstimator for SourceSetEstimator<'_> {
    fn pattern(&self, pattern: &QuadPattern) -> f64 {
        if let Some(cached) = self.cache.lock().get(pattern) {
            return *cached;
        }
        let mut total = 0.0;
        for (_, source) in self.sources.iter() {
            match source.count(pattern) {
                Ok(count) => total += count as f64,
                Err(err) => {
                    debug!(source = source.name(), error = %err, "stats.count_failed");
                    total += HeuristicEstimator.pattern(pattern);
                }
            }
        }
        self.cache.lock().insert(pattern.clone(), total);
        total
    }
}
