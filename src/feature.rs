//! Feature split candidates.
//!
//! A [`FeatureCandidate`] holds one feature's remaining search space: an
//! ordered list of quantile boundaries (numerical) or category labels
//! (categorical). Splitting at index `i` sends values `[0, i)` left and
//! `[i, n)` right, and each child inherits exactly its side of the list via
//! [`derive`](FeatureCandidate::derive).
//!
//! # Row routing
//!
//! | kind        | left                | right                                |
//! |-------------|---------------------|--------------------------------------|
//! | numerical   | `x < v[i]`          | `(x >= v[i] OR x IS NULL)`           |
//! | categorical | `x IN (v[0..i))`    | `(x NOT IN (v[0..i)) OR x IS NULL)`  |
//!
//! Missing values and unlisted categories always go right, which is also where
//! [`bucket_expression`](FeatureCandidate::bucket_expression) puts them (the
//! last bucket), so bucket sums and materialized partitions agree.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::criterion::Criterion;
use crate::error::TreeError;
use crate::metric::{BucketStats, MetricValues};
use crate::sql;

/// Feature type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Numerical,
    Categorical,
}

/// Which child a derivation or predicate is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

/// Candidate values, tagged by feature kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum CandidateValues {
    /// Strictly increasing, finite quantile boundaries.
    Numerical(Vec<f64>),
    /// Distinct category labels in grouping order.
    Categorical(Vec<String>),
}

impl CandidateValues {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::Numerical(v) => v.len(),
            Self::Categorical(v) => v.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::Numerical(_) => FeatureKind::Numerical,
            Self::Categorical(_) => FeatureKind::Categorical,
        }
    }

    fn slice(&self, range: std::ops::Range<usize>) -> Self {
        match self {
            Self::Numerical(v) => Self::Numerical(v[range].to_vec()),
            Self::Categorical(v) => Self::Categorical(v[range].to_vec()),
        }
    }

    /// SQL literal of value `k`.
    fn literal(&self, k: usize) -> String {
        match self {
            Self::Numerical(v) => sql::numeric_literal(v[k]),
            Self::Categorical(v) => sql::quote_literal(&v[k]),
        }
    }
}

/// Best split of one feature at one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitCandidate {
    /// First value index that goes right.
    pub split_index: usize,
    pub gain: f64,
}

/// Everything [`FeatureCandidate::score_split`] needs besides the statistics.
#[derive(Clone, Copy)]
pub struct SplitScorer<'a> {
    pub criterion: &'a dyn Criterion,
    /// Name of the row-count metric.
    pub count_metric: &'a str,
    /// Nodes with fewer rows are not searched.
    pub min_samples_split: u64,
    /// Both sides of a split need at least this many rows.
    pub min_samples_leaf: u64,
}

// =============================================================================
// FeatureCandidate
// =============================================================================

/// One feature's split candidates and, once decided, its chosen split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCandidate {
    name: String,
    values: CandidateValues,
    split: Option<usize>,
    eligible: bool,
}

impl FeatureCandidate {
    /// Numerical feature with quantile boundaries.
    ///
    /// Values must be finite and strictly increasing.
    pub fn numerical(name: impl Into<String>, values: Vec<f64>) -> Result<Self, TreeError> {
        let name = name.into();
        if let Some(v) = values.iter().find(|v| !v.is_finite()) {
            return Err(TreeError::invalid_feature(&name, format!("non-finite value {}", v)));
        }
        if values.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TreeError::invalid_feature(
                &name,
                "values must be strictly increasing",
            ));
        }
        Self::new(name, CandidateValues::Numerical(values))
    }

    /// Categorical feature with category labels in grouping order.
    pub fn categorical<I, S>(name: impl Into<String>, values: I) -> Result<Self, TreeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let mut seen = HashSet::with_capacity(values.len());
        if let Some(dup) = values.iter().find(|v| !seen.insert(v.as_str())) {
            return Err(TreeError::invalid_feature(&name, format!("duplicate category {:?}", dup)));
        }
        Self::new(name, CandidateValues::Categorical(values))
    }

    fn new(name: String, values: CandidateValues) -> Result<Self, TreeError> {
        if name.trim().is_empty() {
            return Err(TreeError::invalid_feature(&name, "empty name"));
        }
        if values.is_empty() {
            return Err(TreeError::invalid_feature(&name, "no candidate values"));
        }
        let eligible = values.len() >= 2;
        Ok(Self {
            name,
            values,
            split: None,
            eligible,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> FeatureKind {
        self.values.kind()
    }

    #[inline]
    pub fn values(&self) -> &CandidateValues {
        &self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the feature may still be split in this subtree.
    #[inline]
    pub fn is_eligible(&self) -> bool {
        self.eligible
    }

    /// Eligible and at least two values left.
    #[inline]
    pub fn can_split(&self) -> bool {
        self.eligible && self.len() >= 2
    }

    /// Chosen split index, if decided.
    #[inline]
    pub fn split_index(&self) -> Option<usize> {
        self.split
    }

    /// Mark the feature as exhausted for this subtree and all descendants.
    pub fn mark_exhausted(&mut self) {
        self.eligible = false;
    }

    /// Copy of this feature with split index `i` chosen.
    pub fn with_split(&self, i: usize) -> Result<Self, TreeError> {
        if i == 0 || i >= self.len() {
            return Err(TreeError::invalid_feature(
                &self.name,
                format!("split index {} outside 1..{}", i, self.len()),
            ));
        }
        Ok(Self {
            split: Some(i),
            ..self.clone()
        })
    }

    /// Remaining search space for one child.
    ///
    /// With split index `i`, left keeps `[0, i)` and right keeps `[i, n)`.
    /// A feature without a chosen split passes through unchanged. Derived
    /// features have no split and stay ineligible once ineligible.
    pub fn derive(&self, side: Side) -> Self {
        let values = match (self.split, side) {
            (Some(i), Side::Left) => self.values.slice(0..i),
            (Some(i), Side::Right) => self.values.slice(i..self.len()),
            (None, _) => self.values.clone(),
        };
        let eligible = self.eligible && values.len() >= 2;
        Self {
            name: self.name.clone(),
            values,
            split: None,
            eligible,
        }
    }

    /// Filter selecting the rows of `side` for the chosen split.
    pub fn predicate(&self, side: Side) -> Option<String> {
        let i = self.split?;
        let x = &self.name;
        Some(match (&self.values, side) {
            (CandidateValues::Numerical(_), Side::Left) => {
                format!("{} < {}", x, self.values.literal(i))
            }
            (CandidateValues::Numerical(_), Side::Right) => {
                format!("({} >= {} OR {} IS NULL)", x, self.values.literal(i), x)
            }
            (CandidateValues::Categorical(_), Side::Left) => {
                format!("{} IN ({})", x, self.left_set(i))
            }
            (CandidateValues::Categorical(_), Side::Right) => {
                format!("({} NOT IN ({}) OR {} IS NULL)", x, self.left_set(i), x)
            }
        })
    }

    #[inline]
    pub fn left_predicate(&self) -> Option<String> {
        self.predicate(Side::Left)
    }

    #[inline]
    pub fn right_predicate(&self) -> Option<String> {
        self.predicate(Side::Right)
    }

    fn left_set(&self, i: usize) -> String {
        (0..i)
            .map(|k| self.values.literal(k))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Expression assigning each row to a bucket in `0..n`.
    ///
    /// Split `i` sends bucket `k` left iff `k < i`.
    pub fn bucket_expression(&self) -> String {
        let n = self.len();
        if n < 2 {
            return "0".to_string();
        }
        let mut expr = String::from("CASE");
        for k in 0..n - 1 {
            let cond = match &self.values {
                CandidateValues::Numerical(_) => {
                    format!("{} < {}", self.name, self.values.literal(k + 1))
                }
                CandidateValues::Categorical(_) => {
                    format!("{} = {}", self.name, self.values.literal(k))
                }
            };
            expr.push_str(&format!(" WHEN {} THEN {}", cond, k));
        }
        expr.push_str(&format!(" ELSE {} END", n - 1));
        expr
    }

    /// Score every split index against the node's bucket statistics.
    ///
    /// Returns the highest-gain split (lowest index on ties), or `None` when
    /// there is no feasible split: fewer than two values, an exhausted
    /// feature, a node below `min_samples_split`, or no split leaving
    /// `min_samples_leaf` rows on both sides.
    pub fn score_split(
        &self,
        scorer: &SplitScorer<'_>,
        node_stats: &MetricValues,
        buckets: &BucketStats,
    ) -> Result<Option<SplitCandidate>, TreeError> {
        if !self.can_split() {
            return Ok(None);
        }
        let total = node_stats.count(scorer.count_metric)?;
        if total < scorer.min_samples_split {
            return Ok(None);
        }

        let n = self.len();
        if buckets.len() != n {
            return Err(TreeError::invalid_feature(
                &self.name,
                format!("{} buckets for {} candidate values", buckets.len(), n),
            ));
        }

        let mut best: Option<SplitCandidate> = None;
        let mut left = MetricValues::default();
        for i in 1..n {
            left.accumulate(buckets.bucket(i - 1));
            let right = buckets.sum(i..n);

            let n_left = left.count(scorer.count_metric)?;
            let n_right = right.count(scorer.count_metric)?;
            if n_left < scorer.min_samples_leaf || n_right < scorer.min_samples_leaf {
                continue;
            }

            let gain = scorer.criterion.split_gain(node_stats, &left, &right)?;
            if best.map_or(!gain.is_nan(), |b| gain > b.gain) {
                best = Some(SplitCandidate {
                    split_index: i,
                    gain,
                });
            }
        }

        debug!(
            feature = %self.name,
            split_index = best.map(|b| b.split_index),
            gain = best.map(|b| b.gain),
            "scored feature"
        );
        Ok(best)
    }
}
