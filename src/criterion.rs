//! Split criteria over aggregate statistics.
//!
//! A [`Criterion`] turns the parent's statistics and a candidate split's
//! left/right statistics into a gain. The grower compares gains of different
//! leaves against each other and against `epsilon`, so a gain must be on the
//! same scale for every node of a tree. Both built-ins report the absolute
//! impurity removed, in the units of the target.
//!
//! Any closure `Fn(&MetricValues, &MetricValues, &MetricValues) -> Result<f64, TreeError>`
//! is a criterion too.

use crate::error::TreeError;
use crate::metric::MetricValues;

/// Scores a candidate split.
pub trait Criterion: Send + Sync {
    /// Gain of splitting `parent` into `left` and `right`.
    ///
    /// Missing statistics must be reported as errors, not treated as zero.
    fn split_gain(
        &self,
        parent: &MetricValues,
        left: &MetricValues,
        right: &MetricValues,
    ) -> Result<f64, TreeError>;

    /// Metrics the criterion reads. Checked against the
    /// [`NodeMetricSpec`](crate::NodeMetricSpec) before growth starts.
    fn required_metrics(&self) -> Vec<&str> {
        Vec::new()
    }
}

impl<F> Criterion for F
where
    F: Fn(&MetricValues, &MetricValues, &MetricValues) -> Result<f64, TreeError> + Send + Sync,
{
    fn split_gain(
        &self,
        parent: &MetricValues,
        left: &MetricValues,
        right: &MetricValues,
    ) -> Result<f64, TreeError> {
        self(parent, left, right)
    }
}

/// Impurity removed by a split, never negative.
#[inline]
fn reduction(parent: f64, left: f64, right: f64) -> f64 {
    (parent - left - right).max(0.0)
}

// =============================================================================
// VarianceReduction
// =============================================================================

/// Within-node sum of squares removed by a split.
///
/// ```text
/// SSE(n, s, q) = q - s² / n
/// gain = SSE_P - SSE_L - SSE_R
/// ```
///
/// where `n`, `s`, `q` are the row count, sum and sum of squares of the
/// target, e.g. `COUNT(1)`, `SUM(y)`, `SUM(y * y)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarianceReduction {
    pub count: String,
    pub sum: String,
    pub sum_sq: String,
}

impl VarianceReduction {
    pub fn new(
        count: impl Into<String>,
        sum: impl Into<String>,
        sum_sq: impl Into<String>,
    ) -> Self {
        Self {
            count: count.into(),
            sum: sum.into(),
            sum_sq: sum_sq.into(),
        }
    }

    fn sse(&self, stats: &MetricValues) -> Result<f64, TreeError> {
        let n = stats.require(&self.count)?;
        let s = stats.require(&self.sum)?;
        let q = stats.require(&self.sum_sq)?;
        if n <= 0.0 {
            return Ok(0.0);
        }
        Ok((q - s * s / n).max(0.0))
    }
}

impl Criterion for VarianceReduction {
    fn split_gain(
        &self,
        parent: &MetricValues,
        left: &MetricValues,
        right: &MetricValues,
    ) -> Result<f64, TreeError> {
        Ok(reduction(
            self.sse(parent)?,
            self.sse(left)?,
            self.sse(right)?,
        ))
    }

    fn required_metrics(&self) -> Vec<&str> {
        vec![self.count.as_str(), self.sum.as_str(), self.sum_sq.as_str()]
    }
}

// =============================================================================
// GiniReduction
// =============================================================================

/// Count-weighted Gini impurity of a binary outcome removed by a split.
///
/// ```text
/// G(n, p) = 2 · p · (1 - p / n)
/// gain = G_P - G_L - G_R
/// ```
///
/// where `p` is the number of positive rows, e.g. `SUM(IF(label = 1, 1, 0))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiniReduction {
    pub count: String,
    pub positives: String,
}

impl GiniReduction {
    pub fn new(count: impl Into<String>, positives: impl Into<String>) -> Self {
        Self {
            count: count.into(),
            positives: positives.into(),
        }
    }

    fn impurity(&self, stats: &MetricValues) -> Result<f64, TreeError> {
        let n = stats.require(&self.count)?;
        let p = stats.require(&self.positives)?;
        if n <= 0.0 {
            return Ok(0.0);
        }
        Ok((2.0 * p * (1.0 - p / n)).max(0.0))
    }
}

impl Criterion for GiniReduction {
    fn split_gain(
        &self,
        parent: &MetricValues,
        left: &MetricValues,
        right: &MetricValues,
    ) -> Result<f64, TreeError> {
        Ok(reduction(
            self.impurity(parent)?,
            self.impurity(left)?,
            self.impurity(right)?,
        ))
    }

    fn required_metrics(&self) -> Vec<&str> {
        vec![self.count.as_str(), self.positives.as_str()]
    }
}
