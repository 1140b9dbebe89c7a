//! Node statistics declared as aggregate expressions.
//!
//! A [`NodeMetricSpec`] lists what every node must compute (metric name ->
//! aggregate expression). It is shared by all nodes of a tree and holds no
//! per-node state: each call renders one query and returns fresh values.
//!
//! Metrics must be additive (`COUNT`, `SUM`, ...). Split search sums bucket
//! rows into left/right statistics, which is only meaningful for additive
//! aggregates; ratios belong in the [`Criterion`](crate::Criterion).

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{QueryEngine, TabularResult};
use crate::error::TreeError;
use crate::feature::FeatureCandidate;
use crate::sql;

/// Name of the row-count metric unless configured otherwise.
pub const DEFAULT_COUNT_METRIC: &str = "total";

// =============================================================================
// MetricValues
// =============================================================================

/// Aggregate values keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricValues {
    values: BTreeMap<String, f64>,
}

impl MetricValues {
    /// All-zero statistics for the given names (an empty bucket).
    pub fn zeros<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            values: names.into_iter().map(|n| (n.to_string(), 0.0)).collect(),
        }
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Value of `name`, or [`TreeError::MissingMetric`].
    pub fn require(&self, name: &str) -> Result<f64, TreeError> {
        self.get(name)
            .ok_or_else(|| TreeError::MissingMetric(name.to_string()))
    }

    /// Row count stored under `name`.
    pub fn count(&self, name: &str) -> Result<u64, TreeError> {
        let v = self.require(name)?;
        if !v.is_finite() || v < 0.0 {
            return Err(TreeError::MissingMetric(format!(
                "{} (not a valid row count: {})",
                name, v
            )));
        }
        Ok(v.round() as u64)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    /// Add `other` element-wise. Names only present in `other` are inserted.
    pub fn accumulate(&mut self, other: &MetricValues) {
        for (name, v) in &other.values {
            *self.values.entry(name.clone()).or_insert(0.0) += v;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// =============================================================================
// BucketStats
// =============================================================================

/// Per-bucket statistics for one feature at one node.
///
/// Bucket `k` holds the rows a split at index `i` sends left iff `k < i`,
/// so the left side of split `i` is the sum of buckets `[0, i)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketStats {
    buckets: Vec<MetricValues>,
}

impl BucketStats {
    pub fn new(buckets: Vec<MetricValues>) -> Self {
        Self { buckets }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[inline]
    pub fn bucket(&self, k: usize) -> &MetricValues {
        &self.buckets[k]
    }

    /// Sum of buckets in `range`.
    pub fn sum(&self, range: std::ops::Range<usize>) -> MetricValues {
        let mut acc = MetricValues::default();
        for b in &self.buckets[range] {
            acc.accumulate(b);
        }
        acc
    }
}

// =============================================================================
// NodeMetricSpec
// =============================================================================

/// Declares the aggregate statistics every node computes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetricSpec {
    metrics: Vec<(String, String)>,
    count_metric: String,
}

impl NodeMetricSpec {
    /// Create a spec from `(name, expression)` pairs, in projection order.
    ///
    /// The row-count metric defaults to [`DEFAULT_COUNT_METRIC`] and must be
    /// among the metrics.
    pub fn new<I, K, V>(metrics: I) -> Result<Self, TreeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::with_count_metric(metrics, DEFAULT_COUNT_METRIC)
    }

    /// Like [`new`](Self::new) with an explicit row-count metric name.
    pub fn with_count_metric<I, K, V>(metrics: I, count_metric: &str) -> Result<Self, TreeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let metrics: Vec<(String, String)> = metrics
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        if metrics.is_empty() {
            return Err(TreeError::InvalidMetricSpec("no metrics declared".into()));
        }
        let mut seen = HashSet::new();
        for (name, expr) in &metrics {
            if name.trim().is_empty() || expr.trim().is_empty() {
                return Err(TreeError::InvalidMetricSpec(
                    "metric names and expressions must be non-empty".into(),
                ));
            }
            if name.eq_ignore_ascii_case(sql::BUCKET_COLUMN) {
                return Err(TreeError::InvalidMetricSpec(format!(
                    "{} is reserved",
                    sql::BUCKET_COLUMN
                )));
            }
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(TreeError::InvalidMetricSpec(format!(
                    "duplicate metric {:?}",
                    name
                )));
            }
        }
        if !metrics.iter().any(|(name, _)| name == count_metric) {
            return Err(TreeError::InvalidMetricSpec(format!(
                "count metric {:?} is not declared",
                count_metric
            )));
        }

        Ok(Self {
            metrics,
            count_metric: count_metric.to_string(),
        })
    }

    #[inline]
    pub fn count_metric(&self) -> &str {
        &self.count_metric
    }

    /// Declared `(name, expression)` pairs.
    #[inline]
    pub fn metrics(&self) -> &[(String, String)] {
        &self.metrics
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|(n, _)| n.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.iter().any(|(n, _)| n == name)
    }

    /// The aggregate query issued by [`build`](Self::build).
    pub fn render_query(&self, table: &str) -> String {
        sql::select_aggregates(&self.metrics, table)
    }

    /// The grouped query issued by [`build_buckets`](Self::build_buckets).
    pub fn render_bucket_query(&self, table: &str, feature: &FeatureCandidate) -> String {
        sql::select_bucket_aggregates(&feature.bucket_expression(), &self.metrics, table)
    }

    /// Compute node statistics for `table` with one blocking query.
    ///
    /// Rows of the result are summed, so engines that return partial
    /// aggregates in several rows are handled. An empty result, a missing
    /// metric column, or a non-numeric cell is an error; nothing defaults to 0.
    pub fn build(&self, engine: &dyn QueryEngine, table: &str) -> Result<MetricValues, TreeError> {
        let query = self.render_query(table);
        let result = engine
            .query(&query)
            .map_err(|e| TreeError::query(query.as_str(), e))?;
        if result.is_empty() {
            return Err(TreeError::malformed(query, "aggregate query returned no rows"));
        }

        let mut values = MetricValues::zeros(self.names());
        for row in 0..result.num_rows() {
            values.accumulate(&self.read_row(&query, &result, row)?);
        }
        debug!(table, rows = result.num_rows(), "built node statistics");
        Ok(values)
    }

    /// Compute per-bucket statistics of `feature` on `table` with one
    /// blocking grouped query.
    ///
    /// Buckets with no rows are absent from a `GROUP BY` result and come back
    /// as zeros; bucket ids outside the feature's range are malformed.
    pub fn build_buckets(
        &self,
        engine: &dyn QueryEngine,
        table: &str,
        feature: &FeatureCandidate,
    ) -> Result<BucketStats, TreeError> {
        let query = self.render_bucket_query(table, feature);
        let result = engine
            .query(&query)
            .map_err(|e| TreeError::query(query.as_str(), e))?;

        let n = feature.len();
        let bucket_col = result
            .column_index(sql::BUCKET_COLUMN)
            .ok_or_else(|| TreeError::malformed(query.as_str(), "bucket column missing"))?;

        let mut buckets = vec![MetricValues::zeros(self.names()); n];
        for row in 0..result.num_rows() {
            let k = result.rows()[row][bucket_col]
                .as_i64()
                .filter(|&k| k >= 0 && (k as usize) < n)
                .ok_or_else(|| {
                    TreeError::malformed(
                        query.as_str(),
                        format!(
                            "bucket id {:?} outside 0..{}",
                            result.rows()[row][bucket_col],
                            n
                        ),
                    )
                })?;
            buckets[k as usize].accumulate(&self.read_row(&query, &result, row)?);
        }
        Ok(BucketStats::new(buckets))
    }

    fn read_row(
        &self,
        query: &str,
        result: &TabularResult,
        row: usize,
    ) -> Result<MetricValues, TreeError> {
        let mut values = MetricValues::default();
        for (name, _) in &self.metrics {
            let cell = result
                .value(row, name)
                .ok_or_else(|| TreeError::malformed(query, format!("column {} missing", name)))?;
            let v = cell.as_f64().ok_or_else(|| {
                TreeError::malformed(query, format!("column {} is not numeric: {:?}", name, cell))
            })?;
            values.insert(name.clone(), v);
        }
        Ok(values)
    }
}
