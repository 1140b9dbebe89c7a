//! A single node of a tree being grown.
//!
//! Each node is backed by a table in the external store. It computes its
//! statistics with one aggregate query, searches every eligible feature for
//! its best split, and on request materializes its two child tables.
//!
//! ```text
//! Pending --evaluate--> Evaluated --split--> Split
//!                            |
//!                            +--finalize--> Leaf
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TreeParams;
use crate::criterion::Criterion;
use crate::engine::QueryEngine;
use crate::error::TreeError;
use crate::feature::{FeatureCandidate, Side, SplitScorer};
use crate::metric::{MetricValues, NodeMetricSpec};
use crate::sql;
use crate::utils::QueryPool;

/// Index of a node in its [`Tree`](super::Tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a node. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Constructed; statistics not computed yet.
    Pending,
    /// Statistics computed; may be split or finalized.
    Evaluated,
    /// Terminal: no children.
    Leaf,
    /// Terminal: exactly two children.
    Split,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeState::Pending => "pending",
            NodeState::Evaluated => "evaluated",
            NodeState::Leaf => "leaf",
            NodeState::Split => "split",
        })
    }
}

/// Best split found by [`TreeNode::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestSplit {
    /// Position in the node's feature list.
    pub feature: usize,
    /// First candidate value index that goes right.
    pub split_index: usize,
    pub gain: f64,
}

/// Collaborators shared by every node of one fit.
#[derive(Clone, Copy)]
pub struct NodeContext<'a> {
    pub engine: &'a dyn QueryEngine,
    pub metric: &'a NodeMetricSpec,
    pub criterion: &'a dyn Criterion,
    pub params: &'a TreeParams,
    pub pool: &'a QueryPool,
}

impl NodeContext<'_> {
    fn scorer(&self) -> SplitScorer<'_> {
        SplitScorer {
            criterion: self.criterion,
            count_metric: self.metric.count_metric(),
            min_samples_split: self.params.min_samples_split,
            min_samples_leaf: self.params.min_samples_leaf,
        }
    }
}

// =============================================================================
// TreeNode
// =============================================================================

/// One node of the tree.
#[derive(Debug, Clone)]
pub struct TreeNode {
    table: String,
    path: Vec<String>,
    features: Vec<FeatureCandidate>,
    depth: u32,
    state: NodeState,
    stats: Option<MetricValues>,
    total: u64,
    best: Option<BestSplit>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Option<(NodeId, NodeId)>,
}

impl TreeNode {
    /// Root node over `table`. Its path is the always-true predicate.
    pub fn root(table: impl Into<String>, features: Vec<FeatureCandidate>) -> Self {
        Self::new(table.into(), vec![sql::TRUE_PREDICATE.to_string()], features, 0)
    }

    fn new(table: String, path: Vec<String>, features: Vec<FeatureCandidate>, depth: u32) -> Self {
        Self {
            table,
            path,
            features,
            depth,
            state: NodeState::Pending,
            stats: None,
            total: 0,
            best: None,
            parent: None,
            children: None,
        }
    }

    /// Backing table.
    #[inline]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Predicate fragments from the root to this node.
    #[inline]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The path as a single conjunction.
    pub fn path_predicate(&self) -> String {
        sql::conjunction(&self.path)
    }

    #[inline]
    pub fn features(&self) -> &[FeatureCandidate] {
        &self.features
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Aggregate statistics, once evaluated.
    #[inline]
    pub fn stats(&self) -> Option<&MetricValues> {
        self.stats.as_ref()
    }

    /// Row count (0 until evaluated).
    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[inline]
    pub fn best(&self) -> Option<BestSplit> {
        self.best
    }

    #[inline]
    pub fn best_gain(&self) -> Option<f64> {
        self.best.map(|b| b.gain)
    }

    /// The feature this node was split on, with its chosen split index.
    pub fn split_feature(&self) -> Option<&FeatureCandidate> {
        match (self.state, self.best) {
            (NodeState::Split, Some(best)) => self.features.get(best.feature),
            _ => None,
        }
    }

    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> Option<(NodeId, NodeId)> {
        self.children
    }

    /// A node is a leaf iff it has no children.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Finalized as a leaf (no further growth).
    #[inline]
    pub fn is_final_leaf(&self) -> bool {
        self.state == NodeState::Leaf
    }

    fn expect_state(&self, expected: NodeState, label: &'static str) -> Result<(), TreeError> {
        if self.state != expected {
            return Err(TreeError::InvalidState {
                table: self.table.clone(),
                state: self.state,
                expected: label,
            });
        }
        Ok(())
    }

    /// Run the node's aggregate query (`Pending -> Evaluated`).
    pub fn compute_statistics(&mut self, ctx: &NodeContext<'_>) -> Result<(), TreeError> {
        self.expect_state(NodeState::Pending, "pending")?;
        let stats = ctx.metric.build(ctx.engine, &self.table)?;
        self.total = stats.count(ctx.metric.count_metric())?;
        self.stats = Some(stats);
        self.state = NodeState::Evaluated;
        Ok(())
    }

    /// Compute statistics and search for the best split.
    ///
    /// Nodes at `max_depth` or with at most `min_samples_split` rows are
    /// finalized as leaves without a search. Otherwise every eligible feature
    /// is scored (bucket queries run on the pool and are joined first) and the
    /// highest gain is recorded; the first feature wins ties.
    pub fn evaluate(&mut self, ctx: &NodeContext<'_>) -> Result<(), TreeError> {
        self.compute_statistics(ctx)?;

        let params = ctx.params;
        if self.depth >= params.max_depth || self.total <= params.min_samples_split {
            debug!(
                table = %self.table,
                depth = self.depth,
                total = self.total,
                "stopping condition reached"
            );
            self.state = NodeState::Leaf;
            return Ok(());
        }

        for feature in &mut self.features {
            if feature.len() < 2 {
                feature.mark_exhausted();
            }
        }
        let candidates: Vec<usize> = (0..self.features.len())
            .filter(|&i| self.features[i].can_split())
            .collect();

        let table = self.table.as_str();
        let features = &self.features;
        let bucket_stats = ctx.pool.map(&candidates, |&i| {
            ctx.metric.build_buckets(ctx.engine, table, &features[i])
        });

        let node_stats = match &self.stats {
            Some(stats) => stats,
            None => return Err(TreeError::MissingMetric(ctx.metric.count_metric().to_string())),
        };
        let scorer = ctx.scorer();
        let mut best: Option<BestSplit> = None;
        let mut exhausted = Vec::new();
        for (&i, buckets) in candidates.iter().zip(bucket_stats) {
            let buckets = buckets?;
            match self.features[i].score_split(&scorer, node_stats, &buckets)? {
                Some(c) => {
                    if best.map_or(true, |b| c.gain > b.gain) {
                        best = Some(BestSplit {
                            feature: i,
                            split_index: c.split_index,
                            gain: c.gain,
                        });
                    }
                }
                None => exhausted.push(i),
            }
        }
        // No split of these values can leave min_samples_leaf rows on both
        // sides here, and descendants only see fewer rows.
        for i in exhausted {
            self.features[i].mark_exhausted();
        }

        self.best = best;
        debug!(
            table = %self.table,
            depth = self.depth,
            total = self.total,
            feature = best.map(|b| self.features[b.feature].name()),
            gain = best.map(|b| b.gain),
            "evaluated node"
        );
        Ok(())
    }

    /// Finalize an evaluated node as a leaf.
    pub fn finalize_leaf(&mut self) -> Result<(), TreeError> {
        if self.state == NodeState::Leaf {
            return Ok(());
        }
        self.expect_state(NodeState::Evaluated, "evaluated")?;
        self.state = NodeState::Leaf;
        Ok(())
    }

    /// Split on the best feature found by [`evaluate`](Self::evaluate).
    ///
    /// Without a split whose gain exceeds `epsilon`, the node becomes a leaf
    /// and `Ok(None)` is returned. Otherwise both child tables are created
    /// (`path AND side predicate` over this node's table) and the two new
    /// `Pending` children are returned for the caller to attach.
    ///
    /// Every table that exists once this returns is pushed to `created`,
    /// including one that could not be dropped after a failure. If either
    /// table cannot be created, whatever was created is dropped, the node
    /// stays `Evaluated`, and [`TreeError::TableMaterializationFailed`] is
    /// returned.
    pub fn split(
        &mut self,
        ctx: &NodeContext<'_>,
        created: &mut Vec<String>,
    ) -> Result<Option<(TreeNode, TreeNode)>, TreeError> {
        self.expect_state(NodeState::Evaluated, "evaluated")?;

        let best = match self.best {
            Some(best) if best.gain > ctx.params.epsilon => best,
            _ => {
                self.state = NodeState::Leaf;
                return Ok(None);
            }
        };

        let feature = self.features[best.feature].with_split(best.split_index)?;
        let (left_table, right_table) = self.child_tables();

        self.materialize(ctx, &left_table, &feature, Side::Left, created)?;
        if let Err(err) = self.materialize(ctx, &right_table, &feature, Side::Right, created) {
            discard(ctx.engine, left_table, created);
            return Err(err);
        }

        self.features[best.feature] = feature;
        let left = self.child(left_table, Side::Left, best.feature);
        let right = self.child(right_table, Side::Right, best.feature);
        self.state = NodeState::Split;
        Ok(Some((left, right)))
    }

    /// Names of the tables backing this node's children.
    pub fn child_tables(&self) -> (String, String) {
        (format!("{}_L", self.table), format!("{}_R", self.table))
    }

    fn materialize(
        &self,
        ctx: &NodeContext<'_>,
        name: &str,
        feature: &FeatureCandidate,
        side: Side,
        created: &mut Vec<String>,
    ) -> Result<(), TreeError> {
        let predicate = feature
            .predicate(side)
            .ok_or_else(|| TreeError::invalid_feature(feature.name(), "no split chosen"))?;
        let mut path = self.path.clone();
        path.push(predicate);
        let query = sql::select_where(&self.table, &sql::conjunction(&path));

        let failed = |source| TreeError::TableMaterializationFailed {
            table: name.to_string(),
            source,
        };
        ctx.engine.drop_table_if_exists(name).map_err(failed)?;
        let result = match ctx.params.table_lifecycle_days {
            Some(days) => ctx.engine.create_table_with_lifecycle(name, &query, days),
            None => ctx.engine.create_table_as(name, &query),
        };
        if let Err(source) = result {
            // A failed CREATE TABLE AS can leave a partial table behind.
            created.push(name.to_string());
            discard(ctx.engine, name.to_string(), created);
            return Err(failed(source));
        }
        created.push(name.to_string());
        debug!(table = name, parent = %self.table, "materialized child table");
        Ok(())
    }

    fn child(&self, table: String, side: Side, split_feature: usize) -> TreeNode {
        let mut path = self.path.clone();
        if let Some(predicate) = self.features[split_feature].predicate(side) {
            path.push(predicate);
        }
        let features = self.features.iter().map(|f| f.derive(side)).collect();
        TreeNode::new(table, path, features, self.depth + 1)
    }
}

/// Drop `table` and remove it from `created`. A table that cannot be dropped
/// stays in `created` for later cleanup.
fn discard(engine: &dyn QueryEngine, table: String, created: &mut Vec<String>) {
    match engine.drop_table_if_exists(&table) {
        Ok(()) => {
            created.retain(|t| *t != table);
        }
        Err(err) => {
            warn!(table = %table, error = %err, "failed to drop orphaned child table");
        }
    }
}
