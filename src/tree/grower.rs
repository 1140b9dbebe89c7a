//! Leaf-wise tree growth.
//!
//! [`ClusteringDecisionTree`] keeps a frontier of the current leaves and, on
//! every iteration, splits the single leaf whose best split has the highest
//! gain (LightGBM-style best-first growth), until the leaf budget is spent or
//! no leaf has a split worth taking.
//!
//! # Algorithm
//!
//! 1. Evaluate every `Pending` frontier member (statistics + split search)
//! 2. Finalize members whose best gain does not exceed `epsilon`
//! 3. Pick the member with the highest gain (earliest insertion on ties)
//! 4. Split it: materialize two child tables, replace it by its children
//! 5. Repeat while the frontier has fewer than `max_leaves` members
//!
//! Every table created during a fit is recorded. If the fit fails or is
//! cancelled, all of them are dropped before the error is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::arena::Tree;
use super::node::{NodeContext, NodeId, NodeState, TreeNode};
use super::summary::TreeSummary;
use crate::config::{MaterializationPolicy, TreeParams};
use crate::criterion::Criterion;
use crate::engine::QueryEngine;
use crate::error::TreeError;
use crate::feature::FeatureCandidate;
use crate::metric::NodeMetricSpec;
use crate::sql;
use crate::utils::QueryPool;

/// Column added by [`ClusteringDecisionTree::predict`].
pub const LEAF_COLUMN: &str = "leaf_id";

// =============================================================================
// TableLedger
// =============================================================================

/// Tables created by the grower, in creation order.
#[derive(Debug, Default)]
struct TableLedger {
    tables: Vec<String>,
}

impl TableLedger {
    /// Drop every recorded table, newest first. Failures are logged and the
    /// remaining tables are still attempted.
    fn drop_all(self, engine: &dyn QueryEngine) {
        for table in self.tables.iter().rev() {
            if let Err(err) = engine.drop_table_if_exists(table) {
                warn!(table = %table, error = %err, "failed to drop table during cleanup");
            }
        }
    }
}

// =============================================================================
// ClusteringDecisionTree
// =============================================================================

/// Decision tree grown leaf-wise over tables in an external query engine.
///
/// # Example
///
/// ```ignore
/// use clustree::{
///     ClusteringDecisionTree, FeatureCandidate, NodeMetricSpec, TreeParams, VarianceReduction,
/// };
///
/// let metric = NodeMetricSpec::new([
///     ("total", "COUNT(1)"),
///     ("sum_y", "SUM(y)"),
///     ("sum_y2", "SUM(y * y)"),
/// ])?;
/// let features = vec![FeatureCandidate::numerical("age", vec![18.0, 25.0, 35.0, 50.0])?];
///
/// let mut tree = ClusteringDecisionTree::new(
///     TreeParams::builder().max_leaves(8).build()?,
///     VarianceReduction::new("total", "sum_y", "sum_y2"),
/// );
/// tree.fit(&engine, "samples", features, &metric)?;
/// tree.predict(&engine, "new_samples", "new_samples_leaf")?;
/// ```
pub struct ClusteringDecisionTree {
    params: TreeParams,
    criterion: Arc<dyn Criterion>,
    tree: Option<Tree>,
    frontier: Vec<NodeId>,
    created_tables: Vec<String>,
    cancel: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for ClusteringDecisionTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteringDecisionTree")
            .field("params", &self.params)
            .field("tree", &self.tree)
            .field("frontier", &self.frontier)
            .field("created_tables", &self.created_tables)
            .finish_non_exhaustive()
    }
}

impl ClusteringDecisionTree {
    /// Create an unfitted tree.
    pub fn new(params: TreeParams, criterion: impl Criterion + 'static) -> Self {
        Self {
            params,
            criterion: Arc::new(criterion),
            tree: None,
            frontier: Vec::new(),
            created_tables: Vec::new(),
            cancel: None,
        }
    }

    /// Abort growth once `flag` is set. Checked before every iteration.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[inline]
    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    /// The fitted tree.
    #[inline]
    pub fn tree(&self) -> Option<&Tree> {
        self.tree.as_ref()
    }

    #[inline]
    pub fn root(&self) -> Option<&TreeNode> {
        self.tree.as_ref().map(Tree::root)
    }

    /// Leaves of the fitted tree, in the order they joined the frontier.
    #[inline]
    pub fn frontier(&self) -> &[NodeId] {
        &self.frontier
    }

    /// Final leaves, in the order they joined the frontier.
    pub fn leaves(&self) -> Vec<&TreeNode> {
        match &self.tree {
            Some(tree) => self.frontier.iter().map(|&id| tree.node(id)).collect(),
            None => Vec::new(),
        }
    }

    /// Tables created by the last successful fit, in creation order.
    #[inline]
    pub fn created_tables(&self) -> &[String] {
        &self.created_tables
    }

    /// Grow a tree over `root_table`.
    ///
    /// Any previously fitted tree is discarded first and its tables dropped.
    /// The root table belongs to the caller and is never dropped.
    ///
    /// # Errors
    ///
    /// Engine and materialization failures, cancellation, and metric specs
    /// lacking what the criterion needs. On error every table created during
    /// this call has been dropped and no tree is kept.
    pub fn fit(
        &mut self,
        engine: &dyn QueryEngine,
        root_table: &str,
        features: Vec<FeatureCandidate>,
        metric: &NodeMetricSpec,
    ) -> Result<&Tree, TreeError> {
        self.drop_tables(engine)?;
        self.params.validate()?;
        for name in self.criterion.required_metrics() {
            if !metric.contains(name) {
                return Err(TreeError::InvalidMetricSpec(format!(
                    "criterion needs metric {:?}",
                    name
                )));
            }
        }

        let pool = QueryPool::new(self.params.max_concurrent_queries)
            .map_err(|e| TreeError::WorkerPool(e.to_string()))?;
        let ctx = NodeContext {
            engine,
            metric,
            criterion: self.criterion.as_ref(),
            params: &self.params,
            pool: &pool,
        };

        info!(
            table = root_table,
            features = features.len(),
            max_depth = self.params.max_depth,
            max_leaves = self.params.max_leaves,
            "growing tree"
        );

        let mut ledger = TableLedger::default();
        match self.grow(&ctx, root_table, features, &mut ledger) {
            Ok((tree, frontier)) => {
                info!(
                    table = root_table,
                    nodes = tree.num_nodes(),
                    leaves = frontier.len(),
                    depth = tree.max_depth(),
                    "tree grown"
                );
                self.frontier = frontier;
                self.created_tables = ledger.tables;
                Ok(&*self.tree.insert(tree))
            }
            Err(err) => {
                warn!(
                    table = root_table,
                    error = %err,
                    "tree growth failed, dropping created tables"
                );
                ledger.drop_all(engine);
                Err(err)
            }
        }
    }

    fn grow(
        &self,
        ctx: &NodeContext<'_>,
        root_table: &str,
        features: Vec<FeatureCandidate>,
        ledger: &mut TableLedger,
    ) -> Result<(Tree, Vec<NodeId>), TreeError> {
        let mut tree = Tree::new(TreeNode::root(root_table, features));
        tree.node_mut(Tree::ROOT).evaluate(ctx)?;
        let mut frontier = vec![Tree::ROOT];

        let max_leaves = self.params.max_leaves as usize;
        while frontier.len() < max_leaves
            && frontier.iter().any(|&id| !tree.node(id).is_final_leaf())
        {
            self.check_cancelled()?;

            for &id in &frontier {
                if tree.node(id).state() == NodeState::Pending {
                    tree.node_mut(id).evaluate(ctx)?;
                }
            }

            let Some(pos) = self.select_best(&mut tree, &frontier)? else {
                debug!("no leaf has a split above epsilon");
                break;
            };

            let id = frontier[pos];
            let gain = tree.node(id).best_gain();
            match tree.split(id, ctx, &mut ledger.tables) {
                Ok(Some((left, right))) => {
                    frontier.remove(pos);
                    frontier.push(left);
                    frontier.push(right);
                    info!(
                        table = tree.node(id).table(),
                        feature = tree.node(id).split_feature().map(|f| f.name()),
                        gain,
                        leaves = frontier.len(),
                        "split leaf"
                    );
                }
                Ok(None) => {}
                Err(err @ TreeError::TableMaterializationFailed { .. })
                    if self.params.on_materialization_failure
                        == MaterializationPolicy::FinalizeLeaf =>
                {
                    warn!(error = %err, "abandoning split, node finalized as leaf");
                    tree.node_mut(id).finalize_leaf()?;
                }
                Err(err) => return Err(err),
            }
        }

        for &id in &frontier {
            let node = tree.node_mut(id);
            if node.state() == NodeState::Pending {
                node.compute_statistics(ctx)?;
            }
            node.finalize_leaf()?;
        }
        Ok((tree, frontier))
    }

    /// Position of the frontier member to split next.
    ///
    /// Evaluated members without a gain above `epsilon` are finalized here:
    /// their statistics never change, so they can never be selected later.
    fn select_best(
        &self,
        tree: &mut Tree,
        frontier: &[NodeId],
    ) -> Result<Option<usize>, TreeError> {
        let epsilon = self.params.epsilon;
        let mut best: Option<(usize, f64)> = None;
        for (pos, &id) in frontier.iter().enumerate() {
            let node = tree.node_mut(id);
            if node.state() != NodeState::Evaluated {
                continue;
            }
            match node.best_gain() {
                Some(gain) if gain > epsilon => {
                    if best.map_or(true, |(_, g)| gain > g) {
                        best = Some((pos, gain));
                    }
                }
                _ => node.finalize_leaf()?,
            }
        }
        Ok(best.map(|(pos, _)| pos))
    }

    fn check_cancelled(&self) -> Result<(), TreeError> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(TreeError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Drop the tables of the fitted tree and forget it.
    ///
    /// Tables that fail to drop are kept in [`created_tables`](Self::created_tables)
    /// and the first failure is returned.
    pub fn drop_tables(&mut self, engine: &dyn QueryEngine) -> Result<(), TreeError> {
        while let Some(table) = self.created_tables.last() {
            engine
                .drop_table_if_exists(table)
                .map_err(|source| TreeError::TableCleanupFailed {
                    table: table.clone(),
                    source,
                })?;
            self.created_tables.pop();
        }
        self.tree = None;
        self.frontier.clear();
        Ok(())
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// `CASE` expression mapping a row to the index of its leaf in
    /// [`Tree::leaves`] order.
    pub fn leaf_assignment_expression(&self) -> Result<String, TreeError> {
        let tree = self.tree.as_ref().ok_or(TreeError::NotFitted)?;
        let mut expr = String::from("CASE");
        for (k, id) in tree.leaves().into_iter().enumerate() {
            expr.push_str(&format!(
                " WHEN {} THEN {}",
                tree.node(id).path_predicate(),
                k
            ));
        }
        expr.push_str(" END");
        Ok(expr)
    }

    /// Materialize `output_table` as `sample_table` plus a [`LEAF_COLUMN`]
    /// holding each row's leaf index.
    pub fn predict(
        &self,
        engine: &dyn QueryEngine,
        sample_table: &str,
        output_table: &str,
    ) -> Result<(), TreeError> {
        let expr = self.leaf_assignment_expression()?;
        let query = sql::select_with_column(sample_table, &expr, LEAF_COLUMN);
        let failed = |source| TreeError::TableMaterializationFailed {
            table: output_table.to_string(),
            source,
        };
        engine.drop_table_if_exists(output_table).map_err(failed)?;
        engine.create_table_as(output_table, &query).map_err(failed)?;
        info!(sample = sample_table, output = output_table, "assigned leaves");
        Ok(())
    }

    /// Serializable description of the fitted tree.
    pub fn summary(&self) -> Result<TreeSummary, TreeError> {
        let tree = self.tree.as_ref().ok_or(TreeError::NotFitted)?;
        Ok(TreeSummary::from_tree(tree))
    }
}
