//! clustree: leaf-wise clustering decision trees over an external query engine.
//!
//! The tree never loads rows. Each node is a table in the engine; its
//! statistics and every candidate split's statistics come back from
//! aggregate queries, and splitting a node materializes two child tables.
//!
//! # Key Types
//!
//! - [`ClusteringDecisionTree`] - Grows a tree and routes new samples to leaves
//! - [`FeatureCandidate`] - A feature with its ordered candidate split values
//! - [`NodeMetricSpec`] - Named aggregate expressions computed per node
//! - [`Criterion`] - Scores a split from aggregate statistics
//! - [`QueryEngine`] - Client for the engine that holds the data
//! - [`TreeParams`] - Growth limits and thresholds

pub mod config;
pub mod criterion;
pub mod engine;
pub mod error;
pub mod feature;
pub mod metric;
pub mod sql;
pub mod testing;
pub mod tree;
pub mod utils;

pub use config::{ConfigError, MaterializationPolicy, TreeParams};
pub use criterion::{Criterion, GiniReduction, VarianceReduction};
pub use engine::{EngineError, JobHandle, QueryEngine, TabularResult, ThrottledEngine, Value};
pub use error::TreeError;
pub use feature::{CandidateValues, FeatureCandidate, FeatureKind, Side, SplitCandidate};
pub use metric::{BucketStats, MetricValues, NodeMetricSpec, DEFAULT_COUNT_METRIC};
pub use tree::{
    ClusteringDecisionTree, NodeId, NodeState, NodeSummary, SplitSummary, Tree, TreeNode,
    TreeSummary, LEAF_COLUMN,
};
pub use utils::{Parallelism, QueryPool};
