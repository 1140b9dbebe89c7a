//! Tree structure and leaf-wise growth.
//!
//! - [`TreeNode`]: one node, backed by a table in the query engine
//! - [`Tree`]: arena of nodes with parent/child links
//! - [`ClusteringDecisionTree`]: the grower and post-fit API
//! - [`TreeSummary`]: serializable description of a fitted tree

mod arena;
mod grower;
mod node;
mod summary;

pub use arena::Tree;
pub use grower::{ClusteringDecisionTree, LEAF_COLUMN};
pub use node::{BestSplit, NodeContext, NodeId, NodeState, TreeNode};
pub use summary::{NodeSummary, SplitSummary, TreeSummary};
