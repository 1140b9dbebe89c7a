//! Serializable description of a fitted tree.

use serde::Serialize;

use super::arena::Tree;
use super::node::{NodeId, NodeState};
use crate::feature::FeatureKind;
use crate::metric::MetricValues;

/// The split taken at an internal node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitSummary {
    pub feature: String,
    pub kind: FeatureKind,
    pub split_index: usize,
    pub gain: f64,
    pub left_predicate: String,
    pub right_predicate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub table: String,
    pub depth: u32,
    pub state: NodeState,
    pub total: u64,
    pub predicate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<MetricValues>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<(NodeId, NodeId)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitSummary>,
}

/// Every node of a tree, in creation order, plus headline counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeSummary {
    pub num_nodes: usize,
    pub num_leaves: usize,
    pub max_depth: u32,
    pub nodes: Vec<NodeSummary>,
}

impl TreeSummary {
    pub fn from_tree(tree: &Tree) -> Self {
        let nodes = tree
            .iter()
            .map(|(id, node)| {
                let split = node.split_feature().and_then(|feature| {
                    let best = node.best()?;
                    Some(SplitSummary {
                        feature: feature.name().to_string(),
                        kind: feature.kind(),
                        split_index: best.split_index,
                        gain: best.gain,
                        left_predicate: feature.left_predicate()?,
                        right_predicate: feature.right_predicate()?,
                    })
                });
                NodeSummary {
                    id,
                    table: node.table().to_string(),
                    depth: node.depth(),
                    state: node.state(),
                    total: node.total(),
                    predicate: node.path_predicate(),
                    stats: node.stats().cloned(),
                    parent: node.parent(),
                    children: node.children(),
                    split,
                }
            })
            .collect();

        Self {
            num_nodes: tree.num_nodes(),
            num_leaves: tree.num_leaves(),
            max_depth: tree.max_depth(),
            nodes,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
