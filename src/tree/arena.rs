//! Node arena with explicit parent/child links.

use super::node::{NodeContext, NodeId, NodeState, TreeNode};
use crate::error::TreeError;

/// A tree stored as a flat arena of nodes; the root is [`Tree::ROOT`].
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<TreeNode>,
}

impl Tree {
    pub const ROOT: NodeId = NodeId(0);

    /// Create a tree with just a root.
    pub fn new(root: TreeNode) -> Self {
        Self { nodes: vec![root] }
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.index()]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id.index()]
    }

    /// All nodes with their ids, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TreeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    /// Leaves in depth-first, left-to-right order.
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        let mut stack = vec![Self::ROOT];
        while let Some(id) = stack.pop() {
            match self.node(id).children() {
                Some((left, right)) => {
                    stack.push(right);
                    stack.push(left);
                }
                None => leaves.push(id),
            }
        }
        leaves
    }

    #[inline]
    pub fn num_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Depth of the deepest node.
    pub fn max_depth(&self) -> u32 {
        self.nodes.iter().map(TreeNode::depth).max().unwrap_or(0)
    }

    /// Backing tables of every non-root node, in creation order.
    pub fn child_tables(&self) -> Vec<&str> {
        self.nodes[1..].iter().map(TreeNode::table).collect()
    }

    /// Split node `id` and link its children into the arena.
    ///
    /// Returns the child ids, or `None` if the node was finalized as a leaf
    /// instead. On error the arena is unchanged. Tables left in the engine
    /// are pushed to `created` either way.
    pub fn split(
        &mut self,
        id: NodeId,
        ctx: &NodeContext<'_>,
        created: &mut Vec<String>,
    ) -> Result<Option<(NodeId, NodeId)>, TreeError> {
        let Some((mut left, mut right)) = self.node_mut(id).split(ctx, created)? else {
            return Ok(None);
        };
        left.parent = Some(id);
        right.parent = Some(id);
        let left_id = self.push(left);
        let right_id = self.push(right);
        self.node_mut(id).children = Some((left_id, right_id));
        debug_assert_eq!(self.node(id).state(), NodeState::Split);
        Ok(Some((left_id, right_id)))
    }

    fn push(&mut self, node: TreeNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }
}
