//! Property tests for growth invariants and candidate partitioning.

use clustree::testing::MockEngine;
use clustree::{
    CandidateValues, ClusteringDecisionTree, FeatureCandidate, NodeState, Side, TreeParams,
};
use proptest::prelude::*;

use crate::common::{left_share, metric, numerical, script_subtree};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn grown_tree_respects_limits(
        max_leaves in 1u32..20,
        max_depth in 0u32..6,
        epsilon in 0.0f64..0.9,
        decay in 0.0f64..0.3,
    ) {
        let engine = MockEngine::new();
        let metric = metric();
        let features = vec![numerical("x", 16)];
        script_subtree(&engine, &metric, "t", &features, 1 << 16, 0, &|depth| {
            0.9 - decay * depth as f64
        });

        let params = TreeParams::builder()
            .max_leaves(max_leaves)
            .max_depth(max_depth)
            .epsilon(epsilon)
            .min_samples_split(10)
            .max_concurrent_queries(1)
            .build()
            .unwrap();
        let mut grower = ClusteringDecisionTree::new(params, left_share);
        grower.fit(&engine, "t", features, &metric).unwrap();
        let tree = grower.tree().unwrap();

        prop_assert!(tree.num_leaves() <= max_leaves as usize);
        prop_assert_eq!(tree.num_leaves(), grower.frontier().len());
        prop_assert!(tree.max_depth() <= max_depth);
        prop_assert_eq!(grower.created_tables().len(), 2 * (tree.num_nodes() - 1));

        for (_, node) in tree.iter() {
            match node.state() {
                NodeState::Split => {
                    prop_assert!(node.best_gain().unwrap() > epsilon);
                    prop_assert!(node.children().is_some());
                }
                NodeState::Leaf => prop_assert!(node.children().is_none()),
                other => prop_assert!(false, "unfinished node in state {}", other),
            }
        }

        let mut frontier: Vec<_> = grower.frontier().to_vec();
        frontier.sort();
        let mut leaves = tree.leaves();
        leaves.sort();
        prop_assert_eq!(frontier, leaves);

        let mut created = grower.created_tables().to_vec();
        created.sort();
        let mut children = tree.child_tables();
        children.sort();
        prop_assert_eq!(&children, &created);
        prop_assert_eq!(engine.live_tables(), created);
    }

    #[test]
    fn derive_partitions_numerical_values(n in 2usize..32, pick in 0usize..1000) {
        let i = 1 + pick % (n - 1);
        let feature = numerical("x", n).with_split(i).unwrap();
        let left = feature.derive(Side::Left);
        let right = feature.derive(Side::Right);

        prop_assert_eq!(left.len(), i);
        prop_assert_eq!(right.len(), n - i);
        prop_assert_eq!(left.split_index(), None);
        prop_assert_eq!(left.is_eligible(), i >= 2);
        prop_assert_eq!(right.is_eligible(), n - i >= 2);

        match (feature.values(), left.values(), right.values()) {
            (
                CandidateValues::Numerical(all),
                CandidateValues::Numerical(l),
                CandidateValues::Numerical(r),
            ) => {
                prop_assert_eq!(&all[..i], l.as_slice());
                prop_assert_eq!(&all[i..], r.as_slice());
            }
            _ => prop_assert!(false, "kind changed"),
        }
    }

    #[test]
    fn derive_partitions_categories(
        labels in prop::collection::btree_set("[a-z]{1,4}", 2..12),
        pick in 0usize..1000,
    ) {
        let labels: Vec<String> = labels.into_iter().collect();
        let n = labels.len();
        let i = 1 + pick % (n - 1);
        let feature = FeatureCandidate::categorical("c", labels.clone())
            .unwrap()
            .with_split(i)
            .unwrap();

        let left = feature.derive(Side::Left);
        let right = feature.derive(Side::Right);
        prop_assert_eq!(left.values(), &CandidateValues::Categorical(labels[..i].to_vec()));
        prop_assert_eq!(right.values(), &CandidateValues::Categorical(labels[i..].to_vec()));
    }
}
