//! End-to-end growth scenarios.

use approx::assert_relative_eq;
use clustree::testing::MockEngine;
use clustree::{
    ClusteringDecisionTree, NodeMetricSpec, NodeState, TreeParams, VarianceReduction,
};
use rstest::rstest;

use crate::common::{
    child_features, left_share, metric, numerical, script_node, script_subtree, Best,
};

fn tree(max_leaves: u32, max_depth: u32) -> ClusteringDecisionTree {
    let params = TreeParams::builder()
        .max_leaves(max_leaves)
        .max_depth(max_depth)
        .min_samples_split(10)
        .max_concurrent_queries(1)
        .build()
        .unwrap();
    ClusteringDecisionTree::new(params, left_share)
}

#[test]
fn root_splits_once_when_children_cannot_improve() {
    let engine = MockEngine::new();
    let metric = metric();
    let features = vec![numerical("age", 4)];

    // 250k rows, best split gain 0.3 at index 1 (age < 20).
    let (left, right) =
        script_node(&engine, &metric, "t", &features, 250_000, Some(Best::new(0, 1, 0.3)))
            .unwrap();
    assert_eq!((left, right), (62_500, 187_500));
    let (left_features, right_features) = child_features(&features, 0, 1);
    script_node(&engine, &metric, "t_L", &left_features, left, None);
    script_node(&engine, &metric, "t_R", &right_features, right, None);

    let params = TreeParams::builder()
        .min_samples_split(100_000)
        .max_depth(5)
        .max_leaves(4)
        .epsilon(0.01)
        .build()
        .unwrap();
    let mut grower = ClusteringDecisionTree::new(params, left_share);
    grower.fit(&engine, "t", features, &metric).unwrap();

    let root = grower.root().unwrap();
    assert_eq!(root.state(), NodeState::Split);
    assert_eq!(root.split_feature().unwrap().name(), "age");
    assert_eq!(root.split_feature().unwrap().split_index(), Some(1));
    assert!((root.best_gain().unwrap() - 0.3).abs() < 1e-12);

    assert_eq!(grower.frontier().len(), 2);
    let leaves = grower.leaves();
    assert_eq!(leaves[0].table(), "t_L");
    assert_eq!(leaves[0].total(), 62_500);
    assert_eq!(leaves[1].table(), "t_R");
    assert_eq!(leaves[1].total(), 187_500);
    assert!(leaves.iter().all(|n| n.state() == NodeState::Leaf));

    assert_eq!(grower.created_tables(), ["t_L", "t_R"]);
    assert_eq!(grower.tree().unwrap().child_tables(), ["t_L", "t_R"]);
    assert_eq!(engine.live_tables(), vec!["t_L", "t_R"]);
}

#[test]
fn small_root_is_a_leaf() {
    let engine = MockEngine::new();
    let metric = metric();
    let features = vec![numerical("age", 4)];
    script_node(&engine, &metric, "t", &features, 50_000, Some(Best::new(0, 1, 0.3)));

    let params = TreeParams::builder()
        .min_samples_split(100_000)
        .max_leaves(4)
        .build()
        .unwrap();
    let mut grower = ClusteringDecisionTree::new(params, left_share);
    let tree = grower.fit(&engine, "t", features, &metric).unwrap();

    assert_eq!(tree.num_nodes(), 1);
    assert_eq!(tree.root().state(), NodeState::Leaf);
    assert!(tree.root().children().is_none());
    assert!(grower.created_tables().is_empty());
    assert!(engine.created_tables().is_empty());
    // Only the statistics query; no split search.
    assert_eq!(engine.submitted(), vec![metric.render_query("t")]);
}

/// Root splits into A (gain 0.25) and B (gain 0.6); B splits into BL (0.4)
/// and BR (no gain).
fn script_leafwise(engine: &MockEngine) {
    let metric = metric();
    let root = vec![numerical("x", 8)];

    let (a_total, b_total) =
        script_node(engine, &metric, "t", &root, 800, Some(Best::new(0, 4, 0.9))).unwrap();
    let (a, b) = child_features(&root, 0, 4);

    let (aa_total, ab_total) =
        script_node(engine, &metric, "t_L", &a, a_total, Some(Best::new(0, 2, 0.25))).unwrap();
    let (aa, ab) = child_features(&a, 0, 2);
    script_node(engine, &metric, "t_L_L", &aa, aa_total, None);
    script_node(engine, &metric, "t_L_R", &ab, ab_total, None);

    let (bl_total, br_total) =
        script_node(engine, &metric, "t_R", &b, b_total, Some(Best::new(0, 2, 0.6))).unwrap();
    let (bl, br) = child_features(&b, 0, 2);
    script_node(engine, &metric, "t_R_R", &br, br_total, None);

    let (bll_total, blr_total) =
        script_node(engine, &metric, "t_R_L", &bl, bl_total, Some(Best::new(0, 1, 0.4))).unwrap();
    let (bll, blr) = child_features(&bl, 0, 1);
    script_node(engine, &metric, "t_R_L_L", &bll, bll_total, None);
    script_node(engine, &metric, "t_R_L_R", &blr, blr_total, None);
}

#[test]
fn deeper_leaf_with_higher_gain_splits_first() {
    let engine = MockEngine::new();
    script_leafwise(&engine);

    let mut grower = tree(4, 5);
    grower.fit(&engine, "t", vec![numerical("x", 8)], &metric()).unwrap();

    // BL (depth 2, gain 0.4) was split before A (depth 1, gain 0.25).
    assert_eq!(
        grower.created_tables(),
        ["t_L", "t_R", "t_R_L", "t_R_R", "t_R_L_L", "t_R_L_R"]
    );
    let tables: Vec<&str> = grower.leaves().iter().map(|n| n.table()).collect();
    assert_eq!(tables, ["t_L", "t_R_R", "t_R_L_L", "t_R_L_R"]);

    let a = grower.leaves()[0];
    assert_eq!(a.state(), NodeState::Leaf);
    assert_eq!(a.best_gain(), Some(0.25));
}

#[test]
fn larger_absolute_reduction_splits_first() {
    let engine = MockEngine::new();
    let metric =
        NodeMetricSpec::new([("total", "COUNT(1)"), ("s", "SUM(y)"), ("q", "SUM(y * y)")])
            .unwrap();
    let features = vec![numerical("x", 4)];
    let (left, right) = child_features(&features, 0, 2);
    let moments = |n: f64, s: f64, q: f64| [("total", n), ("s", s), ("q", q)];

    // t_L: SSE 1100 -> 300 + 300, removes 500.
    // t_R: SSE 5 -> 0 + 0, removes 5 (all of its own impurity).
    engine.script_node(&metric, "t", &moments(40.0, 110.0, 1610.0));
    engine.script_buckets(
        &metric,
        "t",
        &features[0],
        [
            (0, moments(10.0, 0.0, 300.0)),
            (1, moments(10.0, 100.0, 1300.0)),
            (2, moments(10.0, 0.0, 0.0)),
            (3, moments(10.0, 10.0, 10.0)),
        ],
    );
    engine.script_node(&metric, "t_L", &moments(20.0, 100.0, 1600.0));
    engine.script_buckets(
        &metric,
        "t_L",
        &left[0],
        [(0, moments(10.0, 0.0, 300.0)), (1, moments(10.0, 100.0, 1300.0))],
    );
    engine.script_node(&metric, "t_R", &moments(20.0, 10.0, 10.0));
    engine.script_buckets(
        &metric,
        "t_R",
        &right[0],
        [(0, moments(10.0, 0.0, 0.0)), (1, moments(10.0, 10.0, 10.0))],
    );
    engine.script_node(&metric, "t_L_L", &moments(10.0, 0.0, 300.0));
    engine.script_node(&metric, "t_L_R", &moments(10.0, 100.0, 1300.0));

    let mut grower = ClusteringDecisionTree::new(
        TreeParams::builder()
            .max_leaves(3)
            .min_samples_split(10)
            .build()
            .unwrap(),
        VarianceReduction::new("total", "s", "q"),
    );
    grower.fit(&engine, "t", features, &metric).unwrap();

    assert_relative_eq!(grower.root().unwrap().best_gain().unwrap(), 202.5, epsilon = 1e-9);
    assert_eq!(grower.created_tables(), ["t_L", "t_R", "t_L_L", "t_L_R"]);
    let leaves = grower.leaves();
    let tables: Vec<&str> = leaves.iter().map(|n| n.table()).collect();
    assert_eq!(tables, ["t_R", "t_L_L", "t_L_R"]);
    assert_relative_eq!(leaves[0].best_gain().unwrap(), 5.0, epsilon = 1e-9);
}

#[test]
fn child_tables_request_lifecycle() {
    let engine = MockEngine::new();
    let metric = metric();
    let features = vec![numerical("x", 16)];
    script_subtree(&engine, &metric, "t", &features, 1 << 16, 0, &|_| 0.5);

    let params = TreeParams::builder()
        .max_leaves(4)
        .min_samples_split(10)
        .table_lifecycle_days(1)
        .build()
        .unwrap();
    let mut grower = ClusteringDecisionTree::new(params, left_share);
    grower.fit(&engine, "t", features, &metric).unwrap();

    assert_eq!(grower.created_tables().len(), 6);
    for table in grower.created_tables() {
        assert_eq!(engine.table_lifecycle(table), Some(1), "{}", table);
    }
}

#[test]
fn lower_gain_leaf_splits_once_budget_allows() {
    let engine = MockEngine::new();
    script_leafwise(&engine);

    let mut grower = tree(5, 5);
    grower.fit(&engine, "t", vec![numerical("x", 8)], &metric()).unwrap();

    assert_eq!(
        grower.created_tables(),
        ["t_L", "t_R", "t_R_L", "t_R_R", "t_R_L_L", "t_R_L_R", "t_L_L", "t_L_R"]
    );
    assert_eq!(grower.frontier().len(), 5);
}

#[test]
fn equal_gains_split_earliest_leaf() {
    let engine = MockEngine::new();
    let metric = metric();
    let root = vec![numerical("x", 4)];
    let (l_total, r_total) =
        script_node(&engine, &metric, "t", &root, 400, Some(Best::new(0, 2, 0.9))).unwrap();
    let (l, r) = child_features(&root, 0, 2);
    let (ll, lr) =
        script_node(&engine, &metric, "t_L", &l, l_total, Some(Best::new(0, 1, 0.5))).unwrap();
    script_node(&engine, &metric, "t_R", &r, r_total, Some(Best::new(0, 1, 0.5)));
    let (llf, lrf) = child_features(&l, 0, 1);
    script_node(&engine, &metric, "t_L_L", &llf, ll, None);
    script_node(&engine, &metric, "t_L_R", &lrf, lr, None);

    let mut grower = tree(3, 5);
    grower.fit(&engine, "t", root, &metric).unwrap();

    assert_eq!(grower.created_tables(), ["t_L", "t_R", "t_L_L", "t_L_R"]);
}

#[rstest]
#[case(1, 1)]
#[case(2, 2)]
#[case(3, 3)]
#[case(7, 7)]
#[case(16, 16)]
#[case(31, 16)]
fn leaf_count_respects_max_leaves(#[case] max_leaves: u32, #[case] expected: usize) {
    let engine = MockEngine::new();
    let metric = metric();
    let features = vec![numerical("x", 16)];
    script_subtree(&engine, &metric, "t", &features, 1 << 16, 0, &|depth| 0.9 - 0.1 * depth as f64);

    let mut grower = tree(max_leaves, 10);
    let tree = grower.fit(&engine, "t", features, &metric).unwrap();

    assert_eq!(tree.num_leaves(), expected);
    assert_eq!(grower.frontier().len(), expected);
    assert_eq!(grower.created_tables().len(), 2 * (expected - 1));
}

#[rstest]
#[case(0, 1)]
#[case(1, 2)]
#[case(2, 4)]
#[case(3, 8)]
fn depth_respects_max_depth(#[case] max_depth: u32, #[case] expected_leaves: usize) {
    let engine = MockEngine::new();
    let metric = metric();
    let features = vec![numerical("x", 16)];
    script_subtree(&engine, &metric, "t", &features, 1 << 16, 0, &|_| 0.5);

    let mut grower = tree(31, max_depth);
    let tree = grower.fit(&engine, "t", features, &metric).unwrap();

    assert_eq!(tree.max_depth(), max_depth);
    assert_eq!(tree.num_leaves(), expected_leaves);
    assert!(tree.iter().all(|(_, n)| n.depth() <= max_depth));
}

#[test]
fn gain_at_or_below_epsilon_stops_growth() {
    let engine = MockEngine::new();
    let metric = metric();
    let features = vec![numerical("x", 16)];
    // Gain 0.5 at the root, 0.2 below it.
    script_subtree(&engine, &metric, "t", &features, 1 << 16, 0, &|depth| {
        if depth == 0 {
            0.5
        } else {
            0.2
        }
    });

    let params = TreeParams::builder()
        .min_samples_split(10)
        .epsilon(0.3)
        .build()
        .unwrap();
    let mut grower = ClusteringDecisionTree::new(params, left_share);
    let tree = grower.fit(&engine, "t", features, &metric).unwrap();

    assert_eq!(tree.num_nodes(), 3);
    for leaf in grower.leaves() {
        assert_eq!(leaf.state(), NodeState::Leaf);
        assert_relative_eq!(leaf.best_gain().unwrap(), 0.2, epsilon = 1e-9);
    }
}

#[test]
fn parallel_search_matches_sequential() {
    let metric = metric();
    let features: Vec<_> = ["a", "b", "c", "d", "e", "f"]
        .iter()
        .map(|name| numerical(name, 4))
        .collect();

    let grow = |threads: usize| {
        let engine = MockEngine::new();
        let (l, r) =
            script_node(&engine, &metric, "t", &features, 1000, Some(Best::new(3, 2, 0.7)))
                .unwrap();
        let (lf, rf) = child_features(&features, 3, 2);
        script_node(&engine, &metric, "t_L", &lf, l, None);
        script_node(&engine, &metric, "t_R", &rf, r, None);

        let params = TreeParams::builder()
            .min_samples_split(10)
            .max_concurrent_queries(threads)
            .build()
            .unwrap();
        let mut grower = ClusteringDecisionTree::new(params, left_share);
        grower.fit(&engine, "t", features.clone(), &metric).unwrap();
        (grower.summary().unwrap(), engine.created_queries())
    };

    let (sequential, seq_tables) = grow(1);
    let (parallel, par_tables) = grow(4);
    assert_eq!(sequential, parallel);
    assert_eq!(seq_tables, par_tables);
    assert_eq!(
        parallel.nodes[0].split.as_ref().map(|s| s.feature.as_str()),
        Some("d")
    );
}

#[test]
fn fan_out_is_bounded() {
    let engine = MockEngine::new().with_latency(std::time::Duration::from_millis(2));
    let metric = metric();
    let features: Vec<_> = (0..8).map(|i| numerical(&format!("f{}", i), 4)).collect();
    script_node(&engine, &metric, "t", &features, 1000, None);

    let params = TreeParams::builder()
        .min_samples_split(10)
        .max_concurrent_queries(3)
        .build()
        .unwrap();
    let mut grower = ClusteringDecisionTree::new(params, left_share);
    grower.fit(&engine, "t", features, &metric).unwrap();

    assert!(engine.peak_in_flight() <= 3);
    assert_eq!(engine.submitted().len(), 1 + 8);
}

#[test]
fn categorical_split_routes_nulls_right() {
    let engine = MockEngine::new();
    let metric = metric();
    let city = clustree::FeatureCandidate::categorical("city", ["bj", "sh", "gz"]).unwrap();
    let features = vec![city];
    let (l, r) =
        script_node(&engine, &metric, "t", &features, 300, Some(Best::new(0, 2, 0.6))).unwrap();
    let (lf, rf) = child_features(&features, 0, 2);
    script_node(&engine, &metric, "t_L", &lf, l, None);
    script_node(&engine, &metric, "t_R", &rf, r, None);

    let mut grower = tree(4, 5);
    grower.fit(&engine, "t", features, &metric).unwrap();

    let leaves = grower.leaves();
    assert_eq!(leaves[0].path(), ["1 = 1", "city IN ('bj', 'sh')"]);
    assert_eq!(
        leaves[1].path(),
        ["1 = 1", "(city NOT IN ('bj', 'sh') OR city IS NULL)"]
    );
}
