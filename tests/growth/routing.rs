//! Post-fit API: leaf routing, prediction and summaries.

use std::thread;

use clustree::testing::MockEngine;
use clustree::{ClusteringDecisionTree, ThrottledEngine, TreeError, TreeParams, LEAF_COLUMN};

use crate::common::{
    child_features, left_share, metric, numerical, script_node, script_subtree, Best,
};

fn fitted(engine: &MockEngine) -> ClusteringDecisionTree {
    let metric = metric();
    let features = vec![numerical("age", 4)];
    let (l, r) =
        script_node(engine, &metric, "t", &features, 1000, Some(Best::new(0, 2, 0.5))).unwrap();
    let (lf, rf) = child_features(&features, 0, 2);
    script_node(engine, &metric, "t_L", &lf, l, None);
    script_node(engine, &metric, "t_R", &rf, r, None);

    let params = TreeParams::builder().min_samples_split(10).build().unwrap();
    let mut grower = ClusteringDecisionTree::new(params, left_share);
    grower.fit(engine, "t", features, &metric).unwrap();
    grower
}

#[test]
fn leaf_assignment_follows_leaf_paths() {
    let engine = MockEngine::new();
    let grower = fitted(&engine);

    assert_eq!(
        grower.leaf_assignment_expression().unwrap(),
        "CASE WHEN (1 = 1) AND (age < 30) THEN 0 \
         WHEN (1 = 1) AND ((age >= 30 OR age IS NULL)) THEN 1 END"
    );
}

#[test]
fn predict_materializes_assignment() {
    let engine = MockEngine::new();
    let grower = fitted(&engine);
    grower.predict(&engine, "new_rows", "new_rows_leaf").unwrap();

    let (table, query) = engine.created_queries().pop().unwrap();
    assert_eq!(table, "new_rows_leaf");
    assert!(query.starts_with("SELECT *,\n  CASE WHEN"));
    assert!(query.ends_with(&format!("END AS {}\nFROM new_rows", LEAF_COLUMN)));
    // Prediction output belongs to the caller.
    assert!(!grower.created_tables().contains(&"new_rows_leaf".to_string()));
}

#[test]
fn predict_requires_a_fitted_tree() {
    let engine = MockEngine::new();
    let grower = ClusteringDecisionTree::new(TreeParams::default(), left_share);
    assert!(matches!(
        grower.predict(&engine, "s", "out"),
        Err(TreeError::NotFitted)
    ));
    assert!(matches!(grower.leaf_assignment_expression(), Err(TreeError::NotFitted)));
}

#[test]
fn summary_describes_every_node() {
    let engine = MockEngine::new();
    let grower = fitted(&engine);
    let summary = grower.summary().unwrap();

    assert_eq!(summary.num_nodes, 3);
    assert_eq!(summary.num_leaves, 2);
    assert_eq!(summary.max_depth, 1);

    let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
    let root = &json["nodes"][0];
    assert_eq!(root["state"], "split");
    assert_eq!(root["total"], 1000);
    assert_eq!(root["stats"]["total"], 1000.0);
    assert_eq!(root["split"]["feature"], "age");
    assert_eq!(root["split"]["kind"], "numerical");
    assert_eq!(root["split"]["split_index"], 2);
    assert_eq!(root["split"]["left_predicate"], "age < 30");
    assert_eq!(json["nodes"][1]["table"], "t_L");
    assert_eq!(json["nodes"][1]["state"], "leaf");
    assert!(json["nodes"][1].get("split").is_none());
}

#[test]
fn trees_can_share_a_throttled_session() {
    let mock = MockEngine::new();
    let metric = metric();
    for root in ["a", "b", "c"] {
        script_subtree(&mock, &metric, root, &[numerical("x", 8)], 4096, 0, &|_| 0.5);
    }
    let engine = ThrottledEngine::new(mock, 2);

    thread::scope(|s| {
        for root in ["a", "b", "c"] {
            let engine = &engine;
            let metric = &metric;
            s.spawn(move || {
                let params = TreeParams::builder()
                    .min_samples_split(10)
                    .max_leaves(4)
                    .max_concurrent_queries(2)
                    .build()
                    .unwrap();
                let mut grower = ClusteringDecisionTree::new(params, left_share);
                grower.fit(engine, root, vec![numerical("x", 8)], metric).unwrap();
                assert_eq!(grower.frontier().len(), 4);
            });
        }
    });

    assert!(engine.inner().peak_in_flight() <= 2);
    assert_eq!(engine.inner().created_tables().len(), 3 * 6);
}
