//! Error type for tree construction.

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::tree::NodeState;

/// Errors raised while growing or using a tree.
///
/// "No feasible split" and "gain below epsilon" are not errors: they are
/// resolved inside the node and grower by finalizing leaves.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// An aggregate query failed or returned malformed data.
    #[error("query failed: {source}\n{query}")]
    EngineQueryFailed {
        query: String,
        #[source]
        source: EngineError,
    },

    /// Create-table-as-select for a child partition failed.
    #[error("failed to materialize table {table}: {source}")]
    TableMaterializationFailed {
        table: String,
        #[source]
        source: EngineError,
    },

    /// Dropping a table created by the tree failed.
    #[error("failed to drop table {table}: {source}")]
    TableCleanupFailed {
        table: String,
        #[source]
        source: EngineError,
    },

    #[error("invalid feature {name:?}: {reason}")]
    InvalidFeature { name: String, reason: String },

    #[error("invalid metric spec: {0}")]
    InvalidMetricSpec(String),

    /// A statistic needed for scoring is absent from a node's aggregates.
    #[error("metric {0:?} missing from node statistics")]
    MissingMetric(String),

    /// An operation was attempted in the wrong node state.
    #[error("node {table} is {state}, expected {expected}")]
    InvalidState {
        table: String,
        state: NodeState,
        expected: &'static str,
    },

    #[error("tree has not been fitted")]
    NotFitted,

    #[error("tree growth was cancelled")]
    Cancelled,

    #[error("failed to start query workers: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TreeError {
    pub(crate) fn query(query: impl Into<String>, source: EngineError) -> Self {
        Self::EngineQueryFailed {
            query: query.into(),
            source,
        }
    }

    pub(crate) fn malformed(query: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EngineQueryFailed {
            query: query.into(),
            source: EngineError::Malformed(reason.into()),
        }
    }

    pub(crate) fn invalid_feature(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidFeature {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
