//! Tree configuration with builder pattern.
//!
//! [`TreeParams`] is built with the `bon` builder and validated at build time,
//! or deserialized from a key/value map where unknown keys are rejected.
//!
//! # Example
//!
//! ```
//! use clustree::TreeParams;
//!
//! // All defaults
//! let params = TreeParams::builder().build().unwrap();
//! assert_eq!(params.max_leaves, 31);
//!
//! let params = TreeParams::builder()
//!     .max_depth(3)
//!     .max_leaves(8)
//!     .min_samples_split(10_000)
//!     .build()
//!     .unwrap();
//! ```

use bon::Builder;
use serde::{Deserialize, Serialize};

// =============================================================================
// ConfigError
// =============================================================================

/// Errors that can occur during configuration validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `max_leaves` must be at least 1.
    InvalidMaxLeaves(u32),
    /// `epsilon` must be finite and non-negative.
    InvalidEpsilon(f64),
    /// `min_samples_leaf` must be at least 1.
    InvalidMinSamplesLeaf,
    /// `max_concurrent_queries` must be at least 1.
    InvalidConcurrency,
    /// `table_lifecycle_days`, when set, must be at least 1.
    InvalidTableLifecycle,
    /// Key/value input could not be parsed (unknown key, wrong type).
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMaxLeaves(v) => write!(f, "max_leaves must be at least 1, got {}", v),
            Self::InvalidEpsilon(v) => {
                write!(f, "epsilon must be finite and non-negative, got {}", v)
            }
            Self::InvalidMinSamplesLeaf => write!(f, "min_samples_leaf must be at least 1"),
            Self::InvalidConcurrency => write!(f, "max_concurrent_queries must be at least 1"),
            Self::InvalidTableLifecycle => write!(f, "table_lifecycle_days must be at least 1"),
            Self::Parse(msg) => write!(f, "invalid tree parameters: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// MaterializationPolicy
// =============================================================================

/// What the grower does when a child table cannot be created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializationPolicy {
    /// Abort the fit: drop every table created so far and return the error.
    #[default]
    Abort,
    /// Give up on that split, finalize the node as a leaf, keep growing.
    FinalizeLeaf,
}

// =============================================================================
// TreeParams
// =============================================================================

/// Parameters controlling tree growth.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(
    derive(Clone, Debug),
    finish_fn(vis = "", name = __build_internal)
)]
#[serde(deny_unknown_fields, default)]
pub struct TreeParams {
    /// Hard depth cap (root = depth 0). Default: 5.
    #[builder(default = 5)]
    pub max_depth: u32,

    /// Maximum number of leaves. Default: 31.
    #[builder(default = 31)]
    pub max_leaves: u32,

    /// A node needs more than this many rows to be considered for a split.
    /// Default: 100000.
    #[builder(default = 100_000)]
    pub min_samples_split: u64,

    /// Minimum gain required to accept a split. Default: 0.01.
    #[builder(default = 0.01)]
    pub epsilon: f64,

    /// Minimum rows on each side of a split. Default: 1.
    #[builder(default = 1)]
    pub min_samples_leaf: u64,

    /// Upper bound on concurrent per-feature statistics queries. Default: 4.
    #[builder(default = 4)]
    pub max_concurrent_queries: usize,

    /// Behaviour when a child table cannot be created. Default: abort.
    #[builder(default)]
    pub on_materialization_failure: MaterializationPolicy,

    /// Days after which the engine expires child tables on its own, so a
    /// crashed process does not leave them behind. Default: none.
    pub table_lifecycle_days: Option<u32>,
}

impl<S: tree_params_builder::IsComplete> TreeParamsBuilder<S> {
    /// Build and validate the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any parameter is out of range.
    pub fn build(self) -> Result<TreeParams, ConfigError> {
        let params = self.__build_internal();
        params.validate()?;
        Ok(params)
    }
}

impl TreeParams {
    /// Check ranges. Called by the builder and by the deserializing constructors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_leaves == 0 {
            return Err(ConfigError::InvalidMaxLeaves(self.max_leaves));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(ConfigError::InvalidEpsilon(self.epsilon));
        }
        if self.min_samples_leaf == 0 {
            return Err(ConfigError::InvalidMinSamplesLeaf);
        }
        if self.max_concurrent_queries == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.table_lifecycle_days == Some(0) {
            return Err(ConfigError::InvalidTableLifecycle);
        }
        Ok(())
    }

    /// Build parameters from free-form key/value pairs.
    ///
    /// Missing keys take their defaults; unknown keys and ill-typed values
    /// are errors.
    pub fn from_map<I, K>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        let map: serde_json::Map<String, serde_json::Value> =
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let params: TreeParams = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Build parameters from a JSON object.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let params: TreeParams =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }
}

impl Default for TreeParams {
    fn default() -> Self {
        Self::builder().build().expect("default params are valid")
    }
}

// =============================================================================
// Tests
// =============================================================================
