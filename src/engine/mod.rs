//! Query engine abstraction.
//!
//! The tree never holds rows locally. Everything it learns about a node comes
//! back from an external engine through [`QueryEngine`], and every partition it
//! creates is a table the engine materializes.
//!
//! - [`QueryEngine`]: submit / fetch / create-table-as / drop-table
//! - [`TabularResult`], [`Value`]: what a finished job returns
//! - [`ThrottledEngine`]: caps in-flight submissions on a shared session

mod result;
mod throttle;

pub use result::{TabularResult, Value};
pub use throttle::ThrottledEngine;

use std::fmt;

/// Errors reported by an engine implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// The engine refused the query before running it.
    #[error("submission rejected: {0}")]
    Submission(String),

    /// The job ran and failed.
    #[error("job {job} failed: {message}")]
    JobFailed { job: String, message: String },

    /// Results were requested for a job that has not finished.
    #[error("job {0} has not completed")]
    NotReady(String),

    /// The job succeeded but its result does not have the expected shape.
    #[error("malformed result: {0}")]
    Malformed(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// Handle to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    id: String,
}

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Client for an external columnar query engine.
///
/// Implementations are shared across the worker threads that fan out
/// per-feature statistics queries, hence the `Send + Sync` bound. Any
/// engine-side concurrency limit is the implementation's concern; wrap the
/// client in a [`ThrottledEngine`] when several trees share one session.
pub trait QueryEngine: Send + Sync {
    /// Submit a query. With `wait = true` the call blocks until the job has
    /// finished, so a following [`fetch`](Self::fetch) returns immediately.
    fn submit(&self, query: &str, wait: bool) -> Result<JobHandle, EngineError>;

    /// Fetch the result of a finished job.
    fn fetch(&self, job: &JobHandle) -> Result<TabularResult, EngineError>;

    /// Create table `name` from the rows returned by `query`.
    fn create_table_as(&self, name: &str, query: &str) -> Result<(), EngineError>;

    /// Drop table `name`; succeeds when the table does not exist.
    fn drop_table_if_exists(&self, name: &str) -> Result<(), EngineError>;

    /// Create table `name` and ask the engine to expire it after
    /// `lifecycle_days`, so it disappears even if nobody drops it.
    ///
    /// Engines without table expiry fall back to [`create_table_as`](Self::create_table_as).
    fn create_table_with_lifecycle(
        &self,
        name: &str,
        query: &str,
        lifecycle_days: u32,
    ) -> Result<(), EngineError> {
        let _ = lifecycle_days;
        self.create_table_as(name, query)
    }

    /// Blocking submit followed by fetch.
    fn query(&self, query: &str) -> Result<TabularResult, EngineError> {
        let job = self.submit(query, true)?;
        self.fetch(&job)
    }
}

impl<E: QueryEngine + ?Sized> QueryEngine for &E {
    fn submit(&self, query: &str, wait: bool) -> Result<JobHandle, EngineError> {
        (**self).submit(query, wait)
    }

    fn fetch(&self, job: &JobHandle) -> Result<TabularResult, EngineError> {
        (**self).fetch(job)
    }

    fn create_table_as(&self, name: &str, query: &str) -> Result<(), EngineError> {
        (**self).create_table_as(name, query)
    }

    fn drop_table_if_exists(&self, name: &str) -> Result<(), EngineError> {
        (**self).drop_table_if_exists(name)
    }

    fn create_table_with_lifecycle(
        &self,
        name: &str,
        query: &str,
        lifecycle_days: u32,
    ) -> Result<(), EngineError> {
        (**self).create_table_with_lifecycle(name, query, lifecycle_days)
    }

    fn query(&self, query: &str) -> Result<TabularResult, EngineError> {
        (**self).query(query)
    }
}

impl<E: QueryEngine + ?Sized> QueryEngine for std::sync::Arc<E> {
    fn submit(&self, query: &str, wait: bool) -> Result<JobHandle, EngineError> {
        (**self).submit(query, wait)
    }

    fn fetch(&self, job: &JobHandle) -> Result<TabularResult, EngineError> {
        (**self).fetch(job)
    }

    fn create_table_as(&self, name: &str, query: &str) -> Result<(), EngineError> {
        (**self).create_table_as(name, query)
    }

    fn drop_table_if_exists(&self, name: &str) -> Result<(), EngineError> {
        (**self).drop_table_if_exists(name)
    }

    fn create_table_with_lifecycle(
        &self,
        name: &str,
        query: &str,
        lifecycle_days: u32,
    ) -> Result<(), EngineError> {
        (**self).create_table_with_lifecycle(name, query, lifecycle_days)
    }

    fn query(&self, query: &str) -> Result<TabularResult, EngineError> {
        (**self).query(query)
    }
}
