//! In-memory [`QueryEngine`] for tests.
//!
//! [`MockEngine`] answers queries from scripted results, records every
//! statement it receives, and tracks which tables exist. Failures can be
//! injected per query or per table.
//!
//! ```ignore
//! use clustree::testing::MockEngine;
//!
//! let engine = MockEngine::new();
//! engine.script_node(&metric, "samples", &[("total", 250_000.0)]);
//! engine.fail_create("samples_R");
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::engine::{EngineError, JobHandle, QueryEngine, TabularResult, Value};
use crate::feature::FeatureCandidate;
use crate::metric::NodeMetricSpec;
use crate::sql;

#[derive(Debug, Default)]
struct State {
    responses: HashMap<String, TabularResult>,
    failing_queries: HashSet<String>,
    failing_creates: HashSet<String>,
    failing_drops: HashMap<String, usize>,
    lifecycles: HashMap<String, u32>,
    jobs: HashMap<String, String>,
    next_job: u64,
    submitted: Vec<String>,
    created: Vec<(String, String)>,
    live: BTreeSet<String>,
    dropped: Vec<String>,
}

/// Scripted, thread-safe query engine.
#[derive(Debug, Default)]
pub struct MockEngine {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    latency: Option<Duration>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Answer `query` with `result`, replacing any earlier answer.
    pub fn respond(&self, query: impl Into<String>, result: TabularResult) {
        self.state().responses.insert(query.into(), result);
    }

    /// Reject submissions of `query`.
    pub fn fail_query(&self, query: impl Into<String>) {
        self.state().failing_queries.insert(query.into());
    }

    /// Fail the job creating table `name`.
    pub fn fail_create(&self, name: impl Into<String>) {
        self.state().failing_creates.insert(name.into());
    }

    /// Fail every attempt to drop table `name` while it exists.
    pub fn fail_drop(&self, name: impl Into<String>) {
        self.fail_drop_times(name, usize::MAX);
    }

    /// Fail the next `times` attempts to drop table `name` while it exists.
    pub fn fail_drop_times(&self, name: impl Into<String>, times: usize) {
        self.state().failing_drops.insert(name.into(), times);
    }

    /// Script the statistics query of a node over `table`.
    ///
    /// Metrics of `spec` absent from `values` come back as `NULL`.
    pub fn script_node(&self, spec: &NodeMetricSpec, table: &str, values: &[(&str, f64)]) {
        let result = TabularResult::new(spec.names()).with_row(metric_row(spec, values));
        self.respond(spec.render_query(table), result);
    }

    /// Script the bucket query of `feature` over `table`, one row per
    /// `(bucket, values)` pair. Buckets left out are empty groups.
    pub fn script_buckets<'a, I, R>(
        &self,
        spec: &NodeMetricSpec,
        table: &str,
        feature: &FeatureCandidate,
        rows: I,
    ) where
        I: IntoIterator<Item = (i64, R)>,
        R: AsRef<[(&'a str, f64)]>,
    {
        let columns = std::iter::once(sql::BUCKET_COLUMN).chain(spec.names());
        let mut result = TabularResult::new(columns);
        for (bucket, values) in rows {
            let row = std::iter::once(Value::Int(bucket)).chain(metric_row(spec, values.as_ref()));
            result.push_row(row);
        }
        self.respond(spec.render_bucket_query(table, feature), result);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every submitted query, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.state().submitted.clone()
    }

    /// Every successfully created table, in order.
    pub fn created_tables(&self) -> Vec<String> {
        self.state().created.iter().map(|(name, _)| name.clone()).collect()
    }

    /// `(table, query)` of every successfully created table, in order.
    pub fn created_queries(&self) -> Vec<(String, String)> {
        self.state().created.clone()
    }

    /// Tables created and not dropped since, sorted.
    pub fn live_tables(&self) -> Vec<String> {
        self.state().live.iter().cloned().collect()
    }

    /// Every successful drop, in order.
    pub fn dropped_tables(&self) -> Vec<String> {
        self.state().dropped.clone()
    }

    /// Lifecycle requested when table `name` was created, if any.
    pub fn table_lifecycle(&self, name: &str) -> Option<u32> {
        self.state().lifecycles.get(name).copied()
    }

    /// Highest number of calls observed inside the engine at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
        InFlight(&self.in_flight)
    }

    fn create(&self, name: &str, query: &str, lifecycle: Option<u32>) -> Result<(), EngineError> {
        let _guard = self.enter();
        let mut state = self.state();
        let failed = |message: String| EngineError::JobFailed {
            job: format!("create-{}", name),
            message,
        };
        if state.failing_creates.contains(name) {
            return Err(failed(format!("cannot create table {}", name)));
        }
        if !state.live.insert(name.to_string()) {
            return Err(failed(format!("table {} already exists", name)));
        }
        state.created.push((name.to_string(), query.to_string()));
        if let Some(days) = lifecycle {
            state.lifecycles.insert(name.to_string(), days);
        }
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn metric_row(spec: &NodeMetricSpec, values: &[(&str, f64)]) -> Vec<Value> {
    spec.names()
        .map(|name| {
            values
                .iter()
                .find(|(n, _)| *n == name)
                .map_or(Value::Null, |&(_, v)| Value::Float(v))
        })
        .collect()
}

impl QueryEngine for MockEngine {
    fn submit(&self, query: &str, _wait: bool) -> Result<JobHandle, EngineError> {
        let _guard = self.enter();
        let mut state = self.state();
        state.submitted.push(query.to_string());
        if state.failing_queries.contains(query) {
            return Err(EngineError::Submission(format!("rejected: {}", query)));
        }
        state.next_job += 1;
        let id = format!("job-{}", state.next_job);
        state.jobs.insert(id.clone(), query.to_string());
        Ok(JobHandle::new(id))
    }

    fn fetch(&self, job: &JobHandle) -> Result<TabularResult, EngineError> {
        let _guard = self.enter();
        let state = self.state();
        let failed = |message: &str| EngineError::JobFailed {
            job: job.id().to_string(),
            message: message.to_string(),
        };
        let query = state.jobs.get(job.id()).ok_or_else(|| failed("unknown job"))?;
        state
            .responses
            .get(query)
            .cloned()
            .ok_or_else(|| failed(&format!("no scripted result for query:\n{}", query)))
    }

    fn create_table_as(&self, name: &str, query: &str) -> Result<(), EngineError> {
        self.create(name, query, None)
    }

    fn create_table_with_lifecycle(
        &self,
        name: &str,
        query: &str,
        lifecycle_days: u32,
    ) -> Result<(), EngineError> {
        self.create(name, query, Some(lifecycle_days))
    }

    fn drop_table_if_exists(&self, name: &str) -> Result<(), EngineError> {
        let _guard = self.enter();
        let mut state = self.state();
        if state.live.contains(name) {
            if let Some(remaining) = state.failing_drops.get_mut(name).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(EngineError::Unavailable(format!("cannot drop table {}", name)));
            }
        }
        if state.live.remove(name) {
            state.lifecycles.remove(name);
            state.dropped.push(name.to_string());
        }
        Ok(())
    }
}
