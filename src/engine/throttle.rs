//! Session-wide cap on concurrent engine calls.

use std::sync::{Condvar, Mutex, MutexGuard};

use super::{EngineError, JobHandle, QueryEngine, TabularResult};

/// Wraps an engine so that at most `limit` calls are in flight at once.
///
/// A tree already bounds its own fan-out through
/// [`TreeParams::max_concurrent_queries`](crate::TreeParams). This wrapper is
/// for a session shared between several trees (or other clients) that must
/// respect the engine's own concurrency quota. A blocking
/// [`query`](QueryEngine::query) holds one permit for submit and fetch.
#[derive(Debug)]
pub struct ThrottledEngine<E> {
    inner: E,
    limit: usize,
    active: Mutex<usize>,
    released: Condvar,
}

struct Permit<'a> {
    active: &'a Mutex<usize>,
    released: &'a Condvar,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut active = lock(self.active);
        *active -= 1;
        drop(active);
        self.released.notify_one();
    }
}

fn lock(m: &Mutex<usize>) -> MutexGuard<'_, usize> {
    // The counter stays consistent even if a holder panicked.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<E: QueryEngine> ThrottledEngine<E> {
    /// Wrap `inner`, allowing `limit` concurrent calls (at least one).
    pub fn new(inner: E, limit: usize) -> Self {
        Self {
            inner,
            limit: limit.max(1),
            active: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn into_inner(self) -> E {
        self.inner
    }

    fn acquire(&self) -> Permit<'_> {
        let mut active = lock(&self.active);
        while *active >= self.limit {
            active = self
                .released
                .wait(active)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *active += 1;
        Permit {
            active: &self.active,
            released: &self.released,
        }
    }
}

impl<E: QueryEngine> QueryEngine for ThrottledEngine<E> {
    fn submit(&self, query: &str, wait: bool) -> Result<JobHandle, EngineError> {
        let _permit = self.acquire();
        self.inner.submit(query, wait)
    }

    fn fetch(&self, job: &JobHandle) -> Result<TabularResult, EngineError> {
        let _permit = self.acquire();
        self.inner.fetch(job)
    }

    fn create_table_as(&self, name: &str, query: &str) -> Result<(), EngineError> {
        let _permit = self.acquire();
        self.inner.create_table_as(name, query)
    }

    fn drop_table_if_exists(&self, name: &str) -> Result<(), EngineError> {
        let _permit = self.acquire();
        self.inner.drop_table_if_exists(name)
    }

    fn create_table_with_lifecycle(
        &self,
        name: &str,
        query: &str,
        lifecycle_days: u32,
    ) -> Result<(), EngineError> {
        let _permit = self.acquire();
        self.inner.create_table_with_lifecycle(name, query, lifecycle_days)
    }

    fn query(&self, query: &str) -> Result<TabularResult, EngineError> {
        let _permit = self.acquire();
        let job = self.inner.submit(query, true)?;
        self.inner.fetch(&job)
    }
}
