//! Common utilities used across the crate.
//!
//! Parallelism configuration and the bounded worker pool that fans out
//! per-feature statistics queries.

use rayon::prelude::*;

// =============================================================================
// Parallelism Configuration
// =============================================================================

/// Whether parallel execution is allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    Sequential,
    Parallel,
}

impl Parallelism {
    /// Create from a concurrency cap: `1` is sequential, anything above is parallel.
    #[inline]
    pub fn from_threads(n_threads: usize) -> Self {
        if n_threads <= 1 {
            Parallelism::Sequential
        } else {
            Parallelism::Parallel
        }
    }

    /// Returns `true` if parallel execution is allowed.
    #[inline]
    pub fn is_parallel(self) -> bool {
        matches!(self, Parallelism::Parallel)
    }

    /// Map over a slice, in parallel when allowed. Output order matches input.
    #[inline]
    pub fn maybe_par_map<T, B, F>(self, items: &[T], f: F) -> Vec<B>
    where
        T: Sync,
        B: Send,
        F: Fn(&T) -> B + Sync + Send,
    {
        if self.is_parallel() {
            items.par_iter().map(f).collect()
        } else {
            items.iter().map(f).collect()
        }
    }
}

// =============================================================================
// QueryPool
// =============================================================================

/// Bounded pool for independent read queries.
///
/// With a cap of `n > 1` a dedicated rayon pool of exactly `n` threads is
/// created, so no more than `n` queries are in flight from one tree no matter
/// how large the global rayon pool is. A cap of `1` runs on the caller's thread.
#[derive(Debug)]
pub struct QueryPool {
    pool: Option<rayon::ThreadPool>,
}

impl QueryPool {
    pub fn new(max_concurrent: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = match Parallelism::from_threads(max_concurrent) {
            Parallelism::Sequential => None,
            Parallelism::Parallel => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(max_concurrent)
                    .thread_name(|i| format!("clustree-query-{}", i))
                    .build()?,
            ),
        };
        Ok(Self { pool })
    }

    /// Sequential pool (no worker threads).
    pub fn sequential() -> Self {
        Self { pool: None }
    }

    #[inline]
    pub fn parallelism(&self) -> Parallelism {
        if self.pool.is_some() {
            Parallelism::Parallel
        } else {
            Parallelism::Sequential
        }
    }

    /// Map `f` over `items` on the pool and join. Output order matches input.
    pub fn map<T, B, F>(&self, items: &[T], f: F) -> Vec<B>
    where
        T: Sync,
        B: Send,
        F: Fn(&T) -> B + Sync + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(|| Parallelism::Parallel.maybe_par_map(items, f)),
            None => Parallelism::Sequential.maybe_par_map(items, f),
        }
    }
}
