//! Bounded worker pool for execution units.
//!
//! Every unit of a run is known before the pool starts. Units run
//! concurrently and independently; each returns its own result, and the
//! results are merged by the caller after the pool drains.

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Number of workers used when none is requested.
pub fn default_jobs() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Run `work` over every unit on a pool of `jobs` threads.
///
/// Results come back in the order of `units`, whatever order the units
/// finished in.
pub fn run_parallel<T, R, F>(jobs: usize, units: &[T], work: F) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if units.is_empty() {
        return Ok(Vec::new());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .thread_name(|i| format!("texrun-worker-{}", i))
        .build()
        .map_err(|e| Error::Pool(e.to_string()))?;

    tracing::debug!("running {} units on {} workers", units.len(), jobs.max(1));
    Ok(pool.install(|| units.par_iter().map(&work).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_results_keep_submission_order() {
        let units: Vec<u64> = (0..16).collect();
        let results = run_parallel(4, &units, |n| {
            std::thread::sleep(Duration::from_millis(16 - n));
            n * 2
        })
        .expect("Failed to run pool");
        assert_eq!(results, units.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_pool_is_bounded() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let units: Vec<usize> = (0..12).collect();
        run_parallel(2, &units, |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
        })
        .expect("Failed to run pool");
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_empty_and_defaults() {
        let none: Vec<u8> = Vec::new();
        assert!(run_parallel(0, &none, |x| *x).expect("Failed to run pool").is_empty());
        assert!(default_jobs() >= 1);
    }
}
