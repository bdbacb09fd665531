//! Stress tests for Strata.
//!
//! These tests verify behavior under heavy load and concurrent access.

use crate::fixtures::scenarios::numbered;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use strata_core::{CoreError, Strata};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    #[must_use]
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of records to insert.
    pub operations: usize,
    /// Number of concurrent writer threads.
    pub threads: usize,
    /// Number of concurrent reader threads.
    pub readers: usize,
    /// Inserts between balances in sequential runs.
    pub balance_every: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            readers: 2,
            balance_every: 100,
        }
    }
}

/// Counts an outcome, treating a refused balance as a success.
fn tally(result: Result<(), CoreError>, successful: &AtomicUsize, failed: &AtomicUsize) {
    match result {
        Ok(()) | Err(CoreError::AlreadyBalancing) => {
            successful.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Inserts records in random order, balancing periodically.
pub fn stress_shuffled_inserts(tree: &Strata, config: &StressConfig) -> StressTestResult {
    let mut keys: Vec<Vec<u8>> = (0..config.operations).map(numbered).collect();
    keys.shuffle(&mut rand::thread_rng());

    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    for (i, key) in keys.iter().enumerate() {
        tally(tree.insert(key).map(drop), &successful, &failed);
        if (i + 1) % config.balance_every.max(1) == 0 {
            tally(tree.balance().map(drop), &successful, &failed);
        }
    }
    tally(tree.balance().map(drop), &successful, &failed);

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Runs writers over disjoint key ranges while readers walk the leaves and
/// a background thread balances and purges.
///
/// Every reader walk must come back in key order.
pub fn stress_concurrent(tree: &Strata, config: &StressConfig) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let writing = AtomicBool::new(true);
    let writers_left = AtomicUsize::new(config.threads.max(1));
    let per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();
    thread::scope(|scope| {
        for t in 0..config.threads.max(1) {
            let (successful, failed, writing, writers_left) =
                (&successful, &failed, &writing, &writers_left);
            scope.spawn(move || {
                let mut keys: Vec<Vec<u8>> = (t * per_thread..(t + 1) * per_thread)
                    .map(numbered)
                    .collect();
                keys.shuffle(&mut rand::thread_rng());
                for key in &keys {
                    tally(tree.insert(key).map(drop), successful, failed);
                }
                if writers_left.fetch_sub(1, Ordering::AcqRel) == 1 {
                    writing.store(false, Ordering::Release);
                }
            });
        }

        for _ in 0..config.readers {
            let (successful, failed, writing) = (&successful, &failed, &writing);
            scope.spawn(move || {
                while writing.load(Ordering::Acquire) {
                    let walked = tree.records().map(|records| {
                        assert!(records.windows(2).all(|w| w[0] < w[1]), "walk out of order");
                    });
                    tally(walked, successful, failed);
                }
            });
        }

        let (successful, failed, writing) = (&successful, &failed, &writing);
        scope.spawn(move || {
            while writing.load(Ordering::Acquire) {
                tally(tree.balance().map(drop), successful, failed);
                tree.purge(16);
                thread::yield_now();
            }
        });
    });
    tally(tree.balance().map(drop), &successful, &failed);

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}
