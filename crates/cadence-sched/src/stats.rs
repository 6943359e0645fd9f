//! Per-function counters.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// An atomic counter that never goes below zero.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    /// Increments the counter.
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the counter, flooring at zero.
    pub fn decr(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v - 1).max(0)));
    }

    /// Returns the current value.
    #[must_use]
    pub fn value(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters for one function.
#[derive(Debug, Default)]
pub struct FuncStat {
    /// Workers currently advertising the function.
    pub workers: Counter,
    /// Jobs persisted for the function.
    pub jobs: Counter,
    /// Jobs currently in flight.
    pub processing: Counter,
}

/// One function's counters as reported over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct StatSnapshot {
    pub func_name: String,
    pub total_worker: i64,
    pub total_job: i64,
    pub processing: i64,
}

/// Registry of per-function counters.
#[derive(Debug, Default)]
pub struct StatRegistry {
    stats: DashMap<String, FuncStat>,
}

impl StatRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<F: FnOnce(&FuncStat)>(&self, func: &str, f: F) {
        if let Some(stat) = self.stats.get(func) {
            f(&stat);
        }
    }

    /// Increments the worker count, creating the entry if needed.
    pub fn incr_workers(&self, func: &str) {
        self.stats.entry(func.to_owned()).or_default().workers.incr();
    }

    /// Decrements the worker count.
    pub fn decr_workers(&self, func: &str) {
        self.with(func, |s| s.workers.decr());
    }

    /// Increments the job count, creating the entry if needed.
    pub fn incr_jobs(&self, func: &str) {
        self.stats.entry(func.to_owned()).or_default().jobs.incr();
    }

    /// Decrements the job count.
    pub fn decr_jobs(&self, func: &str) {
        self.with(func, |s| s.jobs.decr());
    }

    /// Increments the processing count.
    pub fn incr_processing(&self, func: &str) {
        self.stats
            .entry(func.to_owned())
            .or_default()
            .processing
            .incr();
    }

    /// Decrements the processing count.
    pub fn decr_processing(&self, func: &str) {
        self.with(func, |s| s.processing.decr());
    }

    /// Current worker count for a function.
    #[must_use]
    pub fn workers(&self, func: &str) -> i64 {
        self.stats.get(func).map_or(0, |s| s.workers.value())
    }

    /// Removes a function's counters entirely.
    pub fn remove(&self, func: &str) {
        self.stats.remove(func);
    }

    /// One `func,workers,jobs,processing` line per function, sorted by name.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .stats
            .iter()
            .map(|entry| {
                let s = entry.value();
                format!(
                    "{},{},{},{}",
                    entry.key(),
                    s.workers.value(),
                    s.jobs.value(),
                    s.processing.value()
                )
            })
            .collect();
        lines.sort();
        lines
    }

    /// Snapshot of every function's counters.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StatSnapshot> {
        let mut all: Vec<StatSnapshot> = self
            .stats
            .iter()
            .map(|entry| {
                let s = entry.value();
                StatSnapshot {
                    func_name: entry.key().clone(),
                    total_worker: s.workers.value(),
                    total_job: s.jobs.value(),
                    processing: s.processing.value(),
                }
            })
            .collect();
        all.sort_by(|a, b| a.func_name.cmp(&b.func_name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_floors_at_zero() {
        let counter = Counter::default();
        counter.decr();
        assert_eq!(counter.value(), 0);

        counter.incr();
        counter.incr();
        counter.decr();
        assert_eq!(counter.value(), 1);
    }

    #[test]
    fn registry_lines() {
        let stats = StatRegistry::new();
        stats.incr_workers("beta");
        stats.incr_jobs("beta");
        stats.incr_jobs("alpha");
        stats.incr_processing("alpha");

        assert_eq!(stats.lines(), vec!["alpha,0,1,1", "beta,1,1,0"]);
    }

    #[test]
    fn decr_on_missing_func_is_noop() {
        let stats = StatRegistry::new();
        stats.decr_workers("ghost");
        assert_eq!(stats.workers("ghost"), 0);
        assert!(stats.lines().is_empty());
    }

    #[test]
    fn remove_clears_counters() {
        let stats = StatRegistry::new();
        stats.incr_jobs("f");
        stats.remove("f");
        assert!(stats.lines().is_empty());
    }
}
