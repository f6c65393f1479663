//! Adaptive batch scheduling.
//!
//! The scheduler hands out one batch at a time. Batches produced by the
//! splitter are queued at the front and returned as they are; everything
//! else is carved from the remaining suite groups in enumeration order,
//! with a size that reacts to how often batches have been crashing.
//!
//! # Sizing
//!
//! | Crash rate `r` | Batch size |
//! |----------------|------------|
//! | `r < crash_rate_threshold` | `max(t0, min_batch_size)` |
//! | `r >= crash_rate_threshold` | `min(t0, floor(loss_budget / r))` |
//!
//! where `t0 = pending / (workers * fairness)`. The result is clamped to
//! `1..=pending`. A rising crash rate never grows the batch size.
//!
//! # Example
//!
//! ```
//! use gtest_sieve::config::SchedulerConfig;
//! use gtest_sieve::framework::SuiteGroup;
//! use gtest_sieve::orchestrator::Scheduler;
//!
//! let groups = vec![SuiteGroup::new("A", ["1", "2", "3"]), SuiteGroup::new("B", ["1"])];
//! let mut scheduler = Scheduler::new(2, SchedulerConfig::default(), groups);
//!
//! // Few tests and no crashes: the minimum batch size swallows everything.
//! let batch = scheduler.next_batch().unwrap();
//! assert_eq!(batch.len(), 4);
//! assert!(scheduler.is_done());
//! ```

use std::collections::VecDeque;

use crate::config::SchedulerConfig;
use crate::framework::{Batch, SuiteGroup};

/// Hands out batches, priority work first.
pub struct Scheduler {
    workers: usize,
    config: SchedulerConfig,
    priority: VecDeque<Batch>,
    pending: VecDeque<SuiteGroup>,
    pending_tests: usize,
    tests_executed: usize,
    crashes: usize,
}

impl Scheduler {
    /// Creates a scheduler over `groups`, kept in the given order.
    ///
    /// `workers` below 1 is treated as 1.
    pub fn new(workers: usize, config: SchedulerConfig, groups: Vec<SuiteGroup>) -> Self {
        let pending: VecDeque<SuiteGroup> = groups.into_iter().filter(|g| !g.is_empty()).collect();
        let pending_tests = pending.iter().map(SuiteGroup::len).sum();
        Self {
            workers: workers.max(1),
            config,
            priority: VecDeque::new(),
            pending,
            pending_tests,
            tests_executed: 0,
            crashes: 0,
        }
    }

    /// Returns the next batch, or `None` when no work is queued.
    pub fn next_batch(&mut self) -> Option<Batch> {
        if let Some(batch) = self.priority.pop_front() {
            return Some(batch);
        }
        if self.pending_tests == 0 {
            return None;
        }

        let mut remaining = self.batch_size();
        let mut batch = Batch::new();
        while remaining > 0 {
            let Some(mut group) = self.pending.pop_front() else {
                break;
            };
            if group.len() > remaining {
                let rest = group.names.split_off(remaining);
                self.pending.push_front(SuiteGroup {
                    suite: group.suite.clone(),
                    names: rest,
                });
            }
            remaining -= group.len();
            self.pending_tests -= group.len();
            batch.push_group(group);
        }

        Some(batch)
    }

    /// Queues batches ahead of all other work, preserving their order.
    pub fn push_priority(&mut self, batches: Vec<Batch>) {
        for batch in batches.into_iter().rev() {
            if !batch.is_empty() {
                self.priority.push_front(batch);
            }
        }
    }

    /// Records that a batch of `count` tests completed.
    pub fn record_executed(&mut self, count: usize) {
        self.tests_executed += count;
    }

    /// Records one malformed batch.
    pub fn record_crash(&mut self) {
        self.crashes += 1;
    }

    /// Crashes per executed test; zero before anything ran.
    pub fn crash_rate(&self) -> f64 {
        if self.tests_executed == 0 {
            0.0
        } else {
            self.crashes as f64 / self.tests_executed as f64
        }
    }

    /// Size of the next batch carved from pending suites.
    pub fn batch_size(&self) -> usize {
        if self.pending_tests == 0 {
            return 0;
        }

        let base = self.pending_tests / (self.workers * self.config.fairness.max(1));
        let rate = self.crash_rate();
        let size = if rate < self.config.crash_rate_threshold {
            base.max(self.config.min_batch_size)
        } else {
            let budget = (self.config.loss_budget / rate).floor() as usize;
            base.min(budget)
        };

        size.clamp(1, self.pending_tests)
    }

    /// Tests not yet handed out, excluding priority batches.
    pub fn pending_tests(&self) -> usize {
        self.pending_tests
    }

    /// Returns true once every test has been handed out.
    pub fn is_done(&self) -> bool {
        self.priority.is_empty() && self.pending_tests == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(suites: usize, leaves: usize) -> Vec<SuiteGroup> {
        (0..suites)
            .map(|s| SuiteGroup::new(format!("S{}", s), (0..leaves).map(|l| format!("T{}", l))))
            .collect()
    }

    fn with_rate(scheduler: &mut Scheduler, executed: usize, crashes: usize) {
        scheduler.record_executed(executed);
        for _ in 0..crashes {
            scheduler.record_crash();
        }
    }

    #[test]
    fn test_crash_rate_zero_without_history() {
        let scheduler = Scheduler::new(4, SchedulerConfig::default(), groups(1, 5));
        assert_eq!(scheduler.crash_rate(), 0.0);
    }

    #[test]
    fn test_min_batch_size_when_healthy() {
        // t0 = 100 / (10 * 4) = 2, raised to the minimum of 10.
        let scheduler = Scheduler::new(10, SchedulerConfig::default(), groups(10, 10));
        assert_eq!(scheduler.batch_size(), 10);
    }

    #[test]
    fn test_large_pending_uses_base_size() {
        // t0 = 1000 / (2 * 4) = 125
        let scheduler = Scheduler::new(2, SchedulerConfig::default(), groups(10, 100));
        assert_eq!(scheduler.batch_size(), 125);
    }

    #[test]
    fn test_high_crash_rate_shrinks_to_one() {
        let mut scheduler = Scheduler::new(10, SchedulerConfig::default(), groups(10, 10));
        with_rate(&mut scheduler, 2, 1);
        assert_eq!(scheduler.crash_rate(), 0.5);
        assert!(scheduler.batch_size() <= 1);
    }

    #[test]
    fn test_size_never_grows_with_crash_rate() {
        let mut last = usize::MAX;
        for crashes in 0..=50 {
            let mut scheduler = Scheduler::new(2, SchedulerConfig::default(), groups(20, 50));
            with_rate(&mut scheduler, 100, crashes);
            let size = scheduler.batch_size();
            assert!(size <= last, "size grew at {} crashes", crashes);
            assert!(size >= 1);
            last = size;
        }
    }

    #[test]
    fn test_batches_follow_enumeration_order() {
        let config = SchedulerConfig {
            min_batch_size: 3,
            ..Default::default()
        };
        let mut scheduler = Scheduler::new(1, config, vec![
            SuiteGroup::new("A", ["1", "2"]),
            SuiteGroup::new("B", ["1", "2", "3"]),
        ]);

        let first = scheduler.next_batch().unwrap();
        let names: Vec<_> = first.tests().iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["A.1", "A.2", "B.1"]);

        let second = scheduler.next_batch().unwrap();
        let names: Vec<_> = second.tests().iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["B.2", "B.3"]);

        assert!(scheduler.next_batch().is_none());
        assert!(scheduler.is_done());
    }

    #[test]
    fn test_priority_batches_come_first_in_order() {
        let mut scheduler = Scheduler::new(1, SchedulerConfig::default(), groups(1, 3));
        let first = Batch::single(crate::framework::TestId::new("P", "1"));
        let second = Batch::single(crate::framework::TestId::new("P", "2"));
        scheduler.push_priority(vec![first.clone(), second.clone()]);

        assert_eq!(scheduler.next_batch(), Some(first));
        assert_eq!(scheduler.next_batch(), Some(second));
        assert_eq!(scheduler.next_batch().map(|b| b.len()), Some(3));
        assert!(scheduler.is_done());
    }

    #[test]
    fn test_empty_groups_are_dropped() {
        let mut scheduler = Scheduler::new(
            1,
            SchedulerConfig::default(),
            vec![SuiteGroup::new("A", Vec::<String>::new())],
        );
        assert!(scheduler.is_done());
        assert_eq!(scheduler.batch_size(), 0);
        assert!(scheduler.next_batch().is_none());
    }
}
