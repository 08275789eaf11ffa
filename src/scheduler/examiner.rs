//! Periodic examination of running tasks, booting runaways.

use std::sync::Arc;

use tracing::{info, warn};

use crate::scheduler::lanes::{LaneName, Scheduler};
use crate::stats::Stats;

/// A task currently running on a lane, as seen by one examiner tick.
pub struct RunningTask {
    pub task_id: u64,
    pub query_id: u64,
    pub lane: LaneName,
    pub table: String,
    pub chunk: i32,
    pub run_time_minutes: f64,
}

/// Outcome of examining one running task.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Boot,
    /// The task's query has been booted past the snail-lane threshold and
    /// should be reported upstream as a cancellation candidate.
    EscalateToCzar,
}

/// Boots tasks that are taking longer than their historical share of a
/// lane's time budget warrants, and escalates queries that keep getting
/// booted even after landing on the snail lane.
pub struct Examiner {
    stats: Arc<Stats>,
    max_tasks_booted: u32,
}

impl Examiner {
    pub fn new(stats: Arc<Stats>, max_tasks_booted: u32) -> Self {
        Self { stats, max_tasks_booted }
    }

    /// Decide whether `task` should keep running, be booted back to the
    /// queue, or its query escalated upstream. Does not itself touch the
    /// scheduler or stats beyond reading them — callers apply the verdict.
    pub fn examine(&self, task: &RunningTask, scheduler: &Scheduler) -> Verdict {
        let max_time = scheduler.max_time_minutes(task.lane);
        let percent = match self.stats.chunk_percent_of_table(&task.table, task.chunk) {
            Some(p) => p,
            None => return Verdict::Keep,
        };
        let budget = percent * max_time;
        if task.run_time_minutes <= budget {
            return Verdict::Keep;
        }

        warn!(
            task_id = task.task_id,
            query_id = task.query_id,
            run_time_minutes = task.run_time_minutes,
            budget,
            "task exceeded its time budget"
        );
        Verdict::Boot
    }

    /// Apply a boot: bump the query's boot count (tracked in `self.stats`,
    /// the one place that count lives) and escalate it if it's crossed
    /// `max_tasks_booted`, either by moving it to the snail lane or, if
    /// it's already there and keeps overrunning, flagging it for upstream
    /// cancellation.
    pub fn boot(&self, query_id: u64, scheduler: &Scheduler) -> Verdict {
        let booted_count = self.stats.record_boot(query_id);

        if scheduler.is_query_on_snail(query_id) {
            if booted_count > self.max_tasks_booted as u64 + 1 {
                warn!(query_id, booted_count, "query excessive on snail lane, flagging for cancellation");
                return Verdict::EscalateToCzar;
            }
            return Verdict::Boot;
        }

        if booted_count > self.max_tasks_booted as u64 {
            info!(query_id, booted_count, "escalating query to snail lane");
            scheduler.move_query_to_snail(query_id);
            self.stats.mark_query_booted(query_id);
        }
        Verdict::Boot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::lanes::Lane;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::new(vec![Lane::new(LaneName::Normal, 4, 10.0), Lane::new(LaneName::Snail, 4, 120.0)])
    }

    #[test]
    fn keeps_task_with_no_historical_data() {
        let stats = Arc::new(Stats::new(Duration::from_secs(60), 5));
        let examiner = Examiner::new(stats, 3);
        let sched = scheduler();
        let task = RunningTask {
            task_id: 1,
            query_id: 1,
            lane: LaneName::Normal,
            table: "Object".into(),
            chunk: 1,
            run_time_minutes: 100.0,
        };
        assert_eq!(examiner.examine(&task, &sched), Verdict::Keep);
    }

    #[test]
    fn boots_task_exceeding_its_share_of_the_budget() {
        let stats = Arc::new(Stats::new(Duration::from_secs(60), 1));
        stats.finished_task(1, "Object", 1, 8.0);
        stats.finished_task(1, "Object", 2, 2.0);
        let examiner = Examiner::new(stats, 3);
        let sched = scheduler();

        let task = RunningTask {
            task_id: 1,
            query_id: 1,
            lane: LaneName::Normal,
            table: "Object".into(),
            chunk: 1,
            run_time_minutes: 9.0,
        };
        assert_eq!(examiner.examine(&task, &sched), Verdict::Boot);
    }

    #[test]
    fn escalates_to_snail_after_threshold_boots() {
        let stats = Arc::new(Stats::new(Duration::from_secs(60), 1));
        let examiner = Examiner::new(stats, 2);
        let sched = scheduler();

        examiner.boot(5, &sched); // booted_count = 1
        assert!(!sched.is_query_on_snail(5));
        examiner.boot(5, &sched); // booted_count = 2
        assert!(!sched.is_query_on_snail(5));
        examiner.boot(5, &sched); // booted_count = 3 > max_tasks_booted (2)
        assert!(sched.is_query_on_snail(5));
    }

    #[test]
    fn escalates_to_czar_after_repeated_snail_boots() {
        let stats = Arc::new(Stats::new(Duration::from_secs(60), 1));
        let examiner = Examiner::new(stats, 2);
        let sched = scheduler();
        sched.move_query_to_snail(7);

        assert_eq!(examiner.boot(7, &sched), Verdict::Boot); // count = 1
        assert_eq!(examiner.boot(7, &sched), Verdict::Boot); // count = 2
        assert_eq!(examiner.boot(7, &sched), Verdict::Boot); // count = 3, not > max+1 (3)
        assert_eq!(examiner.boot(7, &sched), Verdict::EscalateToCzar); // count = 4 > 3
    }

    #[test]
    fn boot_is_reachable_through_stats_without_an_external_counter() {
        let stats = Arc::new(Stats::new(Duration::from_secs(60), 1));
        let examiner = Examiner::new(stats.clone(), 5);
        let sched = scheduler();

        examiner.boot(9, &sched);
        assert_eq!(stats.record_boot(9), 2);
    }
}
