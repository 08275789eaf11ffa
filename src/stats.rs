//! Query and chunk statistics (component H).
//!
//! Tracks, per user query, how many tasks have been queued/started/
//! completed, and moves a query through a mostly-dead -> newly-dead ->
//! dead lifecycle once its task count catches up with its queued size.
//! Per-(table, chunk) rolling averages feed the scheduler's boot
//! decisions in [`crate::scheduler`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Weight given to the incoming sample vs. the existing average when
/// folding a freshly completed task's duration into a rolling average.
const WEIGHT_RECENT: f64 = 0.25;
const WEIGHT_HISTORICAL: f64 = 0.75;

/// Per-query counters and bookkeeping.
pub struct QueryStatistics {
    pub query_id: u64,
    size: u64,
    tasks_running: u64,
    tasks_completed: u64,
    tasks_booted: u64,
    query_booted: bool,
    total_time_minutes: f64,
    touched: Instant,
}

impl QueryStatistics {
    pub fn new(query_id: u64) -> Self {
        Self {
            query_id,
            size: 0,
            tasks_running: 0,
            tasks_completed: 0,
            tasks_booted: 0,
            query_booted: false,
            total_time_minutes: 0.0,
            touched: Instant::now(),
        }
    }

    pub fn queued(&mut self) {
        self.size += 1;
        self.touched = Instant::now();
    }

    pub fn started(&mut self) {
        self.tasks_running += 1;
        self.touched = Instant::now();
    }

    /// Returns `true` if this completion makes the query "mostly dead"
    /// (every queued task has now completed).
    pub fn finished(&mut self, duration_minutes: f64) -> bool {
        self.tasks_running = self.tasks_running.saturating_sub(1);
        self.tasks_completed += 1;
        self.total_time_minutes += duration_minutes;
        self.touched = Instant::now();
        self.is_mostly_dead()
    }

    pub fn is_mostly_dead(&self) -> bool {
        self.tasks_completed >= self.size
    }

    /// Mostly-dead for longer than `dead_after` without being touched
    /// again (a re-queued task on the same id would bump `size` and
    /// un-stick it).
    pub fn is_dead(&self, dead_after: Duration) -> bool {
        self.is_mostly_dead() && self.touched.elapsed() > dead_after
    }

    pub fn tasks_booted(&self) -> u64 {
        self.tasks_booted
    }

    pub fn record_boot(&mut self) {
        self.tasks_booted += 1;
    }

    pub fn is_query_booted(&self) -> bool {
        self.query_booted
    }

    pub fn set_query_booted(&mut self) {
        self.query_booted = true;
    }
}

/// Rolling average completion time for one (table, chunk) pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkTableData {
    pub tasks_completed: u64,
    pub avg_completion_minutes: f64,
}

impl ChunkTableData {
    /// Fold in a freshly completed task's duration. The first sample sets
    /// the average outright; subsequent samples blend at
    /// `{WEIGHT_HISTORICAL, WEIGHT_RECENT}`.
    pub fn add_task_finished(&mut self, minutes: f64) {
        self.tasks_completed += 1;
        if self.tasks_completed > 1 {
            self.avg_completion_minutes =
                self.avg_completion_minutes * WEIGHT_HISTORICAL + minutes * WEIGHT_RECENT;
        } else {
            self.avg_completion_minutes = minutes;
        }
    }
}

/// Registry of all in-flight and recently dead query statistics, plus
/// per-(table, chunk) completion-time averages.
pub struct Stats {
    queries: Mutex<HashMap<u64, QueryStatistics>>,
    newly_dead: Mutex<HashMap<u64, ()>>,
    dead: Mutex<HashMap<u64, Instant>>,
    chunk_table: Mutex<HashMap<(String, i32), ChunkTableData>>,
    dead_after: Duration,
    required_tasks_completed: u32,
}

impl Stats {
    pub fn new(dead_after: Duration, required_tasks_completed: u32) -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
            newly_dead: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashMap::new()),
            chunk_table: Mutex::new(HashMap::new()),
            dead_after,
            required_tasks_completed,
        }
    }

    pub fn add_query(&self, query_id: u64) {
        self.queries
            .lock()
            .entry(query_id)
            .or_insert_with(|| QueryStatistics::new(query_id));
    }

    pub fn queued_task(&self, query_id: u64) {
        if let Some(q) = self.queries.lock().get_mut(&query_id) {
            q.queued();
        }
    }

    pub fn started_task(&self, query_id: u64) {
        if let Some(q) = self.queries.lock().get_mut(&query_id) {
            q.started();
        }
    }

    /// Record a task completion for `query_id` against `(table, chunk)`,
    /// folding the duration into both the query's own counters and the
    /// per-(table, chunk) rolling average.
    /// Bump `query_id`'s boot counter (creating its entry if this is the
    /// first boot the stats engine has seen for it) and return the new
    /// count, so a caller can decide whether to escalate.
    pub fn record_boot(&self, query_id: u64) -> u64 {
        let mut queries = self.queries.lock();
        let q = queries.entry(query_id).or_insert_with(|| QueryStatistics::new(query_id));
        q.record_boot();
        q.tasks_booted()
    }

    pub fn mark_query_booted(&self, query_id: u64) {
        if let Some(q) = self.queries.lock().get_mut(&query_id) {
            q.set_query_booted();
        }
    }

    pub fn is_query_booted(&self, query_id: u64) -> bool {
        self.queries.lock().get(&query_id).map(|q| q.is_query_booted()).unwrap_or(false)
    }

    pub fn finished_task(&self, query_id: u64, table: &str, chunk: i32, duration_minutes: f64) {
        let mostly_dead = {
            let mut queries = self.queries.lock();
            match queries.get_mut(&query_id) {
                Some(q) => q.finished(duration_minutes),
                None => false,
            }
        };
        if mostly_dead {
            self.newly_dead.lock().insert(query_id, ());
            debug!(query_id, "query is now mostly dead");
        }

        self.chunk_table
            .lock()
            .entry((table.to_string(), chunk))
            .or_default()
            .add_task_finished(duration_minutes);
    }

    /// Promote everything in `newly_dead` into `dead`, stamping the time
    /// they became dead. Called on the same cadence as the examiner tick.
    pub fn sweep_newly_dead(&self) {
        let newly = std::mem::take(&mut *self.newly_dead.lock());
        let mut dead = self.dead.lock();
        for (query_id, ()) in newly {
            dead.entry(query_id).or_insert_with(Instant::now);
        }
    }

    /// Remove and return ids that have been dead for longer than
    /// `dead_after` and are safe to fully retire.
    pub fn remove_dead(&self) -> Vec<u64> {
        let mut dead = self.dead.lock();
        let mut queries = self.queries.lock();
        let mut removed = Vec::new();
        dead.retain(|&query_id, since| {
            let is_dead = queries
                .get(&query_id)
                .map(|q| q.is_dead(self.dead_after))
                .unwrap_or(true);
            if is_dead && since.elapsed() > self.dead_after {
                queries.remove(&query_id);
                removed.push(query_id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Percent share of total completion time each (table, chunk) pair
    /// represents within its table, used by the examiner to decide
    /// whether a running task is taking too long. Returns `None` for
    /// chunks with fewer than `required_tasks_completed` samples.
    pub fn chunk_percent_of_table(&self, table: &str, chunk: i32) -> Option<f64> {
        let chunk_table = self.chunk_table.lock();
        let this = chunk_table.get(&(table.to_string(), chunk))?;
        if this.tasks_completed < self.required_tasks_completed as u64 {
            return None;
        }
        let total: f64 = chunk_table
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, data)| data.avg_completion_minutes)
            .sum();
        if total <= 0.0 {
            return None;
        }
        Some(this.avg_completion_minutes / total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_becomes_mostly_dead_when_completed_matches_size() {
        let mut q = QueryStatistics::new(1);
        q.queued();
        q.queued();
        assert!(!q.finished(1.0));
        assert!(q.finished(1.0));
        assert!(q.is_mostly_dead());
    }

    #[test]
    fn chunk_table_average_blends_after_first_sample() {
        let mut data = ChunkTableData::default();
        data.add_task_finished(10.0);
        assert_eq!(data.avg_completion_minutes, 10.0);
        data.add_task_finished(2.0);
        assert_eq!(data.avg_completion_minutes, 10.0 * 0.75 + 2.0 * 0.25);
    }

    #[test]
    fn stats_lifecycle_tracks_mostly_dead_then_sweeps() {
        let stats = Stats::new(Duration::from_millis(0), 1);
        stats.add_query(42);
        stats.queued_task(42);
        stats.finished_task(42, "Object", 100, 3.0);

        stats.sweep_newly_dead();
        let removed = stats.remove_dead();
        assert_eq!(removed, vec![42]);
    }

    #[test]
    fn chunk_percent_requires_minimum_samples() {
        let stats = Stats::new(Duration::from_secs(60), 5);
        stats.finished_task(1, "Object", 1, 2.0);
        assert!(stats.chunk_percent_of_table("Object", 1).is_none());
    }

    #[test]
    fn record_boot_creates_entry_and_accumulates() {
        let stats = Stats::new(Duration::from_secs(60), 1);
        assert_eq!(stats.record_boot(7), 1);
        assert_eq!(stats.record_boot(7), 2);
        assert!(!stats.is_query_booted(7));
        stats.mark_query_booted(7);
        assert!(stats.is_query_booted(7));
    }

    #[test]
    fn chunk_percent_reflects_share_of_table_total() {
        let stats = Stats::new(Duration::from_secs(60), 1);
        stats.finished_task(1, "Object", 1, 3.0);
        stats.finished_task(1, "Object", 2, 1.0);
        let percent = stats.chunk_percent_of_table("Object", 1).unwrap();
        assert!((percent - 0.75).abs() < 1e-9);
    }
}
