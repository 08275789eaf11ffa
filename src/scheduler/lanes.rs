//! Named priority lanes a worker dispatches scan tasks into.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::queue::PriorityQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneName {
    VeryHigh,
    High,
    Normal,
    Low,
    Snail,
}

impl LaneName {
    /// Lanes ordered from fastest to slowest, the order a query escalates
    /// through as it gets booted repeatedly.
    pub fn all() -> [LaneName; 5] {
        [
            LaneName::VeryHigh,
            LaneName::High,
            LaneName::Normal,
            LaneName::Low,
            LaneName::Snail,
        ]
    }

    pub fn priority(self) -> i32 {
        match self {
            LaneName::VeryHigh => 4,
            LaneName::High => 3,
            LaneName::Normal => 2,
            LaneName::Low => 1,
            LaneName::Snail => 0,
        }
    }
}

/// One named lane: a capacity ceiling and a per-chunk time budget.
///
/// `running` tracks task id -> query id for tasks this lane currently
/// counts against its capacity. A task leaves this map either because it
/// finished normally ([`Scheduler::task_finished`]) or because it was
/// removed from scheduler accounting while still executing
/// ([`Scheduler::remove_query_from`]) — the task's thread keeps running
/// either way, only the lane's bookkeeping changes.
pub struct Lane {
    pub name: LaneName,
    pub capacity: usize,
    pub max_time_per_chunk_minutes: f64,
    running: HashMap<u64, u64>,
}

impl Lane {
    pub fn new(name: LaneName, capacity: usize, max_time_per_chunk_minutes: f64) -> Self {
        Self {
            name,
            capacity,
            max_time_per_chunk_minutes,
            running: HashMap::new(),
        }
    }

    pub fn has_room(&self) -> bool {
        self.running.len() < self.capacity
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

#[derive(Debug, Clone)]
pub struct ScanTask {
    pub task_id: u64,
    pub query_id: u64,
    pub table: String,
    pub chunk: i32,
}

/// Dispatches scan tasks across the named lanes, each with an independent
/// FIFO-by-priority queue. A query that's been escalated to the snail
/// lane (via [`crate::scheduler::examiner::Examiner`]) stays there for
/// the rest of its lifetime.
pub struct Scheduler {
    lanes: HashMap<LaneName, Mutex<Lane>>,
    queues: Mutex<HashMap<LaneName, PriorityQueue<ScanTask>>>,
    snail_queries: Mutex<std::collections::HashSet<u64>>,
}

impl Scheduler {
    pub fn new(lanes: Vec<Lane>) -> Self {
        let mut lane_map = HashMap::new();
        let mut queue_map = HashMap::new();
        for lane in lanes {
            queue_map.insert(lane.name, PriorityQueue::new());
            lane_map.insert(lane.name, Mutex::new(lane));
        }
        Self {
            lanes: lane_map,
            queues: Mutex::new(queue_map),
            snail_queries: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Enqueue a task into `lane`, unless its query has already been
    /// escalated to the snail lane, in which case it's redirected there
    /// regardless of what the caller asked for.
    pub fn enqueue(&self, mut lane: LaneName, task: ScanTask) {
        if self.snail_queries.lock().contains(&task.query_id) {
            lane = LaneName::Snail;
        }
        let priority = lane.priority();
        self.queues.lock().get_mut(&lane).expect("lane exists").push_back(priority, task);
    }

    /// Pop the next task to run from the highest-priority lane with room
    /// and a queued task.
    pub fn dispatch_next(&self) -> Option<(LaneName, ScanTask)> {
        let mut queues = self.queues.lock();
        for name in LaneName::all() {
            let Some(lane) = self.lanes.get(&name) else { continue };
            if !lane.lock().has_room() {
                continue;
            }
            if let Some(task) = queues.get_mut(&name).and_then(|q| q.pop()) {
                lane.lock().running.insert(task.task_id, task.query_id);
                return Some((name, task));
            }
        }
        None
    }

    pub fn task_finished(&self, lane: LaneName, task_id: u64) {
        if let Some(lane) = self.lanes.get(&lane) {
            lane.lock().running.remove(&task_id);
        }
    }

    /// `removeQueryFrom(qid, sched?)`: first drop every not-yet-running
    /// task belonging to `query_id` from the named lane (or every lane, if
    /// `lane` is `None`), then remove its still-running tasks from each
    /// lane's accounting, marking them completed-on-scheduler. A task
    /// already pulled by a worker thread keeps running; it just no longer
    /// counts against its lane's capacity.
    pub fn remove_query_from(&self, query_id: u64, lane: Option<LaneName>) {
        let targets: Vec<LaneName> = match lane {
            Some(l) => vec![l],
            None => LaneName::all().to_vec(),
        };

        {
            let mut queues = self.queues.lock();
            for name in &targets {
                if let Some(queue) = queues.get_mut(name) {
                    while queue.remove(|task| task.query_id == query_id).is_some() {}
                }
            }
        }

        for name in &targets {
            if let Some(lane) = self.lanes.get(name) {
                lane.lock().running.retain(|_, &mut qid| qid != query_id);
            }
        }
    }

    pub fn max_time_minutes(&self, lane: LaneName) -> f64 {
        self.lanes
            .get(&lane)
            .map(|l| l.lock().max_time_per_chunk_minutes)
            .unwrap_or(0.0)
    }

    pub fn is_snail(&self, lane: LaneName) -> bool {
        lane == LaneName::Snail
    }

    /// Permanently move every future task belonging to `query_id` to the
    /// snail lane.
    pub fn move_query_to_snail(&self, query_id: u64) {
        self.snail_queries.lock().insert(query_id);
    }

    pub fn is_query_on_snail(&self, query_id: u64) -> bool {
        self.snail_queries.lock().contains(&query_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(vec![
            Lane::new(LaneName::VeryHigh, 1, 1.0),
            Lane::new(LaneName::Normal, 1, 5.0),
            Lane::new(LaneName::Snail, 10, 60.0),
        ])
    }

    #[test]
    fn dispatches_highest_priority_lane_first() {
        let sched = scheduler();
        sched.enqueue(
            LaneName::Normal,
            ScanTask { task_id: 1, query_id: 10, table: "Object".into(), chunk: 1 },
        );
        sched.enqueue(
            LaneName::VeryHigh,
            ScanTask { task_id: 2, query_id: 11, table: "Object".into(), chunk: 2 },
        );

        let (lane, task) = sched.dispatch_next().unwrap();
        assert_eq!(lane, LaneName::VeryHigh);
        assert_eq!(task.task_id, 2);
    }

    #[test]
    fn respects_lane_capacity() {
        let sched = scheduler();
        sched.enqueue(LaneName::VeryHigh, ScanTask { task_id: 1, query_id: 1, table: "t".into(), chunk: 1 });
        sched.enqueue(LaneName::VeryHigh, ScanTask { task_id: 2, query_id: 2, table: "t".into(), chunk: 2 });

        assert!(sched.dispatch_next().is_some());
        // lane's single slot is taken; next dispatch should skip to nothing
        // since no other lane has queued work.
        assert!(sched.dispatch_next().is_none());

        sched.task_finished(LaneName::VeryHigh, 1);
        assert!(sched.dispatch_next().is_some());
    }

    #[test]
    fn queries_moved_to_snail_stay_there() {
        let sched = scheduler();
        sched.move_query_to_snail(99);
        sched.enqueue(
            LaneName::VeryHigh,
            ScanTask { task_id: 1, query_id: 99, table: "t".into(), chunk: 1 },
        );
        let (lane, _) = sched.dispatch_next().unwrap();
        assert_eq!(lane, LaneName::Snail);
    }

    #[test]
    fn remove_query_from_drops_queued_tasks_for_that_query_only() {
        let sched = scheduler();
        sched.enqueue(LaneName::Normal, ScanTask { task_id: 1, query_id: 1, table: "t".into(), chunk: 1 });
        sched.enqueue(LaneName::Normal, ScanTask { task_id: 2, query_id: 2, table: "t".into(), chunk: 2 });

        sched.remove_query_from(1, None);

        let (_, task) = sched.dispatch_next().unwrap();
        assert_eq!(task.query_id, 2);
        assert!(sched.dispatch_next().is_none());
    }

    #[test]
    fn remove_query_from_frees_capacity_held_by_a_running_task() {
        let sched = scheduler();
        sched.enqueue(LaneName::VeryHigh, ScanTask { task_id: 1, query_id: 1, table: "t".into(), chunk: 1 });
        let (lane, _) = sched.dispatch_next().unwrap();
        assert_eq!(lane, LaneName::VeryHigh);
        assert!(!sched.lanes.get(&LaneName::VeryHigh).unwrap().lock().has_room());

        sched.remove_query_from(1, None);

        assert!(sched.lanes.get(&LaneName::VeryHigh).unwrap().lock().has_room());
    }

    #[test]
    fn remove_query_from_can_target_a_single_lane() {
        let sched = scheduler();
        sched.enqueue(LaneName::Normal, ScanTask { task_id: 1, query_id: 1, table: "t".into(), chunk: 1 });
        sched.enqueue(LaneName::Snail, ScanTask { task_id: 2, query_id: 1, table: "t".into(), chunk: 2 });

        sched.remove_query_from(1, Some(LaneName::Normal));

        assert!(sched.queues.lock().get(&LaneName::Normal).unwrap().is_empty());
        assert_eq!(sched.queues.lock().get(&LaneName::Snail).unwrap().len(), 1);
    }
}
