use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

#[derive(Debug, PartialEq, Eq, Clone)]
struct TimerKey {
    execute_at: Instant,
    task_id: u64,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execute_at
            .cmp(&other.execute_at)
            .then(self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A deadline wheel polled by the endpoint. Entries are ordered by their
/// deadline; ties are broken by insertion order.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<TimerKey, T>>,
    id_to_tasks: RwLock<HashMap<u64, Instant>>,
    last_task_id: AtomicU64,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            id_to_tasks: RwLock::new(HashMap::new()),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.write().insert(
            TimerKey {
                execute_at,
                task_id,
            },
            value,
        );
        self.id_to_tasks.write().insert(task_id, execute_at);
        task_id
    }

    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let execute_at = self.id_to_tasks.write().remove(&task_id)?;
        self.tasks.write().remove(&TimerKey {
            execute_at,
            task_id,
        })
    }

    /// Removes and returns every entry due at or before `now`.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let due = {
            let mut tasks = self.tasks.write();
            let keys = tasks
                .range(
                    ..=TimerKey {
                        execute_at: now,
                        task_id: u64::MAX,
                    },
                )
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            keys.into_iter()
                .filter_map(|key| tasks.remove(&key).map(|value| (key.task_id, value)))
                .collect::<Vec<_>>()
        };
        if due.is_empty() {
            return Vec::new();
        }
        let mut id_to_tasks = self.id_to_tasks.write();
        due.into_iter()
            .map(|(task_id, value)| {
                id_to_tasks.remove(&task_id);
                value
            })
            .collect()
    }
}

#[test]
fn test_timer() {
    let timer = Timer::new();
    let now = Instant::now();
    let task_id = timer.timeout_at(now, "task1");
    assert_eq!(task_id, 1);
    assert_eq!(timer.cancel(task_id), Some("task1"));
    assert_eq!(timer.cancel(task_id), None);

    timer.timeout_at(now, "task2");
    timer.timeout_at(now, "task2b");
    let due = timer.poll(now + Duration::from_secs(1));
    assert_eq!(due, vec!["task2", "task2b"]);

    timer.timeout_at(now + Duration::from_millis(1001), "task3");
    assert!(timer.poll(now + Duration::from_secs(1)).is_empty());
    assert_eq!(timer.len(), 1);
}
