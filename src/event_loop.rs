use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A pending deferred invocation of a closure, either one-shot (timeout) or
/// recurring (interval). `callback` is a heap handle; the queue is a GC root.
#[derive(Debug, Clone, Copy)]
pub struct EventTask {
    pub callback: u32,
    pub execute_time: Instant,
    pub is_interval: bool,
    pub interval_id: u32,
    pub interval_ms: u64,
}

/// Shared timer state. Worker threads only sleep, enqueue, and notify; all
/// interpretation happens on the thread that owns the VM. Tasks run in
/// enqueue order, so equal-deadline timers stay FIFO.
#[derive(Debug, Default)]
pub struct TimerQueue {
    tasks: Mutex<VecDeque<EventTask>>,
    ready: Condvar,
    interval_ids: Mutex<HashSet<u32>>,
    next_interval_id: Mutex<u32>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: EventTask) {
        self.tasks.lock().unwrap().push_back(task);
        self.ready.notify_one();
    }

    pub fn pop(&self) -> Option<EventTask> {
        self.tasks.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Blocks until a task is queued or `timeout` elapses. The cap keeps the
    /// event loop responsive to intervals registered between waits.
    pub fn wait_for_ready(&self, timeout: Duration) {
        let guard = self.tasks.lock().unwrap();
        let _unused = self
            .ready
            .wait_timeout_while(guard, timeout, |tasks| tasks.is_empty());
    }

    /// Heap handles of every queued callback, for the collector's root scan.
    pub fn pending_callbacks(&self) -> Vec<u32> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|task| task.callback)
            .collect()
    }

    pub fn register_interval(&self) -> u32 {
        let mut next = self.next_interval_id.lock().unwrap();
        *next += 1;
        let id = *next;
        self.interval_ids.lock().unwrap().insert(id);
        id
    }

    pub fn interval_live(&self, id: u32) -> bool {
        self.interval_ids.lock().unwrap().contains(&id)
    }

    /// Best-effort cancellation: the id disappears now, the worker notices on
    /// its next wake-up, and an already-queued task may still run once.
    pub fn clear_interval(&self, id: u32) {
        self.interval_ids.lock().unwrap().remove(&id);
    }

    pub fn has_active_intervals(&self) -> bool {
        !self.interval_ids.lock().unwrap().is_empty()
    }
}

pub fn spawn_timeout(
    queue: Arc<TimerQueue>,
    callback: u32,
    ms: u64,
) -> JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(ms));
        queue.enqueue(EventTask {
            callback,
            execute_time: Instant::now(),
            is_interval: false,
            interval_id: 0,
            interval_ms: ms,
        });
    })
}

pub fn spawn_interval(
    queue: Arc<TimerQueue>,
    callback: u32,
    id: u32,
    ms: u64,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        thread::sleep(Duration::from_millis(ms));
        if !queue.interval_live(id) {
            break;
        }
        queue.enqueue(EventTask {
            callback,
            execute_time: Instant::now(),
            is_interval: true,
            interval_id: id,
            interval_ms: ms,
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(callback: u32) -> EventTask {
        EventTask {
            callback,
            execute_time: Instant::now(),
            is_interval: false,
            interval_id: 0,
            interval_ms: 0,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = TimerQueue::new();
        queue.enqueue(task(1));
        queue.enqueue(task(2));
        queue.enqueue(task(3));
        assert_eq!(queue.pop().unwrap().callback, 1);
        assert_eq!(queue.pop().unwrap().callback, 2);
        assert_eq!(queue.pop().unwrap().callback, 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_interval_registration_and_cancel() {
        let queue = TimerQueue::new();
        let a = queue.register_interval();
        let b = queue.register_interval();
        assert_ne!(a, b);
        assert!(queue.interval_live(a));
        assert!(queue.has_active_intervals());
        queue.clear_interval(a);
        assert!(!queue.interval_live(a));
        queue.clear_interval(b);
        assert!(!queue.has_active_intervals());
    }

    #[test]
    fn test_timeout_worker_enqueues() {
        let queue = Arc::new(TimerQueue::new());
        let worker = spawn_timeout(queue.clone(), 7, 5);
        queue.wait_for_ready(Duration::from_secs(2));
        let task = queue.pop().expect("task enqueued after sleep");
        assert_eq!(task.callback, 7);
        assert!(!task.is_interval);
        worker.join().unwrap();
    }

    #[test]
    fn test_cancelled_interval_worker_exits() {
        let queue = Arc::new(TimerQueue::new());
        let id = queue.register_interval();
        let worker = spawn_interval(queue.clone(), 9, id, 5);
        queue.wait_for_ready(Duration::from_secs(2));
        queue.clear_interval(id);
        // The worker observes the cancelled id on its next wake-up.
        worker.join().unwrap();
        assert!(!queue.has_active_intervals());
    }

    #[test]
    fn test_pending_callbacks_are_visible_to_gc() {
        let queue = TimerQueue::new();
        queue.enqueue(task(11));
        queue.enqueue(task(12));
        assert_eq!(queue.pending_callbacks(), vec![11, 12]);
    }
}
