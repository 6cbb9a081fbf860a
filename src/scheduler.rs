//! Deadline scheduler for deferred cleanup.
//!
//! `QueueRunner<K>` keeps `(deadline, key)` pairs in a min-heap and drains
//! keys whose deadline has passed. Re-enqueueing a key replaces its tracked
//! deadline; superseded heap entries are skipped on pop, and drain callbacks
//! re-check expirability anyway, so stale fires are harmless.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};

struct Entry<K> {
    deadline: Instant,
    seq: u64,
    key: K,
}

// Ordered by deadline only (earliest first out of the BinaryHeap via
// reversed comparison); seq breaks ties so ordering stays total.
impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<K> {
    heap: BinaryHeap<Entry<K>>,
    /// Current deadline per key; heap entries that disagree are stale.
    deadlines: AHashMap<K, Instant>,
    next_seq: u64,
    shutdown: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    wakeup: Condvar,
}

/// Deadline-ordered queue drained by a dedicated thread.
pub struct QueueRunner<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for QueueRunner<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for QueueRunner<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> QueueRunner<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    deadlines: AHashMap::new(),
                    next_seq: 0,
                    shutdown: false,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Register a key to be drained no earlier than `deadline`. A second
    /// registration for the same key replaces the first.
    pub fn enqueue(&self, deadline: Instant, key: K) {
        let mut state = self.inner.state.lock();
        state.deadlines.insert(key.clone(), deadline);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry { deadline, seq, key });
        self.inner.wakeup.notify_all();
    }

    /// Number of distinct keys currently scheduled.
    pub fn len(&self) -> usize {
        self.inner.state.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop one due key without blocking. Test seam for driving the queue
    /// with an explicit clock.
    #[cfg(test)]
    fn poll(&self, now: Instant) -> Option<K> {
        let mut state = self.inner.state.lock();
        while let Some(entry) = state.heap.peek() {
            let stale = state.deadlines.get(&entry.key) != Some(&entry.deadline);
            if stale {
                state.heap.pop();
                continue;
            }
            if entry.deadline > now {
                return None;
            }
            let entry = state.heap.pop().expect("peeked entry");
            state.deadlines.remove(&entry.key);
            return Some(entry.key);
        }
        None
    }

    /// Long-running drain loop. Sleeps until the next deadline, pops due
    /// keys, and invokes `drain` serially with the queue unlocked, so the
    /// callback may re-enqueue. Returns once `shutdown` is called, after any
    /// in-flight drain completes.
    pub fn run(&self, mut drain: impl FnMut(K)) {
        loop {
            let key = {
                let mut state = self.inner.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    // (deadline, stale) of the heap head, if any. The head
                    // is stale when its key was re-enqueued since.
                    let head = state.heap.peek().map(|entry| {
                        let stale = state.deadlines.get(&entry.key) != Some(&entry.deadline);
                        (entry.deadline, stale)
                    });
                    match head {
                        None => {
                            self.inner.wakeup.wait(&mut state);
                        }
                        Some((_, true)) => {
                            state.heap.pop();
                        }
                        Some((deadline, false)) if deadline <= Instant::now() => {
                            let entry = state.heap.pop().expect("peeked entry");
                            state.deadlines.remove(&entry.key);
                            break entry.key;
                        }
                        Some((deadline, false)) => {
                            self.inner.wakeup.wait_until(&mut state, deadline);
                        }
                    }
                }
            };
            drain(key);
        }
    }

    /// Spawn the drain loop on a named thread.
    pub fn spawn(&self, name: &str, drain: impl FnMut(K) + Send + 'static) -> JoinHandle<()> {
        let runner = self.clone();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runner.run(drain))
            .expect("failed to spawn scheduler thread")
    }

    /// Stop the drain loop. Idempotent.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.wakeup.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain_now<K: Eq + Hash + Clone + Send + 'static>(runner: &QueueRunner<K>) -> Vec<K> {
        let mut out = Vec::new();
        while let Some(key) = runner.poll(Instant::now()) {
            out.push(key);
        }
        out
    }

    #[test]
    fn test_due_keys_drain_in_deadline_order() {
        let runner = QueueRunner::new();
        let now = Instant::now();
        runner.enqueue(now, "b");
        runner.enqueue(now - Duration::from_secs(1), "a");
        runner.enqueue(now + Duration::from_secs(60), "far");

        assert_eq!(drain_now(&runner), vec!["a", "b"]);
        assert_eq!(runner.len(), 1);
    }

    #[test]
    fn test_enqueue_coalesces_by_key() {
        let runner = QueueRunner::new();
        let now = Instant::now();
        runner.enqueue(now, "k");
        runner.enqueue(now + Duration::from_secs(60), "k");

        // The earlier registration was superseded; nothing is due.
        assert!(drain_now(&runner).is_empty());
        assert_eq!(runner.len(), 1);
    }

    #[test]
    fn test_coalesce_to_earlier_deadline() {
        let runner = QueueRunner::new();
        let now = Instant::now();
        runner.enqueue(now + Duration::from_secs(60), "k");
        runner.enqueue(now, "k");

        assert_eq!(drain_now(&runner), vec!["k"]);
        assert!(runner.is_empty());
    }

    #[test]
    fn test_run_drains_and_honors_reentrant_enqueue() {
        let runner: QueueRunner<u32> = QueueRunner::new();
        let now = Instant::now();
        runner.enqueue(now, 1);

        let drained = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let drained = Arc::clone(&drained);
            let reenqueue = runner.clone();
            runner.spawn("test-runner", move |key| {
                drained.lock().push(key);
                if key == 1 {
                    reenqueue.enqueue(Instant::now(), 2);
                }
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while drained.lock().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        runner.shutdown();
        handle.join().unwrap();

        assert_eq!(*drained.lock(), vec![1, 2]);
    }

    #[test]
    fn test_shutdown_wakes_idle_runner() {
        let runner: QueueRunner<u32> = QueueRunner::new();
        let handle = runner.spawn("idle-runner", |_| {});
        runner.shutdown();
        handle.join().unwrap();
    }
}
