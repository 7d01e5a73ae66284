//! Priority-driven task dispatcher.
//!
//! A dedicated worker thread pops jobs off a min-heap keyed by
//! `(priority, ready time, insertion order)` and runs them to completion.
//! Two dispatchers exist in a running store: one for I/O-bound work
//! (flusher, background fetches, vbucket persistence and deletion) and one
//! for in-memory housekeeping, so blocking I/O cannot starve the latter.

use parking_lot::{Condvar, Mutex};
use std::collections::{BinaryHeap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Urgency classes, most urgent first. The periodic pagers share one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Flusher,
    VBucketPersist,
    VKeyStatBgFetcher,
    BgFetcher,
    NotifyVbStateChange,
    VBucketDeletion,
    ItemPager,
    ExpiryPager,
    CheckpointRemover,
}

impl Priority {
    pub fn level(&self) -> u8 {
        match self {
            Priority::Flusher => 0,
            Priority::VBucketPersist => 1,
            Priority::VKeyStatBgFetcher => 2,
            Priority::BgFetcher => 3,
            Priority::NotifyVbStateChange => 4,
            Priority::VBucketDeletion => 5,
            Priority::ItemPager | Priority::ExpiryPager | Priority::CheckpointRemover => 6,
        }
    }
}

/// What a job wants the dispatcher to do once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Finished; drop the task.
    Done,
    /// Run again after the given delay.
    Reschedule(Duration),
}

/// A schedulable unit of work.
pub trait Job: Send + 'static {
    fn run(&mut self) -> JobOutcome;
    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Handle for cancelling a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct Entry {
    level: u8,
    ready: Instant,
    seq: u64,
    id: u64,
    daemon: bool,
    job: Box<dyn Job>,
}

impl Entry {
    fn key(&self) -> (u8, Instant, u64) {
        (self.level, self.ready, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the std max-heap pops the smallest key first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

struct State {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<u64>,
    phase: Phase,
    next_seq: u64,
    next_id: u64,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

pub struct Dispatcher {
    name: &'static str,
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    cancelled: HashSet::new(),
                    phase: Phase::Idle,
                    next_seq: 0,
                    next_id: 1,
                }),
                cond: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue a job. Daemon tasks may be dropped at shutdown; non-daemon
    /// tasks scheduled before `stop` are guaranteed one run.
    pub fn schedule<J: Job>(&self, job: J, priority: Priority, delay: Duration, daemon: bool) -> TaskId {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        if state.phase == Phase::Stopped || state.phase == Phase::ShuttingDown {
            debug!(
                dispatcher = self.name,
                task = %job.describe(),
                "dropping task scheduled after shutdown"
            );
            return TaskId(id);
        }
        state.heap.push(Entry {
            level: priority.level(),
            ready: Instant::now() + delay,
            seq,
            id,
            daemon,
            job: Box::new(job),
        });
        self.inner.cond.notify_one();
        TaskId(id)
    }

    /// Mark a task cancelled; it will be discarded instead of run.
    pub fn cancel(&self, task: TaskId) {
        let mut state = self.inner.state.lock();
        if state.heap.iter().any(|e| e.id == task.0) {
            state.cancelled.insert(task.0);
        }
    }

    /// Launch the worker thread.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Idle {
            return;
        }
        state.phase = Phase::Running;
        drop(state);

        let inner = Arc::clone(&self.inner);
        let name = self.name;
        let handle = std::thread::Builder::new()
            .name(format!("dispatcher-{name}"))
            .spawn(move || worker_loop(name, inner))
            .expect("failed to spawn dispatcher worker");
        *self.worker.lock() = Some(handle);
    }

    /// Request shutdown and wait for the worker to exit. Queued non-daemon
    /// tasks run once (ignoring their delays) before this returns.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Running => {
                    state.phase = Phase::ShuttingDown;
                    self.inner.cond.notify_all();
                }
                Phase::Idle => {
                    state.phase = Phase::Stopped;
                    return;
                }
                Phase::ShuttingDown | Phase::Stopped => {}
            }
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(dispatcher = self.name, "dispatcher worker panicked");
            }
        }
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        self.inner.state.lock().heap.len()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // A worker left running would never see its Inner dropped.
        if self.worker.lock().is_some() {
            self.stop();
        }
    }
}

fn run_entry(name: &str, entry: &mut Entry) -> JobOutcome {
    match catch_unwind(AssertUnwindSafe(|| entry.job.run())) {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(
                dispatcher = name,
                task = %entry.job.describe(),
                "task panicked; not rescheduling"
            );
            JobOutcome::Done
        }
    }
}

fn worker_loop(name: &'static str, inner: Arc<Inner>) {
    let mut state = inner.state.lock();
    loop {
        match state.phase {
            Phase::Running => {
                // Discard cancelled tasks sitting on top.
                while let Some(top) = state.heap.peek() {
                    if state.cancelled.contains(&top.id) {
                        let entry = state.heap.pop().unwrap();
                        state.cancelled.remove(&entry.id);
                    } else {
                        break;
                    }
                }
                let Some(top) = state.heap.peek() else {
                    inner.cond.wait(&mut state);
                    continue;
                };
                let now = Instant::now();
                if top.ready > now {
                    let deadline = top.ready;
                    inner.cond.wait_until(&mut state, deadline);
                    continue;
                }
                let mut entry = state.heap.pop().unwrap();
                drop(state);
                let outcome = run_entry(name, &mut entry);
                state = inner.state.lock();
                if let JobOutcome::Reschedule(delay) = outcome {
                    if state.phase == Phase::Running {
                        entry.ready = Instant::now() + delay;
                        entry.seq = state.next_seq;
                        state.next_seq += 1;
                        state.heap.push(entry);
                    } else if !entry.daemon {
                        // Shutdown raced with this run; hand the task to the
                        // drain so it still runs to completion.
                        entry.ready = Instant::now();
                        state.heap.push(entry);
                    }
                }
            }
            Phase::ShuttingDown => {
                // Snapshot: everything queued at this point gets its run;
                // anything scheduled afterwards is dropped.
                let mut drained = std::mem::take(&mut state.heap);
                while let Some(mut entry) = drained.pop() {
                    if state.cancelled.remove(&entry.id) || entry.daemon {
                        continue;
                    }
                    drop(state);
                    let outcome = run_entry(name, &mut entry);
                    state = inner.state.lock();
                    if outcome != JobOutcome::Done {
                        // Run non-daemon tasks until they retire.
                        entry.ready = Instant::now();
                        drained.push(entry);
                    }
                }
                if !state.heap.is_empty() {
                    debug!(
                        dispatcher = name,
                        dropped = state.heap.len(),
                        "discarding tasks scheduled during shutdown"
                    );
                    state.heap.clear();
                }
                state.phase = Phase::Stopped;
                inner.cond.notify_all();
                return;
            }
            Phase::Idle | Phase::Stopped => {
                warn!(dispatcher = name, "worker running in unexpected phase");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FnJob<F: FnMut() -> JobOutcome + Send + 'static> {
        f: F,
        label: &'static str,
    }

    impl<F: FnMut() -> JobOutcome + Send + 'static> Job for FnJob<F> {
        fn run(&mut self) -> JobOutcome {
            (self.f)()
        }

        fn describe(&self) -> String {
            self.label.to_string()
        }
    }

    fn job<F: FnMut() -> JobOutcome + Send + 'static>(f: F) -> FnJob<F> {
        FnJob { f, label: "test" }
    }

    fn wait_until(pred: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    #[test]
    fn test_priority_order() {
        let d = Dispatcher::new("test-prio");
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, priority) in [
            ("bg", Priority::BgFetcher),
            ("flush", Priority::Flusher),
            ("vbdel", Priority::VBucketDeletion),
        ] {
            let order = Arc::clone(&order);
            d.schedule(
                job(move || {
                    order.lock().push(label);
                    JobOutcome::Done
                }),
                priority,
                Duration::ZERO,
                false,
            );
        }
        d.start();
        assert!(wait_until(|| order.lock().len() == 3, Duration::from_secs(5)));
        assert_eq!(*order.lock(), vec!["flush", "bg", "vbdel"]);
        d.stop();
    }

    #[test]
    fn test_stop_runs_pending_non_daemon_immediately() {
        let d = Dispatcher::new("test-stop");
        d.start();
        let ran = Arc::new(AtomicUsize::new(0));
        let daemon_ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            d.schedule(
                job(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Done
                }),
                Priority::BgFetcher,
                Duration::from_secs(3),
                false,
            );
        }
        {
            let daemon_ran = Arc::clone(&daemon_ran);
            d.schedule(
                job(move || {
                    daemon_ran.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Done
                }),
                Priority::BgFetcher,
                Duration::from_secs(3),
                true,
            );
        }
        let started = Instant::now();
        d.stop();
        // The 3s delay is ignored at shutdown: the non-daemon task has run
        // exactly once by the time stop returns, the daemon one never.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(daemon_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delayed_execution() {
        let d = Dispatcher::new("test-delay");
        d.start();
        let ran = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();
        {
            let ran = Arc::clone(&ran);
            d.schedule(
                job(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Done
                }),
                Priority::BgFetcher,
                Duration::from_millis(200),
                false,
            );
        }
        assert!(wait_until(
            || ran.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));
        assert!(started.elapsed() >= Duration::from_millis(200));
        d.stop();
    }

    #[test]
    fn test_reschedule_until_done() {
        let d = Dispatcher::new("test-resched");
        d.start();
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = Arc::clone(&runs);
            d.schedule(
                job(move || {
                    if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                        JobOutcome::Reschedule(Duration::ZERO)
                    } else {
                        JobOutcome::Done
                    }
                }),
                Priority::Flusher,
                Duration::ZERO,
                false,
            );
        }
        assert!(wait_until(
            || runs.load(Ordering::SeqCst) == 3,
            Duration::from_secs(5)
        ));
        d.stop();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancelled_task_never_runs() {
        let d = Dispatcher::new("test-cancel");
        d.start();
        let ran = Arc::new(AtomicUsize::new(0));
        let id = {
            let ran = Arc::clone(&ran);
            d.schedule(
                job(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Done
                }),
                Priority::BgFetcher,
                Duration::from_millis(300),
                false,
            )
        };
        d.cancel(id);
        assert!(wait_until(|| d.queued_len() == 0, Duration::from_secs(5)));
        d.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let d = Dispatcher::new("test-panic");
        d.start();
        d.schedule(
            job(|| panic!("boom")),
            Priority::Flusher,
            Duration::ZERO,
            false,
        );
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            d.schedule(
                job(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Done
                }),
                Priority::BgFetcher,
                Duration::ZERO,
                false,
            );
        }
        assert!(wait_until(
            || ran.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));
        d.stop();
    }
}
