//! Single threaded timer facility.
use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{error, trace};

use crate::Result;

type Once = Box<dyn FnOnce() + Send>;
type Repeating = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
/// Handle to a scheduled task.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevent the task from running, or from running again if repeating.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum Job {
    Once(Once),
    Repeating(Duration, Repeating),
}

struct Task {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    job: Job,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    /// Reversed, so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Task>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs delayed and periodic tasks on one dedicated thread.
///
/// Cloning is cheap, every clone schedules on the same thread. Tasks should
/// be short, a slow task delays every task due after it.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();

        f.debug_struct("Scheduler")
            .field("pending", &state.heap.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            condvar: Condvar::new(),
        });

        let thread = thread::Builder::new().name("krpc-scheduler".to_string()).spawn({
            let shared = shared.clone();
            move || run(shared)
        })?;

        Ok(Scheduler {
            shared,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Instant::now() + delay, Job::Once(Box::new(task)))
    }

    /// Run `task` every `interval`, the first time after one `interval`.
    pub fn schedule_repeating<F>(&self, interval: Duration, task: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(
            Instant::now() + interval,
            Job::Repeating(interval, Arc::new(task)),
        )
    }

    fn push(&self, deadline: Instant, job: Job) -> TimerHandle {
        let handle = TimerHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        let mut state = self.shared.lock();

        if state.shutdown {
            handle.cancel();
            return handle;
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        state.heap.push(Task {
            deadline,
            seq,
            cancelled: handle.cancelled.clone(),
            job,
        });

        drop(state);
        self.shared.condvar.notify_one();

        handle
    }

    /// Number of tasks waiting, cancelled ones included.
    pub fn pending(&self) -> usize {
        self.shared.lock().heap.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Drop every pending task and stop the thread.
    ///
    /// Joins the thread unless called from a scheduled task.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.heap.clear();
        }
        self.shared.condvar.notify_all();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.lock();

    loop {
        if state.shutdown {
            trace!(context = "scheduler", "Scheduler thread stopped");
            return;
        }

        let now = Instant::now();

        let wait = match state.heap.peek() {
            None => None,
            Some(task) if task.deadline <= now => Some(Duration::ZERO),
            Some(task) => Some(task.deadline - now),
        };

        match wait {
            None => {
                state = shared
                    .condvar
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(wait) if !wait.is_zero() => {
                state = shared
                    .condvar
                    .wait_timeout(state, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Some(_) => {
                let Some(task) = state.heap.pop() else {
                    continue;
                };

                if task.cancelled.load(Ordering::Acquire) {
                    continue;
                }

                drop(state);
                let reschedule = execute(task);
                state = shared.lock();

                if let Some(task) = reschedule {
                    if !state.shutdown {
                        state.heap.push(task);
                    }
                }
            }
        }
    }
}

/// Run the task outside the lock, returning it if it should run again.
fn execute(task: Task) -> Option<Task> {
    let Task {
        seq,
        cancelled,
        job,
        ..
    } = task;

    match job {
        Job::Once(f) => {
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                error!(context = "scheduler", "Scheduled task panicked");
            }
            None
        }
        Job::Repeating(interval, f) => {
            if catch_unwind(AssertUnwindSafe(|| f())).is_err() {
                error!(context = "scheduler", "Repeating task panicked");
            }

            (!cancelled.load(Ordering::Acquire)).then(|| Task {
                deadline: Instant::now() + interval,
                seq,
                cancelled,
                job: Job::Repeating(interval, f),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn runs_in_deadline_order() {
        let scheduler = Scheduler::new().expect("scheduler");
        let (tx, rx) = flume::unbounded();

        for (delay, label) in [(60, 3), (20, 1), (40, 2)] {
            let tx = tx.clone();
            scheduler.schedule(Duration::from_millis(delay), move || {
                let _ = tx.send(label);
            });
        }

        let order: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("task ran"))
            .collect();
        assert_eq!(order, vec![1, 2, 3]);

        scheduler.shutdown();
    }

    #[test]
    fn cancelled_tasks_do_not_run() {
        let scheduler = Scheduler::new().expect("scheduler");
        let (tx, rx) = flume::unbounded::<()>();

        let handle = scheduler.schedule(Duration::from_millis(30), move || {
            let _ = tx.send(());
        });
        handle.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        scheduler.shutdown();
    }

    #[test]
    fn repeating_until_cancelled() {
        let scheduler = Scheduler::new().expect("scheduler");
        let count = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.schedule_repeating(Duration::from_millis(10), {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        thread::sleep(Duration::from_millis(200));
        handle.cancel();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "{seen}");

        thread::sleep(Duration::from_millis(50));
        assert!(count.load(Ordering::SeqCst) <= seen + 1);

        scheduler.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let scheduler = Scheduler::new().expect("scheduler");
        let (tx, rx) = flume::unbounded::<()>();

        scheduler.schedule(Duration::from_millis(50), move || {
            let _ = tx.send(());
        });
        scheduler.shutdown();

        assert!(scheduler.is_shutdown());
        assert_eq!(scheduler.pending(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        let late = scheduler.schedule(Duration::ZERO, || {});
        assert!(late.is_cancelled());
    }
}
