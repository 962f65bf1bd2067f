use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_utils::atomic::AtomicCell;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::value::CapturedError;

/// Target for deferred reactive work. Every reactive construct submits its
/// iterations through this trait, so an application can route them onto its
/// own thread pool.
pub trait Executor: Send + Sync {
    /// Submits a task for asynchronous execution.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// A cascade — a task submitting a task submitting a task — stops
/// inheriting its originating event past this depth, so a runaway chain
/// cannot monopolize the pool.
const MAX_DEPTH: u32 = 30;

/// Global monotonic task counter, shared by all pools; the second component
/// of the priority order.
static TASK_COUNTER: AtomicCell<u64> = AtomicCell::new(0);

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskContext>> = RefCell::new(None);
}

#[derive(Copy, Clone)]
struct TaskContext {
    pool: usize,
    event: u64,
    depth: u32,
}

/// Fixed-size worker pool that groups cascading tasks into events.
///
/// Every submission is tagged with `(event_id, task_id)` and the queue is a
/// priority queue over that pair. A task submitted from inside another task
/// of the same pool inherits the parent's event id, so a cascade started by
/// one external event completes together instead of interleaving with
/// whatever piled up behind it. Under overload several external
/// submissions share the next event id; that trades throughput for
/// per-event latency that does not depend on queue length.
pub struct EventExecutor {
    inner: Arc<PoolInner>,
}

impl Clone for EventExecutor {
    fn clone(&self) -> EventExecutor {
        EventExecutor {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    available: Condvar,
    event_counter: AtomicCell<u64>,
    shutdown: AtomicBool,
}

struct QueuedTask {
    event: u64,
    sequence: u64,
    depth: u32,
    job: Box<dyn FnOnce() + Send>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &QueuedTask) -> bool {
        self.event == other.event && self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &QueuedTask) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &QueuedTask) -> CmpOrdering {
        // BinaryHeap pops the maximum; reverse so the smallest
        // (event, sequence) runs first.
        (other.event, other.sequence).cmp(&(self.event, self.sequence))
    }
}

impl EventExecutor {
    /// Spawns a pool with the given number of worker threads.
    ///
    /// # Panics
    ///
    /// Panics when `threads` is zero.
    pub fn new(threads: usize) -> EventExecutor {
        assert!(threads > 0, "event executor needs at least one thread");
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            event_counter: AtomicCell::new(0),
            shutdown: AtomicBool::new(false),
        });
        for index in 0..threads {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("ripple-pool-{}", index))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn pool worker");
        }
        EventExecutor { inner }
    }

    /// Number of events started so far.
    pub fn event_count(&self) -> u64 {
        self.inner.event_counter.load()
    }

    /// Wakes the workers and lets them exit. Queued tasks that have not
    /// started are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.available.notify_all();
    }

    fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        let sequence = TASK_COUNTER.fetch_add(1);
        let pool = Arc::as_ptr(&self.inner) as usize;
        let (event, depth) = CURRENT_TASK.with(|current| match &*current.borrow() {
            Some(context) if context.pool == pool && context.depth < MAX_DEPTH => {
                (context.event, context.depth + 1)
            }
            _ => (self.inner.event_counter.load(), 0),
        });
        debug!(
            "submitting task {} into event {} at depth {}",
            sequence, event, depth
        );
        let mut queue = self.inner.queue.lock();
        queue.push(QueuedTask {
            event,
            sequence,
            depth,
            job,
        });
        self.inner.available.notify_one();
    }
}

impl Executor for EventExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.submit(task);
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(task) = queue.pop() {
                    break task;
                }
                inner.available.wait(&mut queue);
            }
        };
        // The first task of an event advances the counter, so external
        // submissions arriving from now on fall into the next event.
        let _ = inner
            .event_counter
            .compare_exchange(task.event, task.event + 1);
        let context = TaskContext {
            pool: Arc::as_ptr(&inner) as usize,
            event: task.event,
            depth: task.depth,
        };
        CURRENT_TASK.with(|current| *current.borrow_mut() = Some(context));
        let outcome = panic::catch_unwind(AssertUnwindSafe(task.job));
        CURRENT_TASK.with(|current| *current.borrow_mut() = None);
        if let Err(payload) = outcome {
            warn!(
                "executor task panicked: {}",
                CapturedError::from_panic(payload)
            );
        }
    }
}

/// The process-wide default executor: compute-sized, lazily initialized.
/// The thread count defaults to the core count and can be overridden with
/// the `RIPPLE_POOL_SIZE` environment variable.
pub fn common() -> &'static EventExecutor {
    static COMMON: OnceLock<EventExecutor> = OnceLock::new();
    COMMON.get_or_init(|| {
        let threads = std::env::var("RIPPLE_POOL_SIZE")
            .ok()
            .and_then(|size| size.parse().ok())
            .filter(|&size| size > 0)
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(|count| count.get())
                    .unwrap_or(1)
            });
        debug!("initializing common pool with {} threads", threads);
        EventExecutor::new(threads)
    })
}

pub(crate) fn common_executor() -> Arc<dyn Executor> {
    Arc::new(common().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_orders_by_event_then_sequence() {
        let mut heap = BinaryHeap::new();
        heap.push(QueuedTask {
            event: 1,
            sequence: 10,
            depth: 0,
            job: Box::new(|| {}),
        });
        heap.push(QueuedTask {
            event: 0,
            sequence: 11,
            depth: 0,
            job: Box::new(|| {}),
        });
        heap.push(QueuedTask {
            event: 0,
            sequence: 9,
            depth: 0,
            job: Box::new(|| {}),
        });
        let order: Vec<(u64, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|task| (task.event, task.sequence))
            .collect();
        assert_eq!(order, vec![(0, 9), (0, 11), (1, 10)]);
    }
}
