#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Single-stepped executor for deterministic tests: tasks queue up until
/// the test pumps them with `run_all`.
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
}

impl ManualExecutor {
    pub fn new() -> Arc<ManualExecutor> {
        Arc::new(ManualExecutor {
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Runs queued tasks, including ones they submit, until the queue is
    /// empty. Returns how many tasks ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.queue.lock().unwrap().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl ripple::Executor for ManualExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.queue.lock().unwrap().push_back(task);
    }
}

/// Polls until the condition holds, panicking after a generous deadline.
pub fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        if Instant::now() > deadline {
            panic!("condition not reached within deadline");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}
