//! Fixed-size worker pool with one shared FIFO task queue.
//!
//! Workers pop with the lock held only around the dequeue and run tasks
//! unlocked. Shutdown sets a closing flag and wakes everyone; tasks queued
//! before shutdown are drained before any worker exits.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: VecDeque<Task>,
    closing: bool,
}

struct Inner {
    state: Mutex<State>,
    available: Condvar,
}

pub struct WorkerPool {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers. Must be at least one.
    pub fn new(threads: usize) -> std::io::Result<Self> {
        assert!(threads > 0, "worker pool needs at least one thread");

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                closing: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker_loop(&inner))?;
            workers.push(handle);
        }

        debug!(threads, "Worker pool started");
        Ok(Self { inner, workers })
    }

    /// Enqueue a task and wake one idle worker.
    ///
    /// Tasks submitted after shutdown began are dropped.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing {
                return;
            }
            state.queue.push_back(Box::new(task));
        }
        self.inner.available.notify_one();
    }

    /// Drain the queue and join all workers.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing {
                return;
            }
            state.closing = true;
        }
        self.inner.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &Inner) {
    let mut state = inner.state.lock().unwrap();
    loop {
        if let Some(task) = state.queue.pop_front() {
            drop(state);
            task();
            state = inner.state.lock().unwrap();
        } else if state.closing {
            break;
        } else {
            state = inner.available.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_every_task_runs_exactly_once() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool); // joins workers, draining the queue
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_shutdown_drains_pending_tasks() {
        let mut pool = WorkerPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        // A slow task at the head keeps the rest queued when shutdown starts.
        {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(50));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn test_no_task_runs_after_stop() {
        let mut pool = WorkerPool::new(2).unwrap();
        pool.shutdown();

        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tasks_run_concurrently() {
        let pool = WorkerPool::new(4).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        drop(pool);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }
}
