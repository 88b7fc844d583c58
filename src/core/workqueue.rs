//! Background task queue
//!
//! Late unloads run on a shared queue, decoupled from the thread that
//! triggered them. [`WorkQueue`] runs tasks on a pool of worker threads fed
//! by a crossbeam channel; [`ManualQueue`] holds tasks until the embedder
//! runs them.

use crate::core::error::{HiveError, Result};
use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Fire-and-forget unit of background work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskQueue: Send + Sync {
    /// Queue `task` to run later on some worker. On failure the task is
    /// dropped without running.
    fn schedule(&self, task: Task) -> Result<()>;

    /// Wait until every task scheduled so far has finished
    fn drain(&self) {}
}

/// Count of queued-or-running tasks with a wakeup for drainers
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Worker pool fed by a channel
pub struct WorkQueue {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<InFlight>,
}

impl WorkQueue {
    pub fn new(threads: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Task>();
        let in_flight = Arc::new(InFlight::default());

        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let in_flight = Arc::clone(&in_flight);
            let worker = thread::Builder::new()
                .name(format!("hive-worker-{}", index))
                .spawn(move || {
                    for task in receiver.iter() {
                        task();
                        in_flight.end();
                    }
                })?;
            workers.push(worker);
        }
        debug!(threads = workers.len(), "work queue started");

        Ok(WorkQueue {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            in_flight,
        })
    }

    /// Stop accepting tasks, finish the queued ones and join the workers
    pub fn stop(&self) {
        self.sender.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            // the last owner may be dropping us from a worker thread
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("work queue worker panicked");
            }
        }
    }
}

impl TaskQueue for WorkQueue {
    fn schedule(&self, task: Task) -> Result<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(HiveError::QueueUnavailable("work queue stopped".into()));
        };
        self.in_flight.begin();
        if sender.send(task).is_err() {
            self.in_flight.end();
            return Err(HiveError::QueueUnavailable("work queue disconnected".into()));
        }
        Ok(())
    }

    fn drain(&self) {
        self.in_flight.wait_idle();
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Queue whose tasks run only when [`ManualQueue::run_pending`] is called
#[derive(Default)]
pub struct ManualQueue {
    tasks: Mutex<VecDeque<Task>>,
    unavailable: AtomicBool,
}

impl ManualQueue {
    pub fn new() -> Self {
        ManualQueue::default()
    }

    /// Make `schedule` fail (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    /// Run every queued task, including ones queued while running.
    /// Returns the number run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.tasks.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl TaskQueue for ManualQueue {
    fn schedule(&self, task: Task) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(HiveError::QueueUnavailable("manual queue disabled".into()));
        }
        self.tasks.lock().push_back(task);
        Ok(())
    }

    fn drain(&self) {
        self.run_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_work_queue_runs_tasks() {
        let queue = WorkQueue::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            queue
                .schedule(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        queue.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_work_queue_rejects_after_stop() {
        let queue = WorkQueue::new(1).unwrap();
        queue.stop();
        let result = queue.schedule(Box::new(|| {}));
        assert!(matches!(result, Err(HiveError::QueueUnavailable(_))));
    }

    #[test]
    fn test_manual_queue_holds_until_run() {
        let queue = ManualQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        queue
            .schedule(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert_eq!(queue.pending(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_queue_unavailable_drops_task() {
        let queue = ManualQueue::new();
        queue.set_available(false);
        let marker = Arc::new(());
        let held = Arc::clone(&marker);

        let result = queue.schedule(Box::new(move || drop(held)));
        assert!(result.is_err());
        // rejected task was dropped, releasing its capture
        assert_eq!(Arc::strong_count(&marker), 1);
        assert_eq!(queue.pending(), 0);
    }
}
