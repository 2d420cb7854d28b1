use std::{
    panic::{ catch_unwind, AssertUnwindSafe },
    sync::{ atomic::{ fence, AtomicBool, Ordering }, Arc, Condvar, Mutex, PoisonError, Weak },
};

use crossbeam_queue::SegQueue;
use crossbeam_utils::{ Backoff, CachePadded };

use crate::error::Closed;

/// A trait representing task.
pub trait Task: Send + 'static {
    /// Run the task on the thread pumping the run loop.
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send + 'static> Task for F {
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// Tasks submitted together with [`Scheduler::schedule_multiple`]. Queued as
/// one entry so nothing can be interleaved between them.
struct Batch(Vec<Box<dyn Task>>);

impl Task for Batch {
    fn run(self: Box<Self>) {
        for task in self.0 {
            run_guarded(task);
        }
    }
}

fn run_guarded(task: Box<dyn Task>) {
    if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
        log::error!("Task panicked; run loop keeps going");
    }
}

/// A single-threaded task queue an executor thread can drive.
///
/// Executors only need two things from it: a blocking [`Pump::run`] that
/// returns once [`Pump::finish`] has been called, and a submission handle
/// other threads can clone freely.
pub trait Pump: Send + Sync + 'static {
    type Scheduler: Clone + Send + Sync + 'static;

    /// Execute queued tasks on the calling thread until finished.
    fn run(&self);

    /// Ask [`Pump::run`] to return. Must be idempotent.
    fn finish(&self);

    fn scheduler(&self) -> Self::Scheduler;
}

struct Shared {
    queue: CachePadded<SegQueue<Box<dyn Task>>>,
    finishing: AtomicBool,
    /// Set while the pump thread is about to block on `wakeup`.
    sleeping: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl Shared {
    fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::SeqCst)
    }

    fn notify(&self) {
        fence(Ordering::SeqCst);
        if self.sleeping.load(Ordering::SeqCst) {
            // Taking the lock orders us after the sleeper's final emptiness check.
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.wakeup.notify_one();
        }
    }

    fn sleep(&self) {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.sleeping.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if !self.queue.is_empty() || self.is_finishing() {
            self.sleeping.store(false, Ordering::SeqCst);
            return;
        }

        // Spurious wakeups just cost another pump iteration.
        let _guard = self.wakeup.wait(guard).unwrap_or_else(PoisonError::into_inner);
        self.sleeping.store(false, Ordering::SeqCst);
    }
}

/// FIFO run loop: tasks are executed one at a time, in the order they were
/// enqueued, on whichever thread calls [`RunLoop::run`].
///
/// After [`RunLoop::finish`] the loop refuses new tasks, drains the ones it
/// already holds and then returns from `run`.
pub struct RunLoop {
    shared: Arc<Shared>,
}

impl RunLoop {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: CachePadded::new(SegQueue::new()),
                finishing: AtomicBool::new(false),
                sleeping: AtomicBool::new(false),
                lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
        }
    }

    pub fn run(&self) {
        let shared = &*self.shared;
        let backoff = Backoff::new();
        log::trace!("Run loop started");
        loop {
            if let Some(task) = shared.queue.pop() {
                backoff.reset();
                run_guarded(task);
                continue;
            }

            if shared.is_finishing() {
                break;
            }

            if backoff.is_completed() {
                shared.sleep();
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        log::trace!("Run loop finished");
    }

    pub fn finish(&self) {
        if !self.shared.finishing.swap(true, Ordering::SeqCst) {
            log::trace!("Run loop asked to finish");
        }
        // Unconditional: the pump may be between its last check and the wait.
        let _guard = self.shared.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.wakeup.notify_all();
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Pump for RunLoop {
    type Scheduler = Scheduler;

    fn run(&self) {
        RunLoop::run(self)
    }

    fn finish(&self) {
        RunLoop::finish(self)
    }

    fn scheduler(&self) -> Scheduler {
        RunLoop::scheduler(self)
    }
}

/// Handle for submitting tasks to a [`RunLoop`] from any thread.
///
/// Cloning is cheap and all clones feed the same queue. The handle does not
/// keep the loop alive: once the owner has finished it, every submission
/// fails with [`Closed`].
#[derive(Clone)]
pub struct Scheduler {
    shared: Weak<Shared>,
}

impl Scheduler {
    /// Schedule a closure onto the run loop.
    pub fn schedule<F>(&self, task: F) -> Result<(), Closed>
        where F: FnOnce() + Send + 'static
    {
        self.schedule_boxed(Box::new(task))
    }

    /// Schedule a job onto the run loop.
    ///
    /// A task racing with [`RunLoop::finish`] can be accepted and still be
    /// dropped unrun if the loop exits first.
    pub fn schedule_boxed(&self, task: Box<dyn Task>) -> Result<(), Closed> {
        let shared = self.open()?;
        shared.queue.push(task);
        shared.notify();
        Ok(())
    }

    /// Schedule multiple jobs onto the run loop.
    ///
    /// They run back to back in the given order; tasks from other submitters
    /// are never interleaved between them.
    pub fn schedule_multiple(&self, tasks: Vec<Box<dyn Task>>) -> Result<(), Closed> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.schedule_boxed(Box::new(Batch(tasks)))
    }

    pub fn is_closed(&self) -> bool {
        self.open().is_err()
    }

    fn open(&self) -> Result<Arc<Shared>, Closed> {
        match self.shared.upgrade() {
            Some(shared) if !shared.is_finishing() => Ok(shared),
            _ => Err(Closed),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("closed", &self.is_closed()).finish()
    }
}
