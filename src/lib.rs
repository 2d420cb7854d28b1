//! Dedicated single-threaded executors, optionally pinned to a CPU core.
//!
//! A [`PinnedExecutor`] owns one OS thread. Before that thread starts
//! executing anything it binds itself to the requested core (and NUMA node,
//! with the `numa` feature on Linux), then pumps a [`RunLoop`] until the
//! executor is dropped. Other threads submit work through a [`Scheduler`]:
//!
//! ```no_run
//! let executor = pinloop::PinnedExecutor::new(0).unwrap();
//! let scheduler = executor.scheduler();
//! scheduler.schedule(|| println!("hello from core 0")).unwrap();
//! ```
//!
//! [`UnpinnedExecutor`] is the same thing without the affinity step.

use std::{
    sync::{ Arc, Condvar, Mutex, PoisonError },
    thread::{ self, JoinHandle, ThreadId },
};

mod error;
mod run_loop;
mod sys;

pub use error::{ AffinityError, Closed, Error };
pub use run_loop::{ Pump, RunLoop, Scheduler, Task };
pub use sys::{ apply_affinity, Affinity, NUMA_SUPPORTED };

/// The thread half shared by both executor flavours.
struct Worker<Q: Pump> {
    queue: Arc<Q>,
    id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl<Q: Pump> Worker<Q> {
    fn spawn<F>(name: String, queue: Q, before_pump: F) -> Result<Self, Error>
        where F: FnOnce() + Send + 'static
    {
        let queue = Arc::new(queue);
        let pumped = queue.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                before_pump();
                pumped.run();
            })?;
        let id = handle.thread().id();
        log::trace!("Spawned executor thread {:?}", id);
        Ok(Self { queue, id, handle: Some(handle) })
    }
}

impl<Q: Pump> Drop for Worker<Q> {
    fn drop(&mut self) {
        self.queue.finish();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if thread::current().id() == self.id {
            // Joining ourselves would deadlock; the thread exits on its own
            // once the current task returns.
            log::error!("Executor dropped from its own thread; detaching instead of joining");
            return;
        }
        if handle.join().is_err() {
            log::error!("Executor thread {:?} panicked", self.id);
        }
        log::trace!("Executor thread {:?} joined", self.id);
    }
}

/// Result of the affinity step, published once by the pinned thread.
struct PinState {
    outcome: Mutex<Option<Result<(), AffinityError>>>,
    ready: Condvar,
}

impl PinState {
    fn publish(&self, outcome: Result<(), AffinityError>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<(), AffinityError> {
        let guard = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = self.ready
            .wait_while(guard, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone().unwrap_or(Ok(()))
    }
}

/// A single-threaded executor whose thread is bound to one CPU core.
///
/// The executor is the sole owner of its thread and queue: it is not `Clone`,
/// and dropping it finishes the queue (already queued tasks still run) and
/// joins the thread. Use [`PinnedExecutor::scheduler`] to hand out submission
/// rights.
///
/// Pinning is best-effort. A failed pin is logged and the thread carries on
/// unpinned; callers that need to know can check
/// [`PinnedExecutor::affinity_outcome`].
pub struct PinnedExecutor<Q: Pump = RunLoop> {
    affinity: Affinity,
    pin: Arc<PinState>,
    worker: Worker<Q>,
}

impl PinnedExecutor {
    /// Spawn an executor pinned to `core_id`, NUMA node `0`.
    pub fn new(core_id: usize) -> Result<Self, Error> {
        Self::on_node(core_id, 0)
    }

    /// Spawn an executor pinned to `core_id` that prefers memory from
    /// `numa_id`.
    ///
    /// Returns as soon as the thread is launched; the pin is applied on the
    /// new thread before its first task runs.
    pub fn on_node(core_id: usize, numa_id: u32) -> Result<Self, Error> {
        Self::with_queue(RunLoop::new(), core_id, numa_id)
    }
}

impl<Q: Pump> PinnedExecutor<Q> {
    /// Like [`PinnedExecutor::on_node`], pumping a caller-supplied queue.
    pub fn with_queue(queue: Q, core_id: usize, numa_id: u32) -> Result<Self, Error> {
        let affinity = Affinity::new(core_id, numa_id);
        let pin = Arc::new(PinState {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        });

        let published = pin.clone();
        let worker = Worker::spawn(format!("pinloop-core-{}", core_id), queue, move || {
            let outcome = affinity.apply();
            match &outcome {
                Ok(()) => log::debug!("Pinned to {:?}", affinity),
                Err(err) => log::warn!("Running unpinned: {}", err),
            }
            published.publish(outcome);
        })?;

        Ok(Self { affinity, pin, worker })
    }

    /// A handle for submitting work to this executor. All handles alias the
    /// same queue.
    pub fn scheduler(&self) -> Q::Scheduler {
        self.worker.queue.scheduler()
    }

    pub fn core_id(&self) -> usize {
        self.affinity.core_id()
    }

    /// NUMA node requested at construction, or `0` when this build has no
    /// NUMA support (see [`NUMA_SUPPORTED`]).
    pub fn numa_id(&self) -> u32 {
        self.affinity.numa_id()
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Identity of the owned thread; fixed for the executor's lifetime.
    pub fn thread_id(&self) -> ThreadId {
        self.worker.id
    }

    /// Block until the executor thread has attempted to pin itself and return
    /// what happened.
    pub fn affinity_outcome(&self) -> Result<(), AffinityError> {
        self.pin.wait()
    }
}

impl<Q: Pump> std::fmt::Debug for PinnedExecutor<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedExecutor")
            .field("affinity", &self.affinity)
            .field("thread", &self.worker.id)
            .finish()
    }
}

/// A dedicated single-threaded executor that is not bound to any core.
pub struct UnpinnedExecutor<Q: Pump = RunLoop> {
    worker: Worker<Q>,
}

impl UnpinnedExecutor {
    /// Spawn the executor thread. There is no `Default`: spawning can fail.
    pub fn new() -> Result<Self, Error> {
        Self::with_queue(RunLoop::new())
    }
}

impl<Q: Pump> UnpinnedExecutor<Q> {
    pub fn with_queue(queue: Q) -> Result<Self, Error> {
        let worker = Worker::spawn("pinloop-unpinned".to_owned(), queue, || ())?;
        Ok(Self { worker })
    }

    pub fn scheduler(&self) -> Q::Scheduler {
        self.worker.queue.scheduler()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.worker.id
    }
}

impl<Q: Pump> std::fmt::Debug for UnpinnedExecutor<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnpinnedExecutor").field("thread", &self.worker.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{ sync::{ atomic::{ AtomicUsize, Ordering }, mpsc }, time::Duration };

    use super::*;

    /// Counts how often it gets pumped and finished, to check the executor
    /// drives an injected queue.
    #[derive(Default)]
    struct CountingLoop {
        inner: RunLoop,
        runs: Arc<AtomicUsize>,
        finishes: Arc<AtomicUsize>,
    }

    impl Pump for CountingLoop {
        type Scheduler = Scheduler;

        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.inner.run();
        }

        fn finish(&self) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
            self.inner.finish();
        }

        fn scheduler(&self) -> Scheduler {
            self.inner.scheduler()
        }
    }

    #[test]
    fn drives_injected_queue_and_finishes_it_on_drop() {
        let queue = CountingLoop::default();
        let runs = queue.runs.clone();
        let finishes = queue.finishes.clone();

        let executor = UnpinnedExecutor::with_queue(queue).unwrap();
        let (tx, rx) = mpsc::channel();
        executor.scheduler().schedule(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(executor);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_from_own_thread_detaches() {
        let executor = Arc::new(UnpinnedExecutor::new().unwrap());
        let scheduler = executor.scheduler();
        let (tx, rx) = mpsc::channel();

        let owned = executor.clone();
        scheduler
            .schedule(move || {
                // The last strong reference is released on the executor thread.
                let _ = rx.recv();
                drop(owned);
            })
            .unwrap();
        drop(executor);
        tx.send(()).unwrap();

        // The thread notices `finish` and exits; nothing to join, no deadlock.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !scheduler.is_closed() {
            assert!(std::time::Instant::now() < deadline);
            thread::yield_now();
        }
    }

    #[test]
    fn pinned_debug_shows_affinity() {
        let executor = PinnedExecutor::new(0).unwrap();
        let rendered = format!("{:?}", executor);
        assert!(rendered.contains("core_id: 0"));
    }
}
