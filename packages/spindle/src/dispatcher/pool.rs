// fixed-size thread pool dispatcher.
//
// workers share one FIFO task queue behind a mutex + condvar. shutting down lets workers drain
// whatever is already queued, after which dispatching fails.

use super::{run_task, DispatchError, Dispatcher, Task};
use crate::context::Context;
use std::{
    cell::Cell,
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
        Condvar,
        Mutex,
    },
    thread::{self, JoinHandle},
};


static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // id of the pool this thread is a worker of, or 0.
    static WORKER_OF: Cell<u64> = const { Cell::new(0) };
}


/// Configuration for a [`ThreadPoolDispatcher`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    threads: usize,
    name: String,
    inline_on_workers: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            name: "spindle-worker".into(),
            inline_on_workers: false,
        }
    }
}

impl PoolConfig {
    /// Number of worker threads (at least 1)
    ///
    /// Defaults to the available parallelism.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Prefix of worker thread names
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Whether resumptions requested from one of the pool's own workers may run inline
    ///
    /// Defaults to false, meaning every resumption hops through the queue.
    pub fn inline_on_workers(mut self, inline_on_workers: bool) -> Self {
        self.inline_on_workers = inline_on_workers;
        self
    }
}


/// Dispatcher running tasks on a fixed pool of worker threads
///
/// Dropping the dispatcher shuts it down.
pub struct ThreadPoolDispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    id: u64,
    name: String,
    inline_on_workers: bool,
    queue: Mutex<Queue>,
    cond: Condvar,
}

struct Queue {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

impl ThreadPoolDispatcher {
    /// Spawn the worker threads
    pub fn new(config: PoolConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Relaxed),
            name: config.name,
            inline_on_workers: config.inline_on_workers,
            queue: Mutex::new(Queue { tasks: VecDeque::new(), shutdown: false }),
            cond: Condvar::new(),
        });
        let this = ThreadPoolDispatcher { shared, workers: Mutex::new(Vec::new()) };
        for i in 0..config.threads {
            let shared = Arc::clone(&this.shared);
            let worker = thread::Builder::new()
                .name(format!("{}-{}", this.shared.name, i))
                .spawn(move || work(shared))?;
            this.workers.lock().unwrap().push(worker);
        }
        debug!(pool = %this.shared.name, threads = config.threads, "spawned thread pool dispatcher");
        Ok(this)
    }

    /// Whether the calling thread is one of this pool's workers
    pub fn is_worker_thread(&self) -> bool {
        WORKER_OF.with(|id| id.get()) == self.shared.id
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().unwrap().shutdown
    }

    /// Stop accepting tasks, let the workers drain the queue, and join them
    ///
    /// Idempotent. When called from one of the pool's own workers, that worker is not joined.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if !queue.shutdown {
                queue.shutdown = true;
                debug!(pool = %self.shared.name, "shutting down thread pool dispatcher");
            }
        }
        self.shared.cond.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

// worker thread body.
fn work(shared: Arc<Shared>) {
    WORKER_OF.with(|id| id.set(shared.id));
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break Some(task);
                }
                if queue.shutdown {
                    break None;
                }
                queue = shared.cond.wait(queue).unwrap();
            }
        };
        let Some(task) = task else { break };
        run_task(task, &shared.name);
    }
    trace!(pool = %shared.name, "worker exiting");
}

impl Dispatcher for ThreadPoolDispatcher {
    fn is_dispatch_needed(&self, _: &Context) -> bool {
        !(self.shared.inline_on_workers && self.is_worker_thread())
    }

    fn dispatch(&self, _: &Context, task: Task) -> Result<(), DispatchError> {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.shutdown {
            return Err(DispatchError::Shutdown(self.shared.name.clone()));
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.cond.notify_one();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for ThreadPoolDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
