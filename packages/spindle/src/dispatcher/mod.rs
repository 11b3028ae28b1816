//! Dispatchers decide which thread a resumption runs on.
//!
//! The core only relies on the [`Dispatcher`] contract. Two concrete dispatchers are provided:
//!
//! - [`ThreadPoolDispatcher`], a fixed pool of named worker threads draining a FIFO task queue.
//! - [`TokioDispatcher`], which runs tasks on a tokio runtime.
//!
//! Dispatchers live in a [`Context`] under a single key, [`DispatcherHandle`], so combining two
//! contexts that both name a dispatcher keeps only the right-hand one.

mod pool;
mod runtime;

pub use self::{
    pool::{PoolConfig, ThreadPoolDispatcher},
    runtime::TokioDispatcher,
};

use crate::{
    context::{Context, Element},
    util::panic_message,
};
use thiserror::Error;
use std::{
    any::type_name,
    fmt::{self, Debug, Formatter},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, OnceLock},
};


/// Unit of work handed to a [`Dispatcher`]
pub struct Task(Box<dyn FnOnce() + Send>);

impl Task {
    /// Wrap a closure
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> Self {
        Task(Box::new(f))
    }

    /// Run the task on the calling thread
    pub fn run(self) {
        (self.0)()
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("Task(..)")
    }
}

/// Error for a dispatcher being unable to schedule a task
///
/// This is fatal to the runtime: resumptions that fail to dispatch are never retried.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DispatchError {
    /// The dispatcher's workers have been shut down
    #[error("dispatcher {0:?} has been shut down")]
    Shutdown(String),
}

/// Policy object controlling on which thread a resumption executes
pub trait Dispatcher: Send + Sync + 'static {
    /// Whether resuming a continuation with this context must go through [`dispatch`][1]
    ///
    /// Must be pure given the context and the calling thread. Returning `false` lets the
    /// resumption run inline on the calling thread.
    ///
    /// [1]: Self::dispatch
    fn is_dispatch_needed(&self, context: &Context) -> bool {
        let _ = context;
        true
    }

    /// Schedule `task` to run exactly once on a thread owned by this dispatcher
    ///
    /// Must not run `task` before returning. Safe to call concurrently from any thread.
    fn dispatch(&self, context: &Context, task: Task) -> Result<(), DispatchError>;

    /// Name used in diagnostics
    fn name(&self) -> &str {
        type_name::<Self>()
    }
}

/// [`Context`] element holding the dispatcher
#[derive(Clone)]
pub struct DispatcherHandle(pub Arc<dyn Dispatcher>);

impl Debug for DispatcherHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("DispatcherHandle").field(&self.0.name()).finish()
    }
}

impl Element for DispatcherHandle {}

impl Context {
    /// The dispatcher, if present
    pub fn dispatcher(&self) -> Option<&Arc<dyn Dispatcher>> {
        self.get::<DispatcherHandle>().map(|handle| &handle.0)
    }

    /// Construct a new context with the given dispatcher, replacing any existing one
    pub fn with_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.with(DispatcherHandle(dispatcher))
    }
}


static DEFAULT: OnceLock<Arc<ThreadPoolDispatcher>> = OnceLock::new();

/// Process-wide thread pool dispatcher, sized to the available parallelism
///
/// Created on first use. Used by [`launch`](crate::launch) when the context names no
/// dispatcher. Panics if its worker threads cannot be spawned.
pub fn default_dispatcher() -> Arc<dyn Dispatcher> {
    DEFAULT
        .get_or_init(|| {
            let config = PoolConfig::default().name("spindle-default");
            Arc::new(ThreadPoolDispatcher::new(config)
                .expect("failed to spawn default dispatcher threads"))
        })
        .clone()
}

// run a task, logging rather than propagating a panic.
pub(crate) fn run_task(task: Task, dispatcher: &str) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
        error!(dispatcher, panic = %panic_message(&*payload), "dispatched task panicked");
    }
}
