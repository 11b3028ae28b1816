// dispatcher onto a tokio runtime.
//
// tasks go through an unbounded queue to a driver task, which spawns each onto the runtime.
// once the runtime shuts down the driver (and its queue receiver) is dropped, so dispatching
// fails instead of silently losing tasks.

use super::{run_task, DispatchError, Dispatcher, Task};
use crate::context::Context;
use tokio::{
    runtime::Handle,
    sync::mpsc,
    task::AbortHandle,
};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};


static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);


/// Dispatcher running tasks on a tokio runtime
///
/// Tasks run as ordinary tokio tasks, so with a multi-threaded runtime they run on the
/// runtime's worker threads.
pub struct TokioDispatcher {
    name: String,
    send: mpsc::UnboundedSender<Task>,
    driver: AbortHandle,
}

impl TokioDispatcher {
    /// Construct a dispatcher onto the runtime of `handle`
    pub fn new(handle: &Handle) -> Self {
        let name = format!("tokio-{}", NEXT_DISPATCHER_ID.fetch_add(1, Relaxed));
        let (send, mut recv) = mpsc::unbounded_channel::<Task>();
        let driver_name = name.clone();
        let driver = handle.spawn(async move {
            while let Some(task) = recv.recv().await {
                let name = driver_name.clone();
                tokio::task::spawn(async move { run_task(task, &name) });
            }
        });
        TokioDispatcher { name, send, driver: driver.abort_handle() }
    }

    /// Construct a dispatcher onto the runtime the calling thread is in, if any
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(|handle| TokioDispatcher::new(&handle))
    }
}

impl Dispatcher for TokioDispatcher {
    fn dispatch(&self, _: &Context, task: Task) -> Result<(), DispatchError> {
        self.send.send(task).map_err(|_| DispatchError::Shutdown(self.name.clone()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TokioDispatcher {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
