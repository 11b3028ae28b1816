//! Launching coroutines.
//!
//! A coroutine is a future driven entirely through a [`Dispatcher`]: each wake of it is a
//! resumption routed through [`DispatchedContinuation`], so its polls run on whichever thread the
//! dispatcher picks, with the coroutine's [`Context`] current.

use crate::{
    context::{Context, Element},
    continuation::{Continuation, DispatchedContinuation},
    dispatcher::{default_dispatcher, Dispatcher},
    job::{CancellationError, Job},
    suspend::{suspend_with, Suspension},
    util::panic_message,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::Span;
use std::{
    convert::Infallible,
    fmt::{self, Debug, Formatter},
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{
            AtomicU8,
            Ordering::{AcqRel, Acquire, Release},
        },
        Arc,
        Mutex,
    },
    task::{self, ready, Poll, Wake, Waker},
};


// coroutine scheduling states.
const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const DONE: u8 = 4;


// context element of launched coroutines, whose wakers schedule them through their dispatcher.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Launched;

impl Element for Launched {}


/// Error for a coroutine failing to produce its output
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum JoinError {
    /// The coroutine panicked
    #[error("coroutine panicked: {0}")]
    Panicked(String),
    /// The coroutine was dropped before completing, such as by its dispatcher shutting down
    #[error("coroutine was dropped before completing")]
    Dropped,
}

/// Launch a future as a coroutine
///
/// The coroutine runs under a fresh [`Job`], a child of `context`'s job if it has one, and on
/// `context`'s dispatcher, or [`default_dispatcher`] if it has none. Its context is `context`
/// with those elements, and is current whenever the coroutine is polled. The first poll is
/// dispatched rather than run on the calling thread.
///
/// When the future resolves or panics, the job completes. Cancelling the job does not stop the
/// coroutine by force: it observes a [`CancellationError`] at its next suspension point.
pub fn launch<F>(context: &Context, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let job = match context.job() {
        Some(parent) => parent.new_child(),
        None => Job::new(),
    };
    let dispatcher = context.dispatcher().cloned().unwrap_or_else(default_dispatcher);
    let context = context
        .with(job.clone())
        .with(Launched)
        .with_dispatcher(Arc::clone(&dispatcher));
    let span = trace_span!(
        "coroutine",
        job = %job.id(),
        name = context.name().map_or("<unnamed>", |name| &*name.0),
    );
    let (send, recv) = oneshot::channel();

    let task = Arc::new(CoroutineTask {
        state: AtomicU8::new(SCHEDULED),
        running: Mutex::new(Some(Running { fut: Box::pin(fut), result: send })),
        context,
        dispatcher,
        job: job.clone(),
        span,
    });
    trace!(job = %job.id(), dispatcher = task.dispatcher.name(), "launching coroutine");
    schedule(task);
    JoinHandle { job, recv }
}


// shared state of a launched coroutine. it is its own waker.
struct CoroutineTask<T> {
    state: AtomicU8,
    // taken once the coroutine is done.
    running: Mutex<Option<Running<T>>>,
    context: Context,
    dispatcher: Arc<dyn Dispatcher>,
    job: Job,
    span: Span,
}

struct Running<T> {
    fut: Pin<Box<dyn Future<Output = T> + Send>>,
    result: oneshot::Sender<Result<T, JoinError>>,
}

// continuation resuming a coroutine by polling it.
struct Poller<T>(Arc<CoroutineTask<T>>);

impl<T: Send + 'static> Continuation for Poller<T> {
    type Value = ();
    type Failure = Infallible;

    fn context(&self) -> &Context {
        &self.0.context
    }

    fn resume_with(self, _: Result<(), Infallible>) {
        self.0.run();
    }
}

// route a resumption of a scheduled coroutine through its dispatcher.
fn schedule<T: Send + 'static>(task: Arc<CoroutineTask<T>>) {
    let dispatcher = Arc::clone(&task.dispatcher);
    DispatchedContinuation::new(Poller(task), dispatcher).resume(());
}

impl<T: Send + 'static> CoroutineTask<T> {
    // poll the coroutine once. only ever called while scheduled.
    fn run(self: Arc<Self>) {
        self.state.store(RUNNING, Release);
        let entered = self.span.enter();

        let mut lock = self.running.lock().unwrap();
        let Some(running) = lock.as_mut() else { return };
        let waker = Waker::from(Arc::clone(&self));
        let mut cx = task::Context::from_waker(&waker);
        let polled = catch_unwind(AssertUnwindSafe(|| running.fut.as_mut().poll(&mut cx)));

        let result = match polled {
            Ok(Poll::Pending) => {
                drop(lock);
                if self.state.compare_exchange(RUNNING, IDLE, AcqRel, Acquire).is_err() {
                    // woken while running
                    self.state.store(SCHEDULED, Release);
                    drop(entered);
                    schedule(self);
                }
                return;
            }
            Ok(Poll::Ready(output)) => Ok(output),
            Err(payload) => {
                let msg = panic_message(&*payload);
                error!(panic = %msg, "coroutine panicked");
                Err(JoinError::Panicked(msg))
            }
        };

        self.state.store(DONE, Release);
        let running = lock.take();
        drop(lock);
        self.job.complete();
        trace!("coroutine done");
        if let Some(Running { fut, result: send }) = running {
            drop(fut);
            let _ = send.send(result);
        }
    }
}

impl<T: Send + 'static> Wake for CoroutineTask<T> {
    fn wake(self: Arc<Self>) {
        loop {
            match self.state.load(Acquire) {
                IDLE => {
                    if self.state.compare_exchange(IDLE, SCHEDULED, AcqRel, Acquire).is_ok() {
                        schedule(self);
                        return;
                    }
                }
                RUNNING => {
                    if self.state.compare_exchange(RUNNING, NOTIFIED, AcqRel, Acquire).is_ok() {
                        return;
                    }
                }
                // already going to be polled, or never again
                _ => return,
            }
        }
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Arc::clone(self).wake();
    }
}


/// Handle to a launched coroutine's output
///
/// Dropping it detaches the coroutine, which keeps running.
pub struct JoinHandle<T> {
    job: Job,
    recv: oneshot::Receiver<Result<T, JoinError>>,
}

impl<T> JoinHandle<T> {
    /// The coroutine's job
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Cancel the coroutine's job
    ///
    /// Returns whether this call cancelled it.
    pub fn cancel(&self) -> bool {
        self.job.cancel()
    }

    /// Block until the coroutine finishes
    pub fn block(self) -> Result<T, JoinError> {
        crate::block_on(self)
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Self::Output> {
        let received = ready!(Pin::new(&mut self.get_mut().recv).poll(cx));
        Poll::Ready(received.unwrap_or(Err(JoinError::Dropped)))
    }
}

impl<T> Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("JoinHandle").field("job", &self.job).finish_non_exhaustive()
    }
}


/// Cooperatively yield to other coroutines
///
/// The current coroutine is resumed through its dispatcher, always by dispatching. Resolves to
/// an error if the current job is inactive when yielding or by the time it would be resumed.
/// Outside of any dispatcher, it merely returns pending once after waking itself.
pub fn yield_now() -> YieldNow {
    YieldNow { state: YieldState::Init }
}

/// Future returned by [`yield_now`]
#[derive(Debug)]
pub struct YieldNow {
    state: YieldState,
}

#[derive(Debug)]
enum YieldState {
    Init,
    Dispatched(Suspension<(), CancellationError>),
    // yielded without a dispatcher.
    Woken(Option<Job>),
    Done,
}

fn check_job(job: Option<&Job>) -> Result<(), CancellationError> {
    match job {
        Some(job) if !job.is_active() => Err(job.inactive_cancellation_error()),
        _ => Ok(()),
    }
}

impl Future for YieldNow {
    type Output = Result<(), CancellationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            YieldState::Init => {
                let context = Context::current();
                if let Err(e) = check_job(context.job()) {
                    this.state = YieldState::Done;
                    return Poll::Ready(Err(e));
                }
                match context.dispatcher().cloned() {
                    Some(dispatcher) => {
                        let (suspended, mut suspension) =
                            suspend_with::<(), CancellationError>(context.clone());
                        DispatchedContinuation::new(suspended, dispatcher)
                            .resume_yield(context.job(), ());
                        // the dispatched resume may already have run
                        match Pin::new(&mut suspension).poll(cx) {
                            Poll::Ready(result) => {
                                this.state = YieldState::Done;
                                Poll::Ready(result)
                            }
                            Poll::Pending => {
                                this.state = YieldState::Dispatched(suspension);
                                Poll::Pending
                            }
                        }
                    }
                    None => {
                        this.state = YieldState::Woken(context.job().cloned());
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                }
            }
            YieldState::Dispatched(suspension) => {
                let result = ready!(Pin::new(suspension).poll(cx));
                this.state = YieldState::Done;
                Poll::Ready(result)
            }
            YieldState::Woken(job) => {
                let result = check_job(job.as_ref());
                this.state = YieldState::Done;
                Poll::Ready(result)
            }
            // for implementation of FusedFuture
            YieldState::Done => Poll::Pending,
        }
    }
}

#[cfg(feature = "futures")]
impl futures::future::FusedFuture for YieldNow {
    fn is_terminated(&self) -> bool {
        matches!(self.state, YieldState::Done)
    }
}
