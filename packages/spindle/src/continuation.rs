//! Resumption interception.
//!
//! A [`Continuation`] is the capability to resume a suspended computation exactly once, with a
//! value or a failure. [`DispatchedContinuation`] pairs one continuation with one
//! [`Dispatcher`] and routes every resume through it, making the continuation's [`Context`]
//! current for the duration of the resume on whichever thread it ends up on.

use crate::{
    context::Context,
    dispatcher::{Dispatcher, Task},
    job::{CancellationError, Job},
};
use std::sync::Arc;


/// Resumable handle to a suspended computation
///
/// Implementations are resumed at most once. The [`Context`] they carry is the context the
/// computation suspended in.
pub trait Continuation: Send + 'static {
    /// Type of the success value
    type Value: Send + 'static;
    /// Type of the failure value
    type Failure: Send + 'static;

    /// Context the computation suspended in
    fn context(&self) -> &Context;

    /// Resume the computation, on the calling thread
    fn resume_with(self, result: Result<Self::Value, Self::Failure>);
}

/// Continuation whose resumes are routed through a dispatcher
pub struct DispatchedContinuation<C> {
    continuation: C,
    dispatcher: Arc<dyn Dispatcher>,
}

impl<C: Continuation> DispatchedContinuation<C> {
    /// Pair a continuation with a dispatcher
    pub fn new(continuation: C, dispatcher: Arc<dyn Dispatcher>) -> Self {
        DispatchedContinuation { continuation, dispatcher }
    }

    /// Context of the wrapped continuation
    pub fn context(&self) -> &Context {
        self.continuation.context()
    }

    /// The dispatcher resumes go through
    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Unwrap without resuming
    pub fn into_inner(self) -> C {
        self.continuation
    }

    /// Resume with a value
    pub fn resume(self, value: C::Value) {
        self.resume_with(Ok(value))
    }

    /// Resume with a failure
    pub fn resume_with_failure(self, failure: C::Failure) {
        self.resume_with(Err(failure))
    }

    /// Resume with a result
    ///
    /// Dispatches if the dispatcher says dispatch is needed for the continuation's context,
    /// otherwise resumes inline. Either way the context is current during the resume.
    ///
    /// Panics if the dispatcher fails to accept the task, as the resumption would otherwise be
    /// lost.
    pub fn resume_with(self, result: Result<C::Value, C::Failure>) {
        let DispatchedContinuation { continuation, dispatcher } = self;
        let context = continuation.context().clone();
        if dispatcher.is_dispatch_needed(&context) {
            trace!(dispatcher = dispatcher.name(), "dispatching resumption");
            let task = Task::new(move || resume_in_context(continuation, result));
            dispatch_or_abort(&*dispatcher, &context, task);
        } else {
            trace!(dispatcher = dispatcher.name(), "resuming inline");
            resume_in_context(continuation, result);
        }
    }

    /// Resume with a value on behalf of a cooperative yield
    ///
    /// Unlike [`resume`](Self::resume), this always dispatches, even if the dispatcher says it
    /// is not needed, so that the yield is a real scheduling point. Immediately before resuming,
    /// `job` is re-checked: if it has become inactive in the meantime the continuation is
    /// resumed with the job's cancellation error instead of `value`.
    pub fn resume_yield(self, job: Option<&Job>, value: C::Value)
    where
        C::Failure: From<CancellationError>,
    {
        let DispatchedContinuation { continuation, dispatcher } = self;
        let context = continuation.context().clone();
        let job = job.cloned();
        let task = Task::new(move || {
            let result = match job {
                Some(job) if !job.is_active() => Err(job.inactive_cancellation_error().into()),
                _ => Ok(value),
            };
            resume_in_context(continuation, result);
        });
        trace!(dispatcher = dispatcher.name(), "dispatching yield");
        dispatch_or_abort(&*dispatcher, &context, task);
    }
}

/// Continuation in the form it is stored while waiting
///
/// A continuation whose context names a dispatcher is intercepted by it. One whose context
/// names none is resumed directly on the resuming thread.
pub enum Resumption<C> {
    /// Not intercepted
    Direct(C),
    /// Intercepted by the context's dispatcher
    Dispatched(DispatchedContinuation<C>),
}

impl<C: Continuation> Resumption<C> {
    /// Wrap a continuation according to its context's dispatcher
    pub fn intercept(continuation: C) -> Self {
        match continuation.context().dispatcher().cloned() {
            Some(dispatcher) => {
                Resumption::Dispatched(DispatchedContinuation::new(continuation, dispatcher))
            }
            None => Resumption::Direct(continuation),
        }
    }

    /// Context of the wrapped continuation
    pub fn context(&self) -> &Context {
        match self {
            Resumption::Direct(continuation) => continuation.context(),
            Resumption::Dispatched(dispatched) => dispatched.context(),
        }
    }

    /// Resume with a value
    pub fn resume(self, value: C::Value) {
        self.resume_with(Ok(value))
    }

    /// Resume with a failure
    pub fn resume_with_failure(self, failure: C::Failure) {
        self.resume_with(Err(failure))
    }

    /// Resume with a result
    pub fn resume_with(self, result: Result<C::Value, C::Failure>) {
        match self {
            Resumption::Direct(continuation) => resume_in_context(continuation, result),
            Resumption::Dispatched(dispatched) => dispatched.resume_with(result),
        }
    }
}

// resume with the continuation's context current. the guard restores the previous context
// even if the resume panics.
fn resume_in_context<C: Continuation>(continuation: C, result: Result<C::Value, C::Failure>) {
    let context = continuation.context().clone();
    let _guard = context.enter();
    continuation.resume_with(result);
}

fn dispatch_or_abort(dispatcher: &dyn Dispatcher, context: &Context, task: Task) {
    if let Err(e) = dispatcher.dispatch(context, task) {
        error!(%e, dispatcher = dispatcher.name(), "failed to dispatch resumption");
        panic!("fatal: failed to dispatch resumption: {}", e);
    }
}
