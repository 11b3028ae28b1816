//! Coroutine lifecycle and cancellation tokens.

use crate::context::{Context, Element};
use smallvec::SmallVec;
use thiserror::Error;
use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::{
        atomic::{
            Ordering::{Acquire, Relaxed, Release},
            AtomicU64,
            AtomicU8,
        },
        Arc,
        Mutex,
        OnceLock,
        Weak,
    },
};


static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_CANCEL_REASON: &str = "job was cancelled";
const COMPLETED_REASON: &str = "job has completed";


/// Process-unique job identifier
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct JobId(u64);

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a [`Job`]
///
/// `Active` may move to `Cancelling` (then `Cancelled`) or to `Completed`. `Cancelled` and
/// `Completed` are terminal.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum JobState {
    /// Resumptions may proceed
    Active,
    /// Cancellation has begun and cancel handlers are running
    Cancelling,
    /// Cancelled (terminal)
    Cancelled,
    /// Finished, normally or by failing (terminal)
    Completed,
}

impl JobState {
    fn from_byte(byte: u8) -> Self {
        if byte == JobState::Active as u8 {
            JobState::Active
        } else if byte == JobState::Cancelling as u8 {
            JobState::Cancelling
        } else if byte == JobState::Cancelled as u8 {
            JobState::Cancelled
        } else if byte == JobState::Completed as u8 {
            JobState::Completed
        } else {
            unreachable!("invalid job state byte: {}", byte)
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Cancelled | JobState::Completed)
    }
}

/// Error for a resumption attempted on behalf of an inactive job
#[derive(Error, Debug, Clone)]
#[error("job {job} is inactive: {reason}")]
pub struct CancellationError {
    job: JobId,
    reason: Arc<str>,
}

impl CancellationError {
    /// The job that was inactive
    pub fn job(&self) -> JobId {
        self.job
    }

    /// Why the job became inactive
    pub fn reason(&self) -> &str {
        &self.reason
    }
}


type Handler = Box<dyn FnOnce(&CancellationError) + Send>;

// shared job state.
struct Inner {
    id: JobId,
    // JobState byte. transitions only by compare-and-swap out of Active, plus the
    // Cancelling -> Cancelled store performed by whoever won the cancel CAS.
    state: AtomicU8,
    // registered cancel handlers. becomes None once taken by cancel or complete, after which
    // no handler may be registered.
    handlers: Mutex<Option<SmallVec<[(u64, Handler); 2]>>>,
    next_handler_id: AtomicU64,
    // set at most once, by the first cancel call.
    reason: OnceLock<Arc<str>>,
    // built lazily once inactive.
    error: OnceLock<CancellationError>,
    // registration with the parent job, if any.
    parent: Mutex<Option<CancelHandle>>,
}

/// Cancellation and lifecycle handle for one coroutine
///
/// Cloning produces another handle to the same job. A `Job` is a [`Context`] element.
#[derive(Clone)]
pub struct Job(Arc<Inner>);

impl Job {
    /// Construct a new, active job
    pub fn new() -> Self {
        Job(Arc::new(Inner {
            id: JobId(NEXT_JOB_ID.fetch_add(1, Relaxed)),
            state: AtomicU8::new(JobState::Active as u8),
            handlers: Mutex::new(Some(SmallVec::new())),
            next_handler_id: AtomicU64::new(0),
            reason: OnceLock::new(),
            error: OnceLock::new(),
            parent: Mutex::new(None),
        }))
    }

    /// Construct a new, active job which is cancelled whenever this job is cancelled
    pub fn new_child(&self) -> Job {
        let child = Job::new();
        let weak = Arc::downgrade(&child.0);
        let handle = self.on_cancel(move |error| {
            if let Some(inner) = weak.upgrade() {
                Job(inner).cancel_with_reason(format!("parent job {} was cancelled", error.job()));
            }
        });
        *child.0.parent.lock().unwrap() = Some(handle);
        child
    }

    /// This job's identifier
    pub fn id(&self) -> JobId {
        self.0.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> JobState {
        JobState::from_byte(self.0.state.load(Acquire))
    }

    /// Whether resumptions on behalf of this job may proceed
    pub fn is_active(&self) -> bool {
        self.state() == JobState::Active
    }

    /// Whether cancellation has begun or finished
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), JobState::Cancelling | JobState::Cancelled)
    }

    /// Whether the job completed
    pub fn is_completed(&self) -> bool {
        self.state() == JobState::Completed
    }

    /// Cancel the job
    ///
    /// Returns whether this call performed the transition. Cancelling an inactive job does
    /// nothing.
    pub fn cancel(&self) -> bool {
        self.cancel_with_reason(DEFAULT_CANCEL_REASON)
    }

    /// Cancel the job, recording a reason in its cancellation error
    ///
    /// Runs registered cancel handlers on the calling thread before returning. Never waits for
    /// the coroutine itself.
    pub fn cancel_with_reason(&self, reason: impl Into<Arc<str>>) -> bool {
        if !self.is_active() {
            return false;
        }
        let _ = self.0.reason.set(reason.into());
        if self.0.state
            .compare_exchange(JobState::Active as u8, JobState::Cancelling as u8, Release, Relaxed)
            .is_err()
        {
            return false;
        }
        debug!(job = %self.id(), "job cancelling");

        // run handlers without holding the handlers lock, as they may touch other jobs
        let handlers = self.0.handlers.lock().unwrap().take();
        let error = self.inactive_cancellation_error();
        for (_, handler) in handlers.into_iter().flatten() {
            handler(&error);
        }

        self.0.state.store(JobState::Cancelled as u8, Release);
        if let Some(parent) = self.0.parent.lock().unwrap().take() {
            parent.dispose();
        }
        debug!(job = %self.id(), "job cancelled");
        true
    }

    /// Mark the job completed
    ///
    /// Returns whether this call performed the transition. Completing an inactive job does
    /// nothing.
    pub fn complete(&self) -> bool {
        if self.0.state
            .compare_exchange(JobState::Active as u8, JobState::Completed as u8, Release, Relaxed)
            .is_err()
        {
            return false;
        }
        drop(self.0.handlers.lock().unwrap().take());
        if let Some(parent) = self.0.parent.lock().unwrap().take() {
            parent.dispose();
        }
        trace!(job = %self.id(), "job completed");
        true
    }

    /// The error with which resumptions on behalf of this job fail once it is inactive
    ///
    /// Built on first use after the job becomes inactive, then cached.
    pub fn inactive_cancellation_error(&self) -> CancellationError {
        let state = self.state();
        let build = || CancellationError {
            job: self.id(),
            reason: match state {
                JobState::Completed => COMPLETED_REASON.into(),
                _ => self.0.reason.get().cloned().unwrap_or_else(|| DEFAULT_CANCEL_REASON.into()),
            },
        };
        if state == JobState::Active {
            // not cached, the job may yet complete rather than be cancelled
            build()
        } else {
            self.0.error.get_or_init(build).clone()
        }
    }

    /// Register a handler to run once if this job is cancelled
    ///
    /// If the job is already cancelled the handler runs immediately on the calling thread. If
    /// the job completes, the handler is dropped without running. Dropping or disposing the
    /// returned handle deregisters the handler.
    pub fn on_cancel<F>(&self, handler: F) -> CancelHandle
    where
        F: FnOnce(&CancellationError) + Send + 'static,
    {
        let mut lock = self.0.handlers.lock().unwrap();
        if let Some(handlers) = lock.as_mut() {
            let id = self.0.next_handler_id.fetch_add(1, Relaxed);
            handlers.push((id, Box::new(handler)));
            return CancelHandle { job: Arc::downgrade(&self.0), id };
        }
        drop(lock);
        if self.is_cancelled() {
            handler(&self.inactive_cancellation_error());
        }
        CancelHandle { job: Weak::new(), id: 0 }
    }
}

impl Default for Job {
    fn default() -> Self {
        Job::new()
    }
}

impl Debug for Job {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Element for Job {}

impl Context {
    /// The [`Job`] element, if present
    pub fn job(&self) -> Option<&Job> {
        self.get()
    }
}


/// Registration returned by [`Job::on_cancel`]
///
/// Deregisters the handler when dropped.
#[must_use = "dropping a CancelHandle deregisters the handler"]
pub struct CancelHandle {
    job: Weak<Inner>,
    id: u64,
}

impl CancelHandle {
    /// Deregister the handler, if it has not yet run
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        let Some(inner) = self.job.upgrade() else { return };
        let mut lock = inner.handlers.lock().unwrap();
        if let Some(handlers) = lock.as_mut() {
            if let Some(i) = handlers.iter().position(|&(id, _)| id == self.id) {
                handlers.remove(i);
            }
        }
    }
}
