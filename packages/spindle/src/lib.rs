//! Coroutine concurrency core.
//!
//! - A [`Context`] is an immutable map of elements travelling with a coroutine, such as its
//!   [`Job`], its dispatcher, and its [`CoroutineName`].
//! - A [`Job`] is a coroutine's cancellation token and lifecycle state.
//! - A [`Dispatcher`](dispatcher::Dispatcher) decides which thread a resumption runs on.
//! - A [`DispatchedContinuation`](continuation::DispatchedContinuation) routes every resumption
//!   of a suspended computation through a dispatcher.
//! - Channels ([`channel`], [`rendezvous`], [`bounded`], [`unbounded`], [`conflated`]) let
//!   coroutines hand messages to each other, suspending until a counterpart arrives.
//!
//! Coroutines are launched with [`launch`], and blocking code can drive any of the futures in this
//! crate with [`block_on`] or the per-future blocking methods.

#[macro_use]
extern crate tracing;

pub mod context;
pub mod job;
pub mod dispatcher;
pub mod continuation;
pub mod suspend;

mod channel;
mod coroutine;
mod polling;
mod util;

pub use crate::{
    channel::api::*,
    context::{Context, CoroutineName},
    coroutine::{launch, yield_now, JoinHandle},
    job::{Job, JobId, JobState},
    polling::block_on,
};

/// Error types
pub mod error {
    pub use crate::{
        channel::error::*,
        coroutine::JoinError,
        dispatcher::DispatchError,
        job::CancellationError,
    };
}

/// Future types
pub mod future {
    pub use crate::{
        channel::api::future::*,
        context::Scoped,
        coroutine::YieldNow,
    };
}
