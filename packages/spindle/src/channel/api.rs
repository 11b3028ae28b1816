// exposed API of channels

use self::future::*;
use super::{
    error::*,
    core,
};
use std::{
    fmt::{self, Debug, Formatter},
    sync::atomic::Ordering::{AcqRel, Relaxed},
};

pub use super::core::Capacity;


// ==== helper functions for adapting core API to exposed API ====


// 1. increment channel send count.
// 2. clone another handle to the channel.
fn clone_sender<T>(channel: &core::Channel<T>) -> core::Channel<T> {
    channel.send_count().fetch_add(1, Relaxed);
    channel.clone()
}

// 1. decrement channel send count.
// 2. if the send count was lowered to 0, close the channel, avoiding locking if possible.
fn drop_sender<T>(channel: &core::Channel<T>) {
    let prev_send_count = channel.send_count().fetch_sub(1, AcqRel);
    if prev_send_count == 1 && !channel.is_closed() {
        trace!(channel = channel.id(), "last sender dropped");
        channel.lock().close(None, false);
    }
}

// 1. increment channel recv count.
// 2. clone another handle to the channel.
fn clone_receiver<T>(channel: &core::Channel<T>) -> core::Channel<T> {
    channel.recv_count().fetch_add(1, Relaxed);
    channel.clone()
}

// 1. decrement channel recv count.
// 2. if the recv count was lowered to 0, cancel the channel.
fn drop_receiver<T>(channel: &core::Channel<T>) {
    let prev_recv_count = channel.recv_count().fetch_sub(1, AcqRel);
    if prev_recv_count == 1 {
        trace!(channel = channel.id(), "last receiver dropped");
        cancel(channel);
    }
}

// close the channel with a cancellation cause and discard buffered messages.
fn cancel<T>(channel: &core::Channel<T>) -> bool {
    let cause = CloseCause::new(anyhow::anyhow!("channel was cancelled"));
    channel.lock().close(Some(cause), true)
}


// ==== the exposed API ====


/// Create a channel with the given capacity
///
/// A capacity given as a number is [`Capacity::Rendezvous`] if 0, otherwise
/// [`Capacity::Bounded`]. Both halves may be cloned, making for any number of senders and
/// receivers. Each message is delivered to exactly one receiver.
pub fn channel<T>(capacity: impl Into<Capacity>) -> (Sender<T>, Receiver<T>) {
    let channel_1 = core::Channel::new(capacity.into());
    let channel_2 = channel_1.clone();
    (Sender { channel: channel_1 }, Receiver { channel: channel_2 })
}

/// Create a channel in which a send completes only once a receiver has taken the message
pub fn rendezvous<T>() -> (Sender<T>, Receiver<T>) {
    channel(Capacity::Rendezvous)
}

/// Create a channel buffering up to `n` messages, or a rendezvous channel if `n` is 0
pub fn bounded<T>(n: usize) -> (Sender<T>, Receiver<T>) {
    channel(n)
}

/// Create a channel buffering any number of messages
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    channel(Capacity::Unbounded)
}

/// Create a channel buffering only the most recent message
pub fn conflated<T>() -> (Sender<T>, Receiver<T>) {
    channel(Capacity::Conflated)
}


/// Sender handle to a channel
///
/// Dropping the last sender handle closes the channel without a cause, which receivers observe
/// as the end of the stream once buffered messages are drained.
pub struct Sender<T> {
    channel: core::Channel<T>,
}

impl<T> Sender<T> {
    /// Create a future to send a message on this channel
    ///
    /// When first polled, the message goes to the oldest waiting receiver if there is one, or
    /// into the buffer if there is room. Otherwise the future waits for a receiver to take it.
    ///
    /// See the API of [`SendFut`], as it is not only a future, but also provides additional
    /// methods, including the API for blocking on a send operation or trying to send immediately.
    pub fn send(&self, msg: T) -> SendFut<T> {
        SendFut::new(self.clone(), msg)
    }

    /// Try to send a message without waiting
    ///
    /// Does not consult the current job, as it is not a suspension point.
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        self.channel.lock().try_send(msg)
    }

    /// Close the channel without a cause
    ///
    /// Waiting receivers observe the end of the stream. Waiting senders fail with
    /// [`ClosedSendError`] and get their messages back. Buffered messages remain receivable.
    /// Returns whether this call closed the channel, as opposed to it already being closed.
    pub fn close(&self) -> bool {
        self.channel.lock().close(None, false)
    }

    /// Close the channel with a cause
    ///
    /// As [`close`](Self::close), except that receivers observe the cause as an error rather
    /// than the end of the stream.
    pub fn close_with(&self, cause: impl Into<anyhow::Error>) -> bool {
        self.channel.lock().close(Some(CloseCause::new(cause)), false)
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// The channel's capacity
    pub fn capacity(&self) -> Capacity {
        self.channel.capacity()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender { channel: clone_sender(&self.channel) }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        drop_sender(&self.channel);
    }
}

impl<T> Debug for Sender<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Sender")
            .field("channel", &self.channel.id())
            .field("capacity", &self.channel.capacity())
            .field("closed", &self.channel.is_closed())
            .finish()
    }
}


/// Receiver handle to a channel
///
/// Dropping the last receiver handle cancels the channel.
pub struct Receiver<T> {
    channel: core::Channel<T>,
}

impl<T> Receiver<T> {
    /// Create a future to receive a message from this channel
    ///
    /// When first polled, the oldest buffered message is taken if there is one, or else the
    /// message of the oldest waiting sender. Otherwise the future waits for a sender. Fails with
    /// [`ClosedReceiveError`] once the channel is closed and drained.
    ///
    /// See the API of [`RecvFut`], as it is not only a future, but also provides additional
    /// methods, including the API for blocking on a recv operation or trying to recv immediately.
    pub fn recv(&self) -> RecvFut<T> {
        RecvFut::new(self.clone())
    }

    /// Create a future to receive a message, resolving to `Ok(None)` at the end of the stream
    ///
    /// The end of the stream is the channel having been closed without a cause and drained.
    pub fn recv_or_none(&self) -> RecvOrNoneFut<T> {
        RecvOrNoneFut(self.recv())
    }

    /// Try to receive a message without waiting
    ///
    /// Does not consult the current job, as it is not a suspension point.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.channel.lock().try_recv()
    }

    /// Blocking iterator over received messages
    ///
    /// Each call to `next` blocks the calling thread. Ends at the end of the stream, or at the
    /// first error, which is then available from [`Iter::error`].
    pub fn iter(&self) -> Iter<'_, T> {
        Iter::new(self)
    }

    /// Convert into a [`Stream`](futures::stream::Stream) of received messages
    ///
    /// Ends at the end of the stream, or at the first error, which is then available from
    /// [`RecvStream::error`].
    #[cfg(feature = "futures")]
    pub fn into_stream(self) -> RecvStream<T> {
        RecvStream::new(self)
    }

    /// Cancel the channel
    ///
    /// Closes it with a cancellation cause and discards buffered messages. Returns whether this
    /// call closed the channel, as opposed to it already being closed.
    pub fn cancel(&self) -> bool {
        cancel(&self.channel)
    }

    /// Whether the channel is closed and drained, so that no receive can ever succeed again
    pub fn is_closed(&self) -> bool {
        if !self.channel.is_closed() {
            return false;
        }
        self.channel.lock().len() == 0
    }

    /// Whether there are no buffered messages
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.channel.lock().len()
    }

    /// The channel's capacity
    pub fn capacity(&self) -> Capacity {
        self.channel.capacity()
    }

    #[cfg(test)]
    pub(crate) fn waiting_receivers(&self) -> usize {
        self.channel.lock().waiting_receivers()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver { channel: clone_receiver(&self.channel) }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        drop_receiver(&self.channel);
    }
}

impl<T> Debug for Receiver<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("channel", &self.channel.id())
            .field("capacity", &self.channel.capacity())
            .field("closed", &self.channel.is_closed())
            .finish()
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}


// future types for channels.
pub(crate) mod future {
    use super::*;
    use crate::{
        channel::wait_queue::WaiterKey,
        context::Context,
        continuation::{Continuation, Resumption},
        coroutine::Launched,
        job::{CancellationError, CancelHandle},
        polling::{Timeout, poll},
        suspend::{suspend_with, Suspended, Suspension},
    };
    use std::{
        future::Future,
        iter::FusedIterator,
        mem,
        pin::Pin,
        task::{self, Poll, ready},
        time::{Duration, Instant},
    };

    // wrap a suspended operation for storage in a wait queue. a launched coroutine's waker already
    // schedules it through its dispatcher, so it is resumed directly rather than dispatched twice.
    fn intercept<T, E>(suspended: Suspended<T, E>) -> Resumption<Suspended<T, E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        if suspended.context().contains::<Launched>() {
            Resumption::Direct(suspended)
        } else {
            Resumption::intercept(suspended)
        }
    }

    // fail fast if the current job is inactive.
    fn check_job(context: &Context) -> Result<(), CancellationError> {
        match context.job() {
            Some(job) if !job.is_active() => Err(job.inactive_cancellation_error()),
            _ => Ok(()),
        }
    }

    /// Future for sending into a [`Sender`]
    ///
    /// The send is attempted when this future is first polled, at which point an inactive
    /// current job fails it with a cancellation error. If no receiver or buffer space is
    /// available, the sender waits in FIFO order. While it waits, cancelling the current job
    /// removes it from the queue and fails it with a cancellation error.
    ///
    /// Once a receiver has taken the message, the send is committed: it succeeds even if the
    /// job is cancelled before the suspended sender is resumed.
    ///
    /// Dropping this future before the message is committed rescinds the send. For purposes of
    /// reference-counting senders, this future counts as a sender until it is dropped.
    pub struct SendFut<T> {
        sender: Sender<T>,
        state: SendState<T>,
    }

    enum SendState<T> {
        // not yet polled.
        Init(T),
        // suspended. key is none once the waiter has been taken out of the queue.
        Waiting {
            key: Option<WaiterKey>,
            suspension: Suspension<(), SendError<T>>,
            _cancel: Option<CancelHandle>,
        },
        // resolved or rescinded.
        Done,
    }

    // the message is never pinned.
    impl<T> Unpin for SendFut<T> {}

    impl<T> SendFut<T> {
        pub(super) fn new(sender: Sender<T>, msg: T) -> Self {
            SendFut { sender, state: SendState::Init(msg) }
        }

        /// If the message has not yet been committed, abort the send operation and rescind the
        /// message
        ///
        /// Returns `None` if this future already resolved or rescinded, or if a receiver has
        /// already taken the message, in which case this future still resolves to the outcome.
        pub fn rescind(&mut self) -> Option<T> {
            match mem::replace(&mut self.state, SendState::Done) {
                SendState::Init(msg) => Some(msg),
                SendState::Waiting { key: Some(key), suspension, _cancel } => {
                    let waiter = self.sender.channel.lock().remove_send_waiter(key);
                    match waiter {
                        Some(waiter) => {
                            trace!(channel = self.sender.channel.id(), "rescinded send");
                            drop(suspension);
                            drop(waiter.resume);
                            Some(waiter.msg)
                        }
                        None => {
                            self.state = SendState::Waiting { key: None, suspension, _cancel };
                            None
                        }
                    }
                }
                state => {
                    self.state = state;
                    None
                }
            }
        }

        /// Whether this future has already resolved or rescinded
        pub fn is_terminated(&self) -> bool {
            matches!(self.state, SendState::Done)
        }
    }

    impl<T: Send + 'static> SendFut<T> {
        // first poll. returns none if the sender is now waiting.
        fn begin(&mut self, msg: T) -> Option<Result<(), SendError<T>>> {
            let context = Context::current();
            if let Err(e) = check_job(&context) {
                return Some(Err(SendError { msg, cause: e.into() }));
            }

            let channel = &self.sender.channel;
            let mut lock = channel.lock();
            let msg = match lock.try_send(msg) {
                Ok(()) => return Some(Ok(())),
                Err(TrySendError { msg, cause: TrySendErrorCause::WouldBlock(_) }) => msg,
                Err(TrySendError { msg, cause: TrySendErrorCause::Terminal(cause) }) => {
                    return Some(Err(SendError { msg, cause }));
                }
            };

            let (suspended, suspension) = suspend_with::<(), SendError<T>>(context.clone());
            let resumption = intercept(suspended);
            let key = lock.push_send_waiter(msg, Box::new(move |result| {
                resumption.resume_with(result)
            }));
            drop(lock);

            // registered after unlocking, as it runs right away if the job was just cancelled
            let cancel = context.job().map(|job| {
                let channel = channel.downgrade();
                job.on_cancel(move |error| {
                    if let Some(channel) = channel.upgrade() {
                        channel.cancel_send_waiter(key, error);
                    }
                })
            });
            self.state = SendState::Waiting { key: Some(key), suspension, _cancel: cancel };
            None
        }

        /// Try to resolve this future immediately without blocking
        ///
        /// If the send cannot complete immediately it is rescinded and the message is handed
        /// back in the [`WouldBlockError`]. Either way this future is then terminated. This method
        /// will panic if this future has already resolved or rescinded.
        pub fn try_now(&mut self) -> Result<(), TrySendError<T>> {
            assert!(!self.is_terminated(), "SendFut.try_now called after terminated");
            self.block_with(Timeout::NonBlocking)
        }

        /// Block until this future resolves
        ///
        /// This method will panic if this future has already resolved or rescinded.
        pub fn block(&mut self) -> Result<(), SendError<T>> {
            assert!(!self.is_terminated(), "SendFut.block called after terminated");
            match poll(&mut *self, Timeout::Never) {
                Some(result) => result,
                None => unreachable!("poll timed out with Timeout::Never"),
            }
        }

        /// Block until this future resolves or a timeout elapses
        ///
        /// On timeout the send is rescinded as in [`try_now`](Self::try_now). This method will
        /// panic if this future has already resolved or rescinded.
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<(), TrySendError<T>> {
            self.block_deadline(Instant::now() + timeout)
        }

        /// Block until this future resolves or the deadline is reached
        ///
        /// On timeout the send is rescinded as in [`try_now`](Self::try_now). This method will
        /// panic if this future has already resolved or rescinded.
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<(), TrySendError<T>> {
            assert!(!self.is_terminated(), "SendFut.block_deadline called after terminated");
            self.block_with(Timeout::At(deadline))
        }

        fn block_with(&mut self, timeout: Timeout) -> Result<(), TrySendError<T>> {
            if let Some(result) = poll(&mut *self, timeout) {
                return result.map_err(TrySendError::from);
            }
            match self.rescind() {
                Some(msg) => Err(TrySendError { msg, cause: WouldBlockError.into() }),
                // already committed, the resumption is in flight
                None => self.block().map_err(TrySendError::from),
            }
        }
    }

    impl<T: Send + 'static> Future for SendFut<T> {
        type Output = Result<(), SendError<T>>;

        fn poll(self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            loop {
                match &mut this.state {
                    SendState::Init(_) => {
                        let SendState::Init(msg) = mem::replace(&mut this.state, SendState::Done)
                            else { unreachable!() };
                        if let Some(result) = this.begin(msg) {
                            return Poll::Ready(result);
                        }
                    }
                    SendState::Waiting { suspension, .. } => {
                        let result = ready!(Pin::new(suspension).poll(cx));
                        this.state = SendState::Done;
                        return Poll::Ready(result);
                    }
                    // for implementation of FusedFuture
                    SendState::Done => return Poll::Pending,
                }
            }
        }
    }

    #[cfg(feature = "futures")]
    impl<T: Send + 'static> futures::future::FusedFuture for SendFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl<T> Drop for SendFut<T> {
        fn drop(&mut self) {
            if let SendState::Waiting { key: Some(key), .. } = self.state {
                let waiter = self.sender.channel.lock().remove_send_waiter(key);
                drop(waiter);
            }
        }
    }

    impl<T> Debug for SendFut<T> {
        fn fmt(&self, f: &mut Formatter) -> fmt::Result {
            let state = match &self.state {
                SendState::Init(_) => "init",
                SendState::Waiting { key: Some(_), .. } => "waiting",
                SendState::Waiting { key: None, .. } => "committed",
                SendState::Done => "done",
            };
            f.debug_struct("SendFut").field("state", &state).finish_non_exhaustive()
        }
    }


    /// Future for receiving from a [`Receiver`]
    ///
    /// The receive is attempted when this future is first polled, at which point an inactive
    /// current job fails it with a cancellation error. If no message is available, the receiver
    /// waits in FIFO order. While it waits, cancelling the current job removes it from the queue
    /// and fails it with a cancellation error.
    ///
    /// Once a sender has handed it a message, the receive is committed: it succeeds even if the
    /// job is cancelled before the suspended receiver is resumed. If this future is dropped
    /// after the receive was committed but before it resolved, the message goes back to the
    /// channel.
    ///
    /// For purposes of reference-counting receivers, this future counts as a receiver until it
    /// is dropped.
    pub struct RecvFut<T> {
        receiver: Receiver<T>,
        state: RecvState<T>,
    }

    enum RecvState<T> {
        // not yet polled.
        Init,
        // suspended. key is none once the waiter has been taken out of the queue.
        Waiting {
            key: Option<WaiterKey>,
            suspension: Suspension<T, RecvError>,
            _cancel: Option<CancelHandle>,
        },
        // resolved or aborted.
        Done,
    }

    impl<T> RecvFut<T> {
        pub(super) fn new(receiver: Receiver<T>) -> Self {
            RecvFut { receiver, state: RecvState::Init }
        }

        /// Try to abort this receive operation
        ///
        /// Returns false if this future already resolved or aborted, or if a sender has already
        /// handed it a message, in which case this future still resolves to that message.
        pub fn abort(&mut self) -> bool {
            match mem::replace(&mut self.state, RecvState::Done) {
                RecvState::Init => true,
                RecvState::Waiting { key: Some(key), suspension, _cancel } => {
                    let resume = self.receiver.channel.lock().remove_recv_waiter(key);
                    match resume {
                        Some(resume) => {
                            trace!(channel = self.receiver.channel.id(), "aborted receive");
                            drop(suspension);
                            drop(resume);
                            true
                        }
                        None => {
                            self.state = RecvState::Waiting { key: None, suspension, _cancel };
                            false
                        }
                    }
                }
                state => {
                    self.state = state;
                    false
                }
            }
        }

        /// Whether this future has already resolved or aborted
        pub fn is_terminated(&self) -> bool {
            matches!(self.state, RecvState::Done)
        }
    }

    impl<T: Send + 'static> RecvFut<T> {
        // first poll. returns none if the receiver is now waiting.
        fn begin(&mut self) -> Option<Result<T, RecvError>> {
            let context = Context::current();
            if let Err(e) = check_job(&context) {
                return Some(Err(e.into()));
            }

            let channel = &self.receiver.channel;
            let mut lock = channel.lock();
            match lock.try_recv() {
                Ok(msg) => return Some(Ok(msg)),
                Err(TryRecvError::Terminal(e)) => return Some(Err(e)),
                Err(TryRecvError::WouldBlock(_)) => (),
            }

            let (mut suspended, suspension) = suspend_with::<T, RecvError>(context.clone());
            let weak = channel.downgrade();
            suspended.on_undelivered(move |msg| {
                if let Some(channel) = weak.upgrade() {
                    channel.restore(msg);
                }
            });
            let resumption = intercept(suspended);
            let key = lock.push_recv_waiter(Box::new(move |result| {
                resumption.resume_with(result)
            }));
            drop(lock);

            // registered after unlocking, as it runs right away if the job was just cancelled
            let cancel = context.job().map(|job| {
                let channel = channel.downgrade();
                job.on_cancel(move |error| {
                    if let Some(channel) = channel.upgrade() {
                        channel.cancel_recv_waiter(key, error);
                    }
                })
            });
            self.state = RecvState::Waiting { key: Some(key), suspension, _cancel: cancel };
            None
        }

        /// Try to resolve this future immediately without blocking
        ///
        /// If no message is available immediately the receive is aborted, and this future is
        /// then terminated. This method will panic if this future has already resolved or
        /// aborted.
        pub fn try_now(&mut self) -> Result<T, TryRecvError> {
            assert!(!self.is_terminated(), "RecvFut.try_now called after terminated");
            self.block_with(Timeout::NonBlocking)
        }

        /// Block until this future resolves
        ///
        /// This method will panic if this future has already resolved or aborted.
        pub fn block(&mut self) -> Result<T, RecvError> {
            assert!(!self.is_terminated(), "RecvFut.block called after terminated");
            match poll(&mut *self, Timeout::Never) {
                Some(result) => result,
                None => unreachable!("poll timed out with Timeout::Never"),
            }
        }

        /// Block until this future resolves or a timeout elapses
        ///
        /// On timeout the receive is aborted as in [`try_now`](Self::try_now). This method will
        /// panic if this future has already resolved or aborted.
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<T, TryRecvError> {
            self.block_deadline(Instant::now() + timeout)
        }

        /// Block until this future resolves or the deadline is reached
        ///
        /// On timeout the receive is aborted as in [`try_now`](Self::try_now). This method will
        /// panic if this future has already resolved or aborted.
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<T, TryRecvError> {
            assert!(!self.is_terminated(), "RecvFut.block_deadline called after terminated");
            self.block_with(Timeout::At(deadline))
        }

        fn block_with(&mut self, timeout: Timeout) -> Result<T, TryRecvError> {
            if let Some(result) = poll(&mut *self, timeout) {
                return result.map_err(TryRecvError::from);
            }
            if self.abort() {
                Err(WouldBlockError.into())
            } else {
                // already committed, the resumption is in flight
                self.block().map_err(TryRecvError::from)
            }
        }
    }

    impl<T: Send + 'static> Future for RecvFut<T> {
        type Output = Result<T, RecvError>;

        fn poll(self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            loop {
                match &mut this.state {
                    RecvState::Init => {
                        this.state = RecvState::Done;
                        if let Some(result) = this.begin() {
                            return Poll::Ready(result);
                        }
                    }
                    RecvState::Waiting { suspension, .. } => {
                        let result = ready!(Pin::new(suspension).poll(cx));
                        this.state = RecvState::Done;
                        return Poll::Ready(result);
                    }
                    // for implementation of FusedFuture
                    RecvState::Done => return Poll::Pending,
                }
            }
        }
    }

    #[cfg(feature = "futures")]
    impl<T: Send + 'static> futures::future::FusedFuture for RecvFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl<T> Drop for RecvFut<T> {
        fn drop(&mut self) {
            if let RecvState::Waiting { key: Some(key), .. } = self.state {
                let resume = self.receiver.channel.lock().remove_recv_waiter(key);
                drop(resume);
            }
        }
    }

    impl<T> Debug for RecvFut<T> {
        fn fmt(&self, f: &mut Formatter) -> fmt::Result {
            let state = match &self.state {
                RecvState::Init => "init",
                RecvState::Waiting { key: Some(_), .. } => "waiting",
                RecvState::Waiting { key: None, .. } => "committed",
                RecvState::Done => "done",
            };
            f.debug_struct("RecvFut").field("state", &state).finish_non_exhaustive()
        }
    }


    // map the end of the stream to none.
    fn or_none<T>(result: Result<T, RecvError>) -> Result<Option<T>, RecvError> {
        match result {
            Ok(msg) => Ok(Some(msg)),
            Err(e) if e.is_end_of_stream() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn try_or_none<T>(result: Result<T, TryRecvError>) -> Result<Option<T>, TryRecvError> {
        match result {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Terminal(e)) => or_none(Err(e)).map_err(TryRecvError::from),
            Err(e) => Err(e),
        }
    }

    /// Future for receiving from a [`Receiver`], resolving to `Ok(None)` at the end of the stream
    ///
    /// Otherwise behaves as [`RecvFut`].
    #[derive(Debug)]
    pub struct RecvOrNoneFut<T>(pub(super) RecvFut<T>);

    impl<T> RecvOrNoneFut<T> {
        /// Try to abort this receive operation, as in [`RecvFut::abort`]
        pub fn abort(&mut self) -> bool {
            self.0.abort()
        }

        /// Whether this future has already resolved or aborted
        pub fn is_terminated(&self) -> bool {
            self.0.is_terminated()
        }
    }

    impl<T: Send + 'static> RecvOrNoneFut<T> {
        /// Try to resolve this future immediately without blocking, as in [`RecvFut::try_now`]
        pub fn try_now(&mut self) -> Result<Option<T>, TryRecvError> {
            try_or_none(self.0.try_now())
        }

        /// Block until this future resolves, as in [`RecvFut::block`]
        pub fn block(&mut self) -> Result<Option<T>, RecvError> {
            or_none(self.0.block())
        }

        /// Block until this future resolves or a timeout elapses, as in
        /// [`RecvFut::block_timeout`]
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<Option<T>, TryRecvError> {
            try_or_none(self.0.block_timeout(timeout))
        }

        /// Block until this future resolves or the deadline is reached, as in
        /// [`RecvFut::block_deadline`]
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<Option<T>, TryRecvError> {
            try_or_none(self.0.block_deadline(deadline))
        }
    }

    impl<T: Send + 'static> Future for RecvOrNoneFut<T> {
        type Output = Result<Option<T>, RecvError>;

        fn poll(self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Self::Output> {
            Pin::new(&mut self.get_mut().0).poll(cx).map(or_none)
        }
    }

    #[cfg(feature = "futures")]
    impl<T: Send + 'static> futures::future::FusedFuture for RecvOrNoneFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }


    /// Blocking iterator over messages received from a [`Receiver`]
    pub struct Iter<'a, T> {
        receiver: &'a Receiver<T>,
        done: bool,
        error: Option<RecvError>,
    }

    impl<'a, T> Iter<'a, T> {
        pub(super) fn new(receiver: &'a Receiver<T>) -> Self {
            Iter { receiver, done: false, error: None }
        }

        /// The error that ended iteration, if it ended otherwise than at the end of the stream
        pub fn error(&self) -> Option<&RecvError> {
            self.error.as_ref()
        }
    }

    impl<'a, T: Send + 'static> Iterator for Iter<'a, T> {
        type Item = T;

        fn next(&mut self) -> Option<T> {
            if self.done {
                return None;
            }
            match self.receiver.recv_or_none().block() {
                Ok(Some(msg)) => Some(msg),
                Ok(None) => {
                    self.done = true;
                    None
                }
                Err(e) => {
                    self.done = true;
                    self.error = Some(e);
                    None
                }
            }
        }
    }

    impl<'a, T: Send + 'static> FusedIterator for Iter<'a, T> {}


    /// [`Stream`](futures::stream::Stream) of messages received from a [`Receiver`]
    #[cfg(feature = "futures")]
    pub struct RecvStream<T> {
        receiver: Receiver<T>,
        fut: Option<RecvOrNoneFut<T>>,
        done: bool,
        error: Option<RecvError>,
    }

    #[cfg(feature = "futures")]
    impl<T> RecvStream<T> {
        pub(super) fn new(receiver: Receiver<T>) -> Self {
            RecvStream { receiver, fut: None, done: false, error: None }
        }

        /// The error that ended the stream, if it ended otherwise than at the end of the stream
        pub fn error(&self) -> Option<&RecvError> {
            self.error.as_ref()
        }
    }

    #[cfg(feature = "futures")]
    impl<T: Send + 'static> futures::stream::Stream for RecvStream<T> {
        type Item = T;

        fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Option<T>> {
            let this = self.get_mut();
            if this.done {
                return Poll::Ready(None);
            }
            let fut = this.fut.get_or_insert_with(|| this.receiver.recv_or_none());
            let result = ready!(Pin::new(fut).poll(cx));
            this.fut = None;
            match result {
                Ok(Some(msg)) => Poll::Ready(Some(msg)),
                Ok(None) => {
                    this.done = true;
                    Poll::Ready(None)
                }
                Err(e) => {
                    this.done = true;
                    this.error = Some(e);
                    Poll::Ready(None)
                }
            }
        }
    }

    #[cfg(feature = "futures")]
    impl<T: Send + 'static> futures::stream::FusedStream for RecvStream<T> {
        fn is_terminated(&self) -> bool {
            self.done
        }
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::Context,
        job::Job,
        polling::{poll, Timeout},
    };
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::{
        collections::HashMap,
        thread,
        time::{Duration, Instant},
    };

    fn wait_until(what: &str, f: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting until {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn waiting_receivers<T>(recv: &Receiver<T>) -> usize {
        recv.waiting_receivers()
    }

    fn waiting_senders<T>(send: &Sender<T>) -> usize {
        send.channel.lock().waiting_senders()
    }

    #[test]
    fn basic_1000_test() {
        let (send, recv) = bounded(500);

        let join_1 = thread::spawn(move || {
            for i in 1..=1000 {
                send.send(i).block_timeout(Duration::from_millis(100)).unwrap();
                if i < 1000 && i % 100 == 0 {
                    thread::sleep(Duration::from_millis(20));
                }
            }
        });
        let join_2 = thread::spawn(move || {
            for i in 1..=1000 {
                let j = recv.recv().block_timeout(Duration::from_millis(200)).unwrap();
                assert_eq!(i, j);
            }
            assert!(recv.recv_or_none().block_timeout(Duration::from_secs(1)).unwrap().is_none());
        });
        join_1.join().unwrap();
        join_2.join().unwrap();
    }

    #[test]
    fn rendezvous_send_waits_for_receiver() {
        let (send, recv) = rendezvous();
        assert!(send.send(0).try_now().unwrap_err().is_would_block());

        let sender = thread::spawn(move || {
            send.send(1).block().unwrap();
            Instant::now()
        });
        wait_until("sender waits", || recv.channel.lock().waiting_senders() == 1);
        thread::sleep(Duration::from_millis(20));
        let recv_started = Instant::now();
        assert_eq!(recv.recv().block().unwrap(), 1);
        let sent = sender.join().unwrap();
        assert!(sent >= recv_started);
        assert!(recv.is_empty());
    }

    #[test]
    fn exactly_once_across_receive_styles() {
        const N: u32 = 50_000;
        for capacity in [Capacity::Rendezvous, Capacity::Bounded(16), Capacity::Unbounded] {
            let (send, recv) = channel(capacity);
            let mut receivers = Vec::new();
            for style in 0..6 {
                let recv = recv.clone();
                receivers.push(thread::spawn(move || {
                    let mut got = Vec::new();
                    match style % 3 {
                        0 => loop {
                            match recv.recv().block() {
                                Ok(i) => got.push(i),
                                Err(e) => {
                                    assert!(e.is_end_of_stream(), "{}", e);
                                    break;
                                }
                            }
                        },
                        1 => while let Some(i) = recv.recv_or_none().block().unwrap() {
                            got.push(i);
                        },
                        _ => {
                            let mut iter = recv.iter();
                            got.extend(&mut iter);
                            assert!(iter.error().is_none());
                        }
                    }
                    got
                }));
            }
            drop(recv);

            for i in 0..N {
                send.send(i).block().unwrap();
            }
            drop(send);

            let mut all = receivers.into_iter()
                .flat_map(|receiver| receiver.join().unwrap())
                .collect::<Vec<_>>();
            all.sort_unstable();
            assert_eq!(all.len(), N as usize, "{:?}", capacity);
            assert!(all.iter().copied().eq(0..N), "{:?}", capacity);
        }
    }

    #[test]
    fn fairness_on_rendezvous() {
        const N: usize = 20_000;
        const RECEIVERS: usize = 4;
        let (send, recv) = rendezvous::<usize>();
        let receivers = (0..RECEIVERS)
            .map(|_| {
                let recv = recv.clone();
                thread::spawn(move || recv.iter().count())
            })
            .collect::<Vec<_>>();
        drop(recv);
        for i in 0..N {
            send.send(i).block().unwrap();
        }
        drop(send);
        let shares = receivers.into_iter()
            .map(|receiver| receiver.join().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(shares.iter().sum::<usize>(), N);
        for &share in &shares {
            assert!(share > N / RECEIVERS / 2, "unfair shares: {:?}", shares);
        }
    }

    #[test]
    fn close_is_idempotent_and_wakes_waiters_once() {
        let (send, recv) = rendezvous::<u32>();
        let receivers = (0..3)
            .map(|_| {
                let recv = recv.clone();
                thread::spawn(move || {
                    let first = recv.recv().block();
                    (first, recv.recv().try_now())
                })
            })
            .collect::<Vec<_>>();
        wait_until("receivers wait", || waiting_receivers(&recv) == 3);

        let (send_2, recv_2) = rendezvous::<u32>();
        let sender = thread::spawn(move || send_2.send(5).block());
        let recv_2_handle = recv_2.clone();
        wait_until("sender waits", || recv_2_handle.channel.lock().waiting_senders() == 1);

        assert!(send.close());
        assert!(!send.close());
        assert!(send.is_closed());
        for receiver in receivers {
            let (first, second) = receiver.join().unwrap();
            assert!(first.unwrap_err().is_end_of_stream());
            assert!(matches!(second, Err(TryRecvError::Terminal(ref e)) if e.is_end_of_stream()));
        }
        assert_eq!(waiting_receivers(&recv), 0);

        recv_2.channel.lock().close(None, false);
        let error = sender.join().unwrap().unwrap_err();
        assert_eq!(error.msg, 5);
        assert!(matches!(error.cause, SendErrorCause::Closed(ClosedSendError { cause: None })));
    }

    #[test]
    fn close_with_cause_reaches_waiters() {
        let (send, recv) = unbounded::<u32>();
        let waiter = {
            let recv = recv.clone();
            thread::spawn(move || recv.recv_or_none().block())
        };
        wait_until("receiver waits", || waiting_receivers(&recv) == 1);
        assert!(send.close_with(anyhow::anyhow!("upstream failed")));

        match waiter.join().unwrap() {
            Err(RecvError::Closed(ClosedReceiveError { cause: Some(cause) })) => {
                assert_eq!(cause.to_string(), "upstream failed");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let error = send.try_send(1).unwrap_err();
        assert_eq!(error.msg, 1);
        assert!(matches!(
            error.cause,
            TrySendErrorCause::Terminal(SendErrorCause::Closed(ClosedSendError { cause: Some(_) })),
        ));
    }

    #[test]
    fn buffered_messages_survive_close() {
        let (send, recv) = unbounded();
        send.send(1).block().unwrap();
        send.try_send(2).unwrap();
        send.close();
        assert!(!recv.is_closed());
        assert_eq!(recv.len(), 2);
        let mut iter = recv.iter();
        assert_eq!(iter.by_ref().collect::<Vec<_>>(), vec![1, 2]);
        assert!(iter.error().is_none());
        assert_eq!(iter.next(), None);
        assert!(recv.is_closed());
        assert_eq!(recv.recv_or_none().block().unwrap(), None);
    }

    #[test]
    fn last_sender_drop_closes() {
        let (send, recv) = bounded::<u32>(4);
        let send_2 = send.clone();
        drop(send);
        assert!(!send_2.is_closed());
        send_2.send(1).block().unwrap();
        drop(send_2);
        assert_eq!(recv.recv().block().unwrap(), 1);
        assert!(recv.recv().block().unwrap_err().is_end_of_stream());
    }

    #[test]
    fn last_receiver_drop_cancels() {
        let (send, recv) = bounded::<u32>(1);
        send.try_send(1).unwrap();
        let waiting = {
            let send = send.clone();
            thread::spawn(move || send.send(2).block())
        };
        wait_until("sender waits", || waiting_senders(&send) == 1);
        let recv_2 = recv.clone();
        drop(recv);
        assert!(!send.is_closed());
        drop(recv_2);
        assert!(send.is_closed());

        let error = waiting.join().unwrap().unwrap_err();
        assert_eq!(error.msg, 2);
        assert!(matches!(error.cause, SendErrorCause::Closed(ClosedSendError { cause: Some(_) })));
        assert_eq!(send.channel.lock().len(), 0);
    }

    #[test]
    fn receiver_cancel_discards_buffer() {
        let (send, recv) = unbounded();
        send.try_send(1).unwrap();
        send.try_send(2).unwrap();
        assert!(recv.cancel());
        assert!(!recv.cancel());
        assert!(recv.is_empty());
        assert!(recv.is_closed());
        match recv.try_recv() {
            Err(TryRecvError::Terminal(RecvError::Closed(ClosedReceiveError { cause }))) => {
                assert_eq!(cause.unwrap().to_string(), "channel was cancelled");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn job_cancellation_removes_waiting_receiver() {
        let (send, recv) = rendezvous::<u32>();
        let job = Job::new();
        let waiter = {
            let recv = recv.clone();
            let job = job.clone();
            thread::spawn(move || {
                let _guard = Context::empty().with(job).enter();
                recv.recv().block()
            })
        };
        wait_until("receiver waits", || waiting_receivers(&recv) == 1);
        assert!(job.cancel_with_reason("test cancel"));

        match waiter.join().unwrap() {
            Err(RecvError::Cancelled(cancellation)) => {
                assert_eq!(cancellation.job(), job.id());
                assert_eq!(cancellation.reason(), "test cancel");
            }
            other => panic!("unexpected: {:?}", other),
        }

        // the cancelled receiver is no longer a pairing target
        assert_eq!(waiting_receivers(&recv), 0);
        assert!(send.try_send(1).unwrap_err().is_would_block());
    }

    #[test]
    fn job_cancellation_hands_message_back_to_sender() {
        let (send, recv) = rendezvous::<String>();
        let job = Job::new();
        let waiter = {
            let send = send.clone();
            let job = job.clone();
            thread::spawn(move || {
                let _guard = Context::empty().with(job).enter();
                send.send("hello".to_owned()).block()
            })
        };
        wait_until("sender waits", || waiting_senders(&send) == 1);
        job.cancel();

        let error = waiter.join().unwrap().unwrap_err();
        assert_eq!(error.msg, "hello");
        assert!(matches!(error.cause, SendErrorCause::Cancelled(_)));
        assert_eq!(waiting_senders(&send), 0);
        assert!(matches!(recv.try_recv(), Err(TryRecvError::WouldBlock(_))));
    }

    #[test]
    fn inactive_job_fails_at_suspension() {
        let (send, recv) = unbounded::<u32>();
        send.try_send(1).unwrap();
        let job = Job::new();
        job.cancel();
        let _guard = Context::empty().with(job).enter();
        assert!(recv.recv().block().unwrap_err().is_cancelled());
        let error = send.send(2).block().unwrap_err();
        assert!(matches!(error.cause, SendErrorCause::Cancelled(_)));
        // non-suspending operations do not consult the job
        assert_eq!(recv.try_recv().unwrap(), 1);
    }

    #[test]
    fn dropping_pending_send_rescinds_it() {
        let (send, recv) = rendezvous::<u32>();
        let mut fut = send.send(1);
        assert!(poll(&mut fut, Timeout::NonBlocking).is_none());
        assert_eq!(waiting_senders(&send), 1);
        drop(fut);
        assert_eq!(waiting_senders(&send), 0);
        assert!(matches!(recv.try_recv(), Err(TryRecvError::WouldBlock(_))));

        let mut fut = send.send(2);
        assert!(poll(&mut fut, Timeout::NonBlocking).is_none());
        assert_eq!(fut.rescind(), Some(2));
        assert!(fut.is_terminated());
        assert_eq!(fut.rescind(), None);
    }

    #[test]
    fn rescind_after_commit_still_resolves() {
        let (send, recv) = rendezvous::<u32>();
        let mut fut = send.send(3);
        assert!(poll(&mut fut, Timeout::NonBlocking).is_none());
        assert_eq!(recv.try_recv().unwrap(), 3);
        assert_eq!(fut.rescind(), None);
        assert!(!fut.is_terminated());
        fut.block().unwrap();
    }

    #[test]
    fn dropped_receive_returns_committed_message() {
        let (send, recv) = unbounded::<u32>();
        let mut fut = recv.recv();
        assert!(poll(&mut fut, Timeout::NonBlocking).is_none());
        assert_eq!(waiting_receivers(&recv), 1);
        // paired with the waiting receiver rather than buffered
        send.try_send(9).unwrap();
        assert!(recv.is_empty());
        assert!(!fut.abort());
        drop(fut);
        assert_eq!(recv.try_recv().unwrap(), 9);
    }

    #[test]
    fn dropped_receive_after_end_of_stream_does_not_resurrect() {
        let (send, recv) = rendezvous::<u32>();
        let mut fut = recv.recv();
        assert!(poll(&mut fut, Timeout::NonBlocking).is_none());
        send.try_send(9).unwrap();
        send.close();

        let other = recv.clone();
        assert!(matches!(
            other.try_recv(),
            Err(TryRecvError::Terminal(ref e)) if e.is_end_of_stream(),
        ));
        assert!(other.is_closed());
        drop(fut);
        assert!(other.is_closed());
        assert!(matches!(other.try_recv(), Err(TryRecvError::Terminal(_))));
    }

    #[test]
    fn aborted_receive_is_not_paired() {
        let (send, recv) = rendezvous::<u32>();
        let mut fut = recv.recv();
        assert!(poll(&mut fut, Timeout::NonBlocking).is_none());
        assert!(fut.abort());
        assert!(fut.is_terminated());
        assert!(send.try_send(1).unwrap_err().is_would_block());
    }

    #[test]
    fn conflated_keeps_latest() {
        let (send, recv) = conflated();
        for i in 0..3 {
            send.send(i).try_now().unwrap();
        }
        assert_eq!(recv.len(), 1);
        assert_eq!(recv.recv().try_now().unwrap(), 2);
        assert!(matches!(recv.recv().try_now(), Err(TryRecvError::WouldBlock(_))));
        assert_eq!(send.capacity(), Capacity::Conflated);
    }

    #[test]
    fn block_timeout_leaves_no_waiter() {
        let (send, recv) = bounded::<u32>(1);
        let start = Instant::now();
        let error = recv.recv().block_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(error, TryRecvError::WouldBlock(_)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(waiting_receivers(&recv), 0);

        send.try_send(1).unwrap();
        let error = send.send(2).block_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(error.is_would_block());
        assert_eq!(error.msg, 2);
        assert_eq!(waiting_senders(&send), 0);
    }

    #[test]
    fn capacity_from_number() {
        assert_eq!(Capacity::from(0), Capacity::Rendezvous);
        assert_eq!(Capacity::from(3), Capacity::Bounded(3));
        assert_eq!(bounded::<()>(0).0.capacity(), Capacity::Rendezvous);
    }

    #[cfg(feature = "futures")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_on_tokio() {
        use futures::stream::StreamExt;

        let (send, recv) = bounded(4);
        let producer = tokio::spawn(async move {
            for i in 0..100 {
                send.send(i).await.unwrap();
            }
        });
        let mut stream = recv.into_stream();
        let got = (&mut stream).collect::<Vec<_>>().await;
        producer.await.unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        assert!(stream.error().is_none());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn randomized_interleavings() {
        const PER_SENDER: u32 = 300;
        for seed in 0..8 {
            let mut rng = Pcg32::seed_from_u64(seed);
            let capacity = match rng.gen_range(0..3) {
                0 => Capacity::Rendezvous,
                1 => Capacity::Bounded(rng.gen_range(1..8)),
                _ => Capacity::Unbounded,
            };
            let sender_count = rng.gen_range(1..4);
            let receivers = rng.gen_range(1..4);
            let (send, recv) = channel::<(usize, u32)>(capacity);

            let receivers = (0..receivers)
                .map(|_| {
                    let recv = recv.clone();
                    let patient = rng.gen_bool(0.5);
                    thread::spawn(move || {
                        let mut got = Vec::new();
                        loop {
                            let result = if patient {
                                recv.recv_or_none().block()
                            } else {
                                match recv.recv_or_none().try_now() {
                                    Ok(msg) => Ok(msg),
                                    Err(TryRecvError::WouldBlock(_)) => {
                                        thread::yield_now();
                                        continue;
                                    }
                                    Err(TryRecvError::Terminal(e)) => Err(e),
                                }
                            };
                            match result.unwrap() {
                                Some(msg) => got.push(msg),
                                None => break got,
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();
            drop(recv);

            let senders = (0..sender_count)
                .map(|id| {
                    let send = send.clone();
                    let mut rng = Pcg32::seed_from_u64(seed * 100 + id as u64);
                    thread::spawn(move || {
                        for i in 0..PER_SENDER {
                            let mut msg = (id, i);
                            loop {
                                let result = match rng.gen_range(0..3) {
                                    0 => send.send(msg).block().map_err(TrySendError::from),
                                    1 => send.try_send(msg),
                                    _ => send.send(msg).block_timeout(Duration::from_micros(50)),
                                };
                                match result {
                                    Ok(()) => break,
                                    Err(e) if e.is_would_block() => {
                                        msg = e.msg;
                                        thread::yield_now();
                                    }
                                    Err(e) => panic!("send failed: {}", e),
                                }
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();
            drop(send);
            for sender in senders {
                sender.join().unwrap();
            }

            let mut counts = HashMap::new();
            for receiver in receivers {
                let got = receiver.join().unwrap();
                // each receiver sees any one sender's messages in order
                let mut last = HashMap::new();
                for &(id, i) in &got {
                    if let Some(prev) = last.insert(id, i) {
                        assert!(prev < i, "seed {}: out of order", seed);
                    }
                    *counts.entry((id, i)).or_insert(0) += 1;
                }
            }
            assert_eq!(counts.len(), sender_count * PER_SENDER as usize, "seed {}", seed);
            assert!(counts.values().all(|&n| n == 1), "seed {}: duplicate delivery", seed);
        }
    }
}
