// minimal safe API for the channel. the exposed API is a convenience wrapper around this.
//
// all mutation happens under one mutex. resumptions of waiters taken out of the queues during a
// lock, as well as values being discarded, are deferred until the lock is released, so that
// nothing they do can re-enter the channel while it is locked.

use super::{
    error::*,
    wait_queue::{WaitQueue, WaiterKey},
};
use crate::job::CancellationError;
use smallvec::SmallVec;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{
            Ordering::{Acquire, Relaxed, Release},
            AtomicBool,
            AtomicU64,
            AtomicUsize,
        },
        Arc,
        Mutex,
        MutexGuard,
        Weak,
    },
};


static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);


/// Buffering policy of a channel
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Capacity {
    /// No buffer: a send completes only once a receiver has taken the message
    Rendezvous,
    /// Buffers up to the given number of messages, after which senders wait
    ///
    /// A message handed to a receive which was then dropped before observing it goes back to
    /// the front of the buffer, which may briefly hold one message over the bound per such
    /// receive. Senders keep waiting until the buffer is back under the bound.
    Bounded(usize),
    /// Buffers any number of messages, so senders never wait
    Unbounded,
    /// Buffers only the most recent message, replacing any older one, so senders never wait
    Conflated,
}

impl From<usize> for Capacity {
    fn from(n: usize) -> Self {
        match n {
            0 => Capacity::Rendezvous,
            n => Capacity::Bounded(n),
        }
    }
}


// resumes a waiting receiver.
pub(crate) type RecvResume<T> = Box<dyn FnOnce(Result<T, RecvError>) + Send>;

// resumes a waiting sender.
pub(crate) type SendResume<T> = Box<dyn FnOnce(Result<(), SendError<T>>) + Send>;

// waiting sender, with the message it wants to send.
pub(crate) struct SendWaiter<T> {
    pub(crate) msg: T,
    pub(crate) resume: SendResume<T>,
}

// handle to a channel.
pub(crate) struct Channel<T>(Arc<Shared<T>>);

// weak handle to a channel.
pub(crate) struct WeakChannel<T>(Weak<Shared<T>>);

// channel shared state.
struct Shared<T> {
    id: u64,
    capacity: Capacity,
    // mutex around lockable state.
    lockable: Mutex<Lockable<T>>,
    // sender handle count.
    send_count: AtomicUsize,
    // receiver handle count.
    recv_count: AtomicUsize,
    // mirrors Lockable.closed.is_some(), for lock-free reads.
    closed: AtomicBool,
}

// channel lockable state.
//
// invariants:
//
// - recv_waiters non-empty implies elems empty and send_waiters empty.
// - send_waiters non-empty implies no spare capacity in elems.
// - once closed, both waiter queues are empty and stay empty.
struct Lockable<T> {
    // buffered messages.
    elems: VecDeque<T>,
    send_waiters: WaitQueue<SendWaiter<T>>,
    recv_waiters: WaitQueue<RecvResume<T>>,
    closed: Option<Closed>,
}

struct Closed {
    cause: Option<CloseCause>,
    // buffered messages were discarded, and messages returned to the channel are dropped.
    cancelled: bool,
}

impl<T> Channel<T> {
    // construct empty channel with send and recv counts of 1.
    pub(crate) fn new(capacity: Capacity) -> Self {
        let channel = Channel(Arc::new(Shared {
            id: NEXT_CHANNEL_ID.fetch_add(1, Relaxed),
            capacity,
            lockable: Mutex::new(Lockable {
                elems: VecDeque::new(),
                send_waiters: WaitQueue::new(),
                recv_waiters: WaitQueue::new(),
                closed: None,
            }),
            send_count: AtomicUsize::new(1),
            recv_count: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
        }));
        trace!(channel = channel.id(), ?capacity, "created channel");
        channel
    }

    // clone another handle to the channel.
    pub(crate) fn clone(&self) -> Self {
        Channel(Arc::clone(&self.0))
    }

    pub(crate) fn downgrade(&self) -> WeakChannel<T> {
        WeakChannel(Arc::downgrade(&self.0))
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    pub(crate) fn capacity(&self) -> Capacity {
        self.0.capacity
    }

    pub(crate) fn send_count(&self) -> &AtomicUsize {
        &self.0.send_count
    }

    pub(crate) fn recv_count(&self) -> &AtomicUsize {
        &self.0.recv_count
    }

    // whether closed, without locking.
    pub(crate) fn is_closed(&self) -> bool {
        self.0.closed.load(Acquire)
    }

    // lock the channel.
    pub(crate) fn lock(&self) -> Lock<'_, T> {
        Lock {
            guard: self.0.lockable.lock().unwrap(),
            shared: &self.0,
            wakeups: Wakeups(SmallVec::new()),
            garbage: Vec::new(),
        }
    }

    // if the sender with the given key is still waiting, remove it and fail it with the
    // cancellation error.
    pub(crate) fn cancel_send_waiter(&self, key: WaiterKey, error: &CancellationError) {
        let mut lock = self.lock();
        if let Some(waiter) = lock.guard.send_waiters.remove(key) {
            trace!(channel = self.id(), job = %error.job(), "cancelled waiting sender");
            let error = SendError { msg: waiter.msg, cause: error.clone().into() };
            lock.wakeups.0.push(Wakeup::Sender(waiter.resume, Err(error)));
        }
    }

    // if the receiver with the given key is still waiting, remove it and fail it with the
    // cancellation error.
    pub(crate) fn cancel_recv_waiter(&self, key: WaiterKey, error: &CancellationError) {
        let mut lock = self.lock();
        if let Some(resume) = lock.guard.recv_waiters.remove(key) {
            trace!(channel = self.id(), job = %error.job(), "cancelled waiting receiver");
            lock.wakeups.0.push(Wakeup::Receiver(resume, Err(error.clone().into())));
        }
    }

    // take back a message that was committed to a receiver which went away before observing it.
    //
    // it goes to the oldest waiting receiver, or else back to the front of the buffer, even if
    // that leaves a bounded buffer one over capacity. it is dropped if the channel was cancelled,
    // or closed and drained, as receivers may already have observed the end of the stream.
    pub(crate) fn restore(&self, msg: T) {
        let mut lock = self.lock();
        if let Some(closed) = &lock.guard.closed {
            if closed.cancelled || lock.guard.elems.is_empty() {
                trace!(channel = self.id(), "dropped message restored to closed channel");
                lock.garbage.push(msg);
                return;
            }
        }
        if let Some((_, resume)) = lock.guard.recv_waiters.pop_front() {
            trace!(channel = self.id(), "restored message to waiting receiver");
            lock.wakeups.0.push(Wakeup::Receiver(resume, Ok(msg)));
        } else if self.capacity() == Capacity::Conflated && !lock.guard.elems.is_empty() {
            // a newer message has replaced it
            lock.garbage.push(msg);
        } else {
            trace!(channel = self.id(), "restored message to buffer");
            lock.guard.elems.push_front(msg);
        }
    }
}

impl<T> WeakChannel<T> {
    pub(crate) fn upgrade(&self) -> Option<Channel<T>> {
        self.0.upgrade().map(Channel)
    }
}


// lock on a channel.
//
// fields drop in declaration order, so the mutex is released before deferred resumptions run and
// garbage is dropped.
pub(crate) struct Lock<'a, T> {
    guard: MutexGuard<'a, Lockable<T>>,
    shared: &'a Shared<T>,
    wakeups: Wakeups<T>,
    garbage: Vec<T>,
}

// deferred resumption of a waiter taken out of a queue.
enum Wakeup<T> {
    Receiver(RecvResume<T>, Result<T, RecvError>),
    Sender(SendResume<T>, Result<(), SendError<T>>),
}

// runs its wakeups when dropped.
struct Wakeups<T>(SmallVec<[Wakeup<T>; 2]>);

impl<T> Drop for Wakeups<T> {
    fn drop(&mut self) {
        for wakeup in self.0.drain(..) {
            match wakeup {
                Wakeup::Receiver(resume, result) => resume(result),
                Wakeup::Sender(resume, result) => resume(result),
            }
        }
    }
}

impl<'a, T> Lock<'a, T> {
    // whether a message could be buffered without exceeding capacity.
    fn has_room(&self) -> bool {
        match self.shared.capacity {
            Capacity::Rendezvous => false,
            Capacity::Bounded(n) => self.guard.elems.len() < n,
            Capacity::Unbounded | Capacity::Conflated => true,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.guard.closed.is_some()
    }

    // number of buffered messages.
    pub(crate) fn len(&self) -> usize {
        self.guard.elems.len()
    }

    #[cfg(test)]
    pub(crate) fn waiting_senders(&self) -> usize {
        self.guard.send_waiters.len()
    }

    #[cfg(test)]
    pub(crate) fn waiting_receivers(&self) -> usize {
        self.guard.recv_waiters.len()
    }

    // send without waiting: hand to the oldest waiting receiver, else buffer if there is room.
    pub(crate) fn try_send(&mut self, msg: T) -> Result<(), TrySendError<T>> {
        if let Some(closed) = &self.guard.closed {
            let cause = ClosedSendError { cause: closed.cause.clone() };
            return Err(TrySendError { msg, cause: SendErrorCause::from(cause).into() });
        }
        if let Some((_, resume)) = self.guard.recv_waiters.pop_front() {
            trace!(channel = self.shared.id, "paired send with waiting receiver");
            self.wakeups.0.push(Wakeup::Receiver(resume, Ok(msg)));
            return Ok(());
        }
        if self.shared.capacity == Capacity::Conflated {
            if let Some(old) = self.guard.elems.pop_front() {
                self.garbage.push(old);
            }
            self.guard.elems.push_back(msg);
            return Ok(());
        }
        if self.has_room() {
            self.guard.elems.push_back(msg);
            return Ok(());
        }
        Err(TrySendError { msg, cause: WouldBlockError.into() })
    }

    // queue a waiting sender. only valid if try_send just returned would-block.
    pub(crate) fn push_send_waiter(&mut self, msg: T, resume: SendResume<T>) -> WaiterKey {
        debug_assert!(self.guard.closed.is_none());
        debug_assert!(self.guard.recv_waiters.is_empty());
        trace!(channel = self.shared.id, "sender waiting");
        self.guard.send_waiters.push_back(SendWaiter { msg, resume })
    }

    pub(crate) fn remove_send_waiter(&mut self, key: WaiterKey) -> Option<SendWaiter<T>> {
        self.guard.send_waiters.remove(key)
    }

    // receive without waiting: take the oldest buffered message, else pair with the oldest
    // waiting sender.
    pub(crate) fn try_recv(&mut self) -> Result<T, TryRecvError> {
        if let Some(msg) = self.guard.elems.pop_front() {
            // promote the oldest waiting sender into the freed slot
            if self.has_room() {
                if let Some((_, waiter)) = self.guard.send_waiters.pop_front() {
                    trace!(channel = self.shared.id, "promoted waiting sender into buffer");
                    self.guard.elems.push_back(waiter.msg);
                    self.wakeups.0.push(Wakeup::Sender(waiter.resume, Ok(())));
                }
            }
            return Ok(msg);
        }
        if let Some((_, waiter)) = self.guard.send_waiters.pop_front() {
            trace!(channel = self.shared.id, "paired receive with waiting sender");
            self.wakeups.0.push(Wakeup::Sender(waiter.resume, Ok(())));
            return Ok(waiter.msg);
        }
        match &self.guard.closed {
            Some(closed) => {
                let error = ClosedReceiveError { cause: closed.cause.clone() };
                Err(RecvError::from(error).into())
            }
            None => Err(WouldBlockError.into()),
        }
    }

    // queue a waiting receiver. only valid if try_recv just returned would-block.
    pub(crate) fn push_recv_waiter(&mut self, resume: RecvResume<T>) -> WaiterKey {
        debug_assert!(self.guard.closed.is_none());
        debug_assert!(self.guard.elems.is_empty());
        trace!(channel = self.shared.id, "receiver waiting");
        self.guard.recv_waiters.push_back(resume)
    }

    pub(crate) fn remove_recv_waiter(&mut self, key: WaiterKey) -> Option<RecvResume<T>> {
        self.guard.recv_waiters.remove(key)
    }

    // close the channel, failing all waiters. returns whether this call closed it.
    //
    // if `cancel` is true, buffered messages are also discarded, even if already closed.
    pub(crate) fn close(&mut self, cause: Option<CloseCause>, cancel: bool) -> bool {
        if cancel {
            self.garbage.extend(self.guard.elems.drain(..));
        }
        if let Some(closed) = &mut self.guard.closed {
            closed.cancelled |= cancel;
            return false;
        }
        debug!(
            channel = self.shared.id,
            cause = cause.as_ref().map(tracing::field::display),
            cancel,
            "closing channel"
        );
        self.guard.closed = Some(Closed { cause: cause.clone(), cancelled: cancel });
        self.shared.closed.store(true, Release);

        while let Some((_, resume)) = self.guard.recv_waiters.pop_front() {
            let error = ClosedReceiveError { cause: cause.clone() };
            self.wakeups.0.push(Wakeup::Receiver(resume, Err(error.into())));
        }
        while let Some((_, waiter)) = self.guard.send_waiters.pop_front() {
            let error = SendError {
                msg: waiter.msg,
                cause: ClosedSendError { cause: cause.clone() }.into(),
            };
            self.wakeups.0.push(Wakeup::Sender(waiter.resume, Err(error)));
        }
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn recv_waiter<T: Send + 'static>(
        lock: &mut Lock<'_, T>,
    ) -> (WaiterKey, mpsc::Receiver<Result<T, RecvError>>) {
        let (tx, rx) = mpsc::channel();
        let key = lock.push_recv_waiter(Box::new(move |result| tx.send(result).unwrap()));
        (key, rx)
    }

    fn send_waiter<T: Send + 'static>(
        lock: &mut Lock<'_, T>,
        msg: T,
    ) -> (WaiterKey, mpsc::Receiver<Result<(), SendError<T>>>) {
        let (tx, rx) = mpsc::channel();
        let key = lock.push_send_waiter(msg, Box::new(move |result| tx.send(result).unwrap()));
        (key, rx)
    }

    #[test]
    fn wakeups_run_after_unlock() {
        let channel = Channel::<u32>::new(Capacity::Rendezvous);
        let (_, rx) = recv_waiter(&mut channel.lock());

        let channel_2 = channel.clone();
        let (tx, relocked) = mpsc::channel();
        let mut lock = channel.lock();
        // a waiter that locks the channel again would deadlock if run under the lock
        let _ = lock.push_recv_waiter(Box::new(move |_| {
            drop(channel_2.lock());
            tx.send(()).unwrap();
        }));
        drop(lock);

        channel.lock().try_send(1).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
        channel.lock().try_send(2).unwrap();
        relocked.try_recv().unwrap();
    }

    #[test]
    fn bounded_promotes_waiting_sender() {
        let channel = Channel::new(Capacity::Bounded(1));
        let mut lock = channel.lock();
        lock.try_send(1).unwrap();
        let TrySendError { msg, cause } = lock.try_send(2).unwrap_err();
        assert!(matches!(cause, TrySendErrorCause::WouldBlock(_)));
        let (_, rx) = send_waiter(&mut lock, msg);
        drop(lock);
        assert!(rx.try_recv().is_err());

        let mut lock = channel.lock();
        assert_eq!(lock.try_recv().unwrap(), 1);
        assert_eq!(lock.len(), 1);
        assert_eq!(lock.waiting_senders(), 0);
        drop(lock);
        rx.try_recv().unwrap().unwrap();
        assert_eq!(channel.lock().try_recv().unwrap(), 2);
    }

    #[test]
    fn close_fails_waiters_and_keeps_buffer() {
        let channel = Channel::new(Capacity::Bounded(1));
        let mut lock = channel.lock();
        lock.try_send(1).unwrap();
        let (_, sender) = send_waiter(&mut lock, 2);
        assert!(lock.close(None, false));
        assert!(!lock.close(None, false));
        drop(lock);

        let error = sender.try_recv().unwrap().unwrap_err();
        assert_eq!(error.msg, 2);
        assert!(matches!(error.cause, SendErrorCause::Closed(_)));
        assert!(channel.is_closed());

        let mut lock = channel.lock();
        assert_eq!(lock.try_recv().unwrap(), 1);
        assert!(matches!(
            lock.try_recv(),
            Err(TryRecvError::Terminal(RecvError::Closed(ClosedReceiveError { cause: None }))),
        ));
    }

    #[test]
    fn cancel_discards_buffer_and_restored_messages() {
        let channel = Channel::new(Capacity::Unbounded);
        let mut lock = channel.lock();
        lock.try_send(1).unwrap();
        lock.try_send(2).unwrap();
        lock.close(None, false);
        assert!(!lock.close(Some(CloseCause::new(anyhow::anyhow!("cancelled"))), true));
        assert_eq!(lock.len(), 0);
        drop(lock);
        channel.restore(3);
        assert_eq!(channel.lock().len(), 0);
    }

    #[test]
    fn restore_prefers_waiting_receiver() {
        let channel = Channel::new(Capacity::Unbounded);
        let (_, rx) = recv_waiter(&mut channel.lock());
        channel.restore(7);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 7);

        channel.lock().try_send(8).unwrap();
        channel.restore(6);
        let mut lock = channel.lock();
        assert_eq!(lock.try_recv().unwrap(), 6);
        assert_eq!(lock.try_recv().unwrap(), 8);
    }

    #[test]
    fn restore_after_drained_close_is_dropped() {
        let channel = Channel::new(Capacity::Rendezvous);
        let mut lock = channel.lock();
        assert!(lock.close(None, false));
        assert!(matches!(
            lock.try_recv(),
            Err(TryRecvError::Terminal(RecvError::Closed(ClosedReceiveError { cause: None }))),
        ));
        drop(lock);
        channel.restore(9);
        let mut lock = channel.lock();
        assert_eq!(lock.len(), 0);
        assert!(matches!(lock.try_recv(), Err(TryRecvError::Terminal(_))));
    }

    #[test]
    fn restore_before_drained_close_is_kept() {
        let channel = Channel::new(Capacity::Unbounded);
        let mut lock = channel.lock();
        lock.try_send(2).unwrap();
        lock.close(None, false);
        drop(lock);
        channel.restore(1);
        let mut lock = channel.lock();
        assert_eq!(lock.try_recv().unwrap(), 1);
        assert_eq!(lock.try_recv().unwrap(), 2);
        assert!(matches!(lock.try_recv(), Err(TryRecvError::Terminal(_))));
    }

    #[test]
    fn restore_may_overfill_bounded_by_one() {
        let channel = Channel::new(Capacity::Bounded(1));
        channel.lock().try_send(2).unwrap();
        channel.restore(1);
        let mut lock = channel.lock();
        assert_eq!(lock.len(), 2);
        assert!(lock.try_send(3).unwrap_err().is_would_block());
        assert_eq!(lock.try_recv().unwrap(), 1);
        assert_eq!(lock.try_recv().unwrap(), 2);
    }

    #[test]
    fn conflated_keeps_latest() {
        let channel = Channel::new(Capacity::Conflated);
        let mut lock = channel.lock();
        for i in 0..5 {
            lock.try_send(i).unwrap();
        }
        assert_eq!(lock.len(), 1);
        assert_eq!(lock.try_recv().unwrap(), 4);
        drop(lock);

        channel.lock().try_send(5).unwrap();
        // an older message coming back does not displace a newer one
        channel.restore(4);
        assert_eq!(channel.lock().try_recv().unwrap(), 5);
    }

    #[test]
    fn removed_waiter_is_not_paired() {
        let channel = Channel::new(Capacity::Rendezvous);
        let mut lock = channel.lock();
        let (a, rx_a) = recv_waiter(&mut lock);
        let (_, rx_b) = recv_waiter(&mut lock);
        assert!(lock.remove_recv_waiter(a).is_some());
        assert!(lock.remove_recv_waiter(a).is_none());
        lock.try_send(1).unwrap();
        drop(lock);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().unwrap(), 1);
    }
}
