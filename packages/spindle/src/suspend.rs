//! Suspension points.
//!
//! [`suspend_with`] splits a suspension point into its two halves: a [`Suspended`] continuation,
//! which whoever is responsible for resuming the computation holds on to, and a [`Suspension`]
//! future, which the suspended computation awaits.

use crate::{context::Context, continuation::Continuation};
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{self, Poll, Waker},
};


type Undelivered<T> = Box<dyn FnOnce(T) + Send>;

// state shared between both halves.
struct Slot<T, E> {
    state: SlotState<T, E>,
    // called with a success value that cannot be delivered because the suspension was dropped.
    undelivered: Option<Undelivered<T>>,
}

enum SlotState<T, E> {
    // not yet resumed.
    Pending(Option<Waker>),
    // resumed, not yet observed.
    Ready(Result<T, E>),
    // resumed and observed.
    Taken,
    // suspension dropped before observing a result.
    Abandoned,
    // continuation dropped without resuming.
    Lost,
}

/// Construct a linked continuation and future for a suspension in `context`
pub fn suspend_with<T, E>(context: Context) -> (Suspended<T, E>, Suspension<T, E>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    let slot = Arc::new(Mutex::new(Slot {
        state: SlotState::Pending(None),
        undelivered: None,
    }));
    let suspended = Suspended { context, slot: Some(Arc::clone(&slot)) };
    (suspended, Suspension { slot })
}


/// Continuation half of a suspension point
///
/// Resuming it completes the linked [`Suspension`] and wakes whoever is awaiting it. Dropping it
/// without resuming makes the linked future panic if it is polled again.
pub struct Suspended<T, E> {
    context: Context,
    slot: Option<Arc<Mutex<Slot<T, E>>>>,
}

impl<T, E> Suspended<T, E> {
    /// Install a hook to receive the value of a success resume if the linked [`Suspension`] was
    /// dropped before it could observe it
    ///
    /// The hook runs on whichever thread resumes or drops last, outside of any lock.
    pub fn on_undelivered<F>(&mut self, hook: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        if let Some(slot) = self.slot.as_ref() {
            slot.lock().unwrap().undelivered = Some(Box::new(hook));
        }
    }
}

impl<T, E> Continuation for Suspended<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Value = T;
    type Failure = E;

    fn context(&self) -> &Context {
        &self.context
    }

    fn resume_with(mut self, result: Result<T, E>) {
        let Some(slot) = self.slot.take() else { return };
        let mut lock = slot.lock().unwrap();
        match mem::replace(&mut lock.state, SlotState::Taken) {
            SlotState::Pending(waker) => {
                lock.state = SlotState::Ready(result);
                drop(lock);
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            SlotState::Abandoned => {
                lock.state = SlotState::Abandoned;
                let hook = lock.undelivered.take();
                drop(lock);
                if let (Ok(value), Some(hook)) = (result, hook) {
                    trace!("resumed suspension was abandoned, returning value");
                    hook(value);
                }
            }
            SlotState::Ready(_) | SlotState::Taken | SlotState::Lost => {
                unreachable!("suspension resumed twice")
            }
        }
    }
}

impl<T, E> Drop for Suspended<T, E> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else { return };
        let mut lock = slot.lock().unwrap();
        if let SlotState::Pending(waker) = mem::replace(&mut lock.state, SlotState::Lost) {
            drop(lock);
            trace!("suspended computation dropped without being resumed");
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

impl<T, E> Debug for Suspended<T, E> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Suspended").field("context", &self.context).finish_non_exhaustive()
    }
}


/// Future half of a suspension point
///
/// Resolves to whatever the linked [`Suspended`] is resumed with. If dropped after being resumed
/// with a success value it never observed, that value goes to the hook installed with
/// [`Suspended::on_undelivered`], if any.
pub struct Suspension<T, E> {
    slot: Arc<Mutex<Slot<T, E>>>,
}

impl<T, E> Suspension<T, E> {
    /// Take the result if it has been resumed, without registering a waker
    ///
    /// Panics if the result was already taken.
    pub fn try_take(&mut self) -> Option<Result<T, E>> {
        let mut lock = self.slot.lock().unwrap();
        match mem::replace(&mut lock.state, SlotState::Taken) {
            SlotState::Ready(result) => Some(result),
            state @ SlotState::Pending(_) => {
                lock.state = state;
                None
            }
            SlotState::Lost => {
                lock.state = SlotState::Lost;
                drop(lock);
                panic!("suspended computation dropped without being resumed");
            }
            SlotState::Taken | SlotState::Abandoned => panic!("suspension result already taken"),
        }
    }

    /// Whether the linked continuation has been resumed
    pub fn is_resumed(&self) -> bool {
        matches!(self.slot.lock().unwrap().state, SlotState::Ready(_) | SlotState::Taken)
    }
}

impl<T, E> Future for Suspension<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut lock = this.slot.lock().unwrap();
        if let SlotState::Pending(waker) = &mut lock.state {
            match waker {
                Some(waker) if waker.will_wake(cx.waker()) => (),
                _ => *waker = Some(cx.waker().clone()),
            }
            return Poll::Pending;
        }
        drop(lock);
        match this.try_take() {
            Some(result) => Poll::Ready(result),
            None => unreachable!("suspension left pending state while locked"),
        }
    }
}

impl<T, E> Drop for Suspension<T, E> {
    fn drop(&mut self) {
        let mut lock = self.slot.lock().unwrap();
        match mem::replace(&mut lock.state, SlotState::Abandoned) {
            SlotState::Ready(Ok(value)) => {
                let hook = lock.undelivered.take();
                drop(lock);
                if let Some(hook) = hook {
                    trace!("unobserved suspension dropped, returning value");
                    hook(value);
                }
            }
            SlotState::Lost => lock.state = SlotState::Lost,
            _ => (),
        }
    }
}

impl<T, E> Debug for Suspension<T, E> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Suspension").field("resumed", &self.is_resumed()).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block_on,
        dispatcher::{PoolConfig, ThreadPoolDispatcher},
        continuation::DispatchedContinuation,
    };
    use std::{
        sync::mpsc,
        thread,
        time::Duration,
    };

    #[test]
    fn resume_before_poll() {
        let (suspended, suspension) = suspend_with::<u32, ()>(Context::empty());
        suspended.resume_with(Ok(3));
        assert_eq!(block_on(suspension), Ok(3));
    }

    #[test]
    fn resume_from_other_thread_wakes() {
        let (suspended, suspension) = suspend_with::<u32, &'static str>(Context::empty());
        let resumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            suspended.resume_with(Err("failed"));
        });
        assert_eq!(block_on(suspension), Err("failed"));
        resumer.join().unwrap();
    }

    #[test]
    fn resume_through_dispatcher() {
        let pool = Arc::new(ThreadPoolDispatcher::new(PoolConfig::default().threads(1)).unwrap());
        let (suspended, suspension) = suspend_with::<String, ()>(Context::empty());
        DispatchedContinuation::new(suspended, pool).resume("hello".to_owned());
        assert_eq!(block_on(suspension).unwrap(), "hello");
    }

    #[test]
    fn abandoned_value_goes_to_hook() {
        let (tx, rx) = mpsc::channel();
        let (mut suspended, suspension) = suspend_with::<u32, ()>(Context::empty());
        suspended.on_undelivered(move |value| tx.send(value).unwrap());
        drop(suspension);
        suspended.resume_with(Ok(11));
        assert_eq!(rx.try_recv(), Ok(11));
    }

    #[test]
    fn unobserved_value_goes_to_hook() {
        let (tx, rx) = mpsc::channel();
        let (mut suspended, mut suspension) = suspend_with::<u32, ()>(Context::empty());
        suspended.on_undelivered(move |value| tx.send(value).unwrap());
        suspended.resume_with(Ok(12));
        assert!(suspension.is_resumed());
        drop(suspension);
        assert_eq!(rx.try_recv(), Ok(12));

        // observed values are not handed to the hook
        let (tx, rx) = mpsc::channel();
        let (mut suspended, s2) = suspend_with::<u32, ()>(Context::empty());
        suspension = s2;
        suspended.on_undelivered(move |value| tx.send(value).unwrap());
        suspended.resume_with(Ok(13));
        assert_eq!(suspension.try_take(), Some(Ok(13)));
        drop(suspension);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    #[should_panic(expected = "without being resumed")]
    fn lost_continuation_panics_awaiter() {
        let (suspended, suspension) = suspend_with::<u32, ()>(Context::empty());
        drop(suspended);
        let _ = block_on(suspension);
    }
}
