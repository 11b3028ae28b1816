// blocking future polling, for driving futures from plain threads.
//
// design based on pollster crate. the waker is a reference-counted signal rather than a pointer to
// a stack local, so wakers may outlive the call.

use std::{
    future::Future,
    pin::{pin, Pin},
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
    time::Instant,
};


// timeout for blocking on a future.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
    // time out if the future cannot be resolved without blocking.
    NonBlocking,
}

// poll the future until it resolves or the timeout is reached, in which case return none.
pub(crate) fn poll<F>(fut: &mut F, timeout: Timeout) -> Option<F::Output>
where
    F: Future + Unpin,
{
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    loop {
        // return if ready
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(&mut cx) {
            return Some(output);
        }

        // otherwise, block until notification or timeout
        let mut lock = signal.state.lock().unwrap();

        // a notification already present means we should just poll again
        if let State::Notified = *lock {
            *lock = State::Empty;
            continue;
        }

        debug_assert!(matches!(*lock, State::Empty));
        *lock = State::Waiting;
        match timeout {
            Timeout::Never =>
                while let State::Waiting = *lock {
                    lock = signal.cond.wait(lock).unwrap();
                },
            Timeout::At(deadline) =>
                while let State::Waiting = *lock {
                    let Some(duration) =
                        deadline.checked_duration_since(Instant::now())
                        else { return None };
                    let (lock2, wait_result) = signal.cond.wait_timeout(lock, duration).unwrap();
                    lock = lock2;
                    if wait_result.timed_out() && matches!(*lock, State::Waiting) {
                        return None;
                    }
                },
            Timeout::NonBlocking => return None,
        }
        *lock = State::Empty;
    }
}

/// Block the calling thread until the future resolves
///
/// The future is polled on the calling thread. Futures in this crate resume through their
/// context's dispatcher, if any, so blocking on them from a plain thread is fine.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = pin!(fut);
    match poll(&mut fut, Timeout::Never) {
        Some(output) => output,
        None => unreachable!("polling without timeout returned none"),
    }
}

// synchronization signal state
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut lock = self.state.lock().unwrap();
        match *lock {
            State::Notified => (),
            State::Empty => {
                *lock = State::Notified;
            }
            State::Waiting => {
                *lock = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn non_blocking_on_pending() {
        let mut fut = std::future::pending::<()>();
        assert!(poll(&mut fut, Timeout::NonBlocking).is_none());
    }

    #[test]
    fn deadline_elapses() {
        let mut fut = std::future::pending::<()>();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(poll(&mut fut, Timeout::At(deadline)).is_none());
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn woken_from_other_thread() {
        let (send, recv) = tokio::sync::oneshot::channel();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            send.send(7).unwrap();
        });
        assert_eq!(block_on(recv).unwrap(), 7);
        sender.join().unwrap();
    }
}
