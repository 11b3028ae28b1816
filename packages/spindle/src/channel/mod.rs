// implementation of the spindle channel.
//
// the basic architecture is as such:
//
// channel handles wrap around Arc<Mutex<shared state>>
//                                         |
//          /------------------------------/
//          v
//       shared state
//          |
//          |------ it contains a VecDeque<T> holding buffered messages, bounded according to the
//          |       channel's capacity.
//          |
//          |------ it contains a "send wait queue":
//          |
//          |       this is a FIFO of waiting senders, each holding its message and a boxed
//          |       resumption of the suspended send future. the send future keeps the key of its
//          |       entry, so it can remove itself in O(1) when rescinded, dropped, or cancelled
//          |       by its job. the queue order is used to achieve fairness.
//          |
//          \------ it contains a "recv wait queue", which is the same idea for recv futures.
//
// whoever removes a waiter from its queue decides its outcome. the resumption itself only runs
// once the lock is released, and is dispatched to the waiter's dispatcher if it has one. a launched
// coroutine is resumed directly instead, since waking it already dispatches its next poll.
//
// the organization of these modules is as such:
//
//      wait_queue<------------core: This presents the locked channel state and its transitions.
//                             ^     Every transition either returns its outcome to the caller or
//                             |     defers it as a wakeup to run after unlocking.
//                             |
//                             api: This is a wrapper around core that adapts it into an API of
//                                  suspending futures and handle reference counting. The crate
//                                  re-exports this API publically.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod error;
pub(crate) mod api;

mod core;
mod wait_queue;
