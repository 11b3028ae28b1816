// channel error types.

use crate::job::CancellationError;
use thiserror::Error;
use std::{
    error::Error,
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};


// ==== base error types ====


/// Cause a channel was closed with
///
/// Cheap to clone, so that every waiter woken by the close can be handed the same cause.
#[derive(Clone)]
pub struct CloseCause(Arc<anyhow::Error>);

impl CloseCause {
    /// Wrap an error as a close cause
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        CloseCause(Arc::new(cause.into()))
    }

    /// The wrapped error
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }
}

impl Debug for CloseCause {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl Display for CloseCause {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl Error for CloseCause {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Error::source(&**self.0)
    }
}

/// Error for trying to send into a closed channel
#[derive(Error, Debug, Clone, Default)]
#[error("channel is closed")]
pub struct ClosedSendError {
    /// What the channel was closed with, if anything
    #[source]
    pub cause: Option<CloseCause>,
}

/// Error for trying to receive from a channel which is closed and has no buffered messages left
#[derive(Error, Debug, Clone, Default)]
#[error("channel is closed and drained")]
pub struct ClosedReceiveError {
    /// What the channel was closed with, if anything
    #[source]
    pub cause: Option<CloseCause>,
}

/// Error for attempting to use a channel with no or limited blocking, and the operation not
/// completing immediately or by the specified deadline
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("channel operation would block")]
pub struct WouldBlockError;


// ==== compound error types ====


macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Reason a message could not be sent
#[derive(Error, Debug, Clone)]
pub enum SendErrorCause {
    /// The channel was closed
    #[error(transparent)]
    Closed(ClosedSendError),
    /// The sending coroutine's job became inactive while it was suspended
    #[error(transparent)]
    Cancelled(CancellationError),
}

compound_from!(SendErrorCause {
    Closed(ClosedSendError),
    Cancelled(CancellationError),
});

/// Error for trying to send into a channel
///
/// The message is handed back, never delivered.
pub struct SendError<T> {
    /// The message that could not be sent
    pub msg: T,
    /// The reason the message could not be sent
    pub cause: SendErrorCause,
}

impl<T> Debug for SendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("SendError")
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

impl<T> Display for SendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "failed to send message: {}", self.cause)
    }
}

impl<T> Error for SendError<T> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}

/// Reason a message could not be sent with no or limited blocking
#[derive(Error, Debug, Clone)]
pub enum TrySendErrorCause {
    /// The send failed for a reason that waiting longer would not fix
    #[error(transparent)]
    Terminal(SendErrorCause),
    /// The operation could not be resolved immediately or by the specified deadline
    #[error(transparent)]
    WouldBlock(WouldBlockError),
}

compound_from!(TrySendErrorCause {
    Terminal(SendErrorCause),
    WouldBlock(WouldBlockError),
});

/// Error for trying to send into a channel with no or limited blocking
pub struct TrySendError<T> {
    /// The message that could not be sent
    pub msg: T,
    /// The reason the message could not be sent
    pub cause: TrySendErrorCause,
}

impl<T> TrySendError<T> {
    /// Whether the operation merely could not complete in time
    pub fn is_would_block(&self) -> bool {
        matches!(self.cause, TrySendErrorCause::WouldBlock(_))
    }
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(e: SendError<T>) -> Self {
        TrySendError { msg: e.msg, cause: e.cause.into() }
    }
}

impl<T> Debug for TrySendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("TrySendError")
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

impl<T> Display for TrySendError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "failed to send message: {}", self.cause)
    }
}

impl<T> Error for TrySendError<T> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}

/// Error for trying to receive from a channel
#[derive(Error, Debug, Clone)]
pub enum RecvError {
    /// The channel is closed and has no buffered messages left
    #[error(transparent)]
    Closed(ClosedReceiveError),
    /// The receiving coroutine's job became inactive while it was suspended
    #[error(transparent)]
    Cancelled(CancellationError),
}

compound_from!(RecvError {
    Closed(ClosedReceiveError),
    Cancelled(CancellationError),
});

impl RecvError {
    /// Whether this is the graceful end of stream: closed without a cause, and drained
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, RecvError::Closed(ClosedReceiveError { cause: None }))
    }

    /// Whether the receive was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RecvError::Cancelled(_))
    }
}

/// Error for trying to receive from a channel with no or limited blocking
#[derive(Error, Debug, Clone)]
pub enum TryRecvError {
    /// The receive failed for a reason that waiting longer would not fix
    #[error(transparent)]
    Terminal(RecvError),
    /// The operation could not be resolved immediately or by the specified deadline
    #[error(transparent)]
    WouldBlock(WouldBlockError),
}

compound_from!(TryRecvError {
    Terminal(RecvError),
    WouldBlock(WouldBlockError),
});
