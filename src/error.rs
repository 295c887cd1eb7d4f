use core::result;

use nix::errno::Errno;
use thiserror::Error;

/// A helper type for wrapping a [result::Result] such that we can reduce noise in our signatures.
pub type Result<T> = result::Result<T, Error>;

/// The set of error codes surfaced by the runtime, partitioned by subsystem: channel protocol
/// state errors, socket level errors, loop lifecycle errors, and raw OS errors.
///
/// Every variant is a small [Copy] code so it can travel through completion promises by value.
/// Transient syscall conditions (would-block, interrupted) are absorbed inside the read, write
/// and accept drain loops and never surface here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    // Channel protocol state errors.
    /// The operation is not valid in the channel's current connectivity state.
    #[error("invalid socket state")]
    InvalidState,
    /// The outbound queue already holds more bytes than the configured cap; retry later.
    #[error("channel write blocked, outbound queue over cap")]
    WriteBlocked,
    /// The write half has already been shut down.
    #[error("channel write closed")]
    WriteClosed,
    /// A write-half shutdown or close is pending or in progress.
    #[error("channel write shutting down")]
    WriteShutdowning,
    /// A close is already pending or in progress; the channel will reach closed on its own.
    #[error("channel close in progress")]
    CloseInProgress,
    /// The channel is closed.
    #[error("channel already closed")]
    AlreadyClosed,
    /// Another instance of this operation is already in process.
    #[error("operation already in process")]
    OpInProcess,
    /// The requested watch is already armed.
    #[error("operation already armed")]
    OpAlready,
    /// The outbound drain is suspended on an exhausted bandwidth budget.
    #[error("channel bandwidth limited")]
    BandwidthLimited,
    /// The channel recorded a read or write error previously; first error wins.
    #[error("channel read/write error")]
    ReadWriteError,
    /// The read half has already been shut down.
    #[error("channel read closed")]
    ReadClosed,
    /// The channel was aborted before the connection completed.
    #[error("channel aborted")]
    Aborted,

    // Socket level errors.
    /// The connect completed onto ourselves; local and peer addresses match.
    #[error("socket self connected")]
    SelfConnected,
    /// The peer address observed after connect does not match the dialed address.
    #[error("socket peer address mismatch")]
    AddrMismatch,

    // Loop lifecycle errors.
    /// Descriptor registration with the poller failed.
    #[error("io begin failed")]
    IoBeginFailed,
    /// The owning event loop delivered a terminating notification; forced abort.
    #[error("event loop terminating")]
    LoopTerminating,
    /// The timer was rejected because the loop no longer accepts timers.
    #[error("timer rejected")]
    TimerRejected,

    // Raw OS errors, classified but otherwise passed through.
    #[error("os error: {0}")]
    Os(Errno),
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Os(e)
    }
}

impl Error {
    /// Whether this error is the backpressure signal rather than a hard failure.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::WriteBlocked)
    }

    /// Whether this error came straight from the OS.
    pub fn is_os(&self) -> bool {
        matches!(self, Error::Os(_))
    }
}
