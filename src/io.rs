//! Core I/O registration types shared by the loop, the poller backends, and their monitors.

use std::sync::Arc;

use crate::error::Error;

/// Directs the poller to change interest for a registered descriptor, or to deliver the
/// synthetic shutdown notice to every registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAction {
    Read,
    EndRead,
    Write,
    EndWrite,
    NotifyTerminating,
}

/// Opaque handle to a per-descriptor registration record owned by the poller.
///
/// The token is generation stamped: a slot freed by `io_end` and reused by a later `io_begin`
/// yields a different token, so a stale token can never address another registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken {
    pub(crate) slot: usize,
    pub(crate) gen: u64,
}

impl IoToken {
    pub(crate) fn new(slot: usize, gen: u64) -> IoToken {
        IoToken { slot, gen }
    }
}

/// The status delivered alongside a readiness notification: `Ok` for plain readiness, or the
/// error the poller observed on the descriptor.
pub type IoStatus = Result<(), Error>;

/// The capability anything registered via `io_begin` must implement.
///
/// All three notifications are delivered on the owning loop's thread. The socket channel
/// implements this; so can any external descriptor adapter (a DNS resolver's sockets, say),
/// side by side, sharing only the loop's registration interface.
pub trait IoMonitor: Send + Sync {
    /// The descriptor is read ready, or failed; called once per readiness notification.
    fn io_notify_read(&self, status: IoStatus, token: IoToken);
    /// The descriptor is write ready, or failed.
    fn io_notify_write(&self, status: IoStatus, token: IoToken);
    /// The owning loop is terminating; the monitor must force close and deregister.
    fn io_notify_terminating(&self, status: IoStatus, token: IoToken);
}

/// One readiness event handed from a poller backend to the loop for dispatch.
pub struct Readiness {
    pub token: IoToken,
    pub monitor: Arc<dyn IoMonitor>,
    pub readable: bool,
    pub writable: bool,
    pub status: IoStatus,
}
