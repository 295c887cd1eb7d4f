//! The pluggable OS readiness multiplexer contract.
//!
//! The event loop drives exactly one [Poller]; everything the loop and the socket channels need
//! from the OS multiplexer goes through this trait, so any backend implementing it (epoll,
//! kqueue, select, an IOCP readiness shim) is interchangeable with no change to the loop or the
//! channels. The crate ships [EpollPoller] as the Linux default.
//!
//! Backend requirements beyond the signatures:
//! - `poll` must park for at most `timeout` (forever when `None`), must clear `waiting` once it
//!   has woken, and must return early when the [Interrupter] fires.
//! - A registration freed by `io_end` must never be addressed again by its old [IoToken]; tokens
//!   are generation stamped for this.
//! - `io_end` must be requested before the descriptor itself is closed, so the registration
//!   table stays exact across fd reuse.

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;

use std::os::fd::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::io::{IoAction, IoMonitor, IoToken, Readiness};

/// Wakes a poller parked in [Poller::poll] from another thread.
pub trait Interrupter: Send + Sync {
    fn interrupt_wait(&self);
}

/// The registration and wait contract every backend satisfies.
pub trait Poller: Send {
    /// Park for readiness events, at most `timeout`, collecting them into `events`. Clears
    /// `waiting` once the wait is over.
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        waiting: &AtomicBool,
        events: &mut Vec<Readiness>,
    ) -> Result<()>;

    /// A cloneable cross-thread handle that interrupts a parked [Poller::poll].
    fn interrupter(&self) -> Arc<dyn Interrupter>;

    /// Register a descriptor with its monitor. `None` when the backend rejects the
    /// registration, e.g. on resource exhaustion.
    fn io_begin(&mut self, fd: RawFd, monitor: Arc<dyn IoMonitor>) -> Option<IoToken>;

    /// Change interest for a registration. [IoAction::NotifyTerminating] never reaches the
    /// backend; the loop broadcasts it itself via [Poller::monitors].
    fn io_do(&mut self, action: IoAction, token: IoToken) -> Result<()>;

    /// Drop a registration. Returns whether the token was still live.
    fn io_end(&mut self, token: IoToken) -> bool;

    /// Snapshot of every live registration, used for the terminating broadcast.
    fn monitors(&self) -> Vec<(IoToken, Arc<dyn IoMonitor>)>;

    /// Number of live registrations.
    fn len(&self) -> usize;
}

/// Construct the default backend for this platform.
#[cfg(target_os = "linux")]
pub fn default_poller() -> Result<Box<dyn Poller>> {
    Ok(Box::new(EpollPoller::new()?))
}
