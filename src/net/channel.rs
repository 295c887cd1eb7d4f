//! The socket channel: a non-blocking socket bound to one event loop, driven entirely by
//! readiness notifications from that loop's poller.
//!
//! All channel state lives behind one mutex but is only ever mutated on the owning loop's
//! thread; public entry points called elsewhere hop over via [EventLoop::execute]. Completion
//! is reported through [Promise]s: every write, close and dial hands one back, and the channel
//! guarantees each is fulfilled exactly once, including on error paths and on the forced abort
//! a terminating loop delivers.
//!
//! Outbound data is queued whole with per-entry promises and drained against the socket in
//! arrival order. The queue carries a byte counter capped by [SocketConfig::snd_cap]; a write
//! that would push a non-empty queue past the cap is rejected with
//! [Error::WriteBlocked](crate::Error::WriteBlocked) and the queue is left untouched. An
//! optional token-bucket bandwidth limit suspends the drain when the budget empties and resumes
//! it from a 100ms refill timer.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, trace, warn};

use super::state::{ChannelFlags, Connectivity};
use super::sys::{self, ConnectStart, Recv};
use super::{ChannelInitializer, SockKind, SocketConfig};
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::group::EventLoopGroup;
use crate::io::{IoAction, IoMonitor, IoStatus, IoToken};
use crate::promise::Promise;
use crate::timer::Timer;

/// Completion promise for channel operations.
pub type ChannelPromise = Arc<Promise<Result<()>>>;

/// A readiness override installed in place of the default read or write handler; the connect
/// completion and the accept drain are both expressed this way.
pub type IoEventFn = Box<dyn FnMut(IoStatus) + Send>;

/// Fired once when the channel becomes connected.
pub type ConnectedFn = Box<dyn FnOnce(&Arc<SocketChannel>) + Send>;
/// Fired for every chunk the default read loop pulls off a stream socket.
pub type ReadFn = Box<dyn FnMut(&Arc<SocketChannel>, &[u8]) + Send>;
/// Fired for every datagram the default read loop pulls off a datagram socket.
pub type ReadFromFn = Box<dyn FnMut(&Arc<SocketChannel>, &[u8], SocketAddr) + Send>;
/// Fired once when the channel reaches closed.
pub type ClosedFn = Box<dyn FnOnce(&Arc<SocketChannel>) + Send>;

/// Refill period of the bandwidth token bucket.
const BDL_TICK: Duration = Duration::from_millis(100);
const BDL_TICKS_PER_SEC: usize = 10;

struct Outbound {
    data: Vec<u8>,
    off: usize,
    to: Option<SocketAddr>,
    promise: ChannelPromise,
}

struct Core {
    flags: ChannelFlags,
    token: Option<IoToken>,
    // First error wins; later failures keep the original cause.
    errno: Option<Error>,
    outbound: VecDeque<Outbound>,
    outbound_bytes: usize,
    // Bandwidth limit in bytes per second, zero for unlimited, and the current bucket budget.
    limit: usize,
    budget: usize,
    fn_read: Option<IoEventFn>,
    fn_write: Option<IoEventFn>,
    on_connected: Option<ConnectedFn>,
    on_read: Option<ReadFn>,
    on_read_from: Option<ReadFromFn>,
    on_closed: Option<ClosedFn>,
}

enum Drain {
    /// The outbound queue is empty.
    Drained,
    /// The socket would block; resume on write readiness.
    WouldBlock,
    /// The bandwidth budget is exhausted; resume from the refill tick.
    Bandwidth,
    Failed(Error),
}

pub struct SocketChannel {
    weak: Weak<SocketChannel>,
    l: Arc<EventLoop>,
    // Raw copy of the descriptor for syscalls; the owned handle is dropped by the deferred
    // cleanup task, strictly after the poller deregistration.
    raw: RawFd,
    fd: Mutex<Option<OwnedFd>>,
    kind: SockKind,
    fast_write: bool,
    snd_cap: usize,
    core: Mutex<Core>,
}

impl SocketChannel {
    fn from_fd(
        l: Arc<EventLoop>,
        fd: OwnedFd,
        kind: SockKind,
        cfg: &SocketConfig,
    ) -> Arc<SocketChannel> {
        let raw = fd.as_raw_fd();
        // A limit smaller than one byte per tick would never refill.
        let limit = if cfg.bandwidth_limit > 0 {
            cfg.bandwidth_limit.max(BDL_TICKS_PER_SEC)
        } else {
            0
        };
        Arc::new_cyclic(|weak| SocketChannel {
            weak: weak.clone(),
            l,
            raw,
            fd: Mutex::new(Some(fd)),
            kind,
            fast_write: cfg.fast_write,
            snd_cap: cfg.snd_cap,
            core: Mutex::new(Core {
                flags: ChannelFlags::new(),
                token: None,
                errno: None,
                outbound: VecDeque::new(),
                outbound_bytes: 0,
                limit,
                budget: limit,
                fn_read: None,
                fn_write: None,
                on_connected: None,
                on_read: None,
                on_read_from: None,
                on_closed: None,
            }),
        })
    }

    /// Create an unconnected channel with a fresh socket of `addr`'s family.
    pub fn open(
        l: Arc<EventLoop>,
        addr: &SocketAddr,
        cfg: &SocketConfig,
    ) -> Result<Arc<SocketChannel>> {
        let fd = match cfg.kind {
            SockKind::Stream => sys::stream_socket(addr)?,
            SockKind::Dgram => sys::dgram_socket(addr)?,
        };
        Ok(Self::from_fd(l, fd, cfg.kind, cfg))
    }

    /// Wrap a descriptor produced by the accept drain.
    pub(crate) fn accepted(
        l: Arc<EventLoop>,
        fd: OwnedFd,
        cfg: &SocketConfig,
    ) -> Arc<SocketChannel> {
        Self::from_fd(l, fd, SockKind::Stream, cfg)
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.core
            .lock()
            .expect("failed to lock channel core: poisoned")
    }

    fn me(&self) -> Arc<SocketChannel> {
        self.weak
            .upgrade()
            .expect("channel callback ran with no live handle")
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.l
    }

    pub fn kind(&self) -> SockKind {
        self.kind
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        sys::local_addr(self.raw)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        sys::peer_addr(self.raw)
    }

    /// Snapshot of the channel's lifecycle flags.
    pub fn flags(&self) -> ChannelFlags {
        self.core().flags
    }

    /// Bytes currently held in the outbound queue.
    pub fn outbound_bytes(&self) -> usize {
        self.core().outbound_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.core().flags.conn == Connectivity::Closed
    }

    /// The first error the channel recorded, if any.
    pub fn errno(&self) -> Option<Error> {
        self.core().errno
    }

    /// Whether a write issued right now could make progress: `Err(BandwidthLimited)` while the
    /// drain sits suspended on an exhausted token budget, `Err(WriteBlocked)` while the queue
    /// holds at least the configured byte cap, `Err(WriteClosed)` once the write half is gone.
    pub fn write_status(&self) -> Result<()> {
        let c = self.core();
        if c.flags.write.shutdown || c.flags.conn == Connectivity::Closed {
            return Err(Error::WriteClosed);
        }
        if c.flags.rate.suspended {
            return Err(Error::BandwidthLimited);
        }
        if c.outbound_bytes >= self.snd_cap {
            return Err(Error::WriteBlocked);
        }
        Ok(())
    }

    pub fn set_on_connected<F>(&self, f: F)
    where
        F: FnOnce(&Arc<SocketChannel>) + Send + 'static,
    {
        self.core().on_connected = Some(Box::new(f));
    }

    pub fn set_on_read<F>(&self, f: F)
    where
        F: FnMut(&Arc<SocketChannel>, &[u8]) + Send + 'static,
    {
        self.core().on_read = Some(Box::new(f));
    }

    pub fn set_on_read_from<F>(&self, f: F)
    where
        F: FnMut(&Arc<SocketChannel>, &[u8], SocketAddr) + Send + 'static,
    {
        self.core().on_read_from = Some(Box::new(f));
    }

    pub fn set_on_closed<F>(&self, f: F)
    where
        F: FnOnce(&Arc<SocketChannel>) + Send + 'static,
    {
        self.core().on_closed = Some(Box::new(f));
    }

    // ---- connect / bind / listen (owning-thread only) ----

    /// Begin a non-blocking connect. Owning-thread only; rejected unless the channel is idle.
    pub fn connect(&self, addr: &SocketAddr) -> Result<ConnectStart> {
        debug_assert!(self.l.in_event_loop());
        {
            let c = self.core();
            if matches!(
                c.flags.conn,
                Connectivity::Connecting
                    | Connectivity::Connected
                    | Connectivity::Listening
                    | Connectivity::Closed
            ) {
                return Err(Error::InvalidState);
            }
        }
        match sys::start_connect(self.raw, addr) {
            Ok(ConnectStart::Connected) => {
                self.core().flags.conn = Connectivity::Connected;
                Ok(ConnectStart::Connected)
            }
            Ok(ConnectStart::InProgress) => {
                self.core().flags.conn = Connectivity::Connecting;
                Ok(ConnectStart::InProgress)
            }
            Err(e) => {
                let mut c = self.core();
                c.flags.write.error = true;
                c.errno.get_or_insert(e);
                Err(e)
            }
        }
    }

    /// Bind the socket. Owning-thread only; rejected unless the channel is idle.
    pub fn bind(&self, addr: &SocketAddr) -> Result<()> {
        debug_assert!(self.l.in_event_loop());
        if self.core().flags.conn != Connectivity::Idle {
            return Err(Error::InvalidState);
        }
        let guard = self.fd.lock().expect("failed to lock channel fd: poisoned");
        let fd = guard.as_ref().ok_or(Error::AlreadyClosed)?;
        sys::bind_addr(fd, addr)
    }

    /// Move a bound stream socket into the listening state. Owning-thread only.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        debug_assert!(self.l.in_event_loop());
        if self.core().flags.conn != Connectivity::Idle {
            return Err(Error::InvalidState);
        }
        {
            let guard = self.fd.lock().expect("failed to lock channel fd: poisoned");
            let fd = guard.as_ref().ok_or(Error::AlreadyClosed)?;
            sys::listen_backlog(fd, backlog)?;
        }
        self.core().flags.conn = Connectivity::Listening;
        Ok(())
    }

    // ---- poller registration and watch management ----

    /// Register the descriptor with the owning loop's poller; `cb` fires on the loop thread
    /// with the registration result. On failure the channel closes itself first.
    pub fn ch_io_begin(&self, cb: Box<dyn FnOnce(IoStatus) + Send>) {
        if !self.l.in_event_loop() {
            let ch = self.me();
            self.l.execute(Box::new(move || ch.io_begin_inner(cb)));
            return;
        }
        self.io_begin_inner(cb);
    }

    fn io_begin_inner(&self, cb: Box<dyn FnOnce(IoStatus) + Send>) {
        debug_assert!(self.core().token.is_none());
        let monitor: Arc<dyn IoMonitor> = self.me();
        match self.l.io_begin(self.raw, monitor) {
            Some(token) => {
                self.core().token = Some(token);
                cb(Ok(()));
            }
            None => {
                warn!(fd = self.raw, "io begin rejected");
                {
                    let mut c = self.core();
                    c.flags.read.error = true;
                    c.errno.get_or_insert(Error::IoBeginFailed);
                }
                self.ch_close_impl(None);
                cb(Err(Error::IoBeginFailed));
            }
        }
    }

    /// Arm read readiness. `f` overrides the default read loop; `None` selects it.
    pub fn ch_io_read(&self, f: Option<IoEventFn>) {
        if self.l.in_event_loop() {
            self.io_read_inner(f);
            return;
        }
        let ch = self.me();
        self.l.execute(Box::new(move || ch.io_read_inner(f)));
    }

    fn io_read_inner(&self, f: Option<IoEventFn>) {
        let token = {
            let c = self.core();
            debug_assert!(!c.flags.read.shutting_down);
            if c.flags.read.watching {
                trace!(fd = self.raw, "read watch already armed");
                drop(c);
                if let Some(mut cb) = f {
                    cb(Err(Error::OpAlready));
                }
                return;
            }
            if c.flags.read.shutdown {
                drop(c);
                if let Some(mut cb) = f {
                    cb(Err(Error::ReadClosed));
                }
                return;
            }
            match c.token {
                Some(token) => token,
                None => {
                    drop(c);
                    if let Some(mut cb) = f {
                        cb(Err(Error::InvalidState));
                    }
                    return;
                }
            }
        };
        if let Err(e) = self.l.io_do(IoAction::Read, token) {
            if let Some(mut cb) = f {
                cb(Err(e));
            }
            return;
        }
        let mut c = self.core();
        c.flags.read.use_default = f.is_none();
        c.fn_read = f;
        c.flags.read.watching = true;
    }

    /// Arm write readiness. `f` overrides the default drain; `None` selects it.
    pub fn ch_io_write(&self, f: Option<IoEventFn>) {
        if self.l.in_event_loop() {
            self.io_write_inner(f);
            return;
        }
        let ch = self.me();
        self.l.execute(Box::new(move || ch.io_write_inner(f)));
    }

    fn io_write_inner(&self, f: Option<IoEventFn>) {
        let token = {
            let c = self.core();
            if c.flags.write.watching {
                trace!(fd = self.raw, "write watch already armed");
                drop(c);
                if let Some(mut cb) = f {
                    cb(Err(Error::OpAlready));
                }
                return;
            }
            if c.flags.write.shutdown {
                drop(c);
                if let Some(mut cb) = f {
                    cb(Err(Error::WriteClosed));
                }
                return;
            }
            match c.token {
                Some(token) => token,
                None => {
                    drop(c);
                    if let Some(mut cb) = f {
                        cb(Err(Error::InvalidState));
                    }
                    return;
                }
            }
        };
        if let Err(e) = self.l.io_do(IoAction::Write, token) {
            if let Some(mut cb) = f {
                cb(Err(e));
            }
            return;
        }
        let mut c = self.core();
        c.flags.write.use_default = f.is_none();
        c.fn_write = f;
        c.flags.write.watching = true;
    }

    /// Disarm read readiness and drop any override.
    pub fn ch_io_end_read(&self) {
        if self.l.in_event_loop() {
            self.io_end_read_inner();
            return;
        }
        let ch = self.me();
        self.l.execute(Box::new(move || ch.io_end_read_inner()));
    }

    fn io_end_read_inner(&self) {
        let (token, was_watching) = {
            let mut c = self.core();
            let was = c.flags.read.watching;
            c.flags.read.watching = false;
            c.flags.read.use_default = false;
            c.fn_read = None;
            (c.token, was)
        };
        if was_watching {
            if let Some(token) = token {
                let _ = self.l.io_do(IoAction::EndRead, token);
            }
        }
    }

    /// Disarm write readiness. When `fail` carries an error the displaced override is invoked
    /// with it, so a pending connect completion is never left unresolved.
    pub fn ch_io_end_write(&self) {
        if self.l.in_event_loop() {
            self.io_end_write_inner(None);
            return;
        }
        let ch = self.me();
        self.l.execute(Box::new(move || ch.io_end_write_inner(None)));
    }

    fn io_end_write_inner(&self, fail: Option<Error>) {
        let (token, was_watching, f) = {
            let mut c = self.core();
            let was = c.flags.write.watching;
            c.flags.write.watching = false;
            c.flags.write.use_default = false;
            (c.token, was, c.fn_write.take())
        };
        if was_watching {
            if let Some(token) = token {
                let _ = self.l.io_do(IoAction::EndWrite, token);
            }
        }
        if let (Some(mut cb), Some(e)) = (f, fail) {
            cb(Err(e));
        }
    }

    // ---- write path ----

    /// Queue `data` for transmission. Callable from any thread; the returned promise resolves
    /// once the bytes fully left for the kernel, or with the reason they never will.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> ChannelPromise {
        self.write_opt(data.into(), None)
    }

    /// Queue a datagram addressed to `to`. Datagram channels only.
    pub fn write_to(&self, data: impl Into<Vec<u8>>, to: SocketAddr) -> ChannelPromise {
        self.write_opt(data.into(), Some(to))
    }

    fn write_opt(&self, data: Vec<u8>, to: Option<SocketAddr>) -> ChannelPromise {
        let p: ChannelPromise = Arc::new(Promise::new());
        if data.is_empty() {
            p.set(Ok(()));
            return p;
        }
        if self.l.in_event_loop() {
            self.write_impl(data, to, p.clone());
        } else {
            let ch = self.me();
            let p2 = p.clone();
            self.l
                .execute(Box::new(move || ch.write_impl(data, to, p2)));
        }
        p
    }

    fn write_impl(&self, data: Vec<u8>, to: Option<SocketAddr>, chp: ChannelPromise) {
        debug_assert!(self.l.in_event_loop());
        enum Path {
            Reject(Error),
            Queued,
            InlineDrain,
            ArmWatch,
        }
        let len = data.len();
        let path = {
            let mut c = self.core();
            if c.flags.read.error || c.flags.write.error {
                Path::Reject(Error::ReadWriteError)
            } else if c.flags.write.shutdown || c.flags.conn == Connectivity::Closed {
                Path::Reject(Error::WriteClosed)
            } else if c.flags.write.shutdown_pending
                || c.flags.write.shutting_down
                || matches!(
                    c.flags.conn,
                    Connectivity::ClosePending | Connectivity::Closing
                )
            {
                Path::Reject(Error::WriteShutdowning)
            } else if c.outbound_bytes > 0 && c.outbound_bytes + len > self.snd_cap {
                // Over the cap with data already pending: a drain must be in flight, the
                // caller retries once it makes room.
                debug_assert!(c.flags.write_in_flight() || c.flags.write.barrier);
                Path::Reject(Error::WriteBlocked)
            } else {
                c.outbound.push_back(Outbound {
                    data,
                    off: 0,
                    to,
                    promise: chp.clone(),
                });
                c.outbound_bytes += len;
                if c.flags.write.barrier
                    || c.flags.write.watching
                    || c.flags.write.writing
                    || c.flags.rate.suspended
                {
                    Path::Queued
                } else if self.fast_write {
                    c.flags.write.barrier = true;
                    Path::InlineDrain
                } else {
                    Path::ArmWatch
                }
            }
        };
        match path {
            Path::Reject(e) => chp.set(Err(e)),
            Path::Queued => {}
            Path::InlineDrain => {
                self.cb_io_write_impl(Ok(()));
                self.core().flags.write.barrier = false;
            }
            Path::ArmWatch => self.io_write_inner(None),
        }
    }

    /// The default write readiness handler: run the drain, then route its outcome.
    fn cb_io_write_impl(&self, status: IoStatus) {
        debug_assert!(self.l.in_event_loop());
        if let Err(e) = status {
            self.write_fail(e);
            return;
        }
        {
            let mut c = self.core();
            debug_assert!(!c.flags.write.shutting_down);
            debug_assert!(!c.flags.rate.suspended);
            debug_assert!(c.flags.conn != Connectivity::Closing);
            if c.flags.write.shutdown || c.flags.write.error {
                return;
            }
            c.flags.write.writing = true;
        }
        let outcome = match self.kind {
            SockKind::Stream => self.drain_stream(),
            SockKind::Dgram => self.drain_dgram(),
        };
        self.core().flags.write.writing = false;
        self.handle_write_done(outcome);
    }

    fn drain_stream(&self) -> Drain {
        loop {
            let mut fulfilled: Option<ChannelPromise> = None;
            let mut arm_timer = false;
            {
                let mut c = self.core();
                if c.outbound.is_empty() {
                    return Drain::Drained;
                }
                let limit = c.limit;
                let budget = c.budget;
                if limit > 0 && budget == 0 {
                    debug_assert!(c.flags.rate.timer_armed);
                    return Drain::Bandwidth;
                }
                let front = c.outbound.front_mut().unwrap();
                let avail = front.data.len() - front.off;
                let wlen = if limit > 0 { avail.min(budget) } else { avail };
                let sent = match sys::send_some(self.raw, &front.data[front.off..front.off + wlen])
                {
                    Err(e) => return Drain::Failed(e),
                    Ok(None) => return Drain::WouldBlock,
                    Ok(Some(n)) => n,
                };
                front.off += sent;
                let finished = front.off == front.data.len();
                c.outbound_bytes -= sent;
                if limit > 0 {
                    c.budget -= sent;
                    // Arm the refill before the budget actually runs dry.
                    if !c.flags.rate.timer_armed && c.budget * 2 < limit {
                        c.flags.rate.timer_armed = true;
                        arm_timer = true;
                    }
                }
                if finished {
                    let entry = c.outbound.pop_front().unwrap();
                    fulfilled = Some(entry.promise);
                }
            }
            // Outside the lock: a continuation may write or close this channel again.
            if let Some(p) = fulfilled {
                p.set(Ok(()));
            }
            if arm_timer {
                self.launch_refill_timer();
            }
        }
    }

    fn drain_dgram(&self) -> Drain {
        loop {
            let fulfilled;
            {
                let mut c = self.core();
                let Some(front) = c.outbound.front() else {
                    return Drain::Drained;
                };
                let len = front.data.len();
                let sent = match front.to {
                    Some(to) => sys::send_to(self.raw, &front.data, &to),
                    None => sys::send_some(self.raw, &front.data),
                };
                match sent {
                    Err(e) => return Drain::Failed(e),
                    Ok(None) => return Drain::WouldBlock,
                    Ok(Some(n)) => {
                        // Datagrams leave whole or not at all.
                        debug_assert_eq!(n, len);
                        let entry = c.outbound.pop_front().unwrap();
                        c.outbound_bytes -= len;
                        fulfilled = entry.promise;
                    }
                }
            }
            fulfilled.set(Ok(()));
        }
    }

    fn handle_write_done(&self, outcome: Drain) {
        match outcome {
            Drain::Drained => {
                self.io_end_write_inner(None);
                let (close_write, close_all) = {
                    let c = self.core();
                    if c.flags.write.shutdown_pending {
                        (true, false)
                    } else if c.flags.conn == Connectivity::ClosePending {
                        (false, true)
                    } else {
                        (false, false)
                    }
                };
                if close_write {
                    self.do_close_write();
                    self.rdwr_shutdown_check();
                } else if close_all {
                    self.do_close_read_write();
                }
            }
            Drain::WouldBlock => self.io_write_inner(None),
            Drain::Bandwidth => {
                {
                    let mut c = self.core();
                    debug_assert!(c.flags.rate.timer_armed);
                    c.flags.rate.suspended = true;
                }
                self.io_end_write_inner(None);
            }
            Drain::Failed(e) => self.write_fail(e),
        }
    }

    fn write_fail(&self, e: Error) {
        warn!(fd = self.raw, error = %e, "channel write failed");
        {
            let mut c = self.core();
            c.flags.write.error = true;
            c.errno.get_or_insert(e);
        }
        self.ch_close_impl(None);
    }

    // ---- bandwidth refill ----

    fn launch_refill_timer(&self) {
        let ch = self.me();
        let t = Timer::new(BDL_TICK, move |t| ch.tmcb_refill(t));
        self.l.launch(t);
    }

    /// One refill tick of the token bucket. Re-submits itself while the bucket is below the
    /// limit; stops quietly once the write half is gone or the loop is terminating.
    fn tmcb_refill(&self, t: &Arc<Timer>) {
        debug_assert!(self.l.in_event_loop());
        let (relaunch, resume) = {
            let mut c = self.core();
            debug_assert!(c.limit > 0);
            debug_assert!(c.flags.rate.timer_armed);
            c.flags.rate.timer_armed = false;
            if c.flags.write.shutdown || c.flags.write.error || c.flags.loop_terminating {
                return;
            }
            let tokens = c.limit / BDL_TICKS_PER_SEC;
            let mut relaunch = false;
            if c.budget + tokens >= c.limit {
                c.budget = c.limit;
            } else {
                c.budget += tokens;
                c.flags.rate.timer_armed = true;
                relaunch = true;
            }
            let resume = c.flags.rate.suspended;
            if resume {
                debug_assert!(!c.flags.write.watching && !c.flags.write.barrier);
                c.flags.rate.suspended = false;
                c.flags.write.barrier = true;
            }
            (relaunch, resume)
        };
        if relaunch {
            self.l.launch(t.clone());
        }
        if resume {
            self.cb_io_write_impl(Ok(()));
            self.core().flags.write.barrier = false;
        }
    }

    // ---- read path ----

    /// The default stream read loop: recv into the loop's shared buffer until would-block,
    /// handing each chunk to the `on_read` callback.
    fn cb_io_read_impl(&self, status: IoStatus) {
        debug_assert!(self.l.in_event_loop());
        if let Err(e) = status {
            self.read_fail(e);
            return;
        }
        enum Step {
            Again,
            Idle,
            Eof,
            Failed(Error),
        }
        loop {
            {
                let c = self.core();
                debug_assert!(!c.flags.read.shutting_down);
                if c.flags.read.shutdown
                    || c.flags.read.error
                    || matches!(
                        c.flags.conn,
                        Connectivity::ClosePending | Connectivity::Closing | Connectivity::Closed
                    )
                {
                    return;
                }
            }
            let mut on_read = self.core().on_read.take();
            let step = self.l.with_read_buf(|buf| match sys::recv_some(self.raw, buf) {
                Ok(Recv::Data(n)) => {
                    if let Some(ref mut f) = on_read {
                        f(&self.me(), &buf[..n]);
                    } else {
                        trace!(fd = self.raw, n, "inbound bytes dropped, no read callback");
                    }
                    Step::Again
                }
                Ok(Recv::Eof) => Step::Eof,
                Ok(Recv::WouldBlock) => Step::Idle,
                Err(e) => Step::Failed(e),
            });
            if let Some(f) = on_read {
                let mut c = self.core();
                if c.on_read.is_none() {
                    c.on_read = Some(f);
                }
            }
            match step {
                Step::Again => continue,
                Step::Idle => return,
                Step::Eof => {
                    debug!(fd = self.raw, "peer shut down its write half");
                    self.do_close_read();
                    self.rdwr_shutdown_check();
                    return;
                }
                Step::Failed(e) => {
                    self.read_fail(e);
                    return;
                }
            }
        }
    }

    /// The default datagram read loop.
    fn cb_io_read_from_impl(&self, status: IoStatus) {
        debug_assert!(self.l.in_event_loop());
        if let Err(e) = status {
            self.read_fail(e);
            return;
        }
        enum Step {
            Again,
            Idle,
            Failed(Error),
        }
        loop {
            {
                let c = self.core();
                if c.flags.read.shutdown
                    || c.flags.read.error
                    || matches!(
                        c.flags.conn,
                        Connectivity::ClosePending | Connectivity::Closing | Connectivity::Closed
                    )
                {
                    return;
                }
            }
            let (mut on_read_from, mut on_read) = {
                let mut c = self.core();
                (c.on_read_from.take(), c.on_read.take())
            };
            let step = self
                .l
                .with_read_buf(|buf| match sys::recv_from(self.raw, buf) {
                    Ok((Recv::Data(n), Some(from))) => {
                        if let Some(ref mut f) = on_read_from {
                            f(&self.me(), &buf[..n], from);
                        } else if let Some(ref mut f) = on_read {
                            // Connected datagram channels may install the plain read callback.
                            f(&self.me(), &buf[..n]);
                        }
                        Step::Again
                    }
                    // Senderless or empty datagrams carry nothing to deliver.
                    Ok((Recv::Data(_), None)) | Ok((Recv::Eof, _)) => Step::Again,
                    Ok((Recv::WouldBlock, _)) => Step::Idle,
                    Err(e) => Step::Failed(e),
                });
            {
                let mut c = self.core();
                if let Some(f) = on_read_from {
                    if c.on_read_from.is_none() {
                        c.on_read_from = Some(f);
                    }
                }
                if let Some(f) = on_read {
                    if c.on_read.is_none() {
                        c.on_read = Some(f);
                    }
                }
            }
            match step {
                Step::Again => continue,
                Step::Idle => return,
                Step::Failed(e) => {
                    self.read_fail(e);
                    return;
                }
            }
        }
    }

    fn read_fail(&self, e: Error) {
        warn!(fd = self.raw, error = %e, "channel read failed");
        {
            let mut c = self.core();
            c.flags.read.error = true;
            c.errno.get_or_insert(e);
        }
        self.ch_close_impl(None);
    }

    // ---- close paths ----

    /// Request a close. Callable from any thread. Resolves `Ok` once both halves are down;
    /// resolves `Err(CloseInProgress)` immediately when a write drain is in flight, in which
    /// case the channel still closes by itself once the drain settles.
    pub fn close(&self) -> ChannelPromise {
        let p: ChannelPromise = Arc::new(Promise::new());
        if self.l.in_event_loop() {
            self.ch_close_impl(Some(p.clone()));
            return p;
        }
        let ch = self.me();
        let p2 = p.clone();
        self.l.execute(Box::new(move || ch.ch_close_impl(Some(p2))));
        p
    }

    /// Shut down the write half only, after any in-flight drain completes.
    pub fn close_write(&self) -> ChannelPromise {
        let p: ChannelPromise = Arc::new(Promise::new());
        if self.l.in_event_loop() {
            self.ch_close_write_impl(Some(p.clone()));
            return p;
        }
        let ch = self.me();
        let p2 = p.clone();
        self.l
            .execute(Box::new(move || ch.ch_close_write_impl(Some(p2))));
        p
    }

    pub(crate) fn ch_close_impl(&self, chp: Option<ChannelPromise>) {
        debug_assert!(self.l.in_event_loop());
        enum Action {
            Reject(Error),
            Listener,
            Deferred,
            Now,
        }
        let action = {
            let mut c = self.core();
            match c.flags.conn {
                Connectivity::Closed => Action::Reject(Error::AlreadyClosed),
                Connectivity::Listening => Action::Listener,
                Connectivity::ClosePending | Connectivity::Closing => {
                    Action::Reject(Error::OpInProcess)
                }
                _ => {
                    let errored =
                        c.flags.read.error || c.flags.write.error || c.flags.loop_terminating;
                    if !errored && c.flags.write_in_flight() {
                        c.flags.conn = Connectivity::ClosePending;
                        Action::Deferred
                    } else {
                        if c.flags.conn == Connectivity::Connecting && c.errno.is_none() {
                            c.flags.write.error = true;
                            c.errno = Some(Error::Aborted);
                        }
                        Action::Now
                    }
                }
            }
        };
        match action {
            Action::Reject(e) => {
                if let Some(p) = chp {
                    p.set(Err(e));
                }
            }
            Action::Deferred => {
                trace!(fd = self.raw, "close deferred behind in-flight write");
                if let Some(p) = chp {
                    p.set(Err(Error::CloseInProgress));
                }
            }
            Action::Listener => {
                self.do_close_listener();
                if let Some(p) = chp {
                    p.set(Ok(()));
                }
            }
            Action::Now => {
                self.do_close_read_write();
                if let Some(p) = chp {
                    p.set(Ok(()));
                }
            }
        }
    }

    fn ch_close_write_impl(&self, chp: Option<ChannelPromise>) {
        debug_assert!(self.l.in_event_loop());
        enum Action {
            Reject(Error),
            Defer,
            Now,
        }
        let action = {
            let mut c = self.core();
            if c.flags.write.shutting_down
                || matches!(
                    c.flags.conn,
                    Connectivity::ClosePending | Connectivity::Closing
                )
            {
                Action::Reject(Error::OpInProcess)
            } else if c.flags.write.shutdown_pending {
                Action::Reject(Error::WriteShutdowning)
            } else if c.flags.write.shutdown || c.flags.conn == Connectivity::Closed {
                Action::Reject(Error::WriteClosed)
            } else if c.flags.write_in_flight() {
                c.flags.write.shutdown_pending = true;
                Action::Defer
            } else {
                Action::Now
            }
        };
        match action {
            Action::Reject(e) => {
                if let Some(p) = chp {
                    p.set(Err(e));
                }
            }
            Action::Defer => {
                if let Some(p) = chp {
                    p.set(Err(Error::WriteShutdowning));
                }
            }
            Action::Now => {
                self.do_close_write();
                self.rdwr_shutdown_check();
                if let Some(p) = chp {
                    p.set(Ok(()));
                }
            }
        }
    }

    fn do_close_read(&self) {
        {
            let mut c = self.core();
            if c.flags.read.shutting_down || c.flags.read.shutdown {
                return;
            }
            c.flags.read.shutting_down = true;
        }
        self.io_end_read_inner();
        let _ = sys::shutdown_read(self.raw);
        let mut c = self.core();
        c.flags.read.shutdown = true;
        c.flags.read.shutting_down = false;
    }

    fn do_close_write(&self) {
        let (queued, err) = {
            let mut c = self.core();
            if c.flags.write.shutting_down || c.flags.write.shutdown {
                return;
            }
            c.flags.write.shutting_down = true;
            c.flags.write.shutdown_pending = false;
            c.flags.rate.suspended = false;
            let err = c.errno.unwrap_or(Error::WriteClosed);
            let queued: Vec<Outbound> = c.outbound.drain(..).collect();
            c.outbound_bytes = 0;
            (queued, err)
        };
        // Every still-queued entry fails with the channel's recorded cause.
        for entry in queued {
            entry.promise.set(Err(err));
        }
        self.io_end_write_inner(Some(err));
        let _ = sys::shutdown_write(self.raw);
        let mut c = self.core();
        c.flags.write.shutdown = true;
        c.flags.write.shutting_down = false;
    }

    fn do_close_read_write(&self) {
        {
            let mut c = self.core();
            if matches!(
                c.flags.conn,
                Connectivity::Closing | Connectivity::Closed
            ) {
                return;
            }
            c.flags.conn = Connectivity::Closing;
        }
        self.do_close_read();
        self.do_close_write();
        {
            let c = self.core();
            debug_assert!(c.outbound.is_empty());
            debug_assert_eq!(c.outbound_bytes, 0);
        }
        self.rdwr_shutdown_check();
    }

    fn do_close_listener(&self) {
        {
            let mut c = self.core();
            debug_assert_eq!(c.flags.conn, Connectivity::Listening);
            c.flags.conn = Connectivity::Closed;
            c.flags.read.shutdown = true;
            c.flags.write.shutdown = true;
        }
        self.io_end_read_inner();
        self.ch_cleanup();
    }

    fn rdwr_shutdown_check(&self) {
        let closed = {
            let mut c = self.core();
            if c.flags.conn != Connectivity::Closed
                && c.flags.read.shutdown
                && c.flags.write.shutdown
            {
                c.flags.conn = Connectivity::Closed;
                true
            } else {
                false
            }
        };
        if closed {
            self.ch_cleanup();
        }
    }

    /// Final teardown once the channel reached closed: fire `on_closed`, then deregister from
    /// the poller and drop the descriptor one loop tick later so readiness already dispatched
    /// in this pass settles against a live registration.
    fn ch_cleanup(&self) {
        debug_assert!(self.l.in_event_loop());
        let (token, on_closed) = {
            let mut c = self.core();
            debug_assert_eq!(c.flags.conn, Connectivity::Closed);
            debug_assert!(c.outbound.is_empty());
            c.flags.check();
            c.fn_read = None;
            c.fn_write = None;
            c.on_read = None;
            c.on_read_from = None;
            c.on_connected = None;
            (c.token.take(), c.on_closed.take())
        };
        debug!(fd = self.raw, "channel closed");
        if let Some(f) = on_closed {
            f(&self.me());
        }
        let l = self.l.clone();
        let ch = self.me();
        self.l.schedule(Box::new(move || {
            if let Some(token) = token {
                l.io_end(token);
            }
            let _ = ch
                .fd
                .lock()
                .expect("failed to lock channel fd: poisoned")
                .take();
        }));
    }

    // ---- dial orchestration (owning-thread only) ----

    pub(crate) fn do_dial(
        &self,
        addr: SocketAddr,
        initializer: ChannelInitializer,
        dialp: ChannelPromise,
    ) {
        debug_assert!(self.l.in_event_loop());
        let ch = self.me();
        self.ch_io_begin(Box::new(move |status| {
            if let Err(e) = status {
                dialp.set(Err(e));
                return;
            }
            match ch.connect(&addr) {
                Ok(ConnectStart::Connected) => ch.dial_done(Ok(()), addr, &initializer, &dialp),
                Ok(ConnectStart::InProgress) => {
                    let ch2 = ch.clone();
                    let dialp2 = dialp.clone();
                    let init2 = initializer.clone();
                    ch.io_write_inner(Some(Box::new(move |status| {
                        ch2.dial_done(status, addr, &init2, &dialp2)
                    })));
                }
                Err(e) => {
                    warn!(%addr, error = %e, "connect failed");
                    ch.ch_close_impl(None);
                    dialp.set(Err(e));
                }
            }
        }));
    }

    /// Connect completion: verify the endpoints, run the initializer, then go connected and
    /// arm the default read.
    fn dial_done(
        &self,
        status: IoStatus,
        target: SocketAddr,
        initializer: &ChannelInitializer,
        dialp: &ChannelPromise,
    ) {
        debug_assert!(self.l.in_event_loop());
        if let Err(e) = status {
            return self.dial_fail(e, dialp);
        }
        if self.core().flags.conn == Connectivity::Closed {
            return self.dial_fail(Error::Aborted, dialp);
        }
        let laddr = match sys::local_addr(self.raw) {
            Ok(a) => a,
            Err(e) => return self.dial_fail(e, dialp),
        };
        let raddr = match sys::peer_addr(self.raw) {
            Ok(a) => a,
            Err(e) => return self.dial_fail(e, dialp),
        };
        if raddr != target {
            return self.dial_fail(Error::AddrMismatch, dialp);
        }
        if laddr == raddr {
            return self.dial_fail(Error::SelfConnected, dialp);
        }
        if let Err(e) = initializer(&self.me()) {
            return self.dial_fail(e, dialp);
        }
        self.core().flags.conn = Connectivity::Connected;
        self.io_end_write_inner(None);
        debug!(fd = self.raw, %laddr, %raddr, "channel connected");
        dialp.set(Ok(()));
        self.fire_connected();
        self.io_read_inner(None);
    }

    fn dial_fail(&self, e: Error, dialp: &ChannelPromise) {
        warn!(fd = self.raw, error = %e, "dial failed");
        {
            let mut c = self.core();
            c.flags.write.error = true;
            c.errno.get_or_insert(e);
        }
        self.io_end_write_inner(None);
        self.ch_close_impl(None);
        if !dialp.is_done() {
            dialp.set(Err(e));
        }
    }

    fn fire_connected(&self) {
        let f = self.core().on_connected.take();
        if let Some(f) = f {
            f(&self.me());
        }
    }

    // ---- listen orchestration (owning-thread only) ----

    pub(crate) fn do_listen_on(
        &self,
        addr: SocketAddr,
        cfg: SocketConfig,
        initializer: ChannelInitializer,
        group: Arc<EventLoopGroup>,
        listenp: ChannelPromise,
    ) {
        debug_assert!(self.l.in_event_loop());
        if let Err(e) = self.bind(&addr) {
            return self.listen_fail(e, &listenp);
        }
        if self.kind == SockKind::Dgram {
            // A bound datagram endpoint has no accept phase; datagrams arrive on this channel
            // directly through the default read-from loop.
            let ch = self.me();
            self.ch_io_begin(Box::new(move |status| {
                if let Err(e) = status {
                    listenp.set(Err(e));
                    return;
                }
                if let Err(e) = initializer(&ch) {
                    return ch.listen_fail(e, &listenp);
                }
                ch.core().flags.conn = Connectivity::Connected;
                listenp.set(Ok(()));
                ch.fire_connected();
                ch.io_read_inner(None);
            }));
            return;
        }
        if let Err(e) = self.listen(cfg.backlog) {
            return self.listen_fail(e, &listenp);
        }
        let ch = self.me();
        self.ch_io_begin(Box::new(move |status| {
            if let Err(e) = status {
                listenp.set(Err(e));
                return;
            }
            listenp.set(Ok(()));
            let ch2 = ch.clone();
            ch.io_read_inner(Some(Box::new(move |status| {
                ch2.accept_impl(status, &cfg, &initializer, &group)
            })));
        }));
    }

    fn listen_fail(&self, e: Error, listenp: &ChannelPromise) {
        warn!(fd = self.raw, error = %e, "listen failed");
        {
            let mut c = self.core();
            c.flags.read.error = true;
            c.errno.get_or_insert(e);
        }
        self.ch_close_impl(None);
        if !listenp.is_done() {
            listenp.set(Err(e));
        }
    }

    /// The accept drain installed as the listener's read override: accept until would-block
    /// and hand each new descriptor to a loop picked from the group.
    fn accept_impl(
        &self,
        status: IoStatus,
        cfg: &SocketConfig,
        initializer: &ChannelInitializer,
        group: &Arc<EventLoopGroup>,
    ) {
        debug_assert!(self.l.in_event_loop());
        if self.core().flags.conn == Connectivity::Closed {
            return;
        }
        if let Err(e) = status {
            self.read_fail(e);
            return;
        }
        loop {
            match sys::accept_one(self.raw) {
                Ok(None) => return,
                Ok(Some((nfd, raddr))) => {
                    let laddr = match sys::local_addr(nfd.as_raw_fd()) {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, "accepted socket unusable, discarding");
                            continue;
                        }
                    };
                    // A victim of TCP simultaneous open connects to itself; drop it.
                    if Some(laddr) == raddr {
                        warn!(%laddr, "discarding self-connected accept");
                        continue;
                    }
                    let target = group.next();
                    let cfg = cfg.clone();
                    let init = initializer.clone();
                    let t2 = target.clone();
                    target.execute(Box::new(move || {
                        let ch = SocketChannel::accepted(t2, nfd, &cfg);
                        ch.accept_fire(init);
                    }));
                }
                // Out of descriptors is survivable; keep listening and let load shed.
                Err(Error::Os(Errno::EMFILE)) => {
                    warn!(fd = self.raw, "accept hit the descriptor limit");
                    return;
                }
                Err(e) => {
                    self.read_fail(e);
                    return;
                }
            }
        }
    }

    /// Bring an accepted channel up on its own loop: register, initialize, go connected and
    /// arm the default read.
    pub(crate) fn accept_fire(&self, initializer: ChannelInitializer) {
        debug_assert!(self.l.in_event_loop());
        let ch = self.me();
        self.ch_io_begin(Box::new(move |status| {
            if status.is_err() {
                // The begin failure path already closed the channel.
                return;
            }
            if let Err(e) = initializer(&ch) {
                warn!(fd = ch.raw, error = %e, "channel initializer failed");
                {
                    let mut c = ch.core();
                    c.flags.read.error = true;
                    c.errno.get_or_insert(e);
                }
                ch.ch_close_impl(None);
                return;
            }
            ch.core().flags.conn = Connectivity::Connected;
            ch.fire_connected();
            ch.io_read_inner(None);
        }));
    }
}

impl IoMonitor for SocketChannel {
    fn io_notify_read(&self, status: IoStatus, _token: IoToken) {
        let (use_default, mut f) = {
            let mut c = self.core();
            if !c.flags.read.watching {
                return;
            }
            let use_default = c.flags.read.use_default;
            let f = if use_default { None } else { c.fn_read.take() };
            (use_default, f)
        };
        if use_default {
            let ch = self.me();
            match self.kind {
                SockKind::Stream => ch.cb_io_read_impl(status),
                SockKind::Dgram => ch.cb_io_read_from_impl(status),
            }
            return;
        }
        if let Some(ref mut cb) = f {
            cb(status);
        }
        if let Some(cb) = f {
            // Put the override back unless the handler disarmed or replaced the watch.
            let mut c = self.core();
            if c.flags.read.watching && !c.flags.read.use_default && c.fn_read.is_none() {
                c.fn_read = Some(cb);
            }
        }
    }

    fn io_notify_write(&self, status: IoStatus, _token: IoToken) {
        let (use_default, mut f) = {
            let mut c = self.core();
            if !c.flags.write.watching {
                return;
            }
            let use_default = c.flags.write.use_default;
            let f = if use_default { None } else { c.fn_write.take() };
            (use_default, f)
        };
        if use_default {
            self.me().cb_io_write_impl(status);
            return;
        }
        if let Some(ref mut cb) = f {
            cb(status);
        }
        if let Some(cb) = f {
            let mut c = self.core();
            if c.flags.write.watching && !c.flags.write.use_default && c.fn_write.is_none() {
                c.fn_write = Some(cb);
            }
        }
    }

    /// Forced abort: record the terminating cause, fail everything still queued, and close
    /// both halves immediately, overriding any deferred-close state.
    fn io_notify_terminating(&self, _status: IoStatus, _token: IoToken) {
        debug_assert!(self.l.in_event_loop());
        {
            let mut c = self.core();
            if c.flags.conn == Connectivity::Closed {
                return;
            }
            c.flags.loop_terminating = true;
            c.errno = Some(Error::LoopTerminating);
            if c.flags.conn == Connectivity::ClosePending {
                c.flags.conn = Connectivity::Connected;
            }
            c.flags.rate.suspended = false;
            c.flags.write.shutdown_pending = false;
        }
        let ch = self.me();
        if ch.core().flags.conn == Connectivity::Listening {
            ch.do_close_listener();
        } else {
            ch.do_close_read_write();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    use super::*;
    use crate::poller::default_poller;

    fn started_loop() -> Arc<EventLoop> {
        let l = EventLoop::new(
            default_poller().unwrap(),
            64 * 1024,
            "netloop-ch-test".to_string(),
        );
        l.start().unwrap();
        l
    }

    fn stop(l: &Arc<EventLoop>) {
        l.notify_terminating();
        l.terminate();
    }

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    /// Wrap one end of a socketpair as a connected, registered channel.
    fn connected_channel(
        l: &Arc<EventLoop>,
        fd: OwnedFd,
        cfg: &SocketConfig,
    ) -> Arc<SocketChannel> {
        let ch = SocketChannel::accepted(l.clone(), fd, cfg);
        ch.core().flags.conn = Connectivity::Connected;
        let ready: ChannelPromise = Arc::new(Promise::new());
        let r2 = ready.clone();
        ch.ch_io_begin(Box::new(move |st| r2.set(st)));
        ready.wait().unwrap();
        ch
    }

    /// Drain the peer end on a background thread until it sees EOF or `stop` flips.
    fn spawn_reader(peer: OwnedFd, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<usize> {
        std::thread::spawn(move || {
            let mut buf = [0u8; 16 * 1024];
            let mut total = 0usize;
            while !stop.load(Ordering::Relaxed) {
                match nix::unistd::read(peer.as_raw_fd(), &mut buf) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(Errno::EAGAIN) => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(_) => break,
                }
            }
            total
        })
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn sync(l: &Arc<EventLoop>) {
        let p = Arc::new(Promise::new());
        let p2 = p.clone();
        l.execute(Box::new(move || p2.set(())));
        p.wait();
    }

    #[test]
    fn connect_on_a_connected_channel_is_rejected() {
        let l = started_loop();
        let (a, _b) = pair();
        let ch = connected_channel(&l, a, &SocketConfig::default());

        let p: Arc<Promise<Result<ConnectStart>>> = Arc::new(Promise::new());
        let p2 = p.clone();
        let ch2 = ch.clone();
        l.execute(Box::new(move || {
            p2.set(ch2.connect(&"127.0.0.1:9".parse().unwrap()));
        }));
        assert_eq!(p.wait(), Err(Error::InvalidState));
        assert_eq!(ch.flags().conn, Connectivity::Connected);

        drop(ch);
        stop(&l);
    }

    #[test]
    fn over_cap_write_is_rejected_and_queue_untouched() {
        let l = started_loop();
        let (a, b) = pair();
        let cfg = SocketConfig {
            snd_cap: 1024,
            ..SocketConfig::default()
        };
        let ch = connected_channel(&l, a, &cfg);

        // Nobody reads the peer yet, so most of this stays queued.
        let p1 = ch.write(vec![0u8; 1024 * 1024]);
        sync(&l);
        let queued = ch.outbound_bytes();
        assert!(queued > 0, "peer buffers absorbed the whole write");
        assert_eq!(p1.peek(), None);
        assert_eq!(ch.write_status(), Err(Error::WriteBlocked));

        let p2 = ch.write(vec![0u8; 2048]);
        let err = p2.wait().unwrap_err();
        assert_eq!(err, Error::WriteBlocked);
        assert!(err.is_backpressure());
        assert_eq!(ch.outbound_bytes(), queued);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(b, stop_flag.clone());
        assert_eq!(p1.wait(), Ok(()));

        let rt = ch.close().wait();
        assert!(matches!(rt, Ok(()) | Err(Error::CloseInProgress)));
        wait_until("channel closed", || ch.is_closed());
        stop_flag.store(true, Ordering::Relaxed);
        reader.join().unwrap();

        drop(ch);
        stop(&l);
    }

    #[test]
    fn outbound_byte_counter_matches_queued_remainders() {
        let l = started_loop();
        let (a, b) = pair();
        let ch = connected_channel(&l, a, &SocketConfig::default());

        // Nobody reads yet, so the first write drains partially and the tail stays queued with
        // a non-zero offset.
        let p1 = ch.write(vec![3u8; 1024 * 1024]);
        let p2 = ch.write(vec![4u8; 4096]);
        sync(&l);
        {
            let c = ch.core();
            let remaining: usize = c.outbound.iter().map(|e| e.data.len() - e.off).sum();
            assert!(c.outbound_bytes > 0);
            assert_eq!(c.outbound_bytes, remaining);
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(b, stop_flag.clone());
        assert_eq!(p1.wait(), Ok(()));
        assert_eq!(p2.wait(), Ok(()));
        assert_eq!(ch.outbound_bytes(), 0);

        let rt = ch.close().wait();
        assert!(matches!(rt, Ok(()) | Err(Error::CloseInProgress)));
        wait_until("channel closed", || ch.is_closed());
        stop_flag.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        drop(ch);
        stop(&l);
    }

    #[test]
    fn close_while_writing_defers_until_the_drain_completes() {
        let l = started_loop();
        let (a, b) = pair();
        let ch = connected_channel(&l, a, &SocketConfig::default());

        let p = ch.write(vec![7u8; 1024 * 1024]);
        sync(&l);
        assert!(ch.outbound_bytes() > 0);

        assert_eq!(ch.close().wait(), Err(Error::CloseInProgress));
        assert_eq!(ch.flags().conn, Connectivity::ClosePending);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(b, stop_flag.clone());
        assert_eq!(p.wait(), Ok(()));
        wait_until("deferred close", || ch.is_closed());
        assert_eq!(ch.close().wait(), Err(Error::AlreadyClosed));

        stop_flag.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        drop(ch);
        stop(&l);
    }

    #[test]
    fn terminating_loop_fails_pending_writes_and_closes_the_channel() {
        let l = started_loop();
        let (a, _b) = pair();
        let ch = connected_channel(&l, a, &SocketConfig::default());

        let p = ch.write(vec![1u8; 1024 * 1024]);
        sync(&l);
        assert!(ch.outbound_bytes() > 0);

        l.notify_terminating();
        assert_eq!(p.wait(), Err(Error::LoopTerminating));
        wait_until("forced close", || ch.is_closed());
        assert_eq!(ch.errno(), Some(Error::LoopTerminating));

        l.terminate();
    }

    #[test]
    fn bandwidth_limit_paces_the_drain_over_refill_ticks() {
        let l = started_loop();
        let (a, b) = pair();
        let cfg = SocketConfig {
            bandwidth_limit: 1000,
            ..SocketConfig::default()
        };
        let ch = connected_channel(&l, a, &cfg);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(b, stop_flag.clone());

        // 1000 bytes leave on the initial budget; the remaining 400 need four 100-byte ticks.
        let begin = Instant::now();
        let p = ch.write(vec![9u8; 1400]);
        let mut saw_suspension = false;
        while !p.is_done() {
            {
                let c = ch.core();
                assert!(c.budget <= c.limit, "budget overran the limit");
            }
            if ch.write_status() == Err(Error::BandwidthLimited) {
                saw_suspension = true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(p.wait(), Ok(()));
        assert!(saw_suspension, "the drain never reported bandwidth suspension");
        let elapsed = begin.elapsed();
        assert!(
            elapsed >= Duration::from_millis(350),
            "drain finished too fast: {elapsed:?}"
        );

        let rt = ch.close().wait();
        assert!(matches!(rt, Ok(()) | Err(Error::CloseInProgress)));
        wait_until("channel closed", || ch.is_closed());
        stop_flag.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        drop(ch);
        stop(&l);
    }

    #[test]
    fn close_write_shuts_the_write_half_only() {
        let l = started_loop();
        let (a, b) = pair();
        let ch = connected_channel(&l, a, &SocketConfig::default());

        assert_eq!(ch.close_write().wait(), Ok(()));
        assert_eq!(ch.write(b"nope".to_vec()).wait(), Err(Error::WriteClosed));
        assert!(!ch.is_closed());

        // The peer observes EOF on its read half.
        let mut buf = [0u8; 8];
        wait_until("peer EOF", || {
            matches!(nix::unistd::read(b.as_raw_fd(), &mut buf), Ok(0))
        });

        let rt = ch.close().wait();
        assert!(matches!(rt, Ok(()) | Err(Error::CloseInProgress)));
        wait_until("channel closed", || ch.is_closed());
        drop(ch);
        stop(&l);
    }

    #[test]
    fn peer_eof_shuts_the_read_half_and_write_still_works() {
        let l = started_loop();
        let (a, b) = pair();
        let ch = connected_channel(&l, a, &SocketConfig::default());
        let ch2 = ch.clone();
        l.execute(Box::new(move || ch2.io_read_inner(None)));
        sync(&l);

        // Peer shuts down its write half; our read half should fold.
        nix::sys::socket::shutdown(b.as_raw_fd(), nix::sys::socket::Shutdown::Write).unwrap();
        wait_until("read half shutdown", || ch.flags().read.shutdown);
        assert!(!ch.is_closed());
        assert_eq!(ch.write(b"still open".to_vec()).wait(), Ok(()));

        let rt = ch.close().wait();
        assert!(matches!(rt, Ok(()) | Err(Error::CloseInProgress)));
        wait_until("channel closed", || ch.is_closed());
        drop(ch);
        drop(b);
        stop(&l);
    }
}
