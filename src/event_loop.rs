//! The single threaded event loop at the heart of the runtime.
//!
//! Each [EventLoop] owns one dedicated OS thread, a task queue pair, a [TimerBroker], and one
//! [Poller] instance. The central loop repeats: swap the cross-thread standby queue into the
//! active queue under a minimal lock, drain the active queue in one pass, fire due timers, then
//! park in the poller for the earliest deadline. All mutation of loop owned state happens on the
//! loop's own thread; callers elsewhere hop over via [EventLoop::execute] or
//! [EventLoop::schedule].
//!
//! The lifecycle moves forward only:
//!
//! ```text
//! Idle -> Launching -> Running -> Terminating -> Terminated -> Exit
//! ```
//!
//! Shutdown is two phased. [EventLoop::notify_terminating] flips Running to Terminating and
//! broadcasts the synthetic terminating notice to every live registration, which forces each
//! owning monitor to close and deregister; once the live registration count returns to the
//! baseline captured at Running entry the loop advances itself to Terminated.
//! [EventLoop::terminate], invoked by the managing thread and never by the loop itself, waits
//! for Terminated, flips to Exit, interrupts the parked poller, and joins the thread.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::io::{IoAction, IoMonitor, IoToken, Readiness};
use crate::poller::{Interrupter, Poller};
use crate::timer::{self, Timer, TimerBroker, TimerPromise};

/// A unit of work handed to a loop; always runs on the loop's thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Default per-loop read buffer size for channels using the default read path.
pub const DEFAULT_READ_BUF_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Launching = 1,
    Running = 2,
    Terminating = 3,
    Terminated = 4,
    Exit = 5,
}

impl LoopState {
    fn from_u8(v: u8) -> LoopState {
        match v {
            0 => LoopState::Idle,
            1 => LoopState::Launching,
            2 => LoopState::Running,
            3 => LoopState::Terminating,
            4 => LoopState::Terminated,
            _ => LoopState::Exit,
        }
    }
}

pub struct EventLoop {
    weak: Weak<EventLoop>,
    state: AtomicU8,
    standby: Mutex<Vec<Task>>,
    waiting: AtomicBool,
    poller: Mutex<Box<dyn Poller>>,
    interrupter: Arc<dyn Interrupter>,
    broker: Mutex<TimerBroker>,
    tid: OnceLock<ThreadId>,
    thread: Mutex<Option<JoinHandle<()>>>,
    io_count: AtomicUsize,
    io_baseline: AtomicUsize,
    // Reference count held by the runtime itself (pool slot + loop thread), recorded by the
    // group at insertion; a loop whose strong count equals this has no external holders.
    internal_refs: AtomicUsize,
    read_buf: Mutex<Vec<u8>>,
    name: String,
}

impl EventLoop {
    pub fn new(poller: Box<dyn Poller>, read_buf_size: usize, name: String) -> Arc<EventLoop> {
        let interrupter = poller.interrupter();
        Arc::new_cyclic(|weak| EventLoop {
            weak: weak.clone(),
            state: AtomicU8::new(LoopState::Idle as u8),
            standby: Mutex::new(Vec::new()),
            waiting: AtomicBool::new(false),
            poller: Mutex::new(poller),
            interrupter,
            broker: Mutex::new(TimerBroker::new()),
            tid: OnceLock::new(),
            thread: Mutex::new(None),
            io_count: AtomicUsize::new(0),
            io_baseline: AtomicUsize::new(0),
            internal_refs: AtomicUsize::new(0),
            read_buf: Mutex::new(vec![0u8; read_buf_size]),
            name,
        })
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn me(&self) -> Arc<EventLoop> {
        self.weak.upgrade().expect("event loop used after teardown")
    }

    fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Whether the calling thread is this loop's own thread. Every public entry point uses this
    /// to decide run-now versus hop-via-schedule.
    pub fn in_event_loop(&self) -> bool {
        self.tid.get() == Some(&thread::current().id())
    }

    fn push(&self, task: Task) {
        let mut q = self
            .standby
            .lock()
            .expect("failed to lock standby queue: poisoned");
        q.push(task);
    }

    /// Thread-safe enqueue; the task always lands on the standby queue and never runs inline.
    /// Interrupts a parked poller so the task starts promptly.
    pub fn execute(&self, task: Task) {
        self.push(task);
        if !self.in_event_loop() {
            self.interrupter.interrupt_wait();
        }
    }

    /// Thread-safe enqueue; like [EventLoop::execute] but only wakes the poller when it is
    /// actually parked.
    pub fn schedule(&self, task: Task) {
        self.push(task);
        if !self.in_event_loop() && self.waiting.load(Ordering::SeqCst) {
            self.interrupter.interrupt_wait();
        }
    }

    /// Register a one-shot timer with this loop's broker.
    pub fn launch(&self, t: Arc<Timer>) {
        self.launch_with(t, None)
    }

    /// Register a one-shot timer; `completion` is fulfilled with `Ok` when the timer fires
    /// (including the forced expiry at shutdown) or `Err` when the loop rejects it.
    pub fn launch_with(&self, t: Arc<Timer>, completion: Option<TimerPromise>) {
        if self.state() >= LoopState::Terminated {
            timer::reject(completion);
            return;
        }
        if self.in_event_loop() {
            self.broker
                .lock()
                .expect("failed to lock timer broker: poisoned")
                .register(t, completion);
            return;
        }
        // Hop so the loop recomputes its poll deadline with the new timer in place.
        let l = self.me();
        self.execute(Box::new(move || {
            if l.state() >= LoopState::Terminated {
                timer::reject(completion);
            } else {
                l.broker
                    .lock()
                    .expect("failed to lock timer broker: poisoned")
                    .register(t, completion);
            }
        }));
    }

    /// Register a descriptor with this loop's poller. Returns `None` when the poller rejects
    /// the registration or the loop no longer accepts new descriptors.
    ///
    /// Owning-thread only.
    pub fn io_begin(&self, fd: RawFd, monitor: Arc<dyn IoMonitor>) -> Option<IoToken> {
        assert!(self.in_event_loop());
        if self.state() != LoopState::Running {
            return None;
        }
        let token = self
            .poller
            .lock()
            .expect("failed to lock poller: poisoned")
            .io_begin(fd, monitor)?;
        self.io_count.fetch_add(1, Ordering::AcqRel);
        Some(token)
    }

    /// Request an interest change for a registration. Owning-thread only.
    pub fn io_do(&self, action: IoAction, token: IoToken) -> Result<()> {
        assert!(self.in_event_loop());
        if action == IoAction::NotifyTerminating {
            self.broadcast_terminating();
            return Ok(());
        }
        self.poller
            .lock()
            .expect("failed to lock poller: poisoned")
            .io_do(action, token)
    }

    /// Drop a registration. Owning-thread only. While the loop is Terminating this drives the
    /// Terminated transition once the live count returns to baseline.
    pub fn io_end(&self, token: IoToken) {
        assert!(self.in_event_loop());
        let (live, backend_len) = {
            let mut poller = self.poller.lock().expect("failed to lock poller: poisoned");
            (poller.io_end(token), poller.len())
        };
        if !live {
            return;
        }
        let remaining = self.io_count.fetch_sub(1, Ordering::AcqRel) - 1;
        // The loop's own count and the backend's registration table must agree.
        debug_assert_eq!(backend_len, remaining);
        if self.state() == LoopState::Terminating
            && remaining == self.io_baseline.load(Ordering::Acquire)
        {
            self.enter_terminated();
        }
    }

    /// Number of live descriptor registrations.
    pub fn io_count(&self) -> usize {
        self.io_count.load(Ordering::Acquire)
    }

    /// A borrowed scratch read buffer shared by this loop's channels; owning-thread only.
    pub(crate) fn with_read_buf<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!(self.in_event_loop());
        let mut buf = self
            .read_buf
            .lock()
            .expect("failed to lock read buffer: poisoned");
        f(&mut buf)
    }

    pub(crate) fn store_internal_refs(&self, refs: usize) {
        self.internal_refs.store(refs, Ordering::Release);
    }

    pub(crate) fn internal_refs(&self) -> usize {
        self.internal_refs.load(Ordering::Acquire)
    }

    fn broadcast_terminating(&self) {
        let monitors = self
            .poller
            .lock()
            .expect("failed to lock poller: poisoned")
            .monitors();
        for (token, monitor) in monitors {
            monitor.io_notify_terminating(Err(Error::LoopTerminating), token);
        }
    }

    fn do_notify_terminating(&self) {
        assert!(self.in_event_loop());
        self.broadcast_terminating();
        if self.io_count.load(Ordering::Acquire) == self.io_baseline.load(Ordering::Acquire) {
            self.enter_terminated();
        }
    }

    fn enter_terminated(&self) {
        // No competitor here; only the loop thread performs this transition.
        assert!(self.in_event_loop());
        self.state
            .store(LoopState::Terminated as u8, Ordering::Release);
        debug!(name = %self.name, "event loop terminated");
        self.fire_expired_all();
    }

    /// Shutdown phase one: flip Running to Terminating and deliver the terminating notice to
    /// every live registration. Safe to call from any thread and idempotent.
    pub fn notify_terminating(&self) {
        if self.transition(LoopState::Running, LoopState::Terminating) {
            let l = self.me();
            self.execute(Box::new(move || l.do_notify_terminating()));
        }
    }

    /// Shutdown phase two, invoked by the managing thread and never by the loop itself: wait
    /// for Terminated, flip to Exit, interrupt the parked poller, and join the loop thread.
    pub fn terminate(&self) {
        assert!(!self.in_event_loop());
        while self.state() < LoopState::Terminated {
            thread::sleep(Duration::from_millis(1));
        }
        if self.transition(LoopState::Terminated, LoopState::Exit) {
            trace!(name = %self.name, "enter exit, interrupting poller");
            self.interrupter.interrupt_wait();
            let handle = self
                .thread
                .lock()
                .expect("failed to lock thread handle: poisoned")
                .take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
        debug!(name = %self.name, "event loop terminate done");
    }

    /// Start the loop's thread. Blocks the caller until the loop reaches Running.
    pub fn start(&self) -> Result<()> {
        let launched = self.transition(LoopState::Idle, LoopState::Launching);
        assert!(launched, "event loop started more than once");

        let l = self.me();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || l.run())
            .map_err(|_| Error::Os(nix::errno::Errno::EAGAIN))?;
        *self
            .thread
            .lock()
            .expect("failed to lock thread handle: poisoned") = Some(handle);

        let mut k = 0u32;
        while self.state() == LoopState::Launching {
            k += 1;
            if k > 64 {
                thread::sleep(Duration::from_micros(50));
            } else {
                thread::yield_now();
            }
        }
        Ok(())
    }

    fn fire_due_timers(&self) {
        let due = self
            .broker
            .lock()
            .expect("failed to lock timer broker: poisoned")
            .expire(Instant::now());
        for (t, completion) in due {
            t.fire();
            if let Some(p) = completion {
                p.set(Ok(()));
            }
        }
    }

    fn fire_expired_all(&self) {
        let all = self
            .broker
            .lock()
            .expect("failed to lock timer broker: poisoned")
            .expire_all();
        for (t, completion) in all {
            t.fire();
            if let Some(p) = completion {
                p.set(Ok(()));
            }
        }
    }

    fn next_wait(&self) -> Option<Duration> {
        self.broker
            .lock()
            .expect("failed to lock timer broker: poisoned")
            .earliest()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn run(self: Arc<Self>) {
        self.tid
            .set(thread::current().id())
            .expect("event loop run entered twice");
        self.io_baseline
            .store(self.io_count.load(Ordering::Acquire), Ordering::Release);

        let entered = self.transition(LoopState::Launching, LoopState::Running);
        assert!(entered, "event loop state corrupted at launch");
        debug!(name = %self.name, "event loop running");

        let mut active: Vec<Task> = Vec::new();
        let mut events: Vec<Readiness> = Vec::new();

        while self.state() != LoopState::Exit {
            {
                let mut q = self
                    .standby
                    .lock()
                    .expect("failed to lock standby queue: poisoned");
                if !q.is_empty() {
                    std::mem::swap(&mut active, &mut *q);
                }
            }

            // Tasks scheduled by a running task land on the standby queue and are deferred to
            // the next outer iteration, never re-entered within this pass.
            for task in active.drain(..) {
                task();
            }

            self.fire_due_timers();

            // The order here closes the lost-wakeup window: advertise waiting, then re-check
            // the standby queue; an enqueue on either side of the check either gets drained
            // now or observes `waiting` and interrupts the eventfd.
            self.waiting.store(true, Ordering::SeqCst);
            let mut wait = self.next_wait();
            if !self
                .standby
                .lock()
                .expect("failed to lock standby queue: poisoned")
                .is_empty()
            {
                wait = Some(Duration::ZERO);
            }

            let rt = self
                .poller
                .lock()
                .expect("failed to lock poller: poisoned")
                .poll(wait, &self.waiting, &mut events);
            self.waiting.store(false, Ordering::SeqCst);
            if let Err(e) = rt {
                warn!(name = %self.name, error = %e, "poller wait failed");
            }

            for ev in events.drain(..) {
                if ev.readable {
                    ev.monitor.io_notify_read(ev.status, ev.token);
                }
                if ev.writable {
                    ev.monitor.io_notify_write(ev.status, ev.token);
                }
            }
        }

        // One final flush of residual standby tasks, then force-expire what timers remain.
        trace!(name = %self.name, "event loop exiting");
        let residual = {
            let mut q = self
                .standby
                .lock()
                .expect("failed to lock standby queue: poisoned");
            std::mem::take(&mut *q)
        };
        for task in residual {
            task();
        }
        self.fire_expired_all();

        self.deinit();
    }

    fn deinit(&self) {
        assert!(self.in_event_loop());
        assert_eq!(self.state(), LoopState::Exit, "deinit outside exit state");
        {
            let q = self
                .standby
                .lock()
                .expect("failed to lock standby queue: poisoned");
            assert!(q.is_empty(), "deinit with pending standby tasks");
        }
        let broker = self
            .broker
            .lock()
            .expect("failed to lock timer broker: poisoned");
        assert!(broker.is_empty(), "deinit with outstanding timers");
        debug!(name = %self.name, "event loop deinit done");
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::poller::default_poller;
    use crate::promise::Promise;

    fn started_loop() -> Arc<EventLoop> {
        let l = EventLoop::new(
            default_poller().unwrap(),
            4096,
            "netloop-test".to_string(),
        );
        l.start().unwrap();
        l
    }

    fn stop(l: &Arc<EventLoop>) {
        l.notify_terminating();
        l.terminate();
    }

    #[test]
    fn tasks_run_exactly_once_in_fifo_order() {
        let l = started_loop();
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Promise::new());

        for i in 0..100usize {
            let order = order.clone();
            let done = done.clone();
            l.schedule(Box::new(move || {
                order.lock().unwrap().push(i);
                if i == 99 {
                    done.set(());
                }
            }));
        }
        done.wait();

        let order = order.lock().unwrap();
        assert_eq!(order.len(), 100);
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        stop(&l);
    }

    #[test]
    fn task_scheduled_by_task_defers_to_next_batch() {
        let l = started_loop();
        let done = Arc::new(Promise::new());
        let l2 = l.clone();
        let d = done.clone();
        l.execute(Box::new(move || {
            let d = d.clone();
            // Runs in a later batch, on the same thread, not inline.
            l2.schedule(Box::new(move || d.set(thread::current().id())));
        }));
        let ran_on = done.wait();
        assert_ne!(ran_on, thread::current().id());
        stop(&l);
    }

    #[test]
    fn in_event_loop_is_true_only_on_loop_thread() {
        let l = started_loop();
        assert!(!l.in_event_loop());
        let p = Arc::new(Promise::new());
        let l2 = l.clone();
        let p2 = p.clone();
        l.execute(Box::new(move || p2.set(l2.in_event_loop())));
        assert!(p.wait());
        stop(&l);
    }

    #[test]
    fn timer_fires_and_fulfils_completion() {
        let l = started_loop();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let completion: crate::timer::TimerPromise = Arc::new(Promise::new());
        l.launch_with(
            Timer::new(Duration::from_millis(5), move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Some(completion.clone()),
        );
        assert_eq!(completion.wait(), Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        stop(&l);
    }

    #[test]
    fn timer_rejected_after_shutdown() {
        let l = started_loop();
        stop(&l);
        let completion: crate::timer::TimerPromise = Arc::new(Promise::new());
        l.launch_with(Timer::new(Duration::from_millis(1), |_| {}), Some(completion.clone()));
        assert_eq!(completion.wait(), Err(crate::error::Error::TimerRejected));
    }

    #[test]
    fn shutdown_reaches_exit_with_no_registrations() {
        let l = started_loop();
        assert_eq!(l.state(), LoopState::Running);
        l.notify_terminating();
        l.terminate();
        assert_eq!(l.state(), LoopState::Exit);
    }
}
