//! A pool of event loops with round-robin dispatch and an always-non-null shutdown protocol.
//!
//! [EventLoopGroup::next] must return a usable loop for as long as the group exists, including
//! mid-shutdown. The mechanism is a transient "bye loop": the instant the pool empties during
//! [EventLoopGroup::wait], one extra loop is lazily created and handed out by `next()` until no
//! external holder remains, then torn down itself.
//!
//! Shutdown runs in two phases, both driven by the managing thread (never a loop's own thread):
//! first every pooled loop receives the terminating notice; then the pool is scanned with short
//! sleeps, and any loop whose shared-ownership count has fallen back to the runtime's own
//! baseline (no outstanding channel, timer, or user holds it) is detached and terminated. Once
//! the pool is empty the same notify/terminate sequence is applied to the bye loop.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::Result;
use crate::event_loop::{EventLoop, Task, DEFAULT_READ_BUF_SIZE};
use crate::poller::{default_poller, Poller};
use crate::timer::{Timer, TimerPromise};

type PollerMaker = Box<dyn Fn() -> Result<Box<dyn Poller>> + Send + Sync>;

const BYE_IDLE: u8 = 0;
const BYE_PREPARING: u8 = 1;
const BYE_RUNNING: u8 = 2;
const BYE_EXIT: u8 = 3;

pub struct EventLoopGroup {
    loops: RwLock<Vec<Arc<EventLoop>>>,
    cursor: AtomicUsize,
    bye_state: AtomicU8,
    bye: Mutex<Option<Arc<EventLoop>>>,
    bye_baseline: AtomicUsize,
    poller_maker: PollerMaker,
    read_buf_size: usize,
    name_prefix: String,
}

/// Group configuration object, in the builder style.
pub struct EventLoopGroupBuilder {
    size: usize,
    read_buf_size: usize,
    name_prefix: String,
    poller_maker: PollerMaker,
}

impl EventLoopGroupBuilder {
    pub fn new() -> EventLoopGroupBuilder {
        EventLoopGroupBuilder {
            size: std::cmp::max(1, num_cpus::get()),
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            name_prefix: "netloop".to_string(),
            poller_maker: Box::new(default_poller),
        }
    }

    /// Number of loops in the pool; defaults to the number of CPU cores.
    ///
    /// # Panics
    ///
    /// Panics if `size == 0`.
    pub fn size(mut self, size: usize) -> Self {
        assert!(size > 0);
        self.size = size;
        self
    }

    /// Per-loop read buffer size used by channels on the default read path.
    pub fn read_buf_size(mut self, size: usize) -> Self {
        self.read_buf_size = size;
        self
    }

    /// Thread name prefix; loops get names like `prefix-0`, `prefix-1`, ...
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Swap in a different poller backend; every loop in the group gets one instance.
    pub fn poller<F>(mut self, maker: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Poller>> + Send + Sync + 'static,
    {
        self.poller_maker = Box::new(maker);
        self
    }

    /// Build the group and launch every loop in it.
    pub fn create(self) -> Result<Arc<EventLoopGroup>> {
        let group = Arc::new(EventLoopGroup {
            loops: RwLock::new(Vec::with_capacity(self.size)),
            cursor: AtomicUsize::new(0),
            bye_state: AtomicU8::new(BYE_IDLE),
            bye: Mutex::new(None),
            bye_baseline: AtomicUsize::new(0),
            poller_maker: self.poller_maker,
            read_buf_size: self.read_buf_size,
            name_prefix: self.name_prefix,
        });
        group.start(self.size)?;
        Ok(group)
    }
}

impl Default for EventLoopGroupBuilder {
    fn default() -> Self {
        EventLoopGroupBuilder::new()
    }
}

impl EventLoopGroup {
    pub fn builder() -> EventLoopGroupBuilder {
        EventLoopGroupBuilder::new()
    }

    fn make_loop(&self, name: String) -> Result<Arc<EventLoop>> {
        let poller = (self.poller_maker)()?;
        Ok(EventLoop::new(poller, self.read_buf_size, name))
    }

    fn start(&self, count: usize) -> Result<()> {
        debug!(count, "starting event loop group");
        let mut loops = self
            .loops
            .write()
            .expect("failed to lock loop pool: poisoned");
        self.cursor.store(0, Ordering::Relaxed);
        for i in 0..count {
            let l = self.make_loop(format!("{}-{}", self.name_prefix, i))?;
            l.start()?;
            loops.push(l);
            // Pool slot + loop thread; anything beyond this is an external holder.
            let l = loops.last().unwrap();
            l.store_internal_refs(Arc::strong_count(l));
        }
        Ok(())
    }

    /// Number of loops currently pooled.
    pub fn size(&self) -> usize {
        self.loops
            .read()
            .expect("failed to lock loop pool: poisoned")
            .len()
    }

    /// Round-robin pick of the next loop. Never returns nothing while the group is alive: once
    /// the pool has been emptied during shutdown this returns the bye loop.
    ///
    /// # Panics
    ///
    /// Panics if called after the group has been fully torn down and no bye loop was ever
    /// needed; that call is not a defined operation.
    pub fn next(&self) -> Arc<EventLoop> {
        {
            let loops = self
                .loops
                .read()
                .expect("failed to lock loop pool: poisoned");
            if !loops.is_empty() {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % loops.len();
                return loops[idx].clone();
            }
        }
        if self.bye_state.load(Ordering::Acquire) != BYE_IDLE {
            let bye = self.bye.lock().expect("failed to lock bye loop: poisoned");
            return bye.as_ref().expect("bye loop missing").clone();
        }
        panic!("event loop group torn down, next() is undefined");
    }

    /// Like [EventLoopGroup::next] but skips loops in `exclude` when the pool is large enough
    /// to allow it; used to avoid co-locating dependent channels.
    pub fn next_excluding(&self, exclude: &[Arc<EventLoop>]) -> Arc<EventLoop> {
        {
            let loops = self
                .loops
                .read()
                .expect("failed to lock loop pool: poisoned");
            if !loops.is_empty() {
                if loops.len() <= exclude.len() {
                    let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % loops.len();
                    return loops[idx].clone();
                }
                loop {
                    let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % loops.len();
                    let candidate = &loops[idx];
                    if !exclude.iter().any(|l| Arc::ptr_eq(l, candidate)) {
                        return candidate.clone();
                    }
                }
            }
        }
        self.next()
    }

    /// Enqueue a task on the next loop in rotation.
    pub fn execute(&self, task: Task) {
        self.next().execute(task)
    }

    /// Enqueue a task on the next loop in rotation without forcing a poller wakeup.
    pub fn schedule(&self, task: Task) {
        self.next().schedule(task)
    }

    /// Launch a timer on the next loop in rotation.
    pub fn launch(&self, t: Arc<Timer>, completion: Option<TimerPromise>) {
        self.next().launch_with(t, completion)
    }

    /// Shutdown phase one: deliver the terminating notice to every pooled loop.
    pub fn notify_terminating(&self) {
        let loops = self
            .loops
            .read()
            .expect("failed to lock loop pool: poisoned");
        for l in loops.iter() {
            l.notify_terminating();
        }
    }

    fn wait_pool(&self) {
        loop {
            let mut detached: Option<Arc<EventLoop>> = None;
            {
                let mut loops = self
                    .loops
                    .write()
                    .expect("failed to lock loop pool: poisoned");
                if loops.is_empty() {
                    return;
                }

                // The bye loop goes up while the pool is still non-empty, so next() never
                // observes a gap.
                if self
                    .bye_state
                    .compare_exchange(
                        BYE_IDLE,
                        BYE_PREPARING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let bye = self
                        .make_loop(format!("{}-bye", self.name_prefix))
                        .expect("failed to create bye loop");
                    bye.start().expect("failed to start bye loop");
                    let mut slot = self.bye.lock().expect("failed to lock bye loop: poisoned");
                    *slot = Some(bye);
                    self.bye_baseline
                        .store(Arc::strong_count(slot.as_ref().unwrap()), Ordering::Release);
                    let promoted = self
                        .bye_state
                        .compare_exchange(
                            BYE_PREPARING,
                            BYE_RUNNING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    assert!(promoted);
                }

                if let Some(i) = loops
                    .iter()
                    .position(|l| Arc::strong_count(l) == l.internal_refs())
                {
                    debug!(name = %loops[i].name(), "detaching idle event loop");
                    detached = Some(loops.remove(i));
                }
            }
            if let Some(l) = detached {
                l.terminate();
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Shutdown phase two, managing thread only: detach and terminate every pooled loop once
    /// nothing external holds it, then tear down the bye loop the same way.
    pub fn wait(&self) {
        info!("event loop group draining");
        self.wait_pool();

        if self
            .bye_state
            .compare_exchange(BYE_RUNNING, BYE_EXIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let bye = {
                let slot = self.bye.lock().expect("failed to lock bye loop: poisoned");
                slot.as_ref().expect("bye loop missing").clone()
            };
            bye.notify_terminating();
            let baseline = self.bye_baseline.load(Ordering::Acquire);
            // The clone above is ours; account for it while spinning down.
            while Arc::strong_count(&bye) > baseline + 1 {
                thread::sleep(Duration::from_millis(1));
            }
            bye.terminate();
            debug!("bye loop torn down");
        }
        info!("event loop group drained");
    }

    /// `notify_terminating()` followed by `wait()`.
    pub fn stop(&self) {
        self.notify_terminating();
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn group(n: usize) -> Arc<EventLoopGroup> {
        EventLoopGroup::builder()
            .size(n)
            .name_prefix("netloop-grp-test")
            .create()
            .unwrap()
    }

    #[test]
    fn next_round_robins_over_the_pool() {
        let g = group(3);
        let mut seen = HashSet::new();
        for _ in 0..3 {
            seen.insert(Arc::as_ptr(&g.next()) as usize);
        }
        assert_eq!(seen.len(), 3);
        g.stop();
    }

    #[test]
    fn next_excluding_skips_named_loops() {
        let g = group(3);
        let a = g.next();
        let b = g.next();
        for _ in 0..16 {
            let picked = g.next_excluding(&[a.clone(), b.clone()]);
            assert!(!Arc::ptr_eq(&picked, &a));
            assert!(!Arc::ptr_eq(&picked, &b));
        }
        drop(a);
        drop(b);
        g.stop();
    }

    #[test]
    fn next_excluding_with_oversized_exclusion_still_returns() {
        let g = group(1);
        let only = g.next();
        let picked = g.next_excluding(&[only.clone()]);
        assert!(Arc::ptr_eq(&picked, &only));
        drop(picked);
        drop(only);
        g.stop();
    }

    #[test]
    fn next_hands_out_the_bye_loop_once_the_pool_empties() {
        let g = group(1);
        let held = g.next();
        let g2 = g.clone();
        let stopper = thread::spawn(move || g2.stop());

        // The bye loop comes up while the pool still holds our loop, so next() never gaps.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while g.bye_state.load(Ordering::Acquire) != BYE_RUNNING {
            assert!(std::time::Instant::now() < deadline, "bye loop never came up");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(Arc::ptr_eq(&g.next(), &held));

        // Releasing the last external hold lets the pool drain; from then on next() serves
        // the bye loop.
        drop(held);
        while g.size() > 0 {
            assert!(std::time::Instant::now() < deadline, "pool never drained");
            thread::sleep(Duration::from_millis(1));
        }
        let bye = g.next();
        assert_eq!(bye.name(), "netloop-grp-test-bye");

        drop(bye);
        stopper.join().unwrap();
    }

    #[test]
    fn stop_drains_every_loop() {
        let g = group(2);
        assert_eq!(g.size(), 2);
        g.stop();
        assert_eq!(g.size(), 0);
    }

    #[test]
    fn group_tasks_land_on_pool_threads() {
        let g = group(2);
        let p = Arc::new(crate::promise::Promise::new());
        let p2 = p.clone();
        g.execute(Box::new(move || p2.set(thread::current().id())));
        assert_ne!(p.wait(), thread::current().id());
        g.stop();
    }
}
