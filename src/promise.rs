//! A minimal single-assignment promise, the cross-thread completion primitive of the runtime.
//!
//! Every asynchronous operation on a channel or loop hands back an `Arc<Promise<T>>`; the owning
//! loop thread calls [Promise::set] exactly once, and any registered [Promise::if_done]
//! continuations run on whichever thread called `set`. Continuations registered after the value
//! exists run inline on the registering thread.

use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};

type Continuation<T> = Box<dyn FnOnce(&T) + Send>;

/// A single-assignment result slot.
///
/// [Promise::set] succeeds at most once; a second call is a programming error and panics. Any
/// number of [Promise::if_done] continuations fire once a value exists, in the thread that called
/// `set`. [Promise::wait] blocks the calling thread until a value exists; it is intended for
/// managing threads and tests, never for a loop's own thread.
pub struct Promise<T> {
    value: OnceLock<T>,
    continuations: Mutex<Vec<Continuation<T>>>,
    cond: Condvar,
}

impl<T> Promise<T> {
    pub fn new() -> Promise<T> {
        Promise {
            value: OnceLock::new(),
            continuations: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Continuation<T>>> {
        self.continuations
            .lock()
            .expect("failed to lock promise: poisoned")
    }

    /// Assign the value, waking waiters and running all registered continuations on this thread.
    ///
    /// # Panics
    ///
    /// Panics if a value was already set.
    pub fn set(&self, value: T) {
        if self.value.set(value).is_err() {
            panic!("invalid state, can not set a promise more than once");
        }
        let pending = {
            let mut guard = self.lock();
            self.cond.notify_all();
            std::mem::take(&mut *guard)
        };
        // Run outside the lock so a continuation may touch the promise again.
        let value = self.value.get().unwrap();
        for f in pending {
            f(value);
        }
    }

    /// Register a continuation to run once a value exists. Runs inline if one already does.
    pub fn if_done<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        {
            let mut guard = self.lock();
            if self.value.get().is_none() {
                guard.push(Box::new(f));
                return;
            }
        }
        f(self.value.get().unwrap());
    }

    /// Whether a value has been assigned yet.
    pub fn is_done(&self) -> bool {
        self.value.get().is_some()
    }

    /// Block the calling thread until a value exists, then return a copy of it.
    pub fn wait(&self) -> T
    where
        T: Clone,
    {
        let mut guard = self.lock();
        loop {
            if let Some(value) = self.value.get() {
                return value.clone();
            }
            guard = self
                .cond
                .wait(guard)
                .expect("failed to wait on promise: poisoned");
        }
    }

    /// Non-blocking peek at the value, if any.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value.get().cloned()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn set_then_if_done_runs_inline() {
        let p = Promise::new();
        p.set(7usize);
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        p.if_done(move |v| {
            h.store(*v, Ordering::SeqCst);
        });
        assert_eq!(hit.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn if_done_then_set_runs_on_setter_thread() {
        let p = Arc::new(Promise::new());
        let setter_tid = Arc::new(Mutex::new(None));
        let observed_tid = Arc::new(Mutex::new(None));

        let o = observed_tid.clone();
        p.if_done(move |_: &usize| {
            *o.lock().unwrap() = Some(thread::current().id());
        });

        let p2 = p.clone();
        let s = setter_tid.clone();
        thread::spawn(move || {
            *s.lock().unwrap() = Some(thread::current().id());
            p2.set(1usize);
        })
        .join()
        .unwrap();

        assert_eq!(p.wait(), 1);
        assert_eq!(
            setter_tid.lock().unwrap().unwrap(),
            observed_tid.lock().unwrap().unwrap()
        );
    }

    #[test]
    #[should_panic(expected = "more than once")]
    fn double_set_panics() {
        let p = Promise::new();
        p.set(1usize);
        p.set(2usize);
    }

    #[test]
    fn wait_blocks_until_set() {
        let p = Arc::new(Promise::new());
        let p2 = p.clone();
        thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            p2.set("done");
        });
        assert_eq!(p.wait(), "done");
    }
}
