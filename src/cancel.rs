//! Cooperative cancellation, standing in for the context.Context the
//! original daemon threads through every call.
//!
//! A [`CancelToken`] is a cheap, `Clone`-able handle shared between a
//! parent (the pool, a loop iteration) and everything it spawns. A
//! [`Deadline`] additionally carries an optional wall-clock expiry and is
//! what every public engine/pool operation takes as its first argument.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Requests cancellation and wakes anyone blocked in [`Self::wait_timeout`].
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.mutex.lock().unwrap();
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Blocks up to `timeout` or until cancelled, whichever comes first.
    /// Returns `true` if cancellation fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let guard = self.inner.mutex.lock().unwrap();
        let (_guard, result) = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled())
            .unwrap();
        !result.timed_out() || self.is_cancelled()
    }
}

/// A caller-supplied deadline: an optional point in time plus a
/// cancellation token inherited from whatever spawned this call chain
/// (the pool's shutdown signal, an engine's stop signal, ...).
#[derive(Clone)]
pub struct Deadline {
    at: Option<Instant>,
    cancel: CancelToken,
}

impl Deadline {
    /// No deadline, no cancellation: background-context equivalent.
    pub fn none() -> Self {
        Self {
            at: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn after(d: Duration) -> Self {
        Self {
            at: Some(Instant::now() + d),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { at: None, cancel }
    }

    /// Derives a child deadline bounded by both this deadline's remaining
    /// time (if any) and an additional `d`, inheriting the cancellation.
    pub fn with_timeout(&self, d: Duration) -> Self {
        let candidate = Instant::now() + d;
        let at = match self.at {
            Some(existing) => Some(existing.min(candidate)),
            None => Some(candidate),
        };
        Self {
            at,
            cancel: self.cancel.clone(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_expired(&self) -> bool {
        self.cancel.is_cancelled() || self.at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_none_never_expires_quickly() {
        let d = Deadline::none();
        assert!(!d.is_expired());
        assert_eq!(d.remaining(), None);
    }

    #[test]
    fn deadline_after_expires() {
        let d = Deadline::after(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(d.is_expired());
    }

    #[test]
    fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let t2 = token.clone();
        let handle = std::thread::spawn(move || t2.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn with_timeout_takes_the_tighter_bound() {
        let parent = Deadline::after(Duration::from_secs(10));
        let child = parent.with_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(child.is_expired());
    }
}
