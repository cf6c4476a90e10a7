//! `Mirror`, `StartLoop`, `StopLoop`, `QueueMirrorRun`: one synchronous
//! mirror cycle plus the periodic scheduler driving it.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::cancel::{CancelToken, Deadline};
use crate::error::Result;

use super::{Engine, EngineState};

impl Engine {
    /// One synchronous mirror cycle, holding the write lock throughout.
    pub fn mirror(&self, deadline: &Deadline) -> Result<()> {
        let started = Instant::now();
        let mut guard = self.state.write().unwrap();
        let result = self.mirror_locked(&mut guard, deadline);
        drop(guard);
        let duration = started.elapsed();

        self.metrics.observe_mirror_duration(&self.normalised, duration);
        self.metrics
            .record_mirror_result(&self.normalised, result.is_ok());
        self.metrics
            .set_last_reload_success(&self.normalised, result.is_ok(), unix_now());

        match &result {
            Ok(()) => log::info!(
                "{}: mirror cycle succeeded in {:.2}s",
                self.normalised,
                duration.as_secs_f64()
            ),
            Err(e) => log::warn!(
                "{}: mirror cycle failed in {:.2}s: {e}",
                self.normalised,
                duration.as_secs_f64()
            ),
        }
        result
    }

    fn mirror_locked(&self, state: &mut EngineState, deadline: &Deadline) -> Result<()> {
        self.ensure_initialised(deadline)?;
        self.fetch(deadline)?;
        let resolved = self.ensure_worktrees(state, deadline)?;
        self.ensure_worktree_links(state, &resolved)?;
        // cleanup is skipped if worktree ensuring failed; `ensure_worktrees`/
        // `ensure_worktree_links` already early-return on the first failure
        // via `?`, so reaching here means both succeeded.
        self.cleanup(state, deadline)?;
        Ok(())
    }

    /// Non-blocking enqueue into a size-1 channel: at most one extra cycle
    /// runs per burst of calls while one is already queued.
    pub fn queue_mirror_run(&self) {
        let _ = self.queue_tx.try_send(());
    }

    pub fn stop_loop(&self) {
        let _ = self.stop_tx.try_send(());
        let _ = self.stopped_rx.recv();
    }

    /// Runs the periodic loop until cancelled or stopped. Single-instance:
    /// callers must not invoke this concurrently for the same engine.
    pub fn start_loop(&self, parent_cancel: CancelToken) {
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);
        let stopped_tx = self.stopped_tx.clone();
        scopeguard::defer! {
            self.running.store(false, std::sync::atomic::Ordering::SeqCst);
            drop(stopped_tx);
        }

        loop {
            let jittered = jitter(self.interval, 0.2);
            if parent_cancel.wait_timeout(jittered) {
                return;
            }
            if self.stop_rx.try_recv().is_ok() {
                return;
            }

            let deadline = Deadline::with_cancel(parent_cancel.clone()).with_timeout(self.mirror_timeout);
            let _ = self.mirror(&deadline);

            if self.wait_next_cycle(&parent_cancel) {
                return;
            }
        }
    }

    /// Waits on whichever fires first: the interval timer, the queued-run
    /// signal, the parent cancellation, or the stop signal. Returns `true`
    /// if the loop should exit.
    fn wait_next_cycle(&self, parent_cancel: &CancelToken) -> bool {
        use crossbeam::channel::{after, select};

        let timer = after(self.interval);
        loop {
            if parent_cancel.is_cancelled() {
                return true;
            }
            select! {
                recv(&timer) -> _ => return false,
                recv(&self.queue_rx) -> _ => return false,
                recv(&self.stop_rx) -> _ => return true,
                default(Duration::from_millis(200)) => {
                    if parent_cancel.is_cancelled() {
                        return true;
                    }
                }
            }
        }
    }
}

/// Uniform additive jitter in `[0, factor]` of `base`.
fn jitter(base: Duration, factor: f64) -> Duration {
    let extra = rand::thread_rng().gen_range(0.0..=factor);
    base + Duration::from_secs_f64(base.as_secs_f64() * extra)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
