//! Background refresh loop shared by both monitors.
//!
//! One loop per monitor, moving `Idle -> Running -> Stopping -> Idle`. The
//! loop thread waits on a stop channel with `recv_timeout`, so a stop request
//! interrupts the interval wait instead of sleeping it out.

use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

enum LoopState {
    Idle,
    Running {
        stop_tx: Sender<()>,
        handle: JoinHandle<()>,
    },
    /// Stop requested. The handle is still held when the request came from
    /// the loop's own thread; `None` while another thread joins it.
    Stopping {
        worker: ThreadId,
        handle: Option<JoinHandle<()>>,
    },
}

/// Owner of at most one periodic worker thread.
pub(crate) struct MonitorLoop {
    name: &'static str,
    state: Mutex<LoopState>,
    stopped: Condvar,
}

impl MonitorLoop {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LoopState::Idle),
            stopped: Condvar::new(),
        }
    }

    /// Spawns the loop calling `tick` every `interval`.
    ///
    /// Returns `false` without spawning if a loop is already running or
    /// stopping. A loop whose thread already exited counts as idle and is
    /// reaped here.
    pub(crate) fn start<F>(&self, interval: Duration, mut tick: F) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        let mut state = self.lock();
        match &*state {
            LoopState::Running { handle, .. } if !handle.is_finished() => return false,
            LoopState::Stopping {
                handle: Some(handle),
                ..
            } if handle.is_finished() => {}
            LoopState::Stopping { .. } => return false,
            LoopState::Idle | LoopState::Running { .. } => {}
        }
        match mem::replace(&mut *state, LoopState::Idle) {
            LoopState::Running { handle, .. }
            | LoopState::Stopping {
                handle: Some(handle),
                ..
            } => {
                if handle.join().is_err() {
                    warn!(monitor = self.name, "monitoring thread panicked");
                }
            }
            LoopState::Idle | LoopState::Stopping { handle: None, .. } => {}
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let name = self.name;
        let spawned = thread::Builder::new()
            .name(format!("{}-monitor", name))
            .spawn(move || {
                info!(monitor = name, interval_ms = interval.as_millis() as u64, "monitoring started");
                loop {
                    // A stop observed here must not be followed by a callback.
                    match stop_rx.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        _ => break,
                    }

                    let started = Instant::now();
                    tick();
                    debug!(
                        monitor = name,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "monitoring iteration"
                    );

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        // Stop request, or the owner went away.
                        _ => break,
                    }
                }
                info!(monitor = name, "monitoring stopped");
            });

        match spawned {
            Ok(handle) => {
                *state = LoopState::Running { stop_tx, handle };
                true
            }
            Err(e) => {
                warn!(monitor = name, error = %e, "failed to spawn monitoring thread");
                false
            }
        }
    }

    /// Signals the loop and blocks until its thread has exited.
    ///
    /// Returns `false` if no loop was running. Called from the loop's own
    /// thread (inside the callback) it only signals, since joining itself
    /// would never return; the loop then stays `Stopping` until the callback
    /// returns and the thread is reaped by the next `start` or `stop`.
    pub(crate) fn stop(&self) -> bool {
        let current = thread::current().id();
        let mut state = self.lock();
        loop {
            match mem::replace(&mut *state, LoopState::Idle) {
                LoopState::Idle => return false,
                LoopState::Stopping {
                    worker,
                    handle: Some(handle),
                } => {
                    if worker == current {
                        *state = LoopState::Stopping {
                            worker,
                            handle: Some(handle),
                        };
                        return false;
                    }
                    *state = LoopState::Stopping {
                        worker,
                        handle: None,
                    };
                    drop(state);
                    self.reap(handle);
                    return true;
                }
                LoopState::Stopping {
                    worker,
                    handle: None,
                } => {
                    *state = LoopState::Stopping {
                        worker,
                        handle: None,
                    };
                    if worker == current {
                        return false;
                    }
                    state = self
                        .stopped
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                LoopState::Running { stop_tx, handle } => {
                    let worker = handle.thread().id();
                    let _ = stop_tx.try_send(());
                    if worker == current {
                        *state = LoopState::Stopping {
                            worker,
                            handle: Some(handle),
                        };
                        return true;
                    }

                    *state = LoopState::Stopping {
                        worker,
                        handle: None,
                    };
                    drop(state);
                    self.reap(handle);
                    return true;
                }
            }
        }
    }

    /// Joins an exited or exiting loop thread and returns to `Idle`.
    fn reap(&self, handle: JoinHandle<()>) {
        if handle.join().is_err() {
            warn!(monitor = self.name, "monitoring thread panicked");
        }
        *self.lock() = LoopState::Idle;
        self.stopped.notify_all();
    }

    /// True while a loop thread is alive and has not been asked to stop.
    pub(crate) fn is_running(&self) -> bool {
        matches!(&*self.lock(), LoopState::Running { handle, .. } if !handle.is_finished())
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MonitorLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, mpsc};

    #[test]
    fn test_start_stop() {
        let worker = MonitorLoop::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        assert!(worker.start(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(worker.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(ticks.load(Ordering::SeqCst) >= 3);

        assert!(worker.stop());
        assert!(!worker.is_running());

        // No tick after stop returned.
        let after_stop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_start_twice_is_noop() {
        let worker = MonitorLoop::new("test");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let (a, b) = (Arc::clone(&first), Arc::clone(&second));

        assert!(worker.start(Duration::from_millis(5), move || {
            a.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!worker.start(Duration::from_millis(5), move || {
            b.fetch_add(1, Ordering::SeqCst);
        }));

        thread::sleep(Duration::from_millis(30));
        worker.stop();
        assert!(first.load(Ordering::SeqCst) > 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_when_idle() {
        let worker = MonitorLoop::new("test");
        assert!(!worker.stop());
        assert!(!worker.stop());
    }

    #[test]
    fn test_stop_interrupts_long_interval() {
        let worker = MonitorLoop::new("test");
        worker.start(Duration::from_secs(3600), || {});
        thread::sleep(Duration::from_millis(10));

        let started = Instant::now();
        assert!(worker.stop());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_restart_after_stop() {
        let worker = MonitorLoop::new("test");
        assert!(worker.start(Duration::from_millis(5), || {}));
        assert!(worker.stop());
        assert!(worker.start(Duration::from_millis(5), || {}));
        assert!(worker.is_running());
    }

    #[test]
    fn test_drop_stops_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let worker = MonitorLoop::new("test");
            let counter = Arc::clone(&ticks);
            worker.start(Duration::from_millis(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(10));
        }
        let after_drop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn test_stop_from_callback_blocks_restart_until_exit() {
        let worker = Arc::new(MonitorLoop::new("test"));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let (stopped_tx, stopped_rx) = mpsc::channel();

        let tick = {
            let handle = Arc::downgrade(&worker);
            let (active, max_active) = (Arc::clone(&active), Arc::clone(&max_active));
            move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                if let Some(worker) = handle.upgrade() {
                    assert!(worker.stop());
                    assert!(!worker.stop());
                }
                let _ = stopped_tx.send(());
                thread::sleep(Duration::from_millis(100));
                active.fetch_sub(1, Ordering::SeqCst);
            }
        };
        assert!(worker.start(Duration::from_millis(5), tick));
        stopped_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The old callback is still sleeping: no second loop may start.
        assert!(!worker.is_running());
        assert!(!worker.start(Duration::from_millis(5), || {}));

        let deadline = Instant::now() + Duration::from_secs(5);
        let restarted = loop {
            let (active, max_active) = (Arc::clone(&active), Arc::clone(&max_active));
            let started = worker.start(Duration::from_millis(5), move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                active.fetch_sub(1, Ordering::SeqCst);
            });
            if started || Instant::now() >= deadline {
                break started;
            }
            thread::sleep(Duration::from_millis(5));
        };
        assert!(restarted);
        thread::sleep(Duration::from_millis(20));
        assert!(worker.stop());
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_after_stop_from_callback_joins() {
        let worker = Arc::new(MonitorLoop::new("test"));
        let finished = Arc::new(AtomicUsize::new(0));
        let (stopped_tx, stopped_rx) = mpsc::channel();

        let handle = Arc::downgrade(&worker);
        let done = Arc::clone(&finished);
        worker.start(Duration::from_millis(5), move || {
            if let Some(worker) = handle.upgrade() {
                worker.stop();
            }
            let _ = stopped_tx.send(());
            thread::sleep(Duration::from_millis(50));
            done.fetch_add(1, Ordering::SeqCst);
        });
        stopped_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(worker.stop());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!worker.stop());
    }
}
