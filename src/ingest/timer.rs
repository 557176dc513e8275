use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// A pending timer. Cancelled when cancelled explicitly or dropped.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new<F: FnOnce() + Send + 'static>(cancel: F) -> TimerHandle {
        TimerHandle {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Source of one-shot cancellable timers.
pub trait TimerService: Send + Sync {
    /// Runs `callback` once after `duration`, unless the handle is cancelled first.
    ///
    /// A callback racing a cancel may still run; callers must tolerate that.
    fn start(&self, duration: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Wall-clock timers, one short-lived thread per timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadTimer;

impl TimerService for ThreadTimer {
    fn start(&self, duration: Duration, callback: TimerCallback) -> TimerHandle {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(duration) {
                callback();
            }
        });
        TimerHandle::new(move || drop::<Sender<()>>(cancel_tx))
    }
}

#[derive(Default)]
struct ManualClock {
    now: Duration,
    next_id: u64,
    pending: BTreeMap<u64, (Duration, TimerCallback)>,
}

/// Virtual clock that only moves on [`ManualTimer::advance`], for deterministic tests.
#[derive(Clone, Default)]
pub struct ManualTimer {
    clock: Arc<Mutex<ManualClock>>,
}

impl ManualTimer {
    pub fn new() -> ManualTimer {
        ManualTimer::default()
    }

    pub fn now(&self) -> Duration {
        self.clock.lock().now
    }

    pub fn pending(&self) -> usize {
        self.clock.lock().pending.len()
    }

    /// Moves the clock forward, firing due timers in deadline order.
    ///
    /// Callbacks run without the clock locked, so they may start or cancel timers.
    pub fn advance(&self, by: Duration) {
        let target = self.clock.lock().now + by;
        loop {
            let due = {
                let mut clock = self.clock.lock();
                let next = clock
                    .pending
                    .iter()
                    .filter(|(_, (deadline, _))| *deadline <= target)
                    .min_by_key(|(id, (deadline, _))| (*deadline, **id))
                    .map(|(id, _)| *id);
                match next.and_then(|id| clock.pending.remove(&id)) {
                    Some((deadline, callback)) => {
                        clock.now = deadline;
                        callback
                    }
                    None => {
                        clock.now = target;
                        break;
                    }
                }
            };
            due();
        }
    }
}

impl TimerService for ManualTimer {
    fn start(&self, duration: Duration, callback: TimerCallback) -> TimerHandle {
        let id = {
            let mut clock = self.clock.lock();
            let id = clock.next_id;
            clock.next_id += 1;
            let deadline = clock.now + duration;
            clock.pending.insert(id, (deadline, callback));
            id
        };
        let clock = Arc::clone(&self.clock);
        TimerHandle::new(move || {
            clock.lock().pending.remove(&id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, TimerCallback) {
        let fired = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&fired);
        (
            fired,
            Box::new(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn manual_timer_fires_at_deadline() {
        let timer = ManualTimer::new();
        let (fired, callback) = counter();
        let _handle = timer.start(Duration::from_secs(3), callback);
        timer.advance(Duration::from_millis(2999));
        assert_eq!(0, fired.load(Ordering::SeqCst));
        timer.advance(Duration::from_millis(1));
        assert_eq!(1, fired.load(Ordering::SeqCst));
        assert_eq!(Duration::from_secs(3), timer.now());
        timer.advance(Duration::from_secs(10));
        assert_eq!(1, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelled_and_dropped_handles_never_fire() {
        let timer = ManualTimer::new();
        let (fired, callback) = counter();
        timer.start(Duration::from_secs(1), callback).cancel();
        let (_, callback) = counter();
        drop(timer.start(Duration::from_secs(1), callback));
        assert_eq!(0, timer.pending());
        timer.advance(Duration::from_secs(5));
        assert_eq!(0, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn thread_timer_fires_and_cancels() {
        let (fired, callback) = counter();
        let handle = ThreadTimer.start(Duration::from_millis(20), callback);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(1, fired.load(Ordering::SeqCst));
        drop(handle);

        let (cancelled, callback) = counter();
        ThreadTimer.start(Duration::from_millis(100), callback).cancel();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(0, cancelled.load(Ordering::SeqCst));
    }
}
