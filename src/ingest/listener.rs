use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ingest::store::MapNotification;
use crate::ingest::timer::{TimerHandle, TimerService};

const RECV_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    /// An arrival is being processed; no timer is pending.
    ResetTimer,
    Done,
}

/// Processes one arrived notification.
pub trait ArrivalHandler {
    fn handle(&mut self, notification: MapNotification);
}

struct Shared {
    state: ListenerState,
    /// Bumped on every cancel so a timer that fires late cannot release the gate.
    generation: u64,
    timer: Option<TimerHandle>,
    arrivals: usize,
}

struct Gate {
    shared: Mutex<Shared>,
    released: Condvar,
}

impl Gate {
    fn release(&self) {
        self.shared.lock().state = ListenerState::Done;
        self.released.notify_all();
    }
}

/// Releases the gate if the handler unwinds, so waiters see the panic instead of blocking.
struct ReleaseOnUnwind<'a>(&'a Gate);

impl Drop for ReleaseOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.release();
        }
    }
}

/// Collects notifications until none has arrived for a full `max_wait`.
pub struct DebouncedListener<T: TimerService> {
    timers: T,
    max_wait: Duration,
    gate: Arc<Gate>,
}

impl<T: TimerService> DebouncedListener<T> {
    pub fn new(timers: T, max_wait: Duration) -> DebouncedListener<T> {
        DebouncedListener {
            timers,
            max_wait,
            gate: Arc::new(Gate {
                shared: Mutex::new(Shared {
                    state: ListenerState::Idle,
                    generation: 0,
                    timer: None,
                    arrivals: 0,
                }),
                released: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.gate.shared.lock().state
    }

    pub fn arrivals(&self) -> usize {
        self.gate.shared.lock().arrivals
    }

    fn arm(&self, shared: &mut Shared) {
        let generation = shared.generation;
        let gate = Arc::clone(&self.gate);
        let expire = move || {
            let mut shared = gate.shared.lock();
            if shared.generation == generation && shared.state == ListenerState::Listening {
                shared.state = ListenerState::Done;
                gate.released.notify_all();
            }
        };
        shared.timer = Some(self.timers.start(self.max_wait, Box::new(expire)));
        shared.state = ListenerState::Listening;
    }

    /// Idle to Listening, with the first quiet-window timer running.
    pub fn start(&self) -> bool {
        let mut shared = self.gate.shared.lock();
        if shared.state != ListenerState::Idle {
            return false;
        }
        self.arm(&mut shared);
        true
    }

    /// Cancels the pending timer, hands the notification to `handler` and restarts the timer.
    ///
    /// Ignored unless listening. Returns whether it was processed. A panicking
    /// handler moves the listener to `Done` before the panic propagates.
    pub fn on_arrival<H: ArrivalHandler + ?Sized>(
        &self,
        handler: &mut H,
        notification: MapNotification,
    ) -> bool {
        {
            let mut shared = self.gate.shared.lock();
            if shared.state != ListenerState::Listening {
                debug!("notification ignored in state {:?}", shared.state);
                return false;
            }
            shared.state = ListenerState::ResetTimer;
            shared.generation += 1;
            if let Some(timer) = shared.timer.take() {
                timer.cancel();
            }
            shared.arrivals += 1;
        }

        {
            let _release = ReleaseOnUnwind(&self.gate);
            handler.handle(notification);
        }

        let mut shared = self.gate.shared.lock();
        self.arm(&mut shared);
        true
    }

    /// Blocks until the quiet window has elapsed.
    pub fn wait(&self) {
        let mut shared = self.gate.shared.lock();
        while shared.state != ListenerState::Done {
            self.gate.released.wait(&mut shared);
        }
    }
}

impl<T: TimerService> DebouncedListener<T> {
    /// Starts listening, feeds every notification from `notifications` to `handler`
    /// on a worker thread, and returns the handler once the stream has been quiet
    /// for `max_wait`.
    pub fn listen<H: ArrivalHandler + Send>(
        &self,
        notifications: Receiver<MapNotification>,
        mut handler: H,
    ) -> H {
        self.start();
        thread::scope(|scope| {
            let worker = scope.spawn(|| {
                while self.state() != ListenerState::Done {
                    match notifications.recv_timeout(RECV_TIMEOUT) {
                        Ok(notification) => {
                            self.on_arrival(&mut handler, notification);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            debug!("notification channel closed");
                            break;
                        }
                    }
                }
                handler
            });
            self.wait();
            info!("ingestion quiet after {} arrivals", self.arrivals());
            match worker.join() {
                Ok(handler) => handler,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::timer::{ManualTimer, ThreadTimer};
    use crossbeam_channel::{bounded, unbounded};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        names: Vec<String>,
    }

    impl ArrivalHandler for Recorder {
        fn handle(&mut self, notification: MapNotification) {
            self.names
                .extend(notification.entries().into_iter().map(|(name, _)| name.to_string()));
        }
    }

    fn single(name: &str) -> MapNotification {
        MapNotification::Single {
            name: name.to_string(),
            path: format!("maps/{name}.json"),
        }
    }

    #[test]
    fn release_follows_last_arrival() {
        let clock = ManualTimer::new();
        let listener = DebouncedListener::new(clock.clone(), Duration::from_secs(3));
        let mut recorder = Recorder::default();
        assert_eq!(ListenerState::Idle, listener.state());
        assert!(listener.start());

        for i in 0..5 {
            clock.advance(Duration::from_secs(1));
            assert!(listener.on_arrival(&mut recorder, single(&format!("m{i}"))));
        }
        // first arrival at 1 s, last at 5 s: not released at 4 s
        assert_eq!(Duration::from_secs(5), clock.now());
        clock.advance(Duration::from_millis(2999));
        assert_eq!(ListenerState::Listening, listener.state());
        clock.advance(Duration::from_millis(1));
        assert_eq!(ListenerState::Done, listener.state());
        assert_eq!(Duration::from_secs(8), clock.now());

        assert_eq!(5, recorder.names.len());
        assert_eq!(5, listener.arrivals());
        assert_eq!(0, clock.pending());
    }

    #[test]
    fn silence_releases_after_one_window() {
        let clock = ManualTimer::new();
        let listener = DebouncedListener::new(clock.clone(), Duration::from_secs(3));
        listener.start();
        clock.advance(Duration::from_secs(3));
        assert_eq!(ListenerState::Done, listener.state());

        let mut recorder = Recorder::default();
        assert!(!listener.on_arrival(&mut recorder, single("late")));
        assert!(recorder.names.is_empty());
        assert!(!listener.start());
    }

    #[test]
    fn listen_blocks_until_quiet() {
        let (tx, rx) = unbounded();
        let listener = DebouncedListener::new(ThreadTimer, Duration::from_millis(400));
        let producer = thread::spawn(move || {
            for i in 0..4 {
                tx.send(single(&format!("m{i}"))).ok();
                thread::sleep(Duration::from_millis(50));
            }
            tx
        });

        let started = Instant::now();
        let recorder = listener.listen(rx, Recorder::default());
        let elapsed = started.elapsed();
        drop(producer.join());

        assert_eq!(4, recorder.names.len());
        assert_eq!(4, listener.arrivals());
        // last arrival at ~150 ms plus a 400 ms window
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert_eq!(ListenerState::Done, listener.state());
    }

    struct Exploding;

    impl ArrivalHandler for Exploding {
        fn handle(&mut self, notification: MapNotification) {
            panic!("cannot handle {notification:?}");
        }
    }

    #[test]
    fn panicking_handler_releases_the_gate() {
        let clock = ManualTimer::new();
        let listener = DebouncedListener::new(clock.clone(), Duration::from_secs(3));
        listener.start();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            listener.on_arrival(&mut Exploding, single("m0"));
        }));
        assert!(outcome.is_err());
        assert_eq!(ListenerState::Done, listener.state());
        assert_eq!(0, clock.pending());
        // returns immediately instead of blocking
        listener.wait();
    }

    #[test]
    fn listen_propagates_handler_panic() {
        let (tx, rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        tx.send(single("m0")).ok();
        thread::spawn(move || {
            let listener = DebouncedListener::new(ThreadTimer, Duration::from_millis(100));
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.listen(rx, Exploding)));
            done_tx.send((outcome.is_err(), listener.state())).ok();
            drop(tx);
        });
        let (panicked, state) = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("listen did not return after the handler panicked");
        assert!(panicked);
        assert_eq!(ListenerState::Done, state);
    }
}
