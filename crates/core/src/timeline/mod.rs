use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};

/// Monotonic clock measuring seconds since a fixed origin.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    origin: Instant,
}

impl PlaybackClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Seconds since [`PlaybackClock::start`].
    pub fn now(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    /// Converts a clock reading back into an [`Instant`].
    pub fn instant_at(&self, seconds: f64) -> Instant {
        self.origin + Duration::from_secs_f64(seconds.max(0.0))
    }
}

/// Owning side of a cooperative cancellation signal.
///
/// Every task holds a [`Shutdown`] obtained from [`ShutdownTrigger::token`].
/// Triggering flips the shared flag and drops the channel sender, which wakes
/// every task currently parked in [`Shutdown::sleep`].
#[derive(Debug)]
pub struct ShutdownTrigger {
    flag: Arc<AtomicBool>,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    pub fn token(&self) -> Shutdown {
        Shutdown {
            flag: self.flag.clone(),
            receiver: self.receiver.clone(),
        }
    }

    /// Signals cancellation. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let mut sender = self
            .sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sender.take();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation token observed by long running tasks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    receiver: Receiver<()>,
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when the
    /// task should stop.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.receiver.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_cancelled(),
            _ => false,
        }
    }

    /// Sleeps until `deadline`. Returns `false` when cancelled.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        self.sleep(deadline.saturating_duration_since(Instant::now()))
    }

    /// Channel that disconnects on cancellation, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

/// One-shot latch: [`Latch::fire`] releases every waiter exactly once and
/// later fires are ignored.
#[derive(Debug)]
pub struct Latch {
    fired: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Latch {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            fired: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Returns `true` only for the call that actually fired the latch.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut sender = self
            .sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sender.take();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Blocks until the latch fires (`true`) or `shutdown` is cancelled (`false`).
    pub fn wait(&self, shutdown: &Shutdown) -> bool {
        if self.is_fired() {
            return !shutdown.is_cancelled();
        }
        select! {
            recv(self.receiver) -> _ => !shutdown.is_cancelled(),
            recv(shutdown.receiver()) -> _ => self.is_fired() && !shutdown.is_cancelled(),
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_returns_early_on_trigger() {
        let trigger = Arc::new(ShutdownTrigger::new());
        let token = trigger.token();
        let handle = {
            let trigger = trigger.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                trigger.trigger();
            })
        };

        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn sleep_completes_without_trigger() {
        let trigger = ShutdownTrigger::new();
        assert!(trigger.token().sleep(Duration::from_millis(5)));
    }

    #[test]
    fn latch_fires_once() {
        let latch = Latch::new();
        let trigger = ShutdownTrigger::new();

        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.wait(&trigger.token()));
    }

    #[test]
    fn latch_wait_aborts_on_shutdown() {
        let latch = Latch::new();
        let trigger = ShutdownTrigger::new();
        trigger.trigger();
        assert!(!latch.wait(&trigger.token()));
    }

    #[test]
    fn clock_advances() {
        let clock = PlaybackClock::start();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now() > 0.0);
        assert!(clock.instant_at(1.0) > clock.instant_at(0.5));
    }
}
