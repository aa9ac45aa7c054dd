use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{dmx::DmxBuffer, timeline::ShutdownTrigger, Result, StageError};

type Action = Box<dyn FnOnce() + Send>;

/// Linear fade of one DMX address.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Fade {
    start: i32,
    target: i32,
    steps: u32,
    done: u32,
}

impl Fade {
    fn value(&self) -> i32 {
        let delta = f64::from(self.target - self.start);
        (f64::from(self.start) + delta * f64::from(self.done) / f64::from(self.steps)) as i32
    }

    fn is_complete(&self) -> bool {
        self.done >= self.steps
    }
}

struct Scheduled {
    due: Instant,
    action: Action,
}

#[derive(Default)]
struct FaderState {
    fades: HashMap<usize, Fade>,
    scheduled: Vec<Scheduled>,
}

struct Shared {
    buffer: Arc<DmxBuffer>,
    state: Mutex<FaderState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self, now: Instant) {
        let due = {
            let mut state = self.lock();
            state.fades.retain(|&address, fade| {
                fade.done += 1;
                if fade.is_complete() {
                    self.buffer.set_value(address, fade.target);
                    false
                } else {
                    self.buffer.set_value(address, fade.value());
                    true
                }
            });

            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
                .into_iter()
                .partition(|scheduled| scheduled.due <= now);
            state.scheduled = pending;
            due
        };

        // Actions may start new fades, so they run without the lock held.
        for scheduled in due {
            (scheduled.action)();
        }
    }
}

/// Owns every running fade and delayed action.
///
/// A single ticker advances all fades once per `step`. Starting a fade on an
/// address that is already fading replaces the old fade, which keeps the
/// last value it wrote. Fades on different addresses never interact.
pub struct Fader {
    shared: Arc<Shared>,
    step: Duration,
    default_fade: Duration,
    shutdown: ShutdownTrigger,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Fader {
    /// Creates a fader without a ticker thread; call [`Fader::tick`] to advance.
    pub fn new(buffer: Arc<DmxBuffer>, step: Duration, default_fade: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer,
                state: Mutex::new(FaderState::default()),
            }),
            step: step.max(Duration::from_millis(1)),
            default_fade,
            shutdown: ShutdownTrigger::new(),
            worker: Mutex::new(None),
        }
    }

    /// Creates a fader driven by its own ticker thread.
    pub fn spawn(buffer: Arc<DmxBuffer>, step: Duration, default_fade: Duration) -> Result<Self> {
        let fader = Self::new(buffer, step, default_fade);
        let shared = fader.shared.clone();
        let token = fader.shutdown.token();
        let step = fader.step;

        let handle = thread::Builder::new()
            .name("fader".into())
            .spawn(move || {
                let mut next = Instant::now() + step;
                while token.sleep_until(next) {
                    shared.tick(Instant::now());
                    next += step;
                }
            })?;

        *fader
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(fader)
    }

    pub fn buffer(&self) -> &Arc<DmxBuffer> {
        &self.shared.buffer
    }

    pub fn default_fade(&self) -> Duration {
        self.default_fade
    }

    /// Moves `address` to `target` over `duration`. A zero duration writes
    /// immediately. The first interpolation step is written right away.
    pub fn fade_to(&self, address: usize, target: u8, duration: Duration) {
        let target = i32::from(target);
        let mut state = self.shared.lock();

        if duration.is_zero() {
            state.fades.remove(&address);
            self.shared.buffer.set_value(address, target);
            return;
        }

        let steps = (duration.as_secs_f64() / self.step.as_secs_f64()) as u32;
        let fade = Fade {
            start: i32::from(self.shared.buffer.get_value(address)),
            target,
            steps: steps.max(1),
            done: 1,
        };

        if fade.is_complete() {
            state.fades.remove(&address);
            self.shared.buffer.set_value(address, target);
        } else {
            self.shared.buffer.set_value(address, fade.value());
            state.fades.insert(address, fade);
        }
    }

    /// Runs `action` on the ticker once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) {
        self.shared.lock().scheduled.push(Scheduled {
            due: Instant::now() + delay,
            action: Box::new(action),
        });
    }

    /// Stops fades on the given addresses, leaving their current values.
    pub fn cancel_addresses(&self, addresses: &[usize]) {
        let mut state = self.shared.lock();
        for address in addresses {
            state.fades.remove(address);
        }
    }

    pub fn is_fading(&self, address: usize) -> bool {
        self.shared.lock().fades.contains_key(&address)
    }

    pub fn active_fades(&self) -> usize {
        self.shared.lock().fades.len()
    }

    pub fn pending_actions(&self) -> usize {
        self.shared.lock().scheduled.len()
    }

    /// Advances every fade by one step and runs due actions.
    pub fn tick(&self) {
        self.shared.tick(Instant::now());
    }

    /// Stops the ticker and drops pending fades and actions.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.trigger();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        {
            let mut state = self.shared.lock();
            state.fades.clear();
            state.scheduled.clear();
        }
        match handle {
            Some(handle) => {
                handle.join().map_err(|_| StageError::TaskPanicked("fader"))?;
                debug!("fader stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for Fader {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "fader stopped with an error");
        }
    }
}

impl fmt::Debug for Fader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fader")
            .field("step", &self.step)
            .field("default_fade", &self.default_fade)
            .field("active_fades", &self.active_fades())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn manual_fader() -> Fader {
        Fader::new(
            Arc::new(DmxBuffer::new()),
            Duration::from_millis(50),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn zero_duration_writes_immediately() {
        let fader = manual_fader();
        fader.fade_to(3, 200, Duration::ZERO);
        assert_eq!(fader.buffer().get_value(3), 200);
        assert_eq!(fader.active_fades(), 0);
    }

    #[test]
    fn fade_reaches_target_after_all_steps() {
        let fader = manual_fader();
        fader.fade_to(0, 100, Duration::from_millis(500));

        // 10 steps: the first is written up front.
        assert_eq!(fader.buffer().get_value(0), 10);
        for _ in 0..8 {
            fader.tick();
        }
        assert_eq!(fader.buffer().get_value(0), 90);
        fader.tick();
        assert_eq!(fader.buffer().get_value(0), 100);
        assert!(!fader.is_fading(0));
    }

    #[test]
    fn new_fade_on_same_address_preempts() {
        let fader = manual_fader();
        fader.fade_to(5, 200, Duration::from_millis(500));
        fader.tick();
        let reached = fader.buffer().get_value(5);

        fader.fade_to(5, 0, Duration::from_millis(100));
        assert_eq!(fader.active_fades(), 1);
        fader.tick();
        assert_eq!(fader.buffer().get_value(5), 0);
        assert!(reached > 0);
    }

    #[test]
    fn fades_on_different_addresses_are_independent() {
        let fader = manual_fader();
        fader.fade_to(1, 100, Duration::from_millis(100));
        fader.fade_to(2, 200, Duration::from_millis(200));
        fader.tick();

        assert_eq!(fader.buffer().get_value(1), 100);
        assert!(fader.is_fading(2));
    }

    #[test]
    fn cancelled_fade_keeps_last_value() {
        let fader = manual_fader();
        fader.fade_to(7, 250, Duration::from_millis(500));
        let value = fader.buffer().get_value(7);
        fader.cancel_addresses(&[7]);
        fader.tick();
        assert_eq!(fader.buffer().get_value(7), value);
    }

    #[test]
    fn scheduled_actions_run_when_due() {
        let fader = manual_fader();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        fader.schedule(Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        fader.schedule(Duration::from_secs(60), || {});

        fader.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(fader.pending_actions(), 1);
    }

    #[test]
    fn ticker_thread_completes_fades() {
        let fader = Fader::spawn(
            Arc::new(DmxBuffer::new()),
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
        .unwrap();
        fader.fade_to(9, 255, Duration::from_millis(20));

        let deadline = Instant::now() + Duration::from_secs(2);
        while fader.is_fading(9) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fader.buffer().get_value(9), 255);
        fader.shutdown().unwrap();
    }
}
